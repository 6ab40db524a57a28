//! # Device configuration.
//!
//! [`Properties`] is the typed key/value store a device reads its identity,
//! rate, timeouts and channel declarations from, and writes canonicalized
//! channel addresses back into. It is safe to share across tasks; peers in the
//! same process may watch keys they care about by polling (the connect retry
//! loop does exactly that).
//!
//! [`DeviceDefaults`] collects the fallback values used when a key is absent.
//!
//! # Example
//! ```
//! use devisor::Properties;
//!
//! let props = Properties::new();
//! props.set("id", "sampler-1");
//! props.set("rate", 25.0);
//! props.set("chans.data.0.address", "tcp://*:5555");
//! props.set("chans.data.0.method", "bind");
//!
//! assert_eq!(props.get::<String>("id").as_deref(), Some("sampler-1"));
//! assert_eq!(props.get_or("rate", 0.0_f64), 25.0);
//! assert_eq!(props.channel_info().get("data"), Some(&1));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::transport::TransportKind;

/// A single configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(v) => write!(f, "{v}"),
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Uint(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v.into())
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::Uint(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

/// Conversion out of a [`PropertyValue`].
///
/// Numeric variants convert leniently into one another, so a key set as
/// `42i64` still reads as `f64` or `u64`. Strings parse on demand.
pub trait FromProperty: Sized {
    fn from_property(value: &PropertyValue) -> Option<Self>;
}

impl FromProperty for String {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        Some(value.to_string())
    }
}

impl FromProperty for i64 {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Int(v) => Some(*v),
            PropertyValue::Uint(v) => i64::try_from(*v).ok(),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl FromProperty for u64 {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Uint(v) => Some(*v),
            PropertyValue::Int(v) => u64::try_from(*v).ok(),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl FromProperty for u32 {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        u64::from_property(value).and_then(|v| u32::try_from(v).ok())
    }
}

impl FromProperty for f64 {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Int(v) => Some(*v as f64),
            PropertyValue::Uint(v) => Some(*v as f64),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl FromProperty for bool {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Bool(v) => Some(*v),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Concurrent typed property store.
///
/// Cheap to clone; all clones share the same map. Channel declarations follow
/// the `chans.<name>.<index>.<field>` convention.
#[derive(Clone, Default)]
pub struct Properties {
    inner: Arc<DashMap<String, PropertyValue>>,
}

impl Properties {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.inner.insert(key.into(), value.into());
    }

    /// Reads `key` as `T`; `None` if absent or not convertible.
    pub fn get<T: FromProperty>(&self, key: &str) -> Option<T> {
        self.inner.get(key).and_then(|v| T::from_property(&v))
    }

    /// Reads `key` as `T`, falling back to `default`.
    pub fn get_or<T: FromProperty>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Enumerates channel declarations: for every `chans.<name>.<index>.`
    /// key, reports `name -> number of declared sub-channels`.
    pub fn channel_info(&self) -> HashMap<String, usize> {
        let mut info: HashMap<String, usize> = HashMap::new();
        for entry in self.inner.iter() {
            let Some(rest) = entry.key().strip_prefix("chans.") else {
                continue;
            };
            let mut parts = rest.splitn(3, '.');
            let (Some(name), Some(index), Some(_field)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(index) = index.parse::<usize>() else {
                continue;
            };
            let count = info.entry(name.to_string()).or_insert(0);
            *count = (*count).max(index + 1);
        }
        info
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Properties")
            .field("len", &self.inner.len())
            .finish()
    }
}

/// Fallback values applied when the corresponding keys are absent.
#[derive(Clone, Debug)]
pub struct DeviceDefaults {
    /// Device id (`id`).
    pub id: String,
    /// Transport I/O threads (`io-threads`); consumed by transports that pool.
    pub io_threads: u32,
    /// Default transport name (`transport`).
    pub transport_name: String,
    /// Default transport kind, matching `transport_name`.
    pub transport_kind: TransportKind,
    /// Network interface for unspecified bind addresses (`network-interface`);
    /// `default` means "use the default route".
    pub network_interface: String,
    /// Channel attach timeout (`init-timeout`).
    pub init_timeout: Duration,
    /// User-loop frequency in Hz (`rate`).
    pub rate: f64,
    /// Session name shared by communicating devices (`session`).
    pub session: String,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            id: String::new(),
            io_threads: 1,
            transport_name: "memory".to_string(),
            transport_kind: TransportKind::Memory,
            network_interface: "default".to_string(),
            init_timeout: Duration::from_secs(120),
            rate: 0.0,
            session: "default".to_string(),
        }
    }
}
