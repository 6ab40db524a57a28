//! # Transport registry: one factory per kind per device lifetime.
//!
//! The registry owns the transport factory handles and serializes every
//! lookup, insert, interrupt, resume and reset behind one mutex. Factories
//! are created lazily on first request through the device's
//! [`TransportProvider`] and live until the device resets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::Properties;
use crate::error::TransportError;
use crate::transport::{TransportFactory, TransportKind, TransportProvider};

/// Shared, mutex-guarded map from transport kind to factory.
#[derive(Clone)]
pub struct TransportRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    provider: Box<dyn TransportProvider>,
    factories: Mutex<HashMap<TransportKind, Arc<dyn TransportFactory>>>,
}

impl TransportRegistry {
    pub fn new(provider: Box<dyn TransportProvider>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                provider,
                factories: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the factory for `kind`, creating it on first request.
    ///
    /// `TransportKind::Default` resolves to `default_kind` before lookup, so
    /// the default and its named kind share one factory.
    pub fn add_transport(
        &self,
        kind: TransportKind,
        default_kind: TransportKind,
        device_id: &str,
        config: &Properties,
    ) -> Result<Arc<dyn TransportFactory>, TransportError> {
        let kind = match kind {
            TransportKind::Default => default_kind,
            other => other,
        };

        let mut factories = self.inner.factories.lock().expect("transport registry");
        if let Some(existing) = factories.get(&kind) {
            debug!(transport = %kind, "reusing existing transport");
            return Ok(Arc::clone(existing));
        }

        debug!(transport = %kind, "adding transport");
        let factory = self.inner.provider.create(kind, device_id, config)?;
        factories.insert(kind, Arc::clone(&factory));
        Ok(factory)
    }

    /// Aborts blocking operations on every registered transport.
    pub fn interrupt_all(&self) {
        let factories = self.inner.factories.lock().expect("transport registry");
        for factory in factories.values() {
            factory.interrupt();
        }
    }

    /// Clears a previous interrupt on every registered transport.
    pub fn resume_all(&self) {
        let factories = self.inner.factories.lock().expect("transport registry");
        for factory in factories.values() {
            factory.resume();
        }
    }

    /// Resets every registered transport, then forgets them all.
    pub fn reset_all(&self) {
        let mut factories = self.inner.factories.lock().expect("transport registry");
        for factory in factories.values() {
            factory.reset();
        }
        factories.clear();
    }

    /// Number of live factories.
    pub fn len(&self) -> usize {
        self.inner.factories.lock().expect("transport registry").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
