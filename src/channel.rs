//! # Channels: named endpoint bundles.
//!
//! A logical channel (`data`) fans out into an ordered list of sub-channels
//! (`data[0]`, `data[1]`, …), each declared in the configuration under
//! `chans.<name>.<index>.*` and individually bound or connected to one or
//! more endpoints.
//!
//! The address grammar is `[modifier]scheme://authority`, comma-separated:
//! a leading `@` forces bind, `+` or `>` force connect, overriding the
//! sub-channel's `method` for that endpoint only. For `tcp://host:port`
//! endpoints, any host other than the wildcard `*` is DNS-resolved before the
//! transport sees it.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::lookup_host;

use crate::config::Properties;
use crate::error::{DeviceError, TransportError};
use crate::transport::{Message, Parts, Socket, TransportFactory, TransportKind};

/// How a sub-channel attaches its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Bind,
    Connect,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Bind => f.write_str("bind"),
            Method::Connect => f.write_str("connect"),
        }
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bind" => Ok(Method::Bind),
            "connect" => Ok(Method::Connect),
            other => Err(format!("unknown channel method '{other}'")),
        }
    }
}

/// Live traffic counters, shared between a channel and its socket.
///
/// Monotonic; the transport publishes, the rate logger consumes.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    bytes_in: AtomicU64,
    messages_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_out: AtomicU64,
}

impl ChannelCounters {
    pub fn add_in(&self, bytes: u64, messages: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        self.messages_in.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn add_out(&self, bytes: u64, messages: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
        self.messages_out.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn messages_in(&self) -> u64 {
        self.messages_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn messages_out(&self) -> u64 {
        self.messages_out.load(Ordering::Relaxed)
    }
}

/// A single sub-channel: one endpoint bundle on one transport.
pub struct Channel {
    name: String,
    prefix: String,
    index: usize,
    method: Option<Method>,
    address: String,
    sock_type: String,
    transport: TransportKind,
    rate_logging: u32,
    /// Set by the run engine from the registered callback kind.
    pub(crate) multipart: bool,
    counters: Arc<ChannelCounters>,
    socket: Option<Arc<dyn Socket>>,
    factory: Option<Arc<dyn TransportFactory>>,
}

impl Channel {
    /// Builds a sub-channel from its `chans.<prefix>.<index>.*` declaration.
    pub fn from_properties(prefix: &str, index: usize, config: &Properties) -> Result<Self, DeviceError> {
        let key = |field: &str| format!("chans.{prefix}.{index}.{field}");

        let method = match config.get::<String>(&key("method")) {
            Some(m) => Some(m.parse::<Method>().map_err(DeviceError::config)?),
            None => None,
        };
        let transport = match config.get::<String>(&key("transport")) {
            Some(t) => t
                .parse::<TransportKind>()
                .map_err(|e| DeviceError::config(e.to_string()))?,
            None => TransportKind::Default,
        };

        Ok(Self {
            name: format!("{prefix}[{index}]"),
            prefix: prefix.to_string(),
            index,
            method,
            address: config.get_or(&key("address"), String::new()),
            sock_type: config.get_or(&key("type"), "unspecified".to_string()),
            transport,
            rate_logging: config.get_or(&key("rateLogging"), 1_u32),
            multipart: false,
            counters: Arc::new(ChannelCounters::default()),
            socket: None,
            factory: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn sock_type(&self) -> &str {
        &self.sock_type
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn rate_logging(&self) -> u32 {
        self.rate_logging
    }

    pub fn counters(&self) -> &Arc<ChannelCounters> {
        &self.counters
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    pub(crate) fn set_transport(&mut self, transport: TransportKind) {
        self.transport = transport;
    }

    /// Replaces the address, e.g. after a peer published its bound endpoint.
    pub fn update_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
    }

    /// Whether the mandatory fields are populated for attaching.
    pub fn validate(&self) -> bool {
        self.method.is_some() && !self.address.is_empty() && self.transport != TransportKind::Default
    }

    /// Creates the transport-level socket. Idempotent per lifecycle round.
    pub fn init(&mut self, factory: Arc<dyn TransportFactory>) -> Result<(), TransportError> {
        let socket = factory.create_socket(Arc::clone(&self.counters))?;
        self.socket = Some(socket);
        self.factory = Some(factory);
        Ok(())
    }

    /// The socket, if [`init`](Channel::init) has run.
    pub fn socket(&self) -> Option<Arc<dyn Socket>> {
        self.socket.clone()
    }

    pub(crate) fn factory(&self) -> Option<Arc<dyn TransportFactory>> {
        self.factory.clone()
    }

    pub(crate) fn release(&mut self) {
        self.socket = None;
        self.factory = None;
    }

    fn attached(&self) -> Result<&Arc<dyn Socket>, TransportError> {
        self.socket.as_ref().ok_or(TransportError::Failed {
            reason: format!("channel {} has no socket", self.name),
        })
    }

    pub async fn send(&self, msg: Message) -> Result<(), TransportError> {
        self.attached()?.send(msg).await
    }

    pub async fn send_parts(&self, parts: Parts) -> Result<(), TransportError> {
        self.attached()?.send_parts(parts).await
    }

    pub async fn recv(&self) -> Result<Message, TransportError> {
        self.attached()?.recv().await
    }

    pub async fn recv_parts(&self) -> Result<Parts, TransportError> {
        self.attached()?.recv_parts().await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("address", &self.address)
            .field("type", &self.sock_type)
            .field("transport", &self.transport)
            .field("rate_logging", &self.rate_logging)
            .finish()
    }
}

/// Splits a comma-separated endpoint list.
pub(crate) fn split_endpoints(address: &str) -> Vec<String> {
    address
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Strips a leading method modifier: `@` forces bind, `+`/`>` force connect.
pub(crate) fn parse_override(endpoint: &str) -> (Option<Method>, &str) {
    match endpoint.as_bytes().first() {
        Some(b'@') => (Some(Method::Bind), &endpoint[1..]),
        Some(b'+') | Some(b'>') => (Some(Method::Connect), &endpoint[1..]),
        _ => (None, endpoint),
    }
}

/// Whether the endpoint list carries any method modifier.
pub(crate) fn has_override(address: &str) -> bool {
    split_endpoints(address)
        .iter()
        .any(|e| parse_override(e).0.is_some())
}

/// Resolves the host of a `tcp://host:port` endpoint to an IP.
///
/// Wildcard-host binds are left alone. Returns `None` when resolution fails,
/// which callers treat as a retryable attach failure.
pub(crate) async fn resolve_tcp_endpoint(address: &str, bind: bool) -> Option<String> {
    let Some(authority) = address.strip_prefix("tcp://") else {
        return Some(address.to_string());
    };
    let (host, port) = authority.rsplit_once(':')?;
    if bind && host == "*" {
        return Some(address.to_string());
    }

    // DNS resolution wants a numeric port; the actual value is irrelevant
    let probe_port: u16 = port.parse().unwrap_or(1);
    let addrs: Vec<_> = lookup_host((host, probe_port)).await.ok()?.collect();
    let ip = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())?
        .ip();
    if ip.is_ipv6() {
        Some(format!("tcp://[{ip}]:{port}"))
    } else {
        Some(format!("tcp://{ip}:{port}"))
    }
}
