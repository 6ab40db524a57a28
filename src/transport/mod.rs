//! # Transport capability traits.
//!
//! The runtime core does not implement networking. It consumes transports
//! through three seams:
//!
//! - [`TransportFactory`]: one shared instance per transport kind per device;
//!   creates sockets and pollers and broadcasts `interrupt`/`resume`/`reset`.
//! - [`Socket`]: one per sub-channel; binds or connects endpoints and moves
//!   opaque [`Message`] buffers.
//! - [`Poller`]: readiness multiplexer over a set of sub-channel sockets.
//!
//! Factories are obtained through a [`TransportProvider`], the capability a
//! device is constructed with. The built-in provider only knows the
//! in-process [`MemoryTransport`](memory::MemoryTransport); plugging real
//! transports means supplying a provider that recognizes more kinds.
//!
//! Blocking operations (`recv`, `poll`) must abort with
//! [`TransportError::Interrupted`] when the factory's `interrupt()` fires;
//! that is what lets state handlers observe a pending transition promptly.

pub mod memory;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::channel::ChannelCounters;
use crate::config::Properties;
use crate::error::TransportError;

/// Transport kind selector.
///
/// `Default` resolves to the device's configured default at registry level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Default,
    /// In-process queues; the only kind the built-in provider creates.
    Memory,
    /// TCP via a message-queue library; external provider required.
    Zmq,
    /// Shared memory; external provider required.
    Shm,
}

impl TransportKind {
    /// Canonical configuration name.
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Default => "default",
            TransportKind::Memory => "memory",
            TransportKind::Zmq => "zeromq",
            TransportKind::Shm => "shmem",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(TransportKind::Default),
            "memory" | "inproc" => Ok(TransportKind::Memory),
            "zeromq" | "zmq" => Ok(TransportKind::Zmq),
            "shmem" | "shm" => Ok(TransportKind::Shm),
            other => Err(TransportError::Unsupported {
                kind: other.to_string(),
            }),
        }
    }
}

/// An opaque message buffer.
///
/// Payloads are [`Bytes`], so cloning a message never copies the data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl From<Bytes> for Message {
    fn from(payload: Bytes) -> Self {
        Self { payload }
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// A multipart message: one or more parts delivered atomically.
pub type Parts = Vec<Message>;

/// One sub-channel entry handed to [`TransportFactory::create_poller`].
#[derive(Clone)]
pub struct PollerEntry {
    /// Channel name the sub-channel belongs to.
    pub key: String,
    /// Sub-channel index within the channel.
    pub index: usize,
    /// The sub-channel's socket.
    pub socket: Arc<dyn Socket>,
}

/// Shared factory for one transport kind.
///
/// Exactly one instance exists per kind per device lifetime; all of the
/// kind's sockets and pollers come from it, and `interrupt`/`resume`/`reset`
/// fan out to everything it created.
pub trait TransportFactory: Send + Sync {
    /// The kind this factory serves.
    fn kind(&self) -> TransportKind;

    /// Creates an unattached socket. The socket publishes its traffic into
    /// `counters` (bytes and messages, both directions).
    fn create_socket(
        &self,
        counters: Arc<ChannelCounters>,
    ) -> Result<Arc<dyn Socket>, TransportError>;

    /// Creates a poller over the given sub-channel sockets.
    fn create_poller(
        &self,
        entries: Vec<PollerEntry>,
    ) -> Result<Box<dyn Poller>, TransportError>;

    /// Aborts in-flight blocking operations on all sockets of this factory.
    fn interrupt(&self);

    /// Clears a previous [`interrupt`](TransportFactory::interrupt) so new
    /// blocking operations block again.
    fn resume(&self);

    /// Releases every endpoint and socket the factory created.
    fn reset(&self);
}

/// A bound or connected message endpoint.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Binds `endpoint`, returning the endpoint actually bound. Transports
    /// may substitute parts of the address (an "any free port" request comes
    /// back concrete).
    async fn bind(&self, endpoint: &str) -> Result<String, TransportError>;

    /// Connects to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<(), TransportError>;

    /// Sends a single-part message.
    async fn send(&self, msg: Message) -> Result<(), TransportError>;

    /// Sends a multipart message atomically.
    async fn send_parts(&self, parts: Parts) -> Result<(), TransportError>;

    /// Receives a single-part message. Blocks until a message arrives, the
    /// factory is interrupted, or the peer closes.
    async fn recv(&self) -> Result<Message, TransportError>;

    /// Receives a multipart message.
    async fn recv_parts(&self) -> Result<Parts, TransportError>;

    /// Whether input is ready to be received without blocking.
    fn has_input(&self) -> bool;
}

/// Readiness multiplexer over sub-channel sockets.
#[async_trait]
pub trait Poller: Send {
    /// Waits until at least one entry has input or `timeout` elapses.
    /// A transport interrupt ends the wait early (without error).
    async fn poll(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Whether the entry `(key, index)` had input at the last
    /// [`poll`](Poller::poll) wakeup.
    fn check_input(&self, key: &str, index: usize) -> bool;
}

/// Capability through which a device obtains transport factories.
pub trait TransportProvider: Send + Sync {
    /// Creates the factory for `kind`. Called at most once per kind per
    /// device lifetime; the registry caches the result.
    fn create(
        &self,
        kind: TransportKind,
        device_id: &str,
        config: &Properties,
    ) -> Result<Arc<dyn TransportFactory>, TransportError>;
}

/// Default provider: serves [`TransportKind::Memory`] only.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportProvider;

impl TransportProvider for DefaultTransportProvider {
    fn create(
        &self,
        kind: TransportKind,
        _device_id: &str,
        _config: &Properties,
    ) -> Result<Arc<dyn TransportFactory>, TransportError> {
        match kind {
            TransportKind::Memory => Ok(Arc::new(memory::MemoryTransport::new())),
            other => Err(TransportError::Unsupported {
                kind: other.name().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            TransportKind::Default,
            TransportKind::Memory,
            TransportKind::Zmq,
            TransportKind::Shm,
        ] {
            assert_eq!(kind.name().parse::<TransportKind>().unwrap(), kind);
        }
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn default_provider_serves_memory_only() {
        let provider = DefaultTransportProvider;
        let config = Properties::new();
        assert!(provider
            .create(TransportKind::Memory, "dev", &config)
            .is_ok());
        assert!(matches!(
            provider.create(TransportKind::Zmq, "dev", &config),
            Err(TransportError::Unsupported { .. })
        ));
    }
}
