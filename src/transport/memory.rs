//! # In-process transport.
//!
//! Endpoints are names in a process-wide route table. A bind creates the
//! route (two unbounded FIFO queues, one per direction); connects attach to
//! it. Several connectors on one route compete for messages, which gives the
//! usual push/pull fan-in and fan-out semantics. Within one route each
//! direction is strictly FIFO.
//!
//! Binding an endpoint whose port is `0` or `1` substitutes a process-unique
//! port, mirroring "any free port" renegotiation; the substituted endpoint is
//! what [`Socket::bind`] returns.
//!
//! `interrupt()` cancels the factory token, aborting in-flight `recv`/`poll`;
//! `resume()` arms a fresh token. `reset()` unregisters every endpoint this
//! factory bound and closes its queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelCounters;
use crate::error::TransportError;
use crate::transport::{
    Message, Parts, Poller, PollerEntry, Socket, TransportFactory, TransportKind,
};

/// Process-wide route table shared by all memory factories.
fn routes() -> &'static DashMap<String, Route> {
    static ROUTES: OnceLock<DashMap<String, Route>> = OnceLock::new();
    ROUTES.get_or_init(DashMap::new)
}

/// Source of substituted ports for "any free port" binds.
static NEXT_PORT: AtomicU64 = AtomicU64::new(49152);

#[derive(Clone)]
struct Route {
    /// connectors -> binder
    inbound: Arc<MsgQueue>,
    /// binder -> connectors
    outbound: Arc<MsgQueue>,
}

/// Unbounded FIFO with async pop and close semantics.
struct MsgQueue {
    items: Mutex<VecDeque<Parts>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MsgQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn push(&self, parts: Parts) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.items.lock().expect("queue lock").push_back(parts);
        self.notify.notify_one();
        Ok(())
    }

    fn try_pop(&self) -> Option<Parts> {
        self.items.lock().expect("queue lock").pop_front()
    }

    fn is_empty(&self) -> bool {
        self.items.lock().expect("queue lock").is_empty()
    }

    async fn pop(&self, token: &CancellationToken) -> Result<Parts, TransportError> {
        loop {
            // register interest before re-checking, so a push between the
            // check and the await cannot be lost
            let notified = self.notify.notified();
            if let Some(parts) = self.try_pop() {
                return Ok(parts);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            tokio::select! {
                _ = notified => {}
                _ = token.cancelled() => return Err(TransportError::Interrupted),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct FactoryShared {
    /// Current interrupt token; replaced on resume.
    token: Mutex<CancellationToken>,
    /// Endpoints bound through this factory, for reset-time cleanup.
    bound: Mutex<Vec<String>>,
}

impl FactoryShared {
    fn current_token(&self) -> CancellationToken {
        self.token.lock().expect("token lock").clone()
    }
}

/// In-process transport factory.
pub struct MemoryTransport {
    shared: Arc<FactoryShared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FactoryShared {
                token: Mutex::new(CancellationToken::new()),
                bound: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn create_socket(
        &self,
        counters: Arc<ChannelCounters>,
    ) -> Result<Arc<dyn Socket>, TransportError> {
        Ok(Arc::new(MemorySocket {
            shared: Arc::clone(&self.shared),
            counters,
            recv_queues: Mutex::new(Vec::new()),
            send_queues: Mutex::new(Vec::new()),
            send_cursor: AtomicUsize::new(0),
        }))
    }

    fn create_poller(&self, entries: Vec<PollerEntry>) -> Result<Box<dyn Poller>, TransportError> {
        Ok(Box::new(MemoryPoller {
            shared: Arc::clone(&self.shared),
            entries,
            ready: Vec::new(),
        }))
    }

    fn interrupt(&self) {
        self.shared.token.lock().expect("token lock").cancel();
    }

    fn resume(&self) {
        *self.shared.token.lock().expect("token lock") = CancellationToken::new();
    }

    fn reset(&self) {
        let endpoints: Vec<String> = self.shared.bound.lock().expect("bound lock").drain(..).collect();
        for endpoint in endpoints {
            if let Some((_, route)) = routes().remove(&endpoint) {
                route.inbound.close();
                route.outbound.close();
            }
        }
    }
}

/// Replaces a trailing `:0` or `:1` port with a process-unique one.
fn substitute_any_port(endpoint: &str) -> String {
    if let Some((base, port)) = endpoint.rsplit_once(':') {
        if matches!(port, "0" | "1") {
            let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
            return format!("{base}:{port}");
        }
    }
    endpoint.to_string()
}

struct MemorySocket {
    shared: Arc<FactoryShared>,
    counters: Arc<ChannelCounters>,
    recv_queues: Mutex<Vec<Arc<MsgQueue>>>,
    send_queues: Mutex<Vec<Arc<MsgQueue>>>,
    send_cursor: AtomicUsize,
}

impl MemorySocket {
    fn recv_sources(&self) -> Vec<Arc<MsgQueue>> {
        self.recv_queues.lock().expect("recv lock").clone()
    }

    fn next_sink(&self) -> Result<Arc<MsgQueue>, TransportError> {
        let sinks = self.send_queues.lock().expect("send lock");
        if sinks.is_empty() {
            return Err(TransportError::Failed {
                reason: "socket not attached".to_string(),
            });
        }
        let i = self.send_cursor.fetch_add(1, Ordering::Relaxed) % sinks.len();
        Ok(Arc::clone(&sinks[i]))
    }

    async fn pop_any(&self) -> Result<Parts, TransportError> {
        let token = self.shared.current_token();
        let sources = self.recv_sources();
        match sources.len() {
            0 => Err(TransportError::Failed {
                reason: "socket not attached".to_string(),
            }),
            1 => sources[0].pop(&token).await,
            // several attached endpoints: scan with a short wait fallback
            _ => loop {
                for q in &sources {
                    if let Some(parts) = q.try_pop() {
                        return Ok(parts);
                    }
                }
                if sources.iter().all(|q| q.closed.load(Ordering::Acquire)) {
                    return Err(TransportError::Closed);
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                    _ = token.cancelled() => return Err(TransportError::Interrupted),
                }
            },
        }
    }

    fn record_out(&self, parts: &Parts) {
        let bytes: usize = parts.iter().map(Message::len).sum();
        self.counters.add_out(bytes as u64, 1);
    }

    fn record_in(&self, parts: &Parts) {
        let bytes: usize = parts.iter().map(Message::len).sum();
        self.counters.add_in(bytes as u64, 1);
    }
}

#[async_trait]
impl Socket for MemorySocket {
    async fn bind(&self, endpoint: &str) -> Result<String, TransportError> {
        let actual = substitute_any_port(endpoint);

        let route = Route {
            inbound: MsgQueue::new(),
            outbound: MsgQueue::new(),
        };
        use dashmap::mapref::entry::Entry;
        match routes().entry(actual.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::AddressInUse { endpoint: actual });
            }
            Entry::Vacant(slot) => {
                slot.insert(route.clone());
            }
        }

        self.recv_queues
            .lock()
            .expect("recv lock")
            .push(Arc::clone(&route.inbound));
        self.send_queues
            .lock()
            .expect("send lock")
            .push(Arc::clone(&route.outbound));
        self.shared
            .bound
            .lock()
            .expect("bound lock")
            .push(actual.clone());
        Ok(actual)
    }

    async fn connect(&self, endpoint: &str) -> Result<(), TransportError> {
        let route = routes()
            .get(endpoint)
            .map(|r| r.clone())
            .ok_or_else(|| TransportError::NotFound {
                endpoint: endpoint.to_string(),
            })?;

        self.recv_queues
            .lock()
            .expect("recv lock")
            .push(Arc::clone(&route.outbound));
        self.send_queues
            .lock()
            .expect("send lock")
            .push(Arc::clone(&route.inbound));
        Ok(())
    }

    async fn send(&self, msg: Message) -> Result<(), TransportError> {
        self.send_parts(vec![msg]).await
    }

    async fn send_parts(&self, parts: Parts) -> Result<(), TransportError> {
        let sink = self.next_sink()?;
        self.record_out(&parts);
        sink.push(parts)
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut parts = self.pop_any().await?;
        self.record_in(&parts);
        match parts.len() {
            1 => Ok(parts.remove(0)),
            n => Err(TransportError::Failed {
                reason: format!("received {n}-part message on a single-part receive"),
            }),
        }
    }

    async fn recv_parts(&self) -> Result<Parts, TransportError> {
        let parts = self.pop_any().await?;
        self.record_in(&parts);
        Ok(parts)
    }

    fn has_input(&self) -> bool {
        self.recv_sources().iter().any(|q| !q.is_empty())
    }
}

/// Readiness poller over memory sockets.
///
/// Scans entry readiness every few milliseconds until something is ready,
/// the timeout elapses, or the factory is interrupted.
struct MemoryPoller {
    shared: Arc<FactoryShared>,
    entries: Vec<PollerEntry>,
    ready: Vec<bool>,
}

impl MemoryPoller {
    fn snapshot(&mut self) -> bool {
        self.ready = self.entries.iter().map(|e| e.socket.has_input()).collect();
        self.ready.iter().any(|r| *r)
    }
}

#[async_trait]
impl Poller for MemoryPoller {
    async fn poll(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let token = self.shared.current_token();
        let deadline = Instant::now() + timeout;
        loop {
            if self.snapshot() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(2)) => {}
                _ = token.cancelled() => return Ok(()),
            }
        }
    }

    fn check_input(&self, key: &str, index: usize) -> bool {
        self.entries
            .iter()
            .zip(&self.ready)
            .any(|(e, ready)| *ready && e.key == key && e.index == index)
    }
}
