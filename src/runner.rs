//! # The run engine: everything that happens inside the `Running` state.
//!
//! On entry the engine spawns the throughput logger (if any channel asks for
//! it), runs the user `pre_run` hook, and dispatches on the data-handling
//! mode:
//!
//! - **User loop** (no callbacks registered): `conditional_run` repeats under
//!   the rate limiter until it returns `false` or a transition is pending,
//!   then the legacy single-shot `run` hook fires once.
//! - **Callback dispatch** (per-channel callbacks registered):
//!   - one input channel with one sub-channel: receive directly, no poller;
//!   - several inputs on one transport: one poller, 200 ms deadline;
//!   - inputs across transports: one worker task per transport kind, each
//!     with its own poller at 500 ms, all gated by a shared proceed flag.
//!
//! On the way out: request `Stop` unless something newer is pending, run
//! `post_run`, join the logger. A failure anywhere requests `ErrorFound`
//! first, so the logger (which exits on the pending signal) never blocks the
//! teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::device::Device;
use crate::error::DeviceError;
use crate::hooks::{InputHandler, MessageHandler, MultipartHandler};
use crate::machine::StateMachine;
use crate::rate::{RateLimiter, RateLogger};
use crate::state::Transition;
use crate::transport::{PollerEntry, Socket, TransportFactory, TransportKind};

/// Poll deadline when all inputs share one transport.
const SINGLE_TRANSPORT_POLL: Duration = Duration::from_millis(200);
/// Poll deadline inside each per-transport worker.
const MULTI_TRANSPORT_POLL: Duration = Duration::from_millis(500);

/// One input sub-channel as seen by the dispatch loops.
struct DispatchEntry {
    key: String,
    index: usize,
    socket: Arc<dyn Socket>,
}

impl Device {
    pub(crate) async fn run_wrapper(&mut self) -> Result<(), DeviceError> {
        info!(id = %self.ctx.id(), "device running");

        let rate_logger = RateLogger::from_channels(self.ctx.channels())
            .map(|logger| tokio::spawn(logger.run(self.machine.clone())));

        let result = self.run_inner().await;

        if result.is_err() {
            // unblocks the logger and anything else watching the pending
            // signal; the driver publishes Error after we return
            let _ = self.machine.change_state(Transition::ErrorFound);
        }
        if let Some(handle) = rate_logger {
            let _ = handle.await;
        }

        result
    }

    async fn run_inner(&mut self) -> Result<(), DeviceError> {
        self.hooks.pre_run(&mut self.ctx).await?;

        if self.inputs.is_empty() {
            let mut limiter = RateLimiter::new(self.ctx.rate());
            loop {
                if self.machine.new_state_pending() {
                    break;
                }
                if !self.hooks.conditional_run(&mut self.ctx).await? {
                    break;
                }
                if self.ctx.rate() > 0.001 {
                    limiter.maybe_sleep().await;
                }
            }

            // legacy single-shot entry point
            self.hooks.run(&mut self.ctx).await?;
        } else {
            self.dispatch_inputs().await?;
        }

        if !self.machine.new_state_pending() {
            self.machine.change_state(Transition::Stop)?;
        }

        self.hooks.post_run(&mut self.ctx).await?;
        Ok(())
    }

    // ---- callback dispatch ----

    async fn dispatch_inputs(&mut self) -> Result<(), DeviceError> {
        for key in &self.input_keys {
            if self.ctx.channel(key).is_none() {
                return Err(DeviceError::config(format!(
                    "data callback registered for undeclared channel '{key}'"
                )));
            }
        }

        // channels learn their framing from the registered callback kind
        let flags: Vec<(String, bool)> = self
            .input_keys
            .iter()
            .map(|key| (key.clone(), self.inputs[key].is_multipart()))
            .collect();
        for (key, multipart) in flags {
            let count = self.ctx.channel(&key).map(Vec::len).unwrap_or(0);
            for index in 0..count {
                if let Some(sub) = self.ctx.sub_channel_mut(&key, index) {
                    sub.multipart = multipart;
                }
            }
        }

        let single = self.input_keys.len() == 1
            && self.ctx.channel(&self.input_keys[0]).map(Vec::len) == Some(1);
        if single {
            self.handle_single_channel_input().await
        } else {
            self.handle_multiple_channel_input().await
        }
    }

    /// Fast path: one input channel, one sub-channel, no poller.
    async fn handle_single_channel_input(&mut self) -> Result<(), DeviceError> {
        let key = self.input_keys[0].clone();
        let socket = self
            .ctx
            .sub_channel(&key, 0)
            .and_then(|sub| sub.socket())
            .ok_or_else(|| DeviceError::config(format!("channel '{key}' has no socket")))?;

        let machine = self.machine.clone();
        let handler = self.inputs.get_mut(&key).expect("validated input key");

        while !machine.new_state_pending() {
            let proceed = match handler {
                InputHandler::Message(cb) => handle_msg_input(&socket, cb, 0).await?,
                InputHandler::Multipart(cb) => handle_multipart_input(&socket, cb, 0).await?,
            };
            if !proceed {
                break;
            }
        }
        Ok(())
    }

    async fn handle_multiple_channel_input(&mut self) -> Result<(), DeviceError> {
        // group input channels by the transport their sockets live on
        let mut groups: HashMap<TransportKind, Vec<String>> = HashMap::new();
        for key in &self.input_keys {
            let kind = self
                .ctx
                .sub_channel(key, 0)
                .map(|sub| sub.transport())
                .ok_or_else(|| {
                    DeviceError::config(format!("input channel '{key}' has no sub-channels"))
                })?;
            groups.entry(kind).or_default().push(key.clone());
        }

        if groups.len() > 1 {
            self.handle_multiple_transport_input(groups).await
        } else {
            self.poll_single_transport().await
        }
    }

    /// All inputs share one transport: poll them from the driver task.
    async fn poll_single_transport(&mut self) -> Result<(), DeviceError> {
        let entries = self.dispatch_entries(&self.input_keys.clone())?;
        let factory = self.dispatch_factory(&self.input_keys[0])?;
        let mut poller = factory.create_poller(
            entries
                .iter()
                .map(|e| PollerEntry {
                    key: e.key.clone(),
                    index: e.index,
                    socket: Arc::clone(&e.socket),
                })
                .collect(),
        )?;

        let machine = self.machine.clone();
        let inputs = &mut self.inputs;

        let mut proceed = true;
        while proceed && !machine.new_state_pending() {
            poller.poll(SINGLE_TRANSPORT_POLL).await?;

            // the pending signal is re-checked per wakeup, not between the
            // sub-channels of one wakeup; a very late stop request waits for
            // the next poll round
            for entry in &entries {
                if !poller.check_input(&entry.key, entry.index) {
                    continue;
                }
                let handler = inputs.get_mut(&entry.key).expect("validated input key");
                proceed = match handler {
                    InputHandler::Message(cb) => {
                        handle_msg_input(&entry.socket, cb, entry.index).await?
                    }
                    InputHandler::Multipart(cb) => {
                        handle_multipart_input(&entry.socket, cb, entry.index).await?
                    }
                };
                if !proceed {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Inputs span several transports: one worker per kind, each with its own
    /// poller, all gated by a shared proceed flag.
    async fn handle_multiple_transport_input(
        &mut self,
        groups: HashMap<TransportKind, Vec<String>>,
    ) -> Result<(), DeviceError> {
        let proceed = Arc::new(Mutex::new(true));
        let mut workers: JoinSet<(HashMap<String, InputHandler>, Result<(), DeviceError>)> =
            JoinSet::new();

        for (_kind, keys) in groups {
            let entries = self.dispatch_entries(&keys)?;
            let factory = self.dispatch_factory(&keys[0])?;
            let handlers: HashMap<String, InputHandler> = keys
                .iter()
                .filter_map(|key| self.inputs.remove_entry(key))
                .collect();

            let machine = self.machine.clone();
            let proceed = Arc::clone(&proceed);
            workers.spawn(poll_for_transport(factory, entries, handlers, machine, proceed));
        }

        let mut failure: Option<DeviceError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((handlers, result)) => {
                    // callbacks survive for the next Running round
                    self.inputs.extend(handlers);
                    if let Err(e) = result {
                        failure.get_or_insert(e);
                    }
                }
                Err(join_error) => {
                    failure.get_or_insert(DeviceError::Worker {
                        reason: join_error.to_string(),
                    });
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dispatch_entries(&self, keys: &[String]) -> Result<Vec<DispatchEntry>, DeviceError> {
        let mut entries = Vec::new();
        for key in keys {
            let subs = self
                .ctx
                .channel(key)
                .ok_or_else(|| DeviceError::config(format!("unknown channel '{key}'")))?;
            for sub in subs {
                let socket = sub.socket().ok_or_else(|| {
                    DeviceError::config(format!("channel '{}' has no socket", sub.name()))
                })?;
                entries.push(DispatchEntry {
                    key: key.clone(),
                    index: sub.index(),
                    socket,
                });
            }
        }
        Ok(entries)
    }

    fn dispatch_factory(&self, key: &str) -> Result<Arc<dyn TransportFactory>, DeviceError> {
        self.ctx
            .sub_channel(key, 0)
            .and_then(|sub| sub.factory())
            .ok_or_else(|| DeviceError::config(format!("channel '{key}' has no transport")))
    }
}

/// One per-transport poll worker.
///
/// Owns the callbacks of its channel group for the duration of `Running` and
/// returns them so a later round can reuse them. The shared `proceed` flag is
/// read-then-conditionally-written under its lock, and the lock is held
/// across the dispatch, so callbacks never run concurrently even across
/// workers.
async fn poll_for_transport(
    factory: Arc<dyn TransportFactory>,
    entries: Vec<DispatchEntry>,
    mut handlers: HashMap<String, InputHandler>,
    machine: StateMachine,
    proceed: Arc<Mutex<bool>>,
) -> (HashMap<String, InputHandler>, Result<(), DeviceError>) {
    let poller_entries = entries
        .iter()
        .map(|e| PollerEntry {
            key: e.key.clone(),
            index: e.index,
            socket: Arc::clone(&e.socket),
        })
        .collect();
    let mut poller = match factory.create_poller(poller_entries) {
        Ok(poller) => poller,
        Err(e) => return (handlers, Err(e.into())),
    };

    'polling: loop {
        if machine.new_state_pending() || !*proceed.lock().await {
            break;
        }
        if let Err(e) = poller.poll(MULTI_TRANSPORT_POLL).await {
            error!(error = %e, "transport poll failed, going to Error state");
            return (handlers, Err(DeviceError::Worker { reason: e.to_string() }));
        }

        for entry in &entries {
            if !poller.check_input(&entry.key, entry.index) {
                continue;
            }

            let mut guard = proceed.lock().await;
            if !*guard {
                break 'polling;
            }

            let handler = handlers.get_mut(&entry.key).expect("worker owns its keys");
            let result = match handler {
                InputHandler::Message(cb) => handle_msg_input(&entry.socket, cb, entry.index).await,
                InputHandler::Multipart(cb) => {
                    handle_multipart_input(&entry.socket, cb, entry.index).await
                }
            };
            match result {
                Ok(keep_going) => {
                    *guard = keep_going;
                    if !keep_going {
                        break 'polling;
                    }
                }
                Err(e) => {
                    error!(error = %e, "input callback failed, going to Error state");
                    *guard = false;
                    return (handlers, Err(DeviceError::Worker { reason: e.to_string() }));
                }
            }
        }
    }

    (handlers, Ok(()))
}

/// Receives one message and feeds it to the callback.
///
/// Every receive uses a fresh buffer; nothing is reused across iterations.
/// A receive failure (including an interrupt) ends the dispatch loop by
/// reporting `false`; the pending-state check decides what happens next.
async fn handle_msg_input(
    socket: &Arc<dyn Socket>,
    callback: &mut MessageHandler,
    index: usize,
) -> Result<bool, DeviceError> {
    match socket.recv().await {
        Ok(msg) => callback(msg, index),
        Err(_) => Ok(false),
    }
}

/// Multipart analogue of [`handle_msg_input`].
async fn handle_multipart_input(
    socket: &Arc<dyn Socket>,
    callback: &mut MultipartHandler,
    index: usize,
) -> Result<bool, DeviceError> {
    match socket.recv_parts().await {
        Ok(parts) => callback(parts, index),
        Err(_) => Ok(false),
    }
}
