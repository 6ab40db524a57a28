//! # The lifecycle state machine.
//!
//! [`StateMachine`] keeps the current [`State`], a queue of requested
//! [`Transition`]s, and the notification plumbing around them. It is cheaply
//! cloneable; every clone shares the same machine.
//!
//! ## Publication discipline
//!
//! The driver (one task, owned by [`Device::run`](crate::Device::run))
//! dequeues a transition, advances the current state, runs the prepare hook,
//! runs the state's handler, and only then publishes the entered state: to
//! the broadcast state queue consumed by observers and to the id-keyed
//! entered-state callbacks. Handlers therefore never overlap, and observers
//! see states in entry order, after the state's work is done.
//!
//! ## The pending signal
//!
//! A transition queued while a handler runs is the sole cancellation
//! mechanism: long-running handlers poll [`new_state_pending`]
//! (or block in [`wait_for_pending_state`]) and exit cooperatively.
//! Requesting a transition also fires the new-transition callbacks, which the
//! device uses to interrupt transports so blocked I/O aborts promptly.
//!
//! [`new_state_pending`]: StateMachine::new_state_pending
//! [`wait_for_pending_state`]: StateMachine::wait_for_pending_state

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::DeviceError;
use crate::state::{State, Transition};

type TransitionCallback = Box<dyn Fn(Transition) + Send>;
type StateCallback = Box<dyn Fn(State) + Send>;
type PrepareHook = Box<dyn Fn(State) + Send>;

/// Capacity of the broadcast state queue; a slow observer lags rather than
/// blocking the driver.
const STATE_QUEUE_CAPACITY: usize = 64;

struct MachineInner {
    current: watch::Sender<State>,
    queue: Mutex<VecDeque<Transition>>,
    pending: Notify,
    states_tx: broadcast::Sender<State>,
    transition_subs: Mutex<HashMap<String, TransitionCallback>>,
    state_subs: Mutex<HashMap<String, StateCallback>>,
    prepare: Mutex<Option<PrepareHook>>,
    stopped: CancellationToken,
}

/// Shared handle to a device's lifecycle state machine.
#[derive(Clone)]
pub struct StateMachine {
    inner: Arc<MachineInner>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Creates a machine in [`State::Idle`].
    pub fn new() -> Self {
        let (current, _) = watch::channel(State::Idle);
        let (states_tx, _) = broadcast::channel(STATE_QUEUE_CAPACITY);
        Self {
            inner: Arc::new(MachineInner {
                current,
                queue: Mutex::new(VecDeque::new()),
                pending: Notify::new(),
                states_tx,
                transition_subs: Mutex::new(HashMap::new()),
                state_subs: Mutex::new(HashMap::new()),
                prepare: Mutex::new(None),
                stopped: CancellationToken::new(),
            }),
        }
    }

    /// The state the machine is currently in (or whose handler is running).
    pub fn current_state(&self) -> State {
        *self.inner.current.borrow()
    }

    /// Validates `transition` against the projected state (current state with
    /// all queued transitions applied) and enqueues it.
    ///
    /// Returns the state the transition will lead to. Firing the
    /// new-transition callbacks happens before returning, so transports are
    /// interrupted by the time the caller observes success.
    pub fn change_state(&self, transition: Transition) -> Result<State, DeviceError> {
        let next = {
            let mut queue = self.inner.queue.lock().expect("transition queue");
            let current = self.current_state();
            let projected = queue
                .iter()
                .try_fold(current, |s, t| s.apply(*t))
                .unwrap_or(current);
            let Some(next) = projected.apply(transition) else {
                return Err(DeviceError::InvalidTransition {
                    from: projected,
                    transition,
                });
            };
            queue.push_back(transition);
            next
        };

        self.inner.pending.notify_waiters();

        let subs = self.inner.transition_subs.lock().expect("transition subs");
        for callback in subs.values() {
            callback(transition);
        }
        Ok(next)
    }

    /// Whether a transition has been requested and not yet dispatched.
    pub fn new_state_pending(&self) -> bool {
        !self.inner.queue.lock().expect("transition queue").is_empty()
    }

    /// Blocks until a transition is pending (or the machine stops).
    pub async fn wait_for_pending_state(&self) {
        loop {
            let notified = self.inner.pending.notified();
            if self.new_state_pending() || self.inner.stopped.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.inner.stopped.cancelled() => return,
            }
        }
    }

    /// Waits until the machine has *entered* `target` (its handler returned).
    ///
    /// Completes immediately if the machine is already there. Errors out if
    /// the machine lands in [`State::Error`] while something else was awaited,
    /// so callers do not hang on a failed lifecycle.
    pub async fn wait_for_state(&self, target: State) -> Result<(), DeviceError> {
        let mut rx = self.subscribe_states();
        if self.current_state() == target {
            return Ok(());
        }
        loop {
            match rx.recv().await {
                Ok(state) if state == target => return Ok(()),
                Ok(State::Error) if target != State::Error => {
                    return Err(DeviceError::EnteredError {
                        waiting_for: target,
                    });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.current_state() == target {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DeviceError::EnteredError {
                        waiting_for: target,
                    });
                }
            }
        }
    }

    /// Subscribes to the ordered queue of entered states.
    pub fn subscribe_states(&self) -> broadcast::Receiver<State> {
        self.inner.states_tx.subscribe()
    }

    /// Watches the current state; updates at state entry, before the handler
    /// runs (unlike the entered-state queue, which publishes after).
    pub fn watch_current(&self) -> watch::Receiver<State> {
        self.inner.current.subscribe()
    }

    /// Registers `callback` under `id`; it fires on every accepted transition
    /// request.
    pub fn subscribe_to_transitions(
        &self,
        id: impl Into<String>,
        callback: impl Fn(Transition) + Send + 'static,
    ) {
        self.inner
            .transition_subs
            .lock()
            .expect("transition subs")
            .insert(id.into(), Box::new(callback));
    }

    pub fn unsubscribe_from_transitions(&self, id: &str) {
        self.inner
            .transition_subs
            .lock()
            .expect("transition subs")
            .remove(id);
    }

    /// Registers `callback` under `id`; it fires after each state's handler
    /// returns.
    pub fn subscribe_to_states(
        &self,
        id: impl Into<String>,
        callback: impl Fn(State) + Send + 'static,
    ) {
        self.inner
            .state_subs
            .lock()
            .expect("state subs")
            .insert(id.into(), Box::new(callback));
    }

    pub fn unsubscribe_from_states(&self, id: &str) {
        self.inner.state_subs.lock().expect("state subs").remove(id);
    }

    /// Installs the hook run before every state handler.
    pub fn set_prepare_hook(&self, hook: impl Fn(State) + Send + 'static) {
        *self.inner.prepare.lock().expect("prepare hook") = Some(Box::new(hook));
    }

    /// Makes the driver finish its current handler and exit; the machine
    /// becomes inert.
    pub fn stop_handling_states(&self) {
        self.inner.stopped.cancel();
        self.inner.pending.notify_waiters();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }

    // ---- driver side ----

    /// Dequeues the next transition; `None` once the machine is stopped.
    pub(crate) async fn next_transition(&self) -> Option<Transition> {
        loop {
            let notified = self.inner.pending.notified();
            if self.inner.stopped.is_cancelled() {
                return None;
            }
            if let Some(t) = self.inner.queue.lock().expect("transition queue").pop_front() {
                return Some(t);
            }
            tokio::select! {
                _ = notified => {}
                _ = self.inner.stopped.cancelled() => return None,
            }
        }
    }

    /// Applies `transition` to the current state.
    pub(crate) fn advance(&self, transition: Transition) -> Result<State, DeviceError> {
        let current = self.current_state();
        let next = current
            .apply(transition)
            .ok_or(DeviceError::InvalidTransition {
                from: current,
                transition,
            })?;
        self.inner.current.send_replace(next);
        Ok(next)
    }

    /// Runs the prepare hook for `state`, if one is installed.
    pub(crate) fn run_prepare(&self, state: State) {
        if let Some(hook) = self.inner.prepare.lock().expect("prepare hook").as_ref() {
            hook(state);
        }
    }

    /// Publishes an entered state to the queue and the callbacks.
    pub(crate) fn publish_entered(&self, state: State) {
        let _ = self.inner.states_tx.send(state);
        let subs = self.inner.state_subs.lock().expect("state subs");
        for callback in subs.values() {
            callback(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn rejects_illegal_transition() {
        let machine = StateMachine::new();
        let err = machine.change_state(Transition::Run).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidTransition {
                from: State::Idle,
                transition: Transition::Run,
            }
        ));
        assert_eq!(machine.current_state(), State::Idle);
        assert!(!machine.new_state_pending());
    }

    #[test]
    fn validates_against_projected_state() {
        let machine = StateMachine::new();
        machine.change_state(Transition::InitDevice).unwrap();
        // InitDevice not yet dispatched: CompleteInit is legal from the
        // projected InitializingDevice, a second InitDevice is not
        machine.change_state(Transition::CompleteInit).unwrap();
        assert!(machine.change_state(Transition::InitDevice).is_err());
    }

    #[test]
    fn transition_callbacks_fire_on_request() {
        let machine = StateMachine::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        machine.subscribe_to_transitions("device", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        machine.change_state(Transition::InitDevice).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        machine.unsubscribe_from_transitions("device");
        machine.change_state(Transition::CompleteInit).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_for_pending_state_wakes_on_request() {
        let machine = StateMachine::new();
        let waiter = machine.clone();
        let waited = tokio::spawn(async move {
            waiter.wait_for_pending_state().await;
            waiter.new_state_pending()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        machine.change_state(Transition::InitDevice).unwrap();
        assert!(waited.await.unwrap());
    }

    #[tokio::test]
    async fn driver_dequeues_in_order_and_stops() {
        let machine = StateMachine::new();
        machine.change_state(Transition::InitDevice).unwrap();
        machine.change_state(Transition::CompleteInit).unwrap();

        assert_eq!(machine.next_transition().await, Some(Transition::InitDevice));
        assert_eq!(machine.advance(Transition::InitDevice).unwrap(), State::InitializingDevice);
        assert_eq!(machine.next_transition().await, Some(Transition::CompleteInit));
        assert_eq!(machine.advance(Transition::CompleteInit).unwrap(), State::Initialized);

        machine.stop_handling_states();
        assert_eq!(machine.next_transition().await, None);
    }

    #[tokio::test]
    async fn entered_states_reach_observers_in_order() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe_states();

        machine.advance(Transition::InitDevice).unwrap();
        machine.publish_entered(State::InitializingDevice);
        machine.advance(Transition::CompleteInit).unwrap();
        machine.publish_entered(State::Initialized);

        assert_eq!(rx.recv().await.unwrap(), State::InitializingDevice);
        assert_eq!(rx.recv().await.unwrap(), State::Initialized);
    }
}
