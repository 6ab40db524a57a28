//! # Device: orchestrates the lifecycle around the state machine.
//!
//! [`Device::run`] is the driver: it dequeues transitions, advances the
//! machine, runs the wrapper for each entered state and publishes the state
//! once the wrapper returns. Wrappers do the real work (reading config and
//! building channels, attaching endpoints with DNS resolution and config
//! write-back, driving the run engine, tearing everything down) and each
//! ends by requesting `Auto` unless a newer transition is already pending.
//!
//! ## Architecture
//! ```text
//! DeviceHandle ──change_state()──► StateMachine ◄──next_transition()── Device::run
//!      │                               │ on request: interrupt transports     │
//!      │                               │ before handler: resume transports    │
//!  wait_for_state() ◄──publish────────┘                                      ▼
//!                                                            state wrapper (init/bind/
//!                                                            connect/run/reset/exit)
//! ```
//!
//! ## Rules
//! - Wrappers never overlap; everything here runs on the driver task.
//! - A wrapper error is logged, remembered, and answered with `ErrorFound`;
//!   the device then sits in `Error` until an external `End` arrives.
//! - Channel maps are mutated only by wrappers; observers go through
//!   [`DeviceHandle`] and never touch channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, trace, warn};

use crate::channel::{
    has_override, parse_override, resolve_tcp_endpoint, split_endpoints, Channel, Method,
};
use crate::config::{DeviceDefaults, Properties};
use crate::error::{DeviceError, TransportError};
use crate::hooks::{DeviceHooks, InputHandler, MessageHandler, MultipartHandler, NoopHooks};
use crate::machine::StateMachine;
use crate::registry::TransportRegistry;
use crate::state::{State, Transition};
use crate::transport::{
    DefaultTransportProvider, Message, Parts, TransportFactory, TransportKind, TransportProvider,
};

/// Cadence of the connect retry loop.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// What the lifecycle hooks see: identity, configuration and channels.
///
/// Handed to hooks as `&mut`, so channel access is mutable exactly while a
/// state handler runs; everything outside the driver observes the device
/// through [`DeviceHandle`] instead.
pub struct DeviceContext {
    id: String,
    config: Properties,
    defaults: DeviceDefaults,
    channels: HashMap<String, Vec<Channel>>,
    transports: TransportRegistry,
    default_transport: TransportKind,
    default_factory: Option<Arc<dyn TransportFactory>>,
    rate: f64,
    init_timeout: Duration,
    machine: StateMachine,
}

impl DeviceContext {
    /// The device id, as configured.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The configuration store (shared; writes are visible to peers holding
    /// the same store).
    pub fn config(&self) -> &Properties {
        &self.config
    }

    /// User-loop frequency in Hz.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// The transport kind `DEFAULT` channels resolve to.
    pub fn default_transport(&self) -> TransportKind {
        self.default_transport
    }

    /// All channels, keyed by name.
    pub fn channels(&self) -> &HashMap<String, Vec<Channel>> {
        &self.channels
    }

    /// The sub-channels of `name`.
    pub fn channel(&self, name: &str) -> Option<&Vec<Channel>> {
        self.channels.get(name)
    }

    /// One sub-channel.
    pub fn sub_channel(&self, name: &str, index: usize) -> Option<&Channel> {
        self.channels.get(name).and_then(|subs| subs.get(index))
    }

    /// Mutable access to one sub-channel; only meaningful inside hooks.
    pub fn sub_channel_mut(&mut self, name: &str, index: usize) -> Option<&mut Channel> {
        self.channels.get_mut(name).and_then(|subs| subs.get_mut(index))
    }

    /// Whether a state transition has been requested; long-running hooks must
    /// poll this and return promptly once it reports `true`.
    pub fn new_state_pending(&self) -> bool {
        self.machine.new_state_pending()
    }

    /// Sends a single-part message on `channel[index]`.
    pub async fn send(
        &self,
        channel: &str,
        index: usize,
        msg: Message,
    ) -> Result<(), DeviceError> {
        self.expect_sub(channel, index)?.send(msg).await.map_err(Into::into)
    }

    /// Sends a multipart message on `channel[index]`.
    pub async fn send_parts(
        &self,
        channel: &str,
        index: usize,
        parts: Parts,
    ) -> Result<(), DeviceError> {
        self.expect_sub(channel, index)?
            .send_parts(parts)
            .await
            .map_err(Into::into)
    }

    /// Receives a single-part message from `channel[index]`.
    pub async fn recv(&self, channel: &str, index: usize) -> Result<Message, DeviceError> {
        self.expect_sub(channel, index)?.recv().await.map_err(Into::into)
    }

    /// Receives a multipart message from `channel[index]`.
    pub async fn recv_parts(&self, channel: &str, index: usize) -> Result<Parts, DeviceError> {
        self.expect_sub(channel, index)?
            .recv_parts()
            .await
            .map_err(Into::into)
    }

    fn expect_sub(&self, channel: &str, index: usize) -> Result<&Channel, DeviceError> {
        self.sub_channel(channel, index)
            .ok_or_else(|| DeviceError::config(format!("unknown channel {channel}[{index}]")))
    }
}

/// Builds a [`Device`].
pub struct DeviceBuilder {
    config: Properties,
    defaults: DeviceDefaults,
    hooks: Box<dyn DeviceHooks>,
    provider: Box<dyn TransportProvider>,
    inputs: HashMap<String, InputHandler>,
    input_keys: Vec<String>,
}

impl DeviceBuilder {
    fn new(config: Properties) -> Self {
        Self {
            config,
            defaults: DeviceDefaults::default(),
            hooks: Box::new(NoopHooks),
            provider: Box::new(DefaultTransportProvider),
            inputs: HashMap::new(),
            input_keys: Vec::new(),
        }
    }

    /// Installs the lifecycle hooks.
    pub fn hooks(mut self, hooks: impl DeviceHooks) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Overrides the fallback values used for absent config keys.
    pub fn defaults(mut self, defaults: DeviceDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Installs the transport provider; the default one only serves the
    /// in-process `memory` transport.
    pub fn transport_provider(mut self, provider: impl TransportProvider + 'static) -> Self {
        self.provider = Box::new(provider);
        self
    }

    /// Registers a single-message callback for input channel `name`.
    ///
    /// Registering any callback switches the run engine into callback
    /// dispatch; the hooks' `conditional_run`/`run` are then not consulted.
    pub fn on_data(
        mut self,
        name: impl Into<String>,
        callback: impl FnMut(Message, usize) -> Result<bool, DeviceError> + Send + 'static,
    ) -> Self {
        self.register(name.into(), InputHandler::Message(Box::new(callback) as MessageHandler))
    }

    /// Registers a multipart callback for input channel `name`.
    pub fn on_multipart(
        mut self,
        name: impl Into<String>,
        callback: impl FnMut(Parts, usize) -> Result<bool, DeviceError> + Send + 'static,
    ) -> Self {
        self.register(
            name.into(),
            InputHandler::Multipart(Box::new(callback) as MultipartHandler),
        )
    }

    fn register(mut self, name: String, handler: InputHandler) -> Self {
        if self.inputs.insert(name.clone(), handler).is_none() {
            self.input_keys.push(name);
        }
        self
    }

    pub fn build(self) -> Device {
        Device::from_builder(self)
    }
}

/// A hosted processing unit: state machine, channels, transports, hooks.
pub struct Device {
    pub(crate) ctx: DeviceContext,
    pub(crate) hooks: Box<dyn DeviceHooks>,
    pub(crate) machine: StateMachine,
    pub(crate) inputs: HashMap<String, InputHandler>,
    pub(crate) input_keys: Vec<String>,
    /// Sub-channels waiting for their bind attempt.
    binding: Vec<(String, usize)>,
    /// Sub-channels waiting to connect; retried until the init timeout.
    connecting: Vec<(String, usize)>,
}

enum AttachList {
    Binding,
    Connecting,
}

impl Device {
    /// Starts building a device over `config`.
    pub fn builder(config: Properties) -> DeviceBuilder {
        DeviceBuilder::new(config)
    }

    /// Builds a device with its own empty configuration.
    pub fn with_internal_config() -> DeviceBuilder {
        DeviceBuilder::new(Properties::new())
    }

    fn from_builder(builder: DeviceBuilder) -> Self {
        let machine = StateMachine::new();
        let transports = TransportRegistry::new(builder.provider);

        // a transition request aborts blocking transport calls so handlers
        // observe the pending signal promptly
        let interrupt = transports.clone();
        machine.subscribe_to_transitions("device", move |transition| {
            trace!(%transition, "device notified on new transition");
            interrupt.interrupt_all();
        });

        // and entering the next state re-arms them
        let resume = transports.clone();
        machine.set_prepare_hook(move |state| {
            trace!(%state, "resuming transports");
            resume.resume_all();
        });

        let ctx = DeviceContext {
            id: builder.defaults.id.clone(),
            config: builder.config,
            default_transport: builder.defaults.transport_kind,
            rate: builder.defaults.rate,
            init_timeout: builder.defaults.init_timeout,
            defaults: builder.defaults,
            channels: HashMap::new(),
            transports,
            default_factory: None,
            machine: machine.clone(),
        };

        Self {
            ctx,
            hooks: builder.hooks,
            machine,
            inputs: builder.inputs,
            input_keys: builder.input_keys,
            binding: Vec::new(),
            connecting: Vec::new(),
        }
    }

    /// A cloneable control handle; valid before and during [`run`](Device::run).
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            machine: self.machine.clone(),
        }
    }

    /// Drives the state machine until `Exiting` (or until
    /// [`DeviceHandle`] observers are gone and the machine is stopped).
    ///
    /// Returns the first fatal handler error, if any occurred along the way.
    pub async fn run(mut self) -> Result<(), DeviceError> {
        let mut fatal: Option<DeviceError> = None;

        while let Some(transition) = self.machine.next_transition().await {
            let state = match self.machine.advance(transition) {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "dropping stale transition");
                    continue;
                }
            };
            trace!(%state, "device entering state");

            self.machine.run_prepare(state);
            let result = self.enter_state(state).await;
            self.machine.publish_entered(state);

            if let Err(e) = result {
                error!(error = %e, %state, "state handler failed");
                if fatal.is_none() {
                    fatal = Some(e);
                }
                let _ = self.machine.change_state(Transition::ErrorFound);
            }

            if state == State::Exiting {
                break;
            }
        }

        self.machine.unsubscribe_from_transitions("device");
        self.machine.stop_handling_states();
        debug!(id = %self.ctx.id, "shutting down device");

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn enter_state(&mut self, state: State) -> Result<(), DeviceError> {
        match state {
            State::InitializingDevice => self.init_wrapper().await,
            State::Binding => self.bind_wrapper().await,
            State::Connecting => self.connect_wrapper().await,
            State::InitializingTask => self.init_task_wrapper().await,
            State::Running => self.run_wrapper().await,
            State::ResettingTask => self.reset_task_wrapper().await,
            State::ResettingDevice => self.reset_wrapper().await,
            State::Exiting => self.hooks.exit(&mut self.ctx).await,
            _ => {
                trace!(%state, "no handler for state");
                Ok(())
            }
        }
    }

    /// Requests `transition` unless something newer is already pending.
    fn advance_if_idle(&self, transition: Transition) -> Result<(), DeviceError> {
        if !self.machine.new_state_pending() {
            self.machine.change_state(transition)?;
        }
        Ok(())
    }

    // ---- state wrappers ----

    async fn init_wrapper(&mut self) -> Result<(), DeviceError> {
        // initialization work starts once the controller requests CompleteInit
        self.machine.wait_for_pending_state().await;
        if self.machine.is_stopped() {
            return Ok(());
        }

        self.ctx.id = self.ctx.config.get_or("id", self.ctx.defaults.id.clone());

        self.hooks.init(&mut self.ctx).await?;

        self.ctx.rate = self.ctx.config.get_or("rate", self.ctx.defaults.rate);
        let timeout_s = self
            .ctx
            .config
            .get_or("init-timeout", self.ctx.defaults.init_timeout.as_secs() as i64);
        self.ctx.init_timeout = Duration::from_secs(timeout_s.max(0) as u64);

        let transport_name = self
            .ctx
            .config
            .get_or("transport", self.ctx.defaults.transport_name.clone());
        let default_kind = match transport_name.parse::<TransportKind>() {
            Ok(TransportKind::Default) => self.ctx.defaults.transport_kind,
            Ok(kind) => kind,
            Err(e) => {
                error!(transport = %transport_name, "invalid transport type provided");
                return Err(DeviceError::config(e.to_string()));
            }
        };
        self.ctx.default_transport = default_kind;

        // build channel objects from the chans.<name>.<index>.* declarations
        let mut declared: Vec<(String, usize)> = self.ctx.config.channel_info().into_iter().collect();
        declared.sort();
        self.ctx.channels.clear();
        for (name, count) in declared {
            let mut subs = Vec::with_capacity(count);
            for index in 0..count {
                subs.push(Channel::from_properties(&name, index, &self.ctx.config)?);
            }
            self.ctx.channels.insert(name, subs);
        }

        debug!(transport = %default_kind, "setting default transport for the device");
        let default_factory = self.ctx.transports.add_transport(
            default_kind,
            default_kind,
            &self.ctx.id,
            &self.ctx.config,
        )?;
        self.ctx.default_factory = Some(default_factory);

        // only transports that pick a bind IP consume this; unspecified bind
        // addresses fall back to the wildcard form below
        let _network_interface = self
            .ctx
            .config
            .get_or("network-interface", self.ctx.defaults.network_interface.clone());

        self.binding.clear();
        self.connecting.clear();
        let mut names: Vec<String> = self.ctx.channels.keys().cloned().collect();
        names.sort();
        for name in names {
            let subs = self.ctx.channels.get_mut(&name).expect("declared channel");
            for sub in subs.iter_mut() {
                let kind = match sub.transport() {
                    TransportKind::Default => default_kind,
                    other => other,
                };
                sub.set_transport(kind);
                debug!(channel = sub.name(), transport = %kind, "initializing transport for channel");
                let factory = self.ctx.transports.add_transport(
                    kind,
                    default_kind,
                    &self.ctx.id,
                    &self.ctx.config,
                )?;
                sub.init(factory)?;

                match sub.method() {
                    Some(Method::Bind) => {
                        if sub.address().is_empty() || sub.address() == "unspecified" {
                            debug!(channel = sub.name(), "binding on tcp://*:1");
                            sub.update_address("tcp://*:1");
                        }
                        self.binding.push((name.clone(), sub.index()));
                    }
                    Some(Method::Connect) => {
                        self.connecting.push((name.clone(), sub.index()));
                    }
                    None if has_override(sub.address()) => {
                        self.connecting.push((name.clone(), sub.index()));
                    }
                    None => {
                        error!(
                            channel = sub.name(),
                            "socket method (bind/connect) not specified"
                        );
                        return Err(DeviceError::config(format!(
                            "socket method (bind/connect) for channel '{}' not specified",
                            sub.name()
                        )));
                    }
                }
            }
        }

        // no Auto here: the CompleteInit that released the wait is pending
        Ok(())
    }

    async fn bind_wrapper(&mut self) -> Result<(), DeviceError> {
        // bind settings are local, so a single pass must suffice
        self.attach_channels(AttachList::Binding).await;

        if !self.binding.is_empty() {
            error!(
                count = self.binding.len(),
                "binding channels could not initialize"
            );
            return Err(DeviceError::incomplete(format!(
                "{} of the binding channels could not initialize",
                self.binding.len()
            )));
        }

        self.hooks.bind(&mut self.ctx).await?;
        self.advance_if_idle(Transition::Auto)
    }

    async fn connect_wrapper(&mut self) -> Result<(), DeviceError> {
        let max_attempts =
            self.ctx.init_timeout.as_millis() as u64 / CONNECT_RETRY_INTERVAL.as_millis() as u64;
        let mut attempts: u64 = 1;

        self.attach_channels(AttachList::Connecting).await;

        // peers may publish their bound addresses while we retry; each round
        // re-reads the pending channels' addresses from the config
        while !self.connecting.is_empty() && !self.machine.new_state_pending() {
            tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;

            for (prefix, index) in &self.connecting {
                let key = format!("chans.{prefix}.{index}.address");
                let Some(address) = self.ctx.config.get::<String>(&key) else {
                    continue;
                };
                if let Some(sub) = self
                    .ctx
                    .channels
                    .get_mut(prefix)
                    .and_then(|subs| subs.get_mut(*index))
                {
                    if address != sub.address() {
                        sub.update_address(address);
                    }
                }
            }

            attempts += 1;
            if attempts > max_attempts {
                error!(
                    timeout_s = self.ctx.init_timeout.as_secs(),
                    "could not connect all channels before the timeout"
                );
                for (prefix, index) in &self.connecting {
                    if let Some(sub) = self.ctx.sub_channel(prefix, *index) {
                        error!(channel = sub.name(), address = sub.address(), "still not connected");
                    }
                }
                return Err(DeviceError::incomplete(format!(
                    "could not connect all channels within {} s",
                    self.ctx.init_timeout.as_secs()
                )));
            }

            self.attach_channels(AttachList::Connecting).await;
        }

        if self.ctx.channels.is_empty() {
            warn!("no channels created after finishing initialization");
        }

        self.hooks.connect(&mut self.ctx).await?;
        self.advance_if_idle(Transition::Auto)
    }

    async fn init_task_wrapper(&mut self) -> Result<(), DeviceError> {
        self.hooks.init_task(&mut self.ctx).await?;
        self.advance_if_idle(Transition::Auto)
    }

    async fn reset_task_wrapper(&mut self) -> Result<(), DeviceError> {
        self.hooks.reset_task(&mut self.ctx).await?;
        self.advance_if_idle(Transition::Auto)
    }

    async fn reset_wrapper(&mut self) -> Result<(), DeviceError> {
        self.ctx.transports.reset_all();
        for subs in self.ctx.channels.values_mut() {
            for sub in subs.iter_mut() {
                sub.release();
            }
        }

        self.hooks.reset(&mut self.ctx).await?;

        self.ctx.channels.clear();
        self.ctx.default_factory = None;
        self.advance_if_idle(Transition::Auto)
    }

    // ---- channel attachment ----

    /// One pass over an uninitialized list: channels that validate and attach
    /// are removed, the rest stay for retry (or for the caller to fail on).
    async fn attach_channels(&mut self, which: AttachList) {
        let list = match which {
            AttachList::Binding => std::mem::take(&mut self.binding),
            AttachList::Connecting => std::mem::take(&mut self.connecting),
        };

        let mut remaining = Vec::new();
        for (prefix, index) in list {
            let Some(sub) = self
                .ctx
                .channels
                .get_mut(&prefix)
                .and_then(|subs| subs.get_mut(index))
            else {
                continue;
            };
            if !sub.validate() {
                remaining.push((prefix, index));
                continue;
            }
            if attach_channel(sub, &self.ctx.config).await {
                // attached; drops off the uninitialized list
            } else {
                error!(
                    channel = sub.name(),
                    method = %sub.method().map(|m| m.to_string()).unwrap_or_default(),
                    "failed to attach channel"
                );
                remaining.push((prefix, index));
            }
        }

        match which {
            AttachList::Binding => self.binding = remaining,
            AttachList::Connecting => self.connecting = remaining,
        }
    }
}

/// Attaches every endpoint of one sub-channel.
///
/// Returns `false` on any recoverable miss (DNS failure, endpoint not up
/// yet); the channel then stays on its uninitialized list. On success the
/// possibly-substituted endpoint list is written back to the channel and to
/// the config, so peers discovering addresses through the config see the
/// real ones.
async fn attach_channel(chan: &mut Channel, config: &Properties) -> bool {
    let original = chan.address().to_string();
    let endpoints = split_endpoints(&original);
    let mut rewritten = Vec::with_capacity(endpoints.len());

    for endpoint in endpoints {
        let (override_method, bare) = parse_override(&endpoint);
        let had_modifier = override_method.is_some();
        let method = override_method
            .or(chan.method())
            .unwrap_or(Method::Connect);
        let bind = method == Method::Bind;

        let Some(address) = resolve_tcp_endpoint(bare, bind).await else {
            debug!(channel = chan.name(), endpoint = bare, "endpoint host did not resolve");
            return false;
        };

        let Some(socket) = chan.socket() else {
            return false;
        };
        let attached: Result<String, TransportError> = if bind {
            // the transport may substitute the address (any-free-port binds
            // come back concrete); keep what it reports
            socket.bind(&address).await
        } else {
            socket.connect(&address).await.map(|_| address.clone())
        };

        let actual = match attached {
            Ok(actual) => actual,
            Err(e) => {
                debug!(channel = chan.name(), endpoint = %address, error = %e, "attach attempt failed");
                return false;
            }
        };

        let mut entry = String::new();
        if had_modifier {
            entry.push(if bind { '@' } else { '+' });
        }
        entry.push_str(&actual);
        debug!(
            channel = chan.name(),
            endpoint = %entry,
            method = %method,
            socket_type = chan.sock_type(),
            "attached channel"
        );
        rewritten.push(entry);
    }

    let canonical = rewritten.join(",");
    if canonical != original {
        chan.update_address(canonical.clone());
        config.set(
            format!("chans.{}.{}.address", chan.prefix(), chan.index()),
            canonical,
        );
    }
    true
}

/// Cloneable control handle over a running (or not-yet-running) device.
///
/// External controllers request transitions and observe entered states here;
/// they never touch channels or hooks.
#[derive(Clone)]
pub struct DeviceHandle {
    machine: StateMachine,
}

impl DeviceHandle {
    /// Requests a transition; fails fast with
    /// [`DeviceError::InvalidTransition`] when it is illegal from the current
    /// (projected) state.
    pub fn change_state(&self, transition: Transition) -> Result<State, DeviceError> {
        self.machine.change_state(transition)
    }

    /// The state the machine is in right now (its handler may still be
    /// running).
    pub fn current_state(&self) -> State {
        self.machine.current_state()
    }

    /// Whether a transition request awaits dispatch.
    pub fn new_state_pending(&self) -> bool {
        self.machine.new_state_pending()
    }

    /// Ordered stream of entered states (published after each handler).
    pub fn subscribe_states(&self) -> broadcast::Receiver<State> {
        self.machine.subscribe_states()
    }

    /// Waits until `target` has been entered.
    pub async fn wait_for_state(&self, target: State) -> Result<(), DeviceError> {
        self.machine.wait_for_state(target).await
    }

    /// Steers the machine to `target`, issuing the canonical transition at
    /// every resting state and waiting through the transient ones.
    pub async fn transition_to(&self, target: State) -> Result<(), DeviceError> {
        let mut states: watch::Receiver<State> = self.machine.watch_current();
        loop {
            let current = self.machine.current_state();
            if current == target {
                return Ok(());
            }
            if current == State::Error && target != State::Error {
                return Err(DeviceError::EnteredError {
                    waiting_for: target,
                });
            }
            if let Some(transition) = current.transition_towards(target) {
                self.machine.change_state(transition)?;
            }
            if states.changed().await.is_err() {
                return Err(DeviceError::EnteredError {
                    waiting_for: target,
                });
            }
        }
    }

    /// Convenience: `End` from wherever the device currently rests, walking
    /// down through the reset states first.
    pub async fn shutdown(&self) -> Result<(), DeviceError> {
        self.transition_to(State::Exiting).await
    }
}
