//! # User lifecycle hooks and data callbacks.
//!
//! A device's behavior is supplied through [`DeviceHooks`]: one async method
//! per lifecycle point, every one defaulted to a no-op so implementors only
//! write what they need. Hooks run on the state-machine driver task and
//! receive the [`DeviceContext`] (the device's id, config and channels).
//!
//! Message handling during `Running` is either hook-driven
//! ([`conditional_run`](DeviceHooks::conditional_run) in a rate-limited loop)
//! or callback-driven: per-input-channel callbacks registered on the builder
//! with [`on_data`](crate::DeviceBuilder::on_data) /
//! [`on_multipart`](crate::DeviceBuilder::on_multipart). A callback returns
//! `Ok(false)` to leave the `Running` state.
//!
//! # Example
//! ```
//! use async_trait::async_trait;
//! use devisor::{DeviceContext, DeviceError, DeviceHooks};
//!
//! struct Sampler {
//!     samples: u64,
//! }
//!
//! #[async_trait]
//! impl DeviceHooks for Sampler {
//!     async fn conditional_run(&mut self, ctx: &mut DeviceContext) -> Result<bool, DeviceError> {
//!         let payload = self.samples.to_le_bytes().to_vec();
//!         ctx.send("data", 0, payload.into()).await?;
//!         self.samples += 1;
//!         Ok(true)
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::device::DeviceContext;
use crate::error::DeviceError;
use crate::transport::{Message, Parts};

/// # Lifecycle hooks of a device.
///
/// All methods default to no-ops (and `conditional_run` to "done"), so an
/// implementation overrides only the lifecycle points it cares about. Every
/// hook runs on the driver task; long-running hooks must poll
/// [`DeviceContext::new_state_pending`] and return promptly once it reports
/// `true`.
#[async_trait]
pub trait DeviceHooks: Send + 'static {
    /// Runs early in device initialization, before channels are classified.
    async fn init(&mut self, _ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Runs after all binding channels attached.
    async fn bind(&mut self, _ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Runs after all connecting channels attached.
    async fn connect(&mut self, _ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Task-level setup; channels are fully attached here.
    async fn init_task(&mut self, _ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Runs on entering `Running`, before any message handling.
    async fn pre_run(&mut self, _ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        Ok(())
    }

    /// One iteration of the user loop. Return `Ok(true)` to be called again.
    ///
    /// Only consulted when no data callbacks are registered.
    async fn conditional_run(&mut self, _ctx: &mut DeviceContext) -> Result<bool, DeviceError> {
        Ok(false)
    }

    /// Single-shot run, invoked once after the
    /// [`conditional_run`](DeviceHooks::conditional_run) loop exits.
    async fn run(&mut self, _ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Runs when leaving `Running`, after message handling stopped.
    async fn post_run(&mut self, _ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Task-level teardown, mirror of [`init_task`](DeviceHooks::init_task).
    async fn reset_task(&mut self, _ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Device-level teardown; transports are already reset when this runs.
    async fn reset(&mut self, _ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Runs on entering `Exiting`.
    async fn exit(&mut self, _ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Hooks that do nothing; for devices driven purely by data callbacks.
pub struct NoopHooks;

#[async_trait]
impl DeviceHooks for NoopHooks {}

/// Per-message input callback: `(message, sub-channel index)`, `Ok(true)` to
/// keep receiving.
pub type MessageHandler = Box<dyn FnMut(Message, usize) -> Result<bool, DeviceError> + Send>;

/// Multipart analogue of [`MessageHandler`].
pub type MultipartHandler = Box<dyn FnMut(Parts, usize) -> Result<bool, DeviceError> + Send>;

/// The callback registered for one input channel.
pub(crate) enum InputHandler {
    Message(MessageHandler),
    Multipart(MultipartHandler),
}

impl InputHandler {
    pub(crate) fn is_multipart(&self) -> bool {
        matches!(self, InputHandler::Multipart(_))
    }
}
