//! # devisor
//!
//! **Devisor** is a device runtime for message-passing topologies.
//!
//! A *device* is a long-lived unit that owns named communication channels and
//! processes messages while a lifecycle state machine carries it from
//! construction through bound/connected channels into a running loop and back
//! to teardown. The crate is designed as the hosting layer for
//! data-acquisition and processing pipelines; the transports themselves plug
//! in behind a capability trait.
//!
//! ## Features
//!
//! | Area               | Description                                                        | Key types / traits                          |
//! |--------------------|--------------------------------------------------------------------|---------------------------------------------|
//! | **Lifecycle**      | Formal state machine with cooperative cancellation.                | [`State`], [`Transition`], [`StateMachine`] |
//! | **Devices**        | Orchestration of channels, transports and user hooks.              | [`Device`], [`DeviceHandle`], [`DeviceHooks`] |
//! | **Channels**       | Named endpoint bundles with bind/connect attachment and DNS.       | [`Channel`], [`Method`]                     |
//! | **Transports**     | Pluggable factories, sockets and pollers; in-process one included. | [`TransportFactory`], [`Socket`], [`Poller`] |
//! | **Configuration**  | Typed concurrent property store with channel declarations.         | [`Properties`], [`DeviceDefaults`]          |
//! | **Errors**         | Typed errors for the runtime and the transports.                   | [`DeviceError`], [`TransportError`]         |
//!
//! ```no_run
//! use devisor::{Device, Properties, State};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Properties::new();
//!     config.set("id", "sink-1");
//!     config.set("transport", "memory");
//!     config.set("chans.data.0.address", "memory://pipeline-data");
//!     config.set("chans.data.0.method", "bind");
//!     config.set("chans.data.0.type", "pull");
//!
//!     let mut seen = 0_u64;
//!     let device = Device::builder(config)
//!         .on_data("data", move |msg, _sub| {
//!             println!("received {} bytes", msg.len());
//!             seen += 1;
//!             Ok(seen < 3)
//!         })
//!         .build();
//!
//!     let handle = device.handle();
//!     let driver = tokio::spawn(device.run());
//!
//!     handle.transition_to(State::Running).await?;
//!     handle.wait_for_state(State::Ready).await?;
//!     handle.shutdown().await?;
//!     driver.await??;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod channel;
mod config;
mod device;
mod error;
mod hooks;
mod machine;
mod rate;
mod registry;
mod runner;
mod state;
pub mod transport;

// ---- Public re-exports ----

pub use channel::{Channel, ChannelCounters, Method};
pub use config::{DeviceDefaults, FromProperty, Properties, PropertyValue};
pub use device::{Device, DeviceBuilder, DeviceContext, DeviceHandle};
pub use error::{DeviceError, TransportError};
pub use hooks::{DeviceHooks, MessageHandler, MultipartHandler, NoopHooks};
pub use machine::StateMachine;
pub use rate::RateLimiter;
pub use registry::TransportRegistry;
pub use state::{State, Transition};
pub use transport::{
    DefaultTransportProvider, Message, Parts, Poller, PollerEntry, Socket, TransportFactory,
    TransportKind, TransportProvider,
};
