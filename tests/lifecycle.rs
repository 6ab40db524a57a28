//! Lifecycle integration tests.
//!
//! Drives whole devices through the state graph over the in-process
//! transport: happy path, connect retry/timeout, cooperative stop, error
//! handling. Endpoint names are unique per test because the memory transport
//! shares one route table per process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use devisor::transport::memory::MemoryTransport;
use devisor::{
    ChannelCounters, Device, DeviceContext, DeviceError, DeviceHooks, Message, Properties, State,
    TransportFactory, Transition,
};

fn pull_config(id: &str, address: &str) -> Properties {
    let config = Properties::new();
    config.set("id", id);
    config.set("transport", "memory");
    config.set("chans.data.0.address", address);
    config.set("chans.data.0.method", "bind");
    config.set("chans.data.0.type", "pull");
    config.set("chans.data.0.rateLogging", 0_u64);
    config
}

async fn feeder(address: &str) -> Arc<dyn devisor::Socket> {
    let factory = MemoryTransport::new();
    let socket = factory
        .create_socket(Arc::new(ChannelCounters::default()))
        .expect("feeder socket");
    socket.connect(address).await.expect("feeder connect");
    socket
}

/// A device that counts messages and leaves Running after a configured
/// maximum, mirroring the classic sink.
struct SinkHooks {
    max_iterations: Arc<AtomicU64>,
}

#[async_trait]
impl DeviceHooks for SinkHooks {
    async fn init_task(&mut self, ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        self.max_iterations
            .store(ctx.config().get_or("max-iterations", 0_u64), Ordering::SeqCst);
        Ok(())
    }
}

/// Sink scenario: a pull sink receives three values from a push peer and
/// leaves Running on its own after the third.
#[tokio::test]
async fn sink_receives_and_stops_after_max_iterations() {
    let config = pull_config("sink-1", "memory://lifecycle-sink");
    config.set("max-iterations", 3_u64);

    let max_iterations = Arc::new(AtomicU64::new(0));
    let received = Arc::new(std::sync::Mutex::new(Vec::<u64>::new()));

    let seen = Arc::clone(&received);
    let max = Arc::clone(&max_iterations);
    let device = Device::builder(config)
        .hooks(SinkHooks {
            max_iterations: Arc::clone(&max_iterations),
        })
        .on_data("data", move |msg: Message, _sub| {
            let value = u64::from_le_bytes(msg.payload().as_ref().try_into().unwrap());
            let mut seen = seen.lock().unwrap();
            seen.push(value);
            Ok((seen.len() as u64) < max.load(Ordering::SeqCst))
        })
        .build();

    let handle = device.handle();
    let driver = tokio::spawn(device.run());

    timeout(Duration::from_secs(5), handle.transition_to(State::Running))
        .await
        .expect("reaches Running in time")
        .unwrap();

    let push = feeder("memory://lifecycle-sink").await;
    for value in [42_u64, 43, 44] {
        push.send(Message::new(value.to_le_bytes().to_vec()))
            .await
            .unwrap();
    }

    // third callback returns false; the device stops autonomously
    timeout(Duration::from_secs(5), handle.wait_for_state(State::Ready))
        .await
        .expect("returns to Ready in time")
        .unwrap();

    assert_eq!(*received.lock().unwrap(), vec![42, 43, 44]);

    handle.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();
}

/// Connect retry: the peer binds only after the device started connecting;
/// the retry loop picks the endpoint up within the init timeout.
#[tokio::test]
async fn connecting_device_waits_for_late_binder() {
    let config = Properties::new();
    config.set("id", "late-connect");
    config.set("transport", "memory");
    config.set("init-timeout", 5_i64);
    config.set("chans.data.0.address", "memory://lifecycle-late-binder");
    config.set("chans.data.0.method", "connect");
    config.set("chans.data.0.type", "pull");
    config.set("chans.data.0.rateLogging", 0_u64);

    let device = Device::builder(config).build();
    let handle = device.handle();
    let driver = tokio::spawn(device.run());

    // bring the peer up after the device is already retrying
    let binder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let factory = MemoryTransport::new();
        let socket = factory
            .create_socket(Arc::new(ChannelCounters::default()))
            .unwrap();
        socket.bind("memory://lifecycle-late-binder").await.unwrap();
        socket
    });

    timeout(
        Duration::from_secs(2),
        handle.transition_to(State::DeviceReady),
    )
    .await
    .expect("connects once the binder is up")
    .unwrap();

    let _binder = binder.await.unwrap();
    handle.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();
}

/// Connect timeout: the peer never appears; the device lands in Error with
/// an incomplete-initialization failure and leaves only on End.
#[tokio::test]
async fn connect_timeout_drives_device_to_error() {
    let config = Properties::new();
    config.set("id", "never-connects");
    config.set("transport", "memory");
    config.set("init-timeout", 1_i64);
    config.set("chans.data.0.address", "memory://lifecycle-never-bound");
    config.set("chans.data.0.method", "connect");
    config.set("chans.data.0.type", "pull");
    config.set("chans.data.0.rateLogging", 0_u64);

    let device = Device::builder(config).build();
    let handle = device.handle();
    let driver = tokio::spawn(device.run());

    let steering = timeout(
        Duration::from_secs(5),
        handle.transition_to(State::DeviceReady),
    )
    .await
    .expect("fails before the test times out");
    assert!(matches!(steering, Err(DeviceError::EnteredError { .. })));
    assert_eq!(handle.current_state(), State::Error);

    handle.change_state(Transition::End).unwrap();
    let err = driver.await.unwrap().unwrap_err();
    assert!(matches!(err, DeviceError::InitializationIncomplete { .. }));
}

/// A bind conflict is fatal on the single bind pass.
#[tokio::test]
async fn bind_conflict_is_fatal() {
    let occupant = MemoryTransport::new();
    let socket = occupant
        .create_socket(Arc::new(ChannelCounters::default()))
        .unwrap();
    socket.bind("memory://lifecycle-occupied").await.unwrap();

    let config = pull_config("second-binder", "memory://lifecycle-occupied");
    let device = Device::builder(config).build();
    let handle = device.handle();
    let driver = tokio::spawn(device.run());

    let steering = timeout(Duration::from_secs(5), handle.transition_to(State::Bound))
        .await
        .expect("fails fast");
    assert!(steering.is_err());
    assert_eq!(handle.current_state(), State::Error);

    handle.change_state(Transition::End).unwrap();
    let err = driver.await.unwrap().unwrap_err();
    assert!(matches!(err, DeviceError::InitializationIncomplete { .. }));
}

/// Cooperative stop: `conditional_run` would run forever; an external Stop
/// is observed within a couple of limiter periods.
#[tokio::test]
async fn running_user_loop_stops_cooperatively() {
    struct Forever;

    #[async_trait]
    impl DeviceHooks for Forever {
        async fn conditional_run(&mut self, _ctx: &mut DeviceContext) -> Result<bool, DeviceError> {
            Ok(true)
        }
    }

    let config = Properties::new();
    config.set("id", "perpetual");
    config.set("transport", "memory");
    config.set("rate", 50.0);

    let device = Device::builder(config).hooks(Forever).build();
    let handle = device.handle();
    let driver = tokio::spawn(device.run());

    handle.transition_to(State::Running).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.change_state(Transition::Stop).unwrap();
    timeout(Duration::from_millis(500), handle.wait_for_state(State::Ready))
        .await
        .expect("stop observed within a few limiter periods")
        .unwrap();

    handle.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();
}

/// Requesting Run from Idle is rejected and changes nothing.
#[tokio::test]
async fn invalid_transition_is_rejected_from_idle() {
    let device = Device::builder(Properties::new()).build();
    let handle = device.handle();

    let err = handle.change_state(Transition::Run).unwrap_err();
    assert!(matches!(
        err,
        DeviceError::InvalidTransition {
            from: State::Idle,
            transition: Transition::Run,
        }
    ));
    assert_eq!(handle.current_state(), State::Idle);
    assert!(!handle.new_state_pending());
}

/// Entered states reach observers in entry order across a full walk down to
/// Idle and out.
#[tokio::test]
async fn states_are_observed_in_order() {
    let config = pull_config("orderly", "memory://lifecycle-orderly");

    let device = Device::builder(config).build();
    let handle = device.handle();
    let mut states = handle.subscribe_states();
    let driver = tokio::spawn(device.run());

    handle.transition_to(State::Ready).await.unwrap();
    handle.transition_to(State::Idle).await.unwrap();
    handle.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();

    let mut observed = Vec::new();
    while let Ok(state) = states.try_recv() {
        observed.push(state);
    }
    assert_eq!(
        observed,
        vec![
            State::InitializingDevice,
            State::Initialized,
            State::Binding,
            State::Bound,
            State::Connecting,
            State::DeviceReady,
            State::InitializingTask,
            State::Ready,
            State::ResettingTask,
            State::DeviceReady,
            State::ResettingDevice,
            State::Idle,
            State::Exiting,
        ]
    );
}

/// Bound addresses are canonicalized into the config: an any-free-port bind
/// comes back concrete, and a peer can connect through DNS resolution of the
/// stored address.
#[tokio::test]
async fn bound_address_round_trips_through_config() {
    let config = pull_config("renegotiator", "tcp://127.0.0.1:1");
    let device = Device::builder(config.clone()).build();
    let handle = device.handle();
    let driver = tokio::spawn(device.run());

    handle.transition_to(State::Ready).await.unwrap();

    let stored: String = config.get("chans.data.0.address").unwrap();
    assert!(stored.starts_with("tcp://127.0.0.1:"));
    assert!(!stored.ends_with(":1"), "port must be renegotiated: {stored}");

    // a peer that discovered the address by hostname reaches the same route
    let port = stored.rsplit(':').next().unwrap();
    let peer_config = Properties::new();
    peer_config.set("id", "discoverer");
    peer_config.set("transport", "memory");
    peer_config.set("chans.data.0.address", format!("tcp://localhost:{port}"));
    peer_config.set("chans.data.0.method", "connect");
    peer_config.set("chans.data.0.type", "push");
    peer_config.set("chans.data.0.rateLogging", 0_u64);

    let peer = Device::builder(peer_config).build();
    let peer_handle = peer.handle();
    let peer_driver = tokio::spawn(peer.run());

    timeout(
        Duration::from_secs(2),
        peer_handle.transition_to(State::DeviceReady),
    )
    .await
    .expect("resolved connect succeeds")
    .unwrap();

    peer_handle.shutdown().await.unwrap();
    peer_driver.await.unwrap().unwrap();
    handle.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();
}
