//! Run-engine dispatch tests.
//!
//! Exercises the three callback paths: the single-channel fast path, the
//! single-transport poller, and the multi-transport worker pool, including
//! per-channel ordering under concurrent feeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;

use devisor::transport::memory::MemoryTransport;
use devisor::{
    ChannelCounters, Device, Message, Parts, Properties, Socket, State, TransportError,
    TransportFactory, TransportKind, TransportProvider, Transition,
};

async fn feeder(address: &str) -> Arc<dyn Socket> {
    let factory = MemoryTransport::new();
    let socket = factory
        .create_socket(Arc::new(ChannelCounters::default()))
        .expect("feeder socket");
    socket.connect(address).await.expect("feeder connect");
    socket
}

fn pull_channel(config: &Properties, name: &str, address: &str, transport: &str) {
    config.set(format!("chans.{name}.0.address"), address);
    config.set(format!("chans.{name}.0.method"), "bind");
    config.set(format!("chans.{name}.0.type"), "pull");
    config.set(format!("chans.{name}.0.transport"), transport);
    config.set(format!("chans.{name}.0.rateLogging"), 0_u64);
}

/// Multipart callback on the fast path: parts arrive atomically.
#[tokio::test]
async fn multipart_fast_path_delivers_whole_messages() {
    let config = Properties::new();
    config.set("id", "parts-sink");
    config.set("transport", "memory");
    pull_channel(&config, "data", "memory://dispatch-parts", "memory");

    let received = Arc::new(Mutex::new(Vec::<Vec<usize>>::new()));
    let seen = Arc::clone(&received);
    let device = Device::builder(config)
        .on_multipart("data", move |parts: Parts, _sub| {
            let sizes: Vec<usize> = parts.iter().map(Message::len).collect();
            let mut seen = seen.lock().unwrap();
            seen.push(sizes);
            Ok(seen.len() < 2)
        })
        .build();

    let handle = device.handle();
    let driver = tokio::spawn(device.run());
    handle.transition_to(State::Running).await.unwrap();

    let push = feeder("memory://dispatch-parts").await;
    push.send_parts(vec![
        Message::new(vec![0_u8; 3]),
        Message::new(vec![0_u8; 5]),
    ])
    .await
    .unwrap();
    push.send_parts(vec![Message::new(vec![0_u8; 7])]).await.unwrap();

    timeout(Duration::from_secs(5), handle.wait_for_state(State::Ready))
        .await
        .expect("drains both messages")
        .unwrap();

    assert_eq!(*received.lock().unwrap(), vec![vec![3, 5], vec![7]]);

    handle.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();
}

/// Two input channels on one transport go through the poller; both see all
/// their traffic.
#[tokio::test]
async fn single_transport_poller_covers_all_inputs() {
    let config = Properties::new();
    config.set("id", "poll-sink");
    config.set("transport", "memory");
    pull_channel(&config, "first", "memory://dispatch-poll-first", "memory");
    pull_channel(&config, "second", "memory://dispatch-poll-second", "memory");

    let first_count = Arc::new(AtomicU64::new(0));
    let second_count = Arc::new(AtomicU64::new(0));

    let first = Arc::clone(&first_count);
    let second = Arc::clone(&second_count);
    let device = Device::builder(config)
        .on_data("first", move |_msg, _sub| {
            first.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
        .on_data("second", move |_msg, _sub| {
            second.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
        .build();

    let handle = device.handle();
    let driver = tokio::spawn(device.run());
    handle.transition_to(State::Running).await.unwrap();

    let push_first = feeder("memory://dispatch-poll-first").await;
    let push_second = feeder("memory://dispatch-poll-second").await;
    for _ in 0..50 {
        push_first.send(Message::new(&b"a"[..])).await.unwrap();
        push_second.send(Message::new(&b"b"[..])).await.unwrap();
    }

    timeout(Duration::from_secs(5), async {
        while first_count.load(Ordering::SeqCst) < 50 || second_count.load(Ordering::SeqCst) < 50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both channels drain");

    handle.change_state(Transition::Stop).unwrap();
    timeout(Duration::from_secs(2), handle.wait_for_state(State::Ready))
        .await
        .expect("poll loop observes the stop")
        .unwrap();

    handle.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();
}

/// Provider that serves two kinds, each backed by its own in-process factory.
struct TwoKindProvider;

impl TransportProvider for TwoKindProvider {
    fn create(
        &self,
        kind: TransportKind,
        _device_id: &str,
        _config: &Properties,
    ) -> Result<Arc<dyn TransportFactory>, TransportError> {
        match kind {
            TransportKind::Memory | TransportKind::Zmq => Ok(Arc::new(MemoryTransport::new())),
            other => Err(TransportError::Unsupported {
                kind: other.name().to_string(),
            }),
        }
    }
}

/// Inputs on two transports: one worker per kind; every channel sees its
/// 1000 messages complete and in arrival order.
#[tokio::test]
async fn multi_transport_dispatch_preserves_per_channel_order() {
    const COUNT: u64 = 1000;

    let config = Properties::new();
    config.set("id", "two-transports");
    config.set("transport", "memory");
    pull_channel(&config, "mem", "memory://dispatch-multi-mem", "memory");
    pull_channel(&config, "net", "memory://dispatch-multi-net", "zeromq");

    let mem_seen = Arc::new(Mutex::new(Vec::<u64>::new()));
    let net_seen = Arc::new(Mutex::new(Vec::<u64>::new()));

    let mem = Arc::clone(&mem_seen);
    let net = Arc::clone(&net_seen);
    let device = Device::builder(config)
        .transport_provider(TwoKindProvider)
        .on_data("mem", move |msg: Message, _sub| {
            let value = u64::from_le_bytes(msg.payload().as_ref().try_into().unwrap());
            mem.lock().unwrap().push(value);
            Ok(true)
        })
        .on_data("net", move |msg: Message, _sub| {
            let value = u64::from_le_bytes(msg.payload().as_ref().try_into().unwrap());
            net.lock().unwrap().push(value);
            Ok(true)
        })
        .build();

    let handle = device.handle();
    let driver = tokio::spawn(device.run());
    handle.transition_to(State::Running).await.unwrap();

    let push_mem = feeder("memory://dispatch-multi-mem").await;
    let push_net = feeder("memory://dispatch-multi-net").await;
    let feed_mem = tokio::spawn(async move {
        for i in 0..COUNT {
            push_mem.send(Message::new(i.to_le_bytes().to_vec())).await.unwrap();
        }
    });
    let feed_net = tokio::spawn(async move {
        for i in 0..COUNT {
            push_net.send(Message::new(i.to_le_bytes().to_vec())).await.unwrap();
        }
    });
    feed_mem.await.unwrap();
    feed_net.await.unwrap();

    timeout(Duration::from_secs(10), async {
        loop {
            let done = mem_seen.lock().unwrap().len() as u64 == COUNT
                && net_seen.lock().unwrap().len() as u64 == COUNT;
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both transports drain completely");

    handle.change_state(Transition::Stop).unwrap();
    timeout(Duration::from_secs(3), handle.wait_for_state(State::Ready))
        .await
        .expect("workers observe the stop")
        .unwrap();

    let expected: Vec<u64> = (0..COUNT).collect();
    assert_eq!(*mem_seen.lock().unwrap(), expected, "per-channel order on mem");
    assert_eq!(*net_seen.lock().unwrap(), expected, "per-channel order on net");

    handle.shutdown().await.unwrap();
    driver.await.unwrap().unwrap();
}

/// A callback for an undeclared channel is a configuration error; the device
/// lands in Error when entering Running.
#[tokio::test]
async fn callback_on_undeclared_channel_is_fatal() {
    let config = Properties::new();
    config.set("id", "misconfigured");
    config.set("transport", "memory");
    pull_channel(&config, "data", "memory://dispatch-undeclared", "memory");

    let device = Device::builder(config)
        .on_data("ghost", |_msg, _sub| Ok(true))
        .build();

    let handle = device.handle();
    let driver = tokio::spawn(device.run());

    // steering may report the Error itself or land in Running just before
    // the wrapper fails; either way Error follows
    let _ = timeout(Duration::from_secs(5), handle.transition_to(State::Running))
        .await
        .expect("steering completes");
    timeout(Duration::from_secs(5), handle.wait_for_state(State::Error))
        .await
        .expect("reaches Error")
        .unwrap();

    handle.change_state(Transition::End).unwrap();
    let err = driver.await.unwrap().unwrap_err();
    assert!(matches!(err, devisor::DeviceError::InvalidConfiguration { .. }));
}
