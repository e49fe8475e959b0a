//! 发布/订阅端到端行为：基本收发、回复主题、发布保序与冲刷先行发生。

mod support;

use std::time::Duration;

use flint_client::{Connection, Error, Options, Status};
use support::{BrokerConfig, MockBroker, wait_until};

fn connect(broker: &MockBroker) -> Connection {
    Options::new()
        .with_url(broker.url())
        .connect()
        .expect("connect to mock broker")
}

#[test]
fn publish_then_next_msg_delivers_payload() {
    let broker = MockBroker::new();
    let conn = connect(&broker);

    let sub = conn.subscribe_sync("foo").unwrap();
    conn.publish("foo", "Hello World").unwrap();

    let msg = sub.next_msg(Duration::from_millis(1000)).unwrap();
    assert_eq!(msg.subject(), "foo");
    assert_eq!(msg.data(), b"Hello World");
    assert_eq!(msg.len(), 11);

    let stats = conn.stats();
    assert_eq!(stats.out_msgs, 1);
    assert_eq!(stats.out_bytes, 11);
    assert_eq!(stats.in_msgs, 1);
    assert_eq!(stats.in_bytes, 11);
    conn.close();
}

#[test]
fn publish_request_carries_reply() {
    let broker = MockBroker::new();
    let conn = connect(&broker);

    let sub = conn.subscribe_sync("foo").unwrap();
    conn.publish_request("foo", "bar", "hello").unwrap();

    let msg = sub.next_msg(Duration::from_millis(1000)).unwrap();
    assert_eq!(msg.reply(), Some("bar"));
    assert_eq!(msg.data(), b"hello");
    conn.close();
}

#[test]
fn publish_order_preserved_and_flush_establishes_happens_before() {
    let broker = MockBroker::new();
    let conn = connect(&broker);

    let sub = conn.subscribe_sync("seq").unwrap();
    for i in 0..100u32 {
        conn.publish("seq", format!("payload-{i}")).unwrap();
    }
    conn.flush().unwrap();

    // 冲刷成功 ⇒ 先前发布均已被服务器应答，消息已全部入队。
    let (pending, _) = sub.pending();
    assert_eq!(pending, 100);

    conn.publish("seq", "after-flush").unwrap();
    for i in 0..100u32 {
        let msg = sub.next_msg(Duration::from_millis(500)).unwrap();
        assert_eq!(msg.data(), format!("payload-{i}").as_bytes());
    }
    let tail = sub.next_msg(Duration::from_millis(1000)).unwrap();
    assert_eq!(tail.data(), b"after-flush");
    conn.close();
}

#[test]
fn roundtrip_payloads_are_byte_identical() {
    let broker = MockBroker::new();
    let conn = connect(&broker);
    let sub = conn.subscribe_sync("echo.bytes").unwrap();

    for size in [0usize, 1, 2, 1024, 65536] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        conn.publish("echo.bytes", &payload).unwrap();
        conn.flush().unwrap();
        let msg = sub.next_msg(Duration::from_millis(1000)).unwrap();
        assert_eq!(msg.subject(), "echo.bytes");
        assert_eq!(msg.data(), payload.as_slice(), "size {size}");
    }
    conn.close();
}

#[test]
fn oversized_payload_rejected_synchronously() {
    let broker = MockBroker::with_config(BrokerConfig {
        max_payload: Some(1024),
        ..Default::default()
    });
    let conn = connect(&broker);
    assert_eq!(conn.max_payload(), 1024);

    let err = conn.publish("big", vec![0u8; 2048]).unwrap_err();
    assert!(matches!(err, Error::MaxPayload { size: 2048, max: 1024 }));
    // 未发出任何字节。
    assert_eq!(conn.stats().out_msgs, 0);
    conn.close();
}

#[test]
fn verbose_mode_handshake_and_traffic() {
    let broker = MockBroker::new();
    let conn = Options::new()
        .with_url(broker.url())
        .verbose(true)
        .pedantic(true)
        .connect()
        .unwrap();

    let sub = conn.subscribe_sync("v").unwrap();
    conn.publish("v", "ok").unwrap();
    let msg = sub.next_msg(Duration::from_millis(1000)).unwrap();
    assert_eq!(msg.data(), b"ok");
    conn.close();
}

#[test]
fn connection_observers_reflect_steady_state() {
    let broker = MockBroker::new();
    let conn = connect(&broker);

    assert_eq!(conn.status(), Status::Connected);
    assert!(!conn.is_closed());
    assert!(!conn.is_reconnecting());
    let url = conn.connected_url().unwrap();
    assert!(url.contains(&broker.port().to_string()));
    assert!(conn.connected_server_id().unwrap().starts_with("mock-"));
    assert_eq!(conn.servers().len(), 1);
    assert!(conn.discovered_servers().is_empty());
    assert!(conn.new_inbox().starts_with("_INBOX."));

    conn.publish("x", "y").unwrap();
    conn.flush().unwrap();
    assert!(wait_until(Duration::from_secs(1), || conn.buffered() == 0));
    conn.close();
}

#[test]
fn close_is_idempotent_and_wakes_waiters() {
    let broker = MockBroker::new();
    let conn = connect(&broker);
    let sub = conn.subscribe_sync("never").unwrap();

    let waiter = {
        let sub = sub.clone();
        std::thread::spawn(move || sub.next_msg(Duration::from_secs(10)))
    };
    std::thread::sleep(Duration::from_millis(50));

    conn.close();
    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));

    // 第二次 close 幂等。
    conn.close();
    assert_eq!(conn.status(), Status::Closed);
    assert!(matches!(
        conn.publish("never", "x").unwrap_err(),
        Error::ConnectionClosed
    ));
    assert!(matches!(
        conn.flush().unwrap_err(),
        Error::ConnectionClosed
    ));
}

#[test]
fn subject_validation_rejects_whitespace() {
    let broker = MockBroker::new();
    let conn = connect(&broker);
    assert!(matches!(
        conn.publish("", "x").unwrap_err(),
        Error::InvalidArg(_)
    ));
    assert!(matches!(
        conn.publish("bad subject", "x").unwrap_err(),
        Error::InvalidArg(_)
    ));
    assert!(matches!(
        conn.subscribe_sync("also\tbad").unwrap_err(),
        Error::InvalidArg(_)
    ));
    conn.close();
}
