//! 订阅子系统端到端行为：自动退订、慢消费者、排空与同步取件。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flint_client::{Connection, Error, Options, codes};
use support::{MockBroker, wait_until};

fn connect(broker: &MockBroker) -> Connection {
    Options::new()
        .with_url(broker.url())
        .connect()
        .expect("connect to mock broker")
}

#[test]
fn auto_unsub_delivers_exactly_n() {
    let broker = MockBroker::new();
    let conn = connect(&broker);

    let count = Arc::new(AtomicUsize::new(0));
    let handler_count = Arc::clone(&count);
    let sub = conn
        .subscribe("foo", move |_msg| {
            handler_count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    sub.auto_unsubscribe(10).unwrap();

    for i in 0..100u32 {
        conn.publish("foo", format!("m{i}")).unwrap();
    }
    conn.flush().unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        count.load(Ordering::SeqCst) == 10
    }));
    // 静置后仍恰好 10 条。
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::SeqCst), 10);
    assert!(!sub.is_valid());
    conn.close();
}

#[test]
fn auto_unsub_sync_reports_max_delivered() {
    let broker = MockBroker::new();
    let conn = connect(&broker);

    let sub = conn.subscribe_sync("counted").unwrap();
    sub.auto_unsubscribe(3).unwrap();
    for i in 0..5u32 {
        conn.publish("counted", format!("{i}")).unwrap();
    }
    conn.flush().unwrap();

    for _ in 0..3 {
        sub.next_msg(Duration::from_millis(1000)).unwrap();
    }
    let err = sub.next_msg(Duration::from_millis(200)).unwrap_err();
    assert!(matches!(err, Error::MaxDeliveredMsgs));
    assert!(!sub.is_valid());
    assert_eq!(sub.delivered(), 3);
    conn.close();
}

#[test]
fn slow_consumer_drops_counts_and_reports_once() {
    let broker = MockBroker::new();
    let slow_reports = Arc::new(AtomicUsize::new(0));
    let cb_reports = Arc::clone(&slow_reports);
    let conn = Options::new()
        .with_url(broker.url())
        .with_error_callback(move |_conn, sub, err| {
            if err.code() == codes::SUB_SLOW_CONSUMER {
                assert!(sub.is_some());
                cb_reports.fetch_add(1, Ordering::SeqCst);
            }
        })
        .connect()
        .unwrap();

    let sub = conn.subscribe_sync("firehose").unwrap();
    sub.set_pending_limits(5, 1 << 20).unwrap();

    for i in 0..8u32 {
        conn.publish("firehose", format!("{i}")).unwrap();
    }
    conn.flush().unwrap();

    assert!(wait_until(Duration::from_secs(2), || sub.dropped() == 3));
    let (pending_msgs, _) = sub.pending();
    assert_eq!(pending_msgs, 5);
    // 同一慢消费阶段恰好上报一次。
    assert!(wait_until(Duration::from_secs(2), || {
        slow_reports.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(slow_reports.load(Ordering::SeqCst), 1);

    // 队列回落后新一轮超限重新武装上报。
    sub.next_msg(Duration::from_millis(500)).unwrap();
    for i in 0..2u32 {
        conn.publish("firehose", format!("again-{i}")).unwrap();
    }
    conn.flush().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        slow_reports.load(Ordering::SeqCst) == 2
    }));
    conn.close();
}

#[test]
fn drain_sub_delivers_queued_then_stops() {
    let broker = MockBroker::new();
    let conn = connect(&broker);

    let count = Arc::new(AtomicUsize::new(0));
    let handler_count = Arc::clone(&count);
    let sub = conn
        .subscribe("drainage", move |_msg| {
            std::thread::sleep(Duration::from_millis(2));
            handler_count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    for i in 0..20u32 {
        conn.publish("drainage", format!("{i}")).unwrap();
    }
    conn.flush().unwrap();

    sub.drain_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 20);
    assert!(!sub.is_valid());

    // 排空后的发布不再抵达处理器。
    conn.publish("drainage", "late").unwrap();
    conn.flush().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::SeqCst), 20);
    conn.close();
}

#[test]
fn next_msg_times_out_without_traffic() {
    let broker = MockBroker::new();
    let conn = connect(&broker);
    let sub = conn.subscribe_sync("quiet").unwrap();

    let started = std::time::Instant::now();
    let err = sub.next_msg(Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(started.elapsed() < Duration::from_secs(2));
    conn.close();
}

#[test]
fn unsubscribe_invalidates_handle() {
    let broker = MockBroker::new();
    let conn = connect(&broker);
    let sub = conn.subscribe_sync("once").unwrap();
    sub.unsubscribe().unwrap();
    assert!(!sub.is_valid());
    assert!(matches!(
        sub.next_msg(Duration::from_millis(50)).unwrap_err(),
        Error::InvalidSubscription
    ));
    assert!(matches!(
        sub.unsubscribe().unwrap_err(),
        Error::InvalidSubscription
    ));
    conn.close();
}

#[test]
fn pending_limit_validation() {
    let broker = MockBroker::new();
    let conn = connect(&broker);
    let sub = conn.subscribe_sync("limits").unwrap();
    assert!(matches!(
        sub.set_pending_limits(0, 1024).unwrap_err(),
        Error::InvalidArg(_)
    ));
    sub.set_pending_limits(10, 1024).unwrap();
    conn.close();
}

#[test]
fn drain_connection_finishes_all_subscriptions() {
    let broker = MockBroker::new();
    let conn = connect(&broker);

    let count = Arc::new(AtomicUsize::new(0));
    let c1 = Arc::clone(&count);
    let c2 = Arc::clone(&count);
    conn.subscribe("d.one", move |_| {
        c1.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    conn.subscribe("d.two", move |_| {
        c2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    for i in 0..10u32 {
        conn.publish("d.one", format!("{i}")).unwrap();
        conn.publish("d.two", format!("{i}")).unwrap();
    }
    conn.flush().unwrap();

    conn.drain_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 20);
    assert!(conn.is_closed());
}

#[test]
fn global_delivery_pool_preserves_per_sub_order() {
    flint_client::init_delivery_pool(2).unwrap();
    let broker = MockBroker::new();
    let conn = Options::new()
        .with_url(broker.url())
        .use_global_delivery_pool(true)
        .connect()
        .unwrap();

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let handler_seen = Arc::clone(&seen);
    conn.subscribe("pooled", move |msg| {
        handler_seen.lock().push(msg.data().to_vec());
    })
    .unwrap();

    for i in 0..50u32 {
        conn.publish("pooled", format!("{i:04}")).unwrap();
    }
    conn.flush().unwrap();

    assert!(wait_until(Duration::from_secs(3), || seen.lock().len() == 50));
    let seen = seen.lock();
    let expected: Vec<Vec<u8>> = (0..50u32).map(|i| format!("{i:04}").into_bytes()).collect();
    assert_eq!(*seen, expected);
    conn.close();
}
