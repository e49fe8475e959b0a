//! 队列组负载均衡。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flint_client::Options;
use support::{MockBroker, wait_until};

#[test]
fn queue_group_balances_roughly_evenly() {
    let broker = MockBroker::new();
    let conn = Options::new()
        .with_url(broker.url())
        .connect()
        .unwrap();

    let r1 = Arc::new(AtomicUsize::new(0));
    let r2 = Arc::new(AtomicUsize::new(0));
    let h1 = Arc::clone(&r1);
    let h2 = Arc::clone(&r2);
    conn.queue_subscribe("foo", "bar", move |_| {
        h1.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    conn.queue_subscribe("foo", "bar", move |_| {
        h2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    conn.flush().unwrap();

    for i in 0..1000u32 {
        conn.publish("foo", format!("{i}")).unwrap();
    }
    conn.flush().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        r1.load(Ordering::SeqCst) + r2.load(Ordering::SeqCst) == 1000
    }));
    let c1 = r1.load(Ordering::SeqCst) as i64;
    let c2 = r2.load(Ordering::SeqCst) as i64;
    assert_eq!(c1 + c2, 1000);
    assert!((c1 - 500).abs() <= 150, "unbalanced split: {c1}/{c2}");
    assert!((c2 - 500).abs() <= 150, "unbalanced split: {c1}/{c2}");
    conn.close();
}

#[test]
fn queue_and_plain_subscribers_coexist() {
    let broker = MockBroker::new();
    let conn = Options::new()
        .with_url(broker.url())
        .connect()
        .unwrap();

    let queue_hits = Arc::new(AtomicUsize::new(0));
    let plain_hits = Arc::new(AtomicUsize::new(0));
    let qh = Arc::clone(&queue_hits);
    let ph = Arc::clone(&plain_hits);
    conn.queue_subscribe("mixed", "workers", move |_| {
        qh.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    conn.subscribe("mixed", move |_| {
        ph.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    conn.flush().unwrap();

    for i in 0..50u32 {
        conn.publish("mixed", format!("{i}")).unwrap();
    }
    conn.flush().unwrap();

    // 队列组内恰一次、普通订阅全量：各 50。
    assert!(wait_until(Duration::from_secs(3), || {
        queue_hits.load(Ordering::SeqCst) == 50 && plain_hits.load(Ordering::SeqCst) == 50
    }));
    conn.close();
}
