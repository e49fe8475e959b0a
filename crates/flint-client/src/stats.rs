//! 连接统计计数器。

use std::sync::atomic::{AtomicU64, Ordering};

/// 内部计数器。读循环、发布路径与重连引擎在无锁路径上自增。
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) in_msgs: AtomicU64,
    pub(crate) in_bytes: AtomicU64,
    pub(crate) out_msgs: AtomicU64,
    pub(crate) out_bytes: AtomicU64,
    pub(crate) reconnects: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_in(&self, bytes: usize) {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_out(&self, bytes: usize) {
        self.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        Statistics {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// 面向应用的统计快照。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statistics {
    /// 投递给本连接的消息数。
    pub in_msgs: u64,
    /// 投递给本连接的负载字节数。
    pub in_bytes: u64,
    /// 本连接发出的消息数。
    pub out_msgs: u64,
    /// 本连接发出的负载字节数。
    pub out_bytes: u64,
    /// 成功完成的重连次数。
    pub reconnects: u64,
}
