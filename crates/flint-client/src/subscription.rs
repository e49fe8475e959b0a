//! 订阅与投递子系统。
//!
//! 每个订阅持有一条带条件变量的 FIFO 消息队列：生产者是连接的读循环，
//! 消费者是专属投递线程（异步订阅）、库级共享投递池的工作线程（连接
//! 选择共享投递时）或调用 `next_msg` 的应用线程（同步订阅）。队列受
//! 挂起消息数/字节数双上限约束，超限消息被丢弃并按"慢消费阶段"去重
//! 上报。

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::connection::ConnInner;
use crate::dispatch::WorkerHandle;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::MessageHandler;

/// 订阅状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubStatus {
    Active,
    Draining,
    Closed,
}

/// 订阅关闭的具体原因，决定后续 `next_msg` 返回的错误形态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClosedCause {
    Unsubscribed,
    MaxDelivered,
    ConnClosed,
    Drained,
}

/// 入队结果；`SlowConsumer` 表示本次丢弃开启了新的慢消费阶段，
/// 调用方应上报异步错误（每阶段恰好一次）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Queued,
    SlowConsumer,
    Dropped,
    Closed,
}

/// 受订阅互斥锁保护的可变状态。
#[derive(Debug)]
pub(crate) struct SubState {
    pub(crate) status: SubStatus,
    pub(crate) closed_cause: Option<ClosedCause>,
    queue: VecDeque<Message>,
    pending_msgs: usize,
    pending_bytes: usize,
    limit_msgs: usize,
    limit_bytes: usize,
    pub(crate) delivered: u64,
    dropped: u64,
    max_pending_msgs_seen: usize,
    max_pending_bytes_seen: usize,
    slow_reported: bool,
    /// 自动退订上限；`None` 表示未设置。
    pub(crate) max_delivered: Option<u64>,
    /// 异步订阅的静默超时；触发后经错误回调上报一次，收到新消息重新武装。
    inactivity_timeout: Option<Duration>,
}

/// 订阅本体。应用持有 [`Subscription`] 句柄，连接的路由表持有同一份
/// `Arc`；对连接的反向引用是弱引用（连接关闭时失效，不构成所有权）。
pub(crate) struct SubInner {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    pub(crate) conn: Weak<ConnInner>,
    /// 异步订阅的消息处理器；同步订阅为 `None`。
    pub(crate) handler: Option<MessageHandler>,
    /// 共享投递池槽位；`None` 表示专属线程或同步消费。
    pub(crate) worker: Option<WorkerHandle>,
    pub(crate) state: Mutex<SubState>,
    pub(crate) cond: Condvar,
}

impl std::fmt::Debug for SubInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubInner")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .finish_non_exhaustive()
    }
}

impl SubInner {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        conn: Weak<ConnInner>,
        handler: Option<MessageHandler>,
        worker: Option<WorkerHandle>,
        limit_msgs: usize,
        limit_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            sid,
            subject,
            queue_group,
            conn,
            handler,
            worker,
            state: Mutex::new(SubState {
                status: SubStatus::Active,
                closed_cause: None,
                queue: VecDeque::new(),
                pending_msgs: 0,
                pending_bytes: 0,
                limit_msgs,
                limit_bytes,
                delivered: 0,
                dropped: 0,
                max_pending_msgs_seen: 0,
                max_pending_bytes_seen: 0,
                slow_reported: false,
                max_delivered: None,
                inactivity_timeout: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// 读循环入队一条消息。
    ///
    /// 超限消息被丢弃并计数；每个连续慢消费阶段只在首次丢弃时返回
    /// [`PushOutcome::SlowConsumer`]，队列回落到上限以下后重新武装。
    pub(crate) fn push(this: &Arc<Self>, msg: Message) -> PushOutcome {
        let mut st = this.state.lock();
        match st.status {
            SubStatus::Closed => return PushOutcome::Closed,
            SubStatus::Active | SubStatus::Draining => {}
        }

        let len = msg.len();
        if st.pending_msgs + 1 > st.limit_msgs || st.pending_bytes + len > st.limit_bytes {
            st.dropped += 1;
            if !st.slow_reported {
                st.slow_reported = true;
                return PushOutcome::SlowConsumer;
            }
            return PushOutcome::Dropped;
        }

        st.queue.push_back(msg);
        st.pending_msgs += 1;
        st.pending_bytes += len;
        st.max_pending_msgs_seen = st.max_pending_msgs_seen.max(st.pending_msgs);
        st.max_pending_bytes_seen = st.max_pending_bytes_seen.max(st.pending_bytes);
        drop(st);

        match &this.worker {
            Some(worker) => worker.signal(Arc::clone(this)),
            None => {
                this.cond.notify_all();
            }
        }
        PushOutcome::Queued
    }

    /// 弹出队头消息并完成投递记账；返回消息与"是否达到自动退订上限"。
    fn pop_for_delivery(&self) -> Option<(Message, bool)> {
        let mut st = self.state.lock();
        let msg = st.queue.pop_front()?;
        st.pending_msgs -= 1;
        st.pending_bytes -= msg.len();
        if st.pending_msgs < st.limit_msgs && st.pending_bytes < st.limit_bytes {
            st.slow_reported = false;
        }
        st.delivered += 1;
        let reached = st.max_delivered.is_some_and(|m| st.delivered >= m);
        Some((msg, reached))
    }

    /// 共享投递池的单步投递：恰好处理一条消息（或完成排空收尾）。
    pub(crate) fn deliver_next(this: &Arc<Self>) {
        match this.pop_for_delivery() {
            Some((msg, reached)) => {
                if let Some(handler) = &this.handler {
                    handler(msg);
                }
                if reached {
                    this.finish_auto_unsub();
                }
            }
            None => {
                // 队列空：排空中的订阅在此收尾。
                this.maybe_finish_drain();
            }
        }
        // 排空的最后一条消息之后不再有新事件，需主动检查收尾。
        this.maybe_finish_drain();
    }

    /// 专属投递线程主循环（每个非共享异步订阅一条）。
    pub(crate) fn delivery_loop(this: Arc<Self>) {
        loop {
            let mut st = this.state.lock();
            loop {
                if st.status == SubStatus::Closed {
                    return;
                }
                if !st.queue.is_empty() {
                    break;
                }
                if st.status == SubStatus::Draining {
                    // 队列已排空，完成关闭。
                    drop(st);
                    this.maybe_finish_drain();
                    return;
                }
                match st.inactivity_timeout {
                    Some(timeout) => {
                        let res = this.cond.wait_for(&mut st, timeout);
                        if res.timed_out() && st.queue.is_empty() && st.status == SubStatus::Active
                        {
                            // 静默超时只上报一次，收到消息前不再重复。
                            st.inactivity_timeout = None;
                            drop(st);
                            this.report_inactivity();
                            st = this.state.lock();
                        }
                    }
                    None => this.cond.wait(&mut st),
                }
            }
            drop(st);

            if let Some((msg, reached)) = this.pop_for_delivery() {
                if let Some(handler) = &this.handler {
                    handler(msg);
                }
                if reached {
                    this.finish_auto_unsub();
                    return;
                }
            }
        }
    }

    fn report_inactivity(self: &Arc<Self>) {
        if let Some(conn) = self.conn.upgrade() {
            ConnInner::report_sub_error(&conn, Some(Arc::clone(self)), Error::Timeout);
        }
    }

    /// 达到自动退订上限：本地关闭并从连接路由表摘除。
    fn finish_auto_unsub(self: &Arc<Self>) {
        if let Some(conn) = self.conn.upgrade() {
            ConnInner::remove_sub(&conn, self.sid);
        }
        self.close_local(ClosedCause::MaxDelivered);
    }

    /// 排空完成检查：`Draining` 且队列空 ⇒ 关闭。
    pub(crate) fn maybe_finish_drain(self: &Arc<Self>) {
        let done = {
            let st = self.state.lock();
            st.status == SubStatus::Draining && st.queue.is_empty()
        };
        if done {
            if let Some(conn) = self.conn.upgrade() {
                ConnInner::remove_sub(&conn, self.sid);
            }
            self.close_local(ClosedCause::Drained);
        }
    }

    /// 本地关闭：丢弃未投递消息（不触发回调），唤醒所有等待者。
    pub(crate) fn close_local(&self, cause: ClosedCause) {
        let mut st = self.state.lock();
        if st.status == SubStatus::Closed {
            return;
        }
        st.status = SubStatus::Closed;
        st.closed_cause.get_or_insert(cause);
        let discarded = st.queue.len();
        st.queue.clear();
        st.pending_msgs = 0;
        st.pending_bytes = 0;
        drop(st);
        if discarded > 0 {
            debug!(sid = self.sid, discarded, "discarding undelivered messages on close");
        }
        self.cond.notify_all();
    }

    /// 标记排空；返回是否已经同时完成（队列为空）。
    pub(crate) fn mark_draining(self: &Arc<Self>) -> bool {
        {
            let mut st = self.state.lock();
            if st.status != SubStatus::Active {
                return st.status == SubStatus::Closed;
            }
            st.status = SubStatus::Draining;
        }
        self.cond.notify_all();
        self.maybe_finish_drain();
        self.state.lock().status == SubStatus::Closed
    }

    /// 阻塞等待订阅关闭；用于排空收尾。
    pub(crate) fn wait_closed(&self, deadline: Instant) -> bool {
        let mut st = self.state.lock();
        while st.status != SubStatus::Closed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.cond.wait_for(&mut st, remaining);
        }
        true
    }

    fn closed_error(cause: Option<ClosedCause>) -> Error {
        match cause {
            Some(ClosedCause::MaxDelivered) => Error::MaxDeliveredMsgs,
            Some(ClosedCause::ConnClosed) => Error::ConnectionClosed,
            Some(ClosedCause::Unsubscribed) | Some(ClosedCause::Drained) | None => {
                Error::InvalidSubscription
            }
        }
    }
}

/// 应用侧订阅句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：句柄与连接路由表共享同一订阅本体；应用丢弃句柄
///   不会中断路由，显式 `unsubscribe`/`drain` 或连接关闭才会；
/// - **契约 (What)**：
///   - 同一订阅的消息按服务器发送顺序投递；异步投递对单个订阅串行，
///     即使启用共享投递池；
///   - 同步订阅专用 [`next_msg`](Self::next_msg)；对异步订阅调用返回
///     `state.illegal`；
///   - 关闭后的句柄只读观察项仍可用，操作类方法返回 `sub.invalid`。
#[derive(Clone)]
pub struct Subscription {
    pub(crate) inner: Arc<SubInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.inner.sid)
            .field("subject", &self.inner.subject)
            .field("queue_group", &self.inner.queue_group)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn from_inner(inner: Arc<SubInner>) -> Self {
        Self { inner }
    }

    /// 客户端分配的订阅 id（连接内唯一，自 1 单调递增）。
    pub fn sid(&self) -> u64 {
        self.inner.sid
    }

    /// 订阅的主题模式。
    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    /// 队列组名（若为队列订阅）。
    pub fn queue(&self) -> Option<&str> {
        self.inner.queue_group.as_deref()
    }

    /// 订阅是否仍可投递（活跃或排空中）。
    pub fn is_valid(&self) -> bool {
        self.inner.state.lock().status != SubStatus::Closed
    }

    /// 同步取下一条消息，最多阻塞 `timeout`。
    ///
    /// 返回错误：`io.timeout`（期限内无消息）、`conn.closed`（连接关闭）、
    /// `sub.max_delivered`（自动退订上限已达）、`sub.invalid`（已退订）。
    pub fn next_msg(&self, timeout: Duration) -> Result<Message> {
        if self.inner.handler.is_some() {
            return Err(Error::IllegalState(
                "next_msg is only available on synchronous subscriptions".into(),
            ));
        }
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.lock();
        loop {
            if let Some(msg) = st.queue.pop_front() {
                st.pending_msgs -= 1;
                st.pending_bytes -= msg.len();
                if st.pending_msgs < st.limit_msgs && st.pending_bytes < st.limit_bytes {
                    st.slow_reported = false;
                }
                st.delivered += 1;
                let reached = st.max_delivered.is_some_and(|m| st.delivered >= m);
                drop(st);
                if reached {
                    self.inner.finish_auto_unsub();
                } else {
                    self.inner.maybe_finish_drain();
                }
                return Ok(msg);
            }

            match st.status {
                SubStatus::Closed => return Err(SubInner::closed_error(st.closed_cause)),
                SubStatus::Draining => {
                    drop(st);
                    self.inner.maybe_finish_drain();
                    return Err(Error::InvalidSubscription);
                }
                SubStatus::Active => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            self.inner.cond.wait_for(&mut st, remaining);
        }
    }

    /// 退订：通知服务器停止路由并本地关闭。
    pub fn unsubscribe(&self) -> Result<()> {
        let conn = self
            .inner
            .conn
            .upgrade()
            .ok_or(Error::ConnectionClosed)?;
        ConnInner::unsubscribe(&conn, &self.inner, None)
    }

    /// 投递满 `max` 条后自动退订。
    ///
    /// 若调用时已投递 ≥ `max`，立即退订。
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        if max == 0 {
            return self.unsubscribe();
        }
        let conn = self
            .inner
            .conn
            .upgrade()
            .ok_or(Error::ConnectionClosed)?;
        ConnInner::unsubscribe(&conn, &self.inner, Some(max))
    }

    /// 排空订阅：立即通知服务器停止路由，投递完既有队列后关闭。
    pub fn drain(&self) -> Result<()> {
        self.drain_timeout(Duration::from_secs(30))
    }

    /// 带期限的排空；到期时放弃剩余消息并返回 `sub.drain_timeout`。
    pub fn drain_timeout(&self, timeout: Duration) -> Result<()> {
        let conn = self
            .inner
            .conn
            .upgrade()
            .ok_or(Error::ConnectionClosed)?;
        ConnInner::drain_sub(&conn, &self.inner, timeout)
    }

    /// 当前挂起的（消息数, 字节数）。
    pub fn pending(&self) -> (usize, usize) {
        let st = self.inner.state.lock();
        (st.pending_msgs, st.pending_bytes)
    }

    /// 历史挂起高水位（消息数, 字节数）。
    pub fn max_pending(&self) -> (usize, usize) {
        let st = self.inner.state.lock();
        (st.max_pending_msgs_seen, st.max_pending_bytes_seen)
    }

    /// 清零挂起高水位。
    pub fn clear_max_pending(&self) {
        let mut st = self.inner.state.lock();
        st.max_pending_msgs_seen = st.pending_msgs;
        st.max_pending_bytes_seen = st.pending_bytes;
    }

    /// 已投递消息数。
    pub fn delivered(&self) -> u64 {
        self.inner.state.lock().delivered
    }

    /// 因超限被丢弃的消息数。
    pub fn dropped(&self) -> u64 {
        self.inner.state.lock().dropped
    }

    /// 调整挂起上限（消息数与字节数，均须为正）。
    pub fn set_pending_limits(&self, msgs: usize, bytes: usize) -> Result<()> {
        if msgs == 0 || bytes == 0 {
            return Err(Error::InvalidArg("pending limits must be positive".into()));
        }
        let mut st = self.inner.state.lock();
        if st.status == SubStatus::Closed {
            return Err(Error::InvalidSubscription);
        }
        st.limit_msgs = msgs;
        st.limit_bytes = bytes;
        Ok(())
    }

    /// 设定异步订阅的静默超时；超时经错误回调上报一次。
    pub fn set_inactivity_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        if self.inner.handler.is_none() {
            return Err(Error::IllegalState(
                "inactivity timeout applies to async subscriptions".into(),
            ));
        }
        let mut st = self.inner.state.lock();
        if st.status == SubStatus::Closed {
            return Err(Error::InvalidSubscription);
        }
        st.inactivity_timeout = timeout;
        drop(st);
        self.inner.cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_sub(limit_msgs: usize, limit_bytes: usize) -> Arc<SubInner> {
        SubInner::new(
            1,
            "t".into(),
            None,
            Weak::new(),
            None,
            None,
            limit_msgs,
            limit_bytes,
        )
    }

    fn msg(data: &[u8]) -> Message {
        Message::new("t".into(), None, Bytes::copy_from_slice(data))
    }

    #[test]
    fn push_respects_message_limit_and_reports_once() {
        let sub = test_sub(2, 1024);
        assert_eq!(SubInner::push(&sub, msg(b"a")), PushOutcome::Queued);
        assert_eq!(SubInner::push(&sub, msg(b"b")), PushOutcome::Queued);
        // 第三条超限：丢弃且上报慢消费。
        assert_eq!(SubInner::push(&sub, msg(b"c")), PushOutcome::SlowConsumer);
        // 同一阶段的后续丢弃不再上报。
        assert_eq!(SubInner::push(&sub, msg(b"d")), PushOutcome::Dropped);
        {
            let st = sub.state.lock();
            assert_eq!(st.dropped, 2);
            assert_eq!(st.pending_msgs, 2);
        }

        // 消费一条使队列回落，慢消费阶段重新武装。
        let handle = Subscription::from_inner(Arc::clone(&sub));
        handle.next_msg(Duration::from_millis(10)).unwrap();
        assert_eq!(SubInner::push(&sub, msg(b"e")), PushOutcome::Queued);
        assert_eq!(SubInner::push(&sub, msg(b"f")), PushOutcome::SlowConsumer);
    }

    #[test]
    fn byte_limit_also_drops() {
        let sub = test_sub(100, 4);
        assert_eq!(SubInner::push(&sub, msg(b"abcd")), PushOutcome::Queued);
        assert_eq!(SubInner::push(&sub, msg(b"x")), PushOutcome::SlowConsumer);
        let handle = Subscription::from_inner(sub);
        assert_eq!(handle.pending(), (1, 4));
        assert_eq!(handle.dropped(), 1);
    }

    #[test]
    fn next_msg_times_out_then_delivers() {
        let sub = test_sub(10, 1024);
        let handle = Subscription::from_inner(Arc::clone(&sub));
        let err = handle.next_msg(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout));

        let feeder = std::thread::spawn({
            let sub = Arc::clone(&sub);
            move || {
                std::thread::sleep(Duration::from_millis(30));
                SubInner::push(&sub, msg(b"late"));
            }
        });
        let got = handle.next_msg(Duration::from_secs(2)).unwrap();
        assert_eq!(got.data(), b"late");
        feeder.join().unwrap();
    }

    #[test]
    fn close_wakes_waiter_with_conn_closed() {
        let sub = test_sub(10, 1024);
        let handle = Subscription::from_inner(Arc::clone(&sub));
        let waiter = std::thread::spawn(move || handle.next_msg(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(30));
        sub.close_local(ClosedCause::ConnClosed);
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[test]
    fn delivery_order_is_fifo() {
        let sub = test_sub(100, 1 << 20);
        for i in 0..10u8 {
            SubInner::push(&sub, msg(&[i]));
        }
        let handle = Subscription::from_inner(sub);
        for i in 0..10u8 {
            let got = handle.next_msg(Duration::from_millis(50)).unwrap();
            assert_eq!(got.data(), &[i]);
        }
    }

    #[test]
    fn high_water_mark_tracks_and_clears() {
        let sub = test_sub(100, 1 << 20);
        for _ in 0..5 {
            SubInner::push(&sub, msg(b"xy"));
        }
        let handle = Subscription::from_inner(sub);
        assert_eq!(handle.max_pending(), (5, 10));
        for _ in 0..5 {
            handle.next_msg(Duration::from_millis(10)).unwrap();
        }
        assert_eq!(handle.max_pending(), (5, 10));
        handle.clear_max_pending();
        assert_eq!(handle.max_pending(), (0, 0));
    }

    #[test]
    fn closed_sub_rejects_push_and_next_msg() {
        let sub = test_sub(10, 1024);
        SubInner::push(&sub, msg(b"kept"));
        sub.close_local(ClosedCause::Unsubscribed);
        assert_eq!(SubInner::push(&sub, msg(b"late")), PushOutcome::Closed);
        let handle = Subscription::from_inner(sub);
        assert!(!handle.is_valid());
        let err = handle.next_msg(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::InvalidSubscription));
    }
}
