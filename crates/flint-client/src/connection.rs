//! 连接核心：握手、状态机、读循环、flusher、心跳、重连引擎与请求应答。
//!
//! 稳态下每条连接运行三条后台线程：读循环（套接字 → 解析器 → 分发）、
//! flusher（挂起缓冲 → 套接字）与心跳定时器；另有一条回调分发线程保证
//! 用户回调串行。断连时读循环把错误交给 [`ConnInner::process_op_error`]，
//! 由重连引擎在独立线程上轮换服务器池、回放订阅并冲刷重连缓冲。
//!
//! 锁序：连接锁 → 订阅锁 → 投递池锁；写闸（`write_gate`）在持有连接锁
//! 时获取、释放连接锁后才执行套接字写，保证既不在连接锁内做阻塞写、
//! 写序又与入队序一致。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::buffer::ByteBuffer;
use crate::dispatch;
use crate::error::{Error, ErrorStack, Result};
use crate::inbox;
use crate::message::Message;
use crate::options::{MessageHandler, Options};
use crate::parser::{Dispatcher, Parser, PayloadRef};
use crate::pool::ServerPool;
use crate::proto::{self, ConnectRequest, ServerInfo};
use crate::socket::{self, LineReader, ReadHalf, Socket};
use crate::stats::{Statistics, StatsCounters};
use crate::subscription::{ClosedCause, PushOutcome, SubInner, Subscription};
use crate::url::ServerUrl;

/// 读循环的套接字读缓冲尺寸。
const READ_BUFFER_SIZE: usize = 32 * 1024;
/// 挂起缓冲的初始容量。
const PENDING_INITIAL_CAPACITY: usize = 32 * 1024;
/// 新式请求应答的并发上限（限定关联表体量）。
const MAX_CONCURRENT_REQUESTS: usize = 1024;
/// `flush()` 的缺省期限。
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// `drain()` 的缺省期限。
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// 连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 初始握手进行中。
    Connecting,
    /// 稳态。
    Connected,
    /// 终态；`close` 幂等。
    Closed,
    /// 重连引擎工作中，发布被改写入重连缓冲。
    Reconnecting,
    /// 排空第一阶段：订阅停收新路由，既有队列继续投递。
    DrainingSubs,
    /// 排空第二阶段：拒绝发布，冲刷后关闭。
    DrainingPubs,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Closed => "closed",
            Status::Reconnecting => "reconnecting",
            Status::DrainingSubs => "draining-subs",
            Status::DrainingPubs => "draining-pubs",
        };
        f.write_str(text)
    }
}

/// flush 等待者：挂在 PONG 序号上的一次性结果槽。
struct PongWaiter {
    slot: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl PongWaiter {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<()>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
        drop(slot);
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            self.cond.wait_for(&mut slot, remaining);
        }
    }
}

/// 请求等待者：响应消息的一次性结果槽。
struct RequestWaiter {
    slot: Mutex<Option<Result<Message>>>,
    cond: Condvar,
}

impl RequestWaiter {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn complete(&self, msg: Message) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(Ok(msg));
        }
        drop(slot);
        self.cond.notify_all();
    }

    fn fail(&self, err: Error) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(Err(err));
        }
        drop(slot);
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            self.cond.wait_for(&mut slot, remaining);
        }
    }
}

/// 回调分发任务；同一连接的回调由单线程顺序执行。
enum CbTask {
    Disconnected,
    Reconnected,
    Closed,
    Discovered,
    Connected,
    AsyncError(Option<Arc<SubInner>>, Error),
    Shutdown,
}

struct CbShared {
    queue: Mutex<VecDeque<CbTask>>,
    cond: Condvar,
}

/// 受连接互斥锁保护的可变状态。
pub(crate) struct ConnState {
    status: Status,
    pool: ServerPool,
    current_url: Option<ServerUrl>,
    info: Option<ServerInfo>,
    write: Option<socket::WriteHalf>,
    /// 裸 TCP 句柄，用于 shutdown 唤醒阻塞读。
    raw: Option<Arc<TcpStream>>,
    /// 稳态出站缓冲（flusher 的输入）。
    pending: ByteBuffer,
    /// 重连期间的发布暂存，容量受 `reconnect_buf_size` 约束。
    reconnect_pending: Option<ByteBuffer>,
    subs: HashMap<u64, Arc<SubInner>>,
    next_sid: u64,
    /// flush 等待者按 PING 序号排队（FIFO）。
    pongs: VecDeque<(u64, Arc<PongWaiter>)>,
    ping_serial: u64,
    pong_serial: u64,
    pings_out: u32,
    last_error: Option<Error>,
    error_stack: ErrorStack,
    /// 新式请求应答：共享收件箱前缀与令牌关联表。
    resp_prefix: Option<String>,
    resp_map: HashMap<String, Arc<RequestWaiter>>,
    /// 套接字世代号；旧世代的后台线程据此自行退出。
    generation: u64,
    threads: Vec<thread::JoinHandle<()>>,
    cb_thread: Option<thread::JoinHandle<()>>,
    /// `retry_on_failed_connect` 的首连仍在后台进行。
    first_connect_pending: bool,
}

/// 连接本体。
///
/// # 教案式说明
/// - **意图 (Why)**：单一结构承载状态机与全部共享资源，配合单把连接
///   锁让跨线程不变式可审计；
/// - **契约 (What)**：
///   - 所有阻塞套接字写都发生在释放连接锁之后（经由写闸串行化）；
///   - 订阅经弱引用回指连接，连接关闭后弱引用失效，不构成所有权环；
///   - `close` 幂等，所有阻塞等待者（`next_msg`/`flush`/`request`）被
///     唤醒并得到 `conn.closed`；
/// - **执行逻辑 (How)**：读循环实现解析器的 [`Dispatcher`]，把线协议
///   事件转译为入队、PONG 记账、池扩张或错误分类；错误分为可重试
///   （进入重连）与致命（关闭）两类。
pub(crate) struct ConnInner {
    pub(crate) opts: Options,
    state: Mutex<ConnState>,
    /// 状态变迁通知：ping 定时器、重连冷却与排空等待都睡在这上面。
    status_cond: Condvar,
    /// flusher 的工作信号。
    flusher_cond: Condvar,
    /// 写闸：获取于连接锁内，释放于套接字写完成后。
    write_gate: Mutex<()>,
    stats: StatsCounters,
    cb: Arc<CbShared>,
}

impl ConnInner {
    fn enqueue_cb(&self, task: CbTask) {
        let mut queue = self.cb.queue.lock();
        queue.push_back(task);
        drop(queue);
        self.cb.cond.notify_one();
    }

    /// 订阅相关的异步错误：记录末错并经回调上报。
    pub(crate) fn report_sub_error(this: &Arc<ConnInner>, sub: Option<Arc<SubInner>>, err: Error) {
        {
            let mut st = this.state.lock();
            st.last_error = Some(err.duplicate());
            st.error_stack.push(err.to_string());
        }
        this.enqueue_cb(CbTask::AsyncError(sub, err));
    }

    /// 从路由表摘除订阅（自动退订达成或排空完成时）。
    pub(crate) fn remove_sub(this: &Arc<ConnInner>, sid: u64) {
        let mut st = this.state.lock();
        st.subs.remove(&sid);
    }

    /// 退订或设置自动退订上限。
    pub(crate) fn unsubscribe(
        this: &Arc<ConnInner>,
        sub: &Arc<SubInner>,
        max: Option<u64>,
    ) -> Result<()> {
        let mut st = this.state.lock();
        if st.status == Status::Closed {
            return Err(Error::ConnectionClosed);
        }
        if !st.subs.contains_key(&sub.sid) {
            return Err(Error::InvalidSubscription);
        }
        let delivered = sub.state.lock().delivered;

        match max {
            Some(m) if delivered < m => {
                sub.state.lock().max_delivered = Some(m);
                if st.status == Status::Connected {
                    st.pending.append(&proto::encode_unsub(sub.sid, Some(m)))?;
                    return Self::kick_flusher(this, st);
                }
                Ok(())
            }
            _ => {
                st.subs.remove(&sub.sid);
                let send_line = st.status == Status::Connected;
                if send_line {
                    st.pending.append(&proto::encode_unsub(sub.sid, None))?;
                }
                let cause = if max.is_some() {
                    ClosedCause::MaxDelivered
                } else {
                    ClosedCause::Unsubscribed
                };
                let result = if send_line {
                    Self::kick_flusher(this, st)
                } else {
                    Ok(())
                };
                sub.close_local(cause);
                result
            }
        }
    }

    /// 排空单个订阅：先停服务器路由，再等队列投完。
    pub(crate) fn drain_sub(
        this: &Arc<ConnInner>,
        sub: &Arc<SubInner>,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        {
            let mut st = this.state.lock();
            if st.status == Status::Closed {
                return Err(Error::ConnectionClosed);
            }
            if !st.subs.contains_key(&sub.sid) {
                return Err(Error::InvalidSubscription);
            }
            if st.status == Status::Connected {
                st.pending.append(&proto::encode_unsub(sub.sid, None))?;
                Self::kick_flusher(this, st)?;
            }
        }

        sub.mark_draining();
        if sub.wait_closed(deadline) {
            return Ok(());
        }
        // 到期：放弃剩余消息并上报。
        Self::remove_sub(this, sub.sid);
        sub.close_local(ClosedCause::Drained);
        Self::report_sub_error(this, Some(Arc::clone(sub)), Error::DrainTimeout);
        Err(Error::DrainTimeout)
    }

    /// 把挂起缓冲交给 flusher；send-asap 模式下同步写出。
    ///
    /// 消费传入的状态锁守卫：同步写必须在释放连接锁后进行。
    fn kick_flusher(this: &Arc<ConnInner>, st: MutexGuard<'_, ConnState>) -> Result<()> {
        if this.opts.send_asap {
            return Self::flush_pending_now(this, st);
        }
        drop(st);
        this.flusher_cond.notify_one();
        Ok(())
    }

    /// 同步冲刷挂起缓冲（持写闸、不持连接锁）。
    fn flush_pending_now(this: &Arc<ConnInner>, mut st: MutexGuard<'_, ConnState>) -> Result<()> {
        if st.pending.is_empty() {
            return Ok(());
        }
        let generation = st.generation;
        let bytes = st.pending.take_all();
        let Some(write) = st.write.clone() else {
            return Err(Error::IllegalState("no active socket".into()));
        };
        let gate = this.write_gate.lock();
        drop(st);
        let result = write.write_all(&bytes);
        drop(gate);
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let err: Error = err.into();
                Self::process_op_error(this, err.duplicate(), generation);
                Err(err)
            }
        }
    }

    /// 稳态 I/O 故障的统一入口：可重试则转入重连，否则关闭。
    fn process_op_error(this: &Arc<ConnInner>, err: Error, generation: u64) {
        let mut st = this.state.lock();
        if st.generation != generation {
            return;
        }
        let in_steady_state = matches!(
            st.status,
            Status::Connected | Status::DrainingSubs | Status::DrainingPubs
        );
        if !in_steady_state {
            return;
        }

        let can_reconnect = err.is_retriable()
            && st.status == Status::Connected
            && this.opts.max_reconnect != Some(0);
        if !can_reconnect {
            drop(st);
            Self::close_internal(this, Some(err), false);
            return;
        }

        warn!(error = %err, "connection lost, entering reconnect");
        st.status = Status::Reconnecting;
        st.generation += 1;
        if let Some(raw) = st.raw.take() {
            socket::shutdown_socket(&raw);
        }
        st.write = None;
        st.pings_out = 0;

        // 未冲刷字节转入重连缓冲，超出容量的尾部丢弃并记档。
        let carried = st.pending.take_all();
        let mut reconnect_buf = ByteBuffer::with_capacity(carried.len().max(1024))
            .with_limit(Some(this.opts.reconnect_buf_size));
        if reconnect_buf.append(&carried).is_err() {
            st.error_stack
                .push("unflushed bytes exceeded reconnect buffer, tail dropped".into());
        }
        st.reconnect_pending = Some(reconnect_buf);

        st.last_error = Some(err.duplicate());
        st.error_stack.push(err.to_string());
        Self::fail_pong_waiters(&mut st, &err);

        let inner = Arc::clone(this);
        let handle = thread::Builder::new()
            .name("flint-reconnect".into())
            .spawn(move || ConnInner::reconnect_loop(inner))
            .expect("spawn reconnect thread");
        st.threads.push(handle);
        drop(st);

        this.enqueue_cb(CbTask::Disconnected);
        this.status_cond.notify_all();
        this.flusher_cond.notify_all();
    }

    fn fail_pong_waiters(st: &mut ConnState, err: &Error) {
        for (_, waiter) in st.pongs.drain(..) {
            waiter.complete(Err(err.duplicate()));
        }
    }

    /// 关闭连接（幂等）。`skip_disconnected` 用于鉴权违规路径。
    fn close_internal(this: &Arc<ConnInner>, cause: Option<Error>, skip_disconnected: bool) {
        let mut st = this.state.lock();
        if st.status == Status::Closed {
            return;
        }
        let was_connected = matches!(
            st.status,
            Status::Connected | Status::DrainingSubs | Status::DrainingPubs
        );
        st.status = Status::Closed;
        st.generation += 1;
        if let Some(raw) = st.raw.take() {
            socket::shutdown_socket(&raw);
        }
        st.write = None;
        st.pending.clear();
        st.reconnect_pending = None;
        if let Some(err) = cause {
            st.error_stack.push(err.to_string());
            st.last_error = Some(err);
        }
        Self::fail_pong_waiters(&mut st, &Error::ConnectionClosed);
        for (_, waiter) in st.resp_map.drain() {
            waiter.fail(Error::ConnectionClosed);
        }
        let subs: Vec<Arc<SubInner>> = st.subs.drain().map(|(_, sub)| sub).collect();
        let threads = std::mem::take(&mut st.threads);
        drop(st);

        for sub in subs {
            sub.close_local(ClosedCause::ConnClosed);
        }
        this.status_cond.notify_all();
        this.flusher_cond.notify_all();

        if was_connected && !skip_disconnected {
            this.enqueue_cb(CbTask::Disconnected);
        }
        this.enqueue_cb(CbTask::Closed);
        this.enqueue_cb(CbTask::Shutdown);

        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        let cb_thread = { this.state.lock().cb_thread.take() };
        if let Some(handle) = cb_thread
            && handle.thread().id() != current
        {
            let _ = handle.join();
        }
        debug!("connection closed");
    }

    /// 重连引擎：轮换服务器池，直至成功或池耗尽。
    fn reconnect_loop(this: Arc<ConnInner>) {
        loop {
            let url = {
                let mut st = this.state.lock();
                if st.status != Status::Reconnecting {
                    return;
                }
                match st.pool.select_next(this.opts.max_reconnect) {
                    Some(url) => url,
                    None => {
                        drop(st);
                        error!("server pool exhausted, closing connection");
                        Self::close_internal(&this, Some(Error::NoServer), false);
                        return;
                    }
                }
            };

            // 按服务器冷却：扣除距该端点上次尝试的耗时；醒于状态变化。
            {
                let mut st = this.state.lock();
                let mut remaining = st.pool.cooldown_remaining(this.opts.reconnect_wait);
                while !remaining.is_zero() && st.status == Status::Reconnecting {
                    this.status_cond.wait_for(&mut st, remaining);
                    remaining = st.pool.cooldown_remaining(this.opts.reconnect_wait);
                }
                if st.status != Status::Reconnecting {
                    return;
                }
                st.pool.begin_attempt();
            }

            debug!(url = %url, "reconnect attempt");
            match Self::connect_to_server(&this, &url, true) {
                Ok(()) => {
                    let first = {
                        let mut st = this.state.lock();
                        let first = st.first_connect_pending;
                        st.first_connect_pending = false;
                        first
                    };
                    if first {
                        this.enqueue_cb(CbTask::Connected);
                    } else {
                        this.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        this.enqueue_cb(CbTask::Reconnected);
                    }
                    return;
                }
                Err(err) => {
                    let mut st = this.state.lock();
                    if st.status != Status::Reconnecting {
                        return;
                    }
                    st.pool.fail_current();
                    st.error_stack.push(format!("reconnect to {url}: {err}"));
                    st.last_error = Some(err);
                }
            }
        }
    }

    /// 拨号 + 握手 + 线程编队。成功后状态置为 `Connected`。
    ///
    /// 全程不持连接锁（阻塞 I/O），仅在安装套接字与回放订阅时短暂加锁。
    fn connect_to_server(this: &Arc<ConnInner>, url: &ServerUrl, reconnecting: bool) -> Result<()> {
        let opts = &this.opts;
        let deadline = Instant::now() + opts.timeout;

        let stream = socket::dial(url, opts.ip_resolution_order, opts.timeout)?;
        let mut sock = Socket::plain(stream)?;
        let mut reader = LineReader::new();

        // 1. INFO
        let line = reader.read_line(&mut sock, deadline)?;
        let mut info = Self::parse_info_line(&line)?;

        // 2. 按需 TLS
        let wants_tls = info.tls_required || opts.tls.wants_tls() || url.is_tls_scheme();
        if wants_tls {
            let config = socket::build_tls_config(&opts.tls)?;
            let server_name = opts
                .tls
                .expected_hostname
                .as_deref()
                .unwrap_or_else(|| url.host());
            sock = sock.upgrade_tls(config, server_name)?;
        }

        // 3. CONNECT + PING
        let (user, pass, token) = Self::credentials(url, opts);
        let connect = ConnectRequest {
            verbose: opts.verbose,
            pedantic: opts.pedantic,
            tls_required: wants_tls,
            name: opts.name.as_deref(),
            lang: proto::CLIENT_LANG,
            version: proto::CLIENT_VERSION,
            user,
            pass,
            auth_token: token,
            no_echo: opts.no_echo,
        };
        let mut frame = connect.encode()?;
        frame.extend_from_slice(proto::PING_LINE);
        sock.write_all(&frame).map_err(Error::from)?;

        // 4. 等待 PONG（容忍 +OK / 额外 INFO）
        loop {
            let line = reader.read_line(&mut sock, deadline)?;
            if line.len() >= 4 && line[..4].eq_ignore_ascii_case(b"PONG") {
                break;
            }
            if line.len() >= 3 && line[..3].eq_ignore_ascii_case(b"+OK") {
                continue;
            }
            if line.len() >= 4 && line[..4].eq_ignore_ascii_case(b"-ERR") {
                let text = Self::normalize_err_text(&line[4..]);
                return Err(Self::map_handshake_err(&text));
            }
            if line.len() >= 4 && line[..4].eq_ignore_ascii_case(b"INFO") {
                info = Self::parse_info_line(&line)?;
                continue;
            }
            return Err(Error::Protocol(format!(
                "unexpected frame during handshake: '{}'",
                String::from_utf8_lossy(&line[..line.len().min(32)])
            )));
        }

        let leftover = reader.take_leftover();
        let (read_half, write_half, raw) = sock.split()?;

        // 5. 安装套接字并回放订阅
        let mut st = this.state.lock();
        if st.status == Status::Closed {
            socket::shutdown_socket(&raw);
            return Err(Error::ConnectionClosed);
        }
        st.generation += 1;
        let generation = st.generation;
        st.write = Some(write_half);
        st.raw = Some(raw);
        st.current_url = Some(url.clone());
        st.pings_out = 0;
        st.ping_serial = 0;
        st.pong_serial = 0;
        st.pool.connected_current();

        if reconnecting {
            Self::replay_subscriptions(&mut st)?;
            if let Some(mut buffered) = st.reconnect_pending.take() {
                let bytes = buffered.take_all();
                st.pending.append(&bytes)?;
            }
        }
        if st.pool.merge_advertised(&info.connect_urls)? {
            this.enqueue_cb(CbTask::Discovered);
        }
        st.info = Some(info);
        st.status = Status::Connected;

        // 6. 线程编队
        let read_inner = Arc::clone(this);
        let handle = thread::Builder::new()
            .name("flint-read".into())
            .spawn(move || ConnInner::read_loop(read_inner, read_half, leftover, generation))
            .expect("spawn read loop");
        st.threads.push(handle);

        if !opts.send_asap {
            let flusher_inner = Arc::clone(this);
            let handle = thread::Builder::new()
                .name("flint-flusher".into())
                .spawn(move || ConnInner::flusher_loop(flusher_inner, generation))
                .expect("spawn flusher");
            st.threads.push(handle);
        }
        if let Some(interval) = opts.ping_interval {
            let ping_inner = Arc::clone(this);
            let handle = thread::Builder::new()
                .name("flint-ping".into())
                .spawn(move || ConnInner::ping_loop(ping_inner, interval, generation))
                .expect("spawn ping timer");
            st.threads.push(handle);
        }
        drop(st);

        this.status_cond.notify_all();
        this.flusher_cond.notify_all();
        debug!(url = %url, reconnecting, "handshake complete");
        Ok(())
    }

    /// 按升序 sid 回放订阅；自动退订额度以"剩余条数"重放。
    fn replay_subscriptions(st: &mut ConnState) -> Result<()> {
        let mut sids: Vec<u64> = st.subs.keys().copied().collect();
        sids.sort_unstable();

        let mut lines = Vec::new();
        let mut expired: Vec<Arc<SubInner>> = Vec::new();
        for sid in sids {
            let sub = Arc::clone(&st.subs[&sid]);
            let (closed, max_delivered, delivered) = {
                let sst = sub.state.lock();
                (
                    !matches!(
                        sst.status,
                        crate::subscription::SubStatus::Active
                            | crate::subscription::SubStatus::Draining
                    ),
                    sst.max_delivered,
                    sst.delivered,
                )
            };
            if closed {
                expired.push(sub);
                continue;
            }
            match max_delivered {
                Some(max) if delivered >= max => expired.push(sub),
                Some(max) => {
                    lines.extend_from_slice(&proto::encode_sub(
                        &sub.subject,
                        sub.queue_group.as_deref(),
                        sid,
                    ));
                    lines.extend_from_slice(&proto::encode_unsub(sid, Some(max - delivered)));
                }
                None => {
                    lines.extend_from_slice(&proto::encode_sub(
                        &sub.subject,
                        sub.queue_group.as_deref(),
                        sid,
                    ));
                }
            }
        }
        for sub in expired {
            st.subs.remove(&sub.sid);
            sub.close_local(ClosedCause::MaxDelivered);
        }
        st.pending.append(&lines)
    }

    fn parse_info_line(line: &[u8]) -> Result<ServerInfo> {
        if line.len() < 4 || !line[..4].eq_ignore_ascii_case(b"INFO") {
            return Err(Error::Protocol(format!(
                "expected INFO, got '{}'",
                String::from_utf8_lossy(&line[..line.len().min(32)])
            )));
        }
        ServerInfo::parse(line[4..].trim_ascii())
    }

    /// 凭据优先级：URL 内嵌 > 选项。单段 userinfo 视为令牌。
    fn credentials<'a>(
        url: &'a ServerUrl,
        opts: &'a Options,
    ) -> (Option<&'a str>, Option<&'a str>, Option<&'a str>) {
        if let Some(user) = url.username() {
            match url.password() {
                Some(pass) => (Some(user), Some(pass), None),
                None => (None, None, Some(user)),
            }
        } else if let (Some(user), Some(pass)) = (opts.user.as_deref(), opts.password.as_deref()) {
            (Some(user), Some(pass), None)
        } else {
            (None, None, opts.auth_token.as_deref())
        }
    }

    fn normalize_err_text(raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        text.trim().trim_matches('\'').trim().to_string()
    }

    fn map_handshake_err(text: &str) -> Error {
        let lower = text.to_ascii_lowercase();
        if lower.contains("authorization") || lower.contains("authentication") {
            Error::AuthFailed(text.to_string())
        } else {
            Error::Protocol(text.to_string())
        }
    }

    /// 读循环：套接字 → 解析器 → 事件分发。
    fn read_loop(this: Arc<ConnInner>, read: ReadHalf, leftover: Vec<u8>, generation: u64) {
        let mut parser = Parser::new();
        let mut ctx = ReadCtx {
            inner: Arc::clone(&this),
            generation,
        };

        if !leftover.is_empty()
            && let Err(err) = parser.parse(&mut ctx, &leftover)
        {
            Self::handle_protocol_failure(&this, err);
            return;
        }

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            {
                let st = this.state.lock();
                if st.generation != generation || st.status == Status::Closed {
                    return;
                }
            }
            match read.read(&mut buf) {
                Ok(0) => {
                    let err = Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    ));
                    Self::process_op_error(&this, err, generation);
                    return;
                }
                Ok(n) => {
                    if let Err(err) = parser.parse(&mut ctx, &buf[..n]) {
                        Self::handle_protocol_failure(&this, err);
                        return;
                    }
                }
                Err(err) => {
                    Self::process_op_error(&this, err.into(), generation);
                    return;
                }
            }
        }
    }

    /// 协议解析失败：不重连，关闭连接。
    fn handle_protocol_failure(this: &Arc<ConnInner>, err: Error) {
        error!(error = %err, "protocol error, closing connection");
        this.enqueue_cb(CbTask::AsyncError(None, err.duplicate()));
        Self::close_internal(this, Some(err), false);
    }

    /// flusher 线程：等待信号，摘下挂起缓冲，锁外写出。
    fn flusher_loop(this: Arc<ConnInner>, generation: u64) {
        loop {
            let mut st = this.state.lock();
            loop {
                if st.generation != generation
                    || !matches!(
                        st.status,
                        Status::Connected | Status::DrainingSubs | Status::DrainingPubs
                    )
                {
                    return;
                }
                if !st.pending.is_empty() {
                    break;
                }
                this.flusher_cond.wait(&mut st);
            }

            let bytes = st.pending.take_all();
            let Some(write) = st.write.clone() else { return };
            let gate = this.write_gate.lock();
            drop(st);
            let result = write.write_all(&bytes);
            drop(gate);

            if let Err(err) = result {
                Self::process_op_error(&this, err.into(), generation);
                return;
            }
        }
    }

    /// 心跳定时器：按间隔计数未应答 PING，超限判定链路过期。
    fn ping_loop(this: Arc<ConnInner>, interval: Duration, generation: u64) {
        loop {
            let mut st = this.state.lock();
            if st.generation != generation
                || !matches!(
                    st.status,
                    Status::Connected | Status::DrainingSubs | Status::DrainingPubs
                )
            {
                return;
            }
            let timed_out = this.status_cond.wait_for(&mut st, interval).timed_out();
            if st.generation != generation
                || !matches!(
                    st.status,
                    Status::Connected | Status::DrainingSubs | Status::DrainingPubs
                )
            {
                return;
            }
            if !timed_out {
                continue;
            }

            st.pings_out += 1;
            if st.pings_out > this.opts.max_pings_out {
                drop(st);
                warn!("too many outstanding pings, marking connection stale");
                Self::process_op_error(&this, Error::StaleConnection, generation);
                return;
            }
            match st.pending.append(proto::PING_LINE) {
                Ok(()) => {
                    st.ping_serial += 1;
                    let _ = Self::kick_flusher(&this, st);
                }
                Err(_) => drop(st),
            }
        }
    }
}

/// 读循环的解析事件上下文。
struct ReadCtx {
    inner: Arc<ConnInner>,
    generation: u64,
}

impl Dispatcher for ReadCtx {
    fn on_msg(
        &mut self,
        subject: &str,
        reply: Option<&str>,
        sid: u64,
        payload: PayloadRef<'_>,
    ) -> Result<()> {
        self.inner.stats.record_in(payload.len());
        let sub = { self.inner.state.lock().subs.get(&sid).cloned() };
        let Some(sub) = sub else {
            // UNSUB 竞态窗口内的尾随消息，按协议丢弃。
            return Ok(());
        };
        let msg = Message::new(
            subject.to_string(),
            reply.map(str::to_string),
            payload.into_bytes(),
        );
        if SubInner::push(&sub, msg) == PushOutcome::SlowConsumer {
            ConnInner::report_sub_error(&self.inner, Some(sub), Error::SlowConsumer);
        }
        Ok(())
    }

    fn on_info(&mut self, json: &[u8]) -> Result<()> {
        let info = ServerInfo::parse(json)?;
        let added = {
            let mut st = self.inner.state.lock();
            let added = st.pool.merge_advertised(&info.connect_urls)?;
            st.info = Some(info);
            added
        };
        if added {
            self.inner.enqueue_cb(CbTask::Discovered);
        }
        Ok(())
    }

    fn on_ping(&mut self) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.pending.append(proto::PONG_LINE).is_ok() {
            let _ = ConnInner::kick_flusher(&self.inner, st);
        }
        Ok(())
    }

    fn on_pong(&mut self) -> Result<()> {
        let mut st = self.inner.state.lock();
        st.pings_out = 0;
        st.pong_serial += 1;
        while let Some((target, _)) = st.pongs.front() {
            if *target > st.pong_serial {
                break;
            }
            let (_, waiter) = st.pongs.pop_front().expect("front checked");
            waiter.complete(Ok(()));
        }
        Ok(())
    }

    fn on_ok(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_err(&mut self, text: &str) -> Result<()> {
        let normalized = ConnInner::normalize_err_text(text.as_bytes());
        let lower = normalized.to_ascii_lowercase();

        if lower.contains("stale connection") {
            ConnInner::process_op_error(&self.inner, Error::StaleConnection, self.generation);
            return Ok(());
        }
        if lower.contains("authorization") || lower.contains("authentication") {
            // 鉴权违规：关闭但不触发断连回调，经末错与关闭回调浮现。
            let err = Error::AuthViolation(normalized);
            ConnInner::close_internal(&self.inner, Some(err), true);
            return Ok(());
        }
        if lower.contains("permissions") {
            // 权限拒绝只上报，连接保持存活。
            ConnInner::report_sub_error(&self.inner, None, Error::NotPermitted(normalized));
            return Ok(());
        }
        let err = Error::Protocol(normalized);
        self.inner
            .enqueue_cb(CbTask::AsyncError(None, err.duplicate()));
        ConnInner::close_internal(&self.inner, Some(err), false);
        Ok(())
    }
}

/// 回调分发线程：串行执行用户回调，弱引用失效即退出。
fn cb_loop(weak: Weak<ConnInner>, shared: Arc<CbShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                shared.cond.wait(&mut queue);
            }
        };
        if matches!(task, CbTask::Shutdown) {
            return;
        }
        let Some(inner) = weak.upgrade() else { return };
        let conn = Connection {
            inner: Arc::clone(&inner),
        };
        match task {
            CbTask::Disconnected => {
                if let Some(cb) = &inner.opts.disconnected_cb {
                    cb(&conn);
                }
            }
            CbTask::Reconnected => {
                if let Some(cb) = &inner.opts.reconnected_cb {
                    cb(&conn);
                }
            }
            CbTask::Closed => {
                if let Some(cb) = &inner.opts.closed_cb {
                    cb(&conn);
                }
            }
            CbTask::Discovered => {
                if let Some(cb) = &inner.opts.discovered_servers_cb {
                    cb(&conn);
                }
            }
            CbTask::Connected => {
                if let Some(cb) = &inner.opts.connected_cb {
                    cb(&conn);
                }
            }
            CbTask::AsyncError(sub, err) => {
                if let Some(cb) = &inner.opts.error_cb {
                    let sub = sub.map(Subscription::from_inner);
                    cb(&conn, sub.as_ref(), &err);
                }
            }
            CbTask::Shutdown => unreachable!("handled above"),
        }
    }
}

/// 与服务器集群的一次逻辑关联。
///
/// 句柄可克隆共享；丢弃句柄本身不终结连接，显式 [`close`](Self::close)
/// 才会关闭套接字并回收全部后台线程。
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status())
            .field("url", &self.connected_url())
            .finish()
    }
}

impl Connection {
    /// 以缺省配置连接单个地址。
    pub fn connect(url: &str) -> Result<Connection> {
        Options::new().with_url(url).connect()
    }

    /// 以完整配置建立连接（[`Options::connect`] 的实现）。
    pub(crate) fn connect_with(opts: Options) -> Result<Connection> {
        let urls = opts.seed_urls()?;
        let pool = ServerPool::new(urls, opts.randomize);
        let error_stack = {
            let mut stack = ErrorStack::new(opts.error_stack_depth);
            stack.set_capture(opts.capture_error_stack);
            stack
        };

        let inner = Arc::new(ConnInner {
            opts,
            state: Mutex::new(ConnState {
                status: Status::Connecting,
                pool,
                current_url: None,
                info: None,
                write: None,
                raw: None,
                pending: ByteBuffer::with_capacity(PENDING_INITIAL_CAPACITY),
                reconnect_pending: None,
                subs: HashMap::new(),
                next_sid: 1,
                pongs: VecDeque::new(),
                ping_serial: 0,
                pong_serial: 0,
                pings_out: 0,
                last_error: None,
                error_stack,
                resp_prefix: None,
                resp_map: HashMap::new(),
                generation: 0,
                threads: Vec::new(),
                cb_thread: None,
                first_connect_pending: false,
            }),
            status_cond: Condvar::new(),
            flusher_cond: Condvar::new(),
            write_gate: Mutex::new(()),
            stats: StatsCounters::default(),
            cb: Arc::new(CbShared {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
            }),
        });

        let cb_weak = Arc::downgrade(&inner);
        let cb_shared = Arc::clone(&inner.cb);
        let cb_handle = thread::Builder::new()
            .name("flint-callbacks".into())
            .spawn(move || cb_loop(cb_weak, cb_shared))
            .expect("spawn callback thread");
        inner.state.lock().cb_thread = Some(cb_handle);

        // 初始连接：整池轮换一遍。
        let attempts = { inner.state.lock().pool.len() };
        let mut last_err: Option<Error> = None;
        let mut connected = false;
        for _ in 0..attempts {
            let url = {
                let mut st = inner.state.lock();
                let url = st.pool.select_next(None).expect("seed pool is non-empty");
                st.pool.begin_attempt();
                url
            };
            match ConnInner::connect_to_server(&inner, &url, false) {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(err) => {
                    let mut st = inner.state.lock();
                    st.pool.fail_current();
                    st.error_stack.push(format!("connect to {url}: {err}"));
                    last_err = Some(err);
                }
            }
        }

        if !connected {
            if inner.opts.retry_on_failed_connect {
                let mut st = inner.state.lock();
                st.status = Status::Reconnecting;
                st.first_connect_pending = true;
                st.last_error = Some(Error::NotYetConnected);
                let reconnect_inner = Arc::clone(&inner);
                let handle = thread::Builder::new()
                    .name("flint-reconnect".into())
                    .spawn(move || ConnInner::reconnect_loop(reconnect_inner))
                    .expect("spawn reconnect thread");
                st.threads.push(handle);
                drop(st);
                return Ok(Connection { inner });
            }
            inner.state.lock().status = Status::Closed;
            inner.enqueue_cb(CbTask::Shutdown);
            let cb_thread = { inner.state.lock().cb_thread.take() };
            if let Some(handle) = cb_thread {
                let _ = handle.join();
            }
            return Err(last_err.unwrap_or(Error::NoServer));
        }

        Ok(Connection { inner })
    }

    /// 发布一条消息。
    pub fn publish(&self, subject: &str, data: impl AsRef<[u8]>) -> Result<()> {
        self.publish_internal(subject, None, data.as_ref())
    }

    /// 发布并携带回复主题（请求应答的应答侧常用）。
    pub fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        data: impl AsRef<[u8]>,
    ) -> Result<()> {
        Self::validate_subject(reply)?;
        self.publish_internal(subject, Some(reply), data.as_ref())
    }

    fn validate_subject(subject: &str) -> Result<()> {
        if subject.is_empty() {
            return Err(Error::InvalidArg("subject cannot be empty".into()));
        }
        if subject.bytes().any(|b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n') {
            return Err(Error::InvalidArg(format!(
                "subject cannot contain whitespace: '{subject}'"
            )));
        }
        Ok(())
    }

    fn publish_internal(&self, subject: &str, reply: Option<&str>, data: &[u8]) -> Result<()> {
        Self::validate_subject(subject)?;
        let inner = &self.inner;
        let st = inner.state.lock();
        match st.status {
            Status::Closed => Err(Error::ConnectionClosed),
            Status::DrainingPubs => Err(Error::Draining),
            Status::Connecting | Status::Reconnecting => {
                let mut st = st;
                let frame = proto::encode_pub(subject, reply, data);
                let limit = inner.opts.reconnect_buf_size;
                let buffer = st.reconnect_pending.get_or_insert_with(|| {
                    ByteBuffer::with_capacity(1024).with_limit(Some(limit))
                });
                buffer.append(&frame)?;
                inner.stats.record_out(data.len());
                Ok(())
            }
            Status::Connected | Status::DrainingSubs => {
                let mut st = st;
                let max_payload = st
                    .info
                    .as_ref()
                    .map(|info| info.max_payload)
                    .unwrap_or(usize::MAX);
                if data.len() > max_payload {
                    return Err(Error::MaxPayload {
                        size: data.len(),
                        max: max_payload,
                    });
                }
                let frame = proto::encode_pub(subject, reply, data);
                st.pending.append(&frame)?;
                inner.stats.record_out(data.len());
                ConnInner::kick_flusher(inner, st)
            }
        }
    }

    /// 订阅主题（异步投递）。
    pub fn subscribe(
        &self,
        subject: &str,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.subscribe_internal(subject, None, Some(Box::new(handler)))
    }

    /// 队列组订阅（异步投递）。
    pub fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.subscribe_internal(subject, Some(queue), Some(Box::new(handler)))
    }

    /// 同步订阅：消息经 [`Subscription::next_msg`] 拉取。
    pub fn subscribe_sync(&self, subject: &str) -> Result<Subscription> {
        self.subscribe_internal(subject, None, None)
    }

    /// 同步队列组订阅。
    pub fn queue_subscribe_sync(&self, subject: &str, queue: &str) -> Result<Subscription> {
        self.subscribe_internal(subject, Some(queue), None)
    }

    fn subscribe_internal(
        &self,
        subject: &str,
        queue: Option<&str>,
        handler: Option<MessageHandler>,
    ) -> Result<Subscription> {
        Self::validate_subject(subject)?;
        if let Some(queue) = queue {
            Self::validate_subject(queue)?;
        }

        let inner = &self.inner;
        let mut st = inner.state.lock();
        match st.status {
            Status::Closed => return Err(Error::ConnectionClosed),
            Status::DrainingSubs | Status::DrainingPubs => return Err(Error::Draining),
            Status::Connecting | Status::Reconnecting | Status::Connected => {}
        }

        let sid = st.next_sid;
        st.next_sid += 1;

        // 锁序：连接锁在前，投递池锁在后。
        let worker = if handler.is_some() && inner.opts.use_global_delivery_pool {
            Some(dispatch::assign_worker())
        } else {
            None
        };
        let pooled = worker.is_some();

        let sub = SubInner::new(
            sid,
            subject.to_string(),
            queue.map(str::to_string),
            Arc::downgrade(inner),
            handler,
            worker,
            inner.opts.max_pending_msgs,
            inner.opts.max_pending_bytes,
        );
        st.subs.insert(sid, Arc::clone(&sub));

        if st.status == Status::Connected {
            st.pending.append(&proto::encode_sub(subject, queue, sid))?;
            ConnInner::kick_flusher(inner, st)?;
        }
        // Connecting/Reconnecting：订阅回放会在握手完成时统一发送。

        if sub.handler.is_some() && !pooled {
            let thread_sub = Arc::clone(&sub);
            thread::Builder::new()
                .name(format!("flint-delivery-sid{sid}"))
                .spawn(move || SubInner::delivery_loop(thread_sub))
                .map_err(|err| Error::System(format!("spawn delivery thread: {err}")))?;
        }

        Ok(Subscription::from_inner(sub))
    }

    /// 请求应答：发布请求并等待关联响应。
    ///
    /// 缺省为新式（单一通配收件箱 + 令牌关联）；`use_old_request_style`
    /// 时退化为每请求一个收件箱订阅。
    pub fn request(
        &self,
        subject: &str,
        data: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message> {
        if self.inner.opts.use_old_request_style {
            return self.request_old(subject, data.as_ref(), timeout);
        }
        self.request_new(subject, data.as_ref(), timeout)
    }

    fn request_new(&self, subject: &str, data: &[u8], timeout: Duration) -> Result<Message> {
        let prefix = match { self.inner.state.lock().resp_prefix.clone() } {
            Some(prefix) => prefix,
            None => self.setup_resp_subscription()?,
        };

        let token = inbox::next_token();
        let waiter = Arc::new(RequestWaiter::new());
        {
            let mut st = self.inner.state.lock();
            if st.status == Status::Closed {
                return Err(Error::ConnectionClosed);
            }
            if st.resp_map.len() >= MAX_CONCURRENT_REQUESTS {
                return Err(Error::IllegalState(format!(
                    "too many concurrent requests (limit {MAX_CONCURRENT_REQUESTS})"
                )));
            }
            // 令牌生成器保证进程内唯一；命中即编程错误。
            match st.resp_map.entry(token.clone()) {
                std::collections::hash_map::Entry::Occupied(_) => {
                    return Err(Error::IllegalState(format!(
                        "duplicate request token '{token}'"
                    )));
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&waiter));
                }
            }
        }

        let reply = format!("{prefix}.{token}");
        if let Err(err) = self.publish_internal(subject, Some(&reply), data) {
            self.inner.state.lock().resp_map.remove(&token);
            return Err(err);
        }

        match waiter.wait(timeout) {
            Ok(msg) => Ok(msg),
            Err(err) => {
                self.inner.state.lock().resp_map.remove(&token);
                Err(err)
            }
        }
    }

    /// 建立共享收件箱订阅 `_INBOX.<conn-token>.>`（每连接至多一次）。
    fn setup_resp_subscription(&self) -> Result<String> {
        let prefix = inbox::new_inbox();
        let wildcard = format!("{prefix}.>");
        let token_offset = prefix.len() + 1;
        let weak = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Box::new(move |msg: Message| {
            let Some(inner) = weak.upgrade() else { return };
            let token = msg.subject().get(token_offset..).unwrap_or_default();
            let waiter = { inner.state.lock().resp_map.remove(token) };
            if let Some(waiter) = waiter {
                waiter.complete(msg);
            }
        });

        let sub = self.subscribe_internal(&wildcard, None, Some(handler))?;
        let mut st = self.inner.state.lock();
        if let Some(existing) = &st.resp_prefix {
            // 并发初始化竞态：保留先到者，回收我们这份。
            let existing = existing.clone();
            drop(st);
            let _ = sub.unsubscribe();
            return Ok(existing);
        }
        st.resp_prefix = Some(prefix.clone());
        Ok(prefix)
    }

    fn request_old(&self, subject: &str, data: &[u8], timeout: Duration) -> Result<Message> {
        let reply = inbox::new_inbox();
        let sub = self.subscribe_internal(&reply, None, None)?;
        sub.auto_unsubscribe(1)?;
        self.publish_internal(subject, Some(&reply), data)?;
        let result = sub.next_msg(timeout);
        // 成功路径下 auto-unsub(1) 已经关闭了订阅；失败路径下主动回收。
        if result.is_err() {
            let _ = sub.unsubscribe();
        }
        result
    }

    /// 往返冲刷：等待在此之前发布的所有内容被服务器应答。
    pub fn flush(&self) -> Result<()> {
        self.flush_timeout(DEFAULT_FLUSH_TIMEOUT)
    }

    /// 带期限的往返冲刷。
    pub fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        let waiter = Arc::new(PongWaiter::new());
        {
            let mut st = inner.state.lock();
            match st.status {
                Status::Closed => return Err(Error::ConnectionClosed),
                Status::Connecting | Status::Reconnecting => {
                    return Err(Error::IllegalState(
                        "connection is not established".into(),
                    ));
                }
                Status::Connected | Status::DrainingSubs | Status::DrainingPubs => {}
            }
            st.pending.append(proto::PING_LINE)?;
            st.ping_serial += 1;
            let target = st.ping_serial;
            st.pongs.push_back((target, Arc::clone(&waiter)));
            if let Err(err) = ConnInner::kick_flusher(inner, st) {
                let mut st = inner.state.lock();
                st.pongs.retain(|(_, w)| !Arc::ptr_eq(w, &waiter));
                return Err(err);
            }
        }

        match waiter.wait(timeout) {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut st = inner.state.lock();
                st.pongs.retain(|(_, w)| !Arc::ptr_eq(w, &waiter));
                Err(err)
            }
        }
    }

    /// 排空连接：全部订阅并行排空 → 拒绝发布 → 冲刷 → 关闭。
    pub fn drain(&self) -> Result<()> {
        self.drain_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    /// 带期限的连接排空；到期时放弃剩余消息并以 `sub.drain_timeout`
    /// 经错误回调上报。
    pub fn drain_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let inner = &self.inner;

        let subs: Vec<Arc<SubInner>> = {
            let mut st = inner.state.lock();
            match st.status {
                Status::Closed => return Err(Error::ConnectionClosed),
                Status::DrainingSubs | Status::DrainingPubs => {
                    return Err(Error::Draining);
                }
                Status::Connecting | Status::Reconnecting => {
                    return Err(Error::IllegalState(
                        "connection is not established".into(),
                    ));
                }
                Status::Connected => {}
            }
            st.status = Status::DrainingSubs;
            let subs: Vec<Arc<SubInner>> = st.subs.values().cloned().collect();
            for sub in &subs {
                st.pending.append(&proto::encode_unsub(sub.sid, None))?;
            }
            ConnInner::kick_flusher(inner, st)?;
            subs
        };
        inner.status_cond.notify_all();

        for sub in &subs {
            sub.mark_draining();
        }
        let mut drained = true;
        for sub in &subs {
            if !sub.wait_closed(deadline) {
                drained = false;
                break;
            }
        }

        {
            let mut st = inner.state.lock();
            if st.status == Status::DrainingSubs {
                st.status = Status::DrainingPubs;
            }
        }
        inner.status_cond.notify_all();

        if !drained {
            for sub in &subs {
                ConnInner::remove_sub(inner, sub.sid);
                sub.close_local(ClosedCause::Drained);
            }
            ConnInner::report_sub_error(inner, None, Error::DrainTimeout);
            self.close();
            return Err(Error::DrainTimeout);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let _ = self.flush_timeout(remaining.max(Duration::from_millis(1)));
        self.close();
        Ok(())
    }

    /// 关闭连接。幂等：重复调用直接返回。
    pub fn close(&self) {
        ConnInner::close_internal(&self.inner, None, false);
    }

    /// 当前状态。
    pub fn status(&self) -> Status {
        self.inner.state.lock().status
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status() == Status::Reconnecting
    }

    pub fn is_draining(&self) -> bool {
        matches!(self.status(), Status::DrainingSubs | Status::DrainingPubs)
    }

    /// 当前连接的服务器地址。
    pub fn connected_url(&self) -> Option<String> {
        let st = self.inner.state.lock();
        if st.status == Status::Connected {
            st.current_url.as_ref().map(ToString::to_string)
        } else {
            None
        }
    }

    /// 当前服务器在 INFO 中宣告的 id。
    pub fn connected_server_id(&self) -> Option<String> {
        let st = self.inner.state.lock();
        if st.status == Status::Connected {
            st.info.as_ref().map(|info| info.server_id.clone())
        } else {
            None
        }
    }

    /// 服务器池全量端点（种子 + 宣告）。
    pub fn servers(&self) -> Vec<String> {
        self.inner.state.lock().pool.server_urls()
    }

    /// 仅宣告端点。
    pub fn discovered_servers(&self) -> Vec<String> {
        self.inner.state.lock().pool.discovered_urls()
    }

    /// 尚未冲刷的出站字节数（含重连暂存）。
    pub fn buffered(&self) -> usize {
        let st = self.inner.state.lock();
        st.pending.len()
            + st
                .reconnect_pending
                .as_ref()
                .map(ByteBuffer::len)
                .unwrap_or(0)
    }

    /// 服务器宣告的最大负载。
    pub fn max_payload(&self) -> usize {
        self.inner
            .state
            .lock()
            .info
            .as_ref()
            .map(|info| info.max_payload)
            .unwrap_or(0)
    }

    /// 统计快照。
    pub fn stats(&self) -> Statistics {
        self.inner.stats.snapshot()
    }

    /// 最近一次错误。
    pub fn last_error(&self) -> Option<Error> {
        self.inner
            .state
            .lock()
            .last_error
            .as_ref()
            .map(Error::duplicate)
    }

    /// 诊断错误栈（最新帧在前，超深折叠为 "N more…"）。
    pub fn error_stack(&self) -> Vec<String> {
        self.inner.state.lock().error_stack.render()
    }

    /// 生成一个新的收件箱主题。
    pub fn new_inbox(&self) -> String {
        inbox::new_inbox()
    }
}
