//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为客户端对外暴露的错误语义提供集中定义，覆盖参数校验、连接生命周期、
//!   I/O、协议解析、鉴权与 TLS 等全部故障域；
//! - 每个变体绑定一枚稳定错误码（`<域>.<语义>` 约定，见 [`codes`]），
//!   方便日志、指标与告警系统执行精确的自动化治理。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error` 以兼容 `std::error::Error`；
//! - 可恢复错误以返回值形式交还调用方，异步事件（慢消费者、权限违规、
//!   连接过期）经由错误回调送达；
//! - 连接额外维护一份诊断用的有界错误栈（[`ErrorStack`]），超出深度的
//!   旧帧以 "N more…" 摘要保留。
//!
//! ## 扩展建议（How）
//! - 新增变体时必须同步补充 [`codes`] 常量与 [`Error::code`] 映射；
//! - 热路径可调用 [`ErrorStack::set_capture`] 关闭帧采集，仅保留末错。

use std::collections::VecDeque;
use std::io;

use thiserror::Error;

/// 稳定错误码，命名遵循 `<域>.<语义>` 约定。
///
/// 调用方不应解析 [`Error`] 的展示文本做分支判断，而应通过
/// [`Error::code`] 取得此处的常量进行匹配。
pub mod codes {
    pub const ARG_INVALID: &str = "arg.invalid";
    pub const STATE_ILLEGAL: &str = "state.illegal";
    pub const CONN_CLOSED: &str = "conn.closed";
    pub const CONN_DRAINING: &str = "conn.draining";
    pub const CONN_STALE: &str = "conn.stale";
    pub const CONN_NOT_YET_CONNECTED: &str = "conn.not_yet_connected";
    pub const SUB_INVALID: &str = "sub.invalid";
    pub const SUB_SLOW_CONSUMER: &str = "sub.slow_consumer";
    pub const SUB_MAX_DELIVERED: &str = "sub.max_delivered";
    pub const SUB_DRAIN_TIMEOUT: &str = "sub.drain_timeout";
    pub const MEM_NO_MEMORY: &str = "mem.no_memory";
    pub const BUFFER_INSUFFICIENT: &str = "buffer.insufficient";
    pub const IO_ERROR: &str = "io.error";
    pub const IO_SYSTEM: &str = "io.system";
    pub const IO_TIMEOUT: &str = "io.timeout";
    pub const POOL_NO_SERVER: &str = "pool.no_server";
    pub const PROTO_ERROR: &str = "proto.error";
    pub const MSG_MAX_PAYLOAD: &str = "msg.max_payload";
    pub const AUTH_FAILED: &str = "auth.failed";
    pub const AUTH_VIOLATION: &str = "auth.violation";
    pub const AUTH_NOT_PERMITTED: &str = "auth.not_permitted";
    pub const TLS_ERROR: &str = "tls.error";
}

/// 客户端统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合连接生命周期、订阅投递、请求应答等关键路径的
///   异常，并以稳定错误码驱动调用方的重试 / 熔断决策；
/// - **契约 (What)**：
///   - 所有变体均满足 `Send + Sync + 'static`，可安全跨线程传播；
///   - [`Error::code`] 返回的码值在次要版本内保持稳定；
///   - 携带底层 `io::Error` 的变体通过 `source()` 暴露完整根因链路。
/// - **执行逻辑 (How)**：连接内部以 `Result<T, Error>` + `?` 逐层上抛，
///   读循环与 flusher 线程在出错时将错误记入连接末错与错误栈，再交由
///   重连引擎或关闭流程分类处置。
/// - **设计权衡 (Trade-offs)**：使用 `String` 保存上下文，牺牲少量堆分配
///   换取排障可读性；若未来需要零分配，可引入 `Cow<'static, str>` 版本。
#[derive(Debug, Error)]
pub enum Error {
    /// 调用方传入的参数不满足前置条件（空主题、非法超时等）。
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// 当前连接状态不允许该操作。
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// 连接已关闭，所有阻塞等待者均以该错误被唤醒。
    #[error("connection closed")]
    ConnectionClosed,

    /// 订阅已失效（已关闭、已取消或已达到自动退订上限后再次使用）。
    #[error("invalid subscription")]
    InvalidSubscription,

    /// 连接处于排空阶段，拒绝新的订阅或发布。
    #[error("connection is draining")]
    Draining,

    /// 有界容器拒绝继续增长（`try_reserve` 失败）。
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// 重连缓冲区容量不足，本次发布被拒绝。
    #[error("insufficient buffer: need {needed} bytes, capacity {capacity}")]
    InsufficientBuffer { needed: usize, capacity: usize },

    /// 订阅队列达到挂起上限，后续消息被丢弃。
    ///
    /// 每个连续的慢消费阶段仅经错误回调报告一次，队列回落到上限以下后
    /// 重新武装。
    #[error("slow consumer, messages dropped")]
    SlowConsumer,

    /// 自动退订上限已达成，订阅不再投递。
    #[error("maximum messages delivered")]
    MaxDeliveredMsgs,

    /// 排空操作超出调用方给定的期限，剩余消息被放弃。
    #[error("drain of subscription timed out")]
    DrainTimeout,

    /// 底层套接字 I/O 失败。
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),

    /// 操作系统层面的失败（地址解析、套接字选项设置等）。
    #[error("system error: {0}")]
    System(String),

    /// 操作在期限内未完成。
    #[error("timeout")]
    Timeout,

    /// 服务器池全部耗尽，没有可再尝试的端点。
    #[error("no servers available for connection")]
    NoServer,

    /// 启用 `retry_on_failed_connect` 后，首次连接仍在后台重试。
    #[error("not yet connected")]
    NotYetConnected,

    /// 协议解析失败或服务器返回未知的协议级错误；连接将被关闭。
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 链路被判定为过期（PING 未应答或服务器宣告），触发重连。
    #[error("stale connection")]
    StaleConnection,

    /// 负载超过服务器宣告的上限，发布被同步拒绝。
    #[error("maximum payload exceeded: {size} > {max}")]
    MaxPayload { size: usize, max: usize },

    /// 鉴权失败（凭据错误或过期）。
    #[error("authorization failed: {0}")]
    AuthFailed(String),

    /// 服务器宣告的鉴权违规，连接关闭且不触发断连回调。
    #[error("authorization violation: {0}")]
    AuthViolation(String),

    /// 发布或订阅被服务器的权限规则拒绝；连接保持存活。
    #[error("permissions violation: {0}")]
    NotPermitted(String),

    /// TLS 配置或握手失败。
    #[error("tls error: {0}")]
    Tls(String),
}

impl Error {
    /// 返回与变体绑定的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArg(_) => codes::ARG_INVALID,
            Error::IllegalState(_) => codes::STATE_ILLEGAL,
            Error::ConnectionClosed => codes::CONN_CLOSED,
            Error::InvalidSubscription => codes::SUB_INVALID,
            Error::Draining => codes::CONN_DRAINING,
            Error::NoMemory(_) => codes::MEM_NO_MEMORY,
            Error::InsufficientBuffer { .. } => codes::BUFFER_INSUFFICIENT,
            Error::SlowConsumer => codes::SUB_SLOW_CONSUMER,
            Error::MaxDeliveredMsgs => codes::SUB_MAX_DELIVERED,
            Error::DrainTimeout => codes::SUB_DRAIN_TIMEOUT,
            Error::Io(_) => codes::IO_ERROR,
            Error::System(_) => codes::IO_SYSTEM,
            Error::Timeout => codes::IO_TIMEOUT,
            Error::NoServer => codes::POOL_NO_SERVER,
            Error::NotYetConnected => codes::CONN_NOT_YET_CONNECTED,
            Error::Protocol(_) => codes::PROTO_ERROR,
            Error::StaleConnection => codes::CONN_STALE,
            Error::MaxPayload { .. } => codes::MSG_MAX_PAYLOAD,
            Error::AuthFailed(_) => codes::AUTH_FAILED,
            Error::AuthViolation(_) => codes::AUTH_VIOLATION,
            Error::NotPermitted(_) => codes::AUTH_NOT_PERMITTED,
            Error::Tls(_) => codes::TLS_ERROR,
        }
    }

    /// 判断错误是否应触发重连而非关闭连接。
    pub(crate) fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout | Error::StaleConnection | Error::System(_)
        )
    }

    /// 复制一份语义等价的错误，用于同时写入连接末错与返回给调用方。
    ///
    /// `io::Error` 不可克隆，此处降级为保留 `ErrorKind` 与展示文本。
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::InvalidArg(s) => Error::InvalidArg(s.clone()),
            Error::IllegalState(s) => Error::IllegalState(s.clone()),
            Error::ConnectionClosed => Error::ConnectionClosed,
            Error::InvalidSubscription => Error::InvalidSubscription,
            Error::Draining => Error::Draining,
            Error::NoMemory(s) => Error::NoMemory(s.clone()),
            Error::InsufficientBuffer { needed, capacity } => Error::InsufficientBuffer {
                needed: *needed,
                capacity: *capacity,
            },
            Error::SlowConsumer => Error::SlowConsumer,
            Error::MaxDeliveredMsgs => Error::MaxDeliveredMsgs,
            Error::DrainTimeout => Error::DrainTimeout,
            Error::Io(err) => Error::Io(io::Error::new(err.kind(), err.to_string())),
            Error::System(s) => Error::System(s.clone()),
            Error::Timeout => Error::Timeout,
            Error::NoServer => Error::NoServer,
            Error::NotYetConnected => Error::NotYetConnected,
            Error::Protocol(s) => Error::Protocol(s.clone()),
            Error::StaleConnection => Error::StaleConnection,
            Error::MaxPayload { size, max } => Error::MaxPayload {
                size: *size,
                max: *max,
            },
            Error::AuthFailed(s) => Error::AuthFailed(s.clone()),
            Error::AuthViolation(s) => Error::AuthViolation(s.clone()),
            Error::NotPermitted(s) => Error::NotPermitted(s.clone()),
            Error::Tls(s) => Error::Tls(s.clone()),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Io(err),
        }
    }
}

/// 客户端统一结果别名。
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// 有界深度的诊断错误栈。
///
/// # 教案式说明
/// - **意图 (Why)**：排障时往往需要末错之前的若干帧上下文（例如重连
///   期间每台服务器的失败原因），但无界积累会在长时间断连下泄漏内存；
/// - **契约 (What)**：
///   - 栈最多保留 `depth` 帧，更早的帧折叠为一条 "N more…" 摘要；
///   - [`set_capture`](Self::set_capture) 关闭采集后 `push` 变为空操作，
///     供热路径（每条消息的慢消费判定）使用；
/// - **执行逻辑 (How)**：`VecDeque` 头部为最新帧；溢出时从尾部淘汰并
///   累加 `summarized` 计数。
#[derive(Debug)]
pub(crate) struct ErrorStack {
    frames: VecDeque<String>,
    depth: usize,
    summarized: u64,
    capture: bool,
}

impl ErrorStack {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(depth),
            depth,
            summarized: 0,
            capture: true,
        }
    }

    pub(crate) fn set_capture(&mut self, capture: bool) {
        self.capture = capture;
    }

    pub(crate) fn push(&mut self, frame: String) {
        if !self.capture {
            return;
        }
        if self.frames.len() == self.depth {
            self.frames.pop_back();
            self.summarized += 1;
        }
        self.frames.push_front(frame);
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
        self.summarized = 0;
    }

    /// 渲染当前栈内容，最新帧在前。
    pub(crate) fn render(&self) -> Vec<String> {
        let mut out: Vec<String> = self.frames.iter().cloned().collect();
        if self.summarized > 0 {
            out.push(format!("{} more…", self.summarized));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_per_variant() {
        // Why: 调用方依赖码值分支，变体与码的映射必须一一对应。
        assert_eq!(Error::ConnectionClosed.code(), codes::CONN_CLOSED);
        assert_eq!(Error::Timeout.code(), codes::IO_TIMEOUT);
        assert_eq!(
            Error::MaxPayload { size: 2, max: 1 }.code(),
            codes::MSG_MAX_PAYLOAD
        );
        assert_eq!(
            Error::NotPermitted("publish to foo".into()).code(),
            codes::AUTH_NOT_PERMITTED
        );
    }

    #[test]
    fn io_timeout_maps_to_timeout_variant() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(err, Error::Timeout));
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "rst").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn stack_folds_overflow_into_summary() {
        // Why: 超深帧折叠为 "N more…"，避免长时间断连时内存无界增长。
        let mut stack = ErrorStack::new(3);
        for i in 0..5 {
            stack.push(format!("frame-{i}"));
        }
        let rendered = stack.render();
        assert_eq!(
            rendered,
            vec![
                "frame-4".to_string(),
                "frame-3".to_string(),
                "frame-2".to_string(),
                "2 more…".to_string()
            ]
        );
    }

    #[test]
    fn stack_capture_can_be_disabled() {
        let mut stack = ErrorStack::new(2);
        stack.set_capture(false);
        stack.push("dropped".into());
        assert!(stack.render().is_empty());
    }
}
