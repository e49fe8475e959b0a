//! 用户可见配置面与回调注册。
//!
//! [`Options`] 在 `connect` 时被连接取走一份不可变快照；此后修改选项
//! 不影响既有连接。回调以 `Arc<dyn Fn>` 保存，连接内部的回调队列按注册
//! 顺序串行调用（同一连接的回调从不并发）。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::subscription::Subscription;
use crate::url::ServerUrl;

/// 连接生命周期回调（断开、重连、关闭、发现新服务器、异步首连成功）。
pub type ConnHandler = Arc<dyn Fn(&Connection) + Send + Sync + 'static>;
/// 异步错误回调；`Option<&Subscription>` 在错误可归因于某订阅时携带之。
pub type ErrHandler = Arc<dyn Fn(&Connection, Option<&Subscription>, &Error) + Send + Sync + 'static>;
/// 订阅消息处理器。
pub type MessageHandler = Box<dyn Fn(Message) + Send + Sync + 'static>;

/// DNS 解析结果的地址族过滤与排序策略。
///
/// 配置值沿用约定编码：`0`＝不干预，`4`/`6`＝仅保留对应族，
/// `46`/`64`＝两族都保留但调整先后次序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpResolutionOrder {
    #[default]
    Any,
    Ipv4Only,
    Ipv6Only,
    Ipv4First,
    Ipv6First,
}

impl IpResolutionOrder {
    /// 由配置编码构造；非法编码返回 `arg.invalid`。
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::Any),
            4 => Ok(Self::Ipv4Only),
            6 => Ok(Self::Ipv6Only),
            46 => Ok(Self::Ipv4First),
            64 => Ok(Self::Ipv6First),
            other => Err(Error::InvalidArg(format!(
                "ip resolution order must be one of 0/4/6/46/64, got {other}"
            ))),
        }
    }
}

/// TLS 安全姿态。
///
/// `secure` 或服务器 INFO 宣告 `tls_required` 时启用；信任锚要么来自
/// `ca_file`，要么通过 `skip_verify` 显式放弃校验。
#[derive(Debug, Clone, Default)]
pub struct TlsPosture {
    pub(crate) secure: bool,
    pub(crate) skip_verify: bool,
    pub(crate) ca_file: Option<String>,
    pub(crate) client_cert: Option<(String, String)>,
    pub(crate) expected_hostname: Option<String>,
}

impl TlsPosture {
    pub(crate) fn wants_tls(&self) -> bool {
        self.secure
            || self.skip_verify
            || self.ca_file.is_some()
            || self.client_cert.is_some()
            || self.expected_hostname.is_some()
    }
}

/// 连接配置。
///
/// # 教案式说明
/// - **意图 (Why)**：把握手身份、重连策略、投递上限与 TLS 姿态集中为
///   单一不可变快照，使连接各线程读取配置时无需加锁；
/// - **契约 (What)**：
///   - 所有 `with_*` 方法按值消费并返回 `Options`，支持链式拼装；
///   - [`connect`](Self::connect) 校验种子列表非空后移交连接构造；
///   - 时间类配置以 [`Duration`] 表达；`ping_interval` 为 `None` 时停用
///     心跳，`max_reconnect` 为 `None` 时按服务器无限重试；
/// - **权衡 (Trade-offs)**：快照语义牺牲运行期热更新能力，换取稳态
///   路径的零同步开销；需要调整配置时以新选项重建连接。
#[derive(Clone)]
pub struct Options {
    pub(crate) servers: Vec<String>,
    pub(crate) randomize: bool,
    pub(crate) name: Option<String>,
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) no_echo: bool,
    pub(crate) timeout: Duration,
    pub(crate) reconnect_wait: Duration,
    /// 按服务器的重连尝试上限；`None` 表示无限。
    pub(crate) max_reconnect: Option<u32>,
    pub(crate) reconnect_buf_size: usize,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) max_pings_out: u32,
    pub(crate) max_pending_msgs: usize,
    pub(crate) max_pending_bytes: usize,
    pub(crate) retry_on_failed_connect: bool,
    pub(crate) send_asap: bool,
    pub(crate) use_old_request_style: bool,
    pub(crate) use_global_delivery_pool: bool,
    pub(crate) ip_resolution_order: IpResolutionOrder,
    pub(crate) tls: TlsPosture,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) auth_token: Option<String>,
    pub(crate) error_stack_depth: usize,
    pub(crate) capture_error_stack: bool,

    pub(crate) disconnected_cb: Option<ConnHandler>,
    pub(crate) reconnected_cb: Option<ConnHandler>,
    pub(crate) closed_cb: Option<ConnHandler>,
    pub(crate) discovered_servers_cb: Option<ConnHandler>,
    pub(crate) connected_cb: Option<ConnHandler>,
    pub(crate) error_cb: Option<ErrHandler>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            randomize: true,
            name: None,
            verbose: false,
            pedantic: false,
            no_echo: false,
            timeout: Duration::from_secs(2),
            reconnect_wait: Duration::from_secs(2),
            max_reconnect: Some(60),
            reconnect_buf_size: 8 * 1024 * 1024,
            ping_interval: Some(Duration::from_secs(120)),
            max_pings_out: 2,
            max_pending_msgs: 65536,
            max_pending_bytes: 64 * 1024 * 1024,
            retry_on_failed_connect: false,
            send_asap: false,
            use_old_request_style: false,
            use_global_delivery_pool: false,
            ip_resolution_order: IpResolutionOrder::Any,
            tls: TlsPosture::default(),
            user: None,
            password: None,
            auth_token: None,
            error_stack_depth: 16,
            capture_error_stack: true,
            disconnected_cb: None,
            reconnected_cb: None,
            closed_cb: None,
            discovered_servers_cb: None,
            connected_cb: None,
            error_cb: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设定单一种子地址（覆盖既有列表）。
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.servers = vec![url.into()];
        self
    }

    /// 设定种子地址列表（覆盖既有列表）。
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// 保持种子顺序，不做初始洗牌。
    pub fn no_randomize(mut self) -> Self {
        self.randomize = false;
        self
    }

    /// 客户端标识，写入 CONNECT 的 `name` 字段。
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 要求服务器对每条指令回 `+OK`。
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// 要求服务器执行严格协议检查。
    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    /// 抑制本连接发布的消息回流到自身订阅。
    pub fn no_echo(mut self, no_echo: bool) -> Self {
        self.no_echo = no_echo;
        self
    }

    /// 拨号 + 握手的总时限。
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 同一服务器两次尝试之间的冷却时长。
    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    /// 按服务器的重连尝试上限；`None` 表示无限重试。
    pub fn with_max_reconnect(mut self, max: Option<u32>) -> Self {
        self.max_reconnect = max;
        self
    }

    /// 断连期间保留发布流量的缓冲上限（字节）。
    pub fn with_reconnect_buf_size(mut self, size: usize) -> Self {
        self.reconnect_buf_size = size;
        self
    }

    /// 心跳间隔；`None` 停用心跳。
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    /// 未应答 PING 的上限，超出即判定链路过期。
    pub fn with_max_pings_out(mut self, max: u32) -> Self {
        self.max_pings_out = max;
        self
    }

    /// 默认的订阅挂起消息数上限。
    pub fn with_max_pending_msgs(mut self, max: usize) -> Self {
        self.max_pending_msgs = max;
        self
    }

    /// 默认的订阅挂起字节数上限。
    pub fn with_max_pending_bytes(mut self, max: usize) -> Self {
        self.max_pending_bytes = max;
        self
    }

    /// 首连失败时按重连策略后台重试，`connect` 立即返回
    /// `conn.not_yet_connected`。
    pub fn retry_on_failed_connect(mut self, retry: bool) -> Self {
        self.retry_on_failed_connect = retry;
        self
    }

    /// 旁路 flusher，发布路径同步写套接字（低延迟、低吞吐）。
    pub fn send_asap(mut self, enabled: bool) -> Self {
        self.send_asap = enabled;
        self
    }

    /// 每次请求独立建收件箱订阅的旧式请求应答。
    pub fn use_old_request_style(mut self, enabled: bool) -> Self {
        self.use_old_request_style = enabled;
        self
    }

    /// 异步订阅共享库级投递线程池，而非每订阅一线程。
    pub fn use_global_delivery_pool(mut self, enabled: bool) -> Self {
        self.use_global_delivery_pool = enabled;
        self
    }

    /// DNS 解析的地址族策略。
    pub fn with_ip_resolution_order(mut self, order: IpResolutionOrder) -> Self {
        self.ip_resolution_order = order;
        self
    }

    /// 无条件启用 TLS（即使服务器未宣告 `tls_required`）。
    pub fn secure(mut self, secure: bool) -> Self {
        self.tls.secure = secure;
        self
    }

    /// 跳过服务器证书校验（仅限测试环境）。
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.tls.skip_verify = skip;
        self
    }

    /// 信任锚 PEM 文件。设置后隐含启用 TLS。
    pub fn with_ca_file(mut self, path: impl Into<String>) -> Self {
        self.tls.ca_file = Some(path.into());
        self
    }

    /// 客户端证书与私钥的 PEM 文件对。
    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<String>,
        key_path: impl Into<String>,
    ) -> Self {
        self.tls.client_cert = Some((cert_path.into(), key_path.into()));
        self
    }

    /// 证书主机名校验与 SNI 采用此主机名而非 URL 主机。
    pub fn with_expected_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.tls.expected_hostname = Some(hostname.into());
        self
    }

    /// 用户名/口令凭据（优先级低于 URL 内嵌凭据）。
    pub fn with_user_info(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// 令牌凭据。
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// 诊断错误栈的保留深度。
    pub fn with_error_stack_depth(mut self, depth: usize) -> Self {
        self.error_stack_depth = depth.max(1);
        self
    }

    /// 关闭错误栈帧采集（热路径仍保留末错）。
    pub fn capture_error_stack(mut self, capture: bool) -> Self {
        self.capture_error_stack = capture;
        self
    }

    /// 连接断开（将重连）时回调。鉴权违规导致的关闭不触发。
    pub fn with_disconnected_callback(
        mut self,
        cb: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> Self {
        self.disconnected_cb = Some(Arc::new(cb));
        self
    }

    /// 重连成功后回调。
    pub fn with_reconnected_callback(
        mut self,
        cb: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> Self {
        self.reconnected_cb = Some(Arc::new(cb));
        self
    }

    /// 连接进入终态后回调（最后一次回调）。
    pub fn with_closed_callback(
        mut self,
        cb: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> Self {
        self.closed_cb = Some(Arc::new(cb));
        self
    }

    /// 服务器池因 INFO 宣告而扩张时回调。
    pub fn with_discovered_servers_callback(
        mut self,
        cb: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> Self {
        self.discovered_servers_cb = Some(Arc::new(cb));
        self
    }

    /// 配合 `retry_on_failed_connect`：后台首连成功时回调。
    pub fn with_connected_callback(
        mut self,
        cb: impl Fn(&Connection) + Send + Sync + 'static,
    ) -> Self {
        self.connected_cb = Some(Arc::new(cb));
        self
    }

    /// 异步错误回调（慢消费者、权限违规、排空超时等）。
    pub fn with_error_callback(
        mut self,
        cb: impl Fn(&Connection, Option<&Subscription>, &Error) + Send + Sync + 'static,
    ) -> Self {
        self.error_cb = Some(Arc::new(cb));
        self
    }

    /// 以当前配置建立连接。
    pub fn connect(self) -> Result<Connection> {
        Connection::connect_with(self)
    }

    /// 解析种子列表；空列表即 `arg.invalid`。
    pub(crate) fn seed_urls(&self) -> Result<Vec<ServerUrl>> {
        if self.servers.is_empty() {
            return Err(Error::InvalidArg("no server url configured".into()));
        }
        self.servers.iter().map(|s| ServerUrl::parse(s)).collect()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("servers", &self.servers)
            .field("randomize", &self.randomize)
            .field("name", &self.name)
            .field("verbose", &self.verbose)
            .field("pedantic", &self.pedantic)
            .field("no_echo", &self.no_echo)
            .field("timeout", &self.timeout)
            .field("reconnect_wait", &self.reconnect_wait)
            .field("max_reconnect", &self.max_reconnect)
            .field("reconnect_buf_size", &self.reconnect_buf_size)
            .field("ping_interval", &self.ping_interval)
            .field("max_pings_out", &self.max_pings_out)
            .field("max_pending_msgs", &self.max_pending_msgs)
            .field("max_pending_bytes", &self.max_pending_bytes)
            .field("retry_on_failed_connect", &self.retry_on_failed_connect)
            .field("send_asap", &self.send_asap)
            .field("use_old_request_style", &self.use_old_request_style)
            .field("use_global_delivery_pool", &self.use_global_delivery_pool)
            .field("ip_resolution_order", &self.ip_resolution_order)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}
