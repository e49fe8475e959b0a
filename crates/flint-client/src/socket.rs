//! 套接字层：限期拨号、地址族排序、TLS 包装与读写半部。
//!
//! 明文 TCP 的读写半部共享同一 `Arc<TcpStream>`（标准库允许经 `&TcpStream`
//! 并发读写）；TLS 会话不可拆分，读写半部共享互斥的 `StreamOwned`，读侧
//! 以有界超时持锁，在两次读取之间让出给写侧。

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme, StreamOwned};
use socket2::SockRef;
use tracing::debug;

use crate::error::{Error, Result};
use crate::options::{IpResolutionOrder, TlsPosture};
use crate::url::ServerUrl;

/// TLS 读侧的持锁读取上限；到期释放锁让 flusher 插入写操作。
const TLS_READ_SLICE: Duration = Duration::from_millis(50);

pub(crate) type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// 按配置的地址族策略解析并排序拨号地址。
fn resolve(addr: &str, order: IpResolutionOrder) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|err| Error::System(format!("resolving {addr}: {err}")))?
        .collect();

    let mut v4: Vec<SocketAddr> = addrs.iter().copied().filter(SocketAddr::is_ipv4).collect();
    let mut v6: Vec<SocketAddr> = addrs.iter().copied().filter(SocketAddr::is_ipv6).collect();

    let ordered = match order {
        IpResolutionOrder::Any => addrs,
        IpResolutionOrder::Ipv4Only => v4,
        IpResolutionOrder::Ipv6Only => v6,
        IpResolutionOrder::Ipv4First => {
            v4.append(&mut v6);
            v4
        }
        IpResolutionOrder::Ipv6First => {
            v6.append(&mut v4);
            v6
        }
    };
    if ordered.is_empty() {
        return Err(Error::System(format!("no usable addresses for {addr}")));
    }
    Ok(ordered)
}

/// 限期拨号：逐地址尝试，整体受 `timeout` 约束。
pub(crate) fn dial(
    url: &ServerUrl,
    order: IpResolutionOrder,
    timeout: Duration,
) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    let addrs = resolve(&url.dial_addr(), order)?;

    let mut last_err: Option<Error> = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(last_err.unwrap_or(Error::Timeout));
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => {
                // 协议帧细碎，关闭 Nagle 降低发布延迟。
                if let Err(err) = SockRef::from(&stream).set_tcp_nodelay(true) {
                    debug!(%addr, error = %err, "failed to set TCP_NODELAY");
                }
                return Ok(stream);
            }
            Err(err) => {
                debug!(%addr, error = %err, "dial attempt failed");
                last_err = Some(err.into());
            }
        }
    }
    Err(last_err.unwrap_or(Error::NoServer))
}

/// 跳过证书校验的 posture（`skip_verify`）。
///
/// 仅验证报文结构，不验证信任链与主机名；签名校验同样放行，因为没有
/// 可信锚可言。生产环境应配置 `ca` 而非启用此模式。
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// 由 TLS posture 构造 rustls 客户端配置。
///
/// 信任锚必须显式给出（`ca`）或显式放弃（`skip_verify`）；两者皆缺时
/// 直接报错，不会静默回落到空信任库。
pub(crate) fn build_tls_config(posture: &TlsPosture) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder();

    let config = if posture.skip_verify {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
    } else {
        let Some(ca_path) = &posture.ca_file else {
            return Err(Error::Tls(
                "tls requires a ca file unless skip_verify is set".into(),
            ));
        };
        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_file_iter(ca_path)
            .map_err(|err| Error::Tls(format!("reading ca file {ca_path}: {err}")))?
        {
            let cert = cert.map_err(|err| Error::Tls(format!("parsing ca file {ca_path}: {err}")))?;
            roots
                .add(cert)
                .map_err(|err| Error::Tls(format!("adding ca certificate: {err}")))?;
        }
        builder.with_root_certificates(roots)
    };

    let config = match &posture.client_cert {
        Some((cert_path, key_path)) => {
            let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
                .map_err(|err| Error::Tls(format!("reading cert file {cert_path}: {err}")))?
                .collect::<std::result::Result<_, _>>()
                .map_err(|err| Error::Tls(format!("parsing cert file {cert_path}: {err}")))?;
            let key = PrivateKeyDer::from_pem_file(key_path)
                .map_err(|err| Error::Tls(format!("reading key file {key_path}: {err}")))?;
            config
                .with_client_auth_cert(certs, key)
                .map_err(|err| Error::Tls(format!("client certificate rejected: {err}")))?
        }
        None => config.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// 握手阶段的统一套接字（尚未拆分读写半部）。
pub(crate) struct Socket {
    inner: SocketInner,
    /// 原始 TCP 句柄的克隆，供关闭唤醒与超时设置使用。
    raw: TcpStream,
}

enum SocketInner {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl Socket {
    pub(crate) fn plain(stream: TcpStream) -> Result<Socket> {
        let raw = stream.try_clone().map_err(Error::Io)?;
        Ok(Socket {
            inner: SocketInner::Plain(stream),
            raw,
        })
    }

    /// 把既有明文套接字升级为 TLS。
    ///
    /// `server_name` 为 SNI 与证书主机名校验的依据（`expected_hostname`
    /// 覆盖 URL 主机）。
    pub(crate) fn upgrade_tls(self, config: Arc<ClientConfig>, server_name: &str) -> Result<Socket> {
        let SocketInner::Plain(stream) = self.inner else {
            return Err(Error::IllegalState("socket already wrapped in tls".into()));
        };
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|err| Error::Tls(format!("invalid server name {server_name}: {err}")))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|err| Error::Tls(format!("tls session setup: {err}")))?;
        Ok(Socket {
            inner: SocketInner::Tls(Box::new(StreamOwned::new(conn, stream))),
            raw: self.raw,
        })
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.raw.set_read_timeout(timeout).map_err(Error::Io)
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            SocketInner::Plain(stream) => stream.read(buf),
            SocketInner::Tls(stream) => stream.read(buf),
        }
    }

    pub(crate) fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match &mut self.inner {
            SocketInner::Plain(stream) => stream.write_all(buf),
            SocketInner::Tls(stream) => {
                stream.write_all(buf)?;
                stream.flush()
            }
        }
    }

    /// 拆分为读写半部；返回的裸句柄用于 `close`/`drain` 时解除阻塞读。
    pub(crate) fn split(self) -> Result<(ReadHalf, WriteHalf, Arc<TcpStream>)> {
        match self.inner {
            SocketInner::Plain(stream) => {
                // 稳态下读侧无限期阻塞，关闭依赖 shutdown 唤醒。
                stream.set_read_timeout(None).map_err(Error::Io)?;
                let shared = Arc::new(stream);
                Ok((
                    ReadHalf::Plain(Arc::clone(&shared)),
                    WriteHalf::Plain(Arc::clone(&shared)),
                    shared,
                ))
            }
            SocketInner::Tls(stream) => {
                // TLS 读侧持锁读取，必须有界，否则写侧会被饿死。
                self.raw
                    .set_read_timeout(Some(TLS_READ_SLICE))
                    .map_err(Error::Io)?;
                let raw = Arc::new(self.raw);
                let shared = Arc::new(Mutex::new(*stream));
                Ok((
                    ReadHalf::Tls(Arc::clone(&shared)),
                    WriteHalf::Tls(shared),
                    raw,
                ))
            }
        }
    }
}

/// 读半部。读循环线程独占使用。
#[derive(Clone)]
pub(crate) enum ReadHalf {
    Plain(Arc<TcpStream>),
    Tls(Arc<Mutex<TlsStream>>),
}

impl ReadHalf {
    /// 阻塞读取一段字节；返回 0 表示对端关闭。
    ///
    /// TLS 路径在每个 50ms 读片后释放会话锁并重试，使写侧得以插入；
    /// 上层关闭通过对裸句柄 `shutdown` 让本调用立即返回。
    pub(crate) fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ReadHalf::Plain(stream) => (&mut &**stream).read(buf),
            ReadHalf::Tls(shared) => loop {
                let mut guard = shared.lock();
                match guard.read(buf) {
                    Ok(n) => return Ok(n),
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        drop(guard);
                        std::thread::yield_now();
                    }
                    Err(err) => return Err(err),
                }
            },
        }
    }
}

/// 写半部。flusher 线程与 send-asap 快路径共享（克隆廉价）。
#[derive(Clone)]
pub(crate) enum WriteHalf {
    Plain(Arc<TcpStream>),
    Tls(Arc<Mutex<TlsStream>>),
}

impl WriteHalf {
    pub(crate) fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            WriteHalf::Plain(stream) => (&mut &**stream).write_all(buf),
            WriteHalf::Tls(shared) => {
                let mut guard = shared.lock();
                guard.write_all(buf)?;
                guard.flush()
            }
        }
    }
}

/// 解除读循环的阻塞读并丢弃双向流量。关闭与重连路径共用。
pub(crate) fn shutdown_socket(raw: &TcpStream) {
    let _ = raw.shutdown(Shutdown::Both);
}

/// 握手期的行读取器：按 `\n` 切行，保留行后多余字节供解析器续用。
///
/// 握手结束后经 [`take_leftover`](Self::take_leftover) 取回剩余字节，
/// 保证服务器在 PONG 之后立刻推送的帧不丢失。
pub(crate) struct LineReader {
    pending: Vec<u8>,
}

impl LineReader {
    pub(crate) fn new() -> Self {
        Self {
            pending: Vec::with_capacity(1024),
        }
    }

    /// 读取一个以 `\n` 结尾的完整行（剔除行尾 CRLF），受 `deadline` 约束。
    pub(crate) fn read_line(&mut self, sock: &mut Socket, deadline: Instant) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            sock.set_read_timeout(Some(remaining))?;

            let mut chunk = [0u8; 1024];
            match sock.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during handshake",
                    )));
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(Error::Timeout);
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }

    /// 握手完成后取回尚未消费的字节。
    pub(crate) fn take_leftover(self) -> Vec<u8> {
        self.pending
    }
}
