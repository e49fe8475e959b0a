//! 进程内模拟代理：讲线协议的最小服务器，供集成测试驱动客户端。
//!
//! 支持 INFO/CONNECT/PING/PONG/SUB/UNSUB/PUB，跨客户端路由（含 `*`/`>`
//! 通配与队列组随机负载均衡），并可脚本化鉴权失败、verbose 应答与
//! `connect_urls` 宣告。`shutdown` 归还端口号，便于在同端口重启以演练
//! 客户端重连。

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// CONNECT 一律以 `-ERR 'Authorization Violation'` 拒绝。
    pub fail_auth: bool,
    /// INFO 中宣告的 `connect_urls`。
    pub connect_urls: Vec<String>,
    /// INFO 中宣告的 `max_payload`（缺省 1MiB）。
    pub max_payload: Option<usize>,
}

struct BrokerSub {
    subject: String,
    queue: Option<String>,
    delivered: u64,
    /// UNSUB max 带来的投递上限（绝对值，非剩余）。
    max: Option<u64>,
}

struct ClientConn {
    id: u64,
    writer: Mutex<TcpStream>,
    subs: Mutex<HashMap<u64, BrokerSub>>,
}

struct BrokerShared {
    stop: AtomicBool,
    config: BrokerConfig,
    clients: Mutex<HashMap<u64, Arc<ClientConn>>>,
    next_client: Mutex<u64>,
}

pub struct MockBroker {
    port: u16,
    shared: Arc<BrokerShared>,
    accept_handle: Option<thread::JoinHandle<()>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::start(0, BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self::start(0, config)
    }

    pub fn on_port(port: u16) -> Self {
        Self::start(port, BrokerConfig::default())
    }

    fn start(port: u16, config: BrokerConfig) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).expect("bind mock broker");
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");
        let port = listener.local_addr().unwrap().port();

        let shared = Arc::new(BrokerShared {
            stop: AtomicBool::new(false),
            config,
            clients: Mutex::new(HashMap::new()),
            next_client: Mutex::new(1),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_handle = thread::spawn(move || accept_loop(listener, accept_shared));

        Self {
            port,
            shared,
            accept_handle: Some(accept_handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// 停止监听并断开全部客户端；返回端口号供同端口重启。
    pub fn shutdown(mut self) -> u16 {
        self.stop();
        self.port
    }

    fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        let clients: Vec<Arc<ClientConn>> = self.shared.clients.lock().values().cloned().collect();
        for client in clients {
            let _ = client.writer.lock().shutdown(std::net::Shutdown::Both);
        }
        // 客户端线程在套接字关闭后自行退出。
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<BrokerShared>) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nodelay(true).ok();
                let client_shared = Arc::clone(&shared);
                thread::spawn(move || client_loop(stream, client_shared));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return,
        }
    }
}

/// 行缓冲读取器：切行并按声明长度读负载。
struct FrameReader {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl FrameReader {
    fn read_line(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Some(line);
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
            }
        }
    }

    fn read_payload(&mut self, size: usize) -> Option<Vec<u8>> {
        // 负载 + 结尾 CRLF。
        while self.pending.len() < size + 2 {
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
            }
        }
        let mut frame: Vec<u8> = self.pending.drain(..size + 2).collect();
        frame.truncate(size);
        Some(frame)
    }
}

fn client_loop(stream: TcpStream, shared: Arc<BrokerShared>) {
    let writer = match stream.try_clone() {
        Ok(clone) => clone,
        Err(_) => return,
    };

    let client_id = {
        let mut next = shared.next_client.lock();
        let id = *next;
        *next += 1;
        id
    };
    let client = Arc::new(ClientConn {
        id: client_id,
        writer: Mutex::new(writer),
        subs: Mutex::new(HashMap::new()),
    });
    shared.clients.lock().insert(client_id, Arc::clone(&client));

    let max_payload = shared.config.max_payload.unwrap_or(1024 * 1024);
    let urls = shared
        .config
        .connect_urls
        .iter()
        .map(|u| format!("\"{u}\""))
        .collect::<Vec<_>>()
        .join(",");
    let info = format!(
        "INFO {{\"server_id\":\"mock-{client_id}\",\"host\":\"127.0.0.1\",\"max_payload\":{max_payload},\"connect_urls\":[{urls}]}}\r\n"
    );
    if client.writer.lock().write_all(info.as_bytes()).is_err() {
        shared.clients.lock().remove(&client_id);
        return;
    }

    let mut reader = FrameReader {
        stream,
        pending: Vec::new(),
    };
    let mut verbose = false;

    while !shared.stop.load(Ordering::SeqCst) {
        let Some(line) = reader.read_line() else { break };
        if line.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        let mut tokens = text.split_ascii_whitespace();
        let Some(verb) = tokens.next() else { continue };

        match verb.to_ascii_uppercase().as_str() {
            "CONNECT" => {
                if shared.config.fail_auth {
                    let _ = client
                        .writer
                        .lock()
                        .write_all(b"-ERR 'Authorization Violation'\r\n");
                    break;
                }
                verbose = text.contains("\"verbose\":true");
                if verbose {
                    let _ = client.writer.lock().write_all(b"+OK\r\n");
                }
            }
            "PING" => {
                let _ = client.writer.lock().write_all(b"PONG\r\n");
            }
            "PONG" => {}
            "SUB" => {
                let args: Vec<&str> = tokens.collect();
                let (subject, queue, sid) = match args.as_slice() {
                    [subject, sid] => (*subject, None, *sid),
                    [subject, queue, sid] => (*subject, Some((*queue).to_string()), *sid),
                    _ => continue,
                };
                let Ok(sid) = sid.parse::<u64>() else { continue };
                client.subs.lock().insert(
                    sid,
                    BrokerSub {
                        subject: subject.to_string(),
                        queue,
                        delivered: 0,
                        max: None,
                    },
                );
                if verbose {
                    let _ = client.writer.lock().write_all(b"+OK\r\n");
                }
            }
            "UNSUB" => {
                let args: Vec<&str> = tokens.collect();
                let Some(Ok(sid)) = args.first().map(|s| s.parse::<u64>()) else {
                    continue;
                };
                let mut subs = client.subs.lock();
                match args.get(1).map(|s| s.parse::<u64>()) {
                    // max 为累计投递上限：已达即刻移除，未达则挂账。
                    Some(Ok(max)) => {
                        if let Some(sub) = subs.get_mut(&sid) {
                            if sub.delivered >= max {
                                subs.remove(&sid);
                            } else {
                                sub.max = Some(max);
                            }
                        }
                    }
                    _ => {
                        subs.remove(&sid);
                    }
                }
                drop(subs);
                if verbose {
                    let _ = client.writer.lock().write_all(b"+OK\r\n");
                }
            }
            "PUB" => {
                let args: Vec<&str> = tokens.collect();
                let (subject, reply, size) = match args.as_slice() {
                    [subject, size] => (*subject, None, *size),
                    [subject, reply, size] => (*subject, Some((*reply).to_string()), *size),
                    _ => continue,
                };
                let Ok(size) = size.parse::<usize>() else { continue };
                let Some(payload) = reader.read_payload(size) else {
                    break;
                };
                route(&shared, subject, reply.as_deref(), &payload);
                if verbose {
                    let _ = client.writer.lock().write_all(b"+OK\r\n");
                }
            }
            _ => {
                let _ = client.writer.lock().write_all(b"-ERR 'Unknown Protocol Operation'\r\n");
            }
        }
    }

    shared.clients.lock().remove(&client_id);
}

/// 代理式路由：普通订阅全量投递，队列组随机挑一个成员。
fn route(shared: &Arc<BrokerShared>, subject: &str, reply: Option<&str>, payload: &[u8]) {
    let clients: Vec<Arc<ClientConn>> = shared.clients.lock().values().cloned().collect();

    let mut plain: Vec<(Arc<ClientConn>, u64)> = Vec::new();
    let mut queues: HashMap<String, Vec<(Arc<ClientConn>, u64)>> = HashMap::new();
    for client in &clients {
        let subs = client.subs.lock();
        for (sid, sub) in subs.iter() {
            if !subject_matches(&sub.subject, subject) {
                continue;
            }
            match &sub.queue {
                Some(queue) => queues
                    .entry(queue.clone())
                    .or_default()
                    .push((Arc::clone(client), *sid)),
                None => plain.push((Arc::clone(client), *sid)),
            }
        }
    }

    for (client, sid) in plain {
        deliver(&client, sid, subject, reply, payload);
    }
    let mut rng = rand::thread_rng();
    for (_, members) in queues {
        let (client, sid) = &members[rng.gen_range(0..members.len())];
        deliver(client, *sid, subject, reply, payload);
    }
}

fn deliver(client: &Arc<ClientConn>, sid: u64, subject: &str, reply: Option<&str>, payload: &[u8]) {
    {
        let mut subs = client.subs.lock();
        let Some(sub) = subs.get_mut(&sid) else { return };
        sub.delivered += 1;
        if let Some(max) = sub.max
            && sub.delivered >= max
        {
            subs.remove(&sid);
        }
    }

    let header = match reply {
        Some(reply) => format!("MSG {subject} {sid} {reply} {}\r\n", payload.len()),
        None => format!("MSG {subject} {sid} {}\r\n", payload.len()),
    };
    let mut frame = Vec::with_capacity(header.len() + payload.len() + 2);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    let _ = client.writer.lock().write_all(&frame);
}

/// 主题匹配：`*` 匹配单段，`>` 匹配一段及其后全部。
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let subject: Vec<&str> = subject.split('.').collect();
    for (idx, token) in pattern.iter().enumerate() {
        if *token == ">" {
            return subject.len() > idx;
        }
        if idx >= subject.len() {
            return false;
        }
        if *token != "*" && *token != subject[idx] {
            return false;
        }
    }
    pattern.len() == subject.len()
}

/// 轮询直至条件满足或超时；测试用的同步小工具。
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
