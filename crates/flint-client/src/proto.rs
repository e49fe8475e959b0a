//! 出站帧序列化与握手 JSON 模型。
//!
//! 线协议为 CRLF 结尾的文本帧；`INFO`/`CONNECT` 的参数段是 JSON 对象，
//! 由 serde 负责编解码。入站方向的解码在 [`crate::parser`]。

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 客户端语言标识，写入 CONNECT。
pub(crate) const CLIENT_LANG: &str = "rust";
/// 客户端版本，写入 CONNECT。
pub(crate) const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) const PING_LINE: &[u8] = b"PING\r\n";
pub(crate) const PONG_LINE: &[u8] = b"PONG\r\n";

fn default_max_payload() -> usize {
    1024 * 1024
}

/// 服务器在连接建立与集群变化时推送的自描述。
///
/// 未知字段一律忽略，保证对服务器新增能力的前向兼容。
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServerInfo {
    #[serde(default)]
    pub(crate) server_id: String,
    #[serde(default)]
    pub(crate) host: String,
    #[serde(default)]
    pub(crate) port: u16,
    #[serde(default)]
    pub(crate) version: String,
    #[serde(default)]
    pub(crate) auth_required: bool,
    #[serde(default)]
    pub(crate) tls_required: bool,
    #[serde(default = "default_max_payload")]
    pub(crate) max_payload: usize,
    #[serde(default)]
    pub(crate) connect_urls: Vec<String>,
}

impl ServerInfo {
    pub(crate) fn parse(json: &[u8]) -> Result<ServerInfo> {
        serde_json::from_slice(json)
            .map_err(|err| Error::Protocol(format!("malformed INFO payload: {err}")))
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// CONNECT 帧携带的客户端身份与能力请求。
#[derive(Debug, Serialize)]
pub(crate) struct ConnectRequest<'a> {
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<&'a str>,
    pub(crate) lang: &'static str,
    pub(crate) version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) pass: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) auth_token: Option<&'a str>,
    #[serde(skip_serializing_if = "is_false")]
    pub(crate) no_echo: bool,
}

impl ConnectRequest<'_> {
    /// 渲染完整的 `CONNECT <json>\r\n` 帧。
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)
            .map_err(|err| Error::IllegalState(format!("connect serialization: {err}")))?;
        let mut line = Vec::with_capacity(8 + json.len() + 2);
        line.extend_from_slice(b"CONNECT ");
        line.extend_from_slice(json.as_bytes());
        line.extend_from_slice(b"\r\n");
        Ok(line)
    }
}

/// 渲染完整的 `PUB` 帧（控制行 + 负载 + CRLF）。
///
/// 整帧一次成型，使重连挂起缓冲的容量判定对整帧原子生效。
pub(crate) fn encode_pub(subject: &str, reply: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let header = match reply {
        Some(reply) => format!("PUB {subject} {reply} {}\r\n", payload.len()),
        None => format!("PUB {subject} {}\r\n", payload.len()),
    };
    let mut frame = Vec::with_capacity(header.len() + payload.len() + 2);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    frame
}

/// 渲染 `SUB` 帧。
pub(crate) fn encode_sub(subject: &str, queue: Option<&str>, sid: u64) -> Vec<u8> {
    match queue {
        Some(queue) => format!("SUB {subject} {queue} {sid}\r\n").into_bytes(),
        None => format!("SUB {subject} {sid}\r\n").into_bytes(),
    }
}

/// 渲染 `UNSUB` 帧；`max` 存在时为延迟退订。
pub(crate) fn encode_unsub(sid: u64, max: Option<u64>) -> Vec<u8> {
    match max {
        Some(max) => format!("UNSUB {sid} {max}\r\n").into_bytes(),
        None => format!("UNSUB {sid}\r\n").into_bytes(),
    }
}
