//! 消息值类型：主题 / 可选回复主题 / 负载的载体。

use bytes::Bytes;

/// 一条投递给应用的消息。
///
/// 负载以 [`Bytes`] 承载：解析器快路径下它是对读缓冲区域的一次性复制，
/// 跨读分片时则直接接管解析器的累积缓冲，交付后由消息独占所有权。
#[derive(Debug, Clone)]
pub struct Message {
    subject: String,
    reply: Option<String>,
    data: Bytes,
}

impl Message {
    pub(crate) fn new(subject: String, reply: Option<String>, data: Bytes) -> Self {
        Self {
            subject,
            reply,
            data,
        }
    }

    /// 消息到达时的主题。
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// 请求方附带的回复主题（若有）。
    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    /// 负载字节。
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 负载长度。
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 取走负载所有权，避免复制。
    pub fn into_data(self) -> Bytes {
        self.data
    }
}
