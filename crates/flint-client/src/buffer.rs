//! 出站字节缓冲。
//!
//! 连接把待写协议字节累积于此，由 flusher 线程批量落盘；重连期间则以
//! 容量受限的同类缓冲暂存发布流量。容器语义刻意保持极简：尾部追加、
//! 头部消费、可选的硬性容量上限。

use crate::error::{Error, Result};

/// 可增长的字节容器，支持调用方提供初始后备存储与有界增长。
///
/// # 教案式说明
/// - **意图 (Why)**：出站路径需要一个"追加 + 整体取走"的低开销容器；
///   重连挂起缓冲还要求硬上限，超限的发布必须同步失败而非静默增长；
/// - **契约 (What)**：
///   - [`append`](Self::append) 在超出 `limit` 时返回
///     [`Error::InsufficientBuffer`]，缓冲内容保持不变；
///   - [`consume`](Self::consume) 从头部丢弃 `n` 字节，摊还 O(1)；
///   - [`take_all`](Self::take_all) 取走全部未消费字节并复位，供 flusher
///     在锁外执行套接字写入；
/// - **执行逻辑 (How)**：`Vec<u8>` 搭配读游标 `start`；追加前若游标非零
///   先原地压缩，保证容量复用；扩容走 `try_reserve`，失败映射为
///   [`Error::NoMemory`] 而非中止进程。
#[derive(Debug)]
pub(crate) struct ByteBuffer {
    data: Vec<u8>,
    start: usize,
    limit: Option<usize>,
}

impl ByteBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            start: 0,
            limit: None,
        }
    }

    /// 以调用方提供的后备存储构造缓冲，既有内容成为初始未消费数据。
    pub(crate) fn from_vec(backing: Vec<u8>) -> Self {
        Self {
            data: backing,
            start: 0,
            limit: None,
        }
    }

    /// 设定存量字节数的硬上限；`None` 表示仅受内存约束。
    pub(crate) fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// 追加一段字节；超限时缓冲保持原状。
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let needed = self.len() + bytes.len();
        if let Some(limit) = self.limit
            && needed > limit
        {
            return Err(Error::InsufficientBuffer {
                needed,
                capacity: limit,
            });
        }
        if self.start > 0 {
            // 压缩已消费前缀，复用既有容量。
            self.data.copy_within(self.start.., 0);
            self.data.truncate(self.len());
            self.start = 0;
        }
        self.data
            .try_reserve(bytes.len())
            .map_err(|err| Error::NoMemory(err.to_string()))?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// 从头部丢弃 `n` 字节；`n` 超过存量时等价于清空。
    pub(crate) fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.data.len());
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
    }

    /// 取走全部未消费字节并复位缓冲。
    pub(crate) fn take_all(&mut self) -> Vec<u8> {
        let out = self.data.split_off(self.start);
        self.data.clear();
        self.start = 0;
        out
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }
}
