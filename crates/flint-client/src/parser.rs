//! 线协议流式解析器。
//!
//! 以逐字节状态机解码服务器方向的协议流：任何协议记号（动词、参数行、
//! 消息负载）都可能在任意字节处被 TCP 读取边界切断，解析器必须跨调用
//! 断点续传，且在快路径上保持零拷贝。

use std::fmt;
use std::ops::Range;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// 控制行参数的常驻暂存容量；绝大多数控制行远小于此值，跨读分片时
/// 无需额外分配即可续传。
const SCRATCH_CAPACITY: usize = 4096;
/// 协议错误报文中摘录的最大字节数。
const EXCERPT_LEN: usize = 32;

/// 解析器状态。按动词组织为线性接受路径，`OpStart` 依首字节分派。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    OpStart,
    OpM,
    OpMs,
    OpMsg,
    OpMsgSpc,
    MsgArg,
    MsgPayload,
    MsgEnd,
    OpP,
    OpPi,
    OpPin,
    OpPing,
    OpPo,
    OpPon,
    OpPong,
    OpPlus,
    OpPlusO,
    OpPlusOk,
    OpMinus,
    OpMinusE,
    OpMinusEr,
    OpMinusErr,
    OpMinusErrSpc,
    MinusErrArg,
    OpI,
    OpIn,
    OpInf,
    OpInfo,
    OpInfoSpc,
    InfoArg,
}

impl fmt::Display for ParseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// 消息负载的移交形式。
///
/// 快路径下负载仍驻留在本次读缓冲中，以借用形式递交；跨读分片时解析器
/// 已将其复制进独立缓冲，以 [`Bytes`] 形式移交所有权。接收方若需在
/// 分发调用之后保留负载，必须通过 [`into_bytes`](Self::into_bytes) 转为
/// 拥有形式。
#[derive(Debug)]
pub(crate) enum PayloadRef<'a> {
    Borrowed(&'a [u8]),
    Owned(Bytes),
}

impl PayloadRef<'_> {
    pub(crate) fn len(&self) -> usize {
        match self {
            PayloadRef::Borrowed(b) => b.len(),
            PayloadRef::Owned(b) => b.len(),
        }
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        match self {
            PayloadRef::Borrowed(b) => Bytes::copy_from_slice(b),
            PayloadRef::Owned(b) => b,
        }
    }
}

/// 解析事件的接收方。读循环实现该 trait 并把事件转译为连接动作。
pub(crate) trait Dispatcher {
    fn on_msg(
        &mut self,
        subject: &str,
        reply: Option<&str>,
        sid: u64,
        payload: PayloadRef<'_>,
    ) -> Result<()>;
    fn on_info(&mut self, json: &[u8]) -> Result<()>;
    fn on_ping(&mut self) -> Result<()>;
    fn on_pong(&mut self) -> Result<()>;
    fn on_ok(&mut self) -> Result<()>;
    fn on_err(&mut self, text: &str) -> Result<()>;
}

/// 当前 MSG 控制行的参数记录。
///
/// `subject`/`reply` 为区间索引，依 `source` 指向本次调用的读缓冲或
/// 解析器暂存区；读缓冲区间只在本次 `parse` 调用内有效，跨调用存活前
/// 必须克隆为 [`PendingMsg`] 的拥有形式。
#[derive(Debug)]
struct MsgArgs {
    source: ArgSource,
    subject: Range<usize>,
    reply: Option<Range<usize>>,
    sid: u64,
    size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgSource {
    Buf,
    Scratch,
}

/// 跨读分片的消息：参数已克隆为拥有形式，负载按宣告尺寸精确预分配。
#[derive(Debug)]
struct PendingMsg {
    subject: String,
    reply: Option<String>,
    sid: u64,
    size: usize,
    payload: BytesMut,
}

/// 线协议解析器。
///
/// # 教案式说明
/// - **意图 (Why)**：TCP 读边界与协议帧边界无关，解析器必须在任意
///   字节断点处暂停并于下次调用续传；同时消息负载是热路径，完整落在
///   读缓冲内时必须零拷贝递交；
/// - **契约 (What)**：
///   - [`parse`](Self::parse) 可重入：把完整输入按任意切分方式分多次
///     喂入，产生的事件序列与一次性喂入完全一致；
///   - 返回 `Err` 即协议错误：所有暂态缓冲（参数暂存、负载累积）已
///     释放，解析器不保留指向任何读缓冲的引用；
///   - 控制动词大小写不敏感；记号间允许多个空格/制表符；参数行允许
///     尾随空白（`\r` 由 drop 计数剔除）；`PING`/`PONG` 对动词与换行
///     之间的任意字节保持宽容；
/// - **执行逻辑 (How)**：
///   1. 逐字节驱动状态机；参数行整体落在当前缓冲时以区间索引零拷贝
///      引用，跨读时逐字节转存进常驻暂存区；
///   2. 负载完整可得时直接以借用切片分发并整段跳过；跨读时先把参数
///      区间克隆为拥有形式，再按宣告尺寸精确分配累积缓冲；
///   3. 调用结尾统一做断点迁移（参数尾段入暂存、负载前缀入累积）。
/// - **权衡 (Trade-offs)**：暂存区以保留容量的 `Vec` 常驻复用，首次
///   分片之后不再触碰分配器；负载累积缓冲按宣告尺寸精确分配，牺牲对
///   恶意超大宣告的钝感换取零重分配。
pub(crate) struct Parser {
    state: ParseState,
    /// 本次调用中参数（或负载）区段的起始索引。
    mark: usize,
    /// 待剔除的尾随 `\r` 计数。
    drop: usize,
    /// 跨读参数暂存；`scratch_active` 为真时逐字节累积于此。
    scratch: Vec<u8>,
    scratch_active: bool,
    args: Option<MsgArgs>,
    pending: Option<PendingMsg>,
}

impl Parser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::OpStart,
            mark: 0,
            drop: 0,
            scratch: Vec::with_capacity(SCRATCH_CAPACITY),
            scratch_active: false,
            args: None,
            pending: None,
        }
    }

    /// 消费一段读缓冲，把解码出的事件交给 `dispatcher`。
    pub(crate) fn parse<D: Dispatcher>(&mut self, dispatcher: &mut D, buf: &[u8]) -> Result<()> {
        let mut i = 0;

        while i < buf.len() {
            if self.state == ParseState::MsgPayload {
                i = self.run_payload(dispatcher, buf, i)?;
                continue;
            }

            let b = buf[i];
            match self.state {
                ParseState::OpStart => match b {
                    b'M' | b'm' => self.state = ParseState::OpM,
                    b'P' | b'p' => self.state = ParseState::OpP,
                    b'+' => self.state = ParseState::OpPlus,
                    b'-' => self.state = ParseState::OpMinus,
                    b'I' | b'i' => self.state = ParseState::OpI,
                    _ => return Err(self.fail(buf, i)),
                },

                ParseState::OpM => match b {
                    b'S' | b's' => self.state = ParseState::OpMs,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpMs => match b {
                    b'G' | b'g' => self.state = ParseState::OpMsg,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpMsg => match b {
                    b' ' | b'\t' => self.state = ParseState::OpMsgSpc,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpMsgSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.state = ParseState::MsgArg;
                        self.mark = i;
                        self.drop = 0;
                        continue;
                    }
                },
                ParseState::MsgArg => match b {
                    b'\r' => self.drop = 1,
                    b'\n' => {
                        self.finish_msg_args(buf, i)?;
                        self.state = ParseState::MsgPayload;
                        self.mark = i + 1;
                        self.drop = 0;
                    }
                    _ => {
                        if self.scratch_active {
                            self.scratch.push(b);
                        }
                    }
                },
                ParseState::MsgEnd => {
                    if b == b'\n' {
                        self.state = ParseState::OpStart;
                    }
                }

                ParseState::OpP => match b {
                    b'I' | b'i' => self.state = ParseState::OpPi,
                    b'O' | b'o' => self.state = ParseState::OpPo,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpPi => match b {
                    b'N' | b'n' => self.state = ParseState::OpPin,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpPin => match b {
                    b'G' | b'g' => self.state = ParseState::OpPing,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpPing => {
                    if b == b'\n' {
                        dispatcher.on_ping()?;
                        self.state = ParseState::OpStart;
                    }
                }
                ParseState::OpPo => match b {
                    b'N' | b'n' => self.state = ParseState::OpPon,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpPon => match b {
                    b'G' | b'g' => self.state = ParseState::OpPong,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpPong => {
                    if b == b'\n' {
                        dispatcher.on_pong()?;
                        self.state = ParseState::OpStart;
                    }
                }

                ParseState::OpPlus => match b {
                    b'O' | b'o' => self.state = ParseState::OpPlusO,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpPlusO => match b {
                    b'K' | b'k' => self.state = ParseState::OpPlusOk,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpPlusOk => {
                    if b == b'\n' {
                        dispatcher.on_ok()?;
                        self.state = ParseState::OpStart;
                    }
                }

                ParseState::OpMinus => match b {
                    b'E' | b'e' => self.state = ParseState::OpMinusE,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpMinusE => match b {
                    b'R' | b'r' => self.state = ParseState::OpMinusEr,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpMinusEr => match b {
                    b'R' | b'r' => self.state = ParseState::OpMinusErr,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpMinusErr => match b {
                    b' ' | b'\t' => self.state = ParseState::OpMinusErrSpc,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpMinusErrSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.state = ParseState::MinusErrArg;
                        self.mark = i;
                        self.drop = 0;
                        continue;
                    }
                },
                ParseState::MinusErrArg => match b {
                    b'\r' => self.drop = 1,
                    b'\n' => {
                        let line = self.take_line(buf, i);
                        let text = String::from_utf8_lossy(&line).into_owned();
                        dispatcher.on_err(&text)?;
                        self.line_done();
                    }
                    _ => {
                        if self.scratch_active {
                            self.scratch.push(b);
                        }
                    }
                },

                ParseState::OpI => match b {
                    b'N' | b'n' => self.state = ParseState::OpIn,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpIn => match b {
                    b'F' | b'f' => self.state = ParseState::OpInf,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpInf => match b {
                    b'O' | b'o' => self.state = ParseState::OpInfo,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpInfo => match b {
                    b' ' | b'\t' => self.state = ParseState::OpInfoSpc,
                    _ => return Err(self.fail(buf, i)),
                },
                ParseState::OpInfoSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.state = ParseState::InfoArg;
                        self.mark = i;
                        self.drop = 0;
                        continue;
                    }
                },
                ParseState::InfoArg => match b {
                    b'\r' => self.drop = 1,
                    b'\n' => {
                        let line = self.take_line(buf, i);
                        dispatcher.on_info(&line)?;
                        self.line_done();
                    }
                    _ => {
                        if self.scratch_active {
                            self.scratch.push(b);
                        }
                    }
                },

                ParseState::MsgPayload => unreachable!("handled before byte dispatch"),
            }
            i += 1;
        }

        self.migrate_split(dispatcher, buf)
    }

    /// MSG 负载区段的批量处理；返回推进后的索引。
    fn run_payload<D: Dispatcher>(
        &mut self,
        dispatcher: &mut D,
        buf: &[u8],
        i: usize,
    ) -> Result<usize> {
        if let Some(pending) = &mut self.pending {
            let needed = pending.size - pending.payload.len();
            let take = needed.min(buf.len() - i);
            pending.payload.extend_from_slice(&buf[i..i + take]);
            if pending.payload.len() == pending.size {
                let done = self.pending.take().expect("pending checked above");
                dispatcher.on_msg(
                    &done.subject,
                    done.reply.as_deref(),
                    done.sid,
                    PayloadRef::Owned(done.payload.freeze()),
                )?;
                self.state = ParseState::MsgEnd;
            }
            return Ok(i + take);
        }

        let (sid, size) = {
            let args = self.args.as_ref().expect("MsgPayload requires parsed args");
            (args.sid, args.size)
        };
        let start = self.mark;
        if buf.len() >= start + size {
            // 快路径：负载完整驻留当前缓冲，借用递交，零拷贝。
            let subject = self.subject_str(buf)?;
            let reply = self.reply_str(buf)?;
            dispatcher.on_msg(
                subject,
                reply,
                sid,
                PayloadRef::Borrowed(&buf[start..start + size]),
            )?;
            self.args = None;
            self.scratch.clear();
            self.state = ParseState::MsgEnd;
            return Ok(start + size);
        }

        // 负载跨读：交给调用尾部的断点迁移。
        Ok(buf.len())
    }

    /// 参数行在 `i` 处遇到换行：定位完整行并解析 MSG 参数。
    fn finish_msg_args(&mut self, buf: &[u8], i: usize) -> Result<()> {
        let args = if self.scratch_active {
            self.scratch_active = false;
            self.split_msg_args(ArgSource::Scratch, 0, self.scratch.len(), buf, i)?
        } else {
            self.split_msg_args(ArgSource::Buf, self.mark, i - self.drop, buf, i)?
        };
        self.args = Some(args);
        Ok(())
    }

    /// 解析 `subject sid [reply] size`；返回的区间以 `source` 为基准。
    fn split_msg_args(
        &self,
        source: ArgSource,
        start: usize,
        end: usize,
        buf: &[u8],
        at: usize,
    ) -> Result<MsgArgs> {
        let line = match source {
            ArgSource::Buf => &buf[start..end],
            ArgSource::Scratch => &self.scratch[start..end],
        };

        let mut tokens: Vec<Range<usize>> = Vec::with_capacity(4);
        let mut cursor = 0;
        while cursor < line.len() {
            if line[cursor] == b' ' || line[cursor] == b'\t' {
                cursor += 1;
                continue;
            }
            let tok_start = cursor;
            while cursor < line.len() && line[cursor] != b' ' && line[cursor] != b'\t' {
                cursor += 1;
            }
            tokens.push(tok_start + start..cursor + start);
            if tokens.len() > 4 {
                return Err(self.args_error(line, at));
            }
        }

        let numeric = |range: &Range<usize>| -> Option<u64> {
            let bytes = &line[range.start - start..range.end - start];
            if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
                return None;
            }
            let mut value: u64 = 0;
            for b in bytes {
                value = value.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
            }
            Some(value)
        };

        let (subject, sid, reply, size) = match tokens.len() {
            3 => (
                tokens[0].clone(),
                numeric(&tokens[1]),
                None,
                numeric(&tokens[2]),
            ),
            4 => (
                tokens[0].clone(),
                numeric(&tokens[1]),
                Some(tokens[2].clone()),
                numeric(&tokens[3]),
            ),
            _ => return Err(self.args_error(line, at)),
        };
        let (Some(sid), Some(size)) = (sid, size) else {
            return Err(self.args_error(line, at));
        };

        Ok(MsgArgs {
            source,
            subject,
            reply,
            sid,
            size: size as usize,
        })
    }

    fn args_error(&self, line: &[u8], at: usize) -> Error {
        let excerpt = String::from_utf8_lossy(&line[..line.len().min(EXCERPT_LEN)]).into_owned();
        Error::Protocol(format!(
            "processing MSG arguments [state={}, offset={at}]: '{excerpt}'",
            self.state
        ))
    }

    /// 取出当前参数行（ERR/INFO 用），优先暂存区。
    fn take_line(&mut self, buf: &[u8], i: usize) -> Vec<u8> {
        if self.scratch_active {
            self.scratch_active = false;
            std::mem::take(&mut self.scratch)
        } else {
            buf[self.mark..i - self.drop].to_vec()
        }
    }

    fn line_done(&mut self) {
        if self.scratch.capacity() < SCRATCH_CAPACITY {
            // take_line 可能掏走了暂存，恢复常驻容量。
            self.scratch = Vec::with_capacity(SCRATCH_CAPACITY);
        }
        self.scratch.clear();
        self.drop = 0;
        self.state = ParseState::OpStart;
    }

    fn subject_str<'a>(&'a self, buf: &'a [u8]) -> Result<&'a str> {
        let args = self.args.as_ref().expect("args present");
        let bytes = match args.source {
            ArgSource::Buf => &buf[args.subject.clone()],
            ArgSource::Scratch => &self.scratch[args.subject.clone()],
        };
        std::str::from_utf8(bytes).map_err(|_| Error::Protocol("subject is not valid utf-8".into()))
    }

    fn reply_str<'a>(&'a self, buf: &'a [u8]) -> Result<Option<&'a str>> {
        let args = self.args.as_ref().expect("args present");
        let Some(range) = &args.reply else {
            return Ok(None);
        };
        let bytes = match args.source {
            ArgSource::Buf => &buf[range.clone()],
            ArgSource::Scratch => &self.scratch[range.clone()],
        };
        std::str::from_utf8(bytes)
            .map(Some)
            .map_err(|_| Error::Protocol("reply subject is not valid utf-8".into()))
    }

    /// 调用结尾的断点迁移：参数尾段转存暂存区，负载前缀克隆为拥有形式。
    fn migrate_split<D: Dispatcher>(&mut self, dispatcher: &mut D, buf: &[u8]) -> Result<()> {
        match self.state {
            ParseState::MsgArg | ParseState::MinusErrArg | ParseState::InfoArg => {
                if !self.scratch_active {
                    let end = buf.len() - self.drop;
                    self.scratch.extend_from_slice(&buf[self.mark..end]);
                    self.scratch_active = true;
                }
            }
            ParseState::MsgPayload if self.pending.is_none() => {
                let (sid, size) = {
                    let args = self.args.as_ref().expect("payload without args");
                    (args.sid, args.size)
                };
                if buf.len() >= self.mark + size {
                    // 仅当空负载的控制行恰在缓冲末尾收尾时到达：立即分发。
                    let subject = self.subject_str(buf)?;
                    let reply = self.reply_str(buf)?;
                    dispatcher.on_msg(subject, reply, sid, PayloadRef::Borrowed(&[]))?;
                    self.args = None;
                    self.scratch.clear();
                    self.state = ParseState::MsgEnd;
                } else {
                    // 克隆仍指向读缓冲的参数区间，使参数记录跨读存活。
                    let subject = self.subject_str(buf)?.to_owned();
                    let reply = self.reply_str(buf)?.map(str::to_owned);
                    let start = self.mark.min(buf.len());
                    let mut payload = BytesMut::with_capacity(size);
                    payload.extend_from_slice(&buf[start..]);
                    self.pending = Some(PendingMsg {
                        subject,
                        reply,
                        sid,
                        size,
                        payload,
                    });
                    self.args = None;
                    self.scratch.clear();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// 协议错误：释放全部暂态缓冲并携带状态与字节摘录。
    fn fail(&mut self, buf: &[u8], i: usize) -> Error {
        let excerpt = String::from_utf8_lossy(&buf[i..buf.len().min(i + EXCERPT_LEN)]).into_owned();
        let message = format!("parse error [state={}]: '{excerpt}'", self.state);
        self.release();
        Error::Protocol(message)
    }

    fn release(&mut self) {
        self.scratch.clear();
        self.scratch_active = false;
        self.args = None;
        self.pending = None;
        self.state = ParseState::OpStart;
        self.drop = 0;
    }
}
