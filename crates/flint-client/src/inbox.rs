//! 收件箱主题与抗碰撞唯一标识生成。
//!
//! 请求应答依赖每连接唯一的收件箱前缀与每调用唯一的令牌。生成器采用
//! "随机前缀 + 单调序列" 方案：12 位 base62 随机前缀提供跨进程抗碰撞性
//! （62^12 ≈ 2^71 种取值），10 位序列段以随机步长单调递增，单进程内
//! 零碰撞且无需每次访问随机源。

use std::sync::OnceLock;

use parking_lot::Mutex;
use rand::Rng;

/// 收件箱主题的固定前缀。
pub(crate) const INBOX_PREFIX: &str = "_INBOX.";

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
/// 62^10，序列段的进位边界。
const MAX_SEQ: u64 = 839_299_365_868_340_224;
const MIN_INC: u64 = 33;
const MAX_INC: u64 = 333;

/// 唯一标识生成器。
///
/// 前缀在构造与序列回绕时重随机化；序列步长亦为随机值，降低外部对
/// 后续令牌的可预测性。
#[derive(Debug)]
pub(crate) struct Nuid {
    prefix: [u8; PREFIX_LEN],
    seq: u64,
    inc: u64,
}

impl Nuid {
    pub(crate) fn new() -> Self {
        let mut nuid = Self {
            prefix: [0; PREFIX_LEN],
            seq: 0,
            inc: 0,
        };
        nuid.randomize();
        nuid
    }

    fn randomize(&mut self) {
        let mut rng = rand::thread_rng();
        for byte in self.prefix.iter_mut() {
            *byte = ALPHABET[rng.gen_range(0..ALPHABET.len())];
        }
        self.seq = rng.gen_range(0..MAX_SEQ / 2);
        self.inc = rng.gen_range(MIN_INC..MAX_INC);
    }

    /// 产出下一个 22 字符令牌。
    pub(crate) fn next(&mut self) -> String {
        self.seq += self.inc;
        if self.seq >= MAX_SEQ {
            self.randomize();
        }

        let mut out = Vec::with_capacity(PREFIX_LEN + SEQ_LEN);
        out.extend_from_slice(&self.prefix);

        // 序列段按 base62 定宽渲染，低位在后。
        let mut digits = [0u8; SEQ_LEN];
        let mut rest = self.seq;
        for slot in digits.iter_mut().rev() {
            *slot = ALPHABET[(rest % 62) as usize];
            rest /= 62;
        }
        out.extend_from_slice(&digits);

        // 不变式：字母表为 ASCII，产物必为合法 UTF-8。
        String::from_utf8(out).expect("alphabet is ascii")
    }
}

fn global() -> &'static Mutex<Nuid> {
    static GLOBAL: OnceLock<Mutex<Nuid>> = OnceLock::new();
    GLOBAL.get_or_init(|| Mutex::new(Nuid::new()))
}

/// 从进程级生成器取下一个令牌。
pub(crate) fn next_token() -> String {
    global().lock().next()
}

/// 生成一个独立的收件箱主题（`_INBOX.<token>`）。
pub(crate) fn new_inbox() -> String {
    format!("{INBOX_PREFIX}{}", next_token())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_have_fixed_width() {
        let mut nuid = Nuid::new();
        for _ in 0..100 {
            assert_eq!(nuid.next().len(), PREFIX_LEN + SEQ_LEN);
        }
    }

    #[test]
    fn tokens_never_repeat_within_process() {
        let mut nuid = Nuid::new();
        let mut seen = HashSet::new();
        for _ in 0..100_000 {
            assert!(seen.insert(nuid.next()), "token collision");
        }
    }

    #[test]
    fn rollover_rerandomizes_prefix() {
        let mut nuid = Nuid::new();
        let before = nuid.prefix;
        nuid.seq = MAX_SEQ - 1;
        nuid.next();
        assert_ne!(nuid.prefix, before);
        assert!(nuid.seq < MAX_SEQ);
    }

    #[test]
    fn inbox_subject_carries_prefix() {
        let inbox = new_inbox();
        assert!(inbox.starts_with(INBOX_PREFIX));
        assert_eq!(inbox.len(), INBOX_PREFIX.len() + PREFIX_LEN + SEQ_LEN);
    }
}
