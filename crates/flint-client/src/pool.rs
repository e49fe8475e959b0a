//! 服务器池：有序端点集合与重连轮换策略。
//!
//! 池由应用种子 URL 初始化（默认洗牌），连接期间并入服务器经 INFO
//! 宣告的 `connect_urls`（仅追加、去重、不重排）。重连引擎按轮换顺序
//! 消费池：尝试次数超过上限的宣告端点被剪除，种子端点则保留在池中但
//! 不再被选中。

use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::warn;

use crate::error::Result;
use crate::url::ServerUrl;

/// 池中的单个端点及其重连记账。
///
/// 不变式：`url` 的 host 与 port 恒为非空（[`ServerUrl::parse`] 保证）。
#[derive(Debug, Clone)]
pub(crate) struct ServerEntry {
    pub(crate) url: ServerUrl,
    /// 自上次成功握手以来的连续失败次数。
    pub(crate) reconnect_attempts: u32,
    /// 是否曾经完成过一次握手；重连策略据此区分冷端点。
    pub(crate) did_connect: bool,
    /// 是否来自服务器宣告（而非应用种子）。
    pub(crate) advertised: bool,
    /// 最近一次开始拨号的时刻，驱动按服务器的冷却间隔。
    pub(crate) last_attempt: Option<Instant>,
}

impl ServerEntry {
    fn new(url: ServerUrl, advertised: bool) -> Self {
        Self {
            url,
            reconnect_attempts: 0,
            did_connect: false,
            advertised,
            last_attempt: None,
        }
    }
}

/// 有序服务器池。
///
/// # 教案式说明
/// - **意图 (Why)**：重连不是对单个地址的死磕，而是在一个动态端点集合
///   上的轮换消费；池承载轮换顺序、按服务器的失败计数与冷却时刻；
/// - **契约 (What)**：
///   - [`select_next`](Self::select_next) 返回下一个可尝试端点并把它轮换
///     到队尾；所有端点都超限时返回 `None`（调用方据此转入 closed）；
///   - 宣告端点超限即剪除，种子端点永不删除；
///   - [`merge_advertised`](Self::merge_advertised) 只追加不重排，正在
///     使用的端点即使从新宣告中消失也不会被移除；
/// - **执行逻辑 (How)**：`Vec` 当作环形队列使用，当前端点始终位于队尾，
///   便于 `fail_current` / `connected_current` 定位。
#[derive(Debug)]
pub(crate) struct ServerPool {
    entries: Vec<ServerEntry>,
}

impl ServerPool {
    pub(crate) fn new(urls: Vec<ServerUrl>, randomize: bool) -> Self {
        let mut entries: Vec<ServerEntry> =
            urls.into_iter().map(|u| ServerEntry::new(u, false)).collect();
        if randomize && entries.len() > 1 {
            entries.shuffle(&mut rand::thread_rng());
        }
        Self { entries }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// 轮换选出下一个可尝试的端点。
    ///
    /// `max_reconnect` 为按服务器的尝试上限，`None` 表示无限。超限的
    /// 宣告端点在此处被剪除；超限的种子端点保留但跳过。
    pub(crate) fn select_next(&mut self, max_reconnect: Option<u32>) -> Option<ServerUrl> {
        let mut examined = 0;
        let len = self.entries.len();
        while examined < len {
            examined += 1;
            let entry = self.entries.remove(0);
            let exceeded = max_reconnect.is_some_and(|m| entry.reconnect_attempts >= m);
            if exceeded {
                if entry.advertised {
                    // 剪除：宣告端点超限后不再占据池空间。
                    continue;
                }
                self.entries.push(entry);
                continue;
            }
            let url = entry.url.clone();
            self.entries.push(entry);
            return Some(url);
        }
        None
    }

    fn current_mut(&mut self) -> Option<&mut ServerEntry> {
        self.entries.last_mut()
    }

    /// 记录对当前端点的一次拨号起点（冷却计时基准）。
    pub(crate) fn begin_attempt(&mut self) {
        if let Some(entry) = self.current_mut() {
            entry.last_attempt = Some(Instant::now());
        }
    }

    /// 当前端点拨号或握手失败。
    pub(crate) fn fail_current(&mut self) {
        if let Some(entry) = self.current_mut() {
            entry.reconnect_attempts += 1;
        }
    }

    /// 当前端点握手成功：清零失败计数并标记曾连通。
    pub(crate) fn connected_current(&mut self) {
        if let Some(entry) = self.current_mut() {
            entry.reconnect_attempts = 0;
            entry.did_connect = true;
        }
    }

    /// 按服务器冷却：`reconnect_wait` 扣除距该端点上次尝试的耗时。
    pub(crate) fn cooldown_remaining(&self, reconnect_wait: Duration) -> Duration {
        match self.entries.last().and_then(|e| e.last_attempt) {
            Some(at) => reconnect_wait.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// 并入一次 INFO 宣告的 `connect_urls`。
    ///
    /// 返回是否有新端点加入（驱动 discovered-servers 回调）。
    pub(crate) fn merge_advertised(&mut self, urls: &[String]) -> Result<bool> {
        let mut added = false;
        for raw in urls {
            let url = match ServerUrl::parse(raw) {
                Ok(url) => url,
                Err(err) => {
                    warn!(url = raw.as_str(), error = %err, "ignoring malformed advertised url");
                    continue;
                }
            };
            let key = url.endpoint_key();
            if self.entries.iter().any(|e| e.url.endpoint_key() == key) {
                continue;
            }
            self.entries.push(ServerEntry::new(url, true));
            added = true;
        }
        Ok(added)
    }

    /// 池内全部端点的展示形式（种子 + 宣告）。
    pub(crate) fn server_urls(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.url.to_string()).collect()
    }

    /// 仅宣告端点的展示形式。
    pub(crate) fn discovered_urls(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.advertised)
            .map(|e| e.url.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(urls: &[&str]) -> ServerPool {
        let parsed = urls.iter().map(|u| ServerUrl::parse(u).unwrap()).collect();
        ServerPool::new(parsed, false)
    }

    #[test]
    fn rotation_preserves_seed_order_without_randomize() {
        let mut pool = pool_of(&["a:1", "b:2", "c:3"]);
        let picks: Vec<String> = (0..4)
            .map(|_| pool.select_next(None).unwrap().dial_addr())
            .collect();
        assert_eq!(picks, vec!["a:1", "b:2", "c:3", "a:1"]);
    }

    #[test]
    fn advertised_entry_pruned_after_limit() {
        let mut pool = pool_of(&["seed:1"]);
        pool.merge_advertised(&["adv:2".to_string()]).unwrap();
        assert_eq!(pool.len(), 2);

        // 把宣告端点推到超限。
        for _ in 0..2 {
            let url = pool.select_next(Some(1)).unwrap();
            pool.begin_attempt();
            pool.fail_current();
            let _ = url;
        }
        // seed 与 adv 均失败一次；上限 1 ⇒ adv 被剪除，seed 保留但跳过。
        assert_eq!(pool.select_next(Some(1)), None);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.server_urls(), vec![format!("flint://seed:1")]);
    }

    #[test]
    fn exhausted_seed_is_kept_but_skipped() {
        let mut pool = pool_of(&["only:1"]);
        pool.select_next(Some(2)).unwrap();
        pool.fail_current();
        pool.select_next(Some(2)).unwrap();
        pool.fail_current();
        assert_eq!(pool.select_next(Some(2)), None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn success_resets_attempt_count() {
        let mut pool = pool_of(&["only:1"]);
        pool.select_next(Some(1)).unwrap();
        pool.fail_current();
        assert_eq!(pool.select_next(Some(1)), None);

        // 手动复位后重新可选。
        pool.entries[0].reconnect_attempts = 0;
        let url = pool.select_next(Some(1)).unwrap();
        assert_eq!(url.dial_addr(), "only:1");
        pool.connected_current();
        assert!(pool.entries.last().unwrap().did_connect);
        assert_eq!(pool.entries.last().unwrap().reconnect_attempts, 0);
    }

    #[test]
    fn merge_deduplicates_and_appends_only() {
        let mut pool = pool_of(&["a:1", "b:2"]);
        let added = pool
            .merge_advertised(&["a:1".to_string(), "c:3".to_string()])
            .unwrap();
        assert!(added);
        assert_eq!(pool.len(), 3);
        // 再次宣告同一列表不再新增。
        let added = pool
            .merge_advertised(&["a:1".to_string(), "c:3".to_string()])
            .unwrap();
        assert!(!added);
        assert_eq!(
            pool.discovered_urls(),
            vec!["flint://c:3".to_string()]
        );
    }

    #[test]
    fn cooldown_counts_down_from_last_attempt() {
        let mut pool = pool_of(&["a:1"]);
        pool.select_next(None).unwrap();
        assert_eq!(pool.cooldown_remaining(Duration::from_secs(2)), Duration::ZERO);
        pool.begin_attempt();
        let remaining = pool.cooldown_remaining(Duration::from_secs(2));
        assert!(remaining > Duration::from_secs(1));
        assert!(remaining <= Duration::from_secs(2));
    }
}
