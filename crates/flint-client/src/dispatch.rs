//! 库级共享投递线程池。
//!
//! 连接启用共享投递（`use_global_delivery_pool`）后，异步订阅在创建时
//! 被指派到 `槽位 = 递增序号 % 池容量` 的工作线程，替代每订阅一线程的
//! 模式。工作线程按入队时间串行处理其名下所有订阅的消息：同一订阅的
//! 消息严格保序，同一线程上不同订阅之间亦按入队次序。
//!
//! 池为进程级单例：[`init_delivery_pool`] 显式初始化（或在首次指派时
//! 以默认容量懒初始化），容量只增不减；[`shutdown_delivery_pool`] 停止
//! 全部工作线程（既有队列先排空）。关闭某个连接不影响池——该连接订阅
//! 的遗留队列项在投递时发现订阅已关闭而被跳过。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::subscription::SubInner;

/// 未显式初始化时的池容量。
const DEFAULT_POOL_SIZE: usize = 1;

/// 工作线程队列项：指派到该线程的订阅，每条入队消息对应一项。
struct WorkerShared {
    queue: Mutex<VecDeque<Arc<SubInner>>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// 指派给订阅的工作线程句柄。克隆廉价，订阅生命周期内持有。
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// 为 `sub` 的一条新入队消息排一个处理项。
    pub(crate) fn signal(&self, sub: Arc<SubInner>) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(sub);
        drop(queue);
        self.shared.cond.notify_one();
    }
}

struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

/// 池本体。`workers` 槽位懒生成：指派命中某槽位时才真正起线程。
struct DeliveryPool {
    workers: Vec<Option<Worker>>,
    next_slot: usize,
}

impl DeliveryPool {
    fn with_capacity(capacity: usize) -> Self {
        let mut workers = Vec::with_capacity(capacity);
        workers.resize_with(capacity, || None);
        Self {
            workers,
            next_slot: 0,
        }
    }

    fn assign(&mut self) -> WorkerHandle {
        let slot = self.next_slot % self.workers.len();
        self.next_slot = self.next_slot.wrapping_add(1);

        let worker = self.workers[slot].get_or_insert_with(|| {
            let shared = Arc::new(WorkerShared {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                shutdown: AtomicBool::new(false),
            });
            let thread_shared = Arc::clone(&shared);
            let thread = thread::Builder::new()
                .name(format!("flint-delivery-{slot}"))
                .spawn(move || worker_loop(thread_shared))
                .expect("spawn delivery worker");
            debug!(slot, "delivery worker spawned");
            Worker {
                shared,
                thread: Some(thread),
            }
        });
        WorkerHandle {
            shared: Arc::clone(&worker.shared),
        }
    }

    fn grow_to(&mut self, capacity: usize) {
        while self.workers.len() < capacity {
            self.workers.push(None);
        }
    }
}

/// 工作线程主循环：逐项取订阅并投递恰好一条消息。
///
/// 收到关闭信号后先排空既有队列项再退出。
fn worker_loop(shared: Arc<WorkerShared>) {
    loop {
        let sub = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(sub) = queue.pop_front() {
                    break sub;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.cond.wait(&mut queue);
            }
        };
        SubInner::deliver_next(&sub);
    }
}

fn pool() -> &'static Mutex<Option<DeliveryPool>> {
    static POOL: OnceLock<Mutex<Option<DeliveryPool>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(None))
}

/// 显式初始化共享投递池。
///
/// 已初始化时等价于 [`set_delivery_pool_size`]（只增不减）。
pub fn init_delivery_pool(size: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::InvalidArg("delivery pool size must be positive".into()));
    }
    let mut guard = pool().lock();
    match guard.as_mut() {
        Some(existing) => {
            if size < existing.workers.len() {
                return Err(Error::InvalidArg(
                    "delivery pool size can only grow".into(),
                ));
            }
            existing.grow_to(size);
        }
        None => *guard = Some(DeliveryPool::with_capacity(size)),
    }
    Ok(())
}

/// 运行期调整池容量；仅允许增长。
pub fn set_delivery_pool_size(size: usize) -> Result<()> {
    init_delivery_pool(size)
}

/// 停止全部工作线程并释放池。既有队列项先投递完毕。
pub fn shutdown_delivery_pool() {
    let taken = { pool().lock().take() };
    let Some(pool) = taken else { return };
    for worker in pool.workers.into_iter().flatten() {
        worker.shared.shutdown.store(true, Ordering::Release);
        worker.shared.cond.notify_all();
        if let Some(thread) = worker.thread {
            let _ = thread.join();
        }
    }
}

/// 为新的异步订阅指派工作线程（懒初始化默认容量）。
pub(crate) fn assign_worker() -> WorkerHandle {
    let mut guard = pool().lock();
    let pool = guard.get_or_insert_with(|| DeliveryPool::with_capacity(DEFAULT_POOL_SIZE));
    pool.assign()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::subscription::{PushOutcome, SubInner};
    use bytes::Bytes;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn pool_size_is_grow_only() {
        init_delivery_pool(2).unwrap();
        assert!(set_delivery_pool_size(3).is_ok());
        assert!(set_delivery_pool_size(1).is_err());
        assert!(init_delivery_pool(0).is_err());
    }

    #[test]
    fn worker_delivers_in_enqueue_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let handler_seen = Arc::clone(&seen);
        let handler_counter = Arc::clone(&counter);
        let sub = SubInner::new(
            1,
            "pool.test".into(),
            None,
            Weak::new(),
            Some(Box::new(move |msg: Message| {
                handler_seen.lock().push(msg.data().to_vec());
                handler_counter.fetch_add(1, Ordering::SeqCst);
            })),
            Some(assign_worker()),
            1024,
            1 << 20,
        );

        for i in 0..16u8 {
            assert_eq!(
                SubInner::push(&sub, Message::new("pool.test".into(), None, Bytes::copy_from_slice(&[i]))),
                PushOutcome::Queued
            );
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 16 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let seen = seen.lock();
        let expected: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i]).collect();
        assert_eq!(*seen, expected);
    }
}
