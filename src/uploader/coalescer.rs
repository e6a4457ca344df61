//! 更新合并器
//!
//! 上传过程中进度回调非常频繁，直接写入任务列表会造成快照风暴。
//! 这里把同一 key 的高频更新缓冲起来，按固定间隔批量写出：
//! - 进度通道：100ms，最新进度为准
//! - 状态通道：50ms，最新状态为准，未携带进度时沿用旧进度
//!
//! 两个通道是同一个 `DebouncedBatch` 的两个实例

use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

use super::task::StatusUpdate;

/// 进度通道默认刷新间隔（毫秒）
pub const PROGRESS_FLUSH_INTERVAL_MS: u64 = 100;

/// 状态通道默认刷新间隔（毫秒）
pub const STATUS_FLUSH_INTERVAL_MS: u64 = 50;

/// 同一 key 的合并函数：(缓冲中的旧值, 新值)
pub type MergeFn<V> = fn(&mut V, V);

/// 批量写出目标
pub type FlushSink<V> = Arc<dyn Fn(HashMap<String, V>) + Send + Sync>;

/// 新值直接覆盖旧值
pub fn latest_wins<V>(slot: &mut V, newer: V) {
    *slot = newer;
}

fn merge_status(slot: &mut StatusUpdate, newer: StatusUpdate) {
    slot.merge(newer);
}

struct Pending<V> {
    entries: HashMap<String, V>,
    /// 已布置的定时器
    timer: Option<JoinHandle<()>>,
    /// 每次写出后递增，过期定时器据此放弃写出
    epoch: u64,
}

struct Inner<V> {
    name: &'static str,
    interval: Duration,
    merge: MergeFn<V>,
    sink: FlushSink<V>,
    pending: Mutex<Pending<V>>,
    /// 串行化"取出 + 写出"，保证先取出的批次先写出
    apply_lock: Mutex<()>,
    flush_count: AtomicU64,
    timers_started: AtomicU64,
}

/// 按 key 合并的防抖批处理器
///
/// 克隆后共享同一个缓冲区
pub struct DebouncedBatch<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for DebouncedBatch<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> DebouncedBatch<V> {
    /// 缓冲中的 key 数量
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().entries.len()
    }

    /// 是否有已布置的定时器
    pub fn is_armed(&self) -> bool {
        self.inner.pending.lock().timer.is_some()
    }

    /// 实际写出次数（空缓冲区的写出不计入）
    pub fn flush_count(&self) -> u64 {
        self.inner.flush_count.load(Ordering::Relaxed)
    }

    /// 布置过的定时器数量
    pub fn timers_started(&self) -> u64 {
        self.inner.timers_started.load(Ordering::Relaxed)
    }
}

impl<V> fmt::Debug for DebouncedBatch<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebouncedBatch")
            .field("name", &self.inner.name)
            .field("interval", &self.inner.interval)
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl DebouncedBatch<f64> {
    /// 进度通道
    pub fn progress(interval: Duration, sink: FlushSink<f64>) -> Self {
        Self::new("progress", interval, latest_wins, sink)
    }
}

impl DebouncedBatch<StatusUpdate> {
    /// 状态通道
    pub fn status(interval: Duration, sink: FlushSink<StatusUpdate>) -> Self {
        Self::new("status", interval, merge_status, sink)
    }
}

impl<V: Send + 'static> DebouncedBatch<V> {
    /// 创建合并器
    ///
    /// # 参数
    /// * `name` - 通道名称（日志用）
    /// * `interval` - 首次写入到批量写出的延迟
    /// * `merge` - 同一 key 的合并函数
    /// * `sink` - 批量写出目标
    pub fn new(name: &'static str, interval: Duration, merge: MergeFn<V>, sink: FlushSink<V>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                interval,
                merge,
                sink,
                pending: Mutex::new(Pending {
                    entries: HashMap::new(),
                    timer: None,
                    epoch: 0,
                }),
                apply_lock: Mutex::new(()),
                flush_count: AtomicU64::new(0),
                timers_started: AtomicU64::new(0),
            }),
        }
    }

    /// 写入一条更新
    ///
    /// 缓冲区为空时布置一个定时器；已有定时器时只合并，不重复布置
    pub fn push(&self, key: impl Into<String>, value: V) {
        let mut pending = self.inner.pending.lock();
        match pending.entries.entry(key.into()) {
            Entry::Occupied(mut slot) => (self.inner.merge)(slot.get_mut(), value),
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }

        if pending.timer.is_some() {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
                let epoch = pending.epoch;
                let interval = self.inner.interval;
                pending.timer = Some(handle.spawn(async move {
                    tokio::time::sleep(interval).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.flush(Some(epoch));
                    }
                }));
                self.inner.timers_started.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                // 没有运行时时无法延迟，立即写出
                drop(pending);
                self.inner.flush(None);
            }
        }
    }

    /// 立即同步写出缓冲区，并撤销已布置的定时器
    pub fn flush_now(&self) {
        self.inner.flush(None);
    }
}

impl<V> Inner<V> {
    /// 写出缓冲区
    ///
    /// `expected_epoch` 为 Some 时表示由定时器触发，纪元不一致说明已被提前写出
    fn flush(&self, expected_epoch: Option<u64>) {
        let _apply = self.apply_lock.lock();

        let entries = {
            let mut pending = self.pending.lock();
            if let Some(epoch) = expected_epoch {
                if pending.epoch != epoch {
                    return;
                }
                // 定时器自身正在执行，不能 abort
                pending.timer = None;
            } else if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            pending.epoch = pending.epoch.wrapping_add(1);
            std::mem::take(&mut pending.entries)
        };

        if entries.is_empty() {
            return;
        }

        trace!("{} 通道写出 {} 条更新", self.name, entries.len());
        (self.sink)(entries);
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }
}
