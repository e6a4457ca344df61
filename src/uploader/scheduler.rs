// 上传调度器
//
// 负责任务队列与并发控制：
// 1. FIFO 队列，全局最多 max_concurrent 个在途传输
// 2. 状态迁移以调度账本为准，展示层通过状态合并器异步跟进
// 3. 每成功 refresh_every 个任务刷新一次列表，批次结束再刷新一次
// 4. 全部取消 / 重试失败 / 清理已完成
//
// 账本（Ledger）只在一把 parking_lot::Mutex 下读写，锁内不做任何 await。
// 每个任务有一个尝试序号（attempt），取消后重试会递增，
// 旧尝试迟到的结果据此识别为过期，只释放并发名额。

use crate::config::UploadConfig;
use crate::storage::ObjectStore;
use crate::uploader::coalescer::{
    DebouncedBatch, PROGRESS_FLUSH_INTERVAL_MS, STATUS_FLUSH_INTERVAL_MS,
};
use crate::uploader::content::{ContentCache, UploadContent};
use crate::uploader::engine::{
    FractionFn, HandleGuard, TransferHandles, TransferOutcome, UploadEngine,
};
use crate::uploader::store::UploadStore;
use crate::uploader::task::{StatusUpdate, UploadTask, UploadTaskStatus};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 默认最大并发上传数
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// 默认每成功多少个任务刷新一次列表
pub const DEFAULT_REFRESH_EVERY: usize = 50;

/// 内容缓存中找不到上传内容时的错误信息
pub const CONTENT_MISSING: &str = "content missing";

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// 最大并发上传数
    pub max_concurrent: usize,
    /// 每成功多少个任务刷新一次列表（0 表示只在批次结束时刷新）
    pub refresh_every: usize,
    /// 有任务在跑时的定时列表刷新间隔
    pub live_refresh_interval: Option<Duration>,
    /// 批次全部成功后自动收起的延迟
    pub auto_dismiss_delay: Option<Duration>,
    /// 全部取消时是否清空内容缓存（清空后无法重试）
    pub clear_cache_on_cancel: bool,
    /// 进度通道刷新间隔
    pub progress_flush: Duration,
    /// 状态通道刷新间隔
    pub status_flush: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            refresh_every: DEFAULT_REFRESH_EVERY,
            live_refresh_interval: Some(Duration::from_secs(3)),
            auto_dismiss_delay: Some(Duration::from_millis(2000)),
            clear_cache_on_cancel: false,
            progress_flush: Duration::from_millis(PROGRESS_FLUSH_INTERVAL_MS),
            status_flush: Duration::from_millis(STATUS_FLUSH_INTERVAL_MS),
        }
    }
}

impl From<&UploadConfig> for SchedulerOptions {
    fn from(config: &UploadConfig) -> Self {
        let non_zero = |d: Duration| if d.is_zero() { None } else { Some(d) };
        Self {
            max_concurrent: config.max_concurrent.max(1),
            refresh_every: config.refresh_every,
            live_refresh_interval: non_zero(Duration::from_secs(config.live_refresh_secs)),
            auto_dismiss_delay: non_zero(Duration::from_millis(config.auto_dismiss_ms)),
            clear_cache_on_cancel: config.clear_cache_on_cancel,
            progress_flush: Duration::from_millis(config.progress_flush_ms),
            status_flush: Duration::from_millis(config.status_flush_ms),
        }
    }
}

/// 账本中的单个任务
#[derive(Debug, Clone, Copy)]
struct TaskSlot {
    status: UploadTaskStatus,
    attempt: u64,
}

/// 调度账本
#[derive(Default)]
struct Ledger {
    slots: HashMap<String, TaskSlot>,
    /// 待启动的 key（可能含已不再排队的过期项，出队时跳过）
    queue: VecDeque<String>,
    /// 在途传输数（包括被取消后尚未返回的）
    active: usize,
    peak_active: usize,
    completed_since_refresh: usize,
    /// 当前是否有批次在运行
    running: bool,
    /// 每次开始运行时递增，延迟任务据此判断是否过期
    run_generation: u64,
    /// 定时列表刷新的停止令牌
    live_refresh: Option<CancellationToken>,
}

struct SchedulerInner {
    store: Arc<UploadStore>,
    object_store: Arc<dyn ObjectStore>,
    engine: UploadEngine,
    cache: ContentCache,
    progress: DebouncedBatch<f64>,
    status: DebouncedBatch<StatusUpdate>,
    ledger: Mutex<Ledger>,
    options: SchedulerOptions,
    idle_tx: watch::Sender<bool>,
}

/// 上传调度器
#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<SchedulerInner>,
}

impl UploadScheduler {
    /// 创建调度器
    ///
    /// # 参数
    /// * `store` - 展示用的任务列表
    /// * `object_store` - 对象存储
    /// * `options` - 调度配置
    pub fn new(
        store: Arc<UploadStore>,
        object_store: Arc<dyn ObjectStore>,
        options: SchedulerOptions,
    ) -> Self {
        let (progress, status) = update_channels(&store, &options);

        let handles = Arc::new(TransferHandles::new());
        let engine = UploadEngine::new(object_store.clone(), handles);
        let (idle_tx, _) = watch::channel(true);

        info!(
            "创建上传调度器: 最大并发={}, 列表刷新间隔={} 个",
            options.max_concurrent, options.refresh_every
        );

        Self {
            inner: Arc::new(SchedulerInner {
                store,
                object_store,
                engine,
                cache: ContentCache::new(),
                progress,
                status,
                ledger: Mutex::new(Ledger::default()),
                options,
                idle_tx,
            }),
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.inner.options
    }

    /// 写入内容缓存
    pub fn stash(&self, key: impl Into<String>, content: UploadContent) {
        self.inner.cache.stash(key, content);
    }

    pub fn has_content(&self, key: &str) -> bool {
        self.inner.cache.contains(key)
    }

    /// 把一批 key 加入队尾并启动调度
    ///
    /// 同 key 的旧传输（如果还在进行）会被取消，其结果按过期处理
    pub fn enqueue(&self, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }

        {
            let mut guard = self.inner.ledger.lock();
            let ledger = &mut *guard;
            for key in keys {
                let attempt = match ledger.slots.get(&key) {
                    Some(prev) => {
                        // 在锁内取消，避免误伤随后由 pump 登记的新尝试
                        if prev.status == UploadTaskStatus::Uploading {
                            self.inner.engine.handles().cancel(&key);
                        }
                        prev.attempt + 1
                    }
                    None => 0,
                };
                ledger.slots.insert(
                    key.clone(),
                    TaskSlot {
                        status: UploadTaskStatus::Queued,
                        attempt,
                    },
                );
                ledger.queue.push_back(key);
            }
        }

        self.inner.begin_run();
        self.inner.pump();
    }

    /// 取消所有未完成的任务
    ///
    /// 排队、上传中、失败的任务都会变为已取消；已完成的任务不受影响。
    /// 返回被取消的任务数
    pub fn cancel_all(&self) -> usize {
        let inner = &self.inner;
        inner.flush();

        let (canceled, aborted) = {
            let mut guard = inner.ledger.lock();
            let ledger = &mut *guard;
            ledger.queue.clear();
            let canceled: Vec<String> = ledger
                .slots
                .iter_mut()
                .filter(|(_, slot)| slot.status.can_transition_to(UploadTaskStatus::Canceled))
                .map(|(key, slot)| {
                    slot.status = UploadTaskStatus::Canceled;
                    key.clone()
                })
                .collect();
            // 句柄与上传中状态在同一把锁下登记，这里能看到全部在途传输
            (canceled, inner.engine.handles().cancel_all())
        };
        for key in &canceled {
            inner
                .status
                .push(key.clone(), StatusUpdate::new(UploadTaskStatus::Canceled));
        }
        inner.status.flush_now();

        if inner.options.clear_cache_on_cancel {
            inner.cache.clear();
        }

        info!(
            "🛑 全部取消: {} 个任务已取消, 中止 {} 个在途传输",
            canceled.len(),
            aborted
        );

        inner.pump();
        canceled.len()
    }

    /// 重试所有失败和已取消的任务
    ///
    /// 按列表顺序重新入队，进度归零。返回重新入队的任务数
    pub fn retry_failed(&self) -> usize {
        let inner = &self.inner;
        inner.flush();

        let order = inner.store.keys_in_order();
        let requeued: Vec<String> = {
            let mut guard = inner.ledger.lock();
            let ledger = &mut *guard;
            let mut requeued = Vec::new();
            for (key, _) in order {
                if let Some(slot) = ledger.slots.get_mut(&key) {
                    if slot.status.is_retryable() {
                        slot.status = UploadTaskStatus::Queued;
                        slot.attempt += 1;
                        ledger.queue.push_back(key.clone());
                        requeued.push(key);
                    }
                }
            }
            requeued
        };

        if requeued.is_empty() {
            return 0;
        }

        for key in &requeued {
            inner.status.push(key.clone(), StatusUpdate::requeued());
        }
        inner.status.flush_now();
        inner.store.set_panel_open(true);

        info!("🔄 重试 {} 个任务", requeued.len());

        inner.begin_run();
        inner.pump();
        requeued.len()
    }

    /// 清理已完成的任务，返回清理数量
    pub fn clear_completed(&self) -> usize {
        self.inner.flush();
        self.inner.drop_tasks(|t| t.status == UploadTaskStatus::Done)
    }

    /// 收起面板并清理已结束（完成、失败、取消）的任务
    pub fn dismiss(&self) -> usize {
        self.inner.flush();
        let removed = self.inner.drop_tasks(|t| t.status.is_terminal());
        self.inner.store.set_panel_open(false);
        removed
    }

    /// 清空全部任务，在途传输一并取消
    pub fn clear(&self) {
        let inner = &self.inner;
        {
            let mut ledger = inner.ledger.lock();
            ledger.queue.clear();
            ledger.slots.clear();
            inner.engine.handles().cancel_all();
        }
        inner.cache.clear();
        inner.flush();
        inner.store.clear();
        info!("上传任务列表已清空");
        inner.pump();
    }

    /// 立即写出两个合并器
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// 等待当前批次结束（没有排队和上传中的任务）
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle_tx.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.idle_tx.borrow()
    }

    /// 停止后台刷新并写出所有缓冲的更新
    pub fn shutdown(&self) {
        if let Some(token) = self.inner.ledger.lock().live_refresh.take() {
            token.cancel();
        }
        self.inner.flush();
    }

    /// 当前在途传输数
    pub fn active_count(&self) -> usize {
        self.inner.ledger.lock().active
    }

    /// 在途传输数峰值
    pub fn peak_active(&self) -> usize {
        self.inner.ledger.lock().peak_active
    }

    /// 账本中的任务状态
    pub fn status_of(&self, key: &str) -> Option<UploadTaskStatus> {
        self.inner.ledger.lock().slots.get(key).map(|s| s.status)
    }
}

/// 创建进度和状态两个合并通道
///
/// 进度批次写出前先写出状态通道，否则"上传中"状态尚未落地时，
/// 任务仍是排队状态，进度会被丢弃
fn update_channels(
    store: &Arc<UploadStore>,
    options: &SchedulerOptions,
) -> (DebouncedBatch<f64>, DebouncedBatch<StatusUpdate>) {
    let status_sink = store.clone();
    let status = DebouncedBatch::status(
        options.status_flush,
        Arc::new(move |batch| status_sink.apply_status(batch)),
    );

    let progress_sink = store.clone();
    let pending_status = status.clone();
    let progress = DebouncedBatch::progress(
        options.progress_flush,
        Arc::new(move |batch| {
            pending_status.flush_now();
            progress_sink.apply_progress(batch);
        }),
    );

    (progress, status)
}

impl SchedulerInner {
    fn flush(&self) {
        self.progress.flush_now();
        self.status.flush_now();
    }

    /// 标记开始运行，必要时启动定时列表刷新
    fn begin_run(self: &Arc<Self>) {
        let mut ledger = self.ledger.lock();
        ledger.running = true;
        ledger.run_generation += 1;
        self.idle_tx.send_replace(false);

        let Some(interval) = self.options.live_refresh_interval else {
            return;
        };
        if ledger.live_refresh.is_some() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };

        let token = CancellationToken::new();
        ledger.live_refresh = Some(token.clone());
        let weak: Weak<SchedulerInner> = Arc::downgrade(self);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match weak.upgrade() {
                            Some(inner) => inner.refresh_listing(),
                            None => break,
                        }
                    }
                }
            }
            debug!("定时列表刷新已停止");
        });
    }

    /// 启动尽可能多的排队任务
    fn pump(self: &Arc<Self>) {
        let mut launches = Vec::new();
        let mut missing = Vec::new();
        let mut finished_generation = None;

        {
            let mut guard = self.ledger.lock();
            let ledger = &mut *guard;

            while ledger.active < self.options.max_concurrent {
                let Some(key) = ledger.queue.pop_front() else {
                    break;
                };
                let Some(slot) = ledger.slots.get_mut(&key) else {
                    continue;
                };
                // 出队时重新检查，已取消的任务不会启动
                if slot.status != UploadTaskStatus::Queued {
                    continue;
                }

                match self.cache.get(&key) {
                    Some(content) => {
                        slot.status = UploadTaskStatus::Uploading;
                        let attempt = slot.attempt;
                        ledger.active += 1;
                        ledger.peak_active = ledger.peak_active.max(ledger.active);
                        let handle = self.engine.register(&key);
                        launches.push((key, attempt, handle, content));
                    }
                    None => {
                        // 内容缺失不占用并发名额
                        slot.status = UploadTaskStatus::Error;
                        missing.push(key);
                    }
                }
            }

            // active 为 0 时上面的循环只会因为队列为空而退出
            if ledger.running && ledger.active == 0 {
                ledger.running = false;
                if let Some(token) = ledger.live_refresh.take() {
                    token.cancel();
                }
                finished_generation = Some(ledger.run_generation);
            }
        }

        for key in missing {
            warn!("上传内容缺失，任务标记为失败: {}", key);
            self.status.push(key, StatusUpdate::failed(CONTENT_MISSING));
        }

        for (key, attempt, handle, content) in launches {
            self.status
                .push(key.clone(), StatusUpdate::new(UploadTaskStatus::Uploading));
            self.spawn_transfer(key, attempt, handle, content);
        }

        if let Some(generation) = finished_generation {
            self.on_run_complete(generation);
        }
    }

    fn spawn_transfer(
        self: &Arc<Self>,
        key: String,
        attempt: u64,
        handle: HandleGuard,
        content: UploadContent,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            let progress = inner.progress.clone();
            let progress_key = key.clone();
            let on_progress: FractionFn =
                Arc::new(move |fraction| progress.push(progress_key.clone(), fraction));

            let outcome = inner.engine.transfer(handle, content, on_progress).await;
            inner.complete(&key, attempt, outcome);
        });
    }

    /// 处理一次传输结果
    fn complete(self: &Arc<Self>, key: &str, attempt: u64, outcome: TransferOutcome) {
        let mut refresh = false;
        let applied = {
            let mut guard = self.ledger.lock();
            let ledger = &mut *guard;
            ledger.active = ledger.active.saturating_sub(1);

            match ledger.slots.get_mut(key) {
                Some(slot)
                    if slot.status == UploadTaskStatus::Uploading && slot.attempt == attempt =>
                {
                    slot.status = outcome.status();
                    if outcome == TransferOutcome::Success && self.options.refresh_every > 0 {
                        ledger.completed_since_refresh += 1;
                        if ledger.completed_since_refresh >= self.options.refresh_every {
                            ledger.completed_since_refresh = 0;
                            refresh = true;
                        }
                    }
                    true
                }
                _ => false,
            }
        };

        if applied {
            if outcome == TransferOutcome::Success {
                self.cache.evict(key);
            }
            self.status.push(key.to_string(), outcome.to_update());
        } else {
            debug!("忽略过期的上传结果: key={}, attempt={}", key, attempt);
        }

        if refresh {
            self.refresh_listing();
        }
        self.pump();
    }

    /// 批次结束：写出缓冲、刷新列表、通知空闲，全部成功时安排自动收起
    fn on_run_complete(self: &Arc<Self>, generation: u64) {
        self.flush();
        self.refresh_listing();

        let counters = self.store.snapshot().counters.clone();
        {
            let ledger = self.ledger.lock();
            if ledger.run_generation != generation || ledger.running {
                return;
            }
            self.idle_tx.send_replace(true);
        }

        info!(
            "🎉 上传批次结束: 成功 {}, 失败 {}, 取消 {}",
            counters.done, counters.failed, counters.canceled
        );

        let Some(delay) = self.options.auto_dismiss_delay else {
            return;
        };
        if !counters.all_done() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };

        let weak: Weak<SchedulerInner> = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let ledger = inner.ledger.lock();
                if ledger.run_generation != generation || ledger.running {
                    return;
                }
            }
            let removed = inner.drop_tasks(|t| t.status == UploadTaskStatus::Done);
            inner.store.set_panel_open(false);
            inner.refresh_listing();
            debug!("批次全部成功，已自动收起 {} 个任务", removed);
        });
    }

    /// 从列表和账本中移除满足条件的任务
    fn drop_tasks(&self, predicate: impl Fn(&UploadTask) -> bool) -> usize {
        let removed = self.store.remove_where(predicate);
        if removed.is_empty() {
            return 0;
        }

        let mut ledger = self.ledger.lock();
        for key in &removed {
            let in_flight = ledger
                .slots
                .get(key)
                .map(|s| s.status == UploadTaskStatus::Uploading)
                .unwrap_or(false);
            if !in_flight {
                ledger.slots.remove(key);
                self.cache.evict(key);
            }
        }
        removed.len()
    }

    /// 后台刷新一次当前前缀的列表
    fn refresh_listing(&self) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let object_store = self.object_store.clone();
        let store = self.store.clone();
        let prefix = store.current_prefix();

        handle.spawn(async move {
            match object_store.list_objects(&prefix, None).await {
                Ok(page) => {
                    debug!(
                        "列表刷新完成: prefix={:?}, 对象 {} 个, 目录 {} 个",
                        prefix,
                        page.objects.len(),
                        page.prefixes.len()
                    );
                    store.mark_listing_refreshed();
                }
                Err(e) => warn!("列表刷新失败: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    fn test_options(max_concurrent: usize) -> SchedulerOptions {
        SchedulerOptions {
            max_concurrent,
            live_refresh_interval: None,
            auto_dismiss_delay: None,
            ..SchedulerOptions::default()
        }
    }

    fn create_test_scheduler(
        options: SchedulerOptions,
    ) -> (UploadScheduler, Arc<UploadStore>, Arc<MemoryObjectStore>) {
        let store = Arc::new(UploadStore::new());
        let object_store = Arc::new(MemoryObjectStore::new());
        let scheduler = UploadScheduler::new(store.clone(), object_store.clone(), options);
        (scheduler, store, object_store)
    }

    /// 追加 n 个任务并入队，key 为 f0..f{n-1}
    fn submit(scheduler: &UploadScheduler, store: &UploadStore, n: usize) -> Vec<String> {
        let keys: Vec<String> = (0..n).map(|i| format!("f{}", i)).collect();
        store.append_batch(keys.iter().map(|k| UploadTask::new(k, k, 4)).collect());
        for key in &keys {
            scheduler.stash(key, UploadContent::from_bytes(vec![1u8; 4]));
        }
        scheduler.enqueue(keys.clone());
        keys
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_cancel_all_right_after_enqueue() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(2));
        submit(&scheduler, &store, 2);

        // 任务已标记为上传中，但传输协程还没来得及运行
        assert_eq!(scheduler.status_of("f0"), Some(UploadTaskStatus::Uploading));
        assert_eq!(scheduler.cancel_all(), 2);
        scheduler.wait_idle().await;

        assert_eq!(object_store.put_count(), 0);
        assert_eq!(object_store.object_count(), 0);
        assert_eq!(store.snapshot().counters.canceled, 2);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_reenqueue_cancels_superseded_transfer() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(2));
        object_store.hold_puts();
        submit(&scheduler, &store, 1);
        object_store.wait_for_puts(1).await;

        // 同 key 再次提交，旧传输被取消，新尝试正常完成
        scheduler.enqueue(vec!["f0".to_string()]);
        object_store.release_all();
        scheduler.wait_idle().await;

        assert_eq!(store.task("f0").unwrap().status, UploadTaskStatus::Done);
        assert_eq!(object_store.object_count(), 1);
        assert!(scheduler.peak_active() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_flush_applies_pending_status_first() {
        let store = Arc::new(UploadStore::new());
        store.append_batch(vec![UploadTask::new("a", "a", 10)]);
        let options = SchedulerOptions {
            progress_flush: Duration::from_millis(10),
            status_flush: Duration::from_millis(500),
            ..test_options(1)
        };
        let (progress, status) = update_channels(&store, &options);

        status.push("a", StatusUpdate::new(UploadTaskStatus::Uploading));
        progress.push("a", 0.4);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let task = store.task("a").unwrap();
        assert_eq!(task.status, UploadTaskStatus::Uploading);
        assert_eq!(task.progress, 0.4);
        assert_eq!(status.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_fifo_with_concurrency_limit() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(2));
        object_store.hold_puts();
        let keys = submit(&scheduler, &store, 5);

        object_store.wait_for_puts(2).await;
        settle().await;
        assert_eq!(object_store.put_log(), vec!["f0", "f1"]);
        assert_eq!(scheduler.active_count(), 2);

        object_store.release("f0");
        object_store.wait_for_puts(3).await;
        assert_eq!(object_store.put_log()[2], "f2");

        object_store.release_all();
        scheduler.wait_idle().await;

        assert_eq!(object_store.put_log(), keys);
        assert_eq!(scheduler.peak_active(), 2);
        assert!(object_store.peak_in_flight() <= 2);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.counters.done, 5);
        assert!(snapshot.tasks.iter().all(|t| t.progress == 1.0));
    }

    #[tokio::test]
    async fn test_global_cap_of_ten() {
        let (scheduler, store, object_store) =
            create_test_scheduler(test_options(DEFAULT_MAX_CONCURRENT));
        object_store.hold_puts();
        submit(&scheduler, &store, 12);

        object_store.wait_for_puts(10).await;
        settle().await;
        assert_eq!(object_store.put_count(), 10);
        assert_eq!(object_store.in_flight(), 10);

        object_store.release_all();
        scheduler.wait_idle().await;

        assert_eq!(object_store.peak_in_flight(), 10);
        assert_eq!(scheduler.peak_active(), 10);
        assert_eq!(store.snapshot().counters.done, 12);
    }

    #[tokio::test]
    async fn test_cancel_all_then_retry() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(2));
        object_store.hold_puts();
        submit(&scheduler, &store, 5);
        object_store.wait_for_puts(2).await;

        assert_eq!(scheduler.cancel_all(), 5);
        scheduler.wait_idle().await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.counters.canceled, 5);
        assert_eq!(object_store.object_count(), 0);
        // 排队中的任务从未启动
        assert_eq!(object_store.put_count(), 2);
        assert_eq!(scheduler.active_count(), 0);

        object_store.release_all();
        assert_eq!(scheduler.retry_failed(), 5);
        scheduler.wait_idle().await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.counters.done, 5);
        assert_eq!(object_store.object_count(), 5);
    }

    #[tokio::test]
    async fn test_cancel_all_leaves_done_tasks() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(2));
        submit(&scheduler, &store, 2);
        scheduler.wait_idle().await;

        assert_eq!(scheduler.cancel_all(), 0);
        assert_eq!(store.snapshot().counters.done, 2);
        assert_eq!(object_store.object_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_content_fails_without_slot() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(2));
        store.append_batch(vec![UploadTask::new("ghost", "ghost", 1)]);
        scheduler.enqueue(vec!["ghost".to_string()]);
        scheduler.wait_idle().await;

        let task = store.task("ghost").unwrap();
        assert_eq!(task.status, UploadTaskStatus::Error);
        assert_eq!(task.error.as_deref(), Some(CONTENT_MISSING));
        assert_eq!(scheduler.peak_active(), 0);
        assert_eq!(object_store.put_count(), 0);

        // 全部取消会把失败的任务也标记为已取消
        assert_eq!(scheduler.cancel_all(), 1);
        assert_eq!(store.task("ghost").unwrap().status, UploadTaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_retryable() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(3));
        object_store.fail_put("f1", "quota exceeded");
        submit(&scheduler, &store, 3);
        scheduler.wait_idle().await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.counters.done, 2);
        assert_eq!(snapshot.counters.failed, 1);
        assert_eq!(store.task("f1").unwrap().error.as_deref(), Some("quota exceeded"));
        // 失败的任务保留内容以便重试
        assert!(scheduler.has_content("f1"));
        assert!(!scheduler.has_content("f0"));

        object_store.heal("f1");
        assert_eq!(scheduler.retry_failed(), 1);
        scheduler.wait_idle().await;
        assert_eq!(store.snapshot().counters.done, 3);
        assert!(store.task("f1").unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_stale_completion_only_releases_slot() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(1));
        object_store.hold_puts();
        submit(&scheduler, &store, 1);
        object_store.wait_for_puts(1).await;

        scheduler.cancel_all();
        // 旧尝试尚未返回时立即重试
        scheduler.retry_failed();
        object_store.wait_for_puts(2).await;
        assert!(scheduler.peak_active() <= 1);
        assert_eq!(scheduler.status_of("f0"), Some(UploadTaskStatus::Uploading));

        object_store.release_all();
        scheduler.wait_idle().await;
        assert_eq!(store.task("f0").unwrap().status, UploadTaskStatus::Done);
        assert_eq!(object_store.put_count(), 2);
    }

    #[tokio::test]
    async fn test_periodic_listing_refresh() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(10));
        submit(&scheduler, &store, 120);
        scheduler.wait_idle().await;
        settle().await;

        // 第 50、100 个完成时各一次，批次结束时一次
        assert_eq!(object_store.list_calls(), 3);
        assert_eq!(store.snapshot().listing_refreshes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_dismiss_after_all_done() {
        let options = SchedulerOptions {
            auto_dismiss_delay: Some(Duration::from_millis(2000)),
            ..test_options(4)
        };
        let (scheduler, store, _object_store) = create_test_scheduler(options);
        submit(&scheduler, &store, 3);
        scheduler.wait_idle().await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.tasks.len(), 3);
        assert!(snapshot.panel_open);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let snapshot = store.snapshot();
        assert!(snapshot.tasks.is_empty());
        assert!(!snapshot.panel_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_auto_dismiss_with_failures() {
        let options = SchedulerOptions {
            auto_dismiss_delay: Some(Duration::from_millis(2000)),
            ..test_options(4)
        };
        let (scheduler, store, object_store) = create_test_scheduler(options);
        object_store.fail_put("f2", "boom");
        submit(&scheduler, &store, 3);
        scheduler.wait_idle().await;

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(store.snapshot().tasks.len(), 3);
    }

    #[tokio::test]
    async fn test_clear_completed_and_dismiss() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(2));
        object_store.fail_put("f0", "boom");
        submit(&scheduler, &store, 3);
        scheduler.wait_idle().await;

        assert_eq!(scheduler.clear_completed(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(scheduler.status_of("f1"), None);

        assert_eq!(scheduler.dismiss(), 1);
        assert!(store.is_empty());
        assert!(!store.snapshot().panel_open);
        assert!(!scheduler.has_content("f0"));
    }

    #[tokio::test]
    async fn test_clear_cancels_in_flight() {
        let (scheduler, store, object_store) = create_test_scheduler(test_options(2));
        object_store.hold_puts();
        submit(&scheduler, &store, 4);
        object_store.wait_for_puts(2).await;

        scheduler.clear();
        scheduler.wait_idle().await;

        assert!(store.is_empty());
        assert_eq!(object_store.object_count(), 0);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_cache_on_cancel() {
        let options = SchedulerOptions {
            clear_cache_on_cancel: true,
            ..test_options(1)
        };
        let (scheduler, store, object_store) = create_test_scheduler(options);
        object_store.hold_puts();
        submit(&scheduler, &store, 2);
        object_store.wait_for_puts(1).await;

        scheduler.cancel_all();
        scheduler.wait_idle().await;
        object_store.release_all();

        // 内容已被清空，重试直接失败
        assert_eq!(scheduler.retry_failed(), 2);
        scheduler.wait_idle().await;
        let snapshot = store.snapshot();
        assert_eq!(snapshot.counters.failed, 2);
        assert!(snapshot
            .tasks
            .iter()
            .all(|t| t.error.as_deref() == Some(CONTENT_MISSING)));
    }
}
