// 上传执行器
//
// 核心功能：
// 1. 执行单个对象的上传（一次网络传输）
// 2. 字节级进度转换为 [0, 1] 的单调进度
// 3. 通过 TransferHandles 登记取消令牌，支持按 key 取消和全部取消
// 4. 区分三种结果：成功、失败、取消
//
// 取消语义：
// - 令牌触发后立即返回 Canceled，不等待底层请求结束
// - 取消之后观察到的传输错误一律视为 Canceled

use crate::storage::{ObjectStore, ProgressFn};
use crate::uploader::task::{StatusUpdate, UploadTaskStatus};
use crate::uploader::UploadContent;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 执行器上报的小数进度
pub type FractionFn = Arc<dyn Fn(f64) + Send + Sync>;

// =====================================================
// 传输句柄表
// =====================================================

/// 在途传输的取消句柄表：key -> (登记序号, 取消令牌)
///
/// 句柄只在传输期间存在，由 `HandleGuard` 在任何退出路径上移除
#[derive(Debug, Default)]
pub struct TransferHandles {
    handles: DashMap<String, (u64, CancellationToken)>,
    next_id: AtomicU64,
}

/// 句柄登记守卫
///
/// Drop 时只移除自己登记的那一条，不会误删同 key 的新登记
#[derive(Debug)]
pub struct HandleGuard {
    table: Arc<TransferHandles>,
    key: String,
    id: u64,
    token: CancellationToken,
}

impl HandleGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.table
            .handles
            .remove_if(&self.key, |_, (id, _)| *id == self.id);
    }
}

impl TransferHandles {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为 key 登记新的取消令牌
    pub fn register(self: &Arc<Self>, key: &str) -> HandleGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.handles
            .insert(key.to_string(), (id, token.clone()));
        HandleGuard {
            table: self.clone(),
            key: key.to_string(),
            id,
            token,
        }
    }

    /// 取消指定 key 的传输，返回是否存在在途传输
    pub fn cancel(&self, key: &str) -> bool {
        match self.handles.remove(key) {
            Some((_, (_, token))) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部在途传输，返回取消数量
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handles.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

// =====================================================
// 传输结果
// =====================================================

/// 单次传输的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// 上传成功
    Success,
    /// 上传失败（错误信息）
    Failed(String),
    /// 被取消
    Canceled,
}

impl TransferOutcome {
    /// 对应的任务终态
    pub fn status(&self) -> UploadTaskStatus {
        match self {
            TransferOutcome::Success => UploadTaskStatus::Done,
            TransferOutcome::Failed(_) => UploadTaskStatus::Error,
            TransferOutcome::Canceled => UploadTaskStatus::Canceled,
        }
    }

    /// 转换为状态通道的更新
    pub fn to_update(&self) -> StatusUpdate {
        match self {
            TransferOutcome::Success => StatusUpdate::done(),
            TransferOutcome::Failed(message) => StatusUpdate::failed(message.clone()),
            TransferOutcome::Canceled => StatusUpdate::new(UploadTaskStatus::Canceled),
        }
    }
}

// =====================================================
// 进度换算
// =====================================================

/// 字节进度 -> 单调的小数进度
///
/// 小数以 f64 位模式存放在 AtomicU64 中，CAS 保证只增不减
struct ProgressReporter {
    last_bits: AtomicU64,
    on_progress: FractionFn,
    token: CancellationToken,
}

impl ProgressReporter {
    fn new(on_progress: FractionFn, token: CancellationToken) -> Self {
        Self {
            last_bits: AtomicU64::new(0f64.to_bits()),
            on_progress,
            token,
        }
    }

    fn report(&self, sent: u64, total: u64) {
        // 取消后不再上报，避免进度覆盖 canceled 状态
        if self.token.is_cancelled() {
            return;
        }

        let fraction = (sent as f64 / total.max(1) as f64).clamp(0.0, 1.0);
        let mut current = self.last_bits.load(Ordering::Relaxed);
        loop {
            if fraction <= f64::from_bits(current) {
                return;
            }
            match self.last_bits.compare_exchange_weak(
                current,
                fraction.to_bits(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        (self.on_progress)(fraction);
    }
}

// =====================================================
// 上传执行器
// =====================================================

/// 上传执行器
///
/// 每次 `transfer` 对应一次网络传输，不做重试（重试由用户显式发起）
pub struct UploadEngine {
    /// 对象存储
    store: Arc<dyn ObjectStore>,
    /// 在途传输句柄
    handles: Arc<TransferHandles>,
}

impl UploadEngine {
    pub fn new(store: Arc<dyn ObjectStore>, handles: Arc<TransferHandles>) -> Self {
        Self { store, handles }
    }

    pub fn handles(&self) -> &Arc<TransferHandles> {
        &self.handles
    }

    /// 为即将开始的传输登记取消句柄
    ///
    /// 调度器在把任务标记为上传中的同一把锁内调用，
    /// 保证句柄先于任何取消操作可见
    pub fn register(&self, key: &str) -> HandleGuard {
        self.handles.register(key)
    }

    /// 上传单个对象
    ///
    /// 句柄在传输结束（任何退出路径）时随 `guard` 一起释放
    ///
    /// # 参数
    /// * `guard` - `register` 返回的句柄守卫，决定目标 key
    /// * `content` - 上传内容
    /// * `on_progress` - 小数进度回调，只在进度增加时调用
    pub async fn transfer(
        &self,
        guard: HandleGuard,
        content: UploadContent,
        on_progress: FractionFn,
    ) -> TransferOutcome {
        let key = guard.key();
        let token = guard.token().clone();

        let reporter = Arc::new(ProgressReporter::new(on_progress, token.clone()));
        let progress_fn: ProgressFn = {
            let reporter = reporter.clone();
            Arc::new(move |sent, total| reporter.report(sent, total))
        };

        debug!("开始上传: key={}, size={}", key, content.len());

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("上传已取消: key={}", key);
                return TransferOutcome::Canceled;
            }
            result = self.store.put_object(key, content, progress_fn, token.clone()) => result,
        };

        match result {
            Ok(()) => {
                debug!("上传成功: key={}", key);
                TransferOutcome::Success
            }
            Err(e) if e.is_aborted() || token.is_cancelled() => {
                info!("上传已取消: key={}", key);
                TransferOutcome::Canceled
            }
            Err(e) => {
                warn!("上传失败: key={}, 错误: {}", key, e);
                TransferOutcome::Failed(e.to_string())
            }
        }
    }
}
