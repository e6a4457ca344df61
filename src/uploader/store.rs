// 上传任务列表与快照
//
// 任务列表是展示层的唯一数据源：
// - 合并器批量写入进度和状态
// - 管理器追加批次、清理已完成任务
// - 每次变更后通过 watch 通道发布一份不可变快照
//
// 调度决策不读取这里的状态（调度器有自己的账本），
// 这里只负责"给人看"。

use crate::uploader::task::{StatusUpdate, UploadTask, UploadTaskStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// 规范化当前前缀：去掉首尾斜杠，非空时补一个结尾斜杠
///
/// `"/photos/2024/"` -> `"photos/2024/"`，`"/"` -> `""`
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// 由任务列表推导出的统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadCounters {
    pub total: usize,
    pub queued: usize,
    pub uploading: usize,
    pub done: usize,
    pub failed: usize,
    pub canceled: usize,
    /// 总体进度：完成、失败、取消计 1，上传中计其进度，排队计 0
    pub overall_progress: f64,
    /// 非空且没有排队和上传中的任务
    pub is_complete: bool,
}

impl UploadCounters {
    pub fn from_tasks(tasks: &[UploadTask]) -> Self {
        let mut counters = UploadCounters {
            total: tasks.len(),
            ..Default::default()
        };
        let mut progress_sum = 0.0;

        for task in tasks {
            match task.status {
                UploadTaskStatus::Queued => counters.queued += 1,
                UploadTaskStatus::Uploading => {
                    counters.uploading += 1;
                    progress_sum += task.progress.clamp(0.0, 1.0);
                }
                UploadTaskStatus::Done => {
                    counters.done += 1;
                    progress_sum += 1.0;
                }
                UploadTaskStatus::Error => {
                    counters.failed += 1;
                    progress_sum += 1.0;
                }
                UploadTaskStatus::Canceled => {
                    counters.canceled += 1;
                    progress_sum += 1.0;
                }
            }
        }

        if counters.total > 0 {
            counters.overall_progress = progress_sum / counters.total as f64;
        }
        counters.is_complete =
            counters.total > 0 && counters.queued == 0 && counters.uploading == 0;
        counters
    }

    /// 是否全部成功
    pub fn all_done(&self) -> bool {
        self.total > 0 && self.done == self.total
    }
}

/// 发布给订阅方的快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadSnapshot {
    pub tasks: Vec<UploadTask>,
    pub counters: UploadCounters,
    /// 是否在准备阶段（存在性查询中）
    pub preparing: bool,
    /// 准备中的文件数量
    pub preparing_count: usize,
    /// 上传面板是否打开
    pub panel_open: bool,
    /// 当前前缀
    pub current_prefix: String,
    /// 列表刷新成功次数
    pub listing_refreshes: u64,
}

#[derive(Default)]
struct StoreState {
    tasks: Vec<UploadTask>,
    /// key -> tasks 中的下标
    index: HashMap<String, usize>,
    preparing_count: Option<usize>,
    panel_open: bool,
    current_prefix: String,
    listing_refreshes: u64,
}

impl StoreState {
    fn reindex(&mut self) {
        self.index = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.key.clone(), i))
            .collect();
    }

    fn to_snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            tasks: self.tasks.clone(),
            counters: UploadCounters::from_tasks(&self.tasks),
            preparing: self.preparing_count.is_some(),
            preparing_count: self.preparing_count.unwrap_or(0),
            panel_open: self.panel_open,
            current_prefix: self.current_prefix.clone(),
            listing_refreshes: self.listing_refreshes,
        }
    }
}

/// 上传任务列表
pub struct UploadStore {
    state: Mutex<StoreState>,
    tx: watch::Sender<Arc<UploadSnapshot>>,
}

impl Default for UploadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(UploadSnapshot::default()));
        Self {
            state: Mutex::new(StoreState::default()),
            tx,
        }
    }

    /// 在锁内修改状态并发布快照
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.tx.send_replace(Arc::new(state.to_snapshot()));
        result
    }

    /// 订阅快照
    pub fn subscribe(&self) -> watch::Receiver<Arc<UploadSnapshot>> {
        self.tx.subscribe()
    }

    /// 最新快照
    pub fn snapshot(&self) -> Arc<UploadSnapshot> {
        self.tx.borrow().clone()
    }

    // =====================================================
    // 面板与前缀
    // =====================================================

    /// 进入准备阶段
    pub fn begin_preparing(&self, count: usize) {
        self.mutate(|s| {
            s.preparing_count = Some(count);
            s.panel_open = true;
        });
    }

    pub fn finish_preparing(&self) {
        self.mutate(|s| s.preparing_count = None);
    }

    pub fn set_panel_open(&self, open: bool) {
        self.mutate(|s| s.panel_open = open);
    }

    pub fn current_prefix(&self) -> String {
        self.state.lock().current_prefix.clone()
    }

    /// 设置当前前缀（自动规范化）
    pub fn set_current_prefix(&self, prefix: &str) {
        let prefix = normalize_prefix(prefix);
        self.mutate(|s| s.current_prefix = prefix);
    }

    /// 记录一次成功的列表刷新
    pub fn mark_listing_refreshed(&self) {
        self.mutate(|s| s.listing_refreshes += 1);
    }

    // =====================================================
    // 任务列表
    // =====================================================

    /// 追加一个批次
    ///
    /// 已存在同 key 的任务时原位替换（后写入者为准）
    pub fn append_batch(&self, tasks: Vec<UploadTask>) {
        self.mutate(|s| {
            for task in tasks {
                match s.index.get(&task.key) {
                    Some(&i) => s.tasks[i] = task,
                    None => {
                        s.index.insert(task.key.clone(), s.tasks.len());
                        s.tasks.push(task);
                    }
                }
            }
            s.panel_open = true;
        });
    }

    /// 批量写入进度
    pub fn apply_progress(&self, updates: HashMap<String, f64>) {
        self.mutate(|s| {
            for (key, progress) in updates {
                if let Some(&i) = s.index.get(&key) {
                    s.tasks[i].apply_progress(progress);
                }
            }
        });
    }

    /// 批量写入状态
    pub fn apply_status(&self, updates: HashMap<String, StatusUpdate>) {
        self.mutate(|s| {
            for (key, update) in updates {
                if let Some(&i) = s.index.get(&key) {
                    s.tasks[i].apply_status(&update);
                }
            }
        });
    }

    pub fn task(&self, key: &str) -> Option<UploadTask> {
        let state = self.state.lock();
        state.index.get(key).map(|&i| state.tasks[i].clone())
    }

    /// 按列表顺序返回 (key, 状态)
    pub fn keys_in_order(&self) -> Vec<(String, UploadTaskStatus)> {
        self.state
            .lock()
            .tasks
            .iter()
            .map(|t| (t.key.clone(), t.status))
            .collect()
    }

    /// 删除满足条件的任务，返回被删除的 key
    pub fn remove_where(&self, predicate: impl Fn(&UploadTask) -> bool) -> Vec<String> {
        self.mutate(|s| {
            let mut removed = Vec::new();
            s.tasks.retain(|t| {
                if predicate(t) {
                    removed.push(t.key.clone());
                    false
                } else {
                    true
                }
            });
            if !removed.is_empty() {
                s.reindex();
            }
            removed
        })
    }

    /// 清空任务列表并关闭面板
    pub fn clear(&self) -> Vec<String> {
        self.mutate(|s| {
            let removed = s.tasks.drain(..).map(|t| t.key).collect();
            s.index.clear();
            s.panel_open = false;
            s.preparing_count = None;
            removed
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tasks.is_empty()
    }
}
