// 内存对象存储
//
// 与 HttpObjectStore 行为一致的内存实现：
// - CLI 的 --dry-run 模式使用它走完整流程而不产生网络请求
// - 测试中用于注入失败、卡住上传、统计并发峰值

use crate::storage::{ListPage, ObjectEntry, ObjectStore, ProgressFn, StorageError};
use crate::uploader::UploadContent;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 默认进度回调粒度（16KB）
const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// 内存对象存储
#[derive(Debug)]
pub struct MemoryObjectStore {
    /// 已存储对象 key -> 内容
    objects: DashMap<String, Vec<u8>>,
    /// 注入的上传失败 key -> 错误信息
    put_failures: DashMap<String, String>,
    /// 存在性查询是否失败
    fail_exists: AtomicBool,
    /// 包含这些 key 的存在性查询批次失败
    exists_failures: DashSet<String>,
    /// 目录占位创建是否失败
    fail_folders: AtomicBool,
    /// 是否卡住上传，直到 release
    holding: AtomicBool,
    /// 每个 key 的放行闸门
    gates: DashMap<String, Arc<Semaphore>>,
    /// 当前正在执行的上传数
    in_flight: AtomicUsize,
    /// 上传并发峰值
    peak_in_flight: AtomicUsize,
    /// 上传开始顺序
    put_log: Mutex<Vec<String>>,
    /// 每次存在性查询的批大小
    exists_batches: Mutex<Vec<usize>>,
    /// 目录占位创建记录 (parent_prefix, name)
    folder_calls: Mutex<Vec<(String, String)>>,
    /// 列表调用次数
    list_calls: AtomicUsize,
    /// 进度回调粒度
    chunk_size: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

/// 在途上传计数守卫
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// 指定进度回调粒度
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            objects: DashMap::new(),
            put_failures: DashMap::new(),
            fail_exists: AtomicBool::new(false),
            exists_failures: DashSet::new(),
            fail_folders: AtomicBool::new(false),
            holding: AtomicBool::new(false),
            gates: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            put_log: Mutex::new(Vec::new()),
            exists_batches: Mutex::new(Vec::new()),
            folder_calls: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            chunk_size: chunk_size.max(1),
        }
    }

    // =====================================================
    // 预置数据与故障注入
    // =====================================================

    /// 预置一个已存在的对象
    pub fn insert_object(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.objects.insert(key.into(), data.into());
    }

    /// 读取对象内容
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|v| v.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// 让指定 key 的上传失败，直到 `heal`
    pub fn fail_put(&self, key: impl Into<String>, message: impl Into<String>) {
        self.put_failures.insert(key.into(), message.into());
    }

    /// 取消指定 key 的失败注入
    pub fn heal(&self, key: &str) {
        self.put_failures.remove(key);
    }

    pub fn set_fail_exists(&self, fail: bool) {
        self.fail_exists.store(fail, Ordering::SeqCst);
    }

    /// 让包含该 key 的存在性查询批次失败
    pub fn fail_exists_for(&self, key: impl Into<String>) {
        self.exists_failures.insert(key.into());
    }

    pub fn set_fail_folders(&self, fail: bool) {
        self.fail_folders.store(fail, Ordering::SeqCst);
    }

    // =====================================================
    // 上传闸门
    // =====================================================

    /// 之后开始的上传都会卡住，直到 `release` / `release_all`
    pub fn hold_puts(&self) {
        self.holding.store(true, Ordering::SeqCst);
    }

    /// 放行指定 key 的一次上传（可以先于上传开始调用）
    pub fn release(&self, key: &str) {
        self.gate(key).add_permits(1);
    }

    /// 放行所有上传，并停止卡住后续上传
    pub fn release_all(&self) {
        self.holding.store(false, Ordering::SeqCst);
        for gate in self.gates.iter() {
            gate.value().close();
        }
    }

    fn gate(&self, key: &str) -> Arc<Semaphore> {
        self.gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    // =====================================================
    // 调用统计
    // =====================================================

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// 按开始顺序返回上传过的 key（重试会重复出现）
    pub fn put_log(&self) -> Vec<String> {
        self.put_log.lock().clone()
    }

    pub fn put_count(&self) -> usize {
        self.put_log.lock().len()
    }

    pub fn exists_batches(&self) -> Vec<usize> {
        self.exists_batches.lock().clone()
    }

    pub fn folder_calls(&self) -> Vec<(String, String)> {
        self.folder_calls.lock().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// 等待至少 `count` 次上传已经开始
    pub async fn wait_for_puts(&self, count: usize) {
        while self.put_count() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists_batch(&self, keys: &[String]) -> Result<HashMap<String, bool>, StorageError> {
        self.exists_batches.lock().push(keys.len());

        if self.fail_exists.load(Ordering::SeqCst)
            || keys.iter().any(|k| self.exists_failures.contains(k))
        {
            return Err(StorageError::Status {
                status: 500,
                body: "exists check failed".to_string(),
            });
        }

        Ok(keys
            .iter()
            .map(|k| (k.clone(), self.objects.contains_key(k)))
            .collect())
    }

    async fn put_object(
        &self,
        key: &str,
        content: UploadContent,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<(), StorageError> {
        self.put_log.lock().push(key.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        // 先登记闸门再检查 holding，避免与 release_all 竞争
        let gate = self.gate(key);
        if self.holding.load(Ordering::SeqCst) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StorageError::Aborted),
                permit = gate.acquire() => {
                    // 闸门关闭表示全部放行
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
            }
        }

        if let Some(message) = self.put_failures.get(key) {
            return Err(StorageError::Other(message.clone()));
        }

        let data = content.read_all().await?;
        let total = data.len() as u64;
        let mut sent = 0u64;
        for chunk in data.chunks(self.chunk_size) {
            if cancel.is_cancelled() {
                return Err(StorageError::Aborted);
            }
            sent += chunk.len() as u64;
            on_progress(sent, total);
            tokio::task::yield_now().await;
        }
        if cancel.is_cancelled() {
            return Err(StorageError::Aborted);
        }

        debug!("内存存储写入对象: key={}, size={}", key, total);
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn create_folder_marker(
        &self,
        parent_prefix: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        self.folder_calls
            .lock()
            .push((parent_prefix.to_string(), name.to_string()));

        if self.fail_folders.load(Ordering::SeqCst) {
            return Err(StorageError::Other("folder create failed".to_string()));
        }

        self.objects
            .insert(format!("{}{}/", parent_prefix, name), Vec::new());
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        _token: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let mut objects = BTreeMap::new();
        let mut prefixes = BTreeSet::new();
        for item in self.objects.iter() {
            let Some(rest) = item.key().strip_prefix(prefix) else {
                continue;
            };
            match rest.find('/') {
                // 目录占位对象自身归入 prefixes
                Some(idx) => {
                    prefixes.insert(format!("{}{}", prefix, &rest[..=idx]));
                }
                None if !rest.is_empty() => {
                    objects.insert(
                        item.key().clone(),
                        ObjectEntry {
                            key: item.key().clone(),
                            size: item.value().len() as u64,
                            last_modified: None,
                        },
                    );
                }
                None => {}
            }
        }

        Ok(ListPage {
            objects: objects.into_values().collect(),
            prefixes: prefixes.into_iter().collect(),
            next_token: None,
        })
    }
}
