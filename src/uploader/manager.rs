// 上传管理器
//
// 对外的唯一入口，把一次批量提交串成完整流程：
// 1. 按当前前缀计算目标 key（同批次重复 key 以后出现的为准）
// 2. 分批存在性查询（准备阶段）
// 3. 存在冲突时询问策略，按策略调整批次
// 4. 内容写入缓存，任务追加到列表并入队
// 5. 后台为空目录创建占位对象
//
// 其余操作（取消、重试、清理）转交调度器。

use crate::config::UploadConfig;
use crate::storage::ObjectStore;
use crate::uploader::collision::{
    count_collisions, resolve_keys, CollisionPolicy, CollisionPrompt,
};
use crate::uploader::content::UploadContent;
use crate::uploader::oracle::ExistenceOracle;
use crate::uploader::scheduler::{SchedulerOptions, UploadScheduler};
use crate::uploader::store::{UploadSnapshot, UploadStore};
use crate::uploader::task::UploadTask;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 批次中的一个上传项
#[derive(Debug, Clone)]
pub struct UploadEntry {
    /// 上传内容
    pub content: UploadContent,
    /// 相对路径（相对于当前前缀）
    pub relative_path: String,
}

impl UploadEntry {
    pub fn new(content: UploadContent, relative_path: impl Into<String>) -> Self {
        Self {
            content,
            relative_path: relative_path.into(),
        }
    }
}

/// 批次提交结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReceipt {
    /// 提交的项数（去重前）
    pub submitted: usize,
    /// 最终入队的 key
    pub scheduled: Vec<String>,
    /// 被跳过的 key
    pub skipped: Vec<String>,
    /// 重命名 (原 key, 新 key)
    pub renamed: Vec<(String, String)>,
    /// 已存在的 key 数量
    pub collisions: usize,
    /// 选择的冲突策略，没有冲突时为 None
    pub policy: Option<CollisionPolicy>,
}

impl BatchReceipt {
    /// 批次是否被整体放弃
    pub fn is_aborted(&self) -> bool {
        self.scheduled.is_empty()
    }
}

/// 规范化相对路径：反斜杠转为斜杠，去掉开头的斜杠
pub fn normalize_relative(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// 需要创建占位对象的空目录
///
/// 目录下已有本批次文件时跳过。返回 (父前缀, 目录名)
///
/// # 参数
/// * `base` - 规范化后的当前前缀
/// * `dir_paths` - 相对目录路径
/// * `file_keys` - 本批次最终的文件 key
pub fn plan_directory_markers(
    base: &str,
    dir_paths: &[String],
    file_keys: &[String],
) -> Vec<(String, String)> {
    let mut markers = Vec::new();
    for dir in dir_paths {
        let rel = dir.replace('\\', "/");
        let rel = rel.trim_matches('/');
        if rel.is_empty() {
            continue;
        }

        let full = format!("{}{}/", base, rel);
        if file_keys.iter().any(|k| k.starts_with(&full)) {
            continue;
        }

        let (parent, name) = match rel.rfind('/') {
            Some(idx) => (&rel[..=idx], &rel[idx + 1..]),
            None => ("", rel),
        };
        if name.is_empty() {
            continue;
        }
        markers.push((format!("{}{}", base, parent), name.to_string()));
    }
    markers
}

/// 计划中的上传项
struct PlannedItem {
    key: String,
    name: String,
    content: UploadContent,
}

/// 上传管理器
pub struct UploadManager {
    /// 任务列表
    store: Arc<UploadStore>,
    /// 对象存储
    object_store: Arc<dyn ObjectStore>,
    /// 调度器
    scheduler: UploadScheduler,
    /// 存在性查询
    oracle: ExistenceOracle,
    /// 冲突策略询问
    prompt: Arc<dyn CollisionPrompt>,
}

impl UploadManager {
    /// 从上传配置创建管理器
    ///
    /// # 参数
    /// * `object_store` - 对象存储
    /// * `prompt` - 冲突策略询问
    /// * `config` - 上传配置
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        prompt: Arc<dyn CollisionPrompt>,
        config: &UploadConfig,
    ) -> Self {
        Self::with_options(
            object_store,
            prompt,
            SchedulerOptions::from(config),
            config.exists_batch_size,
        )
    }

    /// 使用指定调度配置创建管理器
    pub fn with_options(
        object_store: Arc<dyn ObjectStore>,
        prompt: Arc<dyn CollisionPrompt>,
        options: SchedulerOptions,
        exists_batch_size: usize,
    ) -> Self {
        let store = Arc::new(UploadStore::new());
        let scheduler = UploadScheduler::new(store.clone(), object_store.clone(), options);
        let oracle = ExistenceOracle::new(object_store.clone(), exists_batch_size);

        Self {
            store,
            object_store,
            scheduler,
            oracle,
            prompt,
        }
    }

    /// 提交一个批次
    ///
    /// # 参数
    /// * `entries` - 上传项
    /// * `dir_paths` - 相对目录路径（用于为空目录创建占位对象）
    pub async fn submit_batch(
        &self,
        entries: Vec<UploadEntry>,
        dir_paths: Vec<String>,
    ) -> Result<BatchReceipt> {
        let mut receipt = BatchReceipt {
            submitted: entries.len(),
            ..Default::default()
        };
        let base = self.store.current_prefix();

        if entries.is_empty() {
            self.spawn_directory_markers(&base, &dir_paths, &[]);
            return Ok(receipt);
        }

        self.store.begin_preparing(entries.len());

        // 计算目标 key，同 key 以最后一次出现为准
        let mut planned: Vec<PlannedItem> = Vec::with_capacity(entries.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for entry in entries {
            let rel = normalize_relative(&entry.relative_path);
            if rel.is_empty() {
                warn!("忽略空的相对路径");
                continue;
            }
            let item = PlannedItem {
                key: format!("{}{}", base, rel),
                name: rel,
                content: entry.content,
            };
            match positions.get(&item.key) {
                Some(&pos) => {
                    debug!("批次内重复的 key，以后出现的为准: {}", item.key);
                    planned[pos] = item;
                }
                None => {
                    positions.insert(item.key.clone(), planned.len());
                    planned.push(item);
                }
            }
        }

        let keys: Vec<String> = planned.iter().map(|p| p.key.clone()).collect();
        let exists = self.oracle.check(&keys).await;
        self.store.finish_preparing();

        receipt.collisions = count_collisions(&keys, &exists);
        let resolved = if receipt.collisions > 0 {
            let prompt = self.prompt.clone();
            let (collisions, total) = (receipt.collisions, keys.len());
            let policy = tokio::task::spawn_blocking(move || prompt.choose(collisions, total))
                .await
                .context("询问冲突策略失败")?;
            info!(
                "{}/{} 个文件已存在，冲突策略: {}",
                collisions, total, policy
            );
            receipt.policy = Some(policy);
            resolve_keys(&keys, &exists, policy)
        } else {
            keys.iter().cloned().map(Some).collect()
        };

        let mut tasks = Vec::with_capacity(planned.len());
        for (item, final_key) in planned.into_iter().zip(resolved) {
            let Some(final_key) = final_key else {
                receipt.skipped.push(item.key);
                continue;
            };
            if final_key != item.key {
                receipt.renamed.push((item.key.clone(), final_key.clone()));
            }
            tasks.push(UploadTask::new(&final_key, item.name, item.content.len()));
            self.scheduler.stash(final_key.clone(), item.content);
            receipt.scheduled.push(final_key);
        }

        if tasks.is_empty() {
            info!("批次中没有需要上传的文件，已放弃");
            self.store.set_panel_open(false);
            return Ok(receipt);
        }

        info!(
            "🚀 提交上传批次: {} 个文件 (跳过 {}, 重命名 {})",
            receipt.scheduled.len(),
            receipt.skipped.len(),
            receipt.renamed.len()
        );

        self.store.append_batch(tasks);
        self.scheduler.enqueue(receipt.scheduled.clone());
        self.spawn_directory_markers(&base, &dir_paths, &receipt.scheduled);

        Ok(receipt)
    }

    /// 后台创建空目录占位对象，失败忽略
    fn spawn_directory_markers(&self, base: &str, dir_paths: &[String], file_keys: &[String]) {
        let markers = plan_directory_markers(base, dir_paths, file_keys);
        if markers.is_empty() {
            return;
        }

        let object_store = self.object_store.clone();
        tokio::spawn(async move {
            for (parent, name) in markers {
                if let Err(e) = object_store.create_folder_marker(&parent, &name).await {
                    debug!("创建目录占位失败(忽略): {}{}/ - {}", parent, name, e);
                }
            }
        });
    }

    // =====================================================
    // 订阅与查询
    // =====================================================

    pub fn subscribe(&self) -> watch::Receiver<Arc<UploadSnapshot>> {
        self.store.subscribe()
    }

    pub fn snapshot(&self) -> Arc<UploadSnapshot> {
        self.store.snapshot()
    }

    pub fn store(&self) -> &Arc<UploadStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &UploadScheduler {
        &self.scheduler
    }

    /// 设置之后批次的目标前缀
    pub fn set_current_prefix(&self, prefix: &str) {
        self.store.set_current_prefix(prefix);
    }

    // =====================================================
    // 任务操作
    // =====================================================

    pub fn cancel_all(&self) -> usize {
        self.scheduler.cancel_all()
    }

    pub fn retry_failed(&self) -> usize {
        self.scheduler.retry_failed()
    }

    pub fn clear_completed(&self) -> usize {
        self.scheduler.clear_completed()
    }

    pub fn dismiss(&self) -> usize {
        self.scheduler.dismiss()
    }

    pub fn clear(&self) {
        self.scheduler.clear()
    }

    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        info!("上传管理器已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use crate::uploader::collision::FixedPolicy;
    use crate::uploader::task::UploadTaskStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 记录调用次数的询问
    struct CountingPrompt {
        policy: CollisionPolicy,
        calls: AtomicUsize,
    }

    impl CollisionPrompt for CountingPrompt {
        fn choose(&self, _collision_count: usize, _total_count: usize) -> CollisionPolicy {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.policy
        }
    }

    fn test_options() -> SchedulerOptions {
        SchedulerOptions {
            live_refresh_interval: None,
            auto_dismiss_delay: None,
            ..SchedulerOptions::default()
        }
    }

    fn create_test_manager(
        policy: CollisionPolicy,
    ) -> (UploadManager, Arc<MemoryObjectStore>, Arc<CountingPrompt>) {
        let object_store = Arc::new(MemoryObjectStore::new());
        let prompt = Arc::new(CountingPrompt {
            policy,
            calls: AtomicUsize::new(0),
        });
        let manager =
            UploadManager::with_options(object_store.clone(), prompt.clone(), test_options(), 500);
        (manager, object_store, prompt)
    }

    fn entries(paths: &[&str]) -> Vec<UploadEntry> {
        paths
            .iter()
            .map(|p| UploadEntry::new(UploadContent::from_bytes(p.as_bytes().to_vec()), *p))
            .collect()
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("//a/b.txt"), "a/b.txt");
        assert_eq!(normalize_relative("dir\\sub\\c.txt"), "dir/sub/c.txt");
    }

    #[test]
    fn test_plan_directory_markers() {
        let dirs = vec![
            "photos".to_string(),
            "photos/empty/".to_string(),
            "docs\\deep\\nested".to_string(),
            "/".to_string(),
        ];
        let files = vec!["up/photos/a.jpg".to_string()];

        let markers = plan_directory_markers("up/", &dirs, &files);
        assert_eq!(
            markers,
            vec![
                ("up/photos/".to_string(), "empty".to_string()),
                ("up/docs/deep/".to_string(), "nested".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_collisions_keeps_keys_and_skips_prompt() {
        let (manager, object_store, prompt) = create_test_manager(CollisionPolicy::Rename);
        manager.set_current_prefix("/backup/");

        let receipt = manager
            .submit_batch(entries(&["a.txt", "dir/b.txt"]), vec![])
            .await
            .unwrap();
        manager.wait_idle().await;

        assert_eq!(receipt.scheduled, vec!["backup/a.txt", "backup/dir/b.txt"]);
        assert_eq!(receipt.policy, None);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
        assert!(object_store.contains("backup/dir/b.txt"));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.counters.done, 2);
        assert!(!snapshot.preparing);
        assert_eq!(snapshot.tasks[1].name, "dir/b.txt");
    }

    #[tokio::test]
    async fn test_skip_policy_schedules_remaining() {
        let (manager, object_store, prompt) = create_test_manager(CollisionPolicy::Skip);
        for i in [2, 5, 7] {
            object_store.insert_object(format!("f{}.txt", i), b"old".to_vec());
        }

        let paths: Vec<String> = (0..10).map(|i| format!("f{}.txt", i)).collect();
        let refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
        let receipt = manager.submit_batch(entries(&refs), vec![]).await.unwrap();
        manager.wait_idle().await;

        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
        assert_eq!(receipt.collisions, 3);
        assert_eq!(receipt.scheduled.len(), 7);
        assert_eq!(receipt.skipped, vec!["f2.txt", "f5.txt", "f7.txt"]);
        assert_eq!(object_store.object("f2.txt").unwrap(), b"old");
        assert_eq!(manager.snapshot().counters.total, 7);
    }

    #[tokio::test]
    async fn test_rename_policy() {
        let (manager, object_store, _prompt) = create_test_manager(CollisionPolicy::Rename);
        object_store.insert_object("a.txt", b"old".to_vec());

        let receipt = manager.submit_batch(entries(&["a.txt"]), vec![]).await.unwrap();
        manager.wait_idle().await;

        assert_eq!(
            receipt.renamed,
            vec![("a.txt".to_string(), "a (1).txt".to_string())]
        );
        assert_eq!(object_store.object("a.txt").unwrap(), b"old");
        assert_eq!(object_store.object("a (1).txt").unwrap(), b"a.txt");
    }

    #[tokio::test]
    async fn test_all_skipped_aborts_batch() {
        let (manager, object_store, _prompt) = create_test_manager(CollisionPolicy::Skip);
        object_store.insert_object("a.txt", b"old".to_vec());

        let receipt = manager.submit_batch(entries(&["a.txt"]), vec![]).await.unwrap();

        assert!(receipt.is_aborted());
        let snapshot = manager.snapshot();
        assert!(snapshot.tasks.is_empty());
        assert!(!snapshot.panel_open);
        assert_eq!(object_store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_keys_keep_last() {
        let (manager, object_store, _prompt) = create_test_manager(CollisionPolicy::Overwrite);
        let batch = vec![
            UploadEntry::new(UploadContent::from_bytes(b"first".to_vec()), "a.txt"),
            UploadEntry::new(UploadContent::from_bytes(b"second".to_vec()), "/a.txt"),
        ];

        let receipt = manager.submit_batch(batch, vec![]).await.unwrap();
        manager.wait_idle().await;

        assert_eq!(receipt.submitted, 2);
        assert_eq!(receipt.scheduled, vec!["a.txt"]);
        assert_eq!(object_store.object("a.txt").unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_exists_failure_is_fail_open() {
        let (manager, object_store, prompt) = create_test_manager(CollisionPolicy::Skip);
        object_store.insert_object("a.txt", b"old".to_vec());
        object_store.set_fail_exists(true);

        let receipt = manager.submit_batch(entries(&["a.txt"]), vec![]).await.unwrap();
        manager.wait_idle().await;

        assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
        assert_eq!(receipt.scheduled, vec!["a.txt"]);
        assert_eq!(object_store.object("a.txt").unwrap(), b"a.txt");
    }

    #[tokio::test]
    async fn test_directory_markers_for_empty_folders() {
        let (manager, object_store, _prompt) = create_test_manager(CollisionPolicy::Overwrite);
        let dirs = vec!["root".to_string(), "root/empty".to_string()];

        manager
            .submit_batch(entries(&["root/a.txt"]), dirs)
            .await
            .unwrap();
        manager.wait_idle().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            object_store.folder_calls(),
            vec![("root/".to_string(), "empty".to_string())]
        );
        assert!(object_store.contains("root/empty/"));
    }

    #[tokio::test]
    async fn test_directory_marker_failure_is_ignored() {
        let (manager, object_store, _prompt) = create_test_manager(CollisionPolicy::Overwrite);
        object_store.set_fail_folders(true);

        let receipt = manager
            .submit_batch(entries(&["x/a.txt"]), vec!["x/void".to_string()])
            .await
            .unwrap();
        manager.wait_idle().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(receipt.scheduled.len(), 1);
        assert_eq!(object_store.folder_calls().len(), 1);
        assert_eq!(manager.snapshot().counters.done, 1);
    }

    #[tokio::test]
    async fn test_fixed_policy_with_manager() {
        let object_store = Arc::new(MemoryObjectStore::new());
        object_store.insert_object("a.txt", b"old".to_vec());
        let manager = UploadManager::with_options(
            object_store.clone(),
            Arc::new(FixedPolicy(CollisionPolicy::Overwrite)),
            test_options(),
            500,
        );

        let receipt = manager.submit_batch(entries(&["a.txt"]), vec![]).await.unwrap();
        manager.wait_idle().await;

        assert_eq!(receipt.policy, Some(CollisionPolicy::Overwrite));
        assert_eq!(object_store.object("a.txt").unwrap(), b"a.txt");
        assert_eq!(
            manager.store().task("a.txt").unwrap().status,
            UploadTaskStatus::Done
        );
    }
}
