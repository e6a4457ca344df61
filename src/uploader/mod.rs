// 批量上传模块
//
// 自底向上：
// - content：上传内容与内容缓存
// - task：任务与状态迁移
// - coalescer：进度 / 状态更新合并
// - engine：单次传输与取消句柄
// - oracle：存在性查询
// - collision：命名冲突处理
// - store：任务列表与快照
// - scheduler：队列与并发控制
// - manager：批次提交入口
// - folder：本地文件夹扫描

pub mod coalescer;
pub mod collision;
pub mod content;
pub mod engine;
pub mod folder;
pub mod manager;
pub mod oracle;
pub mod scheduler;
pub mod store;
pub mod task;

pub use coalescer::{DebouncedBatch, PROGRESS_FLUSH_INTERVAL_MS, STATUS_FLUSH_INTERVAL_MS};
pub use collision::{
    count_collisions, renamed_key, resolve_keys, CollisionPolicy, CollisionPrompt, FixedPolicy,
    StdinPrompt,
};
pub use content::{ContentCache, UploadContent};
pub use engine::{TransferHandles, TransferOutcome, UploadEngine};
pub use folder::{format_bytes, FolderScanner, ScanOptions, ScanResult, ScannedFile};
pub use manager::{BatchReceipt, UploadEntry, UploadManager};
pub use oracle::{ExistenceOracle, DEFAULT_EXISTS_BATCH_SIZE};
pub use scheduler::{SchedulerOptions, UploadScheduler, DEFAULT_MAX_CONCURRENT};
pub use store::{normalize_prefix, UploadCounters, UploadSnapshot, UploadStore};
pub use task::{StatusUpdate, UploadTask, UploadTaskStatus};
