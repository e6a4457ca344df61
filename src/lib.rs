// Bucket Upload Rust Library
// 对象存储批量上传核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 存储网关客户端模块
pub mod storage;

// 批量上传模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use storage::{HttpObjectStore, MemoryObjectStore, ObjectStore, StorageError};
pub use uploader::{
    BatchReceipt, CollisionPolicy, CollisionPrompt, FolderScanner, UploadEntry, UploadManager,
    UploadSnapshot, UploadTask, UploadTaskStatus,
};
