// 对象存储协作方
//
// 上传核心只依赖这里定义的 ObjectStore trait：
// - exists_batch：批量存在性查询（调用方负责按批次切分）
// - put_object：单个对象上传，带字节级进度回调和取消令牌
// - create_folder_marker：创建空目录占位对象（尽力而为）
// - list_objects：列表刷新
//
// 两个实现：HttpObjectStore（对接存储网关的 HTTP 接口）、
// MemoryObjectStore（内存实现，用于测试和 dry-run）

pub mod client;
pub mod memory;
pub mod types;

pub use client::HttpObjectStore;
pub use memory::MemoryObjectStore;
pub use types::{ListPage, ObjectEntry, StorageError};

use crate::uploader::UploadContent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 字节级进度回调：(已发送字节数, 总字节数)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 对象存储接口
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 批量查询对象是否存在
    ///
    /// 返回值中缺失的 key 视为不存在
    async fn exists_batch(&self, keys: &[String]) -> Result<HashMap<String, bool>, StorageError>;

    /// 上传单个对象
    ///
    /// # 参数
    /// * `key` - 目标对象键
    /// * `content` - 上传内容
    /// * `on_progress` - 字节级进度回调
    /// * `cancel` - 取消令牌，触发后应尽快返回 `StorageError::Aborted`
    async fn put_object(
        &self,
        key: &str,
        content: UploadContent,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<(), StorageError>;

    /// 在 `parent_prefix` 下创建名为 `name` 的目录占位对象
    async fn create_folder_marker(&self, parent_prefix: &str, name: &str)
        -> Result<(), StorageError>;

    /// 列出前缀下的对象（单页）
    async fn list_objects(&self, prefix: &str, token: Option<&str>)
        -> Result<ListPage, StorageError>;
}
