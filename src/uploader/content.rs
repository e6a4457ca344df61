// 上传内容与内容缓存
//
// 上传内容只在两处存在：调用方提交批次时、调度器的内容缓存里。
// 任务本身只记录 key/name/size，重试时从缓存取回内容。

use dashmap::DashMap;
use futures::future::Either;
use futures::{stream, Stream, TryStreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

/// 单个上传项的内容
///
/// 克隆开销很小（内存数据共享同一份 `Arc`，文件只记录路径）
#[derive(Debug, Clone)]
pub enum UploadContent {
    /// 内存中的数据
    Bytes(Arc<[u8]>),
    /// 本地文件
    File { path: PathBuf, size: u64 },
}

impl UploadContent {
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        UploadContent::Bytes(Arc::from(data.into()))
    }

    /// 已知大小的本地文件
    pub fn from_file(path: impl Into<PathBuf>, size: u64) -> Self {
        UploadContent::File {
            path: path.into(),
            size,
        }
    }

    /// 读取文件元数据后创建
    pub async fn open_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("不是文件: {:?}", path),
            ));
        }
        Ok(Self::from_file(path, metadata.len()))
    }

    /// 内容字节数
    pub fn len(&self) -> u64 {
        match self {
            UploadContent::Bytes(data) => data.len() as u64,
            UploadContent::File { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 一次性读取全部内容
    pub async fn read_all(&self) -> io::Result<Vec<u8>> {
        match self {
            UploadContent::Bytes(data) => Ok(data.to_vec()),
            UploadContent::File { path, .. } => tokio::fs::read(path).await,
        }
    }

    /// 转换为按 `chunk_size` 分块的字节流
    ///
    /// 文件内容边读边发，不会整体载入内存
    pub async fn into_stream(
        self,
        chunk_size: usize,
    ) -> io::Result<impl Stream<Item = io::Result<Vec<u8>>> + Send + Sync + 'static> {
        let chunk_size = chunk_size.max(1);
        match self {
            UploadContent::Bytes(data) => {
                let chunks: Vec<io::Result<Vec<u8>>> =
                    data.chunks(chunk_size).map(|c| Ok(c.to_vec())).collect();
                Ok(Either::Left(stream::iter(chunks)))
            }
            UploadContent::File { path, .. } => {
                let file = tokio::fs::File::open(&path).await?;
                Ok(Either::Right(
                    ReaderStream::with_capacity(file, chunk_size).map_ok(|b| b.to_vec()),
                ))
            }
        }
    }
}

/// 内容缓存：key -> 上传内容
///
/// 提交批次时写入，上传成功后移除；失败和取消的任务保留内容以便重试
#[derive(Debug, Default)]
pub struct ContentCache {
    entries: DashMap<String, UploadContent>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入（同 key 覆盖）
    pub fn stash(&self, key: impl Into<String>, content: UploadContent) {
        self.entries.insert(key.into(), content);
    }

    pub fn get(&self, key: &str) -> Option<UploadContent> {
        self.entries.get(key).map(|c| c.clone())
    }

    pub fn evict(&self, key: &str) -> Option<UploadContent> {
        self.entries.remove(key).map(|(_, c)| c)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
