// 对象存储数据类型定义

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 存储层错误
///
/// 上传核心只关心两件事：是否被取消（`Aborted`），以及给用户看的错误信息
#[derive(Debug, Error)]
pub enum StorageError {
    /// 网络请求失败（连接、超时、TLS 等）
    #[error("网络请求失败: {0}")]
    Http(#[from] reqwest::Error),
    /// 服务端返回非 2xx 状态码
    #[error("{}", describe_status(.status, .body))]
    Status { status: u16, body: String },
    /// 读取本地上传内容失败
    #[error("读取上传内容失败: {0}")]
    Io(#[from] std::io::Error),
    /// 响应解析失败
    #[error("响应解析失败: {0}")]
    Decode(String),
    /// 传输被中止
    #[error("aborted")]
    Aborted,
    /// 其他错误
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// 是否为中止类错误
    pub fn is_aborted(&self) -> bool {
        matches!(self, StorageError::Aborted)
    }
}

/// 服务端错误信息：优先使用响应体，响应体为空时退回到状态码
fn describe_status(status: &u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        body.to_string()
    }
}

/// 列表中的单个对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectEntry {
    /// 对象键
    pub key: String,
    /// 对象大小（字节）
    #[serde(default)]
    pub size: u64,
    /// 最后修改时间（服务端原样返回）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

/// 列表分页结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    /// 当前前缀下的对象
    pub objects: Vec<ObjectEntry>,
    /// 当前前缀下的"文件夹"（CommonPrefixes）
    pub prefixes: Vec<String>,
    /// 下一页令牌，没有更多数据时为 None
    pub next_token: Option<String>,
}

impl ListPage {
    /// 是否还有下一页
    pub fn has_more(&self) -> bool {
        self.next_token.is_some()
    }
}
