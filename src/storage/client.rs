// 存储网关 HTTP 客户端
//
// 对接存储网关暴露的四个接口：
// - POST /api/objects/exists   批量存在性查询
// - POST /api/uploads/direct   multipart 直传（file + key）
// - POST /api/folders          创建目录占位对象
// - GET  /api/objects          列表（分页）
//
// 所有请求携带 Bearer 令牌

use crate::config::StorageConfig;
use crate::storage::{ListPage, ObjectEntry, ObjectStore, ProgressFn, StorageError};
use crate::uploader::UploadContent;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 上传流的分块大小（64KB），也是进度回调的粒度
const UPLOAD_STREAM_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Serialize)]
struct ExistsRequest<'a> {
    keys: &'a [String],
}

#[derive(Deserialize)]
struct ExistsResponse {
    #[serde(default)]
    exists: HashMap<String, bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateFolderRequest<'a> {
    parent_prefix: &'a str,
    name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommonPrefix {
    #[serde(default)]
    prefix: Option<String>,
}

/// 列表接口响应（S3 ListObjectsV2 风格字段）
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsResponse {
    #[serde(default)]
    contents: Vec<ObjectEntry>,
    #[serde(default)]
    common_prefixes: Vec<CommonPrefix>,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

impl From<ListObjectsResponse> for ListPage {
    fn from(resp: ListObjectsResponse) -> Self {
        let next_token = if resp.is_truncated {
            resp.next_continuation_token
        } else {
            None
        };
        ListPage {
            objects: resp.contents,
            prefixes: resp
                .common_prefixes
                .into_iter()
                .filter_map(|p| p.prefix)
                .filter(|p| !p.is_empty())
                .collect(),
            next_token,
        }
    }
}

/// 存储网关 HTTP 客户端
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    /// HTTP 客户端
    client: Client,
    /// 网关地址（不含末尾斜杠）
    endpoint: String,
    /// Bearer 令牌
    api_token: Option<String>,
    /// 列表接口单页数量
    list_limit: usize,
    /// 非上传请求的超时时间
    request_timeout: Duration,
}

impl HttpObjectStore {
    /// 根据存储配置创建客户端
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        // 上传请求不设置整体超时（大文件可能持续很久），只限制连接建立时间
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(concat!("bucket-upload/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        info!("初始化存储网关客户端: endpoint={}", endpoint);

        Ok(Self {
            client,
            endpoint,
            api_token: config.api_token.clone().filter(|t| !t.is_empty()),
            list_limit: config.list_limit,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// 非 2xx 响应转换为 `StorageError::Status`
    async fn ensure_success(response: Response) -> Result<Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// 取对象键的最后一段作为 multipart 文件名
fn file_name_of(key: &str) -> String {
    key.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("file")
        .to_string()
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn exists_batch(&self, keys: &[String]) -> Result<HashMap<String, bool>, StorageError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let response = self
            .authorized(self.client.post(self.url("/api/objects/exists")))
            .timeout(self.request_timeout)
            .json(&ExistsRequest { keys })
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        let body: ExistsResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Decode(e.to_string()))?;

        debug!(
            "存在性查询完成: 查询 {} 个, 已存在 {} 个",
            keys.len(),
            body.exists.values().filter(|v| **v).count()
        );
        Ok(body.exists)
    }

    async fn put_object(
        &self,
        key: &str,
        content: UploadContent,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<(), StorageError> {
        let total = content.len();
        let stream = content.into_stream(UPLOAD_STREAM_CHUNK_SIZE).await?;

        // 按 hyper 拉取数据块的节奏统计已发送字节数
        let mut sent = 0u64;
        let counted = stream.map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                on_progress(sent, total);
            }
            chunk
        });

        let part = Part::stream_with_length(Body::wrap_stream(counted), total)
            .file_name(file_name_of(key));
        let form = Form::new().part("file", part).text("key", key.to_string());

        let request = self
            .authorized(self.client.post(self.url("/api/uploads/direct")))
            .multipart(form)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Aborted),
            response = request => response?,
        };
        Self::ensure_success(response).await?;

        debug!("对象上传完成: key={}, size={}", key, total);
        Ok(())
    }

    async fn create_folder_marker(
        &self,
        parent_prefix: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .authorized(self.client.post(self.url("/api/folders")))
            .timeout(self.request_timeout)
            .json(&CreateFolderRequest {
                parent_prefix,
                name,
            })
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        token: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        let mut query: Vec<(&str, String)> = vec![("limit", self.list_limit.to_string())];
        if !prefix.is_empty() {
            query.push(("prefix", prefix.to_string()));
        }
        if let Some(token) = token {
            query.push(("continuationToken", token.to_string()));
        }

        let response = self
            .authorized(self.client.get(self.url("/api/objects")))
            .timeout(self.request_timeout)
            .query(&query)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        let body: ListObjectsResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Decode(e.to_string()))?;
        Ok(body.into())
    }
}
