// 配置管理模块

use crate::uploader::CollisionPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 存储网关配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

// =====================================================
// 日志配置
// =====================================================

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

// =====================================================
// 存储网关配置
// =====================================================

/// 存储网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 网关地址
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Bearer 令牌（也可以通过环境变量 BUCKET_UPLOAD_TOKEN 提供）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// 列表接口单页数量
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
    /// 非上传请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_list_limit() -> usize {
    1000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_token: None,
            list_limit: default_list_limit(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

// =====================================================
// 上传配置
// =====================================================

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大并发上传数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 单次存在性查询的最大 key 数
    #[serde(default = "default_exists_batch_size")]
    pub exists_batch_size: usize,
    /// 进度合并间隔（毫秒）
    #[serde(default = "default_progress_flush_ms")]
    pub progress_flush_ms: u64,
    /// 状态合并间隔（毫秒）
    #[serde(default = "default_status_flush_ms")]
    pub status_flush_ms: u64,
    /// 每成功多少个任务刷新一次列表
    #[serde(default = "default_refresh_every")]
    pub refresh_every: usize,
    /// 上传期间定时刷新列表的间隔（秒，0 表示关闭）
    #[serde(default = "default_live_refresh_secs")]
    pub live_refresh_secs: u64,
    /// 全部成功后自动收起的延迟（毫秒，0 表示关闭）
    #[serde(default = "default_auto_dismiss_ms")]
    pub auto_dismiss_ms: u64,
    /// 全部取消时是否清空内容缓存
    #[serde(default)]
    pub clear_cache_on_cancel: bool,
    /// 扫描文件夹时跳过隐藏文件
    #[serde(default)]
    pub skip_hidden_files: bool,
    /// 冲突策略，未设置时每个批次询问
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_policy: Option<CollisionPolicy>,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_exists_batch_size() -> usize {
    500
}

fn default_progress_flush_ms() -> u64 {
    100
}

fn default_status_flush_ms() -> u64 {
    50
}

fn default_refresh_every() -> usize {
    50
}

fn default_live_refresh_secs() -> u64 {
    3
}

fn default_auto_dismiss_ms() -> u64 {
    2000
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            exists_batch_size: default_exists_batch_size(),
            progress_flush_ms: default_progress_flush_ms(),
            status_flush_ms: default_status_flush_ms(),
            refresh_every: default_refresh_every(),
            live_refresh_secs: default_live_refresh_secs(),
            auto_dismiss_ms: default_auto_dismiss_ms(),
            clear_cache_on_cancel: false,
            skip_hidden_files: false,
            collision_policy: None,
        }
    }
}

impl UploadConfig {
    /// 验证上传配置
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            anyhow::bail!("max_concurrent 必须大于 0");
        }
        if self.exists_batch_size == 0 {
            anyhow::bail!("exists_batch_size 必须大于 0");
        }
        Ok(())
    }
}

impl StorageConfig {
    /// 验证网关地址格式
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            anyhow::bail!("存储网关地址必须以 http:// 或 https:// 开头: {}", self.endpoint);
        }
        Ok(())
    }
}

impl AppConfig {
    /// 验证全部配置
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.upload.validate()?;
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.validate().context("配置文件验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("创建配置目录失败")?;
            }
        }

        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {}", path.display()))?;

        tracing::info!("✓ 配置已保存: {}", path.display());
        Ok(())
    }

    /// 加载或创建默认配置
    ///
    /// 文件不存在时写出默认配置；文件存在但无效时使用默认配置且不覆盖原文件
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
