//! 本地文件夹扫描
//!
//! 负责:
//! - 把命令行给出的文件和文件夹展开为上传项
//! - 相对路径保留文件夹自身的名字（`photos/2024/a.jpg`），统一使用 `/`
//! - 记录所有目录，供管理器为空目录创建占位对象

use crate::uploader::content::UploadContent;
use crate::uploader::manager::UploadEntry;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// 扫描到的文件
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 上传用的相对路径（`/` 分隔）
    pub relative_path: String,
    /// 文件大小（字节）
    pub size: u64,
}

/// 扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 最大文件大小（字节），超过此大小的文件将被跳过
    pub max_file_size: Option<u64>,
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
}

/// 扫描结果
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// 文件，按相对路径排序
    pub files: Vec<ScannedFile>,
    /// 目录的相对路径（含扫描根目录本身）
    pub directories: Vec<String>,
}

impl ScanResult {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn merge(&mut self, other: ScanResult) {
        self.files.extend(other.files);
        self.directories.extend(other.directories);
    }

    /// 转换为上传项和目录列表
    pub fn into_entries(self) -> (Vec<UploadEntry>, Vec<String>) {
        let entries = self
            .files
            .into_iter()
            .map(|f| UploadEntry::new(UploadContent::from_file(f.local_path, f.size), f.relative_path))
            .collect();
        (entries, self.directories)
    }
}

/// 文件夹扫描器
pub struct FolderScanner {
    options: ScanOptions,
}

impl Default for FolderScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// 路径各段用 `/` 连接
fn to_slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect::<Vec<_>>()
        .join("/")
}

impl FolderScanner {
    pub fn new() -> Self {
        Self {
            options: ScanOptions::default(),
        }
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self { options }
    }

    /// 扫描多个路径（文件或文件夹），合并为一个结果
    pub fn scan_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Result<ScanResult> {
        let mut result = ScanResult::default();
        for path in paths {
            let path = path.as_ref();
            let metadata = std::fs::metadata(path)
                .with_context(|| format!("扫描路径不存在: {}", path.display()))?;

            if metadata.is_dir() {
                result.merge(self.scan(path)?);
            } else if metadata.is_file() {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("无法获取文件名: {}", path.display()))?;
                if self.accept_size(path, metadata.len()) {
                    result.files.push(ScannedFile {
                        local_path: path.to_path_buf(),
                        relative_path: name.to_string(),
                        size: metadata.len(),
                    });
                }
            } else {
                warn!("跳过非常规文件: {}", path.display());
            }
        }
        Ok(result)
    }

    /// 递归扫描一个文件夹
    ///
    /// 相对路径以文件夹自身的名字开头
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<ScanResult> {
        let root_path = root_path.as_ref();

        if !root_path.exists() {
            anyhow::bail!("扫描路径不存在: {}", root_path.display());
        }
        if !root_path.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root_path.display());
        }

        // 根目录名（如 `.` 或 `/` 这类没有名字的路径先规范化）
        let canonical = root_path
            .canonicalize()
            .with_context(|| format!("解析路径失败: {}", root_path.display()))?;
        let root_name = canonical
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();

        info!("开始扫描文件夹: {}", root_path.display());

        let relative = |path: &Path| -> Result<String> {
            let rel = path.strip_prefix(root_path).with_context(|| {
                format!(
                    "计算相对路径失败: {} (root: {})",
                    path.display(),
                    root_path.display()
                )
            })?;
            let rel = to_slash_path(rel);
            Ok(match (root_name.is_empty(), rel.is_empty()) {
                (true, _) => rel,
                (false, true) => root_name.clone(),
                (false, false) => format!("{}/{}", root_name, rel),
            })
        };

        let skip_hidden = self.options.skip_hidden;
        let walker = WalkDir::new(root_path)
            .follow_links(self.options.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !(skip_hidden && e.depth() > 0 && is_hidden(e)));

        let mut result = ScanResult::default();
        for entry in walker {
            let entry = entry.with_context(|| format!("读取目录失败: {}", root_path.display()))?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                let rel = relative(entry.path())?;
                if !rel.is_empty() {
                    result.directories.push(rel);
                }
            } else if file_type.is_file() {
                let size = entry
                    .metadata()
                    .with_context(|| format!("读取文件元数据失败: {}", entry.path().display()))?
                    .len();
                if !self.accept_size(entry.path(), size) {
                    continue;
                }
                let relative_path = relative(entry.path())?;
                debug!("扫描到文件: {} ({})", relative_path, format_bytes(size));
                result.files.push(ScannedFile {
                    local_path: entry.into_path(),
                    relative_path,
                    size,
                });
            } else {
                debug!("跳过非常规文件: {}", entry.path().display());
            }
        }

        info!(
            "文件夹扫描完成: {} 个文件, {} 个目录, 总大小 {}",
            result.files.len(),
            result.directories.len(),
            format_bytes(result.total_size())
        );

        Ok(result)
    }

    fn accept_size(&self, path: &Path, size: u64) -> bool {
        match self.options.max_file_size {
            Some(max_size) if size > max_size => {
                warn!("跳过超大文件: {} ({})", path.display(), format_bytes(size));
                false
            }
            _ => true,
        }
    }
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
