//! 日志系统配置
//!
//! 控制台输出写到 stderr（stdout 留给进度报告），可选写入文件：
//! 按单文件大小滚动，文件名带启动时间戳，启动时清理过期日志

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "bucket-upload.";

/// 时间戳格式
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 滚动日志文件（内部状态）
struct RollingFileInner {
    /// 启动时间戳（格式：YYYY-MM-DD-HHMMSS）
    start_timestamp: String,
    log_dir: PathBuf,
    current_file: Option<File>,
    /// 当前文件序号（0 表示基础文件）
    current_index: u32,
    max_file_size: u64,
    current_size: u64,
}

impl RollingFileInner {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut inner = Self {
            start_timestamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir,
            current_file: None,
            current_index: 0,
            max_file_size,
            current_size: 0,
        };
        inner.open_current()?;
        Ok(inner)
    }

    fn file_path(&self, index: u32) -> PathBuf {
        let filename = if index == 0 {
            format!("{}{}.log", LOG_FILE_PREFIX, self.start_timestamp)
        } else {
            format!("{}{}_{}.log", LOG_FILE_PREFIX, self.start_timestamp, index)
        };
        self.log_dir.join(filename)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path(self.current_index))?;
        self.current_file = Some(file);
        self.current_size = 0;
        Ok(())
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，避免单条超大日志产生一串空文件
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.current_file.take() {
                file.flush()?;
            }
            self.current_index += 1;
            self.open_current()?;
        }

        match &mut self.current_file {
            Some(file) => {
                let written = file.write(buf)?;
                self.current_size += written as u64;
                Ok(written)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "日志文件未打开")),
        }
    }

    fn flush_file(&mut self) -> io::Result<()> {
        match &mut self.current_file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 按大小滚动的日志文件（线程安全包装）
#[derive(Clone)]
pub struct RollingLogFile {
    inner: Arc<Mutex<RollingFileInner>>,
}

impl RollingLogFile {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFileInner::open(log_dir, max_file_size)?)),
        })
    }
}

impl Write for RollingLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush_file()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 环境变量 RUST_LOG 优先于配置中的级别
///
/// # 参数
/// * `config` - 日志配置
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_writer(io::stderr);

    let file_writer = if config.enabled {
        open_log_file(config)
    } else {
        None
    };

    let Some(file_writer) = file_writer else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志文件已启用: 目录={:?}, 保留天数={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let deleted = cleanup_old_logs(&config.log_dir, config.retention_days);
    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 创建日志目录和文件，失败时回退到仅控制台输出
fn open_log_file(config: &LogConfig) -> Option<RollingLogFile> {
    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
        return None;
    }
    match RollingLogFile::new(config.log_dir.clone(), config.max_file_size) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("创建日志文件失败: {}, 回退到仅控制台输出", e);
            None
        }
    }
}

/// 清理过期日志文件，返回删除数量
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !filename.starts_with(LOG_FILE_PREFIX) || !filename.ends_with(".log") {
            continue;
        }

        // 文件名中的日期优先，取不到时按修改时间判断
        let expired = match extract_date_from_filename(filename) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => expired_by_modified_time(&entry, retention),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }
    deleted
}

/// 从文件名中提取日期
///
/// - bucket-upload.YYYY-MM-DD-HHMMSS.log
/// - bucket-upload.YYYY-MM-DD-HHMMSS_N.log
fn extract_date_from_filename(filename: &str) -> Option<chrono::NaiveDate> {
    let name = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(".log")?;
    let date = name.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn expired_by_modified_time(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .map(|modified| {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_extract_date_from_filename() {
        let expected = chrono::NaiveDate::from_ymd_opt(2024, 3, 9);
        assert_eq!(
            extract_date_from_filename("bucket-upload.2024-03-09-101500.log"),
            expected
        );
        assert_eq!(
            extract_date_from_filename("bucket-upload.2024-03-09-101500_2.log"),
            expected
        );
        assert_eq!(extract_date_from_filename("other.2024-03-09.log"), None);
        assert_eq!(extract_date_from_filename("bucket-upload.garbage.log"), None);
    }

    #[test]
    fn test_rolling_file_rotates_by_size() {
        let temp_dir = TempDir::new().unwrap();
        let mut file = RollingLogFile::new(temp_dir.path().to_path_buf(), 10).unwrap();

        file.write_all(b"12345678").unwrap();
        file.write_all(b"abcdefgh").unwrap();
        file.write_all(b"zz").unwrap();
        file.flush().unwrap();

        let mut names: Vec<String> = fs::read_dir(temp_dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.starts_with(LOG_FILE_PREFIX)));
        assert!(names.iter().any(|n| n.ends_with("_1.log")));
    }

    #[test]
    fn test_cleanup_old_logs() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("bucket-upload.2000-01-01-000000.log"), "old").unwrap();
        let today = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        fs::write(dir.join(format!("bucket-upload.{}.log", today)), "new").unwrap();
        fs::write(dir.join("unrelated.2000-01-01.log"), "keep").unwrap();

        assert_eq!(cleanup_old_logs(dir, 7), 1);
        assert!(!dir.join("bucket-upload.2000-01-01-000000.log").exists());
        assert!(dir.join("unrelated.2000-01-01.log").exists());
    }
}
