use anyhow::{Context, Result};
use bucket_upload_rust::{
    config::LogConfig,
    logging,
    uploader::{format_bytes, FixedPolicy, ScanOptions, StdinPrompt, UploadCounters},
    AppConfig, CollisionPolicy, CollisionPrompt, FolderScanner, HttpObjectStore,
    MemoryObjectStore, ObjectStore, UploadManager,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 令牌环境变量，优先于配置文件
const TOKEN_ENV: &str = "BUCKET_UPLOAD_TOKEN";

/// 进度输出的最小间隔
const REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// 把本地文件和文件夹批量上传到对象存储
#[derive(Parser, Debug)]
#[command(name = "bucket-upload")]
#[command(version)]
#[command(about = "Upload files and folders to an object storage bucket")]
struct Args {
    /// 配置文件路径
    #[arg(long, value_name = "FILE", default_value = "config/app.toml")]
    config: PathBuf,

    /// 目标前缀（如 backups/2024）
    #[arg(long, value_name = "PREFIX", default_value = "")]
    prefix: String,

    /// 冲突策略：overwrite / skip / rename，未指定时交互询问
    #[arg(long, value_name = "POLICY")]
    policy: Option<CollisionPolicy>,

    /// 只在内存中模拟上传
    #[arg(long)]
    dry_run: bool,

    /// 跳过隐藏文件
    #[arg(long)]
    skip_hidden: bool,

    /// 失败任务的自动重试轮数
    #[arg(long, value_name = "N", default_value_t = 0)]
    retry: u32,

    /// 要上传的文件或文件夹
    #[arg(value_name = "PATH", required = true)]
    paths: Vec<PathBuf>,
}

/// 加载日志配置（在日志系统初始化前调用，不输出日志）
async fn load_log_config(path: &Path) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

fn print_counters(counters: &UploadCounters) {
    println!(
        "进度 {:>5.1}% | 完成 {} | 上传中 {} | 排队 {} | 失败 {} | 取消 {} | 共 {}",
        counters.overall_progress * 100.0,
        counters.done,
        counters.uploading,
        counters.queued,
        counters.failed,
        counters.canceled,
        counters.total
    );
}

/// 等待当前运行结束，期间按间隔输出进度；Ctrl+C 取消全部任务
///
/// 返回期间是否收到过 Ctrl+C
async fn run_until_idle(manager: &UploadManager) -> bool {
    let mut interrupted = false;
    let mut rx = manager.subscribe();
    let mut last_report = tokio::time::Instant::now();
    let idle = manager.wait_idle();
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut idle => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if last_report.elapsed() >= REPORT_INTERVAL {
                    last_report = tokio::time::Instant::now();
                    let snapshot = rx.borrow_and_update().clone();
                    print_counters(&snapshot.counters);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                let canceled = manager.cancel_all();
                warn!("🛑 收到 Ctrl+C，已取消 {} 个任务", canceled);
            }
        }
    }
    interrupted
}

/// 是否继续下一轮重试：用户中断过或没有失败任务时停止
fn should_retry(attempt: u32, max_retries: u32, interrupted: bool, failed: usize) -> bool {
    !interrupted && attempt < max_retries && failed > 0
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let log_config = load_log_config(&args.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("Bucket Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load_or_default(&args.config).await;
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.trim().is_empty() {
            config.storage.api_token = Some(token);
        }
    }
    if args.skip_hidden {
        config.upload.skip_hidden_files = true;
    }
    config.validate().context("配置验证失败")?;

    let object_store: Arc<dyn ObjectStore> = if args.dry_run {
        info!("模拟模式：内容只写入内存");
        Arc::new(MemoryObjectStore::new())
    } else {
        Arc::new(HttpObjectStore::new(&config.storage).context("创建存储客户端失败")?)
    };

    let prompt: Arc<dyn CollisionPrompt> = match args.policy.or(config.upload.collision_policy) {
        Some(policy) => Arc::new(FixedPolicy(policy)),
        None => Arc::new(StdinPrompt),
    };

    // 扫描本地路径
    let scanner = FolderScanner::with_options(ScanOptions {
        skip_hidden: config.upload.skip_hidden_files,
        ..Default::default()
    });
    let scan = scanner.scan_paths(&args.paths)?;
    info!(
        "扫描完成: {} 个文件, 总大小 {}",
        scan.files.len(),
        format_bytes(scan.total_size())
    );
    let (entries, directories) = scan.into_entries();

    let manager = UploadManager::new(object_store, prompt, &config.upload);
    manager.set_current_prefix(&args.prefix);

    let receipt = manager.submit_batch(entries, directories).await?;
    if receipt.is_aborted() {
        info!("没有需要上传的文件（跳过 {} 个）", receipt.skipped.len());
        manager.shutdown();
        return Ok(());
    }
    info!(
        "🚀 开始上传: {} 个文件, 跳过 {}, 重命名 {}",
        receipt.scheduled.len(),
        receipt.skipped.len(),
        receipt.renamed.len()
    );

    let mut interrupted = run_until_idle(&manager).await;

    // 重试会同时重新排队已取消的任务，用户中断后不再重试
    let mut attempt = 0;
    while should_retry(attempt, args.retry, interrupted, manager.snapshot().counters.failed) {
        attempt += 1;
        let retried = manager.retry_failed();
        info!("第 {} 轮重试: {} 个任务", attempt, retried);
        interrupted = run_until_idle(&manager).await;
    }
    if interrupted && args.retry > 0 {
        info!("已被用户中断，跳过重试");
    }

    let counters = manager.snapshot().counters.clone();
    print_counters(&counters);
    manager.shutdown();

    if counters.failed > 0 || counters.canceled > 0 {
        anyhow::bail!(
            "{} 个任务失败, {} 个任务已取消",
            counters.failed,
            counters.canceled
        );
    }

    info!("🎉 全部上传完成");
    Ok(())
}
