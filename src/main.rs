use anyhow::{bail, Context};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use upload_queue::{
    AppConfig, LocalFileSource, LocalObjectStore, RemoteServices, TaskCallbacks,
    UploadEvent, UploadQueueManager,
};

const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 命令行参数
#[derive(Parser, Debug)]
#[command(author, version, about = "自适应并发上传队列")]
struct CliArgs {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 上传会话ID（默认按启动时间生成）
    #[arg(short, long)]
    session: Option<String>,

    /// 要上传的文件
    #[arg(required = true)]
    files: Vec<String>,
}

impl CliArgs {
    fn session_id(&self) -> String {
        self.session
            .clone()
            .unwrap_or_else(|| format!("cli-{}", chrono::Local::now().format("%Y%m%d%H%M%S")))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let session_id = args.session_id();

    // 🔥 先加载配置再初始化日志（必须保持 _log_guard 存活）
    let config = AppConfig::load_or_default(&args.config).await;
    let _log_guard = upload_queue::logging::init_logging(&config.log);

    info!("Upload Queue v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(LocalObjectStore::new(
        config.storage.root.clone(),
        config.storage.suggested_chunk_size(),
    ));
    let manager = UploadQueueManager::new(RemoteServices::from_store(store), &config)
        .context("创建上传队列失败")?;
    let mut events = manager.subscribe();

    let mut enqueued = 0usize;
    for file in &args.files {
        let source = match LocalFileSource::open(file).await {
            Ok(source) => Arc::new(source),
            Err(e) => {
                error!("跳过文件 {}: {:#}", file, e);
                continue;
            }
        };
        match manager.enqueue(source, &session_id, None, TaskCallbacks::new()) {
            Ok(task_id) => {
                info!("已加入队列: {} -> {}", file, task_id);
                enqueued += 1;
            }
            Err(e) => error!("入队失败 {}: {}", file, e),
        }
    }

    if enqueued == 0 {
        manager.shutdown().await;
        bail!("没有可上传的文件");
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(UploadEvent::Completed { task_id, record, .. }) => {
                    info!("✓ 上传完成: {} -> {}", task_id, record.location);
                }
                Ok(UploadEvent::Error { task_id, message, retry_count }) => {
                    error!("上传失败: {} (重试 {} 次): {}", task_id, retry_count, message);
                }
                Ok(UploadEvent::NetworkChange { metrics }) => {
                    info!("网络分级: {}", metrics.tier);
                }
                Ok(UploadEvent::QueueEmpty { completed_count }) => {
                    info!("全部任务结束，成功 {} 个", completed_count);
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("事件接收滞后，丢弃 {} 条", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("收到 Ctrl+C，开始优雅关闭...");
                break;
            }
        }
    }

    let status = manager.status();
    info!(
        "队列统计: {}",
        serde_json::to_string(&status.performance).unwrap_or_default()
    );

    manager.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}
