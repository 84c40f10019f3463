//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化。日志文件按启动时间命名、按大小滚动，
//! 启动时清理超过保留天数的旧文件

use crate::config::LogConfig;
use chrono::Local;
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
const LOG_FILE_PREFIX: &str = "upload-queue.";

/// 日志时间格式
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 滚动日志文件状态
struct RollingFileState {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    started: String,
    log_dir: PathBuf,
    file: Option<File>,
    /// 滚动序号，0 为首个文件
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RollingFileState {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut state = Self {
            started: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir,
            file: None,
            index: 0,
            max_file_size,
            written: 0,
        };
        state.open_current()?;
        Ok(state)
    }

    fn file_path(&self) -> PathBuf {
        let name = if self.index == 0 {
            format!("{}{}.log", LOG_FILE_PREFIX, self.started)
        } else {
            format!("{}{}_{}.log", LOG_FILE_PREFIX, self.started, self.index)
        };
        self.log_dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write_all_rolling(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.file.take() {
                file.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }

        match self.file.as_mut() {
            Some(file) => {
                let n = file.write(buf)?;
                self.written += n as u64;
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "日志文件未打开")),
        }
    }
}

/// 按大小滚动的日志写入器
///
/// 克隆后共享同一个文件状态，可直接交给 `tracing_appender::non_blocking`
#[derive(Clone)]
pub struct RollingLogWriter {
    state: Arc<parking_lot::Mutex<RollingFileState>>,
}

impl RollingLogWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            state: Arc::new(parking_lot::Mutex::new(RollingFileState::open(
                log_dir,
                max_file_size,
            )?)),
        })
    }

    /// 当前写入的日志文件路径
    pub fn current_path(&self) -> PathBuf {
        self.state.lock().file_path()
    }
}

impl Write for RollingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write_all_rolling(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的日志级别
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_ansi(true);

    let file_writer = if config.enabled {
        fs::create_dir_all(&config.log_dir)
            .and_then(|_| RollingLogWriter::new(config.log_dir.clone(), config.max_file_size))
            .map_err(|e| {
                eprintln!(
                    "创建日志文件失败: {:?}, 错误: {}, 回退到仅控制台输出",
                    config.log_dir, e
                );
            })
            .ok()
    } else {
        None
    };

    let Some(writer) = file_writer else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理过期日志文件，返回删除的文件数
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

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(date) = log_file_date(name) else {
            continue;
        };

        if today.signed_duration_since(date) > retention {
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }
    removed
}

/// 从日志文件名中提取日期
///
/// upload-queue.YYYY-MM-DD-HHMMSS[_N].log -> YYYY-MM-DD
fn log_file_date(filename: &str) -> Option<chrono::NaiveDate> {
    let stem = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(".log")?;
    let date = stem.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
