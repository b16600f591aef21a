//! 日志系统配置
//!
//! 支持控制台输出和文件持久化，按小时滚动（目录结构 logs/YYYY/MM/DD/），
//! 自动清理过期日志

use crate::config::LogConfig;
use chrono::{DateTime, Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 按小时切换的日志文件管理器（内部状态）
struct HourlyFileInner {
    /// 日志根目录
    log_dir: PathBuf,
    /// 当前文件句柄
    current_file: Option<File>,
    /// 当前小时标识（格式: YYYY-MM-DD_HH）
    current_hour_id: Option<String>,
}

impl HourlyFileInner {
    fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            current_file: None,
            current_hour_id: None,
        }
    }

    fn hour_id(now: &DateTime<Local>) -> String {
        now.format("%Y-%m-%d_%H").to_string()
    }

    /// 生成当前小时的日志文件路径并确保目录存在
    fn make_log_path(&self, now: &DateTime<Local>) -> io::Result<PathBuf> {
        let dir = self
            .log_dir
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string());
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("log_{}.txt", Self::hour_id(now))))
    }

    /// 关闭旧文件，打开当前小时的文件
    fn roll_to(&mut self, now: &DateTime<Local>) -> io::Result<()> {
        if let Some(mut file) = self.current_file.take() {
            let _ = file.flush();
        }
        let path = self.make_log_path(now)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.current_file = Some(file);
        self.current_hour_id = Some(Self::hour_id(now));
        Ok(())
    }

    /// 写入前检查小时是否切换
    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        let now = Local::now();
        let hour_id = Self::hour_id(&now);
        if self.current_file.is_none() || self.current_hour_id.as_deref() != Some(&hour_id) {
            self.roll_to(&now)?;
        }
        match &mut self.current_file {
            Some(file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "日志文件未打开")),
        }
    }

    fn flush_file(&mut self) -> io::Result<()> {
        if let Some(file) = &mut self.current_file {
            file.flush()?;
        }
        Ok(())
    }
}

/// 按小时切换的日志文件管理器（线程安全包装）
///
/// 实现了 Write trait，可以作为日志输出目标
pub struct HourlyFileWriter {
    inner: Arc<Mutex<HourlyFileInner>>,
}

impl HourlyFileWriter {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HourlyFileInner::new(log_dir))),
        }
    }
}

impl Write for HourlyFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.flush_file()
    }
}

impl Clone for HourlyFileWriter {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
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
/// # Arguments
/// * `config` - 日志配置
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    // 控制台输出层
    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(true);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    }

    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}, 回退到仅控制台输出", config.log_dir, e);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return LogGuard { _file_guard: None };
    }

    // 非阻塞写入器，按小时切换文件
    let writer = HourlyFileWriter::new(config.log_dir.clone());
    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
        config.log_dir, config.retention_days, config.level
    );

    cleanup_old_logs(&config.log_dir, config.retention_days);

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理过期日志文件
///
/// 文件格式: logs/YYYY/MM/DD/log_YYYY-MM-DD_HH.txt
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);
    let mut deleted_count = 0;

    for entry in walkdir::WalkDir::new(log_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let filename = match entry.file_name().to_str() {
            Some(name) => name,
            None => continue,
        };
        if !filename.starts_with("log_") || !filename.ends_with(".txt") {
            continue;
        }

        let expired = match extract_date_from_filename(filename) {
            Some(file_date) => today.signed_duration_since(file_date) > retention,
            None => false,
        };

        if expired {
            if let Err(e) = fs::remove_file(entry.path()) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", entry.path(), e);
            } else {
                deleted_count += 1;
            }
        }
    }

    if deleted_count > 0 {
        info!("已清理 {} 个过期日志文件", deleted_count);
    }
}

/// 从文件名中提取日期: log_YYYY-MM-DD_HH.txt -> YYYY-MM-DD
fn extract_date_from_filename(filename: &str) -> Option<NaiveDate> {
    let name = filename.strip_prefix("log_")?.strip_suffix(".txt")?;
    let date_part = name.split('_').next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_extract_date_from_filename() {
        assert_eq!(
            extract_date_from_filename("log_2025-11-03_14.txt"),
            NaiveDate::from_ymd_opt(2025, 11, 3)
        );
        assert_eq!(extract_date_from_filename("log_garbage.txt"), None);
        assert_eq!(extract_date_from_filename("other.txt"), None);
    }

    #[test]
    fn test_hourly_writer_creates_dated_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = HourlyFileWriter::new(dir.path().to_path_buf());
        writer.write_all("测试日志行\n".as_bytes()).unwrap();
        writer.flush().unwrap();

        let now = Local::now();
        let expected = dir
            .path()
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string())
            .join(format!("log_{}.txt", now.format("%Y-%m-%d_%H")));
        assert!(expected.exists());
    }
}
