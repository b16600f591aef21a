// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 登录配置
    #[serde(default)]
    pub login: LoginConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 收件配置
    #[serde(default)]
    pub ingest: IngestConfig,
    /// 格口方案配置
    #[serde(default)]
    pub slotplan: SlotPlanConfig,
    /// 数据库配置
    #[serde(default)]
    pub db: DbConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从 TOML 文件加载配置
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))
    }

    /// 加载配置，失败时回退到默认值
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("加载配置失败, 使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

/// 登录配置
///
/// 登录接口返回 {"data": {"token": "..."}}，token 的有效性只能
/// 通过后续请求的 401/403/业务码判断，服务端不下发过期时间
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    /// 登录接口地址
    #[serde(default = "default_login_url")]
    pub url: String,
    /// 账户（网点编号）
    #[serde(default)]
    pub account: String,
    /// 密码（MD5 形式，由网点后台提供）
    #[serde(default)]
    pub password: String,
    /// 应用 Key
    #[serde(default)]
    pub app_key: String,
    /// 应用密钥
    #[serde(default)]
    pub app_secret: String,
    /// 单次登录请求超时（秒）
    #[serde(default = "default_login_timeout_secs")]
    pub timeout_secs: u64,
    /// 登录最大重试次数
    #[serde(default = "default_login_max_retries")]
    pub max_retries: u32,
    /// 指数退避基数（秒）
    #[serde(default = "default_login_backoff_base")]
    pub backoff_base: f64,
}

fn default_login_url() -> String {
    "https://opa.example.com.cn/opa/smartLogin".to_string()
}

fn default_login_timeout_secs() -> u64 {
    10
}

fn default_login_max_retries() -> u32 {
    3
}

fn default_login_backoff_base() -> f64 {
    2.0
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            url: default_login_url(),
            account: String::new(),
            password: String::new(),
            app_key: String::new(),
            app_secret: String::new(),
            timeout_secs: default_login_timeout_secs(),
            max_retries: default_login_max_retries(),
            backoff_base: default_login_backoff_base(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 批量取上传地址的接口
    #[serde(default = "default_upload_endpoint")]
    pub endpoint: String,
    /// 认证头名称
    #[serde(default = "default_auth_header_name")]
    pub auth_header_name: String,
    /// 扫描类型标签（卸车到件 = 107）
    #[serde(default = "default_scan_type")]
    pub scan_type: String,
    /// 单次请求超时（秒），POST 和 PUT 共用
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
    /// 无待传数据时的轮询间隔（秒）
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// 单张图片最大重试次数（本次运行内）
    #[serde(default = "default_max_retries_per_file")]
    pub max_retries_per_file: u32,
    /// PUT 最大并发数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_upload_endpoint() -> String {
    "https://opa.example.com.cn/opa/smart/scan/getUploadUrl".to_string()
}

fn default_auth_header_name() -> String {
    "authToken".to_string()
}

fn default_scan_type() -> String {
    // 扫描类型: 入仓 106, 集货到件 101, 集货到件带收入发 103,
    // 卸车到件 107, 卸车到件带收入发 102, 出仓 104, 装车发件 105
    "107".to_string()
}

fn default_upload_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_max_retries_per_file() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    5
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_upload_endpoint(),
            auth_header_name: default_auth_header_name(),
            scan_type: default_scan_type(),
            timeout_secs: default_upload_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_retries_per_file: default_max_retries_per_file(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// 收件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// 收件根目录（扫描设备往 inbox 子目录落图）
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
    /// 扫描间隔（秒）
    #[serde(default = "default_ingest_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// 单文件大小上限（字节）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_home_dir() -> PathBuf {
    PathBuf::from("arrival")
}

fn default_ingest_scan_interval_secs() -> u64 {
    2
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            scan_interval_secs: default_ingest_scan_interval_secs(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl IngestConfig {
    /// 待处理图片落盘目录
    pub fn inbox_dir(&self) -> PathBuf {
        self.home_dir.join("inbox")
    }

    /// DB 写入失败时的兜底目录
    pub fn db_error_dir(&self) -> PathBuf {
        self.home_dir.join("db_error")
    }
}

/// 格口方案配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotPlanConfig {
    /// 方案文件名（放在工作目录下，处理完移入 processed/）
    #[serde(default = "default_slotplan_file")]
    pub file_name: String,
    /// 检查间隔（秒）
    #[serde(default = "default_slotplan_check_interval_secs")]
    pub check_interval_secs: u64,
    /// 已处理文件的归档目录
    #[serde(default = "default_slotplan_processed_dir")]
    pub processed_dir: PathBuf,
}

fn default_slotplan_file() -> String {
    "格口方案.csv".to_string()
}

fn default_slotplan_check_interval_secs() -> u64 {
    5
}

fn default_slotplan_processed_dir() -> PathBuf {
    PathBuf::from("processed")
}

impl Default for SlotPlanConfig {
    fn default() -> Self {
        Self {
            file_name: default_slotplan_file(),
            check_interval_secs: default_slotplan_check_interval_secs(),
            processed_dir: default_slotplan_processed_dir(),
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// SQLite 数据库文件路径
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// 连接池大小
    #[serde(default = "default_db_pool_size")]
    pub pool_size: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/scan_images.db")
}

fn default_db_pool_size() -> u32 {
    8
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_db_pool_size(),
        }
    }
}

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
}

fn default_log_enabled() -> bool {
    true
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

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.scan_type, "107");
        assert_eq!(config.upload.auth_header_name, "authToken");
        assert_eq!(config.upload.max_retries_per_file, 3);
        assert_eq!(config.upload.max_concurrent, 5);
        assert_eq!(config.login.max_retries, 3);
        assert_eq!(config.db.pool_size, 8);
        assert_eq!(config.log.retention_days, 7);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [login]
            account = "WD01197700"
            password = "0f3b4ec9a496cc5be92eccea05899993"

            [upload]
            max_concurrent = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.login.account, "WD01197700");
        assert_eq!(config.login.timeout_secs, 10);
        assert_eq!(config.upload.max_concurrent, 3);
        assert_eq!(config.upload.poll_interval_secs, 2);
    }

    #[test]
    fn test_ingest_derived_dirs() {
        let config = IngestConfig {
            home_dir: PathBuf::from("arrival"),
            ..Default::default()
        };
        assert_eq!(config.inbox_dir(), PathBuf::from("arrival/inbox"));
        assert_eq!(config.db_error_dir(), PathBuf::from("arrival/db_error"));
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = AppConfig::load_or_default(Path::new("does/not/exist.toml"));
        assert_eq!(config.upload.scan_type, "107");
    }
}
