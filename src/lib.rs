// Scan Image Uploader
// 分拣线扫描图片上传网关核心库

// 认证模块
pub mod auth;

// 配置管理模块
pub mod config;

// 收件模块
pub mod ingest;

// 日志模块
pub mod logging;

// 格口方案模块
pub mod slotplan;

// 图片记录存储模块
pub mod store;

// 上传模块
pub mod uploader;

// 导出常用类型
pub use auth::TokenManager;
pub use config::AppConfig;
pub use ingest::IngestService;
pub use slotplan::SlotPlanWatcher;
pub use store::{ImageStore, PendingImage};
pub use uploader::{AttemptLedger, ScanApiClient, Uploader, UploadTarget};
