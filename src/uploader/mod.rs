// 上传模块
//
// 上传编排的核心：
// - retry: 进程内重试台账
// - types: 批量请求/响应数据类型
// - client: 两阶段远程协议（POST 取地址 + PUT 推内容）
// - scheduler: 长驻上传循环

pub mod client;
pub mod retry;
pub mod scheduler;
pub mod types;

pub use client::{is_token_invalid, ScanApiClient, TargetsResponse};
pub use retry::AttemptLedger;
pub use scheduler::Uploader;
pub use types::{ApiEnvelope, BatchItem, UploadTarget};
