use anyhow::Result;
use scan_image_uploader::{
    auth::TokenManager,
    config::AppConfig,
    ingest::IngestService,
    logging,
    slotplan::SlotPlanWatcher,
    store::ImageStore,
    uploader::{ScanApiClient, Uploader},
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 默认配置文件路径（可用第一个命令行参数覆盖）
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load_or_default(Path::new(&config_path));

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("---- [初始化] 启动服务, 配置文件: {}", config_path);

    // 数据库
    let store = ImageStore::open(&config.db.path, config.db.pool_size)?;

    // token 管理器（进程内唯一，所有请求共享）
    let token_manager = Arc::new(TokenManager::new(config.login.clone())?);

    // 各后台任务共享一个取消令牌
    let cancel_token = CancellationToken::new();

    // 上传循环
    let client = ScanApiClient::new(config.upload.clone())?;
    let uploader = Uploader::new(
        store.clone(),
        token_manager,
        client,
        config.upload.clone(),
        cancel_token.clone(),
    );
    let uploader_handle = tokio::spawn(async move { uploader.run().await });

    // 收件扫描
    let ingest = IngestService::new(store.clone(), config.ingest.clone(), cancel_token.clone());
    let ingest_handle = tokio::spawn(async move { ingest.run().await });

    // 格口方案监视
    let slotplan = SlotPlanWatcher::new(store, config.slotplan.clone(), cancel_token.clone());
    let slotplan_handle = tokio::spawn(async move { slotplan.run().await });

    // 等待停止信号
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("收到停止信号, 准备退出"),
        Err(e) => warn!("监听停止信号失败: {}, 准备退出", e),
    }

    // 协作式关停：各循环完成/放弃当前周期后退出，在途 PUT 受请求超时约束
    cancel_token.cancel();
    let shutdown = async {
        let _ = uploader_handle.await;
        let _ = ingest_handle.await;
        let _ = slotplan_handle.await;
    };
    if tokio::time::timeout(Duration::from_secs(config.upload.timeout_secs + 5), shutdown)
        .await
        .is_err()
    {
        warn!("后台任务未在宽限期内退出, 直接终止");
    }

    info!("应用已安全退出");
    Ok(())
}
