// 图片上传循环
//
// 长驻控制循环，每个周期：
// 1. 拉取待传记录（最多 50 条）
// 2. 过滤：文件缺失 -> 标记缺失（终态）；达重试上限 -> 本次运行内跳过
// 3. 取 token，取不到整轮跳过（系统性原因，不记单件失败）
// 4. 批量 POST 换上传地址；token 失效则强制刷新并重试一次（仅一次）
// 5. 旁路回写 shortUrl（与 PUT 阶段无关，幂等）
// 6. 并发 PUT（信号量限并发，JoinSet 收结果），逐单落账
// 7. 小睡后进入下一周期
//
// 任何阶段的失败都在循环内消化，循环只因取消信号退出；
// 周期之间有屏障：所有 PUT 结束后才开始下一周期

use crate::auth::TokenManager;
use crate::config::UploadConfig;
use crate::store::{ImageStore, PendingImage};
use crate::uploader::client::{ScanApiClient, TargetsResponse};
use crate::uploader::retry::AttemptLedger;
use crate::uploader::types::{BatchItem, UploadTarget};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 每周期拉取的记录数上限
const FETCH_BATCH_SIZE: usize = 50;

/// 周期之间的固定小睡（毫秒），防止热循环
const CYCLE_GAP_MS: u64 = 200;

/// 过滤后无有效条目时的等待（毫秒）
const NO_ITEMS_DELAY_MS: u64 = 500;

/// 系统性失败（token 取不到、POST 失败）后的等待（毫秒）
const SYSTEMIC_DELAY_MS: u64 = 1000;

/// 单次 PUT 的结果，由工作任务返回、控制循环统一落账
#[derive(Debug)]
enum PushOutcome {
    /// 上传成功
    Uploaded { code: String },
    /// 可重试失败（记一次重试）
    Failed { code: String, reason: String },
    /// 派发时文件已不在（终态，不计重试）
    FileMissing { code: String, id: i64 },
    /// 目标无法对应到任何待传记录（缺失类，无记录可标）
    Unmatched { reason: String },
}

/// 过滤结果
struct Partitioned {
    /// 可进入本周期的记录
    ready: Vec<PendingImage>,
    /// 文件已不存在的记录
    missing: Vec<PendingImage>,
    /// 达到重试上限、本次运行内跳过的单号
    capped: Vec<String>,
}

/// 过滤一批待传记录
///
/// 文件存在性在此一次性检查；达上限的判断只读台账，重复执行不改状态
fn partition_rows(rows: Vec<PendingImage>, attempts: &AttemptLedger) -> Partitioned {
    let mut ready = Vec::new();
    let mut missing = Vec::new();
    let mut capped = Vec::new();

    for row in rows {
        if row.path.is_empty() || !Path::new(&row.path).exists() {
            missing.push(row);
        } else if attempts.reached_ceiling(&row.code) {
            capped.push(row.code);
        } else {
            ready.push(row);
        }
    }

    Partitioned {
        ready,
        missing,
        capped,
    }
}

/// 本周期的批次：请求条目 + 单号到记录的映射
struct CycleBatch {
    items: Vec<BatchItem>,
    rows_by_code: HashMap<String, PendingImage>,
}

impl CycleBatch {
    fn from_ready(ready: Vec<PendingImage>, scan_type: &str) -> Self {
        let mut items = Vec::with_capacity(ready.len());
        let mut rows_by_code = HashMap::with_capacity(ready.len());

        for row in ready {
            let path = Path::new(&row.path);
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&row.path)
                .to_string();
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            items.push(BatchItem::new(file_name, size, scan_type, &row.code));
            rows_by_code.insert(row.code.clone(), row);
        }

        Self {
            items,
            rows_by_code,
        }
    }

    /// 整批记一次失败（POST 阶段失败时对全部条目生效）
    fn penalize_all(&self, attempts: &mut AttemptLedger) {
        for item in &self.items {
            attempts.increment(&item.waybill_no);
        }
    }
}

/// 图片上传循环
pub struct Uploader {
    /// 记录存储
    store: ImageStore,
    /// token 管理器（进程内共享）
    token_manager: Arc<TokenManager>,
    /// 远程上传客户端
    client: ScanApiClient,
    /// 上传配置
    config: UploadConfig,
    /// 取消令牌
    cancel_token: CancellationToken,
}

impl Uploader {
    pub fn new(
        store: ImageStore,
        token_manager: Arc<TokenManager>,
        client: ScanApiClient,
        config: UploadConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            token_manager,
            client,
            config,
            cancel_token,
        }
    }

    /// 运行上传循环，直到取消信号到来
    pub async fn run(&self) {
        info!(
            "启动图片上传循环: 批量={}, 并发={}, 单件重试上限={}",
            FETCH_BATCH_SIZE, self.config.max_concurrent, self.config.max_retries_per_file
        );

        // 重试台账只归本循环所有，进程重启即清零
        let mut attempts = AttemptLedger::new(self.config.max_retries_per_file);

        while !self.cancel_token.is_cancelled() {
            if let Err(e) = self.run_cycle(&mut attempts).await {
                error!("上传周期异常, 稍后重试: {:#}", e);
                self.sleep(Duration::from_secs(self.config.poll_interval_secs))
                    .await;
            }
            // 小睡，防止热循环
            self.sleep(Duration::from_millis(CYCLE_GAP_MS)).await;
        }

        info!("图片上传循环已退出");
    }

    /// 执行一个完整周期
    async fn run_cycle(&self, attempts: &mut AttemptLedger) -> anyhow::Result<()> {
        // 1. 拉取
        let rows = self.store.fetch_pending(FETCH_BATCH_SIZE)?;
        if rows.is_empty() {
            self.sleep(Duration::from_secs(self.config.poll_interval_secs))
                .await;
            return Ok(());
        }

        // 2. 过滤
        let partitioned = partition_rows(rows, attempts);
        for row in &partitioned.missing {
            error!("单号: {} 图片不存在, 标记为缺失: {}", row.code, row.path);
            if let Err(e) = self.store.mark_missing(row.id) {
                error!("标记缺失失败: id={} err={:#}", row.id, e);
            }
        }
        for code in &partitioned.capped {
            warn!("请求达到重试上限, 跳过: {}", code);
        }

        let batch = CycleBatch::from_ready(partitioned.ready, &self.config.scan_type);
        if batch.items.is_empty() {
            self.sleep(Duration::from_millis(NO_ITEMS_DELAY_MS)).await;
            return Ok(());
        }

        // 3. 取 token（系统性失败，不记单件重试）
        let Some(token) = self.token_manager.acquire(false).await else {
            warn!("[Token 未获取到] 本轮跳过，稍后重试");
            self.sleep(Duration::from_millis(SYSTEMIC_DELAY_MS)).await;
            return Ok(());
        };

        // 4. 元数据交换
        let mut resp = match self.client.request_targets(&token, &batch.items).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("[POST 网络异常] err={:#}", e);
                batch.penalize_all(attempts);
                self.sleep(Duration::from_millis(SYSTEMIC_DELAY_MS)).await;
                return Ok(());
            }
        };
        info!(
            "[POST 返回] status={} body={}",
            resp.status,
            preview(&resp.body)
        );

        // 5. 旁路回写 shortUrl，后续 PUT 失败也不回滚
        self.reconcile_short_urls(&resp);

        // token 失效 -> 强制刷新并重试一次 POST（仅一次，绝不循环）
        if resp.token_invalid() {
            info!("[POST] 检测到 token 失效，尝试刷新并重试一次 POST");
            let Some(new_token) = self.token_manager.acquire(true).await else {
                error!("[POST 重试] 刷新 token 失败，本批次全部记一次重试并跳过");
                batch.penalize_all(attempts);
                self.sleep(Duration::from_millis(SYSTEMIC_DELAY_MS)).await;
                return Ok(());
            };
            resp = match self.client.request_targets(&new_token, &batch.items).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("[POST 重试 网络异常] err={:#}", e);
                    batch.penalize_all(attempts);
                    self.sleep(Duration::from_millis(SYSTEMIC_DELAY_MS)).await;
                    return Ok(());
                }
            };
            info!(
                "[POST 重试返回] status={} body={}",
                resp.status,
                preview(&resp.body)
            );
            self.reconcile_short_urls(&resp);
        }

        // 6. 并发 PUT
        match resp.into_targets() {
            Some(targets) => self.dispatch_pushes(targets, &batch, attempts).await,
            None => {
                warn!("[POST 失败或未返回 data] 本批次全部记一次重试");
                batch.penalize_all(attempts);
            }
        }

        Ok(())
    }

    /// 回写元数据响应携带的 shortUrl（独立于 PUT 阶段的幂等事实）
    fn reconcile_short_urls(&self, resp: &TargetsResponse) {
        let Some(targets) = resp.targets() else {
            return;
        };
        for target in targets {
            let (Some(code), Some(short_url)) = (target.resolve_waybill(), &target.short_url)
            else {
                continue;
            };
            if let Err(e) = self.store.update_short_url(&code, short_url) {
                error!("[DB] 更新 shortUrl 失败: {} -> {} err={:#}", code, short_url, e);
            }
        }
    }

    /// 并发执行 PUT 并逐单落账
    ///
    /// 并发数 = min(配置上限, 目标数)，至少 1；
    /// 所有任务结束后才返回（周期屏障）
    async fn dispatch_pushes(
        &self,
        targets: Vec<UploadTarget>,
        batch: &CycleBatch,
        attempts: &mut AttemptLedger,
    ) {
        let worker_count = self.config.max_concurrent.min(targets.len()).max(1);
        info!("[并发上传] {} 个目标，并发数: {}", targets.len(), worker_count);

        let semaphore = Arc::new(Semaphore::new(worker_count));
        let mut join_set: JoinSet<PushOutcome> = JoinSet::new();

        for target in targets {
            // 先解析身份并找到对应记录，解析不了的目标不派发网络请求
            let Some(code) = target.resolve_waybill() else {
                self.apply_outcome(
                    PushOutcome::Unmatched {
                        reason: "响应条目缺少 waybillNo/fileName".to_string(),
                    },
                    attempts,
                );
                continue;
            };
            let Some(row) = batch.rows_by_code.get(&code) else {
                self.apply_outcome(
                    PushOutcome::Unmatched {
                        reason: format!("单号 {} 不在本批次中", code),
                    },
                    attempts,
                );
                continue;
            };
            if target.upload_url.is_none() {
                self.apply_outcome(
                    PushOutcome::Failed {
                        code,
                        reason: "missing uploadUrl".to_string(),
                    },
                    attempts,
                );
                continue;
            }

            let client = self.client.clone();
            let semaphore = semaphore.clone();
            let row = row.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return PushOutcome::Failed {
                            code: row.code,
                            reason: "并发信号量已关闭".to_string(),
                        }
                    }
                };
                push_one(client, target, row).await
            });
        }

        // 结果到一个处理一个，全部结束后本周期才算完
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => self.apply_outcome(outcome, attempts),
                Err(e) => error!("PUT 任务未预期异常: {}", e),
            }
        }
    }

    /// 单个 PUT 结果落账
    fn apply_outcome(&self, outcome: PushOutcome, attempts: &mut AttemptLedger) {
        match outcome {
            PushOutcome::Uploaded { code } => {
                attempts.clear(&code);
                if let Err(e) = self.store.mark_uploaded(&code) {
                    error!("DB 标记失败: code={} err={:#}", code, e);
                }
                info!("[PUT 上传成功] waybillNo={}", code);
            }
            PushOutcome::Failed { code, reason } => {
                let count = attempts.increment(&code);
                info!(
                    "[PUT 失败] waybillNo={} err={} attempts={}",
                    code, reason, count
                );
            }
            PushOutcome::FileMissing { code, id } => {
                // 终态：不计重试
                if let Err(e) = self.store.mark_missing(id) {
                    error!("标记缺失失败: id={} err={:#}", id, e);
                }
                warn!("[PUT] 派发时图片已不存在, 标记为缺失: waybillNo={}", code);
            }
            PushOutcome::Unmatched { reason } => {
                warn!("[PUT 失败 无法确定 waybillNo] {}", reason);
            }
        }
    }

    /// 可被取消信号打断的 sleep
    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel_token.cancelled() => {}
        }
    }
}

/// 单个 PUT 工作函数
///
/// 不触碰调度器状态，所有事实通过返回值带回
async fn push_one(client: ScanApiClient, target: UploadTarget, row: PendingImage) -> PushOutcome {
    // 过滤之后文件仍可能被外部挪走，派发前再确认一次
    if !Path::new(&row.path).exists() {
        return PushOutcome::FileMissing {
            code: row.code,
            id: row.id,
        };
    }

    match client.push_content(&target, Path::new(&row.path)).await {
        Ok(()) => PushOutcome::Uploaded { code: row.code },
        Err(e) => PushOutcome::Failed {
            code: row.code,
            reason: format!("{:#}", e),
        },
    }
}

/// 日志用响应体预览（最多 1000 字符）
fn preview(body: &str) -> String {
    body.chars().take(1000).collect()
}
