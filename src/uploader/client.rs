// 远程上传客户端
//
// 两阶段协议的执行者：
// 1. request_targets: 批量 POST 元数据，换取每个单号的上传地址
// 2. push_content: 按目标地址 PUT 图片内容（整体替换语义）
//
// 两个操作都不直接改动数据库，结果交由上传循环统一落账

use crate::config::UploadConfig;
use crate::uploader::types::{ApiEnvelope, BatchItem, UploadTarget};
use anyhow::{Context, Result};
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// token 失效的业务码（服务端约定，保持兼容）
const TOKEN_INVALID_BUSINESS_CODE: i64 = 127000033;

/// PUT 成功的状态码
const PUT_SUCCESS_STATUS: [u16; 3] = [200, 201, 204];

/// 元数据交换的结果
///
/// 网络层成功即产生此结果，业务成败由调用方根据 status/envelope 判断
#[derive(Debug)]
pub struct TargetsResponse {
    /// HTTP 状态码
    pub status: u16,
    /// 解析成功的响应外壳（解析失败为 None）
    pub envelope: Option<ApiEnvelope>,
    /// 原始响应体（排查用）
    pub body: String,
}

impl TargetsResponse {
    /// HTTP 层是否成功
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 是否命中 token 失效判定
    pub fn token_invalid(&self) -> bool {
        is_token_invalid(self.status, self.envelope.as_ref(), &self.body)
    }

    /// 可用的上传目标（HTTP 成功且 data 非空）
    pub fn targets(&self) -> Option<&[UploadTarget]> {
        if !self.is_ok() {
            return None;
        }
        match self.envelope.as_ref().and_then(|e| e.data.as_deref()) {
            Some(data) if !data.is_empty() => Some(data),
            _ => None,
        }
    }

    /// 取走上传目标
    pub fn into_targets(self) -> Option<Vec<UploadTarget>> {
        if !self.is_ok() {
            return None;
        }
        match self.envelope.and_then(|e| e.data) {
            Some(data) if !data.is_empty() => Some(data),
            _ => None,
        }
    }
}

/// 判定响应是否表示 token 已失效
///
/// 任一命中即视为失效：
/// 1. HTTP 401/403
/// 2. 业务码 127000033
/// 3. msg/message/响应体包含 "失效" 或 "重新登录"
pub fn is_token_invalid(status: u16, envelope: Option<&ApiEnvelope>, body: &str) -> bool {
    if status == 401 || status == 403 {
        return true;
    }

    if let Some(envelope) = envelope {
        if envelope.code == Some(TOKEN_INVALID_BUSINESS_CODE) {
            return true;
        }
    }

    let msg = envelope
        .and_then(|e| e.business_msg())
        .unwrap_or(body);
    msg.contains("失效") || msg.contains("重新登录")
}

/// 远程上传客户端
#[derive(Clone)]
pub struct ScanApiClient {
    /// HTTP 客户端（统一超时）
    http: Client,
    /// 上传配置
    config: UploadConfig,
}

impl ScanApiClient {
    pub fn new(config: UploadConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("创建上传 HTTP 客户端失败")?;
        Ok(Self { http, config })
    }

    /// 批量请求上传目标
    ///
    /// Err 仅表示网络/传输层失败；HTTP 非 2xx 会正常返回 TargetsResponse，
    /// 由调用方走 token 失效判定或整批记失败
    pub async fn request_targets(
        &self,
        token: &str,
        items: &[BatchItem],
    ) -> Result<TargetsResponse> {
        let resp = self
            .http
            .post(self.config.endpoint.as_str())
            .header(self.config.auth_header_name.as_str(), token)
            .json(items)
            .send()
            .await
            .context("元数据请求网络异常")?;

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let envelope = serde_json::from_str::<ApiEnvelope>(&body).ok();

        Ok(TargetsResponse {
            status,
            envelope,
            body,
        })
    }

    /// 向目标地址 PUT 图片内容
    ///
    /// 成功: HTTP 200/201/204；其余状态码和任何传输失败都视为可重试失败
    pub async fn push_content(&self, target: &UploadTarget, path: &Path) -> Result<()> {
        let upload_url = target
            .upload_url
            .as_deref()
            .context("目标缺少 uploadUrl")?;
        let content_type = target
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("读取图片失败: {:?}", path))?;
        debug!("PUT {} ({} bytes, {})", upload_url, bytes.len(), content_type);

        let resp = self
            .http
            .put(upload_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .context("PUT 网络异常")?;

        let status = resp.status().as_u16();
        if PUT_SUCCESS_STATUS.contains(&status) {
            Ok(())
        } else {
            let preview: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
            anyhow::bail!("put_status={} text={}", status, preview)
        }
    }
}
