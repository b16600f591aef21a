// Token 管理器
//
// 进程内唯一的登录凭证缓存：
// 1. 单把锁覆盖读缓存、写缓存和整个登录流程，并发调用方不会发起重叠登录
// 2. 登录失败按 backoff_base^attempt 秒指数退避，最多 max_retries 次
// 3. 重试耗尽后保留旧 token（可能为空），由调用方决定如何处理
//
// 服务端不下发过期时间，token 是否失效只能由业务请求的
// 401/403/业务码/关键词判断，这里不做本地过期推断

use crate::auth::types::{LoginRequest, LoginResponse};
use crate::config::LoginConfig;
use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 凭证缓存状态
#[derive(Debug, Default)]
struct TokenState {
    /// 当前 token
    token: Option<String>,
    /// 上次成功刷新的时间戳（秒）
    last_refresh_at: Option<i64>,
}

/// Token 管理器
pub struct TokenManager {
    /// HTTP 客户端（带登录超时）
    http: Client,
    /// 登录配置
    config: LoginConfig,
    /// 凭证缓存，单把锁串行化所有访问
    state: Mutex<TokenState>,
}

impl TokenManager {
    /// 创建新的 Token 管理器（启动时无缓存凭证）
    pub fn new(config: LoginConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("创建登录 HTTP 客户端失败")?;
        Ok(Self {
            http,
            config,
            state: Mutex::new(TokenState::default()),
        })
    }

    /// 创建带预置 token 的管理器
    #[cfg(test)]
    pub fn with_cached(config: LoginConfig, token: &str) -> Result<Self> {
        let manager = Self::new(config)?;
        {
            let mut state = manager.state.try_lock().unwrap();
            state.token = Some(token.to_string());
            state.last_refresh_at = Some(chrono::Utc::now().timestamp());
        }
        Ok(manager)
    }

    /// 获取 token
    ///
    /// - `force = false`: 有缓存直接返回，无缓存则登录
    /// - `force = true`: 无条件重新登录
    ///
    /// 登录期间锁不释放，并发调用方阻塞到刷新结束后观察刷新结果；
    /// 刷新失败时返回刷新前的旧 token（可能为 None）
    pub async fn acquire(&self, force: bool) -> Option<String> {
        let mut state = self.state.lock().await;

        if !force {
            if let Some(token) = &state.token {
                return Some(token.clone());
            }
        }

        match self.do_login().await {
            Some(new_token) => {
                state.token = Some(new_token.clone());
                state.last_refresh_at = Some(chrono::Utc::now().timestamp());
                Some(new_token)
            }
            // 登录失败，保持旧 token 不变
            None => state.token.clone(),
        }
    }

    /// 上次成功刷新的时间戳（秒）
    pub async fn last_refresh_at(&self) -> Option<i64> {
        self.state.lock().await.last_refresh_at
    }

    /// 执行登录流程，失败返回 None
    async fn do_login(&self) -> Option<String> {
        let payload = LoginRequest {
            account: self.config.account.clone(),
            password: self.config.password.clone(),
            app_key: self.config.app_key.clone(),
            app_secret: self.config.app_secret.clone(),
        };

        for attempt in 1..=self.config.max_retries {
            info!("[登录] 第 {} 次请求登录接口: {}", attempt, self.config.url);

            match self.try_login_once(&payload).await {
                Ok(token) => {
                    info!("[登录成功] 获得 token（长度={}）", token.len());
                    return Some(token);
                }
                Err(e) => {
                    warn!("[登录失败] 尝试={} err={:#}", attempt, e);
                }
            }

            if attempt < self.config.max_retries {
                let wait = self.config.backoff_base.powi(attempt as i32);
                info!("[登录] 等待 {:.1}s 后重试", wait);
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
        }

        error!("[登录失败] 超过重试次数({})", self.config.max_retries);
        None
    }

    /// 单次登录请求
    async fn try_login_once(&self, payload: &LoginRequest) -> Result<String> {
        let resp = self
            .http
            .post(self.config.url.as_str())
            .json(payload)
            .send()
            .await
            .context("登录网络异常")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        debug!("[登录返回] status={} body={}", status, truncate(&body, 1000));

        if status.as_u16() != 200 {
            anyhow::bail!("登录返回非 200: status={} body={}", status, truncate(&body, 200));
        }

        let parsed: LoginResponse =
            serde_json::from_str(&body).context("登录响应 JSON 解析失败")?;

        parsed
            .data
            .and_then(|d| d.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("登录返回缺少 token: {}", truncate(&body, 200)))
    }
}

/// 截断日志用的响应体预览
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoginConfig;

    fn unreachable_config() -> LoginConfig {
        LoginConfig {
            // 不可路由地址，测试不应触网
            url: "http://127.0.0.1:1/login".to_string(),
            account: "acct".to_string(),
            password: "pw".to_string(),
            app_key: "key".to_string(),
            app_secret: "secret".to_string(),
            timeout_secs: 1,
            max_retries: 1,
            backoff_base: 2.0,
        }
    }

    #[tokio::test]
    async fn test_acquire_returns_cached_without_login() {
        let manager = TokenManager::with_cached(unreachable_config(), "cached-token").unwrap();
        // 有缓存且未强制刷新：直接返回，不访问登录接口
        assert_eq!(manager.acquire(false).await.as_deref(), Some("cached-token"));
    }

    #[tokio::test]
    async fn test_force_refresh_failure_keeps_previous_token() {
        let manager = TokenManager::with_cached(unreachable_config(), "cached-token").unwrap();
        // 强制刷新失败（登录接口不可达），旧 token 原样保留
        assert_eq!(manager.acquire(true).await.as_deref(), Some("cached-token"));
        assert_eq!(manager.acquire(false).await.as_deref(), Some("cached-token"));
    }

    #[tokio::test]
    async fn test_acquire_without_cache_and_unreachable_login_is_none() {
        let manager = TokenManager::new(unreachable_config()).unwrap();
        assert_eq!(manager.acquire(false).await, None);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("登录失效了", 2), "登录");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
