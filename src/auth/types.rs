// 认证模块数据类型定义

use serde::{Deserialize, Serialize};

/// 登录请求体
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    /// 账户（网点编号）
    pub account: String,
    /// 密码
    pub password: String,
    /// 应用 Key
    #[serde(rename = "appKey")]
    pub app_key: String,
    /// 应用密钥
    #[serde(rename = "appSecret")]
    pub app_secret: String,
}

/// 登录响应体
///
/// 服务端返回 {"data": {"token": "..."}}，字段可能缺失，全部按 Option 解析
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub code: Option<i64>,
    pub msg: Option<String>,
    pub data: Option<LoginData>,
}

/// 登录响应 data 字段
#[derive(Debug, Clone, Deserialize)]
pub struct LoginData {
    pub token: Option<String>,
}
