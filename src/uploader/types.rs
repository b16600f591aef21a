// 上传相关数据类型定义

use serde::{Deserialize, Serialize};

/// 批量元数据请求的单项
///
/// 对应取上传地址接口的请求体数组元素
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    /// 文件名（不含路径）
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// 文件大小（服务端要求字符串形式）
    pub size: String,
    /// 扫描类型标签
    #[serde(rename = "scanType")]
    pub scan_type: String,
    /// 运单号
    #[serde(rename = "waybillNo")]
    pub waybill_no: String,
}

impl BatchItem {
    pub fn new(file_name: String, size: u64, scan_type: &str, waybill_no: &str) -> Self {
        Self {
            file_name,
            size: size.to_string(),
            scan_type: scan_type.to_string(),
            waybill_no: waybill_no.to_string(),
        }
    }
}

/// 元数据接口响应外壳
///
/// 字段随服务端版本浮动，msg/message 两种拼法都出现过，全部按 Option 解析
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope {
    /// 业务码
    pub code: Option<i64>,
    pub msg: Option<String>,
    pub message: Option<String>,
    /// 每个单号对应的上传目标
    pub data: Option<Vec<UploadTarget>>,
}

impl ApiEnvelope {
    /// 业务消息字段（msg 优先，其次 message）
    pub fn business_msg(&self) -> Option<&str> {
        self.msg.as_deref().or(self.message.as_deref())
    }
}

/// 单个上传目标（元数据交换成功后每个单号一条）
#[derive(Debug, Clone, Deserialize)]
pub struct UploadTarget {
    /// 运单号
    #[serde(rename = "waybillNo")]
    pub waybill_no: Option<String>,
    /// 请求里携带的文件名（原样回传）
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
    /// 内容 PUT 的目标地址
    #[serde(rename = "uploadUrl")]
    pub upload_url: Option<String>,
    /// PUT 时要携带的 Content-Type
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    /// 短链（与 PUT 阶段无关的旁路字段，拿到即回写）
    #[serde(rename = "shortUrl")]
    pub short_url: Option<String>,
}

impl UploadTarget {
    /// 解析该目标对应的运单号
    ///
    /// 正常情况下服务端回传 waybillNo；个别旧版本只回 fileName，
    /// 此时回退取文件名第一个下划线前的前缀（兼容路径，不是主识别机制）
    pub fn resolve_waybill(&self) -> Option<String> {
        if let Some(no) = &self.waybill_no {
            if !no.is_empty() {
                return Some(no.clone());
            }
        }
        let name = self.file_name.as_deref()?;
        if name.is_empty() {
            return None;
        }
        match name.split_once('_') {
            Some((prefix, _)) => Some(prefix.to_string()),
            None => Some(name.to_string()),
        }
    }
}
