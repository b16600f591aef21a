// 文件名解析
//
// 扫描设备落图的文件名约定：
//   {供包台号}_{运单号}_{日期}{小时}....jpg
// 例如 "3_JT5100062860618_20251001_08.jpg"
// 现场设备固件不一，日期分隔符和字段顺序并不严格，解析按宽松规则走

use chrono::{DateTime, Datelike, Local, Timelike};
use regex::Regex;
use std::sync::OnceLock;

/// 从文件名解析出的路由信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// 供包台号（文件名开头的数字段，缺失为 None）
    pub platform_id: Option<String>,
    pub year: String,
    pub month: String,
    pub day: String,
    pub hour: String,
}

fn leading_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)").unwrap())
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"((?:19|20)\d{2})[-_]?(0[1-9]|1[0-2])[-_]?([0-3][0-9])").unwrap()
    })
}

fn hour_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]{2,})").unwrap())
}

/// 解析供包台号和日期/小时
///
/// 日期匹配 (19|20)YY[-_]?MM[-_]?DD；小时取日期之后的第一段数字的前两位；
/// 解析不出的字段用 now 补齐
pub fn parse_id_date_hour(filename: &str, now: DateTime<Local>) -> ParsedName {
    let platform_id = leading_id_re()
        .captures(filename)
        .map(|c| c[1].to_string());

    let (year, month, day, hour) = match date_re().captures(filename) {
        Some(caps) => {
            let whole = caps.get(0).unwrap();
            let rest = &filename[whole.end()..];
            let hour = hour_re()
                .captures(rest)
                .map(|c| c[1][..2].to_string())
                .unwrap_or_else(|| format!("{:02}", now.hour()));
            (
                caps[1].to_string(),
                caps[2].to_string(),
                caps[3].to_string(),
                hour,
            )
        }
        None => (
            format!("{:04}", now.year()),
            format!("{:02}", now.month()),
            format!("{:02}", now.day()),
            format!("{:02}", now.hour()),
        ),
    };

    ParsedName {
        platform_id,
        year,
        month,
        day,
        hour,
    }
}

/// 从文件名导出运单号和保存名
///
/// 文件名含 >=3 个下划线段时，第二段是运单号，保存名去掉供包台前缀；
/// 否则整个文件名既是运单号也是保存名
pub fn derive_scan_code(filename: &str) -> (String, String) {
    let parts: Vec<&str> = filename.split('_').collect();
    if parts.len() >= 3 {
        let scan_code = parts[1].to_string();
        let save_name = parts[1..].join("_");
        (scan_code, save_name)
    } else {
        (filename.to_string(), filename.to_string())
    }
}
