// 格口方案模块
//
// 现场人员把格口方案（一段码 -> 格口号）导出成分隔文本放到工作目录，
// 这里定时检查：解析 -> 整表替换 -> 移入 processed 目录归档。
// 解析或写库失败时文件原地保留，下个周期重试

use crate::config::SlotPlanConfig;
use crate::store::ImageStore;
use anyhow::{Context, Result};
use chrono::Local;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 表头识别关键词（中英混用，现场导出工具不统一）
const TERMINAL_KEYWORDS: [&str; 3] = ["一段", "waybill", "terminal"];
const SLOT_KEYWORDS: [&str; 2] = ["格口", "slot"];

/// 格口方案监视器
pub struct SlotPlanWatcher {
    store: ImageStore,
    config: SlotPlanConfig,
    cancel_token: CancellationToken,
}

impl SlotPlanWatcher {
    pub fn new(store: ImageStore, config: SlotPlanConfig, cancel_token: CancellationToken) -> Self {
        Self {
            store,
            config,
            cancel_token,
        }
    }

    /// 运行监视循环，直到取消信号到来
    pub async fn run(&self) {
        info!(
            "启动格口方案监视: 文件={}, 间隔={}s",
            self.config.file_name, self.config.check_interval_secs
        );

        while !self.cancel_token.is_cancelled() {
            let target = Path::new(&self.config.file_name);
            if target.exists() {
                info!("发现格口方案文件: {:?}", target);
                if let Err(e) = self.process_plan_file(target) {
                    // 保留源文件以便下次重试
                    error!("处理格口方案失败, 保留源文件: {:#}", e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.check_interval_secs)) => {}
                _ = self.cancel_token.cancelled() => {}
            }
        }

        info!("格口方案监视已退出");
    }

    /// 解析并应用一份方案文件，成功后归档
    fn process_plan_file(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取方案文件失败: {:?}", path))?;

        let pairs = parse_slot_plan(&content);
        info!("方案文件解析出 {} 条映射", pairs.len());
        if !pairs.is_empty() {
            self.store.replace_slot_table(&pairs)?;
        }

        let processed_dir = &self.config.processed_dir;
        std::fs::create_dir_all(processed_dir)
            .with_context(|| format!("创建归档目录失败: {:?}", processed_dir))?;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("slotplan");
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");
        let dest = processed_dir.join(format!(
            "{}_{}.{}",
            stem,
            Local::now().format("%Y%m%d_%H%M%S"),
            ext
        ));
        std::fs::rename(path, &dest)
            .with_context(|| format!("归档方案文件失败: {:?} -> {:?}", path, dest))?;
        info!("方案文件已归档: {:?}", dest);

        Ok(())
    }
}

/// 解析方案文本为 (一段码, 格口号) 列表
///
/// 首个非空行若含表头关键词则按表头定位列，否则按前两列取值；
/// 分隔符支持逗号和制表符；全空行跳过
pub fn parse_slot_plan(content: &str) -> Vec<(String, Option<i64>)> {
    let mut lines = content
        .lines()
        .map(split_fields)
        .filter(|fields| fields.iter().any(|f| !f.is_empty()));

    let Some(first) = lines.next() else {
        return Vec::new();
    };

    let mut pairs = Vec::new();
    let (terminal_idx, slot_idx) = match detect_header(&first) {
        Some(indices) => indices,
        None => {
            // 第一行就是数据
            if let Some(pair) = to_pair(&first, 0, 1) {
                pairs.push(pair);
            }
            (0, 1)
        }
    };

    for fields in lines {
        if let Some(pair) = to_pair(&fields, terminal_idx, slot_idx) {
            pairs.push(pair);
        }
    }
    pairs
}

fn split_fields(line: &str) -> Vec<String> {
    let sep = if line.contains('\t') { '\t' } else { ',' };
    line.split(sep).map(|f| f.trim().to_string()).collect()
}

/// 识别表头行，返回 (一段码列, 格口列)
fn detect_header(fields: &[String]) -> Option<(usize, usize)> {
    let mut terminal_idx = None;
    let mut slot_idx = None;
    for (idx, field) in fields.iter().enumerate() {
        let low = field.to_lowercase();
        if TERMINAL_KEYWORDS.iter().any(|k| low.contains(k)) {
            terminal_idx = Some(idx);
        }
        if SLOT_KEYWORDS.iter().any(|k| low.contains(k)) {
            slot_idx = Some(idx);
        }
    }
    match (terminal_idx, slot_idx) {
        (None, None) => None,
        // 只认出一列时另一列按默认位置补
        (t, s) => Some((t.unwrap_or(0), s.unwrap_or(1))),
    }
}

fn to_pair(fields: &[String], terminal_idx: usize, slot_idx: usize) -> Option<(String, Option<i64>)> {
    let terminal = fields.get(terminal_idx).cloned().unwrap_or_default();
    let slot_raw = fields.get(slot_idx).cloned().unwrap_or_default();
    if terminal.is_empty() && slot_raw.is_empty() {
        return None;
    }
    // 格口号可能带小数（导出工具把整数写成 3.0）
    let slot = slot_raw
        .parse::<f64>()
        .ok()
        .map(|v| v as i64)
        .or_else(|| slot_raw.parse::<i64>().ok());
    Some((terminal, slot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_header() {
        let content = "一段码,格口号\n100,1\n200,2\n";
        let pairs = parse_slot_plan(content);
        assert_eq!(
            pairs,
            vec![
                ("100".to_string(), Some(1)),
                ("200".to_string(), Some(2)),
            ]
        );
    }

    #[test]
    fn test_parse_headerless_numeric_rows() {
        let content = "100,1\n200,2\n";
        let pairs = parse_slot_plan(content);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("100".to_string(), Some(1)));
    }

    #[test]
    fn test_parse_tab_separated_with_english_header() {
        let content = "terminal_code\tslot_id\n300\t7\n";
        let pairs = parse_slot_plan(content);
        assert_eq!(pairs, vec![("300".to_string(), Some(7))]);
    }

    #[test]
    fn test_parse_reversed_columns_by_header() {
        let content = "格口号,一段码\n5,900\n";
        let pairs = parse_slot_plan(content);
        assert_eq!(pairs, vec![("900".to_string(), Some(5))]);
    }

    #[test]
    fn test_parse_skips_blank_lines_and_decimal_slots() {
        let content = "一段码,格口号\n\n100,3.0\n,\n";
        let pairs = parse_slot_plan(content);
        assert_eq!(pairs, vec![("100".to_string(), Some(3))]);
    }

    #[test]
    fn test_parse_empty_content() {
        assert!(parse_slot_plan("").is_empty());
        assert!(parse_slot_plan("\n\n").is_empty());
    }

    #[test]
    fn test_unparseable_slot_keeps_terminal() {
        let content = "一段码,格口号\n100,备用\n";
        let pairs = parse_slot_plan(content);
        assert_eq!(pairs, vec![("100".to_string(), None)]);
    }

    #[test]
    fn test_process_plan_file_replaces_table_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(&dir.path().join("test.db"), 2).unwrap();
        let plan_path = dir.path().join("格口方案.csv");
        std::fs::write(&plan_path, "一段码,格口号\n100,1\n").unwrap();

        let watcher = SlotPlanWatcher::new(
            store.clone(),
            SlotPlanConfig {
                file_name: plan_path.to_string_lossy().into_owned(),
                check_interval_secs: 5,
                processed_dir: dir.path().join("processed"),
            },
            CancellationToken::new(),
        );

        watcher.process_plan_file(&plan_path).unwrap();

        assert_eq!(store.slot_for_terminal("100").unwrap(), Some(1));
        assert!(!plan_path.exists());
        let archived: Vec<_> = std::fs::read_dir(dir.path().join("processed"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);
    }
}
