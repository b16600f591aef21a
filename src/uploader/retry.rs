// 重试台账
//
// 单号 -> 本次运行内的失败次数。只存在于进程内存，重启即清零：
// 达到上限的单子在本次运行内不再派发，但数据库中仍是待传状态，
// 下次进程启动后会重新尝试

use std::collections::HashMap;

/// 重试台账
#[derive(Debug)]
pub struct AttemptLedger {
    /// 单号 -> 失败次数
    attempts: HashMap<String, u32>,
    /// 单张图片的失败上限
    ceiling: u32,
}

impl AttemptLedger {
    /// 创建新台账
    pub fn new(ceiling: u32) -> Self {
        Self {
            attempts: HashMap::new(),
            ceiling,
        }
    }

    /// 该单号是否已达重试上限
    ///
    /// 只读判断，重复调用不改变状态
    pub fn reached_ceiling(&self, code: &str) -> bool {
        self.attempts.get(code).copied().unwrap_or(0) >= self.ceiling
    }

    /// 记一次失败，返回累计次数
    pub fn increment(&mut self, code: &str) -> u32 {
        let count = self.attempts.entry(code.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// 上传成功后清除该单号的计数
    pub fn clear(&mut self, code: &str) {
        self.attempts.remove(code);
    }

    /// 当前失败次数（无记录为 0）
    pub fn count(&self, code: &str) -> u32 {
        self.attempts.get(code).copied().unwrap_or(0)
    }

    /// 台账中有记录的单号数量
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_clear() {
        let mut ledger = AttemptLedger::new(3);

        assert_eq!(ledger.count("JT001"), 0);
        assert_eq!(ledger.increment("JT001"), 1);
        assert_eq!(ledger.increment("JT001"), 2);
        assert_eq!(ledger.count("JT001"), 2);

        // 成功后清零，台账里不留条目
        ledger.clear("JT001");
        assert_eq!(ledger.count("JT001"), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_ceiling_exclusion_is_idempotent() {
        let mut ledger = AttemptLedger::new(2);

        ledger.increment("JT001");
        assert!(!ledger.reached_ceiling("JT001"));
        ledger.increment("JT001");
        assert!(ledger.reached_ceiling("JT001"));

        // 重复检查不再改变计数
        assert!(ledger.reached_ceiling("JT001"));
        assert_eq!(ledger.count("JT001"), 2);
    }

    #[test]
    fn test_codes_are_independent() {
        let mut ledger = AttemptLedger::new(3);

        ledger.increment("JT001");
        ledger.increment("JT002");
        ledger.increment("JT002");

        assert_eq!(ledger.count("JT001"), 1);
        assert_eq!(ledger.count("JT002"), 2);
        assert_eq!(ledger.len(), 2);

        ledger.clear("JT002");
        assert_eq!(ledger.count("JT001"), 1);
    }

    #[test]
    fn test_clear_unknown_code_is_noop() {
        let mut ledger = AttemptLedger::new(3);
        ledger.clear("JT404");
        assert!(ledger.is_empty());
    }
}
