//! 图片记录存储模块
//!
//! SQLite 存储，是图片上传状态的唯一持久来源：
//! - pic: 收到的图片记录（is_upload: 0 待传, 1 已传, 2 缺失）
//! - terminalcode_to_slot: 一段码 -> 格口号 路由表
//!
//! 每个操作独立从连接池取连接，不跨网络调用持有连接；
//! 可能有其他进程并发读写，所有写入保持幂等

use anyhow::{Context, Result};
use chrono::Local;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;
use tracing::info;

/// 待上传图片记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingImage {
    /// 存储行 ID
    pub id: i64,
    /// 业务单号（运单号）
    pub code: String,
    /// 图片文件路径
    pub path: String,
}

/// 图片记录存储
#[derive(Clone)]
pub struct ImageStore {
    pool: Pool<SqliteConnectionManager>,
}

impl ImageStore {
    /// 打开数据库并初始化表结构
    pub fn open(db_path: &Path, pool_size: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .context("创建数据库连接池失败")?;

        let store = Self { pool };
        store.init_tables()?;
        info!("数据库初始化完成: {:?}, 连接池大小={}", db_path, pool_size);
        Ok(store)
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<()> {
        let conn = self.pool.get()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS pic (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                path TEXT NOT NULL,
                time TEXT NOT NULL,
                upload_time TEXT,
                short_url TEXT,
                is_upload INTEGER NOT NULL DEFAULT 0
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pic_is_upload ON pic(is_upload)",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS terminalcode_to_slot (
                terminal_code TEXT NOT NULL,
                slot_id INTEGER
            )
            "#,
            [],
        )?;

        Ok(())
    }

    /// 拉取待上传记录（最多 limit 条）
    pub fn fetch_pending(&self, limit: usize) -> Result<Vec<PendingImage>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT id, code, path FROM pic WHERE is_upload = 0 LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(PendingImage {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    path: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 写入或更新图片记录（同一单号重复收图时复位为待传）
    pub fn upsert_image(&self, code: &str, path: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let now = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        conn.execute(
            r#"
            INSERT INTO pic (code, path, time, is_upload) VALUES (?1, ?2, ?3, 0)
            ON CONFLICT(code) DO UPDATE SET path = ?2, time = ?3, is_upload = 0
            "#,
            params![code, path, now],
        )?;
        Ok(())
    }

    /// 标记为已上传（重复标记无害）
    pub fn mark_uploaded(&self, code: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let now = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        conn.execute(
            "UPDATE pic SET is_upload = 1, upload_time = ?1 WHERE code = ?2",
            params![now, code],
        )?;
        Ok(())
    }

    /// 标记为缺失（图片文件已不存在，终态，不会自动重试）
    pub fn mark_missing(&self, id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("UPDATE pic SET is_upload = 2 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// 按单号回写 shortUrl
    pub fn update_short_url(&self, code: &str, short_url: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE pic SET short_url = ?1 WHERE code = ?2",
            params![short_url, code],
        )?;
        Ok(())
    }

    /// 整体替换一段码路由表（单事务：清空 + 插入）
    pub fn replace_slot_table(&self, pairs: &[(String, Option<i64>)]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM terminalcode_to_slot", [])?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO terminalcode_to_slot (terminal_code, slot_id) VALUES (?1, ?2)")?;
            for (terminal, slot) in pairs {
                stmt.execute(params![terminal, slot])?;
            }
        }
        tx.commit()?;
        info!("路由表已更新, 共 {} 条", pairs.len());
        Ok(())
    }

    /// 查询一段码对应的格口号
    pub fn slot_for_terminal(&self, terminal_code: &str) -> Result<Option<i64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn
            .prepare("SELECT slot_id FROM terminalcode_to_slot WHERE terminal_code = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![terminal_code])?;
        match rows.next()? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(None),
        }
    }

    #[cfg(test)]
    fn status_of(&self, code: &str) -> Result<Option<(i64, Option<String>)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT is_upload, short_url FROM pic WHERE code = ?1")?;
        let mut rows = stmt.query(params![code])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
            None => Ok(None),
        }
    }
}
