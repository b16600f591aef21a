// 收件模块
//
// 扫描设备把图片落到 inbox 目录，这里定时扫描并逐张处理：
// 1. 大小超限 -> 删除
// 2. 非图片 -> 删除
// 3. 按文件名解析供包台号和日期小时，归档到对应目录
// 4. 以运单号写入/更新数据库待传记录
// 5. DB 写失败 -> 把文件复制到 db_error 目录兜底
//
// 文件传输协议本身由外部承担（设备端 FTP/SMB 落盘），这里只消费落盘结果；
// 处理路径上的任何错误都就地消化，不会影响上传循环

pub mod filename;

use crate::config::IngestConfig;
use crate::store::ImageStore;
use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 文件落盘后的静置时间（秒），避免处理写了一半的文件
const SETTLE_SECS: u64 = 1;

/// 单张图片的处理结果
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// 已归档并写库
    Stored { code: String, dest: PathBuf },
    /// 超过大小上限，已删除
    RejectedOversize,
    /// 不是图片，已删除
    RejectedNotImage,
    /// 尚未写完，下个周期再看
    NotSettled,
}

/// 收件服务
pub struct IngestService {
    store: ImageStore,
    config: IngestConfig,
    cancel_token: CancellationToken,
}

impl IngestService {
    pub fn new(store: ImageStore, config: IngestConfig, cancel_token: CancellationToken) -> Self {
        Self {
            store,
            config,
            cancel_token,
        }
    }

    /// 运行收件扫描循环，直到取消信号到来
    pub async fn run(&self) {
        let inbox = self.config.inbox_dir();
        if let Err(e) = std::fs::create_dir_all(&inbox) {
            error!("创建收件目录失败: {:?}, 错误: {}", inbox, e);
            return;
        }
        info!(
            "启动收件扫描: 目录={:?}, 间隔={}s",
            inbox, self.config.scan_interval_secs
        );

        while !self.cancel_token.is_cancelled() {
            let files = scan_inbox(&inbox);
            for file in files {
                if self.cancel_token.is_cancelled() {
                    break;
                }
                let store = self.store.clone();
                let config = self.config.clone();
                let result = tokio::task::spawn_blocking(move || {
                    process_file(&store, &config, &file)
                })
                .await;
                match result {
                    Ok(Ok(IngestOutcome::Stored { code, dest })) => {
                        info!("保存记录到DB code={} path={:?}", code, dest);
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("处理收件文件失败: {:#}", e),
                    Err(e) => error!("收件任务异常: {}", e),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.scan_interval_secs)) => {}
                _ = self.cancel_token.cancelled() => {}
            }
        }

        info!("收件扫描已退出");
    }
}

/// 扫描 inbox 目录下的文件（不进子目录，inbox 是平铺落盘）
fn scan_inbox(inbox: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(inbox)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

/// 处理一张落盘图片
pub fn process_file(
    store: &ImageStore,
    config: &IngestConfig,
    file_path: &Path,
) -> Result<IngestOutcome> {
    info!("接收图片路径: {:?}", file_path);

    let metadata = std::fs::metadata(file_path)
        .with_context(|| format!("获取文件信息失败: {:?}", file_path))?;

    // 静置检查：修改时间太近说明可能还在写
    if let Ok(modified) = metadata.modified() {
        if modified.elapsed().map(|d| d.as_secs() < SETTLE_SECS).unwrap_or(false) {
            return Ok(IngestOutcome::NotSettled);
        }
    }

    if metadata.len() > config.max_file_size {
        warn!("文件过大, 删除: {:?}", file_path);
        std::fs::remove_file(file_path)
            .with_context(|| format!("删除超限文件失败: {:?}", file_path))?;
        return Ok(IngestOutcome::RejectedOversize);
    }

    if !is_image_file(file_path) {
        warn!("非图片文件, 删除: {:?}", file_path);
        std::fs::remove_file(file_path)
            .with_context(|| format!("删除非图片文件失败: {:?}", file_path))?;
        return Ok(IngestOutcome::RejectedNotImage);
    }

    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("文件名不是合法 UTF-8")?
        .to_string();

    // 按供包台号 + 日期小时归档
    let parsed = filename::parse_id_date_hour(&file_name, Local::now());
    let platform_dir = match &parsed.platform_id {
        Some(id) => format!("{}号供包台", id),
        None => "unknown".to_string(),
    };
    let dest_dir = config
        .home_dir
        .join(platform_dir)
        .join(&parsed.year)
        .join(&parsed.month)
        .join(&parsed.day)
        .join(&parsed.hour);
    std::fs::create_dir_all(&dest_dir)
        .with_context(|| format!("创建归档目录失败: {:?}", dest_dir))?;

    let (scan_code, save_name) = filename::derive_scan_code(&file_name);
    let mut dest_path = dest_dir.join(&save_name);

    // 移动失败时保留原路径继续写库
    if let Err(e) = move_file(file_path, &dest_path) {
        error!("移动文件失败, 保留原路径: {:?}, 错误: {:#}", file_path, e);
        dest_path = file_path.to_path_buf();
    }

    let dest_str = dest_path.to_string_lossy().into_owned();
    if let Err(e) = store.upsert_image(&scan_code, &dest_str) {
        error!("写 DB 失败, 将文件复制到错误目录: {:#}", e);
        let err_dir = config.db_error_dir();
        std::fs::create_dir_all(&err_dir)
            .with_context(|| format!("创建错误目录失败: {:?}", err_dir))?;
        std::fs::copy(&dest_path, err_dir.join(&save_name))
            .with_context(|| format!("复制到错误目录失败: {:?}", dest_path))?;
    }

    Ok(IngestOutcome::Stored {
        code: scan_code,
        dest: dest_path,
    })
}

/// 图片完整性校验（能按格式解码即认为有效）
fn is_image_file(path: &Path) -> bool {
    match image::io::Reader::open(path) {
        Ok(reader) => match reader.with_guessed_format() {
            Ok(reader) => reader.decode().is_ok(),
            Err(_) => false,
        },
        Err(_) => false,
    }
}

/// 移动文件，跨卷时回退为复制+删除
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to).with_context(|| format!("复制失败: {:?} -> {:?}", from, to))?;
    std::fs::remove_file(from).with_context(|| format!("删除源文件失败: {:?}", from))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    fn test_fixture(home: &Path) -> (ImageStore, IngestConfig) {
        let store = ImageStore::open(&home.join("test.db"), 2).unwrap();
        let config = IngestConfig {
            home_dir: home.join("arrival"),
            scan_interval_secs: 1,
            max_file_size: 1024 * 1024,
        };
        fs::create_dir_all(config.inbox_dir()).unwrap();
        (store, config)
    }

    fn write_png(path: &Path) {
        image::RgbImage::new(2, 2).save(path).unwrap();
    }

    /// 把修改时间推回过去，跳过静置检查
    fn backdate(path: &Path) {
        let old = std::time::SystemTime::now() - Duration::from_secs(60);
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(old).unwrap();
    }

    #[test]
    fn test_stored_image_is_routed_and_recorded() {
        let dir = tempdir().unwrap();
        let (store, config) = test_fixture(dir.path());

        let src = config.inbox_dir().join("3_JT5100062860618_20251001_08.png");
        write_png(&src);
        backdate(&src);

        let outcome = process_file(&store, &config, &src).unwrap();
        let expected_dest = config
            .home_dir
            .join("3号供包台")
            .join("2025")
            .join("10")
            .join("01")
            .join("08")
            .join("JT5100062860618_20251001_08.png");
        assert_eq!(
            outcome,
            IngestOutcome::Stored {
                code: "JT5100062860618".to_string(),
                dest: expected_dest.clone(),
            }
        );
        assert!(expected_dest.exists());
        assert!(!src.exists());

        let pending = store.fetch_pending(50).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].code, "JT5100062860618");
    }

    #[test]
    fn test_oversized_file_is_deleted() {
        let dir = tempdir().unwrap();
        let (store, mut config) = test_fixture(dir.path());
        config.max_file_size = 4;

        let src = config.inbox_dir().join("3_JT1_20251001_08.png");
        fs::File::create(&src)
            .unwrap()
            .write_all(&[0u8; 64])
            .unwrap();
        backdate(&src);

        let outcome = process_file(&store, &config, &src).unwrap();
        assert_eq!(outcome, IngestOutcome::RejectedOversize);
        assert!(!src.exists());
        assert!(store.fetch_pending(50).unwrap().is_empty());
    }

    #[test]
    fn test_non_image_is_deleted() {
        let dir = tempdir().unwrap();
        let (store, config) = test_fixture(dir.path());

        let src = config.inbox_dir().join("3_JT1_20251001_08.jpg");
        fs::File::create(&src)
            .unwrap()
            .write_all(b"definitely not a jpeg")
            .unwrap();
        backdate(&src);

        let outcome = process_file(&store, &config, &src).unwrap();
        assert_eq!(outcome, IngestOutcome::RejectedNotImage);
        assert!(!src.exists());
    }

    #[test]
    fn test_fresh_file_is_left_for_next_tick() {
        let dir = tempdir().unwrap();
        let (store, config) = test_fixture(dir.path());

        let src = config.inbox_dir().join("3_JT1_20251001_08.png");
        write_png(&src);

        let outcome = process_file(&store, &config, &src).unwrap();
        assert_eq!(outcome, IngestOutcome::NotSettled);
        assert!(src.exists());
    }

    #[test]
    fn test_unknown_platform_routes_to_unknown_dir() {
        let dir = tempdir().unwrap();
        let (store, config) = test_fixture(dir.path());

        let src = config.inbox_dir().join("JT9_20251001_08.png");
        write_png(&src);
        backdate(&src);

        let outcome = process_file(&store, &config, &src).unwrap();
        match outcome {
            IngestOutcome::Stored { dest, .. } => {
                assert!(dest.starts_with(config.home_dir.join("unknown")));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_scan_inbox_skips_subdirs() {
        let dir = tempdir().unwrap();
        let (_store, config) = test_fixture(dir.path());
        let inbox = config.inbox_dir();

        fs::File::create(inbox.join("a.jpg")).unwrap();
        fs::create_dir(inbox.join("sub")).unwrap();
        fs::File::create(inbox.join("sub").join("b.jpg")).unwrap();

        let files = scan_inbox(&inbox);
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("a.jpg"));
    }
}
