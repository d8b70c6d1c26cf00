//! 同步引擎：下载与上传路径
//!
//! 下载：按用户合并在途请求，zstd 解压（兼容历史未压缩格式），
//! 文件头校验后临时文件 + 原子重命名落盘。
//! 上传：校验和门控跳过未变更内容，zstd 压缩，元数据先落盘再更新
//! 内存缓存。

use futures::FutureExt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::addressing;
use crate::connection::{CheckpointManager, LocalFileEntry, SharedDownload, CHECKPOINT_FILE};
use crate::metadata::MetadataRow;
use crate::models::CheckpointError;

type Result<T> = std::result::Result<T, CheckpointError>;

/// SQLite 文件头魔数
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

pub(crate) fn is_sqlite_header(bytes: &[u8]) -> bool {
    bytes.len() >= SQLITE_MAGIC.len() && bytes.starts_with(SQLITE_MAGIC)
}

/// 上传结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 本地无文件，无事可做
    NoLocalFile,
    /// 用户活跃中，推迟到下个调度周期
    ActiveDeferred,
    /// 内容与最近一次上传一致，跳过远端写入
    Unchanged,
    /// 已上传新副本
    Uploaded,
}

impl CheckpointManager {
    // ------------------------------------------------------------------
    // 下载路径
    // ------------------------------------------------------------------

    /// 确保本地副本存在（幂等；同一用户的并发调用共享一次下载）
    ///
    /// 返回 `Ok(None)` 表示远端没有可用备份（首次使用的预期状态），
    /// 由调用方决定是否建空库。
    pub async fn ensure_local(self: &Arc<Self>, user_id: &str) -> Result<Option<PathBuf>> {
        let (fut, created) = {
            let mut downloads = self
                .downloads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(existing) = downloads.get(user_id) {
                (existing.clone(), false)
            } else {
                let manager = Arc::clone(self);
                let uid = user_id.to_string();
                let fut: SharedDownload =
                    async move { manager.download_checkpoint(&uid).await }.boxed().shared();
                downloads.insert(user_id.to_string(), fut.clone());
                (fut, true)
            }
        };

        let result = fut.await;

        if created {
            self.downloads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(user_id);
        }

        result
    }

    /// 下载内层（不合并；恢复管线也直接调用以强制重新下载）
    pub(crate) async fn download_checkpoint(&self, user_id: &str) -> Result<Option<PathBuf>> {
        let path = self.checkpoint_path(user_id);
        if path.exists() {
            self.touch_local_file(user_id, &path);
            return Ok(Some(path));
        }

        let bytes = match self.fetch_remote_checkpoint(user_id).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        // zstd 解压；裸 SQLite 文件头视为历史未压缩格式
        let payload = match zstd::stream::decode_all(bytes.as_slice()) {
            Ok(payload) => payload,
            Err(e) => {
                if is_sqlite_header(&bytes) {
                    debug!(
                        "[SyncEngine] 用户 {} 的远端副本为历史未压缩格式，直接采用",
                        user_id
                    );
                    bytes
                } else {
                    // 损坏内容绝不写入本地缓存
                    return Err(CheckpointError::corruption(format!(
                        "远端检查点既无法解压也不是有效数据库: {}",
                        e
                    )));
                }
            }
        };

        if !is_sqlite_header(&payload) {
            return Err(CheckpointError::corruption(
                "解压后的检查点缺少数据库文件头",
            ));
        }

        write_checkpoint_atomic(&path, &payload)?;

        // rename 成功后才更新内存路径缓存
        self.local_files.insert(
            user_id.to_string(),
            LocalFileEntry {
                path: path.clone(),
                last_accessed: Instant::now(),
            },
        );

        // 建立元数据归属；下载内容即远端备份内容，校验和随之同步
        let checksum = addressing::bytes_checksum(&payload);
        let storage_key = self.storage_key_for(user_id);
        let prior_ref = self
            .metadata
            .get(&storage_key)?
            .and_then(|row| row.remote_ref);
        self.metadata.upsert(&MetadataRow {
            storage_key,
            user_id: user_id.to_string(),
            remote_ref: prior_ref,
            content_checksum: Some(checksum.clone()),
            updated_at: chrono::Utc::now(),
        })?;
        self.checksums.insert(user_id.to_string(), checksum);

        info!(
            "[SyncEngine] 已下载用户 {} 的检查点 ({} 字节)",
            user_id,
            payload.len()
        );
        Ok(Some(path))
    }

    /// 取回远端 blob 字节；`Ok(None)` = 远端无可用备份
    async fn fetch_remote_checkpoint(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        // 优先走缓存的 blob 引用，省一次房间解析
        let cached_ref = self.remote_refs.get(user_id).map(|r| r.value().clone()).or_else(|| {
            let storage_key = self.storage_key_for(user_id);
            self.metadata
                .get(&storage_key)
                .ok()
                .flatten()
                .and_then(|row| row.remote_ref)
        });

        if let Some(blob_ref) = cached_ref {
            match self.remote.fetch_blob_by_ref(&blob_ref).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) if e.is_unrecoverable() => {
                    // 引用失效只在读取失败时才暴露，清掉后按键回退
                    warn!(
                        "[SyncEngine] 用户 {} 缓存的 blob 引用已失效 ({})，按键回退",
                        user_id, e
                    );
                    self.remote_refs.remove(user_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let room = match self.remote.resolve_room(user_id).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                debug!("[SyncEngine] 用户 {} 尚无同步房间（首次使用）", user_id);
                return Ok(None);
            }
            Err(e) if e.is_unrecoverable() => {
                warn!(
                    "[SyncEngine] 用户 {} 的房间不可访问（{}），按无备份处理",
                    user_id, e
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let storage_key = self.storage_key_for(user_id);
        match self.remote.fetch_blob_by_key(&room, &storage_key).await {
            Ok(Some(bytes)) => Ok(Some(bytes)),
            Ok(None) => Ok(None),
            Err(e) if e.is_unrecoverable() => {
                warn!(
                    "[SyncEngine] 用户 {} 的远端副本不可恢复（{}），按无备份处理",
                    user_id, e
                );
                Ok(None)
            }
            // 瞬态错误必须上抛：此处建空库会在下次上传覆盖完好备份
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn touch_local_file(&self, user_id: &str, path: &Path) {
        self.local_files.insert(
            user_id.to_string(),
            LocalFileEntry {
                path: path.to_path_buf(),
                last_accessed: Instant::now(),
            },
        );
    }

    // ------------------------------------------------------------------
    // 上传路径
    // ------------------------------------------------------------------

    /// 上传用户检查点（校验和门控；活跃用户推迟）
    pub async fn upload(&self, user_id: &str) -> Result<UploadOutcome> {
        let path = self.checkpoint_path(user_id);
        if !path.exists() {
            self.local_files.remove(user_id);
            return Ok(UploadOutcome::NoLocalFile);
        }

        // 活跃用户跳过：事务中途的快照可能不一致
        if self.active_count(user_id) > 0 {
            debug!("[SyncEngine] 用户 {} 活跃中，上传推迟", user_id);
            return Ok(UploadOutcome::ActiveDeferred);
        }

        // 非活跃：先 checkpoint WAL 并关闭缓存句柄，保证主文件完整
        if let Some(conn) = self.evict_connection(user_id) {
            conn.checkpoint_wal();
            drop(conn);
        } else {
            // 重启后残留的 WAL 也要并入主文件，否则上传的是旧快照
            let wal = PathBuf::from(format!("{}-wal", path.display()));
            if wal.exists() {
                if let Ok(conn) = rusqlite::Connection::open(&path) {
                    let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
                }
            }
        }

        let checksum = addressing::file_checksum(&path)?;
        if self.last_uploaded_checksum(user_id)?.as_deref() == Some(checksum.as_str()) {
            debug!("[SyncEngine] 用户 {} 的检查点未变更，跳过上传", user_id);
            return Ok(UploadOutcome::Unchanged);
        }

        let raw = fs::read(&path)
            .map_err(|e| CheckpointError::file_system(format!("读取检查点失败 {:?}: {}", path, e)))?;
        let compressed = zstd::stream::encode_all(Cursor::new(raw.as_slice()), self.config.compression_level)
            .map_err(|e| CheckpointError::internal(format!("压缩检查点失败: {}", e)))?;

        let storage_key = self.storage_key_for(user_id);
        let room = match self.remote.resolve_room(user_id).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                return Err(CheckpointError::validation(format!(
                    "用户 {} 没有可解析的同步房间，无法上传",
                    user_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        // 取代旧副本：尽力删除同键旧 blob，失败不阻塞新上传
        let prior = self.metadata.get(&storage_key)?;
        let has_prior = self.remote_refs.contains_key(user_id)
            || prior.as_ref().map_or(false, |row| row.remote_ref.is_some());
        if has_prior {
            if let Err(e) = self.remote.delete_blob_by_key(&room, &storage_key).await {
                warn!("[SyncEngine] 取代旧远端副本失败（继续上传）: {}", e);
            }
        }

        let blob_ref = self
            .remote
            .upload_blob(&room, &storage_key, &compressed)
            .await
            .map_err(CheckpointError::from)?;

        // 先持久化，再更新内存缓存；崩溃也不会让内存缓存领先于落盘状态
        self.metadata.upsert(&MetadataRow {
            storage_key,
            user_id: user_id.to_string(),
            remote_ref: Some(blob_ref.clone()),
            content_checksum: Some(checksum.clone()),
            updated_at: chrono::Utc::now(),
        })?;
        self.remote_refs.insert(user_id.to_string(), blob_ref);
        self.checksums.insert(user_id.to_string(), checksum);

        info!(
            "[SyncEngine] 用户 {} 的检查点已上传 ({} 字节压缩后)",
            user_id,
            compressed.len()
        );
        Ok(UploadOutcome::Uploaded)
    }

    fn last_uploaded_checksum(&self, user_id: &str) -> Result<Option<String>> {
        if let Some(checksum) = self.checksums.get(user_id) {
            return Ok(Some(checksum.value().clone()));
        }
        let storage_key = self.storage_key_for(user_id);
        let checksum = self
            .metadata
            .get(&storage_key)?
            .and_then(|row| row.content_checksum);
        if let Some(ref c) = checksum {
            self.checksums.insert(user_id.to_string(), c.clone());
        }
        Ok(checksum)
    }

    // ------------------------------------------------------------------
    // 调度器驱动的扫描
    // ------------------------------------------------------------------

    /// 上传扫描：只迭代已知本地文件，单用户失败不中断整轮
    pub async fn run_upload_sweep(&self) {
        let users: Vec<String> = self.local_files.iter().map(|e| e.key().clone()).collect();
        debug!("[SyncEngine] 上传扫描开始，共 {} 个本地检查点", users.len());

        for user_id in users {
            match self.upload(&user_id).await {
                Ok(outcome) => debug!("[SyncEngine] 用户 {} 扫描结果: {:?}", user_id, outcome),
                Err(e) => warn!(
                    "[SyncEngine] 用户 {} 上传失败（下个周期重试）: {}",
                    user_id, e
                ),
            }
        }
    }

    /// 空闲回收：上传后关闭空闲连接；上传后删除空闲本地文件
    ///
    /// 任何上传失败都保留现场，等下个周期重试——绝不删除尚未
    /// 备份的文件。
    pub async fn run_idle_eviction(&self) {
        let threshold = std::time::Duration::from_secs(self.config.idle_threshold_secs);

        // 1) 空闲连接：上传（内部会 checkpoint 并关闭句柄）
        for user_id in self.idle_connection_users(threshold) {
            match self.upload(&user_id).await {
                Ok(outcome) => {
                    debug!("[SyncEngine] 空闲连接 {} 已回收: {:?}", user_id, outcome)
                }
                Err(e) => warn!("[SyncEngine] 回收用户 {} 连接失败: {}", user_id, e),
            }
        }

        // 2) 空闲本地文件：确保已同步后删除
        let idle_files: Vec<(String, PathBuf)> = self
            .local_files
            .iter()
            .filter(|entry| {
                self.active_count(entry.key()) == 0 && entry.last_accessed.elapsed() > threshold
            })
            .map(|entry| (entry.key().clone(), entry.path.clone()))
            .collect();

        for (user_id, path) in idle_files {
            match self.upload(&user_id).await {
                Ok(UploadOutcome::ActiveDeferred) => continue,
                Ok(_) => {
                    // 删除前再次确认未被激活
                    if self.active_count(&user_id) > 0 {
                        continue;
                    }
                    if let Err(e) = remove_checkpoint_files(&path) {
                        warn!("[SyncEngine] 删除本地检查点失败 {:?}: {}", path, e);
                        continue;
                    }
                    self.local_files.remove(&user_id);
                    debug!("[SyncEngine] 用户 {} 的空闲本地检查点已删除", user_id);
                }
                Err(e) => warn!(
                    "[SyncEngine] 用户 {} 上传失败，本地文件保留待重试: {}",
                    user_id, e
                ),
            }
        }
    }

    // ------------------------------------------------------------------
    // 启动种子化
    // ------------------------------------------------------------------

    /// 扫描检查点根目录，将重启后幸存的本地文件纳入上传扫描视野
    ///
    /// 归属优先级：元数据行（权威 user_id） > 目录名（未上传过的新库，
    /// 依赖目录名与用户 ID 的无损对应）。
    pub fn seed_local_files(&self) -> Result<()> {
        let root = &self.config.checkpoints_dir;
        fs::create_dir_all(root)
            .map_err(|e| CheckpointError::file_system(format!("创建检查点根目录失败: {}", e)))?;

        let mut seeded = 0usize;
        let mut attributed_dirs = std::collections::HashSet::new();

        for row in self.metadata.all_rows()? {
            let path = self.checkpoint_path(&row.user_id);
            if let Some(dir_name) = path.parent().and_then(|p| p.file_name()) {
                attributed_dirs.insert(dir_name.to_os_string());
            }
            if path.exists() {
                self.touch_local_file(&row.user_id, &path);
                seeded += 1;
            }
            if let Some(blob_ref) = row.remote_ref {
                self.remote_refs.insert(row.user_id.clone(), blob_ref);
            }
            if let Some(checksum) = row.content_checksum {
                self.checksums.insert(row.user_id.clone(), checksum);
            }
        }

        // 目录扫描兜底：仅覆盖元数据行缺失的目录（历史版本产物）。
        // 目录名即用户 ID；经过有损 sanitize 的目录无法反推，只能
        // 以目录名为键继续追踪。
        for entry in WalkDir::new(root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() && entry.file_name() == CHECKPOINT_FILE {
                let user_dir = entry.path().parent().and_then(|p| p.file_name());
                if let Some(dir_name) = user_dir {
                    if attributed_dirs.contains(dir_name) {
                        continue;
                    }
                    if let Some(user_id) = dir_name.to_str() {
                        if !self.local_files.contains_key(user_id) {
                            self.touch_local_file(user_id, entry.path());
                            seeded += 1;
                        }
                    }
                }
            }
        }

        info!("[SyncEngine] 启动扫描完成，登记 {} 个本地检查点", seeded);
        Ok(())
    }
}

/// 临时文件 + 原子重命名写入
///
/// rename 是唯一让文件可见的步骤；崩溃最多留下 tmp 残件，最终路径
/// 不会出现半写文件。
pub(crate) fn write_checkpoint_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CheckpointError::internal(format!("检查点路径缺少父目录: {:?}", path)))?;
    fs::create_dir_all(dir)
        .map_err(|e| CheckpointError::file_system(format!("创建用户目录失败 {:?}: {}", dir, e)))?;

    let tmp = dir.join(format!("{}.tmp-{}", CHECKPOINT_FILE, Uuid::new_v4()));
    if let Err(e) = fs::write(&tmp, payload) {
        let _ = fs::remove_file(&tmp);
        return Err(CheckpointError::file_system(format!(
            "写入临时检查点失败 {:?}: {}",
            tmp, e
        )));
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CheckpointError::file_system(format!("原子重命名失败 {:?} -> {:?}: {}", tmp, path, e))
    })
}

/// 删除检查点主文件及 WAL/SHM 伴生文件
pub(crate) fn remove_checkpoint_files(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    for suffix in ["-wal", "-shm"] {
        let sibling = PathBuf::from(format!("{}{}", path.display(), suffix));
        if sibling.exists() {
            let _ = fs::remove_file(&sibling);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_header_detection() {
        let mut valid = vec![0u8; 128];
        valid[..16].copy_from_slice(SQLITE_MAGIC);
        assert!(is_sqlite_header(&valid));

        assert!(!is_sqlite_header(b"SQLite format"));
        assert!(!is_sqlite_header(&[0u8; 64]));
        assert!(!is_sqlite_header(&[]));
    }

    #[test]
    fn test_write_checkpoint_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user").join(CHECKPOINT_FILE);

        write_checkpoint_atomic(&path, b"payload-1").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload-1");

        // 覆盖写同样原子
        write_checkpoint_atomic(&path, b"payload-2").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload-2");

        // 不残留临时文件
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_compression_roundtrip_with_legacy_fallback() {
        let mut payload = vec![0u8; 256];
        payload[..16].copy_from_slice(SQLITE_MAGIC);

        let compressed = zstd::stream::encode_all(Cursor::new(payload.as_slice()), 0).unwrap();
        let decoded = zstd::stream::decode_all(compressed.as_slice()).unwrap();
        assert_eq!(decoded, payload);

        // 裸数据库字节无法被 zstd 解压，但文件头有效 → 历史格式路径
        assert!(zstd::stream::decode_all(payload.as_slice()).is_err());
        assert!(is_sqlite_header(&payload));
    }
}
