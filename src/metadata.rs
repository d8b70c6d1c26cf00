//! 本地同步元数据存储
//!
//! 单个共享 SQLite 文件，记录 `存储键 → (远端引用, 最近上传校验和)`，
//! 用于跳过冗余的远端调用与「内容未变」判定。请求路径与调度器
//! 路径都会写入，但全部是独立的单行 upsert，依赖 SQLite 自身的
//! 串行化即可。

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::models::CheckpointError;
use crate::remote::BlobRef;

type Result<T> = std::result::Result<T, CheckpointError>;
type SqlitePool = Pool<SqliteConnectionManager>;

const METADATA_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoint_meta (
    storage_key TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    remote_ref TEXT,
    content_checksum TEXT,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checkpoint_meta_user ON checkpoint_meta(user_id);
"#;

/// 元数据行
///
/// `content_checksum` 等于最近一次成功上传（或下载）的内容校验和；
/// 本地副本因损坏被清除时必须置空，避免过期校验和掩盖必要的重传。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRow {
    pub storage_key: String,
    pub user_id: String,
    pub remote_ref: Option<BlobRef>,
    pub content_checksum: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// 打开（必要时创建）元数据存储
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CheckpointError::file_system(format!("创建元数据目录失败: {}", e)))?;
        }

        let pool = Self::build_pool(db_path)?;

        let conn = pool.get()?;
        conn.execute_batch(METADATA_SCHEMA)
            .map_err(|e| CheckpointError::database(format!("初始化元数据表失败: {}", e)))?;
        drop(conn);

        log::info!("[MetadataStore] 元数据存储已就绪: {:?}", db_path);
        Ok(Self { pool })
    }

    fn build_pool(db_path: &Path) -> AnyResult<SqlitePool> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            c.pragma_update(None, "journal_mode", &"WAL")?;
            c.pragma_update(None, "synchronous", &"NORMAL")?;
            // busy_timeout 防止写锁等待无界：快速失败交给上层下个周期重试
            c.pragma_update(None, "busy_timeout", &3000i64)?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(Duration::from_secs(10))
            .build(manager)
            .with_context(|| format!("创建元数据连接池失败: {:?}", db_path))?;

        Ok(pool)
    }

    /// 按存储键读取元数据行
    pub fn get(&self, storage_key: &str) -> Result<Option<MetadataRow>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT storage_key, user_id, remote_ref, content_checksum, updated_at
                 FROM checkpoint_meta WHERE storage_key = ?1",
                params![storage_key],
                Self::map_row,
            )
            .optional()
            .map_err(|e| CheckpointError::database(format!("读取元数据失败: {}", e)))?;
        Ok(row)
    }

    /// 单行 upsert（首次上传/下载时创建，之后每次成功上传更新）
    pub fn upsert(&self, row: &MetadataRow) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO checkpoint_meta (storage_key, user_id, remote_ref, content_checksum, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(storage_key) DO UPDATE SET
                 user_id = excluded.user_id,
                 remote_ref = excluded.remote_ref,
                 content_checksum = excluded.content_checksum,
                 updated_at = excluded.updated_at",
            params![
                row.storage_key,
                row.user_id,
                row.remote_ref.as_ref().map(|r| r.0.as_str()),
                row.content_checksum,
                row.updated_at,
            ],
        )
        .map_err(|e| CheckpointError::database(format!("写入元数据失败: {}", e)))?;
        Ok(())
    }

    /// 登记用户归属（不触碰同步状态列）
    ///
    /// 全新空库在首次上传前就需要可归属：重启扫描依赖此行把目录
    /// 映射回用户 ID。
    pub fn register_user(&self, storage_key: &str, user_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO checkpoint_meta (storage_key, user_id, remote_ref, content_checksum, updated_at)
             VALUES (?1, ?2, NULL, NULL, ?3)
             ON CONFLICT(storage_key) DO UPDATE SET user_id = excluded.user_id",
            params![storage_key, user_id, Utc::now()],
        )
        .map_err(|e| CheckpointError::database(format!("登记用户归属失败: {}", e)))?;
        Ok(())
    }

    /// 清除远端引用与校验和（本地副本因损坏被清除时调用）
    ///
    /// 行不存在时为幂等 no-op。
    pub fn clear_sync_state(&self, storage_key: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE checkpoint_meta
             SET remote_ref = NULL, content_checksum = NULL, updated_at = ?2
             WHERE storage_key = ?1",
            params![storage_key, Utc::now()],
        )
        .map_err(|e| CheckpointError::database(format!("清除同步状态失败: {}", e)))?;
        Ok(())
    }

    /// 删除元数据行（用户存储被显式删除时调用）
    pub fn delete(&self, storage_key: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM checkpoint_meta WHERE storage_key = ?1",
            params![storage_key],
        )
        .map_err(|e| CheckpointError::database(format!("删除元数据失败: {}", e)))?;
        Ok(())
    }

    /// 全量读取（启动时归属重启幸存的本地文件）
    pub fn all_rows(&self) -> Result<Vec<MetadataRow>> {
        let conn = self.pool.get()?;
        let mut stmt = conn
            .prepare(
                "SELECT storage_key, user_id, remote_ref, content_checksum, updated_at
                 FROM checkpoint_meta",
            )
            .map_err(|e| CheckpointError::database(format!("读取元数据失败: {}", e)))?;

        let rows = stmt
            .query_map([], Self::map_row)
            .map_err(|e| CheckpointError::database(format!("读取元数据失败: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CheckpointError::database(format!("读取元数据失败: {}", e)))?;

        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> std::result::Result<MetadataRow, rusqlite::Error> {
        Ok(MetadataRow {
            storage_key: row.get(0)?,
            user_id: row.get(1)?,
            remote_ref: row.get::<_, Option<String>>(2)?.map(BlobRef),
            content_checksum: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}
