//! 检查点连接管理器
//!
//! 负责每用户数据库句柄的生命周期：惰性打开、完整性校验、缓存，
//! 以及引用计数式的「使用中」标记——空闲回收绝不能在请求中途
//! 关闭句柄。进程内只应构造一个 [`CheckpointManager`] 实例，由
//! 所有调用方共享（见 [`crate::CheckpointEngine`]）。

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::addressing;
use crate::config::CheckpointConfig;
use crate::metadata::MetadataStore;
use crate::models::CheckpointError;
use crate::remote::{BlobRef, RoomStore};

type Result<T> = std::result::Result<T, CheckpointError>;

pub type SqlitePool = Pool<SqliteConnectionManager>;
pub type PooledSqlite = PooledConnection<SqliteConnectionManager>;

pub(crate) type SharedDownload = Shared<BoxFuture<'static, Result<Option<PathBuf>>>>;
pub(crate) type SharedRecovery = Shared<BoxFuture<'static, Result<Arc<CheckpointConnection>>>>;

/// 检查点文件名（每用户目录下）
pub(crate) const CHECKPOINT_FILE: &str = "checkpoint.db";

/// 检查点内部表结构（幂等 DDL，代理层在其上读写）
const CHECKPOINT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoint (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL DEFAULT 0,
    state_json TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_checkpoint_session ON checkpoint(session_id, seq);

CREATE TABLE IF NOT EXISTS checkpoint_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);
"#;

/// 安全地获取 Mutex 锁，在中毒时恢复锁并返回 guard
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "[CheckpointManager] Mutex poisoned! Attempting recovery for type: {:?}",
                std::any::type_name::<T>()
            );
            poisoned.into_inner()
        }
    }
}

/// 单个用户检查点数据库的句柄
///
/// 内部是小连接池；「关闭句柄」= 将其从缓存移除并 drop。
#[derive(Debug)]
pub struct CheckpointConnection {
    user_id: String,
    db_path: PathBuf,
    pool: SqlitePool,
}

impl CheckpointConnection {
    pub(crate) fn open(user_id: &str, db_path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            c.execute_batch(
                "PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; \
                 PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 3000;",
            )?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(Duration::from_secs(10))
            .build(manager)
            .map_err(|e| {
                CheckpointError::database(format!("创建检查点连接池失败 {:?}: {}", db_path, e))
            })?;

        Ok(Self {
            user_id: user_id.to_string(),
            db_path: db_path.to_path_buf(),
            pool,
        })
    }

    /// 获取数据库连接
    pub fn get(&self) -> Result<PooledSqlite> {
        self.pool
            .get()
            .map_err(|e| CheckpointError::database(format!("从连接池获取连接失败: {}", e)))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 关闭前做 WAL checkpoint，保证主文件自包含（整文件上传的前提）
    pub(crate) fn checkpoint_wal(&self) {
        if let Ok(conn) = self.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

struct ConnectionEntry {
    conn: Arc<CheckpointConnection>,
    last_accessed: Instant,
}

pub(crate) struct LocalFileEntry {
    pub path: PathBuf,
    pub last_accessed: Instant,
}

/// 进程级检查点管理器（连接缓存 + 活跃计数 + 同步状态缓存的唯一持有者）
pub struct CheckpointManager {
    pub(crate) config: CheckpointConfig,
    pub(crate) remote: Arc<dyn RoomStore>,
    pub(crate) metadata: MetadataStore,

    connections: RwLock<HashMap<String, ConnectionEntry>>,
    active: Mutex<HashMap<String, u32>>,

    /// 已知本地文件缓存（上传扫描的迭代对象，启动时种子化）
    pub(crate) local_files: DashMap<String, LocalFileEntry>,
    /// 最近上传校验和缓存（仅在元数据落盘后更新）
    pub(crate) checksums: DashMap<String, String>,
    /// 最近已知远端 blob 引用缓存
    pub(crate) remote_refs: DashMap<String, BlobRef>,

    pub(crate) downloads: Mutex<HashMap<String, SharedDownload>>,
    pub(crate) recoveries: Mutex<HashMap<String, SharedRecovery>>,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig, remote: Arc<dyn RoomStore>) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.checkpoints_dir)
            .map_err(|e| CheckpointError::file_system(format!("创建检查点根目录失败: {}", e)))?;

        let metadata = MetadataStore::open(&config.checkpoints_dir.join("sync_meta.db"))?;

        Ok(Self {
            config,
            remote,
            metadata,
            connections: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            local_files: DashMap::new(),
            checksums: DashMap::new(),
            remote_refs: DashMap::new(),
            downloads: Mutex::new(HashMap::new()),
            recoveries: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // 路径与键
    // ------------------------------------------------------------------

    pub(crate) fn storage_key_for(&self, user_id: &str) -> String {
        addressing::storage_key(&self.config.service_identity, user_id)
    }

    pub(crate) fn user_dir(&self, user_id: &str) -> PathBuf {
        let key = self.storage_key_for(user_id);
        self.config
            .checkpoints_dir
            .join(addressing::sanitize_user_dir(user_id, &key))
    }

    pub(crate) fn checkpoint_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join(CHECKPOINT_FILE)
    }

    // ------------------------------------------------------------------
    // 活跃计数
    // ------------------------------------------------------------------

    /// 标记用户进入一段不可被回收打断的工作
    ///
    /// 支持嵌套：请求标记后派生的后台任务可再次标记。计数器（而非
    /// 布尔值）是正确性机制——后台延续可能比发起它的请求活得久。
    pub fn mark_active(&self, user_id: &str) {
        let mut active = safe_lock(&self.active);
        *active.entry(user_id.to_string()).or_insert(0) += 1;
    }

    /// 取消一次活跃标记；多余的取消被容忍（计数不降为负）
    pub fn mark_inactive(&self, user_id: &str) {
        let mut active = safe_lock(&self.active);
        match active.get_mut(user_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                active.remove(user_id);
            }
            None => {
                warn!("[CheckpointManager] 用户 {} 的 mark_inactive 无匹配的 mark_active", user_id);
            }
        }
    }

    pub fn active_count(&self, user_id: &str) -> u32 {
        safe_lock(&self.active).get(user_id).copied().unwrap_or(0)
    }

    /// RAII 形式的活跃标记，drop 时保证释放
    pub fn activate(self: &Arc<Self>, user_id: &str) -> ActiveGuard {
        self.mark_active(user_id);
        ActiveGuard {
            manager: Arc::clone(self),
            user_id: user_id.to_string(),
        }
    }

    // ------------------------------------------------------------------
    // 连接生命周期
    // ------------------------------------------------------------------

    /// 获取（惰性打开）用户的检查点数据库句柄
    ///
    /// 调用方拿到的句柄一定通过了完整性校验；本地副本缺失时先走
    /// 下载路径，校验失败时走恢复级联。
    pub async fn get_connection(self: &Arc<Self>, user_id: &str) -> Result<Arc<CheckpointConnection>> {
        if user_id.trim().is_empty() {
            return Err(CheckpointError::validation("user_id 不能为空"));
        }

        // 1. 确保本地副本存在且新鲜（幂等，按用户合并在途下载）
        self.ensure_local(user_id).await?;

        // 2. 缓存命中：刷新访问时间直接返回
        if let Some(conn) = self.touch_cached(user_id) {
            return Ok(conn);
        }

        // 3. 打开并校验；失败则交给恢复管线
        let db_path = self.checkpoint_path(user_id);
        let conn = if db_path.exists() {
            if Self::integrity_check(&db_path) {
                Arc::new(CheckpointConnection::open(user_id, &db_path)?)
            } else {
                warn!(
                    "[CheckpointManager] 用户 {} 的检查点未通过完整性校验，进入恢复管线",
                    user_id
                );
                self.recover(user_id).await?
            }
        } else {
            self.create_fresh_checkpoint(user_id)?
        };

        // 4. 幂等 DDL；失败时 conn 随错误返回路径被 drop，不泄漏句柄
        Self::ensure_schema(&conn)?;

        // 5. 写入缓存。并发打开竞争时保留先入者，维持单句柄不变量
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = connections.get_mut(user_id) {
            existing.last_accessed = Instant::now();
            return Ok(Arc::clone(&existing.conn));
        }
        connections.insert(
            user_id.to_string(),
            ConnectionEntry {
                conn: Arc::clone(&conn),
                last_accessed: Instant::now(),
            },
        );

        Ok(conn)
    }

    fn touch_cached(&self, user_id: &str) -> Option<Arc<CheckpointConnection>> {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        connections.get_mut(user_id).map(|entry| {
            entry.last_accessed = Instant::now();
            Arc::clone(&entry.conn)
        })
    }

    /// 缓存中是否存在该用户的句柄
    pub fn has_cached_connection(&self, user_id: &str) -> bool {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(user_id)
    }

    /// 从缓存移除并返回句柄（drop 即关闭）
    pub(crate) fn evict_connection(&self, user_id: &str) -> Option<Arc<CheckpointConnection>> {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        connections.remove(user_id).map(|entry| entry.conn)
    }

    /// 空闲回收候选：未激活且超过空闲阈值的缓存连接
    pub(crate) fn idle_connection_users(&self, threshold: Duration) -> Vec<String> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        connections
            .iter()
            .filter(|(user_id, entry)| {
                self.active_count(user_id) == 0 && entry.last_accessed.elapsed() > threshold
            })
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }

    /// 新建空检查点数据库并注册到本地文件缓存，让下一轮上传扫描拾取
    pub(crate) fn create_fresh_checkpoint(&self, user_id: &str) -> Result<Arc<CheckpointConnection>> {
        let dir = self.user_dir(user_id);
        fs::create_dir_all(&dir)
            .map_err(|e| CheckpointError::file_system(format!("创建用户目录失败 {:?}: {}", dir, e)))?;

        let db_path = self.checkpoint_path(user_id);
        let conn = Arc::new(CheckpointConnection::open(user_id, &db_path)?);
        Self::ensure_schema(&conn)?;

        // 首次上传前就建立归属：重启扫描靠元数据行把目录映射回用户
        self.metadata
            .register_user(&self.storage_key_for(user_id), user_id)?;

        self.local_files.insert(
            user_id.to_string(),
            LocalFileEntry {
                path: db_path,
                last_accessed: Instant::now(),
            },
        );

        debug!("[CheckpointManager] 已为用户 {} 创建空检查点数据库", user_id);
        Ok(conn)
    }

    pub(crate) fn ensure_schema(conn: &CheckpointConnection) -> Result<()> {
        conn.get()?
            .execute_batch(CHECKPOINT_SCHEMA)
            .map_err(|e| CheckpointError::database(format!("初始化检查点表失败: {}", e)))
    }

    /// 完整性校验（只读打开，避免对可疑文件产生写入）
    pub(crate) fn integrity_check(path: &Path) -> bool {
        match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => match conn.query_row("PRAGMA integrity_check;", [], |r| {
                r.get::<_, String>(0)
            }) {
                Ok(val) => val.to_lowercase() == "ok",
                Err(e) => {
                    warn!("[CheckpointManager] 完整性校验执行失败 {:?}: {}", path, e);
                    false
                }
            },
            Err(e) => {
                warn!("[CheckpointManager] 无法打开 {:?} 进行校验: {}", path, e);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // 用户存储删除（终态之一）
    // ------------------------------------------------------------------

    /// 删除用户的全部检查点数据：本地文件、缓存、元数据行，并尽力
    /// 删除远端 blob
    pub async fn delete_user_storage(&self, user_id: &str) -> Result<()> {
        if self.active_count(user_id) > 0 {
            warn!(
                "[CheckpointManager] 删除用户 {} 存储时其仍处于活跃状态",
                user_id
            );
        }

        // 先关句柄再删文件
        drop(self.evict_connection(user_id));
        self.local_files.remove(user_id);
        self.checksums.remove(user_id);
        self.remote_refs.remove(user_id);

        let dir = self.user_dir(user_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| CheckpointError::file_system(format!("删除用户目录失败 {:?}: {}", dir, e)))?;
        }

        let storage_key = self.storage_key_for(user_id);
        match self.remote.resolve_room(user_id).await {
            Ok(Some(room)) => {
                if let Err(e) = self.remote.delete_blob_by_key(&room, &storage_key).await {
                    warn!("[CheckpointManager] 删除远端 blob 失败（忽略）: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("[CheckpointManager] 解析房间失败（忽略）: {}", e),
        }

        self.metadata.delete(&storage_key)?;
        tracing::info!("[CheckpointManager] 用户 {} 的检查点存储已删除", user_id);
        Ok(())
    }
}

/// 活跃标记的 RAII guard
pub struct ActiveGuard {
    manager: Arc<CheckpointManager>,
    user_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.manager.mark_inactive(&self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CheckpointErrorType;
    use crate::remote::{RemoteError, RoomRef};

    type RemoteResult<T> = std::result::Result<T, RemoteError>;

    struct NullStore;

    #[async_trait::async_trait]
    impl RoomStore for NullStore {
        fn provider_name(&self) -> &'static str {
            "null"
        }

        async fn resolve_room(&self, _user_id: &str) -> RemoteResult<Option<RoomRef>> {
            Ok(None)
        }

        async fn upload_blob(
            &self,
            _room: &RoomRef,
            _storage_key: &str,
            _data: &[u8],
        ) -> RemoteResult<BlobRef> {
            Err(RemoteError::Service("null store".into()))
        }

        async fn fetch_blob_by_key(
            &self,
            _room: &RoomRef,
            _storage_key: &str,
        ) -> RemoteResult<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn fetch_blob_by_ref(&self, _blob: &BlobRef) -> RemoteResult<Vec<u8>> {
            Err(RemoteError::NotFound)
        }

        async fn delete_blob_by_key(
            &self,
            _room: &RoomRef,
            _storage_key: &str,
        ) -> RemoteResult<bool> {
            Ok(false)
        }
    }

    fn test_manager() -> (Arc<CheckpointManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckpointConfig::new(dir.path(), "svc-unit");
        let manager = CheckpointManager::new(config, Arc::new(NullStore)).unwrap();
        (Arc::new(manager), dir)
    }

    #[test]
    fn test_active_counter_nesting_and_floor() {
        let (manager, _dir) = test_manager();

        manager.mark_active("u");
        manager.mark_active("u");
        assert_eq!(manager.active_count("u"), 2);

        manager.mark_inactive("u");
        assert_eq!(manager.active_count("u"), 1);
        manager.mark_inactive("u");
        assert_eq!(manager.active_count("u"), 0);

        // 不配对的取消被容忍，计数不降为负
        manager.mark_inactive("u");
        assert_eq!(manager.active_count("u"), 0);
    }

    #[test]
    fn test_active_guard_releases_on_drop() {
        let (manager, _dir) = test_manager();

        {
            let _outer = manager.activate("u");
            let _inner = manager.activate("u");
            assert_eq!(manager.active_count("u"), 2);
        }
        assert_eq!(manager.active_count("u"), 0);
    }

    #[test]
    fn test_checkpoint_paths_deterministic() {
        let (manager, _dir) = test_manager();

        assert_eq!(
            manager.checkpoint_path("@alice:example.org"),
            manager.checkpoint_path("@alice:example.org")
        );
        assert_ne!(
            manager.checkpoint_path("@alice:example.org"),
            manager.checkpoint_path("@bob:example.org")
        );
        assert_eq!(
            manager.storage_key_for("@alice:example.org").len(),
            64
        );
    }

    #[tokio::test]
    async fn test_empty_user_id_fails_fast() {
        let (manager, _dir) = test_manager();
        let err = manager.get_connection("  ").await.unwrap_err();
        assert_eq!(err.error_type, CheckpointErrorType::Validation);
    }

    #[test]
    fn test_integrity_check_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();

        // 不存在的文件
        assert!(!CheckpointManager::integrity_check(&dir.path().join("missing.db")));

        // 文件头正确但结构损坏
        let garbage = dir.path().join("garbage.db");
        let mut bytes = vec![0xEEu8; 4096];
        bytes[..16].copy_from_slice(b"SQLite format 3\0");
        fs::write(&garbage, &bytes).unwrap();
        assert!(!CheckpointManager::integrity_check(&garbage));
    }

    #[test]
    fn test_integrity_check_accepts_valid_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valid.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
                .unwrap();
        }
        assert!(CheckpointManager::integrity_check(&path));
    }
}

