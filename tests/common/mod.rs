//! 集成测试共享设施：内存版 RoomStore 模拟 + 引擎构造辅助

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_checkpoint::{
    BlobRef, CheckpointConfig, CheckpointManager, RemoteError, RoomRef, RoomStore,
};

/// 内存版远端存储，带调用计数与故障注入
#[derive(Default)]
pub struct MockRoomStore {
    /// storage_key -> 密文（引擎视角的明文 blob）
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// blob 引用 -> 内容
    blob_refs: Mutex<HashMap<String, Vec<u8>>>,
    /// storage_key -> 当前引用（删除时一并失效）
    key_refs: Mutex<HashMap<String, String>>,
    /// 无房间用户（resolve_room 返回 None）
    users_without_room: Mutex<HashSet<String>>,

    next_ref: AtomicUsize,
    fetch_count: AtomicUsize,
    upload_count: AtomicUsize,
    delete_count: AtomicUsize,

    fetch_delay_ms: AtomicUsize,
    fail_resolve: Mutex<Option<(RemoteError, usize)>>,
    fail_fetch: Mutex<Option<(RemoteError, usize)>>,
}

fn take_failure(slot: &Mutex<Option<(RemoteError, usize)>>) -> Option<RemoteError> {
    let mut guard = slot.lock().unwrap();
    match guard.take() {
        Some((err, n)) if n > 1 => {
            let out = err.clone();
            *guard = Some((err, n - 1));
            Some(out)
        }
        Some((err, _)) => Some(err),
        None => None,
    }
}

impl MockRoomStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_blob(&self, storage_key: &str, bytes: Vec<u8>) {
        self.blobs
            .lock()
            .unwrap()
            .insert(storage_key.to_string(), bytes);
    }

    pub fn blob(&self, storage_key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(storage_key).cloned()
    }

    pub fn remove_room(&self, user_id: &str) {
        self.users_without_room
            .lock()
            .unwrap()
            .insert(user_id.to_string());
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn fail_next_resolve(&self, err: RemoteError) {
        self.fail_resolve_times(err, 1);
    }

    pub fn fail_resolve_times(&self, err: RemoteError, times: usize) {
        *self.fail_resolve.lock().unwrap() = Some((err, times));
    }

    pub fn fail_next_fetch(&self, err: RemoteError) {
        *self.fail_fetch.lock().unwrap() = Some((err, 1));
    }

    pub fn fetches(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.upload_count.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.delete_count.load(Ordering::SeqCst)
    }

    async fn apply_fetch_delay(&self) {
        let ms = self.fetch_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }
    }
}

#[async_trait]
impl RoomStore for MockRoomStore {
    fn provider_name(&self) -> &'static str {
        "mock"
    }

    async fn resolve_room(&self, user_id: &str) -> Result<Option<RoomRef>, RemoteError> {
        if let Some(err) = take_failure(&self.fail_resolve) {
            return Err(err);
        }
        if self.users_without_room.lock().unwrap().contains(user_id) {
            return Ok(None);
        }
        Ok(Some(RoomRef(format!("!room-{}", user_id))))
    }

    async fn upload_blob(
        &self,
        _room: &RoomRef,
        storage_key: &str,
        data: &[u8],
    ) -> Result<BlobRef, RemoteError> {
        self.upload_count.fetch_add(1, Ordering::SeqCst);
        let ref_id = format!("$blob-{}", self.next_ref.fetch_add(1, Ordering::SeqCst));
        self.blobs
            .lock()
            .unwrap()
            .insert(storage_key.to_string(), data.to_vec());
        self.blob_refs
            .lock()
            .unwrap()
            .insert(ref_id.clone(), data.to_vec());
        self.key_refs
            .lock()
            .unwrap()
            .insert(storage_key.to_string(), ref_id.clone());
        Ok(BlobRef(ref_id))
    }

    async fn fetch_blob_by_key(
        &self,
        _room: &RoomRef,
        storage_key: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = take_failure(&self.fail_fetch) {
            return Err(err);
        }
        self.apply_fetch_delay().await;
        Ok(self.blobs.lock().unwrap().get(storage_key).cloned())
    }

    async fn fetch_blob_by_ref(&self, blob: &BlobRef) -> Result<Vec<u8>, RemoteError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = take_failure(&self.fail_fetch) {
            return Err(err);
        }
        self.apply_fetch_delay().await;
        self.blob_refs
            .lock()
            .unwrap()
            .get(&blob.0)
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    async fn delete_blob_by_key(
        &self,
        _room: &RoomRef,
        storage_key: &str,
    ) -> Result<bool, RemoteError> {
        self.delete_count.fetch_add(1, Ordering::SeqCst);
        let removed = self.blobs.lock().unwrap().remove(storage_key);
        if let Some(ref_id) = self.key_refs.lock().unwrap().remove(storage_key) {
            self.blob_refs.lock().unwrap().remove(&ref_id);
        }
        Ok(removed.is_some())
    }
}

pub const SERVICE_IDENTITY: &str = "svc-test";

/// 构造指向给定目录的管理器（空闲阈值设 0，便于直接驱动回收逻辑）
pub fn test_manager(store: &Arc<MockRoomStore>, dir: &Path) -> Arc<CheckpointManager> {
    let mut config = CheckpointConfig::new(dir, SERVICE_IDENTITY);
    config.idle_threshold_secs = 0;
    Arc::new(
        CheckpointManager::new(config, Arc::clone(store) as Arc<dyn RoomStore>)
            .expect("Failed to create manager"),
    )
}

pub fn storage_key_of(user_id: &str) -> String {
    agent_checkpoint::addressing::storage_key(SERVICE_IDENTITY, user_id)
}

/// 写入一条检查点记录
pub async fn write_marker(manager: &Arc<CheckpointManager>, user_id: &str, marker: &str) {
    let conn = manager
        .get_connection(user_id)
        .await
        .expect("get_connection failed");
    let pooled = conn.get().expect("pooled connection");
    pooled
        .execute(
            "INSERT OR REPLACE INTO checkpoint (id, session_id, seq, state_json)
             VALUES (?1, 'sess-1', 0, ?2)",
            rusqlite::params![format!("cp-{}", marker), marker],
        )
        .expect("insert checkpoint");
}

/// 读出全部检查点记录的 state_json
pub async fn read_markers(manager: &Arc<CheckpointManager>, user_id: &str) -> Vec<String> {
    let conn = manager
        .get_connection(user_id)
        .await
        .expect("get_connection failed");
    let pooled = conn.get().expect("pooled connection");
    let mut stmt = pooled
        .prepare("SELECT state_json FROM checkpoint ORDER BY id")
        .expect("prepare");
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("collect");
    rows
}

/// 带有效 SQLite 文件头但结构损坏的字节
pub fn corrupt_sqlite_bytes() -> Vec<u8> {
    let mut bytes = vec![0xABu8; 4096];
    bytes[..16].copy_from_slice(b"SQLite format 3\0");
    bytes
}
