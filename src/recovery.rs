//! 损坏恢复管线
//!
//! 显式状态机：本地副本 → 远端副本 → 全新空库，单调推进、有界步数、
//! 绝不循环。每个分支结束后系统都处于「下一次操作必然成功」的状态。
//! 可用性优先于找回不可恢复的数据：本地与远端都损坏的用户丢失历史，
//! 但立即恢复服务。

use chrono::Utc;
use futures::FutureExt;
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

use crate::connection::{CheckpointConnection, CheckpointManager, SharedRecovery};
use crate::models::CheckpointError;
use crate::sync::remove_checkpoint_files;

type Result<T> = std::result::Result<T, CheckpointError>;

/// 状态机步数上限（最长路径 5 步，超出即不变量被破坏）
const RECOVERY_MAX_STEPS: usize = 8;

/// 恢复状态
///
/// 进入恢复时本地副本已被判定为可疑，状态机从 `ClearLocal` 起步。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// 清除本地损坏副本与缓存的同步状态
    ClearLocal,
    /// 强制重新下载远端副本
    Redownload,
    /// 校验新下载的远端副本
    ValidateRemote,
    /// 尽力删除损坏的远端 blob
    PurgeRemote,
    /// 建立全新空库
    CreateFresh,
    /// 终态：远端副本有效，恢复成功
    Recovered,
    /// 终态：以全新空库恢复服务（历史丢失）
    FreshCreated,
}

/// 恢复事件（每个非终态步骤的执行结果）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEvent {
    LocalCleared,
    RemoteFound,
    RemoteMissing,
    RemoteValid,
    RemoteInvalid,
    RemotePurged,
    FreshReady,
}

impl RecoveryState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryState::Recovered | RecoveryState::FreshCreated)
    }

    /// 状态转移表；非法组合返回 None
    pub fn advance(self, event: RecoveryEvent) -> Option<RecoveryState> {
        use RecoveryEvent::*;
        use RecoveryState::*;
        match (self, event) {
            (ClearLocal, LocalCleared) => Some(Redownload),
            (Redownload, RemoteFound) => Some(ValidateRemote),
            (Redownload, RemoteMissing) => Some(CreateFresh),
            // 下载层在落盘前就识别出损坏的远端内容
            (Redownload, RemoteInvalid) => Some(PurgeRemote),
            (ValidateRemote, RemoteValid) => Some(Recovered),
            (ValidateRemote, RemoteInvalid) => Some(PurgeRemote),
            (PurgeRemote, RemotePurged) => Some(CreateFresh),
            (CreateFresh, FreshReady) => Some(FreshCreated),
            _ => None,
        }
    }
}

impl CheckpointManager {
    /// 恢复入口（按用户合并在途恢复，并发调用共享同一结果）
    pub(crate) async fn recover(self: &Arc<Self>, user_id: &str) -> Result<Arc<CheckpointConnection>> {
        let (fut, created) = {
            let mut recoveries = self
                .recoveries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(existing) = recoveries.get(user_id) {
                (existing.clone(), false)
            } else {
                let manager = Arc::clone(self);
                let uid = user_id.to_string();
                let fut: SharedRecovery =
                    async move { manager.run_recovery(&uid).await }.boxed().shared();
                recoveries.insert(user_id.to_string(), fut.clone());
                (fut, true)
            }
        };

        let result = fut.await;

        if created {
            self.recoveries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(user_id);
        }

        result
    }

    /// 状态机驱动循环
    async fn run_recovery(&self, user_id: &str) -> Result<Arc<CheckpointConnection>> {
        let mut state = RecoveryState::ClearLocal;
        let mut steps = 0usize;
        let mut fresh_handle: Option<Arc<CheckpointConnection>> = None;

        while !state.is_terminal() {
            steps += 1;
            if steps > RECOVERY_MAX_STEPS {
                return Err(CheckpointError::internal(format!(
                    "恢复状态机超出步数上限（当前状态 {:?}）",
                    state
                )));
            }

            let event = match state {
                RecoveryState::ClearLocal => {
                    self.clear_local_artifacts(user_id)?;
                    RecoveryEvent::LocalCleared
                }
                RecoveryState::Redownload => match self.download_checkpoint(user_id).await {
                    Ok(Some(_)) => RecoveryEvent::RemoteFound,
                    // 远端无备份：新用户的预期状态，不是错误
                    Ok(None) => RecoveryEvent::RemoteMissing,
                    Err(e) if e.is_corruption() => RecoveryEvent::RemoteInvalid,
                    // 瞬态错误上抛，下一次 get_connection 从干净状态重试
                    Err(e) => return Err(e),
                },
                RecoveryState::ValidateRemote => {
                    let path = self.checkpoint_path(user_id);
                    if Self::integrity_check(&path) {
                        RecoveryEvent::RemoteValid
                    } else {
                        RecoveryEvent::RemoteInvalid
                    }
                }
                RecoveryState::PurgeRemote => {
                    self.purge_remote_blob(user_id).await;
                    self.clear_local_artifacts(user_id)?;
                    RecoveryEvent::RemotePurged
                }
                RecoveryState::CreateFresh => {
                    fresh_handle = Some(self.create_fresh_checkpoint(user_id)?);
                    RecoveryEvent::FreshReady
                }
                RecoveryState::Recovered | RecoveryState::FreshCreated => unreachable!(),
            };

            let next = state.advance(event).ok_or_else(|| {
                CheckpointError::internal(format!(
                    "非法恢复状态转移: {:?} + {:?}",
                    state, event
                ))
            })?;
            info!(
                "[Recovery] 用户 {}: {:?} --{:?}--> {:?}",
                user_id, state, event, next
            );
            state = next;
        }

        match state {
            RecoveryState::Recovered => {
                let path = self.checkpoint_path(user_id);
                info!("[Recovery] 用户 {} 已由远端副本恢复", user_id);
                Ok(Arc::new(CheckpointConnection::open(user_id, &path)?))
            }
            RecoveryState::FreshCreated => {
                info!(
                    "[Recovery] 用户 {} 以全新空库恢复服务（历史不可恢复）",
                    user_id
                );
                fresh_handle
                    .ok_or_else(|| CheckpointError::internal("FreshCreated 终态缺少句柄"))
            }
            _ => unreachable!(),
        }
    }

    /// 清除本地损坏副本：隔离改名主文件，删除 WAL/SHM 与 tmp 残件，
    /// 清空内存与持久化的远端引用/校验和
    fn clear_local_artifacts(&self, user_id: &str) -> Result<()> {
        // 先关掉可能存在的句柄再动文件
        drop(self.evict_connection(user_id));

        let path = self.checkpoint_path(user_id);
        if path.exists() {
            let quarantine = path.with_file_name(format!(
                "checkpoint.db.corrupt-{}",
                Utc::now().format("%Y%m%d%H%M%S")
            ));
            match fs::rename(&path, &quarantine) {
                Ok(_) => warn!(
                    "[Recovery] 用户 {} 的损坏检查点已隔离至 {:?}",
                    user_id, quarantine
                ),
                Err(e) => {
                    warn!(
                        "[Recovery] 隔离损坏检查点失败（改为直接删除）: {}",
                        e
                    );
                    fs::remove_file(&path).map_err(|e| {
                        CheckpointError::file_system(format!("删除损坏检查点失败: {}", e))
                    })?;
                }
            }
        }
        remove_checkpoint_files(&path)
            .map_err(|e| CheckpointError::file_system(format!("清理检查点伴生文件失败: {}", e)))?;

        // tmp 残件一并清理
        if let Some(dir) = path.parent() {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.filter_map(|e| e.ok()) {
                    if entry
                        .file_name()
                        .to_string_lossy()
                        .contains("checkpoint.db.tmp-")
                    {
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }

        self.local_files.remove(user_id);
        self.checksums.remove(user_id);
        self.remote_refs.remove(user_id);

        // 持久化状态同步清空：过期校验和绝不能掩盖恢复后的重传需求
        let storage_key = self.storage_key_for(user_id);
        self.metadata.clear_sync_state(&storage_key)?;

        Ok(())
    }

    /// 尽力删除损坏的远端 blob；任何失败只记日志，不阻塞恢复
    async fn purge_remote_blob(&self, user_id: &str) {
        let storage_key = self.storage_key_for(user_id);
        match self.remote.resolve_room(user_id).await {
            Ok(Some(room)) => match self.remote.delete_blob_by_key(&room, &storage_key).await {
                Ok(true) => info!("[Recovery] 用户 {} 的损坏远端副本已删除", user_id),
                Ok(false) => {}
                Err(e) => warn!(
                    "[Recovery] 删除用户 {} 的损坏远端副本失败（不阻塞恢复）: {}",
                    user_id, e
                ),
            },
            Ok(None) => {}
            Err(e) => warn!(
                "[Recovery] 解析用户 {} 的房间失败（不阻塞恢复）: {}",
                user_id, e
            ),
        }
    }
}
