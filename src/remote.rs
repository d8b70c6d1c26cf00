//! RoomStore trait 定义
//!
//! 提供统一的远端对象存储访问接口。blob 以「房间 + 存储键」寻址，
//! 加解密由具体实现根据房间配置透明完成，引擎两个方向都只处理明文。
//!
//! 错误分类是类型化契约：实现方必须用 [`RemoteError`] 的变体表达
//! 失败性质，引擎据 [`RemoteError::is_unrecoverable`] 决策，绝不
//! 对错误文本做模式匹配。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::CheckpointError;

/// 房间引用（由实现方解析得到的不透明标识）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomRef(pub String);

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// blob 引用（最近一次已知远端副本的不透明标识，可能因带外删除而失效）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef(pub String);

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 远端存储错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote service error: {0}")]
    Service(String),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("blob redacted")]
    Redacted,

    #[error("blob not found")]
    NotFound,
}

impl RemoteError {
    /// 不可恢复错误：远端不存在可用备份，可安全建空库继续。
    /// 瞬态错误（网络/远端服务）必须上抛——误判为不可恢复会在
    /// 下次上传时用空库覆盖完好的备份。
    pub fn is_unrecoverable(&self) -> bool {
        !matches!(self, RemoteError::Network(_) | RemoteError::Service(_))
    }
}

impl From<RemoteError> for CheckpointError {
    fn from(err: RemoteError) -> Self {
        CheckpointError::remote(format!("远端存储错误: {}", err))
    }
}

/// 统一的远端对象存储访问 trait
///
/// 由外部协作方实现（如 Matrix 房间存储、S3 兼容后端的适配层），
/// 引擎只依赖此边界。
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// 获取存储后端名称（用于日志和调试）
    fn provider_name(&self) -> &'static str;

    /// 解析用户的同步房间
    ///
    /// # Returns
    /// * `Ok(Some(room))` - 房间存在
    /// * `Ok(None)` - 用户尚无房间（首次使用的预期状态）
    async fn resolve_room(&self, user_id: &str) -> Result<Option<RoomRef>, RemoteError>;

    /// 上传 blob，返回新副本的引用
    ///
    /// 取代同键旧 blob 是调用方的责任（尽力删除后再上传），
    /// 实现方不做隐式覆盖承诺。
    async fn upload_blob(
        &self,
        room: &RoomRef,
        storage_key: &str,
        data: &[u8],
    ) -> Result<BlobRef, RemoteError>;

    /// 按存储键下载 blob
    ///
    /// # Returns
    /// * `Ok(Some(data))` - blob 存在，返回明文内容
    /// * `Ok(None)` - 该键下无 blob
    async fn fetch_blob_by_key(
        &self,
        room: &RoomRef,
        storage_key: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError>;

    /// 按引用下载 blob（引用失效时返回 [`RemoteError::NotFound`]）
    async fn fetch_blob_by_ref(&self, blob: &BlobRef) -> Result<Vec<u8>, RemoteError>;

    /// 按存储键删除 blob，返回是否确有删除
    async fn delete_blob_by_key(
        &self,
        room: &RoomRef,
        storage_key: &str,
    ) -> Result<bool, RemoteError>;
}
