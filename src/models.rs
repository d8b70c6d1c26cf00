//! 结构化错误与共享数据模型
//!
//! 引擎内所有请求路径统一返回 [`CheckpointError`]，调度器路径
//! 捕获并记录日志而不中断整轮扫描。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误类别
///
/// 分类决定调用方的处理策略：`Remote` 为瞬态（网络/远端服务），
/// 调用方应重试；`Corruption` 驱动恢复状态机；`Validation` 为
/// 编程/不变量错误，快速失败，不重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointErrorType {
    Database,
    FileSystem,
    Remote,
    Corruption,
    Validation,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointError {
    pub error_type: CheckpointErrorType,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl CheckpointError {
    pub fn new(error_type: CheckpointErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error_type: CheckpointErrorType,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(CheckpointErrorType::Database, message)
    }

    pub fn file_system(message: impl Into<String>) -> Self {
        Self::new(CheckpointErrorType::FileSystem, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(CheckpointErrorType::Remote, message)
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(CheckpointErrorType::Corruption, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(CheckpointErrorType::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CheckpointErrorType::Internal, message)
    }

    /// 是否为损坏类错误（驱动恢复级联，而非直接上抛）
    pub fn is_corruption(&self) -> bool {
        self.error_type == CheckpointErrorType::Corruption
    }
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CheckpointError {}

// 实现从其他错误类型的转换
impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::file_system(format!("文件系统错误: {}", err))
    }
}

impl From<rusqlite::Error> for CheckpointError {
    fn from(err: rusqlite::Error) -> Self {
        CheckpointError::database(format!("SQLite 错误: {}", err))
    }
}

impl From<r2d2::Error> for CheckpointError {
    fn from(err: r2d2::Error) -> Self {
        CheckpointError::database(format!("连接池错误: {}", err))
    }
}

impl From<anyhow::Error> for CheckpointError {
    fn from(err: anyhow::Error) -> Self {
        CheckpointError::internal(err.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::validation(format!("JSON序列化错误: {}", err))
    }
}
