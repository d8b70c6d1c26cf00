//! 引擎配置
//!
//! 支持文件（TOML）+ 环境变量分层加载，环境变量前缀 `CHECKPOINT`。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::CheckpointError;

type Result<T> = std::result::Result<T, CheckpointError>;

fn default_idle_threshold_secs() -> u64 {
    1800
}

fn default_eviction_interval_secs() -> u64 {
    3600
}

fn default_upload_interval_secs() -> u64 {
    600
}

fn default_upload_offset_secs() -> u64 {
    300
}

fn default_compression_level() -> i32 {
    0 // zstd 默认级别
}

/// 检查点同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    /// 检查点根目录（每个用户一个子目录）
    pub checkpoints_dir: PathBuf,

    /// 服务身份，参与存储键派生；变更会使所有已存 blob 不可寻址
    pub service_identity: String,

    /// 空闲阈值（秒）：连接/本地文件超过该时长未访问才可被回收
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,

    /// 空闲回收任务周期（秒）
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,

    /// 上传扫描任务周期（秒）
    #[serde(default = "default_upload_interval_secs")]
    pub upload_interval_secs: u64,

    /// 上传扫描首次启动偏移（秒），错开两个任务的触发点
    #[serde(default = "default_upload_offset_secs")]
    pub upload_offset_secs: u64,

    /// zstd 压缩级别（0 表示库默认）
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

impl CheckpointConfig {
    /// 以默认周期创建配置
    pub fn new(checkpoints_dir: impl Into<PathBuf>, service_identity: impl Into<String>) -> Self {
        Self {
            checkpoints_dir: checkpoints_dir.into(),
            service_identity: service_identity.into(),
            idle_threshold_secs: default_idle_threshold_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            upload_interval_secs: default_upload_interval_secs(),
            upload_offset_secs: default_upload_offset_secs(),
            compression_level: default_compression_level(),
        }
    }

    /// 分层加载：可选 TOML 文件 + `CHECKPOINT__*` 环境变量覆盖
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CHECKPOINT")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: Self = builder
            .build()
            .map_err(|e| CheckpointError::validation(format!("加载配置失败: {}", e)))?
            .try_deserialize()
            .map_err(|e| CheckpointError::validation(format!("解析配置失败: {}", e)))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// 验证配置是否完整
    pub fn validate(&self) -> Result<()> {
        if self.service_identity.trim().is_empty() {
            return Err(CheckpointError::validation("serviceIdentity 不能为空"));
        }
        if self.checkpoints_dir.as_os_str().is_empty() {
            return Err(CheckpointError::validation("checkpointsDir 不能为空"));
        }
        if self.eviction_interval_secs == 0 || self.upload_interval_secs == 0 {
            return Err(CheckpointError::validation("调度周期必须大于 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CheckpointConfig::new("/tmp/checkpoints", "svc-1");
        assert_eq!(cfg.idle_threshold_secs, 1800);
        assert_eq!(cfg.eviction_interval_secs, 3600);
        assert_eq!(cfg.upload_interval_secs, 600);
        assert_eq!(cfg.upload_offset_secs, 300);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut cfg = CheckpointConfig::new("/tmp/checkpoints", "");
        assert!(cfg.validate().is_err());

        cfg.service_identity = "svc".into();
        assert!(cfg.validate().is_ok());

        cfg.upload_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let cfg = CheckpointConfig::new("/data/checkpoints", "svc-1");
        let json = serde_json::to_string(&cfg).unwrap();
        // camelCase 字段名对外稳定
        assert!(json.contains("checkpointsDir"));
        assert!(json.contains("serviceIdentity"));
        let back: CheckpointConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.service_identity, cfg.service_identity);
    }
}
