//! agent-checkpoint - 对话代理检查点数据库的云同步引擎
//!
//! 每个用户一份本地 SQLite 检查点数据库（低延迟读写路径），与
//! 按房间寻址的远端加密对象存储保持持久同步（容灾后备）。核心
//! 职责：连接生命周期与引用计数、下载/上传合并、损坏检测与级联
//! 恢复、校验和门控、压缩、原子落盘、周期回收与上传调度。
//!
//! 典型用法：
//! ```ignore
//! let config = CheckpointConfig::new("/data/checkpoints", "svc-identity");
//! let mut engine = CheckpointEngine::new(config, remote_store)?;
//! engine.init()?;
//! let manager = engine.manager();
//! let _guard = manager.activate(user_id);
//! let conn = manager.get_connection(user_id).await?;
//! // ... 在 conn 上读写检查点 ...
//! ```

pub mod addressing;
pub mod config;
pub mod connection;
pub mod metadata;
pub mod models;
pub mod recovery;
pub mod remote;
pub mod scheduler;
pub mod sync;

use std::sync::Arc;
use tracing::info;

pub use config::CheckpointConfig;
pub use connection::{ActiveGuard, CheckpointConnection, CheckpointManager};
pub use metadata::{MetadataRow, MetadataStore};
pub use models::{CheckpointError, CheckpointErrorType};
pub use recovery::{RecoveryEvent, RecoveryState};
pub use remote::{BlobRef, RemoteError, RoomRef, RoomStore};
pub use scheduler::SyncScheduler;
pub use sync::UploadOutcome;

type Result<T> = std::result::Result<T, CheckpointError>;

/// 进程级同步引擎
///
/// 进程启动时构造一次，通过 [`CheckpointEngine::manager`] 把管理器
/// 句柄传给所有调用方；不使用全局可变静态。
pub struct CheckpointEngine {
    manager: Arc<CheckpointManager>,
    scheduler: Option<SyncScheduler>,
}

impl CheckpointEngine {
    pub fn new(config: CheckpointConfig, remote: Arc<dyn RoomStore>) -> Result<Self> {
        let manager = Arc::new(CheckpointManager::new(config, remote)?);
        Ok(Self {
            manager,
            scheduler: None,
        })
    }

    /// 启动：种子化本地文件缓存，然后拉起周期任务
    pub fn init(&mut self) -> Result<()> {
        self.manager.seed_local_files()?;
        self.scheduler = Some(SyncScheduler::start(
            Arc::clone(&self.manager),
            self.manager.config(),
        ));
        info!("[CheckpointEngine] 引擎已启动");
        Ok(())
    }

    pub fn manager(&self) -> &Arc<CheckpointManager> {
        &self.manager
    }

    /// 停机：停止周期任务，做一轮收尾上传扫描
    pub async fn shutdown(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        self.manager.run_upload_sweep().await;
        info!("[CheckpointEngine] 引擎已停机");
    }
}

/// 初始化 tracing 订阅器（供可执行程序与测试使用；重复调用安全）
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
