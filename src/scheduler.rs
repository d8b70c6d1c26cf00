//! 周期任务调度
//!
//! 两个独立的周期任务：空闲回收（粗周期）与上传扫描（细周期，
//! 启动偏移错开触发点）。二者共享一个「同步进行中」标志保证互不
//! 交叠——卡住的同步会让后续 tick 被跳过而非并发执行，这是在
//! 低频、按用户有界的工作量下接受的取舍。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CheckpointConfig;
use crate::connection::CheckpointManager;

/// 同步任务调度器
pub struct SyncScheduler {
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncScheduler {
    /// 启动两个周期任务；返回的调度器持有任务句柄，`shutdown` 终止
    pub fn start(manager: Arc<CheckpointManager>, config: &CheckpointConfig) -> Self {
        let running = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::with_capacity(2);

        // 空闲回收任务
        {
            let manager = Arc::clone(&manager);
            let running = Arc::clone(&running);
            let period = Duration::from_secs(config.eviction_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                // 首次 tick 立即返回，跳过（启动时无可回收对象）
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if !claim(&running) {
                        debug!("[SyncScheduler] 上一轮同步未结束，跳过本次空闲回收");
                        continue;
                    }
                    manager.run_idle_eviction().await;
                    release(&running);
                }
            }));
        }

        // 上传扫描任务（偏移启动，避开与空闲回收同刻触发）
        {
            let manager = Arc::clone(&manager);
            let running = Arc::clone(&running);
            let period = Duration::from_secs(config.upload_interval_secs);
            let offset = Duration::from_secs(config.upload_offset_secs);
            tasks.push(tokio::spawn(async move {
                let start = tokio::time::Instant::now() + offset;
                let mut interval = tokio::time::interval_at(start, period);
                loop {
                    interval.tick().await;
                    if !claim(&running) {
                        debug!("[SyncScheduler] 上一轮同步未结束，跳过本次上传扫描");
                        continue;
                    }
                    manager.run_upload_sweep().await;
                    release(&running);
                }
            }));
        }

        info!(
            "[SyncScheduler] 已启动：空闲回收每 {}s，上传扫描每 {}s（偏移 {}s）",
            config.eviction_interval_secs, config.upload_interval_secs, config.upload_offset_secs
        );

        Self { running, tasks }
    }

    /// 是否有同步任务正在执行
    pub fn is_busy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 终止周期任务（不等待进行中的一轮；进程退出前由引擎做收尾扫描）
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("[SyncScheduler] 周期任务已停止");
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn claim(running: &AtomicBool) -> bool {
    running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

fn release(running: &AtomicBool) {
    running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_release() {
        let flag = AtomicBool::new(false);
        assert!(claim(&flag));
        // 占用期间二次 claim 失败 → 两个任务不会交叠
        assert!(!claim(&flag));
        release(&flag);
        assert!(claim(&flag));
    }
}
