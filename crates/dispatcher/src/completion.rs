//! 执行结果回写
//!
//! 执行池把每次执行的结果发到通道，这里逐条把完成指令写回存储。
//! 写入失败时按重试间隔重试，直到成功或调度器停止。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_domain::JobStore;
use scheduler_worker::{JobCompletion, ListenerManager};

pub(crate) struct CompletionProcessor {
    pub store: Arc<dyn JobStore>,
    pub listeners: Arc<ListenerManager>,
    pub completions: mpsc::UnboundedReceiver<JobCompletion>,
    pub jobs_executed: Arc<AtomicU64>,
    pub retry_interval: Duration,
    /// 取消后处理完通道中剩余的结果即退出
    pub drain: CancellationToken,
    /// 取消后放弃正在重试的写入
    pub abandon: CancellationToken,
}

impl CompletionProcessor {
    pub async fn run(mut self) {
        debug!("执行结果处理已启动");
        loop {
            let completion = tokio::select! {
                completion = self.completions.recv() => completion,
                _ = self.drain.cancelled() => break,
            };
            let Some(completion) = completion else {
                break;
            };
            self.apply(completion).await;
        }

        let mut drained = 0usize;
        while let Ok(completion) = self.completions.try_recv() {
            self.apply(completion).await;
            drained += 1;
        }
        info!(drained, "执行结果处理已停止");
    }

    async fn apply(&self, completion: JobCompletion) {
        if !completion.vetoed {
            self.jobs_executed.fetch_add(1, Ordering::Relaxed);
        }
        let mut attempts: u32 = 0;
        loop {
            match self
                .store
                .triggered_job_complete(&completion.trigger, &completion.job, completion.instruction)
                .await
            {
                Ok(applied) => {
                    if !applied {
                        debug!(
                            fire_instance_id = %completion.fire_instance_id,
                            "已触发记录不存在，完成指令被忽略"
                        );
                    }
                    return;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts == 1 || attempts % 4 == 0 {
                        error!(
                            trigger = %completion.trigger.key,
                            error = %e,
                            attempts,
                            "写回执行结果失败，稍后重试"
                        );
                        self.listeners
                            .notify_scheduler_error(&format!(
                                "写回触发器 {} 的执行结果失败: {e}",
                                completion.trigger.key
                            ))
                            .await;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_interval) => {}
                        _ = self.abandon.cancelled() => {
                            warn!(
                                fire_instance_id = %completion.fire_instance_id,
                                "调度器已停止，放弃写回执行结果"
                            );
                            return;
                        }
                    }
                }
            }
        }
    }
}
