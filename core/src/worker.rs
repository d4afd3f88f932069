use super::executor::{ActionExecutor, ActionOutcome};
use super::model::PendingAction;
use super::pacing::{CommentSpacer, Pacer};
use super::queue::{ActionQueues, QueueReceiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// worker 共享的调度状态
pub struct WorkerContext {
    pub queues: Arc<ActionQueues>,
    pub pacer: Arc<Pacer>,
    pub executor: Arc<ActionExecutor>,
    pub tracker: TaskTracker,
    pub cancel: CancellationToken,
}

impl WorkerContext {
    /// 获取名额后执行，并处理限流重排
    pub async fn run_one(&self, action: PendingAction) -> ActionOutcome {
        let Some(permit) = self.pacer.acquire().await else {
            warn!("执行名额已关闭，丢弃 {} 动作", action.kind());
            return ActionOutcome::Skipped("名额已关闭".to_string());
        };
        let outcome = self.executor.execute(&action).await;
        drop(permit);

        if let ActionOutcome::RetryAfter(wait) = &outcome {
            self.requeue_later(action, *wait);
        }
        outcome
    }

    /// 冷却后重新入队一次；已重排过的动作直接放弃
    fn requeue_later(&self, mut action: PendingAction, wait: Duration) {
        if action.retried {
            warn!(
                "账号 {} 的 {} 动作再次限流，放弃 {}/{}",
                action.account,
                action.kind(),
                action.chat,
                action.message
            );
            return;
        }
        action.retried = true;

        let queues = self.queues.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("关闭中，放弃限流重排: 账号={}", action.account);
                }
                _ = tokio::time::sleep(wait) => {
                    queues.push(action);
                }
            }
        });
    }
}

async fn next_action(ctx: &WorkerContext, rx: &mut QueueReceiver) -> Option<PendingAction> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => None,
        next = rx.recv() => next,
    }
}

/// 反应、投票、浏览队列的串行 worker：等待延迟，获取名额，执行
///
/// 退出时交还接收端
pub fn spawn_serial_worker(
    ctx: Arc<WorkerContext>,
    mut rx: QueueReceiver,
) -> JoinHandle<QueueReceiver> {
    tokio::spawn(async move {
        let kind = rx.kind();
        info!("{} worker 已启动", kind);

        // 已取出的动作总会执行完，取消只在两次动作之间生效
        while let Some(action) = next_action(&ctx, &mut rx).await {
            tokio::time::sleep(action.delay).await;
            ctx.run_one(action).await;
        }

        info!("{} worker 已停止", kind);
        rx
    })
}

/// 评论 worker：按消息排期，每条评论作为受跟踪的任务在排定时间发送
pub fn spawn_comment_worker(
    ctx: Arc<WorkerContext>,
    mut rx: QueueReceiver,
) -> JoinHandle<QueueReceiver> {
    tokio::spawn(async move {
        info!("comment worker 已启动");
        let mut spacer = CommentSpacer::new();

        while let Some(action) = next_action(&ctx, &mut rx).await {
            let now = Instant::now();
            spacer.prune(now);
            let start = spacer.schedule(action.key(), now, action.delay);
            info!(
                "评论已排期: 账号={} {}/{} {:.1}s 后发送",
                action.account,
                action.chat,
                action.message,
                start.duration_since(now).as_secs_f64()
            );

            let task_ctx = ctx.clone();
            ctx.tracker.spawn(async move {
                tokio::select! {
                    biased;
                    _ = task_ctx.cancel.cancelled() => {
                        debug!("评论任务已取消: 账号={} {}/{}", action.account, action.chat, action.message);
                    }
                    _ = tokio::time::sleep_until(start) => {
                        task_ctx.run_one(action).await;
                    }
                }
            });
        }

        info!("comment worker 已停止");
        rx
    })
}
