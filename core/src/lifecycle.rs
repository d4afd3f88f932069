use super::comments::CommentPools;
use super::executor::ActionExecutor;
use super::model::{AccountId, ChatId, InboundEvent, MessageId};
use super::pacing::Pacer;
use super::platform::{ClientConnector, PlatformError, TextGenerator};
use super::pool::AccountPool;
use super::queue::{ActionQueues, QueueReceiver};
use super::resolver::choose_poll_options;
use super::scheduler::Scheduler;
use super::settings::EngineSettings;
use super::worker::{spawn_comment_worker, spawn_serial_worker, WorkerContext};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::{AccountRow, Repository};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// 单个账号的连接结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// session 文件不存在，账号已删除
    SessionMissing,
    /// 平台判定失效，账号已删除
    Revoked,
    /// 暂时失败（超时、网络），账号保留
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub connected: usize,
    pub removed: usize,
    pub skipped: usize,
    pub watched_chats: usize,
}

struct WorkerHandles {
    queues: Vec<JoinHandle<QueueReceiver>>,
    listener: JoinHandle<UnboundedReceiver<InboundEvent>>,
}

/// 调度引擎：持有账号池、队列、worker 与监听任务
pub struct Engine {
    settings: EngineSettings,
    repo: Repository,
    connector: Arc<dyn ClientConnector>,
    pool: Arc<AccountPool>,
    queues: Arc<ActionQueues>,
    pacer: Arc<Pacer>,
    executor: Arc<ActionExecutor>,
    scheduler: Arc<Scheduler>,
    state: Mutex<LifecycleState>,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    tracker: TaskTracker,
    cancel: Mutex<CancellationToken>,
    events_tx: UnboundedSender<InboundEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<InboundEvent>>>,
    workers: Mutex<Option<WorkerHandles>>,
    watched: Mutex<Vec<ChatId>>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        repo: Repository,
        connector: Arc<dyn ClientConnector>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        let pool = Arc::new(AccountPool::new());
        let queues = Arc::new(ActionQueues::new());
        let pacer = Arc::new(Pacer::new(settings.global_rate_limit));
        let comments = Arc::new(CommentPools::new(
            repo.clone(),
            generator,
            settings.comment_regen_count,
            settings.comment_usage_threshold,
            settings.generator_timeout,
        ));
        let executor = Arc::new(ActionExecutor::new(
            pool.clone(),
            repo.clone(),
            comments.clone(),
            settings.disconnect_timeout,
        ));
        let scheduler = Arc::new(Scheduler::new(
            settings.clone(),
            repo.clone(),
            pool.clone(),
            queues.clone(),
            comments,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            settings,
            repo,
            connector,
            pool,
            queues,
            pacer,
            executor,
            scheduler,
            state: Mutex::new(LifecycleState::Stopped),
            running: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            tracker: TaskTracker::new(),
            cancel: Mutex::new(CancellationToken::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            workers: Mutex::new(None),
            watched: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.lock().map(|s| *s).unwrap_or(LifecycleState::Stopped)
    }

    fn set_state(&self, state: LifecycleState) {
        if let Ok(mut slot) = self.state.lock() {
            *slot = state;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    pub fn queues(&self) -> &Arc<ActionQueues> {
        &self.queues
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// 供外部直接注入事件（例如测试或其他消息来源）
    pub fn event_sink(&self) -> UnboundedSender<InboundEvent> {
        self.events_tx.clone()
    }

    pub fn workers_running(&self) -> bool {
        self.workers.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    fn cancel_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn current_watched(&self) -> Vec<ChatId> {
        self.watched.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// 启动：清理订阅、连接账号、挂载监听、启动 worker
    ///
    /// 已在运行时直接返回
    pub async fn start(&self) -> Result<StartReport> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != LifecycleState::Stopped {
            info!("调度引擎已在运行，忽略重复启动");
            return Ok(StartReport::default());
        }
        self.set_state(LifecycleState::Starting);

        match self.start_inner().await {
            Ok(report) => {
                self.running.store(true, Ordering::Release);
                self.set_state(LifecycleState::Running);
                info!(
                    "调度引擎已启动: 在线账号={} 删除={} 跳过={} 监听聊天={}",
                    report.connected, report.removed, report.skipped, report.watched_chats
                );
                Ok(report)
            }
            Err(e) => {
                self.set_state(LifecycleState::Stopped);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<StartReport> {
        self.repo
            .remove_duplicate_subscriptions()
            .await
            .context("清理重复订阅失败")?;

        let chats = self.repo.watched_chats().await.context("读取监听聊天失败")?;
        if let Ok(mut watched) = self.watched.lock() {
            *watched = chats.clone();
        }

        let accounts = self.repo.active_accounts().await.context("读取账号失败")?;
        info!("准备连接 {} 个账号", accounts.len());

        let mut report = StartReport {
            watched_chats: chats.len(),
            ..StartReport::default()
        };
        for (idx, account) in accounts.iter().enumerate() {
            if idx > 0 && !self.settings.account_start_interval.is_zero() {
                tokio::time::sleep(self.settings.account_start_interval).await;
            }
            match self.connect_account(account).await {
                ConnectOutcome::Connected => report.connected += 1,
                ConnectOutcome::SessionMissing | ConnectOutcome::Revoked => report.removed += 1,
                ConnectOutcome::Skipped => report.skipped += 1,
            }
        }

        self.queues.set_closed(false);
        self.launch_workers();
        Ok(report)
    }

    /// 只在 worker 未运行时启动一次
    fn launch_workers(&self) {
        let Ok(mut slot) = self.workers.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let cancel = self.cancel_token();
        let ctx = Arc::new(WorkerContext {
            queues: self.queues.clone(),
            pacer: self.pacer.clone(),
            executor: self.executor.clone(),
            tracker: self.tracker.clone(),
            cancel: cancel.clone(),
        });

        let mut handles = Vec::with_capacity(4);
        for queue in [&self.queues.reaction, &self.queues.poll, &self.queues.view] {
            let rx = match queue.take_receiver() {
                Some(rx) => rx,
                None => {
                    queue.reopen();
                    match queue.take_receiver() {
                        Some(rx) => rx,
                        None => continue,
                    }
                }
            };
            handles.push(spawn_serial_worker(ctx.clone(), rx));
        }
        let comment_rx = match self.queues.comment.take_receiver() {
            Some(rx) => Some(rx),
            None => {
                self.queues.comment.reopen();
                self.queues.comment.take_receiver()
            }
        };
        if let Some(rx) = comment_rx {
            handles.push(spawn_comment_worker(ctx, rx));
        }

        let events_rx = self.events_rx.lock().ok().and_then(|mut rx| rx.take());
        let events_rx = match events_rx {
            Some(rx) => rx,
            None => {
                error!("事件接收端缺失，监听任务未启动");
                return;
            }
        };
        let listener = spawn_listener(
            self.scheduler.clone(),
            self.tracker.clone(),
            cancel,
            events_rx,
        );

        *slot = Some(WorkerHandles {
            queues: handles,
            listener,
        });
        info!("四个动作队列的 worker 与消息监听已启动");
    }

    /// 连接单个账号；缺少 session 或被判定失效的账号会被删除
    pub async fn connect_account(&self, account: &AccountRow) -> ConnectOutcome {
        if !Path::new(&account.session_path).exists() {
            warn!(
                "账号 {} 的 session 文件不存在，删除: {}",
                account.id, account.session_path
            );
            if let Err(e) = self.repo.delete_account(account.id).await {
                error!("删除账号 {} 失败: {:#}", account.id, e);
            }
            return ConnectOutcome::SessionMissing;
        }

        let attempt = tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(account, self.events_tx.clone()),
        )
        .await;

        let client = match attempt {
            Ok(Ok(client)) => client,
            Ok(Err(PlatformError::AccountInvalid(reason))) => {
                self.executor.revoke(account.id, &reason).await;
                return ConnectOutcome::Revoked;
            }
            Ok(Err(e)) => {
                warn!("账号 {} 连接失败，跳过: {}", account.id, e);
                return ConnectOutcome::Skipped;
            }
            Err(_) => {
                warn!(
                    "账号 {} 连接超时 ({}s)，跳过",
                    account.id,
                    self.settings.connect_timeout.as_secs()
                );
                return ConnectOutcome::Skipped;
            }
        };

        if !client.is_connected() {
            warn!("账号 {} 连接后不在线，跳过", account.id);
            return ConnectOutcome::Skipped;
        }

        let chats = self.current_watched();
        if let Err(e) = client.watch_chats(&chats).await {
            warn!("账号 {} 挂载监听失败: {}", account.id, e);
        }
        self.pool.insert(client).await;
        info!("账号 {} 已连接", account.id);
        ConnectOutcome::Connected
    }

    /// 运行中追加一个账号，不会重新启动 worker
    pub async fn add_account(&self, account_id: AccountId) -> Result<ConnectOutcome> {
        let account = self
            .repo
            .account(account_id)
            .await?
            .with_context(|| format!("账号 {} 不存在", account_id))?;
        Ok(self.connect_account(&account).await)
    }

    /// 重新读取监听聊天并推送到所有在线连接
    pub async fn refresh_watched_chats(&self) -> Result<usize> {
        let chats = self.repo.watched_chats().await?;
        let changed = {
            let mut watched = self
                .watched
                .lock()
                .map_err(|_| anyhow::anyhow!("监听列表锁已损坏"))?;
            let changed = *watched != chats;
            *watched = chats.clone();
            changed
        };

        if changed {
            for client in self.pool.all().await {
                if let Err(e) = client.watch_chats(&chats).await {
                    warn!("账号 {} 更新监听失败: {}", client.account(), e);
                }
            }
            info!("监听聊天已更新: {} 个", chats.len());
        }
        Ok(chats.len())
    }

    /// 操作者发起的投票
    pub async fn queue_poll_votes(
        &self,
        chat: ChatId,
        message: MessageId,
        options: Vec<Vec<u8>>,
        count: usize,
    ) -> Result<usize> {
        self.scheduler
            .queue_poll_votes(chat, message, options, count)
            .await
    }

    /// 操作者发起的浏览，只使用在线账号
    pub async fn queue_manual_views(
        &self,
        chat: ChatId,
        message: MessageId,
        count: usize,
    ) -> Result<usize> {
        self.scheduler.queue_manual_views(chat, message, count).await
    }

    /// 按操作者给出的选择（`random` 或 1 起始序号）投票
    pub async fn queue_poll_choice(
        &self,
        chat: ChatId,
        message: MessageId,
        choice: &str,
        options: &[Vec<u8>],
        multiple_choice: bool,
        count: usize,
    ) -> Result<usize> {
        let chosen = {
            let mut rng = StdRng::from_entropy();
            choose_poll_options(&mut rng, choice, options, multiple_choice)?
        };
        self.queue_poll_votes(chat, message, chosen, count).await
    }

    /// 优雅关闭：等待队列清空，取消 worker 与任务，断开全部账号并清空状态
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != LifecycleState::Running {
            return Ok(());
        }
        self.set_state(LifecycleState::Stopping);
        self.running.store(false, Ordering::Release);

        self.wait_queues_drained().await;
        self.queues.set_closed(true);

        let token = self.cancel_token();
        token.cancel();
        self.join_workers().await;

        self.tracker.close();
        if tokio::time::timeout(self.settings.shutdown_drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("等待后台任务结束超时，剩余 {} 个", self.tracker.len());
        }

        let disconnected = self.pool.disconnect_all(self.settings.disconnect_timeout).await;
        info!("已断开 {} 个账号", disconnected);

        self.scheduler.clear();
        self.executor.clear();

        self.tracker.reopen();
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = CancellationToken::new();
        }
        self.set_state(LifecycleState::Stopped);
        info!("调度引擎已停止");
        Ok(())
    }

    async fn wait_queues_drained(&self) {
        let deadline = tokio::time::Instant::now() + self.settings.shutdown_drain_timeout;
        let mut backoff = Duration::from_millis(100);
        loop {
            let remaining = self.queues.total_backlog();
            if remaining == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("等待队列清空超时，仍有 {} 个动作", remaining);
                return;
            }
            info!("等待队列清空: 剩余 {} 个动作", remaining);
            tokio::time::sleep(backoff).await;
            backoff = common::next_backoff(backoff, Duration::from_secs(1));
        }
    }

    async fn join_workers(&self) {
        let handles = self.workers.lock().ok().and_then(|mut slot| slot.take());
        let Some(handles) = handles else {
            return;
        };

        for handle in handles.queues {
            match handle.await {
                Ok(rx) => self.queues.for_kind(rx.kind()).restore_receiver(rx),
                Err(e) => error!("worker 异常退出: {}", e),
            }
        }
        match handles.listener.await {
            Ok(rx) => {
                if let Ok(mut slot) = self.events_rx.lock() {
                    *slot = Some(rx);
                }
            }
            Err(e) => error!("消息监听任务异常退出: {}", e),
        }
    }
}

/// 消息监听：每个事件在受跟踪的任务中处理
fn spawn_listener(
    scheduler: Arc<Scheduler>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    mut events: UnboundedReceiver<InboundEvent>,
) -> JoinHandle<UnboundedReceiver<InboundEvent>> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let scheduler = scheduler.clone();
            tracker.spawn(async move {
                scheduler.handle_event(event).await;
            });
        }
        events
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionKind, IncomingMessage};
    use crate::platform::InvalidReason;
    use crate::testing::{
        eventually, memory_repository, ConnectBehavior, MockConnector, StaticGenerator,
    };
    use tempfile::TempDir;

    const CHAT: ChatId = 700;

    struct Harness {
        engine: Engine,
        connector: Arc<MockConnector>,
        repo: Repository,
        dir: TempDir,
    }

    async fn harness() -> Harness {
        let repo = memory_repository().await.unwrap();
        repo.set_reaction_policy_raw(CHAT, "random;👍").await.unwrap();
        let connector = MockConnector::new();
        let settings = EngineSettings {
            view_accounts: (0, 0),
            ..EngineSettings::default()
        };
        let engine = Engine::new(
            settings,
            repo.clone(),
            connector.clone(),
            Arc::new(StaticGenerator::failing()),
        );
        Harness {
            engine,
            connector,
            repo,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    async fn add_account(h: &Harness, name: &str, with_session: bool) -> AccountId {
        let path = h.dir.path().join(format!("{}.session", name));
        if with_session {
            std::fs::write(&path, b"session").unwrap();
        }
        let id = h
            .repo
            .insert_account(&path.to_string_lossy(), None, None)
            .await
            .unwrap();
        h.repo.add_subscription(id, CHAT, None, None).await.unwrap();
        id
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_removes_invalid_accounts() {
        let h = harness().await;
        let good = add_account(&h, "good", true).await;
        let missing = add_account(&h, "missing", false).await;
        let banned = add_account(&h, "banned", true).await;
        let flaky = add_account(&h, "flaky", true).await;
        h.connector
            .set_behavior(banned, ConnectBehavior::Invalid(InvalidReason::BannedNumber));
        h.connector.set_behavior(flaky, ConnectBehavior::Fail);

        let report = h.engine.start().await.unwrap();
        assert_eq!(report.connected, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.watched_chats, 1);

        let remaining: Vec<_> = h
            .repo
            .active_accounts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(remaining, vec![good, flaky]);
        assert!(!remaining.contains(&missing));
        assert_eq!(h.engine.pool().connected_ids().await, vec![good]);
        assert_eq!(h.connector.client(good).unwrap().watched(), vec![CHAT]);

        h.engine.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_connect_is_skipped() {
        let h = harness().await;
        let stuck = add_account(&h, "stuck", true).await;
        h.connector.set_behavior(stuck, ConnectBehavior::Hang);

        let report = h.engine.start().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(h.repo.account(stuck).await.unwrap().is_some());
        assert!(h.engine.pool().is_empty().await);

        h.engine.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let h = harness().await;
        add_account(&h, "a", true).await;

        h.engine.start().await.unwrap();
        assert_eq!(h.engine.state(), LifecycleState::Running);
        assert!(h.engine.workers_running());

        let again = h.engine.start().await.unwrap();
        assert_eq!(again, StartReport::default());
        assert_eq!(h.connector.attempts(), 1);

        h.engine.stop().await.unwrap();
        assert_eq!(h.engine.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_queues_and_can_restart() {
        let h = harness().await;
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            ids.push(add_account(&h, name, true).await);
        }
        h.engine.start().await.unwrap();

        let queued = h
            .engine
            .queue_poll_votes(CHAT, 42, vec![vec![1]], 3)
            .await
            .unwrap();
        assert_eq!(queued, 3);

        h.engine.stop().await.unwrap();
        assert_eq!(h.engine.queues().total_backlog(), 0);
        assert!(h.engine.pool().is_empty().await);
        assert!(!h.engine.workers_running());

        let votes: usize = ids
            .iter()
            .map(|id| h.connector.client(*id).unwrap().calls_of(ActionKind::PollVote).len())
            .sum();
        assert_eq!(votes, 3);
        for id in &ids {
            assert_eq!(h.connector.client(*id).unwrap().disconnects(), 1);
        }

        h.engine.start().await.unwrap();
        assert_eq!(h.engine.state(), LifecycleState::Running);
        assert!(h.engine.workers_running());
        assert_eq!(h.engine.pool().connected_ids().await.len(), 3);
        h.engine.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_choice_validates_before_queueing() {
        let h = harness().await;
        add_account(&h, "a", true).await;
        h.engine.start().await.unwrap();

        let options = vec![vec![0], vec![1]];
        assert!(h
            .engine
            .queue_poll_choice(CHAT, 1, "3", &options, false, 1)
            .await
            .is_err());
        assert_eq!(h.engine.queues().total_backlog(), 0);

        let queued = h
            .engine
            .queue_poll_choice(CHAT, 1, "2", &options, false, 5)
            .await
            .unwrap();
        assert_eq!(queued, 1);

        h.engine.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_reach_scheduler() {
        let h = harness().await;
        let id = add_account(&h, "a", true).await;
        h.engine.start().await.unwrap();

        h.connector.emit(InboundEvent::NewMessage {
            via: id,
            message: IncomingMessage {
                chat: CHAT,
                id: 9,
                grouped_id: None,
                accepts_comments: false,
            },
        });
        let client = h.connector.client(id).unwrap();
        let target = &client;
        let reacted = eventually(Duration::from_secs(30), move || async move {
            target.calls_of(ActionKind::Reaction).len() == 1
        })
        .await;
        assert!(reacted);
        assert_eq!(h.engine.scheduler().processed_messages(), 1);

        h.engine.stop().await.unwrap();
        assert_eq!(h.engine.scheduler().processed_messages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_pushes_new_chats() {
        let h = harness().await;
        let id = add_account(&h, "a", true).await;
        h.engine.start().await.unwrap();

        h.repo.save_comment_pool(800, &["hi".to_string()]).await.unwrap();
        let count = h.engine.refresh_watched_chats().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(h.connector.client(id).unwrap().watched(), vec![CHAT, 800]);

        h.engine.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_account_at_runtime() {
        let h = harness().await;
        h.engine.start().await.unwrap();
        assert!(h.engine.pool().is_empty().await);

        let id = add_account(&h, "late", true).await;
        let outcome = h.engine.add_account(id).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Connected);
        assert!(h.engine.pool().is_connected(id).await);
        assert!(h.engine.add_account(9999).await.is_err());

        h.engine.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded_by_hanging_disconnect() {
        let h = harness().await;
        let ids = [add_account(&h, "a", true).await, add_account(&h, "b", true).await];
        h.engine.start().await.unwrap();
        for id in ids {
            h.connector.client(id).unwrap().set_disconnect_hangs(true);
        }

        let started = tokio::time::Instant::now();
        h.engine.stop().await.unwrap();
        let elapsed = started.elapsed();

        let limit = EngineSettings::default().disconnect_timeout;
        assert!(elapsed >= limit, "stop 过早返回: {:?}", elapsed);
        assert!(elapsed < limit * 2, "stop 耗时 {:?}", elapsed);
        assert_eq!(h.engine.state(), LifecycleState::Stopped);
        assert!(h.engine.pool().is_empty().await);
        for id in ids {
            assert_eq!(h.connector.client(id).unwrap().disconnects(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_connects_are_staggered() {
        let h = harness().await;
        for name in ["a", "b", "c"] {
            add_account(&h, name, true).await;
        }

        let started = tokio::time::Instant::now();
        let report = h.engine.start().await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.connected, 3);
        let interval = EngineSettings::default().account_start_interval;
        assert!(elapsed >= interval * 2, "启动间隔不足: {:?}", elapsed);

        h.engine.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_views_are_executed_and_recorded() {
        let h = harness().await;
        let online = add_account(&h, "online", true).await;
        let offline = add_account(&h, "offline", true).await;
        h.connector.set_behavior(offline, ConnectBehavior::Offline);
        h.engine.start().await.unwrap();

        let queued = h.engine.queue_manual_views(CHAT, 88, 5).await.unwrap();
        assert_eq!(queued, 1);

        // stop 会等队列清空并等 worker 写完历史
        h.engine.stop().await.unwrap();
        let client = h.connector.client(online).unwrap();
        assert_eq!(client.calls_of(ActionKind::View).len(), 1);
        let history = h.repo.history_for(online).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "manual_view");
        assert!(h.repo.history_for(offline).await.unwrap().is_empty());
    }
}
