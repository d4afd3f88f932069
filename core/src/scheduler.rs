use super::album::{album_root, confirm_root, AlbumTracker, AlbumVerdict};
use super::comments::CommentPools;
use super::dedup::DedupGuard;
use super::model::{
    AccountId, ActionFingerprint, ActionPayload, ChatId, InboundEvent,
    IncomingMessage, MessageId, MessageKey, PendingAction,
};
use super::policy::{ChatPolicy, ReactionPolicy};
use super::pool::AccountPool;
use super::queue::ActionQueues;
use super::resolver::{assign_comments, assign_reactions, sample_views, select_comment_accounts};
use super::settings::{EngineSettings, COMMENT_SPACING, POLL_DELAY, VIEW_DELAY};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use storage::Repository;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 一条消息产生的入队统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleReport {
    pub views: usize,
    pub reactions: usize,
    pub comments: usize,
}

impl ScheduleReport {
    pub fn total(&self) -> usize {
        self.views + self.reactions + self.comments
    }
}

/// 消息去重、相册根判断以及目标解析后入队
pub struct Scheduler {
    settings: EngineSettings,
    repo: Repository,
    pool: Arc<AccountPool>,
    queues: Arc<ActionQueues>,
    comments: Arc<CommentPools>,
    messages: DedupGuard<MessageKey>,
    actions: DedupGuard<ActionFingerprint>,
    albums: AlbumTracker,
    message_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        settings: EngineSettings,
        repo: Repository,
        pool: Arc<AccountPool>,
        queues: Arc<ActionQueues>,
        comments: Arc<CommentPools>,
    ) -> Self {
        let albums = AlbumTracker::new(settings.album_ttl);
        Self {
            settings,
            repo,
            pool,
            queues,
            comments,
            messages: DedupGuard::new(),
            actions: DedupGuard::new(),
            albums,
            message_lock: Mutex::new(()),
        }
    }

    pub async fn handle_event(&self, event: InboundEvent) -> ScheduleReport {
        match event {
            InboundEvent::NewMessage { via, message } => {
                self.handle_new_message(via, message).await
            }
            InboundEvent::Album {
                via,
                chat,
                messages,
            } => self.handle_album(via, chat, messages).await,
        }
    }

    pub async fn handle_new_message(
        &self,
        via: AccountId,
        message: IncomingMessage,
    ) -> ScheduleReport {
        {
            let _guard = self.message_lock.lock().await;
            if !self.messages.mark_if_new(message.key()) {
                debug!("消息已处理过，跳过: {}", message.key());
                return ScheduleReport::default();
            }
            info!("检测到新消息: chat={} id={}", message.chat, message.id);

            if let Some(group) = message.grouped_id {
                if !self.is_album_root(via, &message, group).await {
                    return ScheduleReport::default();
                }
            }
        }

        self.schedule_message(&message).await
    }

    /// 当前消息是否为相册根；二次确认失败时不丢弃
    async fn is_album_root(&self, via: AccountId, message: &IncomingMessage, group: i64) -> bool {
        if let AlbumVerdict::NotRoot(root) = self.albums.observe(group, message.id) {
            info!(
                "忽略相册中的非根消息: {}/{} (root={})",
                message.chat, message.id, root
            );
            return false;
        }

        let Some(client) = self.pool.live(via).await else {
            return true;
        };
        match client
            .recent_messages(message.chat, self.settings.album_scan_limit)
            .await
        {
            Ok(recent) => {
                if confirm_root(&recent, group, message.id) {
                    true
                } else {
                    info!(
                        "最近消息中存在更早的相册消息，忽略: {}/{}",
                        message.chat, message.id
                    );
                    false
                }
            }
            Err(e) => {
                warn!("相册二次确认失败，继续处理 {}/{}: {}", message.chat, message.id, e);
                true
            }
        }
    }

    pub async fn handle_album(
        &self,
        _via: AccountId,
        chat: ChatId,
        messages: Vec<IncomingMessage>,
    ) -> ScheduleReport {
        let root = {
            let _guard = self.message_lock.lock().await;
            let Some(root) = album_root(&messages).cloned() else {
                return ScheduleReport::default();
            };
            if let Some(group) = root.grouped_id {
                self.albums.observe(group, root.id);
            }
            if !self.messages.mark_if_new(root.key()) {
                debug!("相册根消息已处理过: {}", root.key());
                return ScheduleReport::default();
            }
            root
        };

        info!(
            "检测到相册: chat={} root={} 共 {} 条",
            chat,
            root.id,
            messages.len()
        );
        self.schedule_message(&root).await
    }

    async fn load_policy(&self, chat: ChatId) -> ChatPolicy {
        let row = match self.repo.chat_settings(chat).await {
            Ok(row) => row,
            Err(e) => {
                error!("读取聊天设置失败 chat={}: {:#}", chat, e);
                None
            }
        };
        let reaction = match self.repo.reaction_policy_raw(chat).await {
            Ok(Some(raw)) => match ReactionPolicy::parse(&raw) {
                Ok(policy) => Some(policy),
                Err(e) => {
                    warn!("聊天 {} 的反应配置无效: {}", chat, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!("读取反应配置失败 chat={}: {:#}", chat, e);
                None
            }
        };
        ChatPolicy::from_row(row.as_ref(), reaction, &self.settings)
    }

    fn enqueue(&self, action: PendingAction) -> bool {
        if !self.actions.mark_if_new(action.fingerprint()) {
            debug!(
                "重复动作，跳过: 账号={} {} {}/{}",
                action.account,
                action.kind(),
                action.chat,
                action.message
            );
            return false;
        }
        self.queues.push(action)
    }

    /// 为一条（根）消息安排浏览、反应和评论
    pub async fn schedule_message(&self, message: &IncomingMessage) -> ScheduleReport {
        let chat = message.chat;
        let subscribed = match self.repo.subscribed_accounts(chat).await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("读取订阅账号失败 chat={}: {:#}", chat, e);
                return ScheduleReport::default();
            }
        };
        info!("聊天 {} 共有 {} 个订阅账号", chat, subscribed.len());
        if subscribed.is_empty() {
            return ScheduleReport::default();
        }

        let policy = self.load_policy(chat).await;
        let connected = self.pool.connected_ids().await;
        let is_connected = |account: &AccountId| connected.binary_search(account).is_ok();
        let mut rng = StdRng::from_entropy();
        let mut report = ScheduleReport::default();

        for account in sample_views(&mut rng, &subscribed, policy.views) {
            if !is_connected(&account) {
                continue;
            }
            let delay = VIEW_DELAY.sample(&mut rng);
            let action = PendingAction::new(account, chat, message.id, ActionPayload::View, delay);
            if self.enqueue(action) {
                report.views += 1;
            }
        }

        if let Some(reaction) = &policy.reaction {
            let eligible: Vec<AccountId> =
                subscribed.iter().copied().filter(|a| is_connected(a)).collect();
            for (account, emoji) in assign_reactions(&mut rng, reaction, &eligible) {
                let delay = policy.reaction_delay.sample(&mut rng);
                let action = PendingAction::new(
                    account,
                    chat,
                    message.id,
                    ActionPayload::Reaction(emoji.clone()),
                    delay,
                );
                if self.enqueue(action) {
                    info!(
                        "反应已入队: '{}' {}/{} 账号={}",
                        emoji, chat, message.id, account
                    );
                    report.reactions += 1;
                }
            }
        }

        if message.accepts_comments {
            report.comments = self
                .schedule_comments(&mut rng, message, &subscribed, &connected, &policy)
                .await;
        }

        report
    }

    async fn schedule_comments(
        &self,
        rng: &mut StdRng,
        message: &IncomingMessage,
        subscribed: &[AccountId],
        connected: &[AccountId],
        policy: &ChatPolicy,
    ) -> usize {
        let chat = message.chat;
        match self.repo.comment_pool(chat).await {
            Ok(Some(_)) => {}
            Ok(None) => return 0,
            Err(e) => {
                error!("读取评论池失败 chat={}: {:#}", chat, e);
                return 0;
            }
        }

        let accounts = select_comment_accounts(rng, subscribed, policy.max_accounts);
        let batch = self
            .comments
            .next_batch(chat, self.settings.comment_batch)
            .await;
        let assigned = assign_comments(rng, &accounts, &batch, |text| {
            self.comments.is_used(chat, text)
        });
        info!(
            "准备为 {}/{} 安排 {} 条评论（选中 {} 个账号）",
            chat,
            message.id,
            assigned.len(),
            accounts.len()
        );

        let mut queued = 0;
        for (idx, account, text) in assigned {
            if connected.binary_search(&account).is_err() {
                warn!("账号 {} 不在线，跳过评论 {}/{}", account, chat, message.id);
                continue;
            }
            if !self.comments.mark_used(chat, &text) {
                continue;
            }

            let base = policy.comment_delay.sample(rng);
            let spacing = COMMENT_SPACING.sample(rng).mul_f64(idx as f64);
            let delay = base + spacing;
            let action = PendingAction::new(
                account,
                chat,
                message.id,
                ActionPayload::Comment(text.clone()),
                delay,
            );
            if self.enqueue(action) {
                info!(
                    "评论已入队: '{}' 账号={} {}/{} 延迟 {:.2}s",
                    text,
                    account,
                    chat,
                    message.id,
                    delay.as_secs_f64()
                );
                queued += 1;
            }
        }
        queued
    }

    /// 由操作者发起的投票：随机选取 `count` 个订阅账号投出相同选项
    pub async fn queue_poll_votes(
        &self,
        chat: ChatId,
        message: MessageId,
        options: Vec<Vec<u8>>,
        count: usize,
    ) -> anyhow::Result<usize> {
        let subscribed = self.repo.subscribed_accounts(chat).await?;
        let mut rng = StdRng::from_entropy();
        let picked: Vec<AccountId> = subscribed
            .choose_multiple(&mut rng, count.min(subscribed.len()))
            .copied()
            .collect();

        let mut queued = 0;
        for account in picked {
            let delay = POLL_DELAY.sample(&mut rng);
            let action = PendingAction::new(
                account,
                chat,
                message,
                ActionPayload::PollVote(options.clone()),
                delay,
            );
            if self.enqueue(action) {
                queued += 1;
            }
        }
        info!("已为 {}/{} 安排 {} 个投票", chat, message, queued);
        Ok(queued)
    }

    /// 由操作者发起的浏览：随机抽取 `count` 个订阅账号，只为在线的入队
    ///
    /// 与自动浏览共用队列、动作指纹和已浏览缓存，历史记为 `manual_view`。
    pub async fn queue_manual_views(
        &self,
        chat: ChatId,
        message: MessageId,
        count: usize,
    ) -> anyhow::Result<usize> {
        let subscribed = self.repo.subscribed_accounts(chat).await?;
        if subscribed.is_empty() {
            warn!("chat {} 没有订阅账号，无法手动浏览", chat);
            return Ok(0);
        }

        let mut rng = StdRng::from_entropy();
        let picked: Vec<AccountId> = subscribed
            .choose_multiple(&mut rng, count.min(subscribed.len()))
            .copied()
            .collect();

        let mut queued = 0;
        for &account in &picked {
            if !self.pool.is_connected(account).await {
                debug!("账号 {} 不在线，跳过手动浏览 {}/{}", account, chat, message);
                continue;
            }
            let delay = VIEW_DELAY.sample(&mut rng);
            let action =
                PendingAction::new(account, chat, message, ActionPayload::View, delay).manual();
            if self.enqueue(action) {
                queued += 1;
            }
        }
        info!(
            "已为 {}/{} 安排 {}/{} 个手动浏览",
            chat,
            message,
            queued,
            picked.len()
        );
        Ok(queued)
    }

    pub fn processed_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn was_scheduled(&self, fingerprint: &ActionFingerprint) -> bool {
        self.actions.contains(fingerprint)
    }

    /// 清空全部进程内状态
    pub fn clear(&self) {
        self.messages.clear();
        self.actions.clear();
        self.albums.clear();
        self.comments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionKind;
    use crate::testing::{memory_repository, MockClient, StaticGenerator};
    use std::collections::HashSet;
    use std::time::Duration;

    struct Fixture {
        scheduler: Scheduler,
        queues: Arc<ActionQueues>,
        pool: Arc<AccountPool>,
        repo: Repository,
        accounts: Vec<AccountId>,
    }

    const CHAT: ChatId = 500;

    async fn fixture(subscribed: usize, connected: usize) -> Fixture {
        let repo = memory_repository().await.unwrap();
        let pool = Arc::new(AccountPool::new());
        let mut accounts = Vec::new();
        for i in 0..subscribed {
            let id = repo
                .insert_account(&format!("{}.session", i), None, None)
                .await
                .unwrap();
            repo.add_subscription(id, CHAT, None, None).await.unwrap();
            if i < connected {
                pool.insert(MockClient::new(id)).await;
            }
            accounts.push(id);
        }

        let settings = EngineSettings {
            view_accounts: (0, 0),
            ..EngineSettings::default()
        };
        let queues = Arc::new(ActionQueues::new());
        let comments = Arc::new(CommentPools::new(
            repo.clone(),
            Arc::new(StaticGenerator::failing()),
            15,
            5,
            Duration::from_secs(30),
        ));
        let scheduler = Scheduler::new(
            settings,
            repo.clone(),
            pool.clone(),
            queues.clone(),
            comments,
        );
        Fixture {
            scheduler,
            queues,
            pool,
            repo,
            accounts,
        }
    }

    fn message(id: MessageId, group: Option<i64>, comments: bool) -> IncomingMessage {
        IncomingMessage {
            chat: CHAT,
            id,
            grouped_id: group,
            accepts_comments: comments,
        }
    }

    async fn drain(queues: &ActionQueues, kind: ActionKind) -> Vec<PendingAction> {
        let queue = queues.for_kind(kind);
        let mut rx = queue.take_receiver().unwrap();
        let mut out = Vec::new();
        while queue.backlog() > 0 {
            out.push(rx.recv().await.unwrap());
        }
        queue.restore_receiver(rx);
        out
    }

    #[tokio::test]
    async fn test_random_reactions_only_for_connected() {
        let f = fixture(10, 8).await;
        f.repo.set_reaction_policy_raw(CHAT, "mode=random;👍,❤️").await.unwrap();

        let report = f.scheduler.handle_new_message(f.accounts[0], message(1, None, false)).await;
        assert_eq!(report.reactions, 8);

        let actions = drain(&f.queues, ActionKind::Reaction).await;
        assert_eq!(actions.len(), 8);
        let fingerprints: HashSet<_> = actions.iter().map(|a| a.fingerprint()).collect();
        assert_eq!(fingerprints.len(), 8);
        for action in &actions {
            assert!(f.pool.is_connected(action.account).await);
            match &action.payload {
                ActionPayload::Reaction(e) => assert!(e == "👍" || e == "❤️"),
                other => panic!("unexpected payload {:?}", other),
            }
            assert!(action.delay >= Duration::from_secs_f64(1.3));
            assert!(action.delay <= Duration::from_secs_f64(3.1));
        }
    }

    #[tokio::test]
    async fn test_message_processed_once() {
        let f = fixture(3, 3).await;
        f.repo.set_reaction_policy_raw(CHAT, "👍").await.unwrap();

        let first = f.scheduler.handle_new_message(f.accounts[0], message(1, None, false)).await;
        let second = f.scheduler.handle_new_message(f.accounts[1], message(1, None, false)).await;
        assert_eq!(first.reactions, 3);
        assert_eq!(second, ScheduleReport::default());
        assert_eq!(f.scheduler.processed_messages(), 1);
    }

    #[tokio::test]
    async fn test_album_only_root_schedules() {
        let f = fixture(2, 2).await;
        f.repo.set_reaction_policy_raw(CHAT, "👍").await.unwrap();
        let via = f.accounts[0];
        let recent = vec![
            message(105, Some(77), false),
            message(103, Some(77), false),
            message(107, Some(77), false),
        ];
        let mock = MockClient::new(via);
        mock.set_recent(CHAT, recent);
        f.pool.insert(mock).await;

        let mut scheduled = Vec::new();
        for id in [105, 103, 107] {
            let report = f.scheduler.handle_new_message(via, message(id, Some(77), false)).await;
            if report.total() > 0 {
                scheduled.push(id);
            }
        }
        assert_eq!(scheduled, vec![103]);
    }

    #[tokio::test]
    async fn test_failed_album_scan_does_not_drop() {
        let f = fixture(1, 1).await;
        f.repo.set_reaction_policy_raw(CHAT, "👍").await.unwrap();
        let via = f.accounts[0];
        let mock = MockClient::new(via);
        mock.set_recent_fails(true);
        f.pool.insert(mock).await;

        let report = f.scheduler.handle_new_message(via, message(200, Some(1), false)).await;
        assert_eq!(report.reactions, 1);
    }

    #[tokio::test]
    async fn test_album_event_uses_min_id() {
        let f = fixture(2, 2).await;
        f.repo.set_reaction_policy_raw(CHAT, "👍").await.unwrap();
        let parts = vec![
            message(12, Some(5), false),
            message(10, Some(5), false),
            message(11, Some(5), false),
        ];
        let report = f.scheduler.handle_album(f.accounts[0], CHAT, parts).await;
        assert_eq!(report.reactions, 2);

        let actions = drain(&f.queues, ActionKind::Reaction).await;
        assert!(actions.iter().all(|a| a.message == 10));

        // 之后单独到达的根消息不会重复处理
        let again = f
            .scheduler
            .handle_new_message(f.accounts[0], message(10, Some(5), false))
            .await;
        assert_eq!(again.total(), 0);
    }

    #[tokio::test]
    async fn test_comments_skip_when_pool_too_small() {
        let f = fixture(3, 3).await;
        f.repo
            .save_comment_pool(CHAT, &["one".into(), "two".into()])
            .await
            .unwrap();

        let mut total = 0;
        let mut seen = HashSet::new();
        for id in 1..=4 {
            total += f
                .scheduler
                .handle_new_message(f.accounts[0], message(id, None, true))
                .await
                .comments;
        }
        for action in drain(&f.queues, ActionKind::Comment).await {
            if let ActionPayload::Comment(text) = action.payload {
                assert!(seen.insert(text));
            }
        }
        // 同一聊天内评论文本不重复，池中只有两条
        assert!(total <= 2);
        assert_eq!(seen.len(), total);
    }

    #[tokio::test]
    async fn test_comment_delays_grow_with_position() {
        let f = fixture(10, 10).await;
        let pool: Vec<String> = (0..60).map(|i| format!("c{}", i)).collect();
        f.repo.save_comment_pool(CHAT, &pool).await.unwrap();

        f.scheduler.handle_new_message(f.accounts[0], message(1, None, true)).await;
        let actions = drain(&f.queues, ActionKind::Comment).await;
        assert!(!actions.is_empty());
        for action in &actions {
            assert!(action.delay >= Duration::from_secs_f64(20.3));
        }
    }

    #[tokio::test]
    async fn test_no_comments_without_pool_or_when_closed() {
        let f = fixture(3, 3).await;
        let report = f.scheduler.handle_new_message(f.accounts[0], message(1, None, true)).await;
        assert_eq!(report.comments, 0);

        f.repo.save_comment_pool(CHAT, &["x".into()]).await.unwrap();
        let report = f.scheduler.handle_new_message(f.accounts[0], message(2, None, false)).await;
        assert_eq!(report.comments, 0);
    }

    #[tokio::test]
    async fn test_views_respect_range() {
        let mut f = fixture(12, 12).await;
        f.scheduler.settings.view_accounts = (8, 10);
        let report = f.scheduler.handle_new_message(f.accounts[0], message(1, None, false)).await;
        assert!((8..=10).contains(&report.views));
        for action in drain(&f.queues, ActionKind::View).await {
            assert!(action.delay >= Duration::from_millis(500));
            assert!(action.delay <= Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_poll_votes_sample_subscribers() {
        let f = fixture(6, 6).await;
        let queued = f
            .scheduler
            .queue_poll_votes(CHAT, 9, vec![b"1".to_vec()], 4)
            .await
            .unwrap();
        assert_eq!(queued, 4);
        let again = f
            .scheduler
            .queue_poll_votes(CHAT, 9, vec![b"1".to_vec()], 6)
            .await
            .unwrap();
        // 已投过的账号不会重复入队
        assert_eq!(again, 2);
        assert_eq!(f.queues.poll.backlog(), 6);
    }

    #[tokio::test]
    async fn test_manual_views_only_for_connected_accounts() {
        let f = fixture(5, 3).await;
        let queued = f.scheduler.queue_manual_views(CHAT, 40, 5).await.unwrap();
        assert_eq!(queued, 3);

        let views = drain(&f.queues, ActionKind::View).await;
        let accounts: HashSet<_> = views.iter().map(|a| a.account).collect();
        let connected: HashSet<_> = f.accounts[..3].iter().copied().collect();
        assert_eq!(accounts, connected);
        assert!(views.iter().all(|a| a.manual && a.message == 40));
        assert!(views.iter().all(|a| a.history_label() == "manual_view"));
        assert!(views.iter().all(|a| {
            let secs = a.delay.as_secs_f64();
            secs >= VIEW_DELAY.min && secs <= VIEW_DELAY.max
        }));

        // 同一账号对同一消息只入队一次
        let again = f.scheduler.queue_manual_views(CHAT, 40, 5).await.unwrap();
        assert_eq!(again, 0);
        assert_eq!(f.scheduler.queue_manual_views(CHAT + 1, 40, 5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_manual_views_sample_requested_count() {
        let f = fixture(6, 6).await;
        assert_eq!(f.scheduler.queue_manual_views(CHAT, 41, 2).await.unwrap(), 2);
        assert_eq!(f.queues.view.backlog(), 2);
        assert_eq!(f.scheduler.queue_manual_views(CHAT, 42, 0).await.unwrap(), 0);
    }
}
