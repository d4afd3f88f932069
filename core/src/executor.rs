use super::comments::CommentPools;
use super::dedup::DedupGuard;
use super::model::{AccountId, ActionPayload, ChatId, MessageId, PendingAction};
use super::platform::{ErrorClass, InvalidReason, PlatformClient, PlatformError};
use super::pool::AccountPool;
use common::truncate_text;
use std::sync::Arc;
use std::time::Duration;
use storage::Repository;
use tracing::{debug, error, info, warn};

pub use logging::RATE_LIMIT_TARGET;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Done,
    Skipped(String),
    RetryAfter(Duration),
    AccountRevoked(InvalidReason),
    Failed(String),
}

enum Performed {
    Sent(String),
    Skipped(String),
}

/// 在持有全局执行名额时完成一次平台调用
pub struct ActionExecutor {
    pool: Arc<AccountPool>,
    repo: Repository,
    comments: Arc<CommentPools>,
    views: DedupGuard<(AccountId, ChatId, MessageId)>,
    disconnect_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        pool: Arc<AccountPool>,
        repo: Repository,
        comments: Arc<CommentPools>,
        disconnect_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            repo,
            comments,
            views: DedupGuard::new(),
            disconnect_timeout,
        }
    }

    pub async fn execute(&self, action: &PendingAction) -> ActionOutcome {
        let Some(client) = self.pool.live(action.account).await else {
            warn!(
                "账号 {} 没有在线连接，丢弃 {} {}/{}",
                action.account, action.kind(), action.chat, action.message
            );
            return ActionOutcome::Skipped("账号不在线".to_string());
        };

        match self.perform(client.as_ref(), action).await {
            Ok(Performed::Sent(details)) => {
                info!(
                    "账号 {} 完成 {}: {}",
                    action.account,
                    action.kind(),
                    details
                );
                if let Err(e) = self
                    .repo
                    .insert_history(action.account, action.history_label(), &details)
                    .await
                {
                    error!("写入历史记录失败 账号={}: {:#}", action.account, e);
                }
                ActionOutcome::Done
            }
            Ok(Performed::Skipped(reason)) => {
                info!(
                    "跳过 {} 账号={} {}/{}: {}",
                    action.kind(),
                    action.account,
                    action.chat,
                    action.message,
                    reason
                );
                ActionOutcome::Skipped(reason)
            }
            Err(err) => self.handle_failure(action, err).await,
        }
    }

    async fn perform(
        &self,
        client: &dyn PlatformClient,
        action: &PendingAction,
    ) -> Result<Performed, PlatformError> {
        let (chat, message) = (action.chat, action.message);
        match &action.payload {
            ActionPayload::Reaction(emoji) => {
                client.send_reaction(chat, message, emoji).await?;
                Ok(Performed::Sent(format!("{} -> {}/{}", emoji, chat, message)))
            }
            ActionPayload::Comment(text) => {
                // 限流重排的评论已计过一次用量
                if !action.retried {
                    self.comments.record_usage(chat).await;
                }

                match client.fetch_message(chat, message).await? {
                    Some(target) if target.accepts_comments => {
                        client.send_comment(chat, message, text).await?;
                        Ok(Performed::Sent(format!(
                            "'{}' -> {}/{}",
                            truncate_text(text, 60),
                            chat,
                            message
                        )))
                    }
                    Some(_) => Ok(Performed::Skipped("消息未开启评论".to_string())),
                    None => Ok(Performed::Skipped("消息不存在".to_string())),
                }
            }
            ActionPayload::PollVote(options) => {
                client.send_vote(chat, message, options).await?;
                let labels: Vec<String> = options
                    .iter()
                    .map(|o| String::from_utf8_lossy(o).into_owned())
                    .collect();
                Ok(Performed::Sent(format!(
                    "[{}] -> {}/{}",
                    labels.join(","),
                    chat,
                    message
                )))
            }
            ActionPayload::View => {
                let key = (action.account, chat, message);
                if !self.views.mark_if_new(key) {
                    debug!("账号 {} 已浏览过 {}/{}", action.account, chat, message);
                    return Ok(Performed::Skipped("重复浏览".to_string()));
                }
                if let Err(e) = client.register_view(chat, message).await {
                    // 限流后会重新入队，需要允许再次浏览
                    if matches!(e, PlatformError::RateLimited(_)) {
                        self.views.forget(&key);
                    }
                    return Err(e);
                }
                Ok(Performed::Sent(format!("{}/{}", chat, message)))
            }
        }
    }

    async fn handle_failure(&self, action: &PendingAction, err: PlatformError) -> ActionOutcome {
        match err.classify() {
            ErrorClass::Retry(wait) => {
                warn!(
                    target: RATE_LIMIT_TARGET,
                    account = action.account,
                    wait_secs = wait.as_secs(),
                    "账号 {} 执行 {} 触发限流，等待 {}s",
                    action.account,
                    action.kind(),
                    wait.as_secs()
                );
                ActionOutcome::RetryAfter(wait)
            }
            ErrorClass::Revoke(reason) => {
                self.revoke(action.account, &reason).await;
                ActionOutcome::AccountRevoked(reason)
            }
            ErrorClass::Skip => {
                info!(
                    "目标不可用，丢弃 {} 账号={} {}/{}: {}",
                    action.kind(),
                    action.account,
                    action.chat,
                    action.message,
                    err
                );
                ActionOutcome::Skipped(err.to_string())
            }
            ErrorClass::Fail => {
                error!(
                    "{} 失败 账号={} {}/{}: {}",
                    action.kind(),
                    action.account,
                    action.chat,
                    action.message,
                    err
                );
                ActionOutcome::Failed(err.to_string())
            }
        }
    }

    /// 删除失效账号及其订阅，并断开连接
    pub async fn revoke(&self, account: AccountId, reason: &InvalidReason) {
        error!("账号 {} 已失效 ({})，删除账号及订阅", account, reason);
        if let Err(e) = self.repo.delete_account(account).await {
            error!("删除账号 {} 失败: {:#}", account, e);
        }
        self.pool.evict(account, self.disconnect_timeout).await;
    }

    pub fn clear(&self) {
        self.views.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionKind, IncomingMessage};
    use crate::testing::{MockCall, MockClient, StaticGenerator};
    use storage::Database;

    struct Fixture {
        executor: ActionExecutor,
        pool: Arc<AccountPool>,
        repo: Repository,
        client: Arc<MockClient>,
        comments: Arc<CommentPools>,
        account: AccountId,
    }

    async fn fixture() -> Fixture {
        let repo = Repository::new(Arc::new(Database::open_in_memory().await.unwrap()));
        repo.init_schema().await.unwrap();
        let account = repo.insert_account("a.session", None, None).await.unwrap();
        repo.add_subscription(account, 100, None, None).await.unwrap();

        let pool = Arc::new(AccountPool::new());
        let client = MockClient::new(account);
        pool.insert(client.clone()).await;

        let comments = Arc::new(CommentPools::new(
            repo.clone(),
            Arc::new(StaticGenerator::numbered("gen")),
            15,
            5,
            Duration::from_secs(30),
        ));
        let executor = ActionExecutor::new(
            pool.clone(),
            repo.clone(),
            comments.clone(),
            Duration::from_secs(10),
        );
        Fixture {
            executor,
            pool,
            repo,
            client,
            comments,
            account,
        }
    }

    fn action(account: AccountId, payload: ActionPayload) -> PendingAction {
        PendingAction::new(account, 100, 7, payload, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_reaction_writes_history() {
        let f = fixture().await;
        let outcome = f
            .executor
            .execute(&action(f.account, ActionPayload::Reaction("👍".into())))
            .await;
        assert_eq!(outcome, ActionOutcome::Done);
        assert_eq!(
            f.client.calls(),
            vec![MockCall::Reaction {
                chat: 100,
                message: 7,
                emoji: "👍".into()
            }]
        );
        let history = f.repo.history_for(f.account).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "auto_reaction");
    }

    #[tokio::test]
    async fn test_duplicate_view_calls_once() {
        let f = fixture().await;
        let view = action(f.account, ActionPayload::View);
        assert_eq!(f.executor.execute(&view).await, ActionOutcome::Done);
        assert!(matches!(
            f.executor.execute(&view).await,
            ActionOutcome::Skipped(_)
        ));
        assert_eq!(f.client.calls_of(ActionKind::View).len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_view_can_retry() {
        let f = fixture().await;
        f.client.fail_next(
            ActionKind::View,
            PlatformError::RateLimited(Duration::from_secs(3)),
        );
        let view = action(f.account, ActionPayload::View);
        assert_eq!(
            f.executor.execute(&view).await,
            ActionOutcome::RetryAfter(Duration::from_secs(3))
        );
        assert_eq!(f.executor.execute(&view).await, ActionOutcome::Done);
    }

    #[tokio::test]
    async fn test_comment_requires_open_comments() {
        let f = fixture().await;
        f.client.set_message(
            100,
            7,
            Some(IncomingMessage {
                chat: 100,
                id: 7,
                grouped_id: None,
                accepts_comments: false,
            }),
        );
        let outcome = f
            .executor
            .execute(&action(f.account, ActionPayload::Comment("nice".into())))
            .await;
        assert!(matches!(outcome, ActionOutcome::Skipped(_)));
        assert!(f.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_account_is_revoked() {
        let f = fixture().await;
        f.client.fail_next(
            ActionKind::Reaction,
            PlatformError::AccountInvalid(InvalidReason::Frozen),
        );
        let outcome = f
            .executor
            .execute(&action(f.account, ActionPayload::Reaction("👍".into())))
            .await;
        assert_eq!(outcome, ActionOutcome::AccountRevoked(InvalidReason::Frozen));
        assert!(f.pool.get(f.account).await.is_none());
        assert_eq!(f.client.disconnects(), 1);
        assert!(f.repo.account(f.account).await.unwrap().is_none());
        assert!(f.repo.subscribed_accounts(100).await.unwrap().is_empty());

        // 之后的动作因没有连接被丢弃
        let later = f
            .executor
            .execute(&action(f.account, ActionPayload::View))
            .await;
        assert!(matches!(later, ActionOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_generic_failure_is_dropped() {
        let f = fixture().await;
        f.client
            .fail_next(ActionKind::PollVote, PlatformError::Other("boom".into()));
        let outcome = f
            .executor
            .execute(&action(f.account, ActionPayload::PollVote(vec![b"1".to_vec()])))
            .await;
        assert_eq!(outcome, ActionOutcome::Failed("boom".into()));
        assert!(f.pool.get(f.account).await.is_some());
    }

    #[tokio::test]
    async fn test_retried_comment_counts_usage_once() {
        let f = fixture().await;
        f.client.fail_next(
            ActionKind::Comment,
            PlatformError::RateLimited(Duration::from_secs(5)),
        );
        let mut first = action(f.account, ActionPayload::Comment("hello".into()));
        assert_eq!(
            f.executor.execute(&first).await,
            ActionOutcome::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(f.comments.usage(100), 1);

        first.retried = true;
        assert_eq!(f.executor.execute(&first).await, ActionOutcome::Done);
        assert_eq!(f.comments.usage(100), 1);
        assert_eq!(f.client.calls_of(ActionKind::Comment).len(), 1);
    }
}
