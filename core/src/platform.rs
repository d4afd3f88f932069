use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use storage::AccountRow;
use thiserror::Error;
use tokio::sync::mpsc;

use super::model::{AccountId, ChatId, IncomingMessage, InboundEvent, MessageId};

/// 账号被平台永久判定失效的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    Deactivated,
    DuplicatedKey,
    BannedNumber,
    Frozen,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvalidReason::Deactivated => "账号已停用",
            InvalidReason::DuplicatedKey => "授权密钥重复",
            InvalidReason::BannedNumber => "号码被封禁",
            InvalidReason::Frozen => "账号被冻结",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("触发限流，需等待 {}s", .0.as_secs())]
    RateLimited(Duration),
    #[error("账号失效: {0}")]
    AccountInvalid(InvalidReason),
    #[error("目标不可用: {0}")]
    TargetUnavailable(String),
    #[error("连接已断开")]
    Disconnected,
    #[error("{0}")]
    Other(String),
}

/// 执行器对失败的处理方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// 冷却后重新入队
    Retry(Duration),
    /// 删除账号并断开
    Revoke(InvalidReason),
    /// 目标状态不满足，静默丢弃
    Skip,
    /// 记录错误后丢弃
    Fail,
}

impl PlatformError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            PlatformError::RateLimited(wait) => ErrorClass::Retry(*wait),
            PlatformError::AccountInvalid(reason) => ErrorClass::Revoke(reason.clone()),
            PlatformError::TargetUnavailable(_) => ErrorClass::Skip,
            PlatformError::Disconnected | PlatformError::Other(_) => ErrorClass::Fail,
        }
    }
}

pub type EventSink = mpsc::UnboundedSender<InboundEvent>;

/// 单个已登录账号的连接
#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn account(&self) -> AccountId;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), PlatformError>;

    /// 替换监听的聊天集合
    async fn watch_chats(&self, chats: &[ChatId]) -> Result<(), PlatformError>;

    async fn fetch_message(
        &self,
        chat: ChatId,
        id: MessageId,
    ) -> Result<Option<IncomingMessage>, PlatformError>;

    /// 最近 `limit` 条消息，用于确认相册根
    async fn recent_messages(
        &self,
        chat: ChatId,
        limit: usize,
    ) -> Result<Vec<IncomingMessage>, PlatformError>;

    async fn send_reaction(
        &self,
        chat: ChatId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), PlatformError>;

    async fn send_comment(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
    ) -> Result<(), PlatformError>;

    async fn send_vote(
        &self,
        chat: ChatId,
        message: MessageId,
        options: &[Vec<u8>],
    ) -> Result<(), PlatformError>;

    async fn register_view(&self, chat: ChatId, message: MessageId) -> Result<(), PlatformError>;
}

/// 负责为账号建立连接，连接产生的新消息写入 `events`
#[async_trait]
pub trait ClientConnector: Send + Sync {
    async fn connect(
        &self,
        account: &AccountRow,
        events: EventSink,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError>;
}

/// 评论文本生成服务
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, count: usize) -> anyhow::Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            PlatformError::RateLimited(Duration::from_secs(7)).classify(),
            ErrorClass::Retry(Duration::from_secs(7))
        );
        assert_eq!(
            PlatformError::AccountInvalid(InvalidReason::Frozen).classify(),
            ErrorClass::Revoke(InvalidReason::Frozen)
        );
        assert_eq!(
            PlatformError::TargetUnavailable("评论已关闭".into()).classify(),
            ErrorClass::Skip
        );
        assert_eq!(PlatformError::Disconnected.classify(), ErrorClass::Fail);
    }

    #[test]
    fn test_error_display() {
        let err = PlatformError::RateLimited(Duration::from_secs(30));
        assert_eq!(err.to_string(), "触发限流，需等待 30s");
        let err = PlatformError::AccountInvalid(InvalidReason::BannedNumber);
        assert_eq!(err.to_string(), "账号失效: 号码被封禁");
    }
}
