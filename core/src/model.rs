use std::fmt;
use std::time::Duration;

pub type AccountId = i64;
pub type ChatId = i64;
pub type MessageId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Reaction,
    Comment,
    PollVote,
    View,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Reaction,
        ActionKind::Comment,
        ActionKind::PollVote,
        ActionKind::View,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Reaction => "reaction",
            ActionKind::Comment => "comment",
            ActionKind::PollVote => "poll",
            ActionKind::View => "view",
        }
    }

    /// 历史记录里使用的动作标签
    pub fn history_label(&self) -> &'static str {
        match self {
            ActionKind::Reaction => "auto_reaction",
            ActionKind::Comment => "auto_comment",
            ActionKind::PollVote => "auto_poll",
            ActionKind::View => "auto_view",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPayload {
    Reaction(String),
    Comment(String),
    /// 投票选项的原始字节
    PollVote(Vec<Vec<u8>>),
    View,
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Reaction(_) => ActionKind::Reaction,
            ActionPayload::Comment(_) => ActionKind::Comment,
            ActionPayload::PollVote(_) => ActionKind::PollVote,
            ActionPayload::View => ActionKind::View,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub chat: ChatId,
    pub message: MessageId,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat, self.message)
    }
}

/// 单账号单动作的去重指纹
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionFingerprint {
    pub account: AccountId,
    pub chat: ChatId,
    pub message: MessageId,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub account: AccountId,
    pub chat: ChatId,
    pub message: MessageId,
    pub payload: ActionPayload,
    pub delay: Duration,
    /// 已因限流重新入队过一次
    pub retried: bool,
    /// 由操作者手动发起
    pub manual: bool,
}

impl PendingAction {
    pub fn new(
        account: AccountId,
        chat: ChatId,
        message: MessageId,
        payload: ActionPayload,
        delay: Duration,
    ) -> Self {
        Self {
            account,
            chat,
            message,
            payload,
            delay,
            retried: false,
            manual: false,
        }
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    /// 写入历史记录的标签；手动浏览单独记为 `manual_view`
    pub fn history_label(&self) -> &'static str {
        match (self.manual, self.kind()) {
            (true, ActionKind::View) => "manual_view",
            (_, kind) => kind.history_label(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            chat: self.chat,
            message: self.message,
        }
    }

    pub fn fingerprint(&self) -> ActionFingerprint {
        ActionFingerprint {
            account: self.account,
            chat: self.chat,
            message: self.message,
            kind: self.kind(),
        }
    }
}

/// 平台推送或拉取到的消息摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat: ChatId,
    pub id: MessageId,
    pub grouped_id: Option<i64>,
    pub accepts_comments: bool,
}

impl IncomingMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            chat: self.chat,
            message: self.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    NewMessage {
        via: AccountId,
        message: IncomingMessage,
    },
    /// 同一相册的全部消息一次性送达
    Album {
        via: AccountId,
        chat: ChatId,
        messages: Vec<IncomingMessage>,
    },
}
