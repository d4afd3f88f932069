//! 内存中的平台连接与生成服务，供单元测试和集成测试使用

use super::model::{AccountId, ActionKind, ChatId, IncomingMessage, InboundEvent, MessageId};
use super::platform::{
    ClientConnector, EventSink, InvalidReason, PlatformClient, PlatformError, TextGenerator,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::AccountRow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Reaction {
        chat: ChatId,
        message: MessageId,
        emoji: String,
    },
    Comment {
        chat: ChatId,
        message: MessageId,
        text: String,
    },
    Vote {
        chat: ChatId,
        message: MessageId,
        options: Vec<Vec<u8>>,
    },
    View {
        chat: ChatId,
        message: MessageId,
    },
}

impl MockCall {
    pub fn kind(&self) -> ActionKind {
        match self {
            MockCall::Reaction { .. } => ActionKind::Reaction,
            MockCall::Comment { .. } => ActionKind::Comment,
            MockCall::Vote { .. } => ActionKind::PollVote,
            MockCall::View { .. } => ActionKind::View,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct MockClient {
    account: AccountId,
    connected: AtomicBool,
    calls: Mutex<Vec<MockCall>>,
    failures: Mutex<HashMap<ActionKind, VecDeque<PlatformError>>>,
    messages: Mutex<HashMap<(ChatId, MessageId), Option<IncomingMessage>>>,
    recent: Mutex<HashMap<ChatId, Vec<IncomingMessage>>>,
    recent_fails: AtomicBool,
    watched: Mutex<Vec<ChatId>>,
    disconnects: AtomicUsize,
    disconnect_hangs: AtomicBool,
}

impl MockClient {
    pub fn new(account: AccountId) -> Arc<Self> {
        Arc::new(Self {
            account,
            connected: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
            recent_fails: AtomicBool::new(false),
            watched: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            disconnect_hangs: AtomicBool::new(false),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// 下一次该类调用返回指定错误
    pub fn fail_next(&self, kind: ActionKind, err: PlatformError) {
        lock(&self.failures).entry(kind).or_default().push_back(err);
    }

    /// 设置 `fetch_message` 的返回值；未设置时视为可评论的消息
    pub fn set_message(&self, chat: ChatId, id: MessageId, message: Option<IncomingMessage>) {
        lock(&self.messages).insert((chat, id), message);
    }

    pub fn set_recent(&self, chat: ChatId, messages: Vec<IncomingMessage>) {
        lock(&self.recent).insert(chat, messages);
    }

    pub fn set_recent_fails(&self, fails: bool) {
        self.recent_fails.store(fails, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_of(&self, kind: ActionKind) -> Vec<MockCall> {
        self.calls().into_iter().filter(|c| c.kind() == kind).collect()
    }

    pub fn watched(&self) -> Vec<ChatId> {
        lock(&self.watched).clone()
    }

    /// 之后的 `disconnect` 调用永不返回
    pub fn set_disconnect_hangs(&self, hangs: bool) {
        self.disconnect_hangs.store(hangs, Ordering::SeqCst);
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn record(&self, call: MockCall) -> Result<(), PlatformError> {
        if !self.is_connected() {
            return Err(PlatformError::Disconnected);
        }
        let injected = lock(&self.failures)
            .get_mut(&call.kind())
            .and_then(|queue| queue.pop_front());
        if let Some(err) = injected {
            return Err(err);
        }
        lock(&self.calls).push(call);
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for MockClient {
    fn account(&self) -> AccountId {
        self.account
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), PlatformError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.disconnect_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn watch_chats(&self, chats: &[ChatId]) -> Result<(), PlatformError> {
        *lock(&self.watched) = chats.to_vec();
        Ok(())
    }

    async fn fetch_message(
        &self,
        chat: ChatId,
        id: MessageId,
    ) -> Result<Option<IncomingMessage>, PlatformError> {
        let stored = lock(&self.messages).get(&(chat, id)).cloned();
        Ok(stored.unwrap_or(Some(IncomingMessage {
            chat,
            id,
            grouped_id: None,
            accepts_comments: true,
        })))
    }

    async fn recent_messages(
        &self,
        chat: ChatId,
        limit: usize,
    ) -> Result<Vec<IncomingMessage>, PlatformError> {
        if self.recent_fails.load(Ordering::SeqCst) {
            return Err(PlatformError::Other("history unavailable".into()));
        }
        let mut messages = lock(&self.recent).get(&chat).cloned().unwrap_or_default();
        messages.truncate(limit);
        Ok(messages)
    }

    async fn send_reaction(
        &self,
        chat: ChatId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), PlatformError> {
        self.record(MockCall::Reaction {
            chat,
            message,
            emoji: emoji.to_string(),
        })
    }

    async fn send_comment(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
    ) -> Result<(), PlatformError> {
        self.record(MockCall::Comment {
            chat,
            message,
            text: text.to_string(),
        })
    }

    async fn send_vote(
        &self,
        chat: ChatId,
        message: MessageId,
        options: &[Vec<u8>],
    ) -> Result<(), PlatformError> {
        self.record(MockCall::Vote {
            chat,
            message,
            options: options.to_vec(),
        })
    }

    async fn register_view(&self, chat: ChatId, message: MessageId) -> Result<(), PlatformError> {
        self.record(MockCall::View { chat, message })
    }
}

#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    Connect,
    /// 连接返回，但 `is_connected` 为 false
    Offline,
    Invalid(InvalidReason),
    Fail,
    Hang,
}

/// 按账号 id 决定连接结果的连接器
#[derive(Default)]
pub struct MockConnector {
    behaviors: Mutex<HashMap<AccountId, ConnectBehavior>>,
    clients: Mutex<HashMap<AccountId, Arc<MockClient>>>,
    sinks: Mutex<Vec<EventSink>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_behavior(&self, account: AccountId, behavior: ConnectBehavior) {
        lock(&self.behaviors).insert(account, behavior);
    }

    pub fn client(&self, account: AccountId) -> Option<Arc<MockClient>> {
        lock(&self.clients).get(&account).cloned()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 通过最近一次连接的事件通道推送事件
    pub fn emit(&self, event: InboundEvent) -> bool {
        lock(&self.sinks)
            .last()
            .map(|sink| sink.send(event).is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ClientConnector for MockConnector {
    async fn connect(
        &self,
        account: &AccountRow,
        events: EventSink,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = lock(&self.behaviors)
            .get(&account.id)
            .cloned()
            .unwrap_or(ConnectBehavior::Connect);

        match behavior {
            ConnectBehavior::Invalid(reason) => return Err(PlatformError::AccountInvalid(reason)),
            ConnectBehavior::Fail => return Err(PlatformError::Other("network".into())),
            ConnectBehavior::Hang => std::future::pending::<()>().await,
            ConnectBehavior::Connect | ConnectBehavior::Offline => {}
        }

        let client = MockClient::new(account.id);
        if matches!(behavior, ConnectBehavior::Offline) {
            client.set_connected(false);
        }
        lock(&self.clients).insert(account.id, client.clone());
        lock(&self.sinks).push(events);
        Ok(client)
    }
}

/// 固定行为的评论生成服务
pub struct StaticGenerator {
    mode: GeneratorMode,
    calls: AtomicUsize,
}

enum GeneratorMode {
    Numbered(String),
    Failing,
    Stalled,
}

impl StaticGenerator {
    /// 生成 `prefix-0`、`prefix-1` ...
    pub fn numbered(prefix: &str) -> Self {
        Self {
            mode: GeneratorMode::Numbered(prefix.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            mode: GeneratorMode::Failing,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn stalled() -> Self {
        Self {
            mode: GeneratorMode::Stalled,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for StaticGenerator {
    async fn generate(&self, count: usize) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            GeneratorMode::Numbered(prefix) => {
                Ok((0..count).map(|i| format!("{}-{}", prefix, i)).collect())
            }
            GeneratorMode::Failing => anyhow::bail!("generator offline"),
            GeneratorMode::Stalled => {
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
        }
    }
}

/// 建好表的内存数据库
pub async fn memory_repository() -> anyhow::Result<storage::Repository> {
    let db = std::sync::Arc::new(storage::Database::open_in_memory().await?);
    let repo = storage::Repository::new(db);
    repo.init_schema().await?;
    Ok(repo)
}

/// 以 100ms 为步长推进时钟，直到 `ready` 返回 true；超过 `limit` 返回 false
///
/// 数据库调用在独立线程完成，暂停时钟下等待期间时间会跳到下一个定时器，
/// 断言异步结果前用它轮询，不要只睡一次。
pub async fn eventually<F, Fut>(limit: Duration, mut ready: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if ready().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
