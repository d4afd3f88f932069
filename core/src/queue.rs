use super::model::{ActionKind, PendingAction};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

/// 单一动作类型的无界队列
///
/// 接收端只能被一个 worker 取走；worker 退出时交还，之后可以再次启动。
pub struct ActionQueue {
    kind: ActionKind,
    sender: Mutex<UnboundedSender<PendingAction>>,
    receiver: Mutex<Option<UnboundedReceiver<PendingAction>>>,
    backlog: Arc<AtomicUsize>,
    closed: AtomicBool,
}

/// worker 持有的接收端，出队时同步扣减积压计数
pub struct QueueReceiver {
    kind: ActionKind,
    inner: UnboundedReceiver<PendingAction>,
    backlog: Arc<AtomicUsize>,
}

impl QueueReceiver {
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub async fn recv(&mut self) -> Option<PendingAction> {
        let action = self.inner.recv().await?;
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        Some(action)
    }
}

impl ActionQueue {
    pub fn new(kind: ActionKind) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            kind,
            sender: Mutex::new(sender),
            receiver: Mutex::new(Some(receiver)),
            backlog: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn push(&self, action: PendingAction) -> bool {
        if self.closed.load(Ordering::Acquire) {
            warn!("{} 队列已关闭，丢弃动作", self.kind);
            return false;
        }

        let sender = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.backlog.fetch_add(1, Ordering::AcqRel);
        if sender.send(action).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            warn!("{} 队列接收端已释放，丢弃动作", self.kind);
            return false;
        }
        true
    }

    /// 尚未被 worker 取走的动作数
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.backlog() == 0
    }

    pub fn take_receiver(&self) -> Option<QueueReceiver> {
        let mut slot = match self.receiver.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take().map(|inner| QueueReceiver {
            kind: self.kind,
            inner,
            backlog: self.backlog.clone(),
        })
    }

    pub fn restore_receiver(&self, receiver: QueueReceiver) {
        let mut slot = match self.receiver.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(receiver.inner);
    }

    /// 丢弃现有通道并新建一个，worker 异常退出后使用
    pub fn reopen(&self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut slot) = self.sender.lock() {
            *slot = sender;
        }
        if let Ok(mut slot) = self.receiver.lock() {
            *slot = Some(receiver);
        }
        self.backlog.store(0, Ordering::Release);
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }
}

/// 四个动作队列
pub struct ActionQueues {
    pub reaction: ActionQueue,
    pub comment: ActionQueue,
    pub poll: ActionQueue,
    pub view: ActionQueue,
}

impl Default for ActionQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionQueues {
    pub fn new() -> Self {
        Self {
            reaction: ActionQueue::new(ActionKind::Reaction),
            comment: ActionQueue::new(ActionKind::Comment),
            poll: ActionQueue::new(ActionKind::PollVote),
            view: ActionQueue::new(ActionKind::View),
        }
    }

    pub fn for_kind(&self, kind: ActionKind) -> &ActionQueue {
        match kind {
            ActionKind::Reaction => &self.reaction,
            ActionKind::Comment => &self.comment,
            ActionKind::PollVote => &self.poll,
            ActionKind::View => &self.view,
        }
    }

    /// 按动作类型路由入队
    pub fn push(&self, action: PendingAction) -> bool {
        self.for_kind(action.kind()).push(action)
    }

    pub fn total_backlog(&self) -> usize {
        ActionKind::ALL
            .iter()
            .map(|kind| self.for_kind(*kind).backlog())
            .sum()
    }

    pub fn set_closed(&self, closed: bool) {
        for kind in ActionKind::ALL {
            self.for_kind(kind).set_closed(closed);
        }
    }
}
