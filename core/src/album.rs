use super::model::{IncomingMessage, MessageId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct AlbumGroupState {
    root: MessageId,
    first_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumVerdict {
    Root,
    NotRoot(MessageId),
}

/// 记录每个相册（grouped_id）当前的根消息
///
/// 有效期内根为已见过的最小消息 id；过期后下一条消息重新成为根。
pub struct AlbumTracker {
    groups: Mutex<HashMap<i64, AlbumGroupState>>,
    ttl: Duration,
}

impl AlbumTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, AlbumGroupState>> {
        match self.groups.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn observe(&self, group: i64, id: MessageId) -> AlbumVerdict {
        let now = Instant::now();
        let mut groups = self.lock();
        let ttl = self.ttl;
        groups.retain(|_, state| now.duration_since(state.first_seen) < ttl);

        match groups.get_mut(&group) {
            Some(state) if id < state.root => {
                debug!("相册根消息更新: group={} {} -> {}", group, state.root, id);
                state.root = id;
                state.first_seen = now;
                AlbumVerdict::Root
            }
            Some(state) if id == state.root => AlbumVerdict::Root,
            Some(state) => AlbumVerdict::NotRoot(state.root),
            None => {
                groups.insert(
                    group,
                    AlbumGroupState {
                        root: id,
                        first_seen: now,
                    },
                );
                AlbumVerdict::Root
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// 在最近消息窗口中确认 `id` 是否为相册最小 id；窗口中没有同组消息时视为确认
pub fn confirm_root(recent: &[IncomingMessage], group: i64, id: MessageId) -> bool {
    recent
        .iter()
        .filter(|m| m.grouped_id == Some(group))
        .map(|m| m.id)
        .min()
        .map_or(true, |first| first == id)
}

/// 相册事件中 id 最小的消息
pub fn album_root(messages: &[IncomingMessage]) -> Option<&IncomingMessage> {
    messages.iter().min_by_key(|m| m.id)
}
