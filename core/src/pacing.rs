use super::model::MessageKey;
use super::settings::SLOT_JITTER;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// 全局并发闸门，四类动作共享
pub struct Pacer {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl Pacer {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 获取一个执行名额，拿到后再随机停顿 0.1-0.3s
    ///
    /// 信号量被关闭时返回 `None`
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        let jitter = SLOT_JITTER.sample(&mut rand::thread_rng());
        tokio::time::sleep(jitter).await;
        Some(permit)
    }
}

/// 同一条消息下评论的排期
///
/// 每次排期 `start = max(now + delay, tail)`，随后 `tail = start + delay`，
/// 保证同一消息的评论按入队顺序、至少间隔各自的延迟。
#[derive(Debug, Default)]
pub struct CommentSpacer {
    tails: HashMap<MessageKey, Instant>,
}

impl CommentSpacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: MessageKey, now: Instant, delay: Duration) -> Instant {
        let earliest = now + delay;
        let start = match self.tails.get(&key) {
            Some(tail) if *tail > earliest => *tail,
            _ => earliest,
        };
        self.tails.insert(key, start + delay);
        start
    }

    /// 丢弃已过期的排期，避免长期运行时无限增长
    pub fn prune(&mut self, now: Instant) {
        self.tails.retain(|_, tail| *tail > now);
    }

    pub fn len(&self) -> usize {
        self.tails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_comment_spacing_is_monotonic() {
        let mut spacer = CommentSpacer::new();
        let key = MessageKey {
            chat: 1,
            message: 10,
        };
        let spacing = Duration::from_secs(5);
        let now = Instant::now();

        let starts: Vec<_> = (0..3).map(|_| spacer.schedule(key, now, spacing)).collect();
        for pair in starts.windows(2) {
            assert!(pair[1] >= pair[0]);
            assert!(pair[1].duration_since(pair[0]) >= spacing);
        }
        assert_eq!(starts[0], now + spacing);

        let other = MessageKey {
            chat: 1,
            message: 11,
        };
        assert_eq!(spacer.schedule(other, now, spacing), now + spacing);
        assert_eq!(spacer.len(), 2);

        spacer.prune(now + Duration::from_secs(60));
        assert!(spacer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_limits_concurrency() {
        let pacer = Pacer::new(2);
        let a = pacer.acquire().await.unwrap();
        let _b = pacer.acquire().await.unwrap();
        assert_eq!(pacer.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_secs(5), pacer.acquire()).await;
        assert!(blocked.is_err());

        drop(a);
        assert!(pacer.acquire().await.is_some());
    }
}
