use super::model::ChatId;
use super::platform::TextGenerator;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::Repository;
use tracing::{error, info, warn};

/// 评论池、使用计数与已用文本
pub struct CommentPools {
    repo: Repository,
    generator: Arc<dyn TextGenerator>,
    regen_count: usize,
    usage_threshold: usize,
    generator_timeout: Duration,
    usage: Mutex<HashMap<ChatId, usize>>,
    used: Mutex<HashSet<(ChatId, String)>>,
}

impl CommentPools {
    pub fn new(
        repo: Repository,
        generator: Arc<dyn TextGenerator>,
        regen_count: usize,
        usage_threshold: usize,
        generator_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            generator,
            regen_count,
            usage_threshold: usage_threshold.max(1),
            generator_timeout,
            usage: Mutex::new(HashMap::new()),
            used: Mutex::new(HashSet::new()),
        }
    }

    /// 调用生成服务；失败或超时返回 `None`
    pub async fn generate(&self, count: usize) -> Option<Vec<String>> {
        match tokio::time::timeout(self.generator_timeout, self.generator.generate(count)).await {
            Ok(Ok(texts)) => {
                let texts: Vec<String> = texts
                    .into_iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                if texts.is_empty() {
                    warn!("评论生成服务返回空结果");
                    return None;
                }
                Some(texts)
            }
            Ok(Err(e)) => {
                error!("评论生成失败: {:#}", e);
                None
            }
            Err(_) => {
                error!("评论生成超时 ({}s)", self.generator_timeout.as_secs());
                None
            }
        }
    }

    /// 取出至多 `needed` 条评论；池子不足时补充生成并写回
    pub async fn next_batch(&self, chat: ChatId, needed: usize) -> Vec<String> {
        let mut pool = match self.repo.comment_pool(chat).await {
            Ok(pool) => pool.unwrap_or_default(),
            Err(e) => {
                error!("读取评论池失败 chat={}: {:#}", chat, e);
                Vec::new()
            }
        };

        if pool.len() < needed {
            info!(
                "聊天 {} 的评论池只有 {} 条，请求生成 {} 条",
                chat,
                pool.len(),
                self.regen_count
            );
            if let Some(fresh) = self.generate(self.regen_count).await {
                pool.extend(fresh);
                if let Err(e) = self.repo.save_comment_pool(chat, &pool).await {
                    error!("保存评论池失败 chat={}: {:#}", chat, e);
                }
            }
        }

        pool.truncate(needed);
        pool
    }

    /// 累加聊天的评论计数，达到阈值时重新生成评论池并清零
    ///
    /// 返回是否触发了重新生成
    pub async fn record_usage(&self, chat: ChatId) -> bool {
        let reached = {
            let mut usage = match self.usage.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let count = usage.entry(chat).or_insert(0);
            *count += 1;
            if *count >= self.usage_threshold {
                *count = 0;
                true
            } else {
                false
            }
        };

        if !reached {
            return false;
        }

        match self.generate(self.regen_count).await {
            Some(fresh) => match self.repo.save_comment_pool(chat, &fresh).await {
                Ok(()) => info!("聊天 {} 的评论池已重新生成 ({} 条)", chat, fresh.len()),
                Err(e) => error!("保存重新生成的评论池失败 chat={}: {:#}", chat, e),
            },
            None => warn!("聊天 {} 的评论池本轮未能重新生成", chat),
        }
        true
    }

    pub fn usage(&self, chat: ChatId) -> usize {
        self.usage
            .lock()
            .map(|usage| usage.get(&chat).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_used(&self, chat: ChatId, text: &str) -> bool {
        match self.used.lock() {
            Ok(used) => used.contains(&(chat, text.to_string())),
            Err(poisoned) => poisoned.into_inner().contains(&(chat, text.to_string())),
        }
    }

    /// 首次使用返回 true
    pub fn mark_used(&self, chat: ChatId, text: &str) -> bool {
        let mut used = match self.used.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        used.insert((chat, text.to_string()))
    }

    pub fn clear(&self) {
        if let Ok(mut usage) = self.usage.lock() {
            usage.clear();
        }
        if let Ok(mut used) = self.used.lock() {
            used.clear();
        }
    }
}
