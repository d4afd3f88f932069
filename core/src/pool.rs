use super::model::AccountId;
use super::platform::PlatformClient;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// 账号 id 到在线连接的映射，连接只由这里持有
#[derive(Default)]
pub struct AccountPool {
    clients: RwLock<HashMap<AccountId, Arc<dyn PlatformClient>>>,
}

impl AccountPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, client: Arc<dyn PlatformClient>) {
        let account = client.account();
        self.clients.write().await.insert(account, client);
    }

    pub async fn get(&self, account: AccountId) -> Option<Arc<dyn PlatformClient>> {
        self.clients.read().await.get(&account).cloned()
    }

    /// 仅返回仍在线的连接
    pub async fn live(&self, account: AccountId) -> Option<Arc<dyn PlatformClient>> {
        self.get(account).await.filter(|c| c.is_connected())
    }

    pub async fn is_connected(&self, account: AccountId) -> bool {
        self.live(account).await.is_some()
    }

    pub async fn connected_ids(&self) -> Vec<AccountId> {
        let clients = self.clients.read().await;
        let mut ids: Vec<_> = clients
            .iter()
            .filter(|(_, c)| c.is_connected())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn all(&self) -> Vec<Arc<dyn PlatformClient>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// 移出连接并在超时内断开
    pub async fn evict(&self, account: AccountId, timeout: Duration) -> bool {
        let client = self.clients.write().await.remove(&account);
        match client {
            Some(client) => {
                disconnect_with_timeout(client.as_ref(), timeout).await;
                true
            }
            None => false,
        }
    }

    /// 清空并断开全部连接
    pub async fn disconnect_all(&self, timeout: Duration) -> usize {
        let drained: Vec<_> = self.clients.write().await.drain().collect();
        let count = drained.len();
        // 并行断开，整体耗时不超过一个超时
        let mut tasks = JoinSet::new();
        for (_, client) in drained {
            tasks.spawn(async move { disconnect_with_timeout(client.as_ref(), timeout).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("断开连接任务异常: {}", e);
            }
        }
        count
    }
}

async fn disconnect_with_timeout(client: &dyn PlatformClient, timeout: Duration) {
    let account = client.account();
    if !client.is_connected() {
        return;
    }
    match tokio::time::timeout(timeout, client.disconnect()).await {
        Ok(Ok(())) => info!("账号 {} 已断开连接", account),
        Ok(Err(e)) => warn!("账号 {} 断开连接失败: {}", account, e),
        Err(_) => warn!("账号 {} 断开连接超时，强制丢弃", account),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockClient;

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_runs_in_parallel() {
        let pool = AccountPool::new();
        let stuck = [MockClient::new(1), MockClient::new(2)];
        for client in &stuck {
            client.set_disconnect_hangs(true);
            pool.insert(client.clone()).await;
        }
        let quick = MockClient::new(3);
        pool.insert(quick.clone()).await;

        let started = tokio::time::Instant::now();
        assert_eq!(pool.disconnect_all(Duration::from_secs(10)).await, 3);

        assert!(started.elapsed() < Duration::from_secs(11));
        assert!(pool.is_empty().await);
        assert!(!quick.is_connected());
        assert!(stuck.iter().all(|c| c.disconnects() == 1));
    }
}
