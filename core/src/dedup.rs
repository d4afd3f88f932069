use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Mutex;

/// 进程内的指纹集合，检查与写入是同一个原子操作
pub struct DedupGuard<K> {
    seen: Mutex<HashSet<K>>,
}

impl<K: Eq + Hash> Default for DedupGuard<K> {
    fn default() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }
}

impl<K: Eq + Hash> DedupGuard<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<K>> {
        match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 第一次见到该指纹时返回 true
    pub fn mark_if_new(&self, key: K) -> bool {
        self.lock().insert(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    /// 撤销标记，动作需要重新执行时使用
    pub fn forget(&self, key: &K) -> bool {
        self.lock().remove(key)
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
