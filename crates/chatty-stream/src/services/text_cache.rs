use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

/// A content hash used as cache key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentCacheKey(u64);

impl ContentCacheKey {
    pub fn new(content: &str) -> Self {
        Self::with_flags(content, 0)
    }

    /// Key for content whose processed form also depends on surrounding context
    pub fn with_flags(content: &str, flags: u8) -> Self {
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        flags.hash(&mut hasher);
        Self(hasher.finish())
    }
}

struct CacheInner {
    entries: HashMap<ContentCacheKey, String>,
    /// Insertion order, oldest first
    order: VecDeque<ContentCacheKey>,
}

/// Size-bounded text cache shared by every `MessageProcessor` built from the
/// same pipeline context.
///
/// Cloning shares the underlying storage. When the entry count exceeds
/// `max_entries`, the oldest half is evicted.
#[derive(Clone)]
pub struct TextCache {
    inner: Arc<Mutex<CacheInner>>,
    max_entries: usize,
}

impl TextCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            })),
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, key: &ContentCacheKey) -> Option<String> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn insert(&self, key: ContentCacheKey, value: String) {
        let mut inner = self.inner.lock();
        if inner.entries.insert(key, value).is_none() {
            inner.order.push_back(key);
        }
        if inner.entries.len() > self.max_entries {
            let evict = inner.entries.len() / 2;
            for _ in 0..evict {
                if let Some(old) = inner.order.pop_front() {
                    inner.entries.remove(&old);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
