use std::collections::HashMap;

use ring::digest;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::models::{ContentType, Payload};

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::days(7);

/**
 * \brief 缓存条目。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub content_type: ContentType,
    pub value: Payload,
    #[serde(with = "time::serde::rfc3339")]
    pub written_at: OffsetDateTime,
}

/**
 * \brief 由模型名与完整提示词计算缓存键（SHA-256 十六进制）。
 */
pub fn cache_key(model: &str, system_prompt: &str, user_prompt: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for part in [model, system_prompt, user_prompt] {
        ctx.update(&(part.len() as u64).to_le_bytes());
        ctx.update(part.as_bytes());
    }
    hex::encode(ctx.finish().as_ref())
}

/**
 * \brief 有界、带过期时间的响应缓存。淘汰按写入时间，不按访问时间。
 */
#[derive(Debug, Clone)]
pub struct ResponseCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
        }
    }

    /**
     * \brief 从持久化的条目恢复；超出容量的旧条目直接丢弃。
     */
    pub fn restore(capacity: usize, ttl: Duration, entries: Vec<CacheEntry>) -> Self {
        let mut cache = Self::new(capacity, ttl);
        for entry in entries {
            cache.entries.insert(entry.key.clone(), entry);
        }
        cache.evict();
        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /**
     * \brief 读取条目；超过 TTL 的条目视为未命中（不会立即删除）。
     */
    pub fn get(&self, key: &str, now: OffsetDateTime) -> Option<&CacheEntry> {
        self.entries
            .get(key)
            .filter(|entry| now - entry.written_at <= self.ttl)
    }

    /**
     * \brief 写入条目，超出容量时只保留写入时间最新的 N 条。同键后写覆盖先写。
     */
    pub fn insert(
        &mut self,
        key: String,
        content_type: ContentType,
        value: Payload,
        now: OffsetDateTime,
    ) {
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                content_type,
                value,
                written_at: now,
            },
        );
        if self.entries.len() > self.capacity {
            self.evict();
        }
    }

    /**
     * \brief 导出全部条目（按写入时间倒序），用于持久化。
     */
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.written_at.cmp(&a.written_at).then_with(|| a.key.cmp(&b.key)));
        entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict(&mut self) {
        if self.entries.len() <= self.capacity {
            return;
        }
        let mut ranked = self.snapshot();
        ranked.truncate(self.capacity);
        self.entries = ranked.into_iter().map(|e| (e.key.clone(), e)).collect();
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn note(text: &str) -> Payload {
        Payload::Text {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_cache_key_is_deterministic_and_separates_parts() {
        let a = cache_key("m", "sys", "prompt");
        assert_eq!(a, cache_key("m", "sys", "prompt"));
        assert_ne!(a, cache_key("m2", "sys", "prompt"));
        assert_ne!(cache_key("ab", "c", ""), cache_key("a", "bc", ""));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_inserting_past_capacity_keeps_most_recent() {
        let start = datetime!(2025-01-01 0:00 UTC);
        let mut cache = ResponseCache::new(100, DEFAULT_TTL);
        for i in 0..100 {
            cache.insert(
                format!("k{}", i),
                ContentType::Note,
                note(&i.to_string()),
                start + Duration::seconds(i),
            );
        }
        assert_eq!(cache.len(), 100);

        let now = start + Duration::seconds(100);
        cache.insert("k100".into(), ContentType::Note, note("100"), now);
        assert_eq!(cache.len(), 100);
        assert!(cache.get("k0", now).is_none());
        let oldest_kept = cache
            .snapshot()
            .iter()
            .map(|e| e.written_at)
            .min()
            .expect("entries");
        assert!(oldest_kept > start);
        assert!(cache.get("k100", now).is_some());
    }

    #[test]
    fn test_eviction_ignores_reads() {
        let start = datetime!(2025-01-01 0:00 UTC);
        let mut cache = ResponseCache::new(2, DEFAULT_TTL);
        cache.insert("old".into(), ContentType::Note, note("a"), start);
        cache.insert("mid".into(), ContentType::Note, note("b"), start + Duration::minutes(1));
        assert!(cache.get("old", start + Duration::minutes(2)).is_some());
        cache.insert("new".into(), ContentType::Note, note("c"), start + Duration::minutes(3));
        assert!(cache.get("old", start + Duration::minutes(3)).is_none());
        assert!(cache.get("mid", start + Duration::minutes(3)).is_some());
    }

    #[test]
    fn test_expired_entry_is_not_served_but_still_present() {
        let written = datetime!(2025-03-01 12:00 UTC);
        let mut cache = ResponseCache::new(10, Duration::days(7));
        cache.insert("k".into(), ContentType::Mail, note("x"), written);
        assert!(cache.get("k", written + Duration::days(7)).is_some());
        assert!(cache.get("k", written + Duration::days(7) + Duration::seconds(1)).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_same_key_is_last_write_wins() {
        let now = datetime!(2025-03-01 12:00 UTC);
        let mut cache = ResponseCache::default();
        cache.insert("k".into(), ContentType::Note, note("first"), now);
        cache.insert("k".into(), ContentType::Note, note("second"), now + Duration::seconds(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k", now + Duration::seconds(1)).expect("hit").value, note("second"));
    }

    #[test]
    fn test_restore_truncates_to_capacity() {
        let start = datetime!(2025-01-01 0:00 UTC);
        let entries = (0..5)
            .map(|i| CacheEntry {
                key: format!("k{}", i),
                content_type: ContentType::Note,
                value: note("v"),
                written_at: start + Duration::hours(i),
            })
            .collect();
        let cache = ResponseCache::restore(3, DEFAULT_TTL, entries);
        assert_eq!(cache.len(), 3);
        let keys: Vec<String> = cache.snapshot().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["k4", "k3", "k2"]);
    }
}
