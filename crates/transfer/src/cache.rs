use std::collections::VecDeque;

use chunkferry_protocol::Fingerprint;

/// Maximum number of remembered fingerprints.
pub const FINGERPRINT_CACHE_CAPACITY: usize = 50;

/// Small most-recently-used map from fingerprint to full content hash.
///
/// Lets a client that re-selects a file skip the full-file hash entirely.
#[derive(Debug)]
pub struct FingerprintCache {
    entries: VecDeque<(Fingerprint, String)>,
    capacity: usize,
}

impl Default for FingerprintCache {
    fn default() -> Self {
        Self::new(FINGERPRINT_CACHE_CAPACITY)
    }
}

impl FingerprintCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns the cached hash and marks the entry as most recently used.
    pub fn get(&mut self, fp: &Fingerprint) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == fp)?;
        let entry = self.entries.remove(pos)?;
        let hash = entry.1.clone();
        self.entries.push_front(entry);
        Some(hash)
    }

    /// Inserts or refreshes an entry, evicting the least recently used one when full.
    pub fn insert(&mut self, fp: Fingerprint, file_hash: String) {
        if let Some(pos) = self.entries.iter().position(|(k, _)| *k == fp) {
            self.entries.remove(pos);
        }
        self.entries.push_front((fp, file_hash));
        self.entries.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint {
            start_hash: format!("s{n}"),
            end_hash: format!("e{n}"),
            size: n,
        }
    }

    #[test]
    fn miss_then_hit() {
        let mut cache = FingerprintCache::default();
        assert!(cache.get(&fp(1)).is_none());
        cache.insert(fp(1), "h1".into());
        assert_eq!(cache.get(&fp(1)).as_deref(), Some("h1"));
    }

    #[test]
    fn same_hashes_different_size_is_a_miss() {
        let mut cache = FingerprintCache::default();
        cache.insert(fp(1), "h1".into());
        let mut other = fp(1);
        other.size = 2;
        assert!(cache.get(&other).is_none());
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = FingerprintCache::new(2);
        cache.insert(fp(1), "h1".into());
        cache.insert(fp(2), "h2".into());
        // Touch 1 so 2 becomes the eviction candidate.
        cache.get(&fp(1));
        cache.insert(fp(3), "h3".into());

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&fp(2)).is_none());
        assert!(cache.get(&fp(1)).is_some());
        assert!(cache.get(&fp(3)).is_some());
    }

    #[test]
    fn reinsert_replaces_hash() {
        let mut cache = FingerprintCache::default();
        cache.insert(fp(1), "old".into());
        cache.insert(fp(1), "new".into());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&fp(1)).as_deref(), Some("new"));
    }

    #[test]
    fn default_capacity_is_fifty() {
        let mut cache = FingerprintCache::default();
        for n in 0..60 {
            cache.insert(fp(n), format!("h{n}"));
        }
        assert_eq!(cache.len(), FINGERPRINT_CACHE_CAPACITY);
        assert!(cache.get(&fp(0)).is_none());
        assert!(cache.get(&fp(59)).is_some());
    }
}
