//! In-memory event cache (§4.4 / C4).
//!
//! Grounded in `cache::db::index::DatabaseIndexes`: secondary indices kept
//! as `rustc_hash::FxHashMap`/`FxHashSet` rather than the stdlib
//! collections, an `is_initialized` guard pattern, and `tracing` for
//! eviction/supersede diagnostics. The teacher's version is backed by a
//! flatbuffer-driven on-disk store (`storage: S: EventStorage`); this
//! runtime has no persistence requirement (§4.4 Non-goals), so the
//! structure is kept but the storage generic is dropped in favor of a
//! plain `HashMap<EventId, Event>`.

use std::collections::hash_map::Entry;
use std::sync::RwLock;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::event::{is_parameterized_replaceable, is_replaceable, Event, EventId, Filter};

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub stored: u64,
    pub superseded: u64,
    pub evicted: u64,
    pub rejected_duplicate: u64,
}

struct Indexes {
    events: FxHashMap<EventId, Event>,
    by_pubkey: FxHashMap<[u8; 32], FxHashSet<EventId>>,
    by_kind: FxHashMap<u16, FxHashSet<EventId>>,
    replaceable: FxHashMap<String, EventId>,
    /// Insertion order, oldest first, for memory-pressure eviction.
    order: Vec<EventId>,
}

impl Indexes {
    fn new() -> Self {
        Self {
            events: FxHashMap::default(),
            by_pubkey: FxHashMap::default(),
            by_kind: FxHashMap::default(),
            replaceable: FxHashMap::default(),
            order: Vec::new(),
        }
    }

    fn remove(&mut self, id: &EventId) -> Option<Event> {
        let event = self.events.remove(id)?;
        if let Some(set) = self.by_pubkey.get_mut(&event.pubkey.0) {
            set.remove(id);
        }
        if let Some(set) = self.by_kind.get_mut(&event.kind) {
            set.remove(id);
        }
        self.order.retain(|e| e != id);
        Some(event)
    }

    fn insert(&mut self, event: Event) {
        self.by_pubkey.entry(event.pubkey.0).or_default().insert(event.id);
        self.by_kind.entry(event.kind).or_default().insert(event.id);
        self.order.push(event.id);
        self.events.insert(event.id, event);
    }
}

/// In-memory, process-lifetime event cache keyed by id, with a set-valued
/// secondary index per query dimension (§4.4). Bounded by
/// `cache_max_events`; eviction discards the oldest `cache_retain_ratio`
/// fraction of entries once full.
pub struct EventCache {
    max_events: usize,
    retain_ratio: f64,
    indexes: RwLock<Indexes>,
    stats: RwLock<CacheStats>,
}

impl EventCache {
    pub fn new(max_events: usize, retain_ratio: f64) -> Self {
        Self {
            max_events,
            retain_ratio,
            indexes: RwLock::new(Indexes::new()),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Inserts `event`, applying replaceable-kind supersession (§4.4).
    /// Caller is responsible for signature/id verification before calling
    /// this — the cache trusts what it's given, matching the teacher's
    /// split between parsing/verification and storage.
    pub fn store(&self, event: Event) -> bool {
        let mut indexes = self.indexes.write().expect("cache index lock poisoned");
        let mut stats = self.stats.write().expect("cache stats lock poisoned");

        if indexes.events.contains_key(&event.id) {
            stats.rejected_duplicate += 1;
            return false;
        }

        if is_replaceable(event.kind) || is_parameterized_replaceable(event.kind) {
            if let Some(key) = event.replace_key() {
                match indexes.replaceable.entry(key.clone()) {
                    Entry::Occupied(mut slot) => {
                        let existing_id = *slot.get();
                        let existing = indexes.events.get(&existing_id);
                        let should_replace = existing
                            .map(|e| event.created_at > e.created_at)
                            .unwrap_or(true);
                        if !should_replace {
                            stats.rejected_duplicate += 1;
                            return false;
                        }
                        indexes.remove(&existing_id);
                        stats.superseded += 1;
                        slot.insert(event.id);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(event.id);
                    }
                }
            }
        }

        indexes.insert(event);
        stats.stored += 1;

        // Plain overflow evicts exactly the single oldest entry, pinning
        // cache size at `max_events` (testable property #8). Bulk eviction
        // of a `retain_ratio` fraction is reserved for `apply_memory_pressure`,
        // which is only invoked on an externally-signaled pressure event.
        if indexes.events.len() > self.max_events {
            if let Some(oldest) = indexes.order.first().copied() {
                indexes.remove(&oldest);
                stats.evicted += 1;
                tracing::debug!(evicted_id = %oldest, "cache evicted oldest entry on overflow");
            }
        }

        true
    }

    /// Externally-signaled memory-pressure eviction (§4.4): discards the
    /// oldest `retain_ratio` fraction of entries in one pass. Distinct from
    /// the single-entry eviction `store` performs on ordinary overflow.
    pub fn apply_memory_pressure(&self) {
        let mut indexes = self.indexes.write().expect("cache index lock poisoned");
        let mut stats = self.stats.write().expect("cache stats lock poisoned");

        let evict_count = ((self.max_events as f64) * self.retain_ratio).ceil() as usize;
        let victims: Vec<EventId> = indexes.order.iter().take(evict_count).cloned().collect();
        for id in &victims {
            indexes.remove(id);
            stats.evicted += 1;
        }
        tracing::info!(evicted = victims.len(), "cache evicted oldest fraction under memory pressure");
    }

    /// Looks up `id`, promoting it to most-recently-used on hit (§4.4: "get
    /// ... moves entry to MRU") — this is why the lookup needs a write lock
    /// even though it's read-shaped.
    pub fn get(&self, id: &EventId) -> Option<Event> {
        let mut indexes = self.indexes.write().expect("cache index lock poisoned");
        let event = indexes.events.get(id).cloned()?;
        if let Some(pos) = indexes.order.iter().position(|e| e == id) {
            let promoted = indexes.order.remove(pos);
            indexes.order.push(promoted);
        }
        Some(event)
    }

    pub fn remove(&self, id: &EventId) -> Option<Event> {
        self.indexes.write().expect("cache index lock poisoned").remove(id)
    }

    /// Linear scan over the relevant secondary index (ids/authors/kinds, if
    /// present) narrowed by `Filter::matches`, matching §4.4's query
    /// contract: correctness over index-perfect selectivity.
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        let indexes = self.indexes.read().expect("cache index lock poisoned");

        let candidate_ids: Vec<EventId> = if let Some(ids) = &filter.ids {
            ids.clone()
        } else if let Some(authors) = &filter.authors {
            authors
                .iter()
                .flat_map(|a| indexes.by_pubkey.get(&a.0).into_iter().flatten().copied())
                .collect()
        } else if let Some(kinds) = &filter.kinds {
            kinds
                .iter()
                .flat_map(|k| indexes.by_kind.get(k).into_iter().flatten().copied())
                .collect()
        } else {
            indexes.events.keys().copied().collect()
        };

        let mut results: Vec<Event> = candidate_ids
            .into_iter()
            .filter_map(|id| indexes.events.get(&id).cloned())
            .filter(|e| filter.matches(e))
            .collect();

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        results
    }

    pub fn clear(&self) {
        *self.indexes.write().expect("cache index lock poisoned") = Indexes::new();
    }

    pub fn len(&self) -> usize {
        self.indexes.read().expect("cache index lock poisoned").events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> CacheStats {
        *self.stats.read().expect("cache stats lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PublicKey;

    fn event(id: u8, pubkey: u8, kind: u16, created_at: u64, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: EventId([id; 32]),
            pubkey: PublicKey([pubkey; 32]),
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: "00".repeat(64),
        }
    }

    #[test]
    fn duplicate_id_rejected() {
        let cache = EventCache::new(100, 0.2);
        assert!(cache.store(event(1, 1, 1, 100, vec![])));
        assert!(!cache.store(event(1, 1, 1, 100, vec![])));
        assert_eq!(cache.statistics().rejected_duplicate, 1);
    }

    #[test]
    fn newer_replaceable_event_supersedes_older() {
        let cache = EventCache::new(100, 0.2);
        assert!(cache.store(event(1, 9, 0, 100, vec![])));
        assert!(cache.store(event(2, 9, 0, 200, vec![])));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&EventId([2; 32])).is_some());
        assert!(cache.get(&EventId([1; 32])).is_none());
        assert_eq!(cache.statistics().superseded, 1);
    }

    #[test]
    fn older_replaceable_event_rejected() {
        let cache = EventCache::new(100, 0.2);
        assert!(cache.store(event(2, 9, 0, 200, vec![])));
        assert!(!cache.store(event(1, 9, 0, 100, vec![])));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&EventId([2; 32])).is_some());
    }

    #[test]
    fn parameterized_replaceable_keyed_by_d_tag() {
        let cache = EventCache::new(100, 0.2);
        let tag = vec!["d".to_string(), "profile".to_string()];
        assert!(cache.store(event(1, 9, 30001, 100, vec![tag.clone()])));
        assert!(cache.store(event(2, 9, 30001, 200, vec![tag])));
        assert_eq!(cache.len(), 1);

        let other_tag = vec!["d".to_string(), "settings".to_string()];
        assert!(cache.store(event(3, 9, 30001, 150, vec![other_tag])));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn overflow_evicts_single_oldest_pinning_size() {
        let cache = EventCache::new(4, 0.5);
        for i in 1..=5u8 {
            cache.store(event(i, i, 1, i as u64, vec![]));
        }
        assert_eq!(cache.len(), 4, "plain overflow must keep the cache pinned at max_events");
        assert!(cache.get(&EventId([5; 32])).is_some());
        assert!(cache.get(&EventId([1; 32])).is_none(), "oldest entry is the one evicted");
        assert_eq!(cache.statistics().evicted, 1);
    }

    #[test]
    fn memory_pressure_evicts_retain_fraction_in_one_pass() {
        let cache = EventCache::new(10, 0.5);
        for i in 1..=10u8 {
            cache.store(event(i, i, 1, i as u64, vec![]));
        }
        assert_eq!(cache.len(), 10);
        cache.apply_memory_pressure();
        assert_eq!(cache.len(), 5, "retain_ratio 0.5 of 10 evicts 5 oldest entries");
        assert!(cache.get(&EventId([10; 32])).is_some());
        assert!(cache.get(&EventId([1; 32])).is_none());
    }

    #[test]
    fn get_promotes_entry_to_mru() {
        let cache = EventCache::new(3, 0.5);
        cache.store(event(1, 1, 1, 1, vec![]));
        cache.store(event(2, 2, 1, 2, vec![]));
        cache.store(event(3, 3, 1, 3, vec![]));

        // touch the oldest entry so it's no longer the eviction target
        assert!(cache.get(&EventId([1; 32])).is_some());

        cache.store(event(4, 4, 1, 4, vec![]));
        assert!(cache.get(&EventId([1; 32])).is_some(), "recently-read entry should survive eviction");
        assert!(cache.get(&EventId([2; 32])).is_none(), "untouched oldest entry is evicted instead");
    }

    #[test]
    fn query_by_author_respects_limit_and_order() {
        let cache = EventCache::new(100, 0.2);
        cache.store(event(1, 9, 1, 100, vec![]));
        cache.store(event(2, 9, 1, 300, vec![]));
        cache.store(event(3, 9, 1, 200, vec![]));

        let filter = Filter {
            authors: Some(vec![PublicKey([9; 32])]),
            limit: Some(2),
            ..Default::default()
        };
        let results = cache.query(&filter);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].created_at, 300);
        assert_eq!(results[1].created_at, 200);
    }
}
