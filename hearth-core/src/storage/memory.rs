use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::{Duration, Instant},
};

use bytes::Bytes;

use super::Storage;

/// In-process storage backend. A single mutex guards the entry map and the
/// tag index so the two can never drift apart; payloads are `Bytes`, so
/// clones handed out by `get` are reference-counted and cheap.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Shelves>,
}

#[derive(Default)]
struct Shelves {
    entries: HashMap<String, Entry>,
    tags: HashMap<String, HashSet<String>>,
}

struct Entry {
    data: Bytes,
    tags: Vec<String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }
}

impl Shelves {
    // Remove an entry and detach it from the tag index.
    fn evict(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        for tag in &entry.tags {
            if let Some(ids) = self.tags.get_mut(tag) {
                ids.remove(id);
                if ids.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        true
    }
}

impl Storage for MemoryStore {
    fn set(&self, id: &str, data: Bytes, tags: &[String], lifetime: Option<Duration>) {
        let mut shelves = self.inner.lock().unwrap();
        shelves.evict(id);
        for tag in tags {
            shelves
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(id.to_string());
        }
        shelves.entries.insert(
            id.to_string(),
            Entry {
                data,
                tags: tags.to_vec(),
                expires_at: lifetime.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn get(&self, id: &str) -> Option<Bytes> {
        let mut shelves = self.inner.lock().unwrap();
        match shelves.entries.get(id) {
            Some(entry) if entry.expired() => {
                shelves.evict(id);
                None
            }
            Some(entry) => Some(entry.data.clone()),
            None => None,
        }
    }

    fn remove(&self, id: &str) -> bool {
        self.inner.lock().unwrap().evict(id)
    }

    fn flush(&self) {
        let mut shelves = self.inner.lock().unwrap();
        shelves.entries.clear();
        shelves.tags.clear();
    }

    fn flush_by_tag(&self, tag: &str) -> usize {
        let mut shelves = self.inner.lock().unwrap();
        let Some(ids) = shelves.tags.get(tag) else {
            return 0;
        };
        let ids: Vec<String> = ids.iter().cloned().collect();
        let mut removed = 0;
        for id in ids {
            if shelves.evict(&id) {
                removed += 1;
            }
        }
        removed
    }

    fn get_by_tag(&self, tag: &str) -> Vec<(String, Bytes)> {
        let shelves = self.inner.lock().unwrap();
        let Some(ids) = shelves.tags.get(tag) else {
            return Vec::new();
        };
        let mut found: Vec<(String, Bytes)> = ids
            .iter()
            .filter_map(|id| match shelves.entries.get(id) {
                Some(entry) if !entry.expired() => Some((id.clone(), entry.data.clone())),
                _ => None,
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    fn keys(&self) -> Vec<String> {
        let shelves = self.inner.lock().unwrap();
        let mut keys: Vec<String> = shelves
            .entries
            .iter()
            .filter(|(_, entry)| !entry.expired())
            .map(|(id, _)| id.clone())
            .collect();
        keys.sort();
        keys
    }

    fn collect_garbage(&self) -> usize {
        let mut shelves = self.inner.lock().unwrap();
        let expired: Vec<String> = shelves
            .entries
            .iter()
            .filter(|(_, entry)| entry.expired())
            .map(|(id, _)| id.clone())
            .collect();
        let mut evicted = 0;
        for id in expired {
            if shelves.evict(&id) {
                evicted += 1;
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;

    use super::MemoryStore;
    use crate::storage::Storage;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = MemoryStore::default();
        store.set("a", Bytes::from_static(b"payload"), &[], None);
        assert_eq!(store.get("a"), Some(Bytes::from_static(b"payload")));
        // repeated gets see the same value
        assert_eq!(store.get("a"), Some(Bytes::from_static(b"payload")));
    }

    #[test]
    fn get_after_remove_misses() {
        let store = MemoryStore::default();
        store.set("a", Bytes::from_static(b"payload"), &[], None);
        assert!(store.remove("a"));
        assert_eq!(store.get("a"), None);
        assert!(!store.remove("a"));
    }

    #[test]
    fn set_overwrites_existing_entry() {
        let store = MemoryStore::default();
        store.set("a", Bytes::from_static(b"one"), &tags(&["t1"]), None);
        store.set("a", Bytes::from_static(b"two"), &tags(&["t2"]), None);
        assert_eq!(store.get("a"), Some(Bytes::from_static(b"two")));
        // the old tag no longer reaches the entry
        assert_eq!(store.flush_by_tag("t1"), 0);
        assert_eq!(store.get("a"), Some(Bytes::from_static(b"two")));
    }

    #[test]
    fn flush_by_tag_only_affects_tagged_entries() {
        let store = MemoryStore::default();
        store.set("a", Bytes::from_static(b"1"), &tags(&["keep"]), None);
        store.set("b", Bytes::from_static(b"2"), &tags(&["drop"]), None);
        store.set("c", Bytes::from_static(b"3"), &tags(&["drop", "keep"]), None);
        assert_eq!(store.flush_by_tag("drop"), 2);
        assert_eq!(store.get("a"), Some(Bytes::from_static(b"1")));
        assert_eq!(store.get("b"), None);
        assert_eq!(store.get("c"), None);
        assert_eq!(store.keys(), vec!["a".to_string()]);
    }

    #[test]
    fn get_by_tag_lists_live_entries() {
        let store = MemoryStore::default();
        store.set("a", Bytes::from_static(b"1"), &tags(&["app"]), None);
        store.set("b", Bytes::from_static(b"2"), &tags(&["app"]), None);
        let found = store.get_by_tag("app");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "a");
        assert_eq!(found[1].0, "b");
        assert!(store.get_by_tag("other").is_empty());
    }

    #[test]
    fn expired_entries_miss_and_are_collected() {
        let store = MemoryStore::default();
        store.set("gone", Bytes::from_static(b"1"), &[], Some(Duration::ZERO));
        store.set("kept", Bytes::from_static(b"2"), &[], Some(Duration::from_secs(3600)));
        assert_eq!(store.get("gone"), None);
        assert_eq!(store.get("kept"), Some(Bytes::from_static(b"2")));

        store.set("gone", Bytes::from_static(b"3"), &[], Some(Duration::ZERO));
        assert_eq!(store.collect_garbage(), 1);
        assert_eq!(store.keys(), vec!["kept".to_string()]);
    }

    #[test]
    fn flush_clears_everything() {
        let store = MemoryStore::default();
        store.set("a", Bytes::from_static(b"1"), &tags(&["t"]), None);
        store.set("b", Bytes::from_static(b"2"), &[], None);
        store.flush();
        assert!(store.keys().is_empty());
        assert_eq!(store.flush_by_tag("t"), 0);
    }

    #[test]
    fn concurrent_writers_keep_index_consistent() {
        let store = Arc::new(MemoryStore::default());
        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let id = format!("w{worker}-{i}");
                    store.set(&id, Bytes::from_static(b"x"), &tags(&["shared"]), None);
                    assert!(store.get(&id).is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get_by_tag("shared").len(), 400);
        assert_eq!(store.flush_by_tag("shared"), 400);
        assert!(store.keys().is_empty());
    }
}
