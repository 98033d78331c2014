use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// Number of independently locked shards.
pub const SHARD_COUNT: usize = 32;

/// Maps a string key onto a shard index.
pub trait ShardHash: Send + Sync {
    fn sum(&self, key: &str) -> u32;
}

/// FNV-1a, 32 bit. Cheap and well distributed for short decimal keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fnv32Hash;

impl ShardHash for Fnv32Hash {
    fn sum(&self, key: &str) -> u32 {
        const OFFSET: u32 = 2_166_136_261;
        const PRIME: u32 = 16_777_619;
        let mut hash = OFFSET;
        for b in key.bytes() {
            hash ^= u32::from(b);
            hash = hash.wrapping_mul(PRIME);
        }
        hash
    }
}

/// String-keyed concurrent map split into [`SHARD_COUNT`] independently
/// locked shards.
///
/// Readers and writers touching different shards never contend. Iteration
/// (`snapshot`, `for_each`, `keys`) takes per-shard read locks one at a
/// time, so it is safe under concurrent insertion and removal and never
/// blocks writers on the other shards.
pub struct ShardMap<V> {
    shards: Vec<RwLock<HashMap<String, V>>>,
    hash: Arc<dyn ShardHash>,
}

impl<V: Clone> Default for ShardMap<V> {
    fn default() -> Self {
        Self::with_hash(Arc::new(Fnv32Hash))
    }
}

impl<V: Clone> ShardMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hash(hash: Arc<dyn ShardHash>) -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self { shards, hash }
    }

    #[inline]
    fn shard(&self, key: &str) -> &RwLock<HashMap<String, V>> {
        &self.shards[self.hash.sum(key) as usize % SHARD_COUNT]
    }

    pub fn insert(&self, key: String, value: V) {
        self.shard(&key).write().unwrap().insert(key, value);
    }

    /// Stores `value` only when `key` is absent. Returns whether it stored.
    pub fn insert_absent(&self, key: String, value: V) -> bool {
        let mut shard = self.shard(&key).write().unwrap();
        if shard.contains_key(&key) {
            return false;
        }
        shard.insert(key, value);
        true
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key).read().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).read().unwrap().contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.shard(key).write().unwrap().remove(key);
    }

    /// Removes `key` when `pred(value, exists)` agrees. Returns whether the
    /// predicate asked for removal.
    pub fn remove_if<F>(&self, key: &str, pred: F) -> bool
    where
        F: FnOnce(Option<&V>) -> bool,
    {
        let mut shard = self.shard(key).write().unwrap();
        let remove = pred(shard.get(key));
        if remove {
            shard.remove(key);
        }
        remove
    }

    pub fn pop(&self, key: &str) -> Option<V> {
        self.shard(key).write().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().unwrap().is_empty())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        for shard in &self.shards {
            keys.extend(shard.read().unwrap().keys().cloned());
        }
        keys
    }

    /// Copies out all entries, shard by shard. The result is a point-in-time
    /// view per shard, not a globally atomic one.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            let shard = shard.read().unwrap();
            out.extend(shard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    /// Runs `f` for every entry while holding the owning shard's read lock.
    /// `f` must not call back into the same map with a write operation.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &V),
    {
        for shard in &self.shards {
            let shard = shard.read().unwrap();
            for (k, v) in shard.iter() {
                f(k, v);
            }
        }
    }

    pub fn clear(&self) {
        for (key, _) in self.snapshot() {
            self.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn insert_get_remove() {
        let map = ShardMap::new();
        map.insert("1".into(), 10u32);
        map.insert("2".into(), 20);

        assert_eq!(map.get("1"), Some(10));
        assert_eq!(map.get("3"), None);
        assert_eq!(map.len(), 2);

        map.remove("1");
        assert_eq!(map.get("1"), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn insert_absent_keeps_first_value() {
        let map = ShardMap::new();
        assert!(map.insert_absent("k".into(), 1u8));
        assert!(!map.insert_absent("k".into(), 2));
        assert_eq!(map.get("k"), Some(1));
    }

    #[test]
    fn remove_if_respects_predicate() {
        let map = ShardMap::new();
        map.insert("k".into(), 7u32);

        assert!(!map.remove_if("k", |v| v != Some(&7)));
        assert_eq!(map.get("k"), Some(7));
        assert!(map.remove_if("k", |v| v == Some(&7)));
        assert_eq!(map.get("k"), None);
    }

    #[test]
    fn len_tracks_concurrent_mutation() {
        let map = Arc::new(ShardMap::new());
        let threads = 8;
        let per_thread = 200usize;

        let mut handles = Vec::new();
        for t in 0..threads {
            let map = Arc::clone(&map);
            handles.push(thread::spawn(move || {
                for i in 0..per_thread {
                    map.insert(format!("{t}-{i}"), i);
                }
                // Remove every other key this thread added.
                for i in (0..per_thread).step_by(2) {
                    map.remove(&format!("{t}-{i}"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(map.len(), threads * per_thread / 2);
    }

    #[test]
    fn snapshot_is_stable_under_writers() {
        let map = Arc::new(ShardMap::new());
        for i in 0..100 {
            map.insert(i.to_string(), i);
        }

        let writer = {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 100..200 {
                    map.insert(i.to_string(), i);
                    map.remove(&(i - 100).to_string());
                }
            })
        };

        // Every snapshot taken while the writer runs must be internally
        // consistent: values always match their keys.
        for _ in 0..50 {
            for (k, v) in map.snapshot() {
                assert_eq!(k, v.to_string());
            }
        }
        writer.join().unwrap();
        assert_eq!(map.len(), 100);
    }
}
