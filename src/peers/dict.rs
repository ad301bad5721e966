//! The per-peer dictionary cache.
//!
//! Repeated string values (server names, mostly) are elided on the wire:
//! the sender keeps an LRU of value→id and transmits the bare id once the
//! receiver is known to have seen the pair. Both sides are fixed at 128
//! entries; ids on the wire are shifted by one so zero means "absent".

use std::collections::HashMap;

/// Fixed cache size on both sides.
pub const CACHE_ENTRIES: usize = 128;

/// Sender side: value → id with LRU eviction.
#[derive(Debug)]
pub struct TxCache {
    slots: Vec<Option<Vec<u8>>>,
    by_value: HashMap<Vec<u8>, usize>,
    /// Monotonic use stamps; the smallest is the LRU victim.
    stamps: Vec<u64>,
    clock: u64,
}

/// Result of a TX lookup-or-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxLookup {
    /// The value was cached; send the id alone.
    Hit(u64),
    /// Newly inserted (possibly evicting); send id plus full value.
    Miss(u64),
}

impl TxCache {
    pub fn new() -> TxCache {
        TxCache {
            slots: vec![None; CACHE_ENTRIES],
            by_value: HashMap::new(),
            stamps: vec![0; CACHE_ENTRIES],
            clock: 0,
        }
    }

    /// Looks the value up, inserting into the LRU slot on a miss.
    pub fn use_value(&mut self, value: &[u8]) -> TxLookup {
        self.clock += 1;
        if let Some(&id) = self.by_value.get(value) {
            self.stamps[id] = self.clock;
            return TxLookup::Hit(id as u64);
        }
        // evict the coldest slot
        let victim = (0..CACHE_ENTRIES)
            .min_by_key(|&i| self.stamps[i])
            .expect("cache has slots");
        if let Some(old) = self.slots[victim].take() {
            self.by_value.remove(&old);
        }
        self.slots[victim] = Some(value.to_vec());
        self.by_value.insert(value.to_vec(), victim);
        self.stamps[victim] = self.clock;
        TxLookup::Miss(victim as u64)
    }

    /// Forgets everything, e.g. on reconnection.
    pub fn flush(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.by_value.clear();
        for stamp in self.stamps.iter_mut() {
            *stamp = 0;
        }
    }
}

impl Default for TxCache {
    fn default() -> TxCache {
        TxCache::new()
    }
}

/// Receiver side: id → value.
#[derive(Debug)]
pub struct RxCache {
    slots: Vec<Option<Vec<u8>>>,
}

impl RxCache {
    pub fn new() -> RxCache {
        RxCache {
            slots: vec![None; CACHE_ENTRIES],
        }
    }

    pub fn set(&mut self, id: u64, value: Vec<u8>) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            *slot = Some(value);
        }
    }

    /// A bare id the sender never defined decodes to nothing; the entry
    /// is dropped rather than guessed at.
    pub fn get(&self, id: u64) -> Option<&[u8]> {
        self.slots.get(id as usize)?.as_deref()
    }

    pub fn flush(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

impl Default for RxCache {
    fn default() -> RxCache {
        RxCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_use_is_a_hit() {
        let mut tx = TxCache::new();
        let id = match tx.use_value(b"web1") {
            TxLookup::Miss(id) => id,
            other => panic!("expected miss, got {:?}", other),
        };
        assert_eq!(tx.use_value(b"web1"), TxLookup::Hit(id));
    }

    #[test]
    fn eviction_picks_the_coldest() {
        let mut tx = TxCache::new();
        for i in 0..CACHE_ENTRIES {
            tx.use_value(format!("v{}", i).as_bytes());
        }
        // refresh v0 so v1 becomes the victim
        tx.use_value(b"v0");
        let TxLookup::Miss(id) = tx.use_value(b"fresh") else {
            panic!("expected miss");
        };
        // v1 lived in slot 1
        assert_eq!(id, 1);
        assert!(matches!(tx.use_value(b"v1"), TxLookup::Miss(_)));
        assert!(matches!(tx.use_value(b"v0"), TxLookup::Hit(_)));
    }

    #[test]
    fn rx_returns_known_ids_only() {
        let mut rx = RxCache::new();
        assert!(rx.get(3).is_none());
        rx.set(3, b"web1".to_vec());
        assert_eq!(rx.get(3), Some(&b"web1"[..]));
        assert!(rx.get(CACHE_ENTRIES as u64 + 5).is_none());
    }

    #[test]
    fn flush_clears_both_sides() {
        let mut tx = TxCache::new();
        tx.use_value(b"x");
        tx.flush();
        assert!(matches!(tx.use_value(b"x"), TxLookup::Miss(_)));

        let mut rx = RxCache::new();
        rx.set(1, b"y".to_vec());
        rx.flush();
        assert!(rx.get(1).is_none());
    }
}
