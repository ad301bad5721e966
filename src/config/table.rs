//! Stick tables: the keyed store whose entries the peers protocol
//! replicates.
//!
//! Storage internals are deliberately simple; only the key/data API is
//! relied upon by the rest of the crate. Every committed write receives a
//! monotonically increasing update id which the replication layer uses as
//! its cursor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Key type of a stick table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// 32-bit integer, sent raw on the wire.
    SInt,
    /// NUL-free byte string, length-prefixed on the wire.
    Str,
    /// Fixed-size binary blob.
    Bin,
    /// IPv4 address.
    Ipv4,
    /// IPv6 address.
    Ipv6,
}

impl KeyType {
    /// Wire code in table DEFINE messages.
    pub fn code(self) -> u64 {
        match self {
            KeyType::Ipv4 => 4,
            KeyType::Ipv6 => 5,
            KeyType::SInt => 2,
            KeyType::Str => 6,
            KeyType::Bin => 7,
        }
    }

    pub fn from_code(code: u64) -> Option<KeyType> {
        Some(match code {
            2 => KeyType::SInt,
            4 => KeyType::Ipv4,
            5 => KeyType::Ipv6,
            6 => KeyType::Str,
            7 => KeyType::Bin,
            _ => return None,
        })
    }
}

/// A concrete key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    SInt(u32),
    Str(Vec<u8>),
    Bin(Vec<u8>),
    Ipv4([u8; 4]),
    Ipv6([u8; 16]),
}

impl TableKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            TableKey::SInt(_) => KeyType::SInt,
            TableKey::Str(_) => KeyType::Str,
            TableKey::Bin(_) => KeyType::Bin,
            TableKey::Ipv4(_) => KeyType::Ipv4,
            TableKey::Ipv6(_) => KeyType::Ipv6,
        }
    }
}

/// Standard wire encoding class of a data column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardType {
    SInt,
    UInt,
    ULongLong,
    FreqPeriod,
    Dict,
}

/// Registered data columns. The numeric code orders columns on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    ServerId,
    Gpt0,
    Gpc0,
    Gpc0Rate,
    ConnCnt,
    ConnCur,
    ConnRate,
    SessCnt,
    SessRate,
    HttpReqCnt,
    HttpReqRate,
    HttpErrCnt,
    BytesInCnt,
    BytesOutCnt,
    ServerName,
}

impl DataType {
    pub fn code(self) -> u64 {
        match self {
            DataType::ServerId => 0,
            DataType::Gpt0 => 1,
            DataType::Gpc0 => 2,
            DataType::Gpc0Rate => 3,
            DataType::ConnCnt => 4,
            DataType::ConnCur => 5,
            DataType::ConnRate => 6,
            DataType::SessCnt => 7,
            DataType::SessRate => 8,
            DataType::HttpReqCnt => 9,
            DataType::HttpReqRate => 10,
            DataType::HttpErrCnt => 11,
            DataType::BytesInCnt => 12,
            DataType::BytesOutCnt => 13,
            DataType::ServerName => 14,
        }
    }

    pub fn from_code(code: u64) -> Option<DataType> {
        Some(match code {
            0 => DataType::ServerId,
            1 => DataType::Gpt0,
            2 => DataType::Gpc0,
            3 => DataType::Gpc0Rate,
            4 => DataType::ConnCnt,
            5 => DataType::ConnCur,
            6 => DataType::ConnRate,
            7 => DataType::SessCnt,
            8 => DataType::SessRate,
            9 => DataType::HttpReqCnt,
            10 => DataType::HttpReqRate,
            11 => DataType::HttpErrCnt,
            12 => DataType::BytesInCnt,
            13 => DataType::BytesOutCnt,
            14 => DataType::ServerName,
            _ => return None,
        })
    }

    pub fn standard(self) -> StandardType {
        match self {
            DataType::ServerId => StandardType::SInt,
            DataType::Gpt0 | DataType::Gpc0 => StandardType::UInt,
            DataType::Gpc0Rate
            | DataType::ConnRate
            | DataType::SessRate
            | DataType::HttpReqRate => StandardType::FreqPeriod,
            DataType::ConnCnt
            | DataType::ConnCur
            | DataType::SessCnt
            | DataType::HttpReqCnt
            | DataType::HttpErrCnt => StandardType::UInt,
            DataType::BytesInCnt | DataType::BytesOutCnt => StandardType::ULongLong,
            DataType::ServerName => StandardType::Dict,
        }
    }

    /// Period argument carried in DEFINE messages for rate columns.
    pub fn has_period_arg(self) -> bool {
        matches!(self.standard(), StandardType::FreqPeriod)
    }
}

/// A frequency counter over a sliding period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreqCtr {
    /// Milliseconds elapsed since the current period started.
    pub curr_tick_age_ms: u32,
    pub curr_ctr: u32,
    pub prev_ctr: u32,
}

/// A single data column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataValue {
    SInt(i64),
    UInt(u32),
    ULongLong(u64),
    FreqPeriod(FreqCtr),
    Dict(Option<Vec<u8>>),
}

impl DataValue {
    pub fn zero(standard: StandardType) -> DataValue {
        match standard {
            StandardType::SInt => DataValue::SInt(0),
            StandardType::UInt => DataValue::UInt(0),
            StandardType::ULongLong => DataValue::ULongLong(0),
            StandardType::FreqPeriod => DataValue::FreqPeriod(FreqCtr::default()),
            StandardType::Dict => DataValue::Dict(None),
        }
    }
}

/// One stored entry.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub data: Vec<DataValue>,
    pub update_id: u32,
    pub expires: Option<Instant>,
}

#[derive(Debug, Default)]
struct Store {
    by_key: HashMap<TableKey, TableEntry>,
    /// update id -> key, ordered, for teach walks and cursors.
    by_update: BTreeMap<u32, TableKey>,
    next_update: u32,
}

/// A keyed in-memory store replicated between peers.
#[derive(Debug)]
pub struct StickTable {
    pub name: String,
    pub key_type: KeyType,
    /// Maximum key length for string keys, fixed size for blobs.
    pub key_size: usize,
    /// Registered columns, kept sorted by wire code.
    pub data_types: Vec<DataType>,
    pub expire: Option<Duration>,
    /// Maximum entry count; inserts beyond it are refused.
    pub size: usize,
    store: Mutex<Store>,
}

impl StickTable {
    pub fn new(
        name: impl Into<String>,
        key_type: KeyType,
        key_size: usize,
        size: usize,
    ) -> StickTable {
        StickTable {
            name: name.into(),
            key_type,
            key_size,
            data_types: Vec::new(),
            expire: None,
            size,
            store: Mutex::new(Store::default()),
        }
    }

    pub fn with_data(mut self, mut types: Vec<DataType>) -> StickTable {
        types.sort_by_key(|t| t.code());
        types.dedup();
        self.data_types = types;
        self
    }

    pub fn with_expire(mut self, expire: Duration) -> StickTable {
        self.expire = Some(expire);
        self
    }

    /// Bitmask of registered data types, as advertised in DEFINE messages.
    pub fn data_type_mask(&self) -> u64 {
        self.data_types.iter().fold(0, |m, t| m | (1 << t.code()))
    }

    /// Column index of a data type in entry vectors.
    pub fn column(&self, dt: DataType) -> Option<usize> {
        self.data_types.iter().position(|&t| t == dt)
    }

    fn fresh_entry(&self, now: Instant) -> TableEntry {
        TableEntry {
            data: self
                .data_types
                .iter()
                .map(|t| DataValue::zero(t.standard()))
                .collect(),
            update_id: 0,
            expires: self.expire.map(|e| now + e),
        }
    }

    /// Reads a whole entry.
    pub fn get(&self, key: &TableKey) -> Option<TableEntry> {
        self.store.lock().unwrap().by_key.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates or updates an entry through `f` and commits it as a local
    /// update, returning the assigned update id. Returns `None` when the
    /// table is full and `key` is new.
    pub fn update<F>(&self, key: TableKey, now: Instant, f: F) -> Option<u32>
    where
        F: FnOnce(&mut TableEntry),
    {
        let mut store = self.store.lock().unwrap();
        if !store.by_key.contains_key(&key) && store.by_key.len() >= self.size {
            return None;
        }
        let mut entry = store
            .by_key
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.fresh_entry(now));
        f(&mut entry);
        let old_id = entry.update_id;
        store.next_update = store.next_update.wrapping_add(1);
        if store.next_update == 0 {
            store.next_update = 1;
        }
        let id = store.next_update;
        entry.update_id = id;
        entry.expires = self.expire.map(|e| now + e);
        if old_id != 0 {
            store.by_update.remove(&old_id);
        }
        store.by_update.insert(id, key.clone());
        store.by_key.insert(key, entry);
        Some(id)
    }

    /// Stores an entry learned from a peer without allocating a new local
    /// update id (the teaching side owns the id space).
    pub fn learn(&self, key: TableKey, data: Vec<DataValue>, expires: Option<Instant>) {
        let mut store = self.store.lock().unwrap();
        if !store.by_key.contains_key(&key) && store.by_key.len() >= self.size {
            return;
        }
        let update_id = store
            .by_key
            .get(&key)
            .map(|e| e.update_id)
            .unwrap_or_default();
        store.by_key.insert(
            key,
            TableEntry {
                data,
                update_id,
                expires,
            },
        );
    }

    /// Most recent committed update id, the TX cursor's upper bound.
    pub fn last_update(&self) -> u32 {
        self.store.lock().unwrap().next_update
    }

    /// Next committed update strictly after `cursor`, if any.
    pub fn next_after(&self, cursor: u32) -> Option<(u32, TableKey, TableEntry)> {
        let store = self.store.lock().unwrap();
        let (&id, key) = store.by_update.range(cursor.wrapping_add(1)..).next()?;
        let entry = store.by_key.get(key)?.clone();
        Some((id, key.clone(), entry))
    }

    /// Drops expired entries; returns how many were removed.
    pub fn expire_run(&self, now: Instant) -> usize {
        let mut store = self.store.lock().unwrap();
        let dead: Vec<TableKey> = store
            .by_key
            .iter()
            .filter(|(_, e)| matches!(e.expires, Some(d) if d <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &dead {
            if let Some(e) = store.by_key.remove(key) {
                store.by_update.remove(&e.update_id);
            }
        }
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StickTable {
        StickTable::new("st", KeyType::Str, 32, 8)
            .with_data(vec![DataType::HttpReqCnt, DataType::ServerId])
            .with_expire(Duration::from_secs(60))
    }

    fn key(s: &str) -> TableKey {
        TableKey::Str(s.as_bytes().to_vec())
    }

    #[test]
    fn columns_are_ordered_by_code() {
        let t = table();
        // ServerId (0) sorts before HttpReqCnt (9)
        assert_eq!(t.column(DataType::ServerId), Some(0));
        assert_eq!(t.column(DataType::HttpReqCnt), Some(1));
        assert_eq!(t.data_type_mask(), (1 << 0) | (1 << 9));
    }

    #[test]
    fn update_ids_are_monotonic() {
        let t = table();
        let now = Instant::now();
        let a = t.update(key("a"), now, |_| {}).unwrap();
        let b = t.update(key("b"), now, |_| {}).unwrap();
        assert!(b > a);
        // re-touching an entry re-registers it under a newer id
        let a2 = t.update(key("a"), now, |_| {}).unwrap();
        assert!(a2 > b);
        let (id, k, _) = t.next_after(b).unwrap();
        assert_eq!(id, a2);
        assert_eq!(k, key("a"));
    }

    #[test]
    fn full_table_refuses_new_keys() {
        let t = StickTable::new("small", KeyType::SInt, 4, 2);
        let now = Instant::now();
        assert!(t.update(TableKey::SInt(1), now, |_| {}).is_some());
        assert!(t.update(TableKey::SInt(2), now, |_| {}).is_some());
        assert!(t.update(TableKey::SInt(3), now, |_| {}).is_none());
        // existing keys still update
        assert!(t.update(TableKey::SInt(1), now, |_| {}).is_some());
    }

    #[test]
    fn learned_entries_do_not_advance_cursor() {
        let t = table();
        let now = Instant::now();
        let id = t.update(key("local"), now, |_| {}).unwrap();
        t.learn(key("remote"), t.fresh_entry(now).data, None);
        assert_eq!(t.last_update(), id);
        assert!(t.next_after(id).is_none());
        assert!(t.get(&key("remote")).is_some());
    }

    #[test]
    fn expiry_removes_entries() {
        let t = table();
        let now = Instant::now();
        t.update(key("x"), now, |_| {}).unwrap();
        assert_eq!(t.expire_run(now), 0);
        let later = now + Duration::from_secs(120);
        assert_eq!(t.expire_run(later), 1);
        assert!(t.get(&key("x")).is_none());
    }
}
