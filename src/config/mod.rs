//! The configuration root.
//!
//! Built programmatically before the runtime starts and immutable
//! afterwards. Proxies, servers, stick tables and userlists live in arenas
//! owned by [`Config`] and are addressed by index newtypes; streams and
//! expressions hold indices only, never references, which keeps the cyclic
//! proxy/server/table graph out of the ownership story. A reload swaps in
//! a whole new `Config` under a bumped epoch; handles created against the
//! old epoch refuse to resolve.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

mod table;

pub use self::table::{
    DataType, DataValue, FreqCtr, KeyType, StandardType, StickTable, TableEntry, TableKey,
};

/// Index of a proxy in the configuration arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyId(pub usize);

/// Index of a server inside its owning proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId {
    pub proxy: ProxyId,
    pub idx: usize,
}

/// Index of a stick table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(pub usize);

/// Index of a userlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserListId(pub usize);

/// Traffic mode of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Tcp,
    Http,
}

/// Capability of a proxy: whether it accepts connections, selects servers,
/// or both (a listen section).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub frontend: bool,
    pub backend: bool,
}

/// Per-proxy timeout set. `None` disables the timer.
#[derive(Debug, Clone, Default)]
pub struct Timeouts {
    pub client: Option<Duration>,
    pub server: Option<Duration>,
    pub connect: Option<Duration>,
    pub http_request: Option<Duration>,
    pub queue: Option<Duration>,
    pub tarpit: Option<Duration>,
}

/// One backend server.
#[derive(Debug)]
pub struct Server {
    pub name: String,
    pub addr: SocketAddr,
    /// Sessions currently assigned to this server.
    pub cur_sess: AtomicU32,
    /// Connection slots; 0 means unlimited.
    pub maxconn: u32,
    /// Requests waiting in this server's queue.
    pub queued: AtomicU32,
    /// Cumulated sessions, for dumps and logs.
    pub total_sess: AtomicU64,
}

impl Server {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Server {
        Server {
            name: name.into(),
            addr,
            cur_sess: AtomicU32::new(0),
            maxconn: 0,
            queued: AtomicU32::new(0),
            total_sess: AtomicU64::new(0),
        }
    }

    /// Whether a new session currently fits without queueing.
    pub fn has_free_slot(&self) -> bool {
        self.maxconn == 0 || self.cur_sess.load(Ordering::Relaxed) < self.maxconn
    }

    pub fn take_slot(&self) {
        self.cur_sess.fetch_add(1, Ordering::Relaxed);
        self.total_sess.fetch_add(1, Ordering::Relaxed);
    }

    pub fn release_slot(&self) {
        self.cur_sess.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A frontend and/or backend.
#[derive(Debug)]
pub struct Proxy {
    pub name: String,
    pub mode: Mode,
    pub caps: Capabilities,
    pub timeouts: Timeouts,
    /// Connect retries before the stream gives up.
    pub retries: u32,
    /// Allow redispatching to another server after a connect failure.
    pub redispatch: bool,
    /// Kernel splicing directives.
    pub splice_request: bool,
    pub splice_response: bool,
    pub splice_auto: bool,
    pub servers: Vec<Server>,
    /// Stick tables this proxy stores into or matches against.
    pub tables: Vec<TableId>,
    /// Connections currently accepted by this frontend.
    pub feconn: AtomicU32,
    /// Streams currently routed through this backend.
    pub beconn: AtomicU32,
    /// Cumulated connections, used by `%rt`.
    pub cum_conn: AtomicU64,
}

impl Proxy {
    pub fn new(name: impl Into<String>, mode: Mode, caps: Capabilities) -> Proxy {
        Proxy {
            name: name.into(),
            mode,
            caps,
            timeouts: Timeouts::default(),
            retries: 3,
            redispatch: false,
            splice_request: false,
            splice_response: false,
            splice_auto: false,
            servers: Vec::new(),
            tables: Vec::new(),
            feconn: AtomicU32::new(0),
            beconn: AtomicU32::new(0),
            cum_conn: AtomicU64::new(0),
        }
    }

    pub fn server(&self, id: ServerId) -> Option<&Server> {
        self.servers.get(id.idx)
    }
}

/// One user of a userlist, with a plaintext or pre-hashed password.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub password: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Default)]
pub struct UserList {
    pub name: String,
    pub users: Vec<User>,
}

/// Runtime tunables.
#[derive(Debug, Clone)]
pub struct Tune {
    /// Bound on one analyser fixed-point walk, to prevent starvation.
    pub maxpollevents: u32,
    /// Calls per second after which a stream is considered live-locked and
    /// killed. 0 disables the self-check.
    pub stream_selfcheck_rate: u32,
    /// Kernel splice pipe pool size; 0 disables splicing.
    pub maxpipes: u32,
    /// Buffers kept in the emergency reserve pool.
    pub reserved_bufs: u32,
}

impl Default for Tune {
    fn default() -> Tune {
        Tune {
            maxpollevents: 200,
            stream_selfcheck_rate: 100_000,
            maxpipes: 0,
            reserved_bufs: 2,
        }
    }
}

/// The immutable configuration root.
#[derive(Debug)]
pub struct Config {
    pub proxies: Vec<Proxy>,
    pub tables: Vec<StickTable>,
    pub userlists: Vec<UserList>,
    pub tune: Tune,
    /// Generation counter bumped on reload; handles remember theirs.
    epoch: u64,
    by_proxy_name: HashMap<String, ProxyId>,
    by_table_name: HashMap<String, TableId>,
    by_userlist_name: HashMap<String, UserListId>,
    /// Working buffers outstanding; bounded so the reserve stays intact.
    buffers_in_use: AtomicU32,
    buffer_capacity: u32,
    /// Streams parked here when no buffer could be allocated.
    buffer_wait: Mutex<Vec<std::task::Waker>>,
}

impl Config {
    pub fn builder() -> Builder {
        Builder {
            proxies: Vec::new(),
            tables: Vec::new(),
            userlists: Vec::new(),
            tune: Tune::default(),
            buffer_capacity: 1024,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn proxy(&self, id: ProxyId) -> Option<&Proxy> {
        self.proxies.get(id.0)
    }

    pub fn proxy_by_name(&self, name: &str) -> Option<ProxyId> {
        self.by_proxy_name.get(name).copied()
    }

    pub fn table(&self, id: TableId) -> Option<&StickTable> {
        self.tables.get(id.0)
    }

    pub fn table_by_name(&self, name: &str) -> Option<TableId> {
        self.by_table_name.get(name).copied()
    }

    pub fn userlist(&self, id: UserListId) -> Option<&UserList> {
        self.userlists.get(id.0)
    }

    pub fn userlist_by_name(&self, name: &str) -> Option<UserListId> {
        self.by_userlist_name.get(name).copied()
    }

    pub fn server(&self, id: ServerId) -> Option<&Server> {
        self.proxy(id.proxy).and_then(|p| p.server(id))
    }

    /// Takes one working buffer out of the bounded pool. Returns false
    /// when the pool is exhausted; the caller must park on the wait list.
    pub(crate) fn take_buffer(&self) -> bool {
        loop {
            let cur = self.buffers_in_use.load(Ordering::Acquire);
            if cur >= self.buffer_capacity {
                return false;
            }
            if self
                .buffers_in_use
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Returns a buffer to the pool and wakes one parked stream.
    pub(crate) fn release_buffer(&self) {
        self.buffers_in_use.fetch_sub(1, Ordering::AcqRel);
        let waiter = self.buffer_wait.lock().unwrap().pop();
        if let Some(w) = waiter {
            w.wake();
        }
    }

    /// Parks a stream until `release_buffer` offers a slot.
    pub(crate) fn wait_for_buffer(&self, waker: std::task::Waker) {
        self.buffer_wait.lock().unwrap().push(waker);
    }

    /// Looks up `backend/server`, or `server` against `current`.
    pub fn server_by_name(&self, spec: &str, current: Option<ProxyId>) -> Option<ServerId> {
        let (px, srv) = match spec.split_once('/') {
            Some((b, s)) => (self.proxy_by_name(b)?, s),
            None => (current?, spec),
        };
        let proxy = self.proxy(px)?;
        let idx = proxy.servers.iter().position(|s| s.name == srv)?;
        Some(ServerId { proxy: px, idx })
    }
}

/// A cheaply clonable handle pinned to one configuration epoch.
///
/// Invariant per the reload design: the configuration is not reloaded while
/// a stream holding a handle is running; `check` asserts it.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    config: Arc<Config>,
    epoch: u64,
}

impl ConfigHandle {
    pub fn new(config: Arc<Config>) -> ConfigHandle {
        let epoch = config.epoch();
        ConfigHandle { config, epoch }
    }

    /// Access the configuration, verifying the epoch still matches.
    pub fn get(&self) -> crate::Result<&Config> {
        if self.config.epoch() != self.epoch {
            return Err(crate::Error::new_config("configuration epoch changed"));
        }
        Ok(&self.config)
    }

    /// Access without the epoch check, for teardown paths that must not
    /// fail.
    pub fn get_unchecked(&self) -> &Config {
        &self.config
    }

    /// Owned access, for callers that must not keep `self` borrowed.
    pub fn get_owned(&self) -> crate::Result<Arc<Config>> {
        if self.config.epoch() != self.epoch {
            return Err(crate::Error::new_config("configuration epoch changed"));
        }
        Ok(self.config.clone())
    }
}

/// Builds a [`Config`]; the embedding application drives this at startup.
#[derive(Debug)]
pub struct Builder {
    proxies: Vec<Proxy>,
    tables: Vec<StickTable>,
    userlists: Vec<UserList>,
    tune: Tune,
    buffer_capacity: u32,
}

impl Builder {
    pub fn proxy(mut self, proxy: Proxy) -> Builder {
        self.proxies.push(proxy);
        self
    }

    pub fn table(mut self, table: StickTable) -> Builder {
        self.tables.push(table);
        self
    }

    pub fn userlist(mut self, list: UserList) -> Builder {
        self.userlists.push(list);
        self
    }

    pub fn tune(mut self, tune: Tune) -> Builder {
        self.tune = tune;
        self
    }

    /// Bounds the working-buffer pool; streams beyond it park on the
    /// wait list.
    pub fn buffer_capacity(mut self, n: u32) -> Builder {
        self.buffer_capacity = n;
        self
    }

    pub fn build(self) -> Arc<Config> {
        self.build_with_epoch(0)
    }

    /// Used by reload: the successor config carries the next epoch.
    pub fn build_with_epoch(self, epoch: u64) -> Arc<Config> {
        let by_proxy_name = self
            .proxies
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), ProxyId(i)))
            .collect();
        let by_table_name = self
            .tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), TableId(i)))
            .collect();
        let by_userlist_name = self
            .userlists
            .iter()
            .enumerate()
            .map(|(i, u)| (u.name.clone(), UserListId(i)))
            .collect();
        Arc::new(Config {
            proxies: self.proxies,
            tables: self.tables,
            userlists: self.userlists,
            tune: self.tune,
            epoch,
            by_proxy_name,
            by_table_name,
            by_userlist_name,
            buffers_in_use: AtomicU32::new(0),
            buffer_capacity: self.buffer_capacity,
            buffer_wait: Mutex::new(Vec::new()),
        })
    }
}

/// Expiry helper shared by tables and peers: remaining milliseconds until
/// `deadline`, clamped at zero.
pub(crate) fn expire_delta_ms(deadline: Option<Instant>, now: Instant) -> u32 {
    match deadline {
        Some(d) if d > now => {
            let ms = d.duration_since(now).as_millis();
            ms.min(u128::from(u32::MAX)) as u32
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:8000".parse().unwrap()
    }

    fn demo_config() -> Arc<Config> {
        let mut be = Proxy::new(
            "app",
            Mode::Http,
            Capabilities {
                frontend: false,
                backend: true,
            },
        );
        be.servers.push(Server::new("web1", addr()));
        be.servers.push(Server::new("web2", addr()));
        Config::builder()
            .proxy(Proxy::new(
                "front",
                Mode::Http,
                Capabilities {
                    frontend: true,
                    backend: false,
                },
            ))
            .proxy(be)
            .build()
    }

    #[test]
    fn name_lookups() {
        let cfg = demo_config();
        let fe = cfg.proxy_by_name("front").unwrap();
        assert!(cfg.proxy(fe).unwrap().caps.frontend);
        assert!(cfg.proxy_by_name("nope").is_none());
    }

    #[test]
    fn server_by_qualified_and_bare_name() {
        let cfg = demo_config();
        let be = cfg.proxy_by_name("app").unwrap();
        let sid = cfg.server_by_name("app/web2", None).unwrap();
        assert_eq!(sid.idx, 1);
        let bare = cfg.server_by_name("web1", Some(be)).unwrap();
        assert_eq!(bare.idx, 0);
        assert!(cfg.server_by_name("web1", None).is_none());
    }

    #[test]
    fn epoch_guard_rejects_stale_handles() {
        let cfg = demo_config();
        let handle = ConfigHandle::new(cfg);
        assert!(handle.get().is_ok());
        let stale = ConfigHandle {
            config: handle.config.clone(),
            epoch: handle.epoch + 1,
        };
        assert!(stale.get().is_err());
    }

    #[test]
    fn buffer_pool_bounds_and_wakes() {
        let cfg = Config::builder().buffer_capacity(1).build();
        assert!(cfg.take_buffer());
        assert!(!cfg.take_buffer());
        cfg.wait_for_buffer(futures_util::task::noop_waker());
        assert_eq!(cfg.buffer_wait.lock().unwrap().len(), 1);
        cfg.release_buffer();
        assert!(cfg.buffer_wait.lock().unwrap().is_empty());
        assert!(cfg.take_buffer());
    }

    #[test]
    fn server_slot_accounting() {
        let srv = Server::new("s", addr());
        assert!(srv.has_free_slot());
        srv.take_slot();
        srv.release_slot();
        assert_eq!(srv.cur_sess.load(Ordering::Relaxed), 0);
        assert_eq!(srv.total_sess.load(Ordering::Relaxed), 1);
    }
}
