//! The stream processing engine.
//!
//! A [`Stream`] is one client-to-origin exchange: two interfaces, two
//! channels, an optional HTTP transaction and the bookkeeping needed to
//! account and log it. [`Stream::process`] is the task body: it is called
//! whenever a timer fires, a channel flag changes, an I/O subscription
//! wakes the task or another task sends a wakeup message, and it runs
//! strictly single-threaded per stream.

pub mod analyser;
pub mod interface;
pub mod transaction;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::time::{Duration, Instant};

use crate::channel::{Channel, Flags, FORWARD_INFINITE};
use crate::common::scratch;
use crate::common::ticks;
use crate::config::{Config, ConfigHandle, ProxyId, ServerId, TableId, TableKey};

pub use self::analyser::{Analyser, Chain, ChainOutcome, Dir, Filter, Terminal, Verdict};
pub use self::interface::{
    ConnectProgress, Endpoint, EndpointIo, EndpointKind, SiErr, SiFlags, SiState,
    StreamInterface,
};
pub use self::transaction::{Cause, Finst, Transaction};

/// Stream flag word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StreamFlags(pub(crate) u32);

impl StreamFlags {
    pub const NONE: StreamFlags = StreamFlags(0);
    /// A backend was selected for this stream.
    pub const BE_ASSIGNED: StreamFlags = StreamFlags(1 << 0);
    /// The target server was imposed (persistence, directive).
    pub const DIRECT: StreamFlags = StreamFlags(1 << 1);
    /// A server has been assigned.
    pub const ASSIGNED: StreamFlags = StreamFlags(1 << 2);
    /// The stream may be redispatched to another server.
    pub const REDIRECTABLE: StreamFlags = StreamFlags(1 << 3);
    /// A server connection slot is held and must be released.
    pub const CURR_SESS: StreamFlags = StreamFlags(1 << 4);
    /// Monitoring probe; excluded from stats and logs.
    pub const MONITOR: StreamFlags = StreamFlags(1 << 5);
    /// The channels carry structured HTX messages, not raw bytes.
    pub const HTX: StreamFlags = StreamFlags(1 << 6);
    /// A redispatch was decided after a connect failure.
    pub const REDISP: StreamFlags = StreamFlags(1 << 7);

    #[inline]
    pub fn contains(self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: StreamFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: StreamFlags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for StreamFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamFlags({:#x})", self.0)
    }
}

/// Why the task body was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake(u32);

impl Wake {
    pub const TIMER: Wake = Wake(1 << 0);
    pub const IO: Wake = Wake(1 << 1);
    pub const MSG: Wake = Wake(1 << 2);

    pub fn is_timer_only(self) -> bool {
        self.0 == Wake::TIMER.0
    }
}

impl std::ops::BitOr for Wake {
    type Output = Wake;
    fn bitor(self, rhs: Wake) -> Wake {
        Wake(self.0 | rhs.0)
    }
}

/// The originating client connection, shared between the streams it
/// multiplexes.
#[derive(Debug)]
pub struct Session {
    pub frontend: ProxyId,
    pub client_addr: SocketAddr,
    pub accept_date: SystemTime,
    pub accept_instant: Instant,
}

/// Result of a load-balancing assignment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assign {
    /// A server was chosen.
    Server(ServerId),
    /// All slots busy; the stream was put on a queue.
    Queue,
    /// The backend cannot take this stream at all.
    Refuse,
}

/// The hooks a backend's load-balancing layer exposes. Algorithm details
/// are out of scope; only these three operations are relied upon.
pub trait Balancer: Send {
    fn assign(&mut self, cfg: &Config, backend: ProxyId) -> Assign;

    /// Called when the stream abandons a queue slot.
    fn dequeue(&mut self, cfg: &Config, backend: ProxyId);
}

/// Creates server-side endpoints.
pub trait Connector: Send {
    fn connect(&mut self, cfg: &Config, server: ServerId) -> crate::Result<Box<dyn Endpoint>>;
}

/// Milestone clocks latched as the stream progresses. Getters render the
/// log timers: `-1` means the milestone was never reached.
#[derive(Debug, Clone)]
pub struct Timers {
    pub accept: Instant,
    pub request: Option<Instant>,
    pub queue_start: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_done: Option<Instant>,
    pub first_response: Option<Instant>,
    pub closed: Option<Instant>,
}

impl Timers {
    fn new(accept: Instant) -> Timers {
        Timers {
            accept,
            request: None,
            queue_start: None,
            connect_start: None,
            connect_done: None,
            first_response: None,
            closed: None,
        }
    }

    fn delta_ms(from: Option<Instant>, to: Option<Instant>) -> i64 {
        match (from, to) {
            (Some(a), Some(b)) if b >= a => b.duration_since(a).as_millis() as i64,
            _ => -1,
        }
    }

    /// Time to receive the full request (`%TR`).
    pub fn t_request(&self) -> i64 {
        Timers::delta_ms(Some(self.accept), self.request)
    }

    /// Time spent queued (`%Tw`).
    pub fn t_queue(&self) -> i64 {
        Timers::delta_ms(self.queue_start, self.connect_start)
    }

    /// Connect establishment time (`%Tc`).
    pub fn t_connect(&self) -> i64 {
        Timers::delta_ms(self.connect_start, self.connect_done)
    }

    /// Server response time (`%Tr`).
    pub fn t_response(&self) -> i64 {
        Timers::delta_ms(self.connect_done, self.first_response)
    }

    /// Active time (`%Ta`): request received to close.
    pub fn t_active(&self) -> i64 {
        Timers::delta_ms(self.request.or(Some(self.accept)), self.closed)
    }

    /// Total time (`%Tt`).
    pub fn t_total(&self) -> i64 {
        Timers::delta_ms(Some(self.accept), self.closed)
    }
}

/// Counts task invocations per second; two consecutive over-threshold
/// seconds trip the live-lock self-check.
#[derive(Debug)]
struct CallRate {
    window: Instant,
    calls: u32,
    prev_over: bool,
}

impl CallRate {
    fn new(now: Instant) -> CallRate {
        CallRate {
            window: now,
            calls: 0,
            prev_over: false,
        }
    }

    fn tick(&mut self, now: Instant, threshold: u32) -> bool {
        if threshold == 0 {
            return false;
        }
        if now.duration_since(self.window) >= Duration::from_secs(1) {
            let over = self.calls > threshold;
            if over && self.prev_over {
                return true;
            }
            self.prev_over = over;
            self.window = now;
            self.calls = 0;
        }
        self.calls += 1;
        false
    }
}

/// What the scheduler should do with the task after one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Run again at the given deadline; `None` means wait for I/O only.
    Reschedule(Option<Instant>),
    /// No working buffer could be allocated; park on the buffer wait
    /// list until one is released.
    WaitBuffer,
    /// Both sides are closed and accounting is done; free the stream.
    Destroy,
}

/// Upper bound on staged store-request/store-response rules.
const STORE_SLOTS: usize = 8;

/// One proxied exchange.
pub struct Stream {
    cfg: ConfigHandle,
    pub session: Arc<Session>,
    pub frontend: ProxyId,
    pub backend: Option<ProxyId>,
    pub target: Option<ServerId>,
    pub flags: StreamFlags,
    pub req: Channel,
    pub res: Channel,
    pub si_f: StreamInterface,
    pub si_b: StreamInterface,
    pub txn: Option<Transaction>,
    pub cause: Cause,
    pub finst: Finst,
    /// Scheduling priority: (class, offset).
    pub priority: (i16, i32),
    pub timers: Timers,
    /// Unique id rendered by `%ID` when configured.
    pub unique_id: Option<String>,
    /// Frontend connection counter value at accept, for `%rt`.
    pub request_counter: u64,
    /// Pending stick-table stores, applied by the store-rules analyser.
    store_slots: Vec<(TableId, TableKey)>,
    req_chain: Chain,
    res_chain: Chain,
    filters: Vec<Box<dyn Filter>>,
    balancer: Box<dyn Balancer>,
    connector: Box<dyn Connector>,
    /// Response analysers armed when the server connection establishes.
    res_analysers_on_connect: u32,
    call_rate: CallRate,
    res_buf_held: bool,
    accounted: bool,
}

impl Stream {
    /// Creates a stream on a freshly accepted client endpoint.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ConfigHandle,
        session: Arc<Session>,
        client: Box<dyn Endpoint>,
        balancer: Box<dyn Balancer>,
        connector: Box<dyn Connector>,
        now: Instant,
    ) -> crate::Result<Stream> {
        let frontend = session.frontend;
        let config = cfg.get()?;
        let fe = config
            .proxy(frontend)
            .ok_or_else(|| crate::Error::new_config("unknown frontend"))?;
        fe.feconn.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let request_counter = fe
            .cum_conn
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let retries = fe.retries;
        let mut req = Channel::new();
        let mut res = Channel::new();
        req.rto = fe.timeouts.client;
        res.wto = fe.timeouts.client;
        req.rearm_read(now);
        req.flags.insert(Flags::READ_ATTACHED);
        res.flags.insert(Flags::AUTO_CLOSE);
        Ok(Stream {
            cfg,
            session,
            frontend,
            backend: None,
            target: None,
            flags: StreamFlags::NONE,
            req,
            res,
            si_f: StreamInterface::new_front(client),
            si_b: StreamInterface::new_back(retries),
            txn: None,
            cause: Cause::None,
            finst: Finst::None,
            priority: (0, 0),
            timers: Timers::new(now),
            unique_id: None,
            request_counter,
            store_slots: Vec::new(),
            req_chain: Chain::new(),
            res_chain: Chain::new(),
            filters: Vec::new(),
            balancer,
            connector,
            res_analysers_on_connect: 0,
            call_rate: CallRate::new(now),
            res_buf_held: false,
            accounted: false,
        })
    }

    pub fn set_chains(&mut self, req_chain: Chain, res_chain: Chain) {
        self.req_chain = req_chain;
        self.res_chain = res_chain;
    }

    pub fn add_filter(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Arms the response analyser set inherited from frontend + backend,
    /// applied once the server connection establishes.
    pub fn set_response_analysers(&mut self, mask: u32) {
        self.res_analysers_on_connect = mask;
    }

    /// Selects the backend. Re-runs of the switching rules may only do
    /// this once per stream.
    pub fn set_backend(&mut self, backend: ProxyId) -> crate::Result<()> {
        let config = self.cfg.get()?;
        let be = config
            .proxy(backend)
            .ok_or_else(|| crate::Error::new_config("unknown backend"))?;
        if !self.flags.contains(StreamFlags::BE_ASSIGNED) {
            be.beconn.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.flags.insert(StreamFlags::BE_ASSIGNED);
        }
        self.backend = Some(backend);
        self.si_b.retries = be.retries;
        self.req.wto = be.timeouts.server;
        self.res.rto = be.timeouts.server;
        Ok(())
    }

    /// Stages a store-rule for the store-rules analyser; silently dropped
    /// beyond the slot bound.
    pub fn stage_store(&mut self, table: TableId, key: TableKey) {
        if self.store_slots.len() < STORE_SLOTS {
            self.store_slots.push((table, key));
        }
    }

    pub fn staged_stores(&mut self) -> Vec<(TableId, TableKey)> {
        std::mem::take(&mut self.store_slots)
    }

    fn set_term_codes(&mut self, cause: Cause, finst: Finst) {
        if self.cause == Cause::None {
            self.cause = cause;
        }
        if self.finst == Finst::None {
            self.finst = finst;
        }
    }

    /// The log termination field for this stream.
    pub fn termination(&self) -> [char; 2] {
        transaction::termination_field(self.cause, self.finst)
    }

    /// The task body. See the module doc for the wake-up contract.
    pub fn process(&mut self, now: Instant, wake: Wake) -> Outcome {
        scratch::reset();

        // live-lock self-check
        let threshold = self
            .cfg
            .get_unchecked()
            .tune
            .stream_selfcheck_rate;
        if self.call_rate.tick(now, threshold) {
            tracing::error!(stream = ?self, "call rate exceeded, killing stream");
            self.set_term_codes(Cause::Internal, Finst::None);
            self.si_f.close();
            self.si_b.close();
            return self.reconcile(now);
        }

        // transient flags never survive a wake-up
        self.req.flags.remove(Flags::READ_NOEXP | Flags::WAKE_WRITE);
        self.res.flags.remove(Flags::READ_NOEXP | Flags::WAKE_WRITE);

        // ingress drain
        self.si_f.sync_recv(&mut self.req);
        self.si_b.sync_recv(&mut self.res);
        if self.res.total > 0 && self.timers.first_response.is_none() {
            self.timers.first_response = Some(now);
        }

        // timeout expansion
        let mut fired = self.req.check_timeouts(now);
        fired |= self.res.check_timeouts(now);
        if ticks::expired(self.si_b.exp, now) {
            self.si_b.flags.insert(SiFlags::EXP);
            self.si_b.exp = None;
            fired = true;
        }
        if wake.is_timer_only() && !fired {
            // stale timer, nothing actually expired
            return Outcome::Reschedule(self.next_expiry());
        }

        // response buffer guarantee
        if !self.res_buf_held {
            if self.cfg.get_unchecked().take_buffer() {
                self.res_buf_held = true;
            } else {
                return Outcome::WaitBuffer;
            }
        }

        // low-level error escalation, unless analysers still want a say
        for (si, chan, cause) in [
            (&mut self.si_f, &mut self.req, Cause::CliCl),
            (&mut self.si_b, &mut self.res, Cause::SrvCl),
        ] {
            if si.flags.contains(SiFlags::ERR)
                && matches!(si.state, SiState::Est | SiState::Dis)
                && chan.analysers == 0
            {
                chan.shutr();
                chan.shutw();
                if self.cause == Cause::None {
                    self.cause = cause;
                }
            }
        }

        self.backend_progression(now);

        if let Err(term) = self.run_analyser_loops() {
            self.set_term_codes(term.cause, term.finst);
            self.req.abort();
            self.res.abort();
        }

        self.propagate_unclaimed_errors();
        self.enable_tunnel_mode();

        // egress
        self.si_b.sync_send(&mut self.req);
        self.si_f.sync_send(&mut self.res);

        self.propagate_shutdowns();

        self.si_f.ack_state();
        self.si_b.ack_state();

        if self.si_f.state == SiState::Clo
            && matches!(self.si_b.state, SiState::Ini | SiState::Clo)
        {
            return self.reconcile(now);
        }
        if self.si_b.state == SiState::Clo && self.si_f.state == SiState::Clo {
            return self.reconcile(now);
        }

        Outcome::Reschedule(self.next_expiry())
    }

    /// Server-side state ladder: REQ → ASS → CON → RDY → EST, with CER
    /// handling retries and redispatch.
    fn backend_progression(&mut self, now: Instant) {
        use SiState::*;

        // a fresh stream starts connecting once a backend is known and
        // the request side has something to push or finished analysing
        if self.si_b.state == Ini
            && self.flags.contains(StreamFlags::BE_ASSIGNED)
            && (!self.req.is_empty() || self.req.analysers == 0)
        {
            self.si_b.set_state(Req);
        }

        let backend = match self.backend {
            Some(b) => b,
            None => return,
        };
        let config = match self.cfg.get_owned() {
            Ok(c) => c,
            Err(_) => return,
        };
        let config = &*config;

        match self.si_b.state {
            Req => match self.balancer.assign(config, backend) {
                Assign::Server(srv) => {
                    self.target = Some(srv);
                    self.flags.insert(StreamFlags::ASSIGNED);
                    if let Some(s) = config.server(srv) {
                        s.take_slot();
                        self.flags.insert(StreamFlags::CURR_SESS);
                    }
                    self.si_b.set_state(Ass);
                }
                Assign::Queue => {
                    self.timers.queue_start.get_or_insert(now);
                    let be = config.proxy(backend).expect("backend resolved");
                    self.si_b.exp = ticks::arm(now, be.timeouts.queue);
                    self.si_b.set_state(Que);
                }
                Assign::Refuse => {
                    self.set_term_codes(Cause::PrxCond, Finst::Queue);
                    self.si_b.close();
                    self.req.abort();
                    self.res.abort();
                }
            },
            Que => {
                if self.si_b.flags.contains(SiFlags::EXP) {
                    self.balancer.dequeue(config, backend);
                    self.set_term_codes(Cause::SrvTo, Finst::Queue);
                    self.si_b.close();
                    self.req.abort();
                    self.res.abort();
                } else if let Assign::Server(srv) = self.balancer.assign(config, backend) {
                    self.target = Some(srv);
                    self.flags.insert(StreamFlags::ASSIGNED);
                    if let Some(s) = config.server(srv) {
                        s.take_slot();
                        self.flags.insert(StreamFlags::CURR_SESS);
                    }
                    self.si_b.set_state(Ass);
                }
            }
            Tar => {
                if self.si_b.flags.contains(SiFlags::EXP) {
                    self.si_b.flags.remove(SiFlags::EXP);
                    self.si_b.set_state(if self.flags.contains(StreamFlags::REDISP) {
                        Req
                    } else {
                        Ass
                    });
                }
            }
            _ => {}
        }

        if self.si_b.state == Ass {
            let srv = self.target.expect("ASS implies a target");
            self.timers.connect_start.get_or_insert(now);
            match self.connector.connect(config, srv) {
                Ok(ep) => {
                    self.si_b.attach(ep);
                    let be = config.proxy(backend).expect("backend resolved");
                    self.si_b.exp = ticks::arm(now, be.timeouts.connect);
                    self.si_b.set_state(Con);
                }
                Err(_) => {
                    self.si_b.err_type = SiErr::Resource;
                    self.si_b.set_state(Cer);
                }
            }
        }

        if matches!(self.si_b.state, Con | Rdy) {
            if self.si_b.flags.contains(SiFlags::EXP) {
                self.si_b.flags.remove(SiFlags::EXP);
                self.si_b.err_type = SiErr::ConnTo;
                self.si_b.release();
                self.si_b.set_state(Cer);
            } else {
                let progress = self
                    .si_b
                    .endpoint()
                    .map(|e| e.connect_progress())
                    .unwrap_or(ConnectProgress::Failed);
                match progress {
                    ConnectProgress::InProgress => {}
                    ConnectProgress::Connected => {
                        if self.si_b.state == Con {
                            self.si_b.set_state(Rdy);
                        }
                        // give up instead of establishing onto an
                        // aborting client that never sent a byte
                        if self
                            .req
                            .flags
                            .intersects(Flags::SHUTR | Flags::SHUTW_NOW)
                            && self.req.is_empty()
                            && self.req.total == 0
                        {
                            self.si_b.err_type = SiErr::ConnAbrt;
                            self.si_b.release();
                            self.si_b.set_state(Cer);
                        } else {
                            self.establish(now);
                        }
                    }
                    ConnectProgress::Failed => {
                        self.si_b.err_type = SiErr::ConnErr;
                        self.si_b.release();
                        self.si_b.set_state(Cer);
                    }
                }
            }
        }

        if self.si_b.state == Cer {
            self.handle_connect_error(now, config.proxy(backend).map(|b| b.redispatch).unwrap_or(false), config);
        }
    }

    fn establish(&mut self, now: Instant) {
        self.timers.connect_done = Some(now);
        self.si_b.exp = None;
        self.si_b.set_state(SiState::Est);
        self.res.flags.insert(Flags::READ_ATTACHED);
        self.res.analysers |= self.res_analysers_on_connect;
        self.res.rearm_read(now);
        self.req.rearm_write(now);
        tracing::debug!(target: "stream", "server connection established");
    }

    fn handle_connect_error(&mut self, now: Instant, redispatch: bool, config: &Config) {
        if self.si_b.retries == 0 {
            let cause = match self.si_b.err_type {
                SiErr::ConnTo => Cause::SrvTo,
                SiErr::ConnAbrt => Cause::CliCl,
                SiErr::Resource => Cause::Resource,
                _ => Cause::SrvCl,
            };
            self.set_term_codes(cause, Finst::Connect);
            self.si_b.close();
            self.req.abort();
            self.res.abort();
            return;
        }
        self.si_b.retries -= 1;
        if redispatch {
            // abandon the server, its slot goes back with it
            if self.flags.contains(StreamFlags::CURR_SESS) {
                if let Some(s) = self.target.and_then(|t| config.server(t)) {
                    s.release_slot();
                }
                self.flags.remove(StreamFlags::CURR_SESS);
            }
            self.flags.insert(StreamFlags::REDISP);
            self.flags.remove(StreamFlags::ASSIGNED);
            self.target = None;
        }
        // wait before hammering the same server again
        let connect_to = self
            .backend
            .and_then(|b| config.proxy(b))
            .and_then(|b| b.timeouts.connect)
            .unwrap_or(Duration::from_secs(1));
        let backoff = connect_to.min(Duration::from_secs(1));
        self.si_b.exp = Some(now + backoff);
        self.si_b.set_state(SiState::Tar);
    }

    /// Runs both analyser chains until neither direction's trigger flags
    /// change any more.
    fn run_analyser_loops(&mut self) -> Result<(), Terminal> {
        let max = self.cfg.get_unchecked().tune.maxpollevents;
        for _ in 0..2 {
            loop {
                let before = self.req.flags;
                if self.req.analysers & self.req_chain.mask() != 0 {
                    analyser::run_chain(
                        &mut self.req_chain,
                        &mut self.filters,
                        Dir::Request,
                        &mut self.req,
                        &mut self.res,
                        &mut self.txn,
                        max,
                    )?;
                }
                self.req.flags.remove(Flags::READ_PARTIAL | Flags::WRITE_PARTIAL | Flags::WAKE_ONCE);
                if (before.0 ^ self.req.flags.0) & Flags::MASK_ANALYSER.0 == 0 {
                    break;
                }
            }
            loop {
                let before = self.res.flags;
                if self.res.analysers & self.res_chain.mask() != 0 {
                    analyser::run_chain(
                        &mut self.res_chain,
                        &mut self.filters,
                        Dir::Response,
                        &mut self.res,
                        &mut self.req,
                        &mut self.txn,
                        max,
                    )?;
                }
                self.res.flags.remove(Flags::READ_PARTIAL | Flags::WRITE_PARTIAL | Flags::WAKE_ONCE);
                if (before.0 ^ self.res.flags.0) & Flags::MASK_ANALYSER.0 == 0 {
                    break;
                }
            }
            // a request analyser may have re-armed response analysers or
            // vice versa; one more pass settles it
        }
        Ok(())
    }

    /// Assigns default cause/finst to bare channel errors no analyser
    /// claimed.
    fn propagate_unclaimed_errors(&mut self) {
        if self.cause == Cause::None {
            if self.req.flags.intersects(Flags::READ_ERROR) {
                self.cause = Cause::CliCl;
            } else if self.req.flags.intersects(Flags::READ_TIMEOUT) {
                self.cause = Cause::CliTo;
            } else if self.res.flags.intersects(Flags::READ_ERROR) {
                self.cause = Cause::SrvCl;
            } else if self.res.flags.intersects(Flags::READ_TIMEOUT) {
                self.cause = Cause::SrvTo;
            }
        }
        if self.cause != Cause::None && self.finst == Finst::None {
            self.finst = match self.si_b.state {
                SiState::Ini | SiState::Req => Finst::Request,
                SiState::Que => Finst::Queue,
                SiState::Tar => Finst::Tarpit,
                SiState::Ass | SiState::Con | SiState::Rdy | SiState::Cer => Finst::Connect,
                SiState::Est | SiState::Dis | SiState::Clo => {
                    if self.timers.first_response.is_none() {
                        Finst::Headers
                    } else {
                        Finst::Data
                    }
                }
            };
        }
        // a request abort before any server work tears the whole thing
        if self.req.flags.contains(Flags::SHUTR)
            && self.req.flags.intersects(Flags::READ_ERROR | Flags::READ_TIMEOUT)
            && self.si_b.state == SiState::Ini
        {
            self.si_b.set_state(SiState::Clo);
            self.req.abort();
        }
    }

    /// Switches fully-analysed directions to tunnel mode and considers
    /// kernel splicing.
    fn enable_tunnel_mode(&mut self) {
        let cfg = self.cfg.get_unchecked();
        if self.req.analysers == 0 && self.si_b.state.is_established() {
            self.req.forward(FORWARD_INFINITE);
            if self.splice_wanted(cfg, true) {
                self.req.flags.insert(Flags::KERN_SPLICING);
            }
        }
        if self.res.analysers == 0 && self.si_b.state.is_established() {
            self.res.forward(FORWARD_INFINITE);
            if self.splice_wanted(cfg, false) {
                self.res.flags.insert(Flags::KERN_SPLICING);
            }
        }
    }

    fn splice_wanted(&self, cfg: &Config, request: bool) -> bool {
        if cfg.tune.maxpipes == 0 {
            return false;
        }
        let (rcv, snd) = if request {
            (
                self.si_f.endpoint().map(|e| e.rcv_pipe()).unwrap_or(false),
                self.si_b.endpoint().map(|e| e.snd_pipe()).unwrap_or(false),
            )
        } else {
            (
                self.si_b.endpoint().map(|e| e.rcv_pipe()).unwrap_or(false),
                self.si_f.endpoint().map(|e| e.snd_pipe()).unwrap_or(false),
            )
        };
        if !rcv || !snd {
            return false;
        }
        let px = self
            .backend
            .and_then(|b| cfg.proxy(b))
            .or_else(|| cfg.proxy(self.frontend));
        let px = match px {
            Some(p) => p,
            None => return false,
        };
        let directive = if request {
            px.splice_request
        } else {
            px.splice_response
        };
        let chan = if request { &self.req } else { &self.res };
        directive || (px.splice_auto && chan.flags.contains(Flags::STREAMER_FAST))
    }

    /// Cross-propagates shutdowns between the four half-closes.
    fn propagate_shutdowns(&mut self) {
        // immediate read closes requested by analysers or aborts
        if self.req.flags.contains(Flags::SHUTR_NOW) && !self.req.flags.contains(Flags::SHUTR)
        {
            self.req.shutr();
        }
        if self.res.flags.contains(Flags::SHUTR_NOW) && !self.res.flags.contains(Flags::SHUTR)
        {
            self.res.shutr();
        }
        // client finished sending and everything was analysed: close the
        // server write side once drained
        if self.req.flags.contains(Flags::SHUTR)
            && !self.req.flags.contains(Flags::SHUTW)
            && self.req.analysers == 0
        {
            self.req.shutw_now();
        }
        if self.req.shutw_pending() {
            let nolinger = self.req.flags.intersects(Flags::READ_ERROR);
            self.si_b.shutw(nolinger);
            self.req.shutw();
        }
        // server finished responding: reflect onto the client
        if self.res.flags.contains(Flags::SHUTR)
            && !self.res.flags.contains(Flags::SHUTW)
            && self.res.analysers == 0
        {
            self.res.shutw_now();
        }
        if self.res.shutw_pending() {
            let nolinger = self.res.flags.intersects(Flags::READ_ERROR);
            self.si_f.shutw(nolinger);
            self.res.shutw();
        }
        // both directions of the server done: fully close its interface
        if self.req.flags.contains(Flags::SHUTW) && self.res.flags.contains(Flags::SHUTR) {
            self.si_b.shutr();
            if matches!(self.si_b.state, SiState::Dis) || self.si_b.state.is_connecting() {
                self.si_b.set_state(SiState::Clo);
            }
        }
        // both directions of the client done
        if self.res.flags.contains(Flags::SHUTW) && self.req.flags.contains(Flags::SHUTR) {
            self.si_f.shutr();
            if self.si_f.state == SiState::Dis {
                self.si_f.set_state(SiState::Clo);
            }
        }
        // an aborted request with an unused server side closes it too
        if self.req.flags.contains(Flags::SHUTR)
            && self.req.flags.contains(Flags::SHUTW)
            && matches!(self.si_b.state, SiState::Ini)
        {
            self.si_b.set_state(SiState::Clo);
        }
    }

    /// Final accounting: decrement every counter exactly once, release
    /// endpoints and the working buffer.
    fn reconcile(&mut self, now: Instant) -> Outcome {
        if !self.accounted {
            self.accounted = true;
            self.timers.closed = Some(now);
            let config = self.cfg.get_unchecked();
            if let Some(fe) = config.proxy(self.frontend) {
                fe.feconn.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            }
            if self.flags.contains(StreamFlags::BE_ASSIGNED) {
                if let Some(be) = self.backend.and_then(|b| config.proxy(b)) {
                    be.beconn.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
            if self.flags.contains(StreamFlags::CURR_SESS) {
                if let Some(s) = self.target.and_then(|t| config.server(t)) {
                    s.release_slot();
                }
            }
            if self.res_buf_held {
                config.release_buffer();
                self.res_buf_held = false;
            }
            self.si_f.release();
            self.si_b.release();
        }
        Outcome::Destroy
    }

    /// Minimum of every armed timer, the task's next deadline.
    fn next_expiry(&self) -> Option<Instant> {
        ticks::first(
            ticks::first(self.req.next_expiry(), self.res.next_expiry()),
            self.si_b.exp,
        )
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("frontend", &self.frontend)
            .field("backend", &self.backend)
            .field("flags", &self.flags)
            .field("si_f", &self.si_f.state.name())
            .field("si_b", &self.si_b.state.name())
            .field("term", &self.termination())
            .finish()
    }
}

pin_project_lite::pin_project! {
    /// The future driving one stream to completion on the runtime.
    ///
    /// Each poll runs the task body once; the outcome decides whether to
    /// arm a timer, park on the buffer wait list, or finish.
    pub struct StreamTask {
        stream: Stream,
        #[pin]
        sleep: Option<tokio::time::Sleep>,
        wake: Wake,
    }
}

impl StreamTask {
    pub fn new(stream: Stream) -> StreamTask {
        StreamTask {
            stream,
            sleep: None,
            wake: Wake::IO,
        }
    }
}

impl fmt::Debug for StreamTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTask")
            .field("stream", &self.stream)
            .finish()
    }
}

impl Future for StreamTask {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        let mut this = self.project();
        loop {
            let now = Instant::now();
            // a fired timer upgrades the wake reason for this pass
            let mut wake = *this.wake;
            if let Some(sleep) = this.sleep.as_mut().as_pin_mut() {
                if sleep.poll(cx).is_ready() {
                    wake = wake | Wake::TIMER;
                    this.sleep.set(None);
                }
            }
            *this.wake = Wake::IO;
            match this.stream.process(now, wake) {
                Outcome::Destroy => return std::task::Poll::Ready(()),
                Outcome::WaitBuffer => {
                    this.stream
                        .cfg
                        .get_unchecked()
                        .wait_for_buffer(cx.waker().clone());
                    return std::task::Poll::Pending;
                }
                Outcome::Reschedule(deadline) => {
                    match deadline {
                        Some(d) => {
                            this.sleep.set(Some(tokio::time::sleep_until(d)));
                            let due = match this.sleep.as_mut().as_pin_mut() {
                                Some(sleep) => sleep.poll(cx).is_ready(),
                                None => false,
                            };
                            if due {
                                // already expired, run another pass
                                *this.wake = Wake::IO | Wake::TIMER;
                                this.sleep.set(None);
                                continue;
                            }
                        }
                        None => this.sleep.set(None),
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::interface::test_support::MockEndpoint;
    use super::*;
    use crate::config::{Capabilities, Mode, Proxy, Server};
    use std::sync::atomic::Ordering;

    #[derive(Debug)]
    struct FirstServer;

    impl Balancer for FirstServer {
        fn assign(&mut self, cfg: &Config, backend: ProxyId) -> Assign {
            let be = cfg.proxy(backend).unwrap();
            match be.servers.iter().position(|s| s.has_free_slot()) {
                Some(idx) => Assign::Server(ServerId { proxy: backend, idx }),
                None => Assign::Queue,
            }
        }
        fn dequeue(&mut self, _cfg: &Config, _backend: ProxyId) {}
    }

    /// Scripted connector: each connect attempt pops the next outcome.
    struct ScriptedConnector {
        outcomes: std::collections::VecDeque<ConnectProgress>,
        server_input: Vec<Vec<u8>>,
        pub attempts: std::sync::Arc<std::sync::atomic::AtomicU32>,
    }

    impl Connector for ScriptedConnector {
        fn connect(
            &mut self,
            _cfg: &Config,
            _server: ServerId,
        ) -> crate::Result<Box<dyn Endpoint>> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let progress = self
                .outcomes
                .pop_front()
                .unwrap_or(ConnectProgress::Connected);
            let mut ep = ScriptedServer {
                inner: MockEndpoint::default(),
                progress,
            };
            for chunk in &self.server_input {
                ep.inner.input.push_back(chunk.clone());
            }
            // the scripted origin closes once its payload is served
            ep.inner.closed_in = true;
            Ok(Box::new(ep))
        }
    }

    #[derive(Debug)]
    struct ScriptedServer {
        inner: MockEndpoint,
        progress: ConnectProgress,
    }

    impl Endpoint for ScriptedServer {
        fn kind(&self) -> EndpointKind {
            EndpointKind::Connection
        }
        fn connect_progress(&self) -> ConnectProgress {
            self.progress
        }
        fn recv(&mut self, ch: &mut Channel) -> EndpointIo {
            self.inner.recv(ch)
        }
        fn send(&mut self, ch: &mut Channel) -> EndpointIo {
            self.inner.send(ch)
        }
        fn shutw(&mut self, nolinger: bool) {
            self.inner.shutw(nolinger)
        }
        fn shutr(&mut self) {
            self.inner.shutr()
        }
        fn show(&self) -> String {
            "scripted".into()
        }
    }

    fn test_config() -> std::sync::Arc<Config> {
        let mut be = Proxy::new(
            "app",
            Mode::Tcp,
            Capabilities {
                frontend: false,
                backend: true,
            },
        );
        be.servers.push(Server::new("s1", "127.0.0.1:9000".parse().unwrap()));
        be.timeouts.connect = Some(Duration::from_secs(2));
        Config::builder()
            .proxy(Proxy::new(
                "front",
                Mode::Tcp,
                Capabilities {
                    frontend: true,
                    backend: false,
                },
            ))
            .proxy(be)
            .build()
    }

    fn make_stream(
        cfg: std::sync::Arc<Config>,
        client: MockEndpoint,
        outcomes: Vec<ConnectProgress>,
        server_input: Vec<Vec<u8>>,
    ) -> (Stream, std::sync::Arc<std::sync::atomic::AtomicU32>) {
        let now = Instant::now();
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let session = std::sync::Arc::new(Session {
            frontend: cfg.proxy_by_name("front").unwrap(),
            client_addr: "10.0.0.1:40000".parse().unwrap(),
            accept_date: SystemTime::now(),
            accept_instant: now,
        });
        let connector = ScriptedConnector {
            outcomes: outcomes.into(),
            server_input,
            attempts: attempts.clone(),
        };
        let mut stream = Stream::new(
            ConfigHandle::new(cfg.clone()),
            session,
            Box::new(client),
            Box::new(FirstServer),
            Box::new(connector),
            now,
        )
        .unwrap();
        stream.set_backend(cfg.proxy_by_name("app").unwrap()).unwrap();
        (stream, attempts)
    }

    #[test]
    fn happy_path_proxies_both_directions() {
        let cfg = test_config();
        let mut client = MockEndpoint::default();
        client.input.push_back(b"ping".to_vec());
        client.closed_in = true;
        let (mut stream, _) = make_stream(
            cfg.clone(),
            client,
            vec![ConnectProgress::Connected],
            vec![b"pong".to_vec()],
        );
        let now = Instant::now();
        let mut outcome = stream.process(now, Wake::IO);
        for _ in 0..8 {
            if outcome == Outcome::Destroy {
                break;
            }
            outcome = stream.process(now, Wake::IO);
        }
        assert_eq!(outcome, Outcome::Destroy);
        assert_eq!(stream.termination(), ['-', '-']);
        let fe = cfg.proxy(cfg.proxy_by_name("front").unwrap()).unwrap();
        let be = cfg.proxy(cfg.proxy_by_name("app").unwrap()).unwrap();
        assert_eq!(fe.feconn.load(Ordering::Relaxed), 0);
        assert_eq!(be.beconn.load(Ordering::Relaxed), 0);
        assert_eq!(be.servers[0].cur_sess.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn connect_failure_retries_after_backoff() {
        let cfg = test_config();
        let mut client = MockEndpoint::default();
        client.input.push_back(b"hello".to_vec());
        let (mut stream, attempts) = make_stream(
            cfg,
            client,
            vec![ConnectProgress::Failed, ConnectProgress::Connected],
            vec![],
        );
        let now = Instant::now();
        stream.process(now, Wake::IO);
        assert_eq!(stream.si_b.state, SiState::Tar);
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
        // back-off must be at most one second
        let exp = stream.si_b.exp.expect("turn-around timer armed");
        assert!(exp <= now + Duration::from_secs(1));
        // after the turn-around the connect is retried and succeeds
        let later = now + Duration::from_secs(1);
        stream.si_b.flags.insert(SiFlags::EXP);
        stream.process(later, Wake::TIMER | Wake::IO);
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        assert!(stream.si_b.state.is_established());
    }

    #[test]
    fn retries_exhausted_closes_with_server_cause() {
        let cfg = test_config();
        let client = MockEndpoint::default();
        let (mut stream, attempts) = make_stream(
            cfg,
            client,
            vec![
                ConnectProgress::Failed,
                ConnectProgress::Failed,
                ConnectProgress::Failed,
                ConnectProgress::Failed,
            ],
            vec![],
        );
        stream.si_b.retries = 1;
        let mut now = Instant::now();
        let mut outcome = stream.process(now, Wake::IO);
        for _ in 0..10 {
            if outcome == Outcome::Destroy {
                break;
            }
            now += Duration::from_secs(1);
            stream.si_b.flags.insert(SiFlags::EXP);
            outcome = stream.process(now, Wake::TIMER | Wake::IO);
        }
        assert_eq!(outcome, Outcome::Destroy);
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        assert_eq!(stream.cause, Cause::SrvCl);
        assert_eq!(stream.finst, Finst::Connect);
        assert_eq!(stream.termination(), ['S', 'C']);
    }

    #[test]
    fn client_timeout_sets_cli_to() {
        let cfg = test_config();
        let client = MockEndpoint::default();
        let (mut stream, _) = make_stream(cfg, client, vec![], vec![]);
        // pretend analysers are waiting on a full request
        stream.req.analysers = analyser::req::WAIT_HTTP;
        stream.req.rto = Some(Duration::from_millis(10));
        let now = Instant::now();
        stream.req.rearm_read(now);
        stream.process(now, Wake::IO);
        let later = now + Duration::from_secs(1);
        stream.process(later, Wake::TIMER);
        assert_eq!(stream.cause, Cause::CliTo);
    }

    #[test]
    fn call_rate_sentinel_kills_livelocked_stream() {
        let cfg = test_config();
        let client = MockEndpoint::default();
        let (mut stream, _) = make_stream(cfg, client, vec![], vec![]);
        let start = Instant::now();
        let mut destroyed = false;
        // three simulated seconds of absurd call rates
        for i in 0..610_000u64 {
            let t = start + Duration::from_secs(i / 200_000);
            if stream.process(t, Wake::MSG) == Outcome::Destroy {
                destroyed = true;
                break;
            }
        }
        assert!(destroyed);
        assert_eq!(stream.cause, Cause::Internal);
    }

    #[test]
    fn buffer_shortage_parks_the_stream() {
        let mut be = Proxy::new(
            "app",
            Mode::Tcp,
            Capabilities {
                frontend: false,
                backend: true,
            },
        );
        be.servers.push(Server::new("s1", "127.0.0.1:9000".parse().unwrap()));
        let cfg = Config::builder()
            .proxy(Proxy::new(
                "front",
                Mode::Tcp,
                Capabilities {
                    frontend: true,
                    backend: false,
                },
            ))
            .proxy(be)
            .buffer_capacity(0)
            .build();
        let (mut stream, _) = make_stream(cfg, MockEndpoint::default(), vec![], vec![]);
        assert_eq!(stream.process(Instant::now(), Wake::IO), Outcome::WaitBuffer);
    }

    #[test]
    fn store_slots_are_bounded() {
        let cfg = test_config();
        let client = MockEndpoint::default();
        let (mut stream, _) = make_stream(cfg, client, vec![], vec![]);
        for i in 0..20u32 {
            stream.stage_store(TableId(0), TableKey::SInt(i));
        }
        assert_eq!(stream.staged_stores().len(), STORE_SLOTS);
    }
}
