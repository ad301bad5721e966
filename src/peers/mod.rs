//! The peers replication protocol.
//!
//! Sibling proxy instances exchange stick-table entries over a line-based
//! handshake followed by binary frames ([`wire`]). Each configured peers
//! section runs one task that maintains outgoing connections, answers
//! incoming ones, drives the resync state machine and keeps sessions
//! alive with heartbeats. Repeated dictionary values are elided through
//! the per-peer LRU caches ([`dict`]).

pub mod dict;
pub mod wire;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::{Duration, Instant};

use crate::config::{Config, DataValue, StickTable, TableId};
use crate::error::{Error, Peers as PeersErr};

use self::dict::{RxCache, TxCache, TxLookup};
use self::wire::{Control, DictWire, Frame, TableDef, UpdateData, UpdateMsg, WireError};

/// Protocol name announced on the hello line.
pub const PROTO_NAME: &str = "HAProxyS";
pub const MAJOR_VER: u32 = 2;
pub const MINOR_VER: u32 = 1;
/// Minor version announced once the remote proved to be older.
pub const DWNGRD_MINOR_VER: u32 = 0;

pub const RESYNC_TIMEOUT: Duration = Duration::from_secs(5);
pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest accepted frame payload.
const MAX_PAYLOAD: usize = 16384;

/// Handshake status codes.
pub const SC_CONNECT: u32 = 100;
pub const SC_CONNECTED: u32 = 110;
pub const SC_SUCCESS: u32 = 200;
pub const SC_TRYAGAIN: u32 = 300;
pub const SC_ERRPROTO: u32 = 501;
pub const SC_ERRVERSION: u32 = 502;
pub const SC_ERRHOST: u32 = 503;
pub const SC_ERRPEER: u32 = 504;

/// Short state name for dumps.
pub fn statuscode_str(code: u32) -> &'static str {
    match code {
        SC_CONNECT => "CONN",
        SC_CONNECTED => "HSHK",
        SC_SUCCESS => "ESTA",
        SC_TRYAGAIN => "RETR",
        SC_ERRPROTO => "PROT",
        SC_ERRVERSION => "VERS",
        SC_ERRHOST => "NAME",
        SC_ERRPEER => "UNKN",
        _ => "NONE",
    }
}

/// Per-peer flag word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags(pub u32);

impl PeerFlags {
    pub const NONE: PeerFlags = PeerFlags(0);
    /// Teach a full lesson to this peer.
    pub const TEACH_PROCESS: PeerFlags = PeerFlags(1 << 0);
    /// Lesson sent, awaiting confirm.
    pub const TEACH_FINISHED: PeerFlags = PeerFlags(1 << 3);
    /// Everything known was taught (local successor during soft stop).
    pub const TEACH_COMPLETE: PeerFlags = PeerFlags(1 << 4);
    /// This peer was assigned to teach us.
    pub const LEARN_ASSIGN: PeerFlags = PeerFlags(1 << 8);
    /// The lesson ended but the teacher was not up to date.
    pub const LEARN_NOTUP2DATE: PeerFlags = PeerFlags(1 << 9);
    /// Liveness: traffic seen within the reconnect window.
    pub const ALIVE: PeerFlags = PeerFlags(1 << 29);
    /// An explicit heartbeat is due.
    pub const HEARTBEAT: PeerFlags = PeerFlags(1 << 30);
    /// Announce the downgraded protocol version on the next hello.
    pub const DWNGRD: PeerFlags = PeerFlags(1 << 31);

    #[inline]
    pub fn contains(self, other: PeerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: PeerFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: PeerFlags) {
        self.0 &= !other.0;
    }
}

impl std::fmt::Debug for PeerFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerFlags({:#x})", self.0)
    }
}

/// Section-level resync bits.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ResyncFlags(pub u32);

impl ResyncFlags {
    pub const NONE: ResyncFlags = ResyncFlags(0);
    pub const LOCAL: ResyncFlags = ResyncFlags(1 << 0);
    pub const REMOTE: ResyncFlags = ResyncFlags(1 << 1);
    pub const ASSIGN: ResyncFlags = ResyncFlags(1 << 2);
    pub const PROCESS: ResyncFlags = ResyncFlags(1 << 3);

    const STATEMASK: u32 = Self::LOCAL.0 | Self::REMOTE.0;

    #[inline]
    pub fn contains(self, other: ResyncFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: ResyncFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: ResyncFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for ResyncFlags {
    type Output = ResyncFlags;
    fn bitor(self, rhs: ResyncFlags) -> ResyncFlags {
        ResyncFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for ResyncFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResyncFlags({:#x})", self.0)
    }
}

/// Composite resync states over the LOCAL/REMOTE bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncState {
    /// Awaiting a lesson from a former local process.
    FromLocal,
    /// Local unavailable, learning from a remote peer.
    FromRemote,
    /// Both sources tried.
    Finished,
}

/// Where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Outgoing: hello sent, waiting for the status line.
    AwaitStatus,
    /// Incoming: waiting for the three hello lines.
    AwaitHello,
    /// Handshake done; binary frames flow.
    Established,
    Closed,
}

/// One shared-table binding between a local table and a peer.
#[derive(Debug)]
pub struct SharedTable {
    pub table: TableId,
    /// Our id for this table on the wire.
    pub local_id: u64,
    /// The remote's id, learned from its DEFINE.
    pub remote_id: Option<u64>,
    pub last_pushed: u32,
    pub last_get: u32,
    pub last_acked: u32,
    /// Cursor floor while teaching; pushed back to zero for a full lesson.
    pub teaching_origin: u32,
    pub teach_stage1: bool,
    pub teach_stage2: bool,
    /// DEFINE announced on the current session.
    pub defined: bool,
}

/// One configured sibling.
pub struct Peer {
    pub name: String,
    pub addr: SocketAddr,
    /// A former incarnation of this very process.
    pub local: bool,
    pub statuscode: u32,
    pub flags: PeerFlags,
    pub session: SessionState,
    pub reconnect: Option<Instant>,
    pub heartbeat: Option<Instant>,
    pub tables: Vec<SharedTable>,
    rxbuf: Vec<u8>,
    tx_dict: TxCache,
    rx_dict: RxCache,
    /// Table selected by the last SWITCH received.
    rx_current: Option<usize>,
    /// Table our own updates are currently flowing for.
    tx_current: Option<usize>,
    /// Deterministic source for the duplicate-session back-off.
    backoff_seed: u64,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("status", &statuscode_str(self.statuscode))
            .field("session", &self.session)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Peer {
    fn new(name: String, addr: SocketAddr, local: bool, tables: &[TableId]) -> Peer {
        Peer {
            name,
            addr,
            local,
            statuscode: 0,
            flags: PeerFlags::NONE,
            session: SessionState::Closed,
            reconnect: None,
            heartbeat: None,
            tables: tables
                .iter()
                .enumerate()
                .map(|(i, &t)| SharedTable {
                    table: t,
                    local_id: i as u64 + 1,
                    remote_id: None,
                    last_pushed: 0,
                    last_get: 0,
                    last_acked: 0,
                    teaching_origin: 0,
                    teach_stage1: false,
                    teach_stage2: false,
                    defined: false,
                })
                .collect(),
            rxbuf: Vec::new(),
            tx_dict: TxCache::new(),
            rx_dict: RxCache::new(),
            rx_current: None,
            tx_current: None,
            backoff_seed: 0,
        }
    }

    /// Resets all per-session state; cursors that survive reconnections
    /// (acks) are kept.
    fn reset_session(&mut self) {
        self.session = SessionState::Closed;
        self.rxbuf.clear();
        self.tx_dict.flush();
        self.rx_dict.flush();
        self.rx_current = None;
        self.tx_current = None;
        self.flags.remove(PeerFlags::ALIVE | PeerFlags::HEARTBEAT);
        for st in self.tables.iter_mut() {
            st.defined = false;
            st.remote_id = None;
            // unacked pushes will be re-sent on the next session
            st.last_pushed = st.last_acked;
        }
    }

    /// 50–2050 ms, deterministic per peer.
    fn next_backoff(&mut self) -> Duration {
        self.backoff_seed = self.backoff_seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        Duration::from_millis(50 + (self.backoff_seed >> 33) % 2001)
    }
}

impl std::ops::BitOr for PeerFlags {
    type Output = PeerFlags;
    fn bitor(self, rhs: PeerFlags) -> PeerFlags {
        PeerFlags(self.0 | rhs.0)
    }
}

/// What the section task wants done for a peer after a tick.
#[derive(Debug, PartialEq, Eq)]
pub enum TickAction {
    /// Open an outgoing connection to this peer.
    Connect(usize),
    /// Send these bytes on the peer's established session.
    Send(usize, Vec<u8>),
    /// Shut the session down so it reconnects.
    Shutdown(usize),
}

/// A peers section: the local identity plus every configured sibling.
pub struct Section {
    cfg: Arc<Config>,
    pub section_name: String,
    pub local_name: String,
    pub peers: Vec<Peer>,
    /// Stick tables replicated by this section.
    pub tables: Vec<TableId>,
    pub resync: ResyncFlags,
    pub resync_deadline: Option<Instant>,
    /// Set while the process is being softly stopped.
    pub stopping: bool,
    /// Held while a local successor still needs our lesson.
    pub dont_stop: bool,
}

impl std::fmt::Debug for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section")
            .field("name", &self.section_name)
            .field("resync", &self.resync)
            .field("peers", &self.peers)
            .finish()
    }
}

impl Section {
    /// Builds a section; `tables` lists the stick tables it replicates,
    /// `had_old_process` tells whether a former incarnation may teach us.
    pub fn new(
        cfg: Arc<Config>,
        section_name: impl Into<String>,
        local_name: impl Into<String>,
        tables: Vec<TableId>,
        had_old_process: bool,
        now: Instant,
    ) -> Section {
        let resync_deadline = Some(now + RESYNC_TIMEOUT);
        let mut resync = ResyncFlags::NONE;
        if !had_old_process {
            // nothing to learn locally
            resync.insert(ResyncFlags::LOCAL);
        }
        Section {
            cfg,
            section_name: section_name.into(),
            local_name: local_name.into(),
            peers: Vec::new(),
            tables,
            resync,
            resync_deadline,
            stopping: false,
            dont_stop: false,
        }
    }

    pub fn add_peer(&mut self, name: impl Into<String>, addr: SocketAddr, local: bool) {
        let tables = self.tables.clone();
        self.peers.push(Peer::new(name.into(), addr, local, &tables));
    }

    pub fn resync_state(&self) -> ResyncState {
        match self.resync.0 & ResyncFlags::STATEMASK {
            0 => ResyncState::FromLocal,
            x if x == ResyncFlags::LOCAL.0 => ResyncState::FromRemote,
            // REMOTE alone does not happen; both set means finished
            _ => ResyncState::Finished,
        }
    }

    /// The hello message for an outgoing connection to `peer_idx`.
    pub fn start_outgoing(&mut self, peer_idx: usize, now: Instant) -> Vec<u8> {
        let local = self.local_name.clone();
        let peer = &mut self.peers[peer_idx];
        peer.reset_session();
        peer.session = SessionState::AwaitStatus;
        peer.statuscode = SC_CONNECT;
        peer.reconnect = Some(now + RECONNECT_TIMEOUT);
        let minor = if peer.flags.contains(PeerFlags::DWNGRD) {
            DWNGRD_MINOR_VER
        } else {
            MINOR_VER
        };
        format!(
            "{} {}.{}\n{}\n{} {} {}\n",
            PROTO_NAME,
            MAJOR_VER,
            minor,
            peer.name,
            local,
            std::process::id(),
            1,
        )
        .into_bytes()
    }

    /// Feeds bytes from an incoming connection not yet tied to a peer.
    /// Returns the status line plus the peer index on success.
    pub fn accept_hello(&mut self, data: &[u8], now: Instant) -> (Vec<u8>, Option<usize>) {
        let text = match std::str::from_utf8(data) {
            Ok(t) => t,
            Err(_) => return (status_line(SC_ERRPROTO), None),
        };
        let mut lines = text.split('\n');
        let proto = lines.next().unwrap_or("");
        let mut words = proto.split(' ');
        if words.next() != Some(PROTO_NAME) {
            return (status_line(SC_ERRPROTO), None);
        }
        let version = words.next().unwrap_or("");
        let mut vparts = version.split('.');
        let maj: u32 = match vparts.next().and_then(|v| v.parse().ok()) {
            Some(v) => v,
            None => return (status_line(SC_ERRPROTO), None),
        };
        let min: u32 = match vparts.next().and_then(|v| v.parse().ok()) {
            Some(v) => v,
            None => return (status_line(SC_ERRPROTO), None),
        };
        if maj != MAJOR_VER || min > MINOR_VER {
            return (status_line(SC_ERRVERSION), None);
        }
        let host = lines.next().unwrap_or("");
        if host != self.local_name {
            return (status_line(SC_ERRHOST), None);
        }
        let ident = lines.next().unwrap_or("");
        let peer_name = ident.split(' ').next().unwrap_or("");
        let idx = match self.peers.iter().position(|p| p.name == peer_name) {
            Some(i) => i,
            None => return (status_line(SC_ERRPEER), None),
        };

        // duplicate session arbitration
        if self.peers[idx].session == SessionState::Established {
            if self.peers[idx].local {
                return (status_line(SC_TRYAGAIN), None);
            }
            // shut the older session down and take its place after a
            // short randomised pause
            let backoff = self.peers[idx].next_backoff();
            self.peers[idx].reconnect = Some(now + backoff);
        }

        let peer = &mut self.peers[idx];
        peer.reset_session();
        peer.session = SessionState::Established;
        peer.statuscode = SC_SUCCESS;
        if min < MINOR_VER {
            // remote is older; stop sending timed update variants
            peer.flags.insert(PeerFlags::DWNGRD);
        }
        peer.flags.insert(PeerFlags::ALIVE);
        peer.reconnect = Some(now + RECONNECT_TIMEOUT);
        peer.heartbeat = Some(now + HEARTBEAT_TIMEOUT);
        (status_line(SC_SUCCESS), Some(idx))
    }

    /// Outgoing side: consumes the status line answer.
    pub fn handle_status(&mut self, peer_idx: usize, line: &str, now: Instant) -> crate::Result<()> {
        let code: u32 = line
            .trim()
            .parse()
            .map_err(|_| Error::new_peers(PeersErr::Handshake))?;
        let peer = &mut self.peers[peer_idx];
        peer.statuscode = code;
        match code {
            SC_SUCCESS => {
                peer.session = SessionState::Established;
                peer.flags.insert(PeerFlags::ALIVE);
                peer.reconnect = Some(now + RECONNECT_TIMEOUT);
                peer.heartbeat = Some(now + HEARTBEAT_TIMEOUT);
                Ok(())
            }
            SC_ERRVERSION => {
                peer.flags.insert(PeerFlags::DWNGRD);
                peer.session = SessionState::Closed;
                peer.reconnect = Some(now + peer.next_backoff());
                Err(Error::new_peers(PeersErr::Handshake))
            }
            _ => {
                peer.session = SessionState::Closed;
                peer.reconnect = Some(now + RECONNECT_TIMEOUT);
                Err(Error::new_peers(PeersErr::Handshake))
            }
        }
    }

    /// Feeds established-session bytes from `peer_idx`, appending any
    /// reply frames to `out`.
    pub fn handle_input(
        &mut self,
        peer_idx: usize,
        data: &[u8],
        out: &mut Vec<u8>,
        now: Instant,
    ) -> crate::Result<()> {
        self.peers[peer_idx].rxbuf.extend_from_slice(data);
        // any traffic proves liveness
        {
            let peer = &mut self.peers[peer_idx];
            peer.flags.insert(PeerFlags::ALIVE);
            peer.reconnect = Some(now + RECONNECT_TIMEOUT);
        }
        loop {
            let buf = std::mem::take(&mut self.peers[peer_idx].rxbuf);
            let parsed = wire::read_frame(&buf, MAX_PAYLOAD);
            let (frame, used) = match parsed {
                Ok(Some((f, u))) => (f.clone_owned(), u),
                Ok(None) => {
                    self.peers[peer_idx].rxbuf = buf;
                    return Ok(());
                }
                Err(e) => {
                    wire::encode_error(out, WireError::SizeLimit);
                    self.close_session(peer_idx);
                    return Err(e);
                }
            };
            self.peers[peer_idx].rxbuf = buf[used..].to_vec();
            self.dispatch_frame(peer_idx, frame, out, now)?;
        }
    }

    fn dispatch_frame(
        &mut self,
        peer_idx: usize,
        frame: OwnedFrame,
        out: &mut Vec<u8>,
        now: Instant,
    ) -> crate::Result<()> {
        match frame.class {
            wire::CLASS_CONTROL => {
                let ctrl = Control::from_u8(frame.msg_type)
                    .ok_or_else(|| Error::new_peers(PeersErr::Protocol))?;
                self.handle_control(peer_idx, ctrl, out, now);
                Ok(())
            }
            wire::CLASS_ERROR => {
                tracing::warn!(
                    peer = %self.peers[peer_idx].name,
                    kind = ?WireError::from_u8(frame.msg_type),
                    "peer signalled an error, closing"
                );
                self.close_session(peer_idx);
                Ok(())
            }
            wire::CLASS_STICKTABLE => self.handle_sticktable(peer_idx, &frame, out, now),
            wire::CLASS_RESERVED => Ok(()),
            _ => {
                wire::encode_error(out, WireError::Protocol);
                self.close_session(peer_idx);
                Err(Error::new_peers(PeersErr::Protocol))
            }
        }
    }

    fn handle_control(
        &mut self,
        peer_idx: usize,
        ctrl: Control,
        out: &mut Vec<u8>,
        now: Instant,
    ) {
        match ctrl {
            Control::Heartbeat => {
                // receipt already refreshed the reconnect deadline
            }
            Control::ResyncReq => {
                let peer = &mut self.peers[peer_idx];
                peer.flags.insert(PeerFlags::TEACH_PROCESS);
                for st in peer.tables.iter_mut() {
                    st.teaching_origin = st.last_pushed;
                    st.last_pushed = 0;
                    st.teach_stage1 = false;
                    st.teach_stage2 = false;
                }
                self.push_updates(peer_idx, out, now);
            }
            Control::ResyncFinished => {
                let peer = &mut self.peers[peer_idx];
                if peer.flags.contains(PeerFlags::LEARN_ASSIGN) {
                    peer.flags.remove(PeerFlags::LEARN_ASSIGN);
                    self.resync.insert(ResyncFlags::LOCAL | ResyncFlags::REMOTE);
                    self.resync.remove(ResyncFlags::ASSIGN | ResyncFlags::PROCESS);
                    wire::encode_control(out, Control::ResyncConfirm);
                }
            }
            Control::ResyncPartial => {
                let peer = &mut self.peers[peer_idx];
                if peer.flags.contains(PeerFlags::LEARN_ASSIGN) {
                    peer.flags.remove(PeerFlags::LEARN_ASSIGN);
                    peer.flags.insert(PeerFlags::LEARN_NOTUP2DATE);
                    self.resync.remove(ResyncFlags::ASSIGN);
                    self.resync_deadline = Some(now + RESYNC_TIMEOUT);
                    wire::encode_control(out, Control::ResyncConfirm);
                }
            }
            Control::ResyncConfirm => {
                let peer = &mut self.peers[peer_idx];
                peer.flags.remove(PeerFlags::TEACH_PROCESS | PeerFlags::TEACH_FINISHED);
                if peer.local {
                    peer.flags.insert(PeerFlags::TEACH_COMPLETE);
                    self.dont_stop = false;
                }
            }
        }
    }

    fn handle_sticktable(
        &mut self,
        peer_idx: usize,
        frame: &OwnedFrame,
        out: &mut Vec<u8>,
        now: Instant,
    ) -> crate::Result<()> {
        match frame.msg_type {
            wire::MSG_STKT_DEFINE => {
                let def = wire::decode_define(&frame.payload)?;
                let cfg = self.cfg.clone();
                let pos = self.peers[peer_idx].tables.iter().position(|st| {
                    cfg.table(st.table)
                        .map(|t| t.name.as_bytes() == &def.name[..])
                        .unwrap_or(false)
                });
                match pos {
                    Some(i) => {
                        let table = cfg
                            .table(self.peers[peer_idx].tables[i].table)
                            .expect("table exists");
                        if table.key_type != def.key_type
                            || table.data_type_mask() != def.data_mask
                        {
                            wire::encode_error(out, WireError::Protocol);
                            self.close_session(peer_idx);
                            return Err(Error::new_peers(PeersErr::Protocol));
                        }
                        let peer = &mut self.peers[peer_idx];
                        peer.tables[i].remote_id = Some(def.local_id);
                        peer.rx_current = Some(i);
                    }
                    None => {
                        // unknown table: tolerated, its updates will have
                        // no destination
                        tracing::debug!(
                            table = %String::from_utf8_lossy(&def.name),
                            "peer advertises unknown table"
                        );
                    }
                }
                Ok(())
            }
            wire::MSG_STKT_SWITCH => {
                let id = wire::decode_switch(&frame.payload)?;
                let peer = &mut self.peers[peer_idx];
                peer.rx_current = peer.tables.iter().position(|st| st.remote_id == Some(id));
                Ok(())
            }
            wire::MSG_STKT_ACK => {
                let (local_id, last_get) = wire::decode_ack(&frame.payload)?;
                let peer = &mut self.peers[peer_idx];
                if let Some(st) = peer.tables.iter_mut().find(|st| st.local_id == local_id) {
                    st.last_acked = last_get;
                }
                Ok(())
            }
            wire::MSG_STKT_UPDATE
            | wire::MSG_STKT_INCUPDATE
            | wire::MSG_STKT_UPDATE_TIMED
            | wire::MSG_STKT_INCUPDATE_TIMED => {
                self.handle_update(peer_idx, frame, out, now)
            }
            _ => {
                // length-prefixed unknown types were already skipped by
                // the framing layer reading past their payload
                Ok(())
            }
        }
    }

    fn handle_update(
        &mut self,
        peer_idx: usize,
        frame: &OwnedFrame,
        out: &mut Vec<u8>,
        now: Instant,
    ) -> crate::Result<()> {
        let cfg = self.cfg.clone();
        let st_idx = match self.peers[peer_idx].rx_current {
            Some(i) => i,
            None => {
                wire::encode_error(out, WireError::Protocol);
                self.close_session(peer_idx);
                return Err(Error::new_peers(PeersErr::Protocol));
            }
        };
        let peer = &mut self.peers[peer_idx];
        let table_id = peer.tables[st_idx].table;
        let table = cfg.table(table_id).expect("table exists");
        let msg = wire::decode_update(
            frame.msg_type,
            &frame.payload,
            table.key_type,
            table.key_size,
            &table.data_types,
        )?;
        let update_id = msg
            .update_id
            .unwrap_or_else(|| peer.tables[st_idx].last_get.wrapping_add(1));

        let mut data = Vec::with_capacity(msg.data.len());
        for wire_val in &msg.data {
            let v = match wire_val {
                UpdateData::Int(v) => int_to_value(table, data.len(), *v),
                UpdateData::Freq(f) => DataValue::FreqPeriod(*f),
                UpdateData::Dict(DictWire::Absent) => DataValue::Dict(None),
                UpdateData::Dict(DictWire::IdValue(id, value)) => {
                    peer.rx_dict.set(*id, value.clone());
                    DataValue::Dict(Some(value.clone()))
                }
                UpdateData::Dict(DictWire::IdOnly(id)) => match peer.rx_dict.get(*id) {
                    Some(v) => DataValue::Dict(Some(v.to_vec())),
                    // an id we never saw: drop the entry, not the session
                    None => {
                        peer.tables[st_idx].last_get = update_id;
                        return Ok(());
                    }
                },
            };
            data.push(v);
        }
        let expires = msg
            .expire_ms
            .map(|ms| now + Duration::from_millis(u64::from(ms)));
        table.learn(msg.key, data, expires);
        peer.tables[st_idx].last_get = update_id;
        wire::encode_ack(out, peer.tables[st_idx].remote_id.unwrap_or(0), update_id);
        Ok(())
    }

    /// Encodes pending local updates for `peer_idx` into `out`.
    pub fn push_updates(&mut self, peer_idx: usize, out: &mut Vec<u8>, now: Instant) {
        let cfg = self.cfg.clone();
        if self.peers[peer_idx].session != SessionState::Established {
            return;
        }
        let ntables = self.peers[peer_idx].tables.len();
        let mut wrote = false;
        for st_idx in 0..ntables {
            let table_id = self.peers[peer_idx].tables[st_idx].table;
            let table = cfg.table(table_id).expect("table exists");
            loop {
                let last_pushed = self.peers[peer_idx].tables[st_idx].last_pushed;
                let (id, key, entry) = match table.next_after(last_pushed) {
                    Some(v) => v,
                    None => break,
                };
                let peer = &mut self.peers[peer_idx];
                if !peer.tables[st_idx].defined {
                    let def = TableDef {
                        local_id: peer.tables[st_idx].local_id,
                        name: table.name.clone().into_bytes(),
                        key_type: table.key_type,
                        key_size: table.key_size as u64,
                        data_mask: table.data_type_mask(),
                        expire_ms: table
                            .expire
                            .map(|e| e.as_millis() as u64)
                            .unwrap_or(0),
                        periods: Vec::new(),
                    };
                    wire::encode_define(out, &def);
                    peer.tables[st_idx].defined = true;
                    peer.tx_current = Some(st_idx);
                } else if peer.tx_current != Some(st_idx) {
                    wire::encode_switch(out, peer.tables[st_idx].local_id);
                    peer.tx_current = Some(st_idx);
                }
                let timed = !peer.flags.contains(PeerFlags::DWNGRD);
                let update_id = if id == last_pushed.wrapping_add(1) {
                    None
                } else {
                    Some(id)
                };
                let expire_ms = if timed {
                    Some(crate::config::expire_delta_ms(entry.expires, now))
                } else {
                    None
                };
                let mut data = wire::entry_data_to_wire(&entry.data);
                for v in data.iter_mut() {
                    if let UpdateData::Dict(DictWire::IdValue(_, value)) = v {
                        let value = value.clone();
                        *v = match peer.tx_dict.use_value(&value) {
                            TxLookup::Hit(id) => UpdateData::Dict(DictWire::IdOnly(id)),
                            TxLookup::Miss(id) => {
                                UpdateData::Dict(DictWire::IdValue(id, value))
                            }
                        };
                    }
                }
                wire::encode_update(
                    out,
                    &UpdateMsg {
                        update_id,
                        expire_ms,
                        key,
                        data,
                    },
                );
                peer.tables[st_idx].last_pushed = id;
                wrote = true;
            }
        }
        // a finished lesson concludes with a resync-finished control
        let peer = &mut self.peers[peer_idx];
        if peer.flags.contains(PeerFlags::TEACH_PROCESS)
            && !peer.flags.contains(PeerFlags::TEACH_FINISHED)
        {
            let caught_up = peer
                .tables
                .iter()
                .all(|st| {
                    cfg.table(st.table)
                        .map(|t| t.next_after(st.last_pushed).is_none())
                        .unwrap_or(true)
                });
            if caught_up {
                wire::encode_control(out, Control::ResyncFinished);
                peer.flags.insert(PeerFlags::TEACH_FINISHED);
                wrote = true;
            }
        }
        if wrote {
            // updates double as heartbeats
            self.peers[peer_idx].heartbeat = Some(now + HEARTBEAT_TIMEOUT);
        }
    }

    fn close_session(&mut self, peer_idx: usize) {
        let peer = &mut self.peers[peer_idx];
        peer.reset_session();
        if peer.flags.contains(PeerFlags::LEARN_ASSIGN) {
            // our teacher went away; look for another one
            peer.flags.remove(PeerFlags::LEARN_ASSIGN);
            self.resync.remove(ResyncFlags::ASSIGN | ResyncFlags::PROCESS);
        }
    }

    /// One pass of the section task: resync progress, reconnections and
    /// heartbeats.
    pub fn tick(&mut self, now: Instant) -> Vec<TickAction> {
        let mut actions = Vec::new();

        // resync timeout: give up on the local lesson, try a remote
        if let Some(deadline) = self.resync_deadline {
            if deadline <= now {
                self.resync_deadline = None;
                if self.resync_state() == ResyncState::FromLocal {
                    self.resync.insert(ResyncFlags::LOCAL);
                }
            }
        }
        // assign a connected remote peer to teach us
        if self.resync_state() == ResyncState::FromRemote
            && !self.resync.contains(ResyncFlags::ASSIGN)
        {
            let candidate = self.peers.iter().position(|p| {
                !p.local
                    && p.session == SessionState::Established
                    && p.statuscode == SC_SUCCESS
                    && !p.flags.contains(PeerFlags::LEARN_NOTUP2DATE)
            });
            if let Some(idx) = candidate {
                self.peers[idx].flags.insert(PeerFlags::LEARN_ASSIGN);
                self.resync.insert(ResyncFlags::ASSIGN | ResyncFlags::PROCESS);
                let mut msg = Vec::new();
                wire::encode_control(&mut msg, Control::ResyncReq);
                actions.push(TickAction::Send(idx, msg));
            }
        }

        for idx in 0..self.peers.len() {
            let state = self.peers[idx].session;
            match state {
                SessionState::Closed => {
                    let due = self.peers[idx]
                        .reconnect
                        .map(|d| d <= now)
                        .unwrap_or(true);
                    if !self.peers[idx].local && due && !self.stopping {
                        actions.push(TickAction::Connect(idx));
                    }
                }
                SessionState::Established => {
                    let reconnect_due = self.peers[idx]
                        .reconnect
                        .map(|d| d <= now)
                        .unwrap_or(false);
                    if reconnect_due {
                        let peer = &mut self.peers[idx];
                        if peer.flags.contains(PeerFlags::ALIVE) {
                            // one grace period without traffic
                            peer.flags.remove(PeerFlags::ALIVE);
                            peer.reconnect = Some(now + RECONNECT_TIMEOUT);
                        } else {
                            actions.push(TickAction::Shutdown(idx));
                            self.close_session(idx);
                            continue;
                        }
                    }
                    let mut buf = Vec::new();
                    self.push_updates(idx, &mut buf, now);
                    if buf.is_empty() {
                        let heartbeat_due = self.peers[idx]
                            .heartbeat
                            .map(|d| d <= now)
                            .unwrap_or(false);
                        if heartbeat_due {
                            wire::encode_control(&mut buf, Control::Heartbeat);
                            self.peers[idx].heartbeat = Some(now + HEARTBEAT_TIMEOUT);
                        }
                    }
                    if !buf.is_empty() {
                        actions.push(TickAction::Send(idx, buf));
                    }
                }
                _ => {}
            }
        }
        actions
    }

    /// Begins a soft stop: local peers get the full lesson, and the
    /// process holds until it is delivered.
    pub fn soft_stop(&mut self) {
        self.stopping = true;
        let has_local = self.peers.iter().any(|p| p.local);
        if has_local {
            self.dont_stop = true;
        }
        for peer in self.peers.iter_mut() {
            if peer.local && !peer.flags.contains(PeerFlags::TEACH_COMPLETE) {
                peer.flags.insert(PeerFlags::TEACH_PROCESS);
                for st in peer.tables.iter_mut() {
                    st.teaching_origin = st.last_pushed;
                    st.last_pushed = 0;
                }
            }
        }
    }
}

fn status_line(code: u32) -> Vec<u8> {
    format!("{}\n", code).into_bytes()
}

fn int_to_value(table: &StickTable, column: usize, raw: u64) -> DataValue {
    use crate::config::StandardType::*;
    match table.data_types.get(column).map(|t| t.standard()) {
        Some(SInt) => DataValue::SInt(raw as i64),
        Some(UInt) => DataValue::UInt(raw as u32),
        Some(ULongLong) => DataValue::ULongLong(raw),
        _ => DataValue::ULongLong(raw),
    }
}

/// An owned copy of a decoded frame, so the rx buffer can be advanced.
#[derive(Debug, Clone)]
struct OwnedFrame {
    class: u8,
    msg_type: u8,
    payload: Vec<u8>,
}

impl<'a> Frame<'a> {
    fn clone_owned(&self) -> OwnedFrame {
        OwnedFrame {
            class: self.class,
            msg_type: self.msg_type,
            payload: self.payload.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataType, KeyType, TableKey};

    fn cfg_with_table() -> Arc<Config> {
        let table = StickTable::new("clients", KeyType::Str, 32, 64)
            .with_data(vec![DataType::HttpReqCnt, DataType::ServerName])
            .with_expire(Duration::from_secs(60));
        Config::builder().table(table).build()
    }

    fn two_sections() -> (Section, Section, Instant) {
        let now = Instant::now();
        let cfg_a = cfg_with_table();
        let cfg_b = cfg_with_table();
        let mut a = Section::new(cfg_a, "mesh", "alpha", vec![TableId(0)], false, now);
        a.add_peer("beta", "127.0.0.1:7001".parse().unwrap(), false);
        let mut b = Section::new(cfg_b, "mesh", "beta", vec![TableId(0)], false, now);
        b.add_peer("alpha", "127.0.0.1:7000".parse().unwrap(), false);
        (a, b, now)
    }

    /// Runs the handshake between two sections; alpha connects to beta.
    fn connect(a: &mut Section, b: &mut Section, now: Instant) {
        let hello = a.start_outgoing(0, now);
        let (status, idx) = b.accept_hello(&hello, now);
        assert_eq!(idx, Some(0));
        assert_eq!(status, b"200\n");
        a.handle_status(0, std::str::from_utf8(&status).unwrap(), now)
            .unwrap();
        assert_eq!(a.peers[0].session, SessionState::Established);
        assert_eq!(b.peers[0].session, SessionState::Established);
    }

    #[test]
    fn hello_round_trip() {
        let (mut a, mut b, now) = two_sections();
        let hello = a.start_outgoing(0, now);
        let text = String::from_utf8(hello.clone()).unwrap();
        assert!(text.starts_with("HAProxyS 2.1\nbeta\nalpha "));
        connect(&mut a, &mut b, now);
        assert_eq!(statuscode_str(a.peers[0].statuscode), "ESTA");
    }

    #[test]
    fn bad_hellos_get_status_codes() {
        let (_, mut b, now) = two_sections();
        let (s, _) = b.accept_hello(b"NotTheProto 2.1\nbeta\nalpha 1 1\n", now);
        assert_eq!(s, b"501\n");
        let (s, _) = b.accept_hello(b"HAProxyS 3.0\nbeta\nalpha 1 1\n", now);
        assert_eq!(s, b"502\n");
        let (s, _) = b.accept_hello(b"HAProxyS 2.1\nwrong-host\nalpha 1 1\n", now);
        assert_eq!(s, b"503\n");
        let (s, _) = b.accept_hello(b"HAProxyS 2.1\nbeta\nstranger 1 1\n", now);
        assert_eq!(s, b"504\n");
    }

    #[test]
    fn old_minor_version_sets_downgrade() {
        let (_, mut b, now) = two_sections();
        let (s, idx) = b.accept_hello(b"HAProxyS 2.0\nbeta\nalpha 1 1\n", now);
        assert_eq!(s, b"200\n");
        assert!(b.peers[idx.unwrap()].flags.contains(PeerFlags::DWNGRD));
    }

    #[test]
    fn update_then_ack_converges() {
        let (mut a, mut b, now) = two_sections();
        connect(&mut a, &mut b, now);

        let key = TableKey::Str(b"client-1".to_vec());
        let table_a = a.cfg.table(TableId(0)).unwrap();
        let col = table_a.column(DataType::HttpReqCnt).unwrap();
        let update_id = table_a
            .update(key.clone(), now, |e| {
                e.data[col] = DataValue::UInt(7);
            })
            .unwrap();

        let mut a_out = Vec::new();
        a.push_updates(0, &mut a_out, now);
        assert!(!a_out.is_empty());

        let mut b_out = Vec::new();
        b.handle_input(0, &a_out, &mut b_out, now).unwrap();
        // beta stored the entry
        let entry = b.cfg.table(TableId(0)).unwrap().get(&key).unwrap();
        assert_eq!(entry.data[col], DataValue::UInt(7));
        // and acked it
        assert!(!b_out.is_empty());
        let mut a_reply = Vec::new();
        a.handle_input(0, &b_out, &mut a_reply, now).unwrap();
        assert_eq!(a.peers[0].tables[0].last_acked, update_id);
    }

    #[test]
    fn dict_values_elide_after_first_send() {
        let (mut a, mut b, now) = two_sections();
        connect(&mut a, &mut b, now);
        let cfg_a = a.cfg.clone();
        let table_a = cfg_a.table(TableId(0)).unwrap();
        let name_col = table_a.column(DataType::ServerName).unwrap();

        for (i, key) in [b"k1".to_vec(), b"k2".to_vec()].iter().enumerate() {
            table_a
                .update(TableKey::Str(key.clone()), now, |e| {
                    e.data[name_col] = DataValue::Dict(Some(b"web1".to_vec()));
                })
                .unwrap();
            let mut a_out = Vec::new();
            a.push_updates(0, &mut a_out, now);
            let mut b_out = Vec::new();
            b.handle_input(0, &a_out, &mut b_out, now).unwrap();
            let entry = b
                .cfg
                .table(TableId(0))
                .unwrap()
                .get(&TableKey::Str(key.clone()))
                .unwrap();
            assert_eq!(
                entry.data[name_col],
                DataValue::Dict(Some(b"web1".to_vec())),
                "iteration {}",
                i
            );
        }
        // the second transmission used the id-only form
        let mut probe = Vec::new();
        let table_a = a.cfg.table(TableId(0)).unwrap();
        table_a
            .update(TableKey::Str(b"k3".to_vec()), now, |e| {
                e.data[name_col] = DataValue::Dict(Some(b"web1".to_vec()));
            })
            .unwrap();
        a.push_updates(0, &mut probe, now);
        // frame for k3: no "web1" literal inside
        assert!(
            !probe.windows(4).any(|w| w == b"web1"),
            "value should travel as a bare id"
        );
    }

    #[test]
    fn resync_from_remote_scenario() {
        let (mut a, mut b, now) = two_sections();
        // alpha boots believing an old process may teach it
        a.resync = ResyncFlags::NONE;
        a.resync_deadline = Some(now + RESYNC_TIMEOUT);
        assert_eq!(a.resync_state(), ResyncState::FromLocal);

        connect(&mut a, &mut b, now);

        // nothing to learn locally: the timeout flips us to FromRemote
        let later = now + RESYNC_TIMEOUT + Duration::from_millis(1);
        let actions = a.tick(later);
        assert_eq!(a.resync_state(), ResyncState::FromRemote);
        // the connected remote peer is asked for a full resync
        let sent = actions.iter().find_map(|act| match act {
            TickAction::Send(0, bytes) => Some(bytes.clone()),
            _ => None,
        });
        let sent = sent.expect("resync request sent");
        let mut expected = Vec::new();
        wire::encode_control(&mut expected, Control::ResyncReq);
        assert!(sent.windows(expected.len()).any(|w| w == &expected[..]));
        assert!(a.peers[0].flags.contains(PeerFlags::LEARN_ASSIGN));

        // beta answers the lesson with resync-finished
        let mut b_out = Vec::new();
        b.handle_input(0, &sent, &mut b_out, later).unwrap();
        assert!(b.peers[0].flags.contains(PeerFlags::TEACH_FINISHED));

        let mut a_out = Vec::new();
        a.handle_input(0, &b_out, &mut a_out, later).unwrap();
        assert_eq!(a.resync_state(), ResyncState::Finished);
        // and alpha confirmed the lesson
        let mut confirm = Vec::new();
        wire::encode_control(&mut confirm, Control::ResyncConfirm);
        assert!(a_out.windows(confirm.len()).any(|w| w == &confirm[..]));
    }

    #[test]
    fn heartbeat_and_liveness_cycle() {
        let (mut a, mut b, now) = two_sections();
        connect(&mut a, &mut b, now);

        // 3 s idle: a heartbeat goes out
        let t1 = now + HEARTBEAT_TIMEOUT + Duration::from_millis(1);
        let actions = a.tick(t1);
        let hb = actions.iter().any(|act| {
            matches!(act, TickAction::Send(0, bytes)
                if bytes == &{
                    let mut v = Vec::new();
                    wire::encode_control(&mut v, Control::Heartbeat);
                    v
                })
        });
        assert!(hb, "expected a heartbeat after idle");

        // 5 s without traffic: grace first, shutdown second
        let t2 = now + RECONNECT_TIMEOUT + Duration::from_millis(1);
        let actions = a.tick(t2);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, TickAction::Shutdown(_))));
        assert!(!a.peers[0].flags.contains(PeerFlags::ALIVE));
        let t3 = t2 + RECONNECT_TIMEOUT + Duration::from_millis(1);
        let actions = a.tick(t3);
        assert!(actions
            .iter()
            .any(|a| matches!(a, TickAction::Shutdown(0))));
    }

    #[test]
    fn duplicate_local_session_is_rejected() {
        let now = Instant::now();
        let cfg = cfg_with_table();
        let mut b = Section::new(cfg, "mesh", "beta", vec![TableId(0)], false, now);
        b.add_peer("alpha", "127.0.0.1:7000".parse().unwrap(), true);
        let (s, _) = b.accept_hello(b"HAProxyS 2.1\nbeta\nalpha 1 1\n", now);
        assert_eq!(s, b"200\n");
        let (s, idx) = b.accept_hello(b"HAProxyS 2.1\nbeta\nalpha 1 2\n", now);
        assert_eq!(s, b"300\n");
        assert!(idx.is_none());
    }

    #[test]
    fn soft_stop_teaches_local_peer() {
        let now = Instant::now();
        let cfg = cfg_with_table();
        let mut a = Section::new(cfg, "mesh", "alpha", vec![TableId(0)], false, now);
        a.add_peer("alpha-new", "127.0.0.1:7002".parse().unwrap(), true);
        a.soft_stop();
        assert!(a.dont_stop);
        assert!(a.peers[0].flags.contains(PeerFlags::TEACH_PROCESS));
        // pretend the successor connected and confirmed the lesson
        a.peers[0].session = SessionState::Established;
        let mut out = Vec::new();
        a.push_updates(0, &mut out, now);
        assert!(a.peers[0].flags.contains(PeerFlags::TEACH_FINISHED));
        let mut confirm = Vec::new();
        wire::encode_control(&mut confirm, Control::ResyncConfirm);
        let mut reply_out = Vec::new();
        a.handle_input(0, &confirm, &mut reply_out, now).unwrap();
        assert!(a.peers[0].flags.contains(PeerFlags::TEACH_COMPLETE));
        assert!(!a.dont_stop);
    }
}
