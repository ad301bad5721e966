//! Stream interfaces: the endpoint state machines at both ends of a
//! stream.
//!
//! An interface is not a socket; it is the state machine that decides what
//! the attached endpoint (a connection, an in-process applet, or nothing
//! yet) is allowed to do with its channel. The client-side interface is
//! born in `EST`; the server side walks the whole
//! `INI → REQ → … → EST → DIS → CLO` ladder, possibly looping through the
//! retry states.

use std::fmt;

use tokio::time::Instant;

use crate::channel::Channel;

/// Interface states, in progression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SiState {
    /// Nothing attached yet.
    Ini,
    /// Connect request queued at the LB layer, no server chosen.
    Req,
    /// Waiting in a server or backend queue for a slot.
    Que,
    /// Turn-around delay after a retryable failure.
    Tar,
    /// Server assigned, connect not started.
    Ass,
    /// Connect in progress.
    Con,
    /// Transport connected, upper layer not yet acknowledged.
    Rdy,
    /// Established; data may flow.
    Est,
    /// Disconnect pending.
    Dis,
    /// Terminal.
    Clo,
    /// Connect error, pending retry decision.
    Cer,
}

impl SiState {
    /// Short uppercase name used by state dumps.
    pub fn name(self) -> &'static str {
        match self {
            SiState::Ini => "INI",
            SiState::Req => "REQ",
            SiState::Que => "QUE",
            SiState::Tar => "TAR",
            SiState::Ass => "ASS",
            SiState::Con => "CON",
            SiState::Rdy => "RDY",
            SiState::Est => "EST",
            SiState::Dis => "DIS",
            SiState::Clo => "CLO",
            SiState::Cer => "CER",
        }
    }

    /// Whether data may flow through this interface.
    pub fn is_established(self) -> bool {
        matches!(self, SiState::Est | SiState::Dis)
    }

    /// Whether a connection attempt is somewhere in flight.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            SiState::Req | SiState::Que | SiState::Tar | SiState::Ass | SiState::Con | SiState::Rdy
        )
    }
}

/// Interface flag word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SiFlags(pub(crate) u32);

impl SiFlags {
    pub const NONE: SiFlags = SiFlags(0);
    /// Reset the connection on close instead of lingering.
    pub const NOLINGER: SiFlags = SiFlags(1 << 0);
    /// Never leave the connection half-closed.
    pub const NOHALF: SiFlags = SiFlags(1 << 1);
    /// Independent half-close timeouts.
    pub const INDEP_STR: SiFlags = SiFlags(1 << 2);
    /// Abort cleanly with a TCP reset on error.
    pub const CLEAN_ABRT: SiFlags = SiFlags(1 << 3);
    /// Do not wake the stream task for this interface's events.
    pub const DONT_WAKE: SiFlags = SiFlags(1 << 4);
    /// A low-level error was reported by the endpoint.
    pub const ERR: SiFlags = SiFlags(1 << 5);
    /// The interface-level expiration fired.
    pub const EXP: SiFlags = SiFlags(1 << 6);
    /// Receiving is blocked: channel buffer full.
    pub const RXBLK_ROOM: SiFlags = SiFlags(1 << 7);
    /// Receiving is blocked: no buffer allocated.
    pub const RXBLK_BUFF: SiFlags = SiFlags(1 << 8);
    /// Receiving is blocked: channel not ready.
    pub const RXBLK_CHAN: SiFlags = SiFlags(1 << 9);
    /// Sending is blocked: endpoint not ready.
    pub const TXBLK_EP: SiFlags = SiFlags(1 << 10);

    pub const RXBLK_ANY: SiFlags =
        SiFlags(Self::RXBLK_ROOM.0 | Self::RXBLK_BUFF.0 | Self::RXBLK_CHAN.0);

    #[inline]
    pub fn contains(self, other: SiFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: SiFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: SiFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: SiFlags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for SiFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiFlags({:#x})", self.0)
    }
}

/// Classified low-level error on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiErr {
    None,
    /// Connect refused or reset.
    ConnErr,
    /// Connect timed out.
    ConnTo,
    /// The client aborted while we were connecting.
    ConnAbrt,
    /// Allocation failure.
    Resource,
    /// Any other internal error.
    Internal,
}

/// What kind of thing is attached at this end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    None,
    Connection,
    Applet,
}

/// Outcome of one endpoint I/O attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointIo {
    /// Bytes moved.
    Progress(usize),
    /// The endpoint cannot make progress right now; a readiness
    /// subscription was taken.
    Blocked,
    /// The peer closed this direction.
    Closed,
    /// A low-level error occurred.
    Error,
}

/// Transport progress of an endpoint whose connect is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    InProgress,
    Connected,
    Failed,
}

/// The capability surface of an attached endpoint.
///
/// A connection endpoint wraps a socket; an applet endpoint runs
/// in-process (CLI, peers). Down-casts in the original become pattern
/// matches on `kind`.
pub trait Endpoint: fmt::Debug + Send {
    fn kind(&self) -> EndpointKind;

    /// Whether the transport can feed a kernel pipe (splice-in).
    fn rcv_pipe(&self) -> bool {
        false
    }

    /// Whether the transport can drain a kernel pipe (splice-out).
    fn snd_pipe(&self) -> bool {
        false
    }

    /// Transport-level connect progress; applets are always connected.
    fn connect_progress(&self) -> ConnectProgress {
        ConnectProgress::Connected
    }

    /// Pulls bytes from the endpoint into the channel buffer.
    fn recv(&mut self, ch: &mut Channel) -> EndpointIo;

    /// Pushes buffered channel bytes into the endpoint.
    fn send(&mut self, ch: &mut Channel) -> EndpointIo;

    /// Flushes anything the endpoint buffered internally.
    fn flush(&mut self) {}

    /// Closes the write side of the endpoint.
    fn shutw(&mut self, nolinger: bool);

    /// Closes the read side of the endpoint.
    fn shutr(&mut self);

    /// One-line description for state dumps.
    fn show(&self) -> String;
}

/// One endpoint of a stream.
pub struct StreamInterface {
    pub state: SiState,
    pub prev_state: SiState,
    pub flags: SiFlags,
    pub err_type: SiErr,
    /// Connect retries left.
    pub retries: u32,
    /// Interface-level expiration (connect, queue, tarpit).
    pub exp: Option<Instant>,
    endpoint: Option<Box<dyn Endpoint>>,
}

impl StreamInterface {
    /// A client-side interface: born established on its accepted
    /// connection.
    pub fn new_front(endpoint: Box<dyn Endpoint>) -> StreamInterface {
        StreamInterface {
            state: SiState::Est,
            prev_state: SiState::Est,
            flags: SiFlags::NONE,
            err_type: SiErr::None,
            retries: 0,
            exp: None,
            endpoint: Some(endpoint),
        }
    }

    /// A server-side interface: starts with nothing attached.
    pub fn new_back(retries: u32) -> StreamInterface {
        StreamInterface {
            state: SiState::Ini,
            prev_state: SiState::Ini,
            flags: SiFlags::NONE,
            err_type: SiErr::None,
            retries,
            exp: None,
            endpoint: None,
        }
    }

    pub fn endpoint_kind(&self) -> EndpointKind {
        self.endpoint
            .as_ref()
            .map(|e| e.kind())
            .unwrap_or(EndpointKind::None)
    }

    pub fn endpoint(&self) -> Option<&dyn Endpoint> {
        self.endpoint.as_deref()
    }

    pub fn endpoint_mut(&mut self) -> Option<&mut Box<dyn Endpoint>> {
        self.endpoint.as_mut()
    }

    /// Attaches a freshly created endpoint (server connect, applet spawn).
    pub fn attach(&mut self, endpoint: Box<dyn Endpoint>) {
        self.endpoint = Some(endpoint);
    }

    /// Detaches and drops the endpoint, releasing its resources.
    pub fn release(&mut self) {
        self.endpoint = None;
    }

    pub fn set_state(&mut self, state: SiState) {
        if state != self.state {
            tracing::trace!(from = self.state.name(), to = state.name(), "si state");
            self.prev_state = self.state;
            self.state = state;
        }
    }

    /// Whether the state changed since the caller last acknowledged it.
    pub fn state_changed(&self) -> bool {
        self.state != self.prev_state
    }

    pub fn ack_state(&mut self) {
        self.prev_state = self.state;
    }

    /// Pulls from the endpoint into `ch` until blocked, closed or full.
    /// Updates blocking reasons and channel shutdown flags.
    pub fn sync_recv(&mut self, ch: &mut Channel) {
        use crate::channel::Flags;

        if !self.state.is_established() {
            return;
        }
        if ch.flags.contains(Flags::SHUTR) {
            return;
        }
        let ep = match self.endpoint.as_mut() {
            Some(ep) => ep,
            None => return,
        };
        loop {
            if ch.buf.is_full() {
                self.flags.insert(SiFlags::RXBLK_ROOM);
                break;
            }
            match ep.recv(ch) {
                EndpointIo::Progress(0) | EndpointIo::Blocked => break,
                EndpointIo::Progress(_) => {
                    self.flags.remove(SiFlags::RXBLK_ROOM);
                }
                EndpointIo::Closed => {
                    ch.shutr();
                    break;
                }
                EndpointIo::Error => {
                    self.flags.insert(SiFlags::ERR);
                    ch.flags.insert(Flags::READ_ERROR);
                    ch.shutr();
                    break;
                }
            }
        }
    }

    /// Pushes buffered bytes of `ch` out through the endpoint.
    pub fn sync_send(&mut self, ch: &mut Channel) {
        use crate::channel::Flags;

        if !self.state.is_established() {
            return;
        }
        if ch.flags.contains(Flags::SHUTW) {
            return;
        }
        let ep = match self.endpoint.as_mut() {
            Some(ep) => ep,
            None => return,
        };
        while !ch.buf.is_empty() {
            match ep.send(ch) {
                EndpointIo::Progress(0) | EndpointIo::Blocked => {
                    self.flags.insert(SiFlags::TXBLK_EP);
                    return;
                }
                EndpointIo::Progress(_) => {
                    self.flags.remove(SiFlags::TXBLK_EP);
                }
                EndpointIo::Closed => {
                    ch.shutw();
                    return;
                }
                EndpointIo::Error => {
                    self.flags.insert(SiFlags::ERR);
                    ch.flags.insert(Flags::WRITE_ERROR);
                    ch.shutw();
                    return;
                }
            }
        }
        ep.flush();
    }

    /// Performs the write-side shutdown on the endpoint and transitions
    /// the state machine.
    pub fn shutw(&mut self, nolinger: bool) {
        if let Some(ep) = self.endpoint.as_mut() {
            ep.shutw(nolinger);
        }
        match self.state {
            SiState::Est | SiState::Con | SiState::Rdy => self.set_state(SiState::Dis),
            _ => {}
        }
    }

    /// Performs the read-side shutdown; a fully shut interface closes.
    pub fn shutr(&mut self) {
        if let Some(ep) = self.endpoint.as_mut() {
            ep.shutr();
        }
        if self.state == SiState::Dis {
            self.set_state(SiState::Clo);
        }
    }

    /// Immediate close of both sides.
    pub fn close(&mut self) {
        if let Some(ep) = self.endpoint.as_mut() {
            ep.shutw(true);
            ep.shutr();
        }
        self.set_state(SiState::Clo);
    }
}

impl fmt::Debug for StreamInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamInterface")
            .field("state", &self.state.name())
            .field("flags", &self.flags)
            .field("err_type", &self.err_type)
            .field("retries", &self.retries)
            .field("endpoint", &self.endpoint_kind())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;

    /// A scriptable in-memory endpoint for unit tests.
    #[derive(Debug, Default)]
    pub(crate) struct MockEndpoint {
        pub input: VecDeque<Vec<u8>>,
        pub output: Vec<u8>,
        pub closed_in: bool,
        pub error_in: bool,
        pub block_out: bool,
        pub shutw_called: bool,
        pub shutr_called: bool,
    }

    impl Endpoint for MockEndpoint {
        fn kind(&self) -> EndpointKind {
            EndpointKind::Connection
        }

        fn recv(&mut self, ch: &mut Channel) -> EndpointIo {
            if let Some(chunk) = self.input.pop_front() {
                let n = ch.recv(&chunk);
                EndpointIo::Progress(n)
            } else if self.error_in {
                EndpointIo::Error
            } else if self.closed_in {
                EndpointIo::Closed
            } else {
                EndpointIo::Blocked
            }
        }

        fn send(&mut self, ch: &mut Channel) -> EndpointIo {
            if self.block_out {
                return EndpointIo::Blocked;
            }
            let mut tmp = [0u8; 512];
            let n = ch.send(&mut tmp);
            self.output.extend_from_slice(&tmp[..n]);
            EndpointIo::Progress(n)
        }

        fn shutw(&mut self, _nolinger: bool) {
            self.shutw_called = true;
        }

        fn shutr(&mut self) {
            self.shutr_called = true;
        }

        fn show(&self) -> String {
            "mock".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockEndpoint;
    use super::*;
    use crate::channel::Flags;

    #[test]
    fn state_progression_names() {
        assert_eq!(SiState::Ini.name(), "INI");
        assert_eq!(SiState::Clo.name(), "CLO");
        assert!(SiState::Est.is_established());
        assert!(SiState::Con.is_connecting());
        assert!(!SiState::Clo.is_connecting());
    }

    #[test]
    fn sync_recv_moves_bytes_and_latches_close() {
        let mut ep = MockEndpoint::default();
        ep.input.push_back(b"hello".to_vec());
        ep.closed_in = true;
        let mut si = StreamInterface::new_front(Box::new(ep));
        let mut ch = Channel::new();
        si.sync_recv(&mut ch);
        assert_eq!(ch.total, 5);
        assert!(ch.flags.contains(Flags::SHUTR));
    }

    #[test]
    fn sync_recv_error_sets_flags() {
        let mut ep = MockEndpoint::default();
        ep.error_in = true;
        let mut si = StreamInterface::new_front(Box::new(ep));
        let mut ch = Channel::new();
        si.sync_recv(&mut ch);
        assert!(si.flags.contains(SiFlags::ERR));
        assert!(ch.flags.contains(Flags::READ_ERROR));
    }

    #[test]
    fn sync_send_drains_buffer() {
        let ep = MockEndpoint::default();
        let mut si = StreamInterface::new_front(Box::new(ep));
        let mut ch = Channel::new();
        ch.recv(b"response");
        ch.forward(crate::channel::FORWARD_INFINITE);
        si.sync_send(&mut ch);
        assert!(ch.is_empty());
    }

    #[test]
    fn shutdown_walks_states() {
        let ep = MockEndpoint::default();
        let mut si = StreamInterface::new_front(Box::new(ep));
        si.shutw(false);
        assert_eq!(si.state, SiState::Dis);
        si.shutr();
        assert_eq!(si.state, SiState::Clo);
    }
}
