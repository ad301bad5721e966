//! The HTTP transaction descriptor and the terminal cause/finst codes.

use bytes::Bytes;
use http::{Method, StatusCode};

/// Why a stream terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    None,
    /// Local administrative abort.
    Local,
    /// Client-side timeout.
    CliTo,
    /// Client closed or errored.
    CliCl,
    /// Server-side timeout.
    SrvTo,
    /// Server closed or errored.
    SrvCl,
    /// The proxy refused or aborted by policy.
    PrxCond,
    /// Resource exhaustion (memory, sockets, queue slots).
    Resource,
    /// Internal inconsistency.
    Internal,
    /// The destination was down.
    Down,
    /// The stream was killed from the CLI.
    Killed,
    /// Destination came back up mid-operation.
    Up,
}

impl Cause {
    /// First letter of the log termination field.
    pub fn letter(self) -> char {
        match self {
            Cause::None => '-',
            Cause::Local => 'L',
            Cause::CliTo => 'c',
            Cause::CliCl => 'C',
            Cause::SrvTo => 's',
            Cause::SrvCl => 'S',
            Cause::PrxCond => 'P',
            Cause::Resource => 'R',
            Cause::Internal => 'I',
            Cause::Down => 'D',
            Cause::Killed => 'K',
            Cause::Up => 'U',
        }
    }
}

/// The phase a transaction had reached when it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finst {
    None,
    /// Reading the client request.
    Request,
    /// Waiting in a queue for a connection slot.
    Queue,
    /// Connecting to the server.
    Connect,
    /// Waiting for response headers.
    Headers,
    /// Transferring data.
    Data,
    /// Everything transferred, last byte pending.
    Last,
    /// Held in tarpit.
    Tarpit,
}

impl Finst {
    /// Second letter of the log termination field.
    pub fn letter(self) -> char {
        match self {
            Finst::None => '-',
            Finst::Request => 'R',
            Finst::Connect => 'C',
            Finst::Headers => 'H',
            Finst::Data => 'D',
            Finst::Last => 'L',
            Finst::Queue => 'Q',
            Finst::Tarpit => 'T',
        }
    }
}

/// The two-letter termination field, e.g. `--`, `cH`, `SC`.
pub fn termination_field(cause: Cause, finst: Finst) -> [char; 2] {
    [cause.letter(), finst.letter()]
}

/// Message body framing derived from headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgFlags(pub u32);

impl MsgFlags {
    pub const VER_11: MsgFlags = MsgFlags(1 << 0);
    pub const CLEN: MsgFlags = MsgFlags(1 << 1);
    pub const CHNK: MsgFlags = MsgFlags(1 << 2);
    pub const XFER_LEN: MsgFlags = MsgFlags(1 << 3);
    pub const CONN_CLO: MsgFlags = MsgFlags(1 << 4);
    pub const BODY_TUNNEL: MsgFlags = MsgFlags(1 << 5);

    #[inline]
    pub fn contains(self, other: MsgFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: MsgFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: MsgFlags) {
        self.0 &= !other.0;
    }
}

/// Parsing progress of one HTTP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    /// Waiting for a complete header block.
    WaitHeaders,
    /// Headers parsed, body not yet started.
    Body,
    /// Body bytes flowing.
    Data,
    /// Message fully transferred.
    Done,
    /// The message is in error.
    Error,
}

/// One direction of the transaction.
#[derive(Debug)]
pub struct HttpMsg {
    pub state: MsgState,
    pub flags: MsgFlags,
    /// Announced body length when `CLEN`.
    pub body_len: u64,
    /// Remaining bytes of the current chunk when `CHNK`.
    pub chunk_len: u64,
}

impl HttpMsg {
    pub fn new() -> HttpMsg {
        HttpMsg {
            state: MsgState::WaitHeaders,
            flags: MsgFlags(0),
            body_len: 0,
            chunk_len: 0,
        }
    }
}

impl Default for HttpMsg {
    fn default() -> HttpMsg {
        HttpMsg::new()
    }
}

/// Credentials presented by the client, if any.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub method: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
}

/// The HTTP transaction attached to a stream in HTTP mode.
#[derive(Debug)]
pub struct Transaction {
    pub method: Option<Method>,
    pub status: Option<StatusCode>,
    pub req: HttpMsg,
    pub rsp: HttpMsg,
    /// Request URI as captured from the start line.
    pub uri: Option<Bytes>,
    /// Captured client cookie, for `%CC`.
    pub cli_cookie: Option<Bytes>,
    /// Captured server cookie, for `%CS`.
    pub srv_cookie: Option<Bytes>,
    pub auth: Auth,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            method: None,
            status: None,
            req: HttpMsg::new(),
            rsp: HttpMsg::new(),
            uri: None,
            cli_cookie: None,
            srv_cookie: None,
            auth: Auth::default(),
        }
    }
}

impl Default for Transaction {
    fn default() -> Transaction {
        Transaction::new()
    }
}
