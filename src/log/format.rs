//! The log-format mini-language.
//!
//! A format string such as `"%ci:%cp [%tr] %ft %b/%s %ST %B %ts"` is
//! compiled once into a node list; each log emission walks the nodes
//! against a [`Report`] snapshot of the stream. `%{+X}name` applies
//! option modifiers, `%[expr]` embeds a sample expression.

use std::fmt::Write as _;
use std::net::SocketAddr;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::sample::{self, SampleCtx, SampleData, SampleExpr};

/// Node option bits.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Options(pub u32);

impl Options {
    pub const NONE: Options = Options(0);
    /// Render `-` instead of nothing when the value is missing.
    pub const MANDATORY: Options = Options(1 << 0);
    /// Wrap the value in double quotes.
    pub const QUOTE: Options = Options(1 << 1);
    /// Hex-encode the value.
    pub const HEXA: Options = Options(1 << 2);
    /// Escape non-printable characters.
    pub const ESC: Options = Options(1 << 3);

    #[inline]
    pub fn contains(self, other: Options) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    fn insert(&mut self, other: Options) {
        self.0 |= other.0;
    }

    #[inline]
    fn remove(&mut self, other: Options) {
        self.0 &= !other.0;
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Options({:#x})", self.0)
    }
}

/// Built-in variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Var {
    /// `%o` global option node: applies its options to the whole list.
    GlobalOpt,
    BytesIn,     // %U
    BytesOut,    // %B
    Hostname,    // %H
    UniqueId,    // %ID
    Status,      // %ST
    DateGmt,     // %T
    DateLocal,   // %Tl
    Timestamp,   // %Ts
    AcceptDate,  // %t
    RequestDate, // %tr
    Ms,          // %ms
    Ta,
    Tc,
    Th,
    Ti,
    Tq,
    TR,
    Tr,
    Td,
    Tt,
    Tw,
    ActConn,      // %ac
    FeConn,       // %fc
    BeConn,       // %bc
    SrvConn,      // %sc
    Retries,      // %rc
    BackendQueue, // %bq
    ServerQueue,  // %sq
    Frontend,     // %f
    FrontendXprt, // %ft
    Backend,      // %b
    Server,       // %s
    ClientIp,     // %ci
    ClientPort,   // %cp
    FrontendIp,   // %fi
    FrontendPort, // %fp
    BackendIp,    // %bi
    BackendPort,  // %bp
    ServerIp,     // %si
    ServerPort,   // %sp
    ReqHdrs,      // %hr
    ReqHdrList,   // %hrl
    ResHdrs,      // %hs
    ResHdrList,   // %hsl
    ReqLine,      // %r
    HttpMethod,   // %HM
    HttpPath,     // %HP
    HttpQuery,    // %HQ
    HttpUri,      // %HU
    HttpVersion,  // %HV
    LogCnt,       // %lc
    ReqCounter,   // %rt
    Pid,          // %pid
    TermState,    // %ts
    TermStateCk,  // %tsc
    CliCookie,    // %CC
    SrvCookie,    // %CS
    SslCipher,    // %sslc, out of scope: renders '-'
    SslVersion,   // %sslv
}

fn var_by_name(name: &str) -> Option<Var> {
    Some(match name {
        "o" => Var::GlobalOpt,
        "U" => Var::BytesIn,
        "B" => Var::BytesOut,
        "H" => Var::Hostname,
        "ID" => Var::UniqueId,
        "ST" => Var::Status,
        "T" => Var::DateGmt,
        "Tl" => Var::DateLocal,
        "Ts" => Var::Timestamp,
        "t" => Var::AcceptDate,
        "tr" => Var::RequestDate,
        "ms" => Var::Ms,
        "Ta" => Var::Ta,
        "Tc" => Var::Tc,
        "Th" => Var::Th,
        "Ti" => Var::Ti,
        "Tq" => Var::Tq,
        "TR" => Var::TR,
        "Tr" => Var::Tr,
        "Td" => Var::Td,
        "Tt" => Var::Tt,
        "Tw" => Var::Tw,
        "ac" => Var::ActConn,
        "fc" => Var::FeConn,
        "bc" => Var::BeConn,
        "sc" => Var::SrvConn,
        "rc" => Var::Retries,
        "bq" => Var::BackendQueue,
        "sq" => Var::ServerQueue,
        "f" => Var::Frontend,
        "ft" => Var::FrontendXprt,
        "b" => Var::Backend,
        "s" => Var::Server,
        "ci" => Var::ClientIp,
        "cp" => Var::ClientPort,
        "fi" => Var::FrontendIp,
        "fp" => Var::FrontendPort,
        "bi" => Var::BackendIp,
        "bp" => Var::BackendPort,
        "si" => Var::ServerIp,
        "sp" => Var::ServerPort,
        "hr" => Var::ReqHdrs,
        "hrl" => Var::ReqHdrList,
        "hs" => Var::ResHdrs,
        "hsl" => Var::ResHdrList,
        "r" => Var::ReqLine,
        "HM" => Var::HttpMethod,
        "HP" => Var::HttpPath,
        "HQ" => Var::HttpQuery,
        "HU" => Var::HttpUri,
        "HV" => Var::HttpVersion,
        "lc" => Var::LogCnt,
        "rt" => Var::ReqCounter,
        "pid" => Var::Pid,
        "ts" => Var::TermState,
        "tsc" => Var::TermStateCk,
        "CC" => Var::CliCookie,
        "CS" => Var::SrvCookie,
        "sslc" => Var::SslCipher,
        "sslv" => Var::SslVersion,
        _ => return None,
    })
}

/// One compiled node.
#[derive(Debug)]
pub enum Node {
    Text(String),
    Separator,
    Var(Var, Options),
    Expr(Box<SampleExpr>, Options),
}

/// Parser states, in the order the scanner moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PState {
    Init,
    Text,
    Separator,
    StartVar,
    StArg,
    EdArg,
    StExpr,
    EdExpr,
    Var,
    End,
}

/// Compiles a format string into its node list.
pub fn compile(fmt: &str) -> crate::Result<Vec<Node>> {
    let bad = |msg: String| crate::Error::new_log_format(msg);
    let mut nodes = Vec::new();
    let mut global_opts = Options::NONE;
    let mut state = PState::Init;
    let mut text = String::new();
    let mut arg = String::new();
    let mut expr = String::new();
    let mut var_name = String::new();
    let mut chars = fmt.chars().peekable();

    // applies `+M`/`-Q`-style modifiers accumulated in `arg`
    fn apply_args(arg: &str, opts: &mut Options) -> Result<(), String> {
        for tok in arg.split(',').filter(|t| !t.is_empty()) {
            let (sub, name) = match tok.as_bytes()[0] {
                b'+' => (false, &tok[1..]),
                b'-' => (true, &tok[1..]),
                _ => (false, tok),
            };
            let bit = match name {
                "M" => Options::MANDATORY,
                "Q" => Options::QUOTE,
                "X" => Options::HEXA,
                "E" => Options::ESC,
                other => return Err(format!("unknown format option '{}'", other)),
            };
            if sub {
                opts.remove(bit);
            } else {
                opts.insert(bit);
            }
        }
        Ok(())
    }

    loop {
        let c = chars.next();
        state = match (state, c) {
            (PState::Init, None) | (PState::Text, None) | (PState::Separator, None) => {
                if !text.is_empty() {
                    nodes.push(Node::Text(std::mem::take(&mut text)));
                }
                PState::End
            }
            (PState::Init, Some('%')) | (PState::Text, Some('%')) | (PState::Separator, Some('%')) => {
                if !text.is_empty() {
                    nodes.push(Node::Text(std::mem::take(&mut text)));
                }
                PState::StartVar
            }
            (PState::Init, Some(' ')) | (PState::Separator, Some(' ')) => {
                nodes.push(Node::Separator);
                PState::Separator
            }
            (PState::Init, Some(other))
            | (PState::Text, Some(other))
            | (PState::Separator, Some(other)) => {
                text.push(other);
                PState::Text
            }
            (PState::StartVar, Some('%')) => {
                text.push('%');
                PState::Text
            }
            (PState::StartVar, Some('{')) => PState::StArg,
            (PState::StartVar, Some('[')) => PState::StExpr,
            (PState::StartVar, Some(c)) if c.is_ascii_alphanumeric() => {
                var_name.push(c);
                PState::Var
            }
            (PState::StartVar, _) => {
                return Err(bad("invalid character after '%'".into()));
            }
            (PState::StArg, Some('}')) => PState::EdArg,
            (PState::StArg, Some(c)) => {
                arg.push(c);
                PState::StArg
            }
            (PState::StArg, None) => return Err(bad("unterminated '%{' argument".into())),
            (PState::EdArg, Some('[')) => PState::StExpr,
            (PState::EdArg, Some(c)) if c.is_ascii_alphanumeric() => {
                var_name.push(c);
                PState::Var
            }
            (PState::EdArg, _) => return Err(bad("expected a variable after '%{...}'".into())),
            (PState::StExpr, Some(']')) => PState::EdExpr,
            (PState::StExpr, Some(c)) => {
                expr.push(c);
                PState::StExpr
            }
            (PState::StExpr, None) => return Err(bad("unterminated '%[' expression".into())),
            (PState::EdExpr, c) => {
                let mut opts = global_opts;
                apply_args(&arg, &mut opts).map_err(bad)?;
                arg.clear();
                let compiled = sample::parse_expr(
                    &expr,
                    sample::fetch::caps::LOG,
                    &sample::ExprCtx {
                        rule_kind: "log-format",
                        ..Default::default()
                    },
                )?;
                expr.clear();
                nodes.push(Node::Expr(Box::new(compiled), opts));
                // the consumed lookahead character re-enters the scanner
                match c {
                    None => PState::End,
                    Some('%') => PState::StartVar,
                    Some(' ') => {
                        nodes.push(Node::Separator);
                        PState::Separator
                    }
                    Some(other) => {
                        text.push(other);
                        PState::Text
                    }
                }
            }
            (PState::Var, c) => {
                let done = match c {
                    Some(ch) if ch.is_ascii_alphanumeric() => {
                        var_name.push(ch);
                        false
                    }
                    _ => true,
                };
                if !done {
                    PState::Var
                } else {
                    let var = var_by_name(&var_name)
                        .ok_or_else(|| bad(format!("unknown variable '%{}'", var_name)))?;
                    var_name.clear();
                    let mut opts = global_opts;
                    apply_args(&arg, &mut opts).map_err(bad)?;
                    arg.clear();
                    if var == Var::GlobalOpt {
                        global_opts = opts;
                    } else {
                        nodes.push(Node::Var(var, opts));
                    }
                    match c {
                        None => PState::End,
                        Some('%') => PState::StartVar,
                        Some(' ') => {
                            nodes.push(Node::Separator);
                            PState::Separator
                        }
                        Some(other) => {
                            text.push(other);
                            PState::Text
                        }
                    }
                }
            }
            (PState::End, _) => break,
        };
        if state == PState::End {
            break;
        }
    }
    Ok(nodes)
}

/// Everything a log line can mention, snapshotted at emission time.
#[derive(Debug, Default)]
pub struct Report<'a> {
    pub client: Option<SocketAddr>,
    pub frontend_addr: Option<SocketAddr>,
    pub backend_addr: Option<SocketAddr>,
    pub server_addr: Option<SocketAddr>,
    pub hostname: &'a str,
    pub frontend: &'a str,
    /// Frontend with its transport annotation (`fe~` for TLS).
    pub frontend_xprt: &'a str,
    pub backend: &'a str,
    pub server: &'a str,
    pub status: Option<u16>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub unique_id: Option<&'a str>,
    pub accept_date: Option<OffsetDateTime>,
    pub request_date: Option<OffsetDateTime>,
    /// Timers in milliseconds, -1 when the phase was never reached.
    pub t_request: i64,
    pub t_queue: i64,
    pub t_connect: i64,
    pub t_response: i64,
    pub t_active: i64,
    pub t_total: i64,
    pub t_idle: i64,
    pub t_handshake: i64,
    /// The whole line is being logged before the transfer finished.
    pub log_asap: bool,
    pub actconn: u32,
    pub feconn: u32,
    pub beconn: u32,
    pub srv_conn: u32,
    pub retries: u32,
    pub backend_queue: u32,
    pub server_queue: u32,
    pub req_counter: u64,
    pub log_counter: u64,
    pub termination: [char; 2],
    /// Persistence cookie markers appended to `%tsc`.
    pub cookie_flags: [char; 2],
    pub req_captures: &'a [&'a str],
    pub res_captures: &'a [&'a str],
    pub method: Option<&'a str>,
    pub uri: Option<&'a str>,
    pub http_version: Option<&'a str>,
    pub cli_cookie: Option<&'a str>,
    pub srv_cookie: Option<&'a str>,
    /// Sample evaluation context for `%[expr]` nodes.
    pub sample_ctx: Option<&'a SampleCtx<'a>>,
}

const DATE_FMT: &[FormatItem<'static>] =
    format_description!("[day]/[month repr:short]/[year]:[hour]:[minute]:[second]");

/// `dd/mmm/YYYY:HH:MM:SS.mmm`.
pub fn date2str_log(date: OffsetDateTime) -> String {
    let mut s = date.format(&DATE_FMT).unwrap_or_default();
    let _ = write!(s, ".{:03}", date.millisecond());
    s
}

fn push_escaped(out: &mut Vec<u8>, value: &[u8], opts: Options) {
    if opts.contains(Options::QUOTE) {
        out.push(b'"');
    }
    if opts.contains(Options::HEXA) {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        for &b in value {
            out.push(HEX[(b >> 4) as usize]);
            out.push(HEX[(b & 0xf) as usize]);
        }
    } else if opts.contains(Options::ESC) {
        for &b in value {
            match b {
                b'"' | b'\\' => {
                    out.push(b'\\');
                    out.push(b);
                }
                0x20..=0x7e => out.push(b),
                _ => {
                    let esc = format!("\\x{:02x}", b);
                    out.extend_from_slice(esc.as_bytes());
                }
            }
        }
    } else {
        out.extend_from_slice(value);
    }
    if opts.contains(Options::QUOTE) {
        out.push(b'"');
    }
}

fn push_value(out: &mut Vec<u8>, value: Option<&[u8]>, opts: Options) {
    match value {
        Some(v) => push_escaped(out, v, opts),
        None => {
            if opts.contains(Options::MANDATORY) {
                push_escaped(out, b"-", opts);
            }
        }
    }
}

fn push_int(out: &mut Vec<u8>, v: i64, opts: Options) {
    let mut buf = itoa::Buffer::new();
    push_escaped(out, buf.format(v).as_bytes(), opts);
}

fn push_timer(out: &mut Vec<u8>, v: i64, tentative: bool, opts: Options) {
    let mut s = String::new();
    if tentative && v >= 0 {
        s.push('+');
    }
    let _ = write!(s, "{}", v);
    push_escaped(out, s.as_bytes(), opts);
}

fn ip_of(addr: Option<SocketAddr>, hex: bool) -> Option<Vec<u8>> {
    let addr = addr?;
    Some(if hex {
        match addr {
            SocketAddr::V4(a) => {
                let o = a.ip().octets();
                format!("{:02X}{:02X}{:02X}{:02X}", o[0], o[1], o[2], o[3]).into_bytes()
            }
            SocketAddr::V6(a) => {
                let o = a.ip().octets();
                let mut s = String::with_capacity(32);
                for b in o.iter() {
                    let _ = write!(s, "{:02X}", b);
                }
                s.into_bytes()
            }
        }
    } else {
        addr.ip().to_string().into_bytes()
    })
}

fn port_of(addr: Option<SocketAddr>, hex: bool) -> Option<Vec<u8>> {
    let addr = addr?;
    Some(if hex {
        format!("{:04X}", addr.port()).into_bytes()
    } else {
        addr.port().to_string().into_bytes()
    })
}

fn captures(list: &[&str], braces: bool, out: &mut Vec<u8>, opts: Options) {
    if list.is_empty() {
        push_value(out, None, opts);
        return;
    }
    if braces {
        let joined = list.join("|");
        out.push(b'{');
        push_escaped(out, joined.as_bytes(), opts);
        out.push(b'}');
    } else {
        for (i, cap) in list.iter().enumerate() {
            if i > 0 {
                out.push(b' ');
            }
            push_escaped(out, cap.as_bytes(), opts);
        }
    }
}

/// Renders a compiled node list against a report.
pub fn render(nodes: &[Node], report: &Report<'_>, out: &mut Vec<u8>) {
    for node in nodes {
        match node {
            Node::Text(t) => out.extend_from_slice(t.as_bytes()),
            Node::Separator => out.push(b' '),
            Node::Expr(expr, opts) => {
                let value = report
                    .sample_ctx
                    .and_then(|ctx| expr.eval(ctx))
                    .and_then(|mut smp| {
                        if !sample::cast(&mut smp, sample::SampleType::Str) {
                            return None;
                        }
                        match smp.data {
                            SampleData::Str(s) => Some(s),
                            _ => None,
                        }
                    });
                push_value(out, value.as_deref(), *opts);
            }
            Node::Var(var, opts) => render_var(*var, *opts, report, out),
        }
    }
}

fn render_var(var: Var, opts: Options, r: &Report<'_>, out: &mut Vec<u8>) {
    let hex = opts.contains(Options::HEXA);
    match var {
        Var::GlobalOpt => {}
        Var::BytesIn => push_int(out, r.bytes_in as i64, opts),
        Var::BytesOut => push_timer(out, r.bytes_out as i64, r.log_asap, opts),
        Var::Hostname => push_value(out, Some(r.hostname.as_bytes()), opts),
        Var::UniqueId => push_value(out, r.unique_id.map(|s| s.as_bytes()), opts),
        Var::Status => match r.status {
            Some(s) => push_int(out, i64::from(s), opts),
            None => push_value(out, None, opts),
        },
        Var::DateGmt => match r.accept_date {
            Some(d) => {
                let s = d
                    .to_offset(time::UtcOffset::UTC)
                    .format(&DATE_FMT)
                    .unwrap_or_default();
                push_value(out, Some(s.as_bytes()), opts)
            }
            None => push_value(out, None, opts),
        },
        Var::DateLocal => match r.accept_date {
            Some(d) => {
                let s = d.format(&DATE_FMT).unwrap_or_default();
                push_value(out, Some(s.as_bytes()), opts)
            }
            None => push_value(out, None, opts),
        },
        Var::Timestamp => match r.accept_date {
            Some(d) => push_int(out, d.unix_timestamp(), opts),
            None => push_value(out, None, opts),
        },
        Var::AcceptDate => match r.accept_date {
            Some(d) => push_value(out, Some(date2str_log(d).as_bytes()), opts),
            None => push_value(out, None, opts),
        },
        Var::RequestDate => match r.request_date.or(r.accept_date) {
            Some(d) => push_value(out, Some(date2str_log(d).as_bytes()), opts),
            None => push_value(out, None, opts),
        },
        Var::Ms => match r.accept_date {
            Some(d) => {
                let s = format!("{:03}", d.millisecond());
                push_value(out, Some(s.as_bytes()), opts)
            }
            None => push_value(out, None, opts),
        },
        Var::Ta => push_timer(out, r.t_active, r.log_asap, opts),
        Var::Tc => push_timer(out, r.t_connect, false, opts),
        Var::Th => push_timer(out, r.t_handshake, false, opts),
        Var::Ti => push_timer(out, r.t_idle, false, opts),
        Var::Tq => push_timer(out, r.t_request + r.t_idle.max(0) + r.t_handshake.max(0), false, opts),
        Var::TR => push_timer(out, r.t_request, false, opts),
        Var::Tr => push_timer(out, r.t_response, false, opts),
        Var::Td => push_timer(
            out,
            if r.t_total < 0 {
                -1
            } else {
                (r.t_total
                    - r.t_request.max(0)
                    - r.t_queue.max(0)
                    - r.t_connect.max(0)
                    - r.t_response.max(0))
                .max(0)
            },
            false,
            opts,
        ),
        Var::Tt => push_timer(out, r.t_total, r.log_asap, opts),
        Var::Tw => push_timer(out, r.t_queue, false, opts),
        Var::ActConn => push_int(out, i64::from(r.actconn), opts),
        Var::FeConn => push_int(out, i64::from(r.feconn), opts),
        Var::BeConn => push_int(out, i64::from(r.beconn), opts),
        Var::SrvConn => push_int(out, i64::from(r.srv_conn), opts),
        Var::Retries => push_int(out, i64::from(r.retries), opts),
        Var::BackendQueue => push_int(out, i64::from(r.backend_queue), opts),
        Var::ServerQueue => push_int(out, i64::from(r.server_queue), opts),
        Var::Frontend => push_value(out, Some(r.frontend.as_bytes()), opts),
        Var::FrontendXprt => push_value(out, Some(r.frontend_xprt.as_bytes()), opts),
        Var::Backend => push_value(out, Some(r.backend.as_bytes()), opts),
        Var::Server => push_value(out, Some(r.server.as_bytes()), opts),
        Var::ClientIp => push_value(out, ip_of(r.client, hex).as_deref(), opts),
        Var::ClientPort => push_value(out, port_of(r.client, hex).as_deref(), opts),
        Var::FrontendIp => push_value(out, ip_of(r.frontend_addr, hex).as_deref(), opts),
        Var::FrontendPort => push_value(out, port_of(r.frontend_addr, hex).as_deref(), opts),
        Var::BackendIp => push_value(out, ip_of(r.backend_addr, hex).as_deref(), opts),
        Var::BackendPort => push_value(out, port_of(r.backend_addr, hex).as_deref(), opts),
        Var::ServerIp => push_value(out, ip_of(r.server_addr, hex).as_deref(), opts),
        Var::ServerPort => push_value(out, port_of(r.server_addr, hex).as_deref(), opts),
        Var::ReqHdrs => captures(r.req_captures, true, out, opts),
        Var::ReqHdrList => captures(r.req_captures, false, out, opts),
        Var::ResHdrs => captures(r.res_captures, true, out, opts),
        Var::ResHdrList => captures(r.res_captures, false, out, opts),
        Var::ReqLine => {
            let line = match (r.method, r.uri, r.http_version) {
                (Some(m), Some(u), Some(v)) => Some(format!("{} {} HTTP/{}", m, u, v)),
                _ => None,
            };
            push_value(out, line.as_deref().map(|s| s.as_bytes()), opts)
        }
        Var::HttpMethod => push_value(out, r.method.map(|s| s.as_bytes()), opts),
        Var::HttpPath => {
            let path = r.uri.map(|u| match u.find('?') {
                Some(q) => &u[..q],
                None => u,
            });
            push_value(out, path.map(|s| s.as_bytes()), opts)
        }
        Var::HttpQuery => {
            let q = r.uri.and_then(|u| u.find('?').map(|i| &u[i + 1..]));
            push_value(out, q.map(|s| s.as_bytes()), opts)
        }
        Var::HttpUri => push_value(out, r.uri.map(|s| s.as_bytes()), opts),
        Var::HttpVersion => push_value(out, r.http_version.map(|s| s.as_bytes()), opts),
        Var::LogCnt => push_int(out, r.log_counter as i64, opts),
        Var::ReqCounter => push_int(out, r.req_counter as i64, opts),
        Var::Pid => push_int(out, i64::from(std::process::id()), opts),
        Var::TermState => {
            let s: String = r.termination.iter().collect();
            push_value(out, Some(s.as_bytes()), opts)
        }
        Var::TermStateCk => {
            let s: String = r
                .termination
                .iter()
                .chain(r.cookie_flags.iter())
                .collect();
            push_value(out, Some(s.as_bytes()), opts)
        }
        Var::CliCookie => push_value(out, r.cli_cookie.map(|s| s.as_bytes()), opts),
        Var::SrvCookie => push_value(out, r.srv_cookie.map(|s| s.as_bytes()), opts),
        // TLS is terminated outside this crate; the fields stay dashes
        Var::SslCipher | Var::SslVersion => push_value(out, Some(b"-"), opts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn base_report() -> Report<'static> {
        Report {
            client: Some("192.0.2.1:33000".parse().unwrap()),
            hostname: "lb1",
            frontend: "web",
            frontend_xprt: "web",
            backend: "app",
            server: "app1",
            status: Some(200),
            bytes_out: 1234,
            accept_date: Some(datetime!(2019-07-30 13:45:59.123 UTC)),
            t_request: 2,
            t_queue: 0,
            t_connect: 1,
            t_response: 5,
            t_active: 8,
            t_total: 8,
            t_idle: -1,
            t_handshake: -1,
            termination: ['-', '-'],
            cookie_flags: ['-', '-'],
            method: Some("GET"),
            uri: Some("/x?q=1"),
            http_version: Some("1.1"),
            ..Default::default()
        }
    }

    fn render_str(fmt: &str, r: &Report<'_>) -> String {
        let nodes = compile(fmt).unwrap();
        let mut out = Vec::new();
        render(&nodes, r, &mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn literal_text_and_percent_escape() {
        let r = base_report();
        assert_eq!(render_str("hello %% world", &r), "hello % world");
    }

    #[test]
    fn classic_http_line() {
        let r = base_report();
        let line = render_str("%ci:%cp [%tr] %ft %b/%s %ST %B %ts %r", &r);
        assert_eq!(
            line,
            "192.0.2.1:33000 [30/Jul/2019:13:45:59.123] web app/app1 200 1234 -- \
             GET /x?q=1 HTTP/1.1"
        );
    }

    #[test]
    fn timers_render_signed_with_dash_one() {
        let r = base_report();
        assert_eq!(render_str("%TR/%Tw/%Tc/%Tr/%Ta", &r), "2/0/1/5/8");
        let mut r = base_report();
        r.t_response = -1;
        assert_eq!(render_str("%Tr", &r), "-1");
    }

    #[test]
    fn log_asap_prefixes_plus() {
        let mut r = base_report();
        r.log_asap = true;
        assert_eq!(render_str("%B %Tt", &r), "+1234 +8");
    }

    #[test]
    fn unknown_variable_is_rejected() {
        assert!(compile("%nosuch").is_err());
        assert!(compile("%{+Z}B").is_err());
        assert!(compile("%[").is_err());
    }

    #[test]
    fn quote_and_hex_modifiers() {
        let r = base_report();
        assert_eq!(render_str("%{+Q}r", &r), "\"GET /x?q=1 HTTP/1.1\"");
        assert_eq!(render_str("%{+X}cp", &r), "80E8");
    }

    #[test]
    fn global_option_node_applies_to_the_rest() {
        let r = base_report();
        assert_eq!(render_str("%{+Q}o %HM %HP", &r), " \"GET\" \"/x\"");
    }

    #[test]
    fn mandatory_renders_dash_for_missing() {
        let mut r = base_report();
        r.unique_id = None;
        assert_eq!(render_str("%{+M}ID", &r), "-");
        assert_eq!(render_str("%ID", &r), "");
    }

    #[test]
    fn capture_lists_in_brace_and_space_form() {
        let mut r = base_report();
        let caps = ["curl/7.9", "example.com"];
        r.req_captures = &caps;
        assert_eq!(render_str("%hr", &r), "{curl/7.9|example.com}");
        assert_eq!(render_str("%hrl", &r), "curl/7.9 example.com");
    }

    #[test]
    fn http_pieces() {
        let r = base_report();
        assert_eq!(render_str("%HM %HP %HQ %HU %HV", &r), "GET /x q=1 /x?q=1 1.1");
    }

    #[test]
    fn termination_state_with_cookies() {
        let mut r = base_report();
        r.termination = ['s', 'H'];
        r.cookie_flags = ['N', 'I'];
        assert_eq!(render_str("%ts %tsc", &r), "sH sHNI");
    }

    #[test]
    fn sample_expressions_embed() {
        use crate::sample::HttpMsgView;
        let req = HttpMsgView {
            method: Some(http::Method::GET),
            uri: bytes::Bytes::from_static(b"/x"),
            version_11: true,
            status: 0,
            headers: vec![(
                bytes::Bytes::from_static(b"user-agent"),
                bytes::Bytes::from_static(b"curl"),
            )],
            body: bytes::Bytes::new(),
        };
        let ctx = SampleCtx {
            req: Some(&req),
            ..Default::default()
        };
        let mut r = base_report();
        r.sample_ctx = Some(&ctx);
        assert_eq!(render_str("ua=%[hdr(user-agent)]", &r), "ua=curl");
        assert_eq!(render_str("n=%[hdr(user-agent),length]", &r), "n=4");
    }

    #[test]
    fn date2str_log_shape() {
        let d = datetime!(2019-07-30 13:45:59.007 UTC);
        assert_eq!(date2str_log(d), "30/Jul/2019:13:45:59.007");
    }

    #[test]
    fn ssl_fields_render_dash() {
        let r = base_report();
        assert_eq!(render_str("%sslc/%sslv", &r), "-/-");
    }
}
