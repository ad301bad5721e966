//! Sample fetches: extracting typed values out of a message in flight.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::Method;

use crate::config::Config;
use crate::sample::convert::ConvCtx;
use crate::sample::expr::{Arg, ArgSpec, ArgType, SampleExpr};
use crate::sample::{cast, Sample, SampleData, SampleFlags, SampleType};
use crate::stream::transaction::Auth;

/// Capability bits: the pipeline phases a fetch may run in.
pub mod caps {
    pub const TCP_REQ_CONN: u32 = 1 << 0;
    pub const TCP_REQ_CNT: u32 = 1 << 1;
    pub const TCP_RES_CNT: u32 = 1 << 2;
    pub const HTTP_REQ: u32 = 1 << 3;
    pub const HTTP_RES: u32 = 1 << 4;
    pub const LOG: u32 = 1 << 5;

    pub const ANY_REQ: u32 = TCP_REQ_CONN | TCP_REQ_CNT | HTTP_REQ | LOG;
    pub const ANY_RES: u32 = TCP_RES_CNT | HTTP_RES | LOG;
    pub const ANY: u32 = ANY_REQ | ANY_RES;
}

/// A decoded view of one HTTP message, owned by the caller for the
/// duration of the evaluation.
#[derive(Debug, Default, Clone)]
pub struct HttpMsgView {
    pub method: Option<Method>,
    /// Full request URI as received.
    pub uri: Bytes,
    pub version_11: bool,
    pub status: u16,
    pub headers: Vec<(Bytes, Bytes)>,
    /// Buffered body window.
    pub body: Bytes,
}

impl HttpMsgView {
    /// All values of `name`, in order.
    fn header_values<'a>(&'a self, name: &[u8]) -> impl Iterator<Item = &'a Bytes> + 'a {
        let name = name.to_vec();
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(&name))
            .map(|(_, v)| v)
    }
}

/// The owner quadruple a fetch runs against.
#[derive(Debug, Default)]
pub struct SampleCtx<'a> {
    pub config: Option<&'a Config>,
    pub req: Option<&'a HttpMsgView>,
    pub res: Option<&'a HttpMsgView>,
    pub auth: Option<&'a Auth>,
    pub client: Option<SocketAddr>,
    pub vars: Option<&'a HashMap<String, i64>>,
}

/// A registered fetch keyword.
pub struct FetchKw {
    pub name: &'static str,
    pub out_type: SampleType,
    pub caps: u32,
    pub args: &'static [ArgSpec],
    /// Returns every available occurrence, first one first.
    pub eval: fn(&SampleCtx<'_>, &[Arg]) -> Vec<Sample>,
}

impl std::fmt::Debug for FetchKw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FetchKw({})", self.name)
    }
}

fn one(smp: Sample) -> Vec<Sample> {
    vec![smp]
}

fn volatile(mut smp: Sample, vol: SampleFlags) -> Sample {
    smp.flags.insert(vol);
    smp
}

fn fetch_method(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.req.and_then(|r| r.method.clone()) {
        Some(m) => one(volatile(
            Sample::new(SampleData::Meth(m)),
            SampleFlags::CONST,
        )),
        None => Vec::new(),
    }
}

/// The path component: everything up to but excluding `?`.
fn fetch_path(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    let req = match ctx.req {
        Some(r) => r,
        None => return Vec::new(),
    };
    let uri = &req.uri;
    let end = uri.iter().position(|&b| b == b'?').unwrap_or(uri.len());
    one(volatile(
        Sample::str(uri[..end].to_vec()),
        SampleFlags::VOL_1ST,
    ))
}

/// The whole URI, query string included.
fn fetch_url(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.req {
        Some(r) => one(volatile(
            Sample::str(r.uri.to_vec()),
            SampleFlags::VOL_1ST,
        )),
        None => Vec::new(),
    }
}

fn fetch_query(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    let req = match ctx.req {
        Some(r) => r,
        None => return Vec::new(),
    };
    match req.uri.iter().position(|&b| b == b'?') {
        Some(q) => one(volatile(
            Sample::str(req.uri[q + 1..].to_vec()),
            SampleFlags::VOL_1ST,
        )),
        None => Vec::new(),
    }
}

fn fetch_url_param(ctx: &SampleCtx<'_>, args: &[Arg]) -> Vec<Sample> {
    let req = match ctx.req {
        Some(r) => r,
        None => return Vec::new(),
    };
    let name = match args.first().and_then(Arg::as_str) {
        Some(n) => n,
        None => return Vec::new(),
    };
    let delim = args
        .get(1)
        .and_then(Arg::as_str)
        .and_then(|d| d.first().copied())
        .unwrap_or(b'&');
    let query = match req.uri.iter().position(|&b| b == b'?') {
        Some(q) => &req.uri[q + 1..],
        None => return Vec::new(),
    };
    for pair in query.split(|&b| b == delim) {
        let mut it = pair.splitn(2, |&b| b == b'=');
        let k = it.next().unwrap_or(&[]);
        if k.eq_ignore_ascii_case(name) {
            let v = it.next().unwrap_or(&[]);
            return one(volatile(Sample::str(v.to_vec()), SampleFlags::VOL_1ST));
        }
    }
    Vec::new()
}

/// `hdr(name[,occ])`: without an occurrence, every value is produced in
/// order; `occ` selects one, counting from the end when negative.
fn fetch_hdr_in(msg: Option<&HttpMsgView>, args: &[Arg]) -> Vec<Sample> {
    let msg = match msg {
        Some(m) => m,
        None => return Vec::new(),
    };
    let name = match args.first().and_then(Arg::as_str) {
        Some(n) => n,
        None => return Vec::new(),
    };
    let values: Vec<&Bytes> = msg.header_values(name).collect();
    match args.get(1).and_then(Arg::as_int) {
        Some(occ) if occ != 0 => {
            let idx = if occ > 0 {
                (occ - 1) as usize
            } else {
                let back = (-occ) as usize;
                if back > values.len() {
                    return Vec::new();
                }
                values.len() - back
            };
            match values.get(idx) {
                Some(v) => one(volatile(
                    Sample::str(v.to_vec()),
                    SampleFlags::VOL_HDR,
                )),
                None => Vec::new(),
            }
        }
        _ => values
            .into_iter()
            .map(|v| volatile(Sample::str(v.to_vec()), SampleFlags::VOL_HDR))
            .collect(),
    }
}

fn fetch_req_hdr(ctx: &SampleCtx<'_>, args: &[Arg]) -> Vec<Sample> {
    fetch_hdr_in(ctx.req, args)
}

fn fetch_res_hdr(ctx: &SampleCtx<'_>, args: &[Arg]) -> Vec<Sample> {
    fetch_hdr_in(ctx.res, args)
}

/// `cookie(name)`: request cookies, every matching occurrence across all
/// `cookie` headers.
fn fetch_cookie(ctx: &SampleCtx<'_>, args: &[Arg]) -> Vec<Sample> {
    let req = match ctx.req {
        Some(r) => r,
        None => return Vec::new(),
    };
    let wanted = args.first().and_then(Arg::as_str);
    let mut out = Vec::new();
    for header in req.header_values(b"cookie") {
        for pair in header.split(|&b| b == b';') {
            let pair: &[u8] = trim(pair);
            let mut it = pair.splitn(2, |&b| b == b'=');
            let k = it.next().unwrap_or(&[]);
            let v = it.next().unwrap_or(&[]);
            let keep = match wanted {
                Some(w) => k == w,
                None => true,
            };
            if keep {
                out.push(volatile(Sample::str(v.to_vec()), SampleFlags::VOL_HDR));
            }
        }
    }
    out
}

fn trim(mut s: &[u8]) -> &[u8] {
    while let Some((b' ', rest)) = s.split_first().map(|(f, r)| (*f, r)) {
        s = rest;
    }
    while let Some((b' ', rest)) = s.split_last().map(|(l, r)| (*l, r)) {
        s = rest;
    }
    s
}

fn fetch_status(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.res {
        Some(r) if r.status != 0 => one(Sample::sint(i64::from(r.status))),
        _ => Vec::new(),
    }
}

fn fetch_auth_user(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.auth.and_then(|a| a.user.clone()) {
        Some(u) => one(Sample::str(u.into_bytes())),
        None => Vec::new(),
    }
}

fn fetch_auth_pass(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.auth.and_then(|a| a.pass.clone()) {
        Some(p) => one(Sample::str(p.into_bytes())),
        None => Vec::new(),
    }
}

fn ver_sample(v11: bool) -> Sample {
    Sample::str(if v11 { &b"1.1"[..] } else { &b"1.0"[..] }.to_vec())
}

fn fetch_req_ver(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.req {
        Some(r) => one(volatile(ver_sample(r.version_11), SampleFlags::CONST)),
        None => Vec::new(),
    }
}

fn fetch_res_ver(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.res {
        Some(r) => one(volatile(ver_sample(r.version_11), SampleFlags::CONST)),
        None => Vec::new(),
    }
}

fn fetch_req_len(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.req {
        Some(r) => {
            let mut smp = Sample::sint(r.body.len() as i64);
            smp.flags.insert(SampleFlags::MAY_CHANGE);
            one(smp)
        }
        None => Vec::new(),
    }
}

fn fetch_req_body(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.req {
        Some(r) => {
            let mut smp = Sample::new(SampleData::Bin(r.body.to_vec()));
            smp.flags.insert(SampleFlags::MAY_CHANGE);
            one(smp)
        }
        None => Vec::new(),
    }
}

fn fetch_src(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.client {
        Some(SocketAddr::V4(a)) => one(Sample::new(SampleData::Ipv4(*a.ip()))),
        Some(SocketAddr::V6(a)) => one(Sample::new(SampleData::Ipv6(*a.ip()))),
        None => Vec::new(),
    }
}

fn fetch_src_port(ctx: &SampleCtx<'_>, _args: &[Arg]) -> Vec<Sample> {
    match ctx.client {
        Some(a) => one(Sample::sint(i64::from(a.port()))),
        None => Vec::new(),
    }
}

fn fetch_fe_conn(ctx: &SampleCtx<'_>, args: &[Arg]) -> Vec<Sample> {
    let cfg = match ctx.config {
        Some(c) => c,
        None => return Vec::new(),
    };
    let id = match args.first() {
        Some(Arg::Fe(id)) => *id,
        _ => return Vec::new(),
    };
    match cfg.proxy(id) {
        Some(p) => one(Sample::sint(i64::from(
            p.feconn.load(std::sync::atomic::Ordering::Relaxed),
        ))),
        None => Vec::new(),
    }
}

fn fetch_be_conn(ctx: &SampleCtx<'_>, args: &[Arg]) -> Vec<Sample> {
    let cfg = match ctx.config {
        Some(c) => c,
        None => return Vec::new(),
    };
    let id = match args.first() {
        Some(Arg::Be(id)) => *id,
        _ => return Vec::new(),
    };
    match cfg.proxy(id) {
        Some(p) => one(Sample::sint(i64::from(
            p.beconn.load(std::sync::atomic::Ordering::Relaxed),
        ))),
        None => Vec::new(),
    }
}

const NO_ARGS: &[ArgSpec] = &[];
const HDR_ARGS: &[ArgSpec] = &[ArgSpec::req(ArgType::Str), ArgSpec::opt(ArgType::SInt)];
const COOKIE_ARGS: &[ArgSpec] = &[ArgSpec::opt(ArgType::Str)];
const URL_PARAM_ARGS: &[ArgSpec] = &[ArgSpec::req(ArgType::Str), ArgSpec::opt(ArgType::Str)];
const FE_ARGS: &[ArgSpec] = &[ArgSpec::req(ArgType::Fe)];
const BE_ARGS: &[ArgSpec] = &[ArgSpec::req(ArgType::Be)];

static FETCHES: &[FetchKw] = &[
    FetchKw {
        name: "be_conn",
        out_type: SampleType::SInt,
        caps: caps::ANY,
        args: BE_ARGS,
        eval: fetch_be_conn,
    },
    FetchKw {
        name: "cookie",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ | caps::LOG,
        args: COOKIE_ARGS,
        eval: fetch_cookie,
    },
    FetchKw {
        name: "fe_conn",
        out_type: SampleType::SInt,
        caps: caps::ANY,
        args: FE_ARGS,
        eval: fetch_fe_conn,
    },
    FetchKw {
        name: "hdr",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ | caps::LOG,
        args: HDR_ARGS,
        eval: fetch_req_hdr,
    },
    FetchKw {
        name: "http_auth_pass",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ,
        args: NO_ARGS,
        eval: fetch_auth_pass,
    },
    FetchKw {
        name: "http_auth_user",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ,
        args: NO_ARGS,
        eval: fetch_auth_user,
    },
    FetchKw {
        name: "method",
        out_type: SampleType::Meth,
        caps: caps::HTTP_REQ | caps::LOG,
        args: NO_ARGS,
        eval: fetch_method,
    },
    FetchKw {
        name: "path",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ | caps::LOG,
        args: NO_ARGS,
        eval: fetch_path,
    },
    FetchKw {
        name: "query",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ | caps::LOG,
        args: NO_ARGS,
        eval: fetch_query,
    },
    FetchKw {
        name: "req.body",
        out_type: SampleType::Bin,
        caps: caps::HTTP_REQ,
        args: NO_ARGS,
        eval: fetch_req_body,
    },
    FetchKw {
        name: "req.cook",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ | caps::LOG,
        args: COOKIE_ARGS,
        eval: fetch_cookie,
    },
    FetchKw {
        name: "req.hdr",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ | caps::LOG,
        args: HDR_ARGS,
        eval: fetch_req_hdr,
    },
    FetchKw {
        name: "req.len",
        out_type: SampleType::SInt,
        caps: caps::ANY_REQ,
        args: NO_ARGS,
        eval: fetch_req_len,
    },
    FetchKw {
        name: "req.ver",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ | caps::LOG,
        args: NO_ARGS,
        eval: fetch_req_ver,
    },
    FetchKw {
        name: "res.hdr",
        out_type: SampleType::Str,
        caps: caps::HTTP_RES | caps::LOG,
        args: HDR_ARGS,
        eval: fetch_res_hdr,
    },
    FetchKw {
        name: "res.ver",
        out_type: SampleType::Str,
        caps: caps::HTTP_RES | caps::LOG,
        args: NO_ARGS,
        eval: fetch_res_ver,
    },
    FetchKw {
        name: "src",
        out_type: SampleType::Addr,
        caps: caps::ANY,
        args: NO_ARGS,
        eval: fetch_src,
    },
    FetchKw {
        name: "src_port",
        out_type: SampleType::SInt,
        caps: caps::ANY,
        args: NO_ARGS,
        eval: fetch_src_port,
    },
    FetchKw {
        name: "status",
        out_type: SampleType::SInt,
        caps: caps::HTTP_RES | caps::LOG,
        args: NO_ARGS,
        eval: fetch_status,
    },
    FetchKw {
        name: "url",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ | caps::LOG,
        args: NO_ARGS,
        eval: fetch_url,
    },
    FetchKw {
        name: "url_param",
        out_type: SampleType::Str,
        caps: caps::HTTP_REQ | caps::LOG,
        args: URL_PARAM_ARGS,
        eval: fetch_url_param,
    },
];

/// Finds a fetch by name.
pub fn lookup(name: &str) -> Option<&'static FetchKw> {
    FETCHES.iter().find(|f| f.name == name)
}

impl SampleExpr {
    /// Evaluates every occurrence through the converter chain, yielding
    /// `(sample, is_last)` pairs; ACL evaluation drives this iterator.
    pub fn eval_occurrences(&self, ctx: &SampleCtx<'_>) -> Vec<(Sample, bool)> {
        let occurrences = (self.fetch.eval)(ctx, &self.fetch_args);
        let n = occurrences.len();
        let mut out = Vec::with_capacity(n);
        for (i, mut smp) in occurrences.into_iter().enumerate() {
            let is_last = i + 1 == n;
            if !is_last {
                smp.flags.insert(SampleFlags::NOT_LAST);
            }
            let mut ok = true;
            for (conv, args) in &self.convs {
                if conv.in_type != SampleType::Any && conv.in_type != smp.ty() {
                    if !cast(&mut smp, conv.in_type) {
                        ok = false;
                        break;
                    }
                }
                let cctx = ConvCtx { vars: ctx.vars };
                if !(conv.eval)(args, &mut smp, &cctx) {
                    ok = false;
                    break;
                }
            }
            if ok {
                out.push((smp, is_last));
            }
        }
        out
    }

    /// First successful occurrence, if any.
    pub fn eval(&self, ctx: &SampleCtx<'_>) -> Option<Sample> {
        self.eval_occurrences(ctx).into_iter().next().map(|(s, _)| s)
    }
}
