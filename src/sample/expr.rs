//! Sample expression parsing and argument resolution.
//!
//! An expression is one fetch keyword with optional arguments, followed by
//! any number of converters: `fetch(args),conv(args),conv(args)`. Argument
//! lists are typed against the keyword's declared specification. Arguments
//! that name configuration objects (proxies, servers, tables, userlists)
//! or regexes stay *unresolved* at parse time; a single post-configuration
//! pass substitutes the real objects, reporting errors with the exact
//! source position the expression came from.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use regex::bytes::Regex;

use crate::config::{Config, ProxyId, ServerId, TableId, UserListId};
use crate::error::{Error, Expr};
use crate::sample::convert::ConvKw;
use crate::sample::fetch::FetchKw;
use crate::sample::{cast_allowed, SampleType};

/// Declared type of one argument position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Str,
    SInt,
    Ipv4,
    Ipv6,
    Msk4,
    Msk6,
    Reg,
    Var,
    Usr,
    Srv,
    Fe,
    Be,
    Tab,
    PbufFnum,
}

/// One position of an argument specification.
#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub ty: ArgType,
    pub required: bool,
}

impl ArgSpec {
    pub const fn req(ty: ArgType) -> ArgSpec {
        ArgSpec { ty, required: true }
    }

    pub const fn opt(ty: ArgType) -> ArgSpec {
        ArgSpec {
            ty,
            required: false,
        }
    }
}

/// A parsed, possibly not yet resolved, argument.
#[derive(Debug, Clone)]
pub enum Arg {
    Str(Vec<u8>),
    SInt(i64),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Msk4(Ipv4Addr),
    Msk6(Ipv6Addr),
    Reg(Regex),
    Var(String),
    Usr(UserListId),
    Srv(ServerId),
    Fe(ProxyId),
    Be(ProxyId),
    Tab(TableId),
    PbufFnum(Vec<u32>),
    /// Placeholder awaiting post-configuration resolution; the index
    /// points into the expression's deferred list.
    Unresolved(usize),
}

impl Arg {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::SInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_reg(&self) -> Option<&Regex> {
        match self {
            Arg::Reg(r) => Some(r),
            _ => None,
        }
    }
}

/// Where an expression came from, for resolution-time error reports.
#[derive(Debug, Clone, Default)]
pub struct ExprCtx {
    pub rule_kind: &'static str,
    pub file: String,
    pub line: u32,
    pub keyword: String,
}

impl fmt::Display for ExprCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' at {}:{}",
            self.rule_kind, self.keyword, self.file, self.line
        )
    }
}

/// An argument whose referent only exists after the configuration is
/// complete.
#[derive(Debug, Clone)]
pub struct UnresolvedArg {
    pub ty: ArgType,
    pub raw: String,
    pub ctx: ExprCtx,
}

/// A compiled expression: one fetch and its converter chain.
pub struct SampleExpr {
    pub fetch: &'static FetchKw,
    pub fetch_args: Vec<Arg>,
    pub convs: Vec<(&'static ConvKw, Vec<Arg>)>,
    pub deferred: Vec<UnresolvedArg>,
}

impl fmt::Debug for SampleExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("SampleExpr");
        s.field("fetch", &self.fetch.name);
        s.field(
            "convs",
            &self.convs.iter().map(|(c, _)| c.name).collect::<Vec<_>>(),
        );
        s.finish()
    }
}

/// Splits `name(args)` into the keyword and the raw argument text.
fn split_term(term: &str) -> crate::Result<(&str, Option<&str>)> {
    let term = term.trim();
    match term.find('(') {
        Some(open) => {
            if !term.ends_with(')') {
                return Err(Error::new_expr(Expr::Arg));
            }
            Ok((&term[..open], Some(&term[open + 1..term.len() - 1])))
        }
        None => Ok((term, None)),
    }
}

/// Splits a full expression on top-level commas, respecting parentheses.
fn split_terms(input: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&input[start..]);
    terms
}

fn parse_args(
    raw: Option<&str>,
    spec: &'static [ArgSpec],
    ctx: &ExprCtx,
    keyword: &str,
    deferred: &mut Vec<UnresolvedArg>,
) -> crate::Result<Vec<Arg>> {
    let parts: Vec<&str> = match raw {
        Some(r) if !r.is_empty() => r.split(',').map(|s| s.trim()).collect(),
        _ => Vec::new(),
    };
    if parts.len() > spec.len() {
        return Err(Error::new_expr(Expr::Arg));
    }
    let mut args = Vec::with_capacity(spec.len());
    for (i, s) in spec.iter().enumerate() {
        let raw = parts.get(i).copied();
        match raw {
            None | Some("") => {
                if s.required {
                    return Err(Error::new_expr(Expr::Arg));
                }
                break;
            }
            Some(text) => {
                args.push(parse_one_arg(text, s.ty, ctx, keyword, deferred)?);
            }
        }
    }
    Ok(args)
}

fn parse_one_arg(
    text: &str,
    ty: ArgType,
    ctx: &ExprCtx,
    keyword: &str,
    deferred: &mut Vec<UnresolvedArg>,
) -> crate::Result<Arg> {
    let defer = |deferred: &mut Vec<UnresolvedArg>| {
        let mut ctx = ctx.clone();
        ctx.keyword = keyword.to_string();
        deferred.push(UnresolvedArg {
            ty,
            raw: text.to_string(),
            ctx,
        });
        Arg::Unresolved(deferred.len() - 1)
    };
    Ok(match ty {
        ArgType::Str => Arg::Str(text.as_bytes().to_vec()),
        ArgType::SInt => Arg::SInt(
            text.parse()
                .map_err(|_| Error::new_expr(Expr::Arg))?,
        ),
        ArgType::Ipv4 => Arg::Ipv4(text.parse().map_err(|_| Error::new_expr(Expr::Arg))?),
        ArgType::Ipv6 => Arg::Ipv6(text.parse().map_err(|_| Error::new_expr(Expr::Arg))?),
        ArgType::Msk4 => {
            // either a dotted mask or a prefix length
            if let Ok(len) = text.parse::<u8>() {
                if len > 32 {
                    return Err(Error::new_expr(Expr::Arg));
                }
                let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
                Arg::Msk4(Ipv4Addr::from(mask))
            } else {
                Arg::Msk4(text.parse().map_err(|_| Error::new_expr(Expr::Arg))?)
            }
        }
        ArgType::Msk6 => {
            if let Ok(len) = text.parse::<u8>() {
                if len > 128 {
                    return Err(Error::new_expr(Expr::Arg));
                }
                let mask = if len == 0 {
                    0u128
                } else {
                    u128::MAX << (128 - len)
                };
                Arg::Msk6(Ipv6Addr::from(mask))
            } else {
                Arg::Msk6(text.parse().map_err(|_| Error::new_expr(Expr::Arg))?)
            }
        }
        ArgType::Var => Arg::Var(text.to_string()),
        ArgType::PbufFnum => {
            let mut path = Vec::new();
            for tok in text.split('.') {
                path.push(tok.parse().map_err(|_| Error::new_expr(Expr::Arg))?);
            }
            Arg::PbufFnum(path)
        }
        // named configuration objects and regexes resolve later
        ArgType::Reg | ArgType::Usr | ArgType::Srv | ArgType::Fe | ArgType::Be | ArgType::Tab => {
            defer(deferred)
        }
    })
}

/// Compiles `input` against the fetch and converter registries.
///
/// `where_caps` is the capability bit of the calling pipeline phase; a
/// fetch not usable there is rejected immediately.
pub fn parse_expr(input: &str, where_caps: u32, ctx: &ExprCtx) -> crate::Result<SampleExpr> {
    let terms = split_terms(input);
    let (fetch_kw, fetch_raw) = split_term(terms[0])?;
    if fetch_kw.is_empty() {
        return Err(Error::new_expr(Expr::UnknownFetch));
    }
    let fetch = crate::sample::fetch::lookup(fetch_kw)
        .ok_or_else(|| Error::new_expr(Expr::UnknownFetch))?;
    if fetch.caps & where_caps == 0 {
        return Err(Error::new_expr(Expr::Capability));
    }
    let mut deferred = Vec::new();
    let fetch_args = parse_args(fetch_raw, fetch.args, ctx, fetch_kw, &mut deferred)?;

    let mut convs = Vec::new();
    let mut prev_type = fetch.out_type;
    for term in &terms[1..] {
        let (conv_kw, conv_raw) = split_term(term)?;
        let conv = crate::sample::convert::lookup(conv_kw)
            .ok_or_else(|| Error::new_expr(Expr::UnknownConverter))?;
        if !cast_allowed(prev_type, conv.in_type) {
            return Err(Error::new_expr(Expr::Cast));
        }
        let mut args = parse_args(conv_raw, conv.args, ctx, conv_kw, &mut deferred)?;
        if let Some(post_parse) = conv.post_parse {
            post_parse(&mut args)?;
        }
        prev_type = conv.out_type;
        convs.push((conv, args));
    }

    Ok(SampleExpr {
        fetch,
        fetch_args,
        convs,
        deferred,
    })
}

impl SampleExpr {
    /// Output type of the full chain.
    pub fn out_type(&self) -> SampleType {
        self.convs
            .last()
            .map(|(c, _)| c.out_type)
            .unwrap_or(self.fetch.out_type)
    }

    /// Whether any argument still awaits resolution.
    pub fn is_resolved(&self) -> bool {
        !self
            .fetch_args
            .iter()
            .chain(self.convs.iter().flat_map(|(_, a)| a.iter()))
            .any(|a| matches!(a, Arg::Unresolved(_)))
    }

    /// The post-configuration pass: substitutes every deferred argument
    /// against `cfg`. `current` names the proxy the rule belongs to, for
    /// bare server names.
    pub fn resolve(&mut self, cfg: &Config, current: Option<ProxyId>) -> crate::Result<()> {
        let deferred = std::mem::take(&mut self.deferred);
        let resolve_one = |arg: &mut Arg| -> crate::Result<()> {
            let idx = match arg {
                Arg::Unresolved(i) => *i,
                _ => return Ok(()),
            };
            let pending = &deferred[idx];
            let resolved = match pending.ty {
                ArgType::Reg => {
                    // GLOB-style case flags are encoded by the caller in
                    // the pattern text; `(?i)` marks ICASE
                    let re = Regex::new(&pending.raw).map_err(|e| {
                        Error::new_expr(Expr::Unresolved)
                            .with(format!("{}: bad regex: {}", pending.ctx, e))
                    })?;
                    Arg::Reg(re)
                }
                ArgType::Fe => {
                    let id = cfg.proxy_by_name(&pending.raw).ok_or_else(|| {
                        Error::new_expr(Expr::Unresolved)
                            .with(format!("{}: no such frontend", pending.ctx))
                    })?;
                    if !cfg.proxy(id).map(|p| p.caps.frontend).unwrap_or(false) {
                        return Err(Error::new_expr(Expr::Unresolved)
                            .with(format!("{}: proxy is not a frontend", pending.ctx)));
                    }
                    Arg::Fe(id)
                }
                ArgType::Be => {
                    let id = cfg.proxy_by_name(&pending.raw).ok_or_else(|| {
                        Error::new_expr(Expr::Unresolved)
                            .with(format!("{}: no such backend", pending.ctx))
                    })?;
                    if !cfg.proxy(id).map(|p| p.caps.backend).unwrap_or(false) {
                        return Err(Error::new_expr(Expr::Unresolved)
                            .with(format!("{}: proxy is not a backend", pending.ctx)));
                    }
                    Arg::Be(id)
                }
                ArgType::Srv => {
                    let id = cfg.server_by_name(&pending.raw, current).ok_or_else(|| {
                        Error::new_expr(Expr::Unresolved)
                            .with(format!("{}: no such server", pending.ctx))
                    })?;
                    Arg::Srv(id)
                }
                ArgType::Tab => {
                    let id = cfg.table_by_name(&pending.raw).ok_or_else(|| {
                        Error::new_expr(Expr::Unresolved)
                            .with(format!("{}: no such stick table", pending.ctx))
                    })?;
                    let table = cfg.table(id).expect("id from lookup");
                    if table.size == 0 {
                        return Err(Error::new_expr(Expr::Unresolved)
                            .with(format!("{}: stick table has no size", pending.ctx)));
                    }
                    Arg::Tab(id)
                }
                ArgType::Usr => {
                    let id = cfg.userlist_by_name(&pending.raw).ok_or_else(|| {
                        Error::new_expr(Expr::Unresolved)
                            .with(format!("{}: no such userlist", pending.ctx))
                    })?;
                    Arg::Usr(id)
                }
                _ => return Ok(()),
            };
            *arg = resolved;
            Ok(())
        };
        for arg in self.fetch_args.iter_mut() {
            resolve_one(arg)?;
        }
        for (_, args) in self.convs.iter_mut() {
            for arg in args.iter_mut() {
                resolve_one(arg)?;
            }
        }
        Ok(())
    }
}
