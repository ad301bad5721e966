//! Sample converters: pure typed functions applied along an expression.

use std::collections::HashMap;

use regex::bytes::RegexBuilder;

use crate::error::{Error, Expr};
use crate::sample::expr::{Arg, ArgSpec, ArgType};
use crate::sample::{Sample, SampleData, SampleType};

/// Evaluation environment handed to converters.
#[derive(Debug, Default)]
pub struct ConvCtx<'a> {
    /// Named scalar variables usable as arithmetic operands.
    pub vars: Option<&'a HashMap<String, i64>>,
}

/// A registered converter keyword.
pub struct ConvKw {
    pub name: &'static str,
    pub in_type: SampleType,
    pub out_type: SampleType,
    pub args: &'static [ArgSpec],
    /// Runs right after argument parsing, before resolution; used to
    /// pre-compile composite arguments.
    pub post_parse: Option<fn(&mut Vec<Arg>) -> crate::Result<()>>,
    pub eval: fn(&[Arg], &mut Sample, &ConvCtx<'_>) -> bool,
}

impl std::fmt::Debug for ConvKw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConvKw({})", self.name)
    }
}

/// Resolves a literal-or-variable arithmetic operand.
fn operand(args: &[Arg], ctx: &ConvCtx<'_>) -> Option<i64> {
    let text = args.first()?.as_str()?;
    let text = std::str::from_utf8(text).ok()?;
    if let Ok(v) = text.parse::<i64>() {
        return Some(v);
    }
    ctx.vars?.get(text).copied()
}

fn take_int(smp: &Sample) -> Option<i64> {
    smp.as_int()
}

macro_rules! int_conv {
    ($fn_name:ident, |$a:ident, $b:ident| $body:expr) => {
        fn $fn_name(args: &[Arg], smp: &mut Sample, ctx: &ConvCtx<'_>) -> bool {
            let $a = match take_int(smp) {
                Some(v) => v,
                None => return false,
            };
            let $b = match operand(args, ctx) {
                Some(v) => v,
                None => return false,
            };
            smp.data = SampleData::SInt($body);
            true
        }
    };
}

// The arithmetic family saturates instead of wrapping; division and
// modulo by zero produce deterministic capped values.
int_conv!(conv_add, |a, b| a.saturating_add(b));
int_conv!(conv_sub, |a, b| a.saturating_sub(b));
int_conv!(conv_mul, |a, b| a.saturating_mul(b));
int_conv!(conv_and, |a, b| a & b);
int_conv!(conv_or, |a, b| a | b);
int_conv!(conv_xor, |a, b| a ^ b);

fn conv_div(args: &[Arg], smp: &mut Sample, ctx: &ConvCtx<'_>) -> bool {
    let a = match take_int(smp) {
        Some(v) => v,
        None => return false,
    };
    let b = match operand(args, ctx) {
        Some(v) => v,
        None => return false,
    };
    let v = if b == 0 {
        i64::MAX
    } else if a == i64::MIN && b == -1 {
        i64::MAX
    } else {
        a / b
    };
    smp.data = SampleData::SInt(v);
    true
}

fn conv_mod(args: &[Arg], smp: &mut Sample, ctx: &ConvCtx<'_>) -> bool {
    let a = match take_int(smp) {
        Some(v) => v,
        None => return false,
    };
    let b = match operand(args, ctx) {
        Some(v) => v,
        None => return false,
    };
    let v = if b == 0 {
        0
    } else if a == i64::MIN && b == -1 {
        0
    } else {
        a % b
    };
    smp.data = SampleData::SInt(v);
    true
}

fn conv_neg(_args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    match take_int(smp) {
        Some(v) => {
            smp.data = SampleData::SInt(v.saturating_neg());
            true
        }
        None => false,
    }
}

fn conv_cpl(_args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    match take_int(smp) {
        Some(v) => {
            smp.data = SampleData::SInt(!v);
            true
        }
        None => false,
    }
}

fn conv_bool(_args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    match take_int(smp) {
        Some(v) => {
            smp.data = SampleData::Bool(v != 0);
            true
        }
        None => false,
    }
}

fn conv_not(_args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    match take_int(smp) {
        Some(v) => {
            smp.data = SampleData::Bool(v == 0);
            true
        }
        None => false,
    }
}

fn conv_odd(_args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    match take_int(smp) {
        Some(v) => {
            smp.data = SampleData::Bool(v & 1 == 1);
            true
        }
        None => false,
    }
}

fn conv_even(_args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    match take_int(smp) {
        Some(v) => {
            smp.data = SampleData::Bool(v & 1 == 0);
            true
        }
        None => false,
    }
}

fn conv_lower(_args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    smp.make_mut();
    if let SampleData::Str(s) = &mut smp.data {
        s.make_ascii_lowercase();
        true
    } else {
        false
    }
}

fn conv_upper(_args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    smp.make_mut();
    if let SampleData::Str(s) = &mut smp.data {
        s.make_ascii_uppercase();
        true
    } else {
        false
    }
}

fn conv_length(_args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    match smp.as_bytes() {
        Some(b) => {
            smp.data = SampleData::SInt(b.len() as i64);
            true
        }
        None => false,
    }
}

fn conv_hex(_args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    match smp.as_bytes() {
        Some(b) => {
            let mut out = Vec::with_capacity(b.len() * 2);
            for &c in b {
                out.push(HEX[(c >> 4) as usize]);
                out.push(HEX[(c & 0xf) as usize]);
            }
            smp.data = SampleData::Str(out);
            true
        }
        None => false,
    }
}

fn conv_bytes(args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    let ofs = match args.first().and_then(Arg::as_int) {
        Some(v) if v >= 0 => v as usize,
        _ => return false,
    };
    let len = args.get(1).and_then(Arg::as_int);
    let data = match smp.as_bytes() {
        Some(b) => b,
        None => return false,
    };
    if ofs > data.len() {
        smp.data = SampleData::Bin(Vec::new());
        return true;
    }
    let end = match len {
        Some(l) if l >= 0 => (ofs + l as usize).min(data.len()),
        _ => data.len(),
    };
    let slice = data[ofs..end].to_vec();
    smp.data = SampleData::Bin(slice);
    true
}

// --- json escaping ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonMode {
    Ascii,
    Utf8,
    Utf8Skip,
    Utf8Permissive,
    Utf8PermissiveSkip,
}

impl JsonMode {
    fn parse(name: &[u8]) -> Option<JsonMode> {
        Some(match name {
            b"ascii" => JsonMode::Ascii,
            b"utf8" => JsonMode::Utf8,
            b"utf8s" => JsonMode::Utf8Skip,
            b"utf8p" => JsonMode::Utf8Permissive,
            b"utf8ps" | b"utf8sp" => JsonMode::Utf8PermissiveSkip,
            _ => return None,
        })
    }

    fn skips(self) -> bool {
        matches!(self, JsonMode::Utf8Skip | JsonMode::Utf8PermissiveSkip)
    }

    fn permits_surrogates(self) -> bool {
        matches!(self, JsonMode::Utf8Permissive | JsonMode::Utf8PermissiveSkip)
    }
}

/// Decodes one code point, permitting surrogates (the mode decides their
/// fate). Returns the code point and its encoded length.
fn utf8_next(bytes: &[u8]) -> Option<(u32, usize)> {
    let b0 = *bytes.first()? as u32;
    if b0 < 0x80 {
        return Some((b0, 1));
    }
    let (len, init) = match b0 {
        0xC0..=0xDF => (2, b0 & 0x1F),
        0xE0..=0xEF => (3, b0 & 0x0F),
        0xF0..=0xF7 => (4, b0 & 0x07),
        _ => return None,
    };
    if bytes.len() < len {
        return None;
    }
    let mut cp = init;
    for &b in &bytes[1..len] {
        if b & 0xC0 != 0x80 {
            return None;
        }
        cp = (cp << 6) | u32::from(b & 0x3F);
    }
    // overlong forms are invalid
    let min = match len {
        2 => 0x80,
        3 => 0x800,
        _ => 0x10000,
    };
    if cp < min || cp > 0x10FFFF {
        return None;
    }
    Some((cp, len))
}

fn json_escape_cp(cp: u32, out: &mut Vec<u8>) {
    match cp {
        0x22 => out.extend_from_slice(b"\\\""),
        0x5C => out.extend_from_slice(b"\\\\"),
        0x2F => out.extend_from_slice(b"\\/"),
        0x08 => out.extend_from_slice(b"\\b"),
        0x0C => out.extend_from_slice(b"\\f"),
        0x0A => out.extend_from_slice(b"\\n"),
        0x0D => out.extend_from_slice(b"\\r"),
        0x09 => out.extend_from_slice(b"\\t"),
        0x20..=0x7E => out.push(cp as u8),
        _ => {
            let hex = format!("\\u{:04x}", cp);
            out.extend_from_slice(hex.as_bytes());
        }
    }
}

fn conv_json(args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    let mode = match args.first().and_then(Arg::as_str) {
        Some(name) => match JsonMode::parse(name) {
            Some(m) => m,
            None => return false,
        },
        None => JsonMode::Ascii,
    };
    let input = match smp.as_bytes() {
        Some(b) => b.to_vec(),
        None => return false,
    };
    let mut out = Vec::with_capacity(input.len() + 8);
    match mode {
        JsonMode::Ascii => {
            for &b in &input {
                json_escape_cp(u32::from(b), &mut out);
            }
        }
        _ => {
            let mut i = 0;
            while i < input.len() {
                match utf8_next(&input[i..]) {
                    Some((cp, len)) => {
                        let surrogate = (0xD800..0xE000).contains(&cp);
                        if surrogate && !mode.permits_surrogates() {
                            if mode.skips() {
                                i += len;
                                continue;
                            }
                            return false;
                        }
                        if cp > 0xFFFF {
                            // no escape form in a single \uXXXX
                            if mode.skips() {
                                i += len;
                                continue;
                            }
                            return false;
                        }
                        json_escape_cp(cp, &mut out);
                        i += len;
                    }
                    None => {
                        if mode.skips() {
                            i += 1;
                            continue;
                        }
                        return false;
                    }
                }
            }
        }
    }
    smp.data = SampleData::Str(out);
    true
}

// --- regsub ---

/// Combines `(pattern, replacement, flags?)` into a pre-compiled regex
/// plus replacement at parse time.
fn regsub_post_parse(args: &mut Vec<Arg>) -> crate::Result<()> {
    let pattern = match args.first().and_then(Arg::as_str) {
        Some(p) => String::from_utf8_lossy(p).into_owned(),
        None => return Err(Error::new_expr(Expr::Arg)),
    };
    let flags = args
        .get(2)
        .and_then(Arg::as_str)
        .map(|f| f.to_vec())
        .unwrap_or_default();
    let icase = flags.contains(&b'i');
    let re = RegexBuilder::new(&pattern)
        .case_insensitive(icase)
        .build()
        .map_err(|e| Error::new_expr(Expr::Arg).with(e.to_string()))?;
    args[0] = Arg::Reg(re);
    Ok(())
}

/// `s/re/repl/` once, or globally with the `g` flag.
///
/// After the first match, the remainder of the subject is no longer at
/// beginning-of-line, so `^` cannot match again; this mirrors POSIX
/// `REG_NOTBOL` behaviour and holds in both modes. Zero-length matches
/// copy one subject character and continue one position later.
fn conv_regsub(args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    let re = match args.first().and_then(Arg::as_reg) {
        Some(r) => r,
        None => return false,
    };
    let repl = match args.get(1).and_then(Arg::as_str) {
        Some(r) => r.to_vec(),
        None => return false,
    };
    let global = args
        .get(2)
        .and_then(Arg::as_str)
        .map(|f| f.contains(&b'g'))
        .unwrap_or(false);
    let subject = match smp.as_bytes() {
        Some(b) => b.to_vec(),
        None => return false,
    };

    let mut out = Vec::with_capacity(subject.len());
    let mut pos = 0usize;
    let mut done_one = false;
    while pos <= subject.len() {
        if done_one && !global {
            break;
        }
        // find_at keeps ^ anchored to the true start of the subject
        let m = match re.find_at(&subject, pos) {
            Some(m) => m,
            None => break,
        };
        out.extend_from_slice(&subject[pos..m.start()]);
        out.extend_from_slice(&repl);
        done_one = true;
        if m.end() == m.start() {
            // empty match: emit the current character verbatim and step
            if m.end() < subject.len() {
                out.push(subject[m.end()]);
            }
            pos = m.end() + 1;
        } else {
            pos = m.end();
        }
    }
    if pos < subject.len() {
        out.extend_from_slice(&subject[pos..]);
    }
    smp.data = SampleData::Str(out);
    true
}

// --- field / word ---

fn split_fields<'a>(s: &'a [u8], seps: &[u8]) -> Vec<&'a [u8]> {
    let mut fields = Vec::new();
    let mut start = 0;
    for (i, b) in s.iter().enumerate() {
        if seps.contains(b) {
            fields.push(&s[start..i]);
            start = i + 1;
        }
    }
    fields.push(&s[start..]);
    fields
}

fn pick_slices(count_total: usize, n: i64, count: usize) -> Option<(usize, usize)> {
    // 1-based from either end; the selection is n..n+count going right
    let idx = if n > 0 {
        (n - 1) as usize
    } else if n < 0 {
        let back = (-n) as usize;
        if back > count_total {
            return None;
        }
        count_total - back
    } else {
        return None;
    };
    if idx >= count_total {
        return None;
    }
    Some((idx, (idx + count).min(count_total)))
}

fn conv_field_like(args: &[Arg], smp: &mut Sample, words_only: bool) -> bool {
    let n = match args.first().and_then(Arg::as_int) {
        Some(v) => v,
        None => return false,
    };
    let seps = match args.get(1).and_then(Arg::as_str) {
        Some(s) if !s.is_empty() => s.to_vec(),
        _ => return false,
    };
    let count = match args.get(2).and_then(Arg::as_int) {
        Some(v) if v > 0 => v as usize,
        _ => 1,
    };
    let data = match smp.as_bytes() {
        Some(b) => b.to_vec(),
        None => return false,
    };
    let all = split_fields(&data, &seps);
    let fields: Vec<&[u8]> = if words_only {
        // consecutive separators do not produce empty words
        all.into_iter().filter(|f| !f.is_empty()).collect()
    } else {
        all
    };
    let out = match pick_slices(fields.len(), n, count) {
        Some((a, b)) => {
            let sep = seps[0];
            let mut joined = Vec::new();
            for (i, f) in fields[a..b].iter().enumerate() {
                if i > 0 {
                    joined.push(sep);
                }
                joined.extend_from_slice(f);
            }
            joined
        }
        None => Vec::new(),
    };
    smp.data = SampleData::Str(out);
    true
}

fn conv_field(args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    conv_field_like(args, smp, false)
}

fn conv_word(args: &[Arg], smp: &mut Sample, _ctx: &ConvCtx<'_>) -> bool {
    conv_field_like(args, smp, true)
}

const INT_ARG: &[ArgSpec] = &[ArgSpec::req(ArgType::Str)];
const NO_ARGS: &[ArgSpec] = &[];
const BYTES_ARGS: &[ArgSpec] = &[ArgSpec::req(ArgType::SInt), ArgSpec::opt(ArgType::SInt)];
const JSON_ARGS: &[ArgSpec] = &[ArgSpec::opt(ArgType::Str)];
const REGSUB_ARGS: &[ArgSpec] = &[
    ArgSpec::req(ArgType::Str),
    ArgSpec::req(ArgType::Str),
    ArgSpec::opt(ArgType::Str),
];
const FIELD_ARGS: &[ArgSpec] = &[
    ArgSpec::req(ArgType::SInt),
    ArgSpec::req(ArgType::Str),
    ArgSpec::opt(ArgType::SInt),
];

macro_rules! kw {
    ($name:expr, $in:ident, $out:ident, $args:expr, $eval:expr) => {
        ConvKw {
            name: $name,
            in_type: SampleType::$in,
            out_type: SampleType::$out,
            args: $args,
            post_parse: None,
            eval: $eval,
        }
    };
}

static CONVERTERS: &[ConvKw] = &[
    kw!("add", SInt, SInt, INT_ARG, conv_add),
    kw!("and", SInt, SInt, INT_ARG, conv_and),
    kw!("bool", SInt, Bool, NO_ARGS, conv_bool),
    kw!("bytes", Bin, Bin, BYTES_ARGS, conv_bytes),
    kw!("cpl", SInt, SInt, NO_ARGS, conv_cpl),
    kw!("div", SInt, SInt, INT_ARG, conv_div),
    kw!("even", SInt, Bool, NO_ARGS, conv_even),
    kw!("field", Str, Str, FIELD_ARGS, conv_field),
    kw!("hex", Bin, Str, NO_ARGS, conv_hex),
    kw!("json", Str, Str, JSON_ARGS, conv_json),
    kw!("length", Str, SInt, NO_ARGS, conv_length),
    kw!("lower", Str, Str, NO_ARGS, conv_lower),
    kw!("mod", SInt, SInt, INT_ARG, conv_mod),
    kw!("mul", SInt, SInt, INT_ARG, conv_mul),
    kw!("neg", SInt, SInt, NO_ARGS, conv_neg),
    kw!("not", SInt, Bool, NO_ARGS, conv_not),
    kw!("odd", SInt, Bool, NO_ARGS, conv_odd),
    kw!("or", SInt, SInt, INT_ARG, conv_or),
    ConvKw {
        name: "regsub",
        in_type: SampleType::Str,
        out_type: SampleType::Str,
        args: REGSUB_ARGS,
        post_parse: Some(regsub_post_parse),
        eval: conv_regsub,
    },
    kw!("sub", SInt, SInt, INT_ARG, conv_sub),
    kw!("upper", Str, Str, NO_ARGS, conv_upper),
    kw!("word", Str, Str, FIELD_ARGS, conv_word),
    kw!("xor", SInt, SInt, INT_ARG, conv_xor),
];

/// Finds a converter by name.
pub fn lookup(name: &str) -> Option<&'static ConvKw> {
    CONVERTERS.iter().find(|c| c.name == name)
}
