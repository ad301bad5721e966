//! The typed sample-fetch and converter engine.
//!
//! A *sample* is a typed value extracted from a stream (method, header,
//! cookie, URL parameter, ...) and transformed through a pipeline of
//! *converters*. Expressions are compiled once from their textual form
//! (`fetch(args),conv(args),...`), arguments naming configuration objects
//! are resolved in a dedicated post-configuration pass, and evaluation
//! happens per-request with no allocation on the happy path beyond the
//! values themselves.

pub mod convert;
pub mod expr;
pub mod fetch;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use http::Method;

pub use self::expr::{parse_expr, Arg, ArgSpec, ArgType, ExprCtx, SampleExpr, UnresolvedArg};
pub use self::fetch::{HttpMsgView, SampleCtx};

/// Sample types, in cast-matrix order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Any,
    Bool,
    SInt,
    Addr,
    Ipv4,
    Ipv6,
    Str,
    Bin,
    Meth,
}

impl SampleType {
    /// Lower-case name used in error reporting.
    pub fn name(self) -> &'static str {
        match self {
            SampleType::Any => "any",
            SampleType::Bool => "bool",
            SampleType::SInt => "sint",
            SampleType::Addr => "addr",
            SampleType::Ipv4 => "ipv4",
            SampleType::Ipv6 => "ipv6",
            SampleType::Str => "str",
            SampleType::Bin => "bin",
            SampleType::Meth => "meth",
        }
    }
}

/// Sample flag word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SampleFlags(pub u32);

impl SampleFlags {
    pub const NONE: SampleFlags = SampleFlags(0);
    /// The payload must not be mutated in place; duplicate before
    /// changing it.
    pub const CONST: SampleFlags = SampleFlags(1 << 0);
    /// Valid as long as the first fetched content stays in the buffer.
    pub const VOL_1ST: SampleFlags = SampleFlags(1 << 1);
    /// Valid as long as the headers are unchanged.
    pub const VOL_HDR: SampleFlags = SampleFlags(1 << 2);
    /// Valid only for the duration of the test.
    pub const VOL_TEST: SampleFlags = SampleFlags(1 << 3);
    /// The result is not yet stable; retry later may differ.
    pub const MAY_CHANGE: SampleFlags = SampleFlags(1 << 4);
    /// More occurrences are available after this one.
    pub const NOT_LAST: SampleFlags = SampleFlags(1 << 5);

    #[inline]
    pub fn contains(self, other: SampleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: SampleFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: SampleFlags) {
        self.0 &= !other.0;
    }
}

impl std::fmt::Debug for SampleFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SampleFlags({:#x})", self.0)
    }
}

/// The payload of a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleData {
    Bool(bool),
    SInt(i64),
    Addr(IpAddr),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Str(Vec<u8>),
    Bin(Vec<u8>),
    Meth(Method),
}

/// A typed value flowing through an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub data: SampleData,
    pub flags: SampleFlags,
}

impl Sample {
    pub fn new(data: SampleData) -> Sample {
        Sample {
            data,
            flags: SampleFlags::NONE,
        }
    }

    pub fn str(bytes: impl Into<Vec<u8>>) -> Sample {
        Sample::new(SampleData::Str(bytes.into()))
    }

    pub fn sint(v: i64) -> Sample {
        Sample::new(SampleData::SInt(v))
    }

    pub fn bool(v: bool) -> Sample {
        Sample::new(SampleData::Bool(v))
    }

    pub fn ty(&self) -> SampleType {
        match self.data {
            SampleData::Bool(_) => SampleType::Bool,
            SampleData::SInt(_) => SampleType::SInt,
            SampleData::Addr(_) => SampleType::Addr,
            SampleData::Ipv4(_) => SampleType::Ipv4,
            SampleData::Ipv6(_) => SampleType::Ipv6,
            SampleData::Str(_) => SampleType::Str,
            SampleData::Bin(_) => SampleType::Bin,
            SampleData::Meth(_) => SampleType::Meth,
        }
    }

    /// String view of Str/Bin payloads.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            SampleData::Str(b) | SampleData::Bin(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.data {
            SampleData::SInt(v) => Some(v),
            SampleData::Bool(b) => Some(b as i64),
            _ => None,
        }
    }

    /// Mutation guard: a CONST payload is duplicated first (losing CONST).
    pub fn make_mut(&mut self) {
        if self.flags.contains(SampleFlags::CONST) {
            // clone-on-write: the clone belongs to us
            self.flags.remove(SampleFlags::CONST);
        }
    }
}

/// Whether a cast exists from `from` to `to`, per the cast matrix. `Any`
/// casts to and from everything without conversion.
pub fn cast_allowed(from: SampleType, to: SampleType) -> bool {
    use SampleType::*;
    if from == Any || to == Any || from == to {
        return true;
    }
    matches!(
        (from, to),
        (Bool, SInt)
            | (Bool, Str)
            | (SInt, Bool)
            | (SInt, Addr)
            | (SInt, Ipv4)
            | (SInt, Ipv6)
            | (SInt, Str)
            | (SInt, Bin)
            | (Ipv4, SInt)
            | (Ipv4, Addr)
            | (Ipv4, Ipv6)
            | (Ipv4, Str)
            | (Ipv4, Bin)
            | (Ipv6, Addr)
            | (Ipv6, Ipv4)
            | (Ipv6, Str)
            | (Ipv6, Bin)
            | (Str, Bool)
            | (Str, SInt)
            | (Str, Addr)
            | (Str, Ipv4)
            | (Str, Ipv6)
            | (Str, Bin)
            | (Str, Meth)
            | (Bin, Str)
            | (Bin, Meth)
            | (Meth, Str)
            | (Meth, Bin)
    )
}

/// Applies the cast in place. Returns false when the value cannot be
/// represented in the target type (e.g. a string that is not an address).
pub fn cast(smp: &mut Sample, to: SampleType) -> bool {
    use SampleType::*;
    let from = smp.ty();
    if to == Any || from == to {
        return true;
    }
    if !cast_allowed(from, to) {
        return false;
    }
    smp.make_mut();
    let new = match (&smp.data, to) {
        (SampleData::Bool(b), SInt) => SampleData::SInt(*b as i64),
        (SampleData::Bool(b), Str) => {
            SampleData::Str(if *b { b"1".to_vec() } else { b"0".to_vec() })
        }
        (SampleData::SInt(v), Bool) => SampleData::Bool(*v != 0),
        (SampleData::SInt(v), Addr) | (SampleData::SInt(v), Ipv4) => {
            SampleData::Ipv4(Ipv4Addr::from(*v as u32))
        }
        (SampleData::SInt(v), Ipv6) => {
            SampleData::Ipv6(Ipv4Addr::from(*v as u32).to_ipv6_mapped())
        }
        (SampleData::SInt(v), Str) => {
            let mut buf = itoa::Buffer::new();
            SampleData::Str(buf.format(*v).as_bytes().to_vec())
        }
        (SampleData::SInt(v), Bin) => SampleData::Bin((*v as u64).to_be_bytes().to_vec()),
        (SampleData::Ipv4(ip), SInt) => SampleData::SInt(i64::from(u32::from(*ip))),
        (SampleData::Ipv4(ip), Addr) => SampleData::Addr(IpAddr::V4(*ip)),
        (SampleData::Ipv4(ip), Ipv6) => SampleData::Ipv6(ip.to_ipv6_mapped()),
        (SampleData::Ipv4(ip), Str) => SampleData::Str(ip.to_string().into_bytes()),
        (SampleData::Ipv4(ip), Bin) => SampleData::Bin(ip.octets().to_vec()),
        (SampleData::Ipv6(ip), Addr) => SampleData::Addr(IpAddr::V6(*ip)),
        (SampleData::Ipv6(ip), Ipv4) => match ip.to_ipv4() {
            Some(v4) => SampleData::Ipv4(v4),
            None => return false,
        },
        (SampleData::Ipv6(ip), Str) => SampleData::Str(ip.to_string().into_bytes()),
        (SampleData::Ipv6(ip), Bin) => SampleData::Bin(ip.octets().to_vec()),
        (SampleData::Str(s), Bool) => match parse_int(s) {
            Some(v) => SampleData::Bool(v != 0),
            None => return false,
        },
        (SampleData::Str(s), SInt) => match parse_int(s) {
            Some(v) => SampleData::SInt(v),
            None => return false,
        },
        (SampleData::Str(s), Addr) => match parse_str(s).and_then(|s| s.parse::<IpAddr>().ok())
        {
            Some(a) => SampleData::Addr(a),
            None => return false,
        },
        (SampleData::Str(s), Ipv4) => {
            match parse_str(s).and_then(|s| s.parse::<Ipv4Addr>().ok()) {
                Some(a) => SampleData::Ipv4(a),
                None => return false,
            }
        }
        (SampleData::Str(s), Ipv6) => {
            match parse_str(s).and_then(|s| s.parse::<Ipv6Addr>().ok()) {
                Some(a) => SampleData::Ipv6(a),
                None => return false,
            }
        }
        (SampleData::Str(s), Bin) => SampleData::Bin(s.clone()),
        (SampleData::Str(s), Meth) => match method_from_bytes(s) {
            Some(m) => SampleData::Meth(m),
            None => return false,
        },
        (SampleData::Bin(b), Str) => {
            // printable prefix only: a NUL ends the string
            let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
            SampleData::Str(b[..end].to_vec())
        }
        (SampleData::Bin(b), Meth) => match method_from_bytes(b) {
            Some(m) => SampleData::Meth(m),
            None => return false,
        },
        (SampleData::Meth(m), Str) => SampleData::Str(m.as_str().as_bytes().to_vec()),
        (SampleData::Meth(m), Bin) => SampleData::Bin(m.as_str().as_bytes().to_vec()),
        _ => return false,
    };
    smp.data = new;
    true
}

fn parse_str(s: &[u8]) -> Option<&str> {
    std::str::from_utf8(s).ok()
}

fn parse_int(s: &[u8]) -> Option<i64> {
    parse_str(s)?.trim().parse().ok()
}

fn method_from_bytes(s: &[u8]) -> Option<Method> {
    Method::from_bytes(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names() {
        assert_eq!(SampleType::SInt.name(), "sint");
        assert_eq!(SampleType::Meth.name(), "meth");
    }

    #[test]
    fn matrix_rejects_impossible_casts() {
        assert!(!cast_allowed(SampleType::Addr, SampleType::Str));
        assert!(!cast_allowed(SampleType::Bool, SampleType::Ipv4));
        assert!(!cast_allowed(SampleType::Meth, SampleType::SInt));
        assert!(cast_allowed(SampleType::Str, SampleType::Meth));
        assert!(cast_allowed(SampleType::Any, SampleType::Ipv6));
    }

    #[test]
    fn int_to_ip_and_back() {
        let mut smp = Sample::sint(0x7f000001);
        assert!(cast(&mut smp, SampleType::Ipv4));
        assert_eq!(smp.data, SampleData::Ipv4(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(cast(&mut smp, SampleType::SInt));
        assert_eq!(smp.as_int(), Some(0x7f000001));
    }

    #[test]
    fn str_to_ip_parses_or_fails() {
        let mut smp = Sample::str("192.168.0.1");
        assert!(cast(&mut smp, SampleType::Ipv4));
        let mut bad = Sample::str("not-an-ip");
        assert!(!cast(&mut bad, SampleType::Ipv4));
    }

    #[test]
    fn ipv4_to_ipv6_is_mapped() {
        let mut smp = Sample::new(SampleData::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(cast(&mut smp, SampleType::Ipv6));
        assert_eq!(
            smp.data,
            SampleData::Ipv6("::ffff:10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn bin_to_str_stops_at_nul() {
        let mut smp = Sample::new(SampleData::Bin(b"abc\0def".to_vec()));
        assert!(cast(&mut smp, SampleType::Str));
        assert_eq!(smp.as_bytes(), Some(&b"abc"[..]));
    }

    #[test]
    fn str_to_method() {
        let mut smp = Sample::str("GET");
        assert!(cast(&mut smp, SampleType::Meth));
        assert_eq!(smp.data, SampleData::Meth(Method::GET));
        let mut back = smp.clone();
        assert!(cast(&mut back, SampleType::Str));
        assert_eq!(back.as_bytes(), Some(&b"GET"[..]));
    }

    #[test]
    fn const_is_dropped_on_mutation() {
        let mut smp = Sample::sint(42);
        smp.flags.insert(SampleFlags::CONST);
        assert!(cast(&mut smp, SampleType::Str));
        assert!(!smp.flags.contains(SampleFlags::CONST));
    }
}
