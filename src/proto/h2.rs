//! HTTP/2 to HTTP/1 message transformation.
//!
//! The HTTP/2 mux hands over a decoded header list; this module validates
//! it against RFC 7540 §8.1.2 and emits either a flat HTTP/1.1 message or
//! a structured [`Htx`](super::htx::Htx) equivalent. All the rejection
//! rules return an error; the caller closes the connection with the
//! appropriate client- or server-side cause.

use bytes::Bytes;

use crate::error::{Error, Parse};
use crate::proto::htx::{Block, Htx, HtxFlags};

/// Pseudo-header codes as used in the message schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pseudo {
    Method = 1,
    Scheme = 2,
    Authority = 3,
    Path = 4,
    Status = 5,
}

impl Pseudo {
    fn from_name(name: &[u8]) -> Option<Pseudo> {
        Some(match name {
            b":method" => Pseudo::Method,
            b":scheme" => Pseudo::Scheme,
            b":authority" => Pseudo::Authority,
            b":path" => Pseudo::Path,
            b":status" => Pseudo::Status,
            _ => return None,
        })
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// One record of the decoded header list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderRec {
    /// An indexed pseudo-header: code plus value.
    Pseudo(Pseudo, Bytes),
    /// A literal `name: value` field.
    Field(Bytes, Bytes),
}

impl HeaderRec {
    pub fn field(name: &'static str, value: &'static str) -> HeaderRec {
        HeaderRec::Field(Bytes::from_static(name.as_bytes()), Bytes::from_static(value.as_bytes()))
    }

    pub fn pseudo(p: Pseudo, value: &'static str) -> HeaderRec {
        HeaderRec::Pseudo(p, Bytes::from_static(value.as_bytes()))
    }
}

/// Message format bits discovered while transforming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgFmt(pub u32);

impl MsgFmt {
    pub const NONE: MsgFmt = MsgFmt(0);
    /// A body is expected (no END_STREAM on the HEADERS frame).
    pub const BODY: MsgFmt = MsgFmt(1 << 0);
    /// A validated `content-length` governs the body.
    pub const BODY_CL: MsgFmt = MsgFmt(1 << 1);
    /// CONNECT: the payload is a tunnel.
    pub const BODY_TUNNEL: MsgFmt = MsgFmt(1 << 2);
    /// A non-101 1xx response; another HEADERS frame follows.
    pub const RSP_1XX: MsgFmt = MsgFmt(1 << 3);

    #[inline]
    pub fn contains(self, other: MsgFmt) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: MsgFmt) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: MsgFmt) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: MsgFmt) {
        self.0 &= !other.0;
    }
}

const FND_NONE: u32 = 1 << 8; // first regular header seen
const FND_HOST: u32 = 1 << 9;

fn has_upper(name: &[u8]) -> bool {
    name.iter().any(|b| b.is_ascii_uppercase())
}

fn eq_ascii(name: &[u8], other: &str) -> bool {
    name.eq_ignore_ascii_case(other.as_bytes())
}

/// Parses one `content-length` header value as a comma-separated list of
/// identical decimal integers. Returns `true` when this occurrence is the
/// first one and must be kept, `false` when it is a droppable duplicate.
fn parse_content_length(msgf: &mut MsgFmt, value: &[u8], body_len: &mut u64) -> crate::Result<bool> {
    let not_first = msgf.contains(MsgFmt::BODY_CL);
    let mut i = 0;
    while i < value.len() {
        // skip delimiters and blanks
        if value[i] == b',' || value[i] == b' ' || value[i] == b'\t' {
            i += 1;
            continue;
        }
        let start = i;
        let mut cl: u64 = 0;
        while i < value.len() && value[i].is_ascii_digit() {
            let c = u64::from(value[i] - b'0');
            cl = cl
                .checked_mul(10)
                .and_then(|v| v.checked_add(c))
                .ok_or_else(|| Error::new_parse(Parse::ContentLength))?;
            i += 1;
        }
        if i == start {
            // spaces only or a stray token
            return Err(Error::new_parse(Parse::ContentLength));
        }
        // only LWS may separate the number from the next comma
        while i < value.len() {
            match value[i] {
                b' ' | b'\t' => i += 1,
                b',' => break,
                _ => return Err(Error::new_parse(Parse::ContentLength)),
            }
        }
        if msgf.contains(MsgFmt::BODY_CL) && cl != *body_len {
            return Err(Error::new_parse(Parse::ContentLength));
        }
        msgf.insert(MsgFmt::BODY_CL);
        *body_len = cl;
    }
    Ok(!not_first)
}

/// What survives validation of a request header list.
#[derive(Debug)]
struct ProcessedRequest {
    method: Bytes,
    uri: Bytes,
    headers: Vec<(Bytes, Bytes)>,
    /// The `:path` held LWS or control characters; recoverable.
    parsing_note: bool,
}

#[derive(Debug)]
struct ProcessedResponse {
    status: u16,
    headers: Vec<(Bytes, Bytes)>,
}

fn process_request(
    list: &[HeaderRec],
    msgf: &mut MsgFmt,
    body_len: &mut u64,
) -> crate::Result<ProcessedRequest> {
    let mut fields = 0u32;
    let mut phdr: [Option<Bytes>; 6] = Default::default();
    let mut headers: Vec<(Bytes, Bytes)> = Vec::with_capacity(list.len() + 2);
    let mut cookies: Vec<Bytes> = Vec::new();

    for rec in list {
        match rec {
            HeaderRec::Pseudo(p, v) => {
                if fields & FND_NONE != 0 {
                    // pseudo-header after a regular one
                    return Err(Error::new_parse(Parse::PseudoHeader));
                }
                if fields & p.bit() != 0 {
                    // repeated pseudo-header
                    return Err(Error::new_parse(Parse::PseudoHeader));
                }
                fields |= p.bit();
                phdr[*p as usize] = Some(v.clone());
            }
            HeaderRec::Field(n, v) => {
                if has_upper(n) {
                    return Err(Error::new_parse(Parse::HeaderName));
                }
                if let Some(p) = Pseudo::from_name(n) {
                    // a pseudo-header spelled out literally follows the
                    // same rules as an indexed one
                    if fields & (FND_NONE | p.bit()) != 0 {
                        return Err(Error::new_parse(Parse::PseudoHeader));
                    }
                    fields |= p.bit();
                    phdr[p as usize] = Some(v.clone());
                    continue;
                }
                fields |= FND_NONE;

                if eq_ascii(n, "host") {
                    fields |= FND_HOST;
                }
                if eq_ascii(n, "content-length") {
                    if !parse_content_length(msgf, v, body_len)? {
                        continue; // equal duplicate, drop
                    }
                    headers.push((n.clone(), v.clone()));
                    continue;
                }
                if eq_ascii(n, "connection")
                    || eq_ascii(n, "proxy-connection")
                    || eq_ascii(n, "keep-alive")
                    || eq_ascii(n, "upgrade")
                    || eq_ascii(n, "transfer-encoding")
                {
                    return Err(Error::new_parse(Parse::ConnectionHeader));
                }
                if eq_ascii(n, "te") && &v[..] != b"trailers" {
                    return Err(Error::new_parse(Parse::ConnectionHeader));
                }
                if eq_ascii(n, "cookie") {
                    cookies.push(v.clone());
                    continue;
                }
                headers.push((n.clone(), v.clone()));
            }
        }
    }

    // responses only carry :status; its presence here is fatal
    if fields & Pseudo::Status.bit() != 0 {
        return Err(Error::new_parse(Parse::PseudoHeader));
    }

    let method = phdr[Pseudo::Method as usize]
        .clone()
        .ok_or_else(|| Error::new_parse(Parse::MissingPseudo))?;

    let mut parsing_note = false;
    let uri;
    if &method[..] == b"CONNECT" {
        // RFC7540#8.3: CONNECT has no :scheme/:path and requires
        // :authority
        if fields & (Pseudo::Scheme.bit() | Pseudo::Path.bit()) != 0 {
            return Err(Error::new_parse(Parse::PseudoHeader));
        }
        uri = phdr[Pseudo::Authority as usize]
            .clone()
            .ok_or_else(|| Error::new_parse(Parse::MissingPseudo))?;
        msgf.insert(MsgFmt::BODY_TUNNEL);
    } else {
        if fields & Pseudo::Scheme.bit() == 0 || fields & Pseudo::Path.bit() == 0 {
            return Err(Error::new_parse(Parse::MissingPseudo));
        }
        let path = phdr[Pseudo::Path as usize].clone().expect("path bit set");
        if path.is_empty() {
            return Err(Error::new_parse(Parse::PseudoHeader));
        }
        if path
            .iter()
            .any(|&b| b == b' ' || b == b'\t' || b < 0x20 || b == 0x7f)
        {
            parsing_note = true;
        }
        uri = path;
    }

    // complete with missing Host if needed
    if fields & FND_HOST == 0 {
        if let Some(auth) = phdr[Pseudo::Authority as usize].clone() {
            headers.push((Bytes::from_static(b"host"), auth));
        }
    }

    // a body with neither length nor tunnel becomes chunked in HTTP/1.1
    if msgf.contains(MsgFmt::BODY)
        && !msgf.intersects(MsgFmt::BODY_TUNNEL)
        && !msgf.intersects(MsgFmt::BODY_CL)
    {
        headers.push((
            Bytes::from_static(b"transfer-encoding"),
            Bytes::from_static(b"chunked"),
        ));
    }

    if !cookies.is_empty() {
        let mut joined = Vec::new();
        for (i, c) in cookies.iter().enumerate() {
            if i > 0 {
                joined.extend_from_slice(b"; ");
            }
            joined.extend_from_slice(c);
        }
        headers.push((Bytes::from_static(b"cookie"), Bytes::from(joined)));
    }

    Ok(ProcessedRequest {
        method,
        uri,
        headers,
        parsing_note,
    })
}

fn process_response(
    list: &[HeaderRec],
    msgf: &mut MsgFmt,
    body_len: &mut u64,
) -> crate::Result<ProcessedResponse> {
    let mut fields = 0u32;
    let mut status_val: Option<Bytes> = None;
    let mut headers: Vec<(Bytes, Bytes)> = Vec::with_capacity(list.len());

    for rec in list {
        match rec {
            HeaderRec::Pseudo(p, v) => {
                if fields & FND_NONE != 0 || fields & p.bit() != 0 {
                    return Err(Error::new_parse(Parse::PseudoHeader));
                }
                if *p != Pseudo::Status {
                    // request pseudo-headers are invalid in responses
                    return Err(Error::new_parse(Parse::PseudoHeader));
                }
                fields |= p.bit();
                status_val = Some(v.clone());
            }
            HeaderRec::Field(n, v) => {
                if has_upper(n) {
                    return Err(Error::new_parse(Parse::HeaderName));
                }
                if Pseudo::from_name(n).is_some() {
                    if fields & FND_NONE != 0 || !eq_ascii(n, ":status") || status_val.is_some()
                    {
                        return Err(Error::new_parse(Parse::PseudoHeader));
                    }
                    fields |= Pseudo::Status.bit();
                    status_val = Some(v.clone());
                    continue;
                }
                fields |= FND_NONE;
                if eq_ascii(n, "content-length") {
                    if !parse_content_length(msgf, v, body_len)? {
                        continue;
                    }
                    headers.push((n.clone(), v.clone()));
                    continue;
                }
                if eq_ascii(n, "connection")
                    || eq_ascii(n, "proxy-connection")
                    || eq_ascii(n, "keep-alive")
                    || eq_ascii(n, "upgrade")
                    || eq_ascii(n, "transfer-encoding")
                {
                    return Err(Error::new_parse(Parse::ConnectionHeader));
                }
                headers.push((n.clone(), v.clone()));
            }
        }
    }

    let status_val = status_val.ok_or_else(|| Error::new_parse(Parse::MissingPseudo))?;
    if status_val.len() != 3 || !status_val.iter().all(|b| b.is_ascii_digit()) {
        return Err(Error::new_parse(Parse::Status));
    }
    let status = (u16::from(status_val[0] - b'0') * 100)
        + (u16::from(status_val[1] - b'0') * 10)
        + u16::from(status_val[2] - b'0');

    if (100..200).contains(&status) && status != 101 {
        // an interim response; the final HEADERS frame is still to come
        msgf.remove(MsgFmt::BODY);
        msgf.insert(MsgFmt::RSP_1XX);
    }

    Ok(ProcessedResponse { status, headers })
}

fn emit_h1_headers(headers: &[(Bytes, Bytes)], out: &mut Vec<u8>) {
    for (n, v) in headers {
        out.extend_from_slice(n);
        out.extend_from_slice(b": ");
        out.extend_from_slice(v);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Transforms a request header list into a flat HTTP/1.1 request head.
pub fn make_h1_request(
    list: &[HeaderRec],
    out: &mut Vec<u8>,
    msgf: &mut MsgFmt,
    body_len: &mut u64,
) -> crate::Result<()> {
    let req = process_request(list, msgf, body_len)?;
    out.extend_from_slice(&req.method);
    out.push(b' ');
    out.extend_from_slice(&req.uri);
    out.extend_from_slice(b" HTTP/1.1\r\n");
    emit_h1_headers(&req.headers, out);
    Ok(())
}

/// Transforms a response header list into a flat HTTP/1.1 status head.
pub fn make_h1_response(
    list: &[HeaderRec],
    out: &mut Vec<u8>,
    msgf: &mut MsgFmt,
    body_len: &mut u64,
) -> crate::Result<()> {
    let rsp = process_response(list, msgf, body_len)?;
    out.extend_from_slice(b"HTTP/1.1 ");
    let mut buf = itoa::Buffer::new();
    out.extend_from_slice(buf.format(rsp.status).as_bytes());
    out.extend_from_slice(b"\r\n");
    emit_h1_headers(&rsp.headers, out);
    Ok(())
}

/// Transforms a request header list into an [`Htx`] message.
pub fn make_htx_request(
    list: &[HeaderRec],
    htx: &mut Htx,
    msgf: &mut MsgFmt,
    body_len: &mut u64,
) -> crate::Result<()> {
    let req = process_request(list, msgf, body_len)?;
    if req.parsing_note {
        htx.flags.insert(HtxFlags::PARSING_ERROR);
    }
    htx.push(Block::ReqStart {
        method: req.method,
        uri: req.uri,
    });
    for (name, value) in req.headers {
        htx.push(Block::Header { name, value });
    }
    htx.push(Block::EndOfHeaders);
    Ok(())
}

/// Transforms a response header list into an [`Htx`] message.
pub fn make_htx_response(
    list: &[HeaderRec],
    htx: &mut Htx,
    msgf: &mut MsgFmt,
    body_len: &mut u64,
) -> crate::Result<()> {
    let rsp = process_response(list, msgf, body_len)?;
    htx.push(Block::ResStart { status: rsp.status });
    for (name, value) in rsp.headers {
        htx.push(Block::Header { name, value });
    }
    htx.push(Block::EndOfHeaders);
    Ok(())
}

/// Validates a trailer list and emits the unchanged `name: value` rows.
/// The empty line is not included; the caller appends its end-of-trailers
/// marker.
pub fn make_h1_trailers(list: &[HeaderRec], out: &mut Vec<u8>) -> crate::Result<()> {
    for rec in list {
        match rec {
            HeaderRec::Pseudo(..) => return Err(Error::new_parse(Parse::Trailer)),
            HeaderRec::Field(n, v) => {
                if has_upper(n) {
                    return Err(Error::new_parse(Parse::HeaderName));
                }
                if Pseudo::from_name(n).is_some() {
                    return Err(Error::new_parse(Parse::Trailer));
                }
                if eq_ascii(n, "host")
                    || eq_ascii(n, "content-length")
                    || eq_ascii(n, "connection")
                    || eq_ascii(n, "proxy-connection")
                    || eq_ascii(n, "keep-alive")
                    || eq_ascii(n, "upgrade")
                    || eq_ascii(n, "te")
                    || eq_ascii(n, "transfer-encoding")
                {
                    return Err(Error::new_parse(Parse::Trailer));
                }
                out.extend_from_slice(n);
                out.extend_from_slice(b": ");
                out.extend_from_slice(v);
                out.extend_from_slice(b"\r\n");
            }
        }
    }
    Ok(())
}

/// Trailer list to [`Htx`] blocks, ending with the end-of-trailers marker.
pub fn make_htx_trailers(list: &[HeaderRec], htx: &mut Htx) -> crate::Result<()> {
    let mut flat = Vec::new();
    make_h1_trailers(list, &mut flat)?;
    for rec in list {
        if let HeaderRec::Field(n, v) = rec {
            htx.push(Block::Trailer {
                name: n.clone(),
                value: v.clone(),
            });
        }
    }
    htx.push(Block::EndOfTrailers);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h1_request(list: &[HeaderRec], msgf: &mut MsgFmt) -> crate::Result<String> {
        let mut out = Vec::new();
        let mut body_len = 0u64;
        make_h1_request(list, &mut out, msgf, &mut body_len)?;
        Ok(String::from_utf8(out).unwrap())
    }

    fn h1_response(list: &[HeaderRec], msgf: &mut MsgFmt) -> crate::Result<String> {
        let mut out = Vec::new();
        let mut body_len = 0u64;
        make_h1_response(list, &mut out, msgf, &mut body_len)?;
        Ok(String::from_utf8(out).unwrap())
    }

    fn get_request() -> Vec<HeaderRec> {
        vec![
            HeaderRec::pseudo(Pseudo::Method, "GET"),
            HeaderRec::pseudo(Pseudo::Scheme, "https"),
            HeaderRec::pseudo(Pseudo::Path, "/x"),
            HeaderRec::pseudo(Pseudo::Authority, "example.com"),
        ]
    }

    #[test]
    fn simple_get_with_synthesised_host() {
        let mut msgf = MsgFmt::NONE;
        let out = h1_request(&get_request(), &mut msgf).unwrap();
        assert_eq!(out, "GET /x HTTP/1.1\r\nhost: example.com\r\n\r\n");
    }

    #[test]
    fn literal_host_wins_over_authority() {
        let mut list = get_request();
        list.push(HeaderRec::field("host", "other.example"));
        let mut msgf = MsgFmt::NONE;
        let out = h1_request(&list, &mut msgf).unwrap();
        assert_eq!(out, "GET /x HTTP/1.1\r\nhost: other.example\r\n\r\n");
    }

    #[test]
    fn connect_request_is_a_tunnel() {
        let list = vec![
            HeaderRec::pseudo(Pseudo::Method, "CONNECT"),
            HeaderRec::pseudo(Pseudo::Authority, "example.com:443"),
        ];
        let mut msgf = MsgFmt::NONE;
        let out = h1_request(&list, &mut msgf).unwrap();
        assert_eq!(
            out,
            "CONNECT example.com:443 HTTP/1.1\r\nhost: example.com:443\r\n\r\n"
        );
        assert!(msgf.contains(MsgFmt::BODY_TUNNEL));
    }

    #[test]
    fn connect_with_path_is_rejected() {
        let list = vec![
            HeaderRec::pseudo(Pseudo::Method, "CONNECT"),
            HeaderRec::pseudo(Pseudo::Path, "/"),
            HeaderRec::pseudo(Pseudo::Authority, "example.com:443"),
        ];
        let mut msgf = MsgFmt::NONE;
        assert!(h1_request(&list, &mut msgf).is_err());
    }

    #[test]
    fn cookie_rows_coalesce_in_order() {
        let mut list = get_request();
        list.push(HeaderRec::field("cookie", "a=1"));
        list.push(HeaderRec::field("x", "y"));
        list.push(HeaderRec::field("cookie", "b=2"));
        let mut msgf = MsgFmt::NONE;
        let out = h1_request(&list, &mut msgf).unwrap();
        let cookie_pos = out.find("cookie: a=1; b=2\r\n").expect("single cookie header");
        let x_pos = out.find("x: y\r\n").unwrap();
        assert!(x_pos < cookie_pos);
        assert_eq!(out.matches("cookie:").count(), 1);
    }

    #[test]
    fn uppercase_header_name_is_rejected() {
        let mut list = get_request();
        list.push(HeaderRec::field("X-Thing", "v"));
        let mut msgf = MsgFmt::NONE;
        let err = h1_request(&list, &mut msgf).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn pseudo_after_regular_is_rejected() {
        let list = vec![
            HeaderRec::pseudo(Pseudo::Method, "GET"),
            HeaderRec::pseudo(Pseudo::Scheme, "https"),
            HeaderRec::field("accept", "*/*"),
            HeaderRec::pseudo(Pseudo::Path, "/x"),
        ];
        let mut msgf = MsgFmt::NONE;
        assert!(h1_request(&list, &mut msgf).is_err());
    }

    #[test]
    fn repeated_pseudo_is_rejected() {
        let mut list = get_request();
        list.push(HeaderRec::pseudo(Pseudo::Method, "POST"));
        let mut msgf = MsgFmt::NONE;
        assert!(h1_request(&list, &mut msgf).is_err());
    }

    #[test]
    fn status_in_request_is_rejected() {
        let mut list = get_request();
        list.push(HeaderRec::pseudo(Pseudo::Status, "200"));
        let mut msgf = MsgFmt::NONE;
        assert!(h1_request(&list, &mut msgf).is_err());
    }

    #[test]
    fn connection_family_headers_are_rejected() {
        for name in &[
            "connection",
            "proxy-connection",
            "keep-alive",
            "upgrade",
            "transfer-encoding",
        ] {
            let mut list = get_request();
            list.push(HeaderRec::Field(
                Bytes::copy_from_slice(name.as_bytes()),
                Bytes::from_static(b"x"),
            ));
            let mut msgf = MsgFmt::NONE;
            assert!(h1_request(&list, &mut msgf).is_err(), "{}", name);
        }
    }

    #[test]
    fn te_trailers_is_kept_others_rejected() {
        let mut list = get_request();
        list.push(HeaderRec::field("te", "trailers"));
        let mut msgf = MsgFmt::NONE;
        let out = h1_request(&list, &mut msgf).unwrap();
        assert!(out.contains("te: trailers\r\n"));

        let mut list = get_request();
        list.push(HeaderRec::field("te", "gzip"));
        let mut msgf = MsgFmt::NONE;
        assert!(h1_request(&list, &mut msgf).is_err());
    }

    #[test]
    fn empty_path_is_rejected() {
        let list = vec![
            HeaderRec::pseudo(Pseudo::Method, "GET"),
            HeaderRec::pseudo(Pseudo::Scheme, "https"),
            HeaderRec::pseudo(Pseudo::Path, ""),
        ];
        let mut msgf = MsgFmt::NONE;
        assert!(h1_request(&list, &mut msgf).is_err());
    }

    #[test]
    fn path_with_spaces_notes_but_proceeds() {
        let list = vec![
            HeaderRec::pseudo(Pseudo::Method, "GET"),
            HeaderRec::pseudo(Pseudo::Scheme, "https"),
            HeaderRec::pseudo(Pseudo::Path, "/a b"),
        ];
        let mut htx = Htx::new();
        let mut msgf = MsgFmt::NONE;
        let mut body_len = 0;
        make_htx_request(&list, &mut htx, &mut msgf, &mut body_len).unwrap();
        assert!(htx.flags.contains(HtxFlags::PARSING_ERROR));
        assert!(matches!(htx.blocks()[0], Block::ReqStart { .. }));
    }

    #[test]
    fn body_without_length_becomes_chunked() {
        let mut msgf = MsgFmt::BODY;
        let out = h1_request(&get_request(), &mut msgf).unwrap();
        assert!(out.contains("transfer-encoding: chunked\r\n"));
    }

    #[test]
    fn content_length_suppresses_chunked() {
        let mut list = get_request();
        list.push(HeaderRec::field("content-length", "5"));
        let mut msgf = MsgFmt::BODY;
        let out = h1_request(&list, &mut msgf).unwrap();
        assert!(!out.contains("chunked"));
        assert!(out.contains("content-length: 5\r\n"));
        assert!(msgf.contains(MsgFmt::BODY_CL));
    }

    #[test]
    fn equal_duplicate_content_lengths_fold() {
        let mut list = get_request();
        list.push(HeaderRec::field("content-length", "5"));
        list.push(HeaderRec::field("content-length", "5, 5"));
        let mut msgf = MsgFmt::NONE;
        let out = h1_request(&list, &mut msgf).unwrap();
        assert_eq!(out.matches("content-length").count(), 1);
    }

    #[test]
    fn conflicting_content_lengths_are_rejected() {
        let mut list = get_request();
        list.push(HeaderRec::field("content-length", "5"));
        list.push(HeaderRec::field("content-length", "6"));
        let mut msgf = MsgFmt::NONE;
        assert!(h1_request(&list, &mut msgf).is_err());

        let mut list = get_request();
        list.push(HeaderRec::field("content-length", "5, 6"));
        let mut msgf = MsgFmt::NONE;
        assert!(h1_request(&list, &mut msgf).is_err());
    }

    #[test]
    fn content_length_overflow_is_rejected() {
        let mut list = get_request();
        list.push(HeaderRec::field("content-length", "99999999999999999999"));
        let mut msgf = MsgFmt::NONE;
        assert!(h1_request(&list, &mut msgf).is_err());
    }

    #[test]
    fn simple_response() {
        let list = vec![
            HeaderRec::pseudo(Pseudo::Status, "200"),
            HeaderRec::field("content-length", "5"),
        ];
        let mut msgf = MsgFmt::BODY;
        let out = h1_response(&list, &mut msgf).unwrap();
        assert_eq!(out, "HTTP/1.1 200\r\ncontent-length: 5\r\n\r\n");
    }

    #[test]
    fn interim_response_expects_more_headers() {
        let list = vec![HeaderRec::pseudo(Pseudo::Status, "100")];
        let mut msgf = MsgFmt::BODY;
        h1_response(&list, &mut msgf).unwrap();
        assert!(msgf.contains(MsgFmt::RSP_1XX));
        assert!(!msgf.contains(MsgFmt::BODY));

        let list = vec![HeaderRec::pseudo(Pseudo::Status, "101")];
        let mut msgf = MsgFmt::BODY;
        h1_response(&list, &mut msgf).unwrap();
        assert!(!msgf.contains(MsgFmt::RSP_1XX));
    }

    #[test]
    fn malformed_status_is_rejected() {
        for status in &["20", "2000", "2x0", ""] {
            let list = vec![HeaderRec::Pseudo(
                Pseudo::Status,
                Bytes::copy_from_slice(status.as_bytes()),
            )];
            let mut msgf = MsgFmt::NONE;
            assert!(h1_response(&list, &mut msgf).is_err(), "{:?}", status);
        }
    }

    #[test]
    fn request_pseudo_in_response_is_rejected() {
        let list = vec![
            HeaderRec::pseudo(Pseudo::Status, "200"),
            HeaderRec::pseudo(Pseudo::Path, "/"),
        ];
        let mut msgf = MsgFmt::NONE;
        assert!(h1_response(&list, &mut msgf).is_err());
    }

    #[test]
    fn trailers_pass_through() {
        let list = vec![
            HeaderRec::field("grpc-status", "0"),
            HeaderRec::field("grpc-message", "ok"),
        ];
        let mut out = Vec::new();
        make_h1_trailers(&list, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "grpc-status: 0\r\ngrpc-message: ok\r\n"
        );
    }

    #[test]
    fn forbidden_trailers_are_rejected() {
        for name in &[
            "host",
            "content-length",
            "connection",
            "te",
            "transfer-encoding",
            "upgrade",
            "keep-alive",
            "proxy-connection",
        ] {
            let list = vec![HeaderRec::Field(
                Bytes::copy_from_slice(name.as_bytes()),
                Bytes::from_static(b"x"),
            )];
            let mut out = Vec::new();
            assert!(make_h1_trailers(&list, &mut out).is_err(), "{}", name);
        }
        let list = vec![HeaderRec::pseudo(Pseudo::Status, "200")];
        let mut out = Vec::new();
        assert!(make_h1_trailers(&list, &mut out).is_err());
    }

    #[test]
    fn round_trips_through_an_h1_parser() {
        let mut list = get_request();
        list.push(HeaderRec::field("accept", "*/*"));
        list.push(HeaderRec::field("content-length", "3"));
        let mut msgf = MsgFmt::BODY;
        let out = h1_request(&list, &mut msgf).unwrap();

        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut req = httparse::Request::new(&mut headers);
        let status = req.parse(out.as_bytes()).unwrap();
        assert!(status.is_complete());
        assert_eq!(req.method, Some("GET"));
        assert_eq!(req.path, Some("/x"));
        assert_eq!(req.version, Some(1));
        let host = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .unwrap();
        assert_eq!(host.value, b"example.com");
    }
}
