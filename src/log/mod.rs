//! The log pipeline: syslog targets, framing and emission.
//!
//! Access-log lines are rendered by [`format`], then framed per target
//! (RFC 3164, RFC 5424, short or raw) and shipped as one datagram each,
//! over UDP or a unix socket. Header text is re-rendered at most once per
//! second per target; only the `<PRI>` bytes change between messages.
//! A full socket increments the target's dropped counter instead of
//! blocking the stream that logs.

pub mod format;
pub mod sampling;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use time::OffsetDateTime;
use tokio::time::Instant;

pub use self::format::{compile, render, Node, Options, Report};
pub use self::sampling::Sampling;

/// Syslog facilities, `kern` through `local7`.
pub const FACILITIES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron", "auth2",
    "ftp", "ntp", "audit", "alert", "cron2", "local0", "local1", "local2", "local3", "local4",
    "local5", "local6", "local7",
];

/// Syslog severities, `emerg` through `debug`.
pub const LEVELS: [&str; 8] = [
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

/// Resolves a facility name to its numeric code.
pub fn get_log_facility(name: &str) -> Option<u8> {
    FACILITIES.iter().position(|f| *f == name).map(|p| p as u8)
}

/// Resolves a severity name to its numeric code.
pub fn get_log_level(name: &str) -> Option<u8> {
    LEVELS.iter().position(|l| *l == name).map(|p| p as u8)
}

/// Wire framing of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Rfc3164,
    Rfc5424,
    Short,
    Raw,
}

impl LogFormat {
    pub fn parse(name: &str) -> Option<LogFormat> {
        Some(match name {
            "rfc3164" => LogFormat::Rfc3164,
            "rfc5424" => LogFormat::Rfc5424,
            "short" => LogFormat::Short,
            "raw" => LogFormat::Raw,
            _ => return None,
        })
    }
}

/// Where a target's datagrams go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogAddr {
    Udp(SocketAddr),
    UnixDgram(PathBuf),
}

/// Rendered header bytes, rebuilt at most once per second.
#[derive(Debug, Default)]
struct HeaderCache {
    rendered: Vec<u8>,
    built_at: Option<Instant>,
}

/// One log destination.
#[derive(Debug)]
pub struct Target {
    pub addr: LogAddr,
    pub format: LogFormat,
    pub facility: u8,
    /// Messages above this severity are skipped.
    pub max_level: u8,
    /// Messages below this severity are raised to it.
    pub min_level: u8,
    /// Truncation length for the final datagram.
    pub maxlen: usize,
    pub sampling: Option<Sampling>,
    /// Lines lost to a full socket, exposed by the stats layer.
    pub dropped: AtomicU64,
    header: Mutex<HeaderCache>,
}

/// Default datagram size cap, as conventional for syslog.
pub const MAX_SYSLOG_LEN: usize = 1024;

impl Target {
    pub fn new(addr: LogAddr, facility: u8) -> Target {
        Target {
            addr,
            format: LogFormat::Rfc3164,
            facility,
            max_level: 7,
            min_level: 0,
            maxlen: MAX_SYSLOG_LEN,
            sampling: None,
            dropped: AtomicU64::new(0),
            header: Mutex::new(HeaderCache::default()),
        }
    }

    /// Parses the words of a `log` directive:
    /// `log <addr> [len <n>] [format <fmt>] [sample <ranges>:<size>]
    /// <facility> [<max-level> [<min-level>]]`.
    pub fn parse_directive(words: &[&str]) -> crate::Result<Target> {
        let bad = |msg: &'static str| crate::Error::new_log_format(msg);
        let mut it = words.iter().copied().peekable();
        let addr_txt = it.next().ok_or_else(|| bad("missing log address"))?;
        let addr = if let Some(path) = addr_txt.strip_prefix("unix@") {
            LogAddr::UnixDgram(PathBuf::from(path))
        } else {
            let bare = addr_txt.strip_prefix("ipv4@").or_else(|| addr_txt.strip_prefix("ipv6@")).unwrap_or(addr_txt);
            LogAddr::Udp(
                bare.parse()
                    .map_err(|_| bad("invalid log address"))?,
            )
        };
        let mut maxlen = MAX_SYSLOG_LEN;
        let mut fmt = LogFormat::Rfc3164;
        let mut sampling = None;
        loop {
            match it.peek() {
                Some(&"len") => {
                    it.next();
                    let n = it.next().ok_or_else(|| bad("missing len value"))?;
                    maxlen = n.parse().map_err(|_| bad("invalid len value"))?;
                }
                Some(&"format") => {
                    it.next();
                    let f = it.next().ok_or_else(|| bad("missing format name"))?;
                    fmt = LogFormat::parse(f).ok_or_else(|| bad("unknown log format"))?;
                }
                Some(&"sample") => {
                    it.next();
                    let spec = it.next().ok_or_else(|| bad("missing sample spec"))?;
                    sampling = Some(Sampling::parse(spec)?);
                }
                _ => break,
            }
        }
        let facility_txt = it.next().ok_or_else(|| bad("missing facility"))?;
        let facility =
            get_log_facility(facility_txt).ok_or_else(|| bad("unknown facility"))?;
        let mut target = Target::new(addr, facility);
        target.maxlen = maxlen;
        target.format = fmt;
        target.sampling = sampling;
        if let Some(level) = it.next() {
            target.max_level = get_log_level(level).ok_or_else(|| bad("unknown level"))?;
            if let Some(min) = it.next() {
                target.min_level = get_log_level(min).ok_or_else(|| bad("unknown level"))?;
            }
        }
        Ok(target)
    }

    fn pri(&self, level: u8) -> u8 {
        (self.facility << 3) | (level & 0x7)
    }

    /// Builds the full datagram for `msg` at `level`. Returns `None` when
    /// filtered by level or sampling.
    pub fn frame(
        &self,
        level: u8,
        hostname: &str,
        tag: &str,
        msg: &[u8],
        now: Instant,
        wallclock: OffsetDateTime,
    ) -> Option<Vec<u8>> {
        if level > self.max_level {
            return None;
        }
        if let Some(s) = &self.sampling {
            if !s.accept() {
                return None;
            }
        }
        let level = level.max(self.min_level);
        let mut line = Vec::with_capacity(64 + msg.len());
        match self.format {
            LogFormat::Raw => {}
            LogFormat::Short => {
                let pri = format!("<{}>", self.pri(level));
                line.extend_from_slice(pri.as_bytes());
            }
            LogFormat::Rfc3164 | LogFormat::Rfc5424 => {
                let pri = format!("<{}>", self.pri(level));
                line.extend_from_slice(pri.as_bytes());
                let mut cache = self.header.lock().unwrap();
                let stale = cache
                    .built_at
                    .map(|t| now.duration_since(t).as_secs() >= 1)
                    .unwrap_or(true);
                if stale {
                    cache.rendered = match self.format {
                        LogFormat::Rfc3164 => rfc3164_header(hostname, tag, wallclock),
                        _ => rfc5424_header(hostname, tag, wallclock),
                    };
                    cache.built_at = Some(now);
                }
                line.extend_from_slice(&cache.rendered);
            }
        }
        line.extend_from_slice(msg);
        line.truncate(self.maxlen.max(4));
        line.push(b'\n');
        Some(line)
    }
}

/// `Mon dd HH:MM:SS host tag[pid]: ` after the PRI.
fn rfc3164_header(hostname: &str, tag: &str, date: OffsetDateTime) -> Vec<u8> {
    use time::format_description::FormatItem;
    use time::macros::format_description;
    const FMT: &[FormatItem<'static>] =
        format_description!("[month repr:short] [day padding:space] [hour]:[minute]:[second]");
    let stamp = date.format(&FMT).unwrap_or_default();
    let mut out = Vec::with_capacity(48);
    out.extend_from_slice(stamp.as_bytes());
    out.push(b' ');
    if !hostname.is_empty() {
        out.extend_from_slice(hostname.as_bytes());
        out.push(b' ');
    }
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(format!("[{}]: ", std::process::id()).as_bytes());
    out
}

/// `1 ISO-timestamp host tag pid - - ` after the PRI.
fn rfc5424_header(hostname: &str, tag: &str, date: OffsetDateTime) -> Vec<u8> {
    use time::format_description::well_known::Rfc3339;
    let stamp = date.format(&Rfc3339).unwrap_or_default();
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(b"1 ");
    out.extend_from_slice(stamp.as_bytes());
    out.push(b' ');
    out.extend_from_slice(if hostname.is_empty() {
        b"-"
    } else {
        hostname.as_bytes()
    });
    out.push(b' ');
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(format!(" {} - - ", std::process::id()).as_bytes());
    out
}

thread_local! {
    /// Lazily opened per-thread sockets, one per family.
    static UDP_SOCKET: std::cell::RefCell<Option<std::net::UdpSocket>> =
        std::cell::RefCell::new(None);
    static UNIX_SOCKET: std::cell::RefCell<Option<std::os::unix::net::UnixDatagram>> =
        std::cell::RefCell::new(None);
}

static SEND_ERR_ONCE: std::sync::Once = std::sync::Once::new();

/// Ships one framed datagram to the target. A would-block condition
/// increments `dropped`; any other failure warns once per process.
pub fn send_datagram(target: &Target, frame: &[u8]) {
    let result = match &target.addr {
        LogAddr::Udp(addr) => UDP_SOCKET.with(|cell| {
            let mut cell = cell.borrow_mut();
            if cell.is_none() {
                let sock = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
                sock.set_nonblocking(true)?;
                *cell = Some(sock);
            }
            cell.as_ref().expect("socket just opened").send_to(frame, addr)
        }),
        LogAddr::UnixDgram(path) => UNIX_SOCKET.with(|cell| {
            let mut cell = cell.borrow_mut();
            if cell.is_none() {
                let sock = std::os::unix::net::UnixDatagram::unbound()?;
                sock.set_nonblocking(true)?;
                *cell = Some(sock);
            }
            cell.as_ref()
                .expect("socket just opened")
                .send_to(frame, path)
        }),
    };
    match result {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            target.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            SEND_ERR_ONCE.call_once(|| {
                tracing::warn!(error = %e, "sending a log message failed");
            });
            target.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Renders and emits one access log line to every matching target.
pub fn emit(
    targets: &[Target],
    nodes: &[Node],
    report: &Report<'_>,
    level: u8,
    hostname: &str,
    tag: &str,
    now: Instant,
    wallclock: OffsetDateTime,
) {
    let mut msg = crate::common::scratch::take_chunk();
    render(nodes, report, &mut msg);
    for target in targets {
        if let Some(frame) = target.frame(level, hostname, tag, &msg, now, wallclock) {
            send_datagram(target, &frame);
        }
    }
    crate::common::scratch::put_chunk(msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn target(fmt: LogFormat) -> Target {
        let mut t = Target::new(LogAddr::Udp("127.0.0.1:514".parse().unwrap()), 16);
        t.format = fmt;
        t
    }

    fn wallclock() -> OffsetDateTime {
        datetime!(2019-07-30 13:45:59 UTC)
    }

    #[test]
    fn facility_and_level_lookups() {
        assert_eq!(get_log_facility("local0"), Some(16));
        assert_eq!(get_log_facility("kern"), Some(0));
        assert_eq!(get_log_facility("bogus"), None);
        assert_eq!(get_log_level("err"), Some(3));
        assert_eq!(get_log_level("debug"), Some(7));
    }

    #[test]
    fn rfc3164_frame_shape() {
        let t = target(LogFormat::Rfc3164);
        let f = t
            .frame(6, "lb1", "proxy", b"hello", Instant::now(), wallclock())
            .unwrap();
        let s = String::from_utf8(f).unwrap();
        // local0.info = 16*8+6 = 134
        assert!(s.starts_with("<134>Jul 30 13:45:59 lb1 proxy["), "{:?}", s);
        assert!(s.ends_with("]: hello\n"), "{:?}", s);
    }

    #[test]
    fn rfc5424_frame_shape() {
        let t = target(LogFormat::Rfc5424);
        let f = t
            .frame(3, "lb1", "proxy", b"oops", Instant::now(), wallclock())
            .unwrap();
        let s = String::from_utf8(f).unwrap();
        assert!(s.starts_with("<131>1 2019-07-30T13:45:59Z lb1 proxy "), "{:?}", s);
        assert!(s.ends_with(" - - oops\n"), "{:?}", s);
    }

    #[test]
    fn short_and_raw_frames() {
        let t = target(LogFormat::Short);
        let f = t
            .frame(6, "lb1", "proxy", b"msg", Instant::now(), wallclock())
            .unwrap();
        assert_eq!(f, b"<134>msg\n");
        let t = target(LogFormat::Raw);
        let f = t
            .frame(6, "lb1", "proxy", b"msg", Instant::now(), wallclock())
            .unwrap();
        assert_eq!(f, b"msg\n");
    }

    #[test]
    fn level_filtering_and_min_raise() {
        let mut t = target(LogFormat::Short);
        t.max_level = 4;
        assert!(t
            .frame(6, "h", "t", b"m", Instant::now(), wallclock())
            .is_none());
        t.min_level = 3;
        let f = t
            .frame(4, "h", "t", b"m", Instant::now(), wallclock())
            .unwrap();
        // facility 16, severity raised is not applied upward: 4 >= 3
        assert_eq!(f, b"<132>m\n");
        let mut t = target(LogFormat::Short);
        t.min_level = 3;
        let f = t
            .frame(1, "h", "t", b"m", Instant::now(), wallclock())
            .unwrap();
        // severity 1 raised to 3
        assert_eq!(f, b"<131>m\n");
    }

    #[test]
    fn header_cache_rebuilds_after_a_second() {
        let t = target(LogFormat::Rfc3164);
        let now = Instant::now();
        let f1 = t.frame(6, "h", "t", b"m", now, wallclock()).unwrap();
        // within the same second the cached header is reused verbatim
        let f2 = t
            .frame(6, "h", "t", b"m", now, datetime!(2020-01-01 00:00:00 UTC))
            .unwrap();
        assert_eq!(f1, f2);
        // a second later the header is re-rendered from the new clock
        let f3 = t
            .frame(
                6,
                "h",
                "t",
                b"m",
                now + tokio::time::Duration::from_secs(2),
                datetime!(2020-01-01 00:00:00 UTC),
            )
            .unwrap();
        assert_ne!(f1, f3);
        let s = String::from_utf8(f3).unwrap();
        assert!(s.starts_with("<134>Jan  1 00:00:00"), "{:?}", s);
    }

    #[test]
    fn truncation_respects_maxlen() {
        let mut t = target(LogFormat::Raw);
        t.maxlen = 8;
        let f = t
            .frame(6, "h", "t", b"0123456789abcdef", Instant::now(), wallclock())
            .unwrap();
        assert_eq!(f, b"01234567\n");
    }

    #[test]
    fn sampling_drops_lines() {
        let mut t = target(LogFormat::Raw);
        t.sampling = Some(Sampling::parse("1:2").unwrap());
        let mut kept = 0;
        for _ in 0..100 {
            if t.frame(6, "h", "t", b"m", Instant::now(), wallclock())
                .is_some()
            {
                kept += 1;
            }
        }
        assert_eq!(kept, 50);
    }

    #[test]
    fn directive_parsing() {
        let t = Target::parse_directive(&[
            "127.0.0.1:514",
            "len",
            "4096",
            "format",
            "rfc5424",
            "sample",
            "1-3:10",
            "local3",
            "warning",
            "err",
        ])
        .unwrap();
        assert_eq!(t.addr, LogAddr::Udp("127.0.0.1:514".parse().unwrap()));
        assert_eq!(t.maxlen, 4096);
        assert_eq!(t.format, LogFormat::Rfc5424);
        assert!(t.sampling.is_some());
        assert_eq!(t.facility, 19);
        assert_eq!(t.max_level, 4);
        assert_eq!(t.min_level, 3);

        let t = Target::parse_directive(&["unix@/dev/log", "daemon"]).unwrap();
        assert_eq!(t.addr, LogAddr::UnixDgram(PathBuf::from("/dev/log")));
        assert_eq!(t.facility, 3);

        assert!(Target::parse_directive(&["127.0.0.1:514"]).is_err());
        assert!(Target::parse_directive(&["127.0.0.1:514", "nofacility"]).is_err());
        assert!(Target::parse_directive(&["127.0.0.1:514", "local0", "nolevel"]).is_err());
    }

    #[test]
    fn dropped_counter_counts_failures() {
        // an unbound unix path cannot accept datagrams
        let t = Target::new(
            LogAddr::UnixDgram(PathBuf::from("/nonexistent/janus-test.sock")),
            16,
        );
        let frame = t
            .frame(6, "h", "t", b"m", Instant::now(), wallclock())
            .unwrap();
        send_datagram(&t, &frame);
        assert_eq!(t.dropped.load(Ordering::Relaxed), 1);
    }
}
