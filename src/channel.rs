//! Directional byte conduits between two stream interfaces.
//!
//! A channel owns one [`Buffer`], the shutdown/error flag word for its
//! direction, the `to_forward` budget authorised by the analysers and the
//! read/write expiration timers. The request channel flows client to
//! server, the response channel the other way around.

use tokio::time::{Duration, Instant};

use crate::buffer::Buffer;
use crate::common::ticks;

/// Channel flag word. The bits mirror the state the stream engine and the
/// analysers communicate through.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Flags(pub(crate) u32);

impl Flags {
    /// Producer side is closed, no more input will ever arrive.
    pub const SHUTR: Flags = Flags(1 << 0);
    /// Close the producer side as soon as policy permits.
    pub const SHUTR_NOW: Flags = Flags(1 << 1);
    /// Consumer side is closed, no more output may be emitted.
    pub const SHUTW: Flags = Flags(1 << 2);
    /// Close the consumer side once the buffer is drained.
    pub const SHUTW_NOW: Flags = Flags(1 << 3);
    /// An error was seen on the producer side.
    pub const READ_ERROR: Flags = Flags(1 << 4);
    /// An error was seen on the consumer side.
    pub const WRITE_ERROR: Flags = Flags(1 << 5);
    /// The read timer fired.
    pub const READ_TIMEOUT: Flags = Flags(1 << 6);
    /// The write timer fired.
    pub const WRITE_TIMEOUT: Flags = Flags(1 << 7);
    /// The analyser inactivity timer fired.
    pub const ANA_TIMEOUT: Flags = Flags(1 << 8);
    /// A producer is wired to this channel.
    pub const READ_ATTACHED: Flags = Flags(1 << 9);
    /// Close the consumer automatically once the producer closes.
    pub const AUTO_CLOSE: Flags = Flags(1 << 10);
    /// Never wait for more data before forwarding (TCP low-latency hint).
    pub const NEVER_WAIT: Flags = Flags(1 << 11);
    /// Kernel splicing authorised for this channel.
    pub const KERN_SPLICING: Flags = Flags(1 << 12);
    /// Producer looks like a data streamer.
    pub const STREAMER: Flags = Flags(1 << 13);
    /// Producer streams fast enough for aggressive forwarding.
    pub const STREAMER_FAST: Flags = Flags(1 << 14);
    /// Analysers are currently being walked on this channel.
    pub const ANA_INPROGRESS: Flags = Flags(1 << 15);
    /// One-shot wakeup requested by an analyser.
    pub const WAKE_ONCE: Flags = Flags(1 << 16);
    /// Do not expire the read timer on the next pass.
    pub const READ_NOEXP: Flags = Flags(1 << 17);
    /// Transient write-side wakeup, scrubbed at task entry.
    pub const WAKE_WRITE: Flags = Flags(1 << 18);
    /// New input arrived since the last analyser walk.
    pub const READ_PARTIAL: Flags = Flags(1 << 19);
    /// Output was emitted since the last walk.
    pub const WRITE_PARTIAL: Flags = Flags(1 << 20);

    /// Bits whose change re-triggers the analyser fixed-point loop.
    pub const MASK_ANALYSER: Flags = Flags(
        Self::SHUTR.0
            | Self::SHUTW.0
            | Self::READ_ERROR.0
            | Self::WRITE_ERROR.0
            | Self::READ_TIMEOUT.0
            | Self::WRITE_TIMEOUT.0
            | Self::ANA_TIMEOUT.0
            | Self::READ_PARTIAL.0
            | Self::WRITE_PARTIAL.0
            | Self::WAKE_ONCE.0,
    );

    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Flags({:#x})", self.0)
    }
}

/// `to_forward` value meaning "forward everything without accounting".
pub const FORWARD_INFINITE: u64 = u64::MAX;

/// One direction of a stream.
pub struct Channel {
    /// Data staged between producer and consumer.
    pub buf: Buffer,
    /// Current flag word.
    pub flags: Flags,
    /// Bytes the analysers authorised to pass without further inspection.
    pub to_forward: u64,
    /// Total bytes ever transferred through this channel.
    pub total: u64,
    /// Read-side expiration date.
    pub rex: Option<Instant>,
    /// Write-side expiration date.
    pub wex: Option<Instant>,
    /// Analyser inactivity expiration date.
    pub analyse_exp: Option<Instant>,
    /// Read timeout used to re-arm `rex`.
    pub rto: Option<Duration>,
    /// Write timeout used to re-arm `wex`.
    pub wto: Option<Duration>,
    /// Analyser bitmask; bit values are defined by the stream engine.
    pub analysers: u32,
}

impl Channel {
    pub fn new() -> Channel {
        Channel {
            buf: Buffer::new(),
            flags: Flags(0),
            to_forward: 0,
            total: 0,
            rex: None,
            wex: None,
            analyse_exp: None,
            rto: None,
            wto: None,
            analysers: 0,
        }
    }

    /// Whether the producer may still deliver bytes.
    pub fn may_recv(&self) -> bool {
        !self.flags.intersects(Flags::SHUTR) && !self.buf.is_full()
    }

    /// Whether the consumer may still emit bytes.
    pub fn may_send(&self) -> bool {
        !self.flags.intersects(Flags::SHUTW)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Feeds producer bytes in, accounting `total` and consuming the
    /// forward budget. Returns the number of bytes accepted.
    pub fn recv(&mut self, src: &[u8]) -> usize {
        if self.flags.contains(Flags::SHUTR) {
            return 0;
        }
        let n = self.buf.put_slice(src);
        if n > 0 {
            self.total += n as u64;
            self.flags.insert(Flags::READ_PARTIAL);
        }
        n
    }

    /// Drains up to `dst.len()` consumer bytes out, within the forward
    /// budget. With an exhausted budget nothing moves until an analyser
    /// authorises more.
    pub fn send(&mut self, dst: &mut [u8]) -> usize {
        if self.flags.contains(Flags::SHUTW) {
            return 0;
        }
        let budget = if self.to_forward == FORWARD_INFINITE {
            dst.len()
        } else {
            self.to_forward.min(dst.len() as u64) as usize
        };
        if budget == 0 {
            return 0;
        }
        let n = self.buf.take(&mut dst[..budget]);
        if n > 0 {
            self.buf.start_output();
            self.flags.insert(Flags::WRITE_PARTIAL);
            if self.to_forward != FORWARD_INFINITE {
                self.to_forward -= n as u64;
            }
        }
        n
    }

    /// Adds `bytes` to the forward budget; `FORWARD_INFINITE` latches.
    pub fn forward(&mut self, bytes: u64) {
        if bytes == FORWARD_INFINITE || self.to_forward == FORWARD_INFINITE {
            self.to_forward = FORWARD_INFINITE;
        } else {
            // keep the sentinel value unreachable by accumulation
            self.to_forward = self
                .to_forward
                .saturating_add(bytes)
                .min(FORWARD_INFINITE - 1);
        }
    }

    /// Marks the producer side definitively closed.
    pub fn shutr(&mut self) {
        self.flags.insert(Flags::SHUTR);
        self.flags.remove(Flags::SHUTR_NOW);
        self.rex = None;
    }

    /// Marks the consumer side definitively closed. No byte may be emitted
    /// past this point.
    pub fn shutw(&mut self) {
        self.flags.insert(Flags::SHUTW);
        self.flags.remove(Flags::SHUTW_NOW);
        self.wex = None;
    }

    /// Requests a producer close, effective immediately.
    pub fn shutr_now(&mut self) {
        self.flags.insert(Flags::SHUTR_NOW);
    }

    /// Requests a consumer close, effective once the buffer is drained.
    pub fn shutw_now(&mut self) {
        self.flags.insert(Flags::SHUTW_NOW);
    }

    /// Aborts the channel in both directions at once.
    pub fn abort(&mut self) {
        self.shutr_now();
        self.shutw_now();
        self.flags.insert(Flags::AUTO_CLOSE);
    }

    /// Whether the pending consumer close may now take effect.
    pub fn shutw_pending(&self) -> bool {
        self.flags.contains(Flags::SHUTW_NOW)
            && !self.flags.contains(Flags::SHUTW)
            && (self.buf.is_empty() || self.flags.intersects(Flags::READ_ERROR))
    }

    /// Re-arms the read expiration from its timeout.
    pub fn rearm_read(&mut self, now: Instant) {
        if !self.flags.intersects(Flags::SHUTR) {
            self.rex = ticks::arm(now, self.rto);
        }
    }

    /// Re-arms the write expiration from its timeout.
    pub fn rearm_write(&mut self, now: Instant) {
        if !self.flags.intersects(Flags::SHUTW) {
            self.wex = ticks::arm(now, self.wto);
        }
    }

    /// Checks the three timers, latching the matching flags. Returns true
    /// if any fired on this call.
    pub fn check_timeouts(&mut self, now: Instant) -> bool {
        let mut fired = false;
        if !self.flags.intersects(Flags::READ_TIMEOUT | Flags::READ_NOEXP)
            && ticks::expired(self.rex, now)
        {
            self.flags.insert(Flags::READ_TIMEOUT);
            self.rex = None;
            fired = true;
        }
        if !self.flags.intersects(Flags::WRITE_TIMEOUT) && ticks::expired(self.wex, now) {
            self.flags.insert(Flags::WRITE_TIMEOUT);
            self.wex = None;
            fired = true;
        }
        if !self.flags.intersects(Flags::ANA_TIMEOUT) && ticks::expired(self.analyse_exp, now)
        {
            self.flags.insert(Flags::ANA_TIMEOUT);
            self.analyse_exp = None;
            fired = true;
        }
        fired
    }

    /// The channel's contribution to the owning task's next deadline.
    pub fn next_expiry(&self) -> Option<Instant> {
        ticks::first(ticks::first(self.rex, self.wex), self.analyse_exp)
    }
}

impl Default for Channel {
    fn default() -> Channel {
        Channel::new()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("flags", &self.flags)
            .field("data", &self.buf.data())
            .field("to_forward", &self.to_forward)
            .field("total", &self.total)
            .field("analysers", &format_args!("{:#x}", self.analysers))
            .finish()
    }
}
