//! The wrap-capable byte buffer underlying every channel.
//!
//! A `Buffer` is a flat area used as a ring segment: `head` is the offset
//! of the first stored byte and `data` the number of bytes stored. Stored
//! bytes may wrap past the end of the area. A reservation (`reserve`) at
//! the tail is kept free for header rewrites and is never consumed by new
//! input once the consumer has started draining output.

use bytes::Bytes;

/// The initial buffer size allocated before trying to read from IO.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

/// Default tail reservation kept available for in-place header rewrites.
pub(crate) const DEFAULT_MAX_REWRITE: usize = 1024;

/// A fixed-size ring buffer.
///
/// Invariant: `data <= size` at all times.
pub struct Buffer {
    area: Box<[u8]>,
    head: usize,
    data: usize,
    reserve: usize,
    output_started: bool,
}

impl Buffer {
    /// Creates a buffer with the default size and rewrite reservation.
    pub fn new() -> Buffer {
        Buffer::with_size(INIT_BUFFER_SIZE)
    }

    /// Creates a buffer of `size` bytes with the default reservation.
    pub fn with_size(size: usize) -> Buffer {
        Buffer {
            area: vec![0u8; size].into_boxed_slice(),
            head: 0,
            data: 0,
            reserve: DEFAULT_MAX_REWRITE.min(size / 2),
            output_started: false,
        }
    }

    /// Total capacity of the area.
    #[inline]
    pub fn size(&self) -> usize {
        self.area.len()
    }

    /// Number of bytes currently stored.
    #[inline]
    pub fn data(&self) -> usize {
        self.data
    }

    /// Offset of the first stored byte.
    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data == 0
    }

    /// Whether the buffer cannot accept a single additional input byte.
    pub fn is_full(&self) -> bool {
        self.data >= self.input_limit()
    }

    /// Room left for new input, honouring the rewrite reservation once the
    /// consumer has begun draining.
    pub fn room(&self) -> usize {
        self.input_limit() - self.data
    }

    fn input_limit(&self) -> usize {
        if self.output_started {
            self.size()
        } else {
            self.size() - self.reserve
        }
    }

    /// Marks that the consumer started draining; from here on the producer
    /// may use the reserved tail as well.
    pub fn start_output(&mut self) {
        self.output_started = true;
    }

    /// Absolute index of the original (first) byte, i.e. `head`.
    #[inline]
    pub fn orig(&self) -> usize {
        self.head
    }

    /// Wraps a logical offset from `head` to an absolute area index.
    #[inline]
    pub fn wrap(&self, ofs: usize) -> usize {
        let idx = self.head + ofs;
        if idx >= self.size() {
            idx - self.size()
        } else {
            idx
        }
    }

    /// Appends bytes, wrapping at the end of the area as needed. Returns
    /// the number of bytes actually copied, which may be short when the
    /// buffer is near full.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.room());
        let mut tail = self.wrap(self.data);
        for &b in &src[..n] {
            self.area[tail] = b;
            tail += 1;
            if tail == self.size() {
                tail = 0;
            }
        }
        self.data += n;
        n
    }

    /// Copies up to `dst.len()` bytes out without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data);
        for (i, d) in dst[..n].iter_mut().enumerate() {
            *d = self.area[self.wrap(i)];
        }
        n
    }

    /// Returns the byte at logical offset `ofs`, if stored.
    pub fn get(&self, ofs: usize) -> Option<u8> {
        if ofs < self.data {
            Some(self.area[self.wrap(ofs)])
        } else {
            None
        }
    }

    /// Consumes `n` bytes from the head.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data);
        self.head = self.wrap(n);
        self.data -= n;
        if self.data == 0 {
            // an empty ring can always restart at the origin
            self.head = 0;
        }
    }

    /// Copies and consumes up to `dst.len()` bytes.
    pub fn take(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.consume(n);
        n
    }

    /// The two contiguous readable slices, first then (possibly empty)
    /// wrapped remainder.
    pub fn readable(&self) -> (&[u8], &[u8]) {
        let size = self.size();
        let end = self.head + self.data;
        if end <= size {
            (&self.area[self.head..end], &[])
        } else {
            (&self.area[self.head..], &self.area[..end - size])
        }
    }

    /// Moves stored bytes back to offset zero so they become contiguous.
    /// Needed before handing the area to a parser that wants one slice.
    pub fn realign(&mut self) {
        if self.head == 0 {
            return;
        }
        let mut copy = Vec::with_capacity(self.data);
        {
            let (a, b) = self.readable();
            copy.extend_from_slice(a);
            copy.extend_from_slice(b);
        }
        self.area[..copy.len()].copy_from_slice(&copy);
        self.head = 0;
    }

    /// Snapshot of the stored bytes as one owned contiguous blob.
    pub fn to_bytes(&self) -> Bytes {
        let mut v = Vec::with_capacity(self.data);
        let (a, b) = self.readable();
        v.extend_from_slice(a);
        v.extend_from_slice(b);
        Bytes::from(v)
    }

    /// Drops everything and rewinds to the origin.
    pub fn reset(&mut self) {
        self.head = 0;
        self.data = 0;
        self.output_started = false;
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("head", &self.head)
            .field("data", &self.data)
            .field("reserve", &self.reserve)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_take_round_trip() {
        let mut buf = Buffer::with_size(16);
        assert_eq!(buf.put_slice(b"hello"), 5);
        assert_eq!(buf.data(), 5);
        let mut out = [0u8; 5];
        assert_eq!(buf.take(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert!(buf.is_empty());
        assert_eq!(buf.head(), 0);
    }

    #[test]
    fn wraps_across_the_end() {
        let mut buf = Buffer::with_size(8);
        buf.start_output();
        assert_eq!(buf.put_slice(b"abcdef"), 6);
        let mut out = [0u8; 4];
        buf.take(&mut out);
        assert_eq!(&out, b"abcd");
        // head is now 4, writing 5 bytes wraps
        assert_eq!(buf.put_slice(b"ghijk"), 5);
        assert_eq!(buf.data(), 7);
        let (a, b) = buf.readable();
        assert_eq!(a, b"efgh");
        assert_eq!(b, b"ijk");
    }

    #[test]
    fn reservation_blocks_input_until_output() {
        let mut buf = Buffer::with_size(16);
        buf.reserve = 4;
        assert_eq!(buf.put_slice(&[0u8; 16]), 12);
        assert!(buf.is_full());
        buf.start_output();
        assert_eq!(buf.room(), 4);
        assert_eq!(buf.put_slice(&[0u8; 8]), 4);
        assert_eq!(buf.data(), buf.size());
    }

    #[test]
    fn realign_makes_contiguous() {
        let mut buf = Buffer::with_size(8);
        buf.start_output();
        buf.put_slice(b"abcdef");
        let mut out = [0u8; 5];
        buf.take(&mut out);
        buf.put_slice(b"xyzw");
        assert_ne!(buf.head(), 0);
        buf.realign();
        assert_eq!(buf.head(), 0);
        let (a, b) = buf.readable();
        assert_eq!(a, b"fxyzw");
        assert!(b.is_empty());
    }

    #[test]
    fn data_never_exceeds_size() {
        let mut buf = Buffer::with_size(8);
        buf.start_output();
        for _ in 0..4 {
            buf.put_slice(b"0123456789");
            assert!(buf.data() <= buf.size());
            let mut out = [0u8; 3];
            buf.take(&mut out);
        }
    }
}
