//! Log sampling: emit only the lines whose index falls in configured
//! ranges.
//!
//! A target may carry `sample <ranges>:<size>`: a monotonically advancing
//! per-target counter modulo `size` selects a 1-based index; the line is
//! kept only when the index lands inside one of the sorted,
//! non-overlapping ranges.

use std::sync::atomic::{AtomicU64, Ordering};

/// A compiled sampling specification.
#[derive(Debug)]
pub struct Sampling {
    /// Inclusive `(low, high)` pairs, sorted, within `[1, size]`.
    ranges: Vec<(u32, u32)>,
    size: u32,
    counter: AtomicU64,
}

impl Sampling {
    /// Parses `"<ranges>:<size>"`, e.g. `"1-3,8:10"`.
    pub fn parse(spec: &str) -> crate::Result<Sampling> {
        let bad = |msg: &'static str| crate::Error::new_log_format(msg);
        let (ranges_txt, size_txt) = spec
            .rsplit_once(':')
            .ok_or_else(|| bad("missing sample size"))?;
        let size: u32 = size_txt.parse().map_err(|_| bad("invalid sample size"))?;
        if size == 0 {
            return Err(bad("sample size must be positive"));
        }
        let mut ranges = Vec::new();
        for part in ranges_txt.split(',') {
            let (lo, hi) = match part.split_once('-') {
                Some((a, b)) => (
                    a.parse().map_err(|_| bad("invalid sample range"))?,
                    b.parse().map_err(|_| bad("invalid sample range"))?,
                ),
                None => {
                    let v: u32 = part.parse().map_err(|_| bad("invalid sample range"))?;
                    (v, v)
                }
            };
            if lo == 0 || hi < lo || hi > size {
                return Err(bad("sample range out of bounds"));
            }
            ranges.push((lo, hi));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[1].0 <= pair[0].1 {
                return Err(bad("overlapping sample ranges"));
            }
        }
        Ok(Sampling {
            ranges,
            size,
            counter: AtomicU64::new(0),
        })
    }

    /// Advances the counter and decides whether this line is kept.
    pub fn accept(&self) -> bool {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let idx = (n % u64::from(self.size)) as u32 + 1;
        self.ranges
            .binary_search_by(|&(lo, hi)| {
                if idx < lo {
                    std::cmp::Ordering::Greater
                } else if idx > hi {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_singletons_and_ranges() {
        let s = Sampling::parse("1-3,8:10").unwrap();
        assert_eq!(s.size(), 10);
        // first cycle: indexes 1..=10
        let kept: Vec<bool> = (0..10).map(|_| s.accept()).collect();
        assert_eq!(
            kept,
            vec![true, true, true, false, false, false, false, true, false, false]
        );
        // the pattern repeats on the next cycle
        assert!(s.accept());
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(Sampling::parse("1-3").is_err());
        assert!(Sampling::parse("0-3:10").is_err());
        assert!(Sampling::parse("5-4:10").is_err());
        assert!(Sampling::parse("1-11:10").is_err());
        assert!(Sampling::parse("1-3,2-5:10").is_err());
        assert!(Sampling::parse("x:10").is_err());
        assert!(Sampling::parse("1:0").is_err());
    }

    #[test]
    fn acceptance_fraction_converges() {
        let s = Sampling::parse("1-250:1000").unwrap();
        let total = 100_000;
        let kept = (0..total).filter(|_| s.accept()).count();
        let fraction = kept as f64 / total as f64;
        assert!((fraction - 0.25).abs() < 0.001, "fraction {}", fraction);
    }
}
