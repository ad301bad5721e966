//! The per-channel analyser chain and its fixed-point driver.
//!
//! Analysers are numbered bits in the channel's `analysers` mask. The
//! driver walks set bits from LSB to MSB and re-starts the walk whenever
//! an analyser re-enables a lower-numbered bit: that is the resync rule
//! that keeps protocol state coherent when, say, a backend switch must
//! re-run the backend inspection phases. The walk is bounded so a buggy
//! analyser cannot starve the task.

use crate::channel::{Channel, Flags};
use crate::stream::transaction::{Cause, Finst, Transaction};

/// Direction a chain operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Request,
    Response,
}

/// Request-channel analyser bits, in pipeline order.
pub mod req {
    pub const FLT_START_FE: u32 = 1 << 0;
    pub const TCP_INSPECT_FE: u32 = 1 << 1;
    pub const WAIT_HTTP: u32 = 1 << 2;
    pub const WAIT_HTTP_BODY: u32 = 1 << 3;
    pub const HTTP_PROCESS_FE: u32 = 1 << 4;
    pub const SWITCHING_RULES: u32 = 1 << 5;
    pub const FLT_START_BE: u32 = 1 << 6;
    pub const TCP_INSPECT_BE: u32 = 1 << 7;
    pub const HTTP_PROCESS_BE: u32 = 1 << 8;
    pub const HTTP_TARPIT: u32 = 1 << 9;
    pub const SERVER_RULES: u32 = 1 << 10;
    pub const HTTP_INNER: u32 = 1 << 11;
    pub const PERSIST_RDP_COOKIE: u32 = 1 << 12;
    pub const STICKING_RULES: u32 = 1 << 13;
    pub const FLT_HTTP_HDRS: u32 = 1 << 14;
    pub const HTTP_XFER_BODY: u32 = 1 << 15;
    pub const WAIT_CLI: u32 = 1 << 16;
    pub const FLT_XFER_DATA: u32 = 1 << 17;
    pub const FLT_END: u32 = 1 << 18;
}

/// Response-channel analyser bits, in pipeline order.
pub mod res {
    pub const FLT_START_FE: u32 = 1 << 0;
    pub const FLT_START_BE: u32 = 1 << 1;
    pub const TCP_INSPECT: u32 = 1 << 2;
    pub const WAIT_HTTP: u32 = 1 << 3;
    pub const STORE_RULES: u32 = 1 << 4;
    pub const HTTP_PROCESS_BE: u32 = 1 << 5;
    pub const FLT_HTTP_HDRS: u32 = 1 << 6;
    pub const HTTP_XFER_BODY: u32 = 1 << 7;
    pub const WAIT_CLI: u32 = 1 << 8;
    pub const FLT_XFER_DATA: u32 = 1 << 9;
    pub const FLT_END: u32 = 1 << 10;
}

/// Terminal outcome from an analyser: the stream must be aborted with
/// these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminal {
    pub cause: Cause,
    pub finst: Finst,
}

/// Non-terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The analyser is finished; clear its bit and move on.
    Done,
    /// Not enough data yet; keep the bit and stop walking this channel.
    Wait,
}

/// What an analyser sees while running.
pub struct AnalyseCtx<'a> {
    pub dir: Dir,
    /// The channel being analysed.
    pub chan: &'a mut Channel,
    /// The opposite-direction channel.
    pub other: &'a mut Channel,
    pub txn: &'a mut Option<Transaction>,
    /// The bit currently being run.
    pub bit: u32,
}

impl<'a> std::fmt::Debug for AnalyseCtx<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyseCtx")
            .field("dir", &self.dir)
            .field("bit", &format_args!("{:#x}", self.bit))
            .finish()
    }
}

/// One stage of the pipeline.
pub trait Analyser: Send {
    fn name(&self) -> &'static str;

    fn analyze(&mut self, cx: &mut AnalyseCtx<'_>) -> Result<Verdict, Terminal>;
}

/// Filters wrap every analyser invocation and may defer it.
pub trait Filter: Send {
    fn name(&self) -> &'static str;

    /// Runs before the analyser. Returning `false` defers the analyser:
    /// its bit stays set and the walk stops, as if it had returned
    /// [`Verdict::Wait`].
    fn pre_analyze(&mut self, _dir: Dir, _bit: u32) -> bool {
        true
    }

    /// Runs after the analyser completed (`Done`).
    fn post_analyze(&mut self, _dir: Dir, _bit: u32) {}
}

/// An ordered set of analysers for one direction.
pub struct Chain {
    slots: Vec<(u32, Box<dyn Analyser>)>,
}

impl Chain {
    pub fn new() -> Chain {
        Chain { slots: Vec::new() }
    }

    /// Registers `an` on `bit`. Bits must be single set bits; later
    /// registrations on the same bit replace the earlier one.
    pub fn register(&mut self, bit: u32, an: Box<dyn Analyser>) {
        debug_assert_eq!(bit.count_ones(), 1);
        if let Some(slot) = self.slots.iter_mut().find(|(b, _)| *b == bit) {
            slot.1 = an;
            return;
        }
        self.slots.push((bit, an));
        self.slots.sort_by_key(|(b, _)| *b);
    }

    fn lookup(&mut self, bit: u32) -> Option<&mut Box<dyn Analyser>> {
        self.slots
            .iter_mut()
            .find(|(b, _)| *b == bit)
            .map(|(_, a)| a)
    }

    /// Union of all registered bits.
    pub fn mask(&self) -> u32 {
        self.slots.iter().fold(0, |m, (b, _)| m | b)
    }
}

impl Default for Chain {
    fn default() -> Chain {
        Chain::new()
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chain({:#x})", self.slots.iter().fold(0, |m, (b, _)| m | b))
    }
}

/// Result of one driver pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// All runnable analysers completed; the mask may still hold bits
    /// with no registered analyser (foreign bits are left untouched).
    Idle,
    /// An analyser (or filter) asked to wait for more data.
    Waiting,
    /// The loop bound was hit; the caller should reschedule.
    Bounded,
}

/// Walks the channel's analyser mask to a fixed point.
///
/// `max_loops` bounds the total number of analyser invocations in this
/// pass (`tune.maxpollevents` at the call site).
pub fn run_chain(
    chain: &mut Chain,
    filters: &mut [Box<dyn Filter>],
    dir: Dir,
    chan: &mut Channel,
    other: &mut Channel,
    txn: &mut Option<Transaction>,
    max_loops: u32,
) -> Result<ChainOutcome, Terminal> {
    let mut budget = max_loops;
    chan.flags.insert(Flags::ANA_INPROGRESS);
    let outcome = run_chain_inner(chain, filters, dir, chan, other, txn, &mut budget);
    chan.flags.remove(Flags::ANA_INPROGRESS);
    outcome
}

fn run_chain_inner(
    chain: &mut Chain,
    filters: &mut [Box<dyn Filter>],
    dir: Dir,
    chan: &mut Channel,
    other: &mut Channel,
    txn: &mut Option<Transaction>,
    budget: &mut u32,
) -> Result<ChainOutcome, Terminal> {
    let known = chain.mask();
    'restart: loop {
        let mut bit = 1u32;
        while bit != 0 {
            if chan.analysers & bit & known != 0 {
                if *budget == 0 {
                    return Ok(ChainOutcome::Bounded);
                }
                *budget -= 1;

                for f in filters.iter_mut() {
                    if !f.pre_analyze(dir, bit) {
                        tracing::trace!(filter = f.name(), bit, "analyser deferred");
                        return Ok(ChainOutcome::Waiting);
                    }
                }

                let before = chan.analysers;
                let verdict = {
                    let an = chain.lookup(bit).expect("bit is in known mask");
                    let mut cx = AnalyseCtx {
                        dir,
                        chan,
                        other,
                        txn,
                        bit,
                    };
                    an.analyze(&mut cx)?
                };
                match verdict {
                    Verdict::Done => {
                        chan.analysers &= !bit;
                        for f in filters.iter_mut() {
                            f.post_analyze(dir, bit);
                        }
                    }
                    Verdict::Wait => return Ok(ChainOutcome::Waiting),
                }
                // the resync rule: a re-enabled earlier analyser runs
                // before any later one continues
                let enabled = chan.analysers & !before;
                if enabled != 0 && lowest_bit(enabled) < bit {
                    continue 'restart;
                }
            }
            bit <<= 1;
        }
        return Ok(ChainOutcome::Idle);
    }
}

#[inline]
fn lowest_bit(mask: u32) -> u32 {
    mask & mask.wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Completing;

    impl Analyser for Completing {
        fn name(&self) -> &'static str {
            "completing"
        }
        fn analyze(&mut self, _cx: &mut AnalyseCtx<'_>) -> Result<Verdict, Terminal> {
            Ok(Verdict::Done)
        }
    }

    struct Waiting;

    impl Analyser for Waiting {
        fn name(&self) -> &'static str {
            "waiting"
        }
        fn analyze(&mut self, _cx: &mut AnalyseCtx<'_>) -> Result<Verdict, Terminal> {
            Ok(Verdict::Wait)
        }
    }

    /// Re-enables an earlier bit once, then completes.
    struct Reenabler {
        fired: bool,
        earlier: u32,
    }

    impl Analyser for Reenabler {
        fn name(&self) -> &'static str {
            "reenabler"
        }
        fn analyze(&mut self, cx: &mut AnalyseCtx<'_>) -> Result<Verdict, Terminal> {
            if !self.fired {
                self.fired = true;
                cx.chan.analysers |= self.earlier;
            }
            Ok(Verdict::Done)
        }
    }

    fn drive(chain: &mut Chain, chan: &mut Channel) -> ChainOutcome {
        let mut other = Channel::new();
        let mut txn = None;
        run_chain(
            chain,
            &mut [],
            Dir::Request,
            chan,
            &mut other,
            &mut txn,
            64,
        )
        .unwrap()
    }

    use crate::channel::Channel;

    #[test]
    fn completing_chain_clears_bits() {
        let mut chain = Chain::new();
        chain.register(req::WAIT_HTTP, Box::new(Completing));
        chain.register(req::HTTP_PROCESS_FE, Box::new(Completing));
        let mut chan = Channel::new();
        chan.analysers = req::WAIT_HTTP | req::HTTP_PROCESS_FE;
        assert_eq!(drive(&mut chain, &mut chan), ChainOutcome::Idle);
        assert_eq!(chan.analysers, 0);
    }

    #[test]
    fn waiting_analyser_keeps_its_bit() {
        let mut chain = Chain::new();
        chain.register(req::WAIT_HTTP, Box::new(Waiting));
        chain.register(req::HTTP_PROCESS_FE, Box::new(Completing));
        let mut chan = Channel::new();
        chan.analysers = req::WAIT_HTTP | req::HTTP_PROCESS_FE;
        assert_eq!(drive(&mut chain, &mut chan), ChainOutcome::Waiting);
        // nothing past the waiter ran
        assert_eq!(chan.analysers, req::WAIT_HTTP | req::HTTP_PROCESS_FE);
    }

    #[test]
    fn reenabled_lower_bit_runs_before_higher_ones() {
        // order of completion is observable through a shared log
        use std::sync::{Arc, Mutex};

        struct Logging {
            log: Arc<Mutex<Vec<&'static str>>>,
            tag: &'static str,
        }
        impl Analyser for Logging {
            fn name(&self) -> &'static str {
                self.tag
            }
            fn analyze(&mut self, _cx: &mut AnalyseCtx<'_>) -> Result<Verdict, Terminal> {
                self.log.lock().unwrap().push(self.tag);
                Ok(Verdict::Done)
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.register(
            req::WAIT_HTTP,
            Box::new(Logging {
                log: log.clone(),
                tag: "early",
            }),
        );
        chain.register(
            req::SWITCHING_RULES,
            Box::new(Reenabler {
                fired: false,
                earlier: req::WAIT_HTTP,
            }),
        );
        chain.register(
            req::STICKING_RULES,
            Box::new(Logging {
                log: log.clone(),
                tag: "late",
            }),
        );
        let mut chan = Channel::new();
        chan.analysers = req::SWITCHING_RULES | req::STICKING_RULES;
        assert_eq!(drive(&mut chain, &mut chan), ChainOutcome::Idle);
        assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn loop_bound_stops_runaway() {
        // an analyser that re-enables itself forever
        struct Selfish;
        impl Analyser for Selfish {
            fn name(&self) -> &'static str {
                "selfish"
            }
            fn analyze(&mut self, cx: &mut AnalyseCtx<'_>) -> Result<Verdict, Terminal> {
                cx.chan.analysers |= cx.bit;
                Ok(Verdict::Done)
            }
        }
        let mut chain = Chain::new();
        chain.register(req::WAIT_HTTP, Box::new(Selfish));
        let mut chan = Channel::new();
        chan.analysers = req::WAIT_HTTP;
        let mut other = Channel::new();
        let mut txn = None;
        let out = run_chain(
            &mut chain,
            &mut [],
            Dir::Request,
            &mut chan,
            &mut other,
            &mut txn,
            8,
        )
        .unwrap();
        assert_eq!(out, ChainOutcome::Bounded);
    }

    #[test]
    fn terminal_error_propagates() {
        struct Failing;
        impl Analyser for Failing {
            fn name(&self) -> &'static str {
                "failing"
            }
            fn analyze(&mut self, _cx: &mut AnalyseCtx<'_>) -> Result<Verdict, Terminal> {
                Err(Terminal {
                    cause: crate::stream::transaction::Cause::PrxCond,
                    finst: crate::stream::transaction::Finst::Request,
                })
            }
        }
        let mut chain = Chain::new();
        chain.register(req::WAIT_HTTP, Box::new(Failing));
        let mut chan = Channel::new();
        chan.analysers = req::WAIT_HTTP;
        let mut other = Channel::new();
        let mut txn = None;
        let err = run_chain(
            &mut chain,
            &mut [],
            Dir::Request,
            &mut chan,
            &mut other,
            &mut txn,
            8,
        )
        .unwrap_err();
        assert_eq!(err.cause, crate::stream::transaction::Cause::PrxCond);
    }

    #[test]
    fn deferring_filter_blocks_analyser() {
        struct Deferring;
        impl Filter for Deferring {
            fn name(&self) -> &'static str {
                "deferring"
            }
            fn pre_analyze(&mut self, _dir: Dir, _bit: u32) -> bool {
                false
            }
        }
        let mut chain = Chain::new();
        chain.register(req::WAIT_HTTP, Box::new(Completing));
        let mut chan = Channel::new();
        chan.analysers = req::WAIT_HTTP;
        let mut other = Channel::new();
        let mut txn = None;
        let mut filters: Vec<Box<dyn Filter>> = vec![Box::new(Deferring)];
        let out = run_chain(
            &mut chain,
            &mut filters,
            Dir::Request,
            &mut chan,
            &mut other,
            &mut txn,
            8,
        )
        .unwrap();
        assert_eq!(out, ChainOutcome::Waiting);
        assert_eq!(chan.analysers, req::WAIT_HTTP);
    }
}
