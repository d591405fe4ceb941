//! Zero-copy order book projection
//!
//! A fixed-layout numeric buffer maintained by each market's matching
//! task and read from other threads without locks. Readers accept that
//! a read racing a write can observe a momentarily inconsistent
//! snapshot; the per-block `last_update_ts` identifies staleness, and
//! [`DepthBuffer::read_side`] samples it before and after reading the
//! levels, retrying if it changed.
//!
//! # Layout
//! Four blocks per market (YES-bid, YES-ask, NO-bid, NO-ask), each:
//!
//! ```text
//! [level_count, best_price, total_qty, last_update_ts,
//!  (price, qty) x MAX_LEVELS]
//! ```
//!
//! All values are f64 except `last_update_ts`, a 64-bit integer. The
//! external byte image ([`DepthBuffer::as_bytes`]) is little-endian.
//! A reader treats `qty == 0` as an empty level.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{Outcome, Side};
use crate::orderbook::LevelSummary;

/// Price levels published per side.
pub const MAX_LEVELS: usize = 100;

const META_WORDS: usize = 4;
const BLOCK_WORDS: usize = META_WORDS + MAX_LEVELS * 2;
const BLOCK_COUNT: usize = 4;
const TOTAL_WORDS: usize = BLOCK_COUNT * BLOCK_WORDS;

/// Size of the external little-endian byte image.
pub const BUFFER_BYTES: usize = TOTAL_WORDS * 8;

// Word offsets within a block
const IDX_LEVEL_COUNT: usize = 0;
const IDX_BEST_PRICE: usize = 1;
const IDX_TOTAL_QTY: usize = 2;
const IDX_UPDATE_TS: usize = 3;

/// Point-in-time view of one side, decoded from the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthView {
    /// 0.0 when the side is empty
    pub best_price: f64,
    pub total_qty: f64,
    pub last_update_ts: u64,
    /// (price, qty) from best, empty levels (qty == 0) stripped
    pub levels: Vec<(f64, f64)>,
}

/// The shared projection. Single writer (the market's engine), any
/// number of lock-free readers holding the same `Arc`.
pub struct DepthBuffer {
    words: Box<[AtomicU64]>,
}

impl DepthBuffer {
    pub fn new() -> Self {
        let words: Vec<AtomicU64> = (0..TOTAL_WORDS).map(|_| AtomicU64::new(0)).collect();
        Self {
            words: words.into_boxed_slice(),
        }
    }

    #[inline]
    fn block_base(outcome: Outcome, side: Side) -> usize {
        let block = match (outcome, side) {
            (Outcome::Yes, Side::Buy) => 0,
            (Outcome::Yes, Side::Sell) => 1,
            (Outcome::No, Side::Buy) => 2,
            (Outcome::No, Side::Sell) => 3,
        };
        block * BLOCK_WORDS
    }

    // ============================================================
    // WRITER SIDE (matching engine only)
    // ============================================================

    /// Publish one side's levels. Called after every book mutation.
    ///
    /// Levels beyond [`MAX_LEVELS`] are truncated; stale tail slots are
    /// zeroed so readers see `qty == 0`.
    pub fn write_side(&self, outcome: Outcome, side: Side, levels: &[LevelSummary], ts: u64) {
        let base = Self::block_base(outcome, side);
        let publish = &levels[..levels.len().min(MAX_LEVELS)];

        let mut total_qty = 0u64;
        for (i, level) in publish.iter().enumerate() {
            let price = level.price.as_probability();
            self.words[base + META_WORDS + i * 2].store(price.to_bits(), Ordering::Relaxed);
            self.words[base + META_WORDS + i * 2 + 1]
                .store((level.qty as f64).to_bits(), Ordering::Relaxed);
            total_qty += level.qty;
        }
        // Zero the rest so departed levels read as empty
        for i in publish.len()..MAX_LEVELS {
            self.words[base + META_WORDS + i * 2].store(0, Ordering::Relaxed);
            self.words[base + META_WORDS + i * 2 + 1].store(0, Ordering::Relaxed);
        }

        let best = publish.first().map(|l| l.price.as_probability()).unwrap_or(0.0);
        self.words[base + IDX_LEVEL_COUNT]
            .store((publish.len() as f64).to_bits(), Ordering::Relaxed);
        self.words[base + IDX_BEST_PRICE].store(best.to_bits(), Ordering::Relaxed);
        self.words[base + IDX_TOTAL_QTY]
            .store((total_qty as f64).to_bits(), Ordering::Relaxed);
        // Timestamp last, Release: a reader that sees the new ts also
        // sees the level writes above
        self.words[base + IDX_UPDATE_TS].store(ts, Ordering::Release);
    }

    // ============================================================
    // READER SIDE (lock-free)
    // ============================================================

    /// Read one side, retrying while a write is in flight.
    pub fn read_side(&self, outcome: Outcome, side: Side) -> DepthView {
        let base = Self::block_base(outcome, side);
        loop {
            let ts_before = self.words[base + IDX_UPDATE_TS].load(Ordering::Acquire);

            let level_count =
                f64::from_bits(self.words[base + IDX_LEVEL_COUNT].load(Ordering::Relaxed)) as usize;
            let best_price =
                f64::from_bits(self.words[base + IDX_BEST_PRICE].load(Ordering::Relaxed));
            let total_qty =
                f64::from_bits(self.words[base + IDX_TOTAL_QTY].load(Ordering::Relaxed));

            let mut levels = Vec::with_capacity(level_count.min(MAX_LEVELS));
            for i in 0..level_count.min(MAX_LEVELS) {
                let price =
                    f64::from_bits(self.words[base + META_WORDS + i * 2].load(Ordering::Relaxed));
                let qty = f64::from_bits(
                    self.words[base + META_WORDS + i * 2 + 1].load(Ordering::Relaxed),
                );
                if qty != 0.0 {
                    levels.push((price, qty));
                }
            }

            let ts_after = self.words[base + IDX_UPDATE_TS].load(Ordering::Acquire);
            if ts_before == ts_after {
                return DepthView {
                    best_price,
                    total_qty,
                    last_update_ts: ts_after,
                    levels,
                };
            }
            // A write landed mid-read; take the fresh snapshot instead
        }
    }

    /// Staleness probe without decoding levels.
    pub fn last_update_ts(&self, outcome: Outcome, side: Side) -> u64 {
        let base = Self::block_base(outcome, side);
        self.words[base + IDX_UPDATE_TS].load(Ordering::Acquire)
    }

    /// The external little-endian byte image (`BUFFER_BYTES` long).
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BUFFER_BYTES);
        for word in self.words.iter() {
            out.extend_from_slice(&word.load(Ordering::Acquire).to_le_bytes());
        }
        out
    }
}

impl Default for DepthBuffer {
    fn default() -> Self {
        Self::new()
    }
}
