//! Compute array interface and the reference weight-stationary model.
//!
//! The scheduler drives any [`ComputeArray`] through three calls that match
//! its phases: `load_weight_row` while loading, `feed` once per compute step,
//! `drain_row` while draining. Skew is the array's business: the scheduler
//! feeds column `i` the activation for step `s` and the array decides which
//! K index that lands on.
//!
//! ```text
//!   feed(a[0..n])         weights held per lane
//!        │                 ┌─────┬─────┬─────┐
//!   a0 ──┼──► lane 0  ───► │W0,k │W1,k │W2,k │ ─► psum[0][..]
//!   a1 ──┼──► lane 1  ───► │     │     │     │ ─► psum[1][..]
//!   a2 ──┴──► lane 2  ───► │     │     │     │ ─► psum[2][..]
//!                          └─────┴─────┴─────┘
//!   lane i at step s accumulates k = s - i
//! ```

use super::tritone_spec::{TRITS_PER_WORD, TRIT_BITS, TRIT_NEG_ONE, TRIT_POS_ONE, TRIT_ZERO};

/// The numeric engine behind the tile scheduler.
pub trait ComputeArray: std::fmt::Debug {
    /// Array dimension (`size x size` cells).
    fn size(&self) -> usize;

    /// Clear weights and partial sums.
    fn reset(&mut self);

    /// Install weights for output column `row`: `weights[k]` multiplies
    /// activation K index `k`.
    fn load_weight_row(&mut self, row: usize, weights: &[i32]);

    /// Clear partial sums and rewind the compute step counter.
    fn begin_compute(&mut self);

    /// One compute step. `activations[i]` is the value presented to lane `i`.
    fn feed(&mut self, activations: &[i32]);

    /// Partial sums of lane `row`, one per output column.
    fn drain_row(&self, row: usize) -> Vec<i64>;

    /// Multiply-accumulates performed with a non-zero weight.
    fn mac_count(&self) -> u64 {
        0
    }

    /// Multiply-accumulates skipped because the weight was zero.
    fn zero_skip_count(&self) -> u64 {
        0
    }
}

/// Decode one 2-bit ternary weight. The unused code `11` reads as zero.
pub fn decode_trit(bits: u32) -> i32 {
    match bits & 0b11 {
        TRIT_NEG_ONE => -1,
        TRIT_ZERO => 0,
        TRIT_POS_ONE => 1,
        _ => 0,
    }
}

/// Encode a weight as a 2-bit trit. Values are clamped to -1..=1.
pub fn encode_trit(value: i32) -> u32 {
    match value.signum() {
        -1 => TRIT_NEG_ONE,
        0 => TRIT_ZERO,
        _ => TRIT_POS_ONE,
    }
}

/// Pack ternary weights, 16 per word, weight `k` in bits `2k+1:2k`.
/// Unused slots of the last word encode zero.
pub fn pack_trits(weights: &[i32]) -> Vec<i32> {
    weights
        .chunks(TRITS_PER_WORD)
        .map(|chunk| {
            let mut word = 0u32;
            for slot in 0..TRITS_PER_WORD {
                let code = chunk.get(slot).map(|w| encode_trit(*w)).unwrap_or(TRIT_ZERO);
                word |= code << (slot * TRIT_BITS);
            }
            word as i32
        })
        .collect()
}

/// Unpack the first `count` ternary weights from packed words.
pub fn unpack_trits(words: &[i32], count: usize) -> Vec<i32> {
    (0..count)
        .map(|k| {
            let word = words.get(k / TRITS_PER_WORD).copied().unwrap_or(0) as u32;
            decode_trit(word >> ((k % TRITS_PER_WORD) * TRIT_BITS))
        })
        .collect()
}

/// Words per weight row in packed mode.
pub fn packed_row_words(k: usize) -> usize {
    k.div_ceil(TRITS_PER_WORD)
}

/// Reference weight-stationary systolic array.
///
/// Functionally exact: after `2 * size - 1` feeds following
/// `begin_compute`, `psum[i][n] = sum_k A_i[k] * W[n][k]` for every lane `i`
/// that was fed its K values on the diagonal.
#[derive(Debug, Clone)]
pub struct SystolicArray {
    size: usize,
    /// `weights[n][k]`
    weights: Vec<Vec<i32>>,
    /// `psum[lane][n]`
    psum: Vec<Vec<i64>>,
    step: usize,
    macs: u64,
    zero_skips: u64,
}

impl SystolicArray {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            weights: vec![vec![0; size]; size],
            psum: vec![vec![0; size]; size],
            step: 0,
            macs: 0,
            zero_skips: 0,
        }
    }

    /// Current compute step.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Weight held at output column `n`, K index `k`.
    pub fn weight(&self, n: usize, k: usize) -> i32 {
        self.weights[n][k]
    }
}

impl ComputeArray for SystolicArray {
    fn size(&self) -> usize {
        self.size
    }

    fn reset(&mut self) {
        for row in self.weights.iter_mut() {
            row.fill(0);
        }
        for row in self.psum.iter_mut() {
            row.fill(0);
        }
        self.step = 0;
    }

    fn load_weight_row(&mut self, row: usize, weights: &[i32]) {
        if row >= self.size {
            log::warn!("Weight row {} outside {}x{} array", row, self.size, self.size);
            return;
        }
        let dst = &mut self.weights[row];
        dst.fill(0);
        for (k, w) in weights.iter().take(self.size).enumerate() {
            dst[k] = *w;
        }
    }

    fn begin_compute(&mut self) {
        for row in self.psum.iter_mut() {
            row.fill(0);
        }
        self.step = 0;
    }

    fn feed(&mut self, activations: &[i32]) {
        let s = self.step;
        for (lane, &a) in activations.iter().enumerate().take(self.size) {
            let Some(k) = s.checked_sub(lane).filter(|k| *k < self.size) else {
                continue;
            };
            for n in 0..self.size {
                let w = self.weights[n][k];
                if w == 0 {
                    self.zero_skips += 1;
                    continue;
                }
                self.psum[lane][n] += a as i64 * w as i64;
                self.macs += 1;
            }
        }
        self.step += 1;
    }

    fn drain_row(&self, row: usize) -> Vec<i64> {
        self.psum.get(row).cloned().unwrap_or_else(|| vec![0; self.size])
    }

    fn mac_count(&self) -> u64 {
        self.macs
    }

    fn zero_skip_count(&self) -> u64 {
        self.zero_skips
    }
}
