//! Tritone TPU control core architecture constants.
//!
//! These are the construction-time defaults of the core. Everything except
//! the queue depth can be overridden through [`crate::config::Config`].

// ============================================================================
// Compute Array
// ============================================================================

/// Default compute array dimension (array is `ARRAY_SIZE x ARRAY_SIZE`).
pub const DEFAULT_ARRAY_SIZE: usize = 8;

/// Largest array dimension the scheduler supports.
/// The K tile field of a descriptor is 8 bits wide, so larger arrays could
/// never be filled along K anyway.
pub const MAX_ARRAY_SIZE: usize = 64;

/// Compute phase length for an array of dimension `n`: `2n - 1` steps.
/// Covers the diagonal fill and flush of the wavefront, independent of K.
pub const fn compute_phase_steps(array_size: usize) -> usize {
    2 * array_size - 1
}

// ============================================================================
// Banked Storage
// ============================================================================

/// Default number of interleaved banks per buffer.
pub const DEFAULT_NUM_BANKS: usize = 8;

/// Largest supported bank count.
pub const MAX_NUM_BANKS: usize = 64;

/// Default bank depth in 32-bit words.
pub const DEFAULT_BANK_DEPTH: usize = 1024;

/// Storage word width in bytes.
pub const WORD_BYTES: usize = 4;

/// Number of physical copies of each bank set (double buffering).
pub const BANK_SET_COPIES: usize = 2;

// ============================================================================
// Transfer Engine
// ============================================================================

/// Default maximum burst length in beats.
pub const DEFAULT_MAX_BURST_BEATS: u32 = 16;

/// Longest burst the external bus accepts, in beats (AXI INCR limit).
pub const MAX_BURST_BEATS: u32 = 256;

/// Default beat width in bytes (one word per beat).
pub const DEFAULT_BYTES_PER_BEAT: usize = 4;

/// Widest supported beat in bytes.
pub const MAX_BYTES_PER_BEAT: usize = 64;

/// Words carried inline by a beat before spilling to the heap.
pub const INLINE_BEAT_WORDS: usize = 4;

// ============================================================================
// Command Queue
// ============================================================================

/// Descriptor queue depth. Fixed by the hardware, not configurable.
pub const QUEUE_CAPACITY: usize = 8;

/// Size of a command descriptor in bytes (128 bits).
pub const DESCRIPTOR_BYTES: usize = 16;

// ============================================================================
// Ternary Weight Packing
// ============================================================================

/// Bits per packed ternary weight.
pub const TRIT_BITS: usize = 2;

/// Packed ternary weights per 32-bit word.
pub const TRITS_PER_WORD: usize = 32 / TRIT_BITS;

/// Packed encoding of -1.
pub const TRIT_NEG_ONE: u32 = 0b00;

/// Packed encoding of 0.
pub const TRIT_ZERO: u32 = 0b01;

/// Packed encoding of +1.
pub const TRIT_POS_ONE: u32 = 0b10;

// ============================================================================
// Arbitration
// ============================================================================

/// Highest arbiter priority. Requests at this level bypass round robin.
pub const MAX_PRIORITY: u8 = 3;

/// Default priority of transfer engine bank accesses.
pub const DEFAULT_DMA_PRIORITY: u8 = 1;

/// Default priority of scheduler and reduce unit bank accesses.
pub const DEFAULT_COMPUTE_PRIORITY: u8 = 1;

// ============================================================================
// Accumulators
// ============================================================================

/// Narrow accumulator output range (16-bit signed).
pub const NARROW_ACC_MIN: i64 = i16::MIN as i64;
pub const NARROW_ACC_MAX: i64 = i16::MAX as i64;

/// Wide accumulator output range (32-bit signed).
pub const WIDE_ACC_MIN: i64 = i32::MIN as i64;
pub const WIDE_ACC_MAX: i64 = i32::MAX as i64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_phase_steps() {
        assert_eq!(compute_phase_steps(8), 15);
        assert_eq!(compute_phase_steps(1), 1);
        assert_eq!(compute_phase_steps(64), 127);
    }

    #[test]
    fn test_trit_packing_constants() {
        assert_eq!(TRITS_PER_WORD, 16);
        assert_ne!(TRIT_NEG_ONE, TRIT_ZERO);
        assert_ne!(TRIT_ZERO, TRIT_POS_ONE);
    }
}
