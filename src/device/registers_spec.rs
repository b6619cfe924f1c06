//! Tritone control core register and descriptor field specification.
//!
//! Centralizes register offsets and bit positions so the register bus, the
//! descriptor codec and the status encoders never use magic numbers.

// ============================================================================
// Core Control / Status
// ============================================================================

/// Control register offset.
pub const CTRL: u32 = 0x00;

/// Status register offset (read-only).
pub const STATUS: u32 = 0x04;

pub mod ctrl {
    //! CTRL bit fields.

    /// Begin executing the queue head.
    pub const START_BIT: u32 = 0;

    /// Clear sticky error, done, push/swap rejection and acknowledge the interrupt.
    pub const CLEAR_BIT: u32 = 1;

    /// Discard every pending descriptor.
    pub const FLUSH_BIT: u32 = 2;

    /// Global interrupt line enable.
    pub const IRQ_ENABLE_BIT: u32 = 8;
}

pub mod status {
    //! STATUS bit fields.

    pub const BUSY_BIT: u32 = 1;
    pub const DONE_BIT: u32 = 8;
    pub const ERROR_BIT: u32 = 9;
    pub const IRQ_PENDING_BIT: u32 = 10;

    /// Sticky: a descriptor push was rejected because the queue was full.
    pub const PUSH_REJECTED_BIT: u32 = 11;

    /// Live: queue is at capacity.
    pub const QUEUE_FULL_BIT: u32 = 12;

    /// Sticky: a SWAP write was refused by the gating check.
    pub const SWAP_REJECTED_BIT: u32 = 13;

    /// Auxiliary count field (queue occupancy), bits 31:16.
    pub const COUNT_SHIFT: u32 = 16;
    pub const COUNT_MASK: u32 = 0xFFFF;
}

// ============================================================================
// Descriptor Push Window
// ============================================================================

/// First descriptor word (bits 31:0).
pub const CMD_WORD0: u32 = 0x10;

/// Descriptor words are 4 bytes apart.
pub const CMD_WORD_STRIDE: u32 = 0x04;

/// Number of descriptor words.
pub const CMD_WORDS: u32 = 4;

/// Last descriptor word (bits 127:96). Writing it commits the push.
pub const CMD_WORD3: u32 = CMD_WORD0 + 3 * CMD_WORD_STRIDE;

// ============================================================================
// Transfer Engine
// ============================================================================

pub const DMA_CTRL: u32 = 0x20;
pub const DMA_SRC: u32 = 0x24;
pub const DMA_DST: u32 = 0x28;
pub const DMA_LEN: u32 = 0x2C;
pub const DMA_STATUS: u32 = 0x30;

pub mod dma_ctrl {
    //! DMA_CTRL bit fields.

    pub const START_BIT: u32 = 0;

    /// 0 = external to internal, 1 = internal to external.
    pub const DIRECTION_BIT: u32 = 1;

    /// Routing mode, bits 3:2 (0 weight, 1 activation, 2 output).
    pub const MODE_SHIFT: u32 = 2;
    pub const MODE_MASK: u32 = 0b11;
}

pub mod dma_status {
    //! DMA_STATUS bit fields.

    pub const BUSY_BIT: u32 = 1;
    pub const DONE_BIT: u32 = 8;
    pub const ERROR_BIT: u32 = 9;

    /// Bytes transferred, bits 31:16 (saturates at 0xFFFF).
    pub const BYTES_SHIFT: u32 = 16;
    pub const BYTES_MASK: u32 = 0xFFFF;
}

// ============================================================================
// Buffer Swap
// ============================================================================

/// Swap request register. One bit per buffer class.
pub const SWAP: u32 = 0x34;

pub mod swap {
    //! SWAP bit fields.

    pub const WEIGHT_BIT: u32 = 0;
    pub const ACTIVATION_BIT: u32 = 1;
    pub const OUTPUT_BIT: u32 = 2;
}

/// End of the register window (exclusive).
pub const REGISTER_WINDOW_END: u32 = 0x38;

// ============================================================================
// Command Descriptor Fields (bit positions within the 128-bit word)
// ============================================================================

pub mod descriptor {
    //! Bit layout of the 128-bit command descriptor.

    pub const OPCODE_SHIFT: u32 = 120;
    pub const OPCODE_MASK: u128 = 0xFF;

    pub const CHAIN_BIT: u32 = 119;
    pub const IRQ_BIT: u32 = 118;
    pub const USE_TRANSFER_BIT: u32 = 117;
    pub const PACK_WEIGHTS_BIT: u32 = 116;
    pub const WIDE_ACC_BIT: u32 = 115;

    /// 1 = weight-stationary, 0 = output-stationary.
    pub const DATAFLOW_BIT: u32 = 114;

    pub const TILE_ID_SHIFT: u32 = 96;
    pub const TILE_ID_MASK: u128 = 0x3_FFFF;

    pub const OUTPUT_BASE_SHIFT: u32 = 64;
    pub const ACTIVATION_BASE_SHIFT: u32 = 32;
    pub const ADDR32_MASK: u128 = 0xFFFF_FFFF;

    pub const WEIGHT_BASE_SHIFT: u32 = 16;
    pub const WEIGHT_BASE_MASK: u128 = 0xFFFF;

    pub const K_TILE_SHIFT: u32 = 8;
    pub const K_TILE_MASK: u128 = 0xFF;

    pub const M_SEL_SHIFT: u32 = 4;
    pub const N_SEL_SHIFT: u32 = 0;
    pub const SEL_MASK: u128 = 0xF;

    pub const OPCODE_NOP: u8 = 0x00;
    pub const OPCODE_COMPUTE_TILE: u8 = 0x01;
    pub const OPCODE_REDUCE: u8 = 0x02;
}
