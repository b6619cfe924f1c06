//! Control register decoder.
//!
//! Offsets and bit positions live in [`registers_spec`](super::registers_spec);
//! this module turns a raw offset into a [`Register`] and raw write values
//! into typed field views.
//!
//! # Register Window
//!
//! ```text
//! 0x00 CTRL        0x10 CMD0   0x20 DMA_CTRL    0x30 DMA_STATUS
//! 0x04 STATUS      0x14 CMD1   0x24 DMA_SRC     0x34 SWAP
//!                  0x18 CMD2   0x28 DMA_DST
//!                  0x1C CMD3   0x2C DMA_LEN
//! ```

use std::fmt;

use super::banked_store::BufferClass;
use super::dma::TransferDirection;
use super::registers_spec::{self as spec, ctrl, dma_ctrl, swap};

/// A decoded register offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Ctrl,
    Status,
    /// Descriptor word 0..=3.
    Cmd(u8),
    DmaCtrl,
    DmaSrc,
    DmaDst,
    DmaLen,
    DmaStatus,
    Swap,
    Unknown(u32),
}

impl Register {
    pub fn decode(offset: u32) -> Self {
        match offset {
            spec::CTRL => Register::Ctrl,
            spec::STATUS => Register::Status,
            o if (spec::CMD_WORD0..=spec::CMD_WORD3).contains(&o)
                && (o - spec::CMD_WORD0) % spec::CMD_WORD_STRIDE == 0 =>
            {
                Register::Cmd(((o - spec::CMD_WORD0) / spec::CMD_WORD_STRIDE) as u8)
            }
            spec::DMA_CTRL => Register::DmaCtrl,
            spec::DMA_SRC => Register::DmaSrc,
            spec::DMA_DST => Register::DmaDst,
            spec::DMA_LEN => Register::DmaLen,
            spec::DMA_STATUS => Register::DmaStatus,
            spec::SWAP => Register::Swap,
            other => Register::Unknown(other),
        }
    }

    pub fn offset(self) -> u32 {
        match self {
            Register::Ctrl => spec::CTRL,
            Register::Status => spec::STATUS,
            Register::Cmd(i) => spec::CMD_WORD0 + i as u32 * spec::CMD_WORD_STRIDE,
            Register::DmaCtrl => spec::DMA_CTRL,
            Register::DmaSrc => spec::DMA_SRC,
            Register::DmaDst => spec::DMA_DST,
            Register::DmaLen => spec::DMA_LEN,
            Register::DmaStatus => spec::DMA_STATUS,
            Register::Swap => spec::SWAP,
            Register::Unknown(o) => o,
        }
    }

    /// Read-only registers ignore writes.
    pub fn is_read_only(self) -> bool {
        matches!(self, Register::Status | Register::DmaStatus)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Ctrl => write!(f, "CTRL"),
            Register::Status => write!(f, "STATUS"),
            Register::Cmd(i) => write!(f, "CMD{}", i),
            Register::DmaCtrl => write!(f, "DMA_CTRL"),
            Register::DmaSrc => write!(f, "DMA_SRC"),
            Register::DmaDst => write!(f, "DMA_DST"),
            Register::DmaLen => write!(f, "DMA_LEN"),
            Register::DmaStatus => write!(f, "DMA_STATUS"),
            Register::Swap => write!(f, "SWAP"),
            Register::Unknown(o) => write!(f, "UNKNOWN(0x{:02X})", o),
        }
    }
}

#[inline]
fn bit(value: u32, pos: u32) -> bool {
    (value >> pos) & 1 == 1
}

/// Fields of a CTRL write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtrlWrite {
    pub start: bool,
    pub clear: bool,
    pub flush: bool,
    pub irq_enable: bool,
}

impl CtrlWrite {
    pub fn decode(value: u32) -> Self {
        Self {
            start: bit(value, ctrl::START_BIT),
            clear: bit(value, ctrl::CLEAR_BIT),
            flush: bit(value, ctrl::FLUSH_BIT),
            irq_enable: bit(value, ctrl::IRQ_ENABLE_BIT),
        }
    }
}

/// Fields of a DMA_CTRL write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaCtrlWrite {
    pub start: bool,
    pub direction: TransferDirection,
    /// `None` for the reserved routing encoding.
    pub routing: Option<BufferClass>,
}

impl DmaCtrlWrite {
    pub fn decode(value: u32) -> Self {
        Self {
            start: bit(value, dma_ctrl::START_BIT),
            direction: if bit(value, dma_ctrl::DIRECTION_BIT) {
                TransferDirection::InternalToExternal
            } else {
                TransferDirection::ExternalToInternal
            },
            routing: BufferClass::from_bits((value >> dma_ctrl::MODE_SHIFT) & dma_ctrl::MODE_MASK),
        }
    }

    pub fn encode(start: bool, direction: TransferDirection, routing: BufferClass) -> u32 {
        let mut value = routing.to_bits() << dma_ctrl::MODE_SHIFT;
        if start {
            value |= 1 << dma_ctrl::START_BIT;
        }
        if direction == TransferDirection::InternalToExternal {
            value |= 1 << dma_ctrl::DIRECTION_BIT;
        }
        value
    }
}

/// Buffer classes named by a SWAP write, in weight, activation, output order.
pub fn decode_swap(value: u32) -> Vec<BufferClass> {
    [
        (swap::WEIGHT_BIT, BufferClass::Weight),
        (swap::ACTIVATION_BIT, BufferClass::Activation),
        (swap::OUTPUT_BIT, BufferClass::Output),
    ]
    .into_iter()
    .filter(|(pos, _)| bit(value, *pos))
    .map(|(_, class)| class)
    .collect()
}
