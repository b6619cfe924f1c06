//! Transfer descriptors and per-transfer progress.
//!
//! A [`TransferDescriptor`] describes one bulk move. A [`Transfer`] is the
//! engine's bookkeeping for the descriptor currently in flight: how much is
//! left, where the next burst starts on each side, and the beats of the
//! burst being moved.

use std::fmt;

use super::DmaError;
use crate::device::banked_store::BufferClass;
use crate::device::host_memory::{Beat, BusResponse};
use crate::device::tritone_spec::{MAX_BURST_BEATS, WORD_BYTES};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// External memory into a store's shadow set.
    ExternalToInternal,
    /// A store's active set out to external memory.
    InternalToExternal,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::ExternalToInternal => write!(f, "ext->int"),
            TransferDirection::InternalToExternal => write!(f, "int->ext"),
        }
    }
}

/// One bulk move between external memory and a banked store.
///
/// `src` and `dst` change meaning with the direction: the external side is
/// a byte address, the internal side a word address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub src: u32,
    pub dst: u32,
    /// Bytes to move. Must be a non-zero multiple of 4.
    pub length: u32,
    pub direction: TransferDirection,
    /// Store on the internal side.
    pub routing: BufferClass,
    pub max_burst_beats: u32,
}

impl TransferDescriptor {
    /// Load `length` bytes from external `src` into store word address `dst`.
    pub fn load(src: u32, dst: u32, length: u32, routing: BufferClass, max_burst_beats: u32) -> Self {
        Self {
            src,
            dst,
            length,
            direction: TransferDirection::ExternalToInternal,
            routing,
            max_burst_beats,
        }
    }

    /// Store `length` bytes from store word address `src` to external `dst`.
    pub fn store(src: u32, dst: u32, length: u32, routing: BufferClass, max_burst_beats: u32) -> Self {
        Self {
            src,
            dst,
            length,
            direction: TransferDirection::InternalToExternal,
            routing,
            max_burst_beats,
        }
    }

    pub fn validate(&self) -> Result<(), DmaError> {
        if self.length == 0 {
            return Err(DmaError::ZeroLength);
        }
        if self.length as usize % WORD_BYTES != 0 {
            return Err(DmaError::UnalignedLength { length: self.length });
        }
        if self.max_burst_beats == 0 {
            return Err(DmaError::ZeroBurst);
        }
        if self.max_burst_beats > MAX_BURST_BEATS {
            return Err(DmaError::BurstTooLong {
                beats: self.max_burst_beats,
                max: MAX_BURST_BEATS,
            });
        }
        Ok(())
    }

    pub fn external_address(&self) -> u32 {
        match self.direction {
            TransferDirection::ExternalToInternal => self.src,
            TransferDirection::InternalToExternal => self.dst,
        }
    }

    pub fn internal_address(&self) -> u32 {
        match self.direction {
            TransferDirection::ExternalToInternal => self.dst,
            TransferDirection::InternalToExternal => self.src,
        }
    }

    /// Bytes one full burst moves, saturating at `u32::MAX`.
    pub fn burst_bytes(&self, bytes_per_beat: usize) -> u32 {
        let bytes = self.max_burst_beats as u64 * bytes_per_beat as u64;
        bytes.min(u32::MAX as u64) as u32
    }

    /// Number of bursts this transfer takes at the given beat width.
    pub fn burst_count(&self, bytes_per_beat: usize) -> u32 {
        match self.burst_bytes(bytes_per_beat) {
            0 => 0,
            burst_bytes => self.length.div_ceil(burst_bytes),
        }
    }
}

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    /// Size the next burst.
    CalcBurst,
    /// Issue the read burst to external memory.
    ReadAddress,
    /// Write returned beats into the shadow set, one per granted tick.
    ReadData,
    /// Gather beats from the active set, one per granted tick.
    BufferRead,
    /// Issue the write address phase.
    WriteAddress,
    /// Hand the gathered beats to external memory.
    WriteData,
    /// Check the write response.
    WriteResp,
    /// Completed. Lasts one tick.
    Done,
    /// Failed. Lasts one tick.
    Error,
}

impl TransferState {
    /// Busy covers every state between start and a terminal state.
    pub fn is_busy(self) -> bool {
        !matches!(self, TransferState::Idle | TransferState::Done | TransferState::Error)
    }
}

/// Progress of the transfer in flight.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub descriptor: TransferDescriptor,
    pub ticket: u64,
    /// Bytes not yet covered by a completed burst.
    pub remaining: u32,
    /// External byte address of the next burst.
    pub external_cursor: u64,
    /// Internal word address of the next beat.
    pub internal_cursor: u32,
    /// Size of the burst in flight.
    pub burst_bytes: u32,
    pub burst_beats: u32,
    /// Beats of the current burst already moved on the internal side.
    pub beat_index: u32,
    /// Read path: beats returned by external memory.
    /// Write path: beats gathered from the store.
    pub beats: Vec<Beat>,
    pub write_response: Option<BusResponse>,
}

impl Transfer {
    pub fn new(descriptor: TransferDescriptor, ticket: u64) -> Self {
        Self {
            descriptor,
            ticket,
            remaining: descriptor.length,
            external_cursor: descriptor.external_address() as u64,
            internal_cursor: descriptor.internal_address(),
            burst_bytes: 0,
            burst_beats: 0,
            beat_index: 0,
            beats: Vec::new(),
            write_response: None,
        }
    }

    /// Size the next burst: `min(remaining, max_burst_beats * bytes_per_beat)`.
    pub fn plan_burst(&mut self, bytes_per_beat: usize) {
        let max_bytes = self.descriptor.burst_bytes(bytes_per_beat).max(WORD_BYTES as u32);
        self.burst_bytes = self.remaining.min(max_bytes);
        self.burst_beats = self.burst_bytes.div_ceil(bytes_per_beat.max(1) as u32);
        self.beat_index = 0;
        self.beats.clear();
        self.write_response = None;
    }

    /// Words carried by beat `index` of the current burst.
    pub fn beat_words(&self, index: u32, bytes_per_beat: usize) -> usize {
        let words_per_beat = bytes_per_beat / WORD_BYTES;
        let burst_words = self.burst_bytes as usize / WORD_BYTES;
        let before = index as usize * words_per_beat;
        words_per_beat.min(burst_words.saturating_sub(before))
    }

    /// Account for a finished burst. Returns true when nothing is left.
    pub fn complete_burst(&mut self) -> bool {
        self.remaining -= self.burst_bytes;
        self.external_cursor += self.burst_bytes as u64;
        self.beats.clear();
        self.remaining == 0
    }

    pub fn last_beat(&self) -> bool {
        self.beat_index + 1 >= self.burst_beats
    }
}
