//! Burst transfer engine between external memory and the banked stores.
//!
//! One engine serves all three stores. The routing class of a transfer is
//! fixed at start and selects which store's arbiter the engine bids on.
//!
//! # Architecture
//!
//! ```text
//!                        ┌──────────────────────────────────────┐
//!   start(desc) ───────► │            TransferEngine            │
//!                        │                                      │
//!                        │  Idle ─► CalcBurst ─┬─► ReadAddress  │
//!                        │     ▲               │   ReadData ──┐ │
//!                        │     │               └─► BufferRead │ │
//!                        │     │                   WriteAddress │
//!                        │     │                   WriteData  │ │
//!                        │     │                   WriteResp ─┤ │
//!                        │     │                              ▼ │
//!                        │     └──── Done / Error ◄── CalcBurst │
//!                        └──────┬──────────────────────┬────────┘
//!                               │ bursts               │ beats (granted)
//!                               ▼                      ▼
//!                        ┌──────────────┐      ┌───────────────┐
//!                        │  HostMemory  │      │  BankedStore  │
//!                        └──────────────┘      └───────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tritone_emu::device::dma::{TransferDescriptor, TransferEngine};
//! use tritone_emu::device::banked_store::BufferClass;
//!
//! let mut engine = TransferEngine::new(4);
//! let ticket = engine.start(TransferDescriptor::load(0x1000, 0, 64, BufferClass::Weight, 16))?;
//!
//! // The orchestrator arbitrates engine.port_request() and steps every tick
//! while engine.is_busy() {
//!     engine.step(grant, &mut buffers, &mut host);
//! }
//! assert!(engine.outcome(ticket).is_some());
//! ```

pub mod engine;
pub mod transfer;

pub use engine::{DmaStats, TransferEngine};
pub use transfer::{Transfer, TransferDescriptor, TransferDirection, TransferState};

use thiserror::Error;

use super::banked_store::StoreError;
use super::host_memory::BusResponse;

/// Transfer engine errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    #[error("transfer engine busy")]
    Busy,

    #[error("zero-length transfer")]
    ZeroLength,

    #[error("transfer length {length} is not a multiple of 4 bytes")]
    UnalignedLength { length: u32 },

    #[error("maximum burst length is zero")]
    ZeroBurst,

    #[error("maximum burst length {beats} exceeds {max} beats")]
    BurstTooLong { beats: u32, max: u32 },

    /// External memory answered a burst with an error response.
    #[error("bus error {response:?} at external address 0x{address:X}")]
    Protocol { address: u64, response: BusResponse },

    #[error("internal store access failed: {0}")]
    Store(#[from] StoreError),
}
