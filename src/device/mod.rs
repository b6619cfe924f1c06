//! Device models of the Tritone TPU control core.
//!
//! This module provides:
//! - Architecture constants and register/descriptor field layouts
//! - The command descriptor codec and the bounded command queue
//! - Double-buffered banked storage and its per-bank arbiter
//! - The burst transfer engine and the external memory it talks to
//! - The tile scheduler, the compute array interface and the reduce unit
//!
//! # Architecture Overview
//!
//! ```text
//!            ┌────────────┐   descriptors   ┌──────────────────────┐
//!   host ──► │CommandQueue│ ──────────────► │   (emu) Orchestrator │
//!            └────────────┘                 └───┬──────┬───────┬───┘
//!                                               │      │       │
//!                      ┌────────────────────────┘      │       └──────────┐
//!                      ▼                               ▼                  ▼
//!              ┌──────────────┐               ┌──────────────┐    ┌─────────────┐
//!  HostMemory◄►│TransferEngine│               │TileScheduler │    │ ReduceUnit  │
//!              └──────┬───────┘               └──────┬───────┘    └──────┬──────┘
//!                     │ port requests                │                   │
//!                     ▼                              ▼                   ▼
//!              ┌──────────────────────────────────────────────────────────────┐
//!              │  BankArbiter x3  ─►  BankedStore x3 (weight / act / output)  │
//!              └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use tritone_emu::device::{BankedStore, CommandDescriptor, CommandQueue};
//!
//! let mut queue = CommandQueue::new();
//! queue.push(CommandDescriptor::compute_tile(8, 1, 1)).unwrap();
//! assert_eq!(queue.len(), 1);
//!
//! let store = BankedStore::new(8, 1024);
//! assert_eq!(store.locate(13).unwrap(), (5, 1));
//! ```

pub mod arbiter;
pub mod banked_store;
pub mod compute;
pub mod descriptor;
pub mod dma;
pub mod host_memory;
pub mod queue;
pub mod reduce;
pub mod registers;
pub mod registers_spec;
pub mod scheduler;
pub mod tritone_spec;

pub use arbiter::{AccessKind, ArbiterRequest, ArbitrationResult, BankArbiter, GrantStatus, PortRequest};
pub use banked_store::{BankedStore, BufferClass, StorageBuffers, StoreError};
pub use compute::{ComputeArray, SystolicArray};
pub use descriptor::{CommandDescriptor, Dataflow, DescriptorError, Opcode};
pub use dma::{DmaError, TransferDescriptor, TransferDirection, TransferEngine, TransferState};
pub use host_memory::{Beat, BusResponse, HostMemory, HostMemoryError};
pub use queue::{CommandQueue, QueueFull, Retirement};
pub use reduce::{ReduceOp, ReduceUnit};
pub use registers::Register;
pub use scheduler::{Phase, SchedulerError, TileConfig, TileScheduler};
