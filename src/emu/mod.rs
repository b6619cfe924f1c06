//! Control core emulation.
//!
//! This module ties the device models together:
//! - [`Orchestrator`]: the clock, arbitration per store, descriptor sequencing
//!   and the gated buffer swap
//! - [`Job`]: a validated descriptor expanded into transfer / swap / compute
//!   steps
//! - [`RegisterBus`]: the memory-mapped host interface
//!
//! # Architecture
//!
//! Everything advances on one global tick. Within a tick all components see
//! the state as it was at the start of the tick; the only shared mutable
//! resource is the banked storage, and each bank grants at most one access
//! per tick.
//!
//! # Example
//!
//! ```
//! use tritone_emu::config::CoreConfig;
//! use tritone_emu::device::{BufferClass, CommandDescriptor, SystolicArray};
//! use tritone_emu::emu::Orchestrator;
//!
//! let config = CoreConfig { array_size: 2, ..CoreConfig::default() };
//! let mut core = Orchestrator::new(config, Box::new(SystolicArray::new(2))).unwrap();
//!
//! // W = [[1, 0], [0, 1]], A = [[3, 4], [5, 6]]
//! core.buffers_mut().get_mut(BufferClass::Weight).preload_active(0, &[1, 0, 0, 1]).unwrap();
//! core.buffers_mut().get_mut(BufferClass::Activation).preload_active(0, &[3, 4, 5, 6]).unwrap();
//!
//! core.push(CommandDescriptor::compute_tile(2, 1, 1)).unwrap();
//! core.start();
//! core.run_until_idle(1000);
//!
//! let c = core.buffers().output().snapshot_active(0, 4).unwrap();
//! assert_eq!(c, vec![3, 4, 5, 6]);
//! ```

pub mod engine;
pub mod job;
pub mod mmio;

pub use engine::{CoreStatus, Orchestrator, OrchestratorStats, SwapError};
pub use job::{ExecError, Job, JobStep};
pub use mmio::RegisterBus;
