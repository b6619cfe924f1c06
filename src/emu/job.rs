//! Descriptor execution plans.
//!
//! A [`Job`] is the orchestrator's view of the descriptor at the queue head:
//! the descriptor, validated once, expanded into an ordered list of
//! [`JobStep`]s, and a cursor into it.
//!
//! ```text
//!   compute-tile, use_transfer:
//!     Transfer(W ext->int) ─► Transfer(A ext->int) ─► Swap(W) ─► Swap(A)
//!       ─► Compute ─► Swap(O) ─► Transfer(O int->ext)
//!
//!   compute-tile, resident data:
//!     Compute ─► Swap(O)
//!
//!   reduce:
//!     [Transfer(A) ─► Swap(A)] ─► Reduce ─► Swap(O) [─► Transfer(O)]
//!
//!   nop:
//!     (empty)
//! ```

use thiserror::Error;

use crate::config::CoreConfig;
use crate::device::banked_store::BufferClass;
use crate::device::descriptor::{CommandDescriptor, Dataflow, Opcode};
use crate::device::dma::{DmaError, TransferDescriptor};
use crate::device::reduce::{ReduceConfig, ReduceError, ReduceOp};
use crate::device::scheduler::{SchedulerError, TileConfig};
use crate::device::tritone_spec::WORD_BYTES;

/// Why a descriptor retired unsuccessfully.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("tile selector is zero (m_sel={m_sel}, n_sel={n_sel})")]
    ZeroSelector { m_sel: u8, n_sel: u8 },

    #[error("K tile {k} outside 1..={max}")]
    KTile { k: u8, max: usize },

    #[error("reduction length is zero")]
    EmptyReduction,

    #[error("output-stationary dataflow is not supported")]
    UnsupportedDataflow,

    #[error("{class} buffer needs {needed} words, holds {capacity}")]
    Capacity { class: BufferClass, needed: usize, capacity: usize },

    #[error("transfer failed: {0}")]
    Transfer(#[from] DmaError),

    #[error("tile scheduler failed: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("reduction failed: {0}")]
    Reduce(#[from] ReduceError),
}

/// One action of a descriptor's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStep {
    /// Run a transfer to completion.
    Transfer(TransferDescriptor),
    /// Flip a buffer class once no component is using it.
    Swap(BufferClass),
    /// Run the tile scheduler to completion.
    Compute(TileConfig),
    /// Run the reduce unit to completion.
    Reduce(ReduceConfig),
}

/// Work a job started and is waiting on, keyed by the component's ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    Transfer(u64),
    Compute(u64),
    Reduce(u64),
}

/// Execution state of the descriptor at the head of the queue.
#[derive(Debug, Clone)]
pub struct Job {
    descriptor: CommandDescriptor,
    plan: Result<Vec<JobStep>, ExecError>,
    cursor: usize,
    pub pending: Option<Pending>,
    /// Ticks since the job started.
    pub age: u64,
}

impl Job {
    pub fn new(descriptor: CommandDescriptor, config: &CoreConfig) -> Self {
        Self {
            descriptor,
            plan: plan(&descriptor, config),
            cursor: 0,
            pending: None,
            age: 0,
        }
    }

    pub fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    /// The validation error, if the descriptor was rejected before running.
    pub fn rejection(&self) -> Option<ExecError> {
        self.plan.as_ref().err().copied()
    }

    /// Next step to perform, `None` when the plan is exhausted.
    pub fn next_step(&self) -> Option<JobStep> {
        self.plan.as_ref().ok()?.get(self.cursor).copied()
    }

    /// Mark the current step performed.
    pub fn advance(&mut self) {
        self.cursor += 1;
    }

    pub fn steps(&self) -> &[JobStep] {
        self.plan.as_deref().unwrap_or(&[])
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

fn check_capacity(class: BufferClass, needed: usize, config: &CoreConfig) -> Result<(), ExecError> {
    let capacity = config.buffer_words();
    if needed > capacity {
        return Err(ExecError::Capacity { class, needed, capacity });
    }
    Ok(())
}

fn bytes(words: usize) -> u32 {
    (words * WORD_BYTES) as u32
}

/// Validate a descriptor and expand it into steps.
pub fn plan(descriptor: &CommandDescriptor, config: &CoreConfig) -> Result<Vec<JobStep>, ExecError> {
    match descriptor.opcode {
        Opcode::Nop => Ok(Vec::new()),
        Opcode::Unknown(bits) => Err(ExecError::UnknownOpcode(bits)),
        Opcode::ComputeTile => plan_compute(descriptor, config),
        Opcode::Reduce => plan_reduce(descriptor, config),
    }
}

fn plan_compute(d: &CommandDescriptor, config: &CoreConfig) -> Result<Vec<JobStep>, ExecError> {
    let size = config.array_size;
    if d.m_sel == 0 || d.n_sel == 0 {
        return Err(ExecError::ZeroSelector { m_sel: d.m_sel, n_sel: d.n_sel });
    }
    if d.k_tile == 0 || d.k_tile as usize > size {
        return Err(ExecError::KTile { k: d.k_tile, max: size });
    }
    if d.dataflow == Dataflow::OutputStationary {
        return Err(ExecError::UnsupportedDataflow);
    }

    let rows = d.m_sel as usize * size;
    let cols = d.n_sel as usize * size;
    let k = d.k_tile as usize;

    let mut tile = TileConfig {
        rows,
        cols,
        k,
        weight_base: d.weight_base as u32,
        activation_base: d.activation_base,
        output_base: d.output_base,
        pack_weights: d.pack_weights,
        wide_accumulator: d.wide_accumulator,
    };
    if d.use_transfer {
        tile.weight_base = 0;
        tile.activation_base = 0;
        tile.output_base = 0;
    }

    let weight_words = cols * tile.weight_row_words();
    let activation_words = rows * k;
    let output_words = rows * cols;
    check_capacity(BufferClass::Weight, tile.weight_base as usize + weight_words, config)?;
    check_capacity(BufferClass::Activation, tile.activation_base as usize + activation_words, config)?;
    check_capacity(BufferClass::Output, tile.output_base as usize + output_words, config)?;

    let burst = config.max_burst_beats;
    let mut steps = Vec::with_capacity(7);
    if d.use_transfer {
        steps.push(JobStep::Transfer(TransferDescriptor::load(
            d.weight_base as u32,
            0,
            bytes(weight_words),
            BufferClass::Weight,
            burst,
        )));
        steps.push(JobStep::Transfer(TransferDescriptor::load(
            d.activation_base,
            0,
            bytes(activation_words),
            BufferClass::Activation,
            burst,
        )));
        steps.push(JobStep::Swap(BufferClass::Weight));
        steps.push(JobStep::Swap(BufferClass::Activation));
    }
    steps.push(JobStep::Compute(tile));
    steps.push(JobStep::Swap(BufferClass::Output));
    if d.use_transfer {
        steps.push(JobStep::Transfer(TransferDescriptor::store(
            0,
            d.output_base,
            bytes(output_words),
            BufferClass::Output,
            burst,
        )));
    }
    Ok(steps)
}

fn plan_reduce(d: &CommandDescriptor, config: &CoreConfig) -> Result<Vec<JobStep>, ExecError> {
    if d.k_tile == 0 {
        return Err(ExecError::EmptyReduction);
    }
    let len = d.k_tile as usize;
    let op = ReduceOp::from_bits(d.n_sel);

    let (source, dest) = if d.use_transfer {
        (0, 0)
    } else {
        (d.activation_base, d.output_base)
    };
    check_capacity(BufferClass::Activation, source as usize + len, config)?;
    check_capacity(BufferClass::Output, dest as usize + 1, config)?;

    let burst = config.max_burst_beats;
    let mut steps = Vec::with_capacity(5);
    if d.use_transfer {
        steps.push(JobStep::Transfer(TransferDescriptor::load(
            d.activation_base,
            0,
            bytes(len),
            BufferClass::Activation,
            burst,
        )));
        steps.push(JobStep::Swap(BufferClass::Activation));
    }
    steps.push(JobStep::Reduce(ReduceConfig { len, source, dest, op }));
    steps.push(JobStep::Swap(BufferClass::Output));
    if d.use_transfer {
        steps.push(JobStep::Transfer(TransferDescriptor::store(
            0,
            d.output_base,
            bytes(1),
            BufferClass::Output,
            burst,
        )));
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dma::TransferDirection;

    fn config() -> CoreConfig {
        CoreConfig::default()
    }

    #[test]
    fn test_nop_has_no_steps() {
        let job = Job::new(CommandDescriptor::nop(), &config());
        assert!(job.rejection().is_none());
        assert!(job.next_step().is_none());
    }

    #[test]
    fn test_validation_errors() {
        let cfg = config();
        let cases = [
            (CommandDescriptor::compute_tile(8, 0, 1), ExecError::ZeroSelector { m_sel: 0, n_sel: 1 }),
            (CommandDescriptor::compute_tile(0, 1, 1), ExecError::KTile { k: 0, max: 8 }),
            (CommandDescriptor::compute_tile(9, 1, 1), ExecError::KTile { k: 9, max: 8 }),
            (
                CommandDescriptor::compute_tile(8, 1, 1).with_dataflow(Dataflow::OutputStationary),
                ExecError::UnsupportedDataflow,
            ),
            (CommandDescriptor::reduce(0, 0), ExecError::EmptyReduction),
        ];
        for (descriptor, expected) in cases {
            assert_eq!(plan(&descriptor, &cfg), Err(expected), "{}", descriptor);
        }

        let mut unknown = CommandDescriptor::nop();
        unknown.opcode = Opcode::Unknown(0x7F);
        assert_eq!(plan(&unknown, &cfg), Err(ExecError::UnknownOpcode(0x7F)));
    }

    #[test]
    fn test_capacity_checked() {
        let cfg = CoreConfig {
            num_banks: 2,
            bank_depth: 16,
            ..config()
        };
        // N = 120 rows of 8 weights against a 32-word buffer
        let err = plan(&CommandDescriptor::compute_tile(8, 15, 15), &cfg).unwrap_err();
        assert!(matches!(err, ExecError::Capacity { class: BufferClass::Weight, .. }));
    }

    #[test]
    fn test_transfer_plan_order() {
        let d = CommandDescriptor::compute_tile(4, 2, 1)
            .with_transfer()
            .with_bases(0x100, 0x1000, 0x2000);
        let steps = plan(&d, &config()).unwrap();
        assert_eq!(steps.len(), 7);

        let JobStep::Transfer(w) = steps[0] else { panic!("expected weight load") };
        assert_eq!(w.routing, BufferClass::Weight);
        assert_eq!(w.src, 0x100);
        assert_eq!(w.length, 8 * 4 * 4);

        let JobStep::Transfer(a) = steps[1] else { panic!("expected activation load") };
        assert_eq!(a.src, 0x1000);
        assert_eq!(a.length, 16 * 4 * 4);

        assert_eq!(steps[2], JobStep::Swap(BufferClass::Weight));
        assert_eq!(steps[3], JobStep::Swap(BufferClass::Activation));

        let JobStep::Compute(tile) = steps[4] else { panic!("expected compute") };
        assert_eq!((tile.rows, tile.cols, tile.k), (16, 8, 4));
        assert_eq!((tile.weight_base, tile.activation_base, tile.output_base), (0, 0, 0));

        assert_eq!(steps[5], JobStep::Swap(BufferClass::Output));
        let JobStep::Transfer(o) = steps[6] else { panic!("expected write-back") };
        assert_eq!(o.direction, TransferDirection::InternalToExternal);
        assert_eq!(o.dst, 0x2000);
        assert_eq!(o.length, 16 * 8 * 4);
    }

    #[test]
    fn test_resident_plan_keeps_bases() {
        let d = CommandDescriptor::compute_tile(8, 1, 1).with_bases(64, 128, 256);
        let steps = plan(&d, &config()).unwrap();
        assert_eq!(steps.len(), 2);
        let JobStep::Compute(tile) = steps[0] else { panic!("expected compute") };
        assert_eq!((tile.weight_base, tile.activation_base, tile.output_base), (64, 128, 256));
    }

    #[test]
    fn test_packed_weight_load_length() {
        let d = CommandDescriptor::compute_tile(8, 1, 1).with_transfer().with_packed_weights();
        let steps = plan(&d, &config()).unwrap();
        let JobStep::Transfer(w) = steps[0] else { panic!("expected weight load") };
        // One packed word per row
        assert_eq!(w.length, 8 * 4);
    }

    #[test]
    fn test_reduce_plan() {
        let d = CommandDescriptor::reduce(10, 1).with_bases(0, 5, 7);
        let steps = plan(&d, &config()).unwrap();
        assert_eq!(
            steps,
            vec![
                JobStep::Reduce(ReduceConfig { len: 10, source: 5, dest: 7, op: ReduceOp::Max }),
                JobStep::Swap(BufferClass::Output),
            ]
        );
    }

    #[test]
    fn test_job_cursor() {
        let mut job = Job::new(CommandDescriptor::compute_tile(8, 1, 1), &config());
        assert!(matches!(job.next_step(), Some(JobStep::Compute(_))));
        job.advance();
        assert_eq!(job.next_step(), Some(JobStep::Swap(BufferClass::Output)));
        job.advance();
        assert_eq!(job.next_step(), None);
        assert_eq!(job.cursor(), 2);
    }
}
