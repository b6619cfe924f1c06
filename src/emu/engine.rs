//! Main emulation engine.
//!
//! The [`Orchestrator`] owns every component of the core and advances them
//! in lockstep, one tick at a time:
//!
//! 1. Collect port requests from the transfer engine, the tile scheduler and
//!    the reduce unit (state as of the start of the tick).
//! 2. Arbitrate each store's requests on that store's [`BankArbiter`].
//! 3. Step every component with its grant.
//! 4. Advance the descriptor job at the head of the queue.
//! 5. Queue housekeeping.
//!
//! It is also the only place a buffer swap can be requested from outside the
//! crate, and it refuses the swap while anything could still be reading or
//! writing the stores.
//!
//! # Usage
//!
//! ```
//! use tritone_emu::config::CoreConfig;
//! use tritone_emu::device::{CommandDescriptor, SystolicArray};
//! use tritone_emu::emu::Orchestrator;
//!
//! let config = CoreConfig::default();
//! let mut core = Orchestrator::new(config, Box::new(SystolicArray::new(config.array_size))).unwrap();
//! core.push(CommandDescriptor::nop().with_irq()).unwrap();
//! core.start();
//! core.run_until_idle(100);
//! assert!(core.status().done);
//! assert!(core.status().irq_pending);
//! ```

use thiserror::Error;

use super::job::{ExecError, Job, JobStep, Pending};
use crate::config::{ConfigError, CoreConfig};
use crate::device::arbiter::{
    requestor, ArbiterRequest, ArbitrationResult, BankArbiter, BankSet, GrantStatus, PortRequest,
};
use crate::device::banked_store::{BufferClass, StorageBuffers};
use crate::device::compute::ComputeArray;
use crate::device::descriptor::CommandDescriptor;
use crate::device::dma::{DmaError, TransferDescriptor, TransferEngine, TransferState};
use crate::device::host_memory::HostMemory;
use crate::device::queue::{CommandQueue, QueueFull};
use crate::device::reduce::ReduceUnit;
use crate::device::registers_spec::status;
use crate::device::scheduler::TileScheduler;

/// Consecutive stalled ticks after which a component's wait is logged.
const STALL_WARN_TICKS: u32 = 64;

/// A buffer swap was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    #[error("transfer engine is busy")]
    TransferBusy,

    #[error("tile scheduler is busy")]
    SchedulerBusy,

    #[error("reduce unit is busy")]
    ReduceBusy,

    /// Host swaps are refused while a descriptor owns the pipeline.
    #[error("a descriptor is executing")]
    JobActive,
}

/// Snapshot of the core's status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreStatus {
    pub busy: bool,
    /// The controller returned to idle. Cleared by start and clear.
    pub done: bool,
    /// Sticky execution error.
    pub error: bool,
    pub irq_pending: bool,
    /// Sticky: a push was rejected.
    pub push_rejected: bool,
    pub queue_full: bool,
    /// Sticky: a host swap was refused.
    pub swap_rejected: bool,
    pub queue_len: usize,
}

impl CoreStatus {
    /// STATUS register encoding.
    pub fn to_word(&self) -> u32 {
        let flags = [
            (self.busy, status::BUSY_BIT),
            (self.done, status::DONE_BIT),
            (self.error, status::ERROR_BIT),
            (self.irq_pending, status::IRQ_PENDING_BIT),
            (self.push_rejected, status::PUSH_REJECTED_BIT),
            (self.queue_full, status::QUEUE_FULL_BIT),
            (self.swap_rejected, status::SWAP_REJECTED_BIT),
        ];
        let bits = flags
            .iter()
            .filter(|(set, _)| *set)
            .fold(0u32, |acc, (_, bit)| acc | (1 << bit));
        bits | ((self.queue_len as u32 & status::COUNT_MASK) << status::COUNT_SHIFT)
    }
}

/// Orchestrator statistics.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorStats {
    pub ticks: u64,
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Jobs dropped by a flush before retiring.
    pub jobs_dropped: u64,
    pub swaps: u64,
    pub swaps_rejected: u64,
    pub pushes_rejected: u64,
}

/// Result of driving a job for one tick.
enum JobPoll {
    Waiting,
    Finished,
}

/// The control core: queue, job sequencing, storage and the components that
/// share it.
pub struct Orchestrator {
    config: CoreConfig,
    queue: CommandQueue,
    buffers: StorageBuffers,
    /// One arbiter per buffer class.
    arbiters: [BankArbiter; 3],
    dma: TransferEngine,
    scheduler: TileScheduler,
    reduce: ReduceUnit,
    host: HostMemory,
    job: Option<Job>,
    done: bool,
    irq_enable: bool,
    push_rejected: bool,
    swap_rejected: bool,
    last_error: Option<ExecError>,
    /// Consecutive stalled ticks of DMA, scheduler, reduce.
    stall_streak: [u32; 3],
    /// Grants of DMA, scheduler, reduce in the last tick.
    last_grants: [GrantStatus; 3],
    stats: OrchestratorStats,
}

impl Orchestrator {
    /// Build a core around `array`. Fails if `config` does not validate.
    pub fn new(mut config: CoreConfig, array: Box<dyn ComputeArray>) -> Result<Self, ConfigError> {
        if array.size() != config.array_size {
            log::warn!(
                "Compute array is {}x{} but array_size is {}; tiling follows the array",
                array.size(),
                array.size(),
                config.array_size
            );
            config.array_size = array.size();
        }
        config.validate()?;
        let arbiter = || BankArbiter::new(config.num_banks, requestor::COUNT);
        log::info!(
            "Core: {}x{} array, {} banks x {} words per buffer, {}-byte beats, bursts of {}",
            config.array_size,
            config.array_size,
            config.num_banks,
            config.bank_depth,
            config.bytes_per_beat,
            config.max_burst_beats
        );
        Ok(Self {
            config,
            queue: CommandQueue::new(),
            buffers: StorageBuffers::new(config.num_banks, config.bank_depth),
            arbiters: [arbiter(), arbiter(), arbiter()],
            dma: TransferEngine::new(config.bytes_per_beat),
            scheduler: TileScheduler::new(array),
            reduce: ReduceUnit::new(),
            host: HostMemory::new(),
            job: None,
            done: false,
            irq_enable: false,
            push_rejected: false,
            swap_rejected: false,
            last_error: None,
            stall_streak: [0; 3],
            last_grants: [GrantStatus::Idle; 3],
            stats: OrchestratorStats::default(),
        })
    }

    // ------------------------------------------------------------------
    // Host commands
    // ------------------------------------------------------------------

    /// Enqueue a descriptor. A rejected push latches `push_rejected`.
    pub fn push(&mut self, descriptor: CommandDescriptor) -> Result<(), QueueFull> {
        self.queue.push(descriptor).inspect_err(|_| {
            self.push_rejected = true;
            self.stats.pushes_rejected += 1;
        })
    }

    /// Begin executing the queue head. No effect while a job runs or when
    /// the queue is empty.
    pub fn start(&mut self) {
        self.done = false;
        if self.job.is_some() {
            log::debug!("Start ignored, a descriptor is already executing");
            return;
        }
        if !self.begin_job() {
            log::debug!("Start with an empty queue");
        }
    }

    /// Discard queued descriptors and the current job's claim on the
    /// pipeline. Work already handed to a component runs to completion
    /// without being attributed to any descriptor.
    pub fn flush(&mut self) {
        if let Some(job) = self.job.take() {
            log::info!("Flush dropped executing {}", job.descriptor());
            self.stats.jobs_dropped += 1;
        }
        self.queue.flush();
    }

    /// Clear sticky error, done and rejection flags and acknowledge the
    /// interrupt.
    pub fn clear(&mut self) {
        self.queue.clear_error();
        self.queue.acknowledge_interrupt();
        self.done = false;
        self.push_rejected = false;
        self.swap_rejected = false;
        self.last_error = None;
    }

    pub fn acknowledge_interrupt(&mut self) {
        self.queue.acknowledge_interrupt();
    }

    pub fn set_irq_enable(&mut self, enable: bool) {
        self.irq_enable = enable;
    }

    pub fn irq_enable(&self) -> bool {
        self.irq_enable
    }

    /// Level of the interrupt line.
    pub fn interrupt_line(&self) -> bool {
        self.irq_enable && self.queue.interrupt_pending()
    }

    /// Host-issued transfer, outside of any descriptor.
    pub fn start_transfer(&mut self, descriptor: TransferDescriptor) -> Result<u64, DmaError> {
        self.dma.start(descriptor)
    }

    /// Swap a buffer class on behalf of the host.
    ///
    /// Refused while the transfer engine, scheduler or reduce unit is busy,
    /// or while a descriptor is executing. A refusal latches `swap_rejected`.
    pub fn swap_buffers(&mut self, class: BufferClass) -> Result<(), SwapError> {
        let result = if self.job.is_some() {
            Err(SwapError::JobActive)
        } else {
            self.gated_swap(class)
        };
        if let Err(err) = result {
            log::warn!("Swap of {} buffer refused: {}", class, err);
            self.swap_rejected = true;
            self.stats.swaps_rejected += 1;
        }
        result
    }

    fn gated_swap(&mut self, class: BufferClass) -> Result<(), SwapError> {
        if self.dma.is_busy() {
            return Err(SwapError::TransferBusy);
        }
        if self.scheduler.is_busy() {
            return Err(SwapError::SchedulerBusy);
        }
        if self.reduce.is_busy() {
            return Err(SwapError::ReduceBusy);
        }
        self.buffers.swap(class);
        self.stats.swaps += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------

    /// Advance the whole core by one tick.
    pub fn tick(&mut self) {
        let requests = [
            self.dma.port_request(),
            self.scheduler.port_request(),
            self.reduce.port_request(),
        ];
        let grants = self.arbitrate(requests);
        self.track_stalls(&grants);
        self.last_grants = grants;

        self.dma.step(grants[0], &mut self.buffers, &mut self.host);
        self.scheduler.step(grants[1], &mut self.buffers);
        self.reduce.step(grants[2], &mut self.buffers);

        self.advance_job();
        self.queue.end_tick();
        self.stats.ticks += 1;
    }

    /// Tick until nothing is executing, or `max_ticks` elapse.
    /// Returns the number of ticks run.
    pub fn run_until_idle(&mut self, max_ticks: u64) -> u64 {
        let mut ticks = 0;
        while !self.is_quiescent() && ticks < max_ticks {
            self.tick();
            ticks += 1;
        }
        if !self.is_quiescent() {
            log::warn!("Core still active after {} ticks", ticks);
        }
        ticks
    }

    /// No job and every component back in its idle state.
    pub fn is_quiescent(&self) -> bool {
        self.job.is_none()
            && self.dma.state() == TransferState::Idle
            && self.scheduler.is_idle()
            && self.reduce.is_idle()
    }

    fn arbitrate(&mut self, requests: [Option<PortRequest>; 3]) -> [GrantStatus; 3] {
        let mut per_store: [Vec<ArbiterRequest>; 3] = Default::default();
        for req in requests.iter().flatten() {
            let priority = if req.requestor == requestor::DMA {
                self.config.dma_priority
            } else {
                self.config.compute_priority
            };
            let store = self.buffers.get(req.class);
            let banks: BankSet = req.addresses.iter().map(|a| store.bank_of(*a)).collect();
            per_store[req.class.index()].push(ArbiterRequest::spanning(req.requestor, &banks, req.kind, priority));
        }

        let results: Vec<ArbitrationResult> = self
            .arbiters
            .iter_mut()
            .zip(per_store.iter())
            .map(|(arbiter, reqs)| arbiter.arbitrate(reqs))
            .collect();

        requests.map(|req| match req {
            Some(r) => results[r.class.index()].status(r.requestor),
            None => GrantStatus::Idle,
        })
    }

    /// Arbitration outcome of the transfer engine, tile scheduler and
    /// reduce unit in the last tick.
    pub fn last_grants(&self) -> [GrantStatus; 3] {
        self.last_grants
    }

    fn track_stalls(&mut self, grants: &[GrantStatus; 3]) {
        const NAMES: [&str; 3] = ["transfer engine", "tile scheduler", "reduce unit"];
        for (i, grant) in grants.iter().enumerate() {
            if *grant == GrantStatus::Stalled {
                self.stall_streak[i] += 1;
                if self.stall_streak[i] == STALL_WARN_TICKS {
                    log::warn!("{} stalled for {} consecutive ticks", NAMES[i], STALL_WARN_TICKS);
                }
            } else {
                self.stall_streak[i] = 0;
            }
        }
    }

    // ------------------------------------------------------------------
    // Descriptor execution
    // ------------------------------------------------------------------

    /// Take the queue head as the current job. Returns false if the queue
    /// is empty.
    fn begin_job(&mut self) -> bool {
        let Some(descriptor) = self.queue.current().copied() else {
            return false;
        };
        log::info!("Executing {}", descriptor);
        self.job = Some(Job::new(descriptor, &self.config));
        self.stats.jobs_started += 1;
        true
    }

    fn advance_job(&mut self) {
        while let Some(mut job) = self.job.take() {
            job.age += 1;
            let result = match self.drive(&mut job) {
                Ok(JobPoll::Waiting) => {
                    self.job = Some(job);
                    return;
                }
                Ok(JobPoll::Finished) => Ok(()),
                Err(err) => Err(err),
            };
            if !self.retire(job, result) {
                return;
            }
        }
    }

    /// Perform as many steps of `job` as possible this tick.
    fn drive(&mut self, job: &mut Job) -> Result<JobPoll, ExecError> {
        if let Some(err) = job.rejection() {
            return Err(err);
        }
        loop {
            if let Some(pending) = job.pending {
                let finished = match pending {
                    Pending::Transfer(ticket) => self.dma.outcome(ticket).transpose()?.is_some(),
                    Pending::Compute(ticket) => self.scheduler.outcome(ticket).transpose()?.is_some(),
                    Pending::Reduce(ticket) => self.reduce.outcome(ticket).transpose()?.is_some(),
                };
                if !finished {
                    return Ok(JobPoll::Waiting);
                }
                job.pending = None;
            }

            let Some(step) = job.next_step() else {
                return Ok(JobPoll::Finished);
            };
            match step {
                JobStep::Transfer(descriptor) => {
                    if self.dma.is_busy() {
                        return Ok(JobPoll::Waiting);
                    }
                    job.pending = Some(Pending::Transfer(self.dma.start(descriptor)?));
                }
                JobStep::Swap(class) => {
                    if self.gated_swap(class).is_err() {
                        return Ok(JobPoll::Waiting);
                    }
                }
                JobStep::Compute(tile) => {
                    if !self.scheduler.is_idle() {
                        return Ok(JobPoll::Waiting);
                    }
                    job.pending = Some(Pending::Compute(self.scheduler.start(tile)?));
                }
                JobStep::Reduce(config) => {
                    if !self.reduce.is_idle() {
                        return Ok(JobPoll::Waiting);
                    }
                    job.pending = Some(Pending::Reduce(self.reduce.start(config)?));
                }
            }
            log::debug!("Job step {}/{}: {:?}", job.cursor() + 1, job.steps().len(), step);
            job.advance();
        }
    }

    /// Retire a finished job. Returns true if a chained job was started.
    fn retire(&mut self, job: Job, result: Result<(), ExecError>) -> bool {
        match &result {
            Ok(()) => self.stats.jobs_succeeded += 1,
            Err(err) => {
                log::error!("{} failed after {} ticks: {}", job.descriptor(), job.age, err);
                self.last_error = Some(*err);
                self.stats.jobs_failed += 1;
            }
        }

        let chained = self
            .queue
            .retire(result.is_ok())
            .is_some_and(|retirement| retirement.chain);
        if chained && self.begin_job() {
            return true;
        }
        self.done = true;
        false
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn status(&self) -> CoreStatus {
        CoreStatus {
            busy: self.job.is_some() || self.scheduler.is_busy() || self.reduce.is_busy(),
            done: self.done,
            error: self.queue.error(),
            irq_pending: self.queue.interrupt_pending(),
            push_rejected: self.push_rejected,
            queue_full: self.queue.is_full(),
            swap_rejected: self.swap_rejected,
            queue_len: self.queue.len(),
        }
    }

    /// Error of the most recent failed descriptor, until cleared.
    pub fn last_error(&self) -> Option<ExecError> {
        self.last_error
    }

    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn stats(&self) -> &OrchestratorStats {
        &self.stats
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn dma(&self) -> &TransferEngine {
        &self.dma
    }

    pub fn scheduler(&self) -> &TileScheduler {
        &self.scheduler
    }

    pub fn reduce_unit(&self) -> &ReduceUnit {
        &self.reduce
    }

    pub fn arbiter(&self, class: BufferClass) -> &BankArbiter {
        &self.arbiters[class.index()]
    }

    pub fn host_memory(&self) -> &HostMemory {
        &self.host
    }

    pub fn host_memory_mut(&mut self) -> &mut HostMemory {
        &mut self.host
    }

    pub fn buffers(&self) -> &StorageBuffers {
        &self.buffers
    }

    /// Direct store access for host initialization. Bypasses arbitration.
    pub fn buffers_mut(&mut self) -> &mut StorageBuffers {
        &mut self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::compute::{pack_trits, SystolicArray};
    use crate::device::descriptor::Opcode;
    use crate::device::tritone_spec::QUEUE_CAPACITY;

    fn core(size: usize) -> Orchestrator {
        let config = CoreConfig {
            array_size: size,
            ..CoreConfig::default()
        };
        Orchestrator::new(config, Box::new(SystolicArray::new(size))).unwrap()
    }

    /// Deterministic small values in -3..=3.
    fn pattern(len: usize, seed: i32) -> Vec<i32> {
        (0..len as i32).map(|i| (i * 7 + seed * 3) % 7 - 3).collect()
    }

    /// `C[M][N] = A[M][K] · W[N][K]^T`
    fn naive(a: &[i32], w: &[i32], m: usize, n: usize, k: usize) -> Vec<i32> {
        let mut c = vec![0; m * n];
        for row in 0..m {
            for col in 0..n {
                c[row * n + col] = (0..k).map(|x| a[row * k + x] * w[col * k + x]).sum();
            }
        }
        c
    }

    #[test]
    fn test_gemm_through_transfers() {
        let mut core = core(4);
        let (m, n, k) = (8, 4, 3);
        let a = pattern(m * k, 1);
        let w = pattern(n * k, 2);
        core.host_memory_mut().write_words(0x100, &w);
        core.host_memory_mut().write_words(0x1000, &a);

        let d = CommandDescriptor::compute_tile(k as u8, 2, 1)
            .with_transfer()
            .with_bases(0x100, 0x1000, 0x2000);
        core.push(d).unwrap();
        core.start();
        core.run_until_idle(10_000);

        let status = core.status();
        assert!(status.done);
        assert!(!status.error);
        assert_eq!(status.queue_len, 0);
        assert_eq!(core.host_memory().read_words(0x2000, m * n), naive(&a, &w, m, n, k));
        // Output swapped once, weight and activation once each.
        assert_eq!(core.buffers().output().generation(), 1);
        assert_eq!(core.stats().swaps, 3);
    }

    #[test]
    fn test_gemm_resident_data() {
        let mut core = core(4);
        let (m, n, k) = (4, 8, 4);
        let a = pattern(m * k, 3);
        let w = pattern(n * k, 4);
        core.buffers_mut().get_mut(BufferClass::Weight).preload_active(16, &w).unwrap();
        core.buffers_mut().get_mut(BufferClass::Activation).preload_active(0, &a).unwrap();

        core.push(CommandDescriptor::compute_tile(4, 1, 2).with_bases(16, 0, 100)).unwrap();
        core.start();
        core.run_until_idle(10_000);

        assert!(core.status().done);
        let c = core.buffers().output().snapshot_active(100, m * n).unwrap();
        assert_eq!(c, naive(&a, &w, m, n, k));
    }

    #[test]
    fn test_packed_weights_through_transfers() {
        let mut core = core(4);
        let (m, n, k) = (4, 4, 4);
        let a = pattern(m * k, 5);
        let w: Vec<i32> = (0..n * k).map(|i| [-1, 0, 1][i % 3]).collect();
        let packed: Vec<i32> = w.chunks(k).flat_map(pack_trits).collect();
        core.host_memory_mut().write_words(0x40, &packed);
        core.host_memory_mut().write_words(0x800, &a);

        let d = CommandDescriptor::compute_tile(k as u8, 1, 1)
            .with_transfer()
            .with_packed_weights()
            .with_bases(0x40, 0x800, 0xC00);
        core.push(d).unwrap();
        core.start();
        core.run_until_idle(10_000);

        assert_eq!(core.host_memory().read_words(0xC00, m * n), naive(&a, &w, m, n, k));
    }

    #[test]
    fn test_reduce_descriptor() {
        let mut core = core(4);
        core.buffers_mut()
            .get_mut(BufferClass::Activation)
            .preload_active(10, &[4, -9, 2, 7])
            .unwrap();
        core.push(CommandDescriptor::reduce(4, 3).with_bases(0, 10, 3)).unwrap();
        core.start();
        core.run_until_idle(1000);

        assert!(core.status().done);
        assert_eq!(core.buffers().output().snapshot_active(3, 1).unwrap(), vec![22]);
    }

    #[test]
    fn test_nop_chain_retires_in_one_tick() {
        let mut core = core(4);
        for _ in 0..3 {
            core.push(CommandDescriptor::nop().with_chain()).unwrap();
        }
        core.start();
        core.tick();
        assert_eq!(core.queue().len(), 0);
        assert_eq!(core.stats().jobs_succeeded, 3);
        assert!(core.status().done);
    }

    #[test]
    fn test_no_chain_stops_after_head() {
        let mut core = core(4);
        core.push(CommandDescriptor::nop()).unwrap();
        core.push(CommandDescriptor::nop()).unwrap();
        core.start();
        core.run_until_idle(10);
        assert_eq!(core.queue().len(), 1);
        assert!(core.status().done);

        core.start();
        assert!(!core.status().done);
        core.run_until_idle(10);
        assert_eq!(core.queue().len(), 0);
    }

    #[test]
    fn test_queue_full_scenario() {
        let mut core = core(4);
        for i in 0..QUEUE_CAPACITY {
            core.push(CommandDescriptor::nop().with_tile_id(i as u32)).unwrap();
        }
        assert!(!core.status().push_rejected);
        assert!(core.push(CommandDescriptor::nop()).is_err());

        let status = core.status();
        assert!(status.push_rejected);
        assert!(status.queue_full);
        assert_eq!(status.queue_len, QUEUE_CAPACITY);
        assert_eq!(core.queue().current().unwrap().tile_id, 0);

        core.clear();
        assert!(!core.status().push_rejected);
        assert!(core.status().queue_full);
    }

    #[test]
    fn test_execution_error_halts_chain() {
        let mut core = core(4);
        let mut bad = CommandDescriptor::nop().with_chain();
        bad.opcode = Opcode::Unknown(0x42);
        core.push(bad).unwrap();
        core.push(CommandDescriptor::nop().with_chain()).unwrap();
        core.push(CommandDescriptor::nop()).unwrap();
        core.start();
        core.run_until_idle(10);

        assert!(core.status().error);
        assert_eq!(core.last_error(), Some(ExecError::UnknownOpcode(0x42)));
        assert_eq!(core.queue().len(), 2);

        // Start still runs the head but the sticky error keeps blocking chains.
        core.start();
        core.run_until_idle(10);
        assert_eq!(core.queue().len(), 1);

        core.clear();
        assert!(!core.status().error);
        core.start();
        core.run_until_idle(10);
        assert!(core.queue().is_empty());
    }

    #[test]
    fn test_protocol_error_sets_sticky_error() {
        let mut core = core(4);
        core.host_memory_mut().inject_fault(0x1000..0x1010);
        let d = CommandDescriptor::compute_tile(4, 1, 1)
            .with_transfer()
            .with_chain()
            .with_bases(0x100, 0x1000, 0x2000);
        core.push(d).unwrap();
        core.push(CommandDescriptor::nop()).unwrap();
        core.start();
        core.run_until_idle(10_000);

        let status = core.status();
        assert!(status.error);
        assert!(status.done);
        assert_eq!(status.queue_len, 1);
        assert!(matches!(
            core.last_error(),
            Some(ExecError::Transfer(DmaError::Protocol { address: 0x1000, .. }))
        ));
        assert!(core.dma().is_error());
        // The failed job never reached its swaps.
        assert_eq!(core.buffers().weight().generation(), 0);
        assert_eq!(core.stats().jobs_failed, 1);
    }

    #[test]
    fn test_swap_refused_during_transfer() {
        let mut core = core(4);
        core.host_memory_mut().write_words(0, &[1, 2, 3, 4]);
        core.start_transfer(TransferDescriptor::load(0, 0, 16, BufferClass::Weight, 16))
            .unwrap();
        core.tick();
        assert!(core.dma().is_busy());

        assert_eq!(core.swap_buffers(BufferClass::Weight), Err(SwapError::TransferBusy));
        assert!(core.status().swap_rejected);
        assert_eq!(core.buffers().weight().generation(), 0);

        core.run_until_idle(100);
        assert!(core.swap_buffers(BufferClass::Weight).is_ok());
        assert_eq!(core.buffers().weight().snapshot_active(0, 4).unwrap(), vec![1, 2, 3, 4]);
        // Sticky until cleared.
        assert!(core.status().swap_rejected);
        core.clear();
        assert!(!core.status().swap_rejected);
    }

    #[test]
    fn test_swap_refused_while_job_active() {
        let mut core = core(4);
        core.push(CommandDescriptor::compute_tile(4, 1, 1)).unwrap();
        core.start();
        core.tick();
        assert!(core.job().is_some());
        assert_eq!(core.swap_buffers(BufferClass::Activation), Err(SwapError::JobActive));
    }

    #[test]
    fn test_flush_mid_transfer_keeps_completed_bursts() {
        let mut core = core(8);
        // 8 x 8 weights = 256 bytes = 4 bursts of 64 bytes
        let w: Vec<i32> = (1..=64).collect();
        core.host_memory_mut().write_words(0x100, &w);
        let d = CommandDescriptor::compute_tile(8, 1, 1)
            .with_transfer()
            .with_bases(0x100, 0x1000, 0x2000);
        core.push(d).unwrap();
        core.start();

        let mut ticks = 0;
        while core.dma().bytes_transferred() < 64 && ticks < 1000 {
            core.tick();
            ticks += 1;
        }
        assert!(core.dma().is_busy());
        let ticket = core.dma().current_ticket().unwrap();

        core.flush();
        assert!(core.job().is_none());
        assert!(core.queue().is_empty());

        core.run_until_idle(1000);
        // The orphaned transfer finished but nobody swapped or retired.
        assert_eq!(core.dma().outcome(ticket), Some(Ok(256)));
        assert_eq!(core.dma().state(), TransferState::Idle);
        assert_eq!(core.dma().bytes_transferred(), 256);
        assert_eq!(core.buffers().weight().generation(), 0);
        assert_eq!(core.buffers().weight().snapshot_shadow(0, 64).unwrap(), w);
        assert_eq!(core.queue().stats().retired, 0);
        assert_eq!(core.stats().jobs_dropped, 1);
        assert!(!core.status().done);
    }

    #[test]
    fn test_new_job_waits_for_orphaned_transfer() {
        let mut core = core(4);
        let d = CommandDescriptor::compute_tile(4, 1, 1)
            .with_transfer()
            .with_bases(0x100, 0x1000, 0x2000);
        core.push(d).unwrap();
        core.start();
        core.tick();
        core.tick();
        core.flush();
        assert!(core.dma().is_busy());

        core.push(d).unwrap();
        core.start();
        core.run_until_idle(10_000);
        assert!(core.status().done);
        assert!(!core.status().error);
        assert_eq!(core.stats().jobs_succeeded, 1);
    }

    #[test]
    fn test_status_word_encoding() {
        let status = CoreStatus {
            busy: true,
            done: true,
            error: false,
            irq_pending: true,
            push_rejected: false,
            queue_full: true,
            swap_rejected: true,
            queue_len: 8,
        };
        assert_eq!(status.to_word(), (8 << 16) | (1 << 13) | (1 << 12) | (1 << 10) | (1 << 8) | (1 << 1));
        assert_eq!(CoreStatus::default().to_word(), 0);
    }

    #[test]
    fn test_interrupt_line_gated_by_enable() {
        let mut core = core(4);
        core.push(CommandDescriptor::nop().with_irq()).unwrap();
        core.start();
        core.tick();
        assert!(core.status().irq_pending);
        assert!(!core.interrupt_line());
        core.set_irq_enable(true);
        assert!(core.interrupt_line());
        core.acknowledge_interrupt();
        assert!(!core.interrupt_line());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CoreConfig { array_size: 4, num_banks: 0, ..CoreConfig::default() };
        let built = Orchestrator::new(config, Box::new(SystolicArray::new(4)));
        assert_eq!(built.err(), Some(ConfigError::Zero { field: "num_banks" }));

        let config = CoreConfig { array_size: 4, max_burst_beats: 1 << 30, ..CoreConfig::default() };
        assert!(Orchestrator::new(config, Box::new(SystolicArray::new(4))).is_err());
    }

    /// Store and sorted banks of each component's pending request.
    fn requested_banks(core: &Orchestrator) -> [Option<(BufferClass, Vec<usize>)>; 3] {
        [core.dma().port_request(), core.scheduler().port_request(), core.reduce_unit().port_request()].map(|req| {
            req.map(|r| {
                let store = core.buffers().get(r.class);
                let mut banks: Vec<usize> = r.addresses.iter().map(|a| store.bank_of(*a)).collect();
                banks.sort_unstable();
                banks.dedup();
                (r.class, banks)
            })
        })
    }

    /// Run to quiescence checking, every tick, that no bank is granted to
    /// two components and that uncontested requests are never stalled.
    /// Returns the number of contested banks seen and, per component, the
    /// grants it won while contested.
    fn run_checking_banks(core: &mut Orchestrator) -> (u64, [u32; 3]) {
        let mut contested_banks = 0u64;
        let mut contended_grants = [0u32; 3];
        let mut ticks = 0;
        while !core.is_quiescent() {
            let requested = requested_banks(core);
            for class in BufferClass::ALL {
                let mut count = vec![0usize; core.config().num_banks];
                for (_, banks) in requested.iter().flatten().filter(|(c, _)| *c == class) {
                    for bank in banks {
                        count[*bank] += 1;
                    }
                }
                contested_banks += count.iter().filter(|c| **c > 1).count() as u64;
            }

            core.tick();
            ticks += 1;
            assert!(ticks < 20_000, "core never went idle");

            let grants = core.last_grants();
            let mut owned: Vec<(BufferClass, usize)> = Vec::new();
            for (i, req) in requested.iter().enumerate() {
                let Some((class, banks)) = req else {
                    assert_eq!(grants[i], GrantStatus::Idle);
                    continue;
                };
                let shared = requested.iter().enumerate().any(|(j, other)| {
                    j != i && matches!(other, Some((c, b)) if c == class && b.iter().any(|x| banks.contains(x)))
                });
                if !shared {
                    assert_eq!(grants[i], GrantStatus::Granted, "tick {}: uncontested request stalled", ticks);
                }
                if grants[i] == GrantStatus::Granted {
                    for bank in banks {
                        assert!(
                            !owned.contains(&(*class, *bank)),
                            "tick {}: {} bank {} granted twice",
                            ticks, class, bank
                        );
                        owned.push((*class, *bank));
                    }
                    if shared {
                        contended_grants[i] += 1;
                    }
                }
            }
        }
        (contested_banks, contended_grants)
    }

    fn total_conflicts(core: &Orchestrator) -> u64 {
        BufferClass::ALL.iter().map(|c| core.arbiter(*c).stats().total_conflicts).sum()
    }

    #[test]
    fn test_contention_keeps_banks_exclusive() {
        let mut core = core(4);
        // Compute on resident data while the host streams into the
        // activation shadow set through the same banks.
        core.push(CommandDescriptor::compute_tile(4, 2, 2)).unwrap();
        core.start();
        core.start_transfer(TransferDescriptor::load(0, 0, 256, BufferClass::Activation, 16))
            .unwrap();

        let (contested, won) = run_checking_banks(&mut core);
        assert!(contested > 0);
        assert_eq!(total_conflicts(&core), contested);
        assert!(won[0] > 0, "transfer engine never won a contested bank");
        assert!(won[1] > 0, "tile scheduler never won a contested bank");
        assert!(core.status().done);
        assert!(core.last_error().is_none());
        assert_eq!(core.dma().bytes_transferred(), 256);
    }

    #[test]
    fn test_wide_beats_keep_banks_exclusive() {
        let config = CoreConfig { array_size: 4, bytes_per_beat: 16, ..CoreConfig::default() };
        let mut core = Orchestrator::new(config, Box::new(SystolicArray::new(4))).unwrap();
        let (m, n, k) = (8, 8, 4);
        let a = pattern(m * k, 3);
        let w = pattern(n * k, 4);
        core.buffers_mut().get_mut(BufferClass::Weight).preload_active(0, &w).unwrap();
        core.buffers_mut().get_mut(BufferClass::Activation).preload_active(0, &a).unwrap();

        core.push(CommandDescriptor::compute_tile(k as u8, 2, 2)).unwrap();
        core.start();
        core.start_transfer(TransferDescriptor::load(0, 0, 512, BufferClass::Activation, 8))
            .unwrap();

        let (contested, won) = run_checking_banks(&mut core);
        assert!(contested > 0);
        assert_eq!(total_conflicts(&core), contested);
        assert!(won[0] > 0 && won[1] > 0);

        // Arbitration changes timing, never the result.
        let c = core.buffers().output().snapshot_active(0, m * n).unwrap();
        assert_eq!(c, naive(&a, &w, m, n, k));
    }
}
