//! Tile scheduler: load / compute / drain phase controller.
//!
//! Computes `C[M][N] = A[M][K] · W[N][K]^T` one `size x size` output tile at
//! a time, walking tiles along N first and then along M.
//!
//! # Phases
//!
//! ```text
//!   start ─► LoadWeights ─► Compute ─► Drain ─┬─► LoadWeights (next tile)
//!             size steps   2·size-1    size   │
//!                           steps      steps  └─► Done ─► Idle
//! ```
//!
//! Every step that touches a store presents one port request naming every
//! word it touches; the step only happens on a tick where that request was
//! granted, which means it owned all of the banks involved. Steps with
//! nothing to access (padding columns and rows past the problem edge)
//! advance without a request.
//!
//! | Phase       | Port       | Words of step                                        |
//! |-------------|------------|------------------------------------------------------|
//! | LoadWeights | weight     | `weight_base + (tile_n + r) * row_words + 0..row_words` |
//! | Compute     | activation | `activation_base + (tile_m + i) * K + (c_i - i)`, each active `i` |
//! | Drain       | output     | `output_base + (tile_m + d) * N + tile_n + 0..width`   |
//!
//! where `c_i` is column `i`'s activation counter and column `i` is active
//! while `c_i` lies in `[i, i + K)`.

use thiserror::Error;

use super::arbiter::{requestor, AccessKind, AddressSet, GrantStatus, PortRequest};
use super::banked_store::{BufferClass, StorageBuffers, StoreError};
use super::compute::{packed_row_words, unpack_trits, ComputeArray};
use super::tritone_spec::{
    compute_phase_steps, NARROW_ACC_MAX, NARROW_ACC_MIN, WIDE_ACC_MAX, WIDE_ACC_MIN,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("tile scheduler busy")]
    Busy,

    #[error("tile aborted on store access: {0}")]
    Store(#[from] StoreError),
}

/// Problem handed to the scheduler. Dimensions are not validated here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileConfig {
    /// M
    pub rows: usize,
    /// N
    pub cols: usize,
    pub k: usize,
    pub weight_base: u32,
    pub activation_base: u32,
    pub output_base: u32,
    pub pack_weights: bool,
    pub wide_accumulator: bool,
}

impl TileConfig {
    /// Words per weight row in the weight store.
    pub fn weight_row_words(&self) -> usize {
        if self.pack_weights {
            packed_row_words(self.k)
        } else {
            self.k
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    LoadWeights,
    Compute,
    Drain,
    Done,
}

/// Scheduler-owned progress through the problem.
#[derive(Debug, Clone, Default)]
pub struct TileState {
    pub tile_m: usize,
    pub tile_n: usize,
    pub phase: Phase,
    /// Granted steps taken in the current phase.
    pub step: usize,
    /// Per-column activation counters for the compute phase.
    pub column_counters: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub tiles_completed: u64,
    pub load_steps: u64,
    pub compute_steps: u64,
    pub drain_steps: u64,
    /// Ticks a step waited on arbitration.
    pub stall_ticks: u64,
    /// Drained values clipped by the accumulator range.
    pub saturated_outputs: u64,
}

/// Drives a [`ComputeArray`] over a tiled matrix multiply.
#[derive(Debug)]
pub struct TileScheduler {
    array: Box<dyn ComputeArray>,
    config: TileConfig,
    state: TileState,
    next_ticket: u64,
    ticket: u64,
    last_outcome: Option<(u64, Result<(), SchedulerError>)>,
    stats: SchedulerStats,
}

impl TileScheduler {
    pub fn new(array: Box<dyn ComputeArray>) -> Self {
        let size = array.size();
        Self {
            array,
            config: TileConfig::default(),
            state: TileState {
                column_counters: vec![0; size],
                ..Default::default()
            },
            next_ticket: 1,
            ticket: 0,
            last_outcome: None,
            stats: SchedulerStats::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.array.size()
    }

    /// Begin a problem. Only accepted from Idle.
    pub fn start(&mut self, config: TileConfig) -> Result<u64, SchedulerError> {
        if self.state.phase != Phase::Idle {
            return Err(SchedulerError::Busy);
        }
        self.ticket = self.next_ticket;
        self.next_ticket += 1;
        self.config = config;
        self.state.tile_m = 0;
        self.state.tile_n = 0;
        self.array.reset();
        self.enter(Phase::LoadWeights);
        log::debug!(
            "Scheduler #{} start M={} N={} K={} packed={} wide={}",
            self.ticket, config.rows, config.cols, config.k, config.pack_weights, config.wide_accumulator
        );
        Ok(self.ticket)
    }

    fn enter(&mut self, phase: Phase) {
        self.state.phase = phase;
        self.state.step = 0;
        if phase == Phase::Compute {
            self.state.column_counters.fill(0);
            self.array.begin_compute();
        }
        log::trace!(
            "Scheduler tile ({}, {}) -> {:?}",
            self.state.tile_m, self.state.tile_n, phase
        );
    }

    /// Columns presenting an activation this step, with their addresses.
    fn active_columns(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        let k = self.config.k;
        self.state
            .column_counters
            .iter()
            .enumerate()
            .filter(move |(i, c)| **c >= *i && **c < *i + k && self.state.tile_m + *i < self.config.rows)
            .map(move |(i, c)| (i, self.activation_address(i, *c)))
    }

    /// Output columns of the current tile that lie inside N.
    fn drain_width(&self) -> usize {
        self.size().min(self.config.cols - self.state.tile_n)
    }

    fn activation_address(&self, column: usize, counter: usize) -> u32 {
        let row = self.state.tile_m + column;
        self.config.activation_base + (row * self.config.k + (counter - column)) as u32
    }

    fn weight_address(&self, n: usize) -> u32 {
        self.config.weight_base + (n * self.config.weight_row_words()) as u32
    }

    fn output_address(&self, row: usize) -> u32 {
        self.config.output_base + (row * self.config.cols + self.state.tile_n) as u32
    }

    /// Bank access needed by this tick's step, if any.
    pub fn port_request(&self) -> Option<PortRequest> {
        match self.state.phase {
            Phase::LoadWeights => {
                let n = self.state.tile_n + self.state.step;
                (n < self.config.cols).then(|| {
                    let base = self.weight_address(n);
                    let words = self.config.weight_row_words() as u32;
                    PortRequest::spanning(
                        requestor::WEIGHT_PORT,
                        BufferClass::Weight,
                        base..base + words,
                        AccessKind::Read,
                    )
                })
            }
            Phase::Compute => {
                let addresses: AddressSet = self.active_columns().map(|(_, address)| address).collect();
                (!addresses.is_empty()).then(|| PortRequest {
                    requestor: requestor::ACTIVATION_PORT,
                    class: BufferClass::Activation,
                    addresses,
                    kind: AccessKind::Read,
                })
            }
            Phase::Drain => {
                let row = self.state.tile_m + self.state.step;
                (row < self.config.rows).then(|| {
                    let base = self.output_address(row);
                    let width = self.drain_width() as u32;
                    PortRequest::spanning(
                        requestor::OUTPUT_PORT,
                        BufferClass::Output,
                        base..base + width,
                        AccessKind::Write,
                    )
                })
            }
            Phase::Idle | Phase::Done => None,
        }
    }

    /// Advance one tick.
    pub fn step(&mut self, grant: GrantStatus, buffers: &mut StorageBuffers) -> Phase {
        match self.state.phase {
            Phase::Idle => {}
            Phase::Done => self.state.phase = Phase::Idle,
            _ => {
                if self.port_request().is_some() && grant != GrantStatus::Granted {
                    self.stats.stall_ticks += 1;
                    return self.state.phase;
                }
                if let Err(err) = self.advance(buffers) {
                    log::error!(
                        "Scheduler #{} aborted at tile ({}, {}) {:?}: {}",
                        self.ticket, self.state.tile_m, self.state.tile_n, self.state.phase, err
                    );
                    self.last_outcome = Some((self.ticket, Err(err)));
                    self.state.phase = Phase::Done;
                }
            }
        }
        self.state.phase
    }

    fn advance(&mut self, buffers: &mut StorageBuffers) -> Result<(), SchedulerError> {
        let size = self.size();
        match self.state.phase {
            Phase::LoadWeights => {
                let r = self.state.step;
                let n = self.state.tile_n + r;
                let weights = if n < self.config.cols {
                    self.read_weight_row(n, buffers)?
                } else {
                    vec![0; self.config.k]
                };
                self.array.load_weight_row(r, &weights);
                self.stats.load_steps += 1;
                self.state.step += 1;
                if self.state.step == size {
                    self.enter(Phase::Compute);
                }
            }

            Phase::Compute => {
                let store = buffers.get_mut(BufferClass::Activation);
                let mut column = vec![0i32; size];
                for (i, address) in self.active_columns() {
                    column[i] = store.read_addr(address)?;
                }
                self.array.feed(&column);
                for counter in self.state.column_counters.iter_mut() {
                    *counter += 1;
                }
                self.stats.compute_steps += 1;
                self.state.step += 1;
                if self.state.step == compute_phase_steps(size) {
                    self.enter(Phase::Drain);
                }
            }

            Phase::Drain => {
                let d = self.state.step;
                let row = self.state.tile_m + d;
                if row < self.config.rows {
                    let sums = self.array.drain_row(d);
                    let base = self.output_address(row);
                    let width = self.drain_width();
                    let store = buffers.get_mut(BufferClass::Output);
                    for (j, sum) in sums.iter().take(width).enumerate() {
                        let value = self.saturate(*sum);
                        store.write_addr(base + j as u32, value)?;
                    }
                }
                self.stats.drain_steps += 1;
                self.state.step += 1;
                if self.state.step == size {
                    self.finish_tile();
                }
            }

            Phase::Idle | Phase::Done => {}
        }
        Ok(())
    }

    fn read_weight_row(&self, n: usize, buffers: &mut StorageBuffers) -> Result<Vec<i32>, StoreError> {
        let store = buffers.get_mut(BufferClass::Weight);
        let base = self.weight_address(n);
        let words = (0..self.config.weight_row_words())
            .map(|w| store.read_addr(base + w as u32))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(if self.config.pack_weights {
            unpack_trits(&words, self.config.k)
        } else {
            words
        })
    }

    fn saturate(&mut self, sum: i64) -> i32 {
        let (lo, hi) = if self.config.wide_accumulator {
            (WIDE_ACC_MIN, WIDE_ACC_MAX)
        } else {
            (NARROW_ACC_MIN, NARROW_ACC_MAX)
        };
        if sum < lo || sum > hi {
            self.stats.saturated_outputs += 1;
        }
        sum.clamp(lo, hi) as i32
    }

    fn finish_tile(&mut self) {
        let size = self.size();
        self.stats.tiles_completed += 1;
        log::debug!(
            "Scheduler #{} tile ({}, {}) complete",
            self.ticket, self.state.tile_m, self.state.tile_n
        );

        self.state.tile_n += size;
        if self.state.tile_n >= self.config.cols {
            self.state.tile_n = 0;
            self.state.tile_m += size;
        }
        if self.state.tile_m >= self.config.rows {
            self.last_outcome = Some((self.ticket, Ok(())));
            self.state.phase = Phase::Done;
            self.state.step = 0;
        } else {
            self.enter(Phase::LoadWeights);
        }
    }

    /// Result of the problem with this ticket once it finished or aborted.
    pub fn outcome(&self, ticket: u64) -> Option<Result<(), SchedulerError>> {
        match self.last_outcome {
            Some((t, result)) if t == ticket => Some(result),
            _ => None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn state(&self) -> &TileState {
        &self.state
    }

    /// Working through a problem (Done and Idle are not busy).
    pub fn is_busy(&self) -> bool {
        matches!(self.state.phase, Phase::LoadWeights | Phase::Compute | Phase::Drain)
    }

    pub fn is_idle(&self) -> bool {
        self.state.phase == Phase::Idle
    }

    pub fn array(&self) -> &dyn ComputeArray {
        self.array.as_ref()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::compute::{pack_trits, SystolicArray};

    fn scheduler(size: usize) -> TileScheduler {
        TileScheduler::new(Box::new(SystolicArray::new(size)))
    }

    /// Step with every request granted until Done; returns ticks taken.
    fn run_to_done(sched: &mut TileScheduler, buffers: &mut StorageBuffers) -> usize {
        let mut ticks = 0;
        while sched.phase() != Phase::Done {
            let grant = if sched.port_request().is_some() {
                GrantStatus::Granted
            } else {
                GrantStatus::Idle
            };
            sched.step(grant, buffers);
            ticks += 1;
            assert!(ticks < 100_000);
        }
        ticks
    }

    fn naive(a: &[i32], w: &[i32], m: usize, n: usize, k: usize) -> Vec<i32> {
        let mut c = vec![0i32; m * n];
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = (0..k).map(|x| a[i * k + x] * w[j * k + x]).sum();
            }
        }
        c
    }

    #[test]
    fn test_single_tile_timing() {
        let mut sched = scheduler(8);
        let mut buffers = StorageBuffers::new(8, 64);
        sched
            .start(TileConfig { rows: 8, cols: 8, k: 8, ..Default::default() })
            .unwrap();
        assert_eq!(sched.phase(), Phase::LoadWeights);

        let ticks = run_to_done(&mut sched, &mut buffers);
        assert_eq!(ticks, 8 + 15 + 8);
        assert_eq!(sched.stats().load_steps, 8);
        assert_eq!(sched.stats().compute_steps, 15);
        assert_eq!(sched.stats().drain_steps, 8);

        // Done lasts one tick
        sched.step(GrantStatus::Idle, &mut buffers);
        assert!(sched.is_idle());
    }

    #[test]
    fn test_busy_rejects_start() {
        let mut sched = scheduler(2);
        let cfg = TileConfig { rows: 2, cols: 2, k: 2, ..Default::default() };
        sched.start(cfg).unwrap();
        assert_eq!(sched.start(cfg), Err(SchedulerError::Busy));
    }

    #[test]
    fn test_multi_tile_product() {
        let size = 4;
        let (m, n, k) = (8, 12, 3);
        let a: Vec<i32> = (0..m * k).map(|i| (i as i32 * 7) % 11 - 5).collect();
        let w: Vec<i32> = (0..n * k).map(|i| (i as i32 % 3) - 1).collect();

        let mut buffers = StorageBuffers::new(4, 64);
        buffers.get_mut(BufferClass::Weight).preload_active(16, &w).unwrap();
        buffers.get_mut(BufferClass::Activation).preload_active(0, &a).unwrap();

        let mut sched = scheduler(size);
        let ticket = sched
            .start(TileConfig {
                rows: m,
                cols: n,
                k,
                weight_base: 16,
                activation_base: 0,
                output_base: 100,
                wide_accumulator: true,
                ..Default::default()
            })
            .unwrap();
        run_to_done(&mut sched, &mut buffers);

        assert_eq!(sched.outcome(ticket), Some(Ok(())));
        assert_eq!(sched.stats().tiles_completed, 6);
        let out = buffers.output().snapshot_shadow(100, m * n).unwrap();
        assert_eq!(out, naive(&a, &w, m, n, k));
    }

    #[test]
    fn test_packed_weights() {
        let size = 4;
        let (m, n, k) = (4, 4, 4);
        let a: Vec<i32> = (1..=16).collect();
        let w: Vec<i32> = vec![1, 0, -1, 1, -1, -1, 0, 0, 0, 1, 1, 1, 1, 1, 1, -1];

        let packed: Vec<i32> = w.chunks(k).flat_map(pack_trits).collect();
        assert_eq!(packed.len(), n);

        let mut buffers = StorageBuffers::new(4, 64);
        buffers.get_mut(BufferClass::Weight).preload_active(0, &packed).unwrap();
        buffers.get_mut(BufferClass::Activation).preload_active(0, &a).unwrap();

        let mut sched = scheduler(size);
        sched
            .start(TileConfig { rows: m, cols: n, k, pack_weights: true, ..Default::default() })
            .unwrap();
        run_to_done(&mut sched, &mut buffers);

        assert_eq!(buffers.output().snapshot_shadow(0, 16).unwrap(), naive(&a, &w, m, n, k));
        assert!(sched.array().zero_skip_count() > 0);
    }

    #[test]
    fn test_narrow_accumulator_saturates() {
        let mut buffers = StorageBuffers::new(2, 16);
        buffers.get_mut(BufferClass::Weight).preload_active(0, &[1, 1, -1, -1]).unwrap();
        buffers.get_mut(BufferClass::Activation).preload_active(0, &[30_000, 30_000, 5, 5]).unwrap();

        let mut sched = scheduler(2);
        let cfg = TileConfig { rows: 2, cols: 2, k: 2, output_base: 8, ..Default::default() };
        sched.start(cfg).unwrap();
        run_to_done(&mut sched, &mut buffers);
        assert_eq!(
            buffers.output().snapshot_shadow(8, 4).unwrap(),
            vec![i16::MAX as i32, i16::MIN as i32, 10, -10]
        );
        assert_eq!(sched.stats().saturated_outputs, 2);

        // Same problem with the wide accumulator keeps full precision
        sched.step(GrantStatus::Idle, &mut buffers);
        sched.start(TileConfig { wide_accumulator: true, ..cfg }).unwrap();
        run_to_done(&mut sched, &mut buffers);
        assert_eq!(buffers.output().snapshot_shadow(8, 2).unwrap(), vec![60_000, -60_000]);
    }

    #[test]
    fn test_stall_does_not_advance() {
        let mut sched = scheduler(2);
        let mut buffers = StorageBuffers::new(2, 16);
        sched.start(TileConfig { rows: 2, cols: 2, k: 2, ..Default::default() }).unwrap();

        let before = sched.port_request().unwrap();
        for _ in 0..5 {
            sched.step(GrantStatus::Stalled, &mut buffers);
        }
        assert_eq!(sched.state().step, 0);
        assert_eq!(sched.stats().stall_ticks, 5);
        assert_eq!(sched.port_request().unwrap(), before);

        sched.step(GrantStatus::Granted, &mut buffers);
        assert_eq!(sched.state().step, 1);
    }

    #[test]
    fn test_port_requests_follow_phases() {
        let mut sched = scheduler(2);
        let mut buffers = StorageBuffers::new(4, 16);
        sched
            .start(TileConfig {
                rows: 2,
                cols: 2,
                k: 2,
                weight_base: 4,
                activation_base: 8,
                output_base: 12,
                ..Default::default()
            })
            .unwrap();

        // Whole weight rows
        let req = sched.port_request().unwrap();
        assert_eq!((req.requestor, req.class), (requestor::WEIGHT_PORT, BufferClass::Weight));
        assert_eq!(req.addresses.as_slice(), &[4, 5]);
        sched.step(GrantStatus::Granted, &mut buffers);
        assert_eq!(sched.port_request().unwrap().addresses.as_slice(), &[6, 7]);
        sched.step(GrantStatus::Granted, &mut buffers);

        // Compute step 0: only column 0 active, row 0 k 0
        assert_eq!(sched.phase(), Phase::Compute);
        let req = sched.port_request().unwrap();
        assert_eq!(req.requestor, requestor::ACTIVATION_PORT);
        assert_eq!(req.addresses.as_slice(), &[8]);
        sched.step(GrantStatus::Granted, &mut buffers);
        // Step 1: column 0 at k 1 and column 1 at k 0
        assert_eq!(sched.port_request().unwrap().addresses.as_slice(), &[9, 10]);
        sched.step(GrantStatus::Granted, &mut buffers);
        // Step 2: only column 1 at k 1 (row 1)
        assert_eq!(sched.port_request().unwrap().addresses.as_slice(), &[11]);
        sched.step(GrantStatus::Granted, &mut buffers);

        // One output row per drain step
        assert_eq!(sched.phase(), Phase::Drain);
        let req = sched.port_request().unwrap();
        assert_eq!((req.requestor, req.kind), (requestor::OUTPUT_PORT, AccessKind::Write));
        assert_eq!(req.addresses.as_slice(), &[12, 13]);
        sched.step(GrantStatus::Granted, &mut buffers);
        assert_eq!(sched.port_request().unwrap().addresses.as_slice(), &[14, 15]);
    }

    #[test]
    fn test_packed_rows_request_packed_words() {
        let mut sched = scheduler(4);
        sched
            .start(TileConfig { rows: 4, cols: 4, k: 20, weight_base: 32, pack_weights: true, ..Default::default() })
            .unwrap();
        // 20 trits pack into two words per row
        assert_eq!(sched.port_request().unwrap().addresses.as_slice(), &[32, 33]);
    }

    #[test]
    fn test_edge_tiles_skip_accesses() {
        // N=3 on a 2-wide array: second n-tile has one real column
        let mut sched = scheduler(2);
        let mut buffers = StorageBuffers::new(2, 32);
        sched.start(TileConfig { rows: 2, cols: 3, k: 1, ..Default::default() }).unwrap();
        while !(sched.state().tile_n == 2 && sched.phase() == Phase::LoadWeights) {
            sched.step(GrantStatus::Granted, &mut buffers);
        }
        assert!(sched.port_request().is_some());
        sched.step(GrantStatus::Granted, &mut buffers);
        // Column 3 is past N: loads zeros without touching the store
        assert!(sched.port_request().is_none());
        sched.step(GrantStatus::Idle, &mut buffers);
        assert_eq!(sched.phase(), Phase::Compute);
    }

    #[test]
    fn test_store_error_aborts() {
        let mut sched = scheduler(2);
        let mut buffers = StorageBuffers::new(2, 4);
        let ticket = sched
            .start(TileConfig { rows: 2, cols: 2, k: 2, weight_base: 7, ..Default::default() })
            .unwrap();
        sched.step(GrantStatus::Granted, &mut buffers);
        assert_eq!(sched.phase(), Phase::Done);
        assert!(matches!(sched.outcome(ticket), Some(Err(SchedulerError::Store(_)))));
    }
}
