//! Vector reduction unit.
//!
//! Reads `len` words from the activation store one granted read per tick,
//! folds them, then writes the single result into the output store's shadow
//! set in one more granted tick. Sums accumulate in 64 bits and saturate to
//! the 32-bit range when written.

use std::fmt;

use thiserror::Error;

use super::arbiter::{requestor, AccessKind, GrantStatus, PortRequest};
use super::banked_store::{BufferClass, StorageBuffers, StoreError};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReduceError {
    #[error("reduce unit busy")]
    Busy,

    #[error("reduction aborted on store access: {0}")]
    Store(#[from] StoreError),
}

/// Reduction operation, selected by the low two bits of the N selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
    AbsSum,
}

impl ReduceOp {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => ReduceOp::Sum,
            1 => ReduceOp::Max,
            2 => ReduceOp::Min,
            _ => ReduceOp::AbsSum,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Max => 1,
            ReduceOp::Min => 2,
            ReduceOp::AbsSum => 3,
        }
    }

    /// Fold a running value with the next element.
    fn fold(self, acc: Option<i64>, value: i32) -> i64 {
        let v = value as i64;
        match (self, acc) {
            (ReduceOp::Sum, a) => a.unwrap_or(0) + v,
            (ReduceOp::AbsSum, a) => a.unwrap_or(0) + v.abs(),
            (ReduceOp::Max, Some(a)) => a.max(v),
            (ReduceOp::Min, Some(a)) => a.min(v),
            (ReduceOp::Max | ReduceOp::Min, None) => v,
        }
    }

    /// Reduce a slice in one go. An empty slice reduces to 0.
    pub fn apply(self, values: &[i32]) -> i32 {
        let acc = values.iter().fold(None, |acc, v| Some(self.fold(acc, *v)));
        saturate_i32(acc.unwrap_or(0))
    }
}

impl std::str::FromStr for ReduceOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" | "0" => Ok(ReduceOp::Sum),
            "max" | "1" => Ok(ReduceOp::Max),
            "min" | "2" => Ok(ReduceOp::Min),
            "abssum" | "abs" | "3" => Ok(ReduceOp::AbsSum),
            other => Err(format!("unknown reduction '{}'", other)),
        }
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceOp::Sum => write!(f, "sum"),
            ReduceOp::Max => write!(f, "max"),
            ReduceOp::Min => write!(f, "min"),
            ReduceOp::AbsSum => write!(f, "abssum"),
        }
    }
}

fn saturate_i32(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceConfig {
    /// Elements to read.
    pub len: usize,
    /// Activation store word address of the first element.
    pub source: u32,
    /// Output store word address of the result.
    pub dest: u32,
    pub op: ReduceOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReducePhase {
    #[default]
    Idle,
    Reading,
    Writing,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct ReduceStats {
    pub reductions: u64,
    pub elements: u64,
    pub stall_ticks: u64,
}

/// Streaming reduction over the activation store.
#[derive(Debug, Default)]
pub struct ReduceUnit {
    phase: ReducePhase,
    config: Option<ReduceConfig>,
    index: usize,
    acc: Option<i64>,
    next_ticket: u64,
    ticket: u64,
    last_outcome: Option<(u64, Result<i32, ReduceError>)>,
    stats: ReduceStats,
}

impl ReduceUnit {
    pub fn new() -> Self {
        Self {
            next_ticket: 1,
            ..Default::default()
        }
    }

    pub fn start(&mut self, config: ReduceConfig) -> Result<u64, ReduceError> {
        if self.phase != ReducePhase::Idle {
            return Err(ReduceError::Busy);
        }
        self.ticket = self.next_ticket.max(1);
        self.next_ticket = self.ticket + 1;
        self.config = Some(config);
        self.index = 0;
        self.acc = None;
        self.phase = if config.len == 0 {
            ReducePhase::Writing
        } else {
            ReducePhase::Reading
        };
        log::debug!(
            "Reduce #{} start {} over {} words @0x{:X} -> 0x{:X}",
            self.ticket, config.op, config.len, config.source, config.dest
        );
        Ok(self.ticket)
    }

    pub fn port_request(&self) -> Option<PortRequest> {
        let config = self.config.as_ref()?;
        match self.phase {
            ReducePhase::Reading => Some(PortRequest::single(
                requestor::REDUCE,
                BufferClass::Activation,
                config.source + self.index as u32,
                AccessKind::Read,
            )),
            ReducePhase::Writing => Some(PortRequest::single(
                requestor::REDUCE,
                BufferClass::Output,
                config.dest,
                AccessKind::Write,
            )),
            ReducePhase::Idle | ReducePhase::Done => None,
        }
    }

    pub fn step(&mut self, grant: GrantStatus, buffers: &mut StorageBuffers) -> ReducePhase {
        match self.phase {
            ReducePhase::Idle => {}
            ReducePhase::Done => {
                self.phase = ReducePhase::Idle;
                self.config = None;
            }
            ReducePhase::Reading | ReducePhase::Writing => {
                if grant != GrantStatus::Granted {
                    self.stats.stall_ticks += 1;
                } else if let Err(err) = self.advance(buffers) {
                    log::error!("Reduce #{} aborted: {}", self.ticket, err);
                    self.last_outcome = Some((self.ticket, Err(err)));
                    self.phase = ReducePhase::Done;
                }
            }
        }
        self.phase
    }

    fn advance(&mut self, buffers: &mut StorageBuffers) -> Result<(), ReduceError> {
        let Some(config) = self.config else {
            self.phase = ReducePhase::Idle;
            return Ok(());
        };
        match self.phase {
            ReducePhase::Reading => {
                let value = buffers
                    .get_mut(BufferClass::Activation)
                    .read_addr(config.source + self.index as u32)?;
                self.acc = Some(config.op.fold(self.acc, value));
                self.index += 1;
                self.stats.elements += 1;
                if self.index == config.len {
                    self.phase = ReducePhase::Writing;
                }
            }
            ReducePhase::Writing => {
                let result = saturate_i32(self.acc.unwrap_or(0));
                buffers.get_mut(BufferClass::Output).write_addr(config.dest, result)?;
                log::debug!("Reduce #{} {} = {}", self.ticket, config.op, result);
                self.last_outcome = Some((self.ticket, Ok(result)));
                self.stats.reductions += 1;
                self.phase = ReducePhase::Done;
            }
            ReducePhase::Idle | ReducePhase::Done => {}
        }
        Ok(())
    }

    pub fn outcome(&self, ticket: u64) -> Option<Result<i32, ReduceError>> {
        match self.last_outcome {
            Some((t, result)) if t == ticket => Some(result),
            _ => None,
        }
    }

    pub fn phase(&self) -> ReducePhase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.phase, ReducePhase::Reading | ReducePhase::Writing)
    }

    pub fn is_idle(&self) -> bool {
        self.phase == ReducePhase::Idle
    }

    pub fn stats(&self) -> &ReduceStats {
        &self.stats
    }
}
