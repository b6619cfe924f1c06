//! Bounded descriptor queue.
//!
//! A fixed ring of [`QUEUE_CAPACITY`] descriptors. Only the head is eligible
//! for execution. The queue also owns the sticky error and interrupt-pending
//! latches because both are set at retirement time.
//!
//! ```text
//!            read                write
//!             |                    |
//!   +----+----+----+----+----+----+----+----+
//!   |    | D0 | D1 | D2 | D3 | D4 |    |    |
//!   +----+----+----+----+----+----+----+----+
//!          ^ head (current)
//! ```

use thiserror::Error;

use super::descriptor::CommandDescriptor;
use super::tritone_spec::QUEUE_CAPACITY;

/// Push rejected because every slot is occupied. Nothing was modified.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("command queue full ({capacity} descriptors)")]
pub struct QueueFull {
    pub capacity: usize,
}

/// Outcome of retiring the head descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retirement {
    /// The descriptor that left the queue.
    pub descriptor: CommandDescriptor,
    /// Whether its execution succeeded.
    pub success: bool,
    /// The controller should proceed directly to the new head.
    pub chain: bool,
    /// The interrupt-pending flag was latched by this retirement.
    pub interrupt: bool,
}

/// Queue statistics.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pushed: u64,
    pub rejected: u64,
    pub retired: u64,
    pub failed: u64,
    pub flushed: u64,
}

/// Capacity-8 ring of command descriptors.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    slots: [Option<CommandDescriptor>; QUEUE_CAPACITY],
    read: usize,
    write: usize,
    count: usize,
    error: bool,
    irq_pending: bool,
    /// Interrupt latched during the current tick; survives one `end_tick`.
    irq_fresh: bool,
    stats: QueueStats,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            slots: [None; QUEUE_CAPACITY],
            read: 0,
            write: 0,
            count: 0,
            error: false,
            irq_pending: false,
            irq_fresh: false,
            stats: QueueStats::default(),
        }
    }

    /// Append a descriptor at the tail.
    pub fn push(&mut self, descriptor: CommandDescriptor) -> Result<(), QueueFull> {
        if self.is_full() {
            self.stats.rejected += 1;
            log::warn!("Queue full, rejecting {}", descriptor);
            return Err(QueueFull { capacity: QUEUE_CAPACITY });
        }
        self.slots[self.write] = Some(descriptor);
        self.write = (self.write + 1) % QUEUE_CAPACITY;
        self.count += 1;
        self.stats.pushed += 1;
        log::trace!("Queued {} (count={})", descriptor, self.count);
        Ok(())
    }

    /// The descriptor at the head, if any.
    pub fn current(&self) -> Option<&CommandDescriptor> {
        if self.count == 0 {
            None
        } else {
            self.slots[self.read].as_ref()
        }
    }

    /// Pop the head after its execution finished.
    ///
    /// Returns `None` when the queue is empty (the head was flushed while it
    /// was executing).
    pub fn retire(&mut self, success: bool) -> Option<Retirement> {
        if self.count == 0 {
            log::warn!("Retire on empty queue ignored");
            return None;
        }
        let descriptor = self.slots[self.read].take()?;
        self.read = (self.read + 1) % QUEUE_CAPACITY;
        self.count -= 1;
        self.stats.retired += 1;

        if !success {
            self.error = true;
            self.stats.failed += 1;
        }
        if descriptor.irq_enable {
            self.irq_pending = true;
            self.irq_fresh = true;
        }

        let chain = descriptor.chain && self.count > 0 && success && !self.error;
        log::info!(
            "Retired {} success={} chain={} remaining={}",
            descriptor.opcode, success, chain, self.count
        );

        Some(Retirement {
            descriptor,
            success,
            chain,
            interrupt: descriptor.irq_enable,
        })
    }

    /// Discard every queued descriptor. Latches are left alone.
    pub fn flush(&mut self) {
        if self.count > 0 {
            log::debug!("Flushing {} queued descriptors", self.count);
        }
        self.stats.flushed += self.count as u64;
        self.slots = [None; QUEUE_CAPACITY];
        self.read = 0;
        self.write = 0;
        self.count = 0;
    }

    /// Tick-boundary housekeeping.
    ///
    /// A pending interrupt clears once the queue has drained, but never in
    /// the same tick it was raised.
    pub fn end_tick(&mut self) {
        if self.irq_pending && !self.irq_fresh && self.count == 0 {
            log::trace!("Interrupt auto-cleared, queue drained");
            self.irq_pending = false;
        }
        self.irq_fresh = false;
    }

    pub fn acknowledge_interrupt(&mut self) {
        self.irq_pending = false;
        self.irq_fresh = false;
    }

    pub fn clear_error(&mut self) {
        self.error = false;
    }

    pub fn interrupt_pending(&self) -> bool {
        self.irq_pending
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == QUEUE_CAPACITY
    }

    pub fn capacity(&self) -> usize {
        QUEUE_CAPACITY
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}
