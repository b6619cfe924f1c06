//! Transfer engine state machine.
//!
//! The engine advances one state per tick. States that touch a banked store
//! (`ReadData`, `BufferRead`) only advance on ticks where the orchestrator
//! granted the engine's port request; a stalled tick repeats the same beat.
//! A beat wider than one word requests every word it covers.

use super::transfer::{Transfer, TransferDescriptor, TransferDirection, TransferState};
use super::DmaError;
use crate::device::arbiter::{requestor, AccessKind, GrantStatus, PortRequest};
use crate::device::banked_store::StorageBuffers;
use crate::device::host_memory::{Beat, HostMemory};
use crate::device::registers_spec::dma_status;

/// Transfer engine statistics.
#[derive(Debug, Clone, Default)]
pub struct DmaStats {
    pub bursts: u64,
    pub beats: u64,
    pub bytes: u64,
    /// Ticks a beat waited on arbitration.
    pub stall_ticks: u64,
    pub transfers_completed: u64,
    pub errors: u64,
}

/// Single-channel burst transfer engine.
#[derive(Debug)]
pub struct TransferEngine {
    bytes_per_beat: usize,
    state: TransferState,
    transfer: Option<Transfer>,
    next_ticket: u64,
    /// Latched until the next start.
    done: bool,
    error: bool,
    last_error: Option<DmaError>,
    /// Bytes of completed bursts of the current (or last) transfer.
    bytes_transferred: u32,
    /// Ticket and result of the last transfer that reached a terminal state.
    last_outcome: Option<(u64, Result<u32, DmaError>)>,
    stats: DmaStats,
}

impl TransferEngine {
    pub fn new(bytes_per_beat: usize) -> Self {
        Self {
            bytes_per_beat,
            state: TransferState::Idle,
            transfer: None,
            next_ticket: 1,
            done: false,
            error: false,
            last_error: None,
            bytes_transferred: 0,
            last_outcome: None,
            stats: DmaStats::default(),
        }
    }

    /// Begin a transfer. Returns a ticket identifying it.
    pub fn start(&mut self, descriptor: TransferDescriptor) -> Result<u64, DmaError> {
        if self.state.is_busy() {
            return Err(DmaError::Busy);
        }
        descriptor.validate()?;

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        log::debug!(
            "DMA #{} start {} {:?} ext=0x{:X} int=0x{:X} len={} burst={}",
            ticket,
            descriptor.direction,
            descriptor.routing,
            descriptor.external_address(),
            descriptor.internal_address(),
            descriptor.length,
            descriptor.max_burst_beats
        );

        self.transfer = Some(Transfer::new(descriptor, ticket));
        self.state = TransferState::CalcBurst;
        self.done = false;
        self.error = false;
        self.last_error = None;
        self.bytes_transferred = 0;
        Ok(ticket)
    }

    /// Bank access needed this tick, if any.
    pub fn port_request(&self) -> Option<PortRequest> {
        let xfer = self.transfer.as_ref()?;
        let (kind, words) = match self.state {
            TransferState::ReadData => (
                AccessKind::Write,
                xfer.beats.get(xfer.beat_index as usize).map_or(0, |beat| beat.len()),
            ),
            TransferState::BufferRead => (AccessKind::Read, xfer.beat_words(xfer.beat_index, self.bytes_per_beat)),
            _ => return None,
        };
        let start = xfer.internal_cursor;
        Some(PortRequest::spanning(
            requestor::DMA,
            xfer.descriptor.routing,
            start..start + words.max(1) as u32,
            kind,
        ))
    }

    /// Advance one tick. `grant` is the arbitration result for this tick's
    /// port request (`Idle` when none was made).
    pub fn step(
        &mut self,
        grant: GrantStatus,
        buffers: &mut StorageBuffers,
        host: &mut HostMemory,
    ) -> TransferState {
        match self.state {
            TransferState::Idle => {}
            TransferState::Done | TransferState::Error => {
                self.state = TransferState::Idle;
                self.transfer = None;
            }
            _ => {
                if let Err(err) = self.advance(grant, buffers, host) {
                    self.fail(err);
                }
            }
        }
        self.state
    }

    fn advance(
        &mut self,
        grant: GrantStatus,
        buffers: &mut StorageBuffers,
        host: &mut HostMemory,
    ) -> Result<(), DmaError> {
        let bytes_per_beat = self.bytes_per_beat;
        let Some(xfer) = self.transfer.as_mut() else {
            self.state = TransferState::Idle;
            return Ok(());
        };

        match self.state {
            TransferState::CalcBurst => {
                xfer.plan_burst(bytes_per_beat);
                log::debug!(
                    "DMA #{} burst: {} bytes in {} beats ({} remaining)",
                    xfer.ticket, xfer.burst_bytes, xfer.burst_beats, xfer.remaining
                );
                self.stats.bursts += 1;
                self.state = match xfer.descriptor.direction {
                    TransferDirection::ExternalToInternal => TransferState::ReadAddress,
                    TransferDirection::InternalToExternal => TransferState::BufferRead,
                };
            }

            TransferState::ReadAddress => {
                let burst = host.read_burst(xfer.external_cursor, xfer.burst_bytes as usize, bytes_per_beat);
                if !burst.response.is_ok() {
                    return Err(DmaError::Protocol {
                        address: xfer.external_cursor,
                        response: burst.response,
                    });
                }
                xfer.beats = burst.beats;
                self.state = TransferState::ReadData;
            }

            TransferState::ReadData => {
                if grant != GrantStatus::Granted {
                    self.stats.stall_ticks += 1;
                    return Ok(());
                }
                let store = buffers.get_mut(xfer.descriptor.routing);
                let beat = xfer.beats.get(xfer.beat_index as usize).cloned().unwrap_or_default();
                for (i, word) in beat.iter().enumerate() {
                    store.write_addr(xfer.internal_cursor + i as u32, *word)?;
                }
                log::trace!(
                    "DMA #{} beat {}/{} -> {} @0x{:X}",
                    xfer.ticket, xfer.beat_index + 1, xfer.burst_beats,
                    xfer.descriptor.routing, xfer.internal_cursor
                );
                xfer.internal_cursor += beat.len() as u32;
                self.stats.beats += 1;
                if xfer.last_beat() {
                    self.finish_burst();
                } else {
                    xfer.beat_index += 1;
                }
            }

            TransferState::BufferRead => {
                if grant != GrantStatus::Granted {
                    self.stats.stall_ticks += 1;
                    return Ok(());
                }
                let words = xfer.beat_words(xfer.beat_index, bytes_per_beat);
                let store = buffers.get_mut(xfer.descriptor.routing);
                let mut beat = Beat::new();
                for i in 0..words {
                    beat.push(store.read_addr(xfer.internal_cursor + i as u32)?);
                }
                log::trace!(
                    "DMA #{} gather {}/{} <- {} @0x{:X}",
                    xfer.ticket, xfer.beat_index + 1, xfer.burst_beats,
                    xfer.descriptor.routing, xfer.internal_cursor
                );
                xfer.internal_cursor += words as u32;
                xfer.beats.push(beat);
                self.stats.beats += 1;
                if xfer.last_beat() {
                    self.state = TransferState::WriteAddress;
                } else {
                    xfer.beat_index += 1;
                }
            }

            TransferState::WriteAddress => {
                self.state = TransferState::WriteData;
            }

            TransferState::WriteData => {
                xfer.write_response = Some(host.write_burst(xfer.external_cursor, &xfer.beats));
                self.state = TransferState::WriteResp;
            }

            TransferState::WriteResp => {
                if let Some(response) = xfer.write_response.filter(|r| !r.is_ok()) {
                    return Err(DmaError::Protocol {
                        address: xfer.external_cursor,
                        response,
                    });
                }
                self.finish_burst();
            }

            TransferState::Idle | TransferState::Done | TransferState::Error => {}
        }
        Ok(())
    }

    fn finish_burst(&mut self) {
        let Some(xfer) = self.transfer.as_mut() else {
            return;
        };
        let burst_bytes = xfer.burst_bytes;
        let finished = xfer.complete_burst();
        self.bytes_transferred += burst_bytes;
        self.stats.bytes += burst_bytes as u64;

        if finished {
            log::debug!("DMA #{} done, {} bytes", xfer.ticket, self.bytes_transferred);
            self.last_outcome = Some((xfer.ticket, Ok(self.bytes_transferred)));
            self.stats.transfers_completed += 1;
            self.done = true;
            self.state = TransferState::Done;
        } else {
            self.state = TransferState::CalcBurst;
        }
    }

    fn fail(&mut self, err: DmaError) {
        let ticket = self.transfer.as_ref().map(|x| x.ticket).unwrap_or(0);
        log::error!(
            "DMA #{} failed in {:?}: {} ({} bytes completed)",
            ticket, self.state, err, self.bytes_transferred
        );
        self.last_outcome = Some((ticket, Err(err)));
        self.last_error = Some(err);
        self.stats.errors += 1;
        self.error = true;
        self.state = TransferState::Error;
    }

    /// Result of the transfer with this ticket once it reached a terminal
    /// state. `None` while it is still running or if a later transfer has
    /// since finished.
    pub fn outcome(&self, ticket: u64) -> Option<Result<u32, DmaError>> {
        match self.last_outcome {
            Some((t, result)) if t == ticket => Some(result),
            _ => None,
        }
    }

    /// Ticket of the transfer in flight.
    pub fn current_ticket(&self) -> Option<u64> {
        self.transfer.as_ref().filter(|_| self.state.is_busy()).map(|x| x.ticket)
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn last_error(&self) -> Option<DmaError> {
        self.last_error
    }

    /// Bytes of completed bursts since the last start.
    pub fn bytes_transferred(&self) -> u32 {
        self.bytes_transferred
    }

    pub fn bytes_per_beat(&self) -> usize {
        self.bytes_per_beat
    }

    /// DMA_STATUS register encoding.
    pub fn status_word(&self) -> u32 {
        let mut value = 0;
        if self.is_busy() {
            value |= 1 << dma_status::BUSY_BIT;
        }
        if self.done {
            value |= 1 << dma_status::DONE_BIT;
        }
        if self.error {
            value |= 1 << dma_status::ERROR_BIT;
        }
        value |= self.bytes_transferred.min(dma_status::BYTES_MASK) << dma_status::BYTES_SHIFT;
        value
    }

    pub fn stats(&self) -> &DmaStats {
        &self.stats
    }
}
