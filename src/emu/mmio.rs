//! Memory-mapped register bus in front of the orchestrator.
//!
//! The bus owns the [`Orchestrator`] and the staging registers that only
//! exist on the host side of the interface: the four descriptor words and
//! the DMA source, destination and length. Writes dispatch on the decoded
//! [`Register`]; reads assemble live status from the core.
//!
//! Writing `CMD3` commits the staged words as one descriptor push.

use crate::device::banked_store::BufferClass;
use crate::device::descriptor::CommandDescriptor;
use crate::device::dma::{TransferDescriptor, TransferDirection};
use crate::device::registers::{decode_swap, CtrlWrite, DmaCtrlWrite, Register};
use crate::device::registers_spec::{ctrl, CMD_WORDS};

use super::engine::Orchestrator;

/// Register bus statistics.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub writes: u64,
    pub reads: u64,
    pub descriptors_pushed: u64,
    pub transfers_started: u64,
    /// Accesses to unmapped offsets.
    pub unknown: u64,
}

/// Host-visible register file of one core.
pub struct RegisterBus {
    core: Orchestrator,
    cmd: [u32; CMD_WORDS as usize],
    dma_src: u32,
    dma_dst: u32,
    dma_len: u32,
    stats: BusStats,
}

impl RegisterBus {
    pub fn new(core: Orchestrator) -> Self {
        Self {
            core,
            cmd: [0; CMD_WORDS as usize],
            dma_src: 0,
            dma_dst: 0,
            dma_len: 0,
            stats: BusStats::default(),
        }
    }

    pub fn core(&self) -> &Orchestrator {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Orchestrator {
        &mut self.core
    }

    pub fn into_core(self) -> Orchestrator {
        self.core
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    /// Write a 32-bit value to a register offset.
    pub fn write_register(&mut self, offset: u32, value: u32) {
        self.stats.writes += 1;
        let reg = Register::decode(offset);
        log::trace!("MMIO write {} <- 0x{:08X}", reg, value);

        match reg {
            Register::Ctrl => self.write_ctrl(value),

            Register::Cmd(index) => {
                self.cmd[index as usize] = value;
                if index as u32 == CMD_WORDS - 1 {
                    self.commit_descriptor();
                }
            }

            Register::DmaCtrl => self.write_dma_ctrl(value),
            Register::DmaSrc => self.dma_src = value,
            Register::DmaDst => self.dma_dst = value,
            Register::DmaLen => self.dma_len = value,

            Register::Swap => {
                for class in decode_swap(value) {
                    // A refusal is latched in STATUS by the orchestrator.
                    let _ = self.core.swap_buffers(class);
                }
            }

            Register::Status | Register::DmaStatus => {
                log::debug!("Write to read-only {} ignored", reg);
            }

            Register::Unknown(offset) => {
                self.stats.unknown += 1;
                log::warn!("Write to unmapped register 0x{:02X} ignored (value 0x{:08X})", offset, value);
            }
        }
    }

    /// Read a 32-bit value from a register offset. Unmapped offsets read 0.
    pub fn read_register(&mut self, offset: u32) -> u32 {
        self.stats.reads += 1;
        match Register::decode(offset) {
            Register::Ctrl => (self.core.irq_enable() as u32) << ctrl::IRQ_ENABLE_BIT,
            Register::Status => self.core.status().to_word(),
            Register::Cmd(index) => self.cmd[index as usize],
            Register::DmaCtrl => 0,
            Register::DmaSrc => self.dma_src,
            Register::DmaDst => self.dma_dst,
            Register::DmaLen => self.dma_len,
            Register::DmaStatus => self.core.dma().status_word(),
            Register::Swap => 0,
            Register::Unknown(offset) => {
                self.stats.unknown += 1;
                log::debug!("Read of unmapped register 0x{:02X}", offset);
                0
            }
        }
    }

    /// Stage a descriptor and push it, the way a driver would.
    pub fn write_descriptor(&mut self, descriptor: &CommandDescriptor) {
        for (i, word) in descriptor.to_words().into_iter().enumerate() {
            self.write_register(Register::Cmd(i as u8).offset(), word);
        }
    }

    fn write_ctrl(&mut self, value: u32) {
        let w = CtrlWrite::decode(value);
        self.core.set_irq_enable(w.irq_enable);
        if w.clear {
            self.core.clear();
        }
        if w.flush {
            self.core.flush();
        }
        if w.start {
            self.core.start();
        }
    }

    fn commit_descriptor(&mut self) {
        let descriptor = CommandDescriptor::from_words(self.cmd);
        if self.core.push(descriptor).is_ok() {
            self.stats.descriptors_pushed += 1;
        }
    }

    fn write_dma_ctrl(&mut self, value: u32) {
        let w = DmaCtrlWrite::decode(value);
        if !w.start {
            return;
        }
        let Some(routing) = w.routing else {
            log::warn!("DMA start with reserved routing mode ignored (DMA_CTRL=0x{:08X})", value);
            return;
        };
        let descriptor = self.transfer_descriptor(w.direction, routing);
        match self.core.start_transfer(descriptor) {
            Ok(ticket) => {
                self.stats.transfers_started += 1;
                log::debug!("MMIO DMA #{} started", ticket);
            }
            Err(e) => log::warn!("DMA start rejected: {}", e),
        }
    }

    fn transfer_descriptor(&self, direction: TransferDirection, routing: BufferClass) -> TransferDescriptor {
        let burst = self.core.config().max_burst_beats;
        match direction {
            TransferDirection::ExternalToInternal => {
                TransferDescriptor::load(self.dma_src, self.dma_dst, self.dma_len, routing, burst)
            }
            TransferDirection::InternalToExternal => {
                TransferDescriptor::store(self.dma_src, self.dma_dst, self.dma_len, routing, burst)
            }
        }
    }
}
