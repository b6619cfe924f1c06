//! Double-buffered, bank-interleaved on-chip storage.
//!
//! Each store holds two physical copies of its bank set. Reads observe the
//! active copy while writes land in the shadow copy, so a producer can fill
//! the next generation while a consumer reads the current one.
//!
//! ```text
//!   address ──► bank = address % N, offset = address / N
//!
//!            bank 0   bank 1   ...  bank N-1
//!   set A  [ ....  ][ ....  ]     [ ....  ]   ◄── active (reads)
//!   set B  [ ....  ][ ....  ]     [ ....  ]   ◄── shadow (writes)
//!
//!   swap(): active ^= 1
//! ```
//!
//! The flip is crate-private. Outside the crate only the orchestrator's
//! gated swap can change generations.

use std::fmt;

use thiserror::Error;

use super::tritone_spec::BANK_SET_COPIES;

/// Storage access errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("bank {bank} out of range (store has {num_banks} banks)")]
    BankOutOfRange { bank: usize, num_banks: usize },

    #[error("offset {offset} out of range (bank depth {depth})")]
    OffsetOutOfRange { offset: usize, depth: usize },

    #[error("word address 0x{address:X} beyond store capacity of {capacity} words")]
    AddressOutOfRange { address: u32, capacity: usize },
}

/// Which of the three internal buffers a component targets.
///
/// Also serves as the transfer engine's routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferClass {
    Weight,
    Activation,
    Output,
}

impl BufferClass {
    pub const ALL: [BufferClass; 3] = [BufferClass::Weight, BufferClass::Activation, BufferClass::Output];

    /// Decode a 2-bit routing field. 3 is reserved.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(BufferClass::Weight),
            1 => Some(BufferClass::Activation),
            2 => Some(BufferClass::Output),
            _ => None,
        }
    }

    pub fn to_bits(self) -> u32 {
        self.index() as u32
    }

    pub fn index(self) -> usize {
        match self {
            BufferClass::Weight => 0,
            BufferClass::Activation => 1,
            BufferClass::Output => 2,
        }
    }
}

impl fmt::Display for BufferClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferClass::Weight => write!(f, "weight"),
            BufferClass::Activation => write!(f, "activation"),
            BufferClass::Output => write!(f, "output"),
        }
    }
}

/// One double-buffered bank set.
#[derive(Debug, Clone)]
pub struct BankedStore {
    num_banks: usize,
    bank_depth: usize,
    /// `sets[copy][bank][offset]`
    sets: [Vec<Vec<i32>>; BANK_SET_COPIES],
    active: usize,
    generation: u64,
    reads: u64,
    writes: u64,
}

impl BankedStore {
    pub fn new(num_banks: usize, bank_depth: usize) -> Self {
        let bank_set = || vec![vec![0i32; bank_depth]; num_banks];
        Self {
            num_banks,
            bank_depth,
            sets: [bank_set(), bank_set()],
            active: 0,
            generation: 0,
            reads: 0,
            writes: 0,
        }
    }

    pub fn num_banks(&self) -> usize {
        self.num_banks
    }

    pub fn bank_depth(&self) -> usize {
        self.bank_depth
    }

    /// Total word capacity of one copy.
    pub fn capacity(&self) -> usize {
        self.num_banks * self.bank_depth
    }

    /// Index of the copy reads currently observe (0 = A, 1 = B).
    pub fn active_set(&self) -> usize {
        self.active
    }

    /// Number of swaps performed since construction.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bank an address maps to. Does not check capacity.
    #[inline]
    pub fn bank_of(&self, address: u32) -> usize {
        address as usize % self.num_banks
    }

    /// Split a word address into `(bank, offset)`.
    pub fn locate(&self, address: u32) -> Result<(usize, usize), StoreError> {
        let bank = address as usize % self.num_banks;
        let offset = address as usize / self.num_banks;
        if offset >= self.bank_depth {
            return Err(StoreError::AddressOutOfRange {
                address,
                capacity: self.capacity(),
            });
        }
        Ok((bank, offset))
    }

    fn check(&self, bank: usize, offset: usize) -> Result<(), StoreError> {
        if bank >= self.num_banks {
            return Err(StoreError::BankOutOfRange { bank, num_banks: self.num_banks });
        }
        if offset >= self.bank_depth {
            return Err(StoreError::OffsetOutOfRange { offset, depth: self.bank_depth });
        }
        Ok(())
    }

    /// Read from the active set.
    pub fn read(&mut self, bank: usize, offset: usize) -> Result<i32, StoreError> {
        self.check(bank, offset)?;
        self.reads += 1;
        Ok(self.sets[self.active][bank][offset])
    }

    /// Write to the shadow set.
    pub fn write(&mut self, bank: usize, offset: usize, value: i32) -> Result<(), StoreError> {
        self.check(bank, offset)?;
        self.writes += 1;
        self.sets[self.active ^ 1][bank][offset] = value;
        Ok(())
    }

    pub fn read_addr(&mut self, address: u32) -> Result<i32, StoreError> {
        let (bank, offset) = self.locate(address)?;
        self.read(bank, offset)
    }

    pub fn write_addr(&mut self, address: u32, value: i32) -> Result<(), StoreError> {
        let (bank, offset) = self.locate(address)?;
        self.write(bank, offset, value)
    }

    /// Flip the active selector. O(1), no data moves.
    pub(crate) fn swap(&mut self) {
        self.active ^= 1;
        self.generation += 1;
        log::debug!("Bank set swap -> active={} gen={}", self.active, self.generation);
    }

    /// Backdoor write into the active set (host initialization, tests).
    /// Bypasses arbitration.
    pub fn preload_active(&mut self, base: u32, words: &[i32]) -> Result<(), StoreError> {
        for (i, &w) in words.iter().enumerate() {
            let (bank, offset) = self.locate(base + i as u32)?;
            self.sets[self.active][bank][offset] = w;
        }
        Ok(())
    }

    /// Backdoor read of `len` words from the active set.
    pub fn snapshot_active(&self, base: u32, len: usize) -> Result<Vec<i32>, StoreError> {
        self.snapshot(self.active, base, len)
    }

    /// Backdoor read of `len` words from the shadow set.
    pub fn snapshot_shadow(&self, base: u32, len: usize) -> Result<Vec<i32>, StoreError> {
        self.snapshot(self.active ^ 1, base, len)
    }

    fn snapshot(&self, set: usize, base: u32, len: usize) -> Result<Vec<i32>, StoreError> {
        (0..len)
            .map(|i| {
                let (bank, offset) = self.locate(base + i as u32)?;
                Ok(self.sets[set][bank][offset])
            })
            .collect()
    }

    /// Access counts `(reads, writes)`.
    pub fn access_counts(&self) -> (u64, u64) {
        (self.reads, self.writes)
    }
}

/// The three stores of the core, one per buffer class.
#[derive(Debug, Clone)]
pub struct StorageBuffers {
    stores: [BankedStore; 3],
}

impl StorageBuffers {
    pub fn new(num_banks: usize, bank_depth: usize) -> Self {
        Self {
            stores: [
                BankedStore::new(num_banks, bank_depth),
                BankedStore::new(num_banks, bank_depth),
                BankedStore::new(num_banks, bank_depth),
            ],
        }
    }

    pub fn get(&self, class: BufferClass) -> &BankedStore {
        &self.stores[class.index()]
    }

    pub fn get_mut(&mut self, class: BufferClass) -> &mut BankedStore {
        &mut self.stores[class.index()]
    }

    pub fn weight(&self) -> &BankedStore {
        self.get(BufferClass::Weight)
    }

    pub fn activation(&self) -> &BankedStore {
        self.get(BufferClass::Activation)
    }

    pub fn output(&self) -> &BankedStore {
        self.get(BufferClass::Output)
    }

    pub(crate) fn swap(&mut self, class: BufferClass) {
        self.get_mut(class).swap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaving() {
        let store = BankedStore::new(8, 16);
        assert_eq!(store.locate(0).unwrap(), (0, 0));
        assert_eq!(store.locate(7).unwrap(), (7, 0));
        assert_eq!(store.locate(8).unwrap(), (0, 1));
        assert_eq!(store.locate(13).unwrap(), (5, 1));
        assert_eq!(store.capacity(), 128);
        assert!(matches!(store.locate(128), Err(StoreError::AddressOutOfRange { .. })));
    }

    #[test]
    fn test_double_buffer_round_trip() {
        let mut store = BankedStore::new(4, 8);
        store.write(2, 3, 42).unwrap();

        // Not visible until swap
        assert_eq!(store.read(2, 3).unwrap(), 0);

        store.swap();
        assert_eq!(store.read(2, 3).unwrap(), 42);
        assert_eq!(store.generation(), 1);
        assert_eq!(store.active_set(), 1);

        // Old active set is now the shadow and still holds its data (zero)
        store.swap();
        assert_eq!(store.read(2, 3).unwrap(), 0);
        assert_eq!(store.generation(), 2);
    }

    #[test]
    fn test_out_of_range() {
        let mut store = BankedStore::new(4, 8);
        assert_eq!(store.read(4, 0), Err(StoreError::BankOutOfRange { bank: 4, num_banks: 4 }));
        assert_eq!(store.write(0, 8, 1), Err(StoreError::OffsetOutOfRange { offset: 8, depth: 8 }));
        assert_eq!(store.access_counts(), (0, 0));
    }

    #[test]
    fn test_preload_and_snapshot() {
        let mut store = BankedStore::new(4, 8);
        store.preload_active(5, &[1, 2, 3]).unwrap();
        assert_eq!(store.snapshot_active(5, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.read_addr(6).unwrap(), 2);
        assert_eq!(store.snapshot_shadow(5, 3).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_storage_buffers_are_independent() {
        let mut bufs = StorageBuffers::new(4, 4);
        bufs.get_mut(BufferClass::Weight).preload_active(0, &[9]).unwrap();
        bufs.swap(BufferClass::Activation);
        assert_eq!(bufs.weight().generation(), 0);
        assert_eq!(bufs.activation().generation(), 1);
        assert_eq!(bufs.output().snapshot_active(0, 1).unwrap(), vec![0]);
        assert_eq!(bufs.weight().snapshot_active(0, 1).unwrap(), vec![9]);
    }

    #[test]
    fn test_buffer_class_bits() {
        for class in BufferClass::ALL {
            assert_eq!(BufferClass::from_bits(class.to_bits()), Some(class));
        }
        assert_eq!(BufferClass::from_bits(3), None);
    }
}
