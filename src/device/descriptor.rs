//! Command descriptor model and 128-bit wire format.
//!
//! A descriptor is the unit of work pushed into the [`CommandQueue`]. It is
//! immutable once pushed and owned by the queue until it retires.
//!
//! # Wire Format
//!
//! ```text
//!  127      120 119 118 117 116 115 114 113        96 95            64
//! +-----------+---+---+---+---+---+---+-------------+----------------+
//! |  opcode   |chn|irq|xfr|pak|wid|dfl|   tile id   |  output base   |
//! +-----------+---+---+---+---+---+---+-------------+----------------+
//!  63             32 31          16 15       8 7    4 3    0
//! +-----------------+--------------+----------+------+------+
//! | activation base | weight base  |  K tile  | Msel | Nsel |
//! +-----------------+--------------+----------+------+------+
//! ```
//!
//! On the byte level a descriptor is four little-endian 32-bit words, word 0
//! holding bits 31:0.
//!
//! [`CommandQueue`]: super::queue::CommandQueue

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use super::registers_spec::descriptor as f;
use super::tritone_spec::DESCRIPTOR_BYTES;

/// Descriptor operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Retire immediately without touching the datapath.
    Nop,
    /// Tiled matrix multiply through the compute array.
    ComputeTile,
    /// Vector reduction over the activation buffer.
    Reduce,
    /// Encoding with no defined operation. Retires with an execution error.
    Unknown(u8),
}

impl Opcode {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            f::OPCODE_NOP => Opcode::Nop,
            f::OPCODE_COMPUTE_TILE => Opcode::ComputeTile,
            f::OPCODE_REDUCE => Opcode::Reduce,
            other => Opcode::Unknown(other),
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Opcode::Nop => f::OPCODE_NOP,
            Opcode::ComputeTile => f::OPCODE_COMPUTE_TILE,
            Opcode::Reduce => f::OPCODE_REDUCE,
            Opcode::Unknown(bits) => bits,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Nop => write!(f, "NOP"),
            Opcode::ComputeTile => write!(f, "COMPUTE_TILE"),
            Opcode::Reduce => write!(f, "REDUCE"),
            Opcode::Unknown(bits) => write!(f, "UNKNOWN(0x{:02X})", bits),
        }
    }
}

/// Dataflow mode of the compute array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dataflow {
    /// Partial sums stay in place while weights and activations stream.
    OutputStationary,
    /// Weights are loaded once per tile and held while activations stream.
    #[default]
    WeightStationary,
}

/// Errors from decoding a descriptor out of raw bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// Fewer than 16 bytes supplied.
    #[error("incomplete descriptor: need {needed} bytes, have {have}")]
    Incomplete {
        /// Bytes needed.
        needed: usize,
        /// Bytes available.
        have: usize,
    },
    /// Text form is not a 128-bit hexadecimal number.
    #[error("invalid descriptor literal '{0}'")]
    InvalidLiteral(String),
}

/// A decoded command descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub opcode: Opcode,
    /// Proceed to the next queued descriptor without returning to idle.
    pub chain: bool,
    /// Latch the interrupt-pending flag when this descriptor retires.
    pub irq_enable: bool,
    /// Stage operands through the transfer engine from external memory.
    pub use_transfer: bool,
    /// Weights are packed 2-bit ternary values, 16 per word.
    pub pack_weights: bool,
    /// Keep full 32-bit partial sums instead of saturating to 16 bits.
    pub wide_accumulator: bool,
    pub dataflow: Dataflow,
    /// Free-form tag (18 bits), carried for tracing only.
    pub tile_id: u32,
    pub output_base: u32,
    pub activation_base: u32,
    pub weight_base: u16,
    /// K dimension of the tile (element count for reductions).
    pub k_tile: u8,
    /// Number of row tiles (4 bits).
    pub m_sel: u8,
    /// Number of column tiles (4 bits). Selects the operation for reductions.
    pub n_sel: u8,
}

impl Default for CommandDescriptor {
    fn default() -> Self {
        Self::nop()
    }
}

impl CommandDescriptor {
    /// A no-op descriptor.
    pub fn nop() -> Self {
        Self {
            opcode: Opcode::Nop,
            chain: false,
            irq_enable: false,
            use_transfer: false,
            pack_weights: false,
            wide_accumulator: false,
            dataflow: Dataflow::WeightStationary,
            tile_id: 0,
            output_base: 0,
            activation_base: 0,
            weight_base: 0,
            k_tile: 0,
            m_sel: 0,
            n_sel: 0,
        }
    }

    /// A weight-stationary compute descriptor over `m_sel x n_sel` tiles.
    pub fn compute_tile(k_tile: u8, m_sel: u8, n_sel: u8) -> Self {
        Self {
            opcode: Opcode::ComputeTile,
            k_tile,
            m_sel: m_sel & 0xF,
            n_sel: n_sel & 0xF,
            ..Self::nop()
        }
    }

    /// A reduction over `len` activation words with the given op code.
    pub fn reduce(len: u8, op: u8) -> Self {
        Self {
            opcode: Opcode::Reduce,
            k_tile: len,
            n_sel: op & 0xF,
            ..Self::nop()
        }
    }

    /// Set operand base addresses.
    pub fn with_bases(mut self, weight: u16, activation: u32, output: u32) -> Self {
        self.weight_base = weight;
        self.activation_base = activation;
        self.output_base = output;
        self
    }

    pub fn with_chain(mut self) -> Self {
        self.chain = true;
        self
    }

    pub fn with_irq(mut self) -> Self {
        self.irq_enable = true;
        self
    }

    pub fn with_transfer(mut self) -> Self {
        self.use_transfer = true;
        self
    }

    pub fn with_packed_weights(mut self) -> Self {
        self.pack_weights = true;
        self
    }

    pub fn with_wide_accumulator(mut self) -> Self {
        self.wide_accumulator = true;
        self
    }

    pub fn with_dataflow(mut self, dataflow: Dataflow) -> Self {
        self.dataflow = dataflow;
        self
    }

    pub fn with_tile_id(mut self, tile_id: u32) -> Self {
        self.tile_id = tile_id & f::TILE_ID_MASK as u32;
        self
    }

    /// Decode a 128-bit descriptor. Every bit pattern decodes.
    pub fn decode(raw: u128) -> Self {
        let bit = |pos: u32| (raw >> pos) & 1 == 1;
        Self {
            opcode: Opcode::from_bits(((raw >> f::OPCODE_SHIFT) & f::OPCODE_MASK) as u8),
            chain: bit(f::CHAIN_BIT),
            irq_enable: bit(f::IRQ_BIT),
            use_transfer: bit(f::USE_TRANSFER_BIT),
            pack_weights: bit(f::PACK_WEIGHTS_BIT),
            wide_accumulator: bit(f::WIDE_ACC_BIT),
            dataflow: if bit(f::DATAFLOW_BIT) {
                Dataflow::WeightStationary
            } else {
                Dataflow::OutputStationary
            },
            tile_id: ((raw >> f::TILE_ID_SHIFT) & f::TILE_ID_MASK) as u32,
            output_base: ((raw >> f::OUTPUT_BASE_SHIFT) & f::ADDR32_MASK) as u32,
            activation_base: ((raw >> f::ACTIVATION_BASE_SHIFT) & f::ADDR32_MASK) as u32,
            weight_base: ((raw >> f::WEIGHT_BASE_SHIFT) & f::WEIGHT_BASE_MASK) as u16,
            k_tile: ((raw >> f::K_TILE_SHIFT) & f::K_TILE_MASK) as u8,
            m_sel: ((raw >> f::M_SEL_SHIFT) & f::SEL_MASK) as u8,
            n_sel: ((raw >> f::N_SEL_SHIFT) & f::SEL_MASK) as u8,
        }
    }

    /// Encode into the 128-bit wire format.
    pub fn encode(&self) -> u128 {
        let flag = |set: bool, pos: u32| if set { 1u128 << pos } else { 0 };
        ((self.opcode.to_bits() as u128) << f::OPCODE_SHIFT)
            | flag(self.chain, f::CHAIN_BIT)
            | flag(self.irq_enable, f::IRQ_BIT)
            | flag(self.use_transfer, f::USE_TRANSFER_BIT)
            | flag(self.pack_weights, f::PACK_WEIGHTS_BIT)
            | flag(self.wide_accumulator, f::WIDE_ACC_BIT)
            | flag(self.dataflow == Dataflow::WeightStationary, f::DATAFLOW_BIT)
            | (((self.tile_id as u128) & f::TILE_ID_MASK) << f::TILE_ID_SHIFT)
            | ((self.output_base as u128) << f::OUTPUT_BASE_SHIFT)
            | ((self.activation_base as u128) << f::ACTIVATION_BASE_SHIFT)
            | ((self.weight_base as u128) << f::WEIGHT_BASE_SHIFT)
            | ((self.k_tile as u128) << f::K_TILE_SHIFT)
            | (((self.m_sel as u128) & f::SEL_MASK) << f::M_SEL_SHIFT)
            | (((self.n_sel as u128) & f::SEL_MASK) << f::N_SEL_SHIFT)
    }

    /// Split into the four 32-bit register words, word 0 = bits 31:0.
    pub fn to_words(&self) -> [u32; 4] {
        let raw = self.encode();
        [raw as u32, (raw >> 32) as u32, (raw >> 64) as u32, (raw >> 96) as u32]
    }

    /// Reassemble from four 32-bit register words.
    pub fn from_words(words: [u32; 4]) -> Self {
        let raw = words
            .iter()
            .enumerate()
            .fold(0u128, |acc, (i, w)| acc | ((*w as u128) << (32 * i)));
        Self::decode(raw)
    }

    /// Parse from 16 little-endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() < DESCRIPTOR_BYTES {
            return Err(DescriptorError::Incomplete {
                needed: DESCRIPTOR_BYTES,
                have: bytes.len(),
            });
        }
        let mut cursor = Cursor::new(&bytes[..DESCRIPTOR_BYTES]);
        let mut words = [0u32; 4];
        for word in words.iter_mut() {
            *word = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| DescriptorError::Incomplete { needed: DESCRIPTOR_BYTES, have: bytes.len() })?;
        }
        Ok(Self::from_words(words))
    }

    /// Serialize to 16 little-endian bytes.
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_BYTES] {
        let mut out = [0u8; DESCRIPTOR_BYTES];
        let mut cursor = Cursor::new(&mut out[..]);
        for word in self.to_words() {
            // Cursor over a fixed 16-byte buffer cannot run short for 4 words.
            let _ = cursor.write_u32::<LittleEndian>(word);
        }
        out
    }

    /// Parse a hexadecimal literal (optional `0x` prefix, `_` separators allowed).
    pub fn parse_hex(text: &str) -> Result<Self, DescriptorError> {
        let cleaned: String = text
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X")
            .chars()
            .filter(|c| *c != '_')
            .collect();
        u128::from_str_radix(&cleaned, 16)
            .map(Self::decode)
            .map_err(|_| DescriptorError::InvalidLiteral(text.to_string()))
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tile_id={} k={} m_sel={} n_sel={} w=0x{:04X} a=0x{:08X} o=0x{:08X}",
            self.opcode, self.tile_id, self.k_tile, self.m_sel, self.n_sel,
            self.weight_base, self.activation_base, self.output_base
        )?;
        let flags: Vec<&str> = [
            (self.chain, "chain"),
            (self.irq_enable, "irq"),
            (self.use_transfer, "xfer"),
            (self.pack_weights, "packed"),
            (self.wide_accumulator, "wide"),
            (self.dataflow == Dataflow::OutputStationary, "os"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        if !flags.is_empty() {
            write!(f, " [{}]", flags.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_positions() {
        let desc = CommandDescriptor {
            opcode: Opcode::ComputeTile,
            chain: true,
            irq_enable: false,
            use_transfer: true,
            pack_weights: false,
            wide_accumulator: true,
            dataflow: Dataflow::WeightStationary,
            tile_id: 0x2_0001,
            output_base: 0xAABB_CCDD,
            activation_base: 0x1122_3344,
            weight_base: 0x5566,
            k_tile: 0x77,
            m_sel: 0x8,
            n_sel: 0x9,
        };
        let raw = desc.encode();

        assert_eq!(raw >> 120, 0x01);
        assert_eq!((raw >> 119) & 1, 1);
        assert_eq!((raw >> 118) & 1, 0);
        assert_eq!((raw >> 117) & 1, 1);
        assert_eq!((raw >> 116) & 1, 0);
        assert_eq!((raw >> 115) & 1, 1);
        assert_eq!((raw >> 114) & 1, 1);
        assert_eq!((raw >> 96) & 0x3_FFFF, 0x2_0001);
        assert_eq!((raw >> 64) as u32, 0xAABB_CCDD);
        assert_eq!((raw >> 32) as u32, 0x1122_3344);
        assert_eq!(((raw >> 16) & 0xFFFF) as u16, 0x5566);
        assert_eq!(((raw >> 8) & 0xFF) as u8, 0x77);
        assert_eq!(((raw >> 4) & 0xF) as u8, 0x8);
        assert_eq!((raw & 0xF) as u8, 0x9);

        assert_eq!(CommandDescriptor::decode(raw), desc);
    }

    #[test]
    fn test_unknown_opcode_is_explicit() {
        let raw = 0x7Fu128 << 120;
        let desc = CommandDescriptor::decode(raw);
        assert_eq!(desc.opcode, Opcode::Unknown(0x7F));
        // Dataflow bit clear means output-stationary
        assert_eq!(desc.dataflow, Dataflow::OutputStationary);
        assert_eq!(desc.encode(), raw);
    }

    #[test]
    fn test_words_little_endian_order() {
        let desc = CommandDescriptor::compute_tile(8, 1, 2).with_bases(0x10, 0x2000, 0x3000);
        let words = desc.to_words();
        assert_eq!(words[0] & 0xF, 2);
        assert_eq!((words[0] >> 4) & 0xF, 1);
        assert_eq!(words[1], 0x2000);
        assert_eq!(words[2], 0x3000);
        assert_eq!(words[3] >> 24, 0x01);

        let bytes = desc.to_bytes();
        assert_eq!(bytes[0], words[0] as u8);
        assert_eq!(bytes[15], 0x01);
        assert_eq!(CommandDescriptor::from_bytes(&bytes).unwrap(), desc);
    }

    #[test]
    fn test_from_bytes_too_short() {
        let err = CommandDescriptor::from_bytes(&[0u8; 10]).unwrap_err();
        assert_eq!(err, DescriptorError::Incomplete { needed: 16, have: 10 });
    }

    #[test]
    fn test_parse_hex() {
        let desc = CommandDescriptor::parse_hex("0x0144_0000_0000_0000_0000_0000_0000_0811").unwrap();
        assert_eq!(desc.opcode, Opcode::ComputeTile);
        assert!(desc.irq_enable);
        assert!(!desc.chain);
        assert_eq!(desc.k_tile, 8);
        assert_eq!(desc.m_sel, 1);
        assert_eq!(desc.n_sel, 1);

        assert!(CommandDescriptor::parse_hex("not-hex").is_err());
    }

    #[test]
    fn test_display_lists_flags() {
        let desc = CommandDescriptor::reduce(4, 0).with_chain().with_irq();
        let text = desc.to_string();
        assert!(text.starts_with("REDUCE"));
        assert!(text.contains("[chain,irq]"));

        let plain = CommandDescriptor::nop().to_string();
        assert!(!plain.contains('['));
        let all = CommandDescriptor::compute_tile(2, 1, 1).with_transfer().with_packed_weights().with_wide_accumulator();
        assert!(all.to_string().ends_with("[xfer,packed,wide]"));
    }
}
