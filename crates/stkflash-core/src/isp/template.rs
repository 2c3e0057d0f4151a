//! Instruction templates and the generic encoder/decoder

use core::fmt;
use core::str::FromStr;

use super::BitOp;
use crate::error::TemplateError;

/// Number of bits in one ISP instruction
pub const INSTRUCTION_BITS: usize = 32;

/// A 32-bit ISP instruction in transmission order (byte 0 is sent first)
pub type Instruction = [u8; 4];

/// Declarative description of one 32-bit ISP instruction
///
/// Bit 31 is the most significant bit of instruction byte 0, bit 0 the least
/// significant bit of instruction byte 3. Templates can only be obtained
/// through validating constructors, so every template in hand has exactly
/// 32 roles with in-range indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "std",
    derive(serde::Deserialize),
    serde(try_from = "alloc::string::String")
)]
pub struct InstructionTemplate {
    bits: [BitOp; INSTRUCTION_BITS],
}

impl InstructionTemplate {
    /// Build a template from roles in transmission order (MSB of byte 0 first)
    pub fn new(roles: &[BitOp]) -> Result<Self, TemplateError> {
        if roles.len() != INSTRUCTION_BITS {
            return Err(TemplateError::WrongLength { found: roles.len() });
        }

        let mut bits = [BitOp::Ignore; INSTRUCTION_BITS];
        for (position, role) in roles.iter().enumerate() {
            if let Some((index, max)) = role.index_limit() {
                if index > max {
                    return Err(TemplateError::IndexOutOfRange { position, index });
                }
            }
            bits[INSTRUCTION_BITS - 1 - position] = *role;
        }
        Ok(Self { bits })
    }

    /// Role of instruction bit `bit` (0 = LSB of byte 3), if it exists
    pub fn role(&self, bit: usize) -> Option<BitOp> {
        self.bits.get(bit).copied()
    }

    /// Byte index and mask of an instruction bit
    fn locate(bit: usize) -> (usize, u8) {
        (3 - bit / 8, 1 << (bit % 8))
    }

    fn put(buf: &mut Instruction, bit: usize, value: bool) {
        let (byte, mask) = Self::locate(bit);
        if value {
            buf[byte] |= mask;
        } else {
            buf[byte] &= !mask;
        }
    }

    /// Write every fixed-0 and fixed-1 bit into `buf`
    pub fn encode_fixed_bits(&self, buf: &mut Instruction) {
        for (bit, role) in self.bits.iter().enumerate() {
            match role {
                BitOp::Zero => Self::put(buf, bit, false),
                BitOp::One => Self::put(buf, bit, true),
                _ => {}
            }
        }
    }

    /// Write the address-role bits of `address` into `buf`
    pub fn encode_address(&self, buf: &mut Instruction, address: u32) {
        for (bit, role) in self.bits.iter().enumerate() {
            if let BitOp::Address(n) = *role {
                Self::put(buf, bit, (address >> n) & 1 != 0);
            }
        }
    }

    /// Write the input-role bits of `data` into `buf`
    pub fn encode_input(&self, buf: &mut Instruction, data: u8) {
        for (bit, role) in self.bits.iter().enumerate() {
            if let BitOp::Input(n) = *role {
                Self::put(buf, bit, (data >> n) & 1 != 0);
            }
        }
    }

    /// Collect the output-role bits of a target response into a byte
    pub fn decode_output(&self, response: &Instruction) -> u8 {
        let mut value = 0u8;
        for (bit, role) in self.bits.iter().enumerate() {
            if let BitOp::Output(n) = *role {
                let (byte, mask) = Self::locate(bit);
                if response[byte] & mask != 0 {
                    value |= 1 << n;
                }
            }
        }
        value
    }

    /// Which instruction byte carries the output bits
    ///
    /// `None` for write-only instructions.
    pub fn output_byte_index(&self) -> Option<usize> {
        self.bits
            .iter()
            .position(|role| matches!(role, BitOp::Output(_)))
            .map(|bit| Self::locate(bit).0)
    }

    /// Whether any bit carries address information
    pub fn uses_address(&self) -> bool {
        self.bits.iter().any(|role| matches!(role, BitOp::Address(_)))
    }

    /// Build a complete instruction for `address` and input `data`
    pub fn build(&self, address: u32, data: u8) -> Instruction {
        let mut buf = [0u8; 4];
        self.encode_fixed_bits(&mut buf);
        self.encode_address(&mut buf, address);
        self.encode_input(&mut buf, data);
        buf
    }
}

impl FromStr for InstructionTemplate {
    type Err = TemplateError;

    /// Parse the conventional 32-token notation
    ///
    /// ```text
    /// 0 0 1 0  0 0 0 0   a15 a14 a13 a12 a11 a10 a9 a8   a7 a6 a5 a4 a3 a2 a1 a0   o o o o o o o o
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut roles = [BitOp::Ignore; INSTRUCTION_BITS];
        let mut count = 0usize;

        for token in s.split_whitespace() {
            if count < INSTRUCTION_BITS {
                let position_in_byte = 7 - (count % 8) as u8;
                roles[count] = BitOp::parse_token(token, position_in_byte)
                    .ok_or(TemplateError::UnknownToken { position: count })?;
            }
            count += 1;
        }

        if count != INSTRUCTION_BITS {
            return Err(TemplateError::WrongLength { found: count });
        }
        Self::new(&roles)
    }
}

impl TryFrom<alloc::string::String> for InstructionTemplate {
    type Error = TemplateError;

    fn try_from(s: alloc::string::String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for InstructionTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in (0..INSTRUCTION_BITS).rev() {
            write!(f, "{}", self.bits[bit])?;
            if bit > 0 {
                let sep = if bit % 8 == 0 { "  " } else { " " };
                f.write_str(sep)?;
            }
        }
        Ok(())
    }
}
