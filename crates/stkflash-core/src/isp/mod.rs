//! AVR serial programming instruction codec
//!
//! Every low-level ISP operation is a 32-bit instruction clocked into the
//! target as four bytes. Which bits are fixed, which carry the address and
//! which carry data differs per operation and per memory, so it is described
//! declaratively by an [`InstructionTemplate`] of 32 [`BitOp`] roles and one
//! generic routine encodes or decodes any of them.

mod bitop;
mod operation;
mod template;

pub use bitop::BitOp;
pub use operation::Operation;
pub use template::{Instruction, InstructionTemplate, INSTRUCTION_BITS};
