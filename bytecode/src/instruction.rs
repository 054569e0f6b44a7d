use core::fmt;

use crate::op::Op;

/// Decoded inline operand of an [`Instruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// One unsigned byte (slot, local, field offset, sub-opcode).
    Byte(u8),
    /// A signed value from a byte, half word or word operand, or from a
    /// `Wide*` prefixed branch/literal.
    Int(i32),
    Long(i64),
    /// `stableswitch` header: default offset and key range. The jump table
    /// entries follow and are not decoded individually.
    Switch { default: i32, low: i32, high: i32 },
}

/// A decoded instruction, with any `Wide*` prefix folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Byte offset of the first byte (the prefix, when present).
    pub offset: usize,
    /// Total encoded length in bytes, prefix included.
    pub length: usize,
    pub op: Op,
    /// The prefix opcode, if the instruction was widened.
    pub prefix: Option<Op>,
    pub operand: Operand,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = self.prefix {
            write!(f, "[{}] ", prefix.mnemonic())?;
        }
        f.write_str(self.op.mnemonic())?;
        match self.operand {
            Operand::None => Ok(()),
            Operand::Byte(b) => write!(f, " {b}"),
            Operand::Int(v) => write!(f, " {v}"),
            Operand::Long(v) => write!(f, " {v}"),
            Operand::Switch { default, low, high } => {
                write!(f, " default={default} [{low}..{high}]")
            }
        }
    }
}
