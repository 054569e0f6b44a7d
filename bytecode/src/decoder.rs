use crate::instruction::{Instruction, Operand};
use crate::op::Op;

/// Decodes a bytecode byte slice into [`Instruction`]s.
///
/// Unlike the interpreter, the decoder is total: an unknown opcode or a
/// truncated operand ends the stream (`decode_next` returns `None`), which
/// is what the instruction tracer wants when it is pointed at arbitrary
/// memory.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Whether the decoder has reached the end of the bytecode.
    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `None` at end-of-stream.
    pub fn decode_next(&mut self) -> Option<Instruction> {
        let start = self.pos;
        let result = self.decode(start);
        if result.is_none() {
            self.pos = self.bytes.len();
        }
        result
    }

    fn decode(&mut self, start: usize) -> Option<Instruction> {
        let op = Op::try_from(self.read_u8()?).ok()?;
        let (op, prefix, operand) = match op {
            Op::WideHalf => {
                let next = Op::try_from(self.read_u8()?).ok()?;
                (next, Some(op), Operand::Int(self.read_i16()? as i32))
            }
            Op::WideFull => {
                let next = Op::try_from(self.read_u8()?).ok()?;
                (next, Some(op), Operand::Int(self.read_i32()?))
            }
            _ if op.short_form_base() == Some(Op::Wide0) => {
                let high = ((op as u8 & 15) as i32) << 8;
                let next = Op::try_from(self.read_u8()?).ok()?;
                let low = self.read_u8()? as i32;
                // sign-extend the 12 bit offset
                let value = ((high | low) << 20) >> 20;
                (next, Some(op), Operand::Int(value))
            }
            _ => (op, None, self.decode_operand(op)?),
        };
        Some(Instruction {
            offset: start,
            length: self.pos - start,
            op,
            prefix,
            operand,
        })
    }

    fn decode_operand(&mut self, op: Op) -> Option<Operand> {
        use Op::*;
        let operand = match op {
            ConstByte => Operand::Int(self.read_u8()? as i8 as i32),
            ConstShort => Operand::Int(self.read_i16()? as i32),
            ConstChar => Operand::Int(self.read_i16()? as u16 as i32),
            ConstInt | ConstFloat | Methodid => Operand::Int(self.read_i32()?),
            ConstLong | ConstDouble => Operand::Long(self.read_i64()?),
            Ifeq | Ifne | Iflt | Ifle | Ifgt | Ifge | IfIcmpeq | IfIcmpne
            | IfIcmplt | IfIcmple | IfIcmpgt | IfIcmpge | Goto => {
                Operand::Int(self.read_u8()? as i8 as i32)
            }
            StableswitchPad | Stableswitch => {
                if op == StableswitchPad {
                    self.read_u8()?;
                }
                let default = self.read_i16()? as i32;
                let low = self.read_i32()?;
                let high = self.read_i32()?;
                self.skip(2 * (high.checked_sub(low)? as usize + 1))?;
                Operand::Switch { default, low, high }
            }
            Tableswitch => {
                let default = self.read_i32()?;
                let low = self.read_i32()?;
                let high = self.read_i32()?;
                self.skip(4 * (high.checked_sub(low)? as usize + 1))?;
                Operand::Switch { default, low, high }
            }
            Object | Class | Load | Store | Extend | Inc | Dec | LoadI2
            | StoreI2 | LongOp | FloatOp | Invokeinit | Invokeinterface
            | Invokestatic | Invokesuper | Invokevirtual | Invokenative
            | Invokeinit1 | Invokeinterface1 | Invokestatic1 | Invokesuper1
            | Invokevirtual1 | Invokenative1 | Invokeinit2 | Invokeinterface2
            | Invokestatic2 | Invokesuper2 | Invokevirtual2 | Invokenative2
            | Getstatic | Putstatic | ClassGetstatic | ClassPutstatic
            | Getfield | Putfield | ThisGetfield | ThisPutfield | GetstaticO
            | GetstaticI2 | ClassGetstaticO | ClassGetstaticI2 | PutstaticO
            | PutstaticI2 | ClassPutstaticO | ClassPutstaticI2 | GetfieldB
            | GetfieldS | GetfieldC | GetfieldI2 | PutfieldB | PutfieldS
            | PutfieldO | PutfieldI2 | ThisGetfieldB | ThisGetfieldS
            | ThisGetfieldC | ThisGetfieldI2 | ThisPutfieldB | ThisPutfieldS
            | ThisPutfieldO | ThisPutfieldI2 => Operand::Byte(self.read_u8()?),
            _ => Operand::None,
        };
        Some(operand)
    }

    // ── raw reads ──────────────────────────────────────────────────

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.bytes.get(self.pos..self.pos + N)?;
        self.pos += N;
        bytes.try_into().ok()
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.bytes.len() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    fn read_i16(&mut self) -> Option<i16> {
        self.take::<2>().map(i16::from_be_bytes)
    }

    fn read_i32(&mut self) -> Option<i32> {
        self.take::<4>().map(i32::from_be_bytes)
    }

    fn read_i64(&mut self) -> Option<i64> {
        self.take::<8>().map(i64::from_be_bytes)
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        self.decode_next()
    }
}
