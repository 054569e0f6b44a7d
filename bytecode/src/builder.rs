use crate::op::{FloatOp, LongOp, Op};

/// A forward branch whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::branch`]. Resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the i16 offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the branch instruction (base for relative offset).
    base: usize,
}

/// Pending offsets of a `stableswitch` emitted by
/// [`BytecodeBuilder::stable_switch`].
#[derive(Debug)]
pub struct SwitchTable {
    default_pos: usize,
    table_pos: usize,
    low: i32,
    high: i32,
}

/// Builds a bytecode byte sequence.
///
/// All inline operands are written big-endian, which is the order the
/// interpreter fetches them in regardless of the image byte order.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn emit_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn emit_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn patch_i16(&mut self, pos: usize, v: i16) {
        self.buf[pos..pos + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Emit an opcode without operands.
    pub fn op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    /// Emit an opcode followed by a single unsigned byte operand.
    pub fn op_u8(&mut self, op: Op, operand: u8) {
        self.op(op);
        self.emit_u8(operand);
    }

    /// Emit one of the 16-entry short forms (`Const0`, `Load0`, ...) when
    /// `n < 16`, otherwise `long_form` with a byte operand.
    fn short_or_byte(&mut self, base: Op, long_form: Op, n: u8) {
        if n < 16 {
            self.emit_u8(base as u8 + n);
        } else {
            self.op_u8(long_form, n);
        }
    }

    // ── constants ──────────────────────────────────────────────────

    /// Push an int constant using the shortest encoding.
    pub fn const_int(&mut self, value: i32) {
        match value {
            0..=15 => self.emit_u8(Op::Const0 as u8 + value as u8),
            -1 => self.op(Op::ConstM1),
            _ => {
                if let Ok(v) = i8::try_from(value) {
                    self.op_u8(Op::ConstByte, v as u8);
                } else if let Ok(v) = i16::try_from(value) {
                    self.op(Op::ConstShort);
                    self.emit_i16(v);
                } else {
                    self.op(Op::ConstInt);
                    self.emit_i32(value);
                }
            }
        }
    }

    pub fn const_char(&mut self, value: u16) {
        self.op(Op::ConstChar);
        self.emit_i16(value as i16);
    }

    pub fn const_long(&mut self, value: i64) {
        self.op(Op::ConstLong);
        self.emit_i64(value);
    }

    pub fn const_float(&mut self, value: f32) {
        self.op(Op::ConstFloat);
        self.emit_i32(value.to_bits() as i32);
    }

    pub fn const_double(&mut self, value: f64) {
        self.op(Op::ConstDouble);
        self.emit_i64(value.to_bits() as i64);
    }

    pub fn const_null(&mut self) {
        self.op(Op::ConstNull);
    }

    /// Push entry `index` of the current class's object reference table.
    pub fn object(&mut self, index: u16) {
        self.literal(Op::Object0, Op::Object, index);
    }

    /// Push the class named by entry `index` of the current class's class
    /// reference table.
    pub fn class(&mut self, index: u16) {
        self.literal(Op::Class0, Op::Class, index);
    }

    fn literal(&mut self, base: Op, long_form: Op, index: u16) {
        if let Ok(n) = u8::try_from(index) {
            self.short_or_byte(base, long_form, n);
        } else {
            self.op(Op::WideHalf);
            self.op(long_form);
            self.emit_i16(index as i16);
        }
    }

    // ── locals ─────────────────────────────────────────────────────

    pub fn load(&mut self, local: u8) {
        self.short_or_byte(Op::Load0, Op::Load, local);
    }

    pub fn store(&mut self, local: u8) {
        self.short_or_byte(Op::Store0, Op::Store, local);
    }

    pub fn load_i2(&mut self, local: u8) {
        self.op_u8(Op::LoadI2, local);
    }

    pub fn store_i2(&mut self, local: u8) {
        self.op_u8(Op::StoreI2, local);
    }

    pub fn inc(&mut self, local: u8) {
        self.op_u8(Op::Inc, local);
    }

    pub fn dec(&mut self, local: u8) {
        self.op_u8(Op::Dec, local);
    }

    /// `extend` reserving `nstack` operand stack words for the method.
    pub fn extend(&mut self, nstack: u8) {
        self.short_or_byte(Op::Extend0, Op::Extend, nstack);
    }

    // ── branches ───────────────────────────────────────────────────

    /// Emit a forward branch. Returns a [`Label`] that must be bound with
    /// [`bind`](Self::bind).
    ///
    /// The branch always uses the `WideHalf` form so the offset can be
    /// patched without moving code.
    pub fn branch(&mut self, op: Op) -> Label {
        debug_assert!(op.is_branch(), "{op:?} is not a branch");
        self.op(Op::WideHalf);
        self.op(op);
        let offset_pos = self.buf.len();
        self.emit_i16(0);
        Label {
            offset_pos,
            base: self.buf.len(),
        }
    }

    /// Resolve a forward branch to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        let offset = (target as isize - label.base as isize) as i16;
        self.patch_i16(label.offset_pos, offset);
    }

    /// Emit a branch to an already known offset (usually a loop head).
    pub fn branch_to(&mut self, op: Op, target: usize) {
        debug_assert!(op.is_branch(), "{op:?} is not a branch");
        // short form: op, i8; the offset is relative to the end of the
        // instruction
        let short = target as isize - (self.buf.len() as isize + 2);
        if let Ok(v) = i8::try_from(short) {
            self.op_u8(op, v as u8);
            return;
        }
        let wide = target as isize - (self.buf.len() as isize + 4);
        match i16::try_from(wide) {
            Ok(v) => {
                self.op(Op::WideHalf);
                self.op(op);
                self.emit_i16(v);
            }
            Err(_) => {
                let full = target as isize - (self.buf.len() as isize + 6);
                self.op(Op::WideFull);
                self.op(op);
                self.emit_i32(full as i32);
            }
        }
    }

    /// Emit a `stableswitch` over `[low, high]`. Every entry and the
    /// default initially fall through to the end of the table.
    pub fn stable_switch(&mut self, low: i32, high: i32) -> SwitchTable {
        debug_assert!(low <= high);
        // The padded form keeps the jump table half-word aligned.
        if (self.buf.len() + 1) % 2 == 1 {
            self.op(Op::StableswitchPad);
            self.emit_u8(0);
        } else {
            self.op(Op::Stableswitch);
        }
        let default_pos = self.buf.len();
        self.emit_i16(0);
        self.emit_i32(low);
        self.emit_i32(high);
        let table_pos = self.buf.len();
        for _ in low..=high {
            self.emit_i16(0);
        }
        let end = self.buf.len();
        let table = SwitchTable {
            default_pos,
            table_pos,
            low,
            high,
        };
        let fallthrough = (end - table_pos) as i16;
        self.patch_i16(default_pos, fallthrough);
        for key in low..=high {
            self.patch_i16(table.entry_pos(key), fallthrough);
        }
        table
    }

    /// Point the default arm of `table` at the current position.
    pub fn bind_switch_default(&mut self, table: &SwitchTable) {
        let offset = (self.buf.len() - table.table_pos) as i16;
        self.patch_i16(table.default_pos, offset);
    }

    /// Point the arm for `key` at the current position.
    pub fn bind_switch_case(&mut self, table: &SwitchTable, key: i32) {
        debug_assert!(key >= table.low && key <= table.high);
        let offset = (self.buf.len() - table.table_pos) as i16;
        self.patch_i16(table.entry_pos(key), offset);
    }

    // ── invokes and misc ───────────────────────────────────────────

    /// Any invoke family opcode with its slot operand.
    pub fn invoke(&mut self, op: Op, slot: u8) {
        self.op_u8(op, slot);
    }

    pub fn long_op(&mut self, op: LongOp) {
        self.op(Op::LongOp);
        self.emit_u8(op as u8);
    }

    pub fn float_op(&mut self, op: FloatOp) {
        self.op(Op::FloatOp);
        self.emit_u8(op as u8);
    }

    pub fn methodid(&mut self, id: i32) {
        self.op(Op::Methodid);
        self.emit_i32(id);
    }
}

impl SwitchTable {
    fn entry_pos(&self, key: i32) -> usize {
        self.table_pos + 2 * (key - self.low) as usize
    }

    pub fn low(&self) -> i32 {
        self.low
    }

    pub fn high(&self) -> i32 {
        self.high
    }
}
