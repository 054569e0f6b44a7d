//! The instruction switch.

use std::cmp::Ordering;

use bytecode::{FloatOp, LongOp, Op};

use super::{Interpreter, Step, SupportCall};
use crate::class;
use crate::collector::Heap;
use crate::error::VmResult;
use crate::fatal;
use crate::frames;
use crate::header;
use crate::heap::ObjectMemory;
use crate::layout::*;
use crate::memory::Memory;

/// Element width of an array or field access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Byte,
    Short,
    Char,
    Word,
    Long,
}

/// How a static field is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Static {
    Word,
    Oop,
    Long,
}

impl Interpreter {
    pub(super) fn step(&mut self, heap: &mut Heap) -> VmResult<Step> {
        let start = self.ip;
        let byte = self.fetch_u8(&heap.om.mem);
        let op = Op::try_from(byte).map_err(|b| fatal!("bad opcode 0x{b:02x} at 0x{start:x}"))?;
        self.execute(heap, op, start, None)
    }

    fn execute(&mut self, heap: &mut Heap, op: Op, start: u32, wide: Option<i32>) -> VmResult<Step> {
        if let Some(base) = op.short_form_base() {
            let n = (op as u8 & 15) as i32;
            let mem = &mut heap.om.mem;
            match base {
                Op::Const0 => self.push(mem, n as u32),
                Op::Object0 => self.push_object_literal(mem, n),
                Op::Class0 => self.push_class_literal(&mut heap.om, n),
                Op::Load0 => {
                    let value = mem.get_word(self.lp, n);
                    self.push(mem, value);
                }
                Op::Store0 => {
                    let value = self.pop(mem);
                    mem.set_word(self.lp, n, value);
                }
                Op::Wide0 => return self.widened(heap, start, op),
                Op::Extend0 => return self.extend(heap, start, n as u32),
                _ => return Err(fatal!("bad short form {op:?}")),
            }
            return Ok(Step::Continue);
        }

        let mem = &mut heap.om.mem;
        match op {
            // ── Constants and literals ────────────────────────────────
            Op::ConstM1 => self.push(mem, u32::MAX),
            Op::ConstNull => self.push(mem, 0),
            Op::ConstByte => {
                let v = self.fetch_i8(mem) as i32;
                self.push(mem, v as u32);
            }
            Op::ConstShort => {
                let v = self.fetch_i16(mem) as i32;
                self.push(mem, v as u32);
            }
            Op::ConstChar => {
                let v = self.fetch_u16(mem) as u32;
                self.push(mem, v);
            }
            Op::ConstInt | Op::ConstFloat => {
                let v = self.fetch_i32(mem);
                self.push(mem, v as u32);
            }
            Op::ConstLong | Op::ConstDouble => {
                let v = self.fetch_i64(mem);
                self.push_long(mem, v);
            }
            Op::Object => {
                let index = match wide {
                    Some(v) => v,
                    None => self.fetch_u8(mem) as i32,
                };
                self.push_object_literal(mem, index);
            }
            Op::Class => {
                let index = match wide {
                    Some(v) => v,
                    None => self.fetch_u8(mem) as i32,
                };
                self.push_class_literal(&mut heap.om, index);
            }
            Op::WideHalf | Op::WideFull => return self.widened(heap, start, op),

            // ── Locals ────────────────────────────────────────────────
            Op::Load => {
                let n = self.fetch_u8(mem) as i32;
                let value = mem.get_word(self.lp, n);
                self.push(mem, value);
            }
            Op::Store => {
                let n = self.fetch_u8(mem) as i32;
                let value = self.pop(mem);
                mem.set_word(self.lp, n, value);
            }
            Op::LoadI2 => {
                let n = self.fetch_u8(mem) as i32;
                let value = mem.get_long_at_word(self.lp, n);
                self.push_long(mem, value);
            }
            Op::StoreI2 => {
                let n = self.fetch_u8(mem) as i32;
                let value = self.pop_long(mem);
                mem.set_long_at_word(self.lp, n, value);
            }
            Op::Inc | Op::Dec => {
                let n = self.fetch_u8(mem) as i32;
                let delta = if op == Op::Inc { 1 } else { u32::MAX };
                let value = mem.get_word(self.lp, n).wrapping_add(delta);
                mem.set_word(self.lp, n, value);
            }
            Op::Extend => {
                let nstack = self.fetch_u8(mem) as u32;
                return self.extend(heap, start, nstack);
            }

            // ── Branches and switches ─────────────────────────────────
            Op::Ifeq | Op::Ifne | Op::Iflt | Op::Ifle | Op::Ifgt | Op::Ifge => {
                let offset = self.branch_offset(mem, wide);
                let l = self.pop(mem) as i32;
                let taken = match op {
                    Op::Ifeq => l == 0,
                    Op::Ifne => l != 0,
                    Op::Iflt => l < 0,
                    Op::Ifle => l <= 0,
                    Op::Ifgt => l > 0,
                    _ => l >= 0,
                };
                return Ok(self.branch(taken, offset));
            }
            Op::IfIcmpeq | Op::IfIcmpne | Op::IfIcmplt | Op::IfIcmple | Op::IfIcmpgt | Op::IfIcmpge => {
                let offset = self.branch_offset(mem, wide);
                let r = self.pop(mem) as i32;
                let l = self.pop(mem) as i32;
                let taken = match op {
                    Op::IfIcmpeq => l == r,
                    Op::IfIcmpne => l != r,
                    Op::IfIcmplt => l < r,
                    Op::IfIcmple => l <= r,
                    Op::IfIcmpgt => l > r,
                    _ => l >= r,
                };
                return Ok(self.branch(taken, offset));
            }
            Op::Goto => {
                let offset = self.branch_offset(mem, wide);
                return Ok(self.branch(true, offset));
            }
            Op::StableswitchPad | Op::Stableswitch => {
                if op == Op::StableswitchPad {
                    self.ip += 1;
                }
                let key = self.pop(mem) as i32;
                let mut offset = self.fetch_i16(mem) as i32;
                let low = self.fetch_i32(mem);
                let high = self.fetch_i32(mem);
                let table = self.ip;
                if key >= low && key <= high {
                    offset = mem.fetch_i16(table + ((key - low) as u32) * 2) as i32;
                }
                self.ip = table.wrapping_add_signed(offset);
            }
            Op::Tableswitch => {
                let key = self.pop(mem) as i32;
                let mut offset = self.fetch_i32(mem);
                let low = self.fetch_i32(mem);
                let high = self.fetch_i32(mem);
                let table = self.ip;
                if key >= low && key <= high {
                    offset = mem.fetch_i32(table + ((key - low) as u32) * 4);
                }
                self.ip = table.wrapping_add_signed(offset);
            }
            Op::Lookup | Op::LookupB | Op::LookupS | Op::LookupC => {
                let array = self.pop(mem);
                let key = self.pop(mem) as i32;
                if array == 0 {
                    return Ok(self.raise(mem, SupportCall::NullPointerException));
                }
                let count = header::get_array_element_count(mem, array) as i32;
                let found = (0..count).find(|&i| {
                    let element = match op {
                        Op::Lookup => mem.get_word(array, i) as i32,
                        Op::LookupB => mem.get_byte(array, i) as i32,
                        Op::LookupS => mem.get_half(array, i) as i32,
                        _ => mem.get_unsigned_half(array, i) as i32,
                    };
                    element == key
                });
                self.push(mem, found.unwrap_or(-1) as u32);
            }

            // ── Invokes ───────────────────────────────────────────────
            Op::Invokevirtual | Op::Invokevirtual1 | Op::Invokevirtual2 => {
                let slot = self.fetch_u8(mem) as u32;
                return self.invoke_virtual(mem, slot);
            }
            Op::Invokesuper | Op::Invokesuper1 | Op::Invokesuper2 => {
                let slot = self.fetch_u8(mem) as u32;
                self.push_frame(mem);
                let klass = self.pop(mem);
                let (klass, mp) = find_virtual(mem, klass, slot)?;
                self.cp = klass;
                self.setup_frame(mem, mp);
            }
            Op::Invokestatic
            | Op::Invokestatic1
            | Op::Invokestatic2
            | Op::Invokeinit
            | Op::Invokeinit1
            | Op::Invokeinit2 => {
                let slot = self.fetch_u8(mem) as i32;
                self.push_frame(mem);
                self.cp = self.pop(mem);
                let mp = mem.get_word(class::static_methods(mem, self.cp), slot);
                if mp == 0 {
                    return Err(fatal!(
                        "static method {slot} of class {} is missing",
                        class::get_type(mem, self.cp)
                    ));
                }
                self.setup_frame(mem, mp);
            }
            Op::Invokeinterface | Op::Invokeinterface1 | Op::Invokeinterface2 => {
                let slot = self.fetch_u8(mem) as u32;
                return self.invoke_interface(mem, slot);
            }
            Op::Invokenative | Op::Invokenative1 | Op::Invokenative2 => {
                self.pop(mem);
                let number = self.fetch_u8(mem);
                return self.invoke_native(heap, number);
            }
            Op::Return | Op::Return1 | Op::Return2 => {
                let old_sp = self.sp;
                self.pop_frame(mem)?;
                match op {
                    Op::Return1 => {
                        let value = mem.read_word(old_sp);
                        self.push(mem, value);
                    }
                    Op::Return2 => {
                        let value = mem.get_long_at_word(old_sp, -1);
                        self.push_long(mem, value);
                    }
                    _ => {}
                }
            }
            Op::Throw => {
                let exception = if self.gc_worked {
                    self.pop(mem)
                } else {
                    self.ip = frames::frame_ip(mem, self.lp);
                    self.gc_worked = true;
                    let oom = heap.om.root(Segment::Ram, root::OUT_OF_MEMORY_OBJECT);
                    if oom == 0 {
                        return Err(fatal!("out of memory and no OutOfMemoryError instance"));
                    }
                    log::debug!(target: "squawk::interp", "throwing OutOfMemoryError");
                    oom
                };
                if exception == 0 {
                    return Ok(self.raise(&heap.om.mem, SupportCall::NullPointerException));
                }
                return self.throw(heap, exception);
            }

            // ── Allocation and class initialisation ───────────────────
            Op::Newobject => {
                let om = &mut heap.om;
                let mut obj = om.mem.get_word(self.lp, 0);
                if obj == 0 {
                    obj = om.new_instance(self.cp);
                    if obj == 0 {
                        return Ok(self.suspend_for_gc(&mut om.mem, start));
                    }
                }
                om.mem.set_word(self.lp, 0, obj);
                if class::access(&om.mem, self.cp) & ACC_HASFINALIZER != 0 {
                    self.push(&mut om.mem, obj);
                    return Ok(Step::Call(SupportCall::RegisterForFinalization));
                }
            }
            Op::Newarray => return Ok(Step::Call(SupportCall::NewArray)),
            Op::Newdimension => return Ok(Step::Call(SupportCall::NewDimension)),
            Op::Clinit | Op::ClassClinit => {
                let klass = if op == Op::ClassClinit { self.cp } else { self.pop(mem) };
                let om = &mut heap.om;
                if class::access(&om.mem, klass) & ACC_MUSTCLINIT != 0 && om.find_class_state(klass) == 0 {
                    self.push(&mut om.mem, klass);
                    return Ok(Step::Call(SupportCall::InitializeClass));
                }
            }

            // ── Arrays ────────────────────────────────────────────────
            Op::Aload => return Ok(self.aload(mem, Width::Word)),
            Op::AloadB => return Ok(self.aload(mem, Width::Byte)),
            Op::AloadS => return Ok(self.aload(mem, Width::Short)),
            Op::AloadC => return Ok(self.aload(mem, Width::Char)),
            Op::AloadI2 => return Ok(self.aload(mem, Width::Long)),
            Op::Astore => return Ok(self.astore(&mut heap.om, Width::Word)),
            Op::AstoreB => return Ok(self.astore(&mut heap.om, Width::Byte)),
            Op::AstoreS => return Ok(self.astore(&mut heap.om, Width::Short)),
            Op::AstoreI2 => return Ok(self.astore(&mut heap.om, Width::Long)),
            Op::AstoreO => return Ok(self.astore_oop(&mut heap.om)),
            Op::Arraylength => {
                let array = self.pop(mem);
                if array == 0 {
                    return Ok(self.raise(mem, SupportCall::NullPointerException));
                }
                let count = header::get_array_element_count(mem, array);
                self.push(mem, count);
            }

            // ── Fields ────────────────────────────────────────────────
            Op::Getfield => return Ok(self.get_field(mem, Width::Word, false)),
            Op::GetfieldB => return Ok(self.get_field(mem, Width::Byte, false)),
            Op::GetfieldS => return Ok(self.get_field(mem, Width::Short, false)),
            Op::GetfieldC => return Ok(self.get_field(mem, Width::Char, false)),
            Op::GetfieldI2 => return Ok(self.get_field(mem, Width::Long, false)),
            Op::ThisGetfield => return Ok(self.get_field(mem, Width::Word, true)),
            Op::ThisGetfieldB => return Ok(self.get_field(mem, Width::Byte, true)),
            Op::ThisGetfieldS => return Ok(self.get_field(mem, Width::Short, true)),
            Op::ThisGetfieldC => return Ok(self.get_field(mem, Width::Char, true)),
            Op::ThisGetfieldI2 => return Ok(self.get_field(mem, Width::Long, true)),
            Op::Putfield => return Ok(self.put_field(&mut heap.om, Width::Word, false)),
            Op::PutfieldB => return Ok(self.put_field(&mut heap.om, Width::Byte, false)),
            Op::PutfieldS => return Ok(self.put_field(&mut heap.om, Width::Short, false)),
            Op::PutfieldI2 => return Ok(self.put_field(&mut heap.om, Width::Long, false)),
            Op::PutfieldO => return Ok(self.put_field_oop(&mut heap.om, false)),
            Op::ThisPutfield => return Ok(self.put_field(&mut heap.om, Width::Word, true)),
            Op::ThisPutfieldB => return Ok(self.put_field(&mut heap.om, Width::Byte, true)),
            Op::ThisPutfieldS => return Ok(self.put_field(&mut heap.om, Width::Short, true)),
            Op::ThisPutfieldI2 => return Ok(self.put_field(&mut heap.om, Width::Long, true)),
            Op::ThisPutfieldO => return Ok(self.put_field_oop(&mut heap.om, true)),

            // ── Statics ───────────────────────────────────────────────
            Op::Getstatic | Op::GetstaticO => return Ok(self.get_static(&mut heap.om, Static::Word, false)),
            Op::GetstaticI2 => return Ok(self.get_static(&mut heap.om, Static::Long, false)),
            Op::ClassGetstatic | Op::ClassGetstaticO => {
                return Ok(self.get_static(&mut heap.om, Static::Word, true));
            }
            Op::ClassGetstaticI2 => return Ok(self.get_static(&mut heap.om, Static::Long, true)),
            Op::Putstatic => return Ok(self.put_static(&mut heap.om, Static::Word, false)),
            Op::PutstaticO => return Ok(self.put_static(&mut heap.om, Static::Oop, false)),
            Op::PutstaticI2 => return Ok(self.put_static(&mut heap.om, Static::Long, false)),
            Op::ClassPutstatic => return Ok(self.put_static(&mut heap.om, Static::Word, true)),
            Op::ClassPutstaticO => return Ok(self.put_static(&mut heap.om, Static::Oop, true)),
            Op::ClassPutstaticI2 => return Ok(self.put_static(&mut heap.om, Static::Long, true)),

            // ── Integer arithmetic and comparisons ────────────────────
            Op::Iadd | Op::Isub | Op::Imul | Op::Iand | Op::Ior | Op::Ixor | Op::Ishl | Op::Ishr | Op::Iushr => {
                let r = self.pop(mem) as i32;
                let l = self.pop(mem) as i32;
                let result = match op {
                    Op::Iadd => l.wrapping_add(r),
                    Op::Isub => l.wrapping_sub(r),
                    Op::Imul => l.wrapping_mul(r),
                    Op::Iand => l & r,
                    Op::Ior => l | r,
                    Op::Ixor => l ^ r,
                    Op::Ishl => l.wrapping_shl((r & 31) as u32),
                    Op::Ishr => l >> (r & 31),
                    _ => ((l as u32) >> (r & 31)) as i32,
                };
                self.push(mem, result as u32);
            }
            Op::Idiv | Op::Irem => {
                let r = self.pop(mem) as i32;
                let l = self.pop(mem) as i32;
                if r == 0 {
                    return Ok(self.raise(mem, SupportCall::ArithmeticException));
                }
                let result = if op == Op::Idiv { l.wrapping_div(r) } else { l.wrapping_rem(r) };
                self.push(mem, result as u32);
            }
            Op::Neg => {
                let v = self.pop(mem) as i32;
                self.push(mem, v.wrapping_neg() as u32);
            }
            Op::I2b => {
                let v = self.pop(mem) as i8 as i32;
                self.push(mem, v as u32);
            }
            Op::I2s => {
                let v = self.pop(mem) as i16 as i32;
                self.push(mem, v as u32);
            }
            Op::I2c => {
                let v = self.pop(mem) as u16 as u32;
                self.push(mem, v);
            }
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let r = self.pop(mem) as i32;
                let l = self.pop(mem) as i32;
                let result = match op {
                    Op::Eq => l == r,
                    Op::Ne => l != r,
                    Op::Lt => l < r,
                    Op::Le => l <= r,
                    Op::Gt => l > r,
                    _ => l >= r,
                };
                self.push(mem, result as u32);
            }
            Op::LongOp => return self.long_op(mem),
            Op::FloatOp => return self.float_op(mem),

            // ── Monitors and type checks ──────────────────────────────
            Op::Monitorenter | Op::Monitorexit | Op::ClassMonitorenter | Op::ClassMonitorexit => {
                let obj = match op {
                    Op::ClassMonitorenter | Op::ClassMonitorexit => self.cp,
                    _ => self.pop(mem),
                };
                if obj == 0 {
                    return Ok(self.raise(mem, SupportCall::NullPointerException));
                }
                self.push(mem, obj);
                return Ok(Step::Call(match op {
                    Op::Monitorenter | Op::ClassMonitorenter => SupportCall::MonitorEnter,
                    _ => SupportCall::MonitorExit,
                }));
            }
            Op::Instanceof => {
                let klass = self.pop(mem);
                let obj = self.pop(mem);
                if obj != 0 && klass != 0 && heap.om.is_simply_assignable(obj, klass) {
                    self.push(&mut heap.om.mem, 1);
                    return Ok(Step::Continue);
                }
                let mem = &mut heap.om.mem;
                self.push(mem, obj);
                self.push(mem, klass);
                return Ok(Step::Call(SupportCall::InstanceOf));
            }
            Op::Checkcast => {
                let klass = self.pop(mem);
                let obj = self.pop(mem);
                if obj == 0 || heap.om.is_simply_assignable(obj, klass) {
                    self.push(&mut heap.om.mem, obj);
                    return Ok(Step::Continue);
                }
                let mem = &mut heap.om.mem;
                self.push(mem, obj);
                self.push(mem, klass);
                return Ok(Step::Call(SupportCall::Checkcast));
            }

            // ── Misc ──────────────────────────────────────────────────
            Op::Pop => {
                self.pop(mem);
            }
            Op::Nop => {}
            Op::Bpt => return Ok(Step::Call(SupportCall::Breakpoint)),
            Op::Methodid => self.ip += 4,

            _ => return Err(fatal!("opcode {op:?} at 0x{start:x} not handled")),
        }
        Ok(Step::Continue)
    }

    // ── Prefixes and frame setup ──────────────────────────────────────

    fn widened(&mut self, heap: &mut Heap, start: u32, prefix: Op) -> VmResult<Step> {
        let mem = &heap.om.mem;
        let byte = self.fetch_u8(mem);
        let op = Op::try_from(byte)
            .ok()
            .filter(|op| op.accepts_wide_prefix())
            .ok_or_else(|| fatal!("bad wide opcode 0x{byte:02x} at 0x{start:x}"))?;
        let operand = match prefix {
            Op::WideHalf => self.fetch_i16(mem) as i32,
            Op::WideFull => self.fetch_i32(mem),
            _ => {
                let high = ((prefix as u8 & 15) as i32) << 8;
                let low = self.fetch_u8(mem) as i32;
                ((high | low) << 20) >> 20
            }
        };
        self.execute(heap, op, start, Some(operand))
    }

    /// Zero the locals of the frame just entered and reserve `nstack`
    /// operand words, moving the frame to a new chunk when the current one
    /// is too small.
    fn extend(&mut self, heap: &mut Heap, restart_ip: u32, nstack: u32) -> VmResult<Step> {
        let om = &mut heap.om;
        let mp = frames::frame_mp(&om.mem, self.lp);
        let nlocals = frames::method_nlocals(&om.mem, mp);
        let mut nsp = self.lp + frames::extended_stack_offset(nlocals);
        let ep = nsp + nstack * 4;

        let first_in_chunk = frames::frame_previous_lp(&om.mem, self.lp) == 0;
        let forced = om.very_excessive_gc() && !first_in_chunk;
        if ep >= self.sl || forced {
            if first_in_chunk {
                return Err(fatal!("frame of {} locals does not fit an empty chunk", nlocals));
            }
            let min_words = frames::min_chunk_words(nlocals, nstack);
            let cc = frames::chunk_from_frame(&om.mem, self.lp);
            let mut nc = frames::chunk_next(&om.mem, cc);
            frames::set_chunk_next(&mut om.mem, cc, 0);
            if forced || nc == 0 || frames::chunk_size(&om.mem, nc) < min_words {
                nc = om.new_stack_chunk(min_words);
            }
            let mem = &mut om.mem;
            if nc == 0 {
                frames::set_frame_stack_offset(mem, self.lp, self.sp.wrapping_sub(self.lp));
                return Ok(self.suspend_for_gc(mem, restart_ip));
            }

            self.sl = frames::chunk_limit(mem, nc);
            frames::set_chunk_prev(mem, nc, cc);
            frames::set_chunk_last_lp(mem, nc, 0);
            frames::set_chunk_next(mem, cc, nc);
            frames::set_chunk_last_lp(mem, cc, frames::frame_previous_lp(mem, self.lp));

            let new_lp = frames::first_lp(nc);
            frames::set_frame_previous_lp(mem, new_lp, 0);
            frames::set_frame_mp(mem, new_lp, mp);
            frames::set_frame_ip(mem, new_lp, frames::frame_ip(mem, self.lp));
            frames::set_frame_cp(mem, new_lp, frames::frame_cp(mem, self.lp));
            let parm_bytes = self.sp.wrapping_add(4) - self.lp;
            mem.copy_bytes(self.lp, new_lp, parm_bytes);
            self.lp = new_lp;
            self.sp = new_lp + parm_bytes - 4;
            nsp = new_lp + frames::extended_stack_offset(nlocals);
            if self.trace.contains(crate::config::TraceFlags::FRAMES) {
                log::debug!(
                    target: "squawk::interp",
                    "frame moved to chunk 0x{nc:x} ({} words) after 0x{cc:x}",
                    frames::chunk_size(mem, nc)
                );
            }
        }

        let mem = &mut om.mem;
        while self.sp < nsp {
            self.push(mem, 0);
        }
        frames::set_frame_stack_offset(mem, self.lp, self.sp - self.lp);
        Ok(Step::Continue)
    }

    // ── Literals ──────────────────────────────────────────────────────

    fn push_object_literal(&mut self, mem: &mut Memory, index: i32) {
        let refs = class::object_references(mem, self.cp);
        let value = mem.get_word(refs, index);
        self.push(mem, value);
    }

    fn push_class_literal(&mut self, om: &mut ObjectMemory, index: i32) {
        let refs = class::class_references(&om.mem, self.cp);
        let number = om.mem.get_unsigned_half(refs, index) as u32;
        let klass = om.class_from_cno(number);
        self.push(&mut om.mem, klass);
    }

    // ── Branches ──────────────────────────────────────────────────────

    fn branch_offset(&mut self, mem: &Memory, wide: Option<i32>) -> i32 {
        match wide {
            Some(v) => v,
            None => self.fetch_i8(mem) as i32,
        }
    }

    /// Offsets are relative to the end of the branch instruction. Every
    /// branch uses up part of the time slice.
    fn branch(&mut self, taken: bool, offset: i32) -> Step {
        if taken {
            self.ip = self.ip.wrapping_add_signed(offset);
        }
        self.bc -= 1;
        if self.bc > 0 {
            Step::Continue
        } else {
            Step::Call(SupportCall::Yield)
        }
    }

    // ── Invokes ───────────────────────────────────────────────────────

    /// Undo a frame push whose receiver turned out to be null.
    fn null_receiver(&mut self, mem: &Memory) -> Step {
        self.lp = frames::frame_previous_lp(mem, self.lp);
        self.raise(mem, SupportCall::NullPointerException)
    }

    fn invoke_virtual(&mut self, mem: &mut Memory, slot: u32) -> VmResult<Step> {
        self.push_frame(mem);
        let receiver = mem.get_word(self.lp, 0);
        if receiver == 0 {
            return Ok(self.null_receiver(mem));
        }
        let (klass, mp) = find_virtual(mem, header::get_class(mem, receiver), slot)?;
        self.cp = klass;
        self.setup_frame(mem, mp);
        Ok(Step::Continue)
    }

    fn invoke_interface(&mut self, mem: &mut Memory, slot: u32) -> VmResult<Step> {
        self.push_frame(mem);
        let interface = self.pop(mem);
        let interface_type = class::get_type(mem, interface);
        let receiver = mem.get_word(self.lp, 0);
        if receiver == 0 {
            return Ok(self.null_receiver(mem));
        }

        let mut klass = header::get_class(mem, receiver);
        let virtual_slot = loop {
            if klass == 0 {
                return Err(fatal!("receiver 0x{receiver:x} does not implement interface {interface_type}"));
            }
            let types = class::interface_types(mem, klass);
            let count = if types == 0 { 0 } else { header::get_array_element_count(mem, types) };
            if let Some(i) = (0..count as i32).find(|&i| mem.get_unsigned_half(types, i) as u32 == interface_type) {
                let table = mem.get_word(class::interface_slot_tables(mem, klass), i);
                break mem.get_unsigned_byte(table, slot as i32) as u32;
            }
            klass = class::super_class(mem, klass);
        };

        let (klass, mp) = find_virtual(mem, header::get_class(mem, receiver), virtual_slot)?;
        self.cp = klass;
        self.setup_frame(mem, mp);
        Ok(Step::Continue)
    }

    // ── Arrays and fields ─────────────────────────────────────────────

    fn array_fault(mem: &Memory, array: u32, index: i32) -> Option<SupportCall> {
        if array == 0 {
            Some(SupportCall::NullPointerException)
        } else if index < 0 || index as u32 >= header::get_array_element_count(mem, array) {
            Some(SupportCall::ArrayBoundsException)
        } else {
            None
        }
    }

    fn aload(&mut self, mem: &mut Memory, width: Width) -> Step {
        let index = self.pop(mem) as i32;
        let array = self.pop(mem);
        if let Some(fault) = Self::array_fault(mem, array, index) {
            return self.raise(mem, fault);
        }
        match width {
            Width::Long => {
                let value = mem.get_long(array, index);
                self.push_long(mem, value);
            }
            _ => {
                let value = load(mem, array, index, width);
                self.push(mem, value);
            }
        }
        Step::Continue
    }

    fn astore(&mut self, om: &mut ObjectMemory, width: Width) -> Step {
        let value = match width {
            Width::Long => self.pop_long(&om.mem),
            _ => self.pop(&om.mem) as i32 as i64,
        };
        let index = self.pop(&om.mem) as i32;
        let array = self.pop(&om.mem);
        if let Some(fault) = Self::array_fault(&om.mem, array, index) {
            return self.raise(&om.mem, fault);
        }
        if !writable(om, array) {
            return self.raise(&om.mem, SupportCall::IllegalStoreException);
        }
        match width {
            Width::Long => om.mem.set_long(array, index, value),
            _ => store(&mut om.mem, array, index, width, value as u32),
        }
        Step::Continue
    }

    fn astore_oop(&mut self, om: &mut ObjectMemory) -> Step {
        let value = self.pop(&om.mem);
        let index = self.pop(&om.mem) as i32;
        let array = self.pop(&om.mem);
        if let Some(fault) = Self::array_fault(&om.mem, array, index) {
            return self.raise(&om.mem, fault);
        }
        if value != 0 {
            let element = class::element_type(&om.mem, header::get_class(&om.mem, array));
            if !om.is_simply_assignable_to_cno(value, element) {
                let mem = &mut om.mem;
                self.push(mem, array);
                self.push(mem, index as u32);
                self.push(mem, value);
                return Step::Call(SupportCall::AstoreOop);
            }
        }
        if !om.set_oop(array, index, value) {
            return self.raise(&om.mem, SupportCall::IllegalStoreException);
        }
        Step::Continue
    }

    fn get_field(&mut self, mem: &mut Memory, width: Width, this: bool) -> Step {
        let obj = if this { mem.get_word(self.lp, 0) } else { self.pop(mem) };
        let offset = self.fetch_u8(mem) as i32;
        if obj == 0 {
            return self.raise(mem, SupportCall::NullPointerException);
        }
        match width {
            Width::Long => {
                let value = mem.get_long_at_word(obj, offset);
                self.push_long(mem, value);
            }
            _ => {
                let value = load(mem, obj, offset, width);
                self.push(mem, value);
            }
        }
        Step::Continue
    }

    fn put_field(&mut self, om: &mut ObjectMemory, width: Width, this: bool) -> Step {
        let value = match width {
            Width::Long => self.pop_long(&om.mem),
            _ => self.pop(&om.mem) as i32 as i64,
        };
        let obj = if this { om.mem.get_word(self.lp, 0) } else { self.pop(&om.mem) };
        let offset = self.fetch_u8(&om.mem) as i32;
        if obj == 0 {
            return self.raise(&om.mem, SupportCall::NullPointerException);
        }
        if !writable(om, obj) {
            return self.raise(&om.mem, SupportCall::IllegalStoreException);
        }
        match width {
            Width::Long => om.mem.set_long_at_word(obj, offset, value),
            _ => store(&mut om.mem, obj, offset, width, value as u32),
        }
        Step::Continue
    }

    fn put_field_oop(&mut self, om: &mut ObjectMemory, this: bool) -> Step {
        let value = self.pop(&om.mem);
        let obj = if this { om.mem.get_word(self.lp, 0) } else { self.pop(&om.mem) };
        let offset = self.fetch_u8(&om.mem) as i32;
        if obj == 0 {
            return self.raise(&om.mem, SupportCall::NullPointerException);
        }
        if !om.set_oop(obj, offset, value) {
            return self.raise(&om.mem, SupportCall::IllegalStoreException);
        }
        Step::Continue
    }

    // ── Statics ───────────────────────────────────────────────────────

    fn get_static(&mut self, om: &mut ObjectMemory, kind: Static, class_form: bool) -> Step {
        let offset = self.fetch_u8(&om.mem) as i32;
        let klass = if class_form { self.cp } else { self.pop(&om.mem) };
        let cs = om.find_class_state(klass);
        let mem = &mut om.mem;
        if cs != 0 {
            match kind {
                Static::Long => {
                    let value = mem.get_long_at_word(cs, offset);
                    self.push_long(mem, value);
                }
                _ => {
                    let value = mem.get_word(cs, offset);
                    self.push(mem, value);
                }
            }
            return Step::Continue;
        }
        self.push(mem, offset as u32);
        self.push(mem, klass);
        Step::Call(match kind {
            Static::Long => SupportCall::GetStaticLong,
            _ => SupportCall::GetStatic,
        })
    }

    fn put_static(&mut self, om: &mut ObjectMemory, kind: Static, class_form: bool) -> Step {
        let offset = self.fetch_u8(&om.mem) as i32;
        let klass = if class_form { self.cp } else { self.pop(&om.mem) };
        let value = match kind {
            Static::Long => self.pop_long(&om.mem),
            _ => self.pop(&om.mem) as i64,
        };
        let cs = om.find_class_state(klass);
        if cs != 0 {
            match kind {
                Static::Word => om.mem.set_word(cs, offset, value as u32),
                Static::Oop => om.set_oop_ram(cs, offset, value as u32),
                Static::Long => om.mem.set_long_at_word(cs, offset, value),
            }
            return Step::Continue;
        }
        let mem = &mut om.mem;
        match kind {
            Static::Long => self.push_long(mem, value),
            _ => self.push(mem, value as u32),
        }
        self.push(mem, offset as u32);
        self.push(mem, klass);
        Step::Call(match kind {
            Static::Word => SupportCall::PutStatic,
            Static::Oop => SupportCall::PutStaticObj,
            Static::Long => SupportCall::PutStaticLong,
        })
    }

    // ── Long and float sub-operations ─────────────────────────────────

    fn long_op(&mut self, mem: &mut Memory) -> VmResult<Step> {
        let byte = self.fetch_u8(mem);
        let op = LongOp::try_from(byte).map_err(|b| fatal!("bad long opcode 0x{b:02x}"))?;
        match op {
            LongOp::Lneg => {
                let v = self.pop_long(mem);
                self.push_long(mem, v.wrapping_neg());
            }
            LongOp::Lshl | LongOp::Lshr | LongOp::Lushr => {
                let r = (self.pop(mem) & 63) as u32;
                let l = self.pop_long(mem);
                let result = match op {
                    LongOp::Lshl => l.wrapping_shl(r),
                    LongOp::Lshr => l >> r,
                    _ => ((l as u64) >> r) as i64,
                };
                self.push_long(mem, result);
            }
            LongOp::I2l => {
                let v = self.pop(mem) as i32 as i64;
                self.push_long(mem, v);
            }
            LongOp::L2i => {
                let v = self.pop_long(mem) as i32;
                self.push(mem, v as u32);
            }
            LongOp::Lcmp => {
                let r = self.pop_long(mem);
                let l = self.pop_long(mem);
                self.push(mem, ordering_to_int(l.cmp(&r)) as u32);
            }
            _ => {
                let r = self.pop_long(mem);
                let l = self.pop_long(mem);
                let result = match op {
                    LongOp::Ladd => l.wrapping_add(r),
                    LongOp::Lsub => l.wrapping_sub(r),
                    LongOp::Lmul => l.wrapping_mul(r),
                    LongOp::Land => l & r,
                    LongOp::Lor => l | r,
                    LongOp::Lxor => l ^ r,
                    LongOp::Ldiv | LongOp::Lrem if r == 0 => {
                        return Ok(self.raise(mem, SupportCall::ArithmeticException));
                    }
                    LongOp::Ldiv => l.wrapping_div(r),
                    _ => l.wrapping_rem(r),
                };
                self.push_long(mem, result);
            }
        }
        Ok(Step::Continue)
    }

    fn float_op(&mut self, mem: &mut Memory) -> VmResult<Step> {
        let byte = self.fetch_u8(mem);
        let op = FloatOp::try_from(byte).map_err(|b| fatal!("bad float opcode 0x{b:02x}"))?;
        match op {
            FloatOp::Fadd | FloatOp::Fsub | FloatOp::Fmul | FloatOp::Fdiv | FloatOp::Frem => {
                let r = f32::from_bits(self.pop(mem));
                let l = f32::from_bits(self.pop(mem));
                let result = match op {
                    FloatOp::Fadd => l + r,
                    FloatOp::Fsub => l - r,
                    FloatOp::Fmul => l * r,
                    FloatOp::Fdiv => l / r,
                    _ => l % r,
                };
                self.push(mem, result.to_bits());
            }
            FloatOp::Fneg => {
                let v = f32::from_bits(self.pop(mem));
                self.push(mem, (-v).to_bits());
            }
            FloatOp::Fcmpg | FloatOp::Fcmpl => {
                let r = f32::from_bits(self.pop(mem));
                let l = f32::from_bits(self.pop(mem));
                let nan = if op == FloatOp::Fcmpg { 1 } else { -1 };
                let result = l.partial_cmp(&r).map_or(nan, ordering_to_int);
                self.push(mem, result as u32);
            }
            FloatOp::Dadd | FloatOp::Dsub | FloatOp::Dmul | FloatOp::Ddiv | FloatOp::Drem => {
                let r = f64::from_bits(self.pop_long(mem) as u64);
                let l = f64::from_bits(self.pop_long(mem) as u64);
                let result = match op {
                    FloatOp::Dadd => l + r,
                    FloatOp::Dsub => l - r,
                    FloatOp::Dmul => l * r,
                    FloatOp::Ddiv => l / r,
                    _ => l % r,
                };
                self.push_long(mem, result.to_bits() as i64);
            }
            FloatOp::Dneg => {
                let v = f64::from_bits(self.pop_long(mem) as u64);
                self.push_long(mem, (-v).to_bits() as i64);
            }
            FloatOp::Dcmpg | FloatOp::Dcmpl => {
                let r = f64::from_bits(self.pop_long(mem) as u64);
                let l = f64::from_bits(self.pop_long(mem) as u64);
                let nan = if op == FloatOp::Dcmpg { 1 } else { -1 };
                let result = l.partial_cmp(&r).map_or(nan, ordering_to_int);
                self.push(mem, result as u32);
            }
            FloatOp::I2f => {
                let v = self.pop(mem) as i32 as f32;
                self.push(mem, v.to_bits());
            }
            FloatOp::L2f => {
                let v = self.pop_long(mem) as f32;
                self.push(mem, v.to_bits());
            }
            FloatOp::F2i => {
                let v = f32::from_bits(self.pop(mem)) as i32;
                self.push(mem, v as u32);
            }
            FloatOp::F2l => {
                let v = f32::from_bits(self.pop(mem)) as i64;
                self.push_long(mem, v);
            }
            FloatOp::I2d => {
                let v = self.pop(mem) as i32 as f64;
                self.push_long(mem, v.to_bits() as i64);
            }
            FloatOp::L2d => {
                let v = self.pop_long(mem) as f64;
                self.push_long(mem, v.to_bits() as i64);
            }
            FloatOp::F2d => {
                let v = f32::from_bits(self.pop(mem)) as f64;
                self.push_long(mem, v.to_bits() as i64);
            }
            FloatOp::D2i => {
                let v = f64::from_bits(self.pop_long(mem) as u64) as i32;
                self.push(mem, v as u32);
            }
            FloatOp::D2l => {
                let v = f64::from_bits(self.pop_long(mem) as u64) as i64;
                self.push_long(mem, v);
            }
            FloatOp::D2f => {
                let v = f64::from_bits(self.pop_long(mem) as u64) as f32;
                self.push(mem, v.to_bits());
            }
        }
        Ok(Step::Continue)
    }
}

/// Walk up from `klass` to the class whose vtable defines `slot`.
pub(crate) fn find_virtual(mem: &Memory, mut klass: u32, slot: u32) -> VmResult<(u32, u32)> {
    while klass != 0 {
        let first = class::first_virtual_method(mem, klass);
        if slot >= first {
            let table = class::virtual_methods(mem, klass);
            let index = slot - first;
            if table != 0 && index < header::get_array_element_count(mem, table) {
                let mp = mem.get_word(table, index as i32);
                if mp != 0 {
                    return Ok((klass, mp));
                }
            }
        }
        klass = class::super_class(mem, klass);
    }
    Err(fatal!("no method for virtual slot {slot}"))
}

fn load(mem: &Memory, base: u32, index: i32, width: Width) -> u32 {
    match width {
        Width::Byte => mem.get_byte(base, index) as i32 as u32,
        Width::Short => mem.get_half(base, index) as i32 as u32,
        Width::Char => mem.get_unsigned_half(base, index) as u32,
        Width::Word | Width::Long => mem.get_word(base, index),
    }
}

fn store(mem: &mut Memory, base: u32, index: i32, width: Width, value: u32) {
    match width {
        Width::Byte => mem.set_byte(base, index, value as u8),
        Width::Short | Width::Char => mem.set_half(base, index, value as u16),
        Width::Word | Width::Long => mem.set_word(base, index, value),
    }
}

/// ROM is never written.
fn writable(om: &ObjectMemory, obj: u32) -> bool {
    om.in_ram(obj) || om.in_eeprom(obj)
}

fn ordering_to_int(ordering: Ordering) -> i32 {
    match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}
