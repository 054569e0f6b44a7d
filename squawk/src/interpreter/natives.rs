//! Native methods reached through `invokenative`.
//!
//! The operand byte of `invokenative` indexes [`default_natives`]. Each
//! native pops its arguments in reverse order and pushes its result on the
//! operand stack of the calling frame.

use std::time::{SystemTime, UNIX_EPOCH};

use super::{Interpreter, Step, SupportCall, Suspension};
use crate::class::{self, cno};
use crate::collector::Heap;
use crate::error::VmResult;
use crate::fatal;
use crate::frames;
use crate::header;
use crate::layout::*;

pub(crate) type NativeFn = fn(&mut Interpreter, &mut Heap) -> VmResult<Step>;

#[derive(Clone, Copy)]
pub struct NativeDesc {
    pub name: &'static str,
    pub(crate) func: NativeFn,
}

impl NativeDesc {
    pub(crate) const fn new(name: &'static str, func: NativeFn) -> Self {
        Self { name, func }
    }
}

impl std::fmt::Debug for NativeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeDesc").field("name", &self.name).finish()
    }
}

/// Operation selectors of the `math` native.
pub mod math_op {
    pub const SIN: u32 = 0;
    pub const COS: u32 = 1;
    pub const TAN: u32 = 2;
    pub const ASIN: u32 = 3;
    pub const ACOS: u32 = 4;
    pub const ATAN: u32 = 5;
    pub const EXP: u32 = 6;
    pub const LOG: u32 = 7;
    pub const SQRT: u32 = 8;
    pub const CEIL: u32 = 9;
    pub const FLOOR: u32 = 10;
    pub const ATAN2: u32 = 11;
    pub const POW: u32 = 12;
    pub const IEEE_REMAINDER: u32 = 13;
}

const NATIVES: &[NativeDesc] = &[
    // ── VM control ────────────────────────────────────────────────────
    NativeDesc::new("exit", exit),
    NativeDesc::new("gc", gc),
    NativeDesc::new("fatalVMError", fatal_vm_error),
    NativeDesc::new("freeMemory", free_memory),
    NativeDesc::new("totalMemory", total_memory),
    NativeDesc::new("getTime", get_time),
    NativeDesc::new("getInstructionCount", get_instruction_count),
    NativeDesc::new("getStackFrameDepth", get_stack_frame_depth),
    NativeDesc::new("enableExcessiveGC", enable_excessive_gc),
    NativeDesc::new("setMinimumHeapMode", set_minimum_heap_mode),
    NativeDesc::new("getHeapHighWaterMark", get_heap_high_water_mark),
    // ── Console ───────────────────────────────────────────────────────
    NativeDesc::new("putch", putch),
    NativeDesc::new("puterrch", puterrch),
    NativeDesc::new("print", print),
    NativeDesc::new("printInt", print_int),
    // ── Objects and arrays ────────────────────────────────────────────
    NativeDesc::new("getClass", get_class),
    NativeDesc::new("getArrayLength", get_array_length),
    NativeDesc::new("getAddress", get_address),
    NativeDesc::new("inRam", in_ram),
    NativeDesc::new("arraycopy0", arraycopy0),
    NativeDesc::new("stringcopy0", stringcopy0),
    NativeDesc::new("makeEightBitString", make_eight_bit_string),
    NativeDesc::new("makeSixteenBitString", make_sixteen_bit_string),
    NativeDesc::new("primNewObject", prim_new_object),
    NativeDesc::new("primNewArray", prim_new_array),
    NativeDesc::new("primAstoreOop", prim_astore_oop),
    // ── Class state ───────────────────────────────────────────────────
    NativeDesc::new("getClassState", get_class_state),
    NativeDesc::new("createClassState", create_class_state),
    NativeDesc::new("setClassState", set_class_state),
    NativeDesc::new("primGetStatic", prim_get_static),
    NativeDesc::new("primGetStaticLong", prim_get_static_long),
    NativeDesc::new("primPutStatic", prim_put_static),
    NativeDesc::new("primPutStaticLong", prim_put_static_long),
    NativeDesc::new("primPutStaticObj", prim_put_static_obj),
    // ── Threads ───────────────────────────────────────────────────────
    NativeDesc::new("getNewExecutionContext", get_new_execution_context),
    NativeDesc::new("setExecutionContext", set_execution_context),
    NativeDesc::new("setFastLockStack", set_fast_lock_stack),
    NativeDesc::new("setOutOfMemoryError", set_out_of_memory_error),
    // ── Associations and finalization ─────────────────────────────────
    NativeDesc::new("setAssociationHashtable", set_association_hashtable),
    NativeDesc::new("getAssociationQueue", get_association_queue),
    NativeDesc::new("setAssociationQueue", set_association_queue),
    NativeDesc::new("getAssociation", get_association),
    NativeDesc::new("getFinalizer", get_finalizer),
    // ── Persistent memory ─────────────────────────────────────────────
    NativeDesc::new("getPersistentMemoryTable", get_persistent_memory_table),
    NativeDesc::new("setPersistentMemoryTable", set_persistent_memory_table),
    NativeDesc::new("makePersistent", make_persistent),
    NativeDesc::new("makePersistentCopy", make_persistent_copy),
    NativeDesc::new("gcPersistentMemory", gc_persistent_memory),
    NativeDesc::new("wasPersistentMemoryGCInterrupted", was_persistent_memory_gc_interrupted),
    NativeDesc::new("getPersistentMemorySize", get_persistent_memory_size),
    NativeDesc::new("newPersistentByteArray", new_persistent_byte_array),
    // ── Floating point ────────────────────────────────────────────────
    NativeDesc::new("floatToIntBits", identity),
    NativeDesc::new("doubleToLongBits", identity),
    NativeDesc::new("intBitsToFloat", identity),
    NativeDesc::new("longBitsToDouble", identity),
    NativeDesc::new("math", math),
];

pub fn default_natives() -> Vec<NativeDesc> {
    NATIVES.to_vec()
}

/// The `invokenative` operand that selects `name`.
pub fn native_number(name: &str) -> Option<u8> {
    NATIVES
        .iter()
        .position(|desc| desc.name == name)
        .and_then(|i| u8::try_from(i).ok())
}

const CONTINUE: VmResult<Step> = Ok(Step::Continue);

// ── VM control ────────────────────────────────────────────────────────

fn exit(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let code = interp.pop(&heap.om.mem) as i32;
    Ok(Step::Suspend(Suspension::Exit(code)))
}

fn gc(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let ip = interp.ip;
    let chunk = interp.save_context(&mut heap.om.mem, ip);
    Ok(Step::Suspend(Suspension::Collect { chunk }))
}

fn fatal_vm_error(_: &mut Interpreter, _: &mut Heap) -> VmResult<Step> {
    Err(fatal!("Native.fatalVMError()"))
}

fn free_memory(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let ram = interp.pop(&heap.om.mem) != 0;
    let free = heap.free_memory(ram);
    interp.push_long(&mut heap.om.mem, free as i64);
    CONTINUE
}

fn total_memory(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let ram = interp.pop(&heap.om.mem) != 0;
    let total = heap.total_memory(ram);
    interp.push_long(&mut heap.om.mem, total as i64);
    CONTINUE
}

fn get_time(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    interp.push_long(&mut heap.om.mem, millis);
    CONTINUE
}

fn get_instruction_count(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let count = interp.instruction_count as i64;
    interp.push_long(&mut heap.om.mem, count);
    CONTINUE
}

fn get_stack_frame_depth(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mem = &mut heap.om.mem;
    let depth = frames::frame_depth(mem, interp.lp);
    interp.push(mem, depth);
    CONTINUE
}

fn enable_excessive_gc(_: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    heap.om.set_excessive_gc(true);
    CONTINUE
}

fn set_minimum_heap_mode(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mode = interp.pop(&heap.om.mem);
    heap.set_minimum_heap_mode(mode == 1)?;
    CONTINUE
}

fn get_heap_high_water_mark(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mark = heap.heap_high_water_mark();
    interp.push_long(&mut heap.om.mem, mark as i64);
    CONTINUE
}

// ── Console ───────────────────────────────────────────────────────────

fn write_char(interp: &mut Interpreter, error: bool, ch: u32) -> VmResult<()> {
    let mut buf = [0u8; 4];
    let c = char::from_u32(ch).unwrap_or(char::REPLACEMENT_CHARACTER);
    interp.write_console(error, c.encode_utf8(&mut buf).as_bytes())
}

fn putch(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let ch = interp.pop(&heap.om.mem);
    write_char(interp, false, ch)?;
    CONTINUE
}

fn puterrch(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let ch = interp.pop(&heap.om.mem);
    write_char(interp, true, ch)?;
    CONTINUE
}

/// Print a string object, or `null`.
fn print(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mem = &heap.om.mem;
    let string = interp.pop(mem);
    if string == 0 {
        interp.write_console(false, b"null")?;
        return CONTINUE;
    }
    let klass = header::get_class(mem, string);
    let length = header::get_array_element_count(mem, string) as i32;
    let text: String = match class::array_element_length(mem, klass) {
        1 => (0..length).map(|i| mem.get_unsigned_byte(string, i) as char).collect(),
        2 => {
            let units: Vec<u16> = (0..length).map(|i| mem.get_unsigned_half(string, i)).collect();
            String::from_utf16_lossy(&units)
        }
        _ => return Err(fatal!("print of non-string object 0x{string:x}")),
    };
    interp.write_console(false, text.as_bytes())?;
    CONTINUE
}

fn print_int(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let value = interp.pop(&heap.om.mem) as i32;
    interp.write_console(false, value.to_string().as_bytes())?;
    CONTINUE
}

// ── Objects and arrays ────────────────────────────────────────────────

fn get_class(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mem = &mut heap.om.mem;
    let obj = interp.pop(mem);
    let klass = header::get_class(mem, obj);
    interp.push(mem, klass);
    CONTINUE
}

fn get_array_length(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mem = &mut heap.om.mem;
    let array = interp.pop(mem);
    let count = header::get_array_element_count(mem, array);
    interp.push(mem, count);
    CONTINUE
}

/// The reference already is the address.
fn get_address(_: &mut Interpreter, _: &mut Heap) -> VmResult<Step> {
    CONTINUE
}

fn in_ram(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let oop = interp.pop(&heap.om.mem);
    let result = heap.om.in_ram(oop) as u32;
    interp.push(&mut heap.om.mem, result);
    CONTINUE
}

fn arraycopy0(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let om = &mut heap.om;
    let length = interp.pop(&om.mem) as i32;
    let dst_pos = interp.pop(&om.mem) as i32;
    let dst = interp.pop(&om.mem);
    let src_pos = interp.pop(&om.mem) as i32;
    let src = interp.pop(&om.mem);
    if length <= 0 {
        return CONTINUE;
    }
    if om.in_rom(dst) {
        return Ok(interp.raise(&om.mem, SupportCall::IllegalStoreException));
    }

    let src_class = header::get_class(&om.mem, src);
    if class::is_pointer_array(&om.mem, src_class) {
        // Element stores go through the barrier. Copy backwards when the
        // ranges overlap upwards.
        let backwards = src == dst && src_pos < dst_pos;
        for n in 0..length {
            let i = if backwards { length - 1 - n } else { n };
            let value = om.mem.get_word(src, src_pos + i);
            if !om.set_oop(dst, dst_pos + i, value) {
                return Ok(interp.raise(&om.mem, SupportCall::IllegalStoreException));
            }
        }
    } else {
        let item = class::array_element_length(&om.mem, src_class);
        om.mem.copy_bytes(
            src + src_pos as u32 * item,
            dst + dst_pos as u32 * item,
            length as u32 * item,
        );
    }
    CONTINUE
}

/// Copy characters between 8-bit and 16-bit strings.
fn stringcopy0(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mem = &mut heap.om.mem;
    let length = interp.pop(mem) as i32;
    let dst_pos = interp.pop(mem) as i32;
    let dst = interp.pop(mem);
    let src_pos = interp.pop(mem) as i32;
    let src = interp.pop(mem);
    let src_item = class::array_element_length(mem, header::get_class(mem, src));
    let dst_item = class::array_element_length(mem, header::get_class(mem, dst));
    match (src_item, dst_item) {
        (a, b) if a == b => {
            mem.copy_bytes(
                src + src_pos as u32 * a,
                dst + dst_pos as u32 * a,
                length.max(0) as u32 * a,
            );
        }
        (1, 2) => {
            for i in 0..length {
                let ch = mem.get_unsigned_byte(src, src_pos + i) as u16;
                mem.set_half(dst, dst_pos + i, ch);
            }
        }
        (2, 1) => {
            for i in 0..length {
                let ch = mem.get_unsigned_half(src, src_pos + i) as u8;
                mem.set_byte(dst, dst_pos + i, ch);
            }
        }
        _ => return Err(fatal!("stringcopy0 between element sizes {src_item} and {dst_item}")),
    }
    CONTINUE
}

fn retype(interp: &mut Interpreter, heap: &mut Heap, number: u32) -> VmResult<Step> {
    let oop = interp.pop(&heap.om.mem);
    let klass = heap.om.class_from_cno(number);
    let mem = &mut heap.om.mem;
    header::set_class(mem, oop, klass);
    interp.push(mem, oop);
    CONTINUE
}

fn make_eight_bit_string(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    retype(interp, heap, cno::STRING_OF_BYTES)
}

fn make_sixteen_bit_string(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    retype(interp, heap, cno::STRING)
}

/// Allocate an instance and run the constructor in static slot `slot`
/// on it. A failed allocation pushes null and runs nothing.
fn prim_new_object(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let slot = interp.pop(&heap.om.mem) as i32;
    let klass = interp.pop(&heap.om.mem);
    let obj = heap.om.new_instance(klass);
    let mem = &mut heap.om.mem;
    interp.push(mem, obj);
    if obj != 0 {
        interp.push_frame(mem);
        interp.cp = klass;
        let mp = mem.get_word(class::static_methods(mem, klass), slot);
        if mp == 0 {
            return Err(fatal!("constructor slot {slot} of class {} is empty", class::get_type(mem, klass)));
        }
        interp.setup_frame(mem, mp);
    }
    CONTINUE
}

fn prim_new_array(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let count = interp.pop(&heap.om.mem);
    let klass = interp.pop(&heap.om.mem);
    let array = heap.om.new_array(klass, count);
    interp.push(&mut heap.om.mem, array);
    CONTINUE
}

fn prim_astore_oop(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let om = &mut heap.om;
    let value = interp.pop(&om.mem);
    let index = interp.pop(&om.mem) as i32;
    let array = interp.pop(&om.mem);
    if array == 0 {
        return Ok(interp.raise(&om.mem, SupportCall::NullPointerException));
    }
    if index < 0 || index as u32 >= header::get_array_element_count(&om.mem, array) {
        return Ok(interp.raise(&om.mem, SupportCall::ArrayBoundsException));
    }
    if !om.set_oop(array, index, value) {
        return Ok(interp.raise(&om.mem, SupportCall::IllegalStoreException));
    }
    CONTINUE
}

// ── Class state ───────────────────────────────────────────────────────

fn get_class_state(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let klass = interp.pop(&heap.om.mem);
    let cs = heap.om.find_class_state(klass);
    interp.push(&mut heap.om.mem, cs);
    CONTINUE
}

fn create_class_state(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let klass = interp.pop(&heap.om.mem);
    let cs = heap.om.new_class_state(klass);
    if cs != 0 {
        heap.om.set_oop_ram(cs, CLS_STATE_CLASS, klass);
    }
    interp.push(&mut heap.om.mem, cs);
    CONTINUE
}

fn set_class_state(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let cs = interp.pop(&heap.om.mem);
    let klass = interp.pop(&heap.om.mem);
    heap.om.add_to_class_state(klass, cs);
    CONTINUE
}

fn prim_get_static(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mem = &mut heap.om.mem;
    let offset = interp.pop(mem) as i32;
    let cs = interp.pop(mem);
    let value = mem.get_word(cs, offset);
    interp.push(mem, value);
    CONTINUE
}

fn prim_get_static_long(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mem = &mut heap.om.mem;
    let offset = interp.pop(mem) as i32;
    let cs = interp.pop(mem);
    let value = mem.get_long_at_word(cs, offset);
    interp.push_long(mem, value);
    CONTINUE
}

fn prim_put_static(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mem = &mut heap.om.mem;
    let value = interp.pop(mem);
    let offset = interp.pop(mem) as i32;
    let cs = interp.pop(mem);
    mem.set_word(cs, offset, value);
    CONTINUE
}

fn prim_put_static_long(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mem = &mut heap.om.mem;
    let value = interp.pop_long(mem);
    let offset = interp.pop(mem) as i32;
    let cs = interp.pop(mem);
    mem.set_long_at_word(cs, offset, value);
    CONTINUE
}

fn prim_put_static_obj(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let om = &mut heap.om;
    let value = interp.pop(&om.mem);
    let offset = interp.pop(&om.mem) as i32;
    let cs = interp.pop(&om.mem);
    om.set_oop_ram(cs, offset, value);
    CONTINUE
}

// ── Threads ───────────────────────────────────────────────────────────

fn get_new_execution_context(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let thread = interp.pop(&heap.om.mem);
    let chunk = interp.create_execution_context(heap, SupportCall::Callrun, thread)?;
    interp.push(&mut heap.om.mem, chunk);
    CONTINUE
}

/// Switch to the context of `newThread`, parking the current one in
/// `oldThread` unless it is dead.
fn set_execution_context(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let om = &mut heap.om;
    let id = interp.pop(&om.mem);
    let new_thread = interp.pop(&om.mem);
    let old_is_dead = interp.pop(&om.mem) != 0;
    let old_thread = interp.pop(&om.mem);

    if old_thread != 0 {
        if old_is_dead {
            let cc = frames::chunk_from_frame(&om.mem, interp.lp);
            frames::set_chunk_last_lp(&mut om.mem, cc, 0);
            om.set_oop_ram(old_thread, THREAD_CONTEXT, 0);
        } else {
            let ip = interp.ip;
            let cc = interp.save_context(&mut om.mem, ip);
            om.set_oop_ram(old_thread, THREAD_CONTEXT, cc);
        }
    }

    let chunk = om.mem.get_word(new_thread, THREAD_CONTEXT);
    if chunk == 0 {
        return Err(fatal!("thread 0x{new_thread:x} has no context"));
    }
    interp.load_context(&mut om.mem, chunk)?;
    // The chunk may be popped while the thread runs.
    om.set_oop_ram(new_thread, THREAD_CONTEXT, 0);
    log::debug!(target: "squawk::interp", "switched to thread {id} in chunk 0x{chunk:x}");
    CONTINUE
}

fn set_fast_lock_stack(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let stack = interp.pop(&heap.om.mem);
    heap.om.set_ram_root(root::FAST_LOCK_STACK, stack);
    CONTINUE
}

fn set_out_of_memory_error(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let error = interp.pop(&heap.om.mem);
    heap.om.set_ram_root(root::OUT_OF_MEMORY_OBJECT, error);
    CONTINUE
}

// ── Associations and finalization ─────────────────────────────────────

fn set_association_hashtable(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let table = interp.pop(&heap.om.mem);
    heap.om.set_ram_root(root::ASSOCIATION_HASHTABLE, table);
    CONTINUE
}

fn get_association_queue(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let obj = interp.pop(&heap.om.mem);
    let queue = heap.om.association_queue(obj);
    interp.push(&mut heap.om.mem, queue);
    CONTINUE
}

fn set_association_queue(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let assn = interp.pop(&heap.om.mem);
    let obj = interp.pop(&heap.om.mem);
    heap.om.set_association_queue(obj, assn);
    CONTINUE
}

/// Find or create the association of an object. Pushes 0 when it could
/// not be allocated; the caller collects and asks again.
fn get_association(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let obj = interp.pop(&heap.om.mem);
    let assn = heap.om.get_or_create_association(obj);
    interp.push(&mut heap.om.mem, assn);
    CONTINUE
}

fn get_finalizer(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let assn = heap.om.take_finalizer();
    interp.push(&mut heap.om.mem, assn);
    CONTINUE
}

// ── Persistent memory ─────────────────────────────────────────────────

fn get_persistent_memory_table(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let table = heap.om.root(Segment::Eeprom, root::PERSISTENT_MEMORY_TABLE);
    interp.push(&mut heap.om.mem, table);
    CONTINUE
}

fn set_persistent_memory_table(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let table = interp.pop(&heap.om.mem);
    heap.om.set_root(Segment::Eeprom, root::PERSISTENT_MEMORY_TABLE, table)?;
    CONTINUE
}

/// Move a graph to EEPROM. The frame then suspends so a collection can
/// fix every RAM reference to the forwarded objects.
fn make_persistent(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let root = interp.pop(&heap.om.mem);
    let moved = heap.make_persistent(root, true)?;
    let mem = &mut heap.om.mem;
    interp.push(mem, moved);
    if moved == 0 {
        return CONTINUE;
    }
    let ip = interp.ip;
    let chunk = interp.save_context(mem, ip);
    Ok(Step::Suspend(Suspension::Collect { chunk }))
}

fn make_persistent_copy(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let root = interp.pop(&heap.om.mem);
    let copy = heap.make_persistent(root, false)?;
    interp.push(&mut heap.om.mem, copy);
    CONTINUE
}

fn gc_persistent_memory(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mark_stack = interp.pop(&heap.om.mem);
    let bit_vector = interp.pop(&heap.om.mem);
    let ip = interp.ip;
    let offset = frames::frame_stack_offset(&heap.om.mem, interp.lp);
    let chunk = interp.save_context(&mut heap.om.mem, ip);
    let result = heap.gc_persistent_memory(bit_vector, mark_stack);
    frames::set_chunk_last_lp(&mut heap.om.mem, chunk, 0);
    frames::set_frame_stack_offset(&mut heap.om.mem, interp.lp, offset);
    result?;
    CONTINUE
}

fn was_persistent_memory_gc_interrupted(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let interrupted = heap.persistent.was_interrupted(&heap.om) as u32;
    interp.push(&mut heap.om.mem, interrupted);
    CONTINUE
}

fn get_persistent_memory_size(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let om = &mut heap.om;
    let size = om.gci(Segment::Eeprom, GCI_PARTITION_END) - om.gci(Segment::Eeprom, GCI_PARTITION_START);
    interp.push(&mut om.mem, size);
    CONTINUE
}

fn new_persistent_byte_array(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let count = interp.pop(&heap.om.mem);
    let array = heap.new_persistent_byte_array(count);
    interp.push(&mut heap.om.mem, array);
    CONTINUE
}

// ── Floating point ────────────────────────────────────────────────────

/// Floats already travel as their bit patterns.
fn identity(_: &mut Interpreter, _: &mut Heap) -> VmResult<Step> {
    CONTINUE
}

fn math(interp: &mut Interpreter, heap: &mut Heap) -> VmResult<Step> {
    let mem = &mut heap.om.mem;
    let b = f64::from_bits(interp.pop_long(mem) as u64);
    let a = f64::from_bits(interp.pop_long(mem) as u64);
    let op = interp.pop(mem);
    let result = match op {
        math_op::SIN => a.sin(),
        math_op::COS => a.cos(),
        math_op::TAN => a.tan(),
        math_op::ASIN => a.asin(),
        math_op::ACOS => a.acos(),
        math_op::ATAN => a.atan(),
        math_op::EXP => a.exp(),
        math_op::LOG => a.ln(),
        math_op::SQRT => a.sqrt(),
        math_op::CEIL => a.ceil(),
        math_op::FLOOR => a.floor(),
        math_op::ATAN2 => a.atan2(b),
        math_op::POW => a.powf(b),
        math_op::IEEE_REMAINDER => ieee_remainder(a, b),
        _ => return Err(fatal!("bad math operation {op}")),
    };
    interp.push_long(mem, result.to_bits() as i64);
    CONTINUE
}

/// `a - b * n` where `n` is `a / b` rounded to the nearest integer, ties
/// to even.
fn ieee_remainder(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() || a.is_infinite() || b == 0.0 {
        return f64::NAN;
    }
    if b.is_infinite() {
        return a;
    }
    let n = (a / b).round_ties_even();
    let r = a - b * n;
    if r == 0.0 { 0.0_f64.copysign(a) } else { r }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_numbers_are_table_indices() {
        assert_eq!(native_number("exit"), Some(0));
        assert_eq!(native_number("gc"), Some(1));
        let math = native_number("math").unwrap();
        assert_eq!(NATIVES[math as usize].name, "math");
        assert_eq!(native_number("noSuchNative"), None);
    }

    #[test]
    fn native_names_are_unique() {
        let mut names: Vec<_> = NATIVES.iter().map(|d| d.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), NATIVES.len());
        assert!(NATIVES.len() <= 256);
    }

    #[test]
    fn ieee_remainder_rounds_to_nearest() {
        assert_eq!(ieee_remainder(5.0, 3.0), -1.0);
        assert_eq!(ieee_remainder(4.0, 3.0), 1.0);
        assert_eq!(ieee_remainder(-5.0, 3.0), 1.0);
        assert!(ieee_remainder(1.0, 0.0).is_nan());
        assert_eq!(ieee_remainder(2.5, f64::INFINITY), 2.5);
    }
}
