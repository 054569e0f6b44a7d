//! The bytecode interpreter.
//!
//! All interpreter state that survives a collection lives in object memory:
//! the registers are reloaded from the stack chunk every time
//! [`Interpreter::interpret`] is entered, and written back into the frame
//! whenever the loop suspends. Work the interpreter cannot do itself is
//! handed to static methods of `VMExtension` through a [`SupportCall`].

mod dispatch;
pub mod natives;

use std::io::{self, Write};

use bytecode::{BytecodeDecoder, Op};

use crate::class;
use crate::collector::Heap;
use crate::config::{TraceFlags, VmSettings};
use crate::error::VmResult;
use crate::fatal;
use crate::frames;
use crate::layout::*;
use crate::memory::Memory;

pub use natives::{NativeDesc, default_natives, native_number};

/// Why [`Interpreter::interpret`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    /// An allocation failed or the guest asked for a collection. `chunk`
    /// holds the suspended context.
    Collect { chunk: u32 },
    /// The guest called `exit`.
    Exit(i32),
}

/// Outcome of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Call(SupportCall),
    Suspend(Suspension),
}

/// Static method slots of `VMExtension` the interpreter calls into. The
/// discriminant is the slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupportCall {
    Yield = 0,
    NullPointerException,
    ArrayBoundsException,
    ArithmeticException,
    IllegalStoreException,
    AstoreOop,
    GetStatic,
    GetStaticLong,
    PutStatic,
    PutStaticLong,
    PutStaticObj,
    InitializeClass,
    MonitorEnter,
    MonitorExit,
    InstanceOf,
    Checkcast,
    NewArray,
    NewDimension,
    RegisterForFinalization,
    Breakpoint,
    Callrun,
    Vmstart,
}

impl SupportCall {
    pub const ALL: [SupportCall; 22] = [
        SupportCall::Yield,
        SupportCall::NullPointerException,
        SupportCall::ArrayBoundsException,
        SupportCall::ArithmeticException,
        SupportCall::IllegalStoreException,
        SupportCall::AstoreOop,
        SupportCall::GetStatic,
        SupportCall::GetStaticLong,
        SupportCall::PutStatic,
        SupportCall::PutStaticLong,
        SupportCall::PutStaticObj,
        SupportCall::InitializeClass,
        SupportCall::MonitorEnter,
        SupportCall::MonitorExit,
        SupportCall::InstanceOf,
        SupportCall::Checkcast,
        SupportCall::NewArray,
        SupportCall::NewDimension,
        SupportCall::RegisterForFinalization,
        SupportCall::Breakpoint,
        SupportCall::Callrun,
        SupportCall::Vmstart,
    ];

    #[inline(always)]
    pub fn slot(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            SupportCall::Yield => "yield",
            SupportCall::NullPointerException => "nullPointerException",
            SupportCall::ArrayBoundsException => "arrayBoundsException",
            SupportCall::ArithmeticException => "arithmeticException",
            SupportCall::IllegalStoreException => "illegalStoreException",
            SupportCall::AstoreOop => "astoreOop",
            SupportCall::GetStatic => "getStatic",
            SupportCall::GetStaticLong => "getStaticLong",
            SupportCall::PutStatic => "putStatic",
            SupportCall::PutStaticLong => "putStaticLong",
            SupportCall::PutStaticObj => "putStaticObj",
            SupportCall::InitializeClass => "initializeClass",
            SupportCall::MonitorEnter => "monitorEnter",
            SupportCall::MonitorExit => "monitorExit",
            SupportCall::InstanceOf => "instanceOf",
            SupportCall::Checkcast => "checkcast",
            SupportCall::NewArray => "newArray",
            SupportCall::NewDimension => "newDimension",
            SupportCall::RegisterForFinalization => "registerForFinalization",
            SupportCall::Breakpoint => "breakpoint",
            SupportCall::Callrun => "callrun",
            SupportCall::Vmstart => "vmstart",
        }
    }
}

/// Interpreter registers plus the state the natives keep between calls.
pub struct Interpreter {
    pub(crate) ip: u32,
    pub(crate) sp: u32,
    pub(crate) lp: u32,
    pub(crate) cp: u32,
    /// End of the current stack chunk.
    pub(crate) sl: u32,
    /// Branches left in the time slice.
    pub(crate) bc: i32,
    gc_worked: bool,
    no_yield: bool,
    trace: TraceFlags,
    instruction_count: u64,
    natives: Vec<NativeDesc>,
    captured: Option<Vec<u8>>,
}

impl Interpreter {
    pub fn new(settings: &VmSettings) -> Self {
        Self {
            ip: 0,
            sp: 0,
            lp: 0,
            cp: 0,
            sl: 0,
            bc: TIMEQUANTA,
            gc_worked: true,
            no_yield: settings.no_yield,
            trace: settings.trace,
            instruction_count: 0,
            natives: default_natives(),
            captured: None,
        }
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Collect console output in memory instead of writing it to stdout
    /// and stderr.
    pub fn capture_output(&mut self) {
        self.captured = Some(Vec::new());
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        self.captured.as_mut().map(std::mem::take).unwrap_or_default()
    }

    pub(crate) fn write_console(&mut self, error: bool, bytes: &[u8]) -> VmResult<()> {
        if let Some(buf) = &mut self.captured {
            buf.extend_from_slice(bytes);
            return Ok(());
        }
        if error {
            io::stderr().write_all(bytes)?;
        } else {
            let mut out = io::stdout().lock();
            out.write_all(bytes)?;
            out.flush()?;
        }
        Ok(())
    }

    // ── Operand stack ─────────────────────────────────────────────────

    #[inline(always)]
    pub(crate) fn push(&mut self, mem: &mut Memory, value: u32) {
        self.sp = self.sp.wrapping_add(4);
        debug_assert!(self.sp < self.sl, "operand stack overflow at 0x{:x}", self.sp);
        mem.write_word(self.sp, value);
    }

    #[inline(always)]
    pub(crate) fn pop(&mut self, mem: &Memory) -> u32 {
        let value = mem.read_word(self.sp);
        self.sp = self.sp.wrapping_sub(4);
        value
    }

    pub(crate) fn push_long(&mut self, mem: &mut Memory, value: i64) {
        self.sp = self.sp.wrapping_add(4);
        mem.set_long_at_word(self.sp, 0, value);
        self.sp = self.sp.wrapping_add(4);
    }

    pub(crate) fn pop_long(&mut self, mem: &Memory) -> i64 {
        self.sp = self.sp.wrapping_sub(4);
        let value = mem.get_long_at_word(self.sp, 0);
        self.sp = self.sp.wrapping_sub(4);
        value
    }

    /// Drop every operand of the current frame.
    pub(crate) fn clear_stack(&mut self, mem: &Memory) {
        self.sp = self.lp.wrapping_add(frames::frame_stack_offset(mem, self.lp));
    }

    // ── Bytecode fetches ──────────────────────────────────────────────

    #[inline(always)]
    pub(crate) fn fetch_u8(&mut self, mem: &Memory) -> u8 {
        let b = mem.fetch_u8(self.ip);
        self.ip += 1;
        b
    }

    #[inline(always)]
    pub(crate) fn fetch_i8(&mut self, mem: &Memory) -> i8 {
        self.fetch_u8(mem) as i8
    }

    pub(crate) fn fetch_i16(&mut self, mem: &Memory) -> i16 {
        let v = mem.fetch_i16(self.ip);
        self.ip += 2;
        v
    }

    pub(crate) fn fetch_u16(&mut self, mem: &Memory) -> u16 {
        let v = mem.fetch_u16(self.ip);
        self.ip += 2;
        v
    }

    pub(crate) fn fetch_i32(&mut self, mem: &Memory) -> i32 {
        let v = mem.fetch_i32(self.ip);
        self.ip += 4;
        v
    }

    pub(crate) fn fetch_i64(&mut self, mem: &Memory) -> i64 {
        let v = mem.fetch_i64(self.ip);
        self.ip += 8;
        v
    }

    // ── Frames ────────────────────────────────────────────────────────

    /// Start a frame on top of the operand stack. The operands already
    /// pushed become the callee's first locals.
    pub(crate) fn push_frame(&mut self, mem: &mut Memory) {
        let next = frames::next_frame_lp(mem, self.lp);
        frames::set_frame_ip(mem, self.lp, self.ip);
        frames::set_frame_previous_lp(mem, next, self.lp);
        if self.trace.contains(TraceFlags::FRAMES) {
            log::trace!(target: "squawk::interp", "push frame lp=0x{next:x} prev=0x{:x}", self.lp);
        }
        self.lp = next;
        debug_assert!(self.lp < self.sl);
    }

    pub(crate) fn setup_frame(&mut self, mem: &mut Memory, mp: u32) {
        frames::set_frame_mp(mem, self.lp, mp);
        frames::set_frame_cp(mem, self.lp, self.cp);
        self.ip = mp + frames::method_header_size(mem, mp);
        if self.trace.contains(TraceFlags::METHODS) {
            log::debug!(
                target: "squawk::interp",
                "enter method 0x{mp:x} of class {} ({} parms, {} locals)",
                class::get_type(mem, self.cp),
                frames::method_nparms(mem, mp),
                frames::method_nlocals(mem, mp)
            );
        }
    }

    /// Return to the caller, crossing back into the previous chunk when
    /// the frame was the first of its chunk.
    pub(crate) fn pop_frame(&mut self, mem: &mut Memory) -> VmResult<()> {
        let mut plp = frames::frame_previous_lp(mem, self.lp);
        if plp != 0 {
            self.sp = self.lp - 4;
        } else {
            let cc = frames::chunk_from_frame(mem, self.lp);
            let pc = frames::chunk_prev(mem, cc);
            if pc == 0 {
                return Err(fatal!("return from the bottom frame of context 0x{cc:x}"));
            }
            self.sl = frames::chunk_limit(mem, pc);
            plp = frames::chunk_last_lp(mem, pc);
            frames::set_chunk_last_lp(mem, pc, 0);
            self.sp = plp.wrapping_add(frames::frame_stack_offset(mem, plp));
            if self.trace.contains(TraceFlags::FRAMES) {
                log::trace!(target: "squawk::interp", "left chunk 0x{cc:x} for 0x{pc:x}");
            }
        }
        self.lp = plp;
        self.cp = frames::frame_cp(mem, self.lp);
        self.ip = frames::frame_ip(mem, self.lp);
        if self.trace.contains(TraceFlags::FRAMES) {
            log::trace!(target: "squawk::interp", "pop frame lp=0x{plp:x} sp=0x{:x}", self.sp);
        }
        Ok(())
    }

    /// Record the registers in the current frame so a collector can walk
    /// the chunk. The frame resumes at `ip`.
    ///
    /// Operands left on the stack are kept but never traced, so only
    /// values that are not RAM references survive a collection there.
    pub(crate) fn save_context(&mut self, mem: &mut Memory, ip: u32) -> u32 {
        frames::set_frame_ip(mem, self.lp, ip);
        frames::set_frame_stack_offset(mem, self.lp, self.sp.wrapping_sub(self.lp));
        let chunk = frames::chunk_from_frame(mem, self.lp);
        frames::set_chunk_last_lp(mem, chunk, self.lp);
        chunk
    }

    /// Suspend for a collection. The frame re-executes from `restart_ip`.
    pub(crate) fn suspend_for_gc(&mut self, mem: &mut Memory, restart_ip: u32) -> Step {
        let chunk = self.save_context(mem, restart_ip);
        log::debug!(target: "squawk::interp", "suspended in chunk 0x{chunk:x} for collection");
        Step::Suspend(Suspension::Collect { chunk })
    }

    fn load_context(&mut self, mem: &mut Memory, chunk: u32) -> VmResult<()> {
        let lp = frames::chunk_last_lp(mem, chunk);
        if lp == 0 {
            return Err(fatal!("stack chunk 0x{chunk:x} has no active frame"));
        }
        self.lp = lp;
        self.ip = frames::frame_ip(mem, lp);
        self.cp = frames::frame_cp(mem, lp);
        self.sp = lp.wrapping_add(frames::frame_stack_offset(mem, lp));
        self.sl = frames::chunk_limit(mem, chunk);
        self.bc = TIMEQUANTA;
        let mp = frames::frame_mp(mem, lp);
        if self.ip != mp + frames::method_header_size(mem, mp) {
            // Past the leading extend: the next frame starts above the locals.
            let base = frames::extended_stack_offset(frames::method_nlocals(mem, mp));
            frames::set_frame_stack_offset(mem, lp, base);
        }
        frames::set_chunk_last_lp(mem, chunk, 0);
        if self.trace.contains(TraceFlags::FRAMES) {
            log::debug!(
                target: "squawk::interp",
                "resumed chunk 0x{chunk:x} at lp=0x{lp:x}, depth {}",
                frames::frame_depth(mem, lp)
            );
        }
        Ok(())
    }

    // ── Contexts ──────────────────────────────────────────────────────

    /// The class whose static methods implement the support calls.
    pub(crate) fn vm_extension(heap: &Heap) -> VmResult<u32> {
        let klass = heap.om.root(Segment::Rom, root::VM_EXTENSION);
        if klass == 0 {
            return Err(fatal!("VMExtension class is missing from ROM"));
        }
        Ok(klass)
    }

    fn support_method(heap: &Heap, call: SupportCall) -> VmResult<(u32, u32)> {
        let klass = Self::vm_extension(heap)?;
        let methods = class::static_methods(&heap.om.mem, klass);
        let mp = heap.om.mem.get_word(methods, call.slot());
        if mp == 0 {
            return Err(fatal!("VMExtension.{} is not implemented", call.name()));
        }
        Ok((klass, mp))
    }

    /// Build a new context that will start by running `call` with `parm`
    /// as its only argument (none when `parm` is 0). Returns the chunk, or
    /// 0 when it could not be allocated.
    pub fn create_execution_context(
        &mut self,
        heap: &mut Heap,
        call: SupportCall,
        parm: u32,
    ) -> VmResult<u32> {
        let (klass, mp) = Self::support_method(heap, call)?;
        let mem = &heap.om.mem;
        let nlocals = frames::method_nlocals(mem, mp);
        let min_words = frames::min_chunk_words(nlocals, method_stack_size(mem, mp));
        let chunk = heap.om.new_stack_chunk(min_words);
        if chunk == 0 {
            return Ok(0);
        }
        let mem = &mut heap.om.mem;
        let lp = frames::first_lp(chunk);
        let mut sp = lp - 4;
        if parm != 0 {
            sp += 4;
            mem.write_word(sp, parm);
        }
        frames::set_frame_previous_lp(mem, lp, 0);
        frames::set_frame_stack_offset(mem, lp, sp.wrapping_sub(lp));
        frames::set_frame_mp(mem, lp, mp);
        frames::set_frame_cp(mem, lp, klass);
        frames::set_frame_ip(mem, lp, mp + frames::method_header_size(mem, mp));
        frames::set_chunk_last_lp(mem, chunk, lp);
        log::debug!(target: "squawk::interp", "new context 0x{chunk:x} running {}", call.name());
        Ok(chunk)
    }

    // ── Main loop ─────────────────────────────────────────────────────

    /// Run the context in `chunk` until it must be suspended.
    ///
    /// With `gc_worked == false` the last collection could not satisfy the
    /// failed allocation and execution resumes by throwing the
    /// out-of-memory error from the suspended frame.
    pub fn interpret(&mut self, heap: &mut Heap, chunk: u32, gc_worked: bool) -> VmResult<Suspension> {
        self.load_context(&mut heap.om.mem, chunk)?;
        self.gc_worked = gc_worked;
        if !gc_worked {
            self.ip = throw_bytecode_address(heap)?;
        }
        loop {
            self.instruction_count += 1;
            if self.trace.contains(TraceFlags::INSTRUCTIONS) {
                self.trace_instruction(&heap.om.mem);
            }
            match self.step(heap)? {
                Step::Continue => {}
                Step::Call(call) => self.call_support(heap, call)?,
                Step::Suspend(suspension) => return Ok(suspension),
            }
        }
    }

    /// Push a frame running `VMExtension.<call>`. The operands on the
    /// stack are its arguments.
    fn call_support(&mut self, heap: &mut Heap, call: SupportCall) -> VmResult<()> {
        if call == SupportCall::Yield {
            let number = class::get_type(&heap.om.mem, self.cp);
            if number & 0xFF00 == 0 || self.no_yield {
                self.bc = TIMEQUANTA;
                return Ok(());
            }
        }
        let (klass, mp) = Self::support_method(heap, call)?;
        let mem = &mut heap.om.mem;
        self.push_frame(mem);
        self.cp = klass;
        self.setup_frame(mem, mp);
        if call == SupportCall::Yield {
            self.bc = TIMEQUANTA;
        }
        log::trace!(target: "squawk::interp", "support call {}", call.name());
        Ok(())
    }

    /// Raise a VM exception: drop the operands and call the support method
    /// that creates and throws it.
    pub(crate) fn raise(&mut self, mem: &Memory, call: SupportCall) -> Step {
        self.clear_stack(mem);
        Step::Call(call)
    }

    /// Unwind to the innermost handler covering the current ip whose
    /// class is a superclass of the exception's.
    pub(crate) fn throw(&mut self, heap: &mut Heap, exception: u32) -> VmResult<Step> {
        let mem = &mut heap.om.mem;
        let klass = crate::header::get_class(mem, exception);
        loop {
            let mp = frames::frame_mp(mem, self.lp);
            let relative_ip = self.ip.wrapping_sub(mp).wrapping_sub(1);
            let target = {
                let mem: &Memory = mem;
                frames::method_handlers(mem, mp)
                    .filter(|h| h.covers(relative_ip))
                    .find(|h| catches(mem, klass, h.class_number))
            };
            if let Some(handler) = target {
                self.ip = mp + handler.handler;
                self.clear_stack(mem);
                self.push(mem, exception);
                log::trace!(target: "squawk::interp", "exception 0x{exception:x} caught at 0x{:x}", self.ip);
                return Ok(Step::Continue);
            }
            let plp = frames::frame_previous_lp(mem, self.lp);
            if plp == 0 && frames::chunk_prev(mem, frames::chunk_from_frame(mem, self.lp)) == 0 {
                return Err(fatal!(
                    "uncaught exception of class {}",
                    class::get_type(mem, klass)
                ));
            }
            self.pop_frame(mem)?;
        }
    }

    fn trace_instruction(&self, mem: &Memory) {
        let len = 16.min(mem.size().saturating_sub(self.ip));
        let bytes = mem.slice(self.ip, len);
        match BytecodeDecoder::new(bytes).next() {
            Some(insn) => log::trace!(
                target: "squawk::interp",
                "0x{:06x} sp=0x{:x} lp=0x{:x} {insn}",
                self.ip,
                self.sp,
                self.lp
            ),
            None => log::trace!(target: "squawk::interp", "0x{:06x} <undecodable>", self.ip),
        }
    }

    // ── Natives ───────────────────────────────────────────────────────

    pub(crate) fn invoke_native(&mut self, heap: &mut Heap, number: u8) -> VmResult<Step> {
        let Some(desc) = self.natives.get(number as usize).copied() else {
            return Err(fatal!("unknown native {number}"));
        };
        if self.trace.contains(TraceFlags::METHODS) {
            log::debug!(target: "squawk::interp", "native {}", desc.name);
        }
        (desc.func)(self, heap)
    }
}

/// Whether an exception of class `klass` is caught by a handler for the
/// class numbered `class_number`.
fn catches(mem: &Memory, mut klass: u32, class_number: u32) -> bool {
    while klass != 0 {
        if class::get_type(mem, klass) == class_number {
            return true;
        }
        klass = class::super_class(mem, klass);
    }
    false
}

/// Operand stack words reserved by the method's leading `extend`.
pub fn method_stack_size(mem: &Memory, mp: u32) -> u32 {
    let at = mp + frames::method_header_size(mem, mp);
    match Op::try_from(mem.fetch_u8(at)) {
        Ok(Op::Extend) => mem.fetch_u8(at + 1) as u32,
        Ok(op) if op.short_form_base() == Some(Op::Extend0) => (op as u8 & 15) as u32,
        _ => 0,
    }
}

/// Address of the `throw` bytecode kept in the RAM segment record.
fn throw_bytecode_address(heap: &Heap) -> VmResult<u32> {
    let addr = heap.om.segment(Segment::Ram).start + (GCI_RES1 * 4) as u32;
    if heap.om.mem.fetch_u8(addr) != Op::Throw as u8 {
        return Err(fatal!("RAM segment record has no throw bytecode"));
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::cno;
    use crate::romizer::{MethodDef, RomBuilder, native};
    use crate::vm::Vm;
    use bytecode::BytecodeBuilder;

    const MAIN_SLOT: u8 = 0;

    fn create_test_rom() -> (RomBuilder, u32) {
        let mut rom = RomBuilder::new();
        let suite = rom.add_suite();
        let main = rom.add_class(suite, "Main", cno::OBJECT, 0, 0);
        (rom, main)
    }

    fn run_program(mut rom: RomBuilder, class: u32, main: MethodDef) -> (i32, String, Vm) {
        rom.set_static_method(class, MAIN_SLOT, main);
        rom.set_main(class, MAIN_SLOT);
        let settings = VmSettings::default();
        let om = rom.build_object_memory(0x1000, 0x8000, &settings);
        let mut vm = Vm::boot(om, settings).unwrap();
        vm.interpreter_mut().capture_output();
        let code = vm.run().unwrap();
        let out = String::from_utf8(vm.interpreter_mut().take_output()).unwrap();
        (code, out, vm)
    }

    fn print_int(b: &mut BytecodeBuilder) {
        native(b, "printInt");
        b.const_int(' ' as i32);
        native(b, "putch");
    }

    fn exit_with(b: &mut BytecodeBuilder, code: i32) {
        b.const_int(code);
        native(b, "exit");
        b.op(Op::Return);
    }

    /// `extend1; newobject; load0; return1`
    fn constructor() -> MethodDef {
        let mut b = BytecodeBuilder::new();
        b.extend(1);
        b.op(Op::Newobject);
        b.load(0);
        b.op(Op::Return1);
        MethodDef::new(1, 1, b).with_oop_map(0b1)
    }

    /// A virtual method returning `value`.
    fn returning(value: i32) -> MethodDef {
        let mut b = BytecodeBuilder::new();
        b.extend(1);
        b.const_int(value);
        b.op(Op::Return1);
        MethodDef::new(1, 1, b).with_oop_map(0b1)
    }

    #[test]
    fn integer_arithmetic() {
        let (rom, main) = create_test_rom();
        let mut b = BytecodeBuilder::new();
        b.extend(4);
        b.const_int(7);
        b.const_int(6);
        b.op(Op::Imul);
        b.const_int(2);
        b.op(Op::Isub);
        b.const_int(4);
        b.op(Op::Idiv);
        print_int(&mut b);
        b.const_int(3);
        b.op(Op::Neg);
        print_int(&mut b);
        b.const_int(40);
        b.const_int(3);
        b.op(Op::Irem);
        print_int(&mut b);
        b.const_int(3);
        b.const_int(2);
        b.op(Op::Ishl);
        print_int(&mut b);
        b.const_int(-8);
        b.const_int(28);
        b.op(Op::Iushr);
        print_int(&mut b);
        exit_with(&mut b, 0);

        let (code, out, _) = run_program(rom, main, MethodDef::new(0, 0, b));
        assert_eq!(code, 0);
        assert_eq!(out, "10 -3 1 12 15 ");
    }

    #[test]
    fn loops_branch_backwards() {
        let (rom, main) = create_test_rom();
        // local 0: i, local 1: sum
        let mut b = BytecodeBuilder::new();
        b.extend(3);
        b.const_int(0);
        b.store(1);
        b.const_int(1);
        b.store(0);
        let head = b.current_offset();
        b.load(0);
        b.const_int(10);
        let done = b.branch(Op::IfIcmpgt);
        b.load(1);
        b.load(0);
        b.op(Op::Iadd);
        b.store(1);
        b.inc(0);
        b.branch_to(Op::Goto, head);
        b.bind(done);
        b.load(1);
        native(&mut b, "exit");
        b.op(Op::Return);

        let (code, _, _) = run_program(rom, main, MethodDef::new(0, 2, b));
        assert_eq!(code, 55);
    }

    #[test]
    fn static_calls_pass_arguments_and_results() {
        let (mut rom, main) = create_test_rom();
        let this = rom.class_ref(main, main);

        let mut add = BytecodeBuilder::new();
        add.extend(2);
        add.load(0);
        add.load(1);
        add.op(Op::Iadd);
        add.op(Op::Return1);
        rom.set_static_method(main, 2, MethodDef::new(2, 2, add));

        let mut b = BytecodeBuilder::new();
        b.extend(3);
        b.const_int(20);
        b.const_int(22);
        b.class(this);
        b.invoke(Op::Invokestatic1, 2);
        native(&mut b, "exit");
        b.op(Op::Return);

        let (code, _, _) = run_program(rom, main, MethodDef::new(0, 0, b));
        assert_eq!(code, 42);
    }

    #[test]
    fn virtual_calls_dispatch_on_the_receiver() {
        let (mut rom, main) = create_test_rom();
        let suite = main >> 8;
        let base = rom.add_class(suite, "Base", cno::OBJECT, 0, 0);
        let derived = rom.add_class(suite, "Derived", base, 0, 0);
        for (class, value) in [(base, 1), (derived, 2)] {
            rom.set_static_method(class, 0, constructor());
            rom.set_virtual_method(class, 0, returning(value));
        }
        let base_ref = rom.class_ref(main, base);
        let derived_ref = rom.class_ref(main, derived);

        let mut b = BytecodeBuilder::new();
        b.extend(3);
        for class in [derived_ref, base_ref] {
            b.const_null();
            b.class(class);
            b.invoke(Op::Invokeinit1, 0);
            b.store(0);
            b.load(0);
            b.invoke(Op::Invokevirtual1, 0);
            print_int(&mut b);
        }
        exit_with(&mut b, 0);

        let (code, out, _) = run_program(rom, main, MethodDef::new(0, 1, b).with_oop_map(0b1));
        assert_eq!(code, 0);
        assert_eq!(out, "2 1 ");
    }

    #[test]
    fn deep_recursion_extends_into_new_chunks() {
        let (mut rom, main) = create_test_rom();
        let this = rom.class_ref(main, main);

        // sum(n) = n == 0 ? 0 : n + sum(n - 1)
        let mut sum = BytecodeBuilder::new();
        sum.extend(3);
        sum.load(0);
        let recurse = sum.branch(Op::Ifne);
        sum.const_int(0);
        sum.op(Op::Return1);
        sum.bind(recurse);
        sum.load(0);
        sum.const_int(1);
        sum.op(Op::Isub);
        sum.class(this);
        sum.invoke(Op::Invokestatic1, 2);
        sum.load(0);
        sum.op(Op::Iadd);
        sum.op(Op::Return1);
        rom.set_static_method(main, 2, MethodDef::new(1, 1, sum));

        let mut b = BytecodeBuilder::new();
        b.extend(3);
        b.const_int(200);
        b.class(this);
        b.invoke(Op::Invokestatic1, 2);
        print_int(&mut b);
        exit_with(&mut b, 0);

        let (code, out, vm) = run_program(rom, main, MethodDef::new(0, 0, b));
        assert_eq!(code, 0);
        assert_eq!(out, "20100 ");
        assert!(vm.heap().om.stats.stack_chunks > 10);
    }

    #[test]
    fn exceptions_unwind_three_frames() {
        let (mut rom, main) = create_test_rom();
        let this = rom.class_ref(main, main);
        let arithmetic = rom.class_ref(main, cno::ARITHMETIC_EXCEPTION);

        // Leaves an operand behind that the unwind must drop.
        let mut divide = BytecodeBuilder::new();
        divide.extend(3);
        divide.const_int(77);
        divide.const_int(1);
        divide.const_int(0);
        divide.op(Op::Idiv);
        divide.op(Op::Pop);
        divide.op(Op::Pop);
        divide.op(Op::Return);
        rom.set_static_method(main, 4, MethodDef::new(0, 0, divide));
        // slot 3 calls slot 4, slot 2 calls slot 3
        for slot in [3, 2] {
            let mut b = BytecodeBuilder::new();
            b.extend(1);
            b.class(this);
            b.invoke(Op::Invokestatic, slot + 1);
            b.op(Op::Return);
            rom.set_static_method(main, slot, MethodDef::new(0, 0, b));
        }

        // local 0: the caught exception
        let mut b = BytecodeBuilder::new();
        b.extend(2);
        let start = b.current_offset();
        b.class(this);
        b.invoke(Op::Invokestatic, 2);
        let end = b.current_offset();
        exit_with(&mut b, 0);
        let handler = b.current_offset();
        b.store(0);
        b.load(0);
        b.class(arithmetic);
        b.op(Op::Instanceof);
        let wrong_class = b.branch(Op::Ifeq);
        b.const_int(9);
        native(&mut b, "exit");
        let exited = b.current_offset();
        b.op(Op::Return);
        b.bind(wrong_class);
        exit_with(&mut b, 8);
        let method = MethodDef::new(0, 1, b)
            .with_oop_map(0b1)
            .with_handler(start, end, handler, cno::THROWABLE);

        let (code, _, mut vm) = run_program(rom, main, method);
        assert_eq!(code, 9);

        let (lp, sp, ip) = {
            let interp = vm.interpreter_mut();
            (interp.lp, interp.sp, interp.ip)
        };
        let mem = &vm.heap().om.mem;
        let mp = frames::frame_mp(mem, lp);
        assert_eq!(ip, mp + frames::method_header_size(mem, mp) + exited as u32);
        // The handler popped the only operand it was given.
        assert_eq!(sp, lp + frames::frame_stack_offset(mem, lp));
        let exception = mem.get_word(lp, 0);
        let klass = crate::header::get_class(mem, exception);
        assert_eq!(class::get_type(mem, klass), cno::ARITHMETIC_EXCEPTION);
    }

    #[test]
    fn null_receivers_and_bad_indices_raise() {
        for (fault, exit) in [(cno::NULL_POINTER_EXCEPTION, 4), (cno::ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, 5)] {
            let (mut rom, main) = create_test_rom();
            let int_array = rom.class_ref(main, cno::INT_ARRAY);
            let mut b = BytecodeBuilder::new();
            b.extend(3);
            let start = b.current_offset();
            if fault == cno::NULL_POINTER_EXCEPTION {
                b.const_null();
                b.invoke(Op::Invokevirtual, 0);
            } else {
                b.const_int(2);
                b.class(int_array);
                b.op(Op::Newarray);
                b.const_int(5);
                b.const_int(1);
                b.op(Op::Astore);
            }
            let end = b.current_offset();
            exit_with(&mut b, 0);
            let handler = b.current_offset();
            b.op(Op::Pop);
            exit_with(&mut b, exit);
            let method = MethodDef::new(0, 0, b).with_handler(start, end, handler, fault);

            let (code, _, _) = run_program(rom, main, method);
            assert_eq!(code, exit);
        }
    }

    #[test]
    fn static_access_runs_the_class_initializer_once() {
        let (mut rom, main) = create_test_rom();
        let suite = main >> 8;
        let counter = rom.add_class(suite, "Counter", cno::OBJECT, 0, 0);
        rom.set_statics(counter, 1, 0);
        let banner = rom.string_ref(counter, "init ");
        let field = CLS_STATE_OFFSET_TO_FIELDS as u8;

        let mut clinit = BytecodeBuilder::new();
        clinit.extend(2);
        clinit.object(banner);
        native(&mut clinit, "print");
        clinit.const_int(40);
        clinit.op_u8(Op::ClassPutstatic, field);
        clinit.op(Op::Return);
        rom.set_clinit(counter, MethodDef::new(0, 0, clinit));
        let counter_ref = rom.class_ref(main, counter);

        let mut b = BytecodeBuilder::new();
        b.extend(3);
        b.class(counter_ref);
        b.op_u8(Op::Getstatic, field);
        b.const_int(2);
        b.op(Op::Iadd);
        b.class(counter_ref);
        b.op_u8(Op::Putstatic, field);
        b.class(counter_ref);
        b.op_u8(Op::Getstatic, field);
        native(&mut b, "exit");
        b.op(Op::Return);

        let (code, out, _) = run_program(rom, main, MethodDef::new(0, 0, b));
        assert_eq!(code, 42);
        assert_eq!(out, "init ");
    }
}
