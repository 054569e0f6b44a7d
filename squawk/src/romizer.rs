//! Builds ROM images from class descriptions.
//!
//! [`RomBuilder`] starts out with the well-known classes of suite 0 and a
//! `VMExtension` whose support methods are small bytecode stubs built on
//! the natives. Callers add suites, classes and methods, then lay the
//! whole thing out with [`RomBuilder::build_object_memory`]:
//!
//! ```text
//! 0            ROM_START                     eeprom.start     ram.start
//! [ unused    ][ MSR | classes, tables, code ][ MSR | free  ][ MSR | heap ]
//! ```
//!
//! Everything written to ROM is immutable afterwards. The RAM segment
//! record gets the `throw` bytecode in its first reserved word and a
//! reference to the ROM `OutOfMemoryError` instance.

use std::collections::{BTreeMap, HashMap};

use bytecode::{BytecodeBuilder, Op};

use crate::class::cno;
use crate::config::VmSettings;
use crate::frames;
use crate::header;
use crate::heap::{ObjectMemory, SegmentRange};
use crate::interpreter::{SupportCall, native_number};
use crate::layout::*;
use crate::memory::{Endian, Memory, roundup4};

/// Address of the ROM segment record. Everything below is unused so that
/// no object ever lives at a small address.
pub const ROM_START: u32 = 0x100;

/// Upper bound on the ROM built by [`RomBuilder`].
const MAX_ROM_SIZE: u32 = 1 << 20;

/// Static method slot of `<clinit>` in classes marked `ACC_MUSTCLINIT`.
pub const CLINIT_SLOT: u8 = 1;

/// Virtual slot of `Thread.run`.
pub const THREAD_RUN_SLOT: u32 = 0;

// ── Methods ───────────────────────────────────────────────────────────

/// A row of a method's exception table. Offsets are bytes from the first
/// bytecode of the method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerDef {
    pub start: u16,
    pub end: u16,
    pub handler: u16,
    pub class_number: u16,
}

/// Bytecode and frame shape of one method.
#[derive(Debug, Clone)]
pub struct MethodDef {
    nparms: u8,
    nlocals: u8,
    /// Bit `i` is set when local `i` holds a reference.
    oop_map: u32,
    handlers: Vec<HandlerDef>,
    code: Vec<u8>,
}

impl MethodDef {
    pub fn new(nparms: u8, nlocals: u8, code: BytecodeBuilder) -> Self {
        assert!(nparms <= nlocals, "{nparms} parameters but {nlocals} locals");
        assert!(nlocals <= 32, "oop maps cover at most 32 locals");
        Self {
            nparms,
            nlocals,
            oop_map: 0,
            handlers: Vec::new(),
            code: code.into_bytes(),
        }
    }

    pub fn with_oop_map(mut self, map: u32) -> Self {
        self.oop_map = map;
        self
    }

    /// Catch `class_number` thrown from `[start, end)` at `handler`.
    pub fn with_handler(mut self, start: usize, end: usize, handler: usize, class_number: u32) -> Self {
        let half = |v: usize| u16::try_from(v).unwrap_or_else(|_| panic!("handler offset {v} too large"));
        self.handlers.push(HandlerDef {
            start: half(start),
            end: half(end),
            handler: half(handler),
            class_number: half(class_number as usize),
        });
        self
    }

    /// Append code after the method body and return its offset.
    pub fn append_code(&mut self, code: &[u8]) -> usize {
        let offset = self.code.len();
        self.code.extend_from_slice(code);
        offset
    }

    fn header_size(&self) -> u32 {
        frames::method_handlers_offset(self.nlocals as u32) + self.handlers.len() as u32 * MTH_HANDLER_SIZE
    }

    /// The bytes of the method object: header, oop map, handlers, code.
    fn encode(&self, number: u32) -> Vec<u8> {
        let header_size = self.header_size();
        assert!(header_size <= 255, "method header of {header_size} bytes");
        let mut bytes = vec![
            header_size as u8,
            (number >> 8) as u8,
            (number & 0xFF) as u8,
            self.nparms,
            self.nlocals,
        ];
        bytes.extend((0..(self.nlocals as u32).div_ceil(8)).map(|i| (self.oop_map >> (i * 8)) as u8));
        for h in &self.handlers {
            let rel = |v: u16| (v as u32 + header_size) as u16;
            for half in [rel(h.start), rel(h.end), rel(h.handler), h.class_number] {
                bytes.extend_from_slice(&half.to_be_bytes());
            }
        }
        debug_assert_eq!(bytes.len() as u32, header_size);
        bytes.extend_from_slice(&self.code);
        bytes
    }
}

// ── Classes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct ClassDef {
    name: String,
    number: u32,
    access: u32,
    super_number: u32,
    element: u32,
    fields: u32,
    oop_map: u32,
    statics: u32,
    pointer_statics: u32,
    static_methods: Vec<Option<MethodDef>>,
    virtual_methods: BTreeMap<u32, MethodDef>,
    interfaces: Vec<(u32, Vec<u8>)>,
    class_refs: Vec<u32>,
    strings: Vec<String>,
}

impl ClassDef {
    fn new(name: &str, number: u32, super_number: u32) -> Self {
        Self {
            name: name.to_string(),
            number,
            super_number,
            ..Default::default()
        }
    }

    fn array(name: &str, number: u32, element: u32) -> Self {
        Self {
            element,
            ..Self::new(name, number, cno::OBJECT)
        }
    }

    fn instance(name: &str, number: u32, fields: u32, oop_map: u32) -> Self {
        Self {
            fields,
            oop_map,
            ..Self::new(name, number, cno::OBJECT)
        }
    }

    fn set_static_method(&mut self, slot: u8, method: MethodDef) {
        let slot = slot as usize;
        if self.static_methods.len() <= slot {
            self.static_methods.resize(slot + 1, None);
        }
        self.static_methods[slot] = Some(method);
    }

    fn class_ref(&mut self, target: u32) -> u16 {
        let index = match self.class_refs.iter().position(|n| *n == target) {
            Some(i) => i,
            None => {
                self.class_refs.push(target);
                self.class_refs.len() - 1
            }
        };
        index as u16
    }
}

fn well_known_classes() -> Vec<Option<ClassDef>> {
    let mut classes = vec![None];
    let primitives = ["boolean", "byte", "char", "short", "int", "long", "float", "double"];
    for (i, name) in primitives.iter().enumerate() {
        classes.push(Some(ClassDef::new(name, cno::BOOLEAN + i as u32, 0)));
    }
    classes.push(Some(ClassDef::new("java.lang.Object", cno::OBJECT, 0)));
    // Class objects only ever live in ROM, the map is informational.
    classes.push(Some(ClassDef::instance("java.lang.Class", cno::CLASS, CLS_FIELD_COUNT, 0xFF04)));
    classes.push(Some(ClassDef::array("java.lang.String", cno::STRING, cno::CHAR)));
    classes.push(Some(ClassDef::array("java.lang.StringOfBytes", cno::STRING_OF_BYTES, cno::BYTE)));
    let arrays = ["[boolean", "[byte", "[char", "[short", "[int", "[long", "[float", "[double"];
    for (i, name) in arrays.iter().enumerate() {
        classes.push(Some(ClassDef::array(name, cno::BOOLEAN_ARRAY + i as u32, cno::BOOLEAN + i as u32)));
    }
    classes.push(Some(ClassDef::array("[java.lang.Object", cno::OBJECT_ARRAY, cno::OBJECT)));
    classes.push(Some(ClassDef::array("[java.lang.String", cno::STRING_ARRAY, cno::STRING)));
    classes.push(Some(ClassDef::array("[local", cno::LOCAL_ARRAY, cno::INT)));
    classes.push(Some(ClassDef::array("[global", cno::GLOBAL_ARRAY, cno::INT)));
    classes.push(Some(ClassDef::new("java.lang.VMExtension", cno::VM_EXTENSION, cno::OBJECT)));
    classes.push(Some(ClassDef::instance(
        "java.lang.ObjectAssociation",
        cno::OBJECT_ASSOCIATION,
        ASSN_FIELD_COUNT,
        0b111,
    )));
    classes.push(Some(ClassDef::instance("java.lang.Suite", cno::SUITE, SUITE_FIELD_COUNT, 0b1)));
    classes.push(Some(ClassDef::instance("java.lang.Thread", cno::THREAD, THREAD_FIELD_COUNT, 0b1)));
    classes.push(Some(ClassDef::instance(
        "java.lang.Monitor",
        cno::MONITOR,
        MONITOR_FIELD_COUNT,
        1 << MONITOR_OWNER | 1 << MONITOR_MONITOR_QUEUE | 1 << MONITOR_CONDVAR_QUEUE,
    )));
    classes.push(Some(ClassDef::new("java.lang.Throwable", cno::THROWABLE, cno::OBJECT)));
    let exceptions = [
        ("java.lang.OutOfMemoryError", cno::OUT_OF_MEMORY_ERROR),
        ("java.lang.NullPointerException", cno::NULL_POINTER_EXCEPTION),
        ("java.lang.ArrayIndexOutOfBoundsException", cno::ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION),
        ("java.lang.ArithmeticException", cno::ARITHMETIC_EXCEPTION),
        ("java.lang.ArrayStoreException", cno::ARRAY_STORE_EXCEPTION),
        ("java.lang.ClassCastException", cno::CLASS_CAST_EXCEPTION),
    ];
    for (name, number) in exceptions {
        classes.push(Some(ClassDef::new(name, number, cno::THROWABLE)));
    }
    debug_assert_eq!(classes.len() as u32, cno::FIRST_USER);
    for (i, def) in classes.iter().enumerate() {
        if let Some(def) = def {
            debug_assert_eq!(def.number, i as u32, "{} out of place", def.name);
        }
    }
    classes
}

// ── Builder ───────────────────────────────────────────────────────────

/// Describes the contents of a ROM and lays it out in memory.
#[derive(Debug, Clone)]
pub struct RomBuilder {
    suites: Vec<Vec<Option<ClassDef>>>,
    support: Vec<Option<MethodDef>>,
    main: Option<(u32, u8)>,
    endian: Endian,
}

impl Default for RomBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RomBuilder {
    pub fn new() -> Self {
        Self {
            suites: vec![well_known_classes()],
            support: vec![None; SupportCall::ALL.len()],
            main: None,
            endian: Endian::Big,
        }
    }

    /// Byte order of the memory the image is built in.
    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Start a new suite and return its number.
    pub fn add_suite(&mut self) -> u32 {
        assert!(self.suites.len() < 256, "too many suites");
        self.suites.push(Vec::new());
        (self.suites.len() - 1) as u32
    }

    /// Add an instance class. `fields` counts every field including the
    /// inherited ones; the superclass's oop map is merged into `oop_map`
    /// when the ROM is built.
    pub fn add_class(&mut self, suite: u32, name: &str, super_number: u32, fields: u32, oop_map: u32) -> u32 {
        let classes = &mut self.suites[suite as usize];
        assert!(classes.len() < 256, "suite {suite} is full");
        let number = suite << 8 | classes.len() as u32;
        classes.push(Some(ClassDef {
            fields,
            oop_map,
            ..ClassDef::new(name, number, super_number)
        }));
        number
    }

    /// Add an array class whose elements are of class `element`.
    pub fn add_array_class(&mut self, suite: u32, name: &str, element: u32) -> u32 {
        let number = self.add_class(suite, name, cno::OBJECT, 0, 0);
        self.def_mut(number).element = element;
        number
    }

    fn def(&self, number: u32) -> &ClassDef {
        self.suites
            .get((number >> 8) as usize)
            .and_then(|s| s.get((number & 0xFF) as usize))
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("no class numbered {number}"))
    }

    fn def_mut(&mut self, number: u32) -> &mut ClassDef {
        self.suites
            .get_mut((number >> 8) as usize)
            .and_then(|s| s.get_mut((number & 0xFF) as usize))
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("no class numbered {number}"))
    }

    pub fn set_access(&mut self, number: u32, flags: u32) {
        self.def_mut(number).access = flags;
    }

    /// Give the class `total` static words, the first `pointers` of which
    /// hold references.
    pub fn set_statics(&mut self, number: u32, total: u32, pointers: u32) {
        assert!(pointers <= total);
        let def = self.def_mut(number);
        def.statics = total;
        def.pointer_statics = pointers;
    }

    /// Append a static method and return its slot.
    pub fn add_static_method(&mut self, number: u32, method: MethodDef) -> u8 {
        let def = self.def_mut(number);
        let slot = u8::try_from(def.static_methods.len()).unwrap_or_else(|_| panic!("too many static methods"));
        def.set_static_method(slot, method);
        slot
    }

    pub fn set_static_method(&mut self, number: u32, slot: u8, method: MethodDef) {
        self.def_mut(number).set_static_method(slot, method);
    }

    pub fn set_virtual_method(&mut self, number: u32, slot: u32, method: MethodDef) {
        self.def_mut(number).virtual_methods.insert(slot, method);
    }

    /// Declare that the class implements `interface`. Entry `i` of `slots`
    /// is the virtual slot of interface method `i`.
    pub fn add_interface(&mut self, number: u32, interface: u32, slots: Vec<u8>) {
        self.def_mut(number).interfaces.push((interface, slots));
    }

    /// Install `<clinit>` and mark the class as needing initialisation.
    pub fn set_clinit(&mut self, number: u32, method: MethodDef) {
        let def = self.def_mut(number);
        def.access |= ACC_MUSTCLINIT;
        def.set_static_method(CLINIT_SLOT, method);
    }

    /// Index of `target` in the class reference table of `number`, for the
    /// `class` bytecode.
    pub fn class_ref(&mut self, number: u32, target: u32) -> u16 {
        self.def_mut(number).class_ref(target)
    }

    /// Index of a string literal in the object table of `number`, for the
    /// `object` bytecode.
    pub fn string_ref(&mut self, number: u32, text: &str) -> u16 {
        let def = self.def_mut(number);
        def.strings.push(text.to_string());
        (def.strings.len() - 1) as u16
    }

    /// Static method run by `VMExtension.vmstart`.
    pub fn set_main(&mut self, number: u32, slot: u8) {
        self.main = Some((number, slot));
    }

    /// Replace the default implementation of a support method.
    pub fn set_support_method(&mut self, call: SupportCall, method: MethodDef) {
        self.support[call.slot() as usize] = Some(method);
    }

    /// Write the class words a header test needs at `addr`.
    pub fn write_test_class(mem: &mut Memory, addr: u32, number: u32, element: u32, fields: u32) {
        mem.set_word(addr, CLS_TYPE, number);
        mem.set_word(addr, CLS_ELEMENT_TYPE, element);
        mem.set_word(addr, CLS_INSTANCE_FIELDS_LENGTH, fields);
    }

    // ── Support methods ───────────────────────────────────────────────

    fn install_support(&mut self) {
        let main = self.main.map(|(number, slot)| (self.class_ref(cno::VM_EXTENSION, number), slot));
        for call in SupportCall::ALL {
            let method = match self.support[call.slot() as usize].take() {
                Some(method) => method,
                None => self.default_support(call, main),
            };
            self.def_mut(cno::VM_EXTENSION).set_static_method(call.slot() as u8, method);
        }

        for number in cno::THROWABLE..cno::FIRST_USER {
            if self.def(number).static_methods.is_empty() {
                self.def_mut(number).set_static_method(0, constructor());
            }
        }
        if !self.def(cno::THREAD).virtual_methods.contains_key(&THREAD_RUN_SLOT) {
            let mut b = BytecodeBuilder::new();
            b.extend(0);
            b.op(Op::Return);
            self.set_virtual_method(cno::THREAD, THREAD_RUN_SLOT, MethodDef::new(1, 1, b).with_oop_map(0b1));
        }

        for suite in &mut self.suites {
            for def in suite.iter_mut().flatten() {
                let needs_clinit = def.access & ACC_MUSTCLINIT != 0
                    && !matches!(def.static_methods.get(CLINIT_SLOT as usize), Some(Some(_)));
                if needs_clinit {
                    let mut b = BytecodeBuilder::new();
                    b.extend(0);
                    b.op(Op::Return);
                    def.set_static_method(CLINIT_SLOT, MethodDef::new(0, 0, b));
                }
            }
        }
    }

    fn default_support(&mut self, call: SupportCall, main: Option<(u16, u8)>) -> MethodDef {
        let mut b = BytecodeBuilder::new();
        match call {
            SupportCall::Yield | SupportCall::Breakpoint => {
                b.extend(0);
                b.op(Op::Return);
                MethodDef::new(0, 0, b)
            }
            SupportCall::MonitorEnter | SupportCall::MonitorExit => {
                b.extend(0);
                b.op(Op::Return);
                MethodDef::new(1, 1, b).with_oop_map(0b1)
            }
            SupportCall::NullPointerException => self.throw_stub(cno::NULL_POINTER_EXCEPTION, 0),
            SupportCall::ArrayBoundsException => self.throw_stub(cno::ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, 0),
            SupportCall::ArithmeticException => self.throw_stub(cno::ARITHMETIC_EXCEPTION, 0),
            SupportCall::IllegalStoreException => self.throw_stub(cno::ARRAY_STORE_EXCEPTION, 0),
            // Only reached for values that are not simply assignable, and
            // there is no further assignability check to fall back on.
            SupportCall::AstoreOop => self.throw_stub(cno::ARRAY_STORE_EXCEPTION, 3),
            SupportCall::Checkcast => self.throw_stub(cno::CLASS_CAST_EXCEPTION, 2),
            SupportCall::InstanceOf => {
                b.extend(1);
                b.const_int(0);
                b.op(Op::Return1);
                MethodDef::new(2, 2, b)
            }
            SupportCall::GetStatic | SupportCall::GetStaticLong => {
                // (offset, class) with the class state in local 2
                retry_until_allocated(&mut b, 2, |b| {
                    b.load(1);
                    b.op(Op::Clinit);
                    b.load(1);
                    native(b, "getClassState");
                });
                b.load(2);
                b.load(0);
                if call == SupportCall::GetStatic {
                    native(&mut b, "primGetStatic");
                    b.op(Op::Return1);
                } else {
                    native(&mut b, "primGetStaticLong");
                    b.op(Op::Return2);
                }
                MethodDef::new(2, 3, b).with_oop_map(0b100)
            }
            SupportCall::PutStatic | SupportCall::PutStaticObj => {
                // (value, offset, class) with the class state in local 3
                retry_until_allocated(&mut b, 3, |b| {
                    b.load(2);
                    b.op(Op::Clinit);
                    b.load(2);
                    native(b, "getClassState");
                });
                b.load(3);
                b.load(1);
                b.load(0);
                let (name, map) = if call == SupportCall::PutStatic {
                    ("primPutStatic", 0b1000)
                } else {
                    ("primPutStaticObj", 0b1001)
                };
                native(&mut b, name);
                b.op(Op::Return);
                MethodDef::new(3, 4, b).with_oop_map(map)
            }
            SupportCall::PutStaticLong => {
                // (value:2, offset, class) with the class state in local 4
                retry_until_allocated(&mut b, 4, |b| {
                    b.load(3);
                    b.op(Op::Clinit);
                    b.load(3);
                    native(b, "getClassState");
                });
                b.load(4);
                b.load(2);
                b.load_i2(0);
                native(&mut b, "primPutStaticLong");
                b.op(Op::Return);
                MethodDef::new(4, 5, b).with_oop_map(0b10000)
            }
            SupportCall::InitializeClass => {
                // (class) with the new class state in local 1
                retry_until_allocated(&mut b, 1, |b| {
                    b.load(0);
                    native(b, "createClassState");
                });
                b.load(0);
                b.load(1);
                native(&mut b, "setClassState");
                b.load(0);
                b.invoke(Op::Invokestatic, CLINIT_SLOT);
                b.op(Op::Return);
                MethodDef::new(1, 2, b).with_oop_map(0b10)
            }
            SupportCall::NewArray => {
                // (count, class) with the array in local 2
                retry_until_allocated(&mut b, 2, |b| {
                    b.load(1);
                    b.load(0);
                    native(b, "primNewArray");
                });
                b.load(2);
                b.op(Op::Return1);
                MethodDef::new(2, 3, b).with_oop_map(0b100)
            }
            SupportCall::NewDimension => {
                b.extend(1);
                b.load(0);
                b.op(Op::Return1);
                MethodDef::new(2, 2, b).with_oop_map(0b1)
            }
            SupportCall::RegisterForFinalization => {
                // (object) with its association in local 1
                retry_until_allocated(&mut b, 1, |b| {
                    b.load(0);
                    native(b, "getAssociation");
                });
                b.load(1);
                b.load(1);
                b.op_u8(Op::Getfield, ASSN_FLAGS as u8);
                b.const_int(ASSN_FLAG_HAS_FINALIZER as i32);
                b.op(Op::Ior);
                b.op_u8(Op::Putfield, ASSN_FLAGS as u8);
                b.op(Op::Return);
                MethodDef::new(1, 2, b).with_oop_map(0b11)
            }
            SupportCall::Callrun => {
                b.extend(3);
                b.load(0);
                b.invoke(Op::Invokevirtual, THREAD_RUN_SLOT as u8);
                b.const_int(0);
                native(&mut b, "exit");
                b.op(Op::Return);
                MethodDef::new(1, 1, b).with_oop_map(0b1)
            }
            SupportCall::Vmstart => {
                b.extend(3);
                if let Some((class_index, slot)) = main {
                    b.class(class_index);
                    b.invoke(Op::Invokestatic, slot);
                }
                b.const_int(0);
                native(&mut b, "exit");
                b.op(Op::Return);
                MethodDef::new(0, 0, b)
            }
        }
    }

    /// `new <exception>(); throw` with `nparms` ignored parameters.
    fn throw_stub(&mut self, exception: u32, nparms: u8) -> MethodDef {
        let index = self.class_ref(cno::VM_EXTENSION, exception);
        let mut b = BytecodeBuilder::new();
        b.extend(3);
        b.const_null();
        b.class(index);
        b.invoke(Op::Invokeinit1, 0);
        b.op(Op::Throw);
        MethodDef::new(nparms, nparms, b)
    }

    // ── Layout ────────────────────────────────────────────────────────

    /// Lay out ROM followed by an empty EEPROM of `eeprom_size` bytes and
    /// an empty RAM of `ram_size` bytes.
    ///
    /// RAM gets no partition and no class state table; the heap sets
    /// those up when it is created.
    pub fn build_object_memory(mut self, eeprom_size: u32, ram_size: u32, settings: &VmSettings) -> ObjectMemory {
        self.install_support();
        let mut writer = RomWriter::new(self.endian);
        let (suite_table, vm_extension, oom) = writer.write(&self);
        let rom_size = roundup8(writer.next - ROM_START);

        let eeprom = SegmentRange::new(ROM_START + rom_size, roundup8(eeprom_size.max(MSR_BYTES)));
        let ram = SegmentRange::new(eeprom.end(), roundup8(ram_size.max(MSR_BYTES)));
        assert!(ram.end() <= header::CLASS_MASK, "image does not fit a 24 bit address space");

        let mut mem = Memory::new(ram.end(), self.endian);
        mem.slice_mut(ROM_START, rom_size)
            .copy_from_slice(writer.mem.slice(ROM_START, rom_size));
        let rom = SegmentRange::new(ROM_START, rom_size);
        mem.set_word(rom.start, GCI_OBJECT_MEMORY_START, rom.heap_start());
        mem.set_word(rom.start, GCI_OBJECT_MEMORY_SIZE, rom.end() - rom.heap_start());
        mem.set_word(rom.start, GCI_PARTITION_START, rom.heap_start());
        mem.set_word(rom.start, GCI_PARTITION_FREE, writer.next);
        mem.set_word(rom.start, GCI_PARTITION_END, rom.end());
        mem.set_word(rom.start, MSR_ROOTS + root::VM_EXTENSION, vm_extension);
        mem.set_word(rom.start, MSR_ROOTS + root::SUITE_TABLE, suite_table);

        mem.set_byte(ram.start, GCI_RES1 * 4, Op::Throw as u8);
        mem.set_word(ram.start, MSR_ROOTS + root::OUT_OF_MEMORY_OBJECT, oom);

        log::debug!(
            target: "squawk::image",
            "built ROM of {rom_size} bytes with {} classes in {} suites",
            self.suites.iter().flatten().flatten().count(),
            self.suites.len()
        );
        ObjectMemory::new(mem, rom, eeprom, ram, settings)
    }
}

fn roundup8(n: u32) -> u32 {
    (n + 7) & !7
}

/// Push a dummy class reference and call the native `name`.
pub(crate) fn native(b: &mut BytecodeBuilder, name: &str) {
    let number = native_number(name).unwrap_or_else(|| panic!("no native named {name}"));
    b.const_null();
    b.invoke(Op::Invokenative, number);
}

/// Emit `extend` and a loop that runs `attempt` (which leaves a reference
/// or 0 on the stack) into `local`, collecting garbage until it is not 0.
/// When a collection fails the frame resumes by throwing the
/// out-of-memory error.
fn retry_until_allocated(b: &mut BytecodeBuilder, local: u8, attempt: impl Fn(&mut BytecodeBuilder)) {
    b.extend(6);
    let head = b.current_offset();
    attempt(b);
    b.store(local);
    b.load(local);
    let done = b.branch(Op::Ifne);
    native(b, "gc");
    b.branch_to(Op::Goto, head);
    b.bind(done);
}

/// `<init>` of an exception class: allocate the receiver when the caller
/// passed none.
fn constructor() -> MethodDef {
    let mut b = BytecodeBuilder::new();
    b.extend(1);
    b.op(Op::Newobject);
    b.load(0);
    b.op(Op::Return1);
    MethodDef::new(1, 1, b).with_oop_map(0b1)
}

// ── ROM writer ────────────────────────────────────────────────────────

/// Bump allocator over a scratch memory at [`ROM_START`].
struct RomWriter {
    mem: Memory,
    next: u32,
    classes: HashMap<u32, u32>,
}

impl RomWriter {
    fn new(endian: Endian) -> Self {
        Self {
            mem: Memory::new(ROM_START + MAX_ROM_SIZE, endian),
            next: ROM_START + MSR_BYTES,
            classes: HashMap::new(),
        }
    }

    fn class(&self, number: u32) -> u32 {
        self.classes[&number]
    }

    fn reserve(&mut self, bytes: u32) {
        self.next += roundup4(bytes);
        assert!(self.next <= ROM_START + MAX_ROM_SIZE, "ROM larger than {MAX_ROM_SIZE} bytes");
    }

    fn instance(&mut self, klass: u32, fields: u32) -> u32 {
        let oop = self.next + 4;
        self.reserve(4 + fields * 4);
        if klass != 0 {
            header::set_class(&mut self.mem, oop, klass);
        }
        oop
    }

    fn array(&mut self, array_number: u32, count: u32) -> u32 {
        let klass = self.class(array_number);
        let element = self.mem.get_word(klass, CLS_ELEMENT_TYPE);
        let header_size = header::header_size_for_count(count);
        let oop = self.next + header_size;
        self.reserve(header_size + count * crate::class::element_length(element));
        header::set_class_and_array_count(&mut self.mem, oop, klass, count);
        oop
    }

    fn words(&mut self, values: &[u32]) -> u32 {
        let array = self.array(cno::OBJECT_ARRAY, values.len() as u32);
        for (i, v) in values.iter().enumerate() {
            self.mem.set_word(array, i as i32, *v);
        }
        array
    }

    fn bytes(&mut self, array_number: u32, values: &[u8]) -> u32 {
        let array = self.array(array_number, values.len() as u32);
        self.mem.slice_mut(array, values.len() as u32).copy_from_slice(values);
        array
    }

    fn halves(&mut self, values: &[u16]) -> u32 {
        let array = self.array(cno::CHAR_ARRAY, values.len() as u32);
        for (i, v) in values.iter().enumerate() {
            self.mem.set_half(array, i as i32, *v);
        }
        array
    }

    fn method(&mut self, method: &MethodDef, number: u32) -> u32 {
        self.bytes(cno::BYTE_ARRAY, &method.encode(number))
    }

    /// Returns the suite table, the `VMExtension` class and the
    /// out-of-memory instance.
    fn write(&mut self, builder: &RomBuilder) -> (u32, u32, u32) {
        // Class objects first so every later header can name its class.
        for def in builder.suites.iter().flatten().flatten() {
            let klass = self.instance(0, CLS_FIELD_COUNT);
            self.classes.insert(def.number, klass);
        }
        let class_class = self.class(cno::CLASS);
        for def in builder.suites.iter().flatten().flatten() {
            let klass = self.class(def.number);
            header::set_class(&mut self.mem, klass, class_class);
            self.mem.set_word(klass, CLS_TYPE, def.number);
            self.mem.set_word(klass, CLS_ACCESS, def.access);
            self.mem.set_word(klass, CLS_ELEMENT_TYPE, def.element);
        }

        for def in builder.suites.iter().flatten().flatten() {
            self.write_class(builder, def);
        }

        let mut suites = Vec::new();
        for classes in &builder.suites {
            let numbers: Vec<u32> = classes
                .iter()
                .map(|c| c.as_ref().map_or(0, |def| self.class(def.number)))
                .collect();
            let table = self.words(&numbers);
            let suite = self.instance(self.class(cno::SUITE), SUITE_FIELD_COUNT);
            self.mem.set_word(suite, SUITE_CLASSES, table);
            suites.push(suite);
        }
        let suite_table = self.words(&suites);
        let oom = self.instance(self.class(cno::OUT_OF_MEMORY_ERROR), 0);
        (suite_table, self.class(cno::VM_EXTENSION), oom)
    }

    fn write_class(&mut self, builder: &RomBuilder, def: &ClassDef) {
        let klass = self.class(def.number);
        let super_class = if def.super_number == 0 { 0 } else { self.class(def.super_number) };
        let mut oop_map = def.oop_map;
        let mut ancestor = def.super_number;
        while ancestor != 0 {
            let up = builder.def(ancestor);
            oop_map |= up.oop_map;
            ancestor = up.super_number;
        }

        let mem_words = [
            (CLS_SUPER_CLASS, super_class),
            (CLS_INSTANCE_FIELDS_LENGTH, def.fields),
            (CLS_STATIC_FIELDS_LENGTH, def.statics),
            (CLS_POINTER_STATIC_FIELDS_LENGTH, def.pointer_statics),
        ];
        for (index, value) in mem_words {
            self.mem.set_word(klass, index, value);
        }

        if !def.virtual_methods.is_empty() {
            let first = *def.virtual_methods.keys().next().unwrap_or(&0);
            let last = *def.virtual_methods.keys().next_back().unwrap_or(&0);
            let mut table = vec![0; (last - first + 1) as usize];
            for (slot, method) in &def.virtual_methods {
                table[(slot - first) as usize] = self.method(method, def.number);
            }
            let vtable = self.words(&table);
            self.mem.set_word(klass, CLS_FIRST_VIRTUAL_METHOD, first);
            self.mem.set_word(klass, CLS_VIRTUAL_METHODS, vtable);
        }

        if !def.static_methods.is_empty() {
            let methods: Vec<u32> = def
                .static_methods
                .iter()
                .map(|m| m.as_ref().map_or(0, |m| self.method(m, def.number)))
                .collect();
            let table = self.words(&methods);
            self.mem.set_word(klass, CLS_STATIC_METHODS, table);
        }

        if !def.interfaces.is_empty() {
            let types: Vec<u16> = def.interfaces.iter().map(|(number, _)| *number as u16).collect();
            let types = self.halves(&types);
            let tables: Vec<u32> = def
                .interfaces
                .iter()
                .map(|(_, slots)| self.bytes(cno::BYTE_ARRAY, slots))
                .collect();
            let tables = self.words(&tables);
            self.mem.set_word(klass, CLS_INTERFACE_TYPES, types);
            self.mem.set_word(klass, CLS_INTERFACE_SLOT_TABLES, tables);
        }

        if oop_map != 0 {
            let bytes: Vec<u8> = (0..def.fields.div_ceil(8)).map(|i| (oop_map >> (i * 8)) as u8).collect();
            let map = self.bytes(cno::BYTE_ARRAY, &bytes);
            self.mem.set_word(klass, CLS_OOP_MAP, map);
        }

        if !def.strings.is_empty() {
            let strings: Vec<u32> = def
                .strings
                .iter()
                .map(|s| self.bytes(cno::STRING_OF_BYTES, s.as_bytes()))
                .collect();
            let refs = self.words(&strings);
            self.mem.set_word(klass, CLS_OBJECT_REFERENCES, refs);
        }

        if !def.class_refs.is_empty() {
            let refs: Vec<u16> = def.class_refs.iter().map(|n| *n as u16).collect();
            let refs = self.halves(&refs);
            self.mem.set_word(klass, CLS_CLASS_REFERENCES, refs);
        }
        log::trace!(target: "squawk::image", "class {} ({}) at 0x{klass:x}", def.name, def.number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class;

    fn create_test_memory(builder: RomBuilder) -> ObjectMemory {
        builder.build_object_memory(0x1000, 0x4000, &VmSettings::default())
    }

    #[test]
    fn segments_follow_each_other() {
        let om = create_test_memory(RomBuilder::new());
        let rom = om.segment(Segment::Rom);
        let eeprom = om.segment(Segment::Eeprom);
        let ram = om.segment(Segment::Ram);
        assert_eq!(rom.start, ROM_START);
        assert_eq!(eeprom.start, rom.end());
        assert_eq!(ram.start, eeprom.end());
        assert_eq!(ram.size, 0x4000);
        assert_eq!(om.mem.size(), ram.end());
    }

    #[test]
    fn ram_record_holds_throw_and_oom() {
        let om = create_test_memory(RomBuilder::new());
        let ram = om.segment(Segment::Ram);
        assert_eq!(om.mem.fetch_u8(ram.start + GCI_RES1 as u32 * 4), Op::Throw as u8);
        let oom = om.root(Segment::Ram, root::OUT_OF_MEMORY_OBJECT);
        assert!(om.in_rom(oom));
        assert_eq!(class::get_type(&om.mem, header::get_class(&om.mem, oom)), cno::OUT_OF_MEMORY_ERROR);
    }

    #[test]
    fn every_support_method_is_installed() {
        let om = create_test_memory(RomBuilder::new());
        let ext = om.root(Segment::Rom, root::VM_EXTENSION);
        assert_eq!(class::get_type(&om.mem, ext), cno::VM_EXTENSION);
        let methods = class::static_methods(&om.mem, ext);
        assert_eq!(header::get_array_element_count(&om.mem, methods), SupportCall::ALL.len() as u32);
        for call in SupportCall::ALL {
            let mp = om.mem.get_word(methods, call.slot());
            assert!(mp != 0, "{} missing", call.name());
            let first = om.mem.fetch_u8(mp + frames::method_header_size(&om.mem, mp));
            let op = Op::try_from(first).map(|op| op == Op::Extend || op.short_form_base() == Some(Op::Extend0));
            assert_eq!(op, Ok(true), "{} does not start with extend", call.name());
        }
    }

    #[test]
    fn methods_encode_handlers_relative_to_mp() {
        let mut b = BytecodeBuilder::new();
        b.extend(1);
        b.op(Op::Return);
        let method = MethodDef::new(1, 9, b)
            .with_oop_map(0b1_0000_0001)
            .with_handler(1, 2, 2, cno::THROWABLE);
        let bytes = method.encode(0x105);
        let header = bytes[0] as u32;
        assert_eq!(header, frames::method_handlers_offset(9) + MTH_HANDLER_SIZE);
        assert_eq!(&bytes[1..5], &[1, 5, 1, 9]);
        assert_eq!(&bytes[5..7], &[0b1, 0b1]);
        let first = frames::method_handlers_offset(9) as usize;
        let start = u16::from_be_bytes([bytes[first], bytes[first + 1]]) as u32;
        assert_eq!(start, header + 1);
        let class_number = u16::from_be_bytes([bytes[first + 6], bytes[first + 7]]) as u32;
        assert_eq!(class_number, cno::THROWABLE);
    }

    #[test]
    fn user_classes_inherit_oop_maps_and_literals() {
        let mut builder = RomBuilder::new();
        let suite = builder.add_suite();
        let a = builder.add_class(suite, "A", cno::OBJECT, 1, 0b1);
        let b = builder.add_class(suite, "B", a, 3, 0b100);
        let hello = builder.string_ref(b, "hello");
        let array = builder.class_ref(b, cno::INT_ARRAY);
        assert_eq!(builder.class_ref(b, cno::INT_ARRAY), array);
        let om = create_test_memory(builder);

        let klass = om.class_from_cno(b);
        assert_eq!(class::super_class(&om.mem, klass), om.class_from_cno(a));
        assert!(class::is_pointer_field(&om.mem, klass, 0));
        assert!(!class::is_pointer_field(&om.mem, klass, 1));
        assert!(class::is_pointer_field(&om.mem, klass, 2));

        let string = om.mem.get_word(class::object_references(&om.mem, klass), hello as i32);
        assert_eq!(header::get_array_element_count(&om.mem, string), 5);
        assert_eq!(om.mem.get_unsigned_byte(string, 0), b'h');
        let refs = class::class_references(&om.mem, klass);
        assert_eq!(om.mem.get_unsigned_half(refs, array as i32) as u32, cno::INT_ARRAY);
    }

    #[test]
    fn mustclinit_classes_get_an_initializer() {
        let mut builder = RomBuilder::new();
        let suite = builder.add_suite();
        let lazy = builder.add_class(suite, "Lazy", cno::OBJECT, 0, 0);
        builder.set_access(lazy, ACC_MUSTCLINIT);
        let om = create_test_memory(builder);
        let klass = om.class_from_cno(lazy);
        let methods = class::static_methods(&om.mem, klass);
        assert!(om.mem.get_word(methods, CLINIT_SLOT as i32) != 0);
    }

    #[test]
    fn little_endian_images_store_words_reversed() {
        let om = RomBuilder::new()
            .with_endian(Endian::Little)
            .build_object_memory(0x1000, 0x4000, &VmSettings::default());
        let ext = om.root(Segment::Rom, root::VM_EXTENSION);
        assert_eq!(class::get_type(&om.mem, ext), cno::VM_EXTENSION);
        let at = (ext + CLS_TYPE as u32 * 4) as usize;
        assert_eq!(om.mem.as_bytes()[at], cno::VM_EXTENSION as u8);
    }
}
