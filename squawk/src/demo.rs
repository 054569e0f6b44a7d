//! Built-in guest programs.
//!
//! The demo image allocates `iterations` int arrays and keeps the last
//! `ring` of them alive in an object array, so every collection has both
//! garbage to drop and live data to move. When the loop ends it prints the
//! first element of the newest survivor, which is the last loop index.

use bytecode::{BytecodeBuilder, Op};

use crate::class::cno;
use crate::config::VmSettings;
use crate::heap::ObjectMemory;
use crate::romizer::{MethodDef, RomBuilder, native};

// main locals
const I: u8 = 0;
const RING: u8 = 1;
const ARRAY: u8 = 2;

/// Shape of the allocation loop.
#[derive(Debug, Clone, Copy)]
pub struct DemoProgram {
    pub iterations: u32,
    pub ring: u32,
    /// Ints per allocated array.
    pub array_length: u32,
    /// Catch `OutOfMemoryError` in `main` and exit with this code.
    pub out_of_memory_exit: Option<i32>,
}

impl Default for DemoProgram {
    fn default() -> Self {
        Self {
            iterations: 2000,
            ring: 8,
            array_length: 64,
            out_of_memory_exit: None,
        }
    }
}

impl DemoProgram {
    pub fn rom(&self) -> RomBuilder {
        let mut rom = RomBuilder::new();
        let suite = rom.add_suite();
        let demo = rom.add_class(suite, "Demo", cno::OBJECT, 0, 0);
        let object_array = rom.class_ref(demo, cno::OBJECT_ARRAY);
        let int_array = rom.class_ref(demo, cno::INT_ARRAY);
        let banner = rom.string_ref(demo, "last survivor: ");

        let mut b = BytecodeBuilder::new();
        b.extend(4);
        b.const_int(self.ring as i32);
        b.class(object_array);
        b.op(Op::Newarray);
        b.store(RING);
        b.const_int(0);
        b.store(I);

        let head = b.current_offset();
        b.load(I);
        b.const_int(self.iterations as i32);
        let done = b.branch(Op::IfIcmpge);
        let try_start = b.current_offset();
        b.const_int(self.array_length as i32);
        b.class(int_array);
        b.op(Op::Newarray);
        let try_end = b.current_offset();
        b.store(ARRAY);
        b.load(ARRAY);
        b.const_int(0);
        b.load(I);
        b.op(Op::Astore);
        b.load(RING);
        b.load(I);
        b.const_int(self.ring as i32);
        b.op(Op::Irem);
        b.load(ARRAY);
        b.op(Op::AstoreO);
        b.inc(I);
        b.branch_to(Op::Goto, head);

        b.bind(done);
        b.object(banner);
        native(&mut b, "print");
        b.load(RING);
        b.load(I);
        b.const_int(1);
        b.op(Op::Isub);
        b.const_int(self.ring as i32);
        b.op(Op::Irem);
        b.op(Op::Aload);
        b.const_int(0);
        b.op(Op::Aload);
        native(&mut b, "printInt");
        b.const_int('\n' as i32);
        native(&mut b, "putch");
        b.const_int(0);
        native(&mut b, "exit");
        b.op(Op::Return);

        let mut main = MethodDef::new(0, 3, b).with_oop_map(1 << RING | 1 << ARRAY);
        if let Some(code) = self.out_of_memory_exit {
            let handler = out_of_memory_handler(&mut main, code);
            main = main.with_handler(try_start, try_end, handler, cno::OUT_OF_MEMORY_ERROR);
        }
        let slot = rom.add_static_method(demo, main);
        rom.set_main(demo, slot);
        rom
    }

    pub fn build(&self, eeprom_size: u32, ram_size: u32, settings: &VmSettings) -> ObjectMemory {
        self.rom().build_object_memory(eeprom_size, ram_size, settings)
    }
}

/// Append `pop; const code; exit` to `main` and return its offset.
fn out_of_memory_handler(main: &mut MethodDef, code: i32) -> usize {
    let mut b = BytecodeBuilder::new();
    b.op(Op::Pop);
    b.const_int(code);
    native(&mut b, "exit");
    b.op(Op::Return);
    main.append_code(&b.into_bytes())
}
