//! Fixed-size mark stack in scratch memory.
//!
//! A push onto a full stack is dropped and the overflow flag is raised. The
//! caller must then rescan the marked region with the bit vector and remark
//! every set bit until no overflow happens, which rediscovers whatever the
//! dropped pushes would have reached.

use crate::memory::Memory;

/// Levels of direct recursion allowed before marking switches to the stack.
pub const RECURSE_LEVEL: u32 = 2;

#[derive(Debug, Default)]
pub struct MarkStack {
    in_use: bool,
    stack: u32,
    index: u32,
    size: u32,
    overflow: bool,
    level: u32,
    /// Deepest index reached since construction.
    high_water: u32,
}

impl MarkStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the stack to the words of `[start, end)`.
    pub fn setup(&mut self, start: u32, end: u32) {
        assert!(!self.in_use, "mark stack already in use");
        assert!(end >= start);
        self.in_use = true;
        self.stack = start;
        self.index = 0;
        self.size = (end - start) / 4;
        self.overflow = false;
        self.level = RECURSE_LEVEL;
    }

    pub fn push(&mut self, mem: &mut Memory, oop: u32) {
        assert!(self.in_use);
        if self.index == self.size {
            self.overflow = true;
        } else {
            mem.set_word(self.stack, self.index as i32, oop);
            self.index += 1;
            self.high_water = self.high_water.max(self.index);
        }
    }

    /// The most recently pushed oop, or 0 when empty.
    pub fn pop(&mut self, mem: &Memory) -> u32 {
        assert!(self.in_use);
        if self.index == 0 {
            0
        } else {
            self.index -= 1;
            mem.get_word(self.stack, self.index as i32)
        }
    }

    pub fn overflowed(&self) -> bool {
        assert!(self.in_use);
        self.overflow
    }

    pub fn reset_overflow(&mut self) {
        assert!(self.in_use);
        self.overflow = false;
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }

    pub fn len(&self) -> u32 {
        self.index
    }

    pub fn is_empty(&self) -> bool {
        self.index == 0
    }

    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    pub fn recurse_level(&self) -> u32 {
        assert!(self.in_use);
        self.level
    }

    pub fn recurse_level_inc(&mut self) {
        assert!(self.in_use);
        self.level += 1;
    }

    pub fn recurse_level_dec(&mut self) {
        assert!(self.in_use && self.level > 0);
        self.level -= 1;
    }

    pub fn finish(&mut self) {
        assert!(self.in_use, "mark stack finished twice");
        self.in_use = false;
    }
}
