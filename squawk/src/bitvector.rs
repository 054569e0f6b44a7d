//! One bit per word over an address range.
//!
//! The bitmap itself lives in VM memory (after the mark stack reserve for the
//! mark-compact collector, or in a guest int array for the persistent
//! collector). A [`BitVector`] only holds the three scalars needed to map an
//! address to its bit, so one instance can serve two logical vectors by
//! swapping them with [`BitVector::save_context`] and
//! [`BitVector::restore_context`].

use crate::memory::Memory;

const BITS_PER_WORD: u32 = 32;
/// Bytes of memory covered by one bitmap word.
const CHUNK_SIZE: u32 = BITS_PER_WORD * 4;

/// The scalars that bind a bit vector to its bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitVectorContext {
    pub base: u32,
    pub first_oop: u32,
    pub last_oop: u32,
}

#[derive(Debug, Default)]
pub struct BitVector {
    ctx: BitVectorContext,
    iterator_in_use: bool,
    iteration: u32,
    iteration_end: u32,
    next_iteration_oop: u32,
}

impl BitVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the vector to `[first_oop, last_oop]` with its bitmap at
    /// `bitmap`. `first_oop` is rounded down to a 32-word chunk so `base`
    /// can be computed for any address in range.
    pub fn init(&mut self, first_oop: u32, last_oop: u32, bitmap: u32, bitmap_size: u32) {
        assert!(bitmap % 4 == 0 && bitmap != 0, "bad bitmap address 0x{bitmap:x}");
        assert!(last_oop > first_oop);
        let first = first_oop & !(CHUNK_SIZE - 1);
        let negative_offset = first / 4 / 8;
        self.ctx = BitVectorContext {
            base: bitmap - negative_offset,
            first_oop: first,
            last_oop,
        };
        let last_word = self.ctx.base + (last_oop / 4 / BITS_PER_WORD) * 4;
        assert!(
            last_word + 4 <= bitmap + bitmap_size,
            "bitmap of {bitmap_size} bytes at 0x{bitmap:x} cannot cover 0x{last_oop:x}"
        );
        log::trace!(
            target: "squawk::gc",
            "bit vector over [0x{:x}, 0x{:x}] base 0x{:x} bitmap 0x{bitmap:x}+{bitmap_size}",
            self.ctx.first_oop, self.ctx.last_oop, self.ctx.base
        );
    }

    /// Bytes of bitmap needed to cover `[first_oop, last_oop]`.
    pub fn bitmap_size_for(first_oop: u32, last_oop: u32) -> u32 {
        let first = first_oop & !(CHUNK_SIZE - 1);
        ((last_oop - first) / CHUNK_SIZE + 1) * 4
    }

    pub fn first_oop(&self) -> u32 {
        self.ctx.first_oop
    }

    pub fn last_oop(&self) -> u32 {
        self.ctx.last_oop
    }

    pub fn save_context(&self) -> BitVectorContext {
        self.ctx
    }

    pub fn restore_context(&mut self, ctx: BitVectorContext) {
        self.ctx = ctx;
    }

    #[inline(always)]
    fn locate(&self, addr: u32) -> (u32, u32) {
        assert!(self.ctx.first_oop != 0, "bit vector is not initialised");
        assert!(addr % 4 == 0, "unaligned bit address 0x{addr:x}");
        assert!(
            addr >= self.ctx.first_oop && addr <= self.ctx.last_oop,
            "bit address 0x{addr:x} outside [0x{:x}, 0x{:x}]",
            self.ctx.first_oop,
            self.ctx.last_oop
        );
        let word_offset = addr / 4;
        (
            self.ctx.base + (word_offset / BITS_PER_WORD) * 4,
            word_offset % BITS_PER_WORD,
        )
    }

    pub fn set_oop_bit(&self, mem: &mut Memory, addr: u32) {
        let (word, bit) = self.locate(addr);
        let value = mem.read_word(word);
        mem.write_word(word, value | (1 << bit));
    }

    pub fn clear_oop_bit(&self, mem: &mut Memory, addr: u32) {
        let (word, bit) = self.locate(addr);
        let value = mem.read_word(word);
        mem.write_word(word, value & !(1 << bit));
    }

    pub fn test_oop_bit(&self, mem: &Memory, addr: u32) -> bool {
        let (word, bit) = self.locate(addr);
        mem.read_word(word) & (1 << bit) != 0
    }

    /// Returns the previous value of the bit and sets it.
    pub fn test_and_set_oop_bit(&self, mem: &mut Memory, addr: u32) -> bool {
        let (word, bit) = self.locate(addr);
        let value = mem.read_word(word);
        mem.write_word(word, value | (1 << bit));
        value & (1 << bit) != 0
    }

    /// Clear the bits of `(from, to]`.
    pub fn clear_oop_bit_range(&self, mem: &mut Memory, from: u32, to: u32) {
        assert!(from <= to && to <= self.ctx.last_oop);
        let mut addr = from + 4;
        while addr <= to {
            let (word, bit) = self.locate(addr);
            if bit == 0 && addr + CHUNK_SIZE - 4 <= to {
                mem.write_word(word, 0);
                addr += CHUNK_SIZE;
                continue;
            }
            let value = mem.read_word(word);
            mem.write_word(word, value & !(1 << bit));
            addr += 4;
        }
    }

    pub fn clear_all_oop_bits(&self, mem: &mut Memory) {
        let first = self.ctx.base + (self.ctx.first_oop / 4 / BITS_PER_WORD) * 4;
        let last = self.ctx.base + (self.ctx.last_oop / 4 / BITS_PER_WORD) * 4;
        mem.zero_bytes(first, last - first + 4);
    }

    // ── Iteration ─────────────────────────────────────────────────────

    /// Begin an ascending scan over the set bits of `(from, to]`. Only one
    /// scan may be active at a time.
    pub fn start_iteration(&mut self, mem: &Memory, from: u32, to: u32) {
        assert!(from <= to, "iteration from 0x{from:x} past 0x{to:x}");
        assert!(!self.iterator_in_use, "bit vector iteration is not reentrant");
        self.iterator_in_use = true;
        self.iteration = from + 4;
        self.iteration_end = to + 4;
        self.iterate(mem);
    }

    /// Current address of the scan, 0 when it is exhausted.
    #[inline(always)]
    pub fn get_next_iteration(&self) -> u32 {
        self.next_iteration_oop
    }

    /// Advance past the current address.
    pub fn iterate(&mut self, mem: &Memory) {
        loop {
            if self.iteration == self.iteration_end {
                self.next_iteration_oop = 0;
                return;
            }
            let addr = self.iteration;
            self.iteration += 4;
            if self.test_oop_bit(mem, addr) {
                self.next_iteration_oop = addr;
                return;
            }
        }
    }

    pub fn end_iteration(&mut self) {
        self.iterator_in_use = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Endian;

    const FIRST: u32 = 0x1040;
    const LAST: u32 = 0x1FFC;
    const BITMAP: u32 = 0x3000;

    fn create_test_vector() -> (Memory, BitVector) {
        let mut mem = Memory::new(0x4000, Endian::Little);
        let mut bv = BitVector::new();
        let size = BitVector::bitmap_size_for(FIRST, LAST);
        bv.init(FIRST, LAST, BITMAP, size);
        mem.fill_words(BITMAP, size, 0xFFFF_FFFF);
        bv.clear_all_oop_bits(&mut mem);
        (mem, bv)
    }

    fn collect(bv: &mut BitVector, mem: &Memory, from: u32, to: u32) -> Vec<u32> {
        let mut out = Vec::new();
        bv.start_iteration(mem, from, to);
        while bv.get_next_iteration() != 0 {
            out.push(bv.get_next_iteration());
            bv.iterate(mem);
        }
        bv.end_iteration();
        out
    }

    #[test]
    fn every_address_in_range_is_clear_then_settable() {
        let (mut mem, bv) = create_test_vector();
        let mut addr = bv.first_oop();
        while addr <= LAST {
            assert!(!bv.test_oop_bit(&mem, addr));
            assert!(!bv.test_and_set_oop_bit(&mut mem, addr));
            assert!(bv.test_and_set_oop_bit(&mut mem, addr));
            addr += 4;
        }
        bv.clear_all_oop_bits(&mut mem);
        assert!(!bv.test_oop_bit(&mem, LAST));
        assert!(!bv.test_oop_bit(&mem, FIRST));
    }

    #[test]
    fn first_oop_rounds_down_to_chunk() {
        let (_, bv) = create_test_vector();
        assert_eq!(bv.first_oop(), 0x1000);
        assert_eq!(bv.last_oop(), LAST);
    }

    #[test]
    fn iteration_yields_set_bits_in_order_once() {
        let (mut mem, mut bv) = create_test_vector();
        let set = [0x1044, 0x1080, 0x1084, 0x10FC, 0x1100, 0x1FFC];
        for a in set.iter().rev() {
            bv.set_oop_bit(&mut mem, *a);
        }
        assert_eq!(collect(&mut bv, &mem, 0x1040, LAST), set);
        // `from` itself is excluded, `to` included.
        assert_eq!(collect(&mut bv, &mem, 0x1044, 0x1100), &set[1..5]);
        assert!(collect(&mut bv, &mem, 0x1100, 0x1100).is_empty());
    }

    #[test]
    fn clear_range_is_exclusive_of_start() {
        let (mut mem, mut bv) = create_test_vector();
        let mut addr = 0x1040;
        while addr <= 0x1200 {
            bv.set_oop_bit(&mut mem, addr);
            addr += 4;
        }
        bv.clear_oop_bit_range(&mut mem, 0x1040, 0x11F0);
        assert_eq!(collect(&mut bv, &mem, 0x1000, 0x1200), vec![0x1040, 0x11F4, 0x11F8, 0x11FC, 0x1200]);
        bv.clear_oop_bit(&mut mem, 0x1040);
        assert!(!bv.test_oop_bit(&mem, 0x1040));
    }

    #[test]
    fn contexts_swap_between_bitmaps() {
        let (mut mem, mut bv) = create_test_vector();
        let ram = bv.save_context();
        bv.init(0x2000, 0x27FC, 0x3800, BitVector::bitmap_size_for(0x2000, 0x27FC));
        bv.clear_all_oop_bits(&mut mem);
        bv.set_oop_bit(&mut mem, 0x2010);
        let eeprom = bv.save_context();

        bv.restore_context(ram);
        bv.set_oop_bit(&mut mem, 0x1010);
        assert!(bv.test_oop_bit(&mem, 0x1010));
        bv.restore_context(eeprom);
        assert!(bv.test_oop_bit(&mem, 0x2010));
        assert!(!bv.test_oop_bit(&mem, 0x2014));
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn out_of_range_address_is_fatal() {
        let (mem, bv) = create_test_vector();
        bv.test_oop_bit(&mem, LAST + 4);
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn unaligned_address_is_fatal() {
        let (mem, bv) = create_test_vector();
        bv.test_oop_bit(&mem, FIRST + 2);
    }

    #[test]
    #[should_panic(expected = "not reentrant")]
    fn nested_iteration_is_fatal() {
        let (mem, mut bv) = create_test_vector();
        bv.start_iteration(&mem, FIRST, LAST);
        bv.start_iteration(&mem, FIRST, LAST);
    }
}
