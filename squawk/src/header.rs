//! Object header codec.
//!
//! Every object is preceded by a class word. Its low two bits are a tag and
//! its top eight bits hold the element count of short arrays:
//!
//! ```text
//!            31      24 23                         2 1 0
//! class word [ count  ][ class pointer               |tag]
//! length word          [ count                        |0 1]   (oop - 8, long arrays only)
//! ```
//!
//! Counts of 255 or more set the top byte to `0xFF` and move the count into
//! a second header word in front of the class word. A forwarded object has
//! tag `10` and the forwarding address in place of the class pointer. Free
//! blocks in persistent memory start with a word tagged `11`.
//!
//! This module is the only place that does bit operations on headers.

use crate::class;
use crate::memory::{Memory, roundup4};

pub const TAG_MASK: u32 = 3;
/// The class pointer and tag bits of a class word.
pub const CLASS_MASK: u32 = 0x00FF_FFFF;
pub const COUNT_SHIFT: u32 = 24;
/// Counts at or above this use a two word header.
pub const COMPACT_ARRAY_LIMIT: u32 = 255;
pub const MAX_ARRAY_COUNT: u32 = u32::MAX >> 2;

const FREE_BLOCK_LARGE: u32 = 0x4;
const FREE_BLOCK_OFFSET_SHIFT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderTag {
    ClassWord = 0,
    ArrayLength = 1,
    Forward = 2,
    FreeBlock = 3,
}

impl From<u32> for HeaderTag {
    fn from(word: u32) -> Self {
        match word & TAG_MASK {
            0 => HeaderTag::ClassWord,
            1 => HeaderTag::ArrayLength,
            2 => HeaderTag::Forward,
            _ => HeaderTag::FreeBlock,
        }
    }
}

// ── Class word ────────────────────────────────────────────────────────

#[inline(always)]
pub fn class_word(mem: &Memory, oop: u32) -> u32 {
    mem.get_word(oop, -1)
}

#[inline(always)]
fn set_class_word(mem: &mut Memory, oop: u32, word: u32) {
    mem.set_word(oop, -1, word);
}

/// The class of a live, non-forwarded object.
pub fn get_class(mem: &Memory, oop: u32) -> u32 {
    let word = class_word(mem, oop);
    assert_eq!(
        HeaderTag::from(word),
        HeaderTag::ClassWord,
        "class word 0x{word:08x} of 0x{oop:x} is not a class pointer"
    );
    let klass = word & CLASS_MASK;
    assert!(klass != 0, "object 0x{oop:x} has a null class");
    klass
}

/// Replace the class pointer, keeping the count bits.
pub fn set_class(mem: &mut Memory, oop: u32, klass: u32) {
    assert!(klass <= CLASS_MASK, "class 0x{klass:x} does not fit in 24 bits");
    let word = class_word(mem, oop);
    set_class_word(mem, oop, (word & !CLASS_MASK) | klass);
}

/// Header size in bytes for an array of `count` elements.
#[inline(always)]
pub const fn header_size_for_count(count: u32) -> u32 {
    if count < COMPACT_ARRAY_LIMIT { 4 } else { 8 }
}

pub fn set_class_and_array_count(mem: &mut Memory, oop: u32, klass: u32, count: u32) {
    assert!(klass & !CLASS_MASK == 0 && klass & TAG_MASK == 0);
    assert!(count <= MAX_ARRAY_COUNT, "array count {count} too large");
    if count < COMPACT_ARRAY_LIMIT {
        set_class_word(mem, oop, (count << COUNT_SHIFT) | klass);
    } else {
        mem.set_word(oop, -2, (count << 2) | HeaderTag::ArrayLength as u32);
        set_class_word(mem, oop, (COMPACT_ARRAY_LIMIT << COUNT_SHIFT) | klass);
    }
}

/// Element count of an array. Valid for forwarded objects too.
pub fn get_array_element_count(mem: &Memory, oop: u32) -> u32 {
    let count = class_word(mem, oop) >> COUNT_SHIFT;
    if count < COMPACT_ARRAY_LIMIT {
        count
    } else {
        let length = mem.get_word(oop, -2);
        assert_eq!(HeaderTag::from(length), HeaderTag::ArrayLength);
        length >> 2
    }
}

/// Header size in bytes, derived from the count bits alone so it stays
/// valid while the low bits are in use for forwarding.
pub fn get_header_size(mem: &Memory, oop: u32) -> u32 {
    if class_word(mem, oop) >> COUNT_SHIFT == COMPACT_ARRAY_LIMIT {
        8
    } else {
        4
    }
}

pub fn is_array(mem: &Memory, oop: u32) -> bool {
    class::is_array_class(mem, get_class(mem, oop))
}

/// Body length in bytes of an object whose class is `klass`.
pub fn object_length_for_class(mem: &Memory, oop: u32, klass: u32) -> u32 {
    if class::is_array_class(mem, klass) {
        let count = get_array_element_count(mem, oop);
        roundup4(count * class::array_element_length(mem, klass))
    } else {
        class::instance_fields_length(mem, klass) * 4
    }
}

/// Body length in bytes, header excluded.
pub fn get_object_length(mem: &Memory, oop: u32) -> u32 {
    object_length_for_class(mem, oop, get_class(mem, oop))
}

// ── Blocks ────────────────────────────────────────────────────────────

/// Header size of the object whose allocation unit starts at `block`.
pub fn block_header_size(mem: &Memory, block: u32) -> u32 {
    if HeaderTag::from(mem.read_word(block)) == HeaderTag::ArrayLength {
        8
    } else {
        4
    }
}

pub fn block_to_oop(mem: &Memory, block: u32) -> u32 {
    block + block_header_size(mem, block)
}

pub fn oop_to_block(mem: &Memory, oop: u32) -> u32 {
    oop - get_header_size(mem, oop)
}

/// Address just past the body of `oop`.
pub fn next_block(mem: &Memory, oop: u32) -> u32 {
    oop + get_object_length(mem, oop)
}

fn object_at_or_after(mem: &Memory, mut block: u32, end: u32) -> u32 {
    while block < end {
        if is_free_block(mem, block) {
            block += free_block_size(mem, block);
            continue;
        }
        return block_to_oop(mem, block);
    }
    0
}

/// First object in `[start, end)`, skipping free blocks. 0 if none.
pub fn first_object(mem: &Memory, start: u32, end: u32) -> u32 {
    object_at_or_after(mem, start, end)
}

/// Object after `oop` and before `end`, skipping free blocks. 0 at the end.
pub fn next_object(mem: &Memory, oop: u32, end: u32) -> u32 {
    object_at_or_after(mem, next_block(mem, oop), end)
}

// ── Forwarding ────────────────────────────────────────────────────────

pub fn forward_to_object(mem: &mut Memory, oop: u32, to: u32) {
    assert!(to & TAG_MASK == 0 && to <= CLASS_MASK, "bad forwarding target 0x{to:x}");
    set_class(mem, oop, to | HeaderTag::Forward as u32);
}

pub fn is_forwarded(mem: &Memory, oop: u32) -> bool {
    HeaderTag::from(class_word(mem, oop)) == HeaderTag::Forward
}

pub fn get_forwarded_object(mem: &Memory, oop: u32) -> u32 {
    let word = class_word(mem, oop);
    assert_eq!(HeaderTag::from(word), HeaderTag::Forward, "0x{oop:x} is not forwarded");
    word & CLASS_MASK & !TAG_MASK
}

pub fn get_possibly_forwarded(mem: &Memory, oop: u32) -> u32 {
    if oop != 0 && is_forwarded(mem, oop) {
        get_forwarded_object(mem, oop)
    } else {
        oop
    }
}

/// Overwrite the low 24 bits of the class word, keeping the count bits.
pub fn set_encoded_low_bits(mem: &mut Memory, oop: u32, bits: u32) {
    assert!(bits <= CLASS_MASK, "encoded bits 0x{bits:x} overflow 24 bits");
    let word = class_word(mem, oop);
    set_class_word(mem, oop, (word & !CLASS_MASK) | bits);
}

pub fn get_encoded_low_bits(mem: &Memory, oop: u32) -> u32 {
    class_word(mem, oop) & CLASS_MASK
}

// ── Free blocks ───────────────────────────────────────────────────────

pub fn is_free_block(mem: &Memory, block: u32) -> bool {
    HeaderTag::from(mem.read_word(block)) == HeaderTag::FreeBlock
}

/// Write a free block header. `next_offset` is the distance in bytes from
/// this block to the next free block, 0 if this block ends the list.
pub fn free_block_init(mem: &mut Memory, block: u32, size: u32, next_offset: u32) {
    assert!(size >= 4 && size % 4 == 0, "bad free block size {size}");
    let mut word = (next_offset << FREE_BLOCK_OFFSET_SHIFT) | HeaderTag::FreeBlock as u32;
    if size > 4 {
        word |= FREE_BLOCK_LARGE;
        mem.write_word(block + 4, size);
    }
    mem.write_word(block, word);
}

pub fn free_block_size(mem: &Memory, block: u32) -> u32 {
    let word = mem.read_word(block);
    assert_eq!(HeaderTag::from(word), HeaderTag::FreeBlock);
    if word & FREE_BLOCK_LARGE != 0 {
        mem.read_word(block + 4)
    } else {
        4
    }
}

pub fn free_block_next_offset(mem: &Memory, block: u32) -> u32 {
    mem.read_word(block) >> FREE_BLOCK_OFFSET_SHIFT
}

pub fn free_block_set_next_offset(mem: &mut Memory, block: u32, next_offset: u32) {
    let word = mem.read_word(block) & ((1 << FREE_BLOCK_OFFSET_SHIFT) - 1);
    mem.write_word(block, (next_offset << FREE_BLOCK_OFFSET_SHIFT) | word);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Endian;
    use crate::romizer::RomBuilder;

    /// Memory with a byte array class at `0x100`, an int array class at
    /// `0x200` and a three-field instance class at `0x300`.
    fn create_test_memory() -> Memory {
        let mut mem = Memory::new(0x4000, Endian::Big);
        RomBuilder::write_test_class(&mut mem, 0x100, class::cno::BYTE_ARRAY, class::cno::BYTE, 0);
        RomBuilder::write_test_class(&mut mem, 0x200, class::cno::INT_ARRAY, class::cno::INT, 0);
        RomBuilder::write_test_class(&mut mem, 0x300, class::cno::OBJECT, 0, 3);
        mem
    }

    #[test]
    fn array_count_round_trips_around_the_compact_limit() {
        let mut mem = create_test_memory();
        let oop = 0x1008;
        for count in [0, 1, 253, 254, 255, 256, 1000, 70_000] {
            set_class_and_array_count(&mut mem, oop, 0x100, count);
            assert_eq!(get_class(&mem, oop), 0x100, "count {count}");
            assert_eq!(get_array_element_count(&mem, oop), count);
            assert_eq!(get_header_size(&mem, oop), header_size_for_count(count));
            assert_eq!(get_object_length(&mem, oop), roundup4(count));
            let block = oop_to_block(&mem, oop);
            assert_eq!(block_to_oop(&mem, block), oop);
        }
    }

    #[test]
    fn set_class_keeps_count_bits() {
        let mut mem = create_test_memory();
        set_class_and_array_count(&mut mem, 0x1008, 0x100, 17);
        set_class(&mut mem, 0x1008, 0x200);
        assert_eq!(get_class(&mem, 0x1008), 0x200);
        assert_eq!(get_array_element_count(&mem, 0x1008), 17);
        assert_eq!(get_object_length(&mem, 0x1008), 17 * 4);
    }

    #[test]
    fn instance_length_comes_from_class() {
        let mut mem = create_test_memory();
        set_class(&mut mem, 0x1004, 0x300);
        assert!(!is_array(&mem, 0x1004));
        assert_eq!(get_object_length(&mem, 0x1004), 12);
        assert_eq!(next_block(&mem, 0x1004), 0x1010);
    }

    #[test]
    fn forwarding_hides_class_until_undone() {
        let mut mem = create_test_memory();
        set_class_and_array_count(&mut mem, 0x1008, 0x100, 300);
        forward_to_object(&mut mem, 0x1008, 0x2004);
        assert!(is_forwarded(&mem, 0x1008));
        assert_eq!(get_forwarded_object(&mem, 0x1008), 0x2004);
        assert_eq!(get_possibly_forwarded(&mem, 0x1008), 0x2004);
        assert_eq!(get_array_element_count(&mem, 0x1008), 300);
        assert_eq!(get_header_size(&mem, 0x1008), 8);

        set_class(&mut mem, 0x1008, 0x100);
        assert!(!is_forwarded(&mem, 0x1008));
        assert_eq!(get_possibly_forwarded(&mem, 0x1008), 0x1008);
        assert_eq!(get_possibly_forwarded(&mem, 0), 0);
    }

    #[test]
    #[should_panic]
    fn get_class_of_forwarded_object_is_fatal() {
        let mut mem = create_test_memory();
        set_class(&mut mem, 0x1004, 0x300);
        forward_to_object(&mut mem, 0x1004, 0x2004);
        get_class(&mem, 0x1004);
    }

    #[test]
    fn encoded_low_bits_keep_count() {
        let mut mem = create_test_memory();
        set_class_and_array_count(&mut mem, 0x1008, 0x100, 9);
        set_encoded_low_bits(&mut mem, 0x1008, 0x00AB_CDEF);
        assert_eq!(get_encoded_low_bits(&mem, 0x1008), 0x00AB_CDEF);
        assert_eq!(get_array_element_count(&mem, 0x1008), 9);
    }

    #[test]
    fn free_blocks_are_skipped_by_heap_walk() {
        let mut mem = create_test_memory();
        // [free 4][free 12][instance 3 words][end]
        free_block_init(&mut mem, 0x1000, 4, 0);
        free_block_init(&mut mem, 0x1004, 12, 0x40);
        assert_eq!(free_block_size(&mem, 0x1000), 4);
        assert_eq!(free_block_size(&mem, 0x1004), 12);
        assert_eq!(free_block_next_offset(&mem, 0x1004), 0x40);
        free_block_set_next_offset(&mut mem, 0x1004, 0x80);
        assert_eq!(free_block_next_offset(&mem, 0x1004), 0x80);
        assert_eq!(free_block_size(&mem, 0x1004), 12);

        set_class(&mut mem, 0x1014, 0x300);
        let first = first_object(&mem, 0x1000, 0x1020);
        assert_eq!(first, 0x1014);
        assert_eq!(next_object(&mem, first, 0x1020), 0);
    }
}
