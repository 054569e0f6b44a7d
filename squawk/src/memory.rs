//! Flat byte-addressed memory holding the ROM, EEPROM and RAM segments.
//!
//! Data accessors honour the byte order of the loaded image. Bytecode
//! fetchers (`fetch_*`) always read big-endian, which is how the translator
//! lays out inline operands.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Byte order of the object data in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Big,
    Little,
}

impl Endian {
    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Big => BigEndian::read_u32(buf),
            Endian::Little => LittleEndian::read_u32(buf),
        }
    }

    pub fn write_u32(self, buf: &mut [u8], v: u32) {
        match self {
            Endian::Big => BigEndian::write_u32(buf, v),
            Endian::Little => LittleEndian::write_u32(buf, v),
        }
    }

    fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Big => BigEndian::read_u16(buf),
            Endian::Little => LittleEndian::read_u16(buf),
        }
    }

    fn write_u16(self, buf: &mut [u8], v: u16) {
        match self {
            Endian::Big => BigEndian::write_u16(buf, v),
            Endian::Little => LittleEndian::write_u16(buf, v),
        }
    }

    fn read_i64(self, buf: &[u8]) -> i64 {
        match self {
            Endian::Big => BigEndian::read_i64(buf),
            Endian::Little => LittleEndian::read_i64(buf),
        }
    }

    fn write_i64(self, buf: &mut [u8], v: i64) {
        match self {
            Endian::Big => BigEndian::write_i64(buf, v),
            Endian::Little => LittleEndian::write_i64(buf, v),
        }
    }
}

#[inline(always)]
pub const fn roundup4(n: u32) -> u32 {
    (n + 3) & !3
}

#[inline(always)]
pub const fn w2b(words: i32) -> i32 {
    words * 4
}

/// The VM address space. Address 0 is null and is never the address of an
/// object, so the first segment must start past it.
#[derive(Debug, Clone)]
pub struct Memory {
    bytes: Vec<u8>,
    endian: Endian,
}

impl Memory {
    pub fn new(size: u32, endian: Endian) -> Self {
        Self {
            bytes: vec![0; size as usize],
            endian,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, endian: Endian) -> Self {
        Self { bytes, endian }
    }

    #[inline(always)]
    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    #[inline(always)]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn slice(&self, addr: u32, len: u32) -> &[u8] {
        &self.bytes[addr as usize..(addr + len) as usize]
    }

    pub fn slice_mut(&mut self, addr: u32, len: u32) -> &mut [u8] {
        &mut self.bytes[addr as usize..(addr + len) as usize]
    }

    // ── words ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn read_word(&self, addr: u32) -> u32 {
        debug_assert!(addr % 4 == 0, "unaligned word read at 0x{addr:x}");
        let a = addr as usize;
        self.endian.read_u32(&self.bytes[a..a + 4])
    }

    #[inline(always)]
    pub fn write_word(&mut self, addr: u32, value: u32) {
        debug_assert!(addr % 4 == 0, "unaligned word write at 0x{addr:x}");
        let a = addr as usize;
        self.endian.write_u32(&mut self.bytes[a..a + 4], value);
    }

    /// Word `index` of the object at `base`. Negative indices reach into
    /// headers and frame records.
    #[inline(always)]
    pub fn get_word(&self, base: u32, index: i32) -> u32 {
        self.read_word(base.wrapping_add(w2b(index) as u32))
    }

    #[inline(always)]
    pub fn set_word(&mut self, base: u32, index: i32, value: u32) {
        self.write_word(base.wrapping_add(w2b(index) as u32), value);
    }

    // ── halves and bytes ───────────────────────────────────────────

    pub fn get_half(&self, base: u32, index: i32) -> i16 {
        self.get_unsigned_half(base, index) as i16
    }

    pub fn get_unsigned_half(&self, base: u32, index: i32) -> u16 {
        let a = base.wrapping_add((index * 2) as u32) as usize;
        self.endian.read_u16(&self.bytes[a..a + 2])
    }

    pub fn set_half(&mut self, base: u32, index: i32, value: u16) {
        let a = base.wrapping_add((index * 2) as u32) as usize;
        self.endian.write_u16(&mut self.bytes[a..a + 2], value);
    }

    pub fn get_byte(&self, base: u32, index: i32) -> i8 {
        self.get_unsigned_byte(base, index) as i8
    }

    #[inline(always)]
    pub fn get_unsigned_byte(&self, base: u32, index: i32) -> u8 {
        self.bytes[base.wrapping_add(index as u32) as usize]
    }

    pub fn set_byte(&mut self, base: u32, index: i32, value: u8) {
        self.bytes[base.wrapping_add(index as u32) as usize] = value;
    }

    // ── longs ──────────────────────────────────────────────────────

    /// Element `index` of a long array.
    pub fn get_long(&self, base: u32, index: i32) -> i64 {
        let a = base.wrapping_add((index * 8) as u32) as usize;
        self.endian.read_i64(&self.bytes[a..a + 8])
    }

    pub fn set_long(&mut self, base: u32, index: i32, value: i64) {
        let a = base.wrapping_add((index * 8) as u32) as usize;
        self.endian.write_i64(&mut self.bytes[a..a + 8], value);
    }

    /// A long stored in the two words starting at word `index`.
    pub fn get_long_at_word(&self, base: u32, index: i32) -> i64 {
        let a = base.wrapping_add(w2b(index) as u32) as usize;
        self.endian.read_i64(&self.bytes[a..a + 8])
    }

    pub fn set_long_at_word(&mut self, base: u32, index: i32, value: i64) {
        let a = base.wrapping_add(w2b(index) as u32) as usize;
        self.endian.write_i64(&mut self.bytes[a..a + 8], value);
    }

    // ── bytecode fetches ───────────────────────────────────────────

    #[inline(always)]
    pub fn fetch_u8(&self, addr: u32) -> u8 {
        self.bytes[addr as usize]
    }

    #[inline(always)]
    pub fn fetch_i8(&self, addr: u32) -> i8 {
        self.bytes[addr as usize] as i8
    }

    pub fn fetch_i16(&self, addr: u32) -> i16 {
        let a = addr as usize;
        BigEndian::read_i16(&self.bytes[a..a + 2])
    }

    pub fn fetch_u16(&self, addr: u32) -> u16 {
        let a = addr as usize;
        BigEndian::read_u16(&self.bytes[a..a + 2])
    }

    pub fn fetch_i32(&self, addr: u32) -> i32 {
        let a = addr as usize;
        BigEndian::read_i32(&self.bytes[a..a + 4])
    }

    pub fn fetch_i64(&self, addr: u32) -> i64 {
        let a = addr as usize;
        BigEndian::read_i64(&self.bytes[a..a + 8])
    }

    // ── bulk ───────────────────────────────────────────────────────

    /// `memmove`: the ranges may overlap.
    pub fn copy_bytes(&mut self, src: u32, dst: u32, len: u32) {
        if len == 0 || src == dst {
            return;
        }
        let s = src as usize;
        self.bytes.copy_within(s..s + len as usize, dst as usize);
    }

    pub fn zero_bytes(&mut self, addr: u32, len: u32) {
        self.fill_words(addr, len, 0);
    }

    /// Fill `len` bytes at `addr` with a repeated word pattern. `len` must be
    /// a multiple of 4 unless `pattern` is 0.
    pub fn fill_words(&mut self, addr: u32, len: u32, pattern: u32) {
        let a = addr as usize;
        let region = &mut self.bytes[a..a + len as usize];
        if pattern == 0 {
            region.fill(0);
            return;
        }
        for chunk in region.chunks_exact_mut(4) {
            self.endian.write_u32(chunk, pattern);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_memory(endian: Endian) -> Memory {
        Memory::new(256, endian)
    }

    #[test]
    fn words_follow_image_byte_order() {
        let mut big = create_test_memory(Endian::Big);
        big.write_word(8, 0x0102_0304);
        assert_eq!(big.slice(8, 4), &[1, 2, 3, 4]);

        let mut little = create_test_memory(Endian::Little);
        little.write_word(8, 0x0102_0304);
        assert_eq!(little.slice(8, 4), &[4, 3, 2, 1]);
        assert_eq!(little.read_word(8), 0x0102_0304);
    }

    #[test]
    fn negative_word_indices_reach_backwards() {
        let mut mem = create_test_memory(Endian::Big);
        mem.set_word(64, -1, 7);
        assert_eq!(mem.read_word(60), 7);
        assert_eq!(mem.get_word(56, 1), 7);
    }

    #[test]
    fn fetches_are_always_big_endian() {
        let mut mem = create_test_memory(Endian::Little);
        mem.slice_mut(0, 8).copy_from_slice(&[0xFF, 0xFE, 0, 0, 1, 0, 0, 0]);
        assert_eq!(mem.fetch_i8(0), -1);
        assert_eq!(mem.fetch_i16(0), -2);
        assert_eq!(mem.fetch_u16(0), 0xFFFE);
        assert_eq!(mem.fetch_i32(2), 0x0000_0100);
    }

    #[test]
    fn halves_bytes_and_longs() {
        let mut mem = create_test_memory(Endian::Big);
        mem.set_half(16, 1, 0xFFFF);
        assert_eq!(mem.get_half(16, 1), -1);
        assert_eq!(mem.get_unsigned_half(16, 1), 0xFFFF);
        mem.set_byte(32, 3, 0x80);
        assert_eq!(mem.get_byte(32, 3), -128);
        mem.set_long_at_word(40, 1, -5);
        assert_eq!(mem.get_long_at_word(40, 1), -5);
        assert_eq!(mem.get_long(44, 0), -5);
    }

    #[test]
    fn copy_handles_overlap() {
        let mut mem = create_test_memory(Endian::Big);
        for i in 0..8 {
            mem.set_byte(0, i, i as u8 + 1);
        }
        mem.copy_bytes(0, 4, 8);
        assert_eq!(mem.slice(4, 8), &[1, 2, 3, 4, 5, 6, 7, 8]);
        mem.copy_bytes(4, 2, 8);
        assert_eq!(mem.slice(2, 8), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn fill_patterns() {
        let mut mem = create_test_memory(Endian::Big);
        mem.fill_words(0, 8, 0xdead_1dea);
        assert_eq!(mem.read_word(4), 0xdead_1dea);
        mem.zero_bytes(0, 8);
        assert_eq!(mem.read_word(0), 0);
        assert_eq!(roundup4(5), 8);
        assert_eq!(roundup4(8), 8);
    }
}
