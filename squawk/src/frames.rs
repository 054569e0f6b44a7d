//! Stack chunks, activation frames and method headers.
//!
//! A stack chunk is a `LOCAL_ARRAY` whose first words link it to its
//! neighbours. Frames are laid out upwards from `chunk + 40`:
//!
//! ```text
//!   lp - 20  mp            method being executed
//!   lp - 16  ip            saved instruction pointer
//!   lp - 12  previous lp   0 for the first frame of a chunk
//!   lp -  8  cp            current class
//!   lp -  4  stack offset  bytes from lp to the word below the operand stack
//!   lp       local 0 ...
//! ```
//!
//! A chunk whose `last_lp` is 0 is dead: no context is executing on it.

use crate::layout::*;
use crate::memory::{Memory, w2b};

// ── Chunks ────────────────────────────────────────────────────────────

#[inline(always)]
pub fn chunk_next(mem: &Memory, chunk: u32) -> u32 {
    mem.get_word(chunk, STACK_NEXT)
}

#[inline(always)]
pub fn set_chunk_next(mem: &mut Memory, chunk: u32, next: u32) {
    mem.set_word(chunk, STACK_NEXT, next);
}

#[inline(always)]
pub fn chunk_prev(mem: &Memory, chunk: u32) -> u32 {
    mem.get_word(chunk, STACK_PREV)
}

#[inline(always)]
pub fn set_chunk_prev(mem: &mut Memory, chunk: u32, prev: u32) {
    mem.set_word(chunk, STACK_PREV, prev);
}

/// Capacity in words, header included.
#[inline(always)]
pub fn chunk_size(mem: &Memory, chunk: u32) -> u32 {
    mem.get_word(chunk, STACK_SIZE)
}

#[inline(always)]
pub fn chunk_last_lp(mem: &Memory, chunk: u32) -> u32 {
    mem.get_word(chunk, STACK_LAST_LP)
}

#[inline(always)]
pub fn set_chunk_last_lp(mem: &mut Memory, chunk: u32, lp: u32) {
    mem.set_word(chunk, STACK_LAST_LP, lp);
}

/// Copying collector back pointer to the chunk's address before the copy.
pub fn chunk_self(mem: &Memory, chunk: u32) -> u32 {
    mem.get_word(chunk, STACK_SELF)
}

pub fn set_chunk_self(mem: &mut Memory, chunk: u32, value: u32) {
    mem.set_word(chunk, STACK_SELF, value);
}

/// Mark-compact list of every allocated chunk.
pub fn chunk_list(mem: &Memory, chunk: u32) -> u32 {
    mem.get_word(chunk, STACK_LIST)
}

pub fn set_chunk_list(mem: &mut Memory, chunk: u32, value: u32) {
    mem.set_word(chunk, STACK_LIST, value);
}

#[inline(always)]
pub const fn first_lp(chunk: u32) -> u32 {
    chunk + w2b(STACK_HEADER_SIZE + FRAME_HEADER_SIZE) as u32
}

/// Address just past the last word of the chunk.
#[inline(always)]
pub fn chunk_limit(mem: &Memory, chunk: u32) -> u32 {
    chunk + chunk_size(mem, chunk) * 4
}

/// Walk previous frame links back to the first frame of the chunk.
pub fn chunk_from_frame(mem: &Memory, mut lp: u32) -> u32 {
    loop {
        let prev = frame_previous_lp(mem, lp);
        if prev == 0 {
            return lp - w2b(STACK_HEADER_SIZE + FRAME_HEADER_SIZE) as u32;
        }
        lp = prev;
    }
}

/// Words of chunk needed to run a method with the given frame shape, as
/// a fresh chunk holding only that activation.
pub const fn min_chunk_words(nlocals: u32, nstack: u32) -> u32 {
    STACK_HEADER_SIZE as u32 + 2 * FRAME_HEADER_SIZE as u32 + nlocals + nstack
}

// ── Frames ────────────────────────────────────────────────────────────

#[inline(always)]
pub fn frame_mp(mem: &Memory, lp: u32) -> u32 {
    mem.get_word(lp, FRAME_CURRENT_MP)
}

#[inline(always)]
pub fn set_frame_mp(mem: &mut Memory, lp: u32, mp: u32) {
    mem.set_word(lp, FRAME_CURRENT_MP, mp);
}

#[inline(always)]
pub fn frame_ip(mem: &Memory, lp: u32) -> u32 {
    mem.get_word(lp, FRAME_CURRENT_IP)
}

#[inline(always)]
pub fn set_frame_ip(mem: &mut Memory, lp: u32, ip: u32) {
    mem.set_word(lp, FRAME_CURRENT_IP, ip);
}

#[inline(always)]
pub fn frame_previous_lp(mem: &Memory, lp: u32) -> u32 {
    mem.get_word(lp, FRAME_PREVIOUS_LP)
}

#[inline(always)]
pub fn set_frame_previous_lp(mem: &mut Memory, lp: u32, prev: u32) {
    mem.set_word(lp, FRAME_PREVIOUS_LP, prev);
}

#[inline(always)]
pub fn frame_cp(mem: &Memory, lp: u32) -> u32 {
    mem.get_word(lp, FRAME_CURRENT_CP)
}

#[inline(always)]
pub fn set_frame_cp(mem: &mut Memory, lp: u32, cp: u32) {
    mem.set_word(lp, FRAME_CURRENT_CP, cp);
}

#[inline(always)]
pub fn frame_stack_offset(mem: &Memory, lp: u32) -> u32 {
    mem.get_word(lp, FRAME_STACK_OFFSET)
}

#[inline(always)]
pub fn set_frame_stack_offset(mem: &mut Memory, lp: u32, offset: u32) {
    mem.set_word(lp, FRAME_STACK_OFFSET, offset);
}

#[inline(always)]
pub fn frame_local(mem: &Memory, lp: u32, index: i32) -> u32 {
    mem.get_word(lp, index)
}

#[inline(always)]
pub fn set_frame_local(mem: &mut Memory, lp: u32, index: i32, value: u32) {
    mem.set_word(lp, index, value);
}

/// The frame above `lp` in the same chunk. The stack offset of an
/// extended frame already covers the callee's frame header.
#[inline(always)]
pub fn next_frame_lp(mem: &Memory, lp: u32) -> u32 {
    lp + frame_stack_offset(mem, lp) + w2b(1) as u32
}

/// Stack offset of a frame after EXTEND: locals followed by room for the
/// next frame header.
#[inline(always)]
pub const fn extended_stack_offset(nlocals: u32) -> u32 {
    (nlocals + FRAME_HEADER_SIZE as u32 - 1) * 4
}

/// Number of active frames in the context whose innermost frame is `lp`.
pub fn frame_depth(mem: &Memory, mut lp: u32) -> u32 {
    let mut depth = 0;
    while lp != 0 {
        depth += 1;
        let prev = frame_previous_lp(mem, lp);
        if prev != 0 {
            lp = prev;
            continue;
        }
        let chunk = chunk_from_frame(mem, lp);
        let below = chunk_prev(mem, chunk);
        lp = if below == 0 { 0 } else { chunk_last_lp(mem, below) };
    }
    depth
}

// ── Methods ───────────────────────────────────────────────────────────

/// Byte offset from `mp` to the first bytecode.
#[inline(always)]
pub fn method_header_size(mem: &Memory, mp: u32) -> u32 {
    mem.get_unsigned_byte(mp, MTH_HEADER_SIZE) as u32
}

#[inline(always)]
pub fn method_nparms(mem: &Memory, mp: u32) -> u32 {
    mem.get_unsigned_byte(mp, MTH_NUMBER_OF_PARMS) as u32
}

#[inline(always)]
pub fn method_nlocals(mem: &Memory, mp: u32) -> u32 {
    mem.get_unsigned_byte(mp, MTH_NUMBER_OF_LOCALS) as u32
}

#[inline(always)]
pub const fn method_oop_map(mp: u32) -> u32 {
    mp + MTH_OOP_MAP as u32
}

/// Offset of the first exception handler entry from `mp`.
pub const fn method_handlers_offset(nlocals: u32) -> u32 {
    MTH_OOP_MAP as u32 + nlocals.div_ceil(8)
}

/// One row of a method's exception table. Offsets are bytes from `mp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub class_number: u32,
}

impl Handler {
    pub fn covers(&self, relative_ip: u32) -> bool {
        self.start <= relative_ip && relative_ip < self.end
    }
}

/// The exception table of the method at `mp`.
pub fn method_handlers(mem: &Memory, mp: u32) -> impl Iterator<Item = Handler> + '_ {
    let first = method_handlers_offset(method_nlocals(mem, mp));
    let count = method_header_size(mem, mp).saturating_sub(first) / MTH_HANDLER_SIZE;
    (0..count).map(move |i| {
        let at = mp + first + i * MTH_HANDLER_SIZE;
        Handler {
            start: mem.fetch_u16(at) as u32,
            end: mem.fetch_u16(at + 2) as u32,
            handler: mem.fetch_u16(at + 4) as u32,
            class_number: mem.fetch_u16(at + 6) as u32,
        }
    })
}

/// Whether the frame at `lp` has not yet run its first instruction, which
/// means only its parameters are initialised.
#[inline(always)]
pub fn frame_is_before_entry(mem: &Memory, lp: u32) -> bool {
    let mp = frame_mp(mem, lp);
    frame_ip(mem, lp) - mp == method_header_size(mem, mp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Endian;

    const CHUNK: u32 = 0x1000;

    fn create_test_method(mem: &mut Memory, mp: u32, nparms: u8, nlocals: u8, handlers: &[[u16; 4]]) {
        let first = method_handlers_offset(nlocals as u32);
        let header = first + handlers.len() as u32 * MTH_HANDLER_SIZE;
        mem.set_byte(mp, MTH_HEADER_SIZE, header as u8);
        mem.set_byte(mp, MTH_NUMBER_OF_PARMS, nparms);
        mem.set_byte(mp, MTH_NUMBER_OF_LOCALS, nlocals);
        for (i, row) in handlers.iter().enumerate() {
            let at = mp + first + i as u32 * MTH_HANDLER_SIZE;
            for (j, v) in row.iter().enumerate() {
                mem.slice_mut(at + 2 * j as u32, 2).copy_from_slice(&v.to_be_bytes());
            }
        }
    }

    fn create_test_chunk() -> Memory {
        let mut mem = Memory::new(0x4000, Endian::Little);
        mem.set_word(CHUNK, STACK_SIZE, 32);
        mem
    }

    #[test]
    fn first_lp_leaves_room_for_headers() {
        assert_eq!(first_lp(CHUNK), CHUNK + 40);
        assert_eq!(min_chunk_words(3, 4), 5 + 10 + 7);
    }

    #[test]
    fn chunk_from_frame_walks_previous_links() {
        let mut mem = create_test_chunk();
        let lp0 = first_lp(CHUNK);
        set_frame_stack_offset(&mut mem, lp0, extended_stack_offset(2));
        let lp1 = next_frame_lp(&mem, lp0);
        assert_eq!(lp1, lp0 + 8 + 20);
        set_frame_previous_lp(&mut mem, lp1, lp0);
        let lp2 = lp1 + 40;
        set_frame_previous_lp(&mut mem, lp2, lp1);
        assert_eq!(chunk_from_frame(&mem, lp2), CHUNK);
        assert_eq!(chunk_from_frame(&mem, lp0), CHUNK);
        assert_eq!(chunk_limit(&mem, CHUNK), CHUNK + 128);
    }

    #[test]
    fn frame_depth_crosses_chunks() {
        let mut mem = create_test_chunk();
        let lower = CHUNK;
        let upper = 0x2000;
        let lp0 = first_lp(lower);
        let lp1 = lp0 + 40;
        set_frame_previous_lp(&mut mem, lp1, lp0);
        set_chunk_last_lp(&mut mem, lower, lp1);
        set_chunk_prev(&mut mem, upper, lower);
        let top = first_lp(upper);
        assert_eq!(frame_depth(&mem, top), 3);
    }

    #[test]
    fn handler_table_is_read_big_endian() {
        let mut mem = create_test_chunk();
        let mp = 0x3000;
        create_test_method(&mut mem, mp, 1, 9, &[[0, 10, 12, 33], [2, 4, 6, 34]]);
        assert_eq!(method_handlers_offset(9), 7);
        assert_eq!(method_header_size(&mem, mp), 7 + 16);
        let rows: Vec<_> = method_handlers(&mem, mp).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], Handler { start: 0, end: 10, handler: 12, class_number: 33 });
        assert!(rows[1].covers(3));
        assert!(!rows[1].covers(4));
    }

    #[test]
    fn entry_state_compares_ip_with_header() {
        let mut mem = create_test_chunk();
        let mp = 0x3000;
        create_test_method(&mut mem, mp, 2, 3, &[]);
        let lp = first_lp(CHUNK);
        set_frame_mp(&mut mem, lp, mp);
        let hs = method_header_size(&mem, mp);
        set_frame_ip(&mut mem, lp, mp + hs);
        assert!(frame_is_before_entry(&mem, lp));
        set_frame_ip(&mut mem, lp, mp + hs + 1);
        assert!(!frame_is_before_entry(&mem, lp));
    }
}
