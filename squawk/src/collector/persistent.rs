//! Persistent memory: allocation, mark-sweep collection and migration for
//! EEPROM.
//!
//! EEPROM objects never move. Free space is a singly linked list of free
//! blocks whose headers store the byte offset to the next block. The root
//! `FREE_LIST` holds the first block, `u32::MAX` when the list is empty and
//! 0 while a collection is rebuilding it.
//!
//! Objects get into EEPROM by being copied out of RAM. In copy mode the
//! RAM originals are left untouched. In migration mode they are forwarded
//! to their copies and the next RAM collection drops them.

use crate::associations;
use crate::bitvector::BitVector;
use crate::class::cno;
use crate::error::VmResult;
use crate::fatal;
use crate::header;
use crate::heap::ObjectMemory;
use crate::layout::*;
use crate::memory::roundup4;

use super::{FieldAction, Shape, shape_of, traverse_object};

/// Free list value for "no free memory".
pub const NO_FREE_MEMORY: u32 = u32::MAX;

#[derive(Debug, Default)]
pub struct PersistentCollector {
    total_bytes_copied: u32,
    copies: u32,
    migrations: u32,
    collections: u32,
    full_gc_requested: bool,
}

impl PersistentCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(om: &ObjectMemory) -> (u32, u32) {
        (
            om.gci(Segment::Eeprom, GCI_PARTITION_START),
            om.gci(Segment::Eeprom, GCI_PARTITION_END),
        )
    }

    fn free_list(om: &ObjectMemory) -> u32 {
        om.root(Segment::Eeprom, root::FREE_LIST)
    }

    fn set_free_list(om: &mut ObjectMemory, block: u32) {
        let eeprom = om.segment(Segment::Eeprom).start;
        om.mem.set_word(eeprom, MSR_ROOTS + root::FREE_LIST, block);
    }

    /// Make the whole EEPROM heap one free block.
    pub fn initialize(&mut self, om: &mut ObjectMemory) -> VmResult<()> {
        let eeprom = om.segment(Segment::Eeprom);
        let start = eeprom.heap_start();
        let end = eeprom.end();
        if end <= start {
            return Err(fatal!("EEPROM of {} bytes has no room for objects", eeprom.size));
        }
        om.set_gci(Segment::Eeprom, GCI_OBJECT_MEMORY_START, start);
        om.set_gci(Segment::Eeprom, GCI_OBJECT_MEMORY_SIZE, end - start);
        om.set_gci(Segment::Eeprom, GCI_PARTITION_START, start);
        om.set_gci(Segment::Eeprom, GCI_PARTITION_FREE, start);
        om.set_gci(Segment::Eeprom, GCI_PARTITION_END, end);
        Self::init_free_space(om, start, end);
        Ok(())
    }

    fn init_free_space(om: &mut ObjectMemory, start: u32, end: u32) {
        om.mem.zero_bytes(start, end - start);
        header::free_block_init(&mut om.mem, start, end - start, 0);
        Self::set_free_list(om, start);
        log::debug!(target: "squawk::eeprom", "free space [0x{start:x}, 0x{end:x})");
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocate `bytes` from the free list, first fit. Returns the block
    /// address, or 0 when no free block is large enough.
    pub fn new_persistent_chunk(&mut self, om: &mut ObjectMemory, bytes: u32, zero: bool) -> u32 {
        let size = roundup4(bytes);
        let mut block = Self::free_list(om);
        if block == 0 || block == NO_FREE_MEMORY {
            return 0;
        }
        let mut previous = 0;
        loop {
            let block_size = header::free_block_size(&om.mem, block);
            let offset = header::free_block_next_offset(&om.mem, block);
            let next = if offset == 0 { None } else { Some(block + offset) };

            if size <= block_size {
                let replacement = if size == block_size {
                    next
                } else {
                    let rest = block + size;
                    let rest_offset = next.map_or(0, |n| n - rest);
                    header::free_block_init(&mut om.mem, rest, block_size - size, rest_offset);
                    Some(rest)
                };
                if previous == 0 {
                    Self::set_free_list(om, replacement.unwrap_or(NO_FREE_MEMORY));
                } else {
                    let link = replacement.map_or(0, |r| r - previous);
                    header::free_block_set_next_offset(&mut om.mem, previous, link);
                }
                if zero {
                    om.mem.zero_bytes(block, size);
                }
                log::trace!(target: "squawk::eeprom", "{size} bytes at 0x{block:x}");
                return block;
            }

            match next {
                Some(n) => {
                    previous = block;
                    block = n;
                }
                None => return 0,
            }
        }
    }

    /// Zeroed byte array in EEPROM, 0 if there is no room.
    pub fn new_persistent_byte_array(&mut self, om: &mut ObjectMemory, count: u32) -> u32 {
        let klass = om.class_from_cno(cno::BYTE_ARRAY);
        let header_size = header::header_size_for_count(count);
        let body = roundup4(count).max(4);
        let block = self.new_persistent_chunk(om, header_size + body, true);
        if block == 0 {
            return 0;
        }
        let oop = block + header_size;
        header::set_class_and_array_count(&mut om.mem, oop, klass, count);
        oop
    }

    pub fn free_persistent_memory(&self, om: &ObjectMemory) -> u32 {
        let mut block = Self::free_list(om);
        if block == 0 || block == NO_FREE_MEMORY {
            return 0;
        }
        let mut total = 0;
        loop {
            total += header::free_block_size(&om.mem, block);
            let offset = header::free_block_next_offset(&om.mem, block);
            if offset == 0 {
                return total;
            }
            block += offset;
        }
    }

    pub fn total_persistent_memory(&self, om: &ObjectMemory) -> u32 {
        let (start, end) = Self::partition(om);
        end - start
    }

    /// A collection left the free list in its in-progress state.
    pub fn was_interrupted(&self, om: &ObjectMemory) -> bool {
        Self::free_list(om) == 0
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Mark-sweep EEPROM.
    ///
    /// `bit_vector` and `mark_stack` are guest int arrays used as the
    /// bitmap and the mark stack. Marking starts at the EEPROM and RAM roots
    /// and at every RAM object in `ram_range`, since RAM is not traced from
    /// its roots here.
    pub fn gc_persistent_memory(
        &mut self,
        om: &mut ObjectMemory,
        ram_range: (u32, u32),
        bit_vector: u32,
        mark_stack: u32,
    ) -> VmResult<()> {
        let (start, end) = Self::partition(om);
        let bitmap_size = header::get_array_element_count(&om.mem, bit_vector) * 4;
        let needed = BitVector::bitmap_size_for(start, end);
        if bitmap_size < needed {
            return Err(fatal!("bit vector of {bitmap_size} bytes cannot cover EEPROM ({needed} needed)"));
        }
        let stack_size = header::get_array_element_count(&om.mem, mark_stack) * 4;

        Self::set_free_list(om, 0);
        let saved = om.bits.save_context();
        om.bits.init(start, end, bit_vector, bitmap_size);
        om.bits.clear_all_oop_bits(&mut om.mem);

        let mut marker = PersistentMarker { start, end };
        marker.mark(om, ram_range, mark_stack, stack_size);
        let (live, free) = Self::sweep(om, start, end);

        om.bits.restore_context(saved);
        self.collections += 1;
        log::debug!(
            target: "squawk::eeprom",
            "collection {}: {live} bytes live, {free} bytes free",
            self.collections
        );
        Ok(())
    }

    /// Turn every gap between marked objects into a zeroed free block and
    /// link them in address order. Returns the live and free byte counts.
    fn sweep(om: &mut ObjectMemory, start: u32, end: u32) -> (u32, u32) {
        let mut gaps = Vec::new();
        let mut cursor = start;
        om.bits.start_iteration(&om.mem, start, end);
        loop {
            let oop = om.bits.get_next_iteration();
            if oop == 0 {
                break;
            }
            let block = header::oop_to_block(&om.mem, oop);
            if block > cursor {
                gaps.push((cursor, block - cursor));
            }
            cursor = header::next_block(&om.mem, oop);
            om.bits.iterate(&om.mem);
        }
        om.bits.end_iteration();
        if cursor < end {
            gaps.push((cursor, end - cursor));
        }

        let mut free = 0;
        for (i, &(block, size)) in gaps.iter().enumerate() {
            let offset = gaps.get(i + 1).map_or(0, |&(next, _)| next - block);
            om.mem.zero_bytes(block, size);
            header::free_block_init(&mut om.mem, block, size, offset);
            free += size;
        }
        Self::set_free_list(om, gaps.first().map_or(NO_FREE_MEMORY, |&(block, _)| block));
        (end - start - free, free)
    }

    // ── Copying ───────────────────────────────────────────────────────

    /// Bytes copied by the last [`make_persistent`](Self::make_persistent).
    pub fn total_bytes_copied(&self) -> u32 {
        self.total_bytes_copied
    }

    /// Whether a RAM collection should be full to drop migrated originals.
    /// Clears the request.
    pub fn take_full_gc_request(&mut self) -> bool {
        std::mem::take(&mut self.full_gc_requested)
    }

    pub fn request_full_gc(&mut self) {
        self.full_gc_requested = true;
    }

    fn needs_copy(om: &ObjectMemory, oop: u32) -> bool {
        oop != 0 && om.in_ram(oop) && !header::is_forwarded(&om.mem, oop)
    }

    /// Copy the RAM graph reachable from `root` into EEPROM and return the
    /// copy of `root`. Returns `root` itself when it is not in RAM and 0
    /// when EEPROM is too small, in which case nothing changes in RAM.
    ///
    /// With `migrate`, the originals stay forwarded to their copies, their
    /// associations point at the copies and lose the migratable flag.
    pub fn make_persistent(&mut self, om: &mut ObjectMemory, root: u32, migrate: bool) -> VmResult<u32> {
        assert!(root != 0);
        self.total_bytes_copied = 0;
        if !Self::needs_copy(om, root) {
            return Ok(header::get_possibly_forwarded(&om.mem, root));
        }

        let mut originals = Vec::new();
        let copy = match self.copy_graph(om, root, &mut originals) {
            Ok(copy) => copy,
            Err(err) => {
                Self::reset_forwarding(om, &originals);
                return Err(err);
            }
        };
        if copy == 0 {
            Self::reset_forwarding(om, &originals);
            log::debug!(
                target: "squawk::migration",
                "EEPROM too small for the graph at 0x{root:x}"
            );
            self.total_bytes_copied = 0;
            return Ok(0);
        }

        if migrate {
            self.finish_migration(om, &originals);
            self.migrations += 1;
        } else {
            Self::reset_forwarding(om, &originals);
            self.copies += 1;
        }
        log::debug!(
            target: "squawk::migration",
            "{} 0x{root:x} to 0x{copy:x}: {} objects, {} bytes",
            if migrate { "migrated" } else { "copied" },
            originals.len(),
            self.total_bytes_copied
        );
        Ok(copy)
    }

    /// Copy objects breadth first with an explicit work list. Every copy is
    /// forwarded from its original as soon as it exists, so shared and
    /// cyclic references resolve to one copy.
    fn copy_graph(&mut self, om: &mut ObjectMemory, root: u32, originals: &mut Vec<u32>) -> VmResult<u32> {
        let root_copy = self.copy_object(om, root, originals)?;
        if root_copy == 0 {
            return Ok(0);
        }
        let mut pending = vec![root_copy];
        while let Some(copy) = pending.pop() {
            let klass = header::get_class(&om.mem, copy);
            for offset in pointer_slots(om, copy, klass)? {
                let value = om.mem.get_word(copy, offset);
                if Self::needs_copy(om, value) {
                    let field_copy = self.copy_object(om, value, originals)?;
                    if field_copy == 0 {
                        return Ok(0);
                    }
                    om.mem.set_word(copy, offset, field_copy);
                    pending.push(field_copy);
                } else if value != 0 && om.in_ram(value) {
                    let forwarded = header::get_forwarded_object(&om.mem, value);
                    om.mem.set_word(copy, offset, forwarded);
                }
            }
        }
        Ok(root_copy)
    }

    fn copy_object(&mut self, om: &mut ObjectMemory, oop: u32, originals: &mut Vec<u32>) -> VmResult<u32> {
        let klass = header::get_class(&om.mem, oop);
        if matches!(shape_of(om, oop, klass), Shape::StackChunk | Shape::ClassState { .. }) {
            return Err(fatal!("0x{oop:x} of class {} cannot be made persistent", crate::class::get_type(&om.mem, klass)));
        }
        let block = header::oop_to_block(&om.mem, oop);
        let header_size = oop - block;
        let size = header_size + header::object_length_for_class(&om.mem, oop, klass);
        let chunk = self.new_persistent_chunk(om, size, false);
        if chunk == 0 {
            return Ok(0);
        }
        om.mem.copy_bytes(block, chunk, size);
        self.total_bytes_copied += size;
        let copy = chunk + header_size;
        header::forward_to_object(&mut om.mem, oop, copy);
        originals.push(oop);
        log::trace!(target: "squawk::migration", "0x{oop:x} -> 0x{copy:x} ({size} bytes)");
        Ok(copy)
    }

    fn reset_forwarding(om: &mut ObjectMemory, originals: &[u32]) {
        for &oop in originals {
            let copy = header::get_forwarded_object(&om.mem, oop);
            let klass = header::get_class(&om.mem, copy);
            header::set_class(&mut om.mem, oop, klass);
        }
    }

    fn finish_migration(&mut self, om: &mut ObjectMemory, originals: &[u32]) {
        for &oop in originals {
            let copy = header::get_forwarded_object(&om.mem, oop);
            let assn = om.get_association(oop);
            if assn != 0 {
                associations::set_assn_object(&mut om.mem, assn, copy);
                associations::clear_migratable(&mut om.mem, assn);
            }
            if om.write_barrier_enabled() && oop > om.memory_start() {
                let length = header::get_object_length(&om.mem, copy);
                om.bits.clear_oop_bit_range(&mut om.mem, oop - 4, oop + length - 4);
            }
        }
        om.rebuild_queues();
        self.full_gc_requested = true;
    }

    pub fn log_stats(&self) {
        log::info!(
            target: "squawk::eeprom",
            "persistent memory: {} collections, {} copies, {} migrations",
            self.collections,
            self.copies,
            self.migrations
        );
    }
}

/// Word offsets of the pointer fields of `oop`, for objects that may be
/// made persistent.
fn pointer_slots(om: &ObjectMemory, oop: u32, klass: u32) -> VmResult<Vec<i32>> {
    Ok(match shape_of(om, oop, klass) {
        Shape::Primitive => Vec::new(),
        Shape::References { count } => (0..count as i32).collect(),
        Shape::Instance { oop_map, fields } => (0..fields)
            .filter(|i| om.mem.get_unsigned_byte(oop_map, (i / 8) as i32) & (1 << (i % 8)) != 0)
            .map(|i| i as i32)
            .collect(),
        Shape::StackChunk | Shape::ClassState { .. } => {
            return Err(fatal!("0x{oop:x} cannot be made persistent"));
        }
    })
}

// ── Marking ───────────────────────────────────────────────────────────

/// Marks EEPROM objects in `(start, end]`.
struct PersistentMarker {
    start: u32,
    end: u32,
}

impl PersistentMarker {
    fn mark(&mut self, om: &mut ObjectMemory, ram_range: (u32, u32), stack: u32, stack_size: u32) {
        om.mark_stack.setup(stack, stack + stack_size);

        let eeprom = om.segment(Segment::Eeprom).start;
        for index in 0..ROOT_SIZE {
            if index != root::FREE_LIST {
                self.field(om, eeprom, MSR_ROOTS + index);
            }
        }
        let ram = om.segment(Segment::Ram).start;
        for index in 0..ROOT_SIZE {
            self.field(om, ram, MSR_ROOTS + index);
        }

        let (mut block, ram_end) = ram_range;
        while block < ram_end {
            let oop = header::block_to_oop(&om.mem, block);
            if header::is_forwarded(&om.mem, oop) {
                let copy = header::get_forwarded_object(&om.mem, oop);
                self.mark_object(om, copy);
                block = oop + header::get_object_length(&om.mem, copy);
            } else {
                let klass = header::get_class(&om.mem, oop);
                traverse_object(om, oop, klass, self);
                block = oop + header::object_length_for_class(&om.mem, oop, klass);
            }
        }

        while om.mark_stack.overflowed() {
            om.mark_stack.reset_overflow();
            om.bits.start_iteration(&om.mem, self.start, self.end);
            loop {
                let oop = om.bits.get_next_iteration();
                if oop == 0 {
                    break;
                }
                self.remark(om, oop);
                om.bits.iterate(&om.mem);
            }
            om.bits.end_iteration();
        }
        om.mark_stack.finish();
    }

    fn mark_object(&mut self, om: &mut ObjectMemory, oop: u32) {
        if self.start < oop && oop <= self.end && !om.bits.test_and_set_oop_bit(&mut om.mem, oop) {
            self.remark(om, oop);
        }
    }

    fn remark(&mut self, om: &mut ObjectMemory, oop: u32) {
        if om.mark_stack.recurse_level() == 0 {
            om.mark_stack.push(&mut om.mem, oop);
            return;
        }
        om.mark_stack.recurse_level_dec();
        let mut next = oop;
        while next != 0 {
            let klass = header::get_class(&om.mem, next);
            traverse_object(om, next, klass, self);
            next = om.mark_stack.pop(&om.mem);
        }
        om.mark_stack.recurse_level_inc();
    }
}

impl FieldAction for PersistentMarker {
    fn field(&mut self, om: &mut ObjectMemory, base: u32, offset: i32) {
        let value = om.mem.get_word(base, offset);
        if value == 0 {
            return;
        }
        if om.in_eeprom(value) {
            self.mark_object(om, value);
        } else if om.in_ram(value) && header::is_forwarded(&om.mem, value) {
            let copy = header::get_forwarded_object(&om.mem, value);
            self.mark_object(om, copy);
        }
    }
}
