//! Mark-compact collector.
//!
//! RAM is laid out as
//!
//! ```text
//! [MSR][object memory ............................][mark stack reserve][bitmap]
//!       ^memory_start   ^partition_start  ^free    ^memory_end
//!       old generation   young generation
//! ```
//!
//! A partial collection compacts only the young generation, the objects
//! allocated since the last collection. Pointers from older objects into
//! it are found through the write barrier, which sets the bitmap bit of
//! every RAM field a pointer is stored into. Once compacted, the young
//! objects join the old generation. A full collection starts the young
//! generation at `memory_start`.
//!
//! Compaction is the classic four passes: mark, compute forwarding
//! addresses, update pointers, relocate. The forwarding information lives
//! in the low 24 bits of each marked object's class word: the distance the
//! object moves, in words, above a relative class number (RCN) that stands
//! in for the class pointer. When a distance does not fit, the object moves
//! less, leaving a hole, and the passes are repeated.

use crate::associations::{self, Liveness};
use crate::bitvector::BitVector;
use crate::config::{CollectorKind, TraceFlags, VmSettings};
use crate::error::VmResult;
use crate::fatal;
use crate::frames;
use crate::header;
use crate::heap::ObjectMemory;
use crate::layout::*;
use crate::memory::roundup4;

use super::{FieldAction, RamCollector, traverse_frames, traverse_object, walk_stack_chunk};

/// What a traversal does with each field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Mark what the field points to, or redirect it to the EEPROM copy of
    /// a migrated object.
    Mark,
    /// Point the field at the forwarding address.
    Update,
    /// Check that the field points into memory and follow it.
    Verify,
}

pub struct Lisp2Collector {
    phase: Phase,
    young_percent: u32,
    ideal_young_size: u32,
    /// Always collect from `memory_start`.
    full_gc: bool,
    minimum_heap: bool,
    /// Full collection requested for the collection in progress.
    force_full: bool,

    collection_start: u32,
    collection_end: u32,
    last_collection_was_full: bool,

    rcn_mask: u32,
    delta_shift: u32,
    max_delta: u32,
    delta_limit: Option<u32>,

    high_water_mark: u32,
    collections: u32,
    full_collections: u32,
    partial_collections: u32,
    compaction_passes: u32,
    trace: TraceFlags,
}

impl Lisp2Collector {
    pub fn new(settings: &VmSettings) -> Self {
        Self {
            phase: Phase::Mark,
            young_percent: settings.young_percent,
            ideal_young_size: 0,
            full_gc: settings.full_gc,
            minimum_heap: false,
            force_full: false,
            collection_start: 0,
            collection_end: 0,
            last_collection_was_full: false,
            rcn_mask: 0,
            delta_shift: 0,
            max_delta: 0,
            delta_limit: None,
            high_water_mark: 0,
            collections: 0,
            full_collections: 0,
            partial_collections: 0,
            compaction_passes: 0,
            trace: settings.trace,
        }
    }

    /// Cap the distance an object may move in one pass. Small caps force
    /// the hole handling.
    pub fn set_max_forwarding_delta(&mut self, limit: u32) {
        assert!(limit >= 4 && limit % 4 == 0);
        self.delta_limit = Some(limit);
    }

    fn compute_ideal_young_size(&mut self, om: &ObjectMemory) {
        self.ideal_young_size = if self.minimum_heap {
            16
        } else {
            om.memory_size() / 100 * self.young_percent
        };
    }

    fn bitmap_address(om: &ObjectMemory) -> u32 {
        om.memory_end() + MIN_MARK_STACK_SIZE
    }

    /// Largest object memory that leaves room for the mark stack reserve
    /// and a bitmap covering it inside `available` bytes.
    fn object_memory_size(start: u32, available: u32) -> u32 {
        let overhead = |size: u32| MIN_MARK_STACK_SIZE + BitVector::bitmap_size_for(start, start + size);
        let mut size = (available.saturating_sub(MIN_MARK_STACK_SIZE) / 33 * 32) & !3;
        while size > 0 && size + overhead(size) > available {
            size -= 4;
        }
        while size + 4 + overhead(size + 4) <= available {
            size += 4;
        }
        size
    }

    // ── Forwarding ────────────────────────────────────────────────────

    fn setup_forwarding(&mut self, om: &ObjectMemory) {
        let max_rcn = om.maximum_rcn();
        let bits = 32 - max_rcn.leading_zeros();
        self.rcn_mask = (1 << bits) - 1;
        self.delta_shift = bits;
        self.max_delta = ((1 << (24 - bits)) - 1) * 4;
        if let Some(limit) = self.delta_limit {
            self.max_delta = self.max_delta.min(limit);
        }
        log::trace!(
            target: "squawk::gc",
            "forwarding: {bits} class bits, max delta {} bytes",
            self.max_delta
        );
    }

    #[inline(always)]
    fn in_collection_space(&self, oop: u32) -> bool {
        self.collection_start < oop && oop <= self.collection_end
    }

    fn forward(&self, om: &mut ObjectMemory, oop: u32, klass: u32, delta: u32) {
        let rcn = om.rcn_from_class(klass);
        debug_assert!(rcn <= self.rcn_mask && delta <= self.max_delta);
        header::set_encoded_low_bits(&mut om.mem, oop, ((delta / 4) << self.delta_shift) | rcn);
    }

    fn forwarded_address(&self, om: &ObjectMemory, oop: u32) -> u32 {
        if self.in_collection_space(oop) {
            let low = header::get_encoded_low_bits(&om.mem, oop);
            oop - (low >> self.delta_shift) * 4
        } else {
            oop
        }
    }

    fn forwarded_class(&self, om: &ObjectMemory, oop: u32) -> u32 {
        let low = header::get_encoded_low_bits(&om.mem, oop);
        om.class_from_rcn(low & self.rcn_mask)
    }

    // ── Mark ──────────────────────────────────────────────────────────

    fn mark_or_forward(&mut self, om: &mut ObjectMemory, base: u32, offset: i32) {
        let oop = om.mem.get_word(base, offset);
        if oop == 0 {
            return;
        }
        if om.in_ram(oop) && header::is_forwarded(&om.mem, oop) {
            // Migrated to EEPROM.
            let copy = header::get_forwarded_object(&om.mem, oop);
            om.mem.set_word(base, offset, copy);
        } else {
            self.mark_object(om, oop);
        }
    }

    fn mark_object(&mut self, om: &mut ObjectMemory, oop: u32) {
        if self.in_collection_space(oop) && !om.bits.test_and_set_oop_bit(&mut om.mem, oop) {
            self.remark(om, oop);
        }
    }

    /// Trace the fields of a freshly marked object, recursing a few levels
    /// and deferring to the mark stack below that.
    fn remark(&mut self, om: &mut ObjectMemory, oop: u32) {
        if om.mark_stack.recurse_level() == 0 {
            om.mark_stack.push(&mut om.mem, oop);
            return;
        }
        om.mark_stack.recurse_level_dec();
        self.traverse(om, oop);
        loop {
            let next = om.mark_stack.pop(&om.mem);
            if next == 0 {
                break;
            }
            self.traverse(om, next);
        }
        om.mark_stack.recurse_level_inc();
    }

    fn traverse(&mut self, om: &mut ObjectMemory, oop: u32) {
        let klass = header::get_class(&om.mem, oop);
        traverse_object(om, oop, klass, self);
    }

    /// Remark every marked object in `(from, to]` until no push is dropped.
    fn handle_overflow(&mut self, om: &mut ObjectMemory, from: u32, to: u32) {
        while om.mark_stack.overflowed() {
            om.mark_stack.reset_overflow();
            log::debug!(target: "squawk::gc", "mark stack overflow, rescanning");
            om.bits.start_iteration(&om.mem, from, to);
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
    }

    fn mark(&mut self, om: &mut ObjectMemory) -> VmResult<()> {
        self.phase = Phase::Mark;
        let stack_end = Self::bitmap_address(om);
        om.mark_stack.setup(self.collection_end, stack_end);
        om.bits.clear_oop_bit_range(&mut om.mem, self.collection_start, self.collection_end);

        let ram = om.segment(Segment::Ram).start;
        for index in 0..ROOT_SIZE {
            if index != root::ASSOCIATION_HASHTABLE {
                self.mark_or_forward(om, ram, MSR_ROOTS + index);
            }
        }

        // Old generation fields that had pointers stored into them.
        om.bits.start_iteration(&om.mem, om.memory_start(), self.collection_start);
        loop {
            let field = om.bits.get_next_iteration();
            if field == 0 {
                break;
            }
            let value = om.mem.read_word(field);
            if value != 0 {
                if om.in_ram(value) && header::is_forwarded(&om.mem, value) {
                    om.bits.clear_oop_bit(&mut om.mem, field);
                }
                self.mark_or_forward(om, field, 0);
            }
            om.bits.iterate(&om.mem);
        }
        om.bits.end_iteration();

        // Frames are written without the barrier, so old chunks are always
        // rescanned.
        let mut chunk = om.root(Segment::Ram, root::STACK_CHUNK_LIST);
        while chunk != 0 {
            if self.in_collection_space(chunk) {
                self.mark_object(om, chunk);
            } else {
                walk_stack_chunk(om, chunk, self);
            }
            chunk = frames::chunk_list(&om.mem, chunk);
        }

        let (start, end) = (self.collection_start, self.collection_end);
        self.handle_overflow(om, start, end);
        associations::process_queues(om, self);
        self.handle_overflow(om, start, end);
        associations::check_queues(om, self)?;
        om.mark_stack.finish();
        Ok(())
    }

    // ── Compute addresses ─────────────────────────────────────────────

    /// Forward every marked object to the lowest free address. Returns
    /// whether some object could not move all the way.
    fn compute_addresses(&mut self, om: &mut ObjectMemory) -> bool {
        let mut free = self.collection_start;
        let mut hole = false;
        om.bits.start_iteration(&om.mem, self.collection_start, self.collection_end);
        loop {
            let oop = om.bits.get_next_iteration();
            if oop == 0 {
                break;
            }
            let klass = header::get_class(&om.mem, oop);
            let length = header::object_length_for_class(&om.mem, oop, klass);
            let header_size = header::get_header_size(&om.mem, oop);
            let mut delta = oop - (free + header_size);
            if delta > self.max_delta {
                delta = self.max_delta;
                hole = true;
            }
            self.forward(om, oop, klass, delta);
            free = oop - delta + length;
            om.bits.iterate(&om.mem);
        }
        om.bits.end_iteration();
        hole
    }

    // ── Update pointers ───────────────────────────────────────────────

    fn update_pointers(&mut self, om: &mut ObjectMemory) {
        self.phase = Phase::Update;
        let ram = om.segment(Segment::Ram).start;

        let mut chunk = om.root(Segment::Ram, root::STACK_CHUNK_LIST);
        while chunk != 0 {
            let next = frames::chunk_list(&om.mem, chunk);
            let target = if self.in_collection_space(chunk) {
                debug_assert!(om.bits.test_oop_bit(&om.mem, chunk), "listed chunk 0x{chunk:x} not marked");
                self.forwarded_address(om, chunk)
            } else {
                chunk
            };
            traverse_frames(om, chunk, chunk, target, self);
            self.field(om, chunk, STACK_LIST);
            self.field(om, chunk, STACK_NEXT);
            self.field(om, chunk, STACK_PREV);
            chunk = next;
        }

        let table = om.association_table();
        if table != 0 {
            let mut queued = Vec::new();
            om.for_each_association(|assn| queued.push(assn));
            for assn in queued {
                self.update_object_if_not_marked(om, assn);
            }
            self.update_object_if_not_marked(om, table);
        }

        om.bits.start_iteration(&om.mem, om.memory_start(), self.collection_start);
        loop {
            let field = om.bits.get_next_iteration();
            if field == 0 {
                break;
            }
            self.field(om, field, 0);
            om.bits.iterate(&om.mem);
        }
        om.bits.end_iteration();

        for index in 0..ROOT_SIZE {
            self.field(om, ram, MSR_ROOTS + index);
        }

        om.bits.start_iteration(&om.mem, self.collection_start, self.collection_end);
        loop {
            let oop = om.bits.get_next_iteration();
            if oop == 0 {
                break;
            }
            let klass = self.forwarded_class(om, oop);
            traverse_object(om, oop, klass, self);
            om.bits.iterate(&om.mem);
        }
        om.bits.end_iteration();
    }

    /// Associations are written without the barrier, so those outside the
    /// collection space are updated here and their barrier bits dropped to
    /// keep the barrier pass from updating them twice.
    fn update_object_if_not_marked(&mut self, om: &mut ObjectMemory, oop: u32) {
        if self.in_collection_space(oop) {
            debug_assert!(om.bits.test_oop_bit(&om.mem, oop), "live 0x{oop:x} not marked");
            return;
        }
        let klass = header::get_class(&om.mem, oop);
        traverse_object(om, oop, klass, self);
        if om.in_ram(oop) && oop > om.memory_start() {
            let length = header::object_length_for_class(&om.mem, oop, klass);
            om.bits.clear_oop_bit_range(&mut om.mem, oop - 4, oop + length - 4);
        }
    }

    // ── Relocate ──────────────────────────────────────────────────────

    /// Move every marked object to its forwarding address, restoring its
    /// class pointer, and size the next young generation. Returns the new
    /// free pointer.
    fn relocate(&mut self, om: &mut ObjectMemory) -> u32 {
        let mut free = self.collection_start;
        let mut moved = 0u32;
        om.bits.start_iteration(&om.mem, self.collection_start, self.collection_end);
        loop {
            let oop = om.bits.get_next_iteration();
            if oop == 0 {
                break;
            }
            let target = self.forwarded_address(om, oop);
            let klass = self.forwarded_class(om, oop);
            header::set_class(&mut om.mem, oop, klass);
            let header_size = header::get_header_size(&om.mem, oop);
            let length = header::object_length_for_class(&om.mem, oop, klass);
            if target != oop {
                om.mem.copy_bytes(oop - header_size, target - header_size, header_size + length);
                moved += 1;
            }
            free = target + length;
            om.bits.iterate(&om.mem);
        }
        om.bits.end_iteration();

        let failed = om.failed_allocation_size();
        let mut end = free
            .saturating_add(failed)
            .saturating_add(roundup4(self.ideal_young_size))
            .min(om.memory_end());
        if self.minimum_heap {
            end = end.max(self.high_water_mark);
        }
        self.high_water_mark = self.high_water_mark.max(end);
        om.set_partition_free(free);
        om.set_partition_end(end);
        if om.association_table() != 0 {
            om.rebuild_queues();
        }
        log::trace!(target: "squawk::gc", "relocated {moved} objects, free 0x{free:x} end 0x{end:x}");
        free
    }

    // ── Verify ────────────────────────────────────────────────────────

    fn verify_field(&mut self, om: &mut ObjectMemory, base: u32, offset: i32) {
        let oop = om.mem.get_word(base, offset);
        if oop == 0 {
            return;
        }
        assert!(
            om.segment_of(oop).is_some(),
            "field 0x{base:x}[{offset}] points outside memory (0x{oop:x})"
        );
        if om.in_ram(oop) {
            assert!(
                oop <= om.partition_free(),
                "field 0x{base:x}[{offset}] points past the heap (0x{oop:x})"
            );
            if oop > om.memory_start() && !om.bits.test_and_set_oop_bit(&mut om.mem, oop) {
                self.remark(om, oop);
            }
        }
    }

    /// Walk everything reachable from the RAM roots and check it.
    fn verify(&mut self, om: &mut ObjectMemory) {
        self.phase = Phase::Verify;
        om.bits.clear_all_oop_bits(&mut om.mem);
        let stack_end = Self::bitmap_address(om);
        om.mark_stack.setup(om.partition_free(), stack_end);
        let ram = om.segment(Segment::Ram).start;
        for index in 0..ROOT_SIZE {
            self.field(om, ram, MSR_ROOTS + index);
        }
        let (start, end) = (om.memory_start(), om.partition_free());
        self.handle_overflow(om, start, end);
        om.mark_stack.finish();
        om.bits.clear_all_oop_bits(&mut om.mem);
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Drop chunks no context runs on from the chunk list, and unhook them
    /// from the live chunks that kept them as spares.
    fn remove_dead_stack_chunks(&mut self, om: &mut ObjectMemory) {
        let mut previous = 0;
        let mut chunk = om.root(Segment::Ram, root::STACK_CHUNK_LIST);
        let mut removed = 0;
        while chunk != 0 {
            let next = frames::chunk_list(&om.mem, chunk);
            if frames::chunk_last_lp(&om.mem, chunk) == 0 {
                if previous == 0 {
                    om.set_ram_root(root::STACK_CHUNK_LIST, next);
                } else {
                    frames::set_chunk_list(&mut om.mem, previous, next);
                }
                removed += 1;
            } else {
                let spare = frames::chunk_next(&om.mem, chunk);
                if spare != 0 && frames::chunk_last_lp(&om.mem, spare) == 0 {
                    frames::set_chunk_next(&mut om.mem, chunk, 0);
                }
                previous = chunk;
            }
            chunk = next;
        }
        if removed > 0 {
            log::trace!(target: "squawk::gc", "{removed} dead stack chunks unlisted");
        }
    }

    fn compact(&mut self, om: &mut ObjectMemory) -> VmResult<()> {
        let mut previous_free = u32::MAX;
        loop {
            self.compaction_passes += 1;
            self.mark(om)?;
            let hole = self.compute_addresses(om);
            self.update_pointers(om);
            let free = self.relocate(om);
            if !hole {
                return Ok(());
            }
            if free >= previous_free {
                return Err(fatal!("compaction with holes made no progress at 0x{free:x}"));
            }
            log::debug!(target: "squawk::gc", "hole left at compaction, another pass");
            previous_free = free;
            self.collection_end = free;
        }
    }

    /// Compact `[partition_start, partition_free)` and make it part of the
    /// old generation.
    fn collect_partition(&mut self, om: &mut ObjectMemory) -> VmResult<bool> {
        self.collection_start = om.partition_start();
        self.collection_end = om.partition_free();
        let dirty_end = self.collection_end;
        self.last_collection_was_full = self.collection_start == om.memory_start();
        if self.last_collection_was_full {
            self.full_collections += 1;
        } else {
            self.partial_collections += 1;
        }
        log::debug!(
            target: "squawk::gc",
            "{} collection of [0x{:x}, 0x{:x})",
            if self.last_collection_was_full { "full" } else { "partial" },
            self.collection_start,
            self.collection_end
        );

        om.enter_collector();
        let result = self.compact(om);
        if result.is_ok() {
            let free = om.partition_free();
            om.set_partition_start(free);
            let start = om.memory_start();
            om.bits.clear_oop_bit_range(&mut om.mem, start, dirty_end.max(free));
            if cfg!(debug_assertions) {
                self.verify(om);
            }
        }
        om.leave_collector();
        result?;
        Ok(self.free_memory(om) >= om.failed_allocation_size())
    }

    fn gc_prim1(&mut self, om: &mut ObjectMemory) -> VmResult<bool> {
        if !self.full_gc {
            let ok = self.collect_partition(om)?;
            if self.last_collection_was_full {
                return Ok(ok);
            }
            let wanted = om.failed_allocation_size().saturating_add(roundup4(self.ideal_young_size));
            if ok && self.free_memory(om) >= wanted {
                return Ok(ok);
            }
        }
        om.set_partition_start(om.memory_start());
        self.collect_partition(om)
    }

    fn gc_prim(&mut self, om: &mut ObjectMemory) -> VmResult<bool> {
        let need_full = self.force_full || om.excessive_gc();
        let mut ok = self.gc_prim1(om)?;
        if !self.last_collection_was_full && need_full {
            om.set_partition_start(om.memory_start());
            ok = self.gc_prim1(om)?;
        }
        Ok(ok)
    }
}

impl FieldAction for Lisp2Collector {
    fn field(&mut self, om: &mut ObjectMemory, base: u32, offset: i32) {
        match self.phase {
            Phase::Mark => self.mark_or_forward(om, base, offset),
            Phase::Update => {
                let value = om.mem.get_word(base, offset);
                if value != 0 {
                    let target = self.forwarded_address(om, value);
                    if target != value {
                        om.mem.set_word(base, offset, target);
                    }
                }
            }
            Phase::Verify => self.verify_field(om, base, offset),
        }
    }

    fn stack_chunk(&mut self, om: &mut ObjectMemory, chunk: u32) {
        // Chunks are updated from the chunk list before any object.
        if self.phase != Phase::Update {
            walk_stack_chunk(om, chunk, self);
        }
    }
}

impl Liveness for Lisp2Collector {
    fn is_alive(&self, om: &ObjectMemory, oop: u32) -> bool {
        !self.in_collection_space(oop) || om.bits.test_oop_bit(&om.mem, oop)
    }

    /// Old objects are not marked, but what they reference in the young
    /// generation must survive with them.
    fn keep(&mut self, om: &mut ObjectMemory, oop: u32) -> u32 {
        if self.in_collection_space(oop) {
            self.mark_object(om, oop);
        } else if oop != 0 && om.in_ram(oop) {
            self.traverse(om, oop);
        }
        oop
    }
}

impl RamCollector for Lisp2Collector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Lisp2
    }

    fn initialize(&mut self, om: &mut ObjectMemory, fresh: bool) -> VmResult<()> {
        let ram = om.segment(Segment::Ram);
        if fresh {
            let start = ram.heap_start();
            let size = Self::object_memory_size(start, ram.end() - start);
            om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_START, start);
            om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_SIZE, size);
        }
        let start = om.memory_start();
        let end = om.memory_end();
        let bitmap = Self::bitmap_address(om);
        let bitmap_size = BitVector::bitmap_size_for(start, end);
        if end <= start + 64 || bitmap + bitmap_size > ram.end() {
            return Err(fatal!("RAM of {} bytes is too small for mark-compact", ram.size));
        }
        om.bits.init(start, end, bitmap, bitmap_size);
        om.bits.clear_all_oop_bits(&mut om.mem);
        om.enable_write_barrier();

        self.compute_ideal_young_size(om);
        if fresh {
            let young = (start + roundup4(self.ideal_young_size)).min(end);
            om.set_partition(start, start, young);
        }
        log::debug!(
            target: "squawk::gc",
            "object memory [0x{start:x}, 0x{end:x}), bitmap 0x{bitmap:x}+{bitmap_size}, young {} bytes",
            self.ideal_young_size
        );
        Ok(())
    }

    fn collect(&mut self, om: &mut ObjectMemory, force_full: bool) -> VmResult<bool> {
        self.setup_forwarding(om);
        self.remove_dead_stack_chunks(om);
        self.force_full = force_full;
        let ok = self.gc_prim(om)?;
        self.collections += 1;
        if self.trace.contains(TraceFlags::GC) {
            log::debug!(
                target: "squawk::gc",
                "collection {} done: {} bytes used, {} free",
                self.collections,
                self.used_memory(om),
                self.free_memory(om)
            );
        }
        Ok(ok)
    }

    fn free_memory(&self, om: &ObjectMemory) -> u32 {
        om.memory_end() - om.partition_free()
    }

    fn total_memory(&self, om: &ObjectMemory) -> u32 {
        om.memory_size()
    }

    fn ram_object_range(&self, om: &ObjectMemory) -> (u32, u32) {
        (om.memory_start(), om.partition_free())
    }

    fn set_minimum_heap_mode(&mut self, om: &mut ObjectMemory, on: bool) -> VmResult<()> {
        self.full_gc = on;
        self.minimum_heap = on;
        let free = om.partition_free();
        om.set_partition_end(free);
        self.high_water_mark = free;
        self.compute_ideal_young_size(om);
        log::debug!(target: "squawk::gc", "minimum heap mode {}", if on { "on" } else { "off" });
        Ok(())
    }

    fn heap_high_water_mark(&self, om: &ObjectMemory) -> u32 {
        self.high_water_mark.saturating_sub(om.memory_start())
    }

    fn collection_count(&self) -> u32 {
        self.collections
    }

    fn log_stats(&self) {
        log::info!(
            target: "squawk::gc",
            "mark-compact collector: {} collections ({} full, {} partial), {} compaction passes",
            self.collections,
            self.full_collections,
            self.partial_collections,
            self.compaction_passes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::cno;
    use crate::collector::tests::{assert_test_pattern, create_test_method, create_test_pattern};
    use crate::romizer::RomBuilder;

    fn create_test_collector(young_percent: u32) -> (Lisp2Collector, ObjectMemory) {
        let settings = VmSettings {
            young_percent,
            ..Default::default()
        };
        let mut om = RomBuilder::new().build_object_memory(0x1000, 0x8000, &settings);
        let mut gc = Lisp2Collector::new(&settings);
        gc.initialize(&mut om, true).unwrap();
        (gc, om)
    }

    fn create_test_list(om: &mut ObjectMemory, length: u32, garbage: u32) -> u32 {
        let array = om.class_from_cno(cno::OBJECT_ARRAY);
        let ints = om.class_from_cno(cno::INT_ARRAY);
        let mut head = 0;
        for _ in 0..length {
            if garbage > 0 {
                om.new_array(ints, garbage);
            }
            let cell = om.new_array(array, 1);
            om.mem.set_word(cell, 0, head);
            head = cell;
        }
        head
    }

    fn list_length(om: &ObjectMemory, mut cell: u32) -> u32 {
        let mut n = 0;
        while cell != 0 {
            assert!(header::get_class(&om.mem, cell) == om.class_from_cno(cno::OBJECT_ARRAY));
            n += 1;
            cell = om.mem.get_word(cell, 0);
        }
        n
    }

    #[test]
    fn layout_fits_bitmap_inside_ram() {
        let (gc, om) = create_test_collector(10);
        let ram = om.segment(Segment::Ram);
        let bitmap = Lisp2Collector::bitmap_address(&om);
        assert_eq!(om.memory_start(), ram.heap_start());
        assert!(bitmap + BitVector::bitmap_size_for(om.memory_start(), om.memory_end()) <= ram.end());
        assert_eq!(gc.total_memory(&om), om.memory_size());
        assert_eq!(om.partition_end() - om.partition_start(), roundup4(om.memory_size() / 100 * 10));
        assert!(om.write_barrier_enabled());
    }

    #[test]
    fn full_collection_compacts_and_promotes() {
        let (mut gc, mut om) = create_test_collector(50);
        let list = create_test_list(&mut om, 8, 6);
        om.set_ram_root(root::OUT_OF_MEMORY_OBJECT, list);
        let before = om.partition_free();

        assert!(gc.collect(&mut om, false).unwrap());
        let list = om.root(Segment::Ram, root::OUT_OF_MEMORY_OBJECT);
        assert_eq!(list_length(&om, list), 8);
        assert_eq!(om.partition_free(), om.memory_start() + 8 * 8);
        assert!(om.partition_free() < before);
        assert_eq!(om.partition_start(), om.partition_free());
        assert_eq!(gc.free_memory(&om) + gc.used_memory(&om), gc.total_memory(&om));
        assert_eq!(list, om.partition_free() - 4);
    }

    /// `(class number, count)` of the pattern array kept in slot `i`.
    fn slot_shape(i: u32) -> (u32, u32) {
        match i % 3 {
            0 => (cno::INT_ARRAY, 3 + i * 5),
            1 => (cno::BYTE_ARRAY, 300 + i),
            _ => (cno::INT_ARRAY, 260),
        }
    }

    /// Fill `slots` of the rooted holder with fresh pattern arrays, with
    /// garbage allocated before each one.
    fn refill_slots(om: &mut ObjectMemory, slots: impl Iterator<Item = u32>, seed: u32) {
        let ints = om.class_from_cno(cno::INT_ARRAY);
        for i in slots {
            assert_ne!(om.new_array(ints, 10 + i * 3), 0);
            let (class_number, count) = slot_shape(i);
            let live = create_test_pattern(om, class_number, count, seed + i);
            let holder = om.root(Segment::Ram, root::OUT_OF_MEMORY_OBJECT);
            om.set_oop_ram(holder, i as i32, live);
        }
    }

    /// Collect and check that the live objects slid down in address order
    /// without overlapping and kept their contents.
    fn collect_and_check_order(gc: &mut Lisp2Collector, om: &mut ObjectMemory, full: bool, seeds: &[u32]) {
        let holder = om.root(Segment::Ram, root::OUT_OF_MEMORY_OBJECT);
        let mut live: Vec<(u32, Option<u32>)> = vec![(holder, None)];
        live.extend((0..seeds.len() as u32).map(|i| (om.mem.get_word(holder, i as i32), Some(i))));
        live.sort_by_key(|(oop, _)| *oop);
        let old: Vec<u32> = live.iter().map(|(oop, _)| *oop).collect();

        assert!(gc.collect(om, full).unwrap());
        let holder = om.root(Segment::Ram, root::OUT_OF_MEMORY_OBJECT);
        let moved: Vec<u32> = live
            .iter()
            .map(|(_, slot)| match slot {
                Some(i) => om.mem.get_word(holder, *i as i32),
                None => holder,
            })
            .collect();

        for (before, after) in old.iter().zip(&moved) {
            assert!(after <= before, "0x{before:x} moved up to 0x{after:x}");
        }
        for pair in moved.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            assert!(
                header::oop_to_block(&om.mem, next) >= header::next_block(&om.mem, prev),
                "0x{next:x} overlaps 0x{prev:x}"
            );
        }
        for i in 0..seeds.len() as u32 {
            let (class_number, count) = slot_shape(i);
            let oop = om.mem.get_word(holder, i as i32);
            assert_test_pattern(om, oop, class_number, count, seeds[i as usize] + i);
        }
        assert_eq!(gc.free_memory(om) + gc.used_memory(om), gc.total_memory(om));
    }

    #[test]
    fn compaction_keeps_address_order_and_contents() {
        const SLOTS: u32 = 12;
        let (mut gc, mut om) = create_test_collector(50);
        let holder = om.new_array(om.class_from_cno(cno::OBJECT_ARRAY), SLOTS);
        om.set_ram_root(root::OUT_OF_MEMORY_OBJECT, holder);
        let mut seeds = vec![100; SLOTS as usize];
        refill_slots(&mut om, 0..SLOTS, 100);
        collect_and_check_order(&mut gc, &mut om, false, &seeds);

        for round in 1..=2u32 {
            let seed = 100 * (round + 1);
            refill_slots(&mut om, (round % 2..SLOTS).step_by(2), seed);
            for i in (round % 2..SLOTS).step_by(2) {
                seeds[i as usize] = seed;
            }
            collect_and_check_order(&mut gc, &mut om, false, &seeds);
        }
        collect_and_check_order(&mut gc, &mut om, true, &seeds);
    }

    #[test]
    fn partial_collection_follows_write_barrier() {
        let (mut gc, mut om) = create_test_collector(50);
        let array = om.class_from_cno(cno::OBJECT_ARRAY);
        let old = om.new_array(array, 1);
        om.set_ram_root(root::OUT_OF_MEMORY_OBJECT, old);
        gc.collect(&mut om, false).unwrap();
        let old = om.root(Segment::Ram, root::OUT_OF_MEMORY_OBJECT);
        let promoted_end = om.partition_start();

        om.new_array(om.class_from_cno(cno::INT_ARRAY), 20);
        let young = om.new_array(om.class_from_cno(cno::INT_ARRAY), 1);
        om.mem.set_word(young, 0, 0x1234);
        om.set_oop_ram(old, 0, young);

        gc.collect(&mut om, false).unwrap();
        assert_eq!(gc.partial_collections, 1);
        let moved = om.mem.get_word(old, 0);
        assert_eq!(moved, promoted_end + 4);
        assert_eq!(om.mem.get_word(moved, 0), 0x1234);
        assert!(om.partition_start() >= promoted_end);
    }

    #[test]
    fn old_chunks_are_rescanned_and_young_chunks_moved() {
        let (mut gc, mut om) = create_test_collector(50);
        om.new_array(om.class_from_cno(cno::INT_ARRAY), 30);
        let method = create_test_method(&mut om, 1, 2, 0b01);
        let chunk = om.new_stack_chunk(32);
        let dead = om.new_stack_chunk(32);
        frames::set_chunk_next(&mut om.mem, chunk, dead);
        let array = om.class_from_cno(cno::OBJECT_ARRAY);
        let local = om.new_array(array, 1);

        let lp = frames::first_lp(chunk);
        frames::set_frame_mp(&mut om.mem, lp, method);
        frames::set_frame_ip(&mut om.mem, lp, method + 9);
        frames::set_frame_local(&mut om.mem, lp, 0, local);
        frames::set_frame_stack_offset(&mut om.mem, lp, frames::extended_stack_offset(2));
        frames::set_chunk_last_lp(&mut om.mem, chunk, lp);
        om.set_ram_root(root::CURRENT_STACK_CHUNK, chunk);

        gc.collect(&mut om, false).unwrap();
        let chunk = om.root(Segment::Ram, root::CURRENT_STACK_CHUNK);
        assert_eq!(om.root(Segment::Ram, root::STACK_CHUNK_LIST), chunk);
        assert_eq!(frames::chunk_list(&om.mem, chunk), 0);
        assert_eq!(frames::chunk_next(&om.mem, chunk), 0);
        let lp = frames::first_lp(chunk);
        assert_eq!(frames::chunk_last_lp(&om.mem, chunk), lp);
        let mp = frames::frame_mp(&om.mem, lp);
        assert_eq!(frames::frame_ip(&om.mem, lp), mp + 9);

        // The chunk is old now; a young local stored without the barrier
        // must still be found.
        let young = om.new_array(om.class_from_cno(cno::INT_ARRAY), 1);
        om.mem.set_word(young, 0, 77);
        frames::set_frame_local(&mut om.mem, lp, 0, young);
        om.new_array(om.class_from_cno(cno::INT_ARRAY), 10);
        gc.collect(&mut om, false).unwrap();
        let local = frames::frame_local(&om.mem, lp, 0);
        assert_eq!(om.mem.get_word(local, 0), 77);
    }

    #[test]
    fn holes_are_closed_over_several_passes() {
        let (mut gc, mut om) = create_test_collector(50);
        gc.set_max_forwarding_delta(8);
        let list = create_test_list(&mut om, 4, 10);
        om.set_ram_root(root::OUT_OF_MEMORY_OBJECT, list);

        assert!(gc.collect(&mut om, false).unwrap());
        assert!(gc.compaction_passes > 1);
        let list = om.root(Segment::Ram, root::OUT_OF_MEMORY_OBJECT);
        assert_eq!(list_length(&om, list), 4);
        assert_eq!(om.partition_free(), om.memory_start() + 4 * 8);
    }

    #[test]
    fn associations_are_rehashed_after_compaction() {
        let (mut gc, mut om) = create_test_collector(50);
        let array = om.class_from_cno(cno::OBJECT_ARRAY);
        om.new_array(om.class_from_cno(cno::INT_ARRAY), 33);
        let obj = om.new_array(array, 1);
        let assn = om.get_or_create_association(obj);
        om.mem.set_word(assn, ASSN_HASH_CODE, 9);
        om.set_ram_root(root::OUT_OF_MEMORY_OBJECT, obj);

        gc.collect(&mut om, false).unwrap();
        let obj = om.root(Segment::Ram, root::OUT_OF_MEMORY_OBJECT);
        let assn = om.get_association(obj);
        assert_ne!(assn, 0);
        assert_eq!(om.mem.get_word(assn, ASSN_HASH_CODE), 9);
    }

    #[test]
    fn minimum_heap_mode_tracks_high_water_mark() {
        let (mut gc, mut om) = create_test_collector(10);
        let list = create_test_list(&mut om, 4, 0);
        om.set_ram_root(root::OUT_OF_MEMORY_OBJECT, list);
        gc.set_minimum_heap_mode(&mut om, true).unwrap();
        assert_eq!(om.partition_end(), om.partition_free());
        assert_eq!(gc.heap_high_water_mark(&om), 4 * 8);

        om.set_failed_allocation_size(12);
        assert!(gc.collect(&mut om, false).unwrap());
        assert_eq!(gc.full_collections, 1);
        assert!(gc.heap_high_water_mark(&om) >= 4 * 8 + 12);
    }
}
