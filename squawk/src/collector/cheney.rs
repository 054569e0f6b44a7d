//! Two-space copying collector.
//!
//! RAM object memory is split into two equal halves. Allocation bumps
//! through one of them. A collection copies everything reachable from the
//! RAM roots into the other half, breadth first, leaving forwarding
//! pointers behind, and then swaps the roles of the halves.
//!
//! Stack chunks record their own address in `STACK_SELF` so the frame links
//! inside a copied chunk can be rebased afterwards.

use crate::associations::{self, Liveness};
use crate::config::{CollectorKind, TraceFlags, VmSettings};
use crate::error::VmResult;
use crate::fatal;
use crate::frames;
use crate::header;
use crate::heap::ObjectMemory;
use crate::layout::*;

use super::{FieldAction, RamCollector, traverse_frames, traverse_object};

pub struct CheneyCollector {
    target_start: u32,
    target_end: u32,
    /// Next free byte in the target half.
    free: u32,
    /// Next copied object whose fields have not been updated.
    scan: u32,
    collections: u32,
    bytes_copied: u64,
    trace: TraceFlags,
}

impl CheneyCollector {
    pub fn new(settings: &VmSettings) -> Self {
        Self {
            target_start: 0,
            target_end: 0,
            free: 0,
            scan: 0,
            collections: 0,
            bytes_copied: 0,
            trace: settings.trace,
        }
    }

    fn half(om: &ObjectMemory) -> u32 {
        (om.memory_size() / 2) & !3
    }

    #[inline(always)]
    fn in_target(&self, oop: u32) -> bool {
        self.target_start < oop && oop <= self.target_end
    }

    fn setup_target(&mut self, om: &ObjectMemory) {
        let start = om.memory_start();
        let half = Self::half(om);
        if om.partition_start() == start {
            self.target_start = start + half;
            self.target_end = start + 2 * half;
        } else {
            self.target_start = start;
            self.target_end = start + half;
        }
        self.free = self.target_start;
        self.scan = self.target_start;
    }

    /// The address of `oop` in the target half, copying it there first if
    /// needed. Objects forwarded to EEPROM resolve to their copy.
    fn copy_object(&mut self, om: &mut ObjectMemory, oop: u32) -> u32 {
        if oop == 0 || self.in_target(oop) {
            return oop;
        }
        if header::is_forwarded(&om.mem, oop) {
            return header::get_forwarded_object(&om.mem, oop);
        }
        debug_assert!(
            header::get_class(&om.mem, oop) != om.class_from_cno(crate::class::cno::LOCAL_ARRAY)
                || frames::chunk_last_lp(&om.mem, oop) != 0,
            "dead stack chunk 0x{oop:x} reached"
        );
        let block = header::oop_to_block(&om.mem, oop);
        let header_size = oop - block;
        let length = header_size + header::get_object_length(&om.mem, oop);
        assert!(self.free + length <= self.target_end, "target half overflowed");
        let copy = self.free + header_size;
        om.mem.copy_bytes(block, self.free, length);
        self.free += length;
        self.bytes_copied += length as u64;
        header::forward_to_object(&mut om.mem, oop, copy);
        log::trace!(target: "squawk::gc", "copied 0x{oop:x} to 0x{copy:x} ({length} bytes)");
        copy
    }

    fn copy_roots(&mut self, om: &mut ObjectMemory) {
        for index in 0..ROOT_SIZE {
            if index == root::ASSOCIATION_HASHTABLE {
                continue;
            }
            let value = om.root(Segment::Ram, index);
            if om.in_ram(value) {
                let copy = self.copy_object(om, value);
                om.set_ram_root(index, copy);
            }
        }
    }

    /// Update the fields of every copied object not yet scanned. Copying
    /// appends to the target, so this runs until the scan pointer catches
    /// up with the free pointer.
    fn copy_non_roots(&mut self, om: &mut ObjectMemory) {
        while self.scan < self.free {
            let oop = header::block_to_oop(&om.mem, self.scan);
            let klass = header::get_class(&om.mem, oop);
            debug_assert!(!om.in_ram(klass), "class of 0x{oop:x} is in RAM");
            traverse_object(om, oop, klass, self);
            self.scan = header::next_block(&om.mem, oop);
        }
    }

    fn gc_prim(&mut self, om: &mut ObjectMemory) -> VmResult<()> {
        self.setup_target(om);
        log::debug!(
            target: "squawk::gc",
            "copying [0x{:x}, 0x{:x}) into [0x{:x}, 0x{:x})",
            om.partition_start(),
            om.partition_free(),
            self.target_start,
            self.target_end
        );
        self.copy_roots(om);
        self.copy_non_roots(om);
        associations::process_queues(om, self);
        self.copy_non_roots(om);
        associations::check_queues(om, self)?;
        self.collections += 1;
        om.set_partition(self.target_start, self.free, self.target_end);
        Ok(())
    }
}

impl FieldAction for CheneyCollector {
    fn field(&mut self, om: &mut ObjectMemory, base: u32, offset: i32) {
        let value = om.mem.get_word(base, offset);
        if value != 0 && om.in_ram(value) {
            let copy = self.copy_object(om, value);
            om.mem.set_word(base, offset, copy);
        }
    }

    fn stack_chunk(&mut self, om: &mut ObjectMemory, chunk: u32) {
        let from = frames::chunk_self(&om.mem, chunk);
        traverse_frames(om, chunk, from, chunk, self);

        let next = frames::chunk_next(&om.mem, chunk);
        if next != 0 {
            let current = header::get_possibly_forwarded(&om.mem, next);
            if frames::chunk_last_lp(&om.mem, current) == 0 {
                // Spare chunk kept for reuse. Let it go.
                frames::set_chunk_next(&mut om.mem, chunk, 0);
            } else {
                self.field(om, chunk, STACK_NEXT);
            }
        }
        self.field(om, chunk, STACK_PREV);
        frames::set_chunk_self(&mut om.mem, chunk, chunk);
    }
}

impl Liveness for CheneyCollector {
    fn is_alive(&self, om: &ObjectMemory, oop: u32) -> bool {
        !(om.partition_start() < oop && oop <= om.partition_end())
    }

    fn keep(&mut self, om: &mut ObjectMemory, oop: u32) -> u32 {
        if om.in_ram(oop) {
            self.copy_object(om, oop)
        } else {
            oop
        }
    }
}

impl RamCollector for CheneyCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Cheney
    }

    fn initialize(&mut self, om: &mut ObjectMemory, fresh: bool) -> VmResult<()> {
        let ram = om.segment(Segment::Ram);
        if fresh {
            let start = ram.heap_start();
            om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_START, start);
            om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_SIZE, ram.end() - start);
            let half = Self::half(om);
            om.set_partition(start, start, start + half);
        }
        let half = Self::half(om);
        if half < 64 {
            return Err(fatal!("RAM of {} bytes is too small for two semi-spaces", ram.size));
        }
        log::debug!(target: "squawk::gc", "semi-spaces of {half} bytes at 0x{:x}", om.memory_start());
        Ok(())
    }

    fn collect(&mut self, om: &mut ObjectMemory, _force_full: bool) -> VmResult<bool> {
        om.enter_collector();
        let from = (om.partition_start(), om.partition_end());
        let result = self.gc_prim(om);
        om.leave_collector();
        result?;

        if cfg!(debug_assertions) {
            om.mem.fill_words(from.0, from.1 - from.0, ZAP_PATTERN);
        }
        let ok = self.free_memory(om) >= om.failed_allocation_size();
        if self.trace.contains(TraceFlags::GC) {
            log::debug!(
                target: "squawk::gc",
                "collection {} done: {} bytes live, {}",
                self.collections,
                self.used_memory(om),
                if ok { "allocation fits" } else { "allocation still fails" }
            );
        }
        Ok(ok)
    }

    fn free_memory(&self, om: &ObjectMemory) -> u32 {
        om.partition_end() - om.partition_free()
    }

    fn total_memory(&self, om: &ObjectMemory) -> u32 {
        Self::half(om)
    }

    fn ram_object_range(&self, om: &ObjectMemory) -> (u32, u32) {
        (om.partition_start(), om.partition_free())
    }

    fn set_minimum_heap_mode(&mut self, _om: &mut ObjectMemory, _on: bool) -> VmResult<()> {
        Err(fatal!("minimum heap mode needs the mark-compact collector"))
    }

    fn heap_high_water_mark(&self, _om: &ObjectMemory) -> u32 {
        0
    }

    fn collection_count(&self) -> u32 {
        self.collections
    }

    fn log_stats(&self) {
        log::info!(
            target: "squawk::gc",
            "copying collector: {} collections, {} bytes copied",
            self.collections,
            self.bytes_copied
        );
    }
}
