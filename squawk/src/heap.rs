//! Object memory: the segment records, roots, the write barrier and the bump
//! allocator for RAM.
//!
//! [`ObjectMemory`] owns the whole address space together with the bit
//! vector and mark stack that the collectors borrow while they run. The
//! collectors themselves hold only their own parameters and reach memory
//! through this struct.

use crate::bitvector::BitVector;
use crate::class::{self, cno};
use crate::config::{CollectorKind, VmSettings};
use crate::error::VmResult;
use crate::fatal;
use crate::header;
use crate::layout::*;
use crate::markstack::MarkStack;
use crate::memory::{Memory, roundup4};

/// Address range of one segment, MSR included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRange {
    pub start: u32,
    pub size: u32,
}

impl SegmentRange {
    pub const fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    #[inline(always)]
    pub const fn end(&self) -> u32 {
        self.start + self.size
    }

    #[inline(always)]
    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.start + self.size
    }

    /// First byte after the segment record.
    #[inline(always)]
    pub const fn heap_start(&self) -> u32 {
        self.start + MSR_BYTES
    }
}

/// Allocation counters, logged with `--stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub allocations: u64,
    pub small_arrays: u64,
    pub large_arrays: u64,
    pub stack_chunks: u64,
}

pub struct ObjectMemory {
    pub mem: Memory,
    segments: [SegmentRange; 3],
    /// Write barrier and mark bits for RAM, swapped out temporarily by the
    /// persistent collector.
    pub bits: BitVector,
    pub mark_stack: MarkStack,
    kind: CollectorKind,
    write_barrier: bool,
    in_collector: bool,
    just_done_gc: bool,
    excessive_gc: bool,
    very_excessive_gc: bool,
    pub stats: AllocationStats,
}

impl ObjectMemory {
    pub fn new(
        mem: Memory,
        rom: SegmentRange,
        eeprom: SegmentRange,
        ram: SegmentRange,
        settings: &VmSettings,
    ) -> Self {
        Self {
            mem,
            segments: [rom, eeprom, ram],
            bits: BitVector::new(),
            mark_stack: MarkStack::new(),
            kind: settings.collector,
            write_barrier: false,
            in_collector: false,
            just_done_gc: false,
            excessive_gc: settings.excessive_gc,
            very_excessive_gc: settings.very_excessive_gc,
            stats: AllocationStats::default(),
        }
    }

    pub fn collector_kind(&self) -> CollectorKind {
        self.kind
    }

    // ── Segments ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn segment(&self, seg: Segment) -> SegmentRange {
        self.segments[seg as usize]
    }

    pub fn segment_of(&self, addr: u32) -> Option<Segment> {
        Segment::ALL
            .into_iter()
            .find(|seg| self.segments[*seg as usize].contains(addr))
    }

    #[inline(always)]
    pub fn in_rom(&self, addr: u32) -> bool {
        self.segment(Segment::Rom).contains(addr)
    }

    #[inline(always)]
    pub fn in_eeprom(&self, addr: u32) -> bool {
        self.segment(Segment::Eeprom).contains(addr)
    }

    #[inline(always)]
    pub fn in_ram(&self, addr: u32) -> bool {
        self.segment(Segment::Ram).contains(addr)
    }

    #[inline(always)]
    pub fn gci(&self, seg: Segment, index: i32) -> u32 {
        self.mem.get_word(self.segment(seg).start, index)
    }

    #[inline(always)]
    pub fn set_gci(&mut self, seg: Segment, index: i32, value: u32) {
        let start = self.segment(seg).start;
        self.mem.set_word(start, index, value);
    }

    #[inline(always)]
    pub fn root(&self, seg: Segment, index: i32) -> u32 {
        self.mem.get_word(self.segment(seg).start, MSR_ROOTS + index)
    }

    /// Store a root without the write barrier. Roots are scanned directly
    /// by every collector. An EEPROM root must not point into RAM.
    pub fn set_root(&mut self, seg: Segment, index: i32, value: u32) -> VmResult<()> {
        assert!((0..ROOT_SIZE).contains(&index), "bad root index {index}");
        match seg {
            Segment::Eeprom if self.in_ram(value) => {
                return Err(fatal!("EEPROM root {index} cannot point into RAM (0x{value:x})"));
            }
            Segment::Rom => return Err(fatal!("ROM root {index} is read only")),
            _ => {}
        }
        let start = self.segment(seg).start;
        self.mem.set_word(start, MSR_ROOTS + index, value);
        Ok(())
    }

    /// RAM root store used by the collectors and the interpreter.
    #[inline(always)]
    pub fn set_ram_root(&mut self, index: i32, value: u32) {
        let start = self.segment(Segment::Ram).start;
        self.mem.set_word(start, MSR_ROOTS + index, value);
    }

    // ── RAM partition ─────────────────────────────────────────────────

    pub fn memory_start(&self) -> u32 {
        self.gci(Segment::Ram, GCI_OBJECT_MEMORY_START)
    }

    pub fn memory_size(&self) -> u32 {
        self.gci(Segment::Ram, GCI_OBJECT_MEMORY_SIZE)
    }

    pub fn memory_end(&self) -> u32 {
        self.memory_start() + self.memory_size()
    }

    pub fn partition_start(&self) -> u32 {
        self.gci(Segment::Ram, GCI_PARTITION_START)
    }

    pub fn partition_free(&self) -> u32 {
        self.gci(Segment::Ram, GCI_PARTITION_FREE)
    }

    pub fn partition_end(&self) -> u32 {
        self.gci(Segment::Ram, GCI_PARTITION_END)
    }

    pub fn set_partition(&mut self, start: u32, free: u32, end: u32) {
        assert!(start <= free && free <= end, "bad partition [0x{start:x}, 0x{free:x}, 0x{end:x}]");
        self.set_gci(Segment::Ram, GCI_PARTITION_START, start);
        self.set_gci(Segment::Ram, GCI_PARTITION_FREE, free);
        self.set_gci(Segment::Ram, GCI_PARTITION_END, end);
    }

    pub fn set_partition_free(&mut self, free: u32) {
        self.set_gci(Segment::Ram, GCI_PARTITION_FREE, free);
    }

    pub fn set_partition_end(&mut self, end: u32) {
        self.set_gci(Segment::Ram, GCI_PARTITION_END, end);
    }

    pub fn set_partition_start(&mut self, start: u32) {
        self.set_gci(Segment::Ram, GCI_PARTITION_START, start);
    }

    pub fn failed_allocation_size(&self) -> u32 {
        self.gci(Segment::Ram, GCI_FAILED_ALLOCATION_SIZE)
    }

    pub fn set_failed_allocation_size(&mut self, size: u32) {
        self.set_gci(Segment::Ram, GCI_FAILED_ALLOCATION_SIZE, size);
    }

    // ── Collector state ───────────────────────────────────────────────

    /// Enable the RAM write barrier. The bit vector must already cover RAM
    /// object memory.
    pub fn enable_write_barrier(&mut self) {
        self.write_barrier = true;
    }

    pub fn write_barrier_enabled(&self) -> bool {
        self.write_barrier
    }

    pub fn enter_collector(&mut self) {
        assert!(!self.in_collector, "collector entered recursively");
        self.in_collector = true;
    }

    pub fn leave_collector(&mut self) {
        assert!(self.in_collector);
        self.in_collector = false;
        self.just_done_gc = true;
    }

    pub fn in_collector(&self) -> bool {
        self.in_collector
    }

    pub fn set_excessive_gc(&mut self, on: bool) {
        self.excessive_gc = on;
    }

    pub fn excessive_gc(&self) -> bool {
        self.excessive_gc
    }

    /// Every frame gets its own chunk when set.
    pub fn very_excessive_gc(&self) -> bool {
        self.very_excessive_gc
    }

    // ── Stores ────────────────────────────────────────────────────────

    #[inline(always)]
    fn write_barrier_mark(&mut self, field: u32) {
        if self.write_barrier {
            assert!(!self.in_collector, "write barrier hit inside the collector");
            self.bits.set_oop_bit(&mut self.mem, field);
        }
    }

    /// Store a pointer into a RAM object and record the field in the write
    /// barrier. Null stores are recorded too.
    pub fn set_oop_ram(&mut self, obj: u32, offset: i32, value: u32) {
        assert!(self.in_ram(obj), "set_oop_ram on 0x{obj:x} outside RAM");
        let field = obj.wrapping_add((offset * 4) as u32);
        self.write_barrier_mark(field);
        self.mem.set_word(obj, offset, value);
    }

    /// Store a pointer into any object. Returns false when the store would
    /// break the segment rules: nothing may point from EEPROM into RAM and
    /// ROM is never written.
    pub fn set_oop(&mut self, obj: u32, offset: i32, value: u32) -> bool {
        if self.in_ram(obj) {
            self.set_oop_ram(obj, offset, value);
            true
        } else if self.in_eeprom(obj) {
            if self.in_ram(value) {
                return false;
            }
            self.mem.set_word(obj, offset, value);
            true
        } else {
            false
        }
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Bump allocate `bytes` of zeroed RAM. Returns 0 and records the
    /// failed size when the partition is exhausted, or when excessive GC is
    /// on and no collection happened since the last allocation.
    pub fn new_chunk(&mut self, bytes: u32) -> u32 {
        assert!(!self.in_collector, "allocation inside the collector");
        assert!(bytes > 0);
        let size = roundup4(bytes);
        let current = self.partition_free();
        if self.partition_end() - current < size {
            self.set_failed_allocation_size(size);
            log::trace!(target: "squawk::alloc", "chunk of {size} bytes failed at 0x{current:x}");
            return 0;
        }
        if self.excessive_gc {
            if !self.just_done_gc {
                log::trace!(target: "squawk::alloc", "excessive gc: refusing {size} bytes");
                self.set_failed_allocation_size(size);
                return 0;
            }
            self.just_done_gc = false;
        }
        self.mem.zero_bytes(current, size);
        self.set_partition_free(current + size);
        self.stats.allocations += 1;
        current
    }

    pub fn new_instance(&mut self, klass: u32) -> u32 {
        assert!(!class::is_array_class(&self.mem, klass));
        let body = class::instance_fields_length(&self.mem, klass) * 4;
        let block = self.new_chunk(body + 4);
        if block == 0 {
            return 0;
        }
        let oop = block + 4;
        header::set_class(&mut self.mem, oop, klass);
        log::trace!(target: "squawk::alloc", "instance of 0x{klass:x} at 0x{oop:x}");
        oop
    }

    pub fn new_array(&mut self, klass: u32, count: u32) -> u32 {
        let element = class::array_element_length(&self.mem, klass);
        let Some(body) = count.checked_mul(element).filter(|b| *b <= header::MAX_ARRAY_COUNT) else {
            self.set_failed_allocation_size(u32::MAX >> 1);
            return 0;
        };
        let header_size = header::header_size_for_count(count);
        let block = self.new_chunk((body + header_size).max(4));
        if block == 0 {
            return 0;
        }
        let oop = block + header_size;
        header::set_class_and_array_count(&mut self.mem, oop, klass, count);
        if header_size == 4 {
            self.stats.small_arrays += 1;
        } else {
            self.stats.large_arrays += 1;
        }
        log::trace!(target: "squawk::alloc", "array of 0x{klass:x}[{count}] at 0x{oop:x}");
        oop
    }

    pub fn new_class_state(&mut self, klass: u32) -> u32 {
        let statics = class::static_fields_length(&self.mem, klass);
        let global_array = self.class_from_cno(cno::GLOBAL_ARRAY);
        self.new_array(global_array, CLS_STATE_OFFSET_TO_FIELDS as u32 + statics)
    }

    /// Allocate a stack chunk of at least `min_words` words and link it
    /// the way the active collector expects.
    pub fn new_stack_chunk(&mut self, min_words: u32) -> u32 {
        let mut size = min_words;
        if !self.very_excessive_gc && size < REGULAR_CHUNK_SIZE {
            size = REGULAR_CHUNK_SIZE;
        }
        let local_array = self.class_from_cno(cno::LOCAL_ARRAY);
        let chunk = self.new_array(local_array, size);
        if chunk == 0 {
            return 0;
        }
        self.stats.stack_chunks += 1;
        match self.kind {
            CollectorKind::Cheney => self.mem.set_word(chunk, STACK_SELF, chunk),
            CollectorKind::Lisp2 => {
                let list = self.root(Segment::Ram, root::STACK_CHUNK_LIST);
                self.mem.set_word(chunk, STACK_LIST, list);
                self.set_ram_root(root::STACK_CHUNK_LIST, chunk);
            }
        }
        self.mem.set_word(chunk, STACK_SIZE, size);
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::romizer::RomBuilder;

    fn create_test_memory(kind: CollectorKind) -> ObjectMemory {
        let settings = VmSettings {
            collector: kind,
            ..Default::default()
        };
        let mut om = RomBuilder::new().build_object_memory(0x1000, 0x4000, &settings);
        let heap = om.segment(Segment::Ram).heap_start();
        let end = om.segment(Segment::Ram).end();
        om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_START, heap);
        om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_SIZE, end - heap);
        om.set_partition(heap, heap, end);
        om
    }

    #[test]
    fn chunks_are_zeroed_and_bump_the_free_pointer() {
        let mut om = create_test_memory(CollectorKind::Lisp2);
        let free = om.partition_free();
        om.mem.fill_words(free, 16, 0xFFFF_FFFF);
        let a = om.new_chunk(5);
        assert_eq!(a, free);
        assert_eq!(om.partition_free(), free + 8);
        assert_eq!(om.mem.read_word(a + 4), 0);
        assert_eq!(om.stats.allocations, 1);
    }

    #[test]
    fn exhausted_partition_records_failed_size() {
        let mut om = create_test_memory(CollectorKind::Lisp2);
        let room = om.partition_end() - om.partition_free();
        assert_eq!(om.new_chunk(room + 1), 0);
        assert_eq!(om.failed_allocation_size(), roundup4(room + 1));
        assert_ne!(om.new_chunk(room), 0);
        assert_eq!(om.partition_free(), om.partition_end());
    }

    #[test]
    fn excessive_gc_needs_a_collection_per_allocation() {
        let mut om = create_test_memory(CollectorKind::Lisp2);
        om.set_excessive_gc(true);
        assert_eq!(om.new_chunk(8), 0);
        om.enter_collector();
        om.leave_collector();
        assert_ne!(om.new_chunk(8), 0);
        assert_eq!(om.new_chunk(8), 0);
    }

    #[test]
    fn arrays_pick_header_by_count() {
        let mut om = create_test_memory(CollectorKind::Lisp2);
        let bytes = om.class_from_cno(cno::BYTE_ARRAY);
        let small = om.new_array(bytes, 10);
        let large = om.new_array(bytes, 300);
        assert_eq!(header::get_array_element_count(&om.mem, small), 10);
        assert_eq!(header::get_header_size(&om.mem, large), 8);
        assert_eq!(header::get_array_element_count(&om.mem, large), 300);
        assert_eq!(om.stats.small_arrays, 1);
        assert_eq!(om.stats.large_arrays, 1);
    }

    #[test]
    fn stack_chunks_link_per_collector() {
        let mut om = create_test_memory(CollectorKind::Lisp2);
        let a = om.new_stack_chunk(4);
        let b = om.new_stack_chunk(40);
        assert_eq!(om.mem.get_word(a, STACK_SIZE), REGULAR_CHUNK_SIZE);
        assert_eq!(om.mem.get_word(b, STACK_SIZE), 40);
        assert_eq!(om.root(Segment::Ram, root::STACK_CHUNK_LIST), b);
        assert_eq!(om.mem.get_word(b, STACK_LIST), a);
        assert_eq!(om.mem.get_word(a, STACK_LIST), 0);

        let mut om = create_test_memory(CollectorKind::Cheney);
        let c = om.new_stack_chunk(4);
        assert_eq!(om.mem.get_word(c, STACK_SELF), c);
        assert_eq!(om.root(Segment::Ram, root::STACK_CHUNK_LIST), 0);
    }

    #[test]
    fn segment_store_rules() {
        let mut om = create_test_memory(CollectorKind::Lisp2);
        let ram_obj = om.new_instance(om.class_from_cno(cno::OBJECT_ASSOCIATION));
        let eeprom_obj = om.segment(Segment::Eeprom).heap_start() + 4;
        let rom_obj = om.class_from_cno(cno::OBJECT);

        assert!(om.set_oop(ram_obj, 0, eeprom_obj));
        assert!(om.set_oop(eeprom_obj, 0, rom_obj));
        assert!(!om.set_oop(eeprom_obj, 0, ram_obj));
        assert!(!om.set_oop(rom_obj, 0, 0));
        assert!(om.set_root(Segment::Eeprom, root::FREE_LIST, ram_obj).is_err());
        assert!(om.set_root(Segment::Ram, root::FINALIZATION_QUEUE, ram_obj).is_ok());
    }

    #[test]
    fn write_barrier_records_every_ram_store() {
        let mut om = create_test_memory(CollectorKind::Lisp2);
        let start = om.memory_start();
        let end = om.memory_end();
        let bitmap = om.segment(Segment::Ram).end();
        let size = BitVector::bitmap_size_for(start, end);
        om.mem = {
            let mut bytes = om.mem.as_bytes().to_vec();
            bytes.resize((bitmap + size) as usize, 0);
            Memory::from_bytes(bytes, om.mem.endian())
        };
        om.bits.init(start, end, bitmap, size);
        om.enable_write_barrier();

        let assn = om.new_instance(om.class_from_cno(cno::OBJECT_ASSOCIATION));
        om.set_oop_ram(assn, ASSN_NEXT, 0);
        assert!(om.bits.test_oop_bit(&om.mem, assn + 4));
        assert!(!om.bits.test_oop_bit(&om.mem, assn));
    }
}
