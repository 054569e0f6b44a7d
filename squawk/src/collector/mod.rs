//! Garbage collection.
//!
//! One RAM collector is active per VM, chosen by [`CollectorKind`] and held
//! behind [`RamCollector`]. The persistent collector manages EEPROM next to
//! it. [`Heap`] ties them to the object memory and implements the policy
//! the driver runs on every suspension: collect RAM, migrate to EEPROM if
//! that was not enough, collect again.
//!
//! All collectors walk objects through [`traverse_object`], which decides
//! the shape of an object once and hands every pointer slot to a
//! [`FieldAction`].

pub mod cheney;
pub mod lisp2;
pub mod persistent;

use crate::associations;
use crate::class::{self, cno};
use crate::config::{CollectorKind, TraceFlags, VmSettings};
use crate::error::VmResult;
use crate::frames;
use crate::header;
use crate::heap::ObjectMemory;
use crate::layout::*;

pub use cheney::CheneyCollector;
pub use lisp2::Lisp2Collector;
pub use persistent::PersistentCollector;

// ── Object shapes ─────────────────────────────────────────────────────

/// How the pointer slots of an object are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// No pointers: primitive arrays and strings.
    Primitive,
    /// Every element is a pointer.
    References { count: u32 },
    /// A `LOCAL_ARRAY`: frames described by method oop maps.
    StackChunk,
    /// A `GLOBAL_ARRAY`: class, next and the pointer statics.
    ClassState { count: u32 },
    /// Instance fields described by the class oop map.
    Instance { oop_map: u32, fields: u32 },
}

/// Shape of `oop` taken as an instance of `klass`. The class is passed in
/// because a collector may have the header encoded while it walks.
pub fn shape_of(om: &ObjectMemory, oop: u32, klass: u32) -> Shape {
    let mem = &om.mem;
    if !class::is_array_class(mem, klass) {
        return Shape::Instance {
            oop_map: header::get_possibly_forwarded(mem, class::oop_map(mem, klass)),
            fields: class::instance_fields_length(mem, klass),
        };
    }
    match class::get_type(mem, klass) {
        cno::LOCAL_ARRAY => Shape::StackChunk,
        cno::GLOBAL_ARRAY => {
            let state_class = class::class_state_class(mem, oop);
            let statics = if state_class == 0 {
                0
            } else {
                class::pointer_static_fields_length(mem, state_class)
            };
            Shape::ClassState { count: CLS_STATE_OFFSET_TO_FIELDS as u32 + statics }
        }
        _ if class::is_pointer_array(mem, klass) => Shape::References {
            count: header::get_array_element_count(mem, oop),
        },
        _ => Shape::Primitive,
    }
}

// ── Traversal ─────────────────────────────────────────────────────────

/// Work done on each pointer slot found by a traversal.
pub trait FieldAction {
    /// Visit the word at `base + offset * 4`.
    fn field(&mut self, om: &mut ObjectMemory, base: u32, offset: i32);

    /// Visit a stack chunk. The default walks its frames in place and then
    /// the three link words.
    fn stack_chunk(&mut self, om: &mut ObjectMemory, chunk: u32) {
        walk_stack_chunk(om, chunk, self);
    }
}

pub fn traverse_object<A: FieldAction + ?Sized>(
    om: &mut ObjectMemory,
    oop: u32,
    klass: u32,
    action: &mut A,
) {
    match shape_of(om, oop, klass) {
        Shape::Primitive => {}
        Shape::References { count } | Shape::ClassState { count } => {
            for i in 0..count {
                action.field(om, oop, i as i32);
            }
        }
        Shape::StackChunk => action.stack_chunk(om, oop),
        Shape::Instance { oop_map, fields } => traverse_oop_map(om, oop, oop_map, fields, action),
    }
}

/// Visit word `i` of `base` for every set bit `i` of the first `count` bits
/// of the byte map at `map`.
pub fn traverse_oop_map<A: FieldAction + ?Sized>(
    om: &mut ObjectMemory,
    base: u32,
    map: u32,
    count: u32,
    action: &mut A,
) {
    for i in 0..count {
        let byte = om.mem.get_unsigned_byte(map, (i / 8) as i32);
        if byte & (1 << (i % 8)) != 0 {
            action.field(om, base, i as i32);
        }
    }
}

/// Frames and links of a chunk that has not moved.
pub fn walk_stack_chunk<A: FieldAction + ?Sized>(om: &mut ObjectMemory, chunk: u32, action: &mut A) {
    traverse_frames(om, chunk, chunk, chunk, action);
    action.field(om, chunk, STACK_LIST);
    action.field(om, chunk, STACK_NEXT);
    action.field(om, chunk, STACK_PREV);
}

/// Walk the active frames of the chunk whose words are at `walk`.
///
/// The frame links stored in the chunk are addresses relative to
/// `stored_base`. They are read relative to `walk` and rewritten relative to
/// `new_base`, so a chunk can be walked after a copy (`walk == new_base`)
/// or before a move (`walk == stored_base`).
///
/// The ip of each frame is kept at the same distance from its mp when the
/// action moves the method. Method headers are read from the old mp.
pub fn traverse_frames<A: FieldAction + ?Sized>(
    om: &mut ObjectMemory,
    walk: u32,
    stored_base: u32,
    new_base: u32,
    action: &mut A,
) {
    let stored_last = frames::chunk_last_lp(&om.mem, walk);
    if stored_last == 0 {
        return;
    }
    let to_walk = walk.wrapping_sub(stored_base);
    let to_new = new_base.wrapping_sub(stored_base);
    let rebased = |addr: u32| if addr == 0 { 0 } else { addr.wrapping_add(to_new) };

    let last_lp = stored_last.wrapping_add(to_walk);
    if to_new != 0 {
        frames::set_chunk_last_lp(&mut om.mem, walk, rebased(stored_last));
    }

    let mut lp = frames::first_lp(walk);
    while lp <= last_lp {
        action.field(om, lp, FRAME_CURRENT_CP);

        let mp = frames::frame_mp(&om.mem, lp);
        let relative_ip = frames::frame_ip(&om.mem, lp).wrapping_sub(mp);
        action.field(om, lp, FRAME_CURRENT_MP);
        let moved_mp = frames::frame_mp(&om.mem, lp);
        frames::set_frame_ip(&mut om.mem, lp, moved_mp.wrapping_add(relative_ip));

        if to_new != 0 {
            let prev = frames::frame_previous_lp(&om.mem, lp);
            frames::set_frame_previous_lp(&mut om.mem, lp, rebased(prev));
        }

        let map = frames::method_oop_map(mp);
        if relative_ip == frames::method_header_size(&om.mem, mp) {
            // Suspended before its first instruction: only the parameters
            // are initialised.
            let nparms = frames::method_nparms(&om.mem, mp);
            traverse_oop_map(om, lp, map, nparms, action);
            debug_assert_eq!(lp, last_lp, "frame before entry below the top of its chunk");
            break;
        }
        let nlocals = frames::method_nlocals(&om.mem, mp);
        traverse_oop_map(om, lp, map, nlocals, action);
        lp = frames::next_frame_lp(&om.mem, lp);
    }
}

// ── RAM collectors ────────────────────────────────────────────────────

/// The interface the driver and the natives use to reach the active RAM
/// collector.
pub trait RamCollector {
    fn kind(&self) -> CollectorKind;

    /// Lay out RAM object memory. A fresh image also gets its partition
    /// reset, a loaded one keeps the partition it was saved with.
    fn initialize(&mut self, om: &mut ObjectMemory, fresh: bool) -> VmResult<()>;

    /// Collect RAM. Returns whether the failed allocation now fits.
    fn collect(&mut self, om: &mut ObjectMemory, force_full: bool) -> VmResult<bool>;

    fn free_memory(&self, om: &ObjectMemory) -> u32;

    fn total_memory(&self, om: &ObjectMemory) -> u32;

    fn used_memory(&self, om: &ObjectMemory) -> u32 {
        self.total_memory(om) - self.free_memory(om)
    }

    /// `[start, end)` of the allocated RAM objects.
    fn ram_object_range(&self, om: &ObjectMemory) -> (u32, u32);

    fn set_minimum_heap_mode(&mut self, om: &mut ObjectMemory, on: bool) -> VmResult<()>;

    fn heap_high_water_mark(&self, om: &ObjectMemory) -> u32;

    fn collection_count(&self) -> u32;

    fn log_stats(&self);
}

/// Build the RAM collector selected by the settings.
pub fn create_collector(settings: &VmSettings) -> Box<dyn RamCollector> {
    match settings.collector {
        CollectorKind::Cheney => Box::new(CheneyCollector::new(settings)),
        CollectorKind::Lisp2 => Box::new(Lisp2Collector::new(settings)),
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

/// Object memory together with its collectors.
pub struct Heap {
    pub om: ObjectMemory,
    ram: Box<dyn RamCollector>,
    pub persistent: PersistentCollector,
    trace: TraceFlags,
    migrations: u32,
}

impl Heap {
    /// Attach collectors to `om`. A fresh image has its RAM partition and
    /// the EEPROM free list initialised.
    pub fn new(mut om: ObjectMemory, settings: &VmSettings, fresh: bool) -> VmResult<Self> {
        let mut ram = create_collector(settings);
        ram.initialize(&mut om, fresh)?;
        let mut persistent = PersistentCollector::new();
        if fresh {
            persistent.initialize(&mut om)?;
        } else {
            // Write barrier bits are not saved in an image.
            persistent.request_full_gc();
        }
        log::debug!(
            target: "squawk::gc",
            "{:?} heap: {} bytes RAM, {} bytes EEPROM free",
            ram.kind(),
            ram.total_memory(&om),
            persistent.free_persistent_memory(&om)
        );
        Ok(Self {
            om,
            ram,
            persistent,
            trace: settings.trace,
            migrations: 0,
        })
    }

    pub fn collector_kind(&self) -> CollectorKind {
        self.ram.kind()
    }

    /// Reclaim RAM for the allocation that failed.
    ///
    /// When a RAM collection does not free enough, objects whose
    /// associations are flagged migratable are moved to EEPROM until the
    /// failed size is covered, and RAM is collected again. The failed size
    /// is reset either way. Returns whether the allocation will now succeed.
    pub fn collect_garbage(&mut self) -> VmResult<bool> {
        let failed = self.om.failed_allocation_size();
        let force_full = self.persistent.take_full_gc_request();
        let mut ok = self.ram.collect(&mut self.om, force_full)?;

        if !ok {
            let migrated = self.migrate(failed)?;
            if migrated > 0 {
                ok = self.ram.collect(&mut self.om, true)?;
                self.persistent.take_full_gc_request();
            }
        }

        self.om.set_failed_allocation_size(0);
        if self.trace.contains(TraceFlags::GC_SUMMARY) {
            log::info!(
                target: "squawk::gc",
                "gc #{}: {} free of {} bytes, {}",
                self.ram.collection_count(),
                self.ram.free_memory(&self.om),
                self.ram.total_memory(&self.om),
                if ok { "ok" } else { "failed" }
            );
        }
        Ok(ok)
    }

    /// Move migratable objects to EEPROM until `needed` bytes were copied
    /// or no candidate remains. Returns the bytes copied.
    fn migrate(&mut self, needed: u32) -> VmResult<u32> {
        let mut migrated = 0;
        while migrated < needed {
            let assn = self.om.lookup_next_migratable();
            if assn == 0 {
                break;
            }
            let object = associations::assn_object(&self.om.mem, assn);
            if self.persistent.make_persistent(&mut self.om, object, true)? == 0 {
                log::debug!(target: "squawk::migration", "EEPROM full, migration stopped");
                break;
            }
            let copied = self.persistent.total_bytes_copied();
            if copied == 0 {
                associations::clear_migratable(&mut self.om.mem, assn);
            }
            migrated += copied;
            self.migrations += 1;
            log::debug!(
                target: "squawk::migration",
                "migrated 0x{object:x} ({copied} bytes, {migrated} of {needed})"
            );
        }
        Ok(migrated)
    }

    pub fn make_persistent(&mut self, root: u32, migrate: bool) -> VmResult<u32> {
        self.persistent.make_persistent(&mut self.om, root, migrate)
    }

    /// Mark-sweep EEPROM using a guest-supplied bitmap and mark stack.
    pub fn gc_persistent_memory(&mut self, bit_vector: u32, mark_stack: u32) -> VmResult<()> {
        let range = self.ram.ram_object_range(&self.om);
        self.persistent
            .gc_persistent_memory(&mut self.om, range, bit_vector, mark_stack)
    }

    pub fn new_persistent_byte_array(&mut self, count: u32) -> u32 {
        self.persistent.new_persistent_byte_array(&mut self.om, count)
    }

    pub fn free_memory(&self, ram: bool) -> u32 {
        if ram {
            self.ram.free_memory(&self.om)
        } else {
            self.persistent.free_persistent_memory(&self.om)
        }
    }

    pub fn total_memory(&self, ram: bool) -> u32 {
        if ram {
            self.ram.total_memory(&self.om)
        } else {
            self.persistent.total_persistent_memory(&self.om)
        }
    }

    pub fn used_memory(&self) -> u32 {
        self.ram.used_memory(&self.om)
    }

    pub fn set_minimum_heap_mode(&mut self, on: bool) -> VmResult<()> {
        self.ram.set_minimum_heap_mode(&mut self.om, on)
    }

    pub fn heap_high_water_mark(&self) -> u32 {
        self.ram.heap_high_water_mark(&self.om)
    }

    pub fn collection_count(&self) -> u32 {
        self.ram.collection_count()
    }

    pub fn migrations(&self) -> u32 {
        self.migrations
    }

    pub fn log_stats(&self) {
        self.ram.log_stats();
        self.persistent.log_stats();
        let stats = &self.om.stats;
        log::info!(
            target: "squawk::alloc",
            "allocations: {} ({} small arrays, {} large arrays, {} stack chunks)",
            stats.allocations,
            stats.small_arrays,
            stats.large_arrays,
            stats.stack_chunks
        );
        log::info!(
            target: "squawk::gc",
            "mark stack high water: {} words, {} finalizers pending",
            self.om.mark_stack.high_water(),
            associations::pending_finalizers(&self.om)
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::w2b;
    use crate::romizer::RomBuilder;

    /// Records every slot it is handed.
    #[derive(Default)]
    struct Recorder {
        slots: Vec<(u32, i32)>,
    }

    impl FieldAction for Recorder {
        fn field(&mut self, _om: &mut ObjectMemory, base: u32, offset: i32) {
            self.slots.push((base, offset));
        }
    }

    /// Adds a fixed delta to every non-null slot.
    struct Shift(u32);

    impl FieldAction for Shift {
        fn field(&mut self, om: &mut ObjectMemory, base: u32, offset: i32) {
            let value = om.mem.get_word(base, offset);
            if value != 0 {
                om.mem.set_word(base, offset, value + self.0);
            }
        }
    }

    pub(crate) fn create_test_heap_memory(kind: CollectorKind) -> ObjectMemory {
        let settings = VmSettings {
            collector: kind,
            ..Default::default()
        };
        let mut om = RomBuilder::new().build_object_memory(0x1000, 0x8000, &settings);
        let heap = om.segment(Segment::Ram).heap_start();
        let end = om.segment(Segment::Ram).end();
        om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_START, heap);
        om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_SIZE, end - heap);
        om.set_partition(heap, heap, end);
        om
    }

    /// Method with `nparms` parameters and `nlocals` locals whose oop map
    /// is `map`, written into a byte array so it lives in RAM.
    pub(crate) fn create_test_method(om: &mut ObjectMemory, nparms: u8, nlocals: u8, map: u8) -> u32 {
        let bytes = om.class_from_cno(cno::BYTE_ARRAY);
        let mp = om.new_array(bytes, 16);
        let header = frames::method_handlers_offset(nlocals as u32) as u8;
        om.mem.set_byte(mp, MTH_HEADER_SIZE, header);
        om.mem.set_byte(mp, MTH_NUMBER_OF_PARMS, nparms);
        om.mem.set_byte(mp, MTH_NUMBER_OF_LOCALS, nlocals);
        om.mem.set_byte(mp, MTH_OOP_MAP, map);
        mp
    }

    fn pattern_word(seed: u32, i: u32) -> u32 {
        seed.wrapping_mul(0x9e37_79b9).wrapping_add(i).rotate_left(i % 32)
    }

    /// An int or byte array of `count` elements filled from `seed`.
    pub(crate) fn create_test_pattern(om: &mut ObjectMemory, class_number: u32, count: u32, seed: u32) -> u32 {
        let klass = om.class_from_cno(class_number);
        let oop = om.new_array(klass, count);
        assert_ne!(oop, 0, "no room for a {count} element pattern");
        for i in 0..count {
            match class_number {
                cno::BYTE_ARRAY => om.mem.set_byte(oop, i as i32, pattern_word(seed, i) as u8),
                _ => om.mem.set_word(oop, i as i32, pattern_word(seed, i)),
            }
        }
        oop
    }

    pub(crate) fn assert_test_pattern(om: &ObjectMemory, oop: u32, class_number: u32, count: u32, seed: u32) {
        assert_eq!(class::get_type(&om.mem, header::get_class(&om.mem, oop)), class_number);
        assert_eq!(header::get_array_element_count(&om.mem, oop), count);
        for i in 0..count {
            let found = match class_number {
                cno::BYTE_ARRAY => om.mem.get_unsigned_byte(oop, i as i32) as u32,
                _ => om.mem.get_word(oop, i as i32),
            };
            let expected = match class_number {
                cno::BYTE_ARRAY => pattern_word(seed, i) as u8 as u32,
                _ => pattern_word(seed, i),
            };
            assert_eq!(found, expected, "element {i} of 0x{oop:x}");
        }
    }

    #[test]
    fn shapes_follow_class_kind() {
        let mut om = create_test_heap_memory(CollectorKind::Lisp2);
        let objects = om.new_array(om.class_from_cno(cno::OBJECT_ARRAY), 3);
        let ints = om.new_array(om.class_from_cno(cno::INT_ARRAY), 3);
        let chunk = om.new_stack_chunk(8);
        let assn = om.new_instance(om.class_from_cno(cno::OBJECT_ASSOCIATION));
        let state = om.new_class_state(om.class_from_cno(cno::OBJECT));

        let shape = |om: &ObjectMemory, oop| shape_of(om, oop, header::get_class(&om.mem, oop));
        assert_eq!(shape(&om, objects), Shape::References { count: 3 });
        assert_eq!(shape(&om, ints), Shape::Primitive);
        assert_eq!(shape(&om, chunk), Shape::StackChunk);
        assert!(matches!(shape(&om, assn), Shape::Instance { fields: ASSN_FIELD_COUNT, .. }));
        assert_eq!(shape(&om, state), Shape::ClassState { count: 2 });
    }

    #[test]
    fn instances_visit_only_mapped_fields() {
        let mut om = create_test_heap_memory(CollectorKind::Lisp2);
        let klass = om.class_from_cno(cno::OBJECT_ASSOCIATION);
        let assn = om.new_instance(klass);
        let mut recorder = Recorder::default();
        traverse_object(&mut om, assn, klass, &mut recorder);
        assert_eq!(
            recorder.slots,
            vec![(assn, ASSN_OBJECT), (assn, ASSN_NEXT), (assn, ASSN_MONITOR)]
        );
    }

    #[test]
    fn frame_walk_uses_locals_below_top_and_parms_at_entry() {
        let mut om = create_test_heap_memory(CollectorKind::Lisp2);
        let caller = create_test_method(&mut om, 1, 3, 0b101);
        let callee = create_test_method(&mut om, 2, 4, 0b0110);
        let chunk = om.new_stack_chunk(40);

        let lp0 = frames::first_lp(chunk);
        frames::set_frame_mp(&mut om.mem, lp0, caller);
        frames::set_frame_ip(&mut om.mem, lp0, caller + 20);
        frames::set_frame_stack_offset(&mut om.mem, lp0, frames::extended_stack_offset(3));
        let lp1 = frames::next_frame_lp(&om.mem, lp0);
        frames::set_frame_mp(&mut om.mem, lp1, callee);
        let entry = callee + frames::method_header_size(&om.mem, callee);
        frames::set_frame_ip(&mut om.mem, lp1, entry);
        frames::set_frame_previous_lp(&mut om.mem, lp1, lp0);
        frames::set_chunk_last_lp(&mut om.mem, chunk, lp1);

        let mut recorder = Recorder::default();
        traverse_frames(&mut om, chunk, chunk, chunk, &mut recorder);
        assert_eq!(
            recorder.slots,
            vec![
                (lp0, FRAME_CURRENT_CP),
                (lp0, FRAME_CURRENT_MP),
                (lp0, 0),
                (lp0, 2),
                (lp1, FRAME_CURRENT_CP),
                (lp1, FRAME_CURRENT_MP),
                (lp1, 1),
            ]
        );
    }

    #[test]
    fn frame_walk_rebases_links_and_keeps_relative_ip() {
        let mut om = create_test_heap_memory(CollectorKind::Lisp2);
        let method = create_test_method(&mut om, 0, 2, 0);
        let chunk = om.new_stack_chunk(40);
        let lp0 = frames::first_lp(chunk);
        frames::set_frame_mp(&mut om.mem, lp0, method);
        frames::set_frame_ip(&mut om.mem, lp0, method + 12);
        frames::set_frame_stack_offset(&mut om.mem, lp0, frames::extended_stack_offset(2));
        let lp1 = frames::next_frame_lp(&om.mem, lp0);
        frames::set_frame_mp(&mut om.mem, lp1, method);
        frames::set_frame_ip(&mut om.mem, lp1, method + 9);
        frames::set_frame_previous_lp(&mut om.mem, lp1, lp0);
        frames::set_chunk_last_lp(&mut om.mem, chunk, lp1);

        let moved_to = chunk + 0x400;
        let shift = w2b(64) as u32;
        traverse_frames(&mut om, chunk, chunk, moved_to, &mut Shift(shift));

        assert_eq!(frames::chunk_last_lp(&om.mem, chunk), lp1 + 0x400);
        assert_eq!(frames::frame_previous_lp(&om.mem, lp1), lp0 + 0x400);
        assert_eq!(frames::frame_previous_lp(&om.mem, lp0), 0);
        assert_eq!(frames::frame_mp(&om.mem, lp1), method + shift);
        assert_eq!(frames::frame_ip(&om.mem, lp1), method + shift + 9);
        assert_eq!(frames::frame_ip(&om.mem, lp0), method + shift + 12);
    }

    #[test]
    fn dead_chunks_have_no_frames() {
        let mut om = create_test_heap_memory(CollectorKind::Lisp2);
        let chunk = om.new_stack_chunk(8);
        let mut recorder = Recorder::default();
        walk_stack_chunk(&mut om, chunk, &mut recorder);
        assert_eq!(
            recorder.slots,
            vec![(chunk, STACK_LIST), (chunk, STACK_NEXT), (chunk, STACK_PREV)]
        );
    }
}
