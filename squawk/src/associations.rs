//! Object associations.
//!
//! An association carries the per-object state that does not fit in a
//! header: identity hash, monitor, finalization and migration flags. The
//! RAM root `ASSOCIATION_HASHTABLE` points at a 16-entry object array whose
//! slots head singly linked queues, hashed by the address of the
//! associated object.
//!
//! The table and the queue links are weak. They are written without the
//! write barrier and never traced as roots. Instead every RAM collection
//! calls [`process_queues`] once the strongly reachable graph is known,
//! which decides per association whether it survives.

use crate::class::cno;
use crate::error::VmResult;
use crate::fatal;
use crate::header;
use crate::heap::ObjectMemory;
use crate::layout::*;
use crate::memory::Memory;

/// Queue index of an object address.
#[inline(always)]
pub const fn queue_of(oop: u32) -> u32 {
    (oop >> 2) % ASSN_TABLE_SIZE
}

// ── Fields ────────────────────────────────────────────────────────────

#[inline(always)]
pub fn assn_object(mem: &Memory, assn: u32) -> u32 {
    mem.get_word(assn, ASSN_OBJECT)
}

#[inline(always)]
pub fn set_assn_object(mem: &mut Memory, assn: u32, obj: u32) {
    mem.set_word(assn, ASSN_OBJECT, obj);
}

#[inline(always)]
pub fn assn_next(mem: &Memory, assn: u32) -> u32 {
    mem.get_word(assn, ASSN_NEXT)
}

#[inline(always)]
pub fn set_assn_next(mem: &mut Memory, assn: u32, next: u32) {
    mem.set_word(assn, ASSN_NEXT, next);
}

#[inline(always)]
pub fn assn_monitor(mem: &Memory, assn: u32) -> u32 {
    mem.get_word(assn, ASSN_MONITOR)
}

#[inline(always)]
pub fn assn_hash_code(mem: &Memory, assn: u32) -> u32 {
    mem.get_word(assn, ASSN_HASH_CODE)
}

#[inline(always)]
pub fn assn_flags(mem: &Memory, assn: u32) -> u32 {
    mem.get_word(assn, ASSN_FLAGS)
}

#[inline(always)]
pub fn set_assn_flags(mem: &mut Memory, assn: u32, flags: u32) {
    mem.set_word(assn, ASSN_FLAGS, flags);
}

pub fn is_migratable(mem: &Memory, assn: u32) -> bool {
    assn_flags(mem, assn) & ASSN_FLAG_MIGRATABLE != 0
}

pub fn clear_migratable(mem: &mut Memory, assn: u32) {
    let flags = assn_flags(mem, assn) & !ASSN_FLAG_MIGRATABLE;
    set_assn_flags(mem, assn, flags);
}

fn has_finalizer(mem: &Memory, assn: u32) -> bool {
    assn_flags(mem, assn) & ASSN_FLAG_HAS_FINALIZER != 0
}

// ── Liveness ──────────────────────────────────────────────────────────

/// What a RAM collector tells association processing about the graph it
/// has traced so far.
pub trait Liveness {
    /// Whether `oop` survives the current collection.
    fn is_alive(&self, om: &ObjectMemory, oop: u32) -> bool;

    /// Make `oop` and everything it reaches survive. Returns the address
    /// the object has after the call (a copy for the copying collector).
    fn keep(&mut self, om: &mut ObjectMemory, oop: u32) -> u32;

    fn possibly_forwarded(&self, om: &ObjectMemory, oop: u32) -> u32 {
        header::get_possibly_forwarded(&om.mem, oop)
    }
}

// ── Table ─────────────────────────────────────────────────────────────

impl ObjectMemory {
    pub fn association_table(&self) -> u32 {
        self.root(Segment::Ram, root::ASSOCIATION_HASHTABLE)
    }

    /// Head of the queue `obj` hashes to. 0 when there is no table yet.
    pub fn association_queue(&self, obj: u32) -> u32 {
        let table = self.association_table();
        if table == 0 {
            return 0;
        }
        self.mem.get_word(table, queue_of(obj) as i32)
    }

    pub fn set_association_queue(&mut self, obj: u32, assn: u32) {
        let table = self.association_table();
        assert!(table != 0, "association table missing");
        self.mem.set_word(table, queue_of(obj) as i32, assn);
    }

    /// The association of `obj`, 0 if it has none.
    pub fn get_association(&self, obj: u32) -> u32 {
        let mut assn = self.association_queue(obj);
        while assn != 0 {
            if assn_object(&self.mem, assn) == obj {
                return assn;
            }
            assn = assn_next(&self.mem, assn);
        }
        0
    }

    /// The association of `obj`, allocated on first use. Returns 0 when
    /// RAM is exhausted.
    pub fn get_or_create_association(&mut self, obj: u32) -> u32 {
        assert!(obj != 0);
        let existing = self.get_association(obj);
        if existing != 0 {
            return existing;
        }
        if self.association_table() == 0 {
            let array = self.class_from_cno(cno::OBJECT_ARRAY);
            let table = self.new_array(array, ASSN_TABLE_SIZE);
            if table == 0 {
                return 0;
            }
            self.set_ram_root(root::ASSOCIATION_HASHTABLE, table);
        }
        let klass = self.class_from_cno(cno::OBJECT_ASSOCIATION);
        let assn = self.new_instance(klass);
        if assn == 0 {
            return 0;
        }
        let head = self.association_queue(obj);
        set_assn_object(&mut self.mem, assn, obj);
        set_assn_next(&mut self.mem, assn, head);
        self.set_association_queue(obj, assn);
        log::trace!(target: "squawk::gc", "new association 0x{assn:x} for 0x{obj:x}");
        assn
    }

    /// Calls `f` on every queued association. `f` must not relink queues.
    pub fn for_each_association(&self, mut f: impl FnMut(u32)) {
        let table = self.association_table();
        if table == 0 {
            return;
        }
        for queue in 0..ASSN_TABLE_SIZE as i32 {
            let mut assn = self.mem.get_word(table, queue);
            while assn != 0 {
                let next = assn_next(&self.mem, assn);
                f(assn);
                assn = next;
            }
        }
    }

    /// The first association still marked migratable, 0 if none.
    pub fn lookup_next_migratable(&self) -> u32 {
        let mut found = 0;
        self.for_each_association(|assn| {
            if found == 0 && is_migratable(&self.mem, assn) {
                found = assn;
            }
        });
        found
    }

    /// Rehash every queue by the current address of its object. Needed
    /// after objects have moved.
    pub fn rebuild_queues(&mut self) {
        let table = self.association_table();
        if table == 0 {
            return;
        }
        let mut all = Vec::new();
        self.for_each_association(|assn| all.push(assn));
        for queue in 0..ASSN_TABLE_SIZE as i32 {
            self.mem.set_word(table, queue, 0);
        }
        for assn in all {
            let obj = header::get_possibly_forwarded(&self.mem, assn_object(&self.mem, assn));
            let head = self.mem.get_word(table, queue_of(obj) as i32);
            set_assn_next(&mut self.mem, assn, head);
            self.mem.set_word(table, queue_of(obj) as i32, assn);
        }
    }

    pub fn finalization_queue(&self) -> u32 {
        self.root(Segment::Ram, root::FINALIZATION_QUEUE)
    }

    /// Pop the next association whose object is waiting for its finalizer.
    pub fn take_finalizer(&mut self) -> u32 {
        let assn = self.finalization_queue();
        if assn != 0 {
            let next = assn_next(&self.mem, assn);
            self.set_ram_root(root::FINALIZATION_QUEUE, next);
            set_assn_next(&mut self.mem, assn, 0);
        }
        assn
    }
}

// ── Collection support ────────────────────────────────────────────────

/// Decide the fate of every association after the strong graph has been
/// traced and rebuild the queues from the survivors.
///
/// An association survives while its monitor is in use, or while its
/// object is alive and the association still carries information (a hash
/// code, a finalizer or the migratable flag). An association whose object
/// died but which has a finalizer is kept, together with the object, on
/// the finalization queue. Everything else is dropped.
pub fn process_queues(om: &mut ObjectMemory, live: &mut impl Liveness) {
    let table = om.association_table();
    let mut queues = [0u32; ASSN_TABLE_SIZE as usize];
    let mut kept_count = 0u32;
    let mut finalized = 0u32;
    let mut dropped = 0u32;

    if table != 0 {
        let table_now = live.possibly_forwarded(om, table);
        for queue in 0..ASSN_TABLE_SIZE as i32 {
            let mut assn = om.mem.get_word(table_now, queue);
            om.mem.set_word(table_now, queue, 0);
            while assn != 0 {
                let current = live.possibly_forwarded(om, assn);
                let next = assn_next(&om.mem, current);
                let object = live.possibly_forwarded(om, assn_object(&om.mem, current));
                let monitor = live.possibly_forwarded(om, assn_monitor(&om.mem, current));
                let in_use = monitor != 0 && om.mem.get_word(monitor, MONITOR_IN_USE) != 0;
                let flags = assn_flags(&om.mem, current);
                set_assn_next(&mut om.mem, current, 0);

                let informative = assn_hash_code(&om.mem, current) != 0
                    || flags & (ASSN_FLAG_HAS_FINALIZER | ASSN_FLAG_MIGRATABLE) != 0;
                if in_use || (live.is_alive(om, object) && informative) {
                    let kept = live.keep(om, assn);
                    let key = if object == 0 { 0 } else { live.keep(om, object) };
                    let slot = &mut queues[queue_of(key) as usize];
                    set_assn_next(&mut om.mem, kept, *slot);
                    *slot = kept;
                    kept_count += 1;
                } else if flags & ASSN_FLAG_HAS_FINALIZER != 0 {
                    let kept = live.keep(om, assn);
                    let head = om.finalization_queue();
                    set_assn_next(&mut om.mem, kept, head);
                    om.set_ram_root(root::FINALIZATION_QUEUE, kept);
                    finalized += 1;
                } else {
                    log::trace!(target: "squawk::gc", "association 0x{assn:x} of 0x{object:x} lost");
                    dropped += 1;
                }
                assn = next;
            }
        }
    }

    if table != 0 {
        let table = live.keep(om, table);
        om.set_ram_root(root::ASSOCIATION_HASHTABLE, table);
        for (queue, head) in queues.iter().enumerate() {
            om.mem.set_word(table, queue as i32, *head);
        }
    }
    log::debug!(
        target: "squawk::gc",
        "associations: {kept_count} kept, {finalized} queued for finalization, {dropped} dropped"
    );
}

/// Check that every queued association and its object survived and that
/// each association sits in the queue its object hashes to.
pub fn check_queues(om: &ObjectMemory, live: &impl Liveness) -> VmResult<()> {
    let table = om.association_table();
    if table == 0 {
        return Ok(());
    }
    for queue in 0..ASSN_TABLE_SIZE {
        let mut assn = om.mem.get_word(table, queue as i32);
        while assn != 0 {
            if !live.is_alive(om, assn) {
                return Err(fatal!("association 0x{assn:x} in queue {queue} is dead"));
            }
            let object = assn_object(&om.mem, assn);
            if object != 0 && !live.is_alive(om, object) {
                return Err(fatal!("object 0x{object:x} of association 0x{assn:x} is dead"));
            }
            if queue_of(object) != queue {
                return Err(fatal!(
                    "association 0x{assn:x} hashed to {} but queued on {queue}",
                    queue_of(object)
                ));
            }
            assn = assn_next(&om.mem, assn);
        }
    }
    Ok(())
}

/// Number of associations waiting for their finalizer to run.
pub fn pending_finalizers(om: &ObjectMemory) -> u32 {
    let mut count = 0;
    let mut assn = om.finalization_queue();
    while assn != 0 {
        debug_assert!(has_finalizer(&om.mem, assn));
        count += 1;
        assn = assn_next(&om.mem, assn);
    }
    count
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::VmSettings;
    use crate::romizer::RomBuilder;

    fn create_test_memory() -> ObjectMemory {
        let mut om = RomBuilder::new().build_object_memory(0x1000, 0x4000, &VmSettings::default());
        let heap = om.segment(Segment::Ram).heap_start();
        let end = om.segment(Segment::Ram).end();
        om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_START, heap);
        om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_SIZE, end - heap);
        om.set_partition(heap, heap, end);
        om
    }

    /// Liveness by explicit set, keeping objects in place.
    #[derive(Default)]
    struct TestLiveness {
        live: HashSet<u32>,
    }

    impl Liveness for TestLiveness {
        fn is_alive(&self, _om: &ObjectMemory, oop: u32) -> bool {
            self.live.contains(&oop)
        }

        fn keep(&mut self, _om: &mut ObjectMemory, oop: u32) -> u32 {
            self.live.insert(oop);
            oop
        }
    }

    fn create_test_object(om: &mut ObjectMemory) -> u32 {
        let klass = om.class_from_cno(cno::OBJECT_ASSOCIATION);
        om.new_instance(klass)
    }

    #[test]
    fn associations_are_created_once_and_found() {
        let mut om = create_test_memory();
        let a = create_test_object(&mut om);
        let b = create_test_object(&mut om);
        assert_eq!(om.get_association(a), 0);

        let assn_a = om.get_or_create_association(a);
        let assn_b = om.get_or_create_association(b);
        assert!(om.association_table() != 0);
        assert_eq!(om.get_or_create_association(a), assn_a);
        assert_eq!(om.get_association(b), assn_b);
        assert_eq!(assn_object(&om.mem, assn_a), a);
    }

    #[test]
    fn processing_keeps_informative_associations_of_live_objects() {
        let mut om = create_test_memory();
        let live_obj = create_test_object(&mut om);
        let dead_obj = create_test_object(&mut om);
        let plain_obj = create_test_object(&mut om);

        let hashed = om.get_or_create_association(live_obj);
        om.mem.set_word(hashed, ASSN_HASH_CODE, 42);
        let dead = om.get_or_create_association(dead_obj);
        om.mem.set_word(dead, ASSN_HASH_CODE, 7);
        let plain = om.get_or_create_association(plain_obj);

        let mut live = TestLiveness::default();
        live.live.insert(live_obj);
        live.live.insert(plain_obj);
        process_queues(&mut om, &mut live);

        assert_eq!(om.get_association(live_obj), hashed);
        assert_eq!(om.get_association(dead_obj), 0);
        // nothing worth keeping
        assert_eq!(om.get_association(plain_obj), 0);
        assert!(!live.live.contains(&plain));
        assert!(live.live.contains(&om.association_table()));
        assert!(check_queues(&om, &live).is_ok());
    }

    #[test]
    fn dead_finalizable_objects_move_to_the_finalization_queue() {
        let mut om = create_test_memory();
        let obj = create_test_object(&mut om);
        let assn = om.get_or_create_association(obj);
        set_assn_flags(&mut om.mem, assn, ASSN_FLAG_HAS_FINALIZER);

        let mut live = TestLiveness::default();
        process_queues(&mut om, &mut live);

        assert_eq!(om.get_association(obj), 0);
        assert_eq!(pending_finalizers(&om), 1);
        assert!(live.live.contains(&assn));
        assert_eq!(om.take_finalizer(), assn);
        assert_eq!(om.take_finalizer(), 0);
    }

    #[test]
    fn monitors_in_use_keep_associations_of_dead_objects() {
        let mut om = create_test_memory();
        let obj = create_test_object(&mut om);
        let monitor_class = om.class_from_cno(cno::MONITOR);
        let monitor = om.new_instance(monitor_class);
        om.mem.set_word(monitor, MONITOR_IN_USE, 1);
        let assn = om.get_or_create_association(obj);
        om.mem.set_word(assn, ASSN_MONITOR, monitor);

        let mut live = TestLiveness::default();
        process_queues(&mut om, &mut live);
        assert_eq!(om.get_association(obj), assn);
        assert!(live.live.contains(&obj));
    }

    #[test]
    fn rebuild_rehashes_moved_objects() {
        let mut om = create_test_memory();
        let obj = create_test_object(&mut om);
        let assn = om.get_or_create_association(obj);
        // pretend the object moved by one word
        let moved = create_test_object(&mut om);
        set_assn_object(&mut om.mem, assn, moved);
        om.rebuild_queues();
        assert_eq!(om.get_association(moved), assn);
        assert_eq!(om.association_queue(moved), assn);
        if queue_of(obj) != queue_of(moved) {
            assert_eq!(om.association_queue(obj), 0);
        }
    }

    #[test]
    fn migratable_lookup_skips_cleared_flags() {
        let mut om = create_test_memory();
        let a = create_test_object(&mut om);
        let b = create_test_object(&mut om);
        let assn_a = om.get_or_create_association(a);
        let assn_b = om.get_or_create_association(b);
        assert_eq!(om.lookup_next_migratable(), 0);
        set_assn_flags(&mut om.mem, assn_a, ASSN_FLAG_MIGRATABLE);
        set_assn_flags(&mut om.mem, assn_b, ASSN_FLAG_MIGRATABLE);
        let first = om.lookup_next_migratable();
        assert!(first == assn_a || first == assn_b);
        clear_migratable(&mut om.mem, first);
        let second = om.lookup_next_migratable();
        assert!(second != 0 && second != first);
    }
}
