//! Class metadata accessors, the well-known class numbers, class number and
//! relative class number resolution, and class state lookup.

use crate::heap::ObjectMemory;
use crate::header;
use crate::layout::*;
use crate::memory::Memory;

/// Class numbers of the classes the VM itself knows about. All of them live
/// in suite 0, whose index 0 is unused.
pub mod cno {
    pub const BOOLEAN: u32 = 1;
    pub const BYTE: u32 = 2;
    pub const CHAR: u32 = 3;
    pub const SHORT: u32 = 4;
    pub const INT: u32 = 5;
    pub const LONG: u32 = 6;
    pub const FLOAT: u32 = 7;
    pub const DOUBLE: u32 = 8;
    pub const LAST_PRIMITIVE: u32 = DOUBLE;

    pub const OBJECT: u32 = 9;
    pub const CLASS: u32 = 10;
    /// Sixteen bit string, element type `CHAR`.
    pub const STRING: u32 = 11;
    /// Eight bit string, element type `BYTE`.
    pub const STRING_OF_BYTES: u32 = 12;

    pub const BOOLEAN_ARRAY: u32 = 13;
    pub const BYTE_ARRAY: u32 = 14;
    pub const CHAR_ARRAY: u32 = 15;
    pub const SHORT_ARRAY: u32 = 16;
    pub const INT_ARRAY: u32 = 17;
    pub const LONG_ARRAY: u32 = 18;
    pub const FLOAT_ARRAY: u32 = 19;
    pub const DOUBLE_ARRAY: u32 = 20;
    pub const OBJECT_ARRAY: u32 = 21;
    pub const STRING_ARRAY: u32 = 22;
    /// Stack chunks.
    pub const LOCAL_ARRAY: u32 = 23;
    /// Class states.
    pub const GLOBAL_ARRAY: u32 = 24;

    pub const VM_EXTENSION: u32 = 25;
    pub const OBJECT_ASSOCIATION: u32 = 26;
    pub const SUITE: u32 = 27;
    pub const THREAD: u32 = 28;
    pub const MONITOR: u32 = 29;
    pub const THROWABLE: u32 = 30;
    pub const OUT_OF_MEMORY_ERROR: u32 = 31;
    pub const NULL_POINTER_EXCEPTION: u32 = 32;
    pub const ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION: u32 = 33;
    pub const ARITHMETIC_EXCEPTION: u32 = 34;
    pub const ARRAY_STORE_EXCEPTION: u32 = 35;
    pub const CLASS_CAST_EXCEPTION: u32 = 36;

    /// One past the last well-known class number.
    pub const FIRST_USER: u32 = 37;
}

// ── Field accessors ───────────────────────────────────────────────────

#[inline(always)]
pub fn get_type(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_TYPE)
}

#[inline(always)]
pub fn access(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_ACCESS)
}

#[inline(always)]
pub fn super_class(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_SUPER_CLASS)
}

#[inline(always)]
pub fn element_type(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_ELEMENT_TYPE)
}

#[inline(always)]
pub fn instance_fields_length(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_INSTANCE_FIELDS_LENGTH)
}

#[inline(always)]
pub fn static_fields_length(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_STATIC_FIELDS_LENGTH)
}

#[inline(always)]
pub fn pointer_static_fields_length(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_POINTER_STATIC_FIELDS_LENGTH)
}

#[inline(always)]
pub fn first_virtual_method(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_FIRST_VIRTUAL_METHOD)
}

#[inline(always)]
pub fn virtual_methods(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_VIRTUAL_METHODS)
}

#[inline(always)]
pub fn static_methods(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_STATIC_METHODS)
}

pub fn interface_types(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_INTERFACE_TYPES)
}

pub fn interface_slot_tables(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_INTERFACE_SLOT_TABLES)
}

pub fn oop_map(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_OOP_MAP)
}

#[inline(always)]
pub fn object_references(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_OBJECT_REFERENCES)
}

#[inline(always)]
pub fn class_references(mem: &Memory, klass: u32) -> u32 {
    mem.get_word(klass, CLS_CLASS_REFERENCES)
}

pub fn has_finalizer(mem: &Memory, klass: u32) -> bool {
    access(mem, klass) & ACC_HASFINALIZER != 0
}

// ── Shapes ────────────────────────────────────────────────────────────

#[inline(always)]
pub fn is_array_class(mem: &Memory, klass: u32) -> bool {
    element_type(mem, klass) != 0
}

/// Bytes per element for arrays whose element class number is `element`.
pub const fn element_length(element: u32) -> u32 {
    match element {
        cno::LONG | cno::DOUBLE => 8,
        cno::CHAR | cno::SHORT => 2,
        cno::BYTE | cno::BOOLEAN => 1,
        _ => 4,
    }
}

pub fn array_element_length(mem: &Memory, klass: u32) -> u32 {
    element_length(element_type(mem, klass))
}

/// Arrays whose every element is an object pointer. Stack chunks and class
/// states have word elements but need their own traversal.
pub fn is_pointer_array(mem: &Memory, klass: u32) -> bool {
    let ty = get_type(mem, klass);
    element_type(mem, klass) > cno::LAST_PRIMITIVE
        && ty != cno::LOCAL_ARRAY
        && ty != cno::GLOBAL_ARRAY
}

/// Whether word `index` of an instance of `klass` holds a pointer.
pub fn is_pointer_field(mem: &Memory, klass: u32, index: u32) -> bool {
    let map = oop_map(mem, klass);
    if map == 0 {
        return false;
    }
    let byte = mem.get_unsigned_byte(map, (index / 8) as i32);
    byte & (1 << (index % 8)) != 0
}

// ── Class state ───────────────────────────────────────────────────────

#[inline(always)]
pub fn class_state_class(mem: &Memory, cs: u32) -> u32 {
    mem.get_word(cs, CLS_STATE_CLASS)
}

#[inline(always)]
pub fn class_state_next(mem: &Memory, cs: u32) -> u32 {
    mem.get_word(cs, CLS_STATE_NEXT)
}

impl ObjectMemory {
    /// The suite table: the EEPROM one once suites have been installed
    /// there, otherwise the one in ROM.
    pub fn suite_table(&self) -> u32 {
        let eeprom = self.root(Segment::Eeprom, root::SUITE_TABLE);
        if eeprom != 0 {
            eeprom
        } else {
            self.root(Segment::Rom, root::SUITE_TABLE)
        }
    }

    fn suite_classes(&self, suite: u32) -> u32 {
        self.mem.get_word(suite, SUITE_CLASSES)
    }

    pub fn class_from_cno(&self, number: u32) -> u32 {
        assert!(number != 0, "class number 0");
        let table = self.suite_table();
        assert!(table != 0, "no suite table");
        let suite = self.mem.get_word(table, (number >> 8) as i32);
        assert!(suite != 0, "no suite for class number {number}");
        let klass = self.mem.get_word(self.suite_classes(suite), (number & 0xFF) as i32);
        assert!(klass != 0, "no class for class number {number}");
        debug_assert_eq!(get_type(&self.mem, klass), number);
        klass
    }

    /// Number of classes across all suites.
    pub fn maximum_rcn(&self) -> u32 {
        let table = self.suite_table();
        let count = header::get_array_element_count(&self.mem, table);
        (0..count)
            .map(|i| self.mem.get_word(table, i as i32))
            .filter(|suite| *suite != 0)
            .map(|suite| header::get_array_element_count(&self.mem, self.suite_classes(suite)))
            .sum()
    }

    /// Dense class index used by the mark-compact collector to encode a
    /// class in a forwarding word. Never 0.
    pub fn rcn_from_class(&self, klass: u32) -> u32 {
        let number = get_type(&self.mem, klass);
        assert!(number != 0);
        let table = self.suite_table();
        let mut rcn = 1 + (number & 0xFF);
        for i in 0..(number >> 8) {
            let suite = self.mem.get_word(table, i as i32);
            if suite != 0 {
                rcn += header::get_array_element_count(&self.mem, self.suite_classes(suite));
            }
        }
        rcn
    }

    pub fn class_from_rcn(&self, rcn: u32) -> u32 {
        assert!(rcn != 0, "relative class number 0");
        let table = self.suite_table();
        let count = header::get_array_element_count(&self.mem, table);
        let mut index = rcn - 1;
        for i in 0..count {
            let suite = self.mem.get_word(table, i as i32);
            if suite == 0 {
                continue;
            }
            let classes = self.suite_classes(suite);
            let length = header::get_array_element_count(&self.mem, classes);
            if index < length {
                return self.mem.get_word(classes, index as i32);
            }
            index -= length;
        }
        panic!("relative class number {rcn} out of range");
    }

    /// Whether `obj` is an instance of the class numbered `target` or of
    /// one of its subclasses. Interfaces and array covariance are left to
    /// the guest's slow path.
    pub fn is_simply_assignable_to_cno(&self, obj: u32, target: u32) -> bool {
        let mut klass = header::get_class(&self.mem, obj);
        while klass != 0 {
            if get_type(&self.mem, klass) == target {
                return true;
            }
            klass = super_class(&self.mem, klass);
        }
        false
    }

    pub fn is_simply_assignable(&self, obj: u32, klass: u32) -> bool {
        self.is_simply_assignable_to_cno(obj, get_type(&self.mem, klass))
    }

    pub fn class_state_table(&self) -> u32 {
        self.root(Segment::Ram, root::CLASS_STATE_TABLE)
    }

    /// Find the class state of `klass`, creating it when the class needs no
    /// initializer. Returns 0 if the class must be initialized first or the
    /// state could not be allocated.
    ///
    /// Each bucket is kept in most-recently-used order.
    pub fn find_class_state(&mut self, klass: u32) -> u32 {
        let table = self.class_state_table();
        assert!(table != 0, "class state table missing");
        let hash = (get_type(&self.mem, klass) & (CLS_STATE_TABLE_SIZE - 1)) as i32;
        let first = self.mem.get_word(table, hash);
        if first != 0 && class_state_class(&self.mem, first) == klass {
            return first;
        }

        let mut prev = first;
        let mut cs = if first == 0 { 0 } else { class_state_next(&self.mem, first) };
        while cs != 0 {
            if class_state_class(&self.mem, cs) == klass {
                let next = class_state_next(&self.mem, cs);
                self.set_oop_ram(prev, CLS_STATE_NEXT, next);
                self.set_oop_ram(cs, CLS_STATE_NEXT, first);
                self.set_oop_ram(table, hash, cs);
                return cs;
            }
            prev = cs;
            cs = class_state_next(&self.mem, cs);
        }

        if access(&self.mem, klass) & ACC_MUSTCLINIT != 0 {
            return 0;
        }
        let cs = self.new_class_state(klass);
        if cs != 0 {
            self.add_to_class_state(klass, cs);
        }
        cs
    }

    /// Install `cs` as the class state of `klass` at the head of its bucket.
    pub fn add_to_class_state(&mut self, klass: u32, cs: u32) {
        let table = self.class_state_table();
        let hash = (get_type(&self.mem, klass) & (CLS_STATE_TABLE_SIZE - 1)) as i32;
        let first = self.mem.get_word(table, hash);
        self.set_oop_ram(cs, CLS_STATE_CLASS, klass);
        self.set_oop_ram(cs, CLS_STATE_NEXT, first);
        self.set_oop_ram(table, hash, cs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmSettings;
    use crate::romizer::RomBuilder;

    fn create_test_memory(builder: RomBuilder) -> ObjectMemory {
        let mut om = builder.build_object_memory(0x1000, 0x8000, &VmSettings::default());
        let heap = om.segment(Segment::Ram).heap_start();
        let end = om.segment(Segment::Ram).end();
        om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_START, heap);
        om.set_gci(Segment::Ram, GCI_OBJECT_MEMORY_SIZE, end - heap);
        om.set_partition(heap, heap, end);
        let table = om.new_array(om.class_from_cno(cno::OBJECT_ARRAY), CLS_STATE_TABLE_SIZE);
        om.set_ram_root(root::CLASS_STATE_TABLE, table);
        om
    }

    #[test]
    fn element_lengths() {
        assert_eq!(element_length(cno::LONG), 8);
        assert_eq!(element_length(cno::CHAR), 2);
        assert_eq!(element_length(cno::BOOLEAN), 1);
        assert_eq!(element_length(cno::OBJECT), 4);
        assert_eq!(element_length(cno::INT), 4);
    }

    #[test]
    fn well_known_classes_resolve_and_have_shapes() {
        let om = create_test_memory(RomBuilder::new());
        let mem = &om.mem;
        let object_array = om.class_from_cno(cno::OBJECT_ARRAY);
        assert_eq!(get_type(mem, object_array), cno::OBJECT_ARRAY);
        assert!(is_pointer_array(mem, object_array));
        assert!(!is_pointer_array(mem, om.class_from_cno(cno::LOCAL_ARRAY)));
        assert!(!is_pointer_array(mem, om.class_from_cno(cno::GLOBAL_ARRAY)));
        assert!(!is_pointer_array(mem, om.class_from_cno(cno::INT_ARRAY)));
        assert!(is_array_class(mem, om.class_from_cno(cno::STRING)));
        assert!(!is_array_class(mem, om.class_from_cno(cno::OBJECT)));

        let assn = om.class_from_cno(cno::OBJECT_ASSOCIATION);
        assert!(is_pointer_field(mem, assn, ASSN_OBJECT as u32));
        assert!(is_pointer_field(mem, assn, ASSN_MONITOR as u32));
        assert!(!is_pointer_field(mem, assn, ASSN_HASH_CODE as u32));
    }

    #[test]
    fn rcn_round_trips_across_suites() {
        let mut builder = RomBuilder::new();
        let user = builder.add_suite();
        let a = builder.add_class(user, "A", cno::OBJECT, 1, 0b1);
        let b = builder.add_class(user, "B", a, 2, 0);
        let om = create_test_memory(builder);

        let max = om.maximum_rcn();
        assert!(max >= cno::FIRST_USER + 2);
        for number in [cno::BOOLEAN, cno::OBJECT, cno::CLASS_CAST_EXCEPTION, a, b] {
            let klass = om.class_from_cno(number);
            let rcn = om.rcn_from_class(klass);
            assert!(rcn >= 1 && rcn <= max, "rcn {rcn} for {number}");
            assert_eq!(om.class_from_rcn(rcn), klass);
        }
    }

    #[test]
    fn simple_assignability_follows_superclasses() {
        let mut builder = RomBuilder::new();
        let user = builder.add_suite();
        let a = builder.add_class(user, "A", cno::OBJECT, 1, 0);
        let b = builder.add_class(user, "B", a, 1, 0);
        let mut om = create_test_memory(builder);
        let obj = om.new_instance(om.class_from_cno(b));
        assert!(om.is_simply_assignable_to_cno(obj, b));
        assert!(om.is_simply_assignable_to_cno(obj, a));
        assert!(om.is_simply_assignable_to_cno(obj, cno::OBJECT));
        assert!(!om.is_simply_assignable_to_cno(obj, cno::STRING));
    }

    #[test]
    fn class_state_lookup_moves_hit_to_front() {
        let mut builder = RomBuilder::new();
        let user = builder.add_suite();
        // Same bucket: class numbers differ by a multiple of 16.
        let first = builder.add_class(user, "First", cno::OBJECT, 0, 0);
        for i in 1..16 {
            builder.add_class(user, &format!("Filler{i}"), cno::OBJECT, 0, 0);
        }
        let second = builder.add_class(user, "Second", cno::OBJECT, 0, 0);
        assert_eq!(first & 15, second & 15);
        let mut om = create_test_memory(builder);
        let k1 = om.class_from_cno(first);
        let k2 = om.class_from_cno(second);

        let cs1 = om.find_class_state(k1);
        let cs2 = om.find_class_state(k2);
        assert!(cs1 != 0 && cs2 != 0 && cs1 != cs2);
        let table = om.root(Segment::Ram, root::CLASS_STATE_TABLE);
        let hash = (first & 15) as i32;
        assert_eq!(om.mem.get_word(table, hash), cs2);
        assert_eq!(class_state_next(&om.mem, cs2), cs1);

        assert_eq!(om.find_class_state(k1), cs1);
        assert_eq!(om.mem.get_word(table, hash), cs1);
        assert_eq!(class_state_next(&om.mem, cs1), cs2);
        assert_eq!(class_state_next(&om.mem, cs2), 0);
        assert_eq!(class_state_class(&om.mem, cs1), k1);
    }

    #[test]
    fn classes_needing_clinit_get_no_implicit_state() {
        let mut builder = RomBuilder::new();
        let user = builder.add_suite();
        let lazy = builder.add_class(user, "Lazy", cno::OBJECT, 0, 0);
        builder.set_access(lazy, ACC_MUSTCLINIT);
        builder.set_statics(lazy, 3, 1);
        let mut om = create_test_memory(builder);
        let klass = om.class_from_cno(lazy);
        assert_eq!(om.find_class_state(klass), 0);

        let cs = om.new_class_state(klass);
        assert_eq!(header::get_array_element_count(&om.mem, cs), 5);
        om.add_to_class_state(klass, cs);
        assert_eq!(om.find_class_state(klass), cs);
    }
}
