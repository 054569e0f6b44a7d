//! Fixed layouts shared by the interpreter, the collectors and the image
//! format. All offsets are in words unless noted otherwise.

// ── Image header (master memory record) ───────────────────────────────

pub const MMR_MAGIC: u32 = 0x0302_1957;
pub const MMR_MAGIC_REVERSED: u32 = 0x5719_0203;
pub const MMR_VERSION: u32 = 100;

pub const MMR_MAGIC_NUMBER: usize = 0;
pub const MMR_VERSION_WORD: usize = 1;
pub const MMR_ROM_START: usize = 2;
pub const MMR_ROM_SIZE: usize = 3;
pub const MMR_EEPROM_START: usize = 4;
pub const MMR_EEPROM_SIZE: usize = 5;
pub const MMR_RAM_START: usize = 6;
pub const MMR_RAM_SIZE: usize = 7;
pub const MMR_SIZE: usize = 8;

// ── Memory segment record ─────────────────────────────────────────────

pub const GCI_OBJECT_MEMORY_START: i32 = 0;
pub const GCI_OBJECT_MEMORY_SIZE: i32 = 1;
pub const GCI_PARTITION_START: i32 = 2;
pub const GCI_PARTITION_FREE: i32 = 3;
pub const GCI_PARTITION_END: i32 = 4;
pub const GCI_FAILED_ALLOCATION_SIZE: i32 = 5;
/// In RAM the first byte of this word holds the THROW bytecode used to
/// raise the out-of-memory error when a collection fails.
pub const GCI_RES1: i32 = 6;
pub const GCI_RES2: i32 = 7;
pub const GCI_SIZE: i32 = 8;

pub const MSR_ROOTS: i32 = GCI_SIZE;
pub const ROOT_SIZE: i32 = 8;
pub const MSR_SIZE: i32 = MSR_ROOTS + ROOT_SIZE;
pub const MSR_BYTES: u32 = (MSR_SIZE * 4) as u32;

/// Root slots. The same index means different things per segment.
pub mod root {
    pub const CLASS_STATE_TABLE: i32 = 0; // RAM
    pub const FREE_LIST: i32 = 0; // EEPROM
    pub const CURRENT_STACK_CHUNK: i32 = 1; // RAM
    pub const VM_EXTENSION: i32 = 1; // ROM
    pub const STACK_CHUNK_LIST: i32 = 2; // RAM
    pub const SUITE_TABLE: i32 = 2; // ROM and EEPROM
    pub const PERSISTENT_MEMORY_TABLE: i32 = 3; // EEPROM
    pub const METHOD_DEBUG_TABLE: i32 = 3; // ROM and RAM
    pub const OUT_OF_MEMORY_OBJECT: i32 = 4;
    pub const FAST_LOCK_STACK: i32 = 5;
    pub const ASSOCIATION_HASHTABLE: i32 = 6;
    pub const FINALIZATION_QUEUE: i32 = 7;
}

// ── Stack chunks and frames ───────────────────────────────────────────

/// Cheney keeps the chunk's own address here to rebase interior pointers
/// after a copy. Mark-compact uses the same slot to link every chunk.
pub const STACK_SELF: i32 = 0;
pub const STACK_LIST: i32 = 0;
pub const STACK_NEXT: i32 = 1;
pub const STACK_PREV: i32 = 2;
/// Chunk size in words, header included.
pub const STACK_SIZE: i32 = 3;
/// Last active frame. Zero means the chunk is not in use.
pub const STACK_LAST_LP: i32 = 4;
pub const STACK_HEADER_SIZE: i32 = 5;

pub const FRAME_CURRENT_MP: i32 = -5;
pub const FRAME_CURRENT_IP: i32 = -4;
pub const FRAME_PREVIOUS_LP: i32 = -3;
pub const FRAME_CURRENT_CP: i32 = -2;
/// Byte offset from `lp` to the word below the operand stack.
pub const FRAME_STACK_OFFSET: i32 = -1;
pub const FRAME_HEADER_SIZE: i32 = 5;

/// Minimum stack chunk size in words.
pub const REGULAR_CHUNK_SIZE: u32 = 32;

// ── Methods (byte offsets) ────────────────────────────────────────────

pub const MTH_HEADER_SIZE: i32 = 0;
pub const MTH_SUITE_NUMBER: i32 = 1;
pub const MTH_CLASS_NUMBER: i32 = 2;
pub const MTH_NUMBER_OF_PARMS: i32 = 3;
pub const MTH_NUMBER_OF_LOCALS: i32 = 4;
pub const MTH_OOP_MAP: i32 = 5;
/// Bytes per exception handler entry: four big-endian halves.
pub const MTH_HANDLER_SIZE: u32 = 8;

// ── Class objects ─────────────────────────────────────────────────────

pub const CLS_TYPE: i32 = 0;
pub const CLS_ACCESS: i32 = 1;
pub const CLS_SUPER_CLASS: i32 = 2;
pub const CLS_ELEMENT_TYPE: i32 = 3;
pub const CLS_INSTANCE_FIELDS_LENGTH: i32 = 4;
pub const CLS_STATIC_FIELDS_LENGTH: i32 = 5;
pub const CLS_POINTER_STATIC_FIELDS_LENGTH: i32 = 6;
pub const CLS_FIRST_VIRTUAL_METHOD: i32 = 7;
pub const CLS_VIRTUAL_METHODS: i32 = 8;
pub const CLS_STATIC_METHODS: i32 = 9;
pub const CLS_INTERFACE_TYPES: i32 = 10;
pub const CLS_INTERFACE_SLOT_TABLES: i32 = 11;
pub const CLS_OOP_MAP: i32 = 12;
pub const CLS_OBJECT_REFERENCES: i32 = 13;
pub const CLS_CLASS_REFERENCES: i32 = 14;
pub const CLS_DEBUG_INFO: i32 = 15;
pub const CLS_FIELD_COUNT: u32 = 16;

pub const ACC_MUSTCLINIT: u32 = 0x4000;
pub const ACC_HASFINALIZER: u32 = 0x8000;

/// Suite objects: field 0 is the array of classes.
pub const SUITE_CLASSES: i32 = 0;
pub const SUITE_FIELD_COUNT: u32 = 1;

// ── Class state ───────────────────────────────────────────────────────

pub const CLS_STATE_CLASS: i32 = 0;
pub const CLS_STATE_NEXT: i32 = 1;
pub const CLS_STATE_OFFSET_TO_FIELDS: i32 = 2;
/// Must be a power of two.
pub const CLS_STATE_TABLE_SIZE: u32 = 16;

// ── Object associations, monitors and threads ─────────────────────────

pub const ASSN_OBJECT: i32 = 0;
pub const ASSN_NEXT: i32 = 1;
pub const ASSN_MONITOR: i32 = 2;
pub const ASSN_HASH_CODE: i32 = 3;
pub const ASSN_FLAGS: i32 = 4;
pub const ASSN_FIELD_COUNT: u32 = 5;
pub const ASSN_TABLE_SIZE: u32 = 16;

pub const ASSN_FLAG_HAS_FINALIZER: u32 = 1 << 0;
pub const ASSN_FLAG_MIGRATABLE: u32 = 1 << 1;

pub const MONITOR_OWNER: i32 = 0;
pub const MONITOR_DEPTH: i32 = 1;
pub const MONITOR_MONITOR_QUEUE: i32 = 2;
pub const MONITOR_CONDVAR_QUEUE: i32 = 3;
/// Non-zero while a thread owns or waits on the monitor.
pub const MONITOR_IN_USE: i32 = 4;
pub const MONITOR_FIELD_COUNT: u32 = 5;

pub const THREAD_CONTEXT: i32 = 0;
pub const THREAD_FIELD_COUNT: u32 = 1;

// ── Interpreter ───────────────────────────────────────────────────────

/// Branches executed before a yield is considered.
pub const TIMEQUANTA: i32 = 10_000;

/// Bytes reserved after mark-compact object memory for the mark stack.
pub const MIN_MARK_STACK_SIZE: u32 = 20;

/// Fill pattern for the evacuated semi-space.
pub const ZAP_PATTERN: u32 = 0xdead_1dea;

/// The three segments of the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Segment {
    Rom = 0,
    Eeprom = 1,
    Ram = 2,
}

impl Segment {
    pub const ALL: [Segment; 3] = [Segment::Rom, Segment::Eeprom, Segment::Ram];

    pub fn name(self) -> &'static str {
        match self {
            Segment::Rom => "ROM",
            Segment::Eeprom => "EEPROM",
            Segment::Ram => "RAM",
        }
    }
}

impl From<u8> for Segment {
    fn from(value: u8) -> Self {
        match value {
            0 => Segment::Rom,
            1 => Segment::Eeprom,
            _ => Segment::Ram,
        }
    }
}
