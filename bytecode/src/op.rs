/// Interpreter opcodes.
///
/// Every opcode is one byte. Inline operands are big-endian. The `Wide*`
/// prefixes replace the operand of the following branch, `Object` or `Class`
/// instruction:
///
/// ```text
/// WIDE_n     next operand = ((n << 8) | byte), sign-extended from 12 bits
/// WIDE_HALF  next operand = i16
/// WIDE_FULL  next operand = i32
/// ```
///
/// The `LongOp` and `FloatOp` escapes are followed by one sub-opcode byte, see
/// [`LongOp`] and [`FloatOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    // ── Constants, object and class literals, locals ───────────────
    Const0 = 0,
    Const1,
    Const2,
    Const3,
    Const4,
    Const5,
    Const6,
    Const7,
    Const8,
    Const9,
    Const10,
    Const11,
    Const12,
    Const13,
    Const14,
    Const15,
    Object0,
    Object1,
    Object2,
    Object3,
    Object4,
    Object5,
    Object6,
    Object7,
    Object8,
    Object9,
    Object10,
    Object11,
    Object12,
    Object13,
    Object14,
    Object15,
    Class0,
    Class1,
    Class2,
    Class3,
    Class4,
    Class5,
    Class6,
    Class7,
    Class8,
    Class9,
    Class10,
    Class11,
    Class12,
    Class13,
    Class14,
    Class15,
    Load0,
    Load1,
    Load2,
    Load3,
    Load4,
    Load5,
    Load6,
    Load7,
    Load8,
    Load9,
    Load10,
    Load11,
    Load12,
    Load13,
    Load14,
    Load15,
    Store0,
    Store1,
    Store2,
    Store3,
    Store4,
    Store5,
    Store6,
    Store7,
    Store8,
    Store9,
    Store10,
    Store11,
    Store12,
    Store13,
    Store14,
    Store15,

    // ── Prefixes and frame setup ───────────────────────────────────
    Wide0,
    Wide1,
    Wide2,
    Wide3,
    Wide4,
    Wide5,
    Wide6,
    Wide7,
    Wide8,
    Wide9,
    Wide10,
    Wide11,
    Wide12,
    Wide13,
    Wide14,
    Wide15,
    Extend0,
    Extend1,
    Extend2,
    Extend3,
    Extend4,
    Extend5,
    Extend6,
    Extend7,
    Extend8,
    Extend9,
    Extend10,
    Extend11,
    Extend12,
    Extend13,
    Extend14,
    Extend15,
    WideHalf,
    WideFull,

    // ── Sub-opcode escapes ─────────────────────────────────────────
    LongOp,
    FloatOp,

    // ── Single byte operations ─────────────────────────────────────
    ConstM1,
    ConstNull,
    Iadd,
    Isub,
    Iand,
    Ior,
    Ixor,
    Ishl,
    Ishr,
    Iushr,
    Imul,
    Idiv,
    Irem,
    Return,
    Throw,
    Bpt,
    Nop,
    Pop,
    Neg,
    I2b,
    I2s,
    I2c,
    Lookup,
    Tableswitch,
    Stableswitch,
    Monitorenter,
    Monitorexit,
    ClassMonitorenter,
    ClassMonitorexit,
    Arraylength,
    Clinit,
    Newarray,
    Newdimension,
    Instanceof,
    Checkcast,

    // ── Comparisons and typed array access ─────────────────────────
    Eq,
    Lt,
    Le,
    Ne,
    Gt,
    Ge,
    Aload,
    Astore,

    // ── Literals with inline operands ──────────────────────────────
    ConstByte,
    ConstShort,
    ConstChar,
    ConstInt,
    ConstLong,
    ConstFloat,
    ConstDouble,
    Object,
    Class,
    Load,
    Store,
    Extend,
    Inc,
    Dec,

    // ── Invokes, statics, fields and branches ──────────────────────
    Invokeinit,
    Invokeinterface,
    Invokestatic,
    Invokesuper,
    Invokevirtual,
    Invokenative,
    Getstatic,
    Putstatic,
    ClassGetstatic,
    ClassPutstatic,
    Getfield,
    Putfield,
    ThisGetfield,
    ThisPutfield,
    Ifeq,
    Ifne,
    Iflt,
    Ifle,
    Ifgt,
    Ifge,
    IfIcmpeq,
    IfIcmpne,
    IfIcmplt,
    IfIcmple,
    IfIcmpgt,
    IfIcmpge,
    Goto,
    Methodid,

    // ── Invoke variants returning one or two words ─────────────────
    Invokeinit1,
    Invokeinterface1,
    Invokestatic1,
    Invokesuper1,
    Invokevirtual1,
    Invokenative1,
    Invokeinit2,
    Invokeinterface2,
    Invokestatic2,
    Invokesuper2,
    Invokevirtual2,
    Invokenative2,

    // ── Lookups, allocation and returns ────────────────────────────
    LookupB,
    LookupS,
    LookupC,
    Newobject,
    ClassClinit,
    Return1,
    Return2,

    // ── Typed variants ─────────────────────────────────────────────
    StableswitchPad,
    LoadI2,
    StoreI2,
    AloadB,
    AloadS,
    AloadC,
    AloadI2,
    AstoreB,
    AstoreS,
    AstoreO,
    AstoreI2,
    GetstaticO,
    GetstaticI2,
    ClassGetstaticO,
    ClassGetstaticI2,
    PutstaticO,
    PutstaticI2,
    ClassPutstaticO,
    ClassPutstaticI2,
    GetfieldB,
    GetfieldS,
    GetfieldC,
    GetfieldI2,
    PutfieldB,
    PutfieldS,
    PutfieldO,
    PutfieldI2,
    ThisGetfieldB,
    ThisGetfieldS,
    ThisGetfieldC,
    ThisGetfieldI2,
    ThisPutfieldB,
    ThisPutfieldS,
    ThisPutfieldO,
    ThisPutfieldI2,
}

impl Op {
    pub const COUNT: usize = Op::ThisPutfieldI2 as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Op::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!(
            (byte as usize) < Self::COUNT,
            "invalid opcode: 0x{byte:02x}"
        );
        unsafe { core::mem::transmute::<u8, Op>(byte) }
    }

    /// Lower-case mnemonic, as printed by the instruction tracer.
    pub fn mnemonic(self) -> &'static str {
        MNEMONICS[self as usize]
    }

    /// Opcodes whose operand can be widened by a `Wide*` prefix.
    pub const fn accepts_wide_prefix(self) -> bool {
        matches!(self, Op::Object | Op::Class) || self.is_branch()
    }

    /// Conditional and unconditional branches. These decrement the time
    /// slice counter.
    pub const fn is_branch(self) -> bool {
        (self as u8) >= Op::Ifeq as u8 && (self as u8) <= Op::Goto as u8
    }

    /// `Const0..Const15`, `Object0..`, `Class0..`, `Load0..`, `Store0..`,
    /// `Wide0..` and `Extend0..` carry their operand in the low nibble.
    pub const fn short_form_base(self) -> Option<Op> {
        let b = self as u8;
        if b < Op::WideHalf as u8 {
            // SAFETY: the base of a 16-opcode group is always a valid opcode
            Some(unsafe { core::mem::transmute::<u8, Op>(b & 0xF0) })
        } else {
            None
        }
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if (byte as usize) < Self::COUNT {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}

static MNEMONICS: [&str; Op::COUNT] = [
        "const_0",
        "const_1",
        "const_2",
        "const_3",
        "const_4",
        "const_5",
        "const_6",
        "const_7",
        "const_8",
        "const_9",
        "const_10",
        "const_11",
        "const_12",
        "const_13",
        "const_14",
        "const_15",
        "object_0",
        "object_1",
        "object_2",
        "object_3",
        "object_4",
        "object_5",
        "object_6",
        "object_7",
        "object_8",
        "object_9",
        "object_10",
        "object_11",
        "object_12",
        "object_13",
        "object_14",
        "object_15",
        "class_0",
        "class_1",
        "class_2",
        "class_3",
        "class_4",
        "class_5",
        "class_6",
        "class_7",
        "class_8",
        "class_9",
        "class_10",
        "class_11",
        "class_12",
        "class_13",
        "class_14",
        "class_15",
        "load_0",
        "load_1",
        "load_2",
        "load_3",
        "load_4",
        "load_5",
        "load_6",
        "load_7",
        "load_8",
        "load_9",
        "load_10",
        "load_11",
        "load_12",
        "load_13",
        "load_14",
        "load_15",
        "store_0",
        "store_1",
        "store_2",
        "store_3",
        "store_4",
        "store_5",
        "store_6",
        "store_7",
        "store_8",
        "store_9",
        "store_10",
        "store_11",
        "store_12",
        "store_13",
        "store_14",
        "store_15",
        "wide_0",
        "wide_1",
        "wide_2",
        "wide_3",
        "wide_4",
        "wide_5",
        "wide_6",
        "wide_7",
        "wide_8",
        "wide_9",
        "wide_10",
        "wide_11",
        "wide_12",
        "wide_13",
        "wide_14",
        "wide_15",
        "extend_0",
        "extend_1",
        "extend_2",
        "extend_3",
        "extend_4",
        "extend_5",
        "extend_6",
        "extend_7",
        "extend_8",
        "extend_9",
        "extend_10",
        "extend_11",
        "extend_12",
        "extend_13",
        "extend_14",
        "extend_15",
        "wide_half",
        "wide_full",
        "longOp",
        "floatOp",
        "const_m1",
        "const_null",
        "iadd",
        "isub",
        "iand",
        "ior",
        "ixor",
        "ishl",
        "ishr",
        "iushr",
        "imul",
        "idiv",
        "irem",
        "return",
        "throw",
        "bpt",
        "nop",
        "pop",
        "neg",
        "i2b",
        "i2s",
        "i2c",
        "lookup",
        "tableswitch",
        "stableswitch",
        "monitorenter",
        "monitorexit",
        "class_monitorenter",
        "class_monitorexit",
        "arraylength",
        "clinit",
        "newarray",
        "newdimension",
        "instanceof",
        "checkcast",
        "eq",
        "lt",
        "le",
        "ne",
        "gt",
        "ge",
        "aload",
        "astore",
        "const_byte",
        "const_short",
        "const_char",
        "const_int",
        "const_long",
        "const_float",
        "const_double",
        "object",
        "class",
        "load",
        "store",
        "extend",
        "inc",
        "dec",
        "invokeinit",
        "invokeinterface",
        "invokestatic",
        "invokesuper",
        "invokevirtual",
        "invokenative",
        "getstatic",
        "putstatic",
        "class_getstatic",
        "class_putstatic",
        "getfield",
        "putfield",
        "this_getfield",
        "this_putfield",
        "ifeq",
        "ifne",
        "iflt",
        "ifle",
        "ifgt",
        "ifge",
        "if_icmpeq",
        "if_icmpne",
        "if_icmplt",
        "if_icmple",
        "if_icmpgt",
        "if_icmpge",
        "goto",
        "methodid",
        "invokeinit1",
        "invokeinterface1",
        "invokestatic1",
        "invokesuper1",
        "invokevirtual1",
        "invokenative1",
        "invokeinit2",
        "invokeinterface2",
        "invokestatic2",
        "invokesuper2",
        "invokevirtual2",
        "invokenative2",
        "lookup_b",
        "lookup_s",
        "lookup_c",
        "newobject",
        "class_clinit",
        "return1",
        "return2",
        "stableswitch_pad",
        "load_i2",
        "store_i2",
        "aload_b",
        "aload_s",
        "aload_c",
        "aload_i2",
        "astore_b",
        "astore_s",
        "astore_o",
        "astore_i2",
        "getstatic_o",
        "getstatic_i2",
        "class_getstatic_o",
        "class_getstatic_i2",
        "putstatic_o",
        "putstatic_i2",
        "class_putstatic_o",
        "class_putstatic_i2",
        "getfield_b",
        "getfield_s",
        "getfield_c",
        "getfield_i2",
        "putfield_b",
        "putfield_s",
        "putfield_o",
        "putfield_i2",
        "this_getfield_b",
        "this_getfield_s",
        "this_getfield_c",
        "this_getfield_i2",
        "this_putfield_b",
        "this_putfield_s",
        "this_putfield_o",
        "this_putfield_i2",
];

/// Sub-opcodes following [`Op::LongOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LongOp {
    Ladd = 0,
    Lsub,
    Lmul,
    Ldiv,
    Lrem,
    Land,
    Lor,
    Lxor,
    Lneg,
    Lshl,
    Lshr,
    Lushr,
    Lcmp,
    L2i,
    I2l,
}

impl LongOp {
    pub const COUNT: usize = LongOp::I2l as usize + 1;
}

impl TryFrom<u8> for LongOp {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if (byte as usize) < Self::COUNT {
            // SAFETY: contiguous repr(u8) variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, LongOp>(byte) })
        } else {
            Err(byte)
        }
    }
}

/// Sub-opcodes following [`Op::FloatOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FloatOp {
    Fadd = 0,
    Fsub,
    Fmul,
    Fdiv,
    Frem,
    Fneg,
    Fcmpg,
    Fcmpl,
    Dadd,
    Dsub,
    Dmul,
    Ddiv,
    Drem,
    Dneg,
    Dcmpg,
    Dcmpl,
    I2f,
    L2f,
    F2i,
    F2l,
    I2d,
    L2d,
    F2d,
    D2i,
    D2l,
    D2f,
}

impl FloatOp {
    pub const COUNT: usize = FloatOp::D2f as usize + 1;
}

impl TryFrom<u8> for FloatOp {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if (byte as usize) < Self::COUNT {
            // SAFETY: contiguous repr(u8) variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, FloatOp>(byte) })
        } else {
            Err(byte)
        }
    }
}
