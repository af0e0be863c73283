use crate::signature::Arity;
use crate::value::ValType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemArg {
    pub align: u32,
    pub offset: u32,
}

impl MemArg {
    pub const fn new(align: u32, offset: u32) -> Self { Self { align, offset } }
}

/// Branch destination: relative label depth plus the resolved instruction index.
///
/// For a block or if the index points at the region's `End`; for a loop it is
/// the first instruction of the loop body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrTarget {
    pub depth: u32,
    pub pc: u32,
}

/// Which exceptions a `try_table` clause catches and whether it also pushes the `exnref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchKind {
    Tag(u32),
    TagRef(u32),
    All,
    AllRef,
}

impl CatchKind {
    pub fn tag(self) -> Option<u32> {
        match self {
            CatchKind::Tag(t) | CatchKind::TagRef(t) => Some(t),
            CatchKind::All | CatchKind::AllRef => None,
        }
    }

    pub fn pushes_ref(self) -> bool { matches!(self, CatchKind::TagRef(_) | CatchKind::AllRef) }
}

/// A catch clause with its branch target, resolved outside the `try_table` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub kind: CatchKind,
    pub target: BrTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
}

/// One linearized instruction. Structured control carries pre-resolved jump
/// targets so dispatch never rescans the body.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    // control
    Unreachable,
    Nop,
    Block(Arity),
    Loop(Arity),
    If { arity: Arity, else_pc: u32, end_pc: u32 },
    Else { end_pc: u32 },
    End,
    Br(BrTarget),
    BrIf(BrTarget),
    /// Targets followed by the default target.
    BrTable(Box<[BrTarget]>),
    Return,
    Call(u32),
    CallIndirect { type_idx: u32, table: u32 },
    ReturnCall(u32),
    ReturnCallIndirect { type_idx: u32, table: u32 },
    Throw(u32),
    ThrowRef,
    TryTable { arity: Arity, handlers: Box<[Handler]> },

    // parametric
    Drop,
    Select,
    SelectT(ValType),

    // variables; local operands are word slots, not local indices
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    LocalGet128(u32),
    LocalSet128(u32),
    LocalTee128(u32),
    GlobalGet(u32),
    GlobalSet(u32),

    // tables
    TableGet(u32),
    TableSet(u32),
    TableSize(u32),
    TableGrow(u32),
    TableFill(u32),
    TableCopy { dst: u32, src: u32 },
    TableInit { elem: u32, table: u32 },
    ElemDrop(u32),

    // memory
    I32Load(MemArg),
    I64Load(MemArg),
    F32Load(MemArg),
    F64Load(MemArg),
    I32Load8S(MemArg),
    I32Load8U(MemArg),
    I32Load16S(MemArg),
    I32Load16U(MemArg),
    I64Load8S(MemArg),
    I64Load8U(MemArg),
    I64Load16S(MemArg),
    I64Load16U(MemArg),
    I64Load32S(MemArg),
    I64Load32U(MemArg),
    I32Store(MemArg),
    I64Store(MemArg),
    F32Store(MemArg),
    F64Store(MemArg),
    I32Store8(MemArg),
    I32Store16(MemArg),
    I64Store8(MemArg),
    I64Store16(MemArg),
    I64Store32(MemArg),
    MemorySize,
    MemoryGrow,
    MemoryInit(u32),
    DataDrop(u32),
    MemoryCopy,
    MemoryFill,

    // constants
    I32Const(i32),
    I64Const(i64),
    F32Const(u32),
    F64Const(u64),

    // references
    RefNull(ValType),
    RefIsNull,
    RefFunc(u32),

    // numeric
    I32Eqz, I32Eq, I32Ne, I32LtS, I32LtU, I32GtS, I32GtU, I32LeS, I32LeU, I32GeS, I32GeU,
    I64Eqz, I64Eq, I64Ne, I64LtS, I64LtU, I64GtS, I64GtU, I64LeS, I64LeU, I64GeS, I64GeU,
    F32Eq, F32Ne, F32Lt, F32Gt, F32Le, F32Ge,
    F64Eq, F64Ne, F64Lt, F64Gt, F64Le, F64Ge,
    I32Clz, I32Ctz, I32Popcnt, I32Add, I32Sub, I32Mul, I32DivS, I32DivU, I32RemS, I32RemU,
    I32And, I32Or, I32Xor, I32Shl, I32ShrS, I32ShrU, I32Rotl, I32Rotr,
    I64Clz, I64Ctz, I64Popcnt, I64Add, I64Sub, I64Mul, I64DivS, I64DivU, I64RemS, I64RemU,
    I64And, I64Or, I64Xor, I64Shl, I64ShrS, I64ShrU, I64Rotl, I64Rotr,
    F32Abs, F32Neg, F32Ceil, F32Floor, F32Trunc, F32Nearest, F32Sqrt,
    F32Add, F32Sub, F32Mul, F32Div, F32Min, F32Max, F32Copysign,
    F64Abs, F64Neg, F64Ceil, F64Floor, F64Trunc, F64Nearest, F64Sqrt,
    F64Add, F64Sub, F64Mul, F64Div, F64Min, F64Max, F64Copysign,
    I32WrapI64, I32TruncF32S, I32TruncF32U, I32TruncF64S, I32TruncF64U,
    I64ExtendI32S, I64ExtendI32U, I64TruncF32S, I64TruncF32U, I64TruncF64S, I64TruncF64U,
    F32ConvertI32S, F32ConvertI32U, F32ConvertI64S, F32ConvertI64U, F32DemoteF64,
    F64ConvertI32S, F64ConvertI32U, F64ConvertI64S, F64ConvertI64U, F64PromoteF32,
    I32ReinterpretF32, I64ReinterpretF64, F32ReinterpretI32, F64ReinterpretI64,
    I32Extend8S, I32Extend16S, I64Extend8S, I64Extend16S, I64Extend32S,
    I32TruncSatF32S, I32TruncSatF32U, I32TruncSatF64S, I32TruncSatF64U,
    I64TruncSatF32S, I64TruncSatF32U, I64TruncSatF64S, I64TruncSatF64U,

    // threads
    AtomicNotify(MemArg),
    AtomicWait32(MemArg),
    AtomicWait64(MemArg),
    AtomicFence,
    AtomicLoad { size: u8, memarg: MemArg },
    AtomicStore { size: u8, memarg: MemArg },
    AtomicRmw { op: RmwOp, size: u8, memarg: MemArg },
    AtomicCmpxchg { size: u8, memarg: MemArg },
}

impl Instr {
    /// Maps a single-byte opcode without immediates (0x45..=0xc4) to its instruction.
    pub fn plain(opcode: u8) -> Option<Instr> {
        use Instr::*;
        Some(match opcode {
            0x45 => I32Eqz, 0x46 => I32Eq, 0x47 => I32Ne, 0x48 => I32LtS, 0x49 => I32LtU,
            0x4a => I32GtS, 0x4b => I32GtU, 0x4c => I32LeS, 0x4d => I32LeU, 0x4e => I32GeS,
            0x4f => I32GeU,
            0x50 => I64Eqz, 0x51 => I64Eq, 0x52 => I64Ne, 0x53 => I64LtS, 0x54 => I64LtU,
            0x55 => I64GtS, 0x56 => I64GtU, 0x57 => I64LeS, 0x58 => I64LeU, 0x59 => I64GeS,
            0x5a => I64GeU,
            0x5b => F32Eq, 0x5c => F32Ne, 0x5d => F32Lt, 0x5e => F32Gt, 0x5f => F32Le, 0x60 => F32Ge,
            0x61 => F64Eq, 0x62 => F64Ne, 0x63 => F64Lt, 0x64 => F64Gt, 0x65 => F64Le, 0x66 => F64Ge,
            0x67 => I32Clz, 0x68 => I32Ctz, 0x69 => I32Popcnt, 0x6a => I32Add, 0x6b => I32Sub,
            0x6c => I32Mul, 0x6d => I32DivS, 0x6e => I32DivU, 0x6f => I32RemS, 0x70 => I32RemU,
            0x71 => I32And, 0x72 => I32Or, 0x73 => I32Xor, 0x74 => I32Shl, 0x75 => I32ShrS,
            0x76 => I32ShrU, 0x77 => I32Rotl, 0x78 => I32Rotr,
            0x79 => I64Clz, 0x7a => I64Ctz, 0x7b => I64Popcnt, 0x7c => I64Add, 0x7d => I64Sub,
            0x7e => I64Mul, 0x7f => I64DivS, 0x80 => I64DivU, 0x81 => I64RemS, 0x82 => I64RemU,
            0x83 => I64And, 0x84 => I64Or, 0x85 => I64Xor, 0x86 => I64Shl, 0x87 => I64ShrS,
            0x88 => I64ShrU, 0x89 => I64Rotl, 0x8a => I64Rotr,
            0x8b => F32Abs, 0x8c => F32Neg, 0x8d => F32Ceil, 0x8e => F32Floor, 0x8f => F32Trunc,
            0x90 => F32Nearest, 0x91 => F32Sqrt, 0x92 => F32Add, 0x93 => F32Sub, 0x94 => F32Mul,
            0x95 => F32Div, 0x96 => F32Min, 0x97 => F32Max, 0x98 => F32Copysign,
            0x99 => F64Abs, 0x9a => F64Neg, 0x9b => F64Ceil, 0x9c => F64Floor, 0x9d => F64Trunc,
            0x9e => F64Nearest, 0x9f => F64Sqrt, 0xa0 => F64Add, 0xa1 => F64Sub, 0xa2 => F64Mul,
            0xa3 => F64Div, 0xa4 => F64Min, 0xa5 => F64Max, 0xa6 => F64Copysign,
            0xa7 => I32WrapI64, 0xa8 => I32TruncF32S, 0xa9 => I32TruncF32U, 0xaa => I32TruncF64S,
            0xab => I32TruncF64U, 0xac => I64ExtendI32S, 0xad => I64ExtendI32U,
            0xae => I64TruncF32S, 0xaf => I64TruncF32U, 0xb0 => I64TruncF64S, 0xb1 => I64TruncF64U,
            0xb2 => F32ConvertI32S, 0xb3 => F32ConvertI32U, 0xb4 => F32ConvertI64S,
            0xb5 => F32ConvertI64U, 0xb6 => F32DemoteF64, 0xb7 => F64ConvertI32S,
            0xb8 => F64ConvertI32U, 0xb9 => F64ConvertI64S, 0xba => F64ConvertI64U,
            0xbb => F64PromoteF32, 0xbc => I32ReinterpretF32, 0xbd => I64ReinterpretF64,
            0xbe => F32ReinterpretI32, 0xbf => F64ReinterpretI64,
            0xc0 => I32Extend8S, 0xc1 => I32Extend16S, 0xc2 => I64Extend8S, 0xc3 => I64Extend16S,
            0xc4 => I64Extend32S,
            _ => return None,
        })
    }

    /// Maps a load/store opcode (0x28..=0x3e) to its instruction.
    pub fn memory(opcode: u8, m: MemArg) -> Option<Instr> {
        use Instr::*;
        Some(match opcode {
            0x28 => I32Load(m), 0x29 => I64Load(m), 0x2a => F32Load(m), 0x2b => F64Load(m),
            0x2c => I32Load8S(m), 0x2d => I32Load8U(m), 0x2e => I32Load16S(m), 0x2f => I32Load16U(m),
            0x30 => I64Load8S(m), 0x31 => I64Load8U(m), 0x32 => I64Load16S(m), 0x33 => I64Load16U(m),
            0x34 => I64Load32S(m), 0x35 => I64Load32U(m),
            0x36 => I32Store(m), 0x37 => I64Store(m), 0x38 => F32Store(m), 0x39 => F64Store(m),
            0x3a => I32Store8(m), 0x3b => I32Store16(m), 0x3c => I64Store8(m), 0x3d => I64Store16(m),
            0x3e => I64Store32(m),
            _ => return None,
        })
    }

    /// Maps the 0xfc-prefixed saturating truncations (sub-opcodes 0..=7).
    pub fn trunc_sat(sub: u32) -> Option<Instr> {
        use Instr::*;
        Some(match sub {
            0 => I32TruncSatF32S, 1 => I32TruncSatF32U, 2 => I32TruncSatF64S, 3 => I32TruncSatF64U,
            4 => I64TruncSatF32S, 5 => I64TruncSatF32U, 6 => I64TruncSatF64S, 7 => I64TruncSatF64U,
            _ => return None,
        })
    }

    /// Maps a 0xfe-prefixed memory access sub-opcode (0x10..=0x4e).
    pub fn atomic(sub: u32, memarg: MemArg) -> Option<Instr> {
        use Instr::*;
        use RmwOp::*;
        let rmw = |op, size| AtomicRmw { op, size, memarg };
        Some(match sub {
            0x10 => AtomicLoad { size: 4, memarg },
            0x11 => AtomicLoad { size: 8, memarg },
            0x12 | 0x14 => AtomicLoad { size: 1, memarg },
            0x13 | 0x15 => AtomicLoad { size: 2, memarg },
            0x16 => AtomicLoad { size: 4, memarg },
            0x17 => AtomicStore { size: 4, memarg },
            0x18 => AtomicStore { size: 8, memarg },
            0x19 | 0x1b => AtomicStore { size: 1, memarg },
            0x1a | 0x1c => AtomicStore { size: 2, memarg },
            0x1d => AtomicStore { size: 4, memarg },
            0x1e..=0x4e => {
                // seven rmw groups of seven: i32, i64, i32_8u, i32_16u, i64_8u, i64_16u, i64_32u
                let group = (sub - 0x1e) / 7;
                let size = [4u8, 8, 1, 2, 1, 2, 4][((sub - 0x1e) % 7) as usize];
                match group {
                    0 => rmw(Add, size),
                    1 => rmw(Sub, size),
                    2 => rmw(And, size),
                    3 => rmw(Or, size),
                    4 => rmw(Xor, size),
                    5 => rmw(Xchg, size),
                    _ => AtomicCmpxchg { size, memarg },
                }
            }
            _ => return None,
        })
    }
}
