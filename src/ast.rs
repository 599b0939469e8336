//! In-memory representation of a parsed module.
//!
//! Pure data: sections, instructions, types. Nested instruction sequences
//! (block/loop/if bodies, br_table label lists) are owned by their parent
//! instruction, so dropping a function body drops the whole tree.

use crate::types::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternKind {
    Func = 0,
    Table = 1,
    Mem = 2,
    Global = 3,
}

impl ExternKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ExternKind::Func),
            1 => Some(ExternKind::Table),
            2 => Some(ExternKind::Mem),
            3 => Some(ExternKind::Global),
            _ => None,
        }
    }

    pub fn repr(self) -> &'static str {
        match self {
            ExternKind::Func => "func",
            ExternKind::Table => "table",
            ExternKind::Mem => "mem",
            ExternKind::Global => "global",
        }
    }
}

/// Result type of a block/loop/if; the MVP allows zero or one value.
pub type BlockType = Option<ValType>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemArg {
    pub align: u32,
    pub offset: u32,
}

macro_rules! define_mem_ops {
    ($enum_name:ident { $(($name:ident, $vt:ident, $width:literal)),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum $enum_name { $($name),+ }

        impl $enum_name {
            /// The value type moved between the operand stack and memory.
            pub fn valtype(self) -> ValType {
                match self { $(Self::$name => ValType::$vt),+ }
            }

            /// Access width in bytes.
            pub fn width(self) -> u32 {
                match self { $(Self::$name => $width),+ }
            }
        }
    };
}

define_mem_ops!(LoadOp {
    (I32Load, I32, 4),
    (I64Load, I64, 8),
    (F32Load, F32, 4),
    (F64Load, F64, 8),
    (I32Load8S, I32, 1),
    (I32Load8U, I32, 1),
    (I32Load16S, I32, 2),
    (I32Load16U, I32, 2),
    (I64Load8S, I64, 1),
    (I64Load8U, I64, 1),
    (I64Load16S, I64, 2),
    (I64Load16U, I64, 2),
    (I64Load32S, I64, 4),
    (I64Load32U, I64, 4),
});

define_mem_ops!(StoreOp {
    (I32Store, I32, 4),
    (I64Store, I64, 8),
    (F32Store, F32, 4),
    (F64Store, F64, 8),
    (I32Store8, I32, 1),
    (I32Store16, I32, 2),
    (I64Store8, I64, 1),
    (I64Store16, I64, 2),
    (I64Store32, I64, 4),
});

impl LoadOp {
    pub fn from_opcode(byte: u8) -> Option<LoadOp> {
        use LoadOp::*;
        match byte {
            0x28 => Some(I32Load),
            0x29 => Some(I64Load),
            0x2a => Some(F32Load),
            0x2b => Some(F64Load),
            0x2c => Some(I32Load8S),
            0x2d => Some(I32Load8U),
            0x2e => Some(I32Load16S),
            0x2f => Some(I32Load16U),
            0x30 => Some(I64Load8S),
            0x31 => Some(I64Load8U),
            0x32 => Some(I64Load16S),
            0x33 => Some(I64Load16U),
            0x34 => Some(I64Load32S),
            0x35 => Some(I64Load32U),
            _ => None,
        }
    }
}

impl StoreOp {
    pub fn from_opcode(byte: u8) -> Option<StoreOp> {
        use StoreOp::*;
        match byte {
            0x36 => Some(I32Store),
            0x37 => Some(I64Store),
            0x38 => Some(F32Store),
            0x39 => Some(F64Store),
            0x3a => Some(I32Store8),
            0x3b => Some(I32Store16),
            0x3c => Some(I64Store8),
            0x3d => Some(I64Store16),
            0x3e => Some(I64Store32),
            _ => None,
        }
    }
}

/// Table of every numeric instruction: opcode, variant, operand types and
/// result type. The decoder, the validator and the compiler all key off
/// this one list.
macro_rules! for_each_num_op {
    ($m:ident) => {
        $m! {
            (0x45, I32Eqz, [I32] -> I32),
            (0x46, I32Eq, [I32, I32] -> I32),
            (0x47, I32Ne, [I32, I32] -> I32),
            (0x48, I32LtS, [I32, I32] -> I32),
            (0x49, I32LtU, [I32, I32] -> I32),
            (0x4a, I32GtS, [I32, I32] -> I32),
            (0x4b, I32GtU, [I32, I32] -> I32),
            (0x4c, I32LeS, [I32, I32] -> I32),
            (0x4d, I32LeU, [I32, I32] -> I32),
            (0x4e, I32GeS, [I32, I32] -> I32),
            (0x4f, I32GeU, [I32, I32] -> I32),
            (0x50, I64Eqz, [I64] -> I32),
            (0x51, I64Eq, [I64, I64] -> I32),
            (0x52, I64Ne, [I64, I64] -> I32),
            (0x53, I64LtS, [I64, I64] -> I32),
            (0x54, I64LtU, [I64, I64] -> I32),
            (0x55, I64GtS, [I64, I64] -> I32),
            (0x56, I64GtU, [I64, I64] -> I32),
            (0x57, I64LeS, [I64, I64] -> I32),
            (0x58, I64LeU, [I64, I64] -> I32),
            (0x59, I64GeS, [I64, I64] -> I32),
            (0x5a, I64GeU, [I64, I64] -> I32),
            (0x5b, F32Eq, [F32, F32] -> I32),
            (0x5c, F32Ne, [F32, F32] -> I32),
            (0x5d, F32Lt, [F32, F32] -> I32),
            (0x5e, F32Gt, [F32, F32] -> I32),
            (0x5f, F32Le, [F32, F32] -> I32),
            (0x60, F32Ge, [F32, F32] -> I32),
            (0x61, F64Eq, [F64, F64] -> I32),
            (0x62, F64Ne, [F64, F64] -> I32),
            (0x63, F64Lt, [F64, F64] -> I32),
            (0x64, F64Gt, [F64, F64] -> I32),
            (0x65, F64Le, [F64, F64] -> I32),
            (0x66, F64Ge, [F64, F64] -> I32),
            (0x67, I32Clz, [I32] -> I32),
            (0x68, I32Ctz, [I32] -> I32),
            (0x69, I32Popcnt, [I32] -> I32),
            (0x6a, I32Add, [I32, I32] -> I32),
            (0x6b, I32Sub, [I32, I32] -> I32),
            (0x6c, I32Mul, [I32, I32] -> I32),
            (0x6d, I32DivS, [I32, I32] -> I32),
            (0x6e, I32DivU, [I32, I32] -> I32),
            (0x6f, I32RemS, [I32, I32] -> I32),
            (0x70, I32RemU, [I32, I32] -> I32),
            (0x71, I32And, [I32, I32] -> I32),
            (0x72, I32Or, [I32, I32] -> I32),
            (0x73, I32Xor, [I32, I32] -> I32),
            (0x74, I32Shl, [I32, I32] -> I32),
            (0x75, I32ShrS, [I32, I32] -> I32),
            (0x76, I32ShrU, [I32, I32] -> I32),
            (0x77, I32Rotl, [I32, I32] -> I32),
            (0x78, I32Rotr, [I32, I32] -> I32),
            (0x79, I64Clz, [I64] -> I64),
            (0x7a, I64Ctz, [I64] -> I64),
            (0x7b, I64Popcnt, [I64] -> I64),
            (0x7c, I64Add, [I64, I64] -> I64),
            (0x7d, I64Sub, [I64, I64] -> I64),
            (0x7e, I64Mul, [I64, I64] -> I64),
            (0x7f, I64DivS, [I64, I64] -> I64),
            (0x80, I64DivU, [I64, I64] -> I64),
            (0x81, I64RemS, [I64, I64] -> I64),
            (0x82, I64RemU, [I64, I64] -> I64),
            (0x83, I64And, [I64, I64] -> I64),
            (0x84, I64Or, [I64, I64] -> I64),
            (0x85, I64Xor, [I64, I64] -> I64),
            (0x86, I64Shl, [I64, I64] -> I64),
            (0x87, I64ShrS, [I64, I64] -> I64),
            (0x88, I64ShrU, [I64, I64] -> I64),
            (0x89, I64Rotl, [I64, I64] -> I64),
            (0x8a, I64Rotr, [I64, I64] -> I64),
            (0x8b, F32Abs, [F32] -> F32),
            (0x8c, F32Neg, [F32] -> F32),
            (0x8d, F32Ceil, [F32] -> F32),
            (0x8e, F32Floor, [F32] -> F32),
            (0x8f, F32Trunc, [F32] -> F32),
            (0x90, F32Nearest, [F32] -> F32),
            (0x91, F32Sqrt, [F32] -> F32),
            (0x92, F32Add, [F32, F32] -> F32),
            (0x93, F32Sub, [F32, F32] -> F32),
            (0x94, F32Mul, [F32, F32] -> F32),
            (0x95, F32Div, [F32, F32] -> F32),
            (0x96, F32Min, [F32, F32] -> F32),
            (0x97, F32Max, [F32, F32] -> F32),
            (0x98, F32Copysign, [F32, F32] -> F32),
            (0x99, F64Abs, [F64] -> F64),
            (0x9a, F64Neg, [F64] -> F64),
            (0x9b, F64Ceil, [F64] -> F64),
            (0x9c, F64Floor, [F64] -> F64),
            (0x9d, F64Trunc, [F64] -> F64),
            (0x9e, F64Nearest, [F64] -> F64),
            (0x9f, F64Sqrt, [F64] -> F64),
            (0xa0, F64Add, [F64, F64] -> F64),
            (0xa1, F64Sub, [F64, F64] -> F64),
            (0xa2, F64Mul, [F64, F64] -> F64),
            (0xa3, F64Div, [F64, F64] -> F64),
            (0xa4, F64Min, [F64, F64] -> F64),
            (0xa5, F64Max, [F64, F64] -> F64),
            (0xa6, F64Copysign, [F64, F64] -> F64),
            (0xa7, I32WrapI64, [I64] -> I32),
            (0xa8, I32TruncSF32, [F32] -> I32),
            (0xa9, I32TruncUF32, [F32] -> I32),
            (0xaa, I32TruncSF64, [F64] -> I32),
            (0xab, I32TruncUF64, [F64] -> I32),
            (0xac, I64ExtendSI32, [I32] -> I64),
            (0xad, I64ExtendUI32, [I32] -> I64),
            (0xae, I64TruncSF32, [F32] -> I64),
            (0xaf, I64TruncUF32, [F32] -> I64),
            (0xb0, I64TruncSF64, [F64] -> I64),
            (0xb1, I64TruncUF64, [F64] -> I64),
            (0xb2, F32ConvertSI32, [I32] -> F32),
            (0xb3, F32ConvertUI32, [I32] -> F32),
            (0xb4, F32ConvertSI64, [I64] -> F32),
            (0xb5, F32ConvertUI64, [I64] -> F32),
            (0xb6, F32DemoteF64, [F64] -> F32),
            (0xb7, F64ConvertSI32, [I32] -> F64),
            (0xb8, F64ConvertUI32, [I32] -> F64),
            (0xb9, F64ConvertSI64, [I64] -> F64),
            (0xba, F64ConvertUI64, [I64] -> F64),
            (0xbb, F64PromoteF32, [F32] -> F64),
            (0xbc, I32ReinterpretF32, [F32] -> I32),
            (0xbd, I64ReinterpretF64, [F64] -> I64),
            (0xbe, F32ReinterpretI32, [I32] -> F32),
            (0xbf, F64ReinterpretI64, [I64] -> F64),
        }
    };
}

macro_rules! define_num_op {
    ($(($code:literal, $name:ident, [$($in:ident),*] -> $out:ident)),+ $(,)?) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum NumOp { $($name),+ }

        impl NumOp {
            pub fn from_opcode(byte: u8) -> Option<NumOp> {
                match byte {
                    $($code => Some(NumOp::$name),)+
                    _ => None,
                }
            }

            /// Operand types popped (deepest first) and result type pushed.
            pub fn stack_effect(self) -> (&'static [ValType], ValType) {
                match self {
                    $(NumOp::$name => (&[$(ValType::$in),*], ValType::$out),)+
                }
            }
        }
    };
}

for_each_num_op!(define_num_op);

/// One bytecode instruction. Block-structured instructions own their nested
/// sequences; there are no back-pointers, so the tree is acyclic and drops
/// recursively.
#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    // Control
    Unreachable,
    Nop,
    Block { ty: BlockType, body: Vec<Instr> },
    Loop { ty: BlockType, body: Vec<Instr> },
    If { ty: BlockType, then: Vec<Instr>, else_: Vec<Instr> },
    Br { depth: u32 },
    BrIf { depth: u32 },
    BrTable { targets: Vec<u32>, default: u32 },
    Return,
    Call { func: u32 },
    CallIndirect { ty: u32 },
    // Parametric
    Drop,
    Select,
    // Variable
    GetLocal(u32),
    SetLocal(u32),
    TeeLocal(u32),
    GetGlobal(u32),
    SetGlobal(u32),
    // Memory
    Load(LoadOp, MemArg),
    Store(StoreOp, MemArg),
    MemorySize,
    MemoryGrow,
    // Numeric
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    Num(NumOp),
}

// ---------------- Sections ----------------

#[derive(Clone, Debug)]
pub enum ImportDesc {
    Func(u32),
    Table(TableType),
    Mem(MemoryType),
    Global(GlobalType),
}

impl ImportDesc {
    pub fn kind(&self) -> ExternKind {
        match self {
            ImportDesc::Func(_) => ExternKind::Func,
            ImportDesc::Table(_) => ExternKind::Table,
            ImportDesc::Mem(_) => ExternKind::Mem,
            ImportDesc::Global(_) => ExternKind::Global,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub desc: ImportDesc,
}

#[derive(Clone, Debug)]
pub struct GlobalDef {
    pub ty: GlobalType,
    pub init: Vec<Instr>,
}

#[derive(Clone, Debug)]
pub struct ExportEntry {
    pub name: String,
    pub kind: ExternKind,
    pub idx: u32,
}

#[derive(Clone, Debug)]
pub struct ElemSegment {
    pub tableidx: u32,
    pub offset: Vec<Instr>,
    pub funcidxs: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct FuncBody {
    /// Declared locals, expanded; does not include the parameters.
    pub locals: Vec<ValType>,
    pub body: Vec<Instr>,
}

#[derive(Clone, Debug)]
pub struct DataSegment {
    pub memidx: u32,
    pub offset: Vec<Instr>,
    pub bytes: Vec<u8>,
}

/// A parsed module. Owned by whoever decoded it; instantiation borrows it
/// and retains nothing afterwards.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    /// Type index per defined function; code entries match by position.
    pub functions: Vec<u32>,
    pub tables: Vec<TableType>,
    pub memories: Vec<MemoryType>,
    pub globals: Vec<GlobalDef>,
    pub exports: Vec<ExportEntry>,
    pub start: Option<u32>,
    pub elements: Vec<ElemSegment>,
    pub code: Vec<FuncBody>,
    pub data: Vec<DataSegment>,
}

impl Module {
    pub fn n_imported(&self, kind: ExternKind) -> usize {
        self.imports.iter().filter(|i| i.desc.kind() == kind).count()
    }

    /// Function-index space: imported functions first, then defined ones.
    pub fn func_type(&self, funcidx: u32) -> Option<&FuncType> {
        let mut idx = funcidx as usize;
        for import in &self.imports {
            if let ImportDesc::Func(typeidx) = import.desc {
                if idx == 0 {
                    return self.types.get(typeidx as usize);
                }
                idx -= 1;
            }
        }
        let typeidx = *self.functions.get(idx)?;
        self.types.get(typeidx as usize)
    }

    pub fn n_funcs(&self) -> usize {
        self.n_imported(ExternKind::Func) + self.functions.len()
    }

    pub fn n_tables(&self) -> usize {
        self.n_imported(ExternKind::Table) + self.tables.len()
    }

    pub fn n_memories(&self) -> usize {
        self.n_imported(ExternKind::Mem) + self.memories.len()
    }

    pub fn n_globals(&self) -> usize {
        self.n_imported(ExternKind::Global) + self.globals.len()
    }

    /// Global-index space: imported globals first, then defined ones.
    pub fn global_type(&self, globalidx: u32) -> Option<GlobalType> {
        let mut idx = globalidx as usize;
        for import in &self.imports {
            if let ImportDesc::Global(gt) = import.desc {
                if idx == 0 {
                    return Some(gt);
                }
                idx -= 1;
            }
        }
        self.globals.get(idx).map(|g| g.ty)
    }

    /// Table-index space, import entries first.
    pub fn table_type(&self, tableidx: u32) -> Option<TableType> {
        let mut idx = tableidx as usize;
        for import in &self.imports {
            if let ImportDesc::Table(tt) = import.desc {
                if idx == 0 {
                    return Some(tt);
                }
                idx -= 1;
            }
        }
        self.tables.get(idx).copied()
    }

    pub fn memory_type(&self, memidx: u32) -> Option<MemoryType> {
        let mut idx = memidx as usize;
        for import in &self.imports {
            if let ImportDesc::Mem(mt) = import.desc {
                if idx == 0 {
                    return Some(mt);
                }
                idx -= 1;
            }
        }
        self.memories.get(idx).copied()
    }
}
