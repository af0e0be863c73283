use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::builder::CodeBuilder;
use crate::byte_iter::*;
use crate::error::*;
use crate::instruction::{CatchKind, Instr, MemArg};
use crate::signature::{BlockType, FuncType};
use crate::value::ValType;
use crate::wasm_memory::{MemoryLimits, MAX_PAGES};

pub const MAGIC_HEADER: [u8; 4] = *b"\0asm";
pub const VERSION: u32 = 1;

// ---------------- Import/Export related ----------------
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternKind {
    Func = 0,
    Table = 1,
    Memory = 2,
    Global = 3,
    Tag = 4,
}

impl ExternKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ExternKind::Func),
            1 => Some(ExternKind::Table),
            2 => Some(ExternKind::Memory),
            3 => Some(ExternKind::Global),
            4 => Some(ExternKind::Tag),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableType {
    pub elem_type: ValType,
    pub initial: u32,
    pub maximum: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalType {
    pub ty: ValType,
    pub mutable: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ImportDesc {
    Func(u32),
    Table(TableType),
    Memory(MemoryLimits),
    Global(GlobalType),
    /// Type index of the tag's payload signature.
    Tag(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub desc: ImportDesc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Export {
    pub kind: ExternKind,
    pub idx: u32,
}

/// Constant expression without its terminating `end`.
pub type ConstExpr = Vec<Instr>;

// ---------------- Structures ----------------
#[derive(Debug, PartialEq)]
pub struct FunctionBody {
    pub type_idx: u32,
    /// Declared locals, excluding parameters.
    pub locals: Vec<ValType>,
    pub code: Vec<Instr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GlobalDef {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SegmentMode {
    Passive,
    Active { index: u32, offset: ConstExpr },
    Declarative,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ElementSegment {
    pub elem_type: ValType,
    pub mode: SegmentMode,
    pub items: Vec<ConstExpr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataSegment {
    pub mode: SegmentMode,
    pub data: Vec<u8>,
}

// ---------------- Module Structure ----------------
/// Structural form of a module: everything instantiation needs, with code
/// bodies already linearized.
#[derive(Debug, Default, PartialEq)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    /// Type index of every function in the index space, imports first.
    pub func_types: Vec<u32>,
    pub bodies: Vec<Rc<FunctionBody>>,
    pub tables: Vec<TableType>,
    pub memory: Option<MemoryLimits>,
    pub globals: Vec<GlobalDef>,
    /// Type index of every defined tag.
    pub tags: Vec<u32>,
    pub exports: HashMap<String, Export>,
    pub start: Option<u32>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    pub data_count: Option<u32>,
}

impl Module {
    pub const MAX_LOCALS: u64 = 50000;

    pub fn num_imported_funcs(&self) -> usize {
        self.imports.iter().filter(|i| matches!(i.desc, ImportDesc::Func(_))).count()
    }

    pub fn num_imported_globals(&self) -> usize {
        self.imports.iter().filter(|i| matches!(i.desc, ImportDesc::Global(_))).count()
    }

    pub fn func_type(&self, idx: u32) -> Option<&FuncType> {
        self.func_types.get(idx as usize).and_then(|&t| self.types.get(t as usize))
    }

    pub fn num_funcs(&self) -> usize { self.func_types.len() }

    pub fn imports_table(&self) -> bool { self.imports.iter().any(|i| matches!(i.desc, ImportDesc::Table(_))) }

    fn num_tables(&self) -> usize {
        self.imports.iter().filter(|i| matches!(i.desc, ImportDesc::Table(_))).count() + self.tables.len()
    }

    fn num_globals(&self) -> usize { self.num_imported_globals() + self.globals.len() }

    pub fn num_imported_tags(&self) -> usize {
        self.imports.iter().filter(|i| matches!(i.desc, ImportDesc::Tag(_))).count()
    }

    fn num_tags(&self) -> usize { self.num_imported_tags() + self.tags.len() }

    fn has_memory(&self) -> bool {
        self.memory.is_some() || self.imports.iter().any(|i| matches!(i.desc, ImportDesc::Memory(_)))
    }

    /// Decodes a binary module. Only structural checks are performed.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 { return Err(Error::malformed(UNEXPECTED_END_SHORT)); }
        if bytes[0..4] != MAGIC_HEADER { return Err(Error::malformed(NO_MAGIC_HEADER)); }
        let mut it = ByteIter::new(bytes, 4);
        let version = u32::from_le_bytes(it.read_array().map_err(|_| Error::malformed(UNKNOWN_BINARY_VERSION))?);
        if version != VERSION { return Err(Error::malformed(UNKNOWN_BINARY_VERSION)); }

        let mut m = Module::default();
        let mut n_defined: Option<u32> = None;

        skip_custom_sections(&mut it)?;
        section(&mut it, 1, |it| m.read_type_section(it))?;
        section(&mut it, 2, |it| m.read_import_section(it))?;
        section(&mut it, 3, |it| {
            n_defined = Some(m.read_function_section(it)?);
            Ok(())
        })?;
        section(&mut it, 4, |it| m.read_table_section(it))?;
        section(&mut it, 5, |it| m.read_memory_section(it))?;
        section(&mut it, 13, |it| m.read_tag_section(it))?;
        section(&mut it, 6, |it| m.read_global_section(it))?;
        section(&mut it, 7, |it| m.read_export_section(it))?;
        section(&mut it, 8, |it| m.read_start_section(it))?;
        section(&mut it, 9, |it| m.read_element_section(it))?;
        section(&mut it, 12, |it| {
            m.data_count = Some(it.read_u32()?);
            Ok(())
        })?;
        let mut saw_code = false;
        section(&mut it, 10, |it| {
            saw_code = true;
            m.read_code_section(it)
        })?;
        section(&mut it, 11, |it| m.read_data_section(it))?;

        if !it.empty() { return Err(Error::malformed(JUNK_AFTER_LAST)); }
        if !saw_code && n_defined.unwrap_or(0) > 0 {
            return Err(Error::malformed(FUNC_CODE_INCONSISTENT));
        }
        if let Some(count) = m.data_count {
            if count as usize != m.data.len() { return Err(Error::malformed(DATA_COUNT_MISMATCH)); }
        }
        debug!(
            types = m.types.len(),
            funcs = m.func_types.len(),
            imports = m.imports.len(),
            exports = m.exports.len(),
            "module decoded"
        );
        Ok(m)
    }

    fn read_type_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_types = it.read_u32()?;
        for _ in 0..n_types {
            if it.read_u8()? != 0x60 { return Err(Error::malformed(INT_TOO_LONG)); }
            let params = read_val_types(it)?;
            let results = read_val_types(it)?;
            self.types.push(FuncType::new(params, results));
        }
        Ok(())
    }

    fn read_import_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_imports = it.read_u32()?;
        for _ in 0..n_imports {
            let module = it.read_name()?;
            let field = it.read_name()?;
            let kind = ExternKind::from_byte(it.read_u8()?).ok_or(Error::malformed(MALFORMED_IMPORT_KIND))?;
            let desc = match kind {
                ExternKind::Func => {
                    let type_idx = it.read_u32()?;
                    if type_idx as usize >= self.types.len() { return Err(Error::malformed(UNKNOWN_TYPE)); }
                    self.func_types.push(type_idx);
                    ImportDesc::Func(type_idx)
                }
                ExternKind::Table => ImportDesc::Table(read_table_type(it)?),
                ExternKind::Memory => {
                    if self.has_memory() { return Err(Error::malformed(MULTIPLE_MEMORIES)); }
                    ImportDesc::Memory(read_memory_limits(it)?)
                }
                ExternKind::Global => ImportDesc::Global(read_global_type(it)?),
                ExternKind::Tag => ImportDesc::Tag(read_tag_type(it, &self.types)?),
            };
            self.imports.push(Import { module, field, desc });
        }
        Ok(())
    }

    fn read_function_section(&mut self, it: &mut ByteIter) -> Result<u32, Error> {
        let n_functions = it.read_u32()?;
        for _ in 0..n_functions {
            let type_idx = it.read_u32()?;
            if type_idx as usize >= self.types.len() { return Err(Error::malformed(UNKNOWN_TYPE)); }
            self.func_types.push(type_idx);
        }
        Ok(n_functions)
    }

    fn read_table_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_tables = it.read_u32()?;
        for _ in 0..n_tables {
            self.tables.push(read_table_type(it)?);
        }
        Ok(())
    }

    fn read_memory_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_memories = it.read_u32()?;
        for _ in 0..n_memories {
            if self.has_memory() { return Err(Error::malformed(MULTIPLE_MEMORIES)); }
            self.memory = Some(read_memory_limits(it)?);
        }
        Ok(())
    }

    fn read_tag_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_tags = it.read_u32()?;
        for _ in 0..n_tags {
            self.tags.push(read_tag_type(it, &self.types)?);
        }
        Ok(())
    }

    fn read_global_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_globals = it.read_u32()?;
        for _ in 0..n_globals {
            let ty = read_global_type(it)?;
            let init = read_const_expr(it)?;
            self.globals.push(GlobalDef { ty, init });
        }
        Ok(())
    }

    fn read_export_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_exports = it.read_u32()?;
        for _ in 0..n_exports {
            let name = it.read_name()?;
            let kind = ExternKind::from_byte(it.read_u8()?).ok_or(Error::malformed(MALFORMED_IMPORT_KIND))?;
            let idx = it.read_u32()?;
            let in_range = match kind {
                ExternKind::Func => (idx as usize) < self.num_funcs(),
                ExternKind::Table => (idx as usize) < self.num_tables(),
                ExternKind::Memory => idx == 0 && self.has_memory(),
                ExternKind::Global => (idx as usize) < self.num_globals(),
                ExternKind::Tag => (idx as usize) < self.num_tags(),
            };
            if !in_range {
                return Err(Error::malformed(match kind {
                    ExternKind::Func => UNKNOWN_FUNC,
                    ExternKind::Table => UNKNOWN_TABLE,
                    ExternKind::Memory => UNKNOWN_MEMORY,
                    ExternKind::Global => UNKNOWN_GLOBAL,
                    ExternKind::Tag => UNKNOWN_TAG,
                }));
            }
            if self.exports.insert(name, Export { kind, idx }).is_some() {
                return Err(Error::malformed(DUPLICATE_EXPORT_NAME));
            }
        }
        Ok(())
    }

    fn read_start_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let start = it.read_u32()?;
        if start as usize >= self.num_funcs() { return Err(Error::malformed(UNKNOWN_FUNC)); }
        self.start = Some(start);
        Ok(())
    }

    fn read_element_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_segments = it.read_u32()?;
        for _ in 0..n_segments {
            let flags = it.read_u32()?;
            if flags > 7 { return Err(Error::malformed(MALFORMED_ELEM_KIND)); }
            // bit 0: passive/declarative, bit 1: explicit table or declarative, bit 2: expressions
            let mode = match flags & 0b011 {
                0b000 => SegmentMode::Active { index: 0, offset: read_const_expr(it)? },
                0b010 => {
                    let index = it.read_u32()?;
                    SegmentMode::Active { index, offset: read_const_expr(it)? }
                }
                0b001 => SegmentMode::Passive,
                _ => SegmentMode::Declarative,
            };
            let uses_exprs = flags & 0b100 != 0;
            let elem_type = if flags & 0b011 == 0 {
                ValType::FuncRef
            } else if uses_exprs {
                read_ref_type(it)?
            } else {
                if it.read_u8()? != 0x00 { return Err(Error::malformed(MALFORMED_ELEM_KIND)); }
                ValType::FuncRef
            };
            let n_items = it.read_u32()?;
            let mut items = Vec::with_capacity(n_items.min(4096) as usize);
            for _ in 0..n_items {
                if uses_exprs {
                    items.push(read_const_expr(it)?);
                } else {
                    items.push(vec![Instr::RefFunc(it.read_u32()?)]);
                }
            }
            self.elements.push(ElementSegment { elem_type, mode, items });
        }
        Ok(())
    }

    fn read_code_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_bodies = it.read_u32()?;
        let n_imported = self.num_imported_funcs();
        if n_imported + n_bodies as usize != self.func_types.len() {
            return Err(Error::malformed(FUNC_CODE_INCONSISTENT));
        }
        for i in 0..n_bodies as usize {
            let size = it.read_u32()? as usize;
            if !it.has_n_left(size) { return Err(Error::malformed(UNEXPECTED_END)); }
            let end = it.cur() + size;
            // the body reader cannot see past its declared size
            let mut body_it = ByteIter::new(&it.bytes[..end], it.cur());
            let type_idx = self.func_types[n_imported + i];
            let body = read_function_body(&mut body_it, &self.types, type_idx, self.num_funcs())?;
            if body_it.cur() != end { return Err(Error::malformed(SECTION_SIZE_MISMATCH)); }
            it.idx = end;
            self.bodies.push(Rc::new(body));
        }
        Ok(())
    }

    fn read_data_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_segments = it.read_u32()?;
        for _ in 0..n_segments {
            let mode = match it.read_u32()? {
                0 => SegmentMode::Active { index: 0, offset: read_const_expr(it)? },
                1 => SegmentMode::Passive,
                2 => {
                    let index = it.read_u32()?;
                    SegmentMode::Active { index, offset: read_const_expr(it)? }
                }
                _ => return Err(Error::malformed(MALFORMED_DATA_FLAG)),
            };
            if matches!(mode, SegmentMode::Active { .. }) && !self.has_memory() {
                return Err(Error::malformed(UNKNOWN_MEMORY));
            }
            let len = it.read_u32()? as usize;
            let data = it.read_bytes(len)?.to_vec();
            self.data.push(DataSegment { mode, data });
        }
        Ok(())
    }
}

// ---------------- Helper Functions ----------------
fn skip_custom_sections(it: &mut ByteIter) -> Result<(), Error> {
    while !it.empty() && it.peek_u8()? == 0 {
        it.advance(1);
        let len = it.read_u32()? as usize;
        let start = it.cur();
        if !it.has_n_left(len) { return Err(Error::malformed(UNEXPECTED_END)); }
        it.read_name()?;
        if it.cur() > start + len { return Err(Error::malformed(UNEXPECTED_END)); }
        it.idx = start + len;
    }
    Ok(())
}

fn section<F>(it: &mut ByteIter, id: u8, mut reader: F) -> Result<(), Error>
where
    F: FnMut(&mut ByteIter) -> Result<(), Error>,
{
    if !it.empty() && it.peek_u8()? == id {
        it.advance(1);
        let section_length = it.read_u32()? as usize;
        let section_start = it.cur();
        if !it.has_n_left(section_length) {
            return Err(Error::malformed(UNEXPECTED_END));
        }
        let mut inner = ByteIter::new(&it.bytes[..section_start + section_length], section_start);
        reader(&mut inner)?;
        if inner.cur() != section_start + section_length {
            return Err(Error::malformed(SECTION_SIZE_MISMATCH));
        }
        it.idx = inner.cur();
    } else if !it.empty() && it.peek_u8()? > 13 {
        return Err(Error::malformed(INVALID_SECTION_ID));
    }
    skip_custom_sections(it)
}

fn read_val_type(it: &mut ByteIter) -> Result<ValType, Error> {
    ValType::from_byte(it.read_u8()?).ok_or(Error::malformed(INVALID_VALUE_TYPE))
}

fn read_val_types(it: &mut ByteIter) -> Result<Vec<ValType>, Error> {
    let n = it.read_u32()?;
    (0..n).map(|_| read_val_type(it)).collect()
}

fn read_ref_type(it: &mut ByteIter) -> Result<ValType, Error> {
    match ValType::from_byte(it.read_u8()?) {
        Some(t) if t.is_ref() => Ok(t),
        _ => Err(Error::malformed(MALFORMED_REF_TYPE)),
    }
}

/// Attribute byte (0 is the only exception attribute) and payload type index.
fn read_tag_type(it: &mut ByteIter, types: &[FuncType]) -> Result<u32, Error> {
    if it.read_u8()? != 0 { return Err(Error::malformed(MALFORMED_TAG_ATTRIBUTE)); }
    let type_idx = it.read_u32()?;
    match types.get(type_idx as usize) {
        Some(ty) if ty.results.is_empty() => Ok(type_idx),
        Some(_) => Err(Error::malformed(MALFORMED_TAG_ATTRIBUTE)),
        None => Err(Error::malformed(UNKNOWN_TYPE)),
    }
}

fn read_global_type(it: &mut ByteIter) -> Result<GlobalType, Error> {
    let ty = read_val_type(it)?;
    let mutable = match it.read_u8()? {
        0 => false,
        1 => true,
        _ => return Err(Error::malformed(MALFORMED_MUTABILITY)),
    };
    Ok(GlobalType { ty, mutable })
}

/// Returns (initial, maximum, shared).
fn get_limits(it: &mut ByteIter, allow_shared: bool) -> Result<(u32, Option<u32>, bool), Error> {
    let flags = it.read_u8()?;
    let (has_max, shared) = match flags {
        0 => (false, false),
        1 => (true, false),
        2 if allow_shared => (false, true),
        3 if allow_shared => (true, true),
        _ => return Err(Error::malformed(MALFORMED_LIMITS)),
    };
    let initial = it.read_u32()?;
    let maximum = if has_max { Some(it.read_u32()?) } else { None };
    if maximum.is_some_and(|max| max < initial) {
        return Err(Error::malformed(SIZE_MIN_GREATER_THAN_MAX));
    }
    Ok((initial, maximum, shared))
}

fn read_memory_limits(it: &mut ByteIter) -> Result<MemoryLimits, Error> {
    let (initial, maximum, shared) = get_limits(it, true)?;
    if initial > MAX_PAGES || maximum.is_some_and(|m| m > MAX_PAGES) {
        return Err(Error::malformed(MEMORY_SIZE_LIMIT));
    }
    Ok(MemoryLimits { initial, maximum: maximum.unwrap_or(MAX_PAGES), shared })
}

fn read_table_type(it: &mut ByteIter) -> Result<TableType, Error> {
    let elem_type = read_ref_type(it)?;
    let (initial, maximum, _) = get_limits(it, false)?;
    Ok(TableType { elem_type, initial, maximum })
}

fn read_const_expr(it: &mut ByteIter) -> Result<ConstExpr, Error> {
    let mut expr = Vec::new();
    loop {
        let instr = match it.read_u8()? {
            0x0b => return Ok(expr),
            0x41 => Instr::I32Const(it.read_i32()?),
            0x42 => Instr::I64Const(it.read_i64()?),
            0x43 => Instr::F32Const(u32::from_le_bytes(it.read_array()?)),
            0x44 => Instr::F64Const(u64::from_le_bytes(it.read_array()?)),
            0x23 => Instr::GlobalGet(it.read_u32()?),
            0xd0 => Instr::RefNull(read_ref_type(it)?),
            0xd2 => Instr::RefFunc(it.read_u32()?),
            0x6a => Instr::I32Add,
            0x6b => Instr::I32Sub,
            0x6c => Instr::I32Mul,
            0x7c => Instr::I64Add,
            0x7d => Instr::I64Sub,
            0x7e => Instr::I64Mul,
            0xfd => return Err(Error::malformed(SIMD_UNSUPPORTED)),
            _ => return Err(Error::malformed(CONST_EXP_REQUIRED)),
        };
        expr.push(instr);
    }
}

fn read_block_type(it: &mut ByteIter) -> Result<BlockType, Error> {
    let byte = it.peek_u8()?;
    if byte == 0x40 {
        it.advance(1);
        return Ok(BlockType::Empty);
    }
    if let Some(t) = ValType::from_byte(byte) {
        it.advance(1);
        return Ok(BlockType::Value(t));
    }
    let idx = it.read_i33()?;
    u32::try_from(idx).map(BlockType::Type).map_err(|_| Error::malformed(INVALID_VALUE_TYPE))
}

fn read_memarg(it: &mut ByteIter) -> Result<MemArg, Error> {
    let align = it.read_u32()?;
    let offset = it.read_u32()?;
    Ok(MemArg::new(align, offset))
}

/// One `try_table` clause: kind byte, tag index for the tagged kinds, then a label.
fn read_catch(it: &mut ByteIter) -> Result<(CatchKind, u32), Error> {
    let kind = match it.read_u8()? {
        0x00 => CatchKind::Tag(it.read_u32()?),
        0x01 => CatchKind::TagRef(it.read_u32()?),
        0x02 => CatchKind::All,
        0x03 => CatchKind::AllRef,
        _ => return Err(Error::malformed(ILLEGAL_OP)),
    };
    Ok((kind, it.read_u32()?))
}

fn expect_zero(it: &mut ByteIter) -> Result<(), Error> {
    if it.read_u8()? != 0 { return Err(Error::malformed(ZERO_FLAG_EXPECTED)); }
    Ok(())
}

fn read_function_body(it: &mut ByteIter, types: &[FuncType], type_idx: u32, n_funcs: usize) -> Result<FunctionBody, Error> {
    let mut locals = Vec::new();
    let mut total: u64 = 0;
    let n_decls = it.read_u32()?;
    for _ in 0..n_decls {
        let n = it.read_u32()?;
        total += n as u64;
        if total > Module::MAX_LOCALS { return Err(Error::malformed(TOO_MANY_LOCALS)); }
        let ty = read_val_type(it)?;
        locals.extend(std::iter::repeat(ty).take(n as usize));
    }
    let func_ty = types.get(type_idx as usize).ok_or(Error::malformed(UNKNOWN_TYPE))?;
    let mut b = CodeBuilder::new(types, func_ty, &locals);
    while !b.is_done() {
        read_instr(it, &mut b, n_funcs)?;
    }
    Ok(FunctionBody { type_idx, locals, code: b.finish()? })
}

fn read_instr(it: &mut ByteIter, b: &mut CodeBuilder, n_funcs: usize) -> Result<(), Error> {
    let op = it.read_u8()?;
    let func_idx = |it: &mut ByteIter| -> Result<u32, Error> {
        let idx = it.read_u32()?;
        if idx as usize >= n_funcs { return Err(Error::malformed(UNKNOWN_FUNC)); }
        Ok(idx)
    };
    match op {
        0x00 => { b.push(Instr::Unreachable); }
        0x01 => { b.push(Instr::Nop); }
        0x02 => { b.block(read_block_type(it)?)?; }
        0x03 => { b.loop_(read_block_type(it)?)?; }
        0x04 => { b.if_(read_block_type(it)?)?; }
        0x05 => { b.else_()?; }
        0x08 => { b.push(Instr::Throw(it.read_u32()?)); }
        0x0a => { b.push(Instr::ThrowRef); }
        0x0b => { b.end()?; }
        0x0c => { b.br(it.read_u32()?)?; }
        0x0d => { b.br_if(it.read_u32()?)?; }
        0x0e => {
            let n = it.read_u32()?;
            let targets = (0..n).map(|_| it.read_u32()).collect::<Result<Vec<_>, _>>()?;
            b.br_table(&targets, it.read_u32()?)?;
        }
        0x0f => { b.push(Instr::Return); }
        0x10 => { b.push(Instr::Call(func_idx(it)?)); }
        0x11 => {
            let type_idx = it.read_u32()?;
            b.push(Instr::CallIndirect { type_idx, table: it.read_u32()? });
        }
        0x12 => { b.push(Instr::ReturnCall(func_idx(it)?)); }
        0x13 => {
            let type_idx = it.read_u32()?;
            b.push(Instr::ReturnCallIndirect { type_idx, table: it.read_u32()? });
        }
        0x1f => {
            let bt = read_block_type(it)?;
            let n = it.read_u32()?;
            let catches = (0..n).map(|_| read_catch(it)).collect::<Result<Vec<_>, _>>()?;
            b.try_table(bt, &catches)?;
        }
        0x1a => { b.push(Instr::Drop); }
        0x1b => { b.push(Instr::Select); }
        0x1c => {
            let types = read_val_types(it)?;
            let [ty] = types[..] else { return Err(Error::malformed(INVALID_VALUE_TYPE)) };
            b.push(Instr::SelectT(ty));
        }
        0x20 => { b.local_get(it.read_u32()?)?; }
        0x21 => { b.local_set(it.read_u32()?)?; }
        0x22 => { b.local_tee(it.read_u32()?)?; }
        0x23 => { b.push(Instr::GlobalGet(it.read_u32()?)); }
        0x24 => { b.push(Instr::GlobalSet(it.read_u32()?)); }
        0x25 => { b.push(Instr::TableGet(it.read_u32()?)); }
        0x26 => { b.push(Instr::TableSet(it.read_u32()?)); }
        0x28..=0x3e => {
            let m = read_memarg(it)?;
            b.push(Instr::memory(op, m).ok_or(Error::malformed(ILLEGAL_OP))?);
        }
        0x3f => { expect_zero(it)?; b.push(Instr::MemorySize); }
        0x40 => { expect_zero(it)?; b.push(Instr::MemoryGrow); }
        0x41 => { b.push(Instr::I32Const(it.read_i32()?)); }
        0x42 => { b.push(Instr::I64Const(it.read_i64()?)); }
        0x43 => { b.push(Instr::F32Const(u32::from_le_bytes(it.read_array()?))); }
        0x44 => { b.push(Instr::F64Const(u64::from_le_bytes(it.read_array()?))); }
        0x45..=0xc4 => { b.push(Instr::plain(op).ok_or(Error::malformed(ILLEGAL_OP))?); }
        0xd0 => { b.push(Instr::RefNull(read_ref_type(it)?)); }
        0xd1 => { b.push(Instr::RefIsNull); }
        0xd2 => { b.push(Instr::RefFunc(func_idx(it)?)); }
        0xfc => {
            let instr = match it.read_u32()? {
                sub @ 0..=7 => Instr::trunc_sat(sub).ok_or(Error::malformed(ILLEGAL_OP))?,
                8 => {
                    let seg = it.read_u32()?;
                    expect_zero(it)?;
                    Instr::MemoryInit(seg)
                }
                9 => Instr::DataDrop(it.read_u32()?),
                10 => {
                    expect_zero(it)?;
                    expect_zero(it)?;
                    Instr::MemoryCopy
                }
                11 => {
                    expect_zero(it)?;
                    Instr::MemoryFill
                }
                12 => {
                    let elem = it.read_u32()?;
                    Instr::TableInit { elem, table: it.read_u32()? }
                }
                13 => Instr::ElemDrop(it.read_u32()?),
                14 => {
                    let dst = it.read_u32()?;
                    Instr::TableCopy { dst, src: it.read_u32()? }
                }
                15 => Instr::TableGrow(it.read_u32()?),
                16 => Instr::TableSize(it.read_u32()?),
                17 => Instr::TableFill(it.read_u32()?),
                _ => return Err(Error::malformed(ILLEGAL_OP)),
            };
            b.push(instr);
        }
        0xfd => return Err(Error::malformed(SIMD_UNSUPPORTED)),
        0xfe => {
            let instr = match it.read_u32()? {
                0x00 => Instr::AtomicNotify(read_memarg(it)?),
                0x01 => Instr::AtomicWait32(read_memarg(it)?),
                0x02 => Instr::AtomicWait64(read_memarg(it)?),
                0x03 => {
                    expect_zero(it)?;
                    Instr::AtomicFence
                }
                sub => {
                    let m = read_memarg(it)?;
                    Instr::atomic(sub, m).ok_or(Error::malformed(ILLEGAL_OP))?
                }
            };
            b.push(instr);
        }
        _ => return Err(Error::malformed(ILLEGAL_OP)),
    }
    Ok(())
}
