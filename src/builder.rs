use std::rc::Rc;

use crate::error::*;
use crate::instruction::{BrTarget, CatchKind, Handler, Instr};
use crate::module::*;
use crate::signature::{BlockType, FuncType};
use crate::value::ValType;
use crate::wasm_memory::MemoryLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelKind {
    Func,
    Block,
    Loop,
    If,
    Try,
}

#[derive(Debug)]
struct Label {
    kind: LabelKind,
    /// Index of the opening instruction.
    start: usize,
    else_at: Option<usize>,
    /// Forward branches waiting for this label's `End`: (instruction, br_table slot).
    fixups: Vec<(usize, Option<usize>)>,
}

/// Linearizes structured code, resolving every branch to an instruction index.
pub struct CodeBuilder<'a> {
    types: &'a [FuncType],
    local_slots: Vec<(u32, ValType)>,
    code: Vec<Instr>,
    labels: Vec<Label>,
    done: bool,
}

impl<'a> CodeBuilder<'a> {
    pub fn new(types: &'a [FuncType], func_ty: &FuncType, locals: &[ValType]) -> Self {
        let mut next = 0u32;
        let local_slots = func_ty
            .params
            .iter()
            .chain(locals)
            .map(|&ty| {
                let slot = next;
                next += ty.words() as u32;
                (slot, ty)
            })
            .collect();
        Self {
            types,
            local_slots,
            code: Vec::new(),
            labels: vec![Label { kind: LabelKind::Func, start: 0, else_at: None, fixups: Vec::new() }],
            done: false,
        }
    }

    /// True once the function's closing `end` has been emitted.
    pub fn is_done(&self) -> bool { self.done }

    pub fn push(&mut self, instr: Instr) -> &mut Self {
        self.code.push(instr);
        self
    }

    fn open(&mut self, kind: LabelKind, bt: BlockType) -> Result<&mut Self, Error> {
        let arity = bt.arity(self.types).ok_or(Error::malformed(UNKNOWN_TYPE))?;
        let start = self.code.len();
        self.code.push(match kind {
            LabelKind::Loop => Instr::Loop(arity),
            LabelKind::If => Instr::If { arity, else_pc: 0, end_pc: 0 },
            _ => Instr::Block(arity),
        });
        self.labels.push(Label { kind, start, else_at: None, fixups: Vec::new() });
        Ok(self)
    }

    pub fn block(&mut self, bt: BlockType) -> Result<&mut Self, Error> { self.open(LabelKind::Block, bt) }
    pub fn loop_(&mut self, bt: BlockType) -> Result<&mut Self, Error> { self.open(LabelKind::Loop, bt) }
    pub fn if_(&mut self, bt: BlockType) -> Result<&mut Self, Error> { self.open(LabelKind::If, bt) }

    /// Opens a `try_table`. Catch labels count from outside the try region.
    pub fn try_table(&mut self, bt: BlockType, catches: &[(CatchKind, u32)]) -> Result<&mut Self, Error> {
        let arity = bt.arity(self.types).ok_or(Error::malformed(UNKNOWN_TYPE))?;
        let at = self.code.len();
        let handlers = catches
            .iter()
            .enumerate()
            .map(|(i, &(kind, depth))| Ok(Handler { kind, target: self.target(depth, at, Some(i))? }))
            .collect::<Result<Box<[_]>, Error>>()?;
        self.code.push(Instr::TryTable { arity, handlers });
        self.labels.push(Label { kind: LabelKind::Try, start: at, else_at: None, fixups: Vec::new() });
        Ok(self)
    }

    pub fn else_(&mut self) -> Result<&mut Self, Error> {
        let at = self.code.len();
        match self.labels.last_mut() {
            Some(label) if label.kind == LabelKind::If && label.else_at.is_none() => label.else_at = Some(at),
            _ => return Err(Error::malformed(UNBALANCED_ELSE)),
        }
        self.code.push(Instr::Else { end_pc: 0 });
        Ok(self)
    }

    pub fn end(&mut self) -> Result<&mut Self, Error> {
        let label = self.labels.pop().ok_or(Error::malformed(UNBALANCED_END))?;
        let end_pc = self.code.len() as u32;
        self.code.push(Instr::End);
        if label.kind == LabelKind::If {
            let else_target = label.else_at.map_or(end_pc, |e| e as u32 + 1);
            if let Instr::If { else_pc, end_pc: end, .. } = &mut self.code[label.start] {
                *else_pc = else_target;
                *end = end_pc;
            }
            if let Some(Instr::Else { end_pc: end }) = label.else_at.map(|e| &mut self.code[e]) {
                *end = end_pc;
            }
        }
        for (at, slot) in label.fixups {
            match (&mut self.code[at], slot) {
                (Instr::Br(t) | Instr::BrIf(t), None) => t.pc = end_pc,
                (Instr::BrTable(targets), Some(i)) => targets[i].pc = end_pc,
                (Instr::TryTable { handlers, .. }, Some(i)) => handlers[i].target.pc = end_pc,
                _ => {}
            }
        }
        if label.kind == LabelKind::Func {
            self.done = true;
        }
        Ok(self)
    }

    fn target(&mut self, depth: u32, at: usize, slot: Option<usize>) -> Result<BrTarget, Error> {
        let idx = self
            .labels
            .len()
            .checked_sub(depth as usize + 1)
            .ok_or(Error::malformed(UNKNOWN_LABEL))?;
        let label = &mut self.labels[idx];
        let pc = if label.kind == LabelKind::Loop {
            label.start as u32 + 1
        } else {
            label.fixups.push((at, slot));
            0
        };
        Ok(BrTarget { depth, pc })
    }

    pub fn br(&mut self, depth: u32) -> Result<&mut Self, Error> {
        let t = self.target(depth, self.code.len(), None)?;
        Ok(self.push(Instr::Br(t)))
    }

    pub fn br_if(&mut self, depth: u32) -> Result<&mut Self, Error> {
        let t = self.target(depth, self.code.len(), None)?;
        Ok(self.push(Instr::BrIf(t)))
    }

    pub fn br_table(&mut self, depths: &[u32], default: u32) -> Result<&mut Self, Error> {
        let at = self.code.len();
        let targets = depths
            .iter()
            .chain(std::iter::once(&default))
            .enumerate()
            .map(|(i, &d)| self.target(d, at, Some(i)))
            .collect::<Result<Box<[_]>, _>>()?;
        Ok(self.push(Instr::BrTable(targets)))
    }

    fn local(&self, idx: u32) -> Result<(u32, bool), Error> {
        let &(slot, ty) = self.local_slots.get(idx as usize).ok_or(Error::malformed(UNKNOWN_LOCAL))?;
        Ok((slot, ty == ValType::V128))
    }

    pub fn local_get(&mut self, idx: u32) -> Result<&mut Self, Error> {
        let (slot, wide) = self.local(idx)?;
        Ok(self.push(if wide { Instr::LocalGet128(slot) } else { Instr::LocalGet(slot) }))
    }

    pub fn local_set(&mut self, idx: u32) -> Result<&mut Self, Error> {
        let (slot, wide) = self.local(idx)?;
        Ok(self.push(if wide { Instr::LocalSet128(slot) } else { Instr::LocalSet(slot) }))
    }

    pub fn local_tee(&mut self, idx: u32) -> Result<&mut Self, Error> {
        let (slot, wide) = self.local(idx)?;
        Ok(self.push(if wide { Instr::LocalTee128(slot) } else { Instr::LocalTee(slot) }))
    }

    pub fn finish(self) -> Result<Vec<Instr>, Error> {
        if !self.done {
            return Err(Error::malformed(END_EXPECTED));
        }
        Ok(self.code)
    }
}

/// Builds a [`Module`] in code instead of decoding one.
///
/// Imports should be declared before the functions, tables and globals they
/// shift in the index space.
#[derive(Default)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new() -> Self { Self::default() }

    /// Interns a function type, returning its index.
    pub fn ty(&mut self, ty: FuncType) -> u32 {
        match self.module.types.iter().position(|t| *t == ty) {
            Some(i) => i as u32,
            None => {
                self.module.types.push(ty);
                self.module.types.len() as u32 - 1
            }
        }
    }

    fn import(&mut self, module: &str, field: &str, desc: ImportDesc) {
        self.module.imports.push(Import { module: module.into(), field: field.into(), desc });
    }

    pub fn import_func(&mut self, module: &str, field: &str, ty: FuncType) -> u32 {
        let type_idx = self.ty(ty);
        let idx = self.module.num_imported_funcs();
        self.import(module, field, ImportDesc::Func(type_idx));
        self.module.func_types.insert(idx, type_idx);
        idx as u32
    }

    pub fn import_table(&mut self, module: &str, field: &str, ty: TableType) -> u32 {
        let idx = self.module.imports.iter().filter(|i| matches!(i.desc, ImportDesc::Table(_))).count();
        self.import(module, field, ImportDesc::Table(ty));
        idx as u32
    }

    pub fn import_memory(&mut self, module: &str, field: &str, limits: MemoryLimits) {
        self.import(module, field, ImportDesc::Memory(limits));
    }

    pub fn import_global(&mut self, module: &str, field: &str, ty: GlobalType) -> u32 {
        let idx = self.module.num_imported_globals();
        self.import(module, field, ImportDesc::Global(ty));
        idx as u32
    }

    pub fn import_tag(&mut self, module: &str, field: &str, ty: FuncType) -> u32 {
        let type_idx = self.ty(ty);
        let idx = self.module.num_imported_tags();
        self.import(module, field, ImportDesc::Tag(type_idx));
        idx as u32
    }

    /// Index the next defined function will receive.
    pub fn next_func_index(&self) -> u32 { self.module.func_types.len() as u32 }

    /// Adds a function; `body` emits everything but the closing `end`.
    pub fn func(
        &mut self,
        ty: FuncType,
        locals: &[ValType],
        body: impl FnOnce(&mut CodeBuilder) -> Result<(), Error>,
    ) -> Result<u32, Error> {
        let type_idx = self.ty(ty);
        let code = {
            let types = &self.module.types;
            let mut b = CodeBuilder::new(types, &types[type_idx as usize], locals);
            body(&mut b)?;
            b.end()?;
            b.finish()?
        };
        let idx = self.next_func_index();
        self.module.func_types.push(type_idx);
        self.module.bodies.push(Rc::new(FunctionBody { type_idx, locals: locals.to_vec(), code }));
        Ok(idx)
    }

    pub fn table(&mut self, ty: TableType) -> u32 {
        let imported = self.module.imports.iter().filter(|i| matches!(i.desc, ImportDesc::Table(_))).count();
        self.module.tables.push(ty);
        (imported + self.module.tables.len() - 1) as u32
    }

    pub fn memory(&mut self, limits: MemoryLimits) { self.module.memory = Some(limits); }

    pub fn global(&mut self, ty: GlobalType, init: ConstExpr) -> u32 {
        self.module.globals.push(GlobalDef { ty, init });
        (self.module.num_imported_globals() + self.module.globals.len() - 1) as u32
    }

    /// Adds a tag whose payload is `ty`'s params.
    pub fn tag(&mut self, ty: FuncType) -> u32 {
        let type_idx = self.ty(ty);
        self.module.tags.push(type_idx);
        (self.module.num_imported_tags() + self.module.tags.len() - 1) as u32
    }

    pub fn export(&mut self, name: &str, kind: ExternKind, idx: u32) -> &mut Self {
        self.module.exports.insert(name.into(), Export { kind, idx });
        self
    }

    pub fn start(&mut self, func_idx: u32) { self.module.start = Some(func_idx); }

    pub fn element(&mut self, segment: ElementSegment) -> u32 {
        self.module.elements.push(segment);
        self.module.elements.len() as u32 - 1
    }

    pub fn data(&mut self, segment: DataSegment) -> u32 {
        self.module.data.push(segment);
        self.module.data.len() as u32 - 1
    }

    pub fn build(self) -> Rc<Module> { Rc::new(self.module) }
}
