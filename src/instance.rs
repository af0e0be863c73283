use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nohash_hasher::IntMap;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::*;
use crate::exception::Tag;
use crate::instruction::Instr;
use crate::interpreter::Machine;
use crate::module::*;
use crate::signature::FuncType;
use crate::value::{ValType, Value, Word, REF_NULL};
use crate::wasm_memory::Memory;
use crate::wasm_table::{pack_funcref, Table, MAX_TABLE_SIZE};

/// Thread-unique identity of an instance; never 0.
pub type InstanceId = u32;

pub type HostFn = dyn Fn(&Instance, &[Value]) -> Result<Vec<Value>, Error>;

#[derive(Clone)]
pub enum RuntimeFunction {
    Wasm {
        ty: FuncType,
        body: Rc<FunctionBody>,
    },
    /// A function that lives in another instance's index space.
    Imported {
        ty: FuncType,
        owner: Weak<Instance>,
        index: u32,
    },
    Host {
        ty: FuncType,
        callback: Rc<HostFn>,
    },
}

impl RuntimeFunction {
    pub fn host(
        params: impl Into<Vec<ValType>>,
        results: impl Into<Vec<ValType>>,
        callback: impl Fn(&Instance, &[Value]) -> Result<Vec<Value>, Error> + 'static,
    ) -> Self {
        RuntimeFunction::Host { ty: FuncType::new(params, results), callback: Rc::new(callback) }
    }

    pub fn ty(&self) -> &FuncType {
        match self {
            RuntimeFunction::Wasm { ty, .. } | RuntimeFunction::Imported { ty, .. } | RuntimeFunction::Host { ty, .. } => ty,
        }
    }
}

impl Debug for RuntimeFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            RuntimeFunction::Wasm { .. } => "wasm",
            RuntimeFunction::Imported { .. } => "imported",
            RuntimeFunction::Host { .. } => "host",
        };
        write!(f, "{kind} function {}", self.ty())
    }
}

/// A global cell. v128 values use both words.
#[derive(Debug)]
pub struct Global {
    ty: GlobalType,
    lo: Cell<u64>,
    hi: Cell<u64>,
}

impl Global {
    pub fn new(ty: GlobalType, value: Value) -> Result<Self, Error> {
        if value.ty() != ty.ty {
            return Err(Error::trap(TYPE_MISMATCH));
        }
        let (lo, hi) = value.to_words();
        Ok(Self { ty, lo: Cell::new(lo), hi: Cell::new(hi) })
    }

    pub fn ty(&self) -> GlobalType { self.ty }

    pub fn get(&self) -> Value { Value::from_words(self.ty.ty, self.lo.get(), self.hi.get()) }

    pub fn set(&self, value: Value) -> Result<(), Error> {
        if !self.ty.mutable {
            return Err(Error::trap(GLOBAL_IS_IMMUTABLE));
        }
        if value.ty() != self.ty.ty {
            return Err(Error::trap(TYPE_MISMATCH));
        }
        let (lo, hi) = value.to_words();
        self.set_words(lo, hi);
        Ok(())
    }

    #[inline]
    pub(crate) fn words(&self) -> (u64, u64) { (self.lo.get(), self.hi.get()) }

    #[inline]
    pub(crate) fn set_words(&self, lo: u64, hi: u64) {
        self.lo.set(lo);
        self.hi.set(hi);
    }
}

#[derive(Debug, Clone)]
pub enum ExportValue {
    Function(RuntimeFunction),
    Table(Rc<RefCell<Table>>),
    Memory(Arc<Memory>),
    Global(Rc<Global>),
    Tag(Arc<Tag>),
}

pub type ModuleImports = HashMap<String, ExportValue>;
pub type Imports = HashMap<String, ModuleImports>;

/// Cooperative cancellation for every call running through one instance.
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// The next call entry or loop back-edge fails with [`Error::Interrupted`].
    pub fn interrupt(&self) { self.0.store(true, Ordering::Release); }
}

#[derive(Default)]
struct InstanceRegistry {
    next_id: InstanceId,
    live: IntMap<InstanceId, Weak<Instance>>,
    /// Failed instances whose functions may still be referenced from an imported table.
    retained: IntMap<InstanceId, Rc<Instance>>,
}

thread_local! {
    static REGISTRY: RefCell<InstanceRegistry> = RefCell::new(InstanceRegistry { next_id: 1, ..Default::default() });
}

impl InstanceRegistry {
    fn with<R>(f: impl FnOnce(&mut InstanceRegistry) -> R) -> R { REGISTRY.with(|r| f(&mut r.borrow_mut())) }

    fn allocate_id(&mut self) -> InstanceId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn get(&self, id: InstanceId) -> Option<Rc<Instance>> {
        if let Some(inst) = self.retained.get(&id) {
            return Some(inst.clone());
        }
        self.live.get(&id).and_then(Weak::upgrade)
    }
}

pub struct Instance {
    id: InstanceId,
    module: Rc<Module>,
    config: Config,
    functions: Vec<RuntimeFunction>,
    tables: Vec<Rc<RefCell<Table>>>,
    memory: Option<Arc<Memory>>,
    globals: Vec<Rc<Global>>,
    tags: Vec<Arc<Tag>>,
    /// Evaluated element segments; a dropped segment is empty.
    elements: RefCell<Vec<Rc<[u64]>>>,
    dropped_data: Vec<Cell<bool>>,
    interrupt: Arc<AtomicBool>,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("functions", &self.functions.len())
            .field("tables", &self.tables.len())
            .field("memory", &self.memory.as_ref().map(|m| m.pages()))
            .field("tags", &self.tags.len())
            .finish()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // the registry may already be torn down at thread exit
        let _ = REGISTRY.try_with(|r| {
            if let Ok(mut r) = r.try_borrow_mut() {
                r.live.remove(&self.id);
            }
        });
    }
}

/// Stack encoding of a reference to function `idx` of an instance, following
/// imports to the instance that defines it.
fn func_ref_word(id: InstanceId, functions: &[RuntimeFunction], idx: u32) -> Result<u64, Error> {
    match functions.get(idx as usize) {
        Some(RuntimeFunction::Imported { owner, index, .. }) => match owner.upgrade() {
            Some(owner) => owner.func_ref_word(*index),
            None => Ok(pack_funcref(id, idx)),
        },
        Some(_) => Ok(pack_funcref(id, idx)),
        None => Err(Error::trap(UNKNOWN_FUNC)),
    }
}

/// Evaluates a constant expression to its value words.
fn eval_const(
    expr: &[Instr],
    globals: &[Rc<Global>],
    func_word: &dyn Fn(u32) -> Result<u64, Error>,
) -> Result<Vec<u64>, Error> {
    let mut stack: Vec<u64> = Vec::with_capacity(2);
    let pop = |stack: &mut Vec<u64>| stack.pop().ok_or_else(|| Error::trap(STACK_UNDERFLOW));
    for instr in expr {
        match *instr {
            Instr::I32Const(v) => stack.push(Word::from_i32(v).0),
            Instr::I64Const(v) => stack.push(v as u64),
            Instr::F32Const(bits) => stack.push(bits as u64),
            Instr::F64Const(bits) => stack.push(bits),
            Instr::RefNull(_) => stack.push(REF_NULL),
            Instr::RefFunc(idx) => stack.push(func_word(idx)?),
            Instr::GlobalGet(idx) => {
                let g = globals.get(idx as usize).ok_or(Error::malformed(UNKNOWN_GLOBAL))?;
                let (lo, hi) = g.words();
                stack.push(lo);
                if g.ty().ty == ValType::V128 {
                    stack.push(hi);
                }
            }
            Instr::I32Add | Instr::I32Sub | Instr::I32Mul => {
                let b = Word(pop(&mut stack)?).as_i32();
                let a = Word(pop(&mut stack)?).as_i32();
                let r = match instr {
                    Instr::I32Add => a.wrapping_add(b),
                    Instr::I32Sub => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                };
                stack.push(Word::from_i32(r).0);
            }
            Instr::I64Add | Instr::I64Sub | Instr::I64Mul => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(match instr {
                    Instr::I64Add => a.wrapping_add(b),
                    Instr::I64Sub => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                });
            }
            _ => return Err(Error::malformed(CONST_EXP_REQUIRED)),
        }
    }
    Ok(stack)
}

fn first_word(words: &[u64]) -> Result<u64, Error> {
    words.first().copied().ok_or(Error::malformed(CONST_EXP_REQUIRED))
}

impl Instance {
    pub fn instantiate(module: Rc<Module>, imports: &Imports) -> Result<Rc<Instance>, Error> {
        Self::instantiate_with_config(module, imports, &Config::default())
    }

    pub fn instantiate_with_config(module: Rc<Module>, imports: &Imports, config: &Config) -> Result<Rc<Instance>, Error> {
        let id = InstanceRegistry::with(|r| r.allocate_id());
        let mut functions = Vec::with_capacity(module.num_funcs());
        let mut tables = Vec::new();
        let mut memory = None;
        let mut globals = Vec::new();
        let mut tags = Vec::new();

        for import in &module.imports {
            let name = || format!("{}.{}", import.module, import.field);
            let value = imports
                .get(&import.module)
                .and_then(|m| m.get(&import.field))
                .ok_or_else(|| Error::link(format!("{UNKNOWN_IMPORT}: {}", name())))?;
            trace!(instance = id, import = %name(), "resolving import");
            let incompatible = || Error::link(format!("{INCOMPATIBLE_IMPORT}: {}", name()));
            match (&import.desc, value) {
                (ImportDesc::Func(type_idx), ExportValue::Function(f)) => {
                    let ty = module.types.get(*type_idx as usize).ok_or(Error::malformed(UNKNOWN_TYPE))?;
                    if f.ty() != ty {
                        return Err(incompatible());
                    }
                    functions.push(f.clone());
                }
                (ImportDesc::Table(tt), ExportValue::Table(t)) => {
                    let fits = {
                        let t = t.borrow();
                        t.elem_type() == tt.elem_type
                            && t.size() >= tt.initial
                            && tt.maximum.map_or(true, |max| t.maximum().is_some_and(|m| m <= max))
                    };
                    if !fits {
                        return Err(incompatible());
                    }
                    tables.push(t.clone());
                }
                (ImportDesc::Memory(limits), ExportValue::Memory(m)) => {
                    if m.pages() < limits.initial || m.maximum() > limits.maximum || m.is_shared() != limits.shared {
                        return Err(incompatible());
                    }
                    memory = Some(m.clone());
                }
                (ImportDesc::Global(gt), ExportValue::Global(g)) => {
                    if g.ty() != *gt {
                        return Err(incompatible());
                    }
                    globals.push(g.clone());
                }
                (ImportDesc::Tag(type_idx), ExportValue::Tag(t)) => {
                    let ty = module.types.get(*type_idx as usize).ok_or(Error::malformed(UNKNOWN_TYPE))?;
                    if t.ty() != ty {
                        return Err(incompatible());
                    }
                    tags.push(t.clone());
                }
                _ => return Err(incompatible()),
            }
        }

        for body in &module.bodies {
            let ty = module.types.get(body.type_idx as usize).ok_or(Error::malformed(UNKNOWN_TYPE))?;
            functions.push(RuntimeFunction::Wasm { ty: ty.clone(), body: body.clone() });
        }
        for tt in &module.tables {
            if tt.initial > MAX_TABLE_SIZE {
                return Err(Error::uninstantiable(format!("table size {} exceeds {MAX_TABLE_SIZE}", tt.initial)));
            }
            tables.push(Rc::new(RefCell::new(Table::new(tt.elem_type, tt.initial, tt.maximum))));
        }
        if let Some(limits) = module.memory {
            memory = Some(Arc::new(Memory::new(limits)?));
        }
        for &type_idx in &module.tags {
            let ty = module.types.get(type_idx as usize).ok_or(Error::malformed(UNKNOWN_TYPE))?;
            tags.push(Tag::new(ty.clone()));
        }

        let func_word = |idx: u32| func_ref_word(id, &functions, idx);
        for def in &module.globals {
            let words = eval_const(&def.init, &globals, &func_word)?;
            let lo = first_word(&words)?;
            let hi = if def.ty.ty == ValType::V128 { words.get(1).copied().unwrap_or(0) } else { 0 };
            let global = Global { ty: def.ty, lo: Cell::new(lo), hi: Cell::new(hi) };
            globals.push(Rc::new(global));
        }
        let elements = module
            .elements
            .iter()
            .map(|seg| {
                seg.items
                    .iter()
                    .map(|item| eval_const(item, &globals, &func_word).and_then(|w| first_word(&w)))
                    .collect::<Result<Rc<[u64]>, Error>>()
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let inst = Rc::new(Instance {
            id,
            module: module.clone(),
            config: *config,
            functions,
            tables,
            memory,
            globals,
            tags,
            elements: RefCell::new(elements),
            dropped_data: module.data.iter().map(|_| Cell::new(false)).collect(),
            interrupt: Arc::new(AtomicBool::new(false)),
        });
        InstanceRegistry::with(|r| r.live.insert(id, Rc::downgrade(&inst)));
        debug!(instance = id, functions = inst.functions.len(), "instance allocated");

        for (i, seg) in module.elements.iter().enumerate() {
            match &seg.mode {
                SegmentMode::Active { index, offset } => {
                    let applied = inst.const_offset(offset).and_then(|offset| {
                        let words = inst.element_segment(i as u32)?;
                        let table = inst.table(*index).ok_or_else(|| Error::trap(UNKNOWN_TABLE))?;
                        let result = table.borrow_mut().init(offset, &words, 0, words.len() as u32);
                        result
                    });
                    if let Err(e) = applied {
                        return Err(inst.abandon(e));
                    }
                    inst.drop_element(i as u32)?;
                }
                SegmentMode::Declarative => inst.drop_element(i as u32)?,
                SegmentMode::Passive => {}
            }
        }
        for (i, seg) in module.data.iter().enumerate() {
            if let SegmentMode::Active { offset, .. } = &seg.mode {
                let applied = inst.const_offset(offset).and_then(|offset| {
                    let mem = inst.memory().ok_or_else(|| Error::trap(UNKNOWN_MEMORY))?;
                    mem.initialize([(offset as u64, seg.data.as_slice())])
                });
                if let Err(e) = applied {
                    return Err(inst.abandon(e));
                }
                inst.drop_data(i as u32)?;
            }
        }

        if let Some(start) = module.start {
            debug!(instance = id, func = start, "running start function");
            if let Err(e) = inst.call(start, &[]) {
                return Err(inst.abandon(e));
            }
        }
        debug!(instance = id, "instantiated");
        Ok(inst)
    }

    fn const_offset(&self, expr: &[Instr]) -> Result<u32, Error> {
        let words = eval_const(expr, &self.globals, &|idx| self.func_ref_word(idx))?;
        Ok(Word(first_word(&words)?).as_u32())
    }

    /// Turns a failure during instantiation into `Uninstantiable`. Writes into an
    /// imported table may already reference this instance, so it stays resolvable.
    fn abandon(self: &Rc<Self>, err: Error) -> Error {
        debug!(instance = self.id, error = %err, "instantiation failed");
        if self.module.imports_table() {
            InstanceRegistry::with(|r| r.retained.insert(self.id, self.clone()));
        }
        match err {
            Error::Uninstantiable(_) => err,
            other => Error::uninstantiable(other.message()),
        }
    }

    /// Finds a live instance of this thread by id.
    pub fn lookup(id: InstanceId) -> Option<Rc<Instance>> {
        REGISTRY.try_with(|r| r.try_borrow().ok().and_then(|r| r.get(id))).ok().flatten()
    }

    pub fn id(&self) -> InstanceId { self.id }
    pub fn module(&self) -> &Rc<Module> { &self.module }
    pub fn config(&self) -> &Config { &self.config }
    pub fn memory(&self) -> Option<&Arc<Memory>> { self.memory.as_ref() }
    pub fn table(&self, idx: u32) -> Option<&Rc<RefCell<Table>>> { self.tables.get(idx as usize) }
    pub fn global(&self, idx: u32) -> Option<&Rc<Global>> { self.globals.get(idx as usize) }
    pub fn function(&self, idx: u32) -> Option<&RuntimeFunction> { self.functions.get(idx as usize) }
    pub fn func_type(&self, idx: u32) -> Option<&FuncType> { self.function(idx).map(RuntimeFunction::ty) }
    pub fn tag(&self, idx: u32) -> Option<&Arc<Tag>> { self.tags.get(idx as usize) }

    pub fn interrupt_handle(&self) -> InterruptHandle { InterruptHandle(self.interrupt.clone()) }

    pub fn func_ref_word(&self, idx: u32) -> Result<u64, Error> { func_ref_word(self.id, &self.functions, idx) }

    /// Instance whose index space a table slot or reference with this owner uses.
    pub(crate) fn resolve_owner(self: &Rc<Self>, owner: Option<InstanceId>) -> Result<Rc<Instance>, Error> {
        match owner {
            None => Ok(self.clone()),
            Some(id) if id == self.id => Ok(self.clone()),
            Some(id) => Self::lookup(id).ok_or_else(|| Error::trap(FUNC_NO_IMPL)),
        }
    }

    pub fn element_segment(&self, idx: u32) -> Result<Rc<[u64]>, Error> {
        self.elements.borrow().get(idx as usize).cloned().ok_or_else(|| Error::trap(UNKNOWN_ELEM_SEGMENT))
    }

    pub fn drop_element(&self, idx: u32) -> Result<(), Error> {
        let mut elements = self.elements.borrow_mut();
        let seg = elements.get_mut(idx as usize).ok_or_else(|| Error::trap(UNKNOWN_ELEM_SEGMENT))?;
        *seg = Rc::from([]);
        Ok(())
    }

    /// Bytes of a data segment; a dropped segment is empty.
    pub fn data_segment(&self, idx: u32) -> Result<&[u8], Error> {
        let dropped = self.dropped_data.get(idx as usize).ok_or_else(|| Error::trap(UNKNOWN_DATA_SEGMENT))?;
        if dropped.get() {
            return Ok(&[]);
        }
        Ok(&self.module.data[idx as usize].data)
    }

    pub fn drop_data(&self, idx: u32) -> Result<(), Error> {
        self.dropped_data.get(idx as usize).ok_or_else(|| Error::trap(UNKNOWN_DATA_SEGMENT))?.set(true);
        Ok(())
    }

    /// Export by name. Wasm functions come back as handles into this instance.
    pub fn export(self: &Rc<Self>, name: &str) -> Option<ExportValue> {
        let export = self.module.exports.get(name)?;
        Some(match export.kind {
            ExternKind::Func => match self.function(export.idx)? {
                RuntimeFunction::Wasm { ty, .. } => {
                    RuntimeFunction::Imported { ty: ty.clone(), owner: Rc::downgrade(self), index: export.idx }
                }
                other => other.clone(),
            }
            .into(),
            ExternKind::Table => ExportValue::Table(self.table(export.idx)?.clone()),
            ExternKind::Memory => ExportValue::Memory(self.memory()?.clone()),
            ExternKind::Global => ExportValue::Global(self.global(export.idx)?.clone()),
            ExternKind::Tag => ExportValue::Tag(self.tag(export.idx)?.clone()),
        })
    }

    pub fn exports(self: &Rc<Self>) -> ModuleImports {
        self.module.exports.keys().filter_map(|name| Some((name.clone(), self.export(name)?))).collect()
    }

    /// Calls function `idx` with typed arguments.
    pub fn call(self: &Rc<Self>, idx: u32, args: &[Value]) -> Result<Vec<Value>, Error> {
        let ty = self.func_type(idx).ok_or_else(|| Error::trap(UNKNOWN_FUNC))?;
        if args.len() != ty.params.len() {
            return Err(Error::trap(INVALID_NUM_ARG));
        }
        if args.iter().zip(&ty.params).any(|(a, t)| a.ty() != *t) {
            return Err(Error::trap(TYPE_MISMATCH));
        }
        Machine::new(self.config, self.interrupt.clone()).invoke(self, idx, args)
    }

    /// Calls an exported function by name.
    pub fn invoke(self: &Rc<Self>, name: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        match self.module.exports.get(name) {
            Some(Export { kind: ExternKind::Func, idx }) => self.call(*idx, args),
            _ => Err(Error::trap(format!("{UNKNOWN_FUNC}: {name}"))),
        }
    }
}

impl From<RuntimeFunction> for ExportValue {
    fn from(f: RuntimeFunction) -> Self { ExportValue::Function(f) }
}
