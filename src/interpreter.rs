//! The dispatch loop.
//!
//! Wasm-to-wasm calls never recurse on the native stack: a call pushes a
//! [`StackFrame`] and the outer loop in [`Machine::run`] resumes whichever frame is
//! on top. Host functions run inline. A host function that calls back into wasm
//! starts a fresh [`Machine`], which inherits the depth already used on this thread.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;

use paste::paste;
use tracing::debug;

use crate::config::Config;
use crate::error::*;
use crate::exception::Exception;
use crate::frame::{CtrlFrame, CtrlKind, StackFrame};
use crate::instance::{HostFn, Instance, RuntimeFunction};
use crate::instruction::{BrTarget, Instr};
use crate::module::FunctionBody;
use crate::ops;
use crate::signature::FuncType;
use crate::stack::MStack;
use crate::trace_exec;
use crate::value::{ValType, Value, Word, REF_NULL};
use crate::wasm_table::TableEntry;

/// Wasm frames and host calls held by machines further down this thread's native stack.
#[derive(Debug, Clone, Copy, Default)]
struct Nesting {
    frames: usize,
    hosts: usize,
}

thread_local! {
    static NESTING: Cell<Nesting> = const { Cell::new(Nesting { frames: 0, hosts: 0 }) };
}

/// What the outer loop should do after a frame yields.
enum Flow {
    Call(Rc<Instance>, u32),
    TailCall(Rc<Instance>, u32),
    Return,
}

#[inline]
fn check_interrupt(flag: &AtomicBool) -> Result<(), Error> {
    if flag.load(Ordering::Relaxed) && flag.swap(false, Ordering::AcqRel) {
        return Err(Error::Interrupted);
    }
    Ok(())
}

/// Table slot for a reference produced by `inst`; bare function indices belong to it.
#[inline]
fn entry_for(inst: &Instance, elem_type: ValType, w: u64) -> TableEntry {
    let mut entry = TableEntry::from_word(elem_type, w);
    if elem_type == ValType::FuncRef && !entry.is_null() && entry.owner.is_none() {
        entry.owner = Some(inst.id());
    }
    entry
}

/// Resolves a `call_indirect` slot to the instance and function it names.
fn resolve_indirect(inst: &Rc<Instance>, type_idx: u32, table: u32, slot: u32) -> Result<(Rc<Instance>, u32), Error> {
    let entry = inst.table(table).ok_or_else(|| Error::trap(UNKNOWN_TABLE))?.borrow().required_ref(slot)?;
    let callee = inst.resolve_owner(entry.owner)?;
    let idx = entry.value as u32;
    let expected = inst.module().types.get(type_idx as usize).ok_or(Error::malformed(UNKNOWN_TYPE))?;
    match callee.func_type(idx) {
        Some(ty) if ty == expected => Ok((callee, idx)),
        Some(_) => Err(Error::trap(INDIRECT_CALL_MISMATCH)),
        None => Err(Error::trap(UNDEF_ELEM)),
    }
}

/// Drops the caller's operands below a tail call's arguments.
fn unwind_for_tail_call(stack: &mut MStack, ctrl: &[CtrlFrame], callee: &Instance, idx: u32) -> Result<(), Error> {
    let params = callee.func_type(idx).ok_or_else(|| Error::trap(UNKNOWN_FUNC))?.param_words();
    let height = ctrl.first().map_or(0, |f| f.height);
    stack.unwind(height, params)
}

pub(crate) struct Machine {
    stack: MStack,
    frames: Vec<StackFrame>,
    config: Config,
    interrupt: Arc<AtomicBool>,
    outer: Nesting,
}

impl Machine {
    pub fn new(config: Config, interrupt: Arc<AtomicBool>) -> Self {
        let outer = NESTING.with(Cell::get);
        Self { stack: MStack::with_capacity(1024), frames: Vec::new(), config, interrupt, outer }
    }

    /// Runs function `idx` of `inst` to completion. Arguments are already type-checked.
    pub fn invoke(&mut self, inst: &Rc<Instance>, idx: u32, args: &[Value]) -> Result<Vec<Value>, Error> {
        let ty = inst.func_type(idx).ok_or_else(|| Error::trap(UNKNOWN_FUNC))?.clone();
        for arg in args {
            let (lo, hi) = arg.to_words();
            self.stack.push(lo);
            if arg.ty() == ValType::V128 {
                self.stack.push(hi);
            }
        }
        let base = self.frames.len();
        let result = self.enter(inst.clone(), idx).and_then(|()| self.run(base));
        if let Err(e) = result {
            let e = e.with_frames(|| self.frames.iter().rev().map(StackFrame::trace).collect());
            debug!(instance = inst.id(), func = idx, error = %e, "call failed");
            self.frames.truncate(base);
            return Err(e);
        }
        let words = self.stack.pop_n(ty.result_words())?;
        Ok(Value::read_words(&ty.results, &words))
    }

    fn run(&mut self, base: usize) -> Result<(), Error> {
        while self.frames.len() > base {
            match self.step() {
                Ok(()) => {}
                Err(Error::Exception(exn)) => self.catch(base, exn)?,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), Error> {
        match self.step_frame()? {
            Flow::Return => {
                self.frames.pop();
            }
            Flow::Call(inst, idx) => self.enter(inst, idx)?,
            Flow::TailCall(inst, idx) => {
                self.frames.pop();
                self.enter(inst, idx)?;
            }
        }
        Ok(())
    }

    /// Unwinds to the innermost `try_table` clause above `base` that catches `exn`
    /// and branches to its label. Fails with the exception if none does.
    fn catch(&mut self, base: usize, exn: Arc<Exception>) -> Result<(), Error> {
        let Machine { stack, frames, .. } = self;
        while frames.len() > base {
            let frame = frames.last_mut().ok_or_else(|| Error::trap(STACK_UNDERFLOW))?;
            while let Some(c) = frame.ctrl.pop() {
                let CtrlKind::Try(at) = c.kind else { continue };
                let Some(Instr::TryTable { handlers, .. }) = frame.body.code.get(at as usize) else { continue };
                let inst = &frame.instance;
                let handler = handlers.iter().copied().find(|h| match h.kind.tag() {
                    Some(t) => inst.tag(t).is_some_and(|tag| Arc::ptr_eq(tag, exn.tag())),
                    None => true,
                });
                let Some(h) = handler else { continue };
                stack.extend_from_slice(exn.payload());
                if h.kind.pushes_ref() {
                    stack.push(exn.to_word());
                }
                let keep = frame
                    .ctrl
                    .len()
                    .checked_sub(h.target.depth as usize)
                    .ok_or_else(|| Error::trap(STACK_UNDERFLOW))?;
                frame.ctrl.truncate(keep);
                let target = *frame.ctrl.last().ok_or_else(|| Error::trap(STACK_UNDERFLOW))?;
                stack.unwind(target.height, target.branch_values())?;
                frame.pc = h.target.pc as usize;
                trace_exec!(instance = inst.id(), pc = frame.pc, "exception caught");
                return Ok(());
            }
            frames.pop();
        }
        Err(Error::Exception(exn))
    }

    /// Starts a call whose arguments are on the operand stack.
    fn enter(&mut self, mut inst: Rc<Instance>, mut idx: u32) -> Result<(), Error> {
        check_interrupt(&self.interrupt)?;
        loop {
            let (owner, index) = match inst.function(idx) {
                Some(RuntimeFunction::Imported { owner, index, .. }) => {
                    (owner.upgrade().ok_or_else(|| Error::trap(FUNC_NO_IMPL))?, *index)
                }
                Some(RuntimeFunction::Wasm { body, .. }) => {
                    let body = body.clone();
                    return self.push_frame(inst, idx, body);
                }
                Some(RuntimeFunction::Host { ty, callback }) => {
                    let (ty, callback) = (ty.clone(), callback.clone());
                    return self.call_host(&inst, &ty, &*callback);
                }
                None => return Err(Error::trap(UNKNOWN_FUNC)),
            };
            inst = owner;
            idx = index;
        }
    }

    fn push_frame(&mut self, inst: Rc<Instance>, idx: u32, body: Rc<FunctionBody>) -> Result<(), Error> {
        let depth = self.outer.frames + self.frames.len();
        if depth >= self.config.max_call_depth || self.stack.len() > self.config.max_stack_words {
            return Err(Error::trap(STACK_EXHAUSTED));
        }
        let (params, results) = {
            let ty = inst.module().types.get(body.type_idx as usize).ok_or(Error::malformed(UNKNOWN_TYPE))?;
            (ty.param_words(), ty.result_words())
        };
        let frame = StackFrame::new(inst, idx, body, params, results, &mut self.stack)?;
        self.frames.push(frame);
        Ok(())
    }

    fn call_host(&mut self, inst: &Rc<Instance>, ty: &FuncType, callback: &HostFn) -> Result<(), Error> {
        let depth = self.outer.frames + self.frames.len();
        if depth >= self.config.max_call_depth || self.outer.hosts >= self.config.max_host_depth {
            return Err(Error::trap(STACK_EXHAUSTED));
        }
        let words = self.stack.pop_n(ty.param_words())?;
        let args = Value::read_words(&ty.params, &words);
        // a nested machine started by the callback counts this one's frames
        let inner = Nesting { frames: depth + 1, hosts: self.outer.hosts + 1 };
        let saved = NESTING.with(|n| n.replace(inner));
        let results = callback(&**inst, &args);
        NESTING.with(|n| n.set(saved));
        let results = results?;
        if results.len() != ty.results.len() || results.iter().zip(&ty.results).any(|(v, t)| v.ty() != *t) {
            return Err(Error::trap(TYPE_MISMATCH));
        }
        for v in &results {
            let (lo, hi) = v.to_words();
            self.stack.push(lo);
            if v.ty() == ValType::V128 {
                self.stack.push(hi);
            }
        }
        Ok(())
    }

    /// Executes the top frame until it returns or calls out.
    fn step_frame(&mut self) -> Result<Flow, Error> {
        let Machine { stack, frames, interrupt, .. } = self;
        let frame = frames.last_mut().ok_or_else(|| Error::trap(STACK_UNDERFLOW))?;
        let StackFrame { instance, body, pc, locals, ctrl, .. } = frame;
        let inst: &Rc<Instance> = instance;
        let code: &[Instr] = &body.code;
        let mut ip = *pc;

        macro_rules! pop {
            () => { stack.pop()? };
            ($ty:ident) => { paste! { Word(stack.pop()?).[<as_ $ty>]() } };
        }
        macro_rules! push {
            ($ty:ident, $v:expr) => { paste! { stack.push(Word::[<from_ $ty>]($v).0) } };
        }
        macro_rules! unary {
            ($ty:ident, |$a:ident| $e:expr) => {{
                let $a = pop!($ty);
                push!($ty, $e);
            }};
            ($from:ident -> $to:ident, |$a:ident| $e:expr) => {{
                let $a = pop!($from);
                push!($to, $e);
            }};
        }
        macro_rules! binary {
            ($ty:ident, |$a:ident, $b:ident| $e:expr) => {{
                let $b = pop!($ty);
                let $a = pop!($ty);
                push!($ty, $e);
            }};
        }
        macro_rules! compare {
            ($ty:ident, $op:tt) => {{
                let b = pop!($ty);
                let a = pop!($ty);
                push!(u32, (a $op b) as u32);
            }};
        }
        macro_rules! memory {
            () => { inst.memory().ok_or_else(|| Error::trap(UNKNOWN_MEMORY))? };
        }
        macro_rules! table {
            ($idx:expr) => { inst.table($idx).ok_or_else(|| Error::trap(UNKNOWN_TABLE))? };
        }
        macro_rules! addr {
            ($m:expr) => { pop!(u32) as u64 + $m.offset as u64 };
        }
        macro_rules! load {
            ($m:expr, $read:ident => $ty:ident) => {{
                let addr = addr!($m);
                let v = memory!().$read(addr)?;
                push!($ty, v as $ty);
            }};
        }
        macro_rules! store {
            ($m:expr, $from:ident as $ty:ty => $write:ident) => {{
                let v = pop!($from) as $ty;
                let addr = addr!($m);
                memory!().$write(addr, v)?;
            }};
        }
        macro_rules! branch {
            ($t:expr) => {{
                let t: &BrTarget = $t;
                ctrl.truncate(ctrl.len() - t.depth as usize);
                let target = *ctrl.last().ok_or_else(|| Error::trap(STACK_UNDERFLOW))?;
                stack.unwind(target.height, target.branch_values())?;
                if target.kind == CtrlKind::Loop {
                    check_interrupt(&**interrupt)?;
                }
                ip = t.pc as usize;
            }};
        }

        loop {
            let instr = code.get(ip).ok_or_else(|| Error::malformed(UNEXPECTED_END))?;
            *pc = ip;
            ip += 1;
            trace_exec!(instance = inst.id(), pc = *pc, stack = stack.len(), "{instr:?}");

            match instr {
                // control
                Instr::Unreachable => return Err(Error::trap(UNREACHABLE)),
                Instr::Nop => {}
                Instr::Block(arity) => ctrl.push(CtrlFrame::new(CtrlKind::Block, *arity, stack.len())),
                Instr::Loop(arity) => ctrl.push(CtrlFrame::new(CtrlKind::Loop, *arity, stack.len())),
                Instr::If { arity, else_pc, .. } => {
                    let c = pop!(u32);
                    ctrl.push(CtrlFrame::new(CtrlKind::If, *arity, stack.len()));
                    if c == 0 {
                        ip = *else_pc as usize;
                    }
                }
                Instr::Else { end_pc } => ip = *end_pc as usize,
                Instr::End => {
                    let f = ctrl.pop().ok_or_else(|| Error::trap(STACK_UNDERFLOW))?;
                    stack.unwind(f.height, f.end_values as usize)?;
                    if f.kind == CtrlKind::Call {
                        return Ok(Flow::Return);
                    }
                }
                Instr::Br(t) => branch!(t),
                Instr::BrIf(t) => {
                    if pop!(u32) != 0 {
                        branch!(t)
                    }
                }
                Instr::BrTable(targets) => {
                    let i = pop!(u32) as usize;
                    branch!(&targets[i.min(targets.len() - 1)])
                }
                Instr::Return => {
                    let f = ctrl.first().copied().ok_or_else(|| Error::trap(STACK_UNDERFLOW))?;
                    stack.unwind(f.height, f.end_values as usize)?;
                    return Ok(Flow::Return);
                }
                Instr::Call(idx) => {
                    *pc = ip;
                    return Ok(Flow::Call(inst.clone(), *idx));
                }
                Instr::CallIndirect { type_idx, table } => {
                    let slot = pop!(u32);
                    let (callee, idx) = resolve_indirect(inst, *type_idx, *table, slot)?;
                    *pc = ip;
                    return Ok(Flow::Call(callee, idx));
                }
                Instr::ReturnCall(idx) => {
                    unwind_for_tail_call(stack, ctrl, inst, *idx)?;
                    return Ok(Flow::TailCall(inst.clone(), *idx));
                }
                Instr::ReturnCallIndirect { type_idx, table } => {
                    let slot = pop!(u32);
                    let (callee, idx) = resolve_indirect(inst, *type_idx, *table, slot)?;
                    unwind_for_tail_call(stack, ctrl, &callee, idx)?;
                    return Ok(Flow::TailCall(callee, idx));
                }
                Instr::Throw(t) => {
                    let tag = inst.tag(*t).ok_or_else(|| Error::trap(UNKNOWN_TAG))?;
                    let payload = stack.pop_n(tag.ty().param_words())?;
                    return Err(Error::Exception(Exception::from_words(tag.clone(), payload)));
                }
                Instr::ThrowRef => {
                    let w = pop!();
                    if w == REF_NULL {
                        return Err(Error::trap(NULL_EXCEPTION_REF));
                    }
                    let exn = Exception::from_word(w).ok_or_else(|| Error::trap(NULL_EXCEPTION_REF))?;
                    return Err(Error::Exception(exn));
                }
                Instr::TryTable { arity, .. } => {
                    ctrl.push(CtrlFrame::new(CtrlKind::Try(*pc as u32), *arity, stack.len()));
                }

                // parametric
                Instr::Drop => {
                    pop!();
                }
                Instr::Select => {
                    let c = pop!(u32);
                    let b = pop!();
                    let a = pop!();
                    stack.push(if c != 0 { a } else { b });
                }
                Instr::SelectT(ty) => {
                    let c = pop!(u32);
                    let n = ty.words();
                    let b = stack.pop_n(n)?;
                    let a = stack.pop_n(n)?;
                    stack.extend_from_slice(if c != 0 { &a } else { &b });
                }

                // variables
                Instr::LocalGet(slot) => stack.push(locals[*slot as usize]),
                Instr::LocalSet(slot) => locals[*slot as usize] = pop!(),
                Instr::LocalTee(slot) => locals[*slot as usize] = stack.peek()?,
                Instr::LocalGet128(slot) => {
                    let s = *slot as usize;
                    stack.push(locals[s]);
                    stack.push(locals[s + 1]);
                }
                Instr::LocalSet128(slot) => {
                    let s = *slot as usize;
                    locals[s + 1] = pop!();
                    locals[s] = pop!();
                }
                Instr::LocalTee128(slot) => {
                    let s = *slot as usize;
                    let hi = pop!();
                    let lo = stack.peek()?;
                    stack.push(hi);
                    locals[s] = lo;
                    locals[s + 1] = hi;
                }
                Instr::GlobalGet(idx) => {
                    let g = inst.global(*idx).ok_or(Error::malformed(UNKNOWN_GLOBAL))?;
                    let (lo, hi) = g.words();
                    stack.push(lo);
                    if g.ty().ty == ValType::V128 {
                        stack.push(hi);
                    }
                }
                Instr::GlobalSet(idx) => {
                    let g = inst.global(*idx).ok_or(Error::malformed(UNKNOWN_GLOBAL))?;
                    let hi = if g.ty().ty == ValType::V128 { pop!() } else { 0 };
                    let lo = pop!();
                    g.set_words(lo, hi);
                }

                // tables
                Instr::TableGet(t) => {
                    let i = pop!(u32);
                    let entry = table!(*t).borrow().get(i)?;
                    stack.push(entry.to_word());
                }
                Instr::TableSet(t) => {
                    let w = pop!();
                    let i = pop!(u32);
                    let mut table = table!(*t).borrow_mut();
                    let entry = entry_for(inst, table.elem_type(), w);
                    table.set_ref(i, entry.value, entry.owner)?;
                }
                Instr::TableSize(t) => push!(u32, table!(*t).borrow().size()),
                Instr::TableGrow(t) => {
                    let n = pop!(u32);
                    let w = pop!();
                    let mut table = table!(*t).borrow_mut();
                    let entry = entry_for(inst, table.elem_type(), w);
                    let old = table.grow(n, entry.value, entry.owner);
                    push!(u32, old);
                }
                Instr::TableFill(t) => {
                    let n = pop!(u32);
                    let w = pop!();
                    let i = pop!(u32);
                    let mut table = table!(*t).borrow_mut();
                    let entry = entry_for(inst, table.elem_type(), w);
                    table.fill(i, entry.value, entry.owner, n)?;
                }
                Instr::TableCopy { dst, src } => {
                    let n = pop!(u32);
                    let s = pop!(u32);
                    let d = pop!(u32);
                    let (to, from) = (table!(*dst), table!(*src));
                    if Rc::ptr_eq(to, from) {
                        to.borrow_mut().copy_within(d, s, n)?;
                    } else {
                        to.borrow_mut().copy_from(&from.borrow(), d, s, n)?;
                    }
                }
                Instr::TableInit { elem, table } => {
                    let n = pop!(u32);
                    let s = pop!(u32);
                    let d = pop!(u32);
                    let segment = inst.element_segment(*elem)?;
                    table!(*table).borrow_mut().init(d, &segment, s, n)?;
                }
                Instr::ElemDrop(elem) => inst.drop_element(*elem)?,

                // memory
                Instr::I32Load(m) => load!(m, read_u32 => u32),
                Instr::I64Load(m) => load!(m, read_u64 => u64),
                Instr::F32Load(m) => load!(m, read_u32 => u32),
                Instr::F64Load(m) => load!(m, read_u64 => u64),
                Instr::I32Load8S(m) => load!(m, read_i8 => i32),
                Instr::I32Load8U(m) => load!(m, read_u8 => u32),
                Instr::I32Load16S(m) => load!(m, read_i16 => i32),
                Instr::I32Load16U(m) => load!(m, read_u16 => u32),
                Instr::I64Load8S(m) => load!(m, read_i8 => i64),
                Instr::I64Load8U(m) => load!(m, read_u8 => u64),
                Instr::I64Load16S(m) => load!(m, read_i16 => i64),
                Instr::I64Load16U(m) => load!(m, read_u16 => u64),
                Instr::I64Load32S(m) => load!(m, read_i32 => i64),
                Instr::I64Load32U(m) => load!(m, read_u32 => u64),
                Instr::I32Store(m) => store!(m, u32 as u32 => write_u32),
                Instr::I64Store(m) => store!(m, u64 as u64 => write_u64),
                Instr::F32Store(m) => store!(m, u32 as u32 => write_u32),
                Instr::F64Store(m) => store!(m, u64 as u64 => write_u64),
                Instr::I32Store8(m) => store!(m, u32 as u8 => write_u8),
                Instr::I32Store16(m) => store!(m, u32 as u16 => write_u16),
                Instr::I64Store8(m) => store!(m, u64 as u8 => write_u8),
                Instr::I64Store16(m) => store!(m, u64 as u16 => write_u16),
                Instr::I64Store32(m) => store!(m, u64 as u32 => write_u32),
                Instr::MemorySize => push!(u32, memory!().pages()),
                Instr::MemoryGrow => {
                    let delta = pop!(u32);
                    push!(u32, memory!().grow(delta));
                }
                Instr::MemoryInit(seg) => {
                    let n = pop!(u32) as u64;
                    let s = pop!(u32) as u64;
                    let d = pop!(u32) as u64;
                    memory!().init(d, inst.data_segment(*seg)?, s, n)?;
                }
                Instr::DataDrop(seg) => inst.drop_data(*seg)?,
                Instr::MemoryCopy => {
                    let n = pop!(u32) as u64;
                    let s = pop!(u32) as u64;
                    let d = pop!(u32) as u64;
                    memory!().copy(d, s, n)?;
                }
                Instr::MemoryFill => {
                    let n = pop!(u32) as u64;
                    let v = pop!(u32) as u8;
                    let d = pop!(u32) as u64;
                    memory!().fill(d, v, n)?;
                }

                // constants
                Instr::I32Const(v) => push!(i32, *v),
                Instr::I64Const(v) => push!(i64, *v),
                Instr::F32Const(bits) => push!(u32, *bits),
                Instr::F64Const(bits) => push!(u64, *bits),

                // references
                Instr::RefNull(_) => stack.push(REF_NULL),
                Instr::RefIsNull => {
                    let w = pop!();
                    push!(u32, (w == REF_NULL) as u32);
                }
                Instr::RefFunc(idx) => stack.push(inst.func_ref_word(*idx)?),

                // i32
                Instr::I32Eqz => unary!(u32, |a| (a == 0) as u32),
                Instr::I32Eq => compare!(u32, ==),
                Instr::I32Ne => compare!(u32, !=),
                Instr::I32LtS => compare!(i32, <),
                Instr::I32LtU => compare!(u32, <),
                Instr::I32GtS => compare!(i32, >),
                Instr::I32GtU => compare!(u32, >),
                Instr::I32LeS => compare!(i32, <=),
                Instr::I32LeU => compare!(u32, <=),
                Instr::I32GeS => compare!(i32, >=),
                Instr::I32GeU => compare!(u32, >=),
                Instr::I32Clz => unary!(u32, |a| a.leading_zeros()),
                Instr::I32Ctz => unary!(u32, |a| a.trailing_zeros()),
                Instr::I32Popcnt => unary!(u32, |a| a.count_ones()),
                Instr::I32Add => binary!(i32, |a, b| a.wrapping_add(b)),
                Instr::I32Sub => binary!(i32, |a, b| a.wrapping_sub(b)),
                Instr::I32Mul => binary!(i32, |a, b| a.wrapping_mul(b)),
                Instr::I32DivS => binary!(i32, |a, b| ops::i32_div_s(a, b)?),
                Instr::I32DivU => binary!(i32, |a, b| ops::i32_div_u(a, b)?),
                Instr::I32RemS => binary!(i32, |a, b| ops::i32_rem_s(a, b)?),
                Instr::I32RemU => binary!(i32, |a, b| ops::i32_rem_u(a, b)?),
                Instr::I32And => binary!(u32, |a, b| a & b),
                Instr::I32Or => binary!(u32, |a, b| a | b),
                Instr::I32Xor => binary!(u32, |a, b| a ^ b),
                Instr::I32Shl => binary!(u32, |a, b| a.wrapping_shl(b)),
                Instr::I32ShrS => binary!(i32, |a, b| a.wrapping_shr(b as u32)),
                Instr::I32ShrU => binary!(u32, |a, b| a.wrapping_shr(b)),
                Instr::I32Rotl => binary!(u32, |a, b| a.rotate_left(b)),
                Instr::I32Rotr => binary!(u32, |a, b| a.rotate_right(b)),

                // i64
                Instr::I64Eqz => unary!(u64 -> u32, |a| (a == 0) as u32),
                Instr::I64Eq => compare!(u64, ==),
                Instr::I64Ne => compare!(u64, !=),
                Instr::I64LtS => compare!(i64, <),
                Instr::I64LtU => compare!(u64, <),
                Instr::I64GtS => compare!(i64, >),
                Instr::I64GtU => compare!(u64, >),
                Instr::I64LeS => compare!(i64, <=),
                Instr::I64LeU => compare!(u64, <=),
                Instr::I64GeS => compare!(i64, >=),
                Instr::I64GeU => compare!(u64, >=),
                Instr::I64Clz => unary!(u64, |a| a.leading_zeros() as u64),
                Instr::I64Ctz => unary!(u64, |a| a.trailing_zeros() as u64),
                Instr::I64Popcnt => unary!(u64, |a| a.count_ones() as u64),
                Instr::I64Add => binary!(i64, |a, b| a.wrapping_add(b)),
                Instr::I64Sub => binary!(i64, |a, b| a.wrapping_sub(b)),
                Instr::I64Mul => binary!(i64, |a, b| a.wrapping_mul(b)),
                Instr::I64DivS => binary!(i64, |a, b| ops::i64_div_s(a, b)?),
                Instr::I64DivU => binary!(i64, |a, b| ops::i64_div_u(a, b)?),
                Instr::I64RemS => binary!(i64, |a, b| ops::i64_rem_s(a, b)?),
                Instr::I64RemU => binary!(i64, |a, b| ops::i64_rem_u(a, b)?),
                Instr::I64And => binary!(u64, |a, b| a & b),
                Instr::I64Or => binary!(u64, |a, b| a | b),
                Instr::I64Xor => binary!(u64, |a, b| a ^ b),
                Instr::I64Shl => binary!(u64, |a, b| a.wrapping_shl(b as u32)),
                Instr::I64ShrS => binary!(i64, |a, b| a.wrapping_shr(b as u32)),
                Instr::I64ShrU => binary!(u64, |a, b| a.wrapping_shr(b as u32)),
                Instr::I64Rotl => binary!(u64, |a, b| a.rotate_left((b % 64) as u32)),
                Instr::I64Rotr => binary!(u64, |a, b| a.rotate_right((b % 64) as u32)),

                // f32
                Instr::F32Eq => compare!(f32, ==),
                Instr::F32Ne => compare!(f32, !=),
                Instr::F32Lt => compare!(f32, <),
                Instr::F32Gt => compare!(f32, >),
                Instr::F32Le => compare!(f32, <=),
                Instr::F32Ge => compare!(f32, >=),
                Instr::F32Abs => unary!(f32, |a| ops::f32_abs(a)),
                Instr::F32Neg => unary!(f32, |a| ops::f32_neg(a)),
                Instr::F32Ceil => unary!(f32, |a| a.ceil()),
                Instr::F32Floor => unary!(f32, |a| a.floor()),
                Instr::F32Trunc => unary!(f32, |a| a.trunc()),
                Instr::F32Nearest => unary!(f32, |a| ops::f32_nearest(a)),
                Instr::F32Sqrt => unary!(f32, |a| a.sqrt()),
                Instr::F32Add => binary!(f32, |a, b| a + b),
                Instr::F32Sub => binary!(f32, |a, b| a - b),
                Instr::F32Mul => binary!(f32, |a, b| a * b),
                Instr::F32Div => binary!(f32, |a, b| a / b),
                Instr::F32Min => binary!(f32, |a, b| ops::f32_min(a, b)),
                Instr::F32Max => binary!(f32, |a, b| ops::f32_max(a, b)),
                Instr::F32Copysign => binary!(f32, |a, b| ops::f32_copysign(a, b)),

                // f64
                Instr::F64Eq => compare!(f64, ==),
                Instr::F64Ne => compare!(f64, !=),
                Instr::F64Lt => compare!(f64, <),
                Instr::F64Gt => compare!(f64, >),
                Instr::F64Le => compare!(f64, <=),
                Instr::F64Ge => compare!(f64, >=),
                Instr::F64Abs => unary!(f64, |a| ops::f64_abs(a)),
                Instr::F64Neg => unary!(f64, |a| ops::f64_neg(a)),
                Instr::F64Ceil => unary!(f64, |a| a.ceil()),
                Instr::F64Floor => unary!(f64, |a| a.floor()),
                Instr::F64Trunc => unary!(f64, |a| a.trunc()),
                Instr::F64Nearest => unary!(f64, |a| ops::f64_nearest(a)),
                Instr::F64Sqrt => unary!(f64, |a| a.sqrt()),
                Instr::F64Add => binary!(f64, |a, b| a + b),
                Instr::F64Sub => binary!(f64, |a, b| a - b),
                Instr::F64Mul => binary!(f64, |a, b| a * b),
                Instr::F64Div => binary!(f64, |a, b| a / b),
                Instr::F64Min => binary!(f64, |a, b| ops::f64_min(a, b)),
                Instr::F64Max => binary!(f64, |a, b| ops::f64_max(a, b)),
                Instr::F64Copysign => binary!(f64, |a, b| ops::f64_copysign(a, b)),

                // conversions
                Instr::I32WrapI64 => unary!(i64 -> i32, |a| a as i32),
                Instr::I32TruncF32S => unary!(f32 -> i32, |a| ops::i32_trunc_f32_s(a)?),
                Instr::I32TruncF32U => unary!(f32 -> u32, |a| ops::i32_trunc_f32_u(a)?),
                Instr::I32TruncF64S => unary!(f64 -> i32, |a| ops::i32_trunc_f64_s(a)?),
                Instr::I32TruncF64U => unary!(f64 -> u32, |a| ops::i32_trunc_f64_u(a)?),
                Instr::I64ExtendI32S => unary!(i32 -> i64, |a| a as i64),
                Instr::I64ExtendI32U => unary!(u32 -> u64, |a| a as u64),
                Instr::I64TruncF32S => unary!(f32 -> i64, |a| ops::i64_trunc_f32_s(a)?),
                Instr::I64TruncF32U => unary!(f32 -> u64, |a| ops::i64_trunc_f32_u(a)?),
                Instr::I64TruncF64S => unary!(f64 -> i64, |a| ops::i64_trunc_f64_s(a)?),
                Instr::I64TruncF64U => unary!(f64 -> u64, |a| ops::i64_trunc_f64_u(a)?),
                Instr::F32ConvertI32S => unary!(i32 -> f32, |a| a as f32),
                Instr::F32ConvertI32U => unary!(i32 -> f32, |a| ops::f32_convert_i32_u(a)),
                Instr::F32ConvertI64S => unary!(i64 -> f32, |a| a as f32),
                Instr::F32ConvertI64U => unary!(i64 -> f32, |a| ops::f32_convert_i64_u(a)),
                Instr::F32DemoteF64 => unary!(f64 -> f32, |a| a as f32),
                Instr::F64ConvertI32S => unary!(i32 -> f64, |a| a as f64),
                Instr::F64ConvertI32U => unary!(i32 -> f64, |a| ops::f64_convert_i32_u(a)),
                Instr::F64ConvertI64S => unary!(i64 -> f64, |a| a as f64),
                Instr::F64ConvertI64U => unary!(i64 -> f64, |a| ops::f64_convert_i64_u(a)),
                Instr::F64PromoteF32 => unary!(f32 -> f64, |a| a as f64),
                // same bits in the same word
                Instr::I32ReinterpretF32
                | Instr::I64ReinterpretF64
                | Instr::F32ReinterpretI32
                | Instr::F64ReinterpretI64 => {}
                Instr::I32Extend8S => unary!(i32, |a| a as i8 as i32),
                Instr::I32Extend16S => unary!(i32, |a| a as i16 as i32),
                Instr::I64Extend8S => unary!(i64, |a| a as i8 as i64),
                Instr::I64Extend16S => unary!(i64, |a| a as i16 as i64),
                Instr::I64Extend32S => unary!(i64, |a| a as i32 as i64),
                Instr::I32TruncSatF32S => unary!(f32 -> i32, |a| ops::i32_trunc_sat_f32_s(a)),
                Instr::I32TruncSatF32U => unary!(f32 -> u32, |a| ops::i32_trunc_sat_f32_u(a)),
                Instr::I32TruncSatF64S => unary!(f64 -> i32, |a| ops::i32_trunc_sat_f64_s(a)),
                Instr::I32TruncSatF64U => unary!(f64 -> u32, |a| ops::i32_trunc_sat_f64_u(a)),
                Instr::I64TruncSatF32S => unary!(f32 -> i64, |a| ops::i64_trunc_sat_f32_s(a)),
                Instr::I64TruncSatF32U => unary!(f32 -> u64, |a| ops::i64_trunc_sat_f32_u(a)),
                Instr::I64TruncSatF64S => unary!(f64 -> i64, |a| ops::i64_trunc_sat_f64_s(a)),
                Instr::I64TruncSatF64U => unary!(f64 -> u64, |a| ops::i64_trunc_sat_f64_u(a)),

                // threads
                Instr::AtomicNotify(m) => {
                    let count = pop!(u32);
                    let addr = addr!(m);
                    push!(u32, memory!().notify(addr, count)?);
                }
                Instr::AtomicWait32(m) => {
                    let timeout = pop!(i64);
                    let expected = pop!(u32) as u64;
                    let addr = addr!(m);
                    push!(u32, memory!().wait_on(addr, 4, expected, timeout, Some(&**interrupt))?);
                }
                Instr::AtomicWait64(m) => {
                    let timeout = pop!(i64);
                    let expected = pop!(u64);
                    let addr = addr!(m);
                    push!(u32, memory!().wait_on(addr, 8, expected, timeout, Some(&**interrupt))?);
                }
                Instr::AtomicFence => fence(Ordering::SeqCst),
                Instr::AtomicLoad { size, memarg } => {
                    let addr = addr!(memarg);
                    stack.push(memory!().atomic_load(addr, *size)?);
                }
                Instr::AtomicStore { size, memarg } => {
                    let v = pop!();
                    let addr = addr!(memarg);
                    memory!().atomic_store(addr, *size, v)?;
                }
                Instr::AtomicRmw { op, size, memarg } => {
                    let v = pop!();
                    let addr = addr!(memarg);
                    stack.push(memory!().atomic_rmw(addr, *size, *op, v)?);
                }
                Instr::AtomicCmpxchg { size, memarg } => {
                    let replacement = pop!();
                    let expected = pop!();
                    let addr = addr!(memarg);
                    stack.push(memory!().atomic_cmpxchg(addr, *size, expected, replacement)?);
                }
            }
        }
    }
}
