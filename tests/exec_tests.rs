use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use wacore::error::{INDIRECT_CALL_MISMATCH, NULL_EXCEPTION_REF, STACK_EXHAUSTED, UNINITIALIZED_ELEM, UNREACHABLE};
use wacore::instruction::RmwOp;
use wacore::{
    BlockType, CatchKind, Config, ElementSegment, Error, Exception, ExportValue, ExternKind, FuncAddr, FuncType,
    GlobalType, Imports, Instance, Instr, MemArg, Memory, MemoryLimits, Module, ModuleBuilder, ModuleImports,
    RuntimeFunction, SegmentMode, TableType, Tag, ValType, Value,
};

use ValType::*;

fn imports_of(module: &str, entries: ModuleImports) -> Imports {
    let mut imports = Imports::new();
    imports.insert(module.to_string(), entries);
    imports
}

#[test]
fn decode_and_run_hand_assembled_binary() {
    #[rustfmt::skip]
    let bytes = [
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00,
        0x01, 0x07, 0x01, 0x60, 0x02, 0x7f, 0x7f, 0x01, 0x7f,
        0x03, 0x02, 0x01, 0x00,
        0x07, 0x07, 0x01, 0x03, b'a', b'd', b'd', 0x00, 0x00,
        0x0a, 0x09, 0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6a, 0x0b,
    ];
    let module = Module::decode(&bytes).unwrap();
    let inst = Instance::instantiate(Rc::new(module), &Imports::new()).unwrap();
    assert_eq!(inst.invoke("add", &[Value::I32(2), Value::I32(3)]), Ok(vec![Value::I32(5)]));
    assert!(inst.invoke("add", &[Value::I32(2)]).is_err());
    assert!(inst.invoke("sub", &[]).is_err());
}

#[test]
fn unreachable_traps_with_stack() {
    let mut mb = ModuleBuilder::new();
    let inner = mb
        .func(FuncType::default(), &[], |b| {
            b.push(Instr::Unreachable);
            Ok(())
        })
        .unwrap();
    let outer = mb
        .func(FuncType::default(), &[], |b| {
            b.push(Instr::Call(inner));
            Ok(())
        })
        .unwrap();
    mb.export("run", ExternKind::Func, outer);
    let inst = Instance::instantiate(mb.build(), &Imports::new()).unwrap();

    match inst.invoke("run", &[]) {
        Err(Error::Trap(t)) => {
            assert_eq!(t.message(), UNREACHABLE);
            let funcs: Vec<u32> = t.frames().iter().map(|f| f.func_idx).collect();
            assert_eq!(funcs, vec![inner, outer]);
            assert!(t.frames().iter().all(|f| f.instance == inst.id()));
        }
        other => panic!("expected trap, got {other:?}"),
    }
}

#[test]
fn unbounded_recursion_exhausts_call_stack() {
    let mut mb = ModuleBuilder::new();
    let idx = mb.next_func_index();
    mb.func(FuncType::new([I64], [I64]), &[], move |b| {
        b.local_get(0)?.push(Instr::I64Const(1)).push(Instr::I64Add).push(Instr::Call(idx));
        Ok(())
    })
    .unwrap();
    mb.export("down", ExternKind::Func, idx);
    let config = Config { max_call_depth: 64, ..Config::default() };
    let inst = Instance::instantiate_with_config(mb.build(), &Imports::new(), &config).unwrap();

    let err = inst.invoke("down", &[Value::I64(0)]).unwrap_err();
    assert_eq!(err.message(), STACK_EXHAUSTED);
    // the instance stays usable after exhaustion
    let err = inst.invoke("down", &[Value::I64(0)]).unwrap_err();
    assert_eq!(err.message(), STACK_EXHAUSTED);
}

#[test]
fn operand_stack_limit_exhausts() {
    let mut mb = ModuleBuilder::new();
    let idx = mb.next_func_index();
    mb.func(FuncType::default(), &[], move |b| {
        for i in 0..32 {
            b.push(Instr::I32Const(i));
        }
        b.push(Instr::Call(idx));
        Ok(())
    })
    .unwrap();
    mb.export("grow", ExternKind::Func, idx);
    let config = Config { max_call_depth: 100_000, max_stack_words: 512, ..Config::default() };
    let inst = Instance::instantiate_with_config(mb.build(), &Imports::new(), &config).unwrap();
    assert_eq!(inst.invoke("grow", &[]).unwrap_err().message(), STACK_EXHAUSTED);
}

#[test]
fn block_params_and_multi_value_results() {
    let mut mb = ModuleBuilder::new();
    let unary = mb.ty(FuncType::new([I32], [I32]));
    let pair = mb.ty(FuncType::new([I32], [I32, I64]));
    let f = mb
        .func(FuncType::new([I32], [I32, I64]), &[], move |b| {
            b.local_get(0)?;
            // (block (param i32) (result i32) i32.const 1 i32.add)
            b.block(BlockType::Type(unary))?;
            b.push(Instr::I32Const(1)).push(Instr::I32Add);
            b.end()?;
            // (block (param i32) (result i32 i64) ... br 0 with both values)
            b.block(BlockType::Type(pair))?;
            b.push(Instr::I64Const(-9));
            b.br(0)?;
            b.end()?;
            Ok(())
        })
        .unwrap();
    mb.export("f", ExternKind::Func, f);
    let inst = Instance::instantiate(mb.build(), &Imports::new()).unwrap();
    assert_eq!(inst.invoke("f", &[Value::I32(41)]), Ok(vec![Value::I32(42), Value::I64(-9)]));
}

#[test]
fn loop_with_params_accumulates() {
    // sum 1..=n by carrying the running total as the loop parameter
    let mut mb = ModuleBuilder::new();
    let carry = mb.ty(FuncType::new([I32], [I32]));
    let f = mb
        .func(FuncType::new([I32], [I32]), &[], move |b| {
            b.push(Instr::I32Const(0));
            b.loop_(BlockType::Type(carry))?;
            b.local_get(0)?.push(Instr::I32Add);
            b.local_get(0)?.push(Instr::I32Const(1)).push(Instr::I32Sub).local_tee(0)?;
            b.br_if(0)?;
            b.end()?;
            Ok(())
        })
        .unwrap();
    mb.export("sum", ExternKind::Func, f);
    let inst = Instance::instantiate(mb.build(), &Imports::new()).unwrap();
    assert_eq!(inst.invoke("sum", &[Value::I32(100)]), Ok(vec![Value::I32(5050)]));
}

#[test]
fn host_import_receives_args_and_caller() {
    let double = RuntimeFunction::host([I32], [I32], |caller, args| {
        assert!(caller.memory().is_none());
        let v = args[0].i32().ok_or_else(|| Error::trap("bad arg"))?;
        Ok(vec![Value::I32(v * 2)])
    });
    let imports = imports_of("env", ModuleImports::from([("double".to_string(), double.into())]));

    let mut mb = ModuleBuilder::new();
    let host = mb.import_func("env", "double", FuncType::new([I32], [I32]));
    let f = mb
        .func(FuncType::new([I32], [I32]), &[], move |b| {
            b.local_get(0)?.push(Instr::Call(host)).push(Instr::I32Const(1)).push(Instr::I32Add);
            Ok(())
        })
        .unwrap();
    mb.export("f", ExternKind::Func, f);
    let inst = Instance::instantiate(mb.build(), &imports).unwrap();
    assert_eq!(inst.invoke("f", &[Value::I32(20)]), Ok(vec![Value::I32(41)]));
}

#[test]
fn host_result_type_is_checked() {
    let liar = RuntimeFunction::host([], [I32], |_, _| Ok(vec![Value::I64(1)]));
    let imports = imports_of("env", ModuleImports::from([("liar".to_string(), liar.into())]));
    let mut mb = ModuleBuilder::new();
    let host = mb.import_func("env", "liar", FuncType::new([], [I32]));
    mb.export("liar", ExternKind::Func, host);
    let inst = Instance::instantiate(mb.build(), &imports).unwrap();
    assert!(inst.invoke("liar", &[]).unwrap_err().is_trap());
}

#[test]
fn call_indirect_runs_in_the_owning_instance() {
    // provider owns the table; client fills it with its own function that reads a private global
    let mut mb = ModuleBuilder::new();
    let ty = mb.ty(FuncType::new([], [I32]));
    let table = mb.table(TableType { elem_type: FuncRef, initial: 2, maximum: None });
    let call = mb
        .func(FuncType::new([I32], [I32]), &[], move |b| {
            b.local_get(0)?.push(Instr::CallIndirect { type_idx: ty, table });
            Ok(())
        })
        .unwrap();
    mb.export("table", ExternKind::Table, table).export("call", ExternKind::Func, call);
    let provider = Instance::instantiate(mb.build(), &Imports::new()).unwrap();

    let mut mb = ModuleBuilder::new();
    mb.import_table("provider", "table", TableType { elem_type: FuncRef, initial: 2, maximum: None });
    let secret = mb.global(GlobalType { ty: I32, mutable: false }, vec![Instr::I32Const(42)]);
    let get = mb
        .func(FuncType::new([], [I32]), &[], move |b| {
            b.push(Instr::GlobalGet(secret));
            Ok(())
        })
        .unwrap();
    let wrong = mb
        .func(FuncType::new([], [I64]), &[], |b| {
            b.push(Instr::I64Const(0));
            Ok(())
        })
        .unwrap();
    mb.element(ElementSegment {
        elem_type: FuncRef,
        mode: SegmentMode::Active { index: 0, offset: vec![Instr::I32Const(0)] },
        items: vec![vec![Instr::RefFunc(get)], vec![Instr::RefFunc(wrong)]],
    });
    let client = Instance::instantiate(mb.build(), &imports_of("provider", provider.exports())).unwrap();

    assert_eq!(provider.invoke("call", &[Value::I32(0)]), Ok(vec![Value::I32(42)]));
    assert_eq!(provider.invoke("call", &[Value::I32(1)]).unwrap_err().message(), INDIRECT_CALL_MISMATCH);

    let table = match provider.export("table") {
        Some(ExportValue::Table(t)) => t,
        other => panic!("expected table, got {other:?}"),
    };
    assert_eq!(table.borrow().instance(0), Some(client.id()));
    table.borrow_mut().reset();
    assert_eq!(provider.invoke("call", &[Value::I32(0)]).unwrap_err().message(), UNINITIALIZED_ELEM);
}

#[test]
fn interrupt_from_another_thread_stops_a_loop() {
    let mut mb = ModuleBuilder::new();
    let spin = mb
        .func(FuncType::default(), &[], |b| {
            b.loop_(BlockType::Empty)?;
            b.br(0)?;
            b.end()?;
            Ok(())
        })
        .unwrap();
    let answer = mb
        .func(FuncType::new([], [I32]), &[], |b| {
            b.push(Instr::I32Const(7));
            Ok(())
        })
        .unwrap();
    mb.export("spin", ExternKind::Func, spin).export("answer", ExternKind::Func, answer);
    let inst = Instance::instantiate(mb.build(), &Imports::new()).unwrap();

    let handle = inst.interrupt_handle();
    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handle.interrupt();
    });
    assert_eq!(inst.invoke("spin", &[]), Err(Error::Interrupted));
    waker.join().unwrap();

    // the flag is consumed by the interrupted call
    assert_eq!(inst.invoke("answer", &[]), Ok(vec![Value::I32(7)]));
}

#[test]
fn host_can_interrupt_its_caller() {
    let stop = RuntimeFunction::host([], [], |caller, _| {
        caller.interrupt_handle().interrupt();
        Ok(vec![])
    });
    let mut mb = ModuleBuilder::new();
    let host = mb.import_func("env", "stop", FuncType::default());
    let f = mb
        .func(FuncType::default(), &[], move |b| {
            b.push(Instr::Call(host));
            b.loop_(BlockType::Empty)?;
            b.br(0)?;
            b.end()?;
            Ok(())
        })
        .unwrap();
    mb.export("f", ExternKind::Func, f);
    let imports = imports_of("env", ModuleImports::from([("stop".to_string(), stop.into())]));
    let inst = Instance::instantiate(mb.build(), &imports).unwrap();
    assert_eq!(inst.invoke("f", &[]), Err(Error::Interrupted));
}

#[test]
fn threads_share_memory_through_atomics() {
    const THREADS: usize = 4;
    const ITERS: i32 = 1000;
    let memory = Arc::new(Memory::new(MemoryLimits::shared(1, 1)).unwrap());

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            let memory = memory.clone();
            s.spawn(move || {
                let mut mb = ModuleBuilder::new();
                mb.import_memory("env", "memory", MemoryLimits::shared(1, 1));
                let bump = mb
                    .func(FuncType::new([I32], []), &[], |b| {
                        b.loop_(BlockType::Empty)?;
                        b.push(Instr::I32Const(16)).push(Instr::I32Const(1));
                        b.push(Instr::AtomicRmw { op: RmwOp::Add, size: 4, memarg: MemArg::new(2, 0) });
                        b.push(Instr::Drop);
                        b.local_get(0)?.push(Instr::I32Const(1)).push(Instr::I32Sub).local_tee(0)?;
                        b.br_if(0)?;
                        b.end()?;
                        Ok(())
                    })
                    .unwrap();
                mb.export("bump", ExternKind::Func, bump);
                let imports =
                    imports_of("env", ModuleImports::from([("memory".to_string(), ExportValue::Memory(memory))]));
                let inst = Instance::instantiate(mb.build(), &imports).unwrap();
                inst.invoke("bump", &[Value::I32(ITERS)]).unwrap();
            });
        }
    });

    assert_eq!(memory.read_u32(16).unwrap(), THREADS as u32 * ITERS as u32);
}

#[test]
fn failing_start_function_is_uninstantiable() {
    let mut mb = ModuleBuilder::new();
    let start = mb
        .func(FuncType::default(), &[], |b| {
            b.push(Instr::Unreachable);
            Ok(())
        })
        .unwrap();
    mb.start(start);
    match Instance::instantiate(mb.build(), &Imports::new()) {
        Err(Error::Uninstantiable(msg)) => assert_eq!(msg, UNREACHABLE),
        other => panic!("expected uninstantiable, got {other:?}"),
    }
}

#[test]
fn partial_instantiation_keeps_table_writes_callable() {
    let mut mb = ModuleBuilder::new();
    let ty = mb.ty(FuncType::new([], [I32]));
    let table = mb.table(TableType { elem_type: FuncRef, initial: 1, maximum: None });
    let call = mb
        .func(FuncType::new([], [I32]), &[], move |b| {
            b.push(Instr::I32Const(0)).push(Instr::CallIndirect { type_idx: ty, table });
            Ok(())
        })
        .unwrap();
    mb.export("table", ExternKind::Table, table).export("call", ExternKind::Func, call);
    let host = Instance::instantiate(mb.build(), &Imports::new()).unwrap();

    // writes slot 0, then traps on an out-of-bounds data segment
    let mut mb = ModuleBuilder::new();
    mb.import_table("host", "table", TableType { elem_type: FuncRef, initial: 1, maximum: None });
    let seven = mb
        .func(FuncType::new([], [I32]), &[], |b| {
            b.push(Instr::I32Const(7));
            Ok(())
        })
        .unwrap();
    mb.element(ElementSegment {
        elem_type: FuncRef,
        mode: SegmentMode::Active { index: 0, offset: vec![Instr::I32Const(0)] },
        items: vec![vec![Instr::RefFunc(seven)]],
    });
    mb.memory(MemoryLimits::new(0, None));
    mb.data(wacore::DataSegment {
        mode: SegmentMode::Active { index: 0, offset: vec![Instr::I32Const(0)] },
        data: vec![1],
    });
    let err = Instance::instantiate(mb.build(), &imports_of("host", host.exports())).unwrap_err();
    assert!(matches!(err, Error::Uninstantiable(_)));

    assert_eq!(host.invoke("call", &[]), Ok(vec![Value::I32(7)]));
}

#[test]
fn funcref_crosses_the_host_with_its_owner() {
    // a hands out a reference to its function 0; b stores it and calls it through its own table
    let mut mb = ModuleBuilder::new();
    let one11 = mb
        .func(FuncType::new([], [I32]), &[], |b| {
            b.push(Instr::I32Const(111));
            Ok(())
        })
        .unwrap();
    let get = mb
        .func(FuncType::new([], [FuncRef]), &[], move |b| {
            b.push(Instr::RefFunc(one11));
            Ok(())
        })
        .unwrap();
    mb.export("get", ExternKind::Func, get);
    let a = Instance::instantiate(mb.build(), &Imports::new()).unwrap();

    let mut mb = ModuleBuilder::new();
    let ty = mb.ty(FuncType::new([], [I32]));
    let two22 = mb
        .func(FuncType::new([], [I32]), &[], |b| {
            b.push(Instr::I32Const(222));
            Ok(())
        })
        .unwrap();
    let table = mb.table(TableType { elem_type: FuncRef, initial: 1, maximum: None });
    let store_and_call = mb
        .func(FuncType::new([FuncRef], [I32]), &[], move |b| {
            b.push(Instr::I32Const(0)).local_get(0)?.push(Instr::TableSet(table));
            b.push(Instr::I32Const(0)).push(Instr::CallIndirect { type_idx: ty, table });
            Ok(())
        })
        .unwrap();
    mb.export("store_and_call", ExternKind::Func, store_and_call).export("table", ExternKind::Table, table);
    let b = Instance::instantiate(mb.build(), &Imports::new()).unwrap();

    let handed_out = a.invoke("get", &[]).unwrap();
    assert_eq!(handed_out, vec![Value::FuncRef(Some(FuncAddr::new(a.id(), one11)))]);
    assert_eq!(b.invoke("store_and_call", &handed_out), Ok(vec![Value::I32(111)]));
    let Some(ExportValue::Table(t)) = b.export("table") else { panic!("table export missing") };
    assert_eq!(t.borrow().instance(0), Some(a.id()));

    // a reference built by the embedder without an owner names the callee's own function
    let local = Value::FuncRef(Some(FuncAddr::local(two22)));
    assert_eq!(b.invoke("store_and_call", &[local]), Ok(vec![Value::I32(222)]));
}

/// `f(n)` reaches zero by calling back into itself through a host import.
fn reentrant(config: &Config) -> (Rc<Instance>, Rc<Cell<u32>>) {
    let calls = Rc::new(Cell::new(0u32));
    let counter = calls.clone();
    let reenter = RuntimeFunction::host([I32], [I32], move |caller, args| {
        counter.set(counter.get() + 1);
        let inst = Instance::lookup(caller.id()).ok_or_else(|| Error::trap("caller dropped"))?;
        inst.invoke("f", args)
    });
    let mut mb = ModuleBuilder::new();
    let host = mb.import_func("env", "reenter", FuncType::new([I32], [I32]));
    let f = mb
        .func(FuncType::new([I32], [I32]), &[], move |b| {
            b.local_get(0)?.push(Instr::I32Eqz);
            b.if_(BlockType::Value(I32))?;
            b.push(Instr::I32Const(0));
            b.else_()?;
            b.local_get(0)?.push(Instr::I32Const(1)).push(Instr::I32Sub).push(Instr::Call(host));
            b.push(Instr::I32Const(1)).push(Instr::I32Add);
            b.end()?;
            Ok(())
        })
        .unwrap();
    mb.export("f", ExternKind::Func, f);
    let imports = imports_of("env", ModuleImports::from([("reenter".to_string(), reenter.into())]));
    (Instance::instantiate_with_config(mb.build(), &imports, config).unwrap(), calls)
}

#[test]
fn host_reentry_counts_toward_call_depth() {
    let (inst, calls) = reentrant(&Config::default());
    assert_eq!(inst.invoke("f", &[Value::I32(5)]), Ok(vec![Value::I32(5)]));
    assert_eq!(calls.get(), 5);

    // each level holds one wasm frame and one host frame
    let config = Config { max_call_depth: 10, max_host_depth: 100, ..Config::default() };
    let (inst, calls) = reentrant(&config);
    let err = inst.invoke("f", &[Value::I32(1_000_000)]).unwrap_err();
    assert_eq!(err.message(), STACK_EXHAUSTED);
    assert_eq!(calls.get(), 5);
    // depth is released as the host calls unwind
    assert_eq!(inst.invoke("f", &[Value::I32(3)]), Ok(vec![Value::I32(3)]));
}

#[test]
fn host_reentry_is_capped_separately() {
    let config = Config { max_host_depth: 3, ..Config::default() };
    let (inst, calls) = reentrant(&config);
    assert_eq!(inst.invoke("f", &[Value::I32(100)]).unwrap_err().message(), STACK_EXHAUSTED);
    assert_eq!(calls.get(), 3);
    assert_eq!(inst.invoke("f", &[Value::I32(3)]), Ok(vec![Value::I32(3)]));
}

#[test]
fn reinterpret_chains_keep_float_bits() {
    let mut mb = ModuleBuilder::new();
    let f32_bits = mb
        .func(FuncType::new([F32], [I32]), &[], |b| {
            b.local_get(0)?.push(Instr::I32ReinterpretF32);
            Ok(())
        })
        .unwrap();
    let f32_chain = mb
        .func(FuncType::new([F32], [F32]), &[], |b| {
            b.local_get(0)?.push(Instr::I32ReinterpretF32).push(Instr::F32ReinterpretI32);
            Ok(())
        })
        .unwrap();
    let f64_chain = mb
        .func(FuncType::new([F64], [F64]), &[], |b| {
            b.local_get(0)?.push(Instr::I64ReinterpretF64).push(Instr::F64ReinterpretI64);
            Ok(())
        })
        .unwrap();
    let f64_bits = mb
        .func(FuncType::new([F64], [I64]), &[], |b| {
            b.local_get(0)?.push(Instr::I64ReinterpretF64);
            Ok(())
        })
        .unwrap();
    mb.export("f32_bits", ExternKind::Func, f32_bits)
        .export("f32_chain", ExternKind::Func, f32_chain)
        .export("f64_chain", ExternKind::Func, f64_chain)
        .export("f64_bits", ExternKind::Func, f64_bits);
    let inst = Instance::instantiate(mb.build(), &Imports::new()).unwrap();

    // negative zero, a signalling NaN with payload, a negative quiet NaN with payload
    for bits in [0x8000_0000u32, 0x7fa0_0001, 0xffc0_1234] {
        let arg = [Value::F32(f32::from_bits(bits))];
        assert_eq!(inst.invoke("f32_bits", &arg), Ok(vec![Value::I32(bits as i32)]));
        let out = inst.invoke("f32_chain", &arg).unwrap();
        assert_eq!(out[0].f32().map(f32::to_bits), Some(bits), "{bits:#x}");
    }
    for bits in [0x8000_0000_0000_0000u64, 0x7ff4_0000_0000_0001, 0xfff8_dead_beef_0001] {
        let arg = [Value::F64(f64::from_bits(bits))];
        assert_eq!(inst.invoke("f64_bits", &arg), Ok(vec![Value::I64(bits as i64)]));
        let out = inst.invoke("f64_chain", &arg).unwrap();
        assert_eq!(out[0].f64().map(f64::to_bits), Some(bits), "{bits:#x}");
    }
}

#[test]
fn try_table_catches_payload_from_a_deeper_frame() {
    let mut mb = ModuleBuilder::new();
    let pair = mb.ty(FuncType::new([], [I32, I64]));
    let oops = mb.tag(FuncType::new([I32, I64], []));
    let inner = mb
        .func(FuncType::new([I32], []), &[], move |b| {
            // leftover operands below the payload are discarded by the unwind
            b.push(Instr::I32Const(1)).push(Instr::I32Const(2));
            b.local_get(0)?.push(Instr::I64Const(9)).push(Instr::Throw(oops));
            Ok(())
        })
        .unwrap();
    let middle = mb
        .func(FuncType::new([I32], []), &[], move |b| {
            b.local_get(0)?.push(Instr::Call(inner));
            Ok(())
        })
        .unwrap();
    let outer = mb
        .func(FuncType::new([I32], [I32, I64]), &[], move |b| {
            b.block(BlockType::Type(pair))?;
            b.try_table(BlockType::Empty, &[(CatchKind::Tag(oops), 0)])?;
            b.push(Instr::I32Const(77)).local_get(0)?.push(Instr::Call(middle)).push(Instr::Drop);
            b.end()?;
            b.push(Instr::Unreachable);
            b.end()?;
            Ok(())
        })
        .unwrap();
    mb.export("outer", ExternKind::Func, outer);
    let inst = Instance::instantiate(mb.build(), &Imports::new()).unwrap();
    assert_eq!(inst.invoke("outer", &[Value::I32(5)]), Ok(vec![Value::I32(5), Value::I64(9)]));
    // the machine is reusable after an unwind
    assert_eq!(inst.invoke("outer", &[Value::I32(6)]), Ok(vec![Value::I32(6), Value::I64(9)]));
}

#[test]
fn catch_all_ref_rethrows_to_an_outer_handler() {
    let mut mb = ModuleBuilder::new();
    let oops = mb.tag(FuncType::new([I32], []));
    let f = mb
        .func(FuncType::new([I32], [I32]), &[], move |b| {
            b.block(BlockType::Value(I32))?;
            b.try_table(BlockType::Empty, &[(CatchKind::Tag(oops), 0)])?;
            b.block(BlockType::Value(ExnRef))?;
            b.try_table(BlockType::Empty, &[(CatchKind::AllRef, 0)])?;
            b.local_get(0)?.push(Instr::Throw(oops));
            b.end()?;
            b.push(Instr::Unreachable);
            b.end()?;
            b.push(Instr::ThrowRef);
            b.end()?;
            b.push(Instr::Unreachable);
            b.end()?;
            b.push(Instr::I32Const(1)).push(Instr::I32Add);
            Ok(())
        })
        .unwrap();
    let null = mb
        .func(FuncType::default(), &[], |b| {
            b.push(Instr::RefNull(ExnRef)).push(Instr::ThrowRef);
            Ok(())
        })
        .unwrap();
    mb.export("f", ExternKind::Func, f).export("null", ExternKind::Func, null);
    let inst = Instance::instantiate(mb.build(), &Imports::new()).unwrap();
    assert_eq!(inst.invoke("f", &[Value::I32(41)]), Ok(vec![Value::I32(42)]));
    assert_eq!(inst.invoke("null", &[]).unwrap_err().message(), NULL_EXCEPTION_REF);
}

#[test]
fn uncaught_exception_reaches_the_embedder() {
    let mut mb = ModuleBuilder::new();
    let oops = mb.tag(FuncType::new([I32], []));
    let other = mb.tag(FuncType::new([I32], []));
    let f = mb
        .func(FuncType::new([], [I32]), &[], move |b| {
            b.block(BlockType::Value(I32))?;
            b.try_table(BlockType::Empty, &[(CatchKind::Tag(other), 0)])?;
            b.push(Instr::I32Const(5)).push(Instr::Throw(oops));
            b.end()?;
            b.push(Instr::Unreachable);
            b.end()?;
            Ok(())
        })
        .unwrap();
    mb.export("f", ExternKind::Func, f).export("oops", ExternKind::Tag, oops);
    let inst = Instance::instantiate(mb.build(), &Imports::new()).unwrap();
    let Some(ExportValue::Tag(tag)) = inst.export("oops") else { panic!("tag export missing") };

    match inst.invoke("f", &[]) {
        Err(Error::Exception(exn)) => {
            assert!(Arc::ptr_eq(exn.tag(), &tag));
            assert_eq!(exn.values(), vec![Value::I32(5)]);
        }
        other => panic!("expected exception, got {other:?}"),
    }
    assert!(!Error::Exception(Exception::new(tag, &[Value::I32(0)]).unwrap()).is_trap());
}

#[test]
fn host_thrown_exception_is_caught_by_imported_tag() {
    let boom = Tag::new(FuncType::new([I32], []));
    let stray = Tag::new(FuncType::new([I32], []));
    let (thrown, fail_with) = (boom.clone(), stray.clone());
    let fail = RuntimeFunction::host([I32], [], move |_, args| {
        let tag = if args[0] == Value::I32(0) { thrown.clone() } else { fail_with.clone() };
        Err(Error::Exception(Exception::new(tag, &[Value::I32(13)])?))
    });
    let imports = imports_of(
        "env",
        ModuleImports::from([("boom".to_string(), ExportValue::Tag(boom)), ("fail".to_string(), fail.into())]),
    );

    let mut mb = ModuleBuilder::new();
    let tag = mb.import_tag("env", "boom", FuncType::new([I32], []));
    let host = mb.import_func("env", "fail", FuncType::new([I32], []));
    let f = mb
        .func(FuncType::new([I32], [I32]), &[], move |b| {
            b.block(BlockType::Value(I32))?;
            b.try_table(BlockType::Empty, &[(CatchKind::Tag(tag), 0)])?;
            b.local_get(0)?.push(Instr::Call(host));
            b.end()?;
            b.push(Instr::Unreachable);
            b.end()?;
            Ok(())
        })
        .unwrap();
    mb.export("f", ExternKind::Func, f);
    let inst = Instance::instantiate(mb.build(), &imports).unwrap();
    assert_eq!(inst.invoke("f", &[Value::I32(0)]), Ok(vec![Value::I32(13)]));
    match inst.invoke("f", &[Value::I32(1)]) {
        Err(Error::Exception(exn)) => assert!(Arc::ptr_eq(exn.tag(), &stray)),
        other => panic!("expected exception, got {other:?}"),
    }
}
