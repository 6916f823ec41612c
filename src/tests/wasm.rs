//! Pure-Wasm execution: arithmetic, control flow, memory, tables and
//! exception handling.

use assert_matches::assert_matches;
use rand::Rng;

use crate::ast::{
    self, BlockType, ControlOp, ExceptionOp, Instruction, MemArg, MemoryOp, NumericOp,
    ParametricOp, VariableOp,
};
use crate::{
    Config, Error, FuncType, Limits, MemoryType, Proposal, RecGroup, RefType, SubType, TableType,
    TagType, TrapCode, ValType, Value,
};

use super::{func_module, run_module, setup, setup_with};

#[test]
fn add_two_numbers() {
    let (exec, store) = setup();
    let module = func_module(
        vec![ValType::I32, ValType::I32],
        vec![ValType::I32],
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            VariableOp::LocalGet(1).into(),
            NumericOp::I32Add.into(),
        ],
    );
    let results = run_module(&exec, &store, &module, &[Value::I32(7), Value::I32(5)]).unwrap();
    assert_eq!(results, vec![Value::I32(12)]);
}

#[test]
fn division_by_zero_traps() {
    let (exec, store) = setup();
    let module = func_module(
        vec![ValType::I32, ValType::I32],
        vec![ValType::I32],
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            VariableOp::LocalGet(1).into(),
            NumericOp::I32DivS.into(),
        ],
    );
    let result = run_module(&exec, &store, &module, &[Value::I32(1), Value::I32(0)]);
    assert_eq!(result.unwrap_err().trap_code(), Some(TrapCode::DivideByZero));
}

#[test]
fn invoke_checks_argument_types() {
    let (exec, store) = setup();
    let module = func_module(
        vec![ValType::I32],
        vec![ValType::I32],
        vec![],
        vec![VariableOp::LocalGet(0).into()],
    );
    let wrong_type = run_module(&exec, &store, &module, &[Value::I64(1)]);
    assert_eq!(
        wrong_type.unwrap_err().trap_code(),
        Some(TrapCode::FuncTypeMismatch)
    );
    let wrong_count = run_module(&exec, &store, &module, &[]);
    assert_eq!(
        wrong_count.unwrap_err().trap_code(),
        Some(TrapCode::FuncTypeMismatch)
    );
}

#[test]
fn if_else_selects_the_branch() {
    let (exec, store) = setup();
    let module = func_module(
        vec![ValType::I32],
        vec![ValType::I32],
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            ControlOp::If(BlockType::Value(ValType::I32)).into(),
            NumericOp::I32Const(10).into(),
            ControlOp::Else.into(),
            NumericOp::I32Const(20).into(),
            ControlOp::End.into(),
        ],
    );
    assert_eq!(
        run_module(&exec, &store, &module, &[Value::I32(1)]).unwrap(),
        vec![Value::I32(10)]
    );
    assert_eq!(
        run_module(&exec, &store, &module, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(20)]
    );
}

#[test]
fn loop_counts_down() {
    // Decrement local 0 until zero, counting iterations in local 1.
    let (exec, store) = setup();
    let module = func_module(
        vec![ValType::I32],
        vec![ValType::I32],
        vec![(1, ValType::I32)],
        vec![
            ControlOp::Block(BlockType::Empty).into(),
            ControlOp::Loop(BlockType::Empty).into(),
            VariableOp::LocalGet(0).into(),
            NumericOp::I32Eqz.into(),
            ControlOp::BrIf(1).into(),
            VariableOp::LocalGet(0).into(),
            NumericOp::I32Const(1).into(),
            NumericOp::I32Sub.into(),
            VariableOp::LocalSet(0).into(),
            VariableOp::LocalGet(1).into(),
            NumericOp::I32Const(1).into(),
            NumericOp::I32Add.into(),
            VariableOp::LocalSet(1).into(),
            ControlOp::Br(0).into(),
            ControlOp::End.into(),
            ControlOp::End.into(),
            VariableOp::LocalGet(1).into(),
        ],
    );
    assert_eq!(
        run_module(&exec, &store, &module, &[Value::I32(37)]).unwrap(),
        vec![Value::I32(37)]
    );
}

#[test]
fn br_table_dispatches() {
    let (exec, store) = setup();
    let module = func_module(
        vec![ValType::I32],
        vec![ValType::I32],
        vec![],
        vec![
            ControlOp::Block(BlockType::Empty).into(),
            ControlOp::Block(BlockType::Empty).into(),
            VariableOp::LocalGet(0).into(),
            ControlOp::BrTable(Box::new([0, 1]), 1).into(),
            ControlOp::End.into(),
            NumericOp::I32Const(100).into(),
            ControlOp::Return.into(),
            ControlOp::End.into(),
            NumericOp::I32Const(200).into(),
        ],
    );
    assert_eq!(
        run_module(&exec, &store, &module, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(100)]
    );
    assert_eq!(
        run_module(&exec, &store, &module, &[Value::I32(1)]).unwrap(),
        vec![Value::I32(200)]
    );
    // Out of range takes the default.
    assert_eq!(
        run_module(&exec, &store, &module, &[Value::I32(9)]).unwrap(),
        vec![Value::I32(200)]
    );
}

#[test]
fn select_picks_by_condition() {
    let (exec, store) = setup();
    let module = func_module(
        vec![ValType::I32],
        vec![ValType::I32],
        vec![],
        vec![
            NumericOp::I32Const(11).into(),
            NumericOp::I32Const(22).into(),
            VariableOp::LocalGet(0).into(),
            ParametricOp::Select.into(),
        ],
    );
    assert_eq!(
        run_module(&exec, &store, &module, &[Value::I32(1)]).unwrap(),
        vec![Value::I32(11)]
    );
    assert_eq!(
        run_module(&exec, &store, &module, &[Value::I32(0)]).unwrap(),
        vec![Value::I32(22)]
    );
}

#[test]
fn unreachable_traps() {
    let (exec, store) = setup();
    let module = func_module(vec![], vec![], vec![], vec![ControlOp::Unreachable.into()]);
    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap_err().trap_code(),
        Some(TrapCode::Unreachable)
    );
}

fn memory_module() -> ast::Module {
    // Exports "run": (param i32) -> i32 growing memory by the argument,
    // plus "size": () -> i32.
    let mut module = ast::Module::default();
    module
        .types
        .push(RecGroup::single(SubType::final_func(FuncType::new(
            [ValType::I32],
            [ValType::I32],
        ))));
    module
        .types
        .push(RecGroup::single(SubType::final_func(FuncType::new(
            [],
            [ValType::I32],
        ))));
    module.memories.push(MemoryType {
        limits: Limits::new(1, Some(2)),
        shared: false,
    });
    module.funcs.push(0);
    module.bodies.push(ast::FuncBodyDef {
        locals: vec![],
        body: vec![
            VariableOp::LocalGet(0).into(),
            MemoryOp::MemoryGrow(0).into(),
            ControlOp::End.into(),
        ],
    });
    module.funcs.push(1);
    module.bodies.push(ast::FuncBodyDef {
        locals: vec![],
        body: vec![MemoryOp::MemorySize(0).into(), ControlOp::End.into()],
    });
    module.exports.push(ast::Export {
        name: "run".into(),
        kind: ast::ExternKind::Func,
        index: 0,
    });
    module.exports.push(ast::Export {
        name: "size".into(),
        kind: ast::ExternKind::Func,
        index: 1,
    });
    module
}

#[test]
fn memory_grow_returns_old_size_then_fails() {
    let (exec, store) = setup();
    let instance = exec.instantiate(&store, &memory_module()).unwrap();
    assert_eq!(
        exec.invoke_export(&instance, "run", &[Value::I32(1)]).unwrap(),
        vec![Value::I32(1)]
    );
    assert_eq!(
        exec.invoke_export(&instance, "run", &[Value::I32(1)]).unwrap(),
        vec![Value::I32(-1)]
    );
    assert_eq!(
        exec.invoke_export(&instance, "size", &[]).unwrap(),
        vec![Value::I32(2)]
    );
}

#[test]
fn memory_loads_store_and_bounds() {
    let (exec, store) = setup();
    let mut module = func_module(
        vec![ValType::I32, ValType::I32],
        vec![ValType::I32],
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            VariableOp::LocalGet(1).into(),
            MemoryOp::I32Store(MemArg::zero()).into(),
            VariableOp::LocalGet(0).into(),
            MemoryOp::I32Load(MemArg::zero()).into(),
        ],
    );
    module.memories.push(MemoryType {
        limits: Limits::new(1, None),
        shared: false,
    });
    let instance = exec.instantiate(&store, &module).unwrap();

    assert_eq!(
        exec.invoke_export(&instance, "run", &[Value::I32(16), Value::I32(-5)])
            .unwrap(),
        vec![Value::I32(-5)]
    );
    // load(offset, 4) succeeds iff offset + 4 <= 65536.
    let mut rng = rand::thread_rng();
    for _ in 0..64 {
        let offset: u32 = rng.gen_range(0..=70_000);
        let result = exec.invoke_export(
            &instance,
            "run",
            &[Value::I32(offset as i32), Value::I32(1)],
        );
        if offset as u64 + 4 <= 65536 {
            assert!(result.is_ok(), "offset {offset} should be in bounds");
        } else {
            assert_eq!(
                result.unwrap_err().trap_code(),
                Some(TrapCode::MemoryOutOfBounds),
                "offset {offset} should be out of bounds"
            );
        }
    }
}

#[test]
fn active_data_segment_initializes_memory() {
    let (exec, store) = setup();
    let mut module = func_module(
        vec![],
        vec![ValType::I32],
        vec![],
        vec![
            NumericOp::I32Const(0).into(),
            MemoryOp::I32Load8U(MemArg::at(2)).into(),
        ],
    );
    module.memories.push(MemoryType {
        limits: Limits::new(1, None),
        shared: false,
    });
    module.datas.push(ast::DataSegment {
        data: vec![1, 2, 3, 4],
        mode: ast::DataMode::Active {
            memory: 0,
            offset: vec![NumericOp::I32Const(0).into()],
        },
    });
    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap(),
        vec![Value::I32(3)]
    );
}

#[test]
fn oversized_active_segment_aborts_instantiation() {
    let (exec, store) = setup();
    let mut module = func_module(vec![], vec![], vec![], vec![]);
    module.memories.push(MemoryType {
        limits: Limits::new(1, None),
        shared: false,
    });
    module.datas.push(ast::DataSegment {
        data: vec![0; 70_000],
        mode: ast::DataMode::Active {
            memory: 0,
            offset: vec![NumericOp::I32Const(0).into()],
        },
    });
    let result = exec.instantiate(&store, &module);
    assert_eq!(
        result.unwrap_err().trap_code(),
        Some(TrapCode::MemoryOutOfBounds)
    );
}

/// Indirect-call type mismatch: the table holds an `(f32) -> f32` but the
/// call site expects `(i32) -> i32`.
#[test]
fn call_indirect_type_mismatch() {
    let (exec, store) = setup();
    let mut module = ast::Module::default();
    // type 0: (i32) -> i32; type 1: (f32) -> f32.
    module
        .types
        .push(RecGroup::single(SubType::final_func(FuncType::new(
            [ValType::I32],
            [ValType::I32],
        ))));
    module
        .types
        .push(RecGroup::single(SubType::final_func(FuncType::new(
            [ValType::F32],
            [ValType::F32],
        ))));
    // func 0: the (f32) -> f32 inhabitant of the table.
    module.funcs.push(1);
    module.bodies.push(ast::FuncBodyDef {
        locals: vec![],
        body: vec![VariableOp::LocalGet(0).into(), ControlOp::End.into()],
    });
    // func 1: "run" doing the mismatching indirect call.
    module.funcs.push(0);
    module.bodies.push(ast::FuncBodyDef {
        locals: vec![],
        body: vec![
            NumericOp::I32Const(1).into(),
            NumericOp::I32Const(0).into(),
            ControlOp::CallIndirect(0, 0).into(),
            ControlOp::End.into(),
        ],
    });
    module.tables.push(ast::TableDef {
        ty: TableType {
            elem: RefType::funcref(),
            limits: Limits::new(1, None),
        },
        init: None,
    });
    module.elems.push(ast::ElementSegment {
        ty: RefType::funcref(),
        items: vec![vec![ast::RefOp::RefFunc(0).into()]],
        mode: ast::ElementMode::Active {
            table: 0,
            offset: vec![NumericOp::I32Const(0).into()],
        },
    });
    module.exports.push(ast::Export {
        name: "run".into(),
        kind: ast::ExternKind::Func,
        index: 1,
    });

    let result = run_module(&exec, &store, &module, &[]);
    assert_eq!(
        result.unwrap_err().trap_code(),
        Some(TrapCode::FuncTypeMismatch)
    );
}

#[test]
fn call_indirect_null_and_out_of_bounds() {
    let (exec, store) = setup();
    let mut module = func_module(
        vec![ValType::I32],
        vec![],
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            // Expects type 1, `() -> ()`.
            ControlOp::CallIndirect(0, 1).into(),
        ],
    );
    module.types.push(RecGroup::single(SubType::final_func(
        FuncType::new([], []),
    )));
    module.tables.push(ast::TableDef {
        ty: TableType {
            elem: RefType::funcref(),
            limits: Limits::new(2, None),
        },
        init: None,
    });
    let instance = exec.instantiate(&store, &module).unwrap();
    assert_eq!(
        exec.invoke_export(&instance, "run", &[Value::I32(0)])
            .unwrap_err()
            .trap_code(),
        Some(TrapCode::UndefinedElement)
    );
    assert_eq!(
        exec.invoke_export(&instance, "run", &[Value::I32(9)])
            .unwrap_err()
            .trap_code(),
        Some(TrapCode::UndefinedElement)
    );
}

#[test]
fn tail_calls_do_not_grow_the_call_stack() {
    let config = Config::new().with_proposal(Proposal::TailCall);
    let (exec, store) = setup_with(config);
    // run(n): if n == 0 { 7 } else { return_call run(n - 1) }
    let module = func_module(
        vec![ValType::I32],
        vec![ValType::I32],
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            NumericOp::I32Eqz.into(),
            ControlOp::If(BlockType::Empty).into(),
            NumericOp::I32Const(7).into(),
            ControlOp::Return.into(),
            ControlOp::End.into(),
            VariableOp::LocalGet(0).into(),
            NumericOp::I32Const(1).into(),
            NumericOp::I32Sub.into(),
            ControlOp::ReturnCall(0).into(),
        ],
    );
    // Far deeper than the call-depth cap: only possible in-place.
    let results = run_module(&exec, &store, &module, &[Value::I32(100_000)]).unwrap();
    assert_eq!(results, vec![Value::I32(7)]);
}

#[test]
fn tail_call_without_proposal_is_illegal() {
    let (exec, store) = setup();
    let module = func_module(
        vec![],
        vec![],
        vec![],
        vec![ControlOp::ReturnCall(0).into()],
    );
    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap_err().trap_code(),
        Some(TrapCode::IllegalOpCode)
    );
}

fn exception_module(body: Vec<Instruction>) -> ast::Module {
    let mut module = func_module(vec![], vec![ValType::I32], vec![], body);
    // Tag type: (i32) -> (), reusing a dedicated type entry.
    module.types.push(RecGroup::single(SubType::final_func(
        FuncType::new([ValType::I32], []),
    )));
    module.tags.push(TagType { type_idx: 1 });
    module
}

#[test]
fn throw_is_caught_by_matching_tag() {
    let config = Config::new().with_proposal(Proposal::ExceptionHandling);
    let (exec, store) = setup_with(config);
    let module = exception_module(vec![
        ExceptionOp::Try(BlockType::Value(ValType::I32)).into(),
        NumericOp::I32Const(42).into(),
        ExceptionOp::Throw(0).into(),
        ExceptionOp::Catch(0).into(),
        // The thrown value is on the stack; add one to prove we ran.
        NumericOp::I32Const(1).into(),
        NumericOp::I32Add.into(),
        ControlOp::End.into(),
    ]);
    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap(),
        vec![Value::I32(43)]
    );
}

#[test]
fn catch_all_handles_any_tag() {
    let config = Config::new().with_proposal(Proposal::ExceptionHandling);
    let (exec, store) = setup_with(config);
    let module = exception_module(vec![
        ExceptionOp::Try(BlockType::Value(ValType::I32)).into(),
        NumericOp::I32Const(42).into(),
        ExceptionOp::Throw(0).into(),
        ExceptionOp::CatchAll.into(),
        // catch_all receives no values.
        NumericOp::I32Const(-1).into(),
        ControlOp::End.into(),
    ]);
    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap(),
        vec![Value::I32(-1)]
    );
}

#[test]
fn uncaught_exception_aborts_the_invocation() {
    let config = Config::new().with_proposal(Proposal::ExceptionHandling);
    let (exec, store) = setup_with(config);
    let module = exception_module(vec![
        NumericOp::I32Const(42).into(),
        ExceptionOp::Throw(0).into(),
    ]);
    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap_err().trap_code(),
        Some(TrapCode::UncaughtException)
    );
}

#[test]
fn exceptions_unwind_across_frames() {
    let config = Config::new().with_proposal(Proposal::ExceptionHandling);
    let (exec, store) = setup_with(config);
    let mut module = ast::Module::default();
    module
        .types
        .push(RecGroup::single(SubType::final_func(FuncType::new(
            [],
            [ValType::I32],
        ))));
    module.types.push(RecGroup::single(SubType::final_func(
        FuncType::new([ValType::I32], []),
    )));
    module.types.push(RecGroup::single(SubType::final_func(
        FuncType::new([], []),
    )));
    module.tags.push(TagType { type_idx: 1 });
    // func 0 ("run"): try { call 1 } catch 0 { value + 1 }.
    module.funcs.push(0);
    module.bodies.push(ast::FuncBodyDef {
        locals: vec![],
        body: vec![
            ExceptionOp::Try(BlockType::Value(ValType::I32)).into(),
            ControlOp::Call(1).into(),
            NumericOp::I32Const(0).into(),
            ExceptionOp::Catch(0).into(),
            NumericOp::I32Const(1).into(),
            NumericOp::I32Add.into(),
            ControlOp::End.into(),
            ControlOp::End.into(),
        ],
    });
    // func 1: throws 41 without handling it.
    module.funcs.push(2);
    module.bodies.push(ast::FuncBodyDef {
        locals: vec![],
        body: vec![
            NumericOp::I32Const(41).into(),
            ExceptionOp::Throw(0).into(),
            ControlOp::End.into(),
        ],
    });
    module.exports.push(ast::Export {
        name: "run".into(),
        kind: ast::ExternKind::Func,
        index: 0,
    });
    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap(),
        vec![Value::I32(42)]
    );
}

#[test]
fn start_function_runs_and_its_trap_aborts() {
    let (exec, store) = setup();
    // The start function writes to a global; "run" reads it back.
    let mut module = func_module(
        vec![],
        vec![ValType::I32],
        vec![],
        vec![VariableOp::GlobalGet(0).into()],
    );
    module.types.push(RecGroup::single(SubType::final_func(
        FuncType::new([], []),
    )));
    module.globals.push(ast::GlobalDef {
        ty: crate::GlobalType {
            content: ValType::I32,
            mutability: crate::Mutability::Var,
        },
        init: vec![NumericOp::I32Const(0).into()],
    });
    module.funcs.push(1);
    module.bodies.push(ast::FuncBodyDef {
        locals: vec![],
        body: vec![
            NumericOp::I32Const(99).into(),
            VariableOp::GlobalSet(0).into(),
            ControlOp::End.into(),
        ],
    });
    module.start = Some(1);
    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap(),
        vec![Value::I32(99)]
    );

    // A trapping start function aborts instantiation entirely.
    let mut trapping = func_module(vec![], vec![], vec![], vec![]);
    trapping.types.push(RecGroup::single(SubType::final_func(
        FuncType::new([], []),
    )));
    trapping.funcs.push(1);
    trapping.bodies.push(ast::FuncBodyDef {
        locals: vec![],
        body: vec![ControlOp::Unreachable.into(), ControlOp::End.into()],
    });
    trapping.start = Some(1);
    assert_matches!(
        exec.register_module(&store, "failed", &trapping),
        Err(Error::Trap(_))
    );
    assert!(!store.contains("failed"));
}

#[test]
fn instantiation_is_deterministic() {
    let (exec, store) = setup();
    let mut module = func_module(
        vec![],
        vec![ValType::I32],
        vec![],
        vec![VariableOp::GlobalGet(0).into()],
    );
    module.globals.push(ast::GlobalDef {
        ty: crate::GlobalType {
            content: ValType::I32,
            mutability: crate::Mutability::Const,
        },
        init: vec![
            NumericOp::I32Const(21).into(),
        ],
    });
    let a = exec.instantiate(&store, &module).unwrap();
    let b = exec.instantiate(&store, &module).unwrap();
    let exports_a: Vec<String> = a.exports().into_iter().map(|(name, _)| name).collect();
    let exports_b: Vec<String> = b.exports().into_iter().map(|(name, _)| name).collect();
    assert_eq!(exports_a, exports_b);
    assert_eq!(
        a.global_by_index(0).unwrap().get(),
        b.global_by_index(0).unwrap().get()
    );
}
