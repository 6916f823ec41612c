//! The host-function bridge: calling frames, time accounting, errors,
//! termination, host modules and plug-ins.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use crate::ast::{self, BlockType, ControlOp, NumericOp, VariableOp};
use crate::{
    CallingFrame, Config, Error, FuncType, HostFuncError, HostModuleBuilder, Limits, MemoryType,
    Plugin, PluginContext, RecGroup, StatisticsConfig, SubType, TrapCode, TrapKind, ValType, Value,
};

use super::{func_module, run_module, setup, setup_with};

/// A module importing `env::print_i32` and looping `run(n)` calls to it.
fn call_loop_module() -> ast::Module {
    let mut module = ast::Module::default();
    // type 0: (i32) -> (), shared by the import and the loop body.
    module.types.push(RecGroup::single(SubType::final_func(
        FuncType::new([ValType::I32], []),
    )));
    module.imports.push(ast::Import {
        module: "env".into(),
        name: "print_i32".into(),
        desc: ast::ImportDesc::Func(0),
    });
    // func 1 ("run"): for i in 0..n { print_i32(i) }.
    module.funcs.push(0);
    module.bodies.push(ast::FuncBodyDef {
        locals: vec![(1, ValType::I32)],
        body: vec![
            ControlOp::Block(BlockType::Empty).into(),
            ControlOp::Loop(BlockType::Empty).into(),
            VariableOp::LocalGet(1).into(),
            VariableOp::LocalGet(0).into(),
            NumericOp::I32GeS.into(),
            ControlOp::BrIf(1).into(),
            VariableOp::LocalGet(1).into(),
            ControlOp::Call(0).into(),
            VariableOp::LocalGet(1).into(),
            NumericOp::I32Const(1).into(),
            NumericOp::I32Add.into(),
            VariableOp::LocalSet(1).into(),
            ControlOp::Br(0).into(),
            ControlOp::End.into(),
            ControlOp::End.into(),
            ControlOp::End.into(),
        ],
    });
    module.exports.push(ast::Export {
        name: "run".into(),
        kind: ast::ExternKind::Func,
        index: 1,
    });
    module
}

#[test]
fn host_calls_count_and_time_partitions() {
    let config = Config::new().with_statistics(StatisticsConfig {
        instr_count: false,
        cost: false,
        time: true,
    });
    let (exec, store) = setup_with(config);

    let counter = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&counter);
    let env = HostModuleBuilder::new("env").with_func(
        "print_i32",
        FuncType::new([ValType::I32], []),
        move |_frame: &CallingFrame, args: &[Value]| {
            assert_eq!(args.len(), 1);
            seen.fetch_add(1, Ordering::Relaxed);
            // Give the host clock something to measure.
            thread::sleep(Duration::from_millis(1));
            Ok(Vec::new())
        },
    );
    exec.register_host_module(&store, env).unwrap();

    let started = Instant::now();
    let n = 5;
    run_module(&exec, &store, &call_loop_module(), &[Value::I32(n)]).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(counter.load(Ordering::Relaxed), n as u32);
    let stats = exec.statistics();
    assert!(stats.wasm_time() > Duration::ZERO);
    assert!(stats.host_time() > Duration::ZERO);
    assert!(stats.wasm_time() + stats.host_time() <= elapsed);
}

#[test]
fn host_can_touch_the_callers_memory() {
    let (exec, store) = setup();
    let env = HostModuleBuilder::new("env").with_func(
        "poke",
        FuncType::new([], []),
        |frame: &CallingFrame, _args: &[Value]| {
            let memory = frame.memory(0).expect("caller has a memory");
            memory
                .set_value::<u32>(0, 0xfeed)
                .map_err(HostFuncError::Runtime)?;
            Ok(Vec::new())
        },
    );
    exec.register_host_module(&store, env).unwrap();

    let mut module = func_module(
        vec![],
        vec![ValType::I32],
        vec![],
        vec![
            ControlOp::Call(0).into(),
            NumericOp::I32Const(0).into(),
            crate::ast::MemoryOp::I32Load(crate::ast::MemArg::zero()).into(),
        ],
    );
    module.imports.push(ast::Import {
        module: "env".into(),
        name: "poke".into(),
        desc: ast::ImportDesc::Func(0),
    });
    // The import shifts "run" to function index 1.
    module.exports[0].index = 1;
    module.memories.push(MemoryType {
        limits: Limits::new(1, None),
        shared: false,
    });
    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap(),
        vec![Value::I32(0xfeed)]
    );
}

#[test]
fn host_user_error_propagates_verbatim() {
    let (exec, store) = setup();
    let env = HostModuleBuilder::new("env").with_func(
        "fail",
        FuncType::new([], []),
        |_frame: &CallingFrame, _args: &[Value]| Err::<Vec<Value>, _>(HostFuncError::User(0x1234)),
    );
    exec.register_host_module(&store, env).unwrap();

    let mut module = func_module(vec![], vec![], vec![], vec![ControlOp::Call(0).into()]);
    module.imports.push(ast::Import {
        module: "env".into(),
        name: "fail".into(),
        desc: ast::ImportDesc::Func(0),
    });
    module.exports[0].index = 1;

    let error = run_module(&exec, &store, &module, &[]).unwrap_err();
    match error {
        Error::Trap(trap) => {
            assert!(trap.is_host());
            assert_matches!(trap.kind(), TrapKind::User(0x1234));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn host_termination_is_success() {
    let (exec, store) = setup();
    let env = HostModuleBuilder::new("env").with_func(
        "exit",
        FuncType::new([], []),
        |_frame: &CallingFrame, _args: &[Value]| Err::<Vec<Value>, _>(HostFuncError::Terminated),
    );
    exec.register_host_module(&store, env).unwrap();

    let mut module = func_module(
        vec![],
        vec![ValType::I32],
        vec![],
        vec![
            ControlOp::Call(0).into(),
            NumericOp::I32Const(1).into(),
        ],
    );
    module.imports.push(ast::Import {
        module: "env".into(),
        name: "exit".into(),
        desc: ast::ImportDesc::Func(0),
    });
    module.exports[0].index = 1;

    // Terminated is Ok at the invoke boundary, with no results.
    assert_eq!(run_module(&exec, &store, &module, &[]).unwrap(), vec![]);
}

#[test]
fn host_function_cost_is_charged() {
    let config = Config::new()
        .with_statistics(StatisticsConfig {
            instr_count: false,
            cost: true,
            time: false,
        })
        .with_gas_limit(10);
    let (exec, store) = setup_with(config);
    let env = HostModuleBuilder::new("env").with_func_cost(
        "pricey",
        FuncType::new([], []),
        8,
        |_frame: &CallingFrame, _args: &[Value]| Ok(Vec::new()),
    );
    exec.register_host_module(&store, env).unwrap();

    let mut module = func_module(
        vec![],
        vec![],
        vec![],
        vec![ControlOp::Call(0).into(), ControlOp::Call(0).into()],
    );
    module.imports.push(ast::Import {
        module: "env".into(),
        name: "pricey".into(),
        desc: ast::ImportDesc::Func(0),
    });
    module.exports[0].index = 1;

    // call(1) + 8, call(1) would then cross with its own 8.
    let error = run_module(&exec, &store, &module, &[]).unwrap_err();
    assert_eq!(error.trap_code(), Some(TrapCode::CostLimitExceeded));
    assert_eq!(exec.statistics().gas_used(), 10);
}

#[test]
fn host_reentry_through_the_calling_frame() {
    let (exec, store) = setup();
    // The host function re-enters the engine to call "helper".
    let env = HostModuleBuilder::new("env").with_func(
        "reenter",
        FuncType::new([], [ValType::I32]),
        |frame: &CallingFrame, _args: &[Value]| {
            let module = frame.module_instance().expect("called from wasm");
            let helper = module
                .export_by_name("helper")
                .and_then(|export| export.as_func().cloned())
                .expect("helper export");
            let results = frame
                .executor()
                .invoke(&helper, &[])
                .map_err(|_| HostFuncError::Runtime(TrapCode::Unreachable))?;
            Ok(results)
        },
    );
    exec.register_host_module(&store, env).unwrap();

    let mut module = ast::Module::default();
    module
        .types
        .push(RecGroup::single(SubType::final_func(FuncType::new(
            [],
            [ValType::I32],
        ))));
    module.imports.push(ast::Import {
        module: "env".into(),
        name: "reenter".into(),
        desc: ast::ImportDesc::Func(0),
    });
    // func 1: helper returning 31337.
    module.funcs.push(0);
    module.bodies.push(ast::FuncBodyDef {
        locals: vec![],
        body: vec![NumericOp::I32Const(31337).into(), ControlOp::End.into()],
    });
    // func 2: run = call the host, which calls helper.
    module.funcs.push(0);
    module.bodies.push(ast::FuncBodyDef {
        locals: vec![],
        body: vec![ControlOp::Call(0).into(), ControlOp::End.into()],
    });
    module.exports.push(ast::Export {
        name: "helper".into(),
        kind: ast::ExternKind::Func,
        index: 1,
    });
    module.exports.push(ast::Export {
        name: "run".into(),
        kind: ast::ExternKind::Func,
        index: 2,
    });

    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap(),
        vec![Value::I32(31337)]
    );
}

#[test]
fn unknown_and_incompatible_imports_fail() {
    let (exec, store) = setup();
    let env = HostModuleBuilder::new("env").with_func(
        "f",
        FuncType::new([], []),
        |_frame: &CallingFrame, _args: &[Value]| Ok(Vec::new()),
    );
    exec.register_host_module(&store, env).unwrap();

    let mut module = func_module(vec![], vec![], vec![], vec![]);
    module.imports.push(ast::Import {
        module: "env".into(),
        name: "missing".into(),
        desc: ast::ImportDesc::Func(0),
    });
    module.exports[0].index = 1;
    assert_matches!(
        exec.instantiate(&store, &module),
        Err(Error::UnknownImport { .. })
    );

    // Same name, wrong signature.
    let mut module = func_module(vec![], vec![], vec![], vec![]);
    module.types.push(RecGroup::single(SubType::final_func(
        FuncType::new([ValType::I64], []),
    )));
    module.imports.push(ast::Import {
        module: "env".into(),
        name: "f".into(),
        desc: ast::ImportDesc::Func(1),
    });
    module.exports[0].index = 1;
    assert_matches!(
        exec.instantiate(&store, &module),
        Err(Error::IncompatibleImportType { .. })
    );
}

#[test]
fn store_refuses_to_drop_imported_module() {
    let (exec, store) = setup();
    let env = HostModuleBuilder::new("env").with_func(
        "f",
        FuncType::new([], []),
        |_frame: &CallingFrame, _args: &[Value]| Ok(Vec::new()),
    );
    exec.register_host_module(&store, env).unwrap();

    let mut module = func_module(vec![], vec![], vec![], vec![]);
    module.imports.push(ast::Import {
        module: "env".into(),
        name: "f".into(),
        desc: ast::ImportDesc::Func(0),
    });
    module.exports[0].index = 1;
    exec.register_module(&store, "importer", &module).unwrap();

    assert_matches!(store.drop_module("env"), Err(Error::ModuleInUse(_)));
    store.drop_module("importer").unwrap();
    store.drop_module("env").unwrap();
}

struct ClockPlugin;

impl Plugin for ClockPlugin {
    fn name(&self) -> &str {
        "clock"
    }

    fn module(&self) -> HostModuleBuilder {
        HostModuleBuilder::new("clock").with_func(
            "now_ms",
            FuncType::new([], [ValType::I64]),
            |_frame: &CallingFrame, _args: &[Value]| Ok(vec![Value::I64(12345)]),
        )
    }
}

#[test]
fn plugins_register_their_modules() {
    let (exec, store) = setup();
    let mut context = PluginContext::new();
    context.add(Box::new(ClockPlugin));
    exec.register_plugins(&store, &mut context).unwrap();
    assert!(store.contains("clock"));

    let mut module = func_module(vec![], vec![ValType::I64], vec![], vec![
        ControlOp::Call(0).into(),
    ]);
    module.types.push(RecGroup::single(SubType::final_func(
        FuncType::new([], [ValType::I64]),
    )));
    module.imports.push(ast::Import {
        module: "clock".into(),
        name: "now_ms".into(),
        desc: ast::ImportDesc::Func(1),
    });
    module.exports[0].index = 1;
    assert_eq!(
        run_module(&exec, &store, &module, &[]).unwrap(),
        vec![Value::I64(12345)]
    );
}

#[test]
fn forbidden_plugins_are_skipped() {
    let config = Config::new().with_forbidden_plugins(vec!["clock".into()]);
    let (exec, store) = setup_with(config);
    let mut context = PluginContext::new();
    context.add(Box::new(ClockPlugin));
    exec.register_plugins(&store, &mut context).unwrap();
    assert!(!store.contains("clock"));
}
