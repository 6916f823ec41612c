//! Gas metering, instruction counting, cancellation, timeouts and async
//! invocation.

use std::time::{Duration, Instant};

use crate::ast::{BlockType, ControlOp, NumericOp, VariableOp};
use crate::{Config, StatisticsConfig, TrapCode, ValType, Value};

use super::{func_module, run_module, setup_with};

fn stats_config(instr_count: bool, cost: bool, time: bool) -> StatisticsConfig {
    StatisticsConfig {
        instr_count,
        cost,
        time,
    }
}

/// `run()`: an infinite loop.
fn spin_module() -> crate::ast::Module {
    func_module(
        vec![],
        vec![],
        vec![],
        vec![
            ControlOp::Loop(BlockType::Empty).into(),
            ControlOp::Br(0).into(),
            ControlOp::End.into(),
        ],
    )
}

#[test]
fn gas_accounting_of_a_trapping_invocation() {
    let config = Config::new().with_statistics(stats_config(true, true, false));
    let (exec, store) = setup_with(config);
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
    // Two local.get plus the div itself, all at the default cost of 1.
    assert_eq!(exec.statistics().gas_used(), 3);
    assert_eq!(exec.statistics().instr_count(), 3);
}

#[test]
fn gas_limit_stops_runaway_execution() {
    let config = Config::new()
        .with_statistics(stats_config(true, true, false))
        .with_gas_limit(1000);
    let (exec, store) = setup_with(config);
    let result = run_module(&exec, &store, &spin_module(), &[]);
    assert_eq!(
        result.unwrap_err().trap_code(),
        Some(TrapCode::CostLimitExceeded)
    );
    // Saturated at the limit, never beyond.
    assert_eq!(exec.statistics().gas_used(), 1000);
    // The crossing opcode did not retire.
    assert_eq!(exec.statistics().instr_count(), 1000);
}

#[test]
fn custom_cost_table_is_consulted() {
    let config = Config::new()
        .with_statistics(stats_config(false, true, false))
        .with_gas_limit(u64::MAX);
    let (exec, store) = setup_with(config);
    // local.get costs 3, i32.add costs 5 now.
    exec.statistics().set_cost(0x20, 3);
    exec.statistics().set_cost(0x6a, 5);
    let module = func_module(
        vec![ValType::I32],
        vec![ValType::I32],
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            VariableOp::LocalGet(0).into(),
            NumericOp::I32Add.into(),
        ],
    );
    run_module(&exec, &store, &module, &[Value::I32(2)]).unwrap();
    // 3 + 3 + 5 + the function-end instruction at the default cost of 1.
    assert_eq!(exec.statistics().gas_used(), 12);
}

#[test]
fn instruction_count_of_a_simple_body() {
    let config = Config::new().with_statistics(stats_config(true, false, false));
    let (exec, store) = setup_with(config);
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
    run_module(&exec, &store, &module, &[Value::I32(1), Value::I32(2)]).unwrap();
    // Including the implicit function-end instruction.
    assert_eq!(exec.statistics().instr_count(), 4);
    exec.statistics().clear();
    assert_eq!(exec.statistics().instr_count(), 0);
}

#[test]
fn cancellation_interrupts_an_async_invocation() {
    let (exec, store) = setup_with(Config::new());
    let instance = exec.instantiate(&store, &spin_module()).unwrap();
    let func = instance
        .export_by_name("run")
        .and_then(|export| export.as_func().cloned())
        .unwrap();

    let handle = exec.invoke_async(&func, &[]);
    assert!(!handle.wait_for(Duration::from_millis(50)));

    let cancelled_at = Instant::now();
    handle.cancel();
    handle.wait();
    // Liveness: the flag is observed within an opcode boundary.
    assert!(cancelled_at.elapsed() < Duration::from_secs(5));
    let result = handle.get();
    assert_eq!(result.unwrap_err().trap_code(), Some(TrapCode::Interrupted));
}

#[test]
fn cancelling_one_async_invocation_leaves_others_alone() {
    let (exec, store) = setup_with(Config::new());
    let instance = exec.instantiate(&store, &spin_module()).unwrap();
    let func = instance
        .export_by_name("run")
        .and_then(|export| export.as_func().cloned())
        .unwrap();

    let doomed = exec.invoke_async(&func, &[]);
    let survivor = exec.invoke_async(&func, &[]);
    doomed.cancel();
    doomed.wait();
    assert!(!survivor.wait_for(Duration::from_millis(100)));
    survivor.cancel();
    survivor.wait();
}

#[test]
fn time_limit_interrupts_execution() {
    let config = Config::new().with_time_limit_ms(50);
    let (exec, store) = setup_with(config);
    let started = Instant::now();
    let result = run_module(&exec, &store, &spin_module(), &[]);
    assert_eq!(result.unwrap_err().trap_code(), Some(TrapCode::Interrupted));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn executor_is_reusable_after_cancellation() {
    let config = Config::new().with_time_limit_ms(20);
    let (exec, store) = setup_with(config);
    let result = run_module(&exec, &store, &spin_module(), &[]);
    assert_eq!(result.unwrap_err().trap_code(), Some(TrapCode::Interrupted));

    // The stale flag must not kill the next invocation.
    let add = func_module(
        vec![],
        vec![ValType::I32],
        vec![],
        vec![NumericOp::I32Const(3).into()],
    );
    assert_eq!(
        run_module(&exec, &store, &add, &[]).unwrap(),
        vec![Value::I32(3)]
    );
}

#[test]
fn async_results_are_shared() {
    let (exec, store) = setup_with(Config::new());
    let module = func_module(
        vec![ValType::I32],
        vec![ValType::I32],
        vec![],
        vec![
            VariableOp::LocalGet(0).into(),
            NumericOp::I32Const(1).into(),
            NumericOp::I32Add.into(),
        ],
    );
    let instance = exec.instantiate(&store, &module).unwrap();
    let func = instance
        .export_by_name("run")
        .and_then(|export| export.as_func().cloned())
        .unwrap();
    let handle = exec.invoke_async(&func, &[Value::I32(41)]);
    assert_eq!(handle.get().unwrap(), vec![Value::I32(42)]);
    assert_eq!(handle.get().unwrap(), vec![Value::I32(42)]);
}
