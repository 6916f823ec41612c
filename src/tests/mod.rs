//! End-to-end tests: modules are built as decoded ASTs (the Loader is an
//! external collaborator) and run through the public executor surface.

mod exec;
mod gc;
mod host;
mod wasm;

use crate::ast::{self, ControlOp, Instruction};
use crate::{
    Config, Executor, FuncType, RecGroup, Store, SubType, ValType, Value,
};

/// A module with one exported function `"run"` of the given signature.
pub(crate) fn func_module(
    params: Vec<ValType>,
    results: Vec<ValType>,
    locals: Vec<(u32, ValType)>,
    mut body: Vec<Instruction>,
) -> ast::Module {
    body.push(ControlOp::End.into());
    let mut module = ast::Module::default();
    module
        .types
        .push(RecGroup::single(SubType::final_func(FuncType::new(
            params, results,
        ))));
    module.funcs.push(0);
    module.bodies.push(ast::FuncBodyDef { locals, body });
    module.exports.push(ast::Export {
        name: "run".into(),
        kind: ast::ExternKind::Func,
        index: 0,
    });
    module
}

/// Executor plus store with default configuration.
pub(crate) fn setup() -> (Executor, Store) {
    (Executor::new(Config::new()), Store::new())
}

/// Executor plus store with a custom configuration.
pub(crate) fn setup_with(config: Config) -> (Executor, Store) {
    (Executor::new(config), Store::new())
}

/// Instantiates `module` and invokes its `"run"` export.
pub(crate) fn run_module(
    exec: &Executor,
    store: &Store,
    module: &ast::Module,
    args: &[Value],
) -> Result<Vec<Value>, crate::Error> {
    let instance = exec.instantiate(store, module)?;
    exec.invoke_export(&instance, "run", args)
}
