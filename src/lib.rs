//! # wasmex
//!
//! An embeddable WebAssembly execution engine: the instance model, store,
//! instantiator, instruction interpreter, GC heap, statistics/gas metering
//! and the host-function bridge.
//!
//! The engine consumes modules that are already decoded and validated (the
//! loader and validator are external collaborators; see [`ast::Module`]),
//! instantiates them against a [`Store`] and executes exported functions.
//! The Wasm 2.0 baseline is always available; tail calls, typed function
//! references, garbage collection, multiple memories, relaxed SIMD,
//! exception handling and threads are switched on per [`Config`]
//! [`Proposal`] flags.
//!
//! # Example
//!
//! ```rust
//! use wasmex::ast::{self, ControlOp, NumericOp, VariableOp};
//! use wasmex::{Config, Executor, FuncType, RecGroup, Store, SubType, ValType, Value};
//!
//! // (func (export "add") (param i32 i32) (result i32)
//! //     local.get 0
//! //     local.get 1
//! //     i32.add)
//! let mut module = ast::Module::default();
//! module.types.push(RecGroup::single(SubType::final_func(FuncType::new(
//!     [ValType::I32, ValType::I32],
//!     [ValType::I32],
//! ))));
//! module.funcs.push(0);
//! module.bodies.push(ast::FuncBodyDef {
//!     locals: vec![],
//!     body: vec![
//!         VariableOp::LocalGet(0).into(),
//!         VariableOp::LocalGet(1).into(),
//!         NumericOp::I32Add.into(),
//!         ControlOp::End.into(),
//!     ],
//! });
//! module.exports.push(ast::Export {
//!     name: "add".into(),
//!     kind: ast::ExternKind::Func,
//!     index: 0,
//! });
//!
//! let executor = Executor::new(Config::new());
//! let store = Store::new();
//! let instance = executor.instantiate(&store, &module).unwrap();
//! let results = executor
//!     .invoke_export(&instance, "add", &[Value::I32(7), Value::I32(5)])
//!     .unwrap();
//! assert_eq!(results, vec![Value::I32(12)]);
//! ```

#![warn(missing_docs)]

pub mod ast;

mod async_invoke;
mod config;
mod error;
mod executor;
mod func;
mod gc;
mod global;
mod host;
mod instance;
mod instantiate;
mod interpreter;
mod memory;
mod nan_preserving_float;
mod plugin;
mod segment;
mod statistics;
mod store;
mod table;
mod types;
mod value;

#[cfg(test)]
mod tests;

pub use self::async_invoke::Async;
pub use self::config::{Config, Proposal, ProposalSet, StatisticsConfig};
pub use self::error::{ErrCategory, Error, HostError, Trap, TrapCode, TrapKind};
pub use self::executor::Executor;
pub use self::func::{CompiledEntry, FuncInstance, FuncRef};
pub use self::gc::{GcRef, Heap, ObjectId, TypePack};
pub use self::global::{GlobalInstance, GlobalRef};
pub use self::host::{
    CallingFrame, HostFuncError, HostFunction, HostModuleBuilder, NopHostFunction,
};
pub use self::instance::{ExternVal, ModuleInstance, TagInstance, TagRef};
pub use self::memory::{MemoryInstance, MemoryRef, LINEAR_MEMORY_PAGE_SIZE};
pub use self::nan_preserving_float::{F32, F64};
pub use self::plugin::{Plugin, PluginContext};
pub use self::segment::{DataInstance, DataRef, ElementInstance, ElementRef};
pub use self::statistics::Statistics;
pub use self::store::Store;
pub use self::table::{TableInstance, TableRef};
pub use self::types::{
    heap_matches, ref_matches, val_matches, ArrayType, CompositeType, DefType, ExternType,
    FieldType, FuncType, GlobalType, HeapType, Limits, MemoryType, Mutability, RecGroup, RefType,
    StorageType, StructType, SubType, TableType, TagType, TypeRegistry, ValType,
};
pub use self::value::{ExternRef, FromValue, RefValue, Value};

/// WebAssembly-specific sizes and units.
pub mod memory_units {
    pub use memory_units::wasm32::*;
    pub use memory_units::{size_of, ByteSize, Bytes, RoundUpTo};
}
