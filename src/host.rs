//! The host-function bridge.
//!
//! A host function is a callable bound to a Wasm function type. It receives
//! a [`CallingFrame`] — the narrow view of the engine state it is allowed
//! to touch: the current module instance's memories and the executor handle
//! for well-defined re-entry — plus the arguments in declared order, and
//! returns either results, graceful termination of the whole invocation, or
//! a structured error that the engine converts into a trap.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Trap, TrapCode};
use crate::executor::Executor;
use crate::func::FuncInstance;
use crate::global::GlobalRef;
use crate::instance::{ExternVal, ModuleInstance, TagInstance};
use crate::memory::MemoryRef;
use crate::table::TableRef;
use crate::types::FuncType;
use crate::value::Value;

/// The outcome of a failed or terminated host call.
#[derive(Debug)]
pub enum HostFuncError {
    /// A Wasm-semantics trap to raise.
    Runtime(TrapCode),
    /// A user-defined error code (24 bits), surfaced verbatim.
    User(u32),
    /// Graceful early exit of the whole invocation; success to callers.
    Terminated,
}

impl From<HostFuncError> for Trap {
    fn from(err: HostFuncError) -> Self {
        match err {
            HostFuncError::Runtime(code) => Trap::from(code),
            HostFuncError::User(code) => Trap::user(code),
            HostFuncError::Terminated => Trap::from(TrapCode::Terminated),
        }
    }
}

/// A host implementation of a Wasm function.
pub trait HostFunction: Send + Sync {
    /// Invokes the function.
    ///
    /// `args` are in declared order; the returned values must match the
    /// declared result types in declared order.
    fn call(&self, frame: &CallingFrame, args: &[Value]) -> Result<Vec<Value>, HostFuncError>;
}

impl<F> HostFunction for F
where
    F: Fn(&CallingFrame, &[Value]) -> Result<Vec<Value>, HostFuncError> + Send + Sync,
{
    fn call(&self, frame: &CallingFrame, args: &[Value]) -> Result<Vec<Value>, HostFuncError> {
        self(frame, args)
    }
}

/// The view of the engine a host function is handed.
pub struct CallingFrame<'a> {
    executor: &'a Executor,
    module: Option<Arc<ModuleInstance>>,
}

impl<'a> CallingFrame<'a> {
    pub(crate) fn new(executor: &'a Executor, module: Option<Arc<ModuleInstance>>) -> Self {
        Self { executor, module }
    }

    /// The executor, for re-entering the engine.
    ///
    /// Re-entrant calls get their own frames and are accounted to Wasm
    /// time for their duration.
    pub fn executor(&self) -> &Executor {
        self.executor
    }

    /// The module instance of the calling frame, if the caller was Wasm.
    pub fn module_instance(&self) -> Option<&Arc<ModuleInstance>> {
        self.module.as_ref()
    }

    /// The caller's memory at `index` of its memory space.
    pub fn memory(&self, index: u32) -> Option<MemoryRef> {
        self.module
            .as_ref()
            .and_then(|module| module.memory_by_index(index))
    }
}

impl fmt::Debug for CallingFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CallingFrame")
            .field("module", &self.module)
            .finish()
    }
}

type HostFuncEntry = (String, FuncType, Arc<dyn HostFunction>, Option<u64>);

/// Builder for a host-defined module instance.
///
/// Function types may use numeric, vector and abstract reference types;
/// concrete type indices have no meaning outside a module and are
/// rejected at build time.
pub struct HostModuleBuilder {
    name: String,
    funcs: Vec<HostFuncEntry>,
    tables: Vec<(String, TableRef)>,
    memories: Vec<(String, MemoryRef)>,
    globals: Vec<(String, GlobalRef)>,
    tags: Vec<(String, FuncType)>,
}

impl HostModuleBuilder {
    /// Starts a host module named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            funcs: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// The module name this builder registers under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exports a host function.
    pub fn with_func(
        mut self,
        name: impl Into<String>,
        ty: FuncType,
        callback: impl HostFunction + 'static,
    ) -> Self {
        self.funcs.push((name.into(), ty, Arc::new(callback), None));
        self
    }

    /// Exports a host function with a per-call gas cost.
    pub fn with_func_cost(
        mut self,
        name: impl Into<String>,
        ty: FuncType,
        cost: u64,
        callback: impl HostFunction + 'static,
    ) -> Self {
        self.funcs
            .push((name.into(), ty, Arc::new(callback), Some(cost)));
        self
    }

    /// Exports a table.
    pub fn with_table(mut self, name: impl Into<String>, table: TableRef) -> Self {
        self.tables.push((name.into(), table));
        self
    }

    /// Exports a memory.
    pub fn with_memory(mut self, name: impl Into<String>, memory: MemoryRef) -> Self {
        self.memories.push((name.into(), memory));
        self
    }

    /// Exports a global.
    pub fn with_global(mut self, name: impl Into<String>, global: GlobalRef) -> Self {
        self.globals.push((name.into(), global));
        self
    }

    /// Exports an exception tag.
    pub fn with_tag(mut self, name: impl Into<String>, ty: FuncType) -> Self {
        self.tags.push((name.into(), ty));
        self
    }

    /// Builds the module instance against `executor`'s type registry.
    pub fn build(self, executor: &Executor) -> Result<Arc<ModuleInstance>, Error> {
        let proposals = executor.config().proposals();
        for (_, ty, _, _) in &self.funcs {
            for val_type in ty.params().iter().chain(ty.results()) {
                val_type.validate(proposals)?;
                if let crate::types::ValType::Ref(ref_type) = val_type {
                    if matches!(ref_type.heap, crate::types::HeapType::Index(_)) {
                        return Err(Error::MalformedRefType);
                    }
                }
            }
        }
        let instance = ModuleInstance::empty();
        for (name, ty, callback, cost) in self.funcs {
            let def = executor.type_registry().func_type(ty);
            let func = FuncInstance::alloc_host(def, callback, cost);
            instance.push_func(func.clone());
            instance.insert_export(name, ExternVal::Func(func));
        }
        for (name, table) in self.tables {
            instance.push_table(table.clone());
            instance.insert_export(name, ExternVal::Table(table));
        }
        for (name, memory) in self.memories {
            instance.push_memory(memory.clone());
            instance.insert_export(name, ExternVal::Memory(memory));
        }
        for (name, global) in self.globals {
            instance.push_global(global.clone());
            instance.insert_export(name, ExternVal::Global(global));
        }
        for (name, ty) in self.tags {
            let def = executor.type_registry().func_type(ty);
            let tag = TagInstance::alloc(def);
            instance.push_tag(tag.clone());
            instance.insert_export(name, ExternVal::Tag(tag));
        }
        instance.set_name(&self.name);
        Ok(instance)
    }
}

/// A [`HostFunction`] that traps [`TrapCode::Unreachable`] on every call.
///
/// Handy placeholder in tests and partially wired host modules.
pub struct NopHostFunction;

impl HostFunction for NopHostFunction {
    fn call(&self, _frame: &CallingFrame, _args: &[Value]) -> Result<Vec<Value>, HostFuncError> {
        Err(HostFuncError::Runtime(TrapCode::Unreachable))
    }
}
