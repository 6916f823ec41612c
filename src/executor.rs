//! The executor: configuration, statistics, cancellation and the public
//! invocation entry points.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::ast::Module;
use crate::async_invoke::Async;
use crate::config::Config;
use crate::error::Error;
use crate::func::FuncRef;
use crate::gc::Heap;
use crate::host::HostModuleBuilder;
use crate::instance::ModuleInstance;
use crate::instantiate;
use crate::interpreter::Interpreter;
use crate::plugin::PluginContext;
use crate::statistics::Statistics;
use crate::store::Store;
use crate::types::TypeRegistry;
use crate::value::Value;

/// The execution engine.
///
/// Owns the configuration, the shared statistics, the GC heap, the type
/// registry and the cancellation flag. Cloning is cheap and shares all of
/// them; [`Executor::invoke_async`] clones with a fresh flag so that each
/// async invocation cancels independently.
#[derive(Clone)]
pub struct Executor {
    config: Arc<Config>,
    stats: Arc<Statistics>,
    stop: Arc<AtomicBool>,
    /// Invocation nesting depth; a fresh outermost invoke clears a stale
    /// cancellation flag, a host re-entry must not.
    depth: Arc<AtomicU32>,
    heap: Arc<Heap>,
    types: Arc<TypeRegistry>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Executor {
    /// Creates an executor with fresh statistics.
    pub fn new(config: Config) -> Self {
        let stats = Arc::new(Statistics::new());
        Self::with_statistics(config, stats)
    }

    /// Creates an executor sharing an embedder-owned statistics object.
    pub fn with_statistics(config: Config, stats: Arc<Statistics>) -> Self {
        stats.set_gas_limit(config.gas_limit());
        let heap = Heap::new(
            config.gc_threshold(),
            config.gc_interval_ms(),
            config.gc_collector_threads(),
        );
        Self {
            config: Arc::new(config),
            stats,
            stop: Arc::new(AtomicBool::new(false)),
            depth: Arc::new(AtomicU32::new(0)),
            heap,
            types: Arc::new(TypeRegistry::new()),
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared statistics.
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// The GC heap.
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// The engine-wide type registry.
    pub fn type_registry(&self) -> &TypeRegistry {
        &self.types
    }

    /// Requests cancellation of the running invocation.
    ///
    /// Observed at every opcode boundary, at every host return, and inside
    /// blocking primitives; the invocation unwinds with
    /// [`TrapCode::Interrupted`](crate::TrapCode::Interrupted).
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn cancel_flag(&self) -> &AtomicBool {
        &self.stop
    }

    /// Runs one synchronous GC cycle.
    pub fn collect_garbage(&self) {
        self.heap.collect_now();
    }

    /// Instantiates `module` against `store` without registering it.
    pub fn instantiate(
        &self,
        store: &Store,
        module: &Module,
    ) -> Result<Arc<ModuleInstance>, Error> {
        instantiate::instantiate(self, store, module, None)
    }

    /// Instantiates `module` and registers it under `name`.
    pub fn register_module(
        &self,
        store: &Store,
        name: &str,
        module: &Module,
    ) -> Result<Arc<ModuleInstance>, Error> {
        instantiate::instantiate(self, store, module, Some(name))
    }

    /// Builds a host module and registers it under the builder's name.
    pub fn register_host_module(
        &self,
        store: &Store,
        builder: HostModuleBuilder,
    ) -> Result<Arc<ModuleInstance>, Error> {
        let name = builder.name().to_string();
        let instance = builder.build(self)?;
        store.register(&name, Arc::clone(&instance))?;
        Ok(instance)
    }

    /// Initializes and registers every plug-in of `context`, honoring the
    /// configured `forbidden_plugins` list.
    pub fn register_plugins(
        &self,
        store: &Store,
        context: &mut PluginContext,
    ) -> Result<(), Error> {
        for plugin in context.plugins_mut() {
            let name = plugin.name().to_string();
            if self
                .config
                .forbidden_plugins()
                .iter()
                .any(|forbidden| forbidden == &name)
            {
                log::debug!("plugins: skipping forbidden plug-in {name:?}");
                continue;
            }
            plugin.init(&self.config)?;
            self.register_host_module(store, plugin.module())?;
        }
        Ok(())
    }

    /// Invokes `func` with `args` and returns the results.
    ///
    /// Traps are recovered only here: the interpreter unwinds
    /// unconditionally and this boundary converts the outcome. A
    /// host-requested graceful termination is surfaced as success with no
    /// results.
    pub fn invoke(&self, func: &FuncRef, args: &[Value]) -> Result<Vec<Value>, Error> {
        self.invoke_inner(func, args, true)
    }

    fn invoke_inner(
        &self,
        func: &FuncRef,
        args: &[Value],
        reset_stale_cancel: bool,
    ) -> Result<Vec<Value>, Error> {
        if self.depth.fetch_add(1, Ordering::AcqRel) == 0 && reset_stale_cancel {
            // A stale flag from a previous cancelled invocation must not
            // kill this one; a pending cancellation during re-entry must.
            self.stop.store(false, Ordering::Relaxed);
        }
        let stat_cfg = self.config.statistics();
        if stat_cfg.time {
            self.stats.start_record_wasm();
        }
        let _watchdog = Watchdog::arm(Arc::clone(&self.stop), self.config.time_limit_ms());
        let mut interpreter = Interpreter::new(self);
        let result = interpreter.invoke(func, args);
        if stat_cfg.time {
            self.stats.stop_record_wasm();
        }
        self.depth.fetch_sub(1, Ordering::AcqRel);
        match result {
            Ok(values) => Ok(values),
            Err(trap) if trap.is_terminated() => Ok(Vec::new()),
            Err(trap) => Err(Error::Trap(trap)),
        }
    }

    /// Invokes the function exported from `instance` under `name`.
    pub fn invoke_export(
        &self,
        instance: &ModuleInstance,
        name: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, Error> {
        let export = instance
            .export_by_name(name)
            .ok_or_else(|| Error::UnknownExport(name.to_string()))?;
        let func = export
            .as_func()
            .ok_or_else(|| Error::UnknownExport(name.to_string()))?
            .clone();
        self.invoke(&func, args)
    }

    /// Invokes `func` on its own thread and returns a cancellable handle.
    ///
    /// The handle's flag is independent of this executor's, so cancelling
    /// one async invocation leaves others running.
    pub fn invoke_async(
        &self,
        func: &FuncRef,
        args: &[Value],
    ) -> Async<Result<Vec<Value>, Error>> {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut exec = self.clone();
        exec.stop = Arc::clone(&cancel);
        exec.depth = Arc::new(AtomicU32::new(0));
        let func = func.clone();
        let args = args.to_vec();
        // The fresh flag may be set through the handle before the thread
        // gets to run; never clear it.
        Async::spawn(cancel, move || exec.invoke_inner(&func, &args, false))
    }
}

/// Arms the wall-clock ceiling: a timer thread that sets the cancellation
/// flag when the limit elapses, torn down when the invocation returns.
struct Watchdog {
    state: Option<Arc<(Mutex<bool>, Condvar)>>,
}

impl Watchdog {
    fn arm(stop: Arc<AtomicBool>, limit_ms: u64) -> Watchdog {
        if limit_ms == 0 {
            return Watchdog { state: None };
        }
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = Arc::clone(&state);
        std::thread::Builder::new()
            .name("wasmex-watchdog".into())
            .spawn(move || {
                let (finished, condvar) = &*shared;
                let mut finished = finished.lock();
                let deadline = std::time::Instant::now() + Duration::from_millis(limit_ms);
                while !*finished {
                    if condvar.wait_until(&mut finished, deadline).timed_out() {
                        if !*finished {
                            stop.store(true, Ordering::Relaxed);
                        }
                        return;
                    }
                }
            })
            .expect("failed to spawn watchdog thread");
        Watchdog { state: Some(state) }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            let (finished, condvar) = &**state;
            *finished.lock() = true;
            condvar.notify_all();
        }
    }
}
