//! Module instantiation.
//!
//! Resolves imports against the store, allocates the defined instances in
//! index-space order, initializes element and data segments (with all
//! bounds proven before the first byte is copied), runs the start function
//! and finally publishes the exports. Instantiation is atomic with respect
//! to the store: nothing becomes observable unless every phase succeeds.

use std::sync::Arc;

use crate::ast::{
    DataMode, ElementMode, ExternKind, ImportDesc, Module,
};
use crate::error::{Error, Trap, TrapCode};
use crate::executor::Executor;
use crate::func::{FuncBody, FuncInstance};
use crate::global::GlobalInstance;
use crate::instance::{ExternVal, ModuleInstance, TagInstance};
use crate::interpreter::eval_const_expr;
use crate::memory::{MemoryInstance, MemoryRef};
use crate::segment::{DataInstance, ElementInstance};
use crate::store::Store;
use crate::table::{TableInstance, TableRef};
use crate::types::{ref_matches, val_matches, DefType, Mutability, RefType, TableType, ValType};
use crate::value::{RefValue, Value};

/// A staged active element segment, bounds-checked before application.
struct ActiveElems {
    table: TableRef,
    offset: u32,
    items: Vec<RefValue>,
}

/// A staged active data segment, bounds-checked before application.
struct ActiveData {
    memory: MemoryRef,
    offset: u64,
    bytes: Vec<u8>,
}

/// Instantiates `module`, optionally registering it under `name`.
pub(crate) fn instantiate(
    exec: &Executor,
    store: &Store,
    module: &Module,
    name: Option<&str>,
) -> Result<Arc<ModuleInstance>, Error> {
    if let Some(name) = name {
        if store.contains(name) {
            return Err(Error::ModuleNameConflict(name.to_string()));
        }
    }
    let instance = ModuleInstance::empty();

    // Types: intern every recursion group.
    let mut resolved: Vec<DefType> = Vec::new();
    for group in &module.types {
        let defs = exec.type_registry().canonicalize(group, &resolved)?;
        for def in &defs {
            instance.push_type(def.clone());
        }
        resolved.extend(defs);
    }

    resolve_imports(store, module, &instance)?;

    // Defined functions: the first entries of each space are imports.
    for (type_idx, body) in module.funcs.iter().zip(&module.bodies) {
        let ty = instance
            .type_by_index(*type_idx)
            .ok_or_else(|| Error::Instantiation(format!("unknown function type {type_idx}")))?;
        let func = FuncInstance::alloc_wasm(
            Arc::downgrade(&instance),
            ty,
            FuncBody::new(body.locals.clone(), body.body.clone()),
        );
        instance.push_func(func);
    }

    // Defined tables, with evaluated initializers where present.
    for table_def in &module.tables {
        let ty = TableType {
            elem: instance.canon_ref_type(&table_def.ty.elem),
            limits: table_def.ty.limits,
        };
        let init = match &table_def.init {
            Some(expr) => match eval_const_expr(exec, &instance, expr)? {
                Value::Ref(ref_value) => ref_value,
                other => {
                    return Err(Error::Instantiation(format!(
                        "table initializer produced non-reference {other:?}"
                    )))
                }
            },
            None => RefValue::Null(ty.elem.heap.clone()),
        };
        instance.push_table(TableInstance::alloc(ty, init)?);
    }

    // Defined memories.
    for memory_type in &module.memories {
        instance.push_memory(MemoryInstance::alloc(
            *memory_type,
            exec.config().max_memory_page(),
        )?);
    }

    // Defined globals; each initializer sees the globals allocated so far.
    for global_def in &module.globals {
        let ty = crate::types::GlobalType {
            content: instance.canon_val_type(&global_def.ty.content),
            mutability: global_def.ty.mutability,
        };
        let value = eval_const_expr(exec, &instance, &global_def.init)?;
        instance.push_global(GlobalInstance::alloc(ty, value)?);
    }

    // Defined tags.
    for tag in &module.tags {
        let ty = instance.type_by_index(tag.type_idx).ok_or_else(|| {
            Error::Instantiation(format!("unknown tag type {}", tag.type_idx))
        })?;
        instance.push_tag(TagInstance::alloc(ty));
    }

    // Element segments: evaluate all items, then prove every active bound
    // before a single element is written.
    let mut active_elems = Vec::new();
    for segment in &module.elems {
        let ty = instance.canon_ref_type(&segment.ty);
        let mut items = Vec::with_capacity(segment.items.len());
        for expr in &segment.items {
            match eval_const_expr(exec, &instance, expr)? {
                Value::Ref(ref_value) => items.push(ref_value),
                other => {
                    return Err(Error::Instantiation(format!(
                        "element initializer produced non-reference {other:?}"
                    )))
                }
            }
        }
        match &segment.mode {
            ElementMode::Active { table, offset } => {
                let table = instance.table_by_index(*table).ok_or_else(|| {
                    Error::Instantiation(format!("unknown table index {table}"))
                })?;
                let offset = eval_offset(exec, &instance, offset)?;
                if offset as u64 + items.len() as u64 > table.size() as u64 {
                    return Err(Trap::from(TrapCode::TableOutOfBounds).into());
                }
                active_elems.push(ActiveElems {
                    table,
                    offset,
                    items,
                });
                // Applied segments are observably empty afterwards.
                instance.push_elem(ElementInstance::alloc(ty, Vec::new()));
            }
            ElementMode::Declarative => {
                instance.push_elem(ElementInstance::alloc(ty, Vec::new()));
            }
            ElementMode::Passive => {
                instance.push_elem(ElementInstance::alloc(ty, items));
            }
        }
    }

    // Data segments, same staging discipline.
    let mut active_datas = Vec::new();
    for segment in &module.datas {
        match &segment.mode {
            DataMode::Active { memory, offset } => {
                let memory = instance.memory_by_index(*memory).ok_or_else(|| {
                    Error::Instantiation(format!("unknown memory index {memory}"))
                })?;
                let offset = eval_offset(exec, &instance, offset)? as u64;
                if offset + segment.data.len() as u64 > memory.byte_len() as u64 {
                    return Err(Trap::from(TrapCode::MemoryOutOfBounds).into());
                }
                active_datas.push(ActiveData {
                    memory,
                    offset,
                    bytes: segment.data.clone(),
                });
                instance.push_data(DataInstance::alloc(Vec::new()));
            }
            DataMode::Passive => {
                instance.push_data(DataInstance::alloc(segment.data.clone()));
            }
        }
    }

    // All bounds proven; apply.
    for staged in active_elems {
        for (i, item) in staged.items.into_iter().enumerate() {
            staged
                .table
                .set(staged.offset + i as u32, item)
                .map_err(Trap::from)?;
        }
    }
    for staged in active_datas {
        staged
            .memory
            .set(staged.offset, &staged.bytes)
            .map_err(Trap::from)?;
    }

    instance.set_start(module.start);
    if let Some(start_idx) = module.start {
        let start = instance.func_by_index(start_idx).ok_or_else(|| {
            Error::Instantiation(format!("unknown start function {start_idx}"))
        })?;
        log::debug!("instantiate: running start function {start_idx}");
        exec.invoke(&start, &[])?;
    }

    // Exports become visible only after the start function succeeded.
    for export in &module.exports {
        let value = match export.kind {
            ExternKind::Func => ExternVal::Func(instance.func_by_index(export.index).ok_or_else(
                || Error::Instantiation(format!("unknown exported function {}", export.index)),
            )?),
            ExternKind::Table => ExternVal::Table(
                instance.table_by_index(export.index).ok_or_else(|| {
                    Error::Instantiation(format!("unknown exported table {}", export.index))
                })?,
            ),
            ExternKind::Memory => ExternVal::Memory(
                instance.memory_by_index(export.index).ok_or_else(|| {
                    Error::Instantiation(format!("unknown exported memory {}", export.index))
                })?,
            ),
            ExternKind::Global => ExternVal::Global(
                instance.global_by_index(export.index).ok_or_else(|| {
                    Error::Instantiation(format!("unknown exported global {}", export.index))
                })?,
            ),
            ExternKind::Tag => {
                ExternVal::Tag(instance.tag_by_index(export.index).ok_or_else(|| {
                    Error::Instantiation(format!("unknown exported tag {}", export.index))
                })?)
            }
        };
        instance.insert_export(export.name.clone(), value);
    }

    if let Some(name) = name {
        store.register(name, Arc::clone(&instance))?;
    }
    log::debug!(
        "instantiate: module {:?} ready ({} functions, {} exports)",
        name,
        instance.func_count(),
        instance.exports().len()
    );
    Ok(instance)
}

fn eval_offset(
    exec: &Executor,
    instance: &Arc<ModuleInstance>,
    expr: &[crate::ast::Instruction],
) -> Result<u32, Error> {
    match eval_const_expr(exec, instance, expr)? {
        Value::I32(offset) => Ok(offset as u32),
        other => Err(Error::Instantiation(format!(
            "segment offset evaluated to {other:?}, expected i32"
        ))),
    }
}

/// Resolves every import against the store and type-checks it.
fn resolve_imports(
    store: &Store,
    module: &Module,
    instance: &Arc<ModuleInstance>,
) -> Result<(), Error> {
    for import in &module.imports {
        let found = store.find_export(&import.module, &import.name)?;
        let mismatch = || Error::IncompatibleImportType {
            module: import.module.clone(),
            name: import.name.clone(),
        };
        match (&import.desc, found) {
            (ImportDesc::Func(type_idx), ExternVal::Func(func)) => {
                let expected = instance.type_by_index(*type_idx).ok_or_else(|| {
                    Error::Instantiation(format!("unknown function type {type_idx}"))
                })?;
                if !func.def_type().matches(&expected) {
                    return Err(mismatch());
                }
                instance.push_func(func);
            }
            (ImportDesc::Table(required), ExternVal::Table(table)) => {
                let required_elem = instance.canon_ref_type(&required.elem);
                if !table.limits().import_matches(&required.limits)
                    || !ref_types_equal(&table.ty().elem, &required_elem)
                {
                    return Err(mismatch());
                }
                instance.push_table(table);
            }
            (ImportDesc::Memory(required), ExternVal::Memory(memory)) => {
                if !memory.limits().import_matches(&required.limits)
                    || memory.is_shared() != required.shared
                {
                    return Err(mismatch());
                }
                instance.push_memory(memory);
            }
            (ImportDesc::Global(required), ExternVal::Global(global)) => {
                let required_content = instance.canon_val_type(&required.content);
                let provided = global.ty();
                let compatible = match required.mutability {
                    // Mutable globals are invariant in their content type.
                    Mutability::Var => {
                        provided.mutability == Mutability::Var
                            && val_types_equal(&provided.content, &required_content)
                    }
                    Mutability::Const => {
                        provided.mutability == Mutability::Const
                            && val_matches(&provided.content, &required_content)
                    }
                };
                if !compatible {
                    return Err(mismatch());
                }
                instance.push_global(global);
            }
            (ImportDesc::Tag(required), ExternVal::Tag(tag)) => {
                let expected = instance.type_by_index(required.type_idx).ok_or_else(|| {
                    Error::Instantiation(format!("unknown tag type {}", required.type_idx))
                })?;
                if tag.ty() != &expected {
                    return Err(mismatch());
                }
                instance.push_tag(tag);
            }
            _ => return Err(mismatch()),
        }
        instance.record_import_source(&import.module);
    }
    Ok(())
}

fn ref_types_equal(a: &RefType, b: &RefType) -> bool {
    ref_matches(a, b) && ref_matches(b, a)
}

fn val_types_equal(a: &ValType, b: &ValType) -> bool {
    val_matches(a, b) && val_matches(b, a)
}
