//! Module instances and external values.
//!
//! A module instance collects the runtime representations of everything a
//! module imports or defines. Each index space lists imported entries
//! first, then defined ones. Components hold *weak* references back to
//! their defining instance, so the instance exclusively owns what it
//! defines and merely borrows what it imports.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::func::FuncRef;
use crate::global::GlobalRef;
use crate::memory::MemoryRef;
use crate::segment::{DataRef, ElementRef};
use crate::table::TableRef;
use crate::types::{
    val_matches, DefType, ExternType, HeapType, RefType, ValType,
};

/// Reference to a [`TagInstance`] with shared ownership semantics.
///
/// Tag identity is allocation identity: two tags are the same exception
/// tag iff their references are pointer-equal.
#[derive(Clone)]
pub struct TagRef(Arc<TagInstance>);

impl core::ops::Deref for TagRef {
    type Target = TagInstance;
    fn deref(&self) -> &TagInstance {
        &self.0
    }
}

impl TagRef {
    /// Whether two references denote the same tag.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for TagRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Runtime representation of an exception tag.
#[derive(Debug)]
pub struct TagInstance {
    ty: DefType,
}

impl TagInstance {
    /// Allocates a tag of the given canonical function type.
    pub fn alloc(ty: DefType) -> TagRef {
        TagRef(Arc::new(TagInstance { ty }))
    }

    /// The canonical function type describing the thrown values.
    pub fn ty(&self) -> &DefType {
        &self.ty
    }
}

/// The runtime representation of an importable or exportable entity.
#[derive(Clone)]
pub enum ExternVal {
    /// A function.
    Func(FuncRef),
    /// A table.
    Table(TableRef),
    /// A linear memory.
    Memory(MemoryRef),
    /// A global.
    Global(GlobalRef),
    /// An exception tag.
    Tag(TagRef),
}

impl fmt::Debug for ExternVal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self {
            Self::Func(_) => "Func",
            Self::Table(_) => "Table",
            Self::Memory(_) => "Memory",
            Self::Global(_) => "Global",
            Self::Tag(_) => "Tag",
        };
        write!(f, "ExternVal {{ {kind} }}")
    }
}

impl ExternVal {
    /// The function reference, if this is a function.
    pub fn as_func(&self) -> Option<&FuncRef> {
        match self {
            Self::Func(func) => Some(func),
            _ => None,
        }
    }

    /// The table reference, if this is a table.
    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Self::Table(table) => Some(table),
            _ => None,
        }
    }

    /// The memory reference, if this is a memory.
    pub fn as_memory(&self) -> Option<&MemoryRef> {
        match self {
            Self::Memory(memory) => Some(memory),
            _ => None,
        }
    }

    /// The global reference, if this is a global.
    pub fn as_global(&self) -> Option<&GlobalRef> {
        match self {
            Self::Global(global) => Some(global),
            _ => None,
        }
    }

    /// The tag reference, if this is a tag.
    pub fn as_tag(&self) -> Option<&TagRef> {
        match self {
            Self::Tag(tag) => Some(tag),
            _ => None,
        }
    }

    /// The external type of the underlying entity.
    pub fn extern_type(&self) -> ExternType {
        match self {
            Self::Func(func) => ExternType::Func(func.def_type().clone()),
            Self::Table(table) => ExternType::Table(table.ty().clone()),
            Self::Memory(memory) => ExternType::Memory(*memory.ty()),
            Self::Global(global) => ExternType::Global(global.ty().clone()),
            Self::Tag(tag) => ExternType::Tag(tag.ty().clone()),
        }
    }
}

/// A module instance: the runtime representation of an instantiated module.
///
/// Created empty by the instantiator and filled during initialization
/// only; afterwards the index spaces are immutable (the instances they
/// refer to have their own interior mutability).
#[derive(Default)]
pub struct ModuleInstance {
    name: RwLock<Option<String>>,
    types: RwLock<Vec<DefType>>,
    funcs: RwLock<Vec<FuncRef>>,
    tables: RwLock<Vec<TableRef>>,
    memories: RwLock<Vec<MemoryRef>>,
    globals: RwLock<Vec<GlobalRef>>,
    tags: RwLock<Vec<TagRef>>,
    elems: RwLock<Vec<ElementRef>>,
    datas: RwLock<Vec<DataRef>>,
    exports: RwLock<IndexMap<String, ExternVal>>,
    start: RwLock<Option<u32>>,
    /// Names of store modules this instance imported from.
    imported_from: RwLock<Vec<String>>,
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &*self.name.read())
            .field("funcs", &self.funcs.read().len())
            .field("tables", &self.tables.read().len())
            .field("memories", &self.memories.read().len())
            .field("globals", &self.globals.read().len())
            .field("exports", &self.exports.read().len())
            .finish()
    }
}

impl ModuleInstance {
    /// Creates an empty instance; the instantiator fills it.
    pub(crate) fn empty() -> Arc<ModuleInstance> {
        Arc::new(ModuleInstance::default())
    }

    /// The name this instance was registered under, if any.
    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = Some(name.to_string());
    }

    pub(crate) fn set_start(&self, start: Option<u32>) {
        *self.start.write() = start;
    }

    /// The start function index, if the module declared one.
    pub fn start(&self) -> Option<u32> {
        *self.start.read()
    }

    pub(crate) fn record_import_source(&self, module_name: &str) {
        let mut sources = self.imported_from.write();
        if !sources.iter().any(|existing| existing == module_name) {
            sources.push(module_name.to_string());
        }
    }

    /// Names of the registered modules this instance imports from.
    pub fn import_sources(&self) -> Vec<String> {
        self.imported_from.read().clone()
    }

    pub(crate) fn push_type(&self, ty: DefType) {
        self.types.write().push(ty);
    }

    pub(crate) fn push_func(&self, func: FuncRef) {
        self.funcs.write().push(func);
    }

    pub(crate) fn push_table(&self, table: TableRef) {
        self.tables.write().push(table);
    }

    pub(crate) fn push_memory(&self, memory: MemoryRef) {
        self.memories.write().push(memory);
    }

    pub(crate) fn push_global(&self, global: GlobalRef) {
        self.globals.write().push(global);
    }

    pub(crate) fn push_tag(&self, tag: TagRef) {
        self.tags.write().push(tag);
    }

    pub(crate) fn push_elem(&self, elem: ElementRef) {
        self.elems.write().push(elem);
    }

    pub(crate) fn push_data(&self, data: DataRef) {
        self.datas.write().push(data);
    }

    pub(crate) fn insert_export(&self, name: impl Into<String>, value: ExternVal) {
        self.exports.write().insert(name.into(), value);
    }

    /// The canonical type at `index` of the type space.
    pub fn type_by_index(&self, index: u32) -> Option<DefType> {
        self.types.read().get(index as usize).cloned()
    }

    /// The function at `index` of the function space.
    pub fn func_by_index(&self, index: u32) -> Option<FuncRef> {
        self.funcs.read().get(index as usize).cloned()
    }

    /// The table at `index` of the table space.
    pub fn table_by_index(&self, index: u32) -> Option<TableRef> {
        self.tables.read().get(index as usize).cloned()
    }

    /// The memory at `index` of the memory space.
    pub fn memory_by_index(&self, index: u32) -> Option<MemoryRef> {
        self.memories.read().get(index as usize).cloned()
    }

    /// The global at `index` of the global space.
    pub fn global_by_index(&self, index: u32) -> Option<GlobalRef> {
        self.globals.read().get(index as usize).cloned()
    }

    /// The tag at `index` of the tag space.
    pub fn tag_by_index(&self, index: u32) -> Option<TagRef> {
        self.tags.read().get(index as usize).cloned()
    }

    /// The element instance at `index`.
    pub fn elem_by_index(&self, index: u32) -> Option<ElementRef> {
        self.elems.read().get(index as usize).cloned()
    }

    /// The data instance at `index`.
    pub fn data_by_index(&self, index: u32) -> Option<DataRef> {
        self.datas.read().get(index as usize).cloned()
    }

    /// Number of functions in the function space.
    pub fn func_count(&self) -> u32 {
        self.funcs.read().len() as u32
    }

    /// Finds an export by name.
    pub fn export_by_name(&self, name: &str) -> Option<ExternVal> {
        self.exports.read().get(name).cloned()
    }

    /// A snapshot of the export map in insertion order.
    pub fn exports(&self) -> Vec<(String, ExternVal)> {
        self.exports
            .read()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Canonicalizes a module-relative heap type.
    pub fn canon_heap(&self, heap: &HeapType) -> HeapType {
        match heap {
            HeapType::Index(index) => {
                let def = self
                    .type_by_index(*index)
                    .expect("validation proved the type index in range");
                HeapType::Def(def)
            }
            other => other.clone(),
        }
    }

    /// Canonicalizes a module-relative reference type.
    pub fn canon_ref_type(&self, ref_type: &RefType) -> RefType {
        RefType {
            nullable: ref_type.nullable,
            heap: self.canon_heap(&ref_type.heap),
        }
    }

    /// Canonicalizes a module-relative value type.
    pub fn canon_val_type(&self, val_type: &ValType) -> ValType {
        match val_type {
            ValType::Ref(ref_type) => ValType::Ref(self.canon_ref_type(ref_type)),
            other => other.clone(),
        }
    }

    /// Whether `sub` matches `sup`, resolving concrete type indices
    /// relative to this instance.
    pub fn matches(&self, sub: &ValType, sup: &ValType) -> bool {
        val_matches(&self.canon_val_type(sub), &self.canon_val_type(sup))
    }
}
