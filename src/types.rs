//! Value types, composite (GC) types and subtyping.
//!
//! Concrete (index) types are *defining-instance-relative* in the decoded
//! module and become position-independent only after canonicalization:
//! every recursion group is interned in the engine-wide [`TypeRegistry`]
//! so that two types from different modules are identical iff their
//! structural expansions coincide. At runtime all concrete heap types are
//! [`HeapType::Def`] handles whose identity is pointer identity into the
//! registry.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{Proposal, ProposalSet};
use crate::error::Error;

/// The heap type of a reference.
#[derive(Clone)]
pub enum HeapType {
    /// The common supertype of all function references.
    Func,
    /// Opaque host-supplied references.
    Extern,
    /// The common supertype of all internal references.
    Any,
    /// References that can be compared with `ref.eq`.
    Eq,
    /// Unboxed 31-bit integers.
    I31,
    /// The common supertype of all struct references.
    Struct,
    /// The common supertype of all array references.
    Array,
    /// The bottom type of the internal hierarchy.
    None,
    /// The bottom type of the external hierarchy.
    NoExtern,
    /// The bottom type of the function hierarchy.
    NoFunc,
    /// The bottom type of the exception hierarchy.
    NoExn,
    /// A concrete type index into the defining module's type space.
    ///
    /// Only meaningful inside a decoded module; instantiation replaces it
    /// with [`HeapType::Def`].
    Index(u32),
    /// A back reference into the enclosing recursion group.
    ///
    /// Only appears inside interned group structures.
    Rec(u32),
    /// A canonicalized concrete type.
    Def(DefType),
}

impl HeapType {
    /// Whether this is one of the abstract (non-concrete) heap types.
    pub fn is_abstract(&self) -> bool {
        !matches!(self, Self::Index(_) | Self::Rec(_) | Self::Def(_))
    }

    /// The bottom type of the hierarchy this heap type belongs to.
    pub fn bottom(&self) -> HeapType {
        match self {
            Self::Func | Self::NoFunc => Self::NoFunc,
            Self::Extern | Self::NoExtern => Self::NoExtern,
            Self::NoExn => Self::NoExn,
            Self::Def(def) if def.comp().is_func() => Self::NoFunc,
            _ => Self::None,
        }
    }
}

impl PartialEq for HeapType {
    fn eq(&self, other: &Self) -> bool {
        use HeapType::*;
        match (self, other) {
            (Func, Func) | (Extern, Extern) | (Any, Any) | (Eq, Eq) | (I31, I31)
            | (Struct, Struct) | (Array, Array) | (None, None) | (NoExtern, NoExtern)
            | (NoFunc, NoFunc) | (NoExn, NoExn) => true,
            (Index(a), Index(b)) | (Rec(a), Rec(b)) => a == b,
            (Def(a), Def(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for HeapType {}

impl Hash for HeapType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Self::Index(idx) | Self::Rec(idx) => idx.hash(state),
            Self::Def(def) => def.hash(state),
            _ => {}
        }
    }
}

impl fmt::Debug for HeapType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Func => f.write_str("func"),
            Self::Extern => f.write_str("extern"),
            Self::Any => f.write_str("any"),
            Self::Eq => f.write_str("eq"),
            Self::I31 => f.write_str("i31"),
            Self::Struct => f.write_str("struct"),
            Self::Array => f.write_str("array"),
            Self::None => f.write_str("none"),
            Self::NoExtern => f.write_str("noextern"),
            Self::NoFunc => f.write_str("nofunc"),
            Self::NoExn => f.write_str("noexn"),
            Self::Index(idx) => write!(f, "(type {idx})"),
            Self::Rec(idx) => write!(f, "(rec {idx})"),
            Self::Def(def) => write!(f, "(def {:p}.{})", Arc::as_ptr(&def.group), def.index),
        }
    }
}

/// A reference type: nullability plus heap type.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RefType {
    /// Whether null inhabits the type.
    pub nullable: bool,
    /// The heap type of non-null values.
    pub heap: HeapType,
}

impl RefType {
    /// A nullable reference to `heap`.
    pub fn nullable(heap: HeapType) -> Self {
        Self {
            nullable: true,
            heap,
        }
    }

    /// A non-nullable reference to `heap`.
    pub fn non_null(heap: HeapType) -> Self {
        Self {
            nullable: false,
            heap,
        }
    }

    /// The classic `funcref` type.
    pub fn funcref() -> Self {
        Self::nullable(HeapType::Func)
    }

    /// The classic `externref` type.
    pub fn externref() -> Self {
        Self::nullable(HeapType::Extern)
    }
}

impl fmt::Debug for RefType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.nullable {
            write!(f, "(ref null {:?})", self.heap)
        } else {
            write!(f, "(ref {:?})", self.heap)
        }
    }
}

/// The type of a value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ValType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 128-bit vector.
    V128,
    /// Reference.
    Ref(RefType),
}

impl ValType {
    /// Whether the type is a reference type.
    pub fn is_ref(&self) -> bool {
        matches!(self, Self::Ref(_))
    }

    /// Checks the type against the negotiated proposal set.
    ///
    /// Concrete reference types need the function-references proposal (or
    /// GC, which implies it); the abstract GC heap types need GC itself.
    pub fn validate(&self, proposals: ProposalSet) -> Result<(), Error> {
        let Self::Ref(ref_type) = self else {
            return Ok(());
        };
        let func_refs = proposals.contains(Proposal::FunctionReferences)
            || proposals.contains(Proposal::GC);
        match ref_type.heap {
            HeapType::Func | HeapType::Extern => Ok(()),
            HeapType::Index(_) | HeapType::Rec(_) | HeapType::Def(_) => {
                if func_refs {
                    Ok(())
                } else {
                    Err(Error::MalformedRefType)
                }
            }
            HeapType::NoFunc | HeapType::NoExtern | HeapType::NoExn => {
                if func_refs {
                    Ok(())
                } else {
                    Err(Error::MalformedValType)
                }
            }
            HeapType::Any
            | HeapType::Eq
            | HeapType::I31
            | HeapType::Struct
            | HeapType::Array
            | HeapType::None => {
                if proposals.contains(Proposal::GC) {
                    Ok(())
                } else {
                    Err(Error::MalformedValType)
                }
            }
        }
    }
}

impl fmt::Debug for ValType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::I32 => f.write_str("i32"),
            Self::I64 => f.write_str("i64"),
            Self::F32 => f.write_str("f32"),
            Self::F64 => f.write_str("f64"),
            Self::V128 => f.write_str("v128"),
            Self::Ref(ref_type) => ref_type.fmt(f),
        }
    }
}

/// Storage type of a struct field or array element.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum StorageType {
    /// A full value type.
    Val(ValType),
    /// A packed 8-bit integer field.
    I8,
    /// A packed 16-bit integer field.
    I16,
}

impl StorageType {
    /// Size of one stored element in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::Val(ValType::I32) | Self::Val(ValType::F32) => 4,
            Self::Val(ValType::I64) | Self::Val(ValType::F64) => 8,
            Self::Val(ValType::V128) => 16,
            Self::Val(ValType::Ref(_)) => 8,
        }
    }

    /// Whether the storage is one of the packed integer forms.
    pub fn is_packed(&self) -> bool {
        matches!(self, Self::I8 | Self::I16)
    }

    /// The value type this storage unpacks to.
    pub fn unpacked(&self) -> ValType {
        match self {
            Self::I8 | Self::I16 => ValType::I32,
            Self::Val(val_type) => val_type.clone(),
        }
    }
}

/// Mutability of a global or field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mutability {
    /// Immutable.
    Const,
    /// Mutable.
    Var,
}

/// A struct field or array element type.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FieldType {
    /// Storage of the field.
    pub storage: StorageType,
    /// Whether the field can be written after construction.
    pub mutability: Mutability,
}

/// A function type: parameters and results.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    params: Box<[ValType]>,
    results: Box<[ValType]>,
}

impl FuncType {
    /// Creates a function type from parameter and result types.
    pub fn new<P, R>(params: P, results: R) -> Self
    where
        P: IntoIterator<Item = ValType>,
        R: IntoIterator<Item = ValType>,
    {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    /// The parameter types.
    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    /// The result types.
    pub fn results(&self) -> &[ValType] {
        &self.results
    }
}

impl fmt::Debug for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "fn{:?} -> {:?}", self.params, self.results)
    }
}

/// A struct type: an ordered list of fields.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct StructType {
    /// Field types in declaration order.
    pub fields: Box<[FieldType]>,
}

/// An array type: a single element type.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ArrayType {
    /// The element type.
    pub field: FieldType,
}

/// The composite shape of a defined type.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum CompositeType {
    /// A function signature.
    Func(FuncType),
    /// A struct shape.
    Struct(StructType),
    /// An array shape.
    Array(ArrayType),
}

impl CompositeType {
    /// Whether the composite is a function type.
    pub fn is_func(&self) -> bool {
        matches!(self, Self::Func(_))
    }

    /// Whether the composite is a struct type.
    pub fn is_struct(&self) -> bool {
        matches!(self, Self::Struct(_))
    }

    /// Whether the composite is an array type.
    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    /// The function signature, if the composite is one.
    pub fn func_type(&self) -> Option<&FuncType> {
        match self {
            Self::Func(func_type) => Some(func_type),
            _ => None,
        }
    }
}

/// A declared subtype: composite shape plus declared supertypes.
#[derive(Clone, Debug)]
pub struct SubType {
    /// Whether further subtyping of this type is forbidden.
    pub is_final: bool,
    /// Declared supertype indices (at most one in current Wasm).
    pub supers: Vec<u32>,
    /// The structural shape.
    pub comp: CompositeType,
}

impl SubType {
    /// A final subtype with no declared supertypes.
    pub fn final_func(func_type: FuncType) -> Self {
        Self {
            is_final: true,
            supers: Vec::new(),
            comp: CompositeType::Func(func_type),
        }
    }
}

/// A recursion group of mutually referring types.
#[derive(Clone, Debug)]
pub struct RecGroup {
    /// The member subtypes, in declaration order.
    pub types: Vec<SubType>,
}

impl RecGroup {
    /// A group with a single member, the common case.
    pub fn single(sub: SubType) -> Self {
        Self { types: vec![sub] }
    }
}

/// Resizable limits of tables and memories.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Initial size.
    pub min: u32,
    /// Optional maximum size.
    pub max: Option<u32>,
}

impl Limits {
    /// Creates limits from an initial size and an optional maximum.
    pub fn new(min: u32, max: Option<u32>) -> Self {
        Self { min, max }
    }

    /// Rejects limits whose maximum lies below the minimum.
    pub fn validate(&self) -> Result<(), Error> {
        match self.max {
            Some(max) if max < self.min => Err(Error::Instantiation(format!(
                "maximum limit {max} is less than minimum {}",
                self.min
            ))),
            _ => Ok(()),
        }
    }

    /// Whether `self` (provided) satisfies `required` for imports.
    pub fn import_matches(&self, required: &Limits) -> bool {
        if self.min < required.min {
            return false;
        }
        match (self.max, required.max) {
            (_, None) => true,
            (Some(provided), Some(required)) => provided <= required,
            (None, Some(_)) => false,
        }
    }
}

/// The type of a table.
#[derive(Clone, Debug, PartialEq)]
pub struct TableType {
    /// Element reference type.
    pub elem: RefType,
    /// Size limits in elements.
    pub limits: Limits,
}

/// The type of a linear memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryType {
    /// Size limits in 64 KiB pages.
    pub limits: Limits,
    /// Whether the memory may be shared between threads.
    pub shared: bool,
}

/// The type of a global.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalType {
    /// The content value type.
    pub content: ValType,
    /// Whether `global.set` is permitted.
    pub mutability: Mutability,
}

/// The type of an exception tag; indexes the defining module's type space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TagType {
    /// Function-type index describing the thrown values.
    pub type_idx: u32,
}

/// The external type of an importable or exportable item.
#[derive(Clone, Debug)]
pub enum ExternType {
    /// A function of the given canonical type.
    Func(DefType),
    /// A table.
    Table(TableType),
    /// A linear memory.
    Memory(MemoryType),
    /// A global.
    Global(GlobalType),
    /// An exception tag of the given canonical function type.
    Tag(DefType),
}

/// One canonicalized member of an interned recursion group.
#[derive(Debug)]
pub(crate) struct CanonType {
    pub(crate) is_final: bool,
    /// Supertypes as `Rec` (intra-group) or `Def` (external) heap types.
    pub(crate) supers: Vec<HeapType>,
    /// Shape with `Rec`/`Def` heap references only.
    pub(crate) comp: CompositeType,
}

/// An interned recursion group; identity is allocation identity.
#[derive(Debug)]
pub struct CanonGroup {
    pub(crate) types: Vec<CanonType>,
}

/// A canonicalized concrete type: a position inside an interned group.
///
/// Equality is group-pointer plus index equality, which realizes
/// equirecursive type identity across modules.
#[derive(Clone)]
pub struct DefType {
    pub(crate) group: Arc<CanonGroup>,
    pub(crate) index: u32,
}

impl DefType {
    /// The canonical composite shape.
    ///
    /// Heap references inside the shape may be intra-group back references;
    /// resolve them with [`DefType::resolve_heap`].
    pub fn comp(&self) -> &CompositeType {
        &self.group.types[self.index as usize].comp
    }

    /// Resolves an intra-group back reference relative to this type's group.
    pub fn resolve_heap(&self, heap: &HeapType) -> HeapType {
        match heap {
            HeapType::Rec(idx) => HeapType::Def(DefType {
                group: Arc::clone(&self.group),
                index: *idx,
            }),
            other => other.clone(),
        }
    }

    /// Resolves a value type relative to this type's group.
    pub fn resolve_val(&self, val_type: &ValType) -> ValType {
        match val_type {
            ValType::Ref(ref_type) => ValType::Ref(RefType {
                nullable: ref_type.nullable,
                heap: self.resolve_heap(&ref_type.heap),
            }),
            other => other.clone(),
        }
    }

    /// Resolves a storage type relative to this type's group.
    pub fn resolve_storage(&self, storage: &StorageType) -> StorageType {
        match storage {
            StorageType::Val(val_type) => StorageType::Val(self.resolve_val(val_type)),
            other => other.clone(),
        }
    }

    /// The function signature, if this is a function type.
    pub fn func_type(&self) -> Option<&FuncType> {
        self.comp().func_type()
    }

    /// Declared direct supertypes.
    pub fn supers(&self) -> impl Iterator<Item = DefType> + '_ {
        self.group.types[self.index as usize]
            .supers
            .iter()
            .filter_map(move |heap| match self.resolve_heap(heap) {
                HeapType::Def(def) => Some(def),
                _ => None,
            })
    }

    /// Whether `self` is `sup` or a declared (transitive) subtype of it.
    pub fn matches(&self, sup: &DefType) -> bool {
        if self == sup {
            return true;
        }
        self.supers().any(|parent| parent.matches(sup))
    }
}

impl PartialEq for DefType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.group, &other.group) && self.index == other.index
    }
}

impl Eq for DefType {}

impl Hash for DefType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.group) as usize).hash(state);
        self.index.hash(state);
    }
}

impl fmt::Debug for DefType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DefType({:?})", self.comp())
    }
}

/// Whether heap type `sub` matches (is a subtype of) `sup`.
///
/// Both sides must be canonical; `Index` and `Rec` references are resolved
/// before matching.
pub fn heap_matches(sub: &HeapType, sup: &HeapType) -> bool {
    use HeapType::*;
    if sub == sup {
        return true;
    }
    match (sub, sup) {
        (Def(a), Def(b)) => a.matches(b),
        (Def(a), Func) => a.comp().is_func(),
        (Def(a), Struct) => a.comp().is_struct(),
        (Def(a), Array) => a.comp().is_array(),
        (Def(a), Eq) | (Def(a), Any) => !a.comp().is_func(),
        (I31 | Struct | Array, Eq | Any) => true,
        (Eq, Any) => true,
        (None, Any | Eq | I31 | Struct | Array) => true,
        (None, Def(b)) => !b.comp().is_func(),
        (NoFunc, Func) => true,
        (NoFunc, Def(b)) => b.comp().is_func(),
        (NoExtern, Extern) => true,
        _ => false,
    }
}

/// Whether reference type `sub` matches `sup`.
pub fn ref_matches(sub: &RefType, sup: &RefType) -> bool {
    (sup.nullable || !sub.nullable) && heap_matches(&sub.heap, &sup.heap)
}

/// Whether value type `sub` matches `sup`.
///
/// Numeric and vector types match by identity; references by the subtype
/// relation over canonical heap types.
pub fn val_matches(sub: &ValType, sup: &ValType) -> bool {
    match (sub, sup) {
        (ValType::Ref(sub), ValType::Ref(sup)) => ref_matches(sub, sup),
        (a, b) => a == b,
    }
}

/// The engine-wide pool of interned recursion groups.
///
/// Owned by the executor; module instances keep a handle so that runtime
/// casts can canonicalize module-local type indices.
#[derive(Default)]
pub struct TypeRegistry {
    groups: Mutex<HashMap<Vec<u8>, Arc<CanonGroup>>>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TypeRegistry({} groups)", self.groups.lock().len())
    }
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalizes one recursion group of a module's type section.
    ///
    /// `resolved` holds the canonical types of all earlier entries of the
    /// module's type space, so `Index` references below the group resolve to
    /// `Def` and references into the group itself become `Rec` back
    /// references.
    pub fn canonicalize(
        &self,
        group: &RecGroup,
        resolved: &[DefType],
    ) -> Result<Vec<DefType>, Error> {
        let base = resolved.len() as u32;
        let len = group.types.len() as u32;
        let map_heap = |heap: &HeapType| -> Result<HeapType, Error> {
            match heap {
                HeapType::Index(idx) => {
                    if *idx < base {
                        Ok(HeapType::Def(resolved[*idx as usize].clone()))
                    } else if *idx < base + len {
                        Ok(HeapType::Rec(*idx - base))
                    } else {
                        Err(Error::MalformedValType)
                    }
                }
                HeapType::Rec(_) => Err(Error::MalformedValType),
                other => Ok(other.clone()),
            }
        };
        let map_val = |val: &ValType| -> Result<ValType, Error> {
            match val {
                ValType::Ref(ref_type) => Ok(ValType::Ref(RefType {
                    nullable: ref_type.nullable,
                    heap: map_heap(&ref_type.heap)?,
                })),
                other => Ok(other.clone()),
            }
        };
        let map_storage = |storage: &StorageType| -> Result<StorageType, Error> {
            match storage {
                StorageType::Val(val) => Ok(StorageType::Val(map_val(val)?)),
                packed => Ok(packed.clone()),
            }
        };
        let map_field = |field: &FieldType| -> Result<FieldType, Error> {
            Ok(FieldType {
                storage: map_storage(&field.storage)?,
                mutability: field.mutability,
            })
        };

        let mut canon_types = Vec::with_capacity(group.types.len());
        for sub in &group.types {
            let supers = sub
                .supers
                .iter()
                .map(|idx| map_heap(&HeapType::Index(*idx)))
                .collect::<Result<Vec<_>, _>>()?;
            let comp = match &sub.comp {
                CompositeType::Func(func_type) => CompositeType::Func(FuncType::new(
                    func_type
                        .params()
                        .iter()
                        .map(map_val)
                        .collect::<Result<Vec<_>, _>>()?,
                    func_type
                        .results()
                        .iter()
                        .map(map_val)
                        .collect::<Result<Vec<_>, _>>()?,
                )),
                CompositeType::Struct(struct_type) => CompositeType::Struct(StructType {
                    fields: struct_type
                        .fields
                        .iter()
                        .map(map_field)
                        .collect::<Result<Vec<_>, _>>()?
                        .into(),
                }),
                CompositeType::Array(array_type) => CompositeType::Array(ArrayType {
                    field: map_field(&array_type.field)?,
                }),
            };
            canon_types.push(CanonType {
                is_final: sub.is_final,
                supers,
                comp,
            });
        }

        let key = encode_group(&canon_types);
        let group = {
            let mut groups = self.groups.lock();
            match groups.get(&key) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let interned = Arc::new(CanonGroup { types: canon_types });
                    groups.insert(key, Arc::clone(&interned));
                    interned
                }
            }
        };
        Ok((0..len)
            .map(|index| DefType {
                group: Arc::clone(&group),
                index,
            })
            .collect())
    }

    /// Interns a bare function type as its own final recursion group.
    ///
    /// Used for host functions and tags created outside any module. The
    /// value types must already be canonical or abstract.
    pub fn func_type(&self, func_type: FuncType) -> DefType {
        let group = RecGroup::single(SubType::final_func(func_type));
        self.canonicalize(&group, &[])
            .expect("bare function types contain no module-local indices")
            .remove(0)
    }
}

/// Serializes the canonical structure of a group into its interning key.
fn encode_group(types: &[CanonType]) -> Vec<u8> {
    fn put_u32(out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(&value.to_le_bytes());
    }
    fn put_usize(out: &mut Vec<u8>, value: usize) {
        out.extend_from_slice(&value.to_le_bytes());
    }
    fn encode_heap(out: &mut Vec<u8>, heap: &HeapType) {
        match heap {
            HeapType::Func => out.push(0),
            HeapType::Extern => out.push(1),
            HeapType::Any => out.push(2),
            HeapType::Eq => out.push(3),
            HeapType::I31 => out.push(4),
            HeapType::Struct => out.push(5),
            HeapType::Array => out.push(6),
            HeapType::None => out.push(7),
            HeapType::NoExtern => out.push(8),
            HeapType::NoFunc => out.push(9),
            HeapType::NoExn => out.push(10),
            HeapType::Rec(idx) => {
                out.push(11);
                put_u32(out, *idx);
            }
            HeapType::Def(def) => {
                out.push(12);
                put_usize(out, Arc::as_ptr(&def.group) as usize);
                put_u32(out, def.index);
            }
            HeapType::Index(_) => unreachable!("module-local index in canonical structure"),
        }
    }
    fn encode_val(out: &mut Vec<u8>, val: &ValType) {
        match val {
            ValType::I32 => out.push(0x20),
            ValType::I64 => out.push(0x21),
            ValType::F32 => out.push(0x22),
            ValType::F64 => out.push(0x23),
            ValType::V128 => out.push(0x24),
            ValType::Ref(ref_type) => {
                out.push(if ref_type.nullable { 0x25 } else { 0x26 });
                encode_heap(out, &ref_type.heap);
            }
        }
    }
    fn encode_field(out: &mut Vec<u8>, field: &FieldType) {
        out.push(match field.mutability {
            Mutability::Const => 0,
            Mutability::Var => 1,
        });
        match &field.storage {
            StorageType::I8 => out.push(0x30),
            StorageType::I16 => out.push(0x31),
            StorageType::Val(val) => {
                out.push(0x32);
                encode_val(out, val);
            }
        }
    }

    let mut out = Vec::new();
    put_u32(&mut out, types.len() as u32);
    for ty in types {
        out.push(ty.is_final as u8);
        put_u32(&mut out, ty.supers.len() as u32);
        for sup in &ty.supers {
            encode_heap(&mut out, sup);
        }
        match &ty.comp {
            CompositeType::Func(func_type) => {
                out.push(0x60);
                put_u32(&mut out, func_type.params().len() as u32);
                for param in func_type.params() {
                    encode_val(&mut out, param);
                }
                put_u32(&mut out, func_type.results().len() as u32);
                for result in func_type.results() {
                    encode_val(&mut out, result);
                }
            }
            CompositeType::Struct(struct_type) => {
                out.push(0x5f);
                put_u32(&mut out, struct_type.fields.len() as u32);
                for field in struct_type.fields.iter() {
                    encode_field(&mut out, field);
                }
            }
            CompositeType::Array(array_type) => {
                out.push(0x5e);
                encode_field(&mut out, &array_type.field);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32i32_to_i32() -> FuncType {
        FuncType::new([ValType::I32, ValType::I32], [ValType::I32])
    }

    #[test]
    fn identical_groups_intern_to_the_same_def() {
        let registry = TypeRegistry::new();
        let a = registry.func_type(i32i32_to_i32());
        let b = registry.func_type(i32i32_to_i32());
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.group, &b.group));
    }

    #[test]
    fn different_signatures_do_not_alias() {
        let registry = TypeRegistry::new();
        let a = registry.func_type(i32i32_to_i32());
        let b = registry.func_type(FuncType::new([ValType::F32], [ValType::F32]));
        assert_ne!(a, b);
    }

    #[test]
    fn recursive_group_is_self_consistent() {
        // (rec (type $t (struct (field (ref null $t)))))
        let registry = TypeRegistry::new();
        let group = RecGroup::single(SubType {
            is_final: true,
            supers: Vec::new(),
            comp: CompositeType::Struct(StructType {
                fields: Box::new([FieldType {
                    storage: StorageType::Val(ValType::Ref(RefType::nullable(HeapType::Index(0)))),
                    mutability: Mutability::Var,
                }]),
            }),
        });
        let defs = registry.canonicalize(&group, &[]).unwrap();
        let defs_again = registry.canonicalize(&group, &[]).unwrap();
        assert_eq!(defs[0], defs_again[0]);

        // The field resolves back to the type itself.
        let CompositeType::Struct(struct_type) = defs[0].comp() else {
            panic!("expected struct");
        };
        let StorageType::Val(ValType::Ref(field_ref)) =
            defs[0].resolve_storage(&struct_type.fields[0].storage)
        else {
            panic!("expected reference field");
        };
        assert_eq!(field_ref.heap, HeapType::Def(defs[0].clone()));
    }

    #[test]
    fn matches_is_reflexive_and_transitive_over_supers() {
        let registry = TypeRegistry::new();
        let empty_struct = |supers: Vec<u32>| SubType {
            is_final: false,
            supers,
            comp: CompositeType::Struct(StructType {
                fields: Box::new([]),
            }),
        };
        // One group: base <- mid <- leaf.
        let group = RecGroup {
            types: vec![empty_struct(vec![]), empty_struct(vec![0]), empty_struct(vec![1])],
        };
        let defs = registry.canonicalize(&group, &[]).unwrap();
        let (base, mid, leaf) = (&defs[0], &defs[1], &defs[2]);
        assert!(leaf.matches(leaf));
        assert!(leaf.matches(mid));
        assert!(leaf.matches(base));
        assert!(!base.matches(leaf));
    }

    #[test]
    fn abstract_hierarchy() {
        use HeapType::*;
        assert!(heap_matches(&I31, &Eq));
        assert!(heap_matches(&Eq, &Any));
        assert!(heap_matches(&I31, &Any));
        assert!(heap_matches(&None, &Struct));
        assert!(heap_matches(&NoExtern, &Extern));
        assert!(!heap_matches(&Extern, &Any));
        assert!(!heap_matches(&Func, &Any));
    }

    #[test]
    fn non_null_matches_nullable_but_not_vice_versa() {
        let sub = RefType::non_null(HeapType::Func);
        let sup = RefType::nullable(HeapType::Func);
        assert!(ref_matches(&sub, &sup));
        assert!(!ref_matches(&sup, &sub));
    }

    #[test]
    fn ref_type_requires_proposal() {
        let mut proposals = ProposalSet::new();
        let concrete = ValType::Ref(RefType::nullable(HeapType::Index(0)));
        assert!(matches!(
            concrete.validate(proposals),
            Err(Error::MalformedRefType)
        ));
        proposals.insert(Proposal::FunctionReferences);
        assert!(concrete.validate(proposals).is_ok());

        let anyref = ValType::Ref(RefType::nullable(HeapType::Any));
        assert!(matches!(
            anyref.validate(proposals),
            Err(Error::MalformedValType)
        ));
    }
}
