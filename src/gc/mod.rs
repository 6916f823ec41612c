//! The garbage-collected heap for struct and array objects.
//!
//! The heap is an arena of header-tagged objects addressed by
//! [`ObjectId`]s that carry a generation counter for use-after-free
//! detection. External references ([`GcRef`]) are rooted handles: cloning
//! bumps the object's atomic refcount, dropping releases it, and the
//! `1 <-> 0` transitions maintain the root set. References *inside* object
//! payloads are raw ids traced by the collector, so reference cycles
//! collect once their external handles disappear.
//!
//! Collection is a tri-color concurrent mark-sweep run by a pool of worker
//! threads sharing the gray queue (see [`collector`]); field setters form
//! the write barrier by graying the stored child while a mark is active.

mod collector;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::TrapCode;
use crate::func::FuncRef;
use crate::types::{
    ArrayType, CompositeType, DefType, FieldType, HeapType, StorageType, StructType, ValType,
};
use crate::value::{ExternRef, RefValue, Value};
use crate::nan_preserving_float::{F32, F64};

/// Arena address of a heap object: slot index plus generation.
///
/// The generation disambiguates reuses of the same slot; a stale id never
/// aliases a newer object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

/// The interned structural descriptor of a GC object's type:
/// `content_code | storage_code*`.
///
/// Two heap objects have the same Wasm type iff their pack pointers are
/// equal.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TypePack {
    bytes: Box<[u8]>,
}

impl TypePack {
    fn build(comp: &CompositeType, def: &DefType) -> TypePack {
        fn storage_code(out: &mut Vec<u8>, def: &DefType, storage: &StorageType) {
            match storage {
                StorageType::I8 => out.push(0x01),
                StorageType::I16 => out.push(0x02),
                StorageType::Val(ValType::I32) => out.push(0x10),
                StorageType::Val(ValType::I64) => out.push(0x11),
                StorageType::Val(ValType::F32) => out.push(0x12),
                StorageType::Val(ValType::F64) => out.push(0x13),
                StorageType::Val(ValType::V128) => out.push(0x14),
                StorageType::Val(ValType::Ref(ref_type)) => {
                    match def.resolve_heap(&ref_type.heap) {
                        HeapType::Def(target) => {
                            out.push(0x7f);
                            out.extend_from_slice(
                                &(Arc::as_ptr(&target.group) as usize).to_le_bytes(),
                            );
                            out.extend_from_slice(&target.index.to_le_bytes());
                        }
                        abstract_heap => {
                            out.push(0x40);
                            out.push(heap_code(&abstract_heap));
                        }
                    }
                }
            }
        }
        fn heap_code(heap: &HeapType) -> u8 {
            match heap {
                HeapType::Func => 0,
                HeapType::Extern => 1,
                HeapType::Any => 2,
                HeapType::Eq => 3,
                HeapType::I31 => 4,
                HeapType::Struct => 5,
                HeapType::Array => 6,
                HeapType::None => 7,
                HeapType::NoExtern => 8,
                HeapType::NoFunc => 9,
                HeapType::NoExn => 10,
                _ => 0xff,
            }
        }

        let mut bytes = Vec::new();
        match comp {
            CompositeType::Struct(struct_type) => {
                bytes.push(0x5f);
                for field in struct_type.fields.iter() {
                    storage_code(&mut bytes, def, &field.storage);
                }
            }
            CompositeType::Array(array_type) => {
                bytes.push(0x5e);
                storage_code(&mut bytes, def, &array_type.field.storage);
            }
            CompositeType::Func(_) => bytes.push(0x60),
        }
        TypePack {
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// The raw canonical byte sequence.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// An unrooted reference stored inside a heap payload.
#[derive(Clone, Debug)]
pub(crate) enum HeapRefSlot {
    Null(HeapType),
    Func(FuncRef),
    Extern(ExternRef),
    I31(u32),
    Object(ObjectId),
}

/// One stored field or element.
#[derive(Clone, Debug)]
pub(crate) enum Slot {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(F32),
    F64(F64),
    V128(u128),
    Ref(HeapRefSlot),
}

pub(crate) enum ObjectData {
    Struct(Vec<Slot>),
    Array(Vec<Slot>),
}

/// Header plus payload of one live heap object.
pub(crate) struct HeapObject {
    /// Payload size in bytes.
    size: u32,
    /// External (handle) reference count.
    refcount: AtomicU32,
    /// The interned type pack.
    pack: Arc<TypePack>,
    /// The canonical defined type, used for casts.
    ty: DefType,
    data: Mutex<ObjectData>,
}

struct SlotEntry {
    generation: u32,
    object: Option<HeapObject>,
}

pub(crate) struct MarkState {
    /// Objects queued for scanning.
    pub(crate) gray: Mutex<VecDeque<ObjectId>>,
    pub(crate) gray_ready: Condvar,
    /// Objects proven reachable in the current cycle.
    pub(crate) black: Mutex<HashSet<ObjectId>>,
    /// Whether a mark phase is active; gates the write barrier.
    pub(crate) marking: AtomicBool,
    /// Popped-but-unscanned entries; sweeping must wait for zero.
    pub(crate) in_flight: AtomicU32,
    /// Serializes collection cycles.
    pub(crate) cycle: Mutex<()>,
    pub(crate) stop: AtomicBool,
}

/// The GC heap.
pub struct Heap {
    slots: RwLock<Vec<SlotEntry>>,
    free: Mutex<Vec<u32>>,
    roots: Mutex<HashSet<ObjectId>>,
    packs: Mutex<HashMap<Box<[u8]>, Arc<TypePack>>>,
    used: AtomicU64,
    capacity: AtomicU64,
    threshold: AtomicU64,
    interval_ms: u64,
    pub(crate) mark: MarkState,
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Heap")
            .field("used", &self.used.load(Ordering::Relaxed))
            .field("threshold", &self.threshold.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.mark.stop.store(true, Ordering::Relaxed);
    }
}

/// A rooted handle to a heap object.
///
/// Cloning and dropping drive the object's external refcount; an object
/// with at least one live handle is never swept.
pub struct GcRef {
    id: ObjectId,
    heap: Arc<Heap>,
}

impl GcRef {
    /// The arena address of the referenced object.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The canonical defined type of the referenced object.
    pub fn def_type(&self) -> DefType {
        self.heap.with_object(self.id, |object| object.ty.clone())
    }

    /// The interned type pack of the referenced object.
    pub fn type_pack(&self) -> Arc<TypePack> {
        self.heap
            .with_object(self.id, |object| Arc::clone(&object.pack))
    }

    pub(crate) fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }
}

impl Clone for GcRef {
    fn clone(&self) -> Self {
        self.heap.ref_inc(self.id);
        GcRef {
            id: self.id,
            heap: Arc::clone(&self.heap),
        }
    }
}

impl Drop for GcRef {
    fn drop(&mut self) {
        self.heap.ref_dec(self.id);
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GcRef({:?})", self.id)
    }
}

impl PartialEq for GcRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Heap {
    /// Creates a heap and spawns its collector pool.
    ///
    /// `threshold` is the occupancy that wakes the collectors, `interval_ms`
    /// the timer fallback, `workers` the pool size.
    pub fn new(threshold: u64, interval_ms: u64, workers: usize) -> Arc<Heap> {
        let heap = Arc::new(Heap {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            roots: Mutex::new(HashSet::new()),
            packs: Mutex::new(HashMap::new()),
            used: AtomicU64::new(0),
            capacity: AtomicU64::new(u64::MAX),
            threshold: AtomicU64::new(threshold),
            interval_ms,
            mark: MarkState {
                gray: Mutex::new(VecDeque::new()),
                gray_ready: Condvar::new(),
                black: Mutex::new(HashSet::new()),
                marking: AtomicBool::new(false),
                in_flight: AtomicU32::new(0),
                cycle: Mutex::new(()),
                stop: AtomicBool::new(false),
            },
        });
        collector::spawn_collectors(&heap, workers);
        heap
    }

    /// Caps the total payload bytes; allocations beyond it trap
    /// [`TrapCode::OutOfMemory`].
    pub fn set_capacity(&self, bytes: u64) {
        self.capacity.store(bytes, Ordering::Relaxed);
    }

    /// Currently allocated payload bytes.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn intern_pack(&self, comp: &CompositeType, def: &DefType) -> Arc<TypePack> {
        let pack = TypePack::build(comp, def);
        let mut packs = self.packs.lock();
        match packs.get(pack.bytes()) {
            Some(existing) => Arc::clone(existing),
            None => {
                let interned = Arc::new(pack);
                packs.insert(interned.bytes.clone(), Arc::clone(&interned));
                interned
            }
        }
    }

    fn insert(self: &Arc<Self>, ty: DefType, data: ObjectData, size: u32) -> Result<GcRef, TrapCode> {
        let used = self.used.fetch_add(size as u64, Ordering::Relaxed) + size as u64;
        if used > self.capacity.load(Ordering::Relaxed) {
            self.used.fetch_sub(size as u64, Ordering::Relaxed);
            return Err(TrapCode::OutOfMemory);
        }
        let pack = self.intern_pack(ty.comp(), &ty);
        let object = HeapObject {
            size,
            refcount: AtomicU32::new(1),
            pack,
            ty,
            data: Mutex::new(data),
        };
        let id = {
            let mut slots = self.slots.write();
            match self.free.lock().pop() {
                Some(index) => {
                    let entry = &mut slots[index as usize];
                    entry.object = Some(object);
                    ObjectId {
                        index,
                        generation: entry.generation,
                    }
                }
                None => {
                    slots.push(SlotEntry {
                        generation: 0,
                        object: Some(object),
                    });
                    ObjectId {
                        index: (slots.len() - 1) as u32,
                        generation: 0,
                    }
                }
            }
        };
        self.roots.lock().insert(id);
        if self.mark.marking.load(Ordering::Acquire) {
            // Objects born during a mark phase are gray by definition.
            self.mark.gray.lock().push_back(id);
            self.mark.gray_ready.notify_all();
        }
        log::trace!("gc: allocated {id:?} ({size} bytes, {used} used)");
        Ok(GcRef {
            id,
            heap: Arc::clone(self),
        })
    }

    pub(crate) fn with_object<R>(&self, id: ObjectId, f: impl FnOnce(&HeapObject) -> R) -> R {
        let slots = self.slots.read();
        let entry = &slots[id.index as usize];
        assert!(
            entry.generation == id.generation,
            "stale object id: use after free"
        );
        f(entry
            .object
            .as_ref()
            .expect("live object id points at an occupied slot"))
    }

    pub(crate) fn ref_inc(&self, id: ObjectId) {
        let previous = self.with_object(id, |object| {
            object.refcount.fetch_add(1, Ordering::AcqRel)
        });
        if previous == 0 {
            self.roots.lock().insert(id);
        }
    }

    pub(crate) fn ref_dec(&self, id: ObjectId) {
        let previous = self.with_object(id, |object| {
            object.refcount.fetch_sub(1, Ordering::AcqRel)
        });
        if previous == 1 {
            self.roots.lock().remove(&id);
        }
    }

    fn rooted(self: &Arc<Self>, id: ObjectId) -> GcRef {
        self.ref_inc(id);
        GcRef {
            id,
            heap: Arc::clone(self),
        }
    }

    /// The write barrier: converts a rooted value into a payload slot and
    /// grays stored children while a mark phase is active, so no black
    /// object ever points at an unscanned white one.
    fn value_to_slot(&self, storage: &StorageType, value: Value) -> Result<Slot, TrapCode> {
        match (storage, value) {
            (StorageType::I8, Value::I32(v)) => Ok(Slot::I8(v as i8)),
            (StorageType::I16, Value::I32(v)) => Ok(Slot::I16(v as i16)),
            (StorageType::Val(ValType::I32), Value::I32(v)) => Ok(Slot::I32(v)),
            (StorageType::Val(ValType::I64), Value::I64(v)) => Ok(Slot::I64(v)),
            (StorageType::Val(ValType::F32), Value::F32(v)) => Ok(Slot::F32(v)),
            (StorageType::Val(ValType::F64), Value::F64(v)) => Ok(Slot::F64(v)),
            (StorageType::Val(ValType::V128), Value::V128(v)) => Ok(Slot::V128(v)),
            (StorageType::Val(ValType::Ref(_)), Value::Ref(ref_value)) => {
                let slot = match ref_value {
                    RefValue::Null(heap) => HeapRefSlot::Null(heap),
                    RefValue::Func(func) => HeapRefSlot::Func(func),
                    RefValue::Extern(ext) => HeapRefSlot::Extern(ext),
                    RefValue::I31(v) => HeapRefSlot::I31(v),
                    RefValue::Struct(gc_ref) | RefValue::Array(gc_ref) => {
                        let child = gc_ref.id();
                        if self.mark.marking.load(Ordering::Acquire) {
                            self.mark.gray.lock().push_back(child);
                            self.mark.gray_ready.notify_all();
                        }
                        HeapRefSlot::Object(child)
                    }
                };
                Ok(Slot::Ref(slot))
            }
            _ => Err(TrapCode::RefTypeMismatch),
        }
    }

    /// Unpacks a slot; packed fields extend with or without sign as
    /// requested.
    fn slot_to_value(self: &Arc<Self>, slot: &Slot, signed: bool) -> Value {
        match slot {
            Slot::I8(v) => Value::I32(if signed { *v as i32 } else { (*v as u8) as i32 }),
            Slot::I16(v) => Value::I32(if signed { *v as i32 } else { (*v as u16) as i32 }),
            Slot::I32(v) => Value::I32(*v),
            Slot::I64(v) => Value::I64(*v),
            Slot::F32(v) => Value::F32(*v),
            Slot::F64(v) => Value::F64(*v),
            Slot::V128(v) => Value::V128(*v),
            Slot::Ref(ref_slot) => Value::Ref(match ref_slot {
                HeapRefSlot::Null(heap) => RefValue::Null(heap.clone()),
                HeapRefSlot::Func(func) => RefValue::Func(func.clone()),
                HeapRefSlot::Extern(ext) => RefValue::Extern(ext.clone()),
                HeapRefSlot::I31(v) => RefValue::I31(*v),
                HeapRefSlot::Object(id) => {
                    let rooted = self.rooted(*id);
                    if rooted.heap.with_object(*id, |o| o.ty.comp().is_array()) {
                        RefValue::Array(rooted)
                    } else {
                        RefValue::Struct(rooted)
                    }
                }
            }),
        }
    }

    fn struct_fields(ty: &DefType) -> Result<&StructType, TrapCode> {
        match ty.comp() {
            CompositeType::Struct(struct_type) => Ok(struct_type),
            _ => Err(TrapCode::CastFailed),
        }
    }

    fn array_field(ty: &DefType) -> Result<&ArrayType, TrapCode> {
        match ty.comp() {
            CompositeType::Array(array_type) => Ok(array_type),
            _ => Err(TrapCode::CastFailed),
        }
    }

    /// Allocates a struct from field values in declaration order.
    pub fn alloc_struct(self: &Arc<Self>, ty: DefType, values: Vec<Value>) -> Result<GcRef, TrapCode> {
        let struct_type = Self::struct_fields(&ty)?.clone();
        if values.len() != struct_type.fields.len() {
            return Err(TrapCode::ArrayOutOfBounds);
        }
        let mut size = 0u32;
        let mut slots = Vec::with_capacity(values.len());
        for (field, value) in struct_type.fields.iter().zip(values) {
            size += field.storage.size();
            slots.push(self.value_to_slot(&field.storage, value)?);
        }
        self.insert(ty, ObjectData::Struct(slots), size)
    }

    /// Allocates a struct with every field set to its default value.
    pub fn alloc_struct_default(self: &Arc<Self>, ty: DefType) -> Result<GcRef, TrapCode> {
        let struct_type = Self::struct_fields(&ty)?;
        let values = struct_type
            .fields
            .iter()
            .map(|field| {
                Value::default(&ty.resolve_storage(&field.storage).unpacked())
                    .ok_or(TrapCode::NonNullRequired)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.alloc_struct(ty.clone(), values)
    }

    /// Allocates an array of `len` copies of `init`.
    pub fn alloc_array(
        self: &Arc<Self>,
        ty: DefType,
        len: u32,
        init: Value,
    ) -> Result<GcRef, TrapCode> {
        let field = Self::array_field(&ty)?.field.clone();
        let slot = self.value_to_slot(&field.storage, init)?;
        let size = field
            .storage
            .size()
            .checked_mul(len)
            .ok_or(TrapCode::OutOfMemory)?;
        self.insert(ty, ObjectData::Array(vec![slot; len as usize]), size)
    }

    /// Allocates an array from explicit element values.
    pub fn alloc_array_fixed(
        self: &Arc<Self>,
        ty: DefType,
        values: Vec<Value>,
    ) -> Result<GcRef, TrapCode> {
        let field = Self::array_field(&ty)?.field.clone();
        let size = field.storage.size() * values.len() as u32;
        let elems = values
            .into_iter()
            .map(|value| self.value_to_slot(&field.storage, value))
            .collect::<Result<Vec<_>, _>>()?;
        self.insert(ty, ObjectData::Array(elems), size)
    }

    /// `struct.get` with optional sign extension for packed fields.
    pub fn struct_get(
        self: &Arc<Self>,
        gc_ref: &GcRef,
        field_idx: u32,
        signed: bool,
    ) -> Result<Value, TrapCode> {
        let slot = self.with_object(gc_ref.id(), |object| {
            let data = object.data.lock();
            match &*data {
                ObjectData::Struct(slots) => slots
                    .get(field_idx as usize)
                    .cloned()
                    .ok_or(TrapCode::ArrayOutOfBounds),
                ObjectData::Array(_) => Err(TrapCode::CastFailed),
            }
        })?;
        Ok(self.slot_to_value(&slot, signed))
    }

    /// `struct.set`.
    pub fn struct_set(
        self: &Arc<Self>,
        gc_ref: &GcRef,
        field_idx: u32,
        value: Value,
    ) -> Result<(), TrapCode> {
        let ty = gc_ref.def_type();
        let struct_type = Self::struct_fields(&ty)?;
        let field = struct_type
            .fields
            .get(field_idx as usize)
            .ok_or(TrapCode::ArrayOutOfBounds)?;
        let slot = self.value_to_slot(&field.storage, value)?;
        self.with_object(gc_ref.id(), |object| {
            let mut data = object.data.lock();
            match &mut *data {
                ObjectData::Struct(slots) => {
                    slots[field_idx as usize] = slot;
                    Ok(())
                }
                ObjectData::Array(_) => Err(TrapCode::CastFailed),
            }
        })
    }

    /// `array.len`.
    pub fn array_len(&self, gc_ref: &GcRef) -> Result<u32, TrapCode> {
        self.with_object(gc_ref.id(), |object| {
            let data = object.data.lock();
            match &*data {
                ObjectData::Array(elems) => Ok(elems.len() as u32),
                ObjectData::Struct(_) => Err(TrapCode::CastFailed),
            }
        })
    }

    /// `array.get` with optional sign extension.
    pub fn array_get(
        self: &Arc<Self>,
        gc_ref: &GcRef,
        index: u32,
        signed: bool,
    ) -> Result<Value, TrapCode> {
        let slot = self.with_object(gc_ref.id(), |object| {
            let data = object.data.lock();
            match &*data {
                ObjectData::Array(elems) => elems
                    .get(index as usize)
                    .cloned()
                    .ok_or(TrapCode::ArrayOutOfBounds),
                ObjectData::Struct(_) => Err(TrapCode::CastFailed),
            }
        })?;
        Ok(self.slot_to_value(&slot, signed))
    }

    /// `array.set`.
    pub fn array_set(
        self: &Arc<Self>,
        gc_ref: &GcRef,
        index: u32,
        value: Value,
    ) -> Result<(), TrapCode> {
        let ty = gc_ref.def_type();
        let field = Self::array_field(&ty)?.field.clone();
        let slot = self.value_to_slot(&field.storage, value)?;
        self.with_object(gc_ref.id(), |object| {
            let mut data = object.data.lock();
            match &mut *data {
                ObjectData::Array(elems) => {
                    let target = elems
                        .get_mut(index as usize)
                        .ok_or(TrapCode::ArrayOutOfBounds)?;
                    *target = slot;
                    Ok(())
                }
                ObjectData::Struct(_) => Err(TrapCode::CastFailed),
            }
        })
    }

    /// `array.fill`.
    pub fn array_fill(
        self: &Arc<Self>,
        gc_ref: &GcRef,
        offset: u32,
        value: Value,
        len: u32,
    ) -> Result<(), TrapCode> {
        let ty = gc_ref.def_type();
        let field = Self::array_field(&ty)?.field.clone();
        let slot = self.value_to_slot(&field.storage, value)?;
        self.with_object(gc_ref.id(), |object| {
            let mut data = object.data.lock();
            match &mut *data {
                ObjectData::Array(elems) => {
                    let end = offset as u64 + len as u64;
                    if end > elems.len() as u64 {
                        return Err(TrapCode::ArrayOutOfBounds);
                    }
                    elems[offset as usize..end as usize].fill(slot);
                    Ok(())
                }
                ObjectData::Struct(_) => Err(TrapCode::CastFailed),
            }
        })
    }

    /// `array.copy` between two arrays (or within one).
    pub fn array_copy(
        self: &Arc<Self>,
        dst: &GcRef,
        dst_offset: u32,
        src: &GcRef,
        src_offset: u32,
        len: u32,
    ) -> Result<(), TrapCode> {
        let copied: Vec<Slot> = self.with_object(src.id(), |object| {
            let data = object.data.lock();
            match &*data {
                ObjectData::Array(elems) => {
                    let end = src_offset as u64 + len as u64;
                    if end > elems.len() as u64 {
                        return Err(TrapCode::ArrayOutOfBounds);
                    }
                    Ok(elems[src_offset as usize..end as usize].to_vec())
                }
                ObjectData::Struct(_) => Err(TrapCode::CastFailed),
            }
        })?;
        // Re-gray copied children under an active mark, same as a store.
        if self.mark.marking.load(Ordering::Acquire) {
            let mut gray = self.mark.gray.lock();
            for slot in &copied {
                if let Slot::Ref(HeapRefSlot::Object(child)) = slot {
                    gray.push_back(*child);
                }
            }
            self.mark.gray_ready.notify_all();
        }
        self.with_object(dst.id(), |object| {
            let mut data = object.data.lock();
            match &mut *data {
                ObjectData::Array(elems) => {
                    let end = dst_offset as u64 + len as u64;
                    if end > elems.len() as u64 {
                        return Err(TrapCode::ArrayOutOfBounds);
                    }
                    elems[dst_offset as usize..end as usize].clone_from_slice(&copied);
                    Ok(())
                }
                ObjectData::Struct(_) => Err(TrapCode::CastFailed),
            }
        })
    }

    /// Snapshot of the root set: every object with a live external handle.
    pub(crate) fn root_snapshot(&self) -> Vec<ObjectId> {
        self.roots.lock().iter().copied().collect()
    }

    /// Child object ids referenced from `id`'s payload.
    pub(crate) fn children(&self, id: ObjectId) -> Vec<ObjectId> {
        self.with_object(id, |object| {
            let data = object.data.lock();
            let slots = match &*data {
                ObjectData::Struct(slots) => slots,
                ObjectData::Array(elems) => elems,
            };
            slots
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Ref(HeapRefSlot::Object(child)) => Some(*child),
                    _ => None,
                })
                .collect()
        })
    }

    /// Frees every unmarked object with refcount zero; returns freed bytes.
    pub(crate) fn sweep(&self, black: &HashSet<ObjectId>) -> u64 {
        let mut freed = 0u64;
        let mut slots = self.slots.write();
        let mut free = self.free.lock();
        for (index, entry) in slots.iter_mut().enumerate() {
            let swept = match &entry.object {
                Some(object) => {
                    let id = ObjectId {
                        index: index as u32,
                        generation: entry.generation,
                    };
                    !black.contains(&id) && object.refcount.load(Ordering::Acquire) == 0
                }
                None => false,
            };
            if swept {
                let object = entry.object.take().expect("checked above");
                freed += object.size as u64;
                entry.generation = entry.generation.wrapping_add(1);
                free.push(index as u32);
            }
        }
        self.used.fetch_sub(freed, Ordering::Relaxed);
        freed
    }

    pub(crate) fn over_threshold(&self) -> bool {
        self.used.load(Ordering::Relaxed) > self.threshold.load(Ordering::Relaxed)
    }

    pub(crate) fn adjust_threshold(&self) {
        // Double the threshold while the surviving occupancy stays above
        // half of it, so busy heaps collect less often.
        let threshold = self.threshold.load(Ordering::Relaxed);
        if self.used.load(Ordering::Relaxed) > threshold / 2 {
            self.threshold
                .store(threshold.saturating_mul(2), Ordering::Relaxed);
        }
    }

    pub(crate) fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Runs one full synchronous collection cycle.
    pub fn collect_now(&self) {
        collector::collect(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Mutability, RecGroup, RefType, SubType, TypeRegistry};

    fn heap() -> Arc<Heap> {
        // No background workers; collections run synchronously in tests.
        Heap::new(u64::MAX, 3_600_000, 0)
    }

    fn struct_with_self_ref(registry: &TypeRegistry) -> DefType {
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
        registry.canonicalize(&group, &[]).unwrap().remove(0)
    }

    fn i8_array(registry: &TypeRegistry) -> DefType {
        let group = RecGroup::single(SubType {
            is_final: true,
            supers: Vec::new(),
            comp: CompositeType::Array(ArrayType {
                field: FieldType {
                    storage: StorageType::I8,
                    mutability: Mutability::Var,
                },
            }),
        });
        registry.canonicalize(&group, &[]).unwrap().remove(0)
    }

    #[test]
    fn packed_array_truncates_and_extends() {
        let registry = TypeRegistry::new();
        let heap = heap();
        let array = heap
            .alloc_array(i8_array(&registry), 2, Value::I32(0))
            .unwrap();
        heap.array_set(&array, 0, Value::I32(0x1ff)).unwrap();
        // Truncated to 8 bits on store; sign- or zero-extended on load.
        assert_eq!(heap.array_get(&array, 0, false).unwrap(), Value::I32(0xff));
        assert_eq!(heap.array_get(&array, 0, true).unwrap(), Value::I32(-1));
        assert!(matches!(
            heap.array_get(&array, 2, true),
            Err(TrapCode::ArrayOutOfBounds)
        ));
    }

    #[test]
    fn rooted_objects_survive_collection() {
        let registry = TypeRegistry::new();
        let heap = heap();
        let ty = struct_with_self_ref(&registry);
        let object = heap.alloc_struct_default(ty).unwrap();
        heap.collect_now();
        heap.collect_now();
        // Still alive and readable.
        assert!(heap.struct_get(&object, 0, false).is_ok());
    }

    #[test]
    fn cycle_is_collected_once_handles_drop() {
        let registry = TypeRegistry::new();
        let heap = heap();
        let baseline = heap.used();
        let ty = struct_with_self_ref(&registry);

        let a = heap.alloc_struct_default(ty.clone()).unwrap();
        let b = heap.alloc_struct_default(ty).unwrap();
        heap.struct_set(&a, 0, Value::Ref(RefValue::Struct(b.clone())))
            .unwrap();
        heap.struct_set(&b, 0, Value::Ref(RefValue::Struct(a.clone())))
            .unwrap();
        assert!(heap.used() > baseline);

        drop(a);
        drop(b);
        heap.collect_now();
        assert_eq!(heap.used(), baseline);
    }

    #[test]
    fn reachable_through_live_parent_survives() {
        let registry = TypeRegistry::new();
        let heap = heap();
        let ty = struct_with_self_ref(&registry);

        let parent = heap.alloc_struct_default(ty.clone()).unwrap();
        let child = heap.alloc_struct_default(ty).unwrap();
        heap.struct_set(&parent, 0, Value::Ref(RefValue::Struct(child.clone())))
            .unwrap();
        drop(child);

        heap.collect_now();
        // The child is reachable through the rooted parent.
        let loaded = heap.struct_get(&parent, 0, false).unwrap();
        assert!(matches!(loaded, Value::Ref(RefValue::Struct(_))));
    }

    #[test]
    fn type_packs_are_interned() {
        let registry = TypeRegistry::new();
        let heap = heap();
        let ty = i8_array(&registry);
        let a = heap.alloc_array(ty.clone(), 1, Value::I32(0)).unwrap();
        let b = heap.alloc_array(ty, 2, Value::I32(0)).unwrap();
        assert!(Arc::ptr_eq(&a.type_pack(), &b.type_pack()));
    }

    #[test]
    fn capacity_limit_traps_out_of_memory() {
        let registry = TypeRegistry::new();
        let heap = heap();
        heap.set_capacity(8);
        let ty = i8_array(&registry);
        assert!(heap.alloc_array(ty.clone(), 8, Value::I32(0)).is_ok());
        assert!(matches!(
            heap.alloc_array(ty, 1, Value::I32(0)),
            Err(TrapCode::OutOfMemory)
        ));
    }
}
