//! Table instances.
//!
//! A table is a bounds-checked vector of reference values. Stores are
//! dynamically type-checked against the element type: the element type is
//! canonicalized at allocation, so the check needs no module context.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, TrapCode};
use crate::types::{heap_matches, Limits, TableType};
use crate::value::RefValue;

/// Reference to a [`TableInstance`] with shared ownership semantics.
#[derive(Clone)]
pub struct TableRef(Arc<TableInstance>);

impl core::ops::Deref for TableRef {
    type Target = TableInstance;
    fn deref(&self) -> &TableInstance {
        &self.0
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Runtime representation of a table.
pub struct TableInstance {
    ty: TableType,
    elements: RwLock<Vec<RefValue>>,
}

impl fmt::Debug for TableInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TableInstance")
            .field("ty", &self.ty)
            .field("len", &self.elements.read().len())
            .finish()
    }
}

impl TableInstance {
    /// Allocates a table filled with `init`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the limits are inconsistent or `init` does not
    /// inhabit the element type.
    pub fn alloc(ty: TableType, init: RefValue) -> Result<TableRef, Error> {
        ty.limits.validate()?;
        check_element(&ty, &init).map_err(|_| {
            Error::Table(format!(
                "initializer {init:?} does not match element type {:?}",
                ty.elem
            ))
        })?;
        let elements = vec![init; ty.limits.min as usize];
        Ok(TableRef(Arc::new(TableInstance {
            ty,
            elements: RwLock::new(elements),
        })))
    }

    /// The table type.
    pub fn ty(&self) -> &TableType {
        &self.ty
    }

    /// The declared limits.
    pub fn limits(&self) -> &Limits {
        &self.ty.limits
    }

    /// Current number of elements.
    pub fn size(&self) -> u32 {
        self.elements.read().len() as u32
    }

    /// Reads the element at `index`.
    pub fn get(&self, index: u32) -> Result<RefValue, TrapCode> {
        self.elements
            .read()
            .get(index as usize)
            .cloned()
            .ok_or(TrapCode::TableOutOfBounds)
    }

    /// Stores `value` at `index`, checking bounds and the element type.
    pub fn set(&self, index: u32, value: RefValue) -> Result<(), TrapCode> {
        check_element(&self.ty, &value)?;
        let mut elements = self.elements.write();
        let slot = elements
            .get_mut(index as usize)
            .ok_or(TrapCode::TableOutOfBounds)?;
        *slot = value;
        Ok(())
    }

    /// Grows the table by `delta` elements initialized to `init`.
    ///
    /// Returns the old size, or `u32::MAX` (`-1`) unchanged on failure.
    pub fn grow(&self, delta: u32, init: RefValue) -> u32 {
        if check_element(&self.ty, &init).is_err() {
            return u32::MAX;
        }
        let mut elements = self.elements.write();
        let old_size = elements.len() as u32;
        let ceiling = self.ty.limits.max.unwrap_or(u32::MAX);
        match old_size.checked_add(delta) {
            Some(new_size) if new_size <= ceiling => {
                elements.resize(new_size as usize, init);
                old_size
            }
            _ => u32::MAX,
        }
    }

    /// `table.fill`: stores `len` copies of `value` starting at `offset`.
    pub fn fill(&self, offset: u32, value: RefValue, len: u32) -> Result<(), TrapCode> {
        check_element(&self.ty, &value)?;
        let mut elements = self.elements.write();
        let range = checked_range(elements.len(), offset, len)?;
        elements[range].fill(value);
        Ok(())
    }

    /// `table.copy` within one table; overlapping ranges are safe.
    pub fn copy_within(&self, dst: u32, src: u32, len: u32) -> Result<(), TrapCode> {
        let mut elements = self.elements.write();
        let src_range = checked_range(elements.len(), src, len)?;
        checked_range(elements.len(), dst, len)?;
        let copied: Vec<RefValue> = elements[src_range].to_vec();
        elements[dst as usize..dst as usize + len as usize].clone_from_slice(&copied);
        Ok(())
    }

    /// `table.copy` between two distinct tables.
    pub fn copy_between(
        dst_table: &TableInstance,
        src_table: &TableInstance,
        dst: u32,
        src: u32,
        len: u32,
    ) -> Result<(), TrapCode> {
        let copied: Vec<RefValue> = {
            let src_elements = src_table.elements.read();
            let range = checked_range(src_elements.len(), src, len)?;
            src_elements[range].to_vec()
        };
        let mut dst_elements = dst_table.elements.write();
        let range = checked_range(dst_elements.len(), dst, len)?;
        dst_elements[range].clone_from_slice(&copied);
        Ok(())
    }

    /// `table.init`: copies a slice of segment elements into the table.
    pub fn init(&self, dst: u32, items: &[RefValue], src: u32, len: u32) -> Result<(), TrapCode> {
        let src_range = checked_range(items.len(), src, len)?;
        let mut elements = self.elements.write();
        let dst_range = checked_range(elements.len(), dst, len)?;
        elements[dst_range].clone_from_slice(&items[src_range]);
        Ok(())
    }
}

fn checked_range(
    len: usize,
    offset: u32,
    count: u32,
) -> Result<core::ops::Range<usize>, TrapCode> {
    let end = offset as u64 + count as u64;
    if end > len as u64 {
        return Err(TrapCode::TableOutOfBounds);
    }
    Ok(offset as usize..end as usize)
}

/// Checks that `value` inhabits the element type.
fn check_element(ty: &TableType, value: &RefValue) -> Result<(), TrapCode> {
    match value {
        RefValue::Null(_) => {
            if ty.elem.nullable {
                Ok(())
            } else {
                Err(TrapCode::NonNullRequired)
            }
        }
        non_null => {
            if heap_matches(&non_null.heap_type(), &ty.elem.heap) {
                Ok(())
            } else {
                Err(TrapCode::RefTypeMismatch)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HeapType, RefType};
    use crate::value::ExternRef;

    fn funcref_table(min: u32, max: Option<u32>) -> TableRef {
        TableInstance::alloc(
            TableType {
                elem: RefType::funcref(),
                limits: Limits::new(min, max),
            },
            RefValue::null_func(),
        )
        .unwrap()
    }

    #[test]
    fn get_and_set_are_bounds_checked() {
        let table = funcref_table(2, None);
        assert!(table.get(1).is_ok());
        assert!(matches!(table.get(2), Err(TrapCode::TableOutOfBounds)));
        assert!(matches!(
            table.set(2, RefValue::null_func()),
            Err(TrapCode::TableOutOfBounds)
        ));
    }

    #[test]
    fn set_rejects_wrong_reference_kind() {
        let table = funcref_table(1, None);
        let extern_value = RefValue::Extern(ExternRef::new(17u32));
        assert!(matches!(
            table.set(0, extern_value),
            Err(TrapCode::RefTypeMismatch)
        ));
    }

    #[test]
    fn non_nullable_table_rejects_null() {
        let table = TableInstance::alloc(
            TableType {
                elem: RefType::non_null(HeapType::Extern),
                limits: Limits::new(0, None),
            },
            RefValue::Extern(ExternRef::new(0u32)),
        )
        .unwrap();
        assert!(matches!(
            table.fill(0, RefValue::null_extern(), 0),
            Err(TrapCode::NonNullRequired)
        ));
    }

    #[test]
    fn grow_respects_maximum() {
        let table = funcref_table(1, Some(2));
        assert_eq!(table.grow(1, RefValue::null_func()), 1);
        assert_eq!(table.grow(1, RefValue::null_func()), u32::MAX);
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn copy_within_overlapping() {
        let table = TableInstance::alloc(
            TableType {
                elem: RefType::externref(),
                limits: Limits::new(3, None),
            },
            RefValue::null_extern(),
        )
        .unwrap();
        let marker = RefValue::Extern(ExternRef::new(1u8));
        table.set(0, marker.clone()).unwrap();
        table.copy_within(1, 0, 2).unwrap();
        assert_eq!(table.get(1).unwrap(), marker);
    }
}
