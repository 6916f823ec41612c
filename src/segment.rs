//! Passive segment instances: elements and data.
//!
//! Both keep a dropped flag realized by emptying their payload, which is
//! exactly the observable behavior of `elem.drop` and `data.drop`.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::RefType;
use crate::value::RefValue;

/// Reference to an [`ElementInstance`] with shared ownership semantics.
#[derive(Clone)]
pub struct ElementRef(Arc<ElementInstance>);

impl core::ops::Deref for ElementRef {
    type Target = ElementInstance;
    fn deref(&self) -> &ElementInstance {
        &self.0
    }
}

impl fmt::Debug for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Runtime representation of an element segment.
pub struct ElementInstance {
    ty: RefType,
    items: RwLock<Vec<RefValue>>,
}

impl fmt::Debug for ElementInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ElementInstance")
            .field("ty", &self.ty)
            .field("len", &self.items.read().len())
            .finish()
    }
}

impl ElementInstance {
    /// Allocates an element instance with evaluated items.
    pub fn alloc(ty: RefType, items: Vec<RefValue>) -> ElementRef {
        ElementRef(Arc::new(ElementInstance {
            ty,
            items: RwLock::new(items),
        }))
    }

    /// The element reference type.
    pub fn ty(&self) -> &RefType {
        &self.ty
    }

    /// Number of remaining items; zero once dropped.
    pub fn len(&self) -> u32 {
        self.items.read().len() as u32
    }

    /// Whether the segment holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// A snapshot of the items.
    pub fn items(&self) -> Vec<RefValue> {
        self.items.read().clone()
    }

    /// `elem.drop`: empties the segment. Dropping twice is permitted.
    pub fn drop_items(&self) {
        self.items.write().clear();
    }
}

/// Reference to a [`DataInstance`] with shared ownership semantics.
#[derive(Clone)]
pub struct DataRef(Arc<DataInstance>);

impl core::ops::Deref for DataRef {
    type Target = DataInstance;
    fn deref(&self) -> &DataInstance {
        &self.0
    }
}

impl fmt::Debug for DataRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Runtime representation of a data segment.
pub struct DataInstance {
    bytes: RwLock<Vec<u8>>,
}

impl fmt::Debug for DataInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DataInstance")
            .field("len", &self.bytes.read().len())
            .finish()
    }
}

impl DataInstance {
    /// Allocates a data instance.
    pub fn alloc(bytes: Vec<u8>) -> DataRef {
        DataRef(Arc::new(DataInstance {
            bytes: RwLock::new(bytes),
        }))
    }

    /// Number of remaining bytes; zero once dropped.
    pub fn len(&self) -> u32 {
        self.bytes.read().len() as u32
    }

    /// Whether the segment holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.read().is_empty()
    }

    /// A snapshot of the bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// `data.drop`: empties the segment. Dropping twice is permitted.
    pub fn drop_bytes(&self) {
        self.bytes.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_empties_and_is_idempotent() {
        let data = DataInstance::alloc(vec![1, 2, 3]);
        assert_eq!(data.len(), 3);
        data.drop_bytes();
        data.drop_bytes();
        assert!(data.is_empty());

        let elems = ElementInstance::alloc(RefType::funcref(), vec![RefValue::null_func(); 2]);
        elems.drop_items();
        assert_eq!(elems.len(), 0);
    }
}
