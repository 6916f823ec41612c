//! Global variable instances.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;
use crate::types::{val_matches, GlobalType, Mutability};
use crate::value::Value;

/// Reference to a [`GlobalInstance`] with shared ownership semantics.
#[derive(Clone)]
pub struct GlobalRef(Arc<GlobalInstance>);

impl core::ops::Deref for GlobalRef {
    type Target = GlobalInstance;
    fn deref(&self) -> &GlobalInstance {
        &self.0
    }
}

impl fmt::Debug for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Runtime representation of a global variable.
pub struct GlobalInstance {
    ty: GlobalType,
    value: RwLock<Value>,
}

impl fmt::Debug for GlobalInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GlobalInstance")
            .field("ty", &self.ty)
            .field("value", &*self.value.read())
            .finish()
    }
}

impl GlobalInstance {
    /// Allocates a global holding `value`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `value` does not match the content type.
    pub fn alloc(ty: GlobalType, value: Value) -> Result<GlobalRef, Error> {
        if !val_matches(&value.value_type(), &ty.content) {
            return Err(Error::Global(format!(
                "initial value of type {:?} does not match global type {:?}",
                value.value_type(),
                ty.content
            )));
        }
        Ok(GlobalRef(Arc::new(GlobalInstance {
            ty,
            value: RwLock::new(value),
        })))
    }

    /// The global type.
    pub fn ty(&self) -> &GlobalType {
        &self.ty
    }

    /// Whether `global.set` is permitted.
    pub fn is_mutable(&self) -> bool {
        self.ty.mutability == Mutability::Var
    }

    /// The current value.
    pub fn get(&self) -> Value {
        self.value.read().clone()
    }

    /// Writes the value.
    ///
    /// Mutability and type violations surface at instantiation or host-API
    /// time ([`Error::SetValueToConst`]); validated Wasm code never hits
    /// them at runtime.
    pub fn set(&self, value: Value) -> Result<(), Error> {
        if !self.is_mutable() {
            return Err(Error::SetValueToConst);
        }
        if !val_matches(&value.value_type(), &self.ty.content) {
            return Err(Error::Global(format!(
                "value of type {:?} does not match global type {:?}",
                value.value_type(),
                self.ty.content
            )));
        }
        *self.value.write() = value;
        Ok(())
    }

    /// Unchecked write used by the interpreter after validation has proved
    /// the type and mutability.
    pub(crate) fn set_unchecked(&self, value: Value) {
        *self.value.write() = value;
    }
}
