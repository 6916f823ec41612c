//! The store: the registry of named module instances.
//!
//! The store exclusively owns every instance it accepts. Registration and
//! dropping take the write lock; invocation-time lookups take the read
//! lock. A module cannot be dropped while any registered module reaches it
//! through import edges, which keeps the importer's weak references valid.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::Error;
use crate::instance::{ExternVal, ModuleInstance};

/// The registry of all loaded module instances, indexed by name.
#[derive(Default)]
pub struct Store {
    modules: RwLock<IndexMap<String, Arc<ModuleInstance>>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let modules = self.modules.read();
        f.debug_struct("Store")
            .field("modules", &modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `instance` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleNameConflict`] if the name is taken.
    pub fn register(&self, name: &str, instance: Arc<ModuleInstance>) -> Result<(), Error> {
        let mut modules = self.modules.write();
        if modules.contains_key(name) {
            return Err(Error::ModuleNameConflict(name.to_string()));
        }
        instance.set_name(name);
        log::debug!("store: registered module {name:?}");
        modules.insert(name.to_string(), instance);
        Ok(())
    }

    /// Looks up a registered module by name.
    pub fn module(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.modules.read().get(name).cloned()
    }

    /// Whether a module with `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    /// Registered module names in insertion order.
    pub fn module_names(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    /// Resolves one export of a registered module.
    pub fn find_export(&self, module: &str, name: &str) -> Result<ExternVal, Error> {
        let instance = self
            .module(module)
            .ok_or_else(|| Error::UnknownModule(module.to_string()))?;
        instance
            .export_by_name(name)
            .ok_or_else(|| Error::UnknownImport {
                module: module.to_string(),
                name: name.to_string(),
            })
    }

    /// Drops the module registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleInUse`] while any other registered module
    /// transitively imports from the victim, and
    /// [`Error::UnknownModule`] if no module has that name.
    pub fn drop_module(&self, name: &str) -> Result<(), Error> {
        let mut modules = self.modules.write();
        if !modules.contains_key(name) {
            return Err(Error::UnknownModule(name.to_string()));
        }
        // Transitive dependents: walk reverse import edges to a fixpoint.
        let mut depends_on_victim: HashSet<String> = HashSet::new();
        depends_on_victim.insert(name.to_string());
        loop {
            let mut grew = false;
            for (module_name, instance) in modules.iter() {
                if depends_on_victim.contains(module_name.as_str()) {
                    continue;
                }
                if instance
                    .import_sources()
                    .iter()
                    .any(|source| depends_on_victim.contains(source.as_str()))
                {
                    depends_on_victim.insert(module_name.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        if depends_on_victim.len() > 1 {
            return Err(Error::ModuleInUse(name.to_string()));
        }
        modules.shift_remove(name);
        log::debug!("store: dropped module {name:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn register_rejects_duplicate_names() {
        let store = Store::new();
        store.register("env", ModuleInstance::empty()).unwrap();
        assert_matches!(
            store.register("env", ModuleInstance::empty()),
            Err(Error::ModuleNameConflict(_))
        );
    }

    #[test]
    fn traversal_order_is_insertion_order() {
        let store = Store::new();
        store.register("zeta", ModuleInstance::empty()).unwrap();
        store.register("alpha", ModuleInstance::empty()).unwrap();
        assert_eq!(store.module_names(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn drop_refuses_while_imported() {
        let store = Store::new();
        store.register("base", ModuleInstance::empty()).unwrap();

        let importer = ModuleInstance::empty();
        importer.record_import_source("base");
        store.register("importer", importer).unwrap();

        // A transitive dependent two hops away also pins the base.
        let leaf = ModuleInstance::empty();
        leaf.record_import_source("importer");
        store.register("leaf", leaf).unwrap();

        assert_matches!(store.drop_module("base"), Err(Error::ModuleInUse(_)));
        assert_matches!(store.drop_module("importer"), Err(Error::ModuleInUse(_)));
        store.drop_module("leaf").unwrap();
        store.drop_module("importer").unwrap();
        store.drop_module("base").unwrap();
        assert!(store.is_empty());
    }
}
