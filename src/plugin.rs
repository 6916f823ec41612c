//! The plug-in context.
//!
//! Plug-ins provide named host modules (functions, tables, memories,
//! globals) plus a one-shot lifecycle hook. The registry is an explicit
//! value passed around by the embedder; there is no process-global plug-in
//! state. The configured `forbidden_plugins` list excludes plug-ins at
//! registration time.

use crate::config::Config;
use crate::error::Error;
use crate::host::HostModuleBuilder;

/// A provider of host modules.
pub trait Plugin: Send {
    /// The plug-in name, matched against `forbidden_plugins`.
    fn name(&self) -> &str;

    /// Called once when the plug-in is taken into a context.
    fn init(&mut self, _config: &Config) -> Result<(), Error> {
        Ok(())
    }

    /// The host module this plug-in exports.
    fn module(&self) -> HostModuleBuilder;
}

/// An explicit registry of loaded plug-ins.
#[derive(Default)]
pub struct PluginContext {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plug-in; `init` runs later, at registration into a store.
    pub fn add(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Names of the loaded plug-ins.
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .iter()
            .map(|plugin| plugin.name().to_string())
            .collect()
    }

    pub(crate) fn plugins_mut(&mut self) -> &mut [Box<dyn Plugin>] {
        &mut self.plugins
    }
}
