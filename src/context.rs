//! The shared state threaded through every front end.

use crate::config::SharedConfig;
use crate::error::Error;
use crate::plugin::{PluginLoader, PluginRegistry};
use crate::store::{default_sort_key, RouteStore};
use crate::template::{SharedVariables, Variables};
use std::sync::Arc;

/// Config, descriptor store and plugin cache. Created once at startup and cloned into each
/// listener.
#[derive(Clone, Debug)]
pub struct Context {
    pub config: SharedConfig,
    pub store: Arc<RouteStore>,
    pub plugins: Arc<PluginLoader>,
}

impl Context {
    /// Detect the variable table, load the descriptor store and set up the plugin loader with the
    /// built-in plugins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `files_root` isn't a directory and [`Error::InvalidGlob`] if a
    /// route glob is invalid.
    pub fn new(config: SharedConfig) -> Result<Self, Error> {
        if !config.files_root.is_dir() {
            return Err(Error::Config(format!(
                "files root {} is not a directory",
                config.files_root.display()
            )));
        }
        let variables = Arc::new(Variables::detect(&config.variables));
        let store = RouteStore::load(config.route_globs(), variables, Arc::new(default_sort_key))?
            .with_invalidate_time(config.cache_invalidate_time);
        let plugins = PluginLoader::new(&config.files_root, PluginRegistry::builtin())?;
        Ok(Self::from_parts(config, Arc::new(store), Arc::new(plugins)))
    }

    pub fn from_parts(
        config: SharedConfig,
        store: Arc<RouteStore>,
        plugins: Arc<PluginLoader>,
    ) -> Self {
        Context {
            config,
            store,
            plugins,
        }
    }

    pub fn variables(&self) -> &SharedVariables {
        self.store.variables()
    }
}
