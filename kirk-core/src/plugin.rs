//! Static plugin registry for [`crate::sut::Sut`] and [`crate::framework::Framework`]
//! implementations.
//!
//! The original loaded plugin classes from a directory at runtime; a typed rewrite prefers a
//! build-time list of known implementations instead. [`PluginRegistry`] keeps that list,
//! rejects duplicate names at registration time, and gives the CLI a sorted name/help map for
//! `--sut`/`--framework` autodiscovery.

use std::sync::Arc;

use crate::errors::PluginError;

/// Common surface every registrable plugin exposes, mirroring the original `Plugin` base
/// class's `name` and `config_help` members.
pub trait Plugin {
    /// Stable, user-facing identifier (`"host"`, `"ssh"`, `"ltp"`, ...).
    fn name(&self) -> &str;

    /// Configuration keys this plugin accepts, paired with a one-line help string, in the
    /// order they should be shown.
    fn config_help(&self) -> Vec<(&'static str, &'static str)> {
        Vec::new()
    }
}

/// A name-keyed collection of `Arc<dyn T>` plugin instances.
pub struct PluginRegistry<T: ?Sized> {
    entries: Vec<Arc<T>>,
}

impl<T: ?Sized + Plugin> Default for PluginRegistry<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T: ?Sized + Plugin> PluginRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin. Fails startup-fast if its name is already taken.
    pub fn register(&mut self, plugin: Arc<T>) -> Result<(), PluginError> {
        if self.entries.iter().any(|p| p.name() == plugin.name()) {
            return Err(PluginError::Duplicate(plugin.name().to_string()));
        }
        self.entries.push(plugin);
        self.entries.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(())
    }

    /// Looks a plugin up by name, or fails with the sorted list of known names.
    pub fn get(&self, name: &str) -> Result<Arc<T>, PluginError> {
        self.entries
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string(), self.names().join(", ")))
    }

    /// Names of every registered plugin, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|p| p.name()).collect()
    }

    /// All registered plugins, sorted by name.
    pub fn all(&self) -> &[Arc<T>] {
        &self.entries
    }
}
