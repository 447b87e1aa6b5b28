// src/services.rs
use std::any::Any;

use rustc_hash::FxHashMap;

use crate::error::{CatzillaError, CatzillaResult};

struct ServiceEntry {
    value: Box<dyn Any + Send + Sync>,
    deps: Vec<String>,
}

/// Registry of named services with explicit dependency edges. Cycles are
/// rejected at registration time; resolution hands out borrowed
/// references, never owned ones.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: FxHashMap<String, ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    /// Register a service under `name` depending on `deps`. Dependencies
    /// may be registered later; only a cycle through already-known edges
    /// is an error.
    pub fn register<T: Any + Send + Sync>(
        &mut self,
        name: impl Into<String>,
        value: T,
        deps: &[&str],
    ) -> CatzillaResult<()> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(CatzillaError::Config(format!(
                "service '{name}' already registered"
            )));
        }

        let deps: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
        for dep in &deps {
            if dep == &name || self.depends_on(dep, &name) {
                return Err(CatzillaError::ServiceCycle(format!(
                    "'{name}' -> '{dep}' closes a dependency cycle"
                )));
            }
        }

        self.entries.insert(name, ServiceEntry {
            value: Box::new(value),
            deps,
        });
        Ok(())
    }

    /// Does `from` (transitively) depend on `target`?
    fn depends_on(&self, from: &str, target: &str) -> bool {
        let Some(entry) = self.entries.get(from) else {
            return false;
        };
        entry
            .deps
            .iter()
            .any(|dep| dep == target || self.depends_on(dep, target))
    }

    /// Borrowed handle to a registered service.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.entries.get(name).and_then(|e| e.value.downcast_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that every declared dependency is actually registered.
    pub fn validate(&self) -> CatzillaResult<()> {
        for (name, entry) in &self.entries {
            for dep in &entry.deps {
                if !self.entries.contains_key(dep) {
                    return Err(CatzillaError::Config(format!(
                        "service '{name}' depends on unregistered '{dep}'"
                    )));
                }
            }
        }
        Ok(())
    }
}
