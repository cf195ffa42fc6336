//! Module model and registry collaborator.
//!
//! A module is a sellable unit of work composed of an ordered list of remote
//! primitives. The registry that stores module definitions is plain CRUD and
//! lives outside the engine; the engine only ever reads from it through
//! [`ModuleRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ModuleId;

/// Where a module's logic actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Server-side backend (remote engine or local interpreter).
    Server,
    /// Caller's own environment; the engine only hands out the bundle.
    Browser,
    /// Caller chooses per run; the engine treats this as [`Self::Server`].
    Hybrid,
}

/// Reference to a master primitive and its per-module configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimitiveRef {
    /// Primitive provider, e.g. `"DocumentIntelligence"`.
    pub provider: String,
    /// Method on the provider, e.g. `"extract_text"`.
    pub method: String,
    /// Provider-specific configuration.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// A sellable module definition, read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    /// Marketplace slug.
    pub id: ModuleId,
    /// Display name.
    pub name: String,
    /// Default mode when a request does not pick one.
    pub execution_mode: ExecutionMode,
    /// Ordered primitive pipeline.
    pub primitives: Vec<PrimitiveRef>,
    /// Template reference for client-side execution.
    #[serde(default)]
    pub ui_template: Option<String>,
    /// Needs the hardware abstraction layer (NFC/biometrics).
    #[serde(default)]
    pub requires_hal: bool,
    /// Needs CUDA.
    #[serde(default)]
    pub requires_gpu: bool,
}

/// Read-only module lookup. The engine never writes through this seam.
pub trait ModuleRegistry: Send + Sync {
    /// Fetch a module definition by id.
    fn get(&self, id: &str) -> Option<Module>;
}

/// In-memory registry for wiring and tests.
#[derive(Default)]
pub struct StaticRegistry {
    modules: Arc<RwLock<HashMap<ModuleId, Module>>>,
}

impl StaticRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a module definition.
    pub fn insert(&self, module: Module) {
        self.modules.write().insert(module.id.clone(), module);
    }
}

impl ModuleRegistry for StaticRegistry {
    fn get(&self, id: &str) -> Option<Module> {
        self.modules.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_module(id: &str) -> Module {
        Module {
            id: id.into(),
            name: "Sample".into(),
            execution_mode: ExecutionMode::Hybrid,
            primitives: vec![PrimitiveRef {
                provider: "DocumentIntelligence".into(),
                method: "extract_text".into(),
                config: Default::default(),
            }],
            ui_template: None,
            requires_hal: false,
            requires_gpu: false,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StaticRegistry::new();
        registry.insert(sample_module("doc-extract"));

        assert!(registry.get("doc-extract").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_execution_mode_wire_format() {
        let json = serde_json::to_string(&ExecutionMode::Browser).unwrap();
        assert_eq!(json, "\"browser\"");
        let mode: ExecutionMode = serde_json::from_str("\"hybrid\"").unwrap();
        assert_eq!(mode, ExecutionMode::Hybrid);
    }
}
