use std::collections::HashMap;
use std::sync::Arc;

use crate::handler::FormatHandler;
use crate::handlers::{conf_lines::ConfLinesHandler, npvt::TextProxyHandler, opaque_bundle::OpaqueBundleHandler};

/// Per-run format handler registry, constructed and injected at orchestrator
/// build time (rather than kept as a global singleton) so pipelines stay
/// hermetic under test and multiple runs can coexist in one process.
#[derive(Clone, Default)]
pub struct FormatRegistry {
    handlers: HashMap<String, Arc<dyn FormatHandler>>,
}

const BUNDLE_FORMATS: &[&str] = &[
    "ovpn", "npv4", "ehi", "hc", "hat", "sip", "nm", "dark", "opaque_bundle",
];

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The closed set of formats this codebase ships handlers for.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TextProxyHandler::new("npvt")));
        registry.register(Arc::new(TextProxyHandler::new("npvtsub")));
        registry.register(Arc::new(ConfLinesHandler));
        for format_id in BUNDLE_FORMATS {
            registry.register(Arc::new(OpaqueBundleHandler::new(format_id)));
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn FormatHandler>) {
        let id = handler.format_id().to_string();
        if self.handlers.contains_key(&id) {
            tracing::warn!(format_id = %id, "replacing previously-registered format handler");
        }
        self.handlers.insert(id, handler);
    }

    pub fn get(&self, format_id: &str) -> Option<Arc<dyn FormatHandler>> {
        self.handlers.get(format_id).cloned()
    }

    pub fn list_formats(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_closed_format_set() {
        let registry = FormatRegistry::with_builtin_handlers();
        for fmt in ["npvt", "npvtsub", "conf_lines", "ovpn", "dark"] {
            assert!(registry.get(fmt).is_some(), "missing handler for {fmt}");
        }
        assert!(registry.get("not_a_format").is_none());
    }

    #[test]
    fn re_registration_replaces_handler() {
        let mut registry = FormatRegistry::new();
        registry.register(Arc::new(ConfLinesHandler));
        registry.register(Arc::new(ConfLinesHandler));
        assert_eq!(registry.list_formats(), vec!["conf_lines".to_string()]);
    }
}
