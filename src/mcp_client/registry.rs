//! Tool catalog — the server's advertised tools as an immutable snapshot.
//!
//! The catalog is replaced wholesale whenever `tools/list` is (re)issued and
//! cleared on stop. Readers get an `Arc` to the snapshot that was current when
//! they asked; a later replacement never mutates it.

use std::sync::{Arc, PoisonError, RwLock};

use super::types::ToolDescriptor;

/// Shared, cheaply cloneable handle to the current tool snapshot.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    current: Arc<RwLock<Arc<[ToolDescriptor]>>>,
}

impl ToolCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole snapshot.
    pub fn replace(&self, tools: Vec<ToolDescriptor>) {
        let snapshot: Arc<[ToolDescriptor]> = tools.into();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Drop every tool.
    pub fn clear(&self) {
        self.replace(Vec::new());
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<[ToolDescriptor]> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.snapshot().iter().find(|t| t.name == name).cloned()
    }

    /// Whether the server advertises a tool with this name.
    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().iter().any(|t| t.name == name)
    }

    /// Tool names in server order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|t| t.name.clone()).collect()
    }

    /// Number of tools in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
