//! Class Transform Router: which selectors apply to which class.
//!
//! Built once in `Agent_OnLoad` and shared as `Arc<TransformRegistry>` with
//! every class-load callback. It is never written after construction, so
//! concurrent lookups from class-loading threads need no locking.

use crate::selector::MethodSelector;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct TransformRegistry {
    by_class: HashMap<String, Vec<MethodSelector>>,
}

impl TransformRegistry {
    /// Groups selectors by owner class, keeping configuration order within
    /// each class.
    pub fn build(selectors: impl IntoIterator<Item = MethodSelector>) -> Self {
        let mut by_class: HashMap<String, Vec<MethodSelector>> = HashMap::new();
        for selector in selectors {
            by_class.entry(selector.owner_class.clone()).or_default().push(selector);
        }
        Self { by_class }
    }

    /// Selectors registered for the exact dotted class name. Supertypes and
    /// subclasses are never consulted.
    pub fn lookup(&self, class_name: &str) -> &[MethodSelector] {
        self.by_class.get(class_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn class_count(&self) -> usize {
        self.by_class.len()
    }

    pub fn selector_count(&self) -> usize {
        self.by_class.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_class.is_empty()
    }
}
