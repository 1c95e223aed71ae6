//! Stage registry for managing available stage types.

use crate::filters::stage::{Category, StageDescriptor, StageTransform};
use indexmap::IndexMap;
use std::sync::Arc;

/// Registry entry containing the transform and its cached descriptor.
#[derive(Clone)]
pub struct RegistryEntry {
    /// Shared transform instance.
    pub transform: Arc<dyn StageTransform>,
    /// Cached descriptor.
    pub descriptor: StageDescriptor,
    /// Whether this stage can be looked up.
    pub enabled: bool,
}

/// Registry for all available stage types.
///
/// Both the parent process and every worker build a registry. Workers report
/// the names they registered during the pool handshake, so the two sides can
/// be checked against each other before any work is sent.
pub struct StageRegistry {
    /// Stages indexed by their unique name.
    stages: IndexMap<String, RegistryEntry>,
    /// Stages grouped by category.
    categories: IndexMap<Category, Vec<String>>,
}

impl StageRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            stages: IndexMap::new(),
            categories: IndexMap::new(),
        }
    }

    /// Create a registry pre-populated with built-in stages.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::filters::builtin::register_all(&mut registry);
        registry
    }

    /// Register a stage, replacing any stage with the same name.
    pub fn register<S>(&mut self, stage: S)
    where
        S: StageTransform + 'static,
    {
        self.register_shared(Arc::new(stage));
    }

    /// Register an already shared stage.
    pub fn register_shared(&mut self, transform: Arc<dyn StageTransform>) {
        let descriptor = transform.descriptor();
        let name = descriptor.name.clone();
        let category = descriptor.category;

        if self.stages.contains_key(&name) {
            self.unregister(&name);
        }

        self.stages.insert(
            name.clone(),
            RegistryEntry {
                transform,
                descriptor,
                enabled: true,
            },
        );

        self.categories
            .entry(category)
            .or_insert_with(Vec::new)
            .push(name);
    }

    /// Look up an enabled stage by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StageTransform>> {
        self.stages
            .get(name)
            .filter(|e| e.enabled)
            .map(|e| e.transform.clone())
    }

    /// Get the descriptor of a stage without cloning the transform.
    pub fn descriptor(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.get(name).map(|e| &e.descriptor)
    }

    /// Check if a stage is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Names of all enabled stages, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|(_, e)| e.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Get stages by category.
    pub fn stages_by_category(&self, category: &Category) -> Vec<&str> {
        self.categories
            .get(category)
            .map(|names| names.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// Enable or disable a stage.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        if let Some(entry) = self.stages.get_mut(name) {
            entry.enabled = enabled;
            true
        } else {
            false
        }
    }

    /// Unregister a stage.
    pub fn unregister(&mut self, name: &str) -> bool {
        if let Some(entry) = self.stages.shift_remove(name) {
            if let Some(names) = self.categories.get_mut(&entry.descriptor.category) {
                names.retain(|n| n != name);
            }
            true
        } else {
            false
        }
    }

    /// Get the total number of registered stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Get enabled stage descriptors grouped by category, sorted by name.
    pub fn grouped_by_category(&self) -> IndexMap<Category, Vec<&StageDescriptor>> {
        let mut grouped: IndexMap<Category, Vec<&StageDescriptor>> = IndexMap::new();

        for category in Category::all() {
            for entry in self.stages.values() {
                if entry.enabled && entry.descriptor.category == *category {
                    grouped.entry(*category).or_default().push(&entry.descriptor);
                }
            }
        }

        for stages in grouped.values_mut() {
            stages.sort_by(|a, b| a.name.cmp(&b.name));
        }

        grouped
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
