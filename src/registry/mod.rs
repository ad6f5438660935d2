// # Action and Rule Registries
//
// Read-mostly stores populated at load time. Actions are keyed by
// (entity type, action name); rules are indexed by trigger key and kept in
// descending priority order, insertion-stable for equal priorities.
// Registration takes the write lock; lookups share the read lock.

use crate::ast::{ActionDef, Declaration, RuleDef, Trigger};
use crate::error::{EngineError, Result};
use crate::parser;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

// ============================================================================
// Action registry
// ============================================================================

/// Stores actions keyed by `(entity_type, action_name)`.
pub struct ActionRegistry {
    actions: RwLock<HashMap<(String, String), Arc<ActionDef>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Register an action; an existing entry under the same key is
    /// replaced.
    pub fn register(&self, action: ActionDef) {
        let key = (action.entity_type.clone(), action.name.clone());
        self.actions.write().insert(key, Arc::new(action));
    }

    pub fn lookup(&self, entity_type: &str, name: &str) -> Option<Arc<ActionDef>> {
        self.actions
            .read()
            .get(&(entity_type.to_string(), name.to_string()))
            .cloned()
    }

    /// All actions declared for one entity type, ordered by name.
    pub fn list_by_entity(&self, entity_type: &str) -> Vec<Arc<ActionDef>> {
        let mut actions: Vec<Arc<ActionDef>> = self
            .actions
            .read()
            .iter()
            .filter(|((declared_type, _), _)| declared_type == entity_type)
            .map(|(_, action)| Arc::clone(action))
            .collect();
        actions.sort_by(|a, b| a.name.cmp(&b.name));
        actions
    }

    /// Parse a DSL unit and register every ACTION declaration in it.
    /// Returns the number registered; RULE declarations are left to the
    /// rule registry.
    pub fn load_from_text(&self, text: &str) -> Result<usize> {
        let declarations = parser::parse(text)?;
        let mut count = 0;
        for declaration in declarations {
            if let Declaration::Action(action) = declaration {
                self.register(action);
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        self.load_from_text(&text)
    }

    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.read().is_empty()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Rule registry
// ============================================================================

#[derive(Default)]
struct RuleIndex {
    by_name: HashMap<String, Arc<RuleDef>>,
    buckets: HashMap<String, Vec<Arc<RuleDef>>>,
}

impl RuleIndex {
    fn remove(&mut self, name: &str) -> Option<Arc<RuleDef>> {
        let rule = self.by_name.remove(name)?;
        if let Some(bucket) = self.buckets.get_mut(&rule.trigger.key()) {
            bucket.retain(|r| r.name != name);
        }
        Some(rule)
    }

    fn insert(&mut self, rule: Arc<RuleDef>) {
        let key = rule.trigger.key();
        self.by_name.insert(rule.name.clone(), Arc::clone(&rule));
        let bucket = self.buckets.entry(key).or_default();
        bucket.push(rule);
        // Stable sort keeps registration order among equal priorities
        bucket.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
}

/// Stores rules indexed by trigger key, priority-ordered within a bucket.
pub struct RuleRegistry {
    index: RwLock<RuleIndex>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(RuleIndex::default()),
        }
    }

    /// Register a rule. Rule names are unique; re-registering a name
    /// replaces the previous definition.
    pub fn register(&self, rule: RuleDef) {
        let mut index = self.index.write();
        index.remove(&rule.name);
        index.insert(Arc::new(rule));
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<RuleDef>> {
        self.index.read().by_name.get(name).cloned()
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.index
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::RuleNotFound(name.to_string()))
    }

    /// Rules matching a trigger, highest priority first.
    pub fn get_by_trigger(&self, trigger: &Trigger) -> Vec<Arc<RuleDef>> {
        self.get_by_key(&trigger.key())
    }

    /// Same lookup by a precomputed trigger key (the engine's event path).
    pub fn get_by_key(&self, key: &str) -> Vec<Arc<RuleDef>> {
        self.index
            .read()
            .buckets
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<Arc<RuleDef>> {
        self.index.read().by_name.values().cloned().collect()
    }

    /// All rules whose trigger watches one entity type, ordered by name.
    pub fn list_by_entity(&self, entity_type: &str) -> Vec<Arc<RuleDef>> {
        let mut rules: Vec<Arc<RuleDef>> = self
            .index
            .read()
            .by_name
            .values()
            .filter(|rule| rule.trigger.entity_type == entity_type)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    pub fn clear(&self) {
        let mut index = self.index.write();
        index.by_name.clear();
        index.buckets.clear();
    }

    pub fn load_from_text(&self, text: &str) -> Result<usize> {
        let declarations = parser::parse(text)?;
        let mut count = 0;
        for declaration in declarations {
            if let Declaration::Rule(rule) = declaration {
                self.register(rule);
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        self.load_from_text(&text)
    }

    pub fn len(&self) -> usize {
        self.index.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().by_name.is_empty()
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
