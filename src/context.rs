//! Run-scoped variable store shared by the stages of one scenario.

use serde_json::Value;

use crate::model::Vars;

/// Ordered name -> value store. Later writes replace earlier ones;
/// replaced keys keep their original position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableContext {
    vars: Vars,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a context from already-resolved seed variables.
    pub fn seeded(vars: Vars) -> Self {
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Merge `other` into the context. Only the executor commits
    /// stage outputs, so this stays crate-private.
    pub(crate) fn merge(&mut self, other: Vars) {
        for (name, value) in other {
            self.vars.insert(name, value);
        }
    }

    /// Read-only view handed to templates and user functions.
    pub fn snapshot(&self) -> &Vars {
        &self.vars
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn into_vars(self) -> Vars {
        self.vars
    }
}
