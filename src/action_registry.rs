use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::action::{Action, ActionType};

pub type CreatorFn = Arc<dyn Fn(Value) -> Action + Send + Sync>;

/// An exposed action creator: either a fixed action record or `payload -> Action`.
#[derive(Clone)]
pub enum ActionCreator {
    Static(Value),
    Creator(CreatorFn),
}

impl ActionCreator {
    pub fn creator<F>(f: F) -> Self
    where
        F: Fn(Value) -> Action + Send + Sync + 'static,
    {
        Self::Creator(Arc::new(f))
    }

    /// Builds the action. A static record that is not a valid action yields `None`.
    pub fn create(&self, payload: Value) -> Option<Action> {
        match self {
            Self::Creator(f) => Some(f(payload)),
            Self::Static(record) => serde_json::from_value(record.clone()).ok(),
        }
    }
}

#[derive(Default)]
struct NamespaceTable {
    creators: HashMap<String, ActionCreator>,
    types: HashMap<String, ActionType>,
}

/// Action creators and type constants exposed under one reducer name.
#[derive(Clone, Default)]
pub struct Namespace {
    table: Arc<RwLock<NamespaceTable>>,
}

impl Namespace {
    pub fn get(&self, name: &str) -> Option<ActionCreator> {
        self.table.read().creators.get(name).cloned()
    }

    /// Last write wins for `name`; every other entry is untouched.
    pub fn insert(&self, name: impl Into<String>, creator: ActionCreator) {
        self.table.write().creators.insert(name.into(), creator);
    }

    pub fn create(&self, name: &str, payload: Value) -> Option<Action> {
        let Some(creator) = self.get(name) else {
            log::warn!("no action creator named {name}");
            return None;
        };
        creator.create(payload)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.read().creators.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.table.read().creators.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_type(&self, name: impl Into<String>, action_type: ActionType) {
        self.table.write().types.insert(name.into(), action_type);
    }

    pub fn type_of(&self, name: &str) -> Option<ActionType> {
        self.table.read().types.get(name).cloned()
    }
}

#[derive(Default)]
pub struct ActionRegistry {
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl ActionRegistry {
    /// Returns the namespace for `name`, creating it on first use.
    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        if name.is_empty() {
            log::warn!("actions() requires a reducer name");
            return None;
        }
        if let Some(namespace) = self.namespaces.read().get(name) {
            return Some(namespace.clone());
        }
        Some(
            self.namespaces
                .write()
                .entry(name.to_owned())
                .or_default()
                .clone(),
        )
    }

    pub fn add_actions<I, K>(&self, name: &str, actions: I) -> bool
    where
        I: IntoIterator<Item = (K, ActionCreator)>,
        K: Into<String>,
    {
        let Some(namespace) = self.namespace(name) else {
            return false;
        };
        for (action_name, creator) in actions {
            let action_name = action_name.into();
            if let ActionCreator::Static(record) = &creator {
                if !record.is_object() {
                    log::warn!("skipping non-object static action {name}.{action_name}");
                    continue;
                }
            }
            namespace.insert(action_name, creator);
        }
        true
    }
}
