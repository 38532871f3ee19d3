use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;

use crate::action::{Action, ActionType};
use crate::error::Error;
use crate::store::{Middleware, Next};

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

type ListenerTable = HashMap<ActionType, Vec<(u64, Listener)>>;

/// Action-type keyed listeners, notified after the store applied an action.
///
/// An emission works on a snapshot of the listener list, so removing a
/// listener mid-emission only affects the next emission.
#[derive(Clone, Default)]
pub struct EventBus {
    table: Arc<RwLock<ListenerTable>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn add_listener<F>(&self, action_type: impl Into<ActionType>, listener: F) -> ListenerHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.add_listeners([(action_type.into(), Some(Arc::new(listener) as Listener))], None)
    }

    /// Registers one listener per type. Entries without their own listener use
    /// `fallback`; a type listed twice keeps its last listener.
    pub fn add_listeners<I>(&self, pairs: I, fallback: Option<Listener>) -> ListenerHandle
    where
        I: IntoIterator<Item = (ActionType, Option<Listener>)>,
    {
        let mut events: Vec<(ActionType, Listener)> = Vec::new();
        for (action_type, listener) in pairs {
            if !action_type.is_valid() {
                log::warn!("add_listener: invalid action type");
                continue;
            }
            let Some(listener) = listener.or_else(|| fallback.clone()) else {
                log::warn!("add_listener: no callback for {action_type}");
                continue;
            };
            match events.iter_mut().find(|(existing, _)| *existing == action_type) {
                Some(entry) => entry.1 = listener,
                None => events.push((action_type, listener)),
            }
        }

        let mut table = self.table.write();
        let registrations = events
            .into_iter()
            .map(|(action_type, listener)| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                table.entry(action_type.clone()).or_default().push((id, listener));
                (action_type, id)
            })
            .collect();
        ListenerHandle {
            table: Arc::downgrade(&self.table),
            registrations,
            removed: AtomicBool::new(false),
        }
    }

    pub fn emit(&self, action_type: &ActionType, payload: &Value) {
        let listeners: Vec<Listener> = match self.table.read().get(action_type) {
            Some(entries) => entries.iter().map(|(_, listener)| listener.clone()).collect(),
            None => return,
        };
        for listener in listeners {
            listener(payload);
        }
    }

    pub fn emit_action(&self, action: &Action) {
        self.emit(&action.action_type, &action.payload_or_empty());
    }

    pub fn listener_count(&self, action_type: &ActionType) -> usize {
        self.table.read().get(action_type).map_or(0, Vec::len)
    }

    /// The middleware that feeds this bus. Must sit last in the chain.
    pub fn tap(&self) -> EventTap {
        EventTap { bus: self.clone() }
    }
}

pub struct ListenerHandle {
    table: Weak<RwLock<ListenerTable>>,
    registrations: Vec<(ActionType, u64)>,
    removed: AtomicBool,
}

impl ListenerHandle {
    /// Removes every registration made by the call that produced this handle.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = table.write();
        for (action_type, id) in &self.registrations {
            if let Some(entries) = table.get_mut(action_type) {
                entries.retain(|(other, _)| other != id);
                if entries.is_empty() {
                    table.remove(action_type);
                }
            }
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

pub struct EventTap {
    bus: EventBus,
}

impl Middleware for EventTap {
    fn handle(&self, action: Action, next: Next<'_>) -> Result<(), Error> {
        let action_type = action.action_type.clone();
        let payload = action.payload_or_empty();
        next(action)?;
        self.bus.emit(&action_type, &payload);
        Ok(())
    }
}
