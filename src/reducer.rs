use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::action::{Action, ActionType, Status};
use crate::error::Error;
use crate::merge::{shallow_merge, MergeStrategy};

pub type SliceState = Arc<Value>;

/// Pure reduction of one slice. `None` means the slice has no state yet.
pub trait Reducer: Send + Sync {
    fn reduce(&self, state: Option<&SliceState>, action: &Action) -> SliceState;
}

impl<F> Reducer for F
where
    F: Fn(Option<&SliceState>, &Action) -> SliceState + Send + Sync,
{
    fn reduce(&self, state: Option<&SliceState>, action: &Action) -> SliceState {
        self(state, action)
    }
}

/// `(state, payload, request) -> partial state`
pub type HandlerFn = Arc<dyn Fn(&Value, &Value, &Value) -> Option<Value> + Send + Sync>;

#[derive(Clone)]
pub enum Handler {
    Fn(HandlerFn),
    /// Always yields the same partial state.
    Static(Value),
}

impl Handler {
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        Self::Fn(Arc::new(f))
    }

    fn call(&self, state: &Value, payload: &Value, request: &Value) -> Option<Value> {
        match self {
            Self::Fn(f) => f(state, payload, request),
            Self::Static(value) => Some(value.clone()),
        }
    }
}

impl From<Value> for Handler {
    fn from(value: Value) -> Self {
        Self::Static(value)
    }
}

impl From<HandlerFn> for Handler {
    fn from(value: HandlerFn) -> Self {
        Self::Fn(value)
    }
}

pub type Persister = Arc<dyn Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Sinks invoked with `(key, state)` whenever a persisted slice is written.
#[derive(Clone, Default)]
pub struct Persisters {
    sinks: Arc<RwLock<Vec<Persister>>>,
}

impl Persisters {
    pub fn add<F>(&self, sink: F)
    where
        F: Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.sinks.write().push(Arc::new(sink));
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best effort: a failing or panicking sink is logged and skipped.
    pub fn run(&self, key: &str, state: &Value) {
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            match catch_unwind(AssertUnwindSafe(|| sink(key, state))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::error!("{key}: {}", Error::from(err)),
                Err(_) => log::error!("persister panicked for {key}"),
            }
        }
    }
}

#[derive(Clone)]
struct HandlerEntry {
    status: Status,
    handler: Handler,
}

struct ContextTable {
    initial: SliceState,
    handlers: HashMap<ActionType, Vec<HandlerEntry>>,
    persist_key: Option<String>,
    prepared: bool,
}

struct ContextInner {
    name: String,
    strategy: MergeStrategy,
    persisters: Persisters,
    table: RwLock<ContextTable>,
}

/// Owns one named slice: its baseline state and the handlers that reduce it.
///
/// Handlers are looked up at reduction time, so anything registered after
/// [`ReducerContext::prepare`] still takes part.
#[derive(Clone)]
pub struct ReducerContext {
    inner: Arc<ContextInner>,
}

impl ReducerContext {
    pub fn new(
        name: impl Into<String>,
        initial: Value,
        strategy: MergeStrategy,
        persisters: Persisters,
    ) -> Self {
        let initial = if initial.is_object() {
            initial
        } else {
            Value::Object(Map::new())
        };
        Self {
            inner: Arc::new(ContextInner {
                name: name.into(),
                strategy,
                persisters,
                table: RwLock::new(ContextTable {
                    initial: Arc::new(initial),
                    handlers: HashMap::new(),
                    persist_key: None,
                    prepared: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registers a `success` handler.
    pub fn handle(&self, action_type: impl Into<ActionType>, handler: impl Into<Handler>) -> &Self {
        self.handle_status(action_type, handler, Status::Success)
    }

    pub fn handle_status(
        &self,
        action_type: impl Into<ActionType>,
        handler: impl Into<Handler>,
        status: Status,
    ) -> &Self {
        let action_type = action_type.into();
        if !action_type.is_valid() {
            log::warn!("reducer {} encountered invalid action type", self.inner.name);
            return self;
        }
        self.inner
            .table
            .write()
            .handlers
            .entry(action_type)
            .or_default()
            .push(HandlerEntry {
                status,
                handler: handler.into(),
            });
        self
    }

    pub fn has_listener_status(&self, action_type: &ActionType, status: Status) -> bool {
        self.inner
            .table
            .read()
            .handlers
            .get(action_type)
            .is_some_and(|entries| entries.iter().any(|entry| entry.status == status))
    }

    pub fn initial_state(&self) -> SliceState {
        self.inner.table.read().initial.clone()
    }

    /// Replaces the baseline, or overlays its top-level keys when `merge` is set.
    pub fn set_initial_state(&self, value: Value, merge: bool) -> &Self {
        let mut table = self.inner.table.write();
        let next = if merge {
            let mut base = Value::clone(&table.initial);
            shallow_merge(&mut base, &value);
            base
        } else {
            value
        };
        table.initial = Arc::new(next);
        self
    }

    pub fn persist(&self, key: impl Into<String>) -> &Self {
        self.inner.table.write().persist_key = Some(key.into());
        self
    }

    pub fn disable_persist(&self) -> &Self {
        self.inner.table.write().persist_key = None;
        self
    }

    pub fn persist_key(&self) -> Option<String> {
        self.inner.table.read().persist_key.clone()
    }

    /// Returns the slice reducer. The first call also snapshots the baseline to
    /// the persisters (when enabled); later calls leave persisted data alone.
    pub fn prepare(&self) -> Arc<dyn Reducer> {
        let (key, initial) = {
            let mut table = self.inner.table.write();
            let first = !std::mem::replace(&mut table.prepared, true);
            (table.persist_key.clone().filter(|_| first), table.initial.clone())
        };
        if let Some(key) = key {
            self.inner.persisters.run(&key, &initial);
        }
        Arc::new(self.clone())
    }

    fn entries_for(
        &self,
        action_type: &ActionType,
    ) -> Option<(Vec<HandlerEntry>, SliceState, Option<String>)> {
        let table = self.inner.table.read();
        let entries = table.handlers.get(action_type)?;
        Some((entries.clone(), table.initial.clone(), table.persist_key.clone()))
    }
}

impl Reducer for ReducerContext {
    fn reduce(&self, state: Option<&SliceState>, action: &Action) -> SliceState {
        let Some((entries, initial, persist_key)) = self.entries_for(&action.action_type) else {
            return state.cloned().unwrap_or_else(|| self.initial_state());
        };
        let current = state.unwrap_or(&initial);
        let payload = action.handler_payload();
        let request = action
            .request
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let status = action.status();

        let mut next = Value::clone(current);
        for entry in entries.iter().filter(|entry| entry.status == status) {
            if let Some(patch) = entry.handler.call(&next, &payload, &request) {
                if patch.is_object() {
                    self.inner.strategy.apply(&mut next, &patch);
                }
            }
        }
        log::trace!("{} reduced {} ({status})", self.inner.name, action.action_type);

        if let Some(key) = persist_key {
            self.inner.persisters.run(&key, &next);
        }
        Arc::new(next)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn context(initial: Value) -> ReducerContext {
        ReducerContext::new("todos", initial, MergeStrategy::Deep, Persisters::default())
    }

    #[test]
    fn test_identity_on_unhandled_action() {
        let ctx = context(json!({"items": []}));
        ctx.handle("todos.add", json!({"dirty": true}));
        let reducer = ctx.prepare();

        let state = Arc::new(json!({"items": [1]}));
        let next = reducer.reduce(Some(&state), &Action::new("other"));
        assert!(Arc::ptr_eq(&state, &next));
    }

    #[test]
    fn test_missing_state_uses_initial() {
        let ctx = context(json!({"count": 0}));
        let reducer = ctx.prepare();
        let next = reducer.reduce(None, &Action::new("other"));
        assert_eq!(*next, json!({"count": 0}));
    }

    #[test]
    fn test_handled_action_yields_new_reference() {
        let ctx = context(json!({}));
        ctx.handle_status("todos.add", json!({"loading": true}), Status::Pending);
        let reducer = ctx.prepare();

        let state = Arc::new(json!({"count": 1}));
        let next = reducer.reduce(Some(&state), &Action::new("todos.add"));
        assert!(!Arc::ptr_eq(&state, &next));
        assert_eq!(*next, *state);
    }

    #[test]
    fn test_status_isolation() {
        let ctx = context(json!({}));
        ctx.handle("todos.load", json!({"ok": true}));
        ctx.handle_status("todos.load", json!({"failed": 1}), Status::Error);
        ctx.handle_status(
            "todos.load",
            Handler::func(|state, _, _| Some(json!({"failed": state["failed"].as_i64()? + 1}))),
            Status::Error,
        );
        let reducer = ctx.prepare();

        let action = Action::new("todos.load").with_status(Status::Error);
        let next = reducer.reduce(Some(&Arc::new(json!({}))), &action);
        assert_eq!(*next, json!({"failed": 2}));
    }

    #[test]
    fn test_sequential_fold() {
        let ctx = context(json!({}));
        let seen = Arc::new(Mutex::new(Value::Null));
        let seen_by_second = seen.clone();
        ctx.handle("set", Handler::func(|_, _, _| Some(json!({"a": 1, "b": 1}))));
        ctx.handle(
            "set",
            Handler::func(move |state, _, _| {
                *seen_by_second.lock() = state.clone();
                Some(json!({"b": 2}))
            }),
        );
        let reducer = ctx.prepare();

        let next = reducer.reduce(Some(&Arc::new(json!({"c": 0}))), &Action::new("set"));
        assert_eq!(*next, json!({"a": 1, "b": 2, "c": 0}));
        assert_eq!(*seen.lock(), json!({"a": 1, "b": 1, "c": 0}));
    }

    #[test]
    fn test_handler_receives_payload_and_request() {
        let ctx = context(json!({}));
        ctx.handle(
            "search",
            Handler::func(|_, payload, request| {
                Some(json!({"results": payload["hits"].clone(), "query": request["q"].clone()}))
            }),
        );
        let action = Action::new("search")
            .with_payload(json!({"hits": [1, 2]}))
            .with_request(Some(json!({"q": "rust"})));
        let next = ctx.prepare().reduce(None, &action);
        assert_eq!(*next, json!({"results": [1, 2], "query": "rust"}));
    }

    #[test]
    fn test_handlers_added_after_prepare_apply() {
        let ctx = context(json!({}));
        let reducer = ctx.prepare();
        ctx.handle("late", json!({"late": true}));
        let next = reducer.reduce(None, &Action::new("late"));
        assert_eq!(*next, json!({"late": true}));
    }

    #[test]
    fn test_invalid_type_is_ignored() {
        let ctx = context(json!({}));
        ctx.handle("", json!({"never": true}));
        assert!(!ctx.has_listener_status(&ActionType::from(""), Status::Success));
    }

    #[test]
    fn test_has_listener_status() {
        let ctx = context(json!({}));
        ctx.handle("load", json!({}));
        let load = ActionType::from("load");
        assert!(ctx.has_listener_status(&load, Status::Success));
        assert!(!ctx.has_listener_status(&load, Status::Pending));
    }

    #[test]
    fn test_set_initial_state_merge() {
        let ctx = context(json!({"page": 1, "filter": {"q": "a"}}));
        ctx.set_initial_state(json!({"filter": {"tag": "b"}}), true);
        assert_eq!(*ctx.initial_state(), json!({"page": 1, "filter": {"tag": "b"}}));

        ctx.set_initial_state(json!({"page": 2}), false);
        assert_eq!(*ctx.initial_state(), json!({"page": 2}));
    }

    #[test]
    fn test_persisters_see_prepare_and_reduction() {
        let persisters = Persisters::default();
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        persisters.add(|_, _| anyhow::bail!("disk full"));
        persisters.add(move |key, state| {
            sink.lock().push((key.to_owned(), state.clone()));
            Ok(())
        });

        let ctx = ReducerContext::new(
            "prefs",
            json!({"dark": false}),
            MergeStrategy::Deep,
            persisters,
        );
        ctx.persist("prefs.v1");
        ctx.handle("toggle", json!({"dark": true}));
        let reducer = ctx.prepare();
        reducer.reduce(None, &Action::new("toggle"));
        ctx.prepare();

        let written = written.lock();
        assert_eq!(
            *written,
            vec![
                ("prefs.v1".to_owned(), json!({"dark": false})),
                ("prefs.v1".to_owned(), json!({"dark": true})),
            ]
        );
    }
}
