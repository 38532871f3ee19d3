use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::action::{Action, ActionType, Status};
use crate::action_registry::{ActionCreator, ActionRegistry, Namespace};
use crate::action_sender::{ActionSender, AnyActionSender};
use crate::config::EngineConfig;
use crate::effect::{AsyncAction, Completion, Dispatch, Settlement};
use crate::error::Error;
use crate::event_bus::{EventBus, Listener, ListenerHandle};
use crate::form::{Form, FormEnv, FormOptions, FormSource, FormStructures};
use crate::merge::merge;
use crate::reducer::{Persisters, ReducerContext};
use crate::store::{
    combine_reducers, ActionLogger, AppState, BasicStore, Middleware, RootReducer, Store,
    Subscriber, Subscription,
};

/// Dispatches waiting for the store. `replaying` stays set while `init` drains
/// the queue so that later dispatches line up behind it.
#[derive(Default)]
struct PendingQueue {
    items: Vec<Dispatch>,
    replaying: bool,
}

struct EngineInner {
    config: EngineConfig,
    reducers: RwLock<BTreeMap<String, ReducerContext>>,
    actions: Arc<ActionRegistry>,
    bus: EventBus,
    persisters: Persisters,
    forms: FormStructures,
    store: RwLock<Option<Arc<dyn Store>>>,
    pending: Mutex<PendingQueue>,
    pending_subscribers: Mutex<Vec<Subscriber>>,
}

/// Owns every registry and routes dispatches to the store.
///
/// Register reducers, actions and listeners, then call [`Engine::init`].
/// Dispatches issued before `init` are queued and replayed in order.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                reducers: RwLock::default(),
                actions: Arc::default(),
                bus: EventBus::default(),
                persisters: Persisters::default(),
                forms: FormStructures::default(),
                store: RwLock::new(None),
                pending: Mutex::default(),
                pending_subscribers: Mutex::default(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns the context for `name`, creating it on first call.
    pub fn reducer(&self, name: &str, initial: Value) -> ReducerContext {
        if let Some(existing) = self.inner.reducers.read().get(name) {
            return existing.clone();
        }
        self.inner
            .reducers
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| {
                ReducerContext::new(
                    name,
                    initial,
                    self.inner.config.merge,
                    self.inner.persisters.clone(),
                )
            })
            .clone()
    }

    pub fn get_reducer(&self, name: &str) -> Option<ReducerContext> {
        self.inner.reducers.read().get(name).cloned()
    }

    pub fn reducer_names(&self) -> Vec<String> {
        self.inner.reducers.read().keys().cloned().collect()
    }

    /// Whether any registered reducer handles `action_type` in `status`.
    pub fn has_reducer_action(&self, action_type: &ActionType, status: Status) -> bool {
        self.inner
            .reducers
            .read()
            .values()
            .any(|reducer| reducer.has_listener_status(action_type, status))
    }

    fn root_reducer(&self) -> Arc<dyn RootReducer> {
        let reducers: Vec<_> = self.inner.reducers.read().values().cloned().collect();
        combine_reducers(
            reducers
                .into_iter()
                .map(|reducer| (reducer.name().to_owned(), reducer.prepare()))
                .collect(),
        )
    }

    /// Builds the store, then replays queued subscriptions and dispatches.
    pub fn init(&self) -> Arc<dyn Store> {
        if let Some(store) = self.store() {
            log::warn!("init() called twice; keeping the existing store");
            return store;
        }

        let mut middleware: Vec<Arc<dyn Middleware>> = Vec::new();
        if self.inner.config.log_actions {
            middleware.push(Arc::new(ActionLogger));
        }
        middleware.push(Arc::new(self.inner.bus.tap()));
        let store: Arc<dyn Store> = Arc::new(BasicStore::new(self.root_reducer(), middleware));

        {
            let mut pending = self.inner.pending.lock();
            *self.inner.store.write() = Some(store.clone());
            pending.replaying = true;
        }
        let subscribers = std::mem::take(&mut *self.inner.pending_subscribers.lock());
        for subscriber in subscribers {
            // Queued subscribers stay attached for the store's lifetime.
            let _ = store.subscribe(subscriber);
        }
        self.replay(&store);
        store
    }

    fn replay(&self, store: &Arc<dyn Store>) {
        loop {
            let queued = {
                let mut pending = self.inner.pending.lock();
                if pending.items.is_empty() {
                    pending.replaying = false;
                    return;
                }
                std::mem::take(&mut pending.items)
            };
            log::debug!("store ready, replaying {} queued dispatches", queued.len());
            for dispatch in queued {
                self.route(store, dispatch);
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.store.read().is_some()
    }

    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.inner.store.read().clone()
    }

    fn ready_store(&self) -> Result<Arc<dyn Store>, Error> {
        self.store().ok_or(Error::NotReady)
    }

    /// Routes a plain or async action. Async actions return their completion,
    /// which resolves to the outcome the lifecycle dispatched.
    pub fn dispatch(&self, input: impl Into<Dispatch>) -> Option<Completion> {
        let dispatch = input.into();
        let completion = match &dispatch {
            Dispatch::Async(action) => Some(action.completion()),
            Dispatch::Action(_) => None,
        };
        let store = {
            let mut pending = self.inner.pending.lock();
            match self.store().filter(|_| !pending.replaying) {
                Some(store) => store,
                None => {
                    log::debug!("queueing {} until the store is ready", dispatch.action_type());
                    pending.items.push(dispatch);
                    return completion;
                }
            }
        };
        self.route(&store, dispatch);
        completion
    }

    fn route(&self, store: &Arc<dyn Store>, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Action(action) => {
                if let Err(err) = store.dispatch(action) {
                    log::error!("dispatch failed: {err}");
                }
            }
            Dispatch::Async(action) => self.dispatch_async(store, action),
        }
    }

    fn dispatch_async(&self, store: &Arc<dyn Store>, action: AsyncAction) {
        let settlement = Settlement::new(action.action_type.clone(), action.request());
        if self.has_reducer_action(&action.action_type, Status::Pending) {
            if let Err(err) = store.dispatch(settlement.pending()) {
                log::error!("pending dispatch failed: {err}");
            }
        }

        let completion = action.completion();
        let store = store.clone();
        let lifecycle = async move {
            let outcome = completion.await;
            if let Some(terminal) = settlement.settle(outcome) {
                log::debug!("{} settled ({})", terminal.action_type, terminal.status());
                if let Err(err) = store.dispatch(terminal) {
                    log::error!("terminal dispatch failed: {err}");
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(lifecycle);
            }
            Err(_) => {
                log::warn!(
                    "no tokio runtime; driving {} on a helper thread",
                    action.action_type
                );
                std::thread::spawn(move || futures::executor::block_on(lifecycle));
            }
        }
    }

    pub fn get_state(&self) -> Option<AppState> {
        match self.ready_store() {
            Ok(store) => Some(store.get_state()),
            Err(err) => {
                log::warn!("get_state(): {err}");
                None
            }
        }
    }

    /// Subscribes to state changes. Before `init` the listener is queued and
    /// no handle is returned.
    pub fn subscribe<F>(&self, listener: F) -> Option<Subscription>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener: Subscriber = Arc::new(listener);
        match self.store() {
            Some(store) => Some(store.subscribe(listener)),
            None => {
                self.inner.pending_subscribers.lock().push(listener);
                None
            }
        }
    }

    pub fn replace_reducer(&self, reducer: Arc<dyn RootReducer>) {
        match self.ready_store() {
            Ok(store) => store.replace_reducer(reducer),
            Err(err) => log::warn!("replace_reducer(): {err}"),
        }
    }

    /// Recombines every registered reducer, including ones added after `init`.
    pub fn reload_reducers(&self) {
        self.replace_reducer(self.root_reducer());
    }

    pub fn get_initial_state(&self) -> Value {
        Value::Object(
            self.inner
                .reducers
                .read()
                .iter()
                .map(|(name, reducer)| (name.clone(), Value::clone(&reducer.initial_state())))
                .collect::<Map<_, _>>(),
        )
    }

    pub fn actions(&self, name: &str) -> Option<Namespace> {
        self.inner.actions.namespace(name)
    }

    pub fn add_actions<I, K>(&self, name: &str, actions: I) -> bool
    where
        I: IntoIterator<Item = (K, ActionCreator)>,
        K: Into<String>,
    {
        self.inner.actions.add_actions(name, actions)
    }

    pub fn add_listener<F>(&self, action_type: impl Into<ActionType>, listener: F) -> ListenerHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.bus.add_listener(action_type, listener)
    }

    pub fn add_listeners<I>(&self, pairs: I, fallback: Option<Listener>) -> ListenerHandle
    where
        I: IntoIterator<Item = (ActionType, Option<Listener>)>,
    {
        self.inner.bus.add_listeners(pairs, fallback)
    }

    pub fn emit(&self, action_type: impl Into<ActionType>, payload: &Value) {
        self.inner.bus.emit(&action_type.into(), payload);
    }

    pub fn emit_action(&self, action: &Action) {
        self.inner.bus.emit_action(action);
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Registers a sink called with `(key, state)` for every persisted slice.
    pub fn persist<F>(&self, sink: F) -> &Self
    where
        F: Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.persisters.add(sink);
        self
    }

    pub fn form_data(&self, source: impl Into<FormSource>, options: FormOptions) -> Form {
        let env = FormEnv {
            sender: AnyActionSender::new(self.clone()),
            registry: self.inner.actions.clone(),
            debounce: self.inner.config.debounce(),
        };
        self.inner.forms.create(source.into(), options, env)
    }

    pub fn filter_data(&self, source: impl Into<FormSource>) -> Form {
        self.form_data(source, FormOptions::filter())
    }

    /// Overlays `sources` onto a copy of `target` with the configured strategy.
    pub fn merge<'a>(&self, target: &Value, sources: impl IntoIterator<Item = &'a Value>) -> Value {
        merge(self.inner.config.merge, target, sources)
    }
}

impl ActionSender for Engine {
    type SendableAction = Action;

    fn send(&self, action: Action) {
        self.dispatch(action);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reducer::Handler;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_reducer_is_idempotent() {
        let engine = Engine::new();
        let first = engine.reducer("users", json!({"list": []}));
        first.handle("users.add", json!({}));
        let second = engine.reducer("users", json!({"ignored": true}));
        assert!(second.has_listener_status(&"users.add".into(), Status::Success));
        assert_eq!(engine.get_initial_state(), json!({"users": {"list": []}}));
    }

    #[test]
    fn test_pre_ready_dispatches_replay_in_order() {
        let engine = Engine::new();
        let users = engine.reducer("users", json!({"log": []}));
        users.handle(
            "push",
            Handler::func(|state, payload, _| {
                let mut log = state["log"].as_array()?.clone();
                log.push(payload["n"].clone());
                Some(json!({ "log": log }))
            }),
        );

        for n in 0..3 {
            engine.dispatch(("push", json!({ "n": n })));
        }
        assert!(engine.get_state().is_none());

        engine.init();
        let state = engine.get_state().unwrap();
        assert_eq!(**state.slice("users").unwrap(), json!({"log": [0, 1, 2]}));
    }

    #[test]
    fn test_queued_subscribers_attach_on_init() {
        let engine = Engine::new();
        engine.reducer("users", json!({})).handle("touch", json!({"touched": true}));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        assert!(engine
            .subscribe(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .is_none());

        engine.init();
        engine.dispatch("touch");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_sees_reduced_state() {
        let engine = Engine::new();
        engine.reducer("counter", json!({"count": 0})).handle(
            "increment",
            Handler::func(|state, _, _| Some(json!({"count": state["count"].as_i64()? + 1}))),
        );
        engine.init();

        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        let reader = engine.clone();
        engine.add_listener("increment", move |payload| {
            let count = reader
                .get_state()
                .and_then(|state| state.slice("counter").map(|slice| slice["count"].clone()));
            sink.lock().push((payload.clone(), count));
        });
        engine.dispatch(("increment", json!({"by": 1})));
        assert_eq!(*observed.lock(), vec![(json!({"by": 1}), Some(json!(1)))]);
    }

    #[test]
    fn test_slices_added_after_init_join_on_reload() {
        let engine = Engine::new();
        engine.reducer("a", json!({"n": 1}));
        engine.init();
        engine.reducer("b", json!({"n": 2})).handle("b.set", json!({"n": 3}));
        assert!(engine.get_state().unwrap().slice("b").is_none());

        engine.reload_reducers();
        engine.dispatch("b.set");
        assert_eq!(
            engine.get_state().unwrap().to_value(),
            json!({"a": {"n": 1}, "b": {"n": 3}})
        );
    }

    #[test]
    fn test_async_without_runtime_uses_helper_thread() {
        let engine = Engine::new();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        engine.reducer("jobs", json!({})).handle(
            "jobs.run",
            Handler::func(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
        );
        engine.init();

        let completion = engine
            .dispatch(AsyncAction::new("jobs.run", async { Ok(json!({"ok": true})) }))
            .unwrap();
        assert_eq!(futures::executor::block_on(completion), Ok(json!({"ok": true})));
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_persisted_slice_is_written_on_init_and_change() {
        let engine = Engine::new();
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        engine.persist(move |key, state| {
            sink.lock().push((key.to_owned(), state.clone()));
            Ok(())
        });
        engine
            .reducer("prefs", json!({"dark": false}))
            .persist("prefs")
            .handle("prefs.dark", json!({"dark": true}));
        engine.init();
        engine.dispatch("prefs.dark");

        let written = written.lock();
        assert_eq!(written.first(), Some(&("prefs".to_owned(), json!({"dark": false}))));
        assert_eq!(written.last(), Some(&("prefs".to_owned(), json!({"dark": true}))));
    }

    #[test]
    fn test_reload_keeps_persisted_slice_current() {
        let engine = Engine::new();
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        engine.persist(move |key, state| {
            sink.lock().push((key.to_owned(), state.clone()));
            Ok(())
        });
        engine
            .reducer("prefs", json!({"dark": false}))
            .persist("prefs")
            .handle("prefs.dark", json!({"dark": true}));
        engine.init();
        engine.dispatch("prefs.dark");

        engine.reducer("other", json!({}));
        engine.reload_reducers();

        let live = engine.get_state().unwrap().slice("prefs").unwrap().clone();
        assert_eq!(*live, json!({"dark": true}));
        let last = written
            .lock()
            .iter()
            .rev()
            .find(|(key, _)| key == "prefs")
            .map(|(_, state)| state.clone());
        assert_eq!(last, Some(Value::clone(&live)));
    }

    #[test]
    fn test_dispatch_from_replayed_listener_waits_for_queue() {
        let engine = Engine::new();
        engine.reducer("log", json!({"seen": []})).handle(
            "push",
            Handler::func(|state, payload, _| {
                let mut seen = state["seen"].as_array()?.clone();
                seen.push(payload["n"].clone());
                Some(json!({ "seen": seen }))
            }),
        );
        let echo = engine.clone();
        engine.add_listener("push", move |payload| {
            if payload["n"] == json!(0) {
                echo.dispatch(("push", json!({"n": "echo"})));
            }
        });

        engine.dispatch(("push", json!({"n": 0})));
        engine.dispatch(("push", json!({"n": 1})));
        engine.init();

        assert_eq!(
            **engine.get_state().unwrap().slice("log").unwrap(),
            json!({"seen": [0, 1, "echo"]})
        );
        engine.dispatch(("push", json!({"n": 2})));
        assert_eq!(
            **engine.get_state().unwrap().slice("log").unwrap(),
            json!({"seen": [0, 1, "echo", 2]})
        );
    }
}
