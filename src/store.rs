use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::{Map, Value};

use crate::action::Action;
use crate::error::Error;
use crate::reducer::{Reducer, SliceState};

pub(crate) const INIT: &str = "@@slices/INIT";
pub(crate) const REPLACE: &str = "@@slices/REPLACE";

/// Root state: every slice by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateTree {
    slices: BTreeMap<String, SliceState>,
}

impl StateTree {
    pub fn slice(&self, name: &str) -> Option<&SliceState> {
        self.slices.get(name)
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SliceState)> {
        self.slices.iter().map(|(name, state)| (name.as_str(), state))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.slices
                .iter()
                .map(|(name, state)| (name.clone(), Value::clone(state)))
                .collect::<Map<_, _>>(),
        )
    }
}

impl FromIterator<(String, SliceState)> for StateTree {
    fn from_iter<T: IntoIterator<Item = (String, SliceState)>>(iter: T) -> Self {
        Self {
            slices: iter.into_iter().collect(),
        }
    }
}

pub type AppState = Arc<StateTree>;

pub trait RootReducer: Send + Sync {
    fn reduce(&self, state: &AppState, action: &Action) -> AppState;
}

impl<F> RootReducer for F
where
    F: Fn(&AppState, &Action) -> AppState + Send + Sync,
{
    fn reduce(&self, state: &AppState, action: &Action) -> AppState {
        self(state, action)
    }
}

/// Runs every slice reducer on its own slice.
///
/// Returns the input tree itself when no slice reducer produced a new reference.
pub fn combine_reducers(reducers: Vec<(String, Arc<dyn Reducer>)>) -> Arc<dyn RootReducer> {
    Arc::new(move |state: &AppState, action: &Action| -> AppState {
        let mut changed = state.len() != reducers.len();
        let mut slices = BTreeMap::new();
        for (name, reducer) in &reducers {
            let previous = state.slice(name);
            let next = reducer.reduce(previous, action);
            changed |= previous.map_or(true, |previous| !Arc::ptr_eq(previous, &next));
            slices.insert(name.clone(), next);
        }
        if changed {
            Arc::new(StateTree { slices })
        } else {
            state.clone()
        }
    })
}

pub type Next<'a> = &'a dyn Fn(Action) -> Result<(), Error>;

pub trait Middleware: Send + Sync {
    fn handle(&self, action: Action, next: Next<'_>) -> Result<(), Error>;
}

/// Debug-logs every action on its way to the reducers.
pub struct ActionLogger;

impl Middleware for ActionLogger {
    fn handle(&self, action: Action, next: Next<'_>) -> Result<(), Error> {
        log::debug!("dispatch {} ({})", action.action_type, action.status());
        next(action)
    }
}

pub type Subscriber = Arc<dyn Fn() + Send + Sync>;

pub struct Subscription {
    cancel: Box<dyn FnOnce() + Send + Sync>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn unsubscribe(self) {
        (self.cancel)()
    }
}

/// The store collaborator every engine runs against.
pub trait Store: Send + Sync {
    fn dispatch(&self, action: Action) -> Result<(), Error>;

    fn get_state(&self) -> AppState;

    fn subscribe(&self, listener: Subscriber) -> Subscription;

    fn replace_reducer(&self, reducer: Arc<dyn RootReducer>);
}

type Subscribers = Arc<Mutex<Vec<(u64, Subscriber)>>>;

/// Minimal synchronous store: one root reducer behind a middleware chain.
pub struct BasicStore {
    reducer: RwLock<Arc<dyn RootReducer>>,
    state: RwLock<AppState>,
    middleware: Vec<Arc<dyn Middleware>>,
    subscribers: Subscribers,
    next_subscriber: AtomicU64,
    reducing: ReentrantMutex<Cell<bool>>,
}

struct ReducingFlag<'a>(&'a Cell<bool>);

impl Drop for ReducingFlag<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl BasicStore {
    pub fn new(reducer: Arc<dyn RootReducer>, middleware: Vec<Arc<dyn Middleware>>) -> Self {
        let state = reducer.reduce(&AppState::default(), &Action::new(INIT));
        Self {
            reducer: RwLock::new(reducer),
            state: RwLock::new(state),
            middleware,
            subscribers: Subscribers::default(),
            next_subscriber: AtomicU64::new(0),
            reducing: ReentrantMutex::new(Cell::new(false)),
        }
    }

    fn run(&self, index: usize, action: Action) -> Result<(), Error> {
        match self.middleware.get(index) {
            Some(middleware) => middleware.handle(action, &|action| self.run(index + 1, action)),
            None => self.reduce(action),
        }
    }

    fn reduce(&self, action: Action) -> Result<(), Error> {
        {
            let reducing = self.reducing.lock();
            if reducing.replace(true) {
                return Err(Error::ReentrantDispatch(action.action_type.to_string()));
            }
            let _flag = ReducingFlag(&reducing);
            let reducer = self.reducer.read().clone();
            let previous = self.state.read().clone();
            let next = reducer.reduce(&previous, &action);
            *self.state.write() = next;
        }

        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();
        for subscriber in subscribers {
            subscriber();
        }
        Ok(())
    }
}

impl Store for BasicStore {
    fn dispatch(&self, action: Action) -> Result<(), Error> {
        self.run(0, action)
    }

    fn get_state(&self) -> AppState {
        self.state.read().clone()
    }

    fn subscribe(&self, listener: Subscriber) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, listener));
        let subscribers = Arc::downgrade(&self.subscribers);
        Subscription::new(move || {
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.lock().retain(|(other, _)| *other != id);
            }
        })
    }

    fn replace_reducer(&self, reducer: Arc<dyn RootReducer>) {
        *self.reducer.write() = reducer;
        if let Err(err) = self.reduce(Action::new(REPLACE)) {
            log::error!("replace_reducer: {err}");
        }
    }
}
