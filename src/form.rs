use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde_json::{Map, Value};
use tokio::task::AbortHandle;

use crate::action::{Action, ActionType, FormActionId, FormActionKind};
use crate::action_registry::{ActionCreator, ActionRegistry, Namespace};
use crate::action_sender::{ActionSender, AnyActionSender};
use crate::reducer::{Handler, ReducerContext};

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FormKind {
    #[default]
    Form,
    Filter,
    Custom(String),
}

impl FormKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Form => "form",
            Self::Filter => "filter",
            Self::Custom(name) => name,
        }
    }

    fn capitalized(&self) -> String {
        let mut chars = self.as_str().chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

/// Where a form's starting data comes from.
#[derive(Clone, Debug)]
pub enum FormSource {
    Data(Value),
    /// A structure declared (now or later) under this name.
    Structure(String),
}

impl From<Value> for FormSource {
    fn from(value: Value) -> Self {
        Self::Data(value)
    }
}

impl From<&str> for FormSource {
    fn from(value: &str) -> Self {
        Self::Structure(value.to_owned())
    }
}

#[derive(Clone, Debug, Default)]
pub struct FormOptions {
    /// Declares the form's data as a named structure other forms can reuse.
    pub structure: Option<String>,
    pub kind: FormKind,
}

impl FormOptions {
    pub fn structure(name: impl Into<String>) -> Self {
        Self {
            structure: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn filter() -> Self {
        Self {
            kind: FormKind::Filter,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChangedOptions {
    pub ignore: Vec<String>,
}

impl ChangedOptions {
    pub fn ignore<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            ignore: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Key-order independent serialization used for dirty checks.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

const EMPTY: &str = "{}";

fn parse_object(raw: &str) -> Map<String, Value> {
    serde_json::from_str(raw).unwrap_or_default()
}

pub type FormCallback = Arc<dyn Fn(&Map<String, Value>) + Send + Sync>;

pub type FormData<'a> =
    lock_api::MappedRwLockReadGuard<'a, parking_lot::RawRwLock, Map<String, Value>>;

/// What a form needs from the engine that creates it.
#[derive(Clone)]
pub struct FormEnv {
    pub sender: AnyActionSender<Action>,
    pub registry: Arc<ActionRegistry>,
    pub debounce: Duration,
}

struct Snapshot {
    initial: String,
    current: String,
    base: String,
    data: Map<String, Value>,
}

#[derive(Clone)]
struct Attachment {
    namespace: Namespace,
    update: ActionType,
    reset: ActionType,
    update_creator: String,
    reset_creator: String,
}

struct FormInner {
    id: u64,
    kind: FormKind,
    env: FormEnv,
    snapshot: RwLock<Snapshot>,
    attachment: RwLock<Option<Attachment>>,
    listeners: Mutex<Vec<(u64, FormCallback)>>,
    next_listener: AtomicU64,
    timer: Mutex<Option<AbortHandle>>,
}

/// Dirty-tracking key-value binding mirrored into a reducer slice.
#[derive(Clone)]
pub struct Form {
    inner: Arc<FormInner>,
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.inner.snapshot.read();
        f.debug_struct("Form")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("initial", &snapshot.initial)
            .field("current", &snapshot.current)
            .finish()
    }
}

impl Form {
    fn new(id: u64, kind: FormKind, env: FormEnv, base: &Value) -> Self {
        let form = Self {
            inner: Arc::new(FormInner {
                id,
                kind,
                env,
                snapshot: RwLock::new(Snapshot {
                    initial: EMPTY.to_owned(),
                    current: EMPTY.to_owned(),
                    base: canonical_json(base),
                    data: Map::new(),
                }),
                attachment: RwLock::new(None),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                timer: Mutex::new(None),
            }),
        };
        form.reset(Some(base.clone()), true);
        form
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> &FormKind {
        &self.inner.kind
    }

    /// Read guard over the current data. Release it before `change` or `reset`.
    pub fn data(&self) -> FormData<'_> {
        RwLockReadGuard::map(self.inner.snapshot.read(), |snapshot| &snapshot.data)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data().clone())
    }

    pub fn initial_state(&self) -> Value {
        Value::Object(parse_object(&self.inner.snapshot.read().initial))
    }

    pub fn initial_field(&self, key: &str) -> Option<Value> {
        parse_object(&self.inner.snapshot.read().initial).remove(key)
    }

    pub fn field(&self, key: &str) -> Option<Value> {
        if key.is_empty() {
            return None;
        }
        self.data().get(key).filter(|value| !value.is_null()).cloned()
    }

    /// Sets one field without dispatching or notifying.
    pub fn set_field(&self, key: &str, value: impl Into<Value>) {
        if key.is_empty() {
            log::warn!("form {}: field() requires a key", self.inner.id);
            return;
        }
        self.set_fields([(key, value.into())]);
    }

    pub fn set_fields<I, K>(&self, fields: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut snapshot = self.inner.snapshot.write();
        for (key, value) in fields {
            snapshot.data.insert(key.into(), value);
        }
        snapshot.current = canonical_json(&Value::Object(snapshot.data.clone()));
    }

    /// Restores one field to its initial value. Fields absent from the initial
    /// data are left alone.
    pub fn reset_field(&self, key: &str) {
        if let Some(value) = self.initial_field(key) {
            self.set_field(key, value);
        }
    }

    /// Dispatches an update through the attached reducer and schedules a
    /// listener notification. Returns `false` when the form is not attached.
    pub fn change(&self, key: &str, value: impl Into<Value>) -> bool {
        let mut payload = Map::new();
        payload.insert(key.to_owned(), value.into());
        self.change_fields(payload)
    }

    pub fn change_fields(&self, fields: Map<String, Value>) -> bool {
        let Some(attachment) = self.inner.attachment.read().clone() else {
            log::warn!("form {}: change() called before attach()", self.inner.id);
            return false;
        };
        self.send(&attachment.namespace, &attachment.update_creator, Value::Object(fields));
        self.schedule_notify();
        true
    }

    /// Makes `data` (or the current initial data) the new pristine state.
    ///
    /// Unless `ignore_dispatch` is set, an attached form also dispatches its
    /// reset action and schedules a notification.
    pub fn reset(&self, data: Option<Value>, ignore_dispatch: bool) {
        {
            let mut snapshot = self.inner.snapshot.write();
            let data = match data {
                Some(Value::Object(map)) => map,
                Some(_) => Map::new(),
                None => parse_object(&snapshot.initial),
            };
            let canonical = canonical_json(&Value::Object(data.clone()));
            snapshot.initial = canonical.clone();
            snapshot.current = canonical;
            snapshot.data = data;
        }
        if ignore_dispatch {
            return;
        }
        let attachment = self.inner.attachment.read().clone();
        if let Some(attachment) = attachment {
            self.send(&attachment.namespace, &attachment.reset_creator, Value::Null);
            self.schedule_notify();
        }
    }

    /// Resets to the data the form was created with, ignoring later resets.
    pub fn base_reset(&self, ignore_dispatch: bool) {
        let base = parse_object(&self.inner.snapshot.read().base);
        self.reset(Some(Value::Object(base)), ignore_dispatch);
    }

    /// Without options: canonical `initial != current`. With options: compares
    /// the current fields one by one, skipping ignored keys.
    pub fn changed(&self, options: Option<&ChangedOptions>) -> bool {
        let snapshot = self.inner.snapshot.read();
        let Some(options) = options else {
            return snapshot.initial != snapshot.current;
        };
        let parsed = serde_json::from_str::<Map<String, Value>>(&snapshot.initial).and_then(
            |initial| {
                serde_json::from_str::<Map<String, Value>>(&snapshot.current)
                    .map(|current| (initial, current))
            },
        );
        let Ok((initial, current)) = parsed else {
            return false;
        };
        current
            .iter()
            .filter(|(key, _)| !options.ignore.iter().any(|ignored| ignored == *key))
            .any(|(key, value)| initial.get(key) != Some(value))
    }

    /// The update and reset action types, once attached.
    pub fn types(&self) -> Option<(ActionType, ActionType)> {
        self.inner
            .attachment
            .read()
            .as_ref()
            .map(|attachment| (attachment.update.clone(), attachment.reset.clone()))
    }

    /// Binds this form's update/reset actions onto `reducer` and exposes their
    /// creators in the reducer's action namespace.
    pub fn attach(&self, reducer: &ReducerContext, key: Option<&str>) -> bool {
        let Some(namespace) = self.inner.env.registry.namespace(reducer.name()) else {
            return false;
        };
        let kind = &self.inner.kind;
        let id = self.inner.id;
        let key = key.unwrap_or(kind.as_str()).to_owned();
        let action_id = |action_kind: FormActionKind| FormActionId {
            reducer: reducer.name().to_owned(),
            key: key.clone(),
            kind: action_kind,
            form_id: id,
        };
        let update = ActionType::Form(action_id(FormActionKind::Update));
        let reset = ActionType::Form(action_id(FormActionKind::Reset));

        let suffix = format!("{}_{id}", kind.as_str().to_uppercase());
        namespace.set_type(format!("UPDATE_{suffix}"), update.clone());
        namespace.set_type(format!("RESET_{suffix}"), reset.clone());

        let weak = Arc::downgrade(&self.inner);
        reducer.handle(
            update.clone(),
            Handler::func(move |_, payload, _| {
                if let (Some(inner), Some(fields)) = (weak.upgrade(), payload.as_object()) {
                    Form { inner }.set_fields(fields.clone());
                }
                None
            }),
        );
        let weak = Arc::downgrade(&self.inner);
        reducer.handle(
            reset.clone(),
            Handler::func(move |_, _, _| {
                if let Some(inner) = weak.upgrade() {
                    Form { inner }.reset(None, true);
                }
                None
            }),
        );

        let update_creator = format!("update{}{id}", kind.capitalized());
        let reset_creator = format!("reset{}{id}", kind.capitalized());
        let update_type = update.clone();
        namespace.insert(
            update_creator.clone(),
            ActionCreator::creator(move |payload| {
                Action::new(update_type.clone()).with_payload(payload)
            }),
        );
        let reset_type = reset.clone();
        namespace.insert(
            reset_creator.clone(),
            ActionCreator::creator(move |payload| {
                let action = Action::new(reset_type.clone());
                if payload.is_null() {
                    action
                } else {
                    action.with_payload(payload)
                }
            }),
        );

        *self.inner.attachment.write() = Some(Attachment {
            namespace,
            update,
            reset,
            update_creator,
            reset_creator,
        });
        true
    }

    /// Registers a change callback. Registering the same callback twice returns
    /// a handle to the first registration.
    pub fn listen(&self, callback: FormCallback) -> FormListener {
        let mut listeners = self.inner.listeners.lock();
        let existing = listeners
            .iter()
            .find(|(_, other)| {
                Arc::as_ptr(other).cast::<()>() == Arc::as_ptr(&callback).cast::<()>()
            })
            .map(|(id, _)| *id);
        let id = existing.unwrap_or_else(|| {
            let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
            listeners.push((id, callback));
            id
        });
        FormListener {
            id,
            form: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    fn send(&self, namespace: &Namespace, creator: &str, payload: Value) {
        match namespace.create(creator, payload) {
            Some(action) => self.inner.env.sender.send(action),
            None => log::warn!("form {}: missing action {creator}", self.inner.id),
        }
    }

    /// Restarts the quiet-period timer; listeners fire once it elapses.
    fn schedule_notify(&self) {
        let mut timer = self.inner.timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            drop(timer);
            self.notify();
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let debounce = self.inner.env.debounce;
        let task = runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = weak.upgrade() {
                Form { inner }.notify();
            }
        });
        *timer = Some(task.abort_handle());
    }

    fn notify(&self) {
        let data = self.data().clone();
        let listeners: Vec<FormCallback> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for listener in listeners {
            listener(&data);
        }
    }
}

pub struct FormListener {
    id: u64,
    form: Weak<FormInner>,
}

impl FormListener {
    pub fn remove(&self) {
        if let Some(form) = self.form.upgrade() {
            form.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[derive(Default)]
struct StructureTable {
    shapes: HashMap<String, String>,
    pending: HashMap<String, Vec<Weak<FormInner>>>,
}

/// Named form shapes and the forms still waiting for theirs.
#[derive(Default)]
pub struct FormStructures {
    next_id: AtomicU64,
    table: Mutex<StructureTable>,
}

impl FormStructures {
    pub fn create(&self, source: FormSource, options: FormOptions, env: FormEnv) -> Form {
        if let Some(name) = &options.structure {
            match &source {
                FormSource::Data(shape) => self.declare(name, shape),
                FormSource::Structure(_) => {
                    log::warn!("form structure {name} cannot be declared from another structure")
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = match source {
            FormSource::Data(data) => return Form::new(id, options.kind, env, &data),
            FormSource::Structure(name) => name,
        };
        // Lookup and registration share one guard so a concurrent declare
        // cannot slip in between.
        let mut table = self.table.lock();
        let shape = table.shapes.get(&name).map(|shape| parse_object(shape));
        let waiting = shape.is_none();
        let form = Form::new(id, options.kind, env, &Value::Object(shape.unwrap_or_default()));
        if waiting {
            log::debug!("form {id} waits for structure {name}");
            table
                .pending
                .entry(name)
                .or_default()
                .push(Arc::downgrade(&form.inner));
        }
        form
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.table.lock().shapes.contains_key(name)
    }

    fn declare(&self, name: &str, shape: &Value) {
        let waiting = {
            let mut table = self.table.lock();
            table.shapes.insert(name.to_owned(), canonical_json(shape));
            table.pending.remove(name).unwrap_or_default()
        };
        for inner in waiting.iter().filter_map(Weak::upgrade) {
            Form { inner }.reset(Some(shape.clone()), true);
        }
    }
}
