use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::action::{Action, ActionType, Status};

/// Settled value of an async action: `Ok` becomes `success`, `Err` becomes `error`.
pub type Outcome = Result<Value, Value>;

/// The caller's view of an async action. Resolves to the same outcome the
/// lifecycle dispatched.
pub type Completion = Shared<BoxFuture<'static, Outcome>>;

pub struct AsyncAction {
    pub action_type: ActionType,
    pub payload: Option<Value>,
    completion: Completion,
}

impl AsyncAction {
    pub fn new<Fut>(action_type: impl Into<ActionType>, future: Fut) -> Self
    where
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        Self {
            action_type: action_type.into(),
            payload: None,
            completion: future.boxed().shared(),
        }
    }

    /// Wraps any fallible future: the value is serialized, the error is rendered.
    pub fn from_fallible<Fut, T, E>(action_type: impl Into<ActionType>, future: Fut) -> Self
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + 'static,
        E: Display + 'static,
    {
        Self::new(
            action_type,
            future.map(|result| match result {
                Ok(value) => {
                    serde_json::to_value(value).map_err(|err| Value::String(err.to_string()))
                }
                Err(err) => Err(Value::String(err.to_string())),
            }),
        )
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Object payloads are copied as the `request` carried by every phase.
    pub(crate) fn request(&self) -> Option<Value> {
        self.payload.clone().filter(Value::is_object)
    }
}

impl Debug for AsyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncAction")
            .field("action_type", &self.action_type)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Input of the dispatch router.
pub enum Dispatch {
    Action(Action),
    Async(AsyncAction),
}

impl Dispatch {
    pub fn action_type(&self) -> &ActionType {
        match self {
            Self::Action(action) => &action.action_type,
            Self::Async(action) => &action.action_type,
        }
    }
}

impl Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action(action) => write!(f, "Action {action:?}"),
            Self::Async(action) => write!(f, "Async {action:?}"),
        }
    }
}

impl From<Action> for Dispatch {
    fn from(value: Action) -> Self {
        Self::Action(value)
    }
}

impl From<AsyncAction> for Dispatch {
    fn from(value: AsyncAction) -> Self {
        Self::Async(value)
    }
}

impl From<&str> for Dispatch {
    fn from(value: &str) -> Self {
        Self::from((value, Value::Null))
    }
}

/// `(type, payload)` call shape. Payloads that are not objects or arrays become `{}`.
impl<T: Into<ActionType>> From<(T, Value)> for Dispatch {
    fn from((action_type, payload): (T, Value)) -> Self {
        let payload = match payload {
            payload @ (Value::Object(_) | Value::Array(_)) => payload,
            _ => Value::Object(Map::new()),
        };
        Self::Action(Action::new(action_type).with_payload(payload))
    }
}

/// One-shot guard over the terminal phase of an async action.
pub(crate) struct Settlement {
    done: AtomicBool,
    action_type: ActionType,
    request: Option<Value>,
}

impl Settlement {
    pub(crate) fn new(action_type: ActionType, request: Option<Value>) -> Self {
        Self {
            done: AtomicBool::new(false),
            action_type,
            request,
        }
    }

    pub(crate) fn pending(&self) -> Action {
        Action::new(self.action_type.clone())
            .with_status(Status::Pending)
            .with_request(self.request.clone())
    }

    /// The terminal action, or `None` once a previous outcome was taken.
    pub(crate) fn settle(&self, outcome: Outcome) -> Option<Action> {
        if self.done.swap(true, Ordering::AcqRel) {
            return None;
        }
        let (status, payload) = match outcome {
            Ok(value) => (Status::Success, value),
            Err(err) => (Status::Error, err),
        };
        Some(
            Action::new(self.action_type.clone())
                .with_status(status)
                .with_payload(payload)
                .with_request(self.request.clone()),
        )
    }
}
