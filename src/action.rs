use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Phase of an action. Plain actions carry no status and are treated as `Success`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    #[default]
    Success,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FormActionKind {
    Update,
    Reset,
}

/// Identifier of the update/reset actions a form binds onto a reducer.
///
/// Compared and hashed field by field; the dotted string only exists on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormActionId {
    pub reducer: String,
    pub key: String,
    pub kind: FormActionKind,
    pub form_id: u64,
}

impl fmt::Display for FormActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FormActionKind::Update => write!(f, "{}.{}{}", self.reducer, self.key, self.form_id),
            FormActionKind::Reset => {
                write!(f, "{}.{}.reset{}", self.reducer, self.key, self.form_id)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionType {
    Named(String),
    Form(FormActionId),
}

impl ActionType {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// An empty name is the closest thing to an undefined type and is rejected
    /// wherever a type is registered.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Named(name) => !name.is_empty(),
            Self::Form(_) => true,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Form(id) => id.fmt(f),
        }
    }
}

impl From<&str> for ActionType {
    fn from(value: &str) -> Self {
        Self::Named(value.to_owned())
    }
}

impl From<String> for ActionType {
    fn from(value: String) -> Self {
        Self::Named(value)
    }
}

impl From<&ActionType> for ActionType {
    fn from(value: &ActionType) -> Self {
        value.clone()
    }
}

impl From<FormActionId> for ActionType {
    fn from(value: FormActionId) -> Self {
        Self::Form(value)
    }
}

impl Serialize for ActionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ActionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::Named)
    }
}

/// A dispatched action.
///
/// Serializes to `{type, payload?, status?, request?}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
}

impl Action {
    pub fn new(action_type: impl Into<ActionType>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: None,
            status: None,
            request: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_request(mut self, request: Option<Value>) -> Self {
        self.request = request;
        self
    }

    pub fn status(&self) -> Status {
        self.status.unwrap_or_default()
    }

    /// Payload as emitted to listeners: missing payloads become `{}`.
    pub fn payload_or_empty(&self) -> Value {
        self.payload
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// Payload handed to reducer handlers.
    ///
    /// Object and array payloads pass through and `null` becomes `{}`; anything
    /// else falls back to the whole action record.
    pub(crate) fn handler_payload(&self) -> Value {
        match &self.payload {
            Some(payload @ (Value::Object(_) | Value::Array(_))) => payload.clone(),
            Some(Value::Null) => Value::Object(Map::new()),
            _ => serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new())),
        }
    }
}
