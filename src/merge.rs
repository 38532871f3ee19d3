use serde::Deserialize;
use serde_json::Value;

/// How handler results are folded into slice state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Nested objects recurse, arrays and scalars are replaced wholesale.
    #[default]
    Deep,
    /// Top-level keys of the source overwrite the target.
    Shallow,
}

impl MergeStrategy {
    pub fn apply(self, target: &mut Value, source: &Value) {
        match self {
            Self::Deep => deep_merge(target, source),
            Self::Shallow => shallow_merge(target, source),
        }
    }
}

/// Overlays every source onto a copy of `target`.
pub fn merge<'a>(
    strategy: MergeStrategy,
    target: &Value,
    sources: impl IntoIterator<Item = &'a Value>,
) -> Value {
    let mut out = target.clone();
    for source in sources {
        strategy.apply(&mut out, source);
    }
    out
}

pub fn deep_merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                let nested = value.is_object() && target.get(key).is_some_and(Value::is_object);
                match target.get_mut(key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}

pub fn shallow_merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        (target, source) => *target = source.clone(),
    }
}
