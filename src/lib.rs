mod action;
mod action_registry;
mod action_sender;
mod config;
mod effect;
mod engine;
mod error;
mod event_bus;
mod form;
mod merge;
mod reducer;
mod store;

pub use action::{Action, ActionType, FormActionId, FormActionKind, Status};
pub use action_registry::{ActionCreator, ActionRegistry, Namespace};
pub use action_sender::{ActionSender, AnyActionSender};
pub use config::EngineConfig;
pub use effect::{AsyncAction, Completion, Dispatch, Outcome};
pub use engine::Engine;
pub use error::Error;
pub use event_bus::{EventBus, EventTap, Listener, ListenerHandle};
pub use form::{
    canonical_json, ChangedOptions, Form, FormCallback, FormData, FormEnv, FormKind, FormListener,
    FormOptions, FormSource, FormStructures,
};
pub use merge::{deep_merge, merge, shallow_merge, MergeStrategy};
pub use reducer::{Handler, HandlerFn, Persister, Persisters, Reducer, ReducerContext, SliceState};
pub use store::{
    combine_reducers, ActionLogger, AppState, BasicStore, Middleware, Next, RootReducer, StateTree,
    Store, Subscriber, Subscription,
};
