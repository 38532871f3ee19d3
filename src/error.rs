use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A reducer tried to dispatch while the store was reducing.
    #[error("reducers may not dispatch actions (got {0})")]
    ReentrantDispatch(String),

    #[error("store is not initialized yet")]
    NotReady,

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    #[error("persist failed: {0:#}")]
    Persist(#[from] anyhow::Error),
}
