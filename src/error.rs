use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid network configuration: {0}")]
    ConfigInvalid(String),

    #[error("Watch cancelled")]
    Cancelled,

    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Watch cursor {cursor} has fallen behind the store's history window")]
    CursorExpired { cursor: u64 },

    #[error("Conditional patch of node {name:?} conflicted: expected version {expected}, store has {actual}")]
    PatchConflict {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Node {name:?} not found in registry")]
    NodeNotFound { name: String },

    #[error("Node {name:?} has no subnet assigned by the orchestrator")]
    CidrUnassigned { name: String },

    #[error("Unknown backend type {0:?}")]
    UnknownBackend(String),

    #[error("Route operation failed: {0}")]
    RouteOp(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Transient store errors are retried by the watch loop with a fixed
    /// backoff; everything else either terminates the watch (`Cancelled`)
    /// or is handled at the call site.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
