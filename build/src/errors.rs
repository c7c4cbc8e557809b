use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] bramble_store::Error),

    #[error("dependency cycle between {}", .0.join(", "))]
    GraphCycle(Vec<String>),

    #[error("derivation {hash} not found{}", .referenced_by.as_ref().map(|n| format!(", needed by {n}")).unwrap_or_default())]
    DerivationNotFound {
        hash: String,
        referenced_by: Option<String>,
    },

    #[error("derivation {name} ({hash}) has no output {output:?}")]
    UnknownOutput {
        hash: String,
        name: String,
        output: String,
    },

    #[error("can't replace {vertex}: {reason}")]
    InvalidExpansion { vertex: String, reason: String },

    #[error("walk was cancelled")]
    Cancelled,

    #[error("{} errors: {}", .0.len(), .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for cancellations, whether they were noticed by the walker or by
    /// a build.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Cancelled | Error::Store(bramble_store::Error::Cancelled)
        )
    }
}
