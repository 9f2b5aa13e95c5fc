use serde_json::Value;

/// Error type shared by every gateway service.
///
/// The worker policy is annotate-and-continue: most callers log these and
/// keep going. Only configuration errors and unclassified faults are allowed
/// to cross the process boundary (see the worker's operational shell).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("queue broker error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{message}")]
    Known { message: String, details: Option<Value> },

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Known {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: Value) -> Self {
        Self::Known {
            message: message.into(),
            details: Some(details),
        }
    }

    /// True for `diesel::NotFound` lookups, which callers usually translate
    /// into a terminal per-row failure rather than a retry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Database(diesel::result::Error::NotFound))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
