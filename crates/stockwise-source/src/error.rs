use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no connection string variant reached the {endpoint} source endpoint ({attempts} tried): {message}")]
    Connect {
        endpoint: String,
        attempts: usize,
        message: String,
    },
    #[error("source query failed: {message}")]
    Query { message: String, retryable: bool },
    #[error("could not decode source column {column}: {message}")]
    Decode { column: String, message: String },
    #[error("source query gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<SourceError>,
    },
    #[error("{0}")]
    Unsupported(String),
}

impl SourceError {
    /// Failure raised while executing or fetching; worth retrying on a fresh connection.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure the source will keep raising no matter how often it is retried.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Connect { .. } => true,
            SourceError::Query { retryable, .. } => *retryable,
            SourceError::Decode { .. }
            | SourceError::RetriesExhausted { .. }
            | SourceError::Unsupported(_) => false,
        }
    }

    /// The source cannot be reached at all, so continuing key by key is pointless.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            SourceError::Connect { .. } | SourceError::Unsupported(_) => true,
            SourceError::RetriesExhausted { last, .. } => last.is_connection_loss(),
            SourceError::Query { .. } | SourceError::Decode { .. } => false,
        }
    }
}
