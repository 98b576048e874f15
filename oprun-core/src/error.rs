use thiserror::Error;

/// Failures resolving op/package references.
#[derive(Clone, Debug, Error)]
pub enum DataError {
    #[error("Data pull failed due to invalid/lack of authentication")]
    Authentication,

    #[error("Data pull failed due to insufficient/lack of authorization")]
    Authorization,

    #[error("{0}")]
    RefResolution(String),

    #[error("unable to read op \"{reference}\": {message}")]
    Read { reference: String, message: String },

    #[error("op \"{reference}\" has an invalid op file: {message}")]
    InvalidOpFile { reference: String, message: String },
}

impl DataError {
    /// Authentication/authorization failures can be retried with credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, DataError::Authentication | DataError::Authorization)
    }
}

/// Errors a call can end with. Cancellation is never one of these; it is
/// carried by the cancellation token and reported as outcome `Killed`.
#[derive(Clone, Debug, Error)]
pub enum CallError {
    /// The call spec has no variant, or more than one.
    #[error("invalid call graph: {0}")]
    InvalidCallGraph(String),

    /// A field could not be resolved against the scope.
    #[error("unable to interpret {field}: {message}")]
    Interpretation { field: String, message: String },

    /// Bound inputs failed validation against the op's declared params.
    #[error("validation error(s):{0}")]
    Validation(String),

    #[error(transparent)]
    Data(#[from] DataError),

    /// Container runtime failure, message passed through verbatim.
    #[error("{0}")]
    Runtime(String),

    #[error("nonzero container exit code. Exit code was: {0}")]
    NonZeroExit(i64),

    #[error("call panicked: {0}")]
    Panicked(String),
}

impl CallError {
    pub(crate) fn interpretation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CallError::Interpretation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failures loading [`crate::config::NodeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
