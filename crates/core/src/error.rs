use thiserror::Error as ThisError;

/// Every failure the watch fabric distinguishes. Policy is attached by the caller;
/// the variant only says which bucket a failure belongs in.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("transient api error: {0}")]
    TransientApi(String),
    #[error("permanent api error ({code}): {message}")]
    PermanentApi { code: u16, message: String },
    #[error("invalid selector: {0}")]
    SelectorInvalid(String),
    #[error("storage (transient): {0}")]
    StorageTransient(String),
    #[error("storage (permanent): {0}")]
    StoragePermanent(String),
    #[error("registry conflict: {0}")]
    RegistryConflict(String),
    #[error("context cancelled")]
    ContextCancelled,
    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an HTTP status returned by the apiserver.
    /// 429 and 5xx are retried; any other 4xx (forbidden included) is permanent.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&code) && code != 429 && code != 410 {
            Error::PermanentApi { code, message }
        } else {
            Error::TransientApi(format!("{code}: {message}"))
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientApi(_) | Error::StorageTransient(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::ContextCancelled)
    }
}
