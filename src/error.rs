use thiserror::Error;

/// Error taxonomy of the decision engine.
///
/// The engine never substitutes a verdict: on `Store` the caller receives
/// the failure and chooses fail-open or fail-closed itself.
#[derive(Error, Debug)]
pub enum LimitError {
    /// Unknown strategy, missing script file, non-positive quota or window.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The shared store failed or the reply was malformed.
    #[error("store error: {0}")]
    Store(String),

    /// Shutdown raced a pending decision. The script has either executed or
    /// not; the call is never retried.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, LimitError>;

impl From<rustis::Error> for LimitError {
    fn from(err: rustis::Error) -> Self {
        LimitError::Store(err.to_string())
    }
}

impl From<rustis::bb8::RunError<rustis::Error>> for LimitError {
    fn from(err: rustis::bb8::RunError<rustis::Error>) -> Self {
        LimitError::Store(err.to_string())
    }
}
