
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Config error: {0}")]
    Config(String),
    /// The database cannot be opened, or a critical unit of work failed
    /// during startup. The system must refuse further traffic.
    #[error("Fatal storage error: {0}")]
    Fatal(String),
    /// A recoverable storage-operation failure. Logged, returned to the
    /// caller, never escalated to a process-level effect.
    #[error("Storage operation failed: {0}")]
    Operation(String),
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, TallyError>;

// Helper conversions
impl From<rusqlite::Error> for TallyError {
    fn from(e: rusqlite::Error) -> Self { Self::Operation(e.to_string()) }
}
