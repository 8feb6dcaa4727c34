#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Mailbox authentication failed: {0}")]
    Auth(String),

    #[error("Mailbox network error: {0}")]
    Net(String),

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Run exceeded time budget after {0}")]
    Timeout(String),
}

impl MeterError {
    /// Transient failures are worth a bounded retry within the same run;
    /// everything else aborts the run immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, MeterError::Net(_))
    }
}

impl From<r2d2::Error> for MeterError {
    fn from(e: r2d2::Error) -> Self {
        MeterError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for MeterError {
    fn from(e: rusqlite::Error) -> Self {
        MeterError::Database(e.to_string())
    }
}
