use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("elasticsearch client error: {0}")]
    Client(#[from] elasticsearch::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("elasticsearch returned {status}: {reason}")]
    Elastic { status: u16, reason: String },

    #[error("scan error on index {index}: {details}")]
    Scan { index: String, details: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the cluster answered 404 (no such index, expired scroll).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Elastic { status: 404, .. })
    }
}
