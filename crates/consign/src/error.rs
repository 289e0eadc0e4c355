use consign_barcode::BarcodeError;
use consign_config::AccountError;
use consign_sequence::SequenceError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures of assembly and transmission.
///
/// Per-shipment validation problems are not errors; they are collected in
/// [`crate::assemble::BatchPlan::issues`].
#[derive(Debug, Error)]
pub enum Error {
    /// Account or relay setup is unusable. Raised before any reference is
    /// allocated and before a manifest is built.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A checksum or allocation input broke its contract.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    /// The manifest could not be rendered.
    #[error("failed to build manifest: {0}")]
    Manifest(String),

    /// The relay refused the manifest or timed out. Nothing was committed.
    #[error("transmission failed: {0}")]
    Transmission(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether running the same operation again may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transmission(_))
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        Error::Storage(format!("{err:#}"))
    }
}

impl From<BarcodeError> for Error {
    fn from(err: BarcodeError) -> Self {
        match err {
            BarcodeError::EmptyRange { .. } => Error::Configuration(err.to_string()),
            BarcodeError::InvalidInput(msg) => Error::InvalidInput(msg),
        }
    }
}

impl From<AccountError> for Error {
    fn from(err: AccountError) -> Self {
        Error::Configuration(err.to_string())
    }
}
