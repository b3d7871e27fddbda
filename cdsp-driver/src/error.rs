//! Error types for CDSP driver operations.

use thiserror::Error;

use crate::transport::TransportError;

/// Result type alias for CDSP operations.
pub type Result<T> = core::result::Result<T, CdspError>;

/// How much of the coprocessor a hardware error takes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareSeverity {
    /// The pipeline's program failed; the pipeline needs reconfiguration.
    Recoverable,
    /// The coprocessor itself failed; the whole driver must reinitialize.
    Fatal,
}

/// Errors returned by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CdspError {
    /// Malformed or out-of-range input, including blob fields.
    #[error("invalid argument: {0}")]
    Argument(&'static str),

    /// Operation not valid in the pipeline's current state.
    #[error("invalid state: {0}")]
    State(&'static str),

    /// Colliding memory regions or FIFO path requirements.
    #[error("resource overlap: {0}")]
    ResourceOverlap(&'static str),

    /// A polled condition never became true.
    #[error("operation timed out")]
    Timeout,

    /// The coprocessor reported a failure.
    #[error("hardware error ({0:?})")]
    Hardware(HardwareSeverity),

    /// The register bus itself failed.
    #[error("register transport failure")]
    Transport,
}

impl From<TransportError> for CdspError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => CdspError::Timeout,
            TransportError::Bus => CdspError::Transport,
        }
    }
}
