//! The error taxonomy shared by the enumeration, topology and class layers.
//!
//! Bus-level and protocol-level failures are ordinary values here; nothing in
//! this crate panics on them. The only conditions treated as defects are
//! contract violations by a misbehaving class driver (see [`crate::class`]).

use thiserror::Error;

use crate::class::ClassId;
use crate::driver::TransferError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Device NAK or timeout that persisted past the bounded retry count.
    #[error("transient bus error (device NAK or timeout)")]
    TransientBus,

    /// The endpoint halted. The request is dead; the endpoint needs an
    /// explicit clear before it can be used again.
    #[error("endpoint stalled")]
    Stall,

    /// Data toggle mismatch, TX error or overrun. Fatal to the current
    /// enumeration attempt.
    #[error("data integrity error: {0}")]
    DataIntegrity(&'static str),

    /// No function address or no driver memory left. The attempt failed but
    /// a later retry may succeed.
    #[error("resource exhausted: no {0} available")]
    ResourceExhausted(&'static str),

    /// Enumeration completed but no registered class claimed the device.
    /// This is not a bus fault; the port is left re-enumerable.
    #[error("no class driver matches {0}")]
    NoClassDriver(ClassId),

    /// The device went away. Overrides every other error kind and aborts any
    /// in-flight operation.
    #[error("device disconnected")]
    Disconnected,

    /// A descriptor read back from the device did not parse.
    #[error("malformed descriptor: {0}")]
    Descriptor(&'static str),
}

impl From<TransferError> for Error {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Nak => Error::TransientBus,
            TransferError::Stall => Error::Stall,
            TransferError::Io => Error::DataIntegrity("data toggle or I/O error"),
            TransferError::Overrun => Error::DataIntegrity("overrun"),
            TransferError::Disconnected => Error::Disconnected,
        }
    }
}
