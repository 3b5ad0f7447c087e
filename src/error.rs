//! Custom error types for the simulator.
//!
//! This module defines the primary error type, `RgaError`, for the whole
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the errors a caller can actually act on:
//! configuration problems and invalid selector names handed in by the
//! protocol layer.
//!
//! Note that simulated instrument faults (trips) are deliberately *not*
//! errors. They travel through the sample queues as tagged data so that the
//! report encoder can render them exactly like a real instrument would (see
//! [`crate::scan::Sample`]).

use thiserror::Error;

/// Convenience alias for results using the simulator error type.
pub type AppResult<T> = std::result::Result<T, RgaError>;

#[derive(Error, Debug)]
pub enum RgaError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown gas species: {0}")]
    UnknownGas(String),

    #[error("Unknown scan input selector: {0}")]
    UnknownScanInput(String),

    #[error("Unknown scan output selector: {0}")]
    UnknownScanOutput(String),
}
