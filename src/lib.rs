//! A programmable residual gas analyzer (RGA) instrument simulator.
//!
//! The crate models a quadrupole mass spectrometer well enough to stand in
//! for the real instrument during integration testing of control software:
//! scan programs sweep an output variable over a gas-mixture signal model on
//! a background acquisition task, and a report encoder renders the results
//! in the instrument's ASCII stream grammar.
//!
//! The pieces compose through [`device::Device`]:
//!
//! - [`gas`] — species catalogue and the deterministic signal model
//! - [`scan`] — scan rows, programs, registry, and the sample queues
//! - [`engine`] — the tokio acquisition worker
//! - [`report`] — the data-stream encoder
//! - [`device`] — the façade a protocol layer drives
//! - [`config`] — figment-backed settings
//! - [`error`] — crate error type

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod gas;
pub mod report;
pub mod scan;

pub use config::Settings;
pub use device::{Device, Health, ScanState};
pub use error::{AppResult, RgaError};
pub use gas::GasMixture;
pub use report::END_OF_DATA;
