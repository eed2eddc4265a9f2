//! Core library for the RF console.
//!
//! Drives an RF switch matrix and a vector network analyzer through a backend
//! device-control service. The library holds all operator-facing logic:
//! command construction and validation, connection supervision, measurement
//! orchestration and mixer configuration. Presentation layers (the bundled
//! CLI, or anything else) only call into [`console::Console`] and render the
//! snapshots it publishes.

pub mod config;
pub mod console;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod measurement;
pub mod protocol;
pub mod supervisor;

pub use config::ConsoleConfig;
pub use console::Console;
pub use error::{ConsoleError, ConsoleResult, TransportError, ValidationError, ValidationErrors};
