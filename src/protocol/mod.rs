//! Command construction and validation for the bench instruments.
//!
//! Everything here is pure: no I/O and no state. Strings and payloads built
//! by this module have already been checked against the instrument's numeric
//! domains, so invalid input never reaches the backend.

pub mod command;
pub mod device;
pub mod mixer;
pub mod response;

pub use command::{
    build_change_to, build_path_switch, parse_matrix_command, target_port_domain,
    CommandHistory, CommandString, HistoryEntry, MatrixCommand,
};
pub use device::VnaDevice;
pub use mixer::{
    validate_mixer_config, ConversionMode, MixerConfig, MixerVariant, MixerWire,
    RohdeMixerConfig, Sideband, SiyiMixerConfig,
};
pub use response::{classify_response, ResponseReport, ResponseStatus};
