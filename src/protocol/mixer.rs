//! Mixer measurement configuration for the VNA families that support it.
//!
//! Each family has its own field set and LO span. [`validate_mixer_config`]
//! reports every violated rule at once; conversion to the backend wire form
//! only happens through [`MixerConfig::validated_wire`], after validation.

use super::device::VnaDevice;
use crate::error::{ValidationError, ValidationErrors};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Physical VNA ports usable for RF, IF and LO routing.
pub const MIXER_PORT_RANGE: RangeInclusive<u8> = 1..=4;

/// LO power span shared by both families, in dBm.
pub const LO_POWER_RANGE_DBM: RangeInclusive<f64> = -30.0..=10.0;

/// Siyi input sweep limits, in MHz.
pub const SIYI_INPUT_SPAN_MHZ: RangeInclusive<f64> = 10.0..=67_000.0;

/// Siyi input drive power limits, in dBm.
pub const SIYI_INPUT_POWER_RANGE_DBM: RangeInclusive<f64> = -55.0..=10.0;

const HZ_PER_MHZ: f64 = 1e6;

/// Mixer subsystem family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MixerVariant {
    Rohde,
    Siyi,
}

impl MixerVariant {
    pub fn name(&self) -> &'static str {
        match self {
            MixerVariant::Rohde => "Rohde",
            MixerVariant::Siyi => "Siyi",
        }
    }

    /// LO frequency span in MHz.
    pub fn lo_frequency_span_mhz(&self) -> RangeInclusive<f64> {
        match self {
            MixerVariant::Rohde => 10.0..=26_500.0,
            MixerVariant::Siyi => 10.0..=25_500.0,
        }
    }
}

impl fmt::Display for MixerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rohde VMIX conversion mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversionMode {
    #[default]
    Dcup,
    Dcdown,
    Up,
    Down,
}

/// Siyi scalar-mixer sideband.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sideband {
    #[default]
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RohdeMixerConfig {
    pub rf_port: u8,
    pub if_port: u8,
    pub lo_port: u8,
    pub lo_frequency_mhz: f64,
    pub lo_power_dbm: f64,
    pub conversion_mode: ConversionMode,
}

impl Default for RohdeMixerConfig {
    fn default() -> Self {
        Self {
            rf_port: 1,
            if_port: 2,
            lo_port: 3,
            lo_frequency_mhz: 300.0,
            lo_power_dbm: 10.0,
            conversion_mode: ConversionMode::Dcup,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiyiMixerConfig {
    pub input_port: u8,
    pub output_port: u8,
    pub lo_port: u8,
    pub lo_freq_mhz: f64,
    pub lo_power_dbm: f64,
    pub sideband: Sideband,
    pub input_start_mhz: f64,
    pub input_stop_mhz: f64,
    pub input_power_dbm: f64,
}

impl Default for SiyiMixerConfig {
    fn default() -> Self {
        Self {
            input_port: 1,
            output_port: 2,
            lo_port: 3,
            lo_freq_mhz: 300.0,
            lo_power_dbm: 10.0,
            sideband: Sideband::Low,
            input_start_mhz: 3000.0,
            input_stop_mhz: 4000.0,
            input_power_dbm: -10.0,
        }
    }
}

/// Mixer configuration, tagged by family.
#[derive(Debug, Clone, PartialEq)]
pub enum MixerConfig {
    Rohde(RohdeMixerConfig),
    Siyi(SiyiMixerConfig),
}

impl MixerConfig {
    /// Factory defaults for a family. Also what "reset" restores.
    pub fn default_for(variant: MixerVariant) -> Self {
        match variant {
            MixerVariant::Rohde => MixerConfig::Rohde(RohdeMixerConfig::default()),
            MixerVariant::Siyi => MixerConfig::Siyi(SiyiMixerConfig::default()),
        }
    }

    pub fn variant(&self) -> MixerVariant {
        match self {
            MixerConfig::Rohde(_) => MixerVariant::Rohde,
            MixerConfig::Siyi(_) => MixerVariant::Siyi,
        }
    }

    /// Routing ports in RF, IF, LO order.
    pub fn ports(&self) -> [u8; 3] {
        match self {
            MixerConfig::Rohde(c) => [c.rf_port, c.if_port, c.lo_port],
            MixerConfig::Siyi(c) => [c.input_port, c.output_port, c.lo_port],
        }
    }

    pub fn lo_frequency_mhz(&self) -> f64 {
        match self {
            MixerConfig::Rohde(c) => c.lo_frequency_mhz,
            MixerConfig::Siyi(c) => c.lo_freq_mhz,
        }
    }

    pub fn lo_power_dbm(&self) -> f64 {
        match self {
            MixerConfig::Rohde(c) => c.lo_power_dbm,
            MixerConfig::Siyi(c) => c.lo_power_dbm,
        }
    }

    /// Validate for `device` and convert to the backend wire form.
    ///
    /// Siyi frequencies are converted from MHz to Hz here, on the values
    /// that passed validation.
    pub fn validated_wire(&self, device: VnaDevice) -> Result<MixerWire, ValidationErrors> {
        let variant = device.require_mixer()?;
        validate_mixer_config(self, variant)?;
        Ok(match self {
            MixerConfig::Rohde(c) => MixerWire::Rohde(RohdeWire {
                rf_port: c.rf_port,
                if_port: c.if_port,
                lo_port: c.lo_port,
                lo_frequency: c.lo_frequency_mhz,
                lo_power: c.lo_power_dbm,
                conversion_mode: c.conversion_mode,
            }),
            MixerConfig::Siyi(c) => MixerWire::Siyi(SiyiWire {
                input_port: c.input_port,
                output_port: c.output_port,
                lo_port: c.lo_port,
                lo_freq: c.lo_freq_mhz * HZ_PER_MHZ,
                lo_power: c.lo_power_dbm,
                sideband: c.sideband,
                input_start_freq: c.input_start_mhz * HZ_PER_MHZ,
                input_stop_freq: c.input_stop_mhz * HZ_PER_MHZ,
                input_power: c.input_power_dbm,
            }),
        })
    }

    /// Read a configuration returned by the backend.
    ///
    /// Fields the backend omits take the family defaults. Siyi frequencies
    /// arrive in Hz and are converted back to MHz.
    pub fn from_wire(
        variant: MixerVariant,
        value: &serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match variant {
            MixerVariant::Rohde => {
                let w = RohdeWire::deserialize(value)?;
                MixerConfig::Rohde(RohdeMixerConfig {
                    rf_port: w.rf_port,
                    if_port: w.if_port,
                    lo_port: w.lo_port,
                    lo_frequency_mhz: w.lo_frequency,
                    lo_power_dbm: w.lo_power,
                    conversion_mode: w.conversion_mode,
                })
            }
            MixerVariant::Siyi => {
                let w = SiyiWire::deserialize(value)?;
                MixerConfig::Siyi(SiyiMixerConfig {
                    input_port: w.input_port,
                    output_port: w.output_port,
                    lo_port: w.lo_port,
                    lo_freq_mhz: w.lo_freq / HZ_PER_MHZ,
                    lo_power_dbm: w.lo_power,
                    sideband: w.sideband,
                    input_start_mhz: w.input_start_freq / HZ_PER_MHZ,
                    input_stop_mhz: w.input_stop_freq / HZ_PER_MHZ,
                    input_power_dbm: w.input_power,
                })
            }
        })
    }
}

/// Validate `config` against the rules of `variant`, collecting every
/// violation.
pub fn validate_mixer_config(
    config: &MixerConfig,
    variant: MixerVariant,
) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    if config.variant() != variant {
        errors.push(ValidationError::MixerVariantMismatch {
            expected: config.variant().name(),
            actual: variant.name(),
        });
    }

    let ports = config.ports();
    for (field, port) in ["rf_port", "if_port", "lo_port"].into_iter().zip(ports) {
        if !MIXER_PORT_RANGE.contains(&port) {
            errors.push(ValidationError::OutOfRange {
                field,
                value: port.to_string(),
                allowed: format!("{}..={}", MIXER_PORT_RANGE.start(), MIXER_PORT_RANGE.end()),
            });
        }
    }
    if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
        errors.push(ValidationError::PortsNotDistinct { ports });
    }

    let span = variant.lo_frequency_span_mhz();
    let lo_frequency = config.lo_frequency_mhz();
    if !span.contains(&lo_frequency) {
        errors.push(ValidationError::OutOfRange {
            field: "lo_frequency_mhz",
            value: lo_frequency.to_string(),
            allowed: format!("{}..={} MHz", span.start(), span.end()),
        });
    }

    let lo_power = config.lo_power_dbm();
    if !LO_POWER_RANGE_DBM.contains(&lo_power) {
        errors.push(ValidationError::OutOfRange {
            field: "lo_power_dbm",
            value: lo_power.to_string(),
            allowed: format!(
                "{}..={} dBm",
                LO_POWER_RANGE_DBM.start(),
                LO_POWER_RANGE_DBM.end()
            ),
        });
    }

    if let MixerConfig::Siyi(c) = config {
        validate_siyi_input(c, &mut errors);
    }

    errors.into_result()
}

#[allow(clippy::neg_cmp_op_on_partial_ord)]
fn validate_siyi_input(config: &SiyiMixerConfig, errors: &mut ValidationErrors) {
    let bounds = format!(
        "{}..={} MHz",
        SIYI_INPUT_SPAN_MHZ.start(),
        SIYI_INPUT_SPAN_MHZ.end()
    );
    for (field, value) in [
        ("input_start_mhz", config.input_start_mhz),
        ("input_stop_mhz", config.input_stop_mhz),
    ] {
        if !SIYI_INPUT_SPAN_MHZ.contains(&value) {
            errors.push(ValidationError::OutOfRange {
                field,
                value: value.to_string(),
                allowed: bounds.clone(),
            });
        }
    }
    // Negated so NaN fails too.
    if !(config.input_start_mhz < config.input_stop_mhz) {
        errors.push(ValidationError::InvertedSweep {
            start: config.input_start_mhz,
            stop: config.input_stop_mhz,
        });
    }
    if !SIYI_INPUT_POWER_RANGE_DBM.contains(&config.input_power_dbm) {
        errors.push(ValidationError::OutOfRange {
            field: "input_power_dbm",
            value: config.input_power_dbm.to_string(),
            allowed: format!(
                "{}..={} dBm",
                SIYI_INPUT_POWER_RANGE_DBM.start(),
                SIYI_INPUT_POWER_RANGE_DBM.end()
            ),
        });
    }
}

/// Rohde wire form: camelCase, LO frequency in MHz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RohdeWire {
    pub rf_port: u8,
    pub if_port: u8,
    pub lo_port: u8,
    pub lo_frequency: f64,
    pub lo_power: f64,
    pub conversion_mode: ConversionMode,
}

impl Default for RohdeWire {
    fn default() -> Self {
        let c = RohdeMixerConfig::default();
        Self {
            rf_port: c.rf_port,
            if_port: c.if_port,
            lo_port: c.lo_port,
            lo_frequency: c.lo_frequency_mhz,
            lo_power: c.lo_power_dbm,
            conversion_mode: c.conversion_mode,
        }
    }
}

/// Siyi wire form: snake_case, frequencies in Hz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiyiWire {
    pub input_port: u8,
    pub output_port: u8,
    pub lo_port: u8,
    pub lo_freq: f64,
    pub lo_power: f64,
    pub sideband: Sideband,
    pub input_start_freq: f64,
    pub input_stop_freq: f64,
    pub input_power: f64,
}

impl Default for SiyiWire {
    fn default() -> Self {
        let c = SiyiMixerConfig::default();
        Self {
            input_port: c.input_port,
            output_port: c.output_port,
            lo_port: c.lo_port,
            lo_freq: c.lo_freq_mhz * HZ_PER_MHZ,
            lo_power: c.lo_power_dbm,
            sideband: c.sideband,
            input_start_freq: c.input_start_mhz * HZ_PER_MHZ,
            input_stop_freq: c.input_stop_mhz * HZ_PER_MHZ,
            input_power: c.input_power_dbm,
        }
    }
}

/// Validated mixer payload ready for the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MixerWire {
    Rohde(RohdeWire),
    Siyi(SiyiWire),
}
