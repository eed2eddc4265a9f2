//! Catalog of supported vector network analyzers.

use super::mixer::MixerVariant;
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A supported VNA model, identified on the wire by its device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VnaDevice {
    #[serde(rename = "siyi-3674l")]
    Siyi3674L,
    #[serde(rename = "rohde-zna26")]
    RohdeZna26,
    #[serde(rename = "keysight-e5071c")]
    KeysightE5071C,
}

impl VnaDevice {
    pub const ALL: [VnaDevice; 3] = [
        VnaDevice::Siyi3674L,
        VnaDevice::RohdeZna26,
        VnaDevice::KeysightE5071C,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            VnaDevice::Siyi3674L => "siyi-3674l",
            VnaDevice::RohdeZna26 => "rohde-zna26",
            VnaDevice::KeysightE5071C => "keysight-e5071c",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            VnaDevice::Siyi3674L => "Siyi 3674L",
            VnaDevice::RohdeZna26 => "Rohde & Schwarz ZNA26",
            VnaDevice::KeysightE5071C => "Keysight E5071C",
        }
    }

    /// Instrument sweep span in Hz.
    pub fn frequency_range_hz(&self) -> (f64, f64) {
        match self {
            VnaDevice::Siyi3674L => (10e6, 67e9),
            VnaDevice::RohdeZna26 => (10e6, 26.5e9),
            VnaDevice::KeysightE5071C => (100e3, 8.5e9),
        }
    }

    /// Mixer subsystem variant, if the model has one.
    pub fn mixer_variant(&self) -> Option<MixerVariant> {
        match self {
            VnaDevice::Siyi3674L => Some(MixerVariant::Siyi),
            VnaDevice::RohdeZna26 => Some(MixerVariant::Rohde),
            VnaDevice::KeysightE5071C => None,
        }
    }

    pub fn supports_mixer(&self) -> bool {
        self.mixer_variant().is_some()
    }

    pub(crate) fn require_mixer(&self) -> Result<MixerVariant, ValidationError> {
        self.mixer_variant()
            .ok_or_else(|| ValidationError::MixerUnsupported(self.id().to_string()))
    }
}

impl fmt::Display for VnaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for VnaDevice {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim();
        Self::ALL
            .into_iter()
            .find(|device| device.id().eq_ignore_ascii_case(id))
            .ok_or_else(|| ValidationError::UnknownDevice(id.to_string()))
    }
}
