//! Measurement parameters and mode-scoped selection.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Family a parameter belongs to. Families are disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterFamily {
    Scattering,
    MixerScattering,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParameterId {
    S11,
    S12,
    S21,
    S22,
    Sc11,
    Sc12,
    Sc21,
    Sc22,
    Ipwr,
    Opwr,
    Revipwr,
    Revopwr,
}

impl ParameterId {
    pub const ALL: [ParameterId; 12] = [
        ParameterId::S11,
        ParameterId::S12,
        ParameterId::S21,
        ParameterId::S22,
        ParameterId::Sc11,
        ParameterId::Sc12,
        ParameterId::Sc21,
        ParameterId::Sc22,
        ParameterId::Ipwr,
        ParameterId::Opwr,
        ParameterId::Revipwr,
        ParameterId::Revopwr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterId::S11 => "S11",
            ParameterId::S12 => "S12",
            ParameterId::S21 => "S21",
            ParameterId::S22 => "S22",
            ParameterId::Sc11 => "SC11",
            ParameterId::Sc12 => "SC12",
            ParameterId::Sc21 => "SC21",
            ParameterId::Sc22 => "SC22",
            ParameterId::Ipwr => "IPWR",
            ParameterId::Opwr => "OPWR",
            ParameterId::Revipwr => "REVIPWR",
            ParameterId::Revopwr => "REVOPWR",
        }
    }

    pub fn family(&self) -> ParameterFamily {
        match self {
            ParameterId::S11 | ParameterId::S12 | ParameterId::S21 | ParameterId::S22 => {
                ParameterFamily::Scattering
            }
            ParameterId::Sc11 | ParameterId::Sc12 | ParameterId::Sc21 | ParameterId::Sc22 => {
                ParameterFamily::MixerScattering
            }
            ParameterId::Ipwr | ParameterId::Opwr | ParameterId::Revipwr | ParameterId::Revopwr => {
                ParameterFamily::Power
            }
        }
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParameterId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ValidationError::OutOfRange {
                field: "parameter",
                value: s.to_string(),
                allowed: "S11..S22, SC11..SC22, IPWR, OPWR, REVIPWR, REVOPWR".to_string(),
            })
    }
}

/// Measurement tab. Decides which parameter family is selectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementMode {
    #[default]
    Basic,
    Mixer,
    Power,
}

impl MeasurementMode {
    pub fn family(&self) -> ParameterFamily {
        match self {
            MeasurementMode::Basic => ParameterFamily::Scattering,
            MeasurementMode::Mixer => ParameterFamily::MixerScattering,
            MeasurementMode::Power => ParameterFamily::Power,
        }
    }

    /// Parameters selectable in this mode, in display order.
    pub fn parameters(&self) -> impl Iterator<Item = ParameterId> + '_ {
        ParameterId::ALL
            .into_iter()
            .filter(move |p| p.family() == self.family())
    }

    pub fn name(&self) -> &'static str {
        match self {
            MeasurementMode::Basic => "basic",
            MeasurementMode::Mixer => "mixer",
            MeasurementMode::Power => "power",
        }
    }
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Selected parameters for the active mode.
///
/// The selection never holds a parameter outside the active mode's family.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSelection {
    mode: MeasurementMode,
    selected: BTreeSet<ParameterId>,
}

impl ParameterSelection {
    pub fn new(mode: MeasurementMode) -> Self {
        Self {
            mode,
            selected: BTreeSet::new(),
        }
    }

    pub fn mode(&self) -> MeasurementMode {
        self.mode
    }

    /// Switch mode, dropping selections from other families.
    pub fn set_mode(&mut self, mode: MeasurementMode) {
        self.mode = mode;
        let family = mode.family();
        self.selected.retain(|p| p.family() == family);
    }

    /// Flip one parameter. Returns whether it is selected afterwards.
    pub fn toggle(&mut self, parameter: ParameterId) -> Result<bool, ValidationError> {
        self.check_family(parameter)?;
        if self.selected.remove(&parameter) {
            Ok(false)
        } else {
            self.selected.insert(parameter);
            Ok(true)
        }
    }

    pub fn select(&mut self, parameter: ParameterId) -> Result<(), ValidationError> {
        self.check_family(parameter)?;
        self.selected.insert(parameter);
        Ok(())
    }

    /// Select every parameter of the mode, or clear if all are already
    /// selected.
    pub fn toggle_all(&mut self) {
        let all: BTreeSet<_> = self.mode.parameters().collect();
        if self.selected == all {
            self.selected.clear();
        } else {
            self.selected = all;
        }
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    pub fn contains(&self, parameter: ParameterId) -> bool {
        self.selected.contains(&parameter)
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    /// Selected parameters in display order.
    pub fn to_vec(&self) -> Vec<ParameterId> {
        self.selected.iter().copied().collect()
    }

    fn check_family(&self, parameter: ParameterId) -> Result<(), ValidationError> {
        if parameter.family() == self.mode.family() {
            Ok(())
        } else {
            Err(ValidationError::ParameterNotInMode {
                parameter: parameter.to_string(),
                mode: self.mode.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_families_are_disjoint() {
        for mode in [MeasurementMode::Basic, MeasurementMode::Mixer, MeasurementMode::Power] {
            assert_eq!(mode.parameters().count(), 4);
        }
        assert_eq!(ParameterId::Revopwr.family(), ParameterFamily::Power);
        assert_eq!(ParameterId::Sc21.family(), ParameterFamily::MixerScattering);
    }

    #[test]
    fn test_toggle_rejects_other_family() {
        let mut selection = ParameterSelection::new(MeasurementMode::Basic);
        assert!(selection.toggle(ParameterId::S21).unwrap());
        assert!(!selection.toggle(ParameterId::S21).unwrap());
        assert!(selection.toggle(ParameterId::Sc11).is_err());
        assert!(selection.is_empty());
    }

    #[test]
    fn test_set_mode_keeps_same_family_selection() {
        let mut selection = ParameterSelection::new(MeasurementMode::Basic);
        selection.select(ParameterId::S11).unwrap();
        selection.select(ParameterId::S22).unwrap();

        selection.set_mode(MeasurementMode::Basic);
        assert_eq!(selection.mode(), MeasurementMode::Basic);
        assert_eq!(selection.to_vec(), vec![ParameterId::S11, ParameterId::S22]);

        let mut selection = ParameterSelection::new(MeasurementMode::Mixer);
        selection.select(ParameterId::Sc11).unwrap();
        selection.select(ParameterId::Sc21).unwrap();
        selection.set_mode(MeasurementMode::Mixer);
        assert_eq!(selection.to_vec(), vec![ParameterId::Sc11, ParameterId::Sc21]);
    }

    #[test]
    fn test_set_mode_round_trip_drops_other_family() {
        let mut selection = ParameterSelection::new(MeasurementMode::Mixer);
        selection.select(ParameterId::Sc12).unwrap();

        selection.set_mode(MeasurementMode::Basic);
        assert!(selection.is_empty());
        selection.select(ParameterId::S11).unwrap();
        selection.select(ParameterId::S22).unwrap();

        selection.set_mode(MeasurementMode::Mixer);
        assert!(selection.is_empty());
        selection.set_mode(MeasurementMode::Basic);
        assert!(selection.is_empty());
        assert!(selection.toggle(ParameterId::S11).unwrap());
        assert_eq!(selection.to_vec(), vec![ParameterId::S11]);
    }

    #[test]
    fn test_toggle_all_within_mode() {
        let mut selection = ParameterSelection::new(MeasurementMode::Power);
        selection.toggle_all();
        assert_eq!(
            selection.to_vec(),
            vec![
                ParameterId::Ipwr,
                ParameterId::Opwr,
                ParameterId::Revipwr,
                ParameterId::Revopwr
            ]
        );
        selection.toggle_all();
        assert!(selection.is_empty());
    }

    #[test]
    fn test_parse_parameter_ids() {
        assert_eq!("sc12".parse::<ParameterId>().unwrap(), ParameterId::Sc12);
        assert_eq!("REVIPWR".parse::<ParameterId>().unwrap(), ParameterId::Revipwr);
        assert!("S33".parse::<ParameterId>().is_err());
        let json = serde_json::to_string(&ParameterId::Sc11).unwrap();
        assert_eq!(json, "\"SC11\"");
    }
}
