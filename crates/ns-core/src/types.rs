//! Common data types for the systematics engine

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Provenance of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Simulated event; carries the full set of systematic variations.
    #[default]
    Simulation,
    /// Genuine collision data; only ever fills nominal.
    Data,
    /// Background estimate built from collision data (e.g. fake-rate weighted
    /// sideband). Has no simulated-shape variations of its own.
    DataDrivenEstimate,
}

impl EventKind {
    /// True for events that carry simulated variations.
    pub fn is_simulation(self) -> bool {
        matches!(self, EventKind::Simulation)
    }
}

/// Variable name → value for one event under one variation.
///
/// Produced fresh per (event, variation) pair and never mutated after it is
/// handed to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureMap(BTreeMap<String, f64>);

impl FeatureMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `name`, if the extractor produced it.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Insert a value (builder use; maps are frozen once extracted).
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    /// Number of features.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no feature was produced.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for FeatureMap {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Definition of one histogrammed variable: uniform binning on `[low, high)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Variable name (key into [`FeatureMap`]).
    pub name: String,
    /// Lower edge of the first bin.
    pub low: f64,
    /// Upper edge of the last bin.
    pub high: f64,
    /// Number of bins.
    pub nbins: usize,
    /// Fine-grained histogram kept for a later external rebinning step;
    /// exempt from negative-bin clipping.
    #[serde(default)]
    pub fine_grained: bool,
    /// Keep individual ensemble-member histograms in the output.
    #[serde(default)]
    pub retain_members: bool,
}

impl VariableSpec {
    /// Create a uniformly binned variable.
    pub fn new(name: impl Into<String>, low: f64, high: f64, nbins: usize) -> Self {
        Self { name: name.into(), low, high, nbins, fine_grained: false, retain_members: false }
    }

    /// Mark the variable as fine-grained (no clipping).
    pub fn fine_grained(mut self) -> Self {
        self.fine_grained = true;
        self
    }

    /// Keep ensemble members in the output for this variable.
    pub fn retain_members(mut self) -> Self {
        self.retain_members = true;
        self
    }

    /// Reject malformed definitions.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("variable with empty name".into()));
        }
        if self.nbins == 0 {
            return Err(Error::Configuration(format!(
                "variable '{}': nbins must be >= 1",
                self.name
            )));
        }
        if !(self.low.is_finite() && self.high.is_finite()) || self.low >= self.high {
            return Err(Error::Configuration(format!(
                "variable '{}': invalid range [{}, {})",
                self.name, self.low, self.high
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_validation() {
        assert!(VariableSpec::new("pt", 0.0, 100.0, 10).validate().is_ok());
        assert!(VariableSpec::new("pt", 0.0, 100.0, 0).validate().is_err());
        assert!(VariableSpec::new("pt", 5.0, 5.0, 3).validate().is_err());
        assert!(VariableSpec::new("pt", 0.0, f64::INFINITY, 3).validate().is_err());
        assert!(VariableSpec::new(" ", 0.0, 1.0, 3).validate().is_err());
    }

    #[test]
    fn test_feature_map_from_iter() {
        let f: FeatureMap = [("pt", 42.0), ("eta", -1.2)].into_iter().collect();
        assert_eq!(f.len(), 2);
        assert_eq!(f.get("pt"), Some(42.0));
        assert_eq!(f.get("phi"), None);
        let names: Vec<&str> = f.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["eta", "pt"]);
    }

    #[test]
    fn test_event_kind_serde() {
        let k: EventKind = serde_json::from_str("\"data_driven_estimate\"").unwrap();
        assert_eq!(k, EventKind::DataDrivenEstimate);
        assert!(!k.is_simulation());
    }
}
