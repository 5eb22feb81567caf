//! Pre-evaluated events.
//!
//! A [`RecordedEvent`] carries, per variation, the selections it passes and
//! its features, plus every reweighting factor it needs. An upstream
//! framework evaluates these once; [`Recorded`] then answers the
//! collaborator traits by lookup, which is what the `nextsyst` CLI and the
//! integration tests run on.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use ns_core::{
    Error, EventKind, EventRecord, FeatureExtractor, FeatureMap, Result, Reweighter, SampleMetadata,
    Selector,
};
use serde::{Deserialize, Serialize};

/// Values of one reweighting factor for one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordedFactor {
    /// Nominal value.
    pub nominal: f64,
    /// Up value per systematic (or source) name.
    #[serde(default)]
    pub up: BTreeMap<String, f64>,
    /// Down value per systematic (or source) name.
    #[serde(default)]
    pub down: BTreeMap<String, f64>,
    /// Value under a jet-energy variation.
    #[serde(default)]
    pub jec: BTreeMap<String, f64>,
}

impl RecordedFactor {
    /// Factor with nominal value `nominal` and no variations.
    pub fn new(nominal: f64) -> Self {
        Self { nominal, ..Default::default() }
    }

    /// Set the Up value for `systematic`.
    pub fn up(mut self, systematic: impl Into<String>, value: f64) -> Self {
        self.up.insert(systematic.into(), value);
        self
    }

    /// Set the Down value for `systematic`.
    pub fn down(mut self, systematic: impl Into<String>, value: f64) -> Self {
        self.down.insert(systematic.into(), value);
        self
    }

    /// Set the value under jet-energy variation `variation`.
    pub fn jec(mut self, variation: impl Into<String>, value: f64) -> Self {
        self.jec.insert(variation.into(), value);
        self
    }
}

fn unit_weight() -> f64 {
    1.0
}

/// One pre-evaluated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Process the event belongs to.
    pub process: String,
    /// Provenance.
    #[serde(default)]
    pub kind: EventKind,
    /// Weight before reweighting factors.
    #[serde(default = "unit_weight")]
    pub base_weight: f64,
    /// Variation → selections passed.
    #[serde(default)]
    pub selections: BTreeMap<String, Vec<String>>,
    /// Variation → features. A missing variation means undefined features.
    #[serde(default)]
    pub features: BTreeMap<String, FeatureMap>,
    /// Reweighting factors by name.
    #[serde(default)]
    pub factors: BTreeMap<String, RecordedFactor>,
    /// Ensemble family → per-member weight ratios.
    #[serde(default)]
    pub ensembles: BTreeMap<String, Vec<f64>>,
}

impl RecordedEvent {
    /// Event of `process` passing nothing yet.
    pub fn new(process: impl Into<String>, kind: EventKind, base_weight: f64) -> Self {
        Self {
            process: process.into(),
            kind,
            base_weight,
            selections: BTreeMap::new(),
            features: BTreeMap::new(),
            factors: BTreeMap::new(),
            ensembles: BTreeMap::new(),
        }
    }

    /// Mark `selections` as passed under `variation`.
    pub fn passing(mut self, variation: impl Into<String>, selections: &[&str]) -> Self {
        self.selections
            .entry(variation.into())
            .or_default()
            .extend(selections.iter().map(|s| s.to_string()));
        self
    }

    /// Set the features under `variation`.
    pub fn with_features(mut self, variation: impl Into<String>, features: FeatureMap) -> Self {
        self.features.insert(variation.into(), features);
        self
    }

    /// Add a reweighting factor.
    pub fn with_factor(mut self, name: impl Into<String>, factor: RecordedFactor) -> Self {
        self.factors.insert(name.into(), factor);
        self
    }

    /// Set the member weight ratios of an ensemble family.
    pub fn with_ensemble(mut self, family: impl Into<String>, ratios: Vec<f64>) -> Self {
        self.ensembles.insert(family.into(), ratios);
        self
    }

    /// Read one JSON event per line; blank lines are skipped.
    pub fn read_jsonl(path: &Path) -> Result<Vec<Self>> {
        let text = std::fs::read_to_string(path)?;
        let mut events = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event = serde_json::from_str(line).map_err(|e| {
                Error::Validation(format!("{}:{}: {e}", path.display(), lineno + 1))
            })?;
            events.push(event);
        }
        log::debug!("read {} event(s) from {}", events.len(), path.display());
        Ok(events)
    }
}

impl EventRecord for RecordedEvent {
    fn kind(&self) -> EventKind {
        self.kind
    }

    fn base_weight(&self) -> f64 {
        self.base_weight
    }

    fn ensemble_weight(&self, family: &str, member: usize) -> Option<f64> {
        self.ensembles.get(family)?.get(member).copied()
    }
}

/// Collaborator answering every query from the recorded values.
///
/// Absent factors evaluate to 1; absent variations of a present factor fall
/// back to its nominal value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recorded;

impl Selector<RecordedEvent> for Recorded {
    fn passes(&self, event: &RecordedEvent, selection: &str, variation: &str) -> bool {
        event.selections.get(variation).is_some_and(|s| s.iter().any(|x| x == selection))
    }
}

impl FeatureExtractor<RecordedEvent> for Recorded {
    fn extract(&self, event: &RecordedEvent, variation: &str) -> Option<FeatureMap> {
        event.features.get(variation).cloned()
    }
}

impl Reweighter<RecordedEvent> for Recorded {
    fn weight(&self, name: &str, event: &RecordedEvent) -> f64 {
        event.factors.get(name).map_or(1.0, |f| f.nominal)
    }

    fn weight_up(&self, name: &str, event: &RecordedEvent, systematic: &str) -> f64 {
        event.factors.get(name).map_or(1.0, |f| f.up.get(systematic).copied().unwrap_or(f.nominal))
    }

    fn weight_down(&self, name: &str, event: &RecordedEvent, systematic: &str) -> f64 {
        event.factors.get(name).map_or(1.0, |f| f.down.get(systematic).copied().unwrap_or(f.nominal))
    }

    fn weight_jec_var(&self, name: &str, event: &RecordedEvent, jec_variation: &str) -> f64 {
        event.factors.get(name).map_or(1.0, |f| f.jec.get(jec_variation).copied().unwrap_or(f.nominal))
    }
}

/// Sample metadata inferred from the first simulated event of a sample.
///
/// Sources of `<name>` are the `<src>` of every `<name>_<src>Up` variation
/// or factor Up key; ensemble sizes are the lengths of the member vectors.
/// No cross-section ratios or normalization bounds can be inferred.
pub struct FirstEventMetadata<'a> {
    event: &'a RecordedEvent,
}

impl<'a> FirstEventMetadata<'a> {
    /// Infer from `event`.
    pub fn new(event: &'a RecordedEvent) -> Self {
        Self { event }
    }

    /// Infer from the first simulated event of `events`. Data and estimate
    /// events carry no variations, so they are skipped.
    pub fn first_simulated(events: &'a [RecordedEvent]) -> Option<Self> {
        events.iter().find(|e| e.kind.is_simulation()).map(Self::new)
    }
}

impl SampleMetadata for FirstEventMetadata<'_> {
    fn ensemble_size(&self, family: &str) -> usize {
        self.event.ensembles.get(family).map_or(0, Vec::len)
    }

    fn sources(&self, systematic: &str) -> Vec<String> {
        let prefix = format!("{systematic}_");
        let mut found: BTreeSet<String> = BTreeSet::new();
        for variation in self.event.features.keys().chain(self.event.selections.keys()) {
            if let Some(src) = variation.strip_prefix(&prefix).and_then(|r| r.strip_suffix("Up"))
                && !src.is_empty()
            {
                found.insert(src.to_string());
            }
        }
        if let Some(factor) = self.event.factors.get(systematic) {
            found.extend(factor.up.keys().filter(|k| k.as_str() != systematic).cloned());
        }
        found.into_iter().collect()
    }

    fn cross_section_ratios(&self, _family: &str) -> Vec<f64> {
        Vec::new()
    }

    fn norm_bounds(&self, _name: &str) -> Option<(f64, f64)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> RecordedEvent {
        RecordedEvent::new("ttZ", EventKind::Simulation, 0.5)
            .passing("nominal", &["3l", "eee"])
            .passing("JECSplit_AbsoluteUp", &["3l"])
            .with_features("JECSplit_FlavorQCDUp", [("pt", 1.0)].into_iter().collect())
            .with_factor("bTagShape", RecordedFactor::new(0.9).up("lf", 1.1).up("hf", 1.2))
            .with_ensemble("pdf", vec![1.0; 4])
    }

    #[test]
    fn collaborators_answer_by_lookup() {
        let ev = event();
        let rec = Recorded;
        assert!(rec.passes(&ev, "eee", "nominal"));
        assert!(!rec.passes(&ev, "eee", "JECUp"));
        assert!(rec.extract(&ev, "nominal").is_none());
        assert_eq!(rec.weight("bTagShape", &ev), 0.9);
        assert_eq!(rec.weight_up("bTagShape", &ev, "hf"), 1.2);
        assert_eq!(rec.weight_down("bTagShape", &ev, "hf"), 0.9);
        assert_eq!(rec.weight("pileup", &ev), 1.0);
        assert_eq!(ev.ensemble_weight("pdf", 3), Some(1.0));
        assert_eq!(ev.ensemble_weight("pdf", 4), None);
    }

    #[test]
    fn metadata_from_first_event() {
        let ev = event();
        let meta = FirstEventMetadata::new(&ev);
        assert_eq!(meta.sources("JECSplit"), vec!["Absolute", "FlavorQCD"]);
        assert_eq!(meta.sources("bTagShape"), vec!["hf", "lf"]);
        assert!(meta.sources("electronReco").is_empty());
        assert_eq!(meta.ensemble_size("pdf"), 4);
        assert_eq!(meta.ensemble_size("scale"), 0);
    }

    #[test]
    fn metadata_skips_leading_estimate_and_data() {
        let events = vec![
            RecordedEvent::new("nonprompt", EventKind::DataDrivenEstimate, -0.2).passing("nominal", &["3l"]),
            RecordedEvent::new("data", EventKind::Data, 1.0).passing("nominal", &["3l"]),
            event(),
        ];
        let meta = FirstEventMetadata::first_simulated(&events).unwrap();
        assert_eq!(meta.sources("JECSplit"), vec!["Absolute", "FlavorQCD"]);
        assert_eq!(meta.ensemble_size("pdf"), 4);

        assert!(FirstEventMetadata::first_simulated(&events[..2]).is_none());
    }

    #[test]
    fn parses_json_line_with_defaults() {
        let ev: RecordedEvent =
            serde_json::from_str(r#"{"process": "data", "kind": "data", "selections": {"nominal": ["3l"]}}"#)
                .unwrap();
        assert_eq!(ev.kind, EventKind::Data);
        assert_eq!(ev.base_weight, 1.0);
        assert!(ev.factors.is_empty());
    }
}
