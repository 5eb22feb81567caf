//! Per-sample metadata: ensemble sizes, discovered sources, cross-section
//! ratios and normalization bounds.

use std::collections::BTreeMap;
use std::path::Path;

use ns_core::{Result, SampleMetadata};
use serde::{Deserialize, Serialize};

use crate::classifier::{Systematic, SystematicKind};

/// Everything the registry and the event loop need to know about a sample
/// beyond the configuration. Determined once, before `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleInfo {
    /// Ensemble family → number of members.
    #[serde(default)]
    pub ensemble_sizes: BTreeMap<String, usize>,
    /// Systematic → discovered source names.
    #[serde(default)]
    pub sources: BTreeMap<String, Vec<String>>,
    /// Ensemble family → per-member cross-section ratio (member / nominal).
    #[serde(default)]
    pub cross_section_ratios: BTreeMap<String, Vec<f64>>,
    /// Normalization systematic → `(up, down)` ratio bounds.
    #[serde(default)]
    pub norm_bounds: BTreeMap<String, (f64, f64)>,
}

impl SampleInfo {
    /// Empty metadata (no ensembles, no sources).
    pub fn new() -> Self {
        Self::default()
    }

    /// Read metadata from a YAML or JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_yaml_ng::from_slice(&bytes)?)
    }

    /// Query `meta` for what `systematics` need.
    pub fn discover(meta: &dyn SampleMetadata, systematics: &[Systematic]) -> Self {
        let mut info = Self::new();
        for s in systematics {
            let name = s.name.as_str();
            if s.kind.is_ensemble() {
                info.ensemble_sizes.insert(name.to_string(), meta.ensemble_size(name));
                let ratios = meta.cross_section_ratios(name);
                if !ratios.is_empty() {
                    info.cross_section_ratios.insert(name.to_string(), ratios);
                }
            } else if s.kind.is_norm() {
                if let Some(bounds) = meta.norm_bounds(name) {
                    info.norm_bounds.insert(name.to_string(), bounds);
                }
            } else if s.kind.splits_by_source() {
                let sources = meta.sources(name);
                if !sources.is_empty() {
                    info.sources.insert(name.to_string(), sources);
                }
            }
        }
        log::debug!(
            "sample metadata: {} ensemble(s), {} source list(s), {} norm bound(s)",
            info.ensemble_sizes.len(),
            info.sources.len(),
            info.norm_bounds.len()
        );
        info
    }

    /// Set the member count of an ensemble family.
    pub fn with_ensemble(mut self, family: impl Into<String>, size: usize) -> Self {
        self.ensemble_sizes.insert(family.into(), size);
        self
    }

    /// Set the discovered sources of a systematic.
    pub fn with_sources<I, S>(mut self, systematic: impl Into<String>, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.insert(systematic.into(), sources.into_iter().map(Into::into).collect());
        self
    }

    /// Set per-member cross-section ratios of an ensemble family.
    pub fn with_cross_section_ratios(mut self, family: impl Into<String>, ratios: Vec<f64>) -> Self {
        self.cross_section_ratios.insert(family.into(), ratios);
        self
    }

    /// Set normalization bounds.
    pub fn with_norm_bounds(mut self, name: impl Into<String>, up: f64, down: f64) -> Self {
        self.norm_bounds.insert(name.into(), (up, down));
        self
    }

    /// Member count of `family` (0 when unknown).
    pub fn ensemble_size(&self, family: &str) -> usize {
        self.ensemble_sizes.get(family).copied().unwrap_or(0)
    }

    /// Discovered sources of `systematic`.
    pub fn sources_of(&self, systematic: &str) -> &[String] {
        self.sources.get(systematic).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Cross-section ratio of member `member`; 1.0 when not provided.
    pub fn cross_section_ratio(&self, family: &str, member: usize) -> f64 {
        self.cross_section_ratios.get(family).and_then(|r| r.get(member)).copied().unwrap_or(1.0)
    }

    /// `(up, down)` normalization bounds of `name`.
    pub fn norm_bounds_of(&self, name: &str) -> Option<(f64, f64)> {
        self.norm_bounds.get(name).copied()
    }
}

impl SampleMetadata for SampleInfo {
    fn ensemble_size(&self, family: &str) -> usize {
        SampleInfo::ensemble_size(self, family)
    }

    fn sources(&self, systematic: &str) -> Vec<String> {
        self.sources_of(systematic).to_vec()
    }

    fn cross_section_ratios(&self, family: &str) -> Vec<f64> {
        self.cross_section_ratios.get(family).cloned().unwrap_or_default()
    }

    fn norm_bounds(&self, name: &str) -> Option<(f64, f64)> {
        self.norm_bounds_of(name)
    }
}

/// Does `kind` read anything from [`SampleInfo`]?
pub(crate) fn needs_metadata(kind: SystematicKind) -> bool {
    kind.is_ensemble() || kind.is_norm() || kind.splits_by_source()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let info = SampleInfo::new().with_ensemble("pdf", 3);
        assert_eq!(info.ensemble_size("pdf"), 3);
        assert_eq!(info.ensemble_size("scale"), 0);
        assert_eq!(info.cross_section_ratio("pdf", 2), 1.0);
        assert!(info.sources_of("JECSplit").is_empty());
        assert_eq!(info.norm_bounds_of("pdfNorm"), None);
    }

    #[test]
    fn discover_queries_only_what_is_needed() {
        let meta = SampleInfo::new()
            .with_ensemble("pdf", 100)
            .with_ensemble("scale", 9)
            .with_sources("JECSplit", ["Absolute", "FlavorQCD"])
            .with_sources("pileup", ["never-asked"])
            .with_cross_section_ratios("pdf", vec![1.01, 0.99])
            .with_norm_bounds("pdfNorm", 1.02, 0.97);

        let systs: Vec<Systematic> = ["pdf", "JECSplit", "pileup", "pdfNorm"]
            .iter()
            .map(|n| Systematic::classify(n).unwrap())
            .collect();
        let info = SampleInfo::discover(&meta, &systs);

        assert_eq!(info.ensemble_size("pdf"), 100);
        assert_eq!(info.ensemble_size("scale"), 0);
        assert_eq!(info.sources_of("JECSplit"), ["Absolute", "FlavorQCD"]);
        assert!(info.sources_of("pileup").is_empty());
        assert_eq!(info.cross_section_ratio("pdf", 1), 0.99);
        assert_eq!(info.norm_bounds_of("pdfNorm"), Some((1.02, 0.97)));
        assert!(needs_metadata(SystematicKind::BTagShape));
        assert!(!needs_metadata(SystematicKind::Weight));
    }

    #[test]
    fn parses_yaml() {
        let text = "ensemble_sizes: {pdf: 4}\nnorm_bounds: {psNorm: [1.1, 0.9]}\n";
        let info: SampleInfo = serde_yaml_ng::from_str(text).unwrap();
        assert_eq!(info.ensemble_size("pdf"), 4);
        assert_eq!(info.norm_bounds_of("psNorm"), Some((1.1, 0.9)));
    }
}
