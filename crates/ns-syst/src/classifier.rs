//! Systematic name → variation kind.
//!
//! The set of recognized systematics is closed: every name a run requests is
//! classified before the first event is read, and an unknown name aborts the
//! run with [`Error::Configuration`].

use std::fmt;

use ns_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Variant name of the unvaried evaluation.
pub const NOMINAL: &str = "nominal";

/// Reweighting factor that must follow the jet hypothesis of jet-energy
/// variations.
pub const BTAG_SHAPE_FACTOR: &str = "bTagShape";

/// How a systematic recomputes an event and how many keys it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystematicKind {
    /// Re-runs selection and features under Up and Down hypotheses.
    Acceptance,
    /// [`SystematicKind::Acceptance`], once per discovered jet-energy source.
    JecSplit,
    /// Pure reweighting factor.
    Weight,
    /// b-tag shape reweighting, optionally split into discovered sources.
    BTagShape,
    /// Ensemble of generator (LHE) weights, e.g. PDF replicas or scale choices.
    LheEnsemble,
    /// Normalization-only effect of an LHE ensemble.
    LheNorm,
    /// Ensemble of parton-shower weights.
    PsEnsemble,
    /// Normalization-only effect of the parton-shower ensemble.
    PsNorm,
    /// Electron reconstruction scale factor, optionally split into sources.
    ElectronReco,
}

impl SystematicKind {
    /// Re-evaluates selection and features.
    pub fn changes_acceptance(self) -> bool {
        matches!(self, SystematicKind::Acceptance | SystematicKind::JecSplit)
    }

    /// Stores N members and derives Envelope/RMS after the loop.
    pub fn is_ensemble(self) -> bool {
        matches!(self, SystematicKind::LheEnsemble | SystematicKind::PsEnsemble)
    }

    /// Normalization-only Up/Down from precomputed ratio bounds.
    pub fn is_norm(self) -> bool {
        matches!(self, SystematicKind::LheNorm | SystematicKind::PsNorm)
    }

    /// Reuses nominal features and multiplies the nominal weight by a ratio.
    pub fn is_reweight(self) -> bool {
        matches!(
            self,
            SystematicKind::Weight | SystematicKind::BTagShape | SystematicKind::ElectronReco
        )
    }

    /// Up/Down keys expand per discovered source.
    pub fn splits_by_source(self) -> bool {
        matches!(
            self,
            SystematicKind::JecSplit | SystematicKind::BTagShape | SystematicKind::ElectronReco
        )
    }
}

impl fmt::Display for SystematicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Summary statistics derived from an ensemble after the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnsembleStatistics {
    /// Bin-wise min/max over nominal and members (`<name>EnvUp/EnvDown`).
    #[serde(default)]
    pub envelope: bool,
    /// Nominal ± RMS spread of members (`<name>RMSUp/RMSDown`).
    #[serde(default)]
    pub rms: bool,
}

impl EnsembleStatistics {
    /// No derived statistic.
    pub const NONE: Self = Self { envelope: false, rms: false };
    /// Envelope only.
    pub const ENVELOPE: Self = Self { envelope: true, rms: false };
    /// RMS only.
    pub const RMS: Self = Self { envelope: false, rms: true };
    /// Envelope and RMS.
    pub const BOTH: Self = Self { envelope: true, rms: true };

    /// True if neither statistic is requested.
    pub fn is_empty(self) -> bool {
        !(self.envelope || self.rms)
    }
}

/// A requested systematic after classification. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Systematic {
    /// Requested name; prefix of every variant key it owns.
    pub name: String,
    /// Variation kind.
    pub kind: SystematicKind,
    /// Derived statistics (ensemble kinds only).
    pub statistics: EnsembleStatistics,
}

impl Systematic {
    /// Classify `name` and attach the default statistics of its family.
    pub fn classify(name: &str) -> Result<Self> {
        let kind = classify(name)?;
        Ok(Self { name: name.to_string(), kind, statistics: default_statistics(name, kind) })
    }

    /// Override the derived statistics. Rejected for non-ensemble kinds and
    /// for an empty selection.
    pub fn with_statistics(mut self, statistics: EnsembleStatistics) -> Result<Self> {
        if !self.kind.is_ensemble() {
            return Err(Error::Configuration(format!(
                "systematic '{}' ({}) has no ensemble statistics",
                self.name, self.kind
            )));
        }
        if statistics.is_empty() {
            return Err(Error::Configuration(format!(
                "ensemble systematic '{}' needs envelope and/or rms",
                self.name
            )));
        }
        self.statistics = statistics;
        Ok(self)
    }

    /// Jet-energy-correction variation: its jet hypothesis also drives the
    /// b-tag shape factor.
    pub fn is_jet_energy(&self) -> bool {
        matches!(self.name.as_str(), "JEC" | "JECSplit")
    }

    /// Aggregate systematic that the split form of this one replaces.
    pub fn aggregate_of_split(&self) -> Option<&'static str> {
        match (self.kind, self.name.as_str()) {
            (SystematicKind::JecSplit, "JECSplit") => Some("JEC"),
            _ => None,
        }
    }

    /// Reweighting factor queried for reweight kinds.
    pub fn factor(&self) -> &str {
        &self.name
    }
}

/// Classify a systematic name.
pub fn classify(name: &str) -> Result<SystematicKind> {
    let kind = match name {
        "JEC" | "JER" | "unclustered" => SystematicKind::Acceptance,
        "JECSplit" => SystematicKind::JecSplit,
        "pileup" | "prefire" | "muonSF" | "electronSF" | "trigger" | "leptonFake" => {
            SystematicKind::Weight
        }
        BTAG_SHAPE_FACTOR => SystematicKind::BTagShape,
        "electronReco" => SystematicKind::ElectronReco,
        "pdf" | "scale" => SystematicKind::LheEnsemble,
        "pdfNorm" | "scaleNorm" => SystematicKind::LheNorm,
        "ps" => SystematicKind::PsEnsemble,
        "psNorm" => SystematicKind::PsNorm,
        other => {
            return Err(Error::Configuration(format!("unknown systematic '{other}'")));
        }
    };
    Ok(kind)
}

fn default_statistics(name: &str, kind: SystematicKind) -> EnsembleStatistics {
    if !kind.is_ensemble() {
        return EnsembleStatistics::NONE;
    }
    match name {
        // PDF replicas: both the envelope and the replica RMS are in use.
        "pdf" => EnsembleStatistics::BOTH,
        _ => EnsembleStatistics::ENVELOPE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_names() {
        assert_eq!(classify("JEC").unwrap(), SystematicKind::Acceptance);
        assert_eq!(classify("JECSplit").unwrap(), SystematicKind::JecSplit);
        assert_eq!(classify("pileup").unwrap(), SystematicKind::Weight);
        assert_eq!(classify("bTagShape").unwrap(), SystematicKind::BTagShape);
        assert_eq!(classify("electronReco").unwrap(), SystematicKind::ElectronReco);
        assert_eq!(classify("pdf").unwrap(), SystematicKind::LheEnsemble);
        assert_eq!(classify("scaleNorm").unwrap(), SystematicKind::LheNorm);
        assert_eq!(classify("ps").unwrap(), SystematicKind::PsEnsemble);
        assert_eq!(classify("psNorm").unwrap(), SystematicKind::PsNorm);
    }

    #[test]
    fn classify_unknown_name_is_configuration_error() {
        let err = classify("bogus").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("'bogus'"));
        // Case matters.
        assert!(classify("jec").is_err());
    }

    #[test]
    fn ensemble_defaults() {
        assert_eq!(Systematic::classify("pdf").unwrap().statistics, EnsembleStatistics::BOTH);
        assert_eq!(Systematic::classify("scale").unwrap().statistics, EnsembleStatistics::ENVELOPE);
        assert_eq!(Systematic::classify("ps").unwrap().statistics, EnsembleStatistics::ENVELOPE);
        assert!(Systematic::classify("pileup").unwrap().statistics.is_empty());
    }

    #[test]
    fn statistics_override() {
        let s = Systematic::classify("scale").unwrap();
        let s = s.with_statistics(EnsembleStatistics::RMS).unwrap();
        assert_eq!(s.statistics, EnsembleStatistics::RMS);

        let pileup = Systematic::classify("pileup").unwrap();
        assert!(pileup.with_statistics(EnsembleStatistics::RMS).is_err());

        let pdf = Systematic::classify("pdf").unwrap();
        assert!(pdf.with_statistics(EnsembleStatistics::NONE).is_err());
    }

    #[test]
    fn jet_energy_and_split() {
        let jec = Systematic::classify("JEC").unwrap();
        let split = Systematic::classify("JECSplit").unwrap();
        let jer = Systematic::classify("JER").unwrap();
        assert!(jec.is_jet_energy());
        assert!(split.is_jet_energy());
        assert!(!jer.is_jet_energy());
        assert_eq!(split.aggregate_of_split(), Some("JEC"));
        assert_eq!(jec.aggregate_of_split(), None);
    }
}
