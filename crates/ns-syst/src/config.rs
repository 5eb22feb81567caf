//! Run configuration and the fail-fast systematic plan.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use ns_core::{Error, Result, VariableSpec};
use serde::{Deserialize, Serialize};

use crate::classifier::{EnsembleStatistics, Systematic};

/// Nominal-only cut on a score variable (e.g. a classifier output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCut {
    /// Feature holding the score.
    pub variable: String,
    /// Events with `score < min` fail the nominal selection.
    pub min: f64,
}

/// Configuration of one histogramming run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Process names (already expanded by any splitter).
    pub processes: Vec<String>,
    /// Histogrammed variables.
    pub variables: Vec<VariableSpec>,
    /// Requested systematic names.
    #[serde(default)]
    pub systematics: Vec<String>,
    /// Selection (category) passed to the selector.
    pub selection: String,
    /// Optional channel filter, also passed to the selector.
    #[serde(default)]
    pub channel: Option<String>,
    /// Reweighting factors multiplied into the nominal weight.
    #[serde(default)]
    pub weight_factors: Vec<String>,
    /// Factors whose (near) zero value skips systematic processing for an event.
    #[serde(default)]
    pub guard_factors: Vec<String>,
    /// Processes that are data-driven estimates (never clipped).
    #[serde(default)]
    pub estimate_processes: Vec<String>,
    /// Nominal-only score cutoff.
    #[serde(default)]
    pub score_cut: Option<ScoreCut>,
    /// Per-ensemble override of the derived statistics.
    #[serde(default)]
    pub ensemble_statistics: BTreeMap<String, EnsembleStatistics>,
}

impl AnalysisConfig {
    /// Create a config for `selection` with no processes, variables or
    /// systematics yet.
    pub fn new(selection: impl Into<String>) -> Self {
        Self {
            processes: Vec::new(),
            variables: Vec::new(),
            systematics: Vec::new(),
            selection: selection.into(),
            channel: None,
            weight_factors: Vec::new(),
            guard_factors: Vec::new(),
            estimate_processes: Vec::new(),
            score_cut: None,
            ensemble_statistics: BTreeMap::new(),
        }
    }

    /// Read a YAML or JSON config file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        // YAML is a superset of JSON, one parser covers both.
        Ok(serde_yaml_ng::from_slice(&bytes)?)
    }

    /// Add a process.
    pub fn process(mut self, name: impl Into<String>) -> Self {
        self.processes.push(name.into());
        self
    }

    /// Add a variable.
    pub fn variable(mut self, spec: VariableSpec) -> Self {
        self.variables.push(spec);
        self
    }

    /// Request a systematic.
    pub fn systematic(mut self, name: impl Into<String>) -> Self {
        self.systematics.push(name.into());
        self
    }

    /// Set the channel filter.
    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channel = Some(name.into());
        self
    }

    /// Multiply `name` into the nominal weight.
    pub fn weight_factor(mut self, name: impl Into<String>) -> Self {
        self.weight_factors.push(name.into());
        self
    }

    /// Guard systematic processing against a (near) zero `name`.
    pub fn guard_factor(mut self, name: impl Into<String>) -> Self {
        self.guard_factors.push(name.into());
        self
    }

    /// Declare `name` a data-driven estimate process.
    pub fn estimate_process(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.processes.contains(&name) {
            self.processes.push(name.clone());
        }
        self.estimate_processes.push(name);
        self
    }

    /// Set the nominal-only score cutoff.
    pub fn score_cut(mut self, variable: impl Into<String>, min: f64) -> Self {
        self.score_cut = Some(ScoreCut { variable: variable.into(), min });
        self
    }

    /// Override the statistics derived for an ensemble systematic.
    pub fn ensemble_statistics(mut self, name: impl Into<String>, stats: EnsembleStatistics) -> Self {
        self.ensemble_statistics.insert(name.into(), stats);
        self
    }

    /// Is `process` a data-driven estimate?
    pub fn is_estimate(&self, process: &str) -> bool {
        self.estimate_processes.iter().any(|p| p == process)
    }

    /// Variable definition by name.
    pub fn variable_spec(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Validate everything and classify every requested systematic.
    ///
    /// Must succeed before any event is read.
    pub fn validate(&self) -> Result<SystematicPlan> {
        if self.selection.trim().is_empty() {
            return Err(Error::Configuration("empty selection name".into()));
        }
        if self.processes.is_empty() {
            return Err(Error::Configuration("no process configured".into()));
        }
        ensure_unique("process", self.processes.iter().map(String::as_str))?;
        for p in &self.estimate_processes {
            if !self.processes.contains(p) {
                return Err(Error::Configuration(format!(
                    "estimate process '{p}' is not a configured process"
                )));
            }
        }

        if self.variables.is_empty() {
            return Err(Error::Configuration("no variable configured".into()));
        }
        for v in &self.variables {
            v.validate()?;
        }
        ensure_unique("variable", self.variables.iter().map(|v| v.name.as_str()))?;
        ensure_unique("systematic", self.systematics.iter().map(String::as_str))?;

        let mut systematics = Vec::with_capacity(self.systematics.len());
        for name in &self.systematics {
            let mut s = Systematic::classify(name)?;
            if let Some(stats) = self.ensemble_statistics.get(name) {
                s = s.with_statistics(*stats)?;
            }
            systematics.push(s);
        }
        for name in self.ensemble_statistics.keys() {
            if !self.systematics.contains(name) {
                return Err(Error::Configuration(format!(
                    "ensemble statistics given for '{name}', which is not requested"
                )));
            }
        }

        if let Some(cut) = &self.score_cut {
            if !systematics.is_empty() {
                return Err(Error::Configuration(format!(
                    "score cut on '{}' is nominal-only but {} systematic(s) are requested",
                    cut.variable,
                    systematics.len()
                )));
            }
            if !cut.min.is_finite() {
                return Err(Error::Configuration("score cut threshold must be finite".into()));
            }
        }

        // A split systematic replaces its aggregate form within one run.
        let replaced: BTreeSet<&'static str> =
            systematics.iter().filter_map(Systematic::aggregate_of_split).collect();
        let mut dropped = Vec::new();
        systematics.retain(|s| {
            if replaced.contains(s.name.as_str()) {
                log::warn!("'{}' is requested in split form; aggregate Up/Down dropped", s.name);
                dropped.push(s.name.clone());
                false
            } else {
                true
            }
        });

        Ok(SystematicPlan { systematics, dropped })
    }
}

fn ensure_unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for n in names {
        if !seen.insert(n) {
            return Err(Error::Configuration(format!("duplicate {what} '{n}'")));
        }
    }
    Ok(())
}

/// Classified systematics of a validated config, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct SystematicPlan {
    /// Systematics that will be processed.
    pub systematics: Vec<Systematic>,
    /// Requested names dropped in favor of their split form.
    pub dropped: Vec<String>,
}

impl SystematicPlan {
    /// True for a nominal-only run.
    pub fn is_empty(&self) -> bool {
        self.systematics.is_empty()
    }
}
