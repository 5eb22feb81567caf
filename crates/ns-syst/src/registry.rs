//! HistogramRegistry: the complete, fixed keyspace of accumulators.
//!
//! Every key that will ever be filled is created by [`HistogramRegistry::initialize`].
//! Storage is a flat arena addressed by index, with a key → index table
//! built once; lookups of unknown keys are precondition violations and never
//! create anything.

use std::collections::{HashMap, HashSet};
use std::fmt;

use ns_core::{Error, Result, VariableSpec};
use serde::{Deserialize, Serialize};

use crate::accumulator::Accumulator;
use crate::classifier::{NOMINAL, Systematic, SystematicKind};
use crate::sample::{SampleInfo, needs_metadata};

/// `(process, variable, variant)`: unique, total identifier of an accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccumulatorKey {
    /// Process name.
    pub process: String,
    /// Variable name.
    pub variable: String,
    /// `"nominal"` or a variant name such as `"pileupUp"`.
    pub variant: String,
}

impl AccumulatorKey {
    /// Build a key.
    pub fn new(process: &str, variable: &str, variant: &str) -> Self {
        Self { process: process.into(), variable: variable.into(), variant: variant.into() }
    }
}

impl fmt::Display for AccumulatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.process, self.variable, self.variant)
    }
}

/// One Up/Down variant pair of a systematic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantPair {
    /// Source name for split systematics.
    pub source: Option<String>,
    /// Up variant name (also the variation name handed to collaborators).
    pub up: String,
    /// Down variant name.
    pub down: String,
}

impl VariantPair {
    fn new(name: &str, source: Option<&str>) -> Self {
        let stem = match source {
            Some(src) => format!("{name}_{src}"),
            None => name.to_string(),
        };
        Self { source: source.map(str::to_string), up: format!("{stem}Up"), down: format!("{stem}Down") }
    }
}

/// Variant names a systematic owns for every (process, variable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantLayout {
    /// Up/Down pairs (one per source for split kinds).
    Pairs(Vec<VariantPair>),
    /// N members plus derived Envelope and/or RMS targets.
    Ensemble {
        /// `<name>0 … <name>(N-1)`.
        members: Vec<String>,
        /// `(<name>EnvUp, <name>EnvDown)`.
        envelope: Option<(String, String)>,
        /// `(<name>RMSUp, <name>RMSDown)`.
        rms: Option<(String, String)>,
    },
}

impl VariantLayout {
    /// Lay out the variants of `systematic` for a sample.
    pub fn of(systematic: &Systematic, sample: &SampleInfo) -> Self {
        let name = systematic.name.as_str();
        match systematic.kind {
            SystematicKind::Acceptance | SystematicKind::Weight => {
                VariantLayout::Pairs(vec![VariantPair::new(name, None)])
            }
            SystematicKind::LheNorm | SystematicKind::PsNorm => {
                VariantLayout::Pairs(vec![VariantPair::new(name, None)])
            }
            SystematicKind::JecSplit => VariantLayout::Pairs(
                sample.sources_of(name).iter().map(|s| VariantPair::new(name, Some(s.as_str()))).collect(),
            ),
            SystematicKind::BTagShape | SystematicKind::ElectronReco => {
                let sources = sample.sources_of(name);
                if sources.is_empty() {
                    VariantLayout::Pairs(vec![VariantPair::new(name, None)])
                } else {
                    VariantLayout::Pairs(
                        sources.iter().map(|s| VariantPair::new(name, Some(s.as_str()))).collect(),
                    )
                }
            }
            SystematicKind::LheEnsemble | SystematicKind::PsEnsemble => {
                let n = sample.ensemble_size(name);
                let stats = systematic.statistics;
                VariantLayout::Ensemble {
                    members: (0..n).map(|i| format!("{name}{i}")).collect(),
                    envelope: stats
                        .envelope
                        .then(|| (format!("{name}EnvUp"), format!("{name}EnvDown"))),
                    rms: stats.rms.then(|| (format!("{name}RMSUp"), format!("{name}RMSDown"))),
                }
            }
        }
    }

    /// All variant names, in registration order.
    pub fn variant_names(&self) -> Vec<&str> {
        match self {
            VariantLayout::Pairs(pairs) => {
                pairs.iter().flat_map(|p| [p.up.as_str(), p.down.as_str()]).collect()
            }
            VariantLayout::Ensemble { members, envelope, rms } => {
                let mut out: Vec<&str> = members.iter().map(String::as_str).collect();
                for (up, down) in envelope.iter().chain(rms.iter()) {
                    out.push(up);
                    out.push(down);
                }
                out
            }
        }
    }

    /// Variants filled per event (derived targets excluded).
    pub fn filled_variant_names(&self) -> Vec<&str> {
        match self {
            VariantLayout::Pairs(_) => self.variant_names(),
            VariantLayout::Ensemble { members, .. } => members.iter().map(String::as_str).collect(),
        }
    }
}

/// A systematic together with its variant layout for the current sample.
#[derive(Debug, Clone)]
pub struct RegisteredSystematic {
    /// Classified systematic.
    pub systematic: Systematic,
    /// Its variants.
    pub layout: VariantLayout,
}

/// Indices of one ensemble for one (process, variable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsembleGroup {
    /// Base systematic name.
    pub base: String,
    /// Process.
    pub process: String,
    /// Variable.
    pub variable: String,
    /// Nominal accumulator.
    pub nominal: usize,
    /// Member accumulators.
    pub members: Vec<usize>,
    /// `(up, down)` envelope targets.
    pub envelope: Option<(usize, usize)>,
    /// `(up, down)` RMS targets.
    pub rms: Option<(usize, usize)>,
}

/// Role of an accumulator in the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    /// Nominal.
    Nominal,
    /// Up/Down variant filled per event.
    Variant,
    /// Ensemble member.
    Member,
    /// Envelope/RMS target derived after the loop.
    Derived,
}

/// Owner of every accumulator of a sample.
#[derive(Debug, Clone)]
pub struct HistogramRegistry {
    processes: Vec<String>,
    variables: Vec<VariableSpec>,
    systematics: Vec<RegisteredSystematic>,
    keys: Vec<AccumulatorKey>,
    roles: Vec<SlotRole>,
    accumulators: Vec<Accumulator>,
    index: HashMap<AccumulatorKey, usize>,
}

impl HistogramRegistry {
    /// Build the full keyspace for `processes` × `variables` and every
    /// variant of `systematics` given the sample's ensemble sizes and
    /// discovered sources.
    pub fn initialize(
        processes: &[String],
        variables: &[VariableSpec],
        systematics: &[Systematic],
        sample: &SampleInfo,
    ) -> Result<Self> {
        for v in variables {
            v.validate()?;
        }

        let registered: Vec<RegisteredSystematic> = systematics
            .iter()
            .map(|s| {
                let layout = VariantLayout::of(s, sample);
                if needs_metadata(s.kind) && layout.filled_variant_names().is_empty() {
                    log::warn!(
                        "systematic '{}' ({}) has no members/sources in this sample",
                        s.name,
                        s.kind
                    );
                }
                RegisteredSystematic { systematic: s.clone(), layout }
            })
            .collect();

        let mut reg = Self {
            processes: processes.to_vec(),
            variables: variables.to_vec(),
            systematics: Vec::new(),
            keys: Vec::new(),
            roles: Vec::new(),
            accumulators: Vec::new(),
            index: HashMap::new(),
        };

        for p in processes {
            for v in variables {
                reg.insert(p, v, NOMINAL, SlotRole::Nominal)?;
                for rs in &registered {
                    match &rs.layout {
                        VariantLayout::Pairs(pairs) => {
                            for pair in pairs {
                                reg.insert(p, v, &pair.up, SlotRole::Variant)?;
                                reg.insert(p, v, &pair.down, SlotRole::Variant)?;
                            }
                        }
                        VariantLayout::Ensemble { members, envelope, rms } => {
                            for m in members {
                                reg.insert(p, v, m, SlotRole::Member)?;
                            }
                            for (up, down) in envelope.iter().chain(rms.iter()) {
                                reg.insert(p, v, up, SlotRole::Derived)?;
                                reg.insert(p, v, down, SlotRole::Derived)?;
                            }
                        }
                    }
                }
            }
        }
        reg.systematics = registered;

        // Distinct keys can still render to one persisted name.
        let mut names = HashSet::with_capacity(reg.keys.len());
        if let Some(name) = reg.keys.iter().map(ToString::to_string).find(|n| !names.insert(n.clone())) {
            return Err(Error::Configuration(format!(
                "histogram name '{name}' is produced by more than one accumulator key"
            )));
        }

        log::info!(
            "registry initialized: {} process(es) x {} variable(s), {} systematic(s), {} accumulators",
            reg.processes.len(),
            reg.variables.len(),
            reg.systematics.len(),
            reg.accumulators.len()
        );
        Ok(reg)
    }

    fn insert(&mut self, process: &str, var: &VariableSpec, variant: &str, role: SlotRole) -> Result<()> {
        let key = AccumulatorKey::new(process, &var.name, variant);
        if self.index.contains_key(&key) {
            return Err(Error::Configuration(format!("accumulator key '{key}' registered twice")));
        }
        self.index.insert(key.clone(), self.accumulators.len());
        self.keys.push(key);
        self.roles.push(role);
        self.accumulators.push(Accumulator::new(var));
        Ok(())
    }

    /// Index of a registered key.
    pub fn index_of(&self, process: &str, variable: &str, variant: &str) -> Result<usize> {
        let key = AccumulatorKey::new(process, variable, variant);
        self.index.get(&key).copied().ok_or_else(|| {
            Error::Precondition(format!("accumulator '{key}' was not registered"))
        })
    }

    /// Accumulator of a registered key.
    pub fn get(&self, process: &str, variable: &str, variant: &str) -> Result<&Accumulator> {
        let i = self.index_of(process, variable, variant)?;
        Ok(&self.accumulators[i])
    }

    /// Mutable accumulator of a registered key.
    pub fn get_mut(&mut self, process: &str, variable: &str, variant: &str) -> Result<&mut Accumulator> {
        let i = self.index_of(process, variable, variant)?;
        Ok(&mut self.accumulators[i])
    }

    /// Accumulator at an index obtained from [`Self::index_of`].
    pub fn at(&self, index: usize) -> &Accumulator {
        &self.accumulators[index]
    }

    /// Mutable accumulator at an index obtained from [`Self::index_of`].
    pub fn at_mut(&mut self, index: usize) -> &mut Accumulator {
        &mut self.accumulators[index]
    }

    /// Key at an index.
    pub fn key_at(&self, index: usize) -> &AccumulatorKey {
        &self.keys[index]
    }

    /// Role at an index.
    pub fn role_at(&self, index: usize) -> SlotRole {
        self.roles[index]
    }

    /// Number of accumulators.
    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    /// True if nothing was registered.
    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }

    /// Keys in registration order.
    pub fn keys(&self) -> &[AccumulatorKey] {
        &self.keys
    }

    /// `(key, accumulator)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&AccumulatorKey, &Accumulator)> {
        self.keys.iter().zip(&self.accumulators)
    }

    /// Registered processes.
    pub fn processes(&self) -> &[String] {
        &self.processes
    }

    /// Registered variables.
    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    /// Registered systematics with their layouts.
    pub fn systematics(&self) -> &[RegisteredSystematic] {
        &self.systematics
    }

    /// Indices of every non-nominal accumulator of `(process, variable)`.
    pub fn variant_indices(&self, process: &str, variable: &str) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        for rs in &self.systematics {
            for variant in rs.layout.variant_names() {
                out.push(self.index_of(process, variable, variant)?);
            }
        }
        Ok(out)
    }

    /// Every ensemble group: one per (ensemble systematic, process, variable).
    pub fn ensemble_groups(&self) -> Result<Vec<EnsembleGroup>> {
        let mut groups = Vec::new();
        for rs in &self.systematics {
            let VariantLayout::Ensemble { members, envelope, rms } = &rs.layout else {
                continue;
            };
            for p in &self.processes {
                for v in &self.variables {
                    let idx = |variant: &str| self.index_of(p, &v.name, variant);
                    let pair = |t: &Option<(String, String)>| -> Result<Option<(usize, usize)>> {
                        match t {
                            Some((up, down)) => Ok(Some((idx(up)?, idx(down)?))),
                            None => Ok(None),
                        }
                    };
                    groups.push(EnsembleGroup {
                        base: rs.systematic.name.clone(),
                        process: p.clone(),
                        variable: v.name.clone(),
                        nominal: idx(NOMINAL)?,
                        members: members.iter().map(|m| idx(m)).collect::<Result<_>>()?,
                        envelope: pair(envelope)?,
                        rms: pair(rms)?,
                    });
                }
            }
        }
        Ok(groups)
    }

    /// Add `other` bin by bin. Both registries must share the keyspace
    /// (e.g. shards cloned from one template).
    pub fn merge(&mut self, other: &HistogramRegistry) -> Result<()> {
        if self.keys != other.keys {
            return Err(Error::Precondition(format!(
                "cannot merge registries with different keyspaces ({} vs {} keys)",
                self.keys.len(),
                other.keys.len()
            )));
        }
        for (a, b) in self.accumulators.iter_mut().zip(&other.accumulators) {
            a.add(b)?;
        }
        Ok(())
    }

    /// Consume the registry into its keys, roles and accumulators.
    pub(crate) fn into_parts(self) -> (Vec<VariableSpec>, Vec<AccumulatorKey>, Vec<SlotRole>, Vec<Accumulator>) {
        (self.variables, self.keys, self.roles, self.accumulators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn systs(names: &[&str]) -> Vec<Systematic> {
        names.iter().map(|n| Systematic::classify(n).unwrap()).collect()
    }

    fn pt() -> Vec<VariableSpec> {
        vec![VariableSpec::new("pt", 0.0, 100.0, 10)]
    }

    #[test]
    fn nominal_exists_for_every_pair() {
        let procs = vec!["ttZ".to_string(), "WZ".to_string()];
        let vars = vec![VariableSpec::new("pt", 0.0, 100.0, 10), VariableSpec::new("m", 0.0, 1.0, 2)];
        let reg = HistogramRegistry::initialize(&procs, &vars, &[], &SampleInfo::new()).unwrap();
        assert_eq!(reg.len(), 4);
        for p in &procs {
            for v in &vars {
                assert!(reg.get(p, &v.name, NOMINAL).unwrap().is_empty());
            }
        }
    }

    #[test]
    fn weight_pair_and_unregistered_key() {
        let reg = HistogramRegistry::initialize(
            &["ttZ".to_string()],
            &pt(),
            &systs(&["pileup"]),
            &SampleInfo::new(),
        )
        .unwrap();
        assert_eq!(reg.get("ttZ", "pt", "pileupUp").unwrap().entries, 0);
        assert_eq!(reg.get("ttZ", "pt", "pileupDown").unwrap().entries, 0);
        let err = reg.get("ttZ", "pt", "unregisteredUp").unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn split_and_ensemble_layouts() {
        let sample = SampleInfo::new()
            .with_sources("JECSplit", ["Absolute", "FlavorQCD"])
            .with_sources("bTagShape", ["lf", "hf"])
            .with_ensemble("pdf", 3)
            .with_ensemble("scale", 2);
        let reg = HistogramRegistry::initialize(
            &["ttZ".to_string()],
            &pt(),
            &systs(&["JECSplit", "bTagShape", "electronReco", "pdf", "scale", "pdfNorm"]),
            &sample,
        )
        .unwrap();

        let names: Vec<&str> = reg.keys().iter().map(|k| k.variant.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "nominal",
                "JECSplit_AbsoluteUp",
                "JECSplit_AbsoluteDown",
                "JECSplit_FlavorQCDUp",
                "JECSplit_FlavorQCDDown",
                "bTagShape_lfUp",
                "bTagShape_lfDown",
                "bTagShape_hfUp",
                "bTagShape_hfDown",
                "electronRecoUp",
                "electronRecoDown",
                "pdf0",
                "pdf1",
                "pdf2",
                "pdfEnvUp",
                "pdfEnvDown",
                "pdfRMSUp",
                "pdfRMSDown",
                "scale0",
                "scale1",
                "scaleEnvUp",
                "scaleEnvDown",
                "pdfNormUp",
                "pdfNormDown",
            ]
        );
        assert!(reg.get("ttZ", "pt", "JECUp").is_err());
        assert_eq!(reg.role_at(reg.index_of("ttZ", "pt", "pdf1").unwrap()), SlotRole::Member);
        assert_eq!(reg.role_at(reg.index_of("ttZ", "pt", "pdfEnvUp").unwrap()), SlotRole::Derived);

        let groups = reg.ensemble_groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].members.len(), 3);
        assert!(groups[0].rms.is_some());
        assert!(groups[1].rms.is_none());
        assert_eq!(reg.variant_indices("ttZ", "pt").unwrap().len(), 23);
    }

    #[test]
    fn zero_member_ensemble_keeps_targets() {
        let reg = HistogramRegistry::initialize(
            &["ttZ".to_string()],
            &pt(),
            &systs(&["pdf"]),
            &SampleInfo::new(),
        )
        .unwrap();
        assert!(reg.get("ttZ", "pt", "pdfEnvUp").is_ok());
        assert!(reg.get("ttZ", "pt", "pdf0").is_err());
        assert!(reg.ensemble_groups().unwrap()[0].members.is_empty());
    }

    #[test]
    fn merge_requires_same_keyspace() {
        let procs = vec!["ttZ".to_string()];
        let template =
            HistogramRegistry::initialize(&procs, &pt(), &systs(&["pileup"]), &SampleInfo::new())
                .unwrap();
        let mut a = template.clone();
        let mut b = template.clone();
        a.get_mut("ttZ", "pt", NOMINAL).unwrap().fill(5.0, 1.0);
        b.get_mut("ttZ", "pt", NOMINAL).unwrap().fill(5.0, 2.0);
        a.merge(&b).unwrap();
        assert_eq!(a.get("ttZ", "pt", NOMINAL).unwrap().bin_content[0], 3.0);

        let other = HistogramRegistry::initialize(&procs, &pt(), &[], &SampleInfo::new()).unwrap();
        assert!(matches!(a.merge(&other), Err(Error::Precondition(_))));
    }

    #[test]
    fn colliding_persisted_names_are_rejected() {
        let procs = vec!["t_t".to_string(), "t".to_string()];
        let vars = vec![VariableSpec::new("x", 0.0, 1.0, 1), VariableSpec::new("t_x", 0.0, 1.0, 1)];
        let err = HistogramRegistry::initialize(&procs, &vars, &[], &SampleInfo::new()).unwrap_err();
        match err {
            Error::Configuration(msg) => assert!(msg.contains("t_t_x_nominal"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }

        // Underscores alone are fine when the names stay distinct.
        let procs = vec!["t_t".to_string()];
        assert!(HistogramRegistry::initialize(&procs, &vars, &[], &SampleInfo::new()).is_ok());
    }

    #[test]
    fn key_display() {
        assert_eq!(AccumulatorKey::new("ttZ", "pt", "JECUp").to_string(), "ttZ_pt_JECUp");
    }
}
