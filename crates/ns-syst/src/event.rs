//! EventAccumulator: fans one nominal evaluation out into every requested
//! variation and performs the resulting fills.
//!
//! Accumulator indices are resolved once, at construction, from the
//! registry's keyspace. The event loop then touches only those indices and
//! never creates or looks up keys by name.

use std::collections::HashMap;

use ns_core::{
    Error, EventKind, EventRecord, FeatureExtractor, FeatureMap, Result, Reweighter, Selector,
};

use crate::classifier::{BTAG_SHAPE_FACTOR, NOMINAL};
use crate::config::AnalysisConfig;
use crate::registry::{HistogramRegistry, VariantLayout, VariantPair};
use crate::sample::SampleInfo;
use crate::summary::RunSummary;

/// A guarded reweighting factor with `|value|` below this is pathological.
pub const GUARD_EPSILON: f64 = 1e-9;

/// Borrowed external collaborators.
pub struct Collaborators<'c, E: ?Sized> {
    /// Selection predicate.
    pub selector: &'c dyn Selector<E>,
    /// Feature computation.
    pub extractor: &'c dyn FeatureExtractor<E>,
    /// Reweighting factors.
    pub reweighter: &'c dyn Reweighter<E>,
}

impl<'c, E: ?Sized> Collaborators<'c, E> {
    /// Bundle the three collaborators.
    pub fn new(
        selector: &'c dyn Selector<E>,
        extractor: &'c dyn FeatureExtractor<E>,
        reweighter: &'c dyn Reweighter<E>,
    ) -> Self {
        Self { selector, extractor, reweighter }
    }
}

impl<E: ?Sized> Clone for Collaborators<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: ?Sized> Copy for Collaborators<'_, E> {}

/// Per-variable indices of one Up/Down pair.
#[derive(Debug, Clone)]
struct PairSlots {
    source: Option<String>,
    up_variation: String,
    down_variation: String,
    up: Vec<usize>,
    down: Vec<usize>,
}

#[derive(Debug, Clone)]
enum SystSlots {
    Acceptance { jet_energy: bool, pairs: Vec<PairSlots> },
    Reweight { factor: String, pairs: Vec<PairSlots> },
    Ensemble { family: String, members: Vec<Vec<usize>>, cross_section_ratios: Vec<f64> },
    Norm { bounds: Option<(f64, f64)>, pair: PairSlots },
}

#[derive(Debug, Clone)]
struct ProcessSlots {
    nominal: Vec<usize>,
    /// Per variable: every per-event variant (derived targets excluded).
    estimate: Vec<Vec<usize>>,
    systematics: Vec<SystSlots>,
}

/// Evaluates and fills one event at a time.
pub struct EventAccumulator<'c, E: ?Sized> {
    collab: Collaborators<'c, E>,
    config: &'c AnalysisConfig,
    variables: Vec<String>,
    slots: HashMap<String, ProcessSlots>,
    btag_active: bool,
    summary: RunSummary,
}

impl<'c, E: EventRecord + ?Sized> EventAccumulator<'c, E> {
    /// Resolve the fill plan of every registered process.
    pub fn new(
        registry: &HistogramRegistry,
        config: &'c AnalysisConfig,
        sample: &SampleInfo,
        collab: Collaborators<'c, E>,
    ) -> Result<Self> {
        let variables: Vec<String> = registry.variables().iter().map(|v| v.name.clone()).collect();
        let mut summary = RunSummary::default();

        for rs in registry.systematics() {
            if rs.systematic.kind.is_norm() && sample.norm_bounds_of(&rs.systematic.name).is_none() {
                log::warn!("no normalization bounds for '{}'; it stays empty", rs.systematic.name);
                summary.missing_norm_bounds += 1;
            }
        }

        let mut slots = HashMap::new();
        for process in registry.processes() {
            let per_var = |variant: &str| -> Result<Vec<usize>> {
                variables.iter().map(|v| registry.index_of(process, v, variant)).collect()
            };
            let pair_slots = |pair: &VariantPair| -> Result<PairSlots> {
                Ok(PairSlots {
                    source: pair.source.clone(),
                    up_variation: pair.up.clone(),
                    down_variation: pair.down.clone(),
                    up: per_var(&pair.up)?,
                    down: per_var(&pair.down)?,
                })
            };

            let mut systematics = Vec::with_capacity(registry.systematics().len());
            let mut estimate: Vec<Vec<usize>> = vec![Vec::new(); variables.len()];

            for rs in registry.systematics() {
                let s = &rs.systematic;
                for variant in rs.layout.filled_variant_names() {
                    for (slot, idx) in estimate.iter_mut().zip(per_var(variant)?) {
                        slot.push(idx);
                    }
                }

                let entry = match (&rs.layout, s.kind) {
                    (VariantLayout::Pairs(pairs), kind) if kind.changes_acceptance() => SystSlots::Acceptance {
                        jet_energy: s.is_jet_energy(),
                        pairs: pairs.iter().map(&pair_slots).collect::<Result<_>>()?,
                    },
                    (VariantLayout::Pairs(pairs), kind) if kind.is_reweight() => SystSlots::Reweight {
                        factor: s.factor().to_string(),
                        pairs: pairs.iter().map(&pair_slots).collect::<Result<_>>()?,
                    },
                    (VariantLayout::Pairs(pairs), kind) if kind.is_norm() => {
                        let pair = pairs.first().ok_or_else(|| {
                            Error::Validation(format!("norm systematic '{}' has no variants", s.name))
                        })?;
                        SystSlots::Norm { bounds: sample.norm_bounds_of(&s.name), pair: pair_slots(pair)? }
                    }
                    (VariantLayout::Ensemble { members, .. }, _) => SystSlots::Ensemble {
                        family: s.name.clone(),
                        members: members.iter().map(|m| per_var(m)).collect::<Result<_>>()?,
                        cross_section_ratios: (0..members.len())
                            .map(|i| sample.cross_section_ratio(&s.name, i))
                            .collect(),
                    },
                    (_, kind) => {
                        return Err(Error::Validation(format!(
                            "systematic '{}' ({kind}) has an inconsistent variant layout",
                            s.name
                        )));
                    }
                };
                systematics.push(entry);
            }

            slots.insert(
                process.clone(),
                ProcessSlots { nominal: per_var(NOMINAL)?, estimate, systematics },
            );
        }

        let btag_active = config.weight_factors.iter().any(|f| f == BTAG_SHAPE_FACTOR);
        Ok(Self { collab, config, variables, slots, btag_active, summary })
    }

    /// Process one event of `process`.
    ///
    /// Fails only if `process` was never registered; every per-event
    /// problem is recovered and counted.
    pub fn process(&mut self, registry: &mut HistogramRegistry, process: &str, event: &E) -> Result<()> {
        let slots = self.slots.get(process).ok_or_else(|| {
            Error::Precondition(format!("process '{process}' was not registered"))
        })?;
        let collab = self.collab;
        let config = self.config;
        let variables = &self.variables;
        let summary = &mut self.summary;

        summary.events += 1;
        let kind = event.kind();
        match kind {
            EventKind::Data => summary.data_events += 1,
            EventKind::DataDrivenEstimate => summary.estimate_events += 1,
            EventKind::Simulation => {}
        }

        // Reweighting factors only apply to simulation.
        let factors: Vec<(&str, f64)> = if kind.is_simulation() {
            config
                .weight_factors
                .iter()
                .map(|f| (f.as_str(), collab.reweighter.weight(f, event)))
                .collect()
        } else {
            Vec::new()
        };
        let base = event.base_weight();
        let nominal_weight = base * factors.iter().map(|(_, v)| v).product::<f64>();

        let mut nominal = evaluate(collab, config, event, NOMINAL, summary);
        if let (Some(cut), Some(features)) = (&config.score_cut, &nominal) {
            match features.get(&cut.variable) {
                Some(score) if score >= cut.min => {}
                Some(_) => nominal = None,
                None => {
                    summary.missing_features += 1;
                    nominal = None;
                }
            }
        }

        if let Some(features) = &nominal {
            summary.nominal_passed += 1;
            fill_all(registry, &slots.nominal, variables, features, nominal_weight, summary);
        }

        match kind {
            EventKind::Data => return Ok(()),
            EventKind::DataDrivenEstimate => {
                // No simulated-shape information: every variant gets the nominal fill.
                if let Some(features) = &nominal {
                    for (var, indices) in variables.iter().zip(&slots.estimate) {
                        for &idx in indices {
                            fill_one(registry, idx, var, features, nominal_weight, summary);
                        }
                    }
                }
                return Ok(());
            }
            EventKind::Simulation => {}
        }

        for guard in &config.guard_factors {
            let value = factors
                .iter()
                .find(|(name, _)| *name == guard.as_str())
                .map(|(_, v)| *v)
                .unwrap_or_else(|| collab.reweighter.weight(guard, event));
            if value.abs() < GUARD_EPSILON {
                log::debug!("factor '{guard}' = {value}: skipping systematics for this event");
                summary.pathological_reweights += 1;
                return Ok(());
            }
        }

        for syst in &slots.systematics {
            match syst {
                SystSlots::Acceptance { jet_energy, pairs } => {
                    let follow_jets = *jet_energy && self.btag_active;
                    for pair in pairs {
                        for (variation, indices) in
                            [(&pair.up_variation, &pair.up), (&pair.down_variation, &pair.down)]
                        {
                            // Each side stands alone: one failing does not block the other.
                            let Some(features) = evaluate(collab, config, event, variation, summary)
                            else {
                                continue;
                            };
                            let weight = if follow_jets {
                                base * factors
                                    .iter()
                                    .map(|(name, v)| {
                                        if *name == BTAG_SHAPE_FACTOR {
                                            collab.reweighter.weight_jec_var(name, event, variation)
                                        } else {
                                            *v
                                        }
                                    })
                                    .product::<f64>()
                            } else {
                                nominal_weight
                            };
                            fill_all(registry, indices, variables, &features, weight, summary);
                        }
                    }
                }
                SystSlots::Reweight { factor, pairs } => {
                    let Some(features) = &nominal else { continue };
                    let central = collab.reweighter.weight(factor, event);
                    for pair in pairs {
                        let source = pair.source.as_deref().unwrap_or(factor);
                        let up = collab.reweighter.weight_up(factor, event, source);
                        let down = collab.reweighter.weight_down(factor, event, source);
                        fill_all(registry, &pair.up, variables, features, nominal_weight * (up / central), summary);
                        fill_all(
                            registry,
                            &pair.down,
                            variables,
                            features,
                            nominal_weight * (down / central),
                            summary,
                        );
                    }
                }
                SystSlots::Ensemble { family, members, cross_section_ratios } => {
                    let Some(features) = &nominal else { continue };
                    for (i, indices) in members.iter().enumerate() {
                        let Some(ratio) = event.ensemble_weight(family, i) else {
                            summary.missing_member_weights += 1;
                            continue;
                        };
                        let weight = nominal_weight * ratio / cross_section_ratios[i];
                        fill_all(registry, indices, variables, features, weight, summary);
                    }
                }
                SystSlots::Norm { bounds, pair } => {
                    let (Some(features), Some((up, down))) = (&nominal, bounds) else { continue };
                    fill_all(registry, &pair.up, variables, features, nominal_weight * up, summary);
                    fill_all(registry, &pair.down, variables, features, nominal_weight * down, summary);
                }
            }
        }
        Ok(())
    }

    /// Counters so far.
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Finish the loop and hand back the counters.
    pub fn into_summary(self) -> RunSummary {
        self.summary
    }
}

/// Selection + features for one variation. A selector pass with undefined
/// features counts as a failed side.
fn evaluate<E: ?Sized>(
    collab: Collaborators<'_, E>,
    config: &AnalysisConfig,
    event: &E,
    variation: &str,
    summary: &mut RunSummary,
) -> Option<FeatureMap> {
    if !collab.selector.passes(event, &config.selection, variation) {
        return None;
    }
    if let Some(channel) = &config.channel
        && !collab.selector.passes(event, channel, variation)
    {
        return None;
    }
    let features = collab.extractor.extract(event, variation);
    if features.is_none() {
        summary.selection_inconsistencies += 1;
    }
    features
}

fn fill_all(
    registry: &mut HistogramRegistry,
    indices: &[usize],
    variables: &[String],
    features: &FeatureMap,
    weight: f64,
    summary: &mut RunSummary,
) {
    if !weight.is_finite() {
        summary.non_finite_fills += 1;
        return;
    }
    for (&idx, var) in indices.iter().zip(variables) {
        fill_one(registry, idx, var, features, weight, summary);
    }
}

fn fill_one(
    registry: &mut HistogramRegistry,
    idx: usize,
    variable: &str,
    features: &FeatureMap,
    weight: f64,
    summary: &mut RunSummary,
) {
    match features.get(variable) {
        Some(value) => {
            if !registry.at_mut(idx).fill(value, weight) {
                summary.non_finite_fills += 1;
            }
        }
        None => summary.missing_features += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorded::{Recorded, RecordedEvent, RecordedFactor};
    use ns_core::VariableSpec;

    fn setup(systs: &[&str], sample: &SampleInfo) -> (AnalysisConfig, HistogramRegistry) {
        let mut cfg = AnalysisConfig::new("3l")
            .process("ttZ")
            .variable(VariableSpec::new("pt", 0.0, 100.0, 10))
            .weight_factor("pileup")
            .weight_factor(BTAG_SHAPE_FACTOR);
        for s in systs {
            cfg = cfg.systematic(*s);
        }
        let plan = cfg.validate().unwrap();
        let reg =
            HistogramRegistry::initialize(&cfg.processes, &cfg.variables, &plan.systematics, sample).unwrap();
        (cfg, reg)
    }

    fn collab(rec: &Recorded) -> Collaborators<'_, RecordedEvent> {
        Collaborators::new(rec, rec, rec)
    }

    fn mc(pt: f64) -> RecordedEvent {
        RecordedEvent::new("ttZ", EventKind::Simulation, 1.0)
            .passing(NOMINAL, &["3l"])
            .with_features(NOMINAL, [("pt", pt)].into_iter().collect())
    }

    #[test]
    fn weight_systematic_uses_ratio() {
        let (cfg, mut reg) = setup(&["pileup"], &SampleInfo::new());
        let ev = mc(15.0).with_factor("pileup", RecordedFactor::new(2.0).up("pileup", 3.0).down("pileup", 1.0));
        let rec = Recorded;
        let mut acc = EventAccumulator::new(&reg, &cfg, &SampleInfo::new(), collab(&rec)).unwrap();
        acc.process(&mut reg, "ttZ", &ev).unwrap();
        assert_eq!(reg.get("ttZ", "pt", NOMINAL).unwrap().bin_content[1], 2.0);
        assert_eq!(reg.get("ttZ", "pt", "pileupUp").unwrap().bin_content[1], 3.0);
        assert_eq!(reg.get("ttZ", "pt", "pileupDown").unwrap().bin_content[1], 1.0);
    }

    #[test]
    fn jec_variation_recomputes_btag_factor() {
        let (cfg, mut reg) = setup(&["JEC"], &SampleInfo::new());
        let ev = mc(15.0)
            .passing("JECUp", &["3l"])
            .with_features("JECUp", [("pt", 25.0)].into_iter().collect())
            .with_factor(BTAG_SHAPE_FACTOR, RecordedFactor::new(0.5).jec("JECUp", 0.8));
        let rec = Recorded;
        let mut acc = EventAccumulator::new(&reg, &cfg, &SampleInfo::new(), collab(&rec)).unwrap();
        acc.process(&mut reg, "ttZ", &ev).unwrap();
        assert_eq!(reg.get("ttZ", "pt", NOMINAL).unwrap().bin_content[1], 0.5);
        assert_eq!(reg.get("ttZ", "pt", "JECUp").unwrap().bin_content[2], 0.8);
        // Down side fails its selection: not filled, and not an inconsistency.
        assert!(reg.get("ttZ", "pt", "JECDown").unwrap().is_empty());
        assert_eq!(acc.summary().selection_inconsistencies, 0);
    }

    #[test]
    fn pathological_factor_skips_systematics() {
        let (mut cfg, mut reg) = setup(&["pileup"], &SampleInfo::new());
        cfg.guard_factors.push("pileup".into());
        let ev = mc(15.0).with_factor("pileup", RecordedFactor::new(0.0).up("pileup", 1.0));
        let rec = Recorded;
        let mut acc = EventAccumulator::new(&reg, &cfg, &SampleInfo::new(), collab(&rec)).unwrap();
        acc.process(&mut reg, "ttZ", &ev).unwrap();
        assert_eq!(acc.summary().pathological_reweights, 1);
        assert!(reg.get("ttZ", "pt", "pileupUp").unwrap().is_empty());
        // Nominal is still filled (with weight 0).
        assert_eq!(reg.get("ttZ", "pt", NOMINAL).unwrap().entries, 1);
    }

    #[test]
    fn undefined_features_count_as_failed_side() {
        let (cfg, mut reg) = setup(&["JER"], &SampleInfo::new());
        let ev = mc(15.0).passing("JERUp", &["3l"]);
        let rec = Recorded;
        let mut acc = EventAccumulator::new(&reg, &cfg, &SampleInfo::new(), collab(&rec)).unwrap();
        acc.process(&mut reg, "ttZ", &ev).unwrap();
        assert_eq!(acc.summary().selection_inconsistencies, 1);
        assert!(reg.get("ttZ", "pt", "JERUp").unwrap().is_empty());
    }

    #[test]
    fn ensemble_members_divide_by_cross_section_ratio() {
        let sample = SampleInfo::new().with_ensemble("scale", 2).with_cross_section_ratios("scale", vec![2.0]);
        let (cfg, mut reg) = setup(&["scale"], &sample);
        let ev = mc(15.0).with_ensemble("scale", vec![1.0, 0.5]);
        let rec = Recorded;
        let mut acc = EventAccumulator::new(&reg, &cfg, &sample, collab(&rec)).unwrap();
        acc.process(&mut reg, "ttZ", &ev).unwrap();
        assert_eq!(reg.get("ttZ", "pt", "scale0").unwrap().bin_content[1], 0.5);
        assert_eq!(reg.get("ttZ", "pt", "scale1").unwrap().bin_content[1], 0.5);
        assert!(reg.get("ttZ", "pt", "scaleEnvUp").unwrap().is_empty());
    }

    #[test]
    fn norm_bounds_scale_nominal() {
        let sample = SampleInfo::new().with_norm_bounds("psNorm", 1.1, 0.8);
        let (cfg, mut reg) = setup(&["psNorm", "pdfNorm"], &sample);
        let rec = Recorded;
        let mut acc = EventAccumulator::new(&reg, &cfg, &sample, collab(&rec)).unwrap();
        assert_eq!(acc.summary().missing_norm_bounds, 1);
        acc.process(&mut reg, "ttZ", &mc(15.0)).unwrap();
        approx::assert_relative_eq!(reg.get("ttZ", "pt", "psNormUp").unwrap().bin_content[1], 1.1);
        approx::assert_relative_eq!(reg.get("ttZ", "pt", "psNormDown").unwrap().bin_content[1], 0.8);
        assert!(reg.get("ttZ", "pt", "pdfNormUp").unwrap().is_empty());
    }

    #[test]
    fn unknown_process_is_precondition_error() {
        let (cfg, mut reg) = setup(&[], &SampleInfo::new());
        let rec = Recorded;
        let mut acc = EventAccumulator::new(&reg, &cfg, &SampleInfo::new(), collab(&rec)).unwrap();
        let err = acc.process(&mut reg, "WZ", &mc(1.0)).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn split_btag_shape_fills_per_source() {
        let sample = SampleInfo::new().with_sources(BTAG_SHAPE_FACTOR, ["lf", "hf"]);
        let (cfg, mut reg) = setup(&[BTAG_SHAPE_FACTOR], &sample);
        let ev = mc(15.0).with_factor(
            BTAG_SHAPE_FACTOR,
            RecordedFactor::new(0.5).up("lf", 0.6).down("lf", 0.45).up("hf", 0.7).down("hf", 0.4),
        );
        let rec = Recorded;
        let mut acc = EventAccumulator::new(&reg, &cfg, &sample, collab(&rec)).unwrap();
        acc.process(&mut reg, "ttZ", &ev).unwrap();

        let bin = |variant: &str| reg.get("ttZ", "pt", variant).unwrap().bin_content[1];
        approx::assert_relative_eq!(bin(NOMINAL), 0.5);
        approx::assert_relative_eq!(bin("bTagShape_lfUp"), 0.6);
        approx::assert_relative_eq!(bin("bTagShape_lfDown"), 0.45);
        approx::assert_relative_eq!(bin("bTagShape_hfUp"), 0.7);
        approx::assert_relative_eq!(bin("bTagShape_hfDown"), 0.4);
        assert!(reg.get("ttZ", "pt", "bTagShapeUp").is_err());
    }

    #[test]
    fn split_electron_reco_reuses_nominal_features() {
        let sample = SampleInfo::new().with_sources("electronReco", ["ptBelow20", "ptAbove20"]);
        let (cfg, mut reg) = setup(&["electronReco"], &sample);
        let ev = mc(55.0).with_factor(
            "electronReco",
            RecordedFactor::new(0.9).up("ptBelow20", 0.99).down("ptAbove20", 0.81),
        );
        let rec = Recorded;
        let mut acc = EventAccumulator::new(&reg, &cfg, &sample, collab(&rec)).unwrap();
        acc.process(&mut reg, "ttZ", &ev).unwrap();

        // Not a weight factor: nominal weight is 1, variants scale by varied / nominal.
        let bin = |variant: &str| reg.get("ttZ", "pt", variant).unwrap().bin_content[5];
        approx::assert_relative_eq!(bin(NOMINAL), 1.0);
        approx::assert_relative_eq!(bin("electronReco_ptBelow20Up"), 1.1);
        approx::assert_relative_eq!(bin("electronReco_ptBelow20Down"), 1.0);
        approx::assert_relative_eq!(bin("electronReco_ptAbove20Up"), 1.0);
        approx::assert_relative_eq!(bin("electronReco_ptAbove20Down"), 0.9);
    }

    #[test]
    fn jec_split_fills_each_source_independently() {
        let sample = SampleInfo::new().with_sources("JECSplit", ["Absolute", "FlavorQCD"]);
        let (cfg, mut reg) = setup(&["JECSplit"], &sample);
        let ev = mc(15.0)
            .passing("JECSplit_AbsoluteUp", &["3l"])
            .with_features("JECSplit_AbsoluteUp", [("pt", 25.0)].into_iter().collect())
            .passing("JECSplit_FlavorQCDDown", &["3l"])
            .with_features("JECSplit_FlavorQCDDown", [("pt", 35.0)].into_iter().collect())
            .with_factor(BTAG_SHAPE_FACTOR, RecordedFactor::new(0.5).jec("JECSplit_AbsoluteUp", 0.8));
        let rec = Recorded;
        let mut acc = EventAccumulator::new(&reg, &cfg, &sample, collab(&rec)).unwrap();
        acc.process(&mut reg, "ttZ", &ev).unwrap();

        assert_eq!(reg.get("ttZ", "pt", "JECSplit_AbsoluteUp").unwrap().bin_content[2], 0.8);
        assert_eq!(reg.get("ttZ", "pt", "JECSplit_FlavorQCDDown").unwrap().bin_content[3], 0.5);
        assert!(reg.get("ttZ", "pt", "JECSplit_AbsoluteDown").unwrap().is_empty());
        assert!(reg.get("ttZ", "pt", "JECSplit_FlavorQCDUp").unwrap().is_empty());
        assert!(reg.get("ttZ", "pt", "JECUp").is_err());
    }
}
