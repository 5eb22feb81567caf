//! Output sanitization: negative-bin clipping and empty-histogram guards.

use std::collections::BTreeSet;

use ns_core::{Result, VariableSpec};

use crate::accumulator::Accumulator;
use crate::classifier::NOMINAL;
use crate::config::AnalysisConfig;
use crate::registry::{HistogramRegistry, SlotRole};
use crate::summary::RunSummary;

/// Content placed in the first bin of an otherwise empty nominal.
pub const EMPTY_PLACEHOLDER: f64 = 1e-6;

/// A variant whose total is smaller in magnitude than this counts as empty.
pub const NEAR_ZERO_TOTAL: f64 = 1e-12;

/// Set every negative bin (content and error) to zero. Returns the number of
/// bins clipped.
pub fn clip(acc: &mut Accumulator) -> u64 {
    let mut clipped = 0;
    for (content, sumw2) in acc.bin_content.iter_mut().zip(acc.sumw2.iter_mut()) {
        if *content < 0.0 {
            *content = 0.0;
            *sumw2 = 0.0;
            clipped += 1;
        }
    }
    clipped
}

/// Guard one (process, variable) against empty outputs.
///
/// An unfilled nominal gets [`EMPTY_PLACEHOLDER`] in its first bin, then
/// every unfilled or zero-total variant becomes a copy of the nominal.
/// Returns the number of accumulators changed.
pub fn guard_empty(registry: &mut HistogramRegistry, process: &str, variable: &str) -> Result<u64> {
    let nominal_idx = registry.index_of(process, variable, NOMINAL)?;
    if !registry.at(nominal_idx).is_empty() {
        return Ok(0);
    }

    let mut changed = 1;
    let nominal = {
        let acc = registry.at_mut(nominal_idx);
        acc.bin_content.fill(0.0);
        acc.sumw2.fill(0.0);
        acc.bin_content[0] = EMPTY_PLACEHOLDER;
        acc.clone()
    };
    for idx in registry.variant_indices(process, variable)? {
        let acc = registry.at_mut(idx);
        if acc.is_empty() || acc.total().abs() < NEAR_ZERO_TOTAL {
            acc.copy_contents(&nominal);
            changed += 1;
        }
    }
    Ok(changed)
}

/// Applies clipping and empty guards before output.
#[derive(Debug, Clone, Default)]
pub struct OutputSanitizer {
    estimate_processes: BTreeSet<String>,
}

impl OutputSanitizer {
    /// Sanitizer for a run of `config`.
    pub fn new(config: &AnalysisConfig) -> Self {
        Self { estimate_processes: config.estimate_processes.iter().cloned().collect() }
    }

    /// Clipping would distort fine-grained inputs to later rebinning and the
    /// signed contributions of data-driven estimates.
    pub fn clips(&self, process: &str, variable: &VariableSpec) -> bool {
        !variable.fine_grained && !self.estimate_processes.contains(process)
    }

    /// Members are dropped from the output unless the variable retains them.
    pub fn keeps(&self, role: SlotRole, variable: &VariableSpec) -> bool {
        role != SlotRole::Member || variable.retain_members
    }

    /// Clip, then guard every (process, variable) of `registry`.
    pub fn sanitize(&self, registry: &mut HistogramRegistry, summary: &mut RunSummary) -> Result<()> {
        let variables = registry.variables().to_vec();
        let processes = registry.processes().to_vec();

        for idx in 0..registry.len() {
            let key = registry.key_at(idx);
            let Some(spec) = variables.iter().find(|v| v.name == key.variable) else {
                continue;
            };
            if self.clips(&key.process, spec) {
                summary.clipped_bins += clip(registry.at_mut(idx));
            }
        }

        for p in &processes {
            for v in &variables {
                let changed = guard_empty(registry, p, &v.name)?;
                if changed > 0 {
                    log::debug!("{p}/{}: empty nominal, {changed} placeholder(s) set", v.name);
                    summary.empty_placeholders += changed;
                }
            }
        }
        Ok(())
    }
}
