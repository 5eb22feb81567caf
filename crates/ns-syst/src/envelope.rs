//! Envelope and RMS targets derived from ensemble members after the loop.

use ns_core::Result;

use crate::accumulator::Accumulator;
use crate::registry::{EnsembleGroup, HistogramRegistry};
use crate::summary::RunSummary;

/// Members that received at least one fill.
fn valid_members<'r>(registry: &'r HistogramRegistry, group: &EnsembleGroup) -> Vec<&'r Accumulator> {
    group.members.iter().map(|&i| registry.at(i)).filter(|m| !m.is_empty()).collect()
}

/// Set the envelope targets of `group`: per bin, the max (Up) and min (Down)
/// over the nominal and every valid member. With no valid member both
/// targets equal the nominal.
pub fn envelope(registry: &mut HistogramRegistry, group: &EnsembleGroup) {
    let Some((up_idx, down_idx)) = group.envelope else {
        return;
    };
    let nominal = registry.at(group.nominal);
    let mut up = nominal.clone();
    let mut down = nominal.clone();
    for member in valid_members(registry, group) {
        for (b, &c) in member.bin_content.iter().enumerate() {
            up.bin_content[b] = up.bin_content[b].max(c);
            down.bin_content[b] = down.bin_content[b].min(c);
        }
    }
    registry.at_mut(up_idx).copy_contents(&up);
    registry.at_mut(down_idx).copy_contents(&down);
}

/// Set the RMS targets of `group`: nominal ± the per-bin root mean square
/// deviation of the valid members from nominal (0 with no valid member).
pub fn rms(registry: &mut HistogramRegistry, group: &EnsembleGroup) {
    let Some((up_idx, down_idx)) = group.rms else {
        return;
    };
    let nominal = registry.at(group.nominal);
    let members = valid_members(registry, group);
    let mut up = nominal.clone();
    let mut down = nominal.clone();
    if !members.is_empty() {
        let n = members.len() as f64;
        for (b, &nom) in nominal.bin_content.iter().enumerate() {
            let sum_sq: f64 = members.iter().map(|m| (m.bin_content[b] - nom).powi(2)).sum();
            let spread = (sum_sq / n).sqrt();
            up.bin_content[b] = nom + spread;
            down.bin_content[b] = nom - spread;
        }
    }
    registry.at_mut(up_idx).copy_contents(&up);
    registry.at_mut(down_idx).copy_contents(&down);
}

/// Runs [`envelope`] and [`rms`] over every ensemble group of a registry.
pub struct EnvelopeAggregator;

impl EnvelopeAggregator {
    /// Derive every envelope/RMS target. Groups whose nominal was filled but
    /// none of whose members were are reported as degenerate.
    pub fn run(registry: &mut HistogramRegistry, summary: &mut RunSummary) -> Result<()> {
        let groups = registry.ensemble_groups()?;
        for group in &groups {
            let nominal_filled = !registry.at(group.nominal).is_empty();
            if nominal_filled && valid_members(registry, group).is_empty() {
                log::warn!(
                    "ensemble '{}' has no filled member for {}/{}; derived targets equal nominal",
                    group.base,
                    group.process,
                    group.variable
                );
                summary.degenerate_ensembles += 1;
            }
            envelope(registry, group);
            rms(registry, group);
        }
        log::debug!("derived {} ensemble group(s)", groups.len());
        Ok(())
    }
}
