//! End-of-run accounting of every recoverable condition.

use serde::{Deserialize, Serialize};

/// Counters accumulated over the event loop and the finalization pass.
///
/// Counters are plain sums, so shard summaries merge by addition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Events handed to the event accumulator.
    pub events: u64,
    /// Events passing the nominal selection.
    pub nominal_passed: u64,
    /// Genuine collision-data events.
    pub data_events: u64,
    /// Data-driven estimate events.
    pub estimate_events: u64,
    /// Events whose systematic processing was skipped because a guarded
    /// reweighting factor was (near) zero.
    pub pathological_reweights: u64,
    /// Variations that failed because a required collection was undefined.
    pub selection_inconsistencies: u64,
    /// Fills skipped because the weight or value was not a finite number.
    pub non_finite_fills: u64,
    /// Fills skipped because the feature map lacked the variable.
    pub missing_features: u64,
    /// Ensemble member fills skipped because the event lacked the member weight.
    pub missing_member_weights: u64,
    /// Normalization systematics without precomputed bounds.
    pub missing_norm_bounds: u64,
    /// Ensemble groups that degenerated to nominal.
    pub degenerate_ensembles: u64,
    /// Negative bins clipped to zero.
    pub clipped_bins: u64,
    /// Accumulators set to the empty-histogram placeholder.
    pub empty_placeholders: u64,
}

impl RunSummary {
    /// Add another summary (e.g. from a shard).
    pub fn merge(&mut self, other: &RunSummary) {
        self.events += other.events;
        self.nominal_passed += other.nominal_passed;
        self.data_events += other.data_events;
        self.estimate_events += other.estimate_events;
        self.pathological_reweights += other.pathological_reweights;
        self.selection_inconsistencies += other.selection_inconsistencies;
        self.non_finite_fills += other.non_finite_fills;
        self.missing_features += other.missing_features;
        self.missing_member_weights += other.missing_member_weights;
        self.missing_norm_bounds += other.missing_norm_bounds;
        self.degenerate_ensembles += other.degenerate_ensembles;
        self.clipped_bins += other.clipped_bins;
        self.empty_placeholders += other.empty_placeholders;
    }

    /// Total count of recoverable conditions that skipped a fill or forced a
    /// fallback value.
    pub fn recoveries(&self) -> u64 {
        self.pathological_reweights
            + self.selection_inconsistencies
            + self.non_finite_fills
            + self.missing_features
            + self.missing_member_weights
            + self.missing_norm_bounds
            + self.degenerate_ensembles
            + self.empty_placeholders
    }

    /// Log the summary; `warn` if anything was recovered.
    pub fn log_report(&self) {
        log::info!(
            "processed {} event(s): {} passed nominal, {} data, {} estimate",
            self.events,
            self.nominal_passed,
            self.data_events,
            self.estimate_events
        );
        if self.recoveries() == 0 {
            return;
        }
        log::warn!(
            "recovered conditions: pathological_reweights={} selection_inconsistencies={} \
             non_finite_fills={} missing_features={} missing_member_weights={} \
             missing_norm_bounds={} degenerate_ensembles={} empty_placeholders={}",
            self.pathological_reweights,
            self.selection_inconsistencies,
            self.non_finite_fills,
            self.missing_features,
            self.missing_member_weights,
            self.missing_norm_bounds,
            self.degenerate_ensembles,
            self.empty_placeholders
        );
    }
}
