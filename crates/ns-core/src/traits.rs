//! Collaborator traits
//!
//! The engine never computes selections, kinematic features or reweighting
//! factors itself. It reaches them through the traits below, generic over the
//! caller's event type, so that the accumulation logic does not depend on any
//! particular event format or detector-object calibration.

use crate::types::{EventKind, FeatureMap};

/// Minimal per-event information the engine reads directly.
pub trait EventRecord {
    /// Provenance of the event.
    fn kind(&self) -> EventKind;

    /// Weight before any reweighting factor (generator weight × normalization).
    fn base_weight(&self) -> f64;

    /// Generator-weight ratio (member / nominal) of ensemble member `member`
    /// of family `family` (e.g. one PDF replica). `None` if the event does not
    /// carry that member.
    fn ensemble_weight(&self, family: &str, member: usize) -> Option<f64>;
}

/// Event-selection predicate.
pub trait Selector<E: ?Sized> {
    /// Does `event` pass `selection` under `variation` (`"nominal"` or a
    /// variant name such as `"JECUp"`)? An undefined collection is a `false`.
    fn passes(&self, event: &E, selection: &str, variation: &str) -> bool;
}

/// Kinematic feature computation.
pub trait FeatureExtractor<E: ?Sized> {
    /// Features of `event` under `variation`. `None` when a collection the
    /// variation needs is undefined for this event.
    fn extract(&self, event: &E, variation: &str) -> Option<FeatureMap>;
}

/// Reweighting-factor computation.
pub trait Reweighter<E: ?Sized> {
    /// Nominal factor `name`.
    fn weight(&self, name: &str, event: &E) -> f64;

    /// Factor `name` with source `systematic` shifted up.
    fn weight_up(&self, name: &str, event: &E, systematic: &str) -> f64;

    /// Factor `name` with source `systematic` shifted down.
    fn weight_down(&self, name: &str, event: &E, systematic: &str) -> f64;

    /// Factor `name` recomputed under the jet hypothesis `jec_variation`.
    fn weight_jec_var(&self, name: &str, event: &E, jec_variation: &str) -> f64;
}

/// Per-sample metadata, read once (from the first readable event) before
/// the registry is initialized.
pub trait SampleMetadata {
    /// Number of ensemble members for `family` (0 if the sample has none).
    fn ensemble_size(&self, family: &str) -> usize;

    /// Discovered per-source names for `systematic` (JEC sources, b-tag
    /// systematic sources). Empty when nothing was discovered.
    fn sources(&self, systematic: &str) -> Vec<String>;

    /// Per-member cross-section ratio (member / nominal) for `family`.
    fn cross_section_ratios(&self, family: &str) -> Vec<f64>;

    /// Precomputed `(up, down)` normalization ratio bounds for `name`.
    fn norm_bounds(&self, name: &str) -> Option<(f64, f64)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flat(f64);

    impl EventRecord for Flat {
        fn kind(&self) -> EventKind {
            EventKind::Simulation
        }

        fn base_weight(&self) -> f64 {
            self.0
        }

        fn ensemble_weight(&self, _family: &str, _member: usize) -> Option<f64> {
            Some(1.0)
        }
    }

    struct PassAll;

    impl Selector<Flat> for PassAll {
        fn passes(&self, _event: &Flat, _selection: &str, _variation: &str) -> bool {
            true
        }
    }

    #[test]
    fn test_dummy_collaborators() {
        let ev = Flat(2.5);
        assert_eq!(ev.base_weight(), 2.5);
        assert!(ev.kind().is_simulation());
        assert!(PassAll.passes(&ev, "3l", "nominal"));
    }
}
