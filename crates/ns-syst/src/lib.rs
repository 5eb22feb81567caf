//! # ns-syst
//!
//! Systematic-variation histogram accumulation.
//!
//! One pass over a sample's events fills, for every configured
//! (process, variable), a nominal histogram and one histogram per
//! systematic variant:
//!
//! 1. [`AnalysisConfig::validate`] classifies every requested systematic
//!    ([`classifier`]) and fails fast on anything unknown.
//! 2. [`HistogramRegistry::initialize`] creates the complete keyspace.
//! 3. [`EventAccumulator`] evaluates each event once for nominal and fans
//!    out into every variation ([`run_sequential`] / [`run_sharded`]).
//! 4. [`finalize`] derives envelope/RMS targets ([`EnvelopeAggregator`]),
//!    clips and guards outputs ([`OutputSanitizer`]) and drops unretained
//!    ensemble members.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accumulator;
pub mod classifier;
pub mod config;
pub mod envelope;
pub mod event;
pub mod output;
pub mod recorded;
pub mod registry;
pub mod runner;
pub mod sample;
pub mod sanitize;
pub mod summary;

pub use accumulator::Accumulator;
pub use classifier::{
    BTAG_SHAPE_FACTOR, EnsembleStatistics, NOMINAL, Systematic, SystematicKind, classify,
};
pub use config::{AnalysisConfig, ScoreCut, SystematicPlan};
pub use envelope::EnvelopeAggregator;
pub use event::{Collaborators, EventAccumulator};
pub use output::{FinalizedHistogram, FinalizedHistograms, RunOutput, finalize};
pub use recorded::{FirstEventMetadata, Recorded, RecordedEvent, RecordedFactor};
pub use registry::{AccumulatorKey, HistogramRegistry, SlotRole, VariantLayout, VariantPair};
pub use runner::{run_sequential, run_sharded};
pub use sample::SampleInfo;
pub use sanitize::OutputSanitizer;
pub use summary::RunSummary;
