//! # ns-core
//!
//! Shared vocabulary of the NextStat systematics engine: the error type,
//! event/feature data types, and the traits through which the engine talks
//! to its external collaborators (selection, feature extraction, reweighting,
//! sample metadata).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{EventRecord, FeatureExtractor, Reweighter, SampleMetadata, Selector};
pub use types::{EventKind, FeatureMap, VariableSpec};
