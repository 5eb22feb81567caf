//! Finalization: derived targets, sanitization and the persisted histogram set.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use ns_core::Result;
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::envelope::EnvelopeAggregator;
use crate::registry::{AccumulatorKey, HistogramRegistry};
use crate::sanitize::OutputSanitizer;
use crate::summary::RunSummary;

/// One histogram of the persisted output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedHistogram {
    /// `process_variable_variant`.
    pub name: String,
    /// Structured key.
    pub key: AccumulatorKey,
    /// Lower edge.
    pub low: f64,
    /// Upper edge.
    pub high: f64,
    /// Bin contents.
    pub bin_content: Vec<f64>,
    /// Sum of weights squared per bin.
    pub sumw2: Vec<f64>,
    /// Number of fills.
    pub entries: u64,
}

/// Every histogram that survives finalization, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinalizedHistograms {
    histograms: Vec<FinalizedHistogram>,
}

impl FinalizedHistograms {
    /// Histogram by its full name.
    pub fn get(&self, name: &str) -> Option<&FinalizedHistogram> {
        self.histograms.iter().find(|h| h.name == name)
    }

    /// Histogram by its parts.
    pub fn find(&self, process: &str, variable: &str, variant: &str) -> Option<&FinalizedHistogram> {
        self.histograms
            .iter()
            .find(|h| h.key.process == process && h.key.variable == variable && h.key.variant == variant)
    }

    /// Iterate in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &FinalizedHistogram> {
        self.histograms.iter()
    }

    /// Number of histograms.
    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    /// True when nothing survived.
    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }
}

/// Output document: histograms plus the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    /// Counters of the run.
    pub summary: RunSummary,
    /// Finalized histograms.
    pub histograms: FinalizedHistograms,
}

impl RunOutput {
    /// Write pretty JSON to `path`.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

/// Derive ensemble targets, sanitize, and drop ensemble members not
/// retained by their variable.
pub fn finalize(
    mut registry: HistogramRegistry,
    config: &AnalysisConfig,
    summary: &mut RunSummary,
) -> Result<FinalizedHistograms> {
    EnvelopeAggregator::run(&mut registry, summary)?;
    let sanitizer = OutputSanitizer::new(config);
    sanitizer.sanitize(&mut registry, summary)?;

    let (variables, keys, roles, accumulators) = registry.into_parts();
    let mut histograms = Vec::with_capacity(keys.len());
    for ((key, role), acc) in keys.into_iter().zip(roles).zip(accumulators) {
        let keep = variables
            .iter()
            .find(|v| v.name == key.variable)
            .is_some_and(|v| sanitizer.keeps(role, v));
        if !keep {
            continue;
        }
        histograms.push(FinalizedHistogram {
            name: key.to_string(),
            key,
            low: acc.low,
            high: acc.high,
            bin_content: acc.bin_content,
            sumw2: acc.sumw2,
            entries: acc.entries,
        });
    }
    log::info!("finalized {} histogram(s)", histograms.len());
    Ok(FinalizedHistograms { histograms })
}
