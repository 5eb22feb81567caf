//! Weighted 1D accumulator with uniform binning.

use ns_core::{Error, Result, VariableSpec};
use serde::{Deserialize, Serialize};

/// Sum of weights and sum of squared weights per bin.
///
/// Out-of-range values are folded into the first/last bin (the fill lands at
/// that bin's center) instead of being dropped. Non-finite values and
/// weights are rejected and reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    /// Lower edge of the first bin.
    pub low: f64,
    /// Upper edge of the last bin.
    pub high: f64,
    /// Bin contents (sum of weights per bin).
    pub bin_content: Vec<f64>,
    /// Sum of weights squared per bin.
    pub sumw2: Vec<f64>,
    /// Number of fills.
    pub entries: u64,
}

impl Accumulator {
    /// Empty accumulator binned like `spec`.
    pub fn new(spec: &VariableSpec) -> Self {
        Self::with_binning(spec.low, spec.high, spec.nbins)
    }

    /// Empty accumulator with `nbins` uniform bins on `[low, high)`.
    pub fn with_binning(low: f64, high: f64, nbins: usize) -> Self {
        Self { low, high, bin_content: vec![0.0; nbins], sumw2: vec![0.0; nbins], entries: 0 }
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.bin_content.len()
    }

    /// Center of bin `i`.
    pub fn bin_center(&self, i: usize) -> f64 {
        let width = (self.high - self.low) / self.n_bins() as f64;
        self.low + (i as f64 + 0.5) * width
    }

    /// Bin holding `value`; out-of-range values map to the first/last bin.
    /// `None` only for NaN.
    pub fn bin_index(&self, value: f64) -> Option<usize> {
        if value.is_nan() {
            return None;
        }
        let n = self.n_bins();
        if value < self.low {
            return Some(0);
        }
        if value >= self.high {
            return Some(n - 1);
        }
        let pos = (value - self.low) / (self.high - self.low) * n as f64;
        Some((pos as usize).min(n - 1))
    }

    /// Add `weight` at `value`. Returns `false` (and leaves the accumulator
    /// untouched) when either is not a usable number.
    pub fn fill(&mut self, value: f64, weight: f64) -> bool {
        if !weight.is_finite() {
            return false;
        }
        let Some(bin) = self.bin_index(value) else {
            return false;
        };
        self.bin_content[bin] += weight;
        self.sumw2[bin] += weight * weight;
        self.entries += 1;
        true
    }

    /// Sum of bin contents.
    pub fn total(&self) -> f64 {
        self.bin_content.iter().sum()
    }

    /// Never filled.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// True if `other` has the same binning.
    pub fn same_binning(&self, other: &Accumulator) -> bool {
        self.n_bins() == other.n_bins() && self.low == other.low && self.high == other.high
    }

    /// Bin-by-bin sum; fills commute, so this merges independently filled
    /// shards exactly.
    pub fn add(&mut self, other: &Accumulator) -> Result<()> {
        if !self.same_binning(other) {
            return Err(Error::Precondition(format!(
                "cannot add accumulators with different binning ({} bins [{}, {}) vs {} bins [{}, {}))",
                self.n_bins(),
                self.low,
                self.high,
                other.n_bins(),
                other.low,
                other.high
            )));
        }
        for (a, b) in self.bin_content.iter_mut().zip(&other.bin_content) {
            *a += b;
        }
        for (a, b) in self.sumw2.iter_mut().zip(&other.sumw2) {
            *a += b;
        }
        self.entries += other.entries;
        Ok(())
    }

    /// Overwrite contents, errors and entries with those of `other`.
    pub(crate) fn copy_contents(&mut self, other: &Accumulator) {
        debug_assert!(self.same_binning(other));
        self.bin_content.copy_from_slice(&other.bin_content);
        self.sumw2.copy_from_slice(&other.sumw2);
        self.entries = other.entries;
    }
}
