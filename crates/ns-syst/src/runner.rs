//! Event loops over a slice of events: sequential, or sharded with rayon.
//!
//! Each shard fills a private registry cloned from an empty template; the
//! shards are merged in order afterwards. Fills only add, so the merged
//! result matches the sequential one up to floating-point summation order.

use ns_core::{Error, EventRecord, FeatureExtractor, Result, Reweighter, Selector};
use rayon::prelude::*;

use crate::config::AnalysisConfig;
use crate::event::{Collaborators, EventAccumulator};
use crate::registry::HistogramRegistry;
use crate::sample::SampleInfo;
use crate::summary::RunSummary;

/// Process `events` in order into a copy of `template`.
pub fn run_sequential<E, S, F, R, P>(
    template: &HistogramRegistry,
    config: &AnalysisConfig,
    sample: &SampleInfo,
    (selector, extractor, reweighter): (&S, &F, &R),
    events: &[E],
    process_of: P,
) -> Result<(HistogramRegistry, RunSummary)>
where
    E: EventRecord,
    S: Selector<E>,
    F: FeatureExtractor<E>,
    R: Reweighter<E>,
    P: Fn(&E) -> &str,
{
    let mut registry = template.clone();
    let collab = Collaborators::new(selector, extractor, reweighter);
    let mut acc = EventAccumulator::new(&registry, config, sample, collab)?;
    for event in events {
        acc.process(&mut registry, process_of(event), event)?;
    }
    Ok((registry, acc.into_summary()))
}

/// Process `events` in shards of `shard_size` on the rayon pool and merge.
pub fn run_sharded<E, S, F, R, P>(
    template: &HistogramRegistry,
    config: &AnalysisConfig,
    sample: &SampleInfo,
    (selector, extractor, reweighter): (&S, &F, &R),
    events: &[E],
    process_of: P,
    shard_size: usize,
) -> Result<(HistogramRegistry, RunSummary)>
where
    E: EventRecord + Sync,
    S: Selector<E> + Sync,
    F: FeatureExtractor<E> + Sync,
    R: Reweighter<E> + Sync,
    P: Fn(&E) -> &str + Sync,
{
    if shard_size == 0 {
        return Err(Error::Validation("shard size must be positive".into()));
    }

    let shards: Vec<(HistogramRegistry, RunSummary)> = events
        .par_chunks(shard_size)
        .map(|chunk| {
            run_sequential(template, config, sample, (selector, extractor, reweighter), chunk, &process_of)
        })
        .collect::<Result<_>>()?;
    log::debug!("merging {} shard(s) of up to {shard_size} event(s)", shards.len());

    // Construction-time counters (missing norm bounds) are recorded by every
    // shard; take them once from an accumulator over the template.
    let collab = Collaborators::new(selector, extractor, reweighter);
    let mut summary = EventAccumulator::new(template, config, sample, collab)?.into_summary();
    let mut registry = template.clone();
    for (shard, shard_summary) in &shards {
        registry.merge(shard)?;
        summary.merge(&RunSummary { missing_norm_bounds: 0, ..*shard_summary });
    }
    Ok((registry, summary))
}
