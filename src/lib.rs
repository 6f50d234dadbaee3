// src/lib.rs
pub mod types;
pub mod error;
pub mod taxonomy;
pub mod assignments;
pub mod propagate;
pub mod reestimate;
pub mod dispatch;
pub mod config;

use indicatif::ProgressBar;

pub use crate::assignments::{aggregate, aggregate_path, Aggregation, RecordPolicy};
pub use crate::config::{Config, Layout, MissingTaxonPolicy};
pub use crate::dispatch::{CancelToken, RunSummary, WorkDispatcher};
pub use crate::error::{Error, Result};
pub use crate::propagate::{propagate, PropagationResult};
pub use crate::reestimate::{BrackenRunner, Reestimator};
pub use crate::taxonomy::TaxonomyTree;

/// Knobs of a single run that do not belong in the config file.
pub struct RunOptions {
    /// Run re-estimation after writing each report
    pub reestimate: bool,
    pub cancel: CancelToken,
    pub progress: ProgressBar,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            reestimate: true,
            cancel: CancelToken::new(),
            progress: ProgressBar::hidden(),
        }
    }
}

/// Unified entry point: load the taxonomy report, count reads per barcode,
/// then propagate, write and re-estimate every barcode in parallel.
pub fn run_pipeline(
    config: &Config,
    reestimator: &dyn Reestimator,
    options: RunOptions,
) -> Result<RunSummary> {
    // 1. Output directories
    config.validate()?;
    let layout = config.layout();
    let levels: &[String] = if options.reestimate { &config.levels } else { &[] };
    layout.prepare(levels)?;

    // 2. Taxonomy template, parents resolved once for every worker
    let tree = TaxonomyTree::from_path(&config.kraken_report)?;
    log::info!(
        "Loaded taxonomy report {} with {} nodes",
        config.kraken_report.display(),
        tree.len()
    );

    // 3. Per-barcode counts
    let aggregation = aggregate_path(&config.kraken_output, config.malformed_records)?;

    // 4. Fan out
    let mut summary = WorkDispatcher::new(&tree, &layout, reestimator)
        .with_workers(config.process)
        .with_levels(levels)
        .with_missing_taxon_policy(config.missing_taxon)
        .with_cancel_token(options.cancel)
        .with_progress(options.progress)
        .dispatch(&aggregation.barcodes)?;

    summary.skipped_records = aggregation.skipped_records;
    summary.log();
    Ok(summary)
}
