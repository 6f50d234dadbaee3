// src/dispatch.rs

use indicatif::ProgressBar;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{Layout, MissingTaxonPolicy};
use crate::error::{Error, Result};
use crate::propagate::propagate;
use crate::reestimate::Reestimator;
use crate::taxonomy::TaxonomyTree;
use crate::types::{BarcodeCounts, BarcodeTable};

/// Shared stop flag. Once cancelled no new barcode is started; barcodes
/// already being processed run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReestimationFailure {
    pub barcode: String,
    pub level: String,
    pub reason: String,
}

/// What happened to every barcode of a run.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    /// Barcodes handed to the dispatcher
    pub barcodes: usize,
    /// Barcodes whose report was written
    pub reported: usize,
    /// Barcodes with no reads, skipped
    pub empty: usize,
    /// (barcode, taxid) pairs where the taxid is missing from the taxonomy
    pub missing_taxon: Vec<(String, String)>,
    /// Barcodes never started because the run was cancelled
    pub cancelled: usize,
    /// (barcode, reason) pairs for reports that could not be written
    pub write_failures: Vec<(String, String)>,
    pub reestimation_failures: Vec<ReestimationFailure>,
    /// Malformed assignment records dropped while aggregating
    pub skipped_records: u64,
    /// Set when a missing taxon stopped the run
    pub aborted: bool,
}

impl RunSummary {
    /// True if any barcode failed, as opposed to being skipped.
    pub fn has_failures(&self) -> bool {
        self.aborted || !self.write_failures.is_empty() || !self.reestimation_failures.is_empty()
    }

    pub fn log(&self) {
        log::info!(
            "{} barcodes: {} reported, {} empty, {} with unknown taxa, {} cancelled",
            self.barcodes,
            self.reported,
            self.empty,
            self.missing_taxon.len(),
            self.cancelled
        );
        if self.skipped_records > 0 {
            log::info!("{} malformed assignment records skipped", self.skipped_records);
        }
        for (barcode, reason) in &self.write_failures {
            log::warn!("Report for {barcode} not written: {reason}");
        }
        for failure in &self.reestimation_failures {
            log::warn!(
                "Re-estimation of {} at level {} failed: {}",
                failure.barcode,
                failure.level,
                failure.reason
            );
        }
        if self.aborted {
            log::error!("Run aborted after a taxon was missing from the taxonomy report");
        }
    }
}

/// Fans per-barcode propagation out over a fixed number of worker threads.
///
/// Each barcode is handled start to finish by one worker: propagate, write
/// its report, then run re-estimation for every level. A slow external call
/// only holds up the worker it runs on.
pub struct WorkDispatcher<'a> {
    tree: &'a TaxonomyTree,
    layout: &'a Layout,
    reestimator: &'a dyn Reestimator,
    levels: Vec<String>,
    workers: usize,
    missing_taxon: MissingTaxonPolicy,
    cancel: CancelToken,
    progress: ProgressBar,
}

impl<'a> WorkDispatcher<'a> {
    pub fn new(tree: &'a TaxonomyTree, layout: &'a Layout, reestimator: &'a dyn Reestimator) -> Self {
        Self {
            tree,
            layout,
            reestimator,
            levels: Vec::new(),
            workers: 1,
            missing_taxon: MissingTaxonPolicy::default(),
            cancel: CancelToken::new(),
            progress: ProgressBar::hidden(),
        }
    }

    /// Levels to re-estimate at. Empty means reports only.
    pub fn with_levels(mut self, levels: &[String]) -> Self {
        self.levels = levels.to_vec();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_missing_taxon_policy(mut self, policy: MissingTaxonPolicy) -> Self {
        self.missing_taxon = policy;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn dispatch(&self, barcodes: &BarcodeTable) -> Result<RunSummary> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("barcode-worker-{i}"))
            .build()?;

        log::info!(
            "Dispatching {} barcodes over {} workers",
            barcodes.len(),
            self.workers
        );

        let summary = Mutex::new(RunSummary {
            barcodes: barcodes.len(),
            ..RunSummary::default()
        });
        self.progress.set_length(barcodes.len() as u64);

        let work: Vec<(&String, &BarcodeCounts)> = barcodes.iter().collect();
        pool.install(|| {
            work.par_iter().for_each(|(barcode, counts)| {
                self.process_barcode(barcode, counts, &summary);
                self.progress.inc(1);
            });
        });

        self.progress.finish_and_clear();
        Ok(summary.into_inner())
    }

    fn process_barcode(&self, barcode: &str, counts: &BarcodeCounts, summary: &Mutex<RunSummary>) {
        if self.cancel.is_cancelled() {
            summary.lock().cancelled += 1;
            return;
        }

        let result = match propagate(self.tree, counts) {
            Ok(result) => result,
            Err(Error::EmptyBarcode) => {
                log::debug!("Barcode {barcode} has no reads, skipped");
                summary.lock().empty += 1;
                return;
            }
            Err(Error::TaxonNotFound(tax_id)) => {
                match self.missing_taxon {
                    MissingTaxonPolicy::Skip => {
                        log::warn!("Skipping barcode {barcode}: taxon {tax_id} is not in the taxonomy report");
                    }
                    MissingTaxonPolicy::Abort => {
                        log::error!("Barcode {barcode}: taxon {tax_id} is not in the taxonomy report, stopping run");
                        self.cancel.cancel();
                        summary.lock().aborted = true;
                    }
                }
                summary.lock().missing_taxon.push((barcode.to_string(), tax_id));
                return;
            }
            Err(e) => {
                summary.lock().write_failures.push((barcode.to_string(), e.to_string()));
                return;
            }
        };

        let report = self.layout.barcode_report(barcode);
        if let Err(e) = result.write_report(&report) {
            log::warn!("Could not write {}: {e}", report.display());
            summary.lock().write_failures.push((barcode.to_string(), e.to_string()));
            return;
        }

        for level in &self.levels {
            match self.reestimator.reestimate(&report, barcode, level) {
                Ok(output) => log::debug!("Re-estimated {barcode} at {level}: {}", output.display()),
                Err(e) => {
                    log::warn!("{e}");
                    summary.lock().reestimation_failures.push(ReestimationFailure {
                        barcode: barcode.to_string(),
                        level: level.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        summary.lock().reported += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    /// Records every call; fails for one chosen barcode.
    #[derive(Default)]
    struct RecordingReestimator {
        calls: Mutex<Vec<(String, String)>>,
        failing_barcode: Option<String>,
    }

    impl Reestimator for RecordingReestimator {
        fn reestimate(&self, report: &Path, barcode: &str, level: &str) -> Result<PathBuf> {
            assert!(report.exists(), "report must be written before re-estimation");
            self.calls.lock().push((barcode.to_string(), level.to_string()));
            if self.failing_barcode.as_deref() == Some(barcode) {
                return Err(Error::Reestimation {
                    barcode: barcode.to_string(),
                    level: level.to_string(),
                    reason: "exit status: 1".to_string(),
                });
            }
            Ok(PathBuf::from(format!("{barcode}.{level}.bracken")))
        }
    }

    fn tree() -> TaxonomyTree {
        TaxonomyTree::build(vec![
            "0.00\t0\t0\tR\t1\troot",
            "0.00\t0\t0\tD\t2\t  A",
            "0.00\t0\t0\tS\t3\t    A1",
            "0.00\t0\t0\tD\t4\t  B",
        ])
        .unwrap()
    }

    fn table(entries: Vec<(&str, Vec<(&str, u64)>)>) -> BarcodeTable {
        entries
            .into_iter()
            .map(|(barcode, counts)| {
                let counts: BarcodeCounts = counts.into_iter().map(|(t, n)| (t.to_string(), n)).collect();
                (barcode.to_string(), counts)
            })
            .collect()
    }

    fn levels() -> Vec<String> {
        vec!["S".to_string(), "G".to_string()]
    }

    #[test]
    fn test_every_barcode_reported_and_reestimated() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.prepare(&levels()).unwrap();
        let tree = tree();
        let reestimator = RecordingReestimator::default();

        let barcodes = table(vec![
            ("AAAA", vec![("3", 5), ("4", 3)]),
            ("CCCC", vec![("4", 1)]),
            ("GGGG", vec![("2", 2)]),
        ]);
        let summary = WorkDispatcher::new(&tree, &layout, &reestimator)
            .with_workers(2)
            .with_levels(&levels())
            .dispatch(&barcodes)
            .unwrap();

        assert_eq!(summary.barcodes, 3);
        assert_eq!(summary.reported, 3);
        assert!(!summary.has_failures());

        let mut calls = reestimator.calls.lock().clone();
        calls.sort();
        assert_eq!(calls.len(), 6);
        assert_eq!(calls[0], ("AAAA".to_string(), "G".to_string()));

        let report = std::fs::read_to_string(layout.barcode_report("AAAA")).unwrap();
        assert_eq!(
            report,
            "0.00\t0\t0\tR\t1\troot\n\
             62.50\t5\t0\tD\t2\t  A\n\
             62.50\t5\t5\tS\t3\t    A1\n\
             37.50\t3\t3\tD\t4\t  B\n"
        );
    }

    #[test]
    fn test_failures_are_isolated_per_barcode() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.prepare(&levels()).unwrap();
        let tree = tree();
        let reestimator = RecordingReestimator {
            failing_barcode: Some("CCCC".to_string()),
            ..Default::default()
        };

        let barcodes = table(vec![
            ("AAAA", vec![("3", 5)]),
            ("CCCC", vec![("4", 1)]),
            ("TTTT", vec![("999", 1)]),
            ("NNNN", vec![]),
        ]);
        let summary = WorkDispatcher::new(&tree, &layout, &reestimator)
            .with_workers(3)
            .with_levels(&levels())
            .dispatch(&barcodes)
            .unwrap();

        assert_eq!(summary.reported, 2);
        assert_eq!(summary.empty, 1);
        assert_eq!(summary.missing_taxon, vec![("TTTT".to_string(), "999".to_string())]);
        assert_eq!(summary.reestimation_failures.len(), 2);
        assert!(summary.reestimation_failures.iter().all(|f| f.barcode == "CCCC"));
        assert!(!summary.aborted);
        assert!(summary.has_failures());
        assert!(!layout.barcode_report("TTTT").exists());
        assert!(!layout.barcode_report("NNNN").exists());
    }

    #[test]
    fn test_missing_taxon_abort_stops_new_barcodes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.prepare(&[]).unwrap();
        let tree = tree();
        let reestimator = RecordingReestimator::default();
        let cancel = CancelToken::new();

        let barcodes = table(vec![
            ("AAAA", vec![("3", 5)]),
            ("TTTT", vec![("999", 1)]),
            ("CCCC", vec![("4", 1)]),
        ]);
        let summary = WorkDispatcher::new(&tree, &layout, &reestimator)
            .with_missing_taxon_policy(MissingTaxonPolicy::Abort)
            .with_cancel_token(cancel.clone())
            .dispatch(&barcodes)
            .unwrap();

        assert!(summary.aborted);
        assert!(cancel.is_cancelled());
        assert_eq!(summary.missing_taxon.len(), 1);
        assert_eq!(summary.reported + summary.cancelled + 1, 3);
    }

    #[test]
    fn test_cancelled_before_start_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.prepare(&levels()).unwrap();
        let tree = tree();
        let reestimator = RecordingReestimator::default();
        let cancel = CancelToken::new();
        cancel.cancel();

        let barcodes = table(vec![("AAAA", vec![("3", 5)]), ("CCCC", vec![("4", 1)])]);
        let summary = WorkDispatcher::new(&tree, &layout, &reestimator)
            .with_workers(2)
            .with_levels(&levels())
            .with_cancel_token(cancel)
            .dispatch(&barcodes)
            .unwrap();

        assert_eq!(summary.cancelled, 2);
        assert_eq!(summary.reported, 0);
        assert!(reestimator.calls.lock().is_empty());
        assert!(!summary.has_failures());
    }
}
