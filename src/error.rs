// src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A taxonomy report line with fewer than 5 tab-separated fields.
    #[error("malformed taxonomy report at line {line}: expected at least 5 tab-separated fields, found {found}")]
    MalformedReport { line: usize, found: usize },

    /// A non-root taxonomy line with no shallower line before it.
    #[error("taxonomy report line {line} sits at depth {depth} but no preceding line is shallower")]
    OrphanNode { line: usize, depth: usize },

    /// An assignment record that breaks the `<umi>_<barcode>` read-id contract.
    #[error("malformed assignment record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    #[error("taxon {0} appears in the classification output but not in the taxonomy report")]
    TaxonNotFound(String),

    #[error("barcode has no classified reads")]
    EmptyBarcode,

    #[error("re-estimation of barcode {barcode} at level {level} failed: {reason}")]
    Reestimation {
        barcode: String,
        level: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, Error>;
