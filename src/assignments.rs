//src/assignments.rs

use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::{BarcodeCounts, BarcodeTable};

/// What to do with an assignment line that breaks the read-id contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordPolicy {
    /// Fail the whole aggregation on the first malformed line.
    #[default]
    Abort,
    /// Drop the line and count it in `Aggregation::skipped_records`.
    Skip,
}

/// Per-barcode taxon counts gathered from one classification output.
#[derive(Debug, Default)]
pub struct Aggregation {
    pub barcodes: BarcodeTable,
    /// Records counted into `barcodes`
    pub records: u64,
    /// Malformed records dropped under `RecordPolicy::Skip`
    pub skipped_records: u64,
}

impl Aggregation {
    pub fn counts(&self, barcode: &str) -> Option<&BarcodeCounts> {
        self.barcodes.get(barcode)
    }
}

/// Opens a classification output, transparently decompressing `.gz` files.
pub fn open_assignments<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let f = File::open(path)?;

    let is_gz = path
        .extension()
        .map(|ext| ext == "gz")
        .unwrap_or(false);

    let reader: Box<dyn BufRead> = if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(f)))
    } else {
        Box::new(BufReader::new(f))
    };
    Ok(reader)
}

pub fn aggregate_path<P: AsRef<Path>>(path: P, policy: RecordPolicy) -> Result<Aggregation> {
    let reader = open_assignments(path)?;
    aggregate(reader, policy)
}

/// Streams the classification output and counts reads per (barcode, taxon).
///
/// Each record is whitespace separated:
/// ```text
/// <status> <umi>_<barcode> <taxid> ...
/// ```
/// Lines are consumed one at a time; only the nested counters are kept.
pub fn aggregate<R: BufRead>(mut reader: R, policy: RecordPolicy) -> Result<Aggregation> {
    let mut aggregation = Aggregation::default();
    let mut line = String::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break; // EOF
        }
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let (barcode, tax_id) = match parse_record(&line) {
            Ok(fields) => fields,
            Err(reason) => match policy {
                RecordPolicy::Abort => {
                    return Err(Error::MalformedRecord {
                        line: line_no,
                        reason,
                    })
                }
                RecordPolicy::Skip => {
                    log::debug!("Skipping assignment line {line_no}: {reason}");
                    aggregation.skipped_records += 1;
                    continue;
                }
            },
        };

        // Look up before inserting so known barcodes and taxa cost no allocation.
        if !aggregation.barcodes.contains_key(barcode) {
            aggregation
                .barcodes
                .insert(barcode.to_string(), BarcodeCounts::default());
        }
        if let Some(counts) = aggregation.barcodes.get_mut(barcode) {
            match counts.get_mut(tax_id) {
                Some(count) => *count += 1,
                None => {
                    counts.insert(tax_id.to_string(), 1);
                }
            }
        }
        aggregation.records += 1;
    }

    if aggregation.skipped_records > 0 {
        log::warn!(
            "Skipped {} malformed assignment records",
            aggregation.skipped_records
        );
    }
    log::info!(
        "Aggregated {} records into {} barcodes",
        aggregation.records,
        aggregation.barcodes.len()
    );
    Ok(aggregation)
}

/// Extracts `(barcode, taxid)` from one record. The barcode is whatever
/// follows the last underscore of the read id, and it names per-barcode
/// files, so it must be a single plain file name component.
pub fn parse_record(line: &str) -> std::result::Result<(&str, &str), String> {
    let mut fields = line.split_whitespace();
    let _status = fields.next();
    let read_id = fields
        .next()
        .ok_or_else(|| "missing read id".to_string())?;
    let tax_id = fields
        .next()
        .ok_or_else(|| format!("missing taxid for read {read_id}"))?;

    let barcode = match read_id.rsplit_once('_') {
        Some((_, barcode)) if !barcode.is_empty() => barcode,
        _ => return Err(format!("read id {read_id} has no _<barcode> suffix")),
    };
    if !is_plain_file_name(barcode) {
        return Err(format!(
            "barcode {barcode:?} of read {read_id} is not usable as a file name"
        ));
    }
    Ok((barcode, tax_id))
}

fn is_plain_file_name(name: &str) -> bool {
    name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}
