// src/propagate.rs

use std::fmt::Write as FmtWrite;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::taxonomy::TaxonomyTree;
use crate::types::{BarcodeCounts, NodeTally, ReportRow};

/// The hit nodes of one barcode, in the template's pre-order, plus the read
/// total the ratios are relative to.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationResult<'a> {
    pub rows: Vec<ReportRow<'a>>,
    pub total: u64,
}

/// Counts every read into its own taxon and into each ancestor up to the root.
///
/// Returns one tally per template node plus the barcode's read total. The
/// template is only read; all mutation happens on the returned tallies, so a
/// failing barcode can never leak state into the next one.
pub fn accumulate(tree: &TaxonomyTree, counts: &BarcodeCounts) -> Result<(Vec<NodeTally>, u64)> {
    let total: u64 = counts.values().sum();
    if total == 0 {
        return Err(Error::EmptyBarcode);
    }

    let mut tallies = vec![NodeTally::default(); tree.len()];

    for (tax_id, &count) in counts {
        let index = tree
            .find_first(tax_id)
            .ok_or_else(|| Error::TaxonNotFound(tax_id.clone()))?;

        let tally = &mut tallies[index];
        tally.hit = true;
        tally.own_count += count;
        tally.subtree_sum += count;

        // Walk up to the root; every node on the way is hit, the root included.
        for ancestor in tree.ancestors(index) {
            let tally = &mut tallies[ancestor];
            tally.hit = true;
            tally.subtree_sum += count;
        }
    }

    Ok((tallies, total))
}

/// Builds one barcode's report rows from its taxon counts.
///
/// Every hit node gets `ratio = subtree_sum * 100 / total`. The first hit row
/// is then reset to its own reads: its subtree sum is replaced by its own
/// count and the ratio recomputed from that. In a Kraken report the first row
/// is the root (or the unclassified bucket), and it should only show reads
/// assigned at exactly that rank.
pub fn propagate<'a>(tree: &'a TaxonomyTree, counts: &BarcodeCounts) -> Result<PropagationResult<'a>> {
    let (tallies, total) = accumulate(tree, counts)?;

    let mut rows: Vec<ReportRow<'a>> = tree
        .nodes()
        .iter()
        .zip(&tallies)
        .filter(|(_, tally)| tally.hit)
        .map(|(node, tally)| ReportRow {
            node,
            own_count: tally.own_count,
            subtree_sum: tally.subtree_sum,
            ratio: format_ratio(tally.subtree_sum, total),
        })
        .collect();

    if let Some(first) = rows.first_mut() {
        first.subtree_sum = first.own_count;
        first.ratio = format_ratio(first.own_count, total);
    }

    Ok(PropagationResult { rows, total })
}

/// `count` as a percentage of `total`, two decimals.
pub fn format_ratio(count: u64, total: u64) -> String {
    format!("{:.2}", count as f64 * 100.0 / total as f64)
}

impl PropagationResult<'_> {
    /// Writes the header-less report:
    ///  ratio  subtree_sum  own_count  rank  taxID  indented name
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        for row in &self.rows {
            writeln!(writer, "{row}")?;
        }
        Ok(())
    }

    pub fn write_report<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Generate the report text on demand
    pub fn to_report_text(&self) -> String {
        let mut output = String::new();
        for row in &self.rows {
            let _ = writeln!(output, "{row}");
        }
        output
    }
}
