//src/types.rs

use ahash::AHashMap;
use std::fmt;

/// One line of the taxonomy report, in file (pre-order) order.
/// Only topology lives here; per-barcode counts are kept in `NodeTally`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonNode {
    pub tax_id: String,
    pub rank_class: String,
    /// Scientific name with the indentation stripped.
    pub name: String,
    /// Indentation level of the raw name (0 = root).
    pub depth: usize,
    /// Index of the nearest preceding shallower node. `None` for depth 0.
    pub parent: Option<usize>,
}

impl TaxonNode {
    /// Name prefixed with one space per unit of depth.
    pub fn display_name(&self) -> String {
        let mut indented_name = String::with_capacity(self.depth + self.name.len());
        for _ in 0..self.depth {
            indented_name.push(' ');
        }
        indented_name.push_str(&self.name);
        indented_name
    }
}

/// The mutable per-barcode state of one node, indexed like the template's nodes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeTally {
    /// Reads assigned exactly to this taxon
    pub own_count: u64,
    /// Reads assigned to this taxon or any descendant
    pub subtree_sum: u64,
    pub hit: bool,
}

/// A structured representation of one row in a per-barcode report:
///  ratio  subtree_sum  own_count  rank  taxID  indented name
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow<'a> {
    pub node: &'a TaxonNode,
    pub own_count: u64,
    pub subtree_sum: u64,
    /// Percentage of the barcode's reads, already formatted to two decimals.
    pub ratio: String,
}

impl fmt::Display for ReportRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.ratio,
            self.subtree_sum,
            self.own_count,
            self.node.rank_class,
            self.node.tax_id,
            self.node.display_name()
        )
    }
}

/// taxon id -> reads directly assigned to it, for one barcode.
pub type BarcodeCounts = AHashMap<String, u64>;

/// barcode -> its taxon counts.
pub type BarcodeTable = AHashMap<String, BarcodeCounts>;
