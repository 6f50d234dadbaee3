//src/taxonomy.rs

use ahash::AHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::TaxonNode;

/// The taxonomy report as an arena of nodes in pre-order, parsed from the
/// tab-separated report written by the classifier:
/// ```text
/// <pct>\t<clade reads>\t<taxon reads>\t<rank>\t<taxid>\t<indented name>
/// ```
/// Nesting is only encoded by the leading spaces of the name, so every node's
/// parent is the nearest preceding node with a strictly smaller depth. Parent
/// links are resolved once while building; the tree is read-only afterwards
/// and can be shared across worker threads.
#[derive(Debug, Clone)]
pub struct TaxonomyTree {
    nodes: Vec<TaxonNode>,
    /// tax_id -> index of its first occurrence in file order
    first_index: AHashMap<String, usize>,
}

impl TaxonomyTree {
    /// Parses the taxonomy report at `filepath`.
    pub fn from_path<P: AsRef<Path>>(filepath: P) -> Result<Self> {
        let file = File::open(filepath)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut builder = TreeBuilder::default();
        for line_result in reader.lines() {
            let line = line_result?;
            builder.push_line(&line)?;
        }
        Ok(builder.finish())
    }

    /// Builds the tree from report lines already in memory.
    pub fn build<I, S>(report_lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = TreeBuilder::default();
        for line in report_lines {
            builder.push_line(line.as_ref())?;
        }
        Ok(builder.finish())
    }

    pub fn nodes(&self) -> &[TaxonNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&TaxonNode> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parent index of `node_index`, or `None` for a root (or an index past the end).
    pub fn ancestor_index(&self, node_index: usize) -> Option<usize> {
        self.nodes.get(node_index).and_then(|node| node.parent)
    }

    /// Index of the first node, in pre-order, carrying `tax_id`.
    pub fn find_first(&self, tax_id: &str) -> Option<usize> {
        self.first_index.get(tax_id).copied()
    }

    /// Strict ancestors of `node_index`, nearest first, ending at a depth-0 node.
    pub fn ancestors(&self, node_index: usize) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: self.ancestor_index(node_index),
        }
    }

    /// Node indices from the first occurrence of `tax_id` up to its root, inclusive.
    /// The depth-0 node is always the last entry, `root` included.
    pub fn lineage(&self, tax_id: &str) -> Option<Vec<usize>> {
        let start = self.find_first(tax_id)?;
        let mut chain = vec![start];
        chain.extend(self.ancestors(start));
        Some(chain)
    }
}

/// Iterator over the ancestor chain of a node. See [`TaxonomyTree::ancestors`].
pub struct Ancestors<'a> {
    tree: &'a TaxonomyTree,
    next: Option<usize>,
}

impl Iterator for Ancestors<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.next?;
        self.next = self.tree.ancestor_index(current);
        Some(current)
    }
}

/// Accumulates report lines and resolves parents with a monotonic stack:
/// after popping every open node at the same depth or deeper, the top of the
/// stack is the nearest preceding shallower node.
#[derive(Default)]
struct TreeBuilder {
    nodes: Vec<TaxonNode>,
    first_index: AHashMap<String, usize>,
    open: Vec<usize>,
    line_no: usize,
}

impl TreeBuilder {
    fn push_line(&mut self, line: &str) -> Result<()> {
        self.line_no += 1;
        let mut node = parse_report_line(self.line_no, line)?;

        while let Some(&top) = self.open.last() {
            if self.nodes[top].depth < node.depth {
                break;
            }
            self.open.pop();
        }

        if node.depth > 0 {
            match self.open.last() {
                Some(&parent) => node.parent = Some(parent),
                None => {
                    return Err(Error::OrphanNode {
                        line: self.line_no,
                        depth: node.depth,
                    })
                }
            }
        }

        let index = self.nodes.len();
        self.first_index.entry(node.tax_id.clone()).or_insert(index);
        self.nodes.push(node);
        self.open.push(index);
        Ok(())
    }

    fn finish(self) -> TaxonomyTree {
        log::debug!("Parsed taxonomy report with {} nodes", self.nodes.len());
        TaxonomyTree {
            nodes: self.nodes,
            first_index: self.first_index,
        }
    }
}

/// Parses one report line. Rank is field 3, taxid field 4 and the name is the
/// last field; its depth is the number of empty tokens left by splitting the
/// untrimmed name on single spaces.
fn parse_report_line(line_no: usize, line: &str) -> Result<TaxonNode> {
    let parts: Vec<&str> = line.trim().split('\t').collect();
    if parts.len() < 5 {
        return Err(Error::MalformedReport {
            line: line_no,
            found: parts.len(),
        });
    }

    let raw_name = parts[parts.len() - 1];
    let depth = raw_name.split(' ').filter(|token| token.is_empty()).count();

    Ok(TaxonNode {
        tax_id: parts[4].to_string(),
        rank_class: parts[3].to_string(),
        name: raw_name.trim().to_string(),
        depth,
        parent: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_line(rank: &str, tax_id: &str, level: usize, name: &str) -> String {
        format!("0.00\t0\t0\t{rank}\t{tax_id}\t{}{name}", "  ".repeat(level))
    }

    fn small_report() -> Vec<String> {
        vec![
            report_line("U", "0", 0, "unclassified"),
            report_line("R", "1", 0, "root"),
            report_line("R1", "131567", 1, "cellular organisms"),
            report_line("D", "2", 2, "Bacteria"),
            report_line("P", "1224", 3, "Proteobacteria"),
            report_line("C", "1236", 4, "Gammaproteobacteria"),
            report_line("G", "561", 5, "Escherichia"),
            report_line("S", "562", 6, "Escherichia coli"),
            report_line("P", "1239", 3, "Firmicutes"),
            report_line("G", "1386", 4, "Bacillus"),
            report_line("D", "2759", 2, "Eukaryota"),
            report_line("R1", "10239", 1, "Viruses"),
        ]
    }

    #[test]
    fn test_depth_counts_leading_spaces() {
        let tree = TaxonomyTree::build(small_report()).unwrap();
        let depths: Vec<usize> = tree.nodes().iter().map(|n| n.depth).collect();
        assert_eq!(depths, vec![0, 0, 2, 4, 6, 8, 10, 12, 6, 8, 4, 2]);

        let ecoli = &tree.nodes()[7];
        assert_eq!(ecoli.name, "Escherichia coli");
        assert_eq!(ecoli.rank_class, "S");
        assert_eq!(ecoli.tax_id, "562");
        assert_eq!(ecoli.display_name(), format!("{}Escherichia coli", " ".repeat(12)));
    }

    #[test]
    fn test_parent_is_nearest_shallower_predecessor() {
        let tree = TaxonomyTree::build(small_report()).unwrap();

        for (i, node) in tree.nodes().iter().enumerate() {
            match tree.ancestor_index(i) {
                None => assert_eq!(node.depth, 0, "non-root node {i} lost its parent"),
                Some(p) => {
                    assert!(p < i);
                    assert!(tree.nodes()[p].depth < node.depth);
                    for between in &tree.nodes()[p + 1..i] {
                        assert!(between.depth >= node.depth);
                    }
                }
            }
        }

        assert_eq!(tree.ancestor_index(8), Some(3)); // Firmicutes -> Bacteria
        assert_eq!(tree.ancestor_index(11), Some(1)); // Viruses -> root
        assert_eq!(tree.ancestor_index(0), None);
        assert_eq!(tree.ancestor_index(99), None);
    }

    #[test]
    fn test_lineage_walks_to_root() {
        let tree = TaxonomyTree::build(small_report()).unwrap();
        assert_eq!(tree.lineage("562"), Some(vec![7, 6, 5, 4, 3, 2, 1]));
        assert_eq!(tree.lineage("1"), Some(vec![1]));
        assert_eq!(tree.lineage("424242"), None);
    }

    #[test]
    fn test_find_first_prefers_earliest_duplicate() {
        let lines = vec![
            report_line("R", "1", 0, "root"),
            report_line("D", "2", 1, "Bacteria"),
            report_line("S", "7", 2, "first copy"),
            report_line("D", "3", 1, "Archaea"),
            report_line("S", "7", 2, "second copy"),
        ];
        let tree = TaxonomyTree::build(lines).unwrap();
        assert_eq!(tree.find_first("7"), Some(2));
        assert_eq!(tree.find_first("3"), Some(3));
        assert_eq!(tree.find_first("nope"), None);
    }

    #[test]
    fn test_short_line_is_malformed() {
        let lines = vec![
            report_line("R", "1", 0, "root"),
            "1.00\t2\t3".to_string(),
        ];
        match TaxonomyTree::build(lines) {
            Err(Error::MalformedReport { line, found }) => {
                assert_eq!(line, 2);
                assert_eq!(found, 3);
            }
            other => panic!("expected MalformedReport, got {other:?}"),
        }
    }

    #[test]
    fn test_indented_first_line_is_orphan() {
        let lines = vec![report_line("D", "2", 1, "Bacteria")];
        assert!(matches!(
            TaxonomyTree::build(lines),
            Err(Error::OrphanNode { line: 1, depth: 2 })
        ));
    }

    #[test]
    fn test_from_reader_matches_build() {
        let text = small_report().join("\n") + "\n";
        let from_reader = TaxonomyTree::from_reader(text.as_bytes()).unwrap();
        let built = TaxonomyTree::build(small_report()).unwrap();
        assert_eq!(from_reader.nodes(), built.nodes());
    }
}
