//! Relational adjacency between (UE, AP) pair nodes.
//!
//! Every node of the policy graph is one (UE, AP) link. Two nodes are related
//! when they share a UE or share an AP; both relations are emitted as directed
//! edge lists containing each undirected edge in both orientations.

use ndarray::Array2;
use petgraph::graph::{DiGraph, NodeIndex};

/// Flat indexing convention for (UE, AP) nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeLayout {
    /// `index = ue * n_aps + ap`; edge arrays are shaped `(E, 2)`.
    Transposed,
    /// `ue = index % n_ues`, `ap = index / n_ues`; edge arrays are shaped `(2, E)`.
    Standard,
}

impl NodeLayout {
    /// Maps the legacy `if_transpose` flag onto a layout.
    pub fn from_transpose_flag(transpose: bool) -> Self {
        if transpose {
            NodeLayout::Transposed
        } else {
            NodeLayout::Standard
        }
    }
}

/// Relation carried by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    SameUe,
    SameAp,
}

/// Edge lists for a fixed `(n_ues, n_aps)` topology.
///
/// Built once per topology size and reused while the configuration is fixed.
#[derive(Debug, Clone, PartialEq)]
pub struct UeApAdjacency {
    n_ues: usize,
    n_aps: usize,
    layout: NodeLayout,
    /// Same-UE edges, shaped per [`NodeLayout`].
    pub same_ue_edges: Array2<i64>,
    /// Same-AP edges, shaped per [`NodeLayout`].
    pub same_ap_edges: Array2<i64>,
}

/// Builds the same-UE and same-AP edge lists for `n_ues × n_aps` nodes.
///
/// With `transpose = true` nodes are indexed `ue * n_aps + ap` and the arrays
/// are `(E, 2)`. Otherwise nodes are grouped by `index % n_ues` (same UE) and
/// `index / n_ues` (same AP) and the arrays are `(2, E)`.
pub fn build_adjacency(n_ues: usize, n_aps: usize, transpose: bool) -> UeApAdjacency {
    let layout = NodeLayout::from_transpose_flag(transpose);
    let (same_ue, same_ap) = match layout {
        NodeLayout::Transposed => transposed_pairs(n_ues, n_aps),
        NodeLayout::Standard => standard_pairs(n_ues, n_aps),
    };

    UeApAdjacency {
        n_ues,
        n_aps,
        layout,
        same_ue_edges: pairs_to_array(&same_ue, layout),
        same_ap_edges: pairs_to_array(&same_ap, layout),
    }
}

fn transposed_pairs(n_ues: usize, n_aps: usize) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
    let mut same_ue = Vec::with_capacity(n_ues * n_aps * n_aps.saturating_sub(1));
    let mut same_ap = Vec::with_capacity(n_aps * n_ues * n_ues.saturating_sub(1));

    for k in 0..n_ues {
        for m1 in 0..n_aps {
            for m2 in (m1 + 1)..n_aps {
                same_ue.push((k * n_aps + m1, k * n_aps + m2));
                same_ue.push((k * n_aps + m2, k * n_aps + m1));
            }
        }
    }
    for m in 0..n_aps {
        for k1 in 0..n_ues {
            for k2 in (k1 + 1)..n_ues {
                same_ap.push((k1 * n_aps + m, k2 * n_aps + m));
                same_ap.push((k2 * n_aps + m, k1 * n_aps + m));
            }
        }
    }
    (same_ue, same_ap)
}

fn standard_pairs(n_ues: usize, n_aps: usize) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
    let n_nodes = n_ues * n_aps;
    let mut same_ue = Vec::new();
    let mut same_ap = Vec::new();

    for i in 0..n_nodes {
        for j in 0..n_nodes {
            if i == j {
                continue;
            }
            if i % n_ues == j % n_ues {
                same_ue.push((i, j));
            } else if i / n_ues == j / n_ues {
                same_ap.push((i, j));
            }
        }
    }
    (same_ue, same_ap)
}

fn pairs_to_array(pairs: &[(usize, usize)], layout: NodeLayout) -> Array2<i64> {
    let e = pairs.len();
    match layout {
        NodeLayout::Transposed => Array2::from_shape_fn((e, 2), |(row, col)| {
            let (src, dst) = pairs[row];
            if col == 0 { src as i64 } else { dst as i64 }
        }),
        NodeLayout::Standard => Array2::from_shape_fn((2, e), |(row, col)| {
            let (src, dst) = pairs[col];
            if row == 0 { src as i64 } else { dst as i64 }
        }),
    }
}

impl UeApAdjacency {
    pub fn n_ues(&self) -> usize {
        self.n_ues
    }

    pub fn n_aps(&self) -> usize {
        self.n_aps
    }

    pub fn n_nodes(&self) -> usize {
        self.n_ues * self.n_aps
    }

    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    /// Flat node index of the (UE, AP) link under this layout.
    pub fn node_index(&self, ue: usize, ap: usize) -> usize {
        match self.layout {
            NodeLayout::Transposed => ue * self.n_aps + ap,
            NodeLayout::Standard => ap * self.n_ues + ue,
        }
    }

    /// Inverse of [`node_index`](Self::node_index): `(ue, ap)` for a flat index.
    pub fn node_of(&self, index: usize) -> (usize, usize) {
        match self.layout {
            NodeLayout::Transposed => (index / self.n_aps, index % self.n_aps),
            NodeLayout::Standard => (index % self.n_ues, index / self.n_ues),
        }
    }

    /// Directed `(src, dst)` pairs of one relation, independent of array layout.
    pub fn pairs(&self, kind: EdgeKind) -> Vec<(usize, usize)> {
        let edges = match kind {
            EdgeKind::SameUe => &self.same_ue_edges,
            EdgeKind::SameAp => &self.same_ap_edges,
        };
        match self.layout {
            NodeLayout::Transposed => edges
                .outer_iter()
                .map(|row| (row[0] as usize, row[1] as usize))
                .collect(),
            NodeLayout::Standard => edges
                .row(0)
                .iter()
                .zip(edges.row(1).iter())
                .map(|(&src, &dst)| (src as usize, dst as usize))
                .collect(),
        }
    }

    /// Number of directed edges of one relation.
    pub fn n_edges(&self, kind: EdgeKind) -> usize {
        let edges = match kind {
            EdgeKind::SameUe => &self.same_ue_edges,
            EdgeKind::SameAp => &self.same_ap_edges,
        };
        match self.layout {
            NodeLayout::Transposed => edges.nrows(),
            NodeLayout::Standard => edges.ncols(),
        }
    }

    /// Materializes both relations as a directed graph whose node weights are
    /// the `(ue, ap)` pairs.
    pub fn to_graph(&self) -> DiGraph<(usize, usize), EdgeKind> {
        let mut graph = DiGraph::with_capacity(
            self.n_nodes(),
            self.n_edges(EdgeKind::SameUe) + self.n_edges(EdgeKind::SameAp),
        );
        for index in 0..self.n_nodes() {
            graph.add_node(self.node_of(index));
        }
        for kind in [EdgeKind::SameUe, EdgeKind::SameAp] {
            for (src, dst) in self.pairs(kind) {
                graph.add_edge(NodeIndex::new(src), NodeIndex::new(dst), kind);
            }
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn as_set(pairs: &[(usize, usize)]) -> HashSet<(usize, usize)> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn standard_two_by_two_groups_by_mod_and_div() {
        let adj = build_adjacency(2, 2, false);
        let same_ue = as_set(&adj.pairs(EdgeKind::SameUe));
        let same_ap = as_set(&adj.pairs(EdgeKind::SameAp));

        let expected_ue: HashSet<_> = [(0, 2), (2, 0), (1, 3), (3, 1)].into_iter().collect();
        let expected_ap: HashSet<_> = [(0, 1), (1, 0), (2, 3), (3, 2)].into_iter().collect();
        assert_eq!(same_ue, expected_ue);
        assert_eq!(same_ap, expected_ap);
    }

    #[test]
    fn standard_layout_is_two_by_e() {
        let adj = build_adjacency(3, 2, false);
        assert_eq!(adj.same_ue_edges.nrows(), 2);
        assert_eq!(adj.same_ap_edges.nrows(), 2);
        // 3 UE groups of 2 nodes, 2 AP groups of 3 nodes
        assert_eq!(adj.n_edges(EdgeKind::SameUe), 3 * 2);
        assert_eq!(adj.n_edges(EdgeKind::SameAp), 2 * 3 * 2);
    }

    #[test]
    fn transposed_layout_is_e_by_two() {
        let adj = build_adjacency(3, 2, true);
        assert_eq!(adj.same_ue_edges.ncols(), 2);
        assert_eq!(adj.same_ap_edges.ncols(), 2);
        assert_eq!(adj.n_edges(EdgeKind::SameUe), 3 * 2);
        assert_eq!(adj.n_edges(EdgeKind::SameAp), 2 * 3 * 2);

        let same_ue = as_set(&adj.pairs(EdgeKind::SameUe));
        // UE 1 owns nodes 2 and 3
        assert!(same_ue.contains(&(2, 3)));
        assert!(same_ue.contains(&(3, 2)));
    }

    #[test]
    fn edges_are_symmetric_without_self_loops() {
        for transpose in [false, true] {
            let adj = build_adjacency(3, 4, transpose);
            let graph = adj.to_graph();
            for kind in [EdgeKind::SameUe, EdgeKind::SameAp] {
                let pairs = adj.pairs(kind);
                assert_eq!(pairs.len() % 2, 0);
                for &(src, dst) in &pairs {
                    assert_ne!(src, dst);
                    let reverse = graph
                        .find_edge(NodeIndex::new(dst), NodeIndex::new(src))
                        .expect("reverse edge present");
                    assert_eq!(graph[reverse], kind);
                }
            }
        }
    }

    #[test]
    fn relations_partition_shared_links() {
        let adj = build_adjacency(2, 3, false);
        let n = adj.n_nodes();
        let total = adj.n_edges(EdgeKind::SameUe) + adj.n_edges(EdgeKind::SameAp);
        // every remaining ordered pair shares neither UE nor AP
        let unrelated = (0..n)
            .flat_map(|i| (0..n).map(move |j| (i, j)))
            .filter(|&(i, j)| {
                let (ue_i, ap_i) = adj.node_of(i);
                let (ue_j, ap_j) = adj.node_of(j);
                i != j && ue_i != ue_j && ap_i != ap_j
            })
            .count();
        assert_eq!(total + unrelated, n * n - n);
    }

    #[test]
    fn node_index_round_trips() {
        for transpose in [false, true] {
            let adj = build_adjacency(3, 2, transpose);
            for index in 0..adj.n_nodes() {
                let (ue, ap) = adj.node_of(index);
                assert_eq!(adj.node_index(ue, ap), index);
            }
        }
    }

    #[test]
    fn single_ap_has_no_same_ue_edges() {
        let adj = build_adjacency(4, 1, true);
        assert_eq!(adj.n_edges(EdgeKind::SameUe), 0);
        assert_eq!(adj.same_ue_edges.dim(), (0, 2));
        assert_eq!(adj.n_edges(EdgeKind::SameAp), 4 * 3);
    }
}
