//! Edge coloring of the block graph into rounds of disjoint pairs.

use crate::metrics::SparseBlockGraph;

/// Greedy deterministic edge coloring: every color class is a matching of
/// block pairs that can exchange boundary data simultaneously. Edges are
/// visited in ascending (a, b) order and take the smallest color free at
/// both endpoints, so the schedule is identical on every rank.
pub fn color_block_pairs(graph: &SparseBlockGraph) -> Vec<Vec<(usize, usize)>> {
    let n = graph.n;
    let mut edges: Vec<(usize, usize)> = Vec::new();
    for a in 0..n {
        for &b in graph.neighbors(a) {
            if a < b {
                edges.push((a, b));
            }
        }
    }
    edges.sort_unstable();

    let mut colors_of: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut classes: Vec<Vec<(usize, usize)>> = Vec::new();
    for (a, b) in edges {
        let color = (0..)
            .find(|c| !colors_of[a].contains(c) && !colors_of[b].contains(c))
            .expect("some color is always free");
        colors_of[a].push(color);
        colors_of[b].push(color);
        if color == classes.len() {
            classes.push(Vec::new());
        }
        classes[color].push((a, b));
    }
    classes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_from_edges(n: usize, edges: &[(usize, usize)]) -> SparseBlockGraph {
        let mut adj = vec![Vec::new(); n];
        for &(a, b) in edges {
            adj[a].push(b);
            adj[b].push(a);
        }
        let mut ia = vec![0];
        let mut ja = Vec::new();
        for row in &mut adj {
            row.sort_unstable();
            ja.extend_from_slice(row);
            ia.push(ja.len());
        }
        let vals = vec![1.0; ja.len()];
        SparseBlockGraph { n, ia, ja, vals }
    }

    #[test]
    fn classes_are_matchings() {
        let g = graph_from_edges(4, &[(0, 1), (0, 2), (0, 3), (1, 2), (2, 3)]);
        let classes = color_block_pairs(&g);
        for class in &classes {
            let mut seen = vec![false; 4];
            for &(a, b) in class {
                assert!(!seen[a] && !seen[b], "block repeated within a color");
                seen[a] = true;
                seen[b] = true;
            }
        }
        let total: usize = classes.iter().map(|c| c.len()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn triangle_needs_three_colors() {
        let g = graph_from_edges(3, &[(0, 1), (0, 2), (1, 2)]);
        assert_eq!(color_block_pairs(&g).len(), 3);
    }

    #[test]
    fn empty_graph_has_no_classes() {
        let g = graph_from_edges(3, &[]);
        assert!(color_block_pairs(&g).is_empty());
    }
}
