//! Processor tree driving hierarchical partitioning.
//!
//! The tree is an ordered forest stored as flat arrays with integer
//! parent/child links; leaves are blocks in order, every node carries one
//! capacity per node weight, and internal capacities are the sums of their
//! children.

use crate::error::PartError;

#[derive(Clone, Debug)]
pub struct TreeNode {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Per-weight capacity of the subtree below this node.
    pub capacities: Vec<f64>,
}

/// Ordered capacity tree whose leaves are blocks.
#[derive(Clone, Debug)]
pub struct CommTree {
    nodes: Vec<TreeNode>,
    /// Node indices per level; `levels[0]` is the root.
    levels: Vec<Vec<usize>>,
    num_weights: usize,
}

impl CommTree {
    /// Uniform tree from per-level arities: level `h` nodes each have
    /// `arities[h]` children. Leaf capacities start at 1 per weight; use
    /// [`CommTree::scale_capacities`] to match real point weights.
    pub fn from_arities(arities: &[usize], num_weights: usize) -> Result<Self, PartError> {
        if arities.is_empty() || arities.iter().any(|&a| a == 0) {
            return Err(PartError::InvalidConfiguration(
                "hierarchy levels must be non-empty positive arities".into(),
            ));
        }
        let mut nodes = vec![TreeNode {
            parent: None,
            children: Vec::new(),
            capacities: vec![0.0; num_weights],
        }];
        let mut levels = vec![vec![0usize]];
        for &arity in arities {
            let prev = levels.last().expect("at least the root").clone();
            let mut level = Vec::with_capacity(prev.len() * arity);
            for &parent in &prev {
                for _ in 0..arity {
                    let id = nodes.len();
                    nodes.push(TreeNode {
                        parent: Some(parent),
                        children: Vec::new(),
                        capacities: vec![0.0; num_weights],
                    });
                    nodes[parent].children.push(id);
                    level.push(id);
                }
            }
            levels.push(level);
        }
        let mut tree = CommTree {
            nodes,
            levels,
            num_weights,
        };
        for &leaf in tree.levels.last().expect("leaves") {
            tree.nodes[leaf].capacities = vec![1.0; num_weights];
        }
        tree.refresh_internal_capacities();
        Ok(tree)
    }

    /// Identity tree: a root with `k` leaves of equal capacity. Driving the
    /// hierarchical partitioner with it reproduces flat k-means.
    pub fn flat(k: usize, num_weights: usize) -> Result<Self, PartError> {
        CommTree::from_arities(&[k], num_weights)
    }

    /// Set explicit leaf capacities (`caps[w][leaf]`), recomputing internal
    /// sums.
    pub fn set_leaf_capacities(&mut self, caps: &[Vec<f64>]) -> Result<(), PartError> {
        if caps.len() != self.num_weights || caps.iter().any(|c| c.len() != self.num_leaves()) {
            return Err(PartError::InvalidConfiguration(format!(
                "leaf capacities must be {} x {}",
                self.num_weights,
                self.num_leaves()
            )));
        }
        let leaves = self.levels.last().expect("leaves").clone();
        for (i, &leaf) in leaves.iter().enumerate() {
            for w in 0..self.num_weights {
                self.nodes[leaf].capacities[w] = caps[w][i];
            }
        }
        self.refresh_internal_capacities();
        Ok(())
    }

    /// Scale each weight's leaf capacities so they sum to `totals[w]`.
    pub fn scale_capacities(&mut self, totals: &[f64]) {
        let leaves = self.levels.last().expect("leaves").clone();
        for w in 0..self.num_weights {
            let sum: f64 = leaves.iter().map(|&l| self.nodes[l].capacities[w]).sum();
            if sum <= 0.0 {
                continue;
            }
            let scale = totals[w] / sum;
            for &leaf in &leaves {
                self.nodes[leaf].capacities[w] *= scale;
            }
        }
        self.refresh_internal_capacities();
    }

    fn refresh_internal_capacities(&mut self) {
        for h in (0..self.levels.len() - 1).rev() {
            for &id in &self.levels[h].clone() {
                let mut caps = vec![0.0; self.num_weights];
                for &child in &self.nodes[id].children {
                    for w in 0..self.num_weights {
                        caps[w] += self.nodes[child].capacities[w];
                    }
                }
                self.nodes[id].capacities = caps;
            }
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn num_leaves(&self) -> usize {
        self.levels.last().expect("leaves").len()
    }

    pub fn num_weights(&self) -> usize {
        self.num_weights
    }

    /// Node count of level `h`.
    pub fn level_len(&self, h: usize) -> usize {
        self.levels[h].len()
    }

    /// Children counts of level `h - 1` nodes, in order: how many new
    /// blocks each existing block splits into at level `h`.
    pub fn grouping(&self, h: usize) -> Vec<usize> {
        self.levels[h - 1]
            .iter()
            .map(|&id| self.nodes[id].children.len())
            .collect()
    }

    /// Per-weight target capacities of level `h` nodes, in level order.
    pub fn balance_vectors(&self, h: usize) -> Vec<Vec<f64>> {
        (0..self.num_weights)
            .map(|w| {
                self.levels[h]
                    .iter()
                    .map(|&id| self.nodes[id].capacities[w])
                    .collect()
            })
            .collect()
    }

    /// Leaf capacities (`[w][block]`), the final target block weights.
    pub fn leaf_targets(&self) -> Vec<Vec<f64>> {
        self.balance_vectors(self.num_levels() - 1)
    }

    /// Structural validation against the settings: leaf count matches `k`
    /// and each weight's capacity covers the total point weight within the
    /// tolerance.
    pub fn validate(&self, k: usize, totals: &[f64], epsilon: f64) -> Result<(), PartError> {
        if self.num_leaves() != k {
            return Err(PartError::InvalidConfiguration(format!(
                "tree has {} leaves but numBlocks is {k}",
                self.num_leaves()
            )));
        }
        if totals.len() != self.num_weights {
            return Err(PartError::InvalidConfiguration(format!(
                "tree carries {} weights but the input has {}",
                self.num_weights,
                totals.len()
            )));
        }
        let targets = self.leaf_targets();
        for (w, per_block) in targets.iter().enumerate() {
            let sum: f64 = per_block.iter().sum();
            if totals[w] > sum * (1.0 + epsilon) {
                return Err(PartError::InvalidConfiguration(format!(
                    "total weight {} of weight {w} exceeds the tree capacity {sum}",
                    totals[w]
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_tree_shape() {
        let tree = CommTree::from_arities(&[3, 4], 1).unwrap();
        assert_eq!(tree.num_levels(), 3);
        assert_eq!(tree.level_len(1), 3);
        assert_eq!(tree.num_leaves(), 12);
        assert_eq!(tree.grouping(1), vec![3]);
        assert_eq!(tree.grouping(2), vec![4, 4, 4]);
    }

    #[test]
    fn internal_capacities_sum_children() {
        let mut tree = CommTree::from_arities(&[2, 2], 1).unwrap();
        tree.scale_capacities(&[100.0]);
        let level1 = tree.balance_vectors(1);
        assert_eq!(level1[0], vec![50.0, 50.0]);
        assert_eq!(tree.leaf_targets()[0], vec![25.0; 4]);
    }

    #[test]
    fn flat_tree_is_identity() {
        let tree = CommTree::flat(5, 2).unwrap();
        assert_eq!(tree.num_levels(), 2);
        assert_eq!(tree.num_leaves(), 5);
        assert_eq!(tree.grouping(1), vec![5]);
    }

    #[test]
    fn validation_catches_leaf_mismatch() {
        let tree = CommTree::from_arities(&[2, 3], 1).unwrap();
        assert!(tree.validate(7, &[6.0], 0.05).is_err());
        let mut tree = tree;
        tree.scale_capacities(&[6.0]);
        assert!(tree.validate(6, &[6.0], 0.05).is_ok());
        assert!(tree.validate(6, &[100.0], 0.05).is_err());
    }
}
