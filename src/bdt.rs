//! Boosted-decision-tree ensemble compiler.
//!
//! Trained trees arrive as the parallel node arrays scikit-style
//! exporters produce (`-1` marking "no child"). Compilation annotates
//! every node with its parent and depth, pads each tree with inert dummy
//! leaves until it is a perfect binary tree of exactly
//! `2^(max_depth+1) - 1` nodes, and pre-multiplies every node value by
//! the ensemble's learning rate. The result can be addressed by static
//! array index at every depth, which is what the pipelined hardware
//! evaluation depends on.

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};

/// Child sentinel: the node is a leaf.
pub const LEAF: i32 = -1;
/// Feature sentinel carried by padding nodes.
pub const DUMMY_FEATURE: i32 = -2;
/// Threshold carried by padding nodes.
pub const DUMMY_THRESHOLD: f64 = -2.0;

/// Deepest supported tree. Node indices are `i32`, so a perfect tree's
/// `2^(max_depth+1) - 1` nodes must stay within `i32` range.
pub const MAX_TREE_DEPTH: usize = 30;

/// Node count of a perfect binary tree of the given depth. Valid up to
/// [`MAX_TREE_DEPTH`].
pub fn n_nodes(max_depth: usize) -> usize {
    (1 << (max_depth + 1)) - 1
}

pub fn n_leaves(max_depth: usize) -> usize {
    1 << max_depth
}

/// Trees per boosting round: binary classification collapses to a
/// single score, so only one class group exists.
pub fn class_groups(n_classes: usize) -> usize {
    if n_classes == 2 { 1 } else { n_classes }
}

/// One trained tree as parallel arrays indexed by node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTree {
    pub feature: Vec<i32>,
    pub threshold: Vec<f64>,
    pub value: Vec<f64>,
    pub children_left: Vec<i32>,
    pub children_right: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEnsemble {
    pub max_depth: usize,
    pub n_trees: usize,
    pub n_features: usize,
    pub n_classes: usize,
    pub init_predict: Vec<f64>,
    pub learning_rate: f64,
    /// `trees[round][class_group]`.
    pub trees: Vec<Vec<RawTree>>,
}

/// A compiled, perfectly balanced tree. Field order is load-bearing:
/// emission flattens the arrays in exactly this order into the target's
/// static table literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub feature: Vec<i32>,
    pub threshold: Vec<f64>,
    pub value: Vec<f64>,
    pub children_left: Vec<i32>,
    pub children_right: Vec<i32>,
    pub parent: Vec<i32>,
    pub depth: Vec<usize>,
}

impl Tree {
    pub fn len(&self) -> usize {
        self.feature.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feature.is_empty()
    }

    pub fn is_leaf(&self, node: usize) -> bool {
        self.children_left[node] == LEAF
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ensemble {
    pub max_depth: usize,
    pub n_trees: usize,
    pub n_features: usize,
    pub n_classes: usize,
    pub init_predict: Vec<f64>,
    pub normalization: f64,
    pub trees: Vec<Vec<Tree>>,
}

/// Normalize a whole ensemble. Node values come out pre-multiplied by
/// the learning rate so hardware evaluation needs no run-time scaling.
pub fn compile_ensemble(raw: &RawEnsemble) -> Result<Ensemble> {
    if raw.trees.len() != raw.n_trees {
        return Err(CompileError::UnsupportedConfig(format!(
            "ensemble declares {} trees but provides {}",
            raw.n_trees,
            raw.trees.len()
        )));
    }
    let groups = class_groups(raw.n_classes);
    if raw.init_predict.len() != groups {
        return Err(CompileError::UnsupportedConfig(format!(
            "init_predict has {} entries, expected {groups}",
            raw.init_predict.len()
        )));
    }
    let trees = raw
        .trees
        .iter()
        .enumerate()
        .map(|(round, group)| {
            if group.len() != groups {
                return Err(CompileError::ensemble(
                    round,
                    format!("expected {groups} class group(s), found {}", group.len()),
                ));
            }
            group
                .iter()
                .enumerate()
                .map(|(group_index, tree)| {
                    compile_tree(tree, raw.max_depth, raw.learning_rate, round).map_err(|err| {
                        match err {
                            CompileError::MalformedEnsemble { tree, reason } => {
                                CompileError::MalformedEnsemble {
                                    tree,
                                    reason: format!("class group {group_index}: {reason}"),
                                }
                            }
                            other => other,
                        }
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Ensemble {
        max_depth: raw.max_depth,
        n_trees: raw.n_trees,
        n_features: raw.n_features,
        n_classes: raw.n_classes,
        init_predict: raw.init_predict.clone(),
        normalization: 1.0,
        trees,
    })
}

/// Annotate, balance and scale a single tree.
pub fn compile_tree(
    raw: &RawTree,
    max_depth: usize,
    learning_rate: f64,
    tree_index: usize,
) -> Result<Tree> {
    if max_depth > MAX_TREE_DEPTH {
        return Err(CompileError::UnsupportedConfig(format!(
            "max_depth {max_depth} exceeds the supported limit of {MAX_TREE_DEPTH}"
        )));
    }
    let n = raw.feature.len();
    if n == 0 {
        return Err(CompileError::ensemble(tree_index, "tree has no nodes"));
    }
    for (field, len) in [
        ("threshold", raw.threshold.len()),
        ("value", raw.value.len()),
        ("children_left", raw.children_left.len()),
        ("children_right", raw.children_right.len()),
    ] {
        if len != n {
            return Err(CompileError::ensemble(
                tree_index,
                format!("parallel array `{field}` has {len} entries, expected {n}"),
            ));
        }
    }

    let parent = derive_parents(raw, tree_index)?;
    let depth = derive_depths(&parent, tree_index)?;
    if let Some(deepest) = depth.iter().max() {
        if *deepest > max_depth {
            return Err(CompileError::ensemble(
                tree_index,
                format!("tree has depth {deepest}, deeper than max_depth {max_depth}"),
            ));
        }
    }

    let mut tree = Tree {
        feature: raw.feature.clone(),
        threshold: raw.threshold.clone(),
        value: raw.value.iter().map(|v| v * learning_rate).collect(),
        children_left: raw.children_left.clone(),
        children_right: raw.children_right.clone(),
        parent,
        depth,
    };
    balance(&mut tree, max_depth);
    Ok(tree)
}

/// Invert the children arrays in a single pass. Root keeps `-1`.
fn derive_parents(raw: &RawTree, tree_index: usize) -> Result<Vec<i32>> {
    let n = raw.feature.len();
    let mut parent = vec![-1i32; n];
    for i in 0..n {
        let left = raw.children_left[i];
        let right = raw.children_right[i];
        if (left == LEAF) != (right == LEAF) {
            return Err(CompileError::ensemble(
                tree_index,
                format!("node {i} has exactly one child"),
            ));
        }
        for child in [left, right] {
            if child == LEAF {
                continue;
            }
            if child < 0 || child as usize >= n {
                return Err(CompileError::ensemble(
                    tree_index,
                    format!("node {i} references out-of-range child {child}"),
                ));
            }
            parent[child as usize] = i as i32;
        }
    }
    Ok(parent)
}

/// Depth of each node by climbing parent links; the hop cap catches
/// cyclic parent chains in malformed input.
fn derive_depths(parent: &[i32], tree_index: usize) -> Result<Vec<usize>> {
    let n = parent.len();
    let mut depth = vec![0usize; n];
    for i in 0..n {
        let mut hops = 0;
        let mut at = parent[i];
        while at != -1 {
            hops += 1;
            if hops > n {
                return Err(CompileError::ensemble(
                    tree_index,
                    format!("parent chain of node {i} does not reach the root"),
                ));
            }
            at = parent[at as usize];
        }
        depth[i] = hops;
    }
    Ok(depth)
}

/// Append dummy children under every leaf sitting above `max_depth`
/// until the tree is perfect. Dummies copy the leaf's value, so routing
/// into a dummy subtree never changes the predicted score; the sentinel
/// feature/threshold keep them trivially distinguishable.
fn balance(tree: &mut Tree, max_depth: usize) {
    let target = n_nodes(max_depth);
    while tree.len() < target {
        let scanned = tree.len();
        for i in 0..scanned {
            if !tree.is_leaf(i) || tree.depth[i] == max_depth {
                continue;
            }
            let left = tree.len() as i32;
            let value = tree.value[i];
            let child_depth = tree.depth[i] + 1;
            for _ in 0..2 {
                tree.feature.push(DUMMY_FEATURE);
                tree.threshold.push(DUMMY_THRESHOLD);
                tree.value.push(value);
                tree.children_left.push(LEAF);
                tree.children_right.push(LEAF);
                tree.parent.push(i as i32);
                tree.depth.push(child_depth);
            }
            tree.children_left[i] = left;
            tree.children_right[i] = left + 1;
        }
    }
}

/// Canonical left-first balanced tree shape, used as a reference
/// indexing scheme. Perfect binary trees admit direct index arithmetic:
/// in left-first preorder the left child of a node at depth `d` is the
/// next index and the right child skips the whole left subtree,
/// `right(i) = i + 2^(max_depth - d)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancedShape {
    pub children_left: Vec<i32>,
    pub children_right: Vec<i32>,
    pub parent: Vec<i32>,
}

pub fn balanced_tree_shape(max_depth: usize) -> BalancedShape {
    debug_assert!(max_depth <= MAX_TREE_DEPTH);
    let n = n_nodes(max_depth);
    let mut shape = BalancedShape {
        children_left: vec![LEAF; n],
        children_right: vec![LEAF; n],
        parent: vec![-1; n],
    };
    let mut stack = vec![(0usize, 0usize)];
    while let Some((i, d)) = stack.pop() {
        if d == max_depth {
            continue;
        }
        let left = i + 1;
        let right = i + (1 << (max_depth - d));
        shape.children_left[i] = left as i32;
        shape.children_right[i] = right as i32;
        shape.parent[left] = i as i32;
        shape.parent[right] = i as i32;
        stack.push((left, d + 1));
        stack.push((right, d + 1));
    }
    shape
}

#[cfg(test)]
mod test {
    use super::*;

    /// Root with two children; the left child has two leaf
    /// grandchildren, the right child is a leaf. Five real nodes.
    fn lopsided_tree() -> RawTree {
        RawTree {
            feature: vec![0, 1, -2, -2, -2],
            threshold: vec![0.5, 0.3, -2.0, -2.0, -2.0],
            value: vec![0.0, 0.0, 1.5, -0.25, 0.75],
            children_left: vec![1, 3, -1, -1, -1],
            children_right: vec![2, 4, -1, -1, -1],
        }
    }

    fn perfect_depth1_tree() -> RawTree {
        RawTree {
            feature: vec![0, -2, -2],
            threshold: vec![0.1, -2.0, -2.0],
            value: vec![0.0, -1.0, 1.0],
            children_left: vec![1, -1, -1],
            children_right: vec![2, -1, -1],
        }
    }

    fn assert_parent_depth_consistent(tree: &Tree) {
        assert_eq!(tree.parent[0], -1);
        for i in 0..tree.len() {
            let mut hops = 0;
            let mut at = tree.parent[i];
            while at != -1 {
                hops += 1;
                at = tree.parent[at as usize];
            }
            assert_eq!(tree.depth[i], hops, "depth of node {i}");
        }
    }

    #[test]
    fn test_lopsided_tree_pads_to_seven_nodes() {
        let tree = compile_tree(&lopsided_tree(), 2, 1.0, 0).unwrap();
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.depth[0], 0);
        assert_eq!(tree.depth[3], 2);
        assert_eq!(tree.depth[4], 2);
        // The right-child leaf (node 2) grew two dummy descendants
        // carrying its value.
        assert_eq!(tree.children_left[2], 5);
        assert_eq!(tree.children_right[2], 6);
        for dummy in [5, 6] {
            assert_eq!(tree.feature[dummy], DUMMY_FEATURE);
            assert_eq!(tree.threshold[dummy], DUMMY_THRESHOLD);
            assert_eq!(tree.value[dummy], 1.5);
            assert_eq!(tree.parent[dummy], 2);
            assert_eq!(tree.depth[dummy], 2);
        }
        assert_parent_depth_consistent(&tree);
    }

    #[test]
    fn test_balanced_tree_is_noop() {
        let raw = perfect_depth1_tree();
        let tree = compile_tree(&raw, 1, 1.0, 0).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.feature, raw.feature);
        assert_eq!(tree.value, raw.value);
        assert_eq!(tree.children_left, raw.children_left);
        assert_eq!(tree.parent, vec![-1, 0, 0]);
    }

    #[test]
    fn test_learning_rate_prescales_values() {
        let tree = compile_tree(&lopsided_tree(), 2, 0.1, 0).unwrap();
        assert_eq!(tree.value[2], 0.15000000000000002);
        // Dummies copy the already scaled leaf value.
        assert_eq!(tree.value[5], tree.value[2]);
    }

    #[test]
    fn test_deep_tree_rejected() {
        let err = compile_tree(&lopsided_tree(), 1, 1.0, 3).unwrap_err();
        assert!(matches!(
            err,
            CompileError::MalformedEnsemble { tree: 3, .. }
        ));
    }

    #[test]
    fn test_single_leaf_pads_to_heap_layout() {
        let raw = RawTree {
            feature: vec![-2],
            threshold: vec![-2.0],
            value: vec![0.5],
            children_left: vec![-1],
            children_right: vec![-1],
        };
        let tree = compile_tree(&raw, 2, 1.0, 0).unwrap();
        assert_eq!(tree.len(), n_nodes(2));
        // Scan-order padding of a lone leaf reproduces the classic heap
        // indexing.
        for i in 0..3 {
            assert_eq!(tree.children_left[i], 2 * i as i32 + 1);
            assert_eq!(tree.children_right[i], 2 * i as i32 + 2);
        }
        assert!(tree.value.iter().all(|&v| v == 0.5));
        assert_parent_depth_consistent(&tree);
    }

    #[test]
    fn test_compile_ensemble_binary_classification() {
        let raw = RawEnsemble {
            max_depth: 2,
            n_trees: 2,
            n_features: 2,
            n_classes: 2,
            init_predict: vec![0.0],
            learning_rate: 0.5,
            trees: vec![vec![lopsided_tree()], vec![perfect_depth1_tree()]],
        };
        let ensemble = compile_ensemble(&raw).unwrap();
        assert_eq!(ensemble.trees.len(), 2);
        // Binary classification: one class group per boosting round.
        assert_eq!(ensemble.trees[0].len(), 1);
        assert_eq!(ensemble.normalization, 1.0);
        for group in &ensemble.trees {
            for tree in group {
                assert_eq!(tree.len(), n_nodes(2));
                assert_parent_depth_consistent(tree);
            }
        }
    }

    #[test]
    fn test_compile_ensemble_rejects_group_mismatch() {
        let raw = RawEnsemble {
            max_depth: 1,
            n_trees: 1,
            n_features: 2,
            n_classes: 2,
            init_predict: vec![0.0],
            learning_rate: 1.0,
            trees: vec![vec![perfect_depth1_tree(), perfect_depth1_tree()]],
        };
        let err = compile_ensemble(&raw).unwrap_err();
        assert!(matches!(err, CompileError::MalformedEnsemble { tree: 0, .. }));
    }

    #[test]
    fn test_balanced_tree_shape_left_first() {
        let shape = balanced_tree_shape(2);
        assert_eq!(shape.children_left, vec![1, 2, -1, -1, 5, -1, -1]);
        assert_eq!(shape.children_right, vec![4, 3, -1, -1, 6, -1, -1]);
        assert_eq!(shape.parent, vec![-1, 0, 1, 1, 0, 4, 4]);
    }

    #[test]
    fn test_excessive_max_depth_rejected() {
        let err = compile_tree(&perfect_depth1_tree(), 31, 1.0, 0).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedConfig(_)));
    }

    #[test]
    fn test_multiclass_error_names_class_group() {
        let bad = RawTree {
            feature: vec![0, -2],
            threshold: vec![0.1, -2.0],
            value: vec![0.0, 1.0],
            children_left: vec![1, -1],
            children_right: vec![-1, -1],
        };
        let raw = RawEnsemble {
            max_depth: 1,
            n_trees: 1,
            n_features: 2,
            n_classes: 3,
            init_predict: vec![0.0; 3],
            learning_rate: 1.0,
            trees: vec![vec![perfect_depth1_tree(), bad, perfect_depth1_tree()]],
        };
        let err = compile_ensemble(&raw).unwrap_err();
        match err {
            CompileError::MalformedEnsemble { tree, reason } => {
                assert_eq!(tree, 0);
                assert!(reason.contains("class group 1"), "reason: {reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_one_child_node_rejected() {
        let raw = RawTree {
            feature: vec![0, -2],
            threshold: vec![0.1, -2.0],
            value: vec![0.0, 1.0],
            children_left: vec![1, -1],
            children_right: vec![-1, -1],
        };
        assert!(compile_tree(&raw, 1, 1.0, 0).is_err());
    }
}
