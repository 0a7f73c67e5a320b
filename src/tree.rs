//! The in-memory similarity tree.
//!
//! A binary clustering structure per column: the right-chain holds
//! mutually-dissimilar top-level clusters, the left-chain under a node is a
//! finer subdivision of its near-duplicates. Nodes live in an arena and
//! refer to each other by index; no parent pointers are stored.
//!
//! For a node `n` and an incoming vector `v`:
//! - `score(v, n) >= identical_angle`: `v` merges into `n`,
//! - `score(v, n) > fold_angle`: `v` belongs under `n.left`,
//! - otherwise: `v` belongs under `n.right`.

use ahash::AHashSet;

use crate::error::{CanopyError, Result};
use crate::model::SimilarityModel;
use crate::vector::SparseVector;

/// Arena index of a node within its tree.
pub type NodeId = u32;

/// Children marker stored per serialized node block.
pub const TERMINATOR_BOTH: u8 = 0;
pub const TERMINATOR_LEFT_ONLY: u8 = 1;
pub const TERMINATOR_RIGHT_ONLY: u8 = 2;
pub const TERMINATOR_NONE: u8 = 3;

/// One cluster in the tree: a representative vector, the document ids merged
/// into it, and any postings offsets accumulated from on-disk merges.
#[derive(Debug, Clone)]
pub struct VectorNode {
    vector: SparseVector,
    doc_ids: AHashSet<u64>,
    postings_offsets: Vec<u64>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    weight: u32,
    angle_when_added: f32,
}

impl VectorNode {
    /// A node holding a single document occurrence.
    pub fn new(vector: SparseVector, doc_id: u64) -> Self {
        let mut doc_ids = AHashSet::with_capacity(1);
        doc_ids.insert(doc_id);

        VectorNode {
            vector,
            doc_ids,
            postings_offsets: Vec::new(),
            left: None,
            right: None,
            weight: 1,
            angle_when_added: 0.0,
        }
    }

    /// A node reconstructed from disk: no direct document ids, one or more
    /// postings offsets, and the weight it was serialized with.
    pub fn from_disk(vector: SparseVector, postings_offsets: Vec<u64>, weight: u32) -> Self {
        VectorNode {
            vector,
            doc_ids: AHashSet::new(),
            postings_offsets,
            left: None,
            right: None,
            weight: weight.max(1),
            angle_when_added: 0.0,
        }
    }

    /// The representative vector. Merging never replaces it; the first
    /// vector that established a cluster stays its representative.
    pub fn vector(&self) -> &SparseVector {
        &self.vector
    }

    /// Document ids merged directly into this node.
    pub fn doc_ids(&self) -> &AHashSet<u64> {
        &self.doc_ids
    }

    /// Postings offsets this node resolves to (plural after merges).
    pub fn postings_offsets(&self) -> &[u64] {
        &self.postings_offsets
    }

    pub fn left(&self) -> Option<NodeId> {
        self.left
    }

    pub fn right(&self) -> Option<NodeId> {
        self.right
    }

    /// Number of serialized blocks between this node's block and its right
    /// child's block: one for the node itself plus its left subtree.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Similarity to the parent at insertion time, kept for diagnostics.
    pub fn angle_when_added(&self) -> f32 {
        self.angle_when_added
    }

    /// The children marker for this node's serialized block.
    pub fn terminator(&self) -> u8 {
        match (self.left, self.right) {
            (Some(_), Some(_)) => TERMINATOR_BOTH,
            (Some(_), None) => TERMINATOR_LEFT_ONLY,
            (None, Some(_)) => TERMINATOR_RIGHT_ONLY,
            (None, None) => TERMINATOR_NONE,
        }
    }

    fn merge(&mut self, other: VectorNode) {
        self.doc_ids.extend(other.doc_ids);
        self.postings_offsets.extend(other.postings_offsets);
    }
}

/// Result of adding a node to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The vector was a duplicate of an existing cluster and merged into it.
    Merged(NodeId),
    /// The vector established a new cluster.
    Inserted(NodeId),
}

/// A closest-match answer from the in-memory tree.
#[derive(Debug, Clone)]
pub struct TreeHit {
    /// The winning node.
    pub node: NodeId,
    /// The winning score.
    pub score: f32,
    /// Nodes that tied the winning score (only strictly positive scores
    /// participate in ties).
    pub tied: Vec<NodeId>,
}

/// The per-column similarity tree.
#[derive(Debug, Default)]
pub struct VectorTree {
    nodes: Vec<VectorNode>,
    root: Option<NodeId>,
}

impl VectorTree {
    pub fn new() -> Self {
        VectorTree::default()
    }

    /// The first real node. The synthetic rootless sentinel of the original
    /// layout is not represented; extraction is the identity here.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &VectorNode {
        &self.nodes[id as usize]
    }

    /// Total number of clusters.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sum of the document ids held across all clusters.
    pub fn doc_count(&self) -> usize {
        self.nodes.iter().map(|n| n.doc_ids.len()).sum()
    }

    /// Convenience wrapper around [`VectorTree::add`] for a single
    /// `(vector, doc_id)` occurrence.
    pub fn insert(
        &mut self,
        vector: SparseVector,
        doc_id: u64,
        model: &dyn SimilarityModel,
    ) -> AddOutcome {
        self.add(VectorNode::new(vector, doc_id), model)
    }

    /// Walk from the root applying the clustering invariant until the node
    /// merges into an existing cluster or an empty child slot is found.
    pub fn add(&mut self, mut node: VectorNode, model: &dyn SimilarityModel) -> AddOutcome {
        let Some(mut cursor) = self.root else {
            let id = self.push(node);
            self.root = Some(id);
            return AddOutcome::Inserted(id);
        };

        // Ancestors the walk descended left from; each gains the new node
        // in its left subtree, so each gains weight on insertion.
        let mut left_path = Vec::new();

        loop {
            let angle = model.score(node.vector(), self.nodes[cursor as usize].vector());

            if angle >= model.identical_angle() {
                self.nodes[cursor as usize].merge(node);
                return AddOutcome::Merged(cursor);
            } else if angle > model.fold_angle() {
                left_path.push(cursor);
                match self.nodes[cursor as usize].left {
                    Some(left) => cursor = left,
                    None => {
                        node.angle_when_added = angle;
                        let id = self.push(node);
                        self.nodes[cursor as usize].left = Some(id);
                        self.bump_weights(&left_path);
                        return AddOutcome::Inserted(id);
                    }
                }
            } else {
                match self.nodes[cursor as usize].right {
                    Some(right) => cursor = right,
                    None => {
                        node.angle_when_added = angle;
                        let id = self.push(node);
                        self.nodes[cursor as usize].right = Some(id);
                        self.bump_weights(&left_path);
                        return AddOutcome::Inserted(id);
                    }
                }
            }
        }
    }

    /// Closest match against the in-memory tree, under the same traversal
    /// and tie rule the on-disk readers apply.
    pub fn closest_match(
        &self,
        vector: &SparseVector,
        model: &dyn SimilarityModel,
    ) -> Option<TreeHit> {
        let mut cursor = self.root?;
        let mut best = TreeHit {
            node: cursor,
            score: 0.0,
            tied: Vec::new(),
        };
        let mut first = true;

        loop {
            let angle = model.score(vector, self.nodes[cursor as usize].vector());

            if first || angle > best.score {
                best = TreeHit {
                    node: cursor,
                    score: angle,
                    tied: Vec::new(),
                };
                first = false;
            } else if angle > 0.0 && angle == best.score && cursor != best.node {
                best.tied.push(cursor);
            }

            if angle >= model.identical_angle() {
                break;
            } else if angle > model.fold_angle() {
                match self.nodes[cursor as usize].left {
                    Some(left) => cursor = left,
                    None => break,
                }
            } else {
                match self.nodes[cursor as usize].right {
                    Some(right) => cursor = right,
                    None => break,
                }
            }
        }

        Some(best)
    }

    /// The document ids a hit resolves to: the winner's ids plus any
    /// tied nodes' ids.
    pub fn hit_doc_ids(&self, hit: &TreeHit) -> AHashSet<u64> {
        let mut ids = self.nodes[hit.node as usize].doc_ids.clone();
        for &tied in &hit.tied {
            ids.extend(self.nodes[tied as usize].doc_ids.iter().copied());
        }
        ids
    }

    /// Node ids in serialization order: node, left subtree, right subtree.
    pub fn preorder(&self) -> Preorder<'_> {
        Preorder {
            tree: self,
            cursor: self.root,
            stack: Vec::new(),
        }
    }

    /// Rebuild a tree from its pre-order block stream. `blocks` yields each
    /// node paired with its children marker; shape is recovered with an
    /// explicit stack of nodes awaiting their right child.
    pub fn from_preorder<I>(blocks: I) -> Result<VectorTree>
    where
        I: IntoIterator<Item = (VectorNode, u8)>,
    {
        enum Slot {
            Left(NodeId),
            Right(NodeId),
        }

        let mut tree = VectorTree::new();
        let mut pending_right: Vec<NodeId> = Vec::new();
        let mut attach: Option<Slot> = None;

        for (node, terminator) in blocks {
            let id = tree.push(node);

            match attach {
                None if tree.root.is_none() => tree.root = Some(id),
                None => {
                    return Err(CanopyError::corrupt(
                        "node block follows a completed tree",
                    ));
                }
                Some(Slot::Left(parent)) => tree.nodes[parent as usize].left = Some(id),
                Some(Slot::Right(parent)) => tree.nodes[parent as usize].right = Some(id),
            }

            attach = match terminator {
                TERMINATOR_BOTH => {
                    pending_right.push(id);
                    Some(Slot::Left(id))
                }
                TERMINATOR_LEFT_ONLY => Some(Slot::Left(id)),
                TERMINATOR_RIGHT_ONLY => Some(Slot::Right(id)),
                TERMINATOR_NONE => pending_right.pop().map(Slot::Right),
                other => {
                    return Err(CanopyError::corrupt(format!(
                        "unknown node terminator {other}"
                    )));
                }
            };
        }

        if attach.is_some() || !pending_right.is_empty() {
            return Err(CanopyError::corrupt("node block stream ended mid-tree"));
        }

        Ok(tree)
    }

    /// `(depth, width)` of the tree: width is the length of the root's
    /// right-chain, depth the longest left-chain hanging off it.
    pub fn size(&self) -> (usize, usize) {
        let mut width = 0;
        let mut depth = 0;
        let mut node = self.root;

        while let Some(id) = node {
            width += 1;

            let mut d = 1;
            let mut left = self.nodes[id as usize].left;
            while let Some(l) = left {
                d += 1;
                left = self.nodes[l as usize].left;
            }
            depth = depth.max(d);

            node = self.nodes[id as usize].right;
        }

        (depth, width)
    }

    fn push(&mut self, node: VectorNode) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(node);
        id
    }

    fn bump_weights(&mut self, left_path: &[NodeId]) {
        for &id in left_path {
            self.nodes[id as usize].weight += 1;
        }
    }
}

/// Pre-order traversal over node ids.
pub struct Preorder<'a> {
    tree: &'a VectorTree,
    cursor: Option<NodeId>,
    stack: Vec<NodeId>,
}

impl Iterator for Preorder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cursor?;
        let node = &self.tree.nodes[id as usize];

        if let Some(right) = node.right {
            self.stack.push(right);
        }

        self.cursor = node.left.or_else(|| self.stack.pop());

        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SimilarityModel, TextModel};

    fn vector_for(model: &TextModel, word: &str) -> SparseVector {
        model.tokenize(word).remove(0)
    }

    #[test]
    fn test_identical_vectors_merge_into_one_node() {
        let model = TextModel::new();
        let mut tree = VectorTree::new();

        let first = tree.insert(vector_for(&model, "cat"), 1, &model);
        let second = tree.insert(vector_for(&model, "cat"), 2, &model);

        assert!(matches!(first, AddOutcome::Inserted(_)));
        let AddOutcome::Merged(id) = second else {
            panic!("expected a merge");
        };

        assert_eq!(tree.len(), 1);
        let ids = tree.node(id).doc_ids();
        assert!(ids.contains(&1) && ids.contains(&2));
    }

    #[test]
    fn test_fold_and_sibling_routing() {
        let model = TextModel::new();
        let mut tree = VectorTree::new();

        // score(cat, bat) is between the thresholds; score(cat, xyz) is
        // below the fold angle.
        tree.insert(vector_for(&model, "cat"), 1, &model);
        tree.insert(vector_for(&model, "bat"), 2, &model);
        tree.insert(vector_for(&model, "xyz"), 3, &model);

        let root = tree.node(tree.root().unwrap());
        let left = tree.node(root.left().expect("bat under root.left"));
        let right = tree.node(root.right().expect("xyz under root.right"));

        assert!(left.doc_ids().contains(&2));
        assert!(right.doc_ids().contains(&3));
    }

    #[test]
    fn test_merge_does_not_replace_representative() {
        let model = TextModel::with_angles(0.9, 0.5).unwrap();
        let mut tree = VectorTree::new();

        tree.insert(vector_for(&model, "stone"), 1, &model);
        // "tones" is an anagram: identical bag of characters.
        tree.insert(vector_for(&model, "tones"), 2, &model);

        assert_eq!(tree.len(), 1);
        let root = tree.node(tree.root().unwrap());
        assert_eq!(root.vector().label(), Some("stone"));
    }

    #[test]
    fn test_weight_counts_node_plus_left_subtree() {
        let model = TextModel::new();
        let mut tree = VectorTree::new();

        tree.insert(vector_for(&model, "cat"), 1, &model);
        tree.insert(vector_for(&model, "bat"), 2, &model); // cat.left
        tree.insert(vector_for(&model, "rat"), 3, &model); // under the fold chain
        tree.insert(vector_for(&model, "xyz"), 4, &model); // cat.right

        let root = tree.node(tree.root().unwrap());
        // root's block plus its three-deep... the fold chain holds bat and
        // rat, so three blocks separate root from its right child.
        assert_eq!(root.weight(), 3);
        assert_eq!(tree.node(root.right().unwrap()).weight(), 1);
    }

    #[test]
    fn test_preorder_visits_node_left_right() {
        let model = TextModel::new();
        let mut tree = VectorTree::new();

        tree.insert(vector_for(&model, "cat"), 1, &model);
        tree.insert(vector_for(&model, "bat"), 2, &model);
        tree.insert(vector_for(&model, "xyz"), 3, &model);

        let labels: Vec<_> = tree
            .preorder()
            .map(|id| tree.node(id).vector().label().unwrap().to_string())
            .collect();

        assert_eq!(labels, vec!["cat", "bat", "xyz"]);
    }

    #[test]
    fn test_closest_match_finds_identical() {
        let model = TextModel::new();
        let mut tree = VectorTree::new();

        tree.insert(vector_for(&model, "cat"), 1, &model);
        tree.insert(vector_for(&model, "bat"), 2, &model);
        tree.insert(vector_for(&model, "xyz"), 3, &model);

        let hit = tree
            .closest_match(&vector_for(&model, "bat"), &model)
            .unwrap();
        assert!(hit.score >= model.identical_angle());
        assert!(tree.hit_doc_ids(&hit).contains(&2));
    }

    #[test]
    fn test_from_preorder_round_trip() {
        let model = TextModel::new();
        let mut tree = VectorTree::new();

        for (doc_id, word) in ["cat", "bat", "rat", "xyz", "pqw", "cab"].iter().enumerate() {
            tree.insert(vector_for(&model, word), doc_id as u64, &model);
        }

        let blocks: Vec<_> = tree
            .preorder()
            .map(|id| {
                let node = tree.node(id);
                (
                    VectorNode::from_disk(node.vector().clone(), vec![], node.weight()),
                    node.terminator(),
                )
            })
            .collect();

        let rebuilt = VectorTree::from_preorder(blocks).unwrap();
        assert_eq!(rebuilt.len(), tree.len());

        let original: Vec<_> = tree
            .preorder()
            .map(|id| {
                let n = tree.node(id);
                (n.vector().clone(), n.terminator(), n.weight())
            })
            .collect();
        let restored: Vec<_> = rebuilt
            .preorder()
            .map(|id| {
                let n = rebuilt.node(id);
                (n.vector().clone(), n.terminator(), n.weight())
            })
            .collect();
        assert_eq!(original, restored);
    }

    #[test]
    fn test_from_preorder_rejects_truncated_stream() {
        let model = TextModel::new();
        let node = VectorNode::from_disk(vector_for(&model, "cat"), vec![], 1);

        let result = VectorTree::from_preorder(vec![(node, TERMINATOR_LEFT_ONLY)]);
        assert!(matches!(result, Err(CanopyError::Corrupt(_))));
    }
}
