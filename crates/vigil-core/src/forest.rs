//! Random-projection forest for approximate nearest-neighbor search.
//!
//! Each tree recursively splits the item set by a hyperplane through the
//! origin, chosen from the difference of two random members. Queries walk all
//! trees best-first, ordered by the margin to each hyperplane, then score the
//! gathered candidates exactly with angular distance.

use crate::types::{angular_from_cosine, normalize};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BinaryHeap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("index is empty")]
    Empty,
    #[error("index has not been built")]
    NotBuilt,
    #[error("dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },
}

/// Build parameters for an [`AngularForest`].
#[derive(Debug, Clone)]
pub struct ForestConfig {
    /// Number of trees. More trees give better recall at build-time cost.
    pub n_trees: usize,
    /// Maximum number of items in a leaf.
    pub leaf_size: usize,
    /// RNG seed; identical input and seed give an identical forest.
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 50,
            leaf_size: 16,
            seed: 0x5EED_F00D,
        }
    }
}

/// A single query hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub label: u32,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Leaf(Vec<u32>),
    /// A zero `normal` marks a random split: queries explore both sides.
    Split { normal: Vec<f32>, left: u32, right: u32 },
}

/// Immutable approximate nearest-neighbor index over unit vectors.
#[derive(Debug, Clone)]
pub struct AngularForest {
    pub(crate) dim: usize,
    pub(crate) vectors: Vec<Vec<f32>>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) roots: Vec<u32>,
}

#[derive(Clone, Copy)]
struct Frontier {
    margin: f32,
    node: u32,
}

/// Max-heap on margin: most promising node first.
impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.margin
            .partial_cmp(&other.margin)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}
impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.margin == other.margin && self.node == other.node
    }
}
impl Eq for Frontier {}

impl AngularForest {
    /// Build a forest over `items`; item `i` is returned as label `i`.
    pub fn build(dim: usize, items: &[Vec<f32>], cfg: &ForestConfig) -> Result<Self, IndexError> {
        if items.is_empty() {
            return Err(IndexError::Empty);
        }
        if let Some(bad) = items.iter().find(|v| v.len() != dim) {
            return Err(IndexError::DimensionMismatch { got: bad.len(), want: dim });
        }

        let mut forest = Self {
            dim,
            vectors: items.iter().map(|v| normalize(v)).collect(),
            nodes: Vec::new(),
            roots: Vec::new(),
        };

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let leaf_size = cfg.leaf_size.max(1);
        let all: Vec<u32> = (0..items.len() as u32).collect();

        for _ in 0..cfg.n_trees.max(1) {
            let root = forest.build_node(all.clone(), leaf_size, &mut rng);
            forest.roots.push(root);
        }

        tracing::debug!(
            items = forest.len(),
            trees = forest.roots.len(),
            nodes = forest.nodes.len(),
            "built angular forest"
        );

        Ok(forest)
    }

    fn build_node(&mut self, items: Vec<u32>, leaf_size: usize, rng: &mut StdRng) -> u32 {
        if items.len() <= leaf_size {
            self.nodes.push(Node::Leaf(items));
            return (self.nodes.len() - 1) as u32;
        }

        let (normal, left_items, right_items) = self.split(items, rng);
        let left = self.build_node(left_items, leaf_size, rng);
        let right = self.build_node(right_items, leaf_size, rng);
        self.nodes.push(Node::Split { normal, left, right });
        (self.nodes.len() - 1) as u32
    }

    fn split(&self, mut items: Vec<u32>, rng: &mut StdRng) -> (Vec<f32>, Vec<u32>, Vec<u32>) {
        let i = rng.gen_range(0..items.len());
        let mut j = rng.gen_range(0..items.len() - 1);
        if j >= i {
            j += 1;
        }

        let a = &self.vectors[items[i] as usize];
        let b = &self.vectors[items[j] as usize];
        let diff: Vec<f32> = a.iter().zip(b).map(|(x, y)| x - y).collect();
        let normal = normalize(&diff);

        if normal.iter().any(|&v| v != 0.0) {
            let (right, left): (Vec<u32>, Vec<u32>) = items
                .iter()
                .partition(|&&id| dot(&normal, &self.vectors[id as usize]) >= 0.0);
            if !left.is_empty() && !right.is_empty() {
                return (normal, left, right);
            }
        }

        // Degenerate hyperplane: halve at random.
        items.shuffle(rng);
        let right = items.split_off(items.len() / 2);
        (vec![0.0; self.dim], items, right)
    }

    /// Return up to `k` nearest labels ordered by ascending angular distance.
    ///
    /// `search_k` bounds the number of candidates gathered before exact
    /// scoring; `None` means `n_trees * k`.
    pub fn query(
        &self,
        query: &[f32],
        k: usize,
        search_k: Option<usize>,
    ) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.dim {
            return Err(IndexError::DimensionMismatch { got: query.len(), want: self.dim });
        }
        if self.vectors.is_empty() {
            return Err(IndexError::Empty);
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let q = normalize(query);
        let budget = search_k.unwrap_or(self.roots.len() * k).max(k);

        let mut heap: BinaryHeap<Frontier> = self
            .roots
            .iter()
            .map(|&node| Frontier { margin: f32::INFINITY, node })
            .collect();
        let mut candidates: Vec<u32> = Vec::with_capacity(budget);

        while candidates.len() < budget {
            let Some(Frontier { margin, node }) = heap.pop() else {
                break;
            };
            match &self.nodes[node as usize] {
                Node::Leaf(items) => candidates.extend_from_slice(items),
                Node::Split { normal, left, right } => {
                    let m = dot(normal, &q);
                    heap.push(Frontier { margin: margin.min(m), node: *right });
                    heap.push(Frontier { margin: margin.min(-m), node: *left });
                }
            }
        }

        candidates.sort_unstable();
        candidates.dedup();

        let mut hits: Vec<Neighbor> = candidates
            .into_iter()
            .map(|label| Neighbor {
                label,
                distance: angular_from_cosine(dot(&self.vectors[label as usize], &q)),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.label.cmp(&b.label))
        });
        hits.truncate(k);
        Ok(hits)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn n_trees(&self) -> usize {
        self.roots.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
