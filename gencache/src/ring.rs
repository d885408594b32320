//! Consistent-hash ring for spreading keys over the nodes of one bucket.
//!
//! Ketama-style: every node contributes [`POINTS_PER_NODE`] points derived
//! from SHA-256 of its label, and a key belongs to the first point at or
//! after its own hash. The layout depends only on the node labels, so
//! separate processes agree on placement, and removing a node only moves
//! the keys that node owned.

use sha2::{Digest, Sha256};

/// Points placed on the ring for each node.
pub const POINTS_PER_NODE: usize = 160;

/// Consistent-hash ring over node indices.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: Vec<(u32, usize)>,
    nodes: usize,
}

impl HashRing {
    /// Build a ring from node labels (usually their addresses). The
    /// position of a label in the slice is the index returned by
    /// [`HashRing::node_for`].
    pub fn new<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut points = Vec::with_capacity(labels.len() * POINTS_PER_NODE);

        for (index, label) in labels.iter().enumerate() {
            // Each digest yields four points
            for replica in 0..POINTS_PER_NODE / 4 {
                let digest = Sha256::digest(format!("{}-{}", label.as_ref(), replica).as_bytes());
                for chunk in digest[..16].chunks_exact(4) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push((point, index));
                }
            }
        }

        points.sort_unstable();

        Self {
            points,
            nodes: labels.len(),
        }
    }

    /// Index of the node owning `key`, or `None` for an empty ring.
    pub fn node_for(&self, key: &str) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }

        let hash = hash_key(key);
        let position = self.points.partition_point(|(point, _)| *point < hash);
        let (_, node) = self.points[position % self.points.len()];
        Some(node)
    }

    /// Number of nodes on the ring.
    pub fn len(&self) -> usize {
        self.nodes
    }

    /// Whether the ring has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes == 0
    }
}

fn hash_key(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
