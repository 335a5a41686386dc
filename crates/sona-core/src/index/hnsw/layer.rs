//! Per-layer adjacency arena.
//!
//! Nodes are dense `NodeId` slots; each layer holds one neighbor list per
//! slot. Mutation happens under the index-wide writer lock, so the lists
//! need no interior locking.

/// Dense slot identifier for a node in the graph arena.
pub(super) type NodeId = usize;

/// A single layer in the HNSW hierarchy.
#[derive(Debug, Default, Clone)]
pub(super) struct Layer {
    /// Adjacency list: slot -> neighbor slots.
    neighbors: Vec<Vec<NodeId>>,
}

impl Layer {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            neighbors: vec![Vec::new(); capacity],
        }
    }

    /// Grows the arena so `node` has a (possibly empty) neighbor list.
    pub(super) fn ensure_capacity(&mut self, node: NodeId) {
        if self.neighbors.len() <= node {
            self.neighbors.resize_with(node + 1, Vec::new);
        }
    }

    pub(super) fn neighbors(&self, node: NodeId) -> &[NodeId] {
        self.neighbors.get(node).map_or(&[], Vec::as_slice)
    }

    pub(super) fn set_neighbors(&mut self, node: NodeId, neighbors: Vec<NodeId>) {
        self.ensure_capacity(node);
        self.neighbors[node] = neighbors;
    }

    /// Adds a link, keeping the neighbor set duplicate-free.
    pub(super) fn add_neighbor(&mut self, node: NodeId, neighbor: NodeId) {
        self.ensure_capacity(node);
        let list = &mut self.neighbors[node];
        if !list.contains(&neighbor) {
            list.push(neighbor);
        }
    }

    /// Removes a link in one direction. Returns true if it existed.
    pub(super) fn remove_neighbor(&mut self, node: NodeId, neighbor: NodeId) -> bool {
        if let Some(list) = self.neighbors.get_mut(node) {
            if let Some(pos) = list.iter().position(|&n| n == neighbor) {
                list.swap_remove(pos);
                return true;
            }
        }
        false
    }

    /// Clears a node's own neighbor list, returning the previous links.
    pub(super) fn take_neighbors(&mut self, node: NodeId) -> Vec<NodeId> {
        self.neighbors
            .get_mut(node)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Removes every reference to `target` across all neighbor lists.
    pub(super) fn purge_references(&mut self, target: NodeId) {
        for list in &mut self.neighbors {
            list.retain(|&n| n != target);
        }
    }

    pub(super) fn degree(&self, node: NodeId) -> usize {
        self.neighbors.get(node).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_duplicate_free() {
        let mut layer = Layer::new(4);
        layer.add_neighbor(0, 1);
        layer.add_neighbor(0, 1);
        layer.add_neighbor(0, 2);
        assert_eq!(layer.degree(0), 2);
    }

    #[test]
    fn remove_and_take() {
        let mut layer = Layer::new(2);
        layer.add_neighbor(0, 1);
        layer.add_neighbor(1, 0);
        assert!(layer.remove_neighbor(0, 1));
        assert!(!layer.remove_neighbor(0, 1));
        assert_eq!(layer.take_neighbors(1), vec![0]);
        assert_eq!(layer.degree(1), 0);
    }

    #[test]
    fn out_of_range_reads_are_empty() {
        let layer = Layer::new(1);
        assert!(layer.neighbors(42).is_empty());
        assert_eq!(layer.degree(42), 0);
    }
}
