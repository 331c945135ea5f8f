//! Connection graph: undirected adjacency over registered agent ids.
//!
//! The graph tracks nodes as well as edges so it can refuse edges to unknown
//! ids on its own. It is not synchronized; the fabric keeps it behind its
//! state mutex.

use agentfabric_types::agent::AgentId;
use agentfabric_types::error::{FabricError, FabricResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Symmetric adjacency map. Invariant: `b ∈ adj[a]` iff `a ∈ adj[b]`, and
/// `a ∉ adj[a]`.
#[derive(Debug, Default, Clone)]
pub struct ConnectionGraph {
    adjacency: HashMap<AgentId, BTreeSet<AgentId>>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Returns `false` if it was already present.
    pub fn add_node(&mut self, id: AgentId) -> bool {
        if self.adjacency.contains_key(id.as_str()) {
            return false;
        }
        self.adjacency.insert(id, BTreeSet::new());
        true
    }

    /// Remove a node that has no edges.
    pub fn remove_node(&mut self, id: &str) -> FabricResult<()> {
        let degree = self.try_degree(id)?;
        if degree > 0 {
            return Err(FabricError::HasConnections {
                id: AgentId::from(id),
                count: degree as u32,
            });
        }
        self.adjacency.remove(id);
        Ok(())
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.adjacency.contains_key(id)
    }

    /// Insert the symmetric edge `(a, b)`.
    ///
    /// Every precondition is checked before anything is written, so a failed
    /// call leaves the graph untouched.
    pub fn add_edge(&mut self, a: &str, b: &str) -> FabricResult<()> {
        let a_id = self.node_id(a)?;
        let b_id = self.node_id(b)?;
        if a == b {
            return Err(FabricError::SelfConnection(a_id));
        }
        if self.contains_edge(a, b) {
            return Err(FabricError::AlreadyConnected { a: a_id, b: b_id });
        }

        if let Some(set) = self.adjacency.get_mut(a) {
            set.insert(b_id);
        }
        if let Some(set) = self.adjacency.get_mut(b) {
            set.insert(a_id);
        }
        Ok(())
    }

    /// Remove the symmetric edge `(a, b)`.
    pub fn remove_edge(&mut self, a: &str, b: &str) -> FabricResult<()> {
        if !self.contains_edge(a, b) {
            return Err(FabricError::not_connected(a, b));
        }
        if let Some(set) = self.adjacency.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = self.adjacency.get_mut(b) {
            set.remove(a);
        }
        Ok(())
    }

    pub fn contains_edge(&self, a: &str, b: &str) -> bool {
        self.adjacency
            .get(a)
            .map(|set| set.contains(b))
            .unwrap_or(false)
    }

    /// Degree of a node; 0 for unknown ids.
    pub fn degree(&self, id: &str) -> usize {
        self.adjacency.get(id).map(BTreeSet::len).unwrap_or(0)
    }

    fn try_degree(&self, id: &str) -> FabricResult<usize> {
        self.adjacency
            .get(id)
            .map(BTreeSet::len)
            .ok_or_else(|| FabricError::missing(id))
    }

    /// Snapshot of a node's neighbors.
    pub fn neighbors(&self, id: &str) -> FabricResult<Neighbors> {
        let set = self
            .adjacency
            .get(id)
            .ok_or_else(|| FabricError::missing(id))?;
        Ok(Neighbors {
            ids: set.iter().cloned().collect(),
        })
    }

    /// Each undirected edge once as `(smaller, larger)`, sorted.
    pub fn edges(&self) -> Vec<(AgentId, AgentId)> {
        let mut edges: Vec<(AgentId, AgentId)> = self
            .adjacency
            .iter()
            .flat_map(|(a, set)| {
                set.iter()
                    .filter(move |b| a < *b)
                    .map(move |b| (a.clone(), b.clone()))
            })
            .collect();
        edges.sort();
        edges
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    /// Drop every edge, keeping the nodes.
    pub fn clear_edges(&mut self) {
        for set in self.adjacency.values_mut() {
            set.clear();
        }
    }

    fn node_id(&self, id: &str) -> FabricResult<AgentId> {
        self.adjacency
            .get_key_value(id)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| FabricError::missing(id))
    }
}

/// A snapshot of one agent's neighbors.
///
/// Cheap to clone and iterable any number of times; later graph mutations
/// are never observed through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbors {
    ids: Arc<[AgentId]>,
}

impl Neighbors {
    pub fn iter(&self) -> std::slice::Iter<'_, AgentId> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|n| n.as_str() == id)
    }
}

impl<'a> IntoIterator for &'a Neighbors {
    type Item = &'a AgentId;
    type IntoIter = std::slice::Iter<'a, AgentId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}
