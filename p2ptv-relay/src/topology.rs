//! Overlay tree bookkeeping
//!
//! Decides where a newly identified client attaches and where the children
//! of a departing client go. The gateway is the implicit root.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::PeerId;

/// Where a client attaches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Gateway,
    Client(PeerId),
}

#[derive(Debug, Default)]
struct Node {
    parent: Option<PeerId>,
    children: BTreeSet<PeerId>,
}

#[derive(Debug)]
pub struct Topology {
    /// Direct gateway children allowed, 0 for no limit
    gateway_fanout: usize,
    peer_fanout: usize,
    nodes: BTreeMap<PeerId, Node>,
}

impl Topology {
    #[must_use]
    pub fn new(gateway_fanout: usize, peer_fanout: usize) -> Self {
        Self {
            gateway_fanout,
            peer_fanout: peer_fanout.max(1),
            nodes: BTreeMap::new(),
        }
    }

    /// Place a new client and record it
    pub fn place(&mut self, id: PeerId) -> Placement {
        let placement = self.choose(&id, &BTreeSet::new());
        self.attach(id, &placement);
        placement
    }

    /// Forget a client
    ///
    /// Its children are placed again, never below themselves; the new
    /// placements are returned in id order.
    pub fn remove(&mut self, id: &PeerId) -> Vec<(PeerId, Placement)> {
        let Some(node) = self.nodes.remove(id) else {
            return Vec::new();
        };
        if let Some(parent) = &node.parent {
            if let Some(parent) = self.nodes.get_mut(parent) {
                parent.children.remove(id);
            }
        }

        let mut placements = Vec::with_capacity(node.children.len());
        for orphan in node.children {
            let excluded = self.subtree(&orphan);
            let placement = self.choose(&orphan, &excluded);
            if let Some(node) = self.nodes.get_mut(&orphan) {
                node.parent = None;
            }
            self.link(&orphan, &placement);
            placements.push((orphan, placement));
        }
        placements
    }

    #[must_use]
    pub fn parent_of(&self, id: &PeerId) -> Option<Placement> {
        let node = self.nodes.get(id)?;
        Some(match &node.parent {
            Some(parent) => Placement::Client(parent.clone()),
            None => Placement::Gateway,
        })
    }

    #[must_use]
    pub fn children_of(&self, id: &PeerId) -> Vec<PeerId> {
        self.nodes
            .get(id)
            .map(|node| node.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Distance from the gateway, 1 for a direct child
    #[must_use]
    pub fn depth(&self, id: &PeerId) -> Option<usize> {
        let mut depth = 1;
        let mut node = self.nodes.get(id)?;
        while let Some(parent) = &node.parent {
            node = self.nodes.get(parent)?;
            depth += 1;
        }
        Some(depth)
    }

    #[must_use]
    pub fn gateway_children(&self) -> usize {
        self.nodes.values().filter(|node| node.parent.is_none()).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn choose(&self, id: &PeerId, excluded: &BTreeSet<PeerId>) -> Placement {
        let gateway_children = self
            .nodes
            .iter()
            .filter(|(other, node)| *other != id && node.parent.is_none())
            .count();
        if self.gateway_fanout == 0 || gateway_children < self.gateway_fanout {
            return Placement::Gateway;
        }

        // shallowest client with room, ties broken by id
        self.nodes
            .iter()
            .filter(|(other, node)| {
                *other != id && !excluded.contains(*other) && node.children.len() < self.peer_fanout
            })
            .filter_map(|(other, _)| self.depth(other).map(|depth| (depth, other)))
            .min()
            .map_or(Placement::Gateway, |(_, parent)| Placement::Client(parent.clone()))
    }

    fn attach(&mut self, id: PeerId, placement: &Placement) {
        self.nodes.entry(id.clone()).or_default();
        self.link(&id, placement);
    }

    fn link(&mut self, id: &PeerId, placement: &Placement) {
        if let Placement::Client(parent) = placement {
            if let Some(node) = self.nodes.get_mut(parent) {
                node.children.insert(id.clone());
            }
            if let Some(node) = self.nodes.get_mut(id) {
                node.parent = Some(parent.clone());
            }
        }
    }

    fn subtree(&self, root: &PeerId) -> BTreeSet<PeerId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.children.iter().cloned());
            }
            seen.insert(id);
        }
        seen
    }
}
