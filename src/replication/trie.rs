//! Path Trie
//!
//! Indexes mappings by their source path. Nodes live in an arena and are
//! addressed by `NodeIndex`; freed slots are reused.

use crate::domain::value_objects::Value;
use crate::replication::types::MappingId;
use std::collections::{BTreeMap, BTreeSet};

/// Address of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(usize);

/// A position to look up children from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieCursor {
    Root,
    Node(NodeIndex),
}

#[derive(Debug)]
struct Node {
    key: Value,
    parent: Option<NodeIndex>,
    children: BTreeMap<Value, NodeIndex>,
    mappings: BTreeSet<MappingId>,
}

#[derive(Debug, Default)]
pub struct PathTrie {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    roots: BTreeMap<Value, NodeIndex>,
    live: usize,
}

impl PathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `mapping` at `path`, creating nodes as needed.
    ///
    /// Returns `false` if it was already there or `path` is empty.
    pub fn insert(&mut self, path: &[Value], mapping: MappingId) -> bool {
        let mut at = TrieCursor::Root;
        for key in path {
            let index = match self.child(at, key) {
                Some(index) => index,
                None => {
                    let parent = match at {
                        TrieCursor::Root => None,
                        TrieCursor::Node(index) => Some(index),
                    };
                    let index = self.alloc(Node {
                        key: key.clone(),
                        parent,
                        children: BTreeMap::new(),
                        mappings: BTreeSet::new(),
                    });
                    match self.children_mut(at) {
                        Some(children) => children.insert(key.clone(), index),
                        None => return false,
                    };
                    index
                }
            };
            at = TrieCursor::Node(index);
        }

        match at {
            TrieCursor::Root => false,
            TrieCursor::Node(index) => self
                .node_mut(index)
                .is_some_and(|node| node.mappings.insert(mapping)),
        }
    }

    /// Remove `mapping` from `path` and prune ancestors left empty.
    pub fn remove(&mut self, path: &[Value], mapping: MappingId) -> bool {
        let Some(index) = self.find(path) else {
            return false;
        };
        let removed = self
            .node_mut(index)
            .is_some_and(|node| node.mappings.remove(&mapping));
        if removed {
            self.prune(index);
        }
        removed
    }

    /// The node at exactly `path`.
    pub fn find(&self, path: &[Value]) -> Option<NodeIndex> {
        let mut at = TrieCursor::Root;
        for key in path {
            at = TrieCursor::Node(self.child(at, key)?);
        }
        match at {
            TrieCursor::Root => None,
            TrieCursor::Node(index) => Some(index),
        }
    }

    pub fn child(&self, at: TrieCursor, key: &Value) -> Option<NodeIndex> {
        self.children(at)?.get(key).copied()
    }

    pub fn has_children(&self, index: NodeIndex) -> bool {
        self.node(index).is_some_and(|node| !node.children.is_empty())
    }

    /// Mappings stored at `index`.
    pub fn mappings(&self, index: NodeIndex) -> impl Iterator<Item = MappingId> + '_ {
        self.node(index)
            .into_iter()
            .flat_map(|node| node.mappings.iter().copied())
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.live
    }

    /// Every live node holds a mapping or a child, links agree in both
    /// directions, and the live count matches the arena.
    pub fn check_pruned(&self) -> bool {
        let occupied = self.nodes.iter().filter(|slot| slot.is_some()).count();
        if occupied != self.live {
            return false;
        }

        let roots_ok = self
            .roots
            .iter()
            .all(|(key, index)| self.node(*index).is_some_and(|n| n.parent.is_none() && &n.key == key));

        roots_ok
            && self.nodes.iter().enumerate().all(|(i, slot)| match slot {
                None => true,
                Some(node) => {
                    (!node.mappings.is_empty() || !node.children.is_empty())
                        && node.children.iter().all(|(key, child)| {
                            self.node(*child).is_some_and(|c| {
                                c.parent == Some(NodeIndex(i)) && &c.key == key
                            })
                        })
                }
            })
    }

    fn prune(&mut self, mut index: NodeIndex) {
        loop {
            let Some(node) = self.node(index) else {
                return;
            };
            if !node.mappings.is_empty() || !node.children.is_empty() {
                return;
            }
            let parent = node.parent;
            let key = node.key.clone();

            self.nodes[index.0] = None;
            self.free.push(index.0);
            self.live -= 1;

            match parent {
                Some(parent) => {
                    if let Some(node) = self.node_mut(parent) {
                        node.children.remove(&key);
                    }
                    index = parent;
                }
                None => {
                    self.roots.remove(&key);
                    return;
                }
            }
        }
    }

    fn alloc(&mut self, node: Node) -> NodeIndex {
        self.live += 1;
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeIndex(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeIndex(self.nodes.len() - 1)
            }
        }
    }

    fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.0)?.as_ref()
    }

    fn node_mut(&mut self, index: NodeIndex) -> Option<&mut Node> {
        self.nodes.get_mut(index.0)?.as_mut()
    }

    fn children(&self, at: TrieCursor) -> Option<&BTreeMap<Value, NodeIndex>> {
        match at {
            TrieCursor::Root => Some(&self.roots),
            TrieCursor::Node(index) => self.node(index).map(|node| &node.children),
        }
    }

    fn children_mut(&mut self, at: TrieCursor) -> Option<&mut BTreeMap<Value, NodeIndex>> {
        match at {
            TrieCursor::Root => Some(&mut self.roots),
            TrieCursor::Node(index) => self.node_mut(index).map(|node| &mut node.children),
        }
    }
}
