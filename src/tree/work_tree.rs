// src/tree/work_tree.rs
//! Splittable work queue
//!
//! Root items wait in one FIFO queue. Every group gets its own pair of
//! sub-queues (direct leaves, then child groups) held in an arena keyed by
//! the group's full key path. Popping a group descends into it and, while
//! the group still has undispatched children, puts it back at the end of
//! its parent's queue so another worker can steal the rest.
//!
//! ```text
//! root: [G1, L, G2]          pop() -> [G1, a]      root: [L, G2, G1]
//! G1:   examples [a, b]                            G1: examples [b]
//!       groups   [H]                                   groups   [H]
//! ```
//!
//! All mutation happens on the master's single loop, so nothing here locks.

use crate::tree::item::{Assignment, ItemKind, TagFilter, Tags, WorkItem};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace, warn};

/// Default bound on how often one group is re-enqueued
pub const DEFAULT_MAX_SPLITS: u32 = 20;

/// What a worker is asking for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopRequest {
    /// Next root item
    Root,

    /// First root item carrying this tag, else the next root item
    Tagged(TagFilter),

    /// Next direct leaf of the group at this path
    Examples(Vec<String>),

    /// Next child group of the group at this path, descended to a leaf
    Groups(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    kind: ItemKind,
    tags: Tags,
}

#[derive(Debug, Default)]
struct GroupQueue {
    examples: VecDeque<Entry>,
    groups: VecDeque<Entry>,
    tags: Tags,
    splits: u32,
    /// Undispatched leaves anywhere below this group
    outstanding: usize,
}

impl GroupQueue {
    fn has_children(&self) -> bool {
        !self.examples.is_empty() || !self.groups.is_empty()
    }
}

/// Counters describing the queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub root_len: usize,
    pub live_groups: usize,
    pub pending_leaves: usize,
    pub dispatched: u64,
    pub splits: u64,
    pub duplicates: u64,
}

/// The master's authoritative queue
#[derive(Debug)]
pub struct WorkTree {
    root: VecDeque<Entry>,
    groups: HashMap<Vec<String>, GroupQueue>,
    sources: HashMap<String, String>,
    /// Every root key ingested this run, drained or not
    seen: HashSet<String>,
    max_splits: u32,
    dispatched: u64,
    splits: u64,
    duplicates: u64,
}

impl Default for WorkTree {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SPLITS)
    }
}

impl WorkTree {
    /// Create an empty tree
    pub fn new(max_splits: u32) -> Self {
        Self {
            root: VecDeque::new(),
            groups: HashMap::new(),
            sources: HashMap::new(),
            seen: HashSet::new(),
            max_splits,
            dispatched: 0,
            splits: 0,
            duplicates: 0,
        }
    }

    /// Build a tree from a known forest, longest estimated duration first
    pub fn from_forest(items: Vec<(Option<String>, WorkItem)>, max_splits: u32) -> Self {
        let mut items = items;
        // Stable, so items without history keep their discovery order at the end
        items.sort_by(|(_, a), (_, b)| {
            let a = a.estimated_duration.unwrap_or(0.0);
            let b = b.estimated_duration.unwrap_or(0.0);
            b.total_cmp(&a)
        });

        let mut tree = Self::new(max_splits);
        for (source, item) in items {
            tree.ingest(source, item);
        }

        debug!("Work tree built with {} root items", tree.root.len());
        tree
    }

    /// Append a root item at the back of the queue
    ///
    /// Returns false when the item was skipped (no leaves, or duplicate key).
    pub fn ingest(&mut self, source: Option<String>, item: WorkItem) -> bool {
        if item.is_exhausted() {
            trace!("Skipping empty group {}", item.key);
            return false;
        }

        if !self.seen.insert(item.key.clone()) {
            warn!("Duplicate root item {}, ignoring the later one", item.key);
            self.duplicates += 1;
            return false;
        }

        if let Some(source) = source {
            self.sources.insert(item.key.clone(), source);
        }

        let entry = Entry {
            key: item.key.clone(),
            kind: item.kind,
            tags: item.tags.clone(),
        };
        if item.kind == ItemKind::Group {
            self.register_group(vec![item.key.clone()], item);
        }
        self.root.push_back(entry);
        true
    }

    fn register_group(&mut self, scope: Vec<String>, item: WorkItem) {
        let mut queue = GroupQueue {
            tags: item.tags.clone(),
            outstanding: item.leaf_count(),
            ..Default::default()
        };

        for child in item.children {
            match child.kind {
                ItemKind::Leaf => queue.examples.push_back(Entry {
                    key: child.key,
                    kind: ItemKind::Leaf,
                    tags: child.tags,
                }),
                ItemKind::Group if child.is_exhausted() => {}
                ItemKind::Group => {
                    queue.groups.push_back(Entry {
                        key: child.key.clone(),
                        kind: ItemKind::Group,
                        tags: child.tags.clone(),
                    });
                    let mut child_scope = scope.clone();
                    child_scope.push(child.key.clone());
                    self.register_group(child_scope, child);
                }
            }
        }

        self.groups.insert(scope, queue);
    }

    /// Keep only the listed root keys, in the listed order
    pub fn restrict_to(&mut self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }

        let position = |key: &str| keys.iter().position(|k| k == key);
        let mut kept: Vec<Entry> = self
            .root
            .drain(..)
            .filter(|e| position(&e.key).is_some())
            .collect();
        kept.sort_by_key(|e| position(&e.key));

        self.groups.retain(|path, _| position(&path[0]).is_some());
        self.sources.retain(|key, _| position(key).is_some());
        self.root = kept.into();
    }

    /// Pop the next item for a request
    ///
    /// `None` means nothing is available under that scope right now.
    pub fn pop(&mut self, request: &PopRequest) -> Option<Assignment> {
        let path = match request {
            PopRequest::Root => self.pop_root(None),
            PopRequest::Tagged(filter) => self.pop_root(Some(filter)).or_else(|| self.pop_root(None)),
            PopRequest::Examples(scope) => self.pop_example(scope),
            PopRequest::Groups(scope) => self.pop_group(scope),
        }?;

        self.dispatched += 1;
        let source = self.sources.get(&path[0]).cloned();
        trace!("Dispatching {}", path.join(" > "));
        Some(Assignment::new(source, path))
    }

    fn pop_root(&mut self, filter: Option<&TagFilter>) -> Option<Vec<String>> {
        loop {
            let index = match filter {
                None => 0,
                Some(filter) => self.root.iter().position(|e| e.tags.matches(filter))?,
            };
            let entry = self.root.remove(index)?;

            match entry.kind {
                ItemKind::Leaf => return Some(vec![entry.key]),
                ItemKind::Group => {
                    let scope = vec![entry.key.clone()];
                    if let Some(path) = self.descend(&scope) {
                        self.requeue(&scope, entry, None);
                        return Some(path);
                    }
                    trace!("Discarding exhausted group {}", entry.key);
                }
            }
        }
    }

    fn descend(&mut self, scope: &[String]) -> Option<Vec<String>> {
        self.pop_example(scope).or_else(|| self.pop_group(scope))
    }

    fn pop_example(&mut self, scope: &[String]) -> Option<Vec<String>> {
        let entry = self.groups.get_mut(scope)?.examples.pop_front()?;
        self.leaf_dispatched(scope);

        let mut path = scope.to_vec();
        path.push(entry.key);
        Some(path)
    }

    fn pop_group(&mut self, scope: &[String]) -> Option<Vec<String>> {
        loop {
            let entry = self.groups.get_mut(scope)?.groups.pop_front()?;
            let mut child = scope.to_vec();
            child.push(entry.key.clone());

            if let Some(path) = self.descend(&child) {
                self.requeue(&child, entry, Some(scope));
                return Some(path);
            }
        }
    }

    /// Put a partially drained group back for another worker to steal
    fn requeue(&mut self, scope: &[String], entry: Entry, parent: Option<&[String]>) {
        let max_splits = self.max_splits;
        let Some(queue) = self.groups.get_mut(scope) else {
            return;
        };
        if queue.tags.no_split() || !queue.has_children() || queue.splits >= max_splits {
            return;
        }
        queue.splits += 1;
        self.splits += 1;
        trace!("Splitting {} ({} of {})", scope.join(" > "), queue.splits, max_splits);

        match parent {
            None => self.root.push_back(entry),
            Some(parent) => {
                if let Some(parent) = self.groups.get_mut(parent) {
                    parent.groups.push_back(entry);
                }
            }
        }
    }

    /// Decrement every enclosing group's counter, dropping drained groups
    fn leaf_dispatched(&mut self, scope: &[String]) {
        for depth in 1..=scope.len() {
            let prefix = &scope[..depth];
            let drained = match self.groups.get_mut(prefix) {
                Some(queue) => {
                    queue.outstanding = queue.outstanding.saturating_sub(1);
                    queue.outstanding == 0
                }
                None => false,
            };
            if drained {
                self.groups.remove(prefix);
            }
        }
    }

    /// Whether any leaf is still waiting to be dispatched
    pub fn has_pending(&self) -> bool {
        !self.groups.is_empty() || self.root.iter().any(|e| e.kind == ItemKind::Leaf)
    }

    pub fn root_len(&self) -> usize {
        self.root.len()
    }

    /// Root keys that were discovered in each source
    pub fn source_of(&self, root_key: &str) -> Option<&str> {
        self.sources.get(root_key).map(String::as_str)
    }

    pub fn stats(&self) -> TreeStats {
        let root_leaves = self.root.iter().filter(|e| e.kind == ItemKind::Leaf).count();
        let grouped: usize = self
            .groups
            .iter()
            .filter(|(path, _)| path.len() == 1)
            .map(|(_, q)| q.outstanding)
            .sum();

        TreeStats {
            root_len: self.root.len(),
            live_groups: self.groups.len(),
            pending_leaves: root_leaves + grouped,
            dispatched: self.dispatched,
            splits: self.splits,
            duplicates: self.duplicates,
        }
    }
}
