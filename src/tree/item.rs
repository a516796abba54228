// src/tree/item.rs
//! Work item model
//!
//! A work item is either a leaf (atomic) or a group of further items. Keys
//! are unique among siblings and stable across runs, so a path of keys from
//! a root item names exactly one node.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Tag that keeps a group on a single worker
pub const NO_SPLIT: &str = "no_split";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Leaf,
    Group,
}

/// Small set of recognized flags attached to an item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this group must be drained by one worker
    pub fn no_split(&self) -> bool {
        matches!(self.get(NO_SPLIT), Some("true") | Some("1"))
    }

    pub fn matches(&self, filter: &TagFilter) -> bool {
        self.get(&filter.name) == Some(filter.value.as_str())
    }
}

/// A `(tag, value)` pair a worker prefers to receive first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct TagFilter {
    pub name: String,
    pub value: String,
}

impl From<(String, String)> for TagFilter {
    fn from((name, value): (String, String)) -> Self {
        Self { name, value }
    }
}

impl From<TagFilter> for (String, String) {
    fn from(filter: TagFilter) -> Self {
        (filter.name, filter.value)
    }
}

impl FromStr for TagFilter {
    type Err = String;

    /// Parses `name=value`; a bare `name` means `name=true`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty tag filter".to_string());
        }
        let (name, value) = s.split_once('=').unwrap_or((s, "true"));
        Ok(Self {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// A node in the work forest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: String,

    pub kind: ItemKind,

    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,

    /// Ordered children; always empty for leaves
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<WorkItem>,

    /// Historical duration in seconds, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<f64>,
}

impl WorkItem {
    pub fn leaf(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ItemKind::Leaf,
            tags: Tags::new(),
            children: Vec::new(),
            estimated_duration: None,
        }
    }

    pub fn group(key: impl Into<String>, children: Vec<WorkItem>) -> Self {
        Self {
            key: key.into(),
            kind: ItemKind::Group,
            tags: Tags::new(),
            children,
            estimated_duration: None,
        }
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name, value);
        self
    }

    pub fn with_estimate(mut self, seconds: f64) -> Self {
        self.estimated_duration = Some(seconds);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == ItemKind::Leaf
    }

    /// Number of leaves at or below this node
    pub fn leaf_count(&self) -> usize {
        match self.kind {
            ItemKind::Leaf => 1,
            ItemKind::Group => self.children.iter().map(WorkItem::leaf_count).sum(),
        }
    }

    /// A group with no leaves anywhere below it
    pub fn is_exhausted(&self) -> bool {
        self.leaf_count() == 0
    }
}

/// What a POP hands out: the full key path to a leaf, plus the source
/// artifact its root item was discovered in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub source: Option<String>,
    pub path: Vec<String>,
}

impl Assignment {
    pub fn new(source: Option<String>, path: Vec<String>) -> Self {
        Self { source, path }
    }

    pub fn root_key(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or_default()
    }

    /// The part of the path below `scope`, or `None` if it lies elsewhere
    pub fn relative_to(&self, scope: &[String]) -> Option<&[String]> {
        self.path
            .strip_prefix(scope)
            .filter(|rest| !rest.is_empty())
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.join(" > "))
    }
}
