// src/collaborator/manifest.rs
//! Manifest-driven collaborator
//!
//! A source is a JSON file describing nested groups of shell commands:
//!
//! ```json
//! {
//!   "groups": [
//!     {
//!       "key": "db",
//!       "setup": "./scripts/start-db.sh",
//!       "teardown": "./scripts/stop-db.sh",
//!       "tags": { "no_split": "true" },
//!       "children": [
//!         { "key": "migrations", "command": "make test-migrations" },
//!         { "key": "queries", "command": "make test-queries" }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Commands run through `sh -c` from the manifest's directory. A node with
//! a `command` and no children is a leaf; anything else is a group.

use crate::collaborator::{ExecutionCollaborator, Outcome};
use crate::tree::{Tags, WorkItem};
use crate::utils::errors::{QueueError, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    groups: Vec<ManifestNode>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestNode {
    key: String,

    #[serde(default)]
    command: Option<String>,

    #[serde(default)]
    setup: Option<String>,

    #[serde(default)]
    teardown: Option<String>,

    #[serde(default)]
    tags: BTreeMap<String, String>,

    #[serde(default)]
    children: Vec<ManifestNode>,
}

impl ManifestNode {
    fn to_item(&self) -> WorkItem {
        let mut item = if self.children.is_empty() && self.command.is_some() {
            WorkItem::leaf(&self.key)
        } else {
            WorkItem::group(&self.key, self.children.iter().map(ManifestNode::to_item).collect())
        };

        let mut tags = Tags::new();
        for (name, value) in &self.tags {
            tags.insert(name, value);
        }
        item.tags = tags;
        item
    }
}

/// Runs shell commands listed in JSON manifests
#[derive(Default)]
pub struct ManifestCollaborator {
    cache: Mutex<HashMap<PathBuf, Arc<Manifest>>>,
}

impl ManifestCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    fn manifest(&self, source: &Path) -> Result<Arc<Manifest>> {
        if let Some(manifest) = self.cache.lock().get(source) {
            return Ok(Arc::clone(manifest));
        }

        let data = std::fs::read(source)
            .map_err(|e| QueueError::DiscoveryFailed(format!("Failed to read {:?}: {}", source, e)))?;
        let manifest: Manifest = serde_json::from_slice(&data)
            .map_err(|e| QueueError::DiscoveryFailed(format!("Invalid manifest {:?}: {}", source, e)))?;
        debug!("Loaded {} root groups from {:?}", manifest.groups.len(), source);

        let manifest = Arc::new(manifest);
        self.cache.lock().insert(source.to_path_buf(), Arc::clone(&manifest));
        Ok(manifest)
    }

    fn node(&self, source: Option<&str>, path: &[String]) -> Result<(PathBuf, ManifestNode)> {
        let source = source
            .map(PathBuf::from)
            .ok_or_else(|| QueueError::Collaborator(format!("No source recorded for {}", path.join(" > "))))?;
        let manifest = self.manifest(&source)?;

        let missing = || QueueError::Collaborator(format!("{} not found in {:?}", path.join(" > "), source));
        let (first, rest) = path.split_first().ok_or_else(missing)?;
        let mut node = manifest.groups.iter().find(|n| &n.key == first).ok_or_else(missing)?;
        for key in rest {
            node = node.children.iter().find(|n| &n.key == key).ok_or_else(missing)?;
        }
        Ok((source, node.clone()))
    }

    fn run_hook(&self, source: Option<&str>, scope: &[String], pick: fn(&ManifestNode) -> Option<&String>) -> Result<()> {
        let (source, node) = self.node(source, scope)?;
        let Some(command) = pick(&node) else {
            return Ok(());
        };

        let outcome = run_shell(command, &source, scope)?;
        if outcome.success {
            Ok(())
        } else {
            Err(QueueError::Collaborator(format!(
                "Hook for {} failed: {}",
                scope.join(" > "),
                outcome.output.trim()
            )))
        }
    }
}

impl ExecutionCollaborator for ManifestCollaborator {
    fn enumerate(&self, source: &Path) -> Result<Vec<WorkItem>> {
        let manifest = self.manifest(source)?;
        Ok(manifest.groups.iter().map(ManifestNode::to_item).collect())
    }

    fn execute(&self, source: Option<&str>, path: &[String]) -> Result<Outcome> {
        let (source, node) = self.node(source, path)?;
        match &node.command {
            Some(command) => run_shell(command, &source, path),
            None => Err(QueueError::Collaborator(format!("{} has no command", path.join(" > ")))),
        }
    }

    fn enter_group(&self, source: Option<&str>, scope: &[String]) -> Result<()> {
        self.run_hook(source, scope, |n| n.setup.as_ref())
    }

    fn leave_group(&self, source: Option<&str>, scope: &[String]) -> Result<()> {
        self.run_hook(source, scope, |n| n.teardown.as_ref())
    }
}

fn run_shell(command: &str, source: &Path, path: &[String]) -> Result<Outcome> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .env("DISTQ_ITEM", path.join("/"))
        .stdin(Stdio::null());
    if let Some(dir) = source.parent().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .map_err(|e| QueueError::Collaborator(format!("Failed to run {:?}: {}", command, e)))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        warn!("{} exited with {}", path.join(" > "), output.status);
    }

    Ok(Outcome {
        success: output.status.success(),
        output: text,
    })
}
