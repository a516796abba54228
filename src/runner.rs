// src/runner.rs
//! Whole-run orchestration
//!
//! A `distq run` process is exactly one of:
//!
//! - **root master**: builds or streams the tree, serves it, spawns local
//!   workers, merges stats, prints the summary
//! - **relay**: registers with a root master and proxies its local workers
//! - **sequential**: `concurrency = 0`, drains the tree in-process
//!
//! The `worker` and `discover` subcommands are the child processes a master
//! spawns; their entry points live here too.

use crate::collaborator::ExecutionCollaborator;
use crate::observability::init_tracing;
use crate::populator::{run_discovery, BackgroundPopulator};
use crate::protocol::Endpoint;
use crate::relay::{RelayClient, RelayConfig};
use crate::server::{QueueServer, RunOutcome, RunSummary, ServerConfig};
use crate::stats::{accumulate, StatsFile, StatsStore};
use crate::tree::{TagFilter, WorkTree};
use crate::utils::config::QueueConfig;
use crate::utils::errors::{QueueError, Result};
use crate::worker::{output_path, redirect_output, run_worker, SpawnConfig, WorkItemClient, WorkerRecord, WorkerSupervisor};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Random token identifying one run to its relays
pub fn generate_run_token() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

fn config_error(message: String) -> QueueError {
    QueueError::Config(config::ConfigError::Message(message))
}

fn parse_endpoint(address: &str) -> Result<Endpoint> {
    address
        .parse()
        .map_err(|e| config_error(format!("Invalid endpoint {:?}: {}", address, e)))
}

fn preferred_tag(config: &QueueConfig) -> Result<Option<TagFilter>> {
    config
        .preferred_tag
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|e: String| config_error(format!("Invalid preferred_tag: {}", e)))
}

/// Drives one `distq run`
pub struct Runner {
    config: QueueConfig,
    collaborator: Arc<dyn ExecutionCollaborator>,
    run_token: String,
}

impl Runner {
    pub fn new(config: QueueConfig, collaborator: Arc<dyn ExecutionCollaborator>) -> Self {
        let run_token = config.run_token.clone().unwrap_or_else(generate_run_token);
        Self {
            config,
            collaborator,
            run_token,
        }
    }

    pub fn run_token(&self) -> &str {
        &self.run_token
    }

    /// Run everything `sources` define; returns the process exit code
    pub async fn execute(&self, sources: &[PathBuf]) -> Result<i32> {
        if let Some(upstream) = self.config.relay_target() {
            return self.run_relay(upstream).await;
        }

        let started = Instant::now();
        let store = StatsStore::new(&self.config.stats_file);
        let previous = store.load().await;
        let mut run_stats = StatsFile::default();

        let (records, timed_out, duplicates) = if self.config.concurrency == 0 {
            let tree = self.build_tree(sources, &previous, &mut run_stats)?;
            let duplicates = tree.stats().duplicates;
            (vec![self.run_sequential(tree)?], false, duplicates)
        } else {
            let lazy = self.config.lazy_discovery && self.config.force.is_empty();
            let (tree, populator) = if lazy {
                let spawn = self.child_spawn("discover")?;
                let populator = BackgroundPopulator::start(&spawn, sources, &previous, self.config.loaders)?;
                (WorkTree::new(self.config.split_limit()), Some(populator))
            } else {
                (self.build_tree(sources, &previous, &mut run_stats)?, None)
            };

            let outcome = self.run_master(tree, populator).await?;
            if lazy {
                run_stats = outcome.run_stats;
            }
            (outcome.records, outcome.timed_out, outcome.duplicates)
        };

        let mut records = records;
        for record in &mut records {
            if record.summary.is_none() {
                self.collaborator.summarize_worker(record);
            }
            if !record.succeeded() || self.config.verbose {
                print!("{}", record.output);
            }
            accumulate(&mut run_stats.durations, &record.stats);
        }

        if let Err(e) = store.save(&previous, &run_stats, self.config.stats_mode).await {
            warn!("Stats not saved: {}", e);
        }

        let summary = RunSummary::new(records, timed_out, started.elapsed()).with_duplicates(duplicates);
        println!("{}", summary);
        Ok(summary.exit_code())
    }

    /// Re-invoke this executable as a child, carrying settings that may have
    /// come from the command line rather than the config file
    fn child_spawn(&self, subcommand: &str) -> Result<SpawnConfig> {
        let mut spawn = SpawnConfig::current_exe(&[subcommand])?
            .with_env("DISTQ_VERBOSE", self.config.verbose.to_string())
            .with_env("DISTQ_JSON_LOGS", self.config.json_logs.to_string());
        if let Some(tag) = &self.config.preferred_tag {
            spawn = spawn.with_env("DISTQ_PREFERRED_TAG", tag.as_str());
        }
        Ok(spawn)
    }

    /// Enumerate every source up front, longest estimated first
    pub fn build_tree(&self, sources: &[PathBuf], previous: &StatsFile, run_stats: &mut StatsFile) -> Result<WorkTree> {
        let mut forest = Vec::new();
        for source in sources {
            let label = source.display().to_string();
            let items = match self.collaborator.enumerate(source) {
                Ok(items) => items,
                Err(e) => {
                    warn!("Skipping {:?}: {}", source, e);
                    continue;
                }
            };

            for mut item in items {
                item.estimated_duration = item
                    .estimated_duration
                    .or_else(|| self.collaborator.estimated_duration(previous, &item.key));
                run_stats.record_source(&label, &item.key);
                forest.push((Some(label.clone()), item));
            }
        }

        let mut tree = WorkTree::from_forest(forest, self.config.split_limit());
        tree.restrict_to(&self.config.force);
        info!("Discovered {} root items in {} sources", tree.root_len(), sources.len());
        Ok(tree)
    }

    fn run_sequential(&self, mut tree: WorkTree) -> Result<WorkerRecord> {
        info!("Running {} root items in-process", tree.root_len());
        let mut record = WorkerRecord::new(std::process::id(), 1);

        let mut client =
            WorkItemClient::new(&mut tree, self.collaborator.as_ref()).with_preferred_tag(preferred_tag(&self.config)?);
        let failed = client.run();

        record.stats = client.stats().clone();
        record.summary = Some(format!("{} passed, {} failed", client.passed(), failed));
        record.finish(Some(if failed > 0 { 1 } else { 0 }));
        Ok(record)
    }

    async fn run_master(&self, tree: WorkTree, populator: Option<BackgroundPopulator>) -> Result<RunOutcome> {
        let endpoint = parse_endpoint(&self.config.socket)?;
        let server_config = ServerConfig {
            run_token: self.run_token.clone(),
            bad_worker_timeout: self.config.bad_worker_timeout(),
            poll_interval: self.config.poll_interval(),
            ..Default::default()
        };
        let supervisor = WorkerSupervisor::new(self.child_spawn("worker")?, &self.config.scratch_dir);

        let mut server = QueueServer::bind(&endpoint, server_config, tree, populator, supervisor).await?;
        info!("Run token {}", self.run_token);

        let local = server.local_endpoint()?.to_string();
        if let Err(e) = server.supervisor_mut().spawn_workers(self.config.concurrency, &local) {
            server.shutdown().await;
            return Err(e);
        }

        let distributed = server.distribute().await;
        let outcome = server.shutdown().await;
        distributed?;
        Ok(outcome)
    }

    async fn run_relay(&self, upstream: &str) -> Result<i32> {
        let token = self
            .config
            .run_token
            .clone()
            .ok_or_else(|| config_error("Relay mode needs the root master's run_token".to_string()))?;

        let mut relay_config = RelayConfig::new(parse_endpoint(upstream)?, parse_endpoint(&self.config.socket)?, token);
        relay_config.message = self.config.relay_message.clone();
        relay_config.connect_timeout = self.config.relay_timeout();
        relay_config.upstream_timeout = self.config.relay_timeout();
        relay_config.poll_interval = self.config.poll_interval();

        let supervisor = WorkerSupervisor::new(self.child_spawn("worker")?, &self.config.scratch_dir);
        let mut relay = RelayClient::connect(relay_config, self.config.concurrency, supervisor).await?;

        let local = relay.local_endpoint()?.to_string();
        relay.supervisor_mut().spawn_workers(self.config.concurrency, &local)?;
        relay.run().await?;

        let failed = relay.reported().iter().filter(|r| !r.succeeded()).count();
        info!("Relay done: {} workers, {} failed", relay.reported().len(), failed);
        Ok(if failed > 0 { 1 } else { 0 })
    }
}

/// Body of `distq worker`: output goes to the pid-namespaced file
pub fn run_worker_process(
    config: &QueueConfig,
    collaborator: &dyn ExecutionCollaborator,
    num: usize,
    endpoint: &str,
) -> Result<i32> {
    redirect_output(&output_path(&config.scratch_dir, std::process::id()))?;
    init_tracing(config.verbose, config.json_logs)?;
    debug!("Worker {} starting against {}", num, endpoint);

    let failed = run_worker(
        collaborator,
        parse_endpoint(endpoint)?,
        preferred_tag(config)?,
        &config.scratch_dir,
    )?;
    Ok(if failed > 0 { 1 } else { 0 })
}

/// Body of `distq discover`: frames go to stdout, logs to stderr
pub fn run_discover_process(
    config: &QueueConfig,
    collaborator: &dyn ExecutionCollaborator,
    loader: usize,
    sources: &[PathBuf],
) -> Result<i32> {
    init_tracing(config.verbose, config.json_logs)?;
    run_discovery(collaborator, loader, sources, std::io::stdout())?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::ManifestCollaborator;
    use std::path::Path;
    use tempfile::tempdir;

    fn manifest(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn sequential_config(dir: &Path) -> QueueConfig {
        QueueConfig {
            concurrency: 0,
            stats_file: dir.join("stats.json"),
            scratch_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    const SUITE: &str = r#"{
        "groups": [
            { "key": "g", "children": [
                { "key": "x", "command": "true" },
                { "key": "y", "command": "true" }
            ] },
            { "key": "solo", "command": "true" }
        ]
    }"#;

    #[test]
    fn test_run_token_shape() {
        let token = generate_run_token();
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_run_token());
    }

    #[test]
    fn test_configured_token_wins() {
        let config = QueueConfig {
            run_token: Some("fixed".to_string()),
            ..Default::default()
        };
        let runner = Runner::new(config, Arc::new(ManifestCollaborator::new()));
        assert_eq!(runner.run_token(), "fixed");
    }

    #[tokio::test]
    async fn test_sequential_run_saves_stats() {
        let dir = tempdir().unwrap();
        let source = manifest(dir.path(), "suite.json", SUITE);
        let config = sequential_config(dir.path());
        let runner = Runner::new(config.clone(), Arc::new(ManifestCollaborator::new()));

        assert_eq!(runner.execute(&[source.clone()]).await.unwrap(), 0);

        let saved = StatsStore::new(&config.stats_file).load().await;
        assert!(saved.duration("g").is_some());
        assert!(saved.duration("solo").is_some());
        assert_eq!(saved.sources[&source.display().to_string()].len(), 2);
    }

    #[tokio::test]
    async fn test_sequential_failure_sets_exit_code() {
        let dir = tempdir().unwrap();
        let source = manifest(
            dir.path(),
            "suite.json",
            r#"{ "groups": [ { "key": "bad", "command": "exit 3" } ] }"#,
        );
        let runner = Runner::new(sequential_config(dir.path()), Arc::new(ManifestCollaborator::new()));
        assert_eq!(runner.execute(&[source]).await.unwrap(), 1);
    }

    #[test]
    fn test_build_tree_orders_by_history_and_honors_force() {
        let dir = tempdir().unwrap();
        let source = manifest(
            dir.path(),
            "suite.json",
            r#"{ "groups": [
                { "key": "A", "command": "true" },
                { "key": "B", "command": "true" },
                { "key": "C", "command": "true" }
            ] }"#,
        );
        let mut previous = StatsFile::default();
        previous.durations.insert("A".to_string(), 10.0);
        previous.durations.insert("B".to_string(), 1.0);
        previous.durations.insert("C".to_string(), 5.0);

        let runner = Runner::new(sequential_config(dir.path()), Arc::new(ManifestCollaborator::new()));
        let mut tree = runner
            .build_tree(&[source.clone()], &previous, &mut StatsFile::default())
            .unwrap();
        let order: Vec<String> = std::iter::from_fn(|| tree.pop(&crate::tree::PopRequest::Root))
            .map(|a| a.root_key().to_string())
            .collect();
        assert_eq!(order, vec!["A", "C", "B"]);

        let forced = QueueConfig {
            force: vec!["B".to_string(), "A".to_string()],
            ..sequential_config(dir.path())
        };
        let runner = Runner::new(forced, Arc::new(ManifestCollaborator::new()));
        let mut tree = runner
            .build_tree(&[source], &previous, &mut StatsFile::default())
            .unwrap();
        let order: Vec<String> = std::iter::from_fn(|| tree.pop(&crate::tree::PopRequest::Root))
            .map(|a| a.root_key().to_string())
            .collect();
        assert_eq!(order, vec!["B", "A"]);
    }

    #[test]
    fn test_children_inherit_command_line_settings() {
        let config = QueueConfig {
            verbose: true,
            preferred_tag: Some("speed=slow".to_string()),
            ..Default::default()
        };
        let runner = Runner::new(config, Arc::new(ManifestCollaborator::new()));
        let spawn = runner.child_spawn("worker").unwrap();

        assert_eq!(spawn.args, vec!["worker".to_string()]);
        assert!(spawn.env_vars.contains(&("DISTQ_VERBOSE".to_string(), "true".to_string())));
        assert!(spawn
            .env_vars
            .contains(&("DISTQ_PREFERRED_TAG".to_string(), "speed=slow".to_string())));
    }

    #[test]
    fn test_invalid_preferred_tag_is_a_config_error() {
        let config = QueueConfig {
            preferred_tag: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(matches!(preferred_tag(&config), Err(QueueError::Config(_))));
    }
}
