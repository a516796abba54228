// src/worker/supervisor.rs
//! Local worker process supervision
//!
//! Spawns one child per concurrency slot, reaps them without blocking the
//! master loop, and collects the output and stats files each worker leaves
//! behind under its pid.

use crate::stats::store::take_worker_stats;
use crate::utils::errors::{QueueError, Result};
use crate::worker::record::WorkerRecord;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::fs;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Captured stdout/stderr of a worker
pub fn output_path(scratch_dir: &Path, pid: u32) -> PathBuf {
    scratch_dir.join(format!("distq_worker_{}_output", pid))
}

/// Durations a worker measured
pub fn stats_path(scratch_dir: &Path, pid: u32) -> PathBuf {
    scratch_dir.join(format!("distq_worker_{}_stats", pid))
}

/// How to launch a worker process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Executable to run
    pub program: PathBuf,

    /// Leading arguments; `--num` and `--endpoint` are appended per worker
    pub args: Vec<String>,

    /// Extra environment variables
    pub env_vars: Vec<(String, String)>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Time between SIGTERM and SIGKILL when stopping a worker
    pub kill_grace: Duration,
}

impl SpawnConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            work_dir: None,
            kill_grace: Duration::from_secs(2),
        }
    }

    /// Re-run the current executable with a subcommand
    pub fn current_exe(args: &[&str]) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| QueueError::ProcessSpawnFailed(format!("Cannot locate own executable: {}", e)))?;
        Ok(Self::new(program).with_args(args))
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|a| a.to_string()));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

struct LiveWorker {
    child: Child,
    record: WorkerRecord,
}

/// Owns every local worker process for the run
pub struct WorkerSupervisor {
    spawn: SpawnConfig,
    scratch_dir: PathBuf,
    workers: BTreeMap<u32, LiveWorker>,
    abandoned: Vec<Child>,
}

impl WorkerSupervisor {
    pub fn new(spawn: SpawnConfig, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            spawn,
            scratch_dir: scratch_dir.into(),
            workers: BTreeMap::new(),
            abandoned: Vec::new(),
        }
    }

    /// Spawn `count` workers pointed at `endpoint`
    pub fn spawn_workers(&mut self, count: usize, endpoint: &str) -> Result<()> {
        for num in 1..=count {
            self.spawn(num, endpoint)?;
        }
        info!("Spawned {} workers against {}", count, endpoint);
        Ok(())
    }

    /// Spawn one worker for slot `num`
    pub fn spawn(&mut self, num: usize, endpoint: &str) -> Result<u32> {
        let mut command = Command::new(&self.spawn.program);
        command
            .args(&self.spawn.args)
            .arg("--num")
            .arg(num.to_string())
            .arg("--endpoint")
            .arg(endpoint)
            .env("DISTQ_SCRATCH_DIR", &self.scratch_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(work_dir) = &self.spawn.work_dir {
            command.current_dir(work_dir);
        }
        for (key, value) in &self.spawn.env_vars {
            command.env(key, value);
        }

        let child = command
            .spawn()
            .map_err(|e| QueueError::ProcessSpawnFailed(format!("Failed to spawn worker {}: {}", num, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| QueueError::ProcessSpawnFailed(format!("Worker {} exited during spawn", num)))?;

        debug!("Worker {} spawned with PID {}", num, pid);
        metrics::counter!("distq_workers_spawned_total").increment(1);

        self.workers.insert(
            pid,
            LiveWorker {
                child,
                record: WorkerRecord::new(pid, num),
            },
        );
        Ok(pid)
    }

    /// Collect every worker that has already exited
    pub async fn reap_exited(&mut self) -> Vec<WorkerRecord> {
        let mut exited = Vec::new();
        for (pid, worker) in self.workers.iter_mut() {
            match worker.child.try_wait() {
                Ok(Some(status)) => exited.push((*pid, status)),
                Ok(None) => {}
                Err(e) => warn!("Failed to poll worker {}: {}", pid, e),
            }
        }

        let mut records = Vec::with_capacity(exited.len());
        for (pid, status) in exited {
            if let Some(worker) = self.workers.remove(&pid) {
                records.push(self.collect(worker.record, status).await);
            }
        }
        records
    }

    /// Wait for every worker to exit on its own
    pub async fn reap_all(&mut self) -> Vec<WorkerRecord> {
        let mut records = Vec::with_capacity(self.workers.len());
        while let Some((pid, mut worker)) = self.workers.pop_first() {
            match worker.child.wait().await {
                Ok(status) => records.push(self.collect(worker.record, status).await),
                Err(e) => warn!("Failed to wait for worker {}: {}", pid, e),
            }
        }
        records
    }

    /// Stop every worker, SIGTERM first, then SIGKILL after the grace period
    pub async fn kill_all(&mut self) -> Vec<WorkerRecord> {
        let grace = self.spawn.kill_grace;
        let mut records = Vec::with_capacity(self.workers.len());
        while let Some((pid, mut worker)) = self.workers.pop_first() {
            match terminate(&mut worker.child, pid, grace).await {
                Ok(status) => records.push(self.collect(worker.record, status).await),
                Err(e) => warn!("Failed to stop worker {}: {}", pid, e),
            }
        }
        records
    }

    /// Give up on all running workers: their slots are reported as failed
    /// now and the processes are killed at shutdown without being reported
    pub fn abandon(&mut self) -> Vec<WorkerRecord> {
        let mut records = Vec::with_capacity(self.workers.len());
        while let Some((_, worker)) = self.workers.pop_first() {
            let mut record = worker.record;
            record.finish(Some(1));
            records.push(record);
            self.abandoned.push(worker.child);
        }
        records
    }

    /// Kill abandoned workers and clean up their files
    pub async fn kill_abandoned(&mut self) {
        for mut child in self.abandoned.drain(..) {
            let pid = child.id();
            if let Err(e) = child.kill().await {
                warn!("Failed to kill abandoned worker {:?}: {}", pid, e);
            }
            if let Some(pid) = pid {
                let _ = fs::remove_file(output_path(&self.scratch_dir, pid)).await;
                let _ = fs::remove_file(stats_path(&self.scratch_dir, pid)).await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    async fn collect(&self, mut record: WorkerRecord, status: ExitStatus) -> WorkerRecord {
        record.finish(status.code());
        if let Some(signal) = status.signal() {
            warn!("Worker {} (pid {}) killed by signal {}", record.num, record.pid, signal);
        }

        let output = output_path(&self.scratch_dir, record.pid);
        if let Ok(bytes) = fs::read(&output).await {
            record.output = String::from_utf8_lossy(&bytes).into_owned();
            if let Err(e) = fs::remove_file(&output).await {
                warn!("Failed to remove {:?}: {}", output, e);
            }
        }

        if let Some(stats) = take_worker_stats(&stats_path(&self.scratch_dir, record.pid)).await {
            record.stats = stats;
        }

        debug!(
            "Reaped worker {} (pid {}) with status {:?}",
            record.num, record.pid, record.exit_status
        );
        metrics::counter!("distq_workers_reaped_total").increment(1);
        record
    }
}

async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> std::io::Result<ExitStatus> {
    debug!("Sending SIGTERM to PID {}", pid);
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed: {}", pid, e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            debug!("Worker {} still alive, sending SIGKILL", pid);
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell(script: &str) -> SpawnConfig {
        // `--num N --endpoint E` land in $0.. positional args and are ignored
        SpawnConfig::new("/bin/sh").with_args(&["-c", script, "worker"])
    }

    #[tokio::test]
    async fn test_reap_collects_exit_status_and_files() {
        let dir = tempdir().unwrap();
        let script = format!(
            r#"echo hello > {dir}/distq_worker_$$_output; echo '{{"k":1.5}}' > {dir}/distq_worker_$$_stats; exit 3"#,
            dir = dir.path().display()
        );
        let mut supervisor = WorkerSupervisor::new(shell(&script), dir.path());
        let pid = supervisor.spawn(1, "/tmp/unused.sock").unwrap();

        let records = supervisor.reap_all().await;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.pid, pid);
        assert_eq!(record.num, 1);
        assert_eq!(record.exit_status, Some(3));
        assert_eq!(record.output.trim(), "hello");
        assert_eq!(record.stats.get("k"), Some(&1.5));

        assert!(!output_path(dir.path(), pid).exists());
        assert!(!stats_path(dir.path(), pid).exists());
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_reap_exited_is_non_blocking() {
        let dir = tempdir().unwrap();
        let mut supervisor = WorkerSupervisor::new(shell("sleep 30"), dir.path());
        supervisor.spawn_workers(2, "/tmp/unused.sock").unwrap();

        assert!(supervisor.reap_exited().await.is_empty());
        assert_eq!(supervisor.len(), 2);

        let records = supervisor.kill_all().await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.succeeded()));
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_abandon_reports_failures_immediately() {
        let dir = tempdir().unwrap();
        let mut supervisor = WorkerSupervisor::new(shell("sleep 30"), dir.path());
        supervisor.spawn_workers(3, "/tmp/unused.sock").unwrap();

        let records = supervisor.abandon();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.exit_status == Some(1)));
        assert!(supervisor.is_empty());

        supervisor.kill_abandoned().await;
    }

    #[test]
    fn test_file_paths_are_pid_namespaced() {
        let dir = Path::new("/tmp");
        assert_eq!(output_path(dir, 42), PathBuf::from("/tmp/distq_worker_42_output"));
        assert_eq!(stats_path(dir, 42), PathBuf::from("/tmp/distq_worker_42_stats"));
    }
}
