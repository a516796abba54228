// src/server/queue_server.rs
//! The root master
//!
//! One task owns the tree, the populator, the supervisor, and every worker
//! record. Each loop iteration accepts and answers at most one connection,
//! reaps exited local workers without blocking, and checks for a stall:
//!
//! ```text
//!            ┌──────── accept ─────▶ handle (POP / SLAVE / WORKER)
//!  loop ─────┤
//!            └─ poll_interval ─┐
//!                              ▼
//!               poll populator, reap_exited, stall check
//! ```
//!
//! Requests are answered inline, so nothing in here needs a lock.

use crate::populator::BackgroundPopulator;
use crate::protocol::command::{OK_REPLY, WRONG_RUN_REPLY};
use crate::protocol::{Connection, Endpoint, Listener, PopReply, Registration, Request};
use crate::stats::StatsFile;
use crate::tree::{PopRequest, WorkTree};
use crate::utils::errors::{QueueError, Result};
use crate::worker::{WorkerRecord, WorkerSupervisor};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Master loop settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Token every relay registration must echo
    pub run_token: String,

    /// Quiet period after which the run is declared stalled
    pub bad_worker_timeout: Duration,

    /// How long one loop iteration waits for a connection
    pub poll_interval: Duration,

    /// Upper bound on reading one request
    pub read_timeout: Duration,
}

impl ServerConfig {
    pub fn new(run_token: impl Into<String>) -> Self {
        Self {
            run_token: run_token.into(),
            ..Default::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            run_token: String::new(),
            bad_worker_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(100),
            read_timeout: Duration::from_secs(10),
        }
    }
}

/// What a finished run leaves behind
#[derive(Debug)]
pub struct RunOutcome {
    pub records: Vec<WorkerRecord>,
    pub timed_out: bool,

    /// Source to root key map gathered from background discovery
    pub run_stats: StatsFile,

    /// Root items skipped because their key had already been queued
    pub duplicates: u64,
}

/// Owns the canonical queue for one run
pub struct QueueServer {
    config: ServerConfig,
    listener: Option<Listener>,
    tree: WorkTree,
    populator: Option<BackgroundPopulator>,
    supervisor: WorkerSupervisor,
    run_stats: StatsFile,
    remote_workers: BTreeMap<String, usize>,
    completed: Vec<WorkerRecord>,
    last_activity: Instant,
    timed_out: bool,
}

impl QueueServer {
    /// Start listening at `endpoint`
    pub async fn bind(
        endpoint: &Endpoint,
        config: ServerConfig,
        tree: WorkTree,
        populator: Option<BackgroundPopulator>,
        supervisor: WorkerSupervisor,
    ) -> Result<Self> {
        let listener = Listener::bind(endpoint)
            .await
            .map_err(|e| QueueError::Protocol(format!("Failed to listen on {}: {}", endpoint, e)))?;
        info!("Master listening on {}", endpoint);

        Ok(Self {
            config,
            listener: Some(listener),
            tree,
            populator,
            supervisor,
            run_stats: StatsFile::default(),
            remote_workers: BTreeMap::new(),
            completed: Vec::new(),
            last_activity: Instant::now(),
            timed_out: false,
        })
    }

    /// Address local workers should dial
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| QueueError::Protocol("master is not listening".to_string()))?;
        Ok(listener.local_endpoint()?)
    }

    pub fn supervisor_mut(&mut self) -> &mut WorkerSupervisor {
        &mut self.supervisor
    }

    pub fn tree(&self) -> &WorkTree {
        &self.tree
    }

    /// Remote worker slots still expected to report, per host
    pub fn remote_workers(&self) -> &BTreeMap<String, usize> {
        &self.remote_workers
    }

    pub fn completed(&self) -> &[WorkerRecord] {
        &self.completed
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    fn populator_running(&self) -> bool {
        self.populator.as_ref().map_or(false, |p| !p.is_exhausted())
    }

    fn poll_populator(&mut self) {
        if let Some(populator) = self.populator.as_mut() {
            let ingested = populator.poll(&mut self.tree, &mut self.run_stats);
            if ingested > 0 {
                debug!("Ingested {} discovered root items", ingested);
            }
        }
    }

    /// Answer one POP; `None` means stay silent because the run is over
    pub fn pop(&mut self, request: &PopRequest) -> Option<PopReply> {
        self.poll_populator();

        if let Some(assignment) = self.tree.pop(request) {
            debug!("Dispatching {}", assignment);
            metrics::counter!("distq_items_dispatched_total").increment(1);
            return Some(PopReply::Item(assignment));
        }

        match request {
            PopRequest::Examples(_) | PopRequest::Groups(_) => Some(PopReply::Empty),
            PopRequest::Root | PopRequest::Tagged(_) if self.populator_running() => {
                metrics::counter!("distq_wait_replies_total").increment(1);
                Some(PopReply::Wait)
            }
            PopRequest::Root | PopRequest::Tagged(_) => None,
        }
    }

    /// Count a relay's workers; false when the token belongs to another run
    pub fn register_relay(&mut self, registration: Registration) -> bool {
        if registration.token != self.config.run_token {
            warn!(
                "Rejecting relay {} with token {} from another run",
                registration.host, registration.token
            );
            metrics::counter!("distq_relay_registrations_total", "result" => "rejected").increment(1);
            return false;
        }

        match &registration.message {
            Some(message) => info!(
                "Relay {} joined with {} workers: {}",
                registration.host, registration.workers, message
            ),
            None => info!("Relay {} joined with {} workers", registration.host, registration.workers),
        }
        *self.remote_workers.entry(registration.host).or_insert(0) += registration.workers;
        metrics::counter!("distq_relay_registrations_total", "result" => "accepted").increment(1);
        true
    }

    /// Record a remote worker's final state
    pub fn report_completion(&mut self, record: WorkerRecord) {
        let host = record.host.clone().unwrap_or_default();
        match self.remote_workers.get_mut(&host) {
            Some(count) => {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.remote_workers.remove(&host);
                    debug!("All workers on {} have reported", host);
                }
            }
            None => warn!("Completion report from unregistered host {:?}", host),
        }
        self.completed.push(record);
    }

    fn keep_running(&self) -> bool {
        self.tree.has_pending() || self.populator_running() || !self.remote_workers.is_empty()
    }

    /// Serve requests until the queue drains and every relay has reported,
    /// or until nothing has been heard for `bad_worker_timeout`
    pub async fn distribute(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| QueueError::Protocol("master is not listening".to_string()))?;
        self.last_activity = Instant::now();

        while self.keep_running() {
            self.poll_populator();

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        self.last_activity = Instant::now();
                        self.handle(conn, &peer).await;
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let reaped = self.supervisor.reap_exited().await;
            self.completed.extend(reaped);
            self.update_gauges();

            if self.last_activity.elapsed() >= self.config.bad_worker_timeout {
                self.declare_stall();
                break;
            }
        }

        self.listener = Some(listener);
        debug!("Distribution finished (timed out: {})", self.timed_out);
        Ok(())
    }

    async fn handle(&mut self, conn: Connection, peer: &str) {
        let mut stream = BufReader::new(conn);
        let request = match tokio::time::timeout(self.config.read_timeout, Request::read_from(&mut stream)).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                warn!("Ignoring request from {}: {}", peer, e);
                return;
            }
            Err(_) => {
                warn!("Timed out reading request from {}", peer);
                return;
            }
        };
        metrics::counter!("distq_requests_total", "command" => request.verb()).increment(1);

        let reply = match request {
            Request::Pop(request) => match self.pop(&request) {
                Some(reply) => match reply.encode() {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        warn!("Failed to encode reply for {}: {}", peer, e);
                        None
                    }
                },
                None => None,
            },
            Request::Register(registration) => Some(if self.register_relay(registration) {
                OK_REPLY.to_vec()
            } else {
                WRONG_RUN_REPLY.to_vec()
            }),
            Request::Complete(record) => {
                self.report_completion(*record);
                Some(OK_REPLY.to_vec())
            }
        };

        let conn = stream.get_mut();
        if let Some(bytes) = reply {
            if let Err(e) = conn.write_all(&bytes).await {
                debug!("Failed to answer {}: {}", peer, e);
            }
        }
        let _ = conn.shutdown().await;
    }

    fn declare_stall(&mut self) {
        warn!(
            "No worker activity for {:?}, giving up on {} local and {} remote workers",
            self.config.bad_worker_timeout,
            self.supervisor.len(),
            self.remote_workers.values().sum::<usize>()
        );

        let abandoned = self.supervisor.abandon();
        self.completed.extend(abandoned);
        for (host, count) in std::mem::take(&mut self.remote_workers) {
            for _ in 0..count {
                self.completed.push(WorkerRecord::stalled(Some(host.clone())));
            }
        }

        self.timed_out = true;
        metrics::counter!("distq_stalls_total").increment(1);
    }

    fn update_gauges(&self) {
        let stats = self.tree.stats();
        metrics::gauge!("distq_root_queue_len").set(stats.root_len as f64);
        metrics::gauge!("distq_pending_leaves").set(stats.pending_leaves as f64);
        metrics::gauge!("distq_local_workers").set(self.supervisor.len() as f64);
    }

    /// Stop listening, stop discovery, and collect every local worker
    pub async fn shutdown(mut self) -> RunOutcome {
        if let Some(listener) = self.listener.take() {
            listener.close();
        }
        if let Some(populator) = self.populator.as_mut() {
            populator.shutdown();
        }

        if self.timed_out {
            self.supervisor.kill_abandoned().await;
            let stragglers = self.supervisor.kill_all().await;
            self.completed.extend(stragglers);
        } else {
            let reaped = self.supervisor.reap_all().await;
            self.completed.extend(reaped);
        }

        let duplicates = self.tree.stats().duplicates;
        if duplicates > 0 {
            warn!("Skipped {} duplicate root items", duplicates);
        }
        info!("Master shut down with {} worker records", self.completed.len());
        RunOutcome {
            records: self.completed,
            timed_out: self.timed_out,
            run_stats: self.run_stats,
            duplicates,
        }
    }
}
