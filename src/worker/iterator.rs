// src/worker/iterator.rs
//! Worker-side work loop
//!
//! A worker asks for a root assignment, then drains everything it reserved
//! under that root before asking for anything new:
//!
//! ```text
//! POP                    -> [G, H, leaf1]        reserved: G > H > leaf1
//!   enter G
//!     POP EXAMPLE [G]    -> direct leaves of G, until empty
//!     enter H
//!       run leaf1
//!       POP EXAMPLE [G,H] ...
//!       POP GROUP [G,H]   ...
//!     leave H
//!     POP GROUP [G]      -> [G, K, leaf7]  (recurse into K)
//!   leave G
//! ```
//!
//! Any transport failure is the end of the run, not an error.

use crate::collaborator::{ExecutionCollaborator, FAIL_PREFIX, PASS_PREFIX};
use crate::protocol::{Endpoint, PopReply, Request};
use crate::stats::store::write_worker_stats;
use crate::stats::StatsMap;
use crate::tree::{Assignment, PopRequest, TagFilter, WorkTree};
use crate::utils::errors::{QueueError, Result};
use crate::worker::supervisor::stats_path;
use nix::unistd::dup2;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Delay before retrying a `wait` reply
pub const WAIT_RETRY: Duration = Duration::from_millis(100);

/// Anything a worker can pop assignments from
pub trait PopSource {
    /// `None` means nothing under this request, or the run is over
    fn pop(&mut self, request: &PopRequest) -> Option<Assignment>;
}

impl PopSource for WorkTree {
    fn pop(&mut self, request: &PopRequest) -> Option<Assignment> {
        WorkTree::pop(self, request)
    }
}

impl<S: PopSource + ?Sized> PopSource for &mut S {
    fn pop(&mut self, request: &PopRequest) -> Option<Assignment> {
        (**self).pop(request)
    }
}

/// A master or relay reached over a socket, one request per connection
pub struct RemoteQueue {
    endpoint: Endpoint,
    connect_timeout: Duration,
    retry_delay: Duration,
    done: bool,
    waited: Duration,
}

impl RemoteQueue {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: Duration::from_secs(10),
            retry_delay: WAIT_RETRY,
            done: false,
            waited: Duration::ZERO,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The master has stopped answering
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Total time spent talking to, or waiting on, the master
    pub fn waited(&self) -> Duration {
        self.waited
    }

    fn request(&self, request: &PopRequest) -> Result<Option<PopReply>> {
        let mut conn = self.endpoint.connect_blocking(self.connect_timeout)?;
        conn.write_all(&Request::Pop(request.clone()).encode()?)?;
        conn.flush()?;

        let mut response = Vec::new();
        conn.read_to_end(&mut response)?;
        PopReply::decode(&response)
    }
}

impl PopSource for RemoteQueue {
    fn pop(&mut self, request: &PopRequest) -> Option<Assignment> {
        while !self.done {
            let started = Instant::now();
            let reply = self.request(request);
            self.waited += started.elapsed();

            match reply {
                Ok(Some(PopReply::Item(assignment))) => return Some(assignment),
                Ok(Some(PopReply::Empty)) => return None,
                Ok(Some(PopReply::Wait)) => {
                    thread::sleep(self.retry_delay);
                    self.waited += self.retry_delay;
                }
                Ok(None) => {
                    debug!("Master closed without answering, run is over");
                    self.done = true;
                }
                Err(e) if e.is_transport() => {
                    debug!("Master went away: {}", e);
                    self.done = true;
                }
                Err(e) => {
                    warn!("Giving up on master at {}: {}", self.endpoint, e);
                    self.done = true;
                }
            }
        }
        None
    }
}

/// Runs assignments from a [`PopSource`] through a collaborator
pub struct WorkItemClient<'a, S: PopSource> {
    source: S,
    collaborator: &'a dyn ExecutionCollaborator,
    preferred: Option<TagFilter>,
    stats: StatsMap,
    passed: usize,
    failed: usize,
}

impl<'a, S: PopSource> WorkItemClient<'a, S> {
    pub fn new(source: S, collaborator: &'a dyn ExecutionCollaborator) -> Self {
        Self {
            source,
            collaborator,
            preferred: None,
            stats: StatsMap::new(),
            passed: 0,
            failed: 0,
        }
    }

    /// Ask for items with this tag before plain FIFO order
    pub fn with_preferred_tag(mut self, preferred: Option<TagFilter>) -> Self {
        self.preferred = preferred;
        self
    }

    /// Run until the source has nothing more; returns the failure count
    pub fn run(&mut self) -> usize {
        let request = match &self.preferred {
            Some(filter) => PopRequest::Tagged(filter.clone()),
            None => PopRequest::Root,
        };

        while let Some(assignment) = self.source.pop(&request) {
            self.run_assignment(assignment);
        }

        debug!("Worker finished: {} passed, {} failed", self.passed, self.failed);
        self.failed
    }

    pub fn stats(&self) -> &StatsMap {
        &self.stats
    }

    pub fn passed(&self) -> usize {
        self.passed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Flush measured durations where the supervisor will look for them
    pub fn write_stats(&self, scratch_dir: &Path) -> Result<()> {
        write_worker_stats(&stats_path(scratch_dir, std::process::id()), &self.stats)
    }

    fn run_assignment(&mut self, assignment: Assignment) {
        let started = Instant::now();
        let root_key = assignment.root_key().to_string();
        let source = assignment.source.as_deref();

        match assignment.path.split_first() {
            None => warn!("Ignoring empty assignment"),
            Some((_, [])) => self.execute(source, &assignment.path),
            Some((root, reserved)) => self.run_group(source, std::slice::from_ref(root), reserved, true),
        }

        *self.stats.entry(root_key).or_insert(0.0) += started.elapsed().as_secs_f64();
    }

    /// Drain this worker's slice of the group at `scope`
    ///
    /// `reserved` is the rest of the path this worker was handed: it is run
    /// before any other child group, and always between enter and leave.
    fn run_group(&mut self, source: Option<&str>, scope: &[String], reserved: &[String], healthy: bool) {
        let entered = healthy && self.enter(source, scope);

        if reserved.len() == 1 {
            self.execute_or_fail(source, &join(scope, reserved), entered);
        }

        while let Some(example) = self.source.pop(&PopRequest::Examples(scope.to_vec())) {
            self.execute_or_fail(source, &example.path, entered);
        }

        if let Some((child, rest)) = reserved.split_first().filter(|(_, rest)| !rest.is_empty()) {
            self.run_group(source, &join(scope, &[child.clone()]), rest, entered);
        }

        while let Some(item) = self.source.pop(&PopRequest::Groups(scope.to_vec())) {
            match item.relative_to(scope) {
                Some([child, rest @ ..]) if !rest.is_empty() => {
                    self.run_group(source, &join(scope, std::slice::from_ref(child)), rest, entered);
                }
                Some(_) => self.execute_or_fail(source, &item.path, entered),
                None => warn!("{} is not below {}", item, scope.join(" > ")),
            }
        }

        if entered {
            if let Err(e) = self.collaborator.leave_group(source, scope) {
                warn!("Teardown of {} failed: {}", scope.join(" > "), e);
                self.record_failure(scope, &e.to_string());
            }
        }
    }

    fn enter(&mut self, source: Option<&str>, scope: &[String]) -> bool {
        match self.collaborator.enter_group(source, scope) {
            Ok(()) => true,
            Err(e) => {
                warn!("Setup of {} failed: {}", scope.join(" > "), e);
                false
            }
        }
    }

    fn execute_or_fail(&mut self, source: Option<&str>, path: &[String], healthy: bool) {
        if healthy {
            self.execute(source, path);
        } else {
            self.record_failure(path, "group setup failed");
        }
    }

    fn execute(&mut self, source: Option<&str>, path: &[String]) {
        match self.collaborator.execute(source, path) {
            Ok(outcome) if outcome.success => {
                println!("{}{}", PASS_PREFIX, path.join(" > "));
                self.passed += 1;
            }
            Ok(outcome) => self.record_failure(path, outcome.output.trim_end()),
            Err(e) => self.record_failure(path, &e.to_string()),
        }
    }

    fn record_failure(&mut self, path: &[String], detail: &str) {
        println!("{}{}", FAIL_PREFIX, path.join(" > "));
        if !detail.is_empty() {
            println!("{}", detail);
        }
        self.failed += 1;
    }
}

fn join(scope: &[String], rest: &[String]) -> Vec<String> {
    let mut path = scope.to_vec();
    path.extend_from_slice(rest);
    path
}

/// Point this process's stdout and stderr at `path`
pub fn redirect_output(path: &Path) -> Result<()> {
    let file = File::create(path)?;
    for fd in [1, 2] {
        dup2(file.as_raw_fd(), fd).map_err(|e| QueueError::Io(e.into()))?;
    }
    Ok(())
}

/// Body of a `distq worker` process
pub fn run_worker(
    collaborator: &dyn ExecutionCollaborator,
    endpoint: Endpoint,
    preferred: Option<TagFilter>,
    scratch_dir: &Path,
) -> Result<usize> {
    let started = Instant::now();
    let mut client = WorkItemClient::new(RemoteQueue::new(endpoint), collaborator).with_preferred_tag(preferred);
    let failed = client.run();
    client.write_stats(scratch_dir)?;

    let waited = client.source.waited();
    info!(
        "Worker done in {:.2}s ({:.2}s waiting on master), {} passed, {} failed",
        started.elapsed().as_secs_f64(),
        waited.as_secs_f64(),
        client.passed(),
        failed
    );
    Ok(failed)
}
