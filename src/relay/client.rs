// src/relay/client.rs
//! Sub-master running on a secondary host
//!
//! ```text
//!  local workers ──POP──▶ relay socket ──spawned forward──▶ root master
//!  reaped worker ──────────▶ WORKER <record> ─────────────▶ root master
//! ```
//!
//! The relay keeps no queue of its own. It lives as long as its local
//! workers do.

use crate::protocol::command::OK_REPLY;
use crate::protocol::{Connection, Endpoint, Listener, Registration, Request};
use crate::utils::errors::{QueueError, Result};
use crate::worker::{WorkerRecord, WorkerSupervisor};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Delay between attempts to reach the root master
pub const CONNECT_RETRY: Duration = Duration::from_millis(500);

/// Relay settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub upstream: Endpoint,
    pub local: Endpoint,
    pub run_token: String,
    pub host: String,
    pub message: Option<String>,

    /// How long to keep retrying the root master at startup
    pub connect_timeout: Duration,

    pub poll_interval: Duration,

    /// Upper bound on reading one request from a local worker, and on the
    /// root's answer to our registration
    pub read_timeout: Duration,

    /// Upper bound on one forwarded exchange with the root master
    pub upstream_timeout: Duration,
}

impl RelayConfig {
    pub fn new(upstream: Endpoint, local: Endpoint, run_token: impl Into<String>) -> Self {
        Self {
            upstream,
            local,
            run_token: run_token.into(),
            host: local_hostname(),
            message: None,
            connect_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            read_timeout: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// This machine's host name, as the root will see it
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Registers with the root master and proxies local workers to it
pub struct RelayClient {
    config: RelayConfig,
    listener: Option<Listener>,
    supervisor: WorkerSupervisor,
    reported: Vec<WorkerRecord>,
}

impl RelayClient {
    /// Announce `workers` local slots to the root master
    ///
    /// Retries until `connect_timeout`; a rejection is final.
    pub async fn register(config: &RelayConfig, workers: usize) -> Result<()> {
        let deadline = Instant::now() + config.connect_timeout;
        let unreachable = |detail: String| QueueError::RelayUnreachable(format!("{} ({})", config.upstream, detail));

        let conn = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, config.upstream.connect()).await {
                Ok(Ok(conn)) => break conn,
                Ok(Err(e)) if Instant::now() + CONNECT_RETRY < deadline => {
                    debug!("Root master at {} not reachable yet: {}", config.upstream, e);
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
                Ok(Err(e)) => return Err(unreachable(e.to_string())),
                Err(_) => return Err(unreachable(format!("no connection after {:?}", config.connect_timeout))),
            }
        };

        let registration = Request::Register(Registration {
            workers,
            host: config.host.clone(),
            token: config.run_token.clone(),
            message: config.message.clone(),
        });
        let encoded = registration.encode()?;

        let exchange = async {
            let mut conn = BufReader::new(conn);
            conn.get_mut().write_all(&encoded).await?;
            let mut reply = String::new();
            conn.read_line(&mut reply).await?;
            Ok::<_, QueueError>(reply)
        };
        let reply = tokio::time::timeout(config.read_timeout, exchange)
            .await
            .map_err(|_| unreachable(format!("no registration reply within {:?}", config.read_timeout)))??;
        if reply.as_bytes() != OK_REPLY {
            return Err(QueueError::RelayRejected(reply.trim().to_string()));
        }

        info!("Registered {} workers with {}", workers, config.upstream);
        Ok(())
    }

    /// Register, then listen locally
    pub async fn connect(config: RelayConfig, workers: usize, supervisor: WorkerSupervisor) -> Result<Self> {
        Self::register(&config, workers).await?;
        let listener = Listener::bind(&config.local)
            .await
            .map_err(|e| QueueError::Protocol(format!("Failed to listen on {}: {}", config.local, e)))?;
        info!("Relay listening on {}", config.local);

        Ok(Self {
            config,
            listener: Some(listener),
            supervisor,
            reported: Vec::new(),
        })
    }

    pub fn local_endpoint(&self) -> Result<Endpoint> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| QueueError::Protocol("relay is not listening".to_string()))?;
        Ok(listener.local_endpoint()?)
    }

    pub fn supervisor_mut(&mut self) -> &mut WorkerSupervisor {
        &mut self.supervisor
    }

    /// Proxy until every local worker has exited and been reported
    pub async fn run(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| QueueError::Protocol("relay is not listening".to_string()))?;

        while !self.supervisor.is_empty() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => self.dispatch(conn, peer),
                    Err(e) => warn!("Accept failed: {}", e),
                },
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            for mut record in self.supervisor.reap_exited().await {
                record.host = Some(self.config.host.clone());
                self.report(record).await;
            }
        }

        listener.close();
        info!("Relay finished, reported {} workers", self.reported.len());
        Ok(())
    }

    fn dispatch(&self, conn: Connection, peer: String) {
        let upstream = self.config.upstream.clone();
        let read_timeout = self.config.read_timeout;
        let upstream_timeout = self.config.upstream_timeout;
        tokio::spawn(async move {
            if let Err(e) = forward(conn, &upstream, read_timeout, upstream_timeout).await {
                debug!("Forward for {} ended early: {}", peer, e);
            }
        });
    }

    async fn report(&mut self, record: WorkerRecord) {
        let request = Request::Complete(Box::new(record.clone()));
        let result = async {
            let encoded = request.encode()?;
            upstream_exchange(&self.config.upstream, &encoded, self.config.upstream_timeout).await
        }
        .await;

        match result {
            Ok(reply) if reply == OK_REPLY => debug!("Reported worker {} upstream", record.num),
            Ok(reply) => warn!(
                "Unexpected reply to completion report: {:?}",
                String::from_utf8_lossy(&reply)
            ),
            Err(e) => warn!("Failed to report worker {} upstream: {}", record.num, e),
        }
        self.reported.push(record);
    }

    /// Records of local workers, as sent upstream
    pub fn reported(&self) -> &[WorkerRecord] {
        &self.reported
    }
}

/// Relay one POP to the root master and its answer back
///
/// If the root does not answer, neither does the relay.
async fn forward(conn: Connection, upstream: &Endpoint, read_timeout: Duration, upstream_timeout: Duration) -> Result<()> {
    let mut local = BufReader::new(conn);
    let request = tokio::time::timeout(read_timeout, Request::read_from(&mut local))
        .await
        .map_err(|_| QueueError::Protocol("timed out reading request".to_string()))??;

    if !matches!(request, Request::Pop(_)) {
        return Err(QueueError::Protocol(format!("relay does not accept {}", request.verb())));
    }

    let response = upstream_exchange(upstream, &request.encode()?, upstream_timeout).await?;

    let local = local.get_mut();
    local.write_all(&response).await?;
    local.shutdown().await?;
    Ok(())
}

/// Send one request to the root master and collect its whole answer
async fn upstream_exchange(upstream: &Endpoint, request: &[u8], limit: Duration) -> Result<Vec<u8>> {
    let exchange = async {
        let mut remote = upstream.connect().await?;
        remote.write_all(request).await?;
        let mut response = Vec::new();
        remote.read_to_end(&mut response).await?;
        Ok::<_, QueueError>(response)
    };
    tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| QueueError::RelayUnreachable(format!("{} did not answer within {:?}", upstream, limit)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::WRONG_RUN_REPLY;
    use crate::protocol::PopReply;
    use crate::tree::{Assignment, PopRequest};
    use crate::worker::SpawnConfig;
    use std::path::Path;
    use tempfile::tempdir;

    /// Fake root master answering each connection with a fixed reply
    async fn fake_root(path: &Path, replies: Vec<Vec<u8>>) -> tokio::task::JoinHandle<Vec<Request>> {
        let listener = Listener::bind(&Endpoint::Unix(path.to_path_buf())).await.unwrap();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for reply in replies {
                let (conn, _) = listener.accept().await.unwrap();
                let mut conn = BufReader::new(conn);
                seen.push(Request::read_from(&mut conn).await.unwrap());
                conn.get_mut().write_all(&reply).await.unwrap();
            }
            listener.close();
            seen
        })
    }

    fn relay_config(dir: &Path) -> RelayConfig {
        let mut config = RelayConfig::new(
            Endpoint::Unix(dir.join("root.sock")),
            Endpoint::Unix(dir.join("relay.sock")),
            "abc123",
        );
        config.host = "build-3".to_string();
        config.message = Some("nightly".to_string());
        config.connect_timeout = Duration::from_secs(2);
        config.poll_interval = Duration::from_millis(10);
        config
    }

    /// A TCP root whose accept backlog is full, so new connects never complete
    async fn saturated_root() -> (tokio::net::TcpListener, Vec<Connection>, Endpoint) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let endpoint = Endpoint::Tcp {
            host: Some("127.0.0.1".to_string()),
            port: listener.local_addr().unwrap().port(),
        };

        let mut held = Vec::new();
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_millis(200), endpoint.connect()).await {
                Ok(Ok(conn)) => held.push(conn),
                _ => break,
            }
        }
        (listener, held, endpoint)
    }

    #[tokio::test]
    async fn test_registration_accepted() {
        let dir = tempdir().unwrap();
        let root = fake_root(&dir.path().join("root.sock"), vec![OK_REPLY.to_vec()]).await;

        RelayClient::register(&relay_config(dir.path()), 4).await.unwrap();
        let seen = root.await.unwrap();
        assert_eq!(
            seen,
            vec![Request::Register(Registration {
                workers: 4,
                host: "build-3".to_string(),
                token: "abc123".to_string(),
                message: Some("nightly".to_string()),
            })]
        );
    }

    #[tokio::test]
    async fn test_registration_rejected() {
        let dir = tempdir().unwrap();
        let _root = fake_root(&dir.path().join("root.sock"), vec![WRONG_RUN_REPLY.to_vec()]).await;

        let result = RelayClient::register(&relay_config(dir.path()), 4).await;
        assert!(matches!(result, Err(QueueError::RelayRejected(reply)) if reply == "WRONG RUN"));
    }

    #[tokio::test]
    async fn test_unreachable_root_gives_up_after_timeout() {
        let dir = tempdir().unwrap();
        let mut config = relay_config(dir.path());
        config.connect_timeout = Duration::from_millis(600);

        let started = Instant::now();
        let result = RelayClient::register(&config, 1).await;
        assert!(matches!(result, Err(QueueError::RelayUnreachable(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_root_that_never_accepts_times_out() {
        let dir = tempdir().unwrap();
        let (_listener, _held, upstream) = saturated_root().await;
        let mut config = relay_config(dir.path());
        config.upstream = upstream;
        config.connect_timeout = Duration::from_secs(1);
        config.read_timeout = Duration::from_secs(1);

        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(8), RelayClient::register(&config, 1))
            .await
            .expect("registration never gave up");
        assert!(matches!(result, Err(QueueError::RelayUnreachable(_))), "{:?}", result);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_silent_root_does_not_stall_forwards_or_reports() {
        let dir = tempdir().unwrap();
        // Bound but never accepting: connects land in the backlog and nothing answers
        let _root = Listener::bind(&Endpoint::Unix(dir.path().join("root.sock"))).await.unwrap();
        let mut config = relay_config(dir.path());
        config.upstream_timeout = Duration::from_millis(200);

        let (relay_end, worker_end) = tokio::net::UnixStream::pair().unwrap();
        let mut worker_end = Connection::Unix(worker_end);
        worker_end.write_all(b"POP\n").await.unwrap();
        let started = Instant::now();
        let forwarded = tokio::time::timeout(
            Duration::from_secs(5),
            forward(Connection::Unix(relay_end), &config.upstream, config.read_timeout, config.upstream_timeout),
        )
        .await
        .expect("forward never gave up");
        assert!(matches!(forwarded, Err(QueueError::RelayUnreachable(_))), "{:?}", forwarded);

        // The dropped relay end leaves the worker with silence, its end-of-run signal
        let mut response = Vec::new();
        worker_end.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());

        let mut relay = RelayClient {
            config,
            listener: None,
            supervisor: WorkerSupervisor::new(SpawnConfig::new("/bin/true"), dir.path()),
            reported: Vec::new(),
        };
        let mut record = WorkerRecord::new(7, 1);
        record.finish(Some(0));
        tokio::time::timeout(Duration::from_secs(5), relay.report(record))
            .await
            .expect("report never gave up");
        assert_eq!(relay.reported().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_forwards_pops_and_reports_workers() {
        let dir = tempdir().unwrap();
        let item = PopReply::Item(Assignment::new(None, vec!["a".to_string()]));
        let root = fake_root(
            &dir.path().join("root.sock"),
            vec![OK_REPLY.to_vec(), item.encode().unwrap(), OK_REPLY.to_vec()],
        )
        .await;

        let supervisor = WorkerSupervisor::new(SpawnConfig::new("/bin/sh").with_args(&["-c", "sleep 0.5", "w"]), dir.path());
        let mut relay = RelayClient::connect(relay_config(dir.path()), 1, supervisor).await.unwrap();
        let local = relay.local_endpoint().unwrap();
        relay.supervisor_mut().spawn(1, &local.to_string()).unwrap();

        let worker = tokio::spawn(async move {
            let mut conn = local.connect().await.unwrap();
            conn.write_all(b"POP\n").await.unwrap();
            let mut response = Vec::new();
            conn.read_to_end(&mut response).await.unwrap();
            response
        });

        relay.run().await.unwrap();
        assert_eq!(PopReply::decode(&worker.await.unwrap()).unwrap(), Some(item));

        let seen = root.await.unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], Request::Pop(PopRequest::Root));
        match &seen[2] {
            Request::Complete(record) => {
                assert_eq!(record.host.as_deref(), Some("build-3"));
                assert!(record.succeeded());
            }
            other => panic!("expected a completion report, got {:?}", other),
        }
        assert_eq!(relay.reported().len(), 1);
        assert!(!dir.path().join("relay.sock").exists());
    }
}
