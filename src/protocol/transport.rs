// src/protocol/transport.rs
//! Stream transports
//!
//! An address ending in `:<digits>` (or made only of digits) is a TCP
//! endpoint; anything else is a filesystem path for a UNIX domain socket.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::debug;

/// Where a master or relay listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: Option<String>, port: u16 },
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty endpoint".to_string());
        }

        let is_port = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
        if is_port(s) {
            let port = s.parse().map_err(|e| format!("invalid port {}: {}", s, e))?;
            return Ok(Endpoint::Tcp { host: None, port });
        }

        match s.rsplit_once(':') {
            Some((host, port)) if is_port(port) => {
                let port = port.parse().map_err(|e| format!("invalid port {}: {}", port, e))?;
                let host = (!host.is_empty()).then(|| host.to_string());
                Ok(Endpoint::Tcp { host, port })
            }
            _ => Ok(Endpoint::Unix(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp { host: Some(host), port } => write!(f, "{}:{}", host, port),
            Endpoint::Tcp { host: None, port } => write!(f, "{}", port),
        }
    }
}

impl Endpoint {
    fn bind_addr(&self) -> Option<String> {
        match self {
            Endpoint::Unix(_) => None,
            Endpoint::Tcp { host, port } => Some(format!("{}:{}", host.as_deref().unwrap_or("0.0.0.0"), port)),
        }
    }

    fn connect_addr(&self) -> Option<String> {
        match self {
            Endpoint::Unix(_) => None,
            Endpoint::Tcp { host, port } => Some(format!("{}:{}", host.as_deref().unwrap_or("127.0.0.1"), port)),
        }
    }

    /// Open an async connection
    pub async fn connect(&self) -> io::Result<Connection> {
        match self {
            Endpoint::Unix(path) => Ok(Connection::Unix(UnixStream::connect(path).await?)),
            Endpoint::Tcp { .. } => {
                let addr = self.connect_addr().unwrap_or_default();
                Ok(Connection::Tcp(TcpStream::connect(addr).await?))
            }
        }
    }

    /// Open a blocking connection, bounding the TCP connect by `timeout`
    pub fn connect_blocking(&self, timeout: Duration) -> io::Result<BlockingConnection> {
        match self {
            Endpoint::Unix(path) => Ok(BlockingConnection::Unix(StdUnixStream::connect(path)?)),
            Endpoint::Tcp { .. } => {
                let addr = self.connect_addr().unwrap_or_default();
                let mut last_err = io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", addr));
                for resolved in addr.to_socket_addrs()? {
                    match StdTcpStream::connect_timeout(&resolved, timeout) {
                        Ok(stream) => return Ok(BlockingConnection::Tcp(stream)),
                        Err(e) => last_err = e,
                    }
                }
                Err(last_err)
            }
        }
    }
}

/// An accepted or dialed async stream
#[derive(Debug)]
pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for Connection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A dialed blocking stream, used inside worker processes
#[derive(Debug)]
pub enum BlockingConnection {
    Unix(StdUnixStream),
    Tcp(StdTcpStream),
}

impl Read for BlockingConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BlockingConnection::Unix(s) => s.read(buf),
            BlockingConnection::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for BlockingConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BlockingConnection::Unix(s) => s.write(buf),
            BlockingConnection::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BlockingConnection::Unix(s) => s.flush(),
            BlockingConnection::Tcp(s) => s.flush(),
        }
    }
}

/// A bound listening socket
#[derive(Debug)]
pub enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    /// Bind, replacing a stale socket file if one is left over
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Unix(path) => {
                if path.exists() {
                    debug!("Removing stale socket {:?}", path);
                    std::fs::remove_file(path)?;
                }
                Ok(Listener::Unix {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp { .. } => {
                let addr = endpoint.bind_addr().unwrap_or_default();
                Ok(Listener::Tcp(TcpListener::bind(addr).await?))
            }
        }
    }

    /// Accept one connection, with a printable peer description
    pub async fn accept(&self) -> io::Result<(Connection, String)> {
        match self {
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Connection::Unix(stream), path.display().to_string()))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Connection::Tcp(stream), peer.to_string()))
            }
        }
    }

    /// An endpoint local workers can dial
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                let host = if addr.ip().is_unspecified() {
                    "127.0.0.1".to_string()
                } else {
                    addr.ip().to_string()
                };
                Ok(Endpoint::Tcp {
                    host: Some(host),
                    port: addr.port(),
                })
            }
        }
    }

    /// Stop listening and remove the socket file, if any
    pub fn close(self) {
        if let Listener::Unix { listener, path } = self {
            drop(listener);
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("Failed to remove socket {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            "/tmp/q.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/q.sock"))
        );
        assert_eq!(
            "7000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp { host: None, port: 7000 }
        );
        assert_eq!(
            "master.local:7000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp {
                host: Some("master.local".to_string()),
                port: 7000
            }
        );
        assert_eq!(
            "./sock:name".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("./sock:name"))
        );
        assert!("".parse::<Endpoint>().is_err());
        assert!("99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_display() {
        for s in ["/tmp/q.sock", "7000", "10.0.0.1:7000"] {
            assert_eq!(s.parse::<Endpoint>().unwrap().to_string(), s);
        }
    }

    #[tokio::test]
    async fn test_unix_listener_round_trip_and_cleanup() {
        let dir = tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("q.sock"));
        std::fs::write(dir.path().join("q.sock"), b"stale").unwrap();

        let listener = Listener::bind(&endpoint).await.unwrap();
        let client = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                let mut conn = endpoint.connect().await.unwrap();
                conn.write_all(b"ping").await.unwrap();
                conn.shutdown().await.unwrap();
            }
        });

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = String::new();
        conn.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "ping");
        client.await.unwrap();

        listener.close();
        assert!(!dir.path().join("q.sock").exists());
    }

    #[tokio::test]
    async fn test_tcp_local_endpoint_is_dialable() {
        let listener = Listener::bind(&"127.0.0.1:0".parse().unwrap()).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();

        let dial = tokio::task::spawn_blocking(move || endpoint.connect_blocking(Duration::from_secs(5)).map(|_| ()));
        let (_conn, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("127.0.0.1:"));
        dial.await.unwrap().unwrap();
    }
}
