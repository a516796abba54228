// src/protocol/command.rs
//! Wire commands
//!
//! Every request is one ASCII command line, optionally followed by a JSON
//! payload whose byte length the line announces:
//!
//! ```text
//! POP\n
//! POP EXAMPLE 9\n["a","b"]
//! POP GROUP 5\n["a"]
//! POP TAGGED 19\n["no_split","true"]
//! SLAVE 8 build-3 3f2a9c01d4e5b6a7 nightly\n
//! WORKER 412\n{...WorkerRecord...}
//! ```
//!
//! POP answers are a JSON `PopReply`, or nothing at all once the run is over.

use crate::tree::{Assignment, PopRequest, TagFilter};
use crate::utils::errors::{QueueError, Result};
use crate::worker::record::WorkerRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest accepted command line, newline included
pub const MAX_LINE: usize = 4096;

/// Largest accepted payload
pub const MAX_PAYLOAD: usize = 64 << 20;

pub const OK_REPLY: &[u8] = b"OK\n";
pub const WRONG_RUN_REPLY: &[u8] = b"WRONG RUN\n";

/// A relay announcing its local workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub workers: usize,
    pub host: String,
    pub token: String,
    pub message: Option<String>,
}

/// One decoded request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Pop(PopRequest),
    Register(Registration),
    Complete(Box<WorkerRecord>),
}

/// Answer to a POP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopReply {
    Item(Assignment),

    /// Nothing under the requested scope
    Empty,

    /// Discovery is still running; ask again shortly
    Wait,
}

impl PopReply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a full response; `None` is the end-of-run silence
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(bytes)?))
    }
}

impl Request {
    /// Command verb, for logs and metrics labels
    pub fn verb(&self) -> &'static str {
        match self {
            Request::Pop(_) => "POP",
            Request::Register(_) => "SLAVE",
            Request::Complete(_) => "WORKER",
        }
    }

    /// Serialize to the bytes a client sends
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Request::Pop(PopRequest::Root) => Ok(b"POP\n".to_vec()),
            Request::Pop(PopRequest::Examples(scope)) => with_payload("POP EXAMPLE", &serde_json::to_vec(scope)?),
            Request::Pop(PopRequest::Groups(scope)) => with_payload("POP GROUP", &serde_json::to_vec(scope)?),
            Request::Pop(PopRequest::Tagged(filter)) => with_payload("POP TAGGED", &serde_json::to_vec(filter)?),
            Request::Register(registration) => {
                let mut line = format!(
                    "SLAVE {} {} {}",
                    registration.workers, registration.host, registration.token
                );
                if let Some(message) = &registration.message {
                    let message: String = message.chars().filter(|c| *c != '\r' && *c != '\n').collect();
                    if !message.is_empty() {
                        line.push(' ');
                        line.push_str(&message);
                    }
                }
                line.push('\n');
                if line.len() > MAX_LINE {
                    return Err(QueueError::Protocol(format!("command line too long ({} bytes)", line.len())));
                }
                Ok(line.into_bytes())
            }
            Request::Complete(record) => with_payload("WORKER", &serde_json::to_vec(record)?),
        }
    }

    /// Read one request off a stream
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = String::new();
        let n = (&mut *reader).take(MAX_LINE as u64).read_line(&mut line).await?;
        if n == 0 {
            return Err(QueueError::Protocol("connection closed before a command".to_string()));
        }
        if !line.ends_with('\n') {
            return Err(QueueError::Protocol(format!(
                "command line exceeds {} bytes or is unterminated",
                MAX_LINE
            )));
        }

        let line = line.trim_end_matches(['\r', '\n']);
        let mut words = line.splitn(2, ' ');
        let verb = words.next().unwrap_or_default();
        let rest = words.next().unwrap_or_default();

        match verb {
            "POP" => match rest.split_once(' ') {
                None if rest.is_empty() => Ok(Request::Pop(PopRequest::Root)),
                Some(("EXAMPLE", len)) => {
                    let scope: Vec<String> = read_payload(reader, len).await?;
                    Ok(Request::Pop(PopRequest::Examples(scope)))
                }
                Some(("GROUP", len)) => {
                    let scope: Vec<String> = read_payload(reader, len).await?;
                    Ok(Request::Pop(PopRequest::Groups(scope)))
                }
                Some(("TAGGED", len)) => {
                    let filter: TagFilter = read_payload(reader, len).await?;
                    Ok(Request::Pop(PopRequest::Tagged(filter)))
                }
                _ => Err(QueueError::Protocol(format!("unrecognized command: {}", line))),
            },
            "SLAVE" => parse_registration(rest).map(Request::Register),
            "WORKER" => {
                let record: WorkerRecord = read_payload(reader, rest).await?;
                Ok(Request::Complete(Box::new(record)))
            }
            _ => Err(QueueError::Protocol(format!("unrecognized command: {}", line))),
        }
    }
}

fn with_payload(command: &str, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(QueueError::Protocol(format!("payload too large ({} bytes)", payload.len())));
    }
    let mut bytes = format!("{} {}\n", command, payload.len()).into_bytes();
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

async fn read_payload<R, T>(reader: &mut R, len: &str) -> Result<T>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let len: usize = len
        .trim()
        .parse()
        .map_err(|_| QueueError::Protocol(format!("invalid payload length: {:?}", len)))?;
    if len > MAX_PAYLOAD {
        return Err(QueueError::Protocol(format!("payload too large ({} bytes)", len)));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

fn parse_registration(rest: &str) -> Result<Registration> {
    let invalid = || QueueError::Protocol(format!("malformed SLAVE command: {:?}", rest));

    let mut fields = rest.splitn(4, ' ');
    let workers = fields.next().and_then(|w| w.parse().ok()).ok_or_else(invalid)?;
    let host = fields.next().filter(|h| is_host(h)).ok_or_else(invalid)?;
    let token = fields.next().filter(|t| is_token(t)).ok_or_else(invalid)?;
    let message = fields.next().map(str::trim).filter(|m| !m.is_empty());

    Ok(Registration {
        workers,
        host: host.to_string(),
        token: token.to_string(),
        message: message.map(str::to_string),
    })
}

fn is_host(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn decode(bytes: &[u8]) -> Result<Request> {
        let mut reader = BufReader::new(bytes);
        Request::read_from(&mut reader).await
    }

    fn scope(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_pop_variants_decode() {
        assert_eq!(decode(b"POP\n").await.unwrap(), Request::Pop(PopRequest::Root));
        assert_eq!(
            decode(b"POP EXAMPLE 9\n[\"a\",\"b\"]").await.unwrap(),
            Request::Pop(PopRequest::Examples(scope(&["a", "b"])))
        );
        assert_eq!(
            decode(b"POP GROUP 5\n[\"a\"]").await.unwrap(),
            Request::Pop(PopRequest::Groups(scope(&["a"])))
        );
        assert_eq!(
            decode(b"POP TAGGED 19\n[\"no_split\",\"true\"]").await.unwrap(),
            Request::Pop(PopRequest::Tagged("no_split=true".parse().unwrap()))
        );
    }

    #[tokio::test]
    async fn test_encoded_requests_decode_back() {
        let requests = vec![
            Request::Pop(PopRequest::Groups(scope(&["outer", "inner"]))),
            Request::Register(Registration {
                workers: 8,
                host: "build-3.local".to_string(),
                token: "3f2a9c01d4e5b6a7".to_string(),
                message: Some("nightly run".to_string()),
            }),
        ];
        for request in requests {
            let bytes = request.encode().unwrap();
            assert_eq!(decode(&bytes).await.unwrap(), request);
        }
    }

    #[tokio::test]
    async fn test_worker_report_decodes() {
        let mut record = WorkerRecord::new(77, 2);
        record.host = Some("build-3".to_string());
        record.finish(Some(0));
        let bytes = Request::Complete(Box::new(record.clone())).encode().unwrap();

        match decode(&bytes).await.unwrap() {
            Request::Complete(decoded) => assert_eq!(*decoded, record),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registration_message_strips_newlines() {
        let request = Request::Register(Registration {
            workers: 2,
            host: "h".to_string(),
            token: "t0k".to_string(),
            message: Some("line one\r\nline two".to_string()),
        });
        let bytes = request.encode().unwrap();
        assert_eq!(bytes, b"SLAVE 2 h t0k line oneline two\n");
    }

    #[tokio::test]
    async fn test_malformed_commands_are_rejected() {
        for bytes in [
            &b"HELLO\n"[..],
            b"POP SIDEWAYS 3\n[1]",
            b"POP GROUP x\n",
            b"POP GROUP 10\n[\"a\"]",
            b"SLAVE two host token\n",
            b"SLAVE 2 bad/host token\n",
            b"",
            b"POP",
        ] {
            assert!(decode(bytes).await.is_err(), "accepted {:?}", bytes);
        }
    }

    #[tokio::test]
    async fn test_line_limit() {
        let mut bytes = vec![b'P'; MAX_LINE + 10];
        bytes.push(b'\n');
        assert!(matches!(decode(&bytes).await, Err(QueueError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_payload_limit() {
        let line = format!("POP GROUP {}\n", MAX_PAYLOAD + 1);
        assert!(matches!(decode(line.as_bytes()).await, Err(QueueError::Protocol(_))));
    }

    #[test]
    fn test_pop_reply_wire_form() {
        let item = PopReply::Item(Assignment::new(Some("a.json".to_string()), scope(&["g", "x"])));
        assert_eq!(
            String::from_utf8(item.encode().unwrap()).unwrap(),
            r#"{"item":{"source":"a.json","path":["g","x"]}}"#
        );
        assert_eq!(PopReply::Wait.encode().unwrap(), br#""wait""#);
        assert_eq!(PopReply::decode(br#""empty""#).unwrap(), Some(PopReply::Empty));
        assert_eq!(PopReply::decode(b"").unwrap(), None);
        assert!(PopReply::decode(b"garbage").is_err());
    }
}
