// src/populator/eager.rs
//! Eager buffering adapters for a frame stream
//!
//! ```text
//!  producer ──send──▶ [bounded queue] ──writer thread──▶ transport
//!  transport ──reader thread──▶ [bounded queue] ──try_next──▶ consumer
//! ```
//!
//! Frames are a 4-byte big-endian length followed by that many bytes. Each
//! adapter owns exactly one background thread and one bounded channel, so
//! the number of frames held in memory never exceeds the channel capacity.

use crate::protocol::MAX_PAYLOAD;
use crate::utils::errors::{QueueError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of frames buffered per adapter
pub const DEFAULT_CAPACITY: usize = 1024;

/// Prefix a payload with its length
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_PAYLOAD)
        .ok_or_else(|| QueueError::Protocol(format!("frame too large ({} bytes)", payload.len())))?;

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read one frame; `None` on a clean end of stream between frames
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Bytes>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large ({} bytes)", len),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(Bytes::from(payload)))
}

/// Writes frames from a background thread so the producer never waits on
/// the transport, only on the queue bound
pub struct EagerWriter {
    sender: Option<Sender<Bytes>>,
    handle: Option<JoinHandle<io::Result<u64>>>,
}

impl EagerWriter {
    pub fn spawn<W>(inner: W, capacity: usize) -> Self
    where
        W: Write + Send + 'static,
    {
        let (sender, receiver) = bounded::<Bytes>(capacity);
        let handle = thread::Builder::new()
            .name("distq-eager-writer".to_string())
            .spawn(move || drain_to(inner, receiver));

        match handle {
            Ok(handle) => Self {
                sender: Some(sender),
                handle: Some(handle),
            },
            Err(e) => {
                warn!("Failed to start writer thread: {}", e);
                Self {
                    sender: None,
                    handle: None,
                }
            }
        }
    }

    /// Queue one payload for writing
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload)?;
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| QueueError::Protocol("writer is not running".to_string()))?;
        sender
            .send(frame)
            .map_err(|_| QueueError::Protocol("writer thread stopped".to_string()))
    }

    /// Flush everything queued and stop the thread
    pub fn finish(mut self) -> Result<u64> {
        self.sender.take();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| QueueError::Protocol("writer thread panicked".to_string()))?
                .map_err(QueueError::from),
            None => Err(QueueError::Protocol("writer is not running".to_string())),
        }
    }
}

impl Drop for EagerWriter {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn drain_to<W: Write>(mut inner: W, receiver: Receiver<Bytes>) -> io::Result<u64> {
    let mut written = 0;
    for frame in receiver.iter() {
        inner.write_all(&frame)?;
        inner.flush()?;
        written += 1;
    }
    debug!("Eager writer finished after {} frames", written);
    Ok(written)
}

/// State of an [`EagerReader`] at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shift<T> {
    Ready(T),

    /// Nothing buffered yet, but the stream is still open
    Pending,

    /// The stream ended and every frame has been consumed
    Closed,
}

/// Drains a transport into memory from a background thread
///
/// The thread is detached: it may sit in a read that only returns when the
/// other end closes.
pub struct EagerReader {
    receiver: Receiver<Bytes>,
}

impl EagerReader {
    pub fn spawn<R>(inner: R, capacity: usize) -> Self
    where
        R: Read + Send + 'static,
    {
        let (sender, receiver) = bounded::<Bytes>(capacity);
        let spawned = thread::Builder::new()
            .name("distq-eager-reader".to_string())
            .spawn(move || fill_from(inner, sender));

        if let Err(e) = spawned {
            // The sender went down with the closure, so the reader reports Closed
            warn!("Failed to start reader thread: {}", e);
        }
        Self { receiver }
    }

    /// Take the next frame without blocking
    pub fn try_next(&self) -> Shift<Bytes> {
        match self.receiver.try_recv() {
            Ok(frame) => Shift::Ready(frame),
            Err(TryRecvError::Empty) => Shift::Pending,
            Err(TryRecvError::Disconnected) => Shift::Closed,
        }
    }

    /// Wait up to `timeout` for the next frame
    pub fn next_timeout(&self, timeout: Duration) -> Shift<Bytes> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Shift::Ready(frame),
            Err(RecvTimeoutError::Timeout) => Shift::Pending,
            Err(RecvTimeoutError::Disconnected) => Shift::Closed,
        }
    }

    pub fn buffered(&self) -> usize {
        self.receiver.len()
    }
}

fn fill_from<R: Read>(mut inner: R, sender: Sender<Bytes>) {
    let mut frames = 0u64;
    loop {
        match read_frame(&mut inner) {
            Ok(Some(frame)) => {
                if sender.send(frame).is_err() {
                    debug!("Eager reader consumer went away after {} frames", frames);
                    return;
                }
                frames += 1;
            }
            Ok(None) => {
                debug!("Eager reader reached end of stream after {} frames", frames);
                return;
            }
            Err(e) => {
                warn!("Eager reader stopped after {} frames: {}", frames, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;

    fn drain(reader: &EagerReader) -> Vec<Bytes> {
        let mut frames = Vec::new();
        loop {
            match reader.next_timeout(Duration::from_secs(5)) {
                Shift::Ready(frame) => frames.push(frame),
                Shift::Pending => panic!("reader stalled"),
                Shift::Closed => return frames,
            }
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);

        let mut cursor = Cursor::new(frame.to_vec());
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 9, b'x']);
        assert!(read_frame(&mut cursor).is_err());

        let mut cursor = Cursor::new(vec![0, 0]);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_writer_to_reader_over_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        let writer = EagerWriter::spawn(a, 4);
        let reader = EagerReader::spawn(b, 4);

        // More frames than either queue holds: both threads must keep draining
        for i in 0..100u32 {
            writer.send(format!("frame {}", i).as_bytes()).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 100);

        let frames = drain(&reader);
        assert_eq!(frames.len(), 100);
        assert_eq!(&frames[42][..], b"frame 42");
    }

    #[test]
    fn test_reader_reports_pending_while_open() {
        let (a, b) = UnixStream::pair().unwrap();
        let reader = EagerReader::spawn(b, DEFAULT_CAPACITY);
        assert_eq!(reader.try_next(), Shift::Pending);

        let writer = EagerWriter::spawn(a, DEFAULT_CAPACITY);
        writer.send(b"late").unwrap();
        writer.finish().unwrap();

        assert_eq!(reader.next_timeout(Duration::from_secs(5)), Shift::Ready(Bytes::from_static(b"late")));
        assert_eq!(reader.next_timeout(Duration::from_secs(5)), Shift::Closed);
    }
}
