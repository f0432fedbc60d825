use super::codec::{apply_mask, CodecError, FrameHeader, MessageKind, Opcode};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Identifier assigned to a connection when the pool is built
pub type ConnectionId = usize;

type BoxedStream = Box<dyn Stream>;

/// Anything that can carry frames: a TCP socket after the upgrade, or an
/// in-memory duplex pipe in tests.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Per-operation failures. These are counted, never fatal.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("connection closed by peer")]
    Closed,

    #[error("call timed out")]
    Timeout,

    #[error("invalid message type: {0}")]
    UnexpectedKind(MessageKind),

    #[error("response data ({actual} bytes) is not equal to origin ({expected} bytes)")]
    PayloadMismatch { expected: usize, actual: usize },
}

/// Socket reads are issued in chunks of at least this many bytes.
const READ_CHUNK: usize = 16 * 1024;

/// Reads whole messages off the receive half, reassembling fragments.
///
/// All partial state (unparsed bytes and a half-assembled message) lives in
/// the reader, so a read that is cancelled mid-frame resumes cleanly on the
/// next call.
pub struct MessageReader {
    inner: ReadHalf<BoxedStream>,
    pending: Vec<u8>,
    message: Vec<u8>,
    kind: Option<MessageKind>,
    /// Replies owed to round trips whose caller stopped waiting
    awaiting: u64,
}

impl MessageReader {
    fn new(inner: ReadHalf<BoxedStream>) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(READ_CHUNK),
            message: Vec::new(),
            kind: None,
            awaiting: 0,
        }
    }

    /// Read the next data message into `buf` (cleared first).
    ///
    /// Ping and pong frames are skipped. A close frame yields
    /// [`CallError::Closed`]. `buf` only grows when a message is larger than
    /// its current capacity.
    pub async fn read_message(&mut self, buf: &mut Vec<u8>) -> Result<MessageKind, CallError> {
        loop {
            if let Some(kind) = self.next_message()? {
                buf.clear();
                buf.extend_from_slice(&self.message);
                self.message.clear();
                return Ok(kind);
            }
            self.pending.reserve(READ_CHUNK);
            let n = self
                .inner
                .read_buf(&mut self.pending)
                .await
                .map_err(map_read_error)?;
            if n == 0 {
                return Err(CallError::Closed);
            }
        }
    }

    /// Consume every complete frame in `pending` up to the end of the next
    /// data message. `None` means more bytes are needed.
    fn next_message(&mut self) -> Result<Option<MessageKind>, CallError> {
        let mut offset = 0;
        let outcome = loop {
            let header = match FrameHeader::parse(&self.pending[offset..]) {
                Ok(header) => header,
                Err(CodecError::Incomplete) => break Ok(None),
                Err(e) => break Err(CallError::Protocol(e)),
            };
            let end = offset + header.header_len + header.payload_len as usize;
            if self.pending.len() < end {
                break Ok(None);
            }
            let body = offset + header.header_len..end;
            offset = end;

            match header.opcode {
                Opcode::Ping | Opcode::Pong => continue,
                Opcode::Close => break Err(CallError::Closed),
                Opcode::Text | Opcode::Binary => {
                    if self.kind.is_some() {
                        break Err(invalid_data("new data frame inside a fragmented message"));
                    }
                    self.kind = header.opcode.message_kind();
                }
                Opcode::Continuation => {
                    if self.kind.is_none() {
                        break Err(invalid_data("continuation frame without a message"));
                    }
                }
            }

            let start = self.message.len();
            self.message.extend_from_slice(&self.pending[body]);
            if let Some(key) = header.mask {
                apply_mask(&mut self.message[start..], key);
            }
            if header.fin {
                break Ok(self.kind.take());
            }
        };
        self.pending.drain(..offset);
        outcome
    }
}

fn invalid_data(msg: &'static str) -> CallError {
    CallError::Read(io::Error::new(io::ErrorKind::InvalidData, msg))
}

fn map_read_error(e: io::Error) -> CallError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        CallError::Closed
    } else {
        CallError::Read(e)
    }
}

/// Callback invoked for every message the dispatch task receives.
///
/// Runs on the connection's dispatch task, concurrently with writes issued
/// on the same connection by a send worker. Implementations must return
/// quickly; anything slow stalls delivery for that connection.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, conn: &Connection, kind: MessageKind, payload: &[u8]);
}

/// One live, already-upgraded socket plus the counters the generators keep
/// for it.
pub struct Connection {
    id: ConnectionId,
    writer: Mutex<WriteHalf<BoxedStream>>,
    reader: Mutex<MessageReader>,
    sent: AtomicU64,
    received: AtomicU64,
}

impl Connection {
    pub fn new<S>(id: ConnectionId, stream: S) -> Self
    where
        S: Stream + 'static,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        Self {
            id,
            writer: Mutex::new(write_half),
            reader: Mutex::new(MessageReader::new(read_half)),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Write raw bytes (one frame or a whole batch).
    pub async fn write(&self, bytes: &[u8]) -> Result<(), CallError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await.map_err(CallError::Write)?;
        writer.flush().await.map_err(CallError::Write)
    }

    /// Read the next full message into `buf`.
    pub async fn read_message(&self, buf: &mut Vec<u8>) -> Result<MessageKind, CallError> {
        self.reader.lock().await.read_message(buf).await
    }

    /// Write one frame and read the reply while holding both halves, so two
    /// callers sharing this connection can never interleave their exchanges.
    ///
    /// If the returned future is dropped after the write, the reply stays
    /// owed and is discarded ahead of the next exchange.
    pub async fn round_trip(&self, frame: &[u8], buf: &mut Vec<u8>) -> Result<MessageKind, CallError> {
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        self.discard_owed(&mut reader, buf).await?;

        writer.write_all(frame).await.map_err(CallError::Write)?;
        writer.flush().await.map_err(CallError::Write)?;
        self.record_sent(1);
        reader.awaiting += 1;

        let kind = reader.read_message(buf).await?;
        reader.awaiting -= 1;
        self.record_received(1);
        Ok(kind)
    }

    /// Read and drop replies owed to abandoned round trips. Returns how
    /// many were dropped.
    pub async fn discard_stale(&self, buf: &mut Vec<u8>) -> Result<u64, CallError> {
        let mut reader = self.reader.lock().await;
        self.discard_owed(&mut reader, buf).await
    }

    async fn discard_owed(&self, reader: &mut MessageReader, buf: &mut Vec<u8>) -> Result<u64, CallError> {
        let mut discarded = 0;
        while reader.awaiting > 0 {
            reader.read_message(buf).await?;
            reader.awaiting -= 1;
            self.record_received(1);
            discarded += 1;
        }
        Ok(discarded)
    }

    pub fn record_sent(&self, messages: u64) {
        self.sent.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn record_received(&self, messages: u64) {
        self.received.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Messages sent that have not been matched by a receive yet
    pub fn outstanding(&self) -> u64 {
        self.sent().saturating_sub(self.received())
    }

    /// Register `handler` for every message arriving on this connection.
    ///
    /// Spawns a task that owns the receive half until it is aborted or the
    /// peer goes away. Abort the returned handle to stop delivery.
    pub fn dispatch(self: &Arc<Self>, handler: Arc<dyn MessageHandler>) -> JoinHandle<()> {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = conn.reader.lock().await;
            let mut buf = Vec::new();
            loop {
                match reader.read_message(&mut buf).await {
                    Ok(kind) => handler.on_message(&conn, kind, &buf),
                    Err(e) => {
                        debug!("Dispatch for connection {} finished: {}", conn.id, e);
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("sent", &self.sent())
            .field("received", &self.received())
            .finish()
    }
}
