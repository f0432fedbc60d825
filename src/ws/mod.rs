//! Message-framed transport used by both traffic generators.
//!
//! The generators only need four things from a connection: write bytes,
//! read one full message, a typed per-connection counter slot, and an
//! asynchronous message callback. [`Connection`] provides all four over any
//! `AsyncRead + AsyncWrite` stream.

pub mod codec;
pub mod connection;
pub mod dial;

pub use codec::{build_batch, decode, encode, encode_with_mask, Batch, CodecError, Frame, MessageKind};
pub use connection::{CallError, Connection, ConnectionId, MessageHandler, MessageReader};
pub use dial::{dial, dial_all};

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory subjects for exercising the generators without sockets.

    use super::codec::{encode_with_mask, MessageKind};
    use super::connection::Connection;
    use std::sync::Arc;
    use std::time::Duration;

    /// How the simulated server answers each message
    #[derive(Debug, Clone, Copy)]
    pub enum SubjectBehavior {
        /// Return exactly what was received
        Echo,
        /// Echo with the last payload byte flipped
        Corrupt,
        /// Echo as a text message
        WrongKind,
        /// Read everything, answer nothing
        Silent,
        /// Echo each message after a fixed delay
        Delayed(Duration),
        /// Hold back the first reply, echo the rest at once
        DelayFirst(Duration),
    }

    /// A client connection wired to a simulated server task.
    pub fn subject(id: usize, behavior: SubjectBehavior) -> Connection {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = Arc::new(Connection::new(usize::MAX, server));
        tokio::spawn(serve(server, behavior));
        Connection::new(id, client)
    }

    async fn serve(server: Arc<Connection>, behavior: SubjectBehavior) {
        let mut buf = Vec::new();
        let mut first = true;
        while let Ok(kind) = server.read_message(&mut buf).await {
            let delay = match behavior {
                SubjectBehavior::Delayed(delay) => Some(delay),
                SubjectBehavior::DelayFirst(delay) if first => Some(delay),
                _ => None,
            };
            first = false;
            if let Some(delay) = delay {
                let server = Arc::clone(&server);
                let reply = encode_with_mask(kind, &buf, None);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = server.write(reply.as_bytes()).await;
                });
                continue;
            }
            let reply = match behavior {
                SubjectBehavior::Silent => continue,
                SubjectBehavior::Echo
                | SubjectBehavior::Delayed(_)
                | SubjectBehavior::DelayFirst(_) => encode_with_mask(kind, &buf, None),
                SubjectBehavior::WrongKind => encode_with_mask(MessageKind::Text, &buf, None),
                SubjectBehavior::Corrupt => {
                    if let Some(last) = buf.last_mut() {
                        *last ^= 0xff;
                    }
                    encode_with_mask(kind, &buf, None)
                }
            };
            if server.write(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
