//! Client-side upgrade handshake.
//!
//! Only what is needed to turn a TCP socket into a framed connection: send
//! the upgrade request, require `101` and a matching accept key, and stop
//! reading exactly at the end of the response head so no frame bytes are
//! swallowed.

use super::connection::Connection;
use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::{client::generate_key, derive_accept_key};
use tracing::{debug, info};

const MAX_RESPONSE_HEAD: usize = 8 * 1024;
const MAX_PARALLEL_DIALS: usize = 256;

/// Perform the upgrade handshake on an already connected stream.
pub async fn handshake<S>(stream: &mut S, host: &str, path: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .context("Failed to send upgrade request")?;
    stream.flush().await?;

    let head = read_response_head(stream).await?;
    let mut lines = head.split("\r\n");
    let status = lines.next().unwrap_or_default();
    if status.split_whitespace().nth(1) != Some("101") {
        bail!("Upgrade rejected by {}: {}", host, status);
    }

    let expected = derive_accept_key(key.as_bytes());
    let accept = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|(_, value)| value.trim().to_string())
        .ok_or_else(|| anyhow!("Upgrade response from {} has no accept key", host))?;
    if accept != expected {
        bail!("Upgrade response from {} has a wrong accept key", host);
    }
    Ok(())
}

async fn read_response_head<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            bail!("Upgrade response head exceeds {} bytes", MAX_RESPONSE_HEAD);
        }
        let n = stream
            .read(&mut byte)
            .await
            .context("Failed to read upgrade response")?;
        if n == 0 {
            bail!("Connection closed during upgrade");
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).context("Upgrade response is not valid UTF-8")
}

/// Connect to `addr`, upgrade, and wrap the socket as connection `id`.
pub async fn dial(id: usize, addr: &str, path: &str) -> Result<Connection> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;

    let socket = socket2::SockRef::from(&stream);
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;

    handshake(&mut stream, addr, path)
        .await
        .with_context(|| format!("Upgrade failed for connection {} to {}", id, addr))?;
    debug!("Connection {} established to {}", id, addr);
    Ok(Connection::new(id, stream))
}

/// Dial `count` connections spread round-robin over `addrs`.
///
/// Any single failure aborts the whole set: a pool missing members would
/// skew every per-connection figure.
pub async fn dial_all(addrs: &[String], path: &str, count: usize) -> Result<Vec<Connection>> {
    if addrs.is_empty() {
        bail!("No target addresses given");
    }
    info!("Dialing {} connections to {:?} ...", count, addrs);

    let limit = Arc::new(Semaphore::new(MAX_PARALLEL_DIALS));
    let mut tasks = JoinSet::new();
    for id in 0..count {
        let addr = addrs[id % addrs.len()].clone();
        let path = path.to_string();
        let limit = Arc::clone(&limit);
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await?;
            dial(id, &addr, &path).await
        });
    }

    let mut conns = Vec::with_capacity(count);
    while let Some(joined) = tasks.join_next().await {
        conns.push(joined.context("Dial task panicked")??);
    }
    conns.sort_by_key(|c| c.id());

    info!("Dialed {} connections", conns.len());
    Ok(conns)
}
