use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use ws_loadgen::ws::{self, encode, MessageKind};

/// Upgrade against a real server, then exchange one frame each way.
#[tokio::test]
async fn dial_upgrades_and_exchanges_frames() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut ws = tokio_tungstenite::accept_async(stream).await?;
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("stream closed"))??;
        assert!(matches!(msg, Message::Binary(ref b) if b.as_ref() == b"ping-payload"));
        ws.send(Message::Text("pong".into())).await?;
        anyhow::Ok(())
    });

    let conn = ws::dial(7, &addr, "/ws").await?;
    assert_eq!(conn.id(), 7);

    let frame = encode(MessageKind::Binary, b"ping-payload");
    let mut buf = Vec::new();
    let kind = conn.round_trip(frame.as_bytes(), &mut buf).await?;
    assert_eq!(kind, MessageKind::Text);
    assert_eq!(buf, b"pong");
    assert_eq!(conn.sent(), 1);
    assert_eq!(conn.received(), 1);

    server.await??;
    Ok(())
}

/// A plain HTTP server that refuses the upgrade fails the dial.
#[tokio::test]
async fn dial_fails_when_upgrade_is_refused() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .await;
        }
    });

    assert!(ws::dial(0, &addr, "/ws").await.is_err());
    Ok(())
}

/// Connections are spread over every address and come back ordered by id.
#[tokio::test]
async fn dial_all_spreads_connections_round_robin() -> Result<()> {
    let mut addrs = Vec::new();
    for _ in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        addrs.push(listener.local_addr()?.to_string());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });
    }

    let conns = ws::dial_all(&addrs, "/ws", 6).await?;
    let ids: Vec<_> = conns.iter().map(|c| c.id()).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    Ok(())
}

/// Nothing listening: the dial error surfaces instead of an empty pool.
#[tokio::test]
async fn dial_all_reports_unreachable_target() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    drop(listener);

    assert!(ws::dial_all(&[addr], "/ws", 3).await.is_err());
    Ok(())
}
