//! One-shot clients: connect, write one packet, maybe read one reply.
//!
//! Used by the `send` subcommand to poke a broker without keeping a session
//! open. `send_packet` speaks the line protocol, `send_frame_packet` the
//! WebSocket one.

use std::io;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;

use crate::transport::line::decode_line;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Sends `packet` as one line to `addr`.
///
/// Returns the first reply received within `reply_timeout`, parsed as JSON
/// when possible and as a plain string otherwise. `Ok(None)` means the peer
/// stayed silent or closed without answering.
pub async fn send_packet(
    addr: &str,
    packet: &Value,
    reply_timeout: Duration,
) -> io::Result<Option<Value>> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

    let mut payload = serde_json::to_vec(packet)?;
    payload.push(b'\n');
    stream.write_all(&payload).await?;
    debug!("sent {} bytes to {addr}", payload.len());

    let mut buf = vec![0u8; 2048];
    let read = match timeout(reply_timeout, stream.read(&mut buf)).await {
        Ok(res) => res?,
        Err(_) => return Ok(None),
    };
    let _ = stream.shutdown().await;

    if read == 0 {
        return Ok(None);
    }
    Ok(Some(parse_reply(&buf[..read])))
}

/// Sends `packet` as one text frame to `ws://{addr}`.
///
/// Same reply rules as [`send_packet`]: the first text or binary frame within
/// `reply_timeout` is returned, `Ok(None)` if nothing arrives.
pub async fn send_frame_packet(
    addr: &str,
    packet: &Value,
    reply_timeout: Duration,
) -> Result<Option<Value>, tungstenite::Error> {
    let url = format!("ws://{addr}");
    let (mut ws, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

    ws.send(WsMessage::text(packet.to_string())).await?;
    debug!("sent frame to {url}");

    let reply = timeout(reply_timeout, async {
        while let Some(msg) = ws.next().await {
            match msg? {
                WsMessage::Text(text) => return Ok(Some(parse_reply(text.as_str().as_bytes()))),
                WsMessage::Binary(bytes) => return Ok(Some(parse_reply(&bytes))),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        Ok::<_, tungstenite::Error>(None)
    })
    .await
    .unwrap_or(Ok(None))?;

    let _ = ws.close(None).await;
    Ok(reply)
}

/// A reply may hold several lines; only the first one is interpreted.
pub fn parse_reply(bytes: &[u8]) -> Value {
    let first = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let text = decode_line(first);
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}
