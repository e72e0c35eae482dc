use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::ConsoleError;

const READ_SIZE: usize = 1024;

/// Live console WebSockets, so a global shutdown can close every bridge.
#[derive(Default)]
pub struct WebSocketRegistry {
    next: AtomicU64,
    tokens: Mutex<HashMap<u64, CancellationToken>>,
}

impl WebSocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (u64, CancellationToken) {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.tokens.lock().unwrap().insert(id, token.clone());
        (id, token)
    }

    pub fn unregister(&self, id: u64) {
        self.tokens.lock().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().unwrap().is_empty()
    }

    /// Cancels every live bridge.
    pub fn close_all(&self) {
        for token in self.tokens.lock().unwrap().values() {
            token.cancel();
        }
    }
}

/// Pumps bytes between an upgraded WebSocket and a telnet console endpoint.
///
/// Runs until either side finishes (EOF, error, WS close) or `token` is
/// cancelled; the surviving side is then torn down: the WebSocket is closed
/// if still open and the TCP socket dropped.
pub async fn websocket_to_telnet(
    ws: WebSocket,
    host: &str,
    port: u16,
    token: CancellationToken,
) -> Result<(), ConsoleError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|source| ConsoleError::Connect {
            host: host.to_string(),
            port,
            source,
        })?;
    tracing::info!(host, port, "console websocket bridged to telnet server");

    let (mut tcp_reader, mut tcp_writer) = stream.into_split();
    let (mut ws_sink, mut ws_stream) = ws.split();
    let mut buf = [0u8; READ_SIZE];

    let result: Result<(), ConsoleError> = loop {
        tokio::select! {
            _ = token.cancelled() => break Ok(()),

            message = ws_stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let written = async {
                        tcp_writer.write_all(text.as_bytes()).await?;
                        tcp_writer.flush().await
                    }
                    .await;
                    if let Err(err) = written {
                        break Err(err.into());
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let written = async {
                        tcp_writer.write_all(&bytes).await?;
                        tcp_writer.flush().await
                    }
                    .await;
                    if let Err(err) = written {
                        break Err(err.into());
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                // Ping/pong is answered by the protocol layer.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(%err, "console websocket closed with error");
                    break Ok(());
                }
            },

            read = tcp_reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if ws_sink
                        .send(Message::Binary(buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        break Ok(());
                    }
                }
                Err(err) => break Err(err.into()),
            },
        }
    };

    let _ = ws_sink.send(Message::Close(None)).await;
    tracing::info!(host, port, "console websocket client disconnected");
    result
}
