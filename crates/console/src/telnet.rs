use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codes::*;
use crate::IacParser;

const READ_SIZE: usize = 1024;
const FANOUT_CAPACITY: usize = 256;

pub type BackendReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BackendWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Invoked when a client negotiates a new window size (columns, rows).
pub type WindowSizeCallback = Arc<dyn Fn(u16, u16) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TelnetSettings {
    pub binary: bool,
    /// When false the client's terminal echoes locally; when true the
    /// backend (or the wrapped application) echoes.
    pub echo: bool,
    pub naws: bool,
    /// Written to every client right after the negotiation, e.g.
    /// "PC1 console is now available...".
    pub greeting: Option<Vec<u8>>,
}

impl Default for TelnetSettings {
    fn default() -> Self {
        Self {
            binary: true,
            echo: false,
            naws: false,
            greeting: None,
        }
    }
}

/// Sends the initial ECHO negotiation to a freshly opened connection.
pub async fn write_client_intro<W>(writer: &mut W, echo: bool) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if echo {
        writer.write_all(&[IAC, WILL, ECHO]).await?;
    } else {
        writer.write_all(&[IAC, WONT, ECHO, IAC, DONT, ECHO]).await?;
    }
    writer.flush().await
}

fn intro(settings: &TelnetSettings) -> Vec<u8> {
    let mut bytes = Vec::new();
    if settings.echo {
        bytes.extend_from_slice(&[IAC, WILL, ECHO]);
    } else {
        bytes.extend_from_slice(&[IAC, WONT, ECHO, IAC, DONT, ECHO]);
    }
    if settings.binary {
        bytes.extend_from_slice(&[IAC, WILL, SGA, IAC, WILL, BINARY, IAC, DO, BINARY]);
    } else {
        bytes.extend_from_slice(&[
            IAC, WONT, SGA, IAC, DONT, SGA, IAC, WONT, BINARY, IAC, DONT, BINARY,
        ]);
    }
    if settings.naws {
        bytes.extend_from_slice(&[IAC, DO, NAWS]);
    }
    bytes
}

struct Shared {
    settings: TelnetSettings,
    backend_writer: Mutex<BackendWriter>,
    output: broadcast::Sender<Bytes>,
    shutdown: CancellationToken,
    /// Signaled whenever a new client takes a subscription, so the backend
    /// pump can claim the reader slot.
    client_connected: tokio::sync::Notify,
    window_size: Option<WindowSizeCallback>,
    clients: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Multi-client telnet console proxy.
///
/// A single pump task holds the backend reader, but only reads while at
/// least one client is connected: with the reader slot unclaimed, backend
/// bytes stay queued in the socket and are delivered to whichever client
/// connects first. Output is fanned out to every connected client; client
/// input is negotiated (IAC), optionally CRLF-translated, and written to
/// the shared backend writer. Backend EOF or error surfaces as EOF to all
/// clients.
pub struct TelnetServer {
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

impl TelnetServer {
    pub fn spawn(
        listener: TcpListener,
        backend_reader: BackendReader,
        backend_writer: BackendWriter,
        settings: TelnetSettings,
        window_size: Option<WindowSizeCallback>,
    ) -> Self {
        let (output, _) = broadcast::channel(FANOUT_CAPACITY);
        let shared = Arc::new(Shared {
            settings,
            backend_writer: Mutex::new(backend_writer),
            output,
            shutdown: CancellationToken::new(),
            client_connected: tokio::sync::Notify::new(),
            window_size,
            clients: std::sync::Mutex::new(Vec::new()),
        });

        let pump_task = tokio::spawn(pump_backend(shared.clone(), backend_reader));
        let accept_task = tokio::spawn(accept_loop(shared.clone(), listener));
        Self {
            shared,
            accept_task,
            pump_task,
        }
    }

    /// Closes every client socket, stops the accept and pump tasks and
    /// releases the backend halves.
    pub async fn close(self) {
        self.shared.shutdown.cancel();
        let _ = self.accept_task.await;
        let _ = self.pump_task.await;
        let clients: Vec<_> = std::mem::take(&mut *self.shared.clients.lock().unwrap());
        for client in clients {
            let _ = client.await;
        }
        let mut writer = self.shared.backend_writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

async fn pump_backend(shared: Arc<Shared>, mut reader: BackendReader) {
    let mut buf = [0u8; READ_SIZE];
    let mut stashed: Vec<u8> = Vec::new();
    loop {
        // Reader-slot gate: without a connected client the backend is not
        // read at all, so its bytes wait in the socket buffer.
        while shared.output.receiver_count() == 0 {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                _ = shared.client_connected.notified() => {}
            }
        }
        if !stashed.is_empty() {
            let _ = shared.output.send(Bytes::from(std::mem::take(&mut stashed)));
        }
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if shared.output.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        // The last client left while the read was in flight;
                        // hold the chunk for the next slot holder.
                        stashed.extend_from_slice(&buf[..n]);
                    }
                }
                Err(err) => {
                    tracing::debug!(%err, "console backend read failed");
                    break;
                }
            },
        }
    }
    // Backend went away: all clients see EOF.
    shared.shutdown.cancel();
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "new console client");
                    // Subscribe here, not in the client task, so the pump
                    // sees the reader slot claimed before it is woken.
                    let output = shared.output.subscribe();
                    let task = tokio::spawn(serve_client(shared.clone(), stream, output));
                    shared.clients.lock().unwrap().push(task);
                    shared.client_connected.notify_one();
                }
                Err(err) => {
                    tracing::warn!(%err, "console accept failed");
                    return;
                }
            },
        }
    }
}

async fn serve_client(
    shared: Arc<Shared>,
    stream: tokio::net::TcpStream,
    mut output: broadcast::Receiver<Bytes>,
) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    if write_half.write_all(&intro(&shared.settings)).await.is_err() {
        return;
    }
    if let Some(greeting) = &shared.settings.greeting {
        if write_half.write_all(greeting).await.is_err() {
            return;
        }
    }

    let mut parser = IacParser::new(shared.settings.binary);
    let mut buf = [0u8; READ_SIZE];
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                let _ = write_half.shutdown().await;
                return;
            }
            read = read_half.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let parsed = parser.feed(&buf[..n]);
                if !parsed.reply.is_empty() && write_half.write_all(&parsed.reply).await.is_err() {
                    return;
                }
                if let (Some((columns, rows)), Some(callback)) =
                    (parsed.window_size, shared.window_size.as_ref())
                {
                    callback(columns, rows);
                }
                if !parsed.data.is_empty() {
                    let mut writer = shared.backend_writer.lock().await;
                    if let Err(err) = async {
                        writer.write_all(&parsed.data).await?;
                        writer.flush().await
                    }
                    .await
                    {
                        // The backend writer is shared; losing it ends the
                        // whole proxy, not just this client.
                        tracing::debug!(%err, "console backend write failed");
                        shared.shutdown.cancel();
                        return;
                    }
                }
            }
            fanout = output.recv() => match fanout {
                Ok(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "console client too slow, dropping it");
                    let _ = write_half.shutdown().await;
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}
