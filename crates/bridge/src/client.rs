use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::BridgeError;

const READ_SIZE: usize = 1024;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Client side of the bridge hypervisor line protocol.
///
/// Requests are `COMMAND ARGS\n`. A response block is zero or more
/// `1xx yyyy\r\n` continuation lines terminated by `100-yyyy\r\n` on success
/// or a single `2xx-yyyy\r\n` on error. At most one command is in flight per
/// client; concurrent callers are serialized.
pub struct BridgeClient {
    host: String,
    port: u16,
    conn: Arc<tokio::sync::Mutex<Option<TcpStream>>>,
    version: Mutex<String>,
    process_alive: Arc<AtomicBool>,
}

impl BridgeClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            conn: Arc::new(tokio::sync::Mutex::new(None)),
            version: Mutex::new("N/A".to_string()),
            process_alive: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hypervisor version string recorded at connect time.
    pub fn version(&self) -> String {
        self.version.lock().unwrap().clone()
    }

    /// Shared flag the process supervisor keeps up to date; its value is
    /// reported in disconnect errors.
    pub fn process_alive_flag(&self) -> Arc<AtomicBool> {
        self.process_alive.clone()
    }

    fn connect_host(&self) -> &str {
        // When the hypervisor listens on a wildcard address, talk to loopback.
        match self.host.as_str() {
            "0.0.0.0" => "127.0.0.1",
            "::" => "::1",
            other => other,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Connects, retrying every 10 ms until `timeout` elapses, then records
    /// the hypervisor version for diagnostics.
    pub async fn connect(&self, timeout: Duration) -> Result<(), BridgeError> {
        let host = self.connect_host().to_string();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_error = String::new();

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(BridgeError::Connect {
                    host,
                    port: self.port,
                    reason: last_error,
                });
            }
            tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            match TcpStream::connect((host.as_str(), self.port)).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    *self.conn.lock().await = Some(stream);
                    break;
                }
                Err(err) => {
                    last_error = err.to_string();
                    continue;
                }
            }
        }
        tracing::info!(host = %self.host, port = self.port, "connected to bridge hypervisor");

        let version = match self.send("hypervisor version").await {
            Ok(lines) => lines
                .first()
                .and_then(|line| line.split('-').next())
                .unwrap_or("Unknown")
                .to_string(),
            Err(_) => "Unknown".to_string(),
        };
        *self.version.lock().unwrap() = version;
        Ok(())
    }

    /// Sends one command and returns the response lines, minus status
    /// prefixes and the terminating `OK`.
    ///
    /// Cancel-safe: the exchange runs in a detached task holding the
    /// connection lock, so a caller that drops its future mid-read leaves
    /// the task to drain the response to its terminator.
    pub async fn send(&self, command: impl Into<String>) -> Result<Vec<String>, BridgeError> {
        let command = command.into();
        let guard = self.conn.clone().lock_owned().await;

        let host = self.host.clone();
        let port = self.port;
        let alive = self.process_alive.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut guard = guard;
            let result = exchange(&mut guard, &command, &host, port, &alive).await;
            if matches!(result, Err(BridgeError::Disconnected { .. })) {
                *guard = None;
            }
            let _ = tx.send(result);
        });

        rx.await.unwrap_or_else(|_| {
            Err(BridgeError::Disconnected {
                host: self.host.clone(),
                port: self.port,
                reason: "command task dropped".to_string(),
                running: self.process_alive.load(Ordering::Relaxed),
            })
        })
    }

    /// Best-effort `hypervisor close`, then drops the connection (the
    /// hypervisor keeps running).
    pub async fn close(&self) {
        let _ = self.send("hypervisor close").await;
        if let Some(stream) = self.conn.lock().await.take() {
            drop(stream);
        }
    }

    /// Best-effort `hypervisor stop`; the hypervisor will exit.
    pub async fn stop(&self) {
        if let Err(err) = self.send("hypervisor stop").await {
            tracing::debug!(host = %self.host, port = self.port, %err, "hypervisor stop failed");
        }
        self.conn.lock().await.take();
    }

    /// Clears all hypervisor state, leaving an empty configuration.
    pub async fn reset(&self) -> Result<(), BridgeError> {
        self.send("hypervisor reset").await.map(|_| ())
    }
}

async fn exchange(
    conn: &mut Option<TcpStream>,
    command: &str,
    host: &str,
    port: u16,
    alive: &AtomicBool,
) -> Result<Vec<String>, BridgeError> {
    let running = || alive.load(Ordering::Relaxed);
    let stream = conn.as_mut().ok_or_else(|| BridgeError::NotConnected {
        host: host.to_string(),
        port,
    })?;

    let line = format!("{}\n", command.trim());
    tracing::debug!(command = command.trim(), "sending bridge command");
    stream
        .write_all(line.as_bytes())
        .await
        .map_err(|err| BridgeError::Disconnected {
            host: host.to_string(),
            port,
            reason: err.to_string(),
            running: running(),
        })?;

    let mut data: Vec<String> = Vec::new();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_SIZE];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|err| BridgeError::Disconnected {
                host: host.to_string(),
                port,
                reason: err.to_string(),
                running: running(),
            })?;
        if n == 0 {
            return Err(BridgeError::Disconnected {
                host: host.to_string(),
                port,
                reason: "no data returned".to_string(),
                running: running(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);

        // The response is complete only once the buffer ends in '\n' and its
        // last line is a terminator; anything short of that is more chunks.
        if buf.last() != Some(&b'\n') {
            continue;
        }

        for line in String::from_utf8_lossy(&buf).split("\r\n") {
            if !line.is_empty() {
                data.push(line.to_string());
            }
        }
        buf.clear();

        let last = match data.last() {
            Some(last) => last.clone(),
            None => continue,
        };
        if is_error_line(&last) {
            return Err(BridgeError::Hypervisor(last[4..].to_string()));
        }
        if let Some(payload) = last.strip_prefix("100-") {
            if payload == "OK" {
                data.pop();
            } else {
                *data.last_mut().unwrap() = payload.to_string();
            }
            break;
        }
    }

    // Strip "1xx " prefixes from continuation lines.
    for line in data.iter_mut() {
        if is_success_line(line) {
            *line = line[4..].to_string();
        }
    }
    tracing::debug!(?data, "bridge command returned");
    Ok(data)
}

fn is_error_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 4
        && bytes[0] == b'2'
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit()
        && bytes[3] == b'-'
}

fn is_success_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 4
        && bytes[0] == b'1'
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit()
        && bytes[3] == b' '
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal scripted hypervisor: answers every received command line with
    /// the canned response produced by `respond`.
    async fn fake_hypervisor<F>(respond: F) -> u16
    where
        F: Fn(&str) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let response = respond(&line);
                if writer.write_all(&response).await.is_err() {
                    break;
                }
            }
        });
        port
    }

    async fn connected_client(port: u16) -> BridgeClient {
        let client = BridgeClient::new("127.0.0.1", port);
        client.connect(Duration::from_secs(5)).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_simple_ok_response() {
        let port = fake_hypervisor(|_| b"100-OK\r\n".to_vec()).await;
        let client = connected_client(port).await;
        assert_eq!(client.send("bridge create b0").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_multi_line_response_prefixes_stripped() {
        let port = fake_hypervisor(|cmd| {
            if cmd == "hypervisor version" {
                b"100-0.9.18\r\n".to_vec()
            } else {
                b"101 first\r\n102 second\r\n100-final\r\n".to_vec()
            }
        })
        .await;
        let client = connected_client(port).await;
        assert_eq!(client.version(), "0.9.18");
        assert_eq!(
            client.send("bridge list").await.unwrap(),
            vec!["first", "second", "final"],
        );
    }

    #[tokio::test]
    async fn test_error_line_raised_with_prefix_stripped() {
        let port = fake_hypervisor(|cmd| {
            if cmd == "hypervisor version" {
                b"100-0.9.18\r\n".to_vec()
            } else {
                b"209-unable to create bridge 'b0'\r\n".to_vec()
            }
        })
        .await;
        let client = connected_client(port).await;
        let err = client.send("bridge create b0").await.unwrap_err();
        match err {
            BridgeError::Hypervisor(message) => {
                assert_eq!(message, "unable to create bridge 'b0'")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_framing_tolerates_arbitrary_chunking() {
        // Respond byte by byte with pauses, crossing both line and chunk
        // boundaries.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                for byte in b"101 part one\r\n100-part two\r\n" {
                    writer.write_all(&[*byte]).await.unwrap();
                    writer.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_micros(100)).await;
                }
            }
        });

        let client = connected_client(port).await;
        assert_eq!(
            client.send("bridge list").await.unwrap(),
            vec!["part one", "part two"],
        );
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_cross_talk() {
        let port = fake_hypervisor(|cmd| {
            format!("100-echo {}\r\n", cmd).into_bytes()
        })
        .await;
        let client = Arc::new(connected_client(port).await);

        let mut handles = Vec::new();
        for i in 0..16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let response = client.send(format!("cmd {i}")).await.unwrap();
                assert_eq!(response, vec![format!("echo cmd {i}")]);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancelled_send_does_not_desynchronize() {
        let port = fake_hypervisor(|cmd| {
            if cmd == "hypervisor version" {
                b"100-0.9.18\r\n".to_vec()
            } else {
                format!("100-echo {}\r\n", cmd).into_bytes()
            }
        })
        .await;
        let client = Arc::new(connected_client(port).await);

        // Cancel a send before its response can possibly be read.
        let cancelled = client.clone();
        let send = tokio::spawn(async move { cancelled.send("cmd first").await });
        send.abort();
        let _ = send.await;

        // The next command still receives its own response block.
        assert_eq!(
            client.send("cmd second").await.unwrap(),
            vec!["echo cmd second"],
        );
    }

    #[tokio::test]
    async fn test_eof_before_terminator_is_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            // Answer the version probe, then hang up mid-block.
            if let Ok(Some(_)) = lines.next_line().await {
                writer.write_all(b"100-0.9.18\r\n").await.unwrap();
            }
            if let Ok(Some(_)) = lines.next_line().await {
                writer.write_all(b"101 partial\r\n").await.unwrap();
            }
        });

        let client = connected_client(port).await;
        let err = client.send("bridge list").await.unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected { running: false, .. }));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Nothing listens on this port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = BridgeClient::new("127.0.0.1", port);
        let err = client.connect(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connect { .. }));
    }
}
