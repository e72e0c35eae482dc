use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::{BridgeClient, BridgeError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Minimum supported hypervisor version for this platform.
pub fn minimum_version() -> &'static str {
    if cfg!(target_os = "linux") {
        "0.9.14"
    } else {
        "0.9.12"
    }
}

/// Invoked once with the exit code when the hypervisor process terminates.
pub type TerminationCallback = Box<dyn FnOnce(Option<i32>) + Send + 'static>;

/// Owns one bridge hypervisor subprocess: spawns it, gates on its version,
/// connects the protocol client, and tears it down.
pub struct BridgeProcess {
    path: PathBuf,
    host: String,
    working_dir: PathBuf,
    log_path: PathBuf,
    client: BridgeClient,
    alive: Arc<AtomicBool>,
    version: Option<String>,
    // Monitor-task plumbing: exit code observation and explicit kill.
    exit_rx: Option<watch::Receiver<Option<Option<i32>>>>,
    kill_tx: Option<mpsc::Sender<()>>,
}

impl BridgeProcess {
    /// `port = None` lets the OS pick: a socket is bound on `host` and
    /// immediately released, and the discovered port is handed to the
    /// hypervisor.
    pub fn new(
        path: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        host: impl Into<String>,
        port: Option<u16>,
    ) -> Result<Self, BridgeError> {
        let host = host.into();
        let working_dir = working_dir.into();
        let port = match port {
            Some(port) => port,
            None => free_tcp_port(&host)?,
        };

        let client = BridgeClient::new(host.clone(), port);
        let alive = client.process_alive_flag();
        Ok(Self {
            path: path.into(),
            log_path: working_dir.join("bridge.log"),
            working_dir,
            host,
            client,
            alive,
            version: None,
            exit_rx: None,
            kill_tx: None,
        })
    }

    /// Adopts an already-running hypervisor endpoint instead of spawning
    /// one; the caller owns the process lifetime.
    pub fn attach(client: BridgeClient, working_dir: impl Into<PathBuf>) -> Self {
        let alive = client.process_alive_flag();
        alive.store(true, Ordering::Relaxed);
        let working_dir = working_dir.into();
        Self {
            path: PathBuf::new(),
            host: client.host().to_string(),
            log_path: working_dir.join("bridge.log"),
            working_dir,
            client,
            alive,
            version: None,
            exit_rx: None,
            kill_tx: None,
        }
    }

    /// Resolves the hypervisor executable on the `$PATH`.
    pub fn locate(executable: &str) -> Result<PathBuf, BridgeError> {
        which::which(executable).map_err(|err| BridgeError::Spawn(format!(
            "bridge hypervisor executable '{executable}' not found: {err}"
        )))
    }

    pub fn client(&self) -> &BridgeClient {
        &self.client
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.client.port()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Version-checks, spawns and connects the hypervisor. `on_exit` fires
    /// from the monitor task when the process terminates for any reason.
    pub async fn start(&mut self, on_exit: TerminationCallback) -> Result<(), BridgeError> {
        self.check_version().await?;
        self.spawn(on_exit).await?;
        self.client.connect(CONNECT_TIMEOUT).await?;
        Ok(())
    }

    async fn check_version(&mut self) -> Result<(), BridgeError> {
        let output = tokio::process::Command::new(&self.path)
            .arg("-v")
            .current_dir(&self.working_dir)
            .output()
            .await
            .map_err(|err| BridgeError::Version {
                path: self.path.display().to_string(),
                reason: err.to_string(),
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let version = stdout
            .lines()
            .find_map(|line| line.strip_prefix("ubridge version "))
            .map(|rest| {
                rest.chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '.')
                    .collect::<String>()
            })
            .ok_or_else(|| BridgeError::Version {
                path: self.path.display().to_string(),
                reason: format!("unrecognized -v output: {}", stdout.trim()),
            })?;

        let required = minimum_version();
        if parse_version(&version) < parse_version(required) {
            return Err(BridgeError::VersionTooOld {
                found: version,
                required: required.to_string(),
            });
        }
        self.version = Some(version);
        Ok(())
    }

    async fn spawn(&mut self, on_exit: TerminationCallback) -> Result<(), BridgeError> {
        let log = std::fs::File::create(&self.log_path).map_err(|err| {
            BridgeError::Spawn(format!(
                "cannot open log file {}: {err}",
                self.log_path.display()
            ))
        })?;
        let log_err = log
            .try_clone()
            .map_err(|err| BridgeError::Spawn(err.to_string()))?;

        let mut command = tokio::process::Command::new(&self.path);
        command
            .arg("-H")
            .arg(format!("{}:{}", self.host, self.client.port()))
            .current_dir(&self.working_dir)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if tracing::enabled!(tracing::Level::DEBUG) {
            command.args(["-d", "2"]);
        }
        #[cfg(windows)]
        if let Some(path) = npcap_path() {
            let current = std::env::var("PATH").unwrap_or_default();
            command.env("PATH", format!("{path};{current}"));
        }

        let mut child = command
            .spawn()
            .map_err(|err| BridgeError::Spawn(err.to_string()))?;
        tracing::info!(
            path = %self.path.display(),
            host = %self.host,
            port = self.client.port(),
            pid = child.id(),
            "bridge hypervisor started"
        );

        self.alive.store(true, Ordering::Relaxed);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        self.exit_rx = Some(exit_rx);
        self.kill_tx = Some(kill_tx);

        let alive = self.alive.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.recv() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            alive.store(false, Ordering::Relaxed);
            let code = status.ok().and_then(|s| s.code());
            tracing::info!(?code, "bridge hypervisor process has stopped");
            on_exit(code);
            let _ = exit_tx.send(Some(code));
        });
        Ok(())
    }

    /// Asks the hypervisor to stop, waits up to 3 s for process exit, kills
    /// it if still alive, and removes the log file.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        if self.is_running() {
            self.client.stop().await;

            if let Some(mut exit_rx) = self.exit_rx.take() {
                let timed_out = {
                    tokio::time::timeout(
                        STOP_TIMEOUT,
                        exit_rx.wait_for(|status| status.is_some()),
                    )
                    .await
                    .is_err()
                };
                if timed_out {
                    tracing::warn!("bridge hypervisor still running, killing it");
                    if let Some(kill_tx) = self.kill_tx.take() {
                        let _ = kill_tx.send(()).await;
                    }
                    let _ = exit_rx.wait_for(|status| status.is_some()).await;
                }
            }
        }
        self.exit_rx = None;
        self.kill_tx = None;
        self.alive.store(false, Ordering::Relaxed);

        if self.log_path.exists() {
            if let Err(err) = tokio::fs::remove_file(&self.log_path).await {
                tracing::warn!(%err, "could not delete bridge hypervisor log file");
            }
        }
        Ok(())
    }

    /// Tail of the hypervisor log, for error reports after a crash.
    pub async fn read_log(&self) -> String {
        match tokio::fs::read(&self.log_path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        }
    }
}

fn free_tcp_port(host: &str) -> Result<u16, BridgeError> {
    let listener = std::net::TcpListener::bind((host, 0)).map_err(|err| BridgeError::Connect {
        host: host.to_string(),
        port: 0,
        reason: format!("could not find a free port: {err}"),
    })?;
    let port = listener
        .local_addr()
        .map_err(|err| BridgeError::Connect {
            host: host.to_string(),
            port: 0,
            reason: err.to_string(),
        })?
        .port();
    Ok(port)
}

/// Dotted version string to comparable components; non-numeric tails sort
/// as zero.
pub fn parse_version(version: &str) -> Vec<u32> {
    version
        .split('.')
        .map(|part| {
            part.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect()
}

#[cfg(windows)]
fn npcap_path() -> Option<String> {
    let system_root = std::env::var("SystemRoot").ok()?;
    let npcap = std::path::Path::new(&system_root)
        .join("System32")
        .join("Npcap");
    npcap.is_dir().then(|| npcap.display().to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_version_ordering() {
        assert!(parse_version("0.9.14") > parse_version("0.9.12"));
        assert!(parse_version("0.9.7") < parse_version("0.9.12"));
        assert!(parse_version("1.0") > parse_version("0.9.18"));
        assert_eq!(parse_version("0.9.14"), vec![0, 9, 14]);
    }

    #[test]
    fn test_free_port_discovery() {
        let port = free_tcp_port("127.0.0.1").unwrap();
        assert!(port > 0);
        // The probe socket is released: binding again succeeds.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn test_version_gate_rejects_old_hypervisor() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ubridge");
        std::fs::write(&fake, "#!/bin/sh\necho 'ubridge version 0.9.1'\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut process =
            BridgeProcess::new(&fake, dir.path(), "127.0.0.1", Some(4242)).unwrap();
        let err = process.check_version().await.unwrap_err();
        assert!(matches!(err, BridgeError::VersionTooOld { .. }));
    }

    #[tokio::test]
    async fn test_version_parse_from_banner() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ubridge");
        std::fs::write(
            &fake,
            "#!/bin/sh\necho 'ubridge version 0.9.18'\necho 'Copyright (c) 2017'\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut process =
            BridgeProcess::new(&fake, dir.path(), "127.0.0.1", Some(4242)).unwrap();
        process.check_version().await.unwrap();
        assert_eq!(process.version(), Some("0.9.18"));
    }
}
