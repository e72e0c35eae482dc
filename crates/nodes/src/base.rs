use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bridge::{BridgeError, BridgeProcess};
use console::{write_client_intro, TelnetServer, TelnetSettings};
use nio::{FilterMap, Nio};
use ports::PortPool;
use project::Project;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{ConsoleType, NodeError, NodeOptions, NodeStatus};

const WRAP_CONSOLE_RETRIES: u32 = 60;
const WRAP_CONSOLE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// State and behavior shared by every backend adapter: the status machine,
/// console/aux port ownership, the working directory, the wrap-console
/// proxy and the per-node bridge hypervisor.
///
/// Adapters embed one `BaseNode` and drive it; a node's fields are only
/// mutated through its owning manager's lock, which linearizes bridge
/// command sequences per node.
pub struct BaseNode {
    name: String,
    id: Uuid,
    backend: &'static str,
    project: Arc<Project>,
    pool: Arc<PortPool>,
    status: NodeStatus,
    command_line: String,
    console_type: ConsoleType,
    console: Option<u16>,
    aux: Option<u16>,
    wrap_console: bool,
    internal_console_port: Option<u16>,
    working_dir: PathBuf,
    temp_dir: Option<tempfile::TempDir>,
    wrap_server: Option<TelnetServer>,
    ubridge: Option<BridgeProcess>,
    ubridge_path: String,
    ubridge_require_privileged: bool,
    closed: bool,
}

impl BaseNode {
    pub fn new(
        name: impl Into<String>,
        id: Uuid,
        project: Arc<Project>,
        pool: Arc<PortPool>,
        backend: &'static str,
        ubridge_path: impl Into<String>,
        options: NodeOptions,
    ) -> Result<Self, NodeError> {
        let name = name.into();
        let working_dir = project.node_working_directory(backend, id)?;

        // Track reservations so a failure halfway through leaks nothing.
        let mut reserved: Vec<u16> = Vec::new();
        let result = Self::reserve_ports(&pool, project.id(), &options, &mut reserved);
        let (console, aux, internal_console_port) = match result {
            Ok(ports) => ports,
            Err(err) => {
                for port in reserved {
                    let _ = pool.release_tcp(port, project.id());
                }
                return Err(err);
            }
        };

        tracing::debug!(
            backend,
            name,
            node_id = %id,
            console,
            "node initialized"
        );
        Ok(Self {
            name,
            id,
            backend,
            project,
            pool,
            status: NodeStatus::Stopped,
            command_line: String::new(),
            console_type: options.console_type,
            console,
            aux,
            wrap_console: options.wrap_console,
            internal_console_port,
            working_dir,
            temp_dir: None,
            wrap_server: None,
            ubridge: None,
            ubridge_path: ubridge_path.into(),
            ubridge_require_privileged: false,
            closed: false,
        })
    }

    fn reserve_ports(
        pool: &PortPool,
        project: Uuid,
        options: &NodeOptions,
        reserved: &mut Vec<u16>,
    ) -> Result<(Option<u16>, Option<u16>, Option<u16>), NodeError> {
        let track = |port: u16, reserved: &mut Vec<u16>| {
            reserved.push(port);
            port
        };

        let mut console = None;
        if let Some(port) = options.console {
            match options.console_type {
                ConsoleType::None => {}
                ConsoleType::Vnc => {
                    if port < 5900 {
                        return Err(NodeError::VncConsolePort(port));
                    }
                    console =
                        Some(track(pool.reserve_tcp_in(port, project, pool.vnc_range())?, reserved));
                }
                _ => console = Some(track(pool.reserve_tcp(port, project)?, reserved)),
            }
        }

        // Reserve the aux port before drawing a random console port.
        let mut aux = None;
        if let Some(port) = options.aux {
            aux = Some(track(pool.reserve_tcp(port, project)?, reserved));
        }

        if console.is_none() {
            match options.console_type {
                ConsoleType::None => {}
                ConsoleType::Vnc => {
                    console =
                        Some(track(pool.get_free_tcp_in(project, pool.vnc_range())?, reserved))
                }
                _ => console = Some(track(pool.get_free_tcp(project)?, reserved)),
            }
        }

        let mut internal = None;
        if options.wrap_console {
            internal = Some(track(pool.get_free_tcp(project)?, reserved));
        }

        if aux.is_none() && options.allocate_aux {
            aux = Some(track(pool.get_free_tcp(project)?, reserved));
        }

        Ok((console, aux, internal))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        tracing::info!(backend = self.backend, old = %self.name, new = %name, "node renamed");
        self.name = name;
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Updates the status and notifies the controller.
    pub fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
        self.emit_updated();
    }

    pub fn emit_updated(&self) {
        self.project.node_updated(self.as_json());
    }

    /// Wire form shared by all backends; adapters may add fields of their own.
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "node_id": self.id,
            "name": self.name,
            "status": self.status,
            "project_id": self.project.id(),
            "console": self.console,
            "console_type": self.console_type,
            "aux": self.aux,
            "node_directory": self.working_dir,
            "command_line": self.command_line,
        })
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn set_command_line(&mut self, command_line: impl Into<String>) {
        self.command_line = command_line.into();
    }

    pub fn console(&self) -> Option<u16> {
        self.console
    }

    pub fn aux(&self) -> Option<u16> {
        self.aux
    }

    pub fn console_type(&self) -> ConsoleType {
        self.console_type
    }

    pub fn internal_console_port(&self) -> Option<u16> {
        self.internal_console_port
    }

    /// Lazily created scratch directory, removed when the node closes.
    pub fn temporary_directory(&mut self) -> Result<&Path, NodeError> {
        if self.temp_dir.is_none() {
            let dir = tempfile::tempdir()
                .map_err(|err| NodeError::Backend(format!("cannot create temporary directory: {err}")))?;
            self.temp_dir = Some(dir);
        }
        Ok(self.temp_dir.as_ref().expect("just created").path())
    }

    /// Changes the console port: atomic release-then-reserve; a no-op when
    /// unchanged or when the node has no console.
    pub fn set_console(&mut self, console: Option<u16>) -> Result<(), NodeError> {
        if console == self.console || self.console_type == ConsoleType::None {
            return Ok(());
        }
        if self.console_type == ConsoleType::Vnc {
            if let Some(port) = console {
                if port < 5900 {
                    return Err(NodeError::VncConsolePort(port));
                }
            }
        }

        if let Some(old) = self.console.take() {
            self.release_tcp(old);
        }
        if let Some(port) = console {
            let reserved = if self.console_type == ConsoleType::Vnc {
                self.pool
                    .reserve_tcp_in(port, self.project.id(), self.pool.vnc_range())?
            } else {
                self.pool.reserve_tcp(port, self.project.id())?
            };
            self.console = Some(reserved);
            tracing::info!(node = %self.name, port, "console port set");
        }
        Ok(())
    }

    pub fn set_aux(&mut self, aux: Option<u16>) -> Result<(), NodeError> {
        if aux == self.aux {
            return Ok(());
        }
        if let Some(old) = self.aux.take() {
            self.release_tcp(old);
        }
        if let Some(port) = aux {
            self.aux = Some(self.pool.reserve_tcp(port, self.project.id())?);
            tracing::info!(node = %self.name, port, "aux port set");
        }
        Ok(())
    }

    /// Changing the console type re-allocates the console port from the
    /// matching range.
    pub fn set_console_type(&mut self, console_type: ConsoleType) -> Result<(), NodeError> {
        if console_type != self.console_type {
            if let Some(old) = self.console.take() {
                self.release_tcp(old);
            }
            self.console = match console_type {
                ConsoleType::None => None,
                ConsoleType::Vnc => Some(
                    self.pool
                        .get_free_tcp_in(self.project.id(), self.pool.vnc_range())?,
                ),
                _ => Some(self.pool.get_free_tcp(self.project.id())?),
            };
        }
        self.console_type = console_type;
        tracing::info!(node = %self.name, %console_type, console = self.console, "console type set");
        Ok(())
    }

    fn release_tcp(&self, port: u16) {
        if let Err(err) = self.pool.release_tcp(port, self.project.id()) {
            tracing::warn!(node = %self.name, port, %err, "TCP port release failed");
        }
    }

    fn console_connect_host(&self) -> String {
        let host = self.pool.console_host();
        if host.is_unspecified() {
            match host {
                IpAddr::V4(_) => "127.0.0.1".to_string(),
                IpAddr::V6(_) => "::1".to_string(),
            }
        } else {
            host.to_string()
        }
    }

    /// Dials the backend's internal console and serves it on the public
    /// console port through a multi-client telnet proxy.
    pub async fn start_wrap_console(&mut self) -> Result<(), NodeError> {
        if !self.wrap_console || self.console_type != ConsoleType::Telnet {
            return Ok(());
        }
        let internal = self.internal_console_port.ok_or_else(|| {
            NodeError::Precondition("wrap console has no internal port reserved".to_string())
        })?;
        let console = self.console.ok_or_else(|| {
            NodeError::Precondition("wrap console requires a console port".to_string())
        })?;

        let mut stream = None;
        for attempt in 0..WRAP_CONSOLE_RETRIES {
            match TcpStream::connect(("127.0.0.1", internal)).await {
                Ok(connected) => {
                    stream = Some(connected);
                    break;
                }
                Err(err) if attempt + 1 == WRAP_CONSOLE_RETRIES => {
                    return Err(NodeError::Timeout(
                        WRAP_CONSOLE_RETRY_INTERVAL * WRAP_CONSOLE_RETRIES,
                        format!("connecting to console on 127.0.0.1:{internal}: {err}"),
                    ));
                }
                Err(_) => tokio::time::sleep(WRAP_CONSOLE_RETRY_INTERVAL).await,
            }
        }
        let mut stream = stream.expect("loop either sets the stream or errors");

        write_client_intro(&mut stream, true).await?;
        let (reader, writer) = stream.into_split();
        let listener = TcpListener::bind((self.pool.console_host(), console)).await?;
        let greeting = format!(
            "{} console is now available... Press RETURN to get started.\r\n",
            self.name
        );
        self.wrap_server = Some(TelnetServer::spawn(
            listener,
            Box::new(reader),
            Box::new(writer),
            TelnetSettings {
                binary: true,
                echo: true,
                naws: false,
                greeting: Some(greeting.into_bytes()),
            },
            None,
        ));
        tracing::debug!(node = %self.name, console, internal, "wrap console started");
        Ok(())
    }

    pub async fn stop_wrap_console(&mut self) {
        if let Some(server) = self.wrap_server.take() {
            server.close().await;
            tracing::debug!(node = %self.name, "wrap console stopped");
        }
    }

    pub async fn reset_wrap_console(&mut self) -> Result<(), NodeError> {
        self.stop_wrap_console().await;
        self.start_wrap_console().await
    }

    /// Checks preconditions and returns the telnet endpoint a console
    /// WebSocket should bridge to, so the caller can run the bridge without
    /// holding this node's lock.
    pub fn websocket_console_target(&self) -> Result<(String, u16), NodeError> {
        if self.status != NodeStatus::Started {
            return Err(NodeError::Precondition(format!(
                "node {} is not started",
                self.name
            )));
        }
        if self.console_type != ConsoleType::Telnet {
            return Err(NodeError::Precondition(format!(
                "node {} console type is not telnet",
                self.name
            )));
        }
        let console = self.console.ok_or_else(|| {
            NodeError::Precondition(format!("node {} has no console port", self.name))
        })?;
        Ok((self.console_connect_host(), console))
    }

    pub async fn start_websocket_console(
        &self,
        ws: axum::extract::ws::WebSocket,
        token: CancellationToken,
    ) -> Result<(), NodeError> {
        let (host, port) = self.websocket_console_target()?;
        console::websocket_to_telnet(ws, &host, port, token).await?;
        Ok(())
    }

    pub fn ubridge_is_running(&self) -> bool {
        self.ubridge
            .as_ref()
            .map(BridgeProcess::is_running)
            .unwrap_or(false)
    }

    /// Starts the bridge hypervisor when it is not already running.
    /// Idempotent; remembers `require_privileged` for restarts.
    pub async fn start_ubridge(&mut self, require_privileged: bool) -> Result<(), NodeError> {
        if self.ubridge_is_running() {
            return Ok(());
        }
        let path = BridgeProcess::locate(&self.ubridge_path)?;
        if require_privileged && !has_privileged_access(&path) {
            return Err(NodeError::Precondition(
                "bridge hypervisor requires root access or the capability to interact with network adapters"
                    .to_string(),
            ));
        }

        let mut process = BridgeProcess::new(
            path,
            &self.working_dir,
            self.pool.console_host().to_string(),
            None,
        )?;
        tracing::info!(
            node = %self.name,
            host = process.host(),
            port = process.port(),
            "starting bridge hypervisor"
        );

        let project = self.project.clone();
        let log_path = self.working_dir.join("bridge.log");
        process
            .start(Box::new(move |code| {
                if code != Some(0) {
                    let tail = std::fs::read_to_string(&log_path).unwrap_or_default();
                    project.log_error(format!(
                        "bridge hypervisor process has stopped, return code: {}\n{tail}",
                        code.map_or_else(|| "killed".to_string(), |c| c.to_string()),
                    ));
                }
            }))
            .await?;

        self.ubridge = Some(process);
        self.ubridge_require_privileged = require_privileged;
        Ok(())
    }

    pub async fn stop_ubridge(&mut self) {
        if let Some(mut process) = self.ubridge.take() {
            if process.is_running() {
                tracing::info!(node = %self.name, "stopping bridge hypervisor");
                if let Err(err) = process.stop().await {
                    tracing::warn!(node = %self.name, %err, "bridge hypervisor stop failed");
                }
            }
        }
    }

    /// Sends one command to the node's bridge hypervisor, lazily starting it
    /// and retrying once after a restart when the process died underneath us.
    pub async fn ubridge_send(
        &mut self,
        command: impl Into<String>,
    ) -> Result<Vec<String>, NodeError> {
        let command = command.into();
        self.start_ubridge(self.ubridge_require_privileged).await?;

        let client = self
            .ubridge
            .as_ref()
            .expect("start_ubridge just ensured the process")
            .client();
        match client.send(command.clone()).await {
            Ok(lines) => Ok(lines),
            Err(err) => {
                if !self.ubridge_is_running() {
                    tracing::warn!(node = %self.name, %err, "bridge hypervisor died, restarting once");
                    self.ubridge = None;
                    self.start_ubridge(self.ubridge_require_privileged).await?;
                    let client = self.ubridge.as_ref().expect("just restarted").client();
                    return client
                        .send(command.clone())
                        .await
                        .map_err(|source| NodeError::BridgeCommand { command, source });
                }
                Err(NodeError::BridgeCommand {
                    command,
                    source: err,
                })
            }
        }
    }

    /// Hands this node an externally managed hypervisor (tests, embedding).
    pub fn attach_ubridge(&mut self, process: BridgeProcess) {
        self.ubridge = Some(process);
    }

    /// Wires a point-to-point UDP bridge: create, attach both endpoints,
    /// start capture on the destination when requested, start, apply the
    /// destination's filters.
    pub async fn add_ubridge_udp_connection(
        &mut self,
        name: &str,
        source: &Nio,
        destination: &Nio,
    ) -> Result<(), NodeError> {
        for command in udp_connection_commands(name, source, destination)? {
            self.ubridge_send(command).await?;
        }
        self.ubridge_apply_filters(name, destination.filters().clone())
            .await
    }

    /// Re-applies the destination's filters after a link update.
    pub async fn update_ubridge_udp_connection(
        &mut self,
        name: &str,
        _source: &Nio,
        destination: &Nio,
    ) -> Result<(), NodeError> {
        self.ubridge_apply_filters(name, destination.filters().clone())
            .await
    }

    /// Idempotent: a bridge that never existed (hypervisor not running) is
    /// already deleted.
    pub async fn ubridge_delete_bridge(&mut self, name: &str) -> Result<(), NodeError> {
        if self.ubridge_is_running() {
            self.ubridge_send(format!("bridge delete {name}")).await?;
        }
        Ok(())
    }

    /// Resets then re-adds the packet filters in map order. A BPF program
    /// the hypervisor cannot compile is reported as a warning event and
    /// skipped; remaining filters still apply.
    pub async fn ubridge_apply_filters(
        &mut self,
        name: &str,
        filters: FilterMap,
    ) -> Result<(), NodeError> {
        self.ubridge_send(format!("bridge reset_packet_filters {name}"))
            .await?;
        for filter in nio::build_filter_commands(&filters) {
            let result = self
                .ubridge_send(format!("bridge add_packet_filter {name} {filter}"))
                .await;
            match result {
                Ok(_) => {}
                Err(NodeError::BridgeCommand {
                    source: BridgeError::Hypervisor(message),
                    ..
                }) if is_bpf_syntax_error(&message) => {
                    let message = format!(
                        "Warning: ignoring BPF packet filter '{filter}' due to syntax error"
                    );
                    self.project.log_warning(message);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Attaches a host Ethernet interface to a bridge. Linux uses a raw
    /// socket unless host traffic must be blocked; elsewhere the pcap
    /// attachment is used and the host's source MAC is filtered out when
    /// known.
    pub async fn add_ubridge_ethernet_connection(
        &mut self,
        name: &str,
        interface: &str,
        block_host_traffic: bool,
        source_mac: Option<&str>,
    ) -> Result<(), NodeError> {
        if cfg!(target_os = "linux") && !block_host_traffic {
            self.ubridge_send(format!("bridge add_nio_linux_raw {name} \"{interface}\""))
                .await?;
            return Ok(());
        }

        self.ubridge_send(format!("bridge add_nio_ethernet {name} \"{interface}\""))
            .await?;
        match source_mac {
            Some(mac) => {
                self.ubridge_send(format!("bridge set_pcap_filter {name} \"not ether src {mac}\""))
                    .await?;
                tracing::info!(interface, mac, "pcap filter applied for host source MAC");
            }
            None if block_host_traffic => {
                tracing::warn!(interface, "could not block host traffic: no MAC address known");
            }
            None => {}
        }
        Ok(())
    }

    /// A mirrored pair of UDP NIOs on two freshly reserved local ports; used
    /// to plumb a backend into its own bridge.
    pub fn create_local_udp_tunnel(&self) -> Result<(Nio, Nio), NodeError> {
        let lport = self.pool.get_free_udp(self.project.id())?;
        let rport = self.pool.get_free_udp(self.project.id())?;
        tracing::info!(
            node = %self.name,
            lport,
            rport,
            "local UDP tunnel created"
        );
        Ok((
            Nio::udp(lport, "127.0.0.1", rport),
            Nio::udp(rport, "127.0.0.1", lport),
        ))
    }

    pub fn release_udp_port(&self, port: u16) {
        if let Err(err) = self.pool.release_udp(port, self.project.id()) {
            tracing::warn!(node = %self.name, port, %err, "UDP port release failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Releases the console, internal-console and aux reservations exactly
    /// once and tears down the wrap proxy. Returns `false` (and does no I/O)
    /// on every call after the first.
    pub async fn close(&mut self) -> Result<bool, NodeError> {
        if self.closed {
            return Ok(false);
        }
        tracing::info!(backend = self.backend, node = %self.name, node_id = %self.id, "node is closing");

        self.stop_wrap_console().await;
        if let Some(port) = self.console.take() {
            self.release_tcp(port);
        }
        if let Some(port) = self.internal_console_port.take() {
            self.release_tcp(port);
        }
        if let Some(port) = self.aux.take() {
            self.release_tcp(port);
        }
        self.temp_dir = None;
        self.closed = true;
        Ok(true)
    }
}

/// Matches the hypervisor's "Cannot compile filter '…': syntax error"
/// response and nothing broader; other errors must propagate.
fn is_bpf_syntax_error(message: &str) -> bool {
    message.starts_with("Cannot compile filter '") && message.ends_with("': syntax error")
}

/// The bridge command sequence that realizes one UDP point-to-point link.
pub fn udp_connection_commands(
    name: &str,
    source: &Nio,
    destination: &Nio,
) -> Result<Vec<String>, NodeError> {
    let (src_lport, src_rhost, src_rport) = source
        .as_udp()
        .ok_or_else(|| NodeError::Precondition("source NIO is not UDP".to_string()))?;
    let (dst_lport, dst_rhost, dst_rport) = destination
        .as_udp()
        .ok_or_else(|| NodeError::Precondition("destination NIO is not UDP".to_string()))?;

    let mut commands = vec![
        format!("bridge create {name}"),
        format!("bridge add_nio_udp {name} {src_lport} {src_rhost} {src_rport}"),
        format!("bridge add_nio_udp {name} {dst_lport} {dst_rhost} {dst_rport}"),
    ];
    if destination.capturing() {
        if let Some(pcap_file) = destination.pcap_file() {
            commands.push(format!(
                "bridge start_capture {name} \"{}\" {}",
                pcap_file.display(),
                destination.pcap_link_type(),
            ));
        }
    }
    commands.push(format!("bridge start {name}"));
    Ok(commands)
}

#[cfg(unix)]
fn has_privileged_access(path: &Path) -> bool {
    if nix::unistd::geteuid().is_root() {
        return true;
    }
    // A setuid bridge executable can open raw sockets without root.
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.permissions().mode() & 0o4000 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn has_privileged_access(_path: &Path) -> bool {
    true
}
