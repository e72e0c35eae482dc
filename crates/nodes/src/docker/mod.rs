mod client;

pub use client::{AttachStream, DockerClient, DockerError, API_VERSION};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use console::{TelnetServer, TelnetSettings, WindowSizeCallback};
use futures::{SinkExt, StreamExt};
use nio::Nio;
use ports::PortPool;
use project::{Project, ProjectVariable};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    BaseNode, ConsoleType, NodeBackend, NodeError, NodeOptions, NodeRuntime, NodeStatus,
    Registry, SupervisedChild,
};

pub const BACKEND: &str = "docker";

const STOP_TIMEOUT_SECONDS: u32 = 5;
const X11_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerNodeOptions {
    pub console: Option<u16>,
    pub console_type: Option<ConsoleType>,
    pub aux: Option<u16>,
    pub adapters: Option<usize>,
    pub start_command: Option<String>,
    /// Newline-separated `NAME=value` pairs.
    pub environment: Option<String>,
    pub extra_hosts: Option<String>,
    pub extra_volumes: Vec<String>,
    pub console_resolution: Option<String>,
    pub console_http_port: Option<u16>,
    pub console_http_path: Option<String>,
}

/// A node backed by a container. The engine runs the process; this adapter
/// owns the network namespace wiring, the console plumbing and the volume
/// permission hygiene.
pub struct DockerNode {
    base: BaseNode,
    client: Arc<DockerClient>,
    resources_path: PathBuf,
    image: String,
    adapters: usize,
    start_command: Option<String>,
    environment: Option<String>,
    extra_hosts: Option<String>,
    extra_volumes: Vec<String>,
    console_resolution: String,
    console_http_port: u16,
    console_http_path: String,
    cid: Option<String>,
    /// Canonicalized container paths persisted under the working directory.
    volumes: Vec<String>,
    nios: HashMap<usize, Nio>,
    console_server: Option<TelnetServer>,
    attach_token: Option<CancellationToken>,
    aux_server: Option<TelnetServer>,
    aux_process: Option<SupervisedChild>,
    http_relay: Option<CancellationToken>,
    vnc_process: Option<SupervisedChild>,
    display: Option<u32>,
    permissions_fixed: bool,
}

impl DockerNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        id: Uuid,
        project: Arc<Project>,
        pool: Arc<PortPool>,
        runtime: &NodeRuntime,
        client: Arc<DockerClient>,
        image: impl Into<String>,
        options: DockerNodeOptions,
    ) -> Result<Self, NodeError> {
        let mut image = image.into();
        if !image.contains(':') {
            image.push_str(":latest");
        }
        let base = BaseNode::new(
            name,
            id,
            project,
            pool,
            BACKEND,
            runtime.ubridge_path.clone(),
            NodeOptions {
                console: options.console,
                console_type: options.console_type.unwrap_or(ConsoleType::Telnet),
                aux: options.aux,
                // The container backend always carries an auxiliary console.
                allocate_aux: true,
                wrap_console: false,
            },
        )?;
        Ok(Self {
            base,
            client,
            resources_path: runtime.docker_resources_path.clone(),
            image,
            adapters: options.adapters.unwrap_or(1),
            start_command: options.start_command,
            environment: options.environment,
            extra_hosts: options.extra_hosts,
            extra_volumes: options.extra_volumes,
            console_resolution: options
                .console_resolution
                .unwrap_or_else(|| "1024x768".to_string()),
            console_http_port: options.console_http_port.unwrap_or(80),
            console_http_path: options.console_http_path.unwrap_or_else(|| "/".to_string()),
            cid: None,
            volumes: Vec::new(),
            nios: HashMap::new(),
            console_server: None,
            attach_token: None,
            aux_server: None,
            aux_process: None,
            http_relay: None,
            vnc_process: None,
            display: None,
            permissions_fixed: false,
        })
    }

    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut BaseNode {
        &mut self.base
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn adapters(&self) -> usize {
        self.adapters
    }

    pub fn container_id(&self) -> Option<&str> {
        self.cid.as_deref()
    }

    /// Engine-facing container name; unique and recognizable.
    fn container_name(&self) -> String {
        format!("gns3-{}", self.base.id().simple())
    }

    fn mac_address(&self, adapter_number: usize) -> String {
        let id = self.base.id();
        let bytes = id.as_bytes();
        format!(
            "02:42:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[0], bytes[1], bytes[2], adapter_number as u8
        )
    }

    fn tap_name(adapter_number: usize) -> String {
        format!("tap-gns3-e{adapter_number}")
    }

    fn bridge_name(adapter_number: usize) -> String {
        format!("bridge{adapter_number}")
    }

    async fn cid(&self) -> Result<String, NodeError> {
        self.cid.clone().ok_or_else(|| {
            NodeError::Precondition(format!(
                "container for node {} has not been created",
                self.base.name()
            ))
        })
    }

    /// Materializes `etc/network` under the working directory so the
    /// container sees a persistent, user-editable interfaces file.
    fn create_network_config(&self) -> std::io::Result<PathBuf> {
        let path = self.base.working_dir().join("etc").join("network");
        std::fs::create_dir_all(&path)?;
        for hook in ["if-up.d", "if-down.d", "if-pre-up.d", "if-post-down.d", "interfaces.d"] {
            std::fs::create_dir_all(path.join(hook))?;
        }

        let interfaces = path.join("interfaces");
        if !interfaces.exists() {
            let mut config = String::from(
                "#\n# This is a sample network config, please uncomment lines to configure the network\n#\n\n\
                 # Uncomment this line to load custom interface files\n# source /etc/network/interfaces.d/*\n",
            );
            for adapter in 0..self.adapters {
                config.push_str(&format!(
                    "\n# Static config for eth{adapter}\n\
                     #auto eth{adapter}\n\
                     #iface eth{adapter} inet static\n\
                     #\taddress 192.168.{adapter}.2\n\
                     #\tnetmask 255.255.255.0\n\
                     #\tgateway 192.168.{adapter}.1\n\
                     #\tup echo nameserver 192.168.{adapter}.1 > /etc/resolv.conf\n\n\
                     # DHCP config for eth{adapter}\n\
                     #auto eth{adapter}\n\
                     #iface eth{adapter} inet dhcp\n\
                     #\thostname {name}\n",
                    name = self.base.name(),
                ));
            }
            std::fs::write(&interfaces, config)?;
        }
        Ok(path)
    }

    /// Container volume list with duplicate and nested mounts collapsed:
    /// no kept path is a prefix of another.
    fn canonicalize_volumes(volumes: Vec<String>) -> Vec<String> {
        let normalized = |path: &str| -> String {
            let mut n = path.to_string();
            while n.contains("//") {
                n = n.replace("//", "/");
            }
            if !n.ends_with('/') {
                n.push('/');
            }
            n
        };
        let covers = |general: &str, specific: &str| normalized(specific).starts_with(&normalized(general));

        let mut kept: Vec<String> = Vec::new();
        for volume in volumes {
            kept.retain(|existing| !covers(&volume, existing));
            if !kept.iter().any(|existing| covers(existing, &volume)) {
                kept.push(volume);
            }
        }
        kept
    }

    fn mount_binds(&mut self, image_info: &serde_json::Value) -> Result<Vec<String>, NodeError> {
        let mut binds = vec![format!("{}:/gns3:ro", self.resources_path.display())];

        self.create_network_config().map_err(|err| {
            NodeError::Backend(format!("could not create network config in the container: {err}"))
        })?;
        let mut volumes = vec!["/etc/network".to_string()];

        if let Some(image_volumes) = image_info["Config"]["Volumes"].as_object() {
            volumes.extend(image_volumes.keys().cloned());
        }
        for volume in &self.extra_volumes {
            if volume.trim().is_empty() || !volume.starts_with('/') || volume.contains("..") {
                return Err(NodeError::Precondition(format!(
                    "persistent volume '{volume}' has invalid format: it must start with a '/' and not contain '..'"
                )));
            }
        }
        volumes.extend(self.extra_volumes.iter().cloned());

        self.volumes = Self::canonicalize_volumes(volumes);
        for volume in &self.volumes {
            let source = self
                .base
                .working_dir()
                .join(volume.trim_start_matches('/'));
            std::fs::create_dir_all(&source)?;
            binds.push(format!("{}:/gns3volumes{}", source.display(), volume));
        }
        Ok(binds)
    }

    fn format_env(variables: &[ProjectVariable], env: &str) -> String {
        let mut formatted = env.to_string();
        for variable in variables {
            formatted = formatted.replace(&format!("${{{}}}", variable.name), &variable.value);
        }
        formatted
    }

    /// The engine `containers/create` request body.
    fn build_create_spec(
        &mut self,
        image_info: &serde_json::Value,
    ) -> Result<serde_json::Value, NodeError> {
        let binds = self.mount_binds(image_info)?;

        let mut entrypoint: Vec<String> = image_info["Config"]["Entrypoint"]
            .as_array()
            .map(|array| {
                array
                    .iter()
                    .filter_map(|value| value.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut cmd: Vec<String> = Vec::new();
        if let Some(start_command) = &self.start_command {
            cmd = shlex::split(start_command).ok_or_else(|| {
                NodeError::Precondition(format!("invalid start command '{start_command}'"))
            })?;
        }
        if cmd.is_empty() {
            cmd = image_info["Config"]["Cmd"]
                .as_array()
                .map(|array| {
                    array
                        .iter()
                        .filter_map(|value| value.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
        }
        if cmd.is_empty() && entrypoint.is_empty() {
            cmd = vec!["/bin/sh".to_string()];
        }
        // The init script brings up interfaces and waits for them before
        // handing over to the image's own entrypoint.
        entrypoint.insert(0, "/gns3/init.sh".to_string());

        let mut env = vec!["container=docker".to_string()];
        env.push(format!("GNS3_MAX_ETHERNET=eth{}", self.adapters.saturating_sub(1)));
        env.push(format!("GNS3_VOLUMES={}", self.volumes.join(":")));

        let mut user = serde_json::Value::Null;
        if let Some(image_user) = image_info["Config"]["User"].as_str() {
            if !image_user.is_empty() {
                user = serde_json::json!("root");
                env.push(format!("GNS3_USER={image_user}"));
            }
        }

        let variables = self.base.project().variables();
        for variable in &variables {
            env.push(format!(
                "{}={}",
                variable.name,
                Self::format_env(&variables, &variable.value)
            ));
        }

        if let Some(environment) = self.environment.clone() {
            for line in environment.trim().lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.split('=').next().unwrap_or("").is_empty() {
                    self.base.project().log_warning(format!(
                        "{} has invalid environment variable: {line}",
                        self.base.name()
                    ));
                    continue;
                }
                if line.starts_with("GNS3_") {
                    continue;
                }
                let mut formatted = Self::format_env(&variables, line);
                let vm_name = self.base.name().replace(',', ",,");
                let project_path = self.base.project().path().display().to_string().replace(',', ",,");
                formatted = formatted
                    .replace("%vm-name%", &format!("\"{}\"", vm_name.replace('"', "\\\"")))
                    .replace("%vm-id%", &self.base.id().to_string())
                    .replace("%project-id%", &self.base.project().id().to_string())
                    .replace(
                        "%project-path%",
                        &format!("\"{}\"", project_path.replace('"', "\\\"")),
                    );
                env.push(formatted);
            }
        }

        let mut spec = serde_json::json!({
            "Hostname": self.base.name(),
            "Image": self.image,
            "NetworkDisabled": true,
            "Tty": true,
            "OpenStdin": true,
            "StdinOnce": false,
            "HostConfig": {
                "CapAdd": ["ALL"],
                "Privileged": true,
                "Binds": binds,
                "UsernsMode": "host",
            },
            "Volumes": {},
            "Env": env,
            "Cmd": cmd,
            "Entrypoint": entrypoint,
        });
        if !user.is_null() {
            spec["User"] = user;
        }

        if self.base.console_type() == ConsoleType::Vnc {
            let display = self.display.unwrap_or(100);
            let env = spec["Env"].as_array_mut().expect("Env is an array");
            env.push(serde_json::json!("QT_GRAPHICSSYSTEM=native"));
            env.push(serde_json::json!(format!("DISPLAY=:{display}")));
            let binds = spec["HostConfig"]["Binds"].as_array_mut().expect("Binds is an array");
            binds.push(serde_json::json!(format!(
                "/tmp/.X11-unix/X{display}:/tmp/.X11-unix/X{display}:ro"
            )));
        }

        if let Some(extra_hosts) = &self.extra_hosts {
            let formatted = format_extra_hosts(extra_hosts)?;
            if !formatted.is_empty() {
                spec["Env"]
                    .as_array_mut()
                    .expect("Env is an array")
                    .push(serde_json::json!(format!("GNS3_EXTRA_HOSTS={formatted}")));
            }
        }
        Ok(spec)
    }

    /// Creates the container, pulling the image first when it is missing.
    pub async fn create(&mut self) -> Result<(), NodeError> {
        if self.base.working_dir().display().to_string().contains(':') {
            return Err(NodeError::Precondition(
                "cannot create a container with a project directory containing a colon".to_string(),
            ));
        }

        if self.base.console_type() == ConsoleType::Vnc {
            self.display = Some(free_display_number());
        }

        let image_info = match self.client.inspect_image(&self.image).await {
            Ok(info) => info,
            Err(err) if err.is_not_found() => {
                tracing::info!(image = %self.image, "image is missing, pulling it");
                self.client.pull_image(&self.image).await?;
                self.client.inspect_image(&self.image).await?
            }
            Err(err) => return Err(err.into()),
        };

        let spec = self.build_create_spec(&image_info)?;
        let cid = self
            .client
            .create_container(&self.container_name(), &spec)
            .await?;
        tracing::info!(node = %self.base.name(), cid, "container created");
        self.cid = Some(cid);
        self.base.emit_updated();
        Ok(())
    }

    pub async fn is_running(&self) -> Result<bool, NodeError> {
        match &self.cid {
            Some(cid) => Ok(self.client.container_state(cid).await? == "running"),
            None => Ok(false),
        }
    }

    pub async fn start(&mut self) -> Result<(), NodeError> {
        let cid = self.cid().await?;
        let state = match self.client.container_state(&cid).await {
            Ok(state) => state,
            Err(err) if err.is_not_found() => {
                return Err(NodeError::Precondition(format!(
                    "container for node {} does not exist or is not ready yet",
                    self.base.name()
                )))
            }
            Err(err) => return Err(err.into()),
        };

        if state == "paused" {
            self.unpause().await?;
            return Ok(());
        }
        if state == "running" {
            return Ok(());
        }

        if self.base.console_type() == ConsoleType::Vnc && self.vnc_process.is_none() {
            self.start_vnc().await?;
        }
        self.stop_console_servers().await;

        self.client.start_container(&cid).await?;
        // Give the container some time to start before reading its PID.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let pid = self.client.container_pid(&cid).await?;

        self.base.start_ubridge(true).await?;

        for adapter_number in 0..self.adapters {
            let nio = self.nios.get(&adapter_number).cloned();
            if let Err(err) = self.wire_adapter(adapter_number, pid, nio).await {
                tracing::error!(node = %self.base.name(), %err, "container failed to start");
                let _ = self.stop().await;
                let log = self.client.container_logs(&cid).await.unwrap_or_default();
                return Err(NodeError::Backend(format!(
                    "could not move an interface into the container namespace; container log:\n{log}"
                )));
            }
        }

        match self.base.console_type() {
            ConsoleType::Telnet => self.start_console(&cid).await?,
            ConsoleType::Http | ConsoleType::Https => self.start_http_relay(&cid).await?,
            _ => {}
        }
        if self.base.aux().is_some() {
            self.start_aux(&cid).await?;
        }

        self.permissions_fixed = false;
        self.base.set_status(NodeStatus::Started);
        tracing::info!(
            node = %self.base.name(),
            image = %self.image,
            console = ?self.base.console(),
            console_type = %self.base.console_type(),
            "container started"
        );
        Ok(())
    }

    /// One host TAP per adapter, renamed into the container's namespace as
    /// `ethN` and optionally relayed to the peer's UDP endpoint.
    async fn wire_adapter(
        &mut self,
        adapter_number: usize,
        pid: i64,
        nio: Option<Nio>,
    ) -> Result<(), NodeError> {
        let tap = Self::tap_name(adapter_number);
        let bridge = Self::bridge_name(adapter_number);
        let mac = self.mac_address(adapter_number);

        self.base.ubridge_send(format!("bridge create {bridge}")).await?;
        self.base
            .ubridge_send(format!("bridge add_nio_tap {bridge} {tap}"))
            .await?;
        self.base
            .ubridge_send(format!("docker set_mac_addr {tap} {mac}"))
            .await?;
        self.base
            .ubridge_send(format!("docker move_to_ns {tap} {pid} eth{adapter_number}"))
            .await?;

        if let Some(nio) = nio {
            self.connect_nio(adapter_number, &nio).await?;
        }
        Ok(())
    }

    async fn connect_nio(&mut self, adapter_number: usize, nio: &Nio) -> Result<(), NodeError> {
        let bridge = Self::bridge_name(adapter_number);
        let (lport, rhost, rport) = nio.as_udp().ok_or_else(|| {
            NodeError::Precondition("container adapters only take UDP NIOs".to_string())
        })?;
        self.base
            .ubridge_send(format!("bridge add_nio_udp {bridge} {lport} {rhost} {rport}"))
            .await?;
        if nio.capturing() {
            if let Some(pcap_file) = nio.pcap_file() {
                self.base
                    .ubridge_send(format!(
                        "bridge start_capture {bridge} \"{}\"",
                        pcap_file.display()
                    ))
                    .await?;
            }
        }
        self.base.ubridge_send(format!("bridge start {bridge}")).await?;
        self.base
            .ubridge_apply_filters(&bridge, nio.filters().clone())
            .await
    }

    /// Serves the container's TTY on the console port: a WebSocket attach
    /// pumped into a multi-client telnet proxy.
    async fn start_console(&mut self, cid: &str) -> Result<(), NodeError> {
        let attach = self.client.attach(cid).await?;
        let token = CancellationToken::new();
        let (engine_side, proxy_side) = tokio::io::duplex(8192);
        tokio::spawn(pump_attach(attach, engine_side, token.clone()));
        self.attach_token = Some(token);

        let (reader, writer) = tokio::io::split(proxy_side);
        let listener =
            tokio::net::TcpListener::bind((self.base.pool().console_host(), self.console_port()?))
                .await?;

        let client = self.client.clone();
        let resize_cid = cid.to_string();
        let window_size: WindowSizeCallback = Arc::new(move |columns, rows| {
            let client = client.clone();
            let cid = resize_cid.clone();
            tokio::spawn(async move {
                if let Err(err) = client.resize_tty(&cid, columns, rows).await {
                    tracing::warn!(%err, "could not resize the container TTY");
                }
            });
        });

        let greeting = format!(
            "{} console is now available... Press RETURN to get started.\r\n",
            self.base.name()
        );
        self.console_server = Some(TelnetServer::spawn(
            listener,
            Box::new(reader),
            Box::new(writer),
            TelnetSettings {
                binary: true,
                echo: true,
                naws: true,
                greeting: Some(greeting.into_bytes()),
            },
            Some(window_size),
        ));
        Ok(())
    }

    fn console_port(&self) -> Result<u16, NodeError> {
        self.base.console().ok_or_else(|| {
            NodeError::Precondition(format!("node {} has no console port", self.base.name()))
        })
    }

    /// Auxiliary always-on shell, detached from the main TTY.
    async fn start_aux(&mut self, cid: &str) -> Result<(), NodeError> {
        let aux = self.base.aux().expect("aux port allocated at creation");
        let mut child = tokio::process::Command::new("docker")
            .args([
                "exec",
                "-i",
                cid,
                "/gns3/bin/busybox",
                "sh",
                "-c",
                "while true; do TERM=vt100 /gns3/bin/busybox sh; done",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                NodeError::Backend(format!("could not start auxiliary console process: {err}"))
            })?;
        let stdout = child.stdout.take().expect("stdout piped");
        let stdin = child.stdin.take().expect("stdin piped");
        self.aux_process = Some(SupervisedChild::spawn(child, |_| {}));

        let listener =
            tokio::net::TcpListener::bind((self.base.pool().console_host(), aux)).await?;
        self.aux_server = Some(TelnetServer::spawn(
            listener,
            Box::new(stdout),
            Box::new(stdin),
            TelnetSettings {
                binary: true,
                echo: true,
                ..TelnetSettings::default()
            },
            None,
        ));
        tracing::debug!(node = %self.base.name(), aux, "auxiliary console listening");
        Ok(())
    }

    /// HTTP consoles are relayed with `nc` inside the container, the only
    /// packet path that exists without container networking.
    async fn start_http_relay(&mut self, cid: &str) -> Result<(), NodeError> {
        let console = self.console_port()?;
        let listener =
            tokio::net::TcpListener::bind((self.base.pool().console_host(), console)).await?;
        let token = CancellationToken::new();
        self.http_relay = Some(token.clone());

        let cid = cid.to_string();
        let http_port = self.console_http_port;
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, _)) = accepted else { return };
                tokio::spawn(relay_http_client(
                    stream,
                    cid.clone(),
                    http_port,
                    token.clone(),
                ));
            }
        });
        Ok(())
    }

    async fn start_vnc(&mut self) -> Result<(), NodeError> {
        let display = self.display.unwrap_or_else(free_display_number);
        self.display = Some(display);
        let console = self.console_port()?;

        let server = which::which("Xtigervnc")
            .or_else(|_| which::which("Xvnc"))
            .map_err(|_| {
                NodeError::Backend(
                    "please install a TigerVNC server before using VNC support".to_string(),
                )
            })?;
        let child = tokio::process::Command::new(&server)
            .args([
                "-geometry",
                &self.console_resolution,
                "-depth",
                "16",
                "-interface",
                &self.base.pool().console_host().to_string(),
                "-rfbport",
                &console.to_string(),
                "-AlwaysShared",
                "-SecurityTypes",
                "None",
                &format!(":{display}"),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| NodeError::Backend(format!("could not start the X server: {err}")))?;

        let project = self.base.project().clone();
        let name = self.base.name().to_string();
        self.vnc_process = Some(SupervisedChild::spawn(child, move |code| {
            if code.map_or(false, |c| c != 0) {
                project.log_error(format!(
                    "the vnc process has stopped with return code {} for node '{name}', please restart this node",
                    code.unwrap_or_default()
                ));
            }
        }));

        let socket = PathBuf::from(format!("/tmp/.X11-unix/X{display}"));
        wait_for_file(&socket, X11_SOCKET_TIMEOUT).await.map_err(|_| {
            NodeError::Timeout(
                X11_SOCKET_TIMEOUT,
                format!("waiting for the X11 socket {}", socket.display()),
            )
        })?;
        Ok(())
    }

    async fn stop_console_servers(&mut self) {
        if let Some(token) = self.attach_token.take() {
            token.cancel();
        }
        if let Some(server) = self.console_server.take() {
            server.close().await;
        }
        if let Some(server) = self.aux_server.take() {
            server.close().await;
        }
        if let Some(mut process) = self.aux_process.take() {
            process.kill().await;
        }
        if let Some(token) = self.http_relay.take() {
            token.cancel();
        }
    }

    /// The engine runs the container as root; restore user ownership of the
    /// persistent volumes so files stay editable from the host.
    async fn fix_permissions(&mut self) -> Result<(), NodeError> {
        let cid = self.cid().await?;
        let state = self.client.container_state(&cid).await?;
        if state == "exited" {
            // Exec needs a running container.
            self.client.start_container(&cid).await?;
        }

        #[cfg(unix)]
        let (uid, gid) = (
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        );
        #[cfg(not(unix))]
        let (uid, gid) = (0u32, 0u32);

        for volume in &self.volumes {
            tracing::debug!(node = %self.base.name(), volume, "fixing volume ownership");
            let script = format!(
                "(/gns3/bin/busybox find \"{volume}\" -depth -print0 \
                 | /gns3/bin/busybox xargs -0 /gns3/bin/busybox stat -c '%a:%u:%g:%n' > \"{volume}/.gns3_perms\") \
                 && /gns3/bin/busybox chmod -R u+rX \"{volume}\" \
                 && /gns3/bin/busybox chown {uid}:{gid} -R \"{volume}\""
            );
            self.client
                .exec(
                    &cid,
                    &[
                        "/gns3/bin/busybox".to_string(),
                        "sh".to_string(),
                        "-c".to_string(),
                        script,
                    ],
                )
                .await?;
        }
        self.permissions_fixed = true;
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), NodeError> {
        self.stop_console_servers().await;
        self.base.stop_ubridge().await;

        if let Ok(cid) = self.cid().await {
            let state = self.client.container_state(&cid).await.unwrap_or_default();
            if state == "paused" || state == "running" {
                if state == "paused" {
                    self.client.unpause_container(&cid).await?;
                }
                if !self.permissions_fixed {
                    if let Err(err) = self.fix_permissions().await {
                        tracing::warn!(node = %self.base.name(), %err, "could not fix volume permissions");
                    }
                }
                self.client.stop_container(&cid, STOP_TIMEOUT_SECONDS).await?;
            }
        }
        if let Some(mut vnc) = self.vnc_process.take() {
            vnc.terminate(Duration::from_secs(3)).await;
        }
        self.base.set_status(NodeStatus::Stopped);
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<(), NodeError> {
        let cid = self.cid().await?;
        self.client.pause_container(&cid).await?;
        self.base.set_status(NodeStatus::Suspended);
        Ok(())
    }

    pub async fn unpause(&mut self) -> Result<(), NodeError> {
        let cid = self.cid().await?;
        self.client.unpause_container(&cid).await?;
        self.base.set_status(NodeStatus::Started);
        Ok(())
    }

    pub async fn restart(&mut self) -> Result<(), NodeError> {
        let cid = self.cid().await?;
        self.client.restart_container(&cid).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<bool, NodeError> {
        if !self.base.close().await? {
            return Ok(false);
        }
        self.stop_console_servers().await;

        for (_, nio) in std::mem::take(&mut self.nios) {
            if let Some(lport) = nio.lport() {
                self.base.release_udp_port(lport);
            }
        }
        self.base.stop_ubridge().await;

        if let Some(cid) = self.cid.take() {
            if let Err(err) = self.client.delete_container(&cid).await {
                if !err.is_not_found() {
                    tracing::warn!(node = %self.base.name(), %err, "could not remove container");
                }
            }
        }
        if let Some(mut vnc) = self.vnc_process.take() {
            vnc.kill().await;
        }
        Ok(true)
    }

    pub async fn adapter_add_nio_binding(
        &mut self,
        adapter_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        self.check_adapter(adapter_number)?;
        if self.base.status() == NodeStatus::Started && self.base.ubridge_is_running() {
            self.connect_nio(adapter_number, &nio).await?;
        }
        self.nios.insert(adapter_number, nio);
        tracing::info!(node = %self.base.name(), adapter_number, "NIO added to adapter");
        Ok(())
    }

    pub async fn adapter_update_nio_binding(
        &mut self,
        adapter_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        self.check_adapter(adapter_number)?;
        if self.base.ubridge_is_running() {
            let bridge = Self::bridge_name(adapter_number);
            self.base
                .ubridge_apply_filters(&bridge, nio.filters().clone())
                .await?;
        }
        self.nios.insert(adapter_number, nio);
        Ok(())
    }

    pub async fn adapter_remove_nio_binding(
        &mut self,
        adapter_number: usize,
    ) -> Result<Nio, NodeError> {
        self.check_adapter(adapter_number)?;
        let nio = self.nios.remove(&adapter_number).ok_or_else(|| {
            NodeError::Precondition(format!("adapter {adapter_number} is not connected"))
        })?;
        if self.base.ubridge_is_running() {
            let bridge = Self::bridge_name(adapter_number);
            self.base.ubridge_send(format!("bridge stop {bridge}")).await?;
            if let Some((lport, rhost, rport)) = nio.as_udp() {
                self.base
                    .ubridge_send(format!(
                        "bridge remove_nio_udp {bridge} {lport} {rhost} {rport}"
                    ))
                    .await?;
            }
        }
        if let Some(lport) = nio.lport() {
            self.base.release_udp_port(lport);
        }
        Ok(nio)
    }

    pub async fn adapter_start_capture(
        &mut self,
        adapter_number: usize,
        output_file: PathBuf,
        data_link_type: Option<String>,
    ) -> Result<(), NodeError> {
        self.check_adapter(adapter_number)?;
        let started = self.base.status() == NodeStatus::Started;
        let nio = self.nios.get_mut(&adapter_number).ok_or_else(|| {
            NodeError::Precondition(format!("adapter {adapter_number} is not connected"))
        })?;
        if nio.capturing() {
            return Err(NodeError::Precondition(format!(
                "packet capture is already activated on adapter {adapter_number}"
            )));
        }
        nio.start_capture(&output_file, data_link_type);
        if started && self.base.ubridge_is_running() {
            let bridge = Self::bridge_name(adapter_number);
            self.base
                .ubridge_send(format!(
                    "bridge start_capture {bridge} \"{}\"",
                    output_file.display()
                ))
                .await?;
        }
        Ok(())
    }

    pub async fn adapter_stop_capture(&mut self, adapter_number: usize) -> Result<(), NodeError> {
        self.check_adapter(adapter_number)?;
        let nio = self.nios.get_mut(&adapter_number).ok_or_else(|| {
            NodeError::Precondition(format!("adapter {adapter_number} is not connected"))
        })?;
        nio.stop_capture();
        if self.base.ubridge_is_running() {
            let bridge = Self::bridge_name(adapter_number);
            self.base
                .ubridge_send(format!("bridge stop_capture {bridge}"))
                .await?;
        }
        Ok(())
    }

    fn check_adapter(&self, adapter_number: usize) -> Result<(), NodeError> {
        if adapter_number >= self.adapters {
            return Err(NodeError::Precondition(format!(
                "adapter {adapter_number} does not exist (container has {} adapters)",
                self.adapters
            )));
        }
        Ok(())
    }

    pub fn as_json(&self) -> serde_json::Value {
        let mut json = self.base.as_json();
        json["image"] = serde_json::json!(self.image);
        json["adapters"] = serde_json::json!(self.adapters);
        json["container_id"] = serde_json::json!(self.cid);
        json["start_command"] = serde_json::json!(self.start_command);
        json["environment"] = serde_json::json!(self.environment);
        json["extra_volumes"] = serde_json::json!(self.extra_volumes);
        json["console_resolution"] = serde_json::json!(self.console_resolution);
        json["console_http_port"] = serde_json::json!(self.console_http_port);
        json["console_http_path"] = serde_json::json!(self.console_http_path);
        json
    }
}

#[async_trait]
impl NodeBackend for DockerNode {
    fn node_id(&self) -> Uuid {
        self.base.id()
    }

    fn node_name(&self) -> String {
        self.base.name().to_string()
    }

    fn status(&self) -> NodeStatus {
        self.base.status()
    }

    async fn start(&mut self) -> Result<(), NodeError> {
        DockerNode::start(self).await
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        DockerNode::stop(self).await
    }

    async fn suspend(&mut self) -> Result<(), NodeError> {
        self.pause().await
    }

    async fn reload(&mut self) -> Result<(), NodeError> {
        self.restart().await
    }

    async fn close(&mut self) -> Result<bool, NodeError> {
        DockerNode::close(self).await
    }

    async fn add_nio(
        &mut self,
        adapter_number: usize,
        _port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        self.adapter_add_nio_binding(adapter_number, nio).await
    }

    async fn update_nio(
        &mut self,
        adapter_number: usize,
        _port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        self.adapter_update_nio_binding(adapter_number, nio).await
    }

    async fn remove_nio(
        &mut self,
        adapter_number: usize,
        _port_number: usize,
    ) -> Result<Nio, NodeError> {
        self.adapter_remove_nio_binding(adapter_number).await
    }

    async fn start_capture(
        &mut self,
        adapter_number: usize,
        _port_number: usize,
        output_file: PathBuf,
        data_link_type: Option<String>,
    ) -> Result<(), NodeError> {
        self.adapter_start_capture(adapter_number, output_file, data_link_type)
            .await
    }

    async fn stop_capture(
        &mut self,
        adapter_number: usize,
        _port_number: usize,
    ) -> Result<(), NodeError> {
        self.adapter_stop_capture(adapter_number).await
    }
}

/// Bridges the engine's attach WebSocket onto a byte stream the telnet
/// proxy can own.
async fn pump_attach(
    mut attach: AttachStream,
    mut pipe: tokio::io::DuplexStream,
    token: CancellationToken,
) {
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            message = attach.next() => match message {
                Some(Ok(tungstenite::Message::Binary(bytes))) => {
                    if pipe.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(Ok(tungstenite::Message::Text(text))) => {
                    if pipe.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(%err, "container attach websocket error");
                    break;
                }
            },
            read = pipe.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if attach
                        .send(tungstenite::Message::Binary(buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            },
        }
    }
    let _ = attach.close(None).await;
}

/// One HTTP console client: spawn `nc` inside the container and splice.
async fn relay_http_client(
    mut stream: tokio::net::TcpStream,
    cid: String,
    http_port: u16,
    token: CancellationToken,
) {
    let mut child = match tokio::process::Command::new("docker")
        .args([
            "exec",
            "-i",
            &cid,
            "/gns3/bin/busybox",
            "nc",
            "127.0.0.1",
            &http_port.to_string(),
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(%err, "could not spawn the HTTP console relay");
            return;
        }
    };
    let mut stdin = child.stdin.take().expect("stdin piped");
    let mut stdout = child.stdout.take().expect("stdout piped");

    let (mut client_read, mut client_write) = stream.split();
    let splice = async {
        let to_container = tokio::io::copy(&mut client_read, &mut stdin);
        let to_client = tokio::io::copy(&mut stdout, &mut client_write);
        tokio::select! {
            _ = to_container => {}
            _ = to_client => {}
        }
    };
    tokio::select! {
        _ = token.cancelled() => {}
        _ = splice => {}
    }
    let _ = child.kill().await;
}

/// First X display number from 100 whose socket does not exist yet.
fn free_display_number() -> u32 {
    let mut display = 100;
    while Path::new(&format!("/tmp/.X11-unix/X{display}")).exists() {
        display += 1;
    }
    display
}

async fn wait_for_file(path: &Path, timeout: Duration) -> Result<(), ()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !path.exists() {
        if tokio::time::Instant::now() >= deadline {
            return Err(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

fn format_extra_hosts(extra_hosts: &str) -> Result<String, NodeError> {
    let mut hosts = Vec::new();
    for line in extra_hosts.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((host, ip)) if !host.trim().is_empty() && !ip.trim().is_empty() => {
                hosts.push(format!("{}:{}", host.trim(), ip.trim()));
            }
            _ => {
                return Err(NodeError::Precondition(format!(
                    "can't apply extra host '{line}', it must be in the host:ip form"
                )))
            }
        }
    }
    Ok(hosts.join(" "))
}

pub struct DockerManager {
    pool: Arc<PortPool>,
    runtime: NodeRuntime,
    client: Arc<DockerClient>,
    nodes: Registry<DockerNode>,
}

impl DockerManager {
    pub fn new(pool: Arc<PortPool>, runtime: NodeRuntime) -> Self {
        let client = Arc::new(DockerClient::new(runtime.docker_api_url.clone()));
        Self {
            pool,
            runtime,
            client,
            nodes: Registry::new(),
        }
    }

    pub fn client(&self) -> &Arc<DockerClient> {
        &self.client
    }

    pub async fn create_node(
        &self,
        name: impl Into<String>,
        project: Arc<Project>,
        node_id: Option<Uuid>,
        image: impl Into<String>,
        options: DockerNodeOptions,
    ) -> Result<Arc<Mutex<DockerNode>>, NodeError> {
        self.client.check_connection().await?;
        let id = node_id.unwrap_or_else(Uuid::new_v4);
        let mut node = DockerNode::new(
            name,
            id,
            project,
            self.pool.clone(),
            &self.runtime,
            self.client.clone(),
            image,
            options,
        )?;
        node.create().await?;
        Ok(self.nodes.insert(id, node).await)
    }

    pub async fn node(&self, node_id: Uuid) -> Result<Arc<Mutex<DockerNode>>, NodeError> {
        self.nodes.get(node_id).await
    }

    pub async fn delete_node(&self, node_id: Uuid) -> Result<(), NodeError> {
        let node = self.nodes.get(node_id).await?;
        {
            let mut node = node.lock().await;
            node.close().await?;
            let project = node.base().project().clone();
            project
                .delete_node_working_directory(BACKEND, node_id)
                .await?;
        }
        self.nodes.remove(node_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_node() -> (tempfile::TempDir, DockerNode) {
        let dir = tempfile::tempdir().unwrap();
        let project = Arc::new(Project::new(dir.path(), Uuid::new_v4()).unwrap());
        let runtime = NodeRuntime::from_settings(&project::ComputeSettings::default());
        let client = Arc::new(DockerClient::new(runtime.docker_api_url.clone()));
        let node = DockerNode::new(
            "nginx-1",
            Uuid::new_v4(),
            project,
            Arc::new(PortPool::default()),
            &runtime,
            client,
            "nginx",
            DockerNodeOptions {
                adapters: Some(2),
                ..DockerNodeOptions::default()
            },
        )
        .unwrap();
        (dir, node)
    }

    #[test]
    fn test_image_tag_defaults_to_latest() {
        let (_dir, node) = test_node();
        assert_eq!(node.image(), "nginx:latest");
    }

    #[test]
    fn test_aux_port_always_allocated() {
        let (_dir, node) = test_node();
        assert!(node.base().aux().is_some());
        assert!(node.base().console().is_some());
    }

    #[test]
    fn test_canonicalize_volumes_drops_nested_mounts() {
        let volumes = vec![
            "/etc/network".to_string(),
            "/data/sub/dir".to_string(),
            "/data".to_string(),
            "/data/other".to_string(),
            "/etc/network".to_string(),
        ];
        assert_eq!(
            DockerNode::canonicalize_volumes(volumes),
            vec!["/etc/network".to_string(), "/data".to_string()],
        );
    }

    #[test]
    fn test_create_spec_shape() {
        let (_dir, mut node) = test_node();
        let image_info = serde_json::json!({
            "Config": {
                "Cmd": ["nginx", "-g", "daemon off;"],
                "Entrypoint": null,
                "Volumes": {"/var/log/nginx": {}},
                "User": "",
            }
        });
        let spec = node.build_create_spec(&image_info).unwrap();

        assert_eq!(spec["Image"], "nginx:latest");
        assert_eq!(spec["NetworkDisabled"], true);
        assert_eq!(spec["HostConfig"]["Privileged"], true);
        assert_eq!(spec["Entrypoint"][0], "/gns3/init.sh");
        assert_eq!(spec["Cmd"], serde_json::json!(["nginx", "-g", "daemon off;"]));

        let env: Vec<&str> = spec["Env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|value| value.as_str().unwrap())
            .collect();
        assert!(env.contains(&"container=docker"));
        assert!(env.contains(&"GNS3_MAX_ETHERNET=eth1"));
        assert!(env.iter().any(|e| e.starts_with("GNS3_VOLUMES=")));

        // Both declared volumes are persisted under the working directory.
        let binds: Vec<&str> = spec["HostConfig"]["Binds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|value| value.as_str().unwrap())
            .collect();
        assert!(binds[0].ends_with(":/gns3:ro"));
        assert!(binds.iter().any(|b| b.ends_with(":/gns3volumes/etc/network")));
        assert!(binds.iter().any(|b| b.ends_with(":/gns3volumes/var/log/nginx")));
    }

    #[test]
    fn test_start_command_is_shell_split() {
        let (_dir, mut node) = test_node();
        node.start_command = Some("sh -c 'echo hello world'".to_string());
        let image_info = serde_json::json!({"Config": {}});
        let spec = node.build_create_spec(&image_info).unwrap();
        assert_eq!(spec["Cmd"], serde_json::json!(["sh", "-c", "echo hello world"]));
    }

    #[test]
    fn test_environment_variable_substitution() {
        let (_dir, mut node) = test_node();
        node.base.project().set_variables(vec![ProjectVariable {
            name: "TOKEN".to_string(),
            value: "s3cret".to_string(),
        }]);
        node.environment = Some("API_TOKEN=${TOKEN}\nGNS3_INTERNAL=skipme\n".to_string());

        let spec = node.build_create_spec(&serde_json::json!({"Config": {}})).unwrap();
        let env: Vec<&str> = spec["Env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|value| value.as_str().unwrap())
            .collect();
        assert!(env.contains(&"API_TOKEN=s3cret"));
        assert!(env.contains(&"TOKEN=s3cret"));
        assert!(!env.iter().any(|e| e.starts_with("GNS3_INTERNAL")));
    }

    #[test]
    fn test_extra_volume_validation() {
        let (_dir, mut node) = test_node();
        node.extra_volumes = vec!["relative/path".to_string()];
        let err = node
            .build_create_spec(&serde_json::json!({"Config": {}}))
            .unwrap_err();
        assert!(matches!(err, NodeError::Precondition(_)));

        node.extra_volumes = vec!["/up/../and/away".to_string()];
        assert!(node
            .build_create_spec(&serde_json::json!({"Config": {}}))
            .is_err());
    }

    #[test]
    fn test_extra_hosts_format() {
        assert_eq!(
            format_extra_hosts("test:199.199.199.1\nrouter: 10.0.0.1\n").unwrap(),
            "test:199.199.199.1 router:10.0.0.1",
        );
        assert!(format_extra_hosts("nonsense").is_err());
    }

    #[test]
    fn test_network_config_template() {
        let (_dir, node) = test_node();
        let path = node.create_network_config().unwrap();
        let interfaces = std::fs::read_to_string(path.join("interfaces")).unwrap();
        assert!(interfaces.contains("eth0"));
        assert!(interfaces.contains("eth1"));
        assert!(path.join("if-up.d").is_dir());
    }

    #[test]
    fn test_tap_and_bridge_names() {
        assert_eq!(DockerNode::tap_name(0), "tap-gns3-e0");
        assert_eq!(DockerNode::tap_name(3), "tap-gns3-e3");
        assert_eq!(DockerNode::bridge_name(1), "bridge1");
    }

    /// One TAP per adapter, moved into the container namespace, then the
    /// peer's UDP endpoint relayed onto it.
    #[tokio::test]
    async fn test_adapter_wiring_command_sequence() {
        let (_dir, mut node) = test_node();

        // Scripted hypervisor answering OK to everything.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hypervisor_port = listener.local_addr().unwrap().port();
        let commands: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let recorded = commands.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = tokio::io::BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                recorded.lock().unwrap().push(line);
                if writer.write_all(b"100-OK\r\n").await.is_err() {
                    return;
                }
            }
        });

        let client = bridge::BridgeClient::new("127.0.0.1", hypervisor_port);
        client.connect(Duration::from_secs(5)).await.unwrap();
        node.base
            .attach_ubridge(bridge::BridgeProcess::attach(client, node.base.working_dir()));

        let nio = Nio::udp(4242, "127.0.0.1", 4343);
        node.wire_adapter(0, 4321, Some(nio)).await.unwrap();

        let mac = node.mac_address(0);
        let sent: Vec<String> = commands
            .lock()
            .unwrap()
            .iter()
            .filter(|command| !command.starts_with("hypervisor "))
            .cloned()
            .collect();
        assert_eq!(
            sent,
            vec![
                "bridge create bridge0".to_string(),
                "bridge add_nio_tap bridge0 tap-gns3-e0".to_string(),
                format!("docker set_mac_addr tap-gns3-e0 {mac}"),
                "docker move_to_ns tap-gns3-e0 4321 eth0".to_string(),
                "bridge add_nio_udp bridge0 4242 127.0.0.1 4343".to_string(),
                "bridge start bridge0".to_string(),
                "bridge reset_packet_filters bridge0".to_string(),
            ],
        );
    }
}
