use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge::parse_version;
use nio::Nio;
use ports::PortPool;
use project::Project;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    BaseNode, ConsoleType, NodeBackend, NodeError, NodeOptions, NodeRuntime, NodeStatus,
    Registry, SupervisedChild,
};

pub const BACKEND: &str = "vpcs";
const STARTUP_SCRIPT: &str = "startup.vpc";
const STOP_GRACE: Duration = Duration::from_secs(3);

/// A userspace PC simulated by the `vpcs` executable.
///
/// Even a single link goes through the bridge hypervisor: the process talks
/// UDP to a local tunnel whose other end the hypervisor relays to the peer.
pub struct UserPcNode {
    base: BaseNode,
    vpcs_path: String,
    mac_id: u8,
    process: Option<SupervisedChild>,
    version: Option<Vec<u32>>,
    local_tunnel: Option<(Nio, Nio)>,
    nio: Option<Nio>,
}

impl UserPcNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        id: Uuid,
        project: Arc<Project>,
        pool: Arc<PortPool>,
        runtime: &NodeRuntime,
        mac_id: u8,
        console: Option<u16>,
        startup_script: Option<String>,
    ) -> Result<Self, NodeError> {
        let base = BaseNode::new(
            name,
            id,
            project,
            pool,
            BACKEND,
            runtime.ubridge_path.clone(),
            NodeOptions {
                console,
                console_type: ConsoleType::Telnet,
                wrap_console: true,
                ..NodeOptions::default()
            },
        )?;

        let mut node = Self {
            base,
            vpcs_path: runtime.vpcs_path.clone(),
            mac_id,
            process: None,
            version: None,
            local_tunnel: None,
            nio: None,
        };
        // An explicit script never overrides one already on disk.
        if let Some(script) = startup_script {
            if node.script_file().is_none() {
                node.set_startup_script(&script)?;
            }
        }
        Ok(node)
    }

    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut BaseNode {
        &mut self.base
    }

    pub fn mac_id(&self) -> u8 {
        self.mac_id
    }

    fn bridge_name(&self) -> String {
        format!("PC-{}", self.base.id())
    }

    fn log_path(&self) -> PathBuf {
        self.base.working_dir().join("vpcs.log")
    }

    pub fn is_running(&self) -> bool {
        self.process
            .as_ref()
            .map(SupervisedChild::is_running)
            .unwrap_or(false)
    }

    /// Path to the startup script, when one exists on disk.
    pub fn script_file(&self) -> Option<PathBuf> {
        let path = self.base.working_dir().join(STARTUP_SCRIPT);
        path.exists().then_some(path)
    }

    pub fn startup_script(&self) -> Result<Option<String>, NodeError> {
        match self.script_file() {
            Some(path) => std::fs::read_to_string(&path).map(Some).map_err(|err| {
                NodeError::Backend(format!(
                    "cannot read the startup script file {}: {err}",
                    path.display()
                ))
            }),
            None => Ok(None),
        }
    }

    pub fn set_startup_script(&mut self, content: &str) -> Result<(), NodeError> {
        let path = self.base.working_dir().join(STARTUP_SCRIPT);
        let content = content.replace("%h", self.base.name());
        std::fs::write(&path, content).map_err(|err| {
            NodeError::Backend(format!(
                "cannot write the startup script file {}: {err}",
                path.display()
            ))
        })
    }

    /// Renames the node and keeps the startup script's `set pcname` line in
    /// sync.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), NodeError> {
        let name = name.into();
        if let Some(script) = self.startup_script()? {
            let renamed: Vec<String> = script
                .lines()
                .map(|line| {
                    if line.starts_with("set pcname ") {
                        format!("set pcname {name}")
                    } else {
                        line.replace(self.base.name(), &name)
                    }
                })
                .collect();
            let mut renamed = renamed.join("\n");
            if script.ends_with('\n') {
                renamed.push('\n');
            }
            self.set_startup_script(&renamed)?;
        }
        self.base.set_name(name);
        Ok(())
    }

    fn vpcs_executable(&self) -> Result<PathBuf, NodeError> {
        which::which(&self.vpcs_path).map_err(|err| {
            NodeError::Backend(format!(
                "VPCS program '{}' is not accessible: {err}",
                self.vpcs_path
            ))
        })
    }

    pub async fn check_requirements(&mut self) -> Result<PathBuf, NodeError> {
        let path = self.vpcs_executable()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = std::fs::metadata(&path)?;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(NodeError::Backend(format!(
                    "VPCS program '{}' is not executable",
                    path.display()
                )));
            }
        }
        self.check_version(&path).await?;
        Ok(path)
    }

    async fn check_version(&mut self, path: &PathBuf) -> Result<(), NodeError> {
        let output = tokio::process::Command::new(path)
            .arg("-v")
            .current_dir(self.base.working_dir())
            .output()
            .await
            .map_err(|err| {
                NodeError::Backend(format!("error while looking for the VPCS version: {err}"))
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .lines()
            .find_map(|line| line.split("version ").nth(1))
            .map(str::trim)
            .ok_or_else(|| {
                NodeError::Backend(format!(
                    "could not determine the VPCS version for {}",
                    path.display()
                ))
            })?;

        let parsed = parse_version(version);
        if parsed < parse_version("0.6.1") {
            return Err(NodeError::Backend(format!(
                "VPCS executable version must be >= 0.6.1, found {version}"
            )));
        }
        self.version = Some(parsed);
        Ok(())
    }

    fn ensure_local_tunnel(&mut self) -> Result<(), NodeError> {
        if self.local_tunnel.is_none() {
            self.local_tunnel = Some(self.base.create_local_udp_tunnel()?);
        }
        Ok(())
    }

    /// The vpcs argument vector: one PC instance in the foreground, daemon
    /// console on the internal port, MAC offset from the manager, UDP
    /// endpoint pointed at the local tunnel.
    pub async fn build_command(&mut self, path: &PathBuf) -> Result<Vec<String>, NodeError> {
        let internal_console = self.base.internal_console_port().ok_or_else(|| {
            NodeError::Precondition("userspace PC requires a wrap console port".to_string())
        })?;

        let mut command = vec![
            path.display().to_string(),
            "-p".to_string(),
            internal_console.to_string(),
            "-m".to_string(),
            self.mac_id.to_string(),
            "-i".to_string(),
            "1".to_string(),
            "-F".to_string(),
        ];
        // The relay feature exists from 0.8 on and must be off.
        if self.version.as_deref().unwrap_or(&[]) >= &[0, 8][..] {
            command.push("-R".to_string());
        }

        self.ensure_local_tunnel()?;
        let (lport, rhost, rport) = self
            .local_tunnel
            .as_ref()
            .expect("tunnel just ensured")
            .0
            .as_udp()
            .expect("local tunnel endpoints are UDP");
        command.extend(["-s".to_string(), lport.to_string()]);
        command.extend(["-c".to_string(), rport.to_string()]);
        command.extend(["-t".to_string(), resolve_ipv4(rhost).await?]);

        if let Some(script) = self.script_file() {
            if let Some(file_name) = script.file_name() {
                command.push(file_name.to_string_lossy().into_owned());
            }
        }
        Ok(command)
    }

    pub async fn start(&mut self) -> Result<(), NodeError> {
        let path = self.check_requirements().await?;
        if self.is_running() {
            return Ok(());
        }

        let command = self.build_command(&path).await?;
        self.base.set_command_line(command.join(" "));
        tracing::info!(node = %self.base.name(), ?command, "starting VPCS");

        let log = std::fs::File::create(self.log_path())
            .map_err(|err| NodeError::Backend(format!("cannot open VPCS log: {err}")))?;
        let log_err = log
            .try_clone()
            .map_err(|err| NodeError::Backend(err.to_string()))?;
        let child = tokio::process::Command::new(&command[0])
            .args(&command[1..])
            .current_dir(self.base.working_dir())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|err| {
                NodeError::Backend(format!("could not start VPCS {}: {err}", path.display()))
            })?;

        let project = self.base.project().clone();
        let node_json = self.base.as_json();
        let name = self.base.name().to_string();
        let log_path = self.log_path();
        self.process = Some(SupervisedChild::spawn(child, move |code| {
            tracing::info!(node = %name, ?code, "VPCS process has stopped");
            // A signal-terminated process is a deliberate stop; only real
            // failure exit codes are surfaced to the controller.
            if code.map_or(false, |c| c != 0) {
                let tail = std::fs::read_to_string(&log_path).unwrap_or_default();
                project.log_error(format!(
                    "VPCS process has stopped, return code: {}\n{tail}",
                    code.unwrap_or_default(),
                ));
            }
            let mut stopped = node_json;
            stopped["status"] = serde_json::json!(NodeStatus::Stopped);
            project.node_updated(stopped);
        }));

        self.base.start_ubridge(false).await?;
        if let Some(nio) = self.nio.clone() {
            let destination = self
                .local_tunnel
                .as_ref()
                .expect("tunnel created by build_command")
                .1
                .clone();
            self.base
                .add_ubridge_udp_connection(&self.bridge_name(), &destination, &nio)
                .await?;
        }

        self.base.start_wrap_console().await?;

        self.base.set_status(NodeStatus::Started);
        tracing::info!(node = %self.base.name(), "VPCS instance started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), NodeError> {
        self.base.stop_ubridge().await;
        if let Some(mut process) = self.process.take() {
            if process.is_running() {
                tracing::info!(node = %self.base.name(), pid = ?process.id(), "stopping VPCS instance");
                process.terminate(STOP_GRACE).await;
            }
        }
        self.base.stop_wrap_console().await;
        self.base.set_status(NodeStatus::Stopped);
        Ok(())
    }

    pub async fn reload(&mut self) -> Result<(), NodeError> {
        self.stop().await?;
        self.start().await
    }

    pub async fn close(&mut self) -> Result<bool, NodeError> {
        if !self.base.close().await? {
            return Ok(false);
        }

        if let Some(nio) = self.nio.take() {
            if let Some(lport) = nio.lport() {
                self.base.release_udp_port(lport);
            }
        }
        if let Some((source, destination)) = self.local_tunnel.take() {
            if let Some(lport) = source.lport() {
                self.base.release_udp_port(lport);
            }
            if let Some(lport) = destination.lport() {
                self.base.release_udp_port(lport);
            }
        }

        self.base.stop_ubridge().await;
        if let Some(mut process) = self.process.take() {
            if process.is_running() {
                process.terminate(STOP_GRACE).await;
            }
        }
        Ok(true)
    }

    /// Binds a NIO to the single Ethernet port.
    pub async fn port_add_nio_binding(
        &mut self,
        port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        self.check_port(port_number)?;
        if self.base.ubridge_is_running() {
            self.ensure_local_tunnel()?;
            let destination = self.local_tunnel.as_ref().expect("just ensured").1.clone();
            self.base
                .add_ubridge_udp_connection(&self.bridge_name(), &destination, &nio)
                .await?;
        }
        tracing::info!(node = %self.base.name(), port_number, "NIO added to port");
        self.nio = Some(nio);
        Ok(())
    }

    pub async fn port_update_nio_binding(
        &mut self,
        port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        self.check_port(port_number)?;
        if self.base.ubridge_is_running() {
            let source = self.local_tunnel.as_ref().map(|t| t.1.clone());
            if let Some(source) = source {
                let name = self.bridge_name();
                self.base
                    .update_ubridge_udp_connection(&name, &source, &nio)
                    .await?;
            }
        }
        self.nio = Some(nio);
        Ok(())
    }

    pub async fn port_remove_nio_binding(
        &mut self,
        port_number: usize,
    ) -> Result<Nio, NodeError> {
        self.check_port(port_number)?;
        if self.base.ubridge_is_running() {
            let name = self.bridge_name();
            self.base.ubridge_delete_bridge(&name).await?;
        }
        let nio = self
            .nio
            .take()
            .ok_or_else(|| NodeError::Precondition(format!("port {port_number} is not connected")))?;
        if let Some(lport) = nio.lport() {
            self.base.release_udp_port(lport);
        }
        tracing::info!(node = %self.base.name(), port_number, "NIO removed from port");
        Ok(nio)
    }

    pub async fn start_port_capture(
        &mut self,
        port_number: usize,
        output_file: PathBuf,
        data_link_type: Option<String>,
    ) -> Result<(), NodeError> {
        self.check_port(port_number)?;
        let nio = self.nio.as_mut().ok_or_else(|| {
            NodeError::Precondition(format!("port {port_number} is not connected"))
        })?;
        if nio.capturing() {
            return Err(NodeError::Precondition(format!(
                "packet capture is already activated on port {port_number}"
            )));
        }
        nio.start_capture(&output_file, data_link_type);
        let command = format!(
            "bridge start_capture {} \"{}\"",
            self.bridge_name(),
            output_file.display()
        );
        if self.base.ubridge_is_running() {
            self.base.ubridge_send(command).await?;
        }
        tracing::info!(node = %self.base.name(), port_number, "starting packet capture");
        Ok(())
    }

    pub async fn stop_port_capture(&mut self, port_number: usize) -> Result<(), NodeError> {
        self.check_port(port_number)?;
        let nio = self.nio.as_mut().ok_or_else(|| {
            NodeError::Precondition(format!("port {port_number} is not connected"))
        })?;
        nio.stop_capture();
        let command = format!("bridge stop_capture {}", self.bridge_name());
        if self.base.ubridge_is_running() {
            self.base.ubridge_send(command).await?;
        }
        tracing::info!(node = %self.base.name(), port_number, "stopping packet capture");
        Ok(())
    }

    fn check_port(&self, port_number: usize) -> Result<(), NodeError> {
        if port_number != 0 {
            return Err(NodeError::Precondition(format!(
                "port {port_number} does not exist on a userspace PC"
            )));
        }
        Ok(())
    }

    pub fn as_json(&self) -> serde_json::Value {
        let mut json = self.base.as_json();
        json["startup_script_path"] = self
            .script_file()
            .map(|_| serde_json::json!(STARTUP_SCRIPT))
            .unwrap_or(serde_json::Value::Null);
        json
    }
}

#[async_trait]
impl NodeBackend for UserPcNode {
    fn node_id(&self) -> Uuid {
        self.base.id()
    }

    fn node_name(&self) -> String {
        self.base.name().to_string()
    }

    fn status(&self) -> NodeStatus {
        // The monitor task may have observed an exit we have not.
        if self.base.status() == NodeStatus::Started && !self.is_running() {
            NodeStatus::Stopped
        } else {
            self.base.status()
        }
    }

    async fn start(&mut self) -> Result<(), NodeError> {
        UserPcNode::start(self).await
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        UserPcNode::stop(self).await
    }

    async fn close(&mut self) -> Result<bool, NodeError> {
        UserPcNode::close(self).await
    }

    async fn add_nio(
        &mut self,
        _adapter_number: usize,
        port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        self.port_add_nio_binding(port_number, nio).await
    }

    async fn update_nio(
        &mut self,
        _adapter_number: usize,
        port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        self.port_update_nio_binding(port_number, nio).await
    }

    async fn remove_nio(
        &mut self,
        _adapter_number: usize,
        port_number: usize,
    ) -> Result<Nio, NodeError> {
        self.port_remove_nio_binding(port_number).await
    }

    async fn start_capture(
        &mut self,
        _adapter_number: usize,
        port_number: usize,
        output_file: PathBuf,
        data_link_type: Option<String>,
    ) -> Result<(), NodeError> {
        self.start_port_capture(port_number, output_file, data_link_type)
            .await
    }

    async fn stop_capture(
        &mut self,
        _adapter_number: usize,
        port_number: usize,
    ) -> Result<(), NodeError> {
        self.stop_port_capture(port_number).await
    }
}

async fn resolve_ipv4(host: &str) -> Result<String, NodeError> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr.to_string());
    }
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|err| NodeError::Backend(format!("can't resolve hostname {host}: {err}")))?;
    addrs
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip().to_string())
        .ok_or_else(|| NodeError::Backend(format!("can't resolve hostname {host}")))
}

/// Creates and tracks userspace-PC nodes; hands out the per-project MAC
/// offsets their interfaces derive from.
pub struct UserPcManager {
    pool: Arc<PortPool>,
    runtime: NodeRuntime,
    nodes: Registry<UserPcNode>,
    mac_ids: std::sync::Mutex<HashMap<Uuid, HashMap<Uuid, u8>>>,
}

impl UserPcManager {
    pub fn new(pool: Arc<PortPool>, runtime: NodeRuntime) -> Self {
        Self {
            pool,
            runtime,
            nodes: Registry::new(),
            mac_ids: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_node(
        &self,
        name: impl Into<String>,
        project: Arc<Project>,
        node_id: Option<Uuid>,
        console: Option<u16>,
        startup_script: Option<String>,
    ) -> Result<Arc<Mutex<UserPcNode>>, NodeError> {
        let id = node_id.unwrap_or_else(Uuid::new_v4);
        let mac_id = self.lease_mac_id(project.id(), id)?;
        let node = match UserPcNode::new(
            name,
            id,
            project,
            self.pool.clone(),
            &self.runtime,
            mac_id,
            console,
            startup_script,
        ) {
            Ok(node) => node,
            Err(err) => {
                self.release_mac_id(id);
                return Err(err);
            }
        };
        Ok(self.nodes.insert(id, node).await)
    }

    pub async fn node(&self, node_id: Uuid) -> Result<Arc<Mutex<UserPcNode>>, NodeError> {
        self.nodes.get(node_id).await
    }

    /// Closes the node, removes its working directory and frees its MAC
    /// offset.
    pub async fn delete_node(&self, node_id: Uuid) -> Result<(), NodeError> {
        let node = self.node(node_id).await?;
        {
            let mut node = node.lock().await;
            node.close().await?;
            let project = node.base().project().clone();
            project
                .delete_node_working_directory(BACKEND, node_id)
                .await?;
        }
        self.nodes.remove(node_id).await;
        self.release_mac_id(node_id);
        Ok(())
    }

    /// Lowest free offset in [0, 255] for the project; stable per node.
    fn lease_mac_id(&self, project_id: Uuid, node_id: Uuid) -> Result<u8, NodeError> {
        let mut leases = self.mac_ids.lock().unwrap();
        let project_leases = leases.entry(project_id).or_default();
        if let Some(existing) = project_leases.get(&node_id) {
            return Ok(*existing);
        }
        let taken: std::collections::HashSet<u8> = project_leases.values().copied().collect();
        for candidate in 0..=255u8 {
            if !taken.contains(&candidate) {
                project_leases.insert(node_id, candidate);
                return Ok(candidate);
            }
        }
        Err(NodeError::Precondition(
            "no free MAC address offset left in this project".to_string(),
        ))
    }

    fn release_mac_id(&self, node_id: Uuid) {
        let mut leases = self.mac_ids.lock().unwrap();
        for project_leases in leases.values_mut() {
            project_leases.remove(&node_id);
        }
    }
}
