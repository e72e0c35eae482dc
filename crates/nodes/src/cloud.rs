use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nio::Nio;
use ports::PortPool;
use project::Project;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    BaseNode, ConsoleType, NodeBackend, NodeError, NodeOptions, NodeRuntime, NodeStatus, Registry,
};

pub const BACKEND: &str = "cloud";
pub const NAT_BACKEND: &str = "nat";

/// Host network interface as seen by the platform layer. Discovery itself
/// lives outside the runtime; adapters only consume this description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInterface {
    pub name: String,
    /// Loopback, virtual tunnels and similar interfaces a cloud should not
    /// pre-fill.
    #[serde(default)]
    pub special: bool,
    #[serde(default)]
    pub mac_address: Option<String>,
}

/// Injected view of the host's interfaces.
pub trait InterfaceProvider: Send + Sync {
    fn interfaces(&self) -> Vec<HostInterface>;

    /// Whether `name` is a Linux software bridge (attachments then go
    /// through a dedicated TAP).
    fn is_bridge(&self, name: &str) -> bool {
        std::path::Path::new("/sys/class/net")
            .join(name)
            .join("bridge")
            .is_dir()
    }

    /// Whether `name` is a Wi-Fi adapter (libpcap cannot attach on macOS).
    fn is_wifi(&self, _name: &str) -> bool {
        false
    }
}

/// Fixed interface table, for tests and embedding.
pub struct StaticInterfaceProvider {
    pub interfaces: Vec<HostInterface>,
    pub bridges: Vec<String>,
    pub wifi: Vec<String>,
}

impl StaticInterfaceProvider {
    pub fn new(interfaces: Vec<HostInterface>) -> Self {
        Self {
            interfaces,
            bridges: Vec::new(),
            wifi: Vec::new(),
        }
    }
}

impl InterfaceProvider for StaticInterfaceProvider {
    fn interfaces(&self) -> Vec<HostInterface> {
        self.interfaces.clone()
    }

    fn is_bridge(&self, name: &str) -> bool {
        self.bridges.iter().any(|bridge| bridge == name)
    }

    fn is_wifi(&self, name: &str) -> bool {
        self.wifi.iter().any(|wifi| wifi == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CloudPortKind {
    Ethernet { interface: String },
    Tap { interface: String },
    Udp { lport: u16, rhost: String, rport: u16 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudPort {
    pub name: String,
    pub port_number: usize,
    #[serde(flatten)]
    pub kind: CloudPortKind,
}

/// A node that bridges virtual ports onto host interfaces or remote UDP
/// endpoints.
pub struct CloudNode {
    base: BaseNode,
    provider: Arc<dyn InterfaceProvider>,
    ports: Vec<CloudPort>,
    nios: HashMap<usize, Nio>,
    /// Host TAPs allocated for Linux bridge members, by port number.
    bridge_taps: HashMap<usize, String>,
}

impl CloudNode {
    pub fn new(
        name: impl Into<String>,
        id: Uuid,
        project: Arc<Project>,
        pool: Arc<PortPool>,
        runtime: &NodeRuntime,
        provider: Arc<dyn InterfaceProvider>,
        ports: Option<Vec<CloudPort>>,
    ) -> Result<Self, NodeError> {
        Self::with_backend(name, id, project, pool, runtime, provider, ports, BACKEND)
    }

    #[allow(clippy::too_many_arguments)]
    fn with_backend(
        name: impl Into<String>,
        id: Uuid,
        project: Arc<Project>,
        pool: Arc<PortPool>,
        runtime: &NodeRuntime,
        provider: Arc<dyn InterfaceProvider>,
        ports: Option<Vec<CloudPort>>,
        backend: &'static str,
    ) -> Result<Self, NodeError> {
        let base = BaseNode::new(
            name,
            id,
            project,
            pool,
            backend,
            runtime.ubridge_path.clone(),
            NodeOptions {
                console_type: ConsoleType::None,
                ..NodeOptions::default()
            },
        )?;
        let ports = match ports {
            Some(ports) => ports,
            // No mapping supplied: pre-fill with the host's regular
            // interfaces.
            None => provider
                .interfaces()
                .into_iter()
                .filter(|interface| !interface.special)
                .enumerate()
                .map(|(port_number, interface)| CloudPort {
                    name: interface.name.clone(),
                    port_number,
                    kind: CloudPortKind::Ethernet {
                        interface: interface.name,
                    },
                })
                .collect(),
        };
        Ok(Self {
            base,
            provider,
            ports,
            nios: HashMap::new(),
            bridge_taps: HashMap::new(),
        })
    }

    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut BaseNode {
        &mut self.base
    }

    pub fn ports(&self) -> &[CloudPort] {
        &self.ports
    }

    pub fn set_ports(&mut self, ports: Vec<CloudPort>) -> Result<(), NodeError> {
        if !self.nios.is_empty() {
            return Err(NodeError::Precondition(
                "cannot change the port mapping while ports are connected".to_string(),
            ));
        }
        self.ports = ports;
        self.base.emit_updated();
        Ok(())
    }

    fn bridge_name(&self, port_number: usize) -> String {
        format!("{}-{}", self.base.id(), port_number)
    }

    fn port(&self, port_number: usize) -> Result<CloudPort, NodeError> {
        self.ports
            .iter()
            .find(|port| port.port_number == port_number)
            .cloned()
            .ok_or_else(|| {
                NodeError::Precondition(format!("port {port_number} does not exist on this cloud"))
            })
    }

    /// Verifies the mapped host interfaces exist, then reports the node as
    /// started.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        let known: Vec<String> = self
            .provider
            .interfaces()
            .into_iter()
            .map(|interface| interface.name)
            .collect();
        for port in &self.ports {
            if let CloudPortKind::Ethernet { interface } = &port.kind {
                if !known.contains(interface) {
                    return Err(NodeError::Precondition(format!(
                        "interface {interface} does not exist on this host"
                    )));
                }
            }
        }
        self.base.set_status(NodeStatus::Started);
        Ok(())
    }

    pub async fn add_nio(&mut self, port_number: usize, nio: Nio) -> Result<(), NodeError> {
        let port = self.port(port_number)?;
        let bridge_name = self.bridge_name(port_number);
        let (lport, rhost, rport) = nio.as_udp().ok_or_else(|| {
            NodeError::Precondition("cloud ports only take UDP NIOs".to_string())
        })?;

        self.base
            .ubridge_send(format!("bridge create {bridge_name}"))
            .await?;
        self.base
            .ubridge_send(format!(
                "bridge add_nio_udp {bridge_name} {lport} {rhost} {rport}"
            ))
            .await?;

        match &port.kind {
            CloudPortKind::Ethernet { interface } => {
                self.attach_host_interface(&bridge_name, port_number, interface.clone())
                    .await?;
            }
            CloudPortKind::Tap { interface } => {
                self.base
                    .ubridge_send(format!("bridge add_nio_tap {bridge_name} \"{interface}\""))
                    .await?;
            }
            CloudPortKind::Udp {
                lport,
                rhost,
                rport,
            } => {
                self.base
                    .ubridge_send(format!(
                        "bridge add_nio_udp {bridge_name} {lport} {rhost} {rport}"
                    ))
                    .await?;
            }
        }

        if nio.capturing() {
            if let Some(pcap_file) = nio.pcap_file() {
                self.base
                    .ubridge_send(format!(
                        "bridge start_capture {bridge_name} \"{}\"",
                        pcap_file.display()
                    ))
                    .await?;
            }
        }

        self.base
            .ubridge_send(format!("bridge start {bridge_name}"))
            .await?;
        self.base
            .ubridge_apply_filters(&bridge_name, nio.filters().clone())
            .await?;

        self.nios.insert(port_number, nio);
        tracing::info!(cloud = %self.base.name(), port_number, "NIO added to cloud port");
        Ok(())
    }

    async fn attach_host_interface(
        &mut self,
        bridge_name: &str,
        port_number: usize,
        interface: String,
    ) -> Result<(), NodeError> {
        if cfg!(target_os = "linux") {
            if self.provider.is_bridge(&interface) {
                // A bridge member interface cannot be attached raw; hang a
                // dedicated TAP off the bridge instead.
                let tap = self.allocate_bridge_tap(port_number);
                self.base
                    .ubridge_send(format!("bridge add_nio_tap {bridge_name} \"{tap}\""))
                    .await?;
                self.base
                    .ubridge_send(format!("brctl addif \"{interface}\" \"{tap}\""))
                    .await?;
                return Ok(());
            }
            self.base
                .add_ubridge_ethernet_connection(bridge_name, &interface, false, None)
                .await
        } else if cfg!(target_os = "macos") {
            if self.provider.is_wifi(&interface) {
                return Err(NodeError::Precondition(format!(
                    "connecting to a Wi-Fi adapter ({interface}) is not supported on macOS"
                )));
            }
            if interface.starts_with("vmnet") {
                // libpcap cannot open VMware vmnet interfaces on macOS.
                self.base
                    .ubridge_send(format!(
                        "bridge add_nio_fusion_vmnet {bridge_name} \"{interface}\""
                    ))
                    .await?;
                return Ok(());
            }
            let mac = self.interface_mac(&interface);
            self.base
                .add_ubridge_ethernet_connection(bridge_name, &interface, false, mac.as_deref())
                .await
        } else {
            let mac = self.interface_mac(&interface);
            self.base
                .add_ubridge_ethernet_connection(bridge_name, &interface, false, mac.as_deref())
                .await
        }
    }

    fn interface_mac(&self, interface: &str) -> Option<String> {
        self.provider
            .interfaces()
            .into_iter()
            .find(|candidate| candidate.name == interface)
            .and_then(|candidate| candidate.mac_address)
    }

    fn allocate_bridge_tap(&mut self, port_number: usize) -> String {
        let taken: Vec<&String> = self.bridge_taps.values().collect();
        let mut index = 0;
        loop {
            let tap = format!("gns3tap{index}-{port_number}");
            if !taken.contains(&&tap) {
                self.bridge_taps.insert(port_number, tap.clone());
                return tap;
            }
            index += 1;
        }
    }

    pub async fn update_nio(&mut self, port_number: usize, nio: Nio) -> Result<(), NodeError> {
        if !self.nios.contains_key(&port_number) {
            return Err(NodeError::Precondition(format!(
                "port {port_number} is not connected"
            )));
        }
        let bridge_name = self.bridge_name(port_number);
        self.base
            .ubridge_apply_filters(&bridge_name, nio.filters().clone())
            .await?;
        self.nios.insert(port_number, nio);
        Ok(())
    }

    pub async fn remove_nio(&mut self, port_number: usize) -> Result<Nio, NodeError> {
        let nio = self.nios.remove(&port_number).ok_or_else(|| {
            NodeError::Precondition(format!("port {port_number} is not connected"))
        })?;
        let bridge_name = self.bridge_name(port_number);
        self.base.ubridge_delete_bridge(&bridge_name).await?;
        self.bridge_taps.remove(&port_number);
        if let Some(lport) = nio.lport() {
            self.base.release_udp_port(lport);
        }
        tracing::info!(cloud = %self.base.name(), port_number, "NIO removed from cloud port");
        Ok(nio)
    }

    pub async fn start_port_capture(
        &mut self,
        port_number: usize,
        output_file: std::path::PathBuf,
        data_link_type: Option<String>,
    ) -> Result<(), NodeError> {
        let bridge_name = self.bridge_name(port_number);
        let nio = self.nios.get_mut(&port_number).ok_or_else(|| {
            NodeError::Precondition(format!("port {port_number} is not connected"))
        })?;
        if nio.capturing() {
            return Err(NodeError::Precondition(format!(
                "packet capture is already activated on port {port_number}"
            )));
        }
        nio.start_capture(&output_file, data_link_type);
        let link_type = nio.pcap_link_type().to_string();
        self.base
            .ubridge_send(format!(
                "bridge start_capture {bridge_name} \"{}\" {link_type}",
                output_file.display()
            ))
            .await?;
        Ok(())
    }

    pub async fn stop_port_capture(&mut self, port_number: usize) -> Result<(), NodeError> {
        let bridge_name = self.bridge_name(port_number);
        let nio = self.nios.get_mut(&port_number).ok_or_else(|| {
            NodeError::Precondition(format!("port {port_number} is not connected"))
        })?;
        nio.stop_capture();
        self.base
            .ubridge_send(format!("bridge stop_capture {bridge_name}"))
            .await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<bool, NodeError> {
        if !self.base.close().await? {
            return Ok(false);
        }
        let connected: Vec<usize> = self.nios.keys().copied().collect();
        for port_number in connected {
            let bridge_name = self.bridge_name(port_number);
            if let Err(err) = self.base.ubridge_delete_bridge(&bridge_name).await {
                tracing::warn!(cloud = %self.base.name(), %err, "bridge teardown failed");
            }
            if let Some(nio) = self.nios.remove(&port_number) {
                if let Some(lport) = nio.lport() {
                    self.base.release_udp_port(lport);
                }
            }
        }
        self.base.stop_ubridge().await;
        Ok(true)
    }

    pub fn as_json(&self) -> serde_json::Value {
        let mut json = self.base.as_json();
        json["ports_mapping"] = serde_json::to_value(&self.ports).expect("ports serialize");
        json["interfaces"] = serde_json::to_value(self.provider.interfaces()).expect("serialize");
        json
    }
}

#[async_trait]
impl NodeBackend for CloudNode {
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
        CloudNode::start(self).await
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        self.base.set_status(NodeStatus::Stopped);
        Ok(())
    }

    async fn close(&mut self) -> Result<bool, NodeError> {
        CloudNode::close(self).await
    }

    async fn add_nio(
        &mut self,
        _adapter_number: usize,
        port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        CloudNode::add_nio(self, port_number, nio).await
    }

    async fn update_nio(
        &mut self,
        _adapter_number: usize,
        port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        CloudNode::update_nio(self, port_number, nio).await
    }

    async fn remove_nio(
        &mut self,
        _adapter_number: usize,
        port_number: usize,
    ) -> Result<Nio, NodeError> {
        CloudNode::remove_nio(self, port_number).await
    }

    async fn start_capture(
        &mut self,
        _adapter_number: usize,
        port_number: usize,
        output_file: std::path::PathBuf,
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

/// A cloud pinned to the single host interface that provides NAT, with its
/// presence verified up front.
pub struct NatNode {
    inner: CloudNode,
}

impl std::fmt::Debug for NatNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatNode").finish_non_exhaustive()
    }
}

impl NatNode {
    pub fn new(
        name: impl Into<String>,
        id: Uuid,
        project: Arc<Project>,
        pool: Arc<PortPool>,
        runtime: &NodeRuntime,
        provider: Arc<dyn InterfaceProvider>,
    ) -> Result<Self, NodeError> {
        let interface = runtime.nat_interface.clone();
        let present = provider
            .interfaces()
            .iter()
            .any(|candidate| candidate.name == interface);
        if !present {
            return Err(NodeError::Precondition(format!(
                "NAT interface {interface} is missing, please install the host-side VM support"
            )));
        }
        let ports = vec![CloudPort {
            name: "nat0".to_string(),
            port_number: 0,
            kind: CloudPortKind::Ethernet { interface },
        }];
        let inner = CloudNode::with_backend(
            name,
            id,
            project,
            pool,
            runtime,
            provider,
            Some(ports),
            NAT_BACKEND,
        )?;
        Ok(Self { inner })
    }

    pub fn cloud(&self) -> &CloudNode {
        &self.inner
    }

    pub fn cloud_mut(&mut self) -> &mut CloudNode {
        &mut self.inner
    }
}

#[async_trait]
impl NodeBackend for NatNode {
    fn node_id(&self) -> Uuid {
        self.inner.node_id()
    }

    fn node_name(&self) -> String {
        self.inner.node_name()
    }

    fn status(&self) -> NodeStatus {
        self.inner.status()
    }

    async fn start(&mut self) -> Result<(), NodeError> {
        self.inner.start().await
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        NodeBackend::stop(&mut self.inner).await
    }

    async fn close(&mut self) -> Result<bool, NodeError> {
        self.inner.close().await
    }

    async fn add_nio(
        &mut self,
        adapter_number: usize,
        port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        NodeBackend::add_nio(&mut self.inner, adapter_number, port_number, nio).await
    }

    async fn update_nio(
        &mut self,
        adapter_number: usize,
        port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        NodeBackend::update_nio(&mut self.inner, adapter_number, port_number, nio).await
    }

    async fn remove_nio(
        &mut self,
        adapter_number: usize,
        port_number: usize,
    ) -> Result<Nio, NodeError> {
        NodeBackend::remove_nio(&mut self.inner, adapter_number, port_number).await
    }
}

pub struct CloudManager {
    pool: Arc<PortPool>,
    runtime: NodeRuntime,
    provider: Arc<dyn InterfaceProvider>,
    clouds: Registry<CloudNode>,
    nats: Registry<NatNode>,
}

impl CloudManager {
    pub fn new(
        pool: Arc<PortPool>,
        runtime: NodeRuntime,
        provider: Arc<dyn InterfaceProvider>,
    ) -> Self {
        Self {
            pool,
            runtime,
            provider,
            clouds: Registry::new(),
            nats: Registry::new(),
        }
    }

    pub async fn create_cloud(
        &self,
        name: impl Into<String>,
        project: Arc<Project>,
        node_id: Option<Uuid>,
        ports: Option<Vec<CloudPort>>,
    ) -> Result<Arc<Mutex<CloudNode>>, NodeError> {
        let id = node_id.unwrap_or_else(Uuid::new_v4);
        let node = CloudNode::new(
            name,
            id,
            project,
            self.pool.clone(),
            &self.runtime,
            self.provider.clone(),
            ports,
        )?;
        Ok(self.clouds.insert(id, node).await)
    }

    pub async fn create_nat(
        &self,
        name: impl Into<String>,
        project: Arc<Project>,
        node_id: Option<Uuid>,
    ) -> Result<Arc<Mutex<NatNode>>, NodeError> {
        let id = node_id.unwrap_or_else(Uuid::new_v4);
        let node = NatNode::new(
            name,
            id,
            project,
            self.pool.clone(),
            &self.runtime,
            self.provider.clone(),
        )?;
        Ok(self.nats.insert(id, node).await)
    }

    pub async fn cloud(&self, node_id: Uuid) -> Result<Arc<Mutex<CloudNode>>, NodeError> {
        self.clouds.get(node_id).await
    }

    pub async fn nat(&self, node_id: Uuid) -> Result<Arc<Mutex<NatNode>>, NodeError> {
        self.nats.get(node_id).await
    }

    pub async fn delete_cloud(&self, node_id: Uuid) -> Result<(), NodeError> {
        let node = self.clouds.get(node_id).await?;
        {
            let mut node = node.lock().await;
            node.close().await?;
            let project = node.base().project().clone();
            project
                .delete_node_working_directory(BACKEND, node_id)
                .await?;
        }
        self.clouds.remove(node_id).await;
        Ok(())
    }

    pub async fn delete_nat(&self, node_id: Uuid) -> Result<(), NodeError> {
        let node = self.nats.get(node_id).await?;
        {
            let mut node = node.lock().await;
            node.close().await?;
            let project = node.cloud().base().project().clone();
            project
                .delete_node_working_directory(NAT_BACKEND, node_id)
                .await?;
        }
        self.nats.remove(node_id).await;
        Ok(())
    }
}
