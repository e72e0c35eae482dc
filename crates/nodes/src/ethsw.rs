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

pub const BACKEND: &str = "ethsw";

const QINQ_ETHERTYPES: [&str; 4] = ["0x8100", "0x88A8", "0x9100", "0x9200"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchPortType {
    Access,
    Dot1q,
    Qinq,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchPort {
    pub name: String,
    pub port_number: usize,
    #[serde(rename = "type")]
    pub port_type: SwitchPortType,
    pub vlan: u16,
    /// Outer tag EtherType; qinq ports only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethertype: Option<String>,
}

impl SwitchPort {
    fn validate(&self) -> Result<(), NodeError> {
        if !(1..=4094).contains(&self.vlan) {
            return Err(NodeError::Precondition(format!(
                "VLAN {} on port {} is outside 1-4094",
                self.vlan, self.port_number
            )));
        }
        match (&self.port_type, &self.ethertype) {
            (SwitchPortType::Qinq, Some(ethertype)) => {
                if !QINQ_ETHERTYPES.contains(&ethertype.as_str()) {
                    return Err(NodeError::Precondition(format!(
                        "QinQ EtherType {ethertype} is not supported"
                    )));
                }
            }
            (SwitchPortType::Qinq, None) => {}
            (_, Some(_)) => {
                return Err(NodeError::Precondition(format!(
                    "EtherType is only valid on QinQ ports (port {})",
                    self.port_number
                )));
            }
            (_, None) => {}
        }
        Ok(())
    }
}

/// Hypervisor commands that wire and configure one switch port.
pub fn port_commands(
    switch: &str,
    port: &SwitchPort,
    nio: &Nio,
) -> Result<Vec<String>, NodeError> {
    let (lport, rhost, rport) = nio
        .as_udp()
        .ok_or_else(|| NodeError::Precondition("switch ports only take UDP NIOs".to_string()))?;
    let nio_name = nio_name(nio);

    let mut commands = vec![format!("bridge add_nio_udp {switch} {lport} {rhost} {rport}")];
    commands.push(match port.port_type {
        SwitchPortType::Access => {
            format!("ethsw set_access_port {switch} {nio_name} {}", port.vlan)
        }
        SwitchPortType::Dot1q => {
            format!("ethsw set_dot1q_port {switch} {nio_name} {}", port.vlan)
        }
        SwitchPortType::Qinq => match port.ethertype.as_deref() {
            // 0x8100 is the hypervisor default and stays implicit.
            Some(ethertype) if ethertype != "0x8100" => format!(
                "ethsw set_qinq_port {switch} {nio_name} {} {ethertype}",
                port.vlan
            ),
            _ => format!("ethsw set_qinq_port {switch} {nio_name} {}", port.vlan),
        },
    });
    Ok(commands)
}

fn nio_name(nio: &Nio) -> String {
    let (lport, _, _) = nio.as_udp().expect("checked by callers");
    format!("nio_udp_{lport}")
}

/// An emulated L2 switch: ports with access/dot1q/qinq tagging, realized as
/// one forwarding object on the bridge hypervisor.
pub struct EthernetSwitchNode {
    base: BaseNode,
    ports: Vec<SwitchPort>,
    nios: HashMap<usize, Nio>,
    created: bool,
}

impl EthernetSwitchNode {
    pub fn new(
        name: impl Into<String>,
        id: Uuid,
        project: Arc<Project>,
        pool: Arc<PortPool>,
        runtime: &NodeRuntime,
        ports: Option<Vec<SwitchPort>>,
    ) -> Result<Self, NodeError> {
        let mut base = BaseNode::new(
            name,
            id,
            project,
            pool,
            BACKEND,
            runtime.ubridge_path.clone(),
            NodeOptions {
                console_type: ConsoleType::None,
                ..NodeOptions::default()
            },
        )?;
        let ports = ports.unwrap_or_default();
        for port in &ports {
            port.validate()?;
        }
        // Builtin nodes are considered running as soon as they exist.
        base.set_status(NodeStatus::Started);
        Ok(Self {
            base,
            ports,
            nios: HashMap::new(),
            created: false,
        })
    }

    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut BaseNode {
        &mut self.base
    }

    fn switch_name(&self) -> String {
        format!("ethsw-{}", self.base.id())
    }

    pub fn ports(&self) -> &[SwitchPort] {
        &self.ports
    }

    fn port_settings(&self, port_number: usize) -> Result<SwitchPort, NodeError> {
        self.ports
            .iter()
            .find(|port| port.port_number == port_number)
            .cloned()
            .ok_or_else(|| {
                NodeError::Precondition(format!(
                    "port {port_number} is not configured on this switch"
                ))
            })
    }

    async fn ensure_switch(&mut self) -> Result<(), NodeError> {
        if !self.created {
            let name = self.switch_name();
            self.base.ubridge_send(format!("bridge create {name}")).await?;
            self.created = true;
        }
        Ok(())
    }

    /// Replaces the port table, re-tagging every connected port.
    pub async fn set_ports(&mut self, ports: Vec<SwitchPort>) -> Result<(), NodeError> {
        for port in &ports {
            port.validate()?;
        }
        self.ports = ports;
        let connected: Vec<(usize, Nio)> =
            self.nios.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (port_number, nio) in connected {
            let port = self.port_settings(port_number)?;
            let commands = port_commands(&self.switch_name(), &port, &nio)?;
            // Re-issue only the tagging command; the NIO is already attached.
            if let Some(tag) = commands.last() {
                self.base.ubridge_send(tag.clone()).await?;
            }
        }
        self.base.emit_updated();
        Ok(())
    }

    pub async fn rename(&mut self, name: impl Into<String>) -> Result<(), NodeError> {
        let name = name.into();
        if self.created {
            let command = format!("ethsw rename {} {name}", self.switch_name());
            self.base.ubridge_send(command).await?;
        }
        self.base.set_name(name);
        Ok(())
    }

    pub async fn port_add_nio_binding(
        &mut self,
        port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        let port = self.port_settings(port_number)?;
        self.ensure_switch().await?;
        for command in port_commands(&self.switch_name(), &port, &nio)? {
            self.base.ubridge_send(command).await?;
        }
        self.nios.insert(port_number, nio);
        tracing::info!(switch = %self.base.name(), port_number, "NIO added to switch port");
        Ok(())
    }

    pub async fn port_update_nio_binding(
        &mut self,
        port_number: usize,
        nio: Nio,
    ) -> Result<(), NodeError> {
        if !self.nios.contains_key(&port_number) {
            return Err(NodeError::Precondition(format!(
                "port {port_number} is not connected"
            )));
        }
        let name = self.switch_name();
        self.base
            .ubridge_apply_filters(&name, nio.filters().clone())
            .await?;
        self.nios.insert(port_number, nio);
        Ok(())
    }

    pub async fn port_remove_nio_binding(
        &mut self,
        port_number: usize,
    ) -> Result<Nio, NodeError> {
        let nio = self.nios.remove(&port_number).ok_or_else(|| {
            NodeError::Precondition(format!("port {port_number} is not connected"))
        })?;
        if self.created {
            let command = format!("ethsw remove_nio {} {}", self.switch_name(), nio_name(&nio));
            self.base.ubridge_send(command).await?;
        }
        if let Some(lport) = nio.lport() {
            self.base.release_udp_port(lport);
        }
        tracing::info!(switch = %self.base.name(), port_number, "NIO removed from switch port");
        Ok(nio)
    }

    pub async fn close(&mut self) -> Result<bool, NodeError> {
        if !self.base.close().await? {
            return Ok(false);
        }
        if self.created {
            let name = self.switch_name();
            if let Err(err) = self.base.ubridge_delete_bridge(&name).await {
                tracing::warn!(switch = %self.base.name(), %err, "switch teardown failed");
            }
            self.created = false;
        }
        for (_, nio) in std::mem::take(&mut self.nios) {
            if let Some(lport) = nio.lport() {
                self.base.release_udp_port(lport);
            }
        }
        self.base.stop_ubridge().await;
        Ok(true)
    }

    pub fn as_json(&self) -> serde_json::Value {
        let mut json = self.base.as_json();
        json["ports_mapping"] = serde_json::to_value(&self.ports).expect("ports serialize");
        json
    }
}

#[async_trait]
impl NodeBackend for EthernetSwitchNode {
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
        self.base.set_status(NodeStatus::Started);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        self.base.set_status(NodeStatus::Stopped);
        Ok(())
    }

    async fn close(&mut self) -> Result<bool, NodeError> {
        EthernetSwitchNode::close(self).await
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
}

pub struct EthernetSwitchManager {
    pool: Arc<PortPool>,
    runtime: NodeRuntime,
    nodes: Registry<EthernetSwitchNode>,
}

impl EthernetSwitchManager {
    pub fn new(pool: Arc<PortPool>, runtime: NodeRuntime) -> Self {
        Self {
            pool,
            runtime,
            nodes: Registry::new(),
        }
    }

    pub async fn create_node(
        &self,
        name: impl Into<String>,
        project: Arc<Project>,
        node_id: Option<Uuid>,
        ports: Option<Vec<SwitchPort>>,
    ) -> Result<Arc<Mutex<EthernetSwitchNode>>, NodeError> {
        let id = node_id.unwrap_or_else(Uuid::new_v4);
        let node = EthernetSwitchNode::new(
            name,
            id,
            project,
            self.pool.clone(),
            &self.runtime,
            ports,
        )?;
        Ok(self.nodes.insert(id, node).await)
    }

    pub async fn node(
        &self,
        node_id: Uuid,
    ) -> Result<Arc<Mutex<EthernetSwitchNode>>, NodeError> {
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

    fn port(number: usize, port_type: SwitchPortType, vlan: u16, ethertype: Option<&str>) -> SwitchPort {
        SwitchPort {
            name: format!("Ethernet{number}"),
            port_number: number,
            port_type,
            vlan,
            ethertype: ethertype.map(str::to_string),
        }
    }

    #[test]
    fn test_port_command_vocabulary() {
        let nio = Nio::udp(20000, "127.0.0.1", 20001);

        let access = port(0, SwitchPortType::Access, 1, None);
        assert_eq!(
            port_commands("ethsw-1", &access, &nio).unwrap(),
            vec![
                "bridge add_nio_udp ethsw-1 20000 127.0.0.1 20001",
                "ethsw set_access_port ethsw-1 nio_udp_20000 1",
            ],
        );

        let qinq = port(1, SwitchPortType::Qinq, 2, Some("0x88A8"));
        assert_eq!(
            port_commands("ethsw-1", &qinq, &nio).unwrap()[1],
            "ethsw set_qinq_port ethsw-1 nio_udp_20000 2 0x88A8",
        );

        let dot1q = port(2, SwitchPortType::Dot1q, 3, None);
        assert_eq!(
            port_commands("ethsw-1", &dot1q, &nio).unwrap()[1],
            "ethsw set_dot1q_port ethsw-1 nio_udp_20000 3",
        );

        // The default EtherType stays implicit.
        let qinq_default = port(3, SwitchPortType::Qinq, 4, Some("0x8100"));
        assert_eq!(
            port_commands("ethsw-1", &qinq_default, &nio).unwrap()[1],
            "ethsw set_qinq_port ethsw-1 nio_udp_20000 4",
        );
    }

    #[test]
    fn test_vlan_and_ethertype_validation() {
        assert!(port(0, SwitchPortType::Access, 0, None).validate().is_err());
        assert!(port(0, SwitchPortType::Access, 4095, None).validate().is_err());
        assert!(port(0, SwitchPortType::Access, 4094, None).validate().is_ok());

        assert!(port(0, SwitchPortType::Qinq, 1, Some("0x9200")).validate().is_ok());
        assert!(port(0, SwitchPortType::Qinq, 1, Some("0x1234")).validate().is_err());
        // EtherType on a non-qinq port is rejected.
        assert!(port(0, SwitchPortType::Access, 1, Some("0x88A8")).validate().is_err());
    }

    #[test]
    fn test_ports_serde_round_trip() {
        let ports = vec![
            port(0, SwitchPortType::Access, 1, None),
            port(1, SwitchPortType::Qinq, 2, Some("0x88A8")),
        ];
        let json = serde_json::to_value(&ports).unwrap();
        assert_eq!(json[0]["type"], "access");
        assert_eq!(json[1]["ethertype"], "0x88A8");
        let back: Vec<SwitchPort> = serde_json::from_value(json).unwrap();
        assert_eq!(back, ports);
    }
}
