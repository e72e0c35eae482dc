//! L2 switch and cloud wiring against a scripted in-process hypervisor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge::{BridgeClient, BridgeProcess};
use nio::Nio;
use nodes::cloud::{CloudNode, CloudPort, CloudPortKind, HostInterface, StaticInterfaceProvider};
use nodes::ethsw::{EthernetSwitchNode, SwitchPort, SwitchPortType};
use nodes::NodeRuntime;
use ports::PortPool;
use project::{ComputeSettings, Project};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use uuid::Uuid;

struct FakeHypervisor {
    port: u16,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeHypervisor {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands: Arc<Mutex<Vec<String>>> = Arc::default();

        let recorded = commands.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (reader, mut writer) = stream.into_split();
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    recorded.lock().unwrap().push(line.clone());
                    if writer.write_all(b"100-OK\r\n").await.is_err() {
                        return;
                    }
                }
            }
        });
        Self { port, commands }
    }

    fn bridge_commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|command| !command.starts_with("hypervisor "))
            .cloned()
            .collect()
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    project: Arc<Project>,
    pool: Arc<PortPool>,
    runtime: NodeRuntime,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    Fixture {
        project: Arc::new(Project::new(dir.path(), Uuid::new_v4()).unwrap()),
        _dir: dir,
        pool: Arc::new(PortPool::default()),
        runtime: NodeRuntime::from_settings(&ComputeSettings::default()),
    }
}

async fn attach(hypervisor: &FakeHypervisor, base: &mut nodes::BaseNode) {
    let client = BridgeClient::new("127.0.0.1", hypervisor.port);
    client.connect(Duration::from_secs(5)).await.unwrap();
    base.attach_ubridge(BridgeProcess::attach(client, base.working_dir()));
}

fn switch_port(
    number: usize,
    port_type: SwitchPortType,
    vlan: u16,
    ethertype: Option<&str>,
) -> SwitchPort {
    SwitchPort {
        name: format!("Ethernet{number}"),
        port_number: number,
        port_type,
        vlan,
        ethertype: ethertype.map(str::to_string),
    }
}

#[tokio::test]
async fn test_switch_port_tagging_vocabulary() {
    let fx = fixture();
    let hypervisor = FakeHypervisor::spawn().await;
    let id = Uuid::new_v4();
    let mut switch = EthernetSwitchNode::new(
        "Switch1",
        id,
        fx.project.clone(),
        fx.pool.clone(),
        &fx.runtime,
        Some(vec![
            switch_port(0, SwitchPortType::Access, 1, None),
            switch_port(1, SwitchPortType::Qinq, 2, Some("0x88A8")),
            switch_port(2, SwitchPortType::Dot1q, 3, None),
            switch_port(3, SwitchPortType::Access, 4, None),
        ]),
    )
    .unwrap();
    attach(&hypervisor, switch.base_mut()).await;

    for (port_number, lport) in [(0usize, 20000u16), (1, 20002), (2, 20004), (3, 20006)] {
        switch
            .port_add_nio_binding(port_number, Nio::udp(lport, "127.0.0.1", lport + 1))
            .await
            .unwrap();
    }

    let sw = format!("ethsw-{id}");
    assert_eq!(
        hypervisor.bridge_commands(),
        vec![
            format!("bridge create {sw}"),
            format!("bridge add_nio_udp {sw} 20000 127.0.0.1 20001"),
            format!("ethsw set_access_port {sw} nio_udp_20000 1"),
            format!("bridge add_nio_udp {sw} 20002 127.0.0.1 20003"),
            format!("ethsw set_qinq_port {sw} nio_udp_20002 2 0x88A8"),
            format!("bridge add_nio_udp {sw} 20004 127.0.0.1 20005"),
            format!("ethsw set_dot1q_port {sw} nio_udp_20004 3"),
            format!("bridge add_nio_udp {sw} 20006 127.0.0.1 20007"),
            format!("ethsw set_access_port {sw} nio_udp_20006 4"),
        ],
    );

    // Closing the switch deletes its forwarding object exactly once.
    assert!(switch.close().await.unwrap());
    assert_eq!(
        hypervisor.bridge_commands().last().unwrap(),
        &format!("bridge delete {sw}"),
    );
    assert!(!switch.close().await.unwrap());
}

#[tokio::test]
async fn test_switch_rename_propagates() {
    let fx = fixture();
    let hypervisor = FakeHypervisor::spawn().await;
    let id = Uuid::new_v4();
    let mut switch = EthernetSwitchNode::new(
        "Switch1",
        id,
        fx.project.clone(),
        fx.pool.clone(),
        &fx.runtime,
        Some(vec![switch_port(0, SwitchPortType::Access, 1, None)]),
    )
    .unwrap();
    attach(&hypervisor, switch.base_mut()).await;

    switch
        .port_add_nio_binding(0, Nio::udp(20000, "127.0.0.1", 20001))
        .await
        .unwrap();
    switch.rename("Backbone").await.unwrap();

    assert_eq!(
        hypervisor.bridge_commands().last().unwrap(),
        &format!("ethsw rename ethsw-{id} Backbone"),
    );
    assert_eq!(switch.base().name(), "Backbone");
}

#[tokio::test]
async fn test_cloud_udp_port_wiring() {
    let fx = fixture();
    let hypervisor = FakeHypervisor::spawn().await;
    let provider = Arc::new(StaticInterfaceProvider::new(vec![HostInterface {
        name: "eth0".to_string(),
        special: false,
        mac_address: None,
    }]));
    let id = Uuid::new_v4();
    let mut cloud = CloudNode::new(
        "Cloud1",
        id,
        fx.project.clone(),
        fx.pool.clone(),
        &fx.runtime,
        provider,
        Some(vec![CloudPort {
            name: "UDP tunnel 1".to_string(),
            port_number: 0,
            kind: CloudPortKind::Udp {
                lport: 30000,
                rhost: "127.0.0.1".to_string(),
                rport: 30001,
            },
        }]),
    )
    .unwrap();
    attach(&hypervisor, cloud.base_mut()).await;

    cloud
        .add_nio(0, Nio::udp(20000, "127.0.0.1", 20001))
        .await
        .unwrap();

    assert_eq!(
        hypervisor.bridge_commands(),
        vec![
            format!("bridge create {id}-0"),
            format!("bridge add_nio_udp {id}-0 20000 127.0.0.1 20001"),
            format!("bridge add_nio_udp {id}-0 30000 127.0.0.1 30001"),
            format!("bridge start {id}-0"),
            format!("bridge reset_packet_filters {id}-0"),
        ],
    );

    // Removing the NIO deletes the per-port bridge.
    cloud.remove_nio(0).await.unwrap();
    assert_eq!(
        hypervisor.bridge_commands().last().unwrap(),
        &format!("bridge delete {id}-0"),
    );
}

#[tokio::test]
async fn test_cloud_tap_port_wiring() {
    let fx = fixture();
    let hypervisor = FakeHypervisor::spawn().await;
    let provider = Arc::new(StaticInterfaceProvider::new(Vec::new()));
    let id = Uuid::new_v4();
    let mut cloud = CloudNode::new(
        "Cloud1",
        id,
        fx.project.clone(),
        fx.pool.clone(),
        &fx.runtime,
        provider,
        Some(vec![CloudPort {
            name: "tap0".to_string(),
            port_number: 0,
            kind: CloudPortKind::Tap {
                interface: "tap0".to_string(),
            },
        }]),
    )
    .unwrap();
    attach(&hypervisor, cloud.base_mut()).await;

    cloud
        .add_nio(0, Nio::udp(20000, "127.0.0.1", 20001))
        .await
        .unwrap();

    assert!(hypervisor
        .bridge_commands()
        .contains(&format!("bridge add_nio_tap {id}-0 \"tap0\"")));
}
