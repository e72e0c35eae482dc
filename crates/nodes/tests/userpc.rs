//! Userspace-PC adapter: command building, startup scripts, MAC leasing.

use std::sync::Arc;

use nodes::userpc::{UserPcManager, UserPcNode};
use nodes::NodeRuntime;
use ports::PortPool;
use project::{ComputeSettings, Project};
use uuid::Uuid;

struct Fixture {
    _dir: tempfile::TempDir,
    _bin: tempfile::TempDir,
    project: Arc<Project>,
    pool: Arc<PortPool>,
    runtime: NodeRuntime,
}

fn fixture_with_version(version: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let bin = tempfile::tempdir().unwrap();

    let vpcs = bin.path().join("vpcs");
    std::fs::write(
        &vpcs,
        format!("#!/bin/sh\necho 'Welcome to Virtual PC Simulator, version {version}'\n"),
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&vpcs, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut settings = ComputeSettings::default();
    settings.vpcs_path = vpcs.display().to_string();
    Fixture {
        project: Arc::new(Project::new(dir.path(), Uuid::new_v4()).unwrap()),
        _dir: dir,
        _bin: bin,
        pool: Arc::new(PortPool::default()),
        runtime: NodeRuntime::from_settings(&settings),
    }
}

fn node(fx: &Fixture, startup_script: Option<String>) -> UserPcNode {
    UserPcNode::new(
        "PC1",
        Uuid::new_v4(),
        fx.project.clone(),
        fx.pool.clone(),
        &fx.runtime,
        7,
        None,
        startup_script,
    )
    .unwrap()
}

fn arg_after<'a>(command: &'a [String], flag: &str) -> Option<&'a str> {
    command
        .iter()
        .position(|arg| arg == flag)
        .and_then(|index| command.get(index + 1))
        .map(String::as_str)
}

#[tokio::test]
async fn test_build_command() {
    let fx = fixture_with_version("0.8.2");
    let mut node = node(&fx, None);

    let path = node.check_requirements().await.unwrap();
    let command = node.build_command(&path).await.unwrap();

    assert_eq!(
        arg_after(&command, "-p").unwrap(),
        node.base().internal_console_port().unwrap().to_string(),
    );
    assert_eq!(arg_after(&command, "-m").unwrap(), "7");
    assert_eq!(arg_after(&command, "-i").unwrap(), "1");
    assert!(command.contains(&"-F".to_string()));
    // Relay is disabled on 0.8+.
    assert!(command.contains(&"-R".to_string()));
    assert_eq!(arg_after(&command, "-t").unwrap(), "127.0.0.1");

    // The two tunnel ports are distinct UDP reservations.
    let lport: u16 = arg_after(&command, "-s").unwrap().parse().unwrap();
    let rport: u16 = arg_after(&command, "-c").unwrap().parse().unwrap();
    assert_ne!(lport, rport);
    assert!(fx.pool.reserve_udp(lport, fx.project.id()).is_err());
    assert!(fx.pool.reserve_udp(rport, fx.project.id()).is_err());
}

#[tokio::test]
async fn test_relay_flag_needs_recent_version() {
    let fx = fixture_with_version("0.6.1");
    let mut node = node(&fx, None);
    let path = node.check_requirements().await.unwrap();
    let command = node.build_command(&path).await.unwrap();
    assert!(!command.contains(&"-R".to_string()));
}

#[tokio::test]
async fn test_version_gate() {
    let fx = fixture_with_version("0.5");
    let mut node = node(&fx, None);
    let err = node.check_requirements().await.unwrap_err();
    assert!(err.to_string().contains(">= 0.6.1"));
}

#[tokio::test]
async fn test_startup_script_appended_to_command() {
    let fx = fixture_with_version("0.8.2");
    let mut node = node(&fx, Some("set pcname %h\nip dhcp\n".to_string()));

    // %h was substituted with the node name.
    let script = node.startup_script().unwrap().unwrap();
    assert!(script.contains("set pcname PC1"));

    let path = node.check_requirements().await.unwrap();
    let command = node.build_command(&path).await.unwrap();
    assert_eq!(command.last().unwrap(), "startup.vpc");
}

#[tokio::test]
async fn test_rename_rewrites_pcname() {
    let fx = fixture_with_version("0.8.2");
    let mut node = node(&fx, Some("set pcname %h\nip dhcp\n".to_string()));

    node.set_name("PC2").unwrap();
    assert_eq!(node.base().name(), "PC2");
    let script = node.startup_script().unwrap().unwrap();
    assert!(script.contains("set pcname PC2"));
    assert!(!script.contains("PC1"));
}

#[tokio::test]
async fn test_close_releases_tunnel_ports() {
    let fx = fixture_with_version("0.8.2");
    let mut node = node(&fx, None);

    let path = node.check_requirements().await.unwrap();
    let command = node.build_command(&path).await.unwrap();
    let lport: u16 = arg_after(&command, "-s").unwrap().parse().unwrap();
    let rport: u16 = arg_after(&command, "-c").unwrap().parse().unwrap();

    assert!(node.close().await.unwrap());
    assert_eq!(fx.pool.reserve_udp(lport, fx.project.id()).unwrap(), lport);
    assert_eq!(fx.pool.reserve_udp(rport, fx.project.id()).unwrap(), rport);

    assert!(!node.close().await.unwrap());
}

#[tokio::test]
async fn test_mac_ids_are_leased_per_project() {
    let fx = fixture_with_version("0.8.2");
    let manager = UserPcManager::new(fx.pool.clone(), fx.runtime.clone());

    let first = manager
        .create_node("PC1", fx.project.clone(), None, None, None)
        .await
        .unwrap();
    let second = manager
        .create_node("PC2", fx.project.clone(), None, None, None)
        .await
        .unwrap();
    assert_eq!(first.lock().await.mac_id(), 0);
    assert_eq!(second.lock().await.mac_id(), 1);

    let first_id = first.lock().await.base().id();
    manager.delete_node(first_id).await.unwrap();

    // Freed offsets are reused.
    let third = manager
        .create_node("PC3", fx.project.clone(), None, None, None)
        .await
        .unwrap();
    assert_eq!(third.lock().await.mac_id(), 0);
}
