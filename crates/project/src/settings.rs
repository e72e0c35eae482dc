use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

/// Compute-wide settings. Loading them (files, environment) is the server
/// shell's job; the runtime only consumes the resolved values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComputeSettings {
    pub projects_path: PathBuf,

    /// Address consoles and hypervisors bind to.
    pub console_host: IpAddr,

    pub console_start_port_range: u16,
    pub console_end_port_range: u16,
    pub vnc_console_start_port_range: u16,
    pub vnc_console_end_port_range: u16,
    pub udp_start_port_range: u16,
    pub udp_end_port_range: u16,

    /// Bridge hypervisor executable, resolved on the `$PATH` when relative.
    pub ubridge_path: String,

    /// Userspace-PC executable.
    pub vpcs_path: String,

    /// Container engine REST endpoint.
    pub docker_api_url: Url,

    /// Host directory mounted read-only into containers as `/gns3`
    /// (init script, busybox and friends).
    pub docker_resources_path: PathBuf,

    /// Host interface backing the NAT node.
    pub nat_interface: String,
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            projects_path: PathBuf::from("projects"),
            console_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            console_start_port_range: 5000,
            console_end_port_range: 10000,
            vnc_console_start_port_range: 5900,
            vnc_console_end_port_range: 10000,
            udp_start_port_range: 10000,
            udp_end_port_range: 20000,
            ubridge_path: "ubridge".to_string(),
            vpcs_path: "vpcs".to_string(),
            docker_api_url: Url::parse("http://127.0.0.1:2375").expect("static url"),
            docker_resources_path: PathBuf::from("resources/docker"),
            nat_interface: "virbr0".to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ComputeSettings::default();
        assert_eq!(settings.console_start_port_range, 5000);
        assert_eq!(settings.vnc_console_start_port_range, 5900);
        assert_eq!(settings.udp_end_port_range, 20000);
        assert_eq!(settings.ubridge_path, "ubridge");
    }

    #[test]
    fn test_partial_overrides_deserialize() {
        let settings: ComputeSettings = serde_json::from_value(serde_json::json!({
            "console_host": "127.0.0.1",
            "vpcs_path": "/opt/vpcs/bin/vpcs",
        }))
        .unwrap();
        assert_eq!(settings.console_host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(settings.vpcs_path, "/opt/vpcs/bin/vpcs");
        assert_eq!(settings.console_end_port_range, 10000);
    }
}
