use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LINK_TYPE: &str = "DLT_EN10MB";

/// Ordered packet-filter map: filter kind -> parameter list. Iteration order
/// is insertion order, which fixes the order filters are applied in on the
/// forwarding bridge.
pub type FilterMap = IndexMap<String, Vec<serde_json::Value>>;

/// One endpoint of a virtual point-to-point link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Endpoint {
    #[serde(rename = "nio_udp")]
    Udp {
        lport: u16,
        rhost: String,
        rport: u16,
    },
    #[serde(rename = "nio_ethernet")]
    Ethernet { ethernet_device: String },
    #[serde(rename = "nio_tap")]
    Tap { tap_device: String },
    #[serde(rename = "nio_vmnet")]
    Vmnet { vmnet: String },
}

/// A link endpoint together with its capture sink and packet filters.
///
/// Construction never performs I/O; capture and filter mutations only record
/// intent here. The owning node is responsible for replaying them onto the
/// forwarding bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nio {
    #[serde(flatten)]
    endpoint: Endpoint,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    suspend: bool,

    #[serde(default, skip_serializing_if = "FilterMap::is_empty")]
    filters: FilterMap,

    #[serde(skip)]
    capturing: bool,

    #[serde(skip)]
    pcap_file: Option<PathBuf>,

    #[serde(skip)]
    pcap_link_type: Option<String>,
}

impl From<Endpoint> for Nio {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            suspend: false,
            filters: FilterMap::new(),
            capturing: false,
            pcap_file: None,
            pcap_link_type: None,
        }
    }
}

impl Nio {
    pub fn udp(lport: u16, rhost: impl Into<String>, rport: u16) -> Self {
        Endpoint::Udp {
            lport,
            rhost: rhost.into(),
            rport,
        }
        .into()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.endpoint, Endpoint::Udp { .. })
    }

    /// Local UDP port, when this is a UDP endpoint.
    pub fn lport(&self) -> Option<u16> {
        match &self.endpoint {
            Endpoint::Udp { lport, .. } => Some(*lport),
            _ => None,
        }
    }

    pub fn as_udp(&self) -> Option<(u16, &str, u16)> {
        match &self.endpoint {
            Endpoint::Udp {
                lport,
                rhost,
                rport,
            } => Some((*lport, rhost.as_str(), *rport)),
            _ => None,
        }
    }

    pub fn suspended(&self) -> bool {
        self.suspend
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspend = suspended;
    }

    pub fn capturing(&self) -> bool {
        self.capturing
    }

    pub fn pcap_file(&self) -> Option<&Path> {
        self.pcap_file.as_deref()
    }

    pub fn pcap_link_type(&self) -> &str {
        self.pcap_link_type.as_deref().unwrap_or(DEFAULT_LINK_TYPE)
    }

    /// Records a capture sink. The actual `bridge start_capture` is issued by
    /// the owning node.
    pub fn start_capture(&mut self, pcap_file: impl Into<PathBuf>, link_type: Option<String>) {
        self.capturing = true;
        self.pcap_file = Some(pcap_file.into());
        self.pcap_link_type = link_type;
    }

    pub fn stop_capture(&mut self) {
        self.capturing = false;
        self.pcap_file = None;
        self.pcap_link_type = None;
    }

    pub fn filters(&self) -> &FilterMap {
        &self.filters
    }

    /// Replaces the whole filter map. Observers treat the map as a snapshot;
    /// the owner re-applies it to the bridge after every change.
    pub fn set_filters(&mut self, filters: FilterMap) {
        self.filters = filters;
    }

    /// Builds the ordered `filterN <kind> <args…>` argument strings for
    /// `bridge add_packet_filter`.
    ///
    /// A string-valued first parameter is quoted, and a multi-line string
    /// (a BPF program per line) expands into one numbered filter per line.
    /// Other parameters are appended space-separated.
    pub fn filter_commands(&self) -> Vec<String> {
        build_filter_commands(&self.filters)
    }
}

pub fn build_filter_commands(filters: &FilterMap) -> Vec<String> {
    let mut commands = Vec::new();
    let mut index = 0;
    for (kind, values) in filters {
        match values.split_first() {
            Some((serde_json::Value::String(program), rest)) => {
                // One numbered filter per line, blank lines included: the
                // slot a later replacement targets depends on it.
                for line in program.split('\n') {
                    let line = line.trim();
                    let mut cmd = format!("filter{index} {kind} \"{line}\"");
                    for value in rest {
                        cmd.push(' ');
                        cmd.push_str(&format_value(value));
                    }
                    commands.push(cmd);
                    index += 1;
                }
            }
            Some(_) => {
                let args: Vec<String> = values.iter().map(format_value).collect();
                commands.push(format!("filter{index} {kind} {}", args.join(" ")));
                index += 1;
            }
            None => {
                commands.push(format!("filter{index} {kind}"));
                index += 1;
            }
        }
    }
    commands
}

fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn filters(pairs: &[(&str, &[serde_json::Value])]) -> FilterMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn test_udp_round_trip() {
        let nio = Nio::udp(4242, "127.0.0.1", 4343);
        let json = serde_json::to_value(&nio).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "nio_udp", "lport": 4242, "rhost": "127.0.0.1", "rport": 4343})
        );
        let back: Nio = serde_json::from_value(json).unwrap();
        assert_eq!(back, nio);
    }

    #[test]
    fn test_wire_form_snapshot() {
        let nio = Nio::udp(4242, "127.0.0.1", 4343);
        insta::assert_json_snapshot!(nio, @r###"
        {
          "type": "nio_udp",
          "lport": 4242,
          "rhost": "127.0.0.1",
          "rport": 4343
        }
        "###);
    }

    #[test]
    fn test_deserialize_variants() {
        let eth: Nio =
            serde_json::from_value(serde_json::json!({"type": "nio_ethernet", "ethernet_device": "eth0"}))
                .unwrap();
        assert!(matches!(eth.endpoint(), Endpoint::Ethernet { ethernet_device } if ethernet_device == "eth0"));

        let tap: Nio =
            serde_json::from_value(serde_json::json!({"type": "nio_tap", "tap_device": "tap0"})).unwrap();
        assert!(matches!(tap.endpoint(), Endpoint::Tap { tap_device } if tap_device == "tap0"));

        let vmnet: Nio =
            serde_json::from_value(serde_json::json!({"type": "nio_vmnet", "vmnet": "vmnet8"})).unwrap();
        assert!(!vmnet.is_udp());
    }

    #[test]
    fn test_filters_preserve_json_order() {
        let nio: Nio = serde_json::from_value(serde_json::json!({
            "type": "nio_udp", "lport": 1, "rhost": "127.0.0.1", "rport": 2,
            "filters": {"latency": [10], "bpf": ["icmp"]},
        }))
        .unwrap();
        assert_eq!(
            nio.filter_commands(),
            vec!["filter0 latency 10", "filter1 bpf \"icmp\""],
        );
    }

    #[test]
    fn test_filter_numbering_is_global_and_ordered() {
        let map = filters(&[
            ("freq_drop", &[serde_json::json!(5)]),
            ("packet_loss", &[serde_json::json!(20)]),
            ("latency", &[serde_json::json!(10), serde_json::json!(2)]),
        ]);
        assert_eq!(
            build_filter_commands(&map),
            vec![
                "filter0 freq_drop 5",
                "filter1 packet_loss 20",
                "filter2 latency 10 2",
            ],
        );
    }

    #[test]
    fn test_multiline_bpf_expands_per_line() {
        let map = filters(&[(
            "bpf",
            &[serde_json::json!("icmp\n  tcp port 80\n\nudp")],
        )]);
        // A blank line still consumes an index: numbering is positional.
        assert_eq!(
            build_filter_commands(&map),
            vec![
                "filter0 bpf \"icmp\"",
                "filter1 bpf \"tcp port 80\"",
                "filter2 bpf \"\"",
                "filter3 bpf \"udp\"",
            ],
        );
    }

    #[test]
    fn test_capture_toggling_is_side_effect_free() {
        let mut nio = Nio::udp(1000, "localhost", 2000);
        assert!(!nio.capturing());

        nio.start_capture("/tmp/capture.pcap", None);
        assert!(nio.capturing());
        assert_eq!(nio.pcap_link_type(), DEFAULT_LINK_TYPE);
        assert_eq!(nio.pcap_file().unwrap(), Path::new("/tmp/capture.pcap"));

        nio.stop_capture();
        assert!(!nio.capturing());
        assert!(nio.pcap_file().is_none());
    }
}
