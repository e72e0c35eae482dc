mod base;
pub mod cloud;
pub mod docker;
pub mod ethsw;
mod process;
mod registry;
pub mod userpc;

pub use base::{udp_connection_commands, BaseNode};
pub use process::SupervisedChild;
pub use registry::Registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    /// The backend does not implement this capability.
    #[error("operation not supported by this node type: {0}")]
    NotSupported(&'static str),

    #[error("VNC console requires a port of at least 5900, current port is {0}")]
    VncConsolePort(u16),

    /// A user-correctable precondition failed (wrong state, missing link…).
    #[error("{0}")]
    Precondition(String),

    /// Subprocess spawn/exec failure, missing image, engine trouble.
    #[error("{0}")]
    Backend(String),

    #[error("timed out after {0:?} while {1}")]
    Timeout(std::time::Duration, String),

    #[error("bridge command '{command}' failed: {source}")]
    BridgeCommand {
        command: String,
        source: bridge::BridgeError,
    },

    #[error(transparent)]
    Port(#[from] ports::PortError),

    #[error(transparent)]
    Bridge(#[from] bridge::BridgeError),

    #[error(transparent)]
    Console(#[from] console::ConsoleError),

    #[error(transparent)]
    Project(#[from] project::ProjectError),

    #[error(transparent)]
    Docker(#[from] docker::DockerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Stopped,
    Started,
    Suspended,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Stopped => write!(f, "stopped"),
            NodeStatus::Started => write!(f, "started"),
            NodeStatus::Suspended => write!(f, "suspended"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleType {
    None,
    Telnet,
    Vnc,
    Http,
    Https,
    Spice,
}

impl std::fmt::Display for ConsoleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConsoleType::None => "none",
            ConsoleType::Telnet => "telnet",
            ConsoleType::Vnc => "vnc",
            ConsoleType::Http => "http",
            ConsoleType::Https => "https",
            ConsoleType::Spice => "spice",
        };
        write!(f, "{name}")
    }
}

/// Console and port choices made at node creation.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub console: Option<u16>,
    pub console_type: ConsoleType,
    pub aux: Option<u16>,
    pub allocate_aux: bool,
    /// Wrap the backend console in a multi-client telnet proxy; reserves an
    /// extra internal port only the proxy dials.
    pub wrap_console: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            console: None,
            console_type: ConsoleType::Telnet,
            aux: None,
            allocate_aux: false,
            wrap_console: false,
        }
    }
}

/// Executable paths and bind addresses a node needs from the compute
/// configuration.
#[derive(Debug, Clone)]
pub struct NodeRuntime {
    pub ubridge_path: String,
    pub vpcs_path: String,
    pub docker_api_url: url::Url,
    pub docker_resources_path: std::path::PathBuf,
    pub nat_interface: String,
}

impl NodeRuntime {
    pub fn from_settings(settings: &project::ComputeSettings) -> Self {
        Self {
            ubridge_path: settings.ubridge_path.clone(),
            vpcs_path: settings.vpcs_path.clone(),
            docker_api_url: settings.docker_api_url.clone(),
            docker_resources_path: settings.docker_resources_path.clone(),
            nat_interface: settings.nat_interface.clone(),
        }
    }
}

/// Lifecycle, linking, console and capture capabilities shared by every
/// backend. Backends implement the subset they support; the defaults answer
/// `NotSupported` instead of panicking.
#[async_trait]
pub trait NodeBackend: Send {
    fn node_id(&self) -> Uuid;
    fn node_name(&self) -> String;
    fn status(&self) -> NodeStatus;

    async fn start(&mut self) -> Result<(), NodeError>;
    async fn stop(&mut self) -> Result<(), NodeError>;
    async fn close(&mut self) -> Result<bool, NodeError>;

    async fn suspend(&mut self) -> Result<(), NodeError> {
        Err(NodeError::NotSupported("suspend"))
    }

    async fn reload(&mut self) -> Result<(), NodeError> {
        self.stop().await?;
        self.start().await
    }

    async fn add_nio(
        &mut self,
        _adapter_number: usize,
        _port_number: usize,
        _nio: nio::Nio,
    ) -> Result<(), NodeError> {
        Err(NodeError::NotSupported("add_nio"))
    }

    async fn update_nio(
        &mut self,
        _adapter_number: usize,
        _port_number: usize,
        _nio: nio::Nio,
    ) -> Result<(), NodeError> {
        Err(NodeError::NotSupported("update_nio"))
    }

    async fn remove_nio(
        &mut self,
        _adapter_number: usize,
        _port_number: usize,
    ) -> Result<nio::Nio, NodeError> {
        Err(NodeError::NotSupported("remove_nio"))
    }

    async fn start_capture(
        &mut self,
        _adapter_number: usize,
        _port_number: usize,
        _output_file: PathBuf,
        _data_link_type: Option<String>,
    ) -> Result<(), NodeError> {
        Err(NodeError::NotSupported("start_capture"))
    }

    async fn stop_capture(
        &mut self,
        _adapter_number: usize,
        _port_number: usize,
    ) -> Result<(), NodeError> {
        Err(NodeError::NotSupported("stop_capture"))
    }
}
