mod iac;
mod telnet;
mod ws;

pub use iac::{IacParser, Parsed};
pub use telnet::{write_client_intro, TelnetServer, TelnetSettings, WindowSizeCallback};
pub use ws::{websocket_to_telnet, WebSocketRegistry};

/// Telnet command and option bytes used by the proxy.
pub mod codes {
    pub const SE: u8 = 240; // End of sub-negotiation parameters
    pub const NOP: u8 = 241; // No operation
    pub const AYT: u8 = 246; // Are you there
    pub const SB: u8 = 250; // Sub-option to follow
    pub const WILL: u8 = 251;
    pub const WONT: u8 = 252;
    pub const DO: u8 = 253;
    pub const DONT: u8 = 254;
    pub const IAC: u8 = 255; // Interpret as command

    pub const BINARY: u8 = 0; // Transmit binary
    pub const ECHO: u8 = 1;
    pub const SGA: u8 = 3; // Suppress go-ahead
    pub const NAWS: u8 = 31; // Negotiate about window size
}

#[derive(thiserror::Error, Debug)]
pub enum ConsoleError {
    #[error("could not connect to console at {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
