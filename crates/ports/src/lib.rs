use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum PortError {
    #[error("{protocol} port {port} is already in use on host {host}")]
    PortInUse {
        protocol: Protocol,
        port: u16,
        host: IpAddr,
    },

    #[error("no free {protocol} port left in range {range} on host {host}")]
    NoFreePort {
        protocol: Protocol,
        range: PortRange,
        host: IpAddr,
    },

    #[error("{protocol} port {port} is not reserved for project {project}")]
    NotReserved {
        protocol: Protocol,
        port: u16,
        project: Uuid,
    },

    #[error("invalid port range {0}")]
    InvalidRange(PortRange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Half-open port range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port < self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..self.end
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

pub const DEFAULT_TCP_RANGE: PortRange = PortRange::new(5000, 10000);
pub const DEFAULT_VNC_RANGE: PortRange = PortRange::new(5900, 10000);
pub const DEFAULT_UDP_RANGE: PortRange = PortRange::new(10000, 20000);

#[derive(Default, Debug)]
struct Reservations {
    // Project id -> ports held by that project. The union across projects is
    // the set of ports this pool considers taken.
    by_project: HashMap<Uuid, HashSet<u16>>,
}

impl Reservations {
    fn is_reserved(&self, port: u16) -> bool {
        self.by_project.values().any(|ports| ports.contains(&port))
    }

    fn insert(&mut self, port: u16, project: Uuid) {
        self.by_project.entry(project).or_default().insert(port);
    }

    fn remove(&mut self, port: u16, project: Uuid) -> bool {
        match self.by_project.get_mut(&project) {
            Some(ports) => {
                let removed = ports.remove(&port);
                if ports.is_empty() {
                    self.by_project.remove(&project);
                }
                removed
            }
            None => false,
        }
    }
}

/// Process-wide TCP/UDP port reservation pool, keyed by project.
///
/// A reservation first probes the port with a real `bind()` so that ports
/// held by unrelated host processes are never handed out; the probe socket
/// is closed immediately and the port stays marked for the project until
/// released.
#[derive(Debug)]
pub struct PortPool {
    console_host: IpAddr,
    tcp_range: PortRange,
    vnc_range: PortRange,
    udp_range: PortRange,
    tcp: Mutex<Reservations>,
    udp: Mutex<Reservations>,
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            DEFAULT_TCP_RANGE,
            DEFAULT_VNC_RANGE,
            DEFAULT_UDP_RANGE,
        )
        .expect("default ranges are valid")
    }
}

impl PortPool {
    pub fn new(
        console_host: IpAddr,
        tcp_range: PortRange,
        vnc_range: PortRange,
        udp_range: PortRange,
    ) -> Result<Self, PortError> {
        for range in [tcp_range, vnc_range, udp_range] {
            if range.start >= range.end {
                return Err(PortError::InvalidRange(range));
            }
        }
        // VNC displays start at port 5900.
        if vnc_range.start < 5900 {
            return Err(PortError::InvalidRange(vnc_range));
        }
        Ok(Self {
            console_host,
            tcp_range,
            vnc_range,
            udp_range,
            tcp: Mutex::new(Reservations::default()),
            udp: Mutex::new(Reservations::default()),
        })
    }

    /// Address on which reservations are probed and consoles are served.
    pub fn console_host(&self) -> IpAddr {
        self.console_host
    }

    pub fn tcp_range(&self) -> PortRange {
        self.tcp_range
    }

    pub fn vnc_range(&self) -> PortRange {
        self.vnc_range
    }

    pub fn udp_range(&self) -> PortRange {
        self.udp_range
    }

    pub fn reserve_tcp(&self, port: u16, project: Uuid) -> Result<u16, PortError> {
        self.reserve_tcp_in(port, project, self.tcp_range)
    }

    /// Reserves a specific TCP port. A port outside `range` is still honored
    /// (explicit user choice) as long as nothing else holds it.
    pub fn reserve_tcp_in(
        &self,
        port: u16,
        project: Uuid,
        range: PortRange,
    ) -> Result<u16, PortError> {
        if !range.contains(port) {
            tracing::info!(port, %project, %range, "TCP port is outside the configured range");
        }
        self.reserve(Protocol::Tcp, &self.tcp, port, project)
    }

    pub fn get_free_tcp(&self, project: Uuid) -> Result<u16, PortError> {
        self.get_free_tcp_in(project, self.tcp_range)
    }

    pub fn get_free_tcp_in(&self, project: Uuid, range: PortRange) -> Result<u16, PortError> {
        self.get_free(Protocol::Tcp, &self.tcp, project, range)
    }

    pub fn release_tcp(&self, port: u16, project: Uuid) -> Result<(), PortError> {
        self.release(Protocol::Tcp, &self.tcp, port, project)
    }

    pub fn reserve_udp(&self, port: u16, project: Uuid) -> Result<u16, PortError> {
        self.reserve_udp_in(port, project, self.udp_range)
    }

    pub fn reserve_udp_in(
        &self,
        port: u16,
        project: Uuid,
        range: PortRange,
    ) -> Result<u16, PortError> {
        if !range.contains(port) {
            tracing::info!(port, %project, %range, "UDP port is outside the configured range");
        }
        self.reserve(Protocol::Udp, &self.udp, port, project)
    }

    pub fn get_free_udp(&self, project: Uuid) -> Result<u16, PortError> {
        self.get_free(Protocol::Udp, &self.udp, project, self.udp_range)
    }

    pub fn release_udp(&self, port: u16, project: Uuid) -> Result<(), PortError> {
        self.release(Protocol::Udp, &self.udp, port, project)
    }

    /// Releases every TCP and UDP reservation held by `project`.
    pub fn release_project(&self, project: Uuid) {
        let tcp = self
            .tcp
            .lock()
            .unwrap()
            .by_project
            .remove(&project)
            .unwrap_or_default();
        let udp = self
            .udp
            .lock()
            .unwrap()
            .by_project
            .remove(&project)
            .unwrap_or_default();
        if !tcp.is_empty() || !udp.is_empty() {
            tracing::info!(
                %project,
                tcp = tcp.len(),
                udp = udp.len(),
                "released remaining project port reservations"
            );
        }
    }

    fn reserve(
        &self,
        protocol: Protocol,
        reservations: &Mutex<Reservations>,
        port: u16,
        project: Uuid,
    ) -> Result<u16, PortError> {
        let mut state = reservations.lock().unwrap();
        if state.is_reserved(port) || !self.probe(protocol, port) {
            return Err(PortError::PortInUse {
                protocol,
                port,
                host: self.console_host,
            });
        }
        state.insert(port, project);
        tracing::debug!(%protocol, port, %project, "port reserved");
        Ok(port)
    }

    fn get_free(
        &self,
        protocol: Protocol,
        reservations: &Mutex<Reservations>,
        project: Uuid,
        range: PortRange,
    ) -> Result<u16, PortError> {
        let mut state = reservations.lock().unwrap();
        for port in range.iter() {
            if state.is_reserved(port) {
                continue;
            }
            if self.probe(protocol, port) {
                state.insert(port, project);
                tracing::debug!(%protocol, port, %project, "free port found");
                return Ok(port);
            }
        }
        Err(PortError::NoFreePort {
            protocol,
            range,
            host: self.console_host,
        })
    }

    fn release(
        &self,
        protocol: Protocol,
        reservations: &Mutex<Reservations>,
        port: u16,
        project: Uuid,
    ) -> Result<(), PortError> {
        let mut state = reservations.lock().unwrap();
        if !state.remove(port, project) {
            return Err(PortError::NotReserved {
                protocol,
                port,
                project,
            });
        }
        tracing::debug!(%protocol, port, %project, "port released");
        Ok(())
    }

    // The probe socket is dropped right away; the reservation table carries
    // the claim from here on. The window between probe and actual use is
    // accepted.
    fn probe(&self, protocol: Protocol, port: u16) -> bool {
        let addr = SocketAddr::new(self.console_host, port);
        match protocol {
            Protocol::Tcp => std::net::TcpListener::bind(addr).is_ok(),
            Protocol::Udp => std::net::UdpSocket::bind(addr).is_ok(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pool() -> PortPool {
        PortPool::default()
    }

    #[test]
    fn test_reserve_and_release_round_trip() {
        let pool = pool();
        let project = Uuid::new_v4();

        let port = pool.get_free_tcp(project).unwrap();
        assert!(pool.tcp_range().contains(port));

        pool.release_tcp(port, project).unwrap();
        // The same port is handed out again once released.
        assert_eq!(pool.reserve_tcp(port, project).unwrap(), port);
    }

    #[test]
    fn test_reserve_taken_port_fails() {
        let pool = pool();
        let project = Uuid::new_v4();

        let port = pool.get_free_tcp(project).unwrap();
        let err = pool.reserve_tcp(port, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, PortError::PortInUse { .. }));
    }

    #[test]
    fn test_reserve_outside_range_is_honored() {
        let pool = pool();
        let project = Uuid::new_v4();

        // 20100 is outside the default TCP range but free: explicit choice wins.
        assert_eq!(pool.reserve_tcp(20100, project).unwrap(), 20100);
        pool.release_tcp(20100, project).unwrap();
    }

    #[test]
    fn test_release_not_owned_fails_loudly() {
        let pool = pool();
        let project = Uuid::new_v4();
        let other = Uuid::new_v4();

        let port = pool.get_free_tcp(project).unwrap();
        let err = pool.release_tcp(port, other).unwrap_err();
        assert!(matches!(err, PortError::NotReserved { .. }));

        // Double release by the owner is a programming error too.
        pool.release_tcp(port, project).unwrap();
        assert!(pool.release_tcp(port, project).is_err());
    }

    #[test]
    fn test_reservations_disjoint_across_projects() {
        let pool = pool();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut seen = std::collections::HashSet::new();
        for project in [a, b, a, b] {
            let port = pool.get_free_udp(project).unwrap();
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }

    #[test]
    fn test_release_project_empties_reservations() {
        let pool = pool();
        let project = Uuid::new_v4();

        let tcp = pool.get_free_tcp(project).unwrap();
        let udp = pool.get_free_udp(project).unwrap();
        pool.release_project(project);

        // Both ports are free again.
        assert_eq!(pool.reserve_tcp(tcp, project).unwrap(), tcp);
        assert_eq!(pool.reserve_udp(udp, project).unwrap(), udp);
    }

    #[test]
    fn test_vnc_range_must_start_at_5900() {
        let err = PortPool::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            DEFAULT_TCP_RANGE,
            PortRange::new(5000, 10000),
            DEFAULT_UDP_RANGE,
        )
        .unwrap_err();
        assert!(matches!(err, PortError::InvalidRange(_)));
    }

    #[test]
    fn test_no_free_port_on_exhausted_range() {
        let pool = pool();
        let project = Uuid::new_v4();

        // A one-port range exhausts after a single reservation.
        let range = PortRange::new(5050, 5051);
        let first = pool.get_free_tcp_in(project, range);
        if let Ok(port) = first {
            let err = pool.get_free_tcp_in(project, range).unwrap_err();
            assert!(matches!(err, PortError::NoFreePort { .. }));
            pool.release_tcp(port, project).unwrap();
        }
    }
}
