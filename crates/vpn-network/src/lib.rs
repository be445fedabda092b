//! Port scanning, socket inspection and firewall management

mod command;
pub mod error;
pub mod firewall;
pub mod scanner;
pub mod sockets;

pub use error::{NetworkError, Result};
pub use firewall::{
    parse_iptables_rules, FirewallBackend, FirewallManager, FirewallProtocol, FirewallRequest,
    FirewallStatus, IptablesBackend,
};
pub use scanner::{PortCheck, PortScanResult, PortScanner, PortState, ScanRequest, ScannerConfig};
pub use sockets::SocketInspector;
