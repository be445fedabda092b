mod command;

pub mod backend;
pub mod config;
pub mod error;
pub mod ipam;
pub mod monitor;
pub mod peer;
pub mod render;
pub mod supervisor;

pub use backend::{parse_dump, PeerDump, TunnelBackend, WgQuickBackend};
pub use config::{InterfaceConfig, InterfaceView, SupervisorConfig, UpdateInterface};
pub use error::{Result, WireGuardError};
pub use monitor::{ConnectionEvent, ConnectionLog, HandshakeMonitor};
pub use peer::{CreatePeer, PeerInfo, PeerSpec, UpdatePeer, WireGuardPeer};
pub use render::{parse_config, render_client_config, render_server_config, ParsedConfig};
pub use supervisor::{InterfaceStatus, TunnelState, WireGuardSupervisor};
