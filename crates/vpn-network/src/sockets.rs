//! Local socket inspection via `ss`
//!
//! The command output is parsed by pure functions so the parsing can be
//! tested against captured text without the tool being present.

use crate::command;
use crate::error::{NetworkError, Result};
use tracing::warn;
use vpn_types::{ConnectionInfo, ListeningSocket, NetworkProtocol};

/// Reads listening sockets and established connections from the OS
#[derive(Debug, Clone)]
pub struct SocketInspector {
    ss_binary: String,
}

impl Default for SocketInspector {
    fn default() -> Self {
        Self {
            ss_binary: "ss".to_string(),
        }
    }
}

impl SocketInspector {
    pub fn new(ss_binary: impl Into<String>) -> Self {
        Self {
            ss_binary: ss_binary.into(),
        }
    }

    /// Run `ss` and return stdout; a missing tool or failed run yields `None`
    async fn ss(&self, args: &[&str]) -> Option<String> {
        match command::run(&self.ss_binary, args).await {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                warn!(
                    status = ?output.status.code(),
                    stderr = %command::stderr_of(&output),
                    "ss exited with an error"
                );
                None
            }
            Err(NetworkError::ToolUnavailable(tool)) => {
                warn!(tool = %tool, "socket inspection tool not installed");
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to run ss");
                None
            }
        }
    }

    /// All listening TCP sockets and bound UDP sockets, ordered by port
    pub async fn listening(&self) -> Result<Vec<ListeningSocket>> {
        let Some(out) = self.ss(&["-H", "-t", "-u", "-l", "-n", "-p"]).await else {
            return Ok(Vec::new());
        };
        let mut sockets = parse_listening(&out);
        sockets.sort_by(|a, b| (a.port, a.protocol).cmp(&(b.port, b.protocol)));
        Ok(sockets)
    }

    /// Established connections whose local side uses `port`
    pub async fn connections(&self, port: u16) -> Result<Vec<ConnectionInfo>> {
        let Some(out) = self.ss(&["-H", "-t", "-u", "-n"]).await else {
            return Ok(Vec::new());
        };
        Ok(parse_connections(&out)
            .into_iter()
            .filter(|c| c.local_port == port)
            .collect())
    }
}

/// Split `addr:port` as printed by `ss`.
///
/// Handles `[v6]:port`, `*:port`, bare v6 with the port after the last
/// colon and scoped addresses like `127.0.0.53%lo:53`.
pub fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = host.split('%').next().unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Extract `(process, pid)` from `users:(("sshd",pid=812,fd=3))`
pub fn parse_process(field: &str) -> (Option<String>, Option<u32>) {
    let name = field.find("((\"").and_then(|start| {
        let rest = &field[start + 3..];
        rest.find('"').map(|end| rest[..end].to_string())
    });

    let pid = field.find("pid=").and_then(|start| {
        let rest = &field[start + 4..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        rest[..end].parse::<u32>().ok()
    });

    (name, pid)
}

fn parse_netid(s: &str) -> Option<NetworkProtocol> {
    match s {
        "tcp" => Some(NetworkProtocol::Tcp),
        "udp" => Some(NetworkProtocol::Udp),
        _ => None,
    }
}

/// Parse `ss -H -t -u -l -n -p` output.
///
/// Columns: Netid State Recv-Q Send-Q Local Peer [Process]
pub fn parse_listening(output: &str) -> Vec<ListeningSocket> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            let protocol = parse_netid(fields[0])?;
            if !matches!(fields[1], "LISTEN" | "UNCONN") {
                return None;
            }
            let (address, port) = split_host_port(fields[4])?;
            let (process, pid) = if fields.len() > 6 {
                parse_process(&fields[6..].join(" "))
            } else {
                (None, None)
            };

            Some(ListeningSocket {
                port,
                protocol,
                address,
                process,
                pid,
            })
        })
        .collect()
}

/// Parse `ss -H -t -u -n` output, keeping established entries only.
///
/// Columns: Netid State Recv-Q Send-Q Local Peer
pub fn parse_connections(output: &str) -> Vec<ConnectionInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            let protocol = parse_netid(fields[0])?;
            if fields[1] != "ESTAB" {
                return None;
            }
            let (local_addr, local_port) = split_host_port(fields[4])?;
            let (remote_addr, remote_port) = split_host_port(fields[5])?;

            Some(ConnectionInfo {
                protocol,
                local_addr,
                local_port,
                remote_addr,
                remote_port,
                state: "established".to_string(),
            })
        })
        .collect()
}
