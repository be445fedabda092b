//! wg-quick configuration rendering and parsing

use crate::config::InterfaceConfig;
use crate::error::{Result, WireGuardError};
use crate::peer::WireGuardPeer;
use std::fmt::Write;

/// Placeholder written where the client's own private key belongs
pub const PRIVATE_KEY_PLACEHOLDER: &str = "<client private key>";

/// Server-side configuration with every enabled peer
pub fn render_server_config<'a>(
    interface: &InterfaceConfig,
    peers: impl IntoIterator<Item = &'a WireGuardPeer>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", interface.private_key);
    let _ = writeln!(out, "Address = {}", interface.address);
    let _ = writeln!(out, "ListenPort = {}", interface.listen_port);
    let _ = writeln!(out, "MTU = {}", interface.mtu);

    for peer in peers.into_iter().filter(|p| p.enabled) {
        let spec = peer.spec(interface.persistent_keepalive);
        let _ = writeln!(out);
        let _ = writeln!(out, "# Name = {}", peer.name);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", spec.public_key);
        if let Some(psk) = &spec.preshared_key {
            let _ = writeln!(out, "PresharedKey = {}", psk);
        }
        let _ = writeln!(out, "AllowedIPs = {}", spec.allowed_ips.join(", "));
        if let Some(endpoint) = &spec.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if let Some(keepalive) = spec.persistent_keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
        }
    }
    out
}

/// Client-side configuration for one peer.
///
/// The private key is left as a placeholder; the peer generated it and the
/// server never sees it.
pub fn render_client_config(interface: &InterfaceConfig, peer: &WireGuardPeer) -> Result<String> {
    let endpoint = interface.endpoint().ok_or_else(|| {
        WireGuardError::invalid_state("endpoint address is not configured")
    })?;

    let mut out = String::new();
    let _ = writeln!(out, "# Name = {}", peer.name);
    let _ = writeln!(out, "# PublicKey = {}", peer.public_key);
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", PRIVATE_KEY_PLACEHOLDER);
    let _ = writeln!(out, "Address = {}", peer.allowed_ips_joined());
    if !interface.dns.trim().is_empty() {
        let _ = writeln!(out, "DNS = {}", interface.dns);
    }
    let _ = writeln!(out, "MTU = {}", interface.mtu);
    let _ = writeln!(out);
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", interface.public_key);
    if let Some(psk) = &peer.preshared_key {
        let _ = writeln!(out, "PresharedKey = {}", psk);
    }
    let _ = writeln!(out, "AllowedIPs = {}", interface.client_allowed_ips);
    let _ = writeln!(out, "Endpoint = {}", endpoint);
    if interface.persistent_keepalive > 0 {
        let _ = writeln!(out, "PersistentKeepalive = {}", interface.persistent_keepalive);
    }
    Ok(out)
}

/// One `[Interface]` or `[Peer]` block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    /// `# Key = Value` comments directly preceding or inside the block
    pub comments: Vec<(String, String)>,
    pub entries: Vec<(String, String)>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        find(&self.entries, key)
    }

    pub fn comment(&self, key: &str) -> Option<&str> {
        find(&self.comments, key)
    }

    /// Comma-separated value split into items
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn find<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedConfig {
    pub interface: Section,
    pub peers: Vec<Section>,
}

enum Current {
    None,
    Interface,
    Peer,
}

pub fn parse_config(text: &str) -> Result<ParsedConfig> {
    let mut parsed = ParsedConfig::default();
    let mut seen_interface = false;
    let mut current = Current::None;
    let mut pending_comments = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            if let Some((k, v)) = comment.split_once('=') {
                pending_comments.push((k.trim().to_string(), v.trim().to_string()));
            }
            continue;
        }

        if line.starts_with('[') {
            let section = match line.to_ascii_lowercase().as_str() {
                "[interface]" => {
                    if seen_interface {
                        return Err(WireGuardError::validation(format!(
                            "line {}: duplicate [Interface] section",
                            index + 1
                        )));
                    }
                    seen_interface = true;
                    parsed.interface.comments.append(&mut pending_comments);
                    Current::Interface
                }
                "[peer]" => {
                    parsed.peers.push(Section {
                        comments: std::mem::take(&mut pending_comments),
                        entries: Vec::new(),
                    });
                    Current::Peer
                }
                _ => {
                    return Err(WireGuardError::validation(format!(
                        "line {}: unknown section {}",
                        index + 1,
                        line
                    )))
                }
            };
            current = section;
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| {
            WireGuardError::validation(format!("line {}: expected 'Key = Value'", index + 1))
        })?;
        let entry = (key.trim().to_string(), value.trim().to_string());

        let target = match current {
            Current::Interface => &mut parsed.interface,
            Current::Peer => match parsed.peers.last_mut() {
                Some(peer) => peer,
                None => &mut parsed.interface,
            },
            Current::None => {
                return Err(WireGuardError::validation(format!(
                    "line {}: entry outside of a section",
                    index + 1
                )))
            }
        };
        target.comments.append(&mut pending_comments);
        target.entries.push(entry);
    }

    if !seen_interface {
        return Err(WireGuardError::validation("missing [Interface] section"));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::CreatePeer;
    use proptest::prelude::*;
    use vpn_crypto::X25519KeyManager;

    fn interface() -> InterfaceConfig {
        let keys = X25519KeyManager::new().generate_keypair().unwrap();
        let mut config = InterfaceConfig::with_keys("wg0", 51820, &keys);
        config.endpoint_address = "vpn.example.com".into();
        config
    }

    fn peer(name: &str, allowed: &str) -> WireGuardPeer {
        let public_key = X25519KeyManager::new()
            .generate_keypair()
            .unwrap()
            .public_key_base64();
        CreatePeer::new(name, public_key)
            .into_peer(1, crate::peer::parse_allowed_ips(allowed).unwrap())
            .unwrap()
    }

    #[test]
    fn test_client_config_layout() {
        let interface = interface();
        let peer = peer("phone", "10.66.66.2/32");
        let text = render_client_config(&interface, &peer).unwrap();

        assert!(text.contains("PrivateKey = <client private key>"));
        assert!(text.contains("Endpoint = vpn.example.com:51820"));
        assert!(text.contains("AllowedIPs = 0.0.0.0/0, ::/0"));
        assert!(text.contains("PersistentKeepalive = 25"));
        assert!(text.contains(&format!("PublicKey = {}", interface.public_key)));
        assert!(!text.contains(&interface.private_key));
    }

    #[test]
    fn test_client_config_requires_endpoint() {
        let mut interface = interface();
        interface.endpoint_address.clear();
        let err = render_client_config(&interface, &peer("phone", "10.66.66.2/32")).unwrap_err();
        assert!(matches!(err, WireGuardError::InvalidState(_)));
    }

    #[test]
    fn test_server_config_skips_disabled_peers() {
        let interface = interface();
        let active = peer("active", "10.66.66.2/32");
        let mut disabled = peer("disabled", "10.66.66.3/32");
        disabled.enabled = false;

        let text = render_server_config(&interface, [&active, &disabled]);
        let parsed = parse_config(&text).unwrap();

        assert_eq!(parsed.interface.get("ListenPort"), Some("51820"));
        assert_eq!(parsed.interface.get("PrivateKey"), Some(interface.private_key.as_str()));
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].comment("Name"), Some("active"));
        assert_eq!(parsed.peers[0].get("PublicKey"), Some(active.public_key.as_str()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_config("PublicKey = abc").is_err());
        assert!(parse_config("[Interface]\nnot a pair").is_err());
        assert!(parse_config("[Bogus]\nA = b").is_err());
        assert!(parse_config("[Peer]\nPublicKey = abc").is_err());
    }

    proptest! {
        #[test]
        fn prop_client_config_round_trip(
            octets in proptest::collection::btree_set(2u8..250, 1..4),
            with_psk in any::<bool>(),
        ) {
            let interface = interface();
            let allowed: Vec<String> = octets.iter().map(|o| format!("10.66.66.{}/32", o)).collect();
            let mut peer = peer("prop", &allowed.join(","));
            if with_psk {
                peer.preshared_key = Some(X25519KeyManager::new().generate_preshared_key().unwrap());
            }

            let text = render_client_config(&interface, &peer).unwrap();
            let parsed = parse_config(&text).unwrap();

            prop_assert_eq!(parsed.interface.comment("PublicKey"), Some(peer.public_key.as_str()));
            prop_assert_eq!(parsed.interface.list("Address"), peer.allowed_ips.clone());
            prop_assert_eq!(parsed.peers.len(), 1);
            prop_assert_eq!(parsed.peers[0].get("PresharedKey"), peer.preshared_key.as_deref());
        }
    }
}
