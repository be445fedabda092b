//! Peer records and their validation

use crate::error::{Result, WireGuardError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vpn_crypto::X25519KeyManager;
use vpn_types::{CidrValidator, HostValidator};

const MAX_NAME_LEN: usize = 64;

/// A peer as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireGuardPeer {
    pub id: u64,
    pub name: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<String>,
    /// Static endpoint configured for the peer, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WireGuardPeer {
    pub fn allowed_ips_joined(&self) -> String {
        self.allowed_ips.join(", ")
    }

    /// Live-tunnel view of this peer
    pub fn spec(&self, keepalive: u16) -> PeerSpec {
        PeerSpec {
            public_key: self.public_key.clone(),
            preshared_key: self.preshared_key.clone(),
            allowed_ips: self.allowed_ips.clone(),
            endpoint: self.endpoint.clone(),
            persistent_keepalive: (self.endpoint.is_some() && keepalive > 0).then_some(keepalive),
        }
    }
}

/// What the tunnel needs to know about a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<u16>,
}

/// A peer with live tunnel counters merged in
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: u64,
    pub name: String,
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    pub enabled: bool,
    /// Endpoint last seen by the tunnel, or the configured one
    pub endpoint: Option<String>,
    pub last_handshake: Option<DateTime<Utc>>,
    /// Seconds since the last handshake
    pub handshake_age: Option<u64>,
    pub rx_bytes: Option<u64>,
    pub tx_bytes: Option<u64>,
    pub online: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PeerInfo {
    /// Peer without live data
    pub fn offline(peer: &WireGuardPeer) -> Self {
        Self {
            id: peer.id,
            name: peer.name.clone(),
            public_key: peer.public_key.clone(),
            allowed_ips: peer.allowed_ips.clone(),
            enabled: peer.enabled,
            endpoint: peer.endpoint.clone(),
            last_handshake: None,
            handshake_age: None,
            rx_bytes: None,
            tx_bytes: None,
            online: false,
            created_at: peer.created_at,
            updated_at: peer.updated_at,
        }
    }
}

/// Input for adding a peer; the peer supplies its own public key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePeer {
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    /// Comma-separated CIDRs; allocated from the interface subnet when absent
    #[serde(default)]
    pub allowed_ips: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl CreatePeer {
    pub fn new(name: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public_key: public_key.into(),
            preshared_key: None,
            allowed_ips: None,
            endpoint: None,
            enabled: None,
        }
    }

    pub fn with_allowed_ips(mut self, allowed_ips: impl Into<String>) -> Self {
        self.allowed_ips = Some(allowed_ips.into());
        self
    }

    pub fn with_preshared_key(mut self, key: impl Into<String>) -> Self {
        self.preshared_key = Some(key.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Build the record once the address is known
    pub(crate) fn into_peer(self, id: u64, allowed_ips: Vec<String>) -> Result<WireGuardPeer> {
        let now = Utc::now();
        let peer = WireGuardPeer {
            id,
            name: self.name.trim().to_string(),
            public_key: self.public_key.trim().to_string(),
            preshared_key: self
                .preshared_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            allowed_ips,
            endpoint: self
                .endpoint
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
            enabled: self.enabled.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };
        validate_peer(&peer)?;
        Ok(peer)
    }
}

/// Partial update of a peer; the public key is fixed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePeer {
    pub name: Option<String>,
    /// Empty string removes the preshared key
    pub preshared_key: Option<String>,
    pub allowed_ips: Option<String>,
    pub endpoint: Option<String>,
    pub enabled: Option<bool>,
}

impl UpdatePeer {
    pub(crate) fn apply(self, peer: &WireGuardPeer) -> Result<WireGuardPeer> {
        let mut updated = peer.clone();
        if let Some(name) = self.name {
            updated.name = name.trim().to_string();
        }
        if let Some(key) = self.preshared_key {
            let key = key.trim().to_string();
            updated.preshared_key = (!key.is_empty()).then_some(key);
        }
        if let Some(allowed) = self.allowed_ips {
            updated.allowed_ips = parse_allowed_ips(&allowed)?;
        }
        if let Some(endpoint) = self.endpoint {
            let endpoint = endpoint.trim().to_string();
            updated.endpoint = (!endpoint.is_empty()).then_some(endpoint);
        }
        if let Some(enabled) = self.enabled {
            updated.enabled = enabled;
        }
        updated.updated_at = Utc::now();
        validate_peer(&updated)?;
        Ok(updated)
    }
}

/// Normalize a comma-separated CIDR list
pub fn parse_allowed_ips(list: &str) -> Result<Vec<String>> {
    Ok(CidrValidator::validate_list(list)?
        .into_iter()
        .map(|net| net.to_string())
        .collect())
}

pub(crate) fn validate_peer(peer: &WireGuardPeer) -> Result<()> {
    if peer.name.is_empty() || peer.name.chars().count() > MAX_NAME_LEN {
        return Err(WireGuardError::validation(format!(
            "Peer name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }

    let keys = X25519KeyManager::new();
    keys.validate_public_key(&peer.public_key)
        .map_err(|_| WireGuardError::validation("Public key must be base64 of 32 bytes"))?;
    if let Some(psk) = &peer.preshared_key {
        keys.validate_preshared_key(psk)
            .map_err(|_| WireGuardError::validation("Preshared key must be base64 of 32 bytes"))?;
    }

    if peer.allowed_ips.is_empty() {
        return Err(WireGuardError::validation("At least one allowed IP is required"));
    }
    for cidr in &peer.allowed_ips {
        CidrValidator::validate(cidr)?;
    }

    if let Some(endpoint) = &peer.endpoint {
        validate_endpoint(endpoint)?;
    }
    Ok(())
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let invalid = || WireGuardError::validation(format!("Invalid endpoint '{}'", endpoint));
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    HostValidator.validate(host).map_err(|_| invalid())
}
