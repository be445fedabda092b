//! Relay engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Upper bound for dialing the target of a new connection
    pub connect_timeout_ms: u64,

    /// UDP sessions without traffic for this long are reclaimed
    pub udp_idle_timeout_ms: u64,

    /// How often the UDP session table is swept
    pub udp_sweep_interval_ms: u64,

    /// Copy buffer per connection direction
    pub buffer_size: usize,

    /// Used when a rule is created without `maxConnections`
    pub default_max_connections: u32,

    /// Interval of the upload/download speed sampler
    pub speed_sample_interval_ms: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            udp_idle_timeout_ms: 120_000,
            udp_sweep_interval_ms: 30_000,
            buffer_size: 64 * 1024,
            default_max_connections: 1000,
            speed_sample_interval_ms: 1000,
        }
    }
}

impl ForwardConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_idle_timeout_ms.max(1))
    }

    pub fn udp_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.udp_sweep_interval_ms.max(1))
    }

    pub fn speed_sample_interval(&self) -> Duration {
        Duration::from_millis(self.speed_sample_interval_ms.max(10))
    }
}
