pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod relay;
pub mod rule;
pub mod stats;
pub mod throttle;

pub use config::ForwardConfig;
pub use error::{ForwardError, Result};
pub use manager::ForwardManager;
pub use metrics::{ForwardMetrics, RuleMetrics};
pub use relay::RelayRule;
pub use rule::{CreateRule, ForwardRule, RuleFilter, RuleStatus, UpdateRule};
pub use stats::{Direction, StatsCounter, StatsSnapshot};
