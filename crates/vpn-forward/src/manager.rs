//! Rule table and lifecycle of forward rules
//!
//! [`ForwardManager`] owns every [`ForwardRule`] and the [`RelayRule`] of each
//! running one. The table is guarded by a single async mutex. Stop and delete
//! take the relay out under the lock and wait for its teardown after
//! releasing it; the rule is marked stopping meanwhile, so it never has two
//! runs and never records traffic after `stop` returns.

use crate::config::ForwardConfig;
use crate::error::{ForwardError, Result};
use crate::metrics::ForwardMetrics;
use crate::relay::RelayRule;
use crate::rule::{CreateRule, ForwardRule, RuleFilter, RuleStatus, UpdateRule};
use crate::stats::{StatsCounter, StatsSnapshot};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vpn_types::{load_json, save_json, StateStore};

/// Store key of the persisted rule set
pub const STORE_KEY: &str = "forward_rules";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRules {
    next_id: u64,
    rules: Vec<ForwardRule>,
}

struct RuleEntry {
    rule: ForwardRule,
    running: Option<RelayRule>,
    /// Counters of a run being torn down outside the table lock
    stopping: Option<Arc<StatsCounter>>,
}

impl RuleEntry {
    fn new(rule: ForwardRule) -> Self {
        Self {
            rule,
            running: None,
            stopping: None,
        }
    }

    fn live_stats(&self) -> Option<StatsSnapshot> {
        match (&self.running, &self.stopping) {
            (Some(relay), _) => Some(relay.stats().snapshot()),
            (None, Some(stats)) => Some(stats.snapshot()),
            (None, None) => None,
        }
    }

    /// The rule with live counters when running
    fn view(&self) -> ForwardRule {
        let mut rule = self.rule.clone();
        if let Some(stats) = self.live_stats() {
            rule.stats = stats;
        }
        rule
    }

    fn ensure_not_stopping(&self) -> Result<()> {
        if self.stopping.is_some() {
            return Err(ForwardError::invalid_state(format!(
                "rule {} is stopping",
                self.rule.id
            )));
        }
        Ok(())
    }

    /// Take the relay out and mark the rule as stopping
    fn begin_stop(&mut self) -> Option<RelayRule> {
        let relay = self.running.take()?;
        self.stopping = Some(relay.stats());
        Some(relay)
    }

    /// Fold a finished run into the stored rule
    fn finish_stop(&mut self, snapshot: StatsSnapshot) {
        self.stopping = None;
        self.rule.total_upload += snapshot.bytes_in;
        self.rule.total_download += snapshot.bytes_out;
        self.rule.stats = snapshot;
        self.rule.status = RuleStatus::Stopped;
        self.rule.updated_at = Utc::now();
    }
}

#[derive(Default)]
struct RuleTable {
    next_id: u64,
    entries: BTreeMap<u64, RuleEntry>,
}

impl RuleTable {
    fn entry_mut(&mut self, id: u64) -> Result<&mut RuleEntry> {
        self.entries.get_mut(&id).ok_or(ForwardError::NotFound(id))
    }

    fn check_conflict(&self, candidate: &ForwardRule) -> Result<()> {
        let taken = self
            .entries
            .values()
            .find(|e| e.rule.id != candidate.id && e.rule.listens_like(candidate));

        match taken {
            Some(existing) => Err(ForwardError::conflict(format!(
                "{} {} is already used by rule {} ({})",
                candidate.protocol,
                candidate.listen_endpoint(),
                existing.rule.id,
                existing.rule.name
            ))),
            None => Ok(()),
        }
    }

    fn persisted(&self) -> PersistedRules {
        PersistedRules {
            next_id: self.next_id,
            rules: self.entries.values().map(|e| e.rule.clone()).collect(),
        }
    }
}

pub struct ForwardManager {
    config: ForwardConfig,
    store: Arc<dyn StateStore>,
    metrics: ForwardMetrics,
    table: Mutex<RuleTable>,
}

impl ForwardManager {
    /// Load persisted rules; every rule starts out stopped
    pub async fn new(config: ForwardConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        let persisted: PersistedRules = load_json(store.as_ref(), STORE_KEY)
            .await?
            .unwrap_or_default();

        let mut table = RuleTable {
            next_id: persisted.next_id,
            entries: BTreeMap::new(),
        };
        for mut rule in persisted.rules {
            rule.status = RuleStatus::Stopped;
            rule.last_error = None;
            rule.stats = StatsSnapshot::default();
            table.next_id = table.next_id.max(rule.id);
            table.entries.insert(rule.id, RuleEntry::new(rule));
        }

        info!(rules = table.entries.len(), "Forward rules loaded");

        Ok(Self {
            config,
            store,
            metrics: ForwardMetrics::new()?,
            table: Mutex::new(table),
        })
    }

    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ForwardMetrics {
        &self.metrics
    }

    async fn persist(&self, table: &RuleTable) -> Result<()> {
        save_json(self.store.as_ref(), STORE_KEY, &table.persisted()).await?;
        Ok(())
    }

    /// Validate and store a new stopped rule
    pub async fn create(&self, request: CreateRule) -> Result<ForwardRule> {
        let mut table = self.table.lock().await;
        let id = table.next_id + 1;
        let rule = request.into_rule(id, self.config.default_max_connections)?;
        table.check_conflict(&rule)?;

        let previous_next_id = table.next_id;
        table.next_id = id;
        table.entries.insert(id, RuleEntry::new(rule.clone()));

        if let Err(e) = self.persist(&table).await {
            table.entries.remove(&id);
            table.next_id = previous_next_id;
            return Err(e);
        }

        info!(
            rule_id = id,
            protocol = %rule.protocol,
            listen = %rule.listen_endpoint(),
            target = %rule.target_endpoint(),
            "Forward rule created"
        );
        Ok(rule)
    }

    pub async fn get(&self, id: u64) -> Result<ForwardRule> {
        let table = self.table.lock().await;
        table
            .entries
            .get(&id)
            .map(RuleEntry::view)
            .ok_or(ForwardError::NotFound(id))
    }

    /// Matching rules, newest first
    pub async fn list(&self, filter: &RuleFilter) -> Vec<ForwardRule> {
        let table = self.table.lock().await;
        table
            .entries
            .values()
            .rev()
            .map(RuleEntry::view)
            .filter(|rule| filter.matches(rule))
            .collect()
    }

    /// Bind the listener and start relaying
    pub async fn start(&self, id: u64) -> Result<ForwardRule> {
        let mut table = self.table.lock().await;
        let entry = table.entry_mut(id)?;
        if entry.running.is_some() {
            return Err(ForwardError::AlreadyRunning(id));
        }
        entry.ensure_not_stopping()?;

        match RelayRule::start(&entry.rule, &self.config, self.metrics.for_rule(id)).await {
            Ok(relay) => {
                let previous = (entry.rule.status, entry.rule.last_error.take());
                entry.rule.status = RuleStatus::Running;
                entry.rule.stats = relay.stats().snapshot();
                entry.running = Some(relay);
                self.metrics.rules_running.inc();
                let view = entry.view();

                if let Err(e) = self.persist(&table).await {
                    warn!(rule_id = id, error = %e, "Failed to persist started rule, stopping it");
                    let entry = table.entry_mut(id)?;
                    if let Some(relay) = entry.running.take() {
                        relay.stop().await;
                        self.metrics.rules_running.dec();
                    }
                    entry.rule.status = previous.0;
                    entry.rule.last_error = previous.1;
                    return Err(e);
                }
                Ok(view)
            }
            Err(e) => {
                warn!(rule_id = id, error = %e, "Failed to start forward rule");
                entry.rule.status = RuleStatus::Error;
                entry.rule.last_error = Some(e.to_string());
                entry.rule.updated_at = Utc::now();
                if let Err(store_err) = self.persist(&table).await {
                    warn!(rule_id = id, error = %store_err, "Failed to persist rule error state");
                }
                Err(e)
            }
        }
    }

    /// Stop a rule and wait until all of its relay tasks have exited.
    ///
    /// Stopping a rule that is not running is a no-op.
    pub async fn stop(&self, id: u64) -> Result<ForwardRule> {
        let relay = {
            let mut table = self.table.lock().await;
            let entry = table.entry_mut(id)?;

            match entry.begin_stop() {
                Some(relay) => relay,
                None if entry.rule.status == RuleStatus::Error => {
                    entry.rule.status = RuleStatus::Stopped;
                    entry.rule.last_error = None;
                    let view = entry.view();
                    self.persist(&table).await?;
                    return Ok(view);
                }
                None => return Ok(entry.view()),
            }
        };

        let snapshot = relay.stop().await;
        self.metrics.rules_running.dec();

        let mut table = self.table.lock().await;
        let entry = table.entry_mut(id)?;
        entry.finish_stop(snapshot);
        let view = entry.view();

        self.persist(&table).await?;
        info!(rule_id = id, "Forward rule stopped");
        Ok(view)
    }

    pub async fn restart(&self, id: u64) -> Result<ForwardRule> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// Change a rule that is not running
    pub async fn update(&self, id: u64, changes: UpdateRule) -> Result<ForwardRule> {
        let mut table = self.table.lock().await;
        let entry = table.entry_mut(id)?;
        if entry.rule.status == RuleStatus::Running {
            return Err(ForwardError::invalid_state(format!(
                "rule {} is running, stop it before updating",
                id
            )));
        }

        let updated = changes.apply(&entry.rule)?;
        table.check_conflict(&updated)?;

        let entry = table.entry_mut(id)?;
        let previous = std::mem::replace(&mut entry.rule, updated.clone());
        if let Err(e) = self.persist(&table).await {
            if let Some(entry) = table.entries.get_mut(&id) {
                entry.rule = previous;
            }
            return Err(e);
        }

        info!(rule_id = id, "Forward rule updated");
        Ok(updated)
    }

    /// Stop if running, then remove permanently
    pub async fn delete(&self, id: u64) -> Result<()> {
        let relay = {
            let mut table = self.table.lock().await;
            let entry = table.entry_mut(id)?;
            entry.ensure_not_stopping()?;
            entry.begin_stop()
        };

        let mut table = if let Some(relay) = relay {
            let snapshot = relay.stop().await;
            self.metrics.rules_running.dec();
            let mut table = self.table.lock().await;
            table.entry_mut(id)?.finish_stop(snapshot);
            table
        } else {
            self.table.lock().await
        };

        let removed = table.entries.remove(&id);
        if let Err(e) = self.persist(&table).await {
            if let Some(entry) = removed {
                table.entries.insert(id, entry);
            }
            return Err(e);
        }

        self.metrics.remove_rule(id);
        info!(rule_id = id, "Forward rule deleted");
        Ok(())
    }

    /// Counters of the current run, or of the last run when stopped
    pub async fn stats(&self, id: u64) -> Result<StatsSnapshot> {
        let table = self.table.lock().await;
        let entry = table.entries.get(&id).ok_or(ForwardError::NotFound(id))?;
        Ok(entry
            .live_stats()
            .unwrap_or_else(|| entry.rule.stats.clone()))
    }

    /// Address the running rule is bound to
    pub async fn local_addr(&self, id: u64) -> Result<Option<SocketAddr>> {
        let table = self.table.lock().await;
        let entry = table.entries.get(&id).ok_or(ForwardError::NotFound(id))?;
        Ok(entry.running.as_ref().map(RelayRule::local_addr))
    }

    /// Start every enabled rule; failures leave the rule in error.
    ///
    /// Returns the number of rules started.
    pub async fn restore(&self) -> usize {
        let ids: Vec<u64> = {
            let table = self.table.lock().await;
            table
                .entries
                .values()
                .filter(|e| e.rule.enabled && e.running.is_none())
                .map(|e| e.rule.id)
                .collect()
        };

        let mut started = 0;
        for id in ids {
            match self.start(id).await {
                Ok(_) => started += 1,
                Err(e) => warn!(rule_id = id, error = %e, "Forward rule not restored"),
            }
        }
        info!(started, "Forward rules restored");
        started
    }

    /// Stop every running rule
    pub async fn shutdown(&self) {
        let ids: Vec<u64> = {
            let table = self.table.lock().await;
            table
                .entries
                .values()
                .filter(|e| e.running.is_some())
                .map(|e| e.rule.id)
                .collect()
        };

        for id in ids {
            if let Err(e) = self.stop(id).await {
                warn!(rule_id = id, error = %e, "Failed to stop forward rule on shutdown");
            }
        }
        debug!("Forward manager shut down");
    }

    pub async fn running_count(&self) -> usize {
        let table = self.table.lock().await;
        table.entries.values().filter(|e| e.running.is_some()).count()
    }

    pub async fn rule_count(&self) -> usize {
        self.table.lock().await.entries.len()
    }

    /// Sum of active connections over all running rules
    pub async fn total_active_connections(&self) -> u64 {
        let table = self.table.lock().await;
        table
            .entries
            .values()
            .filter_map(|e| e.running.as_ref())
            .map(|relay| relay.stats().active_connections())
            .sum()
    }

    /// Prometheus text exposition of relay counters
    pub fn metrics_text(&self) -> Result<String> {
        self.metrics.gather_text()
    }
}
