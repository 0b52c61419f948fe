use crate::error::{Result, TunnelError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::error;

/// Total number of tunneled connections currently forwarding
pub const TOTAL_CONNECTIONS: &str = "counter-connections";
/// Per-host number of tunneled connections currently forwarding
pub const PERF_CONN: &str = "perf-connections";
/// Per-host raw upload bytes since the last watcher tick
pub const PERF_UP_COUNT: &str = "perf-up-count";
/// Per-host raw download bytes since the last watcher tick
pub const PERF_DW_COUNT: &str = "perf-dw-count";
/// Per-host upload speed in bytes per second
pub const PERF_UP_SPEED: &str = "perf-up-speed";
/// Per-host download speed in bytes per second
pub const PERF_DW_SPEED: &str = "perf-dw-speed";
/// Per-host cumulative upload bytes
pub const PERF_UP_TOTAL: &str = "perf-up-total";
/// Per-host cumulative download bytes
pub const PERF_DW_TOTAL: &str = "perf-dw-total";
/// Remote platform string (state)
pub const INFO_PLATFORM: &str = "info-platform";
/// Last update timestamp (state)
pub const INFO_UPDATE: &str = "info-update";
/// Remote peer version (state)
pub const INFO_OTHER_VERSION: &str = "info-remote-version";

/// Build the case-insensitive storage key for a prefix and its key parts
///
/// `("perf-up-count", ["10.0.0.5"])` becomes `perf-up-count[10.0.0.5]`.
pub fn as_key(prefix: &str, parts: &[&str]) -> String {
    format!("{}[{}]", prefix, parts.join("-")).to_lowercase()
}

#[derive(Debug, Default)]
struct StateTables {
    values: HashMap<String, String>,
    mapped: HashMap<String, String>,
    hosts: Vec<String>,
    // 已不再被跟踪、但计数尚未被采样取走的主机
    draining: Vec<String>,
}

/// Point-in-time copy of the whole store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub counters: BTreeMap<String, f64>,
    pub state: BTreeMap<String, String>,
    pub mapped: BTreeMap<String, String>,
    pub hosts: Vec<String>,
}

/// Shared statistics store
///
/// Counters and the state/mapping tables live behind two independent locks so
/// that per-chunk byte accounting never waits on mapping updates. None of the
/// methods hold a lock across an await point.
#[derive(Debug, Default)]
pub struct Statistics {
    counters: RwLock<HashMap<String, f64>>,
    state: RwLock<StateTables>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every counter, state entry and mapping
    pub fn reset(&self) {
        self.counters.write().clear();
        let mut state = self.state.write();
        state.values.clear();
        state.mapped.clear();
        state.hosts.clear();
        state.draining.clear();
    }

    /// Read a counter, `None` when it was never written
    pub fn get(&self, prefix: &str, parts: &[&str]) -> Option<f64> {
        let key = as_key(prefix, parts);
        self.counters.read().get(&key).copied()
    }

    /// Overwrite a counter
    pub fn set(&self, value: f64, prefix: &str, parts: &[&str]) -> Result<f64> {
        let key = as_key(prefix, parts);
        check_non_negative(&key, value)?;
        self.counters.write().insert(key, value);
        Ok(value)
    }

    /// Add `amount` to a counter, returning the new value
    pub fn increment_by(&self, amount: f64, prefix: &str, parts: &[&str]) -> Result<f64> {
        let key = as_key(prefix, parts);
        check_non_negative(&key, amount)?;
        let mut counters = self.counters.write();
        let value = counters.entry(key).or_insert(0.0);
        *value += amount;
        Ok(*value)
    }

    /// Subtract `amount` from a counter, flooring at zero
    pub fn decrement_by(&self, amount: f64, prefix: &str, parts: &[&str]) -> Result<f64> {
        let key = as_key(prefix, parts);
        check_non_negative(&key, amount)?;
        let mut counters = self.counters.write();
        let value = counters.entry(key).or_insert(0.0);
        *value = (*value - amount).max(0.0);
        Ok(*value)
    }

    pub fn increment(&self, prefix: &str, parts: &[&str]) -> f64 {
        self.add(1.0, prefix, parts)
    }

    pub fn decrement(&self, prefix: &str, parts: &[&str]) -> f64 {
        let key = as_key(prefix, parts);
        let mut counters = self.counters.write();
        let value = counters.entry(key).or_insert(0.0);
        *value = (*value - 1.0).max(0.0);
        *value
    }

    /// Account transferred bytes for a tracked host
    pub fn add_bytes(&self, prefix: &str, host: &str, bytes: u64) -> f64 {
        self.add(bytes as f64, prefix, &[host])
    }

    /// Read a counter and reset it to zero in a single critical section
    pub fn get_and_clear(&self, prefix: &str, parts: &[&str]) -> Option<f64> {
        let key = as_key(prefix, parts);
        let mut counters = self.counters.write();
        counters.get_mut(&key).map(|value| std::mem::replace(value, 0.0))
    }

    // amount is known to be non-negative
    fn add(&self, amount: f64, prefix: &str, parts: &[&str]) -> f64 {
        let key = as_key(prefix, parts);
        let mut counters = self.counters.write();
        let value = counters.entry(key).or_insert(0.0);
        *value += amount;
        *value
    }

    pub fn get_state(&self, prefix: &str, parts: &[&str]) -> Option<String> {
        let key = as_key(prefix, parts);
        self.state.read().values.get(&key).cloned()
    }

    pub fn set_state(&self, value: impl Into<String>, prefix: &str, parts: &[&str]) {
        let key = as_key(prefix, parts);
        self.state.write().values.insert(key, value.into());
    }

    /// Resolve a local observation key back to its tracked host
    pub fn get_mapped_address(&self, source: &str) -> Option<String> {
        self.state
            .read()
            .mapped
            .get(&source.to_lowercase())
            .cloned()
    }

    /// Associate a local observation key with a tracked host
    pub fn set_mapped_address(&self, source: &str, host: &str) {
        let mut state = self.state.write();
        if !state.hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
            state.hosts.push(host.to_string());
        }
        if let Some(previous) = state.mapped.insert(source.to_lowercase(), host.to_string()) {
            if !previous.eq_ignore_ascii_case(host) {
                release_host(&mut state, &previous);
            }
        }
    }

    /// Drop a mapping; the host leaves the known list once nothing maps to it
    pub fn delete_mapped_address(&self, source: &str) {
        let mut state = self.state.write();
        if let Some(previous) = state.mapped.remove(&source.to_lowercase()) {
            release_host(&mut state, &previous);
        }
    }

    /// De-duplicated list of tracked hosts
    pub fn hosts(&self) -> Vec<String> {
        self.state.read().hosts.clone()
    }

    /// Queue an untracked host so its remaining byte counters get sampled once more
    pub fn retire_host(&self, host: &str) {
        let mut state = self.state.write();
        if !state.hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
            queue_draining(&mut state, host);
        }
    }

    /// Take the hosts that left the tracked list since the last call
    pub fn take_draining_hosts(&self) -> Vec<String> {
        std::mem::take(&mut self.state.write().draining)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let state = self.state.read();
        StatsSnapshot {
            counters,
            state: state
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            mapped: state
                .mapped
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            hosts: state.hosts.clone(),
        }
    }
}

fn release_host(state: &mut StateTables, host: &str) {
    let still_mapped = state.mapped.values().any(|h| h.eq_ignore_ascii_case(host));
    if !still_mapped {
        state.hosts.retain(|h| !h.eq_ignore_ascii_case(host));
        queue_draining(state, host);
    }
}

fn queue_draining(state: &mut StateTables, host: &str) {
    if !state.draining.iter().any(|h| h.eq_ignore_ascii_case(host)) {
        state.draining.push(host.to_string());
    }
}

fn check_non_negative(key: &str, value: f64) -> Result<()> {
    if value.is_nan() || value < 0.0 {
        error!("Refusing negative value {} for counter '{}'", value, key);
        return Err(TunnelError::NegativeCounter {
            key: key.to_string(),
            value,
        });
    }
    Ok(())
}

/// Format a byte quantity for humans
pub fn format_bytes(bytes: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    if bytes >= TB {
        format!("{:.2} TB", bytes / TB)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes / KB)
    } else {
        format!("{} B", bytes)
    }
}
