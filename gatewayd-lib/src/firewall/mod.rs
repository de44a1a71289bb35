//! Packet-filter controller: translates session state into firewall rules and
//! harvests per-client byte counters from the kernel.
//!
//! [`FirewallBackend`] is the abstract capability the rest of the crate
//! depends on; [`iptables_backend::IptablesBackend`] is the reference
//! implementation driving the Linux `iptables` tool. Tests substitute
//! [`mocks::MockFirewallBackend`].

pub mod iptables_backend;
#[cfg(test)]
pub mod mocks;

use std::collections::HashMap;

use thiserror::Error;

use crate::client_table::Mark;
use crate::config::{Config, FirewallRule};

pub const TABLE_MANGLE: &str = "mangle";
pub const TABLE_NAT: &str = "nat";
pub const TABLE_FILTER: &str = "filter";

pub const CHAIN_OUTGOING: &str = "WIFIDOG_OUTGOING";
pub const CHAIN_INCOMING: &str = "WIFIDOG_INCOMING";
pub const CHAIN_WIFI_TO_INTERNET_NAT: &str = "WIFIDOG_WIFI_TO_INTERNET";
pub const CHAIN_UNKNOWN_NAT: &str = "WIFIDOG_UNKNOWN";
pub const CHAIN_WIFI_TO_GW: &str = "WIFIDOG_WIFI_TO_GW";
pub const CHAIN_WIFI_TO_INTERNET_FILTER: &str = "WIFIDOG_WIFI_TO_INTERNET";
pub const CHAIN_AUTHSERVERS: &str = "WIFIDOG_AUTHSERVERS";
pub const CHAIN_LOCKED: &str = "WIFIDOG_LOCKED";
pub const CHAIN_GLOBAL: &str = "WIFIDOG_GLOBAL";
pub const CHAIN_VALIDATE: &str = "WIFIDOG_VALIDATE";
pub const CHAIN_KNOWN: &str = "WIFIDOG_KNOWN";
pub const CHAIN_UNKNOWN_FILTER: &str = "WIFIDOG_UNKNOWN";

#[derive(Debug, Error)]
pub enum Error {
    #[error("error running iptables: {0}")]
    Shell(String),
    #[error("rule installation for {ip}/{mac} failed, rolled back: {reason}")]
    AllowFailed { ip: String, mac: String, reason: String },
    #[error("failed parsing counter output: {0}")]
    CounterParse(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub incoming: u64,
    pub outgoing: u64,
    pub to_gateway: u64,
}

/// Abstraction over the kernel packet-filter. All methods are synchronous, matching the
/// `iptables` crate's (and the shelled-out `iptables` binary's) blocking nature.
pub trait FirewallBackend: Send + Sync {
    /// Creates all chains, installs scaffolding, and loads the configured rulesets.
    /// Must be idempotent: destroys any stale `WIFIDOG_*` chains first.
    fn init(&self, config: &Config) -> Result<(), Error>;

    /// Unlinks from built-in chains, flushes and deletes everything this backend created.
    /// Errors are logged, never propagated — teardown must always complete.
    fn destroy(&self);

    /// Installs the three allow rules for a client promoted to `mark`. All three must
    /// succeed or none do.
    fn allow(&self, ip: &str, mac: &str, mark: Mark) -> Result<(), Error>;

    /// Removes the rules installed by `allow` with the same parameters. Failures are
    /// logged but never block table removal.
    fn deny(&self, ip: &str, mac: &str, mark: Mark);

    /// Reads per-ip byte counters from the chains. Malformed rows are dropped with a
    /// warning, never fatal.
    fn read_counters(&self) -> HashMap<String, CounterDelta>;
}

pub fn destination_clause(rule: &FirewallRule) -> Option<String> {
    rule.destination.map(|network| format!("-d {network}"))
}
