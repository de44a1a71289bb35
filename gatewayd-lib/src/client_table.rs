//! Concurrent keyed store of live client sessions.
//!
//! One writer at a time; long-running callers that touch the network or the
//! firewall must use [`ClientTable::iter_snapshot`] and never hold the lock
//! across I/O.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no client matches the given key")]
    NotFound,
    #[error("token already claimed by another client")]
    TokenConflict,
}

/// Packet-filter mark mirrored onto a client's session state.
///
/// `Validation` carries the auth server's code (5) for the email/SMS
/// validation holding pattern; it installs no firewall rules, same as
/// `Probation`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mark {
    Unknown,
    Probation,
    Validation,
    Known,
    Locked,
}

impl Mark {
    pub fn code(self) -> u16 {
        match self {
            Mark::Unknown => 0,
            Mark::Probation => 1,
            Mark::Validation => 5,
            Mark::Known => 2,
            Mark::Locked => 254,
        }
    }

    /// whether a client carrying this mark should have firewall rules installed
    pub fn installs_rules(self) -> bool {
        matches!(self, Mark::Known | Mark::Locked)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub incoming: u64,
    pub outgoing: u64,
    pub to_gateway: u64,
}

impl Counters {
    pub fn increased_from(&self, previous: &Counters) -> bool {
        self.incoming > previous.incoming || self.outgoing > previous.outgoing || self.to_gateway > previous.to_gateway
    }
}

impl Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mark::Unknown => write!(f, "unknown"),
            Mark::Probation => write!(f, "probation"),
            Mark::Validation => write!(f, "validation"),
            Mark::Known => write!(f, "known"),
            Mark::Locked => write!(f, "locked"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Client {
    pub ip: String,
    pub mac: String,
    pub token: String,
    pub mark: Mark,
    pub counters: Counters,
    pub last_updated: SystemTime,
    pub added_at: SystemTime,
}

impl Client {
    fn new(ip: String, mac: String, token: String) -> Self {
        let now = SystemTime::now();
        Client {
            ip,
            mac,
            token,
            mark: Mark::Unknown,
            counters: Counters::default(),
            last_updated: now,
            added_at: now,
        }
    }

    /// true once `check_interval * client_timeout` has elapsed since the last observed
    /// counter increase
    pub fn is_inactive(&self, check_interval: Duration, client_timeout: u32) -> bool {
        let threshold = check_interval.saturating_mul(client_timeout);
        self.last_updated.elapsed().map(|elapsed| elapsed > threshold).unwrap_or(false)
    }
}

#[derive(Default)]
struct Inner {
    by_ip: HashMap<String, Client>,
}

#[derive(Default)]
pub struct ClientTable {
    inner: Mutex<Inner>,
}

impl ClientTable {
    pub fn new() -> Self {
        ClientTable::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Upserts a client keyed on `(ip, mac)`. Returns the existing entry on a duplicate
    /// pair without touching it; rejects when `token` is already claimed elsewhere.
    pub fn append(&self, ip: &str, mac: &str, token: &str) -> Result<Client, Error> {
        let mut guard = self.lock();

        if let Some(existing) = guard.by_ip.get(ip) {
            if existing.mac == mac {
                tracing::debug!(ip, mac, "client already present, returning existing entry");
                return Ok(existing.clone());
            }
        }

        if guard.by_ip.values().any(|c| c.token == token) {
            return Err(Error::TokenConflict);
        }

        let client = Client::new(ip.to_string(), mac.to_string(), token.to_string());
        guard.by_ip.insert(client.ip.clone(), client.clone());
        Ok(client)
    }

    pub fn find_by_ip(&self, ip: &str) -> Option<Client> {
        self.lock().by_ip.get(ip).cloned()
    }

    pub fn find_by_mac(&self, mac: &str) -> Option<Client> {
        self.lock().by_ip.values().find(|c| c.mac == mac).cloned()
    }

    pub fn find_by_token(&self, token: &str) -> Option<Client> {
        self.lock().by_ip.values().find(|c| c.token == token).cloned()
    }

    /// Removes the client owning `token`, returning it for caller-side firewall teardown.
    /// `token` is preferred over `ip` as the stable key since an ip may be reused between
    /// sessions.
    pub fn delete_by_token(&self, token: &str) -> Option<Client> {
        let mut guard = self.lock();
        let ip = guard.by_ip.values().find(|c| c.token == token).map(|c| c.ip.clone())?;
        guard.by_ip.remove(&ip)
    }

    pub fn delete_by_ip(&self, ip: &str) -> Option<Client> {
        self.lock().by_ip.remove(ip)
    }

    /// Snapshot of every current client. Safe to hold across network or firewall I/O;
    /// mutating operations afterward must re-find by token and abort if gone.
    pub fn iter_snapshot(&self) -> Vec<Client> {
        self.lock().by_ip.values().cloned().collect()
    }

    /// Applies `f` to the client found by `token`, re-inserting the mutated copy.
    /// Returns `Error::NotFound` if the session no longer exists.
    pub fn update_by_token<F>(&self, token: &str, f: F) -> Result<Client, Error>
    where
        F: FnOnce(&mut Client),
    {
        let mut guard = self.lock();
        let ip = guard
            .by_ip
            .values()
            .find(|c| c.token == token)
            .map(|c| c.ip.clone())
            .ok_or(Error::NotFound)?;
        let client = guard.by_ip.get_mut(&ip).ok_or(Error::NotFound)?;
        f(client);
        Ok(client.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_existing_entry_on_duplicate_ip_mac() -> anyhow::Result<()> {
        let table = ClientTable::new();
        let first = table.append("10.0.0.5", "aa:bb:cc:dd:ee:ff", "tok-1")?;
        let second = table.append("10.0.0.5", "aa:bb:cc:dd:ee:ff", "tok-1")?;
        assert_eq!(first.token, second.token);
        assert_eq!(table.len(), 1);
        Ok(())
    }

    #[test]
    fn append_rejects_conflicting_token() -> anyhow::Result<()> {
        let table = ClientTable::new();
        table.append("10.0.0.5", "aa:bb:cc:dd:ee:ff", "tok-1")?;
        let err = table.append("10.0.0.6", "11:22:33:44:55:66", "tok-1").unwrap_err();
        assert!(matches!(err, Error::TokenConflict));
        Ok(())
    }

    #[test]
    fn update_by_token_mutates_and_roundtrips() -> anyhow::Result<()> {
        let table = ClientTable::new();
        table.append("10.0.0.5", "aa:bb:cc:dd:ee:ff", "tok-1")?;
        let updated = table.update_by_token("tok-1", |c| c.mark = Mark::Known)?;
        assert_eq!(updated.mark, Mark::Known);
        assert_eq!(table.find_by_ip("10.0.0.5").unwrap().mark, Mark::Known);
        Ok(())
    }

    #[test]
    fn update_by_token_errors_when_session_gone() {
        let table = ClientTable::new();
        let err = table.update_by_token("ghost", |_| {}).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn delete_by_token_removes_and_returns_client() -> anyhow::Result<()> {
        let table = ClientTable::new();
        table.append("10.0.0.5", "aa:bb:cc:dd:ee:ff", "tok-1")?;
        let deleted = table.delete_by_token("tok-1").expect("client should exist");
        assert_eq!(deleted.ip, "10.0.0.5");
        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn counters_increased_from_detects_any_strictly_larger_field() {
        let previous = Counters { incoming: 10, outgoing: 10, to_gateway: 10 };
        let same = previous;
        assert!(!same.increased_from(&previous));

        let grew_outgoing = Counters { outgoing: 11, ..previous };
        assert!(grew_outgoing.increased_from(&previous));
    }

    #[test]
    fn is_inactive_true_after_threshold_elapses() -> anyhow::Result<()> {
        let mut client = Client::new("10.0.0.5".into(), "aa:bb:cc:dd:ee:ff".into(), "tok-1".into());
        client.last_updated = SystemTime::now() - Duration::from_secs(301);
        assert!(client.is_inactive(Duration::from_secs(60), 5));
        assert!(!client.is_inactive(Duration::from_secs(600), 5));
        Ok(())
    }

    #[test]
    fn iter_snapshot_returns_independent_copies() -> anyhow::Result<()> {
        let table = ClientTable::new();
        table.append("10.0.0.5", "aa:bb:cc:dd:ee:ff", "tok-1")?;
        let mut snapshot = table.iter_snapshot();
        snapshot[0].mark = Mark::Locked;
        assert_eq!(table.find_by_ip("10.0.0.5").unwrap().mark, Mark::Unknown);
        Ok(())
    }
}
