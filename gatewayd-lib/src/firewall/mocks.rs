//! Stateful mock of [`FirewallBackend`] for exercising the lifecycle glue without a kernel.
//!
//! Tracks the actual set of installed `(ip, mac, mark)` tuples rather than just recording
//! calls, so tests can assert on firewall *state* after a sequence of operations.

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Mutex;

use super::{CounterDelta, Error, FirewallBackend};
use crate::client_table::Mark;
use crate::config::Config;

#[derive(Debug, Default)]
pub struct FirewallState {
    pub installed: HashMap<String, (String, Mark)>,
    pub counters: HashMap<String, CounterDelta>,
    pub init_calls: u32,
    pub destroyed: bool,
    pub fail_on: HashMap<String, String>,
}

impl FirewallState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        match self.fail_on.get(op) {
            Some(msg) => Err(Error::Shell(msg.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MockFirewallBackend {
    pub state: Mutex<FirewallState>,
}

impl MockFirewallBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FirewallState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl FirewallBackend for MockFirewallBackend {
    fn init(&self, _config: &Config) -> Result<(), Error> {
        let mut state = self.lock();
        state.check_fail("init")?;
        state.init_calls += 1;
        state.destroyed = false;
        Ok(())
    }

    fn destroy(&self) {
        let mut state = self.lock();
        state.installed.clear();
        state.destroyed = true;
    }

    fn allow(&self, ip: &str, mac: &str, mark: Mark) -> Result<(), Error> {
        let mut state = self.lock();
        state.check_fail("allow").map_err(|e| Error::AllowFailed {
            ip: ip.to_string(),
            mac: mac.to_string(),
            reason: e.to_string(),
        })?;
        state.installed.insert(ip.to_string(), (mac.to_string(), mark));
        Ok(())
    }

    fn deny(&self, ip: &str, _mac: &str, _mark: Mark) {
        self.lock().installed.remove(ip);
    }

    fn read_counters(&self) -> HashMap<String, CounterDelta> {
        self.lock().counters.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_then_deny_leaves_no_installed_rule() -> anyhow::Result<()> {
        let backend = MockFirewallBackend::new();
        backend.allow("10.0.0.5", "aa:bb:cc:dd:ee:ff", Mark::Known)?;
        assert_eq!(backend.lock().installed.len(), 1);
        backend.deny("10.0.0.5", "aa:bb:cc:dd:ee:ff", Mark::Known);
        assert!(backend.lock().installed.is_empty());
        Ok(())
    }

    #[test]
    fn allow_respects_injected_failure() {
        let backend = MockFirewallBackend::new();
        backend.lock().fail_on.insert("allow".to_string(), "simulated rule install failure".to_string());
        let err = backend.allow("10.0.0.5", "aa:bb:cc:dd:ee:ff", Mark::Known).unwrap_err();
        assert!(matches!(err, Error::AllowFailed { .. }));
        assert!(backend.lock().installed.is_empty());
    }

    #[test]
    fn destroy_clears_installed_rules_and_marks_destroyed() -> anyhow::Result<()> {
        let backend = MockFirewallBackend::new();
        backend.allow("10.0.0.5", "aa:bb:cc:dd:ee:ff", Mark::Known)?;
        backend.destroy();
        assert!(backend.lock().installed.is_empty());
        assert!(backend.lock().destroyed);
        Ok(())
    }
}
