//! Periodic counter-sync/decision tick and inactivity sweep.
//!
//! [`Scheduler::tick`] is the single entry point the daemon drives off a
//! `crossbeam_channel::tick` timer. The counter sync and the per-client decision are
//! folded into one pass since both run at `check_interval` and an inactive client is just
//! one more per-client decision. Neither phase holds the `ClientTable` lock across the
//! firewall or auth-server calls: both snapshot first, then re-find by token before
//! mutating, so a session deleted mid-tick is skipped rather than resurrected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::auth_client::{AuthClient, AuthTransport};
use crate::client_table::{Client, ClientTable, Counters};
use crate::config::Config;
use crate::firewall::{CounterDelta, FirewallBackend};
use crate::lifecycle;

pub struct Scheduler<T: AuthTransport = crate::auth_client::ReqwestTransport> {
    config: Arc<Config>,
    table: Arc<ClientTable>,
    auth: Arc<AuthClient<T>>,
    firewall: Arc<dyn FirewallBackend>,
}

impl<T: AuthTransport> Scheduler<T> {
    pub fn new(config: Arc<Config>, table: Arc<ClientTable>, auth: Arc<AuthClient<T>>, firewall: Arc<dyn FirewallBackend>) -> Self {
        Scheduler { config, table, auth, firewall }
    }

    /// Runs one counter-and-decide tick: syncs every client's counters from the firewall,
    /// then asks the auth server for a verdict (or evicts outright on inactivity).
    pub fn tick(&self) {
        let snapshot = self.table.iter_snapshot();
        let deltas = self.firewall.read_counters();

        for client in &snapshot {
            self.sync_counters(client, &deltas);
        }

        for client in &snapshot {
            let Some(current) = self.table.find_by_token(&client.token) else {
                continue;
            };
            self.decide(&current);
        }
    }

    /// Applies the freshly-read byte counts for one client, advancing `last_updated` only
    /// when some counter strictly increased (incoming, outgoing, or to_gateway — any of
    /// the three counts as activity).
    fn sync_counters(&self, client: &Client, deltas: &HashMap<String, CounterDelta>) {
        let Some(delta) = deltas.get(&client.ip) else {
            return;
        };
        let observed = Counters { incoming: delta.incoming, outgoing: delta.outgoing, to_gateway: delta.to_gateway };
        if !observed.increased_from(&client.counters) {
            return;
        }

        let now = SystemTime::now();
        if let Err(e) = self.table.update_by_token(&client.token, |c| {
            c.counters = observed;
            c.last_updated = now;
        }) {
            tracing::debug!(error = %e, ip = %client.ip, "client vanished before counter sync could apply");
        }
    }

    /// Evicts the client if it has been inactive past `check_interval * client_timeout`;
    /// otherwise asks the auth server for a verdict and applies the usual
    /// verdict-to-state mapping.
    fn decide(&self, client: &Client) {
        if client.is_inactive(self.config.check_interval, self.config.client_timeout) {
            tracing::info!(ip = %client.ip, mac = %client.mac, "evicting client after inactivity timeout");
            lifecycle::evict(&self.table, self.firewall.as_ref(), &self.auth, client);
            return;
        }

        let verdict = self.auth.counters(&client.token, &client.ip, &client.mac, client.counters.incoming, client.counters.outgoing);
        let outcome = lifecycle::apply_verdict(&self.table, self.firewall.as_ref(), client, verdict);
        tracing::debug!(ip = %client.ip, ?outcome, "tick decision applied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_client::mocks::MockAuthTransport;
    use crate::client_table::Mark;
    use crate::config::{AuthServerConfig, Rulesets};
    use crate::firewall::mocks::MockFirewallBackend;
    use std::time::Duration;

    fn config(check_interval: Duration, client_timeout: u32) -> Config {
        Config {
            gateway_id: "gw-01".to_string(),
            gateway_interface: "br-lan".to_string(),
            gateway_address: "192.168.1.1".to_string(),
            gateway_port: 2060,
            external_interface: None,
            auth_servers: vec![AuthServerConfig {
                host: "auth.example.com".to_string(),
                http_port: 80,
                ssl_port: 443,
                use_ssl: false,
                base_path: "/wifidog/".to_string(),
            }],
            check_interval,
            client_timeout,
            auth_max_tries: 3,
            httpd_max_conn: 25,
            httpd_name: "gatewayd".to_string(),
            syslog_facility: None,
            wdctl_socket: "/var/run/gatewayd.sock".into(),
            daemon: false,
            debug_level: 0,
            rulesets: Rulesets::default(),
        }
    }

    #[test]
    fn tick_syncs_counters_and_keeps_known_client_on_allowed_verdict() -> anyhow::Result<()> {
        let config = Arc::new(config(Duration::from_secs(60), 5));
        let table = Arc::new(ClientTable::new());
        table.append("10.0.0.5", "aa:bb:cc:dd:ee:ff", "tok-1")?;
        table.update_by_token("tok-1", |c| c.mark = Mark::Known)?;

        let firewall = Arc::new(MockFirewallBackend::new());
        firewall.allow("10.0.0.5", "aa:bb:cc:dd:ee:ff", Mark::Known)?;
        firewall.state.lock().unwrap().counters.insert(
            "10.0.0.5".to_string(),
            CounterDelta { incoming: 1000, outgoing: 500, to_gateway: 10 },
        );

        let transport = MockAuthTransport::new();
        transport.respond_with("auth.example.com", "Auth: 1");
        let auth = Arc::new(AuthClient::with_transport(&config, transport));

        let scheduler = Scheduler::new(config, table.clone(), auth, firewall.clone() as Arc<dyn FirewallBackend>);
        scheduler.tick();

        let client = table.find_by_ip("10.0.0.5").expect("client still present");
        assert_eq!(client.mark, Mark::Known);
        assert_eq!(client.counters.incoming, 1000);
        assert_eq!(client.counters.outgoing, 500);
        Ok(())
    }

    #[test]
    fn tick_evicts_client_whose_counters_never_increase() -> anyhow::Result<()> {
        let config = Arc::new(config(Duration::from_secs(60), 1));
        let table = Arc::new(ClientTable::new());
        table.append("10.0.0.5", "aa:bb:cc:dd:ee:ff", "tok-1")?;
        table.update_by_token("tok-1", |c| {
            c.mark = Mark::Known;
            c.last_updated = SystemTime::now() - Duration::from_secs(120);
        })?;

        let firewall = Arc::new(MockFirewallBackend::new());
        firewall.allow("10.0.0.5", "aa:bb:cc:dd:ee:ff", Mark::Known)?;

        let auth = Arc::new(AuthClient::with_transport(&config, MockAuthTransport::new()));
        let scheduler = Scheduler::new(config, table.clone(), auth, firewall.clone() as Arc<dyn FirewallBackend>);
        scheduler.tick();

        assert!(table.find_by_ip("10.0.0.5").is_none());
        assert!(firewall.state.lock().unwrap().installed.is_empty());
        Ok(())
    }

    #[test]
    fn tick_removes_client_on_denied_verdict() -> anyhow::Result<()> {
        let config = Arc::new(config(Duration::from_secs(60), 5));
        let table = Arc::new(ClientTable::new());
        table.append("10.0.0.5", "aa:bb:cc:dd:ee:ff", "tok-1")?;
        table.update_by_token("tok-1", |c| c.mark = Mark::Known)?;

        let firewall = Arc::new(MockFirewallBackend::new());
        firewall.allow("10.0.0.5", "aa:bb:cc:dd:ee:ff", Mark::Known)?;

        let transport = MockAuthTransport::new();
        transport.respond_with("auth.example.com", "Auth: 0");
        let auth = Arc::new(AuthClient::with_transport(&config, transport));

        let scheduler = Scheduler::new(config, table.clone(), auth, firewall.clone() as Arc<dyn FirewallBackend>);
        scheduler.tick();

        assert!(table.find_by_ip("10.0.0.5").is_none());
        assert!(firewall.state.lock().unwrap().installed.is_empty());
        Ok(())
    }
}
