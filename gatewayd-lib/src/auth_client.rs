//! Speaks the auth protocol to the remote service and interprets its verdicts.
//!
//! HTTP transport is abstracted behind [`AuthTransport`] so tests substitute
//! [`mocks::MockAuthTransport`] instead of hitting the network, the same way
//! the firewall backend is abstracted behind `IptablesOps`.

#[cfg(test)]
pub mod mocks;

use std::sync::Mutex;
use std::time::Duration;

use reqwest::blocking::Client;
use thiserror::Error;

use crate::config::{AuthServerConfig, Config};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("error connecting to auth server: {0}")]
    Connect(String),
    #[error("auth server returned an error response: {0}")]
    Response(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied,
    Validation,
    ValidationFailed,
    Locked,
    Error,
}

impl Verdict {
    fn from_code(code: i64) -> Self {
        match code {
            1 => Verdict::Allowed,
            0 => Verdict::Denied,
            5 => Verdict::Validation,
            6 => Verdict::ValidationFailed,
            254 => Verdict::Locked,
            _ => Verdict::Error,
        }
    }
}

/// Parses the first `Auth: <digit>` line found in the response body. Any other body,
/// or no match at all, yields `Verdict::Error`.
fn parse_verdict(body: &str) -> Verdict {
    for line in body.lines() {
        if let Some(rest) = line.trim().strip_prefix("Auth:") {
            if let Ok(code) = rest.trim().parse::<i64>() {
                return Verdict::from_code(code);
            }
        }
    }
    Verdict::Error
}

/// Abstraction over the blocking HTTP GET used for every auth-server call.
pub trait AuthTransport: Send + Sync {
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<String, Error>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_else(|_| Client::new());
        ReqwestTransport { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthTransport for ReqwestTransport {
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<String, Error> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .map_err(|e| Error::Connect(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Response(e.to_string()))?;
        resp.text().map_err(|e| Error::Response(e.to_string()))
    }
}

struct ServerState {
    servers: Vec<AuthServerConfig>,
}

/// Issues `login`/`counters`/`logout`/`ping` calls against the currently preferred auth
/// server, rotating unresponsive servers to the tail of the list (see
/// [`AuthClient::demote_current`]).
pub struct AuthClient<T: AuthTransport = ReqwestTransport> {
    transport: T,
    gateway_id: String,
    max_tries: u32,
    servers: Mutex<ServerState>,
}

impl AuthClient<ReqwestTransport> {
    pub fn new(config: &Config) -> Self {
        AuthClient::with_transport(config, ReqwestTransport::new())
    }
}

impl<T: AuthTransport> AuthClient<T> {
    pub fn with_transport(config: &Config, transport: T) -> Self {
        AuthClient {
            transport,
            gateway_id: config.gateway_id.clone(),
            max_tries: config.auth_max_tries,
            servers: Mutex::new(ServerState { servers: config.auth_servers.clone() }),
        }
    }

    fn servers_snapshot(&self) -> Vec<AuthServerConfig> {
        self.lock().servers.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.servers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Moves the current head of the server list to the tail, in order, across repeated
    /// calls — a broken primary is naturally deprioritized without ever being dropped.
    pub fn demote_current(&self) {
        let mut state = self.lock();
        if !state.servers.is_empty() {
            let demoted = state.servers.remove(0);
            tracing::warn!(host = %demoted.host, "demoting unresponsive auth server to tail of list");
            state.servers.push(demoted);
        }
    }

    pub fn current_servers(&self) -> Vec<AuthServerConfig> {
        self.servers_snapshot()
    }

    fn base_url(server: &AuthServerConfig) -> String {
        let scheme = if server.use_ssl { "https" } else { "http" };
        let port = if server.use_ssl { server.ssl_port } else { server.http_port };
        format!("{scheme}://{}:{port}{}", server.host, server.base_path)
    }

    /// Tries the preferred server, then up to `auth_max_tries` distinct servers total,
    /// demoting each failure to the tail before moving on. Transport failures never
    /// surface as a `Result` error to callers — they become `Verdict::Error`.
    fn request(&self, path: &str, query: &[(&str, String)]) -> Verdict {
        let total_servers = self.servers_snapshot().len();
        if total_servers == 0 {
            tracing::error!("no auth servers configured");
            return Verdict::Error;
        }
        let tries = (self.max_tries as usize).min(total_servers).max(1);

        for attempt in 0..tries {
            let server = match self.servers_snapshot().into_iter().next() {
                Some(s) => s,
                None => break,
            };
            let url = format!("{}{}", Self::base_url(&server), path);
            match self.transport.get(&url, query) {
                Ok(body) => return parse_verdict(&body),
                Err(e) => {
                    tracing::warn!(error = %e, host = %server.host, attempt, "auth request failed");
                    self.demote_current();
                }
            }
        }

        Verdict::Error
    }

    pub fn login(&self, token: &str, ip: &str, mac: &str) -> Verdict {
        self.request(
            "auth/",
            &[
                ("stage", "login".to_string()),
                ("ip", ip.to_string()),
                ("mac", mac.to_string()),
                ("token", token.to_string()),
                ("gw_id", self.gateway_id.clone()),
            ],
        )
    }

    pub fn counters(&self, token: &str, ip: &str, mac: &str, incoming: u64, outgoing: u64) -> Verdict {
        self.request(
            "auth/",
            &[
                ("stage", "counters".to_string()),
                ("ip", ip.to_string()),
                ("mac", mac.to_string()),
                ("token", token.to_string()),
                ("incoming", incoming.to_string()),
                ("outgoing", outgoing.to_string()),
                ("gw_id", self.gateway_id.clone()),
            ],
        )
    }

    /// Best-effort: the verdict is ignored, the client is leaving either way.
    pub fn logout(&self, token: &str, ip: &str, mac: &str, incoming: u64, outgoing: u64) {
        let _ = self.request(
            "auth/",
            &[
                ("stage", "logout".to_string()),
                ("ip", ip.to_string()),
                ("mac", mac.to_string()),
                ("token", token.to_string()),
                ("incoming", incoming.to_string()),
                ("outgoing", outgoing.to_string()),
                ("gw_id", self.gateway_id.clone()),
            ],
        );
    }

    pub fn ping(&self, sys_uptime: u64, sys_memfree: u64, wifidog_uptime: u64) -> Verdict {
        self.request(
            "ping",
            &[
                ("sys_uptime", sys_uptime.to_string()),
                ("sys_memfree", sys_memfree.to_string()),
                ("wifidog_uptime", wifidog_uptime.to_string()),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::MockAuthTransport;
    use super::*;
    use crate::config::AuthServerConfig;

    fn server(host: &str) -> AuthServerConfig {
        AuthServerConfig {
            host: host.to_string(),
            http_port: 80,
            ssl_port: 443,
            use_ssl: false,
            base_path: "/wifidog/".to_string(),
        }
    }

    fn config_with_servers(hosts: &[&str]) -> Config {
        Config {
            gateway_id: "gw-01".to_string(),
            gateway_interface: "br-lan".to_string(),
            gateway_address: "192.168.1.1".to_string(),
            gateway_port: 2060,
            external_interface: None,
            auth_servers: hosts.iter().map(|h| server(h)).collect(),
            check_interval: Duration::from_secs(60),
            client_timeout: 5,
            auth_max_tries: 3,
            httpd_max_conn: 25,
            httpd_name: "gatewayd".to_string(),
            syslog_facility: None,
            wdctl_socket: "/var/run/gatewayd.sock".into(),
            daemon: false,
            debug_level: 0,
            rulesets: Default::default(),
        }
    }

    #[test]
    fn parse_verdict_reads_auth_line() {
        assert_eq!(parse_verdict("some preamble\nAuth: 1\ntrailer"), Verdict::Allowed);
        assert_eq!(parse_verdict("Auth: 0"), Verdict::Denied);
        assert_eq!(parse_verdict("Auth: 254"), Verdict::Locked);
        assert_eq!(parse_verdict("nothing recognizable here"), Verdict::Error);
    }

    #[test]
    fn login_fails_over_to_next_server_on_transport_error() -> anyhow::Result<()> {
        let config = config_with_servers(&["primary.example.com", "secondary.example.com"]);
        let transport = MockAuthTransport::new();
        transport.fail_host("primary.example.com");
        transport.respond_with("secondary.example.com", "Auth: 1");

        let client = AuthClient::with_transport(&config, transport);
        let verdict = client.login("tok-1", "10.0.0.5", "aa:bb:cc:dd:ee:ff");

        assert_eq!(verdict, Verdict::Allowed);
        assert_eq!(client.current_servers()[0].host, "secondary.example.com");
        Ok(())
    }

    #[test]
    fn login_rotates_multiple_failed_servers_to_the_tail_in_order() -> anyhow::Result<()> {
        let config = config_with_servers(&["a.example.com", "b.example.com", "c.example.com"]);
        let transport = MockAuthTransport::new();
        transport.fail_host("a.example.com");
        transport.fail_host("b.example.com");
        transport.respond_with("c.example.com", "Auth: 1");

        let client = AuthClient::with_transport(&config, transport);
        let verdict = client.login("tok-1", "10.0.0.5", "aa:bb:cc:dd:ee:ff");

        assert_eq!(verdict, Verdict::Allowed);
        let order: Vec<String> = client.current_servers().into_iter().map(|s| s.host).collect();
        assert_eq!(order, vec!["c.example.com", "a.example.com", "b.example.com"]);
        Ok(())
    }

    #[test]
    fn login_surfaces_error_when_all_servers_exhausted() -> anyhow::Result<()> {
        let config = config_with_servers(&["a.example.com", "b.example.com"]);
        let transport = MockAuthTransport::new();
        transport.fail_host("a.example.com");
        transport.fail_host("b.example.com");

        let client = AuthClient::with_transport(&config, transport);
        assert_eq!(client.login("tok-1", "10.0.0.5", "aa:bb:cc:dd:ee:ff"), Verdict::Error);
        Ok(())
    }
}
