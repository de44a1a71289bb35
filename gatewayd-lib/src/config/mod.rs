//! Reads the daemon's line-oriented configuration file into an immutable [`Config`].
//!
//! The format predates TOML-everywhere and is intentionally simple: whitespace
//! separated keywords, `#` line comments, and two nested block forms
//! (`AuthServer { ... }`, `FirewallRuleSet <name> { ... }`). See the parser
//! module for the grammar itself.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

mod parser;

pub const DEFAULT_PATH: &str = "/etc/gatewayd/gatewayd.conf";
pub const ENV_VAR: &str = "GATEWAYD_CONFIG_PATH";

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CLIENT_TIMEOUT: u32 = 5;
pub const DEFAULT_AUTH_MAX_TRIES: u32 = 3;
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_SSL_PORT: u16 = 443;
pub const DEFAULT_BASE_PATH: &str = "/wifidog/";
pub const DEFAULT_GATEWAY_PORT: u16 = 2060;

#[derive(Debug, Error)]
pub enum Error {
    #[error("error reading configuration file `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("line {line}: {reason}")]
    Invalid { line: usize, reason: String },
    #[error("missing required configuration key `{0}`")]
    MissingRequired(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Block,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirewallRule {
    pub action: RuleAction,
    pub protocol: Protocol,
    pub port: Option<u16>,
    pub destination: Option<ipnetwork::IpNetwork>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rulesets {
    pub locked_users: Vec<FirewallRule>,
    pub global: Vec<FirewallRule>,
    pub validating_users: Vec<FirewallRule>,
    pub known_users: Vec<FirewallRule>,
    pub unknown_users: Vec<FirewallRule>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuthServerConfig {
    pub host: String,
    pub http_port: u16,
    pub ssl_port: u16,
    pub use_ssl: bool,
    pub base_path: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub gateway_id: String,
    pub gateway_interface: String,
    pub gateway_address: String,
    pub gateway_port: u16,
    pub external_interface: Option<String>,
    pub auth_servers: Vec<AuthServerConfig>,
    pub check_interval: Duration,
    pub client_timeout: u32,
    pub auth_max_tries: u32,
    pub httpd_max_conn: u32,
    pub httpd_name: String,
    pub syslog_facility: Option<String>,
    pub wdctl_socket: PathBuf,
    pub daemon: bool,
    pub debug_level: u8,
    pub rulesets: Rulesets,
}

pub fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
    let (config, unknown_keys) = parser::parse(&content)?;

    for key in unknown_keys.iter() {
        tracing::warn!(%key, "ignoring unsupported key in configuration file");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> &'static str {
        r#"
        # minimal gateway configuration
        GatewayID gw-01
        GatewayInterface br-lan
        GatewayAddress 192.168.1.1
        GatewayPort 2060
        CheckInterval 30
        ClientTimeout 3

        AuthServer {
            Hostname auth.example.com
            SSLAvailable yes
            SSLPort 443
            HTTPPort 80
            Path /wifidog/
        }

        FirewallRuleSet global {
            FirewallRule allow udp port 53
            FirewallRule allow tcp port 53
            FirewallRule block udp port 0 to 192.168.0.0/16
        }

        NotAKeyword oops
        "#
    }

    #[test]
    fn parses_minimal_config_with_one_auth_server() -> anyhow::Result<()> {
        let (config, unknown) = parser::parse(sample())?;
        assert_eq!(config.gateway_id, "gw-01");
        assert_eq!(config.auth_servers.len(), 1);
        assert_eq!(config.auth_servers[0].host, "auth.example.com");
        assert!(config.auth_servers[0].use_ssl);
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert_eq!(config.client_timeout, 3);
        assert_eq!(config.rulesets.global.len(), 3);
        assert_eq!(unknown, vec!["NotAKeyword".to_string()]);
        Ok(())
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let err = parser::parse("GatewayID gw-01\n").unwrap_err();
        assert!(matches!(err, Error::MissingRequired(_)));
    }

    #[test]
    fn read_parses_config_file_from_disk() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(sample().as_bytes())?;
        let config = read(file.path())?;
        assert_eq!(config.gateway_id, "gw-01");
        assert_eq!(config.auth_servers[0].host, "auth.example.com");
        Ok(())
    }

    #[test]
    fn read_missing_file_returns_io_error() {
        let err = read(Path::new("/nonexistent/gatewayd.conf")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
