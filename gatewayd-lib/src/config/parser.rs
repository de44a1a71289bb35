use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use ipnetwork::IpNetwork;

use super::{
    AuthServerConfig, Config, DEFAULT_AUTH_MAX_TRIES, DEFAULT_BASE_PATH, DEFAULT_CHECK_INTERVAL,
    DEFAULT_CLIENT_TIMEOUT, DEFAULT_GATEWAY_PORT, DEFAULT_HTTP_PORT, DEFAULT_SSL_PORT, Error, FirewallRule,
    Protocol, RuleAction, Rulesets,
};

#[derive(Default)]
struct Builder {
    gateway_id: Option<String>,
    gateway_interface: Option<String>,
    gateway_address: Option<String>,
    gateway_port: Option<u16>,
    external_interface: Option<String>,
    auth_servers: Vec<AuthServerConfig>,
    check_interval: Option<u64>,
    client_timeout: Option<u32>,
    auth_max_tries: Option<u32>,
    httpd_max_conn: Option<u32>,
    httpd_name: Option<String>,
    syslog_facility: Option<String>,
    wdctl_socket: Option<String>,
    daemon: Option<bool>,
    debug_level: Option<u8>,
    rulesets: Rulesets,
}

impl Builder {
    fn set_ruleset(&mut self, name: &str, rules: Vec<FirewallRule>, line: usize) -> Result<(), Error> {
        match name.to_ascii_lowercase().as_str() {
            "locked-users" => self.rulesets.locked_users = rules,
            "global" => self.rulesets.global = rules,
            "validating-users" => self.rulesets.validating_users = rules,
            "known-users" => self.rulesets.known_users = rules,
            "unknown-users" => self.rulesets.unknown_users = rules,
            other => {
                tracing::warn!(ruleset = %other, line, "ignoring unrecognized firewall ruleset name");
            }
        }
        Ok(())
    }

    fn build(self) -> Result<Config, Error> {
        let gateway_id = self.gateway_id.ok_or(Error::MissingRequired("GatewayID"))?;
        let gateway_interface = self.gateway_interface.ok_or(Error::MissingRequired("GatewayInterface"))?;
        let gateway_address = self.gateway_address.ok_or(Error::MissingRequired("GatewayAddress"))?;
        if self.auth_servers.is_empty() {
            return Err(Error::MissingRequired("AuthServer"));
        }

        Ok(Config {
            gateway_id,
            gateway_interface,
            gateway_address,
            gateway_port: self.gateway_port.unwrap_or(DEFAULT_GATEWAY_PORT),
            external_interface: self.external_interface,
            auth_servers: self.auth_servers,
            check_interval: self.check_interval.map(std::time::Duration::from_secs).unwrap_or(DEFAULT_CHECK_INTERVAL),
            client_timeout: self.client_timeout.unwrap_or(DEFAULT_CLIENT_TIMEOUT),
            auth_max_tries: self.auth_max_tries.unwrap_or(DEFAULT_AUTH_MAX_TRIES),
            httpd_max_conn: self.httpd_max_conn.unwrap_or(25),
            httpd_name: self.httpd_name.unwrap_or_else(|| "gatewayd".to_string()),
            syslog_facility: self.syslog_facility,
            wdctl_socket: self.wdctl_socket.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(crate::socket::DEFAULT_PATH)),
            daemon: self.daemon.unwrap_or(false),
            debug_level: self.debug_level.unwrap_or(0),
            rulesets: self.rulesets,
        })
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_num<T: FromStr>(rest: &[&str], line: usize, keyword: &str) -> Result<T, Error> {
    rest.first()
        .and_then(|token| token.parse::<T>().ok())
        .ok_or_else(|| Error::Invalid { line, reason: format!("`{keyword}` requires a numeric value") })
}

fn parse_bool_token(rest: &[&str], line: usize, keyword: &str) -> Result<bool, Error> {
    match rest.first().map(|t| t.to_ascii_lowercase()) {
        Some(t) if t == "yes" || t == "true" || t == "1" => Ok(true),
        Some(t) if t == "no" || t == "false" || t == "0" => Ok(false),
        _ => Err(Error::Invalid { line, reason: format!("`{keyword}` requires yes/no") }),
    }
}

/// Collects lines until the closing `}` of a block opened on `start_line`.
fn collect_block<'a, I>(lines: &mut I, start_line: usize) -> Result<Vec<(usize, String)>, Error>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let mut block = Vec::new();
    for (lineno, raw) in lines.by_ref() {
        let line = strip_comment(raw).trim();
        if line == "}" {
            return Ok(block);
        }
        if !line.is_empty() {
            block.push((lineno, line.to_string()));
        }
    }
    Err(Error::Invalid { line: start_line + 1, reason: "unterminated block, missing `}`".to_string() })
}

fn parse_auth_server(block: &[(usize, String)]) -> Result<AuthServerConfig, Error> {
    let mut host = None;
    let mut use_ssl = false;
    let mut ssl_port = DEFAULT_SSL_PORT;
    let mut http_port = DEFAULT_HTTP_PORT;
    let mut base_path = DEFAULT_BASE_PATH.to_string();

    for (lineno, line) in block {
        let line_no = lineno + 1;
        let mut tokens = line.split_whitespace();
        let keyword = tokens.next().unwrap_or_default();
        let rest: Vec<&str> = tokens.collect();
        match keyword.to_ascii_lowercase().as_str() {
            "hostname" => host = Some(rest.join(" ")),
            "sslavailable" => use_ssl = parse_bool_token(&rest, line_no, "SSLAvailable")?,
            "sslport" => ssl_port = parse_num(&rest, line_no, "SSLPort")?,
            "httpport" => http_port = parse_num(&rest, line_no, "HTTPPort")?,
            "path" => base_path = rest.join(" "),
            other => {
                tracing::warn!(key = %other, line = line_no, "ignoring unsupported key inside AuthServer block");
            }
        }
    }

    let host = host.ok_or(Error::Invalid {
        line: block.first().map(|(l, _)| l + 1).unwrap_or(0),
        reason: "AuthServer block requires a Hostname".to_string(),
    })?;

    Ok(AuthServerConfig { host, http_port, ssl_port, use_ssl, base_path })
}

fn parse_firewall_rule(tokens: &[&str], line: usize) -> Result<FirewallRule, Error> {
    // tokens: [action, protocol, "port", n, ("to", cidr)?]
    let action = match tokens.first().map(|t| t.to_ascii_lowercase()) {
        Some(t) if t == "allow" => RuleAction::Allow,
        Some(t) if t == "block" => RuleAction::Block,
        _ => return Err(Error::Invalid { line, reason: "FirewallRule requires allow|block".to_string() }),
    };
    let protocol = match tokens.get(1).map(|t| t.to_ascii_lowercase()) {
        Some(t) if t == "tcp" => Protocol::Tcp,
        Some(t) if t == "udp" => Protocol::Udp,
        Some(t) if t == "icmp" => Protocol::Icmp,
        _ => return Err(Error::Invalid { line, reason: "FirewallRule requires tcp|udp|icmp".to_string() }),
    };

    let mut port = None;
    let mut destination = None;
    let mut idx = 2;
    while idx < tokens.len() {
        match tokens[idx].to_ascii_lowercase().as_str() {
            "port" => {
                let value = tokens
                    .get(idx + 1)
                    .and_then(|t| t.parse::<u16>().ok())
                    .ok_or_else(|| Error::Invalid { line, reason: "`port` requires a numeric value".to_string() })?;
                port = Some(value);
                idx += 2;
            }
            "to" => {
                let cidr = tokens.get(idx + 1).ok_or_else(|| Error::Invalid {
                    line,
                    reason: "`to` requires a destination CIDR".to_string(),
                })?;
                let network = IpNetwork::from_str(cidr)
                    .or_else(|_| IpAddr::from_str(cidr).map(IpNetwork::from))
                    .map_err(|_| Error::Invalid { line, reason: format!("invalid destination mask `{cidr}`") })?;
                destination = Some(network);
                idx += 2;
            }
            other => {
                return Err(Error::Invalid { line, reason: format!("unexpected token `{other}` in FirewallRule") });
            }
        }
    }

    Ok(FirewallRule { action, protocol, port, destination })
}

fn parse_ruleset(block: &[(usize, String)]) -> Result<Vec<FirewallRule>, Error> {
    let mut rules = Vec::with_capacity(block.len());
    for (lineno, line) in block {
        let line_no = lineno + 1;
        let mut tokens = line.split_whitespace();
        let keyword = tokens.next().unwrap_or_default();
        if !keyword.eq_ignore_ascii_case("firewallrule") {
            tracing::warn!(key = %keyword, line = line_no, "ignoring unsupported key inside FirewallRuleSet block");
            continue;
        }
        let rest: Vec<&str> = tokens.collect();
        rules.push(parse_firewall_rule(&rest, line_no)?);
    }
    Ok(rules)
}

pub fn parse(input: &str) -> Result<(Config, Vec<String>), Error> {
    let mut builder = Builder::default();
    let mut unknown_keys = Vec::new();

    let mut lines = input.lines().enumerate();
    while let Some((lineno, raw)) = lines.next() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = lineno + 1;
        let mut tokens = line.split_whitespace();
        let keyword = tokens.next().unwrap_or_default();
        let rest: Vec<&str> = tokens.collect();

        match keyword.to_ascii_lowercase().as_str() {
            "authserver" => {
                if rest.last() != Some(&"{") {
                    return Err(Error::Invalid { line: line_no, reason: "AuthServer block must open with `{`".to_string() });
                }
                let block = collect_block(&mut lines, lineno)?;
                builder.auth_servers.push(parse_auth_server(&block)?);
            }
            "firewallruleset" => {
                if rest.last() != Some(&"{") {
                    return Err(Error::Invalid { line: line_no, reason: "FirewallRuleSet block must open with `{`".to_string() });
                }
                let name = rest.first().ok_or_else(|| Error::Invalid {
                    line: line_no,
                    reason: "FirewallRuleSet requires a name".to_string(),
                })?;
                let block = collect_block(&mut lines, lineno)?;
                let rules = parse_ruleset(&block)?;
                builder.set_ruleset(name, rules, line_no)?;
            }
            "gatewayid" => builder.gateway_id = Some(rest.join(" ")),
            "gatewayinterface" => builder.gateway_interface = Some(rest.join(" ")),
            "gatewayaddress" => builder.gateway_address = Some(rest.join(" ")),
            "gatewayport" => builder.gateway_port = Some(parse_num(&rest, line_no, "GatewayPort")?),
            "externalinterface" => builder.external_interface = Some(rest.join(" ")),
            "checkinterval" => builder.check_interval = Some(parse_num(&rest, line_no, "CheckInterval")?),
            "clienttimeout" => builder.client_timeout = Some(parse_num(&rest, line_no, "ClientTimeout")?),
            "authservmaxtries" => builder.auth_max_tries = Some(parse_num(&rest, line_no, "AuthServMaxTries")?),
            "httpdmaxconn" => builder.httpd_max_conn = Some(parse_num(&rest, line_no, "HTTPDMaxConn")?),
            "httpdname" => builder.httpd_name = Some(rest.join(" ")),
            "syslogfacility" => builder.syslog_facility = Some(rest.join(" ")),
            "wdctlsocket" => builder.wdctl_socket = Some(rest.join(" ")),
            "daemon" => builder.daemon = Some(parse_bool_token(&rest, line_no, "Daemon")?),
            "debuglevel" => builder.debug_level = Some(parse_num(&rest, line_no, "DebugLevel")?),
            _ => unknown_keys.push(keyword.to_string()),
        }
    }

    Ok((builder.build()?, unknown_keys))
}
