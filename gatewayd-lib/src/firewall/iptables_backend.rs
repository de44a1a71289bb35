//! Reference [`FirewallBackend`](super::FirewallBackend) driving the Linux `iptables` tool.
//!
//! Chain and rule lifecycle goes through [`IptablesOps`], a thin trait mirroring the
//! `iptables` crate's API so tests can substitute a stateful fake without touching the
//! kernel. Byte-counter harvesting shells out to the `iptables` binary directly with
//! `-v -x -n -L`, since the crate exposes no verbose-counter query; this mirrors how the
//! original gateway read counters, just as a structured parser instead of `popen`+`fscanf`.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;

use super::{
    CHAIN_AUTHSERVERS, CHAIN_GLOBAL, CHAIN_INCOMING, CHAIN_KNOWN, CHAIN_LOCKED, CHAIN_OUTGOING,
    CHAIN_UNKNOWN_FILTER, CHAIN_UNKNOWN_NAT, CHAIN_VALIDATE, CHAIN_WIFI_TO_GW, CHAIN_WIFI_TO_INTERNET_FILTER,
    CHAIN_WIFI_TO_INTERNET_NAT, CounterDelta, Error, FirewallBackend, TABLE_FILTER, TABLE_MANGLE, TABLE_NAT,
};
use crate::client_table::Mark;
use crate::config::{Config, FirewallRule, Protocol, RuleAction};

/// Abstraction over iptables chain and rule operations, mirroring the `iptables` crate's
/// synchronous API.
pub trait IptablesOps: Send + Sync {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, Error>;
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), Error>;
    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), Error>;
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), Error>;
    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Error>;
    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, Error>;
}

/// Production [`IptablesOps`] backed by the `iptables` crate.
pub struct RealIptablesOps {
    inner: iptables::IPTables,
}

impl RealIptablesOps {
    pub fn new() -> Result<Self, Error> {
        let inner = iptables::new(false).map_err(|e| Error::Shell(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl IptablesOps for RealIptablesOps {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, Error> {
        self.inner.chain_exists(table, chain).map_err(|e| Error::Shell(e.to_string()))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.inner.new_chain(table, chain).map_err(|e| Error::Shell(e.to_string()))
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.inner.flush_chain(table, chain).map_err(|e| Error::Shell(e.to_string()))
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.inner.delete_chain(table, chain).map_err(|e| Error::Shell(e.to_string()))
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.inner.append(table, chain, rule).map_err(|e| Error::Shell(e.to_string()))
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.inner.delete(table, chain, rule).map_err(|e| Error::Shell(e.to_string()))
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Error> {
        self.inner.exists(table, chain, rule).map_err(|e| Error::Shell(e.to_string()))
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, Error> {
        self.inner.list(table, chain).map_err(|e| Error::Shell(e.to_string()))
    }
}

struct Scaffolding {
    gateway_interface: String,
}

pub struct IptablesBackend<T: IptablesOps> {
    ops: T,
    scaffolding: Mutex<Option<Scaffolding>>,
}

impl<T: IptablesOps> IptablesBackend<T> {
    pub fn new(ops: T) -> Self {
        Self { ops, scaffolding: Mutex::new(None) }
    }

    fn create_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        if self.ops.chain_exists(table, chain).unwrap_or(false) {
            self.ops.flush_chain(table, chain)?;
        } else {
            self.ops.new_chain(table, chain)?;
        }
        Ok(())
    }

    fn load_ruleset(&self, chain: &str, rules: &[FirewallRule]) -> Result<(), Error> {
        for rule in rules {
            self.ops.append(TABLE_FILTER, chain, &rule_spec(rule))?;
        }
        Ok(())
    }

    fn remove_link(&self, table: &str, chain: &str, rule: &str) {
        if let Err(e) = self.ops.delete(table, chain, rule) {
            tracing::debug!(error = %e, table, chain, rule, "rule absent or delete failed during teardown");
        }
    }
}

impl<T: IptablesOps> FirewallBackend for IptablesBackend<T> {
    fn init(&self, config: &Config) -> Result<(), Error> {
        self.destroy();

        for (table, chain) in [
            (TABLE_MANGLE, CHAIN_OUTGOING),
            (TABLE_MANGLE, CHAIN_INCOMING),
            (TABLE_NAT, CHAIN_WIFI_TO_INTERNET_NAT),
            (TABLE_NAT, CHAIN_UNKNOWN_NAT),
            (TABLE_FILTER, CHAIN_WIFI_TO_GW),
            (TABLE_FILTER, CHAIN_WIFI_TO_INTERNET_FILTER),
            (TABLE_FILTER, CHAIN_AUTHSERVERS),
            (TABLE_FILTER, CHAIN_LOCKED),
            (TABLE_FILTER, CHAIN_GLOBAL),
            (TABLE_FILTER, CHAIN_VALIDATE),
            (TABLE_FILTER, CHAIN_KNOWN),
            (TABLE_FILTER, CHAIN_UNKNOWN_FILTER),
        ] {
            self.create_chain(table, chain)?;
        }

        let iface = &config.gateway_interface;
        self.ops.append(TABLE_MANGLE, "PREROUTING", &format!("-i {iface} -j {CHAIN_OUTGOING}"))?;
        self.ops.append(TABLE_MANGLE, "POSTROUTING", &format!("-o {iface} -j {CHAIN_INCOMING}"))?;
        self.ops.append(TABLE_NAT, "PREROUTING", &format!("-i {iface} -j {CHAIN_WIFI_TO_INTERNET_NAT}"))?;
        self.ops.append(TABLE_FILTER, "FORWARD", &format!("-i {iface} -j {CHAIN_WIFI_TO_INTERNET_FILTER}"))?;
        self.ops.append(TABLE_FILTER, "INPUT", &format!("-i {iface} -j {CHAIN_WIFI_TO_GW}"))?;

        self.ops.append(
            TABLE_NAT,
            CHAIN_UNKNOWN_NAT,
            &format!("-p tcp --dport 80 -j DNAT --to-destination {}:{}", config.gateway_address, config.gateway_port),
        )?;
        self.ops.append(
            TABLE_NAT,
            CHAIN_WIFI_TO_INTERNET_NAT,
            &format!("-m mark --mark {} -j {CHAIN_UNKNOWN_NAT}", Mark::Unknown.code()),
        )?;

        for server in &config.auth_servers {
            self.ops.append(TABLE_FILTER, CHAIN_AUTHSERVERS, &format!("-d {} -j RETURN", server.host))?;
        }

        self.ops.append(TABLE_FILTER, CHAIN_WIFI_TO_GW, "-j ACCEPT")?;

        self.ops.append(TABLE_FILTER, CHAIN_WIFI_TO_INTERNET_FILTER, &format!("-j {CHAIN_AUTHSERVERS}"))?;
        self.ops.append(
            TABLE_FILTER,
            CHAIN_WIFI_TO_INTERNET_FILTER,
            &format!("-m mark --mark {} -j {CHAIN_LOCKED}", Mark::Locked.code()),
        )?;
        self.ops.append(TABLE_FILTER, CHAIN_WIFI_TO_INTERNET_FILTER, &format!("-j {CHAIN_GLOBAL}"))?;
        self.ops.append(
            TABLE_FILTER,
            CHAIN_WIFI_TO_INTERNET_FILTER,
            &format!("-m mark --mark {} -j {CHAIN_VALIDATE}", Mark::Validation.code()),
        )?;
        self.ops.append(
            TABLE_FILTER,
            CHAIN_WIFI_TO_INTERNET_FILTER,
            &format!("-m mark --mark {} -j {CHAIN_KNOWN}", Mark::Known.code()),
        )?;
        self.ops.append(TABLE_FILTER, CHAIN_WIFI_TO_INTERNET_FILTER, &format!("-j {CHAIN_UNKNOWN_FILTER}"))?;

        self.load_ruleset(CHAIN_LOCKED, &config.rulesets.locked_users)?;
        self.load_ruleset(CHAIN_GLOBAL, &config.rulesets.global)?;
        self.load_ruleset(CHAIN_VALIDATE, &config.rulesets.validating_users)?;
        self.load_ruleset(CHAIN_KNOWN, &config.rulesets.known_users)?;
        self.load_ruleset(CHAIN_UNKNOWN_FILTER, &config.rulesets.unknown_users)?;

        let mut guard = self.scaffolding.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(Scaffolding { gateway_interface: config.gateway_interface.clone() });

        Ok(())
    }

    fn destroy(&self) {
        let scaffolding = self.scaffolding.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(s) = scaffolding {
            let iface = &s.gateway_interface;
            self.remove_link(TABLE_MANGLE, "PREROUTING", &format!("-i {iface} -j {CHAIN_OUTGOING}"));
            self.remove_link(TABLE_MANGLE, "POSTROUTING", &format!("-o {iface} -j {CHAIN_INCOMING}"));
            self.remove_link(TABLE_NAT, "PREROUTING", &format!("-i {iface} -j {CHAIN_WIFI_TO_INTERNET_NAT}"));
            self.remove_link(TABLE_FILTER, "FORWARD", &format!("-i {iface} -j {CHAIN_WIFI_TO_INTERNET_FILTER}"));
            self.remove_link(TABLE_FILTER, "INPUT", &format!("-i {iface} -j {CHAIN_WIFI_TO_GW}"));
        }

        for (table, chain) in [
            (TABLE_MANGLE, CHAIN_OUTGOING),
            (TABLE_MANGLE, CHAIN_INCOMING),
            (TABLE_NAT, CHAIN_WIFI_TO_INTERNET_NAT),
            (TABLE_NAT, CHAIN_UNKNOWN_NAT),
            (TABLE_FILTER, CHAIN_WIFI_TO_GW),
            (TABLE_FILTER, CHAIN_WIFI_TO_INTERNET_FILTER),
            (TABLE_FILTER, CHAIN_AUTHSERVERS),
            (TABLE_FILTER, CHAIN_LOCKED),
            (TABLE_FILTER, CHAIN_GLOBAL),
            (TABLE_FILTER, CHAIN_VALIDATE),
            (TABLE_FILTER, CHAIN_KNOWN),
            (TABLE_FILTER, CHAIN_UNKNOWN_FILTER),
        ] {
            if let Err(e) = self.ops.flush_chain(table, chain) {
                tracing::debug!(error = %e, table, chain, "chain already gone during teardown");
                continue;
            }
            if let Err(e) = self.ops.delete_chain(table, chain) {
                tracing::warn!(error = %e, table, chain, "failed deleting chain during teardown");
            }
        }
    }

    fn allow(&self, ip: &str, mac: &str, mark: Mark) -> Result<(), Error> {
        let gw_rule = format!("-s {ip} -j ACCEPT");
        let mark_rule = format!("-s {ip} -m mac --mac-source {mac} -j MARK --set-mark {}", mark.code());
        let incoming_rule = format!("-d {ip} -j ACCEPT");

        self.ops
            .append(TABLE_FILTER, CHAIN_WIFI_TO_GW, &gw_rule)
            .map_err(|e| Error::AllowFailed { ip: ip.to_string(), mac: mac.to_string(), reason: e.to_string() })?;

        if let Err(e) = self.ops.append(TABLE_MANGLE, CHAIN_OUTGOING, &mark_rule) {
            self.remove_link(TABLE_FILTER, CHAIN_WIFI_TO_GW, &gw_rule);
            return Err(Error::AllowFailed { ip: ip.to_string(), mac: mac.to_string(), reason: e.to_string() });
        }

        if let Err(e) = self.ops.append(TABLE_MANGLE, CHAIN_INCOMING, &incoming_rule) {
            self.remove_link(TABLE_FILTER, CHAIN_WIFI_TO_GW, &gw_rule);
            self.remove_link(TABLE_MANGLE, CHAIN_OUTGOING, &mark_rule);
            return Err(Error::AllowFailed { ip: ip.to_string(), mac: mac.to_string(), reason: e.to_string() });
        }

        Ok(())
    }

    fn deny(&self, ip: &str, mac: &str, mark: Mark) {
        self.remove_link(TABLE_FILTER, CHAIN_WIFI_TO_GW, &format!("-s {ip} -j ACCEPT"));
        self.remove_link(
            TABLE_MANGLE,
            CHAIN_OUTGOING,
            &format!("-s {ip} -m mac --mac-source {mac} -j MARK --set-mark {}", mark.code()),
        );
        self.remove_link(TABLE_MANGLE, CHAIN_INCOMING, &format!("-d {ip} -j ACCEPT"));
    }

    fn read_counters(&self) -> HashMap<String, CounterDelta> {
        let outgoing = verbose_list(TABLE_MANGLE, CHAIN_OUTGOING).map(|rows| parse_counter_rows(&rows, Column::Source));
        let incoming = verbose_list(TABLE_MANGLE, CHAIN_INCOMING).map(|rows| parse_counter_rows(&rows, Column::Destination));
        let to_gateway = verbose_list(TABLE_FILTER, CHAIN_WIFI_TO_GW).map(|rows| parse_counter_rows(&rows, Column::Source));

        let mut deltas: HashMap<String, CounterDelta> = HashMap::new();
        if let Some(map) = outgoing {
            for (ip, bytes) in map {
                deltas.entry(ip).or_default().outgoing = bytes;
            }
        }
        if let Some(map) = incoming {
            for (ip, bytes) in map {
                deltas.entry(ip).or_default().incoming = bytes;
            }
        }
        if let Some(map) = to_gateway {
            for (ip, bytes) in map {
                deltas.entry(ip).or_default().to_gateway = bytes;
            }
        }
        deltas
    }
}

fn protocol_str(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Icmp => "icmp",
    }
}

fn rule_spec(rule: &FirewallRule) -> String {
    let mut parts = vec![format!("-p {}", protocol_str(rule.protocol))];
    if let Some(port) = rule.port {
        if !matches!(rule.protocol, Protocol::Icmp) {
            parts.push(format!("--dport {port}"));
        }
    }
    if let Some(clause) = super::destination_clause(rule) {
        parts.push(clause);
    }
    parts.push(format!(
        "-j {}",
        match rule.action {
            RuleAction::Allow => "ACCEPT",
            RuleAction::Block => "DROP",
        }
    ));
    parts.join(" ")
}

enum Column {
    Source,
    Destination,
}

/// Shells out to `iptables -t <table> -v -x -n -L <chain>` for the byte counters the
/// `iptables` crate itself does not expose.
fn verbose_list(table: &str, chain: &str) -> Option<String> {
    let output = Command::new("iptables").args(["-t", table, "-v", "-x", "-n", "-L", chain]).output();
    match output {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            tracing::warn!(table, chain, status = ?out.status, "iptables -L exited non-zero");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, table, chain, "failed invoking iptables for counters");
            None
        }
    }
}

fn parse_counter_rows(output: &str, column: Column) -> HashMap<String, u64> {
    let mut map = HashMap::new();
    for line in output.lines().skip(2) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 9 {
            continue;
        }
        let bytes: u64 = match cols[1].parse() {
            Ok(b) => b,
            Err(_) => {
                tracing::warn!(line, "dropping malformed counter row");
                continue;
            }
        };
        let ip = match column {
            Column::Source => cols[7],
            Column::Destination => cols[8],
        };
        if ip == "0.0.0.0/0" {
            continue;
        }
        *map.entry(ip.to_string()).or_insert(0) += bytes;
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_counter_rows_extracts_source_ip_and_bytes() {
        let output = "Chain WIFIDOG_OUTGOING (1 references)\n    pkts      bytes target     prot opt in     out     source               destination\n      12     3456 MARK       all  --  *      *       10.0.0.5             0.0.0.0/0            MARK set 0x2\n";
        let rows = parse_counter_rows(output, Column::Source);
        assert_eq!(rows.get("10.0.0.5"), Some(&3456));
    }

    #[test]
    fn parse_counter_rows_skips_malformed_lines() {
        let output = "Chain WIFIDOG_OUTGOING (1 references)\n    pkts      bytes target     prot opt in     out     source               destination\nnot a real row\n";
        let rows = parse_counter_rows(output, Column::Source);
        assert!(rows.is_empty());
    }

    #[test]
    fn rule_spec_omits_port_for_icmp() {
        let rule = FirewallRule { action: RuleAction::Allow, protocol: Protocol::Icmp, port: Some(0), destination: None };
        assert_eq!(rule_spec(&rule), "-p icmp -j ACCEPT");
    }

    #[test]
    fn rule_spec_includes_destination_and_port_for_tcp() {
        let rule = FirewallRule {
            action: RuleAction::Block,
            protocol: Protocol::Tcp,
            port: Some(80),
            destination: Some("192.168.1.0/24".parse().unwrap()),
        };
        assert_eq!(rule_spec(&rule), "-p tcp --dport 80 -d 192.168.1.0/24 -j DROP");
    }
}
