//! Control-socket wire types: what `gatewayd-ctl` sends and what `gatewayd` replies.

use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::client_table::Client;
use crate::log_output;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Command {
    Status,
    Stop,
    Kill(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClientSummary {
    pub ip: String,
    pub mac: String,
    pub mark: String,
    pub incoming: u64,
    pub outgoing: u64,
    pub to_gateway: u64,
}

impl From<&Client> for ClientSummary {
    fn from(client: &Client) -> Self {
        ClientSummary {
            ip: client.ip.clone(),
            mac: client.mac.clone(),
            mark: client.mark.to_string(),
            incoming: client.counters.incoming,
            outgoing: client.counters.outgoing,
            to_gateway: client.counters.to_gateway,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub clients: Vec<ClientSummary>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Response {
    Status(StatusResponse),
    Stopping,
    Killed(String),
    NotFound(String),
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", log_output::serialize(self))
    }
}

impl FromStr for Command {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrips_through_json() -> anyhow::Result<()> {
        let cmd = Command::Kill("10.0.0.5".to_string());
        let encoded = serde_json::to_string(&cmd)?;
        let parsed: Command = encoded.parse()?;
        assert_eq!(parsed, cmd);
        Ok(())
    }
}
