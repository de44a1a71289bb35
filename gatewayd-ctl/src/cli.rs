use clap::{Parser, Subcommand};

use std::path::PathBuf;

use gatewayd_lib::command::Command as LibCommand;
use gatewayd_lib::socket;

/// gatewayd-ctl - control interface for a running gatewayd daemon
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Control socket path
    #[arg(long = "socket-path", env = socket::ENV_VAR, default_value = socket::DEFAULT_PATH)]
    pub socket_path: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the current client table and counters
    #[command()]
    Status {},

    /// Gracefully shut the daemon down
    #[command()]
    Stop {},

    /// Evict a single client by IP address
    #[command()]
    Kill {
        /// Client IP address to evict
        ip: String,
    },
}

impl From<Command> for LibCommand {
    fn from(val: Command) -> Self {
        match val {
            Command::Status {} => LibCommand::Status,
            Command::Stop {} => LibCommand::Stop,
            Command::Kill { ip } => LibCommand::Kill(ip),
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["gatewayd-ctl", "status"])?;
        assert!(matches!(args.command, Command::Status {}));
        Ok(())
    }

    #[test]
    fn parses_kill_with_ip() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["gatewayd-ctl", "kill", "10.0.0.5"])?;
        match args.command {
            Command::Kill { ip } => assert_eq!(ip, "10.0.0.5"),
            other => panic!("unexpected command: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn converts_into_lib_command() {
        assert_eq!(LibCommand::from(Command::Status {}), LibCommand::Status);
        assert_eq!(LibCommand::from(Command::Stop {}), LibCommand::Stop);
        assert_eq!(LibCommand::from(Command::Kill { ip: "10.0.0.5".to_string() }), LibCommand::Kill("10.0.0.5".to_string()));
    }
}
