use clap::Parser;

use std::path::PathBuf;

use gatewayd_lib::{config, socket};

/// gatewayd - wifidog-compatible captive portal gateway daemon
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = config::ENV_VAR, default_value = config::DEFAULT_PATH)]
    pub config_path: PathBuf,

    /// Control socket path
    #[arg(long = "socket-path", env = socket::ENV_VAR, default_value = socket::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// Run in the foreground instead of daemonizing
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Debug verbosity level (0 = quiet)
    #[arg(short = 'd', long = "debug", default_value_t = 0)]
    pub debug_level: u8,

    /// Log to syslog instead of stderr
    #[arg(short = 's', long = "syslog")]
    pub syslog: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["gatewayd"])?;
        assert!(!args.foreground);
        assert_eq!(args.debug_level, 0);
        Ok(())
    }

    #[test]
    fn parses_explicit_flags() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["gatewayd", "-c", "/tmp/gatewayd.conf", "-f", "-d", "3", "-s"])?;
        assert_eq!(args.config_path, PathBuf::from("/tmp/gatewayd.conf"));
        assert!(args.foreground);
        assert_eq!(args.debug_level, 3);
        assert!(args.syslog);
        Ok(())
    }
}
