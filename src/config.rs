//! Configuration surface (§6). Deliberately thin: this module only turns a
//! command line into a validated [`Config`] value; it has no opinion about
//! how the engine uses it.

use std::path::PathBuf;

use clap::Parser;

use crate::addr::Address;
use crate::error::{ProxyError, Result};

/// How the proxy picks the source address of the outbound connection.
#[derive(Debug, Clone)]
pub enum BindMode {
    /// Bind the outbound socket to the client's own address, so the
    /// upstream server sees the real client IP. Requires `IP_TRANSPARENT`
    /// on the outbound socket too.
    SpoofClient,
    /// Bind the outbound socket to a fixed, configured address.
    Fixed(Address),
}

#[derive(Debug, Parser)]
#[command(name = "tcp-intercept", about = "Transparent TCP interception proxy")]
struct Cli {
    /// Address to listen on, e.g. "0.0.0.0:5000" or "[::]:5000".
    #[arg(long)]
    listen: String,

    /// Outbound bind address, or the literal "client" to spoof the client's
    /// source address.
    #[arg(long, default_value = "client")]
    bind: String,

    /// Log file path; defaults to standard error.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Run as a background daemon.
    #[arg(long)]
    daemonize: bool,

    /// Where to write the PID file when daemonized.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Increase log verbosity (repeatable: -v, -vv, -vvv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Fully validated runtime configuration.
pub struct Config {
    pub listen: Address,
    pub bind_mode: BindMode,
    pub log_file: Option<PathBuf>,
    pub daemonize: bool,
    pub pid_file: Option<PathBuf>,
    pub log_level: log::LevelFilter,
}

impl Config {
    /// Parse and validate `argv`.
    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Config> {
        let cli = Cli::try_parse_from(args).map_err(|e| ProxyError::Config(e.to_string()))?;

        let listen = Address::parse_bind_spec(&cli.listen)?;

        let bind_mode = if cli.bind.eq_ignore_ascii_case("client") {
            BindMode::SpoofClient
        } else {
            BindMode::Fixed(Address::parse_bind_spec(&cli.bind)?)
        };

        if cli.daemonize && cli.log_file.is_none() {
            return Err(ProxyError::Config(
                "--daemonize requires --log-file (stderr is not available once daemonized)".into(),
            ));
        }

        let log_level = match cli.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };

        Ok(Config {
            listen,
            bind_mode,
            log_file: cli.log_file,
            daemonize: cli.daemonize,
            pid_file: cli.pid_file,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        std::iter::once("tcp-intercept".to_string())
            .chain(s.iter().map(|s| s.to_string()))
            .collect()
    }

    #[test]
    fn defaults_to_spoofing_the_client() {
        let cfg = Config::parse(args(&["--listen", "0.0.0.0:5000"])).unwrap();
        assert!(matches!(cfg.bind_mode, BindMode::SpoofClient));
    }

    #[test]
    fn fixed_bind_address_is_parsed() {
        let cfg = Config::parse(args(&["--listen", "0.0.0.0:5000", "--bind", "10.0.0.1:0"])).unwrap();
        assert!(matches!(cfg.bind_mode, BindMode::Fixed(_)));
    }

    #[test]
    fn rejects_bad_listen_address() {
        assert!(Config::parse(args(&["--listen", "not_an_address"])).is_err());
    }

    #[test]
    fn daemonize_requires_log_file() {
        assert!(Config::parse(args(&["--listen", "0.0.0.0:5000", "--daemonize"])).is_err());
    }
}
