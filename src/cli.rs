//! Command-line interface definitions for wiretap.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Outbound connection policy and traffic capture diagnostics.
///
/// wiretap routes a connection through its interceptor under a chosen
/// address policy and shows what was captured, or inspects a policy
/// configuration.
#[derive(Parser, Debug)]
#[command(name = "wiretap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for wiretap.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect through the interceptor and print the captured traffic.
    Probe(ProbeArgs),

    /// Inspect policy configuration.
    Policy {
        /// Policy action.
        #[command(subcommand)]
        action: PolicyCommand,
    },
}

/// Arguments of `wiretap probe`.
#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Target as host:port (IPv6 in brackets).
    #[arg(value_name = "HOST:PORT")]
    pub target: String,

    /// Text to send once connected.
    #[arg(long = "send", value_name = "TEXT")]
    pub send: Option<String>,

    /// Run a TLS handshake before sending.
    #[arg(long = "tls")]
    pub tls: bool,

    /// Server name for TLS (defaults to the target host).
    #[arg(long = "server-name", value_name = "NAME", requires = "tls")]
    pub server_name: Option<String>,

    /// PEM file with trusted certificates (defaults to the system roots).
    #[arg(long = "ca-file", value_name = "PEM", requires = "tls")]
    pub ca_file: Option<PathBuf>,

    /// Connect and read timeout in milliseconds.
    #[arg(long = "timeout-ms", value_name = "MS", default_value_t = 2000)]
    pub timeout_ms: u64,

    /// Close an address by policy (repeatable). Format: host[:port]
    #[arg(long = "deny", value_name = "ADDR")]
    pub deny: Vec<String>,

    /// Discard connections to an address (repeatable). Format: host[:port]
    #[arg(long = "discard", value_name = "ADDR")]
    pub discard: Vec<String>,

    /// Delay connections to an address (repeatable). Format: host[:port]=MS
    #[arg(long = "delay", value_name = "ADDR=MS")]
    pub delay: Vec<String>,

    /// Split captured packets by I/O thread.
    #[arg(long = "group-by-thread")]
    pub group_by_thread: bool,

    /// Split captured packets by the call stack that opened the connection.
    #[arg(long = "group-by-stack")]
    pub group_by_stack: bool,
}

impl ProbeArgs {
    /// Parse a delay rule string into (address, milliseconds).
    ///
    /// Returns None if the format is invalid.
    pub fn parse_delay_rule(rule: &str) -> Option<(String, u64)> {
        let (address, ms) = rule.rsplit_once('=')?;
        if address.is_empty() {
            return None;
        }
        let ms: u64 = ms.trim().parse().ok()?;
        Some((address.trim().to_string(), ms))
    }
}

/// Policy subcommands.
#[derive(Subcommand, Debug)]
pub enum PolicyCommand {
    /// Validate configuration and print the effective policy table.
    Check {
        /// Config file (in place of --config).
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Print the decision a connection to an address would get.
    Resolve {
        /// Address as host:port.
        #[arg(value_name = "HOST:PORT")]
        target: String,

        /// Config file (in place of --config).
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delay_rule_valid() {
        assert_eq!(
            ProbeArgs::parse_delay_rule("db.local:5432=250"),
            Some(("db.local:5432".to_string(), 250))
        );
        assert_eq!(
            ProbeArgs::parse_delay_rule("*=10"),
            Some(("*".to_string(), 10))
        );
    }

    #[test]
    fn test_parse_delay_rule_invalid() {
        assert_eq!(ProbeArgs::parse_delay_rule("db.local"), None);
        assert_eq!(ProbeArgs::parse_delay_rule("db.local="), None);
        assert_eq!(ProbeArgs::parse_delay_rule("=10"), None);
        assert_eq!(ProbeArgs::parse_delay_rule("db.local=soon"), None);
    }

    #[test]
    fn test_cli_parse_probe() {
        let cli = Cli::parse_from([
            "wiretap",
            "-vv",
            "probe",
            "127.0.0.1:8080",
            "--send",
            "ping",
            "--deny",
            "evil.io",
            "--discard",
            "cache.local:6379",
            "--delay",
            "*=10",
            "--group-by-thread",
        ]);

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Probe(args) => {
                assert_eq!(args.target, "127.0.0.1:8080");
                assert_eq!(args.send.as_deref(), Some("ping"));
                assert_eq!(args.deny, vec!["evil.io"]);
                assert_eq!(args.discard, vec!["cache.local:6379"]);
                assert_eq!(args.delay, vec!["*=10"]);
                assert!(args.group_by_thread);
                assert!(!args.group_by_stack);
                assert!(!args.tls);
                assert_eq!(args.timeout_ms, 2000);
            }
            other => panic!("Expected Probe command, got {:?}", other),
        }
    }

    #[test]
    fn test_server_name_requires_tls() {
        let result = Cli::try_parse_from([
            "wiretap",
            "probe",
            "example.com:443",
            "--server-name",
            "example.com",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_policy_resolve() {
        let cli = Cli::parse_from([
            "wiretap",
            "policy",
            "resolve",
            "db.local:5432",
            "/tmp/wiretap.toml",
        ]);

        match cli.command {
            Commands::Policy {
                action: PolicyCommand::Resolve { target, file },
            } => {
                assert_eq!(target, "db.local:5432");
                assert_eq!(file, Some(PathBuf::from("/tmp/wiretap.toml")));
            }
            other => panic!("Expected policy resolve, got {:?}", other),
        }
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli = Cli::parse_from(["wiretap", "policy", "check", "-c", "/tmp/extra.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/extra.toml")));
    }
}
