//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// TDF access service: authentication, authorization and key-access reasoning
#[derive(Parser, Debug)]
#[command(name = "tdf-access")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TDF_ACCESS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TDF_ACCESS_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TDF_ACCESS_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the access server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "TDF_ACCESS_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "TDF_ACCESS_HOST")]
        host: Option<String>,
    },

    /// Print the key-access plan for a data policy
    Reason {
        /// YAML file with `definitions`, `policy` and `default_kas`
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Evaluate the configured authorizer offline
    Check {
        /// Caller role as the role provider would report it (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,

        /// Caller user name
        #[arg(long)]
        username: Option<String>,

        /// RPC path or HTTP route
        #[arg(long, required = true)]
        rpc: String,

        /// Action (derived from the RPC when omitted)
        #[arg(long)]
        action: Option<String>,

        /// Resource dimension `key=value` (repeatable, one resource)
        #[arg(long = "dim", value_parser = parse_dimension)]
        dims: Vec<(String, String)>,
    },
}

/// Parse `key=value`.
pub fn parse_dimension(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_check_arguments() {
        let cli = Cli::try_parse_from([
            "tdf-access",
            "check",
            "--role",
            "admin",
            "--rpc",
            "/policy.attributes.AttributesService/GetAttribute",
            "--dim",
            "namespace=example.com",
        ])
        .unwrap();
        let Some(Command::Check { roles, dims, .. }) = cli.command else {
            panic!("expected check");
        };
        assert_eq!(roles, vec!["admin"]);
        assert_eq!(dims, vec![("namespace".to_string(), "example.com".to_string())]);
    }

    #[test]
    fn rejects_malformed_dimension() {
        assert!(parse_dimension("novalue").is_err());
        assert!(parse_dimension("=x").is_err());
        assert_eq!(parse_dimension("a=").unwrap(), ("a".to_string(), String::new()));
    }

    #[test]
    fn serve_is_default() {
        let cli = Cli::try_parse_from(["tdf-access"]).unwrap();
        assert!(cli.command.is_none());
    }
}
