//! CLI surface: a single `serve` command that starts the gateway. Flags
//! override whatever `Config::from_env` already resolved.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "wsgateway")]
#[command(about = "Distributed WebSocket gateway message router")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv); overridden by LOG_LEVEL if set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway's HTTP+WebSocket listener
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// TCP port for the HTTP+WS listener (overrides PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// This node's name in the cluster directory (overrides NODE_NAME)
    #[arg(long)]
    pub node_name: Option<String>,

    /// KVPS backend URL, e.g. redis://localhost:6379 (overrides KVPS_URL)
    #[arg(long)]
    pub kvps_url: Option<String>,

    /// Comma-separated subset of {chat,presence,cursor,reaction} (overrides ENABLED_SERVICES)
    #[arg(long, value_delimiter = ',')]
    pub enabled_services: Option<Vec<String>>,

    /// Path to a .env file to load before reading the environment
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_overrides() {
        let cli = Cli::parse_from([
            "wsgateway",
            "serve",
            "--port",
            "9001",
            "--enabled-services",
            "chat,presence",
        ]);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.port, Some(9001));
                assert_eq!(args.enabled_services, Some(vec!["chat".to_string(), "presence".to_string()]));
            }
        }
    }

    #[test]
    fn verbose_flag_counts() {
        let cli = Cli::parse_from(["wsgateway", "-vv", "serve"]);
        assert_eq!(cli.verbose, 2);
    }
}
