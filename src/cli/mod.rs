//! Command line interface for mpgate.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::LoggingConfig;

/// mpgate - MPTCP-aware multipath gateway
#[derive(Parser, Debug)]
#[command(
    name = "mpgate",
    author,
    version,
    about = "MPTCP-aware gateway core: routing tables, packet inspection and configuration",
    long_about = r#"
mpgate re-routes captured TCP flows over a multipath backbone while keeping
MPTCP subflows attached to their parent connection.

QUICK START:
  Check a routing table:   mpgate routes routes.json
  Inspect a packet:        mpgate decode 4500003c...
  Print a config file:     mpgate config --output config.toml
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a static routing table and list its entries
    Routes(RoutesArgs),

    /// Decode the flow and MPTCP option of a raw IP packet
    Decode(DecodeArgs),

    /// Show example configuration
    Config(ConfigArgs),
}

/// Routes command arguments
#[derive(Args, Debug)]
pub struct RoutesArgs {
    /// Routing table (JSON). Defaults to the configured table.
    pub file: Option<PathBuf>,
}

/// Decode command arguments
#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Packet bytes as hex, starting at the IP header
    pub hex: String,
}

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl Cli {
    /// Logging settings from the config file with the flags given on the
    /// command line applied on top.
    pub fn logging(&self, base: &LoggingConfig) -> LoggingConfig {
        let mut logging = base.clone();
        if let Some(level) = &self.log_level {
            logging.level = level.clone();
        }
        if self.no_color {
            logging.color = false;
        }
        logging
    }
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
