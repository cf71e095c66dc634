//! mpgate CLI - inspect routing tables and packets, print configuration.

use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;

use mpgate::cli::*;
use mpgate::config::{init_logging, Config};
use mpgate::error::{Error, Result};
use mpgate::mptcp::{self, MptcpOption};
use mpgate::router::{table, Router};
use mpgate::types::IpFlow;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Load config if specified
    let config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    // Initialize logging
    init_logging(&cli.logging(&config.logging))?;

    // Dispatch command
    match cli.command {
        Commands::Routes(args) => run_routes(args, &config, cli.format),
        Commands::Decode(args) => run_decode(&args, cli.format),
        Commands::Config(args) => run_config(args),
    }
}

/// Load a routing table and print what made it in
fn run_routes(args: RoutesArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let path: PathBuf = args
        .file
        .or_else(|| config.routing.table_path.clone())
        .ok_or_else(|| Error::Config("No routing table given and none configured".into()))?;

    let router = Router::new();
    let report = table::load(&router, &path)?;
    let entries = router.static_entries();

    if format == OutputFormat::Json {
        let json: Vec<_> = entries
            .iter()
            .map(|(key, flow)| {
                serde_json::json!({
                    "key": key.0.to_string(),
                    "address": flow.dst,
                    "path": flow.path,
                })
            })
            .collect();
        let output = serde_json::json!({
            "inserted": report.inserted,
            "skipped": report.skipped,
            "entries": json,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).map_err(|e| Error::Internal(e.to_string()))?
        );
        return Ok(());
    }

    println!("{} {}", "Routing table:".bright_white().bold(), path.display());
    println!("{}", "─".repeat(50));
    for (key, flow) in &entries {
        println!("  {} {} {} via {}", key.0.to_string().bright_white(), "→".cyan(), flow.dst, flow.path);
    }
    println!("{}", "─".repeat(50));

    let skipped = if report.skipped > 0 {
        report.skipped.to_string().yellow()
    } else {
        report.skipped.to_string().green()
    };
    println!(
        "  {} {} inserted, {} skipped",
        "✓".green(),
        report.inserted,
        skipped
    );

    Ok(())
}

/// Decode a packet given as hex
fn run_decode(args: &DecodeArgs, format: OutputFormat) -> Result<()> {
    let cleaned: String = args.hex.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = hex::decode(cleaned).map_err(|e| Error::Config(format!("Invalid hex: {e}")))?;

    let flow = IpFlow::from_raw(&raw)?;
    let option = mptcp::decode(&raw)?;

    if format == OutputFormat::Json {
        let output = serde_json::json!({
            "src": flow.src.to_string(),
            "dst": flow.dst.to_string(),
            "key": flow.key().to_string(),
            "mptcp": option.as_ref().map(ToString::to_string),
            "token": option.as_ref().and_then(sender_token).map(|t| t.to_string()),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).map_err(|e| Error::Internal(e.to_string()))?
        );
        return Ok(());
    }

    println!("  {} {}", "Flow:".bright_white(), flow);
    println!("  {} {}", "Key:".bright_white(), flow.key());
    match option {
        Some(option) => println!("  {} {}", "MPTCP:".bright_white(), option.to_string().bright_green()),
        None => println!("  {} {}", "MPTCP:".bright_white(), "none".dimmed()),
    }

    Ok(())
}

fn sender_token(option: &MptcpOption) -> Option<mptcp::EndpointToken> {
    match option {
        MptcpOption::MpCapable { sender_key, .. } => Some(sender_key.token()),
        _ => None,
    }
}

/// Show example configuration
fn run_config(args: ConfigArgs) -> Result<()> {
    let output = Config::example().to_toml()?;

    if let Some(ref path) = args.output {
        std::fs::write(path, &output)?;
        println!(
            "{} Configuration written to {}",
            "✓".green(),
            path.display()
        );
    } else {
        println!("{}", output);
    }

    Ok(())
}
