// pakbus-cli — PakBus router toolbox
//
// Hop metric and serial quoting helpers, plus a two-router loopback
// simulation that runs discovery and echo transactions.

mod config;
mod sim;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use pakbus_core::serial::{decode_quoted_data, encode_frame, encode_quoted_data, DecodeOutcome};
use pakbus_core::{EchoOutcome, HopMetric};

#[derive(Parser)]
#[command(name = "pakbus")]
#[command(about = "PakBus router toolbox", long_about = None)]
#[command(version)]
struct Cli {
    /// Log router activity at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert between response times and hop metric codes
    Metric {
        /// Response time in milliseconds
        msec: Option<u32>,
        /// Decode a hop metric code instead
        #[arg(short, long)]
        code: Option<u8>,
    },
    /// Quote bytes for a serial link
    Quote {
        /// Hex encoded bytes
        hex: String,
        /// Emit a complete signed frame
        #[arg(short, long)]
        frame: bool,
    },
    /// Undo serial quoting
    Unquote {
        /// Hex encoded bytes
        hex: String,
    },
    /// Simulate two routers and echo between them
    Echo {
        /// Echo payload size in bytes
        #[arg(short, long, default_value = "64")]
        size: usize,
        /// Number of echoes
        #[arg(short, long, default_value = "3")]
        count: u32,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Show where the config file lives
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Metric { msec, code } => cmd_metric(msec, code),
        Commands::Quote { hex, frame } => cmd_quote(&hex, frame),
        Commands::Unquote { hex } => cmd_unquote(&hex),
        Commands::Echo { size, count } => cmd_echo(size, count).await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn cmd_metric(msec: Option<u32>, code: Option<u8>) -> Result<()> {
    match (msec, code) {
        (_, Some(code)) => {
            if code > HopMetric::MAX_CODE {
                anyhow::bail!("Hop metric codes run from 0 to {}", HopMetric::MAX_CODE);
            }
            let metric = HopMetric::from_code(code);
            println!(
                "code {} = {} ms",
                code.to_string().bright_cyan(),
                metric.response_time_msec().to_string().bright_yellow()
            );
        }
        (Some(msec), None) => {
            let metric = HopMetric::from_response_time(msec);
            println!(
                "{} ms → code {} ({} ms)",
                msec,
                metric.code().to_string().bright_cyan(),
                metric.response_time_msec().to_string().bright_yellow()
            );
        }
        (None, None) => {
            println!("{}", "Hop metric codes".bold());
            for code in 0..=HopMetric::MAX_CODE {
                let metric = HopMetric::from_code(code);
                println!("  {}  {:>9} ms", code.to_string().bright_cyan(), metric.response_time_msec());
            }
        }
    }
    Ok(())
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&cleaned).context("Invalid hex input")
}

fn quote(bytes: &[u8], frame: bool) -> Vec<u8> {
    if frame {
        encode_frame(bytes)
    } else {
        let mut quoted = Vec::with_capacity(bytes.len());
        encode_quoted_data(&mut quoted, bytes);
        quoted
    }
}

fn unquote(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut unquoted = Vec::with_capacity(bytes.len());
    let mut unquote_next = false;
    let (_, outcome) = decode_quoted_data(&mut unquoted, &mut unquote_next, bytes);
    match outcome {
        DecodeOutcome::SynchNotFound if unquote_next => anyhow::bail!("Input ends inside a quote"),
        DecodeOutcome::SynchNotFound | DecodeOutcome::SynchFound => Ok(unquoted),
        DecodeOutcome::QuoteError => anyhow::bail!("Bad quote sequence"),
        DecodeOutcome::PacketTooLong => anyhow::bail!("Input longer than a packet"),
    }
}

fn cmd_quote(input: &str, frame: bool) -> Result<()> {
    let bytes = parse_hex(input)?;
    println!("{}", hex::encode(quote(&bytes, frame)));
    Ok(())
}

fn cmd_unquote(input: &str) -> Result<()> {
    let bytes = parse_hex(input)?;
    println!("{}", hex::encode(unquote(&bytes)?));
    Ok(())
}

async fn cmd_echo(size: usize, count: u32) -> Result<()> {
    let config = config::Config::load()?;
    let mut simulation = sim::Simulation::new(&config)?;

    println!(
        "{} {} ↔ {}",
        "Simulating".bold(),
        config.sim.node_a.to_string().bright_cyan(),
        config.sim.node_b.to_string().bright_cyan()
    );
    let took = simulation.discover().await?;
    println!("  {} Neighbours settled after {} ms", "✓".green(), took);

    let mut succeeded = 0;
    for i in 1..=count {
        match simulation.echo(size).await? {
            EchoOutcome::Success(report) => {
                succeeded += 1;
                println!(
                    "  {} echo {}: {} bytes, round trip {} ms",
                    "✓".green(),
                    i,
                    size,
                    report.round_trip_msec.to_string().bright_yellow()
                );
            }
            EchoOutcome::CorruptedEcho => {
                println!("  {} echo {}: corrupted", "✗".red(), i);
            }
            EchoOutcome::Failed(failure) => {
                println!("  {} echo {}: {:?}", "✗".red(), i, failure);
            }
        }
    }

    println!();
    println!("{} {}/{} echoes succeeded", "Done:".bold(), succeeded, count);
    let stats = simulation.router_a().stats();
    println!(
        "  {}",
        format!(
            "node {} sent {} and received {} messages",
            config.sim.node_a, stats.messages_sent, stats.messages_received
        )
        .dimmed()
    );
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<30} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes_synch_and_quote() {
        assert_eq!(quote(&[0x01, 0xbd, 0xbc], false), vec![0x01, 0xbc, 0xdd, 0xbc, 0xdc]);
        assert_eq!(unquote(&[0x01, 0xbc, 0xdd, 0xbc, 0xdc]).unwrap(), vec![0x01, 0xbd, 0xbc]);
    }

    #[test]
    fn test_frame_is_delimited() {
        let frame = quote(&[0x01, 0x02], true);
        assert_eq!(frame.first(), Some(&0xbd));
        assert_eq!(frame.last(), Some(&0xbd));
    }

    #[test]
    fn test_unquote_rejects_bad_sequences() {
        assert!(unquote(&[0xbc, 0x01]).is_err());
        assert!(unquote(&[0x01, 0xbc]).is_err());
    }

    #[test]
    fn test_parse_hex_ignores_spaces() {
        assert_eq!(parse_hex("bd 01\n02").unwrap(), vec![0xbd, 0x01, 0x02]);
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["pakbus", "-v", "echo", "--size", "32"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Echo { size: 32, count: 3 }));
    }
}
