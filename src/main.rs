//! Command-line front end for the Aptash prediction oracle.
//!
//! Each subcommand runs one request through the oracle and prints the JSON
//! response envelope.

use anyhow::{Context, Result};
use aptash_oracle::types::{FeeRequest, FraudRequest, Priority, SignedTransfer};
use aptash_oracle::OracleBuilder;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Client identifier used for rate limiting
    #[arg(long, default_value = "127.0.0.1")]
    client: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Predict the fee for a transfer
    Fee {
        /// Amount in token units
        #[arg(short, long)]
        amount: f64,

        /// Token symbol (APT, USDC, USDT, BTC, ETH, ...)
        #[arg(short, long, default_value = "APT")]
        token: String,

        /// low, normal or high
        #[arg(short, long, default_value = "normal")]
        priority: Priority,
    },

    /// Score a transfer for fraud risk
    Fraud {
        #[arg(short, long)]
        sender: String,

        #[arg(short, long)]
        recipient: String,

        /// Amount in APT
        #[arg(short, long)]
        amount: f64,

        /// Unix timestamp (seconds) attached to the transfer
        #[arg(short, long)]
        timestamp: Option<i64>,
    },

    /// Submit a pre-signed transfer read from a JSON file
    Submit {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show breaker state and counters
    Health,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aptash_oracle=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let oracle = OracleBuilder::from_env().build()?;
    info!("Oracle ready");

    match cli.command {
        Commands::Fee { amount, token, priority } => {
            let response = oracle
                .predict_fee(&cli.client, FeeRequest { amount, token, priority })
                .await;
            print_json(&response)?;
        }
        Commands::Fraud { sender, recipient, amount, timestamp } => {
            let response = oracle
                .predict_fraud(&cli.client, FraudRequest { sender, recipient, amount, timestamp })
                .await;
            print_json(&response)?;
        }
        Commands::Submit { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let transfer: SignedTransfer = serde_json::from_str(&raw).context("invalid signed transfer JSON")?;
            let response = oracle.submit_transfer(&cli.client, transfer).await;
            print_json(&response)?;
        }
        Commands::Health => {
            print_json(&oracle.health().await)?;
        }
    }

    Ok(())
}
