// ===============================
// src/cli.rs
// ===============================

use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "sltp_guard",
    version,
    about = "Stop-loss / take-profit guard for Bybit USDT-perpetual positions"
)]
pub struct Cli {
    /// Config file (default: ./config.json)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the encrypted API credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
    /// Verify credentials against the wallet-balance endpoint
    Test,
    /// Show open positions and wallet equity
    Positions {
        /// Keep refreshing until Ctrl-C
        #[arg(long)]
        watch: bool,
        /// Refresh interval in seconds (default: config monitor.refresh_secs)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Guard a position until Ctrl-C
    Run(RunArgs),
    /// Inspect or change the persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum CredentialsAction {
    /// Encrypt and store an API key pair
    Set {
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        api_secret: String,
        /// The pair belongs to the testnet; talk to api-testnet.bybit.com
        #[arg(long)]
        testnet: bool,
    },
    /// Show the masked key and the selected network
    Show,
    /// Remove the stored pair
    Clear,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Symbol to guard; defaults to the single open position, then the config
    #[arg(long)]
    pub symbol: Option<String>,

    /// Maximum loss in USDT; enables the stop loss
    #[arg(long)]
    pub sl_amount: Option<Decimal>,

    /// Profit target in percent over entry; enables the take profit
    #[arg(long)]
    pub tp_percent: Option<Decimal>,

    /// Run without a stop loss
    #[arg(long, conflicts_with = "sl_amount")]
    pub no_sl: bool,

    /// Run without a take profit
    #[arg(long, conflicts_with = "tp_percent")]
    pub no_tp: bool,
}

#[derive(Debug, Subcommand)]
pub enum SettingsAction {
    /// Print the current settings
    Show,
    /// Change one or more settings
    Set {
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        sl_enabled: Option<bool>,
        #[arg(long)]
        sl_amount: Option<Decimal>,
        #[arg(long)]
        tp_enabled: Option<bool>,
        #[arg(long)]
        tp_percent: Option<Decimal>,
        #[arg(long)]
        refresh_secs: Option<u64>,
    },
    /// Write trading/monitor settings to a JSON file (no credentials)
    Export { path: PathBuf },
    /// Load trading/monitor settings from a JSON file
    Import { path: PathBuf },
}
