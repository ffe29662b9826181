// ===============================
// src/main.rs
// ===============================
/*
 # metrics while a guard is running
curl -s localhost:9898/metrics | egrep '^config_(network|symbol|strategy_active)'
curl -s localhost:9898/metrics | grep '^stop_loss_updates_total'
curl -s localhost:9898/metrics | grep '^take_profit_'

*/
/*
=============================================================================
Project : sltp_guard — stop-loss / take-profit guard for Bybit perpetuals
Module  : main.rs
Version : 0.6.0

Summary : Guards an open USDT-perpetual position: keeps a fixed-loss stop
          on the position and a reduce-only limit take profit on the book,
          re-planned once a second and on live setting changes; watches the
          private order stream for fills, exposes Prometheus metrics, and
          records JSONL events.
=============================================================================
*/
mod bybit;
mod cli;
mod config;
mod domain;
mod engine;
mod metrics;
mod monitor;
mod recorder;
mod secrets;
mod stream;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::bybit::{ApiError, BybitClient};
use crate::cli::{Cli, Command, CredentialsAction, RunArgs, SettingsAction};
use crate::config::{ConfigError, ConfigStore, DEFAULT_CONFIG_FILE};
use crate::domain::{normalize_symbol, GuardEvent, OrderUpdate};
use crate::engine::PrepareError;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Prepare(#[from] PrepareError),
    #[error("{0}")]
    Usage(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    match dispatch(cli, &config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            let api = match &e {
                CliError::Api(a) => Some(a),
                CliError::Prepare(PrepareError::Api(a)) => Some(a),
                _ => None,
            };
            if api.is_some_and(|a| a.is_clock_skew()) {
                eprintln!("hint: the local clock is off Bybit's; sync it via NTP and retry");
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli, config_path: &std::path::Path) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path)?;
    match cli.command {
        Command::Credentials { action } => cmd_credentials(&mut store, action),
        Command::Test => cmd_test(&store).await,
        Command::Positions { watch, interval } => cmd_positions(&store, watch, interval).await,
        Command::Run(args) => cmd_run(&mut store, args).await,
        Command::Settings { action } => cmd_settings(&mut store, action),
    }
}

fn build_client(store: &ConfigStore) -> Result<BybitClient, CliError> {
    let api_key = store.api_key()?;
    let api_secret = store.api_secret()?;
    Ok(BybitClient::new(store.rest_url(), api_key, api_secret, store.recv_window_ms())?)
}

// ---- credentials ----

fn cmd_credentials(store: &mut ConfigStore, action: CredentialsAction) -> Result<(), CliError> {
    match action {
        CredentialsAction::Set { api_key, api_secret, testnet } => {
            store.set_credentials(&api_key, &api_secret, testnet)?;
            println!(
                "credentials stored for {} (key {})",
                store.network(),
                config::mask_key(&api_key)
            );
            println!("run `sltp_guard test` to verify them");
            Ok(())
        }
        CredentialsAction::Show => {
            if store.has_credentials() || store.api_key().is_ok() {
                let key = store.api_key()?;
                println!("network : {}", store.network());
                println!("api key : {}", config::mask_key(&key));
            } else {
                println!("no credentials stored (set them with `credentials set`)");
            }
            Ok(())
        }
        CredentialsAction::Clear => {
            store.clear_credentials()?;
            println!("credentials removed");
            Ok(())
        }
    }
}

// ---- test ----

async fn cmd_test(store: &ConfigStore) -> Result<(), CliError> {
    let client = build_client(store)?;
    let wallet = client.wallet_balance().await?;
    println!(
        "connected to {} as {} ({} account, equity {} USD)",
        store.network(),
        config::mask_key(&store.api_key()?),
        wallet.account_type,
        wallet.total_equity.normalize()
    );
    Ok(())
}

// ---- positions ----

async fn cmd_positions(store: &ConfigStore, watch: bool, interval: Option<u64>) -> Result<(), CliError> {
    let client = Arc::new(build_client(store)?);
    if watch {
        let secs = interval.unwrap_or(store.cfg.monitor.refresh_secs);
        monitor::watch(client, secs).await?;
    } else {
        let view = monitor::account_overview(&client).await?;
        print!("{}", monitor::render_summary(&view));
    }
    Ok(())
}

// ---- settings ----

fn cmd_settings(store: &mut ConfigStore, action: SettingsAction) -> Result<(), CliError> {
    match action {
        SettingsAction::Show => {
            let view = serde_json::json!({
                "network": store.network().to_string(),
                "trading": store.cfg.trading,
                "monitor": store.cfg.monitor,
                "runtime": store.cfg.runtime,
            });
            println!("{}", serde_json::to_string_pretty(&view).unwrap_or_default());
            Ok(())
        }
        SettingsAction::Set { symbol, sl_enabled, sl_amount, tp_enabled, tp_percent, refresh_secs } => {
            if let Some(sym) = symbol {
                store.cfg.trading.default_symbol = normalize_symbol(&sym);
            }
            if let Some(v) = sl_enabled {
                store.cfg.trading.sl_enabled = v;
            }
            if let Some(v) = sl_amount {
                store.cfg.trading.sl_amount = v;
            }
            if let Some(v) = tp_enabled {
                store.cfg.trading.tp_enabled = v;
            }
            if let Some(v) = tp_percent {
                store.cfg.trading.tp_percent = v;
            }
            if let Some(v) = refresh_secs {
                store.cfg.monitor.refresh_secs = v.max(1);
            }
            validate_trading(store)?;
            store.save()?;
            println!(
                "settings saved: symbol={} sl={}({} USDT) tp={}({}%)",
                store.cfg.trading.default_symbol,
                onoff(store.cfg.trading.sl_enabled),
                store.cfg.trading.sl_amount.normalize(),
                onoff(store.cfg.trading.tp_enabled),
                store.cfg.trading.tp_percent.normalize(),
            );
            Ok(())
        }
        SettingsAction::Export { path } => {
            store.export_settings(&path)?;
            println!("settings written to {} (credentials stay local)", path.display());
            Ok(())
        }
        SettingsAction::Import { path } => {
            store.import_settings(&path)?;
            println!("settings imported from {}", path.display());
            Ok(())
        }
    }
}

fn onoff(v: bool) -> &'static str {
    if v { "on" } else { "off" }
}

fn validate_trading(store: &ConfigStore) -> Result<(), CliError> {
    let t = &store.cfg.trading;
    if t.sl_enabled && t.sl_amount <= rust_decimal::Decimal::ZERO {
        return Err(CliError::Usage("sl_amount must be positive".to_string()));
    }
    if t.tp_enabled && t.tp_percent <= rust_decimal::Decimal::ZERO {
        return Err(CliError::Usage("tp_percent must be positive".to_string()));
    }
    Ok(())
}

// ---- run ----

async fn cmd_run(store: &mut ConfigStore, args: RunArgs) -> Result<(), CliError> {
    // Fold the run flags into the persisted settings so the file watcher
    // and a restart agree on what is active.
    if let Some(sym) = &args.symbol {
        store.cfg.trading.default_symbol = normalize_symbol(sym);
    }
    if let Some(v) = args.sl_amount {
        store.cfg.trading.sl_amount = v;
        store.cfg.trading.sl_enabled = true;
    }
    if args.no_sl {
        store.cfg.trading.sl_enabled = false;
    }
    if let Some(v) = args.tp_percent {
        store.cfg.trading.tp_percent = v;
        store.cfg.trading.tp_enabled = true;
    }
    if args.no_tp {
        store.cfg.trading.tp_enabled = false;
    }
    if !store.cfg.trading.sl_enabled && !store.cfg.trading.tp_enabled {
        return Err(CliError::Usage(
            "nothing to guard: enable a stop loss (--sl-amount) and/or a take profit (--tp-percent)"
                .to_string(),
        ));
    }
    validate_trading(store)?;
    store.save()?;

    let api_key = store.api_key()?;
    let api_secret = store.api_secret()?;
    let client = Arc::new(BybitClient::new(
        store.rest_url(),
        api_key.clone(),
        api_secret.clone(),
        store.recv_window_ms(),
    )?);

    // ---- Connection check ----
    let wallet = client.wallet_balance().await?;
    info!(
        network = %store.network(),
        account = %wallet.account_type,
        equity = %wallet.total_equity.normalize(),
        "connected"
    );

    // ---- Symbol: flag > single open position > config default ----
    let symbol = if let Some(sym) = &args.symbol {
        normalize_symbol(sym)
    } else {
        let view = monitor::account_overview(&client).await?;
        match monitor::auto_select_symbol(&view.summary) {
            Some(sym) => {
                info!(%sym, "guarding the open position");
                sym
            }
            None if view.summary.total_positions == 0 => {
                let sym = normalize_symbol(&store.cfg.trading.default_symbol);
                info!(%sym, "no open positions, using the configured symbol");
                sym
            }
            None => {
                let mut syms: Vec<String> =
                    view.summary.positions.iter().map(|p| p.symbol.clone()).collect();
                syms.sort();
                syms.dedup();
                return Err(CliError::Usage(format!(
                    "several positions open ({}): pick one with --symbol",
                    syms.join(", ")
                )));
            }
        }
    };

    let prepared = engine::prepare(&client, &symbol).await?;
    info!(
        symbol = %prepared.symbol,
        side = prepared.position.side.map(|s| s.as_str()).unwrap_or("?"),
        size = %prepared.position.size,
        entry = %prepared.position.entry_price,
        tick_size = %prepared.rule.tick_size,
        "position found"
    );

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(store.metrics_port()));
    metrics::CONFIG_NETWORK
        .with_label_values(&[&store.network().to_string()])
        .set(1);
    metrics::CONFIG_SYMBOL.with_label_values(&[&prepared.symbol]).set(1);

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<GuardEvent>(8192);
    if let Some(path) = store.record_file() {
        tokio::spawn(recorder::run(rec_rx, path));
    }

    // ---- Live settings ----
    let (set_tx, set_rx) = watch::channel(store.cfg.trading.guard());
    tokio::spawn(config::watch_trading(store.path().to_path_buf(), set_tx));

    // ---- Private order stream ----
    let (ord_tx, ord_rx) = mpsc::channel::<OrderUpdate>(1024);
    tokio::spawn(stream::run(store.ws_url(), api_key, api_secret, ord_tx));

    // ---- Guard loop ----
    tokio::spawn(engine::run(
        client,
        prepared.symbol,
        prepared.rule,
        store.cfg.runtime.poll_secs,
        set_rx,
        ord_rx,
        rec_tx,
    ));

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    Ok(())
}
