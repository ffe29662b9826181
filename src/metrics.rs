// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Guard loop --------
pub static GUARD_CYCLES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("guard_cycles_total", "position evaluation passes").unwrap());

pub static GUARD_CYCLE_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "guard_cycle_errors_total",
        "evaluation passes that ended in an API error",
    )
    .unwrap()
});

pub static SL_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stop_loss_updates_total", "stop losses applied per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static TP_REPLACEMENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "take_profit_replacements_total",
            "take profit orders placed or replaced per symbol",
        ),
        &["symbol"],
    )
    .unwrap()
});

pub static TP_FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("take_profit_fills_total", "take profit orders filled per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static ORDERS_CANCELLED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "orders_cancelled_total",
            "orders cancelled by the guard (labels: symbol, kind)",
        ),
        &["symbol", "kind"],
    )
    .unwrap()
});

pub static UNATTAINABLE_TARGETS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "unattainable_targets_total",
            "targets that rounded to a non-positive price (labels: symbol, target)",
        ),
        &["symbol", "target"],
    )
    .unwrap()
});

// -------- REST health --------
pub static API_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "bybit_api_requests_total",
            "REST calls by endpoint & outcome (labels: endpoint, outcome)",
        ),
        &["endpoint", "outcome"],
    )
    .unwrap()
});

pub static CLOCK_SKEW_WARNINGS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "clock_skew_warnings_total",
        "requests rejected because the local clock drifted",
    )
    .unwrap()
});

// -------- Position snapshot --------
// Whole-USDT value and basis-point PnL so integer gauges suffice.
pub static POSITION_VALUE_USDT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("position_value_usdt", "open position value, whole USDT"),
        &["symbol"],
    )
    .unwrap()
});

pub static POSITION_PNL_BP: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("position_pnl_basis_points", "unrealised PnL in basis points"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Private order stream health --------
pub static STREAM_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "order_stream_connected",
        "1 if the private order WS is authenticated, 0 otherwise",
    )
    .unwrap()
});

pub static STREAM_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "order_stream_reconnects_total",
        "Number of reconnects to the private order WS",
    )
    .unwrap()
});

pub static STREAM_LAST_EVENT_TS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "order_stream_last_event_ts",
        "Unix seconds of the last received WS event",
    )
    .unwrap()
});

// ---- Config visibility (network / strategies / symbol) ----
pub static CONFIG_NETWORK: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_network", "selected network (label: network)"),
        &["network"],
    )
    .unwrap()
});

pub static CONFIG_STRATEGY_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "config_strategy_active",
            "enabled strategies (label: strategy) — 1 enabled, 0 disabled",
        ),
        &["strategy"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "guarded symbol (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(GUARD_CYCLES.clone())),
        REGISTRY.register(Box::new(GUARD_CYCLE_ERRORS.clone())),
        REGISTRY.register(Box::new(SL_UPDATES.clone())),
        REGISTRY.register(Box::new(TP_REPLACEMENTS.clone())),
        REGISTRY.register(Box::new(TP_FILLS.clone())),
        REGISTRY.register(Box::new(ORDERS_CANCELLED.clone())),
        REGISTRY.register(Box::new(UNATTAINABLE_TARGETS.clone())),
        // REST health
        REGISTRY.register(Box::new(API_REQUESTS.clone())),
        REGISTRY.register(Box::new(CLOCK_SKEW_WARNINGS.clone())),
        // Position snapshot
        REGISTRY.register(Box::new(POSITION_VALUE_USDT.clone())),
        REGISTRY.register(Box::new(POSITION_PNL_BP.clone())),
        // Order stream health
        REGISTRY.register(Box::new(STREAM_CONNECTED.clone())),
        REGISTRY.register(Box::new(STREAM_RECONNECTS.clone())),
        REGISTRY.register(Box::new(STREAM_LAST_EVENT_TS.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_NETWORK.clone())),
        REGISTRY.register(Box::new(CONFIG_STRATEGY_ACTIVE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
