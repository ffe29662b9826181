// ===============================
// src/recorder.rs
// ===============================
//
// Lightweight JSONL audit trail:
// - Appends every GuardEvent to a .jsonl file.
// - Buffered with BufWriter to keep syscalls down.
// - Flushes every 1s and/or every 1000 events.
// - Creates the parent directory if missing.
// - On a failed write, reopens the file once and carries on.
//
// Enable via `record_file` in the config or RECORD_FILE in the env
// (see main.rs).
//
use serde::Serialize;
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::bybit::timestamp_ms;
use crate::domain::GuardEvent;

#[derive(Serialize)]
struct Line<'a> {
    ts_ms: i64,
    event: &'a GuardEvent,
}

async fn open_writer(path: &str) -> BufWriter<tokio::fs::File> {
    // Make sure the parent directory exists (if any)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .unwrap_or_else(|e| panic!("recorder: open {} failed: {}", path, e));

    BufWriter::new(file)
}

pub async fn run(mut rx: mpsc::Receiver<GuardEvent>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = open_writer(&path).await;

    // Periodic flush (every 1s) plus an event-count flush
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                match maybe_ev {
                    Some(ev) => {
                        let line = match serde_json::to_string(&Line { ts_ms: timestamp_ms(), event: &ev }) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, "recorder: serialize error, skip event");
                                continue;
                            }
                        };

                        // Write + newline
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(?e, "recorder: write_all failed, attempting reopen");
                            writer = open_writer(&path).await;
                            // one retry after the reopen
                            if let Err(e2) = writer.write_all(line.as_bytes()).await {
                                error!(?e2, "recorder: write_all failed again after reopen, drop event");
                                continue;
                            }
                        }
                        if let Err(e) = writer.write_all(b"\n").await {
                            error!(?e, "recorder: write newline failed, attempting reopen");
                            writer = open_writer(&path).await;
                            let _ = writer.write_all(b"\n").await;
                        }

                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                            let _ = writer.flush().await;
                            since_last_flush = 0;
                        }
                    }
                    None => {
                        // Channel closed: flush and leave
                        let _ = writer.flush().await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn line_serializes_with_tagged_event() {
        let ev = GuardEvent::StopLossSet {
            symbol: "BTCUSDT".to_string(),
            price: dec!(43100.5),
            position_idx: 0,
        };
        let line = serde_json::to_string(&Line { ts_ms: 1700000000000, event: &ev }).unwrap();
        assert!(line.starts_with(r#"{"ts_ms":1700000000000,"event":{"StopLossSet""#));
        assert!(line.contains(r#""symbol":"BTCUSDT""#));
    }

    #[tokio::test]
    async fn records_events_to_jsonl() {
        let dir = std::env::temp_dir().join(format!("sltp_rec_{}", std::process::id()));
        let path = dir.join("events.jsonl");
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, path.to_string_lossy().into_owned()));

        tx.send(GuardEvent::PositionFlat { symbol: "ETHUSDT".to_string() })
            .await
            .unwrap();
        tx.send(GuardEvent::OrdersCancelled { symbol: "ETHUSDT".to_string(), count: 2 })
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("PositionFlat"));
        assert!(lines[1].contains(r#""count":2"#));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
