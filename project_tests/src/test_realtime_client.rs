//! Connects to a running relay, prints the initial snapshot and then a
//! per-unit update rate every report interval.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::StreamExt;
use lib_realtime::{Record, UnitId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Relay WebSocket endpoint
    #[clap(long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    /// Credential passed as the `token` query parameter
    #[clap(long, env = "REALTIME_CLIENT_TOKEN")]
    token: String,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

#[derive(Default)]
struct Stats {
    global_timestamps: VecDeque<chrono::DateTime<Utc>>,
    unit_timestamps: HashMap<UnitId, VecDeque<chrono::DateTime<Utc>>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let report_interval_seconds = args.report_interval_seconds.max(1);
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval_seconds)).await;
            let one_minute_ago = Utc::now() - Duration::minutes(1);

            let mut data = stats_reporter.lock().unwrap_or_else(|e| e.into_inner());

            while data.global_timestamps.front().is_some_and(|&t| t < one_minute_ago) {
                data.global_timestamps.pop_front();
            }
            let global_rate = data.global_timestamps.len();

            let mut rates: Vec<(UnitId, usize)> = Vec::new();
            for (unit_id, dq) in data.unit_timestamps.iter_mut() {
                while dq.front().is_some_and(|&t| t < one_minute_ago) {
                    dq.pop_front();
                }
                if !dq.is_empty() {
                    rates.push((*unit_id, dq.len()));
                }
            }

            // Sort DESC by msg/min
            rates.sort_by(|a, b| b.1.cmp(&a.1));

            let report = rates
                .iter()
                .map(|(unit, rate)| format!("{}: {} msg/min", unit, rate))
                .collect::<Vec<_>>()
                .join(", ");

            println!("\n----- 1-Minute Summary -----");
            println!("Global rate: {} msg/min", global_rate);
            println!("Units: {}", if report.is_empty() { "No data" } else { &report });
            println!("----------------------------\n");
        }
    });

    let url = format!("{}?token={}", args.url, args.token);
    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .context("Failed to connect")?;
    let (_write, mut read) = ws_stream.split();
    println!("Connected. Press Ctrl+C to stop.");

    let mut snapshot_seen = false;
    while let Some(msg) = read.next().await {
        let text = match msg.context("Connection error")? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                println!("Closed by server: {:?}", frame);
                break;
            }
            _ => continue,
        };

        if !snapshot_seen {
            snapshot_seen = true;
            if let Ok(records) = serde_json::from_str::<Vec<Record>>(&text) {
                println!("Snapshot: {} units", records.len());
                for record in &records {
                    println!(
                        "  unit {} at ({}, {}) {}",
                        record.unit_id,
                        record.pos.x,
                        record.pos.y,
                        record.address.as_deref().unwrap_or("-")
                    );
                }
                continue;
            }
        }

        match serde_json::from_str::<Record>(&text) {
            Ok(record) => {
                let now = Utc::now();
                let mut data = stats.lock().unwrap_or_else(|e| e.into_inner());
                data.global_timestamps.push_back(now);
                data.unit_timestamps.entry(record.unit_id).or_default().push_back(now);
            }
            Err(e) => eprintln!("Unexpected frame ({}): {}", e, text.as_str()),
        }
    }

    Ok(())
}
