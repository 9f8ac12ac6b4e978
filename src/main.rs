//! Command-line tracker.
//!
//! Usage:
//!   cargo run                          # real Bluetooth, silent paced audio sink
//!   cargo run -- --simulate            # virtual sensors, no hardware needed
//!   cargo run -- --json                # print the live view as JSON lines
//!   cargo run -- --pcm - | aplay -f S16_LE -r 44100 -c 1
//!                                      # stream the pattern to a real speaker
//!   cargo run -- --pcm pattern.raw     # record the pattern to a file, paced
//!                                      # in real time so a stop cuts it short

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{error, info};

use hrv_sonar::controller::LifecycleController;
use hrv_sonar::repository::{PeripheralRepository, PeripheralView, RepositoryConfig};
use hrv_sonar::sensor_client::{ClientConfig, SensorClient};
use hrv_sonar::simulator::{self, SimulatorConfig};
use hrv_sonar::types::PeripheralRecord;
use hrv_sonar::ultrasonic::{AudioSink, PacedSink, RawPcmSink, UltrasonicScheduler, SAMPLE_RATE};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=hrv_sonar=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Flags ─────────────────────────────────────────────────────────────────
    let args: Vec<String> = std::env::args().collect();
    let simulate = args.iter().any(|a| a == "--simulate");
    let json = args.iter().any(|a| a == "--json");
    let pcm = match args.iter().position(|a| a == "--pcm") {
        Some(i) => Some(
            args.get(i + 1)
                .cloned()
                .ok_or_else(|| anyhow!("--pcm needs a path or '-' for stdout"))?,
        ),
        None => None,
    };
    // PCM on stdout means the view has to go to stderr.
    let view_on_stderr = pcm.as_deref() == Some("-");

    // ── Audio sink ────────────────────────────────────────────────────────────
    let sink: Arc<dyn AudioSink> = match pcm.as_deref() {
        Some("-") => {
            info!("Streaming pattern as s16le @ {SAMPLE_RATE} Hz to stdout");
            Arc::new(RawPcmSink::new(io::stdout()))
        }
        Some(path) => {
            info!("Writing pattern as s16le @ {SAMPLE_RATE} Hz to {path}");
            Arc::new(RawPcmSink::paced(
                BufWriter::new(File::create(path)?),
                SAMPLE_RATE,
            ))
        }
        None => Arc::new(PacedSink::new(SAMPLE_RATE)),
    };

    // ── Core ──────────────────────────────────────────────────────────────────
    let scheduler = UltrasonicScheduler::new(sink);
    let repository = Arc::new(PeripheralRepository::new(
        scheduler,
        RepositoryConfig::default(),
    ));

    // ── Transport ─────────────────────────────────────────────────────────────
    let link = if simulate {
        info!("Running with virtual sensors (--simulate)");
        simulator::spawn(SimulatorConfig::default())
    } else {
        info!("Opening Bluetooth adapter …");
        SensorClient::new(ClientConfig::default()).open().await?
    };

    // ── Live view printer ─────────────────────────────────────────────────────
    let mut view = repository.subscribe();
    tokio::spawn(async move {
        while view.changed().await.is_ok() {
            let snapshot = view.borrow_and_update().clone();
            let text = if json {
                render_json(&snapshot)
            } else {
                render_table(&snapshot)
            };
            if view_on_stderr {
                eprintln!("{text}");
            } else {
                println!("{text}");
            }
        }
    });

    // ── Run until Ctrl-C ──────────────────────────────────────────────────────
    info!("Tracking sensors. Press Ctrl-C to quit.");
    let mut controller = LifecycleController::new(link.commands, Arc::clone(&repository));
    controller
        .run(link.events, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Ctrl-C handler failed: {e}");
            }
        })
        .await;

    // Give the transport a moment to act on the disconnect commands.
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("Shut down.");
    Ok(())
}

fn sorted(view: &PeripheralView) -> BTreeMap<&str, &PeripheralRecord> {
    view.iter().map(|(k, v)| (k.as_str(), v)).collect()
}

fn render_json(view: &PeripheralView) -> String {
    match serde_json::to_string(&sorted(view)) {
        Ok(s) => s,
        Err(e) => format!("{{\"error\":\"{e}\"}}"),
    }
}

fn render_table(view: &PeripheralView) -> String {
    if view.is_empty() {
        return "── no sensors ──".to_owned();
    }
    let mut out = format!("── {} sensor(s) ──", view.len());
    for record in sorted(view).values() {
        let id = record
            .persistent_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".into());
        let hrv = record
            .hrv
            .last_value()
            .map(|v| format!("{v:.1} ms"))
            .unwrap_or_else(|| "-".into());
        let state = format!("{:?}", record.connection_state);
        let ultrasonic = format!("{:?}", record.ultrasonic);
        out.push_str(&format!(
            "\n{:17}  {:8}  id={:6}  {:13}  {:5.2} m  {:11}  hrv n={:3} last={}",
            record.address,
            record.name.as_deref().unwrap_or("?"),
            id,
            state,
            record.advertisement.distance_m,
            ultrasonic,
            record.hrv.sample_count(),
            hrv,
        ));
    }
    out
}
