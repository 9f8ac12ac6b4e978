//! # hrv-sonar
//!
//! Track nearby BLE heart-rate-variability sensors, reconcile their rotating
//! addresses into stable identities, and play an ultrasonic presence pattern
//! until every connected sensor has reported whether it heard it.
//!
//! ## How the pieces fit
//!
//! ```text
//!  transport ──TransportEvent──▶ LifecycleController ──▶ PeripheralRepository ──▶ UltrasonicScheduler
//!      ▲                                │                        │
//!      └───────TransportCommand─────────┘                        └──▶ watch::Receiver<PeripheralView>
//! ```
//!
//! The transport is either the real Bluetooth stack ([`sensor_client`]) or
//! the built-in [`simulator`].  Both hand back the same
//! [`sensor_client::TransportLink`].
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use hrv_sonar::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let link = SensorClient::new(ClientConfig::default()).open().await?;
//!
//!     let scheduler = UltrasonicScheduler::new(Arc::new(PacedSink::new(SAMPLE_RATE)));
//!     let repository = Arc::new(PeripheralRepository::new(scheduler, RepositoryConfig::default()));
//!     let mut view = repository.subscribe();
//!     tokio::spawn(async move {
//!         while view.changed().await.is_ok() {
//!             println!("{} sensor(s) tracked", view.borrow().len());
//!         }
//!     });
//!
//!     let mut controller = LifecycleController::new(link.commands, repository);
//!     controller
//!         .run(link.events, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`protocol`] | GATT UUIDs, characteristic kinds, distance estimate |
//! | [`parse`] | Byte-level decoders for the three characteristic payloads |
//! | [`error`] | [`error::DecodeError`] |
//! | [`types`] | Records, connection states, transport events and commands |
//! | [`ultrasonic`] | Waveform, playback scheduler and audio sinks |
//! | [`repository`] | Authoritative peripheral store and live view |
//! | [`controller`] | Transport-facing lifecycle state machine |
//! | [`sensor_client`] | `btleplug` transport |
//! | [`simulator`] | Virtual transport with scripted sensors |

pub mod controller;
pub mod error;
pub mod parse;
pub mod protocol;
pub mod repository;
pub mod sensor_client;
pub mod simulator;
pub mod types;
pub mod ultrasonic;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Wiring ────────────────────────────────────────────────────────────────
    pub use crate::controller::{CommandSink, LifecycleController};
    pub use crate::repository::{PeripheralRepository, PeripheralView, RepositoryConfig};
    pub use crate::sensor_client::{ClientConfig, SensorClient, TransportLink};
    pub use crate::simulator::SimulatorConfig;

    // ── Playback ──────────────────────────────────────────────────────────────
    pub use crate::ultrasonic::{
        AudioSink, PacedSink, PatternScheduler, RawPcmSink, UltrasonicScheduler, Waveform,
        SAMPLE_RATE,
    };

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::error::DecodeError;
    pub use crate::protocol::CharacteristicKind;
    pub use crate::types::{
        Advertisement, ConnectionState, HrvSample, HrvSeries, PeripheralRecord, TransportCommand,
        TransportEvent, UltrasonicStatus,
    };
}
