use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroUsize;

use serde::Serialize;
use uuid::Uuid;

use crate::protocol::{estimate_distance, CharacteristicKind};

// ── Connection state ──────────────────────────────────────────────────────────

/// Transport-level connection state of one peripheral.
///
/// Mirrors what the transport reports; the core never invents a state.
/// Only these edges are accepted by [`ConnectionState::transition`]:
///
/// ```text
/// Discovered ──▶ Connecting ──▶ Connected ──▶ Disconnecting
///                     │                             ▲
///                     └─────────────────────────────┘
/// ```
///
/// Leaving `Disconnecting` means the record is removed, so there is no edge
/// out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
}

/// A rejected [`ConnectionState`] edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid connection transition {:?} → {:?}", self.from, self.to)
    }
}

impl ConnectionState {
    /// Move to `next` if the edge is allowed.
    pub fn transition(self, next: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionState::*;
        match (self, next) {
            (Discovered, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnecting)
            | (Connected, Disconnecting) => Ok(next),
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }

    /// `true` while a connection exists or is being set up or torn down.
    ///
    /// A discovered peripheral in one of these states must not be connected
    /// again.
    pub fn is_busy(self) -> bool {
        !matches!(self, ConnectionState::Discovered)
    }
}

// ── Ultrasonic status ─────────────────────────────────────────────────────────

/// Outcome of the acoustic detection test run by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum UltrasonicStatus {
    /// No report yet; the peripheral is still listening for the pattern.
    #[default]
    Unknown,
    Detected,
    NotDetected,
}

impl From<bool> for UltrasonicStatus {
    fn from(detected: bool) -> Self {
        if detected {
            UltrasonicStatus::Detected
        } else {
            UltrasonicStatus::NotDetected
        }
    }
}

// ── Advertisement ─────────────────────────────────────────────────────────────

/// Presence data taken from the most recent advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Advertisement {
    /// Host wall clock in milliseconds since Unix epoch.
    pub timestamp_ms: i64,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Advertised transmit power in dBm.
    pub tx_power: i16,
    /// Log-distance estimate in metres, see [`estimate_distance`].
    pub distance_m: f64,
}

impl Advertisement {
    pub fn new(timestamp_ms: i64, rssi: i16, tx_power: i16) -> Self {
        Self {
            timestamp_ms,
            rssi,
            tx_power,
            distance_m: estimate_distance(tx_power, rssi),
        }
    }
}

// ── HRV series ────────────────────────────────────────────────────────────────

/// One peak-to-peak interval sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HrvSample {
    /// Sensor clock, in whatever unit the firmware encodes.
    pub timestamp: i64,
    pub value: f32,
}

/// Buffered peak-to-peak intervals of one peripheral.
///
/// The sample count is always `samples.len()`; there is no separate counter
/// that could drift.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HrvSeries {
    samples: Vec<HrvSample>,
    last_sample_time: Option<i64>,
}

impl HrvSeries {
    /// Apply one sample.
    ///
    /// If a previous sample exists and `timestamp - last_sample_time <
    /// reset_gap`, the series restarts at this sample; otherwise it is
    /// appended.  With `cap = Some(n)` the oldest samples are dropped so at
    /// most `n` remain; the sample just recorded is always kept.
    pub fn record(
        &mut self,
        timestamp: i64,
        value: f32,
        reset_gap: i64,
        cap: Option<NonZeroUsize>,
    ) {
        let sample = HrvSample { timestamp, value };
        let too_close = self
            .last_sample_time
            .is_some_and(|last| timestamp.saturating_sub(last) < reset_gap);
        if too_close {
            self.samples.clear();
        }
        self.samples.push(sample);
        if let Some(cap) = cap {
            let excess = self.samples.len().saturating_sub(cap.get());
            self.samples.drain(..excess);
        }
        self.last_sample_time = Some(timestamp);
    }

    pub fn samples(&self) -> &[HrvSample] {
        &self.samples
    }

    /// Interval values in arrival order.
    pub fn values(&self) -> Vec<f32> {
        self.samples.iter().map(|s| s.value).collect()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn last_sample_time(&self) -> Option<i64> {
        self.last_sample_time
    }

    pub fn last_value(&self) -> Option<f32> {
        self.samples.last().map(|s| s.value)
    }
}

// ── Peripheral record ─────────────────────────────────────────────────────────

/// Everything known about one tracked peripheral.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeripheralRecord {
    /// Transient network address; the repository key.
    pub address: String,
    /// Advertised local name, when the advertisement carried one.
    pub name: Option<String>,
    /// Stable identifier read from the device-id characteristic.
    pub persistent_id: Option<i32>,
    pub connection_state: ConnectionState,
    pub advertisement: Advertisement,
    pub ultrasonic: UltrasonicStatus,
    pub hrv: HrvSeries,
}

impl PeripheralRecord {
    /// A freshly discovered peripheral.
    pub fn discovered(address: String, name: Option<String>, advertisement: Advertisement) -> Self {
        Self {
            address,
            name,
            persistent_id: None,
            connection_state: ConnectionState::Discovered,
            advertisement,
            ultrasonic: UltrasonicStatus::Unknown,
            hrv: HrvSeries::default(),
        }
    }
}

// ── Decoded values ────────────────────────────────────────────────────────────

/// A decoded characteristic payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CharacteristicValue {
    DeviceId(i32),
    UltrasonicDetected(bool),
    PeakInterval { timestamp: i64, value: f32 },
}

// ── Transport interface ───────────────────────────────────────────────────────

/// Callbacks delivered by a transport (real BLE stack or simulator).
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An advertisement carrying the identification service was received.
    PeripheralDiscovered {
        address: String,
        name: Option<String>,
        rssi: i16,
        tx_power: i16,
        timestamp_ms: i64,
    },
    /// The link is up and GATT discovery has finished.
    ///
    /// `characteristics` lists which of the recognised characteristics the
    /// peripheral actually exposes.
    PeripheralConnected {
        address: String,
        characteristics: BTreeSet<CharacteristicKind>,
    },
    PeripheralConnectionFailed { address: String },
    PeripheralDisconnected { address: String },
    /// A read result or notification for one of the recognised
    /// characteristics.
    CharacteristicUpdated {
        address: String,
        kind: CharacteristicKind,
        value: Vec<u8>,
    },
}

/// Commands issued to a transport.  All are fire-and-forget; outcomes come
/// back as [`TransportEvent`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    StartScan { service: Uuid },
    StopScan,
    Connect { address: String },
    Disconnect { address: String },
    ReadCharacteristic { address: String, kind: CharacteristicKind },
    SetNotify { address: String, kind: CharacteristicKind, enabled: bool },
}
