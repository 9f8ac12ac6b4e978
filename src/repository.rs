//! The authoritative store of tracked peripherals.
//!
//! Every mutation goes through one lock over the whole record map because
//! several rules touch more than one record: identity reconciliation removes
//! *other* records, and the ultrasonic stop condition inspects *all* of them.
//! Observers never take that lock; after each effective mutation an immutable
//! snapshot is published on a [`tokio::sync::watch`] channel.
//!
//! Scheduler commands are issued while the lock is held, so the player sees
//! `start_or_extend` / `stop` in the same order as the events that caused them.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::DecodeError;
use crate::parse::decode_characteristic;
use crate::protocol::CharacteristicKind;
use crate::types::{
    Advertisement, CharacteristicValue, ConnectionState, PeripheralRecord, UltrasonicStatus,
};
use crate::ultrasonic::PatternScheduler;

/// Read-only snapshot of every tracked peripheral, keyed by address.
pub type PeripheralView = Arc<HashMap<String, PeripheralRecord>>;

/// Tuning knobs for the record rules.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Two consecutive peak-interval samples closer than this (in the sensor's
    /// timestamp unit) restart the HRV series.  Default: `1000`.
    pub hrv_reset_gap: i64,
    /// Keep at most this many HRV samples per peripheral, dropping the oldest.
    /// `None` keeps everything; a cap of zero is unrepresentable.
    /// Default: `None`.
    pub max_hrv_samples: Option<NonZeroUsize>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            hrv_reset_gap: 1000,
            max_hrv_samples: None,
        }
    }
}

pub struct PeripheralRepository<S> {
    records: Mutex<HashMap<String, PeripheralRecord>>,
    view: watch::Sender<PeripheralView>,
    scheduler: S,
    config: RepositoryConfig,
}

impl<S: PatternScheduler> PeripheralRepository<S> {
    pub fn new(scheduler: S, config: RepositoryConfig) -> Self {
        let (view, _) = watch::channel(PeripheralView::default());
        Self {
            records: Mutex::new(HashMap::new()),
            view,
            scheduler,
            config,
        }
    }

    /// Change feed of the live view.  The receiver starts at the current
    /// snapshot.
    pub fn subscribe(&self) -> watch::Receiver<PeripheralView> {
        self.view.subscribe()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> PeripheralView {
        self.view.borrow().clone()
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    fn publish(&self, records: &HashMap<String, PeripheralRecord>) {
        self.view.send_replace(Arc::new(records.clone()));
    }

    /// Stop the pattern if no tracked peripheral is still waiting for it.
    fn stop_if_all_reported(&self, records: &HashMap<String, PeripheralRecord>) {
        let waiting = records
            .values()
            .filter(|r| r.ultrasonic == UltrasonicStatus::Unknown)
            .count();
        if waiting == 0 {
            debug!("repository: no peripheral awaiting the pattern, stopping playback");
            self.scheduler.stop();
        } else {
            debug!("repository: {waiting} peripheral(s) still awaiting the pattern");
        }
    }

    // ── Advertisement ───────────────────────────────────────────────────────

    /// Record an advertisement from `address`, creating the record if needed.
    pub fn on_advertisement(
        &self,
        address: &str,
        name: Option<String>,
        advertisement: Advertisement,
    ) {
        let mut records = self.records.lock();
        match records.get_mut(address) {
            Some(record) => {
                record.advertisement = advertisement;
                if name.is_some() {
                    record.name = name;
                }
            }
            None => {
                info!(
                    "repository: new peripheral {address} (rssi {} dBm, ~{:.2} m)",
                    advertisement.rssi, advertisement.distance_m
                );
                records.insert(
                    address.to_owned(),
                    PeripheralRecord::discovered(address.to_owned(), name, advertisement),
                );
            }
        }
        self.publish(&records);
    }

    // ── Connection lifecycle ────────────────────────────────────────────────

    /// Mirror a transport-reported state change onto the record, if tracked.
    ///
    /// Returns `false` when the record is missing or the edge is rejected.
    fn mirror_state(
        &self,
        records: &mut HashMap<String, PeripheralRecord>,
        address: &str,
        next: ConnectionState,
    ) -> bool {
        let Some(record) = records.get_mut(address) else {
            return false;
        };
        match record.connection_state.transition(next) {
            Ok(state) => {
                record.connection_state = state;
                true
            }
            Err(e) => {
                warn!("repository: {address}: {e}");
                false
            }
        }
    }

    /// A connect command was issued for `address`.
    pub fn on_connecting(&self, address: &str) {
        let mut records = self.records.lock();
        if self.mirror_state(&mut records, address, ConnectionState::Connecting) {
            self.publish(&records);
        }
    }

    /// The transport reports `address` connected.  Starts or extends the
    /// ultrasonic pattern so the new peripheral can hear it.
    pub fn on_connected(&self, address: &str) {
        let mut records = self.records.lock();
        if self.mirror_state(&mut records, address, ConnectionState::Connected) {
            self.publish(&records);
        }
        self.scheduler.start_or_extend();
    }

    /// A disconnect command was issued for `address`.
    pub fn on_disconnecting(&self, address: &str) {
        let mut records = self.records.lock();
        if self.mirror_state(&mut records, address, ConnectionState::Disconnecting) {
            self.publish(&records);
        }
    }

    /// The peripheral disconnected or the connection attempt failed.
    pub fn on_disconnected(&self, address: &str) {
        let mut records = self.records.lock();
        if records.remove(address).is_some() {
            info!("repository: {address} removed");
            self.publish(&records);
        }
        self.stop_if_all_reported(&records);
    }

    // ── Characteristic values ───────────────────────────────────────────────

    /// Decode `payload` and apply it to `address`.
    ///
    /// A malformed payload leaves every record untouched.
    pub fn apply_characteristic(
        &self,
        address: &str,
        kind: CharacteristicKind,
        payload: &[u8],
    ) -> Result<(), DecodeError> {
        match decode_characteristic(kind, payload)? {
            CharacteristicValue::DeviceId(id) => self.on_device_id(address, id),
            CharacteristicValue::UltrasonicDetected(detected) => {
                self.on_ultrasonic(address, detected)
            }
            CharacteristicValue::PeakInterval { timestamp, value } => {
                self.on_peak_interval(address, timestamp, value)
            }
        }
        Ok(())
    }

    /// Assign a persistent id, dropping stale records that carried the same id
    /// under a previous address.
    pub fn on_device_id(&self, address: &str, id: i32) {
        let mut records = self.records.lock();
        if !records.contains_key(address) {
            debug!("repository: device id {id} for untracked {address} ignored");
            return;
        }

        let stale: Vec<String> = records
            .iter()
            .filter(|(key, r)| key.as_str() != address && r.persistent_id == Some(id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            info!("repository: device {id} moved from {key} to {address}");
            records.remove(&key);
        }

        if let Some(record) = records.get_mut(address) {
            record.persistent_id = Some(id);
        }
        self.publish(&records);
    }

    /// Record the peripheral's ultrasonic test outcome.
    pub fn on_ultrasonic(&self, address: &str, detected: bool) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(address) {
            record.ultrasonic = UltrasonicStatus::from(detected);
            info!("repository: {address} reports {:?}", record.ultrasonic);
            self.publish(&records);
        }
        self.stop_if_all_reported(&records);
    }

    /// Buffer one peak-to-peak interval sample.
    pub fn on_peak_interval(&self, address: &str, timestamp: i64, value: f32) {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(address) else {
            return;
        };
        record.hrv.record(
            timestamp,
            value,
            self.config.hrv_reset_gap,
            self.config.max_hrv_samples,
        );
        self.publish(&records);
    }

    /// Stop the pattern on teardown.
    pub fn shutdown(&self) {
        let _records = self.records.lock();
        self.scheduler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingScheduler {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl CountingScheduler {
        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    impl PatternScheduler for CountingScheduler {
        fn start_or_extend(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn repo() -> PeripheralRepository<CountingScheduler> {
        PeripheralRepository::new(CountingScheduler::default(), RepositoryConfig::default())
    }

    fn advertise(repo: &PeripheralRepository<CountingScheduler>, address: &str) {
        repo.on_advertisement(address, None, Advertisement::new(0, -60, -59));
    }

    fn hrv_values(repo: &PeripheralRepository<CountingScheduler>, address: &str) -> Vec<f32> {
        repo.snapshot()[address].hrv.values()
    }

    #[test]
    fn advertisement_creates_then_updates() {
        let repo = repo();
        repo.on_advertisement("A", Some("sensor-1".into()), Advertisement::new(10, -70, -59));
        let first = repo.snapshot()["A"].clone();
        assert_eq!(first.connection_state, ConnectionState::Discovered);
        assert_eq!(first.ultrasonic, UltrasonicStatus::Unknown);
        assert_eq!(first.name.as_deref(), Some("sensor-1"));

        repo.on_advertisement("A", None, Advertisement::new(20, -50, -40));
        let view = repo.snapshot();
        assert_eq!(view.len(), 1);
        let record = &view["A"];
        assert_eq!(record.advertisement.timestamp_ms, 20);
        assert_eq!(record.advertisement.rssi, -50);
        assert_eq!(record.advertisement.tx_power, -40);
        // 10^((40 + 50) / 40)
        assert!((record.advertisement.distance_m - 10f64.powf(2.25)).abs() < 1e-9);
        // A nameless advertisement keeps the known name.
        assert_eq!(record.name.as_deref(), Some("sensor-1"));
    }

    #[test]
    fn keys_match_record_addresses() {
        let repo = repo();
        for a in ["A", "B", "C", "A"] {
            advertise(&repo, a);
        }
        let view = repo.snapshot();
        assert_eq!(view.len(), 3);
        assert!(view.iter().all(|(k, r)| *k == r.address));
    }

    #[test]
    fn device_id_migrates_identity_to_new_address() {
        let repo = repo();
        advertise(&repo, "B");
        repo.on_device_id("B", 77);
        advertise(&repo, "A");
        repo.on_device_id("A", 77);

        let view = repo.snapshot();
        assert!(!view.contains_key("B"));
        assert_eq!(view["A"].persistent_id, Some(77));
    }

    #[test]
    fn device_id_for_untracked_address_changes_nothing() {
        let repo = repo();
        advertise(&repo, "B");
        repo.on_device_id("B", 5);
        repo.on_device_id("ghost", 5);

        let view = repo.snapshot();
        assert_eq!(view.len(), 1);
        assert_eq!(view["B"].persistent_id, Some(5));
    }

    #[test]
    fn repeated_device_id_on_same_address_keeps_record() {
        let repo = repo();
        advertise(&repo, "A");
        repo.on_device_id("A", 3);
        repo.on_device_id("A", 3);
        assert_eq!(repo.snapshot()["A"].persistent_id, Some(3));
    }

    #[test]
    fn hrv_close_sample_resets_then_far_sample_appends() {
        // 500 - 0 < 1000 resets; 2000 - 500 ≥ 1000 appends.
        let repo = repo();
        advertise(&repo, "A");
        repo.on_peak_interval("A", 0, 1.0);
        repo.on_peak_interval("A", 500, 2.0);
        assert_eq!(hrv_values(&repo, "A"), vec![2.0]);
        repo.on_peak_interval("A", 2000, 3.0);
        assert_eq!(hrv_values(&repo, "A"), vec![2.0, 3.0]);
    }

    #[test]
    fn hrv_sample_1100_after_previous_appends() {
        // 1600 - 500 = 1100 ≥ 1000 appends.
        let repo = repo();
        advertise(&repo, "A");
        repo.on_peak_interval("A", 0, 1.0);
        repo.on_peak_interval("A", 500, 2.0);
        repo.on_peak_interval("A", 1600, 3.0);
        assert_eq!(hrv_values(&repo, "A"), vec![2.0, 3.0]);
    }

    #[test]
    fn hrv_spaced_samples_append_and_close_one_resets() {
        let repo = repo();
        advertise(&repo, "A");
        repo.on_peak_interval("A", 0, 1.0);
        repo.on_peak_interval("A", 1000, 2.0);
        repo.on_peak_interval("A", 2500, 3.0);
        assert_eq!(hrv_values(&repo, "A"), vec![1.0, 2.0, 3.0]);

        repo.on_peak_interval("A", 3000, 4.0);
        let view = repo.snapshot();
        assert_eq!(view["A"].hrv.values(), vec![4.0]);
        assert_eq!(view["A"].hrv.sample_count(), 1);
        assert_eq!(view["A"].hrv.last_sample_time(), Some(3000));
    }

    #[test]
    fn hrv_cap_is_applied() {
        let repo = PeripheralRepository::new(
            CountingScheduler::default(),
            RepositoryConfig {
                max_hrv_samples: NonZeroUsize::new(2),
                ..Default::default()
            },
        );
        repo.on_advertisement("A", None, Advertisement::new(0, -60, -59));
        for (i, t) in [0, 1000, 2000].into_iter().enumerate() {
            repo.on_peak_interval("A", t, i as f32);
        }
        assert_eq!(repo.snapshot()["A"].hrv.values(), vec![1.0, 2.0]);
    }

    #[test]
    fn connect_starts_pattern_even_without_record() {
        let repo = repo();
        repo.on_connected("unknown");
        assert_eq!(repo.scheduler().starts(), 1);
    }

    #[test]
    fn connection_state_follows_transport() {
        let repo = repo();
        advertise(&repo, "A");
        repo.on_connecting("A");
        assert_eq!(repo.snapshot()["A"].connection_state, ConnectionState::Connecting);
        repo.on_connected("A");
        assert_eq!(repo.snapshot()["A"].connection_state, ConnectionState::Connected);
        repo.on_disconnecting("A");
        assert_eq!(
            repo.snapshot()["A"].connection_state,
            ConnectionState::Disconnecting
        );
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let repo = repo();
        advertise(&repo, "A");
        repo.on_connected("A");
        assert_eq!(repo.snapshot()["A"].connection_state, ConnectionState::Discovered);
    }

    #[test]
    fn stop_after_every_peripheral_reports() {
        let repo = repo();
        advertise(&repo, "A");
        advertise(&repo, "B");
        repo.on_ultrasonic("A", true);
        assert_eq!(repo.scheduler().stops(), 0);
        repo.on_ultrasonic("B", false);
        assert_eq!(repo.scheduler().stops(), 1);

        let view = repo.snapshot();
        assert_eq!(view["A"].ultrasonic, UltrasonicStatus::Detected);
        assert_eq!(view["B"].ultrasonic, UltrasonicStatus::NotDetected);
    }

    #[test]
    fn disconnecting_last_waiting_peripheral_stops() {
        let repo = repo();
        advertise(&repo, "A");
        advertise(&repo, "B");
        repo.on_ultrasonic("A", true);

        repo.on_disconnected("B");
        assert_eq!(repo.scheduler().stops(), 1);
        assert!(!repo.snapshot().contains_key("B"));
    }

    #[test]
    fn disconnect_keeps_playing_while_others_wait() {
        let repo = repo();
        advertise(&repo, "A");
        advertise(&repo, "B");
        advertise(&repo, "C");
        repo.on_ultrasonic("A", true);

        repo.on_disconnected("A");
        assert_eq!(repo.scheduler().stops(), 0);
        repo.on_disconnected("B");
        assert_eq!(repo.scheduler().stops(), 0);
    }

    #[test]
    fn malformed_payload_leaves_records_untouched() {
        let repo = repo();
        advertise(&repo, "A");
        let before = repo.snapshot();

        let err = repo
            .apply_characteristic("A", CharacteristicKind::PeakInterval, &[1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload { actual: 3, .. }));
        assert!(repo
            .apply_characteristic("A", CharacteristicKind::UltrasonicDetected, &[])
            .is_err());
        assert!(repo
            .apply_characteristic("A", CharacteristicKind::DeviceId, &[0, 1])
            .is_err());

        assert_eq!(*repo.snapshot(), *before);
        assert_eq!(repo.scheduler().stops(), 0);
    }

    #[test]
    fn apply_characteristic_decodes_and_applies() {
        let repo = repo();
        advertise(&repo, "A");
        repo.apply_characteristic("A", CharacteristicKind::DeviceId, &42_i32.to_be_bytes())
            .unwrap();
        repo.apply_characteristic("A", CharacteristicKind::UltrasonicDetected, &[1])
            .unwrap();
        let mut interval = 5_000_i64.to_le_bytes().to_vec();
        interval.extend_from_slice(&812.5_f32.to_le_bytes());
        repo.apply_characteristic("A", CharacteristicKind::PeakInterval, &interval)
            .unwrap();

        let view = repo.snapshot();
        let record = &view["A"];
        assert_eq!(record.persistent_id, Some(42));
        assert_eq!(record.ultrasonic, UltrasonicStatus::Detected);
        assert_eq!(record.hrv.values(), vec![812.5]);
    }

    #[test]
    fn observers_see_each_change() {
        let repo = repo();
        let mut rx = repo.subscribe();
        assert!(rx.borrow_and_update().is_empty());

        advertise(&repo, "A");
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().contains_key("A"));

        repo.on_disconnected("A");
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_empty());
    }

    #[test]
    fn shutdown_stops_pattern() {
        let repo = repo();
        repo.shutdown();
        assert_eq!(repo.scheduler().stops(), 1);
    }
}
