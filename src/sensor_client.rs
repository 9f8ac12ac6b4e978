//! BLE transport backed by `btleplug`.
//!
//! [`SensorClient::open`] picks the first Bluetooth adapter and returns a
//! [`TransportLink`]: a command sender for the controller and a receiver of
//! [`TransportEvent`]s.  Two background tasks do the work:
//!
//! * the **adapter pump** turns the adapter's `CentralEvent` stream into
//!   `PeripheralDiscovered` / `PeripheralDisconnected` events;
//! * the **command executor** runs scan, connect, read and subscribe requests.
//!   Each connection attempt runs in its own task so a slow peripheral never
//!   stalls the others.
//!
//! Every connected peripheral also gets a notification pump that forwards
//! values of the recognised characteristics.  Notifications from any other
//! characteristic are dropped.
//!
//! Failures never escape as errors once the link is open: they are logged and
//! reported as `PeripheralConnectionFailed` or `PeripheralDisconnected`.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use btleplug::api::{
    BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{CharacteristicKind, IDENTIFICATION_SERVICE_UUID};
use crate::types::{TransportCommand, TransportEvent};

// ── Timestamp helper ──────────────────────────────────────────────────────────

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ── ClientConfig ──────────────────────────────────────────────────────────────

/// Configuration for [`SensorClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Only advertisements listing this service are reported.
    /// Default: the identification service.
    pub scan_service: Uuid,
    /// Transmit power assumed when an advertisement carries none, in dBm.
    /// Default: `-59`.
    pub fallback_tx_power: i16,
    /// Give up on `connect()` after this long.  Default: 10 s.
    pub connect_timeout: Duration,
    /// Give up on GATT service discovery after this long.  Default: 15 s.
    pub discovery_timeout: Duration,
    /// Pause between link-up and service discovery on Linux, where BlueZ
    /// reports the connection before its GATT cache is filled.
    /// Default: 600 ms.
    pub linux_settle_delay: Duration,
    /// Give up on a single read, subscribe, unsubscribe or disconnect after
    /// this long.  Commands run one at a time, so a hung request would
    /// otherwise hold up every later one.  Default: 5 s.
    pub gatt_timeout: Duration,
    /// Capacity of the event channel.  Default: `256`.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scan_service: IDENTIFICATION_SERVICE_UUID,
            fallback_tx_power: -59,
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(15),
            linux_settle_delay: Duration::from_millis(600),
            gatt_timeout: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

// ── TransportLink ─────────────────────────────────────────────────────────────

/// The two ends a controller needs to drive a transport.
pub struct TransportLink {
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Connected peripherals by address.  Whoever removes an entry reports the
/// disconnect, so it is reported once.
type Connections = Arc<Mutex<HashMap<String, Peripheral>>>;

/// Shared state of the background tasks.
#[derive(Clone)]
struct Shared {
    adapter: Adapter,
    events: mpsc::Sender<TransportEvent>,
    connections: Connections,
    scanning: Arc<AtomicBool>,
    config: ClientConfig,
}

impl Shared {
    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("sensor_client: event receiver dropped");
        }
    }

    /// Forget `address` and report it gone, unless someone already did.
    async fn report_disconnected(&self, address: &str) {
        let removed = self.connections.lock().remove(address).is_some();
        if removed {
            self.emit(TransportEvent::PeripheralDisconnected {
                address: address.to_owned(),
            })
            .await;
        }
    }

    fn connected(&self, address: &str) -> Option<Peripheral> {
        self.connections.lock().get(address).cloned()
    }
}

// ── SensorClient ──────────────────────────────────────────────────────────────

/// BLE transport for HRV sensors.
pub struct SensorClient {
    config: ClientConfig,
}

impl SensorClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Open the first Bluetooth adapter and start the transport tasks.
    pub async fn open(&self) -> Result<TransportLink> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        info!("sensor_client: using adapter {}", adapter.adapter_info().await?);

        wait_until_powered_on(&adapter).await;

        let central_events = adapter.events().await?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity);

        let shared = Shared {
            adapter,
            events: event_tx,
            connections: Arc::default(),
            scanning: Arc::default(),
            config: self.config.clone(),
        };

        tokio::spawn(pump_adapter_events(shared.clone(), central_events));
        tokio::spawn(execute_commands(shared, command_rx));

        Ok(TransportLink {
            commands: command_tx,
            events: event_rx,
        })
    }
}

// ── macOS power-on wait ───────────────────────────────────────────────────────

/// CoreBluetooth starts in an "unknown" state and silently ignores scans
/// until it reaches PoweredOn.
#[cfg(target_os = "macos")]
async fn wait_until_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => {
                info!("macOS: adapter is PoweredOn");
                break;
            }
            Ok(state) => {
                if tokio::time::Instant::now() >= deadline {
                    warn!("macOS: adapter still in state {state:?} after 3 s, proceeding");
                    break;
                }
                debug!("macOS: adapter state = {state:?}, waiting…");
            }
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_until_powered_on(_adapter: &Adapter) {}

// ── Addressing ────────────────────────────────────────────────────────────────

/// Transient address of `peripheral`.
///
/// Linux and Windows expose the MAC address.  CoreBluetooth hides it and
/// reports all zeros, so the platform UUID stands in there.
fn peripheral_address(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        address.to_string()
    }
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Peripheral> {
    adapter
        .peripherals()
        .await?
        .into_iter()
        .find(|p| peripheral_address(p) == address)
        .ok_or_else(|| anyhow!("peripheral {address} not known to the adapter"))
}

// ── Adapter pump ──────────────────────────────────────────────────────────────

async fn pump_adapter_events<S>(shared: Shared, mut central_events: S)
where
    S: futures::Stream<Item = CentralEvent> + Unpin,
{
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if !shared.scanning.load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(event) = advertisement_event(&shared, &id).await {
                    shared.emit(event).await;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let address = match shared.adapter.peripheral(&id).await {
                    Ok(p) => peripheral_address(&p),
                    Err(_) => id.to_string(),
                };
                debug!("sensor_client: adapter reports {address} disconnected");
                shared.report_disconnected(&address).await;
            }
            _ => {}
        }
        if shared.events.is_closed() {
            break;
        }
    }
    info!("sensor_client: adapter event stream ended");
}

/// Build a discovery event for `id` if it advertises the scan service.
async fn advertisement_event(shared: &Shared, id: &PeripheralId) -> Option<TransportEvent> {
    let peripheral = shared.adapter.peripheral(id).await.ok()?;
    let PeripheralProperties {
        local_name,
        rssi,
        tx_power_level,
        services,
        ..
    } = peripheral.properties().await.ok()??;

    if !services.contains(&shared.config.scan_service) {
        return None;
    }
    let rssi = rssi?;
    Some(TransportEvent::PeripheralDiscovered {
        address: peripheral_address(&peripheral),
        name: local_name,
        rssi,
        tx_power: tx_power_level.unwrap_or(shared.config.fallback_tx_power),
        timestamp_ms: now_ms(),
    })
}

// ── Command executor ──────────────────────────────────────────────────────────

async fn execute_commands(shared: Shared, mut commands: mpsc::UnboundedReceiver<TransportCommand>) {
    while let Some(command) = commands.recv().await {
        debug!("sensor_client: {command:?}");
        match command {
            TransportCommand::StartScan { service } => {
                shared.scanning.store(true, Ordering::SeqCst);
                let filter = ScanFilter {
                    services: vec![service],
                };
                if let Err(e) = shared.adapter.start_scan(filter).await {
                    warn!("sensor_client: start_scan failed: {e}");
                }
            }
            TransportCommand::StopScan => {
                shared.scanning.store(false, Ordering::SeqCst);
                if let Err(e) = shared.adapter.stop_scan().await {
                    warn!("sensor_client: stop_scan failed: {e}");
                }
            }
            TransportCommand::Connect { address } => {
                tokio::spawn(connect(shared.clone(), address));
            }
            TransportCommand::Disconnect { address } => {
                let peripheral = match shared.connected(&address) {
                    Some(p) => Ok(p),
                    None => find_peripheral(&shared.adapter, &address).await,
                };
                match peripheral {
                    Ok(p) => {
                        let limit = shared.config.gatt_timeout;
                        if let Err(e) = bounded(limit, "disconnect()", p.disconnect()).await {
                            warn!("sensor_client: disconnect {address}: {e}");
                        }
                    }
                    Err(e) => warn!("sensor_client: disconnect {address}: {e}"),
                }
            }
            TransportCommand::ReadCharacteristic { address, kind } => {
                if let Err(e) = read(&shared, &address, kind).await {
                    warn!("sensor_client: read {kind:?} from {address}: {e}");
                }
            }
            TransportCommand::SetNotify {
                address,
                kind,
                enabled,
            } => {
                if let Err(e) = set_notify(&shared, &address, kind, enabled).await {
                    warn!("sensor_client: notify {kind:?}={enabled} on {address}: {e}");
                }
            }
        }
    }
    info!("sensor_client: command channel closed");
}

// ── Connect ───────────────────────────────────────────────────────────────────

async fn connect(shared: Shared, address: String) {
    match establish(&shared, &address).await {
        Ok((peripheral, characteristics)) => {
            shared
                .connections
                .lock()
                .insert(address.clone(), peripheral.clone());
            tokio::spawn(pump_notifications(shared.clone(), peripheral, address.clone()));
            shared
                .emit(TransportEvent::PeripheralConnected {
                    address,
                    characteristics,
                })
                .await;
        }
        Err(e) => {
            warn!("sensor_client: connect {address}: {e}");
            shared
                .emit(TransportEvent::PeripheralConnectionFailed { address })
                .await;
        }
    }
}

/// Connect, discover services and list the recognised characteristics.
async fn establish(
    shared: &Shared,
    address: &str,
) -> Result<(Peripheral, BTreeSet<CharacteristicKind>)> {
    let config = &shared.config;
    let peripheral = find_peripheral(&shared.adapter, address).await?;

    // BlueZ's Device1.Connect can block forever when the device walks away.
    bounded(config.connect_timeout, "connect()", peripheral.connect()).await?;

    #[cfg(target_os = "linux")]
    tokio::time::sleep(config.linux_settle_delay).await;

    bounded(
        config.discovery_timeout,
        "discover_services()",
        peripheral.discover_services(),
    )
    .await?;

    let characteristics: BTreeSet<CharacteristicKind> = peripheral
        .characteristics()
        .iter()
        .filter_map(|c| CharacteristicKind::from_uuid(c.uuid))
        .collect();
    info!("sensor_client: {address} connected, found {characteristics:?}");
    Ok((peripheral, characteristics))
}

// ── Read / subscribe ──────────────────────────────────────────────────────────

/// Await a GATT operation for at most `limit`.
async fn bounded<T, E>(
    limit: Duration,
    op: &str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T>
where
    anyhow::Error: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow!("{op} timed out after {limit:?}")),
    }
}

fn characteristic_of(
    peripheral: &Peripheral,
    kind: CharacteristicKind,
) -> Result<btleplug::api::Characteristic> {
    let (uuid, service) = (kind.uuid(), kind.service());
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid && c.service_uuid == service)
        .ok_or_else(|| anyhow!("characteristic {uuid} not found"))
}

async fn read(shared: &Shared, address: &str, kind: CharacteristicKind) -> Result<()> {
    let peripheral = shared
        .connected(address)
        .ok_or_else(|| anyhow!("not connected"))?;
    let characteristic = characteristic_of(&peripheral, kind)?;
    let limit = shared.config.gatt_timeout;
    let value = bounded(limit, "read()", peripheral.read(&characteristic)).await?;
    shared
        .emit(TransportEvent::CharacteristicUpdated {
            address: address.to_owned(),
            kind,
            value,
        })
        .await;
    Ok(())
}

async fn set_notify(
    shared: &Shared,
    address: &str,
    kind: CharacteristicKind,
    enabled: bool,
) -> Result<()> {
    let peripheral = shared
        .connected(address)
        .ok_or_else(|| anyhow!("not connected"))?;
    let characteristic = characteristic_of(&peripheral, kind)?;
    let limit = shared.config.gatt_timeout;
    if enabled {
        bounded(limit, "subscribe()", peripheral.subscribe(&characteristic)).await
    } else {
        bounded(limit, "unsubscribe()", peripheral.unsubscribe(&characteristic)).await
    }
}

// ── Notification pump ─────────────────────────────────────────────────────────

async fn pump_notifications(shared: Shared, peripheral: Peripheral, address: String) {
    let mut notifications = match peripheral.notifications().await {
        Ok(n) => n,
        Err(e) => {
            warn!("sensor_client: {address}: could not get notification stream: {e}");
            return;
        }
    };
    let mut count: u64 = 0;

    while let Some(notif) = notifications.next().await {
        let Some(kind) = CharacteristicKind::from_uuid(notif.uuid) else {
            debug!("sensor_client: {address}: notification from unknown {}", notif.uuid);
            continue;
        };
        count += 1;
        if count <= 3 || count % 500 == 0 {
            debug!(
                "sensor_client: {address}: notif #{count} {kind:?} len={}",
                notif.value.len()
            );
        }
        shared
            .emit(TransportEvent::CharacteristicUpdated {
                address: address.clone(),
                kind,
                value: notif.value,
            })
            .await;
    }

    info!("sensor_client: {address}: notification stream ended");
    shared.report_disconnected(&address).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_scans_for_identification_service() {
        let config = ClientConfig::default();
        assert_eq!(config.scan_service, IDENTIFICATION_SERVICE_UUID);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_gatt_request_gives_up_after_the_limit() {
        let limit = ClientConfig::default().gatt_timeout;
        let started = tokio::time::Instant::now();
        let hung = std::future::pending::<std::io::Result<Vec<u8>>>();

        let err = bounded(limit, "read()", hung).await.unwrap_err();
        assert!(err.to_string().contains("read() timed out"));
        assert!(started.elapsed() >= limit);
    }

    #[tokio::test]
    async fn prompt_gatt_result_passes_through() {
        let limit = Duration::from_secs(1);
        let value = bounded(limit, "read()", async { Ok::<_, std::io::Error>(vec![1, 2]) })
            .await
            .unwrap();
        assert_eq!(value, vec![1, 2]);

        let failed = async { Err::<(), _>(std::io::Error::other("gone")) };
        assert!(bounded(limit, "subscribe()", failed).await.is_err());
    }

    #[test]
    fn now_ms_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
