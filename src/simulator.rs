//! Virtual transport with scripted HRV sensors.
//!
//! [`spawn`] returns the same [`TransportLink`] as the BLE client, so the
//! controller, repository and scheduler run unchanged without hardware.
//!
//! Each virtual sensor:
//!
//! | Behaviour | Timing |
//! |---|---|
//! | advertises while unconnected and the host is scanning | every `advertise_interval` |
//! | completes a connection | `connect_delay` after `Connect` |
//! | reports its ultrasonic outcome | `ultrasonic_delay` after subscription |
//! | emits a peak-interval sample | first 1 s after subscription, then every 1.0–1.2 s |
//!
//! Every third sensor (index 1, 4, …) never hears the pattern and reports
//! `NotDetected`.  Optionally one sensor reboots under a new address while the
//! host still believes the old link is alive; the stale link is reported lost
//! `stale_link_timeout` later.  That exercises identity reconciliation.
//!
//! All jitter comes from a deterministic hash, so runs are reproducible.

use std::collections::BTreeSet;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::CharacteristicKind;
use crate::sensor_client::{now_ms, TransportLink};
use crate::types::{TransportCommand, TransportEvent};

const TICK: Duration = Duration::from_millis(50);

/// Configuration for the virtual transport.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Number of virtual sensors.  Default: `3`.
    pub sensors: usize,
    /// Default: 250 ms.
    pub advertise_interval: Duration,
    /// Default: 300 ms.
    pub connect_delay: Duration,
    /// Default: 3 s.
    pub ultrasonic_delay: Duration,
    /// Index of the sensor that reboots under a new address.  Default: `Some(0)`.
    pub rotating_sensor: Option<usize>,
    /// How long the rotating sensor stays connected before rebooting.
    /// Default: 20 s.
    pub rotate_after: Duration,
    /// Delay before the host notices the rebooted sensor's old link is gone.
    /// Default: 2 s.
    pub stale_link_timeout: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sensors: 3,
            advertise_interval: Duration::from_millis(250),
            connect_delay: Duration::from_millis(300),
            ultrasonic_delay: Duration::from_secs(3),
            rotating_sensor: Some(0),
            rotate_after: Duration::from_secs(20),
            stale_link_timeout: Duration::from_secs(2),
        }
    }
}

/// Start the virtual transport on the current tokio runtime.
pub fn spawn(config: SimulatorConfig) -> TransportLink {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(256);

    info!("simulator: {} virtual sensor(s)", config.sensors);
    let sim = Simulator {
        sensors: (0..config.sensors).map(VirtualSensor::new).collect(),
        config,
        scanning: false,
        stale_links: Vec::new(),
        events: event_tx,
    };
    tokio::spawn(sim.run(command_rx));

    TransportLink {
        commands: command_tx,
        events: event_rx,
    }
}

/// Deterministic pseudo-random value in `(-1, 1)`.
fn noise(x: f64) -> f64 {
    (x.sin() * 9973.1).fract()
}

// ── Virtual sensor ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum SimLink {
    Idle,
    Connecting { due: Duration },
    Connected { since: Duration },
}

struct VirtualSensor {
    index: usize,
    device_id: i32,
    generation: u8,
    address: String,
    tx_power: i16,
    base_rssi: i16,
    detects: bool,
    link: SimLink,
    next_advert: Duration,
    ultrasonic_due: Option<Duration>,
    next_peak: Option<Duration>,
    beats: u64,
    rotated: bool,
}

impl VirtualSensor {
    fn new(index: usize) -> Self {
        Self {
            index,
            device_id: 1000 + index as i32,
            generation: 0,
            address: Self::address_for(index, 0),
            tx_power: -59,
            base_rssi: -55 - 6 * index as i16,
            detects: index % 3 != 1,
            link: SimLink::Idle,
            next_advert: Duration::ZERO,
            ultrasonic_due: None,
            next_peak: None,
            beats: 0,
            rotated: false,
        }
    }

    fn address_for(index: usize, generation: u8) -> String {
        format!("5A:1E:00:00:{generation:02X}:{:02X}", index as u8)
    }

    fn name(&self) -> String {
        format!("HRV-{}", self.index + 1)
    }

    fn rssi(&self, now: Duration) -> i16 {
        let x = now.as_secs_f64() * 3.1 + self.index as f64 * 17.3;
        self.base_rssi + (noise(x) * 4.0).round() as i16
    }

    /// One peak-to-peak interval in ms: a slow respiratory swing plus noise.
    fn interval_value(&self, at: Duration) -> f32 {
        let t = at.as_secs_f64();
        let swing = 60.0 * (2.0 * std::f64::consts::PI * 0.1 * t).sin();
        let jitter = noise(t * 7.7 + self.index as f64) * 15.0;
        (850.0 + 40.0 * self.index as f64 + swing + jitter) as f32
    }

    fn drop_link(&mut self) {
        self.link = SimLink::Idle;
        self.ultrasonic_due = None;
        self.next_peak = None;
    }
}

// ── Simulator task ────────────────────────────────────────────────────────────

struct Simulator {
    config: SimulatorConfig,
    sensors: Vec<VirtualSensor>,
    scanning: bool,
    /// Old addresses of rebooted sensors with the time their loss is noticed.
    stale_links: Vec<(Duration, String)>,
    events: mpsc::Sender<TransportEvent>,
}

impl Simulator {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TransportCommand>) {
        let start = Instant::now();
        let mut ticker = tokio::time::interval(TICK);
        loop {
            let events = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command, start.elapsed()),
                    None => break,
                },
                _ = ticker.tick() => self.tick(start.elapsed()),
            };
            for event in events {
                if self.events.send(event).await.is_err() {
                    debug!("simulator: event receiver dropped");
                    return;
                }
            }
        }
        info!("simulator: command channel closed");
    }

    fn sensor_mut(&mut self, address: &str) -> Option<&mut VirtualSensor> {
        self.sensors.iter_mut().find(|s| s.address == address)
    }

    fn handle(&mut self, command: TransportCommand, now: Duration) -> Vec<TransportEvent> {
        debug!("simulator: {command:?}");
        let config = self.config.clone();
        match command {
            TransportCommand::StartScan { .. } => self.scanning = true,
            TransportCommand::StopScan => self.scanning = false,

            TransportCommand::Connect { address } => match self.sensor_mut(&address) {
                Some(sensor) if sensor.link == SimLink::Idle => {
                    sensor.link = SimLink::Connecting {
                        due: now + config.connect_delay,
                    };
                }
                _ => return vec![TransportEvent::PeripheralConnectionFailed { address }],
            },

            TransportCommand::Disconnect { address } => {
                if let Some(sensor) = self.sensor_mut(&address) {
                    if sensor.link != SimLink::Idle {
                        sensor.drop_link();
                        return vec![TransportEvent::PeripheralDisconnected { address }];
                    }
                } else if let Some(pos) = self.stale_links.iter().position(|(_, a)| *a == address)
                {
                    self.stale_links.remove(pos);
                    return vec![TransportEvent::PeripheralDisconnected { address }];
                }
            }

            TransportCommand::ReadCharacteristic { address, kind } => {
                let Some(sensor) = self.sensor_mut(&address) else {
                    return Vec::new();
                };
                if kind == CharacteristicKind::DeviceId
                    && matches!(sensor.link, SimLink::Connected { .. })
                {
                    return vec![TransportEvent::CharacteristicUpdated {
                        address,
                        kind,
                        value: sensor.device_id.to_be_bytes().to_vec(),
                    }];
                }
            }

            TransportCommand::SetNotify {
                address,
                kind,
                enabled,
            } => {
                if let Some(sensor) = self.sensor_mut(&address) {
                    match kind {
                        CharacteristicKind::UltrasonicDetected => {
                            sensor.ultrasonic_due = enabled.then(|| now + config.ultrasonic_delay);
                        }
                        CharacteristicKind::PeakInterval => {
                            sensor.next_peak = enabled.then(|| now + Duration::from_secs(1));
                        }
                        CharacteristicKind::DeviceId => {}
                    }
                }
            }
        }
        Vec::new()
    }

    fn tick(&mut self, now: Duration) -> Vec<TransportEvent> {
        let mut out = Vec::new();

        let (lost, kept): (Vec<_>, Vec<_>) =
            self.stale_links.drain(..).partition(|(due, _)| now >= *due);
        self.stale_links = kept;
        for (_, address) in lost {
            info!("simulator: stale link {address} timed out");
            out.push(TransportEvent::PeripheralDisconnected { address });
        }

        for sensor in &mut self.sensors {
            match sensor.link {
                SimLink::Idle => {
                    if self.scanning && now >= sensor.next_advert {
                        sensor.next_advert = now + self.config.advertise_interval;
                        out.push(TransportEvent::PeripheralDiscovered {
                            address: sensor.address.clone(),
                            name: Some(sensor.name()),
                            rssi: sensor.rssi(now),
                            tx_power: sensor.tx_power,
                            timestamp_ms: now_ms(),
                        });
                    }
                }
                SimLink::Connecting { due } => {
                    if now >= due {
                        sensor.link = SimLink::Connected { since: now };
                        out.push(TransportEvent::PeripheralConnected {
                            address: sensor.address.clone(),
                            characteristics: CharacteristicKind::ALL.into_iter().collect::<BTreeSet<_>>(),
                        });
                    }
                }
                SimLink::Connected { since } => {
                    if let Some(due) = sensor.ultrasonic_due.filter(|due| now >= *due) {
                        sensor.ultrasonic_due = None;
                        debug!("simulator: {} heard pattern at {due:?}: {}", sensor.address, sensor.detects);
                        out.push(TransportEvent::CharacteristicUpdated {
                            address: sensor.address.clone(),
                            kind: CharacteristicKind::UltrasonicDetected,
                            value: vec![u8::from(sensor.detects)],
                        });
                    }

                    if let Some(due) = sensor.next_peak.filter(|due| now >= *due) {
                        sensor.beats += 1;
                        let mut value = (due.as_millis() as i64).to_le_bytes().to_vec();
                        value.extend_from_slice(&sensor.interval_value(due).to_le_bytes());
                        out.push(TransportEvent::CharacteristicUpdated {
                            address: sensor.address.clone(),
                            kind: CharacteristicKind::PeakInterval,
                            value,
                        });
                        let spacing = 1000 + (noise(sensor.beats as f64 * 1.37).abs() * 200.0) as u64;
                        sensor.next_peak = Some(due + Duration::from_millis(spacing));
                    }

                    let reboots = !sensor.rotated
                        && self.config.rotating_sensor == Some(sensor.index)
                        && now >= since + self.config.rotate_after;
                    if reboots {
                        sensor.rotated = true;
                        sensor.generation = sensor.generation.wrapping_add(1);
                        let old = std::mem::replace(
                            &mut sensor.address,
                            VirtualSensor::address_for(sensor.index, sensor.generation),
                        );
                        info!("simulator: {old} rebooted as {}", sensor.address);
                        self.stale_links
                            .push((now + self.config.stale_link_timeout, old));
                        sensor.drop_link();
                        sensor.next_advert = now;
                    }
                }
            }
        }
        out
    }
}
