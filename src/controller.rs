//! Transport-facing lifecycle state machine.
//!
//! The controller turns [`TransportEvent`]s into repository updates and
//! follow-up [`TransportCommand`]s.  It keeps its own mirror of each link
//! (state plus the characteristics found at connection time) because the
//! commands it issues depend on that, while the repository only stores what
//! observers need.
//!
//! | Event | Commands issued |
//! |---|---|
//! | discovered, idle peripheral | `StopScan`, `Connect` |
//! | connected | `StartScan`, `ReadCharacteristic(DeviceId)`, `SetNotify(..., true)` for each notify characteristic present |
//! | connection failed | `StartScan` |
//! | disconnected | none |
//! | characteristic updated | none |
//!
//! Every command is fire-and-forget; outcomes come back as events.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{CharacteristicKind, IDENTIFICATION_SERVICE_UUID};
use crate::repository::PeripheralRepository;
use crate::types::{Advertisement, ConnectionState, TransportCommand, TransportEvent};
use crate::ultrasonic::PatternScheduler;

// ── Command sink ──────────────────────────────────────────────────────────────

/// Where the controller sends its commands.
pub trait CommandSink {
    fn issue(&self, command: TransportCommand);
}

impl CommandSink for mpsc::UnboundedSender<TransportCommand> {
    fn issue(&self, command: TransportCommand) {
        if let Err(e) = mpsc::UnboundedSender::send(self, command) {
            debug!("controller: transport gone, dropped {:?}", e.0);
        }
    }
}

// ── Link mirror ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Link {
    state: ConnectionState,
    characteristics: BTreeSet<CharacteristicKind>,
}

// ── LifecycleController ───────────────────────────────────────────────────────

pub struct LifecycleController<C, S> {
    commands: C,
    repository: Arc<PeripheralRepository<S>>,
    links: HashMap<String, Link>,
    scanning: bool,
    service: Uuid,
}

impl<C: CommandSink, S: PatternScheduler> LifecycleController<C, S> {
    /// A controller scanning for the identification service.
    pub fn new(commands: C, repository: Arc<PeripheralRepository<S>>) -> Self {
        Self::with_service(commands, repository, IDENTIFICATION_SERVICE_UUID)
    }

    pub fn with_service(
        commands: C,
        repository: Arc<PeripheralRepository<S>>,
        service: Uuid,
    ) -> Self {
        Self {
            commands,
            repository,
            links: HashMap::new(),
            scanning: false,
            service,
        }
    }

    pub fn repository(&self) -> &Arc<PeripheralRepository<S>> {
        &self.repository
    }

    /// Mirrored link state of `address`, `None` when there is no link.
    pub fn link_state(&self, address: &str) -> Option<ConnectionState> {
        self.links.get(address).map(|l| l.state)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Begin scanning for peripherals.
    pub fn start(&mut self) {
        self.start_scanning();
    }

    fn start_scanning(&mut self) {
        if self.scanning {
            return;
        }
        self.scanning = true;
        self.commands.issue(TransportCommand::StartScan {
            service: self.service,
        });
    }

    fn stop_scanning(&mut self) {
        self.scanning = false;
        self.commands.issue(TransportCommand::StopScan);
    }

    /// Move the mirrored link of `address` to `next`, creating it if the
    /// transport reports a link we did not ask for.
    fn advance_link(&mut self, address: &str, next: ConnectionState) {
        match self.links.get_mut(address) {
            Some(link) => match link.state.transition(next) {
                Ok(state) => link.state = state,
                Err(e) => warn!("controller: {address}: {e}"),
            },
            None => {
                self.links.insert(
                    address.to_owned(),
                    Link {
                        state: next,
                        characteristics: BTreeSet::new(),
                    },
                );
            }
        }
    }

    // ── Events ───────────────────────────────────────────────────────────────

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeripheralDiscovered {
                address,
                name,
                rssi,
                tx_power,
                timestamp_ms,
            } => {
                self.repository.on_advertisement(
                    &address,
                    name,
                    Advertisement::new(timestamp_ms, rssi, tx_power),
                );
                if self.links.get(&address).is_some_and(|l| l.state.is_busy()) {
                    return;
                }
                info!("controller: connecting to {address}");
                self.stop_scanning();
                self.commands.issue(TransportCommand::Connect {
                    address: address.clone(),
                });
                self.advance_link(&address, ConnectionState::Connecting);
                self.repository.on_connecting(&address);
            }

            TransportEvent::PeripheralConnected {
                address,
                characteristics,
            } => {
                info!(
                    "controller: {address} connected with {} known characteristic(s)",
                    characteristics.len()
                );
                self.advance_link(&address, ConnectionState::Connected);
                if let Some(link) = self.links.get_mut(&address) {
                    link.characteristics = characteristics.clone();
                }
                self.repository.on_connected(&address);
                self.start_scanning();

                for kind in characteristics {
                    let command = if kind.is_notify() {
                        TransportCommand::SetNotify {
                            address: address.clone(),
                            kind,
                            enabled: true,
                        }
                    } else {
                        TransportCommand::ReadCharacteristic {
                            address: address.clone(),
                            kind,
                        }
                    };
                    self.commands.issue(command);
                }
            }

            TransportEvent::PeripheralConnectionFailed { address } => {
                warn!("controller: connection to {address} failed");
                self.links.remove(&address);
                self.repository.on_disconnected(&address);
                self.start_scanning();
            }

            TransportEvent::PeripheralDisconnected { address } => {
                info!("controller: {address} disconnected");
                self.links.remove(&address);
                self.repository.on_disconnected(&address);
            }

            TransportEvent::CharacteristicUpdated {
                address,
                kind,
                value,
            } => {
                if let Err(e) = self.repository.apply_characteristic(&address, kind, &value) {
                    warn!("controller: {address}: {e}");
                }
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Stop scanning, unsubscribe and drop every link, then stop playback.
    pub fn shutdown(&mut self) {
        info!("controller: shutting down {} link(s)", self.links.len());
        self.stop_scanning();

        let mut addresses: Vec<String> = self.links.keys().cloned().collect();
        addresses.sort();
        for address in addresses {
            let Some(link) = self.links.get(&address) else {
                continue;
            };
            match link.state {
                ConnectionState::Connected => {
                    for &kind in link.characteristics.iter().filter(|k| k.is_notify()) {
                        self.commands.issue(TransportCommand::SetNotify {
                            address: address.clone(),
                            kind,
                            enabled: false,
                        });
                    }
                }
                ConnectionState::Connecting => {}
                _ => continue,
            }
            self.commands.issue(TransportCommand::Disconnect {
                address: address.clone(),
            });
            self.advance_link(&address, ConnectionState::Disconnecting);
            self.repository.on_disconnecting(&address);
        }

        self.repository.shutdown();
    }

    /// Drive the controller until the transport closes its event channel or
    /// `shutdown` resolves, then tear everything down.
    pub async fn run<F>(&mut self, mut events: mpsc::Receiver<TransportEvent>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.start();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("controller: transport event stream ended");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("controller: shutdown requested");
                    break;
                }
            }
        }
        self.shutdown();
    }
}
