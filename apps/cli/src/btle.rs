//! `BlePlatform` on top of btleplug.
//!
//! btleplug is async. Each call blocks on a private tokio runtime and reports
//! its outcome to the facade as a `BleEvent`. Advertisements, link loss and
//! notifications are pumped from background tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _,
    ScanFilter as BtleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as BtlePeripheral};
use futures::StreamExt;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use grdfu_core::ble::{
    BleError, BleEvent, BleEventHandler, BlePlatform, CharProperties, Characteristic,
    Peripheral, Service, WriteKind,
};

/// btleplug does not expose the negotiated MTU.
pub const DEFAULT_MTU: usize = 247;

type HandlerSlot = Arc<Mutex<Option<Arc<dyn BleEventHandler>>>>;

#[derive(Default)]
struct LinkState {
    known: HashMap<String, BtlePeripheral>,
    connected: Option<BtlePeripheral>,
    services: Vec<Service>,
    notifications: Option<JoinHandle<()>>,
}

pub struct BtlePlatform {
    runtime: Runtime,
    adapter: Adapter,
    handler: HandlerSlot,
    state: Arc<Mutex<LinkState>>,
    scanning: Arc<AtomicBool>,
    mtu: usize,
}

fn emit(handler: &HandlerSlot, event: BleEvent) {
    let handler = handler.lock().unwrap_or_else(|e| e.into_inner()).clone();
    match handler {
        Some(h) => h.handle(event),
        None => trace!(?event, "no handler attached, event dropped"),
    }
}

fn lock(state: &Mutex<LinkState>) -> MutexGuard<'_, LinkState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn ble_error(context: &str, err: btleplug::Error) -> BleError {
    BleError::Other(format!("{}: {}", context, err))
}

fn properties(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

impl BtlePlatform {
    /// Open the first Bluetooth adapter and start listening for its events.
    pub fn new(mtu: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("btleplug")
            .build()
            .context("failed to start the BLE runtime")?;
        let adapter = runtime.block_on(async {
            let manager = Manager::new().await?;
            let adapter = manager
                .adapters()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no Bluetooth adapter found"))?;
            Ok::<_, anyhow::Error>(adapter)
        })?;

        let platform = Self {
            runtime,
            adapter,
            handler: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(LinkState::default())),
            scanning: Arc::new(AtomicBool::new(false)),
            mtu,
        };
        platform.pump_central_events()?;
        Ok(platform)
    }

    fn pump_central_events(&self) -> Result<()> {
        let mut events = self
            .runtime
            .block_on(self.adapter.events())
            .context("failed to subscribe to adapter events")?;
        let adapter = self.adapter.clone();
        let handler = self.handler.clone();
        let state = self.state.clone();
        let scanning = self.scanning.clone();

        self.runtime.spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        if !scanning.load(Ordering::SeqCst) {
                            continue;
                        }
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        let props = peripheral.properties().await.ok().flatten();
                        let name = props.as_ref().and_then(|p| p.local_name.clone());
                        let rssi = props.and_then(|p| p.rssi).unwrap_or(i16::MIN);
                        let key = id.to_string();
                        lock(&state).known.insert(key.clone(), peripheral);
                        emit(
                            &handler,
                            BleEvent::DeviceDiscovered {
                                peripheral: Peripheral::new(key, name.as_deref()),
                                rssi,
                            },
                        );
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let ours = {
                            let mut st = lock(&state);
                            let ours = st.connected.as_ref().is_some_and(|p| p.id() == id);
                            if ours {
                                st.connected = None;
                                st.services.clear();
                                if let Some(task) = st.notifications.take() {
                                    task.abort();
                                }
                            }
                            ours
                        };
                        if ours {
                            debug!(%id, "link lost");
                            emit(&handler, BleEvent::Disconnected { error: None });
                        }
                    }
                    _ => {}
                }
            }
            warn!("adapter event stream ended");
        });
        Ok(())
    }

    fn connected(&self, context: &str) -> Result<BtlePeripheral, BleError> {
        lock(&self.state)
            .connected
            .clone()
            .ok_or_else(|| BleError::Other(format!("{}: not connected", context)))
    }

    fn find(
        peripheral: &BtlePeripheral,
        characteristic: &Characteristic,
    ) -> Option<btleplug::api::Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
    }
}

impl BlePlatform for BtlePlatform {
    fn attach(&self, handler: Arc<dyn BleEventHandler>) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn is_powered_on(&self) -> bool {
        // An opened adapter is usable; btleplug reports no separate power state.
        true
    }

    fn start_scan(&self) -> Result<(), BleError> {
        self.scanning.store(true, Ordering::SeqCst);
        self.runtime
            .block_on(self.adapter.start_scan(BtleScanFilter::default()))
            .map_err(|e| ble_error("scan", e))
    }

    fn stop_scan(&self) {
        self.scanning.store(false, Ordering::SeqCst);
        if let Err(e) = self.runtime.block_on(self.adapter.stop_scan()) {
            debug!(error = %e, "stop scan failed");
        }
    }

    fn connect(&self, peripheral: &Peripheral) -> Result<(), BleError> {
        let Some(target) = lock(&self.state).known.get(&peripheral.id).cloned() else {
            emit(
                &self.handler,
                BleEvent::ConnectFailed {
                    reason: Some(format!("{} has not been seen by a scan", peripheral)),
                },
            );
            return Ok(());
        };

        let connected = self.runtime.block_on(async {
            target.connect().await?;
            target.notifications().await
        });
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                emit(
                    &self.handler,
                    BleEvent::ConnectFailed {
                        reason: Some(e.to_string()),
                    },
                );
                return Ok(());
            }
        };

        let handler = self.handler.clone();
        let task = self.runtime.spawn(async move {
            let mut stream = stream;
            while let Some(n) = stream.next().await {
                emit(
                    &handler,
                    BleEvent::ValueUpdated {
                        characteristic: n.uuid,
                        value: n.value,
                    },
                );
            }
        });
        {
            let mut st = lock(&self.state);
            st.connected = Some(target);
            st.services.clear();
            if let Some(old) = st.notifications.replace(task) {
                old.abort();
            }
        }
        emit(&self.handler, BleEvent::Connected);
        Ok(())
    }

    fn cancel_connection(&self, _peripheral: &Peripheral) -> Result<(), BleError> {
        let target = {
            let mut st = lock(&self.state);
            if let Some(task) = st.notifications.take() {
                task.abort();
            }
            st.services.clear();
            st.connected.take()
        };
        let error = match target {
            Some(p) => self
                .runtime
                .block_on(p.disconnect())
                .err()
                .map(|e| e.to_string()),
            None => None,
        };
        emit(&self.handler, BleEvent::Disconnected { error });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected.is_some()
    }

    fn discover_services(&self) -> Result<(), BleError> {
        let target = self.connected("discover")?;
        if let Err(e) = self.runtime.block_on(target.discover_services()) {
            emit(
                &self.handler,
                BleEvent::ServicesDiscovered {
                    count: 0,
                    error: Some(e.to_string()),
                },
            );
            return Ok(());
        }

        let services: Vec<Service> = target
            .services()
            .into_iter()
            .map(|s| Service {
                uuid: s.uuid,
                characteristics: s
                    .characteristics
                    .into_iter()
                    .map(|c| Characteristic {
                        service: c.service_uuid,
                        uuid: c.uuid,
                        properties: properties(c.properties),
                    })
                    .collect(),
            })
            .collect();
        lock(&self.state).services = services.clone();

        emit(
            &self.handler,
            BleEvent::ServicesDiscovered {
                count: services.len(),
                error: None,
            },
        );
        for service in &services {
            emit(
                &self.handler,
                BleEvent::CharacteristicsDiscovered {
                    service: service.uuid,
                    count: service.characteristics.len(),
                    error: None,
                },
            );
        }
        for chr in services.iter().flat_map(|s| s.characteristics.iter()) {
            emit(
                &self.handler,
                BleEvent::DescriptorsDiscovered {
                    characteristic: chr.uuid,
                    error: None,
                },
            );
        }
        Ok(())
    }

    fn services(&self) -> Vec<Service> {
        lock(&self.state).services.clone()
    }

    fn set_notify(&self, characteristic: &Characteristic, enabled: bool) -> Result<(), BleError> {
        let target = self.connected("setNotify")?;
        let error = match Self::find(&target, characteristic) {
            Some(c) => {
                let outcome = if enabled {
                    self.runtime.block_on(target.subscribe(&c))
                } else {
                    self.runtime.block_on(target.unsubscribe(&c))
                };
                outcome.err().map(|e| e.to_string())
            }
            None => Some("unknown characteristic".to_string()),
        };
        emit(
            &self.handler,
            BleEvent::NotificationStateChanged {
                characteristic: characteristic.uuid,
                enabled,
                error,
            },
        );
        Ok(())
    }

    fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError> {
        let target = self.connected("write")?;
        let c = Self::find(&target, characteristic)
            .ok_or_else(|| BleError::Other(format!("write: unknown {}", characteristic.uuid)))?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        let error = self
            .runtime
            .block_on(target.write(&c, data, write_type))
            .err()
            .map(|e| e.to_string());

        let event = match (kind, error) {
            (WriteKind::WithoutResponse, None) => BleEvent::ReadyToSendWithoutResponse,
            (_, error) => BleEvent::WriteCompleted {
                characteristic: characteristic.uuid,
                error,
            },
        };
        emit(&self.handler, event);
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
