//! In-process BLE platform for tests and dry runs.
//!
//! Every request is answered synchronously on the calling thread, the way a
//! platform with an instantaneous radio would. A [`MockDevice`] scripts the
//! peripheral side: it supplies the GATT table and reacts to each written
//! packet with notifications.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use super::BleError;
use super::platform::{
    BleEvent, BleEventHandler, BlePlatform, Characteristic, Peripheral, Service, WriteKind,
};

/// Identifier of the scripted device.
pub const MOCK_DEVICE_ID: &str = "mock-0";
/// MTU reported by default (244-byte writes).
pub const MOCK_MTU: usize = 247;

/// Device-side reaction to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReaction {
    Notify { characteristic: Uuid, value: Vec<u8> },
    Disconnect,
}

/// Scripted peripheral.
pub trait MockDevice: Send {
    fn name(&self) -> String;

    fn services(&self) -> Vec<Service>;

    /// Called for every packet the host writes.
    fn on_write(&mut self, characteristic: Uuid, data: &[u8]) -> Vec<MockReaction>;

    /// Called when the host drops the link.
    fn on_disconnect(&mut self) {}
}

/// A packet the host wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub kind: WriteKind,
}

struct MockState {
    powered_on: bool,
    device: Option<Box<dyn MockDevice>>,
    rssi: i16,
    decoys: Vec<(Peripheral, i16)>,
    connected: bool,
    discovered: Vec<Service>,
    notifying: HashSet<Uuid>,
    writes: Vec<MockWrite>,
    connects: usize,
    mtu: usize,
    fail_writes: bool,
    silent_connect: bool,
}

/// Mock platform hosting at most one scripted device.
pub struct MockPlatform {
    state: Mutex<MockState>,
    handler: Mutex<Option<Arc<dyn BleEventHandler>>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                powered_on: true,
                device: None,
                rssi: -50,
                decoys: Vec::new(),
                connected: false,
                discovered: Vec::new(),
                notifying: HashSet::new(),
                writes: Vec::new(),
                connects: 0,
                mtu: MOCK_MTU,
                fail_writes: false,
                silent_connect: false,
            }),
            handler: Mutex::new(None),
        }
    }

    pub fn with_device(device: impl MockDevice + 'static) -> Self {
        let platform = Self::new();
        platform.state().device = Some(Box::new(device));
        platform
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver an event to the attached handler on this thread.
    pub fn emit(&self, event: BleEvent) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler.handle(event);
        }
    }

    pub fn set_powered_on(&self, on: bool) {
        self.state().powered_on = on;
    }

    pub fn set_mtu(&self, mtu: usize) {
        self.state().mtu = mtu;
    }

    pub fn set_device_rssi(&self, rssi: i16) {
        self.state().rssi = rssi;
    }

    /// Another advertiser that refuses connections.
    pub fn add_decoy(&self, peripheral: Peripheral, rssi: i16) {
        self.state().decoys.push((peripheral, rssi));
    }

    /// Make every subsequent write fail at the platform level.
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Swallow the next connect outcomes (to exercise timeouts).
    pub fn silent_connect(&self, silent: bool) {
        self.state().silent_connect = silent;
    }

    /// Drop the link from the device side.
    pub fn drop_link(&self, error: Option<&str>) {
        {
            let mut st = self.state();
            if !st.connected {
                return;
            }
            st.connected = false;
            st.notifying.clear();
            if let Some(device) = st.device.as_mut() {
                device.on_disconnect();
            }
        }
        self.emit(BleEvent::Disconnected {
            error: error.map(str::to_string),
        });
    }

    pub fn writes(&self) -> Vec<MockWrite> {
        self.state().writes.clone()
    }

    /// Concatenation of every packet written to `characteristic`.
    pub fn bytes_written_to(&self, characteristic: Uuid) -> Vec<u8> {
        self.state()
            .writes
            .iter()
            .filter(|w| w.characteristic == characteristic)
            .flat_map(|w| w.data.iter().copied())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn is_notifying(&self, characteristic: Uuid) -> bool {
        self.state().notifying.contains(&characteristic)
    }

    fn device_peripheral(st: &MockState) -> Option<Peripheral> {
        st.device
            .as_ref()
            .map(|d| Peripheral::new(MOCK_DEVICE_ID, Some(d.name().as_str())))
    }

    fn find_characteristic(st: &MockState, uuid: Uuid) -> Option<Characteristic> {
        st.discovered
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == uuid)
            .cloned()
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl BlePlatform for MockPlatform {
    fn attach(&self, handler: Arc<dyn BleEventHandler>) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn is_powered_on(&self) -> bool {
        self.state().powered_on
    }

    fn start_scan(&self) -> Result<(), BleError> {
        let adverts = {
            let st = self.state();
            if !st.powered_on {
                return Err(BleError::Other("scan: Bluetooth is off".into()));
            }
            let mut adverts = st.decoys.clone();
            if let Some(p) = Self::device_peripheral(&st) {
                adverts.push((p, st.rssi));
            }
            adverts
        };
        for (peripheral, rssi) in adverts {
            self.emit(BleEvent::DeviceDiscovered { peripheral, rssi });
        }
        Ok(())
    }

    fn stop_scan(&self) {}

    fn connect(&self, peripheral: &Peripheral) -> Result<(), BleError> {
        let event = {
            let mut st = self.state();
            if st.silent_connect {
                return Ok(());
            }
            if peripheral.id == MOCK_DEVICE_ID && st.device.is_some() {
                st.connected = true;
                st.connects += 1;
                st.discovered.clear();
                BleEvent::Connected
            } else {
                BleEvent::ConnectFailed {
                    reason: Some(format!("{} refused the connection", peripheral)),
                }
            }
        };
        self.emit(event);
        Ok(())
    }

    fn cancel_connection(&self, _peripheral: &Peripheral) -> Result<(), BleError> {
        self.drop_link(None);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn discover_services(&self) -> Result<(), BleError> {
        let services = {
            let mut st = self.state();
            if !st.connected {
                return Err(BleError::Other("discover: not connected".into()));
            }
            let services = st
                .device
                .as_ref()
                .map(|d| d.services())
                .unwrap_or_default();
            st.discovered = services.clone();
            services
        };
        self.emit(BleEvent::ServicesDiscovered {
            count: services.len(),
            error: None,
        });
        for service in &services {
            self.emit(BleEvent::CharacteristicsDiscovered {
                service: service.uuid,
                count: service.characteristics.len(),
                error: None,
            });
        }
        for chr in services.iter().flat_map(|s| s.characteristics.iter()) {
            self.emit(BleEvent::DescriptorsDiscovered {
                characteristic: chr.uuid,
                error: None,
            });
        }
        Ok(())
    }

    fn services(&self) -> Vec<Service> {
        self.state().discovered.clone()
    }

    fn set_notify(&self, characteristic: &Characteristic, enabled: bool) -> Result<(), BleError> {
        let error = {
            let mut st = self.state();
            if !st.connected {
                return Err(BleError::Other("setNotify: not connected".into()));
            }
            match Self::find_characteristic(&st, characteristic.uuid) {
                Some(c) if c.properties.notify || c.properties.indicate => {
                    if enabled {
                        st.notifying.insert(c.uuid);
                    } else {
                        st.notifying.remove(&c.uuid);
                    }
                    None
                }
                Some(_) => Some("characteristic does not notify".to_string()),
                None => Some("unknown characteristic".to_string()),
            }
        };
        self.emit(BleEvent::NotificationStateChanged {
            characteristic: characteristic.uuid,
            enabled,
            error,
        });
        Ok(())
    }

    fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError> {
        let reactions = {
            let mut st = self.state();
            if !st.connected {
                return Err(BleError::Other("write: not connected".into()));
            }
            if st.fail_writes {
                drop(st);
                self.emit(BleEvent::WriteCompleted {
                    characteristic: characteristic.uuid,
                    error: Some("simulated write failure".into()),
                });
                return Ok(());
            }
            st.writes.push(MockWrite {
                characteristic: characteristic.uuid,
                data: data.to_vec(),
                kind,
            });
            match st.device.as_mut() {
                Some(device) => device.on_write(characteristic.uuid, data),
                None => Vec::new(),
            }
        };

        for reaction in reactions {
            match reaction {
                MockReaction::Notify {
                    characteristic,
                    value,
                } => {
                    if self.is_notifying(characteristic) {
                        self.emit(BleEvent::ValueUpdated {
                            characteristic,
                            value,
                        });
                    }
                }
                MockReaction::Disconnect => {
                    self.drop_link(None);
                    return Ok(());
                }
            }
        }

        match kind {
            WriteKind::WithResponse => self.emit(BleEvent::WriteCompleted {
                characteristic: characteristic.uuid,
                error: None,
            }),
            WriteKind::WithoutResponse => self.emit(BleEvent::ReadyToSendWithoutResponse),
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.state().mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{BlockingBle, BufferKind, CharProperties};
    use crate::config::SessionConfig;
    use crate::events::Logger;
    use std::ops::ControlFlow;
    use std::time::Duration;

    const SVC: Uuid = Uuid::from_u128(0x1000);
    const TX: Uuid = Uuid::from_u128(0x1001);
    const RX: Uuid = Uuid::from_u128(0x1002);

    /// Echoes every write back as a notification on TX.
    struct Echo;

    impl MockDevice for Echo {
        fn name(&self) -> String {
            "Echo".into()
        }

        fn services(&self) -> Vec<Service> {
            vec![Service {
                uuid: SVC,
                characteristics: vec![
                    Characteristic {
                        service: SVC,
                        uuid: TX,
                        properties: CharProperties {
                            notify: true,
                            ..Default::default()
                        },
                    },
                    Characteristic {
                        service: SVC,
                        uuid: RX,
                        properties: CharProperties {
                            write: true,
                            write_without_response: true,
                            ..Default::default()
                        },
                    },
                ],
            }]
        }

        fn on_write(&mut self, _characteristic: Uuid, data: &[u8]) -> Vec<MockReaction> {
            if data == b"bye" {
                return vec![MockReaction::Disconnect];
            }
            vec![MockReaction::Notify {
                characteristic: TX,
                value: data.to_vec(),
            }]
        }
    }

    fn quick_config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.timeouts.scan_ms = 50;
        config.timeouts.connect_ms = 50;
        config.timeouts.write_without_response_ms = 20;
        config
    }

    fn connected() -> (Arc<MockPlatform>, BlockingBle<MockPlatform>) {
        let platform = Arc::new(MockPlatform::with_device(Echo));
        let ble = BlockingBle::new(platform.clone(), Logger::null(), &quick_config());
        ble.wait_powered_on().unwrap();
        ble.connect_by_name("Echo", Duration::from_millis(50)).unwrap();
        ble.discover_services().unwrap();
        (platform, ble)
    }

    fn rx() -> Characteristic {
        Echo.services()[0].characteristics[1].clone()
    }

    fn tx() -> Characteristic {
        Echo.services()[0].characteristics[0].clone()
    }

    #[test]
    fn test_connect_discover_and_query() {
        let (platform, ble) = connected();
        assert!(ble.is_connected());
        assert_eq!(platform.connect_count(), 1);
        assert_eq!(ble.services(None).unwrap().len(), 1);
        assert!(ble.services(Some(Uuid::nil())).unwrap().is_empty());
        assert_eq!(ble.find_characteristic(SVC, RX).unwrap(), Some(rx()));
        assert_eq!(ble.find_characteristic(SVC, Uuid::nil()).unwrap(), None);
    }

    #[test]
    fn test_write_is_chunked_to_segment_size() {
        let (platform, ble) = connected();
        platform.set_mtu(23);
        ble.enable_notification(&tx(), BufferKind::Stream).unwrap();

        let data: Vec<u8> = (0..50u8).collect();
        let mut seen = Vec::new();
        let mut progress = |p: u8| {
            seen.push(p);
            ControlFlow::Continue(())
        };
        let n = ble
            .write_without_response(&rx(), &data, Some(&mut progress))
            .unwrap();
        assert_eq!(n, 50);
        let sizes: Vec<usize> = platform.writes().iter().map(|w| w.data.len()).collect();
        assert_eq!(sizes, vec![20, 20, 10]);
        assert_eq!(seen, vec![40, 80, 100]);

        let echoed = ble
            .read_notification(&TX, 50, Duration::from_millis(50))
            .unwrap();
        assert_eq!(echoed, data);
    }

    #[test]
    fn test_disabled_notification_stops_delivery() {
        let (platform, ble) = connected();
        ble.enable_notification(&tx(), BufferKind::Stream).unwrap();
        assert!(platform.is_notifying(TX));
        ble.disable_notification(&tx()).unwrap();
        assert!(!platform.is_notifying(TX));

        ble.write_without_response(&rx(), &[7, 8, 9], None).unwrap();
        assert_eq!(platform.bytes_written_to(RX), vec![7, 8, 9]);
        assert!(platform.bytes_written_to(TX).is_empty());
    }

    #[test]
    fn test_mtu_larger_than_packet_cap_is_clamped() {
        let (platform, ble) = connected();
        platform.set_mtu(517);
        assert_eq!(ble.segment_size(), crate::config::PACKET_MAX_SIZE);
    }

    #[test]
    fn test_write_stops_when_progress_breaks() {
        let (platform, ble) = connected();
        platform.set_mtu(23);
        let mut stop = |_p: u8| ControlFlow::Break(());
        let n = ble
            .write_with_response(&rx(), &[0u8; 60], Some(&mut stop))
            .unwrap();
        assert_eq!(n, 20);
        assert_eq!(platform.writes().len(), 1);
    }

    #[test]
    fn test_failed_write_is_an_error() {
        let (platform, ble) = connected();
        platform.fail_writes(true);
        let err = ble.write_with_response(&rx(), &[1, 2, 3], None).unwrap_err();
        assert!(matches!(err, BleError::Other(_)));
    }

    #[test]
    fn test_frame_buffer_and_kind_mismatch() {
        let (_platform, ble) = connected();
        ble.enable_notification(&tx(), BufferKind::Frame).unwrap();
        ble.write_without_response(&rx(), &[1, 2], None).unwrap();
        ble.write_without_response(&rx(), &[3], None).unwrap();
        let t = Duration::from_millis(20);
        assert_eq!(ble.read_notification_frame(&TX, t).unwrap(), vec![1, 2]);
        assert_eq!(ble.read_notification_frame(&TX, t).unwrap(), vec![3]);
        assert!(matches!(
            ble.read_notification_frame(&TX, t),
            Err(BleError::Timeout { .. })
        ));
        assert!(matches!(
            ble.read_notification(&TX, 1, t),
            Err(BleError::Other(_))
        ));
    }

    #[test]
    fn test_peer_disconnect_surfaces_to_reader() {
        let (platform, ble) = connected();
        ble.enable_notification(&tx(), BufferKind::Stream).unwrap();
        // The drop lands while the write is waiting for its ready signal.
        assert!(matches!(
            ble.write_without_response(&rx(), b"bye", None),
            Err(BleError::Disconnected { .. })
        ));
        assert!(!platform.is_connected());
        let err = ble
            .read_notification(&TX, 4, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, BleError::Disconnected { .. }));
        assert!(matches!(
            ble.write_with_response(&rx(), &[1], None),
            Err(BleError::Disconnected { .. })
        ));
    }

    #[test]
    fn test_disconnect_releases_buffers() {
        let (platform, ble) = connected();
        ble.enable_notification(&tx(), BufferKind::Stream).unwrap();
        ble.write_without_response(&rx(), &[9, 9], None).unwrap();
        ble.disconnect().unwrap();
        assert!(!platform.is_connected());
        assert!(matches!(
            ble.read_notification(&TX, 2, Duration::from_millis(10)),
            Err(BleError::Disconnected { .. })
        ));
        // A second disconnect is a no-op.
        ble.disconnect().unwrap();
    }

    #[test]
    fn test_scan_best_prefers_strongest() {
        let platform = Arc::new(MockPlatform::with_device(Echo));
        platform.set_device_rssi(-70);
        platform.add_decoy(Peripheral::new("decoy-1", Some("Echo")), -40);
        platform.add_decoy(Peripheral::new("decoy-2", Some("Other")), -10);
        let ble = BlockingBle::new(platform.clone(), Logger::null(), &quick_config());

        let filter: Arc<crate::ble::ScanFilter> =
            Arc::new(|p: &Peripheral, _| p.name.as_deref() == Some("Echo"));
        let best = ble
            .scan_best(filter.clone(), Duration::from_millis(20))
            .unwrap()
            .unwrap();
        assert_eq!(best.id, "decoy-1");

        let first = ble.scan(filter, Duration::from_millis(20)).unwrap().unwrap();
        assert_eq!(first.id, "decoy-1");

        let nothing: Arc<crate::ble::ScanFilter> = Arc::new(|_: &Peripheral, _| false);
        assert_eq!(ble.scan(nothing, Duration::from_millis(20)).unwrap(), None);
    }

    #[test]
    fn test_connect_refused_and_timeout() {
        let platform = Arc::new(MockPlatform::with_device(Echo));
        let ble = BlockingBle::new(platform.clone(), Logger::null(), &quick_config());
        let err = ble
            .connect(&Peripheral::new("nobody", None))
            .unwrap_err();
        assert!(matches!(err, BleError::Other(_)));

        platform.silent_connect(true);
        let err = ble
            .connect(&Peripheral::new(MOCK_DEVICE_ID, Some("Echo")))
            .unwrap_err();
        assert!(matches!(err, BleError::Timeout { .. }));
    }

    #[test]
    fn test_power_off_fails_fast() {
        let platform = Arc::new(MockPlatform::with_device(Echo));
        platform.set_powered_on(false);
        let mut config = quick_config();
        config.timeouts.power_on_ms = 20;
        let ble = BlockingBle::new(platform.clone(), Logger::null(), &config);
        assert!(matches!(
            ble.wait_powered_on(),
            Err(BleError::Timeout { .. })
        ));
        platform.emit(BleEvent::PowerStateChanged { powered_on: true });
        platform.set_powered_on(true);
        ble.wait_powered_on().unwrap();
    }
}
