//! Blocking facade over a callback-driven BLE platform.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::BleError;
use super::buffer::{BufferKind, NotificationBuffer, ReadError};
use super::platform::{
    BleEvent, BleEventHandler, BlePlatform, Characteristic, Peripheral, Service, WriteKind,
};
use super::rendezvous::{Rendezvous, ResultCode, Signal, SignalData};
use crate::codec::to_hex;
use crate::config::{BleTimeouts, SessionConfig};
use crate::events::Logger;
use crate::listener::percent_of;

const TAG: &str = "BlockingBLE";
/// ATT header bytes subtracted from the MTU.
const ATT_HEADER: usize = 3;

/// Decides whether an advertising device is the one wanted.
pub type ScanFilter = dyn Fn(&Peripheral, i16) -> bool + Send + Sync;

/// Called with the percent written after each chunk; `Break` stops the write.
pub type WriteProgress<'a> = &'a mut dyn FnMut(u8) -> ControlFlow<()>;

struct ScanSession {
    filter: Arc<ScanFilter>,
    matches: Vec<(Peripheral, i16)>,
}

#[derive(Default)]
struct Discovery {
    services_total: usize,
    services_done: usize,
    chars_total: usize,
    chars_done: usize,
}

impl Discovery {
    fn complete(&self) -> bool {
        self.services_total > 0
            && self.services_done >= self.services_total
            && self.chars_done >= self.chars_total
    }
}

#[derive(Default)]
struct LinkState {
    buffers: HashMap<Uuid, Arc<NotificationBuffer>>,
    scan: Option<ScanSession>,
    discovery: Discovery,
}

/// State reachable from the platform's event thread.
struct Shared {
    rendezvous: Rendezvous,
    link: Mutex<LinkState>,
    logger: Logger,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn buffer(&self, characteristic: &Uuid) -> Option<Arc<NotificationBuffer>> {
        self.link().buffers.get(characteristic).cloned()
    }

    fn release_buffers(&self) {
        let drained: Vec<_> = self.link().buffers.drain().map(|(_, b)| b).collect();
        for buffer in drained {
            buffer.release();
        }
    }

    fn close_buffers(&self) {
        let buffers: Vec<_> = self.link().buffers.values().cloned().collect();
        for buffer in buffers {
            buffer.close();
        }
    }

    fn discovery_failed(&self, stage: &str, error: String) {
        self.logger.error(TAG, format!("{}: {}", stage, error));
        self.rendezvous.post(Signal::failed(
            ResultCode::ServicesDiscovered,
            Some(error),
        ));
    }
}

impl BleEventHandler for Shared {
    fn handle(&self, event: BleEvent) {
        match event {
            BleEvent::PowerStateChanged { powered_on } => {
                self.logger
                    .info(TAG, format!("power state changed: on={}", powered_on));
                self.rendezvous.post(Signal {
                    code: ResultCode::PoweredOn,
                    success: powered_on,
                    data: SignalData::None,
                });
            }
            BleEvent::DeviceDiscovered { peripheral, rssi } => {
                self.logger
                    .verbose(TAG, format!("discovered {} rssi={}", peripheral, rssi));
                let matched = {
                    let mut link = self.link();
                    match link.scan.as_mut() {
                        Some(scan) if (scan.filter)(&peripheral, rssi) => {
                            scan.matches.push((peripheral.clone(), rssi));
                            true
                        }
                        _ => false,
                    }
                };
                if matched {
                    self.rendezvous.post(Signal {
                        code: ResultCode::DeviceDiscovered,
                        success: true,
                        data: SignalData::Peripheral(peripheral),
                    });
                }
            }
            BleEvent::Connected => {
                self.logger.info(TAG, "connected");
                self.rendezvous.post(Signal::ok(ResultCode::Connected));
            }
            BleEvent::ConnectFailed { reason } => {
                self.logger.info(
                    TAG,
                    format!("connect failed: {}", reason.as_deref().unwrap_or("unknown")),
                );
                self.rendezvous
                    .post(Signal::failed(ResultCode::Connected, reason));
            }
            BleEvent::Disconnected { error } => {
                match &error {
                    None => self.logger.info(TAG, "disconnected"),
                    Some(e) => self.logger.error(TAG, format!("disconnected: {}", e)),
                }
                self.close_buffers();
                self.rendezvous
                    .post(Signal::from_error(ResultCode::Disconnected, error));
            }
            BleEvent::ServicesDiscovered { count, error } => {
                if let Some(e) = error {
                    self.discovery_failed("services", e);
                    return;
                }
                if count == 0 {
                    self.rendezvous
                        .post(Signal::ok(ResultCode::ServicesDiscovered));
                    return;
                }
                let mut link = self.link();
                link.discovery = Discovery {
                    services_total: count,
                    ..Discovery::default()
                };
            }
            BleEvent::CharacteristicsDiscovered {
                service,
                count,
                error,
            } => {
                if let Some(e) = error {
                    self.discovery_failed(&format!("characteristics of {}", service), e);
                    return;
                }
                let complete = {
                    let mut link = self.link();
                    link.discovery.services_done += 1;
                    link.discovery.chars_total += count;
                    link.discovery.complete()
                };
                if complete {
                    self.rendezvous
                        .post(Signal::ok(ResultCode::ServicesDiscovered));
                }
            }
            BleEvent::DescriptorsDiscovered {
                characteristic,
                error,
            } => {
                if let Some(e) = error {
                    self.discovery_failed(&format!("descriptors of {}", characteristic), e);
                    return;
                }
                let complete = {
                    let mut link = self.link();
                    link.discovery.chars_done += 1;
                    link.discovery.complete()
                };
                if complete {
                    self.rendezvous
                        .post(Signal::ok(ResultCode::ServicesDiscovered));
                }
            }
            BleEvent::NotificationStateChanged {
                characteristic,
                enabled,
                error,
            } => {
                match &error {
                    None => self.logger.info(
                        TAG,
                        format!("notification state of {}: {}", characteristic, enabled),
                    ),
                    Some(e) => self
                        .logger
                        .error(TAG, format!("notification state of {}: {}", characteristic, e)),
                }
                self.rendezvous
                    .post(Signal::from_error(ResultCode::NotifyStateChanged, error));
            }
            BleEvent::ValueUpdated {
                characteristic,
                value,
            } => {
                trace!(%characteristic, len = value.len(), data = %to_hex(&value), "notification");
                match self.buffer(&characteristic) {
                    Some(buffer) => {
                        if !buffer.push(&value) {
                            self.logger.warning(
                                TAG,
                                format!(
                                    "{} byte notification dropped, buffer full or closed",
                                    value.len()
                                ),
                            );
                        }
                    }
                    None => debug!(%characteristic, "notification without buffer ignored"),
                }
            }
            BleEvent::WriteCompleted {
                characteristic,
                error,
            } => {
                if let Some(e) = &error {
                    self.logger
                        .error(TAG, format!("write to {} failed: {}", characteristic, e));
                }
                self.rendezvous
                    .post(Signal::from_error(ResultCode::WriteCompleted, error));
            }
            BleEvent::ReadyToSendWithoutResponse => {
                self.rendezvous.post(Signal::ok(ResultCode::WriteCompleted));
            }
        }
    }
}

/// Blocking, timeout-bounded BLE central operations.
///
/// One caller thread drives an instance at a time; the platform's event
/// thread only posts into it.
pub struct BlockingBle<P: BlePlatform> {
    platform: Arc<P>,
    shared: Arc<Shared>,
    target: Mutex<Option<Peripheral>>,
    timeouts: BleTimeouts,
    packet_limit: usize,
    logger: Logger,
}

impl<P: BlePlatform> BlockingBle<P> {
    /// Wrap `platform` and install this facade as its event handler.
    pub fn new(platform: Arc<P>, logger: Logger, config: &SessionConfig) -> Self {
        let shared = Arc::new(Shared {
            rendezvous: Rendezvous::new(),
            link: Mutex::new(LinkState::default()),
            logger: logger.clone(),
        });
        platform.attach(shared.clone());
        Self {
            platform,
            shared,
            target: Mutex::new(None),
            timeouts: config.timeouts.clone(),
            packet_limit: config.packet_limit(),
            logger,
        }
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn timeouts(&self) -> &BleTimeouts {
        &self.timeouts
    }

    pub fn target(&self) -> Option<Peripheral> {
        self.target
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_target(&self, peripheral: Option<Peripheral>) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = peripheral;
    }

    fn ensure_connected(&self, op: &str) -> Result<(), BleError> {
        if self.platform.is_connected() {
            Ok(())
        } else {
            Err(BleError::Disconnected {
                waiter: format!("{}: device not connected", op),
            })
        }
    }

    pub fn wait_powered_on(&self) -> Result<(), BleError> {
        if self.platform.is_powered_on() {
            return Ok(());
        }
        let pending = self
            .shared
            .rendezvous
            .arm(&[ResultCode::PoweredOn], "waitPoweredOn");
        if self.platform.is_powered_on() {
            return Ok(());
        }
        let signal = pending.wait(self.timeouts.power_on())?;
        if signal.success {
            Ok(())
        } else {
            Err(BleError::Other("waitPoweredOn: Bluetooth is off".into()))
        }
    }

    fn begin_scan(&self, filter: Arc<ScanFilter>) {
        self.shared.link().scan = Some(ScanSession {
            filter,
            matches: Vec::new(),
        });
    }

    fn end_scan(&self) -> Vec<(Peripheral, i16)> {
        self.platform.stop_scan();
        self.shared
            .link()
            .scan
            .take()
            .map(|s| s.matches)
            .unwrap_or_default()
    }

    /// First device accepted by `filter` within `timeout`.
    #[instrument(skip(self, filter))]
    pub fn scan(
        &self,
        filter: Arc<ScanFilter>,
        timeout: Duration,
    ) -> Result<Option<Peripheral>, BleError> {
        self.begin_scan(filter);
        let pending = self
            .shared
            .rendezvous
            .arm(&[ResultCode::DeviceDiscovered], "scan");
        let outcome = self
            .platform
            .start_scan()
            .and_then(|()| pending.wait(timeout));
        self.end_scan();
        match outcome {
            Ok(Signal {
                data: SignalData::Peripheral(p),
                ..
            }) => {
                self.logger.debug(TAG, format!("scan matched {}", p));
                Ok(Some(p))
            }
            Ok(_) | Err(BleError::Timeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Scan for the whole window and return the strongest accepted device.
    #[instrument(skip(self, filter))]
    pub fn scan_best(
        &self,
        filter: Arc<ScanFilter>,
        timeout: Duration,
    ) -> Result<Option<Peripheral>, BleError> {
        self.begin_scan(filter);
        let pending = self.shared.rendezvous.arm(&[ResultCode::Timeout], "scanBest");
        let outcome = self
            .platform
            .start_scan()
            .and_then(|()| pending.wait(timeout));
        let matches = self.end_scan();
        outcome?;

        let mut best: Option<(Peripheral, i16)> = None;
        for (p, rssi) in matches {
            match &best {
                Some((_, best_rssi)) if rssi <= *best_rssi => {}
                _ => best = Some((p, rssi)),
            }
        }
        Ok(best.map(|(p, _)| p))
    }

    #[instrument(skip_all, fields(peripheral = %peripheral))]
    pub fn connect(&self, peripheral: &Peripheral) -> Result<(), BleError> {
        self.set_target(Some(peripheral.clone()));
        let pending = self
            .shared
            .rendezvous
            .arm(&[ResultCode::Connected], "connect");
        self.platform.connect(peripheral)?;
        match pending.wait(self.timeouts.connect()) {
            Ok(signal) if signal.success => {
                self.logger.info(TAG, format!("connected to {}", peripheral));
                Ok(())
            }
            Ok(signal) => Err(BleError::Other(format!(
                "connect: connecting {} failed{}",
                peripheral,
                signal
                    .error_message()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ))),
            Err(e @ BleError::Timeout { .. }) => {
                if let Err(cancel) = self.platform.cancel_connection(peripheral) {
                    warn!(error = %cancel, "failed to abort pending connection");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn connect_by_filter(
        &self,
        filter: Arc<ScanFilter>,
        timeout: Duration,
    ) -> Result<Peripheral, BleError> {
        let peripheral = self
            .scan(filter, timeout)?
            .ok_or_else(|| BleError::Other("connect: failed to scan device".into()))?;
        self.connect(&peripheral)?;
        Ok(peripheral)
    }

    pub fn connect_by_name(&self, name: &str, timeout: Duration) -> Result<Peripheral, BleError> {
        let wanted = name.to_string();
        let filter: Arc<ScanFilter> =
            Arc::new(move |p: &Peripheral, _rssi| p.name.as_deref() == Some(wanted.as_str()));
        self.connect_by_filter(filter, timeout)
    }

    pub fn is_connected(&self) -> bool {
        self.platform.is_connected()
    }

    /// Drop the link and release every notification buffer.
    #[instrument(skip(self))]
    pub fn disconnect(&self) -> Result<(), BleError> {
        let result = self.disconnect_link();
        self.shared.release_buffers();
        result
    }

    fn disconnect_link(&self) -> Result<(), BleError> {
        let Some(peripheral) = self.target() else {
            return Ok(());
        };
        if !self.platform.is_connected() {
            return Ok(());
        }
        let pending = self
            .shared
            .rendezvous
            .arm(&[ResultCode::Disconnected], "disconnect");
        self.platform.cancel_connection(&peripheral)?;
        let signal = pending.wait(self.timeouts.disconnect())?;
        if !signal.success {
            return Err(BleError::Other("disconnect: disconnect failed".into()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn discover_services(&self) -> Result<(), BleError> {
        self.ensure_connected("discoverServices")?;
        self.shared.link().discovery = Discovery::default();
        let pending = self
            .shared
            .rendezvous
            .arm(&[ResultCode::ServicesDiscovered], "discoverServices");
        self.platform.discover_services()?;
        let signal = pending.wait(self.timeouts.discover())?;
        if !signal.success {
            return Err(BleError::Other(format!(
                "discoverServices: service discovery failure{}",
                signal
                    .error_message()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            )));
        }
        self.logger.info(TAG, "found services:");
        for service in self.platform.services() {
            self.logger.info(TAG, format!("    s:{}", service.uuid));
            for chr in &service.characteristics {
                self.logger.info(TAG, format!("        c:{}", chr.uuid));
            }
        }
        Ok(())
    }

    /// Discovered services, optionally only those matching `uuid`.
    pub fn services(&self, uuid: Option<Uuid>) -> Result<Vec<Service>, BleError> {
        self.ensure_connected("services")?;
        Ok(self
            .platform
            .services()
            .into_iter()
            .filter(|s| uuid.is_none_or(|u| s.uuid == u))
            .collect())
    }

    pub fn find_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<Characteristic>, BleError> {
        Ok(self
            .services(Some(service))?
            .into_iter()
            .flat_map(|s| s.characteristics)
            .find(|c| c.uuid == characteristic))
    }

    /// Subscribe and route notifications into a buffer of `kind`.
    #[instrument(skip_all, fields(characteristic = %characteristic.uuid))]
    pub fn enable_notification(
        &self,
        characteristic: &Characteristic,
        kind: BufferKind,
    ) -> Result<(), BleError> {
        self.ensure_connected("enableNotification")?;
        {
            let mut link = self.shared.link();
            let keep = link
                .buffers
                .get(&characteristic.uuid)
                .is_some_and(|b| b.kind() == kind);
            if !keep {
                link.buffers
                    .insert(characteristic.uuid, Arc::new(NotificationBuffer::new(kind)));
            }
        }
        let pending = self
            .shared
            .rendezvous
            .arm(&[ResultCode::NotifyStateChanged], "enableNotification");
        let outcome = self
            .platform
            .set_notify(characteristic, true)
            .and_then(|()| pending.wait(self.timeouts.notify()));
        match outcome {
            Ok(signal) if signal.success => Ok(()),
            Ok(_) => {
                self.shared.link().buffers.remove(&characteristic.uuid);
                Err(BleError::Other(
                    "enableNotification: failed to open notify".into(),
                ))
            }
            Err(e) => {
                self.shared.link().buffers.remove(&characteristic.uuid);
                Err(e)
            }
        }
    }

    pub fn disable_notification(&self, characteristic: &Characteristic) -> Result<(), BleError> {
        self.ensure_connected("disableNotification")?;
        let pending = self
            .shared
            .rendezvous
            .arm(&[ResultCode::NotifyStateChanged], "disableNotification");
        self.platform.set_notify(characteristic, false)?;
        let signal = pending.wait(self.timeouts.notify())?;
        if !signal.success {
            return Err(BleError::Other(
                "disableNotification: failed to close notify".into(),
            ));
        }
        Ok(())
    }

    /// Largest single write on the current link.
    pub fn segment_size(&self) -> usize {
        self.platform
            .mtu()
            .saturating_sub(ATT_HEADER)
            .clamp(1, self.packet_limit)
    }

    pub fn write_without_response(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        progress: Option<WriteProgress<'_>>,
    ) -> Result<usize, BleError> {
        self.write(characteristic, data, WriteKind::WithoutResponse, progress)
    }

    pub fn write_with_response(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        progress: Option<WriteProgress<'_>>,
    ) -> Result<usize, BleError> {
        self.write(characteristic, data, WriteKind::WithResponse, progress)
    }

    /// Chunked write. Returns bytes written, short only when `progress`
    /// asked to stop.
    pub fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        kind: WriteKind,
        mut progress: Option<WriteProgress<'_>>,
    ) -> Result<usize, BleError> {
        self.ensure_connected("writeCharacteristic")?;
        let segment = self.segment_size();
        let total = data.len();
        let mut written = 0usize;

        for frame in data.chunks(segment) {
            match kind {
                WriteKind::WithResponse => {
                    let pending = self
                        .shared
                        .rendezvous
                        .arm(&[ResultCode::WriteCompleted], "writeWithResponse");
                    self.platform.write(characteristic, frame, kind)?;
                    let signal = pending.wait(self.timeouts.write_with_response())?;
                    if !signal.success {
                        return Err(BleError::Other(
                            "writeCharacteristic: writing characteristic failed".into(),
                        ));
                    }
                }
                WriteKind::WithoutResponse => {
                    let pending = self.shared.rendezvous.arm(
                        &[ResultCode::WriteCompleted, ResultCode::Timeout],
                        "writeWithoutResponse",
                    );
                    self.platform.write(characteristic, frame, kind)?;
                    let signal = pending.wait(self.timeouts.write_without_response())?;
                    if signal.code == ResultCode::WriteCompleted && !signal.success {
                        return Err(BleError::Other(
                            "writeCharacteristic: writing characteristic failed".into(),
                        ));
                    }
                    if signal.code == ResultCode::Timeout {
                        trace!(len = frame.len(), "no ready signal, continuing");
                    }
                }
            }
            trace!(
                characteristic = %characteristic.uuid,
                len = frame.len(),
                data = %to_hex(frame),
                "write"
            );
            written += frame.len();
            if let Some(cb) = progress.as_mut() {
                if cb(percent_of(written, total)).is_break() {
                    debug!(written, total, "write stopped by caller");
                    return Ok(written);
                }
            }
        }
        Ok(written)
    }

    fn read_error(&self, error: ReadError, waiter: &str) -> BleError {
        match error {
            ReadError::Timeout => BleError::Timeout {
                waiter: waiter.to_string(),
            },
            ReadError::Closed => BleError::Disconnected {
                waiter: waiter.to_string(),
            },
            ReadError::WrongKind => BleError::Other(format!("{}: buffer type mismatch", waiter)),
            ReadError::Overflow => {
                BleError::Other(format!("{}: notification buffer overflowed", waiter))
            }
        }
    }

    fn notification_buffer(
        &self,
        characteristic: &Uuid,
        waiter: &str,
    ) -> Result<Arc<NotificationBuffer>, BleError> {
        match self.shared.buffer(characteristic) {
            Some(buffer) => Ok(buffer),
            None if !self.platform.is_connected() => Err(BleError::Disconnected {
                waiter: waiter.to_string(),
            }),
            None => Err(BleError::Other(format!(
                "{}: notifications not enabled on {}",
                waiter, characteristic
            ))),
        }
    }

    /// Exactly `count` bytes from a stream-buffered characteristic.
    pub fn read_notification(
        &self,
        characteristic: &Uuid,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, BleError> {
        const WAITER: &str = "readNotification";
        let buffer = self.notification_buffer(characteristic, WAITER)?;
        buffer
            .read_exact(count, timeout)
            .map_err(|e| self.read_error(e, WAITER))
    }

    /// Next whole notification from a frame-buffered characteristic.
    pub fn read_notification_frame(
        &self,
        characteristic: &Uuid,
        timeout: Duration,
    ) -> Result<Vec<u8>, BleError> {
        const WAITER: &str = "readNotificationFrame";
        let buffer = self.notification_buffer(characteristic, WAITER)?;
        buffer
            .read_frame(timeout)
            .map_err(|e| self.read_error(e, WAITER))
    }
}
