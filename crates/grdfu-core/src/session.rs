//! DFU session: high-level orchestrator for one update.
//!
//! Each `start_*` call spawns a worker thread that connects, discovers,
//! binds the selected engine, runs it and disconnects. Failures never escape
//! the worker as panics or unreported errors: they are turned into one
//! `on_error` callback after a best-effort disconnect.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, instrument, warn};

use crate::ble::{BlePlatform, BlockingBle, Peripheral, ScanFilter};
use crate::config::SessionConfig;
use crate::error::{DfuError, Result};
use crate::events::{LogLevel, LogSink, Logger, MemorySink, TeeSink, TracingSink};
use crate::fast::FastEngine;
use crate::listener::{
    CancelToken, DfuListener, Executor, InlineExecutor, Notifier, NullListener, ProgressReporter,
};
use crate::standard::{StandardEngine, enter_dfu_boot};
use crate::state::{Outcome, UpdateMode, UpdateRequest};

const TAG: &str = "DfuSession";
const WORKER_NAME: &str = "dfuThread";

/// Which protocol engine drives the update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineKind {
    #[default]
    Standard,
    Fast,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Standard => write!(f, "standard"),
            EngineKind::Fast => write!(f, "fast"),
        }
    }
}

/// Everything the worker thread needs, moved into it at start.
struct Job<P: BlePlatform> {
    platform: Arc<P>,
    config: SessionConfig,
    engine: EngineKind,
    reconnect: Option<Arc<ScanFilter>>,
    logger: Logger,
    notifier: Notifier,
    cancel: CancelToken,
    device: Peripheral,
    mode: UpdateMode,
    data: Vec<u8>,
    boot_entry: bool,
}

/// Update session bound to one BLE platform.
///
/// Settings (engine, fast mode, listener, ...) apply to the next `start_*`
/// call. One update runs at a time.
pub struct DfuSession<P: BlePlatform + 'static> {
    platform: Arc<P>,
    config: SessionConfig,
    engine: EngineKind,
    listener: Arc<dyn DfuListener>,
    executor: Arc<dyn Executor>,
    reconnect: Option<Arc<ScanFilter>>,
    log_level: LogLevel,
    memory: Arc<MemorySink>,
    cancel: CancelToken,
    worker: Option<JoinHandle<Result<Outcome>>>,
}

impl<P: BlePlatform + 'static> DfuSession<P> {
    pub fn new(platform: Arc<P>) -> Self {
        Self::with_config(platform, SessionConfig::default())
    }

    pub fn with_config(platform: Arc<P>, config: SessionConfig) -> Self {
        Self {
            platform,
            config,
            engine: EngineKind::default(),
            listener: Arc::new(NullListener),
            executor: Arc::new(InlineExecutor),
            reconnect: None,
            log_level: LogLevel::Info,
            memory: Arc::new(MemorySink::new()),
            cancel: CancelToken::new(),
            worker: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn DfuListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Context the listener callbacks run on. Defaults to the worker thread.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    /// Lowest level kept by the session log.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Filter used to find the device again after a mode switch or boot
    /// entry. Overrides `reconnect_name`.
    pub fn with_reconnect_filter(mut self, filter: Arc<ScanFilter>) -> Self {
        self.reconnect = Some(filter);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn set_engine(&mut self, engine: EngineKind) {
        self.engine = engine;
    }

    pub fn set_fast_mode(&mut self, fast: bool) {
        self.config.fast_mode = fast;
    }

    pub fn set_control_command(&mut self, command: Option<Vec<u8>>) {
        self.config.control_command = command;
    }

    /// Replace the running firmware.
    pub fn start_dfu(&mut self, device: Peripheral, firmware: Vec<u8>) -> Result<()> {
        self.start(device, UpdateMode::Firmware, firmware, false)
    }

    /// Stage the firmware at `copy_address`; the device copies it into place.
    pub fn start_dfu_in_copy_mode(
        &mut self,
        device: Peripheral,
        firmware: Vec<u8>,
        copy_address: u32,
    ) -> Result<()> {
        self.start(
            device,
            UpdateMode::CopyFirmware { copy_address },
            firmware,
            false,
        )
    }

    /// Write an opaque resource at `address`.
    pub fn start_resource_update(
        &mut self,
        device: Peripheral,
        data: Vec<u8>,
        external_flash: bool,
        address: u32,
    ) -> Result<()> {
        self.start(
            device,
            UpdateMode::Resource {
                address,
                external_flash,
            },
            data,
            false,
        )
    }

    /// Send the device into its DFU boot first, then replace the firmware.
    pub fn start_dfu_with_boot_entry(&mut self, device: Peripheral, firmware: Vec<u8>) -> Result<()> {
        self.start(device, UpdateMode::Firmware, firmware, true)
    }

    /// Ask the running update to stop after the current chunk.
    pub fn cancel(&self) {
        info!("cancel requested");
        self.cancel.cancel();
    }

    /// Token shared with the worker; cancelling it equals [`Self::cancel`].
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Wait for the current update to end.
    pub fn join(&mut self) -> Result<Outcome> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| DfuError::Config("no DFU session has been started".into()))?;
        worker
            .join()
            .unwrap_or_else(|_| Err(DfuError::Transport("DFU worker thread panicked".into())))
    }

    /// Lines logged since the last call; the log is cleared.
    pub fn take_log(&self) -> Vec<String> {
        self.memory.drain()
    }

    #[instrument(skip_all, fields(device = %device, engine = %self.engine, mode = %mode))]
    fn start(
        &mut self,
        device: Peripheral,
        mode: UpdateMode,
        data: Vec<u8>,
        boot_entry: bool,
    ) -> Result<()> {
        if self.is_running() {
            return Err(DfuError::Config("a DFU session is already running".into()));
        }
        self.worker = None;
        self.cancel.reset();

        let sinks: Vec<Arc<dyn LogSink>> = vec![Arc::new(TracingSink), self.memory.clone()];
        let logger = Logger::new(Arc::new(TeeSink(sinks))).with_filter(self.log_level);

        let job = Job {
            platform: self.platform.clone(),
            config: self.config.clone(),
            engine: self.engine,
            reconnect: self.reconnect.clone(),
            logger,
            notifier: Notifier::new(self.listener.clone(), self.executor.clone()),
            cancel: self.cancel.clone(),
            device,
            mode,
            data,
            boot_entry,
        };

        let handle = thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || job.run())
            .map_err(|e| DfuError::Transport(format!("failed to spawn DFU worker: {}", e)))?;
        self.worker = Some(handle);
        Ok(())
    }
}

impl<P: BlePlatform> Job<P> {
    /// Worker body: run the update and report how it ended.
    fn run(self) -> Result<Outcome> {
        let ble = BlockingBle::new(self.platform.clone(), self.logger.clone(), &self.config);
        let reporter = ProgressReporter::new(self.notifier.clone(), self.cancel.clone());

        self.notifier.start();
        let _ = reporter.report("start...", 0);

        let result = self.drive(&ble, &reporter);
        match &result {
            Ok(outcome) => {
                if let Err(e) = ble.disconnect() {
                    warn!(error = %e, "disconnect after update failed");
                }
                match outcome {
                    Outcome::Completed => {
                        info!("DFU completed");
                        self.notifier.complete();
                    }
                    Outcome::Cancelled { percent } => {
                        info!(percent, "DFU cancelled");
                        self.logger.info(TAG, format!("cancelled at {}%", percent));
                        self.notifier.cancelled(*percent);
                    }
                }
            }
            Err(e) => {
                if ble.is_connected() {
                    let _ = ble.disconnect();
                }
                error!(error = %e, "DFU failed");
                let message = e.to_string();
                self.logger.error(TAG, message.as_str());
                self.notifier.error(&message);
            }
        }
        result
    }

    fn drive(&self, ble: &BlockingBle<P>, reporter: &ProgressReporter) -> Result<Outcome> {
        // Host-side checks run before anything reaches the device.
        let request = UpdateRequest::new(self.mode, self.data.as_slice())?;

        ble.wait_powered_on()?;
        ble.connect(&self.device)?;
        ble.discover_services()?;

        if self.boot_entry {
            self.logger.info(TAG, "entering DFU boot");
            enter_dfu_boot(ble, &self.config, self.reconnect.as_ref())?;
        }

        match self.engine {
            EngineKind::Standard => {
                StandardEngine::bind(ble, &self.config, self.logger.clone(), reporter)?
                    .with_reconnect_filter(self.reconnect.clone())
                    .run(&request)
            }
            EngineKind::Fast => {
                FastEngine::bind(ble, &self.config, self.logger.clone(), reporter)?.run(&request)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::MockPlatform;
    use crate::ble::mock::MOCK_DEVICE_ID;
    use crate::codec::byte_sum;
    use crate::config::SettleDelays;
    use crate::image::ImageInfo;
    use crate::listener::tests::{Call, RecordingListener};
    use crate::protocol::*;
    use crate::sim::*;

    fn quick_config() -> SessionConfig {
        let mut config = SessionConfig {
            delays: SettleDelays::none(),
            ..Default::default()
        };
        config.timeouts.scan_ms = 200;
        config.timeouts.response_ms = 500;
        config.timeouts.fast_response_ms = 500;
        config
    }

    fn target() -> Peripheral {
        Peripheral::new(MOCK_DEVICE_ID, Some(SIM_DEVICE_NAME))
    }

    struct Harness {
        platform: Arc<MockPlatform>,
        session: DfuSession<MockPlatform>,
        listener: Arc<RecordingListener>,
    }

    fn harness(device: impl crate::ble::MockDevice + 'static, engine: EngineKind) -> Harness {
        let platform = Arc::new(MockPlatform::with_device(device));
        let listener = Arc::new(RecordingListener::default());
        let session = DfuSession::with_config(platform.clone(), quick_config())
            .with_engine(engine)
            .with_listener(listener.clone());
        Harness {
            platform,
            session,
            listener,
        }
    }

    fn progress_of(listener: &RecordingListener, message: &str) -> Vec<u8> {
        listener
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Progress(m, p) if m == message => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_legacy_firmware_update() {
        let device = StandardDevice::legacy();
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);
        let firmware = demo_firmware(SIM_APP_ADDR, 4096);

        h.session.start_dfu(target(), firmware.clone()).unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);

        let j = journal.snapshot();
        assert_eq!(
            j.commands,
            vec![
                CMD_GET_INFO,
                CMD_SYSTEM_CONFIG,
                CMD_SYSTEM_CONFIG,
                CMD_PROGRAM_START,
                CMD_PROGRAM_FLASH,
                CMD_PROGRAM_FLASH,
                CMD_PROGRAM_FLASH,
                CMD_PROGRAM_FLASH,
                CMD_PROGRAM_END,
            ]
        );
        let addresses: Vec<u32> = j.flash_writes.iter().map(|(a, _)| *a).collect();
        assert_eq!(
            addresses,
            vec![0x0104_0000, 0x0104_0400, 0x0104_0800, 0x0104_0C00]
        );
        assert_eq!(j.payload, firmware);
        assert_eq!(j.program_end, Some((END_FIRMWARE, byte_sum(&firmware))));
        assert!(j.table_writes.is_empty());

        assert_eq!(progress_of(&h.listener, "Downloading..."), vec![0, 25, 50, 75, 100]);
        let calls = h.listener.calls();
        assert_eq!(calls.first(), Some(&Call::Start));
        assert_eq!(calls.last(), Some(&Call::Complete));
        assert!(!h.platform.is_connected());
    }

    #[test]
    fn test_legacy_writes_control_command_first() {
        let device = StandardDevice::legacy();
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Fast);
        h.session.set_engine(EngineKind::Standard);
        h.session.set_control_command(Some(vec![0x01, 0x02]));

        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 2048))
            .unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);

        let j = journal.snapshot();
        assert_eq!(j.control_writes, vec![vec![0x01, 0x02]]);
        assert_eq!(j.commands.first(), Some(&CMD_GET_INFO));
    }

    #[test]
    fn test_legacy_reconciles_image_table() {
        let stale = ImageInfo::new(SIM_APP_ADDR + 0x800, 0x1000, 0x0AD0, "old");
        let other = ImageInfo::new(0x0106_0000, 0x1000, 0x0111, "other");
        let device = StandardDevice::legacy().with_image_table(vec![stale, other.clone()]);
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);

        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 4096))
            .unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);

        let j = journal.snapshot();
        assert_eq!(j.table_writes.len(), 1);
        let written = &j.table_writes[0];
        assert_eq!(written.len(), 2);
        assert_eq!(
            (written[0].load_addr, written[0].checksum),
            (other.load_addr, other.checksum)
        );
        assert_eq!(written[1].load_addr, SIM_BOOT_ADDR);
        assert!(
            h.session
                .take_log()
                .iter()
                .any(|line| line.contains("\"old\"") && line.contains("removed"))
        );
    }

    #[test]
    fn test_fast_bulk_update() {
        let device = FastDevice::new(3);
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Fast);
        let firmware = demo_firmware(SIM_APP_ADDR, 10_000);

        h.session.start_dfu(target(), firmware.clone()).unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);

        let j = journal.snapshot();
        let expected: Vec<u16> = [
            FAST_GET_VERSION,
            FAST_SELECT_FLASH,
            FAST_ERASE,
            FAST_FLUSH,
            FAST_CHECK_CHECKSUM,
            FAST_WRITE_BOOT,
        ]
        .into_iter()
        .map(u16::from)
        .collect();
        assert_eq!(j.commands, expected);
        assert_eq!(j.buffer_requests, 0);
        assert_eq!(j.erase, Some((SIM_APP_ADDR, 10_000)));
        assert_eq!(j.external_flash, Some(false));
        assert_eq!(j.payload, firmware);
        assert_eq!(j.boot_written.map(|i| i.load_addr), Some(SIM_APP_ADDR));
        assert_eq!(h.listener.calls().last(), Some(&Call::Complete));
    }

    #[test]
    fn test_fast_buffered_resource_update() {
        let device = FastDevice::new(2);
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Fast);
        let data = vec![0x5A; 3000];

        h.session
            .start_resource_update(target(), data.clone(), true, 0x0110_0000)
            .unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);

        let j = journal.snapshot();
        let position = |op: u8| j.commands.iter().position(|&c| c == u16::from(op));
        assert!(position(FAST_ERASE) < position(FAST_GET_BUFFER_SIZE));
        assert!(position(FAST_GET_BUFFER_SIZE).is_some());
        assert_eq!(j.buffer_requests, 3);
        assert_eq!(j.external_flash, Some(true));
        assert_eq!(j.payload, data);
        assert!(j.boot_written.is_none() && j.copy_started.is_none());
        assert_eq!(progress_of(&h.listener, "Downloading..."), vec![0, 34, 68, 100]);
    }

    #[test]
    fn test_fast_flow_control_pause_is_an_error() {
        let mut h = harness(FastDevice::new(2).pausing_flow(), EngineKind::Fast);
        h.session
            .start_resource_update(target(), vec![1u8; 2000], false, 0x0110_0000)
            .unwrap();
        let err = h.session.join().unwrap_err();
        assert_eq!(err.to_string(), "FlowCtrl = true, buffer overflowed.");
        assert_eq!(
            h.listener.calls().last(),
            Some(&Call::Error("FlowCtrl = true, buffer overflowed.".into()))
        );
    }

    #[test]
    fn test_fast_erase_failure_is_reported_and_logged() {
        let device = FastDevice::new(2).failing_erase(0x05);
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Fast);
        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 4096))
            .unwrap();
        let err = h.session.join().unwrap_err();
        assert!(matches!(err, DfuError::Protocol(_)));
        assert_eq!(err.to_string(), "eraseFlash: Failed to erase.");
        assert!(!h.platform.is_connected());
        assert!(!journal.snapshot().commands.contains(&u16::from(FAST_GET_BUFFER_SIZE)));

        let log = h.session.take_log();
        assert!(log.iter().any(|l| l.contains("ERROR") && l.contains("Failed to erase")));
        assert!(h.session.take_log().is_empty());
    }

    #[test]
    fn test_copy_overlap_fails_before_any_io() {
        let device = StandardDevice::extended();
        let mut h = harness(device, EngineKind::Standard);

        h.session
            .start_dfu_in_copy_mode(target(), demo_firmware(SIM_APP_ADDR, 4096), 0x0104_1000)
            .unwrap();
        let err = h.session.join().unwrap_err();
        assert!(matches!(err, DfuError::Protocol(_)));
        let msg = err.to_string();
        assert!(msg.contains("sourceArea(0x01040000-0x01041358)"), "{msg}");
        assert!(msg.contains("copyArea(0x01041000-0x01042000)"), "{msg}");

        assert!(h.platform.writes().is_empty());
        assert_eq!(h.platform.connect_count(), 0);
        assert_eq!(h.listener.calls().last(), Some(&Call::Error(msg)));
    }

    #[test]
    fn test_extended_switches_to_bootloader() {
        let app = ImageInfo::new(SIM_APP_ADDR, 0x8000, 0x0A99, "app");
        let device = StandardDevice::extended().with_running_app(app, POSITION_RUNNING_SLOT);
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);

        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 4096))
            .unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);

        let j = journal.snapshot();
        assert_eq!(j.control_writes[0], DFU_ENTER_SIGNAL.to_le_bytes().to_vec());
        assert_eq!(j.mode_switches, vec![DFU_MODE_RUNNING_SLOT]);
        assert_eq!(h.platform.connect_count(), 2);
        assert_eq!(j.flash_writes.len(), 4);
        assert!(progress_of(&h.listener, "Jumping to boot mode...").contains(&5));
    }

    #[test]
    fn test_extended_copy_mode_retargets_image() {
        let app = ImageInfo::new(SIM_APP_ADDR, 0x8000, 0x0A99, "app");
        let device = StandardDevice::extended().with_running_app(app, 0);
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);

        h.session
            .start_dfu_in_copy_mode(target(), demo_firmware(SIM_APP_ADDR, 4096), SIM_COPY_ADDR)
            .unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);

        let j = journal.snapshot();
        assert_eq!(j.mode_switches, vec![DFU_MODE_COPY]);
        assert_eq!(j.flash_writes[0].0, SIM_COPY_ADDR);
        let start = j.program_start.unwrap();
        let announced = ImageInfo::from_bytes(&start[1..]).unwrap();
        assert_eq!(announced.load_addr, SIM_COPY_ADDR);
        assert_eq!(h.platform.connect_count(), 1);
    }

    #[test]
    fn test_extended_fast_mode_streams_raw_payload() {
        let device = StandardDevice::extended();
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);
        h.session.set_fast_mode(true);
        let firmware = demo_firmware(SIM_APP_ADDR, 6000);

        h.session.start_dfu(target(), firmware.clone()).unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);

        let j = journal.snapshot();
        assert_eq!(j.program_start.as_ref().map(|p| p[0]), Some(0x02));
        assert!(j.flash_writes.is_empty());
        assert_eq!(j.payload, firmware);
        assert_eq!(j.program_end, Some((END_FIRMWARE, byte_sum(&firmware))));
        assert_eq!(progress_of(&h.listener, "Downloading...").last(), Some(&100));
    }

    #[test]
    fn test_old_bootloader_gets_no_encryption_nibble() {
        let device = StandardDevice::extended().with_dfu_version(1);
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);
        h.session.set_fast_mode(true);

        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 3000))
            .unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);
        assert_eq!(
            journal.snapshot().program_start.as_ref().map(|p| p[0]),
            Some(0x02)
        );
    }

    #[test]
    fn test_encryption_mismatch_stops_before_programming() {
        let device = StandardDevice::extended().encrypted();
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);

        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 4096))
            .unwrap();
        let err = h.session.join().unwrap_err();
        assert_eq!(
            err.to_string(),
            "The new firmware and target device encryption status do not match."
        );
        assert!(!journal.snapshot().commands.contains(&CMD_PROGRAM_START));
    }

    #[test]
    fn test_boot_entry_reconnects_to_dfu_boot() {
        let device = StandardDevice::extended().in_application();
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);

        h.session
            .start_dfu_with_boot_entry(target(), demo_firmware(SIM_APP_ADDR, 2048))
            .unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);
        assert_eq!(h.platform.connect_count(), 2);
        assert_eq!(journal.snapshot().control_writes.len(), 2);
    }

    #[test]
    fn test_boot_entry_on_fast_engine() {
        let device = FastDevice::new(3).in_application();
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Fast);

        h.session
            .start_dfu_with_boot_entry(target(), demo_firmware(SIM_APP_ADDR, 2048))
            .unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);
        assert_eq!(h.platform.connect_count(), 2);
        assert_eq!(journal.snapshot().control_writes.len(), 1);
    }

    #[test]
    fn test_device_reset_on_program_end_counts_as_success() {
        let device = StandardDevice::legacy().resetting_on_end();
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);

        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 2048))
            .unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);
        assert!(journal.snapshot().program_end.is_some());
        assert_eq!(h.listener.calls().last(), Some(&Call::Complete));
    }

    #[test]
    fn test_link_lost_while_sending_program_end_fails() {
        let device = StandardDevice::legacy().dropping_program_end();
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);

        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 2048))
            .unwrap();
        let err = h.session.join().unwrap_err();
        assert!(matches!(err, DfuError::Disconnected(_)), "{err:?}");
        assert!(journal.snapshot().program_end.is_some());
        assert!(matches!(h.listener.calls().last(), Some(Call::Error(_))));
        assert!(!h.listener.calls().contains(&Call::Complete));
    }

    #[test]
    fn test_fast_mode_erase_failure_stops_before_payload() {
        let device = StandardDevice::extended().failing_fast_erase(0x05);
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);
        h.session.set_fast_mode(true);

        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 6000))
            .unwrap();
        let err = h.session.join().unwrap_err();
        assert!(matches!(err, DfuError::Protocol(_)));
        assert_eq!(err.to_string(), "programStartFast: Erase failed.");
        assert_eq!(
            h.listener.calls().last(),
            Some(&Call::Error("programStartFast: Erase failed.".to_string()))
        );

        let j = journal.snapshot();
        assert!(j.payload.is_empty());
        assert!(j.program_end.is_none());
    }

    #[test]
    fn test_fast_mode_erase_overlap_names_the_running_area() {
        let device = StandardDevice::extended().failing_fast_erase(0x04);
        let mut h = harness(device, EngineKind::Standard);
        h.session.set_fast_mode(true);

        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 6000))
            .unwrap();
        let err = h.session.join().unwrap_err();
        assert_eq!(
            err.to_string(),
            "programStartFast: The erase area overlaps with the current running firmware area."
        );
    }

    #[test]
    fn test_fast_mode_rejects_wrong_end_checksum() {
        let device = StandardDevice::extended().wrong_end_checksum();
        let journal = device.journal();
        let mut h = harness(device, EngineKind::Standard);
        h.session.set_fast_mode(true);
        let firmware = demo_firmware(SIM_APP_ADDR, 6000);
        let sum = byte_sum(&firmware);

        h.session.start_dfu(target(), firmware).unwrap();
        let err = h.session.join().unwrap_err();
        assert!(matches!(err, DfuError::Protocol(_)));
        assert_eq!(
            err.to_string(),
            format!(
                "programEnd: Checksum verification error: {} != {}",
                sum.wrapping_add(1),
                sum
            )
        );
        assert_eq!(journal.snapshot().program_end, Some((END_FIRMWARE, sum)));
    }

    #[test]
    fn test_wrong_end_checksum_is_ignored_without_fast_mode() {
        let device = StandardDevice::extended().wrong_end_checksum();
        let mut h = harness(device, EngineKind::Standard);

        h.session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 2048))
            .unwrap();
        assert_eq!(h.session.join().unwrap(), Outcome::Completed);
    }

    /// Cancels the session once the download passes `at` percent.
    struct CancelAt {
        token: CancelToken,
        at: u8,
        inner: RecordingListener,
    }

    impl DfuListener for CancelAt {
        fn on_progress(&self, message: &str, percent: u8) {
            self.inner.on_progress(message, percent);
            if message == "Downloading..." && percent >= self.at {
                self.token.cancel();
            }
        }

        fn on_cancelled(&self, percent: u8) {
            self.inner.on_cancelled(percent);
        }
    }

    #[test]
    fn test_cancel_between_chunks() {
        let device = StandardDevice::legacy();
        let journal = device.journal();
        let platform = Arc::new(MockPlatform::with_device(device));
        let session = DfuSession::with_config(platform.clone(), quick_config());
        let listener = Arc::new(CancelAt {
            token: session.cancel_token(),
            at: 50,
            inner: RecordingListener::default(),
        });
        let mut session = session.with_listener(listener.clone());

        session
            .start_dfu(target(), demo_firmware(SIM_APP_ADDR, 4096))
            .unwrap();
        assert_eq!(session.join().unwrap(), Outcome::Cancelled { percent: 75 });

        let j = journal.snapshot();
        assert_eq!(j.flash_writes.len(), 3);
        assert!(j.program_end.is_none());
        assert_eq!(listener.inner.calls().last(), Some(&Call::Cancelled(75)));
        assert!(!platform.is_connected());
    }

    #[test]
    fn test_join_without_start() {
        let platform = Arc::new(MockPlatform::new());
        let mut session = DfuSession::new(platform);
        assert!(!session.is_running());
        assert!(matches!(session.join(), Err(DfuError::Config(_))));
    }
}
