//! Device session: connection lifecycle, exclusive access, and the typed
//! command catalog.
//!
//! A `DeviceSession` owns at most one open transport handle. Every logical
//! command exchange runs under one `tokio::sync::Mutex`, so concurrent
//! callers queue instead of interleaving bytes on the pipe; blocking callers
//! use `blocking_lock`, async callers await the same lock, with identical
//! exclusivity semantics. Block transfers hold the lock for the whole
//! multi-frame sequence.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::correlator::Correlator;
use crate::error::{JensenError, Result};
use crate::events::{ConnectionState, DeviceEvent, DeviceObserver, PacketDirection, TracingObserver};
use crate::model::{DeviceModel, KNOWN_DEVICE_IDS};
use crate::protocol::constants::*;
use crate::protocol::listing::{FileEntry, listing_appears_complete, parse_file_list};
use crate::protocol::time::DeviceTime;
use crate::transport::{TransportError, TransportOpener, UsbTransport};

/// Firmware version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Device identity, fetched on demand and never cached by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub firmware: Version,
    pub serial: String,
}

/// Card capacity in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub free_mib: u32,
    pub total_mib: u32,
}

/// Behavior flags stored on the device. The raw payload is retained so
/// unknown trailing fields round-trip untouched through `set_settings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub auto_record: bool,
    pub auto_play: bool,
    pub notification_sound: bool,
    pub bluetooth_tone: bool,
    pub raw: Vec<u8>,
}

/// One device found by a Bluetooth scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtDevice {
    pub mac: String,
    pub name: String,
}

/// Bluetooth link status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtStatus {
    pub connected: bool,
    pub mac: String,
}

/// Outcome of a connect, including whether the configured device had to be
/// substituted by another attached HiDock.
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub requested: (u16, u16),
    pub connected: (u16, u16),
    pub substituted: bool,
    pub model: Option<DeviceModel>,
}

/// Per-read bound used when draining stale bytes off the pipe.
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// The connected half of a session: transport handle, correlator, and the
/// bits of config the command catalog needs. Lives inside the session's
/// exclusivity mutex.
struct Active {
    transport: Box<dyn UsbTransport>,
    correlator: Correlator,
    observer: Arc<dyn DeviceObserver>,
    config: SessionConfig,
    model: Option<DeviceModel>,
}

/// Session over one HiDock recorder.
pub struct DeviceSession {
    config: SessionConfig,
    observer: Arc<dyn DeviceObserver>,
    inner: Mutex<Option<Active>>,
    state: StdMutex<ConnectionState>,
    busy: AtomicBool,
}

impl DeviceSession {
    /// Create a session with the default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }

    pub fn with_observer(config: SessionConfig, observer: Arc<dyn DeviceObserver>) -> Self {
        Self {
            config,
            observer,
            inner: Mutex::new(None),
            state: StdMutex::new(ConnectionState::Disconnected),
            busy: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Whether an exclusive operation is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn set_state(&self, to: ConnectionState) {
        let mut state = self.state.lock().unwrap();
        if *state != to {
            self.observer
                .on_event(&DeviceEvent::ConnectionChanged { from: *state, to });
            *state = to;
        }
    }

    /// Open the configured device, falling back to the first attached
    /// HiDock when it is absent. Refuses to run while another exchange is
    /// in flight.
    pub fn connect(&self, opener: &dyn TransportOpener) -> Result<ConnectionReport> {
        let mut guard = self.inner.try_lock().map_err(|_| JensenError::DeviceBusy)?;
        if guard.take().is_some() {
            warn!("connect called on a connected session, dropping previous handle");
            self.set_state(ConnectionState::Disconnected);
        }
        self.set_state(ConnectionState::Connecting);

        let requested = (self.config.vendor_id, self.config.product_id);
        let (transport, substituted) = match opener.open(requested.0, requested.1) {
            Ok(t) => (t, false),
            Err(TransportError::DeviceNotFound { .. }) => {
                match self.open_fallback(opener, requested) {
                    Some(t) => (t, true),
                    None => {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(JensenError::Connection {
                            vid: requested.0,
                            pid: requested.1,
                            fallback_tried: true,
                        });
                    }
                }
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(error = %e, "Failed to open configured device");
                return Err(JensenError::Connection {
                    vid: requested.0,
                    pid: requested.1,
                    fallback_tried: false,
                });
            }
        };

        let connected = (transport.vendor_id(), transport.product_id());
        let model = DeviceModel::from_ids(connected.0, connected.1);
        let mut active = Active {
            transport,
            correlator: Correlator::new(),
            observer: Arc::clone(&self.observer),
            config: self.config.clone(),
            model,
        };

        if self.config.force_reset {
            // Recover from a previous ungraceful disconnect before the
            // first command exchange.
            if let Err(e) = active.drain_stale() {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        }

        *guard = Some(active);
        self.set_state(ConnectionState::Connected);
        if substituted {
            self.observer.on_event(&DeviceEvent::DeviceSubstituted {
                requested,
                connected,
            });
        }
        info!(
            vid = %format!("{:04X}", connected.0),
            pid = %format!("{:04X}", connected.1),
            model = %model.map(|m| m.name()).unwrap_or("unknown"),
            substituted,
            "Connected"
        );

        Ok(ConnectionReport {
            requested,
            connected,
            substituted,
            model,
        })
    }

    fn open_fallback(
        &self,
        opener: &dyn TransportOpener,
        requested: (u16, u16),
    ) -> Option<Box<dyn UsbTransport>> {
        let attached = opener.list_attached().ok()?;
        for ids in attached {
            if ids == requested || !KNOWN_DEVICE_IDS.contains(&ids) {
                continue;
            }
            match opener.open(ids.0, ids.1) {
                Ok(t) => {
                    warn!(
                        requested = %format!("{:04X}:{:04X}", requested.0, requested.1),
                        found = %format!("{:04X}:{:04X}", ids.0, ids.1),
                        "Configured device absent, using attached HiDock instead"
                    );
                    return Some(t);
                }
                Err(e) => {
                    debug!(error = %e, "Fallback candidate failed to open");
                }
            }
        }
        None
    }

    /// Release the transport handle. Safe to call repeatedly and never
    /// errors; dropping the handle releases the claimed interface.
    pub fn disconnect(&self) {
        let mut guard = self.inner.blocking_lock();
        if guard.take().is_some() {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Recover a wedged command channel without a full reconnect: stale
    /// bytes are drained and pending requests forgotten. The session stays
    /// usable afterwards.
    pub fn reset_device_state(&self) -> Result<()> {
        self.with_active(|a| a.drain_stale())
    }

    fn with_active<R>(&self, f: impl FnOnce(&mut Active) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.blocking_lock();
        self.busy.store(true, Ordering::SeqCst);
        let result = match guard.as_mut() {
            Some(active) => f(active),
            None => Err(JensenError::NotConnected),
        };
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    /// Async counterpart of [`Self::with_active`]. The session lock is held
    /// across the whole exchange, but the blocking bulk I/O itself runs on
    /// the blocking pool so the executor threads stay free for other tasks.
    async fn with_active_async<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Active) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut guard = self.inner.lock().await;
        let mut active = guard.take().ok_or(JensenError::NotConnected)?;
        self.busy.store(true, Ordering::SeqCst);
        let joined = tokio::task::spawn_blocking(move || {
            let result = f(&mut active);
            (active, result)
        })
        .await;
        self.busy.store(false, Ordering::SeqCst);
        match joined {
            Ok((active, result)) => {
                *guard = Some(active);
                result
            }
            // The worker panicked and took the transport handle with it;
            // the session is left disconnected.
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(JensenError::Protocol(format!("exchange worker failed: {e}")))
            }
        }
    }

    // ------------------------------------------------------------------
    // Command catalog, blocking style
    // ------------------------------------------------------------------

    pub fn device_info(&self) -> Result<DeviceInfo> {
        self.with_active(|a| a.device_info())
    }

    pub fn device_time(&self) -> Result<Option<DeviceTime>> {
        self.with_active(|a| a.device_time())
    }

    pub fn set_device_time(&self, time: DeviceTime) -> Result<()> {
        self.with_active(|a| a.set_device_time(time))
    }

    pub fn file_count(&self) -> Result<u32> {
        self.with_active(|a| a.file_count())
    }

    pub fn list_files(&self) -> Result<Vec<FileEntry>> {
        self.with_active(|a| a.list_files())
    }

    /// Stream a whole file; `sink` is called once per received block. The
    /// session lock is held for the entire transfer.
    pub fn stream_file(
        &self,
        name: &str,
        size: u32,
        sink: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<u64> {
        self.with_active(|a| a.stream_file(name, size, sink))
    }

    /// Fetch one bounded block of a file.
    pub fn transfer_block(&self, name: &str, offset: u32, length: u32) -> Result<Vec<u8>> {
        self.with_active(|a| a.transfer_range(CMD_GET_FILE_BLOCK, name, offset, length))
    }

    /// Partial-transfer variant used by newer firmware.
    pub fn transfer_partial(&self, name: &str, offset: u32, length: u32) -> Result<Vec<u8>> {
        self.with_active(|a| a.transfer_range(CMD_TRANSFER_FILE_PARTIAL, name, offset, length))
    }

    pub fn delete_file(&self, name: &str) -> Result<()> {
        self.with_active(|a| a.delete_file(name))
    }

    pub fn firmware_prepare(&self, version: u32, size: u32) -> Result<()> {
        self.with_active(|a| a.firmware_prepare(version, size))
    }

    pub fn firmware_upload(&self, data: &[u8]) -> Result<()> {
        self.with_active(|a| a.firmware_upload(data))
    }

    pub fn settings(&self) -> Result<DeviceSettings> {
        self.with_active(|a| a.settings())
    }

    pub fn set_settings(&self, settings: &DeviceSettings) -> Result<()> {
        self.with_active(|a| a.set_settings(settings))
    }

    pub fn storage_info(&self) -> Result<StorageInfo> {
        self.with_active(|a| a.storage_info())
    }

    pub fn format_storage(&self) -> Result<()> {
        self.with_active(|a| a.format_storage())
    }

    /// Name of the recording currently in progress, if any.
    pub fn current_recording(&self) -> Result<Option<String>> {
        self.with_active(|a| a.current_recording())
    }

    pub fn factory_reset(&self) -> Result<()> {
        self.with_active(|a| a.factory_reset())
    }

    pub fn send_meeting_schedule(&self, blob: &[u8]) -> Result<()> {
        self.with_active(|a| a.send_meeting_schedule(blob))
    }

    pub fn tone_update(&self, data: &[u8]) -> Result<()> {
        self.with_active(|a| a.staged_update(CMD_TONE_UPDATE_PREPARE, CMD_TONE_UPDATE_UPLOAD, data))
    }

    pub fn uac_update(&self, data: &[u8]) -> Result<()> {
        self.with_active(|a| a.staged_update(CMD_UAC_UPDATE_PREPARE, CMD_UAC_UPDATE_UPLOAD, data))
    }

    /// Start or stop realtime audio streaming.
    pub fn realtime_control(&self, start: bool) -> Result<()> {
        self.with_active(|a| a.realtime_control(start))
    }

    /// Pull the next buffered realtime audio chunk.
    pub fn realtime_read(&self) -> Result<Vec<u8>> {
        self.with_active(|a| a.realtime_read())
    }

    /// Bulk realtime pull used by newer firmware.
    pub fn realtime_transfer(&self) -> Result<Vec<u8>> {
        self.with_active(|a| a.request(CMD_REALTIME_TRANSFER, Vec::new()))
    }

    /// Factory test hooks (commands 14/15). The firmware acknowledges with
    /// a zero-length body; that is success, not a stub.
    pub fn record_test(&self, begin: bool) -> Result<()> {
        self.with_active(|a| a.record_test(begin))
    }

    /// Command 10. Historically wedges the recorder; blocked unless
    /// `allow_destructive` is set in the config.
    pub fn device_message_test(&self, payload: &[u8]) -> Result<()> {
        self.with_active(|a| a.device_message_test(payload))
    }

    pub fn bluetooth_scan(&self) -> Result<Vec<BtDevice>> {
        self.with_active(|a| a.bluetooth_scan())
    }

    pub fn bluetooth_pair(&self, mac: &str) -> Result<()> {
        self.with_active(|a| a.bluetooth_simple(CMD_BT_PAIR, mac))
    }

    pub fn bluetooth_unpair(&self, mac: &str) -> Result<()> {
        self.with_active(|a| a.bluetooth_simple(CMD_BT_UNPAIR, mac))
    }

    pub fn bluetooth_connect(&self, mac: &str) -> Result<()> {
        self.with_active(|a| a.bluetooth_simple(CMD_BT_CONNECT, mac))
    }

    pub fn bluetooth_disconnect(&self, mac: &str) -> Result<()> {
        self.with_active(|a| a.bluetooth_simple(CMD_BT_DISCONNECT, mac))
    }

    pub fn bluetooth_status(&self) -> Result<BtStatus> {
        self.with_active(|a| a.bluetooth_status())
    }

    /// Enable or disable the audible pairing prompt.
    pub fn bluetooth_prompt_play(&self, enable: bool) -> Result<()> {
        self.with_active(|a| {
            a.require_bluetooth(CMD_BT_PROMPT_PLAY)?;
            let reply = a.request(CMD_BT_PROMPT_PLAY, vec![enable as u8])?;
            expect_ack(CMD_BT_PROMPT_PLAY, &reply)
        })
    }

    // ------------------------------------------------------------------
    // Command catalog, async style (same exclusivity semantics)
    // ------------------------------------------------------------------

    pub async fn device_info_async(&self) -> Result<DeviceInfo> {
        self.with_active_async(|a| a.device_info()).await
    }

    pub async fn file_count_async(&self) -> Result<u32> {
        self.with_active_async(|a| a.file_count()).await
    }

    pub async fn list_files_async(&self) -> Result<Vec<FileEntry>> {
        self.with_active_async(|a| a.list_files()).await
    }

    pub async fn storage_info_async(&self) -> Result<StorageInfo> {
        self.with_active_async(|a| a.storage_info()).await
    }
}

impl Active {
    fn timeout_for(&self, command: u16) -> Duration {
        match command_class(command) {
            CommandClass::Metadata => Duration::from_millis(self.config.command_timeout_ms),
            CommandClass::Transfer => Duration::from_millis(self.config.transfer_timeout_ms),
            CommandClass::Maintenance => MAINTENANCE_TIMEOUT,
        }
    }

    /// One complete exchange: send, await the matching reply, return its
    /// body. An endpoint stall means the firmware has no such command.
    fn exchange(&mut self, command: u16, body: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let sent_len = body.len();
        let result: Result<Vec<u8>> = (|| {
            let seq = self
                .correlator
                .send(self.transport.as_mut(), command, body, timeout)?;
            self.observer.on_event(&DeviceEvent::Packet {
                direction: PacketDirection::Tx,
                command,
                length: sent_len,
            });
            let frame = self.correlator.receive(self.transport.as_mut(), seq)?;
            self.observer.on_event(&DeviceEvent::Packet {
                direction: PacketDirection::Rx,
                command,
                length: frame.body.len(),
            });
            Ok(frame.body)
        })();
        match result {
            Err(JensenError::Transport(TransportError::Stall)) => {
                Err(JensenError::UnsupportedCommand(command))
            }
            other => other,
        }
    }

    /// Exchange with the session's recovery policy: one automatic drain and
    /// retry on a protocol desync, everything else propagates immediately.
    fn request(&mut self, command: u16, body: Vec<u8>) -> Result<Vec<u8>> {
        let timeout = self.timeout_for(command);
        match self.exchange(command, body.clone(), timeout) {
            Err(JensenError::Protocol(msg)) => {
                warn!(command, error = %msg, "Protocol desync, resetting device state and retrying once");
                self.drain_stale()?;
                self.exchange(command, body, timeout)
            }
            other => other,
        }
    }

    /// Drop stale bytes from the pipe and forget pending requests.
    fn drain_stale(&mut self) -> Result<()> {
        self.correlator.reset();
        for _ in 0..64 {
            match self.transport.read(BULK_READ_LEN, DRAIN_READ_TIMEOUT) {
                Ok(bytes) if bytes.is_empty() => break,
                Ok(_) => continue,
                Err(TransportError::Timeout { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn device_info(&mut self) -> Result<DeviceInfo> {
        let body = self.request(CMD_GET_DEVICE_INFO, Vec::new())?;
        if body.len() < 20 {
            return Err(JensenError::Protocol(format!(
                "device info body too short: {} bytes",
                body.len()
            )));
        }
        // byte 0 is reserved; 1..4 is the version triple; 4..20 the serial,
        // NUL padded.
        let firmware = Version {
            major: body[1],
            minor: body[2],
            patch: body[3],
        };
        let serial: Vec<u8> = body[4..20].iter().copied().filter(|&b| b != 0).collect();
        Ok(DeviceInfo {
            firmware,
            serial: String::from_utf8_lossy(&serial).into_owned(),
        })
    }

    fn device_time(&mut self) -> Result<Option<DeviceTime>> {
        let body = self.request(CMD_GET_DEVICE_TIME, Vec::new())?;
        if body.len() < 7 {
            return Err(JensenError::Protocol(format!(
                "device time body too short: {} bytes",
                body.len()
            )));
        }
        Ok(DeviceTime::from_bcd(&body[..7])?)
    }

    fn set_device_time(&mut self, time: DeviceTime) -> Result<()> {
        let body = self.request(CMD_SET_DEVICE_TIME, time.to_bcd().to_vec())?;
        expect_ack(CMD_SET_DEVICE_TIME, &body)
    }

    fn file_count(&mut self) -> Result<u32> {
        let body = self.request(CMD_GET_FILE_COUNT, Vec::new())?;
        if body.len() < 4 {
            return Err(JensenError::Protocol(format!(
                "file count body too short: {} bytes",
                body.len()
            )));
        }
        Ok(BigEndian::read_u32(&body[..4]))
    }

    fn list_files(&mut self) -> Result<Vec<FileEntry>> {
        // Not every firmware opens the listing with a count header; the
        // separate count command tells those listings when to stop too.
        let count_hint = self.file_count().ok();

        let timeout = self.timeout_for(CMD_GET_FILE_LIST);
        let seq = self
            .correlator
            .send(self.transport.as_mut(), CMD_GET_FILE_LIST, Vec::new(), timeout)?;
        let first = self.correlator.receive(self.transport.as_mut(), seq)?;

        let mut raw = first.body;
        let chunk_timeout = Duration::from_millis(self.config.command_timeout_ms);
        loop {
            let listing = parse_file_list(&raw);
            if let Some(total) = listing.declared_total.or(count_hint) {
                if listing.entries.len() as u32 >= total {
                    break;
                }
                // Size heuristic decides when to stop issuing reads; the
                // final parse below stays authoritative.
                if listing_appears_complete(raw.len(), total) {
                    break;
                }
            }
            match self.correlator.receive_more(
                self.transport.as_mut(),
                seq,
                CMD_GET_FILE_LIST,
                chunk_timeout,
            ) {
                Ok(frame) => raw.extend_from_slice(&frame.body),
                // No more chunks coming; return whatever parsed cleanly.
                Err(JensenError::Timeout { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(parse_file_list(&raw).entries)
    }

    fn stream_file(
        &mut self,
        name: &str,
        size: u32,
        sink: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<u64> {
        let timeout = transfer_timeout(size as usize);
        let seq = self.correlator.send(
            self.transport.as_mut(),
            CMD_TRANSFER_FILE,
            name.as_bytes().to_vec(),
            timeout,
        )?;

        let chunk_timeout = Duration::from_millis(self.config.transfer_timeout_ms);
        let mut received: u64 = 0;
        // The first receive always runs, even for a zero-byte file, so the
        // pending entry resolves and the device's reply never stays on the
        // pipe.
        let mut frame = self.correlator.receive(self.transport.as_mut(), seq)?;
        loop {
            if frame.body.is_empty() {
                // Device signals end-of-file with an empty block.
                break;
            }
            received += frame.body.len() as u64;
            sink(&frame.body)?;
            self.observer.on_event(&DeviceEvent::Progress {
                operation: format!("transfer {name}"),
                current: received,
                total: size as u64,
            });
            if received >= size as u64 {
                break;
            }
            frame = self.correlator.receive_more(
                self.transport.as_mut(),
                seq,
                CMD_TRANSFER_FILE,
                chunk_timeout,
            )?;
        }
        Ok(received)
    }

    fn transfer_range(&mut self, command: u16, name: &str, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(8 + name.len());
        body.extend_from_slice(&offset.to_be_bytes());
        body.extend_from_slice(&length.to_be_bytes());
        body.extend_from_slice(name.as_bytes());

        let timeout = transfer_timeout(length as usize);
        let seq = self
            .correlator
            .send(self.transport.as_mut(), command, body, timeout)?;

        let mut out = Vec::with_capacity(length as usize);
        let first = self.correlator.receive(self.transport.as_mut(), seq)?;
        out.extend_from_slice(&first.body);
        let chunk_timeout = Duration::from_millis(self.config.transfer_timeout_ms);
        while out.len() < length as usize {
            let frame =
                self.correlator
                    .receive_more(self.transport.as_mut(), seq, command, chunk_timeout)?;
            if frame.body.is_empty() {
                break;
            }
            out.extend_from_slice(&frame.body);
        }
        Ok(out)
    }

    fn delete_file(&mut self, name: &str) -> Result<()> {
        let body = self.request(CMD_DELETE_FILE, name.as_bytes().to_vec())?;
        expect_ack(CMD_DELETE_FILE, &body)
    }

    fn firmware_prepare(&mut self, version: u32, size: u32) -> Result<()> {
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&version.to_be_bytes());
        body.extend_from_slice(&size.to_be_bytes());
        let reply = self.request(CMD_REQUEST_FIRMWARE_UPGRADE, body)?;
        expect_ack(CMD_REQUEST_FIRMWARE_UPGRADE, &reply)
    }

    fn firmware_upload(&mut self, data: &[u8]) -> Result<()> {
        let timeout = transfer_timeout(data.len());
        let reply = self.exchange(CMD_FIRMWARE_UPLOAD, data.to_vec(), timeout)?;
        expect_ack(CMD_FIRMWARE_UPLOAD, &reply)
    }

    fn settings(&mut self) -> Result<DeviceSettings> {
        let body = self.request(CMD_GET_SETTINGS, Vec::new())?;
        if body.len() < 4 {
            return Err(JensenError::Protocol(format!(
                "settings body too short: {} bytes",
                body.len()
            )));
        }
        Ok(DeviceSettings {
            auto_record: body[0] != 0,
            auto_play: body[1] != 0,
            notification_sound: body[2] != 0,
            bluetooth_tone: body[3] != 0,
            raw: body,
        })
    }

    fn set_settings(&mut self, settings: &DeviceSettings) -> Result<()> {
        let mut body = if settings.raw.len() >= 4 {
            settings.raw.clone()
        } else {
            vec![0; 4]
        };
        body[0] = settings.auto_record as u8;
        body[1] = settings.auto_play as u8;
        body[2] = settings.notification_sound as u8;
        body[3] = settings.bluetooth_tone as u8;
        let reply = self.request(CMD_SET_SETTINGS, body)?;
        expect_ack(CMD_SET_SETTINGS, &reply)
    }

    fn storage_info(&mut self) -> Result<StorageInfo> {
        let body = self.request(CMD_GET_CARD_INFO, Vec::new())?;
        if body.len() < 8 {
            return Err(JensenError::Protocol(format!(
                "card info body too short: {} bytes",
                body.len()
            )));
        }
        Ok(StorageInfo {
            free_mib: BigEndian::read_u32(&body[0..4]),
            total_mib: BigEndian::read_u32(&body[4..8]),
        })
    }

    fn format_storage(&mut self) -> Result<()> {
        // The firmware requires this cookie so a stray frame cannot format
        // the card.
        let reply = self.request(CMD_FORMAT_CARD, vec![0x01, 0x02, 0x03, 0x04])?;
        expect_ack(CMD_FORMAT_CARD, &reply)
    }

    fn current_recording(&mut self) -> Result<Option<String>> {
        let body = self.request(CMD_GET_RECORDING_FILE, Vec::new())?;
        if body.is_empty() {
            return Ok(None);
        }
        let cleaned: Vec<u8> = body.iter().copied().filter(|&b| b != 0).collect();
        if cleaned.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&cleaned).into_owned()))
    }

    fn factory_reset(&mut self) -> Result<()> {
        let reply = self.request(CMD_RESTORE_FACTORY_SETTINGS, Vec::new())?;
        expect_ack(CMD_RESTORE_FACTORY_SETTINGS, &reply)
    }

    fn send_meeting_schedule(&mut self, blob: &[u8]) -> Result<()> {
        let reply = self.request(CMD_SEND_MEETING_SCHEDULE, blob.to_vec())?;
        expect_ack(CMD_SEND_MEETING_SCHEDULE, &reply)
    }

    fn staged_update(&mut self, prepare: u16, upload: u16, data: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&(data.len() as u32).to_be_bytes());
        body.extend_from_slice(&checksum(data).to_be_bytes());
        let reply = self.request(prepare, body)?;
        expect_ack(prepare, &reply)?;

        let timeout = transfer_timeout(data.len());
        let reply = self.exchange(upload, data.to_vec(), timeout)?;
        expect_ack(upload, &reply)
    }

    fn realtime_control(&mut self, start: bool) -> Result<()> {
        let reply = self.request(CMD_REALTIME_CONTROL, vec![start as u8])?;
        expect_ack(CMD_REALTIME_CONTROL, &reply)
    }

    fn realtime_read(&mut self) -> Result<Vec<u8>> {
        self.request(CMD_REALTIME_READ, Vec::new())
    }

    fn record_test(&mut self, begin: bool) -> Result<()> {
        let command = if begin {
            CMD_RECORD_TEST_START
        } else {
            CMD_RECORD_TEST_END
        };
        let body = self.request(command, Vec::new())?;
        if !body.is_empty() {
            debug!(command, len = body.len(), "Unexpected body on acknowledge-only command");
        }
        Ok(())
    }

    fn device_message_test(&mut self, payload: &[u8]) -> Result<()> {
        if !self.config.allow_destructive {
            return Err(JensenError::CommandBlocked(CMD_DEVICE_MSG_TEST));
        }
        warn!(
            command = CMD_DEVICE_MSG_TEST,
            "Sending command known to destabilize the device"
        );
        let reply = self.request(CMD_DEVICE_MSG_TEST, payload.to_vec())?;
        expect_ack(CMD_DEVICE_MSG_TEST, &reply)
    }

    fn require_bluetooth(&self, command: u16) -> Result<()> {
        match self.model {
            Some(m) if m.supports_bluetooth() => Ok(()),
            _ => Err(JensenError::UnsupportedCommand(command)),
        }
    }

    fn bluetooth_scan(&mut self) -> Result<Vec<BtDevice>> {
        self.require_bluetooth(CMD_BT_SCAN)?;
        let body = self.request(CMD_BT_SCAN, Vec::new())?;

        // Records of mac(6) + name_len(1) + name.
        let mut devices = Vec::new();
        let mut pos = 0;
        while pos + 7 <= body.len() {
            let mac = format_mac(&body[pos..pos + 6]);
            let name_len = body[pos + 6] as usize;
            pos += 7;
            if pos + name_len > body.len() {
                break;
            }
            let name = String::from_utf8_lossy(&body[pos..pos + name_len]).into_owned();
            pos += name_len;
            devices.push(BtDevice { mac, name });
        }
        Ok(devices)
    }

    fn bluetooth_simple(&mut self, command: u16, mac: &str) -> Result<()> {
        self.require_bluetooth(command)?;
        let reply = self.request(command, parse_mac(mac)?.to_vec())?;
        expect_ack(command, &reply)
    }

    fn bluetooth_status(&mut self) -> Result<BtStatus> {
        self.require_bluetooth(CMD_BT_STATUS)?;
        let body = self.request(CMD_BT_STATUS, Vec::new())?;
        if body.len() < 7 {
            return Err(JensenError::Protocol(format!(
                "bluetooth status body too short: {} bytes",
                body.len()
            )));
        }
        Ok(BtStatus {
            connected: body[0] != 0,
            mac: format_mac(&body[1..7]),
        })
    }
}

/// Zero-or-empty status byte means success.
fn expect_ack(command: u16, body: &[u8]) -> Result<()> {
    match body.first() {
        None | Some(0) => Ok(()),
        Some(status) => Err(JensenError::Protocol(format!(
            "command {command} failed with status {status}"
        ))),
    }
}

fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(JensenError::Protocol(format!("invalid MAC address {mac:?}")));
    }
    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16)
            .map_err(|_| JensenError::Protocol(format!("invalid MAC address {mac:?}")))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;
    use crate::events::NullObserver;
    use crate::protocol::frame::CommandFrame;
    use crate::transport::{MockOp, MockOpener, MockTransport};

    fn reply(command: u16, sequence: u32, body: &[u8]) -> Vec<u8> {
        CommandFrame {
            command,
            sequence,
            body: body.to_vec(),
        }
        .encode()
    }

    fn info_body() -> Vec<u8> {
        let mut body = vec![0x00, 1, 2, 3];
        body.extend_from_slice(b"HD1E240500012345");
        body
    }

    fn test_config(vid: u16, pid: u16) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.vendor_id = vid;
        config.product_id = pid;
        config.command_timeout_ms = 500;
        config.transfer_timeout_ms = 500;
        config
    }

    fn connected_with<F>(
        vid: u16,
        pid: u16,
        responder: F,
    ) -> (DeviceSession, Arc<StdMutex<Vec<MockOp>>>)
    where
        F: FnMut(u16, u32, &[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let mut mock = MockTransport::new(vid, pid);
        mock.set_responder(responder);
        let ops = mock.ops_handle();
        let opener = MockOpener::new(vec![(vid, pid, mock)]);
        let session = DeviceSession::with_observer(test_config(vid, pid), Arc::new(NullObserver));
        session.connect(&opener).unwrap();
        (session, ops)
    }

    fn make_entry(name: &str, size: u32) -> Vec<u8> {
        let mut entry = vec![1];
        entry.extend_from_slice(&[0, 0, name.len() as u8]);
        entry.extend_from_slice(name.as_bytes());
        entry.extend_from_slice(&size.to_be_bytes());
        entry.extend_from_slice(&[0; 6]);
        entry.extend_from_slice(&[0xAB; 16]);
        entry
    }

    #[test]
    fn connect_substitutes_attached_device_and_reports_it() {
        let mock = MockTransport::new(0x10D6, 0xB00C);
        let opener = MockOpener::new(vec![(0x10D6, 0xB00C, mock)]);
        let session =
            DeviceSession::with_observer(test_config(0x3887, 0xAF0E), Arc::new(NullObserver));

        let report = session.connect(&opener).unwrap();
        assert!(report.substituted);
        assert_eq!(report.requested, (0x3887, 0xAF0E));
        assert_eq!(report.connected, (0x10D6, 0xB00C));
        assert_eq!(report.model, Some(DeviceModel::H1));
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[test]
    fn connect_fails_when_nothing_attached() {
        let opener = MockOpener::new(Vec::new());
        let session =
            DeviceSession::with_observer(test_config(0x10D6, 0xB00D), Arc::new(NullObserver));
        let err = session.connect(&opener).unwrap_err();
        assert!(matches!(
            err,
            JensenError::Connection {
                fallback_tried: true,
                ..
            }
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn device_info_parses_version_and_serial() {
        let (session, _) = connected_with(0x10D6, 0xB00D, |c, s, _| vec![reply(c, s, &info_body())]);
        let info = session.device_info().unwrap();
        assert_eq!(info.firmware.to_string(), "1.2.3");
        assert_eq!(info.serial, "HD1E240500012345");
    }

    #[test]
    fn storage_info_parses_free_and_total() {
        let (session, _) = connected_with(0x10D6, 0xB00D, |c, s, _| {
            let mut body = 1024u32.to_be_bytes().to_vec();
            body.extend_from_slice(&32768u32.to_be_bytes());
            vec![reply(c, s, &body)]
        });
        let info = session.storage_info().unwrap();
        assert_eq!(info.free_mib, 1024);
        assert_eq!(info.total_mib, 32768);
    }

    #[test]
    fn storage_info_rejects_short_body() {
        let (session, _) =
            connected_with(0x10D6, 0xB00D, |c, s, _| vec![reply(c, s, &[0, 0, 1])]);
        let err = session.storage_info().unwrap_err();
        assert!(matches!(err, JensenError::Protocol(_)));
    }

    #[test]
    fn file_count_reads_big_endian() {
        let (session, _) = connected_with(0x10D6, 0xB00D, |c, s, _| {
            vec![reply(c, s, &42u32.to_be_bytes())]
        });
        assert_eq!(session.file_count().unwrap(), 42);
    }

    #[test]
    fn list_files_reassembles_chunked_listing() {
        let mut raw = vec![0xFF, 0xFF];
        raw.extend_from_slice(&3u32.to_be_bytes());
        raw.extend_from_slice(&make_entry("REC01.wav", 1000));
        raw.extend_from_slice(&make_entry("REC02.wav", 2000));
        raw.extend_from_slice(&make_entry("REC03.wav", 3000));
        let mid = raw.len() / 2;
        let (head, tail) = (raw[..mid].to_vec(), raw[mid..].to_vec());

        let (session, _) = connected_with(0x10D6, 0xB00D, move |c, s, _| {
            if c == CMD_GET_FILE_COUNT {
                vec![reply(c, s, &3u32.to_be_bytes())]
            } else {
                vec![reply(c, s, &head), reply(c, s, &tail)]
            }
        });
        let files = session.list_files().unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].name, "REC01.wav");
        assert_eq!(files[2].size, 3000);
    }

    #[test]
    fn headerless_listing_stops_at_the_counted_total() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&make_entry("REC01.wav", 1000));
        raw.extend_from_slice(&make_entry("REC02.wav", 2000));
        let entries = raw.clone();

        let (session, _) = connected_with(0x10D6, 0xB00D, move |c, s, _| {
            if c == CMD_GET_FILE_COUNT {
                vec![reply(c, s, &2u32.to_be_bytes())]
            } else {
                vec![reply(c, s, &entries)]
            }
        });
        let started = std::time::Instant::now();
        let files = session.list_files().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].name, "REC02.wav");
        // Termination comes from the counted total, not from waiting out
        // the inter-chunk timeout.
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn stream_file_delivers_blocks_until_size_reached() {
        let (session, _) = connected_with(0x10D6, 0xB00D, |c, s, _| {
            vec![reply(c, s, &[1, 2, 3, 4]), reply(c, s, &[5, 6, 7, 8])]
        });
        let mut collected = Vec::new();
        let received = session
            .stream_file("REC01.wav", 8, &mut |chunk| {
                collected.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(received, 8);
        assert_eq!(collected, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn zero_length_stream_resolves_the_exchange() {
        let (session, ops) = connected_with(0x10D6, 0xB00D, |c, s, _| {
            if c == CMD_TRANSFER_FILE {
                vec![reply(c, s, &[])]
            } else {
                vec![reply(c, s, &info_body())]
            }
        });
        let mut calls = 0;
        let received = session
            .stream_file("EMPTY.wav", 0, &mut |_| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(received, 0);
        assert_eq!(calls, 0);
        // The end-of-file reply was consumed rather than left on the pipe.
        let reads = ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| matches!(op, MockOp::Read { .. }))
            .count();
        assert_eq!(reads, 1);
        // The next exchange is undisturbed by the previous one.
        session.device_info().unwrap();
    }

    #[test]
    fn transfer_block_sends_range_and_assembles_reply() {
        let (session, _) = connected_with(0x10D6, 0xB00D, |c, s, _| {
            vec![reply(c, s, &[0xAA; 4]), reply(c, s, &[0xBB; 4])]
        });
        let block = session.transfer_block("REC01.wav", 0x1000, 8).unwrap();
        assert_eq!(block.len(), 8);
        assert_eq!(&block[..4], &[0xAA; 4]);
    }

    #[test]
    fn delete_file_maps_nonzero_status_to_error() {
        let (session, _) = connected_with(0x10D6, 0xB00D, |c, s, _| vec![reply(c, s, &[1])]);
        let err = session.delete_file("REC01.wav").unwrap_err();
        assert!(matches!(err, JensenError::Protocol(_)));
    }

    #[test]
    fn format_storage_sends_confirmation_cookie() {
        let mut mock = MockTransport::new(0x10D6, 0xB00D);
        mock.set_responder(|c, s, _| vec![reply(c, s, &[0])]);
        let writes = mock.writes();
        assert!(writes.is_empty());
        let handle = mock.ops_handle();
        let opener = MockOpener::new(vec![(0x10D6, 0xB00D, mock)]);
        let session =
            DeviceSession::with_observer(test_config(0x10D6, 0xB00D), Arc::new(NullObserver));
        session.connect(&opener).unwrap();
        session.format_storage().unwrap();
        let ops = handle.lock().unwrap();
        assert!(matches!(
            ops[0],
            MockOp::Write {
                command: CMD_FORMAT_CARD,
                ..
            }
        ));
    }

    #[test]
    fn record_test_commands_accept_empty_body() {
        let (session, _) = connected_with(0x10D6, 0xB00D, |c, s, _| vec![reply(c, s, &[])]);
        session.record_test(true).unwrap();
        session.record_test(false).unwrap();
    }

    #[test]
    fn message_test_is_blocked_by_default() {
        let (session, ops) = connected_with(0x10D6, 0xB00D, |c, s, _| vec![reply(c, s, &[0])]);
        let err = session.device_message_test(&[0x55]).unwrap_err();
        assert!(matches!(err, JensenError::CommandBlocked(CMD_DEVICE_MSG_TEST)));
        // Blocked before anything touches the wire.
        assert!(ops.lock().unwrap().is_empty());
    }

    #[test]
    fn message_test_runs_when_destructive_commands_allowed() {
        let mut mock = MockTransport::new(0x10D6, 0xB00D);
        mock.set_responder(|c, s, _| vec![reply(c, s, &[0])]);
        let opener = MockOpener::new(vec![(0x10D6, 0xB00D, mock)]);
        let mut config = test_config(0x10D6, 0xB00D);
        config.allow_destructive = true;
        let session = DeviceSession::with_observer(config, Arc::new(NullObserver));
        session.connect(&opener).unwrap();
        session.device_message_test(&[0x55]).unwrap();
    }

    #[test]
    fn stall_maps_to_unsupported_command() {
        let mut mock = MockTransport::new(0x10D6, 0xB00D);
        mock.set_stall_on(CMD_GET_SETTINGS);
        let opener = MockOpener::new(vec![(0x10D6, 0xB00D, mock)]);
        let session =
            DeviceSession::with_observer(test_config(0x10D6, 0xB00D), Arc::new(NullObserver));
        session.connect(&opener).unwrap();
        let err = session.settings().unwrap_err();
        assert!(matches!(err, JensenError::UnsupportedCommand(CMD_GET_SETTINGS)));
    }

    #[test]
    fn bluetooth_is_gated_on_non_p1_models() {
        let (session, ops) = connected_with(0x10D6, 0xB00D, |c, s, _| vec![reply(c, s, &[])]);
        let err = session.bluetooth_scan().unwrap_err();
        assert!(matches!(err, JensenError::UnsupportedCommand(CMD_BT_SCAN)));
        assert!(ops.lock().unwrap().is_empty());
    }

    #[test]
    fn bluetooth_scan_parses_device_records() {
        let (session, _) = connected_with(0x10D6, 0xB00E, |c, s, _| {
            let mut body = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
            body.push(4);
            body.extend_from_slice(b"Ears");
            body.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
            body.push(3);
            body.extend_from_slice(b"Car");
            vec![reply(c, s, &body)]
        });
        let devices = session.bluetooth_scan().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].mac, "00:11:22:33:44:55");
        assert_eq!(devices[0].name, "Ears");
        assert_eq!(devices[1].name, "Car");
    }

    #[test]
    fn settings_round_trip_preserves_raw_tail() {
        let stored = vec![1u8, 0, 1, 0, 0x77, 0x88];
        let sent = stored.clone();
        let (session, _) = connected_with(0x10D6, 0xB00D, move |c, s, body| {
            if c == CMD_SET_SETTINGS {
                assert_eq!(&body[4..], &sent[4..]);
                vec![reply(c, s, &[0])]
            } else {
                vec![reply(c, s, &sent)]
            }
        });
        let mut settings = session.settings().unwrap();
        assert!(settings.auto_record);
        assert!(!settings.auto_play);
        settings.auto_play = true;
        session.set_settings(&settings).unwrap();
    }

    #[test]
    fn desync_triggers_one_drain_and_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let (session, ops) = connected_with(0x10D6, 0xB00D, move |c, s, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                // Header-sized garbage with the wrong magic.
                vec![vec![0xDE; FRAME_HEADER_LEN]]
            } else {
                vec![reply(c, s, &info_body())]
            }
        });
        let info = session.device_info().unwrap();
        assert_eq!(info.firmware.to_string(), "1.2.3");
        let writes = ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| matches!(op, MockOp::Write { .. }))
            .count();
        assert_eq!(writes, 2);
    }

    #[test]
    fn disconnect_is_idempotent_and_commands_fail_afterwards() {
        let (session, _) = connected_with(0x10D6, 0xB00D, |c, s, _| vec![reply(c, s, &info_body())]);
        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        let err = session.device_info().unwrap_err();
        assert!(matches!(err, JensenError::NotConnected));
    }

    #[test]
    fn reset_device_state_keeps_session_usable() {
        let (session, ops) = connected_with(0x10D6, 0xB00D, |c, s, _| vec![reply(c, s, &info_body())]);
        session.reset_device_state().unwrap();
        let info = session.device_info().unwrap();
        assert_eq!(info.serial, "HD1E240500012345");
        // No retry happened, a single exchange sufficed after the reset.
        let writes = ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| matches!(op, MockOp::Write { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn connect_is_rejected_while_an_exchange_is_in_flight() {
        let mut mock = MockTransport::new(0x10D6, 0xB00D);
        mock.set_responder(|c, s, _| vec![reply(c, s, &info_body())]);
        mock.set_write_delay(Duration::from_millis(150));
        let opener = MockOpener::new(vec![(0x10D6, 0xB00D, mock)]);
        let session = Arc::new(DeviceSession::with_observer(
            test_config(0x10D6, 0xB00D),
            Arc::new(NullObserver),
        ));
        session.connect(&opener).unwrap();

        let worker = Arc::clone(&session);
        let handle = thread::spawn(move || worker.device_info().unwrap());
        thread::sleep(Duration::from_millis(40));
        let err = session.connect(&MockOpener::new(Vec::new())).unwrap_err();
        assert!(matches!(err, JensenError::DeviceBusy));
        handle.join().unwrap();
    }

    #[test]
    fn threaded_exchanges_never_interleave() {
        let mut mock = MockTransport::new(0x10D6, 0xB00D);
        mock.set_responder(|c, s, _| vec![reply(c, s, &info_body())]);
        mock.set_write_delay(Duration::from_millis(30));
        let ops = mock.ops_handle();
        let opener = MockOpener::new(vec![(0x10D6, 0xB00D, mock)]);
        let session = Arc::new(DeviceSession::with_observer(
            test_config(0x10D6, 0xB00D),
            Arc::new(NullObserver),
        ));
        session.connect(&opener).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let s = Arc::clone(&session);
                thread::spawn(move || s.device_info().unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let ops = ops.lock().unwrap();
        assert_eq!(ops.len(), 4);
        for pair in ops.chunks(2) {
            match (&pair[0], &pair[1]) {
                (MockOp::Write { sequence: w, .. }, MockOp::Read { sequence: r }) => {
                    assert_eq!(w, r)
                }
                other => panic!("interleaved operations: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn async_exchange_does_not_stall_the_executor() {
        let mut mock = MockTransport::new(0x10D6, 0xB00D);
        mock.set_responder(|c, s, _| vec![reply(c, s, &info_body())]);
        mock.set_write_delay(Duration::from_millis(300));
        let opener = MockOpener::new(vec![(0x10D6, 0xB00D, mock)]);
        let session = Arc::new(DeviceSession::with_observer(
            test_config(0x10D6, 0xB00D),
            Arc::new(NullObserver),
        ));
        session.connect(&opener).unwrap();

        // Single-threaded runtime: if the exchange ran inline it would
        // occupy the only executor thread for its full 300ms write.
        let worker = Arc::clone(&session);
        let exchange = tokio::spawn(async move { worker.device_info_async().await.unwrap() });

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let elapsed = started.elapsed();
        assert!(
            elapsed < Duration::from_millis(150),
            "timer starved for {elapsed:?}"
        );
        exchange.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_exchanges_never_interleave() {
        let mut mock = MockTransport::new(0x10D6, 0xB00D);
        mock.set_responder(|c, s, _| vec![reply(c, s, &info_body())]);
        mock.set_write_delay(Duration::from_millis(30));
        let ops = mock.ops_handle();
        let opener = MockOpener::new(vec![(0x10D6, 0xB00D, mock)]);
        let session = Arc::new(DeviceSession::with_observer(
            test_config(0x10D6, 0xB00D),
            Arc::new(NullObserver),
        ));
        session.connect(&opener).unwrap();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let s = Arc::clone(&session);
                tokio::spawn(async move { s.device_info_async().await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let ops = ops.lock().unwrap();
        assert_eq!(ops.len(), 4);
        for pair in ops.chunks(2) {
            match (&pair[0], &pair[1]) {
                (MockOp::Write { sequence: w, .. }, MockOp::Read { sequence: r }) => {
                    assert_eq!(w, r)
                }
                other => panic!("interleaved operations: {other:?}"),
            }
        }
    }
}
