//! nusb-based USB transport implementation.

use std::io::{Read, Write};
use std::time::Duration;

use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{TransportError, TransportOpener, UsbTransport};
use crate::model::KNOWN_DEVICE_IDS;
use crate::protocol::constants::{EP_IN, EP_OUT, SUPPORTED_VENDOR_IDS};

/// nusb-based bulk transport over one claimed HiDock interface.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open a device with a specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    /// Open the first attached device in the known HiDock id table.
    #[instrument(level = "info")]
    pub fn open_any() -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            let ids = (device_info.vendor_id(), device_info.product_id());
            if KNOWN_DEVICE_IDS.contains(&ids) {
                return Self::open_device_info(device_info);
            }
        }

        Err(TransportError::DeviceNotFound {
            vid: SUPPORTED_VENDOR_IDS[0],
            pid: 0,
        })
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        // Find the bulk endpoint pair. The documented addresses are OUT 0x01
        // and IN 0x82; when the descriptors differ (firmware variants), take
        // the first bulk endpoint in each direction instead.
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != 0 {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() != nusb::descriptors::TransferType::Bulk {
                            continue;
                        }
                        let addr = ep.address();
                        if ep.direction() == nusb::transfer::Direction::In {
                            if in_endpoint == 0 || addr == EP_IN {
                                in_endpoint = addr;
                            }
                        } else if out_endpoint == 0 || addr == EP_OUT {
                            out_endpoint = addr;
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                direction: "IN".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                direction: "OUT".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
        })
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(4096);
        writer
            .write_all(data)
            .map_err(|e| map_pipe_error(e, 0))
            .map_err(|e| match e {
                TransportError::Io(inner) => TransportError::WriteFailed(inner.to_string()),
                other => other,
            })?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len, timeout_ms = timeout.as_millis() as u64))]
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        // Bound the blocking read so a wedged device that sends nothing
        // cannot hang the caller past its deadline.
        let mut reader = ep.reader(4096).with_read_timeout(timeout);
        let mut buf = vec![0u8; max_len];

        let n = reader
            .read(&mut buf)
            .map_err(|e| map_pipe_error(e, timeout.as_millis() as u64))
            .map_err(|e| match e {
                TransportError::Io(inner) => TransportError::ReadFailed(inner.to_string()),
                other => other,
            })?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn is_connected(&self) -> bool {
        // nusb has no direct liveness check; the next transfer reports a
        // disconnect instead.
        true
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

/// Classify I/O errors whose kind carries protocol meaning.
fn map_pipe_error(e: std::io::Error, timeout_ms: u64) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe => TransportError::Stall,
        std::io::ErrorKind::NotConnected => TransportError::Disconnected,
        std::io::ErrorKind::TimedOut => TransportError::Timeout { timeout_ms },
        _ => TransportError::Io(e),
    }
}

/// Production opener backed by nusb enumeration.
pub struct NusbOpener;

impl TransportOpener for NusbOpener {
    fn open(&self, vid: u16, pid: u16) -> Result<Box<dyn UsbTransport>, TransportError> {
        Ok(Box::new(NusbTransport::open_with_ids(vid, pid)?))
    }

    fn list_attached(&self) -> Result<Vec<(u16, u16)>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        Ok(devices
            .map(|d| (d.vendor_id(), d.product_id()))
            .collect())
    }
}
