//! USB transport abstraction.
//!
//! The `UsbTransport` trait is the seam between the protocol layers and the
//! actual USB stack, allowing a production nusb implementation and a mock
//! for unit testing. A transport handle is exclusively owned by one session
//! and never shared.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("failed to open device: {0}")]
    OpenFailed(String),

    #[error("failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("bulk {direction} endpoint not found")]
    EndpointNotFound { direction: String },

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    /// Endpoint stall. The firmware answers unknown command ids this way,
    /// distinguishable from a supported command with an empty reply.
    #[error("endpoint stalled")]
    Stall,

    #[error("device disconnected")]
    Disconnected,

    #[error("transport timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bulk-transfer capability over one opened device.
pub trait UsbTransport: Send {
    /// Write raw bytes to the OUT endpoint.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` raw bytes from the IN endpoint, blocking at
    /// most `timeout`. A device that sends nothing yields
    /// [`TransportError::Timeout`] when the timeout elapses, so a caller's
    /// deadline is always enforceable. A short read is normal; framing is
    /// reassembled above this layer.
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;
}

/// Opens transports and enumerates attached devices. The seam that makes
/// connection fallback logic testable without hardware.
pub trait TransportOpener {
    fn open(&self, vid: u16, pid: u16) -> Result<Box<dyn UsbTransport>, TransportError>;

    /// (vendor, product) pairs of every attached device.
    fn list_attached(&self) -> Result<Vec<(u16, u16)>, TransportError>;
}
