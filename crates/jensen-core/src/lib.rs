//! Device-communication core for HiDock audio recorders.
//!
//! Talks the vendor binary protocol over USB bulk transfer: a framed
//! request/response scheme with sequence-number correlation, streaming
//! replies for file listings and transfers, and a catalog of typed
//! operations from device info to firmware upload.
//!
//! The crate never touches the filesystem or any UI; file data is handed
//! to caller-provided sinks and progress flows through the
//! [`events::DeviceObserver`] trait. Transports are abstracted behind
//! [`transport::UsbTransport`], with a [nusb](https://docs.rs/nusb) backend
//! for real hardware and a mock for tests.

pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod model;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::SessionConfig;
pub use error::{JensenError, Result};
pub use events::{ConnectionState, DeviceEvent, DeviceObserver, NullObserver, TracingObserver};
pub use model::DeviceModel;
pub use protocol::listing::{FileEntry, FileListing};
pub use protocol::time::DeviceTime;
pub use session::{
    BtDevice, BtStatus, ConnectionReport, DeviceInfo, DeviceSession, DeviceSettings, StorageInfo,
    Version,
};
pub use transport::{NusbOpener, NusbTransport, TransportError, TransportOpener, UsbTransport};
