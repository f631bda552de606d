//! USB transport: backend resolution, trait, nusb and mock implementations.

pub mod backend;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use backend::{ResolvedBackend, resolve};
pub use mock::{MockOp, MockOpener, MockTransport};
pub use nusb::{NusbOpener, NusbTransport};
pub use traits::{TransportError, TransportOpener, UsbTransport};
