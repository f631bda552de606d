//! HiDock model identification.

use std::fmt;

use crate::protocol::constants::*;

/// Recorder model, derived from the USB id pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    H1,
    H1e,
    P1,
    P1Mini,
}

impl DeviceModel {
    /// Map a (vendor, product) pair to a model, covering both the legacy
    /// and the alternate id schemes.
    pub fn from_ids(vid: u16, pid: u16) -> Option<Self> {
        if !SUPPORTED_VENDOR_IDS.contains(&vid) {
            return None;
        }
        match pid {
            H1_PRODUCT_ID | H1_ALT_PRODUCT_ID => Some(Self::H1),
            H1E_PRODUCT_ID | H1E_ALT_PRODUCT_ID => Some(Self::H1e),
            P1_PRODUCT_ID | P1_ALT_PRODUCT_ID => Some(Self::P1),
            P1_MINI_PRODUCT_ID | P1_MINI_ALT_PRODUCT_ID => Some(Self::P1Mini),
            _ => None,
        }
    }

    /// The Bluetooth command range (4097..=4104) exists only on the P1
    /// family.
    pub fn supports_bluetooth(&self) -> bool {
        matches!(self, Self::P1 | Self::P1Mini)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::H1 => "HiDock H1",
            Self::H1e => "HiDock H1E",
            Self::P1 => "HiDock P1",
            Self::P1Mini => "HiDock P1 mini",
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every id pair the fallback scan accepts.
pub const KNOWN_DEVICE_IDS: &[(u16, u16)] = &[
    (HIDOCK_VENDOR_ID_LEGACY, H1_PRODUCT_ID),
    (HIDOCK_VENDOR_ID_LEGACY, H1E_PRODUCT_ID),
    (HIDOCK_VENDOR_ID_LEGACY, P1_PRODUCT_ID),
    (HIDOCK_VENDOR_ID_LEGACY, P1_MINI_PRODUCT_ID),
    (HIDOCK_VENDOR_ID, H1_ALT_PRODUCT_ID),
    (HIDOCK_VENDOR_ID, H1E_ALT_PRODUCT_ID),
    (HIDOCK_VENDOR_ID, P1_ALT_PRODUCT_ID),
    (HIDOCK_VENDOR_ID, P1_MINI_ALT_PRODUCT_ID),
];
