//! Jensen protocol constants for HiDock recorders.
//!
//! Command numbering follows the firmware's command table. Ids 14/15 are
//! acknowledge-only (the firmware confirms receipt with a zero-length body);
//! id 10 destabilizes the device when framed incorrectly and is blocked
//! unless explicitly enabled in the session config.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Actions Semiconductor vendor id used by first-generation HiDock units.
pub const HIDOCK_VENDOR_ID_LEGACY: u16 = 0x10D6;

/// Vendor id used by newer HiDock units.
pub const HIDOCK_VENDOR_ID: u16 = 0x3887;

pub const SUPPORTED_VENDOR_IDS: &[u16] = &[HIDOCK_VENDOR_ID_LEGACY, HIDOCK_VENDOR_ID];

// Legacy id scheme (vendor 0x10D6)
pub const H1_PRODUCT_ID: u16 = 0xB00C;
pub const H1E_PRODUCT_ID: u16 = 0xB00D;
pub const P1_PRODUCT_ID: u16 = 0xB00E;
pub const P1_MINI_PRODUCT_ID: u16 = 0xB00F;

// Alternate id scheme (vendor 0x3887)
pub const H1_ALT_PRODUCT_ID: u16 = 0xAF0C;
pub const H1E_ALT_PRODUCT_ID: u16 = 0xAF0D;
pub const P1_ALT_PRODUCT_ID: u16 = 0xAF0E;
pub const P1_MINI_ALT_PRODUCT_ID: u16 = 0xAF0F;

// ============================================================================
// Endpoints and Framing
// ============================================================================

/// Bulk OUT endpoint address.
pub const EP_OUT: u8 = 0x01;

/// Bulk IN endpoint address.
pub const EP_IN: u8 = 0x82;

/// Two-byte constant opening every frame in either direction.
pub const FRAME_MAGIC: [u8; 2] = [0x12, 0x34];

/// magic(2) + command(2) + sequence(4) + body length(4)
pub const FRAME_HEADER_LEN: usize = 12;

/// Upper bound on a declared body length. Anything larger means the byte
/// stream has desynchronized and the header fields are garbage.
pub const MAX_BODY_LEN: usize = 4 * 1024 * 1024;

/// Size passed to bulk IN reads.
pub const BULK_READ_LEN: usize = 4096;

// ============================================================================
// Command Catalog
// ============================================================================

pub const CMD_GET_DEVICE_INFO: u16 = 1;
pub const CMD_GET_DEVICE_TIME: u16 = 2;
pub const CMD_SET_DEVICE_TIME: u16 = 3;
pub const CMD_GET_FILE_LIST: u16 = 4;
pub const CMD_TRANSFER_FILE: u16 = 5;
pub const CMD_GET_FILE_COUNT: u16 = 6;
pub const CMD_DELETE_FILE: u16 = 7;
pub const CMD_REQUEST_FIRMWARE_UPGRADE: u16 = 8;
pub const CMD_FIRMWARE_UPLOAD: u16 = 9;

/// Known to wedge the recorder when sent with wrong framing. Never sent
/// unless `SessionConfig::allow_destructive` is set.
pub const CMD_DEVICE_MSG_TEST: u16 = 10;

pub const CMD_GET_SETTINGS: u16 = 11;
pub const CMD_SET_SETTINGS: u16 = 12;
pub const CMD_GET_FILE_BLOCK: u16 = 13;

/// Factory test hook. Reply is always a zero-length body.
pub const CMD_RECORD_TEST_START: u16 = 14;
/// Factory test hook. Reply is always a zero-length body.
pub const CMD_RECORD_TEST_END: u16 = 15;

pub const CMD_GET_CARD_INFO: u16 = 16;
pub const CMD_FORMAT_CARD: u16 = 17;
pub const CMD_GET_RECORDING_FILE: u16 = 18;
pub const CMD_RESTORE_FACTORY_SETTINGS: u16 = 19;
pub const CMD_SEND_MEETING_SCHEDULE: u16 = 20;
pub const CMD_TRANSFER_FILE_PARTIAL: u16 = 21;

pub const CMD_TONE_UPDATE_PREPARE: u16 = 22;
pub const CMD_TONE_UPDATE_UPLOAD: u16 = 23;
pub const CMD_UAC_UPDATE_PREPARE: u16 = 24;
pub const CMD_UAC_UPDATE_UPLOAD: u16 = 25;

// Realtime audio streaming (no model restriction)
pub const CMD_REALTIME_READ: u16 = 32;
pub const CMD_REALTIME_CONTROL: u16 = 33;
pub const CMD_REALTIME_TRANSFER: u16 = 34;

// Bluetooth commands (P1 family only)
pub const CMD_BT_SCAN: u16 = 4097;
pub const CMD_BT_SCAN_RESULT: u16 = 4098;
pub const CMD_BT_PAIR: u16 = 4099;
pub const CMD_BT_UNPAIR: u16 = 4100;
pub const CMD_BT_CONNECT: u16 = 4101;
pub const CMD_BT_DISCONNECT: u16 = 4102;
pub const CMD_BT_STATUS: u16 = 4103;
pub const CMD_BT_PROMPT_PLAY: u16 = 4104;

// ============================================================================
// Timeout Classes
// ============================================================================

/// Timeout class of a command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Small fixed-size request/reply (device info, time, settings, ...).
    Metadata,
    /// Multi-frame streaming transfers.
    Transfer,
    /// Long-running device-side work (format, factory reset, firmware).
    Maintenance,
}

pub fn command_class(command: u16) -> CommandClass {
    match command {
        CMD_TRANSFER_FILE
        | CMD_GET_FILE_BLOCK
        | CMD_TRANSFER_FILE_PARTIAL
        | CMD_GET_FILE_LIST
        | CMD_FIRMWARE_UPLOAD
        | CMD_TONE_UPDATE_UPLOAD
        | CMD_UAC_UPDATE_UPLOAD
        | CMD_REALTIME_TRANSFER => CommandClass::Transfer,
        CMD_FORMAT_CARD | CMD_RESTORE_FACTORY_SETTINGS | CMD_REQUEST_FIRMWARE_UPGRADE => {
            CommandClass::Maintenance
        }
        _ => CommandClass::Metadata,
    }
}

/// Fixed timeout for maintenance commands.
pub const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Adaptive timeout for a block transfer of `len` bytes.
///
/// 10 seconds base plus one second per 64 KiB, capped at two minutes.
pub fn transfer_timeout(len: usize) -> Duration {
    let extra = (len / (64 * 1024)) as u64;
    Duration::from_secs((10 + extra).min(120))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_classes() {
        assert_eq!(command_class(CMD_GET_DEVICE_INFO), CommandClass::Metadata);
        assert_eq!(command_class(CMD_GET_FILE_BLOCK), CommandClass::Transfer);
        assert_eq!(command_class(CMD_FORMAT_CARD), CommandClass::Maintenance);
        assert_eq!(command_class(CMD_BT_SCAN), CommandClass::Metadata);
    }

    #[test]
    fn transfer_timeout_scales_and_caps() {
        assert_eq!(transfer_timeout(0), Duration::from_secs(10));
        assert_eq!(transfer_timeout(128 * 1024), Duration::from_secs(12));
        assert_eq!(transfer_timeout(usize::MAX / 2), Duration::from_secs(120));
    }
}
