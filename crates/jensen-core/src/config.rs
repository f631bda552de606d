//! Session configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::{H1E_ALT_PRODUCT_ID, HIDOCK_VENDOR_ID};

/// Configuration for a device session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Selected vendor id.
    pub vendor_id: u16,
    /// Selected product id.
    pub product_id: u16,
    /// Reset device-side state before the first command exchange. Recovers
    /// from a previous ungraceful disconnect.
    pub force_reset: bool,
    /// Timeout for metadata commands, in milliseconds.
    pub command_timeout_ms: u64,
    /// Base timeout for streaming transfers, in milliseconds.
    pub transfer_timeout_ms: u64,
    /// Permit commands flagged as destabilizing (command 10).
    pub allow_destructive: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: HIDOCK_VENDOR_ID,
            product_id: H1E_ALT_PRODUCT_ID,
            force_reset: false,
            command_timeout_ms: 5_000,
            transfer_timeout_ms: 30_000,
            allow_destructive: false,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_roundtrip() {
        let config = SessionConfig {
            vendor_id: 0x10D6,
            product_id: 0xB00D,
            force_reset: true,
            allow_destructive: false,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.vendor_id, 0x10D6);
        assert_eq!(back.product_id, 0xB00D);
        assert!(back.force_reset);
        assert!(!back.allow_destructive);
    }
}
