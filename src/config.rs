//! Composer configuration
//!
//! Tunables for the composition core. The defaults reproduce the values the
//! display engine was validated with; deployments override individual fields
//! from a TOML file.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    /// Bounded wait for the windowing server's disconnect acknowledgment,
    /// in milliseconds.
    pub disconnect_ack_timeout_ms: u64,

    /// Refresh rate assumed by the software vsync fallback until a panel
    /// mode is known, in Hz.
    pub fallback_refresh_hz: u32,

    /// Number of overlay buffers kept in the posting pool.
    pub buffer_pool_size: usize,

    /// Overlay brightness offset (signed, applied to luma).
    pub brightness: i8,

    /// Overlay contrast multiplier, 6.2 fixed point.
    pub contrast: u32,

    /// Overlay saturation multiplier, 7.3 fixed point.
    pub saturation: u32,

    /// Destination colour key value.
    pub color_key: u32,

    /// Destination colour key channel mask; zero disables keying.
    pub color_key_mask: u32,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            disconnect_ack_timeout_ms: 300,
            fallback_refresh_hz: 60,
            buffer_pool_size: 3,
            brightness: -19,
            contrast: 0x4b,
            saturation: 0x92,
            color_key: 0,
            color_key_mask: 0,
        }
    }
}

impl ComposerConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a TOML file, falling back to defaults if the file is
    /// missing or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("config load failed ({}), using defaults", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = ComposerConfig::default();
        assert_eq!(config.disconnect_ack_timeout_ms, 300);
        assert_eq!(config.fallback_refresh_hz, 60);
        assert_eq!(config.contrast, 0x4b);
        assert_eq!(config.brightness, -19);
    }

    #[test]
    fn test_partial_override() {
        let config: ComposerConfig =
            toml::from_str("disconnect_ack_timeout_ms = 150\n").unwrap();
        assert_eq!(config.disconnect_ack_timeout_ms, 150);
        // untouched fields keep their defaults
        assert_eq!(config.fallback_refresh_hz, 60);
        assert_eq!(config.saturation, 0x92);
    }
}
