//! Host configuration.
//!
//! The defaults ship as `host.toml` next to the crate manifest and are embedded at build time.
//! Firmware that wants different values parses its own TOML with [HostConfig::from_toml].

use lazy_static::lazy_static;
use serde::Deserialize;
use thiserror::Error;

use crate::ehci::regs::USBCMD_ITC_SHIFT;

/// The USB 2.0 limit on tiers: the root port's device is tier 1, and at most five hubs may sit
/// between the host and any device.
pub const USB_MAX_TIER: u8 = 7;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// How many times a failed enumeration request is re-issued before giving up on the device.
    pub enumeration_retries: u8,
    /// USBCMD interrupt threshold, in microframes.
    pub interrupt_threshold: u8,
    /// Polling interval of hub status-change pipes, in frames.
    pub hub_interval: u8,
    /// Deepest tier a device may be enumerated at.
    pub max_tier: u8,
    /// Bound on the controller reset performed by `begin`.
    pub reset_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            enumeration_retries: 3,
            interrupt_threshold: 1,
            hub_interval: 32,
            max_tier: USB_MAX_TIER,
            reset_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse host config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid host config: {0}")]
    Invalid(&'static str),
}

impl HostConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: HostConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.interrupt_threshold.is_power_of_two() || self.interrupt_threshold > 64 {
            return Err(ConfigError::Invalid(
                "interrupt_threshold must be 1, 2, 4, 8, 16, 32 or 64",
            ));
        }
        if self.hub_interval == 0 {
            return Err(ConfigError::Invalid("hub_interval must be at least one frame"));
        }
        if self.max_tier == 0 || self.max_tier > USB_MAX_TIER {
            return Err(ConfigError::Invalid("max_tier must be within 1..=7"));
        }
        Ok(())
    }

    /// The ITC field value for USBCMD.
    pub(crate) fn itc_bits(&self) -> u32 {
        u32::from(self.interrupt_threshold) << USBCMD_ITC_SHIFT
    }
}

lazy_static! {
    pub static ref DEFAULT_CONFIG: HostConfig = {
        const TOML: &str = include_str!("../host.toml");

        HostConfig::from_toml(TOML).expect("Failed to parse internally embedded host config")
    };
}
