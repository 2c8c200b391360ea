//! Programming policy: retry bounds, verification, fuse order and timings.
use std::{collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    device::FuseCategory,
    error::{Error, Result},
    transport::Prescaler,
};

/// Extended first, lock last: writing lock bits can block further fuse writes.
pub const DEFAULT_FUSE_ORDER: [FuseCategory; 4] = [
    FuseCategory::Extended,
    FuseCategory::High,
    FuseCategory::Low,
    FuseCategory::Lock,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgrammingConfig {
    pub prescaler: Prescaler,
    /// Reset-and-enable attempts before giving up on the target.
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u32,
    /// Extra attempts per page after the first one failed.
    pub page_retries: u32,
    /// Read back every written page before the normal fuses go in.
    pub verify: bool,
    /// Read back every fuse after writing it.
    pub verify_fuses: bool,
    pub fuse_order: [FuseCategory; 4],
    /// Value of untouched bytes in a partially filled page.
    pub pad_byte: u8,
    pub reset_settle_ms: u32,
    pub erase_delay_ms: u32,
    pub page_write_delay_ms: u32,
    pub fuse_write_delay_ms: u32,
}

impl Default for ProgrammingConfig {
    fn default() -> Self {
        ProgrammingConfig {
            prescaler: Prescaler::Div128,
            connect_attempts: 3,
            connect_retry_delay_ms: 50,
            page_retries: 3,
            verify: true,
            verify_fuses: true,
            fuse_order: DEFAULT_FUSE_ORDER,
            pad_byte: 0x00,
            reset_settle_ms: 20,
            erase_delay_ms: 10,
            page_write_delay_ms: 5,
            fuse_write_delay_ms: 5,
        }
    }
}

impl ProgrammingConfig {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_attempts == 0 {
            return Err(Error::Config("connect_attempts must be at least 1".into()));
        }
        let distinct: HashSet<_> = self.fuse_order.iter().collect();
        if distinct.len() != FuseCategory::ALL.len() {
            return Err(Error::Config(format!(
                "fuse_order must name every category once, got {:?}",
                self.fuse_order
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProgrammingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fuse_order[3], FuseCategory::Lock);
        assert_eq!(config.page_retries, 3);
        assert_eq!(config.connect_attempts, 3);
    }

    #[test]
    fn test_partial_yaml() {
        let config = ProgrammingConfig::from_yaml(
            "prescaler: div16\nverify: false\nfuse_order: [lock, low, high, extended]\n",
        )
        .unwrap();
        assert_eq!(config.prescaler, Prescaler::Div16);
        assert!(!config.verify);
        assert_eq!(config.fuse_order[0], FuseCategory::Lock);
        assert_eq!(config.pad_byte, 0x00);
    }

    #[test]
    fn test_reject_bad_order() {
        let err = ProgrammingConfig::from_yaml("fuse_order: [lock, lock, high, extended]\n");
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_reject_unknown_field() {
        let err = ProgrammingConfig::from_yaml("retries: 5\n");
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
