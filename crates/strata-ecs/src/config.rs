//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::chunk::CHUNK_ALIGN;
use crate::EcsError;

/// Default chunk byte budget (16 KiB).
pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;

/// Smallest accepted chunk byte budget.
pub const MIN_CHUNK_BYTES: usize = 64;

/// Tunables of a [`World`](crate::world::World).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Byte budget of every chunk. Record capacity is derived from it per
    /// archetype.
    pub chunk_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), EcsError> {
        if self.chunk_bytes < MIN_CHUNK_BYTES {
            return Err(EcsError::InvalidConfig {
                reason: format!(
                    "chunk_bytes {} is below the minimum of {MIN_CHUNK_BYTES}",
                    self.chunk_bytes
                ),
            });
        }
        if self.chunk_bytes % CHUNK_ALIGN != 0 {
            return Err(EcsError::InvalidConfig {
                reason: format!(
                    "chunk_bytes {} is not a multiple of {CHUNK_ALIGN}",
                    self.chunk_bytes
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_small_or_unaligned_budgets() {
        assert!(StoreConfig { chunk_bytes: 32 }.validate().is_err());
        assert!(StoreConfig { chunk_bytes: 100 }.validate().is_err());
        assert!(StoreConfig { chunk_bytes: 128 }.validate().is_ok());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: StoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StoreConfig::default());
        let config: StoreConfig = serde_json::from_str(r#"{"chunk_bytes": 4096}"#).unwrap();
        assert_eq!(config.chunk_bytes, 4096);
    }
}
