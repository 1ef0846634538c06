//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document (or no file at all)
//! yields a working configuration:
//!
//! ```toml
//! frames_in_flight = 2
//! deferred_queue_depth = 16
//! deferred_slot_capacity = 16
//! max_record_rounds = 8
//! # fence_timeout_ns = 2_000_000_000
//! max_textures = 65536
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Tunables for the frame scheduler, deferred queue, and resource arenas.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Number of calendar slots in the deferred operation queue.
    pub deferred_queue_depth: usize,
    /// Fixed number of operations a single slot can hold.
    pub deferred_slot_capacity: usize,
    /// Maximum delay rounds recorded into one deferred batch.
    pub max_record_rounds: u32,
    /// Bound on frame fence waits. `None` waits forever.
    pub fence_timeout_ns: Option<u64>,
    /// Texture table capacity before device limits are applied.
    pub max_textures: u32,
    /// Size of the first texture memory pool.
    pub initial_texture_pool_bytes: u64,
    /// Clear color of the main pass.
    pub clear_color: [f32; 4],
    /// Enable the Khronos validation layer.
    pub validation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            deferred_queue_depth: 16,
            deferred_slot_capacity: 16,
            max_record_rounds: 8,
            fence_timeout_ns: None,
            max_textures: 65536,
            initial_texture_pool_bytes: 16 * 1024 * 1024,
            clear_color: [0.02, 0.02, 0.03, 1.0],
            validation: cfg!(debug_assertions),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(source) => {
                let config = Self::from_toml_str(&source)?;
                info!("Loaded engine config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::Config("frames_in_flight must be at least 1".into()));
        }
        if self.deferred_queue_depth == 0 {
            return Err(Error::Config("deferred_queue_depth must be at least 1".into()));
        }
        if self.deferred_slot_capacity == 0 {
            return Err(Error::Config(
                "deferred_slot_capacity must be at least 1".into(),
            ));
        }
        if self.max_record_rounds == 0 {
            return Err(Error::Config("max_record_rounds must be at least 1".into()));
        }
        if self.max_textures == 0 {
            return Err(Error::Config("max_textures must be at least 1".into()));
        }
        if self.fence_timeout_ns == Some(0) {
            return Err(Error::Config(
                "fence_timeout_ns of 0 would never wait; omit it to wait forever".into(),
            ));
        }
        Ok(())
    }

    /// Fence wait bound in nanoseconds, `u64::MAX` when unbounded.
    #[inline]
    pub fn fence_timeout(&self) -> u64 {
        self.fence_timeout_ns.unwrap_or(u64::MAX)
    }

    /// Fence wait bound as a `Duration`, if any.
    pub fn fence_timeout_duration(&self) -> Option<Duration> {
        self.fence_timeout_ns.map(Duration::from_nanos)
    }

    /// Largest `sub_delay` the deferred queue accepts.
    #[inline]
    pub fn max_sub_delay(&self) -> u32 {
        let depth = u32::try_from(self.deferred_queue_depth).unwrap_or(u32::MAX);
        self.max_record_rounds
            .saturating_mul(depth)
            .saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.fence_timeout(), u64::MAX);
    }

    #[test]
    fn test_partial_document_overrides_fields() {
        let config = EngineConfig::from_toml_str(
            "frames_in_flight = 3\nfence_timeout_ns = 1000000\nclear_color = [1.0, 0.0, 0.0, 1.0]",
        )
        .unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.fence_timeout(), 1_000_000);
        assert_eq!(
            config.fence_timeout_duration(),
            Some(Duration::from_millis(1))
        );
        assert_eq!(config.clear_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.deferred_queue_depth, 16);
    }

    #[test]
    fn test_zero_values_rejected() {
        for doc in [
            "frames_in_flight = 0",
            "deferred_queue_depth = 0",
            "deferred_slot_capacity = 0",
            "max_record_rounds = 0",
            "max_textures = 0",
            "fence_timeout_ns = 0",
        ] {
            let err = EngineConfig::from_toml_str(doc).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{doc}: {err}");
        }
    }

    #[test]
    fn test_unknown_key_is_parse_error() {
        let err = EngineConfig::from_toml_str("frames_in_flite = 2").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = EngineConfig::load("/nonexistent/frameflow.toml").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_max_sub_delay() {
        let config = EngineConfig::default();
        assert_eq!(config.max_sub_delay(), 8 * 16 - 1);
    }

    #[test]
    fn test_max_sub_delay_saturates_on_huge_depth() {
        let config = EngineConfig {
            deferred_queue_depth: usize::MAX,
            ..EngineConfig::default()
        };
        assert_eq!(config.max_sub_delay(), u32::MAX - 1);
    }

    #[test]
    fn test_documented_example_waits_forever() {
        let source = "frames_in_flight = 2\n\
                      deferred_queue_depth = 16\n\
                      deferred_slot_capacity = 16\n\
                      max_record_rounds = 8\n\
                      # fence_timeout_ns = 2_000_000_000\n\
                      max_textures = 65536\n";
        let config = EngineConfig::from_toml_str(source).unwrap();
        assert_eq!(config.fence_timeout_ns, None);
        assert_eq!(config.fence_timeout(), u64::MAX);
    }
}
