//! Renderer error types and tick results.

use ash::vk;
use frameflow_rhi::RhiError;
use thiserror::Error;

/// Failures of the deferred queue and recorder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeferredError {
    /// The target calendar slot already holds `capacity` operations.
    #[error("Deferred slot {slot} is full ({capacity} operations)")]
    SlotFull { slot: usize, capacity: usize },

    /// A slot or round delay beyond what the queue can represent.
    #[error("Deferred delay {delay} exceeds the maximum of {max}")]
    DelayOutOfRange { delay: u32, max: u32 },

    /// The layout pair has no barrier mapping.
    #[error("Unsupported layout transition {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    /// Ops carried past the round limit did not fit in the next slot.
    ///
    /// The frame still completes; the carried ops are dropped and any
    /// resources they held are released with the flushed batch.
    #[error("{lost} carried deferred operation(s) did not fit in slot {slot} ({capacity} operations)")]
    CarryOverflow {
        slot: usize,
        capacity: usize,
        lost: usize,
    },

    /// An acceleration-structure build reached a device without the extension.
    #[error("Acceleration structures are not supported by this device")]
    AccelerationStructuresUnsupported,
}

/// Top-level renderer error.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Rhi(RhiError),

    #[error(transparent)]
    Deferred(#[from] DeferredError),

    #[error(transparent)]
    Config(#[from] frameflow_core::Error),

    #[error("Texture table is full ({max} textures)")]
    TextureTableFull { max: u32 },

    #[error("Texture data has {actual} bytes, expected {expected}")]
    InvalidTextureData { expected: usize, actual: usize },

    #[error("Capacity request of {requested} elements overflows")]
    CapacityOverflow { requested: usize },

    #[error("Frame fence did not signal within {timeout_ns} ns")]
    FenceTimeout { timeout_ns: u64 },
}

impl From<RhiError> for RenderError {
    fn from(err: RhiError) -> Self {
        match err {
            RhiError::FenceTimeout { timeout_ns } => Self::FenceTimeout { timeout_ns },
            other => Self::Rhi(other),
        }
    }
}

impl From<vk::Result> for RenderError {
    fn from(err: vk::Result) -> Self {
        Self::Rhi(RhiError::from(err))
    }
}

impl RenderError {
    /// The renderer is still usable and the caller may retry on a later tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Deferred(DeferredError::SlotFull { .. }) | Self::InvalidTextureData { .. }
        )
    }

    /// Capacity limits or memory ran out.
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            Self::TextureTableFull { .. }
            | Self::CapacityOverflow { .. }
            | Self::Deferred(DeferredError::DelayOutOfRange { .. })
            | Self::Deferred(DeferredError::CarryOverflow { .. }) => true,
            Self::Rhi(RhiError::VulkanError(result)) => matches!(
                *result,
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY
            ),
            Self::Rhi(RhiError::AllocatorError(_)) => true,
            _ => false,
        }
    }

    /// Process exit code: 1 recoverable, 2 resource exhaustion, 3 fatal.
    ///
    /// `0` is reserved for a clean run (see [`TickStatus::exit_code`]).
    pub fn exit_code(&self) -> i32 {
        if self.is_recoverable() {
            1
        } else if self.is_resource_exhaustion() {
            2
        } else {
            3
        }
    }
}

/// Outcome of one scheduler tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickStatus {
    /// A frame was submitted and presented.
    Continue,
    /// Nothing was rendered this tick (out-of-date swapchain or minimized
    /// window); the next tick retries.
    Skipped,
    /// A close was requested and the device is idle.
    Closed,
}

impl TickStatus {
    pub fn exit_code(self) -> i32 {
        0
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

/// Result type for renderer operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;
