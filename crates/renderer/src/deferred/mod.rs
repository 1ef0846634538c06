//! Deferred GPU operations.
//!
//! Mutations that must not race in-flight frames (buffer uploads, texture
//! uploads and layout transitions, texture pool growth, acceleration
//! structure builds, resource release) are queued into a calendar of
//! per-frame slots and recorded into a separate batch that the main batch
//! of the same frame waits on.
//!
//! - [`DeferredQueue`] - the calendar
//! - [`record_batch`] - rounds, barriers, and carry-over
//! - [`flush_current`] - one flush of the cursor slot
//! - [`VulkanSink`] - recording into a command buffer

pub mod op;
pub mod queue;
pub mod recorder;
pub mod vulkan;

pub use op::{
    AccelerationStructureBuild, BuildGeometry, DeferredKind, DeferredOp, GeometryData,
    ReleaseBundle, TransitionMasks, transition_masks,
};
pub use queue::{DeferredQueue, Rejected};
pub use recorder::{CommandSink, FlushOutcome, RecordOutcome, flush_current, record_batch};
pub use vulkan::VulkanSink;
