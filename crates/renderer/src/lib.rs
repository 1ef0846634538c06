//! Frame scheduling and deferred GPU work.
//!
//! This crate drives the per-frame loop:
//! - Frame slots with N frames in flight
//! - A calendar queue of deferred GPU operations, flushed once per frame
//! - Growable buffers and a bindless texture table fed through that queue

pub mod arena;
pub mod deferred;
pub mod error;
pub mod frame_manager;
pub mod mesh;
pub mod renderer;
pub mod texture;

pub use arena::{ArenaCapacity, BUFFER_UPLOAD_OPS, GrowableBuffer, Growth, Staged, buffer_upload_ops};
pub use deferred::{
    AccelerationStructureBuild, DeferredKind, DeferredOp, DeferredQueue, ReleaseBundle,
};
pub use error::{DeferredError, RenderError, RenderResult, TickStatus};
pub use frame_manager::{FrameManager, FrameSlot};
pub use mesh::CubeMesh;
pub use renderer::{DrawContext, Renderer};
pub use texture::{
    GROWTH_OPS, SEQUENCE_ROUNDS, TextureArena, TextureTable, UPLOAD_OPS, growth_ops,
    texture_upload_ops,
};
