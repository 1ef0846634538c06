//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! Thin RAII wrappers over `ash` handles:
//! - Instance, physical device selection, and logical device creation
//! - Swapchain management
//! - Command pools and command buffer recording
//! - Buffers and images backed by gpu-allocator
//! - Descriptor pools and layouts
//! - Semaphores and fences

mod error;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod rendering;
pub mod swapchain;
pub mod sync;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
