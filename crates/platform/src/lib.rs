//! Windowing for the frameflow renderer.
//!
//! A winit window plus the Vulkan surface and instance extensions it needs.

mod window;

pub use window::{Surface, Window};

pub use winit::event::WindowEvent;
pub use winit::event_loop::{ActiveEventLoop, EventLoop};
