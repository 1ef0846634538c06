//! frameflow demo - Main Entry Point
//!
//! Opens a window, drives `Renderer::tick` once per redraw, streams
//! rotating instance transforms and periodically adds checkerboard
//! textures through the deferred upload path.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use glam::{Mat4, Quat, Vec3};
use tracing::{debug, error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use frameflow_core::{EngineConfig, FrameTimer};
use frameflow_platform::Window;
use frameflow_renderer::{RenderError, Renderer, TickStatus};

/// Instances drawn by the demo.
const INSTANCE_COUNT: usize = 64;
/// Textures the demo adds before it stops.
const DEMO_TEXTURES: u32 = 12;
/// Frames between two texture additions.
const TEXTURE_INTERVAL: u64 = 90;

#[derive(Parser, Debug)]
#[command(name = "frameflow", version, about = "Deferred GPU work scheduler demo")]
struct Args {
    /// Engine configuration file (TOML). Missing files use the defaults.
    #[arg(short, long, default_value = "frameflow.toml")]
    config: PathBuf,

    /// Close after this many presented frames.
    #[arg(long)]
    frames: Option<u64>,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,
}

struct App {
    args: Args,
    config: EngineConfig,
    window: Option<Window>,
    renderer: Option<Renderer>,
    timer: FrameTimer,
    started: Instant,
    exit_code: i32,
}

impl App {
    fn new(args: Args, config: EngineConfig) -> Self {
        Self {
            args,
            config,
            window: None,
            renderer: None,
            timer: FrameTimer::new(Duration::from_secs(2)),
            started: Instant::now(),
            exit_code: 0,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: &RenderError) {
        error!("Render error: {}", err);
        self.exit_code = err.exit_code();
        self.renderer = None;
        event_loop.exit();
    }

    /// Streams new per-frame data into the renderer.
    fn feed(&mut self) -> Result<(), RenderError> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };

        let transforms = instance_transforms(self.started.elapsed().as_secs_f32());
        renderer.upload_instances(&transforms)?;

        let frame = renderer.frames_elapsed();
        let added = renderer.texture_count() as u32;
        if frame % TEXTURE_INTERVAL == 0 && added < DEMO_TEXTURES {
            let size = 32 << (added % 4);
            let pixels = checkerboard(size, added);
            let id = renderer.add_texture(&pixels, size, size, 1)?;
            debug!("Demo texture {} queued ({}x{})", id, size, size);
        }
        Ok(())
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        if let Err(err) = self.feed() {
            if err.is_recoverable() {
                warn!("Upload deferred to a later frame: {}", err);
            } else {
                self.fail(event_loop, &err);
                return;
            }
        }

        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        match renderer.tick() {
            Ok(TickStatus::Continue) => {
                if let Some(report) = self.timer.frame() {
                    info!(
                        "{:.1} fps ({:.2} ms), {} textures, {} deferred op(s) pending",
                        report.fps,
                        report.mean_frame_ms,
                        renderer.texture_count(),
                        renderer.pending_ops()
                    );
                }
                if self
                    .args
                    .frames
                    .is_some_and(|limit| renderer.frames_elapsed() >= limit)
                {
                    info!("Frame limit reached");
                    renderer.request_close();
                }
            }
            Ok(TickStatus::Skipped) => {}
            Ok(TickStatus::Closed) => {
                info!("Shutting down after {} frames", renderer.frames_elapsed());
                self.renderer = None;
                event_loop.exit();
            }
            Err(err) if err.is_recoverable() => warn!("Frame skipped: {}", err),
            Err(err) => self.fail(event_loop, &err),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match Window::new(event_loop, "frameflow", self.args.width, self.args.height)
        {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to create window: {}", e);
                self.exit_code = 3;
                event_loop.exit();
                return;
            }
        };

        match Renderer::new(&window, self.config.clone()) {
            Ok(renderer) => {
                info!("Initialization complete, entering main loop");
                self.renderer = Some(renderer);
                self.window = Some(window);
            }
            Err(e) => {
                error!("Failed to create renderer: {}", e);
                self.exit_code = e.exit_code();
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                match self.renderer.as_mut() {
                    Some(renderer) => renderer.request_close(),
                    None => event_loop.exit(),
                }
            }
            WindowEvent::Resized(size) => {
                debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.on_resize();
                }
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

/// A grid of cubes spinning about their own axes.
fn instance_transforms(seconds: f32) -> Vec<Mat4> {
    let side = (INSTANCE_COUNT as f32).sqrt().ceil() as usize;
    (0..INSTANCE_COUNT)
        .map(|i| {
            let (x, z) = ((i % side) as f32, (i / side) as f32);
            let offset = (side as f32 - 1.0) * 0.5;
            let spin = Quat::from_axis_angle(
                Vec3::new(x + 1.0, 1.0, z + 1.0).normalize(),
                seconds * (0.5 + i as f32 * 0.05),
            );
            Mat4::from_scale_rotation_translation(
                Vec3::splat(0.6),
                spin,
                Vec3::new((x - offset) * 1.5, 0.0, (z - offset) * 1.5),
            )
        })
        .collect()
}

/// RGBA8 checkerboard of `size x size` texels, tinted by `seed`.
fn checkerboard(size: u32, seed: u32) -> Vec<u8> {
    let tint = [
        (seed * 67 % 256) as u8,
        (seed * 137 % 256) as u8,
        (seed * 211 % 256) as u8,
        255,
    ];
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            if ((x / 8) + (y / 8)) % 2 == 0 {
                pixels.extend_from_slice(&tint);
            } else {
                pixels.extend_from_slice(&[16, 16, 16, 255]);
            }
        }
    }
    pixels
}

fn main() -> Result<()> {
    frameflow_core::init_logging();
    let args = Args::parse();
    info!("Starting frameflow");

    let config = EngineConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(args, config);
    event_loop.run_app(&mut app)?;

    if app.exit_code != 0 {
        std::process::exit(app.exit_code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkerboard_matches_texture_size() {
        for size in [32, 64, 256] {
            assert_eq!(checkerboard(size, 3).len(), (size * size * 4) as usize);
        }
    }

    #[test]
    fn test_instance_grid_is_centered() {
        let transforms = instance_transforms(0.0);
        assert_eq!(transforms.len(), INSTANCE_COUNT);
        let center: Vec3 = transforms
            .iter()
            .map(|m| m.w_axis.truncate())
            .sum::<Vec3>()
            / INSTANCE_COUNT as f32;
        assert!(center.length() < 1e-4);
    }

    #[test]
    fn test_args_default_config_path() {
        let args = Args::parse_from(["frameflow"]);
        assert_eq!(args.config, PathBuf::from("frameflow.toml"));
        assert_eq!(args.frames, None);
    }
}
