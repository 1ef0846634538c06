//! Frame scheduler and resource front-end.
//!
//! This module provides the [`Renderer`] struct, which owns every Vulkan
//! object of the engine and drives one frame per [`Renderer::tick`]:
//!
//! ```text
//! WaitRetire -> Acquire -> (Recreate, skip) -> Record main -> FlushDeferred?
//!            -> SubmitMain -> Present -> Advance
//! ```

use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use glam::Mat4;
use tracing::{debug, error, info};

use frameflow_core::EngineConfig;
use frameflow_platform::{Surface, Window};
use frameflow_rhi::RhiError;
use frameflow_rhi::buffer::BufferUsage;
use frameflow_rhi::command::CommandBuffer;
use frameflow_rhi::device::Device;
use frameflow_rhi::instance::Instance;
use frameflow_rhi::physical_device::select_physical_device;
use frameflow_rhi::rendering::{ColorPass, attachment_transition};
use frameflow_rhi::swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
use frameflow_rhi::sync::Fence;

use crate::arena::{BUFFER_UPLOAD_OPS, GrowableBuffer, Growth, Staged, buffer_upload_ops};
use crate::deferred::vulkan::enqueue_or_release;
use crate::deferred::{
    AccelerationStructureBuild, DeferredKind, DeferredOp, DeferredQueue, ReleaseBundle,
    VulkanSink, flush_current,
};
use crate::error::{DeferredError, RenderError, RenderResult, TickStatus};
use crate::frame_manager::FrameManager;
use crate::mesh::{CUBE_INDICES, CUBE_VERTICES, CubeMesh};
use crate::texture::TextureTable;

/// What a draw callback may record into the main pass.
///
/// The command buffer is inside dynamic rendering on the acquired image.
pub struct DrawContext<'a> {
    pub cmd: &'a CommandBuffer,
    pub extent: vk::Extent2D,
    pub frame_index: usize,
    pub image_index: u32,
    /// Bindless texture array of this frame (binding 0).
    pub texture_set: vk::DescriptorSet,
    pub texture_set_layout: vk::DescriptorSetLayout,
    pub cube: &'a CubeMesh,
    pub instance_buffer: vk::Buffer,
    pub instance_count: u32,
}

/// State of the flush tracking fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushTracking {
    Idle,
    /// The next deferred submission signals the fence.
    Armed,
    /// A deferred submission carrying the fence is pending.
    Submitted,
}

/// Renderer owning the device, swapchain, frame slots, deferred queue and
/// resource arenas.
///
/// # Resource Destruction Order
///
/// 1. Wait for the device to go idle
/// 2. Drop unexecuted deferred ops
/// 3. Textures, instance and cube buffers
/// 4. Frame slots (releasing retired bundles), flush fence
/// 5. Swapchain, device, surface, instance
///
/// ManuallyDrop is used to enforce this order.
pub struct Renderer {
    config: EngineConfig,
    window: Window,
    deferred: DeferredQueue,

    textures: ManuallyDrop<TextureTable>,
    instances: ManuallyDrop<GrowableBuffer<Mat4>>,
    cube: ManuallyDrop<CubeMesh>,
    frames: ManuallyDrop<FrameManager>,
    flush_fence: ManuallyDrop<Fence>,
    swapchain: ManuallyDrop<Swapchain>,
    device: ManuallyDrop<Arc<Device>>,
    surface: ManuallyDrop<Surface>,
    instance: ManuallyDrop<Instance>,

    flush_tracking: FlushTracking,
    framebuffer_resized: bool,
    close_requested: bool,
    frames_elapsed: u64,
}

impl Renderer {
    /// Creates a renderer presenting into `window`.
    ///
    /// Uploads the cube mesh through the deferred queue; it is resident once
    /// the first flushed frame retires.
    pub fn new(window: &Window, config: EngineConfig) -> RenderResult<Self> {
        let deferred = DeferredQueue::from_config(&config)?;
        let extent = window.framebuffer_extent();
        info!(
            "Initializing frameflow renderer ({}x{})",
            extent.width, extent.height
        );

        let extensions = window
            .surface_extensions()
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;
        let instance = Instance::new(config.validation, &extensions)?;
        let surface = window
            .create_surface(instance.entry(), instance.handle())
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;

        let gpu = select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &gpu)?;
        let swapchain = Swapchain::new(&instance, device.clone(), surface.handle(), extent)?;

        let frames = FrameManager::new(
            device.clone(),
            config.frames_in_flight,
            config.fence_timeout(),
        )?;
        let textures = TextureTable::new(
            device.clone(),
            frames.frames_in_flight(),
            config.max_textures,
            config.initial_texture_pool_bytes,
        )?;
        let instances = GrowableBuffer::new(device.clone(), BufferUsage::Instance)?;
        let cube = CubeMesh::new(device.clone())?;
        let flush_fence = Fence::new(device.clone(), false)?;

        info!(
            "Renderer initialized: {} swapchain images, {} frames in flight, {} deferred slots of {}",
            swapchain.image_count(),
            frames.frames_in_flight(),
            config.deferred_queue_depth,
            config.deferred_slot_capacity
        );

        let mut renderer = Self {
            config,
            window: window.clone(),
            deferred,
            textures: ManuallyDrop::new(textures),
            instances: ManuallyDrop::new(instances),
            cube: ManuallyDrop::new(cube),
            frames: ManuallyDrop::new(frames),
            flush_fence: ManuallyDrop::new(flush_fence),
            swapchain: ManuallyDrop::new(swapchain),
            device: ManuallyDrop::new(device),
            surface: ManuallyDrop::new(surface),
            instance: ManuallyDrop::new(instance),
            flush_tracking: FlushTracking::Idle,
            framebuffer_resized: false,
            close_requested: false,
            frames_elapsed: 0,
        };
        renderer.upload_cube()?;
        Ok(renderer)
    }

    fn upload_cube(&mut self) -> RenderResult<()> {
        upload(&mut self.cube.vertices, &CUBE_VERTICES, &mut self.deferred)?;
        upload(&mut self.cube.indices, &CUBE_INDICES, &mut self.deferred)
    }

    // =========================================================================
    // Frame loop
    // =========================================================================

    /// Renders one frame that only clears.
    pub fn tick(&mut self) -> RenderResult<TickStatus> {
        self.tick_with(|_| {})
    }

    /// Renders one frame, letting `draw` record into the main pass.
    ///
    /// Returns [`TickStatus::Skipped`] when the swapchain had to be recreated
    /// or the window is minimized, and [`TickStatus::Closed`] once
    /// [`request_close`](Self::request_close) was called.
    ///
    /// A deferred batch that fails to record, or carried ops that no longer
    /// fit, are reported as an error after the frame has been presented.
    pub fn tick_with<F>(&mut self, draw: F) -> RenderResult<TickStatus>
    where
        F: FnOnce(&DrawContext<'_>),
    {
        if self.close_requested {
            self.device.wait_idle()?;
            self.frames.release_all_retired();
            info!("Renderer closed after {} frames", self.frames_elapsed);
            return Ok(TickStatus::Closed);
        }

        // WaitRetire
        self.frames.wait_for_frame()?;

        let window_extent = self.window.framebuffer_extent();
        if window_extent.width == 0 || window_extent.height == 0 {
            return Ok(TickStatus::Skipped);
        }
        if self.framebuffer_resized {
            debug!("Resize pending, recreating swapchain before acquire");
            self.recreate_swapchain()?;
        }

        // Acquire
        match self.frames.acquire_next_image(&self.swapchain)? {
            AcquireOutcome::OutOfDate => {
                debug!("Swapchain out of date during acquire, recreating");
                self.recreate_swapchain()?;
                return Ok(TickStatus::Skipped);
            }
            AcquireOutcome::Image { suboptimal, .. } => {
                if suboptimal {
                    debug!("Acquired image from a suboptimal swapchain");
                }
            }
        }

        let frame_index = self.frames.current_frame_index();
        self.textures.apply_pending_writes(frame_index);

        self.record_main(frame_index, draw)?;
        let (flushed, deferred_failure) = self.flush_deferred()?;
        self.frames.submit_main(flushed)?;

        // Present
        let presented = self.frames.present(&self.swapchain)?;
        self.frames.next_frame();
        self.frames_elapsed += 1;

        if matches!(presented, PresentOutcome::NeedsRecreate) || self.framebuffer_resized {
            debug!("Recreating swapchain after present");
            self.recreate_swapchain()?;
        }

        // The frame is complete; the slot and its semaphores are consistent.
        if let Some(e) = deferred_failure {
            return Err(e);
        }
        Ok(TickStatus::Continue)
    }

    fn record_main<F>(&self, frame_index: usize, draw: F) -> RenderResult<()>
    where
        F: FnOnce(&DrawContext<'_>),
    {
        let image_index = self.frames.image_index();
        let (image, view) = self.swapchain.image(image_index)?;
        let extent = self.swapchain.extent();

        let cmd = self.frames.begin_main()?;

        let (src, dst, barrier) =
            attachment_transition(image, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        cmd.pipeline_barrier(src, dst, std::slice::from_ref(&barrier));

        let pass = ColorPass::new(view, extent, self.config.clear_color);
        cmd.begin_rendering(&pass.info());
        draw(&DrawContext {
            cmd,
            extent,
            frame_index,
            image_index,
            texture_set: self.textures.descriptor_set(frame_index),
            texture_set_layout: self.textures.set_layout(),
            cube: &self.cube,
            instance_buffer: self.instances.handle(),
            instance_count: self.instances.len() as u32,
        });
        cmd.end_rendering();

        let (src, dst, barrier) = attachment_transition(image, vk::ImageLayout::PRESENT_SRC_KHR);
        cmd.pipeline_barrier(src, dst, std::slice::from_ref(&barrier));
        Ok(())
    }

    /// Records and submits the current slot's deferred batch, if any, then
    /// rotates the calendar.
    ///
    /// Returns whether a batch was submitted, plus a failure to report once
    /// the frame has been presented.
    fn flush_deferred(&mut self) -> RenderResult<(bool, Option<RenderError>)> {
        if self.deferred.current_len() == 0 {
            self.deferred.advance();
            return Ok((false, None));
        }

        let cmd = self.frames.begin_deferred()?.clone();
        let mut sink = VulkanSink::new(&cmd, self.device.acceleration_structure());
        let flushed = flush_current(
            &mut self.deferred,
            self.config.max_record_rounds,
            &mut sink,
        );
        let released = sink.into_released();

        let outcome = match flushed {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Deferred batch abandoned: {}", e);
                self.device.wait_queue_idle()?;
                drop(released);
                return Ok((false, Some(e.into())));
            }
        };

        let extra_fence = if self.flush_tracking == FlushTracking::Armed {
            self.flush_tracking = FlushTracking::Submitted;
            Some(self.flush_fence.handle())
        } else {
            None
        };
        self.frames.submit_deferred(released, extra_fence)?;
        Ok((true, outcome.overflow.map(RenderError::from)))
    }

    fn recreate_swapchain(&mut self) -> RenderResult<()> {
        let extent = self.window.framebuffer_extent();
        if extent.width == 0 || extent.height == 0 {
            debug!("Window minimized, postponing swapchain recreation");
            self.framebuffer_resized = true;
            return Ok(());
        }

        self.swapchain.recreate(extent)?;
        self.frames.recreate_semaphores()?;
        self.framebuffer_resized = false;
        info!("Swapchain recreated: {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Marks the swapchain for recreation on the next tick.
    pub fn on_resize(&mut self) {
        debug!("Resize notified");
        self.framebuffer_resized = true;
    }

    /// Makes the next tick idle the device and return
    /// [`TickStatus::Closed`].
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    // =========================================================================
    // Deferred operations
    // =========================================================================

    /// Queues `op` to be recorded `delay` flushes from now. Returns the slot.
    pub fn enqueue(&mut self, op: DeferredOp, delay: usize) -> RenderResult<usize> {
        if matches!(op.kind, DeferredKind::AccelerationStructureBuild(_))
            && self.device.acceleration_structure().is_none()
        {
            return Err(DeferredError::AccelerationStructuresUnsupported.into());
        }
        enqueue_or_release(&self.device, &mut self.deferred, op, delay)
    }

    pub fn enqueue_copy(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
        delay: usize,
    ) -> RenderResult<usize> {
        self.enqueue(
            DeferredOp::new(0, DeferredKind::CopyBufferToBuffer { src, dst, region }),
            delay,
        )
    }

    pub fn enqueue_layout_transition(
        &mut self,
        image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        delay: usize,
    ) -> RenderResult<usize> {
        self.enqueue(
            DeferredOp::new(
                0,
                DeferredKind::LayoutTransition {
                    images: vec![image],
                    old,
                    new,
                },
            ),
            delay,
        )
    }

    pub fn enqueue_acceleration_structure_build(
        &mut self,
        build: AccelerationStructureBuild,
        delay: usize,
    ) -> RenderResult<usize> {
        self.enqueue(
            DeferredOp::new(0, DeferredKind::AccelerationStructureBuild(build)),
            delay,
        )
    }

    /// Hands `resources` to the batch recorded `delay` flushes from now; they
    /// drop once that batch's frame slot retires.
    pub fn enqueue_cleanup(&mut self, resources: ReleaseBundle, delay: usize) -> RenderResult<usize> {
        self.enqueue(DeferredOp::new(0, DeferredKind::Cleanup(resources)), delay)
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Replaces the instance transforms.
    ///
    /// The device buffer holds them once the next flushed batch retires.
    pub fn upload_instances(&mut self, instances: &[Mat4]) -> RenderResult<()> {
        upload(&mut self.instances, instances, &mut self.deferred)
    }

    /// Adds an RGBA8 texture of `width x height x depth` texels.
    pub fn add_texture(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        depth: u32,
    ) -> RenderResult<u32> {
        self.textures
            .add(&mut self.deferred, pixels, width, height, depth)
    }

    /// Makes the next deferred submission signal the tracking fence.
    pub fn track_next_flush(&mut self) -> RenderResult<()> {
        match self.flush_tracking {
            FlushTracking::Armed => return Ok(()),
            FlushTracking::Submitted => self.flush_fence.wait(self.config.fence_timeout())?,
            FlushTracking::Idle => {}
        }
        self.flush_fence.reset()?;
        self.flush_tracking = FlushTracking::Armed;
        Ok(())
    }

    /// Waits for the tracked deferred submission to retire.
    ///
    /// Returns `false` when no tracked submission was made yet.
    pub fn wait_tracked_flush(&mut self) -> RenderResult<bool> {
        if self.flush_tracking != FlushTracking::Submitted {
            return Ok(false);
        }
        self.flush_fence.wait(self.config.fence_timeout())?;
        self.flush_tracking = FlushTracking::Idle;
        Ok(true)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Frames submitted and presented so far.
    pub fn frames_elapsed(&self) -> u64 {
        self.frames_elapsed
    }

    /// Index of the frame slot the next tick uses.
    pub fn current_frame(&self) -> usize {
        self.frames.current_frame_index()
    }

    /// Deferred ops waiting across all slots.
    pub fn pending_ops(&self) -> usize {
        self.deferred.pending()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn instance_capacity(&self) -> usize {
        self.instances.capacity()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain.format()
    }

    pub fn supports_acceleration_structures(&self) -> bool {
        self.device.acceleration_structure().is_some()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Stages `data` for `buffer` and queues the copy and the staging release.
///
/// Growth purges queued copies naming the old device buffer. Each upload
/// owns its staging buffer, so no earlier flush has to retire first.
fn upload<T: Pod>(
    buffer: &mut GrowableBuffer<T>,
    data: &[T],
    deferred: &mut DeferredQueue,
) -> RenderResult<()> {
    if deferred.remaining(0) < BUFFER_UPLOAD_OPS {
        return Err(DeferredError::SlotFull {
            slot: deferred.cursor(),
            capacity: deferred.slot_capacity(),
        }
        .into());
    }

    let old = buffer.handle();
    if let Growth::Grew { .. } = buffer.ensure_capacity(data.len())? {
        let discarded = deferred.discard_buffer_ops(old);
        if discarded > 0 {
            debug!(
                "Purged {} stale op(s) of the {} buffer",
                discarded,
                buffer.usage().name()
            );
        }
    }

    if let Some(Staged { buffer: staging, region }) = buffer.stage(data)? {
        let src = staging.handle();
        let release = ReleaseBundle::new().with("staging buffer", staging);
        for op in buffer_upload_ops(src, buffer.handle(), region, release) {
            deferred
                .enqueue(op, 0)
                .map_err(|rejected| RenderError::from(rejected.error))?;
        }
    }
    Ok(())
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!(
                "Failed to wait for device idle during renderer drop: {:?}",
                e
            );
        }

        let pending = self.deferred.drain_all();
        if !pending.is_empty() {
            debug!("Dropping {} unexecuted deferred op(s)", pending.len());
        }
        drop(pending);

        unsafe {
            ManuallyDrop::drop(&mut self.textures);
            ManuallyDrop::drop(&mut self.instances);
            ManuallyDrop::drop(&mut self.cube);
            ManuallyDrop::drop(&mut self.frames);
            ManuallyDrop::drop(&mut self.flush_fence);
            ManuallyDrop::drop(&mut self.swapchain);
            ManuallyDrop::drop(&mut self.device);
            ManuallyDrop::drop(&mut self.surface);
            ManuallyDrop::drop(&mut self.instance);
        }

        info!("Renderer destroyed");
    }
}
