//! Frame-in-flight slots and their submission protocol.
//!
//! This module provides the [`FrameManager`] struct, which owns one
//! [`FrameSlot`] per frame in flight and drives the queue operations of a
//! tick:
//!
//! - Waiting for a slot to retire, then releasing what its batches freed
//! - Swapchain image acquisition and presentation
//! - Submitting the deferred batch and the main batch with the right
//!   semaphore dependencies
//!
//! # Synchronization Flow
//!
//! ```text
//! 1. Wait on in_flight (the slot's previous batches retired)
//! 2. Acquire swapchain image (signals image_available)
//! 3. Record the main command buffer
//! 4. If deferred work is due: submit the deferred buffer,
//!    signaling deferred_finished
//! 5. Submit the main buffer:
//!    - Wait on image_available (COLOR_ATTACHMENT_OUTPUT)
//!    - Wait on deferred_finished (ALL_COMMANDS) if step 4 ran
//!    - Signal render_finished and in_flight
//! 6. Present (waits on render_finished)
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, trace};

use frameflow_rhi::RhiResult;
use frameflow_rhi::command::{CommandBuffer, CommandPool};
use frameflow_rhi::device::Device;
use frameflow_rhi::swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
use frameflow_rhi::sync::FrameSync;

use crate::deferred::ReleaseBundle;

/// Resources of one frame in flight.
pub struct FrameSlot {
    sync: FrameSync,
    /// Primary buffer holding the render pass.
    main: CommandBuffer,
    /// Primary buffer holding this slot's deferred batch.
    deferred: CommandBuffer,
    /// Released by the last deferred batch of this slot; dropped once
    /// `in_flight` is waited on again.
    retired: Vec<ReleaseBundle>,
}

impl FrameSlot {
    #[inline]
    pub fn sync(&self) -> &FrameSync {
        &self.sync
    }

    #[inline]
    pub fn main_command_buffer(&self) -> &CommandBuffer {
        &self.main
    }

    #[inline]
    pub fn deferred_command_buffer(&self) -> &CommandBuffer {
        &self.deferred
    }

    /// Bundles waiting for this slot to retire.
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }
}

/// Semaphores and stages the main batch waits on.
///
/// The deferred batch may write anything the main batch reads, so its
/// semaphore is waited at `ALL_COMMANDS`.
pub fn main_batch_waits(
    image_available: vk::Semaphore,
    deferred_finished: Option<vk::Semaphore>,
) -> (Vec<vk::Semaphore>, Vec<vk::PipelineStageFlags>) {
    let mut semaphores = vec![image_available];
    let mut stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
    if let Some(deferred) = deferred_finished {
        semaphores.push(deferred);
        stages.push(vk::PipelineStageFlags::ALL_COMMANDS);
    }
    (semaphores, stages)
}

/// Manages the frame-in-flight slots.
///
/// Not thread-safe; it is driven from the render thread only.
pub struct FrameManager {
    device: Arc<Device>,
    frames: Vec<FrameSlot>,
    // Declared after the slots: the pool frees their command buffers.
    command_pool: CommandPool,
    current_frame: usize,
    image_index: u32,
    fence_timeout: u64,
}

impl FrameManager {
    /// Creates `frames_in_flight` slots, each with two command buffers from a
    /// shared pool on the graphics family.
    ///
    /// `fence_timeout` bounds every fence wait, in nanoseconds.
    pub fn new(device: Arc<Device>, frames_in_flight: usize, fence_timeout: u64) -> RhiResult<Self> {
        let frames_in_flight = frames_in_flight.max(1);
        let command_pool = CommandPool::new(device.clone(), device.queue_families().graphics)?;
        let handles = command_pool.allocate_command_buffers(2 * frames_in_flight as u32)?;

        let mut frames = Vec::with_capacity(frames_in_flight);
        for (i, pair) in handles.chunks_exact(2).enumerate() {
            frames.push(FrameSlot {
                sync: FrameSync::new(device.clone())?,
                main: CommandBuffer::from_handle(device.clone(), pair[0]),
                deferred: CommandBuffer::from_handle(device.clone(), pair[1]),
                retired: Vec::new(),
            });
            debug!("Created frame slot {}", i);
        }

        info!(
            "Frame manager created with {} frames in flight",
            frames_in_flight
        );

        Ok(Self {
            device,
            frames,
            command_pool,
            current_frame: 0,
            image_index: 0,
            fence_timeout,
        })
    }

    #[inline]
    pub fn current_frame(&self) -> &FrameSlot {
        &self.frames[self.current_frame]
    }

    #[inline]
    pub fn current_frame_index(&self) -> usize {
        self.current_frame
    }

    /// Swapchain image acquired by the last successful acquire.
    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn fence_timeout(&self) -> u64 {
        self.fence_timeout
    }

    /// Blocks until the current slot's previous batches retired, then drops
    /// the resources they released.
    ///
    /// Must be called before recording into the slot's command buffers.
    pub fn wait_for_frame(&mut self) -> RhiResult<()> {
        let frame = &mut self.frames[self.current_frame];
        frame.sync.in_flight().wait(self.fence_timeout)?;

        if !frame.retired.is_empty() {
            let bundles = std::mem::take(&mut frame.retired);
            let items: usize = bundles.iter().map(ReleaseBundle::len).sum();
            debug!(
                "Frame {} retired: releasing {} resource(s) from {} bundle(s)",
                self.current_frame,
                items,
                bundles.len()
            );
        }
        Ok(())
    }

    /// Acquires the next swapchain image, signaling the slot's
    /// `image_available` semaphore.
    pub fn acquire_next_image(&mut self, swapchain: &Swapchain) -> RhiResult<AcquireOutcome> {
        let frame = &self.frames[self.current_frame];
        let outcome = swapchain.acquire_next_image(frame.sync.image_available().handle())?;
        if let AcquireOutcome::Image { index, .. } = outcome {
            self.image_index = index;
        }
        Ok(outcome)
    }

    /// Resets and begins the current slot's main command buffer.
    pub fn begin_main(&self) -> RhiResult<&CommandBuffer> {
        let cmd = &self.frames[self.current_frame].main;
        cmd.reset()?;
        cmd.begin()?;
        Ok(cmd)
    }

    /// Resets and begins the current slot's deferred command buffer.
    pub fn begin_deferred(&self) -> RhiResult<&CommandBuffer> {
        let cmd = &self.frames[self.current_frame].deferred;
        cmd.reset()?;
        cmd.begin()?;
        Ok(cmd)
    }

    /// Ends and submits the deferred buffer, signaling `deferred_finished`
    /// and, when given, `extra_fence`.
    ///
    /// `released` is kept until this slot retires.
    pub fn submit_deferred(
        &mut self,
        released: Vec<ReleaseBundle>,
        extra_fence: Option<vk::Fence>,
    ) -> RhiResult<()> {
        let frame = &mut self.frames[self.current_frame];
        frame.retired.extend(released);
        frame.deferred.end()?;

        let command_buffers = [frame.deferred.handle()];
        let signal_semaphores = [frame.sync.deferred_finished().handle()];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.submit_graphics(
                std::slice::from_ref(&submit_info),
                extra_fence.unwrap_or(vk::Fence::null()),
            )?;
        }

        trace!("Submitted deferred batch for frame {}", self.current_frame);
        Ok(())
    }

    /// Ends the main buffer, resets the slot fence and submits.
    ///
    /// `waits_on_deferred` adds the `deferred_finished` wait; pass `true`
    /// only when [`submit_deferred`](Self::submit_deferred) ran this tick.
    pub fn submit_main(&self, waits_on_deferred: bool) -> RhiResult<()> {
        let frame = &self.frames[self.current_frame];
        frame.main.end()?;

        let (wait_semaphores, wait_stages) = main_batch_waits(
            frame.sync.image_available().handle(),
            waits_on_deferred.then(|| frame.sync.deferred_finished().handle()),
        );
        let signal_semaphores = [frame.sync.render_finished().handle()];
        let command_buffers = [frame.main.handle()];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // Reset only once we are sure to submit, or the next wait would hang.
        frame.sync.in_flight().reset()?;
        unsafe {
            self.device.submit_graphics(
                std::slice::from_ref(&submit_info),
                frame.sync.in_flight().handle(),
            )?;
        }
        Ok(())
    }

    /// Presents the acquired image once `render_finished` signals.
    pub fn present(&self, swapchain: &Swapchain) -> RhiResult<PresentOutcome> {
        let frame = &self.frames[self.current_frame];
        swapchain.present(
            self.device.present_queue(),
            self.image_index,
            frame.sync.render_finished().handle(),
        )
    }

    /// Advances to the next slot.
    pub fn next_frame(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.frames.len();
    }

    /// Replaces the acquire and present semaphores of every slot.
    ///
    /// Called after swapchain recreation, with the device idle.
    pub fn recreate_semaphores(&mut self) -> RhiResult<()> {
        for (i, frame) in self.frames.iter_mut().enumerate() {
            frame.sync.recreate_semaphores(self.device.clone())?;
            debug!("Reset semaphores for frame {}", i);
        }
        info!("Reset all frame semaphores");
        Ok(())
    }

    /// Drops every retired bundle. The device must be idle.
    pub fn release_all_retired(&mut self) {
        for frame in &mut self.frames {
            frame.retired.clear();
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }
}
