//! [`CommandSink`] over a Vulkan command buffer.

use ash::vk;
use frameflow_rhi::command::CommandBuffer;
use frameflow_rhi::device::Device;
use frameflow_rhi::image::{COLOR_LAYERS, COLOR_RANGE};
use tracing::warn;

use super::op::{AccelerationStructureBuild, DeferredKind, DeferredOp, ReleaseBundle, TransitionMasks};
use super::queue::DeferredQueue;
use super::recorder::CommandSink;
use crate::error::{DeferredError, RenderResult};

/// Enqueues `op` `delay` flushes ahead and returns its slot.
///
/// A rejected cleanup idles the graphics queue before its resources drop,
/// since work already submitted may still use them.
pub(crate) fn enqueue_or_release(
    device: &Device,
    queue: &mut DeferredQueue,
    op: DeferredOp,
    delay: usize,
) -> RenderResult<usize> {
    match queue.enqueue(op, delay) {
        Ok(slot) => Ok(slot),
        Err(rejected) => {
            if let DeferredKind::Cleanup(bundle) = rejected.op.kind {
                warn!(
                    "Cleanup of {} resource(s) could not be queued, releasing after idle",
                    bundle.len()
                );
                device.wait_queue_idle()?;
                drop(bundle);
            }
            Err(rejected.error.into())
        }
    }
}

/// Records deferred ops into a primary command buffer in the recording state.
///
/// Cleanup bundles are collected, not dropped; the owner keeps them until
/// the fence of the submission carrying this buffer has signaled.
pub struct VulkanSink<'a> {
    cmd: &'a CommandBuffer,
    acceleration_structure: Option<&'a ash::khr::acceleration_structure::Device>,
    released: Vec<ReleaseBundle>,
}

impl<'a> VulkanSink<'a> {
    pub fn new(
        cmd: &'a CommandBuffer,
        acceleration_structure: Option<&'a ash::khr::acceleration_structure::Device>,
    ) -> Self {
        Self {
            cmd,
            acceleration_structure,
            released: Vec::new(),
        }
    }

    /// Bundles handed over while recording.
    pub fn into_released(self) -> Vec<ReleaseBundle> {
        self.released
    }
}

impl CommandSink for VulkanSink<'_> {
    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) {
        self.cmd.copy_buffer(src, dst, std::slice::from_ref(&region));
    }

    fn copy_buffer_to_image(&mut self, src: vk::Buffer, dst: vk::Image, region: vk::BufferImageCopy) {
        self.cmd.copy_buffer_to_image(
            src,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&region),
        );
    }

    fn copy_image(&mut self, src: vk::Image, dst: vk::Image, extent: vk::Extent3D) {
        let region = vk::ImageCopy::default()
            .src_subresource(COLOR_LAYERS)
            .dst_subresource(COLOR_LAYERS)
            .extent(extent);
        self.cmd.copy_image(
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&region),
        );
    }

    fn image_barrier(
        &mut self,
        images: &[vk::Image],
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        masks: TransitionMasks,
    ) {
        let barriers: Vec<vk::ImageMemoryBarrier> = images
            .iter()
            .map(|&image| {
                vk::ImageMemoryBarrier::default()
                    .image(image)
                    .old_layout(old)
                    .new_layout(new)
                    .src_access_mask(masks.src_access)
                    .dst_access_mask(masks.dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(COLOR_RANGE)
            })
            .collect();
        self.cmd
            .pipeline_barrier(masks.src_stage, masks.dst_stage, &barriers);
    }

    fn round_barrier(&mut self) {
        self.cmd.memory_barrier(
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        );
    }

    fn build_acceleration_structure(
        &mut self,
        build: &AccelerationStructureBuild,
    ) -> Result<(), DeferredError> {
        let loader = self
            .acceleration_structure
            .ok_or(DeferredError::AccelerationStructuresUnsupported)?;

        let (geometries, ranges) = build.to_vk();
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(build.ty)
            .flags(build.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(build.dst)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: build.scratch,
            });

        unsafe {
            loader.cmd_build_acceleration_structures(
                self.cmd.handle(),
                std::slice::from_ref(&info),
                &[&ranges[..]],
            );
        }
        Ok(())
    }

    fn release(&mut self, bundle: ReleaseBundle) {
        self.released.push(bundle);
    }
}
