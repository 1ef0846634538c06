//! Dynamic rendering helpers (Vulkan 1.3).
//!
//! The main pass renders into one swapchain image with no depth attachment:
//! [`ColorPass`] holds the attachment info with the lifetimes that
//! `VkRenderingInfo` borrows, and [`attachment_transition`] produces the two
//! barriers that bracket the pass.
//!
//! # Example
//!
//! ```no_run
//! use frameflow_rhi::command::CommandBuffer;
//! use frameflow_rhi::rendering::{ColorPass, attachment_transition};
//! use frameflow_rhi::vk;
//!
//! # fn example(image: vk::Image, view: vk::ImageView, cmd: &CommandBuffer) {
//! let (src, dst, barrier) = attachment_transition(image, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
//! cmd.pipeline_barrier(src, dst, &[barrier]);
//!
//! let pass = ColorPass::new(view, vk::Extent2D { width: 800, height: 600 }, [0.0, 0.0, 0.0, 1.0]);
//! cmd.begin_rendering(&pass.info());
//! cmd.end_rendering();
//! # }
//! ```

use ash::vk;

use crate::image::COLOR_RANGE;

/// A single cleared color attachment covering the whole render area.
#[derive(Clone, Copy)]
pub struct ColorPass {
    attachments: [vk::RenderingAttachmentInfo<'static>; 1],
    render_area: vk::Rect2D,
}

impl ColorPass {
    pub fn new(view: vk::ImageView, extent: vk::Extent2D, clear_color: [f32; 4]) -> Self {
        let attachment = vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            });

        Self {
            attachments: [attachment],
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
        }
    }

    /// `VkRenderingInfo` borrowing this pass.
    pub fn info(&self) -> vk::RenderingInfo<'_> {
        vk::RenderingInfo::default()
            .render_area(self.render_area)
            .layer_count(1)
            .color_attachments(&self.attachments)
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.render_area.extent
    }
}

impl std::fmt::Debug for ColorPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ClearColorValue is a union; the pass always writes float32.
        let clear = unsafe { self.attachments[0].clear_value.color.float32 };
        f.debug_struct("ColorPass")
            .field("view", &self.attachments[0].image_view)
            .field("extent", &self.render_area.extent)
            .field("clear_color", &clear)
            .finish()
    }
}

/// Barrier moving a swapchain image into `new_layout`.
///
/// `COLOR_ATTACHMENT_OPTIMAL` discards the previous contents (the pass
/// clears anyway); `PRESENT_SRC_KHR` makes attachment writes visible to the
/// presentation engine. Returns `(src_stage, dst_stage, barrier)`.
pub fn attachment_transition(
    image: vk::Image,
    new_layout: vk::ImageLayout,
) -> (
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
    vk::ImageMemoryBarrier<'static>,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .image(image)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(COLOR_RANGE)
        .new_layout(new_layout);

    if new_layout == vk::ImageLayout::PRESENT_SRC_KHR {
        (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            barrier
                .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .dst_access_mask(vk::AccessFlags::empty()),
        )
    } else {
        (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            barrier
                .old_layout(vk::ImageLayout::UNDEFINED)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_pass_clears_and_stores() {
        let pass = ColorPass::new(
            vk::ImageView::null(),
            vk::Extent2D {
                width: 640,
                height: 480,
            },
            [0.1, 0.2, 0.3, 1.0],
        );
        let info = pass.info();
        assert_eq!(info.color_attachment_count, 1);
        assert_eq!(info.layer_count, 1);
        assert_eq!(info.render_area.extent.width, 640);
        assert_eq!(pass.attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(pass.attachments[0].store_op, vk::AttachmentStoreOp::STORE);
        let clear = unsafe { pass.attachments[0].clear_value.color.float32 };
        assert_eq!(clear, [0.1, 0.2, 0.3, 1.0]);
    }

    #[test]
    fn test_attachment_transition_into_render() {
        let (src, dst, barrier) = attachment_transition(
            vk::Image::null(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(src, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dst, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            barrier.dst_access_mask,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn test_attachment_transition_to_present() {
        let (_, dst, barrier) =
            attachment_transition(vk::Image::null(), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(dst, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert_eq!(
            barrier.old_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            barrier.src_access_mask,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
    }
}
