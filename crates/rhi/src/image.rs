//! Sampled images, the memory blocks they are bound into, and samplers.
//!
//! Texture images do not own memory. Many of them are bound at offsets
//! inside one [`MemoryBlock`], which lets the renderer size texture memory
//! independently of the number of images.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use frameflow_rhi::device::Device;
//! use frameflow_rhi::image::{MemoryBlock, SampledImage};
//!
//! # fn example(device: Arc<Device>) -> Result<(), frameflow_rhi::RhiError> {
//! let extent = vk::Extent3D { width: 64, height: 64, depth: 1 };
//! let mut image = SampledImage::new(device.clone(), extent, vk::Format::R8G8B8A8_UNORM)?;
//! let requirements = image.memory_requirements();
//! let block = MemoryBlock::new(device, "textures", requirements)?;
//! image.bind(&block, 0)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Subresource range covering the single mip and layer of a color image.
pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Subresource layers matching [`COLOR_RANGE`], for copy regions.
pub const COLOR_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// 2D for a depth of one, 3D otherwise.
pub fn image_kind(extent: vk::Extent3D) -> (vk::ImageType, vk::ImageViewType) {
    if extent.depth > 1 {
        (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D)
    } else {
        (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D)
    }
}

/// A device allocation that images are bound into.
pub struct MemoryBlock {
    device: Arc<Device>,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    name: &'static str,
}

impl MemoryBlock {
    /// Allocates device-local memory satisfying `requirements`.
    pub fn new(
        device: Arc<Device>,
        name: &'static str,
        requirements: vk::MemoryRequirements,
    ) -> RhiResult<Self> {
        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        debug!("Allocated {} memory block: {} bytes", name, requirements.size);

        Ok(Self {
            device,
            allocation: Some(allocation),
            size: requirements.size,
            name,
        })
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn binding(&self) -> RhiResult<(vk::DeviceMemory, vk::DeviceSize)> {
        let allocation = self.allocation.as_ref().ok_or_else(|| {
            RhiError::InvalidHandle(format!("{} memory block already freed", self.name))
        })?;
        Ok(unsafe { (allocation.memory(), allocation.offset()) })
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.device.allocator().free(allocation)
        {
            error!("Failed to free {} memory block: {:?}", self.name, e);
        }
        debug!("Freed {} memory block: {} bytes", self.name, self.size);
    }
}

/// An optimal-tiling color image usable as a transfer source, transfer
/// destination, and sampled texture.
///
/// The view is created by [`bind`](Self::bind), since a view requires bound
/// memory.
pub struct SampledImage {
    device: Arc<Device>,
    image: vk::Image,
    view: vk::ImageView,
    extent: vk::Extent3D,
    format: vk::Format,
}

impl SampledImage {
    pub fn new(device: Arc<Device>, extent: vk::Extent3D, format: vk::Format) -> RhiResult<Self> {
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            return Err(RhiError::InvalidHandle(format!(
                "image extent must be non-zero, got {}x{}x{}",
                extent.width, extent.height, extent.depth
            )));
        }

        let (image_type, _) = image_kind(extent);
        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&image_info, None)? };

        Ok(Self {
            device,
            image,
            view: vk::ImageView::null(),
            extent,
            format,
        })
    }

    pub fn memory_requirements(&self) -> vk::MemoryRequirements {
        unsafe { self.device.handle().get_image_memory_requirements(self.image) }
    }

    /// Binds the image at `offset` inside `block` and creates its view.
    pub fn bind(&mut self, block: &MemoryBlock, offset: vk::DeviceSize) -> RhiResult<()> {
        if self.view != vk::ImageView::null() {
            return Err(RhiError::InvalidHandle("image is already bound".into()));
        }
        let (memory, base) = block.binding()?;
        unsafe {
            self.device
                .handle()
                .bind_image_memory(self.image, memory, base + offset)?;
        }

        let (_, view_type) = image_kind(self.extent);
        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(view_type)
            .format(self.format)
            .subresource_range(COLOR_RANGE);
        self.view = unsafe { self.device.handle().create_image_view(&view_info, None)? };
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for SampledImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.handle().destroy_image_view(self.view, None);
            }
            self.device.handle().destroy_image(self.image, None);
        }
        debug!(
            "Destroyed image {}x{}x{}",
            self.extent.width, self.extent.height, self.extent.depth
        );
    }
}

/// Immutable sampler.
pub struct Sampler {
    device: Arc<Device>,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Nearest filtering, clamp-to-edge addressing on every axis.
    pub fn nearest_clamped(device: Arc<Device>) -> RhiResult<Self> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(0.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);
        let sampler = unsafe { device.handle().create_sampler(&info, None)? };
        debug!("Created nearest/clamp sampler");
        Ok(Self { device, sampler })
    }

    #[inline]
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_sampler(self.sampler, None);
        }
        debug!("Destroyed sampler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_extent_is_2d() {
        let extent = vk::Extent3D {
            width: 16,
            height: 16,
            depth: 1,
        };
        assert_eq!(
            image_kind(extent),
            (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D)
        );
    }

    #[test]
    fn test_deep_extent_is_3d() {
        let extent = vk::Extent3D {
            width: 8,
            height: 8,
            depth: 4,
        };
        assert_eq!(
            image_kind(extent),
            (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D)
        );
    }

    #[test]
    fn test_copy_layers_match_range() {
        assert_eq!(COLOR_LAYERS.aspect_mask, COLOR_RANGE.aspect_mask);
        assert_eq!(COLOR_LAYERS.layer_count, COLOR_RANGE.layer_count);
    }

    #[test]
    fn test_wrappers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SampledImage>();
        assert_send_sync::<MemoryBlock>();
        assert_send_sync::<Sampler>();
    }
}
