//! Descriptor layouts, pools, and writes for the bindless texture table.
//!
//! The renderer exposes every texture through one partially bound
//! `COMBINED_IMAGE_SAMPLER` array at binding 0. Each frame-in-flight slot owns
//! its own set so a slot can be rewritten while another is still read by the
//! GPU.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frameflow_rhi::device::Device;
//! use frameflow_rhi::descriptor::{DescriptorPool, DescriptorSetLayout};
//!
//! # fn example(device: Arc<Device>) -> Result<(), frameflow_rhi::RhiError> {
//! let layout = DescriptorSetLayout::texture_array(device.clone(), 1024)?;
//! let pool = DescriptorPool::for_texture_arrays(device, 2, 1024)?;
//! let sets = pool.allocate(&[layout.handle(), layout.handle()])?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;

/// Binding index of the texture array.
pub const TEXTURE_BINDING: u32 = 0;

/// Descriptor set layout wrapper.
///
/// Immutable after creation.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Layout with a single partially bound sampled-texture array of
    /// `max_textures` entries, visible to all graphics stages.
    pub fn texture_array(device: Arc<Device>, max_textures: u32) -> RhiResult<Self> {
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(max_textures)
            .stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS)];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings)
            .push_next(&mut flags_info);

        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };

        debug!("Created texture array layout with {} slot(s)", max_textures);

        Ok(Self { device, layout })
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("Destroyed descriptor set layout");
    }
}

/// Descriptor pool wrapper.
///
/// Sets are released together with the pool.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Pool sized for `sets` texture arrays of `textures_per_set` entries.
    pub fn for_texture_arrays(
        device: Arc<Device>,
        sets: u32,
        textures_per_set: u32,
    ) -> RhiResult<Self> {
        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(sets.saturating_mul(textures_per_set))];

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.handle().create_descriptor_pool(&create_info, None)? };

        debug!(
            "Created descriptor pool: {} set(s) of {} texture(s)",
            sets, textures_per_set
        );

        Ok(Self {
            device,
            pool,
            max_sets: sets,
        })
    }

    /// Allocates one set per entry of `layouts`.
    pub fn allocate(
        &self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info)? };
        Ok(sets)
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_descriptor_pool(self.pool, None);
        }
        debug!("Destroyed descriptor pool ({} set(s))", self.max_sets);
    }
}

/// One texture array element to (re)write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureWrite {
    pub set: vk::DescriptorSet,
    pub index: u32,
    pub view: vk::ImageView,
}

/// Writes shader-read-only texture descriptors.
///
/// The sets must not be in use by a pending submission.
pub fn write_textures(device: &Device, sampler: vk::Sampler, writes: &[TextureWrite]) {
    if writes.is_empty() {
        return;
    }

    let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = writes
        .iter()
        .map(|write| {
            [vk::DescriptorImageInfo::default()
                .sampler(sampler)
                .image_view(write.view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]
        })
        .collect();

    let descriptor_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .zip(&image_infos)
        .map(|(write, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(write.set)
                .dst_binding(TEXTURE_BINDING)
                .dst_array_element(write.index)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(info)
        })
        .collect();

    unsafe {
        device
            .handle()
            .update_descriptor_sets(&descriptor_writes, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_pool_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DescriptorSetLayout>();
        assert_send_sync::<DescriptorPool>();
    }

    #[test]
    fn test_texture_write_is_plain_data() {
        let write = TextureWrite {
            set: vk::DescriptorSet::null(),
            index: 3,
            view: vk::ImageView::null(),
        };
        let copy = write;
        assert_eq!(write, copy);
    }
}
