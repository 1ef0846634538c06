//! Vulkan logical device, queues, and the gpu-allocator instance.
//!
//! # Example
//!
//! ```no_run
//! use frameflow_rhi::device::Device;
//! use frameflow_rhi::instance::Instance;
//! use frameflow_rhi::physical_device::select_physical_device;
//! use ash::vk;
//!
//! # fn example(instance: &Instance, surface: vk::SurfaceKHR) -> Result<(), frameflow_rhi::RhiError> {
//! let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
//! let gpu = select_physical_device(instance.handle(), surface, &surface_loader)?;
//! let device = Device::new(instance, &gpu)?;
//! device.wait_queue_idle()?;
//! # Ok(())
//! # }
//! ```

use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, error, info};

use crate::error::RhiResult;
use crate::instance::Instance;
use crate::physical_device::{
    ACCELERATION_STRUCTURE_EXTENSIONS, DeviceCapabilities, PhysicalDeviceInfo, QueueFamilies,
    REQUIRED_EXTENSIONS,
};

/// Logical device wrapper.
///
/// Owns the `VkDevice`, the queues used by the renderer, and the memory
/// allocator. Every other RHI object holds an `Arc<Device>` so the device
/// outlives them.
pub struct Device {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    queue_families: QueueFamilies,
    capabilities: DeviceCapabilities,
    acceleration_structure: Option<ash::khr::acceleration_structure::Device>,
}

impl Device {
    /// Creates the logical device and its allocator.
    ///
    /// Enables dynamic rendering, synchronization2, buffer device addresses,
    /// and the descriptor-indexing features needed by a partially bound
    /// texture array. Acceleration-structure extensions are enabled when the
    /// physical device reports them.
    pub fn new(instance: &Instance, gpu: &PhysicalDeviceInfo) -> RhiResult<Arc<Self>> {
        let families = gpu.queue_families.unique();
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let with_acceleration = gpu.capabilities.acceleration_structures;
        let mut extensions: Vec<*const std::ffi::c_char> =
            REQUIRED_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();
        if with_acceleration {
            extensions.extend(ACCELERATION_STRUCTURE_EXTENSIONS.iter().map(|e| e.as_ptr()));
        }

        let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .buffer_device_address(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .shader_sampled_image_array_non_uniform_indexing(true);
        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut acceleration_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
                .acceleration_structure(true);

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features_1_2)
            .push_next(&mut features_1_3);
        if with_acceleration {
            create_info = create_info.push_next(&mut acceleration_features);
        }

        let device = unsafe {
            instance
                .handle()
                .create_device(gpu.device, &create_info, None)?
        };
        info!(
            "Logical device created on '{}' with {} extension(s)",
            gpu.device_name(),
            extensions.len()
        );

        let graphics_queue = unsafe { device.get_device_queue(gpu.queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(gpu.queue_families.present, 0) };
        debug!(
            "Queues: graphics family {}, present family {}",
            gpu.queue_families.graphics, gpu.queue_families.present
        );

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: gpu.device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };
        info!("GPU memory allocator initialized");

        let acceleration_structure = with_acceleration
            .then(|| ash::khr::acceleration_structure::Device::new(instance.handle(), &device));

        Ok(Arc::new(Self {
            device,
            physical_device: gpu.device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            graphics_queue,
            present_queue,
            queue_families: gpu.queue_families,
            capabilities: gpu.capabilities,
            acceleration_structure,
        }))
    }

    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    #[inline]
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    #[inline]
    pub fn queue_families(&self) -> &QueueFamilies {
        &self.queue_families
    }

    #[inline]
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Acceleration-structure loader, present only when the extension is on.
    #[inline]
    pub fn acceleration_structure(&self) -> Option<&ash::khr::acceleration_structure::Device> {
        self.acceleration_structure.as_ref()
    }

    /// Locks the memory allocator.
    ///
    /// A poisoned lock is recovered: the allocator holds no invariant that a
    /// panicking holder could have broken halfway.
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until every queue of the device is idle.
    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Blocks until the graphics queue is idle.
    ///
    /// Used before reallocating resources that queued work may reference.
    pub fn wait_queue_idle(&self) -> RhiResult<()> {
        unsafe { self.device.queue_wait_idle(self.graphics_queue)? };
        Ok(())
    }

    /// Submits work to the graphics queue.
    ///
    /// # Safety
    ///
    /// Every handle referenced by `submits` must be valid, and `fence` must be
    /// null or unsignaled and not attached to another pending submission.
    pub unsafe fn submit_graphics(
        &self,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> RhiResult<()> {
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, submits, fence)?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// ash::Device is Send + Sync, queues and the physical device are plain
// handles, and the allocator is behind a Mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}
