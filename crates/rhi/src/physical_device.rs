//! Physical device (GPU) selection.
//!
//! A device qualifies when it exposes Vulkan 1.3, a graphics queue, a queue
//! that can present to the target surface, and `VK_KHR_swapchain`. Among
//! qualifying devices, discrete GPUs win, then larger device-local memory.
//!
//! Acceleration-structure support is optional and reported through
//! [`DeviceCapabilities`].

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};

/// Extensions every selected device must expose.
pub const REQUIRED_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

/// Extensions enabled together when the device supports all of them.
pub const ACCELERATION_STRUCTURE_EXTENSIONS: &[&CStr] = &[
    ash::khr::acceleration_structure::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// Queue families resolved for a selected device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Family used for all rendering and deferred transfer work.
    pub graphics: u32,
    /// Family used for presentation.
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Optional features and limits that shape engine behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// `VK_KHR_acceleration_structure` can be enabled.
    pub acceleration_structures: bool,
    /// Largest sampled-image array a single descriptor set may hold.
    pub max_sampled_images: u32,
}

/// A device that passed selection.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilies,
    pub capabilities: DeviceCapabilities,
}

impl PhysicalDeviceInfo {
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    /// Total device-local heap size in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.properties.device_type)
            .field("queue_families", &self.queue_families)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Picks the best device able to render to `surface`.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no device qualifies.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> RhiResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    info!("Found {} GPU(s)", devices.len());

    let best = devices
        .into_iter()
        .filter_map(|device| inspect_device(instance, device, surface, surface_loader))
        .max_by_key(|info| {
            score_device(info.properties.device_type, info.device_local_memory())
        });

    match best {
        Some(info) => {
            info!(
                "Selected GPU '{}' ({:?}), acceleration structures: {}",
                info.device_name(),
                info.properties.device_type,
                info.capabilities.acceleration_structures
            );
            Ok(info)
        }
        None => {
            warn!("No GPU satisfies the renderer requirements");
            Err(RhiError::NoSuitableGpu)
        }
    }
}

fn inspect_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let name = properties
        .device_name_as_c_str()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if properties.api_version < vk::API_VERSION_1_3 {
        debug!("GPU '{}' skipped: Vulkan 1.3 not supported", name);
        return None;
    }

    let extensions = unsafe { instance.enumerate_device_extension_properties(device) }.ok()?;
    let has_extension = |wanted: &CStr| {
        extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str().is_ok_and(|n| n == wanted))
    };
    if let Some(missing) = REQUIRED_EXTENSIONS.iter().find(|ext| !has_extension(ext)) {
        debug!("GPU '{}' skipped: missing {:?}", name, missing);
        return None;
    }

    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let queue_families = pick_queue_families(&families, |index| unsafe {
        surface_loader
            .get_physical_device_surface_support(device, index, surface)
            .unwrap_or(false)
    });
    let Some(queue_families) = queue_families else {
        debug!("GPU '{}' skipped: no graphics or present queue", name);
        return None;
    };

    let limits = &properties.limits;
    let capabilities = DeviceCapabilities {
        acceleration_structures: ACCELERATION_STRUCTURE_EXTENSIONS
            .iter()
            .all(|ext| has_extension(ext)),
        max_sampled_images: limits
            .max_descriptor_set_sampled_images
            .min(limits.max_per_stage_descriptor_sampled_images)
            .min(limits.max_descriptor_set_samplers)
            .min(limits.max_per_stage_descriptor_samplers),
    };

    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

    Some(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_families,
        capabilities,
    })
}

/// Chooses graphics and present families.
///
/// A single family doing both is preferred, since it avoids concurrent
/// sharing of swapchain images.
pub fn pick_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;

    for (index, family) in families.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        let index = index as u32;
        let is_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = supports_present(index);

        if is_graphics && can_present {
            return Some(QueueFamilies {
                graphics: index,
                present: index,
            });
        }
        if is_graphics && graphics.is_none() {
            graphics = Some(index);
        }
        if can_present && present.is_none() {
            present = Some(index);
        }
    }

    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

fn score_device(device_type: vk::PhysicalDeviceType, local_memory: u64) -> u64 {
    let type_score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    };
    // Type dominates; memory (MiB) breaks ties.
    type_score * (1 << 40) + local_memory / (1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_prefers_combined_graphics_present_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let picked = pick_queue_families(&families, |i| i != 0).unwrap();
        assert_eq!(
            picked,
            QueueFamilies {
                graphics: 2,
                present: 2
            }
        );
        assert_eq!(picked.unique(), vec![2]);
    }

    #[test]
    fn test_split_families_when_no_combined_one() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let picked = pick_queue_families(&families, |i| i == 1).unwrap();
        assert_eq!(picked.graphics, 0);
        assert_eq!(picked.present, 1);
        assert_eq!(picked.unique(), vec![0, 1]);
    }

    #[test]
    fn test_no_present_support_rejects_device() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert!(pick_queue_families(&families, |_| false).is_none());
    }

    #[test]
    fn test_empty_families_are_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        let picked = pick_queue_families(&families, |_| true).unwrap();
        assert_eq!(picked.graphics, 1);
    }

    #[test]
    fn test_discrete_outranks_larger_integrated() {
        let discrete = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 2 << 30);
        let integrated = score_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 64 << 30);
        assert!(discrete > integrated);
        let bigger = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 8 << 30);
        assert!(bigger > discrete);
    }
}
