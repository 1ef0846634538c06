//! Deferred operations and their payloads.

use std::fmt;

use ash::vk;

use crate::error::DeferredError;

/// A GPU-side mutation postponed into a deferred batch.
#[derive(Debug)]
pub struct DeferredOp {
    /// Round inside its batch. Ops of round `n` are recorded after every op
    /// of rounds `< n`, separated by a memory barrier.
    pub sub_delay: u32,
    pub kind: DeferredKind,
}

impl DeferredOp {
    pub fn new(sub_delay: u32, kind: DeferredKind) -> Self {
        Self { sub_delay, kind }
    }

    /// True if the op reads or writes `buffer`.
    pub fn references_buffer(&self, buffer: vk::Buffer) -> bool {
        match &self.kind {
            DeferredKind::CopyBufferToBuffer { src, dst, .. } => *src == buffer || *dst == buffer,
            DeferredKind::CopyBufferToImage { src, .. } => *src == buffer,
            _ => false,
        }
    }
}

/// Payload of a [`DeferredOp`].
#[derive(Debug)]
pub enum DeferredKind {
    CopyBufferToBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    /// `dst` must already be in `TRANSFER_DST_OPTIMAL`.
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        region: vk::BufferImageCopy,
    },
    /// One whole-image copy per `(src, dst, extent)`; sources in
    /// `TRANSFER_SRC_OPTIMAL`, destinations in `TRANSFER_DST_OPTIMAL`.
    CopyImagesToImages {
        copies: Vec<(vk::Image, vk::Image, vk::Extent3D)>,
    },
    LayoutTransition {
        images: Vec<vk::Image>,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    AccelerationStructureBuild(AccelerationStructureBuild),
    Cleanup(ReleaseBundle),
}

impl DeferredKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CopyBufferToBuffer { .. } => "copy-buffer-to-buffer",
            Self::CopyBufferToImage { .. } => "copy-buffer-to-image",
            Self::CopyImagesToImages { .. } => "copy-images-to-images",
            Self::LayoutTransition { .. } => "layout-transition",
            Self::AccelerationStructureBuild(_) => "acceleration-structure-build",
            Self::Cleanup(_) => "cleanup",
        }
    }
}

/// Access masks and stages of a supported layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier parameters for `old -> new`.
///
/// Only the transitions texture uploads and pool growth issue are mapped.
pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks, DeferredError> {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};

    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: A::empty(),
            dst_access: A::TRANSFER_WRITE,
            src_stage: S::TOP_OF_PIPE,
            dst_stage: S::TRANSFER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: A::TRANSFER_WRITE,
            dst_access: A::SHADER_READ,
            src_stage: S::TRANSFER,
            dst_stage: S::FRAGMENT_SHADER,
        },
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => TransitionMasks {
            src_access: A::SHADER_READ,
            dst_access: A::TRANSFER_READ,
            src_stage: S::FRAGMENT_SHADER,
            dst_stage: S::TRANSFER,
        },
        _ => return Err(DeferredError::UnsupportedTransition { old, new }),
    };
    Ok(masks)
}

/// Resources released once the batch that recorded them retires.
///
/// Anything `Send` can be handed over: buffers, images, memory blocks,
/// allocations. Dropping the bundle drops the items in insertion order.
#[derive(Default)]
pub struct ReleaseBundle {
    items: Vec<(&'static str, Box<dyn Send>)>,
}

impl ReleaseBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `item`, labelled for logs.
    pub fn push(&mut self, label: &'static str, item: impl Send + 'static) {
        self.items.push((label, Box::new(item)));
    }

    pub fn with(mut self, label: &'static str, item: impl Send + 'static) -> Self {
        self.push(label, item);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.items.iter().map(|(label, _)| *label)
    }
}

impl fmt::Debug for ReleaseBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.labels()).finish()
    }
}

/// Geometry source of an acceleration-structure build, by device address.
#[derive(Clone, Copy, Debug)]
pub enum GeometryData {
    Triangles {
        vertex_data: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        vertex_format: vk::Format,
        max_vertex: u32,
        index_data: vk::DeviceAddress,
        index_type: vk::IndexType,
    },
    Aabbs {
        data: vk::DeviceAddress,
        stride: vk::DeviceSize,
    },
    Instances {
        data: vk::DeviceAddress,
    },
}

/// One geometry and the range the build reads from it.
#[derive(Clone, Copy, Debug)]
pub struct BuildGeometry {
    pub data: GeometryData,
    pub flags: vk::GeometryFlagsKHR,
    pub range: vk::AccelerationStructureBuildRangeInfoKHR,
}

impl BuildGeometry {
    fn to_vk(self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let address = |device_address| vk::DeviceOrHostAddressConstKHR { device_address };

        let (ty, geometry) = match self.data {
            GeometryData::Triangles {
                vertex_data,
                vertex_stride,
                vertex_format,
                max_vertex,
                index_data,
                index_type,
            } => (
                vk::GeometryTypeKHR::TRIANGLES,
                vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_format(vertex_format)
                        .vertex_data(address(vertex_data))
                        .vertex_stride(vertex_stride)
                        .max_vertex(max_vertex)
                        .index_type(index_type)
                        .index_data(address(index_data)),
                },
            ),
            GeometryData::Aabbs { data, stride } => (
                vk::GeometryTypeKHR::AABBS,
                vk::AccelerationStructureGeometryDataKHR {
                    aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                        .data(address(data))
                        .stride(stride),
                },
            ),
            GeometryData::Instances { data } => (
                vk::GeometryTypeKHR::INSTANCES,
                vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                        .array_of_pointers(false)
                        .data(address(data)),
                },
            ),
        };

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(ty)
            .geometry(geometry)
            .flags(self.flags)
    }
}

/// Owned description of a device-side acceleration-structure build.
///
/// The Vulkan structs are produced at record time and dropped right after
/// the build command is issued; device builds consume them during recording.
#[derive(Clone, Debug)]
pub struct AccelerationStructureBuild {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch: vk::DeviceAddress,
    pub geometries: Vec<BuildGeometry>,
}

impl AccelerationStructureBuild {
    /// Geometries and their ranges, index-aligned.
    pub fn to_vk(
        &self,
    ) -> (
        Vec<vk::AccelerationStructureGeometryKHR<'static>>,
        Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    ) {
        self.geometries
            .iter()
            .map(|geometry| (geometry.to_vk(), geometry.range))
            .unzip()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ash::vk::Handle;

    use super::*;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_supported_transitions() {
        let to_dst = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);

        let to_read = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

        let to_src = transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_src.src_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(to_src.dst_access, vk::AccessFlags::TRANSFER_READ);
    }

    #[test]
    fn test_unknown_transition_is_an_error() {
        let err = transition_masks(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap_err();
        assert_eq!(
            err,
            DeferredError::UnsupportedTransition {
                old: vk::ImageLayout::GENERAL,
                new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            }
        );
    }

    #[test]
    fn test_release_bundle_drops_every_item_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let bundle = ReleaseBundle::new()
            .with("image", DropCounter(drops.clone()))
            .with("pool", DropCounter(drops.clone()));
        assert_eq!(bundle.labels().collect::<Vec<_>>(), vec!["image", "pool"]);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(bundle);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_buffer_references() {
        let a = vk::Buffer::from_raw(1);
        let b = vk::Buffer::from_raw(2);
        let copy = DeferredOp::new(
            0,
            DeferredKind::CopyBufferToBuffer {
                src: a,
                dst: b,
                region: vk::BufferCopy::default(),
            },
        );
        assert!(copy.references_buffer(a));
        assert!(copy.references_buffer(b));
        assert!(!copy.references_buffer(vk::Buffer::from_raw(3)));

        let upload = DeferredOp::new(
            1,
            DeferredKind::CopyBufferToImage {
                src: a,
                dst: vk::Image::from_raw(9),
                region: vk::BufferImageCopy::default(),
            },
        );
        assert!(upload.references_buffer(a));
        assert!(!upload.references_buffer(b));
    }

    #[test]
    fn test_acceleration_build_pairs_geometries_and_ranges() {
        let build = AccelerationStructureBuild {
            ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            dst: vk::AccelerationStructureKHR::null(),
            scratch: 0x1000,
            geometries: vec![
                BuildGeometry {
                    data: GeometryData::Aabbs {
                        data: 0x2000,
                        stride: 24,
                    },
                    flags: vk::GeometryFlagsKHR::OPAQUE,
                    range: vk::AccelerationStructureBuildRangeInfoKHR {
                        primitive_count: 4,
                        ..Default::default()
                    },
                },
                BuildGeometry {
                    data: GeometryData::Instances { data: 0x3000 },
                    flags: vk::GeometryFlagsKHR::empty(),
                    range: vk::AccelerationStructureBuildRangeInfoKHR {
                        primitive_count: 2,
                        ..Default::default()
                    },
                },
            ],
        };

        let (geometries, ranges) = build.to_vk();
        assert_eq!(geometries.len(), 2);
        assert_eq!(geometries[0].geometry_type, vk::GeometryTypeKHR::AABBS);
        assert_eq!(geometries[1].geometry_type, vk::GeometryTypeKHR::INSTANCES);
        assert_eq!(ranges[0].primitive_count, 4);
        assert_eq!(ranges[1].primitive_count, 2);
    }
}
