//! Texture table: sampled images packed into one growable memory pool.
//!
//! Each texture is an RGBA8 image bound at an offset inside a shared
//! [`MemoryBlock`]. Uploads go through the deferred queue as
//! transition, copy, transition, then release of the staging buffer. When the
//! pool is exhausted a larger one is allocated, every image is recreated in
//! it, and the old contents are copied across on the GPU.
//!
//! Descriptors live in one bindless array per frame slot. Writes are queued
//! per slot and applied once that slot's fence has been waited on.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use frameflow_rhi::RhiError;
use frameflow_rhi::buffer::{Buffer, BufferUsage};
use frameflow_rhi::descriptor::{DescriptorPool, DescriptorSetLayout, TextureWrite, write_textures};
use frameflow_rhi::device::Device;
use frameflow_rhi::image::{COLOR_LAYERS, MemoryBlock, SampledImage, Sampler};

use crate::deferred::vulkan::enqueue_or_release;
use crate::deferred::{DeferredKind, DeferredOp, DeferredQueue, ReleaseBundle};
use crate::error::{DeferredError, RenderError, RenderResult};

/// Format of every texture in the table.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Bytes per texel of [`TEXTURE_FORMAT`].
pub const TEXEL_SIZE: usize = 4;

/// Ops one upload enqueues.
pub const UPLOAD_OPS: usize = 4;
/// Ops one pool growth enqueues.
pub const GROWTH_OPS: usize = 5;
/// Rounds spanned by an upload or a growth, past its first round.
pub const SEQUENCE_ROUNDS: u32 = 3;

/// Upload of `src` into `image`, rounds 0 to 3.
///
/// The image moves to `TRANSFER_DST`, receives the copy, moves to
/// `SHADER_READ_ONLY` and `release` (owning `src`) drops last.
pub fn texture_upload_ops(
    src: vk::Buffer,
    image: vk::Image,
    extent: vk::Extent3D,
    release: ReleaseBundle,
) -> [DeferredOp; UPLOAD_OPS] {
    let region = vk::BufferImageCopy::default()
        .image_subresource(COLOR_LAYERS)
        .image_extent(extent);
    [
        DeferredOp::new(
            0,
            DeferredKind::LayoutTransition {
                images: vec![image],
                old: vk::ImageLayout::UNDEFINED,
                new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            },
        ),
        DeferredOp::new(
            1,
            DeferredKind::CopyBufferToImage {
                src,
                dst: image,
                region,
            },
        ),
        DeferredOp::new(
            2,
            DeferredKind::LayoutTransition {
                images: vec![image],
                old: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        ),
        DeferredOp::new(3, DeferredKind::Cleanup(release)),
    ]
}

/// Move of every `(old, new, extent)` image into a new pool, rounds `base`
/// to `base + 3`.
///
/// `release` owns the old images and pool; it drops after the copies.
pub fn growth_ops(
    copies: Vec<(vk::Image, vk::Image, vk::Extent3D)>,
    release: ReleaseBundle,
    base: u32,
) -> [DeferredOp; GROWTH_OPS] {
    let old_images: Vec<vk::Image> = copies.iter().map(|&(src, _, _)| src).collect();
    let new_images: Vec<vk::Image> = copies.iter().map(|&(_, dst, _)| dst).collect();
    [
        DeferredOp::new(
            base,
            DeferredKind::LayoutTransition {
                images: new_images.clone(),
                old: vk::ImageLayout::UNDEFINED,
                new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            },
        ),
        DeferredOp::new(
            base,
            DeferredKind::LayoutTransition {
                images: old_images,
                old: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                new: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            },
        ),
        DeferredOp::new(base + 1, DeferredKind::CopyImagesToImages { copies }),
        DeferredOp::new(
            base + 2,
            DeferredKind::LayoutTransition {
                images: new_images,
                old: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        ),
        DeferredOp::new(base + 3, DeferredKind::Cleanup(release)),
    ]
}

/// Checks that `len` bytes hold a `width x height x depth` RGBA8 image.
///
/// Zero-sized extents are rejected with an expected length of zero.
pub fn validate_texture_data(len: usize, width: u32, height: u32, depth: u32) -> RenderResult<()> {
    if width == 0 || height == 0 || depth == 0 {
        return Err(RenderError::InvalidTextureData {
            expected: 0,
            actual: len,
        });
    }
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(depth as usize))
        .and_then(|n| n.checked_mul(TEXEL_SIZE))
        .ok_or(RenderError::CapacityOverflow {
            requested: usize::MAX,
        })?;
    if len != expected {
        return Err(RenderError::InvalidTextureData {
            expected,
            actual: len,
        });
    }
    Ok(())
}

/// Bump allocator over one texture memory pool.
///
/// Tracks the strictest alignment and the memory types every placed image
/// accepts, which together form the requirements of the backing block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureArena {
    size: vk::DeviceSize,
    used: vk::DeviceSize,
    alignment: vk::DeviceSize,
    memory_type_bits: u32,
}

impl TextureArena {
    pub fn new(size: vk::DeviceSize) -> Self {
        Self {
            size,
            used: 0,
            alignment: 1,
            memory_type_bits: u32::MAX,
        }
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn used(&self) -> vk::DeviceSize {
        self.used
    }

    #[inline]
    pub fn memory_type_bits(&self) -> u32 {
        self.memory_type_bits
    }

    fn end_of(&self, requirements: &vk::MemoryRequirements) -> Option<(vk::DeviceSize, vk::DeviceSize)> {
        let offset = self
            .used
            .checked_next_multiple_of(requirements.alignment.max(1))?;
        let end = offset.checked_add(requirements.size)?;
        (end <= self.size).then_some((offset, end))
    }

    /// True if an image can go into the already allocated pool: there is
    /// room, and the image accepts every memory type the pool may live in.
    pub fn fits(&self, requirements: &vk::MemoryRequirements) -> bool {
        requirements.memory_type_bits & self.memory_type_bits == self.memory_type_bits
            && self.end_of(requirements).is_some()
    }

    /// Places an image and returns its offset.
    ///
    /// Narrows the pool's memory types to those the image accepts. `None`
    /// when out of room or when no memory type would remain.
    pub fn place(&mut self, requirements: &vk::MemoryRequirements) -> Option<vk::DeviceSize> {
        let bits = self.memory_type_bits & requirements.memory_type_bits;
        if bits == 0 {
            return None;
        }
        let (offset, end) = self.end_of(requirements)?;
        self.used = end;
        self.alignment = self.alignment.max(requirements.alignment);
        self.memory_type_bits = bits;
        Some(offset)
    }

    /// Pool size after growth: double the usage, or enough for `needed`
    /// on top of it, whichever is larger.
    pub fn grown_size(&self, needed: &vk::MemoryRequirements) -> vk::DeviceSize {
        let with_needed = self
            .used
            .saturating_add(needed.size)
            .saturating_add(needed.alignment);
        self.used.saturating_mul(2).max(with_needed)
    }

    /// Requirements of the block backing this arena.
    pub fn requirements(&self) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: self.size,
            alignment: self.alignment,
            memory_type_bits: self.memory_type_bits,
        }
    }
}

struct Texture {
    image: SampledImage,
    requirements: vk::MemoryRequirements,
}

struct Pool {
    block: MemoryBlock,
    arena: TextureArena,
}

/// Textures, their memory pool, and the per-frame descriptor sets.
pub struct TextureTable {
    device: Arc<Device>,
    textures: Vec<Texture>,
    pool: Option<Pool>,
    max_textures: u32,
    initial_pool_bytes: vk::DeviceSize,
    sampler: Sampler,
    sets: Vec<vk::DescriptorSet>,
    descriptor_pool: DescriptorPool,
    layout: DescriptorSetLayout,
    /// Ids whose descriptor must be (re)written, per frame slot.
    pending_writes: Vec<Vec<u32>>,
}

impl TextureTable {
    /// Creates an empty table for `frames_in_flight` slots.
    ///
    /// `max_textures` is clamped to the device's sampled-image limit. The
    /// first pool is allocated by the first upload.
    pub fn new(
        device: Arc<Device>,
        frames_in_flight: usize,
        max_textures: u32,
        initial_pool_bytes: vk::DeviceSize,
    ) -> RenderResult<Self> {
        let limit = device.capabilities().max_sampled_images;
        let clamped = if limit > 0 {
            max_textures.min(limit)
        } else {
            max_textures
        };
        if clamped < max_textures {
            warn!(
                "Texture table clamped from {} to the device limit of {}",
                max_textures, clamped
            );
        }
        let max_textures = clamped;

        let frames = u32::try_from(frames_in_flight).unwrap_or(u32::MAX);
        let layout = DescriptorSetLayout::texture_array(device.clone(), max_textures)?;
        let descriptor_pool =
            DescriptorPool::for_texture_arrays(device.clone(), frames, max_textures)?;
        let layouts = vec![layout.handle(); frames_in_flight];
        let sets = descriptor_pool.allocate(&layouts)?;
        let sampler = Sampler::nearest_clamped(device.clone())?;

        Ok(Self {
            device,
            textures: Vec::new(),
            pool: None,
            max_textures,
            initial_pool_bytes,
            sampler,
            sets,
            descriptor_pool,
            layout,
            pending_writes: vec![Vec::new(); frames_in_flight],
        })
    }

    /// Creates a texture and queues its upload at delay 0.
    ///
    /// Returns the texture id. The id is safe to sample once the batch that
    /// records the upload has retired.
    pub fn add(
        &mut self,
        queue: &mut DeferredQueue,
        pixels: &[u8],
        width: u32,
        height: u32,
        depth: u32,
    ) -> RenderResult<u32> {
        validate_texture_data(pixels.len(), width, height, depth)?;
        let id = u32::try_from(self.textures.len()).unwrap_or(u32::MAX);
        if id >= self.max_textures {
            return Err(RenderError::TextureTableFull {
                max: self.max_textures,
            });
        }

        let extent = vk::Extent3D {
            width,
            height,
            depth,
        };
        let mut image = SampledImage::new(self.device.clone(), extent, TEXTURE_FORMAT)?;
        let requirements = image.memory_requirements();

        let in_place = self
            .pool
            .as_ref()
            .is_some_and(|pool| pool.arena.fits(&requirements));
        let grows_existing = !in_place && !self.textures.is_empty();
        let growth_base = queue.next_free_round();
        ensure_room(
            queue,
            UPLOAD_OPS + if grows_existing { GROWTH_OPS } else { 0 },
            if grows_existing {
                growth_base + SEQUENCE_ROUNDS
            } else {
                SEQUENCE_ROUNDS
            },
        )?;

        let offset = if in_place {
            self.pool
                .as_mut()
                .and_then(|pool| pool.arena.place(&requirements))
        } else {
            Some(self.grow(queue, &requirements, growth_base)?)
        }
        .ok_or_else(|| RhiError::Unsupported("texture pool placement failed".into()))?;

        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| RhiError::InvalidHandle("texture pool missing".into()))?;
        image.bind(&pool.block, offset)?;

        let staging = Buffer::new(
            self.device.clone(),
            BufferUsage::Staging,
            pixels.len() as vk::DeviceSize,
        )?;
        staging.write(0, pixels)?;

        let src = staging.handle();
        let release = ReleaseBundle::new().with("texture staging", staging);
        let ops = texture_upload_ops(src, image.handle(), extent, release);
        for op in ops {
            enqueue_or_release(&self.device, queue, op, 0)?;
        }

        self.textures.push(Texture {
            image,
            requirements,
        });
        for pending in &mut self.pending_writes {
            pending.push(id);
        }

        debug!(
            "Texture {} added: {}x{}x{} at pool offset {}",
            id, width, height, depth, offset
        );
        Ok(id)
    }

    /// Allocates a pool large enough for every texture plus `needed` and
    /// moves the existing textures into it. Returns the offset reserved for
    /// the new image.
    ///
    /// Idles the graphics queue. Copy and release ops start at `base`, after
    /// every op already pending in the current slot.
    fn grow(
        &mut self,
        queue: &mut DeferredQueue,
        needed: &vk::MemoryRequirements,
        base: u32,
    ) -> RenderResult<vk::DeviceSize> {
        let size = match &self.pool {
            Some(pool) => pool.arena.grown_size(needed),
            None => self.initial_pool_bytes,
        }
        .max(needed.size.saturating_add(needed.alignment));

        let mut arena = TextureArena::new(size);
        let offsets = self
            .textures
            .iter()
            .map(|texture| arena.place(&texture.requirements))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RhiError::Unsupported("no memory type fits every texture".into()))?;
        let new_offset = arena
            .place(needed)
            .ok_or_else(|| RhiError::Unsupported("no memory type fits every texture".into()))?;

        self.device.wait_queue_idle()?;
        let block = MemoryBlock::new(self.device.clone(), "texture pool", arena.requirements())?;

        let mut replacements = Vec::with_capacity(self.textures.len());
        for (texture, &offset) in self.textures.iter().zip(&offsets) {
            let mut image = SampledImage::new(
                self.device.clone(),
                texture.image.extent(),
                texture.image.format(),
            )?;
            image.bind(&block, offset)?;
            replacements.push(image);
        }

        let previous = self.pool.replace(Pool { block, arena });
        let Some(previous) = previous else {
            info!("Texture pool allocated: {} bytes", size);
            return Ok(new_offset);
        };

        let mut copies = Vec::with_capacity(replacements.len());
        let mut release = ReleaseBundle::new();
        for (texture, image) in self.textures.iter_mut().zip(replacements) {
            copies.push((texture.image.handle(), image.handle(), image.extent()));
            let old = std::mem::replace(&mut texture.image, image);
            release.push("texture image", old);
        }
        release.push("texture pool", previous.block);

        let ops = growth_ops(copies, release, base);
        for op in ops {
            enqueue_or_release(&self.device, queue, op, 0)?;
        }

        let ids = 0..self.textures.len() as u32;
        for pending in &mut self.pending_writes {
            pending.extend(ids.clone());
        }

        info!(
            "Texture pool grown: {} -> {} bytes, {} texture(s) moved",
            previous.arena.size(),
            size,
            self.textures.len()
        );
        Ok(new_offset)
    }

    /// Writes the queued descriptors of `frame`.
    ///
    /// The frame's previous submission must have retired.
    pub fn apply_pending_writes(&mut self, frame: usize) {
        let Some(pending) = self.pending_writes.get_mut(frame) else {
            return;
        };
        if pending.is_empty() {
            return;
        }
        pending.sort_unstable();
        pending.dedup();

        let set = self.sets[frame];
        let writes: Vec<TextureWrite> = pending
            .drain(..)
            .filter_map(|id| {
                self.textures.get(id as usize).map(|texture| TextureWrite {
                    set,
                    index: id,
                    view: texture.image.view(),
                })
            })
            .collect();
        write_textures(&self.device, self.sampler.handle(), &writes);
        debug!("Frame {}: wrote {} texture descriptor(s)", frame, writes.len());
    }

    /// Bindless texture set of `frame`.
    pub fn descriptor_set(&self, frame: usize) -> vk::DescriptorSet {
        self.sets[frame]
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.layout.handle()
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn max_textures(&self) -> u32 {
        self.max_textures
    }

    /// Size of the current pool in bytes, zero before the first upload.
    pub fn pool_size(&self) -> vk::DeviceSize {
        self.pool.as_ref().map_or(0, |pool| pool.arena.size())
    }

    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.descriptor_pool
    }
}

/// Fails early when the current slot cannot take `ops` more ops or when
/// `last_round` is beyond the queue's bound.
fn ensure_room(queue: &DeferredQueue, ops: usize, last_round: u32) -> Result<(), DeferredError> {
    if last_round > queue.max_sub_delay() {
        return Err(DeferredError::DelayOutOfRange {
            delay: last_round,
            max: queue.max_sub_delay(),
        });
    }
    if queue.remaining(0) < ops {
        return Err(DeferredError::SlotFull {
            slot: queue.cursor(),
            capacity: queue.slot_capacity(),
        });
    }
    Ok(())
}
