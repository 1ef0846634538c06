//! Growable device buffers.
//!
//! A [`GrowableBuffer`] is a device-local buffer whose capacity is counted in
//! elements, starts at one and only ever grows to the next power of two.
//! Growth is stop-the-queue: the graphics queue is idled, the buffer is
//! recreated, and the next upload re-stages the full contents.
//!
//! Every upload stages into its own host-visible buffer. The copy and the
//! release of that buffer go through the deferred queue
//! ([`buffer_upload_ops`]), so the CPU never waits on an in-flight copy.

use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use tracing::info;

use frameflow_rhi::buffer::{Buffer, BufferUsage};
use frameflow_rhi::device::Device;

use crate::deferred::{DeferredKind, DeferredOp, ReleaseBundle};
use crate::error::{RenderError, RenderResult};

/// Result of a capacity request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Growth {
    Unchanged,
    Grew { from: usize, to: usize },
}

/// Element capacity and logical length of an arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaCapacity {
    capacity: usize,
    len: usize,
}

impl Default for ArenaCapacity {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaCapacity {
    pub const fn new() -> Self {
        Self {
            capacity: 1,
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity needed to hold `requested` elements.
    ///
    /// Unchanged when it already fits, otherwise the smallest power of two
    /// not below `requested`.
    pub fn plan(&self, requested: usize) -> RenderResult<Growth> {
        if requested <= self.capacity {
            return Ok(Growth::Unchanged);
        }
        let to = requested
            .checked_next_power_of_two()
            .ok_or(RenderError::CapacityOverflow { requested })?;
        Ok(Growth::Grew {
            from: self.capacity,
            to,
        })
    }

    /// Applies [`plan`](Self::plan) immediately.
    pub fn reserve(&mut self, requested: usize) -> RenderResult<Growth> {
        let growth = self.plan(requested)?;
        if let Growth::Grew { to, .. } = growth {
            self.capacity = to;
        }
        Ok(growth)
    }

    /// Sets the logical length. Must not exceed the capacity.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity, "length {len} above capacity {}", self.capacity);
        self.len = len.min(self.capacity);
    }
}

/// Byte size of `count` elements of `T`.
fn byte_size<T>(count: usize) -> RenderResult<vk::DeviceSize> {
    count
        .checked_mul(size_of::<T>())
        .and_then(|bytes| vk::DeviceSize::try_from(bytes).ok())
        .ok_or(RenderError::CapacityOverflow { requested: count })
}

/// Ops one buffer upload enqueues.
pub const BUFFER_UPLOAD_OPS: usize = 2;

/// Copy `staging` into `dst` in round 0 and release it in round 1.
///
/// `release` must own the buffer behind `src`.
pub fn buffer_upload_ops(
    src: vk::Buffer,
    dst: vk::Buffer,
    region: vk::BufferCopy,
    release: ReleaseBundle,
) -> [DeferredOp; BUFFER_UPLOAD_OPS] {
    [
        DeferredOp::new(0, DeferredKind::CopyBufferToBuffer { src, dst, region }),
        DeferredOp::new(1, DeferredKind::Cleanup(release)),
    ]
}

/// Host-visible copy of one upload.
pub struct Staged {
    pub buffer: Buffer,
    pub region: vk::BufferCopy,
}

/// Device buffer of `T`.
pub struct GrowableBuffer<T> {
    device: Arc<Device>,
    usage: BufferUsage,
    capacity: ArenaCapacity,
    buffer: Buffer,
    _marker: PhantomData<T>,
}

impl<T: Pod> GrowableBuffer<T> {
    /// Creates the buffer with room for one element.
    pub fn new(device: Arc<Device>, usage: BufferUsage) -> RenderResult<Self> {
        let capacity = ArenaCapacity::new();
        let size = byte_size::<T>(capacity.capacity())?;
        let buffer = Buffer::new(device.clone(), usage, size)?;

        Ok(Self {
            device,
            usage,
            capacity,
            buffer,
            _marker: PhantomData,
        })
    }

    /// Grows the buffer so `count` elements fit.
    ///
    /// Idles the graphics queue before the old buffer is destroyed. The new
    /// buffer is created first, so a failed allocation leaves the arena
    /// untouched. Callers must drop queued ops that name the old handle.
    pub fn ensure_capacity(&mut self, count: usize) -> RenderResult<Growth> {
        let growth = self.capacity.plan(count)?;
        let Growth::Grew { from, to } = growth else {
            return Ok(growth);
        };

        let size = byte_size::<T>(to)?;
        self.device.wait_queue_idle()?;

        self.buffer = Buffer::new(self.device.clone(), self.usage, size)?;
        self.capacity.reserve(to)?;
        self.capacity.set_len(0);

        info!(
            "Grew {} buffer: {} -> {} elements ({} bytes)",
            self.usage.name(),
            from,
            to,
            size
        );
        Ok(growth)
    }

    /// Copies `data` into a fresh staging buffer and sets the length.
    ///
    /// Returns the staging buffer with the copy region for the device
    /// buffer, or `None` for empty data. The capacity must already hold
    /// `data`.
    pub fn stage(&mut self, data: &[T]) -> RenderResult<Option<Staged>> {
        if data.len() > self.capacity.capacity() {
            return Err(RenderError::CapacityOverflow {
                requested: data.len(),
            });
        }
        if data.is_empty() {
            self.capacity.set_len(0);
            return Ok(None);
        }

        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;
        let buffer = Buffer::new(self.device.clone(), BufferUsage::Staging, size)?;
        buffer.write(0, bytes)?;
        self.capacity.set_len(data.len());
        Ok(Some(Staged {
            buffer,
            region: vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            },
        }))
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.capacity.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.capacity.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.capacity()
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_one() {
        let capacity = ArenaCapacity::new();
        assert_eq!(capacity.capacity(), 1);
        assert!(capacity.is_empty());
    }

    #[test]
    fn test_growth_rounds_to_power_of_two() {
        let mut capacity = ArenaCapacity::new();
        assert_eq!(
            capacity.reserve(5).unwrap(),
            Growth::Grew { from: 1, to: 8 }
        );
        assert_eq!(
            capacity.reserve(9).unwrap(),
            Growth::Grew { from: 8, to: 16 }
        );
        assert_eq!(capacity.reserve(16).unwrap(), Growth::Unchanged);
    }

    #[test]
    fn test_smaller_request_is_noop() {
        let mut capacity = ArenaCapacity::new();
        capacity.reserve(100).unwrap();
        assert_eq!(capacity.reserve(3).unwrap(), Growth::Unchanged);
        assert_eq!(capacity.capacity(), 128);
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut capacity = ArenaCapacity::new();
        let err = capacity.reserve(usize::MAX).unwrap_err();
        assert!(matches!(err, RenderError::CapacityOverflow { .. }));
        assert_eq!(capacity.capacity(), 1);
    }

    #[test]
    fn test_byte_size_overflow() {
        assert_eq!(byte_size::<u32>(4).unwrap(), 16);
        assert!(byte_size::<[u64; 4]>(usize::MAX / 8).is_err());
    }

    #[test]
    fn test_upload_copies_then_releases_staging() {
        use ash::vk::Handle;

        let [copy, release] = buffer_upload_ops(
            vk::Buffer::from_raw(1),
            vk::Buffer::from_raw(2),
            vk::BufferCopy::default(),
            ReleaseBundle::new().with("staging", ()),
        );
        assert_eq!(copy.sub_delay, 0);
        assert!(copy.references_buffer(vk::Buffer::from_raw(1)));
        assert!(copy.references_buffer(vk::Buffer::from_raw(2)));
        assert_eq!(release.sub_delay, 1);
        assert!(matches!(release.kind, DeferredKind::Cleanup(ref bundle) if bundle.len() == 1));
    }

    #[test]
    fn test_plan_does_not_commit() {
        let capacity = ArenaCapacity::new();
        assert_eq!(capacity.plan(3).unwrap(), Growth::Grew { from: 1, to: 4 });
        assert_eq!(capacity.capacity(), 1);
    }
}
