//! Scheduling behavior of the deferred queue and recorder across flushes.
//!
//! Each "flush" does what the renderer does once per tick: take the cursor
//! slot, record it, rotate the cursor, then fold any carried ops back in.
//! Commands go into a recording sink, so no device is needed.

use ash::vk;
use ash::vk::Handle;

use frameflow_renderer::deferred::{
    AccelerationStructureBuild, CommandSink, DeferredKind, DeferredOp, DeferredQueue,
    ReleaseBundle, TransitionMasks, record_batch,
};
use frameflow_renderer::error::DeferredError;
use frameflow_renderer::{buffer_upload_ops, growth_ops, texture_upload_ops};

#[derive(Clone, Debug, PartialEq)]
enum Command {
    Copy { src: u64 },
    Upload { image: u64 },
    ImageCopy { src: u64, dst: u64 },
    Barrier { images: Vec<u64>, new: vk::ImageLayout },
    Round,
    Release(Vec<&'static str>),
}

/// One recorded batch per flush.
#[derive(Default)]
struct Recording {
    batches: Vec<Vec<Command>>,
}

impl Recording {
    fn current(&mut self) -> &mut Vec<Command> {
        if self.batches.is_empty() {
            self.batches.push(Vec::new());
        }
        self.batches.last_mut().unwrap()
    }

    fn all(&self) -> Vec<Command> {
        self.batches.iter().flatten().cloned().collect()
    }

    /// Flush index in which a copy from `src` was recorded.
    fn flush_of_copy(&self, src: u64) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.contains(&Command::Copy { src }))
    }
}

impl CommandSink for Recording {
    fn copy_buffer(&mut self, src: vk::Buffer, _dst: vk::Buffer, _region: vk::BufferCopy) {
        self.current().push(Command::Copy { src: src.as_raw() });
    }

    fn copy_buffer_to_image(
        &mut self,
        _src: vk::Buffer,
        dst: vk::Image,
        _region: vk::BufferImageCopy,
    ) {
        self.current().push(Command::Upload {
            image: dst.as_raw(),
        });
    }

    fn copy_image(&mut self, src: vk::Image, dst: vk::Image, _extent: vk::Extent3D) {
        self.current().push(Command::ImageCopy {
            src: src.as_raw(),
            dst: dst.as_raw(),
        });
    }

    fn image_barrier(
        &mut self,
        images: &[vk::Image],
        _old: vk::ImageLayout,
        new: vk::ImageLayout,
        _masks: TransitionMasks,
    ) {
        self.current().push(Command::Barrier {
            images: images.iter().map(|image| image.as_raw()).collect(),
            new,
        });
    }

    fn round_barrier(&mut self) {
        self.current().push(Command::Round);
    }

    fn build_acceleration_structure(
        &mut self,
        _build: &AccelerationStructureBuild,
    ) -> Result<(), DeferredError> {
        Err(DeferredError::AccelerationStructuresUnsupported)
    }

    fn release(&mut self, bundle: ReleaseBundle) {
        self.current()
            .push(Command::Release(bundle.labels().collect()));
    }
}

const MAX_ROUNDS: u32 = 8;

fn queue(depth: usize, capacity: usize) -> DeferredQueue {
    DeferredQueue::new(depth, capacity, MAX_ROUNDS * depth as u32 - 1)
}

fn flush(queue: &mut DeferredQueue, recording: &mut Recording) {
    recording.batches.push(Vec::new());
    let ops = queue.take_current();
    let outcome = record_batch(ops, MAX_ROUNDS, recording).unwrap();
    queue.advance();
    queue.fold_carry(outcome.carry).unwrap();
}

fn copy(tag: u64, sub_delay: u32) -> DeferredOp {
    DeferredOp::new(
        sub_delay,
        DeferredKind::CopyBufferToBuffer {
            src: vk::Buffer::from_raw(tag),
            dst: vk::Buffer::from_raw(tag + 10_000),
            region: vk::BufferCopy::default(),
        },
    )
}

fn transition(image: u64, old: vk::ImageLayout, new: vk::ImageLayout, sub_delay: u32) -> DeferredOp {
    DeferredOp::new(
        sub_delay,
        DeferredKind::LayoutTransition {
            images: vec![vk::Image::from_raw(image)],
            old,
            new,
        },
    )
}

fn upload(staging: u64, image: u64, sub_delay: u32) -> DeferredOp {
    DeferredOp::new(
        sub_delay,
        DeferredKind::CopyBufferToImage {
            src: vk::Buffer::from_raw(staging),
            dst: vk::Image::from_raw(image),
            region: vk::BufferImageCopy::default(),
        },
    )
}

#[test]
fn test_op_runs_exactly_after_delay_flushes() {
    let depth = 6;
    let mut queue = queue(depth, 4);
    let mut recording = Recording::default();

    // Start from a rotated cursor so wrap-around is covered.
    flush(&mut queue, &mut recording);
    flush(&mut queue, &mut recording);
    recording.batches.clear();

    for delay in 0..depth {
        queue.enqueue(copy(delay as u64 + 1, 0), delay).unwrap();
    }
    for _ in 0..depth {
        flush(&mut queue, &mut recording);
    }

    for delay in 0..depth {
        assert_eq!(
            recording.flush_of_copy(delay as u64 + 1),
            Some(delay),
            "op with delay {} ran in the wrong flush",
            delay
        );
    }
    assert_eq!(queue.pending(), 0);
}

#[test]
fn test_empty_flushes_still_advance() {
    let mut queue = queue(4, 4);
    let mut recording = Recording::default();

    queue.enqueue(copy(7, 0), 3).unwrap();
    for _ in 0..3 {
        flush(&mut queue, &mut recording);
    }
    assert!(recording.all().is_empty());

    flush(&mut queue, &mut recording);
    assert_eq!(recording.flush_of_copy(7), Some(3));
}

#[test]
fn test_same_slot_same_delay_keeps_enqueue_order() {
    let n = 32;
    let mut queue = queue(4, n);
    let mut recording = Recording::default();

    for tag in 1..=n as u64 {
        queue.enqueue(copy(tag, 0), 1).unwrap();
    }
    flush(&mut queue, &mut recording);
    flush(&mut queue, &mut recording);

    let order: Vec<u64> = recording
        .all()
        .into_iter()
        .filter_map(|command| match command {
            Command::Copy { src } => Some(src),
            _ => None,
        })
        .collect();
    assert_eq!(order, (1..=n as u64).collect::<Vec<_>>());
}

#[test]
fn test_full_slot_rejects_and_keeps_prior_entries() {
    let mut queue = queue(3, 4);
    let mut recording = Recording::default();

    for tag in 1..=4 {
        queue.enqueue(copy(tag, 0), 0).unwrap();
    }
    let rejected = queue.enqueue(copy(99, 0), 0).unwrap_err();
    assert!(matches!(
        rejected.error,
        DeferredError::SlotFull {
            slot: 0,
            capacity: 4
        }
    ));
    assert!(rejected.op.references_buffer(vk::Buffer::from_raw(99)));

    // Other slots are unaffected by a full one.
    queue.enqueue(copy(50, 0), 1).unwrap();

    flush(&mut queue, &mut recording);
    assert_eq!(
        recording.batches[0],
        (1..=4).map(|src| Command::Copy { src }).collect::<Vec<_>>()
    );
    assert_eq!(recording.flush_of_copy(99), None);

    flush(&mut queue, &mut recording);
    assert_eq!(recording.flush_of_copy(50), Some(1));
}

#[test]
fn test_texture_upload_across_three_flushes() {
    let mut queue = queue(4, 4);
    let mut recording = Recording::default();

    queue
        .enqueue(
            transition(
                1,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                0,
            ),
            0,
        )
        .unwrap();
    queue.enqueue(upload(100, 1, 0), 1).unwrap();
    queue
        .enqueue(
            transition(
                1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                0,
            ),
            2,
        )
        .unwrap();

    for _ in 0..3 {
        flush(&mut queue, &mut recording);
    }

    assert_eq!(
        recording.batches,
        vec![
            vec![Command::Barrier {
                images: vec![1],
                new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            }],
            vec![Command::Upload { image: 1 }],
            vec![Command::Barrier {
                images: vec![1],
                new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }],
        ]
    );
}

/// Pending upload of `staging` into `image`, as the texture table queues it.
fn enqueue_texture_upload(queue: &mut DeferredQueue, staging: u64, image: u64) {
    let ops = texture_upload_ops(
        vk::Buffer::from_raw(staging),
        vk::Image::from_raw(image),
        vk::Extent3D {
            width: 4,
            height: 4,
            depth: 1,
        },
        ReleaseBundle::new().with("texture staging", staging),
    );
    for op in ops {
        queue.enqueue(op, 0).unwrap();
    }
}

#[test]
fn test_texture_upload_in_one_batch_separates_rounds() {
    let mut queue = queue(4, 4);
    let mut recording = Recording::default();

    enqueue_texture_upload(&mut queue, 100, 1);
    flush(&mut queue, &mut recording);

    let commands = recording.all();
    assert_eq!(
        commands,
        vec![
            Command::Barrier {
                images: vec![1],
                new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            },
            Command::Round,
            Command::Upload { image: 1 },
            Command::Round,
            Command::Barrier {
                images: vec![1],
                new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            Command::Round,
            Command::Release(vec!["texture staging"]),
        ]
    );

    // Every pair of consecutive non-barrier commands of different kinds is
    // separated by a round barrier.
    for pair in commands.windows(2) {
        if pair.iter().all(|c| !matches!(c, Command::Round)) {
            assert_eq!(
                std::mem::discriminant(&pair[0]),
                std::mem::discriminant(&pair[1]),
                "missing barrier between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }
}

#[test]
fn test_rounds_beyond_batch_carry_to_next_flush() {
    let mut queue = queue(4, 8);
    let mut recording = Recording::default();

    queue.enqueue(copy(1, 0), 0).unwrap();
    queue.enqueue(copy(2, MAX_ROUNDS + 1), 0).unwrap();

    flush(&mut queue, &mut recording);
    assert_eq!(recording.flush_of_copy(1), Some(0));
    assert_eq!(recording.flush_of_copy(2), None);
    assert_eq!(queue.pending(), 1);

    flush(&mut queue, &mut recording);
    assert_eq!(recording.flush_of_copy(2), Some(1));
}

#[test]
fn test_buffer_upload_releases_staging_after_copy() {
    let mut queue = queue(4, 4);
    let mut recording = Recording::default();

    // Two uploads in one frame each own their staging buffer.
    for (staging, dst) in [(100, 1), (101, 1)] {
        let ops = buffer_upload_ops(
            vk::Buffer::from_raw(staging),
            vk::Buffer::from_raw(dst),
            vk::BufferCopy::default(),
            ReleaseBundle::new().with("staging buffer", staging),
        );
        for op in ops {
            queue.enqueue(op, 0).unwrap();
        }
    }
    flush(&mut queue, &mut recording);

    assert_eq!(
        recording.batches,
        vec![vec![
            Command::Copy { src: 100 },
            Command::Copy { src: 101 },
            Command::Round,
            Command::Release(vec!["staging buffer"]),
            Command::Release(vec!["staging buffer"]),
        ]]
    );
}

#[test]
fn test_growth_after_pending_upload_copies_uploaded_contents() {
    // A texture upload is pending in the current slot when the pool grows.
    // Growth ops start at the first free round, so the old image is filled
    // before it is copied into the new pool and released.
    let mut queue = queue(4, 16);
    let mut recording = Recording::default();

    let (old_image, new_image) = (1, 2);
    enqueue_texture_upload(&mut queue, 100, old_image);

    let base = queue.next_free_round();
    assert_eq!(base, 4);

    let growth = growth_ops(
        vec![(
            vk::Image::from_raw(old_image),
            vk::Image::from_raw(new_image),
            vk::Extent3D::default(),
        )],
        ReleaseBundle::new()
            .with("texture image", old_image)
            .with("texture pool", ()),
        base,
    );
    for op in growth {
        queue.enqueue(op, 0).unwrap();
    }

    flush(&mut queue, &mut recording);
    assert_eq!(queue.pending(), 0);
    let commands = recording.all();
    let position = |command: &Command| {
        commands
            .iter()
            .position(|c| c == command)
            .unwrap_or_else(|| panic!("{:?} not recorded in {:?}", command, commands))
    };

    let uploaded = position(&Command::Upload { image: old_image });
    let readable = position(&Command::Barrier {
        images: vec![old_image],
        new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    });
    let source = position(&Command::Barrier {
        images: vec![old_image],
        new: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    });
    let copied = position(&Command::ImageCopy {
        src: old_image,
        dst: new_image,
    });
    let moved = position(&Command::Barrier {
        images: vec![new_image],
        new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    });
    let released = position(&Command::Release(vec!["texture image", "texture pool"]));

    assert!(uploaded < readable);
    assert!(readable < source);
    assert!(source < copied);
    assert!(copied < moved);
    assert!(moved < released);
    for (earlier, later) in [(uploaded, source), (source, copied), (copied, moved), (moved, released)] {
        assert!(
            commands[earlier + 1..later].contains(&Command::Round),
            "no round barrier between {:?} and {:?}",
            commands[earlier],
            commands[later]
        );
    }
}

#[test]
fn test_growth_beyond_batch_rounds_finishes_next_flush() {
    // With few rounds per batch, the growth tail carries over and the old
    // pool is released only after the copy was recorded.
    let mut queue = DeferredQueue::new(4, 16, 4 * 4 - 1);
    let mut recording = Recording::default();

    enqueue_texture_upload(&mut queue, 100, 1);
    let base = queue.next_free_round();
    for op in growth_ops(
        vec![(vk::Image::from_raw(1), vk::Image::from_raw(2), vk::Extent3D::default())],
        ReleaseBundle::new().with("texture pool", ()),
        base,
    ) {
        queue.enqueue(op, 0).unwrap();
    }

    for _ in 0..2 {
        recording.batches.push(Vec::new());
        let ops = queue.take_current();
        let outcome = record_batch(ops, 4, &mut recording).unwrap();
        queue.advance();
        queue.fold_carry(outcome.carry).unwrap();
    }
    assert_eq!(queue.pending(), 0);

    let first = &recording.batches[0];
    let second = &recording.batches[1];
    assert!(first.contains(&Command::Upload { image: 1 }));
    assert!(!first.contains(&Command::Release(vec!["texture pool"])));
    assert!(second.contains(&Command::ImageCopy { src: 1, dst: 2 }));
    assert_eq!(second.last(), Some(&Command::Release(vec!["texture pool"])));
}
