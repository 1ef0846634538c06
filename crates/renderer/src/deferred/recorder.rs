//! Records one deferred batch in rounds.
//!
//! Ops are grouped by `sub_delay`. Rounds are recorded in ascending order,
//! each separated from the previous non-empty round by a global memory
//! barrier, and ops inside a round keep their enqueue order. Ops whose round
//! does not fit in this batch are carried into the next one.

use std::collections::BTreeMap;

use ash::vk;
use tracing::{debug, trace, warn};

use super::op::{
    AccelerationStructureBuild, DeferredKind, DeferredOp, ReleaseBundle, TransitionMasks,
    transition_masks,
};
use super::queue::DeferredQueue;
use crate::error::DeferredError;

/// Destination of recorded deferred commands.
///
/// Implemented over a Vulkan command buffer for rendering and by a
/// recording mock in tests.
pub trait CommandSink {
    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy);

    /// `dst` is in `TRANSFER_DST_OPTIMAL`.
    fn copy_buffer_to_image(&mut self, src: vk::Buffer, dst: vk::Image, region: vk::BufferImageCopy);

    /// Whole-image copy, `TRANSFER_SRC_OPTIMAL` to `TRANSFER_DST_OPTIMAL`.
    fn copy_image(&mut self, src: vk::Image, dst: vk::Image, extent: vk::Extent3D);

    fn image_barrier(
        &mut self,
        images: &[vk::Image],
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        masks: TransitionMasks,
    );

    /// Makes every write of the previous round visible to the next one.
    fn round_barrier(&mut self);

    fn build_acceleration_structure(
        &mut self,
        build: &AccelerationStructureBuild,
    ) -> Result<(), DeferredError>;

    /// Takes ownership of resources to free once the batch retires.
    fn release(&mut self, bundle: ReleaseBundle);
}

/// What one call to [`record_batch`] did.
#[derive(Debug, Default)]
pub struct RecordOutcome {
    /// Ops recorded into the sink.
    pub executed: usize,
    /// Non-empty rounds recorded.
    pub rounds: u32,
    /// Ops beyond `max_rounds`, rebased to the next batch.
    pub carry: Vec<DeferredOp>,
}

/// Records `ops` into `sink`, at most `max_rounds` rounds deep.
///
/// On error the batch is abandoned; cleanup bundles that were not reached
/// are still handed to the sink so nothing in flight is freed early.
pub fn record_batch<S: CommandSink + ?Sized>(
    ops: Vec<DeferredOp>,
    max_rounds: u32,
    sink: &mut S,
) -> Result<RecordOutcome, DeferredError> {
    let mut rounds: BTreeMap<u32, Vec<DeferredKind>> = BTreeMap::new();
    let mut outcome = RecordOutcome::default();

    for op in ops {
        if op.sub_delay < max_rounds {
            rounds.entry(op.sub_delay).or_default().push(op.kind);
        } else {
            outcome
                .carry
                .push(DeferredOp::new(op.sub_delay - max_rounds, op.kind));
        }
    }

    let mut pending = rounds.into_iter();
    while let Some((round, kinds)) = pending.next() {
        if outcome.rounds > 0 {
            sink.round_barrier();
        }
        outcome.rounds += 1;
        trace!("Recording deferred round {} ({} ops)", round, kinds.len());

        let mut kinds = kinds.into_iter();
        while let Some(kind) = kinds.next() {
            if let Err(e) = record_op(kind, sink) {
                let rest = kinds
                    .chain(pending.by_ref().flat_map(|(_, kinds)| kinds))
                    .chain(outcome.carry.drain(..).map(|op| op.kind));
                release_cleanups(rest, sink);
                return Err(e);
            }
            outcome.executed += 1;
        }
    }

    debug!(
        "Recorded deferred batch: {} ops in {} round(s), {} carried",
        outcome.executed,
        outcome.rounds,
        outcome.carry.len()
    );
    Ok(outcome)
}

/// What one call to [`flush_current`] did.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    /// A batch was recorded into the sink and must be submitted.
    pub recorded: bool,
    pub executed: usize,
    /// Set when carried ops were lost; the batch itself is still valid.
    pub overflow: Option<DeferredError>,
}

/// Records the cursor slot into `sink` and rotates the queue.
///
/// Carried ops are folded into the next slot. Those that do not fit are
/// dropped, their cleanup bundles go to `sink` so they retire with this
/// batch, and the loss is reported in [`FlushOutcome::overflow`]. On a
/// record error the cursor still rotates.
pub fn flush_current<S: CommandSink + ?Sized>(
    queue: &mut DeferredQueue,
    max_rounds: u32,
    sink: &mut S,
) -> Result<FlushOutcome, DeferredError> {
    if queue.current_len() == 0 {
        queue.advance();
        return Ok(FlushOutcome::default());
    }

    let ops = queue.take_current();
    let recorded = record_batch(ops, max_rounds, sink);
    queue.advance();
    let outcome = recorded?;

    let mut flushed = FlushOutcome {
        recorded: true,
        executed: outcome.executed,
        overflow: None,
    };
    if outcome.carry.is_empty() {
        return Ok(flushed);
    }

    warn!(
        "{} deferred op(s) beyond {} rounds carried into the next batch",
        outcome.carry.len(),
        max_rounds
    );
    if let Err((error, lost)) = queue.fold_carry(outcome.carry) {
        warn!("{}", error);
        flushed.overflow = Some(error);
        release_cleanups(lost.into_iter().map(|op| op.kind), sink);
    }
    Ok(flushed)
}

fn record_op<S: CommandSink + ?Sized>(kind: DeferredKind, sink: &mut S) -> Result<(), DeferredError> {
    match kind {
        DeferredKind::CopyBufferToBuffer { src, dst, region } => sink.copy_buffer(src, dst, region),
        DeferredKind::CopyBufferToImage { src, dst, region } => {
            sink.copy_buffer_to_image(src, dst, region)
        }
        DeferredKind::CopyImagesToImages { copies } => {
            for (src, dst, extent) in copies {
                sink.copy_image(src, dst, extent);
            }
        }
        DeferredKind::LayoutTransition { images, old, new } => {
            let masks = transition_masks(old, new)?;
            sink.image_barrier(&images, old, new, masks);
        }
        DeferredKind::AccelerationStructureBuild(build) => {
            sink.build_acceleration_structure(&build)?
        }
        DeferredKind::Cleanup(bundle) => sink.release(bundle),
    }
    Ok(())
}

fn release_cleanups<S: CommandSink + ?Sized>(kinds: impl Iterator<Item = DeferredKind>, sink: &mut S) {
    for kind in kinds {
        if let DeferredKind::Cleanup(bundle) = kind {
            sink.release(bundle);
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Event {
        Copy(u64),
        Upload(u64),
        ImageCopy(u64, u64),
        Barrier(Vec<u64>, vk::ImageLayout),
        Round,
        Build,
        Release(Vec<&'static str>),
    }

    #[derive(Default)]
    struct MockSink {
        events: Vec<Event>,
        supports_builds: bool,
    }

    impl CommandSink for MockSink {
        fn copy_buffer(&mut self, src: vk::Buffer, _dst: vk::Buffer, _region: vk::BufferCopy) {
            self.events.push(Event::Copy(src.as_raw()));
        }

        fn copy_buffer_to_image(
            &mut self,
            src: vk::Buffer,
            _dst: vk::Image,
            _region: vk::BufferImageCopy,
        ) {
            self.events.push(Event::Upload(src.as_raw()));
        }

        fn copy_image(&mut self, src: vk::Image, dst: vk::Image, _extent: vk::Extent3D) {
            self.events.push(Event::ImageCopy(src.as_raw(), dst.as_raw()));
        }

        fn image_barrier(
            &mut self,
            images: &[vk::Image],
            _old: vk::ImageLayout,
            new: vk::ImageLayout,
            _masks: TransitionMasks,
        ) {
            self.events.push(Event::Barrier(
                images.iter().map(|image| image.as_raw()).collect(),
                new,
            ));
        }

        fn round_barrier(&mut self) {
            self.events.push(Event::Round);
        }

        fn build_acceleration_structure(
            &mut self,
            _build: &AccelerationStructureBuild,
        ) -> Result<(), DeferredError> {
            if !self.supports_builds {
                return Err(DeferredError::AccelerationStructuresUnsupported);
            }
            self.events.push(Event::Build);
            Ok(())
        }

        fn release(&mut self, bundle: ReleaseBundle) {
            self.events.push(Event::Release(bundle.labels().collect()));
        }
    }

    fn copy(tag: u64, sub_delay: u32) -> DeferredOp {
        DeferredOp::new(
            sub_delay,
            DeferredKind::CopyBufferToBuffer {
                src: vk::Buffer::from_raw(tag),
                dst: vk::Buffer::from_raw(tag + 100),
                region: vk::BufferCopy::default(),
            },
        )
    }

    fn cleanup(label: &'static str, sub_delay: u32) -> DeferredOp {
        DeferredOp::new(
            sub_delay,
            DeferredKind::Cleanup(ReleaseBundle::new().with(label, ())),
        )
    }

    fn build(sub_delay: u32) -> DeferredOp {
        DeferredOp::new(
            sub_delay,
            DeferredKind::AccelerationStructureBuild(AccelerationStructureBuild {
                ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
                dst: vk::AccelerationStructureKHR::null(),
                scratch: 0,
                geometries: Vec::new(),
            }),
        )
    }

    #[test]
    fn test_rounds_recorded_in_order_with_barriers() {
        let mut sink = MockSink::default();
        let ops = vec![copy(1, 2), copy(2, 0), copy(3, 1), copy(4, 0), copy(5, 2)];

        let outcome = record_batch(ops, 8, &mut sink).unwrap();

        assert_eq!(outcome.executed, 5);
        assert_eq!(outcome.rounds, 3);
        assert!(outcome.carry.is_empty());
        assert_eq!(
            sink.events,
            vec![
                Event::Copy(2),
                Event::Copy(4),
                Event::Round,
                Event::Copy(3),
                Event::Round,
                Event::Copy(1),
                Event::Copy(5),
            ]
        );
    }

    #[test]
    fn test_empty_rounds_are_skipped() {
        let mut sink = MockSink::default();
        let outcome = record_batch(vec![copy(1, 3), copy(2, 0)], 8, &mut sink).unwrap();

        assert_eq!(outcome.rounds, 2);
        assert_eq!(
            sink.events,
            vec![Event::Copy(2), Event::Round, Event::Copy(1)]
        );
    }

    #[test]
    fn test_empty_batch_records_nothing() {
        let mut sink = MockSink::default();
        let outcome = record_batch(Vec::new(), 4, &mut sink).unwrap();
        assert_eq!(outcome.executed, 0);
        assert_eq!(outcome.rounds, 0);
        assert!(sink.events.is_empty());
    }

    #[test]
    fn test_rounds_beyond_limit_are_carried_and_rebased() {
        let mut sink = MockSink::default();
        let ops = vec![copy(1, 0), copy(2, 2), copy(3, 5), copy(4, 1)];

        let outcome = record_batch(ops, 2, &mut sink).unwrap();

        assert_eq!(outcome.executed, 2);
        let carried: Vec<u32> = outcome.carry.iter().map(|op| op.sub_delay).collect();
        assert_eq!(carried, vec![0, 3]);
        assert_eq!(
            sink.events,
            vec![Event::Copy(1), Event::Round, Event::Copy(4)]
        );
    }

    #[test]
    fn test_texture_upload_sequence() {
        let mut sink = MockSink::default();
        let image = vk::Image::from_raw(7);
        let staging = vk::Buffer::from_raw(9);
        let ops = vec![
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
                    src: staging,
                    dst: image,
                    region: vk::BufferImageCopy::default(),
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
            cleanup("staging", 3),
        ];

        let outcome = record_batch(ops, 8, &mut sink).unwrap();

        assert_eq!(outcome.rounds, 4);
        assert_eq!(
            sink.events,
            vec![
                Event::Barrier(vec![7], vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                Event::Round,
                Event::Upload(9),
                Event::Round,
                Event::Barrier(vec![7], vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                Event::Round,
                Event::Release(vec!["staging"]),
            ]
        );
    }

    #[test]
    fn test_image_copies_expand_per_pair() {
        let mut sink = MockSink::default();
        let extent = vk::Extent3D {
            width: 4,
            height: 4,
            depth: 1,
        };
        let op = DeferredOp::new(
            0,
            DeferredKind::CopyImagesToImages {
                copies: vec![
                    (vk::Image::from_raw(1), vk::Image::from_raw(11), extent),
                    (vk::Image::from_raw(2), vk::Image::from_raw(12), extent),
                ],
            },
        );

        let outcome = record_batch(vec![op], 1, &mut sink).unwrap();
        assert_eq!(outcome.executed, 1);
        assert_eq!(
            sink.events,
            vec![Event::ImageCopy(1, 11), Event::ImageCopy(2, 12)]
        );
    }

    #[test]
    fn test_failed_build_still_releases_pending_cleanups() {
        let mut sink = MockSink::default();
        let ops = vec![
            copy(1, 0),
            build(1),
            cleanup("after-build", 1),
            cleanup("later-round", 2),
            cleanup("carried", 9),
        ];

        let err = record_batch(ops, 4, &mut sink).unwrap_err();

        assert_eq!(err, DeferredError::AccelerationStructuresUnsupported);
        assert_eq!(
            sink.events,
            vec![
                Event::Copy(1),
                Event::Round,
                Event::Release(vec!["after-build"]),
                Event::Release(vec!["later-round"]),
                Event::Release(vec!["carried"]),
            ]
        );
    }

    #[test]
    fn test_supported_build_is_recorded() {
        let mut sink = MockSink {
            supports_builds: true,
            ..Default::default()
        };
        let outcome = record_batch(vec![build(0)], 1, &mut sink).unwrap();
        assert_eq!(outcome.executed, 1);
        assert_eq!(sink.events, vec![Event::Build]);
    }

    #[test]
    fn test_flush_reports_carry_that_does_not_fit() {
        let mut queue = DeferredQueue::new(2, 2, 15);
        let mut sink = MockSink::default();
        queue.enqueue(copy(1, 0), 0).unwrap();
        queue.enqueue(cleanup("carried", 5), 0).unwrap();
        queue.enqueue(copy(7, 0), 1).unwrap();
        queue.enqueue(copy(8, 0), 1).unwrap();

        let outcome = flush_current(&mut queue, 2, &mut sink).unwrap();

        assert!(outcome.recorded);
        assert_eq!(outcome.executed, 1);
        assert_eq!(
            outcome.overflow,
            Some(DeferredError::CarryOverflow {
                slot: 1,
                capacity: 2,
                lost: 1
            })
        );
        // The lost cleanup retires with the batch that was just recorded.
        assert_eq!(
            sink.events,
            vec![Event::Copy(1), Event::Release(vec!["carried"])]
        );
        assert_eq!(queue.cursor(), 1);
        assert_eq!(queue.current_len(), 2);
    }

    #[test]
    fn test_flush_folds_carry_that_fits() {
        let mut queue = DeferredQueue::new(2, 4, 15);
        let mut sink = MockSink::default();
        queue.enqueue(copy(1, 0), 0).unwrap();
        queue.enqueue(copy(2, 3), 0).unwrap();

        let outcome = flush_current(&mut queue, 2, &mut sink).unwrap();
        assert_eq!(outcome.overflow, None);
        assert_eq!(queue.next_free_round(), 2);

        let outcome = flush_current(&mut queue, 2, &mut sink).unwrap();
        assert_eq!(outcome.executed, 1);
        assert_eq!(sink.events, vec![Event::Copy(1), Event::Copy(2)]);
    }

    #[test]
    fn test_flush_of_empty_slot_only_rotates() {
        let mut queue = DeferredQueue::new(3, 2, 7);
        let mut sink = MockSink::default();

        let outcome = flush_current(&mut queue, 2, &mut sink).unwrap();
        assert!(!outcome.recorded);
        assert_eq!(queue.cursor(), 1);
        assert!(sink.events.is_empty());
    }

    #[test]
    fn test_flush_rotates_even_when_recording_fails() {
        let mut queue = DeferredQueue::new(3, 2, 7);
        let mut sink = MockSink::default();
        queue.enqueue(build(0), 0).unwrap();

        let err = flush_current(&mut queue, 2, &mut sink).unwrap_err();
        assert_eq!(err, DeferredError::AccelerationStructuresUnsupported);
        assert_eq!(queue.cursor(), 1);
        assert_eq!(queue.pending(), 0);
    }
}
