//! Calendar queue of deferred operations.
//!
//! A ring of `depth` fixed-capacity slots. `enqueue(op, delay)` targets slot
//! `(cursor + delay) % depth`; every flush takes the cursor slot and rotates
//! the cursor, so an op enqueued with delay `d` is recorded by the flush that
//! follows `d` earlier flushes.

use frameflow_core::{BoundedVec, EngineConfig};
use tracing::{debug, warn};

use ash::vk;

use super::op::{DeferredKind, DeferredOp, transition_masks};
use crate::error::DeferredError;

/// An op the queue refused, handed back with the reason.
#[derive(Debug)]
pub struct Rejected {
    pub error: DeferredError,
    pub op: DeferredOp,
}

pub struct DeferredQueue {
    slots: Vec<BoundedVec<DeferredOp>>,
    cursor: usize,
    max_sub_delay: u32,
}

impl DeferredQueue {
    /// `depth` slots of `slot_capacity` ops each. Rounds above
    /// `max_sub_delay` are rejected.
    pub fn new(depth: usize, slot_capacity: usize, max_sub_delay: u32) -> Self {
        let depth = depth.max(1);
        Self {
            slots: (0..depth)
                .map(|_| BoundedVec::with_capacity(slot_capacity))
                .collect(),
            cursor: 0,
            max_sub_delay,
        }
    }

    /// Sized from a validated configuration.
    pub fn from_config(config: &EngineConfig) -> frameflow_core::Result<Self> {
        config.validate()?;
        Ok(Self::new(
            config.deferred_queue_depth,
            config.deferred_slot_capacity,
            config.max_sub_delay(),
        ))
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Fixed number of ops a slot holds.
    #[inline]
    pub fn slot_capacity(&self) -> usize {
        self.slots[0].capacity()
    }

    /// Largest accepted `sub_delay`.
    #[inline]
    pub fn max_sub_delay(&self) -> u32 {
        self.max_sub_delay
    }

    /// Places `op` `delay` flushes ahead and returns the slot index.
    ///
    /// A full slot, an out-of-range delay, or an unmapped layout pair hands
    /// the op back untouched; entries already queued are never disturbed.
    pub fn enqueue(&mut self, op: DeferredOp, delay: usize) -> Result<usize, Rejected> {
        if let Err(error) = self.validate(&op, delay) {
            return Err(Rejected { error, op });
        }

        let slot = self.slot_for(delay);
        let list = &mut self.slots[slot];
        let capacity = list.capacity();
        match list.push(op) {
            Ok(()) => Ok(slot),
            Err(op) => {
                warn!(
                    "Deferred slot {} full, dropping {} op",
                    slot,
                    op.kind.name()
                );
                Err(Rejected {
                    error: DeferredError::SlotFull { slot, capacity },
                    op,
                })
            }
        }
    }

    fn validate(&self, op: &DeferredOp, delay: usize) -> Result<(), DeferredError> {
        if delay >= self.depth() {
            return Err(DeferredError::DelayOutOfRange {
                delay: u32::try_from(delay).unwrap_or(u32::MAX),
                max: u32::try_from(self.depth() - 1).unwrap_or(u32::MAX),
            });
        }
        if op.sub_delay > self.max_sub_delay {
            return Err(DeferredError::DelayOutOfRange {
                delay: op.sub_delay,
                max: self.max_sub_delay,
            });
        }
        if let DeferredKind::LayoutTransition { old, new, .. } = &op.kind {
            transition_masks(*old, *new)?;
        }
        Ok(())
    }

    fn slot_for(&self, delay: usize) -> usize {
        (self.cursor + delay) % self.depth()
    }

    /// Free entries in the slot `delay` flushes ahead.
    pub fn remaining(&self, delay: usize) -> usize {
        self.slots[self.slot_for(delay % self.depth())].remaining()
    }

    /// Ops waiting in the slot the next flush will take.
    pub fn current_len(&self) -> usize {
        self.slots[self.cursor].len()
    }

    /// Ops waiting across every slot.
    pub fn pending(&self) -> usize {
        self.slots.iter().map(BoundedVec::len).sum()
    }

    /// First round after every op already waiting in the current slot.
    pub fn next_free_round(&self) -> u32 {
        self.slots[self.cursor]
            .iter()
            .map(|op| op.sub_delay + 1)
            .max()
            .unwrap_or(0)
    }

    /// Removes the current slot's ops in enqueue order.
    pub fn take_current(&mut self) -> Vec<DeferredOp> {
        self.slots[self.cursor].drain().collect()
    }

    /// Rotates the cursor to the next slot.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.depth();
    }

    /// Appends ops carried over from the previous batch to the current slot.
    ///
    /// Stops at the first op that does not fit; it and every op after it
    /// are handed back with a [`DeferredError::CarryOverflow`].
    pub fn fold_carry(&mut self, carry: Vec<DeferredOp>) -> Result<(), (DeferredError, Vec<DeferredOp>)> {
        let slot = self.cursor;
        let list = &mut self.slots[slot];
        let capacity = list.capacity();
        let mut carry = carry.into_iter();
        while let Some(op) = carry.next() {
            if let Err(op) = list.push(op) {
                let mut lost = vec![op];
                lost.extend(carry);
                let error = DeferredError::CarryOverflow {
                    slot,
                    capacity,
                    lost: lost.len(),
                };
                return Err((error, lost));
            }
        }
        Ok(())
    }

    /// Drops queued copies that read or write `buffer`.
    ///
    /// Used when the buffer is reallocated; returns how many ops were
    /// discarded.
    pub fn discard_buffer_ops(&mut self, buffer: vk::Buffer) -> usize {
        let before = self.pending();
        for slot in &mut self.slots {
            slot.retain(|op| !op.references_buffer(buffer));
        }
        let discarded = before - self.pending();
        if discarded > 0 {
            debug!(
                "Discarded {} deferred op(s) referencing a reallocated buffer",
                discarded
            );
        }
        discarded
    }

    /// Removes every queued op from every slot.
    pub fn drain_all(&mut self) -> Vec<DeferredOp> {
        let mut ops = Vec::with_capacity(self.pending());
        for slot in &mut self.slots {
            ops.extend(slot.drain());
        }
        ops
    }
}

impl std::fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("depth", &self.depth())
            .field("cursor", &self.cursor)
            .field("pending", &self.pending())
            .finish()
    }
}
