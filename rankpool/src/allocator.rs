//! Fixed-capacity ring of reusable message buffers.
//!
//! A slot moves through three states:
//!
//! ```text
//!            allocate            mark_dirty
//!   Free ─────────────► Lent ─────────────► Dirty
//!    ▲                   │                   │
//!    │     recycle       │      salvage      │
//!    └───────────────────┴───────────────────┘
//! ```
//!
//! `Lent` slots belong to whoever is filling or reading them during the
//! current tick and become free again on [`RingAllocator::recycle`]. `Dirty`
//! slots belong to an in-flight send and only come back through
//! [`RingAllocator::salvage`].
//!
//! Handles carry a generation so a handle kept past its slot's lifetime is
//! rejected instead of reading someone else's data.

use crate::error::{CommError, CommResult};
use crate::types::MessageUnit;

/// Handle to a slot of a [`RingAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    index: u32,
    generation: u32,
}

impl BufferId {
    /// Slot index inside the ring.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Lent,
    Dirty,
}

#[derive(Debug)]
struct RingSlot {
    units: Box<[MessageUnit]>,
    state: SlotState,
    generation: u32,
}

/// Pool of equally sized buffers handed out in ring order.
#[derive(Debug)]
pub struct RingAllocator {
    label: &'static str,
    slots: Vec<RingSlot>,
    cursor: usize,
    unit_capacity: usize,
    dirty: usize,
}

impl RingAllocator {
    /// Create a ring of `slots` buffers of `unit_capacity` units each.
    pub fn new(label: &'static str, slots: usize, unit_capacity: usize) -> Self {
        let slots = (0..slots)
            .map(|_| RingSlot {
                units: vec![0; unit_capacity].into_boxed_slice(),
                state: SlotState::Free,
                generation: 0,
            })
            .collect();
        Self {
            label,
            slots,
            cursor: 0,
            unit_capacity,
            dirty: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Units per slot.
    pub fn unit_capacity(&self) -> usize {
        self.unit_capacity
    }

    /// Slots currently owned by in-flight operations.
    pub fn dirty_count(&self) -> usize {
        self.dirty
    }

    /// Slots available for allocation.
    pub fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Free)
            .count()
    }

    /// Hand out the next free slot able to hold `units` units.
    ///
    /// The scan starts after the previously allocated slot and visits each
    /// slot at most once.
    pub fn allocate(&mut self, units: usize) -> CommResult<BufferId> {
        if units > self.unit_capacity {
            return Err(CommError::BufferTooLarge {
                requested: units,
                capacity: self.unit_capacity,
            });
        }

        let count = self.slots.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let slot = &mut self.slots[index];
            if slot.state != SlotState::Free {
                continue;
            }
            slot.state = SlotState::Lent;
            slot.generation = slot.generation.wrapping_add(1);
            self.cursor = (index + 1) % count;
            return Ok(BufferId {
                index: index as u32,
                generation: slot.generation,
            });
        }

        Err(CommError::OutOfBuffers {
            pool: self.label,
            slots: count,
        })
    }

    /// Record that `id` now backs an in-flight operation.
    pub fn mark_dirty(&mut self, id: BufferId) -> CommResult<()> {
        let slot = self.slot_mut(id)?;
        if slot.state == SlotState::Lent {
            slot.state = SlotState::Dirty;
            self.dirty += 1;
        }
        Ok(())
    }

    /// Return a dirty slot to the free pool once its operation completed.
    pub fn salvage(&mut self, id: BufferId) -> CommResult<()> {
        let slot = self.slot_mut(id)?;
        if slot.state == SlotState::Dirty {
            slot.state = SlotState::Free;
            self.dirty -= 1;
            tracing::debug!("{} ring: salvaged slot {}", self.label, id.index);
        }
        Ok(())
    }

    /// Whether `id` is currently protected as dirty.
    pub fn is_dirty(&self, id: BufferId) -> bool {
        self.slot(id)
            .map(|slot| slot.state == SlotState::Dirty)
            .unwrap_or(false)
    }

    /// Free every slot lent out since the previous call. Dirty slots stay put.
    pub fn recycle(&mut self) {
        for slot in &mut self.slots {
            if slot.state == SlotState::Lent {
                slot.state = SlotState::Free;
            }
        }
    }

    /// Read access to a slot's units.
    pub fn units(&self, id: BufferId) -> CommResult<&[MessageUnit]> {
        Ok(&self.slot(id)?.units)
    }

    /// Write access to a lent slot's units.
    ///
    /// Dirty slots are read-only until salvaged.
    pub fn units_mut(&mut self, id: BufferId) -> CommResult<&mut [MessageUnit]> {
        let slot = self.slot_mut(id)?;
        if slot.state != SlotState::Lent {
            return Err(CommError::StaleBuffer {
                index: id.index(),
            });
        }
        Ok(&mut slot.units)
    }

    fn slot(&self, id: BufferId) -> CommResult<&RingSlot> {
        match self.slots.get(id.index()) {
            Some(slot) if slot.generation == id.generation && slot.state != SlotState::Free => {
                Ok(slot)
            }
            _ => Err(CommError::StaleBuffer { index: id.index() }),
        }
    }

    fn slot_mut(&mut self, id: BufferId) -> CommResult<&mut RingSlot> {
        match self.slots.get_mut(id.index()) {
            Some(slot) if slot.generation == id.generation && slot.state != SlotState::Free => {
                Ok(slot)
            }
            _ => Err(CommError::StaleBuffer { index: id.index() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_walks_the_ring() {
        let mut ring = RingAllocator::new("test", 3, 4);
        let a = ring.allocate(4).expect("slot");
        let b = ring.allocate(1).expect("slot");
        let c = ring.allocate(0).expect("slot");
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert!(matches!(
            ring.allocate(1),
            Err(CommError::OutOfBuffers { slots: 3, .. })
        ));
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mut ring = RingAllocator::new("test", 1, 4);
        assert!(matches!(
            ring.allocate(5),
            Err(CommError::BufferTooLarge {
                requested: 5,
                capacity: 4
            })
        ));
    }

    #[test]
    fn test_dirty_slot_survives_recycle_until_salvaged() {
        let mut ring = RingAllocator::new("test", 1, 2);
        let id = ring.allocate(2).expect("slot");
        ring.mark_dirty(id).expect("lent slot");
        ring.recycle();

        assert!(ring.is_dirty(id));
        assert!(matches!(
            ring.allocate(1),
            Err(CommError::OutOfBuffers { .. })
        ));

        ring.salvage(id).expect("dirty slot");
        assert_eq!(ring.dirty_count(), 0);
        let again = ring.allocate(1).expect("salvaged slot");
        assert_eq!(again.index(), id.index());
        assert_ne!(again, id);
    }

    #[test]
    fn test_recycle_frees_lent_slots() {
        let mut ring = RingAllocator::new("test", 2, 2);
        ring.allocate(1).expect("slot");
        ring.allocate(1).expect("slot");
        assert_eq!(ring.free_count(), 0);
        ring.recycle();
        assert_eq!(ring.free_count(), 2);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut ring = RingAllocator::new("test", 1, 2);
        let old = ring.allocate(1).expect("slot");
        ring.recycle();
        assert!(matches!(ring.units(old), Err(CommError::StaleBuffer { index: 0 })));
        let _new = ring.allocate(1).expect("slot");
        assert!(matches!(ring.units(old), Err(CommError::StaleBuffer { .. })));
    }

    #[test]
    fn test_dirty_slot_is_read_only() {
        let mut ring = RingAllocator::new("test", 1, 2);
        let id = ring.allocate(2).expect("slot");
        ring.units_mut(id).expect("lent")[0] = 7;
        ring.mark_dirty(id).expect("lent slot");
        assert!(ring.units_mut(id).is_err());
        assert_eq!(ring.units(id).expect("dirty readable")[0], 7);
    }
}
