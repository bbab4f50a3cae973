//! Bounded registry of buffers owned by in-flight sends.
//!
//! A buffer handed to [`Transport::isend`] must not be reused until the
//! transport reports the send complete. The tracker keeps at most `K`
//! (buffer, request) pairs and tests one of them per call to
//! [`DirtyBufferTracker::check_next`], rotating through the slots so every
//! entry is tested once per `K` calls.
//!
//! Running out of slots is an error: the caller sends faster than the
//! transport completes, and `K` is too small for the workload.

use crate::allocator::{BufferId, RingAllocator};
use crate::error::{CommError, CommResult};
use crate::transport::{RequestHandle, Transport};

/// Free slot reserved by [`DirtyBufferTracker::allocate_dirty_slot`].
#[derive(Debug, PartialEq, Eq)]
pub struct DirtySlot(usize);

impl DirtySlot {
    /// Slot index.
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct DirtyEntry {
    buffer: BufferId,
    request: RequestHandle,
}

/// Fixed table of in-flight sends and the buffers they pin.
#[derive(Debug)]
pub struct DirtyBufferTracker {
    slots: Vec<Option<DirtyEntry>>,
    cursor: usize,
    registered: usize,
}

impl DirtyBufferTracker {
    /// Tracker with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            cursor: 0,
            registered: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of registered in-flight sends.
    pub fn len(&self) -> usize {
        self.registered
    }

    /// Whether no send is in flight.
    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    /// Find a free slot.
    ///
    /// # Errors
    ///
    /// [`CommError::AllBuffersDirty`] when every slot holds an in-flight send.
    pub fn allocate_dirty_slot(&self) -> CommResult<DirtySlot> {
        self.slots
            .iter()
            .position(Option::is_none)
            .map(DirtySlot)
            .ok_or(CommError::AllBuffersDirty {
                slots: self.slots.len(),
            })
    }

    /// Record that `buffer` is pinned by `request` and mark it dirty in
    /// `allocator`.
    pub fn register(
        &mut self,
        slot: DirtySlot,
        buffer: BufferId,
        request: RequestHandle,
        allocator: &mut RingAllocator,
    ) -> CommResult<()> {
        if self.slots[slot.0].is_some() {
            tracing::warn!("dirty slot {} reused while occupied", slot.0);
            return Err(CommError::AllBuffersDirty {
                slots: self.slots.len(),
            });
        }
        allocator.mark_dirty(buffer)?;
        self.slots[slot.0] = Some(DirtyEntry { buffer, request });
        self.registered += 1;
        Ok(())
    }

    /// Whether `buffer` is already pinned by a registered send.
    pub fn contains(&self, buffer: BufferId) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|entry| entry.buffer == buffer)
    }

    /// Test the slot under the cursor and advance the cursor.
    ///
    /// Returns whether a buffer was salvaged.
    pub fn check_next<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        allocator: &mut RingAllocator,
    ) -> CommResult<bool> {
        if self.slots.is_empty() {
            return Ok(false);
        }
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.slots.len();

        let Some(entry) = self.slots[index].as_ref() else {
            return Ok(false);
        };
        if !transport.test(&entry.request)? {
            return Ok(false);
        }

        let buffer = entry.buffer;
        self.slots[index] = None;
        self.registered -= 1;
        allocator.salvage(buffer)?;
        tracing::debug!("dirty slot {} released buffer {}", index, buffer.index());
        Ok(true)
    }

    /// Test every slot once in cursor order. Returns the number of buffers
    /// salvaged.
    pub fn check_all<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        allocator: &mut RingAllocator,
    ) -> CommResult<usize> {
        let mut salvaged = 0;
        for _ in 0..self.slots.len() {
            if self.check_next(transport, allocator)? {
                salvaged += 1;
            }
        }
        Ok(salvaged)
    }
}
