//! Messages and the mailboxes that queue them.

use crate::allocator::{BufferId, RingAllocator};
use crate::error::{CommError, CommResult};
use crate::types::{MessageTag, MessageUnit, Rank};

/// Unit of transfer between ranks.
///
/// The payload lives in the ring allocator of the mailbox the message was
/// queued in; a message only names its buffer. Several messages may name the
/// same buffer (one payload sent to many destinations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    payload: Option<BufferId>,
    count: usize,
    tag: MessageTag,
    source: Rank,
    destination: Rank,
}

impl Message {
    /// Message carrying `count` units of `payload`.
    pub fn new(
        payload: BufferId,
        count: usize,
        tag: MessageTag,
        source: Rank,
        destination: Rank,
    ) -> Self {
        Self {
            payload: Some(payload),
            count,
            tag,
            source,
            destination,
        }
    }

    /// Message with no payload; the tag alone is the signal.
    pub fn empty(tag: MessageTag, source: Rank, destination: Rank) -> Self {
        Self {
            payload: None,
            count: 0,
            tag,
            source,
            destination,
        }
    }

    /// Buffer holding the payload, if any.
    pub fn payload(&self) -> Option<BufferId> {
        self.payload
    }

    /// Number of payload units.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Message tag.
    pub fn tag(&self) -> MessageTag {
        self.tag
    }

    /// Sending rank.
    pub fn source(&self) -> Rank {
        self.source
    }

    /// Receiving rank.
    pub fn destination(&self) -> Rank {
        self.destination
    }
}

/// Bounded message queue paired with the ring backing its payloads.
#[derive(Debug)]
pub struct Mailbox {
    messages: Vec<Message>,
    capacity: usize,
    allocator: RingAllocator,
}

impl Mailbox {
    /// Create a mailbox holding up to `capacity` messages whose payloads
    /// come from `allocator`.
    pub fn new(capacity: usize, allocator: RingAllocator) -> Self {
        Self {
            messages: Vec::with_capacity(capacity),
            capacity,
            allocator,
        }
    }

    /// Allocate a payload buffer of `units` units.
    pub fn allocate(&mut self, units: usize) -> CommResult<BufferId> {
        self.allocator.allocate(units)
    }

    /// Allocate a buffer, copy `units` into it and queue the message.
    pub fn push_units(
        &mut self,
        units: &[MessageUnit],
        tag: MessageTag,
        source: Rank,
        destination: Rank,
    ) -> CommResult<()> {
        if units.is_empty() {
            return self.push(Message::empty(tag, source, destination));
        }
        if self.is_full() {
            return Err(CommError::MailboxFull {
                capacity: self.capacity,
            });
        }
        let id = self.allocator.allocate(units.len())?;
        self.allocator.units_mut(id)?[..units.len()].copy_from_slice(units);
        self.push(Message::new(id, units.len(), tag, source, destination))
    }

    /// Queue a message.
    pub fn push(&mut self, message: Message) -> CommResult<()> {
        if self.is_full() {
            return Err(CommError::MailboxFull {
                capacity: self.capacity,
            });
        }
        self.messages.push(message);
        Ok(())
    }

    /// Payload units of `message`.
    pub fn units(&self, message: &Message) -> CommResult<&[MessageUnit]> {
        match message.payload {
            Some(id) => Ok(&self.allocator.units(id)?[..message.count]),
            None => Ok(&[]),
        }
    }

    /// Queued messages in enqueue order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no message is queued.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the queue reached its capacity.
    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.capacity
    }

    /// Drop every queued message. Buffers stay lent until [`Mailbox::recycle`].
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Free the buffers lent out during the previous tick.
    pub fn recycle(&mut self) {
        self.allocator.recycle();
    }

    /// Backing ring.
    pub fn allocator(&self) -> &RingAllocator {
        &self.allocator
    }

    /// Mutable backing ring.
    pub fn allocator_mut(&mut self) -> &mut RingAllocator {
        &mut self.allocator
    }

    /// Split into the queue and the ring so both can be used at once.
    pub(crate) fn parts_mut(&mut self) -> (&mut Vec<Message>, &mut RingAllocator) {
        (&mut self.messages, &mut self.allocator)
    }
}
