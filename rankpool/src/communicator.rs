//! Many logical workers sharing one outbox/inbox pair.
//!
//! A worker hands the communicator a query addressed to some rank and later
//! polls for the answer. Queries of the same destination and tag issued during
//! one tick are packed into a single message of `[worker, query units...]`
//! records:
//!
//! ```text
//!   worker 7 ──┐                              ┌── records for worker 7
//!   worker 9 ──┼─► [7,q][9,q][12,q] ─► rank R ─► [7,r..][9,r..][12,r..]
//!   worker 12 ─┘        query tag                    reply tag
//! ```
//!
//! The responder answers record by record, echoing the worker id, and the
//! communicator routes each reply record to its worker's slot. Every worker
//! has at most one outstanding query.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::context::CommContext;
use crate::error::{CommError, CommResult};
use crate::handlers::MessageHandler;
use crate::message::{Mailbox, Message};
use crate::types::{MessageTag, MessageUnit, Rank, WorkerId};

/// Shape of one kind of query and its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryType {
    /// Tag the responder answers with.
    pub reply_tag: MessageTag,
    /// Units per query, worker id excluded.
    pub query_units: usize,
    /// Units per reply, worker id excluded.
    pub reply_units: usize,
}

impl QueryType {
    fn query_record(&self) -> usize {
        self.query_units + 1
    }

    fn reply_record(&self) -> usize {
        self.reply_units + 1
    }

    /// Records that fit in one message of `max_units`, in both directions.
    fn records_per_message(&self, max_units: usize) -> usize {
        max_units / self.query_record().max(self.reply_record())
    }
}

#[derive(Debug)]
struct WorkerSlot {
    destination: Rank,
    tag: MessageTag,
    response: Vec<MessageUnit>,
    expected: usize,
}

impl WorkerSlot {
    fn is_processed(&self) -> bool {
        self.response.len() >= self.expected
    }
}

/// Packed queries waiting for the outbox.
#[derive(Debug)]
struct Batch {
    destination: Rank,
    tag: MessageTag,
    units: Vec<MessageUnit>,
}

/// Request/response multiplexer over a rank's mailboxes.
#[derive(Debug)]
pub struct VirtualCommunicator {
    rank: Rank,
    size: usize,
    max_message_units: usize,
    query_types: HashMap<MessageTag, QueryType>,
    reply_tags: HashMap<MessageTag, MessageTag>,
    slots: HashMap<WorkerId, WorkerSlot>,
    open: BTreeMap<(Rank, MessageTag), Vec<MessageUnit>>,
    ready: VecDeque<Batch>,
    queries_pushed: u64,
    messages_flushed: u64,
}

impl VirtualCommunicator {
    /// Communicator packing queries into messages of at most
    /// `max_message_units` units.
    pub fn new(context: &CommContext, max_message_units: usize) -> Self {
        Self {
            rank: context.rank(),
            size: context.size(),
            max_message_units,
            query_types: HashMap::new(),
            reply_tags: HashMap::new(),
            slots: HashMap::new(),
            open: BTreeMap::new(),
            ready: VecDeque::new(),
            queries_pushed: 0,
            messages_flushed: 0,
        }
    }

    /// Declare the shape of queries sent with `tag`.
    pub fn set_query_type(&mut self, tag: MessageTag, query_type: QueryType) -> CommResult<()> {
        if query_type.records_per_message(self.max_message_units) == 0 {
            return Err(CommError::BufferTooLarge {
                requested: query_type.query_record().max(query_type.reply_record()),
                capacity: self.max_message_units,
            });
        }
        self.query_types.insert(tag, query_type);
        self.reply_tags.insert(query_type.reply_tag, tag);
        Ok(())
    }

    /// Whether `tag` carries replies to a registered query type.
    pub fn is_reply_tag(&self, tag: MessageTag) -> bool {
        self.reply_tags.contains_key(&tag)
    }

    /// Registered shape of `tag`.
    pub fn query_type(&self, tag: MessageTag) -> Option<QueryType> {
        self.query_types.get(&tag).copied()
    }

    /// Queue a query from `worker` to `destination`.
    ///
    /// # Errors
    ///
    /// [`CommError::WorkerAlreadyPending`] if `worker` still waits for an
    /// answer. Nothing is queued on any error.
    pub fn push_message(
        &mut self,
        worker: WorkerId,
        destination: Rank,
        tag: MessageTag,
        units: &[MessageUnit],
    ) -> CommResult<()> {
        if self.slots.contains_key(&worker) {
            return Err(CommError::WorkerAlreadyPending(worker));
        }
        if destination >= self.size {
            return Err(CommError::InvalidDestination {
                destination,
                size: self.size,
            });
        }
        let query_type = self
            .query_types
            .get(&tag)
            .copied()
            .ok_or(CommError::UnknownQueryTag(tag))?;
        if units.len() != query_type.query_units {
            return Err(CommError::QueryArityMismatch {
                tag,
                expected: query_type.query_units,
                actual: units.len(),
            });
        }

        let capacity = query_type.records_per_message(self.max_message_units)
            * query_type.query_record();
        let batch = self.open.entry((destination, tag)).or_default();
        batch.push(worker);
        batch.extend_from_slice(units);
        if batch.len() + query_type.query_record() > capacity {
            let units = std::mem::take(batch);
            self.ready.push_back(Batch {
                destination,
                tag,
                units,
            });
        }

        self.slots.insert(
            worker,
            WorkerSlot {
                destination,
                tag,
                response: Vec::with_capacity(query_type.reply_units),
                expected: query_type.reply_units,
            },
        );
        self.queries_pushed += 1;
        Ok(())
    }

    /// Move every packed query into `outbox`.
    ///
    /// Stops early when `outbox` is full; the rest goes out on a later call.
    /// Returns the number of messages queued.
    pub fn flush(&mut self, outbox: &mut Mailbox) -> CommResult<usize> {
        for ((destination, tag), units) in std::mem::take(&mut self.open) {
            if !units.is_empty() {
                self.ready.push_back(Batch {
                    destination,
                    tag,
                    units,
                });
            }
        }

        let mut flushed = 0;
        while let Some(batch) = self.ready.front() {
            if outbox.is_full() {
                tracing::debug!(
                    "rank {}: outbox full, {} query batches deferred",
                    self.rank,
                    self.ready.len()
                );
                break;
            }
            outbox.push_units(&batch.units, batch.tag, self.rank, batch.destination)?;
            self.ready.pop_front();
            flushed += 1;
        }
        self.messages_flushed += flushed as u64;
        Ok(flushed)
    }

    /// Route every reply in `inbox` to the slot of the worker it names.
    ///
    /// A message is checked in full before any slot is touched. Returns the
    /// number of reply records consumed.
    pub fn process_inbox(&mut self, inbox: &Mailbox) -> CommResult<usize> {
        let mut consumed = 0;
        for message in inbox.messages() {
            let Some(&query_tag) = self.reply_tags.get(&message.tag()) else {
                continue;
            };
            let Some(query_type) = self.query_types.get(&query_tag).copied() else {
                continue;
            };
            consumed += self.absorb(message, inbox.units(message)?, query_tag, query_type)?;
        }
        Ok(consumed)
    }

    fn absorb(
        &mut self,
        message: &Message,
        units: &[MessageUnit],
        query_tag: MessageTag,
        query_type: QueryType,
    ) -> CommResult<usize> {
        let record = query_type.reply_record();
        if units.is_empty() || units.len() % record != 0 {
            return Err(CommError::MalformedReply {
                tag: message.tag(),
                count: units.len(),
            });
        }

        let mut named = HashSet::new();
        for chunk in units.chunks(record) {
            let worker = chunk[0];
            match self.slots.get(&worker) {
                Some(slot)
                    if slot.tag == query_tag
                        && slot.destination == message.source()
                        && !slot.is_processed()
                        && named.insert(worker) => {}
                _ => {
                    tracing::warn!(
                        "rank {}: unexpected reply from rank {} for worker {}",
                        self.rank,
                        message.source(),
                        worker
                    );
                    return Err(CommError::UnexpectedResponse { worker });
                }
            }
        }

        for chunk in units.chunks(record) {
            if let Some(slot) = self.slots.get_mut(&chunk[0]) {
                slot.response.extend_from_slice(&chunk[1..]);
                tracing::debug!(
                    "rank {}: worker {} answered by rank {}",
                    self.rank,
                    chunk[0],
                    message.source()
                );
            }
        }
        Ok(units.len() / record)
    }

    /// Whether the answer for `worker` has arrived.
    pub fn is_message_processed(&self, worker: WorkerId) -> bool {
        self.slots
            .get(&worker)
            .is_some_and(WorkerSlot::is_processed)
    }

    /// Take the answer for `worker`, freeing it to issue its next query.
    ///
    /// # Errors
    ///
    /// [`CommError::ResponseNotReady`] before [`Self::is_message_processed`]
    /// holds; the slot is left untouched.
    pub fn get_response_elements(&mut self, worker: WorkerId) -> CommResult<Vec<MessageUnit>> {
        if !self.is_message_processed(worker) {
            return Err(CommError::ResponseNotReady(worker));
        }
        self.slots
            .remove(&worker)
            .map(|slot| slot.response)
            .ok_or(CommError::ResponseNotReady(worker))
    }

    /// Whether `worker` has a query in flight.
    pub fn is_pending(&self, worker: WorkerId) -> bool {
        self.slots.contains_key(&worker)
    }

    /// Workers with an open slot, answered or not.
    pub fn pending_workers(&self) -> usize {
        self.slots.len()
    }

    /// Whether packed queries wait for [`Self::flush`].
    pub fn has_unflushed(&self) -> bool {
        !self.ready.is_empty() || self.open.values().any(|units| !units.is_empty())
    }

    /// Queries accepted so far.
    pub fn queries_pushed(&self) -> u64 {
        self.queries_pushed
    }

    /// Packed messages handed to the outbox so far.
    pub fn messages_flushed(&self) -> u64 {
        self.messages_flushed
    }
}

/// Handler answering packed queries one record at a time.
///
/// `answer` receives the query units of one record and returns the reply
/// units, which must match the registered reply size.
pub struct QueryResponder<F> {
    query_type: QueryType,
    answer: F,
}

impl<F> QueryResponder<F>
where
    F: FnMut(&[MessageUnit]) -> CommResult<Vec<MessageUnit>>,
{
    /// Responder for queries shaped like `query_type`.
    pub fn new(query_type: QueryType, answer: F) -> Self {
        Self { query_type, answer }
    }
}

impl<F> MessageHandler for QueryResponder<F>
where
    F: FnMut(&[MessageUnit]) -> CommResult<Vec<MessageUnit>>,
{
    fn handle(
        &mut self,
        message: &Message,
        units: &[MessageUnit],
        outbox: &mut Mailbox,
    ) -> CommResult<()> {
        let record = self.query_type.query_record();
        if units.len() % record != 0 {
            return Err(CommError::QueryArityMismatch {
                tag: message.tag(),
                expected: self.query_type.query_units,
                actual: units.len() % record,
            });
        }

        let mut reply = Vec::with_capacity(units.len() / record * self.query_type.reply_record());
        for chunk in units.chunks(record) {
            let answer = (self.answer)(&chunk[1..])?;
            if answer.len() != self.query_type.reply_units {
                return Err(CommError::MalformedReply {
                    tag: self.query_type.reply_tag,
                    count: answer.len(),
                });
            }
            reply.push(chunk[0]);
            reply.extend_from_slice(&answer);
        }

        outbox.push_units(
            &reply,
            self.query_type.reply_tag,
            message.destination(),
            message.source(),
        )
    }
}
