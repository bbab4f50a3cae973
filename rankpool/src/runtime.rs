//! The per-rank tick loop tying every component together.
//!
//! One [`RankRuntime::tick`] runs, in order:
//!
//! 1. dirty-buffer drain and outbox send (dispatch engine),
//! 2. recycling of the buffers lent during the previous tick,
//! 3. reception of at most one message,
//! 4. tag handlers over the inbox,
//! 5. reply demultiplexing by the virtual communicator,
//! 6. one step of every unfinished worker,
//! 7. flush of the queries packed during the step.
//!
//! Several runtimes sharing a [`LocalFabric`](crate::transport::LocalFabric)
//! can be driven together by [`run_until_quiescent`].

use crate::aggregator::BufferedAggregator;
use crate::allocator::RingAllocator;
use crate::communicator::VirtualCommunicator;
use crate::config::CommConfig;
use crate::context::CommContext;
use crate::dispatch::DispatchEngine;
use crate::error::{CommError, CommResult};
use crate::handlers::HandlerMap;
use crate::message::Mailbox;
use crate::transport::Transport;
use crate::worker::{Worker, WorkerContext, WorkerStatus};

/// What happened during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// Messages handed to the transport.
    pub sent: usize,
    /// Whether a message was received.
    pub received: bool,
    /// Inbox messages consumed by tag handlers.
    pub handled: usize,
    /// Inbox messages no handler or query type claimed.
    pub dropped: usize,
    /// Workers still pending after their step.
    pub active_workers: usize,
}

/// Everything one rank owns.
pub struct RankRuntime<T, W> {
    context: CommContext,
    transport: T,
    engine: DispatchEngine,
    outbox: Mailbox,
    inbox: Mailbox,
    handlers: HandlerMap,
    communicator: VirtualCommunicator,
    aggregator: BufferedAggregator,
    workers: Vec<(W, WorkerStatus)>,
    ticks: u64,
}

impl<T: Transport, W: Worker> RankRuntime<T, W> {
    /// Assemble a rank on `transport` with pools sized by `config`.
    pub fn new(mut transport: T, config: CommConfig) -> CommResult<Self> {
        let context = CommContext::from_transport(&transport)?;
        let units = config.max_message_units();
        let outbox = Mailbox::new(
            config.mailbox_capacity,
            RingAllocator::new("outbox", config.outbox_buffers, units),
        );
        let inbox = Mailbox::new(
            config.mailbox_capacity,
            RingAllocator::new("inbox", config.inbox_buffers, units),
        );
        let communicator = VirtualCommunicator::new(&context, units);
        let aggregator = BufferedAggregator::new(
            context.rank(),
            context.size(),
            units,
            config.eager_limit_bytes,
        );
        let engine = DispatchEngine::new(&context, config, &mut transport)?;

        Ok(Self {
            context,
            transport,
            engine,
            outbox,
            inbox,
            handlers: HandlerMap::new(),
            communicator,
            aggregator,
            workers: Vec::new(),
            ticks: 0,
        })
    }

    /// Add a worker; it is stepped from the next tick on.
    pub fn add_worker(&mut self, worker: W) {
        self.workers.push((worker, WorkerStatus::Pending));
    }

    /// Run one tick.
    pub fn tick(&mut self) -> CommResult<TickReport> {
        self.engine
            .drain_dirty_buffers(&mut self.transport, &mut self.outbox)?;
        let sent = self
            .engine
            .send_messages(&mut self.transport, &mut self.outbox)?;
        self.outbox.recycle();

        self.inbox.clear();
        self.inbox.recycle();
        let received = self
            .engine
            .receive_messages(&mut self.transport, &mut self.inbox)?
            .is_some();

        let handled = self.handlers.dispatch(&self.inbox, &mut self.outbox)?;
        self.communicator.process_inbox(&self.inbox)?;
        let dropped = self.drop_unclaimed();

        let mut ctx = WorkerContext {
            context: &self.context,
            communicator: &mut self.communicator,
        };
        let mut active_workers = 0;
        for (worker, status) in &mut self.workers {
            if *status == WorkerStatus::Pending {
                *status = worker.step(&mut ctx)?;
            }
            if *status == WorkerStatus::Pending {
                active_workers += 1;
            }
        }

        self.communicator.flush(&mut self.outbox)?;
        self.ticks += 1;

        Ok(TickReport {
            sent,
            received,
            handled,
            dropped,
            active_workers,
        })
    }

    fn drop_unclaimed(&self) -> usize {
        let mut dropped = 0;
        for message in self.inbox.messages() {
            let tag = message.tag();
            if !self.handlers.contains(tag) && !self.communicator.is_reply_tag(tag) {
                tracing::warn!(
                    "rank {}: dropping tag {} ({} units) from rank {}, nothing handles it",
                    self.context.rank(),
                    tag,
                    message.count(),
                    message.source()
                );
                dropped += 1;
            }
        }
        dropped
    }

    /// Whether this rank has nothing left to do on its own: every worker is
    /// done, nothing is queued or in flight and every bucket is empty (see
    /// [`Self::aggregator_mut`]).
    ///
    /// Messages from other ranks may still be on their way.
    pub fn is_quiescent(&self) -> bool {
        self.workers
            .iter()
            .all(|(_, status)| *status == WorkerStatus::Done)
            && self.communicator.pending_workers() == 0
            && !self.communicator.has_unflushed()
            && self.outbox.is_empty()
            && self.engine.dirty_buffers().is_empty()
            && self.aggregator.is_drained()
    }

    /// Identity of this rank.
    pub fn context(&self) -> &CommContext {
        &self.context
    }

    /// Dispatch engine.
    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    /// Mutable dispatch engine, to replace connections.
    pub fn engine_mut(&mut self) -> &mut DispatchEngine {
        &mut self.engine
    }

    /// Tag handler table.
    pub fn handlers_mut(&mut self) -> &mut HandlerMap {
        &mut self.handlers
    }

    /// Virtual communicator.
    pub fn communicator(&self) -> &VirtualCommunicator {
        &self.communicator
    }

    /// Mutable virtual communicator, to register query types.
    pub fn communicator_mut(&mut self) -> &mut VirtualCommunicator {
        &mut self.communicator
    }

    /// Outbox, for messages sent outside of any worker.
    pub fn outbox_mut(&mut self) -> &mut Mailbox {
        &mut self.outbox
    }

    /// Aggregator together with the outbox it flushes into.
    ///
    /// `tick` never forces the buckets out: units left below the threshold
    /// stay until the caller runs `flush_all` at a barrier, and the rank is
    /// not quiescent before that.
    pub fn aggregator_mut(&mut self) -> (&mut BufferedAggregator, &mut Mailbox) {
        (&mut self.aggregator, &mut self.outbox)
    }

    /// Inbox as filled by the last tick.
    pub fn inbox(&self) -> &Mailbox {
        &self.inbox
    }

    /// Workers and their last status.
    pub fn workers(&self) -> impl Iterator<Item = (&W, WorkerStatus)> {
        self.workers.iter().map(|(worker, status)| (worker, *status))
    }

    /// Ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Release transport resources and hand the transport back.
    pub fn shutdown(mut self) -> CommResult<T> {
        self.engine.shutdown(&mut self.transport)?;
        Ok(self.transport)
    }
}

impl<T, W> std::fmt::Debug for RankRuntime<T, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankRuntime")
            .field("rank", &self.context.rank())
            .field("ticks", &self.ticks)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Tick every rank in turn until all are quiescent and no message moved for
/// as many rounds as there are ranks.
///
/// Returns the number of rounds run.
///
/// # Errors
///
/// [`CommError::Stalled`] if that does not happen within `max_rounds`, or the
/// first error raised by any rank.
pub fn run_until_quiescent<T: Transport, W: Worker>(
    ranks: &mut [RankRuntime<T, W>],
    max_rounds: u64,
) -> CommResult<u64> {
    let mut quiet_rounds = 0;
    for round in 1..=max_rounds {
        let mut moved = false;
        for rank in ranks.iter_mut() {
            let report = rank.tick()?;
            moved |= report.received || report.sent > 0;
        }
        quiet_rounds = if moved { 0 } else { quiet_rounds + 1 };
        if quiet_rounds >= ranks.len() && ranks.iter().all(|rank| rank.is_quiescent()) {
            tracing::debug!("{} ranks quiescent after {} rounds", ranks.len(), round);
            return Ok(round);
        }
    }
    Err(CommError::Stalled { ticks: max_rounds })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{QueryResponder, QueryType};
    use crate::tags::TagRegistry;
    use crate::transport::LocalFabric;
    use crate::types::MessageUnit;
    use crate::worker::{MateDistanceWorker, ReadPlacement, Strand, MATE_REPLY_UNITS};

    #[test]
    fn test_single_rank_answers_its_own_queries() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let mut tags = TagRegistry::new();
        let (mate, mate_reply) = tags.allocate_with_reply("GET_READ_MATE").expect("tags");
        let query = QueryType {
            reply_tag: mate_reply,
            query_units: 1,
            reply_units: MATE_REPLY_UNITS,
        };

        let fabric = LocalFabric::new(1, 4096);
        let transport = fabric.endpoint(0).expect("endpoint");
        let mut rank: RankRuntime<_, MateDistanceWorker> =
            RankRuntime::new(transport, CommConfig::local()).expect("runtime");
        rank.communicator_mut()
            .set_query_type(mate, query)
            .expect("query type");
        rank.handlers_mut().register(
            mate,
            QueryResponder::new(query, |read: &[MessageUnit]| -> CommResult<Vec<MessageUnit>> {
                // reads 0 and 1 are mates
                Ok(vec![100, 0, read[0] ^ 1, 7])
            }),
        );

        let reads = vec![
            ReadPlacement {
                rank: 0,
                index: 0,
                path_position: 10,
                strand_position: 0,
                strand: Strand::Forward,
            },
            ReadPlacement {
                rank: 0,
                index: 1,
                path_position: 250,
                strand_position: 0,
                strand: Strand::Reverse,
            },
        ];
        rank.add_worker(MateDistanceWorker::new(1, mate, reads));

        let rounds = run_until_quiescent(std::slice::from_mut(&mut rank), 100).expect("quiescent");
        assert!(rounds < 100);

        let (worker, status) = rank.workers().next().expect("worker");
        assert_eq!(status, WorkerStatus::Done);
        assert_eq!(worker.distances()[&7][&340], 1);
        assert_eq!(rank.engine().statistics().count(0, mate), 2);
        assert_eq!(rank.engine().statistics().count(0, mate_reply), 2);

        rank.shutdown().expect("shutdown");
        assert_eq!(fabric.in_flight(), 0);
    }

    #[test]
    fn test_aggregator_residue_held_until_forced_flush() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .try_init();

        let fabric = LocalFabric::new(1, 4096);
        let transport = fabric.endpoint(0).expect("endpoint");
        let mut rank: RankRuntime<_, MateDistanceWorker> =
            RankRuntime::new(transport, CommConfig::local()).expect("runtime");
        {
            let (aggregator, _) = rank.aggregator_mut();
            aggregator.add_at(0, 5).expect("room");
            aggregator.add_at(0, 6).expect("room");
        }
        assert!(matches!(
            run_until_quiescent(std::slice::from_mut(&mut rank), 10),
            Err(CommError::Stalled { ticks: 10 })
        ));

        {
            let (aggregator, outbox) = rank.aggregator_mut();
            assert!(aggregator.flush_all(2, 9, outbox).expect("flush"));
            assert!(aggregator.is_drained());
        }
        // nothing is registered for tag 9, so the message is dropped on arrival
        let mut dropped = 0;
        for _ in 0..3 {
            dropped += rank.tick().expect("tick").dropped;
        }
        assert_eq!(dropped, 1);
        assert_eq!(rank.engine().statistics().count(0, 9), 1);
        run_until_quiescent(std::slice::from_mut(&mut rank), 10).expect("quiescent");
    }

    #[test]
    fn test_stalled_ranks_reported() {
        let fabric = LocalFabric::new(1, 4096);
        let transport = fabric.endpoint(0).expect("endpoint");
        let mut rank: RankRuntime<_, MateDistanceWorker> =
            RankRuntime::new(transport, CommConfig::local()).expect("runtime");
        // query type registered but no handler answers it
        rank.communicator_mut()
            .set_query_type(
                0,
                QueryType {
                    reply_tag: 1,
                    query_units: 1,
                    reply_units: MATE_REPLY_UNITS,
                },
            )
            .expect("query type");
        rank.add_worker(MateDistanceWorker::new(
            1,
            0,
            vec![ReadPlacement {
                rank: 0,
                index: 0,
                path_position: 0,
                strand_position: 0,
                strand: Strand::Forward,
            }],
        ));
        assert!(matches!(
            run_until_quiescent(std::slice::from_mut(&mut rank), 20),
            Err(CommError::Stalled { ticks: 20 })
        ));
    }
}
