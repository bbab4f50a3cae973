//! Whole-rank scenarios: queries crossing the fabric, aggregated traffic and
//! the mate-distance workload under every reception policy.

use rankpool::{
    run_until_quiescent, BufferedAggregator, CommConfig, CommResult, LocalFabric, LocalTransport,
    MateDistanceWorker, MessageTag, MessageUnit, QueryResponder, QueryType, RankRuntime,
    ReadPlacement, ReceptionPolicy, Strand, TagRegistry, WorkerStatus, MATE_REPLY_UNITS, NO_MATE,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

const READ_LENGTH: MessageUnit = 100;
const READS_PER_PATH: u64 = 8;
const SPACING: i64 = 50;

/// Read `index` is stored on rank `index % size`; reads `2k` and `2k + 1` are
/// mates, except multiples of 16 and their partners which have none.
fn mate_of(index: u64, size: usize) -> [MessageUnit; 4] {
    if index % 16 < 2 {
        return [READ_LENGTH, NO_MATE, 0, 0];
    }
    let mate = index ^ 1;
    [READ_LENGTH, mate % size as u64, mate, 0]
}

struct Cluster {
    fabric: LocalFabric,
    mate: MessageTag,
    mate_reply: MessageTag,
    ranks: Vec<RankRuntime<LocalTransport, MateDistanceWorker>>,
}

fn cluster(size: usize, config: CommConfig, fabric: LocalFabric) -> Cluster {
    let mut tags = TagRegistry::new();
    let (mate, mate_reply) = tags.allocate_with_reply("GET_READ_MATE").expect("tags");
    let query_type = QueryType {
        reply_tag: mate_reply,
        query_units: 1,
        reply_units: MATE_REPLY_UNITS,
    };

    let ranks = fabric
        .endpoints()
        .into_iter()
        .map(|transport| {
            let mut runtime = RankRuntime::new(transport, config.clone()).expect("runtime");
            runtime
                .communicator_mut()
                .set_query_type(mate, query_type)
                .expect("query type");
            runtime.handlers_mut().register(
                mate,
                QueryResponder::new(
                    query_type,
                    move |read: &[MessageUnit]| -> CommResult<Vec<MessageUnit>> {
                        Ok(mate_of(read[0], size).to_vec())
                    },
                ),
            );
            runtime
        })
        .collect();

    Cluster {
        fabric,
        mate,
        mate_reply,
        ranks,
    }
}

/// Path walked by the worker of `rank`: consecutive reads, alternating strands.
fn path(rank: usize, size: usize) -> Vec<ReadPlacement> {
    (0..READS_PER_PATH)
        .map(|offset| {
            let index = rank as u64 * READS_PER_PATH + offset;
            ReadPlacement {
                rank: (index % size as u64) as usize,
                index,
                path_position: offset as i64 * SPACING,
                strand_position: 0,
                strand: if index % 2 == 0 {
                    Strand::Forward
                } else {
                    Strand::Reverse
                },
            }
        })
        .collect()
}

#[test]
fn test_read_mate_query_answered_within_one_cycle() {
    init_tracing();
    let size = 2;
    let mut cluster = cluster(size, CommConfig::local(), LocalFabric::new(size, 4096));
    let (mate, mate_reply) = (cluster.mate, cluster.mate_reply);
    let worker = 7;

    cluster.ranks[0]
        .communicator_mut()
        .push_message(worker, 1, mate, &[5])
        .expect("push");
    // flush into the outbox, then hand it to the transport
    cluster.ranks[0].tick().expect("tick");
    cluster.ranks[0].tick().expect("tick");
    assert_eq!(cluster.fabric.pending_for(1), 1);

    let mut ticks = 0;
    loop {
        ticks += 1;
        let report = cluster.ranks[1].tick().expect("tick");
        if report.received {
            assert_eq!(report.handled, 1);
            break;
        }
        assert!(ticks < size, "query not received within {size} ticks");
    }
    // the reply leaves on the next tick
    cluster.ranks[1].tick().expect("tick");
    assert_eq!(cluster.ranks[1].engine().statistics().count(0, mate_reply), 1);

    for _ in 0..size {
        cluster.ranks[0].tick().expect("tick");
        if cluster.ranks[0].communicator().is_message_processed(worker) {
            break;
        }
    }
    let communicator = cluster.ranks[0].communicator_mut();
    assert!(communicator.is_message_processed(worker));
    let elements = communicator.get_response_elements(worker).expect("answer");
    assert_eq!(elements.len(), 4);
    assert_eq!(elements, mate_of(5, size).to_vec());
}

fn run_mate_distances(config: CommConfig, fabric: LocalFabric, size: usize) {
    let mut cluster = cluster(size, config, fabric);
    let mate = cluster.mate;
    for rank in 0..size {
        cluster.ranks[rank].add_worker(MateDistanceWorker::new(1, mate, path(rank, size)));
    }

    run_until_quiescent(&mut cluster.ranks, 5_000).expect("quiescent");

    for (rank, runtime) in cluster.ranks.iter().enumerate() {
        let (worker, status) = runtime.workers().next().expect("worker");
        assert_eq!(status, WorkerStatus::Done);
        // each path holds four pairs, minus the unpaired pair at offset 0 of
        // every other path
        let expected = if (rank as u64 * READS_PER_PATH) % 16 == 0 { 3 } else { 4 };
        assert_eq!(worker.detected(), expected, "rank {rank}");
        assert_eq!(
            worker.distances()[&0][&(SPACING + READ_LENGTH as i64)],
            expected
        );
    }
    assert_eq!(cluster.fabric.in_flight(), 0);

    for runtime in cluster.ranks {
        runtime.shutdown().expect("shutdown");
    }
    assert_eq!(cluster.fabric.open_requests(), 0);
}

#[test]
fn test_mate_distances_round_robin() {
    init_tracing();
    run_mate_distances(CommConfig::local(), LocalFabric::new(4, 4096), 4);
}

#[test]
fn test_mate_distances_one_probe_per_tick() {
    init_tracing();
    let config = CommConfig::local().with_one_probe_per_tick(true);
    run_mate_distances(config, LocalFabric::new(4, 4096), 4);
}

#[test]
fn test_mate_distances_any_source() {
    init_tracing();
    let config = CommConfig::local().with_reception(ReceptionPolicy::AnySource);
    run_mate_distances(config, LocalFabric::new(4, 4096), 4);
}

#[test]
fn test_mate_distances_persistent_ring() {
    init_tracing();
    let config = CommConfig::local().with_reception(ReceptionPolicy::PersistentRing);
    run_mate_distances(config, LocalFabric::new(4, 4096), 4);
}

#[test]
fn test_mate_distances_with_delayed_completions() {
    init_tracing();
    for seed in 0..4 {
        // replies exceed the eager limit and stay pinned until delivered
        let fabric = LocalFabric::new(4, 16).with_completion_hold(seed, 0.5);
        run_mate_distances(CommConfig::local(), fabric, 4);
    }
}

#[test]
fn test_default_config_fans_out_to_more_ranks_than_dirty_slots() {
    init_tracing();
    let size = 40;
    let mut cluster = cluster(size, CommConfig::default(), LocalFabric::new(size, 4096));
    let mate = cluster.mate;
    // one worker per destination: a single tick flushes `size` queries
    for target in 0..size {
        let read = ReadPlacement {
            rank: target,
            index: target as u64,
            path_position: 0,
            strand_position: 0,
            strand: Strand::Forward,
        };
        cluster.ranks[0].add_worker(MateDistanceWorker::new(target as u64, mate, vec![read]));
    }

    run_until_quiescent(&mut cluster.ranks, 10_000).expect("quiescent");

    let workers: Vec<_> = cluster.ranks[0].workers().collect();
    assert_eq!(workers.len(), size);
    assert!(workers
        .iter()
        .all(|(_, status)| *status == WorkerStatus::Done));
    assert_eq!(cluster.ranks[0].engine().statistics().count(39, mate), 1);
}

#[test]
fn test_aggregated_units_reach_peer_in_whole_tuples() {
    init_tracing();
    let mut cluster = cluster(2, CommConfig::local(), LocalFabric::new(2, 4096));
    let tag = cluster.mate_reply + 1;

    {
        let (aggregator, outbox) = cluster.ranks[0].aggregator_mut();
        // threshold 10, tuples of 3 units
        *aggregator = BufferedAggregator::new(0, 2, 64, 4096).with_threshold(10);
        let mut flushed = Vec::new();
        for value in 0..10 {
            aggregator.add_at(1, value).expect("room");
            flushed.push(aggregator.flush(1, 3, tag, outbox, false).expect("flush"));
        }
        assert_eq!(flushed.iter().filter(|&&sent| sent).count(), 1);
        assert!(flushed[9]);
        assert_eq!(aggregator.size(1), 1);
    }

    cluster.ranks[0].tick().expect("tick");
    cluster.ranks[1].tick().expect("tick");
    let inbox = cluster.ranks[1].inbox();
    let message = inbox.messages()[0];
    assert_eq!(message.tag(), tag);
    assert_eq!(inbox.units(&message).expect("units"), &[0, 1, 2, 3, 4, 5, 6, 7, 8]);

    // the tail leaves with a forced flush
    {
        let (aggregator, outbox) = cluster.ranks[0].aggregator_mut();
        assert!(aggregator.flush_all(3, tag, outbox).expect("flush"));
        assert!(aggregator.is_drained());
    }
    cluster.ranks[0].tick().expect("tick");
    cluster.ranks[1].tick().expect("tick");
    let inbox = cluster.ranks[1].inbox();
    let message = inbox.messages()[0];
    assert_eq!(inbox.units(&message).expect("units"), &[9]);
}

#[test]
fn test_statistics_exported_per_rank() {
    init_tracing();
    let mut cluster = cluster(2, CommConfig::local(), LocalFabric::new(2, 4096));
    let mate = cluster.mate;
    cluster.ranks[0].add_worker(MateDistanceWorker::new(1, mate, path(0, 2)));
    run_until_quiescent(&mut cluster.ranks, 1_000).expect("quiescent");

    let mut tags = TagRegistry::new();
    tags.allocate_with_reply("GET_READ_MATE").expect("tags");
    let table_path = std::env::temp_dir().join(format!("rankpool-e2e-{}.tsv", std::process::id()));
    let _ = std::fs::remove_file(&table_path);
    for runtime in &cluster.ranks {
        runtime
            .engine()
            .append_statistics(&table_path, &tags)
            .expect("append");
    }
    let table = std::fs::read_to_string(&table_path).expect("read");
    let _ = std::fs::remove_file(&table_path);

    let lines: Vec<&str> = table.lines().collect();
    assert!(lines.contains(&"0\t0\tGET_READ_MATE\t4"));
    assert!(lines.contains(&"0\t1\tGET_READ_MATE\t4"));
    assert!(lines.contains(&"1\t0\tGET_READ_MATE_REPLY\t4"));
    assert!(lines.iter().all(|line| line.split('\t').count() == 4));
}
