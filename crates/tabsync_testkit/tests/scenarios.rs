//! Multi-instance scenarios.

use proptest::prelude::*;
use std::sync::atomic::AtomicU64;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tabsync_core::{changes, ChangeRecord, CoreError, Database, Revision, CHANGES_TABLE};
use tabsync_observe::{
    node, ChangeBatch, ChangeReader, Feed, LifecycleEvent, MockClock, ObserveError, NODES_TABLE,
};
use tabsync_storage::Value;
use tabsync_testkit::prelude::*;

fn shape(batches: &[ChangeBatch]) -> Vec<(usize, bool)> {
    batches.iter().map(|b| (b.changes.len(), b.partial)).collect()
}

fn reader(db: &Arc<Database>, limit: usize) -> (ChangeReader, Receiver<ChangeBatch>) {
    let node = register_node(db, Revision::ZERO, CLUSTER_EPOCH_MS);
    let feed = Arc::new(Feed::new());
    let rx = feed.subscribe();
    let reader = ChangeReader::new(
        Arc::clone(db),
        node,
        Arc::new(MockClock::new(CLUSTER_EPOCH_MS)),
        limit,
        feed,
        Arc::new(AtomicU64::new(0)),
    );
    (reader, rx)
}

fn applied(rx: &Receiver<ChangeBatch>) -> Vec<ChangeRecord> {
    rx.try_iter().flat_map(|b| b.changes).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn revisions_are_strictly_increasing_without_gaps(
        chunks in prop::collection::vec(mutations_strategy(8), 1..6),
        abort_at in any::<prop::sample::Index>(),
    ) {
        let db = Database::open_in_memory();
        let abort = abort_at.index(chunks.len());
        let mut expected = 0u64;

        for (i, chunk) in chunks.iter().enumerate() {
            let result = db.transaction(&["items", CHANGES_TABLE], |txn| {
                let mut appended = 0u64;
                for mutation in chunk {
                    if mutation.apply(txn, "items")?.is_some() {
                        appended += 1;
                    }
                }
                if i == abort {
                    return Err(CoreError::aborted("rolled back on purpose"));
                }
                Ok(appended)
            });
            if let Ok(appended) = result {
                expected += appended;
            }
        }

        let records = db
            .transaction(&[CHANGES_TABLE], |txn| changes::read_after(txn, Revision::ZERO, usize::MAX))
            .unwrap();
        let revisions: Vec<u64> = records.iter().map(|r| r.revision.as_u64()).collect();
        prop_assert_eq!(revisions, (1..=expected).collect::<Vec<_>>());
    }

    #[test]
    fn batch_splits_apply_the_same_records(
        first in 0usize..120,
        second in 0usize..120,
        limit in batch_limit_strategy(),
    ) {
        let db = Arc::new(Database::open_in_memory());
        let (whole, whole_rx) = reader(&db, 10_000);
        let (split, split_rx) = reader(&db, limit);

        populate(&db, "items", first);
        split.read_changes().unwrap();
        populate(&db, "items", second);
        split.read_changes().unwrap();
        let whole_summary = whole.read_changes().unwrap();

        let whole_records = applied(&whole_rx);
        let split_records = applied(&split_rx);
        prop_assert_eq!(whole_records.len(), first + second);
        prop_assert_eq!(&whole_records, &split_records);

        let total = u64::try_from(first + second).unwrap();
        prop_assert_eq!(whole_summary.my_revision, Revision::new(total));
        let nodes = db.transaction(&[NODES_TABLE], |txn| node::all(txn)).unwrap();
        prop_assert!(nodes.iter().all(|n| n.my_revision == Revision::new(total)));
    }
}

#[test]
fn concurrent_reads_share_one_batch() {
    let db = Arc::new(Database::open_in_memory());
    let (reader, rx) = reader(&db, 100);
    let reader = Arc::new(reader);
    populate(&db, "items", 7);

    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let blocker = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            db.transaction(&[CHANGES_TABLE], |_| {
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(())
            })
            .unwrap();
        })
    };
    locked_rx.recv().unwrap();

    let leader = {
        let reader = Arc::clone(&reader);
        thread::spawn(move || reader.read_changes().unwrap())
    };
    while !reader.is_in_flight() {
        thread::sleep(Duration::from_millis(1));
    }
    let followers: Vec<_> = (0..3)
        .map(|_| {
            let reader = Arc::clone(&reader);
            thread::spawn(move || reader.read_changes().unwrap())
        })
        .collect();
    while reader.joined_callers() < 3 {
        thread::sleep(Duration::from_millis(1));
    }
    release_tx.send(()).unwrap();
    blocker.join().unwrap();

    let lead = leader.join().unwrap();
    for follower in followers {
        assert_eq!(follower.join().unwrap(), lead);
    }
    assert_eq!(lead.delivered, 7);
    let batches: Vec<ChangeBatch> = rx.try_iter().collect();
    assert_eq!(shape(&batches), vec![(7, false)]);
}

#[test]
fn concurrent_start_converges_on_one_master() {
    let cluster = Cluster::new(0);
    let n = 6;
    let barrier = Arc::new(Barrier::new(n));
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let coordinator = cluster.coordinator();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coordinator.attach().unwrap();
                coordinator
            })
        })
        .collect();
    let coordinators: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for _ in 0..2 {
        cluster.advance(Duration::from_millis(500));
        thread::scope(|s| {
            for coordinator in &coordinators {
                s.spawn(move || {
                    coordinator.heartbeat().unwrap();
                    coordinator.poll_once().unwrap();
                });
            }
        });
    }

    assert_eq!(cluster.masters().len(), 1);
    let believers = coordinators.iter().filter(|c| c.is_master()).count();
    assert_eq!(believers, 1);
}

#[test]
fn double_mastership_self_corrects() {
    let cluster = Cluster::new(4);
    cluster
        .database()
        .transaction(&[NODES_TABLE], |txn| {
            for mut record in node::all(txn)? {
                record.is_master = true;
                node::store(txn, &record)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(cluster.masters().len(), 4);

    cluster.tick(Duration::from_millis(500));
    cluster.tick(Duration::from_millis(500));
    assert_eq!(cluster.masters(), vec![cluster.instance(0).node_id()]);
}

#[test]
fn stale_node_survives_grace_period() {
    let mut cluster = Cluster::new(2);
    let victim = cluster.instance(1).node_id();
    cluster.hang(1);

    cluster.tick(Duration::from_secs(6));
    let marked = cluster.record(victim).unwrap();
    assert_eq!(marked.delete_timestamp, Some(cluster.now_ms() + 3_000));

    for _ in 0..3 {
        cluster.tick(Duration::from_secs(1));
        assert!(cluster.record(victim).is_some(), "evicted before the grace period ended");
    }

    cluster.tick(Duration::from_millis(1));
    assert!(cluster.record(victim).is_none());

    cluster.resume(1);
    assert_eq!(cluster.poll_all(), vec![victim]);
    assert_eq!(
        cluster.instance(1).drain_events().last(),
        Some(&LifecycleEvent::Evicted)
    );
    assert!(!cluster.instance(1).coordinator.database().is_open());
}

#[test]
fn resumed_heartbeat_clears_suspicion() {
    let mut cluster = Cluster::new(2);
    let suspect = cluster.instance(1).node_id();
    cluster.hang(1);
    cluster.tick(Duration::from_secs(6));
    assert!(cluster.record(suspect).unwrap().delete_timestamp.is_some());

    cluster.resume(1);
    cluster.tick(Duration::from_secs(1));
    assert_eq!(cluster.record(suspect).unwrap().delete_timestamp, None);

    cluster.tick(Duration::from_secs(10));
    assert!(cluster.record(suspect).is_some());
}

#[test]
fn burst_of_1500_arrives_in_two_batches() {
    let cluster = Cluster::new(2);
    let b = cluster.instance(1);
    assert_eq!(cluster.write(0, "notes", 1500), Revision::new(1500));

    let summary = b.coordinator.read_changes().unwrap();
    assert_eq!(summary.my_revision, Revision::new(1500));
    let batches = b.drain_batches();
    assert_eq!(shape(&batches), vec![(1000, true), (500, false)]);
    assert_eq!(batches[0].changes[0].revision, Revision::new(1));
    assert_eq!(batches[1].changes[499].revision, Revision::new(1500));
    assert_eq!(
        cluster.record(b.node_id()).unwrap().my_revision,
        Revision::new(1500)
    );

    cluster.tick(Duration::from_millis(500));
    assert_eq!(cluster.change_count(), 1);
    assert_eq!(cluster.write(1, "notes", 1), Revision::new(1501));
}

#[test]
fn hung_master_is_replaced_and_not_repromoted() {
    let mut cluster = Cluster::new(2);
    let a = cluster.instance(0).node_id();
    let b = cluster.instance(1).node_id();
    assert_eq!(cluster.masters(), vec![a]);

    cluster.stall(0);
    let report = cluster.instance(1).coordinator.cleanup().unwrap();
    assert_eq!(report.demoted, vec![a]);
    assert!(report.became_master);
    assert_eq!(cluster.masters(), vec![b]);

    let report = cluster.instance(0).coordinator.cleanup().unwrap();
    assert!(!report.is_master);
    assert!(!report.became_master);
    assert_eq!(cluster.masters(), vec![b]);
    assert!(!cluster.instance(0).coordinator.verify_master().unwrap());
}

#[test]
fn graceful_stop_hands_over_immediately() {
    let cluster = Cluster::new(3);
    let a = cluster.instance(0).node_id();
    cluster.stop(0);
    assert_eq!(
        cluster.instance(0).drain_events(),
        vec![LifecycleEvent::Stopped]
    );

    let report = cluster.instance(1).coordinator.cleanup().unwrap();
    assert_eq!(report.evicted, vec![a]);
    assert!(report.became_master);
    assert_eq!(cluster.masters(), vec![cluster.instance(1).node_id()]);
}

#[test]
fn slow_listener_keeps_its_node_alive() {
    let cluster = Cluster::new(2);
    let a = cluster.instance(0).coordinator.clone();
    let b = &cluster.instance(1).coordinator;
    let (entered_tx, entered_rx) = mpsc::channel();
    a.on_changes(move |_| {
        let _ = entered_tx.send(());
        thread::sleep(Duration::from_millis(600));
    });
    cluster.write(1, "notes", 3);

    let delivering = {
        let a = a.clone();
        thread::spawn(move || a.read_changes().unwrap())
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    cluster.advance(Duration::from_secs(6));
    let started = Instant::now();
    a.heartbeat().unwrap();
    b.heartbeat().unwrap();
    let report = b.cleanup().unwrap();
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(report.marked.is_empty());
    assert!(report.evicted.is_empty());

    assert_eq!(delivering.join().unwrap().my_revision, Revision::new(3));
    assert_eq!(cluster.record(a.node_id().unwrap()).unwrap().my_revision, Revision::new(3));
}

#[test]
fn stop_during_delivery_is_final() {
    let cluster = Cluster::new(2);
    let a = cluster.instance(0).coordinator.clone();
    let a_id = a.node_id().unwrap();
    let stopper = a.clone();
    a.on_changes(move |_| stopper.stop());
    cluster.write(1, "notes", 1);

    let (done_tx, done_rx) = mpsc::channel();
    {
        let a = a.clone();
        thread::spawn(move || {
            let _ = done_tx.send(a.poll_once());
        });
    }
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());

    let record = cluster.record(a_id).unwrap();
    assert!(record.is_dying());
    assert_eq!(record.last_heartbeat, 0);

    let report = cluster.instance(1).coordinator.cleanup().unwrap();
    assert_eq!(report.evicted, vec![a_id]);
    assert!(report.became_master);
}

#[tokio::test]
async fn orphaned_request_is_redirected_and_answered() {
    let cluster = Cluster::new(3);
    let asker = cluster.instance(1);
    let gone = cluster.instance(2);
    let gone_id = gone.node_id();
    cluster.stop(2);

    let handle = asker
        .coordinator
        .send_message(gone_id, "lookup", Value::from("k"), true)
        .unwrap()
        .unwrap();

    let cleaner = cluster.instance(0);
    cleaner.coordinator.on_message("lookup", |m| Ok(m.payload.clone()));
    let report = cleaner.coordinator.cleanup().unwrap();
    assert_eq!(report.evicted, vec![gone_id]);
    assert_eq!(report.redirected, 1);

    assert_eq!(cleaner.coordinator.consume_messages().unwrap().handled, 1);
    assert_eq!(asker.coordinator.consume_messages().unwrap().replies_received, 1);
    assert_eq!(handle.wait().await.unwrap(), Value::from("k"));
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let config = tabsync_observe::ObserveConfig::default()
        .with_reply_timeout(Duration::from_millis(20));
    let cluster = Cluster::with_config(2, config);
    let handle = cluster
        .instance(0)
        .coordinator
        .send_message(cluster.instance(1).node_id(), "ping", Value::Null, true)
        .unwrap()
        .unwrap();
    assert!(matches!(
        handle.wait().await,
        Err(ObserveError::ReplyTimeout { .. })
    ));
    assert_eq!(cluster.instance(0).coordinator.pending_replies(), 0);
}
