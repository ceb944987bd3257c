use std::time::Duration;

use assert_matches::assert_matches;

use super::*;
use crate::{
    agent::fake::FakeAgent,
    clock::FakeClock,
    models::{ProcessState, SessionOrigin, ThreadState, ThreadStateEvent, OPEN_END},
};

const STREAM: StreamId = 1;
const PID: i32 = 42;
const SECOND: i64 = FakeClock::ONE_SECOND_NS;

struct Harness {
    service: QueryService,
    agent: Arc<FakeAgent>,
    clock: Arc<FakeClock>,
}

async fn harness_with(config: RelayConfig) -> Harness {
    let agent = Arc::new(FakeAgent::new());
    agent.add_process(STREAM, PID, "com.example.app", 0);
    let clock = Arc::new(FakeClock::new(0));
    let service = QueryService::new(Database::in_memory().unwrap(), clock.clone(), config);
    service
        .connect_stream(STREAM, "emulator-5554", agent.clone())
        .await
        .unwrap();
    Harness {
        service,
        agent,
        clock,
    }
}

async fn harness() -> Harness {
    harness_with(RelayConfig::default()).await
}

fn sample(timestamp: i64) -> MemorySample {
    MemorySample {
        pid: PID,
        timestamp,
        resident_bytes: 4096,
        virtual_bytes: 8192,
    }
}

fn thread_event(thread_id: i64, timestamp: i64, state: ThreadState) -> ThreadStateEvent {
    ThreadStateEvent {
        pid: PID,
        thread_id,
        name: format!("worker-{thread_id}"),
        timestamp,
        state,
    }
}

impl Harness {
    async fn poll_batch(&self, batch: TelemetryBatch) -> TickMerge {
        self.agent.push_batch(batch);
        self.service.poll_once(STREAM).await.unwrap()
    }
}

#[tokio::test]
async fn thread_window_synthesizes_live_threads_and_drops_dead_ones() {
    let h = harness().await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();

    h.poll_batch(TelemetryBatch {
        threads: vec![
            thread_event(1, SECOND, ThreadState::Running),
            thread_event(1, 10 * SECOND, ThreadState::Dead),
            thread_event(2, 5 * SECOND, ThreadState::Running),
        ],
        ..Default::default()
    })
    .await;

    let activity = h
        .service
        .get_thread_activity(session.session_id, 20 * SECOND, 40 * SECOND)
        .await;
    assert_eq!(activity.records.len(), 1);
    let thread = &activity.records[0];
    assert_eq!(thread.thread_id, 2);
    assert_eq!(thread.events.len(), 1);
    assert_eq!(thread.events[0].timestamp, 20 * SECOND);
    assert_eq!(thread.events[0].state, ThreadState::Running);
}

#[tokio::test]
async fn new_poll_invalidates_cached_responses() {
    let h = harness().await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();
    h.poll_batch(TelemetryBatch {
        memory: vec![sample(5 * SECOND), sample(10 * SECOND)],
        ..Default::default()
    })
    .await;

    let first = h.service.get_memory_samples(session.session_id, 0, 20 * SECOND).await;
    let again = h.service.get_memory_samples(session.session_id, 0, 20 * SECOND).await;
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(first.records.len(), 2);

    let wider = h
        .service
        .get_memory_samples(session.session_id, 0, 20 * SECOND + 1)
        .await;
    assert!(!Arc::ptr_eq(&first, &wider));
    assert_eq!(first.records, wider.records);

    h.poll_batch(TelemetryBatch {
        memory: vec![sample(21 * SECOND)],
        ..Default::default()
    })
    .await;

    let after = h.service.get_memory_samples(session.session_id, 0, 20 * SECOND).await;
    assert!(!Arc::ptr_eq(&first, &after));
    assert_eq!(first.records, after.records);
}

#[tokio::test]
async fn one_open_session_per_stream() {
    let h = harness().await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();
    assert!(session.is_open());

    let err = h.service.begin_session(STREAM, PID).await.unwrap_err();
    assert_matches!(
        err,
        RelayError::SessionAlreadyOpen { stream_id: STREAM, session_id } if session_id == session.session_id
    );

    let open: Vec<Session> = h
        .service
        .get_sessions()
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.stream_id == STREAM && s.is_open())
        .collect();
    assert_eq!(open.len(), 1);

    h.clock.advance(3 * SECOND);
    let ended = h.service.end_session(session.session_id).await.unwrap();
    assert_eq!(ended.end_timestamp, 3 * SECOND);
    let again = h.service.end_session(session.session_id).await.unwrap();
    assert_eq!(again, ended);

    h.service.begin_session(STREAM, PID).await.unwrap();
}

#[tokio::test]
async fn begin_session_preconditions() {
    let h = harness().await;
    let err = h.service.begin_session(STREAM, 999).await.unwrap_err();
    assert_matches!(err, RelayError::ProcessNotAlive { pid: 999, .. });

    let err = h.service.begin_session(77, PID).await.unwrap_err();
    assert_matches!(err, RelayError::StreamNotFound(77));

    h.agent.set_connected(false);
    let err = h.service.begin_session(STREAM, PID).await.unwrap_err();
    assert_matches!(err, RelayError::StreamDisconnected(STREAM));
}

#[tokio::test]
async fn blobs_are_served_after_the_agent_goes_away() {
    let h = harness().await;
    h.agent.put_blob("heap-dump-42-1", vec![0xCA, 0xFE, 0xBA, 0xBE]);

    let first = h.service.get_bytes(STREAM, "heap-dump-42-1").await;
    h.agent.set_connected(false);
    let second = h.service.get_bytes(STREAM, "heap-dump-42-1").await;

    assert_eq!(first, vec![0xCA, 0xFE, 0xBA, 0xBE]);
    assert_eq!(first, second);
    assert_eq!(h.agent.calls("get_bytes"), 1);

    assert!(h.service.get_bytes(STREAM, "missing").await.is_empty());
}

#[tokio::test]
async fn stopping_fails_only_in_progress_dumps() {
    let h = harness().await;
    h.agent.set_time(100 * SECOND);
    let session = h.service.begin_session(STREAM, PID).await.unwrap();

    let finished = HeapDumpInfo::in_progress(PID, 50 * SECOND)
        .close(60 * SECOND, IntervalStatus::Succeeded);
    h.poll_batch(TelemetryBatch {
        heap_dumps: vec![finished.clone()],
        ..Default::default()
    })
    .await;

    let running = h.service.trigger_heap_dump(session.session_id).await.unwrap();
    assert_eq!(running.start_time, 100 * SECOND);
    assert_eq!(running.end_time, OPEN_END);

    let closed = h.service.stop_profiling_app(STREAM, PID).await.unwrap().unwrap();
    assert!(!closed.is_open());

    let dumps = h
        .service
        .get_heap_dumps(session.session_id, 0, OPEN_END)
        .await;
    assert_eq!(dumps.records.len(), 2);
    assert_eq!(dumps.records[0], finished);

    let failed = &dumps.records[1];
    assert_eq!(failed.status, IntervalStatus::Failed);
    assert!(!failed.success());
    assert_eq!(failed.start_time, 100 * SECOND);
    assert_eq!(failed.end_time, 100 * SECOND + 1);
    assert_eq!(h.agent.calls("stop_profiling_app"), 1);
}

#[tokio::test]
async fn late_success_after_stop_is_ignored() {
    let h = harness().await;
    h.agent.set_time(10 * SECOND);
    let session = h.service.begin_session(STREAM, PID).await.unwrap();
    h.service.trigger_heap_dump(session.session_id).await.unwrap();
    h.service.end_session(session.session_id).await.unwrap();

    let merged = h
        .poll_batch(TelemetryBatch {
            heap_dumps: vec![HeapDumpInfo::in_progress(PID, 10 * SECOND)
                .close(12 * SECOND, IntervalStatus::Succeeded)],
            ..Default::default()
        })
        .await;
    assert_eq!(merged, TickMerge::NoSession);

    let dumps = h.service.get_heap_dumps(session.session_id, 0, OPEN_END).await;
    assert_eq!(dumps.records.len(), 1);
    assert_eq!(dumps.records[0].status, IntervalStatus::Failed);
}

#[tokio::test]
async fn disconnect_marks_processes_dead_and_keeps_data() {
    let h = harness().await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();
    h.poll_batch(TelemetryBatch {
        memory: vec![sample(SECOND)],
        ..Default::default()
    })
    .await;

    h.agent.set_connected(false);
    assert_eq!(h.service.poll_once(STREAM).await.unwrap(), TickMerge::Disconnected);

    let processes = h.service.get_processes(STREAM).await.unwrap();
    assert!(processes.iter().all(|p| p.state == ProcessState::Dead));

    let devices = h.service.get_devices().await.unwrap();
    assert_eq!(devices[0].state, DeviceState::Disconnected);

    let stored = h.service.get_sessions().await.unwrap();
    assert!(stored[0].is_open());

    let samples = h.service.get_memory_samples(session.session_id, 0, 10 * SECOND).await;
    assert_eq!(samples.records.len(), 1);
}

#[tokio::test]
async fn reconnect_adds_new_process_records() {
    let h = harness().await;
    h.service.poll_once(STREAM).await.unwrap();
    h.agent.set_connected(false);
    h.service.poll_once(STREAM).await.unwrap();

    let first_boot = h.service.get_devices().await.unwrap()[0].boot_id.clone();

    // The app restarted with the same pid while the device was away.
    h.agent.set_connected(true);
    h.agent.remove_process(PID);
    h.agent.add_process(STREAM, PID, "com.example.app", 9 * SECOND);
    let device = h
        .service
        .connect_stream(STREAM, "emulator-5554", h.agent.clone())
        .await
        .unwrap();
    assert_ne!(device.boot_id, first_boot);
    assert_eq!(device.state, DeviceState::Connected);

    h.service.poll_once(STREAM).await.unwrap();
    let processes: Vec<(i64, ProcessState)> = h
        .service
        .get_processes(STREAM)
        .await
        .unwrap()
        .iter()
        .map(|p| (p.start_time_ns, p.state))
        .collect();
    assert_eq!(
        processes,
        vec![(0, ProcessState::Dead), (9 * SECOND, ProcessState::Alive)]
    );

    h.service.begin_session(STREAM, PID).await.unwrap();
}

#[tokio::test]
async fn repeated_batches_do_not_duplicate_records() {
    let h = harness().await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();
    let batch = TelemetryBatch {
        memory: vec![sample(SECOND), sample(2 * SECOND)],
        threads: vec![thread_event(3, SECOND, ThreadState::Running)],
        ..Default::default()
    };

    h.poll_batch(batch.clone()).await;
    let once = h.service.get_memory_samples(session.session_id, 0, OPEN_END).await;

    let merged = h.poll_batch(batch).await;
    assert_matches!(merged, TickMerge::Merged { ref report, .. } if report.duplicates == 3 && !report.changed());

    let twice = h.service.get_memory_samples(session.session_id, 0, OPEN_END).await;
    assert_eq!(once.records, twice.records);
    // Nothing changed, so the cached response survives.
    assert!(Arc::ptr_eq(&once, &twice));
}

#[tokio::test]
async fn bad_ranges_and_unknown_sessions_are_empty() {
    let h = harness().await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();

    let inverted = h.service.get_memory_samples(session.session_id, 20, 10).await;
    assert!(inverted.records.is_empty());
    assert_eq!((inverted.start, inverted.end), (20, 10));

    let unknown = h.service.get_gc_pauses(999, 0, 10).await;
    assert!(unknown.records.is_empty());
    assert_eq!(h.service.cache_stats().entries, 0);

    assert_eq!(h.service.get_latest_data_timestamp(999).await, None);
    let err = h.service.end_session(999).await.unwrap_err();
    assert_matches!(err, RelayError::SessionNotFound(999));
}

#[tokio::test]
async fn imported_sessions_are_queryable_and_deletable() {
    let h = harness().await;
    let imported = h
        .service
        .import_session(
            SessionImport {
                stream_id: STREAM,
                pid: PID,
                name: "capture.trace".into(),
                start_timestamp: 0,
                end_timestamp: 30 * SECOND,
            },
            TelemetryBatch {
                memory: vec![sample(SECOND), sample(2 * SECOND)],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(imported.origin, SessionOrigin::Imported);

    let samples = h.service.get_memory_samples(imported.session_id, 0, 30 * SECOND).await;
    assert_eq!(samples.records.len(), 2);

    let live = h.service.begin_session(STREAM, PID).await.unwrap();
    let err = h.service.delete_session(live.session_id).await.unwrap_err();
    assert_matches!(err, RelayError::SessionStillOpen(_));

    h.service.delete_session(imported.session_id).await.unwrap();
    let gone = h.service.get_memory_samples(imported.session_id, 0, 30 * SECOND).await;
    assert!(gone.records.is_empty());
}

#[tokio::test]
async fn sessions_are_ordered_by_stream_then_start() {
    let h = harness().await;
    let import = |stream_id: StreamId, start: i64| SessionImport {
        stream_id,
        pid: PID,
        name: "capture".into(),
        start_timestamp: start,
        end_timestamp: start + SECOND,
    };
    h.service
        .import_session(import(2, 5 * SECOND), TelemetryBatch::default())
        .await
        .unwrap();
    h.service
        .import_session(import(1, 9 * SECOND), TelemetryBatch::default())
        .await
        .unwrap();
    h.service
        .import_session(import(2, SECOND), TelemetryBatch::default())
        .await
        .unwrap();

    let order: Vec<(StreamId, i64)> = h
        .service
        .get_sessions()
        .await
        .unwrap()
        .iter()
        .map(|s| (s.stream_id, s.start_timestamp))
        .collect();
    assert_eq!(order, vec![(1, 9 * SECOND), (2, SECOND), (2, 5 * SECOND)]);
}

#[tokio::test]
async fn allocation_tracking_round_trip() {
    let h = harness().await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();

    h.agent.set_time(4 * SECOND);
    let started = h
        .service
        .start_allocation_tracking(session.session_id)
        .await
        .unwrap();
    assert_eq!(started.status, IntervalStatus::InProgress);

    h.agent.set_time(9 * SECOND);
    let stopped = h
        .service
        .stop_allocation_tracking(session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert!(stopped.success());
    assert_eq!((stopped.start_time, stopped.end_time), (4 * SECOND, 9 * SECOND));

    let spans = h
        .service
        .get_allocation_tracking(session.session_id, 0, OPEN_END)
        .await;
    assert_eq!(spans.records, vec![stopped]);
    assert!(h
        .service
        .stop_allocation_tracking(session.session_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn rejected_commands_do_not_disconnect() {
    let h = harness().await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();
    h.agent.set_reject_commands(true);

    let err = h.service.trigger_heap_dump(session.session_id).await.unwrap_err();
    assert_matches!(err, RelayError::CommandRejected(_));
    assert!(h.service.stream(STREAM).unwrap().tracker.is_connected().await);

    h.service.end_session(session.session_id).await.unwrap();
    let err = h.service.trigger_heap_dump(session.session_id).await.unwrap_err();
    assert_matches!(err, RelayError::StaleWrite { .. });
}

#[tokio::test]
async fn live_allocations_and_latest_timestamp() {
    let h = harness().await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();
    let alloc = |tag: i64, alloc_time: i64, free_time: i64| AllocationEvent {
        pid: PID,
        tag,
        class_name: "byte[]".into(),
        size: 1024,
        thread_id: 1,
        alloc_time,
        free_time,
    };
    h.poll_batch(TelemetryBatch {
        allocations: vec![
            alloc(1, SECOND, 3 * SECOND),
            alloc(2, 2 * SECOND, OPEN_END),
        ],
        ..Default::default()
    })
    .await;

    let live = h
        .service
        .get_live_allocations(session.session_id, 4 * SECOND)
        .await;
    let tags: Vec<i64> = live.records.iter().map(|a| a.tag).collect();
    assert_eq!(tags, vec![2]);

    let all = h.service.get_allocations(session.session_id, 0, 10 * SECOND).await;
    assert_eq!(all.records.len(), 2);

    assert_eq!(
        h.service.get_latest_data_timestamp(session.session_id).await,
        Some(3 * SECOND)
    );
}

#[tokio::test]
async fn monitoring_polls_until_stopped() {
    let h = harness_with(RelayConfig {
        poll_interval_ms: 5,
        ..RelayConfig::default()
    })
    .await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();
    h.agent.push_batch(TelemetryBatch {
        cpu: vec![CpuUsageSample {
            pid: PID,
            timestamp: SECOND,
            app_cpu_percent: 12.5,
            system_cpu_percent: 40.0,
        }],
        ..Default::default()
    });

    h.service.start_monitoring(STREAM).await.unwrap();
    assert!(h.service.is_monitoring(STREAM).await);
    assert!(h.service.start_monitoring(STREAM).await.is_err());

    let mut seen = 0;
    for _ in 0..200 {
        seen = h
            .service
            .get_cpu_usage(session.session_id, 0, OPEN_END)
            .await
            .records
            .len();
        if seen > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, 1);

    h.service.stop_monitoring(STREAM).await.unwrap();
    assert!(!h.service.is_monitoring(STREAM).await);
    let calls = h.agent.calls("get_incremental_data");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.agent.calls("get_incremental_data"), calls);
}

#[tokio::test]
async fn reconnect_while_the_app_keeps_running() {
    let h = harness().await;
    h.service.poll_once(STREAM).await.unwrap();

    // A short blip: one failed poll, then the same agent comes back.
    h.agent.set_connected(false);
    assert_eq!(h.service.poll_once(STREAM).await.unwrap(), TickMerge::Disconnected);
    h.agent.set_connected(true);
    h.service
        .connect_stream(STREAM, "emulator-5554", h.agent.clone())
        .await
        .unwrap();
    h.service.poll_once(STREAM).await.unwrap();

    let processes: Vec<(i32, i64, ProcessState)> = h
        .service
        .get_processes(STREAM)
        .await
        .unwrap()
        .iter()
        .map(|p| (p.pid, p.start_time_ns, p.state))
        .collect();
    assert_eq!(
        processes,
        vec![(PID, 0, ProcessState::Dead), (PID, 0, ProcessState::Alive)]
    );

    let session = h.service.begin_session(STREAM, PID).await.unwrap();
    assert_eq!(session.pid, PID);
}

#[tokio::test]
async fn in_flight_tick_does_not_land_in_the_next_session() {
    let h = harness().await;
    let first = h.service.begin_session(STREAM, PID).await.unwrap();
    h.agent.push_batch(TelemetryBatch {
        memory: vec![sample(SECOND)],
        ..Default::default()
    });
    h.agent.set_delay(Duration::from_millis(100));

    let (merged, second) = tokio::join!(h.service.poll_once(STREAM), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.service.end_session(first.session_id).await.unwrap();
        h.service.begin_session(STREAM, PID).await.unwrap()
    });

    assert_eq!(
        merged.unwrap(),
        TickMerge::Stale {
            session_id: first.session_id
        }
    );
    let later = h.service.get_memory_samples(second.session_id, 0, OPEN_END).await;
    assert!(later.records.is_empty());
    let earlier = h.service.get_memory_samples(first.session_id, 0, OPEN_END).await;
    assert!(earlier.records.is_empty());
}

#[tokio::test]
async fn queries_never_see_half_a_batch() {
    const BATCH: usize = 200;

    let h = harness().await;
    let session = h.service.begin_session(STREAM, PID).await.unwrap();
    h.agent.push_batch(TelemetryBatch {
        memory: (1..=BATCH as i64).map(sample).collect(),
        ..Default::default()
    });
    h.agent.set_delay(Duration::from_millis(20));

    let (merged, seen) = tokio::join!(h.service.poll_once(STREAM), async {
        let mut seen = Vec::new();
        for end in 0..150 {
            // A fresh end every time so each read reaches the store.
            let samples = h
                .service
                .get_memory_samples(session.session_id, 0, 10 * SECOND + end)
                .await;
            seen.push(samples.records.len());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        seen
    });

    assert_matches!(merged.unwrap(), TickMerge::Merged { ref report, .. } if report.inserted == BATCH);
    assert!(
        seen.iter().all(|&count| count == 0 || count == BATCH),
        "partial batch observed: {seen:?}"
    );
    let after = h
        .service
        .get_memory_samples(session.session_id, 0, OPEN_END)
        .await;
    assert_eq!(after.records.len(), BATCH);
}
