use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crosstrack_rs::config::{LifecycleConfig, WorkerConfig};
use crosstrack_rs::integration::LocalTrackBuilder;
use crosstrack_rs::lifecycle::{ChannelSink, LifecycleSink, NotificationKind};
use crosstrack_rs::tracker::SourceId;
use crosstrack_rs::{Error, LifecycleHandler, LocalTrack, ObjectState, TrackingBatch};

fn track(source: SourceId, id: u64) -> LocalTrack {
    LocalTrackBuilder::new(source, id)
        .tlwh(id as f32 * 30.0, 10.0, 20.0, 40.0)
        .score(0.8)
        .build()
}

fn handler(history_len: usize, lost_thresh: u32) -> LifecycleHandler {
    let config = LifecycleConfig {
        history_len,
        lost_thresh,
        ..LifecycleConfig::default()
    };
    LifecycleHandler::new(config, &WorkerConfig::default())
}

#[test]
fn test_history_keeps_most_recent_snapshots() {
    let handler = handler(3, 5);
    for frame in 1..=5 {
        handler.process(&TrackingBatch::new(0, frame, frame as f64, vec![track(0, 1)]));
    }

    let active = handler.snapshot(ObjectState::Active, Some(0));
    assert_eq!(active.len(), 1);
    let frames: Vec<u64> = active[0].history.iter().map(|h| h.frame_id).collect();
    assert_eq!(frames, vec![3, 4, 5]);
}

#[test]
fn test_object_lost_after_exactly_lost_thresh_misses() {
    let handler = handler(8, 5);
    handler.process(&TrackingBatch::new(0, 1, 0.0, vec![track(0, 1)]));

    // Four misses: still active.
    for frame in 2..=5 {
        handler.process(&TrackingBatch::new(0, frame, 0.0, vec![]));
    }
    assert_eq!(handler.snapshot(ObjectState::Active, Some(0)).len(), 1);
    assert!(handler.snapshot(ObjectState::Lost, None).is_empty());

    // Fifth miss: moved to lost.
    handler.process(&TrackingBatch::new(0, 6, 0.0, vec![]));
    assert!(handler.snapshot(ObjectState::Active, Some(0)).is_empty());
    let lost = handler.snapshot(ObjectState::Lost, None);
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].lost_frames, 5);
}

#[test]
fn test_other_sources_do_not_age_objects() {
    let handler = handler(8, 2);
    handler.process(&TrackingBatch::new(0, 1, 0.0, vec![track(0, 1)]));
    for frame in 1..=10 {
        handler.process(&TrackingBatch::new(1, frame, 0.0, vec![]));
    }
    assert_eq!(handler.snapshot(ObjectState::Active, Some(0)).len(), 1);
}

#[test]
fn test_concurrent_producers_create_every_object_once() {
    const PRODUCERS: u32 = 4;
    const TRACKS: u64 = 25;

    let handler = handler(4, 30);
    let handles: Vec<_> = (0..PRODUCERS)
        .map(|source| {
            let handle = handler.handle();
            thread::spawn(move || {
                // Each frame carries every track introduced so far, so none age out.
                for frame in 1..=TRACKS {
                    let tracks = (1..=frame).map(|id| track(source, id)).collect();
                    handle.process(&TrackingBatch::new(source, frame, frame as f64, tracks));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let active = handler.snapshot(ObjectState::Active, None);
    assert_eq!(active.len(), (PRODUCERS as u64 * TRACKS) as usize);
    let ids: HashSet<u64> = active.iter().map(|o| o.object_id).collect();
    assert_eq!(ids.len(), active.len());
    assert!(ids.iter().all(|&id| (1..=PRODUCERS as u64 * TRACKS).contains(&id)));
    assert_eq!(handler.handle().generation(), PRODUCERS as u64 * TRACKS);
}

#[test]
fn test_queued_submissions_and_notifications() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let sink: Arc<dyn LifecycleSink> = Arc::new(ChannelSink::new(tx));
    let mut handler =
        LifecycleHandler::with_sink(LifecycleConfig::default(), &WorkerConfig::default(), sink);

    assert!(matches!(
        handler.submit(TrackingBatch::new(0, 1, 0.0, vec![])),
        Err(Error::NotInitialized(_))
    ));
    handler.start().unwrap();

    for frame in 1..=2 {
        let batch = TrackingBatch::new(0, frame, frame as f64, vec![track(0, 1)]);
        while !handler.submit(batch.clone()).unwrap() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    let created = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let updated = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(created.kind, NotificationKind::Created);
    assert_eq!(updated.kind, NotificationKind::Updated);
    assert_eq!(created.object_id, updated.object_id);
    assert_eq!(updated.snapshot.frame_id, 2);
    assert!(handler.stop());
}

#[test]
fn test_failed_notifications_are_dead_lettered() {
    struct Offline;
    impl LifecycleSink for Offline {
        fn deliver(
            &self,
            _: &crosstrack_rs::lifecycle::LifecycleNotification,
        ) -> crosstrack_rs::Result<()> {
            Err(Error::Sink("offline".into()))
        }
    }

    let config = LifecycleConfig {
        sink_retries: 2,
        dead_letter_capacity: 1,
        ..LifecycleConfig::default()
    };
    let handler = LifecycleHandler::with_sink(config, &WorkerConfig::default(), Arc::new(Offline));
    handler.process(&TrackingBatch::new(0, 1, 0.0, vec![track(0, 1), track(0, 2)]));

    let parked = handler.handle().drain_dead_letters();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].object_id, 2);
    // The registry itself is unaffected by sink failures.
    assert_eq!(handler.snapshot(ObjectState::Active, Some(0)).len(), 2);
}
