use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crosstrack_rs::config::{EngineConfig, ZoneConfig, ZoneDefinition};
use crosstrack_rs::events::{
    CONNECTIVITY_DETECTOR, ConnectivityMonitor, Event, ZoneEvent, ZoneShape,
};
use crosstrack_rs::integration::LocalTrackBuilder;
use crosstrack_rs::lifecycle::{ChannelSink, LifecycleSink, NotificationKind};
use crosstrack_rs::tracker::SyncBatch;
use crosstrack_rs::{FusionPipeline, LocalTrack, ObjectState, TrackingBatch};

const FRAME: u32 = 100;

fn config() -> EngineConfig {
    EngineConfig {
        zones: ZoneConfig {
            event_threshold: 0.2,
            ..ZoneConfig::default()
        },
        zone_definitions: vec![ZoneDefinition {
            source_id: 0,
            shape: ZoneShape::Rectangle,
            coords: vec![(0.3, 0.5), (0.7, 0.9)],
        }],
        ..EngineConfig::default()
    }
}

/// A person whose feet are at `feet` (pixels) on a 100x100 frame.
fn person(camera: u32, feet: (f32, f32), feature: &[f32]) -> LocalTrack {
    LocalTrackBuilder::new(camera, 1)
        .tlbr(feet.0 - 10.0, feet.1 - 40.0, feet.0 + 10.0, feet.1)
        .score(0.9)
        .feature(feature)
        .build()
}

fn sync_batch(frame: u64, feet: (f32, f32)) -> SyncBatch {
    let timestamp = frame as f64 * 0.1;
    vec![
        TrackingBatch::new(0, frame, timestamp, vec![person(0, feet, &[1.0, 0.0])])
            .with_frame_size(FRAME, FRAME),
        TrackingBatch::new(1, frame, timestamp, vec![person(1, (20.0, 90.0), &[0.99, 0.02])])
            .with_frame_size(FRAME, FRAME),
    ]
}

fn push(pipeline: &FusionPipeline, batch: SyncBatch) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pipeline.push(batch.clone()) {
        assert!(Instant::now() < deadline, "resolver never accepted the batch");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn wait_for_zone_events(pipeline: &FusionPipeline, want: usize) -> Vec<ZoneEvent> {
    let events = pipeline.events();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen = Vec::new();
    while seen.len() < want && Instant::now() < deadline {
        if let Ok(batch) = events.recv_timeout(Duration::from_millis(100)) {
            for event in batch.into_values().flatten() {
                if let Event::Zone(zone_event) = event {
                    seen.push(zone_event);
                }
            }
        }
    }
    seen
}

#[test]
fn test_end_to_end_fusion_lifecycle_and_zone_events() {
    crosstrack_rs::init_logging();
    let (tx, notifications) = crossbeam_channel::unbounded();
    let sink: Arc<dyn LifecycleSink> = Arc::new(ChannelSink::new(tx));
    let mut pipeline = FusionPipeline::start(&config(), Vec::new(), Some(sink)).unwrap();
    let fused = pipeline.fused();
    let lifecycle = pipeline.lifecycle();

    // Walk into the zone and stay.
    for frame in 1..=6 {
        push(&pipeline, sync_batch(frame, (50.0, 70.0)));
    }

    let first = fused.recv_timeout(Duration::from_secs(5)).unwrap();
    let id0 = first.batches[0].tracks[0].global_id;
    assert!(id0.is_some());
    assert_eq!(first.batches[1].tracks[0].global_id, id0);

    let entered = wait_for_zone_events(&pipeline, 1);
    assert_eq!(entered.len(), 1);
    assert!(!entered[0].finished);
    assert_eq!(entered[0].entry.frame_id, 1);
    let zone_id = entered[0].zone.zone_id;
    assert_eq!(pipeline.zone_detector(0).map(|z| z.occupancy(zone_id)), Some(1));

    // Walk out.
    for frame in 7..=8 {
        push(&pipeline, sync_batch(frame, (50.0, 20.0)));
    }
    let left = wait_for_zone_events(&pipeline, 1);
    assert_eq!(left.len(), 1);
    assert!(left[0].finished);
    assert_eq!(left[0].event_id, entered[0].event_id);
    assert_eq!(left[0].exit.as_ref().map(|h| h.frame_id), Some(7));

    // One object per camera, each created once then updated.
    let kinds: Vec<NotificationKind> = (0..16)
        .map_while(|_| notifications.recv_timeout(Duration::from_secs(5)).ok())
        .map(|n| n.kind)
        .collect();
    assert_eq!(kinds.len(), 16);
    assert_eq!(kinds.iter().filter(|k| **k == NotificationKind::Created).count(), 2);
    assert_eq!(lifecycle.generation(), 16);
    assert_eq!(lifecycle.snapshot(ObjectState::Active, None).len(), 2);

    assert!(pipeline.stop());
}

#[test]
fn test_zones_added_at_runtime_on_two_sources() {
    let config = EngineConfig {
        zones: ZoneConfig {
            event_threshold: 0.2,
            ..ZoneConfig::default()
        },
        ..EngineConfig::default()
    };
    let mut pipeline = FusionPipeline::start(&config, Vec::new(), None).unwrap();
    assert!(pipeline.zone_detector(0).is_none());

    let gate = pipeline
        .add_zone(0, ZoneShape::Rectangle, vec![(0.3, 0.5), (0.7, 0.9)])
        .unwrap();
    let corner = pipeline
        .add_zone(1, ZoneShape::Rectangle, vec![(0.1, 0.8), (0.3, 1.0)])
        .unwrap();
    assert_ne!(gate, corner);
    assert!(pipeline.add_zone(2, ZoneShape::Polygon, vec![(0.0, 0.0)]).is_err());
    assert!(pipeline.zone_detector(2).is_none());

    for frame in 1..=6 {
        push(&pipeline, sync_batch(frame, (50.0, 70.0)));
    }
    let entered = wait_for_zone_events(&pipeline, 2);
    assert_eq!(entered.len(), 2);
    let mut zones: Vec<u64> = entered.iter().map(|e| e.zone.zone_id).collect();
    zones.sort_unstable();
    assert_eq!(zones, vec![gate, corner]);
    assert_ne!(entered[0].event_id, entered[1].event_id);

    assert!(pipeline.stop());
}

#[test]
fn test_connectivity_events_reach_the_aggregate_stream() {
    let monitor = ConnectivityMonitor::new(0, "rtsp://gate");
    let mut pipeline =
        FusionPipeline::start(&EngineConfig::default(), vec![monitor.clone()], None).unwrap();

    monitor.record(false, Utc::now());
    let batch = pipeline.events().recv_timeout(Duration::from_secs(5)).unwrap();
    let events = &batch[CONNECTIVITY_DETECTOR];
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], Event::Camera(e) if !e.connected && e.address == "rtsp://gate"));

    assert!(pipeline.stop());
}

#[test]
fn test_push_reports_backpressure() {
    let mut pipeline = FusionPipeline::start(&EngineConfig::default(), Vec::new(), None).unwrap();
    // The resolver queue holds two cycles; flooding it fails fast instead of blocking.
    let started = Instant::now();
    let accepted = (1..=50).filter(|&f| pipeline.push(sync_batch(f, (50.0, 70.0)))).count();
    assert!(accepted >= 2);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(pipeline.stop());
}
