//! End-to-end subscription behavior through the public API: ordered
//! fan-out, disconnect + resume via watermarks, snapshot handover, and
//! wire framing of committed events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tapline::id::{ActorId, IdempotencyKey, ResourceId};
use tapline::model::{SeqMark, Span};
use tapline::wire::{Envelope, Kind, Message, Stamp};
use tapline::{Engine, EngineConfig, ManualClock, StreamFrame, StreamRequest};

const H: i64 = 3_600_000;
const T0: i64 = 1_770_000_000_000;

fn rid(s: &str) -> ResourceId {
    ResourceId::parse(&format!("urn:tap:resource:{s}")).unwrap()
}

fn key(s: &str) -> IdempotencyKey {
    IdempotencyKey::new(s)
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tapline_test_stream_join");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn test_engine(name: &str) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = Engine::open(EngineConfig::at(test_wal_path(name)), clock.clone()).unwrap();
    (engine, clock)
}

async fn next_event_seq(sub: &mut tapline::Subscription) -> u64 {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), sub.next_frame())
            .await
            .expect("frame before timeout")
            .expect("stream still open");
        match frame {
            StreamFrame::Event { record, .. } => return record.seq,
            StreamFrame::Heartbeat => continue,
            StreamFrame::Bootstrap(_) => panic!("unexpected bootstrap"),
        }
    }
}

#[tokio::test]
async fn subscribers_see_identical_gapless_tails() {
    let (engine, _clock) = test_engine("fanout.wal");
    let engine = Arc::new(engine);
    let r = rid("court-1");

    let open = |after: SeqMark| StreamRequest {
        resources: vec![r.clone()],
        after: Some(vec![(r.clone(), after)]),
        include_bootstrap: false,
        window: None,
        heartbeat_sec: None,
    };
    let (_, mut sub_a) = engine.open_stream(open(-1)).await.unwrap();
    let (_, mut sub_b) = engine.open_stream(open(-1)).await.unwrap();

    for i in 0..5i64 {
        engine
            .supply_delta(
                r.clone(),
                Span::new(T0 + i * H, T0 + (i + 1) * H),
                1,
                key(&format!("K{i}")),
            )
            .await
            .unwrap();
    }

    for sub in [&mut sub_a, &mut sub_b] {
        let mut seqs = Vec::new();
        for _ in 0..5 {
            seqs.push(next_event_seq(sub).await);
        }
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }
}

#[tokio::test]
async fn disconnect_then_resume_from_watermark() {
    let (engine, _clock) = test_engine("resume.wal");
    let r = rid("court-1");
    let day = Span::new(T0, T0 + 24 * H);

    engine
        .supply_delta(r.clone(), day, 2, key("K0"))
        .await
        .unwrap();

    // First connection bootstraps and then goes away.
    let (opened, sub) = engine
        .open_stream(StreamRequest {
            resources: vec![r.clone()],
            after: None,
            include_bootstrap: true,
            window: Some(day),
            heartbeat_sec: None,
        })
        .await
        .unwrap();
    let watermark = opened.as_of[&r];
    assert_eq!(watermark, 0);
    drop(sub); // cancellation is immediate and idempotent

    // Activity continues while nobody is listening.
    let hold = engine
        .place_hold(
            vec![r.clone()],
            Span::new(T0 + 9 * H, T0 + 10 * H),
            vec![1],
            600,
            key("K1"),
        )
        .await
        .unwrap();
    engine
        .confirm_hold(hold.hold_id().unwrap(), key("K2"))
        .await
        .unwrap();

    // Reconnect with the watermark: exactly the missed events, in order.
    let (_, mut sub) = engine
        .open_stream(StreamRequest {
            resources: vec![r.clone()],
            after: Some(vec![(r.clone(), watermark)]),
            include_bootstrap: true, // ignored in resume mode
            window: None,
            heartbeat_sec: None,
        })
        .await
        .unwrap();
    assert_eq!(next_event_seq(&mut sub).await, 1);
    assert_eq!(next_event_seq(&mut sub).await, 2);
}

#[tokio::test]
async fn bootstrap_carries_window_state_for_late_joiners() {
    let (engine, _clock) = test_engine("late_join.wal");
    let r = rid("court-1");
    let day = Span::new(T0, T0 + 24 * H);

    engine
        .supply_delta(r.clone(), day, 2, key("K0"))
        .await
        .unwrap();
    let hold = engine
        .place_hold(
            vec![r.clone()],
            Span::new(T0 + 9 * H, T0 + 10 * H),
            vec![1],
            600,
            key("K1"),
        )
        .await
        .unwrap();

    let (_, mut sub) = engine
        .open_stream(StreamRequest {
            resources: vec![r.clone()],
            after: None,
            include_bootstrap: true,
            window: Some(day),
            heartbeat_sec: None,
        })
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), sub.next_frame())
        .await
        .unwrap()
        .unwrap();
    let state = match frame {
        StreamFrame::Bootstrap(state) => state,
        other => panic!("expected bootstrap, got {other:?}"),
    };
    assert_eq!(state.as_of_seq, 1);
    assert_eq!(state.holds.len(), 1);
    assert_eq!(state.holds[0].hold_id, hold.hold_id().unwrap());

    // The bootstrap converts straight into its wire frame.
    let evt = state.to_wire();
    let msg = Message::StateBootstrap(evt);
    let env = Envelope::new(
        ActorId::new("urn:tap:node:test"),
        Stamp(T0),
        Kind::Evt,
        msg,
    );
    env.validate().unwrap();
    let json = serde_json::to_string(&env).unwrap();
    let back: Envelope = serde_json::from_str(&json).unwrap();
    assert_eq!(back, env);
}

#[tokio::test]
async fn committed_events_frame_as_wire_envelopes() {
    let (engine, _clock) = test_engine("wire_frames.wal");
    let r = rid("court-1");
    let day = Span::new(T0, T0 + 24 * H);

    engine
        .supply_delta(r.clone(), day, 1, key("K0"))
        .await
        .unwrap();
    let out = engine
        .place_hold(
            vec![r.clone()],
            Span::new(T0 + 9 * H, T0 + 10 * H),
            vec![1],
            600,
            key("K1"),
        )
        .await
        .unwrap();

    let (_, mut sub) = engine
        .open_stream(StreamRequest {
            resources: vec![r.clone()],
            after: Some(vec![(r.clone(), -1)]),
            include_bootstrap: false,
            window: None,
            heartbeat_sec: None,
        })
        .await
        .unwrap();

    let mut types = Vec::new();
    for _ in 0..2 {
        let frame = tokio::time::timeout(Duration::from_secs(5), sub.next_frame())
            .await
            .unwrap()
            .unwrap();
        let (resource, record) = match frame {
            StreamFrame::Event { resource, record } => (resource, record),
            other => panic!("unexpected frame: {other:?}"),
        };
        types.push(record.body.event_type());

        let msg = Message::from_event(&resource, &record);
        let env = Envelope::new(
            ActorId::new("urn:tap:node:test"),
            Stamp(record.ts),
            Kind::Evt,
            msg,
        );
        env.validate().unwrap();
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
    assert_eq!(types, vec!["supply.delta.applied", "hold.placed"]);
    assert_eq!(
        out.events[0].1.body.event_type(),
        "hold.placed"
    );

    sub.cancel();
    // A cancelled subscription stops yielding frames.
    engine
        .supply_delta(r.clone(), Span::new(T0, T0 + H), 1, key("K2"))
        .await
        .unwrap();
    let end = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            match sub.next_frame().await {
                None => break,
                Some(StreamFrame::Event { .. }) => panic!("frame after cancel"),
                Some(_) => continue,
            }
        }
    })
    .await;
    assert!(end.is_ok());
}
