use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that emits the lazy expiry record for overdue holds
/// and prunes expired cuts. An optimization, not a correctness
/// requirement: admission always re-applies the TTL filter itself.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(engine.config().sweep_interval);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// One sweep pass; separated so tests can drive it without the timer.
pub async fn sweep_once(engine: &Engine) {
    let now = engine.clock().now_ms();
    for hold_id in engine.overdue_holds(now) {
        match engine.expire_hold(&hold_id).await {
            Ok(true) => {
                metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(1);
                info!("expired hold {hold_id}");
            }
            // Raced by a command that observed the expiry first — fine.
            Ok(false) => {}
            Err(e) => tracing::debug!("sweeper skip {hold_id}: {e}"),
        }
    }

    let pruned = engine.prune_cuts(now - engine.config().cut_ttl_ms);
    if pruned > 0 {
        tracing::debug!("pruned {pruned} expired cuts");
    }
}

/// Background task that compacts the WAL after a threshold of appends.
/// Checks every 10 seconds.
pub async fn run_compactor(engine: Arc<Engine>) {
    let threshold = engine.config().compact_threshold;
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("WAL compacted"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineConfig;
    use crate::id::{IdempotencyKey, ResourceId};
    use crate::model::Span;
    use std::path::PathBuf;

    const T0: i64 = 1_770_000_000_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tapline_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_emits_expiry_for_overdue_holds() {
        let clock = Arc::new(ManualClock::new(T0));
        let engine =
            Engine::open(EngineConfig::at(test_wal_path("sweep.wal")), clock.clone()).unwrap();
        let r = ResourceId::parse("urn:tap:resource:court-1").unwrap();

        engine
            .supply_delta(
                r.clone(),
                Span::new(T0, T0 + 3_600_000),
                1,
                IdempotencyKey::new("K0"),
            )
            .await
            .unwrap();
        engine
            .place_hold(
                vec![r.clone()],
                Span::new(T0, T0 + 3_600_000),
                vec![1],
                1,
                IdempotencyKey::new("K1"),
            )
            .await
            .unwrap();

        clock.advance(2_000);
        assert_eq!(engine.overdue_holds(clock.now_ms()).len(), 1);

        sweep_once(&engine).await;
        assert!(engine.overdue_holds(clock.now_ms()).is_empty());

        // The slot is admittable again.
        engine
            .place_hold(
                vec![r],
                Span::new(T0, T0 + 3_600_000),
                vec![1],
                600,
                IdempotencyKey::new("K2"),
            )
            .await
            .unwrap();
    }
}
