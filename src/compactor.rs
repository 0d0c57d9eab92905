use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that rewrites the WAL once `threshold` appends have piled up
/// since the last compaction. Stops when `shutdown` fires.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => {
                debug!("compactor stopping");
                return;
            }
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            // Lock timeouts under load are retried on the next tick
            Err(e) => warn!("compaction skipped: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Principal, RequestContext};
    use crate::model::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn admin() -> RequestContext {
        RequestContext::new(Principal::new("root@example.com", Roles::single(Role::Admin)))
    }

    #[tokio::test]
    async fn compacts_after_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        let ctx = admin();

        let room = engine
            .create_room(&ctx, NewRoom { id: None, name: "A1".into(), capacity: 10, has_computers: false })
            .await
            .unwrap();
        for n in 0..4 {
            engine
                .update_room(&ctx, room.id, RoomPatch { capacity: Some(20 + n), ..Default::default() })
                .await
                .unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 5);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_compactor(
            engine.clone(),
            3,
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        for _ in 0..100 {
            if engine.wal_appends_since_compact().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(engine.wal_appends_since_compact().await, 0);
        // A single RoomCreated carrying the latest capacity survives
        let events = crate::wal::Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::RoomCreated(r) if r.capacity == 23));
    }

    #[tokio::test]
    async fn below_threshold_leaves_wal_alone() {
        let path = test_wal_path("below.wal");
        let engine = Arc::new(Engine::new(path).unwrap());
        engine
            .create_room(&admin(), NewRoom { id: None, name: "B2".into(), capacity: 5, has_computers: true })
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_compactor(
            engine.clone(),
            10,
            Duration::from_millis(5),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(40)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(engine.wal_appends_since_compact().await, 1);
    }
}
