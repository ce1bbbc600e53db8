mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{child, eventually, Fixture};
use haven_core::capabilities::{NoticeCode, SqliteKv};
use haven_core::offline_store::CacheCategory;
use haven_core::{
    ActionPayload, DrainOutcome, LatLon, LocationSample, MotionSample, SosTrigger,
    SubmitOutcome, UnixTimeMs,
};

#[tokio::test]
async fn going_online_drains_the_queue_to_zero() {
    let fx = Fixture::new();
    let core = fx.core(false);
    assert!(core.start_auto_sync());

    core.send_message(child(), "kid", "first").await.unwrap();
    core.send_message(child(), "kid", "second").await.unwrap();
    core.set_status(child(), "walking home").await.unwrap();
    assert_eq!(core.status().queued_action_count, 3);
    assert_eq!(fx.remote.write_count(), 0);

    core.connectivity().set_online(true);
    assert!(eventually(Duration::from_secs(2), || core.status().queued_action_count == 0).await);

    let messages = fx.remote.snapshot("chats/KID7/messages").unwrap();
    let texts: Vec<_> = {
        let map = messages.as_object().unwrap();
        let mut keys: Vec<_> = map.keys().collect();
        keys.sort();
        keys.iter().map(|k| map[*k]["text"].clone()).collect()
    };
    assert_eq!(texts, vec!["first", "second"]);

    assert_eq!(fx.notifier.notices(NoticeCode::ConnectivityRestored).len(), 1);
    let completed = fx.notifier.notices(NoticeCode::SyncCompleted);
    assert_eq!(completed.last().unwrap().get("succeeded"), Some("3"));
    assert!(core.status().last_sync_timestamp.is_some());

    core.connectivity().set_online(false);
    assert!(
        eventually(Duration::from_secs(1), || {
            !fx.notifier.notices(NoticeCode::ConnectivityLost).is_empty()
        })
        .await
    );
    core.shutdown().await;
}

#[tokio::test]
async fn queue_and_retry_counts_survive_restart_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("haven.db");

    let ids = {
        let fx = Fixture::with_store(Arc::new(SqliteKv::open(&path).unwrap()));
        let core = fx.core(false);
        core.set_status(child(), "one").await.unwrap();
        core.raise_sos(child(), Some(LatLon::new(1.0, 2.0).unwrap()), SosTrigger::Manual)
            .await
            .unwrap();

        fx.remote.set_reachable(false);
        core.connectivity().set_online(true);
        assert!(matches!(core.engine().drain().await, DrainOutcome::Completed(_)));
        core.engine()
            .queued_actions()
            .into_iter()
            .map(|a| a.id)
            .collect::<Vec<_>>()
    };

    let fx = Fixture::with_store(Arc::new(SqliteKv::open(&path).unwrap()));
    let core = fx.core(false);
    let restored = core.engine().queued_actions();
    assert_eq!(restored.iter().map(|a| a.id.clone()).collect::<Vec<_>>(), ids);
    assert!(restored.iter().all(|a| a.retry_count == 1));
    assert!(core.status().last_sync_timestamp.is_some());
    assert_eq!(
        core.engine().offline_cache().len(CacheCategory::SosAlerts),
        1
    );
}

#[tokio::test]
async fn callbacks_after_stop_do_not_reach_the_engine() {
    let fx = Fixture::new();
    let core = fx.core(true);
    assert!(core.start_background(child()).await);

    let stale = fx.location.last_issued().unwrap();
    core.stop_background();

    let fix = LocationSample::new(LatLon::new(4.0, 4.0).unwrap(), 3.0, UnixTimeMs::now());
    stale.sample(fix);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fx.remote.write_count(), 0);
    assert_eq!(core.status().queued_action_count, 0);
    assert_eq!(fx.location.active_watches(), 0);
    assert_eq!(fx.wake.held_count(), 0);
}

#[tokio::test]
async fn gesture_sos_queued_offline_is_delivered_on_reconnect() {
    let fx = Fixture::new();
    let core = fx.core(false);
    core.start_auto_sync();
    assert!(core.start_background(child()).await);

    fx.location.emit(LocationSample::new(
        LatLon::new(51.5, -0.12).unwrap(),
        6.0,
        UnixTimeMs::now(),
    ));
    assert!(
        eventually(Duration::from_secs(1), || core.coordinator().last_position().is_some()).await
    );
    let base = UnixTimeMs::now();
    for (i, offset) in [0u64, 600, 1_200, 1_800].into_iter().enumerate() {
        let x = if i % 2 == 0 { 25.0 } else { -25.0 };
        fx.motion.emit(MotionSample::new(x, 0.0, 0.0, base.add_millis(offset)));
    }

    assert!(
        eventually(Duration::from_secs(1), || {
            core.engine()
                .queued_actions()
                .iter()
                .any(|a| matches!(a.payload, ActionPayload::SosAlert { .. }))
        })
        .await
    );
    assert_eq!(fx.notifier.notices(NoticeCode::PanicGesture).len(), 1);

    core.connectivity().set_online(true);
    assert!(eventually(Duration::from_secs(2), || core.status().queued_action_count == 0).await);

    let alerts = fx.remote.snapshot("sosAlerts").unwrap();
    let alert = alerts.as_object().unwrap().values().next().unwrap().clone();
    assert_eq!(alert["trigger"], "gesture");
    assert_eq!(alert["childCode"], "KID7");
    assert_eq!(alert["location"]["lat"], 51.5);

    core.shutdown().await;
}

#[tokio::test]
async fn offline_cache_keeps_the_newest_hundred_fixes() {
    let fx = Fixture::new();
    let core = fx.core(false);

    for i in 0..150u64 {
        let fix = LocationSample::new(LatLon::new(0.0, 0.0).unwrap(), 5.0, UnixTimeMs(i));
        let payload = ActionPayload::Location {
            child: child(),
            sample: fix,
        };
        let outcome = core.engine().submit(payload).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    }

    let cache = core.engine().offline_cache();
    assert_eq!(cache.len(CacheCategory::Locations), 100);
    let stamps: Vec<u64> = cache.locations().map(|s| s.timestamp.0).collect();
    assert_eq!(stamps.first(), Some(&50));
    assert_eq!(stamps.last(), Some(&149));
    assert_eq!(core.status().queued_action_count, 150);
}
