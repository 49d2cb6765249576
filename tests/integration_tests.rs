//! Session behavior against a live Redis.
//!
//! Uses `REDIS_URL` (default `redis://127.0.0.1:6379`). Every test skips when Redis is not
//! reachable. Each test works in its own freshly created session so tests can run in
//! parallel against one server.

use crawl_session::logging::init_test_logging;
use crawl_session::models::{SessionMeta, FIELD_URL, FIELD_VERSION};
use crawl_session::{
    run_heartbeat, HintStatus, SessionError, SessionLookup, SessionManager, SessionStatus,
    StatsEventKind, StatsSubscription, SubscribeTarget, UrlState, UrlStatus, SCHEMA_VERSION,
};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn manager() -> Option<SessionManager> {
    init_test_logging();
    match tokio::time::timeout(Duration::from_secs(2), SessionManager::connect(&redis_url())).await
    {
        Ok(Ok(m)) => Some(m),
        _ => {
            println!("Redis not available, skipping test");
            None
        }
    }
}

async fn raw_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open(redis_url())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

/// Count events of `kind` for `session_id`, waiting at most a few seconds for `expected`.
async fn collect_events(
    subscription: &mut StatsSubscription,
    session_id: &str,
    kind: &StatsEventKind,
    expected: usize,
) -> usize {
    let mut seen = 0;
    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        while seen < expected {
            match subscription.next_event().await {
                Some(event) if event.session_id == session_id && &event.kind == kind => seen += 1,
                Some(_) => {}
                None => break,
            }
        }
    })
    .await;
    seen
}

/// Tally events per kind for `session_id` until `expected` have arrived or a few seconds pass.
async fn tally_events(
    subscription: &mut StatsSubscription,
    session_id: &str,
    expected: usize,
) -> HashMap<StatsEventKind, usize> {
    let mut tally = HashMap::new();
    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        let mut seen = 0;
        while seen < expected {
            match subscription.next_event().await {
                Some(event) if event.session_id == session_id => {
                    *tally.entry(event.kind).or_insert(0) += 1;
                    seen += 1;
                }
                Some(_) => {}
                None => break,
            }
        }
    })
    .await;
    tally
}

/// Give the SUBSCRIBE a moment to register before publishing.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_create_starts_zeroed_and_normal() {
    let Some(manager) = manager().await else { return };

    let session = manager.create("h1", "http://x").await.unwrap();
    let meta = session.get_meta().await.unwrap();

    assert_eq!(meta.version, SCHEMA_VERSION);
    assert_eq!(meta.hint_id, "h1");
    assert_eq!(meta.url, "http://x");
    assert_eq!(meta.total_tasks, 0);
    assert_eq!(meta.complete_tasks, 0);
    assert_eq!(meta.last_reported_status, HintStatus::Unprocessed);
    assert_eq!(session.get_status().await.unwrap(), SessionStatus::Normal);
    assert!(session.is_valid().await.unwrap());
    assert!(session.is_alive().await.unwrap());
    assert!(manager.has(session.id()).await.unwrap());
    assert!(manager.get(session.id()).await.unwrap().is_some());

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_add_url_counts_each_url_once() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();

    assert!(session.add_url("http://x/a").await.unwrap());
    assert!(session.add_url("http://x/b").await.unwrap());
    assert!(!session.add_url("http://x/a").await.unwrap());

    assert!(session.has_url("http://x/a").await.unwrap());
    assert_eq!(session.get_meta().await.unwrap().total_tasks, 2);
    assert_eq!(session.url_count().await.unwrap(), 2);
    assert_eq!(
        session.get_url_state("http://x/a").await.unwrap(),
        Some(UrlState::new(UrlStatus::Unprocessed))
    );

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_add_url_single_winner() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            session.add_url("http://x/shared").await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(session.get_meta().await.unwrap().total_tasks, 1);

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_url_state_set_and_patch() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    let url = "http://x/page";

    assert_eq!(session.get_url_state(url).await.unwrap(), None);
    assert_eq!(session.get_url_worker(url).await.unwrap(), None);

    let state = UrlState::new(UrlStatus::InProgress).with_worker("w-1");
    session.set_url_state(url, &state).await.unwrap();
    assert_eq!(session.get_url_state(url).await.unwrap(), Some(state));

    assert!(session.set_url_worker(url, "w-2").await.unwrap());
    assert!(session.set_url_status(url, UrlStatus::Done).await.unwrap());
    assert_eq!(
        session.get_url_state(url).await.unwrap(),
        Some(UrlState::new(UrlStatus::Done).with_worker("w-2"))
    );
    assert_eq!(
        session.get_url_worker(url).await.unwrap().as_deref(),
        Some("w-2")
    );

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_patch_of_unknown_url_is_noop() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();

    assert!(!session.set_url_worker("http://x/ghost", "w-1").await.unwrap());
    assert!(!session.set_url_status("http://x/ghost", UrlStatus::Failed).await.unwrap());
    assert!(!session.has_url("http://x/ghost").await.unwrap());

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_content_set_is_idempotent() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();

    assert!(!session.has_content("http://x/a").await.unwrap());
    assert!(session.add_content("http://x/a").await.unwrap());
    assert!(session.has_content("http://x/a").await.unwrap());
    assert!(!session.add_content("http://x/a").await.unwrap());
    // Content does not need a url entry
    assert!(!session.has_url("http://x/a").await.unwrap());

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_tag_usage_keepout_is_separate() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();

    assert_eq!(session.get_tag_usage("kept").await.unwrap(), (0, 0));

    session.inc_tag_usage("kept", false).await.unwrap();
    assert_eq!(session.get_tag_usage("kept").await.unwrap(), (1, 0));

    session.inc_tag_usage("filtered", true).await.unwrap();
    assert_eq!(session.get_tag_usage("filtered").await.unwrap(), (0, 1));

    session.inc_tag_usage("kept", true).await.unwrap();
    assert_eq!(session.get_tag_usage("kept").await.unwrap(), (1, 1));

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_counters_increment_and_publish() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    let mut subscription = manager
        .subscribe(SubscribeTarget::Session(session.id().to_string()))
        .await
        .unwrap();
    settle().await;

    for _ in 0..3 {
        session.inc_complete_urls().await.unwrap();
    }
    session.inc_failed_urls().await.unwrap();
    session.inc_rejected_urls().await.unwrap();
    session.inc_crawled_content().await.unwrap();
    session.inc_evaluated_content().await.unwrap();
    session.inc_evaluated_content().await.unwrap();

    let meta = session.get_meta().await.unwrap();
    assert_eq!(meta.complete_tasks, 3);
    assert_eq!(meta.failed_tasks, 1);
    assert_eq!(meta.rejected_tasks, 1);
    assert_eq!(meta.crawled_content, 1);
    assert_eq!(meta.evaluated_content, 2);

    // One event per increment, named after the counter that moved
    let tally = tally_events(&mut subscription, session.id(), 8).await;
    assert_eq!(tally.get(&StatsEventKind::CompleteTasks), Some(&3));
    assert_eq!(tally.get(&StatsEventKind::FailedTasks), Some(&1));
    assert_eq!(tally.get(&StatsEventKind::RejectedTasks), Some(&1));
    assert_eq!(tally.get(&StatsEventKind::CrawledContent), Some(&1));
    assert_eq!(tally.get(&StatsEventKind::EvaluatedContent), Some(&2));
    assert_eq!(tally.values().sum::<usize>(), 8);

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_stop_is_broadcast() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    let mut subscription = manager
        .subscribe(SubscribeTarget::Session(session.id().to_string()))
        .await
        .unwrap();
    settle().await;

    session.set_status(SessionStatus::Stopped).await.unwrap();
    assert!(session.is_stopped().await.unwrap());
    assert!(!session.is_alive().await.unwrap());

    let received = collect_events(
        &mut subscription,
        session.id(),
        &StatsEventKind::StatusChange,
        1,
    )
    .await;
    assert_eq!(received, 1);

    session.set_status(SessionStatus::Normal).await.unwrap();
    assert!(session.is_alive().await.unwrap());

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_wildcard_subscription_sees_new_sessions() {
    let Some(manager) = manager().await else { return };
    let mut subscription = manager.subscribe(SubscribeTarget::All).await.unwrap();
    settle().await;

    let session = manager.create("h1", "http://x").await.unwrap();
    let received = collect_events(
        &mut subscription,
        session.id(),
        &StatsEventKind::StatusChange,
        1,
    )
    .await;
    assert_eq!(received, 1);

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_last_reported_status_is_not_broadcast() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    let mut subscription = manager
        .subscribe(SubscribeTarget::Session(session.id().to_string()))
        .await
        .unwrap();
    settle().await;

    session
        .set_last_reported_status(HintStatus::Finished)
        .await
        .unwrap();
    assert_eq!(
        session.get_last_reported_status().await.unwrap(),
        HintStatus::Finished
    );
    assert_eq!(session.get_status().await.unwrap(), SessionStatus::Normal);

    let received = tokio::time::timeout(Duration::from_millis(300), subscription.next_event()).await;
    assert!(received.is_err(), "unexpected event: {:?}", received);

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_since_last_tagged_cycle() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();

    assert_eq!(session.get_since_last_tagged().await.unwrap(), 0);
    assert_eq!(session.inc_since_last_tagged().await.unwrap(), 1);
    assert_eq!(session.inc_since_last_tagged().await.unwrap(), 2);
    assert_eq!(session.get_since_last_tagged().await.unwrap(), 2);

    session.reset_since_last_tagged().await.unwrap();
    assert_eq!(session.get_since_last_tagged().await.unwrap(), 0);

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_heartbeats() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();

    assert_eq!(session.get_heartbeat("never-seen").await.unwrap(), 0);

    let before = chrono::Utc::now().timestamp();
    session.add_heartbeat("w-1").await.unwrap();
    let seen = session.get_heartbeat("w-1").await.unwrap();
    assert!(seen >= before);

    let all = session.get_heartbeats().await.unwrap();
    assert_eq!(all.get("w-1"), Some(&seen));

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_loop_until_shutdown() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(run_heartbeat(
        session.clone(),
        "w-loop".to_string(),
        Duration::from_millis(50),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(session.get_heartbeat("w-loop").await.unwrap() > 0);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("heartbeat loop did not exit")
        .unwrap();

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_loop_exits_when_stopped() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    session.set_status(SessionStatus::Stopped).await.unwrap();
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(run_heartbeat(
        session.clone(),
        "w-stopped".to_string(),
        Duration::from_millis(50),
        shutdown_rx,
    ));

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("heartbeat loop did not exit")
        .unwrap();
    assert_eq!(session.get_heartbeat("w-stopped").await.unwrap(), 0);

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_loop_respects_initial_shutdown() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(true);

    let handle = tokio::spawn(run_heartbeat(
        session.clone(),
        "w-early".to_string(),
        Duration::from_millis(50),
        shutdown_rx,
    ));

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("heartbeat loop did not exit")
        .unwrap();
    assert_eq!(session.get_heartbeat("w-early").await.unwrap(), 0);

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_loop_exits_after_manager_stop() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    let id = session.id().to_string();
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(run_heartbeat(
        session.clone(),
        "w-closed".to_string(),
        Duration::from_millis(50),
        shutdown_rx,
    ));
    tokio::time::sleep(Duration::from_millis(150)).await;

    manager.stop();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("heartbeat loop kept running on a stopped manager")
        .unwrap();

    if let Some(other) = self::manager().await {
        other.remove(&id).await.unwrap();
    }
}

#[tokio::test]
async fn test_removed_session_with_late_increment_is_not_alive() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    manager.remove(session.id()).await.unwrap();

    // A worker that missed the removal still bumps a counter
    session.inc_complete_urls().await.unwrap();

    assert!(session.exists().await.unwrap());
    assert!(!session.is_alive().await.unwrap());
    assert!(!session.is_valid().await.unwrap());

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_remove_deletes_everything() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    session.add_url("http://x/a").await.unwrap();
    session.add_content("http://x/a").await.unwrap();
    session.inc_tag_usage("t", false).await.unwrap();
    session.add_heartbeat("w-1").await.unwrap();

    manager.remove(session.id()).await.unwrap();

    assert!(!manager.has(session.id()).await.unwrap());
    assert!(manager.get(session.id()).await.unwrap().is_none());
    assert!(matches!(
        manager.lookup(session.id()).await.unwrap(),
        SessionLookup::NotFound
    ));

    let mut conn = raw_connection().await;
    for key in session.keys().all() {
        let exists: bool = conn.exists(key).await.unwrap();
        assert!(!exists, "{} survived removal", key);
    }
}

#[tokio::test]
async fn test_absent_session_errors() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();
    manager.remove(session.id()).await.unwrap();

    assert!(matches!(
        session.get_meta().await,
        Err(SessionError::NotFound(_))
    ));
    assert!(matches!(
        session.get_status().await,
        Err(SessionError::NotFound(_))
    ));
    assert!(!session.exists().await.unwrap());
    assert!(!session.is_alive().await.unwrap());
    assert!(!session.is_valid().await.unwrap());
    assert_eq!(session.get_heartbeat("w").await.unwrap(), 0);
}

#[tokio::test]
async fn test_stale_version_is_rejected() {
    let Some(manager) = manager().await else { return };
    let id = uuid::Uuid::new_v4().simple().to_string();
    let key = crawl_session::keys::meta_key(&id);

    let mut meta = SessionMeta::initial("h1", "http://x");
    meta.version = SCHEMA_VERSION - 1;
    let mut conn = raw_connection().await;
    let _: () = conn.hset_multiple(&key, &meta.to_fields()).await.unwrap();

    assert!(manager.has(&id).await.unwrap());
    assert!(manager.get(&id).await.unwrap().is_none());

    match manager.lookup(&id).await.unwrap() {
        SessionLookup::Stale { session, version } => {
            assert_eq!(version, Some(SCHEMA_VERSION - 1));
            assert!(!session.is_valid().await.unwrap());
            // Still readable, the record is complete
            assert_eq!(session.get_meta().await.unwrap().version, SCHEMA_VERSION - 1);
        }
        other => panic!("Expected Stale, got {:?}", other),
    }

    let _: () = conn.hset(&key, FIELD_VERSION, SCHEMA_VERSION).await.unwrap();
    assert!(manager.get(&id).await.unwrap().is_some());

    manager.remove(&id).await.unwrap();
}

#[tokio::test]
async fn test_missing_field_is_stale_and_get_meta_fails() {
    let Some(manager) = manager().await else { return };
    let session = manager.create("h1", "http://x").await.unwrap();

    let mut conn = raw_connection().await;
    let _: () = conn.hdel(&session.keys().meta, FIELD_URL).await.unwrap();

    assert!(!session.is_valid().await.unwrap());
    assert!(matches!(
        session.get_meta().await,
        Err(SessionError::MissingField { field: FIELD_URL })
    ));
    assert!(matches!(
        manager.lookup(session.id()).await.unwrap(),
        SessionLookup::Stale { .. }
    ));

    manager.remove(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_get_ids_lists_created_sessions() {
    let Some(manager) = manager().await else { return };
    let a = manager.create("h1", "http://x").await.unwrap();
    let b = manager.create("h2", "http://y").await.unwrap();

    let ids = manager.get_ids(100_000).await.unwrap();
    assert!(ids.iter().any(|id| id == a.id()));
    assert!(ids.iter().any(|id| id == b.id()));

    assert!(manager.get_ids(1).await.unwrap().len() <= 1);
    assert!(manager.get_ids(0).await.unwrap().is_empty());

    manager.remove(a.id()).await.unwrap();
    manager.remove(b.id()).await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_manager_and_sessions() {
    let Some(manager) = manager().await else { return };
    assert!(manager.is_ready().await);

    let session = manager.create("h1", "http://x").await.unwrap();
    let id = session.id().to_string();

    manager.stop();

    assert!(!manager.is_ready().await);
    assert!(matches!(session.get_meta().await, Err(SessionError::Closed)));
    assert!(matches!(manager.has(&id).await, Err(SessionError::Closed)));

    if let Some(other) = self::manager().await {
        other.remove(&id).await.unwrap();
    }
}

#[tokio::test]
async fn test_stop_ends_open_subscriptions() {
    let Some(manager) = manager().await else { return };
    let mut session_sub = manager
        .subscribe(SubscribeTarget::Session("nobody".to_string()))
        .await
        .unwrap();
    let mut all_sub = manager.subscribe(SubscribeTarget::All).await.unwrap();

    manager.stop();

    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        (session_sub.next_event().await, all_sub.next_event().await)
    })
    .await
    .expect("subscriptions kept waiting after stop");
    assert_eq!(ended, (None, None));
    assert!(matches!(
        manager.subscribe(SubscribeTarget::All).await,
        Err(SessionError::Closed)
    ));
}
