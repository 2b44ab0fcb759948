//! End-to-end tests of the View State Reconciler against the local platform.
//!
//! Every test drives a real [`LocalApp`]: SQLite store, local change hub and
//! local identity provider, wired exactly as the RPC binary wires them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use serde_json::{json, Value};
use smartmarks::app::{App, LocalApp, LocalPlatform};
use smartmarks::managers::bookmark_manager::DeleteOutcome;
use smartmarks::services::realtime::{FeedTransport, LocalChangeHub, Subscription};
use smartmarks::services::store_client::BookmarkStore;
use smartmarks::types::bookmark::{BookmarkId, NewBookmark};
use smartmarks::types::errors::{BookmarkError, FeedError, StoreError, ValidationError};
use smartmarks::types::feed::{ChangeKind, FeedFilter, RawChange};
use smartmarks::types::session::Identity;
use smartmarks::types::settings::AppConfig;
use smartmarks::types::view::{Notice, NoticeLevel, ViewPhase, ViewState};
use tokio::time::timeout;

struct Harness {
    platform: LocalPlatform,
    app: LocalApp,
}

fn start() -> Harness {
    let config = AppConfig::default();
    let platform = LocalPlatform::open(&config).unwrap();
    let app = LocalApp::start_local(config, &platform);
    Harness { platform, app }
}

async fn wait(app: &LocalApp, predicate: impl FnMut(&ViewState) -> bool) -> ViewState {
    timeout(Duration::from_secs(2), app.wait_for_state(predicate))
        .await
        .expect("view state never settled")
        .unwrap()
}

async fn wait_for_subscriptions(platform: &LocalPlatform, expected: usize) {
    for _ in 0..200 {
        if platform.hub.active_subscriptions() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {} live subscriptions, found {}",
        expected,
        platform.hub.active_subscriptions()
    );
}

async fn sign_in(harness: &Harness) {
    harness.app.sign_in().await.unwrap();
    wait(&harness.app, |s| s.phase == ViewPhase::Ready).await;
    wait_for_subscriptions(&harness.platform, 1).await;
}

/// Signs in as the default local user and waits for the feed and initial list.
async fn signed_in() -> Harness {
    let harness = start();
    sign_in(&harness).await;
    harness
}

fn local_user() -> Identity {
    Identity::new("local-user")
}

fn add_user(platform: &LocalPlatform, id: &str) {
    platform
        .db
        .connection()
        .execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, 0)",
            params![id],
        )
        .unwrap();
}

/// Writes a row behind the app's back: no change notification is published.
fn insert_row(platform: &LocalPlatform, id: &str, title: &str, url: &str, owner: &str) {
    platform
        .db
        .connection()
        .execute(
            "INSERT INTO bookmarks (id, title, url, user_id, created_at) VALUES (?1, ?2, ?3, ?4, 0)",
            params![id, title, url, owner],
        )
        .unwrap();
}

fn titles(state: &ViewState) -> Vec<&str> {
    state.bookmarks.iter().map(|b| b.title.as_str()).collect()
}

// ─── session ───

#[tokio::test]
async fn test_starts_signed_out_and_empty() {
    let harness = start();
    let state = harness.app.state();
    assert_eq!(state.phase, ViewPhase::SignedOut);
    assert!(state.bookmarks.is_empty());
    assert_eq!(harness.platform.hub.active_subscriptions(), 0);
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_initial_list_loads_existing_rows() {
    let harness = start();
    add_user(&harness.platform, "local-user");
    insert_row(&harness.platform, "b1", "Old", "https://old.io", "local-user");
    add_user(&harness.platform, "someone-else");
    insert_row(&harness.platform, "b2", "Theirs", "https://t.io", "someone-else");

    sign_in(&harness).await;
    let state = harness.app.state();
    assert_eq!(state.identity, Some(local_user()));
    assert_eq!(titles(&state), vec!["Old"]);
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_sign_out_empties_view_and_releases_feed() {
    let harness = signed_in().await;
    harness.app.add_bookmark("A", "a.io").await.unwrap();

    harness.app.sign_out().await;
    let state = wait(&harness.app, |s| s.phase == ViewPhase::SignedOut).await;
    assert!(state.bookmarks.is_empty());
    assert_eq!(state.identity, None);
    wait_for_subscriptions(&harness.platform, 0).await;

    // A straggling notification for the old identity changes nothing.
    harness.platform.hub.publish(RawChange {
        kind: ChangeKind::Insert,
        table: "bookmarks".to_string(),
        new: Some(json!({"id": "late", "title": "Late", "url": "https://l.io", "user_id": "local-user"})),
        old: None,
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.app.state().bookmarks.is_empty());
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_switching_identity_shows_only_new_owner_rows() {
    let harness = signed_in().await;
    harness.app.add_bookmark("Mine", "mine.io").await.unwrap();

    let u2 = harness.app.complete_sign_in("u2").await.unwrap();
    let state = wait(&harness.app, |s| {
        s.identity.as_ref() == Some(&u2) && s.phase == ViewPhase::Ready
    })
    .await;
    assert!(state.bookmarks.is_empty());
    wait_for_subscriptions(&harness.platform, 1).await;

    harness.app.add_bookmark("Theirs", "theirs.io").await.unwrap();
    let state = harness.app.state();
    assert_eq!(titles(&state), vec!["Theirs"]);
    assert!(state.bookmarks.iter().all(|b| b.owner == u2));
    harness.app.shutdown().await;
}

// ─── create ───

#[tokio::test]
async fn test_create_shows_once_despite_feed_echo() {
    let harness = signed_in().await;

    let created = harness.app.add_bookmark("Doc", "docs.example.com").await.unwrap();
    assert_eq!(created.url, "https://docs.example.com");
    assert_eq!(created.owner, local_user());
    let state = harness.app.state();
    assert_eq!(titles(&state), vec!["Doc"]);
    assert!(!state.pending);

    // The echo of the insert is delivered before this update; once the update
    // shows, the echo has been processed.
    harness.platform.store.update_title(&created.id, "Docs").unwrap();
    let state = wait(&harness.app, |s| titles(s) == vec!["Docs"]).await;
    assert_eq!(state.bookmarks.len(), 1);
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_newest_bookmark_is_listed_first() {
    let harness = signed_in().await;
    harness.app.add_bookmark("First", "one.io").await.unwrap();
    harness.app.add_bookmark("Second", "two.io").await.unwrap();
    assert_eq!(titles(&harness.app.state()), vec!["Second", "First"]);
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_local_duplicate_is_refused_with_notice() {
    let mut harness = signed_in().await;
    harness.app.add_bookmark("X", "https://x.com").await.unwrap();
    harness.app.drain_notices();

    let err = harness.app.add_bookmark("X again", "x.com").await.unwrap_err();
    assert!(matches!(err, BookmarkError::Duplicate { remote: false, .. }));

    let notices = harness.app.drain_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);
    assert_eq!(notices[0].message, "This bookmark already exists");
    assert_eq!(harness.platform.store.count_for(&local_user()).unwrap(), 1);
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_remote_duplicate_is_reported() {
    let mut harness = signed_in().await;
    insert_row(&harness.platform, "hidden", "Hidden", "https://x.com", "local-user");

    let err = harness.app.add_bookmark("X", "x.com").await.unwrap_err();
    assert_eq!(
        err,
        BookmarkError::Duplicate {
            url: "https://x.com".to_string(),
            remote: true
        }
    );
    let notices = harness.app.drain_notices();
    assert_eq!(
        notices.last().map(|n| n.message.as_str()),
        Some("This bookmark already exists (duplicate entry)")
    );
    assert!(!harness.app.state().pending);
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_missing_fields_are_rejected() {
    let mut harness = signed_in().await;
    let err = harness.app.add_bookmark("  ", "x.com").await.unwrap_err();
    assert_eq!(err, BookmarkError::Validation(ValidationError::MissingTitle));
    let notices = harness.app.drain_notices();
    assert_eq!(notices[0].message, "Please enter both title and URL");
    assert_eq!(harness.platform.store.count_for(&local_user()).unwrap(), 0);
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_create_while_signed_out_is_refused() {
    let mut harness = start();
    let err = harness.app.add_bookmark("X", "x.com").await.unwrap_err();
    assert_eq!(err, BookmarkError::NotSignedIn);
    let notices = harness.app.drain_notices();
    assert_eq!(notices[0].message, "User not logged in");
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_submitted_form_is_cleared() {
    let harness = signed_in().await;
    harness
        .app
        .set_form(Some("Form".to_string()), Some("form.io".to_string()))
        .await;
    wait(&harness.app, |s| s.form.title == "Form" && s.form.url == "form.io").await;

    let created = harness.app.submit_form().await.unwrap();
    assert_eq!(created.url, "https://form.io");
    let state = harness.app.state();
    assert!(state.form.title.is_empty());
    assert!(state.form.url.is_empty());
    assert_eq!(titles(&state), vec!["Form"]);
    harness.app.shutdown().await;
}

// ─── delete ───

#[tokio::test]
async fn test_declined_delete_changes_nothing() {
    let harness = signed_in().await;
    let created = harness.app.add_bookmark("Keep", "keep.io").await.unwrap();

    let outcome = harness.app.delete_bookmark(&created.id, false).await.unwrap();
    assert_eq!(outcome, DeleteOutcome::Declined);
    assert_eq!(titles(&harness.app.state()), vec!["Keep"]);
    assert_eq!(harness.platform.store.count_for(&local_user()).unwrap(), 1);
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_confirmed_delete_removes_immediately() {
    let harness = signed_in().await;
    let keep = harness.app.add_bookmark("Keep", "keep.io").await.unwrap();
    let gone = harness.app.add_bookmark("Gone", "gone.io").await.unwrap();

    let outcome = harness.app.delete_bookmark(&gone.id, true).await.unwrap();
    assert_eq!(outcome, DeleteOutcome::Deleted);
    let state = harness.app.state();
    assert_eq!(state.bookmarks.len(), 1);
    assert_eq!(state.bookmarks[0].id, keep.id);
    assert_eq!(harness.platform.store.count_for(&local_user()).unwrap(), 1);
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_delete_while_signed_out_is_refused() {
    let mut harness = start();
    let err = harness
        .app
        .delete_bookmark(&BookmarkId::new("b1"), true)
        .await
        .unwrap_err();
    assert_eq!(err, BookmarkError::NotSignedIn);
    assert_eq!(harness.app.drain_notices()[0].message, "User not logged in");
    harness.app.shutdown().await;
}

// ─── changes from elsewhere ───

#[tokio::test]
async fn test_rename_from_another_device_is_applied() {
    let harness = signed_in().await;
    let created = harness.app.add_bookmark("Before", "b.io").await.unwrap();

    assert!(harness.platform.store.update_title(&created.id, "After").unwrap());
    let state = wait(&harness.app, |s| titles(s) == vec!["After"]).await;
    assert_eq!(state.bookmarks[0].url, "https://b.io");
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_delete_from_another_device_is_applied() {
    let harness = signed_in().await;
    let created = harness.app.add_bookmark("Doomed", "d.io").await.unwrap();

    harness.platform.hub.publish(RawChange {
        kind: ChangeKind::Delete,
        table: "bookmarks".to_string(),
        new: None,
        old: Some(json!({"id": created.id.as_str(), "user_id": "local-user"})),
    });
    wait(&harness.app, |s| s.bookmarks.is_empty()).await;
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_insert_from_another_device_is_prepended() {
    let harness = signed_in().await;
    harness.app.add_bookmark("Here", "here.io").await.unwrap();

    harness.platform.hub.publish(RawChange {
        kind: ChangeKind::Insert,
        table: "bookmarks".to_string(),
        new: Some(json!({"id": "remote-1", "title": "There", "url": "https://there.io", "user_id": "local-user"})),
        old: None,
    });
    wait(&harness.app, |s| titles(s) == vec!["There", "Here"]).await;
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_refresh_picks_up_silent_rows() {
    let harness = signed_in().await;
    insert_row(&harness.platform, "quiet", "Quiet", "https://q.io", "local-user");
    assert!(harness.app.state().bookmarks.is_empty());

    harness.app.refresh().await.unwrap();
    assert_eq!(titles(&harness.app.state()), vec!["Quiet"]);
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_refresh_while_signed_out_is_refused() {
    let harness = start();
    assert_eq!(harness.app.refresh().await, Err(BookmarkError::NotSignedIn));
    harness.app.shutdown().await;
}

#[tokio::test]
async fn test_refresh_keeps_a_create_made_while_it_ran() {
    let harness = signed_in().await;
    insert_row(&harness.platform, "quiet", "Quiet", "https://q.io", "local-user");

    let (refreshed, created) = tokio::join!(
        harness.app.refresh(),
        harness.app.add_bookmark("Fresh", "fresh.io"),
    );
    refreshed.unwrap();
    created.unwrap();

    let state = harness.app.state();
    assert!(titles(&state).contains(&"Fresh"));
    assert!(titles(&state).contains(&"Quiet"));
    assert_eq!(state.bookmarks.len(), 2);
    harness.app.shutdown().await;
}

// ─── failures ───

/// Store whose insert panics mid-call.
struct PanickingStore;

impl BookmarkStore for PanickingStore {
    async fn select_by_owner(&self, _owner: &Identity) -> Result<Vec<Value>, StoreError> {
        Ok(Vec::new())
    }

    async fn insert(&self, _draft: &NewBookmark) -> Result<Value, StoreError> {
        panic!("store exploded")
    }

    async fn delete_by_id(&self, _id: &BookmarkId) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_panicking_store_leaves_view_usable() {
    let config = AppConfig::default();
    let platform = LocalPlatform::open(&config).unwrap();
    let mut app = App::start(
        config,
        Arc::clone(&platform.provider),
        PanickingStore,
        platform.hub.clone(),
    );
    app.sign_in().await.unwrap();
    wait(&app, |s| s.phase == ViewPhase::Ready).await;

    let err = app.add_bookmark("Boom", "boom.io").await.unwrap_err();
    assert!(matches!(err, BookmarkError::Unexpected(_)));

    let state = app.state();
    assert_eq!(state.phase, ViewPhase::Ready);
    assert!(!state.pending);
    assert!(state.bookmarks.is_empty());
    let notices = app.drain_notices();
    assert_eq!(
        notices.last().map(|n| n.message.as_str()),
        Some("An unexpected error occurred")
    );

    // The loop survived the panic and still answers.
    assert_eq!(
        app.delete_bookmark(&BookmarkId::new("nope"), true).await,
        Ok(DeleteOutcome::Deleted)
    );
    app.shutdown().await;
}

/// Refuses subscriptions while `failures` is non-zero, then defers to the hub.
#[derive(Clone)]
struct FailingTransport {
    hub: LocalChangeHub,
    failures: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl FeedTransport for FailingTransport {
    async fn subscribe(&self, filter: &FeedFilter) -> Result<Subscription, FeedError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(FeedError::Connect("boom".to_string()));
        }
        self.hub.subscribe(filter).await
    }
}

async fn collect_notices_until(app: &mut LocalApp, seen: &mut Vec<Notice>, message: &str) {
    for _ in 0..200 {
        seen.extend(app.drain_notices());
        if seen.iter().any(|n| n.message == message) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("notice {:?} never arrived; saw {:?}", message, seen);
}

#[tokio::test]
async fn test_lost_feed_is_reported_and_recovered() {
    let config = AppConfig {
        feed_retry_initial_ms: 5,
        feed_retry_max_secs: 1,
        ..AppConfig::default()
    };
    let platform = LocalPlatform::open(&config).unwrap();
    let transport = FailingTransport {
        hub: platform.hub.clone(),
        failures: Arc::new(AtomicUsize::new(usize::MAX)),
        attempts: Arc::new(AtomicUsize::new(0)),
    };
    let mut app = App::start(
        config,
        Arc::clone(&platform.provider),
        platform.store.clone(),
        transport.clone(),
    );
    let mut seen = Vec::new();

    app.sign_in().await.unwrap();
    wait(&app, |s| s.phase == ViewPhase::Ready).await;
    collect_notices_until(
        &mut app,
        &mut seen,
        "Live updates interrupted: Feed connection failed: boom",
    )
    .await;
    assert_eq!(seen.last().map(|n| n.level), Some(NoticeLevel::Error));

    // Retries keep failing without repeating the notice.
    while transport.attempts.load(Ordering::SeqCst) < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    seen.extend(app.drain_notices());
    assert_eq!(
        seen.iter().filter(|n| n.message.starts_with("Live updates interrupted")).count(),
        1
    );

    // A row written during the outage shows up once the feed is back.
    insert_row(&platform, "missed", "Missed", "https://missed.io", "local-user");
    transport.failures.store(0, Ordering::SeqCst);
    collect_notices_until(&mut app, &mut seen, "Live updates restored").await;
    wait_for_subscriptions(&platform, 1).await;
    wait(&app, |s| titles(s) == vec!["Missed"]).await;

    platform.hub.publish(RawChange {
        kind: ChangeKind::Insert,
        table: "bookmarks".to_string(),
        new: Some(json!({"id": "live-1", "title": "Live", "url": "https://live.io", "user_id": "local-user"})),
        old: None,
    });
    wait(&app, |s| titles(s) == vec!["Live", "Missed"]).await;
    app.shutdown().await;
}
