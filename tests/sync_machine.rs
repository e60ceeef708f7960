//! Drive sync state machine against fake Drive, model, sink and store.

mod common;

use common::*;
use event_harvest::drive::{
    Change, ChangePage, DOCX_MIME, GOOGLE_DOC_MIME, GOOGLE_SHEET_MIME, XLSX_MIME,
};
use event_harvest::state::{DriveSyncState, StateStore};
use event_harvest::sync::{SyncMode, SyncOutcome, WebhookHeaders};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;

fn completed(outcome: SyncOutcome) -> event_harvest::state::RunSummary {
    match outcome {
        SyncOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {:?}", other),
    }
}

fn webhook(token: Option<&str>, state: Option<&str>) -> WebhookHeaders {
    WebhookHeaders {
        channel_id: Some("chan".into()),
        channel_token: token.map(str::to_string),
        resource_state: state.map(str::to_string),
        message_number: Some("7".into()),
    }
}

// ─── Polling mode ───────────────────────────────────────────────────

#[tokio::test]
async fn unchanged_folder_is_a_noop_on_the_second_run() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), false, FakeModel::default()).await;
    assert_eq!(h.sync.mode(), SyncMode::Polling);
    h.drive.add_file(
        "f1",
        "support_tickets.csv",
        "text/csv",
        "2026-03-01T10:00:00Z",
        tickets_csv(),
    );

    let first = completed(h.sync.process_pending_changes("manual").await.unwrap());
    assert_eq!(first.detected, 1);
    assert_eq!(first.processed, 1);
    assert_eq!(first.event_count, 4);
    assert_eq!(first.pushed, 4);
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 1);
    let sink_calls = h.sink.calls.load(Ordering::SeqCst);

    let second = completed(h.sync.process_pending_changes("manual").await.unwrap());
    assert_eq!(second.processed, 0);
    assert_eq!(second.pushed, 0);
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 1, "no LLM call on a no-op sync");
    assert_eq!(h.sink.calls.load(Ordering::SeqCst), sink_calls);

    let state = h.store.snapshot();
    assert_eq!(state.last_result.unwrap().processed, 0);
    assert!(state.last_error.is_none());
    let tracked = &state.files["f1"];
    assert_eq!(tracked.domain, "support");
    assert_eq!(tracked.file_type, "csv");
    assert!(tracked.local_path.ends_with("f1_support_tickets.csv"));
}

#[tokio::test]
async fn empty_folder_never_calls_the_model() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), false, FakeModel::default()).await;
    for _ in 0..2 {
        let summary = completed(h.sync.process_pending_changes("poll").await.unwrap());
        assert_eq!(summary.processed, 0);
    }
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.sink.calls.load(Ordering::SeqCst), 0);
    assert!(h.store.snapshot().last_success_at.is_some());
}

#[tokio::test]
async fn newer_modified_time_is_reprocessed() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), false, FakeModel::default()).await;
    h.drive.add_file("f1", "budget.csv", "text/csv", "2026-03-01T10:00:00Z", tickets_csv());
    h.drive.add_file("f2", "infra.csv", "text/csv", "2026-03-01T10:00:00Z", tickets_csv());
    completed(h.sync.process_pending_changes("manual").await.unwrap());

    h.drive.touch("f2", "2026-03-02T08:00:00Z");
    let summary = completed(h.sync.process_pending_changes("manual").await.unwrap());
    assert_eq!(summary.processed, 1);
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 3);

    let state = h.store.snapshot();
    assert_eq!(state.files["f1"].domain, "finance");
    assert_eq!(state.files["f2"].domain, "operations");
    assert_eq!(state.files["f2"].modified_time, "2026-03-02T08:00:00Z");
}

#[tokio::test]
async fn unsupported_and_trashed_files_are_ignored() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), false, FakeModel::default()).await;
    h.drive.add_file("p1", "deck.pptx", "application/vnd.ms-powerpoint", "2026-03-01T10:00:00Z", vec![1]);
    h.drive.add_file("t1", "tickets.csv", "text/csv", "2026-03-01T10:00:00Z", tickets_csv());
    h.drive.files.lock().unwrap().iter_mut().for_each(|f| {
        if f.id == "t1" {
            f.trashed = true;
        }
    });

    let summary = completed(h.sync.process_pending_changes("manual").await.unwrap());
    assert_eq!(summary.detected, 0);
    assert!(h.drive.downloads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn native_documents_are_exported_to_docx() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), false, FakeModel::default()).await;
    h.drive.add_file(
        "d1",
        "Customer escalations",
        GOOGLE_DOC_MIME,
        "2026-03-01T10:00:00Z",
        docx(&["Escalation review", "Checkout failures doubled on Friday."]),
    );

    let summary = completed(h.sync.process_pending_changes("manual").await.unwrap());
    assert_eq!(summary.processed, 1);
    assert_eq!(
        h.drive.exports.lock().unwrap().clone(),
        vec![("d1".to_string(), DOCX_MIME.to_string())]
    );
    let state = h.store.snapshot();
    assert_eq!(state.files["d1"].file_type, "docx");
    assert_eq!(state.files["d1"].domain, "support");
    assert!(state.files["d1"].local_path.ends_with("Customer escalations.docx"));
}

#[tokio::test]
async fn native_sheets_are_exported_to_xlsx_and_digested() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), false, FakeModel::default()).await;
    h.drive.add_file(
        "s1",
        "Q1 budget",
        GOOGLE_SHEET_MIME,
        "2026-03-01T10:00:00Z",
        xlsx(&[
            &["month", "cost_center", "amount"],
            &["2026-01", "travel", "100"],
            &["2026-02", "travel", "110"],
            &["2026-03", "travel", "95"],
            &["2026-04", "travel", "105"],
            &["2026-05", "travel", "980"],
            &["2026-06", "travel", "100"],
        ]),
    );

    let summary = completed(h.sync.process_pending_changes("manual").await.unwrap());
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.event_count, 4);
    assert_eq!(
        h.drive.exports.lock().unwrap().clone(),
        vec![("s1".to_string(), XLSX_MIME.to_string())]
    );

    let prompts = h.model.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    let prompt: serde_json::Value = serde_json::from_str(&prompts[0]).unwrap();
    assert_eq!(prompt["source_key"], "drive_q1_budget");
    assert_eq!(prompt["expected_domain"], "finance");
    let digest = &prompt["evidence_digest"];
    assert_eq!(digest["type"], "tabular_dataset_facts_sheet");
    assert_eq!(digest["row_count"], 6);
    assert!(
        digest["facts_sheet"]
            .as_str()
            .unwrap()
            .contains("- spike row=5 ts=2026-05"),
        "digest: {}",
        digest
    );

    let state = h.store.snapshot();
    assert_eq!(state.files["s1"].file_type, "xlsx");
    assert!(state.files["s1"].local_path.ends_with("Q1 budget.xlsx"));
    assert_eq!(h.sink.rows.lock().unwrap().len(), 4);
}

// ─── Guard and failures ─────────────────────────────────────────────

#[tokio::test]
async fn concurrent_trigger_is_skipped_without_touching_state() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), false, FakeModel::gated()).await;
    h.drive.add_file("f1", "tickets.csv", "text/csv", "2026-03-01T10:00:00Z", tickets_csv());

    let sync = h.sync.clone();
    let first = tokio::spawn(async move { sync.process_pending_changes("manual").await });

    // Wait until the first run is parked inside the model call.
    for _ in 0..200 {
        if h.model.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.sync.is_running());

    let saves_before = h.store.save_count();
    let state_before = h.sync.status().await.state;
    let second = h.sync.process_pending_changes("webhook").await.unwrap();
    assert_eq!(
        serde_json::to_value(&second).unwrap(),
        serde_json::json!({ "skipped": true, "reason": "sync_in_progress" })
    );
    assert_eq!(h.store.save_count(), saves_before);
    assert_eq!(h.sync.status().await.state, state_before);

    h.model.release();
    let summary = completed(first.await.unwrap().unwrap());
    assert_eq!(summary.processed, 1);
    assert!(!h.sync.is_running());
}

#[tokio::test]
async fn failed_run_records_error_and_keeps_watermarks() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), false, FakeModel::default()).await;
    h.drive.add_file("f1", "tickets.csv", "text/csv", "2026-03-01T10:00:00Z", tickets_csv());
    h.model.fail.store(true, Ordering::SeqCst);

    let err = h.sync.process_pending_changes("manual").await.unwrap_err();
    assert!(format!("{:#}", err).contains("model unavailable"));
    assert!(!h.sync.is_running(), "guard released after an error");

    let state = h.store.snapshot();
    assert!(state.last_error.as_deref().unwrap().contains("model unavailable"));
    assert!(state.files.is_empty(), "watermark not committed");
    assert!(state.last_run_at.is_some());

    h.model.fail.store(false, Ordering::SeqCst);
    let summary = completed(h.sync.process_pending_changes("manual").await.unwrap());
    assert_eq!(summary.processed, 1);
    assert!(h.store.snapshot().last_error.is_none());
}

// ─── Watch mode ─────────────────────────────────────────────────────

#[tokio::test]
async fn watch_mode_bootstraps_then_follows_the_feed() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), true, FakeModel::default()).await;
    assert_eq!(h.sync.mode(), SyncMode::Watch);
    h.drive.add_file("f1", "tickets.csv", "text/csv", "2026-03-01T10:00:00Z", tickets_csv());

    // No page token yet: full listing once, start token committed.
    let first = completed(h.sync.process_pending_changes("manual").await.unwrap());
    assert_eq!(first.processed, 1);
    assert_eq!(h.store.snapshot().page_token.as_deref(), Some("100"));

    let mut outside = drive_file("x1", "other.csv", "text/csv", "2026-03-02T00:00:00Z");
    outside.parents = vec!["elsewhere".into()];
    let mut trashed = drive_file("t1", "old.csv", "text/csv", "2026-03-02T00:00:00Z");
    trashed.trashed = true;
    let updated = drive_file("f1", "tickets.csv", "text/csv", "2026-03-02T00:00:00Z");
    let change = |file: Option<event_harvest::drive::DriveFile>, removed: bool| Change {
        file_id: file.as_ref().map(|f| f.id.clone()),
        removed,
        file,
    };
    h.drive.pages.lock().unwrap().insert(
        "100".into(),
        ChangePage {
            changes: vec![change(Some(outside), false), change(Some(trashed), false)],
            next_page_token: Some("100b".into()),
            new_start_page_token: None,
        },
    );
    h.drive.pages.lock().unwrap().insert(
        "100b".into(),
        ChangePage {
            changes: vec![change(None, true), change(Some(updated), false)],
            next_page_token: None,
            new_start_page_token: Some("101".into()),
        },
    );

    let second = completed(h.sync.process_pending_changes("webhook:change").await.unwrap());
    assert_eq!(second.processed, 1);
    assert_eq!(h.store.snapshot().page_token.as_deref(), Some("101"));
    assert_eq!(h.drive.list_calls.load(Ordering::SeqCst), 1, "feed used, not listing");

    // Token 101 has no changes.
    let third = completed(h.sync.process_pending_changes("webhook:change").await.unwrap());
    assert_eq!(third.processed, 0);
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_watch_run_does_not_advance_the_page_token() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), true, FakeModel::default()).await;
    completed(h.sync.process_pending_changes("manual").await.unwrap());
    assert_eq!(h.store.snapshot().page_token.as_deref(), Some("100"));

    h.drive.add_file("f1", "tickets.csv", "text/csv", "2026-03-01T10:00:00Z", tickets_csv());
    h.drive.pages.lock().unwrap().insert(
        "100".into(),
        ChangePage {
            changes: vec![Change {
                file_id: Some("f1".into()),
                removed: false,
                file: Some(drive_file("f1", "tickets.csv", "text/csv", "2026-03-01T10:00:00Z")),
            }],
            next_page_token: None,
            new_start_page_token: Some("101".into()),
        },
    );
    h.model.fail.store(true, Ordering::SeqCst);
    assert!(h.sync.process_pending_changes("webhook:change").await.is_err());
    assert_eq!(h.store.snapshot().page_token.as_deref(), Some("100"));
}

#[tokio::test]
async fn watch_channel_is_created_reused_and_forced() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), true, FakeModel::default()).await;

    let first = h.sync.ensure_watch_channel(false).await.unwrap().unwrap();
    assert_eq!(
        h.drive.watches.lock().unwrap().clone(),
        vec!["100".to_string()],
        "fresh start token used while no watermark exists"
    );
    assert!(h.store.snapshot().page_token.is_none(), "bootstrap listing still pending");

    let again = h.sync.ensure_watch_channel(false).await.unwrap().unwrap();
    assert_eq!(again.id, first.id);

    let forced = h.sync.ensure_watch_channel(true).await.unwrap().unwrap();
    assert_ne!(forced.id, first.id);
    assert_eq!(h.store.snapshot().watch_channel.unwrap().id, forced.id);
}

#[tokio::test]
async fn polling_mode_has_no_watch_channel() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), false, FakeModel::default()).await;
    assert!(h.sync.ensure_watch_channel(true).await.unwrap().is_none());
    assert!(h.drive.watches.lock().unwrap().is_empty());
}

// ─── Webhook ────────────────────────────────────────────────────────

#[tokio::test]
async fn webhook_ignores_malformed_calls() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), true, FakeModel::default()).await;
    h.drive.add_file("f1", "tickets.csv", "text/csv", "2026-03-01T10:00:00Z", tickets_csv());

    let missing = h.sync.handle_webhook(&webhook(Some(CHANNEL_TOKEN), None)).await;
    assert_eq!(
        missing,
        serde_json::json!({ "ok": false, "ignored": true, "reason": "missing_resource_state" })
    );

    let bad_token = h.sync.handle_webhook(&webhook(Some("nope"), Some("change"))).await;
    assert_eq!(bad_token["reason"], "invalid_channel_token");
    let no_token = h.sync.handle_webhook(&webhook(None, Some("change"))).await;
    assert_eq!(no_token["reason"], "invalid_channel_token");

    let handshake = h.sync.handle_webhook(&webhook(Some(CHANNEL_TOKEN), Some("sync"))).await;
    assert_eq!(handshake["reason"], "sync_handshake");

    assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
    assert!(h.store.snapshot().last_run_at.is_none(), "no run was started");
}

#[tokio::test]
async fn webhook_change_runs_a_sync_and_reports_errors_softly() {
    let tmp = TempDir::new().unwrap();
    let h = harness(tmp.path(), true, FakeModel::default()).await;
    h.drive.add_file("f1", "tickets.csv", "text/csv", "2026-03-01T10:00:00Z", tickets_csv());

    let ok = h.sync.handle_webhook(&webhook(Some(CHANNEL_TOKEN), Some("change"))).await;
    assert_eq!(ok["ok"], true);
    assert_eq!(ok["result"]["processed"], 1);
    assert_eq!(ok["result"]["reason"], "webhook:change");

    h.drive.touch("f1", "2026-03-05T00:00:00Z");
    h.drive.pages.lock().unwrap().insert(
        "100".into(),
        ChangePage {
            changes: vec![Change {
                file_id: Some("f1".into()),
                removed: false,
                file: Some(drive_file("f1", "tickets.csv", "text/csv", "2026-03-05T00:00:00Z")),
            }],
            next_page_token: None,
            new_start_page_token: Some("101".into()),
        },
    );
    h.model.fail.store(true, Ordering::SeqCst);
    let failed = h.sync.handle_webhook(&webhook(Some(CHANNEL_TOKEN), Some("update"))).await;
    assert_eq!(failed["ok"], false);
    assert!(failed["error"].as_str().unwrap().contains("model unavailable"));
}

// ─── Persistence ────────────────────────────────────────────────────

#[tokio::test]
async fn state_survives_a_restart_through_the_file_store() {
    use event_harvest::state::JsonFileStore;
    use event_harvest::sync::DriveSync;
    use std::sync::Arc;

    let tmp = TempDir::new().unwrap();
    let settings = settings(tmp.path(), false, None);
    let state_path = settings.drive.state_path();
    let drive = Arc::new(FakeDrive::default());
    drive.add_file("f1", "tickets.csv", "text/csv", "2026-03-01T10:00:00Z", tickets_csv());
    let model = Arc::new(FakeModel::default());
    let sink = Arc::new(FakeSink::default());

    let first = DriveSync::new(
        settings.clone(),
        drive.clone(),
        model.clone(),
        sink.clone(),
        Arc::new(JsonFileStore::new(&state_path)),
    )
    .await
    .unwrap();
    completed(first.process_pending_changes("manual").await.unwrap());
    drop(first);

    let store = JsonFileStore::new(&state_path);
    let persisted: DriveSyncState = store.load_state().await.unwrap();
    assert!(persisted.files.contains_key("f1"));

    let restarted = DriveSync::new(settings, drive, model.clone(), sink, Arc::new(store))
        .await
        .unwrap();
    let summary = completed(restarted.process_pending_changes("manual").await.unwrap());
    assert_eq!(summary.processed, 0);
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}
