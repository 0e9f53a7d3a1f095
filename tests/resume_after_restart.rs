//! Pause, restart and resume against a file-backed store
//!
//! Each "process" gets its own store handle, scheduler and client; only the
//! SQLite file carries over.

mod common;

use common::{entry_json, fast_config, harness, items};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use worldbook::pipeline::{event_channel, fingerprint, ItemStatus, PipelineEvent};
use worldbook::{
    HistoryPolicy, OpenStore, PipelineContext, RunState, ScriptedClient, SqliteStateStore,
    StateStore, Worldbook,
};

const INPUT: &str = "the whole input text";

fn open(path: &Path) -> Arc<dyn StateStore> {
    Arc::new(SqliteStateStore::open(path).unwrap())
}

fn five_items() -> Vec<worldbook::WorkItem> {
    items(&[
        ("c1", "tok-1"),
        ("c2", "tok-2"),
        ("c3", "tok-3"),
        ("c4", "tok-4"),
        ("c5", "tok-5"),
    ])
}

fn numbered_client() -> ScriptedClient {
    let mut client = ScriptedClient::new();
    for i in 1..=5 {
        client = client.with_response(format!("tok-{}", i), entry_json("Chapters", &format!("C{}", i)));
    }
    client
}

#[tokio::test]
async fn paused_run_resumes_in_a_new_process() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let fp = fingerprint(INPUT);

    // First process: pause after the first item completes
    let done_before_restart = {
        let store = open(&db);
        let config = fast_config();
        let mut ctx = PipelineContext::new(five_items(), fp.clone(), store.clone(), config.history.clone());
        let (tx, mut rx) = event_channel();
        let h = harness(numbered_client().with_delay(Duration::from_millis(20)), store, config);
        let mut scheduler = h.scheduler.with_events(tx);

        let handle = scheduler.pause_handle();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let PipelineEvent::ItemCompleted { .. } = event {
                    handle.pause();
                    break;
                }
            }
        });

        let summary = scheduler.run(&mut ctx).await.unwrap();
        assert!(summary.paused);
        assert_eq!(scheduler.state(), RunState::Paused);
        assert!(!ctx.is_complete());
        ctx.counts().done
    };
    assert!(done_before_restart >= 1);

    // Second process: a different input is not offered for resume
    let store = open(&db);
    assert!(PipelineContext::restore(store.clone(), &fingerprint("other text"), HistoryPolicy::default())
        .unwrap()
        .is_none());

    let config = fast_config();
    let mut ctx = PipelineContext::restore(store.clone(), &fp, config.history.clone())
        .unwrap()
        .expect("stored run should match");
    assert_eq!(ctx.cursor(), done_before_restart);
    assert_eq!(ctx.counts().processing, 0);

    let mut h = harness(numbered_client(), store.clone(), config);
    let summary = h.scheduler.resume(&mut ctx).await.unwrap();

    assert!(ctx.is_complete());
    assert_eq!(summary.succeeded, 5 - done_before_restart);
    // Done items were never sent again
    for i in 1..=done_before_restart {
        assert_eq!(h.client.calls_for(&format!("tok-{}", i)), 0);
    }
    assert_eq!(ctx.worldbook().entry_count(), 5);
    assert_eq!(h.store.list_history().unwrap().len(), 5);
}

#[tokio::test]
async fn resume_runs_only_items_from_cursor_that_are_not_done() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let fp = fingerprint(INPUT);

    {
        let store = open(&db);
        let mut state = worldbook::PersistedRunState::new(five_items(), Worldbook::new(), fp.clone());
        state.work_items[0].status = ItemStatus::Done;
        state.work_items[0].result = Some(Worldbook::new());
        state.work_items[1].status = ItemStatus::Failed;
        state.work_items[1].failure_reason = Some("rate limited".into());
        state.work_items[2].status = ItemStatus::Processing;
        state.work_items[3].status = ItemStatus::Done;
        state.work_items[3].result = Some(Worldbook::new());
        store.save_run_state(&state).unwrap();
    }

    let store = open(&db);
    let config = fast_config();
    let mut ctx = PipelineContext::restore(store.clone(), &fp, config.history.clone())
        .unwrap()
        .unwrap();
    assert_eq!(ctx.cursor(), 1);
    assert_eq!(ctx.item(2).unwrap().status, ItemStatus::Pending);

    let mut h = harness(numbered_client(), store, config);
    let summary = h.scheduler.run(&mut ctx).await.unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(h.client.calls_for("tok-1"), 0);
    assert_eq!(h.client.calls_for("tok-2"), 1);
    assert_eq!(h.client.calls_for("tok-3"), 1);
    assert_eq!(h.client.calls_for("tok-4"), 0);
    assert_eq!(h.client.calls_for("tok-5"), 1);
    assert!(ctx.is_complete());
}

#[tokio::test]
async fn rollback_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let fp = fingerprint(INPUT);

    let second_record = {
        let store = open(&db);
        let config = fast_config();
        let mut ctx = PipelineContext::new(five_items(), fp.clone(), store.clone(), config.history.clone());
        let mut h = harness(numbered_client(), store.clone(), config);
        h.scheduler.run(&mut ctx).await.unwrap();
        store.list_history().unwrap()[1].sequence_id
    };

    let store = open(&db);
    let config = fast_config();
    let mut ctx = PipelineContext::restore(store.clone(), &fp, config.history.clone())
        .unwrap()
        .unwrap();
    let mut h = harness(numbered_client(), store.clone(), config.clone());
    let restored = h.scheduler.rollback(&mut ctx, second_record).unwrap();
    assert_eq!(restored.entry_count(), 1);

    // The rolled-back state is what a third process sees
    let store = open(&db);
    let ctx = PipelineContext::restore(store.clone(), &fp, config.history.clone())
        .unwrap()
        .unwrap();
    assert_eq!(ctx.cursor(), 1);
    assert_eq!(ctx.worldbook(), &restored);
    assert_eq!(store.list_history().unwrap().len(), 1);
}
