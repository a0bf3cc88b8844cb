//! Session lifecycle tests over the in-memory store.

mod common;

use serp_collector::model::{
    DelayRange, Engine, EngineConfig, SessionSettings, SessionStatus, TaskStatus,
};
use serp_collector::session::{
    add_items_logic, create_session_logic, delete_session_logic, remove_config_logic,
    remove_task_logic, start_session_logic, update_delay_logic, update_quota_logic,
    CreateSessionRequest,
};
use serp_collector::store::Store;

use common::{google_config, harness};

fn bing_config() -> EngineConfig {
    EngineConfig {
        engine: Engine::Bing,
        country: "de".to_string(),
        language: "de".to_string(),
        domain: "www.bing.com".to_string(),
        location: None,
    }
}

fn request(queries: Vec<&str>, configs: Vec<EngineConfig>, quota: u32) -> CreateSessionRequest {
    CreateSessionRequest {
        queries: queries.into_iter().map(String::from).collect(),
        configs,
        quota,
        delay: DelayRange::default(),
        settings: SessionSettings::default(),
    }
}

#[tokio::test]
async fn test_create_validates_and_builds_cross_product() {
    let h = harness(vec![]);

    assert!(create_session_logic(&h.state, request(vec![], vec![google_config()], 10))
        .await
        .is_err());
    assert!(create_session_logic(&h.state, request(vec!["rust"], vec![], 10)).await.is_err());
    assert!(create_session_logic(&h.state, request(vec!["rust"], vec![google_config()], 0))
        .await
        .is_err());

    let mut inverted = request(vec!["rust"], vec![google_config()], 10);
    inverted.delay = DelayRange { min_ms: 500, max_ms: 100 };
    assert!(create_session_logic(&h.state, inverted).await.is_err());

    let session = create_session_logic(
        &h.state,
        request(vec!["rust", "tokio"], vec![google_config(), bing_config()], 10),
    )
    .await
    .unwrap();

    assert_eq!(session.status, SessionStatus::Open);
    assert_eq!(session.tasks.len(), 4);
    assert!(h.state.store.get_session(&session.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_start_transitions_and_rejects_double_start() {
    let mut h = harness(vec![]);
    let session =
        create_session_logic(&h.state, request(vec!["rust"], vec![google_config()], 10))
            .await
            .unwrap();

    start_session_logic(&h.state, &session.id).await.unwrap();
    let stored = h.state.store.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Running);
    assert_eq!(h.advance_rx.recv().await.as_deref(), Some(session.id.as_str()));

    assert!(start_session_logic(&h.state, &session.id).await.is_err());
    assert!(start_session_logic(&h.state, "no-such-session").await.is_err());
}

#[tokio::test]
async fn test_remove_config_cancels_only_unsettled_matching_tasks() {
    let h = harness(vec![]);
    let mut session = create_session_logic(
        &h.state,
        request(vec!["rust", "tokio"], vec![google_config(), bing_config()], 10),
    )
    .await
    .unwrap();

    // rust×google already finished, tokio×google failed once permanently.
    session.tasks[0].status = TaskStatus::Done;
    session.tasks[2].status = TaskStatus::Failed;
    h.state.store.put_session(&session).await.unwrap();

    let updated = remove_config_logic(&h.state, &session.id, google_config()).await.unwrap();

    // DONE survives with its data, OPEN and FAILED become CANCELLED, the
    // other config's tasks are untouched.
    assert_eq!(updated.tasks[0].status, TaskStatus::Done);
    assert_eq!(updated.tasks[2].status, TaskStatus::Cancelled);
    assert!(updated
        .tasks
        .iter()
        .filter(|t| t.config == bing_config())
        .all(|t| t.status == TaskStatus::Open));
    assert_eq!(updated.configs, vec![bing_config()]);
}

#[tokio::test]
async fn test_remove_task_refuses_completed_tasks() {
    let h = harness(vec![]);
    let mut session = create_session_logic(
        &h.state,
        request(vec!["rust", "tokio"], vec![google_config()], 10),
    )
    .await
    .unwrap();

    session.tasks[0].status = TaskStatus::Done;
    h.state.store.put_session(&session).await.unwrap();

    assert!(remove_task_logic(&h.state, &session.id, 0).await.is_err());
    assert!(remove_task_logic(&h.state, &session.id, 99).await.is_err());

    let updated = remove_task_logic(&h.state, &session.id, 1).await.unwrap();
    assert_eq!(updated.tasks[1].status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_add_items_revives_a_done_session() {
    let h = harness(vec![]);
    let mut session =
        create_session_logic(&h.state, request(vec!["rust"], vec![google_config()], 10))
            .await
            .unwrap();

    session.tasks[0].status = TaskStatus::Done;
    session.status = SessionStatus::Done;
    h.state.store.put_session(&session).await.unwrap();

    let updated =
        add_items_logic(&h.state, &session.id, vec!["tokio".to_string()], vec![]).await.unwrap();
    assert_eq!(updated.status, SessionStatus::Open);
    assert_eq!(updated.tasks.len(), 2);
    assert_eq!(updated.tasks[1].status, TaskStatus::Open);

    assert!(add_items_logic(&h.state, &session.id, vec![], vec![]).await.is_err());
}

#[tokio::test]
async fn test_setting_updates_validate_and_persist() {
    let h = harness(vec![]);
    let session =
        create_session_logic(&h.state, request(vec!["rust"], vec![google_config()], 10))
            .await
            .unwrap();

    assert!(update_quota_logic(&h.state, &session.id, 0).await.is_err());
    let updated = update_quota_logic(&h.state, &session.id, 50).await.unwrap();
    assert_eq!(updated.quota, 50);

    assert!(update_delay_logic(&h.state, &session.id, DelayRange { min_ms: 10, max_ms: 5 })
        .await
        .is_err());
    let updated =
        update_delay_logic(&h.state, &session.id, DelayRange { min_ms: 1000, max_ms: 2000 })
            .await
            .unwrap();
    assert_eq!(updated.delay.min_ms, 1000);

    let stored = h.state.store.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.quota, 50);
    assert_eq!(stored.delay.max_ms, 2000);
}

#[tokio::test]
async fn test_delete_removes_session_and_its_state() {
    let h = harness(vec![]);
    let session =
        create_session_logic(&h.state, request(vec!["rust"], vec![google_config()], 10))
            .await
            .unwrap();

    delete_session_logic(&h.state, &session.id).await.unwrap();
    assert!(h.state.store.get_session(&session.id).await.unwrap().is_none());
    assert!(h.state.store.list_logs(&session.id).await.unwrap().is_empty());
}
