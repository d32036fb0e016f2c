//! Integration tests for the task store.
//!
//! Each test creates a unique temporary database, runs migrations, and drops
//! it on completion so tests are fully isolated.

use chrono::Utc;
use serde_json::json;

use foreman_db::models::{TaskState, TaskType};
use foreman_db::queries::tasks;
use foreman_test_utils::test_db;

#[tokio::test]
async fn insert_assigns_defaults() {
    let db = test_db().await;

    let task = tasks::insert_task(
        &db.pool,
        TaskType::CreateDatabase,
        7,
        21,
        &json!({"name": "analytics"}),
    )
    .await
    .expect("insert_task should succeed");

    assert!(task.id > 0);
    assert_eq!(task.task_type, TaskType::CreateDatabase);
    assert_eq!(task.developer_id, 7);
    assert_eq!(task.account_id, 21);
    assert_eq!(task.state, TaskState::Waiting);
    assert_eq!(task.args, json!({"name": "analytics"}));
    assert!(task.result.is_none());
    assert!(task.finished_at.is_none());

    db.teardown().await;
}

#[tokio::test]
async fn ids_are_monotone() {
    let db = test_db().await;

    let first = tasks::insert_task(&db.pool, TaskType::TopUp, 1, 1, &json!({}))
        .await
        .unwrap();
    let second = tasks::insert_task(&db.pool, TaskType::Withdraw, 1, 1, &json!({}))
        .await
        .unwrap();

    assert!(second.id > first.id);

    db.teardown().await;
}

#[tokio::test]
async fn update_roundtrips_mutable_fields() {
    let db = test_db().await;

    let mut task = tasks::insert_task(&db.pool, TaskType::DropDatabase, 2, 4, &json!({}))
        .await
        .unwrap();

    let now = Utc::now();
    task.state = TaskState::Failed;
    task.result = Some(json!({"error": "boom", "result": null}));
    task.updated_at = now;
    task.finished_at = Some(now);

    tasks::update_task(&db.pool, &task)
        .await
        .expect("update_task should succeed");

    let fetched = tasks::get_task(&db.pool, task.id)
        .await
        .unwrap()
        .expect("task should exist");
    assert_eq!(fetched.state, TaskState::Failed);
    assert_eq!(fetched.result, Some(json!({"error": "boom", "result": null})));
    assert!(fetched.finished_at.is_some());
    // args are immutable through update_task
    assert_eq!(fetched.args, json!({}));

    db.teardown().await;
}

#[tokio::test]
async fn update_missing_task_errors() {
    let db = test_db().await;

    let mut task = tasks::insert_task(&db.pool, TaskType::TopUp, 1, 1, &json!({}))
        .await
        .unwrap();
    task.id = 999_999;

    let result = tasks::update_task(&db.pool, &task).await;
    assert!(result.is_err(), "updating a missing id should fail");

    db.teardown().await;
}

#[tokio::test]
async fn list_incomplete_filters_terminal_states() {
    let db = test_db().await;

    let waiting = tasks::insert_task(&db.pool, TaskType::TopUp, 1, 1, &json!({}))
        .await
        .unwrap();
    let running = tasks::insert_task(&db.pool, TaskType::TopUp, 1, 1, &json!({}))
        .await
        .unwrap();
    let done = tasks::insert_task(&db.pool, TaskType::TopUp, 1, 1, &json!({}))
        .await
        .unwrap();

    tasks::set_task_state(&db.pool, running.id, TaskState::Running)
        .await
        .unwrap();
    tasks::set_task_state(&db.pool, done.id, TaskState::Success)
        .await
        .unwrap();

    let incomplete = tasks::list_incomplete_tasks(&db.pool, 10).await.unwrap();
    let ids: Vec<i64> = incomplete.iter().map(|t| t.id).collect();

    assert!(ids.contains(&waiting.id));
    assert!(ids.contains(&running.id));
    assert!(!ids.contains(&done.id));

    db.teardown().await;
}

#[tokio::test]
async fn list_incomplete_is_oldest_first_and_limited() {
    let db = test_db().await;

    let mut inserted = Vec::new();
    for _ in 0..5 {
        let t = tasks::insert_task(&db.pool, TaskType::TopUp, 1, 1, &json!({}))
            .await
            .unwrap();
        inserted.push(t.id);
    }

    let scanned = tasks::list_incomplete_tasks(&db.pool, 3).await.unwrap();
    assert_eq!(scanned.len(), 3);
    // Oldest first: creation order is insertion order here.
    assert_eq!(scanned[0].id, inserted[0]);
    assert_eq!(scanned[1].id, inserted[1]);
    assert_eq!(scanned[2].id, inserted[2]);

    db.teardown().await;
}

#[tokio::test]
async fn count_tasks_groups_by_state() {
    let db = test_db().await;

    let a = tasks::insert_task(&db.pool, TaskType::TopUp, 1, 1, &json!({}))
        .await
        .unwrap();
    let _b = tasks::insert_task(&db.pool, TaskType::TopUp, 1, 1, &json!({}))
        .await
        .unwrap();
    tasks::set_task_state(&db.pool, a.id, TaskState::Failed)
        .await
        .unwrap();

    let counts = tasks::count_tasks_by_state(&db.pool).await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.total, 2);

    db.teardown().await;
}
