//! Integration tests for result extraction and idempotent persistence.

use db::{
    DBService,
    models::{
        conversation_result::ConversationResult,
        execution_log::ExecutionLog,
        project::{CreateProject, GitProtocol, Project},
        task::{CreateTask, Task},
        task_conversation::{ConversationStatus, TaskConversation},
    },
};
use services::services::result_parser::ResultParser;
use uuid::Uuid;

async fn conversation_fixture(db: &DBService) -> Uuid {
    let project = Project::create(
        &db.pool,
        &CreateProject {
            name: format!("project-{}", Uuid::new_v4()),
            repo_url: "https://example.com/repo.git".into(),
            protocol: GitProtocol::Https,
            credential_id: None,
        },
    )
    .await
    .unwrap();
    let task = Task::create(
        &db.pool,
        &CreateTask {
            project_id: project.id,
            dev_environment_id: None,
            title: "task".into(),
            start_branch: "main".into(),
        },
    )
    .await
    .unwrap();
    TaskConversation::create(&db.pool, task.id, "prompt")
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn result_is_parsed_from_fresh_log_and_stored_once() {
    let db = DBService::new_in_memory().await.unwrap();
    let conv_id = conversation_fixture(&db).await;
    let log = ExecutionLog::create(&db.pool, conv_id, None).await.unwrap();

    // lines appended after the caller's in-memory copy was loaded
    ExecutionLog::append_log(&db.pool, log.id, "[10:00:00] STDOUT: working\n")
        .await
        .unwrap();
    ExecutionLog::append_log(
        &db.pool,
        log.id,
        "[10:00:05] STDOUT: {\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"session_id\":\"abc\",\"cost_usd\":0.1}\n",
    )
    .await
    .unwrap();

    let parser = ResultParser::new(db.clone());
    parser.parse_and_store_result(conv_id, log.id).await;

    let result = ConversationResult::find_by_conversation_id(&db.pool, conv_id)
        .await
        .unwrap()
        .expect("result row created");
    assert_eq!(result.result_type, "result");
    assert_eq!(result.subtype, "success");
    assert!(!result.is_error);
    assert_eq!(result.session_id, "abc");
    let payload: serde_json::Value = serde_json::from_str(&result.payload).unwrap();
    assert_eq!(payload["cost_usd"], 0.1);

    // a second pass sees the existing row and does not duplicate it
    parser.parse_and_store_result(conv_id, log.id).await;
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM conversation_results WHERE conversation_id = $1")
            .bind(conv_id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn logs_without_result_produce_no_row_and_no_status_change() {
    let db = DBService::new_in_memory().await.unwrap();
    let conv_id = conversation_fixture(&db).await;
    TaskConversation::update_status(&db.pool, conv_id, ConversationStatus::Success)
        .await
        .unwrap();
    let log = ExecutionLog::create(&db.pool, conv_id, None).await.unwrap();
    ExecutionLog::append_log(&db.pool, log.id, "[10:00:00] STDOUT: just text\n")
        .await
        .unwrap();
    ExecutionLog::append_log(&db.pool, log.id, "[10:00:01] STDERR: {\"type\":\"noise\"}\n")
        .await
        .unwrap();

    let parser = ResultParser::new(db.clone());
    parser.parse_and_store_result(conv_id, log.id).await;

    assert!(!ConversationResult::exists_by_conversation_id(&db.pool, conv_id)
        .await
        .unwrap());
    let conversation = TaskConversation::find_by_id(&db.pool, conv_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.status, ConversationStatus::Success);
}

#[tokio::test]
async fn missing_log_row_is_tolerated() {
    let db = DBService::new_in_memory().await.unwrap();
    let conv_id = conversation_fixture(&db).await;
    let parser = ResultParser::new(db.clone());
    // must not panic or create anything
    parser.parse_and_store_result(conv_id, Uuid::new_v4()).await;
    assert!(!ConversationResult::exists_by_conversation_id(&db.pool, conv_id)
        .await
        .unwrap());
}
