//! `PgStore` against a live database.
//!
//! Run with `DATABASE_URL` pointing at a disposable PostgreSQL instance:
//! `cargo test -p ocrd-db -- --ignored`.

use ocrd_core::job::JobState;
use ocrd_core::packaging::BagInfo;
use ocrd_db::models::{WorkflowJobRecord, WorkflowRecord, WorkspaceRecord};
use ocrd_db::{PgStore, RecordStore};
use sqlx::PgPool;

fn info(identifier: &str) -> BagInfo {
    BagInfo {
        ocrd_identifier: identifier.into(),
        bagit_profile_identifier: "https://ocr-d.de/bagit-profile.json".into(),
        ocrd_base_version_checksum: None,
        ocrd_mets: Some("mets.xml".into()),
        extra: [("Contact-Name".to_string(), "Jane".to_string())].into(),
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn workspace_upsert_keeps_tombstone(pool: PgPool) {
    ocrd_db::health_check(&pool).await.unwrap();
    let store = PgStore::new(pool);

    let saved = store
        .save_workspace(&WorkspaceRecord::new("ws-1", &info("bag-1"), "d1"))
        .await
        .unwrap();
    assert_eq!(saved.bag_info(), info("bag-1"));

    assert!(store.mark_workspace_deleted("ws-1").await.unwrap());
    let resaved = store
        .save_workspace(&WorkspaceRecord::new("ws-1", &info("bag-2"), "d2"))
        .await
        .unwrap();
    assert!(resaved.deleted);
    assert_eq!(resaved.ocrd_identifier, "bag-2");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn workflow_mark_deleted_reports_missing(pool: PgPool) {
    let store = PgStore::new(pool);
    assert!(!store.mark_workflow_deleted("missing").await.unwrap());

    store
        .save_workflow(&WorkflowRecord::new("wf-1", "main.nf"))
        .await
        .unwrap();
    assert!(store.mark_workflow_deleted("wf-1").await.unwrap());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn job_transitions_are_conditional(pool: PgPool) {
    let store = PgStore::new(pool);
    store
        .save_job(&WorkflowJobRecord::queued("job-1", "wf-1", "ws-1"))
        .await
        .unwrap();

    assert!(!store.set_job_state("job-1", JobState::Success).await.unwrap());
    assert!(store.set_job_state("job-1", JobState::Running).await.unwrap());
    assert!(store.set_job_state("job-1", JobState::Stopped).await.unwrap());
    assert!(!store.set_job_state("job-1", JobState::Success).await.unwrap());

    let job = store.get_job("job-1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Stopped);
}
