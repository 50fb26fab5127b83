//! Two-phase protocol: replication, quorum, abort arbitration

mod support;

use arbor_db_index_builds::{
    BuildAction, BuildPersistence, BuildProtocol, IndexBuildError, StartBuildRequest,
};
use arbor_db_replication::{IndexBuildOplogEntry, MemberState};
use serde_json::json;
use support::{harness, spec, WAIT};
use uuid::Uuid;

#[tokio::test]
async fn test_two_phase_primary_happy_path() {
    let h = harness();
    let coll = Uuid::new_v4();
    h.catalog.create_collection("app", coll, 100);

    let stats = h
        .coordinator
        .start_index_build(StartBuildRequest::new(
            "app",
            coll,
            vec![spec("a_1", json!({"a": 1}))],
            BuildProtocol::TwoPhase,
        ))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(stats.indexes_after, stats.indexes_before + 1);
    assert!(h.catalog.is_index_ready(coll, "a_1"));
    assert_eq!(h.coordinator.active_count(), 0);
    // The build entry is removed once the decision is durable.
    assert!(h.persistence.entries().await.unwrap().is_empty());

    let entries = h.repl.entries();
    assert_eq!(entries.len(), 2);
    assert!(matches!(
        entries[0],
        IndexBuildOplogEntry::StartIndexBuild { .. }
    ));
    assert!(matches!(
        entries[1],
        IndexBuildOplogEntry::CommitIndexBuild { .. }
    ));
}

#[tokio::test]
async fn test_start_rejected_on_secondary() {
    let h = harness();
    let coll = Uuid::new_v4();
    h.catalog.create_collection("app", coll, 10);
    h.repl.set_member_state(MemberState::Secondary);

    let err = h
        .coordinator
        .start_index_build(StartBuildRequest::new(
            "app",
            coll,
            vec![spec("a_1", json!({"a": 1}))],
            BuildProtocol::TwoPhase,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, IndexBuildError::NotPrimary(_)));
    assert_eq!(h.coordinator.active_count(), 0);
}

#[tokio::test]
async fn test_secondary_applies_start_then_commit() {
    let h = harness();
    let coll = Uuid::new_v4();
    let build_id = Uuid::new_v4();
    h.catalog.create_collection("app", coll, 50);
    h.repl.set_member_state(MemberState::Secondary);

    let specs = vec![json!({"name": "a_1", "key": {"a": 1}})];
    h.coordinator
        .apply_oplog_entry(IndexBuildOplogEntry::StartIndexBuild {
            collection_id: coll,
            build_id,
            index_specs: specs.clone(),
        })
        .await
        .unwrap();
    assert_eq!(h.coordinator.active_count(), 1);

    // The build parks awaiting the primary's decision, after voting ready.
    let deadline = tokio::time::Instant::now() + WAIT;
    while h.repl.commit_ready_votes().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "vote never cast");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(h.repl.commit_ready_votes()[0].0, build_id);

    h.coordinator
        .apply_oplog_entry(IndexBuildOplogEntry::CommitIndexBuild {
            collection_id: coll,
            build_id,
            index_specs: specs,
        })
        .await
        .unwrap();

    assert!(h.catalog.is_index_ready(coll, "a_1"));
    assert_eq!(h.coordinator.active_count(), 0);
    // A secondary never writes lifecycle entries itself.
    assert!(h.repl.entries().is_empty());
}

#[tokio::test]
async fn test_secondary_applies_abort() {
    let h = harness();
    let coll = Uuid::new_v4();
    let build_id = Uuid::new_v4();
    h.catalog.create_collection("app", coll, 50);
    h.repl.set_member_state(MemberState::Secondary);

    let specs = vec![json!({"name": "a_1", "key": {"a": 1}})];
    h.coordinator
        .apply_oplog_entry(IndexBuildOplogEntry::StartIndexBuild {
            collection_id: coll,
            build_id,
            index_specs: specs.clone(),
        })
        .await
        .unwrap();

    h.coordinator
        .apply_oplog_entry(IndexBuildOplogEntry::AbortIndexBuild {
            collection_id: coll,
            build_id,
            index_specs: specs,
            cause: "user cancelled".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(h.coordinator.active_count(), 0);
    assert!(!h.catalog.is_index_ready(coll, "a_1"));
    assert!(!h.catalog.has_unfinished(coll));
}

#[tokio::test]
async fn test_abort_race_single_winner_first_reason_sticks() {
    let h = harness();
    let coll = Uuid::new_v4();
    let build_id = Uuid::new_v4();
    h.catalog.create_collection("app", coll, 100);
    // Two voters: the lone primary vote cannot satisfy quorum, so the build
    // parks in the commit/abort wait.
    h.repl.set_voting_members(2);

    let completion = h
        .coordinator
        .start_index_build(
            StartBuildRequest::new(
                "app",
                coll,
                vec![spec("a_1", json!({"a": 1}))],
                BuildProtocol::TwoPhase,
            )
            .with_build_id(build_id),
        )
        .await
        .unwrap();

    // Self-abort fires first and wins; the administrative abort observes the
    // build already aborting and reports success without second teardown.
    let handle = h.coordinator.registry().get(build_id).unwrap();
    assert!(handle.force_self_abort("constraint"));
    let also_aborted = h
        .coordinator
        .abort_build(build_id, BuildAction::PrimaryAbort, "admin")
        .await
        .unwrap();
    assert!(also_aborted);

    let err = completion.wait().await.unwrap_err();
    assert_eq!(
        err,
        IndexBuildError::BuildAborted {
            reason: "constraint".to_string()
        }
    );
    assert_eq!(h.coordinator.active_count(), 0);
    assert!(!h.catalog.has_unfinished(coll));

    // First writer's reason travels in the replicated abort entry.
    let entries = h.repl.entries();
    match entries.last().unwrap() {
        IndexBuildOplogEntry::AbortIndexBuild { cause, .. } => {
            assert_eq!(cause, "constraint");
        }
        other => panic!("expected abort entry, got {other:?}"),
    }
}

#[tokio::test]
async fn test_abort_by_build_id_idempotent() {
    let h = harness();
    let coll = Uuid::new_v4();
    let build_id = Uuid::new_v4();
    h.catalog.create_collection("app", coll, 100);
    h.repl.set_voting_members(2);

    let completion = h
        .coordinator
        .start_index_build(
            StartBuildRequest::new(
                "app",
                coll,
                vec![spec("a_1", json!({"a": 1}))],
                BuildProtocol::TwoPhase,
            )
            .with_build_id(build_id),
        )
        .await
        .unwrap();

    assert!(h
        .coordinator
        .abort_build(build_id, BuildAction::PrimaryAbort, "admin")
        .await
        .unwrap());
    completion.wait().await.unwrap_err();
    let entries_after_first = h.repl.entries().len();

    // Second abort succeeds with no further side effects.
    assert!(h
        .coordinator
        .abort_build(build_id, BuildAction::PrimaryAbort, "admin")
        .await
        .unwrap());
    assert_eq!(h.repl.entries().len(), entries_after_first);
}

#[tokio::test]
async fn test_admin_abort_requires_primary() {
    let h = harness();
    let coll = Uuid::new_v4();
    let build_id = Uuid::new_v4();
    h.catalog.create_collection("app", coll, 50);
    h.repl.set_member_state(MemberState::Secondary);

    h.coordinator
        .apply_oplog_entry(IndexBuildOplogEntry::StartIndexBuild {
            collection_id: coll,
            build_id,
            index_specs: vec![json!({"name": "a_1", "key": {"a": 1}})],
        })
        .await
        .unwrap();

    let err = h
        .coordinator
        .abort_build(build_id, BuildAction::PrimaryAbort, "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, IndexBuildError::NotPrimary(_)));
    // The build is still registered and unharmed.
    assert_eq!(h.coordinator.active_count(), 1);
}

#[tokio::test]
async fn test_initial_sync_overrides_abort_signal() {
    let h = harness();
    let coll = Uuid::new_v4();
    let build_id = Uuid::new_v4();
    h.catalog.create_collection("app", coll, 50);
    h.repl.set_member_state(MemberState::Secondary);

    h.coordinator
        .apply_oplog_entry(IndexBuildOplogEntry::StartIndexBuild {
            collection_id: coll,
            build_id,
            index_specs: vec![json!({"name": "a_1", "key": {"a": 1}})],
        })
        .await
        .unwrap();

    // The node moves into initial sync; a primary-style abort is re-tagged
    // as an initial-sync abort instead of failing the not-primary check.
    h.repl.set_member_state(MemberState::InitialSync);
    assert!(h
        .coordinator
        .abort_build(build_id, BuildAction::PrimaryAbort, "initial sync")
        .await
        .unwrap());
    assert_eq!(h.coordinator.active_count(), 0);
    assert!(!h.catalog.has_unfinished(coll));
    // No abort entry: an initial-syncing node cannot replicate.
    assert!(h.repl.entries().is_empty());
}

#[tokio::test]
async fn test_setup_waits_out_state_transition() {
    let h = harness();
    let coll = Uuid::new_v4();
    h.catalog.create_collection("app", coll, 10);

    // A step-down is in flight: setup enqueues behind the state transition
    // lock with a bounded wait and keeps retrying until the step completes.
    let step = h.coordinator.locks().clone();
    let guard = step.state_transition_exclusive().await;
    let starter = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .start_index_build(StartBuildRequest::new(
                    "app",
                    coll,
                    vec![spec("a_1", json!({"a": 1}))],
                    BuildProtocol::TwoPhase,
                ))
                .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(!starter.is_finished());
    drop(guard);

    let completion = starter.await.unwrap().unwrap();
    completion.wait().await.unwrap();
    assert!(h.catalog.is_index_ready(coll, "a_1"));
}

#[tokio::test]
async fn test_secondary_failure_requests_primary_abort() {
    let h = harness();
    let coll = Uuid::new_v4();
    let build_id = Uuid::new_v4();
    h.catalog.create_collection("app", coll, 50);
    h.repl.set_member_state(MemberState::Secondary);

    let specs = vec![json!({"name": "a_1", "key": {"a": 1}})];
    h.coordinator
        .apply_oplog_entry(IndexBuildOplogEntry::StartIndexBuild {
            collection_id: coll,
            build_id,
            index_specs: specs.clone(),
        })
        .await
        .unwrap();

    // Tear the build's catalog state out from under it; the next drain
    // fails, and a secondary cannot decide to abort on its own.
    let deadline = tokio::time::Instant::now() + WAIT;
    while h.repl.commit_ready_votes().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "vote never cast");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let handle = h.coordinator.registry().get(build_id).unwrap();
    assert!(handle.force_self_abort("simulated build failure"));

    // The pipeline asks the primary instead of tearing down locally.
    let deadline = tokio::time::Instant::now() + WAIT;
    while h.repl.abort_requests().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "abort never requested from primary"
        );
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(h.repl.abort_requests()[0].0, build_id);
    assert_eq!(h.coordinator.active_count(), 1);

    // The primary's decision arrives; teardown happens through it.
    h.coordinator
        .apply_oplog_entry(IndexBuildOplogEntry::AbortIndexBuild {
            collection_id: coll,
            build_id,
            index_specs: specs,
            cause: "simulated build failure".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(h.coordinator.active_count(), 0);
    assert!(!h.catalog.has_unfinished(coll));
}
