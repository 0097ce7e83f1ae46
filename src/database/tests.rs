// Edge-case tests for the job store and its write actions
// Run with: cargo test --package adsplice --lib database::tests

#[cfg(test)]
mod store_tests {
    use crate::database::actions::{apply, ActionOutcome, WriteAction};
    use crate::database::*;
    use crate::error::AppError;
    use rusqlite::Connection;
    use tempfile::TempDir;

    fn setup_test_db() -> (Connection, Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let conn = open_writable(&db_path).unwrap();
        let db = Database::open(&db_path).unwrap();
        (conn, db, temp_dir)
    }

    fn run(conn: &mut Connection, action: WriteAction) -> Result<ActionOutcome, AppError> {
        let tx = conn.transaction()?;
        let outcome = apply(&tx, &action)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn create(conn: &mut Connection, job_id: &str, episode: &str, priority: i32) {
        run(
            conn,
            WriteAction::CreateJob {
                job_id: job_id.into(),
                episode_ref: episode.into(),
                priority,
                force: false,
            },
        )
        .unwrap();
    }

    fn start(conn: &mut Connection, job_id: &str) {
        run(conn, WriteAction::StartJob { job_id: job_id.into() }).unwrap();
    }

    fn finish(conn: &mut Connection, job_id: &str, outcome: JobOutcome) {
        run(
            conn,
            WriteAction::FinishJob {
                job_id: job_id.into(),
                outcome,
            },
        )
        .unwrap();
    }

    fn segments(n: usize) -> Vec<NewSegment> {
        (0..n)
            .map(|i| NewSegment {
                start_time: i as f64 * 10.0,
                end_time: (i + 1) as f64 * 10.0,
                text: format!("segment {}", i),
            })
            .collect()
    }

    fn begin_call(conn: &mut Connection, episode: &str, first: i64, last: i64) -> i64 {
        match run(
            conn,
            WriteAction::BeginModelCall {
                job_id: None,
                episode_ref: episode.into(),
                kind: ModelCallKind::Classification,
                model_name: "test-model".into(),
                range: Some(SegmentRange::new(first, last)),
                prompt: None,
            },
        )
        .unwrap()
        {
            ActionOutcome::ModelCallStarted { call_id } => call_id,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    // =========================================================================
    // Job lifecycle
    // =========================================================================

    #[test]
    fn test_create_job_basic() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 5);

        let job = db.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.episode_ref, "ep-1");
        assert_eq!(job.priority, 5);
        assert_eq!(job.progress, 0);
        assert!(job.finished_at.is_none());
        assert!(db.get_episode("ep-1").unwrap().is_some());
    }

    #[test]
    fn test_create_job_rejects_empty_episode() {
        let (mut conn, _db, _temp) = setup_test_db();
        let err = run(
            &mut conn,
            WriteAction::CreateJob {
                job_id: "job-1".into(),
                episode_ref: "  ".into(),
                priority: 0,
                force: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InputData(_)));
    }

    #[test]
    fn test_duplicate_active_job_is_rejected() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 0);

        let err = run(
            &mut conn,
            WriteAction::CreateJob {
                job_id: "job-2".into(),
                episode_ref: "ep-1".into(),
                priority: 0,
                force: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(db.count_jobs().unwrap(), 1);

        // Still rejected while running
        start(&mut conn, "job-1");
        let err = run(
            &mut conn,
            WriteAction::CreateJob {
                job_id: "job-3".into(),
                episode_ref: "ep-1".into(),
                priority: 0,
                force: true,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // Allowed once the first job is terminal
        finish(&mut conn, "job-1", JobOutcome::Completed);
        create(&mut conn, "job-4", "ep-1", 0);
        assert_eq!(db.count_jobs().unwrap(), 2);
    }

    #[test]
    fn test_unique_index_guards_one_active_job() {
        let (conn, _db, _temp) = setup_test_db();
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO episodes (episode_ref, created_at, updated_at) VALUES ('ep', ?1, ?1)",
            [&now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO jobs (id, episode_ref, created_at, updated_at) VALUES ('a', 'ep', ?1, ?1)",
            [&now],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO jobs (id, episode_ref, created_at, updated_at) VALUES ('b', 'ep', ?1, ?1)",
            [&now],
        );
        assert!(second.is_err());
    }

    #[test]
    fn test_full_lifecycle_sets_timestamps() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 0);
        start(&mut conn, "job-1");

        let job = db.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        run(
            &mut conn,
            WriteAction::UpdateJobProgress {
                job_id: "job-1".into(),
                step: 2,
                step_name: "classifying".into(),
                progress: 140,
            },
        )
        .unwrap();
        let job = db.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.step_name, "classifying");
        assert_eq!(job.progress, 100);

        finish(&mut conn, "job-1", JobOutcome::Completed);
        let job = db.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert!(job.error_message.is_none());
    }

    #[test]
    fn test_terminal_job_cannot_restart() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 0);
        start(&mut conn, "job-1");
        finish(
            &mut conn,
            "job-1",
            JobOutcome::Failed {
                error: "boom".into(),
            },
        );

        let err = run(&mut conn, WriteAction::StartJob { job_id: "job-1".into() }).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
        let err = run(
            &mut conn,
            WriteAction::FinishJob {
                job_id: "job-1".into(),
                outcome: JobOutcome::Completed,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        let job = db.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let (mut conn, _db, _temp) = setup_test_db();
        let err = run(&mut conn, WriteAction::StartJob { job_id: "nope".into() }).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = run(&mut conn, WriteAction::CancelJob { job_id: "nope".into() }).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_cancel_queued_running_and_terminal() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "queued", "ep-1", 0);
        create(&mut conn, "running", "ep-2", 0);
        start(&mut conn, "running");

        let out = run(&mut conn, WriteAction::CancelJob { job_id: "queued".into() }).unwrap();
        assert_eq!(
            out,
            ActionOutcome::CancelRequested {
                status: JobStatus::Cancelled
            }
        );
        let job = db.get_job("queued").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.finished_at.is_some());

        let out = run(&mut conn, WriteAction::CancelJob { job_id: "running".into() }).unwrap();
        assert_eq!(
            out,
            ActionOutcome::CancelRequested {
                status: JobStatus::Running
            }
        );
        let job = db.get_job("running").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.cancel_requested);

        let err = run(&mut conn, WriteAction::CancelJob { job_id: "queued".into() }).unwrap_err();
        assert!(matches!(err, AppError::AlreadyTerminal(_)));
    }

    #[test]
    fn test_interrupted_jobs_fail_on_recovery() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "a", "ep-1", 0);
        create(&mut conn, "b", "ep-2", 0);
        start(&mut conn, "a");

        let out = run(&mut conn, WriteAction::FailInterruptedJobs).unwrap();
        assert_eq!(out.rows(), 1);

        let a = db.get_job("a").unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Failed);
        assert!(a.error_message.unwrap().contains("interrupted"));
        assert_eq!(db.get_job("b").unwrap().unwrap().status, JobStatus::Queued);
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    #[test]
    fn test_next_queued_job_respects_priority_then_creation() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "low-1", "ep-1", 5);
        create(&mut conn, "high", "ep-2", 1);
        create(&mut conn, "low-2", "ep-3", 5);

        assert_eq!(db.next_queued_job().unwrap().unwrap().id, "high");
        start(&mut conn, "high");
        assert_eq!(db.next_queued_job().unwrap().unwrap().id, "low-1");
        start(&mut conn, "low-1");
        assert_eq!(db.next_queued_job().unwrap().unwrap().id, "low-2");
    }

    #[test]
    fn test_list_jobs_order_and_active_filter() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "done", "ep-0", 0);
        start(&mut conn, "done");
        finish(&mut conn, "done", JobOutcome::Completed);
        create(&mut conn, "q-late", "ep-1", 3);
        create(&mut conn, "q-early", "ep-2", 1);
        create(&mut conn, "run", "ep-3", 9);
        start(&mut conn, "run");

        let ids: Vec<String> = db
            .list_jobs(false, 50)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["run", "q-early", "q-late", "done"]);

        let active = db.list_jobs(true, 50).unwrap();
        assert_eq!(active.len(), 3);
        assert!(active.iter().all(|j| !j.status.is_terminal()));

        assert_eq!(db.list_jobs(false, 2).unwrap().len(), 2);
    }

    // =========================================================================
    // Transcript segments
    // =========================================================================

    #[test]
    fn test_append_segments_must_be_contiguous() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 0);

        run(
            &mut conn,
            WriteAction::AppendSegments {
                episode_ref: "ep-1".into(),
                first_seq: 0,
                segments: segments(3),
            },
        )
        .unwrap();

        let err = run(
            &mut conn,
            WriteAction::AppendSegments {
                episode_ref: "ep-1".into(),
                first_seq: 5,
                segments: segments(1),
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        run(
            &mut conn,
            WriteAction::AppendSegments {
                episode_ref: "ep-1".into(),
                first_seq: 3,
                segments: segments(2),
            },
        )
        .unwrap();

        let stored = db.get_segments("ep-1").unwrap();
        let seqs: Vec<i64> = stored.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_invalid_segment_rolls_back_whole_batch() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 0);

        let mut batch = segments(3);
        batch[2].end_time = -1.0;
        let err = run(
            &mut conn,
            WriteAction::AppendSegments {
                episode_ref: "ep-1".into(),
                first_seq: 0,
                segments: batch,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InputData(_)));
        assert_eq!(db.count_segments("ep-1").unwrap(), 0);
    }

    #[test]
    fn test_segments_are_immutable() {
        let (mut conn, _db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 0);
        run(
            &mut conn,
            WriteAction::AppendSegments {
                episode_ref: "ep-1".into(),
                first_seq: 0,
                segments: segments(1),
            },
        )
        .unwrap();

        let result = conn.execute(
            "UPDATE transcript_segments SET text = 'changed' WHERE episode_ref = 'ep-1'",
            [],
        );
        assert!(result.is_err());
    }

    // =========================================================================
    // Model calls and identifications
    // =========================================================================

    #[test]
    fn test_model_call_lifecycle() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 0);
        run(
            &mut conn,
            WriteAction::AppendSegments {
                episode_ref: "ep-1".into(),
                first_seq: 0,
                segments: segments(2),
            },
        )
        .unwrap();

        let call_id = begin_call(&mut conn, "ep-1", 0, 1);
        run(
            &mut conn,
            WriteAction::RecordModelCallRetry {
                call_id,
                attempts: 1,
                error: "timeout".into(),
            },
        )
        .unwrap();
        run(
            &mut conn,
            WriteAction::CompleteModelCall {
                call_id,
                status: ModelCallStatus::Succeeded,
                attempts: 2,
                response: Some("[]".into()),
                error: None,
            },
        )
        .unwrap();

        let call = db.get_model_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, ModelCallStatus::Succeeded);
        assert_eq!(call.attempts, 2);
        assert_eq!(call.error_message.as_deref(), Some("timeout"));

        // A completed call is never reopened
        let err = run(
            &mut conn,
            WriteAction::CompleteModelCall {
                call_id,
                status: ModelCallStatus::Failed,
                attempts: 3,
                response: None,
                error: Some("late".into()),
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
        assert_eq!(db.get_model_calls_for_episode("ep-1").unwrap().len(), 1);
    }

    #[test]
    fn test_identifications_validate_confidence_and_range() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 0);
        run(
            &mut conn,
            WriteAction::AppendSegments {
                episode_ref: "ep-1".into(),
                first_seq: 0,
                segments: segments(4),
            },
        )
        .unwrap();
        let call_id = begin_call(&mut conn, "ep-1", 0, 1);

        let bad_confidence = run(
            &mut conn,
            WriteAction::InsertIdentifications {
                call_id,
                episode_ref: "ep-1".into(),
                identifications: vec![
                    NewIdentification {
                        seq: 0,
                        label: Label::Ad,
                        confidence: Some(0.9),
                    },
                    NewIdentification {
                        seq: 1,
                        label: Label::Ad,
                        confidence: Some(1.2),
                    },
                ],
            },
        )
        .unwrap_err();
        assert!(matches!(bad_confidence, AppError::InputData(_)));
        assert!(db.get_identifications("ep-1").unwrap().is_empty());

        let out_of_range = run(
            &mut conn,
            WriteAction::InsertIdentifications {
                call_id,
                episode_ref: "ep-1".into(),
                identifications: vec![NewIdentification {
                    seq: 3,
                    label: Label::Content,
                    confidence: None,
                }],
            },
        )
        .unwrap_err();
        assert!(matches!(out_of_range, AppError::InputData(_)));

        run(
            &mut conn,
            WriteAction::InsertIdentifications {
                call_id,
                episode_ref: "ep-1".into(),
                identifications: vec![
                    NewIdentification {
                        seq: 0,
                        label: Label::Ad,
                        confidence: Some(0.9),
                    },
                    NewIdentification {
                        seq: 1,
                        label: Label::Content,
                        confidence: None,
                    },
                ],
            },
        )
        .unwrap();
        let idents = db.get_identifications("ep-1").unwrap();
        assert_eq!(idents.len(), 2);
        assert_eq!(idents[0].model_call_id, call_id);
        assert_eq!(idents[1].confidence, None);
        let seqs = db.identified_seqs("ep-1").unwrap();
        assert!(seqs.contains(&0) && seqs.contains(&1) && !seqs.contains(&2));
    }

    // =========================================================================
    // Output, pinning and cleanup
    // =========================================================================

    #[test]
    fn test_swap_output_requires_running_job() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 0);

        let swap = |job: &str| WriteAction::SwapEpisodeOutput {
            episode_ref: "ep-1".into(),
            job_id: job.into(),
            output_path: "/out/ep-1.wav".into(),
            fingerprint: Some("fp".into()),
            duration: 42.0,
        };

        let err = run(&mut conn, swap("job-1")).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
        assert!(db.get_episode("ep-1").unwrap().unwrap().output_path.is_none());

        start(&mut conn, "job-1");
        let out = run(&mut conn, swap("job-1")).unwrap();
        assert_eq!(out, ActionOutcome::OutputSwapped { previous: None });

        let episode = db.get_episode("ep-1").unwrap().unwrap();
        assert_eq!(episode.output_path.as_deref(), Some("/out/ep-1.wav"));
        assert_eq!(episode.output_duration, Some(42.0));
        let job = db.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.output_path.as_deref(), Some("/out/ep-1.wav"));
    }

    #[test]
    fn test_cleanup_candidates_skip_pinned_and_active() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "old", "ep-1", 0);
        start(&mut conn, "old");
        finish(&mut conn, "old", JobOutcome::Completed);
        create(&mut conn, "pinned", "ep-2", 0);
        start(&mut conn, "pinned");
        finish(&mut conn, "pinned", JobOutcome::Completed);
        create(&mut conn, "active", "ep-3", 0);
        run(
            &mut conn,
            WriteAction::SetEpisodePinned {
                episode_ref: "ep-2".into(),
                pinned: true,
            },
        )
        .unwrap();

        let future = timestamp(chrono::Utc::now() + chrono::Duration::days(1));
        let ids: Vec<String> = db
            .cleanup_candidates(&future)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["old"]);

        let past = timestamp(chrono::Utc::now() - chrono::Duration::days(1));
        assert!(db.cleanup_candidates(&past).unwrap().is_empty());
    }

    #[test]
    fn test_delete_jobs_never_removes_active() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "done", "ep-1", 0);
        start(&mut conn, "done");
        finish(&mut conn, "done", JobOutcome::Cancelled);
        create(&mut conn, "queued", "ep-2", 0);

        let err = run(
            &mut conn,
            WriteAction::DeleteJobs {
                job_ids: vec!["done".into(), "queued".into()],
                finished_before: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
        // Whole action rolled back
        assert_eq!(db.count_jobs().unwrap(), 2);

        let out = run(
            &mut conn,
            WriteAction::DeleteJobs {
                job_ids: vec!["done".into(), "missing".into()],
                finished_before: None,
            },
        )
        .unwrap();
        assert_eq!(out.rows(), 1);
        assert!(db.get_job("done").unwrap().is_none());
    }

    #[test]
    fn test_retention_delete_respects_pin_set_after_selection() {
        let (mut conn, db, _temp) = setup_test_db();
        for (job, episode) in [("a", "ep-1"), ("b", "ep-2")] {
            create(&mut conn, job, episode, 0);
            start(&mut conn, job);
            finish(&mut conn, job, JobOutcome::Completed);
        }
        let cutoff = timestamp(chrono::Utc::now() + chrono::Duration::days(1));
        let ids: Vec<String> = db
            .cleanup_candidates(&cutoff)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids.len(), 2);

        // Pinned between reading the candidates and deleting them
        run(
            &mut conn,
            WriteAction::SetEpisodePinned {
                episode_ref: "ep-2".into(),
                pinned: true,
            },
        )
        .unwrap();

        let out = run(
            &mut conn,
            WriteAction::DeleteJobs {
                job_ids: ids.clone(),
                finished_before: Some(cutoff),
            },
        )
        .unwrap();
        assert_eq!(
            out,
            ActionOutcome::JobsDeleted {
                job_ids: vec!["a".into()]
            }
        );
        assert!(db.get_job("b").unwrap().is_some());

        // A cutoff earlier than the finish time keeps the job too
        let past = timestamp(chrono::Utc::now() - chrono::Duration::days(1));
        run(
            &mut conn,
            WriteAction::SetEpisodePinned {
                episode_ref: "ep-2".into(),
                pinned: false,
            },
        )
        .unwrap();
        let out = run(
            &mut conn,
            WriteAction::DeleteJobs {
                job_ids: vec!["b".into()],
                finished_before: Some(past),
            },
        )
        .unwrap();
        assert_eq!(out.rows(), 0);
        assert!(db.get_job("b").unwrap().is_some());
    }

    #[test]
    fn test_purge_episode_removes_derived_data() {
        let (mut conn, db, _temp) = setup_test_db();
        create(&mut conn, "job-1", "ep-1", 0);
        start(&mut conn, "job-1");
        run(
            &mut conn,
            WriteAction::AppendSegments {
                episode_ref: "ep-1".into(),
                first_seq: 0,
                segments: segments(2),
            },
        )
        .unwrap();
        let call_id = begin_call(&mut conn, "ep-1", 0, 1);
        run(
            &mut conn,
            WriteAction::InsertIdentifications {
                call_id,
                episode_ref: "ep-1".into(),
                identifications: vec![NewIdentification {
                    seq: 0,
                    label: Label::Ad,
                    confidence: Some(0.95),
                }],
            },
        )
        .unwrap();
        finish(&mut conn, "job-1", JobOutcome::Completed);

        // Jobs still reference the episode
        let err = run(
            &mut conn,
            WriteAction::PurgeEpisodeData {
                episode_ref: "ep-1".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        run(
            &mut conn,
            WriteAction::DeleteJobs {
                job_ids: vec!["job-1".into()],
                finished_before: None,
            },
        )
        .unwrap();
        let out = run(
            &mut conn,
            WriteAction::PurgeEpisodeData {
                episode_ref: "ep-1".into(),
            },
        )
        .unwrap();
        assert_eq!(out.rows(), 4);
        assert!(db.get_episode("ep-1").unwrap().is_some());
        assert_eq!(db.count_segments("ep-1").unwrap(), 0);
        assert!(db.get_model_calls_for_episode("ep-1").unwrap().is_empty());
    }

    #[test]
    fn test_read_handle_is_query_only() {
        let (_conn, db, _temp) = setup_test_db();
        let conn = db.conn();
        let result = conn.execute(
            "INSERT INTO episodes (episode_ref, created_at, updated_at) VALUES ('x', 'a', 'a')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_action_serializes_with_name_tag() {
        let action = WriteAction::CancelJob {
            job_id: "job-1".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "cancel_job");
        assert_eq!(action.name(), "cancel_job");
    }
}
