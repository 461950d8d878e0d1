#[cfg(test)]
mod tests {
    use chrono::Duration;
    use slb_config::RateLimitAction;
    use slb_core::{Decision, IssuedSession, RequestStatus, RiskTier, SlbError};
    use slb_store::{NewRequest, RequestPolicy, Store, Sweeper};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn session(store: &Store, agent: &str) -> IssuedSession {
        store
            .create_session(agent, "claude-code", "opus", Path::new("/work/project"))
            .unwrap()
    }

    fn new_request(issued: &IssuedSession, min_approvals: u32, ttl: Duration) -> NewRequest {
        NewRequest {
            requestor_session_id: issued.session.id,
            session_key: issued.session_key.clone(),
            command_raw: "rm -rf ./build".into(),
            display_redacted: "rm -rf ./build".into(),
            contains_sensitive: false,
            cwd: PathBuf::from("/work/project"),
            tier: if min_approvals >= 2 {
                RiskTier::Critical
            } else {
                RiskTier::Dangerous
            },
            min_approvals,
            ttl,
        }
    }

    // ── Sessions ───────────────────────────────────────────────

    mod sessions {
        use super::*;

        #[test]
        fn test_create_and_get_session() {
            let store = store();
            let issued = session(&store, "BlueLake");
            assert!(!issued.session_key.is_empty());
            assert!(issued.session.is_active());

            let loaded = store.get_session(issued.session.id).unwrap();
            assert_eq!(loaded.agent_name, "BlueLake");
            assert_eq!(loaded.project_path, PathBuf::from("/work/project"));
        }

        #[test]
        fn test_second_active_session_rejected() {
            let store = store();
            session(&store, "BlueLake");
            let err = store
                .create_session("BlueLake", "codex-cli", "gpt", Path::new("/other"))
                .unwrap_err();
            assert!(matches!(err, SlbError::ActiveSessionExists { ref agent } if agent == "BlueLake"));
        }

        #[test]
        fn test_new_session_after_end() {
            let store = store();
            let first = session(&store, "BlueLake");
            let ended = store.end_session(first.session.id).unwrap();
            assert!(ended.ended_at.is_some());

            let second = session(&store, "BlueLake");
            assert_ne!(second.session.id, first.session.id);
        }

        #[test]
        fn test_end_is_terminal_and_idempotent() {
            let store = store();
            let issued = session(&store, "BlueLake");
            let first = store.end_session(issued.session.id).unwrap();
            let again = store.end_session(issued.session.id).unwrap();
            assert_eq!(first.ended_at, again.ended_at);
            assert!(matches!(
                store.heartbeat(issued.session.id),
                Err(SlbError::SessionEnded(_))
            ));
        }

        #[test]
        fn test_heartbeat_refreshes() {
            let store = store();
            let issued = session(&store, "BlueLake");
            thread::sleep(std::time::Duration::from_millis(5));
            store.heartbeat(issued.session.id).unwrap();
            store.heartbeat(issued.session.id).unwrap();
            let loaded = store.get_session(issued.session.id).unwrap();
            assert!(loaded.last_active_at > issued.session.last_active_at);
        }

        #[test]
        fn test_unknown_session() {
            let store = store();
            let id = uuid::Uuid::new_v4();
            assert!(matches!(store.heartbeat(id), Err(SlbError::SessionNotFound(_))));
            assert!(matches!(store.end_session(id), Err(SlbError::SessionNotFound(_))));
        }

        #[test]
        fn test_find_stale_sessions() {
            let store = store();
            let issued = session(&store, "BlueLake");
            assert!(store.find_stale_sessions(Duration::minutes(30)).unwrap().is_empty());

            thread::sleep(std::time::Duration::from_millis(5));
            let stale = store.find_stale_sessions(Duration::zero()).unwrap();
            assert_eq!(stale.len(), 1);
            assert_eq!(stale[0].id, issued.session.id);

            store.end_session(issued.session.id).unwrap();
            assert!(store.find_stale_sessions(Duration::zero()).unwrap().is_empty());
            session(&store, "BlueLake");
        }

        #[test]
        fn test_open_migrates_older_database() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("state.db");
            {
                let conn = rusqlite::Connection::open(&path).unwrap();
                conn.execute_batch(
                    "CREATE TABLE sessions (
                        id TEXT PRIMARY KEY, agent_name TEXT NOT NULL, program TEXT NOT NULL,
                        model TEXT NOT NULL, project_path TEXT NOT NULL, key_digest TEXT NOT NULL,
                        created_at TEXT NOT NULL, last_active_at TEXT NOT NULL, ended_at TEXT
                    );",
                )
                .unwrap();
            }
            let store = Store::open(&path).unwrap();
            let issued = session(&store, "BlueLake");
            store.reset_rate_limits(issued.session.id).unwrap();
            assert!(store.check_rate_limit(issued.session.id).unwrap().allowed);
        }

        #[test]
        fn test_verify_session_key() {
            let store = store();
            let issued = session(&store, "BlueLake");
            assert!(store
                .verify_session_key(issued.session.id, &issued.session_key)
                .is_ok());
            assert!(matches!(
                store.verify_session_key(issued.session.id, "forged"),
                Err(SlbError::InvalidSessionKey(_))
            ));
        }

        #[test]
        fn test_list_active_sessions() {
            let store = store();
            let a = session(&store, "BlueLake");
            session(&store, "GreenHill");
            store
                .create_session("RedRiver", "x", "y", Path::new("/elsewhere"))
                .unwrap();
            store.end_session(a.session.id).unwrap();

            assert_eq!(store.list_active_sessions(None).unwrap().len(), 2);
            let here = store
                .list_active_sessions(Some(Path::new("/work/project")))
                .unwrap();
            assert_eq!(here.len(), 1);
            assert_eq!(here[0].agent_name, "GreenHill");
        }

        #[test]
        fn test_concurrent_create_single_winner() {
            let dir = tempfile::tempdir().unwrap();
            let db_path = dir.path().join("state.db");
            Store::open(&db_path).unwrap();

            let threads = 8;
            let barrier = Arc::new(Barrier::new(threads));
            let handles: Vec<_> = (0..threads)
                .map(|i| {
                    let barrier = Arc::clone(&barrier);
                    let db_path = db_path.clone();
                    thread::spawn(move || {
                        let store = Store::open(&db_path).unwrap();
                        barrier.wait();
                        store.create_session("BlueLake", &format!("p{i}"), "m", Path::new("/w"))
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1);
            assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
                e,
                SlbError::ActiveSessionExists { .. }
            )));

            let store = Store::open(&db_path).unwrap();
            assert_eq!(store.list_active_sessions(None).unwrap().len(), 1);
        }
    }

    // ── Requests and reviews ───────────────────────────────────

    mod requests {
        use super::*;

        #[test]
        fn test_two_approvals_required() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let r1 = session(&store, "GreenHill");
            let r2 = session(&store, "RedRiver");

            let req = store
                .create_request(&new_request(&requestor, 2, Duration::minutes(30)))
                .unwrap();
            assert_eq!(req.status, RequestStatus::Pending);
            assert_eq!(req.project_path, PathBuf::from("/work/project"));

            let after_one = store
                .submit_review(req.id, r1.session.id, &r1.session_key, Decision::Approve, "ok")
                .unwrap();
            assert_eq!(after_one.status, RequestStatus::Pending);
            assert_eq!(after_one.approvals_so_far, 1);

            let after_two = store
                .submit_review(req.id, r2.session.id, &r2.session_key, Decision::Approve, "")
                .unwrap();
            assert_eq!(after_two.status, RequestStatus::Approved);
            assert_eq!(after_two.approvals_so_far, 2);
            assert!(after_two.resolved_at.is_some());

            let reviews = store.list_reviews(req.id).unwrap();
            assert_eq!(reviews.len(), 2);
            assert_eq!(reviews[0].reviewer_agent, "GreenHill");
            assert_eq!(reviews[0].comments, "ok");
        }

        #[test]
        fn test_single_reject_is_terminal() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let r1 = session(&store, "GreenHill");
            let r2 = session(&store, "RedRiver");
            let r3 = session(&store, "GoldFern");

            let req = store
                .create_request(&new_request(&requestor, 2, Duration::minutes(30)))
                .unwrap();
            store
                .submit_review(req.id, r1.session.id, &r1.session_key, Decision::Approve, "")
                .unwrap();
            let rejected = store
                .submit_review(req.id, r2.session.id, &r2.session_key, Decision::Reject, "no")
                .unwrap();
            assert_eq!(rejected.status, RequestStatus::Rejected);

            let err = store
                .submit_review(req.id, r3.session.id, &r3.session_key, Decision::Approve, "")
                .unwrap_err();
            assert!(matches!(
                err,
                SlbError::RequestNotPending {
                    status: RequestStatus::Rejected
                }
            ));
        }

        #[test]
        fn test_self_approval_rejected() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let req = store
                .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                .unwrap();
            let err = store
                .submit_review(
                    req.id,
                    requestor.session.id,
                    &requestor.session_key,
                    Decision::Approve,
                    "",
                )
                .unwrap_err();
            assert!(matches!(err, SlbError::SelfApproval));
        }

        #[test]
        fn test_duplicate_review_rejected() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let reviewer = session(&store, "GreenHill");
            let req = store
                .create_request(&new_request(&requestor, 2, Duration::minutes(30)))
                .unwrap();
            store
                .submit_review(req.id, reviewer.session.id, &reviewer.session_key, Decision::Approve, "")
                .unwrap();
            let err = store
                .submit_review(req.id, reviewer.session.id, &reviewer.session_key, Decision::Approve, "")
                .unwrap_err();
            assert!(matches!(err, SlbError::AlreadyReviewed(_)));
            assert_eq!(store.get_request(req.id).unwrap().approvals_so_far, 1);
        }

        #[test]
        fn test_reviewer_key_checked() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let reviewer = session(&store, "GreenHill");
            let req = store
                .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                .unwrap();
            let err = store
                .submit_review(req.id, reviewer.session.id, "wrong", Decision::Approve, "")
                .unwrap_err();
            assert!(matches!(err, SlbError::InvalidSessionKey(_)));
        }

        #[test]
        fn test_approval_after_expiry_fails_even_if_pending() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let reviewer = session(&store, "GreenHill");
            let req = store
                .create_request(&new_request(&requestor, 1, Duration::milliseconds(1)))
                .unwrap();
            thread::sleep(std::time::Duration::from_millis(10));

            // No sweep has run: stored status still reads pending.
            assert_eq!(store.get_request(req.id).unwrap().status, RequestStatus::Pending);

            let err = store
                .submit_review(req.id, reviewer.session.id, &reviewer.session_key, Decision::Approve, "")
                .unwrap_err();
            assert!(matches!(err, SlbError::RequestExpired));
            assert_eq!(store.get_request(req.id).unwrap().status, RequestStatus::Timeout);
            assert!(store.list_reviews(req.id).unwrap().is_empty());
        }

        #[test]
        fn test_zero_threshold_auto_approved() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let mut new = new_request(&requestor, 0, Duration::minutes(30));
            new.tier = RiskTier::Caution;
            let req = store.create_request(&new).unwrap();
            assert_eq!(req.status, RequestStatus::Approved);
            assert!(req.resolved_at.is_some());
            assert_eq!(store.get_request(req.id).unwrap(), req);
        }

        #[test]
        fn test_create_requires_valid_session() {
            let store = store();
            let requestor = session(&store, "BlueLake");

            let mut bad_key = new_request(&requestor, 1, Duration::minutes(30));
            bad_key.session_key = "forged".into();
            assert!(matches!(
                store.create_request(&bad_key),
                Err(SlbError::InvalidSessionKey(_))
            ));

            store.end_session(requestor.session.id).unwrap();
            assert!(matches!(
                store.create_request(&new_request(&requestor, 1, Duration::minutes(30))),
                Err(SlbError::SessionEnded(_))
            ));

            let mut empty = new_request(&requestor, 1, Duration::minutes(30));
            empty.command_raw = "  ".into();
            assert!(matches!(
                store.create_request(&empty),
                Err(SlbError::InvalidRequest(_))
            ));
        }

        #[test]
        fn test_blocked_agent() {
            let store = store().with_policy(RequestPolicy {
                blocked_agents: vec!["roguebot".into()],
                ..RequestPolicy::default()
            });
            let rogue = session(&store, "RogueBot");
            let err = store
                .create_request(&new_request(&rogue, 1, Duration::minutes(30)))
                .unwrap_err();
            assert!(matches!(err, SlbError::AgentBlocked(_)));
        }

        #[test]
        fn test_pending_limit() {
            let store = store().with_policy(RequestPolicy {
                max_pending_per_session: 2,
                ..RequestPolicy::default()
            });
            let requestor = session(&store, "BlueLake");
            for _ in 0..2 {
                store
                    .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                    .unwrap();
            }
            assert_eq!(store.count_pending(requestor.session.id).unwrap(), 2);
            let err = store
                .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                .unwrap_err();
            assert!(matches!(err, SlbError::RateLimited { pending: 2, limit: 2 }));
        }

        #[test]
        fn test_per_minute_limit_and_reset() {
            let store = store().with_policy(RequestPolicy {
                max_pending_per_session: 0,
                max_requests_per_minute: 2,
                ..RequestPolicy::default()
            });
            let requestor = session(&store, "BlueLake");
            for _ in 0..2 {
                store
                    .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                    .unwrap();
            }

            let status = store.check_rate_limit(requestor.session.id).unwrap();
            assert!(!status.allowed);
            assert_eq!(status.recent, 2);
            assert!(status.reset_at.is_some());
            let err = store
                .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                .unwrap_err();
            assert!(matches!(err, SlbError::RequestRateExceeded { recent: 2, limit: 2 }));

            thread::sleep(std::time::Duration::from_millis(2));
            store.reset_rate_limits(requestor.session.id).unwrap();
            let status = store.check_rate_limit(requestor.session.id).unwrap();
            assert!(status.allowed);
            assert_eq!(status.recent, 0);
            store
                .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                .unwrap();
        }

        #[test]
        fn test_warn_action_opens_over_limit() {
            let store = store().with_policy(RequestPolicy {
                max_pending_per_session: 1,
                max_requests_per_minute: 1,
                rate_limit_action: RateLimitAction::Warn,
                ..RequestPolicy::default()
            });
            let requestor = session(&store, "BlueLake");
            for _ in 0..3 {
                store
                    .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                    .unwrap();
            }
            let status = store.check_rate_limit(requestor.session.id).unwrap();
            assert!(status.allowed);
            assert_eq!(status.pending, 3);
            assert!(matches!(status.exceeded(), Some(SlbError::RateLimited { pending: 3, limit: 1 })));
        }

        #[test]
        fn test_rate_limit_unknown_session() {
            let store = store();
            let id = uuid::Uuid::new_v4();
            assert!(matches!(store.check_rate_limit(id), Err(SlbError::SessionNotFound(_))));
            assert!(matches!(store.reset_rate_limits(id), Err(SlbError::SessionNotFound(_))));
        }

        #[test]
        fn test_unknown_request() {
            let store = store();
            let reviewer = session(&store, "GreenHill");
            let err = store
                .submit_review(
                    uuid::Uuid::new_v4(),
                    reviewer.session.id,
                    &reviewer.session_key,
                    Decision::Approve,
                    "",
                )
                .unwrap_err();
            assert!(matches!(err, SlbError::RequestNotFound(_)));
        }

        #[test]
        fn test_list_pending_and_attach_rollback() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let req = store
                .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                .unwrap();
            let pending = store.list_pending(Some(Path::new("/work/project"))).unwrap();
            assert_eq!(pending.len(), 1);
            assert!(store.list_pending(Some(Path::new("/nope"))).unwrap().is_empty());

            store
                .attach_rollback(req.id, Path::new("/work/project/.slb/rollback/req-1"))
                .unwrap();
            assert_eq!(
                store.get_request(req.id).unwrap().rollback_path,
                Some(PathBuf::from("/work/project/.slb/rollback/req-1"))
            );
            assert!(store
                .attach_rollback(uuid::Uuid::new_v4(), Path::new("/x"))
                .is_err());
        }

        #[test]
        fn test_expired_requests_and_mark_timeout() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let live = store
                .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                .unwrap();
            let stale = store
                .create_request(&new_request(&requestor, 1, Duration::milliseconds(1)))
                .unwrap();
            thread::sleep(std::time::Duration::from_millis(10));

            let expired = store.find_expired_requests().unwrap();
            assert_eq!(expired.len(), 1);
            assert_eq!(expired[0].id, stale.id);

            assert!(!store.mark_timeout(live.id).unwrap());
            assert!(store.mark_timeout(stale.id).unwrap());
            assert!(!store.mark_timeout(stale.id).unwrap());
            assert_eq!(store.get_request(stale.id).unwrap().status, RequestStatus::Timeout);
            assert_eq!(store.get_request(live.id).unwrap().status, RequestStatus::Pending);
        }

        #[test]
        fn test_concurrent_approvals_count_once_each() {
            let dir = tempfile::tempdir().unwrap();
            let db_path = dir.path().join("state.db");
            let store = Store::open(&db_path).unwrap();

            let requestor = session(&store, "Requestor");
            let reviewers: Vec<IssuedSession> = (0..5)
                .map(|i| session(&store, &format!("Reviewer{i}")))
                .collect();
            let req = store
                .create_request(&new_request(&requestor, 3, Duration::minutes(30)))
                .unwrap();

            let barrier = Arc::new(Barrier::new(reviewers.len()));
            let handles: Vec<_> = reviewers
                .into_iter()
                .map(|reviewer| {
                    let barrier = Arc::clone(&barrier);
                    let db_path = db_path.clone();
                    thread::spawn(move || {
                        let store = Store::open(&db_path).unwrap();
                        barrier.wait();
                        store.submit_review(
                            req.id,
                            reviewer.session.id,
                            &reviewer.session_key,
                            Decision::Approve,
                            "",
                        )
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
            assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
                e,
                SlbError::RequestNotPending {
                    status: RequestStatus::Approved
                }
            )));

            let final_state = store.get_request(req.id).unwrap();
            assert_eq!(final_state.status, RequestStatus::Approved);
            assert_eq!(final_state.approvals_so_far, 3);
            assert_eq!(store.list_reviews(req.id).unwrap().len(), 3);
        }
    }

    // ── Sweeper ────────────────────────────────────────────────

    mod sweeper {
        use super::*;

        #[test]
        fn test_sweep_ends_stale_and_times_out_expired() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let req = store
                .create_request(&new_request(&requestor, 1, Duration::milliseconds(1)))
                .unwrap();
            thread::sleep(std::time::Duration::from_millis(10));

            let report = Sweeper::new(store.clone(), Duration::zero()).run_once();
            assert_eq!(report.sessions_ended, 1);
            assert_eq!(report.requests_timed_out, 1);
            assert_eq!(report.failures, 0);

            assert_eq!(store.get_request(req.id).unwrap().status, RequestStatus::Timeout);
            assert!(!store.get_session(requestor.session.id).unwrap().is_active());

            // Nothing left to do; terminal states are never reopened.
            let again = Sweeper::new(store.clone(), Duration::zero()).run_once();
            assert_eq!(again, Default::default());
        }

        #[test]
        fn test_heartbeat_after_listing_keeps_session_alive() {
            let store = store();
            let issued = session(&store, "BlueLake");
            let threshold = Duration::milliseconds(200);
            thread::sleep(std::time::Duration::from_millis(300));

            let stale = store.find_stale_sessions(threshold).unwrap();
            assert_eq!(stale.len(), 1);

            // The agent checks in between the listing and the write.
            store.heartbeat(issued.session.id).unwrap();
            assert!(!store.end_stale_session(stale[0].id, threshold).unwrap());
            assert!(store.get_session(issued.session.id).unwrap().is_active());

            let report = Sweeper::new(store.clone(), threshold).run_once();
            assert_eq!(report.sessions_ended, 0);
            assert!(store.get_session(issued.session.id).unwrap().is_active());
        }

        #[test]
        fn test_end_stale_session_skips_ended() {
            let store = store();
            let issued = session(&store, "BlueLake");
            thread::sleep(std::time::Duration::from_millis(5));
            assert!(store.end_stale_session(issued.session.id, Duration::zero()).unwrap());
            assert!(!store.end_stale_session(issued.session.id, Duration::zero()).unwrap());
        }

        #[test]
        fn test_sweep_leaves_live_entities() {
            let store = store();
            let requestor = session(&store, "BlueLake");
            let req = store
                .create_request(&new_request(&requestor, 1, Duration::minutes(30)))
                .unwrap();
            let report = Sweeper::new(store.clone(), Duration::minutes(30)).run_once();
            assert_eq!(report.sessions_ended, 0);
            assert_eq!(report.requests_timed_out, 0);
            assert_eq!(store.get_request(req.id).unwrap().status, RequestStatus::Pending);
        }
    }
}
