use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use revloop_core::error::{Result, RevloopError};
use revloop_core::event::EventBus;
use revloop_core::review::{
    join_feedback, ReviewPolicy, ReviewSession, SessionSnapshot, Transition, Verdict,
};
use revloop_core::traits::{Generator, ReviewStore};
use revloop_core::types::{ReviewEvent, SessionId};

/// Drives review sessions through generate → suspend → decide.
///
/// Nothing is held between calls: every `start` or `resume` runs to the next
/// suspension point, saves the session, and returns. Resumes on one session
/// are serialized; different sessions run concurrently.
pub struct ReviewOrchestrator {
    generator: Arc<dyn Generator>,
    store: Arc<dyn ReviewStore>,
    event_bus: Arc<EventBus>,
    policy: ReviewPolicy,
    session_ttl_secs: Option<u64>,
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReviewOrchestrator {
    pub fn new(
        generator: Arc<dyn Generator>,
        store: Arc<dyn ReviewStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            generator,
            store,
            event_bus,
            policy: ReviewPolicy::default(),
            session_ttl_secs: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: ReviewPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sessions idle for longer than `ttl_secs` are treated as unknown.
    pub fn with_session_ttl(mut self, ttl_secs: Option<u64>) -> Self {
        self.session_ttl_secs = ttl_secs;
        self
    }

    pub fn policy(&self) -> &ReviewPolicy {
        &self.policy
    }

    pub fn session_ttl_secs(&self) -> Option<u64> {
        self.session_ttl_secs
    }

    /// Create a session for `input` and produce its first candidate.
    pub async fn start(&self, input: &str) -> Result<SessionSnapshot> {
        self.start_with_id(SessionId::new(), input).await
    }

    /// Like [`start`](Self::start) with a caller-chosen session id. An id
    /// whose session has expired may be reused.
    pub async fn start_with_id(&self, session_id: SessionId, input: &str) -> Result<SessionSnapshot> {
        if input.trim().is_empty() {
            return Err(RevloopError::InvalidInput("input is empty".into()));
        }

        let lock = self.session_lock(&session_id);
        let result = {
            let _guard = lock.lock().await;
            self.start_locked(&session_id, input).await
        };
        self.release_lock(&session_id, lock);
        result
    }

    async fn start_locked(&self, session_id: &SessionId, input: &str) -> Result<SessionSnapshot> {
        match self.load_live(session_id).await {
            Ok(_) => {
                return Err(RevloopError::InvalidInput(format!(
                    "session {} already exists",
                    session_id
                )))
            }
            Err(RevloopError::UnknownSession(_)) => {}
            Err(e) => return Err(e),
        }

        let mut session = ReviewSession::new(session_id.clone(), input);
        let candidate = self.generate(session_id, input, "").await?;
        session.apply_initial(candidate);
        self.store.save(&session).await?;

        info!(session_id = %session_id, attempt = session.attempt, "Review session started");
        self.event_bus.publish(ReviewEvent::SessionStarted {
            session_id: session_id.clone(),
        });
        self.event_bus.publish(ReviewEvent::CandidateGenerated {
            session_id: session_id.clone(),
            attempt: session.attempt,
        });

        Ok(session.snapshot())
    }

    /// Inject an external decision into a suspended session.
    ///
    /// `decision` must be `approve` or `reject`; `feedback` only matters for
    /// `reject` and is appended to earlier feedback. If another process saved
    /// the session first, the call fails with `SessionConflict` and the
    /// stored session is left as that process wrote it.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        decision: &str,
        feedback: Option<&str>,
    ) -> Result<SessionSnapshot> {
        let verdict: Verdict = decision.parse()?;

        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.resume_locked(session_id, verdict, decision, feedback).await
        };
        self.release_lock(session_id, lock);
        result
    }

    async fn resume_locked(
        &self,
        session_id: &SessionId,
        verdict: Verdict,
        decision: &str,
        feedback: Option<&str>,
    ) -> Result<SessionSnapshot> {
        let mut session = self.load_live(session_id).await?;
        let transition = match session.plan(verdict, feedback, &self.policy) {
            Ok(t) => t,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Resume refused");
                return Err(e);
            }
        };

        let decision = decision.trim().to_ascii_lowercase();
        info!(
            session_id = %session_id,
            decision = %decision,
            attempt = session.attempt,
            "Review decision received"
        );
        self.event_bus.publish(ReviewEvent::DecisionRecorded {
            session_id: session_id.clone(),
            decision,
            attempt: session.attempt,
        });

        match transition {
            Transition::Approve => {
                session.apply_approval();
                self.store.save(&session).await?;
                info!(session_id = %session_id, attempt = session.attempt, "Response approved");
                self.event_bus.publish(ReviewEvent::Approved {
                    session_id: session_id.clone(),
                    attempt: session.attempt,
                });
            }
            Transition::Regenerate { feedback } => {
                let prompt_feedback = join_feedback(&feedback);
                let candidate = self
                    .generate(session_id, &session.input, &prompt_feedback)
                    .await?;
                session.apply_revision(feedback, candidate);
                self.store.save(&session).await?;
                info!(session_id = %session_id, attempt = session.attempt, "Revised candidate generated");
                self.event_bus.publish(ReviewEvent::CandidateGenerated {
                    session_id: session_id.clone(),
                    attempt: session.attempt,
                });
            }
            Transition::FinalReject => {
                session.apply_final_rejection(&self.policy);
                self.store.save(&session).await?;
                info!(session_id = %session_id, attempt = session.attempt, "Final rejection");
                self.event_bus.publish(ReviewEvent::FinalRejected {
                    session_id: session_id.clone(),
                    attempt: session.attempt,
                });
            }
        }

        Ok(session.snapshot())
    }

    /// Current state of a session without changing it.
    pub async fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot> {
        Ok(self.load_live(session_id).await?.snapshot())
    }

    /// All live sessions, most recently updated first.
    pub async fn list(&self) -> Result<Vec<SessionSnapshot>> {
        let now = Utc::now();
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| !s.is_expired(self.session_ttl_secs, now))
            .map(|s| s.snapshot())
            .collect())
    }

    /// Drop a session regardless of its state. Waits for a resume already
    /// running on the session to finish first.
    pub async fn discard(&self, session_id: &SessionId) -> Result<()> {
        let lock = self.session_lock(session_id);
        let deleted = {
            let _guard = lock.lock().await;
            self.store.delete(session_id).await
        };
        self.release_lock(session_id, lock);

        if !deleted? {
            return Err(RevloopError::UnknownSession(session_id.to_string()));
        }
        info!(session_id = %session_id, "Review session discarded");
        Ok(())
    }

    /// Delete every expired session. Returns how many were removed.
    ///
    /// Sessions with a call in flight are skipped; that call refreshes them.
    pub async fn purge_expired(&self) -> Result<usize> {
        if self.session_ttl_secs.is_none() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut purged = 0;
        for session in self.store.list().await? {
            if !session.is_expired(self.session_ttl_secs, now) {
                continue;
            }
            let session_id = session.session_id;
            let lock = self.session_lock(&session_id);
            let removed = match lock.try_lock() {
                Ok(_guard) => self.delete_if_expired(&session_id).await,
                Err(_) => {
                    debug!(session_id = %session_id, "Session busy, not purging");
                    Ok(false)
                }
            };
            self.release_lock(&session_id, lock);
            if removed? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "Expired review sessions purged");
        }
        Ok(purged)
    }

    async fn delete_if_expired(&self, session_id: &SessionId) -> Result<bool> {
        match self.store.load(session_id).await? {
            Some(s) if s.is_expired(self.session_ttl_secs, Utc::now()) => {
                self.store.delete(session_id).await
            }
            _ => Ok(false),
        }
    }

    async fn generate(&self, session_id: &SessionId, input: &str, feedback: &str) -> Result<String> {
        match self.generator.generate(input, feedback).await {
            Ok(text) if !text.trim().is_empty() => Ok(text),
            Ok(_) => Err(self.generation_failed(session_id, "generator returned an empty response".into())),
            Err(e) => {
                let message = match e {
                    RevloopError::GenerationFailure(msg) => msg,
                    other => other.to_string(),
                };
                Err(self.generation_failed(session_id, message))
            }
        }
    }

    fn generation_failed(&self, session_id: &SessionId, message: String) -> RevloopError {
        warn!(session_id = %session_id, error = %message, "Generation failed, session unchanged");
        self.event_bus.publish(ReviewEvent::GenerationFailed {
            session_id: session_id.clone(),
            error: message.clone(),
        });
        RevloopError::GenerationFailure(message)
    }

    async fn load_live(&self, session_id: &SessionId) -> Result<ReviewSession> {
        let session = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| RevloopError::UnknownSession(session_id.to_string()))?;

        if session.is_expired(self.session_ttl_secs, Utc::now()) {
            debug!(session_id = %session_id, "Session expired");
            self.store.delete(session_id).await?;
            return Err(RevloopError::UnknownSession(session_id.to_string()));
        }
        Ok(session)
    }

    /// The map only holds locks some call is using. Entries left behind by a
    /// cancelled call have no other holder and are dropped here.
    fn session_lock(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(session_id.clone()).or_default().clone()
    }

    fn release_lock(&self, session_id: &SessionId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks
            .get(session_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryReviewStore;
    use revloop_core::review::{Decision, ReviewStatus};
    use revloop_test_utils::ScriptedGenerator;

    struct Harness {
        gen: Arc<ScriptedGenerator>,
        store: Arc<MemoryReviewStore>,
        bus: Arc<EventBus>,
        orch: ReviewOrchestrator,
    }

    fn harness(outputs: &[&str]) -> Harness {
        let gen = Arc::new(ScriptedGenerator::new(outputs));
        let store = Arc::new(MemoryReviewStore::new());
        let bus = Arc::new(EventBus::default());
        let orch = ReviewOrchestrator::new(gen.clone(), store.clone(), bus.clone());
        Harness {
            gen,
            store,
            bus,
            orch,
        }
    }

    /// Backdate a stored session by `secs`.
    async fn age(store: &MemoryReviewStore, id: &SessionId, secs: i64) {
        let mut stale = store.load(id).await.unwrap().unwrap();
        stale.updated_at = Utc::now() - chrono::Duration::seconds(secs);
        stale.version += 1;
        store.save(&stale).await.unwrap();
    }

    #[tokio::test]
    async fn start_generates_first_candidate() {
        let h = harness(&["draft 1"]);
        let snap = h.orch.start("Write a haiku").await.unwrap();
        assert_eq!(snap.candidate, "draft 1");
        assert_eq!(snap.attempt, 1);
        assert_eq!(snap.decision, Decision::Unset);
        assert_eq!(snap.status, ReviewStatus::AwaitingDecision);
        assert!(!snap.terminal);
        assert_eq!(h.gen.calls(), vec![("Write a haiku".to_string(), String::new())]);
    }

    #[tokio::test]
    async fn empty_input_rejected() {
        let h = harness(&["x"]);
        assert!(matches!(
            h.orch.start("   ").await,
            Err(RevloopError::InvalidInput(_))
        ));
        assert!(h.gen.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_start_creates_no_session() {
        let h = harness(&[]);
        h.gen.push_err("503 from provider");
        let err = h.orch.start("hello").await.unwrap_err();
        assert!(matches!(err, RevloopError::GenerationFailure(_)));
        assert!(h.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reject_then_approve() {
        let h = harness(&["first", "second"]);
        let snap = h.orch.start("q").await.unwrap();
        let id = snap.session_id;

        let snap = h.orch.resume(&id, "reject", Some("more detail")).await.unwrap();
        assert_eq!(snap.decision, Decision::Regenerate);
        assert_eq!(snap.attempt, 2);
        assert!(!snap.terminal);

        let snap = h.orch.resume(&id, "approve", None).await.unwrap();
        assert_eq!(snap.status, ReviewStatus::Approved);
        assert_eq!(snap.decision, Decision::Approve);
        assert_eq!(snap.attempt, 2);
        assert_eq!(snap.candidate, "second");
        assert!(snap.terminal);
    }

    #[tokio::test]
    async fn three_rejections_are_final() {
        let h = harness(&["g1", "g2", "g3", "g4"]);
        let id = h.orch.start("q").await.unwrap().session_id;

        h.orch.resume(&id, "reject", None).await.unwrap();
        h.orch.resume(&id, "reject", None).await.unwrap();
        let snap = h.orch.resume(&id, "reject", None).await.unwrap();

        assert_eq!(snap.status, ReviewStatus::FinalRejected);
        assert_eq!(snap.candidate, "Final rejection after 3 attempts.");
        assert_eq!(snap.attempt, 4);
        assert_eq!(snap.decision, Decision::Reject);
        // initial + two regenerations reached the model
        assert_eq!(h.gen.calls().len(), 3);
    }

    #[tokio::test]
    async fn feedback_accumulates_across_rejections() {
        let h = harness(&["g1", "g2", "g3"]);
        let id = h.orch.start("Explain traits").await.unwrap().session_id;

        h.orch.resume(&id, "reject", Some("shorten it")).await.unwrap();
        h.orch
            .resume(&id, "reject", Some("add an example"))
            .await
            .unwrap();

        let calls = h.gen.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].1, "shorten it");
        assert_eq!(calls[2].1, "shorten it\nadd an example");
        assert_eq!(calls[2].0, "Explain traits");
    }

    #[tokio::test]
    async fn invalid_decision_leaves_session_untouched() {
        let h = harness(&["g1"]);
        let before = h.orch.start("q").await.unwrap();

        let err = h
            .orch
            .resume(&before.session_id, "maybe", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RevloopError::InvalidDecision(d) if d == "maybe"));

        let after = h.orch.snapshot(&before.session_id).await.unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn unknown_session() {
        let h = harness(&[]);
        let err = h
            .orch
            .resume(&SessionId::from_string("nope"), "approve", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RevloopError::UnknownSession(id) if id == "nope"));
    }

    #[tokio::test]
    async fn terminal_resume_is_a_noop() {
        let h = harness(&["g1"]);
        let id = h.orch.start("q").await.unwrap().session_id;
        let approved = h.orch.resume(&id, "approve", None).await.unwrap();

        for decision in ["approve", "reject"] {
            let err = h.orch.resume(&id, decision, Some("again")).await.unwrap_err();
            match err {
                RevloopError::TerminalSession { snapshot, .. } => assert_eq!(*snapshot, approved),
                other => panic!("expected TerminalSession, got {:?}", other),
            }
        }
        assert_eq!(h.orch.snapshot(&id).await.unwrap(), approved);
        assert_eq!(h.gen.calls().len(), 1);
    }

    #[tokio::test]
    async fn generation_failure_on_revision_keeps_prior_state() {
        let h = harness(&["g1"]);
        let before = h.orch.start("q").await.unwrap();
        h.gen.push_err("rate limited");

        let err = h
            .orch
            .resume(&before.session_id, "reject", Some("try again"))
            .await
            .unwrap_err();
        assert!(matches!(err, RevloopError::GenerationFailure(m) if m == "rate limited"));

        let stored = h.store.load(&before.session_id).await.unwrap().unwrap();
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.candidate, "g1");
        assert!(stored.feedback.is_empty());
        assert_eq!(stored.decision, Decision::Unset);

        // a later retry of the same decision goes through
        h.gen.push_ok("g2");
        let snap = h
            .orch
            .resume(&before.session_id, "reject", Some("try again"))
            .await
            .unwrap();
        assert_eq!(snap.attempt, 2);
        assert_eq!(h.gen.calls().last().unwrap().1, "try again");
    }

    #[tokio::test]
    async fn empty_generation_is_a_failure() {
        let h = harness(&["  "]);
        assert!(matches!(
            h.orch.start("q").await,
            Err(RevloopError::GenerationFailure(_))
        ));
    }

    #[tokio::test]
    async fn attempt_never_exceeds_cap_plus_one() {
        for cap in 1..=5u32 {
            let outputs: Vec<String> = (0..cap + 2).map(|i| format!("g{}", i)).collect();
            let refs: Vec<&str> = outputs.iter().map(|s| s.as_str()).collect();
            let h = harness(&refs);
            let orch = h.orch.with_policy(ReviewPolicy::new(cap));
            let id = orch.start("q").await.unwrap().session_id;

            let mut last = orch.snapshot(&id).await.unwrap();
            while !last.terminal {
                last = orch.resume(&id, "reject", Some("no")).await.unwrap();
                assert!(last.attempt <= cap + 1);
            }
            assert_eq!(last.attempt, cap + 1);
            assert_eq!(last.status, ReviewStatus::FinalRejected);
        }
    }

    #[tokio::test]
    async fn events_published_in_order() {
        let h = harness(&["g1"]);
        let mut rx = h.bus.subscribe();
        let id = h.orch.start("q").await.unwrap().session_id;
        h.orch.resume(&id, "approve", None).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(match ev {
                ReviewEvent::SessionStarted { .. } => "started",
                ReviewEvent::CandidateGenerated { .. } => "candidate",
                ReviewEvent::DecisionRecorded { .. } => "decision",
                ReviewEvent::Approved { .. } => "approved",
                ReviewEvent::FinalRejected { .. } => "rejected",
                ReviewEvent::GenerationFailed { .. } => "failed",
            });
        }
        assert_eq!(kinds, vec!["started", "candidate", "decision", "approved"]);
    }

    #[tokio::test]
    async fn expired_sessions_are_unknown() {
        let h = harness(&["g1", "g2"]);
        let orch = h.orch.with_session_ttl(Some(60));
        let id = orch.start("q").await.unwrap().session_id;

        age(&h.store, &id, 120).await;

        assert!(orch.list().await.unwrap().is_empty());
        assert!(matches!(
            orch.resume(&id, "approve", None).await,
            Err(RevloopError::UnknownSession(_))
        ));
        assert!(h.store.load(&id).await.unwrap().is_none());

        let fresh = orch.start("q2").await.unwrap().session_id;
        age(&h.store, &fresh, 120).await;
        assert_eq!(orch.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn discard_removes_session() {
        let h = harness(&["g1"]);
        let id = h.orch.start("q").await.unwrap().session_id;
        h.orch.discard(&id).await.unwrap();
        assert!(matches!(
            h.orch.discard(&id).await,
            Err(RevloopError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_session_id_rejected() {
        let h = harness(&["g1", "g2"]);
        let id = SessionId::from_string("user-123");
        h.orch.start_with_id(id.clone(), "q").await.unwrap();
        assert!(matches!(
            h.orch.start_with_id(id, "q").await,
            Err(RevloopError::InvalidInput(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sessions_are_independent() {
        let gen = Arc::new(ScriptedGenerator::new(&[]));
        for i in 0..16 {
            gen.push_ok(&format!("out {}", i));
        }
        let orch = Arc::new(ReviewOrchestrator::new(
            gen.clone(),
            Arc::new(MemoryReviewStore::new()),
            Arc::new(EventBus::default()),
        ));

        let mut handles = Vec::new();
        for i in 0..8 {
            let orch = orch.clone();
            handles.push(tokio::spawn(async move {
                let id = orch.start(&format!("input {}", i)).await.unwrap().session_id;
                orch.resume(&id, "reject", Some(&format!("fb {}", i)))
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            let snap = h.await.unwrap();
            assert_eq!(snap.attempt, 2);
            assert_eq!(snap.decision, Decision::Regenerate);
        }

        let calls = gen.calls();
        assert_eq!(calls.len(), 16);
        for (input, feedback) in calls.iter().filter(|(_, f)| !f.is_empty()) {
            let n = input.trim_start_matches("input ");
            assert_eq!(feedback, &format!("fb {}", n));
        }
    }

    #[tokio::test]
    async fn lock_map_is_empty_between_calls() {
        let h = harness(&[]);
        let orch = h.orch.with_session_ttl(Some(60));
        let id = SessionId::from_string("tracked");

        h.gen.push_err("provider down");
        assert!(orch.start_with_id(id.clone(), "q").await.is_err());
        assert!(orch
            .resume(&SessionId::from_string("missing"), "approve", None)
            .await
            .is_err());
        assert_eq!(orch.tracked_locks(), 0);

        h.gen.push_ok("g1");
        orch.start_with_id(id.clone(), "q").await.unwrap();
        assert!(orch.start_with_id(id.clone(), "q").await.is_err());
        h.gen.push_err("rate limited");
        assert!(orch.resume(&id, "reject", Some("again")).await.is_err());
        orch.resume(&id, "approve", None).await.unwrap();
        assert!(orch.resume(&id, "approve", None).await.is_err());
        assert_eq!(orch.purge_expired().await.unwrap(), 0);
        assert_eq!(orch.tracked_locks(), 0);

        orch.discard(&id).await.unwrap();
        assert!(orch.discard(&id).await.is_err());
        assert_eq!(orch.tracked_locks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_does_not_leak_its_lock() {
        let gen = Arc::new(
            ScriptedGenerator::new(&["g1"]).with_delay(std::time::Duration::from_secs(5)),
        );
        let orch = ReviewOrchestrator::new(
            gen,
            Arc::new(MemoryReviewStore::new()),
            Arc::new(EventBus::default()),
        );
        let abandoned = tokio::time::timeout(std::time::Duration::from_secs(1), orch.start("q")).await;
        assert!(abandoned.is_err());
        assert_eq!(orch.tracked_locks(), 1);

        assert!(orch
            .resume(&SessionId::from_string("other"), "approve", None)
            .await
            .is_err());
        assert_eq!(orch.tracked_locks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_waits_for_running_resume() {
        let gen = Arc::new(
            ScriptedGenerator::new(&["g1", "g2"]).with_delay(std::time::Duration::from_millis(300)),
        );
        let store = Arc::new(MemoryReviewStore::new());
        let orch = Arc::new(ReviewOrchestrator::new(
            gen,
            store.clone(),
            Arc::new(EventBus::default()),
        ));
        let id = orch.start("q").await.unwrap().session_id;

        let resuming = {
            let orch = orch.clone();
            let id = id.clone();
            tokio::spawn(async move { orch.resume(&id, "reject", Some("again")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        orch.discard(&id).await.unwrap();

        assert_eq!(resuming.await.unwrap().unwrap().attempt, 2);
        assert!(store.load(&id).await.unwrap().is_none());
        assert_eq!(orch.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn purge_skips_busy_sessions() {
        let h = harness(&["g1"]);
        let orch = h.orch.with_session_ttl(Some(60));
        let id = orch.start("q").await.unwrap().session_id;
        age(&h.store, &id, 120).await;

        let lock = orch.session_lock(&id);
        {
            let _busy = lock.lock().await;
            assert_eq!(orch.purge_expired().await.unwrap(), 0);
            assert!(h.store.load(&id).await.unwrap().is_some());
        }
        orch.release_lock(&id, lock);

        assert_eq!(orch.purge_expired().await.unwrap(), 1);
        assert!(h.store.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_id_can_be_reused() {
        let h = harness(&["old", "new"]);
        let orch = h.orch.with_session_ttl(Some(60));
        let id = SessionId::from_string("reused");
        orch.start_with_id(id.clone(), "first").await.unwrap();
        age(&h.store, &id, 120).await;

        let snap = orch.start_with_id(id.clone(), "second").await.unwrap();
        assert_eq!(snap.candidate, "new");
        assert_eq!(snap.attempt, 1);
        assert_eq!(h.store.load(&id).await.unwrap().unwrap().input, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_writer_wins_and_stale_resume_fails() {
        let store = Arc::new(MemoryReviewStore::new());
        let slow = ReviewOrchestrator::new(
            Arc::new(
                ScriptedGenerator::new(&["g1", "g2"])
                    .with_delay(std::time::Duration::from_millis(300)),
            ),
            store.clone(),
            Arc::new(EventBus::default()),
        );
        // a second orchestrator on the same store stands in for another process
        let other = ReviewOrchestrator::new(
            Arc::new(ScriptedGenerator::new(&[])),
            store.clone(),
            Arc::new(EventBus::default()),
        );
        let id = slow.start("q").await.unwrap().session_id;

        let (stale, approved) = tokio::join!(slow.resume(&id, "reject", Some("more")), async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            other.resume(&id, "approve", None).await
        });
        assert_eq!(approved.unwrap().status, ReviewStatus::Approved);
        assert!(matches!(stale, Err(RevloopError::SessionConflict(_))));

        let stored = store.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReviewStatus::Approved);
        assert_eq!(stored.candidate, "g1");
    }
}
