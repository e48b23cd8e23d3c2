//! Review session data model and the approval state machine.
//!
//! A session is plain data. The orchestrator loads it, asks [`ReviewSession::plan`]
//! what a decision means, performs any generation the plan calls for, and
//! commits the outcome with one of the `apply_*` methods before saving it back.
//! Nothing in here talks to the model or to storage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RevloopError};
use crate::types::SessionId;

/// Last review outcome recorded on a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[default]
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "approve")]
    Approve,
    #[serde(rename = "reject")]
    Reject,
    /// Transient: a revision cycle was triggered by feedback.
    #[serde(rename = "regenerate")]
    Regenerate,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Regenerate => "regenerate",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = RevloopError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(Self::Unset),
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "regenerate" => Ok(Self::Regenerate),
            other => Err(RevloopError::Database(format!(
                "unknown decision '{}'",
                other
            ))),
        }
    }
}

/// A decision supplied by the external reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject,
}

impl FromStr for Verdict {
    type Err = RevloopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            _ => Err(RevloopError::InvalidDecision(s.to_string())),
        }
    }
}

/// Where a session sits in the review state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    AwaitingDecision,
    Approved,
    FinalRejected,
}

impl ReviewStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::FinalRejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingDecision => "awaiting_decision",
            Self::Approved => "approved",
            Self::FinalRejected => "final_rejected",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = RevloopError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "awaiting_decision" => Ok(Self::AwaitingDecision),
            "approved" => Ok(Self::Approved),
            "final_rejected" => Ok(Self::FinalRejected),
            other => Err(RevloopError::Database(format!(
                "unknown review status '{}'",
                other
            ))),
        }
    }
}

/// Attempt cap for the review loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewPolicy {
    /// A rejection arriving at `attempt >= max_attempts` is final.
    pub max_attempts: u32,
}

impl ReviewPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Candidate text recorded when a session is finally rejected.
    pub fn rejection_message(&self) -> String {
        format!("Final rejection after {} attempts.", self.max_attempts)
    }
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// What a decision means for a session, before any generation happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Approve,
    /// Regenerate with the merged feedback list.
    Regenerate { feedback: Vec<String> },
    FinalReject,
}

/// The unit of work flowing through the review loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSession {
    pub session_id: SessionId,
    pub input: String,
    pub candidate: String,
    pub feedback: Vec<String>,
    pub attempt: u32,
    pub decision: Decision,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by every mutation. Stores refuse a save whose predecessor is
    /// not the stored version.
    #[serde(default)]
    pub version: u64,
}

impl ReviewSession {
    pub fn new(session_id: SessionId, input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            input: input.into(),
            candidate: String::new(),
            feedback: Vec::new(),
            attempt: 0,
            decision: Decision::Unset,
            status: ReviewStatus::AwaitingDecision,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Decide what `verdict` does to this session.
    ///
    /// Fails with `TerminalSession` once approved or final-rejected.
    pub fn plan(
        &self,
        verdict: Verdict,
        feedback: Option<&str>,
        policy: &ReviewPolicy,
    ) -> Result<Transition> {
        if self.status.is_terminal() {
            return Err(RevloopError::TerminalSession {
                session_id: self.session_id.to_string(),
                snapshot: Box::new(self.snapshot()),
            });
        }

        match verdict {
            Verdict::Approve => Ok(Transition::Approve),
            Verdict::Reject if self.attempt >= policy.max_attempts => Ok(Transition::FinalReject),
            Verdict::Reject => {
                let mut merged = self.feedback.clone();
                if let Some(comment) = feedback.map(str::trim).filter(|c| !c.is_empty()) {
                    merged.push(comment.to_string());
                }
                Ok(Transition::Regenerate { feedback: merged })
            }
        }
    }

    /// Record the first candidate of a fresh session.
    pub fn apply_initial(&mut self, candidate: String) {
        self.candidate = candidate;
        self.attempt += 1;
        self.touch();
    }

    pub fn apply_approval(&mut self) {
        self.decision = Decision::Approve;
        self.status = ReviewStatus::Approved;
        self.touch();
    }

    /// Commit a regenerated candidate along with the feedback that produced it.
    pub fn apply_revision(&mut self, feedback: Vec<String>, candidate: String) {
        self.feedback = feedback;
        self.candidate = candidate;
        self.attempt += 1;
        self.decision = Decision::Regenerate;
        self.status = ReviewStatus::AwaitingDecision;
        self.touch();
    }

    /// The rejection notice replaces the candidate and counts as the last attempt.
    pub fn apply_final_rejection(&mut self, policy: &ReviewPolicy) {
        self.candidate = policy.rejection_message();
        self.attempt += 1;
        self.decision = Decision::Reject;
        self.status = ReviewStatus::FinalRejected;
        self.touch();
    }

    pub fn is_expired(&self, ttl_secs: Option<u64>, now: DateTime<Utc>) -> bool {
        match ttl_secs {
            Some(ttl) => (now - self.updated_at).num_seconds() >= ttl as i64,
            None => false,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            input: self.input.clone(),
            candidate: self.candidate.clone(),
            attempt: self.attempt,
            decision: self.decision,
            status: self.status,
            terminal: self.status.is_terminal(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

pub fn join_feedback(feedback: &[String]) -> String {
    feedback.join("\n")
}

/// Caller-facing view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub input: String,
    pub candidate: String,
    pub attempt: u32,
    pub decision: Decision,
    pub status: ReviewStatus,
    pub terminal: bool,
}
