//! Thread state
//!
//! The persisted record of one execution run, and the pure transition
//! function that governs its status.
//!
//! ```text
//!   Pending --start--> Running --pause--> Paused
//!                        ^                  |
//!                        +-----resume-------+
//!   Running/Paused --cancel--> Cancelled
//!   Running --last step ok--> Completed
//!   Running --step error----> Failed
//! ```

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::Shareable;
use crate::error::{Error, Result};
use crate::schema::{AccessLevel, ExecutionPlan, Schema};

use super::accumulator::{OutputAccumulator, OutputEntry};
use super::conductor::ConductorSummary;

// ─────────────────────────────────────────────────────────────────
// Status & Commands
// ─────────────────────────────────────────────────────────────────

/// Lifecycle status of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ThreadStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ThreadStatus {
    /// Completed, Failed and Cancelled are permanent
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ThreadStatus::Completed | ThreadStatus::Failed | ThreadStatus::Cancelled
        )
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadStatus::Pending => "Pending",
            ThreadStatus::Running => "Running",
            ThreadStatus::Paused => "Paused",
            ThreadStatus::Completed => "Completed",
            ThreadStatus::Failed => "Failed",
            ThreadStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// User command applied to a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCommand {
    Start,
    Pause,
    Resume,
    Cancel,
}

impl fmt::Display for ThreadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadCommand::Start => "start",
            ThreadCommand::Pause => "pause",
            ThreadCommand::Resume => "resume",
            ThreadCommand::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// Apply a command to a status
pub fn transition(status: ThreadStatus, command: ThreadCommand) -> Result<ThreadStatus> {
    use ThreadCommand::*;
    use ThreadStatus::*;

    match (status, command) {
        (Pending, Start) => Ok(Running),
        (Running, Pause) => Ok(Paused),
        (Paused, Resume) => Ok(Running),
        (Running | Paused, Cancel) => Ok(Cancelled),
        (from, command) => Err(Error::invalid_transition(from, command)),
    }
}

/// Signal read by a thread's driver at every step boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
    #[default]
    Run,
    Pause,
    Cancel,
}

/// Status a thread will be in once its driver honours `control`.
///
/// Commands are checked against this rather than the last published status,
/// so a pause that has not reached a step boundary yet still counts.
pub fn effective_status(status: ThreadStatus, control: Control) -> ThreadStatus {
    match (status, control) {
        (s, _) if s.is_terminal() => s,
        (ThreadStatus::Running | ThreadStatus::Paused, Control::Cancel) => ThreadStatus::Cancelled,
        (ThreadStatus::Running, Control::Pause) => ThreadStatus::Paused,
        (ThreadStatus::Paused, Control::Run) => ThreadStatus::Running,
        (s, _) => s,
    }
}

// ─────────────────────────────────────────────────────────────────
// Failure
// ─────────────────────────────────────────────────────────────────

/// What moved a thread to Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// A model call failed; the error entry is in the output log
    Invocation,
    /// The thread record could not be persisted
    Storage,
    /// The engine hit an inconsistency it could not recover from
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadFailure {
    pub kind: FailureKind,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────
// Thread
// ─────────────────────────────────────────────────────────────────

/// One execution run of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub schema_id: String,
    pub owner: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub allowed_users: BTreeSet<String>,
    pub status: ThreadStatus,
    pub plan: ExecutionPlan,
    pub cursor: usize,
    pub outputs: OutputAccumulator,
    #[serde(default)]
    pub conductor_model: Option<String>,
    #[serde(default)]
    pub conductor_summaries: Vec<ConductorSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ThreadFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    /// New Pending thread owned by `owner`, private to them
    pub fn new(owner: impl Into<String>, schema: &Schema, plan: ExecutionPlan) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            schema_id: schema.id.clone(),
            owner: owner.into(),
            access_level: AccessLevel::Private,
            allowed_users: BTreeSet::new(),
            status: ThreadStatus::Pending,
            plan,
            cursor: 0,
            outputs: OutputAccumulator::new(),
            conductor_model: None,
            conductor_summaries: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a user command
    pub fn apply(&mut self, command: ThreadCommand) -> Result<()> {
        self.status = transition(self.status, command)?;
        if command == ThreadCommand::Start {
            self.cursor = 0;
            if self.plan.is_empty() {
                self.status = ThreadStatus::Completed;
            }
        }
        self.touch();
        Ok(())
    }

    /// Record a successful step and advance the cursor
    pub fn record_success(&mut self, entry: OutputEntry) -> Result<()> {
        self.expect_running()?;
        self.outputs.append(entry)?;
        self.cursor += 1;
        if self.cursor == self.plan.len() {
            self.status = ThreadStatus::Completed;
        }
        self.touch();
        Ok(())
    }

    /// Record a failed step; the cursor stays on the failed step
    pub fn record_failure(&mut self, entry: OutputEntry) -> Result<()> {
        self.expect_running()?;
        let message = entry.error.clone().unwrap_or_default();
        self.outputs.append(entry)?;
        self.status = ThreadStatus::Failed;
        self.failure = Some(ThreadFailure {
            kind: FailureKind::Invocation,
            message,
        });
        self.touch();
        Ok(())
    }

    /// Fail a thread for a reason outside the plan. Outputs are kept.
    pub fn mark_failed(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.status = ThreadStatus::Failed;
        self.failure = Some(ThreadFailure {
            kind,
            message: message.into(),
        });
        self.touch();
    }

    fn expect_running(&self) -> Result<()> {
        if self.status == ThreadStatus::Running {
            Ok(())
        } else {
            Err(Error::invalid_transition(self.status, "record a step for"))
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Shareable for Thread {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn access_level(&self) -> AccessLevel {
        self.access_level
    }

    fn allowed_users(&self) -> &BTreeSet<String> {
        &self.allowed_users
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
