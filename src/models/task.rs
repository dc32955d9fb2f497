//! Outcome of a curation-style task.

use serde::Serialize;
use std::fmt;

/// Status reported by every task.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Fail,
    Skip,
    Unset,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStatus::Success => "success",
            TaskStatus::Fail => "fail",
            TaskStatus::Skip => "skip",
            TaskStatus::Unset => "unset",
        };
        f.write_str(text)
    }
}

/// A status code plus a short human-readable result line.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub result: String,
}

impl TaskOutcome {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            result: result.into(),
        }
    }

    pub fn fail(result: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Fail,
            result: result.into(),
        }
    }

    pub fn skip(result: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Skip,
            result: result.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// Tri-state result of an integrity audit.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Match,
    Mismatch,
    Missing,
}
