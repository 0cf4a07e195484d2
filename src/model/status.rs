//! Status state machines for Jobs, Images and Resources.
//!
//! Job and Image statuses each expose a total transition function: every
//! `(from, to)` pair is either allowed or rejected with a [`TransitionError`].
//! Resource status has no transition function at all; it is only ever
//! produced by [`ResourceStatus::aggregate`] over the statuses of its Images.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ParseStatusError, TransitionError};

// =============================================================================
// Job Status
// =============================================================================

/// Lifecycle of one Job (an attempt-sequence converting a single Image).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, not yet picked up by a worker
    Waiting,
    /// A worker is executing an attempt
    Active,
    /// Last attempt succeeded
    Completed,
    /// Last attempt failed
    Failed,
}

impl JobStatus {
    /// All job statuses, in lifecycle order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// `completed` and `failed` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// - `waiting -> active`: a worker picked the job up
    /// - `waiting -> failed`: the attempt failed before activation
    /// - `active -> completed | failed`: attempt outcome
    /// - `active -> waiting`: requeue of work orphaned by a crashed worker
    /// - `failed -> active`: retry attempt
    /// - `failed | completed -> waiting`: re-dispatch
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Waiting, Active)
                | (Waiting, Failed)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Waiting)
                | (Failed, Active)
                | (Failed, Waiting)
                | (Completed, Waiting)
        )
    }

    /// Apply a transition, rejecting illegal ones.
    pub fn transition(self, next: JobStatus) -> Result<JobStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                entity: "job",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError {
                entity: "job",
                value: s.to_string(),
            })
    }
}

// =============================================================================
// Image Status
// =============================================================================

/// Lifecycle of one uploaded Image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// Upload stored, conversion not started
    Uploaded,
    /// Conversion in progress
    Processing,
    /// Converted; output path and dimensions are known
    Ready,
    /// Last conversion attempt failed
    Failed,
}

impl ImageStatus {
    pub const ALL: [ImageStatus; 4] = [
        ImageStatus::Uploaded,
        ImageStatus::Processing,
        ImageStatus::Ready,
        ImageStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImageStatus::Uploaded => "uploaded",
            ImageStatus::Processing => "processing",
            ImageStatus::Ready => "ready",
            ImageStatus::Failed => "failed",
        }
    }

    /// `ready` and `failed` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, ImageStatus::Ready | ImageStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `ready` is final: a converted Image never re-enters processing, which
    /// is what makes the ledger credit for it happen exactly once.
    pub fn can_transition_to(self, next: ImageStatus) -> bool {
        use ImageStatus::*;
        matches!(
            (self, next),
            (Uploaded, Processing)
                | (Uploaded, Failed)
                | (Processing, Ready)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }

    pub fn transition(self, next: ImageStatus) -> Result<ImageStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                entity: "image",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError {
                entity: "image",
                value: s.to_string(),
            })
    }
}

// =============================================================================
// Resource Status
// =============================================================================

/// Aggregate status of a Resource, derived from its Images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Processing,
    Ready,
    Failed,
}

impl ResourceStatus {
    pub const ALL: [ResourceStatus; 3] = [
        ResourceStatus::Processing,
        ResourceStatus::Ready,
        ResourceStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::Processing => "processing",
            ResourceStatus::Ready => "ready",
            ResourceStatus::Failed => "failed",
        }
    }

    /// Recompute a Resource's status from its Images' statuses.
    ///
    /// - every Image terminal, none failed -> `ready`
    /// - every Image terminal, at least one failed -> `failed`
    /// - otherwise -> `processing`
    ///
    /// The result depends only on the multiset of statuses, never on order.
    /// A Resource with no Images has nothing to present and aggregates to
    /// `failed`.
    pub fn aggregate<I>(statuses: I) -> ResourceStatus
    where
        I: IntoIterator<Item = ImageStatus>,
    {
        let mut seen_any = false;
        let mut any_failed = false;

        for status in statuses {
            seen_any = true;
            match status {
                ImageStatus::Uploaded | ImageStatus::Processing => {
                    return ResourceStatus::Processing
                }
                ImageStatus::Failed => any_failed = true,
                ImageStatus::Ready => {}
            }
        }

        if !seen_any || any_failed {
            ResourceStatus::Failed
        } else {
            ResourceStatus::Ready
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError {
                entity: "resource",
                value: s.to_string(),
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
