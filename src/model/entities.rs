//! Entity records shared by the synchronizer, ledger, store and manifest builder.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{ImageStatus, JobStatus, ResourceStatus};

// =============================================================================
// Enumerated Resource Fields
// =============================================================================

/// Who may read a Resource's manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Visibility::Public),
            "private" => Some(Visibility::Private),
            _ => None,
        }
    }
}

/// Order in which a viewer lays out a Resource's canvases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewingDirection {
    LeftToRight,
    RightToLeft,
    TopToBottom,
    BottomToTop,
}

impl ViewingDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewingDirection::LeftToRight => "left-to-right",
            ViewingDirection::RightToLeft => "right-to-left",
            ViewingDirection::TopToBottom => "top-to-bottom",
            ViewingDirection::BottomToTop => "bottom-to-top",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "left-to-right" => Some(ViewingDirection::LeftToRight),
            "right-to-left" => Some(ViewingDirection::RightToLeft),
            "top-to-bottom" => Some(ViewingDirection::TopToBottom),
            "bottom-to-top" => Some(ViewingDirection::BottomToTop),
            _ => None,
        }
    }
}

// =============================================================================
// Job
// =============================================================================

/// Durable record of the attempt-sequence converting one Image.
///
/// The id is chosen by the dispatcher and survives retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub image_id: String,
    pub status: JobStatus,
    /// Last persisted checkpoint, 0-100
    pub progress: u8,
    pub error: Option<String>,
    /// 1-based number of the current or next attempt
    pub attempt: u32,
    /// When a `waiting` job that failed before may run again
    pub retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A freshly dispatched job that no worker has picked up yet.
    pub fn waiting(id: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image_id: image_id.into(),
            status: JobStatus::Waiting,
            progress: 0,
            error: None,
            attempt: 1,
            retry_at: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Time left before a scheduled retry may run; zero when none is pending
    /// or it is already due.
    pub fn retry_delay(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.retry_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or_default()
    }
}

// =============================================================================
// Image
// =============================================================================

/// One uploaded image belonging to a Resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub resource_id: String,
    pub user_id: String,
    pub original_filename: String,
    pub source_path: PathBuf,
    /// Pyramidal TIFF location, set once conversion succeeds
    pub output_path: Option<PathBuf>,
    /// Upload size in bytes
    pub byte_size: u64,
    /// Output size in bytes, i.e. the amount credited to the ledger on success
    pub output_size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub status: ImageStatus,
    pub job_id: Option<String>,
    pub error_message: Option<String>,
    /// Fixes canvas order in the manifest
    pub order_index: i64,
}

impl Image {
    /// A newly uploaded image awaiting conversion.
    pub fn uploaded(
        id: impl Into<String>,
        resource_id: impl Into<String>,
        user_id: impl Into<String>,
        original_filename: impl Into<String>,
        source_path: impl Into<PathBuf>,
        byte_size: u64,
        order_index: i64,
    ) -> Self {
        Self {
            id: id.into(),
            resource_id: resource_id.into(),
            user_id: user_id.into(),
            original_filename: original_filename.into(),
            source_path: source_path.into(),
            output_path: None,
            byte_size,
            output_size: None,
            width: None,
            height: None,
            status: ImageStatus::Uploaded,
            job_id: None,
            error_message: None,
            order_index,
        }
    }

    /// Measured dimensions, if both are known.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }

    /// Bytes this image holds against its owner's quota.
    pub fn ledger_footprint(&self) -> u64 {
        self.byte_size.saturating_add(self.output_size.unwrap_or(0))
    }
}

// =============================================================================
// Resource
// =============================================================================

/// A user-owned, ordered collection of Images exposed as one manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub attribution: Option<String>,
    /// Rights statement URL
    pub license: Option<String>,
    /// Stored JSON list of `{"label": ..., "value": ...}` pairs
    pub metadata: Option<String>,
    pub status: ResourceStatus,
    pub visibility: Visibility,
    pub homepage: Option<String>,
    pub viewing_direction: Option<ViewingDirection>,
}

impl Resource {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: title.into(),
            description: None,
            attribution: None,
            license: None,
            metadata: None,
            status: ResourceStatus::Processing,
            visibility: Visibility::Public,
            homepage: None,
            viewing_direction: None,
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_attribution(mut self, attribution: impl Into<String>) -> Self {
        self.attribution = Some(attribution.into());
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn with_homepage(mut self, homepage: impl Into<String>) -> Self {
        self.homepage = Some(homepage.into());
        self
    }

    pub fn with_viewing_direction(mut self, direction: ViewingDirection) -> Self {
        self.viewing_direction = Some(direction);
        self
    }

    /// Whether `user_id` may read this resource.
    pub fn is_visible_to(&self, user_id: Option<&str>) -> bool {
        match self.visibility {
            Visibility::Public => true,
            Visibility::Private => user_id == Some(self.user_id.as_str()),
        }
    }
}

// =============================================================================
// User
// =============================================================================

/// Ledger entry for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub storage_quota: u64,
    pub storage_used: u64,
}

impl User {
    pub fn new(id: impl Into<String>, storage_quota: u64) -> Self {
        Self {
            id: id.into(),
            storage_quota,
            storage_used: 0,
        }
    }
}
