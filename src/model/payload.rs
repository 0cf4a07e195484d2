use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Work item carried by the queue and read by the worker pool.
///
/// The queue treats it as opaque; only the worker interprets the fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub image_id: String,
    pub resource_id: String,
    pub user_id: String,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
}

impl JobPayload {
    pub fn new(
        image_id: impl Into<String>,
        resource_id: impl Into<String>,
        user_id: impl Into<String>,
        source_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            resource_id: resource_id.into(),
            user_id: user_id.into(),
            source_path: source_path.into(),
            output_path: output_path.into(),
        }
    }
}
