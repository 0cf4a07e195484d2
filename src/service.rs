//! Resource-level operations consumed by the HTTP layer.
//!
//! - [`ResourceService::manifest`]: the manifest read boundary. Existence,
//!   visibility and readiness are checked here, so the builder never sees a
//!   Resource it should not render.
//! - [`ResourceService::status`]: per-Image progress for polling clients.
//! - [`ResourceService::delete_resource`]: owner-only removal that releases
//!   the ledger contribution of every removed Image.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ResourceError;
use crate::ledger::QuotaLedger;
use crate::manifest::{build_manifest, Manifest, ManifestConfig};
use crate::model::{ImageStatus, Job, Resource, ResourceStatus, Visibility};
use crate::store::Store;

// =============================================================================
// Reports
// =============================================================================

/// Progress of one Image, as shown to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageProgress {
    pub id: String,
    pub filename: String,
    pub status: ImageStatus,
    /// Last checkpoint of the Image's Job, 0 when no Job exists
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of a Resource's processing state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub resource_id: String,
    pub title: String,
    pub status: ResourceStatus,
    pub images: Vec<ImageProgress>,
    /// Every Image is `ready` or `failed` (true for a Resource with no Images)
    pub all_terminal: bool,
}

/// What a deletion removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionReport {
    pub resource_id: String,
    pub images_removed: usize,
    pub bytes_released: u64,
    pub files_removed: usize,
}

// =============================================================================
// ResourceService
// =============================================================================

pub struct ResourceService {
    store: Arc<dyn Store>,
    ledger: Arc<QuotaLedger>,
    manifest_config: ManifestConfig,
}

impl ResourceService {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<QuotaLedger>,
        manifest_config: ManifestConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            manifest_config,
        }
    }

    pub fn manifest_config(&self) -> &ManifestConfig {
        &self.manifest_config
    }

    async fn load(&self, resource_id: &str) -> Result<Resource, ResourceError> {
        self.store
            .get_resource(resource_id)
            .await?
            .ok_or_else(|| ResourceError::NotFound {
                resource_id: resource_id.to_string(),
            })
    }

    /// Build the manifest of a Resource for `caller` (`None` = anonymous).
    pub async fn manifest(
        &self,
        resource_id: &str,
        caller: Option<&str>,
    ) -> Result<Manifest, ResourceError> {
        let resource = self.load(resource_id).await?;

        if !resource.is_visible_to(caller) {
            return Err(ResourceError::AccessDenied {
                resource_id: resource_id.to_string(),
            });
        }

        if resource.status != ResourceStatus::Ready {
            return Err(ResourceError::NotReady {
                resource_id: resource_id.to_string(),
                status: resource.status.to_string(),
            });
        }

        let images = self.store.images_for_resource(resource_id).await?;
        let manifest = build_manifest(&resource, &images, &self.manifest_config);
        debug!(resource_id, canvases = manifest.items.len(), "Manifest built");
        Ok(manifest)
    }

    /// Visibility of a Resource, or `None` if it does not exist.
    pub async fn visibility(&self, resource_id: &str) -> Result<Option<Visibility>, ResourceError> {
        Ok(self
            .store
            .get_resource(resource_id)
            .await?
            .map(|resource| resource.visibility))
    }

    /// Current state of a Resource and each of its Images.
    pub async fn status(&self, resource_id: &str) -> Result<StatusReport, ResourceError> {
        let resource = self.load(resource_id).await?;
        let images = self.store.images_for_resource(resource_id).await?;
        let jobs: HashMap<String, Job> = self
            .store
            .jobs_for_resource(resource_id)
            .await?
            .into_iter()
            .map(|job| (job.image_id.clone(), job))
            .collect();

        let all_terminal = images.iter().all(|image| image.status.is_terminal());
        let images = images
            .into_iter()
            .map(|image| {
                let job = jobs.get(&image.id);
                ImageProgress {
                    progress: job.map(|j| j.progress).unwrap_or(0),
                    error: image
                        .error_message
                        .clone()
                        .or_else(|| job.and_then(|j| j.error.clone())),
                    id: image.id,
                    filename: image.original_filename,
                    status: image.status,
                }
            })
            .collect();

        Ok(StatusReport {
            resource_id: resource.id,
            title: resource.title,
            status: resource.status,
            images,
            all_terminal,
        })
    }

    /// Delete a Resource owned by `caller`, together with its Images and
    /// Jobs, and release their bytes from the owner's ledger entry.
    ///
    /// Work still in flight is not cancelled; its completion will find the
    /// Image gone and do nothing. File removal is best effort.
    pub async fn delete_resource(
        &self,
        resource_id: &str,
        caller: &str,
    ) -> Result<DeletionReport, ResourceError> {
        let resource = self.load(resource_id).await?;
        if resource.user_id != caller {
            return Err(ResourceError::AccessDenied {
                resource_id: resource_id.to_string(),
            });
        }

        let removed = self
            .store
            .delete_resource(resource_id)
            .await?
            .ok_or_else(|| ResourceError::NotFound {
                resource_id: resource_id.to_string(),
            })?;

        let bytes: u64 = removed.iter().map(|image| image.ledger_footprint()).sum();
        self.ledger.debit(&resource.user_id, bytes).await?;

        let mut files_removed = 0;
        for image in &removed {
            let paths = std::iter::once(image.source_path.as_path())
                .chain(image.output_path.as_deref());
            for path in paths {
                if remove_file(path).await {
                    files_removed += 1;
                }
            }
        }

        info!(
            resource_id,
            user_id = %resource.user_id,
            images = removed.len(),
            bytes,
            "Resource deleted"
        );

        Ok(DeletionReport {
            resource_id: resource_id.to_string(),
            images_removed: removed.len(),
            bytes_released: bytes,
            files_removed,
        })
    }
}

async fn remove_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete file");
            false
        }
    }
}
