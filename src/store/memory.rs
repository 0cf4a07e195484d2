//! In-memory [`Store`] used by tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::{Image, ImageStatus, Job, JobStatus, Resource, ResourceStatus, User};

use super::Store;

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    resources: HashMap<String, Resource>,
    images: HashMap<String, Image>,
    jobs: HashMap<String, Job>,
}

/// A [`Store`] backed by hash maps behind a single `RwLock`.
///
/// Every trait method takes the lock once, so each call is atomic with
/// respect to every other call, matching the contract of a transactional
/// database.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn foreign_key_violation(table: &str, parent: &str) -> StoreError {
    StoreError::Database(format!(
        "FOREIGN KEY constraint failed: {} references missing {}",
        table, parent
    ))
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.tables.read().await.users.get(user_id).cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .users
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn increment_storage_used(
        &self,
        user_id: &str,
        bytes: u64,
    ) -> Result<Option<u64>, StoreError> {
        let mut tables = self.tables.write().await;
        Ok(tables.users.get_mut(user_id).map(|user| {
            user.storage_used = user.storage_used.saturating_add(bytes);
            user.storage_used
        }))
    }

    async fn decrement_storage_used(
        &self,
        user_id: &str,
        bytes: u64,
    ) -> Result<Option<u64>, StoreError> {
        let mut tables = self.tables.write().await;
        Ok(tables.users.get_mut(user_id).map(|user| {
            user.storage_used = user.storage_used.saturating_sub(bytes);
            user.storage_used
        }))
    }

    async fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>, StoreError> {
        Ok(self.tables.read().await.resources.get(resource_id).cloned())
    }

    async fn insert_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&resource.user_id) {
            return Err(foreign_key_violation("resources", "user"));
        }
        tables
            .resources
            .insert(resource.id.clone(), resource.clone());
        Ok(())
    }

    async fn set_resource_status(
        &self,
        resource_id: &str,
        status: ResourceStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.resources.get_mut(resource_id) {
            Some(resource) => {
                resource.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_resource(&self, resource_id: &str) -> Result<Option<Vec<Image>>, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.resources.remove(resource_id).is_none() {
            return Ok(None);
        }

        let image_ids: Vec<String> = tables
            .images
            .values()
            .filter(|image| image.resource_id == resource_id)
            .map(|image| image.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(image_ids.len());
        for id in &image_ids {
            if let Some(image) = tables.images.remove(id) {
                removed.push(image);
            }
        }
        tables
            .jobs
            .retain(|_, job| !image_ids.contains(&job.image_id));

        removed.sort_by_key(|image| image.order_index);
        Ok(Some(removed))
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<Image>, StoreError> {
        Ok(self.tables.read().await.images.get(image_id).cloned())
    }

    async fn insert_image(&self, image: &Image) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.resources.contains_key(&image.resource_id) {
            return Err(foreign_key_violation("images", "resource"));
        }
        tables.images.insert(image.id.clone(), image.clone());
        Ok(())
    }

    async fn images_for_resource(&self, resource_id: &str) -> Result<Vec<Image>, StoreError> {
        let tables = self.tables.read().await;
        let mut images: Vec<Image> = tables
            .images
            .values()
            .filter(|image| image.resource_id == resource_id)
            .cloned()
            .collect();
        images.sort_by(|a, b| a.order_index.cmp(&b.order_index).then(a.id.cmp(&b.id)));
        Ok(images)
    }

    async fn undispatched_images(&self) -> Result<Vec<Image>, StoreError> {
        let tables = self.tables.read().await;
        let mut images: Vec<Image> = tables
            .images
            .values()
            .filter(|image| image.status == ImageStatus::Uploaded && image.job_id.is_none())
            .cloned()
            .collect();
        images.sort_by(|a, b| {
            a.resource_id
                .cmp(&b.resource_id)
                .then(a.order_index.cmp(&b.order_index))
                .then(a.id.cmp(&b.id))
        });
        Ok(images)
    }

    async fn update_image(
        &self,
        image: &Image,
        expected: ImageStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.images.get_mut(&image.id) {
            Some(stored) if stored.status == expected => {
                *stored = image.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_ready_and_credit(&self, image: &Image) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.images.get_mut(&image.id) {
            Some(stored) if stored.status == ImageStatus::Processing => {
                *stored = image.clone();
            }
            _ => return Ok(false),
        }
        if let Some(user) = tables.users.get_mut(&image.user_id) {
            user.storage_used = user
                .storage_used
                .saturating_add(image.output_size.unwrap_or(0));
        }
        Ok(true)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.tables.read().await.jobs.get(job_id).cloned())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.images.contains_key(&job.image_id) {
            return Err(foreign_key_violation("job_status", "image"));
        }
        if tables.jobs.contains_key(&job.id) {
            return Err(StoreError::Database(format!(
                "UNIQUE constraint failed: job_status.id ({})",
                job.id
            )));
        }
        tables.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_job_progress(&self, job_id: &str, progress: u8) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.jobs.get_mut(job_id) {
            Some(job) => {
                job.progress = progress;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn jobs_for_resource(&self, resource_id: &str) -> Result<Vec<Job>, StoreError> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| {
                tables
                    .images
                    .get(&job.image_id)
                    .is_some_and(|image| image.resource_id == resource_id)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

// =============================================================================
// Tests
// =============================================================================
