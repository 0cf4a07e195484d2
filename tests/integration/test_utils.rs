//! Test utilities for integration tests.
//!
//! Provides a scriptable converter that writes real output files, a harness
//! running the dispatcher and worker pool against a store, and seeding and
//! polling helpers.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use iiif_depot::convert::{ConvertOptions, Converter, Dimensions};
use iiif_depot::error::ConvertError;
use iiif_depot::model::{Image, ImageStatus, Resource, ResourceStatus, User};
use iiif_depot::store::{MemoryStore, Store};
use iiif_depot::worker::{job_queue, PoolConfig, Processor, RetryPolicy, WorkerPool};
use iiif_depot::{Dispatcher, ManifestConfig, QuotaLedger, ResourceService, Synchronizer};

pub const OWNER: &str = "alice";
pub const OWNER_QUOTA: u64 = 1 << 30;
pub const DEFAULT_OUTPUT_SIZE: u64 = 4096;
pub const BASE_URL: &str = "https://depot.test";
pub const IMAGE_SERVICE_URL: &str = "https://iiif.test/iiif/2";

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

// =============================================================================
// Fake Converter
// =============================================================================

/// A converter whose behaviour is scripted per source file name.
///
/// Conversions write `output_size` zero bytes to the requested output path,
/// so the real output-size measurement and file cleanup paths run.
pub struct FakeConverter {
    dimensions: HashMap<String, Dimensions>,
    output_sizes: HashMap<String, u64>,
    unsupported: HashSet<String>,
    /// Remaining scripted conversion failures per file name
    flaky: Mutex<HashMap<String, usize>>,
    gate: Option<Arc<Semaphore>>,
    delay: Duration,

    measures: Mutex<HashMap<String, usize>>,
    converts: AtomicUsize,
    finished: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for FakeConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeConverter {
    pub fn new() -> Self {
        Self {
            dimensions: HashMap::new(),
            output_sizes: HashMap::new(),
            unsupported: HashSet::new(),
            flaky: Mutex::new(HashMap::new()),
            gate: None,
            delay: Duration::ZERO,
            measures: Mutex::new(HashMap::new()),
            converts: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn with_dimensions(mut self, name: &str, width: u32, height: u32) -> Self {
        self.dimensions
            .insert(name.to_string(), Dimensions { width, height });
        self
    }

    pub fn with_output_size(mut self, name: &str, bytes: u64) -> Self {
        self.output_sizes.insert(name.to_string(), bytes);
        self
    }

    /// Every measurement of `name` fails with an unsupported-codec error.
    pub fn unsupported(mut self, name: &str) -> Self {
        self.unsupported.insert(name.to_string());
        self
    }

    /// The first `failures` conversions of `name` fail with a tool error.
    pub fn flaky(self, name: &str, failures: usize) -> Self {
        self.flaky
            .lock()
            .unwrap()
            .insert(name.to_string(), failures);
        self
    }

    /// Conversions wait for a permit on `gate` before writing output.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn measure_count(&self, name: &str) -> usize {
        self.measures.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn convert_count(&self) -> usize {
        self.converts.load(Ordering::SeqCst)
    }

    /// Conversions that returned, successfully or not.
    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn output_size_for(&self, name: &str) -> u64 {
        self.output_sizes
            .get(name)
            .copied()
            .unwrap_or(DEFAULT_OUTPUT_SIZE)
    }

    async fn write_output(&self, name: &str, output: &Path) -> Result<PathBuf, ConvertError> {
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| ConvertError::Tool("gate closed".into()))?;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ConvertError::Tool(format!(
                        "convert exited with status 1 for {}",
                        name
                    )));
                }
            }
        }

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConvertError::Io(e.to_string()))?;
        }
        let size = self.output_size_for(name) as usize;
        tokio::fs::write(output, vec![0u8; size])
            .await
            .map_err(|e| ConvertError::Io(e.to_string()))?;
        Ok(output.to_path_buf())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl Converter for FakeConverter {
    async fn measure(&self, source: &Path) -> Result<Dimensions, ConvertError> {
        let name = file_name(source);
        *self.measures.lock().unwrap().entry(name.clone()).or_insert(0) += 1;

        if !source.exists() {
            return Err(ConvertError::MissingFile(source.to_path_buf()));
        }
        if self.unsupported.contains(&name) {
            return Err(ConvertError::UnsupportedCodec(format!(
                "no decode delegate for {}",
                name
            )));
        }
        Ok(self.dimensions.get(&name).copied().unwrap_or(Dimensions {
            width: 800,
            height: 600,
        }))
    }

    async fn convert(
        &self,
        source: &Path,
        output: &Path,
        _options: &ConvertOptions,
    ) -> Result<PathBuf, ConvertError> {
        self.converts.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let result = self.write_output(&file_name(source), output).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

// =============================================================================
// Pipeline Harness
// =============================================================================

/// Store, ledger, dispatcher and a running worker pool sharing one temp dir.
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub ledger: Arc<QuotaLedger>,
    pub dispatcher: Dispatcher,
    pub service: ResourceService,
    pub converter: Arc<FakeConverter>,
    pub dir: TempDir,
    stop: Option<oneshot::Sender<()>>,
    pool: Option<JoinHandle<()>>,
}

impl Harness {
    /// In-memory store, default pool limits, given retry policy.
    pub async fn start(converter: FakeConverter, policy: RetryPolicy) -> Self {
        Self::start_with(
            Arc::new(MemoryStore::new()),
            converter,
            PoolConfig::default(),
            policy,
        )
        .await
    }

    pub async fn start_with(
        store: Arc<dyn Store>,
        converter: FakeConverter,
        pool_config: PoolConfig,
        policy: RetryPolicy,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        store
            .insert_user(&User::new(OWNER, OWNER_QUOTA))
            .await
            .unwrap();

        let converter = Arc::new(converter);
        let ledger = Arc::new(QuotaLedger::new(Arc::clone(&store)));
        let sync = Arc::new(Synchronizer::new(Arc::clone(&store)));

        let (queue, receiver) = job_queue();
        let dispatcher = Dispatcher::new(Arc::clone(&store), queue.clone(), dir.path().join("ptiff"))
            .with_retry_policy(policy);

        let processor = Processor::new(sync, Arc::clone(&converter) as Arc<dyn Converter>);
        let pool = WorkerPool::new(processor, queue, pool_config);
        let (stop, stopped) = oneshot::channel::<()>();
        let pool = tokio::spawn(pool.run_until(receiver, async move {
            let _ = stopped.await;
        }));

        let service = ResourceService::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            ManifestConfig::new(BASE_URL, IMAGE_SERVICE_URL),
        );

        Self {
            store,
            ledger,
            dispatcher,
            service,
            converter,
            dir,
            stop: Some(stop),
            pool: Some(pool),
        }
    }

    /// Insert `resource` and one uploaded Image per `(image_id, filename)`,
    /// in order, writing a source file for each and charging its size to the
    /// owner as the upload tier would.
    pub async fn seed(&self, resource: Resource, images: &[(&str, &str)]) -> Vec<Image> {
        let upload_dir = self.dir.path().join("upload");
        tokio::fs::create_dir_all(&upload_dir).await.unwrap();
        self.store.insert_resource(&resource).await.unwrap();

        let mut seeded = Vec::new();
        for (index, (image_id, filename)) in images.iter().enumerate() {
            let source = upload_dir.join(filename);
            let contents = vec![7u8; 100 * (index + 1)];
            tokio::fs::write(&source, &contents).await.unwrap();

            let image = Image::uploaded(
                *image_id,
                &resource.id,
                &resource.user_id,
                *filename,
                source,
                contents.len() as u64,
                index as i64,
            );
            self.store.insert_image(&image).await.unwrap();
            self.ledger
                .credit(&resource.user_id, image.byte_size)
                .await
                .unwrap();
            seeded.push(image);
        }
        seeded
    }

    /// Dispatch every Image of `resource_id` in `order_index` order.
    pub async fn dispatch_resource(&self, resource_id: &str) -> Vec<String> {
        let images = self.store.images_for_resource(resource_id).await.unwrap();
        let mut job_ids = Vec::with_capacity(images.len());
        for image in &images {
            job_ids.push(self.dispatcher.dispatch_image(&image.id).await.unwrap());
        }
        job_ids
    }

    pub fn output_path(&self, stem: &str) -> PathBuf {
        self.dir.path().join("ptiff").join(format!("{}.tif", stem))
    }

    pub async fn storage_used(&self) -> u64 {
        self.ledger.usage(OWNER).await.unwrap().used
    }

    pub async fn image(&self, image_id: &str) -> Image {
        self.store.get_image(image_id).await.unwrap().unwrap()
    }

    pub async fn wait_for_resource(&self, resource_id: &str, expected: ResourceStatus) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let resource = self.store.get_resource(resource_id).await.unwrap();
            if resource.as_ref().map(|r| r.status) == Some(expected) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "resource {} never became {} (last: {:?})",
                resource_id,
                expected,
                resource.map(|r| r.status)
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn wait_for_image(&self, image_id: &str, expected: ImageStatus) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let status = self.store.get_image(image_id).await.unwrap().map(|i| i.status);
            if status == Some(expected) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "image {} never became {} (last: {:?})",
                image_id,
                expected,
                status
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn wait_for_progress(&self, job_id: &str, progress: u8) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let job = self.store.get_job(job_id).await.unwrap();
            if job.as_ref().map(|j| j.progress) == Some(progress) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "job {} never reached progress {}",
                job_id,
                progress
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop the pool and wait for in-flight items to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(pool) = self.pool.take() {
            pool.await.unwrap();
        }
    }
}

/// Poll a synchronous condition until it holds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// A fast retry policy for tests.
pub fn quick_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::exponential(max_attempts, Duration::from_millis(5))
}

pub fn album(id: &str) -> Resource {
    Resource::new(id, OWNER, "Album")
}
