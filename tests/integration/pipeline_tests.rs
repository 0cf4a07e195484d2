//! End-to-end pipeline tests: dispatcher, worker pool, synchronizer and
//! ledger running together against a scripted converter.
//!
//! Tests verify:
//! - Resource aggregation for mixed success and failure
//! - Exactly-once ledger crediting
//! - Retry semantics (same Job id, progress reset, bounded attempts,
//!   pending retries resumed after a restart)
//! - Concurrency bound and rate limit of the worker pool
//! - Deletion while an Image is in flight

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use iiif_depot::error::ResourceError;
use iiif_depot::model::{Image, ImageStatus, Job, JobPayload, JobStatus, ResourceStatus, User};
use iiif_depot::store::{MemoryStore, SqliteStore, Store};
use iiif_depot::sync::{Conversion, Outcome, Synchronizer};
use iiif_depot::worker::{job_queue, PoolConfig, Processor, RetryPolicy, WorkerPool};
use iiif_depot::{Converter, Dispatcher, ManifestConfig, QuotaLedger, ResourceService};

use super::test_utils::{
    album, quick_retries, wait_until, FakeConverter, Harness, BASE_URL, DEFAULT_OUTPUT_SIZE,
    IMAGE_SERVICE_URL, OWNER, OWNER_QUOTA,
};

// =============================================================================
// Aggregation
// =============================================================================

#[tokio::test]
async fn test_mixed_batch_fails_resource_and_credits_successes() {
    let converter = FakeConverter::new()
        .with_dimensions("a.jpg", 800, 600)
        .with_dimensions("b.jpg", 1024, 768)
        .with_output_size("a.jpg", 5000)
        .with_output_size("b.jpg", 7000)
        .unsupported("c.heic");
    let harness = Harness::start(converter, quick_retries(1)).await;

    let images = harness
        .seed(
            album("r1"),
            &[("a", "a.jpg"), ("b", "b.jpg"), ("c", "c.heic")],
        )
        .await;
    let uploaded: u64 = images.iter().map(|i| i.byte_size).sum();

    let job_ids = harness.dispatch_resource("r1").await;
    assert_eq!(job_ids, vec!["process-a", "process-b", "process-c"]);

    harness.wait_for_resource("r1", ResourceStatus::Failed).await;

    let a = harness.image("a").await;
    assert_eq!(a.status, ImageStatus::Ready);
    assert_eq!(a.dimensions(), Some((800, 600)));
    assert_eq!(a.output_size, Some(5000));
    assert_eq!(harness.image("b").await.dimensions(), Some((1024, 768)));

    let c = harness.image("c").await;
    assert_eq!(c.status, ImageStatus::Failed);
    assert!(c.error_message.unwrap().contains("Unsupported codec"));

    // Outputs of the two successes are credited, nothing for the failure
    assert_eq!(harness.storage_used().await, uploaded + 5000 + 7000);

    let report = harness.service.status("r1").await.unwrap();
    assert!(report.all_terminal);
    assert_eq!(report.images[0].progress, 100);
    assert!(report.images[2].error.is_some());

    assert!(matches!(
        harness.service.manifest("r1", None).await,
        Err(ResourceError::NotReady { .. })
    ));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_all_ready_resource_serves_manifest() {
    let converter = FakeConverter::new()
        .with_dimensions("front.jpg", 1200, 900)
        .with_dimensions("back.png", 600, 400);
    let harness = Harness::start(converter, quick_retries(1)).await;
    harness
        .seed(album("r1"), &[("i1", "front.jpg"), ("i2", "back.png")])
        .await;

    // The upload tier only records rows; the intake sweep dispatches them
    assert_eq!(harness.dispatcher.dispatch_new_uploads().await.unwrap(), 2);
    harness.wait_for_resource("r1", ResourceStatus::Ready).await;

    let manifest = harness.service.manifest("r1", None).await.unwrap();
    assert_eq!(manifest.items.len(), 2);
    assert_eq!(manifest.items[0].width, 1200);
    assert_eq!(manifest.items[1].height, 400);
    assert_eq!(manifest.items[0].label["ja"], vec!["front.jpg".to_string()]);

    let body = &manifest.items[1].items[0].items[0].body;
    assert_eq!(body.service[0].id, format!("{}/back", IMAGE_SERVICE_URL));

    let thumbnail = manifest.thumbnail.expect("thumbnail");
    assert_eq!(
        thumbnail[0].id,
        format!("{}/front/full/!300,300/0/default.jpg", IMAGE_SERVICE_URL)
    );

    assert!(harness.output_path("front").exists());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_in_flight_images_are_not_terminal() {
    let gate = Arc::new(Semaphore::new(0));
    let converter = FakeConverter::new().with_gate(Arc::clone(&gate));
    let harness = Harness::start(converter, quick_retries(1)).await;
    harness
        .seed(album("r1"), &[("i1", "one.jpg"), ("i2", "two.jpg")])
        .await;

    harness.dispatch_resource("r1").await;
    harness.wait_for_progress("process-i1", 30).await;
    harness.wait_for_progress("process-i2", 30).await;

    let report = harness.service.status("r1").await.unwrap();
    assert_eq!(report.status, ResourceStatus::Processing);
    assert!(!report.all_terminal);
    assert!(report
        .images
        .iter()
        .all(|i| i.status == ImageStatus::Processing && i.progress == 30));

    let job = harness.store.get_job("process-i1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Active);
    assert!(job.started_at.is_some());

    gate.add_permits(2);
    harness.wait_for_resource("r1", ResourceStatus::Ready).await;
    assert!(harness.service.status("r1").await.unwrap().all_terminal);

    harness.shutdown().await;
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn test_retry_reuses_job_and_succeeds() {
    let converter = FakeConverter::new().flaky("scan.tif", 2);
    let harness = Harness::start(converter, quick_retries(3)).await;
    let images = harness.seed(album("r1"), &[("i1", "scan.tif")]).await;

    harness.dispatcher.dispatch_image("i1").await.unwrap();
    harness.wait_for_resource("r1", ResourceStatus::Ready).await;

    assert_eq!(harness.converter.measure_count("scan.tif"), 3);

    let jobs = harness.store.jobs_for_resource("r1").await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, "process-i1");
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].progress, 100);
    assert_eq!(jobs[0].error, None);

    let image = harness.image("i1").await;
    assert_eq!(image.job_id.as_deref(), Some("process-i1"));
    assert_eq!(image.error_message, None);

    // Only the successful attempt is credited
    assert_eq!(
        harness.storage_used().await,
        images[0].byte_size + DEFAULT_OUTPUT_SIZE
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let converter = FakeConverter::new().unsupported("broken.bmp");
    let harness = Harness::start(converter, quick_retries(3)).await;
    harness.seed(album("r1"), &[("i1", "broken.bmp")]).await;

    harness.dispatcher.dispatch_image("i1").await.unwrap();

    let converter = Arc::clone(&harness.converter);
    wait_until("three attempts", || converter.measure_count("broken.bmp") == 3).await;
    harness.wait_for_image("i1", ImageStatus::Failed).await;
    harness.wait_for_resource("r1", ResourceStatus::Failed).await;

    // Well past the last backoff: no fourth attempt
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(converter.measure_count("broken.bmp"), 3);

    let job = harness.store.get_job("process-i1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("no decode delegate"));

    harness.shutdown().await;
}

/// One process lifetime: a dispatcher recovering stored work and a pool.
struct Process {
    dispatcher: Dispatcher,
    stop: oneshot::Sender<()>,
    pool: JoinHandle<()>,
}

impl Process {
    fn start(
        store: &Arc<dyn Store>,
        converter: &Arc<FakeConverter>,
        output_dir: &std::path::Path,
        policy: RetryPolicy,
    ) -> Self {
        let (queue, receiver) = job_queue();
        let dispatcher = Dispatcher::new(Arc::clone(store), queue.clone(), output_dir)
            .with_retry_policy(policy);
        let sync = Arc::new(Synchronizer::new(Arc::clone(store)));
        let processor = Processor::new(sync, Arc::clone(converter) as Arc<dyn Converter>);
        let pool = WorkerPool::new(processor, queue, PoolConfig::default());
        let (stop, stopped) = oneshot::channel::<()>();
        let pool = tokio::spawn(pool.run_until(receiver, async move {
            let _ = stopped.await;
        }));
        Self {
            dispatcher,
            stop,
            pool,
        }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.pool.await.unwrap();
    }
}

async fn wait_for_job(store: &Arc<dyn Store>, job_id: &str, done: impl Fn(&Job) -> bool) -> Job {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = store.get_job(job_id).await.unwrap() {
            if done(&job) {
                return job;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for job {}", job_id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_pending_retry_is_resumed_after_restart() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .insert_user(&User::new(OWNER, OWNER_QUOTA))
        .await
        .unwrap();
    store.insert_resource(&album("r1")).await.unwrap();
    let source = dir.path().join("page.jpg");
    tokio::fs::write(&source, b"jpeg").await.unwrap();
    store
        .insert_image(&Image::uploaded(
            "i1", "r1", OWNER, "page.jpg", &source, 4, 0,
        ))
        .await
        .unwrap();

    let converter = Arc::new(FakeConverter::new().flaky("page.jpg", 1));
    let policy = RetryPolicy::exponential(3, Duration::from_millis(300));
    let output_dir = dir.path().join("ptiff");

    // First run: attempt 1 fails and the retry is parked on the Job row
    let first = Process::start(&store, &converter, &output_dir, policy);
    first.dispatcher.dispatch_image("i1").await.unwrap();
    let parked = wait_for_job(&store, "process-i1", |job| {
        job.status == JobStatus::Waiting && job.retry_at.is_some()
    })
    .await;
    first.stop().await;

    assert_eq!(parked.attempt, 2);
    assert!(parked.error.is_some());
    let image = store.get_image("i1").await.unwrap().unwrap();
    assert_eq!(image.status, ImageStatus::Failed);
    assert_eq!(converter.measure_count("page.jpg"), 1);

    // Second run: recovery re-enqueues the parked attempt
    let second = Process::start(&store, &converter, &output_dir, policy);
    assert_eq!(second.dispatcher.recover().await.unwrap(), 1);
    let job = wait_for_job(&store, "process-i1", |job| {
        job.status == JobStatus::Completed
    })
    .await;
    second.stop().await;

    assert_eq!(job.attempt, 2);
    assert_eq!(job.retry_at, None);
    assert_eq!(converter.measure_count("page.jpg"), 2);
    let resource = store.get_resource("r1").await.unwrap().unwrap();
    assert_eq!(resource.status, ResourceStatus::Ready);
    let user = store.get_user(OWNER).await.unwrap().unwrap();
    assert_eq!(user.storage_used, DEFAULT_OUTPUT_SIZE);
}

// =============================================================================
// Ledger
// =============================================================================

#[tokio::test]
async fn test_concurrent_duplicate_attempts_credit_once() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .insert_user(&User::new(OWNER, OWNER_QUOTA))
        .await
        .unwrap();
    store.insert_resource(&album("r1")).await.unwrap();

    let source = dir.path().join("page.jpg");
    tokio::fs::write(&source, b"jpeg").await.unwrap();
    store
        .insert_image(&Image::uploaded(
            "i1", "r1", OWNER, "page.jpg", &source, 4, 0,
        ))
        .await
        .unwrap();

    // Dispatch always creates the Job row before any attempt runs
    store.insert_job(&Job::waiting("process-i1", "i1")).await.unwrap();

    let ledger = Arc::new(QuotaLedger::new(Arc::clone(&store)));
    let sync = Arc::new(Synchronizer::new(Arc::clone(&store)));
    let converter: Arc<dyn Converter> =
        Arc::new(FakeConverter::new().with_delay(Duration::from_millis(20)));
    let processor = Processor::new(Arc::clone(&sync), converter);

    let payload = JobPayload::new("i1", "r1", OWNER, &source, dir.path().join("page.tif"));
    let (first, second) = tokio::join!(
        processor.process("process-i1", &payload),
        processor.process("process-i1", &payload),
    );
    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(
        outcomes.iter().filter(|o| **o == Outcome::Applied).count(),
        1
    );

    // A late report after the fact changes nothing either
    assert_eq!(
        processor.process("process-i1", &payload).await.unwrap(),
        Outcome::Unchanged
    );

    assert_eq!(ledger.usage(OWNER).await.unwrap().used, DEFAULT_OUTPUT_SIZE);
    let resource = store.get_resource("r1").await.unwrap().unwrap();
    assert_eq!(resource.status, ResourceStatus::Ready);
}

#[tokio::test]
async fn test_deleting_a_completed_image_leaves_nothing_charged() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .insert_user(&User::new(OWNER, OWNER_QUOTA))
        .await
        .unwrap();
    store.insert_resource(&album("r1")).await.unwrap();
    store
        .insert_image(&Image::uploaded(
            "i1", "r1", OWNER, "page.jpg", "/missing/page.jpg", 10, 0,
        ))
        .await
        .unwrap();

    let ledger = Arc::new(QuotaLedger::new(Arc::clone(&store)));
    ledger.credit(OWNER, 10).await.unwrap();
    let sync = Synchronizer::new(Arc::clone(&store));
    let service = ResourceService::new(
        Arc::clone(&store),
        Arc::clone(&ledger),
        ManifestConfig::new(BASE_URL, IMAGE_SERVICE_URL),
    );

    let payload = JobPayload::new("i1", "r1", OWNER, "/missing/page.jpg", "/missing/page.tif");
    sync.begin_attempt("process-i1", &payload).await.unwrap();
    let conversion = Conversion {
        width: 800,
        height: 600,
        output_path: "/missing/page.tif".into(),
        output_size: DEFAULT_OUTPUT_SIZE,
    };
    assert_eq!(
        sync.complete_success("process-i1", "i1", &conversion)
            .await
            .unwrap(),
        Outcome::Applied
    );
    assert_eq!(ledger.usage(OWNER).await.unwrap().used, 10 + DEFAULT_OUTPUT_SIZE);

    let report = service.delete_resource("r1", OWNER).await.unwrap();
    assert_eq!(report.bytes_released, 10 + DEFAULT_OUTPUT_SIZE);

    // A report arriving after the deletion cannot charge the owner again
    assert_eq!(
        sync.complete_success("process-i1", "i1", &conversion)
            .await
            .unwrap(),
        Outcome::Orphaned
    );
    assert_eq!(ledger.usage(OWNER).await.unwrap().used, 0);
}

// =============================================================================
// Worker Pool Limits
// =============================================================================

#[tokio::test]
async fn test_concurrency_bound_is_respected() {
    let converter = FakeConverter::new().with_delay(Duration::from_millis(30));
    let harness = Harness::start_with(
        Arc::new(MemoryStore::new()),
        converter,
        PoolConfig::default()
            .with_concurrency(2)
            .with_rate_limit(100, Duration::from_secs(1)),
        quick_retries(1),
    )
    .await;

    let files: Vec<(String, String)> = (0..6)
        .map(|i| (format!("i{}", i), format!("page{}.jpg", i)))
        .collect();
    let refs: Vec<(&str, &str)> = files
        .iter()
        .map(|(id, name)| (id.as_str(), name.as_str()))
        .collect();
    harness.seed(album("r1"), &refs).await;

    harness.dispatch_resource("r1").await;
    harness.wait_for_resource("r1", ResourceStatus::Ready).await;

    assert_eq!(harness.converter.convert_count(), 6);
    assert_eq!(harness.converter.max_active(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_spaces_out_starts() {
    let harness = Harness::start_with(
        Arc::new(MemoryStore::new()),
        FakeConverter::new(),
        PoolConfig::default()
            .with_concurrency(4)
            .with_rate_limit(2, Duration::from_millis(200)),
        quick_retries(1),
    )
    .await;
    harness
        .seed(
            album("r1"),
            &[("i1", "1.jpg"), ("i2", "2.jpg"), ("i3", "3.jpg"), ("i4", "4.jpg")],
        )
        .await;

    let started = Instant::now();
    harness.dispatch_resource("r1").await;
    harness.wait_for_resource("r1", ResourceStatus::Ready).await;

    // Two starts per window: the second pair waits for the window to roll
    assert!(started.elapsed() >= Duration::from_millis(150));

    harness.shutdown().await;
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test]
async fn test_deletion_mid_flight_is_an_orphan_no_op() {
    let gate = Arc::new(Semaphore::new(0));
    let converter = FakeConverter::new().with_gate(Arc::clone(&gate));
    let harness = Harness::start(converter, quick_retries(1)).await;
    let images = harness.seed(album("r1"), &[("i1", "late.jpg")]).await;
    assert_eq!(harness.storage_used().await, images[0].byte_size);

    harness.dispatcher.dispatch_image("i1").await.unwrap();
    harness.wait_for_progress("process-i1", 30).await;

    let report = harness.service.delete_resource("r1", OWNER).await.unwrap();
    assert_eq!(report.images_removed, 1);
    assert_eq!(report.bytes_released, images[0].byte_size);
    assert_eq!(harness.storage_used().await, 0);
    assert!(!images[0].source_path.exists());

    gate.add_permits(1);
    let converter = Arc::clone(&harness.converter);
    wait_until("conversion to return", || converter.finished_count() == 1).await;
    let output = harness.output_path("late");
    wait_until("orphaned output to be discarded", || !output.exists()).await;

    // Completion found nothing to update and credited nothing
    assert_eq!(harness.storage_used().await, 0);
    assert!(harness.store.get_image("i1").await.unwrap().is_none());
    assert!(harness.store.get_job("process-i1").await.unwrap().is_none());

    harness.shutdown().await;
}

// =============================================================================
// SQLite-backed pipeline
// =============================================================================

#[tokio::test]
async fn test_pipeline_on_sqlite_store() {
    let db_dir = TempDir::new().unwrap();
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(db_dir.path().join("depot.db")).unwrap());
    let converter = FakeConverter::new()
        .flaky("b.jpg", 1)
        .with_output_size("a.jpg", 1500);
    let harness = Harness::start_with(
        store,
        converter,
        PoolConfig::default(),
        quick_retries(2),
    )
    .await;
    let images = harness
        .seed(album("r1"), &[("a", "a.jpg"), ("b", "b.jpg")])
        .await;

    harness.dispatch_resource("r1").await;
    harness.wait_for_resource("r1", ResourceStatus::Ready).await;

    let uploaded: u64 = images.iter().map(|i| i.byte_size).sum();
    assert_eq!(
        harness.storage_used().await,
        uploaded + 1500 + DEFAULT_OUTPUT_SIZE
    );

    let jobs = harness.store.jobs_for_resource("r1").await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));

    let manifest = harness.service.manifest("r1", None).await.unwrap();
    assert_eq!(manifest.items.len(), 2);

    harness.shutdown().await;
}
