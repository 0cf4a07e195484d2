//! iiif-depot - Image ingestion pipeline and IIIF manifest server.
//!
//! This binary starts the worker pool and the HTTP server and wires all
//! components together.

use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iiif_depot::{
    config::{CheckConfig, Cli, Command, ServeConfig},
    convert::{Converter, MagickConverter, TimeoutConverter},
    create_router, job_queue, Dispatcher, Processor, QuotaLedger, ResourceService, SqliteStore,
    Store, Synchronizer, WorkerPool,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(config) => run_serve(config).await,
        Command::Check(config) => run_check(config).await,
    }
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("iiif-depot v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Database: {}", config.storage.database.display());
    info!("  Output directory: {}", config.storage.output_dir.display());
    info!("  Converter: {}", config.storage.convert_binary.display());
    info!(
        "  Workers: {} concurrent, {} jobs per {} ms",
        config.concurrency, config.rate_limit, config.rate_window_ms
    );
    info!(
        "  Retries: {} attempts, first backoff {} ms",
        config.max_attempts, config.backoff_ms
    );
    info!("  Manifest base URL: {}", config.base_url);
    info!("  Image service URL: {}", config.image_service_url);

    let store: Arc<dyn Store> = match SqliteStore::open(&config.storage.database) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(
                "Failed to open database {}: {}",
                config.storage.database.display(),
                e
            );
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::fs::create_dir_all(&config.storage.output_dir).await {
        error!(
            "Failed to create output directory {}: {}",
            config.storage.output_dir.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    // Pipeline components
    let ledger = Arc::new(QuotaLedger::new(Arc::clone(&store)));
    let sync = Arc::new(Synchronizer::new(Arc::clone(&store)));
    let converter: Arc<dyn Converter> = Arc::new(TimeoutConverter::new(
        MagickConverter::new(&config.storage.convert_binary),
        config.convert_timeout(),
    ));

    let (queue, receiver) = job_queue();
    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::clone(&store),
            queue.clone(),
            &config.storage.output_dir,
        )
        .with_retry_policy(config.retry_policy()),
    );

    if let Err(e) = dispatcher.recover().await {
        error!("Failed to recover unfinished jobs: {}", e);
        return ExitCode::FAILURE;
    }

    let processor = Processor::new(sync, converter).with_options(config.convert_options());
    let pool = WorkerPool::new(processor, queue, config.pool_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool_task = tokio::spawn(pool.run_until(receiver, stopped(shutdown_rx.clone())));
    let intake_task = tokio::spawn(run_intake(
        Arc::clone(&dispatcher),
        config.scan_interval(),
        shutdown_rx,
    ));

    // HTTP
    let service = Arc::new(ResourceService::new(
        store,
        ledger,
        config.manifest_config(),
    ));
    let router = create_router(service, config.router_config());

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            let _ = shutdown_tx.send(true);
            return ExitCode::FAILURE;
        }
    };

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Server listening on: http://{}", addr);
    info!("");
    info!("  Try these endpoints:");
    info!("    curl http://{}/health", addr);
    info!("    curl http://{}/api/resources/<resource_id>/status", addr);
    info!(
        "    curl http://{}/iiif/manifests/<resource_id>/manifest.json",
        addr
    );
    info!("────────────────────────────────────────────────────────────────");
    info!("");

    let signal_tx = shutdown_tx.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signal_tx.send(true);
        })
        .await;

    // Stop the workers whether the server exited cleanly or not
    let _ = shutdown_tx.send(true);
    if let Err(e) = intake_task.await {
        warn!("Intake task ended abnormally: {}", e);
    }
    if let Err(e) = pool_task.await {
        error!("Worker pool ended abnormally: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = served {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

/// Periodically dispatch images the upload tier has recorded.
async fn run_intake(
    dispatcher: Arc<Dispatcher>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let stop = stopped(shutdown);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        match dispatcher.dispatch_new_uploads().await {
            Ok(count) => debug!(count, "Intake sweep finished"),
            Err(e) => warn!(error = %e, "Intake sweep failed"),
        }
    }
    debug!("Intake stopped");
}

/// Resolve once the shutdown flag has been raised.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested, finishing in-flight jobs");
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "iiif_depot=debug,tower_http=debug"
    } else {
        "iiif_depot=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Check Command
// =============================================================================

async fn run_check(config: CheckConfig) -> ExitCode {
    // Initialize minimal logging for check command
    if config.verbose {
        init_logging(true);
    }

    println!("iiif-depot Configuration Check");
    println!("═══════════════════════════════");
    println!();

    if let Err(e) = config.validate() {
        println!("✗ Configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let storage = &config.storage;

    match SqliteStore::open(&storage.database) {
        Ok(_) => println!("✓ Database: {}", storage.database.display()),
        Err(e) => {
            println!("✗ Database: {}", storage.database.display());
            println!();
            println!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if !check_directory("Upload directory", &storage.upload_dir).await {
        return ExitCode::FAILURE;
    }
    if !check_directory("Output directory", &storage.output_dir).await {
        return ExitCode::FAILURE;
    }

    print!("Testing converter... ");
    let converter = MagickConverter::new(&storage.convert_binary);
    match converter.version().await {
        Ok(version) => {
            println!("✓ success");
            println!("  {}", version);
        }
        Err(e) => {
            println!("✗ failed");
            println!();
            println!("Error: {}", e);
            println!();
            println!("Please check:");
            println!("  - ImageMagick is installed");
            println!(
                "  - '{}' is on PATH or set --convert-binary",
                storage.convert_binary.display()
            );
            return ExitCode::FAILURE;
        }
    }

    println!();
    println!("═══════════════════════════════");
    println!("✓ All checks passed!");

    ExitCode::SUCCESS
}

/// Report whether `path` is a usable directory. A missing directory is
/// fine as long as it can be created later.
async fn check_directory(label: &str, path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            println!("✓ {}: {}", label, path.display());
            true
        }
        Ok(_) => {
            println!("✗ {}: {} is not a directory", label, path.display());
            false
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!(
                "✓ {}: {} (missing, will be created)",
                label,
                path.display()
            );
            true
        }
        Err(e) => {
            println!("✗ {}: {} ({})", label, path.display(), e);
            false
        }
    }
}
