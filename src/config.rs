//! Configuration management for iiif-depot.
//!
//! This module provides a flexible configuration system that supports:
//! - Command-line arguments via clap
//! - Environment variables with `DEPOT_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Example
//!
//! ```ignore
//! use iiif_depot::config::{Cli, Command};
//!
//! match Cli::parse().command {
//!     Command::Serve(config) => println!("Listening on {}", config.bind_address()),
//!     Command::Check(config) => println!("Database: {}", config.storage.database.display()),
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `DEPOT_HOST` - Server bind address (default: 0.0.0.0)
//! - `DEPOT_PORT` - Server port (default: 3000)
//! - `DEPOT_DATABASE` - SQLite database path (default: ./data/db/iiif-depot.db)
//! - `DEPOT_UPLOAD_DIR` - Directory holding uploaded originals
//! - `DEPOT_OUTPUT_DIR` - Directory receiving pyramid TIFFs
//! - `DEPOT_CONVERT_BINARY` - ImageMagick `convert` executable
//! - `DEPOT_BASE_URL` - Public base URL used in manifest ids
//! - `DEPOT_IMAGE_SERVICE_URL` - Public IIIF Image API base URL
//! - `DEPOT_LABEL_LANGUAGE` - Language tag for manifest labels (default: ja)
//! - `DEPOT_CONCURRENCY` - Simultaneous conversions (default: 2)
//! - `DEPOT_RATE_LIMIT` / `DEPOT_RATE_WINDOW_MS` - Dequeues per window (default: 10 per 1000 ms)
//! - `DEPOT_MAX_ATTEMPTS` / `DEPOT_BACKOFF_MS` - Retry policy (default: 3, 5000 ms)
//! - `DEPOT_CONVERT_TIMEOUT` - Seconds allowed per converter call (default: 600)
//! - `DEPOT_TILE_SIZE` - Output tile edge in pixels (default: 256)
//! - `DEPOT_COMPRESSION` - Output tile compression (default: lzw)
//! - `DEPOT_SCAN_INTERVAL` - Seconds between sweeps for new uploads (default: 5)
//! - `DEPOT_CACHE_MAX_AGE` - HTTP cache max-age for public manifests (default: 3600)
//! - `DEPOT_CORS_ORIGINS` - Comma-separated origins allowed on `/api` routes

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::convert::{Compression, ConvertOptions, DEFAULT_TILE_SIZE};
use crate::manifest::{ManifestConfig, DEFAULT_LABEL_LANGUAGE};
use crate::server::RouterConfig;
use crate::worker::{
    PoolConfig, RetryPolicy, DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS, DEFAULT_RATE_LIMIT,
};

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

pub const DEFAULT_DATABASE: &str = "./data/db/iiif-depot.db";

pub const DEFAULT_UPLOAD_DIR: &str = "./data/images/original";

pub const DEFAULT_OUTPUT_DIR: &str = "./data/images/ptiff";

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";

pub const DEFAULT_IMAGE_SERVICE_URL: &str = "http://localhost:8182/iiif/2";

/// Default rate window in milliseconds.
pub const DEFAULT_RATE_WINDOW_MS: u64 = 1000;

/// Default first retry delay in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 5000;

/// Default per-call converter timeout in seconds (10 minutes).
pub const DEFAULT_CONVERT_TIMEOUT_SECS: u64 = 600;

/// Default pause between sweeps for new uploads, in seconds.
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 5;

/// Default HTTP cache max-age in seconds (1 hour).
pub const DEFAULT_CACHE_MAX_AGE: u32 = 3600;

const MIN_TILE_SIZE: u32 = 16;
const MAX_TILE_SIZE: u32 = 4096;

// =============================================================================
// CLI Arguments
// =============================================================================

/// iiif-depot - Image ingestion pipeline and IIIF manifest server.
///
/// Converts uploaded images into tiled pyramidal TIFFs, tracks processing
/// state and storage quota, and serves IIIF Presentation 3 manifests.
#[derive(Parser, Debug, Clone)]
#[command(name = "iiif-depot")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the worker pool and the HTTP API
    Serve(ServeConfig),
    /// Verify the database, directories and conversion tool, then exit
    Check(CheckConfig),
}

/// Output tile compression accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionArg {
    #[default]
    Lzw,
    Deflate,
    Jpeg,
    None,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::Lzw => Compression::Lzw,
            CompressionArg::Deflate => Compression::Deflate,
            CompressionArg::Jpeg => Compression::Jpeg,
            CompressionArg::None => Compression::None,
        }
    }
}

/// Locations shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct StorageConfig {
    /// SQLite database file.
    #[arg(long, default_value = DEFAULT_DATABASE, env = "DEPOT_DATABASE")]
    pub database: PathBuf,

    /// Directory holding uploaded originals.
    #[arg(long, default_value = DEFAULT_UPLOAD_DIR, env = "DEPOT_UPLOAD_DIR")]
    pub upload_dir: PathBuf,

    /// Directory receiving converted pyramid TIFFs.
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR, env = "DEPOT_OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// ImageMagick `convert` executable.
    #[arg(long, default_value = "convert", env = "DEPOT_CONVERT_BINARY")]
    pub convert_binary: PathBuf,
}

impl StorageConfig {
    fn validate(&self) -> Result<(), String> {
        if self.database.as_os_str().is_empty() {
            return Err("Database path is required. Set --database or DEPOT_DATABASE".to_string());
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(
                "Output directory is required. Set --output-dir or DEPOT_OUTPUT_DIR".to_string(),
            );
        }
        if self.convert_binary.as_os_str().is_empty() {
            return Err("convert_binary must not be empty".to_string());
        }
        Ok(())
    }
}

/// Settings for `iiif-depot serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "DEPOT_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "DEPOT_PORT")]
    pub port: u16,

    #[command(flatten)]
    pub storage: StorageConfig,

    // =========================================================================
    // Manifest Configuration
    // =========================================================================
    /// Public base URL of this service, used to build manifest ids.
    #[arg(long, default_value = DEFAULT_BASE_URL, env = "DEPOT_BASE_URL")]
    pub base_url: String,

    /// Public base URL of the IIIF Image API server that serves the TIFFs.
    #[arg(long, default_value = DEFAULT_IMAGE_SERVICE_URL, env = "DEPOT_IMAGE_SERVICE_URL")]
    pub image_service_url: String,

    /// Language tag used alongside `none` for manifest labels.
    #[arg(long, default_value = DEFAULT_LABEL_LANGUAGE, env = "DEPOT_LABEL_LANGUAGE")]
    pub label_language: String,

    // =========================================================================
    // Worker Configuration
    // =========================================================================
    /// Maximum number of simultaneous conversions.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY, env = "DEPOT_CONCURRENCY")]
    pub concurrency: usize,

    /// Maximum jobs started per rate window, across all workers.
    #[arg(long, default_value_t = DEFAULT_RATE_LIMIT, env = "DEPOT_RATE_LIMIT")]
    pub rate_limit: u32,

    /// Length of the rate window in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RATE_WINDOW_MS, env = "DEPOT_RATE_WINDOW_MS")]
    pub rate_window_ms: u64,

    /// Attempts per job before a failure is final.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS, env = "DEPOT_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds; doubles on each retry.
    #[arg(long, default_value_t = DEFAULT_BACKOFF_MS, env = "DEPOT_BACKOFF_MS")]
    pub backoff_ms: u64,

    /// Seconds allowed for each measurement or conversion.
    #[arg(long, default_value_t = DEFAULT_CONVERT_TIMEOUT_SECS, env = "DEPOT_CONVERT_TIMEOUT")]
    pub convert_timeout: u64,

    /// Output tile edge length in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "DEPOT_TILE_SIZE")]
    pub tile_size: u32,

    /// Output tile compression.
    #[arg(long, value_enum, default_value_t = CompressionArg::Lzw, env = "DEPOT_COMPRESSION")]
    pub compression: CompressionArg,

    /// Seconds between sweeps for newly uploaded images.
    #[arg(long, default_value_t = DEFAULT_SCAN_INTERVAL_SECS, env = "DEPOT_SCAN_INTERVAL")]
    pub scan_interval: u64,

    // =========================================================================
    // HTTP Configuration
    // =========================================================================
    /// HTTP Cache-Control max-age for public manifests, in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "DEPOT_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    /// Allowed CORS origins for `/api` routes (comma-separated).
    ///
    /// If not specified, allows any origin. Manifests always allow any origin.
    #[arg(long, env = "DEPOT_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;

        for (name, url) in [
            ("base_url", &self.base_url),
            ("image_service_url", &self.image_service_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("{} must be an http(s) URL, got '{}'", name, url));
            }
        }

        if self.label_language.trim().is_empty() {
            return Err("label_language must not be empty".to_string());
        }

        if self.concurrency == 0 {
            return Err("concurrency must be greater than 0".to_string());
        }
        if self.rate_limit == 0 {
            return Err("rate_limit must be greater than 0".to_string());
        }
        if self.rate_window_ms == 0 {
            return Err("rate_window_ms must be greater than 0".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.convert_timeout == 0 {
            return Err("convert_timeout must be greater than 0".to_string());
        }
        if self.scan_interval == 0 {
            return Err("scan_interval must be greater than 0".to_string());
        }

        if !(MIN_TILE_SIZE..=MAX_TILE_SIZE).contains(&self.tile_size) {
            return Err(format!(
                "tile_size must be between {} and {}",
                MIN_TILE_SIZE, MAX_TILE_SIZE
            ));
        }

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_concurrency(self.concurrency)
            .with_rate_limit(self.rate_limit, Duration::from_millis(self.rate_window_ms))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, Duration::from_millis(self.backoff_ms))
    }

    pub fn convert_timeout(&self) -> Duration {
        Duration::from_secs(self.convert_timeout)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    pub fn convert_options(&self) -> ConvertOptions {
        ConvertOptions {
            tile_width: self.tile_size,
            tile_height: self.tile_size,
            compression: self.compression.into(),
        }
    }

    pub fn manifest_config(&self) -> ManifestConfig {
        ManifestConfig::new(&self.base_url, &self.image_service_url)
            .with_label_language(&self.label_language)
    }

    pub fn router_config(&self) -> RouterConfig {
        let mut router_config = RouterConfig::new()
            .with_cache_max_age(self.cache_max_age)
            .with_tracing(!self.no_tracing);

        if let Some(ref origins) = self.cors_origins {
            router_config = router_config.with_cors_origins(origins.clone());
        }

        router_config
    }
}

/// Settings for `iiif-depot check`.
#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    #[command(flatten)]
    pub storage: StorageConfig,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CheckConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
