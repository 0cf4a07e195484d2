//! Conversion of uploaded images into tiled pyramidal TIFFs.
//!
//! The worker pool treats conversion as an opaque collaborator with two
//! calls:
//!
//! ```text
//!   source ──measure─► Dimensions { width, height }
//!   source ──convert(options)──► output.tif
//! ```
//!
//! [`MagickConverter`] is the production implementation. Tests substitute
//! their own [`Converter`] so no external binary is needed, and any
//! converter can be bounded with [`TimeoutConverter`].

mod magick;

pub use magick::MagickConverter;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConvertError;

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Pixel dimensions reported by [`Converter::measure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Compression applied to output tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Lzw,
    Deflate,
    Jpeg,
    None,
}

impl Compression {
    /// Name understood by ImageMagick's `-compress` flag.
    pub fn as_magick_arg(self) -> &'static str {
        match self {
            Compression::Lzw => "lzw",
            Compression::Deflate => "zip",
            Compression::Jpeg => "jpeg",
            Compression::None => "none",
        }
    }
}

/// Tiling and compression settings for [`Converter::convert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertOptions {
    pub tile_width: u32,
    pub tile_height: u32,
    pub compression: Compression,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
            compression: Compression::Lzw,
        }
    }
}

/// Narrow interface to the image conversion tool.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Read the pixel dimensions of `source`.
    async fn measure(&self, source: &Path) -> Result<Dimensions, ConvertError>;

    /// Write a tiled pyramidal TIFF of `source` to `output` and return the
    /// path actually written.
    async fn convert(
        &self,
        source: &Path,
        output: &Path,
        options: &ConvertOptions,
    ) -> Result<PathBuf, ConvertError>;
}

// =============================================================================
// TimeoutConverter
// =============================================================================

/// Bounds every call of an inner converter by a deadline.
///
/// On expiry the inner future is dropped and the call fails with
/// [`ConvertError::Timeout`].
pub struct TimeoutConverter<C> {
    inner: C,
    timeout: Duration,
}

impl<C: Converter> TimeoutConverter<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl<C: Converter> Converter for TimeoutConverter<C> {
    async fn measure(&self, source: &Path) -> Result<Dimensions, ConvertError> {
        tokio::time::timeout(self.timeout, self.inner.measure(source))
            .await
            .map_err(|_| ConvertError::Timeout(self.timeout))?
    }

    async fn convert(
        &self,
        source: &Path,
        output: &Path,
        options: &ConvertOptions,
    ) -> Result<PathBuf, ConvertError> {
        tokio::time::timeout(self.timeout, self.inner.convert(source, output, options))
            .await
            .map_err(|_| ConvertError::Timeout(self.timeout))?
    }
}
