//! ImageMagick-backed converter.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use image::{ImageError, ImageReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ConvertError;

use super::{ConvertOptions, Converter, Dimensions};

/// Default ImageMagick binary.
pub const DEFAULT_CONVERT_BINARY: &str = "convert";

/// Measures with the `image` crate and converts by running ImageMagick's
/// `convert` with the `ptif:` coder.
#[derive(Debug, Clone)]
pub struct MagickConverter {
    binary: PathBuf,
}

impl Default for MagickConverter {
    fn default() -> Self {
        Self::new(DEFAULT_CONVERT_BINARY)
    }
}

impl MagickConverter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// First line of `convert -version`, used by the `check` command.
    pub async fn version(&self) -> Result<String, ConvertError> {
        let output = Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(ConvertError::Tool(format!(
                "{} -version exited with {}",
                self.binary.display(),
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    fn spawn_error(&self, err: std::io::Error) -> ConvertError {
        match err.kind() {
            ErrorKind::NotFound => {
                ConvertError::Tool(format!("{} not found on PATH", self.binary.display()))
            }
            _ => ConvertError::Tool(format!("failed to run {}: {}", self.binary.display(), err)),
        }
    }
}

async fn require_file(path: &Path) -> Result<(), ConvertError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(ConvertError::MissingFile(path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(ConvertError::MissingFile(path.to_path_buf()))
        }
        Err(e) => Err(ConvertError::Io(e.to_string())),
    }
}

fn classify_image_error(err: ImageError) -> ConvertError {
    match err {
        ImageError::IoError(e) => ConvertError::Io(e.to_string()),
        ImageError::Unsupported(e) => ConvertError::UnsupportedCodec(e.to_string()),
        ImageError::Decoding(e) => ConvertError::UnsupportedCodec(e.to_string()),
        other => ConvertError::Tool(other.to_string()),
    }
}

/// Map ImageMagick's stderr onto an error class.
fn classify_tool_failure(stderr: &str) -> ConvertError {
    let message = stderr.trim();
    if message.contains("no decode delegate") || message.contains("NoDecodeDelegate") {
        ConvertError::UnsupportedCodec(message.to_string())
    } else if message.contains("unable to open image") {
        ConvertError::Io(message.to_string())
    } else {
        ConvertError::Tool(message.to_string())
    }
}

#[async_trait]
impl Converter for MagickConverter {
    async fn measure(&self, source: &Path) -> Result<Dimensions, ConvertError> {
        require_file(source).await?;

        let path = source.to_path_buf();
        let (width, height) = tokio::task::spawn_blocking(move || {
            ImageReader::open(&path)
                .and_then(|reader| reader.with_guessed_format())
                .map_err(|e| ConvertError::Io(e.to_string()))?
                .into_dimensions()
                .map_err(classify_image_error)
        })
        .await
        .map_err(|e| ConvertError::Io(format!("measure task failed: {}", e)))??;

        debug!(source = %source.display(), width, height, "Measured image");
        Ok(Dimensions { width, height })
    }

    async fn convert(
        &self,
        source: &Path,
        output: &Path,
        options: &ConvertOptions,
    ) -> Result<PathBuf, ConvertError> {
        require_file(source).await?;

        if let Some(dir) = output.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ConvertError::Io(format!("{}: {}", dir.display(), e)))?;
        }

        let result = Command::new(&self.binary)
            .arg(source)
            .arg("-define")
            .arg(format!(
                "tiff:tile-geometry={}x{}",
                options.tile_width, options.tile_height
            ))
            .arg("-compress")
            .arg(options.compression.as_magick_arg())
            .arg(format!("ptif:{}", output.display()))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !result.status.success() {
            return Err(classify_tool_failure(&String::from_utf8_lossy(
                &result.stderr,
            )));
        }

        require_file(output).await.map_err(|_| {
            ConvertError::Tool(format!(
                "{} exited successfully but wrote no {}",
                self.binary.display(),
                output.display()
            ))
        })?;

        info!(source = %source.display(), output = %output.display(), "Pyramid TIFF created");
        Ok(output.to_path_buf())
    }
}
