//! Pure Resource + Images -> Manifest mapping.

use serde_json::Value;
use tracing::warn;

use crate::error::ManifestError;
use crate::model::{Image, ImageStatus, Resource};

use super::types::{
    Annotation, AnnotationPage, Canvas, Homepage, ImageBody, ImageService, LabelValue,
    LanguageMap, Manifest, Thumbnail, PRESENTATION_CONTEXT,
};

/// Language tag used alongside `none` when none is configured.
pub const DEFAULT_LABEL_LANGUAGE: &str = "ja";

/// Bounding box edge of the manifest thumbnail.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 300;

pub const DEFAULT_ATTRIBUTION_LABEL: &str = "帰属";

pub const DEFAULT_HOMEPAGE_LABEL: &str = "ホームページ";

/// URLs and labels the builder needs beyond the Resource itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestConfig {
    /// Public base URL of this service, e.g. `https://depot.example.org`
    pub base_url: String,
    /// Public base URL of the IIIF Image API server
    pub image_service_url: String,
    pub label_language: String,
    pub attribution_label: String,
    pub homepage_label: String,
    pub thumbnail_size: u32,
}

impl ManifestConfig {
    pub fn new(base_url: impl Into<String>, image_service_url: impl Into<String>) -> Self {
        Self {
            base_url: trim_slash(base_url.into()),
            image_service_url: trim_slash(image_service_url.into()),
            label_language: DEFAULT_LABEL_LANGUAGE.to_string(),
            attribution_label: DEFAULT_ATTRIBUTION_LABEL.to_string(),
            homepage_label: DEFAULT_HOMEPAGE_LABEL.to_string(),
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
        }
    }

    pub fn with_label_language(mut self, language: impl Into<String>) -> Self {
        self.label_language = language.into();
        self
    }

    pub fn with_attribution_label(mut self, label: impl Into<String>) -> Self {
        self.attribution_label = label.into();
        self
    }

    pub fn with_homepage_label(mut self, label: impl Into<String>) -> Self {
        self.homepage_label = label.into();
        self
    }

    pub fn with_thumbnail_size(mut self, size: u32) -> Self {
        self.thumbnail_size = size;
        self
    }

    /// `{base_url}/iiif/manifests/{resource_id}/manifest.json`
    pub fn manifest_id(&self, resource_id: &str) -> String {
        format!("{}/iiif/manifests/{}/manifest.json", self.base_url, resource_id)
    }

    fn canvas_id(&self, resource_id: &str, index: usize) -> String {
        format!("{}/iiif/manifests/{}/canvas/{}", self.base_url, resource_id, index)
    }

    /// Image API identifier for an Image: its output filename without `.tif`,
    /// or the Image id when no output exists yet.
    fn service_id(&self, image: &Image) -> String {
        let name = image
            .output_path
            .as_deref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.tif", image.id));
        let stem = name.strip_suffix(".tif").unwrap_or(&name);
        format!("{}/{}", self.image_service_url, stem)
    }

    /// `none` plus the configured language.
    fn bilingual(&self, text: &str) -> LanguageMap {
        let mut map = LanguageMap::new();
        map.insert("none".to_string(), vec![text.to_string()]);
        map.insert(self.label_language.clone(), vec![text.to_string()]);
        map
    }

    fn localized(&self, text: &str) -> LanguageMap {
        let mut map = LanguageMap::new();
        map.insert(self.label_language.clone(), vec![text.to_string()]);
        map
    }
}

fn trim_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

// =============================================================================
// Metadata
// =============================================================================

/// One custom metadata entry of a Resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPair {
    pub label: String,
    pub value: String,
}

/// Parse a Resource's stored metadata: a JSON list of
/// `{"label": ..., "value": ...}` objects.
///
/// Entries without a string label, or whose value is not a scalar, are
/// skipped. A document that is not a JSON list is an error.
pub fn parse_metadata(raw: &str) -> Result<Vec<MetadataPair>, ManifestError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ManifestError::InvalidJson(e.to_string()))?;
    let Value::Array(entries) = value else {
        return Err(ManifestError::NotAList);
    };

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let label = entry.get("label")?.as_str()?.trim();
            if label.is_empty() {
                return None;
            }
            let value = match entry.get("value")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some(MetadataPair {
                label: label.to_string(),
                value,
            })
        })
        .collect())
}

// =============================================================================
// Builder
// =============================================================================

/// Build the Presentation 3 manifest of a Resource.
///
/// Only `ready` Images with known dimensions become canvases, in
/// `order_index` order. The caller decides whether the Resource may be
/// shown at all.
pub fn build_manifest(resource: &Resource, images: &[Image], config: &ManifestConfig) -> Manifest {
    let mut sorted: Vec<&Image> = images.iter().collect();
    sorted.sort_by_key(|image| image.order_index);

    let items = sorted
        .iter()
        .filter(|image| image.status == ImageStatus::Ready)
        .filter_map(|image| image.dimensions().map(|dims| (*image, dims)))
        .enumerate()
        .map(|(index, (image, (width, height)))| {
            build_canvas(resource, image, index, width, height, config)
        })
        .collect();

    let thumbnail = sorted
        .first()
        .filter(|image| image.status == ImageStatus::Ready)
        .map(|image| {
            let size = config.thumbnail_size;
            vec![Thumbnail {
                id: format!(
                    "{}/full/!{},{}/0/default.jpg",
                    config.service_id(image),
                    size,
                    size
                ),
                kind: "Image".to_string(),
                format: "image/jpeg".to_string(),
            }]
        });

    let metadata = present(&resource.metadata)
        .and_then(|raw| match parse_metadata(raw) {
            Ok(pairs) => Some(pairs),
            Err(e) => {
                warn!(resource_id = %resource.id, error = %e, "Omitting unreadable metadata");
                None
            }
        })
        .filter(|pairs| !pairs.is_empty())
        .map(|pairs| {
            pairs
                .iter()
                .map(|pair| LabelValue {
                    label: config.bilingual(&pair.label),
                    value: config.bilingual(&pair.value),
                })
                .collect()
        });

    Manifest {
        context: PRESENTATION_CONTEXT.to_string(),
        id: config.manifest_id(&resource.id),
        kind: "Manifest".to_string(),
        label: config.bilingual(&resource.title),
        summary: present(&resource.description).map(|d| config.bilingual(d)),
        metadata,
        required_statement: present(&resource.attribution).map(|a| LabelValue {
            label: config.bilingual(&config.attribution_label),
            value: config.bilingual(a),
        }),
        rights: present(&resource.license).map(str::to_string),
        homepage: present(&resource.homepage).map(|url| {
            vec![Homepage {
                id: url.to_string(),
                kind: "Text".to_string(),
                label: config.bilingual(&config.homepage_label),
                format: "text/html".to_string(),
            }]
        }),
        thumbnail,
        viewing_direction: resource.viewing_direction,
        items,
    }
}

fn build_canvas(
    resource: &Resource,
    image: &Image,
    index: usize,
    width: u32,
    height: u32,
    config: &ManifestConfig,
) -> Canvas {
    let canvas_id = config.canvas_id(&resource.id, index);
    let service_id = config.service_id(image);

    let annotation = Annotation {
        id: format!("{}/annotation", canvas_id),
        kind: "Annotation".to_string(),
        motivation: "painting".to_string(),
        target: canvas_id.clone(),
        body: ImageBody {
            id: format!("{}/full/max/0/default.jpg", service_id),
            kind: "Image".to_string(),
            format: "image/jpeg".to_string(),
            width,
            height,
            service: vec![ImageService {
                id: service_id,
                kind: "ImageService2".to_string(),
                profile: "level2".to_string(),
            }],
        },
    };

    Canvas {
        id: canvas_id.clone(),
        kind: "Canvas".to_string(),
        label: config.localized(&image.original_filename),
        width,
        height,
        items: vec![AnnotationPage {
            id: format!("{}/page", canvas_id),
            kind: "AnnotationPage".to_string(),
            items: vec![annotation],
        }],
    }
}

// =============================================================================
// Tests
// =============================================================================
