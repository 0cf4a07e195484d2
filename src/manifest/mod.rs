//! IIIF Presentation 3 manifests.
//!
//! [`build_manifest`] is a pure function of a Resource, its Images and a
//! [`ManifestConfig`]. The same input always yields the same document:
//! canvases in `order_index` order and the same thumbnail.
//!
//! ```text
//! Manifest
//!  ├── thumbnail ─► {service}/full/!300,300/0/default.jpg
//!  └── items[i]: Canvas  …/canvas/{i}
//!        └── AnnotationPage  …/page
//!              └── Annotation (painting)  …/annotation
//!                    └── body {service}/full/max/0/default.jpg
//!                          └── service: ImageService2, level2
//! ```

mod builder;
mod types;

pub use builder::{
    build_manifest, parse_metadata, ManifestConfig, MetadataPair, DEFAULT_ATTRIBUTION_LABEL,
    DEFAULT_HOMEPAGE_LABEL, DEFAULT_LABEL_LANGUAGE, DEFAULT_THUMBNAIL_SIZE,
};
pub use types::{
    Annotation, AnnotationPage, Canvas, Homepage, ImageBody, ImageService, LabelValue,
    LanguageMap, Manifest, Thumbnail, PRESENTATION_CONTEXT,
};
