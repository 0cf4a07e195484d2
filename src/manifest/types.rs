//! IIIF Presentation API 3.0 document types.
//!
//! Only the subset this crate emits is modelled. Field order follows the
//! order in which viewers conventionally expect them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::ViewingDirection;

/// JSON-LD context of every Presentation 3 manifest.
pub const PRESENTATION_CONTEXT: &str = "http://iiif.io/api/presentation/3/context.json";

/// Language tag -> strings. A `BTreeMap` keeps serialization order stable.
pub type LanguageMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub label: LanguageMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<LanguageMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<LabelValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_statement: Option<LabelValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rights: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<Vec<Homepage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Vec<Thumbnail>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewing_direction: Option<ViewingDirection>,
    pub items: Vec<Canvas>,
}

/// One `label`/`value` pair, used by `metadata` and `requiredStatement`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelValue {
    pub label: LanguageMap,
    pub value: LanguageMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Homepage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub label: LanguageMap,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Canvas {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub label: LanguageMap,
    pub width: u32,
    pub height: u32,
    pub items: Vec<AnnotationPage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationPage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub items: Vec<Annotation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub motivation: String,
    pub target: String,
    pub body: ImageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBody {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub service: Vec<ImageService>,
}

/// Reference to the IIIF Image API endpoint serving a pyramid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageService {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub profile: String,
}
