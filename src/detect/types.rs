//! Wire and domain types shared by the remote backend and the local engine.

use serde::{Deserialize, Serialize};

// ── Categories ──────────────────────────────────────────────────

/// Disposal category of a detected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WasteCategory {
    Recycle,
    Compost,
    Trash,
    Hazardous,
    /// Any category string the backend sends that we do not know.
    #[serde(other)]
    Unknown,
}

impl WasteCategory {
    pub const KNOWN: [WasteCategory; 4] = [Self::Recycle, Self::Compost, Self::Trash, Self::Hazardous];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recycle => "recycle",
            Self::Compost => "compost",
            Self::Trash => "trash",
            Self::Hazardous => "hazardous",
            Self::Unknown => "unknown",
        }
    }

    /// Minimum confidence a detection of this category needs to be kept.
    pub fn confidence_floor(&self) -> f32 {
        match self {
            Self::Recycle => 0.7,
            Self::Compost => 0.8,
            Self::Trash => 0.6,
            Self::Hazardous => 0.9,
            Self::Unknown => 0.5,
        }
    }
}

impl std::fmt::Display for WasteCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Geometry ────────────────────────────────────────────────────

/// Axis-aligned box in image pixels. On the wire: `[x, y, width, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x, y, width, height]: [f32; 4]) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

// ── Requests and results ────────────────────────────────────────

/// Which backend produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Remote,
    Local,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

/// One image to classify.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRequest {
    /// Encoded image bytes (JPEG, PNG).
    pub image: Vec<u8>,
    /// Detections below this confidence are discarded.
    pub confidence_threshold: f32,
    /// Model version hint forwarded to the remote backend.
    pub model_version: String,
}

impl DetectionRequest {
    pub fn new(image: Vec<u8>, confidence_threshold: f32, model_version: impl Into<String>) -> Self {
        Self {
            image,
            confidence_threshold: confidence_threshold.clamp(0.0, 1.0),
            model_version: model_version.into(),
        }
    }
}

/// A classified item with disposal guidance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: String,
    pub label: String,
    pub category: WasteCategory,
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub tips: Vec<String>,
    #[serde(default)]
    pub environmental_impact: serde_json::Map<String, serde_json::Value>,
}

/// Output of one detection call, tagged with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    pub backend: Backend,
    /// Wall-clock time of the call as seen by the caller.
    pub latency_ms: u64,
    /// Processing time reported by the backend itself, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_info: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<serde_json::Value>,
}

/// User correction of a past detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub detection_id: String,
    pub user_correction: String,
    /// How confident the user is in their correction, 0.0 – 1.0.
    pub confidence_rating: f32,
    pub was_helpful: bool,
}
