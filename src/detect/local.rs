//! On-device inference seam and the category table applied to its output.

use super::types::{BoundingBox, Detection, WasteCategory};
use crate::cache::{CacheOrchestrator, ResourceRequest};
use crate::error::OfflineResult;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Raw output of the local engine: label, box and score. The engine may
/// already know the category; otherwise the [`CategoryTable`] decides.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub category: Option<WasteCategory>,
}

/// In-process inference engine (external collaborator).
#[async_trait]
pub trait LocalEngine: Send + Sync {
    /// Whether weights are loaded and `infer` can be called.
    fn is_loaded(&self) -> bool;

    /// Load model weights. Replaces any previously loaded model.
    async fn load(&self, weights: Vec<u8>) -> OfflineResult<()>;

    async fn infer(&self, image: &[u8]) -> OfflineResult<Vec<RawDetection>>;
}

/// Stand-in used when no on-device model is linked into the binary.
/// Never reports itself loaded, so routing falls through to "no detector".
pub struct NullEngine;

#[async_trait]
impl LocalEngine for NullEngine {
    fn is_loaded(&self) -> bool {
        false
    }

    async fn load(&self, weights: Vec<u8>) -> OfflineResult<()> {
        tracing::debug!(bytes = weights.len(), "No local engine linked; ignoring weights");
        Ok(())
    }

    async fn infer(&self, _image: &[u8]) -> OfflineResult<Vec<RawDetection>> {
        Ok(Vec::new())
    }
}

/// Fetch model weights through the cache (models partition, cache-first) and
/// hand them to the engine.
pub async fn load_weights(
    engine: &dyn LocalEngine,
    cache: &CacheOrchestrator,
    model_url: &str,
) -> OfflineResult<()> {
    let response = cache.resolve(&ResourceRequest::get(model_url)).await?;
    tracing::info!(
        url = model_url,
        bytes = response.body.len(),
        source = ?response.source,
        "Loading local model weights"
    );
    engine.load(response.body).await
}

// ── Category table ──────────────────────────────────────────────

/// Immutable label → category data plus disposal guidance.
pub struct CategoryTable {
    /// Keyword rules checked in order; first match wins.
    rules: Vec<(WasteCategory, Vec<&'static str>)>,
    environmental: HashMap<&'static str, Map<String, Value>>,
}

impl Default for CategoryTable {
    fn default() -> Self {
        let rules = vec![
            (
                WasteCategory::Hazardous,
                vec![
                    "battery", "paint", "chemical", "electronic", "phone", "bulb", "medicine",
                    "oil", "aerosol",
                ],
            ),
            (
                WasteCategory::Compost,
                vec![
                    "food", "fruit", "banana", "apple", "peel", "vegetable", "coffee", "leaf",
                    "leaves", "eggshell",
                ],
            ),
            (
                WasteCategory::Recycle,
                vec![
                    "bottle", "can", "aluminum", "paper", "cardboard", "glass", "jar", "carton",
                    "newspaper", "tin",
                ],
            ),
        ];

        let mut environmental = HashMap::new();
        for (key, data) in [
            (
                "plastic_bottle",
                json!({
                    "co2_footprint": 2.3,
                    "recycling_rate": 0.29,
                    "decomposition_time": "450 years",
                    "recycled_uses": ["clothing", "carpets", "park benches"]
                }),
            ),
            (
                "aluminum_can",
                json!({
                    "co2_footprint": 3.2,
                    "recycling_rate": 0.75,
                    "decomposition_time": "200-500 years",
                    "energy_saved_recycling": 0.95
                }),
            ),
            (
                "food_waste",
                json!({
                    "methane_production": 1.1,
                    "compost_time": "3-6 months",
                    "soil_improvement": "rich nutrients"
                }),
            ),
        ] {
            if let Value::Object(map) = data {
                environmental.insert(key, map);
            }
        }

        Self {
            rules,
            environmental,
        }
    }
}

impl CategoryTable {
    pub fn classify(&self, label: &str) -> WasteCategory {
        let label = label.to_lowercase();
        self.rules
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| label.contains(k)))
            .map_or(WasteCategory::Trash, |(category, _)| *category)
    }

    pub fn environmental_impact(&self, label: &str) -> Map<String, Value> {
        let key = label.trim().to_lowercase().replace(' ', "_");
        self.environmental.get(key.as_str()).cloned().unwrap_or_default()
    }

    pub fn instructions(&self, category: WasteCategory, label: &str) -> String {
        let item = label.to_lowercase();
        match category {
            WasteCategory::Recycle => format!(
                "Clean the {item}, remove any labels, and place in recycling bin. \
                 Check local guidelines for specific requirements."
            ),
            WasteCategory::Compost => format!(
                "Add the {item} to your compost bin or organic waste collection. \
                 Ensure no stickers or non-organic materials are attached."
            ),
            WasteCategory::Trash => format!(
                "Dispose of the {item} in regular waste bin. \
                 Consider if there are reusable alternatives for future use."
            ),
            WasteCategory::Hazardous => format!(
                "Take the {item} to designated hazardous waste facility. \
                 Do not dispose in regular trash or recycling."
            ),
            WasteCategory::Unknown => "Follow local waste disposal guidelines.".to_string(),
        }
    }

    pub fn tips(&self, category: WasteCategory, label: &str, env: &Map<String, Value>) -> Vec<String> {
        let mut tips = Vec::new();
        match category {
            WasteCategory::Recycle => {
                tips.push(format!(
                    "Recycling this {} saves energy and reduces landfill waste",
                    label.to_lowercase()
                ));
                if let Some(saved) = env.get("energy_saved_recycling").and_then(Value::as_f64) {
                    // Whole percent, truncated.
                    #[allow(clippy::cast_possible_truncation)]
                    let percent = (saved * 100.0) as i64;
                    tips.push(format!(
                        "Recycling saves {percent}% of energy vs. new production"
                    ));
                }
            }
            WasteCategory::Compost => {
                tips.push("Composting reduces methane emissions from landfills".to_string());
                if let Some(time) = env.get("compost_time").and_then(Value::as_str) {
                    tips.push(format!("This will decompose in approximately {time}"));
                }
            }
            WasteCategory::Trash => {
                tips.push("Consider reusable alternatives to reduce waste".to_string());
                if let Some(time) = env.get("decomposition_time").and_then(Value::as_str) {
                    tips.push(format!("This item takes {time} to decompose"));
                }
            }
            WasteCategory::Hazardous | WasteCategory::Unknown => {}
        }
        tips
    }

    /// Turn raw engine output into full detections. Each detection must clear
    /// both the request threshold and its category's floor.
    pub fn enrich(&self, raw: Vec<RawDetection>, threshold: f32) -> Vec<Detection> {
        raw.into_iter()
            .filter_map(|r| {
                let category = r.category.unwrap_or_else(|| self.classify(&r.label));
                if r.confidence < threshold.max(category.confidence_floor()) {
                    return None;
                }
                let environmental_impact = self.environmental_impact(&r.label);
                Some(Detection {
                    id: format!("local_{}", Uuid::new_v4().simple()),
                    instructions: self.instructions(category, &r.label),
                    tips: self.tips(category, &r.label, &environmental_impact),
                    label: r.label,
                    category,
                    confidence: r.confidence,
                    bbox: r.bbox,
                    environmental_impact,
                })
            })
            .collect()
    }
}
