//! Request identity, partitions and the path-based classifier.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ── Requests ────────────────────────────────────────────────────

/// HTTP method of an intercepted request. Only `Get` is ever cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// An outbound resource fetch routed through the cache orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub method: Method,
    pub url: String,
    /// Top-level page navigation; these get a synthesized offline page when
    /// nothing else can answer.
    #[serde(default)]
    pub navigation: bool,
    /// Request body for pass-through (non-GET) requests.
    #[serde(default)]
    pub body: Option<Vec<u8>>,
}

impl ResourceRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            navigation: false,
            body: None,
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            navigation: true,
            ..Self::get(url)
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            navigation: false,
            body: Some(body),
        }
    }

    pub fn is_cacheable(&self) -> bool {
        self.method == Method::Get
    }

    /// Canonical form of the URL: parsed, fragment stripped. Unparseable URLs
    /// are kept verbatim so they still key consistently.
    pub fn canonical_url(&self) -> String {
        match reqwest::Url::parse(&self.url) {
            Ok(mut url) => {
                url.set_fragment(None);
                url.to_string()
            }
            Err(_) => self.url.clone(),
        }
    }

    /// Path component used for partition classification.
    pub fn path(&self) -> String {
        match reqwest::Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => self
                .url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::derive(self.method, &self.canonical_url())
    }
}

/// Content key of a request: SHA-256 over `METHOD canonical-url`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity(String);

impl ResourceIdentity {
    pub fn derive(method: Method, canonical_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(canonical_url.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 of a payload, hex encoded.
pub fn payload_digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

// ── Partitions ──────────────────────────────────────────────────

/// Resolution strategy applied by a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

/// The fixed set of partitions owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionId {
    /// Application shell: HTML, JS, CSS, fonts, manifest.
    Static,
    /// Model weights for the local engine.
    Models,
    Images,
    /// API responses and JSON data.
    Api,
}

impl PartitionId {
    pub const ALL: [PartitionId; 4] = [Self::Static, Self::Models, Self::Images, Self::Api];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Models => "models",
            Self::Images => "images",
            Self::Api => "api",
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Self::Static => Strategy::StaleWhileRevalidate,
            Self::Models | Self::Images => Strategy::CacheFirst,
            Self::Api => Strategy::NetworkFirst,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Some(Self::Static),
            "models" | "model" => Some(Self::Models),
            "images" | "image" => Some(Self::Images),
            "api" => Some(Self::Api),
            _ => None,
        }
    }

    /// Storage namespace of this partition for one generation.
    pub fn storage_name(&self, generation: &VersionTag) -> String {
        format!("ecoscan-{}-{}", self.as_str(), generation)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build/release tag binding a set of partitions together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionTag(String);

impl VersionTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A partition bound to a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePartition {
    pub id: PartitionId,
    pub strategy: Strategy,
    pub generation: VersionTag,
}

impl CachePartition {
    pub fn new(id: PartitionId, generation: VersionTag) -> Self {
        Self {
            id,
            strategy: id.strategy(),
            generation,
        }
    }

    pub fn storage_name(&self) -> String {
        self.id.storage_name(&self.generation)
    }
}

// ── Classification ──────────────────────────────────────────────

const MODEL_EXTENSIONS: &[&str] = &["onnx", "tflite", "bin", "pt", "safetensors", "wasm"];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif", "svg", "ico", "avif"];

/// Pick the partition for a request from its pathname and extension.
pub fn classify(request: &ResourceRequest) -> PartitionId {
    let path = request.path().to_ascii_lowercase();
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext.to_string())
        .unwrap_or_default();

    if path.starts_with("/models/") || MODEL_EXTENSIONS.contains(&extension.as_str()) {
        return PartitionId::Models;
    }
    if path.starts_with("/api/") || path == "/api" {
        return PartitionId::Api;
    }
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        return PartitionId::Images;
    }
    // Dynamic JSON data; the web manifest is part of the shell.
    if extension == "json" && !path.ends_with("manifest.json") {
        return PartitionId::Api;
    }
    PartitionId::Static
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_fragment() {
        let a = ResourceRequest::get("https://app.example/index.html#top");
        let b = ResourceRequest::get("https://app.example/index.html");
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn identity_distinguishes_method_and_query() {
        let get = ResourceRequest::get("https://app.example/api/items?page=1");
        let other = ResourceRequest::get("https://app.example/api/items?page=2");
        let head = ResourceRequest {
            method: Method::Head,
            ..get.clone()
        };
        assert_ne!(get.identity(), other.identity());
        assert_ne!(get.identity(), head.identity());
        assert_eq!(get.identity().as_str().len(), 64);
    }

    #[test]
    fn only_get_is_cacheable() {
        assert!(ResourceRequest::get("https://a/x").is_cacheable());
        assert!(!ResourceRequest::post("https://a/x", vec![1]).is_cacheable());
    }

    #[test]
    fn classify_model_weights() {
        let req = ResourceRequest::get("https://cdn.example/models/yolov8n-waste.onnx");
        assert_eq!(classify(&req), PartitionId::Models);
        let req = ResourceRequest::get("https://cdn.example/weights/group1-shard1of4.bin");
        assert_eq!(classify(&req), PartitionId::Models);
        let req = ResourceRequest::get("https://cdn.example/models/model.json");
        assert_eq!(classify(&req), PartitionId::Models);
    }

    #[test]
    fn classify_images() {
        for url in ["https://a/icons/icon-192.png", "https://a/img/Photo.JPEG?x=1"] {
            assert_eq!(classify(&ResourceRequest::get(url)), PartitionId::Images);
        }
    }

    #[test]
    fn classify_api_and_data() {
        assert_eq!(
            classify(&ResourceRequest::get("https://a/api/health")),
            PartitionId::Api
        );
        assert_eq!(
            classify(&ResourceRequest::get("https://a/data/waste-categories.json")),
            PartitionId::Api
        );
    }

    #[test]
    fn classify_shell() {
        for url in [
            "https://a/",
            "https://a/index.html",
            "https://a/assets/app-3f2a.js",
            "https://a/manifest.json",
        ] {
            assert_eq!(classify(&ResourceRequest::get(url)), PartitionId::Static, "{url}");
        }
    }

    #[test]
    fn strategies_per_partition() {
        assert_eq!(PartitionId::Static.strategy(), Strategy::StaleWhileRevalidate);
        assert_eq!(PartitionId::Models.strategy(), Strategy::CacheFirst);
        assert_eq!(PartitionId::Images.strategy(), Strategy::CacheFirst);
        assert_eq!(PartitionId::Api.strategy(), Strategy::NetworkFirst);
    }

    #[test]
    fn storage_name_is_namespaced_by_generation() {
        let p = CachePartition::new(PartitionId::Models, VersionTag::new("v2"));
        assert_eq!(p.storage_name(), "ecoscan-models-v2");
        assert_eq!(p.strategy, Strategy::CacheFirst);
    }

    #[test]
    fn partition_parse_accepts_aliases() {
        assert_eq!(PartitionId::parse("Model"), Some(PartitionId::Models));
        assert_eq!(PartitionId::parse("api"), Some(PartitionId::Api));
        assert_eq!(PartitionId::parse("bogus"), None);
    }
}
