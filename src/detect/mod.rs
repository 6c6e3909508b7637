//! Hybrid waste detection: remote backend when healthy, local engine otherwise.

pub mod image;
pub mod local;
pub mod remote;
pub mod router;
pub mod types;

pub use local::{load_weights, CategoryTable, LocalEngine, NullEngine, RawDetection};
pub use remote::RemoteBackend;
pub use router::{DetectionOutcome, DetectionRouter};
pub use types::{
    Backend, BoundingBox, Detection, DetectionRequest, DetectionResult, FeedbackRequest,
    WasteCategory,
};
