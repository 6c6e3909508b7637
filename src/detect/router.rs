//! Per-call choice between the remote backend and the local engine.
//!
//! Availability is re-read on every call, so routing self-heals as soon as
//! the monitor sees the backend again and self-degrades within one call of a
//! remote failure. The remote call is never retried within a request.

use super::image;
use super::local::{CategoryTable, LocalEngine};
use super::remote::RemoteBackend;
use super::types::{Backend, Detection, DetectionRequest, DetectionResult};
use crate::control::{AgentEvent, EventBus, Notice};
use crate::error::OfflineError;
use crate::health::HealthMonitor;
use crate::observability::Metrics;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a detection call was served.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    Remote(DetectionResult),
    Local {
        result: DetectionResult,
        /// The remote failure that caused this call to fall back, if the
        /// remote was tried at all.
        downgrade: Option<OfflineError>,
    },
    /// Neither backend was usable. Recoverable: the caller shows a notice.
    Unavailable { downgrade: Option<OfflineError> },
}

impl DetectionOutcome {
    pub fn backend(&self) -> Option<Backend> {
        match self {
            Self::Remote(_) => Some(Backend::Remote),
            Self::Local { .. } => Some(Backend::Local),
            Self::Unavailable { .. } => None,
        }
    }

    /// Detections of the call; empty when no detector was available.
    pub fn detections(&self) -> &[Detection] {
        match self {
            Self::Remote(result) | Self::Local { result, .. } => &result.detections,
            Self::Unavailable { .. } => &[],
        }
    }

    pub fn result(&self) -> Option<&DetectionResult> {
        match self {
            Self::Remote(result) | Self::Local { result, .. } => Some(result),
            Self::Unavailable { .. } => None,
        }
    }

    /// User-visible notice this outcome carries.
    pub fn notice(&self) -> Option<Notice> {
        match self {
            Self::Unavailable { .. } => Some(Notice::NoDetectorAvailable),
            _ => None,
        }
    }
}

pub struct DetectionRouter {
    health: HealthMonitor,
    remote: Arc<RemoteBackend>,
    local: Arc<dyn LocalEngine>,
    table: CategoryTable,
    events: EventBus,
    metrics: Arc<Metrics>,
    request_timeout: Duration,
    max_image_side: u32,
}

impl DetectionRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        health: HealthMonitor,
        remote: Arc<RemoteBackend>,
        local: Arc<dyn LocalEngine>,
        table: CategoryTable,
        events: EventBus,
        metrics: Arc<Metrics>,
        request_timeout: Duration,
        max_image_side: u32,
    ) -> Self {
        Self {
            health,
            remote,
            local,
            table,
            events,
            metrics,
            request_timeout,
            max_image_side,
        }
    }

    pub fn local_engine(&self) -> &Arc<dyn LocalEngine> {
        &self.local
    }

    pub async fn detect(&self, request: &DetectionRequest) -> DetectionOutcome {
        let mut downgrade = None;

        if self.health.is_available() {
            match image::normalize(&request.image, self.max_image_side) {
                // The image, not the backend, is at fault; availability stands.
                Err(e) => tracing::warn!(error = %e, "Image not uploadable, using local engine"),
                Ok(upload) => match self.detect_remote(&upload, request).await {
                    Ok(result) => {
                        self.metrics.detection(Backend::Remote.as_str());
                        tracing::debug!(
                            backend = "remote",
                            detections = result.detections.len(),
                            latency_ms = result.latency_ms,
                            "Detection served"
                        );
                        return DetectionOutcome::Remote(result);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Remote detection failed, falling back to local engine");
                        self.health.mark_unavailable(&e);
                        downgrade = Some(e);
                    }
                },
            }
        }

        if self.local.is_loaded() {
            let started = Instant::now();
            match self.local.infer(&request.image).await {
                Ok(raw) => {
                    let detections = self.table.enrich(raw, request.confidence_threshold);
                    self.metrics.detection(Backend::Local.as_str());
                    tracing::debug!(
                        backend = "local",
                        detections = detections.len(),
                        "Detection served"
                    );
                    return DetectionOutcome::Local {
                        result: DetectionResult {
                            detections,
                            backend: Backend::Local,
                            latency_ms: u64::try_from(started.elapsed().as_millis())
                                .unwrap_or(u64::MAX),
                            processing_time_ms: None,
                            model_info: None,
                            recommendations: Vec::new(),
                        },
                        downgrade,
                    };
                }
                Err(e) => tracing::warn!(error = %e, "Local inference failed"),
            }
        }

        self.metrics.detection("none");
        tracing::warn!("No detector available");
        self.events.emit(AgentEvent::Notice(Notice::NoDetectorAvailable));
        DetectionOutcome::Unavailable { downgrade }
    }

    async fn detect_remote(
        &self,
        upload: &[u8],
        request: &DetectionRequest,
    ) -> Result<DetectionResult, OfflineError> {
        let call = self.remote.detect(
            image::encode_base64(upload),
            request.confidence_threshold,
            &request.model_version,
        );
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(OfflineError::Timeout(self.request_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::local::RawDetection;
    use crate::detect::types::{BoundingBox, WasteCategory};
    use crate::error::OfflineResult;
    use async_trait::async_trait;
    use ::image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use serde_json::json;
    use std::io::Cursor;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StubEngine {
        loaded: bool,
    }

    #[async_trait]
    impl LocalEngine for StubEngine {
        fn is_loaded(&self) -> bool {
            self.loaded
        }

        async fn load(&self, _weights: Vec<u8>) -> OfflineResult<()> {
            Ok(())
        }

        async fn infer(&self, _image: &[u8]) -> OfflineResult<Vec<RawDetection>> {
            Ok(vec![RawDetection {
                label: "Aluminum Can".into(),
                confidence: 0.9,
                bbox: BoundingBox::from([1.0, 2.0, 3.0, 4.0]),
                category: None,
            }])
        }
    }

    fn jpeg() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    fn router(base_url: &str, engine_loaded: bool) -> (DetectionRouter, HealthMonitor, EventBus) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let remote = Arc::new(RemoteBackend::new(
            base_url,
            Duration::from_secs(2),
            Duration::from_secs(1),
        ));
        let health = HealthMonitor::new(remote.clone(), Duration::from_secs(1), 1, metrics.clone());
        let events = EventBus::new();
        let router = DetectionRouter::new(
            health.clone(),
            remote,
            Arc::new(StubEngine {
                loaded: engine_loaded,
            }),
            CategoryTable::default(),
            events.clone(),
            metrics,
            Duration::from_secs(2),
            640,
        );
        (router, health, events)
    }

    async fn healthy_server(detect: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(detect)
            .mount(&server)
            .await;
        server
    }

    fn request() -> DetectionRequest {
        DetectionRequest::new(jpeg(), 0.5, "latest")
    }

    #[tokio::test]
    async fn healthy_backend_serves_remote() {
        let server = healthy_server(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "detections": [{
                "id": "det_1", "label": "Plastic Bottle", "category": "recycle",
                "confidence": 0.95, "bbox": [0, 0, 5, 5]
            }],
            "processing_time": 0.1
        })))
        .await;
        let (router, health, _) = router(&server.uri(), true);
        health.probe().await;

        let outcome = router.detect(&request()).await;
        assert_eq!(outcome.backend(), Some(Backend::Remote));
        assert_eq!(outcome.detections().len(), 1);
    }

    #[tokio::test]
    async fn remote_failure_downgrades_within_one_call() {
        let server = healthy_server(ResponseTemplate::new(500)).await;
        let (router, health, _) = router(&server.uri(), true);
        health.probe().await;
        assert!(health.is_available());

        let outcome = router.detect(&request()).await;
        match &outcome {
            DetectionOutcome::Local { result, downgrade } => {
                assert_eq!(result.backend, Backend::Local);
                assert_eq!(result.detections[0].category, WasteCategory::Recycle);
                assert_eq!(
                    downgrade.as_ref(),
                    Some(&OfflineError::BackendRejected { status: 500 })
                );
            }
            other => panic!("expected local outcome, got {other:?}"),
        }
        assert!(!health.is_available());

        // Next call skips the remote entirely.
        let outcome = router.detect(&request()).await;
        assert!(
            matches!(outcome, DetectionOutcome::Local { downgrade: None, .. }),
            "{outcome:?}"
        );
        let detect_calls = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/detect")
            .count();
        assert_eq!(detect_calls, 1);
    }

    #[tokio::test]
    async fn unavailable_remote_is_not_contacted() {
        let server = healthy_server(ResponseTemplate::new(200)).await;
        let (router, _, _) = router(&server.uri(), true);

        let outcome = router.detect(&request()).await;
        assert_eq!(outcome.backend(), Some(Backend::Local));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_detector_is_recoverable_notice() {
        let (router, _, events) = router("http://127.0.0.1:9", false);
        let mut rx = events.subscribe();

        let outcome = router.detect(&request()).await;
        assert_eq!(outcome, DetectionOutcome::Unavailable { downgrade: None });
        assert!(outcome.detections().is_empty());
        assert_eq!(outcome.notice(), Some(Notice::NoDetectorAvailable));
        assert_eq!(
            rx.recv().await.unwrap(),
            AgentEvent::Notice(Notice::NoDetectorAvailable)
        );
    }

    #[tokio::test]
    async fn self_heals_when_backend_returns() {
        let server = healthy_server(ResponseTemplate::new(200).set_body_json(json!({
            "success": true, "detections": []
        })))
        .await;
        let (router, health, _) = router(&server.uri(), true);
        health.mark_unavailable(&OfflineError::NetworkUnavailable("test".into()));
        assert_eq!(router.detect(&request()).await.backend(), Some(Backend::Local));

        health.probe().await;
        assert_eq!(router.detect(&request()).await.backend(), Some(Backend::Remote));
    }
}
