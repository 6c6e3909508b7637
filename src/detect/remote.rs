//! HTTP client for the remote inference backend.
//!
//! Endpoints: `POST /detect`, `GET /health`, `POST /feedback`, plus the
//! generic `POST /<endpoint>` used by sync delivery.

use super::types::{Backend, Detection, DetectionResult, FeedbackRequest};
use crate::error::{OfflineError, OfflineResult};
use crate::health::HealthProbe;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Serialize)]
struct DetectBody<'a> {
    image_data: String,
    confidence_threshold: f32,
    model_version: &'a str,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    success: bool,
    #[serde(default)]
    detections: Vec<Detection>,
    /// Seconds.
    #[serde(default)]
    processing_time: Option<f64>,
    #[serde(default)]
    processing_time_ms: Option<f64>,
    #[serde(default)]
    model_info: Option<serde_json::Value>,
    #[serde(default)]
    recommendations: Vec<serde_json::Value>,
}

impl DetectResponse {
    fn processing_ms(&self) -> Option<f64> {
        self.processing_time_ms
            .or_else(|| self.processing_time.map(|secs| secs * 1000.0))
    }
}

pub struct RemoteBackend {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl RemoteBackend {
    pub fn new(base_url: &str, request_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(request_timeout.min(Duration::from_secs(5)))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
            probe_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Run one detection. `image_data` is already base64 encoded.
    pub async fn detect(
        &self,
        image_data: String,
        confidence_threshold: f32,
        model_version: &str,
    ) -> OfflineResult<DetectionResult> {
        let started = Instant::now();
        let body = DetectBody {
            image_data,
            confidence_threshold,
            model_version,
        };
        let resp = self
            .client
            .post(self.url("detect"))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| OfflineError::from_reqwest(&e, self.request_timeout))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OfflineError::BackendRejected {
                status: status.as_u16(),
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| OfflineError::from_reqwest(&e, self.request_timeout))?;
        let parsed: DetectResponse = serde_json::from_str(&text)
            .map_err(|e| OfflineError::MalformedPayload(format!("detect response: {e}")))?;
        if !parsed.success {
            return Err(OfflineError::MalformedPayload(
                "detect response reported success=false".into(),
            ));
        }

        let processing_time_ms = parsed.processing_ms();
        Ok(DetectionResult {
            detections: parsed.detections,
            backend: Backend::Remote,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            processing_time_ms,
            model_info: parsed.model_info,
            recommendations: parsed.recommendations,
        })
    }

    /// `GET /health`; 2xx means serving.
    pub async fn health(&self) -> OfflineResult<()> {
        let resp = self
            .client
            .get(self.url("health"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| OfflineError::from_reqwest(&e, self.probe_timeout))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(OfflineError::BackendRejected {
                status: resp.status().as_u16(),
            })
        }
    }

    /// POST a JSON payload and ignore the response body.
    pub async fn post_json(&self, endpoint: &str, payload: &serde_json::Value) -> OfflineResult<()> {
        let resp = self
            .client
            .post(self.url(endpoint))
            .timeout(self.request_timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| OfflineError::from_reqwest(&e, self.request_timeout))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(OfflineError::BackendRejected {
                status: resp.status().as_u16(),
            })
        }
    }

    pub async fn send_feedback(&self, feedback: &FeedbackRequest) -> OfflineResult<()> {
        let payload = serde_json::to_value(feedback)
            .map_err(|e| OfflineError::MalformedPayload(e.to_string()))?;
        self.post_json("feedback", &payload).await
    }
}

#[async_trait]
impl HealthProbe for RemoteBackend {
    async fn probe(&self) -> OfflineResult<()> {
        self.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::types::WasteCategory;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> RemoteBackend {
        RemoteBackend::new(
            &format!("{}/", server.uri()),
            Duration::from_secs(2),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn detect_parses_service_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .and(body_partial_json(json!({
                "image_data": "aGk=",
                "model_version": "latest"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "detections": [{
                    "id": "det_1",
                    "label": "Plastic Bottle",
                    "category": "recycle",
                    "confidence": 0.92,
                    "bbox": [100, 100, 200, 300],
                    "instructions": "Rinse it.",
                    "tips": ["Caps on"],
                    "environmental_impact": {"co2_footprint": 2.3}
                }],
                "processing_time": 0.25,
                "model_info": {"version": "latest"},
                "recommendations": [{"type": "reduce"}]
            })))
            .mount(&server)
            .await;

        let result = backend(&server)
            .detect("aGk=".into(), 0.5, "latest")
            .await
            .unwrap();
        assert_eq!(result.backend, Backend::Remote);
        assert_eq!(result.detections.len(), 1);
        let d = &result.detections[0];
        assert_eq!(d.category, WasteCategory::Recycle);
        assert!((d.bbox.height - 300.0).abs() < f32::EPSILON);
        assert_eq!(result.processing_time_ms, Some(250.0));
        assert_eq!(result.recommendations.len(), 1);
    }

    #[tokio::test]
    async fn detect_accepts_processing_time_ms() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "detections": [],
                "processing_time_ms": 42
            })))
            .mount(&server)
            .await;

        let result = backend(&server).detect("x".into(), 0.5, "v").await.unwrap();
        assert_eq!(result.processing_time_ms, Some(42.0));
    }

    #[tokio::test]
    async fn detect_failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let err = backend(&server).detect("x".into(), 0.5, "v").await.unwrap_err();
        assert_eq!(err, OfflineError::BackendRejected { status: 500 });

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;
        let err = backend(&server).detect("x".into(), 0.5, "v").await.unwrap_err();
        assert!(matches!(err, OfflineError::MalformedPayload(_)));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"success": false, "detections": []})),
            )
            .mount(&server)
            .await;
        let err = backend(&server).detect("x".into(), 0.5, "v").await.unwrap_err();
        assert!(matches!(err, OfflineError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn health_probe_tracks_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
            .mount(&server)
            .await;
        assert!(backend(&server).probe().await.is_ok());

        let down = RemoteBackend::new(
            "http://127.0.0.1:9",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(down.probe().await.unwrap_err().is_recoverable_network());
    }

    #[tokio::test]
    async fn feedback_posts_wire_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/feedback"))
            .and(body_partial_json(json!({
                "detection_id": "det_1",
                "user_correction": "compost",
                "was_helpful": false
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        backend(&server)
            .send_feedback(&FeedbackRequest {
                detection_id: "det_1".into(),
                user_correction: "compost".into(),
                confidence_rating: 0.8,
                was_helpful: false,
            })
            .await
            .unwrap();
    }
}
