//! Network side of the cache: the `Fetcher` seam and its reqwest implementation.

use super::identity::{Method, ResourceRequest};
use crate::error::{OfflineError, OfflineResult};
use async_trait::async_trait;
use std::time::Duration;

/// A successful (2xx) network response.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedResource {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Issues network requests on behalf of the orchestrator and lifecycle.
///
/// Implementations must map non-2xx answers to `BackendRejected` and honour
/// their own deadline, reporting `Timeout` when it expires.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &ResourceRequest) -> OfflineResult<FetchedResource>;

    /// HEAD-equivalent reachability check used before precaching a file.
    async fn verify(&self, url: &str) -> OfflineResult<()>;
}

/// `Fetcher` backed by a shared `reqwest::Client`.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(timeout.min(Duration::from_secs(5)))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            timeout,
        }
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> OfflineResult<FetchedResource> {
        let mut builder = self
            .client
            .request(Self::method(request.method), &request.url);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| OfflineError::from_reqwest(&e, self.timeout))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OfflineError::BackendRejected {
                status: status.as_u16(),
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|e| OfflineError::from_reqwest(&e, self.timeout))?;

        Ok(FetchedResource {
            status: status.as_u16(),
            content_type,
            body: body.to_vec(),
        })
    }

    async fn verify(&self, url: &str) -> OfflineResult<()> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| OfflineError::from_reqwest(&e, self.timeout))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(OfflineError::BackendRejected {
                status: resp.status().as_u16(),
            })
        }
    }
}
