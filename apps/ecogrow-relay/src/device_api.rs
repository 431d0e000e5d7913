//! Passthrough to the controller's own HTTP API for clients on other networks.

use std::time::Duration;

use axum::http::{Method, StatusCode};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::DeviceApiConfig;

const DEADLINE_SLACK: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum DeviceApiError {
    #[error("device did not answer the reachability probe")]
    Unreachable,
    #[error("failed to connect to device: {0}")]
    ConnectionFailed(String),
    #[error("device request timed out")]
    Timeout,
    #[error("device request failed: {0}")]
    Upstream(String),
    #[error("invalid device endpoint: {0}")]
    InvalidEndpoint(String),
}

impl DeviceApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            DeviceApiError::Unreachable | DeviceApiError::ConnectionFailed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DeviceApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            DeviceApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            DeviceApiError::InvalidEndpoint(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            DeviceApiError::Unreachable => "device_offline",
            DeviceApiError::ConnectionFailed(_) => "connection_failed",
            DeviceApiError::Timeout => "timeout",
            DeviceApiError::Upstream(_) => "upstream_error",
            DeviceApiError::InvalidEndpoint(_) => "invalid_endpoint",
        }
    }
}

impl From<reqwest::Error> for DeviceApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeviceApiError::Timeout
        } else if err.is_connect() {
            DeviceApiError::ConnectionFailed(err.to_string())
        } else {
            DeviceApiError::Upstream(err.to_string())
        }
    }
}

/// Response relayed back from the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Value,
}

#[derive(Clone)]
pub struct DeviceApiClient {
    http: Client,
    base_url: Url,
    probe_timeout: Duration,
    forward_timeout: Duration,
}

impl DeviceApiClient {
    pub fn new(config: &DeviceApiConfig) -> Result<Self, DeviceApiError> {
        let http = Client::builder()
            .connect_timeout(config.probe_timeout)
            .build()
            .map_err(|err| DeviceApiError::Upstream(err.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            probe_timeout: config.probe_timeout,
            forward_timeout: config.forward_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Longest a `forward` call may take: the reachability check plus the request itself.
    pub fn deadline(&self) -> Duration {
        self.probe_timeout + self.forward_timeout + DEADLINE_SLACK
    }

    /// True when `GET /api/info` answers 200 within the probe timeout.
    pub async fn probe(&self) -> bool {
        let Ok(url) = self.base_url.join("api/info") else {
            return false;
        };
        match self.http.get(url).timeout(self.probe_timeout).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(err) => {
                debug!(error = %err, "device probe failed");
                false
            }
        }
    }

    /// Forward one request to `<base>/api/<endpoint>` after a reachability probe.
    pub async fn forward(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<UpstreamResponse, DeviceApiError> {
        let url = self.endpoint_url(endpoint)?;
        if !self.probe().await {
            return Err(DeviceApiError::Unreachable);
        }

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .timeout(self.forward_timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|err| {
            warn!(%method, %url, error = %err, "device passthrough failed");
            DeviceApiError::from(err)
        })?;
        let status = response.status();
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        debug!(%method, %url, status = status.as_u16(), "device passthrough completed");
        Ok(UpstreamResponse { status, body })
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url, DeviceApiError> {
        let endpoint = endpoint.trim_matches('/');
        let valid = !endpoint.is_empty()
            && endpoint.split('/').all(|segment| {
                !segment.is_empty()
                    && segment != "."
                    && segment != ".."
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            });
        if !valid {
            return Err(DeviceApiError::InvalidEndpoint(endpoint.to_string()));
        }
        self.base_url
            .join(&format!("api/{endpoint}"))
            .map_err(|err| DeviceApiError::InvalidEndpoint(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    fn client_for(base: &str, forward_timeout: Duration) -> DeviceApiClient {
        DeviceApiClient::new(&DeviceApiConfig {
            base_url: Url::parse(base).unwrap(),
            probe_timeout: Duration::from_millis(500),
            forward_timeout,
        })
        .unwrap()
    }

    async fn fake_device() -> String {
        let app = Router::new()
            .route("/api/info", get(|| async { "ok" }))
            .route(
                "/api/state",
                get(|| async { Json(json!({"moisture": 42, "pump": false})) }),
            )
            .route(
                "/api/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn endpoints_are_confined_to_the_api_prefix() {
        let client = client_for("http://192.168.0.187/", Duration::from_secs(1));
        assert_eq!(
            client.endpoint_url("state").unwrap().as_str(),
            "http://192.168.0.187/api/state"
        );
        assert_eq!(
            client.endpoint_url("/settings/wifi/").unwrap().as_str(),
            "http://192.168.0.187/api/settings/wifi"
        );
        for bad in ["", "../admin", "a//b", "x?y=1", "%2e%2e"] {
            assert!(
                matches!(client.endpoint_url(bad), Err(DeviceApiError::InvalidEndpoint(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn errors_map_to_gateway_statuses() {
        assert_eq!(DeviceApiError::Unreachable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(DeviceApiError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            DeviceApiError::Upstream("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(DeviceApiError::Unreachable.code(), "device_offline");
    }

    #[tokio::test]
    async fn probe_fails_for_closed_port() {
        let port = unused_port().await;
        let client = client_for(&format!("http://127.0.0.1:{port}/"), Duration::from_secs(1));
        assert!(!client.probe().await);
        assert!(matches!(
            client.forward(Method::GET, "state", None).await,
            Err(DeviceApiError::Unreachable)
        ));
    }

    #[tokio::test]
    async fn forwards_to_a_reachable_device() {
        let base = fake_device().await;
        let client = client_for(&base, Duration::from_secs(2));
        assert!(client.probe().await);
        let response = client.forward(Method::GET, "state", None).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, json!({"moisture": 42, "pump": false}));

        let missing = client.forward(Method::GET, "nope", None).await.unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn slow_device_times_out() {
        let base = fake_device().await;
        let client = client_for(&base, Duration::from_millis(200));
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            client.forward(Method::GET, "slow", None),
        )
        .await
        .expect("forward must honour its own timeout");
        assert!(matches!(result, Err(DeviceApiError::Timeout)));
    }
}
