//! HTTP client for communicating with the Conveyor API server.

use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Envelope matching the server's `ApiResponse` format.
#[derive(Debug, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

/// Error envelope returned with non-2xx statuses.
#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    error: String,
    error_code: String,
}

/// Error raised when the server rejects a request.
#[derive(Debug, thiserror::Error)]
#[error("{message} ({code}, HTTP {status})")]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

/// HTTP client for the Conveyor API.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(Method::GET, path, |req| req).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(Method::POST, path, |req| req.json(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(Method::DELETE, path, |req| req).await
    }

    /// GET returning the whole JSON body. Health endpoints do not use the envelope and
    /// answer 503 with a body when unhealthy.
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T, F>(&self, method: Method, path: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let url = self.url(path);
        let resp = build(self.client.request(method.clone(), &url))
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;

        let api_resp: ApiResponse<T> = Self::decode(resp, &url).await?;
        if api_resp.success {
            api_resp
                .data
                .ok_or_else(|| anyhow::anyhow!("API returned success but no data"))
        } else {
            Err(ApiError {
                status: 200,
                code: api_resp.error_code.unwrap_or_else(|| "UNKNOWN".into()),
                message: api_resp.error.unwrap_or_else(|| "Unknown error".into()),
            }
            .into())
        }
    }

    async fn decode<T: DeserializeOwned>(resp: Response, url: &str) -> Result<ApiResponse<T>> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorBody>(&body) {
                Ok(err) => ApiError {
                    status: status.as_u16(),
                    code: err.error_code,
                    message: err.error,
                }
                .into(),
                Err(_) => anyhow::anyhow!("API error ({}): {}", status, body),
            });
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}
