//! HTTP client for the trellisd API.

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use thiserror::Error;
use urlencoding::encode;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not reachable at {addr}\n  → start with: trellisd\n  → or set TRELLIS_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("unauthorized: check STATE_MANAGER_SECRET or --api-key")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::Http {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Client for one daemon address.
#[derive(Debug)]
pub struct Client {
    addr: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(addr: &str, api_key: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|_| ClientError::InvalidResponse("API key is not valid ASCII".into()))?;
            headers.insert("x-api-key", value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Self {
            addr: addr.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn health(&self) -> Result<Value> {
        let response = self.http.get(format!("{}/health", self.addr)).send().await?;
        Self::json_body(response).await
    }

    pub async fn put_graph(&self, namespace: &str, graph: &str, body: &Value) -> Result<Value> {
        let url = format!(
            "{}/v0/namespace/{}/graph/{}",
            self.addr,
            encode(namespace),
            encode(graph)
        );
        let response = self.http.put(url).json(body).send().await?;
        Self::json_body(response).await
    }

    pub async fn get_graph(&self, namespace: &str, graph: &str) -> Result<Value> {
        let url = format!(
            "{}/v0/namespace/{}/graph/{}",
            self.addr,
            encode(namespace),
            encode(graph)
        );
        let response = self.http.get(url).send().await?;
        Self::json_body(response).await
    }

    pub async fn list_graphs(&self, namespace: &str) -> Result<Value> {
        let url = format!("{}/v0/namespace/{}/graphs", self.addr, encode(namespace));
        let response = self.http.get(url).send().await?;
        Self::json_body(response).await
    }

    pub async fn register_node(&self, namespace: &str, body: &Value) -> Result<Value> {
        let url = format!(
            "{}/v0/namespace/{}/nodes/register",
            self.addr,
            encode(namespace)
        );
        let response = self.http.post(url).json(body).send().await?;
        Self::json_body(response).await
    }

    pub async fn trigger(&self, namespace: &str, graph: &str, body: &Value) -> Result<Value> {
        let url = format!(
            "{}/v0/namespace/{}/graph/{}/trigger",
            self.addr,
            encode(namespace),
            encode(graph)
        );
        let response = self.http.post(url).json(body).send().await?;
        Self::json_body(response).await
    }

    pub async fn create_states(&self, namespace: &str, graph: &str, body: &Value) -> Result<Value> {
        let url = format!(
            "{}/v0/namespace/{}/graph/{}/states/create",
            self.addr,
            encode(namespace),
            encode(graph)
        );
        let response = self.http.post(url).json(body).send().await?;
        Self::json_body(response).await
    }

    pub async fn lease(&self, namespace: &str, node_name: &str, batch_size: u32) -> Result<Value> {
        let url = format!(
            "{}/v0/namespace/{}/nodes/{}/lease",
            self.addr,
            encode(namespace),
            encode(node_name)
        );
        let body = serde_json::json!({ "batch_size": batch_size });
        let response = self.http.post(url).json(&body).send().await?;
        Self::json_body(response).await
    }

    pub async fn executed(&self, namespace: &str, state_id: &str, body: &Value) -> Result<Value> {
        let url = format!(
            "{}/v0/namespace/{}/states/{}/executed",
            self.addr,
            encode(namespace),
            encode(state_id)
        );
        let response = self.http.post(url).json(body).send().await?;
        Self::json_body(response).await
    }

    pub async fn errored(&self, namespace: &str, state_id: &str, error: &str) -> Result<Value> {
        let url = format!(
            "{}/v0/namespace/{}/states/{}/errored",
            self.addr,
            encode(namespace),
            encode(state_id)
        );
        let body = serde_json::json!({ "error": error });
        let response = self.http.post(url).json(&body).send().await?;
        Self::json_body(response).await
    }

    async fn json_body(response: Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        if status.is_success() {
            return Ok(body);
        }

        let message = body["error"]
            .as_str()
            .unwrap_or("unknown error")
            .to_string();
        Err(match status {
            StatusCode::UNAUTHORIZED => ClientError::Unauthorized,
            StatusCode::NOT_FOUND => ClientError::NotFound(message),
            _ => ClientError::Http {
                status: status.as_u16(),
                message,
            },
        })
    }
}
