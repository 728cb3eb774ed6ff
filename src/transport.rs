//! HTTP transport seam.
//!
//! The core never talks to the network directly; every remote call goes
//! through the [`Transport`] trait as a method + path + optional user +
//! optional body. [`HttpTransport`] is the default reqwest-backed
//! implementation. Timeouts are a transport concern: a timed-out call
//! surfaces as a [`TransportError`], which the backend client maps to a
//! retryable network error.

use async_trait::async_trait;
use url::Url;

/// HTTP method of an outbound request. Only the verbs the backend protocol
/// uses are modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// An outbound backend request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Path relative to the base URL, beginning with `/`
    pub path: String,
    /// User the request is attributed to, if any
    pub user_id: Option<String>,
    /// JSON body bytes for POST requests
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            user_id: Some(user_id.into()),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, user_id: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            user_id: Some(user_id.into()),
            body: Some(body),
        }
    }
}

/// A raw backend response: status plus undecoded body bytes.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failure: the request never produced an HTTP response
/// (unreachable host, connection reset, timeout).
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// Wire-level send capability consumed by the backend client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Default transport over reqwest.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    /// Create a transport for the given base URL and API key.
    ///
    /// The base URL is validated up front; a trailing slash is stripped so
    /// request paths can always start with `/`.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, TransportError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|e| TransportError::new(format!("invalid base URL: {e}")))?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("purchases-sdk-rust/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::new(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = match request.method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
        };

        builder = builder.header("Authorization", format!("Bearer {}", self.api_key));

        if let Some(user_id) = &request.user_id {
            builder = builder.header("X-App-User-Id", user_id);
        }

        if let Some(body) = request.body {
            builder = builder
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::new(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::new(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
