//! # Network access
//!
//! The [`Fetcher`] trait is the network primitive on both sides of the proxy:
//! a context may carry a native fetcher that fails in restricted
//! environments, and the host carries the one that actually reaches the
//! network ([`HttpFetcher`]).

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The environment does not allow direct network access.
    #[error("network access denied for '{0}'")]
    Denied(String),
    /// The request was malformed before it left the process.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The request left the process and failed.
    #[error("network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Request options forwarded with a proxied fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchOptions {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: "GET".into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

impl FetchOptions {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// A response streamed back to the context. The body buffer is moved, not copied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    /// The zero-status response reported for any failed proxied request.
    pub fn failed() -> Self {
        Self::default()
    }

    pub fn is_failed(&self) -> bool {
        self.status == 0
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs a network request.
///
/// This trait is designed to be object-safe (`Arc<dyn Fetcher>`).
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, uri: &str, options: FetchOptions) -> Result<ProxyResponse>;
}

/// A fetcher for environments with no direct network access.
#[derive(Clone, Copy, Debug, Default)]
pub struct Denied;

#[async_trait]
impl Fetcher for Denied {
    async fn fetch(&self, uri: &str, _options: FetchOptions) -> Result<ProxyResponse> {
        Err(Error::Denied(uri.to_string()))
    }
}

/// Real network access over HTTP(S).
#[derive(Clone, Debug, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, uri: &str, options: FetchOptions) -> Result<ProxyResponse> {
        let method = reqwest::Method::from_bytes(options.method.as_bytes())
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;

        let mut request = self.client.request(method, uri);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = options.body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| Error::Network(e.to_string()))?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| Error::Network(e.to_string()))?;

        Ok(ProxyResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: body.to_vec(),
        })
    }
}
