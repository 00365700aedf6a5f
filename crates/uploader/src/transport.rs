//! HTTP transport capability and its reqwest implementation.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use chunkup_protocol::messages::QueryPairs;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One logical request to the chunk server.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: QueryPairs,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, query: QueryPairs) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, query: QueryPairs, body: Bytes) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            query,
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the query value for `key`, if present.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// URL with the query appended, for logs and retry events.
    pub fn display_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}{query}", self.url)
    }
}

/// Status and body of a completed request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Errors raised before a response status is available.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid header {0}")]
    InvalidHeader(String),

    #[error("{0}")]
    Other(String),
}

/// Sends requests to the chunk server.
///
/// Dropping the returned future must abort the request; that is how pause
/// and cancel tear down in-flight uploads.
pub trait HttpTransport: Send + Sync {
    fn send(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + '_>>;
}

/// [`HttpTransport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http })
    }

    /// Wraps an existing client, e.g. one with proxies or default headers.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::InvalidHeader(name.as_str().to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

impl HttpTransport for ReqwestTransport {
    fn send(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let mut headers = header_map(&request.headers)?;
            let builder = match request.method {
                Method::Get => self.http.get(&request.url),
                Method::Post => {
                    if !headers.contains_key(CONTENT_TYPE) {
                        headers.insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static(chunkup_protocol::CHUNK_CONTENT_TYPE),
                        );
                    }
                    self.http.post(&request.url)
                }
            };
            let mut builder = builder.query(&request.query).headers(headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await?;
            Ok(HttpResponse { status, body })
        })
    }
}
