//! Outbound HTTP through a single proxy.
//!
//! [`Transport`] is the seam between the rotation logic and the network. The
//! default [`ReqwestTransport`] builds a fresh client per route so no proxy
//! settings leak between calls.

use crate::proxy::{FailureCause, ProxyRoute};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::borrow::Cow;
use thiserror::Error;
use url::Url;

/// Transport-agnostic description of an outgoing request.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestTemplate {
    /// Request with no headers or body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// `GET` request for `url`.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Captures a `reqwest::Request`. Returns `None` for streaming bodies.
    pub fn from_reqwest(request: &reqwest::Request) -> Option<Self> {
        let body = match request.body() {
            Some(body) => Some(Bytes::copy_from_slice(body.as_bytes()?)),
            None => None,
        };
        Some(Self {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body,
        })
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    /// Empty response with `status`.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Rebuilds a `reqwest::Response` for middleware callers.
    pub fn into_reqwest(self) -> reqwest::Response {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        reqwest::Response::from(response)
    }
}

/// Proxy-attributable failure of a single call.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to build proxied client: {0}")]
    Build(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(String),
    #[error("failed to read response body: {0}")]
    Body(String),
}

impl TransportError {
    /// Failure cause to charge to the proxy.
    pub fn cause(&self) -> FailureCause {
        match self {
            TransportError::Connect(_) => FailureCause::Connect,
            TransportError::Timeout => FailureCause::Timeout,
            _ => FailureCause::Other,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::Build(err.to_string())
        } else if err.is_body() || err.is_decode() {
            TransportError::Body(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Sends one request through one proxy.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        route: &ProxyRoute,
        request: &RequestTemplate,
    ) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by a per-route `reqwest::Client`.
///
/// reqwest issues CONNECT itself for `https` targets behind HTTP proxies and
/// speaks SOCKS natively, which matches [`ProxyRoute::tunnel`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestTransport;

impl ReqwestTransport {
    fn client(route: &ProxyRoute) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(route.proxy_url.as_str())?)
            .connect_timeout(route.connect_timeout)
            .timeout(route.timeout)
            .danger_accept_invalid_certs(route.accept_invalid_certs)
            .build()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        route: &ProxyRoute,
        request: &RequestTemplate,
    ) -> Result<TransportResponse, TransportError> {
        let client = Self::client(route).map_err(|e| TransportError::Build(e.to_string()))?;

        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
