//! Metadata Service HTTP Fetcher
//!
//! Thin wrapper over reqwest for the handful of calls the metadata
//! protocols need: one request, explicit timeout, configured proxies.
//! Non-2xx statuses are returned to the caller, not turned into errors.

use reqwest::{Client, Method, Proxy};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::HttpError;

/// A single request against a metadata endpoint
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers<'a>(mut self, headers: impl IntoIterator<Item = &'a (String, String)>) -> Self {
        self.headers.extend(headers.into_iter().cloned());
        self
    }

    /// Bound the whole round trip, body included
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully read response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: String,
    pub code: u16,
    pub body: String,
    /// Header names are lower-case
    pub headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 200
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parse the body as any JSON value
    pub fn json(&self) -> Result<Value, HttpError> {
        serde_json::from_str(&self.body).map_err(|e| HttpError::Decode {
            url: self.url.clone(),
            message: e.to_string(),
        })
    }

    /// Parse the body as a JSON object; anything else yields an empty map
    ///
    /// Used for error bodies, which are often plain text.
    pub fn json_dict(&self) -> Map<String, Value> {
        match self.json() {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Parse the body as a JSON array
    pub fn json_list(&self) -> Result<Vec<Value>, HttpError> {
        match self.json()? {
            Value::Array(items) => Ok(items),
            other => Err(HttpError::Decode {
                url: self.url.clone(),
                message: format!("expected a JSON list, got {}", json_kind(&other)),
            }),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// HTTP client for metadata services
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher that only uses the explicitly configured proxies
    pub fn new(proxies: &ProxyConfig) -> Result<Self, HttpError> {
        let mut builder = Client::builder()
            .user_agent(concat!("pro-autoattach/", env!("CARGO_PKG_VERSION")))
            .no_proxy();

        if let Some(url) = &proxies.http {
            builder = builder.proxy(Proxy::http(url).map_err(|e| HttpError::InvalidRequest {
                url: url.clone(),
                message: format!("invalid http proxy: {}", e),
            })?);
        }
        if let Some(url) = &proxies.https {
            builder = builder.proxy(Proxy::https(url).map_err(|e| HttpError::InvalidRequest {
                url: url.clone(),
                message: format!("invalid https proxy: {}", e),
            })?);
        }

        let client = builder.build().map_err(|e| HttpError::InvalidRequest {
            url: String::new(),
            message: format!("failed to create HTTP client: {}", e),
        })?;

        Ok(Self { client })
    }

    /// Perform one request and read the whole body
    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let HttpRequest {
            method,
            url,
            headers,
            timeout,
        } = request;

        debug!(method = %method, url = %url, "Metadata request");

        let mut builder = self.client.request(method, &url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| classify(&url, e))?;

        let code = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response.text().await.map_err(|e| classify(&url, e))?;

        debug!(url = %url, status = code, "Metadata response");

        Ok(HttpResponse {
            url,
            code,
            body,
            headers,
        })
    }
}

fn classify(url: &str, err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout {
            url: url.to_string(),
        }
    } else if err.is_builder() {
        HttpError::InvalidRequest {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        HttpError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}
