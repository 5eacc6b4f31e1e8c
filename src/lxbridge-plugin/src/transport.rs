//! One-shot HTTP/HTTPS client behind `lx.request`.
//!
//! Every call builds its own client with pooling disabled, follows no
//! redirects, retries nothing and has no timeout, like Node's bare
//! `http.request` the scripts were written for.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid URL: {url}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("Protocol \"{found}:\" not supported. Expected \"{expected}:\"")]
    UnsupportedProtocol {
        found: String,
        expected: &'static str,
    },
    #[error("Invalid method: {0}")]
    InvalidMethod(String),
    #[error("Invalid header \"{0}\"")]
    InvalidHeader(String),
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("{0}")]
    Request(reqwest::Error),
    #[error("failed to read response body: {0}")]
    Body(reqwest::Error),
}

/// Transport picked by literal prefix, the way the scripts' host did it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn of(url: &str) -> Self {
        if url.starts_with("https") {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }

    fn protocol(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl TransportRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A response body is either parsed JSON or, failing that, the raw text.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

impl ResponseBody {
    pub fn decode(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(text.into_owned()),
        }
    }

    /// The value scripts see as `response.body`.
    pub fn to_value(&self) -> Value {
        match self {
            ResponseBody::Json(value) => value.clone(),
            ResponseBody::Text(text) => Value::String(text.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub body: ResponseBody,
    pub status_code: u16,
    /// Lower-cased names; repeated headers joined with `", "`.
    pub headers: BTreeMap<String, String>,
}

impl TransportResponse {
    /// Shape handed to the script callback.
    pub fn to_json(&self) -> Value {
        json!({
            "statusCode": self.status_code,
            "headers": self.headers,
            "body": self.body.to_value(),
        })
    }
}

/// Everything `send` needs, checked up front.
struct Prepared {
    scheme: Scheme,
    url: Url,
    method: Method,
    headers: HeaderMap,
}

fn prepare(request: &TransportRequest) -> Result<Prepared, TransportError> {
    let scheme = Scheme::of(&request.url);
    let url = Url::parse(&request.url).map_err(|source| TransportError::InvalidUrl {
        url: request.url.clone(),
        source,
    })?;
    if url.scheme() != scheme.protocol() {
        return Err(TransportError::UnsupportedProtocol {
            found: url.scheme().to_string(),
            expected: scheme.protocol(),
        });
    }

    let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| TransportError::InvalidMethod(request.method.clone()))?;
    let headers = build_headers(&request.headers)?;
    Ok(Prepared {
        scheme,
        url,
        method,
        headers,
    })
}

/// Check URL, protocol, method and headers without sending anything.
pub fn validate(request: &TransportRequest) -> Result<(), TransportError> {
    prepare(request).map(|_| ())
}

pub async fn send(request: TransportRequest) -> Result<TransportResponse, TransportError> {
    let Prepared {
        scheme,
        url,
        method,
        headers,
    } = prepare(&request)?;

    let client = reqwest::Client::builder()
        .redirect(Policy::none())
        .pool_max_idle_per_host(0)
        .build()
        .map_err(TransportError::Client)?;

    tracing::debug!(method = %method, url = %url, ?scheme, "sending script request");
    let mut builder = client.request(method, url).headers(headers);
    if let Some(body) = request.body.filter(|b| !b.is_empty()) {
        builder = builder.body(body);
    }

    let response = builder.send().await.map_err(TransportError::Request)?;
    let status_code = response.status().as_u16();
    let headers = flatten_headers(response.headers());
    let bytes = response.bytes().await.map_err(TransportError::Body)?;
    tracing::debug!(status = status_code, bytes = bytes.len(), "script request finished");

    Ok(TransportResponse {
        body: ResponseBody::decode(&bytes),
        status_code,
        headers,
    })
}

fn build_headers(pairs: &[(String, String)]) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| TransportError::InvalidHeader(name.clone()))?;
        headers.append(header_name, header_value);
    }
    Ok(headers)
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    flat
}
