//! HTTP transport for the management API
//!
//! Issues exactly one request per call. Non-2xx responses become a
//! [`HttpFailure`] with the provider-agnostic fields extracted from the
//! error envelope; requests that never get a response become
//! [`E2eError::Network`]. Retrying is left to [`crate::retry`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{E2eError, HttpFailure, Result};
use crate::metrics::{HTTP_REQUESTS, HTTP_REQUEST_DURATION};

const API_TOKEN_HEADER: &str = "X-Api-Token";
const PROFILE_ID_HEADER: &str = "X-Profile-Id";
pub(crate) const ACCEPT_JSON: &str = "application/json";
const ACCEPT_TEXT: &str = "text/plain";

/// Request id headers, checked in order. Header names are case-insensitive,
/// so the first entry also covers `X-Request-ID`.
const REQUEST_ID_HEADERS: [&str; 4] = [
    "x-request-id",
    "x-amzn-requestid",
    "x-amz-request-id",
    "x-ms-request-id",
];

const MAX_LOGGED_BODY_CHARS: usize = 4000;

/// Request payload
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Raw { bytes: Bytes, content_type: String },
}

/// A single API call
#[derive(Debug, Clone)]
pub struct ApiRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub profile_id: Option<&'a str>,
    pub body: RequestBody,
    pub accept: Option<&'a str>,
}

impl<'a> ApiRequest<'a> {
    pub fn new(method: Method, path: &'a str) -> Self {
        Self {
            method,
            path,
            profile_id: None,
            body: RequestBody::Empty,
            accept: None,
        }
    }

    /// Scope the request to a profile via `X-Profile-Id`
    pub fn profile(mut self, profile_id: Option<&'a str>) -> Self {
        self.profile_id = profile_id;
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn raw(mut self, bytes: Bytes, content_type: impl Into<String>) -> Self {
        self.body = RequestBody::Raw {
            bytes,
            content_type: content_type.into(),
        };
        self
    }

    pub fn accept(mut self, accept: &'a str) -> Self {
        self.accept = Some(accept);
        self
    }
}

/// A successful (2xx) response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Client for the storage management API.
///
/// Holds the base URL and token resolved at startup; every request carries
/// `X-Api-Token`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    api_token: String,
    http: Client,
}

impl ApiClient {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(base_url: &str, api_token: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| E2eError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            http,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.base_url, &config.api_token, config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform one request and return the 2xx response.
    ///
    /// # Errors
    ///
    /// [`E2eError::Network`] when no response was obtained,
    /// [`E2eError::Http`] for any non-2xx status.
    pub async fn send(&self, request: ApiRequest<'_>) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let method = request.method.as_str().to_string();

        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .header(API_TOKEN_HEADER, &self.api_token);

        if let Some(profile_id) = request.profile_id {
            builder = builder.header(PROFILE_ID_HEADER, profile_id);
        }

        if let Some(accept) = request.accept {
            builder = builder.header(ACCEPT, accept);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder
                .header(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
                .body(serde_json::to_vec(&value)?),
            RequestBody::Raw {
                bytes,
                content_type,
            } => builder.header(CONTENT_TYPE, content_type).body(bytes),
        };

        debug!(method = %method, path = request.path, "Sending request");
        let started = Instant::now();

        let network_error = |e: reqwest::Error| {
            HTTP_REQUEST_DURATION.observe(started.elapsed().as_secs_f64());
            HTTP_REQUESTS
                .with_label_values(&[method.as_str(), "network"])
                .inc();
            E2eError::Network {
                method: method.clone(),
                path: request.path.to_string(),
                message: error_chain(&e),
            }
        };

        let response = builder.send().await.map_err(network_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(network_error)?;

        HTTP_REQUEST_DURATION.observe(started.elapsed().as_secs_f64());
        HTTP_REQUESTS
            .with_label_values(&[method.as_str(), status.to_string().as_str()])
            .inc();

        if !(200..300).contains(&status) {
            let failure = normalize_failure(status, &method, request.path, &headers, &body);
            log_failure(&failure);
            return Err(failure.into());
        }

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    /// Request with `Accept: application/json` and decode the response.
    ///
    /// An empty body decodes as `{}`; a body that does not decode into `T`
    /// is a protocol violation.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        profile_id: Option<&str>,
        body: Option<Value>,
    ) -> Result<T> {
        let mut request = ApiRequest::new(method.clone(), path)
            .profile(profile_id)
            .accept(ACCEPT_JSON);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.send(request).await?;
        decode_json(&method, path, &response.body)
    }

    /// [`ApiClient::request_json`] with a serialized request body
    pub async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        profile_id: Option<&str>,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.request_json(method, path, profile_id, Some(body)).await
    }

    /// Request and return the raw response body
    pub async fn request_bytes(
        &self,
        method: Method,
        path: &str,
        profile_id: Option<&str>,
    ) -> Result<Bytes> {
        let response = self
            .send(ApiRequest::new(method, path).profile(profile_id))
            .await?;
        Ok(response.body)
    }

    /// Request with `Accept: text/plain`, decoding the body as lossy UTF-8
    pub async fn request_text(
        &self,
        method: Method,
        path: &str,
        profile_id: Option<&str>,
    ) -> Result<String> {
        let response = self
            .send(
                ApiRequest::new(method, path)
                    .profile(profile_id)
                    .accept(ACCEPT_TEXT),
            )
            .await?;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }
}

fn decode_json<T: DeserializeOwned>(method: &Method, path: &str, body: &[u8]) -> Result<T> {
    let payload: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(payload).map_err(|e| {
        E2eError::Protocol(format!(
            "{} {} returned an unexpected body ({}): {}",
            method,
            path,
            e,
            clip_body(&String::from_utf8_lossy(body))
        ))
    })
}

/// Fields pulled out of `{"error": {"code", "normalizedError": {"code", "retryable"}}}`
#[derive(Debug, Default, PartialEq)]
struct ErrorEnvelope {
    code: Option<String>,
    normalized_code: Option<String>,
    normalized_retryable: Option<bool>,
}

fn parse_error_envelope(body: &str) -> ErrorEnvelope {
    let Ok(Value::Object(root)) = serde_json::from_str::<Value>(body) else {
        return ErrorEnvelope::default();
    };
    let Some(Value::Object(error)) = root.get("error") else {
        return ErrorEnvelope::default();
    };

    let normalized = error.get("normalizedError").and_then(Value::as_object);
    ErrorEnvelope {
        code: error.get("code").and_then(Value::as_str).map(str::to_string),
        normalized_code: normalized
            .and_then(|n| n.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string),
        normalized_retryable: normalized
            .and_then(|n| n.get("retryable"))
            .and_then(Value::as_bool),
    }
}

/// Build the normalized failure for a non-2xx response
pub fn normalize_failure(
    status: u16,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> HttpFailure {
    let raw_body = String::from_utf8_lossy(body).into_owned();
    let envelope = parse_error_envelope(&raw_body);

    let header_value = |name: &str| {
        headers
            .get(name)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
    };

    let request_id = REQUEST_ID_HEADERS.iter().find_map(|&name| header_value(name));
    let retry_after = header_value(RETRY_AFTER.as_str());

    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect::<BTreeMap<_, _>>();

    HttpFailure {
        status,
        method: method.to_string(),
        path: path.to_string(),
        headers,
        raw_body,
        provider_error_code: envelope.code,
        normalized_code: envelope.normalized_code,
        normalized_retryable: envelope.normalized_retryable,
        retry_after,
        request_id,
    }
}

fn log_failure(failure: &HttpFailure) {
    warn!(
        status = failure.status,
        method = %failure.method,
        path = %failure.path,
        request_id = failure.request_id.as_deref(),
        retry_after = failure.retry_after.as_deref(),
        error_code = failure.provider_error_code.as_deref(),
        normalized_code = failure.normalized_code.as_deref(),
        normalized_retryable = failure.normalized_retryable,
        body = %clip_body(&failure.raw_body),
        "HTTP {} {} {}",
        failure.status,
        failure.method,
        failure.path
    );
}

/// Keep logged bodies readable
pub(crate) fn clip_body(body: &str) -> String {
    match body.char_indices().nth(MAX_LOGGED_BODY_CHARS) {
        Some((idx, _)) => format!("{}...<clipped>", &body[..idx]),
        None => body.to_string(),
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
