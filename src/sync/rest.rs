//! Remote transport.
//!
//! The engine talks to the server through the synchronous [`RestClient`]
//! trait. [`RestApi`] builds the request shapes the targets need;
//! [`HttpRestClient`] sends them over HTTPS with a bearer token.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::config::Settings;
use crate::error::{Error, Result};

/// Largest number of subrequests a composite request may carry.
pub const MAX_COMPOSITE_SUBREQUESTS: usize = 25;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// A request to the remote service. `path` is relative to the instance URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RestRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Path with its query string, as used inside composite requests.
    #[must_use]
    pub fn url(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{query}", self.path)
    }
}

/// Status and parsed body of a response.
#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
}

impl RestResponse {
    #[must_use]
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Turn a non-2xx response into [`Error::Remote`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::Remote {
                status: self.status,
                body: self.body.to_string(),
            })
        }
    }
}

/// Synchronous request/response transport.
///
/// `Err` means no response was obtained; any HTTP status, including errors,
/// comes back as `Ok`.
pub trait RestClient: Send + Sync {
    fn send(&self, request: &RestRequest) -> Result<RestResponse>;
}

/// Builds requests for one API version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestApi {
    version: String,
}

impl RestApi {
    #[must_use]
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
        }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    fn base(&self) -> String {
        format!("/services/data/{}", self.version)
    }

    /// Run a SOQL query.
    #[must_use]
    pub fn query(&self, soql: &str) -> RestRequest {
        RestRequest::new(Method::Get, format!("{}/query", self.base())).with_query("q", soql)
    }

    /// Fetch the next page of a query from its `nextRecordsUrl`.
    #[must_use]
    pub fn query_more(&self, next_records_url: &str) -> RestRequest {
        RestRequest::new(Method::Get, next_records_url)
    }

    /// Object summary, whose `recentItems` lists recently viewed records.
    #[must_use]
    pub fn recently_viewed(&self, object_type: &str) -> RestRequest {
        RestRequest::new(Method::Get, format!("{}/sobjects/{object_type}", self.base()))
    }

    #[must_use]
    pub fn create(&self, object_type: &str, fields: Value) -> RestRequest {
        RestRequest::new(Method::Post, format!("{}/sobjects/{object_type}", self.base()))
            .with_body(fields)
    }

    #[must_use]
    pub fn update(&self, object_type: &str, id: &str, fields: Value) -> RestRequest {
        RestRequest::new(
            Method::Patch,
            format!("{}/sobjects/{object_type}/{id}", self.base()),
        )
        .with_body(fields)
    }

    #[must_use]
    pub fn delete(&self, object_type: &str, id: &str) -> RestRequest {
        RestRequest::new(
            Method::Delete,
            format!("{}/sobjects/{object_type}/{id}", self.base()),
        )
    }

    /// Bundle `(reference_id, request)` pairs into one composite request.
    #[must_use]
    pub fn composite(&self, all_or_none: bool, requests: &[(String, RestRequest)]) -> RestRequest {
        let subrequests: Vec<Value> = requests
            .iter()
            .map(|(reference_id, request)| {
                let mut sub = json!({
                    "method": request.method.as_str(),
                    "url": request.url(),
                    "referenceId": reference_id,
                });
                if let Some(body) = &request.body {
                    sub["body"] = body.clone();
                }
                sub
            })
            .collect();
        RestRequest::new(Method::Post, format!("{}/composite", self.base())).with_body(json!({
            "allOrNone": all_or_none,
            "compositeRequest": subrequests,
        }))
    }
}

/// Split a composite response into per-reference responses.
pub fn parse_composite_response(response: &RestResponse) -> Result<HashMap<String, RestResponse>> {
    let items = response
        .body
        .get("compositeResponse")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Remote {
            status: response.status,
            body: format!("malformed composite response: {}", response.body),
        })?;
    let mut out = HashMap::with_capacity(items.len());
    for item in items {
        let reference_id = item
            .get("referenceId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let status = item
            .get("httpStatusCode")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(500);
        let body = item.get("body").cloned().unwrap_or(Value::Null);
        out.insert(reference_id, RestResponse::new(status, body));
    }
    Ok(out)
}

/// HTTPS transport with bearer-token auth.
///
/// Owns a current-thread runtime so the engine's worker thread can call it
/// synchronously.
pub struct HttpRestClient {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    instance_url: String,
    access_token: String,
}

impl std::fmt::Debug for HttpRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRestClient")
            .field("instance_url", &self.instance_url)
            .finish_non_exhaustive()
    }
}

impl HttpRestClient {
    /// Create a client for `instance_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime or HTTP client cannot be built.
    pub fn new(instance_url: &str, access_token: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("soupsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            runtime,
            client,
            instance_url: instance_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    /// Create a client from configured settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL or token is missing.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.require_instance_url()?,
            settings.require_access_token()?,
        )
    }

    async fn send_async(&self, request: &RestRequest) -> Result<RestResponse> {
        let url = if request.path.starts_with("http://") || request.path.starts_with("https://") {
            request.path.clone()
        } else {
            format!("{}{}", self.instance_url, request.path)
        };
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        trace!(method = request.method.as_str(), url = %url, "Sending request");

        let mut builder = self
            .client
            .request(method, &url)
            .bearer_auth(&self.access_token)
            .query(&request.query);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} {url} failed: {e}", request.method.as_str())))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {e}")))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        debug!(status, url = %url, "Received response");
        Ok(RestResponse::new(status, body))
    }
}

impl RestClient for HttpRestClient {
    fn send(&self, request: &RestRequest) -> Result<RestResponse> {
        self.runtime.block_on(self.send_async(request))
    }
}

/// Closure-backed client, used to script the server in tests and demos.
pub struct FnRestClient<F>
where
    F: Fn(&RestRequest) -> Result<RestResponse> + Send + Sync,
{
    handler: F,
}

impl<F> FnRestClient<F>
where
    F: Fn(&RestRequest) -> Result<RestResponse> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> RestClient for FnRestClient<F>
where
    F: Fn(&RestRequest) -> Result<RestResponse> + Send + Sync,
{
    fn send(&self, request: &RestRequest) -> Result<RestResponse> {
        (self.handler)(request)
    }
}
