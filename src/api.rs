//! Order API client.
//!
//! Remote order submission, the generic fetcher used by the cache agent, and
//! the connectivity probe used by the background sync loop. The traits are
//! the seams the engine and the agent are tested through.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::composition::{resolve_line_items, ComboGroup, ResolvedLine};
use crate::models::Order;

/// Order submission endpoint, relative to the API base URL.
pub const ORDERS_PATH: &str = "/api/pedidos";
/// Lightweight health endpoint used by the connectivity probe.
pub const HEALTH_PATH: &str = "/api/health";

/// Timeout used for the connectivity probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for fetches proxied by the cache agent.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_api_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Provisioning bundle handed to a device: `{"url", "key", "vid"}` as raw JSON
/// or (url-safe) base64.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionString {
    pub url: Option<String>,
    pub key: Option<String>,
    pub vendor_id: Option<String>,
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 16 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!("{}{}", base64, "=".repeat((4 - base64.len() % 4) % 4));
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn string_field(payload: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| payload.get(*name).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Decode a connection string. Returns `None` when it is neither JSON nor
/// base64 JSON.
pub fn parse_connection_string(raw: &str) -> Option<ConnectionString> {
    let payload = decode_connection_string_payload(raw)?;
    if !payload.is_object() {
        return None;
    }
    Some(ConnectionString {
        url: string_field(&payload, &["url", "apiUrl"])
            .map(|u| normalize_api_url(&u))
            .filter(|u| !u.is_empty()),
        key: string_field(&payload, &["key", "token"]),
        vendor_id: string_field(&payload, &["vid", "vendorId"]),
    })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Submission failure, classified by whether an automatic retry can help.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    /// Network fault or a server-side error status.
    #[error("{0}")]
    Transient(String),

    /// 429/503 carrying a `Retry-After` the client should honour.
    #[error("{detail}")]
    Throttled { detail: String, retry_after: Duration },

    /// Validation or business-rule rejection by the server.
    #[error("{0}")]
    Rejected(String),

    #[error("submission timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{0}")]
    Unauthorized(String),

    /// 2xx response the client could not interpret.
    #[error("invalid response from server: {0}")]
    Decode(String),
}

impl SubmitError {
    /// Transient faults, timeouts and unreadable success responses are
    /// retried; the submission carries an idempotency key, so a retry after
    /// an unreadable success cannot duplicate the order.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmitError::Transient(_)
                | SubmitError::Throttled { .. }
                | SubmitError::Timeout(_)
                | SubmitError::Decode(_)
        )
    }

    /// Minimum wait the server asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SubmitError::Throttled { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach order server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid order server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API token is invalid or expired".to_string(),
        403 => "Vendor not authorized to submit orders".to_string(),
        404 => "Order endpoint not found".to_string(),
        408 => "Order server timed out".to_string(),
        429 => "Order server is rate limiting requests".to_string(),
        s if s >= 500 => "Order server error".to_string(),
        _ => "Unexpected response from order server".to_string(),
    }
}

/// Build a failure message from a non-2xx response, keeping validation
/// details the server attached so the seller can correct the order.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    let body_text = body_text.trim();
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status_error(status));
        if let Some(details) = json.get("details").or_else(|| json.get("errors")) {
            return format!("{message} (HTTP {}): {details}", status.as_u16());
        }
        return format!("{message} (HTTP {})", status.as_u16());
    }
    if body_text.is_empty() {
        format!("{} (HTTP {})", status_error(status), status.as_u16())
    } else {
        format!(
            "{} (HTTP {}): {body_text}",
            status_error(status),
            status.as_u16()
        )
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date. Dates in the past yield
/// zero.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Map a non-2xx status to the failure taxonomy.
fn classify_status(
    status: StatusCode,
    detail: String,
    retry_after: Option<Duration>,
) -> SubmitError {
    match (status.as_u16(), retry_after) {
        (429 | 503, Some(retry_after)) => SubmitError::Throttled {
            detail,
            retry_after,
        },
        (code, _) => classify_code(code, detail),
    }
}

fn classify_code(code: u16, detail: String) -> SubmitError {
    match code {
        408 | 429 => SubmitError::Transient(detail),
        401 | 403 => SubmitError::Unauthorized(detail),
        s if s >= 500 => SubmitError::Transient(detail),
        _ => SubmitError::Rejected(detail),
    }
}

// ---------------------------------------------------------------------------
// Submission payload
// ---------------------------------------------------------------------------

/// Body of `POST /api/pedidos`. Items are the resolver's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub local_id: String,
    pub customer_id: String,
    pub discount_percent: f64,
    pub total: f64,
    pub created_at: DateTime<Utc>,
    pub items: Vec<ResolvedLine>,
    pub groups: Vec<ComboGroup>,
}

impl OrderPayload {
    pub fn from_order(order: &Order) -> Self {
        let resolution = resolve_line_items(&order.items);
        Self {
            local_id: order.local_id.clone(),
            customer_id: order.customer_id.clone(),
            discount_percent: order.discount_percent,
            total: order.total,
            created_at: order.created_at,
            items: resolution.lines,
            groups: resolution.groups,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub server_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default, alias = "id")]
    server_id: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Interpret a 2xx submission response body.
fn parse_submit_response(body_text: &str) -> Result<SubmitReceipt, SubmitError> {
    let response: SubmitResponse =
        serde_json::from_str(body_text).map_err(|e| SubmitError::Decode(e.to_string()))?;

    if !response.ok {
        let reason = response
            .error
            .or(response.message)
            .unwrap_or_else(|| "Order rejected by server".to_string());
        return Err(SubmitError::Rejected(reason));
    }

    let server_id = match response.server_id {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(SubmitError::Decode("response is missing serverId".into())),
    };
    Ok(SubmitReceipt { server_id })
}

// ---------------------------------------------------------------------------
// Order submission
// ---------------------------------------------------------------------------

#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    /// `submit(payload) -> { ok: true, serverId } | { ok: false, error }`.
    async fn submit(&self, payload: &OrderPayload) -> Result<SubmitReceipt, SubmitError>;
}

/// reqwest-backed [`OrderSubmitter`].
pub struct HttpOrderSubmitter {
    client: Client,
    base_url: String,
    token: Option<Zeroizing<String>>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpOrderSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOrderSubmitter")
            .field("base_url", &self.base_url)
            .field("has_token", &self.token.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpOrderSubmitter {
    pub fn new(
        base_url: &str,
        token: Option<Zeroizing<String>>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: normalize_api_url(base_url),
            token,
            timeout,
        })
    }
}

#[async_trait]
impl OrderSubmitter for HttpOrderSubmitter {
    async fn submit(&self, payload: &OrderPayload) -> Result<SubmitReceipt, SubmitError> {
        let url = format!("{}{ORDERS_PATH}", self.base_url);

        let mut req = self
            .client
            .post(&url)
            .header("Idempotency-Key", &payload.local_id)
            .json(payload);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.as_str());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                SubmitError::Timeout(self.timeout)
            } else {
                SubmitError::Transient(friendly_error(&self.base_url, &e))
            }
        })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let body_text = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                SubmitError::Timeout(self.timeout)
            } else {
                SubmitError::Transient(friendly_error(&self.base_url, &e))
            }
        })?;

        if !status.is_success() {
            if let Some(retry_after) = retry_after {
                debug!(order_id = %payload.local_id, retry_after_secs = retry_after.as_secs(), "Server sent Retry-After");
            }
            return Err(classify_status(
                status,
                error_detail(status, &body_text),
                retry_after,
            ));
        }

        let receipt = parse_submit_response(&body_text)?;
        info!(
            order_id = %payload.local_id,
            server_id = %receipt.server_id,
            "Order accepted by server"
        );
        Ok(receipt)
    }
}

// ---------------------------------------------------------------------------
// Generic fetch (cache agent network side)
// ---------------------------------------------------------------------------

/// An outbound request seen by the cache agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub method: String,
    pub url: String,
    pub body: Option<Vec<u8>>,
}

impl ResourceRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            body: None,
        }
    }

    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            url: url.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    /// URL path without scheme, host or query string.
    pub fn path(&self) -> &str {
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let path = match without_scheme.find('/') {
            Some(idx) if self.url.contains("://") => &without_scheme[idx..],
            Some(_) => without_scheme,
            None => "/",
        };
        path.split(['?', '#']).next().unwrap_or(path)
    }
}

/// A network response as stored and replayed by the cache agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("{0}")]
    Network(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. Any HTTP status is a response; only transport
    /// faults are errors.
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchedResponse, FetchError>;
}

/// reqwest-backed [`Fetcher`].
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    token: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("has_token", &self.token.is_some())
            .finish()
    }
}

impl HttpFetcher {
    pub fn new(token: Option<Zeroizing<String>>) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self { client, token })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchedResponse, FetchError> {
        let method: Method = request
            .method
            .parse()
            .map_err(|_| FetchError::Invalid(format!("HTTP method {}", request.method)))?;

        let mut req = self.client.request(method, &request.url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.as_str());
        }
        if let Some(body) = &request.body {
            req = req.body(body.clone());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(request.url.clone())
            } else {
                FetchError::Network(friendly_error(&request.url, &e))
            }
        })?;

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Network(friendly_error(&request.url, &e)))?
            .to_vec();

        Ok(FetchedResponse {
            status,
            content_type,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Connectivity probe
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// `GET {base}/api/health` with a short timeout.
pub struct HttpConnectivityProbe {
    client: Client,
    health_url: String,
}

impl HttpConnectivityProbe {
    pub fn new(base_url: &str) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(CONNECTIVITY_TIMEOUT).build()?;
        Ok(Self {
            client,
            health_url: format!("{}{HEALTH_PATH}", normalize_api_url(base_url)),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn is_online(&self) -> bool {
        match self.client.get(&self.health_url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "Health check returned an error status");
                false
            }
            Err(e) => {
                debug!(error = %friendly_error(&self.health_url, &e), "Health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderItem, OrderStatus};
    use base64::Engine as _;

    #[test]
    fn normalize_api_url_adds_scheme_and_strips_api_suffix() {
        assert_eq!(
            normalize_api_url("ventas.example.com/api/"),
            "https://ventas.example.com"
        );
        assert_eq!(normalize_api_url("localhost:8080"), "http://localhost:8080");
        assert_eq!(
            normalize_api_url("https://ventas.example.com//"),
            "https://ventas.example.com"
        );
        assert_eq!(normalize_api_url("  "), "");
    }

    #[test]
    fn connection_string_accepts_raw_json() {
        let parsed = parse_connection_string(
            r#"{"url":"ventas.example.com/api","key":" tok-1 ","vid":"V-07"}"#,
        )
        .unwrap();
        assert_eq!(parsed.url.as_deref(), Some("https://ventas.example.com"));
        assert_eq!(parsed.key.as_deref(), Some("tok-1"));
        assert_eq!(parsed.vendor_id.as_deref(), Some("V-07"));
    }

    #[test]
    fn connection_string_accepts_url_safe_base64() {
        let json = r#"{"url":"https://ventas.example.com","key":"tok-2"}"#;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json);
        let parsed = parse_connection_string(&encoded).unwrap();
        assert_eq!(parsed.url.as_deref(), Some("https://ventas.example.com"));
        assert_eq!(parsed.key.as_deref(), Some("tok-2"));
        assert_eq!(parsed.vendor_id, None);

        assert!(parse_connection_string("not a connection string").is_none());
    }

    #[test]
    fn status_classification_follows_failure_taxonomy() {
        let transient = classify_status(StatusCode::SERVICE_UNAVAILABLE, "down".into(), None);
        assert!(transient.is_retryable());
        assert_eq!(transient.retry_after(), None);
        assert!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow".into(), None).is_retryable()
        );

        let rejected = classify_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            "bad".into(),
            Some(Duration::from_secs(5)),
        );
        assert_eq!(rejected, SubmitError::Rejected("bad".into()));
        assert!(!rejected.is_retryable());

        let unauthorized = classify_status(StatusCode::UNAUTHORIZED, "no".into(), None);
        assert!(matches!(unauthorized, SubmitError::Unauthorized(_)));
        assert!(!unauthorized.is_retryable());

        assert!(SubmitError::Timeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn throttling_statuses_keep_retry_after() {
        let throttled = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            "slow down (HTTP 429)".into(),
            Some(Duration::from_secs(10)),
        );
        assert!(throttled.is_retryable());
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(10)));
        assert_eq!(throttled.to_string(), "slow down (HTTP 429)");

        let unavailable = classify_status(
            StatusCode::SERVICE_UNAVAILABLE,
            "down".into(),
            Some(Duration::from_secs(3)),
        );
        assert_eq!(unavailable.retry_after(), Some(Duration::from_secs(3)));

        let gateway = classify_status(
            StatusCode::BAD_GATEWAY,
            "gateway".into(),
            Some(Duration::from_secs(3)),
        );
        assert_eq!(gateway, SubmitError::Transient("gateway".into()));
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = DateTime::parse_from_rfc3339("2026-03-02T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(parse_retry_after(" 120 ", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Mon, 02 Mar 2026 10:00:45 GMT", now),
            Some(Duration::from_secs(45))
        );
        assert_eq!(
            parse_retry_after("Mon, 02 Mar 2026 09:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
        assert_eq!(parse_retry_after("-5", now), None);
    }

    #[test]
    fn error_detail_keeps_server_validation_details() {
        let detail = error_detail(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"Cliente sin credito","details":{"limite":1000}}"#,
        );
        assert_eq!(detail, r#"Cliente sin credito (HTTP 422): {"limite":1000}"#);

        let plain = error_detail(StatusCode::BAD_GATEWAY, "");
        assert_eq!(plain, "Order server error (HTTP 502)");

        let text = error_detail(StatusCode::BAD_REQUEST, "missing field");
        assert!(text.ends_with("(HTTP 400): missing field"));
    }

    #[test]
    fn submit_response_parsing() {
        assert_eq!(
            parse_submit_response(r#"{"ok":true,"serverId":"PED-881"}"#).unwrap(),
            SubmitReceipt {
                server_id: "PED-881".into()
            }
        );
        assert_eq!(
            parse_submit_response(r#"{"ok":true,"id":4512}"#)
                .unwrap()
                .server_id,
            "4512"
        );
        assert_eq!(
            parse_submit_response(r#"{"ok":false,"error":"producto inactivo"}"#),
            Err(SubmitError::Rejected("producto inactivo".into()))
        );
        assert!(matches!(
            parse_submit_response(r#"{"ok":true}"#),
            Err(SubmitError::Decode(_))
        ));
        assert!(matches!(
            parse_submit_response("<html>"),
            Err(SubmitError::Decode(_))
        ));
    }

    #[test]
    fn payload_carries_local_id_and_resolved_items() {
        let now = Utc::now();
        let order = Order {
            local_id: "loc-1".into(),
            server_id: None,
            customer_id: "CLI-9".into(),
            items: vec![
                OrderItem {
                    id: "b".into(),
                    producto_id: "P2".into(),
                    cantidad: 1.0,
                    es_bonificacion: true,
                    parent_item_id: Some("a".into()),
                    ..Default::default()
                },
                OrderItem {
                    id: "a".into(),
                    producto_id: "P1".into(),
                    cantidad: 2.0,
                    precio_unitario: 5.0,
                    ..Default::default()
                },
            ],
            discount_percent: 0.0,
            total: 10.0,
            status: OrderStatus::Ingresado,
            attempts: 0,
            last_error: None,
            created_at: now,
            modified_at: now,
            synced: false,
        };

        let payload = OrderPayload::from_order(&order);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["localId"], "loc-1");
        assert_eq!(json["customerId"], "CLI-9");
        assert_eq!(json["items"][0]["id"], "a");
        assert_eq!(json["items"][0]["lineNumber"], 1);
        assert_eq!(json["items"][1]["id"], "b");
        assert_eq!(json["items"][1]["lineNumber"], 2);
        assert!(json["groups"].as_array().unwrap().is_empty());
    }

    #[test]
    fn resource_request_path_strips_host_and_query() {
        let req = ResourceRequest::get("https://ventas.example.com/api/productos?page=2");
        assert_eq!(req.path(), "/api/productos");
        assert_eq!(ResourceRequest::get("https://ventas.example.com").path(), "/");
        assert_eq!(ResourceRequest::get("/images/logo.png#x").path(), "/images/logo.png");
        assert!(ResourceRequest::new("post", "/api/pedidos").method == "POST");
    }
}
