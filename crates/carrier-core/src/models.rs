//! Core domain models and strongly-typed identifiers.
//!
//! Defines queued requests, their lifecycle states, attempt audit records,
//! and the newtype identifier wrapper. Includes database serialization
//! traits and the JSON snapshot representation used by the index store.

use std::{collections::HashMap, fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed request identifier.
///
/// Opaque string supplied by the caller or generated as a UUID v4. The id
/// follows the request through the durable store, the index store sets,
/// and every attempt record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generates a new collision-resistant request id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl sqlx::Type<PgDb> for RequestId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RequestId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(s))
    }
}

impl sqlx::Encode<'_, PgDb> for RequestId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// HTTP methods accepted for queued requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP GET method.
    Get,
    /// HTTP POST method (default).
    #[default]
    Post,
    /// HTTP PUT method.
    Put,
    /// HTTP PATCH method.
    Patch,
    /// HTTP DELETE method.
    Delete,
    /// HTTP HEAD method.
    Head,
    /// HTTP OPTIONS method.
    Options,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Patch => write!(f, "PATCH"),
            Self::Delete => write!(f, "DELETE"),
            Self::Head => write!(f, "HEAD"),
            Self::Options => write!(f, "OPTIONS"),
        }
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            _ => Err(format!("invalid http method: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for HttpMethod {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for HttpMethod {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for HttpMethod {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Request lifecycle status.
///
/// Requests progress through these states during processing:
///
/// ```text
/// pending ───▶ processing ───▶ completed
///    ▲   ▲          │
///    │   └──────────┤ (retry scheduled)
/// scheduled         └─────────▶ dead
///
/// pending/scheduled ──────────▶ cancelled (operator)
/// dead ──────────▶ pending (operator retry)
/// ```
///
/// `completed`, `dead`, and `cancelled` are sinks: nothing leaves them
/// except the explicit dead-letter retry command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Queued and waiting for a worker.
    Pending,
    /// Waiting for a future dispatch time or retry time.
    Scheduled,
    /// Claimed by a worker, execution in flight.
    Processing,
    /// Terminal success: a 2xx response was received.
    Completed,
    /// Last attempt failed; a retry is pending.
    Failed,
    /// Terminal failure: retries exhausted or non-retryable outcome.
    Dead,
    /// Terminal: removed from the queue before execution.
    Cancelled,
}

impl RequestStatus {
    /// Whether this status is a sink state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Dead | Self::Cancelled)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Dead => write!(f, "dead"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid request status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for RequestStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RequestStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for RequestStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Summary of the last successful response, stored with the request row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSummary {
    /// HTTP status code of the final response.
    pub status_code: u16,

    /// Response headers (may be trimmed).
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body excerpt, truncated for storage.
    pub body: Option<String>,

    /// Wall-clock duration of the winning attempt in milliseconds.
    pub duration_ms: i64,
}

/// Core queued request entity.
///
/// One row per request in the durable store; a JSON snapshot of the same
/// value lives under `request:{id}` in the index store while the request
/// is queued. Scheduling fields and outcome fields share the row because
/// every state transition is an atomic partial update of it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredRequest {
    /// Unique identifier for this request.
    pub id: RequestId,

    /// Absolute target URL with scheme and host.
    pub url: String,

    /// HTTP method to execute.
    pub method: HttpMethod,

    /// Request headers to send.
    pub headers: sqlx::types::Json<HashMap<String, String>>,

    /// Opaque request payload, absent for body-less requests.
    pub body: Option<Vec<u8>>,

    /// Dispatch priority in [0, 100]; higher dispatches sooner.
    pub priority: i32,

    /// Maximum retry count for this request.
    pub max_retries: i32,

    /// Per-attempt deadline in milliseconds.
    pub timeout_ms: i64,

    /// Earliest dispatch time; a future value starts the request
    /// in `scheduled`.
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Caller-supplied key/value pairs, opaque to the engine and
    /// preserved verbatim.
    pub metadata: sqlx::types::Json<serde_json::Map<String, serde_json::Value>>,

    /// Current lifecycle status.
    pub status: RequestStatus,

    /// Count of attempts started. Non-decreasing.
    pub attempts: i32,

    /// Timestamp of the most recent attempt start.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When the next retry becomes due.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// When the request reached `completed`.
    pub completed_at: Option<DateTime<Utc>>,

    /// Last error description (failed/dead).
    pub error: Option<String>,

    /// Last successful response summary (completed).
    pub response: Option<sqlx::types::Json<ResponseSummary>>,

    /// Time of admission.
    pub created_at: DateTime<Utc>,

    /// Monotonically non-decreasing; refreshed on every row update.
    pub updated_at: DateTime<Utc>,
}

impl StoredRequest {
    /// Builds a durable row from validated enqueue input.
    ///
    /// A `scheduled_for` in the future starts the request in `scheduled`;
    /// otherwise it starts in `pending`.
    pub fn from_new(input: NewRequest, now: DateTime<Utc>) -> Self {
        let status = match input.scheduled_for {
            Some(at) if at > now => RequestStatus::Scheduled,
            _ => RequestStatus::Pending,
        };

        Self {
            id: input.id.map_or_else(RequestId::generate, RequestId::from),
            url: input.url,
            method: input.method,
            headers: sqlx::types::Json(input.headers),
            body: input.body,
            priority: input.priority.unwrap_or(crate::DEFAULT_PRIORITY),
            max_retries: input.max_retries.unwrap_or(crate::DEFAULT_MAX_RETRIES),
            timeout_ms: input.timeout_ms.unwrap_or(crate::DEFAULT_TIMEOUT_MS),
            scheduled_for: input.scheduled_for,
            metadata: sqlx::types::Json(input.metadata),
            status,
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            completed_at: None,
            error: None,
            response: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Request headers as a plain map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers.0
    }

    /// Body as `Bytes` for zero-copy request construction.
    pub fn body_bytes(&self) -> Option<Bytes> {
        self.body.as_ref().map(|body| Bytes::from(body.clone()))
    }

    /// The mutable state fields as a standalone view.
    pub fn state(&self) -> RequestState {
        RequestState {
            status: self.status,
            attempts: self.attempts,
            last_attempt_at: self.last_attempt_at,
            next_retry_at: self.next_retry_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
            response: self.response.as_ref().map(|r| r.0.clone()),
            updated_at: self.updated_at,
        }
    }

    /// Serializes the request to its index-store JSON snapshot.
    pub fn to_snapshot(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserializes a request from its index-store JSON snapshot.
    pub fn from_snapshot(snapshot: &str) -> serde_json::Result<Self> {
        serde_json::from_str(snapshot)
    }
}

/// Mutable request state, the shape returned by status lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestState {
    /// Current lifecycle status.
    pub status: RequestStatus,
    /// Count of attempts started.
    pub attempts: i32,
    /// Timestamp of the most recent attempt start.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the next retry becomes due.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the request reached `completed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last error description.
    pub error: Option<String>,
    /// Last successful response summary.
    pub response: Option<ResponseSummary>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

/// Enqueue input accepted by the engine.
///
/// Unset fields fall back to engine defaults; `id` is generated when
/// absent. `metadata` passes through the engine untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRequest {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Absolute target URL.
    pub url: String,

    /// HTTP method; defaults to POST.
    #[serde(default)]
    pub method: HttpMethod,

    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Opaque payload bytes.
    #[serde(default)]
    pub body: Option<Vec<u8>>,

    /// Dispatch priority in [0, 100].
    #[serde(default)]
    pub priority: Option<i32>,

    /// Maximum retry count.
    #[serde(default)]
    pub max_retries: Option<i32>,

    /// Per-attempt deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<i64>,

    /// Earliest dispatch time.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Caller metadata, preserved verbatim.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NewRequest {
    /// Convenience constructor for a request to `url` with defaults.
    pub fn to_url(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }
}

/// Outcome of a single execution, as recorded in the attempt log.
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    /// HTTP status if a response was received.
    pub status_code: Option<u16>,
    /// Wall-clock duration from send to receive (or failure).
    pub duration_ms: i64,
    /// Error description when no response arrived.
    pub error: Option<String>,
    /// Response headers, when captured.
    pub response_headers: Option<HashMap<String, String>>,
}

/// Append-only audit record of one execution of a request.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AttemptRecord {
    /// Unique identifier for this attempt row.
    pub id: Uuid,
    /// Request this attempt belongs to.
    pub request_id: RequestId,
    /// 1-based attempt number, unique per request.
    pub attempt_number: i32,
    /// HTTP status if a response was received.
    pub status_code: Option<i32>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
    /// Error description if no response or transport failure.
    pub error: Option<String>,
    /// Response headers, when captured.
    pub response_headers: Option<sqlx::types::Json<HashMap<String, String>>>,
    /// When this attempt was made.
    pub created_at: DateTime<Utc>,
}

/// Partial update applied alongside a status transition.
///
/// Unset fields keep their stored value. `attempts` can only grow: the
/// store clamps it with `GREATEST` so callers cannot regress the counter.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    /// New attempts count (never regresses).
    pub attempts: Option<i32>,
    /// New last-attempt timestamp.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// New next-retry time.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// New completion timestamp.
    pub completed_at: Option<DateTime<Utc>>,
    /// New error description.
    pub error: Option<String>,
    /// New response summary.
    pub response: Option<ResponseSummary>,
}

/// Aggregate statistics over the durable store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Requests waiting for dispatch (`pending` merged with `scheduled`).
    pub pending: i64,
    /// Requests currently claimed by workers.
    pub processing: i64,
    /// Requests that completed successfully.
    pub completed: i64,
    /// Requests whose last attempt failed and await retry.
    pub failed: i64,
    /// Requests that exhausted their retries.
    pub dead: i64,
    /// Requests cancelled before execution.
    pub cancelled: i64,
    /// Mean attempt duration in milliseconds over recorded attempts.
    pub avg_processing_ms: f64,
    /// completed / (completed + failed + dead); 0 when no outcomes exist.
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_storage_format() {
        assert_eq!(RequestStatus::Pending.to_string(), "pending");
        assert_eq!(RequestStatus::Scheduled.to_string(), "scheduled");
        assert_eq!(RequestStatus::Processing.to_string(), "processing");
        assert_eq!(RequestStatus::Completed.to_string(), "completed");
        assert_eq!(RequestStatus::Failed.to_string(), "failed");
        assert_eq!(RequestStatus::Dead.to_string(), "dead");
        assert_eq!(RequestStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn terminal_states_identified() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Dead.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Processing.is_terminal());
        assert!(!RequestStatus::Failed.is_terminal());
    }

    #[test]
    fn method_parse_round_trip() {
        for method in ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"] {
            let parsed: HttpMethod = method.parse().expect("method should parse");
            assert_eq!(parsed.to_string(), method);
        }
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn future_schedule_starts_scheduled() {
        let now = Utc::now();
        let input = NewRequest {
            scheduled_for: Some(now + chrono::Duration::seconds(10)),
            ..NewRequest::to_url("https://example.com/hook")
        };
        let request = StoredRequest::from_new(input, now);
        assert_eq!(request.status, RequestStatus::Scheduled);

        let input = NewRequest {
            scheduled_for: Some(now - chrono::Duration::seconds(10)),
            ..NewRequest::to_url("https://example.com/hook")
        };
        let request = StoredRequest::from_new(input, now);
        assert_eq!(request.status, RequestStatus::Pending);
    }

    #[test]
    fn defaults_applied_on_admission() {
        let now = Utc::now();
        let request =
            StoredRequest::from_new(NewRequest::to_url("https://example.com/hook"), now);

        assert_eq!(request.priority, crate::DEFAULT_PRIORITY);
        assert_eq!(request.max_retries, crate::DEFAULT_MAX_RETRIES);
        assert_eq!(request.timeout_ms, crate::DEFAULT_TIMEOUT_MS);
        assert_eq!(request.attempts, 0);
        assert_eq!(request.method, HttpMethod::Post);
        assert!(!request.id.as_str().is_empty());
    }

    #[test]
    fn snapshot_round_trip_preserves_all_fields() {
        let now = Utc::now();
        let mut metadata = serde_json::Map::new();
        metadata.insert("tenant".to_string(), serde_json::json!("acme"));
        metadata.insert("trace".to_string(), serde_json::json!({"span": 42}));

        let input = NewRequest {
            id: Some("req-42".to_string()),
            url: "https://api.example.com/v1/items".to_string(),
            method: HttpMethod::Put,
            headers: HashMap::from([("x-api-key".to_string(), "secret".to_string())]),
            body: Some(b"{\"name\":\"widget\"}".to_vec()),
            priority: Some(90),
            max_retries: Some(5),
            timeout_ms: Some(5_000),
            scheduled_for: Some(now + chrono::Duration::minutes(1)),
            metadata,
        };
        let request = StoredRequest::from_new(input, now);

        let snapshot = request.to_snapshot().expect("snapshot should serialize");
        let restored = StoredRequest::from_snapshot(&snapshot).expect("snapshot should parse");

        assert_eq!(restored.id, request.id);
        assert_eq!(restored.url, request.url);
        assert_eq!(restored.method, request.method);
        assert_eq!(restored.headers.0, request.headers.0);
        assert_eq!(restored.body, request.body);
        assert_eq!(restored.priority, request.priority);
        assert_eq!(restored.max_retries, request.max_retries);
        assert_eq!(restored.timeout_ms, request.timeout_ms);
        assert_eq!(restored.scheduled_for, request.scheduled_for);
        assert_eq!(restored.metadata.0, request.metadata.0);
        assert_eq!(restored.status, request.status);
        assert_eq!(restored.created_at, request.created_at);
    }
}
