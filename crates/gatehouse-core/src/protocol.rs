//! Gatehouse gateway wire protocol.
//!
//! All gateway communication uses JSON-over-WebSocket with three frame types:
//! Request, Response, and Event. The handshake (`hello` / `hello-ok`), the
//! liveness `tick`, and `shutdown` are expressed with those three shapes.
//! Every frame is validated strictly: unknown fields are rejected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Protocol version implemented by this gateway.
pub const PROTOCOL_VERSION: u32 = 1;

/// A gateway wire frame: the top-level message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Client -> Server request.
    #[serde(rename = "req")]
    Request(RequestFrame),

    /// Server -> Client response.
    #[serde(rename = "res")]
    Response(ResponseFrame),

    /// Server -> Client event.
    #[serde(rename = "event")]
    Event(EventFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

impl GatewayFrame {
    pub fn ok(id: &str, payload: serde_json::Value) -> Self {
        GatewayFrame::Response(ResponseFrame {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        })
    }

    pub fn err(id: &str, error: ErrorShape) -> Self {
        GatewayFrame::Response(ResponseFrame {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(error),
        })
    }

    pub fn event(event: &str, payload: Option<serde_json::Value>) -> Self {
        GatewayFrame::Event(EventFrame {
            event: event.to_string(),
            payload,
            seq: None,
            state_version: None,
        })
    }
}

/// Error shape returned in response frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retryable = Some(true);
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Stable error codes carried in [`ErrorShape::code`].
pub mod error_codes {
    // Protocol errors: fatal to the connection.
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const DUPLICATE_REQUEST_ID: &str = "duplicate_request_id";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    pub const UNSUPPORTED_PROTOCOL: &str = "unsupported_protocol";
    pub const AUTH_FAILED: &str = "auth_failed";

    // Per-request errors.
    pub const METHOD_NOT_FOUND: &str = "method_not_found";
    pub const INVALID_PARAMS: &str = "invalid_params";
    pub const FORBIDDEN: &str = "forbidden";
    pub const NOT_FOUND: &str = "not_found";
    pub const UNAVAILABLE: &str = "unavailable";
    pub const TASK_FAILED: &str = "task_failed";

    // Admission denials.
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const QUEUE_FULL: &str = "queue_full";
    pub const QUEUE_TIMEOUT: &str = "queue_timeout";
    pub const GOVERNOR_SATURATED: &str = "governor_saturated";

    // Interrupt resolution.
    pub const BINDING_MISMATCH: &str = "binding_mismatch";
    pub const EXPIRED: &str = "expired";
    pub const TOKEN_MISMATCH: &str = "token_mismatch";
    pub const ALREADY_RESOLVED: &str = "already_resolved";
    pub const DUPLICATE_INTERRUPT: &str = "duplicate_interrupt";

    pub const STORE_ERROR: &str = "store_error";
}

/// Monotonic state version counters for client staleness detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateVersion {
    pub presence: u64,
    pub interrupts: u64,
}

/// Client handshake parameters, sent as the params of the `hello` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelloParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum AuthParams {
    #[serde(rename = "token")]
    Token { token: String },
    #[serde(rename = "password")]
    Password { password: String },
}

impl AuthParams {
    /// The secret presented, as folded into the device signature payload.
    pub fn secret(&self) -> &str {
        match self {
            AuthParams::Token { token } => token,
            AuthParams::Password { password } => password,
        }
    }
}

/// Device-signature proof: Ed25519 over the canonical connect payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceParams {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: u64,
    pub nonce: String,
}

/// Present when a client reconnects and wants to pick up where it left off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeParams {
    /// Highest event sequence number the client has seen.
    pub last_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

/// Server hello response after successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub policy: Policy,
    pub snapshot: Snapshot,
    pub auth: HelloAuth,
    pub resume: ResumeOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerInfo {
    pub version: String,
    pub conn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub max_payload: usize,
    pub max_buffered_bytes: usize,
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelloAuth {
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// No resume was requested.
    Fresh,
    /// Missed events follow the hello-ok response.
    Replay,
    /// The requested sequence predates the backlog; the snapshot is authoritative.
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeOutcome {
    pub mode: ResumeMode,
    pub replayed: usize,
}

/// Point-in-time gateway state sufficient to render without replaying history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    pub state_version: StateVersion,
    /// Sequence number of the newest event covered by this snapshot.
    pub seq: u64,
    pub auth_mode: String,
    pub uptime_ms: u64,
    pub presence: Vec<PresenceEntry>,
    pub pending_interrupts: Vec<InterruptSummary>,
    pub admission: AdmissionSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceEntry {
    pub conn_id: String,
    pub client_id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub connected_at_ms: u64,
}

/// The (run, session, tool call) triple that scopes an interrupt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterruptBinding {
    pub run_id: String,
    pub session_id: String,
    pub tool_call_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptStatus {
    Pending,
    Resumed,
    Expired,
}

impl InterruptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InterruptStatus::Pending)
    }
}

/// Client-visible view of an interrupt. Never carries the token hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterruptSummary {
    pub approval_request_id: String,
    pub binding: InterruptBinding,
    pub status: InterruptStatus,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionSnapshot {
    pub governors: Vec<GovernorSnapshot>,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GovernorSnapshot {
    pub name: String,
    pub enabled: bool,
    pub max_slots: usize,
    pub active: usize,
    pub waiting: usize,
    pub active_by_holder: BTreeMap<String, usize>,
}

/// Payload of the periodic `tick` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TickEvent {
    pub ts: u64,
}

/// Payload of the `shutdown` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownEvent {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_expected_ms: Option<u64>,
}
