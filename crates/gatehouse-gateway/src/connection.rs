//! WebSocket connection lifecycle: challenge, handshake, read/write loops.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gatehouse_core::config::GatewayAuthConfig;
use gatehouse_core::protocol::{
    AuthParams, DeviceParams, ErrorShape, GatewayFrame, HelloAuth, HelloOk, HelloParams,
    PROTOCOL_VERSION, RequestFrame, ResumeMode, ResumeOutcome, ServerInfo, error_codes,
};
use gatehouse_core::secret::{constant_time_eq, random_token, sha256_hex};
use gatehouse_core::token_store::TokenStore;

use crate::events::EVENT_CONNECT_CHALLENGE;
use crate::methods::{Caller, dispatch_method};
use crate::state::{ConnectionState, GatewayState};

const DEFAULT_ROLE: &str = "operator";

/// Outbound queue for one connection, bounded by bytes rather than count.
///
/// Exceeding `max_buffered` closes the connection instead of growing memory.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<String>,
    buffered: Arc<AtomicUsize>,
    overflowed: Arc<AtomicBool>,
    max_buffered: usize,
    close: CancellationToken,
}

impl Outbox {
    pub fn channel(max_buffered: usize, close: CancellationToken) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = Self {
            tx,
            buffered: Arc::new(AtomicUsize::new(0)),
            overflowed: Arc::new(AtomicBool::new(false)),
            max_buffered,
            close,
        };
        (outbox, rx)
    }

    #[cfg(test)]
    pub fn for_test() -> (Self, mpsc::UnboundedReceiver<String>) {
        Self::channel(usize::MAX, CancellationToken::new())
    }

    /// Queue a serialized frame. Returns false if the connection is closing.
    pub fn send(&self, msg: String) -> bool {
        if self.close.is_cancelled() {
            return false;
        }
        let len = msg.len();
        let queued = self.buffered.fetch_add(len, Ordering::SeqCst).saturating_add(len);
        if queued > self.max_buffered {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            warn!(queued, max = self.max_buffered, "Outbound buffer exceeded, closing connection");
            self.overflowed.store(true, Ordering::SeqCst);
            self.close.cancel();
            return false;
        }
        if self.tx.send(msg).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn send_frame(&self, frame: &GatewayFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(msg) => self.send(msg),
            Err(e) => {
                warn!(%e, "Failed to serialize frame");
                false
            }
        }
    }

    fn delivered(&self, bytes: usize) {
        self.buffered.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst)
    }
}

/// Who the peer turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub subject: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub device_id: Option<String>,
}

/// A rejected handshake or a fatal protocol error.
#[derive(Debug)]
struct Fault {
    request_id: Option<String>,
    error: ErrorShape,
}

impl Fault {
    fn new(request_id: Option<String>, code: &str, message: &str) -> Self {
        Self {
            request_id,
            error: ErrorShape::new(code, message),
        }
    }
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let policy = state.config.policy();
    let (mut ws_tx, mut ws_rx) = ws.split();
    let close = state.shutdown.child_token();
    let (outbox, mut out_rx) = Outbox::channel(policy.max_buffered_bytes, close.clone());

    // Writer: drains the outbox until the connection closes.
    let writer = outbox.clone();
    let send_task = tokio::spawn(async move {
        loop {
            if writer.is_overflowed() {
                break;
            }
            tokio::select! {
                biased;
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { break };
                    let len = msg.len();
                    if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                    writer.delivered(len);
                }
                _ = writer.close.cancelled() => break,
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let nonce = random_token(16);
    outbox.send_frame(&GatewayFrame::event(
        EVENT_CONNECT_CHALLENGE,
        Some(json!({ "nonce": nonce, "ts": state.clock.now_ms() })),
    ));

    let handshake = tokio::time::timeout(
        Duration::from_millis(policy.handshake_timeout_ms),
        wait_for_hello(&mut ws_rx, policy.max_payload),
    )
    .await;

    let accepted = match handshake {
        Ok(Ok((request_id, hello))) => {
            match accept(&state, &request_id, &hello, &nonce).await {
                Ok(identity) => Some((request_id, hello, identity)),
                Err(fault) => {
                    reject(&conn_id, &outbox, fault);
                    None
                }
            }
        }
        Ok(Err(fault)) => {
            reject(&conn_id, &outbox, fault);
            None
        }
        Err(_) => {
            warn!(conn_id = %conn_id, "Handshake timeout");
            None
        }
    };

    let Some((request_id, hello, identity)) = accepted else {
        close.cancel();
        let _ = send_task.await;
        #[cfg(feature = "metrics")]
        crate::metrics::record_ws_disconnect();
        return;
    };

    {
        let mut connections = state.connections.write().await;
        connections.insert(
            conn_id.clone(),
            ConnectionState {
                conn_id: conn_id.clone(),
                client_id: hello.client.id.clone(),
                role: identity.role.clone(),
                scopes: identity.scopes.clone(),
                device_id: identity.device_id.clone(),
                connected_at_ms: state.clock.now_ms(),
            },
        );
    }
    state.broadcast_presence().await;

    let snapshot = state.snapshot().await;
    let snapshot_seq = snapshot.seq;
    let hello_ok = HelloOk {
        kind: "hello-ok".into(),
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            conn_id: conn_id.clone(),
        },
        features: state.features(),
        policy: state.policy(),
        snapshot,
        auth: HelloAuth {
            role: identity.role.clone(),
            scopes: identity.scopes.clone(),
            device_id: identity.device_id.clone(),
        },
        resume: ResumeOutcome {
            mode: ResumeMode::Fresh,
            replayed: 0,
        },
    };
    let resume_from = hello.resume.as_ref().map(|r| r.last_seq);
    let outcome = state.events.attach(
        &conn_id,
        outbox.clone(),
        &request_id,
        hello_ok,
        resume_from,
        snapshot_seq,
    );
    info!(
        conn_id = %conn_id,
        client_id = %hello.client.id,
        role = %identity.role,
        mode = ?outcome.mode,
        "Client authenticated"
    );

    let caller = Caller {
        conn_id: Some(conn_id.clone()),
        subject: identity.subject,
        role: identity.role,
        scopes: identity.scopes,
        device_id: identity.device_id,
    };

    let mut seen_ids = HashSet::new();
    seen_ids.insert(request_id);
    let mut requests = JoinSet::new();

    // Main read loop
    loop {
        let next = tokio::select! {
            _ = close.cancelled() => break,
            next = ws_rx.next() => next,
        };
        while requests.try_join_next().is_some() {}

        let Some(msg_result) = next else { break };
        match msg_result {
            Ok(Message::Text(text)) => {
                match read_request(text.as_str(), policy.max_payload, &mut seen_ids) {
                    Ok(Some(req)) => {
                        let state = state.clone();
                        let caller = caller.clone();
                        let outbox = outbox.clone();
                        requests.spawn(async move {
                            let response =
                                dispatch_method(&state, &caller, &req.id, &req.method, req.params).await;
                            outbox.send_frame(&response);
                        });
                    }
                    Ok(None) => debug!(conn_id = %conn_id, "Received non-request frame, ignoring"),
                    Err(fault) => {
                        reject(&conn_id, &outbox, fault);
                        break;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                reject(
                    &conn_id,
                    &outbox,
                    Fault::new(None, error_codes::INVALID_REQUEST, "binary frames are not supported"),
                );
                break;
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                warn!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // In-flight requests are cancelled; queued governor waits withdraw themselves.
    requests.abort_all();
    state.events.detach(&conn_id);
    state.connections.write().await.remove(&conn_id);
    state.tasks.cancel_for_connection(&conn_id);
    state.broadcast_presence().await;

    close.cancel();
    let _ = send_task.await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

/// Send the error response for a fatal fault; the caller then closes.
fn reject(conn_id: &str, outbox: &Outbox, fault: Fault) {
    warn!(conn_id, code = %fault.error.code, message = %fault.error.message, "Closing connection");
    let id = fault.request_id.unwrap_or_else(|| "unknown".into());
    outbox.send_frame(&GatewayFrame::err(&id, fault.error));
}

/// Wait for the client's `hello` request.
async fn wait_for_hello(
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    max_payload: usize,
) -> Result<(String, HelloParams), Fault> {
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if text.as_str().len() > max_payload {
                    return Err(Fault::new(None, error_codes::PAYLOAD_TOO_LARGE, "payload too large"));
                }
                return parse_hello(text.as_str());
            }
            Ok(Message::Close(_)) => {
                return Err(Fault::new(None, error_codes::INVALID_REQUEST, "closed during handshake"));
            }
            Ok(Message::Binary(_)) => {
                return Err(Fault::new(None, error_codes::INVALID_REQUEST, "expected hello"));
            }
            Err(e) => {
                debug!(%e, "WebSocket error during handshake");
                return Err(Fault::new(None, error_codes::INVALID_REQUEST, "connection error"));
            }
            _ => continue,
        }
    }
    Err(Fault::new(None, error_codes::INVALID_REQUEST, "connection dropped during handshake"))
}

fn parse_hello(text: &str) -> Result<(String, HelloParams), Fault> {
    let frame: GatewayFrame = serde_json::from_str(text).map_err(|e| {
        debug!(%e, "Malformed handshake frame");
        Fault::new(None, error_codes::INVALID_REQUEST, "malformed frame")
    })?;
    let GatewayFrame::Request(RequestFrame { id, method, params }) = frame else {
        return Err(Fault::new(None, error_codes::INVALID_REQUEST, "expected hello request"));
    };
    if method != "hello" {
        return Err(Fault::new(Some(id), error_codes::INVALID_REQUEST, "first request must be hello"));
    }
    let hello: HelloParams = serde_json::from_value(params.unwrap_or_default()).map_err(|e| {
        debug!(%e, "Invalid hello params");
        Fault::new(Some(id.clone()), error_codes::INVALID_REQUEST, "invalid hello params")
    })?;
    Ok((id, hello))
}

/// Protocol negotiation, then authentication.
async fn accept(
    state: &GatewayState,
    request_id: &str,
    hello: &HelloParams,
    nonce: &str,
) -> Result<Identity, Fault> {
    if hello.min_protocol > PROTOCOL_VERSION || hello.max_protocol < PROTOCOL_VERSION {
        let mut fault = Fault::new(
            Some(request_id.to_string()),
            error_codes::UNSUPPORTED_PROTOCOL,
            "unsupported protocol version",
        );
        fault.error = fault
            .error
            .with_details(json!({ "server_protocol": PROTOCOL_VERSION }));
        return Err(fault);
    }

    authenticate(&state.config.auth(), &state.tokens, hello, nonce)
        .await
        .map_err(|reason| {
            warn!(client_id = %hello.client.id, %reason, "Authentication failed");
            #[cfg(feature = "metrics")]
            crate::metrics::record_auth_failure();
            // The reason stays in the server log.
            Fault::new(
                Some(request_id.to_string()),
                error_codes::AUTH_FAILED,
                "authentication failed",
            )
        })
}

/// Authenticate a `hello`. Returns the reason on failure.
pub async fn authenticate(
    auth: &GatewayAuthConfig,
    tokens: &TokenStore,
    hello: &HelloParams,
    nonce: &str,
) -> Result<Identity, String> {
    let claimed = Identity {
        subject: hello.client.id.clone(),
        role: hello.role.clone().unwrap_or_else(|| DEFAULT_ROLE.to_string()),
        scopes: hello.scopes.clone(),
        device_id: None,
    };

    let mut identity = match auth.effective_mode() {
        "none" => claimed,
        "token" => {
            let Some(AuthParams::Token { token }) = &hello.auth else {
                return Err("token authentication required".into());
            };
            let shared = auth.resolve_token();
            if shared.as_deref().is_some_and(|expected| constant_time_eq(token, expected)) {
                claimed
            } else {
                let issued = tokens
                    .verify(token)
                    .await
                    .map_err(|e| format!("token store unavailable: {e}"))?;
                match issued {
                    Some(meta) => Identity {
                        subject: meta.subject,
                        role: meta.role,
                        scopes: meta.scopes,
                        device_id: None,
                    },
                    None => return Err("invalid token".into()),
                }
            }
        }
        "password" => {
            let expected = auth
                .resolve_password()
                .ok_or_else(|| "server password not configured".to_string())?;
            let Some(AuthParams::Password { password }) = &hello.auth else {
                return Err("password authentication required".into());
            };
            if !constant_time_eq(&sha256_hex(password), &sha256_hex(&expected)) {
                return Err("invalid password".into());
            }
            claimed
        }
        other => return Err(format!("unknown auth mode: {other}")),
    };

    match &hello.device {
        Some(device) => {
            verify_device_signature(device, hello, nonce)?;
            identity.device_id = Some(device.id.clone());
        }
        None if auth.require_device => return Err("device proof required".into()),
        None => {}
    }
    Ok(identity)
}

/// Canonical payload a device signs.
pub fn device_signature_payload(device: &DeviceParams, hello: &HelloParams) -> String {
    [
        device.id.as_str(),
        hello.client.id.as_str(),
        hello.client.mode.as_deref().unwrap_or(""),
        hello.role.as_deref().unwrap_or(""),
        hello.scopes.join(",").as_str(),
        device.signed_at.to_string().as_str(),
        hello.auth.as_ref().map(AuthParams::secret).unwrap_or(""),
        device.nonce.as_str(),
    ]
    .join("\n")
}

fn verify_device_signature(device: &DeviceParams, hello: &HelloParams, nonce: &str) -> Result<(), String> {
    if !constant_time_eq(&device.nonce, nonce) {
        return Err("device nonce does not match challenge".into());
    }
    let key_bytes = STANDARD
        .decode(device.public_key.as_bytes())
        .map_err(|_| "invalid device public key encoding")?;
    let sig_bytes = STANDARD
        .decode(device.signature.as_bytes())
        .map_err(|_| "invalid device signature encoding")?;
    let key = ed25519_dalek::VerifyingKey::from_bytes(
        key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| "invalid device public key length")?,
    )
    .map_err(|_| "invalid device public key")?;
    let signature = ed25519_dalek::Signature::from_bytes(
        sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| "invalid device signature length")?,
    );
    let payload = device_signature_payload(device, hello);
    key.verify_strict(payload.as_bytes(), &signature)
        .map_err(|_| "device signature verification failed".to_string())
}

/// Parse one post-handshake frame. `Ok(None)` for frames that are not requests.
fn read_request(
    text: &str,
    max_payload: usize,
    seen_ids: &mut HashSet<String>,
) -> Result<Option<RequestFrame>, Fault> {
    if text.len() > max_payload {
        return Err(Fault::new(None, error_codes::PAYLOAD_TOO_LARGE, "payload too large"));
    }
    let frame: GatewayFrame = serde_json::from_str(text).map_err(|e| {
        debug!(%e, "Malformed frame");
        Fault::new(None, error_codes::INVALID_REQUEST, "malformed frame")
    })?;
    match frame {
        GatewayFrame::Request(req) => {
            if !seen_ids.insert(req.id.clone()) {
                return Err(Fault::new(
                    Some(req.id),
                    error_codes::DUPLICATE_REQUEST_ID,
                    "duplicate request id",
                ));
            }
            Ok(Some(req))
        }
        _ => Ok(None),
    }
}
