//! Charge point session
//!
//! One session per accepted WebSocket connection. The session owns the
//! stream: a writer task drains the outgoing queue into the sink while the
//! read loop classifies inbound frames:
//! - CALL from the charge point -> dispatched through the handler table
//! - CALLRESULT / CALLERROR -> resolves the matching outbound call
//!
//! Outbound calls go through a [`SessionHandle`], which can be cloned into
//! other tasks such as the periodic command driver.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::correlator::CallCorrelator;
use super::handlers::HandlerTable;
use super::messages::*;

/// Capacity of the per-session outgoing frame queue
const OUTGOING_QUEUE: usize = 64;

/// How long to wait for the peer after answering its close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of a charge point, taken from its connection path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChargePointId(String);

impl ChargePointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `/CP001/` -> `CP001`. An empty path yields an empty identity.
    pub fn from_path(path: &str) -> Self {
        Self(path.trim_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChargePointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reading and answering frames
    Open,
    /// Stream ended, pending calls failed, teardown in progress
    Closing,
    /// Removed from the registry
    Closed,
}

/// Cloneable handle for issuing calls on a session
#[derive(Clone)]
pub struct SessionHandle {
    identity: ChargePointId,
    outgoing_tx: mpsc::Sender<OcppMessage>,
    correlator: Arc<CallCorrelator>,
    state: Arc<watch::Sender<SessionState>>,
    request_ids: Arc<AtomicI32>,
}

impl SessionHandle {
    pub(crate) fn new(
        identity: ChargePointId,
        outgoing_tx: mpsc::Sender<OcppMessage>,
        correlator: Arc<CallCorrelator>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Open);
        Self {
            identity,
            outgoing_tx,
            correlator,
            state: Arc::new(state),
            request_ids: Arc::new(AtomicI32::new(1)),
        }
    }

    pub fn identity(&self) -> &ChargePointId {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Resolves once the session has left [`SessionState::Open`]
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state != SessionState::Open).await;
    }

    /// Number of outbound calls awaiting a response
    pub fn outstanding(&self) -> usize {
        self.correlator.outstanding()
    }

    /// Fresh request id for report requests on this session
    pub fn next_request_id(&self) -> i32 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a call to the charge point and wait for its response
    ///
    /// Waits for any earlier call on this session to resolve first. There is
    /// no timeout: the call stays pending until the charge point answers or
    /// the connection closes.
    pub async fn call(&self, action: Action, payload: impl Serialize) -> Result<CallResult, OcppError> {
        let _permit = self.correlator.acquire().await?;

        let call = Call::new(action, payload)?;
        let message_id = call.message_id.clone();
        let response_rx = self.correlator.register(&call)?;

        debug!("Calling {} on {} ({})", action, self.identity, message_id);
        if self.outgoing_tx.send(OcppMessage::Call(call)).await.is_err() {
            self.correlator.discard(&message_id);
            return Err(OcppError::ConnectionClosed);
        }

        response_rx.await.map_err(|_| OcppError::ConnectionClosed)?
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Fail every outstanding call, then leave Open
    ///
    /// Pending callers see `ConnectionClosed` before any observer of
    /// [`SessionHandle::closed`] is woken.
    pub(crate) fn begin_close(&self) -> usize {
        let failed = self.correlator.fail_all();
        self.set_state(SessionState::Closing);
        failed
    }

    pub(crate) fn mark_closed(&self) {
        self.set_state(SessionState::Closed);
    }
}

/// Session state container for one connection
pub struct ChargePointSession<S = TcpStream> {
    handle: SessionHandle,
    subprotocol: String,
    stream: WebSocketStream<S>,
    outgoing_rx: mpsc::Receiver<OcppMessage>,
    handlers: Arc<HandlerTable>,
}

impl<S> ChargePointSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        identity: ChargePointId,
        subprotocol: impl Into<String>,
        stream: WebSocketStream<S>,
        handlers: Arc<HandlerTable>,
    ) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let handle = SessionHandle::new(identity, outgoing_tx, Arc::new(CallCorrelator::new()));

        Self {
            handle,
            subprotocol: subprotocol.into(),
            stream,
            outgoing_rx,
            handlers,
        }
    }

    pub fn identity(&self) -> &ChargePointId {
        self.handle.identity()
    }

    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Run until the connection closes
    ///
    /// On return the session is [`SessionState::Closing`] and every pending
    /// outbound call has failed with `ConnectionClosed`.
    pub async fn run(self) -> Result<(), OcppError> {
        let Self {
            handle,
            stream,
            mut outgoing_rx,
            handlers,
            ..
        } = self;
        let identity = handle.identity().clone();
        let (mut ws_tx, mut ws_rx) = stream.split();

        let writer_identity = identity.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let bytes = match msg.to_bytes() {
                    Ok(b) => b,
                    Err(e) => {
                        error!("Failed to serialize message for {}: {}", writer_identity, e);
                        continue;
                    }
                };

                let text = String::from_utf8_lossy(&bytes).into_owned();
                debug!("Sending to {}: {}", writer_identity, text);

                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    error!("Failed to send WebSocket message to {}: {}", writer_identity, e);
                    break;
                }
            }
        });

        let outcome = loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => {
                    debug!("Received from {}: {}", identity, text);

                    if let Some(reply) = handle_frame(&identity, &handlers, &handle.correlator, text.as_bytes()) {
                        if handle.outgoing_tx.send(reply).await.is_err() {
                            break Err(OcppError::ConnectionClosed);
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    warn!("Ignoring {} byte binary frame from {}", data.len(), identity);
                }
                Some(Ok(Message::Close(_))) => {
                    info!("ChargePoint {} closed connection", identity);
                    // The close reply is only written by a later read
                    let drained = tokio::time::timeout(CLOSE_TIMEOUT, async {
                        while let Some(Ok(_)) = ws_rx.next().await {}
                    })
                    .await;
                    if drained.is_err() {
                        debug!("ChargePoint {} did not finish the closing handshake", identity);
                    }
                    break Ok(());
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite
                }
                Some(Err(e)) => {
                    error!("WebSocket error on {}: {}", identity, e);
                    break Err(e.into());
                }
                None => {
                    info!("WebSocket stream from {} ended", identity);
                    break Ok(());
                }
            }
        };

        let failed = handle.begin_close();
        if failed > 0 {
            warn!("{} pending call(s) to {} failed: connection closed", failed, identity);
        }

        writer.abort();
        outcome
    }
}

/// Classify one inbound text frame, returning the reply to send (if any)
fn handle_frame(
    identity: &ChargePointId,
    handlers: &HandlerTable,
    correlator: &CallCorrelator,
    bytes: &[u8],
) -> Option<OcppMessage> {
    match OcppMessage::parse(bytes) {
        Ok(OcppMessage::Call(call)) => Some(handlers.dispatch(identity, call)),
        Ok(OcppMessage::CallResult(result)) => {
            let message_id = result.message_id.clone();
            if !correlator.resolve_result(result) {
                warn!("Discarding CallResult {} from {}: no pending call", message_id, identity);
            }
            None
        }
        Ok(OcppMessage::CallError(error)) => {
            let message_id = error.message_id.clone();
            let code = error.error_code;
            if !correlator.resolve_error(error) {
                warn!("Discarding CallError {} ({:?}) from {}: no pending call", message_id, code, identity);
            }
            None
        }
        Err(e) => {
            warn!("Failed to parse OCPP message from {}: {}", identity, e);
            OcppMessage::call_id_hint(bytes).map(|message_id| {
                OcppMessage::CallError(CallError::new(message_id, ErrorCode::RpcFrameworkError, e.to_string()))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::types::{ClearCacheRequest, ClearCacheResponse, ClearCacheStatus};
    use serde_json::json;

    fn test_handle() -> (SessionHandle, mpsc::Receiver<OcppMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let handle = SessionHandle::new(ChargePointId::new("CP001"), tx, Arc::new(CallCorrelator::new()));
        (handle, rx)
    }

    #[test]
    fn test_identity_from_path() {
        assert_eq!(ChargePointId::from_path("/CP001").as_str(), "CP001");
        assert_eq!(ChargePointId::from_path("//CP001/").as_str(), "CP001");
        assert_eq!(ChargePointId::from_path("/site/CP001").as_str(), "site/CP001");
        assert_eq!(ChargePointId::from_path("/").as_str(), "");
    }

    #[tokio::test]
    async fn test_call_resolved_by_matching_result() {
        let (handle, mut rx) = test_handle();
        let table = HandlerTable::standard().unwrap();
        let correlator = handle.correlator.clone();
        let identity = handle.identity().clone();

        let peer = tokio::spawn(async move {
            let Some(OcppMessage::Call(call)) = rx.recv().await else {
                panic!("Expected outbound call");
            };
            assert_eq!(call.action, "ClearCache");

            let stray = format!(r#"[3, "{}-stale", {{"status": "Rejected"}}]"#, call.message_id);
            assert!(handle_frame(&identity, &table, &correlator, stray.as_bytes()).is_none());
            assert_eq!(correlator.outstanding(), 1);

            let reply = format!(r#"[3, "{}", {{"status": "Accepted"}}]"#, call.message_id);
            assert!(handle_frame(&identity, &table, &correlator, reply.as_bytes()).is_none());
        });

        let result = handle.call(Action::ClearCache, ClearCacheRequest {}).await.unwrap();
        let response: ClearCacheResponse = result.parse_payload().unwrap();
        assert_eq!(response.status, ClearCacheStatus::Accepted);
        assert_eq!(handle.outstanding(), 0);
        peer.await.unwrap();
    }

    #[test]
    fn test_inbound_call_is_answered() {
        let (handle, _rx) = test_handle();
        let table = HandlerTable::standard().unwrap();

        let reply = handle_frame(
            handle.identity(),
            &table,
            &handle.correlator,
            br#"[2, "hb-1", "Heartbeat", {}]"#,
        );
        match reply {
            Some(OcppMessage::CallResult(result)) => {
                assert_eq!(result.message_id, "hb-1");
                assert!(result.payload.get("currentTime").is_some());
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[test]
    fn test_broken_call_gets_rpc_error() {
        let (handle, _rx) = test_handle();
        let table = HandlerTable::standard().unwrap();

        let reply = handle_frame(handle.identity(), &table, &handle.correlator, br#"[2, "x-1", 5, {}]"#);
        match reply {
            Some(OcppMessage::CallError(error)) => {
                assert_eq!(error.message_id, "x-1");
                assert_eq!(error.error_code, ErrorCode::RpcFrameworkError);
            }
            other => panic!("Expected CallError, got {:?}", other),
        }

        assert!(handle_frame(handle.identity(), &table, &handle.correlator, b"garbage").is_none());
    }

    #[tokio::test]
    async fn test_close_fails_pending_call() {
        let (handle, mut rx) = test_handle();
        let caller = handle.clone();
        let pending = tokio::spawn(async move { caller.call(Action::ClearCache, json!({})).await });

        // Wait until the call is on the wire, then drop the connection
        assert!(matches!(rx.recv().await, Some(OcppMessage::Call(_))));
        assert_eq!(handle.begin_close(), 1);
        assert_eq!(handle.state(), SessionState::Closing);

        assert!(matches!(pending.await.unwrap(), Err(OcppError::ConnectionClosed)));
        handle.closed().await;
        assert!(matches!(
            handle.call(Action::ClearCache, json!({})).await,
            Err(OcppError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_request_ids_increase() {
        let (handle, _rx) = test_handle();
        let other = handle.clone();
        assert_eq!(handle.next_request_id(), 1);
        assert_eq!(other.next_request_id(), 2);
    }
}
