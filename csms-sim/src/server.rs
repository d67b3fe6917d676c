//! Connection acceptor
//!
//! Listens for charge point connections, negotiates the OCPP subprotocol
//! during the WebSocket handshake and runs one session per accepted
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, error, info, warn};

use crate::config::CsmsConfig;
use crate::driver::{run_schedule, CommandSchedule};
use crate::ocpp::{ChargePointId, ChargePointSession, HandlerTable, OcppError};
use crate::registry::{SessionId, SessionRegistry, SharedSessionRegistry};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("OCPP error: {0}")]
    Ocpp(#[from] OcppError),
}

/// Outcome of subprotocol negotiation for one handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Client sent no `Sec-WebSocket-Protocol` header
    Missing,
    /// None of the requested subprotocols is supported
    Mismatch { requested: Vec<String> },
    /// Subprotocol fixed for the connection's lifetime
    Accepted(String),
}

impl Negotiation {
    pub fn negotiate(supported: &[String], requested: Option<Vec<String>>) -> Self {
        match requested {
            None => Negotiation::Missing,
            Some(requested) => match select_subprotocol(supported, &requested) {
                Some(protocol) => Negotiation::Accepted(protocol),
                None => Negotiation::Mismatch { requested },
            },
        }
    }
}

/// Every subprotocol the client asked for, in its order
///
/// Reads all `Sec-WebSocket-Protocol` header values and splits each on
/// commas. Returns None when the header is absent or lists nothing.
pub fn requested_subprotocols(request: &Request) -> Option<Vec<String>> {
    let requested: Vec<String> = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|protocol| !protocol.is_empty())
        .map(str::to_string)
        .collect();

    if requested.is_empty() {
        None
    } else {
        Some(requested)
    }
}

/// Pick the common subprotocol with the lowest combined preference
///
/// Preference is the client index plus the server index; ties go to the
/// protocol the client listed first.
pub fn select_subprotocol(supported: &[String], requested: &[String]) -> Option<String> {
    requested
        .iter()
        .enumerate()
        .filter_map(|(client_rank, protocol)| {
            supported
                .iter()
                .position(|p| p == protocol)
                .map(|server_rank| (client_rank + server_rank, client_rank, protocol))
        })
        .min_by_key(|&(rank, client_rank, _)| (rank, client_rank))
        .map(|(_, _, protocol)| protocol.clone())
}

/// What the handshake callback learned about a connection
#[derive(Debug)]
struct Handshake {
    path: String,
    negotiation: Negotiation,
}

/// Close a connection whose subprotocol was not agreed
async fn reject(mut ws: WebSocketStream<TcpStream>, peer: SocketAddr) {
    if let Err(e) = ws.close(None).await {
        debug!("Close to {} not delivered: {}", peer, e);
    }
}

/// Per-connection view of the server's shared state
#[derive(Clone)]
struct Acceptor {
    subprotocols: Arc<Vec<String>>,
    schedule: Option<CommandSchedule>,
    registry: SharedSessionRegistry,
    handlers: Arc<HandlerTable>,
}

impl Acceptor {
    async fn handle_connection(self, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        let handshake: Arc<Mutex<Option<Handshake>>> = Arc::new(Mutex::new(None));

        let supported = self.subprotocols.clone();
        let slot = handshake.clone();
        let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let negotiation = Negotiation::negotiate(&supported, requested_subprotocols(request));
            if let Negotiation::Accepted(protocol) = &negotiation {
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
            }

            *slot.lock() = Some(Handshake {
                path: request.uri().path().to_string(),
                negotiation,
            });
            Ok(response)
        };

        let ws = accept_hdr_async(stream, callback).await?;
        let Some(Handshake { path, negotiation }) = handshake.lock().take() else {
            return Ok(());
        };

        let subprotocol = match negotiation {
            Negotiation::Accepted(protocol) => protocol,
            Negotiation::Missing => {
                info!("Client {} hasn't requested any subprotocol. Closing connection", peer);
                reject(ws, peer).await;
                return Ok(());
            }
            Negotiation::Mismatch { requested } => {
                warn!(
                    "Protocols mismatched | Expected subprotocols: {:?}, but client supports {:?} | Closing connection",
                    self.subprotocols, requested
                );
                reject(ws, peer).await;
                return Ok(());
            }
        };

        let identity = ChargePointId::from_path(&path);
        let session = ChargePointSession::new(identity.clone(), subprotocol.clone(), ws, self.handlers.clone());
        let handle = session.handle();

        let session_id = SessionId::new();
        let connected = self.registry.add(session_id, identity.clone(), subprotocol.as_str());
        info!(
            "ChargePoint {} connected from {} using {} ({} connected)",
            identity, peer, subprotocol, connected
        );

        let driver = self
            .schedule
            .map(|schedule| tokio::spawn(run_schedule(handle.clone(), schedule)));

        if let Err(e) = session.run().await {
            error!("Session {} ended with error: {}", identity, e);
        }

        let connected_for = self
            .registry
            .get(session_id)
            .map(|session| session.connected_for().num_seconds())
            .unwrap_or_default();
        let remaining = self.registry.remove(session_id);
        handle.mark_closed();
        info!(
            "ChargePoint {} disconnected after {} s. Remaining connections: {}",
            identity, connected_for, remaining
        );

        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                error!("Command driver for {} failed: {}", identity, e);
            }
        }
        Ok(())
    }
}

/// Simulated CSMS WebSocket server
pub struct CsmsServer {
    listener: TcpListener,
    acceptor: Acceptor,
}

impl CsmsServer {
    /// Bind the listener and build the handler table
    pub async fn bind(config: CsmsConfig) -> Result<Self, ServerError> {
        let handlers = HandlerTable::standard()?;
        let listener = TcpListener::bind(config.bind_address()).await?;

        Ok(Self {
            listener,
            acceptor: Acceptor {
                subprotocols: Arc::new(config.subprotocols),
                schedule: config.schedule,
                registry: SessionRegistry::shared(),
                handlers: Arc::new(handlers),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> SharedSessionRegistry {
        self.acceptor.registry.clone()
    }

    /// Accept connections until the task is cancelled
    pub async fn run(self) -> Result<(), ServerError> {
        info!("Server Started listening to new connections on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("New connection from {}", peer);
                    let acceptor = self.acceptor.clone();

                    tokio::spawn(async move {
                        if let Err(e) = acceptor.handle_connection(stream, peer).await {
                            error!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
