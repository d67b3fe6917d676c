//! OCPP 2.0.1 protocol implementation
//!
//! This module provides the protocol layer of the simulated CSMS:
//! - `types`: OCPP message types and data structures
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `correlator`: outbound call tracking by message id
//! - `handlers`: action dispatch table for charge point requests
//! - `session`: per-connection read loop and outbound call handle
//! - `commands`: CSMS-initiated requests

pub mod types;
pub mod messages;
pub mod correlator;
pub mod handlers;
pub mod session;
pub mod commands;

pub use types::*;
pub use messages::*;
pub use correlator::{CallCorrelator, PendingCall};
pub use handlers::{HandlerError, HandlerTable};
pub use session::{ChargePointId, ChargePointSession, SessionHandle, SessionState};
pub use commands::OutboundCommand;
