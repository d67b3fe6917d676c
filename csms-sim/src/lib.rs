//! # CSMS Simulator
//!
//! Simulated OCPP 2.0.1 Charging Station Management System.
//!
//! Charge points connect over WebSocket at `ws://host:port/<identity>`
//! with subprotocol `ocpp2.0` or `ocpp2.0.1`. Each connection becomes a
//! session that answers charge point requests and can carry CSMS-initiated
//! calls on the same stream.
//!
//! ## Architecture
//!
//! ```text
//! Charge point simulators
//!       │ WebSocket JSON-RPC
//!       ▼
//! ┌─────────────────────────────────────┐
//! │  CsmsServer (acceptor)              │
//! │   subprotocol negotiation           │
//! │   SessionRegistry (membership)      │
//! └─────────────┬───────────────────────┘
//!               │ one task per connection
//!               ▼
//! ┌─────────────────────────────────────┐
//! │  ChargePointSession                 │
//! │  ┌────────────┐  ┌───────────────┐  │
//! │  │ Handler    │  │ CallCorrelator│◄─┼── command driver
//! │  │ Table      │  │ (outbound)    │  │
//! │  └────────────┘  └───────────────┘  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Handled actions
//!
//! | Direction | Action | Response |
//! |-----------|--------|----------|
//! | CP → CSMS | BootNotification | Accepted, interval 60 s |
//! | CP → CSMS | Heartbeat | current UTC time |
//! | CP → CSMS | StatusNotification | empty |
//! | CP → CSMS | Authorize | Accepted |
//! | CP → CSMS | TransactionEvent | depends on eventType |
//! | CP → CSMS | MeterValues | empty |
//! | CP → CSMS | GetBaseReport | Accepted |
//! | CSMS → CP | ClearCache | logged |
//! | CSMS → CP | GetBaseReport | logged |
//!
//! ## Usage
//!
//! ```no_run
//! use csms_sim::{CsmsConfig, CsmsServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = CsmsServer::bind(CsmsConfig::new("127.0.0.1", 9000)).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod driver;
pub mod ocpp;
pub mod registry;
pub mod server;

pub use config::CsmsConfig;
pub use driver::{run_schedule, CommandSchedule};
pub use ocpp::{ChargePointId, ChargePointSession, HandlerTable, OcppError, OutboundCommand, SessionHandle};
pub use registry::{SessionId, SessionRegistry, SharedSessionRegistry};
pub use server::{CsmsServer, Negotiation, ServerError};
