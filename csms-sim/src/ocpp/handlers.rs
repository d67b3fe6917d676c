//! Inbound action dispatch
//!
//! Maps the action name of a CALL from a charge point to the handler that
//! answers it. The table is built once at startup, checked against
//! [`INBOUND_ACTIONS`], and shared read-only by every session.

use std::collections::HashMap;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::messages::{Action, Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage};
use super::session::ChargePointId;
use super::types::*;

/// Heartbeat interval suggested in BootNotification responses (seconds)
pub const HEARTBEAT_INTERVAL: i32 = 60;

/// Placeholder total cost reported for an Updated transaction
pub const PLACEHOLDER_TOTAL_COST: f64 = 10.0;

/// Actions a charge point may call on this CSMS
pub const INBOUND_ACTIONS: &[Action] = &[
    Action::BootNotification,
    Action::Heartbeat,
    Action::StatusNotification,
    Action::Authorize,
    Action::TransactionEvent,
    Action::MeterValues,
    Action::GetBaseReport,
];

/// Why a handler could not produce a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
}

impl HandlerError {
    fn from_payload(err: serde_json::Error) -> Self {
        let description = err.to_string();
        let code = if description.starts_with("missing field") {
            ErrorCode::OccurrenceConstraintViolation
        } else if description.starts_with("invalid type") {
            ErrorCode::TypeConstraintViolation
        } else if description.starts_with("unknown variant") || description.starts_with("invalid value") {
            ErrorCode::PropertyConstraintViolation
        } else {
            ErrorCode::FormatViolation
        };
        Self { code, description }
    }
}

type Handler = Box<dyn Fn(&ChargePointId, Value) -> Result<Value, HandlerError> + Send + Sync>;

/// Wrap a typed handler so it decodes its request and encodes its response
fn typed<Req, Resp>(handler: fn(&ChargePointId, Req) -> Resp) -> Handler
where
    Req: DeserializeOwned + 'static,
    Resp: Serialize + 'static,
{
    Box::new(move |identity: &ChargePointId, payload: Value| {
        // Braced structs would otherwise also decode from a JSON array
        if !payload.is_object() {
            return Err(HandlerError {
                code: ErrorCode::FormatViolation,
                description: "Payload must be a JSON object".to_string(),
            });
        }
        let request: Req = serde_json::from_value(payload).map_err(HandlerError::from_payload)?;
        serde_json::to_value(handler(identity, request)).map_err(|e| HandlerError {
            code: ErrorCode::InternalError,
            description: e.to_string(),
        })
    })
}

/// Read-only action -> handler table
pub struct HandlerTable {
    handlers: HashMap<Action, Handler>,
}

impl HandlerTable {
    /// Empty table; see [`HandlerTable::standard`] for the CSMS handlers
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Table with every inbound handler, validated for coverage
    pub fn standard() -> Result<Self, OcppError> {
        let table = Self::new()
            .with(Action::BootNotification, typed(on_boot_notification))
            .with(Action::Heartbeat, typed(on_heartbeat))
            .with(Action::StatusNotification, typed(on_status_notification))
            .with(Action::Authorize, typed(on_authorize))
            .with(Action::TransactionEvent, typed(on_transaction_event))
            .with(Action::MeterValues, typed(on_meter_values))
            .with(Action::GetBaseReport, typed(on_get_base_report));

        table.validate(INBOUND_ACTIONS)?;
        Ok(table)
    }

    fn with(mut self, action: Action, handler: Handler) -> Self {
        self.handlers.insert(action, handler);
        self
    }

    /// Check that every listed action has a handler
    pub fn validate(&self, actions: &[Action]) -> Result<(), OcppError> {
        match actions.iter().find(|a| !self.handlers.contains_key(a)) {
            Some(action) => Err(OcppError::MissingHandler(*action)),
            None => Ok(()),
        }
    }

    pub fn handles(&self, action: Action) -> bool {
        self.handlers.contains_key(&action)
    }

    /// Answer a CALL with a CALLRESULT or CALLERROR frame
    pub fn dispatch(&self, identity: &ChargePointId, call: Call) -> OcppMessage {
        let Call {
            message_id,
            action,
            payload,
        } = call;

        let handler = match action.parse::<Action>() {
            Ok(known) => self.handlers.get(&known),
            Err(_) => {
                warn!("{} called unknown action {}", identity, action);
                return OcppMessage::CallError(CallError::new(
                    message_id,
                    ErrorCode::NotImplemented,
                    format!("Unknown action {}", action),
                ));
            }
        };

        let Some(handler) = handler else {
            warn!("{} called {} which this CSMS does not serve", identity, action);
            return OcppMessage::CallError(CallError::new(
                message_id,
                ErrorCode::NotSupported,
                format!("{} is not supported by the CSMS", action),
            ));
        };

        match handler(identity, payload) {
            Ok(response) => OcppMessage::CallResult(CallResult {
                message_id,
                payload: response,
            }),
            Err(e) => {
                warn!("Rejecting {} from {}: {:?} {}", action, identity, e.code, e.description);
                OcppMessage::CallError(CallError::new(message_id, e.code, e.description))
            }
        }
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

fn on_boot_notification(identity: &ChargePointId, req: BootNotificationRequest) -> BootNotificationResponse {
    info!(
        "Received BootNotification from {} ({} {}, reason {:?})",
        identity, req.charging_station.vendor_name, req.charging_station.model, req.reason
    );
    BootNotificationResponse {
        current_time: Utc::now(),
        interval: HEARTBEAT_INTERVAL,
        status: RegistrationStatus::Accepted,
        status_info: None,
    }
}

fn on_heartbeat(identity: &ChargePointId, _req: HeartbeatRequest) -> HeartbeatResponse {
    info!("Received Heartbeat from {}", identity);
    HeartbeatResponse {
        current_time: Utc::now(),
    }
}

fn on_status_notification(identity: &ChargePointId, req: StatusNotificationRequest) -> StatusNotificationResponse {
    info!(
        "Received StatusNotification from {}: EVSE {} connector {} {:?}",
        identity, req.evse_id, req.connector_id, req.connector_status
    );
    StatusNotificationResponse {}
}

fn on_authorize(identity: &ChargePointId, req: AuthorizeRequest) -> AuthorizeResponse {
    info!("Received Authorize from {} for token {}", identity, req.id_token.id_token);
    AuthorizeResponse {
        id_token_info: IdTokenInfo::accepted(),
    }
}

fn on_transaction_event(identity: &ChargePointId, req: TransactionEventRequest) -> TransactionEventResponse {
    info!(
        "Received TransactionEvent {} from {} (transaction {}, seqNo {})",
        req.event_type, identity, req.transaction_info.transaction_id, req.seq_no
    );
    transaction_event_response(req.event_type)
}

/// Response shape for each transaction stage
pub fn transaction_event_response(event_type: TransactionEventType) -> TransactionEventResponse {
    match event_type {
        TransactionEventType::Started => TransactionEventResponse {
            id_token_info: Some(IdTokenInfo::accepted()),
            ..Default::default()
        },
        TransactionEventType::Updated => TransactionEventResponse {
            total_cost: Some(PLACEHOLDER_TOTAL_COST),
            ..Default::default()
        },
        TransactionEventType::Ended => TransactionEventResponse::default(),
    }
}

fn on_meter_values(identity: &ChargePointId, req: MeterValuesRequest) -> MeterValuesResponse {
    let samples: usize = req.meter_value.iter().map(|m| m.sampled_value.len()).sum();
    info!(
        "Received MeterValues from {}: EVSE {}, {} sample(s)",
        identity, req.evse_id, samples
    );
    MeterValuesResponse {}
}

// Stub: accepts any report request without producing a report.
fn on_get_base_report(identity: &ChargePointId, req: GetBaseReportRequest) -> GetBaseReportResponse {
    info!(
        "Received GetBaseReport from {} (request {}, {:?})",
        identity, req.request_id, req.report_base
    );
    GetBaseReportResponse {
        status: GenericDeviceModelStatus::Accepted,
        status_info: None,
    }
}
