//! CSMS-initiated commands
//!
//! Calls the CSMS sends to a connected charge point. Failures never
//! propagate past [`issue`]: a rejected status, a CALLERROR or a dropped
//! connection is logged and the session carries on.

use std::fmt;
use std::str::FromStr;

use tracing::{error, info};

use super::messages::{Action, OcppError};
use super::session::SessionHandle;
use super::types::*;

/// Commands that can be issued by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundCommand {
    ClearCache,
    GetBaseReport,
}

impl OutboundCommand {
    pub fn action(self) -> Action {
        match self {
            OutboundCommand::ClearCache => Action::ClearCache,
            OutboundCommand::GetBaseReport => Action::GetBaseReport,
        }
    }
}

impl fmt::Display for OutboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action())
    }
}

impl FromStr for OutboundCommand {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ClearCache" => Ok(OutboundCommand::ClearCache),
            "GetBaseReport" => Ok(OutboundCommand::GetBaseReport),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Ask the charge point to clear its authorization cache
pub async fn send_clear_cache(handle: &SessionHandle) -> Result<ClearCacheStatus, OcppError> {
    let result = handle.call(Action::ClearCache, ClearCacheRequest {}).await?;
    let response: ClearCacheResponse = result.parse_payload()?;

    match response.status {
        ClearCacheStatus::Accepted => info!("ClearCache on {} successful", handle.identity()),
        ClearCacheStatus::Rejected => info!("ClearCache on {} failed", handle.identity()),
    }
    Ok(response.status)
}

/// Request a configuration inventory report
pub async fn send_get_base_report(handle: &SessionHandle) -> Result<GenericDeviceModelStatus, OcppError> {
    let request = GetBaseReportRequest {
        request_id: handle.next_request_id(),
        report_base: ReportBase::ConfigurationInventory,
        custom_data: None,
    };
    info!("Sending GetBaseReport {} to {}", request.request_id, handle.identity());

    let result = handle.call(Action::GetBaseReport, request).await?;
    let response: GetBaseReportResponse = result.parse_payload()?;

    if response.status == GenericDeviceModelStatus::Accepted {
        info!("GetBaseReport on {} successful", handle.identity());
    } else {
        info!("GetBaseReport on {} failed: {:?}", handle.identity(), response.status);
    }
    Ok(response.status)
}

/// Issue a command, logging rather than returning any failure
///
/// Returns true when the charge point accepted the command.
pub async fn issue(handle: &SessionHandle, command: OutboundCommand) -> bool {
    let outcome = match command {
        OutboundCommand::ClearCache => send_clear_cache(handle)
            .await
            .map(|status| status == ClearCacheStatus::Accepted),
        OutboundCommand::GetBaseReport => send_get_base_report(handle)
            .await
            .map(|status| status == GenericDeviceModelStatus::Accepted),
    };

    match outcome {
        Ok(accepted) => accepted,
        Err(e) => {
            error!("{} on {} failed: {}", command, handle.identity(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::correlator::CallCorrelator;
    use crate::ocpp::messages::{CallError, CallResult, ErrorCode, OcppMessage};
    use crate::ocpp::session::ChargePointId;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Handle whose outbound calls are answered by `reply`
    fn answered_by(reply: fn(&str, &Value) -> OcppMessage) -> (SessionHandle, Arc<CallCorrelator>) {
        let (tx, mut rx) = mpsc::channel(8);
        let correlator = Arc::new(CallCorrelator::new());
        let handle = SessionHandle::new(ChargePointId::new("CP001"), tx, correlator.clone());

        let peer = correlator.clone();
        tokio::spawn(async move {
            while let Some(OcppMessage::Call(call)) = rx.recv().await {
                match reply(&call.message_id, &call.payload) {
                    OcppMessage::CallResult(result) => peer.resolve_result(result),
                    OcppMessage::CallError(error) => peer.resolve_error(error),
                    OcppMessage::Call(_) => false,
                };
            }
        });
        (handle, correlator)
    }

    #[test]
    fn test_command_names() {
        assert_eq!("GetBaseReport".parse::<OutboundCommand>().unwrap(), OutboundCommand::GetBaseReport);
        assert_eq!("ClearCache".parse::<OutboundCommand>().unwrap(), OutboundCommand::ClearCache);
        assert!("Reset".parse::<OutboundCommand>().is_err());
        assert_eq!(OutboundCommand::GetBaseReport.to_string(), "GetBaseReport");
    }

    #[tokio::test]
    async fn test_clear_cache_accepted() {
        let (handle, correlator) = answered_by(|id, _| {
            OcppMessage::CallResult(CallResult::new(id.to_string(), json!({"status": "Accepted"})).unwrap())
        });

        assert_eq!(send_clear_cache(&handle).await.unwrap(), ClearCacheStatus::Accepted);
        assert!(issue(&handle, OutboundCommand::ClearCache).await);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_get_base_report_requests_configuration_inventory() {
        let (handle, _) = answered_by(|id, payload| {
            let status = if payload["reportBase"] == "ConfigurationInventory" && payload["requestId"].is_i64() {
                "Accepted"
            } else {
                "Rejected"
            };
            OcppMessage::CallResult(CallResult::new(id.to_string(), json!({"status": status})).unwrap())
        });

        assert_eq!(
            send_get_base_report(&handle).await.unwrap(),
            GenericDeviceModelStatus::Accepted
        );
    }

    #[tokio::test]
    async fn test_rejection_is_not_an_error() {
        let (handle, _) = answered_by(|id, _| {
            OcppMessage::CallResult(CallResult::new(id.to_string(), json!({"status": "NotSupported"})).unwrap())
        });

        assert!(!issue(&handle, OutboundCommand::GetBaseReport).await);
    }

    #[tokio::test]
    async fn test_call_error_is_logged_not_raised() {
        let (handle, _) = answered_by(|id, _| {
            OcppMessage::CallError(CallError::new(id.to_string(), ErrorCode::NotImplemented, "no"))
        });

        assert!(matches!(
            send_clear_cache(&handle).await,
            Err(OcppError::RemoteError { code: ErrorCode::NotImplemented, .. })
        ));
        assert!(!issue(&handle, OutboundCommand::ClearCache).await);
    }
}
