//! Outbound call correlation
//!
//! Tracks the calls the CSMS has sent to a charge point and resolves them
//! when the matching CALLRESULT or CALLERROR arrives. At most one call is
//! in flight per connection: callers take the in-flight permit before
//! registering and hold it until the call resolves.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore, SemaphorePermit};
use tracing::debug;

use super::messages::{Call, CallError, CallResult, OcppError};

/// Outbound call awaiting its response
#[derive(Debug)]
pub struct PendingCall {
    pub action: String,
    pub submitted_at: DateTime<Utc>,
    response_tx: oneshot::Sender<Result<CallResult, OcppError>>,
}

impl PendingCall {
    /// Time since the call was registered
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.submitted_at
    }
}

#[derive(Debug, Default)]
struct PendingTable {
    calls: HashMap<String, PendingCall>,
    closed: bool,
}

/// Per-connection correlator for outbound calls
#[derive(Debug)]
pub struct CallCorrelator {
    in_flight: Semaphore,
    pending: Mutex<PendingTable>,
}

impl Default for CallCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl CallCorrelator {
    pub fn new() -> Self {
        Self {
            in_flight: Semaphore::new(1),
            pending: Mutex::new(PendingTable::default()),
        }
    }

    /// Wait for the in-flight slot
    ///
    /// Fails with `ConnectionClosed` once the connection is gone.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, OcppError> {
        self.in_flight
            .acquire()
            .await
            .map_err(|_| OcppError::ConnectionClosed)
    }

    /// Track a call and return the slot its response will arrive on
    pub fn register(
        &self,
        call: &Call,
    ) -> Result<oneshot::Receiver<Result<CallResult, OcppError>>, OcppError> {
        let mut table = self.pending.lock();

        if table.closed {
            return Err(OcppError::ConnectionClosed);
        }
        if table.calls.contains_key(&call.message_id) {
            return Err(OcppError::DuplicateMessageId(call.message_id.clone()));
        }

        let (response_tx, response_rx) = oneshot::channel();
        table.calls.insert(
            call.message_id.clone(),
            PendingCall {
                action: call.action.clone(),
                submitted_at: Utc::now(),
                response_tx,
            },
        );

        Ok(response_rx)
    }

    /// Drop a registered call without resolving it
    pub fn discard(&self, message_id: &str) -> Option<PendingCall> {
        self.pending.lock().calls.remove(message_id)
    }

    /// Resolve the matching call with a result
    ///
    /// Returns false when no call with this id is outstanding.
    pub fn resolve_result(&self, result: CallResult) -> bool {
        let Some(call) = self.discard(&result.message_id) else {
            return false;
        };
        debug!(
            "{} {} answered after {} ms",
            call.action,
            result.message_id,
            call.age().num_milliseconds()
        );
        let _ = call.response_tx.send(Ok(result));
        true
    }

    /// Resolve the matching call with the charge point's error
    pub fn resolve_error(&self, error: CallError) -> bool {
        let Some(call) = self.discard(&error.message_id) else {
            return false;
        };
        let _ = call.response_tx.send(Err(error.into()));
        true
    }

    /// Fail every outstanding call and refuse new ones
    ///
    /// Returns how many calls were failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(String, PendingCall)> = {
            let mut table = self.pending.lock();
            table.closed = true;
            table.calls.drain().collect()
        };
        self.in_flight.close();

        let count = drained.len();
        for (message_id, call) in drained {
            debug!(
                "Failing {} {} after {} ms unanswered",
                call.action,
                message_id,
                call.age().num_milliseconds()
            );
            let _ = call.response_tx.send(Err(OcppError::ConnectionClosed));
        }
        count
    }

    /// Number of calls awaiting a response
    pub fn outstanding(&self) -> usize {
        self.pending.lock().calls.len()
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::messages::{Action, ErrorCode};
    use crate::ocpp::types::ClearCacheRequest;
    use tokio_test::{assert_pending, assert_ready, task};

    fn clear_cache() -> Call {
        Call::new(Action::ClearCache, ClearCacheRequest {}).unwrap()
    }

    #[tokio::test]
    async fn test_result_resolves_once() {
        let correlator = CallCorrelator::new();
        let call = clear_cache();
        let rx = correlator.register(&call).unwrap();
        assert_eq!(correlator.outstanding(), 1);

        let result = CallResult::new(call.message_id.clone(), serde_json::json!({"status": "Accepted"})).unwrap();
        assert!(correlator.resolve_result(result.clone()));
        assert_eq!(correlator.outstanding(), 0);

        // A duplicate response finds nothing left to resolve
        assert!(!correlator.resolve_result(result));

        let resolved = rx.await.unwrap().unwrap();
        assert_eq!(resolved.message_id, call.message_id);
        assert_eq!(resolved.payload["status"], "Accepted");
    }

    #[tokio::test]
    async fn test_unmatched_result_is_ignored() {
        let correlator = CallCorrelator::new();
        let call = clear_cache();
        let mut rx = correlator.register(&call).unwrap();

        let stray = CallResult::new("not-ours".into(), serde_json::json!({})).unwrap();
        assert!(!correlator.resolve_result(stray));
        assert_eq!(correlator.outstanding(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_resolves_as_remote_error() {
        let correlator = CallCorrelator::new();
        let call = clear_cache();
        let rx = correlator.register(&call).unwrap();

        let error = CallError::new(call.message_id.clone(), ErrorCode::NotSupported, "no cache");
        assert!(correlator.resolve_error(error));

        match rx.await.unwrap() {
            Err(OcppError::RemoteError { code, .. }) => assert_eq!(code, ErrorCode::NotSupported),
            other => panic!("Expected RemoteError, got {:?}", other),
        }
    }

    #[test]
    fn test_discard_returns_pending_call() {
        let correlator = CallCorrelator::new();
        let call = clear_cache();
        let _rx = correlator.register(&call).unwrap();

        let pending = correlator.discard(&call.message_id).unwrap();
        assert_eq!(pending.action, "ClearCache");
        assert!(pending.age() >= chrono::Duration::zero());
        assert!(pending.submitted_at <= Utc::now());
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn test_duplicate_message_id_rejected() {
        let correlator = CallCorrelator::new();
        let call = clear_cache();
        let _rx = correlator.register(&call).unwrap();

        assert!(matches!(
            correlator.register(&call),
            Err(OcppError::DuplicateMessageId(_))
        ));
    }

    #[tokio::test]
    async fn test_second_call_waits_for_first() {
        let correlator = CallCorrelator::new();
        let first = correlator.acquire().await.unwrap();

        let mut second = task::spawn(correlator.acquire());
        assert_pending!(second.poll());

        drop(first);
        assert!(second.is_woken());
        assert!(assert_ready!(second.poll()).is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_on_close() {
        let correlator = CallCorrelator::new();
        let call = clear_cache();
        let rx = correlator.register(&call).unwrap();

        assert_eq!(correlator.fail_all(), 1);
        assert_eq!(correlator.outstanding(), 0);
        assert!(matches!(rx.await.unwrap(), Err(OcppError::ConnectionClosed)));

        assert!(correlator.is_closed());
        assert!(matches!(correlator.register(&clear_cache()), Err(OcppError::ConnectionClosed)));
        assert!(matches!(correlator.acquire().await, Err(OcppError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_caller() {
        let correlator = CallCorrelator::new();
        let first = correlator.acquire().await.unwrap();

        let mut second = task::spawn(correlator.acquire());
        assert_pending!(second.poll());

        correlator.fail_all();
        assert!(matches!(assert_ready!(second.poll()), Err(OcppError::ConnectionClosed)));
        drop(first);
    }
}
