//! One setup session against one driver.

use super::{FlowError, SessionSnapshot, SetupSessionState};
use crate::config::PacingConfig;
use crate::remote::{DeviceApi, SetupInputs};
use std::sync::Arc;
use std::time::Duration;

/// Build step inputs from `(field, value)` pairs.
pub fn setup_inputs(pairs: &[(&str, &str)]) -> SetupInputs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Typed wrapper around the remote setup-flow calls for one driver.
///
/// The session state lives on the remote. [`SetupSession::end`] consumes
/// the handle, so a session is terminated at most once; coordinators call
/// it on every exit path.
pub struct SetupSession {
    api: Arc<dyn DeviceApi>,
    driver_id: String,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl SetupSession {
    pub fn new(api: Arc<dyn DeviceApi>, driver_id: impl Into<String>, pacing: &PacingConfig) -> Self {
        let driver_id = driver_id.into();
        assert!(!driver_id.is_empty(), "driver_id must not be empty");
        assert!(pacing.session_poll_attempts > 0, "poll attempts must be positive");

        Self {
            api,
            driver_id,
            poll_attempts: pacing.session_poll_attempts,
            poll_interval: pacing.session_poll_interval,
        }
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    /// Start the session. `reconfigure` selects the "choose an action" flow.
    pub async fn begin(&self, reconfigure: bool) -> Result<SessionSnapshot, FlowError> {
        tracing::debug!(driver_id = %self.driver_id, reconfigure, "setup begin");
        let response = self.api.start_setup(&self.driver_id, reconfigure).await?;
        Ok(SessionSnapshot::from_response(&response))
    }

    /// Fetch the current page. No side effects on the remote.
    pub async fn read(&self) -> Result<SessionSnapshot, FlowError> {
        let response = self.api.get_setup(&self.driver_id).await?;
        let snapshot = SessionSnapshot::from_response(&response);
        tracing::trace!(
            driver_id = %self.driver_id,
            state = %snapshot.state,
            fields = snapshot.fields.len(),
            "setup read"
        );
        Ok(snapshot)
    }

    /// Submit one step's answers.
    pub async fn advance(&self, inputs: &SetupInputs) -> Result<SessionSnapshot, FlowError> {
        tracing::debug!(
            driver_id = %self.driver_id,
            fields = ?inputs.keys().collect::<Vec<_>>(),
            "setup advance"
        );
        let response = self.api.send_setup_input(&self.driver_id, inputs).await?;
        Ok(SessionSnapshot::from_response(&response))
    }

    /// Read until the session leaves a transitional state, at most
    /// `poll_attempts` times. Returns the last snapshot either way.
    pub async fn read_settled(&self) -> Result<SessionSnapshot, FlowError> {
        let mut snapshot = self.read().await?;
        let mut attempt = 1;
        while !snapshot.state.is_settled() && attempt < self.poll_attempts {
            tokio::time::sleep(self.poll_interval).await;
            snapshot = self.read().await?;
            attempt += 1;
        }
        Ok(snapshot)
    }

    /// Read until the session reaches `expected`.
    ///
    /// A settled state other than `expected` fails immediately; a session
    /// still transitional after `poll_attempts` reads fails with its last state.
    pub async fn wait_for_state(
        &self,
        expected: SetupSessionState,
    ) -> Result<SessionSnapshot, FlowError> {
        let mut attempt = 0;
        loop {
            let snapshot = self.read().await?;
            attempt += 1;

            if snapshot.state == expected {
                return Ok(snapshot);
            }
            if snapshot.state.is_settled() || attempt >= self.poll_attempts {
                tracing::warn!(
                    driver_id = %self.driver_id,
                    expected = %expected,
                    actual = %snapshot.state,
                    attempt,
                    "setup session in unexpected state"
                );
                return Err(FlowError::UnexpectedState {
                    driver_id: self.driver_id.clone(),
                    expected,
                    actual: snapshot.state,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Terminate the session. Failures are logged and reported as `false`,
    /// never propagated.
    pub async fn end(self) -> bool {
        match self.api.delete_setup(&self.driver_id).await {
            Ok(()) => {
                tracing::debug!(driver_id = %self.driver_id, "setup ended");
                true
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(driver_id = %self.driver_id, "no setup session to end");
                true
            }
            Err(e) => {
                tracing::warn!(driver_id = %self.driver_id, error = %e, "failed to end setup session");
                false
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{page, SimCall, SimDevice, SimFault, SimOp, SetupRequest};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn session(device: &Arc<SimDevice>) -> SetupSession {
        SetupSession::new(device.clone(), "psn", &PacingConfig::immediate())
    }

    #[tokio::test]
    async fn test_begin_read_advance_end() {
        let device = Arc::new(SimDevice::new());
        device.add_driver("psn", "1.0.0");
        device.set_responder("psn", |_req: &SetupRequest| page("WAIT_USER_ACTION", json!([])));

        let s = session(&device);
        assert_eq!(s.begin(true).await.unwrap().state, SetupSessionState::WaitUserAction);
        assert_eq!(s.read().await.unwrap().state, SetupSessionState::WaitUserAction);
        s.advance(&setup_inputs(&[("a", "b")])).await.unwrap();
        assert!(s.end().await);

        assert_eq!(device.setup_ends("psn"), 1);
        assert!(device.open_sessions().is_empty());
        assert_eq!(device.inputs_sent("psn"), vec![setup_inputs(&[("a", "b")])]);
    }

    #[tokio::test]
    async fn test_end_failure_is_swallowed() {
        let device = Arc::new(SimDevice::new());
        device.add_driver("psn", "1.0.0");
        device.inject_fault(SimOp::DeleteSetup, SimFault::transport());

        let s = session(&device);
        assert!(!s.end().await);
        assert!(device
            .calls()
            .iter()
            .any(|c| matches!(c, SimCall::DeleteSetup { .. })));
    }

    #[tokio::test]
    async fn test_end_without_begin_is_not_fatal() {
        let device = Arc::new(SimDevice::new());
        device.add_driver("psn", "1.0.0");
        assert!(session(&device).end().await);
    }

    #[tokio::test]
    async fn test_wait_for_state_polls_through_processing() {
        let device = Arc::new(SimDevice::new());
        device.add_driver("psn", "1.0.0");
        let reads = Arc::new(AtomicU32::new(0));
        let counter = reads.clone();
        device.set_read_responder("psn", move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                page("PROCESSING", json!([]))
            } else {
                page("WAIT_USER_ACTION", json!([]))
            }
        });

        let snapshot = session(&device)
            .wait_for_state(SetupSessionState::WaitUserAction)
            .await
            .unwrap();
        assert_eq!(snapshot.state, SetupSessionState::WaitUserAction);
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_state_is_bounded() {
        let device = Arc::new(SimDevice::new());
        device.add_driver("psn", "1.0.0");
        device.set_read_responder("psn", || page("PROCESSING", json!([])));

        let result = session(&device)
            .wait_for_state(SetupSessionState::WaitUserAction)
            .await;
        assert!(matches!(
            result,
            Err(FlowError::UnexpectedState { actual: SetupSessionState::Processing, .. })
        ));
        let reads = device
            .calls()
            .iter()
            .filter(|c| matches!(c, SimCall::GetSetup { .. }))
            .count();
        assert_eq!(reads as u32, PacingConfig::immediate().session_poll_attempts);
    }

    #[tokio::test]
    async fn test_wait_for_state_fails_fast_on_other_state() {
        let device = Arc::new(SimDevice::new());
        device.add_driver("psn", "1.0.0");
        device.set_read_responder("psn", || page("SETUP_COMPLETE", json!([])));

        let result = session(&device)
            .wait_for_state(SetupSessionState::WaitUserAction)
            .await;
        assert!(matches!(
            result,
            Err(FlowError::UnexpectedState { actual: SetupSessionState::SetupComplete, .. })
        ));
        assert_eq!(device.calls().len(), 1);
    }
}
