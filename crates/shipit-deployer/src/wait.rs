//! Waiting for a submitted deployment to go live.

use shipit_core::deployer::{
    Deployer, DeploymentEvent, DeploymentHandle, DeploymentState, DeploymentStatus,
    EnvironmentHealth,
};
use shipit_core::pipeline::{DEFAULT_DEPLOY_TIMEOUT, DEFAULT_POLL_INTERVAL};
use shipit_core::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Consecutive failed polls tolerated before the wait gives up.
pub const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 3;

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_errors: u32,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DEPLOY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_errors: MAX_CONSECUTIVE_POLL_ERRORS,
        }
    }
}

/// Something observed while waiting.
#[derive(Debug, Clone)]
pub enum WaitUpdate {
    State(DeploymentState),
    Event(DeploymentEvent),
}

struct PollErrors {
    consecutive: u32,
    limit: u32,
}

impl PollErrors {
    fn record(&mut self, error: Error) -> Result<()> {
        if matches!(error, Error::DeploymentFailed(_) | Error::CredentialExchange(_)) {
            return Err(error);
        }
        self.consecutive += 1;
        warn!(error = %error, attempt = self.consecutive, "Deployment status poll failed");
        if self.consecutive > self.limit {
            return Err(Error::DeploymentFailed(format!(
                "lost contact with the platform after {} failed polls: {}",
                self.consecutive, error
            )));
        }
        Ok(())
    }
}

/// Poll until the environment runs `handle.version_label`.
///
/// Succeeds once the environment is ready on the new label. Fails on an
/// error-level platform event, a terminated environment, a return to ready
/// on another label after an update was seen, or when `options.timeout`
/// elapses, or as soon as the scoped credentials stop working.
pub async fn wait_for_deployment(
    deployer: &dyn Deployer,
    handle: &DeploymentHandle,
    options: &WaitOptions,
    mut on_update: impl FnMut(WaitUpdate) + Send,
) -> Result<DeploymentState> {
    let deadline = Instant::now() + options.timeout;
    let mut since = handle.submitted_at;
    let mut seen_update = false;
    let mut errors = PollErrors {
        consecutive: 0,
        limit: options.max_poll_errors,
    };

    info!(
        environment = %handle.environment,
        version_label = %handle.version_label,
        timeout_secs = options.timeout.as_secs(),
        "Waiting for deployment"
    );

    loop {
        match deployer.events(handle, since).await {
            Ok(events) => {
                for event in events {
                    since = since.max(event.timestamp);
                    debug!(severity = ?event.severity, message = %event.message, "Platform event");
                    let failed = event.severity.is_failure();
                    let message = event.message.clone();
                    on_update(WaitUpdate::Event(event));
                    if failed {
                        return Err(Error::DeploymentFailed(format!(
                            "{}: {}",
                            handle.environment, message
                        )));
                    }
                }
            }
            Err(e) => errors.record(e)?,
        }

        match deployer.state(handle).await {
            Ok(state) => {
                errors.consecutive = 0;
                on_update(WaitUpdate::State(state.clone()));
                match &state.status {
                    DeploymentStatus::Terminated => {
                        return Err(Error::DeploymentFailed(format!(
                            "environment {} terminated",
                            handle.environment
                        )));
                    }
                    DeploymentStatus::InProgress { detail } => {
                        debug!(status = %detail, "Deployment in progress");
                        seen_update = true;
                    }
                    DeploymentStatus::Ready if state.is_live(&handle.version_label) => {
                        if state.health != EnvironmentHealth::Green {
                            warn!(
                                environment = %handle.environment,
                                health = ?state.health,
                                "Deployment live but environment is not healthy"
                            );
                        }
                        info!(
                            environment = %handle.environment,
                            version_label = %handle.version_label,
                            "Deployment live"
                        );
                        return Ok(state);
                    }
                    DeploymentStatus::Ready if seen_update => {
                        return Err(Error::DeploymentFailed(format!(
                            "environment {} settled on version {} instead of {}",
                            handle.environment,
                            state.active_version.as_deref().unwrap_or("<none>"),
                            handle.version_label
                        )));
                    }
                    DeploymentStatus::Ready => {}
                }
            }
            Err(e) => errors.record(e)?,
        }

        if Instant::now() + options.poll_interval > deadline {
            return Err(Error::Timeout(format!(
                "{} did not report version {} within {}s",
                handle.environment,
                handle.version_label,
                options.timeout.as_secs()
            )));
        }
        tokio::time::sleep(options.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use shipit_core::deployer::{DeploymentSpec, EventSeverity};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted poll results.
    struct ScriptedDeployer {
        states: Mutex<VecDeque<Result<DeploymentState>>>,
        events: Mutex<VecDeque<Vec<DeploymentEvent>>>,
    }

    impl ScriptedDeployer {
        fn new(states: Vec<Result<DeploymentState>>) -> Self {
            Self {
                states: Mutex::new(states.into()),
                events: Mutex::new(VecDeque::new()),
            }
        }

        fn with_events(self, events: Vec<Vec<DeploymentEvent>>) -> Self {
            *self.events.lock().unwrap() = events.into();
            self
        }
    }

    #[async_trait]
    impl Deployer for ScriptedDeployer {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn deploy(&self, _spec: &DeploymentSpec, _bundle: Bytes) -> Result<DeploymentHandle> {
            unreachable!()
        }

        async fn state(&self, _handle: &DeploymentHandle) -> Result<DeploymentState> {
            self.states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(state(DeploymentStatus::InProgress { detail: "Updating".to_string() }, "old")))
        }

        async fn events(
            &self,
            _handle: &DeploymentHandle,
            _since: DateTime<Utc>,
        ) -> Result<Vec<DeploymentEvent>> {
            Ok(self.events.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn state(status: DeploymentStatus, label: &str) -> DeploymentState {
        DeploymentState {
            status,
            active_version: Some(label.to_string()),
            health: EnvironmentHealth::Green,
            last_updated: Utc::now(),
        }
    }

    fn updating(label: &str) -> Result<DeploymentState> {
        Ok(state(
            DeploymentStatus::InProgress {
                detail: "Updating".to_string(),
            },
            label,
        ))
    }

    fn ready(label: &str) -> Result<DeploymentState> {
        Ok(state(DeploymentStatus::Ready, label))
    }

    fn handle() -> DeploymentHandle {
        DeploymentHandle {
            environment_id: "e-icsgecu3wf".to_string(),
            deployer_name: "scripted".to_string(),
            application: "LiveKitPOC".to_string(),
            environment: "LiveKitPOC-dev".to_string(),
            version_label: "abc123".to_string(),
            reused_version: false,
            submitted_at: Utc::now(),
        }
    }

    fn fast() -> WaitOptions {
        WaitOptions {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            max_poll_errors: MAX_CONSECUTIVE_POLL_ERRORS,
        }
    }

    #[tokio::test]
    async fn test_succeeds_when_new_version_is_ready() {
        let deployer = ScriptedDeployer::new(vec![updating("old"), updating("abc123"), ready("abc123")]);
        let mut updates = Vec::new();

        let state = wait_for_deployment(&deployer, &handle(), &fast(), |u| updates.push(u))
            .await
            .unwrap();

        assert!(state.is_live("abc123"));
        assert_eq!(updates.len(), 3);
    }

    #[tokio::test]
    async fn test_ready_on_old_version_before_update_keeps_waiting() {
        let deployer = ScriptedDeployer::new(vec![ready("old"), updating("abc123"), ready("abc123")]);
        let state = wait_for_deployment(&deployer, &handle(), &fast(), |_| {}).await.unwrap();
        assert!(state.is_live("abc123"));
    }

    #[tokio::test]
    async fn test_rollback_to_previous_version_fails() {
        let deployer = ScriptedDeployer::new(vec![updating("abc123"), ready("old")]);
        let result = wait_for_deployment(&deployer, &handle(), &fast(), |_| {}).await;
        assert!(matches!(result, Err(Error::DeploymentFailed(_))));
    }

    #[tokio::test]
    async fn test_error_event_fails() {
        let deployer = ScriptedDeployer::new(vec![updating("abc123")]).with_events(vec![vec![
            DeploymentEvent {
                timestamp: Utc::now(),
                severity: EventSeverity::Error,
                message: "Failed to deploy application.".to_string(),
            },
        ]]);
        match wait_for_deployment(&deployer, &handle(), &fast(), |_| {}).await {
            Err(Error::DeploymentFailed(message)) => {
                assert!(message.contains("Failed to deploy application"))
            }
            other => panic!("unexpected {:?}", other.map(|s| s.status)),
        }
    }

    #[tokio::test]
    async fn test_terminated_environment_fails() {
        let deployer = ScriptedDeployer::new(vec![Ok(state(DeploymentStatus::Terminated, "abc123"))]);
        let result = wait_for_deployment(&deployer, &handle(), &fast(), |_| {}).await;
        assert!(matches!(result, Err(Error::DeploymentFailed(_))));
    }

    #[tokio::test]
    async fn test_times_out() {
        let deployer = ScriptedDeployer::new(vec![]);
        let options = WaitOptions {
            timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(10),
            ..fast()
        };
        let result = wait_for_deployment(&deployer, &handle(), &options, |_| {}).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_transient_poll_errors_are_tolerated() {
        let deployer = ScriptedDeployer::new(vec![
            Err(Error::Internal("connection reset".to_string())),
            Err(Error::Internal("connection reset".to_string())),
            updating("abc123"),
            ready("abc123"),
        ]);
        assert!(wait_for_deployment(&deployer, &handle(), &fast(), |_| {}).await.is_ok());
    }

    #[tokio::test]
    async fn test_too_many_poll_errors_fail() {
        let deployer = ScriptedDeployer::new(
            (0..=MAX_CONSECUTIVE_POLL_ERRORS)
                .map(|_| Err(Error::Internal("connection reset".to_string())))
                .collect(),
        );
        let result = wait_for_deployment(&deployer, &handle(), &fast(), |_| {}).await;
        assert!(matches!(result, Err(Error::DeploymentFailed(_))));
    }

    #[tokio::test]
    async fn test_expired_credentials_stop_the_wait() {
        let deployer = ScriptedDeployer::new(vec![
            updating("abc123"),
            Err(Error::CredentialExchange(
                "DescribeEnvironments: credentials expired".to_string(),
            )),
            ready("abc123"),
        ]);
        let result = wait_for_deployment(&deployer, &handle(), &fast(), |_| {}).await;
        assert!(matches!(result, Err(Error::CredentialExchange(_))));
        assert_eq!(deployer.states.lock().unwrap().len(), 1);
    }
}
