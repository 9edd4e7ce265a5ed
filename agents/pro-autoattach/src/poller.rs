//! License Poller
//!
//! Drives the long-poll loop against one cloud instance. The poller owns
//! the session's ChangeToken: it is created empty, updated from each
//! successful response and dropped with the poller.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clouds::{ChangeToken, CloudInstance};
use crate::config::AutoAttachConfig;
use crate::error::AttachError;

/// Result of one poll iteration or of a whole polling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    /// The license set was read; `true` when it holds this release's Pro license
    Entitled(bool),
    /// Transient failure or budget exhausted; try again later
    RetryAfterDelay,
    /// Permanent rejection; do not auto-attach again this boot
    StopPolling,
}

impl PollOutcome {
    pub fn is_entitled(&self) -> bool {
        matches!(self, PollOutcome::Entitled(true))
    }
}

/// Timing and budget for a polling session
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Sleep after a transient failure or a quick empty answer
    pub interval: Duration,
    /// Upper bound on license requests, the initial check included
    pub max_attempts: Option<u32>,
    /// Wall-clock bound on the session
    pub deadline: Option<Duration>,
    /// A long-poll answering faster than this did not block server-side
    pub quick_return: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&AutoAttachConfig::default())
    }
}

impl From<&AutoAttachConfig> for PollSettings {
    fn from(config: &AutoAttachConfig) -> Self {
        Self {
            interval: config.polling_interval(),
            max_attempts: config.max_poll_attempts,
            deadline: config.poll_deadline(),
            quick_return: config.quick_return(),
        }
    }
}

/// One polling session against one cloud instance
#[derive(Debug)]
pub struct LicensePoller {
    settings: PollSettings,
    change_token: ChangeToken,
    attempts: u32,
}

impl LicensePoller {
    pub fn new(settings: PollSettings) -> Self {
        Self {
            settings,
            change_token: ChangeToken::new(),
            attempts: 0,
        }
    }

    pub fn change_token(&self) -> &ChangeToken {
        &self.change_token
    }

    /// License requests issued so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Issue one license request and classify the result
    pub async fn poll_once(
        &mut self,
        instance: &dyn CloudInstance,
        wait_for_change: bool,
    ) -> PollOutcome {
        self.attempts += 1;

        match instance
            .is_pro_license_present(wait_for_change, &mut self.change_token)
            .await
        {
            Ok(present) => {
                debug!(
                    cloud = %instance.cloud_type(),
                    present,
                    wait_for_change,
                    "Pro license check"
                );
                PollOutcome::Entitled(present)
            }
            Err(AttachError::CancelLicensePolling) => {
                info!(cloud = %instance.cloud_type(), "Cancelling Pro license polling");
                PollOutcome::StopPolling
            }
            Err(AttachError::DelayLicensePolling) => {
                info!(cloud = %instance.cloud_type(), "Pro license check failed, will poll again");
                PollOutcome::RetryAfterDelay
            }
            Err(e) => {
                warn!(cloud = %instance.cloud_type(), error = %e, "Unexpected Pro license check failure");
                PollOutcome::RetryAfterDelay
            }
        }
    }

    /// Poll until entitled, rejected, cancelled or out of budget
    ///
    /// Starts with a plain (non-blocking) check, then long-polls. Cancellation
    /// and budget are checked between requests only. Cancellation and budget
    /// exhaustion both return `RetryAfterDelay`.
    pub async fn run(
        &mut self,
        instance: &dyn CloudInstance,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let deadline = self.settings.deadline.map(|d| Instant::now() + d);

        if let Some(reason) = self.should_stop(cancel, deadline) {
            info!(cloud = %instance.cloud_type(), reason, "Not polling for a Pro license");
            return PollOutcome::RetryAfterDelay;
        }

        match self.poll_once(instance, false).await {
            outcome @ (PollOutcome::Entitled(true) | PollOutcome::StopPolling) => return outcome,
            PollOutcome::RetryAfterDelay => {
                if !self.pause(cancel, deadline).await {
                    return PollOutcome::RetryAfterDelay;
                }
            }
            PollOutcome::Entitled(false) => {}
        }

        loop {
            if let Some(reason) = self.should_stop(cancel, deadline) {
                info!(
                    cloud = %instance.cloud_type(),
                    attempts = self.attempts,
                    reason,
                    "Stopping Pro license polling"
                );
                return PollOutcome::RetryAfterDelay;
            }

            let started = Instant::now();
            let outcome = self.poll_once(instance, true).await;

            match outcome {
                PollOutcome::Entitled(true) | PollOutcome::StopPolling => return outcome,
                PollOutcome::RetryAfterDelay => {
                    if !self.pause(cancel, deadline).await {
                        return PollOutcome::RetryAfterDelay;
                    }
                }
                PollOutcome::Entitled(false) => {
                    if started.elapsed() < self.settings.quick_return {
                        debug!(
                            interval_secs = self.settings.interval.as_secs(),
                            "Long-poll returned quickly without a Pro license, waiting before polling again"
                        );
                        if !self.pause(cancel, deadline).await {
                            return PollOutcome::RetryAfterDelay;
                        }
                    }
                }
            }
        }
    }

    fn should_stop(&self, cancel: &CancellationToken, deadline: Option<Instant>) -> Option<&'static str> {
        if cancel.is_cancelled() {
            return Some("cancelled");
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Some("deadline reached");
        }
        if self.budget_spent() {
            return Some("attempt budget exhausted");
        }
        None
    }

    fn budget_spent(&self) -> bool {
        self.settings
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
    }

    /// Sleep the polling interval; `false` if cancelled, out of time or out of attempts
    async fn pause(&self, cancel: &CancellationToken, deadline: Option<Instant>) -> bool {
        if self.budget_spent() {
            return false;
        }

        let mut wait = self.settings.interval;
        if let Some(deadline) = deadline {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            wait = wait.min(left);
        }

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clouds::test_support::{FakeInstance, Step};

    fn settings() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(1),
            max_attempts: Some(10),
            deadline: None,
            quick_return: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_poll_once_classification() {
        let instance = FakeInstance::gcp(vec![
            Step::Present(true, Some("abc")),
            Step::Present(false, Some("def")),
            Step::Delay,
            Step::Stop,
        ]);
        let mut poller = LicensePoller::new(settings());

        assert_eq!(poller.poll_once(&instance, true).await, PollOutcome::Entitled(true));
        assert_eq!(poller.change_token().get(), Some("abc"));
        assert_eq!(poller.poll_once(&instance, true).await, PollOutcome::Entitled(false));
        assert_eq!(poller.change_token().get(), Some("def"));
        assert_eq!(poller.poll_once(&instance, true).await, PollOutcome::RetryAfterDelay);
        assert_eq!(poller.change_token().get(), Some("def"));
        assert_eq!(poller.poll_once(&instance, true).await, PollOutcome::StopPolling);
        assert_eq!(poller.attempts(), 4);
    }

    #[tokio::test]
    async fn test_initial_check_entitled() {
        let instance = FakeInstance::gcp(vec![Step::Present(true, Some("e1"))]);
        let mut poller = LicensePoller::new(settings());

        let outcome = poller.run(&instance, &CancellationToken::new()).await;

        assert_eq!(outcome, PollOutcome::Entitled(true));
        assert_eq!(instance.calls(), vec![(false, None)]);
    }

    #[tokio::test]
    async fn test_long_poll_carries_change_token() {
        let instance = FakeInstance::gcp(vec![
            Step::Present(false, Some("e1")),
            Step::Present(false, Some("e2")),
            Step::Present(true, Some("e3")),
        ]);
        let mut poller = LicensePoller::new(settings());

        let outcome = poller.run(&instance, &CancellationToken::new()).await;

        assert_eq!(outcome, PollOutcome::Entitled(true));
        assert_eq!(
            instance.calls(),
            vec![
                (false, None),
                (true, Some("e1".to_string())),
                (true, Some("e2".to_string())),
            ]
        );
        assert_eq!(poller.change_token().get(), Some("e3"));
    }

    #[tokio::test]
    async fn test_stop_polling_returns_immediately() {
        let instance = FakeInstance::gcp(vec![
            Step::Present(false, Some("e1")),
            Step::Stop,
            Step::Present(true, None),
        ]);
        let mut poller = LicensePoller::new(settings());

        let outcome = poller.run(&instance, &CancellationToken::new()).await;

        assert_eq!(outcome, PollOutcome::StopPolling);
        assert_eq!(instance.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_on_initial_check() {
        let instance = FakeInstance::gcp(vec![Step::Stop]);
        let mut poller = LicensePoller::new(settings());

        assert_eq!(
            poller.run(&instance, &CancellationToken::new()).await,
            PollOutcome::StopPolling
        );
        assert_eq!(instance.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_delay_then_entitled() {
        let instance = FakeInstance::gcp(vec![
            Step::Delay,
            Step::Delay,
            Step::Present(true, None),
        ]);
        let mut poller = LicensePoller::new(settings());

        let outcome = poller.run(&instance, &CancellationToken::new()).await;

        assert_eq!(outcome, PollOutcome::Entitled(true));
        // No token was ever obtained, so no long-poll request carried one
        assert!(instance.calls().iter().all(|(_, token)| token.is_none()));
        assert_eq!(instance.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhausted() {
        let instance = FakeInstance::gcp(Vec::new());
        let mut poller = LicensePoller::new(PollSettings {
            max_attempts: Some(3),
            ..settings()
        });

        let outcome = poller.run(&instance, &CancellationToken::new()).await;

        assert_eq!(outcome, PollOutcome::RetryAfterDelay);
        assert_eq!(instance.calls().len(), 3);
        assert_eq!(poller.attempts(), 3);
    }

    #[tokio::test]
    async fn test_spent_budget_skips_final_pause() {
        let instance = FakeInstance::gcp(vec![Step::Delay]);
        let mut poller = LicensePoller::new(PollSettings {
            interval: Duration::from_secs(3600),
            max_attempts: Some(1),
            ..settings()
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(30),
            poller.run(&instance, &CancellationToken::new()),
        )
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::RetryAfterDelay);
        assert_eq!(instance.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_spent_budget_after_long_poll_delay() {
        let instance = FakeInstance::gcp(vec![Step::Present(false, Some("e1")), Step::Delay]);
        let mut poller = LicensePoller::new(PollSettings {
            interval: Duration::from_secs(3600),
            max_attempts: Some(2),
            ..settings()
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(30),
            poller.run(&instance, &CancellationToken::new()),
        )
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::RetryAfterDelay);
        assert_eq!(instance.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_budget_sends_nothing() {
        let instance = FakeInstance::gcp(vec![Step::Present(true, None)]);
        let mut poller = LicensePoller::new(PollSettings {
            max_attempts: Some(0),
            ..settings()
        });

        let outcome = poller.run(&instance, &CancellationToken::new()).await;

        assert_eq!(outcome, PollOutcome::RetryAfterDelay);
        assert!(instance.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let instance = FakeInstance::gcp(vec![Step::Present(true, None)]);
        let mut poller = LicensePoller::new(settings());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(poller.run(&instance, &cancel).await, PollOutcome::RetryAfterDelay);
        assert!(instance.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pause() {
        let instance = FakeInstance::gcp(vec![Step::Delay]);
        let mut poller = LicensePoller::new(PollSettings {
            interval: Duration::from_secs(3600),
            ..settings()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = poller.run(&instance, &cancel).await;

        assert_eq!(outcome, PollOutcome::RetryAfterDelay);
        assert_eq!(instance.calls().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_deadline_bounds_session() {
        let instance = FakeInstance::gcp(Vec::new());
        let mut poller = LicensePoller::new(PollSettings {
            interval: Duration::from_millis(20),
            max_attempts: None,
            deadline: Some(Duration::from_millis(100)),
            quick_return: Duration::from_secs(10),
        });

        let outcome = poller.run(&instance, &CancellationToken::new()).await;

        assert_eq!(outcome, PollOutcome::RetryAfterDelay);
        let calls = instance.calls().len();
        assert!(calls >= 2, "expected several polls, got {}", calls);
        assert!(calls <= 7, "expected the deadline to stop polling, got {}", calls);
    }

    #[tokio::test]
    async fn test_quick_return_waits_interval() {
        let instance = FakeInstance::gcp(Vec::new());
        let mut poller = LicensePoller::new(PollSettings {
            interval: Duration::from_millis(50),
            max_attempts: Some(3),
            deadline: None,
            quick_return: Duration::from_secs(10),
        });

        let started = std::time::Instant::now();
        let outcome = poller.run(&instance, &CancellationToken::new()).await;

        assert_eq!(outcome, PollOutcome::RetryAfterDelay);
        assert_eq!(instance.calls().len(), 3);
        // two long-polls answered instantly, each followed by one interval
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_settings_from_config() {
        let config = AutoAttachConfig {
            polling_interval_secs: 60,
            max_poll_attempts: Some(5),
            poll_deadline_secs: Some(3600),
            ..Default::default()
        };
        let settings = PollSettings::from(&config);
        assert_eq!(settings.interval, Duration::from_secs(60));
        assert_eq!(settings.max_attempts, Some(5));
        assert_eq!(settings.deadline, Some(Duration::from_secs(3600)));
        assert_eq!(settings.quick_return, Duration::from_secs(10));
    }
}
