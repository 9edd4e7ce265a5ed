//! Auto-Attach Orchestrator
//!
//! Picks the cloud this machine runs on, fetches its identity document and,
//! when the release supports it, watches for a Pro license. The resulting
//! report is what the contract workflow consumes.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clouds::gcp::licenses_from_identity;
use crate::clouds::{CloudIdentity, CloudInstance, CloudType};
use crate::config::AutoAttachConfig;
use crate::error::AttachError;
use crate::poller::{LicensePoller, PollOutcome, PollSettings};

/// Returns true once the machine holds a subscription
pub type AttachedCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Outcome of one auto-attach session
#[derive(Debug, Clone)]
pub struct AutoAttachReport {
    pub cloud_type: CloudType,
    pub identity: CloudIdentity,
    /// `None` when license polling was not attempted
    pub license: Option<PollOutcome>,
}

/// Printable view of a report; the identity token is reduced to its length
#[derive(Debug, Serialize)]
pub struct ReportSummary {
    pub cloud: CloudType,
    pub identity_token_bytes: usize,
    pub identity_licenses: Vec<String>,
    pub license: Option<PollOutcome>,
}

impl AutoAttachReport {
    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            cloud: self.cloud_type,
            identity_token_bytes: self.identity.token.len(),
            identity_licenses: licenses_from_identity(&self.identity),
            license: self.license,
        }
    }
}

pub struct AutoAttach {
    instances: Vec<Box<dyn CloudInstance>>,
    config: AutoAttachConfig,
    skip_viability: bool,
    single_check: bool,
    attached_check: Option<(AttachedCheck, Duration)>,
}

impl AutoAttach {
    /// Candidates are tried in the given order
    pub fn new(instances: Vec<Box<dyn CloudInstance>>, config: AutoAttachConfig) -> Self {
        Self {
            instances,
            config,
            skip_viability: false,
            single_check: false,
            attached_check: None,
        }
    }

    /// Use the first instance without checking local markers
    pub fn skip_viability_check(mut self) -> Self {
        self.skip_viability = true;
        self
    }

    /// One plain license check instead of the long-poll loop
    pub fn single_check(mut self) -> Self {
        self.single_check = true;
        self
    }

    /// Stop polling as soon as `check` reports the machine attached
    pub fn with_attached_check(mut self, check: AttachedCheck, every: Duration) -> Self {
        self.attached_check = Some((check, every));
        self
    }

    fn is_attached(&self) -> bool {
        self.config.attached || self.attached_check.as_ref().is_some_and(|(check, _)| check())
    }

    /// First candidate whose local markers identify this machine
    pub fn select_instance(&self) -> Result<&dyn CloudInstance, AttachError> {
        if self.skip_viability {
            return self
                .instances
                .first()
                .map(|instance| instance.as_ref())
                .ok_or(AttachError::NoViableCloud);
        }

        for instance in &self.instances {
            let viable = instance.is_viable();
            debug!(cloud = %instance.cloud_type(), viable, "Checking cloud viability");
            if viable {
                return Ok(instance.as_ref());
            }
        }
        Err(AttachError::NoViableCloud)
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<AutoAttachReport, AttachError> {
        if self.config.disable_auto_attach {
            info!("Auto-attach disabled by configuration");
            return Err(AttachError::AutoAttachDisabled);
        }
        if self.is_attached() {
            info!("Machine is already attached, skipping auto-attach");
            return Err(AttachError::AlreadyAttached);
        }

        let instance = self.select_instance()?;
        info!(cloud = %instance.cloud_type(), "Detected cloud provider");

        let identity = instance.identity_document().await.map_err(|e| {
            warn!(cloud = %instance.cloud_type(), error = %e, code = e.code(), "Failed to fetch identity document");
            e
        })?;

        let license = if !self.config.poll_for_pro_license {
            info!("Pro license polling disabled by configuration");
            None
        } else if !instance.should_poll_for_license() {
            None
        } else {
            Some(self.poll(instance, cancel).await)
        };

        info!(cloud = %instance.cloud_type(), license = ?license, "Auto-attach session finished");

        Ok(AutoAttachReport {
            cloud_type: instance.cloud_type(),
            identity,
            license,
        })
    }

    async fn poll(&self, instance: &dyn CloudInstance, cancel: &CancellationToken) -> PollOutcome {
        let session = cancel.child_token();
        let watcher = self.attached_check.as_ref().map(|(check, every)| {
            let check = Arc::clone(check);
            let every = *every;
            let token = session.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(every) => {
                            if check() {
                                info!("Machine attached, stopping Pro license polling");
                                token.cancel();
                                break;
                            }
                        }
                    }
                }
            })
        });

        let mut poller = LicensePoller::new(PollSettings::from(&self.config));
        let outcome = if self.single_check {
            poller.poll_once(instance, false).await
        } else {
            poller.run(instance, &session).await
        };

        session.cancel();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                warn!(error = %e, "Attached-state watcher failed");
            }
        }

        debug!(
            attempts = poller.attempts(),
            etag = ?poller.change_token().get(),
            outcome = ?outcome,
            "Pro license polling finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clouds::test_support::{FakeInstance, Step};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fast_config() -> AutoAttachConfig {
        AutoAttachConfig {
            polling_interval_secs: 1,
            quick_return_secs: 0,
            max_poll_attempts: Some(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_first_viable() {
        let attach = AutoAttach::new(
            vec![
                Box::new(FakeInstance::new(CloudType::Aws, Vec::new()).not_viable()),
                Box::new(FakeInstance::new(CloudType::Azure, Vec::new())),
                Box::new(FakeInstance::gcp(Vec::new())),
            ],
            fast_config(),
        );

        assert_eq!(attach.select_instance().unwrap().cloud_type(), CloudType::Azure);
    }

    #[test]
    fn test_no_viable_cloud() {
        let attach = AutoAttach::new(
            vec![Box::new(FakeInstance::gcp(Vec::new()).not_viable())],
            fast_config(),
        );
        assert!(matches!(attach.select_instance(), Err(AttachError::NoViableCloud)));

        let forced = AutoAttach::new(
            vec![Box::new(FakeInstance::gcp(Vec::new()).not_viable())],
            fast_config(),
        )
        .skip_viability_check();
        assert_eq!(forced.select_instance().unwrap().cloud_type(), CloudType::Gcp);
    }

    #[tokio::test]
    async fn test_gcp_session_entitled() {
        let attach = AutoAttach::new(
            vec![Box::new(FakeInstance::gcp(vec![
                Step::Present(false, Some("e1")),
                Step::Present(true, Some("e2")),
            ]))],
            fast_config(),
        );

        let report = attach.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.cloud_type, CloudType::Gcp);
        assert_eq!(report.license, Some(PollOutcome::Entitled(true)));
        assert_eq!(report.summary().identity_token_bytes, report.identity.token.len());
    }

    #[tokio::test]
    async fn test_aws_skips_polling() {
        let attach = AutoAttach::new(
            vec![Box::new(FakeInstance::new(CloudType::Aws, Vec::new()))],
            fast_config(),
        );

        let report = attach.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.cloud_type, CloudType::Aws);
        assert_eq!(report.license, None);
    }

    #[tokio::test]
    async fn test_polling_disabled() {
        let instance = FakeInstance::gcp(vec![Step::Present(true, None)]);
        let config = AutoAttachConfig {
            poll_for_pro_license: false,
            ..fast_config()
        };
        let attach = AutoAttach::new(vec![Box::new(instance)], config);

        let report = attach.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.license, None);
    }

    #[tokio::test]
    async fn test_disabled_and_attached_short_circuit() {
        let disabled = AutoAttach::new(
            vec![Box::new(FakeInstance::gcp(Vec::new()))],
            AutoAttachConfig {
                disable_auto_attach: true,
                ..fast_config()
            },
        );
        assert!(matches!(
            disabled.run(&CancellationToken::new()).await,
            Err(AttachError::AutoAttachDisabled)
        ));

        let attached = AutoAttach::new(
            vec![Box::new(FakeInstance::gcp(Vec::new()))],
            AutoAttachConfig {
                attached: true,
                ..fast_config()
            },
        );
        assert!(matches!(
            attached.run(&CancellationToken::new()).await,
            Err(AttachError::AlreadyAttached)
        ));
    }

    #[tokio::test]
    async fn test_identity_failure_propagates() {
        let attach = AutoAttach::new(
            vec![Box::new(FakeInstance::gcp(Vec::new()).failing_identity())],
            fast_config(),
        );

        let err = attach.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AttachError::Metadata { code: 403, .. }));
    }

    #[tokio::test]
    async fn test_single_check() {
        let attach = AutoAttach::new(
            vec![Box::new(FakeInstance::gcp(vec![
                Step::Present(false, Some("e1")),
                Step::Present(true, None),
            ]))],
            fast_config(),
        )
        .single_check();

        let report = attach.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.license, Some(PollOutcome::Entitled(false)));
    }

    #[tokio::test]
    async fn test_attached_during_polling_stops_session() {
        let attached = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&attached);
        let config = AutoAttachConfig {
            polling_interval_secs: 3600,
            quick_return_secs: 10,
            max_poll_attempts: None,
            ..Default::default()
        };
        let attach = AutoAttach::new(vec![Box::new(FakeInstance::gcp(Vec::new()))], config)
            .with_attached_check(
                Arc::new(move || flag.load(Ordering::SeqCst)),
                Duration::from_millis(10),
            );

        let trigger = Arc::clone(&attached);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.store(true, Ordering::SeqCst);
        });

        let report = tokio::time::timeout(
            Duration::from_secs(30),
            attach.run(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(report.license, Some(PollOutcome::RetryAfterDelay));
    }

    #[tokio::test]
    async fn test_summary_redacts_token() {
        let attach = AutoAttach::new(
            vec![Box::new(FakeInstance::new(CloudType::Azure, Vec::new()))],
            fast_config(),
        );
        let report = attach.run(&CancellationToken::new()).await.unwrap();

        let rendered = serde_json::to_string(&report.summary()).unwrap();
        assert!(!rendered.contains(&report.identity.token));
        assert!(rendered.contains(r#""cloud":"azure""#));
    }
}
