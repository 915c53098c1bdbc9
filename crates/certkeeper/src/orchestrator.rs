//! One issuance run, end to end.
//!
//! inspect -> decide -> (skip) or key -> CSR -> ACME order -> install.
//! Nothing is written to the install directory before a complete chain has
//! been obtained, so a failed renewal leaves the previous files untouched.

use std::path::Path;
use std::time::Duration;

use certkeeper_config::CertConfig;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::acme::{AcmeApi, EngineSettings, IssuanceEngine};
use crate::challenge::ChallengePublisher;
use crate::error::IssueError;
use crate::inspect::{inspect, ExistingCertificate};
use crate::install::{CertificateFiles, Installer, OutputKind};
use crate::keys::{build_signing_request, ensure_key, KeyMaterial, KeyReuse};
use crate::policy::{evaluate, RenewalReason};
use crate::request::CertificateRequest;

/// Extra time granted to in-flight requests once the run ceiling has passed
const CEILING_GRACE: Duration = Duration::from_secs(2);

/// Outcome of the renewal decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub reason: RenewalReason,
    /// The installed certificate, if present, parseable and matching its key
    pub existing: Option<ExistingCertificate>,
}

/// Result of a successful run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Whether any installed file was replaced
    pub changed: bool,
    pub reason: RenewalReason,
}

/// Sequences a single run for one certificate service
#[derive(Debug, Clone)]
pub struct Orchestrator {
    request: CertificateRequest,
    installer: Installer,
    threshold_days: u32,
    force: bool,
    settings: EngineSettings,
}

impl Orchestrator {
    pub fn new(
        request: CertificateRequest,
        installer: Installer,
        threshold_days: u32,
        force: bool,
        settings: EngineSettings,
    ) -> Self {
        Self {
            request,
            installer,
            threshold_days,
            force,
            settings,
        }
    }

    pub fn from_config(config: &CertConfig) -> Result<Self, IssueError> {
        Ok(Self::new(
            CertificateRequest::from_config(config)?,
            Installer::from_config(&config.install),
            config.renewal.threshold_days,
            config.renewal.force,
            EngineSettings::from_config(&config.renewal, &config.acme.contacts),
        ))
    }

    pub fn request(&self) -> &CertificateRequest {
        &self.request
    }

    /// Decide at the current time
    pub fn decide(&self) -> Decision {
        self.decide_at(Utc::now())
    }

    /// Inspect the installed files and evaluate the renewal policy at `now`
    pub fn decide_at(&self, now: DateTime<Utc>) -> Decision {
        let service = self.request.service_name();
        let cert_path = self.installer.path_for(service, OutputKind::Certificate);
        let key_path = self.installer.path_for(service, OutputKind::Key);

        let existing = inspect(&cert_path).filter(|cert| {
            if !key_matches(&key_path, cert) {
                warn!(
                    service = %service,
                    key = %key_path.display(),
                    "Installed key does not match installed certificate, treating certificate as absent"
                );
                return false;
            }
            if !chain_matches(&self.installer, service) {
                warn!(
                    service = %service,
                    "Installed full chain is not certificate plus chain, treating certificate as absent"
                );
                return false;
            }
            true
        });

        let reason = evaluate(
            existing.as_ref(),
            self.request.sans(),
            self.threshold_days,
            self.force,
            now,
        );
        debug!(service = %service, reason = %reason, "Renewal decision");

        Decision { reason, existing }
    }

    /// Run the full sequence, issuing only when the policy says so
    pub async fn run<A, P>(&self, api: &A, publisher: &P) -> Result<RunOutcome, IssueError>
    where
        A: AcmeApi + ?Sized,
        P: ChallengePublisher + ?Sized,
    {
        let service = self.request.service_name();
        let Decision { reason, .. } = self.decide();

        if !reason.should_renew() {
            info!(service = %service, reason = %reason, "No renewal needed");
            return Ok(RunOutcome {
                changed: false,
                reason,
            });
        }
        info!(service = %service, reason = %reason, "Renewing certificate");

        let reuse = match reason {
            RenewalReason::Expiring => KeyReuse::Permitted,
            _ => KeyReuse::Denied,
        };
        let key = ensure_key(
            &self.installer.path_for(service, OutputKind::Key),
            reuse,
        )?;
        let csr = build_signing_request(&key, &self.request)?;

        let engine = IssuanceEngine::new(api, publisher, self.settings.clone());
        let issuance = engine.issue(&self.request, &csr);
        let issued = match self.settings.run_timeout {
            Some(limit) => tokio::time::timeout(limit + CEILING_GRACE, issuance)
                .await
                .map_err(|_| IssueError::RunTimeout {
                    stage: "issuance",
                    limit,
                })??,
            None => issuance.await?,
        };

        let files = CertificateFiles::new(key.into_pem(), csr.pem().to_string(), issued);
        let report = self.installer.install(service, &files)?;

        Ok(RunOutcome {
            changed: report.changed(),
            reason,
        })
    }
}

/// `-fullchain.crt` must be exactly `.crt` followed by `-chain.crt`
fn chain_matches(installer: &Installer, service: &str) -> bool {
    let read = |kind| std::fs::read(installer.path_for(service, kind)).ok();
    match (
        read(OutputKind::Certificate),
        read(OutputKind::Chain),
        read(OutputKind::FullChain),
    ) {
        (Some(leaf), Some(chain), Some(full_chain)) => {
            full_chain.len() == leaf.len() + chain.len()
                && full_chain.starts_with(&leaf)
                && full_chain.ends_with(&chain)
        }
        _ => false,
    }
}

fn key_matches(key_path: &Path, cert: &ExistingCertificate) -> bool {
    match std::fs::read_to_string(key_path) {
        Ok(pem) => KeyMaterial::from_pem(&pem)
            .map(|key| key.public_key_der() == cert.public_key)
            .unwrap_or(false),
        Err(_) => false,
    }
}
