//! ACME order state machine
//!
//! Drives one order from creation to a downloaded certificate chain:
//!
//! ```text
//! Created -> Authorizing -> Ready -> Processing -> Valid
//!     \            \           \          \
//!      +------------+-----------+----------+--> Invalid
//! ```
//!
//! Every challenge is published before any is marked ready, every
//! authorization must be valid before finalization, and published challenges
//! are removed before the engine returns, on success and on failure alike.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use certkeeper_config::RenewalConfig;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::backoff::{Backoff, PollPolicy};
use super::chain::IssuedChain;
use super::client::AcmeApi;
use super::types::{
    AuthorizationStatus, ChallengeStatus, Identifier, NewOrder, Order, OrderStatus,
};
use crate::challenge::{ChallengeGuard, ChallengePublisher};
use crate::error::{ClientError, IssueError};
use crate::keys::SigningRequest;
use crate::request::CertificateRequest;

/// Phase of the order as tracked by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPhase {
    Created,
    Authorizing,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderPhase {
    /// Whether `self -> next` is a legal move
    pub fn can_advance_to(self, next: OrderPhase) -> bool {
        use OrderPhase::*;
        match (self, next) {
            (Created, Authorizing) | (Created, Ready) => true,
            (Authorizing, Ready) => true,
            (Ready, Processing) | (Ready, Valid) => true,
            (Processing, Valid) => true,
            (Valid, _) | (Invalid, _) => false,
            (_, Invalid) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderPhase::Created => "created",
            OrderPhase::Authorizing => "authorizing",
            OrderPhase::Ready => "ready",
            OrderPhase::Processing => "processing",
            OrderPhase::Valid => "valid",
            OrderPhase::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Progress<'e> {
    order_url: String,
    phase: OrderPhase,
    observed: &'e Mutex<Option<OrderPhase>>,
}

impl<'e> Progress<'e> {
    fn start(order_url: String, observed: &'e Mutex<Option<OrderPhase>>) -> Self {
        *observed.lock() = Some(OrderPhase::Created);
        Self {
            order_url,
            phase: OrderPhase::Created,
            observed,
        }
    }

    fn advance(&mut self, next: OrderPhase) -> Result<(), IssueError> {
        if !self.phase.can_advance_to(next) {
            return Err(IssueError::protocol(
                "order",
                format!("order moved from {} to {}", self.phase, next),
            ));
        }
        debug!(order = %self.order_url, from = %self.phase, to = %next, "Order phase change");
        self.phase = next;
        *self.observed.lock() = Some(next);
        Ok(())
    }

    /// Mark the order invalid when `err` means the CA refused it
    fn reject(&mut self, err: IssueError) -> IssueError {
        if matches!(err, IssueError::ChallengeRejected { .. })
            && self.phase.can_advance_to(OrderPhase::Invalid)
        {
            debug!(order = %self.order_url, from = %self.phase, to = %OrderPhase::Invalid, "Order phase change");
            self.phase = OrderPhase::Invalid;
            *self.observed.lock() = Some(OrderPhase::Invalid);
        }
        err
    }
}

/// Timing and account settings for the engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Account contacts sent on registration
    pub contacts: Vec<String>,
    /// Authorization polling
    pub validation: PollPolicy,
    /// Finalization polling
    pub finalization: PollPolicy,
    /// Ceiling for the whole order, if any
    pub run_timeout: Option<Duration>,
}

impl EngineSettings {
    pub fn from_config(renewal: &RenewalConfig, contacts: &[String]) -> Self {
        let initial = Duration::from_secs(renewal.poll_initial_secs);
        let maximum = Duration::from_secs(renewal.poll_max_secs);
        Self {
            contacts: contacts.to_vec(),
            validation: PollPolicy::new(
                initial,
                maximum,
                Duration::from_secs(renewal.validation_timeout_secs),
            ),
            finalization: PollPolicy::new(
                initial,
                maximum,
                Duration::from_secs(renewal.finalization_timeout_secs),
            ),
            run_timeout: Some(Duration::from_secs(renewal.run_timeout_secs)),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            contacts: Vec::new(),
            validation: PollPolicy::default(),
            finalization: PollPolicy::default(),
            run_timeout: None,
        }
    }
}

#[derive(Debug)]
struct PendingAuthorization {
    identifier: String,
    url: String,
    challenge_url: String,
    challenge_status: ChallengeStatus,
}

/// Runs ACME orders against one CA, publishing through one publisher
pub struct IssuanceEngine<'a, A: AcmeApi + ?Sized, P: ChallengePublisher + ?Sized> {
    api: &'a A,
    publisher: &'a P,
    settings: EngineSettings,
    phase: Mutex<Option<OrderPhase>>,
}

impl<'a, A: AcmeApi + ?Sized, P: ChallengePublisher + ?Sized> IssuanceEngine<'a, A, P> {
    pub fn new(api: &'a A, publisher: &'a P, settings: EngineSettings) -> Self {
        Self {
            api,
            publisher,
            settings,
            phase: Mutex::new(None),
        }
    }

    /// Last phase reached by the most recent order, `None` before one exists
    pub fn phase(&self) -> Option<OrderPhase> {
        *self.phase.lock()
    }

    /// Obtain a certificate for `request` using `csr`
    pub async fn issue(
        &self,
        request: &CertificateRequest,
        csr: &SigningRequest,
    ) -> Result<IssuedChain, IssueError> {
        let ceiling = self.settings.run_timeout.map(|t| Instant::now() + t);

        let account = self
            .retrying("account", &self.settings.validation, ceiling, || {
                self.api.bind_account(&self.settings.contacts)
            })
            .await
            .map_err(|e| match e {
                IssueError::Protocol { message, .. } => IssueError::Account(message),
                other => other,
            })?;
        debug!(account = %account.url, created = account.created, "Account bound");

        let identifiers: Vec<Identifier> = request
            .sans()
            .iter()
            .map(|name| Identifier::for_name(name))
            .collect();
        let NewOrder { url, order } = self
            .retrying("order", &self.settings.validation, ceiling, || {
                self.api.new_order(&identifiers)
            })
            .await?;
        info!(
            service = %request.service_name(),
            order = %url,
            identifiers = identifiers.len(),
            "Created ACME order"
        );

        let mut progress = Progress::start(url.clone(), &self.phase);

        match order.status {
            OrderStatus::Pending => {
                progress.advance(OrderPhase::Authorizing)?;

                let mut guard = ChallengeGuard::new(self.publisher);
                let outcome = self.authorize(&order, &mut guard, ceiling).await;
                let failures = guard.cleanup();
                if failures > 0 {
                    warn!(failures, "Some challenge files could not be removed");
                }
                outcome.map_err(|e| progress.reject(e))?;

                self.await_ready(&url, &order, ceiling)
                    .await
                    .map_err(|e| progress.reject(e))?;
                progress.advance(OrderPhase::Ready)?;
            }
            OrderStatus::Ready => {
                debug!(order = %url, "Order ready without new authorizations");
                progress.advance(OrderPhase::Ready)?;
            }
            OrderStatus::Invalid => {
                progress.advance(OrderPhase::Invalid)?;
                return Err(IssueError::protocol(
                    "order",
                    problem_detail(&order, "order created invalid"),
                ));
            }
            OrderStatus::Processing | OrderStatus::Valid => {
                return Err(IssueError::protocol(
                    "order",
                    format!("new order is already {:?}", order.status),
                ));
            }
        }

        let certificate_url = self.finalize(&order, csr, &mut progress, ceiling).await?;

        let pem = self
            .retrying("download", &self.settings.finalization, ceiling, || {
                self.api.certificate(&certificate_url)
            })
            .await?;
        let issued = IssuedChain::split(&pem, request.sans())?;

        info!(
            service = %request.service_name(),
            order = %url,
            "Certificate issued"
        );
        Ok(issued)
    }

    /// Publish every challenge, then mark them ready and wait for validation
    async fn authorize(
        &self,
        order: &Order,
        guard: &mut ChallengeGuard<'_, P>,
        ceiling: Option<Instant>,
    ) -> Result<(), IssueError> {
        let mut pending = Vec::with_capacity(order.authorizations.len());

        for url in &order.authorizations {
            let authorization = self
                .retrying("authorization", &self.settings.validation, ceiling, || {
                    self.api.authorization(url)
                })
                .await
                .map_err(|e| with_pending(e, || order_names(order)))?
                .resource;
            let identifier = authorization.identifier.value.clone();

            match authorization.status {
                AuthorizationStatus::Valid => {
                    debug!(identifier = %identifier, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Invalid
                | AuthorizationStatus::Deactivated
                | AuthorizationStatus::Expired
                | AuthorizationStatus::Revoked => {
                    let detail = authorization
                        .failure_detail()
                        .unwrap_or_else(|| format!("authorization is {:?}", authorization.status));
                    return Err(IssueError::ChallengeRejected {
                        identifier,
                        detail: Some(detail),
                    });
                }
            }

            let Some(challenge) = authorization.http01() else {
                return Err(IssueError::UnsupportedChallenge {
                    identifier,
                    offered: authorization
                        .challenges
                        .iter()
                        .map(|c| c.kind.clone())
                        .collect(),
                });
            };

            let key_authorization = self.api.key_authorization(&challenge.token);
            guard
                .publish(&challenge.token, &key_authorization)
                .map_err(|e| {
                    IssueError::io(format!("publishing challenge for {}", identifier), e)
                })?;
            debug!(identifier = %identifier, token = %challenge.token, "Challenge published");

            pending.push(PendingAuthorization {
                identifier,
                url: url.clone(),
                challenge_url: challenge.url.clone(),
                challenge_status: challenge.status,
            });
        }

        for authz in &pending {
            if authz.challenge_status != ChallengeStatus::Pending {
                trace!(identifier = %authz.identifier, status = ?authz.challenge_status, "Challenge already submitted");
                continue;
            }
            self.retrying("challenge", &self.settings.validation, ceiling, || {
                self.api.challenge_ready(&authz.challenge_url)
            })
            .await
            .map_err(|e| with_pending(e, || vec![authz.identifier.clone()]))?;
            debug!(identifier = %authz.identifier, "Challenge submitted for validation");
        }

        self.await_authorizations(pending, ceiling).await
    }

    async fn await_authorizations(
        &self,
        mut pending: Vec<PendingAuthorization>,
        ceiling: Option<Instant>,
    ) -> Result<(), IssueError> {
        let mut backoff = self.settings.validation.start(ceiling);

        loop {
            let mut waiting = Vec::with_capacity(pending.len());
            let mut hint: Option<Duration> = None;

            for authz in pending {
                match self.api.authorization(&authz.url).await {
                    Ok(fetched) => {
                        hint = hint.max(fetched.retry_after);
                        match fetched.resource.status {
                            AuthorizationStatus::Valid => {
                                info!(identifier = %authz.identifier, "Authorization valid");
                            }
                            AuthorizationStatus::Pending => {
                                trace!(identifier = %authz.identifier, attempt = backoff.attempts(), "Authorization pending");
                                waiting.push(authz);
                            }
                            AuthorizationStatus::Invalid
                            | AuthorizationStatus::Deactivated
                            | AuthorizationStatus::Expired
                            | AuthorizationStatus::Revoked => {
                                warn!(
                                    identifier = %authz.identifier,
                                    status = ?fetched.resource.status,
                                    "Authorization failed"
                                );
                                return Err(IssueError::ChallengeRejected {
                                    identifier: authz.identifier,
                                    detail: fetched.resource.failure_detail(),
                                });
                            }
                        }
                    }
                    Err(e) if e.is_transient() => {
                        warn!(identifier = %authz.identifier, error = %e, "Transient error polling authorization");
                        waiting.push(authz);
                    }
                    Err(e) => return Err(IssueError::protocol("validation", e)),
                }
            }

            if waiting.is_empty() {
                return Ok(());
            }
            pending = waiting;

            if !backoff.wait(hint).await {
                if backoff.capped_by_ceiling() {
                    return Err(self.run_timeout("validation"));
                }
                return Err(IssueError::ValidationTimeout {
                    pending: pending.into_iter().map(|a| a.identifier).collect(),
                    waited: backoff.elapsed(),
                });
            }
        }
    }

    /// Wait for the order to leave `pending` once its authorizations are valid
    async fn await_ready(
        &self,
        url: &str,
        order: &Order,
        ceiling: Option<Instant>,
    ) -> Result<(), IssueError> {
        let mut backoff = self.settings.validation.start(ceiling);
        loop {
            let mut hint = None;
            match self.api.order(url).await {
                Ok(fetched) => {
                    hint = fetched.retry_after;
                    match fetched.resource.status {
                        OrderStatus::Ready => return Ok(()),
                        OrderStatus::Pending => {
                            trace!(order = %url, "Order still pending");
                        }
                        OrderStatus::Invalid => {
                            return Err(IssueError::ChallengeRejected {
                                identifier: identifiers_of(order),
                                detail: fetched.resource.error.as_ref().map(ToString::to_string),
                            });
                        }
                        status @ (OrderStatus::Processing | OrderStatus::Valid) => {
                            return Err(IssueError::protocol(
                                "validation",
                                format!("order became {:?} before finalization", status),
                            ));
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(order = %url, error = %e, "Transient error polling order");
                }
                Err(e) => return Err(IssueError::protocol("validation", e)),
            }

            if !backoff.wait(hint).await {
                if backoff.capped_by_ceiling() {
                    return Err(self.run_timeout("validation"));
                }
                return Err(IssueError::ValidationTimeout {
                    pending: order_names(order),
                    waited: backoff.elapsed(),
                });
            }
        }
    }

    /// Submit the CSR and wait for the certificate URL
    async fn finalize(
        &self,
        order: &Order,
        csr: &SigningRequest,
        progress: &mut Progress<'_>,
        ceiling: Option<Instant>,
    ) -> Result<String, IssueError> {
        let submitted = self
            .retrying("finalization", &self.settings.finalization, ceiling, || {
                self.api.finalize(&order.finalize, csr.der())
            })
            .await?;
        debug!(order = %progress.order_url, status = ?submitted.status, "CSR submitted");

        let mut current = submitted;
        let mut hint = None;
        let mut backoff = self.settings.finalization.start(ceiling);
        loop {
            match current.status {
                OrderStatus::Valid => {
                    if progress.phase == OrderPhase::Ready {
                        progress.advance(OrderPhase::Processing)?;
                    }
                    progress.advance(OrderPhase::Valid)?;
                    return current.certificate.clone().ok_or_else(|| {
                        IssueError::protocol("finalization", "valid order has no certificate URL")
                    });
                }
                OrderStatus::Processing => {
                    if progress.phase == OrderPhase::Ready {
                        progress.advance(OrderPhase::Processing)?;
                    }
                    trace!(order = %progress.order_url, "Waiting for issuance");
                }
                // Some CAs report `ready` until the CSR has been picked up.
                OrderStatus::Ready => {
                    trace!(order = %progress.order_url, "Finalization not started yet");
                }
                OrderStatus::Invalid => {
                    progress.advance(OrderPhase::Invalid)?;
                    return Err(IssueError::protocol(
                        "finalization",
                        problem_detail(&current, "order became invalid after finalization"),
                    ));
                }
                OrderStatus::Pending => {
                    return Err(IssueError::protocol(
                        "finalization",
                        "order returned to pending after finalization",
                    ));
                }
            }

            if !backoff.wait(hint.take()).await {
                if backoff.capped_by_ceiling() {
                    return Err(self.run_timeout("finalization"));
                }
                return Err(IssueError::FinalizationTimeout {
                    waited: backoff.elapsed(),
                });
            }

            match self.api.order(&progress.order_url).await {
                Ok(fetched) => {
                    hint = fetched.retry_after;
                    current = fetched.resource;
                }
                Err(e) if e.is_transient() => {
                    warn!(order = %progress.order_url, error = %e, "Transient error polling order");
                }
                Err(e) => return Err(IssueError::protocol("finalization", e)),
            }
        }
    }

    /// Call `request`, retrying transient failures within `policy`
    async fn retrying<T, F, Fut>(
        &self,
        stage: &'static str,
        policy: &PollPolicy,
        ceiling: Option<Instant>,
        mut request: F,
    ) -> Result<T, IssueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut backoff = policy.start(ceiling);
        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(stage, error = %e, attempt = backoff.attempts() + 1, "Transient ACME error, retrying");
                    if !backoff.wait(None).await {
                        return Err(self.exhausted(stage, &backoff, e));
                    }
                }
                Err(e) => return Err(IssueError::protocol(stage, e)),
            }
        }
    }

    fn exhausted(&self, stage: &'static str, backoff: &Backoff, last: ClientError) -> IssueError {
        if backoff.capped_by_ceiling() {
            return self.run_timeout(stage);
        }
        match stage {
            "finalization" => IssueError::FinalizationTimeout {
                waited: backoff.elapsed(),
            },
            // The caller names the pending identifiers
            "authorization" | "challenge" => IssueError::ValidationTimeout {
                pending: Vec::new(),
                waited: backoff.elapsed(),
            },
            _ => IssueError::protocol(
                stage,
                format!("{} (gave up after {} attempts)", last, backoff.attempts()),
            ),
        }
    }

    fn run_timeout(&self, stage: &'static str) -> IssueError {
        IssueError::RunTimeout {
            stage,
            limit: self.settings.run_timeout.unwrap_or_default(),
        }
    }
}

fn order_names(order: &Order) -> Vec<String> {
    order.identifiers.iter().map(|i| i.value.clone()).collect()
}

/// Fill in the identifiers of a validation timeout raised by a retry loop
fn with_pending(err: IssueError, names: impl FnOnce() -> Vec<String>) -> IssueError {
    match err {
        IssueError::ValidationTimeout { pending, waited } if pending.is_empty() => {
            IssueError::ValidationTimeout {
                pending: names(),
                waited,
            }
        }
        other => other,
    }
}

fn identifiers_of(order: &Order) -> String {
    order
        .identifiers
        .iter()
        .map(|i| i.value.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn problem_detail(order: &Order, fallback: &str) -> String {
    order
        .error
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| fallback.to_string())
}
