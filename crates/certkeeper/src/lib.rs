//! certkeeper library
//!
//! Idempotent ACME http-01 issuance and renewal for a single certificate
//! service. Each run inspects the installed certificate, decides whether to
//! act, and only then drives an ACME order and installs the result:
//!
//! - **Renewal policy**: force, missing, SAN change or expiry threshold
//! - **Keys and CSRs**: ECDSA P-256, key reused only for expiry renewals
//! - **ACME engine**: order state machine with bounded polling and cleanup
//! - **Installer**: diff-before-write, atomic replacement, restrictive key mode
//!
//! # Example
//!
//! ```ignore
//! use certkeeper::{AccountKey, HttpAcmeClient, Orchestrator, WebrootPublisher};
//! use certkeeper_config::CertConfig;
//!
//! let config = CertConfig::from_file("/etc/certkeeper/web.kdl")?;
//! let client = HttpAcmeClient::new(
//!     &config.acme.directory_url,
//!     AccountKey::load(&config.acme.account_key)?,
//!     None,
//! )?;
//! let publisher = WebrootPublisher::new(&config.webroot);
//!
//! let outcome = Orchestrator::from_config(&config)?.run(&client, &publisher).await?;
//! println!("changed={}", outcome.changed);
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod challenge;
pub mod error;
pub mod inspect;
pub mod install;
pub mod keys;
pub mod orchestrator;
pub mod policy;
pub mod reload;
pub mod request;
pub mod trust;

// ============================================================================
// Public API Re-exports
// ============================================================================

// ACME protocol
pub use acme::{
    AccountKey, AcmeApi, EngineSettings, HttpAcmeClient, IssuanceEngine, IssuedChain, PollPolicy,
};

// Challenge publication
pub use challenge::{ChallengeGuard, ChallengePublisher, MemoryPublisher, WebrootPublisher};

// Errors
pub use error::{ClientError, IssueError};

// Certificate lifecycle
pub use inspect::{inspect, ExistingCertificate};
pub use install::{CertificateFiles, InstallReport, Installer, OutputKind};
pub use keys::{build_signing_request, ensure_key, KeyMaterial, KeyReuse, SigningRequest};
pub use policy::{should_renew, RenewalReason};
pub use request::CertificateRequest;

// Orchestration
pub use orchestrator::{Decision, Orchestrator, RunOutcome};

// Collaborators
pub use reload::{ServiceReloader, SystemctlReloader};
pub use trust::{RootSource, TrustBootstrap};
