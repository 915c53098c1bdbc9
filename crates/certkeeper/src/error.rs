//! Error taxonomy for certificate issuance.
//!
//! Every failure between reading the configuration and installing the new
//! files maps onto one [`IssueError`] variant. None of them leave a partially
//! written certificate set behind; [`IssueError::Install`] additionally lists
//! the files that were already replaced.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::acme::Problem;

/// Errors that abort an issuance run
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("CSR construction failed: {0}")]
    CsrBuild(String),

    #[error("ACME account error: {0}")]
    Account(String),

    #[error("no http-01 challenge offered for '{identifier}' (offered: {})", .offered.join(", "))]
    UnsupportedChallenge {
        identifier: String,
        offered: Vec<String>,
    },

    #[error("CA rejected the challenge for '{identifier}': {}", .detail.as_deref().unwrap_or("no detail provided"))]
    ChallengeRejected {
        identifier: String,
        detail: Option<String>,
    },

    #[error("authorization for {} not valid after {waited:?}", .pending.join(", "))]
    ValidationTimeout {
        pending: Vec<String>,
        waited: Duration,
    },

    #[error("order not valid {waited:?} after finalization")]
    FinalizationTimeout { waited: Duration },

    #[error("issuance run exceeded its {limit:?} ceiling during {stage}")]
    RunTimeout { stage: &'static str, limit: Duration },

    #[error("ACME protocol error during {stage}: {message}")]
    Protocol { stage: &'static str, message: String },

    #[error("installing certificate files failed after writing [{}]: {source}", display_paths(.written))]
    Install {
        written: Vec<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl IssueError {
    /// Stable identifier of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            IssueError::Configuration(_) => "configuration",
            IssueError::KeyGeneration(_) => "key_generation",
            IssueError::CsrBuild(_) => "csr_build",
            IssueError::Account(_) => "account",
            IssueError::UnsupportedChallenge { .. } => "unsupported_challenge",
            IssueError::ChallengeRejected { .. } => "challenge_rejected",
            IssueError::ValidationTimeout { .. } => "validation_timeout",
            IssueError::FinalizationTimeout { .. } => "finalization_timeout",
            IssueError::RunTimeout { .. } => "run_timeout",
            IssueError::Protocol { .. } => "protocol",
            IssueError::Install { .. } => "install",
            IssueError::Io { .. } => "io",
        }
    }

    /// Stage of the run the error belongs to
    pub fn stage(&self) -> &'static str {
        match self {
            IssueError::Configuration(_) => "configuration",
            IssueError::KeyGeneration(_) | IssueError::CsrBuild(_) => "key",
            IssueError::Account(_) => "account",
            IssueError::UnsupportedChallenge { .. }
            | IssueError::ChallengeRejected { .. }
            | IssueError::ValidationTimeout { .. } => "validation",
            IssueError::FinalizationTimeout { .. } => "finalization",
            IssueError::RunTimeout { stage, .. } | IssueError::Protocol { stage, .. } => *stage,
            IssueError::Install { .. } => "install",
            IssueError::Io { .. } => "io",
        }
    }

    /// Process exit status reported for this error; never zero
    pub fn exit_code(&self) -> i32 {
        match self {
            IssueError::Configuration(_) => 2,
            IssueError::Account(_) => 3,
            IssueError::KeyGeneration(_) | IssueError::CsrBuild(_) => 4,
            IssueError::UnsupportedChallenge { .. } => 5,
            IssueError::ChallengeRejected { .. } => 6,
            IssueError::ValidationTimeout { .. } => 7,
            IssueError::FinalizationTimeout { .. } => 8,
            IssueError::Protocol { .. } => 9,
            IssueError::Install { .. } => 10,
            IssueError::Io { .. } => 11,
            IssueError::RunTimeout { .. } => 12,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        IssueError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn protocol(stage: &'static str, err: impl std::fmt::Display) -> Self {
        IssueError::Protocol {
            stage,
            message: err.to_string(),
        }
    }
}

impl From<certkeeper_config::ConfigError> for IssueError {
    fn from(err: certkeeper_config::ConfigError) -> Self {
        IssueError::Configuration(err.to_string())
    }
}

/// Errors from a single ACME HTTP exchange
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}: {problem}")]
    Problem {
        url: String,
        status: u16,
        problem: Problem,
    },

    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("JWS signing failed: {0}")]
    Signing(String),
}

impl ClientError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport { .. } => true,
            ClientError::Problem {
                status, problem, ..
            } => *status >= 500 || *status == 429 || problem.is_type("badNonce"),
            ClientError::Status { status, .. } => *status >= 500 || *status == 429,
            ClientError::Malformed { .. } | ClientError::Signing(_) => false,
        }
    }

    /// Problem document returned by the CA, if any
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            ClientError::Problem { problem, .. } => Some(problem),
            _ => None,
        }
    }
}
