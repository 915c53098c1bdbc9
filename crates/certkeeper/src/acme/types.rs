//! ACME resource objects (RFC 8555 section 7.1).
//!
//! Statuses are closed enums: a status the CA invents later fails to
//! deserialize and surfaces as a protocol error instead of being guessed at.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix of ACME problem type URNs
pub const PROBLEM_URN_PREFIX: &str = "urn:ietf:params:acme:error:";

/// Challenge type this crate can satisfy
pub const HTTP_01: &str = "http-01";

/// Directory resource listing the CA's endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_change: Option<String>,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// Authorization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// Challenge status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// Identifier kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Dns,
    Ip,
}

/// A name an order is placed for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: IdentifierType,
    pub value: String,
}

impl Identifier {
    /// Identifier for a SAN: IP literals become `ip`, everything else `dns`
    pub fn for_name(name: &str) -> Self {
        let kind = if name.parse::<IpAddr>().is_ok() {
            IdentifierType::Ip
        } else {
            IdentifierType::Dns
        };
        Self {
            kind,
            value: name.to_string(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Order resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

/// Authorization resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    /// The http-01 challenge, if offered
    pub fn http01(&self) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == HTTP_01)
    }

    /// Problem detail of the first failed challenge
    pub fn failure_detail(&self) -> Option<String> {
        self.challenges
            .iter()
            .filter_map(|c| c.error.as_ref())
            .next()
            .map(Problem::to_string)
    }
}

/// Challenge resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

/// RFC 7807 problem document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<Problem>,
}

impl Problem {
    /// Whether this is the ACME error type `urn:ietf:params:acme:error:<short>`
    pub fn is_type(&self, short: &str) -> bool {
        self.kind
            .as_deref()
            .and_then(|k| k.strip_prefix(PROBLEM_URN_PREFIX))
            .is_some_and(|k| k == short)
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self
            .kind
            .as_deref()
            .map(|k| k.strip_prefix(PROBLEM_URN_PREFIX).unwrap_or(k))
            .unwrap_or("problem");
        match self.detail {
            Some(ref detail) => write!(f, "{}: {}", kind, detail)?,
            None => f.write_str(kind)?,
        }
        for sub in &self.subproblems {
            write!(f, "; {}", sub)?;
        }
        Ok(())
    }
}

/// A freshly created order and its URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub url: String,
    pub order: Order,
}

/// A polled resource and the CA's requested delay before the next poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<T> {
    pub resource: T,
    pub retry_after: Option<Duration>,
}

impl<T> Fetched<T> {
    pub fn now(resource: T) -> Self {
        Self {
            resource,
            retry_after: None,
        }
    }
}

/// Result of binding the account key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBinding {
    /// Account URL used as the JWS `kid`
    pub url: String,
    /// `false` when the CA reported the key as already registered
    pub created: bool,
}
