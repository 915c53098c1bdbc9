//! Renewal decision.
//!
//! A pure function of the inspected certificate, the requested names, the
//! renewal threshold and the force flag. Rules are evaluated in order; the
//! first match decides.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::inspect::ExistingCertificate;

/// Why a certificate is (or is not) being renewed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalReason {
    /// Renewal forced by configuration or command line
    Forced,
    /// No usable certificate on disk
    Missing,
    /// Installed SAN set differs from the requested one
    SansChanged,
    /// Less than the threshold of validity remains
    Expiring,
    /// Certificate is current
    Current,
}

impl RenewalReason {
    /// Whether this reason calls for issuance
    pub fn should_renew(self) -> bool {
        !matches!(self, RenewalReason::Current)
    }
}

impl fmt::Display for RenewalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RenewalReason::Forced => "renewal forced",
            RenewalReason::Missing => "no existing certificate",
            RenewalReason::SansChanged => "subject alternative names changed",
            RenewalReason::Expiring => "certificate expires within the renewal threshold",
            RenewalReason::Current => "certificate is current",
        };
        f.write_str(text)
    }
}

/// Decide whether to issue, evaluated against the current time
pub fn should_renew(
    existing: Option<&ExistingCertificate>,
    requested_sans: &BTreeSet<String>,
    threshold_days: u32,
    force: bool,
) -> bool {
    evaluate(existing, requested_sans, threshold_days, force, Utc::now()).should_renew()
}

/// Decide whether to issue at `now`, returning the deciding rule
pub fn evaluate(
    existing: Option<&ExistingCertificate>,
    requested_sans: &BTreeSet<String>,
    threshold_days: u32,
    force: bool,
    now: DateTime<Utc>,
) -> RenewalReason {
    if force {
        return RenewalReason::Forced;
    }

    let Some(existing) = existing else {
        return RenewalReason::Missing;
    };

    if existing.sans != *requested_sans {
        return RenewalReason::SansChanged;
    }

    if existing.not_after - now < Duration::days(i64::from(threshold_days)) {
        return RenewalReason::Expiring;
    }

    RenewalReason::Current
}
