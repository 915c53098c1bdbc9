//! ACME certificate issuance (RFC 8555, http-01 only)
//!
//! # Architecture
//!
//! - [`AccountKey`] - the externally supplied account key: JWK, thumbprint, ES256 JWS
//! - [`AcmeApi`] - the operations the engine needs from a CA; [`HttpAcmeClient`]
//!   implements them over HTTPS with nonce management
//! - [`IssuanceEngine`] - drives one order from creation to a certificate chain
//! - [`PollPolicy`] - bounded exponential backoff for every polling loop
//! - [`IssuedChain`] - the downloaded chain split into leaf and intermediates
//!
//! # Order Flow
//!
//! 1. Bind the account key (an existing registration is fine)
//! 2. Create an order for every requested name
//! 3. Publish the http-01 key authorization for every pending authorization
//! 4. Mark every challenge ready, then poll until all authorizations are valid
//! 5. Remove the published challenges
//! 6. Finalize with the CSR and poll until the order is valid
//! 7. Download and split the chain

mod backoff;
mod chain;
mod client;
mod engine;
mod jws;
mod types;

pub use backoff::{Backoff, PollPolicy};
pub use chain::IssuedChain;
pub use client::{AcmeApi, HttpAcmeClient};
pub use engine::{EngineSettings, IssuanceEngine, OrderPhase};
pub use jws::AccountKey;
pub use types::{
    AccountBinding, Authorization, AuthorizationStatus, Challenge, ChallengeStatus, Directory,
    Fetched, Identifier, IdentifierType, NewOrder, Order, OrderStatus, Problem, HTTP_01,
    PROBLEM_URN_PREFIX,
};
