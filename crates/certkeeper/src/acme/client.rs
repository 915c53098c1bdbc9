//! ACME v2 HTTP client (RFC 8555)
//!
//! [`AcmeApi`] is the seam between the issuance engine and the CA. The
//! production implementation, [`HttpAcmeClient`], speaks JWS over HTTPS;
//! tests substitute an in-process fake.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, LOCATION, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, trace, warn};

use super::jws::AccountKey;
use super::types::{
    AccountBinding, Authorization, Challenge, Directory, Fetched, Identifier, NewOrder, Order,
    Problem,
};
use crate::error::ClientError;

const REPLAY_NONCE: &str = "replay-nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the issuance engine needs from an ACME CA
#[async_trait]
pub trait AcmeApi: Send + Sync {
    /// Register the account key, or look up the existing registration
    async fn bind_account(&self, contacts: &[String]) -> Result<AccountBinding, ClientError>;

    /// Key authorization to publish for a challenge token
    fn key_authorization(&self, token: &str) -> String;

    /// Place an order for the given identifiers
    async fn new_order(&self, identifiers: &[Identifier]) -> Result<NewOrder, ClientError>;

    /// Fetch an authorization
    async fn authorization(&self, url: &str) -> Result<Fetched<Authorization>, ClientError>;

    /// Tell the CA the challenge response is in place
    async fn challenge_ready(&self, url: &str) -> Result<Challenge, ClientError>;

    /// Fetch an order
    async fn order(&self, url: &str) -> Result<Fetched<Order>, ClientError>;

    /// Submit the DER-encoded CSR to the order's finalize URL
    async fn finalize(&self, url: &str, csr_der: &[u8]) -> Result<Order, ClientError>;

    /// Download the PEM certificate chain
    async fn certificate(&self, url: &str) -> Result<String, ClientError>;
}

#[derive(Debug, Default)]
struct ClientState {
    directory: Option<Directory>,
    nonce: Option<String>,
    account_url: Option<String>,
}

/// JWS-over-HTTPS ACME client
///
/// The directory is fetched lazily and cached, and the most recent
/// `Replay-Nonce` is reused for the next request. A `badNonce` rejection
/// is retried once with a fresh nonce.
#[derive(Debug)]
pub struct HttpAcmeClient {
    http: reqwest::Client,
    directory_url: String,
    key: AccountKey,
    state: Mutex<ClientState>,
}

impl HttpAcmeClient {
    /// Create a client for `directory_url`
    ///
    /// `extra_root_pem` adds a trust anchor for private CAs.
    pub fn new(
        directory_url: impl Into<String>,
        key: AccountKey,
        extra_root_pem: Option<&[u8]>,
    ) -> Result<Self, ClientError> {
        let directory_url = directory_url.into();
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("certkeeper/", env!("CARGO_PKG_VERSION")));

        if let Some(pem) = extra_root_pem {
            let root = reqwest::Certificate::from_pem(pem).map_err(|e| ClientError::Transport {
                url: directory_url.clone(),
                source: e,
            })?;
            builder = builder.add_root_certificate(root);
        }

        let http = builder.build().map_err(|e| ClientError::Transport {
            url: directory_url.clone(),
            source: e,
        })?;

        Ok(Self {
            http,
            directory_url,
            key,
            state: Mutex::new(ClientState::default()),
        })
    }

    /// Account key thumbprint
    pub fn thumbprint(&self) -> &str {
        self.key.thumbprint()
    }

    /// Account URL, once bound
    pub fn account_url(&self) -> Option<String> {
        self.state.lock().account_url.clone()
    }

    async fn directory(&self) -> Result<Directory, ClientError> {
        if let Some(directory) = self.state.lock().directory.clone() {
            return Ok(directory);
        }

        let url = self.directory_url.as_str();
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| transport(url, e))?;
        let response = check_status(url, response).await?;
        let directory: Directory = read_json(url, response).await?;

        debug!(
            new_account = %directory.new_account,
            new_order = %directory.new_order,
            "ACME directory fetched"
        );
        self.state.lock().directory = Some(directory.clone());
        Ok(directory)
    }

    async fn nonce(&self) -> Result<String, ClientError> {
        if let Some(nonce) = self.state.lock().nonce.take() {
            return Ok(nonce);
        }

        let directory = self.directory().await?;
        let url = directory.new_nonce.as_str();
        let response = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|e| transport(url, e))?;

        replay_nonce(response.headers()).ok_or_else(|| ClientError::Malformed {
            url: url.to_string(),
            reason: "newNonce response carries no Replay-Nonce header".to_string(),
        })
    }

    fn remember_nonce(&self, headers: &HeaderMap) {
        if let Some(nonce) = replay_nonce(headers) {
            self.state.lock().nonce = Some(nonce);
        }
    }

    /// Signed POST; `payload: None` is POST-as-GET
    async fn post(
        &self,
        url: &str,
        payload: Option<&Value>,
        with_kid: bool,
        accept: &str,
    ) -> Result<Response, ClientError> {
        let kid = if with_kid {
            let account_url = self.state.lock().account_url.clone();
            Some(account_url.ok_or_else(|| {
                ClientError::Signing("no account bound to the key yet".to_string())
            })?)
        } else {
            None
        };

        let mut retried = false;
        loop {
            let nonce = self.nonce().await?;
            let body = self.key.sign_request(url, &nonce, kid.as_deref(), payload);

            trace!(url = %url, post_as_get = payload.is_none(), "ACME POST");
            let response = self
                .http
                .post(url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .header(ACCEPT, accept)
                .body(body.to_string())
                .send()
                .await
                .map_err(|e| transport(url, e))?;
            self.remember_nonce(response.headers());

            match check_status(url, response).await {
                Err(err) if !retried && err.problem().is_some_and(|p| p.is_type("badNonce")) => {
                    debug!(url = %url, "CA rejected nonce, retrying with a fresh one");
                    retried = true;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl AcmeApi for HttpAcmeClient {
    async fn bind_account(&self, contacts: &[String]) -> Result<AccountBinding, ClientError> {
        let directory = self.directory().await?;
        let url = directory.new_account.as_str();

        let contact: Vec<String> = contacts
            .iter()
            .map(|c| {
                if c.contains(':') {
                    c.clone()
                } else {
                    format!("mailto:{}", c)
                }
            })
            .collect();
        let payload = json!({
            "termsOfServiceAgreed": true,
            "contact": contact,
        });

        let response = self.post(url, Some(&payload), false, "application/json").await?;
        let created = response.status() == StatusCode::CREATED;
        let account_url = location(url, response.headers())?;

        if created {
            info!(account = %account_url, "Registered ACME account");
        } else {
            debug!(account = %account_url, "ACME account already registered");
        }
        self.state.lock().account_url = Some(account_url.clone());

        Ok(AccountBinding {
            url: account_url,
            created,
        })
    }

    fn key_authorization(&self, token: &str) -> String {
        self.key.key_authorization(token)
    }

    async fn new_order(&self, identifiers: &[Identifier]) -> Result<NewOrder, ClientError> {
        let directory = self.directory().await?;
        let url = directory.new_order.as_str();
        let payload = json!({ "identifiers": identifiers });

        let response = self.post(url, Some(&payload), true, "application/json").await?;
        let order_url = location(url, response.headers())?;
        let order: Order = read_json(url, response).await?;

        Ok(NewOrder {
            url: order_url,
            order,
        })
    }

    async fn authorization(&self, url: &str) -> Result<Fetched<Authorization>, ClientError> {
        let response = self.post(url, None, true, "application/json").await?;
        let retry_after = retry_after(response.headers());
        Ok(Fetched {
            resource: read_json(url, response).await?,
            retry_after,
        })
    }

    async fn challenge_ready(&self, url: &str) -> Result<Challenge, ClientError> {
        let response = self.post(url, Some(&json!({})), true, "application/json").await?;
        read_json(url, response).await
    }

    async fn order(&self, url: &str) -> Result<Fetched<Order>, ClientError> {
        let response = self.post(url, None, true, "application/json").await?;
        let retry_after = retry_after(response.headers());
        Ok(Fetched {
            resource: read_json(url, response).await?,
            retry_after,
        })
    }

    async fn finalize(&self, url: &str, csr_der: &[u8]) -> Result<Order, ClientError> {
        let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let response = self.post(url, Some(&payload), true, "application/json").await?;
        read_json(url, response).await
    }

    async fn certificate(&self, url: &str) -> Result<String, ClientError> {
        let response = self.post(url, None, true, PEM_CHAIN).await?;
        let chain = response.text().await.map_err(|e| transport(url, e))?;
        if !chain.contains("-----BEGIN CERTIFICATE-----") {
            return Err(ClientError::Malformed {
                url: url.to_string(),
                reason: "certificate download contains no PEM certificate".to_string(),
            });
        }
        Ok(chain)
    }
}

fn transport(url: &str, source: reqwest::Error) -> ClientError {
    ClientError::Transport {
        url: url.to_string(),
        source,
    }
}

/// Turn a non-2xx response into a problem or status error
async fn check_status(url: &str, response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<Problem>(&body) {
        Ok(problem) if problem.kind.is_some() || problem.detail.is_some() => {
            warn!(url = %url, status = status.as_u16(), problem = %problem, "ACME request failed");
            Err(ClientError::Problem {
                url: url.to_string(),
                status: status.as_u16(),
                problem,
            })
        }
        _ => Err(ClientError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        }),
    }
}

async fn read_json<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, ClientError> {
    let bytes = response.bytes().await.map_err(|e| transport(url, e))?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Malformed {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

fn replay_nonce(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REPLAY_NONCE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn location(url: &str, headers: &HeaderMap) -> Result<String, ClientError> {
    headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ClientError::Malformed {
            url: url.to_string(),
            reason: "response carries no Location header".to_string(),
        })
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
