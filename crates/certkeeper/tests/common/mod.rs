//! In-process ACME CA shared by the integration tests.
//!
//! Validates http-01 challenges by reading the webroot, signs the submitted
//! CSR with a throwaway CA and counts every call so tests can assert that no
//! network traffic happened.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, IsCa, Issuer, KeyPair,
};

use certkeeper::acme::{
    AccountBinding, AcmeApi, Authorization, AuthorizationStatus, Challenge, ChallengeStatus,
    Fetched, Identifier, NewOrder, Order, OrderStatus, Problem, HTTP_01,
};
use certkeeper::{
    CertificateRequest, ClientError, EngineSettings, Installer, Orchestrator, PollPolicy,
};

pub const THUMBPRINT: &str = "fake-account-thumbprint";

struct FakeAuthorization {
    url: String,
    identifier: Identifier,
    token: String,
    status: AuthorizationStatus,
    error: Option<Problem>,
}

#[derive(Default)]
struct FakeState {
    authorizations: Vec<FakeAuthorization>,
    identifiers: Vec<Identifier>,
    finalized: bool,
    chain: Option<String>,
    validated: BTreeSet<String>,
}

/// Fake ACME CA
pub struct FakeCa {
    webroot: PathBuf,
    ca_params: CertificateParams,
    ca_key_pem: String,
    ca_pem: String,
    validity_days: i64,
    reject: HashSet<String>,
    calls: AtomicUsize,
    state: Mutex<FakeState>,
}

impl FakeCa {
    pub fn new(webroot: &Path) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Fake Intermediate");
        let ca_pem = ca_params.self_signed(&ca_key).unwrap().pem();

        Self {
            webroot: webroot.to_path_buf(),
            ca_params,
            ca_key_pem: ca_key.serialize_pem(),
            ca_pem,
            validity_days: 90,
            reject: HashSet::new(),
            calls: AtomicUsize::new(0),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Issue certificates valid for `days` from now
    pub fn with_validity_days(mut self, days: i64) -> Self {
        self.validity_days = days;
        self
    }

    /// Fail validation for `identifier` regardless of the webroot
    pub fn rejecting(mut self, identifier: &str) -> Self {
        self.reject.insert(identifier.to_string());
        self
    }

    /// Number of ACME operations performed
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Identifiers whose challenge file was found with the right content
    pub fn validated(&self) -> BTreeSet<String> {
        self.state.lock().validated.clone()
    }

    /// Chain handed out by the last download
    pub fn issued_chain(&self) -> Option<String> {
        self.state.lock().chain.clone()
    }

    fn call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn challenge_file(&self, token: &str) -> PathBuf {
        self.webroot
            .join(".well-known")
            .join("acme-challenge")
            .join(token)
    }

    fn order_status(state: &FakeState) -> OrderStatus {
        if state.finalized {
            OrderStatus::Valid
        } else if state
            .authorizations
            .iter()
            .any(|a| a.status == AuthorizationStatus::Invalid)
        {
            OrderStatus::Invalid
        } else if state
            .authorizations
            .iter()
            .all(|a| a.status == AuthorizationStatus::Valid)
        {
            OrderStatus::Ready
        } else {
            OrderStatus::Pending
        }
    }

    fn order_resource(state: &FakeState) -> Order {
        let status = Self::order_status(state);
        Order {
            status,
            identifiers: state.identifiers.clone(),
            authorizations: state.authorizations.iter().map(|a| a.url.clone()).collect(),
            finalize: "https://ca.test/order/1/finalize".to_string(),
            certificate: (status == OrderStatus::Valid)
                .then(|| "https://ca.test/cert/1".to_string()),
            error: None,
        }
    }

    fn sign(&self, csr_der: &[u8]) -> String {
        let mut pem = String::from("-----BEGIN CERTIFICATE REQUEST-----\n");
        let encoded = STANDARD.encode(csr_der);
        for line in encoded.as_bytes().chunks(64) {
            pem.push_str(std::str::from_utf8(line).unwrap());
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE REQUEST-----\n");

        let mut csr = CertificateSigningRequestParams::from_pem(&pem).unwrap();
        let now = time::OffsetDateTime::now_utc();
        csr.params.not_before = now - time::Duration::hours(1);
        csr.params.not_after = now + time::Duration::days(self.validity_days);

        let issuer = Issuer::new(
            self.ca_params.clone(),
            KeyPair::from_pem(&self.ca_key_pem).unwrap(),
        );
        let leaf = csr.signed_by(&issuer).unwrap().pem();
        format!("{}{}", leaf, self.ca_pem)
    }
}

#[async_trait]
impl AcmeApi for FakeCa {
    async fn bind_account(&self, _contacts: &[String]) -> Result<AccountBinding, ClientError> {
        self.call();
        Ok(AccountBinding {
            url: "https://ca.test/acct/1".to_string(),
            created: false,
        })
    }

    fn key_authorization(&self, token: &str) -> String {
        format!("{}.{}", token, THUMBPRINT)
    }

    async fn new_order(&self, identifiers: &[Identifier]) -> Result<NewOrder, ClientError> {
        self.call();
        let mut state = self.state.lock();
        *state = FakeState {
            identifiers: identifiers.to_vec(),
            authorizations: identifiers
                .iter()
                .enumerate()
                .map(|(i, identifier)| FakeAuthorization {
                    url: format!("https://ca.test/authz/{}", i),
                    identifier: identifier.clone(),
                    token: format!("token{}", i),
                    status: AuthorizationStatus::Pending,
                    error: None,
                })
                .collect(),
            ..FakeState::default()
        };
        Ok(NewOrder {
            url: "https://ca.test/order/1".to_string(),
            order: Self::order_resource(&state),
        })
    }

    async fn authorization(&self, url: &str) -> Result<Fetched<Authorization>, ClientError> {
        self.call();
        let state = self.state.lock();
        let authz = state
            .authorizations
            .iter()
            .find(|a| a.url == url)
            .ok_or_else(|| ClientError::Status {
                url: url.to_string(),
                status: 404,
                body: String::new(),
            })?;

        let challenge_status = match authz.status {
            AuthorizationStatus::Valid => ChallengeStatus::Valid,
            AuthorizationStatus::Invalid => ChallengeStatus::Invalid,
            _ => ChallengeStatus::Pending,
        };
        Ok(Fetched {
            resource: Authorization {
                identifier: authz.identifier.clone(),
                status: authz.status,
                challenges: vec![Challenge {
                    kind: HTTP_01.to_string(),
                    url: format!("{}/http-01", authz.url),
                    token: authz.token.clone(),
                    status: challenge_status,
                    error: authz.error.clone(),
                }],
            },
            retry_after: Some(Duration::from_millis(1)),
        })
    }

    async fn challenge_ready(&self, url: &str) -> Result<Challenge, ClientError> {
        self.call();
        let mut state = self.state.lock();
        let FakeState {
            authorizations,
            validated,
            ..
        } = &mut *state;

        let authz = authorizations
            .iter_mut()
            .find(|a| format!("{}/http-01", a.url) == url)
            .ok_or_else(|| ClientError::Status {
                url: url.to_string(),
                status: 404,
                body: String::new(),
            })?;

        let expected = format!("{}.{}", authz.token, THUMBPRINT);
        let served = std::fs::read_to_string(self.challenge_file(&authz.token)).ok();
        let name = authz.identifier.value.clone();

        if served.as_deref() == Some(expected.as_str()) && !self.reject.contains(&name) {
            authz.status = AuthorizationStatus::Valid;
            validated.insert(name);
        } else {
            authz.status = AuthorizationStatus::Invalid;
            authz.error = Some(Problem {
                kind: Some("urn:ietf:params:acme:error:unauthorized".to_string()),
                detail: Some(format!(
                    "Invalid response from http://{}/.well-known/acme-challenge/{}",
                    name, authz.token
                )),
                status: Some(403),
                subproblems: Vec::new(),
            });
        }

        Ok(Challenge {
            kind: HTTP_01.to_string(),
            url: url.to_string(),
            token: authz.token.clone(),
            status: ChallengeStatus::Processing,
            error: None,
        })
    }

    async fn order(&self, _url: &str) -> Result<Fetched<Order>, ClientError> {
        self.call();
        Ok(Fetched::now(Self::order_resource(&self.state.lock())))
    }

    async fn finalize(&self, url: &str, csr_der: &[u8]) -> Result<Order, ClientError> {
        self.call();
        let chain = self.sign(csr_der);
        let mut state = self.state.lock();
        if Self::order_status(&state) != OrderStatus::Ready {
            return Err(ClientError::Status {
                url: url.to_string(),
                status: 403,
                body: "orderNotReady".to_string(),
            });
        }
        state.finalized = true;
        state.chain = Some(chain);
        Ok(Self::order_resource(&state))
    }

    async fn certificate(&self, url: &str) -> Result<String, ClientError> {
        self.call();
        self.state
            .lock()
            .chain
            .clone()
            .ok_or_else(|| ClientError::Status {
                url: url.to_string(),
                status: 404,
                body: String::new(),
            })
    }
}

/// Workspace for one test: a webroot and an install directory
pub struct Sandbox {
    _dir: tempfile::TempDir,
    pub webroot: PathBuf,
    pub install_dir: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let webroot = dir.path().join("www");
        let install_dir = dir.path().join("ssl");
        std::fs::create_dir_all(&webroot).unwrap();
        Self {
            _dir: dir,
            webroot,
            install_dir,
        }
    }

    pub fn installer(&self) -> Installer {
        Installer::new(&self.install_dir, None, None)
    }

    pub fn orchestrator(&self, names: &[&str], force: bool) -> Orchestrator {
        let request = CertificateRequest::new(names[0], names, "web").unwrap();
        Orchestrator::new(request, self.installer(), 30, force, fast_settings())
    }

    /// Challenge files still present in the webroot
    pub fn leftover_challenges(&self) -> Vec<String> {
        let dir = self.webroot.join(".well-known").join("acme-challenge");
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Contents of every installed file, for before/after comparisons
    pub fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
        let mut files: Vec<(String, Vec<u8>)> = match std::fs::read_dir(&self.install_dir) {
            Ok(entries) => entries
                .map(|e| {
                    let e = e.unwrap();
                    (
                        e.file_name().to_string_lossy().into_owned(),
                        std::fs::read(e.path()).unwrap(),
                    )
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        files
    }
}

pub fn fast_settings() -> EngineSettings {
    let policy = PollPolicy::new(
        Duration::from_millis(1),
        Duration::from_millis(5),
        Duration::from_secs(5),
    );
    EngineSettings {
        contacts: Vec::new(),
        validation: policy,
        finalization: policy,
        run_timeout: Some(Duration::from_secs(30)),
    }
}

pub fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}
