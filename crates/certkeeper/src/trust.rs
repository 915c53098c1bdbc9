//! CA root bootstrap.
//!
//! Private CAs (step-ca and friends) issue from a root the OS does not trust
//! yet. The root is loaded from a file or fetched over HTTP(S), placed in the
//! trust anchor directory when its content changed, and the OS trust store is
//! refreshed. The PEM is also handed to the ACME client so the first
//! directory request works regardless of the refresh.

use std::path::{Path, PathBuf};
use std::time::Duration;

use certkeeper_config::CertConfig;
use tracing::{debug, info};
use x509_parser::pem::Pem;

use crate::error::IssueError;

/// Where the root certificate comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSource {
    File(PathBuf),
    Url(String),
}

impl RootSource {
    /// `http://` and `https://` values are URLs, anything else a path
    pub fn parse(value: &str) -> Self {
        if value.starts_with("https://") || value.starts_with("http://") {
            RootSource::Url(value.to_string())
        } else {
            RootSource::File(PathBuf::from(value))
        }
    }
}

/// Installs a CA root into the OS trust store
#[derive(Debug, Clone)]
pub struct TrustBootstrap {
    source: RootSource,
    anchor_path: PathBuf,
    refresh_command: Option<String>,
}

impl TrustBootstrap {
    pub fn new(source: RootSource, anchor_dir: &Path, service: &str) -> Self {
        Self {
            source,
            anchor_path: anchor_dir.join(format!("certkeeper-{}.crt", service)),
            refresh_command: Some("update-ca-certificates".to_string()),
        }
    }

    /// Bootstrap described by the configuration, if a CA root is configured
    pub fn from_config(config: &CertConfig) -> Option<Self> {
        config.acme.ca_root.as_deref().map(|root| {
            Self::new(
                RootSource::parse(root),
                &config.acme.trust_store_dir,
                &config.service_name,
            )
        })
    }

    /// Replace the trust store refresh command; `None` skips the refresh
    pub fn with_refresh_command(mut self, command: Option<String>) -> Self {
        self.refresh_command = command;
        self
    }

    pub fn anchor_path(&self) -> &Path {
        &self.anchor_path
    }

    /// Load, install and return the root PEM
    pub async fn bootstrap(&self) -> Result<Vec<u8>, IssueError> {
        let pem = self.load().await?;
        self.install(&pem).await?;
        Ok(pem)
    }

    /// Read or download the root and check that it parses as X.509
    pub async fn load(&self) -> Result<Vec<u8>, IssueError> {
        let pem = match &self.source {
            RootSource::File(path) => tokio::fs::read(path).await.map_err(|e| {
                IssueError::io(format!("reading CA root {}", path.display()), e)
            })?,
            RootSource::Url(url) => download(url).await?,
        };
        validate_root(&pem)?;
        Ok(pem)
    }

    /// Write the anchor if it changed; returns whether it did
    pub async fn install(&self, pem: &[u8]) -> Result<bool, IssueError> {
        if let Ok(existing) = tokio::fs::read(&self.anchor_path).await {
            if existing == pem {
                debug!(anchor = %self.anchor_path.display(), "CA root already trusted");
                return Ok(false);
            }
        }

        if let Some(dir) = self.anchor_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| IssueError::io(format!("creating {}", dir.display()), e))?;
        }
        tokio::fs::write(&self.anchor_path, pem)
            .await
            .map_err(|e| {
                IssueError::io(format!("writing {}", self.anchor_path.display()), e)
            })?;
        info!(anchor = %self.anchor_path.display(), "Installed CA root");

        if let Some(command) = &self.refresh_command {
            refresh(command).await?;
        }
        Ok(true)
    }
}

async fn download(url: &str) -> Result<Vec<u8>, IssueError> {
    let failed = |e: reqwest::Error| IssueError::Configuration(format!("fetching CA root from {}: {}", url, e));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(failed)?;
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(failed)?;
    let body = response.bytes().await.map_err(failed)?;
    Ok(body.to_vec())
}

fn validate_root(pem: &[u8]) -> Result<(), IssueError> {
    let mut count = 0;
    for block in Pem::iter_from_buffer(pem) {
        let block =
            block.map_err(|e| IssueError::Configuration(format!("CA root is not PEM: {}", e)))?;
        block.parse_x509().map_err(|e| {
            IssueError::Configuration(format!("CA root is not an X.509 certificate: {}", e))
        })?;
        count += 1;
    }
    if count == 0 {
        return Err(IssueError::Configuration(
            "CA root contains no certificate".to_string(),
        ));
    }
    Ok(())
}

async fn refresh(command: &str) -> Result<(), IssueError> {
    let status = tokio::process::Command::new(command)
        .status()
        .await
        .map_err(|e| IssueError::io(format!("running {}", command), e))?;
    if !status.success() {
        return Err(IssueError::io(
            format!("running {}", command),
            std::io::Error::other(format!("exited with {}", status)),
        ));
    }
    debug!(command = %command, "Refreshed OS trust store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn root_pem() -> String {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn test_root_source_parse() {
        assert_eq!(
            RootSource::parse("https://ca.internal/roots.pem"),
            RootSource::Url("https://ca.internal/roots.pem".to_string())
        );
        assert_eq!(
            RootSource::parse("/etc/certkeeper/root.pem"),
            RootSource::File(PathBuf::from("/etc/certkeeper/root.pem"))
        );
    }

    #[tokio::test]
    async fn test_install_only_when_changed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root.pem");
        std::fs::write(&root, root_pem()).unwrap();

        let bootstrap = TrustBootstrap::new(
            RootSource::File(root),
            &dir.path().join("anchors"),
            "web",
        )
        .with_refresh_command(None);

        let pem = bootstrap.load().await.unwrap();
        assert!(bootstrap.install(&pem).await.unwrap());
        assert!(!bootstrap.install(&pem).await.unwrap());
        assert_eq!(std::fs::read(bootstrap.anchor_path()).unwrap(), pem);
    }

    #[tokio::test]
    async fn test_rejects_non_certificate() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root.pem");
        std::fs::write(&root, "not a certificate").unwrap();

        let bootstrap =
            TrustBootstrap::new(RootSource::File(root), dir.path(), "web").with_refresh_command(None);
        let err = bootstrap.bootstrap().await.unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(!bootstrap.anchor_path().exists());
    }

    #[tokio::test]
    async fn test_downloads_root() {
        let server = MockServer::start().await;
        let pem = root_pem();
        Mock::given(method("GET"))
            .and(path("/roots.pem"))
            .respond_with(ResponseTemplate::new(200).set_body_string(pem.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let bootstrap = TrustBootstrap::new(
            RootSource::parse(&format!("{}/roots.pem", server.uri())),
            dir.path(),
            "web",
        )
        .with_refresh_command(None);

        assert_eq!(bootstrap.bootstrap().await.unwrap(), pem.into_bytes());
    }

    #[tokio::test]
    async fn test_failed_refresh_is_io_error() {
        let dir = TempDir::new().unwrap();
        let bootstrap = TrustBootstrap::new(
            RootSource::File(dir.path().join("unused")),
            dir.path(),
            "web",
        )
        .with_refresh_command(Some("false".to_string()));

        let err = bootstrap.install(root_pem().as_bytes()).await.unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}
