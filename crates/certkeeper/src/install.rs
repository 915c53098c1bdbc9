//! Certificate file installation
//!
//! Writes the five outputs of a run into the install directory:
//!
//! ```text
//! install_dir/
//! ├── {service}.key            # Private key (0600)
//! ├── {service}.csr            # Signing request
//! ├── {service}.crt            # Leaf certificate
//! ├── {service}-chain.crt      # Intermediates
//! └── {service}-fullchain.crt  # Leaf + intermediates
//! ```
//!
//! Each file is compared byte for byte with what is on disk and only
//! rewritten when it differs. Writes go to a temporary file in the same
//! directory which is renamed over the target, so a reader never observes a
//! half-written file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use certkeeper_config::InstallConfig;
use tracing::{debug, info, trace};

use crate::acme::IssuedChain;
use crate::error::IssueError;

/// One of the files produced by a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Key,
    Csr,
    Certificate,
    Chain,
    FullChain,
}

impl OutputKind {
    /// Installation order
    ///
    /// The certificate goes last: until it is replaced, the installed
    /// certificate does not match a newly written key.
    pub const ALL: [OutputKind; 5] = [
        OutputKind::Key,
        OutputKind::Csr,
        OutputKind::Chain,
        OutputKind::FullChain,
        OutputKind::Certificate,
    ];

    pub fn file_name(self, service: &str) -> String {
        match self {
            OutputKind::Key => format!("{}.key", service),
            OutputKind::Csr => format!("{}.csr", service),
            OutputKind::Certificate => format!("{}.crt", service),
            OutputKind::Chain => format!("{}-chain.crt", service),
            OutputKind::FullChain => format!("{}-fullchain.crt", service),
        }
    }

    /// Unix permission bits
    pub fn mode(self) -> u32 {
        match self {
            OutputKind::Key => 0o600,
            _ => 0o644,
        }
    }
}

/// Contents of the five outputs
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateFiles {
    key: String,
    csr: String,
    certificate: String,
    chain: String,
    full_chain: String,
}

impl CertificateFiles {
    pub fn new(key_pem: String, csr_pem: String, issued: IssuedChain) -> Self {
        Self {
            key: key_pem,
            csr: csr_pem,
            certificate: issued.leaf,
            chain: issued.chain,
            full_chain: issued.full_chain,
        }
    }

    pub fn content(&self, kind: OutputKind) -> &[u8] {
        match kind {
            OutputKind::Key => self.key.as_bytes(),
            OutputKind::Csr => self.csr.as_bytes(),
            OutputKind::Certificate => self.certificate.as_bytes(),
            OutputKind::Chain => self.chain.as_bytes(),
            OutputKind::FullChain => self.full_chain.as_bytes(),
        }
    }
}

impl std::fmt::Debug for CertificateFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateFiles")
            .field("key", &"<redacted>")
            .field("certificate_len", &self.certificate.len())
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// What an install did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub written: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
}

impl InstallReport {
    /// Whether any file was replaced
    pub fn changed(&self) -> bool {
        !self.written.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Ownership {
    uid: Option<nix::unistd::Uid>,
    gid: Option<nix::unistd::Gid>,
}

/// Installs certificate files into one directory
#[derive(Debug, Clone)]
pub struct Installer {
    dir: PathBuf,
    owner: Option<String>,
    group: Option<String>,
}

impl Installer {
    pub fn new(dir: impl Into<PathBuf>, owner: Option<String>, group: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            owner,
            group,
        }
    }

    pub fn from_config(config: &InstallConfig) -> Self {
        Self::new(&config.dir, config.owner.clone(), config.group.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Target path of one output
    pub fn path_for(&self, service: &str, kind: OutputKind) -> PathBuf {
        self.dir.join(kind.file_name(service))
    }

    /// Install every output that differs from what is on disk
    ///
    /// On failure the error lists the files that were already replaced;
    /// files not yet reached keep their previous content.
    pub fn install(
        &self,
        service: &str,
        files: &CertificateFiles,
    ) -> Result<InstallReport, IssueError> {
        let mut report = InstallReport::default();

        let result = self.install_into(service, files, &mut report);
        if let Err(source) = result {
            return Err(IssueError::Install {
                written: report.written,
                source,
            });
        }

        if report.changed() {
            info!(
                service = %service,
                dir = %self.dir.display(),
                written = report.written.len(),
                "Installed certificate files"
            );
        } else {
            debug!(service = %service, "Installed files already up to date");
        }
        Ok(report)
    }

    fn install_into(
        &self,
        service: &str,
        files: &CertificateFiles,
        report: &mut InstallReport,
    ) -> io::Result<()> {
        let ownership = self.resolve_ownership()?;
        self.ensure_dir()?;

        for kind in OutputKind::ALL {
            let path = self.path_for(service, kind);
            let content = files.content(kind);

            if same_content(&path, content) {
                trace!(path = %path.display(), "Unchanged");
                report.unchanged.push(path);
                continue;
            }

            write_atomic(&self.dir, &path, content, kind.mode(), ownership)?;
            debug!(path = %path.display(), "Wrote certificate file");
            report.written.push(path);
        }
        Ok(())
    }

    fn ensure_dir(&self) -> io::Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o755))?;
            }
        }
        Ok(())
    }

    fn resolve_ownership(&self) -> io::Result<Ownership> {
        let uid = match self.owner.as_deref() {
            Some(name) => Some(
                nix::unistd::User::from_name(name)
                    .map_err(io::Error::from)?
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, format!("unknown user '{}'", name))
                    })?
                    .uid,
            ),
            None => None,
        };
        let gid = match self.group.as_deref() {
            Some(name) => Some(
                nix::unistd::Group::from_name(name)
                    .map_err(io::Error::from)?
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, format!("unknown group '{}'", name))
                    })?
                    .gid,
            ),
            None => None,
        };
        Ok(Ownership { uid, gid })
    }
}

fn same_content(path: &Path, content: &[u8]) -> bool {
    match fs::read(path) {
        Ok(existing) => existing == content,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "Cannot read installed file, rewriting");
            }
            false
        }
    }
}

/// Write via a temporary file that is removed on any failure
fn write_atomic(
    dir: &Path,
    path: &Path,
    content: &[u8],
    mode: u32,
    ownership: Ownership,
) -> io::Result<()> {
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(content)?;
    file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(file.path(), fs::Permissions::from_mode(mode))?;
    }

    if ownership.uid.is_some() || ownership.gid.is_some() {
        nix::unistd::chown(file.path(), ownership.uid, ownership.gid).map_err(io::Error::from)?;
    }

    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn files(tag: &str) -> CertificateFiles {
        CertificateFiles::new(
            format!("key-{}", tag),
            format!("csr-{}", tag),
            IssuedChain {
                leaf: format!("leaf-{}", tag),
                chain: format!("chain-{}", tag),
                full_chain: format!("leaf-{}chain-{}", tag, tag),
            },
        )
    }

    #[test]
    fn test_install_writes_five_files() {
        let dir = TempDir::new().unwrap();
        let installer = Installer::new(dir.path().join("ssl"), None, None);

        let report = installer.install("web", &files("a")).unwrap();
        assert!(report.changed());
        assert_eq!(report.written.len(), 5);

        for kind in OutputKind::ALL {
            let path = installer.path_for("web", kind);
            assert!(path.exists(), "missing {}", path.display());
        }
        assert_eq!(
            fs::read_to_string(installer.path_for("web", OutputKind::FullChain)).unwrap(),
            "leaf-achain-a"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let key_mode = fs::metadata(installer.path_for("web", OutputKind::Key))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(key_mode, 0o600);
            let crt_mode = fs::metadata(installer.path_for("web", OutputKind::Certificate))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(crt_mode, 0o644);
        }
    }

    #[test]
    fn test_reinstall_identical_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let installer = Installer::new(dir.path(), None, None);

        installer.install("web", &files("a")).unwrap();
        let report = installer.install("web", &files("a")).unwrap();

        assert!(!report.changed());
        assert_eq!(report.unchanged.len(), 5);
    }

    #[test]
    fn test_only_differing_files_rewritten() {
        let dir = TempDir::new().unwrap();
        let installer = Installer::new(dir.path(), None, None);
        installer.install("web", &files("a")).unwrap();

        let mut next = files("a");
        next.chain = "chain-b".to_string();
        let report = installer.install("web", &next).unwrap();

        assert_eq!(
            report.written,
            vec![installer.path_for("web", OutputKind::Chain)]
        );
    }

    #[test]
    fn test_failure_reports_written_files_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let installer = Installer::new(dir.path(), None, None);

        // A directory where the chain belongs makes the rename fail.
        fs::create_dir(installer.path_for("web", OutputKind::Chain)).unwrap();

        let err = installer.install("web", &files("a")).unwrap_err();
        match err {
            IssueError::Install { written, .. } => {
                assert_eq!(
                    written,
                    vec![
                        installer.path_for("web", OutputKind::Key),
                        installer.path_for("web", OutputKind::Csr),
                    ]
                );
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries.len(), 3, "leftover files: {:?}", entries);
        assert!(!installer.path_for("web", OutputKind::FullChain).exists());
        assert!(!installer.path_for("web", OutputKind::Certificate).exists());
    }

    #[test]
    fn test_unknown_owner_is_install_error() {
        let dir = TempDir::new().unwrap();
        let installer = Installer::new(
            dir.path(),
            Some("certkeeper-no-such-user".to_string()),
            None,
        );

        let err = installer.install("web", &files("a")).unwrap_err();
        assert_eq!(err.kind(), "install");
        assert!(!installer.path_for("web", OutputKind::Key).exists());
    }

    #[test]
    fn test_certificate_is_written_last() {
        assert_eq!(OutputKind::ALL.last(), Some(&OutputKind::Certificate));
    }

    #[test]
    fn test_file_names() {
        assert_eq!(OutputKind::Chain.file_name("web"), "web-chain.crt");
        assert_eq!(OutputKind::FullChain.file_name("web"), "web-fullchain.crt");
        assert_eq!(OutputKind::Key.mode(), 0o600);
    }
}
