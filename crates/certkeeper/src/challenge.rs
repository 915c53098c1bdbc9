//! HTTP-01 challenge publication
//!
//! The CA validates an http-01 challenge by fetching
//! `/.well-known/acme-challenge/<token>` from every identifier. A
//! [`ChallengePublisher`] makes that path return the key authorization;
//! [`ChallengeGuard`] tracks what was published so it is always removed
//! again, whether the order succeeds, fails or is cancelled.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Makes challenge responses reachable by the CA
pub trait ChallengePublisher: Send + Sync {
    /// Serve `key_authorization` for `token`
    fn publish(&self, token: &str, key_authorization: &str) -> io::Result<()>;

    /// Stop serving `token`; an already absent token is not an error
    fn unpublish(&self, token: &str) -> io::Result<()>;
}

/// Token from a challenge request path, if the path is one
pub fn extract_token(path: &str) -> Option<&str> {
    path.strip_prefix(ACME_CHALLENGE_PREFIX)
}

/// Tokens are base64url; anything else could escape the challenge directory.
fn check_token(token: &str) -> io::Result<()> {
    let valid = !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid challenge token {:?}", token),
        ))
    }
}

/// Publishes challenge files below a web server's document root
#[derive(Debug, Clone)]
pub struct WebrootPublisher {
    webroot: PathBuf,
}

impl WebrootPublisher {
    pub fn new(webroot: impl Into<PathBuf>) -> Self {
        Self {
            webroot: webroot.into(),
        }
    }

    /// `webroot/.well-known/acme-challenge`
    pub fn challenge_dir(&self) -> PathBuf {
        self.webroot.join(".well-known").join("acme-challenge")
    }

    fn token_path(&self, token: &str) -> PathBuf {
        self.challenge_dir().join(token)
    }

    fn ensure_dir(&self) -> io::Result<PathBuf> {
        let dir = self.challenge_dir();
        fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            set_mode(&self.webroot.join(".well-known"), 0o755)?;
            set_mode(&dir, 0o755)?;
        }

        Ok(dir)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

impl ChallengePublisher for WebrootPublisher {
    fn publish(&self, token: &str, key_authorization: &str) -> io::Result<()> {
        check_token(token)?;
        let dir = self.ensure_dir()?;

        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(key_authorization.as_bytes())?;
        file.as_file().sync_all()?;

        #[cfg(unix)]
        set_mode(file.path(), 0o644)?;

        let path = self.token_path(token);
        file.persist(&path).map_err(|e| e.error)?;

        debug!(token = %token, path = %path.display(), "Published HTTP-01 challenge");
        Ok(())
    }

    fn unpublish(&self, token: &str) -> io::Result<()> {
        check_token(token)?;
        let path = self.token_path(token);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(token = %token, "Removed HTTP-01 challenge");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(token = %token, "Challenge file already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// In-memory publisher for callers that answer challenge requests themselves
///
/// Clones share state, so one handle can publish while another serves.
#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    challenges: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key authorization for a request path, if it is a pending challenge
    pub fn response_for_path(&self, path: &str) -> Option<String> {
        extract_token(path).and_then(|token| self.get_response(token))
    }

    /// Key authorization for `token`
    pub fn get_response(&self, token: &str) -> Option<String> {
        self.challenges.lock().get(token).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.lock().len()
    }
}

impl ChallengePublisher for MemoryPublisher {
    fn publish(&self, token: &str, key_authorization: &str) -> io::Result<()> {
        check_token(token)?;
        self.challenges
            .lock()
            .insert(token.to_string(), key_authorization.to_string());
        Ok(())
    }

    fn unpublish(&self, token: &str) -> io::Result<()> {
        self.challenges.lock().remove(token);
        Ok(())
    }
}

/// Removes every challenge it published, at the latest when dropped
pub struct ChallengeGuard<'a, P: ChallengePublisher + ?Sized> {
    publisher: &'a P,
    tokens: Vec<String>,
}

impl<'a, P: ChallengePublisher + ?Sized> ChallengeGuard<'a, P> {
    pub fn new(publisher: &'a P) -> Self {
        Self {
            publisher,
            tokens: Vec::new(),
        }
    }

    /// Publish and remember the token for cleanup
    pub fn publish(&mut self, token: &str, key_authorization: &str) -> io::Result<()> {
        // Recorded first: a failed publish may still have left a file behind.
        self.tokens.push(token.to_string());
        self.publisher.publish(token, key_authorization)
    }

    /// Tokens currently published
    pub fn published(&self) -> &[String] {
        &self.tokens
    }

    /// Unpublish everything; returns how many removals failed
    pub fn cleanup(&mut self) -> usize {
        let mut failures = 0;
        for token in self.tokens.drain(..) {
            if let Err(e) = self.publisher.unpublish(&token) {
                warn!(token = %token, error = %e, "Failed to remove HTTP-01 challenge");
                failures += 1;
            }
        }
        failures
    }
}

impl<P: ChallengePublisher + ?Sized> Drop for ChallengeGuard<'_, P> {
    fn drop(&mut self) {
        if !self.tokens.is_empty() {
            self.cleanup();
        }
    }
}
