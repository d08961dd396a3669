//! Periodic policy reloading.
//!
//! The policy file is re-read on a fixed interval and, when its contents
//! changed, compiled and swapped into the limiter. A document that fails to
//! parse or validate is logged and ignored; the previous registry stays in
//! force.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::Result;
use crate::ratelimit::{Limiter, PolicyDocument, PolicyRegistry, WindowStore};

/// Tracks the last document applied from one file.
#[derive(Debug)]
pub struct PolicyReloader {
    path: PathBuf,
    current: Option<PolicyDocument>,
}

impl PolicyReloader {
    /// `current` is the document already in force, if known.
    pub fn new(path: impl Into<PathBuf>, current: Option<PolicyDocument>) -> Self {
        Self {
            path: path.into(),
            current,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file and swap the registry if the document changed.
    ///
    /// Returns whether a new registry was installed.
    pub async fn reload_once<S: WindowStore>(&mut self, limiter: &Limiter<S>) -> Result<bool> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let document = PolicyDocument::from_yaml(&contents)?;

        if self.current.as_ref() == Some(&document) {
            debug!(path = %self.path.display(), "Policy document unchanged");
            return Ok(false);
        }

        let registry = PolicyRegistry::from_document(&document)?;
        limiter.reload(registry);
        self.current = Some(document);
        Ok(true)
    }
}

/// Spawn a task that reloads `path` into `limiter` every `interval`.
pub fn spawn_policy_reloader<S>(
    limiter: Arc<Limiter<S>>,
    mut reloader: PolicyReloader,
    interval: Duration,
) -> JoinHandle<()>
where
    S: WindowStore + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; startup already loaded the file.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = reloader.reload_once(&limiter).await {
                error!(
                    error = %e,
                    path = %reloader.path().display(),
                    "Policy reload failed, keeping previous policies"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ratelimit::{AdmissionRequest, GuardConfig};
    use crate::store::MemoryWindowStore;
    use http::Method;

    fn temp_policy_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("ratewarden-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn limiter() -> Limiter<MemoryWindowStore> {
        let clock = Arc::new(MockClock::new(0));
        Limiter::new(
            PolicyRegistry::with_defaults(),
            MemoryWindowStore::with_clock(clock.clone()),
            GuardConfig::default(),
            clock,
        )
    }

    fn api_request() -> AdmissionRequest {
        AdmissionRequest::new("/api/x", Method::GET)
    }

    #[tokio::test]
    async fn test_reload_installs_changed_document() {
        let path = temp_policy_file("routes:\n  - route: /api\n    max_requests: 7\n");
        let limiter = limiter();
        let mut reloader = PolicyReloader::new(&path, None);

        assert!(tokio_test::assert_ok!(reloader.reload_once(&limiter).await));
        assert_eq!(limiter.policy_for(&api_request()).max_requests(), 7);

        // Same contents: nothing to do.
        assert!(!reloader.reload_once(&limiter).await.unwrap());

        std::fs::write(&path, "routes:\n  - route: /api\n    max_requests: 3\n").unwrap();
        assert!(reloader.reload_once(&limiter).await.unwrap());
        assert_eq!(limiter.policy_for(&api_request()).max_requests(), 3);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_invalid_document_keeps_previous_registry() {
        let path = temp_policy_file("routes:\n  - route: /api\n    max_requests: 7\n");
        let limiter = limiter();
        let mut reloader = PolicyReloader::new(&path, None);
        reloader.reload_once(&limiter).await.unwrap();

        std::fs::write(&path, "routes:\n  - route: /api\n    max_requests: 0\n").unwrap();
        tokio_test::assert_err!(reloader.reload_once(&limiter).await);
        assert_eq!(limiter.policy_for(&api_request()).max_requests(), 7);

        std::fs::write(&path, "routes: [ unterminated").unwrap();
        assert!(reloader.reload_once(&limiter).await.is_err());
        assert_eq!(limiter.policy_for(&api_request()).max_requests(), 7);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_spawned_reloader_picks_up_changes() {
        let path = temp_policy_file("routes:\n  - route: /api\n    max_requests: 7\n");
        let limiter = Arc::new(limiter());
        let handle = spawn_policy_reloader(
            Arc::clone(&limiter),
            PolicyReloader::new(&path, None),
            Duration::from_millis(20),
        );

        let mut seen = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if limiter.policy_for(&api_request()).max_requests() == 7 {
                seen = true;
                break;
            }
        }
        handle.abort();
        std::fs::remove_file(&path).unwrap();
        assert!(seen, "reloader never installed the document");
    }
}
