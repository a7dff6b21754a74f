use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use tracing::{info, warn};

use super::{DirectorySnapshot, Scan, ScanError};
use crate::{
    storage::Storage,
    system::{self, host_restart_command, HostInfo, Restarter},
    AnyResult,
};

/// Applications whose tree changed since the previous snapshot.
#[derive(Debug)]
pub struct DeploymentChange {
    pub applications: Vec<String>,
}

/// Watches the deployment directory (one subdirectory per application) and
/// restarts the managed service through the host init system when an
/// application is deployed, redeployed or removed.
///
/// The new snapshot is stored the moment a change is detected, before the
/// restart runs; a failed restart is reported but never replayed against an
/// unchanged tree on the next tick.
pub struct DeploymentScanner<R> {
    root: PathBuf,
    service_unit: String,
    restarter: R,
    storage: Arc<dyn Storage>,
    snapshot: DirectorySnapshot,
    // Detected once; the host does not change while the process runs.
    host: Option<HostInfo>,
}

impl<R: Restarter> DeploymentScanner<R> {
    pub fn new(
        root: impl Into<PathBuf>,
        service_unit: impl Into<String>,
        restarter: R,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, ScanError> {
        let root = root.into();
        let snapshot = DirectorySnapshot::capture(&root)?;
        Ok(Self {
            root,
            service_unit: service_unit.into(),
            restarter,
            storage,
            snapshot,
            host: None,
        })
    }

    fn host(&mut self) -> HostInfo {
        self.host.get_or_insert_with(system::detect).clone()
    }
}

impl<R: Restarter> Scan for DeploymentScanner<R> {
    type Change = DeploymentChange;

    fn describe(&self) -> &str {
        "deployment"
    }

    fn scan(&mut self) -> Result<Option<Self::Change>, ScanError> {
        let fresh = DirectorySnapshot::capture(&self.root)?;
        let applications = self.snapshot.changed_applications(&fresh);
        if applications.is_empty() {
            return Ok(None);
        }
        self.snapshot = fresh;
        Ok(Some(DeploymentChange { applications }))
    }

    async fn act(&mut self, change: DeploymentChange) -> AnyResult<()> {
        for application in &change.applications {
            let digest = self.snapshot.application_digest(application);
            self.storage.set(
                &format!("deployment/{application}"),
                Bytes::from(digest),
                &["deployment".to_string(), application.clone()],
                None,
            );
        }
        info!(
            "deployment change in {:?}, restarting {}",
            change.applications, self.service_unit
        );

        let host = self.host();
        match host_restart_command(&host) {
            Some(command) => {
                self.restarter.restart(command, &self.service_unit)?;
                Ok(())
            }
            None => {
                warn!("host distribution unknown, skipping restart of {}", self.service_unit);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        fs,
        rc::Rc,
        sync::Arc,
    };

    use tempfile::TempDir;

    use super::DeploymentScanner;
    use crate::{
        scanner::{Scan, ScanDriver},
        storage::{MemoryStore, Storage},
        system::{RestartCommand, RestartError, Restarter},
    };

    #[derive(Clone, Default)]
    struct RecordingRestarter {
        invocations: Rc<RefCell<Vec<String>>>,
        fail: Rc<Cell<bool>>,
    }

    impl Restarter for RecordingRestarter {
        fn restart(&self, command: RestartCommand, unit: &str) -> Result<(), RestartError> {
            self.invocations
                .borrow_mut()
                .push(command.command_line(unit));
            if self.fail.get() {
                return Err(RestartError::Spawn {
                    command: command.command_line(unit),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no init system"),
                });
            }
            Ok(())
        }
    }

    fn scanner_in(
        dir: &TempDir,
    ) -> (DeploymentScanner<RecordingRestarter>, RecordingRestarter, Arc<MemoryStore>) {
        let restarter = RecordingRestarter::default();
        let storage = Arc::new(MemoryStore::default());
        let mut scanner = DeploymentScanner::new(
            dir.path(),
            "hearth",
            restarter.clone(),
            storage.clone(),
        )
        .unwrap();
        // pin the host so the tests do not depend on the machine they run on
        scanner.host = Some(crate::system::HostInfo {
            distribution: Some(crate::system::Distribution::Debian),
            version: Some("8.3".to_string()),
        });
        (scanner, restarter, storage)
    }

    #[test]
    fn quiet_tree_never_reports_a_change() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("demo")).unwrap();
        fs::write(dir.path().join("demo/app.conf"), b"v1").unwrap();

        let (mut scanner, _, _) = scanner_in(&dir);
        assert!(scanner.scan().unwrap().is_none());
        assert!(scanner.scan().unwrap().is_none());
    }

    #[monoio::test(timer_enabled = true)]
    async fn change_triggers_one_restart() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("demo")).unwrap();

        let (scanner, restarter, storage) = scanner_in(&dir);
        let mut driver = ScanDriver::new(scanner, std::time::Duration::from_secs(1));

        fs::write(dir.path().join("demo/app.conf"), b"v1").unwrap();
        driver.tick().await;
        assert_eq!(restarter.invocations.borrow().len(), 1);
        assert!(storage.get("deployment/demo").is_some());

        // same tree again: no further action
        driver.tick().await;
        assert_eq!(restarter.invocations.borrow().len(), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn failed_restart_still_advances_the_snapshot() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("demo")).unwrap();

        let (scanner, restarter, _) = scanner_in(&dir);
        restarter.fail.set(true);
        let mut driver = ScanDriver::new(scanner, std::time::Duration::from_secs(1));

        fs::write(dir.path().join("demo/app.conf"), b"v1").unwrap();
        driver.tick().await;
        assert_eq!(restarter.invocations.borrow().len(), 1);

        // the tree did not change again: the failed action is not replayed
        driver.tick().await;
        assert_eq!(restarter.invocations.borrow().len(), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn digest_lands_in_storage_tagged_by_application() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("demo")).unwrap();
        let (mut scanner, _, storage) = scanner_in(&dir);

        fs::write(dir.path().join("demo/app.conf"), b"v1").unwrap();
        let change = scanner.scan().unwrap().unwrap();
        assert_eq!(change.applications, vec!["demo".to_string()]);

        scanner.act(change).await.unwrap();
        assert_eq!(storage.get_by_tag("demo").len(), 1);
        assert_eq!(storage.flush_by_tag("deployment"), 1);
    }
}
