use std::{
    collections::{HashMap, HashSet},
    io,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use bytes::Bytes;
use hearth_core::{
    config::ListenerConfig,
    orchestrator::{Receiver, ServiceCommand},
    scanner::{Scan, ScanError},
    storage::Storage,
    util::file_read_sync,
    AnyResult,
};
use service_async::AsyncMakeService;
use tracing::{error, info};

use super::{Config, ServerConfig, ServiceConfigMap};

/// Polls the config file and drives the receiver through two-stage service
/// deployment when the file changes.
///
/// The stored copy of the file advances as soon as a change is seen, so a
/// config that fails to parse or deploy is reported once per edit rather
/// than on every tick. The active per-service config is cached in storage,
/// tagged by service name, and flushed when a service is deleted.
pub struct ConfigScanner<F, LF, FP, LFP>
where
    FP: Fn(&ServerConfig) -> F,
    LFP: Fn(&ListenerConfig) -> io::Result<LF>,
{
    path: PathBuf,
    receiver: Receiver<F, LF>,
    storage: Arc<dyn Storage>,
    online_content: Vec<u8>,
    online_services: ServiceConfigMap,
    server_factory_provider: FP,
    listener_factory_provider: LFP,
}

impl<F, LF, FP, LFP> ConfigScanner<F, LF, FP, LFP>
where
    F: AsyncMakeService + Clone + Send + 'static,
    LF: Clone + Send + 'static,
    FP: Fn(&ServerConfig) -> F,
    LFP: Fn(&ListenerConfig) -> io::Result<LF>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: impl Into<PathBuf>,
        receiver: Receiver<F, LF>,
        storage: Arc<dyn Storage>,
        online_content: Vec<u8>,
        online_services: ServiceConfigMap,
        server_factory_provider: FP,
        listener_factory_provider: LFP,
    ) -> Self {
        Self {
            path: path.into(),
            receiver,
            storage,
            online_content,
            online_services,
            server_factory_provider,
            listener_factory_provider,
        }
    }

    async fn reload_services(&self, new_services: &ServiceConfigMap) -> AnyResult<()> {
        let patches = Self::diff(&self.online_services, new_services);

        // Build listener factories up front so an unusable bind target
        // aborts the reload before anything is staged on the workers.
        let mut listeners = HashMap::new();
        for patch in &patches {
            if let Patch::Insert {
                key,
                listener_config,
                ..
            } = patch
            {
                let listener = (self.listener_factory_provider)(listener_config)
                    .with_context(|| format!("building listener for {key}"))?;
                listeners.insert(key.clone(), listener);
            }
        }

        match self.prepare(&patches).await {
            Ok(_) => {
                self.commit(&patches, listeners).await?;
                Ok(())
            }
            Err(e) => {
                error!("config reload failed at prepare stage: {e}, aborting");
                self.abort(&patches).await;
                Err(e)
            }
        }
    }

    fn diff(old_services: &ServiceConfigMap, new_services: &ServiceConfigMap) -> Vec<Patch> {
        let mut patches = Vec::new();

        let old_keys = old_services.keys().collect::<HashSet<_>>();
        let new_keys = new_services.keys().collect::<HashSet<_>>();
        for key in old_keys.union(&new_keys) {
            let patch = match (old_keys.contains(*key), new_keys.contains(*key)) {
                (true, true) => {
                    // TODO: skip services whose configuration did not change
                    let new_config = &new_services[*key];
                    Patch::Update {
                        key: key.to_string(),
                        server_config: new_config.server.clone(),
                    }
                }
                (true, false) => Patch::Delete {
                    key: key.to_string(),
                },
                (false, true) => {
                    let new_config = &new_services[*key];
                    Patch::Insert {
                        key: key.to_string(),
                        listener_config: new_config.listener.clone(),
                        server_config: new_config.server.clone(),
                    }
                }
                (false, false) => unreachable!("key comes from the union of both maps"),
            };
            patches.push(patch);
        }
        patches
    }

    async fn prepare(&self, patches: &[Patch]) -> AnyResult<()> {
        for patch in patches {
            match patch {
                Patch::Insert {
                    key, server_config, ..
                }
                | Patch::Update {
                    key, server_config, ..
                } => {
                    self.receiver
                        .dispatch(ServiceCommand::Precommit(
                            Arc::new(key.to_string()),
                            (self.server_factory_provider)(server_config),
                        ))
                        .await
                        .err()?;
                }
                Patch::Delete { .. } => {
                    // nothing to do at prepare stage
                }
            }
        }
        Ok(())
    }

    async fn commit(&self, patches: &[Patch], mut listeners: HashMap<String, LF>) -> AnyResult<()> {
        for patch in patches {
            match patch {
                Patch::Insert { key, .. } => {
                    let listener = listeners
                        .remove(key)
                        .expect("listener prepared for every insert");
                    self.receiver
                        .dispatch(ServiceCommand::Commit(Arc::new(key.to_string()), listener))
                        .await
                        .err()?;
                }
                Patch::Update { key, .. } => {
                    self.receiver
                        .dispatch(ServiceCommand::Update(Arc::new(key.to_string())))
                        .await
                        .err()?;
                }
                Patch::Delete { key } => {
                    self.receiver
                        .dispatch(ServiceCommand::Remove(Arc::new(key.to_string())))
                        .await
                        .err()?;
                    self.storage.flush_by_tag(key);
                }
            }
        }
        Ok(())
    }

    async fn abort(&self, patches: &[Patch]) {
        for patch in patches {
            match patch {
                Patch::Insert { key, .. } | Patch::Update { key, .. } => {
                    // discard errors due to partial pre-commits
                    let _ = self
                        .receiver
                        .dispatch(ServiceCommand::Abort(Arc::new(key.to_string())))
                        .await;
                }
                Patch::Delete { .. } => {
                    // nothing to do at abort stage
                }
            }
        }
    }
}

impl<F, LF, FP, LFP> Scan for ConfigScanner<F, LF, FP, LFP>
where
    F: AsyncMakeService + Clone + Send + 'static,
    LF: Clone + Send + 'static,
    FP: Fn(&ServerConfig) -> F,
    LFP: Fn(&ListenerConfig) -> io::Result<LF>,
{
    type Change = Vec<u8>;

    fn describe(&self) -> &str {
        "config"
    }

    fn scan(&mut self) -> Result<Option<Self::Change>, ScanError> {
        let latest = file_read_sync(&self.path).map_err(|source| ScanError {
            path: self.path.clone(),
            source,
        })?;
        if latest == self.online_content {
            return Ok(None);
        }
        self.online_content = latest.clone();
        Ok(Some(latest))
    }

    async fn act(&mut self, content: Vec<u8>) -> AnyResult<()> {
        info!("config change detected, reloading");
        let new_services = Config::parse_service_config(&content)?;
        self.reload_services(&new_services).await?;

        for (key, service_config) in &new_services {
            let payload = serde_json::to_vec(service_config)?;
            self.storage.set(
                &format!("config/{key}"),
                Bytes::from(payload),
                &["config".to_string(), key.clone()],
                None,
            );
        }
        self.online_services = new_services;
        info!("config reload success");
        Ok(())
    }
}

enum Patch {
    Insert {
        key: String,
        listener_config: ListenerConfig,
        server_config: ServerConfig,
    },
    Update {
        key: String,
        server_config: ServerConfig, // listener dynamic update not supported yet
    },
    Delete {
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use hearth_core::{
        config::RuntimeConfig,
        orchestrator::Receiver,
        scanner::Scan,
        storage::{MemoryStore, Storage},
    };
    use tempfile::TempDir;

    use super::{ConfigScanner, Patch};
    use crate::{
        config::Config,
        factory::{listener_factory, server_factory, AppFactory},
    };

    const BASE_CONFIG: &str = "
        [servers.echo]
        name = 'echo'
        listener = { socket_addr = '127.0.0.1:8080' }
        protocol = 'echo'
    ";

    const TWO_SERVER_CONFIG: &str = "
        [servers.echo]
        name = 'echo'
        listener = { socket_addr = '127.0.0.1:8080' }
        protocol = 'echo'

        [servers.kv]
        name = 'kv'
        listener = { socket_addr = '127.0.0.1:8081' }
        protocol = 'cache'
    ";

    fn scanner_for(
        dir: &TempDir,
        content: &str,
    ) -> (
        ConfigScanner<
            AppFactory,
            hearth_core::listener::ListenerBuilder,
            impl Fn(&crate::config::ServerConfig) -> AppFactory,
            impl Fn(&hearth_core::config::ListenerConfig) -> std::io::Result<hearth_core::listener::ListenerBuilder>,
        >,
        Arc<MemoryStore>,
    ) {
        let path = dir.path().join("hearth.toml");
        fs::write(&path, content).unwrap();

        let storage = Arc::new(MemoryStore::default());
        let storage_dyn: Arc<dyn Storage> = storage.clone();
        let storage_for_factories = storage_dyn.clone();
        // a receiver with no started workers accepts commands trivially,
        // which is all the reload bookkeeping needs here
        let receiver = Receiver::new(RuntimeConfig {
            worker_threads: 0,
            cpu_affinity: false,
            ..Default::default()
        });
        let scanner = ConfigScanner::new(
            path,
            receiver,
            storage_dyn,
            Vec::new(),
            Default::default(),
            move |server_config| server_factory(server_config, &storage_for_factories),
            |listener_config| listener_factory(listener_config),
        );
        (scanner, storage)
    }

    #[test]
    fn unchanged_content_is_not_a_change() {
        let dir = TempDir::new().unwrap();
        let (mut scanner, _) = scanner_for(&dir, BASE_CONFIG);

        assert!(scanner.scan().unwrap().is_some());
        assert!(scanner.scan().unwrap().is_none());
    }

    #[monoio::test(timer_enabled = true)]
    async fn reload_caches_service_configs_by_tag() {
        let dir = TempDir::new().unwrap();
        let (mut scanner, storage) = scanner_for(&dir, TWO_SERVER_CONFIG);

        let change = scanner.scan().unwrap().unwrap();
        scanner.act(change).await.unwrap();
        assert!(storage.get("config/echo").is_some());
        assert!(storage.get("config/kv").is_some());

        // removing a service flushes its cached config
        fs::write(dir.path().join("hearth.toml"), BASE_CONFIG).unwrap();
        let change = scanner.scan().unwrap().unwrap();
        scanner.act(change).await.unwrap();
        assert!(storage.get("config/echo").is_some());
        assert!(storage.get("config/kv").is_none());
    }

    #[monoio::test(timer_enabled = true)]
    async fn broken_config_is_reported_once_per_edit() {
        let dir = TempDir::new().unwrap();
        let (mut scanner, _) = scanner_for(&dir, "this is not a config");

        let change = scanner.scan().unwrap().unwrap();
        assert!(scanner.act(change).await.is_err());
        // the stored content advanced, so the broken file is not re-parsed
        assert!(scanner.scan().unwrap().is_none());
    }

    #[test]
    fn diff_classifies_patches() {
        let old = Config::parse_service_config(BASE_CONFIG.as_bytes()).unwrap();
        let new = Config::parse_service_config(TWO_SERVER_CONFIG.as_bytes()).unwrap();

        let patches = ConfigScanner::<
            AppFactory,
            hearth_core::listener::ListenerBuilder,
            fn(&crate::config::ServerConfig) -> AppFactory,
            fn(&hearth_core::config::ListenerConfig) -> std::io::Result<hearth_core::listener::ListenerBuilder>,
        >::diff(&old, &new);
        assert_eq!(patches.len(), 2);
        assert!(patches.iter().any(|p| matches!(p, Patch::Insert { key, .. } if key == "kv")));
        assert!(patches.iter().any(|p| matches!(p, Patch::Update { key, .. } if key == "echo")));

        let patches = ConfigScanner::<
            AppFactory,
            hearth_core::listener::ListenerBuilder,
            fn(&crate::config::ServerConfig) -> AppFactory,
            fn(&hearth_core::config::ListenerConfig) -> std::io::Result<hearth_core::listener::ListenerBuilder>,
        >::diff(&new, &old);
        assert!(patches.iter().any(|p| matches!(p, Patch::Delete { key } if key == "kv")));
    }
}
