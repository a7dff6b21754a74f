use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use hearth_core::{
    listener::{Accepted, ListenerBuilder},
    orchestrator::{Receiver, ServiceCommand},
    scanner::{DeploymentScanner, ScanDriver},
    storage,
    system::InitSystemRestarter,
};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::{
    config::{manager::ConfigScanner, Config},
    factory::{listener_factory, server_factory, AppFactory},
};

mod config;
mod factory;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let (config, raw_config) = Config::load(&args.config).await?;
    let storage = storage::build(&config.storage);

    // Start workers
    let receiver: Receiver<AppFactory, ListenerBuilder> = Receiver::new(config.runtime.clone());
    receiver.start::<Accepted>();

    // Deploy every configured server to the pool
    for (key, service_config) in &config.servers {
        let factory = server_factory(&service_config.server, &storage);
        let listener = listener_factory(&service_config.listener)?;
        receiver
            .dispatch(ServiceCommand::PrepareAndCommit(
                Arc::new(key.clone()),
                factory,
                listener,
            ))
            .await
            .err()?;
        info!("service {key} deployed");
    }

    // Watch the deployment directory and restart the managed unit on change
    if let Some(scanner_config) = &config.scanner {
        let deployment = DeploymentScanner::new(
            scanner_config.deploy_dir.clone(),
            scanner_config.service_unit.clone(),
            InitSystemRestarter,
            storage.clone(),
        )?;
        monoio::spawn(ScanDriver::new(deployment, scanner_config.interval()).run());
    }

    // Watch the config file for hot reload
    let storage_for_factories = storage.clone();
    let config_scanner = ConfigScanner::new(
        args.config.clone(),
        receiver.clone(),
        storage.clone(),
        raw_config,
        config.servers.clone(),
        move |server_config| server_factory(server_config, &storage_for_factories),
        listener_factory,
    );
    monoio::spawn(ScanDriver::new(config_scanner, Duration::from_secs(1)).run());

    // Supervise the pool until the process is taken down externally
    receiver.supervise::<Accepted>().await;
    Ok(())
}
