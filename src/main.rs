//! SolarBridge - solar inverter Modbus to MQTT bridge

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use solarbridge::api::{self, AppState};
use solarbridge::command::CommandHandler;
use solarbridge::config::{self, Config};
use solarbridge::energy::EnergyStore;
use solarbridge::modbus::{ModbusClient, RegisterBus, RetryPolicy};
use solarbridge::mqtt::{self, MqttPublisher};
use solarbridge::poller::{Poller, Snapshot};
use solarbridge::registers::Catalog;

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_catalog(config: &Config) -> Result<Catalog> {
    let catalog = match &config.device.registers_file {
        Some(path) => Catalog::from_path(path)?,
        None => Catalog::builtin(),
    };
    if catalog.is_empty() {
        anyhow::bail!("Register table has no usable rows");
    }
    Ok(catalog)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;
    init_tracing(&config);

    info!("Starting SolarBridge v{}", env!("CARGO_PKG_VERSION"));

    let catalog = Arc::new(load_catalog(&config)?);
    info!(
        "Register catalog: {} registers, {} writable",
        catalog.len(),
        catalog.writable().count()
    );

    let metrics_handle = if config.server.metrics_enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .with_context(|| "Failed to install metrics recorder")?;
        Some(handle)
    } else {
        None
    };

    // connects on first request, so a missing inverter does not stop startup
    let client = ModbusClient::new(&config.device);
    let bus = RegisterBus::new(client, catalog.clone(), RetryPolicy::from(&config.device));
    let store = EnergyStore::new(&config.energy.state_file);
    let poller = Poller::new(bus.clone(), store, config.device.poll_interval());

    let (update_tx, _) = broadcast::channel::<Arc<Snapshot>>(16);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = Vec::new();
    let mut consumer = None;

    let publisher = if config.mqtt.enabled {
        let (command_tx, command_rx) = mpsc::channel(32);
        let publisher = Arc::new(MqttPublisher::new(&config.mqtt, catalog.clone(), command_tx)?);
        let topics = publisher.topics().clone();

        tasks.push(tokio::spawn(mqtt::start_publishing(
            publisher.clone(),
            topics.clone(),
            config.mqtt.retain,
            update_tx.subscribe(),
        )));

        let handler = CommandHandler::new(bus.clone(), publisher.clone(), topics, config.mqtt.retain);
        consumer = Some(tokio::spawn(handler.run(command_rx, shutdown_tx.subscribe())));
        Some(publisher)
    } else {
        info!("MQTT disabled");
        None
    };

    if config.server.enabled {
        let mut state = AppState::new(metrics_handle);
        if let Some(publisher) = &publisher {
            state = state.with_mqtt(publisher.connection_state());
        }
        tasks.push(tokio::spawn(api::track_snapshots(
            state.clone(),
            update_tx.subscribe(),
        )));

        let server_config = config.server.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
            };
            if let Err(e) = api::serve(&server_config, state, shutdown).await {
                error!("{:#}", e);
            }
        }));
    }

    let poll_task = tokio::spawn(poller.run(update_tx.clone(), shutdown_tx.subscribe()));

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(());
    if let Err(e) = poll_task.await {
        error!("Poller task failed: {}", e);
    }
    drop(update_tx);

    // a write in progress runs to completion
    if let Some(consumer) = consumer {
        if let Err(e) = consumer.await {
            error!("Command consumer failed: {}", e);
        }
    }

    if let Some(publisher) = publisher {
        if let Err(e) = publisher.shutdown().await {
            warn!("{:#}", e);
        }
    }
    for task in tasks {
        task.abort();
    }

    info!("SolarBridge stopped");
    Ok(())
}
