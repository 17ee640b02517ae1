//! Command-line interface for the X-Sense MQTT discovery bridge.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use xsense_core::config::{env_vars, retry, status};
use xsense_core::resolver::entity_variable;
use xsense_core::{parse_discovery, topic, Discovery};
use xsense_devices::{
    BusEvent, InstanceConfig, InstanceDirectory, InstanceId, InstanceKind, InventoryRow,
    KonfiguratorConfig, MqttBus, PeerCall, PeerReply, Runtime,
};

use crate::config::{Overrides, XsenseConfig};

/// X-Sense MQTT discovery bridge.
#[derive(Parser, Debug)]
#[command(name = "xsense")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file.
    #[arg(short, long, global = true, env = env_vars::CONFIG_PATH, default_value = "xsense.toml")]
    config: PathBuf,

    /// Storage file, overrides `[storage] path`.
    #[arg(long, global = true, env = env_vars::STORAGE_PATH)]
    storage_path: Option<String>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the broker and run the bridge.
    Run {
        /// Broker host.
        #[arg(long, env = env_vars::MQTT_HOST)]
        mqtt_host: Option<String>,
        /// Broker port.
        #[arg(long, env = env_vars::MQTT_PORT)]
        mqtt_port: Option<u16>,
        /// Discovery topic root.
        #[arg(long, env = env_vars::TOPIC_ROOT)]
        topic_root: Option<String>,
    },
    /// Decode one bus message without connecting anywhere.
    Decode {
        /// Topic the message arrived on.
        topic: String,
        /// Raw payload (JSON text or hex-encoded JSON).
        #[arg(default_value = "")]
        payload: String,
    },
    /// List discovered devices from the stored discovery cache.
    Inventory {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("xsense=info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }

    match args.command {
        Command::Run {
            mqtt_host,
            mqtt_port,
            topic_root,
        } => {
            let config = XsenseConfig::load(&args.config)?.apply(Overrides {
                mqtt_host,
                mqtt_port,
                topic_root,
                storage_path: args.storage_path,
            });
            run(config).await
        }
        Command::Decode { topic, payload } => decode(&topic, &payload),
        Command::Inventory { json } => {
            let config = XsenseConfig::load(&args.config)?.apply(Overrides {
                storage_path: args.storage_path,
                ..Default::default()
            });
            inventory(&config, json)
        }
    }
}

/// Make sure a Bridge and, when enabled, a Konfigurator exist.
fn ensure_instances(runtime: &mut Runtime, config: &XsenseConfig) -> Result<InstanceId> {
    let wanted = InstanceConfig::Bridge(config.bridge.clone());
    let bridge = match runtime.list_instances_of_kind(InstanceKind::Bridge).first() {
        Some(&id) => {
            if runtime.instance_config(id).as_ref() != Some(&wanted) {
                runtime.configure(id, wanted)?;
            }
            id
        }
        None => runtime.spawn(wanted)?,
    };

    let konfigurators = runtime.list_instances_of_kind(InstanceKind::Konfigurator);
    if config.konfigurator.enabled && konfigurators.is_empty() {
        runtime.spawn_child(
            InstanceConfig::Konfigurator(KonfiguratorConfig::default()),
            bridge,
        )?;
    }
    Ok(bridge)
}

/// Re-activate everything that is not active, Bridges first.
fn reactivate_detached(runtime: &mut Runtime) {
    for kind in [
        InstanceKind::Bridge,
        InstanceKind::Konfigurator,
        InstanceKind::Device,
    ] {
        for id in runtime.list_instances_of_kind(kind) {
            if runtime.instance_status(id) == Some(status::ACTIVE) {
                continue;
            }
            if let Err(e) = runtime.apply_changes(id) {
                tracing::warn!(instance = id, error = %e, "re-activation failed");
            }
        }
    }
}

fn provision_discovered(runtime: &mut Runtime) {
    for konf in runtime.list_instances_of_kind(InstanceKind::Konfigurator) {
        match runtime.call(konf, PeerCall::Provision { device_id: String::new() }) {
            Ok(PeerReply::Count(0)) => {}
            Ok(reply) => tracing::info!(instance = konf, created = ?reply.count(), "devices provisioned"),
            Err(e) => tracing::debug!(instance = konf, error = %e, "provisioning skipped"),
        }
    }
}

async fn run(config: XsenseConfig) -> Result<()> {
    let backend = config.storage.open()?;
    let (bus, mut eventloop) = MqttBus::new(&config.mqtt);
    let connected = bus.connection_flag();

    let mut runtime = Runtime::restore(backend)?.with_bus(bus);
    let bridge = ensure_instances(&mut runtime, &config)?;
    runtime.activate_all();
    tracing::info!(
        host = %config.mqtt.host,
        port = config.mqtt.port,
        bridge,
        "bridge starting"
    );

    let mut ticker = tokio::time::interval(retry::INTERVAL);
    let provision_every = config.konfigurator.provision_interval_secs.max(1);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match MqttBus::track(&connected, &event) {
                    BusEvent::Connected => {
                        tracing::info!("connected to broker");
                        reactivate_detached(&mut runtime);
                    }
                    BusEvent::Message { topic, payload } => {
                        runtime.deliver_bus_message(&topic, &payload);
                    }
                    BusEvent::Other => {
                        if let Err(e) = event {
                            tracing::warn!(error = %e, "broker connection lost");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                runtime.advance(retry::INTERVAL);
                ticks += 1;
                if config.konfigurator.auto_provision && ticks % provision_every == 0 {
                    provision_discovered(&mut runtime);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn decode(topic_name: &str, raw: &str) -> Result<()> {
    let payload = topic::decode_payload(raw);
    if !topic::is_config_topic(topic_name) {
        println!("{}", payload);
        return Ok(());
    }

    match parse_discovery(topic_name, &payload)? {
        Discovery::Removed { unique_id, .. } => {
            println!("removed: {}", unique_id);
        }
        Discovery::Entity(desc) => {
            let out = serde_json::json!({
                "device_id": desc.owner_device_id(),
                "variable": serde_json::to_value(entity_variable(&desc))?,
                "descriptor": serde_json::to_value(&desc)?,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

fn print_rows(rows: &[InventoryRow]) {
    println!(
        "{:<32} {:<20} {:<12} {:<10} ENTITIES",
        "NAME", "DEVICE ID", "MODEL", "INSTANCE"
    );
    for row in rows {
        let instance = row
            .instance_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<20} {:<12} {:<10} {}",
            row.name,
            row.device_id,
            row.model,
            instance,
            row.entities_label()
        );
    }
}

fn inventory(config: &XsenseConfig, json: bool) -> Result<()> {
    let backend = config.storage.open()?;
    let mut runtime = Runtime::restore(backend)?;

    let Some(&konf) = runtime
        .list_instances_of_kind(InstanceKind::Konfigurator)
        .first()
    else {
        bail!("no konfigurator in {}", config.storage.path);
    };

    let rows = match runtime
        .call(konf, PeerCall::Inventory)
        .context("inventory unavailable")?
    {
        PeerReply::Inventory(rows) => rows,
        other => bail!("unexpected reply: {:?}", other),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print_rows(&rows);
    }
    Ok(())
}
