use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mvirt_provision::config::{STORAGE_LOCATION_KEY, StorageConfig};
use mvirt_provision::hypervisor::CloudHypervisor;
use mvirt_provision::store::{
    CreateNetworkRecord, MachineStore, NetworkStore, SqliteStore, StorageStore,
};
use mvirt_provision::{Command, CreateMachine, CreateStorage, MachineSpec, ProvisionContext};

#[derive(Parser)]
#[command(name = "mvirt-provision")]
#[command(about = "Provision storage and virtual machines", long_about = None)]
struct Cli {
    /// Data directory for the SQLite database and VM runtime files
    #[arg(short, long, default_value = "/var/lib/mvirt")]
    data_dir: PathBuf,

    /// Directory new storage images are placed in
    #[arg(long, env = "MVIRT_STORAGE_LOCATION")]
    storage_location: Option<String>,

    /// Firmware loaded into every new domain
    #[arg(long, default_value = "/usr/share/cloud-hypervisor/hypervisor-fw")]
    firmware: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage storage records
    Storage {
        #[command(subcommand)]
        action: StorageAction,
    },

    /// Manage network records
    Network {
        #[command(subcommand)]
        action: NetworkAction,
    },

    /// Manage machines
    Machine {
        #[command(subcommand)]
        action: MachineAction,
    },
}

#[derive(Subcommand)]
enum StorageAction {
    /// Register a new storage volume
    Create {
        #[arg(short, long)]
        name: String,

        /// Size in MB
        #[arg(short, long)]
        size: u64,

        /// Backing format (qcow2, raw)
        #[arg(short, long, default_value = "qcow2")]
        format: String,
    },

    /// List storage volumes
    List,
}

#[derive(Subcommand)]
enum NetworkAction {
    /// Register a network interface
    Create {
        #[arg(long)]
        mac: String,

        /// Bridge the interface is plugged into
        #[arg(long, default_value = "br0")]
        network: String,

        /// Virtual NIC model
        #[arg(long, default_value = "virtio")]
        model: String,
    },

    /// List network interfaces
    List,
}

#[derive(Subcommand)]
enum MachineAction {
    /// Create and boot a machine
    Create {
        /// Storage IDs, boot image first
        #[arg(long = "storage", required = true, num_args = 1..)]
        storage: Vec<String>,

        /// Network ID
        #[arg(long = "network")]
        network_id: String,

        /// Machine name (generated when omitted)
        #[arg(short, long)]
        name: Option<String>,

        /// Machine type
        #[arg(short = 't', long = "type")]
        machine_type: Option<String>,

        /// Architecture
        #[arg(long, default_value = std::env::consts::ARCH)]
        arch: String,

        /// Memory in MB
        #[arg(long, default_value = "512")]
        memory: u64,

        /// Number of vCPUs
        #[arg(long, default_value = "1")]
        cpus: u32,
    },

    /// List machines
    List,
}

fn storage_config(storage_location: Option<String>) -> anyhow::Result<StorageConfig> {
    let source: HashMap<String, String> = storage_location
        .map(|location| (STORAGE_LOCATION_KEY.to_string(), location))
        .into_iter()
        .collect();
    Ok(StorageConfig::from_source(&source)?)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mvirt_provision=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    tokio::fs::create_dir_all(&cli.data_dir)
        .await
        .with_context(|| format!("creating {}", cli.data_dir.display()))?;

    let store = Arc::new(SqliteStore::new(&cli.data_dir).await?);
    let hypervisor = Arc::new(CloudHypervisor::new(
        cli.data_dir.clone(),
        cli.firmware.clone(),
    ));
    let ctx = ProvisionContext::new(store.clone(), hypervisor);

    match cli.command {
        Commands::Storage { action } => match action {
            StorageAction::Create { name, size, format } => {
                let config = storage_config(cli.storage_location)?;

                let storage = CreateStorage::new(name, size, format, &config, ctx)?
                    .run()
                    .await?;
                print_json(&storage)?;
            }
            StorageAction::List => print_json(&store.list_storage().await?)?,
        },

        Commands::Network { action } => match action {
            NetworkAction::Create {
                mac,
                network,
                model,
            } => {
                let network = store
                    .create_network(CreateNetworkRecord {
                        mac,
                        network,
                        model,
                    })
                    .await?;
                info!(network_id = %network.id, mac = %network.mac, "Network registered");
                print_json(&network)?;
            }
            NetworkAction::List => print_json(&store.list_networks().await?)?,
        },

        Commands::Machine { action } => match action {
            MachineAction::Create {
                storage,
                network_id,
                name,
                machine_type,
                arch,
                memory,
                cpus,
            } => {
                let mut disks = Vec::with_capacity(storage.len());
                for id in &storage {
                    match store.get_storage(id).await? {
                        Some(s) => disks.push(s),
                        None => bail!("storage not found: {id}"),
                    }
                }
                let Some(network) = store.get_network(&network_id).await? else {
                    bail!("network not found: {network_id}");
                };

                let spec = MachineSpec {
                    name,
                    machine_type,
                    arch,
                    memory_mb: memory,
                    cpus,
                };
                let machine = CreateMachine::new(disks, Some(network), spec, ctx)?
                    .run()
                    .await?;
                print_json(&machine)?;
            }
            MachineAction::List => print_json(&store.list_machines().await?)?,
        },
    }

    Ok(())
}
