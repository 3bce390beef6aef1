/// Baremetal - dedicated server provider core
///
/// Command line front end: catalog lookups, server lifecycle and power
/// actions against the Selectel dedicated servers APIs.
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use baremetal::api::{
    ClientCache, OsTemplateFilter, PowerAction, ServerFilter, ServerRef, ServiceFilter,
};
use baremetal::config::ProviderConfig;
use baremetal::provider::{IncompleteCreate, PowerState, Provider, ServerConfig, ServerState};
use baremetal::waiter::{wait_for_task_completion, WaitTimings};

#[derive(Parser)]
#[command(name = "baremetal")]
#[command(about = "Manage Selectel dedicated servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "provider.yaml")]
    config: PathBuf,

    /// Project to act in, overriding the configured one
    #[arg(short, long)]
    project: Option<String>,

    /// State file of the managed server
    #[arg(short, long, default_value = "server-state.json")]
    state: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate example configuration file
    Init,

    /// List datacenter locations
    Locations {
        /// Only show locations accepting orders
        #[arg(long)]
        available: bool,
    },

    /// List catalog services
    Services {
        #[arg(long = "type")]
        service_type: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        location: Option<String>,
        /// Also fetch the price plans of every service
        #[arg(long)]
        with_plans: bool,
    },

    /// List price plans
    Plans {
        #[arg(long)]
        service: Option<String>,
    },

    /// List OS templates
    OsTemplates {
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        service: Option<String>,
        /// Only show the template with this name
        #[arg(long)]
        name: Option<String>,
        #[arg(long, requires = "name")]
        version: Option<String>,
    },

    /// Manage the server tracked in the state file
    #[command(subcommand)]
    Server(ServerCommand),

    /// Apply a power action to the tracked server
    Power(PowerArgs),

    /// Inspect backend tasks
    #[command(subcommand)]
    Task(TaskCommand),
}

#[derive(Subcommand)]
enum ServerCommand {
    /// Order a server from a YAML server configuration
    Create { file: PathBuf },
    /// Refresh the tracked server
    Read,
    /// Apply name and tag changes from a YAML server configuration
    Update { file: PathBuf },
    /// Delete the tracked server
    Delete,
    /// Adopt an existing server, e.g. `legacy:42` or a v2 UUID
    Import { reference: String },
    /// List servers of the project
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
}

#[derive(Args)]
struct PowerArgs {
    /// on, off, reboot, power_cycle or reinstall
    action: String,

    /// OS template for reinstall
    #[arg(long)]
    os_template: Option<String>,

    /// SSH key for reinstall (repeatable)
    #[arg(long = "ssh-key")]
    ssh_keys: Vec<String>,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Show a task
    Get { id: String },
    /// Wait for a task to complete
    Wait {
        id: String,
        #[arg(long, default_value_t = 30)]
        timeout_mins: u64,
    },
}

/// Persisted state of the tracked server
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server: Option<ServerState>,
    /// Ordered but never confirmed ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tainted: Option<ServerRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_power_action: Option<PowerState>,
}

impl StateFile {
    async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid state file {}", path.display()))
    }

    async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write state file {}", path.display()))
    }

    fn tracked(&self) -> Option<&ServerRef> {
        self.server.as_ref().map(|s| &s.reference).or(self.tainted.as_ref())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("baremetal={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling...");
            interrupt.cancel();
        }
    });

    let result = match &cli.command {
        Commands::Init => init_config(&cli).await,
        Commands::Locations { available } => list_locations(&cli, &cancel, *available).await,
        Commands::Services {
            service_type,
            category,
            location,
            with_plans,
        } => {
            let filter = ServiceFilter {
                service_type: service_type.clone(),
                category: category.clone(),
                location_id: location.clone(),
            };
            list_services(&cli, &cancel, filter, *with_plans).await
        }
        Commands::Plans { service } => list_plans(&cli, &cancel, service.as_deref()).await,
        Commands::OsTemplates {
            location,
            service,
            name,
            version,
        } => {
            let filter = OsTemplateFilter {
                location_id: location.clone(),
                service_id: service.clone(),
            };
            list_os_templates(&cli, &cancel, filter, name.as_deref(), version.as_deref()).await
        }
        Commands::Server(command) => server_command(&cli, &cancel, command).await,
        Commands::Power(args) => power_command(&cli, &cancel, args).await,
        Commands::Task(command) => task_command(&cli, &cancel, command).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

struct Session {
    config: ProviderConfig,
    cache: Arc<ClientCache>,
    provider: Provider,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let config = ProviderConfig::load(&cli.config).context("Failed to load configuration")?;
        let cache = Arc::new(ClientCache::new(config.client_settings()?));
        let provider = Provider::new(cache.clone(), config.resource_timeouts());
        Ok(Self {
            config,
            cache,
            provider,
        })
    }

    /// Project given on the command line, else the configured one
    fn project<'a>(&'a self, cli: &'a Cli) -> Option<&'a str> {
        cli.project.as_deref().or(self.config.project_id.as_deref())
    }
}

/// Generate example configuration file
async fn init_config(cli: &Cli) -> Result<()> {
    if cli.config.exists() {
        anyhow::bail!(
            "Configuration file already exists: {}",
            cli.config.display()
        );
    }

    let yaml = serde_yaml::to_string(&ProviderConfig::example())?;
    tokio::fs::write(&cli.config, yaml)
        .await
        .context("Failed to write configuration file")?;

    info!("Example configuration created: {}", cli.config.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the configuration file to match your requirements");
    info!("  2. Set your API token:");
    info!("     export SELECTEL_TOKEN=your-token-here");
    info!("  3. Browse the catalog:");
    info!("     baremetal locations --available");

    Ok(())
}

async fn list_locations(cli: &Cli, cancel: &CancellationToken, available: bool) -> Result<()> {
    let session = Session::open(cli)?;
    let catalog = session.provider.catalog(session.project(cli))?;
    for location in catalog.locations(cancel, available).await? {
        info!(
            "  {} ({}) - {}, {} [{}]",
            location.name, location.code, location.city, location.country, location.id
        );
    }
    Ok(())
}

async fn list_services(
    cli: &Cli,
    cancel: &CancellationToken,
    filter: ServiceFilter,
    with_plans: bool,
) -> Result<()> {
    let session = Session::open(cli)?;
    let catalog = session.provider.catalog(session.project(cli))?;

    if with_plans {
        for (service, plans) in catalog.services_with_plans(cancel, &filter).await? {
            info!("  {} [{}]", service.name, service.id);
            for plan in plans {
                info!(
                    "    - {}: {} {} / {}",
                    plan.name, plan.price, plan.currency, plan.period
                );
            }
        }
        return Ok(());
    }

    for service in catalog.services(cancel, &filter).await? {
        let availability = if service.available {
            "available"
        } else {
            "unavailable"
        };
        info!(
            "  {} ({}, {}) [{}]",
            service.name, service.category, availability, service.id
        );
    }
    Ok(())
}

async fn list_plans(cli: &Cli, cancel: &CancellationToken, service: Option<&str>) -> Result<()> {
    let session = Session::open(cli)?;
    let catalog = session.provider.catalog(session.project(cli))?;
    for plan in catalog.price_plans(cancel, service).await? {
        info!(
            "  {}: {} {} / {} [{}]",
            plan.name, plan.price, plan.currency, plan.period, plan.id
        );
    }
    Ok(())
}

async fn list_os_templates(
    cli: &Cli,
    cancel: &CancellationToken,
    filter: OsTemplateFilter,
    name: Option<&str>,
    version: Option<&str>,
) -> Result<()> {
    let session = Session::open(cli)?;
    let catalog = session.provider.catalog(session.project(cli))?;
    let templates = match name {
        Some(name) => vec![
            catalog
                .find_os_template(cancel, &filter, name, version)
                .await?,
        ],
        None => catalog.os_templates(cancel, &filter).await?,
    };
    for template in templates {
        info!(
            "  {} {} ({}) [{}]",
            template.name, template.version, template.architecture, template.id
        );
    }
    Ok(())
}

async fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read server configuration {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Invalid server configuration {}", path.display()))
}

async fn server_command(
    cli: &Cli,
    cancel: &CancellationToken,
    command: &ServerCommand,
) -> Result<()> {
    let session = Session::open(cli)?;
    let servers = session.provider.servers();
    let mut state = StateFile::load(&cli.state).await?;

    match command {
        ServerCommand::Create { file } => {
            if let Some(existing) = state.tracked() {
                anyhow::bail!(
                    "State already tracks server {}; delete it or use another state file",
                    existing
                );
            }
            let mut desired = load_server_config(file).await?;
            if desired.project_id.is_none() {
                desired.project_id = cli.project.clone();
            }

            info!("Creating server {}...", desired.name);
            match servers.create(cancel, &desired).await {
                Ok(created) => {
                    print_server(&created);
                    state.server = Some(created);
                }
                Err(e) => {
                    if let Some(incomplete) = e.downcast_ref::<IncompleteCreate>() {
                        warn!("Recording server {} as tainted", incomplete.server);
                        state.tainted = Some(incomplete.server.clone());
                        state.save(&cli.state).await?;
                    }
                    return Err(e);
                }
            }
        }
        ServerCommand::Read => {
            let Some(current) = state.server.as_ref() else {
                anyhow::bail!("No server tracked in {}", cli.state.display());
            };
            match servers.refresh(cancel, current).await? {
                Some(refreshed) => {
                    print_server(&refreshed);
                    state.server = Some(refreshed);
                }
                None => state.server = None,
            }
        }
        ServerCommand::Update { file } => {
            let Some(current) = state.server.as_ref() else {
                anyhow::bail!("No server tracked in {}", cli.state.display());
            };
            let mut desired = load_server_config(file).await?;
            if desired.project_id.is_none() {
                desired.project_id = current.project_id.clone();
            }
            let updated = servers.update(cancel, current, &desired).await?;
            print_server(&updated);
            state.server = Some(updated);
        }
        ServerCommand::Delete => {
            let Some(reference) = state.tracked().cloned() else {
                anyhow::bail!("No server tracked in {}", cli.state.display());
            };
            let project = state
                .server
                .as_ref()
                .and_then(|s| s.project_id.clone())
                .or_else(|| session.project(cli).map(str::to_string));
            info!("Deleting server {}...", reference);
            servers.delete(cancel, &reference, project.as_deref()).await?;
            state = StateFile::default();
        }
        ServerCommand::Import { reference } => {
            if let Some(existing) = state.tracked() {
                anyhow::bail!("State already tracks server {}", existing);
            }
            let imported = servers
                .import(cancel, reference, session.project(cli))
                .await?;
            info!("✓ Imported server {}", imported.reference);
            print_server(&imported);
            state.server = Some(imported);
        }
        ServerCommand::List { status, location } => {
            let filter = ServerFilter {
                status: status.clone(),
                location_id: location.clone(),
            };
            for server in servers.list(cancel, &filter, session.project(cli)).await? {
                print_server(&server);
            }
            return Ok(());
        }
    }

    state.save(&cli.state).await
}

fn print_server(server: &ServerState) {
    let ips: Vec<&str> = server
        .ip_addresses
        .iter()
        .map(|ip| ip.address.as_str())
        .collect();
    let ips = if ips.is_empty() {
        "N/A".to_string()
    } else {
        ips.join(", ")
    };
    info!(
        "  {} (ID: {}, Status: {}, IP: {})",
        server.name, server.reference, server.status, ips
    );
}

async fn power_command(cli: &Cli, cancel: &CancellationToken, args: &PowerArgs) -> Result<()> {
    let session = Session::open(cli)?;
    let mut state = StateFile::load(&cli.state).await?;
    let Some(current) = state.server.as_ref() else {
        anyhow::bail!("No server tracked in {}", cli.state.display());
    };

    let action = if args.action.eq_ignore_ascii_case("reinstall") {
        PowerAction::Reinstall {
            os_template_id: args
                .os_template
                .clone()
                .context("--os-template is required for reinstall")?,
            ssh_keys: args.ssh_keys.clone(),
        }
    } else {
        PowerAction::parse(&args.action)?
    };

    let project = current.project_id.clone();
    let applied = session
        .provider
        .power()
        .apply(cancel, &current.reference, action, project.as_deref())
        .await?;
    info!(
        "  {} (task {}): server is {}",
        applied.action, applied.task_id, applied.status
    );

    if let Some(server) = state.server.as_mut() {
        server.status = applied.status.clone();
        server.power_status = applied.power_status;
    }
    state.last_power_action = Some(applied);
    state.save(&cli.state).await
}

async fn task_command(cli: &Cli, cancel: &CancellationToken, command: &TaskCommand) -> Result<()> {
    let session = Session::open(cli)?;
    let client = session.cache.for_project(session.project(cli))?;

    let task = match command {
        TaskCommand::Get { id } => client
            .get_task(cancel, id)
            .await
            .with_context(|| format!("Failed to get task {}", id))?,
        TaskCommand::Wait { id, timeout_mins } => {
            info!("Waiting for task {}...", id);
            let timings =
                WaitTimings::task_defaults().with_timeout(Duration::from_secs(timeout_mins * 60));
            let task = wait_for_task_completion(client.as_ref(), cancel, id, timings)
                .await
                .map_err(baremetal::Error::from)?;
            info!("✓ Task {} completed", id);
            task
        }
    };

    info!("  {} ({}%): {}", task.id, task.progress, task.status);
    if let Some(message) = task.message.as_deref().or(task.error.as_deref()) {
        info!("  {}", message);
    }
    Ok(())
}
