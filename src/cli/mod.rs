use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::{create_router, AppState};
use crate::config::Settings;
use crate::core::{DiskImageTool, QemuImg, SimulatedDiskImages};
use crate::fleet::{ClassRequest, DiskMode, FleetOrchestrator, InMemoryFleetStore};
use crate::hypervisor::{HypervisorApi, ProxmoxClient, SimulatedHypervisor, VmRef};
use crate::monitoring::ProgressTracker;
use crate::scheduler::{place, rank, PlacementEstimate};

#[derive(Parser)]
#[command(name = "fleet-vm-manager")]
#[command(about = "Classroom VM fleet provisioning", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding default.toml / local.toml
    #[arg(short, long, value_name = "DIR")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Show node scores
    Nodes,
    /// Show where a batch of VMs would be placed
    Place {
        #[arg(short = 'n', long)]
        count: usize,
        #[arg(long)]
        memory_mb: Option<u64>,
        #[arg(long)]
        cores: Option<u32>,
    },
    /// Provision a class in this process and follow its progress
    Deploy {
        #[arg(long)]
        class_id: String,
        #[arg(long)]
        source_vmid: u32,
        #[arg(long)]
        source_node: String,
        #[arg(short = 'n', long)]
        students: usize,
        #[arg(long, value_enum, default_value_t = ModeArg::Linked)]
        mode: ModeArg,
        #[arg(long)]
        no_teacher: bool,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Linked,
    Overlay,
}

impl From<ModeArg> for DiskMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Linked => DiskMode::LinkedClone,
            ModeArg::Overlay => DiskMode::Overlay,
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return handle_init_command(cli.config.unwrap_or_else(|| PathBuf::from("config")), force);
    }

    let settings = match &cli.config {
        Some(path) => Settings::from_dir(&path.to_string_lossy()),
        None => Settings::new(),
    }
    .context("loading configuration")?;

    match cli.command {
        Commands::Serve { port } => serve(settings, port).await,
        Commands::Nodes => show_nodes(&settings).await,
        Commands::Place {
            count,
            memory_mb,
            cores,
        } => show_placement(&settings, count, memory_mb, cores).await,
        Commands::Deploy {
            class_id,
            source_vmid,
            source_node,
            students,
            mode,
            no_teacher,
        } => {
            let source = VmRef::new(source_vmid, source_node);
            let mut request = ClassRequest::new(class_id, source, students);
            request.disk_mode = mode.into();
            request.create_teacher = !no_teacher;
            deploy(&settings, request).await
        }
        Commands::Init { .. } => Ok(()),
    }
}

fn backends(settings: &Settings) -> Result<(Arc<dyn HypervisorApi>, Arc<dyn DiskImageTool>)> {
    if settings.hypervisor.simulated {
        info!("Using the simulated hypervisor");
        return Ok((
            Arc::new(SimulatedHypervisor::demo()),
            Arc::new(SimulatedDiskImages::new()),
        ));
    }
    let client = ProxmoxClient::new(&settings.hypervisor).context("creating hypervisor client")?;
    Ok((Arc::new(client), Arc::new(QemuImg::new(&settings.overlay))))
}

fn orchestrator(settings: &Settings) -> Result<FleetOrchestrator> {
    let (api, disks) = backends(settings)?;
    let progress = Arc::new(ProgressTracker::new(Duration::from_secs(
        settings.progress.retention_secs,
    )));
    progress.spawn_sweeper(Duration::from_secs(settings.progress.sweep_interval_secs.max(1)));
    Ok(FleetOrchestrator::new(
        api,
        disks,
        Arc::new(InMemoryFleetStore::new()),
        progress,
        settings,
    ))
}

async fn serve(settings: Settings, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(settings.server.port);
    let state = AppState {
        orchestrator: orchestrator(&settings)?,
    };
    let app = create_router(
        state,
        &settings.server.api_prefix,
        settings.server.max_concurrent_requests,
    );

    let addr = format!("{}:{}", settings.server.host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;
    Ok(())
}

async fn show_nodes(settings: &Settings) -> Result<()> {
    let (api, _) = backends(settings)?;
    let nodes = api.list_nodes().await?;

    println!("{}", "Nodes:".bold());
    for node in rank(&nodes) {
        let status = if node.online {
            "online".green()
        } else {
            "offline".red()
        };
        println!("- {:<16} {:>6.1}  [{}]", node.node, node.score, status);
    }
    Ok(())
}

async fn show_placement(
    settings: &Settings,
    count: usize,
    memory_mb: Option<u64>,
    cores: Option<u32>,
) -> Result<()> {
    let (api, _) = backends(settings)?;
    let nodes = api.list_nodes().await?;
    let defaults = PlacementEstimate::from(&settings.placement);
    let estimate = PlacementEstimate {
        memory_mb: memory_mb.unwrap_or(defaults.memory_mb),
        cores: cores.unwrap_or(defaults.cores),
    };

    let assignments = place(&nodes, count, &estimate);
    if assignments.is_empty() && count > 0 {
        bail!("no online nodes");
    }
    println!("{}", "Placement:".bold());
    for (index, node) in assignments.iter().enumerate() {
        println!("- #{:<4} {}", index + 1, node.cyan());
    }
    Ok(())
}

async fn deploy(settings: &Settings, request: ClassRequest) -> Result<()> {
    let orchestrator = orchestrator(settings)?;
    let class_id = request.class_id.clone();
    let job_id = orchestrator.start_fleet_job(request).await?;
    println!("{} job {}", "Started".green(), job_id);

    let mut last_seen = (0, 0);
    let progress = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Some(progress) = orchestrator.get_job_progress(&job_id) else {
            bail!("job {} disappeared", job_id);
        };
        if (progress.completed, progress.failed) != last_seen {
            last_seen = (progress.completed, progress.failed);
            println!(
                "  {}/{} done, {} failed  {}",
                progress.completed,
                progress.total,
                progress.failed,
                progress.current_item.as_deref().unwrap_or_default().dimmed()
            );
        }
        if progress.status.is_terminal() {
            break progress;
        }
    };

    for error in &progress.errors {
        println!("  {} {}", "!".red(), error);
    }
    println!("{}", progress.message.bold());
    if let Some(class) = orchestrator.class(&class_id).await? {
        println!("{}", serde_json::to_string_pretty(&class)?);
    }
    Ok(())
}

fn handle_init_command(config_dir: PathBuf, force: bool) -> Result<()> {
    let target = config_dir.join("default.toml");
    if target.exists() && !force {
        bail!("{} already exists, use --force to overwrite", target.display());
    }

    std::fs::create_dir_all(&config_dir)?;
    let default_config = crate::config::generate_default_config();
    let config_str = toml::to_string_pretty(&default_config)?;
    std::fs::write(&target, config_str)?;

    println!("{} Default configuration written to {}", "✓".green(), target.display());
    Ok(())
}
