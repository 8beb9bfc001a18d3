//! shmreduce CLI entry point

use anyhow::{Context, Result};
use shmreduce::config::cli::{Cli, ExecutionMode};
use shmreduce::config::toml::load_config;
use shmreduce::config::validator::validate_config;
use shmreduce::config::Config;
use shmreduce::dataset::synthetic::{self, SyntheticSpec};
use shmreduce::dataset::DatasetSource;
use shmreduce::distributed::{spawn_hub, LocalCluster, TcpCommunicator};
use shmreduce::output::ResultSink;
use shmreduce::topology::{launcher, COORDINATOR_RANK};
use std::process::{Child, Command};

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli.validate()?;

    setup_logging(cli.debug);

    match cli.mode {
        ExecutionMode::Local => run_local(&cli),
        ExecutionMode::Participant => run_participant(&cli),
        ExecutionMode::Launch => run_launch(&cli),
        ExecutionMode::Generate => run_generate(&cli),
    }
}

/// Diagnostics go to stderr; reports go to stdout
fn setup_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Run every participant as a thread of this process
fn run_local(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    validate_config(&config).context("Configuration validation failed")?;

    println!("shmreduce v{}", env!("CARGO_PKG_VERSION"));
    println!();
    print_configuration(&config, cli.mode);

    if cli.dry_run {
        println!();
        println!("Dry run mode - configuration validated successfully");
        return Ok(());
    }
    println!();

    let source = config.dataset_source()?;
    let cluster = LocalCluster::new(config.topology.world_size, config.topology.nodes)?;
    let (report, _) = shmreduce::run_local(&cluster, &source, &config.pipeline_options())?;

    config.sinks().consume(&report)
}

/// Run as one rank of a multi-process run
fn run_participant(cli: &Cli) -> Result<()> {
    let mut config = load_config(cli)?;

    if config.topology.rank.is_none() {
        if let Some(info) = launcher::detect()? {
            tracing::debug!(source = info.source, rank = info.rank, world_size = info.world_size, "Detected launcher");
            config.topology.rank = Some(info.rank);
            if cli.world_size.is_none() {
                config.topology.world_size = info.world_size;
            }
        }
    }
    let rank = config
        .topology
        .rank
        .context("Participant mode needs --rank (or a launcher environment providing it)")?;

    validate_config(&config).context("Configuration validation failed")?;

    let world_size = config.topology.world_size;
    let hub_addr = config.topology.hub_addr.clone();
    let node_id = config
        .topology
        .node_id
        .clone()
        .unwrap_or_else(launcher::local_node_id);

    let span = tracing::info_span!("participant", rank);
    let _entered = span.enter();

    if rank == COORDINATOR_RANK {
        println!("shmreduce v{}", env!("CARGO_PKG_VERSION"));
        println!();
        print_configuration(&config, cli.mode);
        println!();
    }

    if cli.dry_run {
        if rank == COORDINATOR_RANK {
            println!("Dry run mode - configuration validated successfully");
        }
        return Ok(());
    }

    // Fail before the hub exists so peers time out instead of waiting on a dead run
    let source = if rank == COORDINATOR_RANK {
        Some(config.dataset_source()?)
    } else {
        None
    };

    let hub = if rank == COORDINATOR_RANK {
        let hub = spawn_hub(&hub_addr, world_size)?;
        tracing::debug!(addr = %hub.local_addr(), "Hosting rendezvous hub");
        Some(hub)
    } else {
        None
    };

    let world = TcpCommunicator::connect(
        &hub_addr,
        rank,
        world_size,
        &node_id,
        config.topology.connect_timeout(),
    )
    .with_context(|| format!("Participant {} failed to join the run", rank))?;

    let outcome = shmreduce::run_participant(
        &world,
        &node_id,
        source.as_ref().map(|s| s as &dyn DatasetSource),
        &config.pipeline_options(),
    );
    drop(world);

    if let Some(hub) = hub {
        match (&outcome, hub.join()) {
            (Ok(_), Err(e)) => return Err(e.context("Rendezvous hub failed")),
            (Err(_), Err(e)) => tracing::debug!("Rendezvous hub ended: {:#}", e),
            _ => {}
        }
    }

    if let Some(report) = outcome?.report {
        config.sinks().consume(&report)?;
    }
    Ok(())
}

/// Spawn world-size participant processes of this executable on localhost
fn run_launch(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    validate_config(&config).context("Configuration validation failed")?;

    let world_size = config.topology.world_size;
    print_configuration(&config, cli.mode);
    println!();

    if cli.dry_run {
        println!("Dry run mode - configuration validated successfully");
        return Ok(());
    }

    let port = find_available_port(cli.debug)?;
    let hub_addr = format!("127.0.0.1:{}", port);
    let args = participant_args(std::env::args().skip(1));

    let mut children = Vec::with_capacity(world_size);
    for rank in 0..world_size {
        match launch_participant(rank, world_size, &hub_addr, &args) {
            Ok(child) => children.push((rank, child)),
            Err(e) => {
                cleanup_participants(children);
                return Err(e);
            }
        }
    }

    let mut failed = Vec::new();
    for (rank, mut child) in children {
        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for participant {}", rank))?;
        if !status.success() {
            tracing::debug!(rank, %status, "Participant exited unsuccessfully");
            failed.push(rank);
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("Participants {:?} of {} failed", failed, world_size);
    }
    Ok(())
}

/// Write a synthetic dataset
fn run_generate(cli: &Cli) -> Result<()> {
    let path = cli.dataset.as_ref().context("generate mode needs an output PATH")?;
    let column = match cli.column {
        Some(shmreduce::dataset::ColumnSelector::Index(index)) => index,
        Some(shmreduce::dataset::ColumnSelector::Name(ref name)) => {
            anyhow::bail!("generate mode needs a numeric --column, got '{}'", name)
        }
        None => SyntheticSpec::default().column,
    };

    let spec = SyntheticSpec {
        rows: cli.rows,
        column,
        mean: cli.mean,
        std_dev: cli.std_dev,
        seed: cli.seed,
    };
    let values = synthetic::write_csv(path, &spec)?;

    println!(
        "Wrote {} values (mean {}, std dev {}, seed {}) to {} in column {}",
        values.len(),
        spec.mean,
        spec.std_dev,
        spec.seed,
        path.display(),
        spec.column
    );
    Ok(())
}

fn print_configuration(config: &Config, mode: ExecutionMode) {
    println!("Configuration:");
    println!("  Mode: {:?}", mode);
    println!("  Dataset:");
    match config.dataset.path {
        Some(ref path) => println!("    Path: {}", path.display()),
        None => println!("    Path: (none)"),
    }
    println!("    Column: {}", config.dataset.column);
    println!("    Header: {}", config.dataset.has_header);
    println!("  Topology:");
    println!("    Participants: {}", config.topology.world_size);
    if mode == ExecutionMode::Local {
        println!("    Simulated nodes: {}", config.topology.nodes);
    } else {
        println!("    Hub: {}", config.topology.hub_addr);
    }
    println!("  Reduction:");
    match config.reduction.threads {
        0 => println!("    Threads: auto"),
        n => println!("    Threads: {}", n),
    }
    println!("    Shared segments: {}", config.pipeline_options().shm_dir.display());
    println!("  Output:");
    println!("    Results file: {}", config.output.results_file.display());
    println!("    Alert threshold: {}", config.output.threshold);
    if let Some(ref path) = config.output.json_output {
        println!("    JSON summary: {}", path.display());
    }
}

/// Find an available port for the rendezvous hub
fn find_available_port(debug: bool) -> Result<u16> {
    use std::net::TcpListener;

    // Try ports 7411-7510
    for port in 7411..7511 {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
            drop(listener);
            if debug {
                tracing::debug!("Port {} is available", port);
            }
            return Ok(port);
        }
    }

    anyhow::bail!("No available ports found in range 7411-7510. Please close other shmreduce runs.")
}

/// Options the launcher sets per participant; stripped from the forwarded arguments
const LAUNCHER_OPTIONS: &[&str] = &["--mode", "--rank", "--world-size", "-n", "--hub", "--nodes"];

/// Arguments forwarded to each participant process
fn participant_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut forwarded = vec!["--mode".to_string(), "participant".to_string()];
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        if LAUNCHER_OPTIONS.contains(&arg.as_str()) {
            // Drop the option's value as well
            args.next();
            continue;
        }
        let attached = LAUNCHER_OPTIONS
            .iter()
            .any(|opt| arg.starts_with(&format!("{}=", opt)) || (*opt == "-n" && arg.len() > 2 && arg.starts_with("-n")));
        if attached {
            continue;
        }
        forwarded.push(arg);
    }
    forwarded
}

/// Launch one participant process
fn launch_participant(rank: usize, world_size: usize, hub_addr: &str, args: &[String]) -> Result<Child> {
    let exe_path = std::env::current_exe().context("Failed to get current executable path")?;

    let child = Command::new(&exe_path)
        .args(args)
        .env("SHMREDUCE_RANK", rank.to_string())
        .env("SHMREDUCE_WORLD_SIZE", world_size.to_string())
        .env("SHMREDUCE_HUB", hub_addr)
        .spawn()
        .with_context(|| format!("Failed to spawn participant {}", rank))?;

    tracing::debug!(rank, pid = child.id(), "Participant launched");
    Ok(child)
}

/// Kill participants that were already started
fn cleanup_participants(children: Vec<(usize, Child)>) {
    for (rank, mut child) in children {
        if let Ok(Some(_)) = child.try_wait() {
            continue;
        }
        if let Err(e) = child.kill() {
            tracing::warn!(rank, "Failed to kill participant: {}", e);
        }
        let _ = child.wait();
    }
}
