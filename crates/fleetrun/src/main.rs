//! fleetrun CLI
//!
//! Runs shell commands across a fleet of hosts over persistent SSH sessions

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleetrun_core::{DefaultConnectorFactory, ExecOptions, Fleet, FleetRun, RemoteHost};

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "fleetrun")]
#[command(about = "Parallel command execution across a fleet of hosts", long_about = None)]
struct Cli {
    /// Fleet configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on every selected host
    Exec {
        /// Shell command to run
        command: String,

        /// Run as the privileged user
        #[arg(long)]
        sudo: bool,

        /// Accumulate output until the command exits, for long jobs
        #[arg(long, conflicts_with = "timeout")]
        stream: bool,

        /// Command timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Only these hosts (full or short names)
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,

        /// Only hosts with this role
        #[arg(long)]
        role: Option<String>,
    },

    /// Connect to every host and report its state
    Check,

    /// Reboot a host and wait until it is reachable again
    Reboot {
        /// Host to reboot
        host: String,

        /// Seconds to wait for the host to come back
        #[arg(long, default_value_t = 600)]
        deadline: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let fleet = Fleet::from_spec(config.fleet, &DefaultConnectorFactory)?;
    info!(hosts = fleet.len(), "fleet loaded");

    let outcome = match cli.command {
        Commands::Exec {
            command,
            sudo,
            stream,
            timeout,
            hosts,
            role,
        } => {
            let mut options = if sudo {
                ExecOptions::privileged()
            } else {
                ExecOptions::default()
            };
            if stream {
                options = options.streaming();
            }
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            exec(&fleet, &command, options, &hosts, role.as_deref(), cli.json).await
        }
        Commands::Check => check(&fleet, cli.json).await,
        Commands::Reboot { host, deadline } => {
            reboot(&fleet, &host, Duration::from_secs(deadline)).await
        }
    };

    fleet.disconnect_all().await;
    outcome
}

fn select_hosts(
    fleet: &Fleet,
    names: &[String],
    role: Option<&str>,
) -> Result<Vec<Arc<RemoteHost>>> {
    let mut selected = if names.is_empty() {
        fleet.hosts().cloned().collect::<Vec<_>>()
    } else {
        names
            .iter()
            .map(|name| fleet.get(name))
            .collect::<Result<Vec<_>, _>>()?
    };
    if let Some(role) = role {
        selected.retain(|host| host.spec().has_role(role));
    }
    if selected.is_empty() {
        eyre::bail!("no hosts selected");
    }
    Ok(selected)
}

async fn exec(
    fleet: &Fleet,
    command: &str,
    options: ExecOptions,
    names: &[String],
    role: Option<&str>,
    json: bool,
) -> Result<()> {
    let hosts = select_hosts(fleet, names, role)?;

    fleet
        .for_each(hosts.iter().cloned(), |host| async move {
            host.connect().await
        })
        .await
        .into_result()?;

    let selected: Vec<&str> = hosts.iter().map(|h| h.name()).collect();
    let run = fleet.run_on(&selected, command, options).await?;

    print_run(&run, json)?;
    run.into_result()?;
    Ok(())
}

fn print_run(run: &FleetRun, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&run.results)?);
        return Ok(());
    }

    for (host, result) in &run.results {
        let status = result
            .status
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        println!("==> {host} (exit {status})");
        if !result.output.is_empty() {
            print!("{}", result.output);
            if !result.output.ends_with('\n') {
                println!();
            }
        }
    }
    for (host, error) in &run.errors {
        println!("==> {host} (error)");
        println!("{error}");
    }
    Ok(())
}

async fn check(fleet: &Fleet, json: bool) -> Result<()> {
    let report = fleet.connect_all().await;
    let statuses: Vec<_> = fleet.hosts().map(|h| h.status()).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        for status in &statuses {
            let family = status
                .package_family
                .map_or_else(|| "-".to_string(), |f| f.to_string());
            print!(
                "{:<32} {:<16} {:<12} {family}",
                status.name,
                status.addr,
                status.state.to_string()
            );
            match &status.failure {
                Some(failure) => println!("  {}", failure.error),
                None => println!(),
            }
        }
    }

    report.into_result()?;
    Ok(())
}

async fn reboot(fleet: &Fleet, name: &str, deadline: Duration) -> Result<()> {
    let host = fleet.get(name)?;
    host.connect().await?;
    fleet.reboot_and_wait(name, deadline).await?;
    println!("{} is back", host.name());
    Ok(())
}
