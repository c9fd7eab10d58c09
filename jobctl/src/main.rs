use anyhow::{Context, Result};
use clap::Parser;
use config_loader::SessionConfig;
use container_runtime::{Access, BindMount, DockerCli};
use engine::{JobRequest, SessionController};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

static ENV_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env name pattern"));

static VOLUME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/[^:]+):(/[^:]+)(?::(ro|rw))?$").expect("volume pattern"));

/// Provision the container for a CI job and relay stdin/stdout to its agent.
#[derive(Parser, Debug)]
#[command(name = "jobctl", version)]
struct Cli {
    /// Job name; encoded into the container name
    #[arg(long)]
    name: String,
    /// Image the job runs in
    #[arg(long)]
    image: String,
    /// Always start from a fresh container and remove it afterwards
    #[arg(long)]
    clean: bool,
    /// Container environment variable
    #[arg(short = 'e', long = "env", value_name = "NAME=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,
    /// Host directory to bind into the container (read-only unless :rw)
    #[arg(
        short = 'v',
        long = "volume",
        value_name = "/HOST:/CONTAINER[:ro|rw]",
        value_parser = parse_volume
    )]
    volumes: Vec<BindMount>,
}

impl Cli {
    fn into_request(self) -> JobRequest {
        JobRequest {
            name: self.name,
            image: self.image,
            environment: self.env.into_iter().collect(),
            volumes: self.volumes,
            clean: self.clean,
        }
    }
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))?;
    if !ENV_NAME.is_match(name) {
        return Err(format!("'{}' is not a valid variable name", name));
    }
    Ok((name.to_string(), value.to_string()))
}

fn parse_volume(raw: &str) -> Result<BindMount, String> {
    let caps = VOLUME
        .captures(raw)
        .ok_or_else(|| format!("expected /host:/container[:ro|rw], got '{}'", raw))?;
    let access = match caps.get(3).map(|m| m.as_str()) {
        Some("rw") => Access::ReadWrite,
        _ => Access::ReadOnly,
    };
    Ok(BindMount {
        host_path: PathBuf::from(&caps[1]),
        container_path: caps[2].to_string(),
        access,
    })
}

fn init_tracing() {
    // Stdout carries the relayed stream; diagnostics go to stderr only.
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: Cli) -> Result<()> {
    let request = cli.into_request();

    let mut controller =
        SessionController::from_env(|config: &SessionConfig| {
            DockerCli::new(config.runtime_binary.clone())
        })
        .context("Failed to load agent configuration")?;
    info!(
        "Using container runtime '{}'",
        controller.runtime().binary()
    );

    let report = controller
        .run(&request, tokio::io::stdin(), tokio::io::stdout())
        .await
        .with_context(|| format!("Job '{}' failed", request.name))?;

    info!(
        "Job '{}' finished in container {}",
        request.name, report.container_id
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // Stdin may still be parked in a blocking read; leave without joining it.
    std::process::exit(code);
}
