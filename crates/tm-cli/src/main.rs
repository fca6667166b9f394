mod http;
mod server;
mod service;
mod session;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rmcp::{ServiceExt, transport::stdio};
use tm_core::MemoryModel;
use tm_store::{Settings, Store, restore_model, save_model};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "titan", about = "Titan sequence-memory model CLI, MCP and HTTP server")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start MCP server on stdio transport
    Serve,

    /// Start the HTTP + WebSocket server
    Http {
        /// Bind address (overrides settings)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides settings; 0 picks a free port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the effective settings as TOML
    Config,

    /// Train on a sequence file (JSON array of equal-length vectors)
    Train {
        /// Sequence file
        #[arg(long)]
        input: PathBuf,

        /// Checkpoint to resume from and write to (default: <data dir>/model.json)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Passes over the sequence
        #[arg(long, default_value_t = 1)]
        epochs: usize,
    },

    /// Run a trained checkpoint over a sequence, one JSON line per step
    Predict {
        /// Sequence file
        #[arg(long)]
        input: PathBuf,

        /// Checkpoint file
        #[arg(long)]
        checkpoint: PathBuf,
    },

    /// List named checkpoints in the data directory
    Checkpoints,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    Settings::load(cli.config.as_deref()).context("failed to load settings")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve => cmd_serve(&cli).await,
        Commands::Http { host, port } => cmd_http(&cli, host.as_deref(), *port).await,
        Commands::Config => cmd_config(&cli),
        Commands::Train {
            input,
            checkpoint,
            epochs,
        } => cmd_train(&cli, input, checkpoint.as_deref(), *epochs),
        Commands::Predict { input, checkpoint } => cmd_predict(input, checkpoint),
        Commands::Checkpoints => cmd_checkpoints(&cli),
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn cmd_serve(cli: &Cli) -> Result<()> {
    let settings = load_settings(cli)?;
    let service = service::Service::new(settings.model.clone(), settings.db_path())
        .context("failed to create session")?;
    tracing::info!(
        session = %service.session().id(),
        "starting MCP server (data dir {})",
        settings.data_dir().display()
    );

    let server = server::TitanServer::new(service);
    let running = match server.serve(stdio()).await {
        Ok(running) => running,
        Err(e) => {
            // Client went away before the handshake finished.
            tracing::info!("MCP client disconnected during initialization: {e}");
            return Ok(());
        }
    };

    tokio::select! {
        res = running.waiting() => {
            let reason = res.context("MCP server task failed")?;
            tracing::info!("MCP server stopped: {reason:?}");
        }
        _ = shutdown_signal() => tracing::info!("shutdown signal received"),
    }
    Ok(())
}

async fn cmd_http(cli: &Cli, host: Option<&str>, port: Option<u16>) -> Result<()> {
    let settings = load_settings(cli)?;
    let host = host.unwrap_or(&settings.server.host).to_string();
    let port = port.unwrap_or(settings.server.port);

    let service = service::Service::new(settings.model.clone(), settings.db_path())
        .context("failed to create session")?;
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    let addr = listener.local_addr().context("failed to read bound address")?;
    println!("listening on http://{addr}");
    tracing::info!(session = %service.session().id(), "HTTP server on {addr}");

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        trigger.cancel();
    });

    http::serve(listener, service, token)
        .await
        .context("HTTP server failed")
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let settings = load_settings(cli)?;
    let resolved = Settings {
        data_dir: Some(settings.data_dir()),
        ..settings
    };
    print!("{}", resolved.to_toml().context("failed to render settings")?);
    Ok(())
}

/// Parse a JSON array of equal-length numeric vectors.
fn read_sequence(path: &Path) -> Result<Vec<Vec<f64>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let sequence: Vec<Vec<f64>> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of vectors", path.display()))?;

    let Some(width) = sequence.first().map(Vec::len) else {
        bail!("{} contains no vectors", path.display());
    };
    if width == 0 {
        bail!("{}: vectors must not be empty", path.display());
    }
    if let Some(i) = sequence.iter().position(|v| v.len() != width) {
        bail!(
            "{}: all vectors must have the same length (vector {i} has {}, expected {width})",
            path.display(),
            sequence[i].len()
        );
    }
    Ok(sequence)
}

fn cmd_train(cli: &Cli, input: &Path, checkpoint: Option<&Path>, epochs: usize) -> Result<()> {
    let settings = load_settings(cli)?;
    let sequence = read_sequence(input)?;
    if sequence.len() < 2 {
        bail!("training needs at least two vectors, got {}", sequence.len());
    }
    let width = sequence[0].len();

    let checkpoint = checkpoint
        .map(Path::to_path_buf)
        .unwrap_or_else(|| settings.data_dir().join("model.json"));

    let mut model = if checkpoint.exists() {
        let model = restore_model(&checkpoint)
            .with_context(|| format!("failed to load checkpoint {}", checkpoint.display()))?;
        if model.config().input_dim != width {
            bail!(
                "checkpoint expects vectors of length {}, input has {width}",
                model.config().input_dim
            );
        }
        println!("resuming from {}", checkpoint.display());
        model
    } else {
        let mut config = settings.model.clone();
        if config.input_dim != width {
            tracing::info!(
                "input width {width} overrides configured inputDim {}",
                config.input_dim
            );
            config.input_dim = width;
        }
        MemoryModel::new(config, &mut SmallRng::from_os_rng())
            .context("failed to build model")?
    };

    for epoch in 1..=epochs {
        let memory = model.zero_memory();
        let report = model
            .train_sequence(&sequence, &memory)
            .context("training failed")?;
        println!("epoch {epoch}: mean cost {:.6}", report.mean_cost());
    }

    save_model(&model, &checkpoint)
        .with_context(|| format!("failed to write {}", checkpoint.display()))?;
    println!(
        "saved {} ({} optimizer steps)",
        checkpoint.display(),
        model.step_count()
    );
    Ok(())
}

fn cmd_predict(input: &Path, checkpoint: &Path) -> Result<()> {
    let mut model = restore_model(checkpoint)
        .with_context(|| format!("failed to load checkpoint {}", checkpoint.display()))?;
    let sequence = read_sequence(input)?;

    let mut memory = model.zero_memory();
    for x in &sequence {
        let out = model.forward(x, &memory).context("forward pass failed")?;
        println!(
            "{}",
            serde_json::to_string(&out).context("failed to encode output")?
        );
        memory = out.new_memory;
    }
    Ok(())
}

fn cmd_checkpoints(cli: &Cli) -> Result<()> {
    let settings = load_settings(cli)?;
    let store = Store::open(&settings.db_path()).context("failed to open store")?;
    let list = store
        .list_checkpoints()
        .context("failed to list checkpoints")?;

    if list.is_empty() {
        println!("(no checkpoints)");
    }
    for c in list {
        println!(
            "{:<24} steps={:<8} bytes={:<8} saved_at={}",
            c.name, c.steps, c.bytes, c.saved_at
        );
    }
    Ok(())
}
