use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use lobsterd::cmd;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "lobsterd", version, about = "microVM tenant orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify host prerequisites and lay out config, registry, and runtime dirs
    Init,
    /// Create a tenant end-to-end
    Spawn {
        name: String,
    },
    /// Tear a tenant down and remove it from the registry
    Evict {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
    /// Reconcile live resources against the registry
    Molt {
        /// Reconcile a single tenant instead of everything
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List tenants with a liveness probe
    List {
        #[arg(long)]
        json: bool,
    },
    /// Snapshot a tenant's dataset
    Snap {
        name: String,
        /// Keep only the newest snapshots afterwards
        #[arg(long)]
        prune: bool,
    },
    /// Run the idle/traffic/wake scheduler in the foreground
    Watch {
        /// Suppress the stdout event stream (events still go to the log)
        #[arg(long)]
        daemon: bool,
    },
    /// Host overview: tenant counts, allocators, per-tenant state
    Tank,
    /// Fetch logs from a tenant's in-guest agent
    Logs {
        name: String,
        #[arg(short = 's', long)]
        service: Option<String>,
    },
    /// Run a command inside the guest over ssh
    Exec {
        name: String,
        #[arg(last = true)]
        cmd: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Init => cmd::run_init().await,
        Command::Spawn { name } => cmd::run_spawn(&name).await,
        Command::Evict { name, yes } => cmd::run_evict(&name, yes).await,
        Command::Molt { name, json } => cmd::run_molt(name.as_deref(), json).await,
        Command::List { json } => cmd::run_list(json).await,
        Command::Snap { name, prune } => cmd::run_snap(&name, prune).await,
        Command::Watch { daemon } => cmd::run_watch(daemon).await,
        Command::Tank => cmd::run_tank().await,
        Command::Logs { name, service } => cmd::run_logs(&name, service.as_deref()).await,
        Command::Exec { name, cmd } => cmd::run_exec(&name, &cmd).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
