//! nbsession CLI entry point.
//!
//! Opens a notebook against a local kernel, keeps it open until Ctrl-C, then
//! closes it through the normal confirm-and-shutdown path.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;
use notebook_session::kernelspec::{KernelspecCatalog, RuntimelibCatalog};
use notebook_session::local::LocalSessionManager;
use notebook_session::prompt::TerminalPrompt;
use notebook_session::settings::{load_settings, settings_path};
use notebook_session::widgets::WidgetStateStore;
use notebook_session::{Collaborators, LifecycleCoordinator};

#[derive(Parser, Debug)]
#[command(name = "nbsession")]
#[command(about = "Open Jupyter notebooks against live kernel sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a notebook and keep its session attached until Ctrl-C
    Open {
        /// Path to the .ipynb file
        path: PathBuf,
    },

    /// List installed kernelspecs
    Kernels {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the effective settings
    Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Open { path } => open(path).await,
        Commands::Kernels { json } => kernels(json).await,
        Commands::Settings => show_settings(),
    }
}

async fn open(path: PathBuf) -> anyhow::Result<()> {
    let settings = load_settings();
    let widgets = Arc::new(WidgetStateStore::new());
    let coordinator = LifecycleCoordinator::new(
        Collaborators {
            sessions: Arc::new(LocalSessionManager::new()),
            kernelspecs: Arc::new(RuntimelibCatalog),
            widgets: widgets.clone(),
            prompt: Arc::new(TerminalPrompt),
        },
        &settings,
    );

    if !coordinator.file_type().matches(&path) {
        anyhow::bail!(
            "{} is not a {} file",
            path.display(),
            coordinator.file_type().display_name
        );
    }

    let id = coordinator.open(&path).await?;
    if let Some(container) = coordinator.container(id) {
        println!("Opened {} as {}", path.display(), id);
        println!("  Cells: {}", container.cells().cell_ids().len());
        if let Some(session) = container.session() {
            println!(
                "  Session: {} ({}, {})",
                session.id(),
                session.kernel_display_name(),
                session.status()
            );
        }
    }

    println!("Press Ctrl-C to close");
    tokio::signal::ctrl_c().await?;
    info!("Closing {} with {} widget(s) open", id, widgets.get_all().len());

    let outcome = coordinator.close(id).await?;
    if outcome.shutdown {
        println!("Kernel shut down");
    } else if outcome.prompted {
        println!("Kernel left running");
    }
    Ok(())
}

async fn kernels(json: bool) -> anyhow::Result<()> {
    let specs = RuntimelibCatalog.fetch_all().await?;
    if json {
        let specs: Vec<_> = specs.values().collect();
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(());
    }

    if specs.is_empty() {
        println!("No kernelspecs found");
        return Ok(());
    }
    for spec in specs.values() {
        println!("{:<20} {:<12} {}", spec.name, spec.language, spec.display_name);
    }
    Ok(())
}

fn show_settings() -> anyhow::Result<()> {
    let settings = load_settings();
    println!("Settings file: {}", settings_path().display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
