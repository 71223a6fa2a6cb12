mod commands;

use clap::{Parser, Subcommand};
use commands::{Globals, EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_STORE_ERROR};
use convoy_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "convoy",
    version,
    about = "Container discovery and reconciliation for Docker and Proxmox fleets"
)]
struct Cli {
    /// Path to the fleet configuration file.
    #[arg(short, long, default_value = "convoy.toml", global = true)]
    config: PathBuf,

    /// Path to the inventory store directory.
    #[arg(long, global = true)]
    store: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch every enabled device until interrupted.
    Run,
    /// Poll one device once and print what changed.
    Poll {
        /// Device UUID from the fleet file.
        device: String,
    },
    /// Print the persisted inventory.
    List {
        /// Only rows owned by this watcher (e.g. "docker-d1").
        #[arg(long)]
        watcher: Option<String>,
    },
    /// Start, stop, restart, pause, unpause, kill, reboot or shut down a container.
    Action {
        /// Container UUID from `convoy list`.
        container: String,
        /// Lifecycle action to perform.
        action: String,
    },
    /// Poll every device once and print the state of each watcher.
    Watchers,
    /// Validate configured registries and classify image references.
    Registries {
        /// Image references to classify.
        images: Vec<String>,
        /// Also authenticate against each matched registry.
        #[arg(long, default_value_t = false)]
        login: bool,
    },
    /// Run diagnostic checks on the host, the fleet file and the store.
    Doctor,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if matches!(cli.command, Commands::Run) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CONVOY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let globals = Globals {
        config: cli.config,
        store: cli.store,
        json: cli.json,
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let result = match cli.command {
        Commands::Run => commands::run::run(&runtime, &globals),
        Commands::Poll { device } => commands::poll::run(&runtime, &globals, &device),
        Commands::List { watcher } => commands::list::run(&globals, watcher.as_deref()),
        Commands::Action { container, action } => {
            commands::action::run(&runtime, &globals, &container, &action)
        }
        Commands::Watchers => commands::watchers::run(&runtime, &globals),
        Commands::Registries { images, login } => {
            commands::registries::run(&globals, &images, login)
        }
        Commands::Doctor => commands::doctor::run(&globals),
    };
    // Abandoned polls may still hold blocking threads.
    runtime.shutdown_timeout(Duration::from_secs(5));

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("store error:") || msg.starts_with("store lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
