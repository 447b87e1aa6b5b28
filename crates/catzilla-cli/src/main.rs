use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use catzilla::{AllocatorPref, Config, Mode, Runtime, Server, StaticMountConfig};

#[derive(Parser)]
#[command(name = "catzilla")]
#[command(about = "The native-speed HTTP runtime")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a server bound to host:port
    Serve {
        /// Bind address, e.g. 127.0.0.1:8000
        #[arg(default_value = "127.0.0.1:8000")]
        addr: String,

        /// Reactor worker count (default: one per core)
        #[arg(long)]
        workers: Option<usize>,

        /// Production mode: compact banner, minimal error bodies
        #[arg(long)]
        production: bool,

        /// Allocator preference
        #[arg(long, value_parser = ["auto", "thread-caching", "system"])]
        allocator: Option<String>,

        /// Disk cache root (enables the L2 tier)
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Serve a directory at a URL prefix, formatted PREFIX=DIR
        #[arg(long, value_name = "PREFIX=DIR")]
        mount: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            addr,
            workers,
            production,
            allocator,
            cache_dir,
            mount,
        } => match build_runtime(&addr, workers, production, allocator, cache_dir, &mount) {
            Ok(runtime) => {
                catzilla::init_logging(&runtime.config);
                match Server::new(runtime).serve() {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(e) => {
                        eprintln!("catzilla: runtime failure: {e}");
                        ExitCode::from(2)
                    }
                }
            }
            Err(e) => {
                eprintln!("catzilla: startup failure: {e}");
                ExitCode::from(1)
            }
        },
    }
}

fn build_runtime(
    addr: &str,
    workers: Option<usize>,
    production: bool,
    allocator: Option<String>,
    cache_dir: Option<PathBuf>,
    mounts: &[String],
) -> Result<Runtime, catzilla::CatzillaError> {
    let mut config = Config::from_env()?;

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        catzilla::CatzillaError::Config(format!("bind address '{addr}' must be host:port"))
    })?;
    config.host = host.to_string();
    config.port = port
        .parse()
        .map_err(|_| catzilla::CatzillaError::Config(format!("invalid port '{port}'")))?;

    if let Some(workers) = workers {
        config.workers = workers.max(1);
    }
    if production {
        config.mode = Mode::Production;
    }
    if let Some(pref) = allocator {
        config.allocator = match pref.as_str() {
            "thread-caching" => AllocatorPref::ThreadCaching,
            "system" => AllocatorPref::System,
            _ => AllocatorPref::Auto,
        };
    }
    if cache_dir.is_some() {
        config.cache_dir = cache_dir;
    }

    let mut runtime = Runtime::new(config)?;
    for spec in mounts {
        let (prefix, dir) = spec.split_once('=').ok_or_else(|| {
            catzilla::CatzillaError::Config(format!("mount '{spec}' must be PREFIX=DIR"))
        })?;
        runtime.statics.mount(StaticMountConfig::new(prefix, dir))?;
    }
    Ok(runtime)
}
