//! difftview - Navigable viewer for difftastic structural diffs
//!
//! Runs difftastic (directly, or through git as an external diff tool),
//! decodes its coloured output into styled text and lets you jump between
//! the files and chunks it reports.

mod ansi;
mod args;
mod config;
mod diff;
mod error;
mod languages;
mod navigate;
mod palette;
mod process;
mod surface;
mod tui;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing_appender::non_blocking::WorkerGuard;

use crate::config::Config;
use crate::diff::{BufferSource, DiffEngine, PrintPolicy, Request};
use crate::languages::LanguageCatalog;
use crate::palette::Background;

#[derive(Parser)]
#[command(name = "difftview")]
#[command(about = "Navigable viewer for difftastic structural diff output")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.difftview/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Terminal background: dark or light
    #[arg(long, global = true)]
    background: Option<Background>,

    /// Width passed to difftastic (default: terminal width)
    #[arg(long, global = true)]
    width: Option<u16>,

    /// difftastic executable
    #[arg(long, global = true)]
    difftastic: Option<String>,

    /// Print the result instead of opening the viewer
    #[arg(long, global = true)]
    print: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two files
    Files { old: PathBuf, new: PathBuf },

    /// Compare two contents through temporary files ("-" reads stdin)
    Buffers {
        old: String,
        new: String,

        /// Language to parse both sides as
        #[arg(short, long)]
        language: Option<String>,
    },

    /// Show a single revision's changes
    Show {
        /// Revision (default: HEAD)
        rev: Option<String>,
    },

    /// Run `git diff` with difftastic
    Diff {
        /// Arguments for git diff
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List the languages difftastic knows
    Languages,

    /// Write the default config file
    InitConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    }
    .with_overrides(cli.background, cli.width, cli.difftastic.clone());

    let _log_guard = configure_logging(&config.log_path());
    install_panic_hook();

    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    let request = match cli.command {
        Commands::Files { old, new } => Request::Files { old, new },
        Commands::Buffers { old, new, language } => {
            if old == "-" && new == "-" {
                bail!("Only one side can be read from stdin");
            }
            Request::Buffers {
                old: read_buffer(&old)?,
                new: read_buffer(&new)?,
                language,
            }
        }
        Commands::Show { rev } => Request::Show { rev },
        Commands::Diff { args } => Request::Diff { args },
        Commands::Languages => return cmd_languages(&config),
        Commands::InitConfig => return cmd_init_config(),
    };

    let (width, fixed_width) = match config.width {
        Some(width) => (width, true),
        None => (
            crossterm::terminal::size().map(|(cols, _)| cols).unwrap_or(80),
            false,
        ),
    };
    tracing::info!(target: "runtime", width, fixed_width, print = cli.print, "startup");

    let engine = DiffEngine::new(&config, cwd);
    if cli.print {
        cmd_print(engine, &request, width)
    } else {
        cmd_view(engine, request, width, fixed_width)
    }
}

fn read_buffer(arg: &str) -> Result<BufferSource> {
    if arg == "-" {
        BufferSource::from_stdin()
    } else {
        BufferSource::from_path(Path::new(arg))
    }
}

fn cmd_view(engine: DiffEngine, request: Request, width: u16, fixed_width: bool) -> Result<()> {
    let mut app = tui::App::new(engine, width, fixed_width);
    let completion = app.open(request)?;
    tracing::info!(
        target: "runtime",
        code = ?completion.exit().code,
        output = completion.had_output(),
        "first_run_finished"
    );

    if !completion.had_output() {
        println!("No differences");
        return Ok(());
    }

    tui::run(app)
}

fn cmd_print(mut engine: DiffEngine, request: &Request, width: u16) -> Result<()> {
    let mut registry = surface::SurfaceRegistry::default();
    let stdout = std::io::stdout();
    let mut policy = PrintPolicy::new(stdout.lock());
    let completion = engine.run(&mut registry, request, width, &mut policy)?;
    tracing::info!(
        target: "runtime",
        code = ?completion.exit().code,
        output = completion.had_output(),
        "print_finished"
    );

    if !completion.had_output() {
        println!("No differences");
    }
    Ok(())
}

fn cmd_languages(config: &Config) -> Result<()> {
    let catalog = LanguageCatalog::fetch(&config.difftastic)?;
    for name in catalog.names() {
        println!("{}", name);
    }
    Ok(())
}

fn cmd_init_config() -> Result<()> {
    let path = Config::default_path();
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    let path = Config::create_default()?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Log to a file; the terminal belongs to the viewer.
fn configure_logging(log_path: &Path) -> Option<WorkerGuard> {
    let log_dir = log_path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = log_path.file_name()?;
    std::fs::create_dir_all(log_dir).ok()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    match tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(nb_writer)
        .with_ansi(false)
        .try_init()
    {
        Ok(_) => Some(guard),
        // Global subscriber already installed; dropping the guard shuts the writer down.
        Err(_) => None,
    }
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "runtime.panic", ?info, "panic");
            let _ = crossterm::terminal::disable_raw_mode();
            let _ = crossterm::execute!(
                std::io::stdout(),
                crossterm::terminal::LeaveAlternateScreen
            );
            default_panic(info);
        }));
    });
}
