mod rpc;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use quest_contracts::events::EventWriter;
use quest_contracts::paths::{non_empty_env, PluginPaths};
use quest_engine::{normalize, QuestHelper};

const DEFAULT_LOG_FILTER: &str = "quest_cli=info,quest_engine=info,quest_contracts=info";

#[derive(Debug, Parser)]
#[command(
    name = "quest-helper",
    version,
    about = "Screenshot-driven quest guidance backend for the overlay plugin"
)]
struct Cli {
    #[command(flatten)]
    dirs: DirArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct DirArgs {
    /// Overrides DECKY_PLUGIN_SETTINGS_DIR.
    #[arg(long, global = true)]
    settings_dir: Option<PathBuf>,
    /// Overrides DECKY_PLUGIN_LOG_DIR.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    /// Overrides DECKY_PLUGIN_RUNTIME_DIR.
    #[arg(long, global = true)]
    runtime_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Answer host calls, one JSON object per line on stdin.
    Serve,
    SetApiKey(SetApiKeyArgs),
    GetApiKey,
    CaptureScreenshot,
    QuestHelp(QuestHelpArgs),
    Migrate,
    Uninstall,
}

#[derive(Debug, Parser)]
struct SetApiKeyArgs {
    key: String,
}

#[derive(Debug, Parser)]
struct QuestHelpArgs {
    /// Use this image instead of locating the latest screenshot.
    #[arg(long)]
    image: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("quest-helper error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    execute(Cli::parse(), PluginPaths::from_env())
}

fn execute(cli: Cli, base: PluginPaths) -> Result<i32> {
    let paths = base
        .with_settings_dir(cli.dirs.settings_dir.as_deref())
        .with_log_dir(cli.dirs.log_dir.as_deref())
        .with_runtime_dir(cli.dirs.runtime_dir.as_deref());

    let session_id = uuid::Uuid::new_v4().to_string();
    let events = EventWriter::new(paths.events_file(), session_id);
    let mut plugin = QuestHelper::new(paths.clone(), events);

    // Legacy files move before the log file exists, or a legacy log would be
    // shadowed by the fresh one.
    let migrated = match cli.command {
        Command::Serve | Command::Migrate => Some(with_stderr_logging(|| plugin.on_migration())),
        _ => None,
    };
    init_logging(&paths);
    if let Some(report) = &migrated {
        if report.total() > 0 {
            tracing::info!("moved {} legacy entries before logging started", report.total());
        }
    }

    match cli.command {
        Command::Serve => {
            plugin.on_main();
            let stdin = io::stdin();
            let stdout = io::stdout();
            rpc::serve(&mut plugin, stdin.lock(), stdout.lock())?;
            Ok(0)
        }
        Command::SetApiKey(args) => {
            let saved = plugin.set_api_key(&args.key);
            print_json(&Value::Bool(saved))?;
            Ok(if saved { 0 } else { 1 })
        }
        Command::GetApiKey => {
            print_json(&Value::String(plugin.get_api_key()))?;
            Ok(0)
        }
        Command::CaptureScreenshot => {
            let encoded = plugin.capture_screenshot();
            let found = !encoded.is_empty();
            print_json(&Value::String(encoded))?;
            Ok(if found { 0 } else { 1 })
        }
        Command::QuestHelp(args) => {
            let result = match args.image {
                Some(path) => {
                    let encoded = encode_image_file(&path)?;
                    plugin.get_quest_help(&encoded)
                }
                None => plugin.request_quest_help(),
            };
            print_json(&result.to_value())?;
            Ok(if result.is_success() { 0 } else { 1 })
        }
        Command::Migrate => {
            let report = migrated.unwrap_or_default();
            print_json(&serde_json::to_value(&report)?)?;
            Ok(0)
        }
        Command::Uninstall => {
            plugin.on_uninstall();
            Ok(0)
        }
    }
}

fn encode_image_file(path: &Path) -> Result<String> {
    let raw = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let image = normalize(&raw).with_context(|| format!("failed preparing {}", path.display()))?;
    Ok(image.base64)
}

fn print_json(value: &Value) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

fn log_filter() -> EnvFilter {
    let directives = non_empty_env("QUEST_HELPER_LOG")
        .or_else(|| non_empty_env("RUST_LOG"))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Run `f` with its logs on stderr, for work that must happen before the log
/// file is opened.
fn with_stderr_logging<T>(f: impl FnOnce() -> T) -> T {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_ansi(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

/// Log to the plugin log file when it can be opened, else to stderr. Stdout is
/// reserved for call results.
fn init_logging(paths: &PluginPaths) {
    let writer = match open_log_file(&paths.log_file()) {
        Ok(file) => BoxMakeWriter::new(Mutex::new(file)),
        Err(err) => {
            eprintln!("quest-helper: logging to stderr ({err:#})");
            BoxMakeWriter::new(io::stderr)
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_ansi(false)
        .with_writer(writer)
        .try_init();
}

fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed opening {}", path.display()))
}
