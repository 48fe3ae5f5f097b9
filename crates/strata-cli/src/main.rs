use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use strata_config::{init_tracing, ExecutionMode, RepoOptions, ServerConfig};
use strata_sessions::{SessionFactory, SessionSettings};
use strata_storage::SCHEMA_VERSION;
use strata_vfs::ChangeSourceKind;

#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "strata CLI (store paths, crawls, session indexing)"
)]
struct Cli {
    /// Server config file (defaults to $STRATA_CONFIG_PATH, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the store schema version
    SchemaVersion(JsonArgs),
    /// Print the store path a repository resolves to
    DbPath(RootArgs),
    /// Crawl a repository the way sessions without a watch query do
    Crawl(RootArgs),
    /// Build a session for a repository, sync it and report what it tracks
    Index(RootArgs),
}

#[derive(Args)]
struct JsonArgs {
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct RootArgs {
    /// Repository root (the directory holding `.strata.toml`)
    root: PathBuf,
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct SchemaReport {
    schema_version: u64,
}

#[derive(Serialize)]
struct DbPathReport {
    root: PathBuf,
    db_path: PathBuf,
}

#[derive(Serialize)]
struct CrawlOutput {
    root: PathBuf,
    files: Vec<PathBuf>,
    file_count: usize,
    exceeded_threshold: bool,
    walk_errors: u64,
}

#[derive(Serialize)]
struct IndexOutput {
    root: PathBuf,
    store: String,
    change_source: &'static str,
    files: usize,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let (config, config_path) =
        ServerConfig::load(cli.config.as_deref()).context("failed to load server config")?;
    init_tracing(&config.logging);
    if let Some(path) = &config_path {
        tracing::debug!(target: "strata.cli", path = %path.display(), "loaded server config");
    }

    match cli.command {
        Command::SchemaVersion(args) => {
            if args.json {
                print_json(&SchemaReport {
                    schema_version: SCHEMA_VERSION,
                })?;
            } else {
                println!("{SCHEMA_VERSION}");
            }
            Ok(0)
        }
        Command::DbPath(args) => {
            let factory = session_factory(&config, ExecutionMode::Server)?;
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            let db_path = factory
                .db_path(&args.root, &cwd)
                .with_context(|| format!("failed to resolve store for {}", args.root.display()))?;
            if args.json {
                print_json(&DbPathReport {
                    root: args.root,
                    db_path,
                })?;
            } else {
                println!("{}", db_path.display());
            }
            Ok(0)
        }
        Command::Crawl(args) => {
            let report = strata_vfs::crawl(&args.root)
                .with_context(|| format!("failed to crawl {}", args.root.display()))?;
            let output = CrawlOutput {
                root: args.root,
                file_count: report.files.len(),
                files: report.files,
                exceeded_threshold: report.exceeded_threshold,
                walk_errors: report.walk_errors,
            };
            if args.json {
                print_json(&output)?;
            } else {
                for file in &output.files {
                    println!("{}", file.display());
                }
                println!("crawled: {}", output.root.display());
                println!("  files: {}", output.file_count);
                if output.exceeded_threshold {
                    println!("  advisory: configure a watch query for repositories this large");
                }
            }
            Ok(0)
        }
        Command::Index(args) => {
            let factory = session_factory(&config, ExecutionMode::Cli)?;
            let output = index(&factory, &args.root);
            factory.shutdown();
            let output = output?;
            if args.json {
                print_json(&output)?;
            } else {
                println!("indexed: {}", output.root.display());
                println!("  store: {}", output.store);
                println!("  change_source: {}", output.change_source);
                println!("  files: {}", output.files);
            }
            Ok(0)
        }
    }
}

fn session_factory(config: &ServerConfig, mode: ExecutionMode) -> Result<SessionFactory> {
    if !config.autoload.sessions_enabled() {
        anyhow::bail!("sessions are disabled: set `autoload.db_path` in the server config");
    }
    let mut settings = SessionSettings::from_autoload(&config.autoload);
    settings.execution_mode = mode;
    Ok(SessionFactory::new(settings))
}

fn index(factory: &SessionFactory, root: &Path) -> Result<IndexOutput> {
    let options = RepoOptions::load_for_root(root)
        .with_context(|| format!("failed to load repository options for {}", root.display()))?;
    let _request = factory.treadmill().start_request();
    let session = factory
        .get_or_create(&options)?
        .with_context(|| format!("invalid repository configuration for {}", root.display()))?;
    session.ensure_updated()?;

    let change_source = match session.change_source() {
        Some(ChangeSourceKind::Subscription) => "subscription",
        Some(ChangeSourceKind::Static) => "static",
        None => "none",
    };
    Ok(IndexOutput {
        root: session.root().to_path_buf(),
        store: session.storage().to_string(),
        change_source,
        files: session.tracked_files().len(),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}
