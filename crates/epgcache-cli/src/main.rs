//! epgcache - generation-swapped XMLTV schedule cache.

/// Application configuration (TOML).
mod config;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use epgcache_feed::FeedSource;
use epgcache_store::{
    ImportOutcome, Importer, ImporterBuilder, ProgramFeed, ReloadHandle, Store, spawn_reload_loop,
};
use serde::Serialize;
use tracing::instrument;
use tracing_subscriber::filter::EnvFilter;
#[cfg(not(feature = "otel"))]
use tracing_subscriber::fmt;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{AppConfig, resolve_config_path};

/// Default number of search hits.
const DEFAULT_SEARCH_LIMIT: usize = 20;

/// CLI argument parser.
#[derive(Parser)]
#[command(name = "epgcache", about, version)]
struct Cli {
    /// Override config/data directory.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Import the feed once and promote the new generation.
    Import(ImportArgs),
    /// Keep the store fresh: import on start, on SIGHUP and periodically.
    Watch(WatchArgs),
    /// Programs of a channel within a time window.
    Range(RangeArgs),
    /// Program that started at or before a time on one channel.
    Now(NowArgs),
    /// Current programs across channels.
    Guide(GuideArgs),
    /// Full-text search over the active generation.
    Search(SearchArgs),
    /// Show the active generation and store statistics.
    Status,
    /// Liveness check; does not touch storage.
    Health,
    /// Print shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the `import` subcommand.
#[derive(clap::Args)]
struct ImportArgs {
    /// XMLTV file path or URL. Falls back to `[feed] source` in config.
    #[arg(long)]
    feed: Option<String>,
}

/// Arguments for the `watch` subcommand.
#[derive(clap::Args)]
struct WatchArgs {
    /// XMLTV file path or URL. Falls back to `[feed] source` in config.
    #[arg(long)]
    feed: Option<String>,

    /// Seconds between periodic reloads (0 disables). Falls back to
    /// `[feed] refresh_interval_secs` in config.
    #[arg(long)]
    interval: Option<u64>,
}

/// Arguments for the `range` subcommand.
#[derive(clap::Args)]
struct RangeArgs {
    /// Channel id.
    #[arg(long)]
    channel: String,

    /// Window start (epoch seconds or RFC 3339).
    #[arg(long, value_parser = parse_time)]
    start: i64,

    /// Window end, inclusive (epoch seconds or RFC 3339).
    #[arg(long, value_parser = parse_time)]
    end: i64,
}

/// Arguments for the `now` subcommand.
#[derive(clap::Args)]
struct NowArgs {
    /// Channel id.
    #[arg(long)]
    channel: String,

    /// Reference time (default: now). Epoch seconds or RFC 3339.
    #[arg(long, value_parser = parse_time)]
    at: Option<i64>,

    /// Also report the previous and next programs.
    #[arg(long)]
    around: bool,
}

/// Arguments for the `guide` subcommand.
#[derive(clap::Args)]
struct GuideArgs {
    /// Comma-separated channel ids. All channels if omitted.
    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<String>>,

    /// Reference time (default: now). Epoch seconds or RFC 3339.
    #[arg(long, value_parser = parse_time)]
    at: Option<i64>,
}

/// Arguments for the `search` subcommand.
#[derive(clap::Args)]
struct SearchArgs {
    /// Free text to look for.
    #[arg(long)]
    query: String,

    /// Maximum number of results.
    #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
    limit: usize,
}

/// Arguments for the `completions` subcommand.
#[derive(clap::Args)]
struct CompletionsArgs {
    /// Target shell.
    #[arg(value_enum)]
    shell: Shell,
}

/// Parses a time argument given as epoch seconds or RFC 3339.
fn parse_time(raw: &str) -> Result<i64, String> {
    let raw = raw.trim();
    if let Ok(epoch) = raw.parse::<i64>() {
        return Ok(epoch);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .map_err(|_| format!("invalid time {raw:?}: expected epoch seconds or RFC 3339"))
}

/// Config plus the data directory it resolves to.
struct AppContext {
    /// Loaded configuration.
    config: AppConfig,
    /// `--dir`, else `[store] dir`, else the default data directory.
    data_dir: Option<PathBuf>,
}

impl AppContext {
    /// Loads the config for `dir`.
    fn load(dir: Option<&PathBuf>) -> Result<Self> {
        let config_path = resolve_config_path(dir)?;
        let config = AppConfig::load(&config_path)?;
        let data_dir = dir.cloned().or_else(|| config.store.dir.clone());
        Ok(Self { config, data_dir })
    }

    /// Opens the store, with the search index when enabled.
    fn open_store(&self) -> Result<Store> {
        Store::open(self.data_dir.as_ref(), self.config.search.enabled)
            .context("failed to open store")
    }

    /// Importer builder with the configured batch size.
    fn importer(&self, store: &Store) -> ImporterBuilder {
        let builder = store.importer();
        match self.config.store.batch_size {
            Some(size) => builder.batch_size(size),
            None => builder,
        }
    }

    /// Feed from the command line or config.
    fn feed(&self, location: Option<&str>) -> Result<FeedSource> {
        let Some(location) = location.or(self.config.feed.source.as_deref()) else {
            bail!("no feed configured; pass --feed or set [feed] source in config.toml");
        };
        FeedSource::from_location(location, self.config.feed.user_agent())
    }
}

/// Writes `value` as pretty JSON to stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value).context("failed to write JSON")?;
    writeln!(out).context("failed to write to stdout")?;
    Ok(())
}

/// Runs the `import` subcommand.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the import fails.
#[instrument(skip_all)]
async fn run_import(args: &ImportArgs, ctx: &AppContext) -> Result<()> {
    let store = ctx.open_store()?;
    let feed = ctx.feed(args.feed.as_deref())?;
    let importer = ctx.importer(&store).build();

    match importer.run(&feed).await.context("import failed")? {
        ImportOutcome::Completed(report) => {
            tracing::info!(
                generation = %report.generation,
                version = report.version,
                written = report.written,
                skipped = report.skipped,
                channels = report.channels,
                elapsed_ms = report.elapsed.as_millis(),
                "Import complete"
            );
        }
        ImportOutcome::Coalesced => {
            tracing::info!("Another import is already running");
        }
    }
    Ok(())
}

/// Runs the `watch` subcommand until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, no feed is configured or
/// the signal handlers cannot be installed.
#[instrument(skip_all)]
async fn run_watch(args: &WatchArgs, ctx: &AppContext) -> Result<()> {
    let store = ctx.open_store()?;
    let feed = Arc::new(ctx.feed(args.feed.as_deref())?);
    let interval = match args.interval {
        Some(0) => None,
        Some(secs) => Some(std::time::Duration::from_secs(secs)),
        None => ctx.config.feed.refresh_interval(),
    };
    tracing::info!(
        feed = %feed.describe(),
        interval_secs = interval.map(|d| d.as_secs()),
        "Watching feed"
    );

    let importer = ctx.importer(&store).build();
    let (handle, task) = spawn_reload_loop(importer.clone(), feed, interval);

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for Ctrl-C")?;
            tracing::info!(state = ?importer.state(), "Shutting down");
        }
        res = forward_hangups(&handle, &importer) => res?,
    }

    drop(handle);
    task.await.context("reload task failed")?;
    Ok(())
}

/// Turns every SIGHUP into a reload request, logging the phase the importer
/// was in when the signal arrived.
#[cfg(unix)]
async fn forward_hangups(handle: &ReloadHandle, importer: &Importer) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    while hangup.recv().await.is_some() {
        let request = handle.reload();
        tracing::info!(?request, state = ?importer.state(), "SIGHUP received");
    }
    std::future::pending().await
}

/// No SIGHUP outside unix; waits forever.
#[cfg(not(unix))]
async fn forward_hangups(_handle: &ReloadHandle, _importer: &Importer) -> Result<()> {
    std::future::pending().await
}

/// Runs the `range` subcommand.
///
/// # Errors
///
/// Returns an error if the window is invalid or nothing is active yet.
#[instrument(skip_all)]
fn run_range(args: &RangeArgs, ctx: &AppContext) -> Result<()> {
    let store = ctx.open_store()?;
    let result = store
        .query()
        .range(&args.channel, args.start, args.end)
        .context("range query failed")?;
    print_json(&result)
}

/// Runs the `now` subcommand.
///
/// # Errors
///
/// Returns an error if nothing is active yet or storage fails.
#[instrument(skip_all)]
fn run_now(args: &NowArgs, ctx: &AppContext) -> Result<()> {
    let store = ctx.open_store()?;
    let at = args.at.unwrap_or_else(|| Utc::now().timestamp());
    let engine = store.query();
    if args.around {
        let triplet = engine
            .triplet(&args.channel, at)
            .context("now query failed")?;
        return print_json(&triplet);
    }
    let program = engine.point(&args.channel, at).context("now query failed")?;
    print_json(&program)
}

/// Runs the `guide` subcommand.
///
/// # Errors
///
/// Returns an error if nothing is active yet or storage fails.
#[instrument(skip_all)]
fn run_guide(args: &GuideArgs, ctx: &AppContext) -> Result<()> {
    let store = ctx.open_store()?;
    let at = args.at.unwrap_or_else(|| Utc::now().timestamp());
    let guide = store
        .query()
        .short_guide(args.channels.as_deref(), at)
        .context("guide query failed")?;
    print_json(&guide)
}

/// Runs the `search` subcommand.
///
/// # Errors
///
/// Returns an error if nothing is active yet or storage fails.
#[instrument(skip_all)]
fn run_search(args: &SearchArgs, ctx: &AppContext) -> Result<()> {
    let store = ctx.open_store()?;
    let hits = store
        .query()
        .search(&args.query, args.limit)
        .context("search failed")?;
    print_json(&hits)
}

/// Runs the `status` subcommand.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or read.
#[instrument(skip_all)]
fn run_status(ctx: &AppContext) -> Result<()> {
    let store = ctx.open_store()?;
    let status = store.status()?;
    print_json(&status)
}

/// Runs the `health` subcommand.
fn run_health() -> Result<()> {
    writeln!(std::io::stdout().lock(), "OK").context("failed to write to stdout")
}

/// Runs the `completions` subcommand.
fn run_completions(args: &CompletionsArgs) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_owned();
    clap_complete::generate(args.shell, &mut cmd, name, &mut std::io::stdout());
}

/// Entry point.
///
/// # Errors
///
/// Returns an error if subcommand execution fails.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    #[cfg(not(feature = "otel"))]
    {
        fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    #[cfg(feature = "otel")]
    {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);

        let otel_layer = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .and_then(|_| {
                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_http()
                    .build()
                    .ok()?;

                let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                    .with_simple_exporter(exporter)
                    .build();

                let tracer = opentelemetry::trace::TracerProvider::tracer(
                    &tracer_provider,
                    env!("CARGO_PKG_NAME"),
                );
                opentelemetry::global::set_tracer_provider(tracer_provider);

                Some(tracing_opentelemetry::layer().with_tracer(tracer))
            });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .init();
    }

    let cli = Cli::parse();
    let ctx = || AppContext::load(cli.dir.as_ref());
    match cli.command {
        Commands::Import(args) => run_import(&args, &ctx()?).await,
        Commands::Watch(args) => run_watch(&args, &ctx()?).await,
        Commands::Range(args) => run_range(&args, &ctx()?),
        Commands::Now(args) => run_now(&args, &ctx()?),
        Commands::Guide(args) => run_guide(&args, &ctx()?),
        Commands::Search(args) => run_search(&args, &ctx()?),
        Commands::Status => run_status(&ctx()?),
        Commands::Health => run_health(),
        Commands::Completions(args) => {
            run_completions(&args);
            Ok(())
        }
    }
}
