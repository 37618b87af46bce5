//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use questiontree_core::{
    ConsensusReport, ProgressReporter, RunSource, run_consensus, run_cycle,
};
use questiontree_extractor::{CancelFlag, HttpLauncher, RunExecutor};
use questiontree_shared::{
    AppConfig, Device, Evidence, ExtractionParams, RunResult, TargetId, TrackedTarget,
    init_config, load_config, parse_proxy_pool,
};
use questiontree_storage::Storage;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// QuestionTree: extract and track "related questions" trees.
#[derive(Parser)]
#[command(
    name = "questiontree",
    version,
    about = "Extract the related-questions tree of a results page, merge repeated runs, and track changes over time.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a single extraction and print the question tree as JSON.
    Extract {
        #[command(flatten)]
        query: QueryArgs,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Run up to three extractions and print the merged, scored questions.
    Consensus {
        #[command(flatten)]
        query: QueryArgs,

        #[command(flatten)]
        engine: EngineArgs,

        /// Number of runs (1-3).
        #[arg(short = 'k', long, default_value = "3")]
        runs: u8,

        /// Keep only questions seen in at least two runs.
        #[arg(long)]
        strict: bool,

        /// Runs allowed in flight at once.
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Manage tracked targets and run tracking cycles.
    Track {
        #[command(subcommand)]
        action: TrackAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// What to search for.
#[derive(Args)]
pub(crate) struct QueryArgs {
    /// Search keyword.
    pub keyword: String,

    /// Two-letter country code.
    #[arg(short, long, default_value = "us")]
    pub country: String,

    /// Language code.
    #[arg(short, long, default_value = "en")]
    pub language: String,

    /// mobile or desktop (defaults to the configured device).
    #[arg(short, long)]
    pub device: Option<Device>,

    /// Expansion depth: 0 records top-level questions only.
    #[arg(long, default_value = "1")]
    pub depth: u8,

    /// Pre-encoded city-bias token, passed through verbatim.
    #[arg(long)]
    pub city_bias: Option<String>,
}

/// Per-invocation engine overrides; these win over file and environment.
#[derive(Args)]
pub(crate) struct EngineArgs {
    /// Proxy endpoint (repeatable, or comma-separated).
    #[arg(long = "proxy")]
    pub proxies: Vec<String>,

    /// Maximum questions recorded per run.
    #[arg(long)]
    pub max_nodes: Option<usize>,

    /// Wall-clock budget per run in milliseconds.
    #[arg(long)]
    pub max_runtime_ms: Option<u64>,

    /// Directory to write screenshots and container markup into.
    #[arg(long)]
    pub evidence_dir: Option<PathBuf>,
}

/// Tracking subcommands.
#[derive(Subcommand)]
pub(crate) enum TrackAction {
    /// Start tracking a keyword in a region.
    Add {
        keyword: String,

        #[arg(short, long, default_value = "us")]
        country: String,

        #[arg(short, long, default_value = "en")]
        language: String,

        #[arg(short, long)]
        device: Option<Device>,

        #[arg(long)]
        city_bias: Option<String>,
    },

    /// List tracked targets.
    List,

    /// Stop tracking a target and drop its history.
    Remove {
        /// Target ID as printed by `track list`.
        id: String,
    },

    /// Check every tracked target once.
    Run {
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Show the change feed, newest first.
    Changes {
        /// Restrict to one target ID.
        #[arg(long)]
        target: Option<String>,

        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "questiontree=info",
        1 => "questiontree=debug",
        _ => "questiontree=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so JSON results on stdout stay pipeable.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Extract { query, engine } => cmd_extract(&query, &engine).await,
        Command::Consensus {
            query,
            engine,
            runs,
            strict,
            parallelism,
        } => cmd_consensus(&query, &engine, runs, strict, parallelism).await,
        Command::Track { action } => match action {
            TrackAction::Add {
                keyword,
                country,
                language,
                device,
                city_bias,
            } => cmd_track_add(&keyword, &country, &language, device, city_bias).await,
            TrackAction::List => cmd_track_list().await,
            TrackAction::Remove { id } => cmd_track_remove(&id).await,
            TrackAction::Run { engine } => cmd_track_run(&engine).await,
            TrackAction::Changes { target, limit } => {
                cmd_track_changes(target.as_deref(), limit).await
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Load config (defaults < file < env) and apply CLI flags on top.
fn resolve_config(engine: &EngineArgs) -> Result<AppConfig> {
    let mut config = load_config()?;
    if !engine.proxies.is_empty() {
        config.engine.proxy_pool = engine
            .proxies
            .iter()
            .flat_map(|p| parse_proxy_pool(p))
            .collect();
    }
    if let Some(max_nodes) = engine.max_nodes {
        config.engine.max_nodes = max_nodes;
    }
    if let Some(max_runtime_ms) = engine.max_runtime_ms {
        config.engine.max_runtime_ms = max_runtime_ms;
    }
    config.engine.validate()?;
    Ok(config)
}

fn build_params(query: &QueryArgs, config: &AppConfig) -> Result<ExtractionParams> {
    let params = ExtractionParams::new(
        query.keyword.as_str(),
        query.country.as_str(),
        query.language.as_str(),
        query.device.unwrap_or(config.engine.default_device),
    )?
    .with_depth(query.depth)
    .with_city_bias(query.city_bias.clone())
    .for_request();
    Ok(params)
}

fn build_executor(config: &AppConfig) -> Result<RunExecutor> {
    Ok(RunExecutor::new(
        Arc::new(HttpLauncher::new().with_request_timeout(config.engine.navigation_timeout())),
        config.engine.clone(),
    )?)
}

// ---------------------------------------------------------------------------
// Extraction commands
// ---------------------------------------------------------------------------

async fn cmd_extract(query: &QueryArgs, engine: &EngineArgs) -> Result<()> {
    let config = resolve_config(engine)?;
    let params = build_params(query, &config)?;
    let executor = build_executor(&config)?;

    info!(keyword = %params.keyword, depth = params.depth, device = %params.device, "extracting");

    // Ctrl-C stops the walk and keeps what was found so far.
    let (handle, cancel) = CancelFlag::pair();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing run with partial results");
            handle.cancel();
        }
    });

    let reporter = CliProgress::new();
    reporter.phase(&format!("Extracting \"{}\"", params.keyword));
    let result = executor.run_single_with(&params, cancel).await;
    interrupt.abort();
    reporter.finish();
    let result = result?;

    if let Some(dir) = &engine.evidence_dir {
        write_evidence(dir, &result.evidence)?;
    }

    let output = serde_json::json!({
        "keyword": params.keyword,
        "items": result.items,
        "stop_reason": result.stop_reason,
        "drift_hash": result.drift_hash,
        "egress": result.egress,
        "elapsed_ms": result.elapsed_ms,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_consensus(
    query: &QueryArgs,
    engine: &EngineArgs,
    runs: u8,
    strict: bool,
    parallelism: Option<usize>,
) -> Result<()> {
    let config = resolve_config(engine)?;
    let params = build_params(query, &config)?
        .with_runs(runs)
        .with_strict(strict);
    let parallelism = parallelism.unwrap_or(config.engine.consensus_parallelism);
    let source: Arc<dyn RunSource> = Arc::new(build_executor(&config)?);

    let reporter = CliProgress::new();
    let outcome = run_consensus(source, &params, parallelism, &reporter).await;
    reporter.finish();
    let outcome = outcome?;

    if outcome.drift_detected() {
        warn!("runs rendered different result layouts; confidence may be understated");
    }

    if let Some(dir) = &engine.evidence_dir {
        for (i, run) in outcome.runs.iter().enumerate() {
            write_evidence(&dir.join(format!("run_{}", i + 1)), &run.evidence)?;
        }
    }

    let report = ConsensusReport::from(&outcome);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Write whatever evidence a run captured; missing pieces are skipped.
fn write_evidence(dir: &Path, evidence: &Evidence) -> Result<()> {
    if evidence.is_empty() {
        info!(dir = %dir.display(), "no evidence captured");
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;

    if let Some(png) = &evidence.full_page {
        std::fs::write(dir.join("full_page.png"), png)?;
    }
    if let Some(html) = &evidence.container_html {
        std::fs::write(dir.join("container.html"), html)?;
    }
    for (i, crop) in evidence.crops.iter().enumerate() {
        std::fs::write(dir.join(format!("crop_{i:03}.png")), crop)?;
    }

    info!(dir = %dir.display(), crops = evidence.crops.len(), "evidence written");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tracking commands
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    Ok(Storage::open(&config.storage.resolve_path()?).await?)
}

async fn open_storage_readonly(config: &AppConfig) -> Result<Storage> {
    Ok(Storage::open_readonly(&config.storage.resolve_path()?).await?)
}

fn parse_target_id(raw: &str) -> Result<TargetId> {
    raw.parse()
        .map_err(|e| eyre!("invalid target id '{raw}': {e}"))
}

async fn cmd_track_add(
    keyword: &str,
    country: &str,
    language: &str,
    device: Option<Device>,
    city_bias: Option<String>,
) -> Result<()> {
    let config = load_config()?;
    // Validates and canonicalizes the same way a run would.
    let params = ExtractionParams::new(
        keyword,
        country,
        language,
        device.unwrap_or(config.engine.default_device),
    )?
    .with_city_bias(city_bias);

    let target = TrackedTarget {
        id: TargetId::new(),
        keyword: params.keyword,
        country: params.country,
        language: params.language,
        device: params.device,
        city_bias: params.city_bias,
        created_at: Utc::now(),
    };

    let storage = open_storage(&config).await?;
    storage.insert_target(&target).await?;

    println!("Tracking '{}' as {}", target.keyword, target.id);
    Ok(())
}

async fn cmd_track_list() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let targets = storage.all_targets().await?;

    if targets.is_empty() {
        println!("No tracked targets. Add one with `questiontree track add <keyword>`.");
        return Ok(());
    }

    for target in &targets {
        let last = storage
            .latest_snapshot(&target.id)
            .await?
            .map(|s| {
                format!(
                    "{} questions at {}",
                    s.questions.len(),
                    s.observed_at.format("%Y-%m-%d %H:%M")
                )
            })
            .unwrap_or_else(|| "never checked".into());
        println!(
            "{}  {:<32} {}-{} {:<7} {}",
            target.id, target.keyword, target.language, target.country, target.device, last
        );
    }
    Ok(())
}

async fn cmd_track_remove(id: &str) -> Result<()> {
    let config = load_config()?;
    let id = parse_target_id(id)?;
    let storage = open_storage(&config).await?;

    if !storage.delete_target(&id).await? {
        return Err(eyre!("no tracked target with id {id}"));
    }
    println!("Stopped tracking {id}");
    Ok(())
}

async fn cmd_track_run(engine: &EngineArgs) -> Result<()> {
    let config = resolve_config(engine)?;
    let storage = open_storage(&config).await?;
    let executor = build_executor(&config)?;

    let reporter = CliProgress::new();
    let report = run_cycle(&executor, &storage, Utc::now(), &reporter).await;
    reporter.finish();
    let report = report?;

    println!();
    println!("  Tracking cycle complete");
    println!("  Checked: {}", report.checked);
    println!("  Failed:  {}", report.failed);
    println!("  Added:   {}", report.added);
    println!("  Removed: {}", report.removed);
    println!("  Moved:   {}", report.moved);
    println!("  Time:    {:.1}s", report.elapsed.as_secs_f64());
    for failure in &report.failures {
        println!("  ! {failure}");
    }
    println!();
    Ok(())
}

async fn cmd_track_changes(target: Option<&str>, limit: u32) -> Result<()> {
    let config = load_config()?;
    let target = target.map(parse_target_id).transpose()?;
    let storage = open_storage_readonly(&config).await?;

    let changes = storage.list_changes(target.as_ref(), limit).await?;
    if changes.is_empty() {
        println!("No changes recorded.");
        return Ok(());
    }

    for change in &changes {
        let positions = match (change.old_position, change.new_position) {
            (Some(old), Some(new)) => format!(" ({old} -> {new})"),
            _ => String::new(),
        };
        println!(
            "{}  {:<16} {}{}",
            change.detected_at.format("%Y-%m-%d %H:%M"),
            change.kind.as_str(),
            change.raw,
            positions
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn run_finished(&self, current: usize, total: usize, result: &RunResult) {
        self.spinner.set_message(format!(
            "Run [{current}/{total}] found {} question(s)",
            result.items.len()
        ));
    }

    fn target_checked(&self, keyword: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Checked [{current}/{total}] {keyword}"));
    }
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_consensus_flags() {
        let cli = Cli::try_parse_from([
            "questiontree",
            "consensus",
            "rust async",
            "--device",
            "desktop",
            "-k",
            "2",
            "--strict",
            "--proxy",
            "http://a:8080,http://b:8080",
        ])
        .unwrap();

        let Command::Consensus {
            query,
            engine,
            runs,
            strict,
            ..
        } = cli.command
        else {
            panic!("expected consensus");
        };
        assert_eq!(query.keyword, "rust async");
        assert_eq!(query.device, Some(Device::Desktop));
        assert_eq!(query.depth, 1);
        assert_eq!(runs, 2);
        assert!(strict);
        assert_eq!(engine.proxies.len(), 1);
    }

    #[test]
    fn parses_track_changes() {
        let cli = Cli::try_parse_from(["questiontree", "-v", "track", "changes", "--limit", "5"])
            .unwrap();
        assert_eq!(cli.verbose, 1);
        assert!(matches!(
            cli.command,
            Command::Track {
                action: TrackAction::Changes { target: None, limit: 5 }
            }
        ));
    }

    #[test]
    fn request_depth_is_clamped() {
        let query = QueryArgs {
            keyword: "rust".into(),
            country: "US".into(),
            language: "en".into(),
            device: None,
            depth: 3,
            city_bias: None,
        };
        let params = build_params(&query, &AppConfig::default()).unwrap();
        assert_eq!(params.depth, 2);
        assert_eq!(params.device, Device::Mobile);
        assert_eq!(params.country, "us");
    }

    #[test]
    fn evidence_files_are_written() {
        let dir = std::env::temp_dir().join(format!("qt_evidence_{}", TargetId::new()));
        let evidence = Evidence {
            full_page: Some(b"png".to_vec()),
            container_html: Some("<div></div>".into()),
            crops: vec![b"a".to_vec(), b"b".to_vec()],
        };
        write_evidence(&dir, &evidence).unwrap();
        assert!(dir.join("full_page.png").exists());
        assert!(dir.join("container.html").exists());
        assert!(dir.join("crop_001.png").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
