//! completion-aggregator - Hierarchical Completion Aggregation
//!
//! A CLI tool that recalculates per-user aggregate completion records
//! (earned/possible/percent) for a course content tree from raw leaf
//! completion events, and writes a Markdown/JSON progress report.
//!
//! Exit codes:
//!   0 - Success (all requested user updates completed)
//!   1 - Runtime error (bad input files, failed updates, write failure)

mod aggregation;
mod cli;
mod completion;
mod config;
mod course;
mod models;
mod report;
mod store;
mod tasks;

use anyhow::{Context, Result};
use chrono::Utc;
use cli::{Args, OutputFormat};
use completion::CompletionLog;
use config::Config;
use course::{CompletionMode, CourseCatalog, CourseStore};
use models::{BlockKey, CourseKey};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use store::InMemoryStore;
use tasks::UpdateContext;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("completion-aggregator v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    // Run the aggregation
    match run_aggregation(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Aggregation failed: {}", e);
            eprintln!("\n❌ Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .aggregator.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(".aggregator.toml");

    if path.exists() {
        eprintln!("⚠️  .aggregator.toml already exists. Remove it first or edit it manually.");
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).context("Failed to write .aggregator.toml")?;

    println!("✅ Created .aggregator.toml with default settings.");
    println!("   Edit it to customize registered aggregators and report output.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run the complete aggregation workflow. Returns exit code (0 or 1).
async fn run_aggregation(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    // Load configuration
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    // Step 1: Load the course structure
    let course_path = args
        .course
        .as_deref()
        .context("No course file provided")?;
    println!("📚 Loading course structure: {}", course_path.display());

    let mut catalog = CourseCatalog::new();
    let course_key = catalog.load_file(course_path)?;
    let blocks = catalog.load_structure(&course_key)?;

    println!("   Course: {}", course_key);
    println!(
        "   Blocks: {} ({} aggregators, {} completable, {} excluded)",
        blocks.block_count(),
        blocks.count_by_mode(CompletionMode::Aggregator),
        blocks.count_by_mode(CompletionMode::Completable),
        blocks.count_by_mode(CompletionMode::Excluded),
    );

    // Handle --dry-run: report the structure and exit
    if args.dry_run {
        println!("\n✅ Dry run complete. No records were written.");
        return Ok(0);
    }

    // Step 2: Load completion events
    let completions_path = args
        .completions
        .as_deref()
        .context("No completion file provided")?;
    println!("📥 Loading completion events: {}", completions_path.display());

    let mut completions = CompletionLog::new();
    let event_count = completions.load_file(completions_path)?;
    println!("   Events: {}", event_count);

    // Step 3: Prepare the aggregate store
    let aggregate_store = InMemoryStore::new(
        config.aggregation.registered_aggregators.iter().cloned(),
    );
    if let Some(ref store_path) = args.store {
        if store_path.exists() {
            let loaded = aggregate_store.load_snapshot(store_path)?;
            println!("🗃️  Loaded {} prior records from {}", loaded, store_path.display());
        } else {
            info!("No snapshot at {}, starting empty", store_path.display());
        }
    }

    // Step 4: Determine the users to update
    let users = match args.user {
        Some(ref user) => vec![user.clone()],
        None => completions.users(&course_key),
    };
    if users.is_empty() {
        warn!("No completion events recorded for {}", course_key);
        println!("⚠️  No users to update for {}", course_key);
    }

    let changed_blocks: HashSet<BlockKey> = args
        .changed
        .iter()
        .flatten()
        .map(|block| BlockKey::new(block.clone()))
        .collect();
    let force = config.aggregation.force;

    // Step 5: Run the updates
    println!(
        "\n🧮 Updating aggregators for {} user(s){}...",
        users.len(),
        if force { " (forced)" } else { "" }
    );

    let ctx = Arc::new(UpdateContext {
        catalog,
        completions,
        store: aggregate_store,
    });
    let outcome = tasks::update_course(
        Arc::clone(&ctx),
        course_key.clone(),
        users.clone(),
        changed_blocks,
        force,
        !args.quiet,
    )
    .await;

    // Step 6: Save the snapshot
    if let Some(ref store_path) = args.store {
        let saved = ctx.store.save_snapshot(store_path)?;
        println!("💾 Saved {} records to {}", saved, store_path.display());
    }

    // Step 7: Generate and save the report
    println!("\n📝 Generating report...");

    let duration = start_time.elapsed().as_secs_f64();
    let report = build_run_report(&ctx, &course_key, &users, &outcome, &config, force, duration)?;

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };

    let output_path = std::path::PathBuf::from(&config.general.output);
    std::fs::write(&output_path, &output)
        .with_context(|| format!("Failed to write report to {}", output_path.display()))?;

    // Print summary
    println!("\n📊 Aggregation Summary:");
    println!("   Users updated: {}", outcome.succeeded.len());
    if !outcome.failed.is_empty() {
        println!("   Users failed: {}", outcome.failed.len());
    }
    println!("   Records stored: {}", ctx.store.len());
    println!("   Duration: {:.1}s", duration);
    println!(
        "\n✅ Aggregation complete! Report saved to: {}",
        output_path.display()
    );

    if !outcome.all_succeeded() {
        eprintln!(
            "\n⛔ {} user update(s) failed. See the log for details.",
            outcome.failed.len()
        );
        return Ok(1);
    }

    Ok(0)
}

/// Assemble the run report from the store and batch outcome.
fn build_run_report(
    ctx: &UpdateContext,
    course_key: &CourseKey,
    users: &[String],
    outcome: &tasks::BatchOutcome,
    config: &Config,
    forced: bool,
    duration: f64,
) -> Result<report::RunReport> {
    let metadata = report::RunMetadata {
        course_key: course_key.clone(),
        generated_at: Utc::now(),
        users_updated: outcome.succeeded.len(),
        users_failed: outcome.failed.len(),
        records_stored: ctx.store.len(),
        duration_seconds: duration,
        forced,
    };

    let report_users: &[String] = if config.report.include_users {
        users
    } else {
        &[]
    };

    Ok(report::build_report(
        &ctx.store,
        course_key,
        report_users,
        config.report.min_percent,
        metadata,
    )?)
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from .aggregator.toml");
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
