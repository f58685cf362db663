use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use feed_archive::archive::{
    emit_feed, validate_stats_file, ArchiveLayout, CycleMode, CycleReport, DeltaLayout,
    FacetRouter,
};
use feed_archive::config::Config;
use feed_archive::feed::{backup_archive, build_client, load_registry, refresh_all, Registry};

#[derive(Parser, Debug)]
#[command(
    name = "feed-archive",
    about = "Fetch subscribed feeds and fold them into a paginated static archive"
)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, short, value_name = "FILE", default_value = "feed-archive.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every subscribed feed into per-source delta files
    Fetch,
    /// Merge this cycle's deltas into the archive and regenerate the syndication feed
    Merge,
    /// Fetch, merge and regenerate the syndication feed
    Run,
    /// Regenerate all/rss.xml from the newest global page
    Feed,
    /// Re-derive every downstream facet from all source facets on disk
    Rebuild,
    /// Check a stats document for malformed dates
    Validate {
        /// Stats file to check (defaults to <archive_dir>/stats.min.json)
        #[arg(value_name = "FILE")]
        path: Option<PathBuf>,
    },
    /// Download offline copies of every archived article
    Backup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    let layout = ArchiveLayout::new(&config.archive_dir);

    match args.command {
        Command::Fetch => {
            let registry = load_subscribers(&config)?;
            fetch(&config, &registry).await?;
        }
        Command::Merge => {
            let registry = load_subscribers(&config)?;
            let report = merge(&config, &registry, CycleMode::Incremental).await?;
            syndicate(&config, &layout)?;
            exit_on_failure(&report);
        }
        Command::Run => {
            let registry = load_subscribers(&config)?;
            fetch(&config, &registry).await?;
            let report = merge(&config, &registry, CycleMode::Incremental).await?;
            syndicate(&config, &layout)?;
            exit_on_failure(&report);
        }
        Command::Feed => syndicate(&config, &layout)?,
        Command::Rebuild => {
            let registry = load_subscribers(&config)?;
            let report = merge(&config, &registry, CycleMode::Rebuild).await?;
            syndicate(&config, &layout)?;
            exit_on_failure(&report);
        }
        Command::Validate { path } => {
            let path = path.unwrap_or_else(|| layout.stats_min_file());
            validate(&path)?;
        }
        Command::Backup => backup(&config, &layout).await?,
    }

    Ok(())
}

/// Registry problems are configuration defects: stop before any work.
fn load_subscribers(config: &Config) -> Result<Registry> {
    load_registry(&config.subscribers_path).with_context(|| {
        format!(
            "Failed to load subscribers from {}",
            config.subscribers_path.display()
        )
    })
}

async fn fetch(config: &Config, registry: &Registry) -> Result<()> {
    let options = config.fetch_options();
    let client = build_client(&options).context("Failed to build HTTP client")?;
    let deltas = DeltaLayout::new(&config.delta_dir);

    let results = refresh_all(&client, &registry.sources, &deltas, &options)
        .await
        .context("Failed to prepare delta directory")?;

    let failed: Vec<_> = results.iter().filter(|r| r.result.is_err()).collect();
    let items: usize = results.iter().filter_map(|r| r.result.as_ref().ok()).sum();
    println!(
        "Fetched {} feeds: {} items, {} failed",
        results.len(),
        items,
        failed.len()
    );
    for r in failed {
        if let Err(e) = &r.result {
            eprintln!("  {}: {}", r.url, e);
        }
    }
    Ok(())
}

async fn merge(config: &Config, registry: &Registry, mode: CycleMode) -> Result<CycleReport> {
    let router = FacetRouter::new(
        ArchiveLayout::new(&config.archive_dir),
        DeltaLayout::new(&config.delta_dir),
        config.merge_options(),
        config.merge_concurrency,
    );
    let report = router
        .run_cycle(&registry.subscribers, mode)
        .await
        .context("Merge cycle aborted")?;

    println!(
        "Merged {} facets ({} failed); global archive has {} pages",
        report.succeeded.len(),
        report.failed.len(),
        report.stats.global.all
    );
    for failure in &report.failed {
        eprintln!("  {}: {}", failure.facet, failure.error);
    }
    if let Some(e) = &report.stats_error {
        eprintln!("  stats: {}", e);
    }
    Ok(report)
}

fn syndicate(config: &Config, layout: &ArchiveLayout) -> Result<()> {
    let count = emit_feed(layout, &config.channel).context("Failed to write syndication feed")?;
    println!("Wrote {} ({} items)", layout.feed_file().display(), count);
    Ok(())
}

async fn backup(config: &Config, layout: &ArchiveLayout) -> Result<()> {
    let options = config.fetch_options();
    let client = build_client(&options).context("Failed to build HTTP client")?;
    let report = backup_archive(&client, layout, &options)
        .await
        .context("Backup failed")?;

    println!(
        "Backed up {} articles ({} new in index, {} failed, {} indexed)",
        report.downloaded, report.added, report.failed, report.indexed
    );
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let issues = validate_stats_file(path)?;
    if issues.is_empty() {
        println!("Validation passed: no issues found in {}", path.display());
        return Ok(());
    }

    eprintln!("Validation failed: issues found in {}", path.display());
    for (i, issue) in issues.iter().enumerate() {
        eprintln!("{}. {}", i + 1, issue);
    }
    std::process::exit(1);
}

fn exit_on_failure(report: &CycleReport) {
    if !report.is_success() {
        std::process::exit(1);
    }
}
