use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dwell_engine::{ConsolidateConfig, ConsolidatePipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dwell-cli")]
#[command(about = "Dwell property dataset consolidation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge all snapshot files into the unified dashboard dataset.
    Consolidate(ConsolidateArgs),
    /// Show the snapshot sources a run would read, without running one.
    Sources(ConsolidateArgs),
}

#[derive(Debug, Default, Args)]
struct ConsolidateArgs {
    /// Root directory holding the per-category snapshot directories.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Override the sold snapshot directory.
    #[arg(long)]
    sold_dir: Option<PathBuf>,
    /// Override the listings snapshot directory.
    #[arg(long)]
    listings_dir: Option<PathBuf>,
    /// Override the rentals snapshot directory.
    #[arg(long)]
    rentals_dir: Option<PathBuf>,
    /// Unified dataset output path.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Snapshot source registry (sources.yaml).
    #[arg(long)]
    sources: Option<PathBuf>,
    /// Write the dataset even when a category has no readable snapshots.
    #[arg(long)]
    allow_empty: bool,
}

impl ConsolidateArgs {
    /// Env-backed defaults with CLI flags layered on top.
    fn into_config(self) -> ConsolidateConfig {
        let mut config = ConsolidateConfig::from_env();
        if let Some(data_dir) = self.data_dir {
            // A moved data root drags the default output along unless the
            // output was pinned explicitly.
            if std::env::var_os("DWELL_OUT").is_none() && self.out.is_none() {
                config.output_path = data_dir.join("unified.json");
            }
            config.data_root = data_dir;
        }
        if let Some(out) = self.out {
            config.output_path = out;
        }
        if let Some(sources) = self.sources {
            config.registry_path = Some(sources);
        }
        if let Some(dir) = self.sold_dir {
            config.sold_dir = Some(dir);
        }
        if let Some(dir) = self.listings_dir {
            config.listings_dir = Some(dir);
        }
        if let Some(dir) = self.rentals_dir {
            config.rentals_dir = Some(dir);
        }
        if self.allow_empty {
            config.allow_empty = true;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli
        .command
        .unwrap_or(Commands::Consolidate(ConsolidateArgs::default()))
    {
        Commands::Consolidate(args) => {
            let pipeline = ConsolidatePipeline::from_config(args.into_config())?;
            let summary = pipeline.run_once().await?;
            println!(
                "consolidation complete: run_id={} properties={} listings={} rentals={} duplicates_dropped={} files_skipped={} -> {}",
                summary.run_id,
                summary.sold_unique,
                summary.listings,
                summary.rentals,
                summary.duplicates_dropped,
                summary.sold_files_skipped
                    + summary.listing_files_skipped
                    + summary.rental_files_skipped,
                summary.output_path
            );
        }
        Commands::Sources(args) => {
            let config = args.into_config();
            for source in config.resolve_sources()? {
                println!(
                    "{:<10} {:<16} {}",
                    source.category,
                    source.source_id,
                    source.dir.display()
                );
            }
        }
    }

    Ok(())
}
