//! repolens - index a source tree and query it with hybrid retrieval.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repolens_core::config::{Config, Settings};
use repolens_core::registry::StaticRegistry;
use repolens_embed::ProviderHandle;
use repolens_hybrid::{BuildProgress, IndexManager, IndexState, RebuildOptions};

#[derive(Parser)]
#[command(name = "repolens", version, about = "Local hybrid code search")]
struct Cli {
    /// Project id, as configured under [projects]
    #[arg(short, long, global = true, default_value = "default")]
    project: String,

    /// Source root for the project, overriding [projects]
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build or refresh the project's index
    Index {
        /// Rebuild from scratch instead of applying changes
        #[arg(long)]
        full: bool,
    },
    /// Search the project's index
    Query {
        text: String,
        #[arg(short, default_value_t = 10)]
        k: usize,
    },
    /// Show index freshness
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load().context("loading configuration")?;
    let settings = config.settings()?;
    let manager = build_manager(&cli, settings)?;

    match &cli.command {
        Command::Index { full } => index(&cli, &manager, *full),
        Command::Query { text, k } => query(&cli, &manager, text, *k),
        Command::Status => status(&cli, &manager),
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn,repolens=info",
        1 => "info,repolens=debug",
        _ => "debug",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_manager(cli: &Cli, settings: Settings) -> Result<IndexManager> {
    let base = env::current_dir()?;
    let mut registry = StaticRegistry::new(settings.project_roots(&base));
    if let Some(root) = &cli.root {
        registry = registry.with_project(cli.project.clone(), base.join(root));
    }
    let provider = ProviderHandle::from_config(&settings.embedding)?;
    Ok(IndexManager::new(settings, Arc::new(provider), Arc::new(registry))?)
}

fn index(cli: &Cli, manager: &IndexManager, full: bool) -> Result<()> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{bar:40}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    let sink = bar.clone();
    let options = RebuildOptions {
        full,
        cancel: None,
        progress: Some(Arc::new(move |p: &BuildProgress| {
            sink.set_length(p.total as u64);
            sink.set_position(p.embedded as u64);
            sink.set_message(if p.full { "full build" } else { "incremental" });
        })),
    };
    let meta = manager.refresh(&cli.project, &options);
    bar.finish_and_clear();
    let meta = meta?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
    } else {
        println!(
            "indexed {} documents for '{}' (generation {}, backend {})",
            meta.document_count, cli.project, meta.generation, meta.backend
        );
    }
    Ok(())
}

fn query(cli: &Cli, manager: &IndexManager, text: &str, k: usize) -> Result<()> {
    let outcome = manager.query(&cli.project, text, k)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    if let Some(reason) = &outcome.reason {
        eprintln!("note: {}", serde_json::to_string(reason)?);
    }
    for (i, hit) in outcome.results.iter().enumerate() {
        let ranks = format!(
            "lex {} / sem {}",
            hit.lexical_rank.map_or("-".to_string(), |r| r.to_string()),
            hit.semantic_rank.map_or("-".to_string(), |r| r.to_string())
        );
        println!("{:>3}. {:.5}  {}  ({ranks})", i + 1, hit.score, hit.path);
    }
    Ok(())
}

fn status(cli: &Cli, manager: &IndexManager) -> Result<()> {
    let status = manager.status(&cli.project)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    let state = match status.state {
        IndexState::Missing => "missing",
        IndexState::Building => "building",
        IndexState::Fresh => "fresh",
        IndexState::Stale => "stale",
    };
    println!("project:    {}", status.project_id);
    println!("state:      {state}");
    println!("documents:  {}", status.document_count);
    if let Some(built_at) = status.built_at() {
        println!("built at:   {}", built_at.to_rfc3339());
    }
    if let Some(backend) = &status.backend {
        println!("backend:    {backend} (dim {})", status.dimension);
    }
    println!("tombstones: {} ({:.1}%)", status.tombstones, status.tombstone_ratio * 100.0);
    if !status.stale_reasons.is_empty() {
        println!("reasons:    {}", serde_json::to_string(&status.stale_reasons)?);
    }
    Ok(())
}
