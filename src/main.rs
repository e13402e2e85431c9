use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod corpus;
mod semantic;

use app::{AppFactory, AppPaths};
use config::Config;
use corpus::DirectoryCorpus;
use semantic::{EmbeddingRepository, IndexReport, IndexTask, Query, ScoredId, SearchService};

#[derive(Debug, Serialize)]
struct SearchHit {
    id: u64,
    score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();

    let paths = AppFactory::get_paths()?;
    let config = AppFactory::load_config(&paths)?;

    match args.command {
        cli::Command::Index { dir } => {
            let report = run_index(&paths, &config, &dir)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        cli::Command::Search { text, dir, limit } => {
            let repository = AppFactory::open_repository(&paths, &config)?;
            let service = AppFactory::text_search_service(&config, repository)?;
            let limit = limit.unwrap_or(config.search_limit);
            let results = service.search(&Query::Text(text), Some(limit))?;
            print_hits(results, dir.as_deref(), &config)?;
        }

        cli::Command::Similar { id, dir, limit } => {
            let repository = AppFactory::open_repository(&paths, &config)?;
            let service = SearchService::new(repository);
            let limit = limit.unwrap_or(config.search_limit);
            let results = service.search(&Query::Photo(id), Some(limit))?;
            print_hits(results, dir.as_deref(), &config)?;
        }

        cli::Command::Show { id } => {
            let repository = AppFactory::open_repository(&paths, &config)?;
            let Some(record) = repository.get_by_id(id)? else {
                bail!("photo {id} is not indexed");
            };
            let captured = chrono::DateTime::from_timestamp(record.captured_at, 0)
                .map(|date| date.to_rfc3339())
                .unwrap_or_else(|| record.captured_at.to_string());

            println!("id:          {}", record.id);
            println!("captured_at: {captured}");
            println!("dimensions:  {}", record.vector.len());
        }

        cli::Command::Stats {} => {
            let repository = AppFactory::open_repository(&paths, &config)?;
            let file_size = std::fs::metadata(repository.path())
                .map(|m| m.len())
                .unwrap_or_default();

            println!("store:      {}", repository.path().display());
            println!("embeddings: {}", repository.len()?);
            println!("dimensions: {}", repository.dimensions());
            println!("size:       {file_size} bytes");
            println!("model:      {}", config.visual_model);
        }

        cli::Command::Clear { yes } => {
            let repository = AppFactory::open_repository(&paths, &config)?;
            let count = repository.len()?;
            if count == 0 {
                println!("nothing to clear");
                return Ok(());
            }

            if !yes {
                let confirmed = inquire::Confirm::new(&format!("Delete all {count} embeddings?"))
                    .with_default(false)
                    .prompt()?;
                if !confirmed {
                    return Ok(());
                }
            }

            repository.clear()?;
            println!("{count} embeddings deleted");
        }

        cli::Command::Tokenize { text } => {
            let tokenizer = AppFactory::load_tokenizer(&config)?;
            let tokens = tokenizer.encode_sequence(&text)?;
            println!("{}", serde_json::to_string_pretty(&tokens)?);
        }
    }

    Ok(())
}

fn run_index(paths: &AppPaths, config: &Config, dir: &Path) -> anyhow::Result<IndexReport> {
    let (repository, task) = start_index(paths, config, dir)
        .context("Processing could not complete")?;

    let cancel = task.cancel_token();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, stopping after the current photo");
        cancel.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let pb = ProgressBar::new(0).with_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} [{elapsed_precise}<{eta_precise}]")?,
    );
    let mut progress = task.progress();
    while !task.is_finished() {
        if progress.has_changed().unwrap_or(false) {
            let current = *progress.borrow_and_update();
            pb.set_length(current.total as u64);
            pb.set_position(current.processed as u64);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    let current = *progress.borrow();
    pb.set_position(current.processed as u64);
    pb.finish_and_clear();

    let report = task.join()?;
    repository.compact().context("Failed to compact embedding store")?;

    Ok(report)
}

fn start_index(
    paths: &AppPaths,
    config: &Config,
    dir: &Path,
) -> anyhow::Result<(Arc<semantic::FileRepository>, IndexTask)> {
    let corpus = DirectoryCorpus::scan(dir, &config.extensions)
        .with_context(|| format!("Failed to scan {}", dir.display()))?;
    if corpus.is_empty() {
        log::warn!("No photos found under {}", dir.display());
    }
    let repository = AppFactory::open_repository(paths, config)?;
    let builder = AppFactory::index_builder(config, repository.clone())?;
    let task = IndexTask::spawn(builder, corpus).context("Failed to start indexing")?;
    Ok((repository, task))
}

fn print_hits(results: Vec<ScoredId>, dir: Option<&Path>, config: &Config) -> anyhow::Result<()> {
    let corpus = match dir {
        Some(dir) => Some(
            DirectoryCorpus::scan(dir, &config.extensions)
                .with_context(|| format!("Failed to scan {}", dir.display()))?,
        ),
        None => None,
    };

    let hits: Vec<SearchHit> = results
        .into_iter()
        .map(|r| SearchHit {
            id: r.id,
            score: r.score,
            path: corpus
                .as_ref()
                .and_then(|c| c.path_of(r.id))
                .map(Path::to_path_buf),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&hits)?);
    Ok(())
}
