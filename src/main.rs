use std::{fs::File, thread::sleep, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

mod app;
mod catalog;
mod cli;
mod config;
mod eid;
mod errors;
mod index;
mod jobs;
mod lock;
mod models;
mod query;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::App;
use catalog::{MetadataStore, ModelKind};
use config::Config;
use jobs::{JobId, JobRecord, JobStatus};
use query::QueryRequest;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_csv(path: &std::path::Path) -> anyhow::Result<Vec<catalog::NewEntry>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    catalog::read_entries_csv(file).with_context(|| format!("parsing {}", path.display()))
}

/// Follow a job on the tracker until it reaches a terminal state.
fn wait_for_job(app: &App, job_id: &JobId) -> anyhow::Result<JobRecord> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg} [{elapsed}]")?
            .progress_chars("##-"),
    );

    loop {
        let Some(record) = app.job(job_id) else {
            bail!("job {job_id} is not tracked");
        };

        bar.set_length(record.total as u64);
        bar.set_position(record.done as u64);
        bar.set_message(format!("{}%", record.progress));

        match record.status {
            JobStatus::Completed => {
                bar.finish_with_message("done");
                return Ok(record);
            }
            JobStatus::Failed => {
                bar.abandon_with_message("failed");
                return Ok(record);
            }
            JobStatus::Queued | JobStatus::Running => sleep(Duration::from_millis(100)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();

    let base_path = Config::base_path_from_env()?;
    let config = Config::load_with(&base_path)?;

    let _lock = if args.command.mutates() {
        Some(lock::DataDirLock::try_acquire(&base_path).context("locking data directory")?)
    } else {
        None
    };

    let mut app = App::open(config)?;

    match args.command {
        cli::Command::Daemon {} => {
            app.run_queue();
            web::start_daemon(app)?;
        }

        cli::Command::Import {
            name,
            csv,
            description,
        } => {
            let entries = read_csv(&csv)?;
            let source = csv.file_name().map(|n| n.to_string_lossy().to_string());
            let taxonomy = app.import_taxonomy(&name, entries, description, source)?;
            let count = app.metadata().count_entries(taxonomy.id)?;
            println!("imported {count} entries into '{}'", taxonomy.name);
        }

        cli::Command::Add { taxonomy, csv } => {
            let entries = read_csv(&csv)?;
            if app.store().exists(&taxonomy) {
                app.reload_models()?;
            }
            let added = app.add_entries(&taxonomy, entries)?;
            println!("added {added} entries to '{taxonomy}'");
        }

        cli::Command::Build { taxonomy } => {
            app.reload_models()?;
            app.run_queue();

            let admission = app.start_build(&taxonomy)?;
            let record = wait_for_job(&app, &admission.job_id)?;
            app.shutdown();

            if record.status == JobStatus::Failed {
                bail!(
                    "build of '{taxonomy}' failed: {}",
                    record.error.unwrap_or_default()
                );
            }
            println!("built '{taxonomy}' with {} entries", record.done);
        }

        cli::Command::Query {
            taxonomy,
            query,
            k,
            rerank,
        } => {
            app.reload_models()?;
            let request = QueryRequest {
                query,
                taxonomy,
                k: k.unwrap_or(app.config().query.default_k),
                rerank,
            };
            print_json(&app.query(&request)?)?;
        }

        cli::Command::Stats {} => {
            let taxonomies = app.list_taxonomies()?;
            for taxonomy in &taxonomies {
                let count = app.metadata().count_entries(taxonomy.id)?;
                let indexed = if app.store().exists_on_disk(&taxonomy.name) {
                    "indexed"
                } else {
                    "not indexed"
                };
                println!("{}: {count} entries, {indexed}", taxonomy.name);
            }
            print_json(&app.cache_stats())?;
        }

        cli::Command::DeleteTaxonomy { name } => {
            app.delete_taxonomy(&name)?;
            println!("deleted '{name}'");
        }

        cli::Command::Models { action } => match action {
            cli::ModelsAction::List {} => {
                print_json(&serde_json::json!({
                    "embedders": app.list_models(ModelKind::Embedder)?,
                    "rerankers": app.list_models(ModelKind::Reranker)?,
                    "active": app.active_models()?,
                }))?;
            }
            cli::ModelsAction::Activate {
                embedder_id,
                reranker_id,
            } => {
                app.set_active_models(embedder_id, reranker_id)?;
                println!("active models: embedder {embedder_id}, reranker {reranker_id}");
            }
            cli::ModelsAction::Reload {} => {
                app.reload_models()?;
                print_json(&app.active_models()?)?;
            }
        },
    }

    Ok(())
}
