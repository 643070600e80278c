use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod artifacts;
mod cluster;
mod config;
mod db;
mod error;
mod features;
mod impute;
mod models;
mod normalize;
mod pipeline;
mod quality;
mod recommend;
mod report;
mod schema;
mod table;

use config::AppConfig;
use db::{LearnerStore, PgStore, UpsertBuffer};
use models::LearnerQuery;
use pipeline::{Pipeline, StreamingOptions};
use report::ClusteringSummary;

#[derive(Parser)]
#[command(name = "learner-pathways")]
#[command(about = "Learner clustering and next-step recommendations for Group Scholar", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "PATHWAYS_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the learner store schema
    InitDb,
    /// Combine one or more sources into the canonical table and its
    /// imputation report
    Normalize {
        /// Source CSV; repeat to combine several
        #[arg(long, required = true)]
        csv: Vec<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Fit the encoder and cluster models, then label every learner
    Fit {
        /// Source CSV; repeat to combine several
        #[arg(long, required = true)]
        csv: Vec<PathBuf>,
        /// Read the file in chunks instead of loading it whole
        #[arg(long)]
        streaming: bool,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        sample_cap: Option<usize>,
        /// Skip the Postgres upsert even when DATABASE_URL is set
        #[arg(long)]
        no_store: bool,
    },
    /// Recommend the next step for a single learner
    Recommend {
        #[arg(long)]
        time_spent: f64,
        #[arg(long)]
        avg_score: f64,
        #[arg(long)]
        accuracy: f64,
        #[arg(long)]
        difficulty_level: i64,
    },
    /// Recommend for every learner in a CSV file
    BatchRecommend {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Score the fitted clusters against a CSV file
    Quality {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        sample: Option<usize>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// The store is optional for fit runs: without it the run still writes
/// every file artifact.
async fn open_store() -> Option<PgStore> {
    let Ok(database_url) = std::env::var(db::DATABASE_URL_ENV) else {
        tracing::warn!("DATABASE_URL is not set, learner upserts are skipped");
        return None;
    };
    match db::connect(&database_url).await {
        Ok(pool) => Some(PgStore::new(pool)),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "learner store unavailable, upserts are skipped");
            None
        }
    }
}

fn describe(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn run_fit<S: LearnerStore>(
    pipeline: &mut Pipeline,
    csvs: &[PathBuf],
    streaming: Option<StreamingOptions>,
    sink: Option<&mut UpsertBuffer<'_, S>>,
) -> anyhow::Result<ClusteringSummary> {
    let summary = match streaming {
        Some(options) => pipeline.fit_streaming(csvs, options, sink).await,
        None => pipeline.fit_table(csvs, sink).await,
    }
    .with_context(|| format!("failed to fit on {}", describe(csvs)))?;
    Ok(summary)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::InitDb => {
            let database_url = std::env::var(db::DATABASE_URL_ENV)
                .context("DATABASE_URL must be set to a production Postgres instance")?;
            let store = PgStore::new(db::connect(&database_url).await?);
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Normalize { csv, out } => {
            let pipeline = Pipeline::new(config)?;
            let outcome = pipeline
                .normalize_csv(&csv, &out)
                .with_context(|| format!("failed to normalize {}", describe(&csv)))?;
            println!(
                "Wrote {} canonical rows ({} synthetic) to {}.",
                outcome.rows,
                outcome.imputation.synthetic_rows,
                outcome.canonical_path.display()
            );
            println!("Imputation report written to {}.", outcome.report_path.display());
        }
        Commands::Fit {
            csv,
            streaming,
            chunk_size,
            sample_cap,
            no_store,
        } => {
            let streaming = (streaming || chunk_size.is_some() || sample_cap.is_some()).then(|| {
                StreamingOptions {
                    chunk_size: chunk_size.unwrap_or(config.training.chunk_size).max(1),
                    sample_cap: sample_cap.unwrap_or(config.training.sample_cap).max(1),
                }
            });
            let batch_size = config.store.batch_size;
            let store = if no_store { None } else { open_store().await };
            let mut pipeline = Pipeline::new(config)?;

            let summary = match &store {
                Some(store) => {
                    let mut buffer = UpsertBuffer::new(store, batch_size);
                    let mut summary = run_fit(&mut pipeline, &csv, streaming, Some(&mut buffer)).await?;
                    summary.store = Some(buffer.finish().await);
                    summary
                }
                None => run_fit::<PgStore>(&mut pipeline, &csv, streaming, None).await?,
            };
            let (summary_path, report_path) = pipeline.write_run_reports(&summary)?;

            println!("Clustered {} learners (run {}):", summary.rows, summary.run_id);
            for size in summary.cluster_sizes.iter() {
                println!("- cluster {}: {} learners", size.cluster, size.count);
            }
            if let Some(upserts) = &summary.store {
                println!(
                    "Upserted {} learners; {} of {} batches failed.",
                    upserts.written, upserts.failed_batches, upserts.batches
                );
            }
            println!("Summary written to {}.", summary_path.display());
            println!("Report written to {}.", report_path.display());
        }
        Commands::Recommend {
            time_spent,
            avg_score,
            accuracy,
            difficulty_level,
        } => {
            let mut pipeline = Pipeline::new(config)?;
            let query = LearnerQuery {
                time_spent,
                avg_score,
                accuracy,
                difficulty_level,
            };
            let recommendation = pipeline
                .recommend_one(&query)
                .context("run `fit` before requesting recommendations")?;
            println!("{}", serde_json::to_string_pretty(&recommendation)?);
        }
        Commands::BatchRecommend { csv, out } => {
            let mut pipeline = Pipeline::new(config)?;
            let (rows, path) = pipeline
                .recommend_csv(&csv, out.as_deref())
                .with_context(|| format!("failed to recommend for {}", csv.display()))?;
            println!("Wrote {rows} recommendations to {}.", path.display());
        }
        Commands::Quality { csv, sample } => {
            let mut pipeline = Pipeline::new(config)?;
            let metrics = pipeline
                .quality_csv(&csv, sample)
                .with_context(|| format!("failed to score {}", csv.display()))?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
    }

    Ok(())
}
