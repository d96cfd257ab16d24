use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dropout_early_warning::db::{self, PgStore};
use dropout_early_warning::{
    features, ingest, on_demand, report, BatchOptions, BatchOrchestrator, BatchProgress,
    CancellationToken, Classifier, HistoryRepository, HttpClassifier, PipelineConfig,
    PredictionSink, RuleBasedClassifier,
};

#[derive(Parser)]
#[command(name = "dropout-early-warning")]
#[command(about = "Dropout risk prediction for student welfare offices", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample students and academic history
    Seed,
    /// Import academic history from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Print a student's feature vector as JSON
    Features {
        #[arg(long)]
        student_id: String,
    },
    /// Score one student with the weighted rule and store the result
    Predict {
        #[arg(long)]
        student_id: String,
    },
    /// Predict dropout risk for many students in chunks
    #[command(group(
        ArgGroup::new("source")
            .args(["csv", "level"])
            .multiple(false)
    ))]
    PredictBatch {
        /// Read students from a CSV file instead of the database
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Only students at this reference level
        #[arg(long)]
        level: Option<String>,
        /// Base URL of the model service; the weighted rule is used when unset
        #[arg(long, env = "CLASSIFIER_URL")]
        classifier_url: Option<String>,
        #[arg(long, env = "BATCH_CHUNK_SIZE", default_value_t = 20)]
        chunk_size: usize,
        #[arg(long, env = "BATCH_CONCURRENCY", default_value_t = 3)]
        concurrency: usize,
        #[arg(long, env = "CLASSIFIER_TIMEOUT_SECS", default_value_t = 10)]
        timeout_secs: u64,
        #[arg(long, env = "CLASSIFIER_MAX_RETRIES", default_value_t = 2)]
        max_retries: u32,
        /// Do not write predictions back to the database
        #[arg(long)]
        no_save: bool,
        /// Write a markdown report here
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("LOG_JSON")
        .map(|value| matches!(value.as_str(), "1" | "true"))
        .unwrap_or(false);

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn connect(database_url: Option<&str>) -> anyhow::Result<PgPool> {
    let database_url =
        database_url.context("DATABASE_URL must be set to a production Postgres instance")?;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let database_url = cli.database_url.as_deref();

    match cli.command {
        Commands::InitDb => {
            let pool = connect(database_url).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect(database_url).await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let pool = connect(database_url).await?;
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} history rows from {}.", csv.display());
        }
        Commands::Features { student_id } => {
            let store = PgStore::new(connect(database_url).await?);
            let history = store.get_history(&student_id).await?;
            let vector = features::extract_from_history(&history)
                .with_context(|| format!("no usable history for student {student_id}"))?;
            println!("{}", serde_json::to_string_pretty(&vector.named())?);
        }
        Commands::Predict { student_id } => {
            let store = PgStore::new(connect(database_url).await?);
            let sink: &dyn PredictionSink = &store;
            let prediction = on_demand::predict_student(&store, Some(sink), &student_id)
                .await
                .with_context(|| format!("cannot predict student {student_id}"))?;
            println!(
                "{student_id}: {} (probability {:.2})",
                prediction.risk_tier, prediction.probability
            );
        }
        Commands::PredictBatch {
            csv,
            level,
            classifier_url,
            chunk_size,
            concurrency,
            timeout_secs,
            max_retries,
            no_save,
            report: report_path,
        } => {
            let config = PipelineConfig {
                chunk_size,
                concurrency,
                timeout: Duration::from_secs(timeout_secs),
                max_retries,
                ..PipelineConfig::default()
            };
            config.validate()?;

            let pool = match (&csv, database_url) {
                (Some(_), None) => None,
                _ => Some(connect(database_url).await?),
            };
            let students = match &csv {
                Some(path) => ingest::load_students(path)?,
                None => match &pool {
                    Some(pool) => db::fetch_students(pool, level.as_deref()).await?,
                    None => Vec::new(),
                },
            };
            if students.is_empty() {
                println!("No students found.");
                return Ok(());
            }

            let classifier: Arc<dyn Classifier> = match classifier_url.as_deref() {
                Some(url) => Arc::new(HttpClassifier::new(url, config.timeout)?),
                None => Arc::new(RuleBasedClassifier),
            };
            info!(classifier = classifier.name(), students = students.len(), "starting batch");

            let mut orchestrator = BatchOrchestrator::new(classifier, config);
            let mut previous = Default::default();
            if let Some(pool) = &pool {
                previous = db::fetch_predictions(pool).await?;
                if !no_save {
                    orchestrator = orchestrator.with_sink(Arc::new(PgStore::new(pool.clone())));
                }
            }

            let progress = Arc::new(BatchProgress::new());
            let cancel = CancellationToken::new();
            let observer = {
                let progress = Arc::clone(&progress);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_millis(500));
                    loop {
                        ticker.tick().await;
                        if progress.total_chunks() > 0 {
                            info!(
                                percent = progress.percent(),
                                completed = progress.completed_chunks(),
                                total = progress.total_chunks(),
                                "batch progress"
                            );
                        }
                    }
                })
            };
            let interrupt = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                })
            };

            let result = orchestrator
                .run_batch(
                    &students,
                    BatchOptions {
                        previous,
                        progress: Some(progress),
                        cancel: Some(cancel),
                    },
                )
                .await;
            observer.abort();
            interrupt.abort();
            let outcome = result?;

            println!("Predictions:");
            for student in students.iter() {
                println!(
                    "- {} ({}) {}",
                    student.full_name,
                    student.id,
                    outcome.view(&student.id)
                );
            }
            if !outcome.failed_chunks.is_empty() {
                println!(
                    "{} chunk(s) failed; their students were not predicted.",
                    outcome.failed_chunks.len()
                );
            }

            if let Some(path) = report_path {
                let markdown = report::build_report(&students, &outcome, chrono::Utc::now());
                std::fs::write(&path, markdown)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("Report written to {}.", path.display());
            }
        }
    }

    Ok(())
}
