//! Toolsight CLI
//!
//! Operator surface for the visual product retrieval service: run searches,
//! inspect departments and feedback statistics, trigger fine-tuning, and
//! manage model backups. Authorization is the caller's concern; `--admin`
//! merely asserts an externally checked role.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;

use toolsight_core::prelude::*;
use toolsight_core::training::{Hyperparameters, ReembedMode};
use toolsight_core::{FeedbackWriter, ImageFetcher, RetrievalOptions};

/// Toolsight - visual product search and fine-tuning operations
#[derive(Parser)]
#[command(name = "toolsight")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the Toolsight visual product retrieval service")]
struct Cli {
    /// Path to a TOML config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the catalog with a photo
    Search {
        /// Image path or URL
        image: String,
        /// Restrict to a department
        #[arg(long)]
        department: Option<String>,
        /// Max results
        #[arg(long)]
        top_k: Option<usize>,
        /// Skip the stability pass (single escalation run)
        #[arg(long)]
        fast: bool,
        /// Diagnostic: raw top-k with no thresholds
        #[arg(long)]
        aggressive: bool,
        /// Asserts an externally verified admin role (photo limit bypass)
        #[arg(long)]
        admin: bool,
        /// Acting user id for rate limiting and session bookkeeping
        #[arg(long, default_value = "0")]
        user: i64,
    },

    /// List departments with item counts
    Departments,

    /// Feedback and catalog statistics
    Stats,

    /// Re-embed the catalog under the active model
    Reembed,

    /// Run a fine-tuning session over unconsumed feedback
    Train {
        /// Minimum unconsumed examples required
        #[arg(long)]
        min_examples: Option<usize>,
        /// Epoch count override
        #[arg(long)]
        epochs: Option<usize>,
        /// Register the artifact but defer re-embed/promotion
        #[arg(long)]
        deferred: bool,
    },

    /// Re-embed and promote a previously registered artifact
    Activate {
        /// Artifact version to activate
        version: String,
    },

    /// Insert a catalog item, embedding its picture fused with its name
    AddItem {
        /// Catalog item id
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Image path or URL
        #[arg(long)]
        picture: String,
        /// Product page URL
        #[arg(long, default_value = "")]
        url: String,
        /// Department label
        #[arg(long)]
        department: Option<String>,
    },

    /// Model backup operations
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Training session history, newest first
    Sessions {
        /// Rows to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// List registered backups
    List,
    /// Snapshot the serving weights right now
    Create,
    /// Restore a backup (snapshots the current model first)
    Restore {
        /// Backup version to restore
        version: String,
    },
    /// Drop all but the newest N backups
    Cleanup {
        /// Backups to keep
        #[arg(long, default_value = "10")]
        keep: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("toolsight=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: AppConfig) -> anyhow::Result<()> {
    match command {
        Commands::Search {
            image,
            department,
            top_k,
            fast,
            aggressive,
            admin,
            user,
        } => {
            let service = Service::start(&config).await?;
            let method = if aggressive {
                SearchMethod::Aggressive
            } else if fast {
                SearchMethod::Thresholds
            } else {
                SearchMethod::Stability
            };
            let mut pipeline_config = PipelineConfig::from_app(&config);
            if let Some(k) = top_k {
                pipeline_config.top_k = k;
            }
            let pipeline = SearchPipeline::new(
                service.embedder.clone(),
                Arc::new(RetrievalEngine::new(
                    Arc::clone(&service.catalog),
                    retrieval_options(&config),
                )),
                Arc::new(SessionStore::new(config.session_ttl())),
                UserRateLimiter::new(config.general_rate_limit, config.photo_rate_limit),
                pipeline_config,
            );

            let response = pipeline
                .handle(SearchRequest {
                    user_id: user,
                    image: ImageSource::parse(&image),
                    photo_fingerprint: image.clone(),
                    department: department
                        .as_deref()
                        .map(Department::parse)
                        .unwrap_or_default(),
                    is_admin: admin,
                    method,
                    cancel: CancellationToken::new(),
                })
                .await?;

            if response.results.is_empty() {
                println!("{}", "Nothing close enough in the catalog.".yellow());
                return Ok(());
            }
            println!(
                "session {}  ({} results)",
                response.session_short_id.bold(),
                response.results.len()
            );
            for (index, hit) in response.results.iter().enumerate() {
                println!(
                    "{:>2}. {}  {:.1}%  {}  {}",
                    index + 1,
                    hit.item_id.bold(),
                    hit.similarity * 100.0,
                    hit.department.as_deref().unwrap_or("-"),
                    hit.product_name
                );
            }
        }

        Commands::Departments => {
            let catalog = Arc::new(CatalogStore::open(&config.catalog_db)?);
            let departments = catalog.departments()?;
            if departments.is_empty() {
                println!("{}", "Catalog has no departments yet.".yellow());
            }
            for (name, count) in departments {
                println!("{:>6}  {}", count, name);
            }
        }

        Commands::Stats => {
            let catalog = Arc::new(CatalogStore::open(&config.catalog_db)?);
            let feedback = Arc::new(FeedbackStore::open(&config.feedback_db)?);
            let registry = ModelRegistry::open(&config.models_dir)?;
            let stats = feedback.statistics()?;

            println!("{}", "Catalog".bold());
            println!("  products:            {}", catalog.count()?);
            let active = registry
                .active()?
                .map(|a| a.version)
                .unwrap_or_else(|| "base (no promotion yet)".into());
            println!("  active model:        {active}");

            println!("{}", "Feedback".bold());
            println!("  examples total:      {}", stats.total_examples);
            println!("  correct/incorrect:   {}/{}", stats.correct, stats.incorrect);
            println!("  new items reported:  {}", stats.new_item);
            println!("  unconsumed:          {}", stats.unconsumed);
            println!("  pending annotations: {}", stats.pending_annotations);
            if let Some(version) = stats.active_session_version {
                println!("  active session:      {version}");
            }

            let hint = stats.unconsumed >= config.training.auto_min_examples
                && stats.correct > 0
                && stats.incorrect > 0;
            if hint {
                println!("{}", "Enough feedback accumulated; consider `toolsight train`.".green());
            }
        }

        Commands::Reembed => {
            let service = Service::start(&config).await?;
            let encoder = service.embedder.current();
            let report = service
                .catalog
                .re_embed_all(encoder.as_ref(), &ImageFetcher::default())
                .await?;
            println!(
                "re-embedded {} rows ({} failed)",
                report.updated.to_string().green(),
                report.failed
            );
        }

        Commands::Train {
            min_examples,
            epochs,
            deferred,
        } => {
            let service = Service::start(&config).await?;
            let mode = if deferred {
                ReembedMode::Deferred
            } else {
                ReembedMode::Blocking
            };
            let trainer = service.trainer(mode)?;
            let mut hp = Hyperparameters::from(&config.training);
            if let Some(epochs) = epochs {
                hp.epochs = epochs;
            }
            let min = min_examples.unwrap_or(config.training.manual_min_examples);

            println!("starting fine-tuning session (min {min} examples)...");
            let outcome = trainer.fine_tune(min, hp).await?;
            println!("{}", "Training completed.".green().bold());
            println!("  version:    {}", outcome.version);
            println!("  session:    #{}", outcome.session_id);
            println!("  examples:   {}", outcome.examples_used);
            if let (Some(before), Some(after)) =
                (outcome.accuracy_before, outcome.accuracy_after)
            {
                println!("  accuracy:   {before:.3} -> {after:.3}");
            }
            println!("  duration:   {}s", outcome.duration_seconds);
            println!("  re-embedded: {}", outcome.reembedded);
        }

        Commands::AddItem {
            id,
            name,
            picture,
            url,
            department,
        } => {
            let service = Service::start(&config).await?;
            let encoder = service.embedder.current();
            service
                .catalog
                .insert_embedded(
                    &Product {
                        item_id: id.clone(),
                        department: department.map(|d| d.to_uppercase()),
                        product_name: name,
                        url,
                        picture,
                        vector: None,
                        model_version: None,
                    },
                    encoder.as_ref(),
                    &ImageFetcher::default(),
                )
                .await?;
            println!("{} {}", "inserted".green(), id.bold());
        }

        Commands::Activate { version } => {
            let service = Service::start(&config).await?;
            let trainer = service.trainer(ReembedMode::Blocking)?;
            let reembedded = trainer.activate(&version).await?;
            println!(
                "{} activated, {} rows re-embedded",
                version.green().bold(),
                reembedded
            );
        }

        Commands::Sessions { limit } => {
            let feedback = FeedbackStore::open(&config.feedback_db)?;
            let sessions = feedback.list_sessions(limit)?;
            if sessions.is_empty() {
                println!("{}", "No training sessions recorded.".yellow());
            }
            for session in sessions {
                let marker = if session.is_active { "*" } else { " " };
                let accuracy = match (session.accuracy_before, session.accuracy_after) {
                    (Some(before), Some(after)) => format!("{before:.3} -> {after:.3}"),
                    _ => "-".to_string(),
                };
                println!(
                    "{marker} #{:<4} {}  {} examples ({}+/{}-)  acc {}  {}s",
                    session.id,
                    session.model_version.bold(),
                    session.examples_count,
                    session.positive_examples,
                    session.negative_examples,
                    accuracy,
                    session.duration_seconds,
                );
            }
        }

        Commands::Backups { command } => {
            let service = Service::start(&config).await?;
            let trainer = service.trainer(ReembedMode::Blocking)?;
            match command {
                BackupCommands::List => {
                    let backups = trainer.list_backups()?;
                    if backups.is_empty() {
                        println!("{}", "No backups registered.".yellow());
                    }
                    for backup in backups {
                        println!(
                            "{}  {:>10} bytes  {}",
                            backup.version.bold(),
                            backup.size_bytes,
                            backup.created_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                BackupCommands::Create => {
                    let version = trainer.create_backup().await?;
                    println!("{} {}", "backup created:".green(), version.bold());
                }
                BackupCommands::Restore { version } => {
                    println!("restoring {version}...");
                    let reembedded = trainer.restore_backup(&version).await?;
                    println!(
                        "{} restored, {} rows re-embedded",
                        version.green().bold(),
                        reembedded
                    );
                }
                BackupCommands::Cleanup { keep } => {
                    let removed = trainer.cleanup_backups(keep).await?;
                    println!("removed {} backups, kept {}", removed.len(), keep);
                    for version in removed {
                        println!("  - {version}");
                    }
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// SERVICE WIRING
// ============================================================================

/// The wired-together core components the commands operate on
struct Service {
    catalog: Arc<CatalogStore>,
    feedback: Arc<FeedbackStore>,
    registry: Arc<ModelRegistry>,
    embedder: EmbedderHandle,
    writer: FeedbackWriter,
    base_weights: PathBuf,
}

impl Service {
    /// Open stores and load the active (or base) encoder
    async fn start(config: &AppConfig) -> anyhow::Result<Self> {
        let catalog = Arc::new(CatalogStore::open(&config.catalog_db)?);
        let feedback = Arc::new(FeedbackStore::open(&config.feedback_db)?);
        let registry = Arc::new(ModelRegistry::open(&config.models_dir)?);
        let writer = FeedbackWriter::spawn(Arc::clone(&feedback));

        let encoder_config = match registry.active()? {
            Some(artifact) => {
                tracing::info!(version = %artifact.version, "loading promoted model");
                ClipEmbedderConfig::for_artifact(&artifact.path, &artifact.version)
            }
            None => ClipEmbedderConfig::default(),
        };
        let encoder = tokio::task::spawn_blocking(move || ClipEmbedder::load(&encoder_config))
            .await?
            .context("loading CLIP encoder")?;
        let base_weights = encoder.weights_path().to_path_buf();
        let embedder = EmbedderHandle::new(Arc::new(encoder));

        Ok(Self {
            catalog,
            feedback,
            registry,
            embedder,
            writer,
            base_weights,
        })
    }

    /// Build a trainer over this service's components
    fn trainer(&self, mode: ReembedMode) -> anyhow::Result<Trainer> {
        Ok(Trainer::new(
            TrainerDeps {
                feedback: Arc::clone(&self.feedback),
                writer: self.writer.handle(),
                catalog: Arc::clone(&self.catalog),
                registry: Arc::clone(&self.registry),
                embedder: self.embedder.clone(),
                fetcher: ImageFetcher::default(),
                base_weights: self.base_weights.clone(),
            },
            mode,
        ))
    }
}

fn retrieval_options(config: &AppConfig) -> RetrievalOptions {
    RetrievalOptions {
        user_floor: config.similarity_threshold,
        secondary_filter: config.secondary_filter_threshold,
        stability_passes: config.stability_passes,
    }
}
