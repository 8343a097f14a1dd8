#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use schema_taxonomy::classifier::{Classifier, Embedder, GatewayEmbedder, LlmClassifier};
use schema_taxonomy::config::Config;
use schema_taxonomy::gateway::compat::CompatAdapter;
use schema_taxonomy::gateway::{NoopUsageSink, ProviderGateway, StderrUsageSink, UsageSink};
use schema_taxonomy::pipeline::{Pipeline, PipelineConfig};
use schema_taxonomy::problem::load_problems;
use schema_taxonomy::registry::{load_seed_vocabulary, RegistrySet};
use schema_taxonomy::saturation::{analyze, SaturationReport};
use schema_taxonomy::store::{CorpusStore, SqliteCorpusStore};

#[derive(Parser)]
#[command(name = "taxonomy", version, about = "Problem-schema taxonomy induction")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct StoreArgs {
    /// SQLite corpus store (default: $TAXONOMY_STORE_PATH or ./taxonomy.sqlite)
    #[arg(long)]
    store: Option<PathBuf>,
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct ModelArgs {
    /// Directory holding one registry JSON file per dimension
    #[arg(long, default_value = "registry")]
    registry_dir: PathBuf,
    /// Override the number of rounds per (item, dimension)
    #[arg(long)]
    rounds: Option<u32>,
    /// Attempts in flight at once
    #[arg(long)]
    parallel: Option<usize>,
    /// Re-issue rounds that are already on record
    #[arg(long)]
    no_resume: bool,
    /// Skip the embedding stage of normalization
    #[arg(long)]
    no_embeddings: bool,
    /// Print one JSON line per provider call to stderr
    #[arg(long)]
    usage_log: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the extraction rounds for every item
    Sample {
        #[arg(long)]
        items: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Normalize and vote every sampled item
    Consolidate {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        model: ModelArgs,
        /// Re-vote items that already have consensus
        #[arg(long)]
        recompute: bool,
    },
    /// Write the saturation report
    Analyze {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Also write the saturation curves as CSV
        #[arg(long)]
        curve_csv: Option<PathBuf>,
    },
    /// Sample, consolidate and analyze in one go
    Run {
        #[arg(long)]
        items: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        curve_csv: Option<PathBuf>,
    },
    /// Inspect or seed label registries
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
    /// Dump attempts and consensus records as JSON lines
    Export {
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum RegistryCommands {
    /// Write a snapshot of every registry as one JSON document
    Export {
        #[arg(long, default_value = "registry")]
        registry_dir: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Add a seed vocabulary (never overwrites existing labels)
    Seed {
        #[arg(long, default_value = "registry")]
        registry_dir: PathBuf,
        #[arg(long)]
        vocab: PathBuf,
    },
    /// Label counts per dimension
    Stats {
        #[arg(long, default_value = "registry")]
        registry_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Sample { items, store, model } => {
            let problems = load_problems(&items)?;
            let (pipeline, _lock) = open_pipeline(&store, &model, false)?;
            let summary = pipeline.sample(&problems).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Consolidate {
            store,
            model,
            recompute,
        } => {
            let (pipeline, _lock) = open_pipeline(&store, &model, recompute)?;
            let summary = pipeline.consolidate().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Analyze {
            store,
            out,
            curve_csv,
        } => {
            let config = Config::load_or_default(store.config.as_deref())?;
            let db = open_store(&store)?;
            let corpus = db.consensus_corpus().await?;
            let report = analyze(&corpus, &config.saturation_config());
            emit_report(&report, out.as_deref(), curve_csv.as_deref())?;
        }
        Commands::Run {
            items,
            store,
            model,
            out,
            curve_csv,
        } => {
            let problems = load_problems(&items)?;
            let (pipeline, _lock) = open_pipeline(&store, &model, false)?;
            let summary = pipeline.run(&problems).await?;
            eprintln!(
                "sampled {} attempts ({} skipped, {} failed); consolidated {} items",
                summary.sampling.issued,
                summary.sampling.skipped,
                summary.sampling.failed,
                summary.consolidation.consolidated
            );
            emit_report(&summary.report, out.as_deref(), curve_csv.as_deref())?;
        }
        Commands::Registry { command } => match command {
            RegistryCommands::Export { registry_dir, out } => {
                let registries = RegistrySet::open(registry_dir)?;
                let snapshot = registries.snapshot().await;
                let json = serde_json::to_string_pretty(&snapshot)?;
                match out {
                    Some(path) => std::fs::write(path, json)?,
                    None => println!("{json}"),
                }
            }
            RegistryCommands::Seed {
                registry_dir,
                vocab,
            } => {
                let vocab = load_seed_vocabulary(&vocab)?;
                let registries = RegistrySet::open(registry_dir)?;
                let added = registries.seed(&vocab).await;
                registries.save_all().await?;
                println!("seeded {added} labels");
            }
            RegistryCommands::Stats { registry_dir } => {
                let registries = RegistrySet::open(registry_dir)?;
                for stats in registries.stats().await {
                    println!(
                        "{:<18} {:>5} labels ({} seeded, {} induced, {} aliases)",
                        stats.dimension.as_str(),
                        stats.total,
                        stats.seeded,
                        stats.induced,
                        stats.aliases
                    );
                }
            }
        },
        Commands::Export { store, out } => {
            let db = open_store(&store)?;
            let stats = db.export_jsonl(&out).await?;
            println!(
                "exported {} attempts and {} consensus records to {}",
                stats.attempts,
                stats.consensus,
                out.display()
            );
        }
    }

    Ok(())
}

fn open_store(args: &StoreArgs) -> Result<SqliteCorpusStore, Box<dyn std::error::Error>> {
    let path = args
        .store
        .clone()
        .unwrap_or_else(SqliteCorpusStore::default_path);
    Ok(SqliteCorpusStore::open(path)?)
}

type StoreGuard = Option<schema_taxonomy::store::StoreLock>;

fn open_pipeline(
    store_args: &StoreArgs,
    model: &ModelArgs,
    recompute: bool,
) -> Result<(Pipeline, StoreGuard), Box<dyn std::error::Error>> {
    let mut config = Config::load_or_default(store_args.config.as_deref())?;
    if let Some(rounds) = model.rounds {
        config.sampling.rounds = rounds;
    }
    if let Some(parallel) = model.parallel {
        config.sampling.parallel = parallel;
    }
    if model.no_resume {
        config.sampling.resume = false;
    }
    if model.no_embeddings {
        config.models.use_embeddings = false;
    }
    config.validate()?;

    let db = open_store(store_args)?;
    let lock = db.lock_exclusive()?;
    let store: Arc<dyn CorpusStore> = Arc::new(db);
    let registries = Arc::new(RegistrySet::open(&model.registry_dir)?);

    let adapter = CompatAdapter::from_env()?;
    let run_id = Uuid::new_v4();
    tracing::info!(%run_id, model = %config.models.chat, "starting");

    let (classifier, embedder) = if model.usage_log {
        model_clients(adapter, Arc::new(StderrUsageSink), &config, run_id)
    } else {
        model_clients(adapter, Arc::new(NoopUsageSink), &config, run_id)
    };

    let mut pipeline_config = PipelineConfig::from(&config);
    pipeline_config.recompute = recompute;
    let pipeline = Pipeline::new(classifier, embedder, store, registries, pipeline_config);
    Ok((pipeline, lock))
}

fn model_clients<U: UsageSink + 'static>(
    adapter: CompatAdapter,
    sink: Arc<U>,
    config: &Config,
    run_id: Uuid,
) -> (Arc<dyn Classifier>, Option<Arc<dyn Embedder>>) {
    let gateway = Arc::new(ProviderGateway::with_config(adapter, sink, config.gateway_config()));
    let mut classifier = LlmClassifier::new(gateway.clone(), config.models.chat.clone(), "taxonomy")
        .with_run(run_id);
    if let Some(max) = config.models.max_tokens {
        classifier = classifier.max_tokens(max);
    }
    let embedder: Option<Arc<dyn Embedder>> = config.models.use_embeddings.then(|| {
        Arc::new(
            GatewayEmbedder::new(
                gateway,
                config.models.embedding.clone(),
                config.models.embedding_batch_size,
            )
            .with_run(run_id),
        ) as Arc<dyn Embedder>
    });
    (Arc::new(classifier), embedder)
}

fn emit_report(
    report: &SaturationReport,
    out: Option<&Path>,
    curve_csv: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(report)?;
    match out {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    if let Some(path) = curve_csv {
        std::fs::write(path, report.to_csv())?;
    }
    for (dim, verdict) in &report.verdicts {
        eprintln!("{:<18} {verdict}", dim.as_str());
    }
    Ok(())
}
