use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use common::{
    storage::db::SurrealDbClient,
    utils::{
        chat::ChatModel,
        config::{get_config, AppConfig, RerankerMode},
        embedding::EmbeddingProvider,
    },
};
use index_pipeline::IndexPipeline;
use learning_loop::{
    mine_triplets, promote, resolve_triplets, AdapterTrainer, BaseScorer, PromoteOutcome,
    UsageEvent, UsageEventLog,
};
use retrieval_pipeline::{
    reranker::{Reranker, RerankerPool},
    RetrievalPipeline, SearchRequest,
};

#[derive(Parser)]
#[command(name = "tribrid", about = "Tri-brid retrieval over source-code corpora")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build or refresh the index for a corpus.
    Index(IndexArgs),
    /// Run a query against an indexed corpus.
    Search(SearchArgs),
    /// Show build status and store statistics for a corpus.
    Status { corpus_id: String },
    /// Delete a corpus from every store.
    Delete { corpus_id: String },
    /// Record explicit feedback on a result of a previous query.
    Feedback(FeedbackArgs),
    /// Mine triplets from usage and train a new adapter run.
    Train,
    /// Promote a trained adapter run into the active slot.
    Promote(PromoteArgs),
}

#[derive(Args)]
struct IndexArgs {
    corpus_id: String,
    /// Corpus root directory.
    path: PathBuf,
    /// Re-chunk and re-embed every file, ignoring the stored delta.
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct SearchArgs {
    corpus_id: String,
    query: String,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    deadline_ms: Option<u64>,
    #[arg(long)]
    no_vector: bool,
    #[arg(long)]
    no_sparse: bool,
    #[arg(long)]
    no_graph: bool,
    /// Emit the full response as JSON instead of a readable listing.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct FeedbackFlag {
    #[arg(long)]
    helpful: bool,
    #[arg(long)]
    unhelpful: bool,
}

#[derive(Args)]
struct FeedbackArgs {
    /// Query id printed by a previous `search`.
    query_id: String,
    chunk_id: String,
    #[command(flatten)]
    flag: FeedbackFlag,
}

#[derive(Args)]
struct PromoteArgs {
    /// Run directory under `<data_dir>/runs/`.
    run_id: String,
    #[arg(long)]
    epsilon: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.database.address,
            &config.database.username,
            &config.database.password,
            &config.database.namespace,
            &config.database.database,
        )
        .await?,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling in-flight work");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Index(args) => run_index(db, config, args, cancel).await?,
        Command::Search(args) => run_search(db, config, args, cancel).await?,
        Command::Status { corpus_id } => run_status(db, config, &corpus_id).await?,
        Command::Delete { corpus_id } => {
            let provider = Arc::new(EmbeddingProvider::from_config(&config).await?);
            let pipeline = IndexPipeline::new(db, provider, None, config);
            pipeline.delete_corpus(&corpus_id).await?;
            println!("corpus {corpus_id} deleted");
        }
        Command::Feedback(args) => run_feedback(config, args).await?,
        Command::Train => run_train(db, config).await?,
        Command::Promote(args) => run_promote(config, args)?,
    }

    Ok(())
}

async fn run_index(
    db: Arc<SurrealDbClient>,
    config: AppConfig,
    args: IndexArgs,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(EmbeddingProvider::from_config(&config).await?);
    info!(
        backend = provider.backend_label(),
        model = provider.model_code(),
        dimension = provider.dimension(),
        "embedding provider initialized"
    );
    let chat = ChatModel::from_config(&config);
    let pipeline = IndexPipeline::new(db, provider, chat, config);

    let (progress_tx, mut progress_rx) = watch::channel(index_pipeline::BuildProgress::default());
    let reporter = tokio::spawn(async move {
        while progress_rx.changed().await.is_ok() {
            let p = progress_rx.borrow().clone();
            info!(
                phase = ?p.phase,
                files = format!("{}/{}", p.files_processed, p.files_total),
                chunks = p.chunks_written,
                entities = p.entities_written,
                "build progress"
            );
        }
    });

    let report = pipeline
        .build(&args.corpus_id, &args.path, args.force, &cancel, Some(&progress_tx))
        .await?;
    drop(progress_tx);
    reporter.await.ok();

    println!(
        "build {:?}: {} files indexed ({} unchanged, {} deleted), {} chunks, \
         {} entities, {} relationships, {} communities, {} truncated chunks",
        report.outcome(),
        report.files_indexed,
        report.files_unchanged,
        report.files_deleted,
        report.chunks_written,
        report.entities_written,
        report.relationships_written,
        report.communities,
        report.truncated_chunks,
    );
    Ok(())
}

async fn run_search(
    db: Arc<SurrealDbClient>,
    config: AppConfig,
    args: SearchArgs,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(EmbeddingProvider::from_config(&config).await?);
    let reranker = Arc::new(Reranker::from_config(&config.reranker, &config.data_dir)?);
    let watcher = reranker.spawn_adapter_watcher(cancel.clone());

    let event_log = UsageEventLog::new(&config.data_dir);
    let pipeline = RetrievalPipeline::new(db, provider, Arc::clone(&reranker), config);

    let mut request = SearchRequest::new(args.query.clone(), args.corpus_id.clone());
    request.top_k = args.top_k;
    request.deadline_ms = args.deadline_ms;
    request.include_vector = !args.no_vector;
    request.include_sparse = !args.no_sparse;
    request.include_graph = !args.no_graph;

    let response = pipeline.search(request, &cancel).await?;

    // Every query feeds the learning loop.
    let query_id = Uuid::new_v4().to_string();
    let event = UsageEvent::Query {
        query_id: query_id.clone(),
        corpus_id: args.corpus_id.clone(),
        query: args.query.clone(),
        ranked_chunk_ids: response.matches.iter().map(|m| m.chunk_id.clone()).collect(),
        at: Utc::now(),
    };
    if let Err(err) = event_log.append(&event).await {
        warn!(error = %err, "failed to record usage event");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!(
            "query {query_id}: {} results in {} ms (fusion={}, reranker={})",
            response.matches.len(),
            response.latency_ms,
            response.fusion_method,
            response.reranker_mode,
        );
        for m in &response.matches {
            println!(
                "{:>2}. {:.4}  {}:{}-{}  [{}]",
                m.rank_within_source,
                m.score,
                m.chunk.file_path,
                m.chunk.start_line,
                m.chunk.end_line,
                m.chunk_id,
            );
        }
    }

    if let Some(watcher) = watcher {
        cancel.cancel();
        watcher.await.ok();
    }
    Ok(())
}

async fn run_status(
    db: Arc<SurrealDbClient>,
    config: AppConfig,
    corpus_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(EmbeddingProvider::from_config(&config).await?);
    let pipeline = IndexPipeline::new(db, provider, None, config);

    let status = pipeline.build_status(corpus_id)?;
    let stats = pipeline.stats(corpus_id).await?;
    println!("corpus {corpus_id}: status {status:?}");
    println!(
        "  chunks: {}, entities: {}, relationships: {}, communities: {}",
        stats.chunks, stats.entities, stats.relationships, stats.communities
    );
    if let Some(manifest) = pipeline.manifests().load(corpus_id)? {
        println!(
            "  built with {}@{}d, tokenizer {}, last built {:?}",
            manifest.embedding_model,
            manifest.embedding_dimension,
            manifest.sparse_tokenizer,
            manifest.last_built_at,
        );
        if let Some(error) = manifest.error {
            println!("  last error: {error}");
        }
    }
    Ok(())
}

async fn run_feedback(
    config: AppConfig,
    args: FeedbackArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let event_log = UsageEventLog::new(&config.data_dir);
    let event = UsageEvent::Feedback {
        query_id: args.query_id,
        chunk_id: args.chunk_id,
        helpful: args.flag.helpful,
        at: Utc::now(),
    };
    event_log.append(&event).await?;
    println!("feedback recorded");
    Ok(())
}

async fn run_train(
    db: Arc<SurrealDbClient>,
    config: AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let event_log = UsageEventLog::new(&config.data_dir);
    let events = event_log.read_all().await?;
    let triplets = mine_triplets(&events, &config.learning);
    let resolved = resolve_triplets(&db, triplets).await?;
    println!("mined {} usable triplets from {} events", resolved.len(), events.len());

    let scorer = match config.reranker.mode {
        RerankerMode::Local | RerankerMode::Learned => {
            BaseScorer::Pool(RerankerPool::from_config(&config.reranker, &config.data_dir)?)
        }
        _ => BaseScorer::LexicalOnly,
    };

    let run_id = format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S"));
    let trainer = AdapterTrainer::new(&config.data_dir, config.learning.clone());
    let output = trainer.train(&resolved, &scorer, &run_id).await?;

    // Record how much usage each corpus had contributed at training time.
    let manifests = common::manifest::ManifestStore::new(&config.data_dir);
    let mut corpora: Vec<&str> = resolved.iter().map(|t| t.corpus_id.as_str()).collect();
    corpora.sort_unstable();
    corpora.dedup();
    for corpus_id in corpora {
        if let Some(mut manifest) = manifests.load(corpus_id)? {
            manifest.triplet_count_at_last_train = resolved
                .iter()
                .filter(|t| t.corpus_id == corpus_id)
                .count() as u64;
            manifests.store(&manifest)?;
        }
    }

    println!(
        "trained {}: holdout MRR {:.4} over {} triplets; promote with: tribrid promote {}",
        run_id, output.metrics.holdout_mrr, output.metrics.triplets, run_id
    );
    Ok(())
}

fn run_promote(config: AppConfig, args: PromoteArgs) -> Result<(), Box<dyn std::error::Error>> {
    let run_dir = PathBuf::from(&config.data_dir).join("runs").join(&args.run_id);
    let adapter_dir = match &config.reranker.adapter_path {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(&config.data_dir).join("adapters").join("default"),
    };
    let epsilon = args.epsilon.unwrap_or(config.learning.epsilon);

    match promote(&run_dir, &adapter_dir, epsilon)? {
        PromoteOutcome::Promoted {
            run_id,
            fingerprint,
            metric,
            previous_metric,
        } => {
            println!(
                "promoted {run_id} (MRR {metric:.4}, previous {previous_metric:.4}); \
                 fingerprint {fingerprint}"
            );
        }
        PromoteOutcome::Refused {
            candidate_metric,
            baseline_metric,
            epsilon,
        } => {
            println!(
                "refused: candidate MRR {candidate_metric:.4} does not beat baseline \
                 {baseline_metric:.4} by more than {epsilon}"
            );
        }
    }
    Ok(())
}
