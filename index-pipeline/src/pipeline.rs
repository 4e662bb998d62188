use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use common::{
    error::AppError,
    manifest::{BuildStatus, CorpusManifest, ManifestStore},
    storage::{
        db::SurrealDbClient,
        indexes::{ensure_runtime_indexes, rebuild_indexes},
        types::{
            chunk::Chunk, code_entity::CodeEntity, community::Community,
            entity_embedding::CodeEntityEmbedding, relationship::EntityRelationship,
        },
    },
    utils::{chat::ChatModel, config::AppConfig, embedding::EmbeddingProvider, ids},
};

use crate::chunker::{self, ast, ast::ParsedSource};
use crate::graph::{communities, FileForGraph, GraphBuilder, GraphOutput};
use crate::loader::{self, CorpusFile};

/// Cancellation is checked every this many graph writes.
const GRAPH_WRITE_CHECK_EVERY: usize = 25;

const CHUNK_SUMMARY_PROMPT: &str = "Summarize what this code chunk does in one \
short sentence. Respond with the sentence only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Scanning,
    Chunking,
    GraphBuild,
    Communities,
    Committing,
    Done,
}

#[derive(Debug, Clone)]
pub struct BuildProgress {
    pub phase: BuildPhase,
    pub files_total: usize,
    pub files_processed: usize,
    pub chunks_written: usize,
    pub entities_written: usize,
}

impl Default for BuildProgress {
    fn default() -> Self {
        Self {
            phase: BuildPhase::Scanning,
            files_total: 0,
            files_processed: 0,
            chunks_written: 0,
            entities_written: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Complete,
    Cancelled,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub files_indexed: usize,
    pub files_deleted: usize,
    pub files_unchanged: usize,
    pub chunks_written: usize,
    pub entities_written: usize,
    pub relationships_written: usize,
    pub communities: usize,
    pub truncated_chunks: usize,
    pub cancelled: bool,
}

impl BuildReport {
    pub fn outcome(&self) -> BuildOutcome {
        if self.cancelled {
            BuildOutcome::Cancelled
        } else {
            BuildOutcome::Complete
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusStats {
    pub chunks: usize,
    pub entities: usize,
    pub relationships: usize,
    pub communities: usize,
}

/// Runs end-to-end corpus builds: load, chunk, embed, graph, manifest.
/// At most one build per corpus runs at a time; conflicting requests fail
/// fast with the in-progress status.
pub struct IndexPipeline {
    db: Arc<SurrealDbClient>,
    provider: Arc<EmbeddingProvider>,
    chat: Option<ChatModel>,
    manifests: ManifestStore,
    config: AppConfig,
    active_builds: Arc<DashMap<String, ()>>,
}

impl IndexPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        provider: Arc<EmbeddingProvider>,
        chat: Option<ChatModel>,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            provider,
            chat,
            manifests: ManifestStore::new(&config.data_dir),
            config,
            active_builds: Arc::new(DashMap::new()),
        }
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// The `building` state lives in this registry, not in the manifest file,
    /// so a cancelled build leaves the manifest byte-identical.
    pub fn build_status(&self, corpus_id: &str) -> Result<BuildStatus, AppError> {
        if self.active_builds.contains_key(corpus_id) {
            return Ok(BuildStatus::Building);
        }
        Ok(self
            .manifests
            .load(corpus_id)?
            .map_or(BuildStatus::Idle, |m| m.build_status))
    }

    #[instrument(skip_all, fields(corpus_id, force))]
    pub async fn build(
        &self,
        corpus_id: &str,
        root: &Path,
        force: bool,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<BuildProgress>>,
    ) -> Result<BuildReport, AppError> {
        let _guard = BuildGuard::claim(&self.active_builds, corpus_id)?;

        match self.run_build(corpus_id, root, force, cancel, progress).await {
            Ok(report) => {
                info!(
                    corpus_id,
                    files = report.files_indexed,
                    chunks = report.chunks_written,
                    entities = report.entities_written,
                    cancelled = report.cancelled,
                    "build finished"
                );
                Ok(report)
            }
            Err(err) => {
                // Rejections that happen before any work (config mismatch)
                // must not disturb the manifest.
                if matches!(err, AppError::Validation(_)) {
                    return Err(err);
                }
                // A failed build records its reason; the prior complete state
                // stays queryable. Cancellation never reaches this path.
                let reason = format!("{}: {err}", err.kind());
                let mut manifest = self
                    .manifests
                    .load(corpus_id)?
                    .unwrap_or_else(|| CorpusManifest::new(corpus_id.to_owned(), &self.config));
                manifest.build_status = BuildStatus::Error;
                manifest.error = Some(reason.clone());
                if let Err(store_err) = self.manifests.store(&manifest) {
                    warn!(error = %store_err, "failed to record build error in manifest");
                }
                Err(AppError::BuildFailed(reason))
            }
        }
    }

    async fn run_build(
        &self,
        corpus_id: &str,
        root: &Path,
        force: bool,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<BuildProgress>>,
    ) -> Result<BuildReport, AppError> {
        let mut report = BuildReport::default();
        let mut tracker = ProgressTracker::new(progress);

        let prior = self.manifests.load(corpus_id)?;
        let prior_hashes = match &prior {
            Some(prior_manifest) => {
                let embedding_changed = prior_manifest.embedding_dimension
                    != self.config.embedding.dimension
                    || prior_manifest.embedding_model != self.config.embedding.model;
                let tokenizer_changed =
                    prior_manifest.sparse_tokenizer != self.config.sparse_search.tokenizer;
                if embedding_changed || tokenizer_changed {
                    if !force {
                        return Err(AppError::Validation(format!(
                            "corpus {corpus_id} was built with {}@{}d/{} tokenizer; changing \
                             embedding or tokenizer requires a forced full rebuild",
                            prior_manifest.embedding_model,
                            prior_manifest.embedding_dimension,
                            prior_manifest.sparse_tokenizer,
                        )));
                    }
                    self.wipe_corpus_data(corpus_id).await?;
                    BTreeMap::new()
                } else {
                    prior_manifest.file_hashes.clone()
                }
            }
            None => BTreeMap::new(),
        };

        ensure_runtime_indexes(
            &self.db,
            self.config.embedding.dimension,
            &self.config.sparse_search,
        )
        .await?;

        tracker.set_phase(BuildPhase::Scanning);
        let indexer_config = self.config.indexer.clone();
        let root_owned = root.to_path_buf();
        let files =
            tokio::task::spawn_blocking(move || loader::load_corpus(&root_owned, &indexer_config))
                .await??;
        tracker.set_files_total(files.len());

        let current_hashes: BTreeMap<String, String> = files
            .iter()
            .map(|file| (file.rel_path.clone(), ids::content_hash(&file.content)))
            .collect();

        // Files the previous build saw that are now gone.
        for deleted_path in prior_hashes.keys() {
            if current_hashes.contains_key(deleted_path) {
                continue;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(report);
            }
            Chunk::delete_by_file(&self.db, corpus_id, deleted_path).await?;
            CodeEntity::delete_by_file(&self.db, corpus_id, deleted_path).await?;
            report.files_deleted += 1;
        }

        let (changed, unchanged): (Vec<CorpusFile>, Vec<CorpusFile>) =
            files.into_iter().partition(|file| {
                force
                    || prior_hashes.get(&file.rel_path)
                        != current_hashes.get(&file.rel_path)
            });
        report.files_unchanged = unchanged.len();
        drop(unchanged);

        tracker.set_phase(BuildPhase::Chunking);
        let files_for_graph = self
            .chunk_embed_write(corpus_id, changed, cancel, &mut report, &mut tracker)
            .await?;
        if report.cancelled {
            return Ok(report);
        }

        tracker.set_phase(BuildPhase::GraphBuild);
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        self.build_graph(corpus_id, files_for_graph, cancel, &mut report, &mut tracker)
            .await?;
        if report.cancelled {
            return Ok(report);
        }

        tracker.set_phase(BuildPhase::Communities);
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        self.rebuild_communities(corpus_id, &mut report).await?;

        tracker.set_phase(BuildPhase::Committing);
        rebuild_indexes(&self.db).await?;

        // Manifest is written last, atomically, so readers either see the
        // previous complete build or this one.
        let mut manifest = CorpusManifest::new(corpus_id.to_owned(), &self.config);
        manifest.build_status = BuildStatus::Complete;
        manifest.last_built_at = Some(Utc::now());
        manifest.file_hashes = current_hashes;
        if let Some(prior_manifest) = prior {
            manifest.triplet_count_at_last_train = prior_manifest.triplet_count_at_last_train;
            manifest.active_adapter = prior_manifest.active_adapter;
        }
        self.manifests.store(&manifest)?;

        tracker.set_phase(BuildPhase::Done);
        Ok(report)
    }

    /// Stream changed files through chunker and embedder with bounded
    /// concurrency, writing chunk batches in sorted file order.
    async fn chunk_embed_write(
        &self,
        corpus_id: &str,
        changed: Vec<CorpusFile>,
        cancel: &CancellationToken,
        report: &mut BuildReport,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<Vec<FileForGraph>, AppError> {
        let batch_size = self.config.embedding.batch_size.max(1);
        let concurrency = self.config.indexer.embedder_concurrency.max(1);
        let chunker_config = self.config.chunker.clone();
        let corpus = corpus_id.to_owned();

        type FileResult = Result<
            Option<(CorpusFile, Option<ParsedSource>, Vec<Chunk>, Vec<Vec<f32>>, usize)>,
            AppError,
        >;

        let summarizer = if self.config.chunker.summaries {
            self.chat.clone()
        } else {
            None
        };

        let mut stream = futures::stream::iter(changed.into_iter().map(|file| {
            let provider = Arc::clone(&self.provider);
            let chunker_config = chunker_config.clone();
            let corpus = corpus.clone();
            let cancel = cancel.clone();
            let summarizer = summarizer.clone();
            async move {
                let module_name = module_name_of(&file.rel_path);
                let parsed = file
                    .language
                    .as_deref()
                    .and_then(|lang| ast::parse_source(lang, &module_name, &file.content));
                let output =
                    chunker::chunk_file(parsed.as_ref(), &file.content, &chunker_config, &file.rel_path);
                let truncated = output.truncated_count;

                let mut chunks: Vec<Chunk> = output
                    .drafts
                    .into_iter()
                    .map(|draft| {
                        Chunk::new(
                            corpus.clone(),
                            file.rel_path.clone(),
                            draft.start_line,
                            draft.end_line,
                            file.language.clone(),
                            draft.content,
                            draft.token_count,
                            draft.truncated,
                        )
                    })
                    .collect();

                // Optional one-line summaries for chunks that lost content to
                // the token budget.
                if let Some(chat) = &summarizer {
                    for chunk in chunks.iter_mut().filter(|c| c.truncated) {
                        match chat.generate(CHUNK_SUMMARY_PROMPT, &chunk.content).await {
                            Ok(summary) => chunk.summary = Some(summary.trim().to_owned()),
                            Err(err) => {
                                warn!(path = %file.rel_path, error = %err, "chunk summary failed")
                            }
                        }
                    }
                }

                // Cancellation is observed at every embedding batch boundary.
                let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
                for batch in chunks.chunks(batch_size) {
                    if cancel.is_cancelled() {
                        return FileResult::Ok(None);
                    }
                    let texts: Vec<String> =
                        batch.iter().map(|chunk| chunk.content.clone()).collect();
                    vectors.extend(provider.embed_batch(&texts).await?);
                }

                FileResult::Ok(Some((file, parsed, chunks, vectors, truncated)))
            }
        }))
        .buffered(concurrency);

        let write_batch = self.config.indexer.write_batch_size.max(1);
        let mut files_for_graph = Vec::new();

        while let Some(item) = stream.next().await {
            let Some((file, parsed, chunks, vectors, truncated)) = item? else {
                report.cancelled = true;
                break;
            };
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            // Replace any previous rows for the file before writing.
            Chunk::delete_by_file(&self.db, corpus_id, &file.rel_path).await?;
            CodeEntity::delete_by_file(&self.db, corpus_id, &file.rel_path).await?;

            let pairs: Vec<(Chunk, Vec<f32>)> =
                chunks.iter().cloned().zip(vectors.into_iter()).collect();
            for batch in pairs.chunks(write_batch) {
                Chunk::store_batch_with_embeddings(batch.to_vec(), &self.db).await?;
            }

            report.chunks_written += chunks.len();
            report.truncated_chunks += truncated;
            report.files_indexed += 1;
            tracker.file_done(chunks.len());

            files_for_graph.push(FileForGraph {
                rel_path: file.rel_path,
                parsed,
                chunks,
            });
        }

        Ok(files_for_graph)
    }

    async fn build_graph(
        &self,
        corpus_id: &str,
        files: Vec<FileForGraph>,
        cancel: &CancellationToken,
        report: &mut BuildReport,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<(), AppError> {
        if files.is_empty() {
            return Ok(());
        }

        // Entities from unchanged files keep cross-file edges resolvable.
        let known = CodeEntity::list_for_corpus(&self.db, corpus_id).await?;
        let builder = GraphBuilder::new(
            corpus_id.to_owned(),
            self.config.graph_search.clone(),
            self.chat.clone(),
        );
        let GraphOutput {
            entities,
            relationships,
            semantic_failures,
        } = builder.build(&files, &known).await;
        if semantic_failures > 0 {
            warn!(semantic_failures, "some chunks fell back to structural-only extraction");
        }

        // Entities are upserted before relationships.
        let descriptions: Vec<String> = entities
            .iter()
            .map(|entity| {
                entity
                    .description
                    .clone()
                    .unwrap_or_else(|| entity.qualified_name.clone())
            })
            .collect();

        for (i, entity) in entities.iter().enumerate() {
            if i % GRAPH_WRITE_CHECK_EVERY == 0 && cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            self.db.upsert_item(entity.clone()).await?;
        }

        // Description embeddings back the graph retriever's seed matching.
        let batch_size = self.config.embedding.batch_size.max(1);
        let mut offset = 0usize;
        while offset < descriptions.len() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            let end = (offset + batch_size).min(descriptions.len());
            let vectors = self.provider.embed_batch(&descriptions[offset..end]).await?;
            for (entity, vector) in entities[offset..end].iter().zip(vectors) {
                let embedding =
                    CodeEntityEmbedding::new(&entity.id, corpus_id.to_owned(), vector);
                self.db.upsert_item(embedding).await?;
            }
            offset = end;
        }

        for (i, relationship) in relationships.iter().enumerate() {
            if i % GRAPH_WRITE_CHECK_EVERY == 0 && cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            relationship.store_relationship(&self.db).await?;
        }

        report.entities_written = entities.len();
        report.relationships_written = relationships.len();
        tracker.entities_done(entities.len());
        Ok(())
    }

    /// Communities are recomputed over the full graph at the end of a build.
    async fn rebuild_communities(
        &self,
        corpus_id: &str,
        report: &mut BuildReport,
    ) -> Result<(), AppError> {
        let entities = CodeEntity::list_for_corpus(&self.db, corpus_id).await?;
        let entity_ids: Vec<String> = entities.iter().map(|e| e.id.clone()).collect();
        let relationships = EntityRelationship::list_for_corpus(&self.db, corpus_id).await?;

        let mut detected = communities::detect_communities(corpus_id, &entity_ids, &relationships);
        if let Some(chat) = &self.chat {
            let names: BTreeMap<String, String> = entities
                .iter()
                .map(|e| (e.id.clone(), e.name.clone()))
                .collect();
            communities::summarize_communities(chat, &mut detected, &names).await;
        }

        report.communities = detected.len();
        Community::replace_for_corpus(&self.db, corpus_id, detected).await?;
        Ok(())
    }

    async fn wipe_corpus_data(&self, corpus_id: &str) -> Result<(), AppError> {
        Chunk::delete_by_corpus(&self.db, corpus_id).await?;
        CodeEntity::delete_by_corpus(&self.db, corpus_id).await?;
        EntityRelationship::delete_by_corpus(&self.db, corpus_id).await?;
        Community::delete_by_corpus(&self.db, corpus_id).await?;
        Ok(())
    }

    /// Remove every trace of a corpus: stores and manifest.
    pub async fn delete_corpus(&self, corpus_id: &str) -> Result<(), AppError> {
        let _guard = BuildGuard::claim(&self.active_builds, corpus_id)?;
        self.wipe_corpus_data(corpus_id).await?;
        self.manifests.delete(corpus_id)?;
        Ok(())
    }

    pub async fn stats(&self, corpus_id: &str) -> Result<CorpusStats, AppError> {
        Ok(CorpusStats {
            chunks: Chunk::count_for_corpus(&self.db, corpus_id).await?,
            entities: CodeEntity::count_for_corpus(&self.db, corpus_id).await?,
            relationships: EntityRelationship::count_for_corpus(&self.db, corpus_id).await?,
            communities: Community::list_for_corpus(&self.db, corpus_id).await?.len(),
        })
    }
}

fn module_name_of(rel_path: &str) -> String {
    match rel_path.rsplit_once('.') {
        Some((stem, _ext)) => stem.to_owned(),
        None => rel_path.to_owned(),
    }
}

/// Holds the per-corpus build lock; dropping releases it.
struct BuildGuard {
    registry: Arc<DashMap<String, ()>>,
    corpus_id: String,
}

impl BuildGuard {
    fn claim(registry: &Arc<DashMap<String, ()>>, corpus_id: &str) -> Result<Self, AppError> {
        match registry.entry(corpus_id.to_owned()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Self {
                    registry: Arc::clone(registry),
                    corpus_id: corpus_id.to_owned(),
                })
            }
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(AppError::BuildConflict(corpus_id.to_owned()))
            }
        }
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.corpus_id);
    }
}

struct ProgressTracker<'a> {
    sender: Option<&'a watch::Sender<BuildProgress>>,
    state: BuildProgress,
}

impl<'a> ProgressTracker<'a> {
    fn new(sender: Option<&'a watch::Sender<BuildProgress>>) -> Self {
        Self {
            sender,
            state: BuildProgress::default(),
        }
    }

    fn publish(&self) {
        if let Some(sender) = self.sender {
            let _ = sender.send(self.state.clone());
        }
    }

    fn set_phase(&mut self, phase: BuildPhase) {
        self.state.phase = phase;
        self.publish();
    }

    fn set_files_total(&mut self, total: usize) {
        self.state.files_total = total;
        self.publish();
    }

    fn file_done(&mut self, chunks: usize) {
        self.state.files_processed += 1;
        self.state.chunks_written += chunks;
        self.publish();
    }

    fn entities_done(&mut self, entities: usize) {
        self.state.entities_written += entities;
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::config::EmbeddingBackend;
    use std::fs;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn setup(data_dir: &Path) -> (Arc<SurrealDbClient>, IndexPipeline) {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("index_test_ns", &database)
                .await
                .expect("failed to start in-memory surrealdb"),
        );

        let mut config = AppConfig::default();
        config.data_dir = data_dir.to_string_lossy().into_owned();
        config.embedding.provider = EmbeddingBackend::Hashed;
        config.embedding.dimension = 16;
        config.sparse_search.tokenizer =
            common::utils::config::SparseTokenizer::Whitespace;

        let provider = Arc::new(
            EmbeddingProvider::from_config(&config)
                .await
                .expect("provider"),
        );
        let pipeline = IndexPipeline::new(Arc::clone(&db), provider, None, config);
        (db, pipeline)
    }

    fn write_corpus(root: &Path) {
        fs::create_dir_all(root).expect("mkdir");
        fs::write(
            root.join("a.py"),
            "import os\n\ndef login(user):\n    return os.environ.get(user)\n",
        )
        .expect("write a.py");
        fs::write(
            root.join("b.py"),
            "from a import login\n\ndef logout(user):\n    return login(user) is None\n",
        )
        .expect("write b.py");
    }

    #[tokio::test]
    async fn full_build_populates_all_stores_and_manifest() {
        let dir = TempDir::new().expect("tempdir");
        let corpus_root = dir.path().join("corpus");
        write_corpus(&corpus_root);
        let (db, pipeline) = setup(dir.path()).await;

        let cancel = CancellationToken::new();
        let report = pipeline
            .build("c1", &corpus_root, false, &cancel, None)
            .await
            .expect("build");

        assert_eq!(report.outcome(), BuildOutcome::Complete);
        assert_eq!(report.files_indexed, 2);
        assert!(report.chunks_written >= 2);
        assert!(report.entities_written >= 4, "modules + functions expected");

        let stats = pipeline.stats("c1").await.expect("stats");
        assert_eq!(stats.chunks, report.chunks_written);
        assert!(stats.entities >= 4);

        let manifest = pipeline
            .manifests()
            .load("c1")
            .expect("load")
            .expect("manifest present");
        assert_eq!(manifest.build_status, BuildStatus::Complete);
        assert_eq!(manifest.file_hashes.len(), 2);
        assert!(manifest.last_built_at.is_some());
        drop(db);
    }

    #[tokio::test]
    async fn rebuild_on_unchanged_corpus_skips_all_files() {
        let dir = TempDir::new().expect("tempdir");
        let corpus_root = dir.path().join("corpus");
        write_corpus(&corpus_root);
        let (_db, pipeline) = setup(dir.path()).await;
        let cancel = CancellationToken::new();

        let first = pipeline
            .build("c1", &corpus_root, false, &cancel, None)
            .await
            .expect("first build");
        let manifest_before = pipeline.manifests().load("c1").expect("load").expect("m");

        let second = pipeline
            .build("c1", &corpus_root, false, &cancel, None)
            .await
            .expect("second build");

        assert_eq!(second.files_indexed, 0);
        assert_eq!(second.files_unchanged, 2);
        assert_eq!(
            pipeline.stats("c1").await.expect("stats").chunks,
            first.chunks_written,
            "chunk set must be unchanged"
        );

        let manifest_after = pipeline.manifests().load("c1").expect("load").expect("m");
        assert_eq!(manifest_before.file_hashes, manifest_after.file_hashes);
        assert_ne!(
            manifest_before.last_built_at, manifest_after.last_built_at,
            "last_built_at must be refreshed"
        );
    }

    #[tokio::test]
    async fn changed_file_is_reindexed_and_deleted_file_removed() {
        let dir = TempDir::new().expect("tempdir");
        let corpus_root = dir.path().join("corpus");
        write_corpus(&corpus_root);
        let (_db, pipeline) = setup(dir.path()).await;
        let cancel = CancellationToken::new();

        pipeline
            .build("c1", &corpus_root, false, &cancel, None)
            .await
            .expect("first build");

        fs::write(
            corpus_root.join("a.py"),
            "def login(user):\n    return None\n",
        )
        .expect("rewrite a.py");
        fs::remove_file(corpus_root.join("b.py")).expect("remove b.py");

        let report = pipeline
            .build("c1", &corpus_root, false, &cancel, None)
            .await
            .expect("delta build");

        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.files_deleted, 1);

        let manifest = pipeline.manifests().load("c1").expect("load").expect("m");
        assert_eq!(manifest.file_hashes.len(), 1);
        assert!(manifest.file_hashes.contains_key("a.py"));
    }

    #[tokio::test]
    async fn concurrent_build_on_same_corpus_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let corpus_root = dir.path().join("corpus");
        write_corpus(&corpus_root);
        let (_db, pipeline) = setup(dir.path()).await;

        let _held = BuildGuard::claim(&pipeline.active_builds, "c1").expect("claim");
        assert_eq!(
            pipeline.build_status("c1").expect("status"),
            BuildStatus::Building
        );

        let cancel = CancellationToken::new();
        let err = pipeline
            .build("c1", &corpus_root, false, &cancel, None)
            .await
            .expect_err("second build must be rejected");
        assert!(matches!(err, AppError::BuildConflict(_)));
    }

    #[tokio::test]
    async fn cancelled_build_leaves_manifest_byte_identical() {
        let dir = TempDir::new().expect("tempdir");
        let corpus_root = dir.path().join("corpus");
        write_corpus(&corpus_root);
        let (_db, pipeline) = setup(dir.path()).await;
        let cancel = CancellationToken::new();

        pipeline
            .build("c1", &corpus_root, false, &cancel, None)
            .await
            .expect("initial build");
        let manifest_path = pipeline.manifests().path("c1");
        let bytes_before = fs::read(&manifest_path).expect("read manifest");

        // New content, but the build is cancelled before any checkpoint.
        fs::write(corpus_root.join("a.py"), "def changed():\n    return 1\n")
            .expect("rewrite");
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        let report = pipeline
            .build("c1", &corpus_root, true, &cancelled, None)
            .await
            .expect("cancelled build");
        assert_eq!(report.outcome(), BuildOutcome::Cancelled);

        let bytes_after = fs::read(&manifest_path).expect("read manifest");
        assert_eq!(bytes_before, bytes_after, "manifest must be untouched");
    }

    #[tokio::test]
    async fn dimension_change_without_force_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let corpus_root = dir.path().join("corpus");
        write_corpus(&corpus_root);
        let (db, pipeline) = setup(dir.path()).await;
        let cancel = CancellationToken::new();

        pipeline
            .build("c1", &corpus_root, false, &cancel, None)
            .await
            .expect("initial build");

        // Same database, new pipeline configured at a different dimension.
        let mut config = pipeline.config.clone();
        config.embedding.dimension = 32;
        let provider = Arc::new(
            EmbeddingProvider::from_config(&config)
                .await
                .expect("provider"),
        );
        let reconfigured = IndexPipeline::new(db, provider, None, config);

        let err = reconfigured
            .build("c1", &corpus_root, false, &cancel, None)
            .await
            .expect_err("dimension change must require force");
        assert!(matches!(err, AppError::Validation(_)));

        let forced = reconfigured
            .build("c1", &corpus_root, true, &cancel, None)
            .await
            .expect("forced rebuild");
        assert_eq!(forced.outcome(), BuildOutcome::Complete);
    }

    #[tokio::test]
    async fn delete_corpus_removes_stores_and_manifest() {
        let dir = TempDir::new().expect("tempdir");
        let corpus_root = dir.path().join("corpus");
        write_corpus(&corpus_root);
        let (_db, pipeline) = setup(dir.path()).await;
        let cancel = CancellationToken::new();

        pipeline
            .build("c1", &corpus_root, false, &cancel, None)
            .await
            .expect("build");
        pipeline.delete_corpus("c1").await.expect("delete");

        let stats = pipeline.stats("c1").await.expect("stats");
        assert_eq!(stats, CorpusStats { chunks: 0, entities: 0, relationships: 0, communities: 0 });
        assert!(pipeline.manifests().load("c1").expect("load").is_none());
    }
}
