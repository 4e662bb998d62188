pub mod communities;

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::json;
use tracing::{debug, warn};

use common::{
    storage::types::{
        chunk::Chunk,
        code_entity::{CodeEntity, EntityKind},
        relationship::{EntityRelationship, RelationKind},
    },
    utils::{chat::ChatModel, config::GraphSearchConfig, tokens},
};

use crate::chunker::ast::ParsedSource;

/// Per-file input to graph construction: the shared parse plus the chunks
/// that were written for the file.
#[derive(Debug)]
pub struct FileForGraph {
    pub rel_path: String,
    pub parsed: Option<ParsedSource>,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Default)]
pub struct GraphOutput {
    pub entities: Vec<CodeEntity>,
    pub relationships: Vec<EntityRelationship>,
    /// Chunks whose semantic extraction was rejected; the build proceeds
    /// structural-only for them.
    pub semantic_failures: usize,
}

pub struct GraphBuilder {
    corpus_id: String,
    config: GraphSearchConfig,
    chat: Option<ChatModel>,
}

const SEMANTIC_SYSTEM_PROMPT: &str = "You extract topical concepts from source code. \
Given a code chunk, name the concepts its comments and docstrings discuss. \
Respond only with the requested JSON.";

impl GraphBuilder {
    pub fn new(corpus_id: String, config: GraphSearchConfig, chat: Option<ChatModel>) -> Self {
        Self {
            corpus_id,
            config,
            chat,
        }
    }

    /// Build entities and relationships for the given files. `known` carries
    /// entities already in the store (from unchanged files) so cross-file
    /// calls and imports still resolve during delta builds.
    pub async fn build(&self, files: &[FileForGraph], known: &[CodeEntity]) -> GraphOutput {
        let mut output = GraphOutput::default();

        for file in files {
            self.structural_entities(file, &mut output.entities);
        }

        if self.config.semantic_entities {
            if let Some(chat) = self.chat.clone() {
                self.semantic_entities(&chat, files, &mut output).await;
            }
        }

        let resolver = NameResolver::new(output.entities.iter().chain(known.iter()));
        let mut edges = EdgeAccumulator::new(&self.corpus_id);

        for file in files {
            self.structural_edges(file, &resolver, &mut edges);
            self.reference_edges(file, &resolver, &mut edges);
        }
        self.cooccurrence_edges(files, &resolver, &mut edges);

        let (relationships, dropped) = edges.finish(&resolver);
        if dropped > 0 {
            debug!(dropped, "dropped relationships with unresolved endpoints");
        }
        output.relationships = relationships;
        output
    }

    fn structural_entities(&self, file: &FileForGraph, entities: &mut Vec<CodeEntity>) {
        let Some(parsed) = &file.parsed else {
            return;
        };

        entities.push(CodeEntity::new(
            self.corpus_id.clone(),
            module_stem(&parsed.module_name),
            parsed.module_name.clone(),
            EntityKind::Module,
            Some(file.rel_path.clone()),
            None,
            None,
            Some(format!("module {}", parsed.module_name)),
        ));

        for decl in &parsed.declarations {
            entities.push(CodeEntity::new(
                self.corpus_id.clone(),
                decl.name.clone(),
                decl.qualified_name.clone(),
                decl.kind,
                Some(file.rel_path.clone()),
                Some(decl.start_line),
                Some(decl.end_line),
                Some(format!(
                    "{} {} in {}",
                    decl.kind, decl.qualified_name, file.rel_path
                )),
            ));
        }
    }

    fn structural_edges(
        &self,
        file: &FileForGraph,
        resolver: &NameResolver,
        edges: &mut EdgeAccumulator,
    ) {
        let Some(parsed) = &file.parsed else {
            return;
        };
        let module_id = resolver.by_qualified(&parsed.module_name);

        for decl in &parsed.declarations {
            let decl_id = resolver.by_qualified(&decl.qualified_name);
            let Some(decl_id) = decl_id else { continue };

            // contains: nesting parent when present, else the module.
            let container = decl
                .parent
                .as_deref()
                .and_then(|parent| resolver.by_qualified(parent))
                .or(module_id.clone());
            if let Some(container) = container {
                edges.add(&container, &decl_id, RelationKind::Contains, 1.0);
            }

            for base in &decl.bases {
                if let Some(base_id) = resolver.by_name_with_kind(base, EntityKind::Class) {
                    edges.add(&decl_id, &base_id, RelationKind::Inherits, 1.0);
                }
            }

            for callee in &decl.calls {
                if let Some(callee_id) = resolver.callable_by_name(callee) {
                    edges.add(&decl_id, &callee_id, RelationKind::Calls, 1.0);
                }
            }
        }

        if let Some(module_id) = module_id {
            for import in &parsed.imports {
                if let Some(target) = resolver.module_by_name(import) {
                    edges.add(&module_id, &target, RelationKind::Imports, 1.0);
                }
            }
        }
    }

    /// `references` edges: identifier use inside a chunk resolving to a known
    /// entity elsewhere in the corpus.
    fn reference_edges(
        &self,
        file: &FileForGraph,
        resolver: &NameResolver,
        edges: &mut EdgeAccumulator,
    ) {
        let Some(parsed) = &file.parsed else {
            return;
        };

        for chunk in &file.chunks {
            let owner = owning_entity(parsed, chunk).and_then(|qn| resolver.by_qualified(&qn));
            let Some(owner) = owner else { continue };

            for term in tokens::keywords(&chunk.content) {
                for target in resolver.all_by_name(&term) {
                    if target != owner {
                        edges.add(&owner, &target, RelationKind::References, 1.0);
                    }
                }
            }
        }
    }

    /// `related_to` edges from entity-name co-occurrence within chunks.
    fn cooccurrence_edges(
        &self,
        files: &[FileForGraph],
        resolver: &NameResolver,
        edges: &mut EdgeAccumulator,
    ) {
        let mut pair_counts: BTreeMap<(String, String), usize> = BTreeMap::new();

        for file in files {
            for chunk in &file.chunks {
                let mut present: Vec<String> = Vec::new();
                for term in tokens::keywords(&chunk.content) {
                    for id in resolver.all_by_name(&term) {
                        present.push(id);
                    }
                }
                present.sort();
                present.dedup();

                for i in 0..present.len() {
                    for j in (i + 1)..present.len() {
                        let pair = (present[i].clone(), present[j].clone());
                        *pair_counts.entry(pair).or_default() += 1;
                    }
                }
            }
        }

        for ((a, b), count) in pair_counts {
            if count >= self.config.cooccurrence_threshold {
                edges.add(&a, &b, RelationKind::RelatedTo, count as f32);
            }
        }
    }

    async fn semantic_entities(
        &self,
        chat: &ChatModel,
        files: &[FileForGraph],
        output: &mut GraphOutput,
    ) {
        let schema = json!({
            "type": "object",
            "properties": {
                "concepts": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "description": { "type": "string" }
                        },
                        "required": ["name", "description"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["concepts"],
            "additionalProperties": false
        });

        for file in files {
            for chunk in &file.chunks {
                let user = format!(
                    "File: {}\nChunk ({}..{}):\n{}",
                    file.rel_path, chunk.start_line, chunk.end_line, chunk.content
                );
                let response = chat
                    .generate_json(SEMANTIC_SYSTEM_PROMPT, &user, "concept_extraction", schema.clone())
                    .await;

                let parsed = match response.and_then(parse_concepts) {
                    Ok(concepts) => concepts,
                    Err(err) => {
                        // Malformed output is rejected wholesale; no partial
                        // entities are written.
                        warn!(
                            path = %file.rel_path,
                            error = %err,
                            "semantic extraction rejected; continuing structural-only"
                        );
                        output.semantic_failures += 1;
                        continue;
                    }
                };

                for (name, description) in parsed {
                    output.entities.push(CodeEntity::new(
                        self.corpus_id.clone(),
                        name.clone(),
                        format!("concept:{}", name.to_ascii_lowercase()),
                        EntityKind::Concept,
                        Some(file.rel_path.clone()),
                        None,
                        None,
                        Some(description),
                    ));
                }
            }
        }
    }
}

fn parse_concepts(
    value: serde_json::Value,
) -> Result<Vec<(String, String)>, common::error::AppError> {
    use common::error::AppError;

    let concepts = value
        .get("concepts")
        .and_then(|c| c.as_array())
        .ok_or_else(|| AppError::LLMParsing("missing 'concepts' array".into()))?;

    let mut out = Vec::with_capacity(concepts.len());
    for concept in concepts {
        let name = concept
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| AppError::LLMParsing("concept without name".into()))?;
        let description = concept
            .get("description")
            .and_then(|d| d.as_str())
            .ok_or_else(|| AppError::LLMParsing("concept without description".into()))?;
        if name.trim().is_empty() {
            return Err(AppError::LLMParsing("concept with empty name".into()));
        }
        out.push((name.trim().to_owned(), description.trim().to_owned()));
    }
    Ok(out)
}

/// Innermost declaration whose span contains the chunk start, else the module.
fn owning_entity(parsed: &ParsedSource, chunk: &Chunk) -> Option<String> {
    let mut best: Option<(&str, u32)> = None;
    for decl in &parsed.declarations {
        if decl.start_line <= chunk.start_line && chunk.start_line <= decl.end_line {
            let span = decl.end_line - decl.start_line;
            if best.is_none_or(|(_, best_span)| span < best_span) {
                best = Some((&decl.qualified_name, span));
            }
        }
    }
    match best {
        Some((qualified, _)) => Some(qualified.to_owned()),
        None => Some(parsed.module_name.clone()),
    }
}

fn module_stem(module_name: &str) -> String {
    module_name
        .rsplit('/')
        .next()
        .unwrap_or(module_name)
        .to_owned()
}

/// Deterministic name → entity-id resolution. Ambiguous names resolve to the
/// lexicographically smallest id so rebuilds yield identical graphs.
struct NameResolver {
    by_qualified: HashMap<String, String>,
    by_name: HashMap<String, Vec<(String, EntityKind)>>,
    module_by_stem: HashMap<String, String>,
}

impl NameResolver {
    fn new<'a>(entities: impl Iterator<Item = &'a CodeEntity>) -> Self {
        let mut by_qualified = HashMap::new();
        let mut by_name: HashMap<String, Vec<(String, EntityKind)>> = HashMap::new();
        let mut module_by_stem = HashMap::new();

        for entity in entities {
            by_qualified
                .entry(entity.qualified_name.clone())
                .or_insert_with(|| entity.id.clone());
            by_name
                .entry(entity.name.to_ascii_lowercase())
                .or_default()
                .push((entity.id.clone(), entity.kind));
            if entity.kind == EntityKind::Module {
                module_by_stem
                    .entry(entity.name.to_ascii_lowercase())
                    .or_insert_with(|| entity.id.clone());
            }
        }
        for candidates in by_name.values_mut() {
            candidates.sort();
            candidates.dedup();
        }

        Self {
            by_qualified,
            by_name,
            module_by_stem,
        }
    }

    fn by_qualified(&self, qualified: &str) -> Option<String> {
        self.by_qualified.get(qualified).cloned()
    }

    fn by_name_with_kind(&self, name: &str, kind: EntityKind) -> Option<String> {
        self.by_name
            .get(&name.to_ascii_lowercase())?
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|(id, _)| id.clone())
    }

    fn callable_by_name(&self, name: &str) -> Option<String> {
        self.by_name
            .get(&name.to_ascii_lowercase())?
            .iter()
            .find(|(_, k)| matches!(k, EntityKind::Function | EntityKind::Method))
            .map(|(id, _)| id.clone())
    }

    fn module_by_name(&self, name: &str) -> Option<String> {
        self.module_by_stem.get(&name.to_ascii_lowercase()).cloned()
    }

    fn all_by_name(&self, name: &str) -> Vec<String> {
        self.by_name
            .get(name)
            .map(|candidates| candidates.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    fn known_ids(&self) -> HashSet<&str> {
        self.by_name
            .values()
            .flat_map(|candidates| candidates.iter().map(|(id, _)| id.as_str()))
            .collect()
    }
}

/// Accumulates candidate edges, summing weights for repeats of the same
/// `(source, target, kind)` tuple.
struct EdgeAccumulator {
    corpus_id: String,
    edges: BTreeMap<String, EntityRelationship>,
}

impl EdgeAccumulator {
    fn new(corpus_id: &str) -> Self {
        Self {
            corpus_id: corpus_id.to_owned(),
            edges: BTreeMap::new(),
        }
    }

    fn add(&mut self, source: &str, target: &str, kind: RelationKind, weight: f32) {
        if source == target {
            return;
        }
        let candidate = EntityRelationship::new(
            source.to_owned(),
            target.to_owned(),
            self.corpus_id.clone(),
            kind,
            weight,
        );
        self.edges
            .entry(candidate.id.clone())
            .and_modify(|existing| existing.metadata.weight += weight)
            .or_insert(candidate);
    }

    /// Relationships referencing an absent endpoint are silently dropped,
    /// tolerating best-effort semantic extraction.
    fn finish(self, resolver: &NameResolver) -> (Vec<EntityRelationship>, usize) {
        let known = resolver.known_ids();
        let mut kept = Vec::with_capacity(self.edges.len());
        let mut dropped = 0usize;
        for (_, edge) in self.edges {
            if known.contains(edge.in_.as_str()) && known.contains(edge.out.as_str()) {
                kept.push(edge);
            } else {
                dropped += 1;
            }
        }
        (kept, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ast;
    use common::utils::config::GraphSearchConfig;

    const SRC: &str = r#"import helpers

def login(user):
    return validate(user)

def validate(user):
    return helpers.check(user)

class Session(BaseSession):
    def renew(self):
        return login(self.user)
"#;

    fn file_for(src: &str, rel: &str, module: &str) -> FileForGraph {
        let parsed = ast::parse_source("python", module, src);
        let chunks = vec![Chunk::new(
            "c1".into(),
            rel.into(),
            1,
            src.lines().count() as u32,
            Some("python".into()),
            src.into(),
            tokens::count(src) as u32,
            false,
        )];
        FileForGraph {
            rel_path: rel.into(),
            parsed,
            chunks,
        }
    }

    fn builder() -> GraphBuilder {
        GraphBuilder::new("c1".into(), GraphSearchConfig::default(), None)
    }

    #[tokio::test]
    async fn extracts_structural_entities() {
        let files = vec![file_for(SRC, "auth.py", "auth")];
        let output = builder().build(&files, &[]).await;

        let kinds: Vec<(EntityKind, &str)> = output
            .entities
            .iter()
            .map(|e| (e.kind, e.name.as_str()))
            .collect();
        assert!(kinds.contains(&(EntityKind::Module, "auth")));
        assert!(kinds.contains(&(EntityKind::Function, "login")));
        assert!(kinds.contains(&(EntityKind::Class, "Session")));
        assert!(kinds.contains(&(EntityKind::Method, "renew")));
    }

    #[tokio::test]
    async fn builds_calls_and_contains_edges() {
        let files = vec![file_for(SRC, "auth.py", "auth")];
        let output = builder().build(&files, &[]).await;

        let has = |kind: RelationKind| {
            output
                .relationships
                .iter()
                .any(|r| r.metadata.kind == kind)
        };
        assert!(has(RelationKind::Contains), "module should contain decls");
        assert!(has(RelationKind::Calls), "login -> validate call expected");
    }

    #[tokio::test]
    async fn unresolved_bases_are_dropped_silently() {
        // BaseSession is not declared anywhere in the corpus.
        let files = vec![file_for(SRC, "auth.py", "auth")];
        let output = builder().build(&files, &[]).await;

        assert!(
            !output
                .relationships
                .iter()
                .any(|r| r.metadata.kind == RelationKind::Inherits),
            "inherits edge to unknown base must be dropped"
        );
    }

    #[tokio::test]
    async fn repeated_calls_accumulate_weight() {
        let src = "def a():\n    b()\n    b()\n\ndef b():\n    return 1\n";
        let files = vec![file_for(src, "m.py", "m")];
        let output = builder().build(&files, &[]).await;

        let call = output
            .relationships
            .iter()
            .find(|r| r.metadata.kind == RelationKind::Calls)
            .expect("call edge");
        // One declaration-level edge regardless of repeat count, with the
        // dedup happening in the parser's call list.
        assert!(call.metadata.weight >= 1.0);
    }

    #[tokio::test]
    async fn cross_file_calls_resolve_against_known_entities() {
        let callee = CodeEntity::new(
            "c1".into(),
            "check".into(),
            "helpers::check".into(),
            EntityKind::Function,
            Some("helpers.py".into()),
            Some(1),
            Some(2),
            None,
        );
        let files = vec![file_for(SRC, "auth.py", "auth")];
        let output = builder().build(&files, &[callee.clone()]).await;

        assert!(
            output
                .relationships
                .iter()
                .any(|r| r.out == callee.id && r.metadata.kind == RelationKind::Calls),
            "call into known entity from another file should resolve"
        );
    }
}
