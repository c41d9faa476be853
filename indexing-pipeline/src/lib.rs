pub mod edges;
pub mod openie;
pub mod synonymy;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{
        graph::VertexAttrs,
        membership::{membership_from_docs, MembershipIndex},
        store_set::StoreSet,
        types::{OpenIeDoc, Triple},
    },
    utils::{
        config::OpenIeMode,
        embedding::EmbeddingProvider,
        hash::chunk_id,
        text::filter_invalid_triples,
    },
};

use crate::{
    edges::{add_fact_edges, add_passage_edges, EdgeAccumulator},
    openie::OpenIeExtractor,
    synonymy::{add_synonymy_edges, SynonymyParams},
};

#[derive(Debug, Clone, Copy)]
pub struct IndexingOptions {
    pub openie_mode: OpenIeMode,
    pub synonymy: SynonymyParams,
    pub force_openie_from_scratch: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IndexStats {
    pub chunks_seen: usize,
    pub chunks_new_to_graph: usize,
    pub chunks_extracted: usize,
    pub entities: usize,
    pub facts: usize,
    pub edges_added: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeleteStats {
    pub chunks_removed: usize,
    pub entities_removed: usize,
    pub facts_removed: usize,
}

/// Builds and maintains the heterogeneous passage/phrase graph: chunk insert,
/// extraction (with cache), co-occurrence and membership edges, synonym
/// linking and persistence. Safe to re-run over already-indexed chunks.
pub struct IndexingPipeline {
    extractor: Arc<dyn OpenIeExtractor>,
    embedder: Arc<EmbeddingProvider>,
    options: IndexingOptions,
}

impl IndexingPipeline {
    pub fn new(
        extractor: Arc<dyn OpenIeExtractor>,
        embedder: Arc<EmbeddingProvider>,
        options: IndexingOptions,
    ) -> Self {
        Self {
            extractor,
            embedder,
            options,
        }
    }

    /// Runs extraction only, populating the on-disk cache so an offline-mode
    /// `index` can run later without an LLM.
    pub async fn pre_openie(
        &self,
        stores: &mut StoreSet,
        docs: &[String],
    ) -> Result<usize, AppError> {
        let ids: Vec<String> = docs.iter().map(|text| chunk_id(text)).collect();
        let mut cached = stores
            .openie
            .load(self.options.force_openie_from_scratch)?;
        let (_, missing) = cached.partition(&ids);

        let mut rows: HashMap<String, String> = HashMap::new();
        for id in missing {
            if let Some(pos) = ids.iter().position(|candidate| candidate == id) {
                if let Some(text) = docs.get(pos) {
                    rows.insert(id.clone(), text.clone());
                }
            }
        }
        let extracted = rows.len();
        if extracted == 0 {
            info!("extraction cache already covers all passages");
            return Ok(0);
        }

        let (ner_results, triple_results) = self.extractor.batch_openie(&rows).await?;
        merge_into_cache(&mut cached.docs, &rows, &ner_results, &triple_results);
        stores.openie.save(&mut cached)?;

        info!(extracted, "extraction pre-pass complete");
        Ok(extracted)
    }

    pub async fn index(
        &self,
        stores: &mut StoreSet,
        docs: &[String],
    ) -> Result<IndexStats, AppError> {
        if self.options.openie_mode == OpenIeMode::Offline {
            let cached = stores.openie.load(false)?;
            let ids: Vec<String> = docs.iter().map(|text| chunk_id(text)).collect();
            let (_, missing) = cached.partition(&ids);
            if !missing.is_empty() {
                return Err(AppError::Validation(format!(
                    "openie_mode is offline and {} passages lack cached extractions; run pre_openie first",
                    missing.len()
                )));
            }
        }

        let started = Instant::now();
        let mut stats = IndexStats::default();

        // Chunk rows first; re-inserting known content is a no-op.
        let stage = Instant::now();
        let all_ids = stores.chunks.insert(docs, &self.embedder).await?;
        let chunk_ids = dedupe_preserving_order(all_ids);
        stats.chunks_seen = chunk_ids.len();
        let insert_ms = stage.elapsed().as_millis();

        // Extraction, reusing the cache for anything already seen.
        let stage = Instant::now();
        let mut cached = stores
            .openie
            .load(self.options.force_openie_from_scratch)?;
        let (_, to_extract) = cached.partition(&chunk_ids);
        let mut rows: HashMap<String, String> = HashMap::new();
        for id in to_extract {
            match stores.chunks.content(id) {
                Some(content) => {
                    rows.insert(id.clone(), content.to_string());
                }
                None => warn!(%id, "chunk disappeared between insert and extraction"),
            }
        }
        stats.chunks_extracted = rows.len();
        if !rows.is_empty() {
            let (ner_results, triple_results) = self.extractor.batch_openie(&rows).await?;
            merge_into_cache(&mut cached.docs, &rows, &ner_results, &triple_results);
        }
        stores.openie.save(&mut cached)?;
        let openie_ms = stage.elapsed().as_millis();

        // Reformat the cache into per-chunk entity and triple views.
        let doc_map = cached.doc_map();
        let mut chunk_triples: HashMap<String, Vec<Triple>> = HashMap::new();
        let mut chunk_entities: HashMap<String, Vec<String>> = HashMap::new();
        for id in &chunk_ids {
            let doc = doc_map.get(id).ok_or_else(|| {
                AppError::Invariant(format!("no extraction record for chunk {id}"))
            })?;
            let triples: Vec<Triple> = filter_invalid_triples(&doc.extracted_triples)
                .iter()
                .map(Triple::processed)
                .collect();
            chunk_entities.insert(id.clone(), doc.extracted_entities.clone());
            chunk_triples.insert(id.clone(), triples);
        }
        if chunk_triples.len() != chunk_ids.len() || chunk_entities.len() != chunk_ids.len() {
            return Err(AppError::Invariant(format!(
                "reformat mismatch: {} chunks, {} entity rows, {} triple rows",
                chunk_ids.len(),
                chunk_entities.len(),
                chunk_triples.len()
            )));
        }

        // Distinct phrases and facts, first-seen order.
        let mut entity_texts: Vec<String> = Vec::new();
        let mut seen_entities: HashSet<String> = HashSet::new();
        let mut fact_texts: Vec<String> = Vec::new();
        let mut seen_facts: HashSet<String> = HashSet::new();
        for id in &chunk_ids {
            for triple in chunk_triples.get(id).into_iter().flatten() {
                for phrase in [triple.subject(), triple.object()] {
                    if seen_entities.insert(phrase.to_string()) {
                        entity_texts.push(phrase.to_string());
                    }
                }
                let stringified = triple.stringified();
                if seen_facts.insert(stringified.clone()) {
                    fact_texts.push(stringified);
                }
            }
        }

        let stage = Instant::now();
        stores.entities.insert(&entity_texts, &self.embedder).await?;
        stores.facts.insert(&fact_texts, &self.embedder).await?;
        stats.entities = stores.entities.len();
        stats.facts = stores.facts.len();
        let embed_ms = stage.elapsed().as_millis();

        // Graph construction. Chunks already present keep their edge mass;
        // only chunks new to the graph contribute counts. Co-occurrence
        // counts merge into existing records; membership and synonymy
        // records are added at most once.
        let stage = Instant::now();
        let existing = stores.graph.vertex_name_set();
        let mut count_acc = EdgeAccumulator::default();
        let mut set_acc = EdgeAccumulator::default();
        let mut membership = MembershipIndex::default();
        for id in &chunk_ids {
            if existing.contains(id) {
                continue;
            }
            stats.chunks_new_to_graph += 1;
            let triples = chunk_triples.get(id).cloned().unwrap_or_default();
            add_fact_edges(id, &triples, &mut count_acc, &mut membership);
            add_passage_edges(id, &triples, &mut set_acc);
        }

        let (entity_ids, entity_embeddings) = stores.entities.matrix();
        let entity_contents = stores.entities.all_texts();
        add_synonymy_edges(
            &entity_ids,
            &entity_contents,
            &entity_embeddings,
            self.options.synonymy,
            &mut set_acc,
        );

        let mut new_vertices: Vec<VertexAttrs> = Vec::new();
        for (id, content) in stores
            .chunks
            .all_ids()
            .into_iter()
            .zip(stores.chunks.all_texts())
            .chain(entity_ids.into_iter().zip(entity_contents))
        {
            if !existing.contains(&id) {
                new_vertices.push(VertexAttrs::new(id, content));
            }
        }
        stores.graph.add_vertices(new_vertices)?;

        let (count_pairs, count_weights) = count_acc.into_pairs();
        stores
            .graph
            .increment_edge_weights(&count_pairs, &count_weights)?;

        let (pairs, weights) = set_acc.into_pairs();
        let (pairs, weights) = drop_existing_edges(&stores.graph, pairs, weights);
        stats.edges_added = count_pairs.len() + pairs.len();
        stores.graph.add_edges(&pairs, &weights)?;
        stores.save_graph()?;
        let graph_ms = stage.elapsed().as_millis();

        info!(
            chunks = stats.chunks_seen,
            new_chunks = stats.chunks_new_to_graph,
            extracted = stats.chunks_extracted,
            entities = stats.entities,
            facts = stats.facts,
            edges_added = stats.edges_added,
            insert_ms = insert_ms as u64,
            openie_ms = openie_ms as u64,
            embed_ms = embed_ms as u64,
            graph_ms = graph_ms as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "indexing finished"
        );

        Ok(stats)
    }

    /// Removes the given passages. An entity or fact survives as long as any
    /// non-deleted chunk still references it.
    pub async fn delete(
        &self,
        stores: &mut StoreSet,
        docs: &[String],
    ) -> Result<DeleteStats, AppError> {
        let mut delete_ids: Vec<String> = Vec::new();
        for text in docs {
            let id = stores.chunks.hash(text);
            if stores.chunks.contains(&id) {
                delete_ids.push(id);
            } else {
                warn!(%id, "delete for passage that is not indexed");
            }
        }
        if delete_ids.is_empty() {
            return Ok(DeleteStats::default());
        }
        let delete_set: HashSet<&String> = delete_ids.iter().collect();

        let mut cached = stores.openie.load(false)?;
        // Removability is judged against every reference, surviving chunks
        // included, so membership is computed before the cache shrinks.
        let membership = membership_from_docs(&cached.docs);
        cached
            .docs
            .retain(|doc| !delete_set.contains(&doc.idx));
        stores.openie.save(&mut cached)?;

        let removable_entities: Vec<String> = membership
            .entity_to_chunks
            .iter()
            .filter(|(_, chunks)| chunks.iter().all(|chunk| delete_set.contains(chunk)))
            .map(|(entity, _)| entity.clone())
            .collect();
        let removable_facts: Vec<String> = membership
            .fact_to_chunks
            .iter()
            .filter(|(_, chunks)| chunks.iter().all(|chunk| delete_set.contains(chunk)))
            .map(|(fact, _)| fact.clone())
            .collect();

        stores.chunks.delete(&delete_ids)?;
        stores.entities.delete(&removable_entities)?;
        stores.facts.delete(&removable_facts)?;

        let mut vertex_names = delete_ids.clone();
        vertex_names.extend(removable_entities.iter().cloned());
        stores.graph.delete_vertices(&vertex_names);
        stores.save_graph()?;

        let stats = DeleteStats {
            chunks_removed: delete_ids.len(),
            entities_removed: removable_entities.len(),
            facts_removed: removable_facts.len(),
        };
        info!(
            chunks = stats.chunks_removed,
            entities = stats.entities_removed,
            facts = stats.facts_removed,
            "delete finished"
        );
        Ok(stats)
    }
}

/// First occurrence wins; later duplicates are dropped.
fn dedupe_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Appends fresh extractions to the cache docs, raw output preserved, in
/// stable chunk-id order.
fn merge_into_cache(
    docs: &mut Vec<OpenIeDoc>,
    rows: &HashMap<String, String>,
    ner_results: &HashMap<String, common::storage::types::NerOut>,
    triple_results: &HashMap<String, common::storage::types::TripleOut>,
) {
    let mut ordered: Vec<&String> = rows.keys().collect();
    ordered.sort();
    for id in ordered {
        let Some(passage) = rows.get(id) else { continue };
        let entities = ner_results
            .get(id)
            .map(|out| out.unique_entities.clone())
            .unwrap_or_default();
        let triples = triple_results
            .get(id)
            .map(|out| out.triples.clone())
            .unwrap_or_default();
        docs.push(OpenIeDoc {
            idx: id.clone(),
            passage: passage.clone(),
            extracted_entities: entities,
            extracted_triples: triples,
        });
    }
}

/// Filters out pairs that already exist as edge records so re-indexing does
/// not duplicate membership or synonymy edges.
fn drop_existing_edges(
    graph: &common::storage::graph::SimpleGraph,
    pairs: Vec<(String, String)>,
    weights: Vec<f64>,
) -> (Vec<(String, String)>, Vec<f64>) {
    let existing: HashSet<(usize, usize)> = graph
        .edges()
        .iter()
        .map(|edge| (edge.source, edge.target))
        .collect();

    let mut kept_pairs = Vec::with_capacity(pairs.len());
    let mut kept_weights = Vec::with_capacity(weights.len());
    for ((from, to), weight) in pairs.into_iter().zip(weights) {
        let duplicate = match (graph.vertex_index(&from), graph.vertex_index(&to)) {
            (Some(source), Some(target)) => existing.contains(&(source, target)),
            _ => false,
        };
        if duplicate {
            continue;
        }
        kept_pairs.push((from, to));
        kept_weights.push(weight);
    }
    (kept_pairs, kept_weights)
}
