pub mod reranking;
pub mod scoring;

use std::{collections::HashMap, sync::Arc, time::Instant};

use tracing::{error, info, warn};

use common::{
    error::AppError,
    storage::{
        membership::{membership_from_docs, MembershipIndex},
        store_set::StoreSet,
        types::{QuerySolution, Triple},
    },
    utils::{embedding::EmbeddingProvider, hash::entity_id},
};

use crate::{
    reranking::{FactReranker, RerankOutcome},
    scoring::{argsort_desc, dot_scores, min_max_normalize},
};

/// Instruction prefixes for the two query encodings.
pub const QUERY_TO_FACT_INSTRUCTION: &str =
    "Given a question, retrieve relevant triplet facts that matter to the question.";
pub const QUERY_TO_PASSAGE_INSTRUCTION: &str =
    "Given a question, retrieve relevant documents that best answer the question.";

/// Tunable parameters of the hybrid search.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalTuning {
    /// Facts fed to the reranker, and distinct phrases carried into PPR.
    pub linking_top_k: usize,
    /// Scale of the dense-retrieval seed mass on passage nodes.
    pub passage_node_weight: f64,
    pub damping: f64,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            linking_top_k: 5,
            passage_node_weight: 0.05,
            damping: 0.5,
        }
    }
}

/// The two instruction-prefixed encodings of one query.
#[derive(Debug, Clone)]
struct QueryEmbeddings {
    to_fact: Vec<f64>,
    to_passage: Vec<f64>,
}

/// Snapshot of everything retrieval needs, rebuilt lazily after a mutation.
struct RetrievalState {
    passage_node_keys: Vec<String>,
    fact_node_keys: Vec<String>,
    passage_embeddings: Vec<Vec<f64>>,
    fact_embeddings: Vec<Vec<f64>>,
    name_to_vertex: HashMap<String, usize>,
    membership: MembershipIndex,
    vcount: usize,
}

/// Graph-aware hybrid retriever: dense passage retrieval fused with
/// personalized PageRank seeded from query-linked facts.
pub struct RetrievalPipeline {
    embedder: Arc<EmbeddingProvider>,
    reranker: FactReranker,
    tuning: RetrievalTuning,
    state: Option<RetrievalState>,
    query_cache: HashMap<String, QueryEmbeddings>,
}

impl RetrievalPipeline {
    pub fn new(
        embedder: Arc<EmbeddingProvider>,
        reranker: FactReranker,
        tuning: RetrievalTuning,
    ) -> Self {
        Self {
            embedder,
            reranker,
            tuning,
            state: None,
            query_cache: HashMap::new(),
        }
    }

    /// Invalidates the retrieval caches; the next retrieve rebuilds them.
    pub fn mark_dirty(&mut self) {
        self.state = None;
    }

    /// Pure dense passage retrieval.
    pub async fn retrieve_dpr(
        &mut self,
        stores: &StoreSet,
        queries: &[String],
        k: usize,
    ) -> Result<Vec<QuerySolution>, AppError> {
        self.ensure_state(stores)?;
        let mut solutions = Vec::with_capacity(queries.len());
        for query in queries {
            let embeddings = self.query_embeddings(query).await?;
            let state = self.current_state()?;
            solutions.push(dense_solution(stores, state, query, &embeddings, k));
        }
        Ok(solutions)
    }

    /// Hybrid retrieval: fact scoring, reranking, PPR over the graph, with
    /// dense retrieval as the documented fallback at every failure point.
    pub async fn retrieve(
        &mut self,
        stores: &StoreSet,
        queries: &[String],
        k: usize,
    ) -> Result<Vec<QuerySolution>, AppError> {
        self.ensure_state(stores)?;
        let started = Instant::now();
        let mut rerank_ms: u128 = 0;
        let mut ppr_ms: u128 = 0;

        let mut solutions = Vec::with_capacity(queries.len());
        for query in queries {
            let embeddings = self.query_embeddings(query).await?;
            let state = self.current_state()?;

            let fact_scores =
                min_max_normalize(&dot_scores(&state.fact_embeddings, &embeddings.to_fact));
            if fact_scores.is_empty() {
                error!(%query, "no scorable facts, using dense retrieval");
                solutions.push(dense_solution(stores, state, query, &embeddings, k));
                continue;
            }

            let link_k = self.tuning.linking_top_k;
            let mut candidate_indices: Vec<usize> = Vec::new();
            let mut candidates: Vec<Triple> = Vec::new();
            for idx in argsort_desc(&fact_scores).into_iter().take(link_k) {
                let Some(key) = state.fact_node_keys.get(idx) else {
                    continue;
                };
                match stores.facts.content(key).and_then(Triple::from_stringified) {
                    Some(triple) => {
                        candidate_indices.push(idx);
                        candidates.push(triple);
                    }
                    None => warn!(%key, "fact row is not a parseable triple"),
                }
            }

            let rerank_started = Instant::now();
            let outcome = self
                .reranker
                .rerank(query, &candidates, &candidate_indices, link_k)
                .await;
            rerank_ms += rerank_started.elapsed().as_millis();

            if outcome.facts.is_empty() {
                warn!(%query, "reranker kept no facts, using dense retrieval");
                solutions.push(dense_solution(stores, state, query, &embeddings, k));
                continue;
            }

            let ppr_started = Instant::now();
            let searched = self.graph_search_with_fact_entities(
                stores,
                state,
                &embeddings.to_passage,
                &fact_scores,
                &outcome,
            )?;
            ppr_ms += ppr_started.elapsed().as_millis();

            match searched {
                Some((passage_order, passage_scores)) => solutions.push(
                    passage_solution(stores, state, query, &passage_order, &passage_scores, k),
                ),
                None => {
                    warn!(%query, "empty personalization mass, using dense retrieval");
                    solutions.push(dense_solution(stores, state, query, &embeddings, k));
                }
            }
        }

        info!(
            queries = queries.len(),
            rerank_ms = rerank_ms as u64,
            ppr_ms = ppr_ms as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "retrieval finished"
        );
        Ok(solutions)
    }

    /// Seeds a PPR reset distribution from the reranked facts' entities plus
    /// dense passage scores, runs PPR and ranks passages by their score.
    /// Returns `None` when no mass survives, which callers treat as the
    /// dense-retrieval fallback.
    fn graph_search_with_fact_entities(
        &self,
        stores: &StoreSet,
        state: &RetrievalState,
        query_to_passage: &[f64],
        fact_scores: &[f64],
        outcome: &RerankOutcome,
    ) -> Result<Option<(Vec<usize>, Vec<f64>)>, AppError> {
        let n = state.vcount;
        if n == 0 {
            return Ok(None);
        }

        let mut phrase_weights = vec![0.0f64; n];
        let mut passage_weights = vec![0.0f64; n];
        let mut occurrences = vec![0.0f64; n];

        for (rank, fact) in outcome.facts.iter().enumerate() {
            let score = outcome
                .indices
                .get(rank)
                .and_then(|idx| fact_scores.get(*idx))
                .copied()
                .unwrap_or(0.0);
            for phrase in [fact.subject(), fact.object()] {
                let phrase_key = entity_id(&phrase.to_lowercase());
                let Some(vertex) = state.name_to_vertex.get(&phrase_key).copied() else {
                    warn!(phrase, "fact phrase has no graph vertex");
                    continue;
                };
                let doc_count = state.membership.chunk_count(&phrase_key);
                // Spread across the documents that mention the phrase, so
                // ubiquitous entities do not dominate the seed mass.
                let contribution = score / doc_count.max(1) as f64;
                phrase_weights[vertex] += contribution;
                occurrences[vertex] += 1.0;
            }
        }

        let mut seeded: Vec<usize> = Vec::new();
        for i in 0..n {
            if occurrences[i] > 0.0 {
                phrase_weights[i] /= occurrences[i];
                seeded.push(i);
            }
        }

        // Keep only the strongest linking_top_k phrases as seeds.
        if self.tuning.linking_top_k > 0 && seeded.len() > self.tuning.linking_top_k {
            seeded.sort_by(|a, b| {
                phrase_weights[*b]
                    .partial_cmp(&phrase_weights[*a])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.cmp(b))
            });
            for vertex in seeded.iter().skip(self.tuning.linking_top_k) {
                phrase_weights[*vertex] = 0.0;
            }
        }

        let (dpr_order, dpr_scores) = dense_passage_scores(state, query_to_passage);
        let dpr_scores = min_max_normalize(&dpr_scores);
        for (rank, passage_pos) in dpr_order.iter().enumerate() {
            let Some(key) = state.passage_node_keys.get(*passage_pos) else {
                continue;
            };
            let Some(vertex) = state.name_to_vertex.get(key).copied() else {
                warn!(%key, "passage row has no graph vertex");
                continue;
            };
            if let Some(score) = dpr_scores.get(rank) {
                passage_weights[vertex] = score * self.tuning.passage_node_weight;
            }
        }

        let reset: Vec<f64> = phrase_weights
            .iter()
            .zip(&passage_weights)
            .map(|(phrase, passage)| phrase + passage)
            .collect();
        if reset.iter().sum::<f64>() <= 0.0 {
            return Ok(None);
        }

        let ppr_scores = stores
            .graph
            .personalized_page_rank(&reset, self.tuning.damping)?;

        let mut ranked: Vec<(usize, f64)> = state
            .passage_node_keys
            .iter()
            .enumerate()
            .filter_map(|(pos, key)| {
                state
                    .name_to_vertex
                    .get(key)
                    .and_then(|vertex| ppr_scores.get(*vertex))
                    .map(|score| (pos, *score))
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let (order, scores): (Vec<usize>, Vec<f64>) = ranked.into_iter().unzip();
        Ok(Some((order, scores)))
    }

    async fn query_embeddings(&mut self, query: &str) -> Result<QueryEmbeddings, AppError> {
        if let Some(cached) = self.query_cache.get(query) {
            return Ok(cached.clone());
        }
        let texts = vec![query.to_string()];
        let to_fact = self
            .embedder
            .batch_encode(&texts, Some(QUERY_TO_FACT_INSTRUCTION), true)
            .await?
            .pop()
            .ok_or_else(|| AppError::Invariant("empty embedding batch for query".into()))?;
        let to_passage = self
            .embedder
            .batch_encode(&texts, Some(QUERY_TO_PASSAGE_INSTRUCTION), true)
            .await?
            .pop()
            .ok_or_else(|| AppError::Invariant("empty embedding batch for query".into()))?;

        let embeddings = QueryEmbeddings {
            to_fact,
            to_passage,
        };
        self.query_cache
            .insert(query.to_string(), embeddings.clone());
        Ok(embeddings)
    }

    fn current_state(&self) -> Result<&RetrievalState, AppError> {
        self.state
            .as_ref()
            .ok_or_else(|| AppError::Invariant("retrieval state missing after ensure".into()))
    }

    /// Rebuilds the snapshot when dirty or when the graph disagrees with the
    /// stores about how many nodes should exist.
    fn ensure_state(&mut self, stores: &StoreSet) -> Result<(), AppError> {
        let expected = stores.chunks.len() + stores.entities.len();
        let rebuild = match &self.state {
            None => true,
            Some(state) => {
                state.vcount != stores.graph.vcount() || stores.graph.vcount() != expected
            }
        };
        if !rebuild {
            return Ok(());
        }

        if stores.graph.vcount() != expected {
            warn!(
                graph_nodes = stores.graph.vcount(),
                expected, "graph node count does not match the stores"
            );
        }

        let (passage_node_keys, passage_embeddings) = stores.chunks.matrix();
        let (fact_node_keys, fact_embeddings) = stores.facts.matrix();
        let name_to_vertex: HashMap<String, usize> = stores
            .graph
            .vertex_names()
            .into_iter()
            .enumerate()
            .map(|(idx, name)| (name, idx))
            .collect();
        let membership = membership_from_docs(&stores.openie.load(false)?.docs);

        self.state = Some(RetrievalState {
            passage_node_keys,
            fact_node_keys,
            passage_embeddings,
            fact_embeddings,
            name_to_vertex,
            membership,
            vcount: stores.graph.vcount(),
        });
        info!("retrieval caches rebuilt");
        Ok(())
    }
}

/// Dense scores over the passage matrix: min–max-normalized, sorted
/// descending, returned as (passage positions, scores).
fn dense_passage_scores(state: &RetrievalState, query: &[f64]) -> (Vec<usize>, Vec<f64>) {
    let normalized = min_max_normalize(&dot_scores(&state.passage_embeddings, query));
    let order = argsort_desc(&normalized);
    let scores = order
        .iter()
        .filter_map(|pos| normalized.get(*pos).copied())
        .collect();
    (order, scores)
}

/// Dense-only ranking packaged as a solution; the shared fallback path.
fn dense_solution(
    stores: &StoreSet,
    state: &RetrievalState,
    query: &str,
    embeddings: &QueryEmbeddings,
    k: usize,
) -> QuerySolution {
    let (order, scores) = dense_passage_scores(state, &embeddings.to_passage);
    passage_solution(stores, state, query, &order, &scores, k)
}

/// Converts passage-space indices into passage texts, keeping the first `k`
/// that resolve; out-of-range indices are logged and skipped.
fn passage_solution(
    stores: &StoreSet,
    state: &RetrievalState,
    query: &str,
    passage_order: &[usize],
    passage_scores: &[f64],
    k: usize,
) -> QuerySolution {
    let mut docs = Vec::with_capacity(k);
    let mut doc_scores = Vec::with_capacity(k);
    for (rank, pos) in passage_order.iter().enumerate() {
        if docs.len() >= k {
            break;
        }
        let Some(key) = state.passage_node_keys.get(*pos) else {
            error!(pos = *pos, "passage index out of range");
            continue;
        };
        let Some(content) = stores.chunks.content(key) else {
            error!(%key, "passage key missing from chunk store");
            continue;
        };
        docs.push(content.to_string());
        doc_scores.push(passage_scores.get(rank).copied().unwrap_or(0.0));
    }
    QuerySolution::new(query.to_string(), docs, doc_scores)
}
