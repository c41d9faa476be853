pub mod metrics;
pub mod qa;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_openai::config::OpenAIConfig;
use serde::Serialize;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{store_set::StoreSet, types::QuerySolution},
    utils::{
        config::{AppConfig, EmbeddingBackend},
        embedding::EmbeddingProvider,
        llm::{sanitize_label, LanguageModel, OpenAiChat, RetryPolicy},
        template_engine::TemplateEngine,
    },
};
use indexing_pipeline::{
    openie::{LlmOpenIeExtractor, OpenIeExtractor},
    synonymy::SynonymyParams,
    DeleteStats, IndexStats, IndexingOptions, IndexingPipeline,
};
use retrieval_pipeline::{
    reranking::{FactReranker, RerankProgram},
    RetrievalPipeline, RetrievalTuning,
};

use crate::{metrics::best_over_golds, qa::QaPipeline};

/// Aggregate QA quality over one batch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QaMetrics {
    pub exact_match: f64,
    pub f1: f64,
}

#[derive(Debug)]
pub struct RagQaOutput {
    pub solutions: Vec<QuerySolution>,
    pub metrics: Option<QaMetrics>,
}

/// One indexing/retrieval/QA session over a single working directory. All
/// state is owned here and mutated sequentially; concurrent use of one
/// session is not supported.
pub struct RagSession {
    config: AppConfig,
    stores: StoreSet,
    indexer: IndexingPipeline,
    retriever: RetrievalPipeline,
    qa: QaPipeline,
}

impl RagSession {
    /// `{save_dir}/{llm_label}_{emb_label}`, both labels file-name safe.
    pub fn working_dir(config: &AppConfig) -> PathBuf {
        let llm_label = sanitize_label(&config.llm_name);
        let emb_label = match config.embedding_backend {
            EmbeddingBackend::Hashed => "hashed".to_string(),
            _ => sanitize_label(&config.embedding_name),
        };
        Path::new(&config.save_dir).join(format!("{llm_label}_{emb_label}"))
    }

    /// Builds a session with production clients derived from the config.
    pub async fn open(config: AppConfig) -> Result<Self, AppError> {
        if config.openai_api_key.is_empty() {
            return Err(AppError::Config(
                "openai_api_key is required to open a session".into(),
            ));
        }

        let client = Arc::new(async_openai::Client::with_config(
            OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.llm_base_url),
        ));

        let retry = RetryPolicy {
            max_attempts: config.max_retry_attempts,
            ..RetryPolicy::default()
        };
        let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiChat::new(
            Arc::clone(&client),
            config.llm_name.clone(),
            config.temperature,
            config.max_tokens,
            retry,
        ));

        let embedder = Arc::new(match config.embedding_backend {
            EmbeddingBackend::OpenAi => EmbeddingProvider::new_openai(
                client,
                config.embedding_name.clone(),
                config.embedding_dimensions,
            ),
            EmbeddingBackend::FastEmbed => {
                EmbeddingProvider::new_fastembed(Some(&config.embedding_name)).await?
            }
            EmbeddingBackend::Hashed => {
                EmbeddingProvider::new_hashed(config.embedding_dimensions as usize)
            }
        });

        let templates = Arc::new(TemplateEngine::new()?);
        let extractor: Arc<dyn OpenIeExtractor> = Arc::new(LlmOpenIeExtractor::new(
            Arc::clone(&llm),
            Arc::clone(&templates),
        ));

        Self::with_components(config, llm, embedder, extractor, templates)
    }

    /// Assembles a session from explicit collaborators; tests and offline
    /// drivers substitute mocks here.
    pub fn with_components(
        config: AppConfig,
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<EmbeddingProvider>,
        extractor: Arc<dyn OpenIeExtractor>,
        templates: Arc<TemplateEngine>,
    ) -> Result<Self, AppError> {
        let dir = Self::working_dir(&config);
        if config.force_index_from_scratch && dir.exists() {
            warn!(dir = %dir.display(), "force_index_from_scratch set, clearing working directory");
            std::fs::remove_dir_all(&dir)?;
        }

        let llm_label = llm.label();
        let stores = StoreSet::open(&dir, &llm_label, config.is_directed_graph)?;

        let indexer = IndexingPipeline::new(
            extractor,
            Arc::clone(&embedder),
            IndexingOptions {
                openie_mode: config.openie_mode,
                synonymy: SynonymyParams {
                    top_k: config.synonymy_edge_top_k,
                    threshold: config.synonymy_edge_sim_threshold,
                },
                force_openie_from_scratch: config.force_openie_from_scratch,
            },
        );

        let program = match config.rerank_demo_path.as_deref() {
            Some(path) => RerankProgram::load(Path::new(path))?,
            None => RerankProgram::compiled_default(),
        };
        let retriever = RetrievalPipeline::new(
            embedder,
            FactReranker::new(Arc::clone(&llm), program),
            RetrievalTuning {
                linking_top_k: config.linking_top_k,
                passage_node_weight: config.passage_node_weight,
                damping: config.damping,
            },
        );

        let qa = QaPipeline::new(llm, templates, config.dataset.clone(), config.qa_top_k);

        info!(dir = %dir.display(), "session opened");
        Ok(Self {
            config,
            stores,
            indexer,
            retriever,
            qa,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    pub async fn index(&mut self, docs: &[String]) -> Result<IndexStats, AppError> {
        let stats = self.indexer.index(&mut self.stores, docs).await?;
        self.retriever.mark_dirty();
        Ok(stats)
    }

    pub async fn delete(&mut self, docs: &[String]) -> Result<DeleteStats, AppError> {
        let stats = self.indexer.delete(&mut self.stores, docs).await?;
        self.retriever.mark_dirty();
        Ok(stats)
    }

    pub async fn pre_openie(&mut self, docs: &[String]) -> Result<usize, AppError> {
        self.indexer.pre_openie(&mut self.stores, docs).await
    }

    pub async fn retrieve(
        &mut self,
        queries: &[String],
        k: usize,
    ) -> Result<Vec<QuerySolution>, AppError> {
        self.retriever.retrieve(&self.stores, queries, k).await
    }

    pub async fn retrieve_dpr(
        &mut self,
        queries: &[String],
        k: usize,
    ) -> Result<Vec<QuerySolution>, AppError> {
        self.retriever.retrieve_dpr(&self.stores, queries, k).await
    }

    /// Retrieve, answer, and (when gold answers are supplied) score the
    /// whole batch. Per-query QA failures yield empty answers, never abort.
    pub async fn rag_qa(
        &mut self,
        queries: &[String],
        gold_docs: Option<&[Vec<String>]>,
        gold_answers: Option<&[Vec<String>]>,
    ) -> Result<RagQaOutput, AppError> {
        let mut solutions = self
            .retriever
            .retrieve(&self.stores, queries, self.config.retrieval_top_k)
            .await?;

        if let Some(gold_docs) = gold_docs {
            for (solution, docs) in solutions.iter_mut().zip(gold_docs) {
                solution.gold_docs = Some(docs.clone());
            }
        }
        if let Some(gold_answers) = gold_answers {
            for (solution, answers) in solutions.iter_mut().zip(gold_answers) {
                solution.gold_answers = Some(answers.clone());
            }
        }

        let solutions = self.qa.qa(solutions).await;

        let metrics = gold_answers.map(|gold| {
            let mut em_sum = 0.0f64;
            let mut f1_sum = 0.0f64;
            let mut counted = 0usize;
            for (solution, answers) in solutions.iter().zip(gold) {
                let prediction = solution.answer.as_deref().unwrap_or_default();
                let (em, f1_score) = best_over_golds(answers, prediction);
                em_sum += em;
                f1_sum += f1_score;
                counted += 1;
            }
            let denominator = counted.max(1) as f64;
            QaMetrics {
                exact_match: em_sum / denominator,
                f1: f1_sum / denominator,
            }
        });

        if let Some(metrics) = &metrics {
            info!(
                queries = queries.len(),
                exact_match = metrics.exact_match,
                f1 = metrics.f1,
                "QA evaluation complete"
            );
        }

        Ok(RagQaOutput { solutions, metrics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{
        storage::types::{NerOut, TripleOut},
        utils::{
            hash::entity_id,
            llm::{ChatMessage, LlmResponse},
        },
    };
    use serde_json::Value;
    use std::collections::HashMap;

    const DOC_PARIS: &str = "Paris is the capital of France.";
    const DOC_EUROPE: &str = "France is in Europe.";

    /// Routes by call site: fact-filter prompts get the rerank script, QA
    /// prompts get the QA script.
    struct RoutedLlm {
        rerank_response: String,
        qa_response: String,
    }

    #[async_trait]
    impl LanguageModel for RoutedLlm {
        async fn infer(&self, messages: &[ChatMessage]) -> Result<LlmResponse, AppError> {
            let is_rerank = messages
                .iter()
                .any(|message| message.content.contains("fact_before_filter"));
            let response = if is_rerank {
                self.rerank_response.clone()
            } else {
                self.qa_response.clone()
            };
            Ok(LlmResponse {
                response,
                metadata: Value::Null,
            })
        }

        fn label(&self) -> String {
            "mock_llm".to_string()
        }
    }

    struct StaticExtractor {
        by_passage: HashMap<String, (Vec<String>, Vec<Vec<String>>)>,
    }

    #[async_trait]
    impl OpenIeExtractor for StaticExtractor {
        async fn batch_openie(
            &self,
            rows: &HashMap<String, String>,
        ) -> Result<(HashMap<String, NerOut>, HashMap<String, TripleOut>), AppError> {
            let mut ner = HashMap::new();
            let mut triples = HashMap::new();
            for (chunk, passage) in rows {
                let (entities, extracted) =
                    self.by_passage.get(passage).cloned().unwrap_or_default();
                ner.insert(
                    chunk.clone(),
                    NerOut {
                        chunk_id: chunk.clone(),
                        response: None,
                        unique_entities: entities,
                        metadata: Value::Null,
                    },
                );
                triples.insert(
                    chunk.clone(),
                    TripleOut {
                        chunk_id: chunk.clone(),
                        response: None,
                        triples: extracted,
                        metadata: Value::Null,
                    },
                );
            }
            Ok((ner, triples))
        }
    }

    fn geography_extractor() -> Arc<StaticExtractor> {
        let mut by_passage = HashMap::new();
        by_passage.insert(
            DOC_PARIS.to_string(),
            (
                vec!["Paris".to_string(), "France".to_string()],
                vec![vec![
                    "Paris".to_string(),
                    "capital of".to_string(),
                    "France".to_string(),
                ]],
            ),
        );
        by_passage.insert(
            DOC_EUROPE.to_string(),
            (
                vec!["France".to_string(), "Europe".to_string()],
                vec![vec![
                    "France".to_string(),
                    "in".to_string(),
                    "Europe".to_string(),
                ]],
            ),
        );
        Arc::new(StaticExtractor { by_passage })
    }

    fn test_config(save_dir: &Path) -> AppConfig {
        AppConfig {
            embedding_backend: EmbeddingBackend::Hashed,
            embedding_dimensions: 64,
            save_dir: save_dir.to_string_lossy().into_owned(),
            ..AppConfig::default()
        }
    }

    fn session_with(
        save_dir: &Path,
        rerank_response: &str,
        qa_response: &str,
    ) -> RagSession {
        let config = test_config(save_dir);
        let llm: Arc<dyn LanguageModel> = Arc::new(RoutedLlm {
            rerank_response: rerank_response.to_string(),
            qa_response: qa_response.to_string(),
        });
        let embedder = Arc::new(EmbeddingProvider::new_hashed(64));
        let templates = Arc::new(TemplateEngine::new().unwrap());
        RagSession::with_components(config, llm, embedder, geography_extractor(), templates)
            .unwrap()
    }

    fn paris_rerank() -> &'static str {
        r#"{"fact": [["paris", "capital of", "france"]]}"#
    }

    #[tokio::test]
    async fn index_builds_the_expected_graph() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_with(dir.path(), paris_rerank(), "Answer: Paris");

        let docs = vec![DOC_PARIS.to_string(), DOC_EUROPE.to_string()];
        let stats = session.index(&docs).await.unwrap();

        assert_eq!(stats.chunks_seen, 2);
        assert_eq!(session.stores().graph.vcount(), 5);
        assert_eq!(session.stores().graph.ecount(), 8);
        assert!(session
            .stores()
            .graph
            .vertex_index(&entity_id("paris"))
            .is_some());
    }

    #[tokio::test]
    async fn retrieve_ranks_the_fact_linked_passage_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_with(dir.path(), paris_rerank(), "Answer: Paris");

        let docs = vec![DOC_PARIS.to_string(), DOC_EUROPE.to_string()];
        session.index(&docs).await.unwrap();

        let queries = vec!["What is the capital of France?".to_string()];
        let solutions = session.retrieve(&queries, 2).await.unwrap();
        assert_eq!(solutions[0].docs[0], DOC_PARIS);
    }

    #[tokio::test]
    async fn delete_prunes_exclusive_entities_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_with(dir.path(), paris_rerank(), "Answer: Paris");

        let docs = vec![DOC_PARIS.to_string(), DOC_EUROPE.to_string()];
        session.index(&docs).await.unwrap();
        let stats = session.delete(&[DOC_PARIS.to_string()]).await.unwrap();

        assert_eq!(stats.chunks_removed, 1);
        let graph = &session.stores().graph;
        assert!(graph.vertex_index(&entity_id("paris")).is_none());
        assert!(graph.vertex_index(&entity_id("france")).is_some());

        // Retrieval keeps working against the shrunken corpus.
        let queries = vec!["Where is France?".to_string()];
        let solutions = session.retrieve(&queries, 5).await.unwrap();
        assert_eq!(solutions[0].docs, vec![DOC_EUROPE.to_string()]);
    }

    #[tokio::test]
    async fn rag_qa_parses_the_answer_and_scores_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_with(
            dir.path(),
            paris_rerank(),
            "Thought: It is Paris.\nAnswer: Paris",
        );

        let docs = vec![DOC_PARIS.to_string(), DOC_EUROPE.to_string()];
        session.index(&docs).await.unwrap();

        let queries = vec!["What is the capital of France?".to_string()];
        let golds = vec![vec!["Paris".to_string()]];
        let output = session
            .rag_qa(&queries, None, Some(&golds))
            .await
            .unwrap();

        assert_eq!(output.solutions[0].answer.as_deref(), Some("Paris"));
        let metrics = output.metrics.unwrap();
        assert!((metrics.exact_match - 1.0).abs() < 1e-9);
        assert!((metrics.f1 - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn qa_without_answer_marker_keeps_the_whole_response() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_with(dir.path(), paris_rerank(), "just Paris");

        session.index(&[DOC_PARIS.to_string()]).await.unwrap();
        let queries = vec!["What is the capital of France?".to_string()];
        let output = session.rag_qa(&queries, None, None).await.unwrap();

        assert_eq!(output.solutions[0].answer.as_deref(), Some("just Paris"));
        assert!(output.metrics.is_none());
    }

    #[tokio::test]
    async fn sessions_are_deterministic_given_fixed_collaborators() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let docs = vec![DOC_PARIS.to_string(), DOC_EUROPE.to_string()];
        let queries = vec!["What is the capital of France?".to_string()];

        let mut first = session_with(dir_a.path(), paris_rerank(), "Answer: Paris");
        first.index(&docs).await.unwrap();
        let a = first.retrieve(&queries, 2).await.unwrap();

        let mut second = session_with(dir_b.path(), paris_rerank(), "Answer: Paris");
        second.index(&docs).await.unwrap();
        let b = second.retrieve(&queries, 2).await.unwrap();

        assert_eq!(a[0].docs, b[0].docs);
        assert_eq!(a[0].doc_scores, b[0].doc_scores);
    }

    #[tokio::test]
    async fn session_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let docs = vec![DOC_PARIS.to_string(), DOC_EUROPE.to_string()];

        {
            let mut session = session_with(dir.path(), paris_rerank(), "Answer: Paris");
            session.index(&docs).await.unwrap();
        }

        let mut reopened = session_with(dir.path(), paris_rerank(), "Answer: Paris");
        assert_eq!(reopened.stores().chunks.len(), 2);
        assert_eq!(reopened.stores().graph.vcount(), 5);

        let queries = vec!["What is the capital of France?".to_string()];
        let solutions = reopened.retrieve(&queries, 2).await.unwrap();
        assert_eq!(solutions[0].docs[0], DOC_PARIS);
    }
}
