use std::{collections::HashSet, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use common::{
    error::AppError,
    storage::types::Triple,
    utils::{
        json::extract_array_for_key,
        llm::{ChatMessage, LanguageModel},
        text::{jaccard, token_set},
    },
};

/// Token-overlap floor below which a fuzzy match is rejected.
const JACCARD_ACCEPT: f64 = 0.2;

/// Filter instructions used when the program file carries no system message.
const DEFAULT_SYSTEM: &str = "You are given a question together with candidate facts, \
each a (subject, predicate, object) triple. Select the facts that help answer the \
question and return them unchanged, best first. Respond with a JSON object of the \
form {\"fact\": [[\"subject\", \"predicate\", \"object\"], ...]} and nothing else. \
Return {\"fact\": []} when no candidate is relevant.";

/// Few-shot demonstration in the compiled-program format: the unfiltered
/// candidates and the expected filtered output, both as JSON bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankDemo {
    pub question: String,
    pub fact_before_filter: String,
    pub fact_after_filter: String,
}

/// Optional system message plus demos, loadable from a JSON file produced by
/// a prompt-optimization run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerankProgram {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub demos: Vec<RerankDemo>,
}

impl RerankProgram {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Built-in program used when no file is configured.
    pub fn compiled_default() -> Self {
        Self {
            system: None,
            demos: vec![RerankDemo {
                question: "Which country is the capital of France located in?".to_string(),
                fact_before_filter: json!({
                    "fact": [
                        ["paris", "capital of", "france"],
                        ["london", "capital of", "united kingdom"],
                        ["france", "is in", "europe"],
                    ]
                })
                .to_string(),
                fact_after_filter: json!({
                    "fact": [
                        ["paris", "capital of", "france"],
                        ["france", "is in", "europe"],
                    ]
                })
                .to_string(),
            }],
        }
    }
}

/// Reranker output: the surviving candidates mapped back to their global
/// fact indices, plus call metadata for diagnostics.
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub indices: Vec<usize>,
    pub facts: Vec<Triple>,
    pub metadata: Value,
}

impl RerankOutcome {
    fn empty() -> Self {
        Self {
            indices: Vec::new(),
            facts: Vec::new(),
            metadata: Value::Null,
        }
    }
}

/// LLM-driven filter over candidate triples. Never fails: every error path
/// degrades to the candidates in their original dense-score order.
pub struct FactReranker {
    llm: Arc<dyn LanguageModel>,
    program: RerankProgram,
}

impl FactReranker {
    pub fn new(llm: Arc<dyn LanguageModel>, program: RerankProgram) -> Self {
        Self { llm, program }
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[Triple],
        candidate_indices: &[usize],
        k: usize,
    ) -> RerankOutcome {
        if candidates.is_empty() {
            return RerankOutcome::empty();
        }

        let messages = self.build_messages(query, candidates);
        let reply = match self.llm.infer(&messages).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "fact filter call failed, keeping dense order");
                return RerankOutcome {
                    indices: candidate_indices.iter().take(k).copied().collect(),
                    facts: candidates.iter().take(k).cloned().collect(),
                    metadata: json!({ "error": err.to_string() }),
                };
            }
        };

        let parsed = parse_fact_rows(&reply.response);
        let matched = match_candidates(&parsed, candidates);

        let (indices, facts) = if matched.is_empty() {
            debug!("fact filter matched nothing, keeping dense order");
            (
                candidate_indices.iter().take(k).copied().collect(),
                candidates.iter().take(k).cloned().collect(),
            )
        } else {
            let indices = matched
                .iter()
                .filter_map(|pos| candidate_indices.get(*pos).copied())
                .take(k)
                .collect();
            let facts = matched
                .iter()
                .filter_map(|pos| candidates.get(*pos).cloned())
                .take(k)
                .collect();
            (indices, facts)
        };

        RerankOutcome {
            indices,
            facts,
            metadata: json!({
                "model_response": reply.response,
                "confidence": Value::Null,
            }),
        }
    }

    fn build_messages(&self, query: &str, candidates: &[Triple]) -> Vec<ChatMessage> {
        let system = self
            .program
            .system
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM.to_string());

        let mut messages = vec![ChatMessage::system(system)];
        for demo in &self.program.demos {
            messages.push(ChatMessage::user(render_user_turn(
                &demo.question,
                &demo.fact_before_filter,
            )));
            messages.push(ChatMessage::assistant(demo.fact_after_filter.clone()));
        }

        let fact_body = json!({
            "fact": candidates.iter().map(Triple::parts).collect::<Vec<_>>()
        })
        .to_string();
        messages.push(ChatMessage::user(render_user_turn(query, &fact_body)));
        messages
    }
}

/// DSPy-style field layout for one user turn.
fn render_user_turn(question: &str, fact_before_filter: &str) -> String {
    format!(
        "[[ ## question ## ]]\n{question}\n\n[[ ## fact_before_filter ## ]]\n{fact_before_filter}"
    )
}

/// Candidate rows from the model response, as loose string lists.
fn parse_fact_rows(response: &str) -> Vec<Vec<String>> {
    let Some(items) = extract_array_for_key(response, "fact") else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|row| match row {
            Value::Array(parts) => Some(
                parts
                    .into_iter()
                    .map(|part| match part {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect::<Vec<String>>(),
            ),
            _ => None,
        })
        .collect()
}

/// Maps each parsed row to a candidate position: exact list equality first,
/// then best token-set Jaccard above the acceptance floor. A candidate can be
/// claimed at most once.
fn match_candidates(parsed: &[Vec<String>], candidates: &[Triple]) -> Vec<usize> {
    let mut used: HashSet<usize> = HashSet::new();
    let mut matched: Vec<usize> = Vec::new();

    for row in parsed {
        let exact = candidates
            .iter()
            .enumerate()
            .find(|(pos, candidate)| {
                !used.contains(pos) && candidate.parts().as_slice() == row.as_slice()
            })
            .map(|(pos, _)| pos);
        if let Some(pos) = exact {
            used.insert(pos);
            matched.push(pos);
            continue;
        }

        let row_tokens = token_set(row);
        let mut best: Option<(usize, f64)> = None;
        for (pos, candidate) in candidates.iter().enumerate() {
            if used.contains(&pos) {
                continue;
            }
            let similarity = jaccard(&row_tokens, &token_set(candidate.parts()));
            if similarity >= JACCARD_ACCEPT
                && best.map_or(true, |(_, best_sim)| similarity > best_sim)
            {
                best = Some((pos, similarity));
            }
        }
        if let Some((pos, _)) = best {
            used.insert(pos);
            matched.push(pos);
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::utils::llm::LlmResponse;

    struct FixedLlm {
        response: Result<String, String>,
    }

    #[async_trait]
    impl LanguageModel for FixedLlm {
        async fn infer(&self, _messages: &[ChatMessage]) -> Result<LlmResponse, AppError> {
            match &self.response {
                Ok(response) => Ok(LlmResponse {
                    response: response.clone(),
                    metadata: Value::Null,
                }),
                Err(message) => Err(AppError::InternalError(message.clone())),
            }
        }

        fn label(&self) -> String {
            "fixed".to_string()
        }
    }

    fn triple(s: &str, r: &str, o: &str) -> Triple {
        Triple::new(s.into(), r.into(), o.into())
    }

    fn candidates() -> Vec<Triple> {
        vec![
            triple("paris", "capital of", "france"),
            triple("london", "capital of", "united kingdom"),
            triple("france", "in", "europe"),
        ]
    }

    fn reranker(response: Result<String, String>) -> FactReranker {
        FactReranker::new(
            Arc::new(FixedLlm { response }),
            RerankProgram::compiled_default(),
        )
    }

    #[tokio::test]
    async fn exact_matches_map_back_to_global_indices() {
        let reranker = reranker(Ok(
            r#"{"fact": [["france", "in", "europe"], ["paris", "capital of", "france"]]}"#.into(),
        ));
        let outcome = reranker
            .rerank("where is paris", &candidates(), &[10, 20, 30], 5)
            .await;

        assert_eq!(outcome.indices, vec![30, 10]);
        assert_eq!(outcome.facts[0], triple("france", "in", "europe"));
        assert!(outcome.metadata.get("model_response").is_some());
    }

    #[tokio::test]
    async fn fuzzy_match_recovers_surface_form_changes() {
        // The model returns capitalized variants; Jaccard on normalized
        // tokens still identifies the candidates.
        let reranker = reranker(Ok(
            r#"{"fact": [["Paris", "Capital of", "France"]]}"#.into()
        ));
        let outcome = reranker
            .rerank("q", &candidates(), &[0, 1, 2], 5)
            .await;

        assert_eq!(outcome.indices, vec![0]);
        assert_eq!(outcome.facts, vec![triple("paris", "capital of", "france")]);
    }

    #[tokio::test]
    async fn each_candidate_matches_at_most_once() {
        let reranker = reranker(Ok(
            r#"{"fact": [["paris", "capital of", "france"], ["paris", "capital of", "france"]]}"#
                .into(),
        ));
        let outcome = reranker.rerank("q", &candidates(), &[0, 1, 2], 5).await;
        assert_eq!(outcome.indices, vec![0], "duplicate row cannot claim twice");
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_original_order_with_error() {
        let reranker = reranker(Err("connection reset".into()));
        let outcome = reranker.rerank("q", &candidates(), &[7, 8, 9], 2).await;

        assert_eq!(outcome.indices, vec![7, 8]);
        assert_eq!(outcome.facts.len(), 2);
        assert!(outcome.metadata["error"]
            .as_str()
            .unwrap()
            .contains("connection reset"));
    }

    #[tokio::test]
    async fn unparseable_response_falls_back_to_original_order() {
        let reranker = reranker(Ok("I cannot help with that.".into()));
        let outcome = reranker.rerank("q", &candidates(), &[0, 1, 2], 2).await;
        assert_eq!(outcome.indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn empty_candidates_return_empty() {
        let reranker = reranker(Ok(r#"{"fact": []}"#.into()));
        let outcome = reranker.rerank("q", &[], &[], 5).await;
        assert!(outcome.indices.is_empty());
        assert!(outcome.facts.is_empty());
    }

    #[test]
    fn program_round_trips_through_json() {
        let program = RerankProgram::compiled_default();
        let raw = serde_json::to_string(&program).unwrap();
        let loaded: RerankProgram = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded.demos.len(), program.demos.len());
    }
}
