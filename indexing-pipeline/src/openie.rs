use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use minijinja::context;
use serde_json::{json, Value};
use tracing::warn;

use common::{
    error::AppError,
    storage::types::{NerOut, TripleOut},
    utils::{
        json::extract_array_for_key,
        llm::{ChatMessage, LanguageModel},
        template_engine::TemplateEngine,
    },
};

/// System message for the entity recognition turn.
const NER_SYSTEM: &str = "You are a precise information extraction assistant. \
    You always respond with a single JSON object and nothing else.";

/// System message for the triple extraction turn.
const TRIPLE_SYSTEM: &str = "You are a precise knowledge graph construction assistant. \
    You always respond with a single JSON object and nothing else.";

/// Open information extraction over a batch of chunks. The three run modes
/// (online, offline pre-pass, cache replay) share this one contract; only
/// *when* extraction happens differs.
#[async_trait]
pub trait OpenIeExtractor: Send + Sync {
    async fn batch_openie(
        &self,
        rows: &HashMap<String, String>,
    ) -> Result<(HashMap<String, NerOut>, HashMap<String, TripleOut>), AppError>;
}

/// Reference extractor: renders the `ner` prompt, then feeds the recognized
/// entities into the `triple_extraction` prompt.
pub struct LlmOpenIeExtractor {
    llm: Arc<dyn LanguageModel>,
    templates: Arc<TemplateEngine>,
}

impl LlmOpenIeExtractor {
    pub fn new(llm: Arc<dyn LanguageModel>, templates: Arc<TemplateEngine>) -> Self {
        Self { llm, templates }
    }

    async fn extract_entities(&self, chunk_id: &str, passage: &str) -> Result<NerOut, AppError> {
        let prompt = self
            .templates
            .render("ner", &context! { passage => passage })?;
        let messages = [ChatMessage::system(NER_SYSTEM), ChatMessage::user(prompt)];
        let reply = self.llm.infer(&messages).await?;

        let unique_entities = match extract_array_for_key(&reply.response, "named_entities") {
            Some(items) => dedup_strings(items),
            None => {
                warn!(chunk_id, "NER response without a named_entities array");
                Vec::new()
            }
        };

        Ok(NerOut {
            chunk_id: chunk_id.to_string(),
            response: Some(reply.response),
            unique_entities,
            metadata: reply.metadata,
        })
    }

    async fn extract_triples(
        &self,
        chunk_id: &str,
        passage: &str,
        entities: &[String],
    ) -> Result<TripleOut, AppError> {
        let prompt = self.templates.render(
            "triple_extraction",
            &context! {
                passage => passage,
                named_entities => json!(entities).to_string(),
            },
        )?;
        let messages = [ChatMessage::system(TRIPLE_SYSTEM), ChatMessage::user(prompt)];
        let reply = self.llm.infer(&messages).await?;

        let triples = match extract_array_for_key(&reply.response, "triples") {
            Some(items) => items
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
                .collect(),
            None => {
                warn!(chunk_id, "triple response without a triples array");
                Vec::new()
            }
        };

        Ok(TripleOut {
            chunk_id: chunk_id.to_string(),
            response: Some(reply.response),
            triples,
            metadata: reply.metadata,
        })
    }
}

#[async_trait]
impl OpenIeExtractor for LlmOpenIeExtractor {
    async fn batch_openie(
        &self,
        rows: &HashMap<String, String>,
    ) -> Result<(HashMap<String, NerOut>, HashMap<String, TripleOut>), AppError> {
        let mut ner_results = HashMap::with_capacity(rows.len());
        let mut triple_results = HashMap::with_capacity(rows.len());

        // Deterministic order keeps logs and caches stable across runs.
        let mut ordered: Vec<(&String, &String)> = rows.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(b.0));

        for (chunk_id, passage) in ordered {
            let ner = self.extract_entities(chunk_id, passage).await?;
            let triples = self
                .extract_triples(chunk_id, passage, &ner.unique_entities)
                .await?;
            ner_results.insert(chunk_id.clone(), ner);
            triple_results.insert(chunk_id.clone(), triples);
        }

        Ok((ner_results, triple_results))
    }
}

/// Non-blank string forms of the items, first occurrence kept.
fn dedup_strings(items: Vec<Value>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let text = match item {
            Value::String(s) => s,
            other => other.to_string(),
        };
        if !text.trim().is_empty() && seen.insert(text.clone()) {
            out.push(text);
        }
    }
    out
}
