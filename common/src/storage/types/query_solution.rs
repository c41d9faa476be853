use serde::{Deserialize, Serialize};

/// Ranked retrieval output for one query, later enriched with the QA answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySolution {
    pub question: String,
    pub docs: Vec<String>,
    pub doc_scores: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gold_answers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gold_docs: Option<Vec<String>>,
}

impl QuerySolution {
    pub fn new(question: String, docs: Vec<String>, doc_scores: Vec<f64>) -> Self {
        Self {
            question,
            docs,
            doc_scores,
            answer: None,
            gold_answers: None,
            gold_docs: None,
        }
    }

    /// Top `k` docs, used when building QA prompts.
    pub fn top_docs(&self, k: usize) -> &[String] {
        let end = self.docs.len().min(k);
        self.docs.get(..end).unwrap_or_default()
    }
}
