use std::sync::Arc;

use minijinja::context;
use tracing::warn;

use common::{
    error::AppError,
    storage::types::QuerySolution,
    utils::{
        llm::{ChatMessage, LanguageModel},
        template_engine::TemplateEngine,
    },
};

/// Literal the model is instructed to close its response with.
const ANSWER_MARKER: &str = "Answer:";

/// Formats top-ranked passages into a reading-comprehension prompt and
/// parses the model's final answer.
pub struct QaPipeline {
    llm: Arc<dyn LanguageModel>,
    templates: Arc<TemplateEngine>,
    dataset: String,
    qa_top_k: usize,
}

impl QaPipeline {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        templates: Arc<TemplateEngine>,
        dataset: String,
        qa_top_k: usize,
    ) -> Self {
        Self {
            llm,
            templates,
            dataset,
            qa_top_k,
        }
    }

    /// Answers each solution in place. A per-query failure logs and leaves
    /// that answer empty; it never aborts the batch.
    pub async fn qa(&self, mut solutions: Vec<QuerySolution>) -> Vec<QuerySolution> {
        for solution in &mut solutions {
            match self.answer_one(solution).await {
                Ok(answer) => solution.answer = Some(answer),
                Err(err) => {
                    warn!(question = %solution.question, error = %err, "QA failed for query");
                    solution.answer = Some(String::new());
                }
            }
        }
        solutions
    }

    async fn answer_one(&self, solution: &QuerySolution) -> Result<String, AppError> {
        let system = self.system_message()?;
        let prompt = build_prompt(&solution.question, solution.top_docs(self.qa_top_k));
        let messages = [ChatMessage::system(system), ChatMessage::user(prompt)];
        let reply = self.llm.infer(&messages).await?;
        Ok(parse_answer(&reply.response))
    }

    /// The per-dataset QA instructions, falling back to the musique prompt
    /// when no dataset-specific template is registered.
    fn system_message(&self) -> Result<String, AppError> {
        let name = format!("rag_qa_{}", self.dataset);
        let template = if self.templates.has_template(&name) {
            name
        } else {
            "rag_qa_musique".to_string()
        };
        self.templates.render(&template, &context! {})
    }
}

fn build_prompt(question: &str, docs: &[String]) -> String {
    let mut prompt = String::new();
    for doc in docs {
        prompt.push_str("Wikipedia Title: ");
        prompt.push_str(doc);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Question: ");
    prompt.push_str(question);
    prompt.push_str("\nThought: ");
    prompt
}

/// Everything after the literal `Answer:`, trimmed; the whole response when
/// the marker is absent.
pub fn parse_answer(response: &str) -> String {
    match response.find(ANSWER_MARKER) {
        Some(pos) => response
            .get(pos + ANSWER_MARKER.len()..)
            .unwrap_or_default()
            .trim()
            .to_string(),
        None => response.trim().to_string(),
    }
}
