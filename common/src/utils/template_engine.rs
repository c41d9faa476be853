use minijinja::{Environment, Value};

use crate::error::AppError;

/// Prompt registry. Templates are compiled in; lookups by name support the
/// per-dataset QA fallback chain.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    pub fn new() -> Result<Self, AppError> {
        let mut env = Environment::new();
        env.add_template("ner", include_str!("../../templates/ner.j2"))?;
        env.add_template(
            "triple_extraction",
            include_str!("../../templates/triple_extraction.j2"),
        )?;
        env.add_template(
            "rag_qa_musique",
            include_str!("../../templates/rag_qa_musique.j2"),
        )?;
        env.add_template(
            "rag_qa_hotpotqa",
            include_str!("../../templates/rag_qa_hotpotqa.j2"),
        )?;
        Ok(Self { env })
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    pub fn render(&self, name: &str, ctx: &Value) -> Result<String, AppError> {
        Ok(self.env.get_template(name)?.render(ctx)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn registry_contains_the_prompt_set() {
        let engine = TemplateEngine::new().unwrap();
        assert!(engine.has_template("ner"));
        assert!(engine.has_template("triple_extraction"));
        assert!(engine.has_template("rag_qa_musique"));
        assert!(!engine.has_template("rag_qa_unknown_dataset"));
    }

    #[test]
    fn ner_template_embeds_the_passage() {
        let engine = TemplateEngine::new().unwrap();
        let rendered = engine
            .render("ner", &context! { passage => "Paris is the capital of France." })
            .unwrap();
        assert!(rendered.contains("Paris is the capital of France."));
        assert!(rendered.contains("named_entities"));
    }

    #[test]
    fn triple_template_embeds_entities_and_passage() {
        let engine = TemplateEngine::new().unwrap();
        let rendered = engine
            .render(
                "triple_extraction",
                &context! {
                    passage => "France is in Europe.",
                    named_entities => r#"["France", "Europe"]"#,
                },
            )
            .unwrap();
        assert!(rendered.contains("France is in Europe."));
        assert!(rendered.contains(r#"["France", "Europe"]"#));
    }
}
