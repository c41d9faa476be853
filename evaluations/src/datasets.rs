use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// One evaluation case: a question, its gold answer aliases and the
/// supporting corpus to index for it.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalSample {
    pub question: String,
    #[serde(default, alias = "answer")]
    pub answers: Vec<String>,
    #[serde(default)]
    pub paragraphs: Vec<String>,
}

pub fn load_samples(path: &Path, limit: Option<usize>) -> Result<Vec<EvalSample>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading dataset file {}", path.display()))?;
    let mut samples: Vec<EvalSample> =
        serde_json::from_str(&raw).context("dataset file must be a JSON list of samples")?;
    if samples.is_empty() {
        bail!("dataset file {} holds no samples", path.display());
    }
    if let Some(limit) = limit {
        samples.truncate(limit);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_parse_with_answer_alias() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("dataset.json");
        std::fs::write(
            &file,
            r#"[{"question": "q1", "answer": ["a"], "paragraphs": ["p"]},
                {"question": "q2", "answers": ["b", "c"], "paragraphs": []}]"#,
        )
        .unwrap();

        let samples = load_samples(&file, None).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].answers, vec!["a".to_string()]);
        assert_eq!(samples[1].answers.len(), 2);

        let limited = load_samples(&file, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("dataset.json");
        std::fs::write(&file, "[]").unwrap();
        assert!(load_samples(&file, None).is_err());
    }
}
