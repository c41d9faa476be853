use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SampleReport {
    pub idx: usize,
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub exact_match: f64,
    pub f1: f64,
    pub recall_at_k: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EvalReport {
    pub run_id: String,
    pub started_at: String,
    pub llm_name: String,
    pub embedding_backend: String,
    pub top_k: usize,
    pub mean_exact_match: f64,
    pub mean_f1: f64,
    pub mean_recall_at_k: f64,
    pub failed_samples: usize,
    pub samples: Vec<SampleReport>,
}

impl EvalReport {
    pub fn new(
        run_id: String,
        started_at: DateTime<Utc>,
        llm_name: String,
        embedding_backend: String,
        top_k: usize,
        samples: Vec<SampleReport>,
    ) -> Self {
        let scored = samples.iter().filter(|s| s.error.is_none()).count();
        let denominator = scored.max(1) as f64;
        let mean = |f: fn(&SampleReport) -> f64| {
            samples
                .iter()
                .filter(|s| s.error.is_none())
                .map(f)
                .sum::<f64>()
                / denominator
        };

        Self {
            run_id,
            started_at: started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            llm_name,
            embedding_backend,
            top_k,
            mean_exact_match: mean(|s| s.exact_match),
            mean_f1: mean(|s| s.f1),
            mean_recall_at_k: mean(|s| s.recall_at_k),
            failed_samples: samples.len() - scored,
            samples,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating report directory {}", parent.display()))?;
        }
        let payload = serde_json::to_vec_pretty(self).context("serializing report")?;
        std::fs::write(path, payload)
            .with_context(|| format!("writing report {}", path.display()))?;
        Ok(())
    }
}

/// Fraction of gold paragraphs found in the top `k` retrieved docs.
pub fn recall_at_k(gold_paragraphs: &[String], retrieved: &[String], k: usize) -> f64 {
    if gold_paragraphs.is_empty() {
        return 0.0;
    }
    let window = &retrieved[..retrieved.len().min(k)];
    let hits = gold_paragraphs
        .iter()
        .filter(|gold| window.iter().any(|doc| doc == *gold))
        .count();
    hits as f64 / gold_paragraphs.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(idx: usize, em: f64, f1: f64, error: Option<&str>) -> SampleReport {
        SampleReport {
            idx,
            question: format!("q{idx}"),
            answer: Some("a".to_string()),
            exact_match: em,
            f1,
            recall_at_k: 1.0,
            error: error.map(String::from),
        }
    }

    #[test]
    fn means_skip_failed_samples() {
        let report = EvalReport::new(
            "run".into(),
            Utc::now(),
            "m".into(),
            "hashed".into(),
            5,
            vec![
                sample(0, 1.0, 1.0, None),
                sample(1, 0.0, 0.5, None),
                sample(2, 0.0, 0.0, Some("boom")),
            ],
        );
        assert!((report.mean_exact_match - 0.5).abs() < 1e-9);
        assert!((report.mean_f1 - 0.75).abs() < 1e-9);
        assert_eq!(report.failed_samples, 1);
    }

    #[test]
    fn recall_counts_hits_within_the_window() {
        let gold = vec!["a".to_string(), "b".to_string()];
        let retrieved = vec!["b".to_string(), "c".to_string(), "a".to_string()];
        assert!((recall_at_k(&gold, &retrieved, 2) - 0.5).abs() < 1e-9);
        assert!((recall_at_k(&gold, &retrieved, 3) - 1.0).abs() < 1e-9);
        assert!((recall_at_k(&[], &retrieved, 3) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn report_writes_to_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/report.json");
        let report = EvalReport::new(
            "run".into(),
            Utc::now(),
            "m".into(),
            "hashed".into(),
            5,
            vec![sample(0, 1.0, 1.0, None)],
        );
        report.write(&path).unwrap();
        assert!(path.is_file());
    }
}
