use std::path::PathBuf;

use clap::Parser;

/// Batch QA evaluation: one isolated session per sample, bounded
/// parallelism, aggregate report.
#[derive(Debug, Parser)]
#[command(name = "evaluations", version)]
pub struct Config {
    /// JSON file with `[{question, answers, paragraphs}, ...]` samples
    #[arg(long)]
    pub dataset_file: PathBuf,

    /// Root directory for the per-sample working directories
    #[arg(long, default_value = "./outputs/eval")]
    pub save_dir: String,

    /// Chat model identifier
    #[arg(long)]
    pub llm_name: Option<String>,

    /// OpenAI-compatible endpoint base URL
    #[arg(long)]
    pub llm_base_url: Option<String>,

    /// Embedding model identifier
    #[arg(long)]
    pub embedding_name: Option<String>,

    /// Use deterministic hashed embeddings instead of an embedding API
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub hashed_embeddings: bool,

    /// Maximum sessions in flight
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Documents retrieved per query when computing recall
    #[arg(long, default_value_t = 5)]
    pub top_k: usize,

    /// Cap on the number of samples evaluated
    #[arg(long)]
    pub limit: Option<usize>,

    /// Where the JSON report is written
    #[arg(long, default_value = "./outputs/eval/report.json")]
    pub report: PathBuf,
}
