use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::AppError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenIeMode {
    Online,
    Offline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAi,
    FastEmbed,
    Hashed,
}

fn default_openie_mode() -> OpenIeMode {
    OpenIeMode::Online
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::OpenAi
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub llm_base_url: String,
    #[serde(default = "default_llm_name")]
    pub llm_name: String,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_name")]
    pub embedding_name: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_save_dir")]
    pub save_dir: String,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: usize,
    #[serde(default = "default_openie_mode")]
    pub openie_mode: OpenIeMode,
    #[serde(default)]
    pub is_directed_graph: bool,
    #[serde(default = "default_synonymy_edge_top_k")]
    pub synonymy_edge_top_k: usize,
    #[serde(default = "default_synonymy_edge_sim_threshold")]
    pub synonymy_edge_sim_threshold: f64,
    #[serde(default = "default_linking_top_k")]
    pub linking_top_k: usize,
    #[serde(default = "default_passage_node_weight")]
    pub passage_node_weight: f64,
    #[serde(default = "default_damping")]
    pub damping: f64,
    #[serde(default = "default_qa_top_k")]
    pub qa_top_k: usize,
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
    #[serde(default)]
    pub force_index_from_scratch: bool,
    #[serde(default)]
    pub force_openie_from_scratch: bool,
    /// Optional DSPy-style demo file for the fact reranker.
    #[serde(default)]
    pub rerank_demo_path: Option<String>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_name() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_name() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    768
}

fn default_save_dir() -> String {
    "./outputs".to_string()
}

fn default_dataset() -> String {
    "musique".to_string()
}

fn default_temperature() -> f32 {
    0.0
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_max_retry_attempts() -> usize {
    5
}

fn default_synonymy_edge_top_k() -> usize {
    2047
}

fn default_synonymy_edge_sim_threshold() -> f64 {
    0.8
}

fn default_linking_top_k() -> usize {
    5
}

fn default_passage_node_weight() -> f64 {
    0.05
}

fn default_damping() -> f64 {
    0.5
}

fn default_qa_top_k() -> usize {
    5
}

fn default_retrieval_top_k() -> usize {
    200
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            llm_base_url: default_base_url(),
            llm_name: default_llm_name(),
            embedding_backend: default_embedding_backend(),
            embedding_name: default_embedding_name(),
            embedding_dimensions: default_embedding_dimensions(),
            save_dir: default_save_dir(),
            dataset: default_dataset(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_retry_attempts: default_max_retry_attempts(),
            openie_mode: default_openie_mode(),
            is_directed_graph: false,
            synonymy_edge_top_k: default_synonymy_edge_top_k(),
            synonymy_edge_sim_threshold: default_synonymy_edge_sim_threshold(),
            linking_top_k: default_linking_top_k(),
            passage_node_weight: default_passage_node_weight(),
            damping: default_damping(),
            qa_top_k: default_qa_top_k(),
            retrieval_top_k: default_retrieval_top_k(),
            force_index_from_scratch: false,
            force_openie_from_scratch: false,
            rerank_demo_path: None,
        }
    }
}

/// Layered configuration: optional `config` file in the working directory,
/// then environment variables on top.
pub fn get_config() -> Result<AppConfig, AppError> {
    get_config_from(None)
}

pub fn get_config_from(path: Option<&str>) -> Result<AppConfig, AppError> {
    let mut builder = Config::builder().add_source(File::with_name(path.unwrap_or("config")).required(false));
    builder = builder.add_source(Environment::default());

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let config = AppConfig::default();
        assert!((config.synonymy_edge_sim_threshold - 0.8).abs() < f64::EPSILON);
        assert!((config.passage_node_weight - 0.05).abs() < f64::EPSILON);
        assert!((config.damping - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.linking_top_k, 5);
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.openie_mode, OpenIeMode::Online);
        assert!(!config.is_directed_graph);
    }
}
