use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use common::utils::config::{get_config_from, AppConfig, EmbeddingBackend, OpenIeMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum OpenIeModeArg {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum EmbeddingBackendArg {
    OpenAi,
    FastEmbed,
    Hashed,
}

/// Graph-indexed retrieval engine: index passages, link facts, answer
/// questions.
#[derive(Debug, Parser)]
#[command(name = "munin", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args)]
pub struct Overrides {
    /// Configuration file (TOML/JSON/YAML) layered under the environment
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Root directory holding per-session working directories
    #[arg(long, global = true)]
    pub save_dir: Option<String>,

    /// Chat model identifier
    #[arg(long, global = true)]
    pub llm_name: Option<String>,

    /// OpenAI-compatible endpoint base URL
    #[arg(long, global = true)]
    pub llm_base_url: Option<String>,

    /// Embedding model identifier
    #[arg(long, global = true)]
    pub embedding_name: Option<String>,

    /// Embedding backend selection
    #[arg(long, global = true)]
    pub embedding_backend: Option<EmbeddingBackendArg>,

    /// When extraction runs relative to indexing
    #[arg(long, global = true)]
    pub openie_mode: Option<OpenIeModeArg>,

    /// Clear the working directory before indexing
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub force_index_from_scratch: bool,

    /// Ignore the on-disk extraction cache
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub force_openie_from_scratch: bool,

    /// DSPy-style demo file for the fact reranker
    #[arg(long, global = true)]
    pub rerank_demo_path: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Index passages from a JSON list file
    Index {
        #[arg(long)]
        docs: PathBuf,
    },
    /// Remove previously indexed passages
    Delete {
        #[arg(long)]
        docs: PathBuf,
    },
    /// Populate the extraction cache without touching the graph
    PreOpenie {
        #[arg(long)]
        docs: PathBuf,
    },
    /// Rank passages for each query
    Retrieve {
        #[arg(long)]
        queries: PathBuf,
        #[arg(long, default_value_t = 5)]
        k: usize,
        /// Dense retrieval only, skipping the graph
        #[arg(long, action = clap::ArgAction::SetTrue)]
        dpr: bool,
    },
    /// Retrieve and answer each query
    Qa {
        #[arg(long)]
        queries: PathBuf,
    },
}

impl Cli {
    /// Layered config (file + environment) with CLI overrides applied on
    /// top.
    pub fn build_config(&self) -> Result<AppConfig> {
        let overrides = &self.overrides;
        let config_path = overrides
            .config
            .as_deref()
            .map(resolve_within_cwd)
            .transpose()?;
        let mut config = get_config_from(
            config_path
                .as_deref()
                .and_then(Path::to_str),
        )
        .context("loading configuration")?;

        if let Some(save_dir) = &overrides.save_dir {
            config.save_dir = save_dir.clone();
        }
        if let Some(llm_name) = &overrides.llm_name {
            config.llm_name = llm_name.clone();
        }
        if let Some(llm_base_url) = &overrides.llm_base_url {
            config.llm_base_url = llm_base_url.clone();
        }
        if let Some(embedding_name) = &overrides.embedding_name {
            config.embedding_name = embedding_name.clone();
        }
        if let Some(backend) = overrides.embedding_backend {
            config.embedding_backend = match backend {
                EmbeddingBackendArg::OpenAi => EmbeddingBackend::OpenAi,
                EmbeddingBackendArg::FastEmbed => EmbeddingBackend::FastEmbed,
                EmbeddingBackendArg::Hashed => EmbeddingBackend::Hashed,
            };
        }
        if let Some(mode) = overrides.openie_mode {
            config.openie_mode = match mode {
                OpenIeModeArg::Online => OpenIeMode::Online,
                OpenIeModeArg::Offline => OpenIeMode::Offline,
            };
        }
        if overrides.force_index_from_scratch {
            config.force_index_from_scratch = true;
        }
        if overrides.force_openie_from_scratch {
            config.force_openie_from_scratch = true;
        }
        if let Some(path) = &overrides.rerank_demo_path {
            let resolved = resolve_within_cwd(path)?;
            config.rerank_demo_path = Some(resolved.to_string_lossy().into_owned());
        }

        Ok(config)
    }
}

/// Canonicalizes a file argument and refuses paths escaping the current
/// working directory.
pub fn resolve_within_cwd(path: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("usage: cannot resolve path {}", path.display()))?;
    let cwd = std::env::current_dir()?.canonicalize()?;
    if !canonical.starts_with(&cwd) {
        bail!(
            "usage: path {} resolves outside the working directory",
            path.display()
        );
    }
    Ok(canonical)
}

/// Reads a JSON array of strings (documents or queries).
pub fn load_string_list(path: &Path) -> Result<Vec<String>> {
    let resolved = resolve_within_cwd(path)?;
    let raw = std::fs::read_to_string(&resolved)
        .with_context(|| format!("reading {}", resolved.display()))?;
    let items: Vec<String> = serde_json::from_str(&raw)
        .with_context(|| format!("usage: {} must be a JSON list of strings", path.display()))?;
    if items.is_empty() {
        bail!("usage: {} contains no entries", path.display());
    }
    Ok(items)
}

/// Usage problems exit with code 2; everything else is a runtime failure.
pub fn is_usage_error(err: &anyhow::Error) -> bool {
    format!("{err:#}").contains("usage:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn string_list_round_trips() {
        let dir = std::env::current_dir().unwrap();
        let file = dir.join("munin_args_test.json");
        std::fs::write(&file, r#"["one", "two"]"#).unwrap();

        let items = load_string_list(&file).unwrap();
        std::fs::remove_file(&file).unwrap();
        assert_eq!(items, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn paths_outside_cwd_are_rejected() {
        let err = resolve_within_cwd(Path::new("/etc/hosts")).unwrap_err();
        assert!(is_usage_error(&err));
    }
}
