use std::path::{Path, PathBuf};

use crate::{
    error::AppError,
    storage::{embedding_store::EmbeddingStore, graph::SimpleGraph, openie_store::OpenIeStore},
    utils::hash::{CHUNK_PREFIX, ENTITY_PREFIX, FACT_PREFIX},
};

/// The five persisted artifacts of one working directory: the three
/// namespace stores, the graph, and the extraction cache.
pub struct StoreSet {
    pub chunks: EmbeddingStore,
    pub entities: EmbeddingStore,
    pub facts: EmbeddingStore,
    pub graph: SimpleGraph,
    pub openie: OpenIeStore,
    dir: PathBuf,
    graph_path: PathBuf,
}

impl StoreSet {
    pub fn open(dir: &Path, llm_label: &str, directed: bool) -> Result<Self, AppError> {
        std::fs::create_dir_all(dir)?;
        let graph_path = dir.join("graph.json");
        Ok(Self {
            chunks: EmbeddingStore::open(dir, "chunk", CHUNK_PREFIX)?,
            entities: EmbeddingStore::open(dir, "entity", ENTITY_PREFIX)?,
            facts: EmbeddingStore::open(dir, "fact", FACT_PREFIX)?,
            graph: SimpleGraph::load(&graph_path, directed)?,
            openie: OpenIeStore::new(dir, llm_label),
            dir: dir.to_path_buf(),
            graph_path,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_graph(&self) -> Result<(), AppError> {
        self.graph.save(&self.graph_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("gpt_4o_mini_hashed");
        let stores = StoreSet::open(&nested, "gpt_4o_mini", false).unwrap();

        assert!(nested.is_dir());
        assert!(stores.chunks.is_empty());
        assert_eq!(stores.graph.vcount(), 0);
    }

    #[test]
    fn graph_persists_through_save_graph() {
        let dir = tempfile::tempdir().unwrap();
        let mut stores = StoreSet::open(dir.path(), "m", false).unwrap();
        stores
            .graph
            .add_vertices(vec![crate::storage::graph::VertexAttrs::new(
                "entity-x", "x",
            )])
            .unwrap();
        stores.save_graph().unwrap();

        let reopened = StoreSet::open(dir.path(), "m", false).unwrap();
        assert_eq!(reopened.graph.vcount(), 1);
    }
}
