use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::AppError,
    storage::{
        persist::{atomic_write_json, read_json},
        types::OpenIeDoc,
    },
    utils::hash::chunk_id,
};

/// Persisted extraction log for one working directory.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OpenIeResults {
    pub docs: Vec<OpenIeDoc>,
    pub avg_ent_chars: f64,
    pub avg_ent_words: f64,
}

impl OpenIeResults {
    /// Recomputes each entry's `idx` from its passage hash. Passages are
    /// content-addressed, so the hash is authoritative over whatever the
    /// file carried.
    pub fn repair_indexes(&mut self) {
        for doc in &mut self.docs {
            doc.idx = chunk_id(&doc.passage);
        }
    }

    pub fn recompute_stats(&mut self) {
        let mut chars = 0usize;
        let mut words = 0usize;
        let mut count = 0usize;
        for doc in &self.docs {
            for entity in &doc.extracted_entities {
                chars += entity.chars().count();
                words += entity.split_whitespace().count();
                count += 1;
            }
        }
        if count == 0 {
            self.avg_ent_chars = 0.0;
            self.avg_ent_words = 0.0;
        } else {
            self.avg_ent_chars = chars as f64 / count as f64;
            self.avg_ent_words = words as f64 / count as f64;
        }
    }

    pub fn doc_map(&self) -> HashMap<String, &OpenIeDoc> {
        self.docs.iter().map(|doc| (doc.idx.clone(), doc)).collect()
    }

    /// Splits `chunk_ids` into those already extracted and those still
    /// needing a pass.
    pub fn partition<'a>(&self, chunk_ids: &'a [String]) -> (Vec<&'a String>, Vec<&'a String>) {
        let cached = self.doc_map();
        chunk_ids.iter().partition(|id| cached.contains_key(*id))
    }
}

/// File handle for `openie_results_ner_<llm_label>.json`.
pub struct OpenIeStore {
    path: PathBuf,
}

impl OpenIeStore {
    pub fn new(dir: &Path, llm_label: &str) -> Self {
        Self {
            path: dir.join(format!("openie_results_ner_{llm_label}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the cache (empty when absent or when `from_scratch` is set)
    /// and repairs content-hash indexes.
    pub fn load(&self, from_scratch: bool) -> Result<OpenIeResults, AppError> {
        if from_scratch {
            info!(path = %self.path.display(), "ignoring extraction cache");
            return Ok(OpenIeResults::default());
        }
        let mut results: OpenIeResults = read_json(&self.path)?.unwrap_or_default();
        results.repair_indexes();
        debug!(
            path = %self.path.display(),
            docs = results.docs.len(),
            "loaded extraction cache"
        );
        Ok(results)
    }

    /// Rewrites the whole file after refreshing the aggregate entity stats.
    pub fn save(&self, results: &mut OpenIeResults) -> Result<(), AppError> {
        results.recompute_stats();
        atomic_write_json(&self.path, results)
    }
}
