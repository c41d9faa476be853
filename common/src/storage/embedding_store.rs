use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::AppError,
    storage::persist::{atomic_write_json, read_json},
    utils::{embedding::EmbeddingProvider, hash::content_hash},
};

/// On-disk layout of one namespace store. Kept columnar so the file stays
/// diffable and tool-friendly.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    hash_ids: Vec<String>,
    texts: Vec<String>,
    embeddings: Vec<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub hash_id: String,
    pub content: String,
    pub embedding: Vec<f64>,
}

/// Namespaced persistent map `hash_id -> (content, vector)` preserving
/// insertion order, with the reverse `content -> hash_id` index.
pub struct EmbeddingStore {
    namespace: String,
    prefix: String,
    path: PathBuf,
    hash_ids: Vec<String>,
    texts: Vec<String>,
    embeddings: Vec<Vec<f64>>,
    id_to_idx: HashMap<String, usize>,
    text_to_id: HashMap<String, String>,
}

impl EmbeddingStore {
    /// Opens (or creates) `vdb_<namespace>.json` under `dir`.
    pub fn open(dir: &Path, namespace: &str, prefix: &str) -> Result<Self, AppError> {
        let path = dir.join(format!("vdb_{namespace}.json"));
        let file: StoreFile = read_json(&path)?.unwrap_or_default();

        if file.hash_ids.len() != file.texts.len()
            || file.hash_ids.len() != file.embeddings.len()
        {
            return Err(AppError::Invariant(format!(
                "store {} has mismatched columns: {} ids, {} texts, {} vectors",
                path.display(),
                file.hash_ids.len(),
                file.texts.len(),
                file.embeddings.len()
            )));
        }

        let mut store = Self {
            namespace: namespace.to_string(),
            prefix: prefix.to_string(),
            path,
            hash_ids: file.hash_ids,
            texts: file.texts,
            embeddings: file.embeddings,
            id_to_idx: HashMap::new(),
            text_to_id: HashMap::new(),
        };
        store.rebuild_indexes();

        debug!(
            namespace = %store.namespace,
            rows = store.hash_ids.len(),
            "opened embedding store"
        );
        Ok(store)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn hash(&self, text: &str) -> String {
        content_hash(text, &self.prefix)
    }

    pub fn len(&self) -> usize {
        self.hash_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hash_ids.is_empty()
    }

    /// Texts whose hash is not stored yet, deduplicated by hash, keyed by the
    /// id they would get.
    pub fn missing(&self, texts: &[String]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for text in texts {
            let id = self.hash(text);
            if self.id_to_idx.contains_key(&id) || !seen.insert(id.clone()) {
                continue;
            }
            out.push((id, text.clone()));
        }
        out
    }

    /// Hashes every text, encodes the truly missing ones in one batch and
    /// appends them in the order the encoder returned. Blank texts are
    /// dropped with a warning; a vector-count mismatch is fatal.
    pub async fn insert(
        &mut self,
        texts: &[String],
        encoder: &EmbeddingProvider,
    ) -> Result<Vec<String>, AppError> {
        let non_blank: Vec<String> = texts
            .iter()
            .filter(|text| !text.trim().is_empty())
            .cloned()
            .collect();
        let dropped = texts.len() - non_blank.len();
        if dropped > 0 {
            warn!(
                namespace = %self.namespace,
                dropped,
                "dropping blank texts before insert"
            );
        }

        let all_ids: Vec<String> = non_blank.iter().map(|text| self.hash(text)).collect();

        let missing = self.missing(&non_blank);
        if missing.is_empty() {
            return Ok(all_ids);
        }

        let missing_texts: Vec<String> =
            missing.iter().map(|(_, text)| text.clone()).collect();
        let vectors = encoder.batch_encode(&missing_texts, None, true).await?;

        if vectors.len() != missing.len() {
            return Err(AppError::Invariant(format!(
                "embedding client returned {} vectors for {} texts in namespace {}",
                vectors.len(),
                missing.len(),
                self.namespace
            )));
        }

        for ((id, text), vector) in missing.into_iter().zip(vectors) {
            self.hash_ids.push(id);
            self.texts.push(text);
            self.embeddings.push(vector);
        }
        self.rebuild_indexes();
        self.save()?;

        Ok(all_ids)
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.hash_ids.clone()
    }

    pub fn all_texts(&self) -> Vec<String> {
        self.texts.clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.id_to_idx.contains_key(id)
    }

    pub fn row(&self, id: &str) -> Option<EmbeddingRow> {
        let idx = *self.id_to_idx.get(id)?;
        Some(EmbeddingRow {
            hash_id: self.hash_ids.get(idx)?.clone(),
            content: self.texts.get(idx)?.clone(),
            embedding: self.embeddings.get(idx)?.clone(),
        })
    }

    /// Rows for `ids`; unknown ids are skipped with a warning.
    pub fn rows(&self, ids: &[String]) -> Vec<EmbeddingRow> {
        ids.iter()
            .filter_map(|id| {
                let row = self.row(id);
                if row.is_none() {
                    warn!(namespace = %self.namespace, %id, "row lookup for unknown id");
                }
                row
            })
            .collect()
    }

    pub fn content(&self, id: &str) -> Option<&str> {
        let idx = *self.id_to_idx.get(id)?;
        self.texts.get(idx).map(String::as_str)
    }

    pub fn embedding(&self, id: &str) -> Option<&[f64]> {
        let idx = *self.id_to_idx.get(id)?;
        self.embeddings.get(idx).map(Vec::as_slice)
    }

    pub fn embeddings(&self, ids: &[String]) -> Vec<Vec<f64>> {
        ids.iter()
            .filter_map(|id| self.embedding(id).map(<[f64]>::to_vec))
            .collect()
    }

    /// Full matrix in insertion order, paired with the ids.
    pub fn matrix(&self) -> (Vec<String>, Vec<Vec<f64>>) {
        (self.hash_ids.clone(), self.embeddings.clone())
    }

    /// Removes rows by id in descending index order, then persists. Unknown
    /// ids are ignored with a warning.
    pub fn delete(&mut self, ids: &[String]) -> Result<(), AppError> {
        let mut indexes: Vec<usize> = Vec::new();
        for id in ids {
            match self.id_to_idx.get(id) {
                Some(idx) => indexes.push(*idx),
                None => {
                    warn!(namespace = %self.namespace, %id, "delete for unknown id");
                }
            }
        }
        if indexes.is_empty() {
            return Ok(());
        }

        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes.dedup();
        for idx in indexes {
            self.hash_ids.remove(idx);
            self.texts.remove(idx);
            self.embeddings.remove(idx);
        }

        self.rebuild_indexes();
        self.save()
    }

    fn rebuild_indexes(&mut self) {
        self.id_to_idx = self
            .hash_ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect();
        // Last writer wins; hashing is content-deterministic so collisions
        // carry identical ids.
        self.text_to_id = self
            .texts
            .iter()
            .zip(&self.hash_ids)
            .map(|(text, id)| (text.clone(), id.clone()))
            .collect();
    }

    fn save(&self) -> Result<(), AppError> {
        let file = StoreFile {
            hash_ids: self.hash_ids.clone(),
            texts: self.texts.clone(),
            embeddings: self.embeddings.clone(),
        };
        atomic_write_json(&self.path, &file)
    }

    pub fn id_for_content(&self, content: &str) -> Option<&str> {
        self.text_to_id.get(content).map(String::as_str)
    }
}
