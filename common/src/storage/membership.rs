use std::collections::{HashMap, HashSet};

use crate::{
    storage::types::{OpenIeDoc, Triple},
    utils::{
        hash::{entity_id, fact_id},
        text::filter_invalid_triples,
    },
};

/// Which chunks reference which entity / fact ids. Drives deletion soundness
/// and the fact-score weighting at query time.
#[derive(Debug, Default, Clone)]
pub struct MembershipIndex {
    pub entity_to_chunks: HashMap<String, HashSet<String>>,
    pub fact_to_chunks: HashMap<String, HashSet<String>>,
}

impl MembershipIndex {
    pub fn record(&mut self, chunk_id: &str, triple: &Triple) {
        for phrase in [triple.subject(), triple.object()] {
            self.entity_to_chunks
                .entry(entity_id(phrase))
                .or_default()
                .insert(chunk_id.to_string());
        }
        self.fact_to_chunks
            .entry(fact_id(&triple.stringified()))
            .or_default()
            .insert(chunk_id.to_string());
    }

    pub fn chunk_count(&self, entity_key: &str) -> usize {
        self.entity_to_chunks
            .get(entity_key)
            .map_or(0, HashSet::len)
    }
}

/// Rebuilds membership accounting from the persisted extraction log. This is
/// the re-entry path that lets deletion and retrieval work without keeping
/// raw triples in memory.
pub fn membership_from_docs(docs: &[OpenIeDoc]) -> MembershipIndex {
    let mut index = MembershipIndex::default();
    for doc in docs {
        for triple in filter_invalid_triples(&doc.extracted_triples) {
            index.record(&doc.idx, &triple.processed());
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_tracks_fact_and_entity_references() {
        let docs = vec![
            OpenIeDoc {
                idx: "chunk-a".into(),
                passage: String::new(),
                extracted_entities: vec![],
                extracted_triples: vec![vec![
                    "Paris".into(),
                    "capital of".into(),
                    "France".into(),
                ]],
            },
            OpenIeDoc {
                idx: "chunk-b".into(),
                passage: String::new(),
                extracted_entities: vec![],
                extracted_triples: vec![vec!["France".into(), "in".into(), "Europe".into()]],
            },
        ];

        let index = membership_from_docs(&docs);
        assert_eq!(index.chunk_count(&entity_id("france")), 2);
        assert_eq!(index.chunk_count(&entity_id("paris")), 1);
        assert_eq!(index.chunk_count(&entity_id("nowhere")), 0);

        let fact = Triple::new("paris".into(), "capital of".into(), "france".into());
        let fact_key = fact_id(&fact.stringified());
        assert_eq!(index.fact_to_chunks[&fact_key].len(), 1);
    }

    #[test]
    fn malformed_rows_are_ignored() {
        let docs = vec![OpenIeDoc {
            idx: "chunk-a".into(),
            passage: String::new(),
            extracted_entities: vec![],
            extracted_triples: vec![vec!["only".into(), "two".into()]],
        }];
        let index = membership_from_docs(&docs);
        assert!(index.entity_to_chunks.is_empty());
        assert!(index.fact_to_chunks.is_empty());
    }
}
