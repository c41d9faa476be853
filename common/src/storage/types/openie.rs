use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named-entity extraction output for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NerOut {
    pub chunk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub unique_entities: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Triple extraction output for one chunk. Rows are raw extractor output and
/// may be malformed; they are validated before entering the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripleOut {
    pub chunk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub triples: Vec<Vec<String>>,
    #[serde(default)]
    pub metadata: Value,
}

/// One persisted extraction record, keyed by the passage's content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenIeDoc {
    pub idx: String,
    pub passage: String,
    pub extracted_entities: Vec<String>,
    pub extracted_triples: Vec<Vec<String>>,
}
