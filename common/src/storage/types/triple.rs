use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::utils::text::text_processing;

/// Ordered (subject, relation, object) fact. Serialized form is a
/// three-element JSON array, which is also the canonical stringification used
/// for content addressing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Triple([String; 3]);

impl Triple {
    pub fn new(subject: String, relation: String, object: String) -> Self {
        Self([subject, relation, object])
    }

    pub fn subject(&self) -> &str {
        &self.0[0]
    }

    pub fn relation(&self) -> &str {
        &self.0[1]
    }

    pub fn object(&self) -> &str {
        &self.0[2]
    }

    pub fn parts(&self) -> &[String; 3] {
        &self.0
    }

    /// Element-wise canonicalization of the triple.
    pub fn processed(&self) -> Self {
        Self([
            text_processing(&self.0[0]),
            text_processing(&self.0[1]),
            text_processing(&self.0[2]),
        ])
    }

    /// Canonical string form, e.g. `["paris","capital of","france"]`.
    pub fn stringified(&self) -> String {
        json!(self.0).to_string()
    }

    pub fn from_stringified(raw: &str) -> Option<Self> {
        serde_json::from_str::<[String; 3]>(raw).ok().map(Self)
    }
}

impl From<[String; 3]> for Triple {
    fn from(parts: [String; 3]) -> Self {
        Self(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stringified_round_trips() {
        let triple = Triple::new("Paris".into(), "capital of".into(), "France".into());
        let raw = triple.stringified();
        assert_eq!(raw, r#"["Paris","capital of","France"]"#);
        assert_eq!(Triple::from_stringified(&raw), Some(triple));
    }

    #[test]
    fn processed_normalizes_each_element() {
        let triple = Triple::new("Paris!".into(), "Capital Of".into(), " France ".into());
        let processed = triple.processed();
        assert_eq!(processed.subject(), "paris");
        assert_eq!(processed.relation(), "capital of");
        assert_eq!(processed.object(), "france");
    }
}
