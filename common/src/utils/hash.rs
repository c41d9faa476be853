use md5::{Digest, Md5};

pub const CHUNK_PREFIX: &str = "chunk-";
pub const ENTITY_PREFIX: &str = "entity-";
pub const FACT_PREFIX: &str = "fact-";

/// Content-addressed identifier: `prefix` followed by the lowercase hex MD5
/// digest of the UTF-8 bytes of `text`. Deterministic across platforms.
pub fn content_hash(text: &str, prefix: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(prefix.len() + digest.len() * 2);
    out.push_str(prefix);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn chunk_id(text: &str) -> String {
    content_hash(text, CHUNK_PREFIX)
}

pub fn entity_id(processed: &str) -> String {
    content_hash(processed, ENTITY_PREFIX)
}

pub fn fact_id(stringified: &str) -> String {
    content_hash(stringified, FACT_PREFIX)
}
