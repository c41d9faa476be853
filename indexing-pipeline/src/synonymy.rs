use tracing::debug;

use common::utils::text::alnum_len;

use crate::edges::EdgeAccumulator;

#[derive(Debug, Clone, Copy)]
pub struct SynonymyParams {
    pub top_k: usize,
    pub threshold: f64,
}

/// Links each entity to its nearest neighbors in embedding space. Vectors are
/// normalized at encode time, so the dot product is the cosine similarity and
/// the search is exact.
///
/// An entity whose processed form has two or fewer alphanumeric characters is
/// too ambiguous to link and is skipped as a query (it can still appear as a
/// neighbor).
pub fn add_synonymy_edges(
    entity_ids: &[String],
    entity_texts: &[String],
    embeddings: &[Vec<f64>],
    params: SynonymyParams,
    acc: &mut EdgeAccumulator,
) {
    if params.top_k == 0 {
        return;
    }
    let mut added = 0usize;

    for (i, query_id) in entity_ids.iter().enumerate() {
        let Some(query_text) = entity_texts.get(i) else {
            continue;
        };
        if alnum_len(query_text) <= 2 {
            continue;
        }
        let Some(query_vec) = embeddings.get(i) else {
            continue;
        };

        let mut neighbors: Vec<(usize, f64)> = Vec::new();
        for (j, candidate_vec) in embeddings.iter().enumerate() {
            if i == j {
                continue;
            }
            let similarity = dot(query_vec, candidate_vec);
            if similarity >= params.threshold {
                neighbors.push((j, similarity));
            }
        }

        neighbors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (j, similarity) in neighbors.into_iter().take(params.top_k) {
            let Some(neighbor_text) = entity_texts.get(j) else {
                continue;
            };
            if neighbor_text.is_empty() {
                continue;
            }
            let Some(neighbor_id) = entity_ids.get(j) else {
                continue;
            };
            acc.set(query_id.clone(), neighbor_id.clone(), similarity);
            added += 1;
        }
    }

    debug!(edges = added, "synonymy linking complete");
}

/// Plain dot product; inputs are unit vectors.
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
