use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    error::AppError,
    storage::persist::{atomic_write_json, read_json},
};

/// Iteration cap for the PageRank solve.
const PPR_MAX_ITERATIONS: usize = 100;
/// L1 convergence threshold between successive score vectors.
const PPR_TOLERANCE: f64 = 1e-6;

/// Vertex attribute set. The closed fields cover everything the engine reads;
/// `extra` keeps unknown keys from older files intact across a save cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexAttrs {
    pub name: String,
    pub hash_id: String,
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VertexAttrs {
    pub fn new(hash_id: impl Into<String>, content: impl Into<String>) -> Self {
        let hash_id = hash_id.into();
        Self {
            name: hash_id.clone(),
            hash_id,
            content: content.into(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: usize,
    pub target: usize,
    pub weight: f64,
}

/// On-disk shape of `graph.json`.
#[derive(Debug, Serialize, Deserialize)]
struct GraphFile {
    directed: bool,
    vertices: Vec<VertexAttrs>,
    edges: Vec<Edge>,
}

/// Arena property graph over integer vertex indices with a secondary
/// `name -> idx` index. Cyclic structure is held as ids, never references.
#[derive(Debug, Clone)]
pub struct SimpleGraph {
    directed: bool,
    vertices: Vec<VertexAttrs>,
    edges: Vec<Edge>,
    name_to_idx: HashMap<String, usize>,
}

impl SimpleGraph {
    pub fn new(directed: bool) -> Self {
        Self {
            directed,
            vertices: Vec::new(),
            edges: Vec::new(),
            name_to_idx: HashMap::new(),
        }
    }

    pub fn is_directed(&self) -> bool {
        self.directed
    }

    pub fn vcount(&self) -> usize {
        self.vertices.len()
    }

    pub fn ecount(&self) -> usize {
        self.edges.len()
    }

    pub fn vertex_names(&self) -> Vec<String> {
        self.vertices.iter().map(|v| v.name.clone()).collect()
    }

    pub fn vertex_name_set(&self) -> HashSet<String> {
        self.vertices.iter().map(|v| v.name.clone()).collect()
    }

    pub fn vertex_index(&self, name: &str) -> Option<usize> {
        self.name_to_idx.get(name).copied()
    }

    pub fn vertex(&self, idx: usize) -> Option<&VertexAttrs> {
        self.vertices.get(idx)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Adds vertices. A name that already exists in the graph, or appears
    /// twice in the batch, indicates corrupted bookkeeping upstream and is
    /// fatal.
    pub fn add_vertices(&mut self, batch: Vec<VertexAttrs>) -> Result<(), AppError> {
        let mut batch_names: HashSet<String> = HashSet::new();
        for attrs in &batch {
            if self.name_to_idx.contains_key(&attrs.name) || !batch_names.insert(attrs.name.clone())
            {
                return Err(AppError::Invariant(format!(
                    "duplicate vertex name '{}'",
                    attrs.name
                )));
            }
        }
        for attrs in batch {
            self.name_to_idx.insert(attrs.name.clone(), self.vertices.len());
            self.vertices.push(attrs);
        }
        Ok(())
    }

    /// Adds edges given endpoint names. Pairs referencing unknown names and
    /// self-loops are dropped with a warning; a negative weight is dropped
    /// the same way. `pairs` and `weights` must be parallel.
    pub fn add_edges(
        &mut self,
        pairs: &[(String, String)],
        weights: &[f64],
    ) -> Result<(), AppError> {
        if pairs.len() != weights.len() {
            return Err(AppError::Invariant(format!(
                "{} edge pairs with {} weights",
                pairs.len(),
                weights.len()
            )));
        }

        for ((from, to), weight) in pairs.iter().zip(weights) {
            let (Some(source), Some(target)) =
                (self.vertex_index(from), self.vertex_index(to))
            else {
                warn!(%from, %to, "dropping edge with unknown endpoint");
                continue;
            };
            if source == target {
                warn!(name = %from, "dropping self-loop");
                continue;
            }
            if !weight.is_finite() || *weight < 0.0 {
                warn!(%from, %to, weight = *weight, "dropping edge with invalid weight");
                continue;
            }
            self.edges.push(Edge {
                source,
                target,
                weight: *weight,
            });
        }
        Ok(())
    }

    /// Adds co-occurrence mass: when a record for `(from, to)` already
    /// exists its weight grows by the delta, otherwise a new record is
    /// appended. Unknown endpoints and self-loops are dropped as in
    /// `add_edges`.
    pub fn increment_edge_weights(
        &mut self,
        pairs: &[(String, String)],
        deltas: &[f64],
    ) -> Result<(), AppError> {
        if pairs.len() != deltas.len() {
            return Err(AppError::Invariant(format!(
                "{} edge pairs with {} deltas",
                pairs.len(),
                deltas.len()
            )));
        }

        let mut positions: HashMap<(usize, usize), usize> = self
            .edges
            .iter()
            .enumerate()
            .map(|(pos, edge)| ((edge.source, edge.target), pos))
            .collect();

        for ((from, to), delta) in pairs.iter().zip(deltas) {
            let (Some(source), Some(target)) =
                (self.vertex_index(from), self.vertex_index(to))
            else {
                warn!(%from, %to, "dropping edge with unknown endpoint");
                continue;
            };
            if source == target {
                warn!(name = %from, "dropping self-loop");
                continue;
            }
            if !delta.is_finite() || *delta < 0.0 {
                warn!(%from, %to, delta = *delta, "dropping edge with invalid weight");
                continue;
            }
            match positions.get(&(source, target)) {
                Some(pos) => {
                    if let Some(edge) = self.edges.get_mut(*pos) {
                        edge.weight += delta;
                    }
                }
                None => {
                    positions.insert((source, target), self.edges.len());
                    self.edges.push(Edge {
                        source,
                        target,
                        weight: *delta,
                    });
                }
            }
        }
        Ok(())
    }

    /// Removes the named vertices with all incident edges, compacts the
    /// arena and rebuilds the name index. Unknown names are skipped.
    pub fn delete_vertices(&mut self, names: &[String]) {
        let removing: HashSet<usize> = names
            .iter()
            .filter_map(|name| self.vertex_index(name))
            .collect();
        if removing.is_empty() {
            return;
        }

        let mut remap: Vec<Option<usize>> = vec![None; self.vertices.len()];
        let mut kept = Vec::with_capacity(self.vertices.len() - removing.len());
        for (idx, vertex) in self.vertices.drain(..).enumerate() {
            if !removing.contains(&idx) {
                remap[idx] = Some(kept.len());
                kept.push(vertex);
            }
        }
        self.vertices = kept;

        self.edges.retain_mut(|edge| {
            match (remap[edge.source], remap[edge.target]) {
                (Some(source), Some(target)) => {
                    edge.source = source;
                    edge.target = target;
                    true
                }
                _ => false,
            }
        });

        self.name_to_idx = self
            .vertices
            .iter()
            .enumerate()
            .map(|(idx, vertex)| (vertex.name.clone(), idx))
            .collect();
    }

    /// Personalized PageRank with dangling-mass handling.
    ///
    /// `reset` must have one entry per vertex; NaN and negative entries are
    /// clamped to zero before normalization, and an all-zero reset falls back
    /// to the uniform distribution. Jacobi iteration runs to L1 convergence
    /// below 1e-6 or 100 rounds, whichever comes first.
    pub fn personalized_page_rank(
        &self,
        reset: &[f64],
        damping: f64,
    ) -> Result<Vec<f64>, AppError> {
        let n = self.vertices.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        if reset.len() != n {
            return Err(AppError::Invariant(format!(
                "reset vector length {} does not match vertex count {n}",
                reset.len()
            )));
        }

        let mut r: Vec<f64> = reset
            .iter()
            .map(|v| if v.is_finite() && *v > 0.0 { *v } else { 0.0 })
            .collect();
        let reset_sum: f64 = r.iter().sum();
        if reset_sum > 0.0 {
            for value in &mut r {
                *value /= reset_sum;
            }
        } else {
            r = vec![1.0 / n as f64; n];
        }

        let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        let mut out_weight = vec![0.0f64; n];
        for edge in &self.edges {
            adjacency[edge.source].push((edge.target, edge.weight));
            out_weight[edge.source] += edge.weight;
            if !self.directed {
                adjacency[edge.target].push((edge.source, edge.weight));
                out_weight[edge.target] += edge.weight;
            }
        }

        let mut scores = vec![1.0 / n as f64; n];
        for _ in 0..PPR_MAX_ITERATIONS {
            // Mass sitting on sinks teleports through the reset distribution;
            // without this the scores leak and stop summing to one.
            let dangling: f64 = (0..n)
                .filter(|i| out_weight[*i] == 0.0)
                .map(|i| scores[i])
                .sum();

            let mut next: Vec<f64> = r
                .iter()
                .map(|rj| (1.0 - damping) * rj + damping * dangling * rj)
                .collect();

            for i in 0..n {
                if out_weight[i] > 0.0 {
                    let contribution = damping * scores[i] / out_weight[i];
                    for (j, weight) in &adjacency[i] {
                        next[*j] += contribution * weight;
                    }
                }
            }

            let delta: f64 = next
                .iter()
                .zip(&scores)
                .map(|(a, b)| (a - b).abs())
                .sum();
            scores = next;
            if delta < PPR_TOLERANCE {
                break;
            }
        }

        Ok(scores)
    }

    pub fn save(&self, path: &Path) -> Result<(), AppError> {
        let file = GraphFile {
            directed: self.directed,
            vertices: self.vertices.clone(),
            edges: self.edges.clone(),
        };
        atomic_write_json(path, &file)
    }

    /// Loads a graph, or returns an empty one with the requested direction
    /// when the file does not exist.
    pub fn load(path: &Path, default_directed: bool) -> Result<Self, AppError> {
        let Some(file) = read_json::<GraphFile>(path)? else {
            return Ok(Self::new(default_directed));
        };

        let mut name_to_idx = HashMap::with_capacity(file.vertices.len());
        for (idx, vertex) in file.vertices.iter().enumerate() {
            if name_to_idx.insert(vertex.name.clone(), idx).is_some() {
                return Err(AppError::Invariant(format!(
                    "graph file {} has duplicate vertex name '{}'",
                    path.display(),
                    vertex.name
                )));
            }
        }
        for edge in &file.edges {
            if edge.source >= file.vertices.len() || edge.target >= file.vertices.len() {
                return Err(AppError::Invariant(format!(
                    "graph file {} has edge to missing vertex index",
                    path.display()
                )));
            }
        }

        Ok(Self {
            directed: file.directed,
            vertices: file.vertices,
            edges: file.edges,
            name_to_idx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(name: &str) -> VertexAttrs {
        VertexAttrs::new(name.to_string(), format!("content of {name}"))
    }

    fn two_node_graph() -> SimpleGraph {
        let mut graph = SimpleGraph::new(false);
        graph
            .add_vertices(vec![vertex("a"), vertex("b")])
            .unwrap();
        graph
            .add_edges(&[("a".to_string(), "b".to_string())], &[1.0])
            .unwrap();
        graph
    }

    #[test]
    fn duplicate_vertex_names_are_fatal() {
        let mut graph = SimpleGraph::new(false);
        graph.add_vertices(vec![vertex("a")]).unwrap();
        let err = graph.add_vertices(vec![vertex("a")]).unwrap_err();
        assert!(matches!(err, AppError::Invariant(_)));
    }

    #[test]
    fn unknown_endpoints_and_self_loops_are_dropped() {
        let mut graph = SimpleGraph::new(false);
        graph.add_vertices(vec![vertex("a"), vertex("b")]).unwrap();
        graph
            .add_edges(
                &[
                    ("a".to_string(), "missing".to_string()),
                    ("a".to_string(), "a".to_string()),
                    ("a".to_string(), "b".to_string()),
                ],
                &[1.0, 1.0, 2.0],
            )
            .unwrap();
        assert_eq!(graph.ecount(), 1);
        assert!((graph.edges()[0].weight - 2.0).abs() < 1e-12);
    }

    #[test]
    fn increment_merges_into_existing_records() {
        let mut graph = two_node_graph();
        graph
            .increment_edge_weights(
                &[
                    ("a".to_string(), "b".to_string()),
                    ("b".to_string(), "a".to_string()),
                ],
                &[1.0, 1.0],
            )
            .unwrap();

        assert_eq!(graph.ecount(), 2, "reverse direction is a fresh record");
        assert!((graph.edges()[0].weight - 2.0).abs() < 1e-12);
        assert!((graph.edges()[1].weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn delete_vertices_cascades_to_edges_and_remaps() {
        let mut graph = SimpleGraph::new(false);
        graph
            .add_vertices(vec![vertex("a"), vertex("b"), vertex("c")])
            .unwrap();
        graph
            .add_edges(
                &[
                    ("a".to_string(), "b".to_string()),
                    ("b".to_string(), "c".to_string()),
                ],
                &[1.0, 1.0],
            )
            .unwrap();

        graph.delete_vertices(&["a".to_string()]);

        assert_eq!(graph.vcount(), 2);
        assert_eq!(graph.ecount(), 1);
        let edge = graph.edges()[0];
        assert_eq!(graph.vertex(edge.source).unwrap().name, "b");
        assert_eq!(graph.vertex(edge.target).unwrap().name, "c");
        assert_eq!(graph.vertex_index("b"), Some(0));
    }

    #[test]
    fn save_load_round_trips_vertices_and_edges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");

        let graph = two_node_graph();
        graph.save(&path).unwrap();
        let loaded = SimpleGraph::load(&path, true).unwrap();

        assert!(!loaded.is_directed(), "directedness comes from the file");
        assert_eq!(loaded.vertex_names(), graph.vertex_names());
        assert_eq!(loaded.edges(), graph.edges());
        assert_eq!(
            loaded.vertex(0).unwrap().content,
            graph.vertex(0).unwrap().content
        );
    }

    #[test]
    fn load_tolerates_unknown_vertex_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{"directed":false,
                "vertices":[{"name":"a","hash_id":"a","content":"","legacy_field":42}],
                "edges":[]}"#,
        )
        .unwrap();

        let loaded = SimpleGraph::load(&path, false).unwrap();
        assert_eq!(loaded.vcount(), 1);
        assert_eq!(
            loaded.vertex(0).unwrap().extra.get("legacy_field"),
            Some(&serde_json::json!(42))
        );
    }

    #[test]
    fn ppr_returns_a_probability_vector_with_sinks() {
        // Directed chain a -> b -> c leaves c as a sink.
        let mut graph = SimpleGraph::new(true);
        graph
            .add_vertices(vec![vertex("a"), vertex("b"), vertex("c")])
            .unwrap();
        graph
            .add_edges(
                &[
                    ("a".to_string(), "b".to_string()),
                    ("b".to_string(), "c".to_string()),
                ],
                &[1.0, 1.0],
            )
            .unwrap();

        let scores = graph
            .personalized_page_rank(&[1.0, 0.0, 0.0], 0.5)
            .unwrap();
        let total: f64 = scores.iter().sum();
        assert!(
            (total - 1.0).abs() < 1e-6,
            "dangling handling must conserve mass, got {total}"
        );
        assert!(scores.iter().all(|s| *s >= 0.0));
    }

    #[test]
    fn ppr_seed_propagates_over_an_edge() {
        let graph = two_node_graph();
        let scores = graph.personalized_page_rank(&[1.0, 0.0], 0.5).unwrap();

        // Fixed point of s0 = 0.5 + 0.5*s1, s1 = 0.5*s0.
        assert!((scores[0] - 2.0 / 3.0).abs() < 1e-4, "got {}", scores[0]);
        assert!((scores[1] - 1.0 / 3.0).abs() < 1e-4, "got {}", scores[1]);
        assert!(scores[1] > 0.0, "seed mass must reach the neighbor");
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn ppr_clamps_nan_and_negative_reset_entries() {
        let graph = two_node_graph();
        let scores = graph
            .personalized_page_rank(&[f64::NAN, -3.0], 0.5)
            .unwrap();
        // Everything clamped to zero -> uniform reset.
        let total: f64 = scores.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!((scores[0] - scores[1]).abs() < 1e-6);
    }

    #[test]
    fn ppr_rejects_wrong_reset_length() {
        let graph = two_node_graph();
        let err = graph.personalized_page_rank(&[1.0], 0.5).unwrap_err();
        assert!(matches!(err, AppError::Invariant(_)));
    }
}
