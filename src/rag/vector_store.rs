use std::io::Write;
use std::path::{Path, PathBuf};

use hnsw_rs::hnsw::{Hnsw, Neighbour};
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};
use crate::indexer::Segment;

const FORMAT_VERSION: u32 = 2;
/// Header line, then the entries. Replaced as a whole on every persist.
const INDEX_FILE: &str = "vectors.idx";

// HNSW graph parameters
const MAX_NB_CONNECTION: usize = 16;
const EF_CONSTRUCTION: usize = 200;
const MIN_EF_SEARCH: usize = 64;
const MIN_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub segment: Segment,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSegment {
    pub segment: Segment,
    pub score: f32,
}

/// Nearest-neighbour store over embedded segments.
///
/// All entries of one index share a single embedding space: the first insert
/// fixes `model_id` and `dimension`, and later inserts or merges from another
/// space are rejected with `SchemaMismatch` without modifying the index.
pub trait VectorIndex: Send + Sync {
    fn model_id(&self) -> Option<&str>;

    fn dimension(&self) -> Option<usize>;

    fn entries(&self) -> &[IndexEntry];

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, model_id: &str, entries: Vec<IndexEntry>) -> Result<()>;

    /// Appends every entry of `other`.
    fn merge(&mut self, other: &dyn VectorIndex) -> Result<()> {
        match other.model_id() {
            Some(model_id) => self.insert(model_id, other.entries().to_vec()),
            None => Ok(()),
        }
    }

    /// The `k` entries most similar to `query`, best first.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredSegment>>;

    fn persist(&self, dir: &Path) -> Result<()>;

    /// Independent copy; changes to it never reach `self`.
    fn snapshot(&self) -> Box<dyn VectorIndex>;
}

/// Approximate nearest-neighbour index backed by an HNSW graph.
///
/// `entries` is the source of truth and is what gets persisted; the graph is
/// rebuilt from it on load and on snapshot. Graph ids are entry positions.
pub struct HnswIndex {
    model_id: Option<String>,
    dimension: Option<usize>,
    entries: Vec<IndexEntry>,
    graph: Option<Hnsw<'static, f32, DistCosine>>,
    capacity: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexHeader {
    format_version: u32,
    model_id: Option<String>,
    dimension: Option<usize>,
    count: usize,
    checksum: String,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("model_id", &self.model_id)
            .field("dimension", &self.dimension)
            .field("entries", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Default for HnswIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl HnswIndex {
    pub fn new() -> Self {
        Self {
            model_id: None,
            dimension: None,
            entries: Vec::new(),
            graph: None,
            capacity: 0,
        }
    }

    fn from_parts(
        model_id: Option<String>,
        dimension: Option<usize>,
        entries: Vec<IndexEntry>,
    ) -> Self {
        let mut index = Self {
            model_id,
            dimension,
            entries,
            graph: None,
            capacity: 0,
        };
        index.rebuild_graph();
        index
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(INDEX_FILE).is_file()
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let load_err = |message: String| RagError::IndexLoad {
            path: dir.display().to_string(),
            message,
        };

        let raw = std::fs::read(dir.join(INDEX_FILE))
            .map_err(|e| load_err(format!("cannot read {}: {}", INDEX_FILE, e)))?;
        let split = raw
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| load_err("missing header".to_string()))?;
        let (header_raw, entries_raw) = (&raw[..split], &raw[split + 1..]);

        let header: IndexHeader = serde_json::from_slice(header_raw)
            .map_err(|e| load_err(format!("corrupt header: {}", e)))?;
        if header.format_version != FORMAT_VERSION {
            return Err(load_err(format!(
                "unsupported format version {}",
                header.format_version
            )));
        }
        if checksum(entries_raw) != header.checksum {
            return Err(load_err("checksum mismatch".to_string()));
        }
        let entries: Vec<IndexEntry> = serde_json::from_slice(entries_raw)
            .map_err(|e| load_err(format!("corrupt entries: {}", e)))?;

        if entries.len() != header.count {
            return Err(load_err(format!(
                "expected {} entries, found {}",
                header.count,
                entries.len()
            )));
        }
        if let Some(dimension) = header.dimension {
            if entries.iter().any(|e| e.embedding.len() != dimension) {
                return Err(load_err("entry dimension differs from index".to_string()));
            }
        }

        tracing::info!(path = %dir.display(), entries = entries.len(), "vector index loaded");
        Ok(Self::from_parts(header.model_id, header.dimension, entries))
    }

    fn check_space(&self, model_id: &str, dimension: usize) -> Result<()> {
        if let Some(expected) = self.dimension {
            if expected != dimension {
                return Err(RagError::SchemaMismatch {
                    expected: format!("dimension {}", expected),
                    found: format!("dimension {}", dimension),
                });
            }
        }
        if let Some(expected) = self.model_id.as_deref() {
            if expected != model_id {
                return Err(RagError::SchemaMismatch {
                    expected: format!("model {}", expected),
                    found: format!("model {}", model_id),
                });
            }
        }
        Ok(())
    }

    fn rebuild_graph(&mut self) {
        if self.entries.is_empty() {
            self.graph = None;
            self.capacity = 0;
            return;
        }
        let capacity = (self.entries.len() * 2).max(MIN_CAPACITY);
        let max_layer = ((capacity as f32).log2().ceil() as usize).clamp(4, 16);
        let mut graph: Hnsw<f32, DistCosine> = Hnsw::new(
            MAX_NB_CONNECTION,
            capacity,
            max_layer,
            EF_CONSTRUCTION,
            DistCosine,
        );
        for (id, entry) in self.entries.iter().enumerate() {
            let point = normalize_vector(&entry.embedding);
            graph.insert((&point, id));
        }
        graph.set_searching_mode(true);

        self.graph = Some(graph);
        self.capacity = capacity;
    }

    /// Adds the entries from position `first` on to the graph, rebuilding it
    /// when they would not fit.
    fn index_new_entries(&mut self, first: usize) {
        match self.graph.as_mut() {
            Some(graph) if self.entries.len() <= self.capacity => {
                graph.set_searching_mode(false);
                for (id, entry) in self.entries.iter().enumerate().skip(first) {
                    let point = normalize_vector(&entry.embedding);
                    graph.insert((&point, id));
                }
                graph.set_searching_mode(true);
            }
            _ => self.rebuild_graph(),
        }
    }
}

impl VectorIndex for HnswIndex {
    fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    fn insert(&mut self, model_id: &str, entries: Vec<IndexEntry>) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let dimension = first.embedding.len();
        if dimension == 0 {
            return Err(RagError::SchemaMismatch {
                expected: "non-empty embedding".to_string(),
                found: "dimension 0".to_string(),
            });
        }
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dimension) {
            return Err(RagError::SchemaMismatch {
                expected: format!("dimension {}", dimension),
                found: format!("dimension {}", bad.embedding.len()),
            });
        }
        if entries
            .iter()
            .any(|e| e.embedding.iter().any(|v| !v.is_finite()))
        {
            return Err(RagError::SchemaMismatch {
                expected: "finite embedding values".to_string(),
                found: "NaN or infinity".to_string(),
            });
        }
        self.check_space(model_id, dimension)?;

        self.model_id.get_or_insert_with(|| model_id.to_string());
        self.dimension.get_or_insert(dimension);
        let first_new = self.entries.len();
        self.entries.extend(entries);
        self.index_new_entries(first_new);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredSegment>> {
        let Some(graph) = self.graph.as_ref() else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        if let Some(dimension) = self.dimension {
            if query.len() != dimension {
                return Err(RagError::SchemaMismatch {
                    expected: format!("dimension {}", dimension),
                    found: format!("dimension {}", query.len()),
                });
            }
        }

        let k = k.min(self.entries.len());
        let ef_search = (k * 2).max(MIN_EF_SEARCH);
        let normalized_query = normalize_vector(query);
        let neighbours: Vec<Neighbour> = graph.search(&normalized_query, k, ef_search);

        let mut scored: Vec<(usize, f32)> = neighbours
            .into_iter()
            .filter(|n| n.d_id < self.entries.len())
            .map(|n| (n.d_id, 1.0 - n.distance))
            .collect();
        // Ties resolve to insertion order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| ScoredSegment {
                segment: self.entries[i].segment.clone(),
                score,
            })
            .collect())
    }

    fn persist(&self, dir: &Path) -> Result<()> {
        let persist_err = |message: String| RagError::IndexPersist {
            path: dir.display().to_string(),
            message,
        };

        std::fs::create_dir_all(dir)
            .map_err(|e| persist_err(format!("cannot create directory: {}", e)))?;

        let entries_raw =
            serde_json::to_vec(&self.entries).map_err(|e| persist_err(e.to_string()))?;
        let header = IndexHeader {
            format_version: FORMAT_VERSION,
            model_id: self.model_id.clone(),
            dimension: self.dimension,
            count: self.entries.len(),
            checksum: checksum(&entries_raw),
        };
        let header_raw = serde_json::to_vec(&header).map_err(|e| persist_err(e.to_string()))?;

        let parts = [header_raw.as_slice(), b"\n".as_slice(), entries_raw.as_slice()];
        write_replace(&dir.join(INDEX_FILE), &parts)
            .map_err(|e| persist_err(format!("cannot write {}: {}", INDEX_FILE, e)))?;

        tracing::info!(path = %dir.display(), entries = self.entries.len(), "vector index persisted");
        Ok(())
    }

    fn snapshot(&self) -> Box<dyn VectorIndex> {
        Box::new(Self::from_parts(
            self.model_id.clone(),
            self.dimension,
            self.entries.clone(),
        ))
    }
}

/// Writes through a temporary sibling and renames it over `path`, so the
/// file is either the old or the new version, never a mix.
fn write_replace(path: &Path, parts: &[&[u8]]) -> std::io::Result<()> {
    let mut tmp = PathBuf::from(path);
    tmp.set_extension("idx.tmp");

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        for part in parts {
            file.write_all(part)?;
        }
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Unit length, so cosine distance stays in range. Zero vectors pass through.
fn normalize_vector(vector: &[f32]) -> Vec<f32> {
    let magnitude: f32 = vector.iter().map(|&x| x * x).sum::<f32>().sqrt();
    if magnitude == 0.0 || !magnitude.is_finite() {
        return vector.to_vec();
    }
    vector.iter().map(|&x| x / magnitude).collect()
}
