//! Append-only flat vector index.
//!
//! Vectors are L2-normalized on insert, so the inner product of two stored
//! vectors is their cosine similarity. Slots are assigned in append order
//! and never reused; deleting a document leaves its slots in place and the
//! mapping store simply stops referring to them.
//!
//! The on-disk artifact is a single binary file:
//!
//! ```text
//! magic    4 bytes   "KBVX"
//! version  u32 LE    currently 1
//! dims     u32 LE
//! count    u64 LE
//! payload  count × dims × f32 LE
//! ```

use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"KBVX";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct VectorIndex {
    dims: usize,
    data: Vec<f32>,
}

impl VectorIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Number of stored vectors.
    pub fn len(&self) -> u64 {
        if self.dims == 0 {
            0
        } else {
            (self.data.len() / self.dims) as u64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends a batch of vectors, normalizing each.
    ///
    /// Every vector's length is checked before anything is written, so a
    /// mismatch mid-batch cannot leave a partial append behind.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        for v in vectors {
            if v.len() != self.dims {
                return Err(Error::DimensionMismatch {
                    expected: self.dims,
                    got: v.len(),
                });
            }
        }
        for v in vectors {
            let mut normalized = v.clone();
            l2_normalize(&mut normalized);
            self.data.extend_from_slice(&normalized);
        }
        Ok(())
    }

    /// Top-`k` slots by inner product against the (normalized) query,
    /// descending. `k` is capped to the index length. Ties break on slot
    /// order, so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.dims {
            return Err(Error::DimensionMismatch {
                expected: self.dims,
                got: query.len(),
            });
        }

        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let mut scored: Vec<(u64, f32)> = self
            .data
            .chunks_exact(self.dims)
            .enumerate()
            .map(|(slot, v)| {
                let dot: f32 = v.iter().zip(q.iter()).map(|(a, b)| a * b).sum();
                (slot as u64, dot)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k.min(scored.len()));
        Ok(scored)
    }

    /// Copy of the stored (normalized) vector at `slot`.
    pub fn reconstruct(&self, slot: u64) -> Option<Vec<f32>> {
        let start = (slot as usize).checked_mul(self.dims)?;
        let end = start.checked_add(self.dims)?;
        if end > self.data.len() || self.dims == 0 {
            return None;
        }
        Some(self.data[start..end].to_vec())
    }

    // ============ Persistence ============

    /// Writes the artifact atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::index_io(path, e.to_string()))?;
        }

        let mut bytes = Vec::with_capacity(20 + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&self.len().to_le_bytes());
        for v in &self.data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let tmp = path.with_extension("bin.tmp");
        let mut file =
            std::fs::File::create(&tmp).map_err(|e| Error::index_io(&tmp, e.to_string()))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::index_io(&tmp, e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::index_io(path, e.to_string()))?;
        Ok(())
    }

    /// Loads and validates an artifact. Any structural problem (bad magic,
    /// unknown version, truncated payload) is reported as corruption rather
    /// than silently producing a short index.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::index_io(path, e.to_string()))?;

        if bytes.len() < 20 {
            return Err(Error::index_io(path, "artifact too short for header"));
        }
        if &bytes[0..4] != MAGIC {
            return Err(Error::index_io(path, "bad magic"));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(Error::index_io(
                path,
                format!("unsupported format version {}", version),
            ));
        }
        let dims = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let count = u64::from_le_bytes(bytes[12..20].try_into().unwrap());

        let expected_payload = (count as usize)
            .checked_mul(dims)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| Error::index_io(path, "header overflow"))?;
        let payload = &bytes[20..];
        if payload.len() != expected_payload {
            return Err(Error::index_io(
                path,
                format!(
                    "payload is {} bytes, header promises {}",
                    payload.len(),
                    expected_payload
                ),
            ));
        }

        let data: Vec<f32> = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self { dims, data })
    }
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
