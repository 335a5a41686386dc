//! Self-describing byte-buffer serialization for the HNSW index.
//!
//! # Format (all integers little-endian)
//!
//! ```text
//! [Magic: "SHNW" 4 bytes]
//! [Version: u32 = 1]
//! [Dimension: u32]
//! [Metric: u8] [Quantized: u8]
//! [M: u32] [ef_construction: u32] [ef_search: u32] [rerank_multiplier: u32]
//! [Entry present: u8]
//!   if present: [id_len: u32][id bytes][level: u32]
//! [Node count: u32]
//! per node, in ordinal order:
//!   [id_len: u32][id bytes][level: u32]
//!   for each layer 0..=level: [neighbor_count: u32][neighbor ordinals: u32 × count]
//! vector storage:
//!   float mode:     per node D × f32
//!   quantized mode: per node D × i8, then N × f32 scales, then
//!                   N × f32 zero_points, then per node D × f32 originals
//! ```
//!
//! Neighbor references are ordinals into the node table, so the buffer is
//! closed under itself: vacated arena slots are compacted away on encode
//! and re-expanded densely on decode.

use super::graph::HnswInner;
use super::layer::{Layer, NodeId};
use super::params::HnswParams;
use super::vectors::VectorStore;
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use rustc_hash::FxHashMap;

const MAGIC: &[u8; 4] = b"SHNW";
const VERSION: u32 = 1;

fn metric_tag(metric: DistanceMetric) -> u8 {
    match metric {
        DistanceMetric::Cosine => 0,
        DistanceMetric::Euclidean => 1,
        DistanceMetric::Dot => 2,
    }
}

fn metric_from_tag(tag: u8) -> Result<DistanceMetric> {
    match tag {
        0 => Ok(DistanceMetric::Cosine),
        1 => Ok(DistanceMetric::Euclidean),
        2 => Ok(DistanceMetric::Dot),
        other => Err(Error::Corrupted(format!("unknown metric tag {other}"))),
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(super) fn encode(inner: &HnswInner) -> Result<Vec<u8>> {
    // Live slots in ascending order become ordinals 0..N.
    let mut live: Vec<NodeId> = inner.id_to_slot.values().copied().collect();
    live.sort_unstable();
    let ordinal_of: FxHashMap<NodeId, u32> = live
        .iter()
        .enumerate()
        .map(|(ordinal, &slot)| (slot, ordinal as u32))
        .collect();

    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(inner.dimension as u32).to_le_bytes());
    buf.push(metric_tag(inner.metric));
    buf.push(u8::from(inner.vectors.is_quantized()));
    buf.extend_from_slice(&(inner.params.m as u32).to_le_bytes());
    buf.extend_from_slice(&(inner.params.ef_construction as u32).to_le_bytes());
    buf.extend_from_slice(&(inner.params.ef_search as u32).to_le_bytes());
    buf.extend_from_slice(&(inner.params.rerank_multiplier as u32).to_le_bytes());

    match inner.entry_point {
        Some(slot) => {
            let id = inner.ids[slot]
                .as_ref()
                .ok_or_else(|| Error::Internal("entry point has no id".into()))?;
            buf.push(1);
            buf.extend_from_slice(&(id.len() as u32).to_le_bytes());
            buf.extend_from_slice(id.as_bytes());
            buf.extend_from_slice(&(inner.levels[slot] as u32).to_le_bytes());
        }
        None => buf.push(0),
    }

    buf.extend_from_slice(&(live.len() as u32).to_le_bytes());
    for &slot in &live {
        let id = inner.ids[slot]
            .as_ref()
            .ok_or_else(|| Error::Internal("live slot has no id".into()))?;
        buf.extend_from_slice(&(id.len() as u32).to_le_bytes());
        buf.extend_from_slice(id.as_bytes());
        let level = inner.levels[slot];
        buf.extend_from_slice(&(level as u32).to_le_bytes());

        for layer in 0..=level {
            let neighbors = inner.layers[layer].neighbors(slot);
            buf.extend_from_slice(&(neighbors.len() as u32).to_le_bytes());
            for &neighbor in neighbors {
                let ordinal = ordinal_of.get(&neighbor).ok_or_else(|| {
                    Error::Internal(format!("dangling neighbor reference to slot {neighbor}"))
                })?;
                buf.extend_from_slice(&ordinal.to_le_bytes());
            }
        }
    }

    match &inner.vectors {
        VectorStore::Float { .. } => {
            for &slot in &live {
                for &value in inner.vectors.float(slot) {
                    buf.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
        VectorStore::Quantized {
            codes,
            scales,
            zero_points,
            originals,
        } => {
            for &slot in &live {
                buf.extend_from_slice(&codes[slot].iter().map(|&c| c as u8).collect::<Vec<u8>>());
            }
            for &slot in &live {
                buf.extend_from_slice(&scales[slot].to_le_bytes());
            }
            for &slot in &live {
                buf.extend_from_slice(&zero_points[slot].to_le_bytes());
            }
            for &slot in &live {
                for &value in &originals[slot] {
                    buf.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
    }

    Ok(buf)
}

pub(super) fn decode(bytes: &[u8]) -> Result<HnswInner> {
    let mut reader = Reader::new(bytes);

    if reader.take(4)? != MAGIC {
        return Err(Error::Corrupted("bad index magic".into()));
    }
    let version = reader.u32()?;
    if version != VERSION {
        return Err(Error::Corrupted(format!(
            "unsupported index version {version}"
        )));
    }

    let dimension = reader.u32()? as usize;
    let metric = metric_from_tag(reader.u8()?)?;
    let quantized = reader.u8()? != 0;
    let params = HnswParams {
        m: reader.u32()? as usize,
        ef_construction: reader.u32()? as usize,
        ef_search: reader.u32()? as usize,
        rerank_multiplier: reader.u32()? as usize,
    };

    let entry = if reader.u8()? == 1 {
        let id = reader.string()?;
        let level = reader.u32()? as usize;
        Some((id, level))
    } else {
        None
    };

    let node_count = reader.u32()? as usize;
    let mut ids = Vec::with_capacity(node_count);
    let mut levels = Vec::with_capacity(node_count);
    let mut adjacency: Vec<Vec<Vec<NodeId>>> = Vec::with_capacity(node_count);
    let mut max_level = 0usize;

    for _ in 0..node_count {
        let id = reader.string()?;
        let level = reader.u32()? as usize;
        max_level = max_level.max(level);

        let mut per_layer = Vec::with_capacity(level + 1);
        for _ in 0..=level {
            let count = reader.u32()? as usize;
            let mut neighbors = Vec::with_capacity(count);
            for _ in 0..count {
                let ordinal = reader.u32()? as usize;
                if ordinal >= node_count {
                    return Err(Error::Corrupted(format!(
                        "neighbor ordinal {ordinal} out of range"
                    )));
                }
                neighbors.push(ordinal);
            }
            per_layer.push(neighbors);
        }

        ids.push(Some(id));
        levels.push(level);
        adjacency.push(per_layer);
    }

    let mut vectors = VectorStore::new(quantized);
    if quantized {
        let mut codes: Vec<Vec<i8>> = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let raw = reader.take(dimension)?;
            codes.push(raw.iter().map(|&b| b as i8).collect());
        }
        let mut scales = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            scales.push(reader.f32()?);
        }
        let mut zero_points = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            zero_points.push(reader.f32()?);
        }
        let mut originals = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let mut v = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                v.push(reader.f32()?);
            }
            originals.push(v);
        }
        vectors = VectorStore::Quantized {
            codes,
            scales,
            zero_points,
            originals,
        };
    } else {
        for slot in 0..node_count {
            let mut v = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                v.push(reader.f32()?);
            }
            vectors.put(slot, v);
        }
    }

    if !reader.is_empty() {
        return Err(Error::Corrupted("trailing bytes after index buffer".into()));
    }

    let mut layers: Vec<Layer> = (0..=max_level).map(|_| Layer::new(node_count)).collect();
    for (slot, per_layer) in adjacency.into_iter().enumerate() {
        for (layer_idx, neighbors) in per_layer.into_iter().enumerate() {
            layers[layer_idx].set_neighbors(slot, neighbors);
        }
    }

    let id_to_slot: FxHashMap<String, NodeId> = ids
        .iter()
        .enumerate()
        .filter_map(|(slot, id)| id.as_ref().map(|id| (id.clone(), slot)))
        .collect();

    let entry_point = match entry {
        Some((id, level)) => {
            let slot = *id_to_slot
                .get(&id)
                .ok_or_else(|| Error::Corrupted(format!("entry point '{id}' not in node table")))?;
            if levels[slot] != level {
                return Err(Error::Corrupted("entry point level mismatch".into()));
            }
            Some(slot)
        }
        None => None,
    };

    Ok(HnswInner {
        dimension,
        metric,
        params,
        vectors,
        layers,
        levels,
        ids,
        id_to_slot,
        free_slots: Vec::new(),
        entry_point,
        rng_state: 0x5DEE_CE66_D1A4_B5B5,
    })
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| Error::Corrupted("index buffer truncated".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn f32(&mut self) -> Result<f32> {
        let raw = self.take(4)?;
        Ok(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Corrupted("non-UTF8 id in index buffer".into()))
    }
}
