//! Binary persistence for identity generations.
//!
//! ```text
//! [4B magic "VIDX"] [4B version=1]
//! [4B dim] [4B numRecords]
//! For each record:
//!   [4B len] [username bytes] [4B len] [member id bytes]
//!   [dim x 4B float32 raw embedding]
//! [4B numRoots] [numRoots x 4B root node ids]
//! [4B numNodes]
//! For each node:
//!   [1B tag=0] [4B count] [count x 4B labels]          (leaf)
//!   [1B tag=1] [4B left] [4B right] [dim x 4B normal]  (split)
//! ```
//!
//! All multi-byte values are little-endian. Stored vectors are the raw
//! catalog embeddings; the forest's unit vectors are recomputed on load.

use crate::forest::{AngularForest, Node};
use crate::store::{EmbeddingStore, Generation};
use crate::types::{normalize, Embedding, IdentityRecord, MemberId};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const VIDX_MAGIC: [u8; 4] = *b"VIDX";
const VIDX_VERSION: u32 = 1;
const TAG_LEAF: u8 = 0;
const TAG_SPLIT: u8 = 1;
/// Upper bound on any length prefix, to reject corrupt files before allocating.
const MAX_LEN: u32 = 1 << 28;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid index file: {0}")]
    InvalidFormat(String),
}

/// Serialize a generation.
pub fn save(generation: &Generation, w: &mut dyn Write) -> Result<(), PersistError> {
    let mut bw = BufWriter::new(w);

    bw.write_all(&VIDX_MAGIC)?;
    write_u32(&mut bw, VIDX_VERSION)?;
    write_u32(&mut bw, generation.dim as u32)?;

    let records = generation.store.records();
    write_u32(&mut bw, records.len() as u32)?;
    for record in records {
        write_str(&mut bw, &record.username)?;
        write_str(&mut bw, record.member_id.as_str())?;
        for &v in &record.embedding.values {
            bw.write_all(&v.to_le_bytes())?;
        }
    }

    let (roots, nodes): (&[u32], &[Node]) = match &generation.forest {
        Some(forest) => (forest.roots.as_slice(), forest.nodes.as_slice()),
        None => (&[], &[]),
    };

    write_u32(&mut bw, roots.len() as u32)?;
    for &root in roots {
        write_u32(&mut bw, root)?;
    }

    write_u32(&mut bw, nodes.len() as u32)?;
    for node in nodes {
        match node {
            Node::Leaf(items) => {
                bw.write_all(&[TAG_LEAF])?;
                write_u32(&mut bw, items.len() as u32)?;
                for &item in items {
                    write_u32(&mut bw, item)?;
                }
            }
            Node::Split { normal, left, right } => {
                bw.write_all(&[TAG_SPLIT])?;
                write_u32(&mut bw, *left)?;
                write_u32(&mut bw, *right)?;
                for &v in normal {
                    bw.write_all(&v.to_le_bytes())?;
                }
            }
        }
    }

    bw.flush()?;
    Ok(())
}

/// Deserialize a generation, validating every cross-reference.
pub fn load(r: &mut dyn Read) -> Result<Generation, PersistError> {
    let mut br = BufReader::new(r);

    let mut magic = [0u8; 4];
    br.read_exact(&mut magic)?;
    if magic != VIDX_MAGIC {
        return Err(PersistError::InvalidFormat(format!("bad magic {magic:?}")));
    }
    let version = read_u32(&mut br)?;
    if version != VIDX_VERSION {
        return Err(PersistError::InvalidFormat(format!("unsupported version {version}")));
    }

    let dim = read_len(&mut br)? as usize;
    if dim == 0 {
        return Err(PersistError::InvalidFormat("zero dimension".into()));
    }

    let n_records = read_len(&mut br)?;
    let mut records = Vec::with_capacity((n_records as usize).min(4096));
    for label in 0..n_records {
        let username = read_str(&mut br)?;
        let member_id = MemberId(read_str(&mut br)?);
        let values = read_f32s(&mut br, dim)?;
        records.push(IdentityRecord {
            label,
            username,
            member_id,
            embedding: Embedding::new(values),
        });
    }

    let n_roots = read_len(&mut br)?;
    let mut roots = Vec::with_capacity((n_roots as usize).min(4096));
    for _ in 0..n_roots {
        roots.push(read_u32(&mut br)?);
    }

    let n_nodes = read_len(&mut br)?;
    let mut nodes = Vec::with_capacity((n_nodes as usize).min(4096));
    for _ in 0..n_nodes {
        let mut tag = [0u8; 1];
        br.read_exact(&mut tag)?;
        match tag[0] {
            TAG_LEAF => {
                let count = read_len(&mut br)?;
                let mut items = Vec::with_capacity((count as usize).min(4096));
                for _ in 0..count {
                    let item = read_u32(&mut br)?;
                    if item >= n_records {
                        return Err(PersistError::InvalidFormat(format!("leaf label {item} out of range")));
                    }
                    items.push(item);
                }
                nodes.push(Node::Leaf(items));
            }
            TAG_SPLIT => {
                let left = read_u32(&mut br)?;
                let right = read_u32(&mut br)?;
                // Children are always written before their parent.
                let index = nodes.len() as u32;
                if left >= index || right >= index {
                    return Err(PersistError::InvalidFormat(format!("split node {index} has invalid child")));
                }
                let normal = read_f32s(&mut br, dim)?;
                nodes.push(Node::Split { normal, left, right });
            }
            other => {
                return Err(PersistError::InvalidFormat(format!("unknown node tag {other}")));
            }
        }
    }

    if roots.iter().any(|&r| r >= n_nodes) {
        return Err(PersistError::InvalidFormat("root out of range".into()));
    }

    let forest = if records.is_empty() {
        None
    } else {
        if roots.is_empty() {
            return Err(PersistError::InvalidFormat("records without trees".into()));
        }
        Some(AngularForest {
            dim,
            vectors: records.iter().map(|r| normalize(&r.embedding.values)).collect(),
            nodes,
            roots,
        })
    };

    Ok(Generation {
        dim,
        forest,
        store: EmbeddingStore::from_records(records),
    })
}

/// Write a generation to `path` via a sibling temp file and rename.
pub fn save_to_path(generation: &Generation, path: &Path) -> Result<(), PersistError> {
    let tmp = path.with_extension("vidx.tmp");
    {
        let mut file = File::create(&tmp)?;
        save(generation, &mut file)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    tracing::info!(path = %path.display(), records = generation.len(), "identity index saved");
    Ok(())
}

pub fn load_from_path(path: &Path) -> Result<Generation, PersistError> {
    let mut file = File::open(path)?;
    let generation = load(&mut file)?;
    tracing::info!(path = %path.display(), records = generation.len(), "identity index loaded");
    Ok(generation)
}

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_str(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_u32(r: &mut impl Read) -> Result<u32, PersistError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_len(r: &mut impl Read) -> Result<u32, PersistError> {
    let n = read_u32(r)?;
    if n > MAX_LEN {
        return Err(PersistError::InvalidFormat(format!("length {n} too large")));
    }
    Ok(n)
}

fn read_str(r: &mut impl Read) -> Result<String, PersistError> {
    let len = read_len(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| PersistError::InvalidFormat(format!("invalid utf-8: {e}")))
}

fn read_f32s(r: &mut impl Read, n: usize) -> Result<Vec<f32>, PersistError> {
    let mut out = Vec::with_capacity(n);
    let mut buf = [0u8; 4];
    for _ in 0..n {
        r.read_exact(&mut buf)?;
        out.push(f32::from_le_bytes(buf));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::forest::ForestConfig;

    fn sample_generation() -> Generation {
        let entries = (0..40)
            .map(|i| {
                let angle = i as f32 * 0.15;
                CatalogEntry::new(&format!("user{}", i % 7), &format!("{}", 100 + i), vec![angle.cos(), angle.sin(), 0.5])
            })
            .collect::<Vec<_>>();
        Generation::build(entries, 3, &ForestConfig { n_trees: 4, leaf_size: 3, seed: 9 })
    }

    #[test]
    fn test_saved_index_answers_like_original() {
        let original = sample_generation();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.vidx");

        save_to_path(&original, &path).unwrap();
        let loaded = load_from_path(&path).unwrap();

        assert_eq!(loaded.len(), original.len());
        assert_eq!(loaded.store().records(), original.store().records());
        let probe = Embedding::new(vec![0.3, 0.9, 0.5]);
        let a = original.query(&probe, 5, None).unwrap();
        let b = loaded.query(&probe, 5, None).unwrap();
        assert_eq!(a, b);
        assert!(!path.with_extension("vidx.tmp").exists());
    }

    #[test]
    fn test_empty_generation_persists() {
        let empty = Generation::build(Vec::new(), 3, &ForestConfig::default());
        let mut buf = Vec::new();
        save(&empty, &mut buf).unwrap();
        let loaded = load(&mut buf.as_slice()).unwrap();
        assert!(loaded.is_empty());
        assert!(loaded.forest().is_none());
        assert_eq!(loaded.dim(), 3);
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let mut data: &[u8] = b"NOPE\x01\x00\x00\x00";
        assert!(matches!(load(&mut data), Err(PersistError::InvalidFormat(_))));
    }

    #[test]
    fn test_load_rejects_truncated_file() {
        let mut buf = Vec::new();
        save(&sample_generation(), &mut buf).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(load(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_load_rejects_out_of_range_leaf() {
        let generation = Generation::build(
            vec![CatalogEntry::new("a", "1", vec![1.0, 0.0])],
            2,
            &ForestConfig { n_trees: 1, ..Default::default() },
        );
        let mut buf = Vec::new();
        save(&generation, &mut buf).unwrap();
        // Single leaf with a single label sits at the very end of the file.
        let n = buf.len();
        buf[n - 4..].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(load(&mut buf.as_slice()), Err(PersistError::InvalidFormat(_))));
    }

    /// One record, one root, and a single split node pointing at itself.
    fn self_referencing_file() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&VIDX_MAGIC);
        write_u32(&mut buf, VIDX_VERSION).unwrap();
        write_u32(&mut buf, 2).unwrap();
        write_u32(&mut buf, 1).unwrap();
        write_str(&mut buf, "a").unwrap();
        write_str(&mut buf, "1").unwrap();
        for v in [1.0f32, 0.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        write_u32(&mut buf, 1).unwrap();
        write_u32(&mut buf, 0).unwrap();
        write_u32(&mut buf, 1).unwrap();
        buf.push(TAG_SPLIT);
        write_u32(&mut buf, 0).unwrap();
        write_u32(&mut buf, 0).unwrap();
        for v in [0.0f32, 1.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    #[test]
    fn test_load_rejects_cyclic_split() {
        let buf = self_referencing_file();
        assert!(matches!(load(&mut buf.as_slice()), Err(PersistError::InvalidFormat(_))));
    }

    #[test]
    fn test_built_forest_loads_with_children_first() {
        let generation = sample_generation();
        let mut buf = Vec::new();
        save(&generation, &mut buf).unwrap();
        let loaded = load(&mut buf.as_slice()).unwrap();
        // Every node the builder emits refers only to earlier nodes.
        for (i, node) in loaded.forest().unwrap().nodes.iter().enumerate() {
            if let Node::Split { left, right, .. } = node {
                assert!((*left as usize) < i && (*right as usize) < i);
            }
        }
    }
}
