//! GGUF version-3 writer.
//!
//! Emits the header, metadata sorted by key, tensor metadata sorted by
//! block index, then the aligned tensor-data region. Tensor payloads are
//! written in parallel: the file is pre-sized, and a bounded pool of
//! writer threads seeks to each tensor's computed offset.

use std::fs::OpenOptions;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::kv::{ArrayValue, KvMap, Value, ValueKind};
use super::types::{pad, TensorKind};
use super::GgufError;

const MAGIC_LE: u32 = 0x4655_4747;
const VERSION: u32 = 3;

/// A tensor plus its payload bytes, ready to be written.
#[derive(Debug, Clone)]
pub struct TensorPayload {
    pub name: String,
    pub kind: TensorKind,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

impl TensorPayload {
    fn elements(&self) -> u64 {
        self.shape.iter().product()
    }

    fn size_bytes(&self) -> u64 {
        self.elements() * self.kind.type_size() / self.kind.block_size()
    }

    fn block_index(&self) -> Option<usize> {
        let rest = self.name.strip_prefix("blk.")?;
        let (idx, _) = rest.split_once('.')?;
        idx.parse().ok()
    }
}

fn put_string(w: &mut impl Write, s: &str) -> Result<(), GgufError> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn put_scalar(w: &mut impl Write, value: &Value) -> Result<(), GgufError> {
    match value {
        Value::U8(v) => w.write_all(&[*v])?,
        Value::I8(v) => w.write_all(&[*v as u8])?,
        Value::U16(v) => w.write_all(&v.to_le_bytes())?,
        Value::I16(v) => w.write_all(&v.to_le_bytes())?,
        Value::U32(v) => w.write_all(&v.to_le_bytes())?,
        Value::I32(v) => w.write_all(&v.to_le_bytes())?,
        Value::F32(v) => w.write_all(&v.to_bits().to_le_bytes())?,
        Value::Bool(v) => w.write_all(&[*v as u8])?,
        Value::String(s) => put_string(w, s)?,
        Value::U64(v) => w.write_all(&v.to_le_bytes())?,
        Value::I64(v) => w.write_all(&v.to_le_bytes())?,
        Value::F64(v) => w.write_all(&v.to_bits().to_le_bytes())?,
        Value::Array(_) => {
            return Err(GgufError::UnsupportedArrayElement(ValueKind::Array));
        }
    }
    Ok(())
}

fn put_value(w: &mut impl Write, value: &Value) -> Result<(), GgufError> {
    w.write_all(&(value.kind() as u32).to_le_bytes())?;
    match value {
        Value::Array(arr) => put_array(w, arr),
        scalar => put_scalar(w, scalar),
    }
}

fn put_array(w: &mut impl Write, arr: &ArrayValue) -> Result<(), GgufError> {
    if arr.kind == ValueKind::Array {
        return Err(GgufError::UnsupportedArrayElement(arr.kind));
    }
    w.write_all(&(arr.kind as u32).to_le_bytes())?;
    w.write_all(&(arr.values.len() as u64).to_le_bytes())?;
    for v in &arr.values {
        if v.kind() != arr.kind {
            return Err(GgufError::UnsupportedArrayElement(v.kind()));
        }
        put_scalar(w, v)?;
    }
    Ok(())
}

/// Write a complete container to `path`.
///
/// Keys lacking a recognized prefix are qualified with the architecture
/// before sorting. Tensor payload lengths are validated against the
/// computed sizes; a mismatch aborts before anything touches disk.
pub fn encode(path: &Path, kv: &KvMap, tensors: &[TensorPayload]) -> Result<(), GgufError> {
    for t in tensors {
        let want = t.size_bytes();
        if t.data.len() as u64 != want {
            return Err(GgufError::SizeMismatch {
                name: t.name.clone(),
                got: t.data.len() as u64,
                want,
            });
        }
    }

    // Qualified, key-sorted metadata view.
    let mut entries: Vec<(String, &Value)> = kv
        .iter()
        .map(|(k, v)| (kv.qualify(k), v))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    // Tensor order: repeating blocks first by index, then the rest by name.
    let mut order: Vec<usize> = (0..tensors.len()).collect();
    order.sort_by(|&a, &b| {
        let ka = (tensors[a].block_index().unwrap_or(usize::MAX), &tensors[a].name);
        let kb = (tensors[b].block_index().unwrap_or(usize::MAX), &tensors[b].name);
        ka.cmp(&kb)
    });

    let alignment = kv.alignment();

    // Offsets within the data region, in write order.
    let mut offsets = vec![0u64; tensors.len()];
    let mut cursor = 0u64;
    for &i in &order {
        offsets[i] = cursor;
        let size = tensors[i].size_bytes();
        cursor += size + pad(size, alignment);
    }
    let data_len = cursor;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let mut w = BufWriter::new(file);

    w.write_all(&MAGIC_LE.to_le_bytes())?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&(tensors.len() as u64).to_le_bytes())?;
    w.write_all(&(entries.len() as u64).to_le_bytes())?;

    for (key, value) in &entries {
        put_string(&mut w, key)?;
        put_value(&mut w, value)?;
    }

    for &i in &order {
        let t = &tensors[i];
        put_string(&mut w, &t.name)?;
        w.write_all(&(t.shape.len() as u32).to_le_bytes())?;
        for d in &t.shape {
            w.write_all(&d.to_le_bytes())?;
        }
        w.write_all(&(t.kind as u32).to_le_bytes())?;
        w.write_all(&offsets[i].to_le_bytes())?;
    }

    let here = w.stream_position()?;
    let data_offset = here + pad(here, alignment);
    w.write_all(&vec![0u8; (data_offset - here) as usize])?;
    w.flush()?;

    let file = w.into_inner().map_err(|e| GgufError::Io(e.into_error()))?;
    file.set_len(data_offset + data_len)?;
    drop(file);

    write_payloads(path, tensors, &offsets, data_offset)?;

    debug!(
        tensors = tensors.len(),
        keys = entries.len(),
        data_offset,
        data_len,
        "encoded container"
    );

    Ok(())
}

/// Write tensor payloads in parallel, bounded by the machine's core count.
/// Each worker opens its own handle and seeks to its tensors' offsets.
fn write_payloads(
    path: &Path,
    tensors: &[TensorPayload],
    offsets: &[u64],
    data_offset: u64,
) -> Result<(), GgufError> {
    let workers = num_cpus::get().min(tensors.len().max(1));
    let next = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let next = &next;
            handles.push(scope.spawn(move || -> Result<(), GgufError> {
                let mut file = OpenOptions::new().write(true).open(path)?;
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= tensors.len() {
                        return Ok(());
                    }
                    file.seek(SeekFrom::Start(data_offset + offsets[i]))?;
                    file.write_all(&tensors[i].data)?;
                }
            }));
        }
        for h in handles {
            h.join().expect("writer thread panicked")?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::decode::decode;
    use std::fs::File;

    fn payload(name: &str, kind: TensorKind, shape: Vec<u64>) -> TensorPayload {
        let elements: u64 = shape.iter().product();
        let size = elements * kind.type_size() / kind.block_size();
        TensorPayload {
            name: name.to_string(),
            kind,
            shape,
            data: vec![0xAB; size as usize],
        }
    }

    fn base_kv() -> KvMap {
        let mut kv = KvMap::new();
        kv.insert("general.architecture", Value::String("llama".to_string()));
        kv.insert("llama.block_count", Value::U32(2));
        kv
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");

        let kv = base_kv();
        let tensors = vec![
            payload("output.weight", TensorKind::F16, vec![16, 4]),
            payload("blk.1.attn_q.weight", TensorKind::Q8_0, vec![64, 2]),
            payload("blk.0.attn_q.weight", TensorKind::F32, vec![8]),
        ];

        encode(&path, &kv, &tensors).unwrap();

        let decoded = decode(File::open(&path).unwrap(), -1).unwrap();
        assert_eq!(decoded.kv.architecture(), "llama");
        assert_eq!(decoded.kv.u64_or("block_count", 0), 2);

        // Block tensors first by index, non-block tensors after.
        let names: Vec<&str> = decoded.tensors.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["blk.0.attn_q.weight", "blk.1.attn_q.weight", "output.weight"]
        );

        // Every offset is aligned.
        for t in &decoded.tensors {
            assert_eq!(t.offset % decoded.kv.alignment(), 0, "{}", t.name);
        }
    }

    #[test]
    fn test_payload_size_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.gguf");

        let mut t = payload("blk.0.ffn_up.weight", TensorKind::F32, vec![4]);
        t.data.pop();
        let err = encode(&path, &base_kv(), &[t]).unwrap_err();
        assert!(matches!(err, GgufError::SizeMismatch { .. }));
    }

    #[test]
    fn test_bare_keys_qualified_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.gguf");

        let mut kv = base_kv();
        kv.insert_qualified("context_length", Value::U32(4096));
        encode(&path, &kv, &[]).unwrap();

        let decoded = decode(File::open(&path).unwrap(), -1).unwrap();
        assert_eq!(decoded.kv.u64_or("llama.context_length", 0), 4096);
    }

    #[test]
    fn test_parallel_payloads_land_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("many.gguf");

        let tensors: Vec<TensorPayload> = (0..32)
            .map(|i| {
                let mut p = payload(&format!("blk.{i}.w.weight"), TensorKind::F32, vec![40]);
                p.data = vec![i as u8; p.data.len()];
                p
            })
            .collect();

        encode(&path, &base_kv(), &tensors).unwrap();
        let decoded = decode(File::open(&path).unwrap(), -1).unwrap();

        let raw = std::fs::read(&path).unwrap();
        for t in &decoded.tensors {
            let i: u8 = t.name.split('.').nth(1).unwrap().parse().unwrap();
            let start = (decoded.data_offset + t.offset) as usize;
            let end = start + t.size_bytes() as usize;
            assert!(raw[start..end].iter().all(|&b| b == i), "{}", t.name);
        }
    }
}
