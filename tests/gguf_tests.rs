//! Integration tests for the GGUF codec.

use std::fs::File;
use std::io::Cursor;

use gguf_serve::gguf::{
    decode, encode, pad, ArrayValue, KvMap, TensorKind, TensorPayload, Value, ValueKind,
};

fn payload(name: &str, kind: TensorKind, shape: Vec<u64>) -> TensorPayload {
    let elements: u64 = shape.iter().product();
    let size = (elements * kind.type_size() / kind.block_size()) as usize;
    TensorPayload {
        name: name.to_string(),
        kind,
        shape,
        data: vec![0x5A; size],
    }
}

fn model_kv() -> KvMap {
    let mut kv = KvMap::new();
    kv.insert("general.architecture", Value::String("llama".to_string()));
    kv.insert("llama.block_count", Value::U32(2));
    kv.insert("llama.embedding_length", Value::U32(4096));
    kv.insert("llama.rope.freq_base", Value::F32(10000.0));
    kv.insert("general.alignment", Value::U32(64));
    kv.insert(
        "tokenizer.ggml.tokens",
        Value::Array(ArrayValue {
            kind: ValueKind::String,
            len: 3,
            values: vec![
                Value::String("<s>".to_string()),
                Value::String("</s>".to_string()),
                Value::String("hi".to_string()),
            ],
        }),
    );
    kv
}

#[test]
fn test_roundtrip_across_kinds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kinds.gguf");

    let tensors = vec![
        payload("blk.0.attn_q.weight", TensorKind::Q4_0, vec![256, 8]),
        payload("blk.0.ffn_up.weight", TensorKind::Q6K, vec![512, 2]),
        payload("blk.1.attn_q.weight", TensorKind::F16, vec![64]),
        payload("blk.1.ffn_up.weight", TensorKind::Q8_0, vec![96]),
        payload("output.weight", TensorKind::F32, vec![32, 3]),
        payload("token_embd.weight", TensorKind::BF16, vec![48]),
    ];
    let kv = model_kv();
    encode(&path, &kv, &tensors).unwrap();

    let decoded = decode(File::open(&path).unwrap(), -1).unwrap();
    assert_eq!(decoded.kv.architecture(), "llama");
    assert_eq!(decoded.kv.alignment(), 64);
    assert_eq!(decoded.tensors.len(), tensors.len());

    // Every tensor round-trips name, kind, shape, and computed size.
    for t in &tensors {
        let got = decoded
            .tensors
            .iter()
            .find(|d| d.name == t.name)
            .unwrap_or_else(|| panic!("missing {}", t.name));
        assert_eq!(got.kind, t.kind);
        assert_eq!(got.shape, t.shape);
        assert_eq!(got.size_bytes() as usize, t.data.len());
    }
}

#[test]
fn test_alignment_property() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("align.gguf");

    // Deliberately awkward sizes to force padding between tensors.
    let tensors = vec![
        payload("blk.0.a.weight", TensorKind::I8, vec![7]),
        payload("blk.0.b.weight", TensorKind::I8, vec![13]),
        payload("blk.1.a.weight", TensorKind::I8, vec![3]),
        payload("blk.1.b.weight", TensorKind::I8, vec![61]),
    ];
    encode(&path, &model_kv(), &tensors).unwrap();

    let decoded = decode(File::open(&path).unwrap(), -1).unwrap();
    let align = decoded.kv.alignment();
    assert_eq!(decoded.data_offset % align, 0);
    for t in &decoded.tensors {
        assert_eq!(t.offset % align, 0, "{} at {}", t.name, t.offset);
    }
}

#[test]
fn test_tensor_size_identity() {
    for (kind, elements) in [
        (TensorKind::F32, 128),
        (TensorKind::Q4_0, 4096),
        (TensorKind::Q4K, 2048),
        (TensorKind::MXFP4, 1024),
        (TensorKind::Q8K, 512),
    ] {
        let t = payload("blk.0.t.weight", kind, vec![elements]);
        let expected = elements * kind.type_size() / kind.block_size();
        assert_eq!(t.data.len() as u64, expected, "{kind}");
    }
}

#[test]
fn test_pad_function() {
    for align in [32u64, 64, 128] {
        for offset in 0..512u64 {
            let p = pad(offset, align);
            assert_eq!((offset + p) % align, 0);
            assert!(p < align);
        }
    }
}

#[test]
fn test_adapter_container() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adapter.gguf");

    let mut kv = KvMap::new();
    kv.insert("general.architecture", Value::String("llama".to_string()));
    kv.insert("general.type", Value::String("adapter".to_string()));
    kv.insert("adapter.lora.alpha", Value::F32(16.0));

    let tensors = vec![
        payload("blk.0.attn_q.weight.lora_a", TensorKind::F32, vec![16, 8]),
        payload("blk.0.attn_q.weight.lora_b", TensorKind::F32, vec![8, 16]),
    ];
    encode(&path, &kv, &tensors).unwrap();

    let decoded = decode(File::open(&path).unwrap(), -1).unwrap();
    assert_eq!(decoded.kv.string_or("general.type", "model"), "adapter");
    // adapter.* keys never pick up the architecture prefix.
    assert_eq!(decoded.kv.f32_or("adapter.lora.alpha", 0.0), 16.0);
}

#[test]
fn test_truncated_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.gguf");

    let tensors = vec![payload("blk.0.w.weight", TensorKind::F32, vec![1024])];
    encode(&path, &model_kv(), &tensors).unwrap();

    // Chop off most of the data region.
    let data = std::fs::read(&path).unwrap();
    let short = &data[..data.len() - 2048];
    assert!(decode(Cursor::new(short.to_vec()), -1).is_err());
}

#[test]
fn test_array_cap_large_token_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.gguf");

    let mut kv = model_kv();
    let tokens: Vec<Value> = (0..10_000)
        .map(|i| Value::String(format!("token{i}")))
        .collect();
    kv.insert(
        "tokenizer.ggml.tokens",
        Value::Array(ArrayValue {
            kind: ValueKind::String,
            len: tokens.len() as u64,
            values: tokens,
        }),
    );
    encode(&path, &kv, &[]).unwrap();

    // Layout-only consumers cap the array and still see the count.
    let decoded = decode(File::open(&path).unwrap(), 512).unwrap();
    let arr = decoded.kv.array("tokenizer.ggml.tokens").unwrap();
    assert_eq!(arr.len, 10_000);
    assert!(arr.values.is_empty());
}
