//! Typed metadata map.
//!
//! GGUF metadata is a flat map from dotted keys to tagged values. Lookups
//! auto-prefix bare keys with the declared architecture so callers can ask
//! for `attention.head_count` regardless of model family.

use std::collections::BTreeMap;

use super::GgufError;

/// On-disk value type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ValueKind {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    U64 = 10,
    I64 = 11,
    F64 = 12,
}

impl ValueKind {
    pub fn from_tag(tag: u32) -> Result<Self, GgufError> {
        use ValueKind::*;
        Ok(match tag {
            0 => U8,
            1 => I8,
            2 => U16,
            3 => I16,
            4 => U32,
            5 => I32,
            6 => F32,
            7 => Bool,
            8 => String,
            9 => Array,
            10 => U64,
            11 => I64,
            12 => F64,
            other => return Err(GgufError::UnknownValueType(other)),
        })
    }
}

/// A tagged metadata value: a scalar, a string, or an array of either.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    U64(u64),
    I64(i64),
    F64(f64),
    Array(ArrayValue),
}

/// An array value. When the decoder's array cap is exceeded, `len` retains
/// the on-disk element count while `values` holds nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub kind: ValueKind,
    pub len: u64,
    pub values: Vec<Value>,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::U8(_) => ValueKind::U8,
            Value::I8(_) => ValueKind::I8,
            Value::U16(_) => ValueKind::U16,
            Value::I16(_) => ValueKind::I16,
            Value::U32(_) => ValueKind::U32,
            Value::I32(_) => ValueKind::I32,
            Value::F32(_) => ValueKind::F32,
            Value::Bool(_) => ValueKind::Bool,
            Value::String(_) => ValueKind::String,
            Value::U64(_) => ValueKind::U64,
            Value::I64(_) => ValueKind::I64,
            Value::F64(_) => ValueKind::F64,
            Value::Array(_) => ValueKind::Array,
        }
    }

    /// Widen any integer scalar to u64. Files are inconsistent about the
    /// width they store counts with, so numeric getters coerce.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U8(v) => Some(v as u64),
            Value::I8(v) if v >= 0 => Some(v as u64),
            Value::U16(v) => Some(v as u64),
            Value::I16(v) if v >= 0 => Some(v as u64),
            Value::U32(v) => Some(v as u64),
            Value::I32(v) if v >= 0 => Some(v as u64),
            Value::U64(v) => Some(v),
            Value::I64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            other => other.as_u64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

/// The metadata map for one container. Keys are stored fully qualified;
/// iteration order is lexicographic, which is also the encoder's order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvMap {
    entries: BTreeMap<String, Value>,
}

impl KvMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The declared architecture, `"unknown"` when absent.
    pub fn architecture(&self) -> &str {
        self.entries
            .get("general.architecture")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    /// Tensor-data alignment, defaulting to 32.
    pub fn alignment(&self) -> u64 {
        self.u64_or("general.alignment", super::types::DEFAULT_ALIGNMENT as u64)
    }

    /// Qualify a bare key with the architecture. `general.`, `tokenizer.`
    /// and `adapter.` keys, and keys already carrying the architecture
    /// prefix, pass through untouched.
    pub fn qualify(&self, key: &str) -> String {
        if Self::has_known_prefix(key, self.architecture()) {
            key.to_string()
        } else {
            format!("{}.{}", self.architecture(), key)
        }
    }

    fn has_known_prefix(key: &str, arch: &str) -> bool {
        key.starts_with("general.")
            || key.starts_with("tokenizer.")
            || key.starts_with("adapter.")
            || key
                .strip_prefix(arch)
                .is_some_and(|rest| rest.starts_with('.'))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Insert a key, auto-prefixing it with the architecture when it lacks
    /// a recognized prefix. The encoder applies this to every caller key.
    pub fn insert_qualified(&mut self, key: &str, value: Value) {
        let key = self.qualify(key);
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .get(key)
            .or_else(|| self.entries.get(&self.qualify(key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    // Typed getters with defaults. All integer widths coerce.

    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    pub fn u32_or(&self, key: &str, default: u32) -> u32 {
        self.u64_or(key, default as u64) as u32
    }

    pub fn f32_or(&self, key: &str, default: f32) -> f32 {
        self.get(key)
            .and_then(Value::as_f64)
            .map(|v| v as f32)
            .unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn string_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    pub fn array(&self, key: &str) -> Option<&ArrayValue> {
        self.get(key).and_then(Value::as_array)
    }

    /// An array of integers widened to u64, e.g. per-layer head counts.
    pub fn u64s(&self, key: &str) -> Option<Vec<u64>> {
        let arr = self.array(key)?;
        arr.values.iter().map(Value::as_u64).collect()
    }

    /// An array of strings, e.g. the token table.
    pub fn strings(&self, key: &str) -> Option<Vec<String>> {
        let arr = self.array(key)?;
        arr.values
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    pub fn f32s(&self, key: &str) -> Option<Vec<f32>> {
        let arr = self.array(key)?;
        arr.values
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llama_kv() -> KvMap {
        let mut kv = KvMap::new();
        kv.insert("general.architecture", Value::String("llama".to_string()));
        kv.insert("llama.attention.head_count", Value::U32(32));
        kv.insert("tokenizer.ggml.model", Value::String("gpt2".to_string()));
        kv
    }

    #[test]
    fn test_auto_prefix_lookup() {
        let kv = llama_kv();
        assert_eq!(kv.u64_or("attention.head_count", 0), 32);
        assert_eq!(kv.u64_or("llama.attention.head_count", 0), 32);
        assert_eq!(kv.string_or("tokenizer.ggml.model", ""), "gpt2");
    }

    #[test]
    fn test_general_and_adapter_keys_not_prefixed() {
        let kv = llama_kv();
        assert_eq!(kv.qualify("general.alignment"), "general.alignment");
        assert_eq!(kv.qualify("adapter.lora.alpha"), "adapter.lora.alpha");
        assert_eq!(kv.qualify("rope.freq_base"), "llama.rope.freq_base");
    }

    #[test]
    fn test_alignment_default() {
        let kv = llama_kv();
        assert_eq!(kv.alignment(), 32);

        let mut kv = llama_kv();
        kv.insert("general.alignment", Value::U32(64));
        assert_eq!(kv.alignment(), 64);
    }

    #[test]
    fn test_integer_width_coercion() {
        let mut kv = KvMap::new();
        kv.insert("general.alignment", Value::U64(16));
        assert_eq!(kv.alignment(), 16);
        kv.insert("general.alignment", Value::I32(8));
        assert_eq!(kv.alignment(), 8);
    }

    #[test]
    fn test_u64s_array() {
        let mut kv = llama_kv();
        kv.insert(
            "llama.attention.head_count_kv",
            Value::Array(ArrayValue {
                kind: ValueKind::U32,
                len: 3,
                values: vec![Value::U32(8), Value::U32(8), Value::U32(4)],
            }),
        );
        assert_eq!(kv.u64s("attention.head_count_kv"), Some(vec![8, 8, 4]));
    }
}
