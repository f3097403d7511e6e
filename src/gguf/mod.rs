//! GGUF container codec.
//!
//! GGUF is the self-describing tensor container used for model and adapter
//! files: a small header, a typed key/value metadata section, per-tensor
//! metadata, then an aligned tensor-data region.
//!
//! - [`types`]: tensor kinds, shapes, and byte-size math
//! - [`kv`]: the typed metadata map with architecture-aware key lookup
//! - [`decode`]: streaming parser for versions 1-3, little- or big-endian
//! - [`encode`]: version-3 writer with parallel tensor-data output

pub mod decode;
pub mod encode;
pub mod kv;
pub mod types;

pub use decode::{decode, Decoded};
pub use encode::{encode, TensorPayload};
pub use kv::{ArrayValue, KvMap, Value, ValueKind};
pub use types::{pad, Tensor, TensorKind};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GgufError {
    #[error("unsupported format: bad magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown metadata value type {0}")]
    UnknownValueType(u32),

    #[error("unknown tensor type {0}")]
    UnknownTensorType(u32),

    #[error("tensor {name}: invalid dimension count {dims}")]
    InvalidDimensions { name: String, dims: u32 },

    #[error("tensor {name}: offset {got} does not match expected {want}")]
    OffsetMismatch { name: String, got: u64, want: u64 },

    #[error("tensor {name}: data region of {size} bytes exceeds file length {len}")]
    TruncatedData { name: String, size: u64, len: u64 },

    #[error("tensor {name}: payload is {got} bytes, computed size is {want}")]
    SizeMismatch { name: String, got: u64, want: u64 },

    #[error("invalid string: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("array element type {0:?} is not storable")]
    UnsupportedArrayElement(ValueKind),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
